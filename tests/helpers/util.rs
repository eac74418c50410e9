//  Copyright 2020 Two Sigma Investments, LP.
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

use std::{
    fs,
    io::{Read, Write},
    net::{SocketAddr, TcpStream},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use image::{codecs::png::PngEncoder, ExtendedColorType, ImageEncoder};
use serde_json::Value;
use image_server::{
    config::Config,
    logger,
    server,
    state::State,
};

pub const BOUNDARY: &str = "----imageservertestboundary";

/// An in-process server on an ephemeral port with its own scratch
/// directories, torn down (threads joined, directories removed) on drop.
pub struct TestServer {
    pub state: Arc<State>,
    pub addr: SocketAddr,
    pub base_dir: PathBuf,
    handles: Option<server::ServerHandles>,
}

impl TestServer {
    pub fn start(tag: &str, tweak: impl FnOnce(&mut Config)) -> TestServer {
        // Keep the suite quiet; failures surface through asserts, not logs.
        logger::init(None, logger::Level::Error, true);

        let base_dir = std::env::temp_dir()
            .join(format!("imageserver-e2e-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&base_dir);

        let mut config = Config::default();
        config.image_base_path = base_dir.clone();
        config.processed_path = base_dir.join("processed");
        config.red_path = base_dir.join("red");
        config.green_path = base_dir.join("green");
        config.blue_path = base_dir.join("blue");
        config.temp_path = base_dir.join("temp");
        tweak(&mut config);

        let state = State::new(config);
        server::create_directories(&state.config()).expect("Failed to create test directories");

        let listener = server::bind_listener(0, 16).expect("Failed to bind test listener");
        let addr = listener.local_addr().unwrap();
        let handles = server::start(&state, listener).expect("Failed to start test server");

        TestServer { state, addr, base_dir, handles: Some(handles) }
    }

    pub fn config(&self) -> Arc<Config> {
        self.state.config()
    }

    pub fn temp_dir_entries(&self) -> Vec<PathBuf> {
        fs::read_dir(&self.config().temp_path)
            .map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.path()).collect())
            .unwrap_or_default()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(handles) = self.handles.take() {
            server::stop(&self.state, handles);
        }
        let _ = fs::remove_dir_all(&self.base_dir);
    }
}

/// Sends raw request bytes and reads the full response. The server closes
/// after one response, so read-to-end terminates. The timeout is generous:
/// an upload response only arrives after all smaller queued files finished.
pub fn raw_request(addr: SocketAddr, request: &[u8]) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).expect("connect failed");
    stream.set_read_timeout(Some(Duration::from_secs(60))).unwrap();
    stream.write_all(request).expect("request write failed");

    let mut response = Vec::new();
    stream.read_to_end(&mut response).expect("response read failed");
    let text = String::from_utf8_lossy(&response);

    let status: u16 = text.split_whitespace().nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or_else(|| panic!("unparsable response: {:?}", text));
    let body = match text.find("\r\n\r\n") {
        Some(pos) => text[pos + 4..].to_string(),
        None => String::new(),
    };
    (status, body)
}

pub fn get(addr: SocketAddr, path: &str) -> (u16, Value) {
    let request = format!("GET {} HTTP/1.1\r\nHost: test\r\n\r\n", path);
    let (status, body) = raw_request(addr, request.as_bytes());
    let json = serde_json::from_str(&body).unwrap_or(Value::Null);
    (status, json)
}

pub fn multipart_body(filename: &str, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(payload.len() + 256);
    body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(
        format!("Content-Disposition: form-data; name=\"image\"; filename=\"{}\"\r\n", filename)
            .as_bytes());
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(payload);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
    body
}

/// Uploads a file and waits for the deferred response.
pub fn post_upload(addr: SocketAddr, path: &str, filename: &str, payload: &[u8]) -> (u16, Value) {
    let body = multipart_body(filename, payload);
    let mut request = format!(
        "POST {} HTTP/1.1\r\n\
         Host: test\r\n\
         Content-Type: multipart/form-data; boundary={}\r\n\
         Content-Length: {}\r\n\
         \r\n",
        path, BOUNDARY, body.len()).into_bytes();
    request.extend_from_slice(&body);

    let (status, body) = raw_request(addr, &request);
    let json = serde_json::from_str(&body).unwrap_or(Value::Null);
    (status, json)
}

pub fn png_rgb(width: u32, height: u32, pixel: [u8; 3]) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb(pixel));
    let mut png = Vec::new();
    PngEncoder::new(&mut png)
        .write_image(img.as_raw(), width, height, ExtendedColorType::Rgb8)
        .expect("PNG encode failed");
    png
}

/// Single-row grayscale image from explicit pixel values.
pub fn png_gray_row(values: &[u8]) -> Vec<u8> {
    let mut png = Vec::new();
    PngEncoder::new(&mut png)
        .write_image(values, values.len() as u32, 1, ExtendedColorType::L8)
        .expect("PNG encode failed");
    png
}

/// Deterministic noise image; incompressible, so the encoded size scales
/// with the dimensions. Used to mint payloads of distinct sizes.
pub fn png_noise(width: u32, height: u32, seed: u64) -> Vec<u8> {
    let mut lcg = seed.wrapping_mul(2).wrapping_add(1);
    let mut next = move || {
        lcg = lcg.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (lcg >> 33) as u8
    };
    let data: Vec<u8> = (0..(width as usize * height as usize * 3)).map(|_| next()).collect();

    let mut png = Vec::new();
    PngEncoder::new(&mut png)
        .write_image(&data, width, height, ExtendedColorType::Rgb8)
        .expect("PNG encode failed");
    png
}
