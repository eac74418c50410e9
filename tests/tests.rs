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

// End-to-end tests over real sockets: each test boots an in-process server
// on an ephemeral port with scratch directories, drives it with a minimal
// HTTP client, and inspects both the responses and the on-disk results.

mod helpers;

use std::{
    io::Write,
    net::TcpStream,
    thread,
    time::{Duration, Instant},
};
use crate::helpers::util::*;

#[test]
fn test_status_endpoint() {
    let server = TestServer::start("status", |_| {});

    for path in ["/", "/status"] {
        let (status, json) = get(server.addr, path);
        assert_eq!(status, 200);
        assert_eq!(json["status"], "running");
        assert_eq!(json["queue_size"], 0);
        assert_eq!(json["queue_capacity"], 100);
        assert_eq!(json["max_connections"], 50);
        assert_eq!(json["stats"]["total_uploads"], 0);
    }
}

#[test]
fn test_queue_endpoint() {
    let server = TestServer::start("queue", |_| {});

    let (status, json) = get(server.addr, "/queue");
    assert_eq!(status, 200);
    assert_eq!(json["queue_size"], 0);
    assert_eq!(json["active"], true);
    assert_eq!(json["processor"], "idle");
}

#[test]
fn test_upload_help_endpoint() {
    let server = TestServer::start("help", |_| {});

    let (status, json) = get(server.addr, "/upload");
    assert_eq!(status, 200);
    assert_eq!(json["field"], "image");
    assert_eq!(json["max_image_size_mb"], 50);
}

#[test]
fn test_unknown_path_and_method() {
    let server = TestServer::start("routes", |_| {});

    let (status, json) = get(server.addr, "/nonexistent");
    assert_eq!(status, 404);
    assert_eq!(json["code"], 404);

    let (status, body) = raw_request(server.addr,
        b"DELETE /upload HTTP/1.1\r\nHost: test\r\n\r\n");
    assert_eq!(status, 405);
    assert!(body.contains("405"));
}

#[test]
fn test_post_without_content_length() {
    let server = TestServer::start("nolength", |_| {});

    let (status, body) = raw_request(server.addr,
        b"POST /upload HTTP/1.1\r\nHost: test\r\n\r\n");
    assert_eq!(status, 400);
    assert!(body.contains("Content-Length"));
}

#[test]
fn test_red_classification() {
    let server = TestServer::start("red", |_| {});
    let config = server.config();

    let (status, json) = post_upload(server.addr, "/upload", "brick.png",
                                     &png_rgb(2, 2, [200, 10, 10]));
    assert_eq!(status, 200);
    assert_eq!(json["status"], "success");
    assert_eq!(json["filename"], "brick.png");
    assert_eq!(json["predominant_color"], "red");

    let processed = config.processed_path.join("brick_equalized.png");
    assert_eq!(json["processed_path"], processed.display().to_string());
    assert!(processed.exists());
    assert!(config.red_path.join("brick_red.png").exists());

    // The temp file is gone once the response has been written.
    assert!(server.temp_dir_entries().is_empty());
}

#[test]
fn test_undefined_classification() {
    let server = TestServer::start("undef", |_| {});
    let config = server.config();

    let (status, json) = post_upload(server.addr, "/", "flat.png",
                                     &png_rgb(2, 2, [100, 100, 100]));
    assert_eq!(status, 200);
    assert_eq!(json["predominant_color"], "undefined");
    assert!(config.processed_path.join("flat_equalized.png").exists());

    // No classified copy in any color directory.
    for dir in [&config.red_path, &config.green_path, &config.blue_path] {
        assert_eq!(std::fs::read_dir(dir).unwrap().count(), 0);
    }
}

#[test]
fn test_grayscale_is_undefined() {
    let server = TestServer::start("gray", |_| {});

    let (status, json) = post_upload(server.addr, "/upload", "gray.png",
                                     &png_gray_row(&[0, 64, 128, 255]));
    assert_eq!(status, 200);
    assert_eq!(json["predominant_color"], "undefined");
}

#[test]
fn test_gradient_equalization() {
    let server = TestServer::start("gradient", |_| {});
    let config = server.config();

    let values = [0u8, 32, 64, 96, 128, 160, 192, 224];
    let (status, _) = post_upload(server.addr, "/upload", "gradient.png",
                                  &png_gray_row(&values));
    assert_eq!(status, 200);

    let out = std::fs::read(config.processed_path.join("gradient_equalized.png")).unwrap();
    let img = image::load_from_memory(&out).unwrap().into_luma8();
    assert_eq!((img.width(), img.height()), (8, 1));
    assert_eq!(img.into_raw(), vec![31, 63, 95, 127, 159, 191, 223, 255]);
}

#[test]
fn test_oversize_upload_rejected() {
    let server = TestServer::start("oversize", |config| {
        config.max_image_size_mb = 1;
    });

    // One byte past the configured limit. It never reaches image decoding.
    let payload = vec![0u8; 1024 * 1024 + 1];
    let (status, json) = post_upload(server.addr, "/upload", "big.jpg", &payload);
    assert_eq!(status, 413);
    assert_eq!(json["error"], "File too large");
    assert!(server.temp_dir_entries().is_empty());
}

#[test]
fn test_unsupported_extension_rejected() {
    let server = TestServer::start("badext", |_| {});

    let (status, json) = post_upload(server.addr, "/upload", "image.bmp",
                                     &png_rgb(2, 2, [1, 2, 3]));
    assert_eq!(status, 400);
    assert_eq!(json["error"], "Unsupported file format");
}

#[test]
fn test_undecodable_payload_rejected() {
    let server = TestServer::start("garbage", |_| {});

    let (status, json) = post_upload(server.addr, "/upload", "fake.jpg",
                                     b"this is not an image at all");
    assert_eq!(status, 400);
    assert_eq!(json["error"], "Invalid image file");
    assert!(server.temp_dir_entries().is_empty());
}

#[test]
fn test_wrong_content_type_rejected() {
    let server = TestServer::start("ctype", |_| {});

    let request = b"POST /upload HTTP/1.1\r\n\
                    Host: test\r\n\
                    Content-Type: application/json\r\n\
                    Content-Length: 2\r\n\
                    \r\n\
                    {}";
    let (status, body) = raw_request(server.addr, request);
    assert_eq!(status, 400);
    assert!(body.contains("multipart/form-data"));
}

#[test]
fn test_smaller_uploads_overtake_larger_ones() {
    let server = TestServer::start("priority", |_| {});

    // Occupy the worker with a big job first so the later uploads pile up
    // in the queue and get reordered by size.
    let hold_payload = png_noise(3500, 3500, 7);
    let hold_addr = server.addr;
    let hold = thread::spawn(move || {
        post_upload(hold_addr, "/upload", "hold.png", &hold_payload)
    });

    // Wait until the worker has actually dequeued the hold job.
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let (_, json) = get(server.addr, "/queue");
        if json["processor"] == "busy" {
            break;
        }
        assert!(Instant::now() < deadline, "worker never went busy");
        thread::sleep(Duration::from_millis(20));
    }

    // Small, large, mid submission order; expected completion is by size.
    let uploads = [
        ("small.png", png_noise(60, 60, 1)),
        ("large.png", png_noise(900, 900, 2)),
        ("mid.png", png_noise(300, 300, 3)),
    ];
    let mut clients = Vec::new();
    for (name, payload) in uploads {
        let addr = server.addr;
        let name = name.to_string();
        clients.push(thread::spawn(move || {
            let (status, _) = post_upload(addr, "/upload", &name, &payload);
            (name, status, Instant::now())
        }));
        thread::sleep(Duration::from_millis(50));
    }

    let (status, _) = hold.join().unwrap();
    assert_eq!(status, 200);

    let mut completions: Vec<(String, u16, Instant)> =
        clients.into_iter().map(|c| c.join().unwrap()).collect();
    for (name, status, _) in &completions {
        assert_eq!(*status, 200, "upload {} failed", name);
    }

    completions.sort_by_key(|(_, _, done_at)| *done_at);
    let order: Vec<&str> = completions.iter().map(|(name, _, _)| name.as_str()).collect();
    assert_eq!(order, vec!["small.png", "mid.png", "large.png"]);
}

#[test]
fn test_connection_limit_admission() {
    let server = TestServer::start("admission", |config| {
        config.max_connections = 2;
    });

    // Two connections parked mid-request hold both slots.
    let mut idle1 = TcpStream::connect(server.addr).unwrap();
    let mut idle2 = TcpStream::connect(server.addr).unwrap();
    idle1.write_all(b"POST /upload HTTP/1.1\r\n").unwrap();
    idle2.write_all(b"POST /upload HTTP/1.1\r\n").unwrap();

    // Give the acceptor time to register both before the third knocks.
    let deadline = Instant::now() + Duration::from_secs(10);
    while server.state.clients.count() < 2 {
        assert!(Instant::now() < deadline, "handlers never registered");
        thread::sleep(Duration::from_millis(10));
    }

    // The third client is turned away immediately, well before any timeout.
    let start = Instant::now();
    let (status, json) = get(server.addr, "/status");
    assert_eq!(status, 503);
    assert_eq!(json["error"], "Server busy");
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_multiple_uploads_accumulate_stats() {
    let server = TestServer::start("stats", |_| {});

    let (status, _) = post_upload(server.addr, "/upload", "one.png",
                                  &png_rgb(4, 4, [10, 200, 10]));
    assert_eq!(status, 200);
    let (status, _) = post_upload(server.addr, "/upload", "two.png",
                                  &png_rgb(4, 4, [10, 10, 200]));
    assert_eq!(status, 200);

    let (_, json) = get(server.addr, "/status");
    assert_eq!(json["stats"]["total_uploads"], 2);
    assert_eq!(json["stats"]["successful_uploads"], 2);
    assert_eq!(json["stats"]["failed_uploads"], 0);

    let config = server.config();
    assert!(config.green_path.join("one_green.png").exists());
    assert!(config.blue_path.join("two_blue.png").exists());
}
