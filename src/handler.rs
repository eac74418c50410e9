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

//! Per-connection request handling. GET endpoints are answered on the spot.
//! A POST goes through frame, multipart parse, format and decodability
//! checks, temp-file persist, and finally the enqueue that hands the socket
//! to the worker. Every failure before that enqueue is answered here and the
//! socket closed here; after a successful enqueue this module never touches
//! the socket again.

use std::{
    fs,
    io::Write,
    net::TcpStream,
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};
use serde::Serialize;
use crate::{
    http::{self, Request, RequestError},
    imgproc,
    log_debug, log_info, log_warning,
    logger::log_client_activity,
    multipart::{self, MultipartError},
    queue::{EnqueueError, UploadDescriptor},
    state::{State, UploadStats},
    util::file_extension,
};

/// Entry point of a handler thread. Owns the socket unless the request makes
/// it into the queue.
pub fn handle_connection(state: &State, mut stream: TcpStream, client_ip: String) {
    let request = match http::read_request(&mut stream) {
        Ok(request) => request,
        Err(error) => {
            log_warning!("Dropping connection from {}: {}", client_ip, error);
            let _ = match error {
                RequestError::Malformed(msg) => http::write_error(&mut stream, 400, &msg),
                RequestError::TooLarge => http::write_error(&mut stream, 413, "File too large"),
                // Nobody is listening on a dead or silent connection.
                RequestError::Timeout | RequestError::ConnectionClosed => Ok(()),
            };
            return;
        }
    };

    log_info!("Request: {} {} from {}", request.method, request.target, client_ip);

    match (request.method.as_str(), request.path()) {
        ("GET", "/") | ("GET", "/status") => {
            let _ = write_status(&mut stream, state);
        }
        ("GET", "/queue") => {
            let _ = write_queue_state(&mut stream, state);
        }
        ("GET", "/upload") => {
            let _ = write_upload_help(&mut stream, state);
        }
        ("POST", "/") | ("POST", "/upload") => {
            handle_upload(state, stream, &request, &client_ip);
        }
        ("GET", _) | ("POST", _) => {
            let _ = http::write_error(&mut stream, 404, "Not found");
        }
        _ => {
            let _ = http::write_error(&mut stream, 405, "Method not allowed");
        }
    }
}

/// Upload metadata extracted and validated, payload still borrowed from the
/// request body.
struct PreparedUpload<'a> {
    filename: String,
    content_type: String,
    payload: &'a [u8],
}

fn handle_upload(state: &State, mut stream: TcpStream, request: &Request, client_ip: &str) {
    let prepared = match validate_upload(state, request) {
        Ok(prepared) => prepared,
        Err((code, message)) => {
            log_warning!("Rejecting upload from {}: {}", client_ip, message);
            log_client_activity(client_ip, "unknown", "upload", "rejected");
            let _ = http::write_error(&mut stream, code, &message);
            return;
        }
    };

    let temp_path = match persist_payload(state, &prepared) {
        Ok(path) => path,
        Err(error) => {
            log_warning!("Failed to persist upload from {}: {:#}", client_ip, error);
            log_client_activity(client_ip, &prepared.filename, "upload", "failed");
            let _ = http::write_error(&mut stream, 500, "Failed to create temporary file");
            return;
        }
    };

    let file_size = prepared.payload.len() as u64;
    let descriptor = UploadDescriptor::new(
        prepared.filename.clone(),
        prepared.content_type.clone(),
        file_size,
        temp_path,
        client_ip.to_string(),
        stream,
    );

    // Ownership of the socket moves into the queue here. On success the
    // worker responds; on rejection the descriptor comes back and the
    // handler answers with it.
    match state.queue.enqueue(descriptor) {
        Ok(seq) => {
            log_client_activity(client_ip, &prepared.filename, "upload", "queued");
            log_info!("Upload queued: {} ({} bytes) from {} - seq {} - queue {}/{}",
                      prepared.filename, file_size, client_ip, seq,
                      state.queue.len(), state.queue.capacity());
        }
        Err(error) => {
            let (mut descriptor, reason) = match error {
                EnqueueError::Full(d) => (d, "queue full"),
                EnqueueError::Inactive(d) => (d, "queue shut down"),
            };
            log_warning!("Upload from {} rejected: {}", client_ip, reason);
            log_client_activity(client_ip, &descriptor.original_filename, "upload", "rejected");
            remove_temp_file(&descriptor.temp_path);
            let _ = http::write_error(&mut descriptor.socket, 503, "Server busy");
        }
    }
}

fn validate_upload<'a>(state: &State, request: &'a Request)
    -> Result<PreparedUpload<'a>, (u16, String)>
{
    let config = state.config();

    let content_type = request.header("Content-Type")
        .ok_or((400, "Missing Content-Type header".to_string()))?;
    if !content_type.contains("multipart/form-data") {
        return Err((400, "Expected multipart/form-data".to_string()));
    }
    let boundary = multipart::extract_boundary(content_type)
        .ok_or((400, "Invalid boundary in Content-Type".to_string()))?;

    let part = multipart::parse(&request.body, &boundary, config.max_image_bytes())
        .map_err(|error| match error {
            MultipartError::TooLarge { .. } => (413, "File too large".to_string()),
            MultipartError::EmptyPayload => (400, "Empty file payload".to_string()),
            MultipartError::NoBoundary | MultipartError::NoContentDisposition =>
                (400, format!("Failed to parse multipart data: {}", error)),
        })?;

    if !is_supported_format(&part.filename, &config.supported_formats) {
        return Err((400, "Unsupported file format".to_string()));
    }

    // Decode from memory before anything touches the disk. The decoded
    // pixels are thrown away; the worker decodes again from the temp file.
    if let Err(error) = imgproc::decode(part.payload) {
        log_debug!("Image validation failed: {:#}", error);
        return Err((400, "Invalid image file".to_string()));
    }

    Ok(PreparedUpload {
        filename: part.filename,
        content_type: part.content_type,
        payload: part.payload,
    })
}

fn persist_payload(state: &State, prepared: &PreparedUpload) -> anyhow::Result<PathBuf> {
    let config = state.config();
    let temp_path = config.temp_path.join(temp_filename(state, &prepared.filename));

    fs::write(&temp_path, prepared.payload)
        .map_err(|e| anyhow!("Failed to write {}: {}", temp_path.display(), e))?;

    log_debug!("Persisted upload to {}", temp_path.display());
    Ok(temp_path)
}

pub fn remove_temp_file(path: &std::path::Path) {
    match fs::remove_file(path) {
        Ok(()) => log_debug!("Removed temp file {}", path.display()),
        Err(e) => log_warning!("Could not remove temp file {}: {}", path.display(), e),
    }
}

/// `temp_<epoch>_<pid>_<counter><ext>`; the counter keeps names unique when
/// several uploads land within the same second.
fn temp_filename(state: &State, original_filename: &str) -> String {
    let epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let pid = std::process::id();
    let counter = state.next_temp_id();
    let ext = file_extension(original_filename).unwrap_or(".tmp");
    format!("temp_{}_{}_{}{}", epoch, pid, counter, ext)
}

pub fn is_supported_format(filename: &str, formats: &[String]) -> bool {
    match file_extension(filename) {
        Some(ext) => {
            let ext = ext[1..].to_ascii_lowercase();
            formats.iter().any(|supported| *supported == ext)
        }
        None => false,
    }
}

#[derive(Serialize)]
struct StatusPayload {
    status: &'static str,
    uptime_seconds: u64,
    port: u16,
    active_connections: usize,
    max_connections: usize,
    queue_size: usize,
    queue_capacity: usize,
    stats: UploadStats,
}

fn write_status<W: Write>(w: &mut W, state: &State) -> anyhow::Result<()> {
    let config = state.config();
    http::write_json(w, 200, &StatusPayload {
        status: state.status.get().name(),
        uptime_seconds: state.uptime().as_secs(),
        port: config.port,
        active_connections: state.clients.count(),
        max_connections: config.max_connections,
        queue_size: state.queue.len(),
        queue_capacity: state.queue.capacity(),
        stats: state.stats_snapshot(),
    })
}

#[derive(Serialize)]
struct QueuePayload {
    queue_size: usize,
    queue_capacity: usize,
    active: bool,
    processor: &'static str,
}

fn write_queue_state<W: Write>(w: &mut W, state: &State) -> anyhow::Result<()> {
    let busy = state.processor_busy.load(std::sync::atomic::Ordering::SeqCst);
    http::write_json(w, 200, &QueuePayload {
        queue_size: state.queue.len(),
        queue_capacity: state.queue.capacity(),
        active: state.queue.is_active(),
        processor: if busy { "busy" } else { "idle" },
    })
}

#[derive(Serialize)]
struct UploadHelpPayload<'a> {
    message: &'static str,
    usage: String,
    field: &'static str,
    supported_formats: &'a [String],
    max_image_size_mb: usize,
}

fn write_upload_help<W: Write>(w: &mut W, state: &State) -> anyhow::Result<()> {
    let config = state.config();
    http::write_json(w, 200, &UploadHelpPayload {
        message: "POST an image as multipart/form-data to / or /upload",
        usage: format!("curl -F \"image=@photo.jpg\" http://localhost:{}/", config.port),
        field: "image",
        supported_formats: &config.supported_formats,
        max_image_size_mb: config.max_image_size_mb,
    })
}
