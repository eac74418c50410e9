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

//! The single worker thread. It dequeues the smallest pending upload, runs
//! the image pipeline, answers the client on the socket it inherited from
//! the handler, and cleans up. One image at a time: processing is CPU-bound
//! and the priority order is only meaningful if nothing runs in parallel.
//!
//! A failed image never stops the loop. The worker logs, answers 500,
//! removes the temp file and moves on. Items drained after a shutdown are
//! answered 503 instead of being processed.

use std::sync::atomic::Ordering;
use serde::Serialize;
use crate::{
    handler::remove_temp_file,
    http,
    imgproc,
    log_error, log_info,
    logger::log_client_activity,
    queue::{Dequeued, UploadDescriptor},
    state::State,
};

#[derive(Serialize)]
struct SuccessPayload<'a> {
    status: &'static str,
    message: &'static str,
    filename: &'a str,
    size: u64,
    processed_path: String,
    predominant_color: &'static str,
    processing_time: f64,
}

/// Worker main loop. Returns once the queue reports shutdown and every
/// pending item has been answered.
pub fn run(state: &State) {
    log_info!("File processor thread started");

    loop {
        let descriptor = match state.queue.dequeue() {
            Dequeued::Item(descriptor) => descriptor,
            Dequeued::Shutdown => break,
        };

        if !state.queue.is_active() {
            // Drained during shutdown: the client gets a clean 503 rather
            // than waiting on a worker that is about to exit.
            reject_pending(descriptor);
            continue;
        }

        state.processor_busy.store(true, Ordering::SeqCst);
        process_one(state, descriptor);
        state.processor_busy.store(false, Ordering::SeqCst);
    }

    log_info!("File processor thread terminating");
}

fn process_one(state: &State, mut descriptor: UploadDescriptor) {
    let config = state.config();

    log_info!("Processing {} ({} bytes) from {} - {} left in queue",
              descriptor.original_filename, descriptor.file_size,
              descriptor.client_ip, state.queue.len());

    {
        let mut stats = state.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.total_uploads += 1;
        stats.total_bytes_processed += descriptor.file_size;
    }

    match imgproc::process_image(&descriptor.temp_path, &descriptor.original_filename, &config) {
        Ok(info) => {
            let payload = SuccessPayload {
                status: "success",
                message: "File processed successfully",
                filename: &descriptor.original_filename,
                size: descriptor.file_size,
                processed_path: info.equalized_path.display().to_string(),
                predominant_color: info.predominant_color.name(),
                processing_time: descriptor.received_at.elapsed().as_secs_f64(),
            };

            state.stats.lock().unwrap_or_else(|e| e.into_inner()).successful_uploads += 1;
            let _ = http::write_json(&mut descriptor.socket, 200, &payload);
            log_client_activity(&descriptor.client_ip, &descriptor.original_filename,
                                "process", "success");
            log_info!("Processed {}: {}x{} {}ch, predominant {}",
                      descriptor.original_filename, info.width, info.height,
                      info.channels, info.predominant_color.name());
        }
        Err(error) => {
            log_error!("Failed to process {}: {:#}", descriptor.original_filename, error);
            state.stats.lock().unwrap_or_else(|e| e.into_inner()).failed_uploads += 1;
            let _ = http::write_error(&mut descriptor.socket, 500, "Failed to process image");
            log_client_activity(&descriptor.client_ip, &descriptor.original_filename,
                                "process", "failed");
        }
    }

    remove_temp_file(&descriptor.temp_path);
    // Dropping the descriptor closes the socket: the one and only response
    // has been written above.
}

fn reject_pending(mut descriptor: UploadDescriptor) {
    log_info!("Shutdown: rejecting queued upload {} from {}",
              descriptor.original_filename, descriptor.client_ip);
    let _ = http::write_error(&mut descriptor.socket, 503, "Server shutting down");
    log_client_activity(&descriptor.client_ip, &descriptor.original_filename,
                        "process", "rejected");
    remove_temp_file(&descriptor.temp_path);
}
