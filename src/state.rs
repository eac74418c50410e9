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

//! Process-wide server state, built once at startup and shared by reference
//! with every thread. Nothing in here is a global: the acceptor, handlers,
//! worker and supervisor all receive the same `Arc<State>`.

use std::{
    net::{Shutdown, TcpStream},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use serde::Serialize;
use crate::{
    config::Config,
    log_info,
    queue::ProcessQueue,
};

/// Fixed size of the connection table. The configurable connection limit can
/// sit below this but never above.
pub const MAX_CLIENTS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerStatus {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl ServerStatus {
    pub fn name(self) -> &'static str {
        match self {
            ServerStatus::Stopped => "stopped",
            ServerStatus::Starting => "starting",
            ServerStatus::Running => "running",
            ServerStatus::Stopping => "stopping",
        }
    }
}

/// Atomic cell holding a `ServerStatus`. Threads poll this instead of raw
/// booleans so state transitions are single writes.
pub struct StatusCell(AtomicU8);

impl StatusCell {
    fn new(status: ServerStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub fn get(&self) -> ServerStatus {
        match self.0.load(Ordering::SeqCst) {
            1 => ServerStatus::Starting,
            2 => ServerStatus::Running,
            3 => ServerStatus::Stopping,
            _ => ServerStatus::Stopped,
        }
    }

    pub fn set(&self, status: ServerStatus) {
        self.0.store(status as u8, Ordering::SeqCst);
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct UploadStats {
    pub total_uploads: u64,
    pub successful_uploads: u64,
    pub failed_uploads: u64,
    pub total_bytes_processed: u64,
}

/// One registered connection. The stream here is a `try_clone` of the
/// handler's socket, kept only so the supervisor can force-close peers that
/// sit in the framing phase for too long.
struct ClientEntry {
    stream: TcpStream,
    ip: String,
    connected_at: Instant,
}

/// Fixed-slot connection table guarded by one mutex. Registration and the
/// concurrent-connection count are a single atomic step, which is what makes
/// the 503 admission decision race-free.
pub struct ClientTable {
    slots: Mutex<Vec<Option<ClientEntry>>>,
}

impl ClientTable {
    fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_CLIENTS);
        slots.resize_with(MAX_CLIENTS, || None);
        Self { slots: Mutex::new(slots) }
    }

    /// Registers a connection if the count is below `limit`. Returns the
    /// slot index to release later, or None when the server is full.
    pub fn register(&self, stream: &TcpStream, ip: String, limit: usize) -> Option<usize> {
        let reaper_handle = stream.try_clone().ok()?;
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());

        let occupied = slots.iter().filter(|slot| slot.is_some()).count();
        if occupied >= limit.min(MAX_CLIENTS) {
            return None;
        }

        let index = slots.iter().position(|slot| slot.is_none())?;
        slots[index] = Some(ClientEntry {
            stream: reaper_handle,
            ip,
            connected_at: Instant::now(),
        });
        Some(index)
    }

    pub fn release(&self, index: usize) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots[index] = None;
    }

    pub fn count(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Force-closes connections older than `max_age`. The handler thread
    /// owning the socket wakes up with a read error and cleans up after
    /// itself; slots are not cleared here.
    pub fn reap_older_than(&self, max_age: Duration) -> usize {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let mut reaped = 0;

        for entry in slots.iter().flatten() {
            if entry.connected_at.elapsed() > max_age {
                log_info!("Forcing idle connection from {} closed", entry.ip);
                let _ = entry.stream.shutdown(Shutdown::Both);
                reaped += 1;
            }
        }
        reaped
    }

    /// Shuts down every registered connection. Used on server teardown.
    pub fn shutdown_all(&self) {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        for entry in slots.iter().flatten() {
            let _ = entry.stream.shutdown(Shutdown::Both);
        }
    }
}

pub struct State {
    config: Mutex<Arc<Config>>,
    pub queue: ProcessQueue,
    pub stats: Mutex<UploadStats>,
    pub clients: ClientTable,
    pub status: StatusCell,
    pub started_at: Instant,
    /// True while the worker is busy on an image; surfaced by GET /queue.
    pub processor_busy: AtomicBool,
    /// Feeds the unique temp-file names.
    pub temp_counter: AtomicU64,
}

impl State {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config: Mutex::new(Arc::new(config)),
            queue: ProcessQueue::new(),
            stats: Mutex::new(UploadStats::default()),
            clients: ClientTable::new(),
            status: StatusCell::new(ServerStatus::Stopped),
            started_at: Instant::now(),
            processor_busy: AtomicBool::new(false),
            temp_counter: AtomicU64::new(0),
        })
    }

    /// Cheap snapshot of the current configuration. Readers hold no lock
    /// beyond the clone of the Arc; a SIGHUP reload swaps the whole value.
    pub fn config(&self) -> Arc<Config> {
        self.config.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_config(&self, config: Config) {
        *self.config.lock().unwrap_or_else(|e| e.into_inner()) = Arc::new(config);
    }

    pub fn stats_snapshot(&self) -> UploadStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn next_temp_id(&self) -> u64 {
        self.temp_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}
