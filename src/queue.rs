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

//! The bounded processing queue between connection handlers and the single
//! worker. Smallest file first; ties broken by arrival order through a
//! monotonic sequence number assigned under the queue lock.
//!
//! The descriptor owns the client socket. Handlers give the socket up by
//! value at `enqueue()`; from then on only the worker may write the response
//! and close it. A rejected enqueue hands the descriptor back inside the
//! error so the handler can still answer the client. The socket is never
//! reachable from two places at once.
//!
//! `std::collections::BinaryHeap` is a max-heap, so the comparison below is
//! reversed to pop the smallest entry first.

use std::{
    collections::BinaryHeap,
    net::TcpStream,
    path::PathBuf,
    sync::{Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

pub const MAX_QUEUE_SIZE: usize = 100;

/// How long a producer may wait on a full queue before the client gets 503.
const ENQUEUE_WAIT: Duration = Duration::from_secs(2);

/// One accepted upload travelling from handler to worker.
pub struct UploadDescriptor {
    pub original_filename: String,
    pub content_type: String,
    /// Byte count of the persisted temp file; doubles as the priority key.
    pub file_size: u64,
    pub temp_path: PathBuf,
    pub client_ip: String,
    /// Owned exclusively; closed by whoever writes the single response.
    pub socket: TcpStream,
    pub received_at: Instant,
    arrival_seq: u64,
}

impl UploadDescriptor {
    pub fn new(original_filename: String, content_type: String, file_size: u64,
               temp_path: PathBuf, client_ip: String, socket: TcpStream) -> Self
    {
        Self {
            original_filename,
            content_type,
            file_size,
            temp_path,
            client_ip,
            socket,
            received_at: Instant::now(),
            arrival_seq: 0, // assigned at enqueue
        }
    }

    pub fn arrival_seq(&self) -> u64 {
        self.arrival_seq
    }

    fn heap_key(&self) -> (u64, u64) {
        (self.file_size, self.arrival_seq)
    }
}

// Reversed comparison: the BinaryHeap pops its maximum, which under this
// ordering is the smallest (file_size, arrival_seq) pair.
impl Ord for UploadDescriptor {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.heap_key().cmp(&self.heap_key())
    }
}

impl PartialOrd for UploadDescriptor {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for UploadDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.heap_key() == other.heap_key()
    }
}

impl Eq for UploadDescriptor {}

/// Why an enqueue did not happen. The descriptor comes back with the reason.
pub enum EnqueueError {
    /// The queue stayed full for the whole grace period.
    Full(UploadDescriptor),
    /// The queue is shut down and accepts nothing new.
    Inactive(UploadDescriptor),
}

pub enum Dequeued {
    Item(UploadDescriptor),
    /// The queue is shut down and fully drained.
    Shutdown,
}

struct Inner {
    heap: BinaryHeap<UploadDescriptor>,
    active: bool,
    next_seq: u64,
}

pub struct ProcessQueue {
    inner: Mutex<Inner>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl ProcessQueue {
    pub fn new() -> Self {
        Self::with_capacity(MAX_QUEUE_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::with_capacity(capacity),
                active: true,
                next_seq: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned lock means another thread panicked mid-operation; the
        // heap itself is still structurally valid, so keep going.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Inserts a descriptor, waiting up to `ENQUEUE_WAIT` for room. Returns
    /// the assigned arrival sequence number on success.
    pub fn enqueue(&self, mut descriptor: UploadDescriptor) -> Result<u64, EnqueueError> {
        let mut inner = self.lock();

        let deadline = Instant::now() + ENQUEUE_WAIT;
        while inner.heap.len() >= self.capacity && inner.active {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) => remaining,
                None => return Err(EnqueueError::Full(descriptor)),
            };
            let (guard, _) = self.not_full.wait_timeout(inner, remaining)
                .unwrap_or_else(|e| e.into_inner());
            inner = guard;
        }

        if !inner.active {
            return Err(EnqueueError::Inactive(descriptor));
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        descriptor.arrival_seq = seq;
        inner.heap.push(descriptor);

        self.not_empty.notify_one();
        Ok(seq)
    }

    /// Removes the highest-priority descriptor, blocking while the queue is
    /// empty and active. A shut-down queue keeps handing out its remaining
    /// items (so they can be answered 503) and reports `Shutdown` only once
    /// empty.
    pub fn dequeue(&self) -> Dequeued {
        let mut inner = self.lock();

        while inner.heap.is_empty() && inner.active {
            inner = self.not_empty.wait(inner).unwrap_or_else(|e| e.into_inner());
        }

        match inner.heap.pop() {
            Some(descriptor) => {
                self.not_full.notify_one();
                Dequeued::Item(descriptor)
            }
            None => Dequeued::Shutdown,
        }
    }

    /// Stops the queue and wakes every waiter on both sides.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        inner.active = false;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().heap.is_empty()
    }

    pub fn is_full(&self) -> bool {
        let inner = self.lock();
        inner.heap.len() >= self.capacity
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
