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

//! Listener setup, the acceptor loop, and the supervisor. The supervisor
//! owns the lifecycle: it binds the socket, starts the worker and acceptor
//! threads, ticks through periodic maintenance (idle-connection reaping,
//! stale temp files, stats snapshots), reacts to the signal flags, and
//! orchestrates both graceful shutdown and SIGHUP restarts.
//!
//! The acceptor polls a nonblocking listener and backs off while idle. That
//! keeps shutdown simple: flipping the status out of Running is enough to
//! stop accepting, with no self-connect tricks to unblock accept(2).

use std::{
    fs,
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream},
    os::unix::io::FromRawFd,
    path::Path,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use anyhow::{Result, Context};
use crossbeam_utils::Backoff;
use nix::sys::socket::{
    socket, setsockopt, bind, listen,
    AddressFamily, SockFlag, SockType, SockaddrIn,
    sockopt::ReuseAddr,
};
use crate::{
    config::Config,
    daemon,
    handler, http,
    log_error, log_info, log_warning,
    processor,
    state::{ServerStatus, State},
    util::create_dir_all,
};

/// Connections older than this are force-closed by the supervisor,
/// whatever state their handler is in.
pub const IDLE_CONNECTION_MAX: Duration = Duration::from_secs(300);

const TEMP_FILE_MAX_AGE: Duration = Duration::from_secs(24 * 3600);
const TEMP_REAP_INTERVAL: Duration = Duration::from_secs(3600);
const STATS_INTERVAL: Duration = Duration::from_secs(300);
const SUPERVISOR_TICK: Duration = Duration::from_secs(1);

/// Creates the IPv4 listening socket with SO_REUSEADDR, which a plain
/// `TcpListener::bind` does not set, and hands it to std.
pub fn bind_listener(port: u16, backlog: usize) -> Result<TcpListener> {
    let fd = socket(AddressFamily::Inet, SockType::Stream, SockFlag::empty(), None)
        .context("Failed to create server socket")?;

    let result = (|| -> Result<()> {
        setsockopt(fd, ReuseAddr, &true).context("Failed to set SO_REUSEADDR")?;
        let addr = SockaddrIn::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        bind(fd, &addr).with_context(|| format!("Failed to bind port {}", port))?;
        listen(fd, backlog).context("Failed to listen on server socket")?;
        Ok(())
    })();

    if let Err(e) = result {
        let _ = nix::unistd::close(fd);
        return Err(e);
    }

    Ok(unsafe { TcpListener::from_raw_fd(fd) })
}

pub fn create_directories(config: &Config) -> Result<()> {
    for dir in config.directories() {
        create_dir_all(dir)?;
    }
    Ok(())
}

/// Accept loop. Runs while the server status stays Running; admission
/// control happens here, right after accept.
pub fn acceptor_loop(state: &Arc<State>, listener: TcpListener) {
    if let Err(e) = listener.set_nonblocking(true) {
        log_error!("Cannot make listener nonblocking: {}", e);
        return;
    }

    log_info!("Acceptor thread started");
    let backoff = Backoff::new();

    while state.status.get() == ServerStatus::Running {
        match listener.accept() {
            Ok((stream, addr)) => {
                backoff.reset();
                accept_client(state, stream, addr);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if backoff.is_completed() {
                    thread::sleep(Duration::from_millis(25));
                } else {
                    backoff.snooze();
                }
            }
            Err(e) => {
                log_error!("accept() failed: {}", e);
                thread::sleep(Duration::from_millis(100));
            }
        }
    }

    log_info!("Acceptor thread terminating");
}

fn accept_client(state: &Arc<State>, stream: TcpStream, addr: SocketAddr) {
    let client_ip = addr.ip().to_string();
    // The accepted socket must not inherit the listener's nonblocking mode.
    if let Err(e) = stream.set_nonblocking(false) {
        log_error!("Cannot configure socket from {}: {}", client_ip, e);
        return;
    }

    let limit = state.config().max_connections;
    let slot = match state.clients.register(&stream, client_ip.clone(), limit) {
        Some(slot) => slot,
        None => {
            log_warning!("Connection limit reached ({}), rejecting {}", limit, client_ip);
            let mut stream = stream;
            let _ = stream.set_write_timeout(Some(http::IO_TIMEOUT));
            let _ = http::write_error(&mut stream, 503, "Server busy");
            return;
        }
    };

    log_info!("Client connected: {} ({}/{})", client_ip, state.clients.count(), limit);

    let thread_state = Arc::clone(state);
    let thread_ip = client_ip.clone();
    let spawned = thread::Builder::new()
        .name(format!("handler-{}", slot))
        .spawn(move || {
            handler::handle_connection(&thread_state, stream, thread_ip.clone());
            thread_state.clients.release(slot);
            log_info!("Client done: {} ({} active)", thread_ip, thread_state.clients.count());
        });

    if let Err(e) = spawned {
        // The closure never ran; the socket was dropped with it.
        log_error!("Cannot spawn handler thread for {}: {}", client_ip, e);
        state.clients.release(slot);
    }
}

pub struct ServerHandles {
    acceptor: thread::JoinHandle<()>,
    worker: thread::JoinHandle<()>,
}

/// Starts the worker and acceptor threads and flips the status to Running.
pub fn start(state: &Arc<State>, listener: TcpListener) -> Result<ServerHandles> {
    state.status.set(ServerStatus::Running);

    let worker = thread::Builder::new().name("processor".to_string())
        .spawn({
            let state = Arc::clone(state);
            move || processor::run(&state)
        })
        .context("Failed to spawn processor thread")?;

    let acceptor = thread::Builder::new().name("acceptor".to_string())
        .spawn({
            let state = Arc::clone(state);
            move || acceptor_loop(&state, listener)
        })
        .context("Failed to spawn acceptor thread")?;

    Ok(ServerHandles { acceptor, worker })
}

/// Graceful shutdown: stop accepting, let the worker drain the queue
/// (answering 503 to whatever is still pending), then close stragglers.
pub fn stop(state: &Arc<State>, handles: ServerHandles) {
    log_info!("Stopping server");
    state.status.set(ServerStatus::Stopping);

    let _ = handles.acceptor.join();
    state.queue.shutdown();
    let _ = handles.worker.join();

    // Normally a no-op: the worker drained everything before exiting. If it
    // died early, the leftover descriptors still get a response and their
    // sockets a single close.
    while let crate::queue::Dequeued::Item(mut descriptor) = state.queue.dequeue() {
        let _ = http::write_error(&mut descriptor.socket, 503, "Server shutting down");
        handler::remove_temp_file(&descriptor.temp_path);
    }

    state.clients.shutdown_all();

    state.status.set(ServerStatus::Stopped);
    log_info!("Server stopped");
}

/// Deletes `temp_*` files older than `max_age` from the temp directory.
/// Per-entry failures are logged and skipped; a vanished file mid-scan must
/// not abort the sweep.
pub fn cleanup_old_temp_files(temp_dir: &Path, max_age: Duration) -> Result<usize> {
    let entries = fs::read_dir(temp_dir)
        .with_context(|| format!("Failed to open temp directory {}", temp_dir.display()))?;

    let mut deleted = 0;
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log_warning!("Skipping unreadable temp entry: {}", e);
                continue;
            }
        };

        if !entry.file_name().to_string_lossy().starts_with("temp_") {
            continue;
        }

        let age = entry.metadata().ok()
            .filter(|meta| meta.is_file())
            .and_then(|meta| meta.modified().ok())
            .and_then(|modified| modified.elapsed().ok());

        if let Some(age) = age {
            if age > max_age {
                match fs::remove_file(entry.path()) {
                    Ok(()) => {
                        deleted += 1;
                        log_info!("Reaped stale temp file {} ({}h old)",
                                  entry.path().display(), age.as_secs() / 3600);
                    }
                    Err(e) => log_error!("Cannot reap {}: {}", entry.path().display(), e),
                }
            }
        }
    }

    Ok(deleted)
}

fn log_stats_snapshot(state: &State) {
    let snapshot = state.stats_snapshot();
    let json = serde_json::to_string(&snapshot).unwrap_or_default();
    log_info!("Stats snapshot: {} - connections {} - queue {}/{}",
              json, state.clients.count(), state.queue.len(), state.queue.capacity());
}

/// Supervisor entry point for both daemon and foreground modes. Returns
/// after a termination signal has been handled.
pub fn run(state: &Arc<State>, config_path: &Path) -> Result<()> {
    state.status.set(ServerStatus::Starting);
    let config = state.config();
    create_directories(&config)?;

    let listener = bind_listener(config.port, config.max_connections)?;
    log_info!("Server listening on port {} (max {} connections)",
              config.port, config.max_connections);

    let mut handles = start(state, listener)?;
    let mut last_temp_reap = Instant::now();
    let mut last_stats = Instant::now();

    loop {
        thread::sleep(SUPERVISOR_TICK);

        if daemon::terminate_requested() {
            log_info!("Termination signal received");
            break;
        }

        if daemon::take_reload_request() {
            handles = reload(state, config_path, handles)?;
        }

        state.clients.reap_older_than(IDLE_CONNECTION_MAX);

        if last_temp_reap.elapsed() >= TEMP_REAP_INTERVAL {
            last_temp_reap = Instant::now();
            if let Err(e) = cleanup_old_temp_files(&state.config().temp_path, TEMP_FILE_MAX_AGE) {
                log_error!("Temp cleanup failed: {:#}", e);
            }
        }

        if last_stats.elapsed() >= STATS_INTERVAL {
            last_stats = Instant::now();
            log_stats_snapshot(state);
        }
    }

    stop(state, handles);
    log_stats_snapshot(state);
    Ok(())
}

/// SIGHUP restart: pause the acceptor, re-read the config, rebind, resume.
/// The queue and the worker keep running; uploads already queued are
/// processed under the new configuration. A config that fails to load or
/// validate is discarded and the old one stays in force.
fn reload(state: &Arc<State>, config_path: &Path, handles: ServerHandles)
    -> Result<ServerHandles>
{
    log_info!("Reloading configuration from {}", config_path.display());

    state.status.set(ServerStatus::Starting);
    let _ = handles.acceptor.join();

    match Config::load(config_path).and_then(|config| {
        config.validate()?;
        Ok(config)
    }) {
        Ok(config) => {
            state.set_config(config);
            log_info!("Configuration reloaded");
        }
        Err(e) => log_error!("Reload failed, keeping previous configuration: {:#}", e),
    }

    let config = state.config();
    create_directories(&config)?;
    let listener = bind_listener(config.port, config.max_connections)?;
    log_info!("Server listening on port {} (max {} connections)",
              config.port, config.max_connections);

    state.status.set(ServerStatus::Running);
    let acceptor = thread::Builder::new().name("acceptor".to_string())
        .spawn({
            let state = Arc::clone(state);
            move || acceptor_loop(&state, listener)
        })
        .context("Failed to respawn acceptor thread")?;

    Ok(ServerHandles { acceptor, worker: handles.worker })
}
