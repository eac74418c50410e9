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

//! Daemonization and signal plumbing. Signal handlers only flip atomic
//! flags; the supervisor polls them from its tick loop. SIGTERM and SIGINT
//! request termination, SIGHUP requests a configuration reload, SIGPIPE is
//! ignored so a peer hanging up mid-write surfaces as an EPIPE error on the
//! socket instead of killing the process.

use std::{
    fs,
    os::unix::io::AsRawFd,
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
};
use anyhow::{Result, Context};
use nix::{
    sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal},
    sys::stat::{umask, Mode},
    unistd::{chdir, dup2, fork, getpid, setsid, ForkResult},
};
use crate::log_info;

static TERMINATE: AtomicBool = AtomicBool::new(false);
static RELOAD: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(sig: libc::c_int) {
    // Async-signal context: flag stores only, no locks, no allocation.
    match sig {
        libc::SIGTERM | libc::SIGINT => TERMINATE.store(true, Ordering::SeqCst),
        libc::SIGHUP => RELOAD.store(true, Ordering::SeqCst),
        _ => {}
    }
}

pub fn install_signal_handlers() -> Result<()> {
    let flagging = SigAction::new(SigHandler::Handler(handle_signal),
                                  SaFlags::SA_RESTART, SigSet::empty());
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::SA_RESTART, SigSet::empty());

    unsafe {
        sigaction(Signal::SIGTERM, &flagging).context("Failed to install SIGTERM handler")?;
        sigaction(Signal::SIGINT, &flagging).context("Failed to install SIGINT handler")?;
        sigaction(Signal::SIGHUP, &flagging).context("Failed to install SIGHUP handler")?;
        sigaction(Signal::SIGPIPE, &ignore).context("Failed to ignore SIGPIPE")?;
    }

    log_info!("Signal handlers installed");
    Ok(())
}

pub fn terminate_requested() -> bool {
    TERMINATE.load(Ordering::SeqCst)
}

/// Consumes a pending reload request, if any.
pub fn take_reload_request() -> bool {
    RELOAD.swap(false, Ordering::SeqCst)
}

/// Reads the PID file and probes the recorded process. A stale file left by
/// a crashed instance is removed on the spot.
fn check_already_running(pid_file: &Path) -> Option<i32> {
    let content = fs::read_to_string(pid_file).ok()?;
    let pid: i32 = content.trim().parse().ok()?;

    if kill(nix::unistd::Pid::from_raw(pid), None).is_ok() {
        Some(pid)
    } else {
        let _ = fs::remove_file(pid_file);
        None
    }
}

fn write_pid_file(pid_file: &Path) -> Result<()> {
    let pid = getpid();
    fs::write(pid_file, format!("{}\n", pid))
        .with_context(|| format!("Failed to write PID file {}", pid_file.display()))?;
    log_info!("PID file created: {} (PID {})", pid_file.display(), pid);
    Ok(())
}

pub fn remove_pid_file(pid_file: &Path) {
    match fs::remove_file(pid_file) {
        Ok(()) => log_info!("PID file removed: {}", pid_file.display()),
        Err(e) => log_info!("Could not remove PID file {}: {}", pid_file.display(), e),
    }
}

fn redirect_stdio_to_devnull() -> Result<()> {
    let null_in = fs::File::open("/dev/null").context("Failed to open /dev/null")?;
    let null_out = fs::OpenOptions::new().write(true).open("/dev/null")
        .context("Failed to open /dev/null for writing")?;

    dup2(null_in.as_raw_fd(), libc::STDIN_FILENO).context("Failed to redirect stdin")?;
    dup2(null_out.as_raw_fd(), libc::STDOUT_FILENO).context("Failed to redirect stdout")?;
    dup2(null_out.as_raw_fd(), libc::STDERR_FILENO).context("Failed to redirect stderr")?;
    Ok(())
}

/// Classic double-fork daemonization: detach from the controlling terminal,
/// start a new session, drop into /, clear the umask, silence stdio, and
/// record the PID. The calling (parent) processes exit inside.
pub fn daemonize(pid_file: &Path) -> Result<()> {
    if let Some(pid) = check_already_running(pid_file) {
        bail!("Daemon already running with PID {}", pid);
    }

    match unsafe { fork() }.context("First fork failed")? {
        ForkResult::Parent { child } => {
            println!("Daemon started with PID {}", child);
            std::process::exit(0);
        }
        ForkResult::Child => {}
    }

    setsid().context("setsid failed")?;

    // Second fork: the session leader exits so the daemon can never
    // reacquire a controlling terminal.
    match unsafe { fork() }.context("Second fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    chdir("/").context("chdir to / failed")?;
    umask(Mode::empty());
    redirect_stdio_to_devnull()?;
    write_pid_file(pid_file)?;

    log_info!("Daemonization complete");
    Ok(())
}
