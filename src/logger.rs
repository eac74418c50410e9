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

//! Process-wide leveled logger. Lines go to the log file (when one could be
//! opened) and are mirrored to the console. The daemon redirects stdio to
//! /dev/null, so in daemon mode the file is the only sink that matters.

use std::{
    fmt,
    fs::{self, OpenOptions},
    io::Write,
    path::Path,
    sync::Mutex,
};
use chrono::Local;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
        }
    }

    /// Unknown level strings fall back to INFO, like an unset config value.
    pub fn parse(s: &str) -> Level {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Level::Debug,
            "WARNING" => Level::Warning,
            "ERROR" => Level::Error,
            _ => Level::Info,
        }
    }
}

struct Logger {
    level: Level,
    console: bool,
    file: Option<fs::File>,
}

lazy_static::lazy_static! {
    static ref LOGGER: Mutex<Logger> = Mutex::new(Logger {
        level: Level::Info,
        console: true,
        file: None,
    });
}

/// (Re)configures the global logger. Failing to open the log file is not
/// fatal: logging continues on the console alone.
pub fn init(log_file: Option<&Path>, level: Level, console: bool) {
    let file = log_file.and_then(|path| {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(f) => Some(f),
            Err(e) => {
                eprintln!("Warning: cannot open {} for logging: {}", path.display(), e);
                None
            }
        }
    });

    let mut logger = LOGGER.lock().unwrap();
    logger.level = level;
    logger.console = console;
    logger.file = file;
}

pub fn log(level: Level, args: fmt::Arguments) {
    let mut logger = LOGGER.lock().unwrap();
    if level < logger.level {
        return;
    }

    let line = format!("[{}] [{}] {}",
                       Local::now().format("%Y-%m-%d %H:%M:%S"), level.as_str(), args);

    if let Some(file) = logger.file.as_mut() {
        // A full disk should not take the server down with it.
        let _ = writeln!(file, "{}", line);
        let _ = file.flush();
    }

    if logger.console {
        println!("{}", line);
    }
}

/// One structured line per upload action, greppable by field.
pub fn log_client_activity(client_ip: &str, filename: &str, action: &str, status: &str) {
    log(Level::Info, format_args!("Client: {} | File: {} | Action: {} | Status: {}",
                                  client_ip, filename, action, status));
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => { $crate::logger::log($crate::logger::Level::Debug, format_args!($($arg)*)) };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => { $crate::logger::log($crate::logger::Level::Info, format_args!($($arg)*)) };
}

#[macro_export]
macro_rules! log_warning {
    ($($arg:tt)*) => { $crate::logger::log($crate::logger::Level::Warning, format_args!($($arg)*)) };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => { $crate::logger::log($crate::logger::Level::Error, format_args!($($arg)*)) };
}
