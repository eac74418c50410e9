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

//! Executable entry point. Imports lib.rs via the image_server crate.

// Unless we are in release mode, allow dead code, unused imports and variables,
// it makes development more enjoyable.
#![cfg_attr(debug_assertions, allow(dead_code, unused_imports, unused_variables))]

use std::path::{Path, PathBuf};
use structopt::{StructOpt, clap::AppSettings};
use anyhow::Result;
use image_server::{
    config::{Config, DEFAULT_CONFIG_PATH, LOG_FILE_PATH, PID_FILE_PATH},
    daemon,
    log_info,
    logger,
    server,
    state::State,
};

#[derive(StructOpt, PartialEq, Debug)]
#[structopt(about,
    // When showing --help, we want to keep the order of arguments defined
    // in the `Opts` struct, as opposed to the default alphabetical order.
    global_setting(AppSettings::DeriveDisplayOrder),
    // help subcommand is not useful, disable it.
    global_setting(AppSettings::DisableHelpSubcommand),
    // subcommand version is not useful, disable it.
    global_setting(AppSettings::VersionlessSubcommands),
)]
struct Opts {
    /// Path of the KEY=VALUE configuration file.
    #[structopt(short, long, parse(from_os_str))]
    config: Option<PathBuf>,

    /// Path of the log file.
    #[structopt(short, long, parse(from_os_str))]
    log_file: Option<PathBuf>,

    #[structopt(subcommand)]
    operation: Operation,
}

#[derive(StructOpt, PartialEq, Debug)]
enum Operation {
    /// Run as a system daemon
    Daemon,

    /// Run in the foreground, mirroring logs to the console
    Run,

    /// Print the effective configuration and exit
    Info,
}

fn main() -> Result<()> {
    let opts: Opts = Opts::from_args();

    let config_path = opts.config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = Config::load(&config_path)?;
    config.validate()?;

    let log_file = opts.log_file
        .unwrap_or_else(|| PathBuf::from(LOG_FILE_PATH));
    let level = logger::Level::parse(&config.log_level);

    match opts.operation {
        Operation::Info => {
            print_config(&config, &config_path);
            Ok(())
        }
        Operation::Run => {
            logger::init(Some(&log_file), level, true);
            daemon::install_signal_handlers()?;
            log_info!("=== ImageServer starting in the foreground ===");

            let state = State::new(config);
            server::run(&state, &config_path)
        }
        Operation::Daemon => {
            let pid_file = Path::new(PID_FILE_PATH);
            daemon::daemonize(pid_file)?;
            // From here on stdio is /dev/null; only the log file is live.
            logger::init(Some(&log_file), level, false);
            daemon::install_signal_handlers()?;
            log_info!("=== ImageServer daemon started ===");

            let state = State::new(config);
            let result = server::run(&state, &config_path);
            daemon::remove_pid_file(pid_file);
            log_info!("=== ImageServer daemon finished ===");
            result
        }
    }
}

fn print_config(config: &Config, config_path: &Path) {
    println!("Configuration ({}):", config_path.display());
    println!("  port:              {}", config.port);
    println!("  log level:         {}", config.log_level);
    println!("  max connections:   {}", config.max_connections);
    println!("  max image size:    {} MB", config.max_image_size_mb);
    println!("  supported formats: {}", config.supported_formats.join(","));
    println!("  base path:         {}", config.image_base_path.display());
    println!("  processed path:    {}", config.processed_path.display());
    println!("  red path:          {}", config.red_path.display());
    println!("  green path:        {}", config.green_path.display());
    println!("  blue path:         {}", config.blue_path.display());
    println!("  temp path:         {}", config.temp_path.display());
}
