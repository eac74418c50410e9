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
    path::{Path, PathBuf},
};
use anyhow::{Result, Context};
use crate::{
    state::MAX_CLIENTS,
    util::MB,
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/imageserver.conf";
pub const LOG_FILE_PATH: &str = "/var/log/imageserver.log";
pub const PID_FILE_PATH: &str = "/var/run/imageserver.pid";

/// Hard ceiling on any request body. The configurable `max_image_size_mb`
/// can lower the effective limit but never raise it past this.
pub const MAX_UPLOAD_SIZE: usize = 50*MB;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub log_level: String,
    pub max_connections: usize,
    pub image_base_path: PathBuf,
    pub processed_path: PathBuf,
    pub red_path: PathBuf,
    pub green_path: PathBuf,
    pub blue_path: PathBuf,
    pub temp_path: PathBuf,
    pub max_image_size_mb: usize,
    pub supported_formats: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 1717,
            log_level: "INFO".to_string(),
            max_connections: MAX_CLIENTS,
            image_base_path: PathBuf::from("/var/imageserver/images"),
            processed_path: PathBuf::from("/var/imageserver/images/processed"),
            red_path: PathBuf::from("/var/imageserver/images/red"),
            green_path: PathBuf::from("/var/imageserver/images/green"),
            blue_path: PathBuf::from("/var/imageserver/images/blue"),
            temp_path: PathBuf::from("/var/imageserver/images/temp"),
            max_image_size_mb: 50,
            supported_formats: csv_formats("jpg,jpeg,png,gif"),
        }
    }
}

fn csv_formats(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    /// Loads the `KEY=VALUE` configuration file. A missing file is not an
    /// error: the defaults apply, matching a fresh install without a config.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::default();

        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => {
                eprintln!("Warning: cannot open {}, using default configuration", path.display());
                return Ok(config);
            }
        };

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = match line.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => continue,
            };

            match key {
                "PORT" => config.port = value.parse()
                    .with_context(|| format!("Invalid PORT value: {}", value))?,
                "LOG_LEVEL" => config.log_level = value.to_string(),
                "MAX_CONNECTIONS" => config.max_connections = value.parse()
                    .with_context(|| format!("Invalid MAX_CONNECTIONS value: {}", value))?,
                "IMAGE_BASE_PATH" => config.image_base_path = PathBuf::from(value),
                "PROCESSED_PATH" => config.processed_path = PathBuf::from(value),
                "RED_PATH" => config.red_path = PathBuf::from(value),
                "GREEN_PATH" => config.green_path = PathBuf::from(value),
                "BLUE_PATH" => config.blue_path = PathBuf::from(value),
                "TEMP_PATH" => config.temp_path = PathBuf::from(value),
                "MAX_IMAGE_SIZE_MB" => config.max_image_size_mb = value.parse()
                    .with_context(|| format!("Invalid MAX_IMAGE_SIZE_MB value: {}", value))?,
                "SUPPORTED_FORMATS" => config.supported_formats = csv_formats(value),
                _ => {} // Unknown keys are ignored so configs can be shared across versions.
            }
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.port >= 1024, "Invalid port {}: must be in 1024-65535", self.port);
        ensure!(self.max_connections >= 1 && self.max_connections <= MAX_CLIENTS,
                "Invalid max_connections {}: must be in 1-{}", self.max_connections, MAX_CLIENTS);
        ensure!(self.max_image_size_mb >= 1, "max_image_size_mb must be at least 1");
        ensure!(self.max_image_size_mb <= MAX_UPLOAD_SIZE / MB,
                "max_image_size_mb {} exceeds the {} MB hard cap",
                self.max_image_size_mb, MAX_UPLOAD_SIZE / MB);
        ensure!(!self.supported_formats.is_empty(), "supported_formats must not be empty");
        Ok(())
    }

    pub fn max_image_bytes(&self) -> usize {
        self.max_image_size_mb * MB
    }

    /// All directories the server needs on disk, base first.
    pub fn directories(&self) -> [&Path; 6] {
        [
            &self.image_base_path,
            &self.processed_path,
            &self.red_path,
            &self.green_path,
            &self.blue_path,
            &self.temp_path,
        ]
    }
}
