// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

extern crate config as _;

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

/// Network settings shared by the client and server roles of a connection owner.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    /// Number of I/O worker threads, 0 means one per hardware thread.
    pub worker_threads: usize,
    /// Largest body a peer may announce in a frame header.
    pub max_frame_size: usize,
    /// Outbound messages a single connection may hold before `send` is refused.
    pub send_queue_capacity: usize,
    pub listen_backlog: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "127.0.0.1".to_string(),
            port: 1081,
            worker_threads: 0,
            max_frame_size: 16 * 1024 * 1024,
            send_queue_capacity: 4096,
            listen_backlog: 1024,
        }
    }
}

impl NetworkConfig {
    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get().max(1)
        } else {
            self.worker_threads
        }
    }

    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.send_queue_capacity == 0 {
            return Err(AppError::InvalidValue(
                "network.send_queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.max_frame_size > u32::MAX as usize {
            return Err(AppError::InvalidValue(format!(
                "network.max_frame_size {} does not fit a u32 length field",
                self.max_frame_size
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub network: NetworkConfig,
}

impl AppConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<AppConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let app_config: AppConfig = config.try_deserialize()?;
        app_config.network.validate()?;

        Ok(app_config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn load_partial_config_keeps_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[network]
ip = "0.0.0.0"
port = 9092
worker_threads = 2
"#
        )
        .unwrap();

        let config = AppConfig::set_up_config(file.path()).unwrap();
        assert_eq!(config.network.ip, "0.0.0.0");
        assert_eq!(config.network.port, 9092);
        assert_eq!(config.network.resolved_worker_threads(), 2);
        assert_eq!(
            config.network.send_queue_capacity,
            NetworkConfig::default().send_queue_capacity
        );
    }

    #[test]
    fn zero_workers_means_hardware_concurrency() {
        let config = NetworkConfig::default();
        assert_eq!(config.resolved_worker_threads(), num_cpus::get().max(1));
    }

    #[test]
    fn reject_zero_send_queue() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[network]\nsend_queue_capacity = 0").unwrap();
        assert!(matches!(
            AppConfig::set_up_config(file.path()),
            Err(AppError::InvalidValue(_))
        ));
    }

    #[test]
    fn missing_file_is_config_error() {
        let result = AppConfig::set_up_config("/nonexistent/stonelink.toml");
        assert!(matches!(result, Err(AppError::ConfigFileError(_))));
    }
}
