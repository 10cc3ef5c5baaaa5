// Copyright 2026 Daniel Pelikan
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

//! Configuration module.
//!
//! Handles loading and saving daemon settings.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::bluetooth::{ServiceRecord, TransportSettings, SERVICE_UUID};

const APP_DIR: &str = "gamelink-bt";

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Data directory for the databases.
    #[serde(skip)]
    pub data_dir: PathBuf,

    pub bluetooth: BluetoothConfig,

    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Whether the transport runs at all.
    pub enabled: bool,

    /// Service record name, also used as the adapter alias when set.
    pub app_name: String,

    /// Set the adapter alias to `app_name` on startup.
    pub set_alias: bool,

    pub service_uuid: Uuid,

    /// RFCOMM channel of the secure listener; insecure uses the next one.
    pub channel: u8,

    pub connect_timeout_ms: u64,
    pub connect_retry_ms: u64,
    pub reply_timeout_secs: u64,
    pub inbound_timeout_secs: u64,
    pub scan_timeout_ms: u64,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        let settings = TransportSettings::default();
        Self {
            enabled: true,
            app_name: settings.service.name,
            set_alias: false,
            service_uuid: SERVICE_UUID,
            channel: settings.service.channel,
            connect_timeout_ms: settings.connect_timeout.as_millis() as u64,
            connect_retry_ms: settings.connect_retry.as_millis() as u64,
            reply_timeout_secs: settings.reply_timeout.as_secs(),
            inbound_timeout_secs: settings.inbound_timeout.as_secs(),
            scan_timeout_ms: settings.scan_timeout.as_millis() as u64,
        }
    }
}

impl BluetoothConfig {
    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            service: ServiceRecord {
                name: self.app_name.clone(),
                uuid: self.service_uuid,
                channel: self.channel,
            },
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            connect_retry: Duration::from_millis(self.connect_retry_ms),
            reply_timeout: Duration::from_secs(self.reply_timeout_secs),
            inbound_timeout: Duration::from_secs(self.inbound_timeout_secs),
            scan_timeout: Duration::from_millis(self.scan_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level for this crate: "error", "warn", "info", "debug" or "trace".
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Filter directive for the tracing subscriber.
    pub fn directive(&self) -> String {
        format!("gamelink_bt={}", self.level)
    }
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

impl Config {
    /// Load configuration from file or create default.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&default_config_dir())?;
        config.data_dir = default_data_dir();
        std::fs::create_dir_all(&config.data_dir)?;
        Ok(config)
    }

    /// Load `config.toml` from `config_dir`, writing defaults there first
    /// if it doesn't exist.
    pub fn load_from(config_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(config_dir)?;
        let config_path = config_dir.join("config.toml");

        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)
                .with_context(|| format!("Invalid config file {:?}", config_path))?
        } else {
            let config = Self::default();
            config.save_to(config_dir)?;
            config
        };
        config.data_dir = config_dir.to_path_buf();
        Ok(config)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<()> {
        self.save_to(&default_config_dir())
    }

    fn save_to(&self, config_dir: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_dir.join("config.toml"), content)?;
        Ok(())
    }
}
