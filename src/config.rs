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
//! Handles loading and saving application settings.

use anyhow::Result;
use gethostname::gethostname;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bluetooth::ble_constants::{advertising, transfer, DEFAULT_LOCAL_IDENTIFIER};
use crate::bluetooth::{EngineOptions, ProfileKind, TransferTiming};

const APP_DIR: &str = "ble-duplex";

/// Get a sanitized hostname suitable for Bluetooth device name.
/// Bluetooth names should only contain alphanumeric chars, spaces, and hyphens.
fn get_sanitized_hostname() -> String {
    sanitize_name(&gethostname().to_string_lossy())
}

fn sanitize_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == ' ' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = sanitized.trim_matches('-');
    if trimmed.is_empty() {
        "BLE-Duplex".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for received images.
    #[serde(skip)]
    pub data_dir: PathBuf,

    /// Bluetooth settings.
    #[serde(default)]
    pub bluetooth: BluetoothConfig,

    /// Image transfer pacing.
    #[serde(default)]
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Device name advertised over Bluetooth.
    /// This is always computed at runtime from the system hostname.
    #[serde(skip)]
    pub device_name: String,

    /// BlueZ adapter to use, e.g. "hci0". Default adapter when unset.
    pub adapter: Option<String>,

    /// Identifier answered on reads of the bidirectional characteristic.
    pub local_identifier: String,

    /// Put the local identifier into the scan response.
    pub advertise_identifier: bool,

    /// Manufacturer id the identifier is advertised under.
    pub manufacturer_id: u16,

    /// Write the local identifier to a peripheral right after discovery.
    pub identifier_handshake: bool,

    /// Start advertising when entering the peripheral role.
    pub auto_advertise: bool,

    /// Connect to every peer found while scanning.
    pub auto_connect: bool,

    /// Stop scanning after this many seconds. Unlimited when unset.
    pub scan_timeout_secs: Option<u64>,

    /// Characteristic layout: "combined" or "legacy".
    pub profile: ProfileKind,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            device_name: get_sanitized_hostname(),
            adapter: None,
            local_identifier: DEFAULT_LOCAL_IDENTIFIER.to_string(),
            advertise_identifier: true,
            manufacturer_id: advertising::DEFAULT_MANUFACTURER_ID,
            identifier_handshake: false,
            auto_advertise: true,
            auto_connect: false,
            scan_timeout_secs: None,
            profile: ProfileKind::Combined,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Base64 characters per image chunk.
    pub chunk_size: usize,
    pub start_delay_ms: u64,
    pub chunk_delay_ms: u64,
    pub end_delay_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: transfer::IMAGE_CHUNK_SIZE,
            start_delay_ms: transfer::START_DELAY_MS,
            chunk_delay_ms: transfer::CHUNK_DELAY_MS,
            end_delay_ms: transfer::END_DELAY_MS,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            bluetooth: BluetoothConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("config.toml")
}

impl Config {
    /// Load configuration from file or create default.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&config_path())?;

        // Set data directory
        config.data_dir = default_data_dir();
        std::fs::create_dir_all(&config.data_dir)?;

        Ok(config)
    }

    /// Load from `path`, writing the defaults there if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let mut config: Self = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            let config = Self::default();
            let content = toml::to_string_pretty(&config)?;
            std::fs::write(path, content)?;
            config
        };

        config.bluetooth.device_name = get_sanitized_hostname();
        config.data_dir = default_data_dir();
        Ok(config)
    }

    /// Save configuration to file.
    #[allow(dead_code)]
    pub fn save(&self) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path(), content)?;
        Ok(())
    }

    /// Engine options for the role coordinator.
    pub fn engine_options(&self) -> EngineOptions {
        let bt = &self.bluetooth;
        EngineOptions {
            profile: bt.profile,
            device_name: bt.device_name.clone(),
            local_identifier: bt.local_identifier.clone(),
            advertise_identifier: bt.advertise_identifier,
            manufacturer_id: bt.manufacturer_id,
            identifier_handshake: bt.identifier_handshake,
            auto_advertise: bt.auto_advertise,
            auto_connect: bt.auto_connect,
            scan_timeout: bt.scan_timeout_secs.map(Duration::from_secs),
            transfer: TransferTiming {
                chunk_size: self.transfer.chunk_size.max(1),
                start_delay: Duration::from_millis(self.transfer.start_delay_ms),
                chunk_delay: Duration::from_millis(self.transfer.chunk_delay_ms),
                end_delay: Duration::from_millis(self.transfer.end_delay_ms),
            },
        }
    }
}
