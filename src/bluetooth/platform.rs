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

//! Radio platform seams.
//!
//! Request methods only enqueue work; outcomes arrive later through the
//! callback traits. Server read/write callbacks answer synchronously with
//! the response to send back.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::ble_constants::advertising::{FLAGS_OVERHEAD, MAX_LEGACY_PAYLOAD};
use super::error::{AdvertiseFailure, BleResult, ScanFailure};
use super::gatt::{GattResponse, GattStatus, LinkState, RemoteService, ServiceDefinition, WriteType};
use super::peers::PeerIdentity;

/// Runtime capability the host must grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Capability {
    Scan,
    Connect,
    Advertise,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Scan => "scan",
            Self::Connect => "connect",
            Self::Advertise => "advertise",
        };
        f.write_str(name)
    }
}

/// Permission oracle supplied by the host.
pub trait Permissions: Send + Sync {
    fn has_permission(&self, capability: Capability) -> bool;
}

/// Grants every capability. Used where the OS enforces access itself.
pub struct GrantAll;

impl Permissions for GrantAll {
    fn has_permission(&self, _capability: Capability) -> bool {
        true
    }
}

/// Radio stack entry point.
pub trait BlePlatform: Send + Sync {
    /// Whether the adapter is present and powered.
    fn is_enabled(&self) -> bool;

    fn advertiser(&self) -> Option<Arc<dyn LeAdvertiser>>;

    fn scanner(&self) -> Option<Arc<dyn LeScanner>>;

    /// Open a GATT server context delivering requests to `callback`.
    fn open_gatt_server(
        &self,
        callback: Arc<dyn GattServerCallback>,
    ) -> Option<Arc<dyn GattServerHandle>>;

    /// Create a client link. The link stays idle until `connect` is called.
    fn gatt_link(
        &self,
        device: &PeerIdentity,
        callback: Arc<dyn GattClientCallback>,
    ) -> Option<Arc<dyn GattLink>>;
}

// ----------------------------------------------------------------------------
// Advertising
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertiseMode {
    LowPower,
    Balanced,
    LowLatency,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertiseSettings {
    pub mode: AdvertiseMode,
    pub connectable: bool,
    /// Zero means no limit.
    pub timeout: Duration,
}

impl Default for AdvertiseSettings {
    fn default() -> Self {
        Self {
            mode: AdvertiseMode::LowLatency,
            connectable: true,
            timeout: Duration::ZERO,
        }
    }
}

/// Advertising or scan response payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisePayload {
    pub service_uuids: Vec<Uuid>,
    pub include_device_name: bool,
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
}

impl AdvertisePayload {
    /// Encoded AD structure length for the given device name.
    pub fn encoded_len(&self, device_name: &str) -> usize {
        let mut len = 0;
        if !self.service_uuids.is_empty() {
            len += 2 + self.service_uuids.len() * 16;
        }
        if self.include_device_name {
            len += 2 + device_name.len();
        }
        for data in self.manufacturer_data.values() {
            len += 2 + 2 + data.len();
        }
        len
    }

    /// Whether the payload fits one legacy PDU. The advertising payload also
    /// carries the controller flags.
    pub fn fits_legacy(&self, device_name: &str, with_flags: bool) -> bool {
        let overhead = if with_flags { FLAGS_OVERHEAD } else { 0 };
        self.encoded_len(device_name) + overhead <= MAX_LEGACY_PAYLOAD
    }
}

pub trait AdvertiseCallback: Send + Sync {
    fn on_start_success(&self);
    fn on_start_failure(&self, reason: AdvertiseFailure);
}

pub trait LeAdvertiser: Send + Sync {
    fn start_advertising(
        &self,
        settings: &AdvertiseSettings,
        data: &AdvertisePayload,
        scan_response: &AdvertisePayload,
        callback: Arc<dyn AdvertiseCallback>,
    );

    fn stop_advertising(&self);
}

// ----------------------------------------------------------------------------
// Scanning
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    pub service_uuid: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    LowPower,
    Balanced,
    LowLatency,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSettings {
    pub mode: ScanMode,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            mode: ScanMode::LowLatency,
        }
    }
}

/// Parsed advertising record of a scan result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanRecord {
    pub device_name: Option<String>,
    pub service_uuids: Vec<Uuid>,
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub device: PeerIdentity,
    pub rssi: Option<i16>,
    pub record: Option<ScanRecord>,
}

pub trait ScanCallback: Send + Sync {
    fn on_scan_result(&self, result: ScanResult);
    fn on_batch_scan_results(&self, results: Vec<ScanResult>);
    fn on_scan_failed(&self, reason: ScanFailure);
}

pub trait LeScanner: Send + Sync {
    fn start_scan(
        &self,
        filters: &[ScanFilter],
        settings: &ScanSettings,
        callback: Arc<dyn ScanCallback>,
    );

    fn stop_scan(&self);
}

// ----------------------------------------------------------------------------
// GATT server
// ----------------------------------------------------------------------------

/// Characteristic write delivered to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub request_id: u32,
    pub characteristic: Uuid,
    pub value: Vec<u8>,
    pub offset: u16,
    pub response_needed: bool,
    pub prepared: bool,
}

/// Descriptor write delivered to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorWriteRequest {
    pub request_id: u32,
    pub characteristic: Uuid,
    pub descriptor: Uuid,
    pub value: Vec<u8>,
    pub response_needed: bool,
}

pub trait GattServerCallback: Send + Sync {
    fn on_connection_state_change(&self, device: &PeerIdentity, status: GattStatus, state: LinkState);

    fn on_characteristic_read_request(
        &self,
        device: &PeerIdentity,
        request_id: u32,
        offset: u16,
        characteristic: Uuid,
    ) -> GattResponse;

    /// Returns the response to send, or `None` when none was requested.
    fn on_characteristic_write_request(
        &self,
        device: &PeerIdentity,
        request: WriteRequest,
    ) -> Option<GattResponse>;

    fn on_descriptor_write_request(
        &self,
        device: &PeerIdentity,
        request: DescriptorWriteRequest,
    ) -> Option<GattResponse>;

    fn on_notification_sent(&self, device: &PeerIdentity, status: GattStatus);
}

#[async_trait]
pub trait GattServerHandle: Send + Sync {
    /// Register a service; resolves once the stack accepted or rejected it.
    async fn add_service(&self, service: ServiceDefinition) -> BleResult<()>;

    /// Replace the local value of a characteristic.
    fn set_value(&self, characteristic: Uuid, value: Vec<u8>) -> bool;

    /// Push the current value to one client.
    fn notify_characteristic_changed(
        &self,
        device: &PeerIdentity,
        characteristic: Uuid,
        confirm: bool,
    ) -> bool;

    fn close(&self);
}

// ----------------------------------------------------------------------------
// GATT client
// ----------------------------------------------------------------------------

pub trait GattClientCallback: Send + Sync {
    fn on_connection_state_change(&self, device: &PeerIdentity, status: GattStatus, state: LinkState);

    fn on_services_discovered(
        &self,
        device: &PeerIdentity,
        status: GattStatus,
        services: Vec<RemoteService>,
    );

    fn on_characteristic_write(&self, device: &PeerIdentity, characteristic: Uuid, status: GattStatus);

    fn on_characteristic_read(
        &self,
        device: &PeerIdentity,
        characteristic: Uuid,
        value: Vec<u8>,
        status: GattStatus,
    );

    fn on_characteristic_changed(&self, device: &PeerIdentity, characteristic: Uuid, value: Vec<u8>);

    fn on_descriptor_write(&self, device: &PeerIdentity, characteristic: Uuid, status: GattStatus);
}

/// Client link to one remote device.
pub trait GattLink: Send + Sync {
    fn device(&self) -> &PeerIdentity;

    fn connect(&self) -> bool;

    fn discover_services(&self) -> bool;

    fn write_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
        write_type: WriteType,
    ) -> bool;

    fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool;

    /// Enable or disable notifications, including the CCCD write.
    fn set_notification(&self, service: Uuid, characteristic: Uuid, enable: bool) -> bool;

    fn disconnect(&self);

    /// Release the link. No callbacks are delivered afterwards.
    fn close(&self);
}
