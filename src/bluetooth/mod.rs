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

//! Bluetooth LE module.
//!
//! Runs either as a GATT peripheral (advertising a custom service and
//! accepting writes) or as a central (scanning, connecting and writing to
//! peers). Both roles exchange text and chunked images.

pub mod ble_constants;
pub mod bluez;
mod advertiser;
mod coordinator;
mod error;
mod events;
mod gatt;
mod gatt_client;
mod gatt_server;
mod peers;
mod platform;
mod protocol;
mod reassembler;
mod scanner;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

use serde::Serialize;

pub use advertiser::AdvertiserController;
pub use bluez::BluezPlatform;
pub use coordinator::{EngineOptions, Role, RoleCoordinator, SharedRole, TransferTiming};
pub use error::{AdvertiseFailure, BleError, BleResult, ScanFailure, TransferError};
pub use events::{BleEvent, EventSink};
pub use gatt::{
    AttPermissions, CharProperties, CharRole, CharacteristicDefinition, CharacteristicSpec,
    DescriptorDefinition, GattProfile, GattResponse, GattStatus, LinkState, ProfileKind,
    RemoteCharacteristic, RemoteService, ServiceDefinition, SubscriptionState, WriteType,
};
pub use gatt_client::GattClientEngine;
pub use gatt_server::GattServerEngine;
pub use peers::{
    ConnectedClient, ConnectedPeer, ConnectedPeerView, DiscoveredPeer, LocalIdentity,
    PeerIdentity, PeerTable,
};
pub use platform::{
    AdvertiseCallback, AdvertiseMode, AdvertisePayload, AdvertiseSettings, BlePlatform,
    Capability, DescriptorWriteRequest, GattClientCallback, GattLink, GattServerCallback,
    GattServerHandle, GrantAll, LeAdvertiser, LeScanner, Permissions, ScanCallback, ScanFilter,
    ScanMode, ScanRecord, ScanResult, ScanSettings, WriteRequest,
};
pub use protocol::{TransferFrame, TransferSession};
pub use reassembler::{ImageReassembler, InboundRouter};
pub use scanner::{DiscoveryListener, ScannerController};

/// Outcome of a fan-out send: which peers accepted the payload for
/// delivery and which refused it.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct SendReport {
    pub queued: Vec<String>,
    pub failed: Vec<(String, BleError)>,
}

impl SendReport {
    pub fn is_empty(&self) -> bool {
        self.queued.is_empty() && self.failed.is_empty()
    }
}
