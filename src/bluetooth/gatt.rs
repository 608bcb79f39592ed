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

//! GATT attribute types and the messaging protocol profile.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;
use uuid::Uuid;

use super::ble_constants::{self, legacy, CCCD_UUID};

/// Characteristic property bits as defined by the Core specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CharProperties(pub u8);

impl CharProperties {
    pub const READ: Self = Self(0x02);
    pub const WRITE_NO_RESPONSE: Self = Self(0x04);
    pub const WRITE: Self = Self(0x08);
    pub const NOTIFY: Self = Self(0x10);
    pub const INDICATE: Self = Self(0x20);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CharProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Attribute permission bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AttPermissions(pub u16);

impl AttPermissions {
    pub const READ: Self = Self(0x01);
    pub const WRITE: Self = Self(0x10);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AttPermissions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// ATT/GATT operation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattStatus(pub u16);

impl GattStatus {
    pub const SUCCESS: Self = Self(0x0000);
    pub const READ_NOT_PERMITTED: Self = Self(0x0002);
    pub const WRITE_NOT_PERMITTED: Self = Self(0x0003);
    pub const INVALID_OFFSET: Self = Self(0x0007);
    /// Generic link-level error reported for failed connection attempts.
    pub const ERROR: Self = Self(0x0085);
    pub const FAILURE: Self = Self(0x0101);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// Link state reported by connection-state callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Write type used by a GATT client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    /// Write request, acknowledged by the server.
    Default,
    /// Write command, unacknowledged.
    NoResponse,
}

/// Response to a server-side read or write request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattResponse {
    pub status: GattStatus,
    pub offset: u16,
    pub value: Vec<u8>,
}

impl GattResponse {
    pub fn success(value: Vec<u8>) -> Self {
        Self {
            status: GattStatus::SUCCESS,
            offset: 0,
            value,
        }
    }

    pub fn failure() -> Self {
        Self {
            status: GattStatus::FAILURE,
            offset: 0,
            value: Vec::new(),
        }
    }

    pub fn with_status(status: GattStatus) -> Self {
        Self {
            status,
            offset: 0,
            value: Vec::new(),
        }
    }
}

/// What a characteristic is used for by the messaging protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CharRole {
    /// Identifier exchange (read + write).
    Bidirectional,
    /// Message channel from central to peripheral.
    Write,
    /// Message channel from peripheral to central.
    Notify,
    /// Read-only status value; also accepted as a write channel by the server.
    Read,
}

impl CharRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bidirectional => "bidirectional",
            Self::Write => "write",
            Self::Notify => "notify",
            Self::Read => "read",
        }
    }
}

/// One characteristic of the profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicSpec {
    pub role: CharRole,
    pub uuid: Uuid,
    pub properties: CharProperties,
    pub permissions: AttPermissions,
    /// Attach a client characteristic configuration descriptor.
    pub cccd: bool,
}

/// Which built-in profile to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileKind {
    /// Service with identifier exchange, used by the dual-role application.
    #[default]
    Combined,
    /// Peripheral-only variant without the bidirectional characteristic.
    Legacy,
}

/// Service layout shared by the GATT server and client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattProfile {
    pub service_uuid: Uuid,
    pub characteristics: Vec<CharacteristicSpec>,
}

impl GattProfile {
    pub fn from_kind(kind: ProfileKind) -> Self {
        match kind {
            ProfileKind::Combined => Self::combined(),
            ProfileKind::Legacy => Self::legacy(),
        }
    }

    pub fn combined() -> Self {
        Self {
            service_uuid: ble_constants::SERVICE_UUID,
            characteristics: vec![
                CharacteristicSpec {
                    role: CharRole::Bidirectional,
                    uuid: ble_constants::BIDIRECTIONAL_UUID,
                    properties: CharProperties::READ | CharProperties::WRITE,
                    permissions: AttPermissions::READ | AttPermissions::WRITE,
                    cccd: false,
                },
                write_spec(ble_constants::WRITE_UUID),
                notify_spec(ble_constants::NOTIFY_UUID),
                read_spec(ble_constants::READ_UUID),
            ],
        }
    }

    pub fn legacy() -> Self {
        Self {
            service_uuid: legacy::SERVICE_UUID,
            characteristics: vec![
                write_spec(legacy::WRITE_UUID),
                notify_spec(legacy::NOTIFY_UUID),
                read_spec(legacy::READ_UUID),
            ],
        }
    }

    pub fn spec(&self, role: CharRole) -> Option<&CharacteristicSpec> {
        self.characteristics.iter().find(|c| c.role == role)
    }

    pub fn uuid_of(&self, role: CharRole) -> Option<Uuid> {
        self.spec(role).map(|c| c.uuid)
    }

    pub fn role_of(&self, uuid: Uuid) -> Option<CharRole> {
        self.characteristics
            .iter()
            .find(|c| c.uuid == uuid)
            .map(|c| c.role)
    }

    /// Build the service definition registered with a GATT server.
    pub fn service_definition(&self) -> ServiceDefinition {
        ServiceDefinition {
            uuid: self.service_uuid,
            primary: true,
            characteristics: self
                .characteristics
                .iter()
                .map(|spec| CharacteristicDefinition {
                    uuid: spec.uuid,
                    properties: spec.properties,
                    permissions: spec.permissions,
                    descriptors: if spec.cccd {
                        vec![DescriptorDefinition {
                            uuid: CCCD_UUID,
                            permissions: AttPermissions::READ | AttPermissions::WRITE,
                        }]
                    } else {
                        Vec::new()
                    },
                })
                .collect(),
        }
    }
}

impl Default for GattProfile {
    fn default() -> Self {
        Self::combined()
    }
}

fn write_spec(uuid: Uuid) -> CharacteristicSpec {
    CharacteristicSpec {
        role: CharRole::Write,
        uuid,
        properties: CharProperties::WRITE | CharProperties::WRITE_NO_RESPONSE,
        permissions: AttPermissions::WRITE,
        cccd: false,
    }
}

fn notify_spec(uuid: Uuid) -> CharacteristicSpec {
    CharacteristicSpec {
        role: CharRole::Notify,
        uuid,
        properties: CharProperties::READ | CharProperties::NOTIFY,
        permissions: AttPermissions::READ,
        cccd: true,
    }
}

fn read_spec(uuid: Uuid) -> CharacteristicSpec {
    CharacteristicSpec {
        role: CharRole::Read,
        uuid,
        properties: CharProperties::READ,
        permissions: AttPermissions::READ,
        cccd: true,
    }
}

/// Local service registered with a GATT server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    pub uuid: Uuid,
    pub primary: bool,
    pub characteristics: Vec<CharacteristicDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDefinition {
    pub uuid: Uuid,
    pub properties: CharProperties,
    pub permissions: AttPermissions,
    pub descriptors: Vec<DescriptorDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorDefinition {
    pub uuid: Uuid,
    pub permissions: AttPermissions,
}

/// Service found on a remote device during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteService {
    pub uuid: Uuid,
    pub characteristics: Vec<RemoteCharacteristic>,
}

impl RemoteService {
    pub fn characteristic(&self, uuid: Uuid) -> Option<&RemoteCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// Characteristic handle cached by the GATT client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCharacteristic {
    pub service: Uuid,
    pub uuid: Uuid,
    pub properties: CharProperties,
}

impl RemoteCharacteristic {
    /// Pick the write type the characteristic supports, preferring write commands.
    pub fn preferred_write_type(&self) -> WriteType {
        if self.properties.contains(CharProperties::WRITE_NO_RESPONSE) {
            WriteType::NoResponse
        } else {
            WriteType::Default
        }
    }
}

/// Subscription state written to a CCCD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Notifications,
    Indications,
    Disabled,
}

impl SubscriptionState {
    pub fn from_cccd(value: &[u8]) -> Self {
        if value == ble_constants::cccd::ENABLE_NOTIFICATION {
            Self::Notifications
        } else if value == ble_constants::cccd::ENABLE_INDICATION {
            Self::Indications
        } else {
            Self::Disabled
        }
    }
}
