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

//! Error types for the BLE engines.

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use super::coordinator::Role;
use super::gatt::GattStatus;
use super::platform::Capability;

/// Errors reported by the BLE engines.
///
/// None of these are fatal: each is reported as an event and leaves the
/// failing subsystem inactive (or the affected peer removed).
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum BleError {
    #[error("Permission denied: {0}")]
    PermissionDenied(Capability),

    #[error("Bluetooth adapter not available")]
    AdapterUnavailable,

    #[error("{0} already active")]
    AlreadyActive(String),

    #[error("{0} not available")]
    ResourceUnavailable(String),

    #[error("Advertising failed: {0}")]
    AdvertiseFailed(AdvertiseFailure),

    #[error("Scan failed: {0}")]
    ScanFailed(ScanFailure),

    #[error("Connection to {peer} failed with status {status}")]
    ConnectionFailure { peer: String, status: GattStatus },

    #[error("Service discovery on {peer} failed with status {status}")]
    DiscoveryFailure { peer: String, status: GattStatus },

    #[error("Service not found on {peer}")]
    ServiceNotFound { peer: String },

    #[error("Write to {peer} failed with status {status}")]
    WriteFailure { peer: String, status: GattStatus },

    #[error("Read from {peer} failed with status {status}")]
    ReadFailure { peer: String, status: GattStatus },

    #[error("Unknown characteristic: {0}")]
    UnknownCharacteristic(Uuid),

    #[error("Characteristic {0} not available")]
    CharacteristicUnavailable(String),

    #[error("No connected peers")]
    NoConnectedPeers,

    #[error("GATT server not provisioned")]
    NotProvisioned,

    #[error("{0} cancelled by a role change")]
    Cancelled(String),

    #[error("Operation requires {required} role (current: {current})")]
    RoleMismatch { required: Role, current: Role },

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),
}

/// Reason an advertising start was rejected.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AdvertiseFailure {
    #[error("already started")]
    AlreadyStarted,
    #[error("data too large")]
    DataTooLarge,
    #[error("feature unsupported")]
    FeatureUnsupported,
    #[error("internal error")]
    InternalError,
    #[error("too many advertisers")]
    TooManyAdvertisers,
    #[error("unknown error ({0})")]
    Unknown(i32),
}

impl AdvertiseFailure {
    /// Decode a platform advertise error code.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::DataTooLarge,
            2 => Self::TooManyAdvertisers,
            3 => Self::AlreadyStarted,
            4 => Self::InternalError,
            5 => Self::FeatureUnsupported,
            other => Self::Unknown(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::DataTooLarge => 1,
            Self::TooManyAdvertisers => 2,
            Self::AlreadyStarted => 3,
            Self::InternalError => 4,
            Self::FeatureUnsupported => 5,
            Self::Unknown(code) => code,
        }
    }
}

/// Reason a scan start was rejected.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScanFailure {
    #[error("already started")]
    AlreadyStarted,
    #[error("application registration failed")]
    RegistrationFailed,
    #[error("feature unsupported")]
    FeatureUnsupported,
    #[error("internal error")]
    InternalError,
    #[error("unknown error ({0})")]
    Unknown(i32),
}

impl ScanFailure {
    /// Decode a platform scan error code.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::AlreadyStarted,
            2 => Self::RegistrationFailed,
            3 => Self::InternalError,
            4 => Self::FeatureUnsupported,
            other => Self::Unknown(other),
        }
    }
}

/// Errors while reassembling a chunked image.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TransferError {
    #[error("chunk received before IMG_START")]
    NotStarted,

    #[error("chunk index {index} outside 0..{count}")]
    IndexOutOfRange { index: usize, count: usize },

    #[error("incomplete image: expected {expected} chunks, received {received}")]
    Incomplete { expected: usize, received: usize },

    #[error("invalid base64 payload")]
    InvalidBase64,

    #[error("image persistence failed: {0}")]
    Persist(String),
}

pub type BleResult<T> = std::result::Result<T, BleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advertise_codes() {
        assert_eq!(AdvertiseFailure::from_code(1), AdvertiseFailure::DataTooLarge);
        assert_eq!(
            AdvertiseFailure::from_code(3),
            AdvertiseFailure::AlreadyStarted
        );
        assert_eq!(AdvertiseFailure::from_code(42), AdvertiseFailure::Unknown(42));
        for code in 1..=5 {
            assert_eq!(AdvertiseFailure::from_code(code).code(), code);
        }
    }

    #[test]
    fn test_scan_codes() {
        assert_eq!(ScanFailure::from_code(2), ScanFailure::RegistrationFailed);
        assert_eq!(ScanFailure::from_code(9), ScanFailure::Unknown(9));
    }

    #[test]
    fn test_error_messages() {
        let err = BleError::WriteFailure {
            peer: "AA:BB".to_string(),
            status: GattStatus::FAILURE,
        };
        assert_eq!(err.to_string(), "Write to AA:BB failed with status 0x0101");

        let err: BleError = TransferError::InvalidBase64.into();
        assert_eq!(err.to_string(), "Transfer error: invalid base64 payload");
    }
}
