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

//! BLE service, characteristic and descriptor UUIDs.

use uuid::Uuid;

/// Messaging GATT service UUID.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0xbb21801d_a324_418f_abc7_f23d10e7d588);

/// Bidirectional characteristic UUID (identifier exchange).
/// Properties: Read, Write
pub const BIDIRECTIONAL_UUID: Uuid = Uuid::from_u128(0xb6a0912e_e715_438b_96a2_b21149015db1);

/// Write characteristic UUID (central sends messages here).
/// Properties: Write, Write Without Response
pub const WRITE_UUID: Uuid = Uuid::from_u128(0xb6a0912e_e715_438b_96a2_b21149015db2);

/// Notify characteristic UUID (peripheral pushes messages here).
/// Properties: Read, Notify
pub const NOTIFY_UUID: Uuid = Uuid::from_u128(0xb6a0912e_e715_438b_96a2_b21149015db3);

/// Read characteristic UUID.
/// Properties: Read
pub const READ_UUID: Uuid = Uuid::from_u128(0x00001104_0000_1000_8000_00805f9b34fb);

/// Client characteristic configuration descriptor.
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// UUIDs of the older peripheral-only variant.
pub mod legacy {
    use uuid::Uuid;

    pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
    pub const WRITE_UUID: Uuid = Uuid::from_u128(0x00001102_0000_1000_8000_00805f9b34fb);
    pub const NOTIFY_UUID: Uuid = Uuid::from_u128(0x00001103_0000_1000_8000_00805f9b34fb);
    pub const READ_UUID: Uuid = Uuid::from_u128(0x00001104_0000_1000_8000_00805f9b34fb);
}

/// CCCD values written by clients.
pub mod cccd {
    pub const ENABLE_NOTIFICATION: [u8; 2] = [0x01, 0x00];
    pub const ENABLE_INDICATION: [u8; 2] = [0x02, 0x00];
    pub const DISABLE: [u8; 2] = [0x00, 0x00];
}

/// Advertising constants.
pub mod advertising {
    /// Company identifier carrying the local identifier in manufacturer data.
    pub const DEFAULT_MANUFACTURER_ID: u16 = 0x1234;

    /// Legacy advertising PDU payload budget.
    pub const MAX_LEGACY_PAYLOAD: usize = 31;

    /// Flags AD structure added by the controller (length, type, value).
    pub const FLAGS_OVERHEAD: usize = 3;
}

/// Transfer protocol constants.
pub mod transfer {
    /// Base64 characters per image chunk.
    pub const IMAGE_CHUNK_SIZE: usize = 180;

    pub const START_DELAY_MS: u64 = 50;
    pub const CHUNK_DELAY_MS: u64 = 20;
    pub const END_DELAY_MS: u64 = 50;
}

/// Identifier the peripheral answers bidirectional reads with when none is configured.
pub const DEFAULT_LOCAL_IDENTIFIER: &str = "01000000000";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "bb21801d-a324-418f-abc7-f23d10e7d588"
        );
        assert_eq!(
            BIDIRECTIONAL_UUID.to_string(),
            "b6a0912e-e715-438b-96a2-b21149015db1"
        );
        assert_eq!(
            READ_UUID.to_string(),
            "00001104-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(CCCD_UUID.to_string(), "00002902-0000-1000-8000-00805f9b34fb");
    }

    #[test]
    fn test_characteristics_share_base() {
        // Custom characteristics differ only in the last byte
        let base = BIDIRECTIONAL_UUID.as_u128() & !0xff;
        assert_eq!(WRITE_UUID.as_u128() & !0xff, base);
        assert_eq!(NOTIFY_UUID.as_u128() & !0xff, base);
    }

    #[test]
    fn test_legacy_read_matches_combined() {
        assert_eq!(legacy::READ_UUID, READ_UUID);
        assert_ne!(legacy::SERVICE_UUID, SERVICE_UUID);
    }
}
