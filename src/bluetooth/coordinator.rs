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

//! Role state machine over {Idle, Central, Peripheral}.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::advertiser::AdvertiserController;
use super::ble_constants::{advertising, transfer, DEFAULT_LOCAL_IDENTIFIER};
use super::error::{BleError, BleResult};
use super::events::{BleEvent, EventSink};
use super::gatt::{GattProfile, ProfileKind};
use super::gatt_client::GattClientEngine;
use super::gatt_server::GattServerEngine;
use super::peers::{DiscoveredPeer, LocalIdentity};
use super::platform::{BlePlatform, Permissions};
use super::protocol::{TransferFrame, TransferSession};
use super::reassembler::InboundRouter;
use super::scanner::{DiscoveryListener, ScannerController};
use super::SendReport;
use crate::storage::ImageSink;

/// Active radio role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Idle,
    Central,
    Peripheral,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Central => "central",
            Self::Peripheral => "peripheral",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "idle" | "none" => Ok(Self::Idle),
            "central" | "c" => Ok(Self::Central),
            "peripheral" | "p" => Ok(Self::Peripheral),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Role shared with the engines that check it.
pub type SharedRole = Arc<RwLock<Role>>;

/// Pacing of outbound image frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTiming {
    pub chunk_size: usize,
    pub start_delay: Duration,
    pub chunk_delay: Duration,
    pub end_delay: Duration,
}

impl Default for TransferTiming {
    fn default() -> Self {
        Self {
            chunk_size: transfer::IMAGE_CHUNK_SIZE,
            start_delay: Duration::from_millis(transfer::START_DELAY_MS),
            chunk_delay: Duration::from_millis(transfer::CHUNK_DELAY_MS),
            end_delay: Duration::from_millis(transfer::END_DELAY_MS),
        }
    }
}

/// Engine options, usually built from the application config.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub profile: ProfileKind,
    pub device_name: String,
    pub local_identifier: String,
    pub advertise_identifier: bool,
    pub manufacturer_id: u16,
    pub identifier_handshake: bool,
    pub auto_advertise: bool,
    pub auto_connect: bool,
    pub scan_timeout: Option<Duration>,
    pub transfer: TransferTiming,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            profile: ProfileKind::Combined,
            device_name: "ble-duplex".to_string(),
            local_identifier: DEFAULT_LOCAL_IDENTIFIER.to_string(),
            advertise_identifier: true,
            manufacturer_id: advertising::DEFAULT_MANUFACTURER_ID,
            identifier_handshake: false,
            auto_advertise: true,
            auto_connect: false,
            scan_timeout: None,
            transfer: TransferTiming::default(),
        }
    }
}

/// Connects newly discovered peers while in the central role.
struct AutoConnect {
    client: GattClientEngine,
    events: EventSink,
}

impl DiscoveryListener for AutoConnect {
    fn on_peer_discovered(&self, peer: &DiscoveredPeer) {
        if let Err(e) = self.client.connect(&peer.connect_identity()) {
            debug!("Auto-connect to {} skipped: {}", peer.identity, e);
            if !matches!(e, BleError::AlreadyActive(_)) {
                self.events.error(e);
            }
        }
    }
}

/// Owns every engine and enforces that only one role's resources are live.
pub struct RoleCoordinator {
    role: SharedRole,
    /// Held while one role's resources are released and the next is set.
    switching: tokio::sync::Mutex<()>,
    epoch: AtomicU64,
    identity: Arc<LocalIdentity>,
    advertiser: AdvertiserController,
    server: GattServerEngine,
    scanner: ScannerController,
    client: GattClientEngine,
    router: Arc<InboundRouter>,
    events: EventSink,
    auto_advertise: bool,
    transfer: TransferTiming,
}

impl RoleCoordinator {
    pub fn new(
        platform: Arc<dyn BlePlatform>,
        permissions: Arc<dyn Permissions>,
        images: Arc<dyn ImageSink>,
        events: EventSink,
        options: EngineOptions,
    ) -> Self {
        let profile = GattProfile::from_kind(options.profile);
        let role: SharedRole = Arc::new(RwLock::new(Role::Idle));
        let identity = Arc::new(LocalIdentity::new(
            options.device_name.clone(),
            options.local_identifier.clone(),
        ));
        let router = Arc::new(InboundRouter::new(images, events.clone()));

        let server = GattServerEngine::new(
            platform.clone(),
            profile.clone(),
            identity.clone(),
            router.clone(),
            events.clone(),
        );
        let advertiser = AdvertiserController::new(
            platform.clone(),
            permissions.clone(),
            server.clone(),
            identity.clone(),
            events.clone(),
            options.manufacturer_id,
            options.advertise_identifier,
        );
        let scanner = ScannerController::new(
            platform.clone(),
            permissions.clone(),
            events.clone(),
            profile.service_uuid,
            options.manufacturer_id,
            options.scan_timeout,
        );
        let client = GattClientEngine::new(
            platform,
            permissions,
            profile,
            identity.clone(),
            router.clone(),
            events.clone(),
            role.clone(),
            options.identifier_handshake,
        );

        if options.auto_connect {
            scanner.set_listener(Some(Arc::new(AutoConnect {
                client: client.clone(),
                events: events.clone(),
            })));
        }

        Self {
            role,
            switching: tokio::sync::Mutex::new(()),
            epoch: AtomicU64::new(0),
            identity,
            advertiser,
            server,
            scanner,
            client,
            router,
            events,
            auto_advertise: options.auto_advertise,
            transfer: options.transfer,
        }
    }

    pub fn role(&self) -> Role {
        *self.role.read()
    }

    /// Switch roles, releasing everything the previous role held first.
    pub async fn set_role(&self, next: Role) {
        let previous = self.role();
        if previous == next {
            return;
        }

        {
            let _switching = self.switching.lock().await;
            if self.role() == next {
                return;
            }
            self.epoch.fetch_add(1, Ordering::SeqCst);
            self.release_all();
            *self.role.write() = next;

            match next {
                Role::Peripheral => self.scanner.clear_discovered(),
                Role::Central => self.server.teardown(),
                Role::Idle => {}
            }
        }

        self.events
            .log(format!("Role changed: {} -> {}", previous, next));
        self.events.emit(BleEvent::RoleChanged(next));

        if next == Role::Peripheral && self.auto_advertise {
            let _ = self.report(self.advertiser.start_advertising().await);
        }
    }

    fn release_all(&self) {
        self.advertiser.stop_advertising();
        self.server.teardown();
        self.scanner.stop_scan();
        self.client.disconnect_all();
        self.router.reset();
    }

    fn require(&self, required: Role) -> BleResult<()> {
        let current = self.role();
        if current == required {
            Ok(())
        } else {
            Err(BleError::RoleMismatch { required, current })
        }
    }

    fn report<T>(&self, result: BleResult<T>) -> BleResult<T> {
        match &result {
            Err(BleError::Cancelled(what)) => debug!("{} cancelled by a role change", what),
            Err(e) => self.events.error(e.clone()),
            Ok(_) => {}
        }
        result
    }

    pub fn start_scan(&self, timeout: Option<Duration>) -> BleResult<()> {
        let result = self
            .require(Role::Central)
            .and_then(|_| self.scanner.start_scan(timeout));
        self.report(result)
    }

    pub fn stop_scan(&self) {
        self.scanner.stop_scan();
    }

    pub async fn start_advertising(&self) -> BleResult<()> {
        let result = match self.require(Role::Peripheral) {
            Ok(()) => self.advertiser.start_advertising().await,
            Err(e) => Err(e),
        };
        self.report(result)
    }

    pub fn stop_advertising(&self) {
        self.advertiser.stop_advertising();
    }

    /// Connect to a discovered peer by identifier, address or name.
    pub fn connect(&self, key: &str) -> BleResult<()> {
        let result = self.require(Role::Central).and_then(|_| {
            let peer = self
                .scanner
                .find(key)
                .ok_or_else(|| BleError::ResourceUnavailable(format!("Peer {}", key)))?;
            self.client.connect(&peer.connect_identity())
        });
        self.report(result)
    }

    pub fn disconnect_all(&self) {
        self.client.disconnect_all();
    }

    /// Send text to connected peers (central) or clients (peripheral).
    pub fn send_message(
        &self,
        text: &str,
        targets: Option<&[String]>,
        as_identifier: bool,
    ) -> BleResult<SendReport> {
        let result = match self.role() {
            Role::Central => self
                .client
                .send_to_peers(text.as_bytes(), targets, as_identifier),
            Role::Peripheral => self.server.send_to_clients(text.as_bytes()),
            Role::Idle => Err(BleError::RoleMismatch {
                required: Role::Central,
                current: Role::Idle,
            }),
        };
        if let Ok(report) = &result {
            debug!("Message queued for {} peers", report.queued.len());
        }
        self.report(result)
    }

    /// Send an identifier to peers (central) or update the value the local
    /// bidirectional characteristic answers with.
    pub fn send_identifier(&self, identifier: &str) -> BleResult<SendReport> {
        match self.role() {
            Role::Central => self.send_message(identifier, None, true),
            _ => {
                self.identity.set_identifier(identifier);
                self.events
                    .log(format!("Local identifier set to {}", identifier));
                Ok(SendReport::default())
            }
        }
    }

    /// Send an image as START, chunks and END with the configured pacing.
    ///
    /// Stops at the first frame no peer accepted, or when the role changes.
    pub async fn send_image(&self, bytes: &[u8]) -> BleResult<usize> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let session = TransferSession::new(bytes, self.transfer.chunk_size);
        let count = session.chunk_count();
        self.events.log(format!(
            "Sending image: {} bytes in {} chunks",
            bytes.len(),
            count
        ));

        for frame in session.frames() {
            if frame == TransferFrame::ImageEnd && !self.transfer.end_delay.is_zero() {
                tokio::time::sleep(self.transfer.end_delay).await;
            }
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return self.report(Err(BleError::Cancelled("Image transfer".to_string())));
            }

            let report = self.send_message(&frame.encode(), None, false)?;
            if report.queued.is_empty() {
                let error = report
                    .failed
                    .into_iter()
                    .next()
                    .map(|(_, e)| e)
                    .unwrap_or(BleError::NoConnectedPeers);
                return self.report(Err(error));
            }

            let delay = match frame {
                TransferFrame::ImageStart { .. } => self.transfer.start_delay,
                TransferFrame::ImageChunk { .. } => self.transfer.chunk_delay,
                _ => Duration::ZERO,
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        info!("Image sent: {} chunks", count);
        self.events.log("Image sent");
        Ok(count)
    }

    /// Release everything and return to idle.
    pub async fn shutdown(&self) {
        self.set_role(Role::Idle).await;
        self.server.teardown();
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_active()
    }

    pub fn is_advertising(&self) -> bool {
        self.advertiser.is_active()
    }

    pub fn discovered(&self) -> Vec<DiscoveredPeer> {
        self.scanner.discovered()
    }

    pub fn server(&self) -> &GattServerEngine {
        &self.server
    }

    pub fn client(&self) -> &GattClientEngine {
        &self.client
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::sim::{SimAir, SimPermissions};
    use crate::storage::MemoryImageSink;

    fn coordinator(air: &Arc<SimAir>, address: &str, options: EngineOptions) -> (RoleCoordinator, tokio::sync::mpsc::UnboundedReceiver<BleEvent>) {
        let platform = air.device(address, Some(options.device_name.as_str()));
        let (events, rx) = EventSink::channel();
        (
            RoleCoordinator::new(
                platform,
                Arc::new(SimPermissions::default()),
                Arc::new(MemoryImageSink::default()),
                events,
                options,
            ),
            rx,
        )
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("Central".parse::<Role>(), Ok(Role::Central));
        assert_eq!("p".parse::<Role>(), Ok(Role::Peripheral));
        assert!("router".parse::<Role>().is_err());
    }

    #[tokio::test]
    async fn test_same_role_is_noop() {
        let air = SimAir::new();
        let (c, mut rx) = coordinator(&air, "00:00:00:00:00:01", EngineOptions::default());
        c.set_role(Role::Idle).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_peripheral_auto_advertises() {
        let air = SimAir::new();
        let (c, _rx) = coordinator(&air, "00:00:00:00:00:01", EngineOptions::default());
        c.set_role(Role::Peripheral).await;
        air.run_until_idle();
        assert!(c.is_advertising());
        assert!(c.server().is_provisioned());

        c.set_role(Role::Central).await;
        assert!(!c.is_advertising());
        assert!(!c.server().is_provisioned());
        assert!(!air.is_advertising("00:00:00:00:00:01"));
    }

    #[tokio::test]
    async fn test_auto_advertise_off() {
        let air = SimAir::new();
        let options = EngineOptions {
            auto_advertise: false,
            ..Default::default()
        };
        let (c, _rx) = coordinator(&air, "00:00:00:00:00:01", options);
        c.set_role(Role::Peripheral).await;
        air.run_until_idle();
        assert!(!c.is_advertising());
    }

    #[tokio::test]
    async fn test_commands_check_role() {
        let air = SimAir::new();
        let (c, _rx) = coordinator(&air, "00:00:00:00:00:01", EngineOptions::default());
        assert!(matches!(
            c.start_scan(None),
            Err(BleError::RoleMismatch { .. })
        ));
        assert!(matches!(
            c.start_advertising().await,
            Err(BleError::RoleMismatch { .. })
        ));
        assert!(matches!(
            c.send_message("hi", None, false),
            Err(BleError::RoleMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_identifier_in_peripheral_role() {
        let air = SimAir::new();
        let (c, _rx) = coordinator(&air, "00:00:00:00:00:01", EngineOptions::default());
        c.set_role(Role::Peripheral).await;
        c.send_identifier("01099999999").unwrap();
        assert_eq!(c.identity().identifier(), "01099999999");
    }
}
