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

//! Peripheral-side GATT server engine.

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ble_constants::CCCD_UUID;
use super::error::{BleError, BleResult};
use super::events::{BleEvent, EventSink};
use super::gatt::{
    CharProperties, CharRole, GattProfile, GattResponse, GattStatus, LinkState, SubscriptionState,
};
use super::peers::{ConnectedClient, LocalIdentity, PeerIdentity, PeerTable};
use super::platform::{
    BlePlatform, DescriptorWriteRequest, GattServerCallback, GattServerHandle, WriteRequest,
};
use super::reassembler::InboundRouter;
use super::SendReport;

/// Shared state for the GATT server.
struct ServerState {
    platform: Arc<dyn BlePlatform>,
    profile: GattProfile,
    identity: Arc<LocalIdentity>,
    router: Arc<InboundRouter>,
    events: EventSink,
    server: Mutex<Option<Arc<dyn GattServerHandle>>>,
    provisioning: tokio::sync::Mutex<()>,
    /// Bumped by every teardown; a provision started before one is void.
    epoch: AtomicU64,
    clients: PeerTable<ConnectedClient>,
    notify_value: Mutex<Vec<u8>>,
}

impl ServerState {
    fn emit_clients(&self) {
        self.events
            .emit(BleEvent::ConnectedClientsUpdated(self.clients.snapshot()));
    }

    fn read_value(&self, role: CharRole) -> Option<Vec<u8>> {
        match role {
            CharRole::Read => {
                let now = Utc::now().timestamp_millis();
                Some(format!("Time: {}", now).into_bytes())
            }
            CharRole::Bidirectional => Some(self.identity.identifier().into_bytes()),
            CharRole::Notify => Some(self.notify_value.lock().clone()),
            CharRole::Write => None,
        }
    }
}

impl GattServerCallback for ServerState {
    fn on_connection_state_change(&self, device: &PeerIdentity, status: GattStatus, state: LinkState) {
        match state {
            LinkState::Connected => {
                self.clients.insert(
                    device.address.clone(),
                    ConnectedClient {
                        identity: device.clone(),
                    },
                );
                self.events.log(format!(
                    "Client connected: {} (status {}), {} total",
                    device,
                    status,
                    self.clients.len()
                ));
                self.emit_clients();
            }
            LinkState::Disconnected => {
                self.router.forget(device);
                if self.clients.remove(&device.address).is_some() {
                    self.events.log(format!(
                        "Client disconnected: {}, {} remaining",
                        device,
                        self.clients.len()
                    ));
                    self.emit_clients();
                }
            }
            LinkState::Connecting | LinkState::Disconnecting => {}
        }
    }

    fn on_characteristic_read_request(
        &self,
        device: &PeerIdentity,
        _request_id: u32,
        offset: u16,
        characteristic: Uuid,
    ) -> GattResponse {
        debug!("Read request from {} for {} at offset {}", device, characteristic, offset);

        let Some(role) = self.profile.role_of(characteristic) else {
            warn!("Read request for unknown characteristic {}", characteristic);
            return GattResponse::failure();
        };
        let Some(value) = self.read_value(role) else {
            return GattResponse::with_status(GattStatus::READ_NOT_PERMITTED);
        };

        let start = offset as usize;
        if start > value.len() {
            return GattResponse::with_status(GattStatus::INVALID_OFFSET);
        }
        GattResponse {
            status: GattStatus::SUCCESS,
            offset,
            value: value[start..].to_vec(),
        }
    }

    fn on_characteristic_write_request(
        &self,
        device: &PeerIdentity,
        request: WriteRequest,
    ) -> Option<GattResponse> {
        debug!(
            "Write request from {} for {}: {} bytes (response needed: {})",
            device,
            request.characteristic,
            request.value.len(),
            request.response_needed
        );

        let status = match self.profile.role_of(request.characteristic) {
            Some(CharRole::Write) | Some(CharRole::Read) => {
                self.router.handle_bytes(device, &request.value);
                GattStatus::SUCCESS
            }
            Some(CharRole::Bidirectional) => {
                match String::from_utf8(request.value.clone()) {
                    Ok(identifier) => {
                        self.events
                            .log(format!("Identifier received from {}: {}", device, identifier));
                        self.events.emit(BleEvent::IdentifierReceived {
                            identifier,
                            sender: device.clone(),
                        });
                    }
                    Err(e) => warn!("Dropping non-UTF-8 identifier from {}: {}", device, e),
                }
                GattStatus::SUCCESS
            }
            Some(CharRole::Notify) | None => {
                self.events
                    .error(BleError::UnknownCharacteristic(request.characteristic));
                GattStatus::FAILURE
            }
        };

        request.response_needed.then(|| GattResponse {
            status,
            offset: request.offset,
            value: request.value,
        })
    }

    fn on_descriptor_write_request(
        &self,
        device: &PeerIdentity,
        request: DescriptorWriteRequest,
    ) -> Option<GattResponse> {
        let status = if request.descriptor == CCCD_UUID {
            let state = SubscriptionState::from_cccd(&request.value);
            self.events.log(format!(
                "{} set {:?} on {}",
                device, state, request.characteristic
            ));
            self.events.emit(BleEvent::SubscriptionChanged {
                device: device.clone(),
                characteristic: request.characteristic,
                state,
            });
            GattStatus::SUCCESS
        } else {
            warn!("Write to unknown descriptor {}", request.descriptor);
            GattStatus::FAILURE
        };

        request
            .response_needed
            .then(|| GattResponse::with_status(status))
    }

    fn on_notification_sent(&self, device: &PeerIdentity, status: GattStatus) {
        debug!("Notification to {}: {}", device, status);
        self.events.emit(BleEvent::NotificationSent {
            device: device.clone(),
            success: status.is_success(),
        });
    }
}

/// GATT server engine. Cloning shares the same server.
#[derive(Clone)]
pub struct GattServerEngine {
    state: Arc<ServerState>,
}

impl GattServerEngine {
    pub fn new(
        platform: Arc<dyn BlePlatform>,
        profile: GattProfile,
        identity: Arc<LocalIdentity>,
        router: Arc<InboundRouter>,
        events: EventSink,
    ) -> Self {
        Self {
            state: Arc::new(ServerState {
                platform,
                profile,
                identity,
                router,
                events,
                server: Mutex::new(None),
                provisioning: tokio::sync::Mutex::new(()),
                epoch: AtomicU64::new(0),
                clients: PeerTable::new(),
                notify_value: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Open the server and register the service. Does nothing when the
    /// server is already up.
    /// A teardown that lands while this is in flight cancels it: the new
    /// server is closed instead of stored.
    pub async fn provision(&self) -> BleResult<()> {
        let epoch = self.state.epoch.load(Ordering::SeqCst);
        let _guard = self.state.provisioning.lock().await;
        if self.state.epoch.load(Ordering::SeqCst) != epoch {
            return Err(BleError::Cancelled("GATT server setup".to_string()));
        }
        if self.is_provisioned() {
            return Ok(());
        }

        let callback: Arc<dyn GattServerCallback> = self.state.clone();
        let server = self
            .state
            .platform
            .open_gatt_server(callback)
            .ok_or_else(|| BleError::ResourceUnavailable("GATT server".to_string()))?;

        let service = self.state.profile.service_definition();
        let characteristics = service.characteristics.len();
        if let Err(e) = server.add_service(service).await {
            server.close();
            self.state
                .events
                .log(format!("Failed to add GATT service: {}", e));
            return Err(e);
        }

        {
            let mut slot = self.state.server.lock();
            if self.state.epoch.load(Ordering::SeqCst) != epoch {
                drop(slot);
                server.close();
                info!("GATT server setup cancelled by teardown");
                return Err(BleError::Cancelled("GATT server setup".to_string()));
            }
            *slot = Some(server);
        }
        self.state.events.log(format!(
            "GATT server ready: service {} with {} characteristics",
            self.state.profile.service_uuid, characteristics
        ));
        Ok(())
    }

    pub fn is_provisioned(&self) -> bool {
        self.state.server.lock().is_some()
    }

    /// Notify every connected client with `payload`.
    pub fn send_to_clients(&self, payload: &[u8]) -> BleResult<SendReport> {
        let server = self
            .state
            .server
            .lock()
            .clone()
            .ok_or(BleError::NotProvisioned)?;
        let spec = self
            .state
            .profile
            .spec(CharRole::Notify)
            .ok_or_else(|| BleError::CharacteristicUnavailable("notify".to_string()))?;

        let clients = self.state.clients.snapshot();
        if clients.is_empty() {
            return Err(BleError::NoConnectedPeers);
        }

        *self.state.notify_value.lock() = payload.to_vec();
        if !server.set_value(spec.uuid, payload.to_vec()) {
            return Err(BleError::CharacteristicUnavailable("notify".to_string()));
        }

        let confirm = spec.properties.contains(CharProperties::INDICATE)
            && !spec.properties.contains(CharProperties::NOTIFY);

        let mut report = SendReport::default();
        for client in clients {
            if server.notify_characteristic_changed(&client.identity, spec.uuid, confirm) {
                report.queued.push(client.identity.address.clone());
            } else {
                warn!("Notification to {} was not queued", client.identity);
                report.failed.push((
                    client.identity.address.clone(),
                    BleError::WriteFailure {
                        peer: client.identity.address.clone(),
                        status: GattStatus::FAILURE,
                    },
                ));
            }
        }

        info!(
            "Notified {} of {} clients ({} bytes)",
            report.queued.len(),
            report.queued.len() + report.failed.len(),
            payload.len()
        );
        Ok(report)
    }

    /// Close the server and forget every client. Safe to call repeatedly.
    pub fn teardown(&self) {
        let server = {
            let mut slot = self.state.server.lock();
            self.state.epoch.fetch_add(1, Ordering::SeqCst);
            slot.take()
        };
        if let Some(server) = server {
            server.close();
            self.state.events.log("GATT server closed");
        }
        self.state.clients.clear();
        self.state.emit_clients();
    }

    pub fn clients(&self) -> Vec<ConnectedClient> {
        self.state.clients.snapshot()
    }

    pub fn profile(&self) -> &GattProfile {
        &self.state.profile
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::ble_constants;
    use crate::bluetooth::platform::GattLink;
    use crate::bluetooth::sim::{ClientLog, SimAir};
    use crate::storage::MemoryImageSink;

    fn engine(air: &Arc<SimAir>) -> (GattServerEngine, tokio::sync::mpsc::UnboundedReceiver<BleEvent>) {
        let platform = air.device("00:00:00:00:00:01", Some("peripheral"));
        let (events, rx) = EventSink::channel();
        let router = Arc::new(InboundRouter::new(
            Arc::new(MemoryImageSink::default()),
            events.clone(),
        ));
        let identity = Arc::new(LocalIdentity::new("peripheral", "01000000000"));
        (
            GattServerEngine::new(platform, GattProfile::combined(), identity, router, events),
            rx,
        )
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<BleEvent>) -> Vec<BleEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn test_provision_is_idempotent() {
        let air = SimAir::new();
        let (server, _rx) = engine(&air);
        server.provision().await.unwrap();
        server.provision().await.unwrap();
        assert!(server.is_provisioned());
        assert_eq!(air.services_of("00:00:00:00:00:01").len(), 1);
    }

    #[tokio::test]
    async fn test_failed_add_service_allows_retry() {
        let air = SimAir::new();
        let (server, _rx) = engine(&air);
        let platform = air.platform("00:00:00:00:00:01").unwrap();

        platform.fail_add_service(true);
        assert!(server.provision().await.is_err());
        assert!(!server.is_provisioned());

        platform.fail_add_service(false);
        server.provision().await.unwrap();
        assert!(server.is_provisioned());
    }

    #[tokio::test]
    async fn test_teardown_cancels_inflight_provision() {
        let air = SimAir::new();
        let (server, _rx) = engine(&air);
        let gate = air.platform("00:00:00:00:00:01").unwrap().hold_add_service();

        let pending = {
            let server = server.clone();
            tokio::spawn(async move { server.provision().await })
        };
        while !air.has_server("00:00:00:00:00:01") {
            tokio::task::yield_now().await;
        }

        server.teardown();
        gate.notify_one();
        assert_eq!(
            pending.await.unwrap(),
            Err(BleError::Cancelled("GATT server setup".to_string()))
        );
        assert!(!server.is_provisioned());
        assert!(!air.has_server("00:00:00:00:00:01"));

        server.provision().await.unwrap();
        assert!(server.is_provisioned());
    }

    #[tokio::test]
    async fn test_send_without_clients_fails_locally() {
        let air = SimAir::new();
        let (server, _rx) = engine(&air);
        assert_eq!(server.send_to_clients(b"hi"), Err(BleError::NotProvisioned));

        server.provision().await.unwrap();
        assert_eq!(server.send_to_clients(b"hi"), Err(BleError::NoConnectedPeers));
        assert_eq!(
            air.value_of("00:00:00:00:00:01", ble_constants::NOTIFY_UUID),
            None
        );
    }

    #[tokio::test]
    async fn test_reads_and_writes() {
        let air = SimAir::new();
        let (server, mut rx) = engine(&air);
        server.provision().await.unwrap();

        let central = air.device("00:00:00:00:00:02", Some("central"));
        let log = Arc::new(ClientLog::default());
        let peripheral = PeerIdentity::new("00:00:00:00:00:01", Some("peripheral".to_string()));
        let link = central.gatt_link(&peripheral, log.clone()).unwrap();
        assert!(link.connect());
        air.run_until_idle();
        assert_eq!(server.clients().len(), 1);

        let svc = ble_constants::SERVICE_UUID;
        link.read_characteristic(svc, ble_constants::BIDIRECTIONAL_UUID);
        link.read_characteristic(svc, ble_constants::READ_UUID);
        link.write_characteristic(
            svc,
            ble_constants::WRITE_UUID,
            b"hello".to_vec(),
            crate::bluetooth::gatt::WriteType::Default,
        );
        link.set_notification(svc, ble_constants::NOTIFY_UUID, true);
        air.run_until_idle();

        let reads = log.reads();
        assert_eq!(reads[0].1, b"01000000000".to_vec());
        assert!(String::from_utf8_lossy(&reads[1].1).starts_with("Time: "));
        assert_eq!(
            log.writes(),
            vec![(ble_constants::WRITE_UUID, GattStatus::SUCCESS)]
        );

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            BleEvent::InboundMessage { text, .. } if text == "hello"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            BleEvent::SubscriptionChanged { state: SubscriptionState::Notifications, .. }
        )));

        server.send_to_clients(b"pong").unwrap();
        air.run_until_idle();
        assert_eq!(
            log.changed(),
            vec![(ble_constants::NOTIFY_UUID, b"pong".to_vec())]
        );
    }

    #[test]
    fn test_read_offsets() {
        let air = SimAir::new();
        let (server, _rx) = engine(&air);
        let device = PeerIdentity::new("AA", None);
        let state = &server.state;

        let resp = state.on_characteristic_read_request(&device, 1, 2, ble_constants::BIDIRECTIONAL_UUID);
        assert_eq!(resp.value, b"000000000".to_vec());

        let resp = state.on_characteristic_read_request(&device, 1, 12, ble_constants::BIDIRECTIONAL_UUID);
        assert_eq!(resp.status, GattStatus::INVALID_OFFSET);

        let resp = state.on_characteristic_read_request(&device, 1, 0, Uuid::nil());
        assert_eq!(resp, GattResponse::failure());
    }

    #[test]
    fn test_unknown_write_fails() {
        let air = SimAir::new();
        let (server, mut rx) = engine(&air);
        let device = PeerIdentity::new("AA", None);

        let request = WriteRequest {
            request_id: 7,
            characteristic: Uuid::nil(),
            value: b"x".to_vec(),
            offset: 0,
            response_needed: true,
            prepared: false,
        };
        let resp = server
            .state
            .on_characteristic_write_request(&device, request.clone());
        assert_eq!(resp.map(|r| r.status), Some(GattStatus::FAILURE));

        let resp = server.state.on_characteristic_write_request(
            &device,
            WriteRequest {
                response_needed: false,
                ..request
            },
        );
        assert!(resp.is_none());
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, BleEvent::Error(BleError::UnknownCharacteristic(_)))));
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let air = SimAir::new();
        let (server, mut rx) = engine(&air);
        server.teardown();
        server.teardown();
        let empties = drain(&mut rx)
            .into_iter()
            .filter(|e| *e == BleEvent::ConnectedClientsUpdated(Vec::new()))
            .count();
        assert_eq!(empties, 2);
    }
}
