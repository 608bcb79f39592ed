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

//! Central-side GATT client engine.
//!
//! Each link gets its own callback bound to the peer's connection key, so
//! events for one peer are handled in the order the platform delivers them.

use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::coordinator::{Role, SharedRole};
use super::error::{BleError, BleResult};
use super::events::{BleEvent, EventSink};
use super::gatt::{CharRole, GattProfile, GattStatus, LinkState, RemoteCharacteristic, RemoteService, WriteType};
use super::peers::{ConnectedPeer, ConnectedPeerView, LocalIdentity, PeerIdentity, PeerTable};
use super::platform::{BlePlatform, Capability, GattClientCallback, Permissions};
use super::reassembler::InboundRouter;
use super::SendReport;

struct ClientInner {
    platform: Arc<dyn BlePlatform>,
    permissions: Arc<dyn Permissions>,
    profile: GattProfile,
    identity: Arc<LocalIdentity>,
    router: Arc<InboundRouter>,
    events: EventSink,
    role: SharedRole,
    identifier_handshake: bool,
    peers: PeerTable<ConnectedPeer>,
}

impl ClientInner {
    fn emit_peers(&self) {
        let views: Vec<ConnectedPeerView> =
            self.peers.snapshot().iter().map(ConnectedPeer::view).collect();
        self.events.emit(BleEvent::ConnectedPeersUpdated(views));
    }

    fn release(&self, key: &str) -> Option<ConnectedPeer> {
        let peer = self.peers.remove(key)?;
        peer.link.close();
        self.router.forget(&peer.identity);
        self.emit_peers();
        Some(peer)
    }

    fn on_connected(&self, key: &str) {
        let Some(peer) = self.peers.update(key, |p| {
            p.connected = true;
            p.clone()
        }) else {
            return;
        };
        self.events.log(format!("Connected to {}", peer.identity));
        self.emit_peers();

        if !peer.link.discover_services() {
            self.events.error(BleError::DiscoveryFailure {
                peer: peer.identity.address.clone(),
                status: GattStatus::FAILURE,
            });
        }
    }

    fn on_services(&self, key: &str, services: Vec<RemoteService>) {
        let Some(service) = services
            .into_iter()
            .find(|s| s.uuid == self.profile.service_uuid)
        else {
            if let Some(peer) = self.peers.get(key) {
                self.events.error(BleError::ServiceNotFound {
                    peer: peer.identity.address,
                });
            }
            return;
        };

        let lookup = |role: CharRole| -> Option<RemoteCharacteristic> {
            self.profile
                .uuid_of(role)
                .and_then(|uuid| service.characteristic(uuid).cloned())
        };
        let bidirectional = lookup(CharRole::Bidirectional);
        let write = lookup(CharRole::Write);
        let read = lookup(CharRole::Read);
        let notify = lookup(CharRole::Notify);

        let Some(peer) = self.peers.update(key, |p| {
            p.bidirectional = bidirectional.clone();
            p.write = write.clone();
            p.read = read.clone();
            p.notify = notify.clone();
            p.clone()
        }) else {
            return;
        };

        self.events.log(format!(
            "Services discovered on {}: bidirectional={} write={} read={} notify={}",
            peer.identity,
            bidirectional.is_some(),
            write.is_some(),
            read.is_some(),
            notify.is_some()
        ));
        self.emit_peers();

        if let Some(notify) = &notify {
            if !peer.link.set_notification(notify.service, notify.uuid, true) {
                warn!("Could not enable notifications on {}", peer.identity);
            }
        }

        if self.identifier_handshake {
            if let Some(bidirectional) = &bidirectional {
                let identifier = self.identity.identifier();
                debug!("Sending identifier {} to {}", identifier, peer.identity);
                peer.link.write_characteristic(
                    bidirectional.service,
                    bidirectional.uuid,
                    identifier.into_bytes(),
                    WriteType::Default,
                );
            }
        }
    }

    fn on_write(&self, key: &str, characteristic: Uuid, status: GattStatus) {
        let Some(peer) = self.peers.get(key) else {
            return;
        };

        if !status.is_success() {
            self.events.error(BleError::WriteFailure {
                peer: peer.identity.address.clone(),
                status,
            });
            return;
        }

        self.events.emit(BleEvent::MessageDelivered {
            peer: peer.identity.clone(),
            characteristic,
        });

        // Identifier writes are followed by a read of the same characteristic
        if let Some(bidirectional) = peer
            .bidirectional
            .as_ref()
            .filter(|c| c.uuid == characteristic)
        {
            peer.link
                .read_characteristic(bidirectional.service, bidirectional.uuid);
        }
    }

    fn on_read(&self, key: &str, characteristic: Uuid, value: Vec<u8>, status: GattStatus) {
        let Some(peer) = self.peers.get(key) else {
            return;
        };

        if !status.is_success() {
            self.events.error(BleError::ReadFailure {
                peer: peer.identity.address.clone(),
                status,
            });
            return;
        }

        match self.profile.role_of(characteristic) {
            Some(CharRole::Bidirectional) => {
                let identifier = match String::from_utf8(value) {
                    Ok(identifier) => identifier,
                    Err(e) => {
                        warn!("Dropping non-UTF-8 identifier from {}: {}", peer.identity, e);
                        return;
                    }
                };
                self.peers
                    .update(key, |p| p.identifier = Some(identifier.clone()));
                self.events
                    .log(format!("Identifier of {}: {}", peer.identity, identifier));
                self.events.emit(BleEvent::PeerIdentifier {
                    identifier,
                    peer: peer.identity.clone(),
                });
                self.emit_peers();
            }
            _ => {
                self.events.log(format!(
                    "Read from {}: {}",
                    peer.identity,
                    String::from_utf8_lossy(&value)
                ));
            }
        }
    }
}

/// Callback bound to one connection.
struct LinkCallback {
    inner: Weak<ClientInner>,
    key: String,
}

impl GattClientCallback for LinkCallback {
    fn on_connection_state_change(&self, device: &PeerIdentity, status: GattStatus, state: LinkState) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        match state {
            LinkState::Connected if status.is_success() => inner.on_connected(&self.key),
            LinkState::Connected | LinkState::Disconnected => {
                let Some(peer) = inner.release(&self.key) else {
                    return;
                };
                if peer.connected {
                    inner.events.log(format!("Disconnected from {}", device));
                } else {
                    inner.events.error(BleError::ConnectionFailure {
                        peer: device.address.clone(),
                        status,
                    });
                }
            }
            LinkState::Connecting | LinkState::Disconnecting => {}
        }
    }

    fn on_services_discovered(
        &self,
        device: &PeerIdentity,
        status: GattStatus,
        services: Vec<RemoteService>,
    ) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if !status.is_success() {
            inner.events.error(BleError::DiscoveryFailure {
                peer: device.address.clone(),
                status,
            });
            return;
        }
        inner.on_services(&self.key, services);
    }

    fn on_characteristic_write(&self, _device: &PeerIdentity, characteristic: Uuid, status: GattStatus) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_write(&self.key, characteristic, status);
        }
    }

    fn on_characteristic_read(
        &self,
        _device: &PeerIdentity,
        characteristic: Uuid,
        value: Vec<u8>,
        status: GattStatus,
    ) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_read(&self.key, characteristic, value, status);
        }
    }

    fn on_characteristic_changed(&self, device: &PeerIdentity, characteristic: Uuid, value: Vec<u8>) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        debug!("{} changed on {}: {} bytes", characteristic, device, value.len());
        let sender = inner
            .peers
            .get(&self.key)
            .map(|p| p.identity)
            .unwrap_or_else(|| device.clone());
        inner.router.handle_bytes(&sender, &value);
    }

    fn on_descriptor_write(&self, device: &PeerIdentity, characteristic: Uuid, status: GattStatus) {
        if status.is_success() {
            debug!("Notifications enabled for {} on {}", characteristic, device);
        } else {
            warn!(
                "Descriptor write for {} on {} failed: {}",
                characteristic, device, status
            );
        }
    }
}

/// GATT client engine. Cloning shares the same connections.
#[derive(Clone)]
pub struct GattClientEngine {
    inner: Arc<ClientInner>,
}

impl GattClientEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        platform: Arc<dyn BlePlatform>,
        permissions: Arc<dyn Permissions>,
        profile: GattProfile,
        identity: Arc<LocalIdentity>,
        router: Arc<InboundRouter>,
        events: EventSink,
        role: SharedRole,
        identifier_handshake: bool,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                platform,
                permissions,
                profile,
                identity,
                router,
                events,
                role,
                identifier_handshake,
                peers: PeerTable::new(),
            }),
        }
    }

    /// Open a connection. The outcome arrives as connection events.
    pub fn connect(&self, device: &PeerIdentity) -> BleResult<()> {
        let current = *self.inner.role.read();
        if current != Role::Central {
            return Err(BleError::RoleMismatch {
                required: Role::Central,
                current,
            });
        }
        if !self.inner.permissions.has_permission(Capability::Connect) {
            return Err(BleError::PermissionDenied(Capability::Connect));
        }

        let key = device.connection_key();
        if self.inner.peers.contains(&key) {
            return Err(BleError::AlreadyActive(format!("Connection to {}", key)));
        }

        let callback = Arc::new(LinkCallback {
            inner: Arc::downgrade(&self.inner),
            key: key.clone(),
        });
        let link = self
            .inner
            .platform
            .gatt_link(device, callback)
            .ok_or_else(|| BleError::ResourceUnavailable("GATT client".to_string()))?;

        if !self
            .inner
            .peers
            .insert_new(key.clone(), ConnectedPeer::new(device.clone(), link.clone()))
        {
            link.close();
            return Err(BleError::AlreadyActive(format!("Connection to {}", key)));
        }

        self.inner.events.log(format!("Connecting to {}", device));
        self.inner.emit_peers();

        if !link.connect() {
            self.inner.release(&key);
            return Err(BleError::ConnectionFailure {
                peer: device.address.clone(),
                status: GattStatus::FAILURE,
            });
        }
        Ok(())
    }

    /// Write `payload` to every connected peer, or to those whose
    /// identifier, name or address is listed in `targets`.
    pub fn send_to_peers(
        &self,
        payload: &[u8],
        targets: Option<&[String]>,
        as_identifier: bool,
    ) -> BleResult<SendReport> {
        let peers: Vec<ConnectedPeer> = self
            .inner
            .peers
            .snapshot()
            .into_iter()
            .filter(|p| p.connected)
            .filter(|p| match targets {
                Some(targets) => targets.iter().any(|t| {
                    p.identifier.as_deref() == Some(t.as_str())
                        || p.identity.name.as_deref() == Some(t.as_str())
                        || p.identity.address.eq_ignore_ascii_case(t)
                }),
                None => true,
            })
            .collect();

        if peers.is_empty() {
            return Err(BleError::NoConnectedPeers);
        }

        let mut report = SendReport::default();
        for peer in peers {
            let key = peer.identity.connection_key();
            let (characteristic, name) = if as_identifier {
                (peer.bidirectional.as_ref(), "bidirectional")
            } else {
                (peer.write.as_ref(), "write")
            };
            let Some(characteristic) = characteristic else {
                report
                    .failed
                    .push((key, BleError::CharacteristicUnavailable(name.to_string())));
                continue;
            };

            let write_type = if as_identifier {
                WriteType::Default
            } else {
                characteristic.preferred_write_type()
            };

            if peer.link.write_characteristic(
                characteristic.service,
                characteristic.uuid,
                payload.to_vec(),
                write_type,
            ) {
                report.queued.push(key);
            } else {
                report.failed.push((
                    key,
                    BleError::WriteFailure {
                        peer: peer.identity.address.clone(),
                        status: GattStatus::FAILURE,
                    },
                ));
            }
        }

        for (key, error) in &report.failed {
            warn!("Send to {} failed: {}", key, error);
        }
        Ok(report)
    }

    /// Disconnect and release every link.
    pub fn disconnect_all(&self) {
        let peers = self.inner.peers.drain();
        let count = peers.len();
        for peer in peers {
            peer.link.disconnect();
            peer.link.close();
            self.inner.router.forget(&peer.identity);
        }
        if count > 0 {
            info!("Disconnected {} peers", count);
        }
        self.inner.emit_peers();
    }

    pub fn peers(&self) -> Vec<ConnectedPeerView> {
        self.inner
            .peers
            .snapshot()
            .iter()
            .map(ConnectedPeer::view)
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.peers.len()
    }
}
