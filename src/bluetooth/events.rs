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

//! Events emitted by the BLE engines to the host.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use super::coordinator::Role;
use super::error::BleError;
use super::gatt::SubscriptionState;
use super::peers::{ConnectedClient, ConnectedPeerView, DiscoveredPeer, PeerIdentity};

/// Host-facing event stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum BleEvent {
    RoleChanged(Role),
    ScanningStateChanged(bool),
    AdvertisingStateChanged(bool),
    DiscoveredPeersUpdated(Vec<DiscoveredPeer>),
    ConnectedPeersUpdated(Vec<ConnectedPeerView>),
    ConnectedClientsUpdated(Vec<ConnectedClient>),
    Log(String),
    /// Text message received on a message characteristic.
    InboundMessage { text: String, sender: PeerIdentity },
    /// Identifier written to the local bidirectional characteristic.
    IdentifierReceived { identifier: String, sender: PeerIdentity },
    /// Identifier read back from a connected peripheral.
    PeerIdentifier { identifier: String, peer: PeerIdentity },
    /// A write to a peer completed successfully.
    MessageDelivered { peer: PeerIdentity, characteristic: Uuid },
    SubscriptionChanged {
        device: PeerIdentity,
        characteristic: Uuid,
        state: SubscriptionState,
    },
    NotificationSent { device: PeerIdentity, success: bool },
    ImageReceived {
        sender: PeerIdentity,
        location: String,
        size: usize,
    },
    Error(BleError),
}

/// Cloneable sender side of the event channel.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<BleEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<BleEvent>) -> Self {
        Self { tx }
    }

    /// Create a sink together with its receiver.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BleEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Send an event. A closed channel is ignored.
    pub fn emit(&self, event: BleEvent) {
        let _ = self.tx.send(event);
    }

    /// Log locally and forward the line to the host.
    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        self.emit(BleEvent::Log(message));
    }

    pub fn error(&self, error: BleError) {
        tracing::warn!("{}", error);
        self.emit(BleEvent::Error(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_forwards_logs() {
        let (sink, mut rx) = EventSink::channel();
        sink.log("Scanning started");
        sink.error(BleError::NoConnectedPeers);

        assert_eq!(
            rx.try_recv().ok(),
            Some(BleEvent::Log("Scanning started".to_string()))
        );
        assert_eq!(
            rx.try_recv().ok(),
            Some(BleEvent::Error(BleError::NoConnectedPeers))
        );
    }

    #[test]
    fn test_closed_channel_is_ignored() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.emit(BleEvent::ScanningStateChanged(true));
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_string(&BleEvent::AdvertisingStateChanged(true)).unwrap_or_default();
        assert_eq!(json, r#"{"event":"advertising_state_changed","data":true}"#);
    }
}
