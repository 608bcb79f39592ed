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

//! Application state management.

use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::bluetooth::{
    BleEvent, ConnectedClient, ConnectedPeerView, DiscoveredPeer, PeerIdentity, Role,
};

/// Log lines kept for the `status` command.
const LOG_CAPACITY: usize = 200;

/// Last text message received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub sender: PeerIdentity,
    pub text: String,
}

/// Shared application state, mirrored from the engine event stream.
#[derive(Debug)]
pub struct AppState {
    pub role: RwLock<Role>,
    pub scanning: RwLock<bool>,
    pub advertising: RwLock<bool>,
    pub discovered: RwLock<Vec<DiscoveredPeer>>,
    pub peers: RwLock<Vec<ConnectedPeerView>>,
    pub clients: RwLock<Vec<ConnectedClient>>,
    pub last_message: RwLock<Option<ReceivedMessage>>,
    pub last_error: RwLock<Option<String>>,
    pub log: RwLock<VecDeque<String>>,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            role: RwLock::new(Role::Idle),
            scanning: RwLock::new(false),
            advertising: RwLock::new(false),
            discovered: RwLock::new(Vec::new()),
            peers: RwLock::new(Vec::new()),
            clients: RwLock::new(Vec::new()),
            last_message: RwLock::new(None),
            last_error: RwLock::new(None),
            log: RwLock::new(VecDeque::with_capacity(LOG_CAPACITY)),
        }
    }
}

impl AppState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fold one engine event into the state.
    pub fn apply(&self, event: &BleEvent) {
        match event {
            BleEvent::RoleChanged(role) => *self.role.write() = *role,
            BleEvent::ScanningStateChanged(on) => *self.scanning.write() = *on,
            BleEvent::AdvertisingStateChanged(on) => *self.advertising.write() = *on,
            BleEvent::DiscoveredPeersUpdated(peers) => *self.discovered.write() = peers.clone(),
            BleEvent::ConnectedPeersUpdated(peers) => *self.peers.write() = peers.clone(),
            BleEvent::ConnectedClientsUpdated(clients) => *self.clients.write() = clients.clone(),
            BleEvent::Log(line) => self.push_log(line.clone()),
            BleEvent::InboundMessage { text, sender } => {
                *self.last_message.write() = Some(ReceivedMessage {
                    sender: sender.clone(),
                    text: text.clone(),
                });
            }
            BleEvent::Error(e) => *self.last_error.write() = Some(e.to_string()),
            _ => {}
        }
    }

    fn push_log(&self, line: String) {
        let mut log = self.log.write();
        if log.len() == LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(line);
    }

    pub fn get_role(&self) -> Role {
        *self.role.read()
    }

    pub fn is_scanning(&self) -> bool {
        *self.scanning.read()
    }

    pub fn is_advertising(&self) -> bool {
        *self.advertising.read()
    }

    pub fn get_discovered(&self) -> Vec<DiscoveredPeer> {
        self.discovered.read().clone()
    }

    pub fn get_peers(&self) -> Vec<ConnectedPeerView> {
        self.peers.read().clone()
    }

    pub fn get_clients(&self) -> Vec<ConnectedClient> {
        self.clients.read().clone()
    }

    pub fn get_last_message(&self) -> Option<ReceivedMessage> {
        self.last_message.read().clone()
    }

    pub fn get_last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    pub fn recent_log(&self, count: usize) -> Vec<String> {
        let log = self.log.read();
        log.iter().skip(log.len().saturating_sub(count)).cloned().collect()
    }

    /// One-line summary of the current role and its connections.
    pub fn summary(&self) -> String {
        match self.get_role() {
            Role::Idle => "Idle".to_string(),
            Role::Peripheral => {
                let clients = self.clients.read();
                match clients.len() {
                    0 if self.is_advertising() => "Advertising - No connections".to_string(),
                    0 => "Peripheral mode".to_string(),
                    1 => format!("Connected: {}", clients[0].identity),
                    n => format!("Connected: {} clients", n),
                }
            }
            Role::Central => {
                let peers = self.peers.read();
                let connected = peers.iter().filter(|p| p.connected).count();
                match connected {
                    0 if self.is_scanning() => "Scanning...".to_string(),
                    0 => "Central mode".to_string(),
                    n => format!("Connected: {}", n),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::BleError;

    fn client(address: &str) -> ConnectedClient {
        ConnectedClient {
            identity: PeerIdentity::new(address, None),
        }
    }

    #[test]
    fn test_peripheral_summary() {
        let state = AppState::new();
        assert_eq!(state.summary(), "Idle");

        state.apply(&BleEvent::RoleChanged(Role::Peripheral));
        assert_eq!(state.summary(), "Peripheral mode");

        state.apply(&BleEvent::AdvertisingStateChanged(true));
        assert_eq!(state.summary(), "Advertising - No connections");

        state.apply(&BleEvent::ConnectedClientsUpdated(vec![client("A")]));
        assert_eq!(state.summary(), "Connected: A");

        state.apply(&BleEvent::ConnectedClientsUpdated(vec![client("A"), client("B")]));
        assert_eq!(state.summary(), "Connected: 2 clients");
    }

    #[test]
    fn test_log_is_bounded() {
        let state = AppState::new();
        for i in 0..(LOG_CAPACITY + 5) {
            state.apply(&BleEvent::Log(format!("line {}", i)));
        }
        assert_eq!(state.log.read().len(), LOG_CAPACITY);
        assert_eq!(
            state.recent_log(2),
            vec![
                format!("line {}", LOG_CAPACITY + 3),
                format!("line {}", LOG_CAPACITY + 4)
            ]
        );
    }

    #[test]
    fn test_error_and_message_recorded() {
        let state = AppState::new();
        state.apply(&BleEvent::Error(BleError::NoConnectedPeers));
        state.apply(&BleEvent::InboundMessage {
            text: "hello".to_string(),
            sender: PeerIdentity::new("A", Some("phone".to_string())),
        });
        assert!(state.get_last_error().is_some());
        assert_eq!(state.get_last_message().map(|m| m.text), Some("hello".to_string()));
    }
}
