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

//! Peer records and the shared peer tables.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use super::gatt::RemoteCharacteristic;
use super::platform::GattLink;

/// Radio address plus the optional name a device declared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PeerIdentity {
    pub address: String,
    pub name: Option<String>,
}

impl PeerIdentity {
    pub fn new(address: impl Into<String>, name: Option<String>) -> Self {
        Self {
            address: address.into(),
            name,
        }
    }

    /// Key used to detect duplicate connections.
    ///
    /// Addresses may be randomized, so the declared name wins when present.
    pub fn connection_key(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => self.address.clone(),
        }
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

/// Device seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredPeer {
    pub identity: PeerIdentity,
    /// Local name from the advertisement or scan response.
    pub advertised_name: Option<String>,
    /// Identifier carried in the manufacturer-specific data.
    pub identifier: Option<String>,
    pub rssi: Option<i16>,
}

impl DiscoveredPeer {
    /// De-duplication key within a scan session.
    pub fn discovery_key(&self) -> String {
        match &self.identifier {
            Some(id) if !id.is_empty() => id.clone(),
            _ => self.identity.address.clone(),
        }
    }

    /// Identity to connect with, carrying the best known name.
    pub fn connect_identity(&self) -> PeerIdentity {
        PeerIdentity {
            address: self.identity.address.clone(),
            name: self
                .identity
                .name
                .clone()
                .or_else(|| self.advertised_name.clone()),
        }
    }
}

/// Central-side connection record.
#[derive(Clone)]
pub struct ConnectedPeer {
    pub identity: PeerIdentity,
    pub link: Arc<dyn GattLink>,
    pub connected: bool,
    pub bidirectional: Option<RemoteCharacteristic>,
    pub write: Option<RemoteCharacteristic>,
    pub read: Option<RemoteCharacteristic>,
    pub notify: Option<RemoteCharacteristic>,
    /// Last identifier read from the peer.
    pub identifier: Option<String>,
}

impl ConnectedPeer {
    pub fn new(identity: PeerIdentity, link: Arc<dyn GattLink>) -> Self {
        Self {
            identity,
            link,
            connected: false,
            bidirectional: None,
            write: None,
            read: None,
            notify: None,
            identifier: None,
        }
    }

    /// Whether discovery populated the message characteristics.
    pub fn is_ready(&self) -> bool {
        self.write.is_some() || self.bidirectional.is_some()
    }

    pub fn view(&self) -> ConnectedPeerView {
        ConnectedPeerView {
            identity: self.identity.clone(),
            connected: self.connected,
            ready: self.is_ready(),
            identifier: self.identifier.clone(),
        }
    }
}

impl fmt::Debug for ConnectedPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectedPeer")
            .field("identity", &self.identity)
            .field("connected", &self.connected)
            .field("ready", &self.is_ready())
            .field("identifier", &self.identifier)
            .finish()
    }
}

/// Snapshot of a connected peer handed to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectedPeerView {
    pub identity: PeerIdentity,
    pub connected: bool,
    pub ready: bool,
    pub identifier: Option<String>,
}

/// Peripheral-side record of a connected central.
///
/// The identity is also the link handle: the server addresses
/// notifications to a central by it, so no separate handle is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectedClient {
    pub identity: PeerIdentity,
}

/// Name and identifier this endpoint presents to peers.
#[derive(Debug)]
pub struct LocalIdentity {
    device_name: String,
    identifier: RwLock<String>,
}

impl LocalIdentity {
    pub fn new(device_name: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            identifier: RwLock::new(identifier.into()),
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn identifier(&self) -> String {
        self.identifier.read().clone()
    }

    pub fn set_identifier(&self, identifier: impl Into<String>) {
        *self.identifier.write() = identifier.into();
    }
}

/// Insertion-ordered keyed table behind a mutex.
///
/// Every accessor takes the lock for the duration of the call only, so
/// callers never hold it while talking to the platform.
pub struct PeerTable<T> {
    entries: Mutex<Vec<(String, T)>>,
}

impl<T: Clone> PeerTable<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Insert or replace. Returns true when the key was new.
    pub fn insert(&self, key: impl Into<String>, value: T) -> bool {
        let key = key.into();
        let mut entries = self.entries.lock();
        match entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => {
                entry.1 = value;
                false
            }
            None => {
                entries.push((key, value));
                true
            }
        }
    }

    /// Insert only when the key is absent. Returns true when inserted.
    pub fn insert_new(&self, key: impl Into<String>, value: T) -> bool {
        let key = key.into();
        let mut entries = self.entries.lock();
        if entries.iter().any(|(k, _)| *k == key) {
            return false;
        }
        entries.push((key, value));
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().iter().any(|(k, _)| k == key)
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.entries
            .lock()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Mutate an entry in place.
    pub fn update<R>(&self, key: &str, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.entries
            .lock()
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, v)| f(v))
    }

    /// First entry matching the predicate, with its key.
    pub fn find(&self, pred: impl Fn(&T) -> bool) -> Option<(String, T)> {
        self.entries
            .lock()
            .iter()
            .find(|(_, v)| pred(v))
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    pub fn remove(&self, key: &str) -> Option<T> {
        let mut entries = self.entries.lock();
        let index = entries.iter().position(|(k, _)| k == key)?;
        Some(entries.remove(index).1)
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.entries.lock().iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().iter().map(|(k, _)| k.clone()).collect()
    }

    /// Remove and return every entry.
    pub fn drain(&self) -> Vec<T> {
        self.entries.lock().drain(..).map(|(_, v)| v).collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<T: Clone> Default for PeerTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_key_prefers_name() {
        let id = PeerIdentity::new("AA:BB:CC:DD:EE:FF", Some("pixel".to_string()));
        assert_eq!(id.connection_key(), "pixel");

        let id = PeerIdentity::new("AA:BB:CC:DD:EE:FF", Some(String::new()));
        assert_eq!(id.connection_key(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_discovery_key_prefers_identifier() {
        let mut peer = DiscoveredPeer {
            identity: PeerIdentity::new("11:22:33:44:55:66", None),
            advertised_name: Some("phone".to_string()),
            identifier: Some("01000000000".to_string()),
            rssi: Some(-60),
        };
        assert_eq!(peer.discovery_key(), "01000000000");
        assert_eq!(peer.connect_identity().name.as_deref(), Some("phone"));

        peer.identifier = None;
        assert_eq!(peer.discovery_key(), "11:22:33:44:55:66");
    }

    #[test]
    fn test_table_insert_replaces() {
        let table = PeerTable::new();
        assert!(table.insert("a", 1));
        assert!(table.insert("b", 2));
        assert!(!table.insert("a", 3));
        assert_eq!(table.snapshot(), vec![3, 2]);
        assert!(!table.insert_new("b", 9));
        assert_eq!(table.get("b"), Some(2));
    }

    #[test]
    fn test_table_update_remove_drain() {
        let table = PeerTable::new();
        table.insert("a", 1);
        table.insert("b", 2);
        assert_eq!(table.update("a", |v| { *v += 10; *v }), Some(11));
        assert_eq!(table.update("z", |v| *v), None);
        assert_eq!(table.find(|v| *v == 2).map(|(k, _)| k), Some("b".to_string()));
        assert_eq!(table.remove("a"), Some(11));
        assert_eq!(table.remove("a"), None);
        assert_eq!(table.drain(), vec![2]);
        assert!(table.is_empty());
    }
}
