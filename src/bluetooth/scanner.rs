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

//! Central-side discovery with de-duplication.

use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::error::{BleError, BleResult, ScanFailure};
use super::events::{BleEvent, EventSink};
use super::peers::{DiscoveredPeer, PeerTable};
use super::platform::{
    BlePlatform, Capability, LeScanner, Permissions, ScanCallback, ScanFilter, ScanResult,
    ScanSettings,
};

/// Receives newly discovered peers, e.g. to connect automatically.
pub trait DiscoveryListener: Send + Sync {
    fn on_peer_discovered(&self, peer: &DiscoveredPeer);
}

#[derive(Default)]
struct ScanState {
    active: bool,
    generation: u64,
    scanner: Option<Arc<dyn LeScanner>>,
    timer: Option<JoinHandle<()>>,
}

struct ScannerInner {
    platform: Arc<dyn BlePlatform>,
    permissions: Arc<dyn Permissions>,
    events: EventSink,
    service_uuid: Uuid,
    manufacturer_id: u16,
    default_timeout: Option<Duration>,
    discovered: PeerTable<DiscoveredPeer>,
    listener: RwLock<Option<Arc<dyn DiscoveryListener>>>,
    state: Mutex<ScanState>,
}

impl ScannerInner {
    fn peer_from_result(&self, result: ScanResult) -> DiscoveredPeer {
        let record = result.record.unwrap_or_default();
        let identifier = record
            .manufacturer_data
            .get(&self.manufacturer_id)
            .and_then(|bytes| String::from_utf8(bytes.clone()).ok())
            .filter(|id| !id.is_empty());
        let advertised_name = record.device_name.or_else(|| result.device.name.clone());

        DiscoveredPeer {
            identity: result.device,
            advertised_name,
            identifier,
            rssi: result.rssi,
        }
    }

    /// Store results; returns the peers seen for the first time.
    fn record(&self, results: Vec<ScanResult>) -> Vec<DiscoveredPeer> {
        let mut fresh = Vec::new();
        for result in results {
            let peer = self.peer_from_result(result);
            let key = peer.discovery_key();
            if self.discovered.insert(key.clone(), peer.clone()) {
                self.events.log(format!(
                    "Discovered {} ({})",
                    peer.advertised_name.as_deref().unwrap_or("Unknown"),
                    key
                ));
                fresh.push(peer);
            } else {
                debug!("Repeat sighting of {}", key);
            }
        }
        fresh
    }

    fn deliver(&self, generation: u64, results: Vec<ScanResult>) {
        {
            let state = self.state.lock();
            if !state.active || state.generation != generation {
                return;
            }
        }

        let fresh = self.record(results);
        if fresh.is_empty() {
            return;
        }
        self.events
            .emit(BleEvent::DiscoveredPeersUpdated(self.discovered.snapshot()));

        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            for peer in &fresh {
                listener.on_peer_discovered(peer);
            }
        }
    }

    fn stop(&self, generation: Option<u64>) {
        let (scanner, timer) = {
            let mut state = self.state.lock();
            if !state.active {
                return;
            }
            if generation.is_some_and(|g| g != state.generation) {
                return;
            }
            state.active = false;
            state.generation += 1;
            (state.scanner.take(), state.timer.take())
        };

        // The timer calls in here with its own handle already taken
        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(scanner) = scanner {
            scanner.stop_scan();
        }
        self.events.log("Scanning stopped");
        self.events.emit(BleEvent::ScanningStateChanged(false));
    }
}

struct ScanSession {
    inner: Weak<ScannerInner>,
    generation: u64,
}

impl ScanCallback for ScanSession {
    fn on_scan_result(&self, result: ScanResult) {
        if let Some(inner) = self.inner.upgrade() {
            inner.deliver(self.generation, vec![result]);
        }
    }

    fn on_batch_scan_results(&self, results: Vec<ScanResult>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.deliver(self.generation, results);
        }
    }

    fn on_scan_failed(&self, reason: ScanFailure) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let timer = {
            let mut state = inner.state.lock();
            if state.generation != self.generation || !state.active {
                return;
            }
            state.active = false;
            state.generation += 1;
            state.scanner = None;
            state.timer.take()
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        inner.events.error(BleError::ScanFailed(reason));
        inner.events.emit(BleEvent::ScanningStateChanged(false));
    }
}

/// Scanner controller. Cloning shares the same state.
#[derive(Clone)]
pub struct ScannerController {
    inner: Arc<ScannerInner>,
}

impl ScannerController {
    pub fn new(
        platform: Arc<dyn BlePlatform>,
        permissions: Arc<dyn Permissions>,
        events: EventSink,
        service_uuid: Uuid,
        manufacturer_id: u16,
        default_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(ScannerInner {
                platform,
                permissions,
                events,
                service_uuid,
                manufacturer_id,
                default_timeout,
                discovered: PeerTable::new(),
                listener: RwLock::new(None),
                state: Mutex::new(ScanState::default()),
            }),
        }
    }

    pub fn set_listener(&self, listener: Option<Arc<dyn DiscoveryListener>>) {
        *self.inner.listener.write() = listener;
    }

    /// Start scanning for the service. `timeout` overrides the configured
    /// auto-stop delay.
    pub fn start_scan(&self, timeout: Option<Duration>) -> BleResult<()> {
        if self.inner.state.lock().active {
            return Err(BleError::AlreadyActive("Scan".to_string()));
        }
        if !self.inner.permissions.has_permission(Capability::Scan) {
            return Err(BleError::PermissionDenied(Capability::Scan));
        }
        if !self.inner.platform.is_enabled() {
            return Err(BleError::AdapterUnavailable);
        }
        let scanner = self
            .inner
            .platform
            .scanner()
            .ok_or_else(|| BleError::ResourceUnavailable("Scanner".to_string()))?;

        let generation = {
            let mut state = self.inner.state.lock();
            if state.active {
                return Err(BleError::AlreadyActive("Scan".to_string()));
            }
            state.active = true;
            state.generation += 1;
            state.scanner = Some(scanner.clone());
            state.generation
        };

        self.inner.discovered.clear();
        self.inner
            .events
            .emit(BleEvent::DiscoveredPeersUpdated(Vec::new()));
        self.inner.events.log("Scanning started");
        self.inner.events.emit(BleEvent::ScanningStateChanged(true));

        let callback = Arc::new(ScanSession {
            inner: Arc::downgrade(&self.inner),
            generation,
        });
        let filters = [ScanFilter {
            service_uuid: Some(self.inner.service_uuid),
        }];
        scanner.start_scan(&filters, &ScanSettings::default(), callback);

        if let Some(timeout) = timeout.or(self.inner.default_timeout) {
            self.arm_timer(generation, timeout);
        }
        Ok(())
    }

    fn arm_timer(&self, generation: u64, timeout: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime; scan will not stop automatically");
            return;
        };
        let inner = Arc::downgrade(&self.inner);
        let timer = runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = inner.upgrade() {
                {
                    let mut state = inner.state.lock();
                    if state.generation == generation {
                        state.timer = None;
                    }
                }
                debug!("Scan timeout reached");
                inner.stop(Some(generation));
            }
        });

        let mut state = self.inner.state.lock();
        if state.active && state.generation == generation {
            state.timer = Some(timer);
        } else {
            timer.abort();
        }
    }

    /// Stop scanning and cancel the auto-stop timer. Does nothing when idle.
    pub fn stop_scan(&self) {
        self.inner.stop(None);
    }

    pub fn is_active(&self) -> bool {
        self.inner.state.lock().active
    }

    pub fn discovered(&self) -> Vec<DiscoveredPeer> {
        self.inner.discovered.snapshot()
    }

    /// Look a peer up by identifier, address or name.
    pub fn find(&self, key: &str) -> Option<DiscoveredPeer> {
        self.inner
            .discovered
            .get(key)
            .or_else(|| {
                self.inner
                    .discovered
                    .find(|p| p.identity.address.eq_ignore_ascii_case(key))
                    .map(|(_, p)| p)
            })
            .or_else(|| {
                self.inner
                    .discovered
                    .find(|p| p.advertised_name.as_deref() == Some(key))
                    .map(|(_, p)| p)
            })
    }

    pub fn clear_discovered(&self) {
        self.inner.discovered.clear();
        self.inner
            .events
            .emit(BleEvent::DiscoveredPeersUpdated(Vec::new()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::ble_constants::SERVICE_UUID;
    use crate::bluetooth::peers::PeerIdentity;
    use crate::bluetooth::platform::ScanRecord;
    use crate::bluetooth::sim::{SimAir, SimPermissions};
    use std::collections::BTreeMap;

    fn controller(
        air: &Arc<SimAir>,
        timeout: Option<Duration>,
    ) -> (ScannerController, tokio::sync::mpsc::UnboundedReceiver<BleEvent>) {
        let platform = air.device("00:00:00:00:00:10", Some("central"));
        let (events, rx) = EventSink::channel();
        (
            ScannerController::new(
                platform,
                Arc::new(SimPermissions::default()),
                events,
                SERVICE_UUID,
                0x1234,
                timeout,
            ),
            rx,
        )
    }

    fn result(address: &str, identifier: Option<&str>) -> ScanResult {
        let mut manufacturer_data = BTreeMap::new();
        if let Some(id) = identifier {
            manufacturer_data.insert(0x1234, id.as_bytes().to_vec());
        }
        ScanResult {
            device: PeerIdentity::new(address, None),
            rssi: Some(-50),
            record: Some(ScanRecord {
                device_name: Some("phone".to_string()),
                service_uuids: vec![SERVICE_UUID],
                manufacturer_data,
            }),
        }
    }

    #[test]
    fn test_duplicate_sighting_yields_one_entry() {
        let air = SimAir::new();
        let (scanner, mut rx) = controller(&air, None);
        scanner.start_scan(None).unwrap();
        let generation = scanner.inner.state.lock().generation;

        scanner.inner.deliver(generation, vec![result("AA", Some("0101"))]);
        scanner.inner.deliver(generation, vec![result("AA", Some("0101"))]);
        // Randomized address, same identifier
        scanner.inner.deliver(generation, vec![result("BB", Some("0101"))]);
        scanner.inner.deliver(generation, vec![result("CC", None)]);

        let discovered = scanner.discovered();
        assert_eq!(discovered.len(), 2);
        assert_eq!(discovered[0].identity.address, "BB");
        assert_eq!(discovered[1].discovery_key(), "CC");

        let updates = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|e| matches!(e, BleEvent::DiscoveredPeersUpdated(list) if !list.is_empty()))
            .count();
        assert_eq!(updates, 2);
    }

    #[test]
    fn test_batch_emits_once() {
        let air = SimAir::new();
        let (scanner, mut rx) = controller(&air, None);
        scanner.start_scan(None).unwrap();
        let generation = scanner.inner.state.lock().generation;

        scanner.inner.deliver(
            generation,
            vec![result("AA", None), result("BB", None), result("AA", None)],
        );
        let updates: Vec<usize> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| match e {
                BleEvent::DiscoveredPeersUpdated(list) if !list.is_empty() => Some(list.len()),
                _ => None,
            })
            .collect();
        assert_eq!(updates, vec![2]);
    }

    #[test]
    fn test_stale_results_ignored() {
        let air = SimAir::new();
        let (scanner, _rx) = controller(&air, None);
        scanner.start_scan(None).unwrap();
        let generation = scanner.inner.state.lock().generation;
        scanner.stop_scan();

        scanner.inner.deliver(generation, vec![result("AA", None)]);
        assert!(scanner.discovered().is_empty());
    }

    #[test]
    fn test_restart_clears_discovered() {
        let air = SimAir::new();
        let (scanner, _rx) = controller(&air, None);
        scanner.start_scan(None).unwrap();
        let generation = scanner.inner.state.lock().generation;
        scanner.inner.deliver(generation, vec![result("AA", None)]);
        assert_eq!(
            scanner.start_scan(None),
            Err(BleError::AlreadyActive("Scan".to_string()))
        );

        scanner.stop_scan();
        assert_eq!(scanner.discovered().len(), 1);
        scanner.start_scan(None).unwrap();
        assert!(scanner.discovered().is_empty());
    }

    #[test]
    fn test_finds_advertising_peripheral() {
        let air = SimAir::new();
        let (scanner, _rx) = controller(&air, None);
        air.advertise_raw("00:00:00:00:00:20", Some("phone"), SERVICE_UUID, Some("01000000000"));
        air.advertise_raw("00:00:00:00:00:30", Some("other"), uuid::Uuid::nil(), None);

        scanner.start_scan(None).unwrap();
        air.run_until_idle();

        let discovered = scanner.discovered();
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].identifier.as_deref(), Some("01000000000"));
        assert!(scanner.find("01000000000").is_some());
        assert!(scanner.find("00:00:00:00:00:20").is_some());
        assert!(scanner.find("phone").is_some());
    }

    #[test]
    fn test_scan_failure_resets() {
        let air = SimAir::new();
        let (scanner, mut rx) = controller(&air, None);
        if let Some(platform) = air.platform("00:00:00:00:00:10") {
            platform.fail_next_scan(ScanFailure::RegistrationFailed);
        }
        scanner.start_scan(None).unwrap();
        air.run_until_idle();
        assert!(!scanner.is_active());
        assert!(std::iter::from_fn(|| rx.try_recv().ok()).any(|e| e
            == BleEvent::Error(BleError::ScanFailed(ScanFailure::RegistrationFailed))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_stops_scan() {
        let air = SimAir::new();
        let (scanner, _rx) = controller(&air, Some(Duration::from_secs(10)));
        scanner.start_scan(None).unwrap();
        assert!(scanner.is_active());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(!scanner.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_timer() {
        let air = SimAir::new();
        let (scanner, _rx) = controller(&air, None);
        scanner.start_scan(Some(Duration::from_secs(5))).unwrap();
        scanner.stop_scan();
        scanner.start_scan(None).unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(scanner.is_active());
    }
}
