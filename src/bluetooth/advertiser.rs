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

//! Peripheral advertising lifecycle.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::debug;

use super::error::{AdvertiseFailure, BleError, BleResult};
use super::events::{BleEvent, EventSink};
use super::gatt_server::GattServerEngine;
use super::peers::LocalIdentity;
use super::platform::{
    AdvertiseCallback, AdvertisePayload, AdvertiseSettings, BlePlatform, Capability, LeAdvertiser,
    Permissions,
};

#[derive(Default)]
struct AdvertiseState {
    active: bool,
    pending: bool,
    generation: u64,
    advertiser: Option<Arc<dyn LeAdvertiser>>,
}

struct AdvertiserInner {
    platform: Arc<dyn BlePlatform>,
    permissions: Arc<dyn Permissions>,
    server: GattServerEngine,
    identity: Arc<LocalIdentity>,
    events: EventSink,
    manufacturer_id: u16,
    advertise_identifier: bool,
    state: Mutex<AdvertiseState>,
}

/// Outcome listener for one start request.
struct AdvertiseSession {
    inner: Weak<AdvertiserInner>,
    advertiser: Arc<dyn LeAdvertiser>,
    generation: u64,
}

impl AdvertiseCallback for AdvertiseSession {
    fn on_start_success(&self) {
        let Some(inner) = self.inner.upgrade() else {
            self.advertiser.stop_advertising();
            return;
        };
        let (current, idle) = {
            let mut state = inner.state.lock();
            let current = state.generation == self.generation && state.pending;
            if current {
                state.pending = false;
                state.active = true;
            }
            (current, !state.active && !state.pending)
        };
        if !current {
            if idle {
                // Stopped while the start was in flight
                debug!("Advertising came up after stop, shutting it down");
                self.advertiser.stop_advertising();
            } else {
                debug!("Ignoring stale advertise success");
            }
            return;
        }
        inner.events.log("Advertising started");
        inner.events.emit(BleEvent::AdvertisingStateChanged(true));
    }

    fn on_start_failure(&self, reason: AdvertiseFailure) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        {
            let mut state = inner.state.lock();
            if state.generation != self.generation {
                return;
            }
            state.pending = false;
            state.active = false;
            state.advertiser = None;
        }
        inner.events.error(BleError::AdvertiseFailed(reason));
        inner.events.emit(BleEvent::AdvertisingStateChanged(false));
    }
}

/// Advertiser controller. Cloning shares the same state.
#[derive(Clone)]
pub struct AdvertiserController {
    inner: Arc<AdvertiserInner>,
}

impl AdvertiserController {
    pub fn new(
        platform: Arc<dyn BlePlatform>,
        permissions: Arc<dyn Permissions>,
        server: GattServerEngine,
        identity: Arc<LocalIdentity>,
        events: EventSink,
        manufacturer_id: u16,
        advertise_identifier: bool,
    ) -> Self {
        Self {
            inner: Arc::new(AdvertiserInner {
                platform,
                permissions,
                server,
                identity,
                events,
                manufacturer_id,
                advertise_identifier,
                state: Mutex::new(AdvertiseState::default()),
            }),
        }
    }

    /// Request advertising. The outcome arrives as an event.
    ///
    /// A `stop_advertising` that lands while the server is being
    /// provisioned cancels the request before the radio is touched.
    pub async fn start_advertising(&self) -> BleResult<()> {
        let generation = {
            let mut state = self.inner.state.lock();
            if state.active || state.pending {
                return Err(BleError::AlreadyActive("Advertising".to_string()));
            }
            state.pending = true;
            state.generation += 1;
            state.generation
        };

        let prepared = self.prepare().await;

        let mut state = self.inner.state.lock();
        if state.generation != generation {
            drop(state);
            debug!("Advertise request {} superseded during setup", generation);
            return Err(BleError::Cancelled("Advertising".to_string()));
        }
        match prepared {
            Ok((advertiser, data, scan_response)) => {
                state.advertiser = Some(advertiser.clone());
                drop(state);

                let callback = Arc::new(AdvertiseSession {
                    inner: Arc::downgrade(&self.inner),
                    advertiser: advertiser.clone(),
                    generation,
                });
                self.inner.events.log(format!(
                    "Requesting advertising as {}",
                    self.inner.identity.device_name()
                ));
                advertiser.start_advertising(
                    &AdvertiseSettings::default(),
                    &data,
                    &scan_response,
                    callback,
                );
                Ok(())
            }
            Err(e) => {
                state.pending = false;
                Err(e)
            }
        }
    }

    async fn prepare(
        &self,
    ) -> BleResult<(Arc<dyn LeAdvertiser>, AdvertisePayload, AdvertisePayload)> {
        for capability in [Capability::Advertise, Capability::Connect] {
            if !self.inner.permissions.has_permission(capability) {
                return Err(BleError::PermissionDenied(capability));
            }
        }
        if !self.inner.platform.is_enabled() {
            return Err(BleError::AdapterUnavailable);
        }
        let advertiser = self
            .inner
            .platform
            .advertiser()
            .ok_or_else(|| BleError::ResourceUnavailable("Advertiser".to_string()))?;

        self.inner.server.provision().await?;

        let (data, scan_response) = self.payloads();
        let name = self.inner.identity.device_name();
        if !data.fits_legacy(name, true) || !scan_response.fits_legacy(name, false) {
            return Err(BleError::AdvertiseFailed(AdvertiseFailure::DataTooLarge));
        }

        Ok((advertiser, data, scan_response))
    }

    /// Advertising payload (service UUID) and scan response (name and
    /// optional identifier).
    pub fn payloads(&self) -> (AdvertisePayload, AdvertisePayload) {
        let data = AdvertisePayload {
            service_uuids: vec![self.inner.server.profile().service_uuid],
            ..Default::default()
        };

        let mut scan_response = AdvertisePayload {
            include_device_name: true,
            ..Default::default()
        };
        if self.inner.advertise_identifier {
            scan_response.manufacturer_data.insert(
                self.inner.manufacturer_id,
                self.inner.identity.identifier().into_bytes(),
            );
        }

        (data, scan_response)
    }

    /// Stop advertising. Does nothing when inactive.
    pub fn stop_advertising(&self) {
        let advertiser = {
            let mut state = self.inner.state.lock();
            if !state.active && !state.pending {
                return;
            }
            state.active = false;
            state.pending = false;
            state.generation += 1;
            state.advertiser.take()
        };
        if let Some(advertiser) = advertiser {
            advertiser.stop_advertising();
        }
        self.inner.events.log("Advertising stopped");
        self.inner.events.emit(BleEvent::AdvertisingStateChanged(false));
    }

    pub fn is_active(&self) -> bool {
        self.inner.state.lock().active
    }

    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::gatt::GattProfile;
    use crate::bluetooth::reassembler::InboundRouter;
    use crate::bluetooth::sim::{SimAir, SimPermissions};
    use crate::storage::MemoryImageSink;

    fn controller(
        air: &Arc<SimAir>,
        permissions: Arc<dyn Permissions>,
        name: &str,
    ) -> (AdvertiserController, tokio::sync::mpsc::UnboundedReceiver<BleEvent>) {
        let platform = air.device("00:00:00:00:00:01", Some(name));
        let (events, rx) = EventSink::channel();
        let identity = Arc::new(LocalIdentity::new(name, "01000000000"));
        let router = Arc::new(InboundRouter::new(
            Arc::new(MemoryImageSink::default()),
            events.clone(),
        ));
        let server = GattServerEngine::new(
            platform.clone(),
            GattProfile::combined(),
            identity.clone(),
            router,
            events.clone(),
        );
        (
            AdvertiserController::new(platform, permissions, server, identity, events, 0x1234, true),
            rx,
        )
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let air = SimAir::new();
        let (adv, mut rx) = controller(&air, Arc::new(SimPermissions::default()), "laptop");

        adv.start_advertising().await.unwrap();
        assert!(adv.is_pending());
        assert_eq!(
            adv.start_advertising().await,
            Err(BleError::AlreadyActive("Advertising".to_string()))
        );

        air.run_until_idle();
        assert!(adv.is_active());
        assert!(air.is_advertising("00:00:00:00:00:01"));

        adv.stop_advertising();
        adv.stop_advertising();
        assert!(!adv.is_active());
        assert!(!air.is_advertising("00:00:00:00:00:01"));

        let states: Vec<bool> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| match e {
                BleEvent::AdvertisingStateChanged(on) => Some(on),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![true, false]);
    }

    #[tokio::test]
    async fn test_stop_during_setup_cancels_start() {
        let air = SimAir::new();
        let (adv, _rx) = controller(&air, Arc::new(SimPermissions::default()), "laptop");
        let gate = air.platform("00:00:00:00:00:01").unwrap().hold_add_service();

        let pending = {
            let adv = adv.clone();
            tokio::spawn(async move { adv.start_advertising().await })
        };
        while !air.has_server("00:00:00:00:00:01") {
            tokio::task::yield_now().await;
        }
        assert!(adv.is_pending());

        adv.stop_advertising();
        gate.notify_one();
        assert_eq!(
            pending.await.unwrap(),
            Err(BleError::Cancelled("Advertising".to_string()))
        );
        air.run_until_idle();
        assert!(!adv.is_active());
        assert!(!adv.is_pending());
        assert!(!air.is_advertising("00:00:00:00:00:01"));
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let air = SimAir::new();
        let permissions = SimPermissions::default();
        permissions.deny(Capability::Advertise);
        let (adv, _rx) = controller(&air, Arc::new(permissions), "laptop");

        assert_eq!(
            adv.start_advertising().await,
            Err(BleError::PermissionDenied(Capability::Advertise))
        );
        assert!(!adv.is_pending());
    }

    #[tokio::test]
    async fn test_adapter_disabled() {
        let air = SimAir::new();
        let (adv, _rx) = controller(&air, Arc::new(SimPermissions::default()), "laptop");
        if let Some(platform) = air.platform("00:00:00:00:00:01") {
            platform.set_enabled(false);
        }
        assert_eq!(adv.start_advertising().await, Err(BleError::AdapterUnavailable));
    }

    #[tokio::test]
    async fn test_oversize_scan_response() {
        let air = SimAir::new();
        let (adv, _rx) = controller(
            &air,
            Arc::new(SimPermissions::default()),
            "a-rather-long-workstation-name",
        );
        assert_eq!(
            adv.start_advertising().await,
            Err(BleError::AdvertiseFailed(AdvertiseFailure::DataTooLarge))
        );
        assert!(!adv.is_pending());
    }

    #[tokio::test]
    async fn test_platform_failure_stays_inactive() {
        let air = SimAir::new();
        let (adv, mut rx) = controller(&air, Arc::new(SimPermissions::default()), "laptop");
        if let Some(platform) = air.platform("00:00:00:00:00:01") {
            platform.fail_next_advertise(AdvertiseFailure::TooManyAdvertisers);
        }

        adv.start_advertising().await.unwrap();
        air.run_until_idle();
        assert!(!adv.is_active());
        assert!(!adv.is_pending());
        assert!(std::iter::from_fn(|| rx.try_recv().ok()).any(|e| e
            == BleEvent::Error(BleError::AdvertiseFailed(
                AdvertiseFailure::TooManyAdvertisers
            ))));

        // A retry is accepted
        adv.start_advertising().await.unwrap();
        air.run_until_idle();
        assert!(adv.is_active());
    }

    #[test]
    fn test_payload_layout() {
        let air = SimAir::new();
        let (adv, _rx) = controller(&air, Arc::new(SimPermissions::default()), "laptop");
        let (data, response) = adv.payloads();
        assert_eq!(
            data.service_uuids,
            vec![crate::bluetooth::ble_constants::SERVICE_UUID]
        );
        assert!(!data.include_device_name);
        assert!(response.include_device_name);
        assert_eq!(
            response.manufacturer_data.get(&0x1234),
            Some(&b"01000000000".to_vec())
        );
    }
}
