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

//! In-memory radio for running the engines without hardware.
//!
//! A [`SimAir`] connects any number of simulated devices. Requests are
//! queued and only delivered when [`SimAir::run_until_idle`] pumps the
//! queue, which keeps every scenario deterministic. Callbacks are invoked
//! with no internal lock held, so they may issue further requests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::trace;
use uuid::Uuid;

use super::ble_constants::{advertising::DEFAULT_MANUFACTURER_ID, cccd, CCCD_UUID};
use super::error::{AdvertiseFailure, BleError, BleResult, ScanFailure};
use super::gatt::{
    GattStatus, LinkState, RemoteCharacteristic, RemoteService, ServiceDefinition, WriteType,
};
use super::peers::PeerIdentity;
use super::platform::{
    AdvertiseCallback, AdvertisePayload, AdvertiseSettings, BlePlatform, Capability,
    DescriptorWriteRequest, GattClientCallback, GattLink, GattServerCallback, GattServerHandle,
    LeAdvertiser, LeScanner, Permissions, ScanCallback, ScanFilter, ScanRecord, ScanResult,
    ScanSettings, WriteRequest,
};

type Task = Box<dyn FnOnce(&SimAir) + Send>;

const SIM_RSSI: i16 = -55;

struct Advert {
    identity: PeerIdentity,
    data: AdvertisePayload,
    scan_response: AdvertisePayload,
}

impl Advert {
    fn matches(&self, filters: &[ScanFilter]) -> bool {
        filters.is_empty()
            || filters.iter().any(|f| match f.service_uuid {
                Some(uuid) => {
                    self.data.service_uuids.contains(&uuid)
                        || self.scan_response.service_uuids.contains(&uuid)
                }
                None => true,
            })
    }

    fn to_result(&self) -> ScanResult {
        let named = self.data.include_device_name || self.scan_response.include_device_name;
        let device_name = if named { self.identity.name.clone() } else { None };

        let mut service_uuids = self.data.service_uuids.clone();
        service_uuids.extend(self.scan_response.service_uuids.iter().copied());
        let mut manufacturer_data = self.data.manufacturer_data.clone();
        manufacturer_data.extend(self.scan_response.manufacturer_data.clone());

        ScanResult {
            device: PeerIdentity::new(self.identity.address.clone(), device_name.clone()),
            rssi: Some(SIM_RSSI),
            record: Some(ScanRecord {
                device_name,
                service_uuids,
                manufacturer_data,
            }),
        }
    }
}

struct ScannerSlot {
    filters: Vec<ScanFilter>,
    callback: Arc<dyn ScanCallback>,
}

struct ServerSlot {
    id: u64,
    callback: Arc<dyn GattServerCallback>,
    services: Vec<ServiceDefinition>,
    values: HashMap<Uuid, Vec<u8>>,
}

struct LinkSlot {
    central: PeerIdentity,
    peripheral: PeerIdentity,
    callback: Arc<dyn GattClientCallback>,
    connected: bool,
    subscriptions: HashSet<Uuid>,
}

#[derive(Default)]
struct World {
    devices: HashMap<String, Arc<SimPlatform>>,
    adverts: HashMap<String, Advert>,
    scanners: HashMap<String, ScannerSlot>,
    servers: HashMap<String, ServerSlot>,
    links: HashMap<u64, LinkSlot>,
}

/// Shared medium connecting simulated devices.
pub struct SimAir {
    world: Mutex<World>,
    queue: Mutex<VecDeque<Task>>,
    next_id: AtomicU64,
}

impl SimAir {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            world: Mutex::new(World::default()),
            queue: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Add a device to the air and return its platform.
    pub fn device(self: &Arc<Self>, address: &str, name: Option<&str>) -> Arc<SimPlatform> {
        let platform = Arc::new_cyclic(|me| SimPlatform {
            me: me.clone(),
            air: Arc::downgrade(self),
            identity: PeerIdentity::new(address, name.map(str::to_string)),
            enabled: AtomicBool::new(true),
            radio_available: AtomicBool::new(true),
            faults: Mutex::new(Faults::default()),
        });
        self.world
            .lock()
            .devices
            .insert(address.to_string(), platform.clone());
        platform
    }

    pub fn platform(&self, address: &str) -> Option<Arc<SimPlatform>> {
        self.world.lock().devices.get(address).cloned()
    }

    /// Advertise from a device that has no engine behind it.
    pub fn advertise_raw(
        &self,
        address: &str,
        name: Option<&str>,
        service_uuid: Uuid,
        identifier: Option<&str>,
    ) {
        let mut manufacturer_data = BTreeMap::new();
        if let Some(identifier) = identifier {
            manufacturer_data.insert(DEFAULT_MANUFACTURER_ID, identifier.as_bytes().to_vec());
        }
        let advert = Advert {
            identity: PeerIdentity::new(address, name.map(str::to_string)),
            data: AdvertisePayload {
                service_uuids: vec![service_uuid],
                ..Default::default()
            },
            scan_response: AdvertisePayload {
                include_device_name: true,
                manufacturer_data,
                ..Default::default()
            },
        };
        self.world.lock().adverts.insert(address.to_string(), advert);
        let address = address.to_string();
        self.enqueue(move |air| air.broadcast(&address));
    }

    /// Deliver queued callbacks until nothing is left. Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            let task = self.queue.lock().pop_front();
            match task {
                Some(task) => {
                    task(self);
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_advertising(&self, address: &str) -> bool {
        self.world.lock().adverts.contains_key(address)
    }

    pub fn is_scanning(&self, address: &str) -> bool {
        self.world.lock().scanners.contains_key(address)
    }

    pub fn has_server(&self, address: &str) -> bool {
        self.world.lock().servers.contains_key(address)
    }

    pub fn services_of(&self, address: &str) -> Vec<ServiceDefinition> {
        self.world
            .lock()
            .servers
            .get(address)
            .map(|s| s.services.clone())
            .unwrap_or_default()
    }

    pub fn value_of(&self, address: &str, characteristic: Uuid) -> Option<Vec<u8>> {
        self.world
            .lock()
            .servers
            .get(address)
            .and_then(|s| s.values.get(&characteristic).cloned())
    }

    /// Number of open links, connected or not.
    pub fn link_count(&self) -> usize {
        self.world.lock().links.len()
    }

    fn enqueue(&self, task: impl FnOnce(&SimAir) + Send + 'static) {
        self.queue.lock().push_back(Box::new(task));
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Report an advert to every scanner that matches it.
    fn broadcast(&self, address: &str) {
        let targets: Vec<(Arc<dyn ScanCallback>, ScanResult)> = {
            let world = self.world.lock();
            let Some(advert) = world.adverts.get(address) else {
                return;
            };
            world
                .scanners
                .iter()
                .filter(|(scanner, slot)| scanner.as_str() != address && advert.matches(&slot.filters))
                .map(|(_, slot)| (slot.callback.clone(), advert.to_result()))
                .collect()
        };
        for (callback, result) in targets {
            callback.on_scan_result(result);
        }
    }

    fn server_callback(&self, address: &str) -> Option<Arc<dyn GattServerCallback>> {
        self.world
            .lock()
            .servers
            .get(address)
            .map(|s| s.callback.clone())
    }

    /// Client callback and the peer identity of a link still open.
    fn link_endpoints(&self, id: u64) -> Option<(Arc<dyn GattClientCallback>, PeerIdentity, PeerIdentity)> {
        self.world
            .lock()
            .links
            .get(&id)
            .map(|l| (l.callback.clone(), l.central.clone(), l.peripheral.clone()))
    }

    fn link_connected(&self, id: u64) -> bool {
        self.world
            .lock()
            .links
            .get(&id)
            .is_some_and(|l| l.connected)
    }

    fn connect_link(&self, id: u64) {
        let Some((client, central, peripheral)) = self.link_endpoints(id) else {
            return;
        };
        let server = {
            let mut world = self.world.lock();
            let server = world
                .servers
                .get(&peripheral.address)
                .map(|s| s.callback.clone());
            if server.is_some() {
                if let Some(link) = world.links.get_mut(&id) {
                    link.connected = true;
                }
            }
            server
        };

        match server {
            Some(server) => {
                trace!("sim: {} connected to {}", central.address, peripheral.address);
                server.on_connection_state_change(&central, GattStatus::SUCCESS, LinkState::Connected);
                client.on_connection_state_change(&peripheral, GattStatus::SUCCESS, LinkState::Connected);
            }
            None => {
                client.on_connection_state_change(&peripheral, GattStatus::ERROR, LinkState::Disconnected);
            }
        }
    }

    fn disconnect_link(&self, id: u64) {
        let Some((client, central, peripheral)) = self.link_endpoints(id) else {
            return;
        };
        let was_connected = {
            let mut world = self.world.lock();
            world
                .links
                .get_mut(&id)
                .map(|l| std::mem::replace(&mut l.connected, false))
                .unwrap_or(false)
        };
        if !was_connected {
            return;
        }
        if let Some(server) = self.server_callback(&peripheral.address) {
            server.on_connection_state_change(&central, GattStatus::SUCCESS, LinkState::Disconnected);
        }
        client.on_connection_state_change(&peripheral, GattStatus::SUCCESS, LinkState::Disconnected);
    }
}

#[derive(Default)]
struct Faults {
    advertise: Option<AdvertiseFailure>,
    scan: Option<ScanFailure>,
    add_service: bool,
    add_service_gate: Option<Arc<Notify>>,
}

/// One simulated device.
pub struct SimPlatform {
    me: Weak<SimPlatform>,
    air: Weak<SimAir>,
    identity: PeerIdentity,
    enabled: AtomicBool,
    radio_available: AtomicBool,
    faults: Mutex<Faults>,
}

impl SimPlatform {
    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Make the advertiser and scanner unobtainable.
    pub fn set_radio_available(&self, available: bool) {
        self.radio_available.store(available, Ordering::SeqCst);
    }

    pub fn fail_next_advertise(&self, reason: AdvertiseFailure) {
        self.faults.lock().advertise = Some(reason);
    }

    pub fn fail_next_scan(&self, reason: ScanFailure) {
        self.faults.lock().scan = Some(reason);
    }

    pub fn fail_add_service(&self, fail: bool) {
        self.faults.lock().add_service = fail;
    }

    /// Make the next `add_service` wait until the returned gate is notified.
    pub fn hold_add_service(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.faults.lock().add_service_gate = Some(gate.clone());
        gate
    }

    fn radio(&self) -> Option<Arc<SimRadio>> {
        if !self.radio_available.load(Ordering::SeqCst) {
            return None;
        }
        Some(Arc::new(SimRadio {
            platform: self.me.upgrade()?,
        }))
    }
}

impl BlePlatform for SimPlatform {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn advertiser(&self) -> Option<Arc<dyn LeAdvertiser>> {
        self.radio().map(|r| r as Arc<dyn LeAdvertiser>)
    }

    fn scanner(&self) -> Option<Arc<dyn LeScanner>> {
        self.radio().map(|r| r as Arc<dyn LeScanner>)
    }

    fn open_gatt_server(
        &self,
        callback: Arc<dyn GattServerCallback>,
    ) -> Option<Arc<dyn GattServerHandle>> {
        if !self.is_enabled() {
            return None;
        }
        let air = self.air.upgrade()?;
        let id = air.next_id();
        air.world.lock().servers.insert(
            self.identity.address.clone(),
            ServerSlot {
                id,
                callback,
                services: Vec::new(),
                values: HashMap::new(),
            },
        );
        Some(Arc::new(SimServer {
            platform: self.me.upgrade()?,
            id,
        }))
    }

    fn gatt_link(
        &self,
        device: &PeerIdentity,
        callback: Arc<dyn GattClientCallback>,
    ) -> Option<Arc<dyn GattLink>> {
        if !self.is_enabled() {
            return None;
        }
        let air = self.air.upgrade()?;
        let id = air.next_id();
        air.world.lock().links.insert(
            id,
            LinkSlot {
                central: self.identity.clone(),
                peripheral: device.clone(),
                callback,
                connected: false,
                subscriptions: HashSet::new(),
            },
        );
        Some(Arc::new(SimLink {
            air: self.air.clone(),
            id,
            device: device.clone(),
        }))
    }
}

/// Advertiser and scanner of one device.
struct SimRadio {
    platform: Arc<SimPlatform>,
}

impl SimRadio {
    fn address(&self) -> String {
        self.platform.identity.address.clone()
    }
}

impl LeAdvertiser for SimRadio {
    fn start_advertising(
        &self,
        _settings: &AdvertiseSettings,
        data: &AdvertisePayload,
        scan_response: &AdvertisePayload,
        callback: Arc<dyn AdvertiseCallback>,
    ) {
        let Some(air) = self.platform.air.upgrade() else {
            return;
        };
        let platform = self.platform.clone();
        let data = data.clone();
        let scan_response = scan_response.clone();
        air.enqueue(move |air| {
            if let Some(reason) = platform.faults.lock().advertise.take() {
                callback.on_start_failure(reason);
                return;
            }
            let address = platform.identity.address.clone();
            let started = {
                let mut world = air.world.lock();
                if world.adverts.contains_key(&address) {
                    false
                } else {
                    world.adverts.insert(
                        address.clone(),
                        Advert {
                            identity: platform.identity.clone(),
                            data,
                            scan_response,
                        },
                    );
                    true
                }
            };
            if started {
                callback.on_start_success();
                air.broadcast(&address);
            } else {
                callback.on_start_failure(AdvertiseFailure::AlreadyStarted);
            }
        });
    }

    fn stop_advertising(&self) {
        if let Some(air) = self.platform.air.upgrade() {
            air.world.lock().adverts.remove(&self.address());
        }
    }
}

impl LeScanner for SimRadio {
    fn start_scan(
        &self,
        filters: &[ScanFilter],
        _settings: &ScanSettings,
        callback: Arc<dyn ScanCallback>,
    ) {
        let Some(air) = self.platform.air.upgrade() else {
            return;
        };
        let platform = self.platform.clone();
        let filters = filters.to_vec();
        air.enqueue(move |air| {
            if let Some(reason) = platform.faults.lock().scan.take() {
                callback.on_scan_failed(reason);
                return;
            }
            let address = platform.identity.address.clone();
            let results: Vec<ScanResult> = {
                let mut world = air.world.lock();
                if world.scanners.contains_key(&address) {
                    drop(world);
                    callback.on_scan_failed(ScanFailure::AlreadyStarted);
                    return;
                }
                let results = world
                    .adverts
                    .iter()
                    .filter(|(advertiser, advert)| **advertiser != address && advert.matches(&filters))
                    .map(|(_, advert)| advert.to_result())
                    .collect();
                world.scanners.insert(
                    address,
                    ScannerSlot {
                        filters,
                        callback: callback.clone(),
                    },
                );
                results
            };
            if !results.is_empty() {
                callback.on_batch_scan_results(results);
            }
        });
    }

    fn stop_scan(&self) {
        if let Some(air) = self.platform.air.upgrade() {
            air.world.lock().scanners.remove(&self.address());
        }
    }
}

struct SimServer {
    platform: Arc<SimPlatform>,
    id: u64,
}

impl SimServer {
    fn with_slot<R>(&self, f: impl FnOnce(&mut ServerSlot) -> R) -> Option<R> {
        let air = self.platform.air.upgrade()?;
        let mut world = air.world.lock();
        world
            .servers
            .get_mut(&self.platform.identity.address)
            .filter(|slot| slot.id == self.id)
            .map(f)
    }
}

#[async_trait]
impl GattServerHandle for SimServer {
    async fn add_service(&self, service: ServiceDefinition) -> BleResult<()> {
        let gate = self.platform.faults.lock().add_service_gate.take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.platform.faults.lock().add_service {
            return Err(BleError::ResourceUnavailable("GATT service".to_string()));
        }
        self.with_slot(|slot| slot.services.push(service))
            .ok_or(BleError::NotProvisioned)
    }

    fn set_value(&self, characteristic: Uuid, value: Vec<u8>) -> bool {
        self.with_slot(|slot| {
            let known = slot
                .services
                .iter()
                .any(|s| s.characteristics.iter().any(|c| c.uuid == characteristic));
            if known {
                slot.values.insert(characteristic, value);
            }
            known
        })
        .unwrap_or(false)
    }

    fn notify_characteristic_changed(
        &self,
        device: &PeerIdentity,
        characteristic: Uuid,
        _confirm: bool,
    ) -> bool {
        let Some(air) = self.platform.air.upgrade() else {
            return false;
        };
        let address = self.platform.identity.address.clone();
        let target = {
            let world = air.world.lock();
            let Some(value) = world
                .servers
                .get(&address)
                .filter(|slot| slot.id == self.id)
                .and_then(|slot| slot.values.get(&characteristic).cloned())
            else {
                return false;
            };
            world
                .links
                .iter()
                .find(|(_, l)| {
                    l.connected && l.central.address == device.address && l.peripheral.address == address
                })
                .map(|(id, l)| (*id, l.subscriptions.contains(&characteristic), value))
        };
        let Some((link, subscribed, value)) = target else {
            return false;
        };

        let device = device.clone();
        air.enqueue(move |air| {
            if subscribed {
                if let Some((client, _, peripheral)) = air.link_endpoints(link) {
                    client.on_characteristic_changed(&peripheral, characteristic, value);
                }
            }
            if let Some(server) = air.server_callback(&address) {
                server.on_notification_sent(&device, GattStatus::SUCCESS);
            }
        });
        true
    }

    fn close(&self) {
        let Some(air) = self.platform.air.upgrade() else {
            return;
        };
        let address = self.platform.identity.address.clone();
        let dropped: Vec<u64> = {
            let mut world = air.world.lock();
            if world.servers.get(&address).is_some_and(|s| s.id == self.id) {
                world.servers.remove(&address);
            }
            world
                .links
                .iter_mut()
                .filter(|(_, l)| l.connected && l.peripheral.address == address)
                .map(|(id, l)| {
                    l.connected = false;
                    *id
                })
                .collect()
        };
        for id in dropped {
            air.enqueue(move |air| {
                if let Some((client, _, peripheral)) = air.link_endpoints(id) {
                    client.on_connection_state_change(
                        &peripheral,
                        GattStatus::SUCCESS,
                        LinkState::Disconnected,
                    );
                }
            });
        }
    }
}

struct SimLink {
    air: Weak<SimAir>,
    id: u64,
    device: PeerIdentity,
}

impl SimLink {
    /// Queue `task` if the link is connected.
    fn request(&self, task: impl FnOnce(&SimAir, u64) + Send + 'static) -> bool {
        let Some(air) = self.air.upgrade() else {
            return false;
        };
        if !air.link_connected(self.id) {
            return false;
        }
        let id = self.id;
        air.enqueue(move |air| task(air, id));
        true
    }
}

impl GattLink for SimLink {
    fn device(&self) -> &PeerIdentity {
        &self.device
    }

    fn connect(&self) -> bool {
        let Some(air) = self.air.upgrade() else {
            return false;
        };
        let id = self.id;
        air.enqueue(move |air| air.connect_link(id));
        true
    }

    fn discover_services(&self) -> bool {
        self.request(|air, id| {
            let Some((client, _, peripheral)) = air.link_endpoints(id) else {
                return;
            };
            let services: Option<Vec<RemoteService>> = {
                let world = air.world.lock();
                world.servers.get(&peripheral.address).map(|slot| {
                    slot.services
                        .iter()
                        .map(|s| RemoteService {
                            uuid: s.uuid,
                            characteristics: s
                                .characteristics
                                .iter()
                                .map(|c| RemoteCharacteristic {
                                    service: s.uuid,
                                    uuid: c.uuid,
                                    properties: c.properties,
                                })
                                .collect(),
                        })
                        .collect()
                })
            };
            match services {
                Some(services) => {
                    client.on_services_discovered(&peripheral, GattStatus::SUCCESS, services)
                }
                None => client.on_services_discovered(&peripheral, GattStatus::FAILURE, Vec::new()),
            }
        })
    }

    fn write_characteristic(
        &self,
        _service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
        write_type: WriteType,
    ) -> bool {
        self.request(move |air, id| {
            let Some((client, central, peripheral)) = air.link_endpoints(id) else {
                return;
            };
            let response_needed = write_type == WriteType::Default;
            let response = air.server_callback(&peripheral.address).and_then(|server| {
                server.on_characteristic_write_request(
                    &central,
                    WriteRequest {
                        request_id: id as u32,
                        characteristic,
                        value,
                        offset: 0,
                        response_needed,
                        prepared: false,
                    },
                )
            });
            let status = if response_needed {
                response.map(|r| r.status).unwrap_or(GattStatus::FAILURE)
            } else {
                GattStatus::SUCCESS
            };
            client.on_characteristic_write(&peripheral, characteristic, status);
        })
    }

    fn read_characteristic(&self, _service: Uuid, characteristic: Uuid) -> bool {
        self.request(move |air, id| {
            let Some((client, central, peripheral)) = air.link_endpoints(id) else {
                return;
            };
            match air.server_callback(&peripheral.address) {
                Some(server) => {
                    let response =
                        server.on_characteristic_read_request(&central, id as u32, 0, characteristic);
                    client.on_characteristic_read(
                        &peripheral,
                        characteristic,
                        response.value,
                        response.status,
                    );
                }
                None => client.on_characteristic_read(
                    &peripheral,
                    characteristic,
                    Vec::new(),
                    GattStatus::FAILURE,
                ),
            }
        })
    }

    fn set_notification(&self, _service: Uuid, characteristic: Uuid, enable: bool) -> bool {
        let Some(air) = self.air.upgrade() else {
            return false;
        };
        {
            let mut world = air.world.lock();
            match world.links.get_mut(&self.id) {
                Some(link) if link.connected => {
                    if enable {
                        link.subscriptions.insert(characteristic);
                    } else {
                        link.subscriptions.remove(&characteristic);
                    }
                }
                _ => return false,
            }
        }
        self.request(move |air, id| {
            let Some((client, central, peripheral)) = air.link_endpoints(id) else {
                return;
            };
            let value = if enable {
                cccd::ENABLE_NOTIFICATION.to_vec()
            } else {
                cccd::DISABLE.to_vec()
            };
            let status = air
                .server_callback(&peripheral.address)
                .and_then(|server| {
                    server.on_descriptor_write_request(
                        &central,
                        DescriptorWriteRequest {
                            request_id: id as u32,
                            characteristic,
                            descriptor: CCCD_UUID,
                            value,
                            response_needed: true,
                        },
                    )
                })
                .map(|r| r.status)
                .unwrap_or(GattStatus::FAILURE);
            client.on_descriptor_write(&peripheral, characteristic, status);
        })
    }

    fn disconnect(&self) {
        if let Some(air) = self.air.upgrade() {
            let id = self.id;
            air.enqueue(move |air| air.disconnect_link(id));
        }
    }

    fn close(&self) {
        let Some(air) = self.air.upgrade() else {
            return;
        };
        let Some(link) = air.world.lock().links.remove(&self.id) else {
            return;
        };
        if link.connected {
            let peripheral = link.peripheral.address.clone();
            let central = link.central.clone();
            air.enqueue(move |air| {
                if let Some(server) = air.server_callback(&peripheral) {
                    server.on_connection_state_change(
                        &central,
                        GattStatus::SUCCESS,
                        LinkState::Disconnected,
                    );
                }
            });
        }
    }
}

/// Permission oracle with a deny list.
#[derive(Debug, Default)]
pub struct SimPermissions {
    denied: Mutex<HashSet<Capability>>,
}

impl SimPermissions {
    pub fn deny(&self, capability: Capability) {
        self.denied.lock().insert(capability);
    }

    pub fn allow(&self, capability: Capability) {
        self.denied.lock().remove(&capability);
    }
}

impl Permissions for SimPermissions {
    fn has_permission(&self, capability: Capability) -> bool {
        !self.denied.lock().contains(&capability)
    }
}

/// Client callback that records everything it receives.
#[derive(Default)]
pub struct ClientLog {
    connections: Mutex<Vec<(GattStatus, LinkState)>>,
    services: Mutex<Vec<RemoteService>>,
    writes: Mutex<Vec<(Uuid, GattStatus)>>,
    reads: Mutex<Vec<(Uuid, Vec<u8>)>>,
    changed: Mutex<Vec<(Uuid, Vec<u8>)>>,
    descriptors: Mutex<Vec<(Uuid, GattStatus)>>,
}

impl ClientLog {
    pub fn connections(&self) -> Vec<(GattStatus, LinkState)> {
        self.connections.lock().clone()
    }

    pub fn services(&self) -> Vec<RemoteService> {
        self.services.lock().clone()
    }

    pub fn writes(&self) -> Vec<(Uuid, GattStatus)> {
        self.writes.lock().clone()
    }

    pub fn reads(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.reads.lock().clone()
    }

    pub fn changed(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.changed.lock().clone()
    }

    pub fn descriptors(&self) -> Vec<(Uuid, GattStatus)> {
        self.descriptors.lock().clone()
    }
}

impl GattClientCallback for ClientLog {
    fn on_connection_state_change(&self, _device: &PeerIdentity, status: GattStatus, state: LinkState) {
        self.connections.lock().push((status, state));
    }

    fn on_services_discovered(
        &self,
        _device: &PeerIdentity,
        _status: GattStatus,
        services: Vec<RemoteService>,
    ) {
        self.services.lock().extend(services);
    }

    fn on_characteristic_write(&self, _device: &PeerIdentity, characteristic: Uuid, status: GattStatus) {
        self.writes.lock().push((characteristic, status));
    }

    fn on_characteristic_read(
        &self,
        _device: &PeerIdentity,
        characteristic: Uuid,
        value: Vec<u8>,
        _status: GattStatus,
    ) {
        self.reads.lock().push((characteristic, value));
    }

    fn on_characteristic_changed(&self, _device: &PeerIdentity, characteristic: Uuid, value: Vec<u8>) {
        self.changed.lock().push((characteristic, value));
    }

    fn on_descriptor_write(&self, _device: &PeerIdentity, characteristic: Uuid, status: GattStatus) {
        self.descriptors.lock().push((characteristic, status));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::ble_constants::SERVICE_UUID;

    struct Count(Mutex<usize>);

    impl ScanCallback for Count {
        fn on_scan_result(&self, _result: ScanResult) {
            *self.0.lock() += 1;
        }
        fn on_batch_scan_results(&self, results: Vec<ScanResult>) {
            *self.0.lock() += results.len();
        }
        fn on_scan_failed(&self, _reason: ScanFailure) {}
    }

    #[test]
    fn test_queue_is_pumped_explicitly() {
        let air = SimAir::new();
        let central = air.device("C", None);
        air.advertise_raw("P", Some("phone"), SERVICE_UUID, None);

        let count = Arc::new(Count(Mutex::new(0)));
        let scanner = central.scanner().unwrap();
        scanner.start_scan(
            &[ScanFilter {
                service_uuid: Some(SERVICE_UUID),
            }],
            &ScanSettings::default(),
            count.clone(),
        );
        assert_eq!(*count.0.lock(), 0);
        assert!(air.pending() > 0);

        air.run_until_idle();
        assert_eq!(*count.0.lock(), 1);
        assert!(air.is_scanning("C"));
        assert_eq!(air.pending(), 0);
    }

    #[test]
    fn test_connect_without_server_fails() {
        let air = SimAir::new();
        let central = air.device("C", None);
        let log = Arc::new(ClientLog::default());
        let link = central
            .gatt_link(&PeerIdentity::new("P", None), log.clone())
            .unwrap();
        link.connect();
        air.run_until_idle();
        assert_eq!(
            log.connections(),
            vec![(GattStatus::ERROR, LinkState::Disconnected)]
        );
        assert!(!link.discover_services());
    }

    #[test]
    fn test_closed_link_gets_no_callbacks() {
        let air = SimAir::new();
        let central = air.device("C", None);
        let log = Arc::new(ClientLog::default());
        let link = central
            .gatt_link(&PeerIdentity::new("P", None), log.clone())
            .unwrap();
        link.connect();
        link.close();
        air.run_until_idle();
        assert!(log.connections().is_empty());
        assert_eq!(air.link_count(), 0);
    }
}
