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

//! BlueZ backend for the platform traits.
//!
//! Every request is spawned on the runtime captured at construction and
//! reports back through the callback it was given, the same way the
//! engines expect from any radio stack.

use anyhow::Result;
use async_trait::async_trait;
use bluer::adv::{Advertisement, AdvertisementHandle, Type as AdvertisementType};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotifier, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicRead, CharacteristicReadRequest, CharacteristicWrite,
    CharacteristicWriteMethod, CharacteristicWriteRequest, Descriptor, DescriptorRead,
    DescriptorReadRequest, DescriptorWrite, ReqError, Service,
};
use bluer::gatt::remote;
use bluer::gatt::WriteOp;
use bluer::{
    Adapter, AdapterEvent, AdapterProperty, Address, DeviceEvent, DeviceProperty, DiscoveryFilter,
    DiscoveryTransport, ErrorKind, Session,
};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::ble_constants::{cccd, CCCD_UUID};
use super::error::{AdvertiseFailure, BleError, BleResult, ScanFailure};
use super::gatt::{
    CharProperties, CharacteristicDefinition, DescriptorDefinition, GattStatus, LinkState,
    RemoteCharacteristic, RemoteService, ServiceDefinition, WriteType,
};
use super::peers::PeerIdentity;
use super::platform::{
    AdvertiseCallback, AdvertisePayload, AdvertiseSettings, BlePlatform, DescriptorWriteRequest,
    GattClientCallback, GattLink, GattServerCallback, GattServerHandle, LeAdvertiser, LeScanner,
    ScanCallback, ScanFilter, ScanRecord, ScanResult, ScanSettings, WriteRequest,
};

/// Poll interval of the server connection monitor.
const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// Placeholder for the remote side of a notification session. BlueZ does
/// not say which central subscribed.
const ANY_SUBSCRIBER: &str = "*";

/// Platform backed by the default (or named) BlueZ adapter.
pub struct BluezPlatform {
    handle: Handle,
    _session: Session,
    adapter: Adapter,
    radio: Arc<BluezRadio>,
    powered: Arc<AtomicBool>,
    watcher: JoinHandle<()>,
}

impl BluezPlatform {
    /// Open a BlueZ session, power the adapter on and set its alias.
    pub async fn new(adapter_name: Option<&str>, device_name: &str) -> Result<Arc<Self>> {
        info!("Initializing BlueZ backend...");

        let session = Session::new().await?;
        let adapter = match adapter_name {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };
        info!("Using Bluetooth adapter: {}", adapter.name());

        if !adapter.is_powered().await? {
            info!("Powering on Bluetooth adapter...");
            adapter.set_powered(true).await?;
        }
        adapter.set_alias(device_name.to_string()).await?;
        info!("Bluetooth name set to: {}", device_name);

        let powered = Arc::new(AtomicBool::new(adapter.is_powered().await?));
        let watcher = tokio::spawn(watch_power(adapter.clone(), powered.clone()));

        let handle = Handle::current();
        let radio = Arc::new(BluezRadio {
            handle: handle.clone(),
            adapter: adapter.clone(),
            device_name: device_name.to_string(),
            advertisement: Arc::new(Mutex::new(None)),
            advertise_generation: Arc::new(AtomicU64::new(0)),
            discovery: Mutex::new(None),
        });

        Ok(Arc::new(Self {
            handle,
            _session: session,
            adapter,
            radio,
            powered,
            watcher,
        }))
    }

    pub async fn address(&self) -> Result<String> {
        Ok(self.adapter.address().await?.to_string())
    }

}

impl Drop for BluezPlatform {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

async fn watch_power(adapter: Adapter, powered: Arc<AtomicBool>) {
    let events = match adapter.events().await {
        Ok(events) => events,
        Err(e) => {
            warn!("Cannot watch adapter power state: {}", e);
            return;
        }
    };
    let mut events = Box::pin(events);
    while let Some(event) = events.next().await {
        if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(on)) = event {
            info!("Adapter powered: {}", on);
            powered.store(on, Ordering::SeqCst);
        }
    }
}

impl BlePlatform for BluezPlatform {
    fn is_enabled(&self) -> bool {
        self.powered.load(Ordering::SeqCst)
    }

    fn advertiser(&self) -> Option<Arc<dyn LeAdvertiser>> {
        Some(self.radio.clone())
    }

    fn scanner(&self) -> Option<Arc<dyn LeScanner>> {
        Some(self.radio.clone())
    }

    fn open_gatt_server(
        &self,
        callback: Arc<dyn GattServerCallback>,
    ) -> Option<Arc<dyn GattServerHandle>> {
        let server = Arc::new(BluezServer {
            handle: self.handle.clone(),
            adapter: self.adapter.clone(),
            callback,
            application: Mutex::new(None),
            characteristics: Mutex::new(HashSet::new()),
            values: Mutex::new(HashMap::new()),
            notifiers: Mutex::new(HashMap::new()),
            monitor: Mutex::new(None),
        });
        Some(server)
    }

    fn gatt_link(
        &self,
        device: &PeerIdentity,
        callback: Arc<dyn GattClientCallback>,
    ) -> Option<Arc<dyn GattLink>> {
        let address: Address = match device.address.parse() {
            Ok(address) => address,
            Err(e) => {
                warn!("Invalid device address {}: {}", device.address, e);
                return None;
            }
        };
        let remote = self.adapter.device(address).ok()?;
        Some(Arc::new(BluezLink {
            handle: self.handle.clone(),
            identity: device.clone(),
            device: remote,
            callback,
            characteristics: Arc::new(Mutex::new(HashMap::new())),
            tasks: Mutex::new(LinkTasks::default()),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

fn advertise_failure(e: &bluer::Error) -> AdvertiseFailure {
    match e.kind {
        ErrorKind::AlreadyExists | ErrorKind::InProgress => AdvertiseFailure::AlreadyStarted,
        ErrorKind::InvalidLength => AdvertiseFailure::DataTooLarge,
        ErrorKind::NotSupported => AdvertiseFailure::FeatureUnsupported,
        ErrorKind::NotPermitted => AdvertiseFailure::TooManyAdvertisers,
        _ => AdvertiseFailure::InternalError,
    }
}

fn scan_failure(e: &bluer::Error) -> ScanFailure {
    match e.kind {
        ErrorKind::InProgress | ErrorKind::AlreadyExists => ScanFailure::AlreadyStarted,
        ErrorKind::NotSupported => ScanFailure::FeatureUnsupported,
        ErrorKind::NotReady | ErrorKind::NotAuthorized | ErrorKind::NotPermitted => {
            ScanFailure::RegistrationFailed
        }
        _ => ScanFailure::InternalError,
    }
}

fn gatt_status(e: &bluer::Error) -> GattStatus {
    match e.kind {
        ErrorKind::InvalidOffset => GattStatus::INVALID_OFFSET,
        ErrorKind::NotPermitted | ErrorKind::NotAuthorized => GattStatus::WRITE_NOT_PERMITTED,
        _ => GattStatus::FAILURE,
    }
}

fn req_error(status: GattStatus) -> ReqError {
    match status {
        GattStatus::READ_NOT_PERMITTED | GattStatus::WRITE_NOT_PERMITTED => ReqError::NotPermitted,
        GattStatus::INVALID_OFFSET => ReqError::InvalidOffset,
        _ => ReqError::Failed,
    }
}

// ----------------------------------------------------------------------------
// Advertising and scanning
// ----------------------------------------------------------------------------

struct BluezRadio {
    handle: Handle,
    adapter: Adapter,
    device_name: String,
    advertisement: Arc<Mutex<Option<AdvertisementHandle>>>,
    advertise_generation: Arc<AtomicU64>,
    discovery: Mutex<Option<JoinHandle<()>>>,
}

impl LeAdvertiser for BluezRadio {
    fn start_advertising(
        &self,
        settings: &AdvertiseSettings,
        data: &AdvertisePayload,
        scan_response: &AdvertisePayload,
        callback: Arc<dyn AdvertiseCallback>,
    ) {
        let mut service_uuids: std::collections::BTreeSet<Uuid> =
            data.service_uuids.iter().copied().collect();
        service_uuids.extend(scan_response.service_uuids.iter().copied());
        let mut manufacturer_data: BTreeMap<u16, Vec<u8>> = data.manufacturer_data.clone();
        manufacturer_data.extend(scan_response.manufacturer_data.clone());
        let named = data.include_device_name || scan_response.include_device_name;

        let advertisement = Advertisement {
            advertisement_type: AdvertisementType::Peripheral,
            service_uuids,
            manufacturer_data,
            local_name: named.then(|| self.device_name.clone()),
            discoverable: Some(settings.connectable),
            timeout: (!settings.timeout.is_zero()).then_some(settings.timeout),
            ..Default::default()
        };

        let adapter = self.adapter.clone();
        let slot = self.advertisement.clone();
        let counter = self.advertise_generation.clone();
        let generation = counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.handle.spawn(async move {
            match adapter.advertise(advertisement).await {
                Ok(handle) => {
                    if counter.load(Ordering::SeqCst) != generation {
                        debug!("Advertising stopped before it started");
                        return;
                    }
                    *slot.lock() = Some(handle);
                    info!("BLE advertising started");
                    callback.on_start_success();
                }
                Err(e) => {
                    error!("Failed to start advertising: {}", e);
                    callback.on_start_failure(advertise_failure(&e));
                }
            }
        });
    }

    fn stop_advertising(&self) {
        self.advertise_generation.fetch_add(1, Ordering::SeqCst);
        if self.advertisement.lock().take().is_some() {
            info!("BLE advertising stopped");
        }
    }
}

async fn scan_result(adapter: &Adapter, address: Address) -> bluer::Result<ScanResult> {
    let device = adapter.device(address)?;
    let device_name = device.name().await?;
    let rssi = device.rssi().await?;
    let service_uuids = device
        .uuids()
        .await?
        .unwrap_or_default()
        .into_iter()
        .collect();
    let manufacturer_data = device
        .manufacturer_data()
        .await?
        .unwrap_or_default()
        .into_iter()
        .collect();

    Ok(ScanResult {
        device: PeerIdentity::new(address.to_string(), device_name.clone()),
        rssi,
        record: Some(ScanRecord {
            device_name,
            service_uuids,
            manufacturer_data,
        }),
    })
}

fn passes(filters: &[ScanFilter], result: &ScanResult) -> bool {
    filters.iter().all(|f| match (f.service_uuid, &result.record) {
        (None, _) => true,
        (Some(uuid), Some(record)) => record.service_uuids.contains(&uuid),
        (Some(_), None) => false,
    })
}

impl LeScanner for BluezRadio {
    fn start_scan(
        &self,
        filters: &[ScanFilter],
        _settings: &ScanSettings,
        callback: Arc<dyn ScanCallback>,
    ) {
        let mut discovery = self.discovery.lock();
        if discovery.as_ref().is_some_and(|task| !task.is_finished()) {
            drop(discovery);
            callback.on_scan_failed(ScanFailure::AlreadyStarted);
            return;
        }

        let adapter = self.adapter.clone();
        let filters = filters.to_vec();
        *discovery = Some(self.handle.spawn(async move {
            let filter = DiscoveryFilter {
                uuids: filters.iter().filter_map(|f| f.service_uuid).collect(),
                transport: DiscoveryTransport::Le,
                ..Default::default()
            };
            if let Err(e) = adapter.set_discovery_filter(filter).await {
                error!("Failed to set discovery filter: {}", e);
                callback.on_scan_failed(scan_failure(&e));
                return;
            }
            let events = match adapter.discover_devices().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to start discovery: {}", e);
                    callback.on_scan_failed(scan_failure(&e));
                    return;
                }
            };
            info!("BLE discovery started");

            let mut events = Box::pin(events);
            while let Some(event) = events.next().await {
                if let AdapterEvent::DeviceAdded(address) = event {
                    match scan_result(&adapter, address).await {
                        Ok(result) if passes(&filters, &result) => callback.on_scan_result(result),
                        Ok(_) => {}
                        Err(e) => debug!("Skipping {}: {}", address, e),
                    }
                }
            }
        }));
    }

    fn stop_scan(&self) {
        if let Some(task) = self.discovery.lock().take() {
            task.abort();
            info!("BLE discovery stopped");
        }
    }
}

// ----------------------------------------------------------------------------
// GATT server
// ----------------------------------------------------------------------------

struct NotifySlot {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
    /// Version of the value last handed to BlueZ.
    sent: u64,
}

struct BluezServer {
    handle: Handle,
    adapter: Adapter,
    callback: Arc<dyn GattServerCallback>,
    application: Mutex<Option<ApplicationHandle>>,
    characteristics: Mutex<HashSet<Uuid>>,
    values: Mutex<HashMap<Uuid, (u64, Vec<u8>)>>,
    notifiers: Mutex<HashMap<Uuid, NotifySlot>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl BluezServer {
    fn build_characteristic(&self, definition: &CharacteristicDefinition) -> Characteristic {
        let uuid = definition.uuid;
        let properties = definition.properties;
        let mut characteristic = Characteristic {
            uuid,
            descriptors: external_descriptors(definition)
                .into_iter()
                .map(|d| self.build_descriptor(uuid, d))
                .collect(),
            ..Default::default()
        };

        if properties.contains(CharProperties::READ) {
            let callback = self.callback.clone();
            characteristic.read = Some(CharacteristicRead {
                read: true,
                fun: Box::new(move |req: CharacteristicReadRequest| {
                    let callback = callback.clone();
                    Box::pin(async move {
                        let device = PeerIdentity::new(req.device_address.to_string(), None);
                        let response =
                            callback.on_characteristic_read_request(&device, 0, req.offset, uuid);
                        if response.status.is_success() {
                            Ok(response.value)
                        } else {
                            Err(req_error(response.status))
                        }
                    })
                }),
                ..Default::default()
            });
        }

        let write = properties.contains(CharProperties::WRITE);
        let write_without_response = properties.contains(CharProperties::WRITE_NO_RESPONSE);
        if write || write_without_response {
            let callback = self.callback.clone();
            characteristic.write = Some(CharacteristicWrite {
                write,
                write_without_response,
                method: CharacteristicWriteMethod::Fun(Box::new(
                    move |value: Vec<u8>, req: CharacteristicWriteRequest| {
                        let callback = callback.clone();
                        Box::pin(async move {
                            let device = PeerIdentity::new(req.device_address.to_string(), None);
                            let response = callback.on_characteristic_write_request(
                                &device,
                                WriteRequest {
                                    request_id: 0,
                                    characteristic: uuid,
                                    value,
                                    offset: req.offset,
                                    response_needed: req.op_type == WriteOp::Request,
                                    prepared: req.prepare_authorize,
                                },
                            );
                            match response {
                                Some(r) if !r.status.is_success() => Err(req_error(r.status)),
                                _ => Ok(()),
                            }
                        })
                    },
                )),
                ..Default::default()
            });
        }

        let notify = properties.contains(CharProperties::NOTIFY);
        let indicate = properties.contains(CharProperties::INDICATE);
        if notify || indicate {
            let (tx, rx) = mpsc::unbounded_channel();
            let rx = Arc::new(tokio::sync::Mutex::new(rx));
            self.notifiers.lock().insert(
                uuid,
                NotifySlot {
                    tx,
                    rx: rx.clone(),
                    sent: 0,
                },
            );
            let callback = self.callback.clone();
            characteristic.notify = Some(CharacteristicNotify {
                notify,
                indicate,
                method: CharacteristicNotifyMethod::Fun(Box::new(
                    move |notifier: CharacteristicNotifier| {
                        let callback = callback.clone();
                        let rx = rx.clone();
                        Box::pin(notification_loop(uuid, notifier, rx, callback))
                    },
                )),
                ..Default::default()
            });
        }

        characteristic
    }

    /// Descriptor backed by a stored value. Writes are reported like CCCD
    /// writes on other platforms.
    fn build_descriptor(&self, characteristic: Uuid, definition: &DescriptorDefinition) -> Descriptor {
        let descriptor = definition.uuid;
        let initial = if descriptor == CCCD_UUID {
            cccd::DISABLE.to_vec()
        } else {
            Vec::new()
        };
        let value = Arc::new(Mutex::new(initial));

        let read_value = value.clone();
        let callback = self.callback.clone();
        Descriptor {
            uuid: descriptor,
            read: Some(DescriptorRead {
                read: true,
                fun: Box::new(move |req: DescriptorReadRequest| {
                    let value = read_value.lock().clone();
                    Box::pin(async move {
                        let start = req.offset as usize;
                        if start > value.len() {
                            return Err(ReqError::InvalidOffset);
                        }
                        Ok(value[start..].to_vec())
                    })
                }),
                ..Default::default()
            }),
            write: Some(DescriptorWrite {
                write: true,
                fun: Box::new(
                    move |new_value: Vec<u8>, req: bluer::gatt::local::DescriptorWriteRequest| {
                        let value = value.clone();
                        let callback = callback.clone();
                        Box::pin(async move {
                            let device = PeerIdentity::new(req.device_address.to_string(), None);
                            *value.lock() = new_value.clone();
                            let response = callback.on_descriptor_write_request(
                                &device,
                                DescriptorWriteRequest {
                                    request_id: 0,
                                    characteristic,
                                    descriptor,
                                    value: new_value,
                                    response_needed: true,
                                },
                            );
                            match response {
                                Some(r) if !r.status.is_success() => Err(req_error(r.status)),
                                _ => Ok(()),
                            }
                        })
                    },
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn start_monitor(&self) {
        let adapter = self.adapter.clone();
        let callback = self.callback.clone();
        let task = self.handle.spawn(async move {
            info!("Starting BlueZ connection monitor...");
            let mut connected: HashSet<Address> = HashSet::new();
            loop {
                tokio::time::sleep(MONITOR_INTERVAL).await;
                let addresses = match adapter.device_addresses().await {
                    Ok(addresses) => addresses,
                    Err(e) => {
                        error!("Failed to query device addresses: {}", e);
                        continue;
                    }
                };

                let mut now = HashSet::new();
                for address in addresses {
                    let Ok(device) = adapter.device(address) else {
                        continue;
                    };
                    if device.is_connected().await.unwrap_or(false) {
                        now.insert(address);
                        if !connected.contains(&address) {
                            let name = device.alias().await.ok();
                            let peer = PeerIdentity::new(address.to_string(), name);
                            callback.on_connection_state_change(
                                &peer,
                                GattStatus::SUCCESS,
                                LinkState::Connected,
                            );
                        }
                    }
                }
                for gone in connected.difference(&now) {
                    let peer = PeerIdentity::new(gone.to_string(), None);
                    callback.on_connection_state_change(
                        &peer,
                        GattStatus::SUCCESS,
                        LinkState::Disconnected,
                    );
                }
                connected = now;
            }
        });
        if let Some(previous) = self.monitor.lock().replace(task) {
            previous.abort();
        }
    }
}

async fn notification_loop(
    characteristic: Uuid,
    mut notifier: CharacteristicNotifier,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
    callback: Arc<dyn GattServerCallback>,
) {
    let subscriber = PeerIdentity::new(ANY_SUBSCRIBER, None);
    let enable = if notifier.confirming() {
        cccd::ENABLE_INDICATION
    } else {
        cccd::ENABLE_NOTIFICATION
    };
    let subscription = |value: &[u8]| DescriptorWriteRequest {
        request_id: 0,
        characteristic,
        descriptor: CCCD_UUID,
        value: value.to_vec(),
        response_needed: false,
    };
    callback.on_descriptor_write_request(&subscriber, subscription(&enable));
    debug!("Notification session started for {}", characteristic);

    let mut rx = rx.lock().await;
    while let Some(value) = rx.recv().await {
        match notifier.notify(value).await {
            Ok(()) => callback.on_notification_sent(&subscriber, GattStatus::SUCCESS),
            Err(e) => {
                warn!("Notification on {} failed: {}", characteristic, e);
                callback.on_notification_sent(&subscriber, GattStatus::FAILURE);
                break;
            }
        }
    }

    callback.on_descriptor_write_request(&subscriber, subscription(&cccd::DISABLE));
    debug!("Notification session ended for {}", characteristic);
}

#[async_trait]
impl GattServerHandle for BluezServer {
    async fn add_service(&self, service: ServiceDefinition) -> BleResult<()> {
        let characteristics = service
            .characteristics
            .iter()
            .map(|c| self.build_characteristic(c))
            .collect();
        let application = Application {
            services: vec![Service {
                uuid: service.uuid,
                primary: service.primary,
                characteristics,
                ..Default::default()
            }],
            ..Default::default()
        };

        let handle = self
            .adapter
            .serve_gatt_application(application)
            .await
            .map_err(|e| {
                error!("Failed to register GATT application: {}", e);
                BleError::ResourceUnavailable(format!("GATT application: {}", e))
            })?;
        info!("GATT service {} registered", service.uuid);

        self.characteristics
            .lock()
            .extend(service.characteristics.iter().map(|c| c.uuid));
        *self.application.lock() = Some(handle);
        self.start_monitor();
        Ok(())
    }

    fn set_value(&self, characteristic: Uuid, value: Vec<u8>) -> bool {
        if !self.characteristics.lock().contains(&characteristic) {
            return false;
        }
        let mut values = self.values.lock();
        let version = values.get(&characteristic).map_or(1, |(v, _)| v + 1);
        values.insert(characteristic, (version, value));
        true
    }

    fn notify_characteristic_changed(
        &self,
        _device: &PeerIdentity,
        characteristic: Uuid,
        _confirm: bool,
    ) -> bool {
        let Some((version, value)) = self.values.lock().get(&characteristic).cloned() else {
            return false;
        };
        let mut notifiers = self.notifiers.lock();
        let Some(slot) = notifiers.get_mut(&characteristic) else {
            return false;
        };
        // BlueZ fans a notification out to every subscriber, so each
        // version is handed over once no matter how many clients asked.
        if slot.sent < version {
            slot.sent = version;
            return slot.tx.send(value).is_ok();
        }
        true
    }

    fn close(&self) {
        if let Some(task) = self.monitor.lock().take() {
            task.abort();
        }
        self.notifiers.lock().clear();
        if self.application.lock().take().is_some() {
            info!("GATT application unregistered");
        }
    }
}

// ----------------------------------------------------------------------------
// GATT client
// ----------------------------------------------------------------------------

#[derive(Default)]
struct LinkTasks {
    connect: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
    subscriptions: HashMap<Uuid, JoinHandle<()>>,
}

struct BluezLink {
    handle: Handle,
    identity: PeerIdentity,
    device: bluer::Device,
    callback: Arc<dyn GattClientCallback>,
    characteristics: Arc<Mutex<HashMap<Uuid, remote::Characteristic>>>,
    tasks: Mutex<LinkTasks>,
    /// Set by `close`; a connect that completes afterwards is torn down.
    closed: Arc<AtomicBool>,
}

impl BluezLink {
    fn characteristic(&self, uuid: Uuid) -> Option<remote::Characteristic> {
        self.characteristics.lock().get(&uuid).cloned()
    }

    fn watch_disconnect(&self) {
        let device = self.device.clone();
        let identity = self.identity.clone();
        let callback = self.callback.clone();
        let task = self.handle.spawn(async move {
            let Ok(events) = device.events().await else {
                return;
            };
            let mut events = Box::pin(events);
            while let Some(event) = events.next().await {
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                    callback.on_connection_state_change(
                        &identity,
                        GattStatus::SUCCESS,
                        LinkState::Disconnected,
                    );
                    return;
                }
            }
        });
        if let Some(previous) = self.tasks.lock().watcher.replace(task) {
            previous.abort();
        }
    }
}

/// Descriptors registered with the application. BlueZ adds its own CCCD
/// to characteristics that notify or indicate and tracks subscriptions
/// through `StartNotify`, so those are skipped.
fn external_descriptors(definition: &CharacteristicDefinition) -> Vec<&DescriptorDefinition> {
    let managed = definition.properties.contains(CharProperties::NOTIFY)
        || definition.properties.contains(CharProperties::INDICATE);
    definition
        .descriptors
        .iter()
        .filter(|d| !(managed && d.uuid == CCCD_UUID))
        .collect()
}

/// What a finished connect attempt should do.
#[derive(Debug, PartialEq, Eq)]
enum ConnectOutcome {
    Report(GattStatus, LinkState),
    /// Connected after the link was closed.
    DropLink,
    Ignore,
}

fn connect_outcome(closed: bool, connected: bool) -> ConnectOutcome {
    match (closed, connected) {
        (true, true) => ConnectOutcome::DropLink,
        (true, false) => ConnectOutcome::Ignore,
        (false, true) => ConnectOutcome::Report(GattStatus::SUCCESS, LinkState::Connected),
        (false, false) => ConnectOutcome::Report(GattStatus::ERROR, LinkState::Disconnected),
    }
}

fn properties_of(flags: &bluer::gatt::CharacteristicFlags) -> CharProperties {
    let mut properties = CharProperties::default();
    for (set, bit) in [
        (flags.read, CharProperties::READ),
        (flags.write, CharProperties::WRITE),
        (flags.write_without_response, CharProperties::WRITE_NO_RESPONSE),
        (flags.notify, CharProperties::NOTIFY),
        (flags.indicate, CharProperties::INDICATE),
    ] {
        if set {
            properties = properties | bit;
        }
    }
    properties
}

async fn discover(
    device: &bluer::Device,
) -> bluer::Result<(Vec<RemoteService>, HashMap<Uuid, remote::Characteristic>)> {
    let mut services = Vec::new();
    let mut handles = HashMap::new();
    for service in device.services().await? {
        let service_uuid = service.uuid().await?;
        let mut characteristics = Vec::new();
        for characteristic in service.characteristics().await? {
            let uuid = characteristic.uuid().await?;
            let flags = characteristic.flags().await?;
            characteristics.push(RemoteCharacteristic {
                service: service_uuid,
                uuid,
                properties: properties_of(&flags),
            });
            handles.insert(uuid, characteristic);
        }
        services.push(RemoteService {
            uuid: service_uuid,
            characteristics,
        });
    }
    Ok((services, handles))
}

impl GattLink for BluezLink {
    fn device(&self) -> &PeerIdentity {
        &self.identity
    }

    fn connect(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let device = self.device.clone();
        let identity = self.identity.clone();
        let callback = self.callback.clone();
        let closed = self.closed.clone();
        self.watch_disconnect();
        let task = self.handle.spawn(async move {
            let result = device.connect().await;
            if let Err(e) = &result {
                warn!("Connection to {} failed: {}", identity, e);
            }
            match connect_outcome(closed.load(Ordering::SeqCst), result.is_ok()) {
                ConnectOutcome::Report(status, state) => {
                    if state == LinkState::Connected {
                        info!("Connected to {}", identity);
                    }
                    callback.on_connection_state_change(&identity, status, state);
                }
                ConnectOutcome::DropLink => {
                    debug!("Link to {} closed while connecting, disconnecting", identity);
                    if let Err(e) = device.disconnect().await {
                        warn!("Failed to drop late connection to {}: {}", identity, e);
                    }
                }
                ConnectOutcome::Ignore => {}
            }
        });
        if let Some(previous) = self.tasks.lock().connect.replace(task) {
            previous.abort();
        }
        true
    }

    fn discover_services(&self) -> bool {
        let device = self.device.clone();
        let identity = self.identity.clone();
        let callback = self.callback.clone();
        let cache = self.characteristics.clone();
        self.handle.spawn(async move {
            match discover(&device).await {
                Ok((services, handles)) => {
                    *cache.lock() = handles;
                    callback.on_services_discovered(&identity, GattStatus::SUCCESS, services);
                }
                Err(e) => {
                    warn!("Service discovery on {} failed: {}", identity, e);
                    callback.on_services_discovered(&identity, GattStatus::FAILURE, Vec::new());
                }
            }
        });
        true
    }

    fn write_characteristic(
        &self,
        _service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
        write_type: WriteType,
    ) -> bool {
        let Some(remote) = self.characteristic(characteristic) else {
            return false;
        };
        let identity = self.identity.clone();
        let callback = self.callback.clone();
        let request = remote::CharacteristicWriteRequest {
            op_type: match write_type {
                WriteType::Default => WriteOp::Request,
                WriteType::NoResponse => WriteOp::Command,
            },
            ..Default::default()
        };
        self.handle.spawn(async move {
            let status = match remote.write_ext(&value, &request).await {
                Ok(()) => GattStatus::SUCCESS,
                Err(e) => {
                    warn!("Write to {} failed: {}", identity, e);
                    gatt_status(&e)
                }
            };
            callback.on_characteristic_write(&identity, characteristic, status);
        });
        true
    }

    fn read_characteristic(&self, _service: Uuid, characteristic: Uuid) -> bool {
        let Some(remote) = self.characteristic(characteristic) else {
            return false;
        };
        let identity = self.identity.clone();
        let callback = self.callback.clone();
        self.handle.spawn(async move {
            match remote.read().await {
                Ok(value) => callback.on_characteristic_read(
                    &identity,
                    characteristic,
                    value,
                    GattStatus::SUCCESS,
                ),
                Err(e) => {
                    warn!("Read from {} failed: {}", identity, e);
                    callback.on_characteristic_read(
                        &identity,
                        characteristic,
                        Vec::new(),
                        gatt_status(&e),
                    );
                }
            }
        });
        true
    }

    fn set_notification(&self, _service: Uuid, characteristic: Uuid, enable: bool) -> bool {
        let Some(remote) = self.characteristic(characteristic) else {
            return false;
        };
        let identity = self.identity.clone();
        let callback = self.callback.clone();

        if !enable {
            if let Some(task) = self.tasks.lock().subscriptions.remove(&characteristic) {
                task.abort();
            }
            callback.on_descriptor_write(&identity, characteristic, GattStatus::SUCCESS);
            return true;
        }

        let task = self.handle.spawn(async move {
            let values = match remote.notify().await {
                Ok(values) => values,
                Err(e) => {
                    warn!("Subscribing to {} on {} failed: {}", characteristic, identity, e);
                    callback.on_descriptor_write(&identity, characteristic, gatt_status(&e));
                    return;
                }
            };
            callback.on_descriptor_write(&identity, characteristic, GattStatus::SUCCESS);
            let mut values = Box::pin(values);
            while let Some(value) = values.next().await {
                callback.on_characteristic_changed(&identity, characteristic, value);
            }
        });
        if let Some(previous) = self.tasks.lock().subscriptions.insert(characteristic, task) {
            previous.abort();
        }
        true
    }

    fn disconnect(&self) {
        let device = self.device.clone();
        let identity = self.identity.clone();
        self.handle.spawn(async move {
            if let Err(e) = device.disconnect().await {
                warn!("Disconnect from {} failed: {}", identity, e);
            }
        });
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut tasks = self.tasks.lock();
        // Detached, not aborted: a connect still in flight sees `closed`
        // and drops the link once BlueZ completes it.
        tasks.connect.take();
        if let Some(watcher) = tasks.watcher.take() {
            watcher.abort();
        }
        for (_, task) in tasks.subscriptions.drain() {
            task.abort();
        }
        self.characteristics.lock().clear();
    }
}
