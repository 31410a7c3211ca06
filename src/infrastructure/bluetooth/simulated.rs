//! Simulated Platform
//!
//! In-memory radio, event source and GATT driver. Every request is recorded,
//! and nothing happens asynchronously on its own: callers inject broadcasts
//! and GATT callbacks explicitly, which makes the session's behavior
//! reproducible in tests and in the demo binary.

use crate::domain::models::{
    CharacteristicRef, GattCallback, GattService, GattStatus, LinkState, Peripheral,
    PeripheralAddress, RadioState, WriteType,
};
use crate::infrastructure::bluetooth::connection::GattCallbackSink;
use crate::infrastructure::bluetooth::lock;
use crate::infrastructure::bluetooth::platform::{
    BluetoothAdapter, EnablePrompt, EventFilter, GattClient, GattDriver, Platform,
    PlatformEvent, PlatformEventSource, PlatformReceiver, RegistrationId, RemoteDevice,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Default)]
struct EventRegistry {
    next_id: u64,
    receivers: HashMap<RegistrationId, (EventFilter, PlatformReceiver)>,
    removed: usize,
    unregister_threads: Vec<Option<String>>,
}

/// Broadcast source whose clones share one registry
#[derive(Clone, Default)]
pub struct SimulatedEventSource {
    registry: Arc<Mutex<EventRegistry>>,
}

impl SimulatedEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to every matching registration on the calling thread.
    /// Returns how many receivers saw it.
    pub fn emit(&self, event: PlatformEvent) -> usize {
        let receivers: Vec<PlatformReceiver> = lock(&self.registry)
            .receivers
            .values()
            .filter(|(filter, _)| filter.matches(&event))
            .map(|(_, receiver)| receiver.clone())
            .collect();

        for receiver in &receivers {
            receiver(&event);
        }
        receivers.len()
    }

    pub fn active_registrations(&self) -> usize {
        lock(&self.registry).receivers.len()
    }

    pub fn removed_registrations(&self) -> usize {
        lock(&self.registry).removed
    }

    /// Name of the thread each successful unregister ran on
    pub fn unregister_threads(&self) -> Vec<Option<String>> {
        lock(&self.registry).unregister_threads.clone()
    }
}

impl PlatformEventSource for SimulatedEventSource {
    fn register(&mut self, filter: EventFilter, receiver: PlatformReceiver) -> RegistrationId {
        let mut registry = lock(&self.registry);
        registry.next_id += 1;
        let id = RegistrationId(registry.next_id);
        registry.receivers.insert(id, (filter, receiver));
        id
    }

    fn unregister(&mut self, id: RegistrationId) -> bool {
        let mut registry = lock(&self.registry);
        if registry.receivers.remove(&id).is_none() {
            return false;
        }
        registry.removed += 1;
        registry
            .unregister_threads
            .push(std::thread::current().name().map(str::to_string));
        true
    }
}

/// Local radio. Discovery start/stop is broadcast through the event source
/// like a real stack does.
pub struct SimulatedAdapter {
    address: Option<String>,
    enabled: AtomicBool,
    discovering: AtomicBool,
    events: SimulatedEventSource,
}

impl SimulatedAdapter {
    pub fn new(events: SimulatedEventSource) -> Self {
        Self {
            address: Some("00:1A:7D:DA:71:13".to_string()),
            enabled: AtomicBool::new(true),
            discovering: AtomicBool::new(false),
            events,
        }
    }

    /// A radio whose hardware address cannot be read
    pub fn without_address(events: SimulatedEventSource) -> Self {
        Self {
            address: None,
            ..Self::new(events)
        }
    }

    /// Toggle the radio, broadcasting the intermediate state first
    pub fn set_enabled(&self, enabled: bool) {
        if self.enabled.swap(enabled, Ordering::SeqCst) == enabled {
            return;
        }
        if enabled {
            self.events
                .emit(PlatformEvent::AdapterStateChanged(RadioState::TurningOn));
            self.events
                .emit(PlatformEvent::AdapterStateChanged(RadioState::On));
        } else {
            if self.discovering.swap(false, Ordering::SeqCst) {
                self.events.emit(PlatformEvent::DiscoveryFinished);
            }
            self.events
                .emit(PlatformEvent::AdapterStateChanged(RadioState::TurningOff));
            self.events
                .emit(PlatformEvent::AdapterStateChanged(RadioState::Off));
        }
    }

    /// An advertiser was heard during discovery
    pub fn announce(&self, peripheral: Peripheral) {
        self.events.emit(PlatformEvent::DeviceFound(peripheral));
    }

    /// The inquiry ran to completion
    pub fn finish_discovery(&self) {
        if self.discovering.swap(false, Ordering::SeqCst) {
            self.events.emit(PlatformEvent::DiscoveryFinished);
        }
    }
}

impl BluetoothAdapter for SimulatedAdapter {
    fn address(&self) -> Option<String> {
        self.address.clone()
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn state(&self) -> RadioState {
        if self.is_enabled() {
            RadioState::On
        } else {
            RadioState::Off
        }
    }

    fn start_discovery(&self) -> bool {
        if !self.is_enabled() || self.discovering.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.events.emit(PlatformEvent::DiscoveryStarted);
        true
    }

    fn cancel_discovery(&self) -> bool {
        if !self.is_enabled() {
            return false;
        }
        if self.discovering.swap(false, Ordering::SeqCst) {
            self.events.emit(PlatformEvent::DiscoveryFinished);
        }
        true
    }

    fn is_discovering(&self) -> bool {
        self.discovering.load(Ordering::SeqCst)
    }
}

/// Everything a simulated client was asked to do
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientLog {
    pub connect_requests: usize,
    pub disconnect_requests: usize,
    pub discover_requests: usize,
    pub closed: bool,
    pub reads: Vec<CharacteristicRef>,
    pub writes: Vec<(CharacteristicRef, Vec<u8>, WriteType)>,
    pub notifications: Vec<(CharacteristicRef, bool)>,
}

/// GATT client for one remote device
pub struct SimulatedGattClient {
    device: RemoteDevice,
    auto_connect: bool,
    sink: GattCallbackSink,
    accepts_requests: AtomicBool,
    services: Mutex<Vec<GattService>>,
    log: Mutex<ClientLog>,
}

impl SimulatedGattClient {
    pub fn device(&self) -> &RemoteDevice {
        &self.device
    }

    pub fn auto_connect(&self) -> bool {
        self.auto_connect
    }

    pub fn log(&self) -> ClientLog {
        lock(&self.log).clone()
    }

    /// When false every request is refused locally
    pub fn set_accepts_requests(&self, accepts: bool) {
        self.accepts_requests.store(accepts, Ordering::SeqCst);
    }

    /// Service tree returned once discovery completes
    pub fn set_services(&self, services: Vec<GattService>) {
        *lock(&self.services) = services;
    }

    pub fn sink(&self) -> &GattCallbackSink {
        &self.sink
    }

    pub fn report_connected(&self) {
        self.sink.deliver(self, GattCallback::ConnectionStateChanged {
            status: GattStatus::Success,
            new_state: LinkState::Connected,
        });
    }

    pub fn report_disconnected(&self) {
        self.sink.deliver(self, GattCallback::ConnectionStateChanged {
            status: GattStatus::Success,
            new_state: LinkState::Disconnected,
        });
    }

    pub fn report_services_discovered(&self, success: bool) {
        self.sink.deliver(self, GattCallback::ServicesDiscovered {
            status: status(success),
        });
    }

    pub fn report_read(&self, characteristic: CharacteristicRef, value: Vec<u8>, success: bool) {
        self.sink.deliver(self, GattCallback::CharacteristicRead {
            characteristic,
            value,
            status: status(success),
        });
    }

    pub fn report_write(&self, characteristic: CharacteristicRef, success: bool) {
        self.sink.deliver(self, GattCallback::CharacteristicWrite {
            characteristic,
            status: status(success),
        });
    }

    pub fn report_changed(&self, characteristic: CharacteristicRef, value: Vec<u8>) {
        self.sink.deliver(self, GattCallback::CharacteristicChanged {
            characteristic,
            value,
        });
    }

    fn accepts(&self) -> bool {
        !lock(&self.log).closed && self.accepts_requests.load(Ordering::SeqCst)
    }
}

fn status(success: bool) -> GattStatus {
    if success {
        GattStatus::Success
    } else {
        // GATT_FAILURE
        GattStatus::Failure(0x85)
    }
}

impl GattClient for SimulatedGattClient {
    fn connect(&self) -> bool {
        if !self.accepts() {
            return false;
        }
        lock(&self.log).connect_requests += 1;
        true
    }

    fn disconnect(&self) {
        lock(&self.log).disconnect_requests += 1;
    }

    fn close(&self) {
        lock(&self.log).closed = true;
    }

    fn discover_services(&self) -> bool {
        if !self.accepts() {
            return false;
        }
        lock(&self.log).discover_requests += 1;
        true
    }

    fn read_characteristic(&self, characteristic: &CharacteristicRef) -> bool {
        if !self.accepts() {
            return false;
        }
        lock(&self.log).reads.push(*characteristic);
        true
    }

    fn write_characteristic(
        &self,
        characteristic: &CharacteristicRef,
        value: &[u8],
        write_type: WriteType,
    ) -> bool {
        if !self.accepts() {
            return false;
        }
        lock(&self.log)
            .writes
            .push((*characteristic, value.to_vec(), write_type));
        true
    }

    fn set_characteristic_notification(
        &self,
        characteristic: &CharacteristicRef,
        enabled: bool,
    ) -> bool {
        if !self.accepts() {
            return false;
        }
        lock(&self.log).notifications.push((*characteristic, enabled));
        true
    }

    fn services(&self) -> Vec<GattService> {
        lock(&self.services).clone()
    }
}

/// Resolves only the devices it was told about
#[derive(Default)]
pub struct SimulatedGattDriver {
    known: Mutex<HashMap<PeripheralAddress, Option<String>>>,
    clients: Mutex<Vec<Arc<SimulatedGattClient>>>,
    refuse_connect: AtomicBool,
    connect_on_open: AtomicBool,
}

impl SimulatedGattDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, peripheral: &Peripheral) {
        lock(&self.known).insert(peripheral.address, peripheral.name.clone());
    }

    /// When true `connect_gatt` fails to open a client
    pub fn set_refuse_connect(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    /// When true the link reports connected before `connect_gatt` returns
    pub fn set_connect_on_open(&self, connect: bool) {
        self.connect_on_open.store(connect, Ordering::SeqCst);
    }

    /// Every client ever opened, oldest first
    pub fn clients(&self) -> Vec<Arc<SimulatedGattClient>> {
        lock(&self.clients).clone()
    }

    pub fn last_client(&self) -> Option<Arc<SimulatedGattClient>> {
        lock(&self.clients).last().cloned()
    }
}

impl GattDriver for SimulatedGattDriver {
    fn resolve_device(&self, address: &PeripheralAddress) -> Option<RemoteDevice> {
        lock(&self.known).get(address).map(|name| RemoteDevice {
            address: *address,
            name: name.clone(),
        })
    }

    fn connect_gatt(
        &self,
        device: &RemoteDevice,
        auto_connect: bool,
        sink: GattCallbackSink,
    ) -> Option<Arc<dyn GattClient>> {
        if self.refuse_connect.load(Ordering::SeqCst) {
            return None;
        }

        debug!(address = %device.address, auto_connect, "Opening simulated GATT client");
        let client = Arc::new(SimulatedGattClient {
            device: device.clone(),
            auto_connect,
            sink,
            accepts_requests: AtomicBool::new(true),
            services: Mutex::new(Vec::new()),
            log: Mutex::new(ClientLog {
                connect_requests: 1,
                ..ClientLog::default()
            }),
        });
        lock(&self.clients).push(client.clone());
        if self.connect_on_open.load(Ordering::SeqCst) {
            client.report_connected();
        }
        Some(client)
    }
}

#[derive(Default)]
pub struct SimulatedPrompt {
    requests: AtomicUsize,
}

impl SimulatedPrompt {
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl EnablePrompt for SimulatedPrompt {
    fn request_enable(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }
}

/// The pieces of a simulated host stack, kept around so callers can drive
/// them after handing a [`Platform`] to the session manager
pub struct SimulatedPlatform {
    pub adapter: Arc<SimulatedAdapter>,
    pub events: SimulatedEventSource,
    pub gatt: Arc<SimulatedGattDriver>,
    pub prompt: Arc<SimulatedPrompt>,
}

impl Default for SimulatedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPlatform {
    pub fn new() -> Self {
        let events = SimulatedEventSource::new();
        Self {
            adapter: Arc::new(SimulatedAdapter::new(events.clone())),
            events,
            gatt: Arc::new(SimulatedGattDriver::new()),
            prompt: Arc::new(SimulatedPrompt::default()),
        }
    }

    /// Register a peripheral the driver can resolve, returning it for
    /// announcing later
    pub fn add_peripheral(&self, address: &str, name: Option<&str>) -> Option<Peripheral> {
        let address = address.parse().ok()?;
        let peripheral = Peripheral::new(address, name.map(str::to_string));
        self.gatt.add_device(&peripheral);
        Some(peripheral)
    }

    pub fn platform(&self) -> Platform {
        let adapter: Arc<dyn BluetoothAdapter> = self.adapter.clone();
        Platform {
            adapter: Some(adapter),
            ..self.platform_without_radio()
        }
    }

    /// Same stack, but the device reports no Bluetooth radio at all
    pub fn platform_without_radio(&self) -> Platform {
        Platform {
            adapter: None,
            events: Box::new(self.events.clone()),
            gatt: self.gatt.clone(),
            prompt: self.prompt.clone(),
        }
    }
}
