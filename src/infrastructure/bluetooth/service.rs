//! Bluetooth Service Module
//!
//! The session manager: one facade over adapter capability queries,
//! discovery and the single GATT connection.

use crate::domain::models::{
    CharacteristicRef, ConnectionState, DiscoveryPhase, GattEvent, GattService, Peripheral,
    PeripheralAddress, RadioState,
};
use crate::domain::settings::SessionSettings;
use crate::infrastructure::bluetooth::{
    connection::ConnectionSession,
    events::{Dispatcher, Observable},
    platform::{adapter_available, BluetoothAdapter, EnablePrompt, Platform},
    scanner::DiscoveryController,
};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

/// Central-role session over one adapter and at most one peripheral
pub struct SessionManager {
    adapter: Option<Arc<dyn BluetoothAdapter>>,
    prompt: Arc<dyn EnablePrompt>,
    dispatcher: Dispatcher,
    discovery: DiscoveryController,
    connection: ConnectionSession,
}

impl SessionManager {
    /// Take over `platform` and start the event dispatch thread
    pub fn new(platform: Platform, settings: &SessionSettings) -> Result<Self> {
        let Platform {
            adapter,
            events,
            gatt,
            prompt,
        } = platform;

        let dispatcher = Dispatcher::spawn(events, &settings.dispatch_thread_name)?;
        let discovery = DiscoveryController::new(adapter.clone(), dispatcher.clone());
        let connection = ConnectionSession::new(adapter.clone(), gatt);

        info!(
            available = adapter_available(adapter.as_ref()),
            "Session manager ready"
        );

        Ok(Self {
            adapter,
            prompt,
            dispatcher,
            discovery,
            connection,
        })
    }

    /// Radio present and its address readable
    pub fn is_bluetooth_available(&self) -> bool {
        adapter_available(self.adapter.as_ref())
    }

    pub fn is_bluetooth_enabled(&self) -> bool {
        self.adapter
            .as_ref()
            .map(|adapter| adapter.is_enabled())
            .unwrap_or(false)
    }

    pub fn radio_state(&self) -> Option<RadioState> {
        self.adapter.as_ref().map(|adapter| adapter.state())
    }

    /// Ask the surrounding application to prompt the user to turn the radio
    /// on. Returns whether a prompt was requested; re-check with
    /// [`is_bluetooth_enabled`](Self::is_bluetooth_enabled) afterwards.
    pub fn enable_bluetooth(&self) -> bool {
        if self.adapter.is_none() || self.is_bluetooth_enabled() {
            return false;
        }
        info!("Requesting the user to enable Bluetooth");
        self.prompt.request_enable();
        true
    }

    pub fn discovery(&self) -> &DiscoveryController {
        &self.discovery
    }

    pub fn connection(&self) -> &ConnectionSession {
        &self.connection
    }

    // Discovery

    pub fn start_discovery(&self) -> bool {
        self.discovery.start_discovery()
    }

    pub fn cancel_discovery(&self) -> bool {
        self.discovery.cancel_discovery()
    }

    pub fn is_discovering(&self) -> bool {
        self.discovery.is_discovering()
    }

    pub fn discovery_phase(&self) -> DiscoveryPhase {
        self.discovery.phase()
    }

    pub fn observe_devices(&self) -> Observable<Peripheral> {
        self.discovery.observe_devices()
    }

    pub fn observe_discovery_phase(&self) -> Observable<DiscoveryPhase> {
        self.discovery.observe_discovery_phase()
    }

    pub fn observe_discovery_started(&self) -> Observable<DiscoveryPhase> {
        self.discovery.observe_discovery_started()
    }

    pub fn observe_discovery_finished(&self) -> Observable<DiscoveryPhase> {
        self.discovery.observe_discovery_finished()
    }

    pub fn observe_adapter_state(&self) -> Observable<RadioState> {
        self.discovery.observe_adapter_state()
    }

    // Connection

    /// Register the single GATT event listener, replacing any previous one
    pub fn set_gatt_events(&self, listener: mpsc::UnboundedSender<GattEvent>) {
        self.connection.set_listener(listener);
    }

    /// Register a fresh listener channel and hand back its receiving end
    pub fn gatt_events(&self) -> mpsc::UnboundedReceiver<GattEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connection.set_listener(tx);
        rx
    }

    pub fn connect(&self, address: &str) -> bool {
        self.connection.connect(address)
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    pub fn close(&self) {
        self.connection.close();
    }

    pub fn read_characteristic(&self, characteristic: &CharacteristicRef) {
        self.connection.read_characteristic(characteristic);
    }

    pub fn write_characteristic_byte(&self, characteristic: &CharacteristicRef, value: u8) -> bool {
        self.connection
            .write_characteristic_byte(characteristic, value)
    }

    pub fn write_characteristic(&self, characteristic: &CharacteristicRef, value: &[u8]) -> bool {
        self.connection.write_characteristic(characteristic, value)
    }

    pub fn set_characteristic_notification(
        &self,
        characteristic: &CharacteristicRef,
        enabled: bool,
    ) -> bool {
        self.connection
            .set_characteristic_notification(characteristic, enabled)
    }

    pub fn supported_services(&self) -> Option<Vec<GattService>> {
        self.connection.supported_services()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn connected_address(&self) -> Option<PeripheralAddress> {
        self.connection.address()
    }

    /// Wait until all pending subscribe/unsubscribe requests are applied
    pub async fn flush(&self) {
        self.dispatcher.flush().await;
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.connection.close();
    }
}
