//! BLE Connection Module
//!
//! Owns the single GATT link: connect, automatic service discovery,
//! characteristic access and teardown. Platform callbacks come back through
//! a [`GattCallbackSink`] and are translated into [`GattEvent`]s for the
//! registered listener.

use crate::domain::models::{
    CharacteristicRef, ConnectionState, GattCallback, GattEvent, GattService, LinkState,
    PeripheralAddress, WriteType,
};
use crate::infrastructure::bluetooth::lock;
use crate::infrastructure::bluetooth::platform::{
    adapter_available, BluetoothAdapter, GattClient, GattDriver,
};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Default)]
struct SessionState {
    address: Option<PeripheralAddress>,
    state: ConnectionState,
    client: Option<Arc<dyn GattClient>>,
    services: Option<Vec<GattService>>,
    /// Bumped whenever the client is discarded, so late callbacks from an
    /// old client can be told apart
    generation: u64,
    listener: Option<mpsc::UnboundedSender<GattEvent>>,
}

/// GATT connection to at most one peripheral
pub struct ConnectionSession {
    adapter: Option<Arc<dyn BluetoothAdapter>>,
    driver: Arc<dyn GattDriver>,
    shared: Arc<Mutex<SessionState>>,
}

impl ConnectionSession {
    pub fn new(adapter: Option<Arc<dyn BluetoothAdapter>>, driver: Arc<dyn GattDriver>) -> Self {
        Self {
            adapter,
            driver,
            shared: Arc::new(Mutex::new(SessionState::default())),
        }
    }

    /// Route GATT events to `listener`, replacing any previous one
    pub fn set_listener(&self, listener: mpsc::UnboundedSender<GattEvent>) {
        lock(&self.shared).listener = Some(listener);
    }

    pub fn clear_listener(&self) {
        lock(&self.shared).listener = None;
    }

    /// Connect to `address`.
    ///
    /// The same address with a live client re-issues the connect on that
    /// client and reports its outcome as is. Any other address discards the
    /// current client and opens a direct (non auto-connect) link.
    pub fn connect(&self, address: &str) -> bool {
        if !adapter_available(self.adapter.as_ref()) {
            warn!("Cannot connect to {}: Bluetooth unavailable", address);
            return false;
        }

        let address: PeripheralAddress = match address.parse() {
            Ok(address) => address,
            Err(e) => {
                warn!("Cannot connect to {:?}: {}", address, e);
                return false;
            }
        };

        if let Some(connected) = self.reconnect(address) {
            return connected;
        }

        let Some(device) = self.driver.resolve_device(&address) else {
            warn!("Cannot connect to {}: device not resolvable", address);
            return false;
        };

        let (stale, generation) = {
            let mut state = lock(&self.shared);
            state.generation += 1;
            state.address = Some(address);
            state.state = ConnectionState::Connecting;
            state.services = None;
            (state.client.take(), state.generation)
        };
        if let Some(stale) = stale {
            debug!("Closing GATT client of previous peripheral");
            stale.close();
        }

        let sink = GattCallbackSink {
            session: Arc::downgrade(&self.shared),
            generation,
            address,
        };

        info!("Connecting to {}", address);
        match self.driver.connect_gatt(&device, false, sink) {
            Some(client) => {
                let mut state = lock(&self.shared);
                if state.generation == generation {
                    state.client = Some(client);
                } else {
                    drop(state);
                    // Closed while the client was being opened
                    client.close();
                }
                true
            }
            None => {
                warn!("Platform refused to open a GATT client to {}", address);
                let mut state = lock(&self.shared);
                if state.generation == generation {
                    state.address = None;
                    state.state = ConnectionState::Disconnected;
                }
                false
            }
        }
    }

    /// `Some(outcome)` when `address` is the current peripheral and its
    /// client is still held
    fn reconnect(&self, address: PeripheralAddress) -> Option<bool> {
        let (client, previous, generation) = {
            let mut state = lock(&self.shared);
            if state.address != Some(address) {
                return None;
            }
            let client = state.client.clone()?;
            let previous = state.state;
            if previous == ConnectionState::Disconnected {
                state.state = ConnectionState::Connecting;
            }
            (client, previous, state.generation)
        };

        info!("Reconnecting to {} on the existing GATT client", address);
        if client.connect() {
            return Some(true);
        }

        warn!("Reconnect to {} rejected by the platform", address);
        let mut state = lock(&self.shared);
        if state.generation == generation && state.state == ConnectionState::Connecting {
            state.state = previous;
        }
        Some(false)
    }

    /// Request link teardown. The client is kept for a later reconnect.
    pub fn disconnect(&self) {
        let client = {
            let mut state = lock(&self.shared);
            if state.client.is_some() {
                state.state = ConnectionState::Disconnected;
            }
            state.client.clone()
        };

        match client {
            Some(client) => {
                info!("Disconnecting");
                client.disconnect();
            }
            None => debug!("Disconnect ignored: no connection"),
        }
    }

    /// Release the client. Anything but `connect` is a no-op afterwards.
    pub fn close(&self) {
        let client = {
            let mut state = lock(&self.shared);
            state.generation += 1;
            state.address = None;
            state.state = ConnectionState::Disconnected;
            state.services = None;
            state.client.take()
        };

        if let Some(client) = client {
            info!("Closing GATT client");
            client.close();
        }
    }

    fn client(&self) -> Option<Arc<dyn GattClient>> {
        lock(&self.shared).client.clone()
    }

    /// Fire-and-forget; the value arrives as [`GattEvent::CharacteristicRead`]
    pub fn read_characteristic(&self, characteristic: &CharacteristicRef) {
        let Some(client) = self.client() else {
            debug!("Read ignored: no connection");
            return;
        };
        if !client.read_characteristic(characteristic) {
            warn!("Read of {} rejected by the platform", characteristic.uuid);
        }
    }

    /// Write a single unsigned byte
    pub fn write_characteristic_byte(&self, characteristic: &CharacteristicRef, value: u8) -> bool {
        self.write_characteristic(characteristic, &[value])
    }

    /// Write without response. Returns whether the platform queued the
    /// write; delivery is reported later as [`GattEvent::CharacteristicWrite`].
    pub fn write_characteristic(&self, characteristic: &CharacteristicRef, value: &[u8]) -> bool {
        let Some(client) = self.client() else {
            debug!("Write ignored: no connection");
            return false;
        };

        let accepted =
            client.write_characteristic(characteristic, value, WriteType::WithoutResponse);
        if !accepted {
            warn!("Write to {} rejected by the platform", characteristic.uuid);
        }
        accepted
    }

    /// Toggle local delivery of value-changed notifications
    pub fn set_characteristic_notification(
        &self,
        characteristic: &CharacteristicRef,
        enabled: bool,
    ) -> bool {
        let Some(client) = self.client() else {
            debug!("Notification toggle ignored: no connection");
            return false;
        };
        client.set_characteristic_notification(characteristic, enabled)
    }

    /// Services from the last successful discovery
    pub fn supported_services(&self) -> Option<Vec<GattService>> {
        lock(&self.shared).services.clone()
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.shared).state
    }

    pub fn address(&self) -> Option<PeripheralAddress> {
        lock(&self.shared).address
    }
}

/// Where the platform delivers callbacks for one GATT client.
///
/// Safe to call from any thread. Callbacks from a client the session has
/// since discarded are dropped.
#[derive(Clone)]
pub struct GattCallbackSink {
    session: Weak<Mutex<SessionState>>,
    generation: u64,
    address: PeripheralAddress,
}

impl GattCallbackSink {
    pub fn address(&self) -> PeripheralAddress {
        self.address
    }

    /// `client` is the handle the callback was raised on. It may arrive
    /// before `connect_gatt` has returned that handle.
    pub fn deliver(&self, client: &dyn GattClient, callback: GattCallback) {
        let Some(shared) = self.session.upgrade() else {
            debug!("Callback after session shutdown ignored");
            return;
        };

        let listener = {
            let state = lock(&shared);
            if state.generation != self.generation {
                debug!(address = %self.address, ?callback, "Callback from discarded client ignored");
                return;
            }
            state.listener.clone()
        };

        let event = match callback {
            GattCallback::ConnectionStateChanged { status, new_state } => {
                let next = match new_state {
                    LinkState::Connected => ConnectionState::Connected,
                    LinkState::Disconnected => ConnectionState::Disconnected,
                    transitional => {
                        debug!(?transitional, ?status, "Transitional link state ignored");
                        return;
                    }
                };
                if !self.update(&shared, |state| state.state = next) {
                    return;
                }
                info!(address = %self.address, ?status, "Link {:?}", next);
                GattEvent::ConnectionStateChanged {
                    connected: next == ConnectionState::Connected,
                }
            }
            GattCallback::ServicesDiscovered { status } => {
                let success = status.is_success();
                let services = success.then(|| client.services());
                let count = services.as_ref().map_or(0, Vec::len);
                if !self.update(&shared, |state| state.services = services) {
                    return;
                }
                info!(address = %self.address, success, count, "Service discovery finished");
                GattEvent::ServicesDiscovered {
                    address: self.address,
                    success,
                }
            }
            GattCallback::CharacteristicRead {
                characteristic,
                value,
                status,
            } => GattEvent::CharacteristicRead {
                characteristic,
                value,
                success: status.is_success(),
            },
            GattCallback::CharacteristicWrite {
                characteristic,
                status,
            } => GattEvent::CharacteristicWrite {
                characteristic,
                success: status.is_success(),
            },
            GattCallback::CharacteristicChanged {
                characteristic,
                value,
            } => GattEvent::CharacteristicChanged {
                address: self.address,
                characteristic,
                value,
            },
        };

        let connected = event == GattEvent::ConnectionStateChanged { connected: true };

        match listener {
            Some(listener) => {
                if listener.send(event).is_err() {
                    debug!("Listener gone; event dropped");
                }
            }
            None => debug!(?event, "No listener registered"),
        }

        if connected && !client.discover_services() {
            warn!("Service discovery request rejected by the platform");
        }
    }

    /// Apply `f` unless the client was discarded meanwhile
    fn update(&self, shared: &Mutex<SessionState>, f: impl FnOnce(&mut SessionState)) -> bool {
        let mut state = lock(shared);
        if state.generation != self.generation {
            return false;
        }
        f(&mut state);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{properties, GattCharacteristic};
    use crate::infrastructure::bluetooth::simulated::{
        SimulatedAdapter, SimulatedEventSource, SimulatedGattDriver,
    };
    use uuid::Uuid;

    const ADDR_A: &str = "AA:BB:CC:DD:EE:FF";
    const ADDR_B: &str = "11:22:33:44:55:66";

    struct Fixture {
        driver: Arc<SimulatedGattDriver>,
        session: ConnectionSession,
        events: mpsc::UnboundedReceiver<GattEvent>,
    }

    fn fixture() -> Fixture {
        let adapter: Arc<dyn BluetoothAdapter> =
            Arc::new(SimulatedAdapter::new(SimulatedEventSource::new()));
        let driver = Arc::new(SimulatedGattDriver::new());
        for addr in [ADDR_A, ADDR_B] {
            driver.add_device(&crate::domain::models::Peripheral::new(
                addr.parse().unwrap(),
                None,
            ));
        }

        let session = ConnectionSession::new(Some(adapter), driver.clone());
        let (tx, events) = mpsc::unbounded_channel();
        session.set_listener(tx);
        Fixture {
            driver,
            session,
            events,
        }
    }

    fn characteristic() -> CharacteristicRef {
        CharacteristicRef::new(Uuid::from_u128(0xffe0), Uuid::from_u128(0xffe1))
    }

    fn service(n: u128) -> GattService {
        GattService {
            uuid: Uuid::from_u128(n),
            characteristics: vec![GattCharacteristic {
                uuid: Uuid::from_u128(n + 1),
                properties: properties::READ | properties::NOTIFY,
            }],
        }
    }

    #[test]
    fn test_connect_discover_scenario() {
        let mut f = fixture();

        assert!(f.session.connect(ADDR_A));
        assert_eq!(f.driver.clients().len(), 1);
        assert_eq!(f.session.state(), ConnectionState::Connecting);
        assert_eq!(f.session.address(), Some(ADDR_A.parse().unwrap()));

        let client = f.driver.last_client().unwrap();
        assert!(!client.auto_connect());

        client.report_connected();
        assert_eq!(f.session.state(), ConnectionState::Connected);
        assert_eq!(client.log().discover_requests, 1);
        assert_eq!(
            f.events.try_recv().unwrap(),
            GattEvent::ConnectionStateChanged { connected: true }
        );

        client.set_services(vec![service(0x1800), service(0x1801), service(0x180a)]);
        client.report_services_discovered(true);
        assert_eq!(
            f.events.try_recv().unwrap(),
            GattEvent::ServicesDiscovered {
                address: ADDR_A.parse().unwrap(),
                success: true,
            }
        );
        assert_eq!(f.session.supported_services().unwrap().len(), 3);
        assert!(f.events.try_recv().is_err());
    }

    #[test]
    fn test_services_absent_until_discovered() {
        let mut f = fixture();
        assert!(f.session.supported_services().is_none());

        f.session.connect(ADDR_A);
        let client = f.driver.last_client().unwrap();
        client.report_connected();
        client.set_services(vec![service(0x1800)]);
        client.report_services_discovered(false);

        let _ = f.events.try_recv();
        assert_eq!(
            f.events.try_recv().unwrap(),
            GattEvent::ServicesDiscovered {
                address: ADDR_A.parse().unwrap(),
                success: false,
            }
        );
        assert!(f.session.supported_services().is_none());
    }

    #[test]
    fn test_same_address_reuses_client() {
        let f = fixture();

        assert!(f.session.connect(ADDR_A));
        assert!(f.session.connect(ADDR_A));

        let clients = f.driver.clients();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].log().connect_requests, 2);
        assert!(!clients[0].log().closed);
    }

    #[test]
    fn test_lowercase_address_counts_as_same() {
        let f = fixture();

        assert!(f.session.connect(ADDR_A));
        assert!(f.session.connect(&ADDR_A.to_lowercase()));
        assert_eq!(f.driver.clients().len(), 1);
    }

    #[test]
    fn test_other_address_discards_client() {
        let f = fixture();

        assert!(f.session.connect(ADDR_A));
        assert!(f.session.connect(ADDR_B));

        let clients = f.driver.clients();
        assert_eq!(clients.len(), 2);
        assert!(clients[0].log().closed);
        assert!(!clients[1].log().closed);
        assert_eq!(f.session.address(), Some(ADDR_B.parse().unwrap()));
    }

    #[test]
    fn test_failed_reconnect_does_not_open_new_client() {
        let f = fixture();

        assert!(f.session.connect(ADDR_A));
        let client = f.driver.last_client().unwrap();
        client.report_disconnected();
        client.set_accepts_requests(false);

        assert!(!f.session.connect(ADDR_A));
        assert_eq!(f.driver.clients().len(), 1);
        assert_eq!(f.session.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_reconnect_while_connected_keeps_state() {
        let f = fixture();

        f.session.connect(ADDR_A);
        f.driver.last_client().unwrap().report_connected();
        assert!(f.session.connect(ADDR_A));
        assert_eq!(f.session.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_invalid_and_unknown_targets() {
        let f = fixture();

        f.driver.add_device(&crate::domain::models::Peripheral::new(
            "0A:BB:CC:DD:EE:FF".parse().unwrap(),
            None,
        ));

        assert!(!f.session.connect("not-an-address"));
        assert!(!f.session.connect("+A:BB:CC:DD:EE:FF"));
        assert!(!f.session.connect("DE:AD:BE:EF:00:01"));
        assert!(f.driver.clients().is_empty());
        assert_eq!(f.session.state(), ConnectionState::Disconnected);
        assert_eq!(f.session.address(), None);
    }

    #[test]
    fn test_unresolvable_target_keeps_current_connection() {
        let f = fixture();

        f.session.connect(ADDR_A);
        assert!(!f.session.connect("DE:AD:BE:EF:00:01"));
        assert!(!f.driver.clients()[0].log().closed);
        assert_eq!(f.session.address(), Some(ADDR_A.parse().unwrap()));
    }

    #[test]
    fn test_driver_refusal() {
        let f = fixture();
        f.driver.set_refuse_connect(true);

        assert!(!f.session.connect(ADDR_A));
        assert_eq!(f.session.state(), ConnectionState::Disconnected);
        assert_eq!(f.session.address(), None);
    }

    #[test]
    fn test_connect_without_adapter() {
        let driver = Arc::new(SimulatedGattDriver::new());
        let session = ConnectionSession::new(None, driver.clone());
        assert!(!session.connect(ADDR_A));

        let no_address: Arc<dyn BluetoothAdapter> =
            Arc::new(SimulatedAdapter::without_address(SimulatedEventSource::new()));
        let session = ConnectionSession::new(Some(no_address), driver.clone());
        assert!(!session.connect(ADDR_A));
        assert!(driver.clients().is_empty());
    }

    #[test]
    fn test_operations_without_client_are_silent() {
        let mut f = fixture();
        let c = characteristic();

        f.session.read_characteristic(&c);
        assert!(!f.session.write_characteristic_byte(&c, 1));
        assert!(!f.session.write_characteristic(&c, &[1, 2, 3]));
        assert!(!f.session.set_characteristic_notification(&c, true));
        f.session.disconnect();

        assert!(f.events.try_recv().is_err());
    }

    #[test]
    fn test_write_byte_then_remote_failure() {
        let mut f = fixture();
        let c = characteristic();

        f.session.connect(ADDR_A);
        let client = f.driver.last_client().unwrap();
        client.report_connected();
        let _ = f.events.try_recv();

        assert!(f.session.write_characteristic_byte(&c, 0x07));
        assert_eq!(
            client.log().writes,
            vec![(c, vec![0x07], WriteType::WithoutResponse)]
        );

        client.report_write(c, false);
        assert_eq!(
            f.events.try_recv().unwrap(),
            GattEvent::CharacteristicWrite {
                characteristic: c,
                success: false,
            }
        );
    }

    #[test]
    fn test_write_rejected_locally_emits_nothing() {
        let mut f = fixture();
        let c = characteristic();

        f.session.connect(ADDR_A);
        let client = f.driver.last_client().unwrap();
        client.set_accepts_requests(false);

        assert!(!f.session.write_characteristic(&c, b"hello"));
        assert!(f.events.try_recv().is_err());
    }

    #[test]
    fn test_read_and_notifications() {
        let mut f = fixture();
        let c = characteristic();

        f.session.connect(ADDR_A);
        let client = f.driver.last_client().unwrap();

        f.session.read_characteristic(&c);
        assert_eq!(client.log().reads, vec![c]);
        client.report_read(c, vec![42], true);
        assert_eq!(
            f.events.try_recv().unwrap(),
            GattEvent::CharacteristicRead {
                characteristic: c,
                value: vec![42],
                success: true,
            }
        );

        assert!(f.session.set_characteristic_notification(&c, true));
        assert_eq!(client.log().notifications, vec![(c, true)]);
        client.report_changed(c, vec![1, 2]);
        assert_eq!(
            f.events.try_recv().unwrap(),
            GattEvent::CharacteristicChanged {
                address: ADDR_A.parse().unwrap(),
                characteristic: c,
                value: vec![1, 2],
            }
        );
    }

    #[test]
    fn test_disconnect_keeps_client() {
        let mut f = fixture();

        f.session.connect(ADDR_A);
        let client = f.driver.last_client().unwrap();
        client.report_connected();
        let _ = f.events.try_recv();

        f.session.disconnect();
        assert_eq!(f.session.state(), ConnectionState::Disconnected);
        assert_eq!(client.log().disconnect_requests, 1);
        assert!(!client.log().closed);

        client.report_disconnected();
        assert_eq!(
            f.events.try_recv().unwrap(),
            GattEvent::ConnectionStateChanged { connected: false }
        );
        assert!(f.events.try_recv().is_err());

        assert!(f.session.connect(ADDR_A));
        assert_eq!(f.driver.clients().len(), 1);
    }

    #[test]
    fn test_close_is_terminal() {
        let mut f = fixture();
        let c = characteristic();

        f.session.connect(ADDR_A);
        let client = f.driver.last_client().unwrap();
        client.report_connected();
        let _ = f.events.try_recv();

        f.session.close();
        assert!(client.log().closed);
        assert_eq!(f.session.state(), ConnectionState::Disconnected);
        assert_eq!(f.session.address(), None);

        f.session.read_characteristic(&c);
        assert!(!f.session.write_characteristic(&c, &[1]));
        f.session.disconnect();
        f.session.close();
        assert_eq!(client.log().disconnect_requests, 0);

        // Late callbacks from the released client go nowhere
        client.report_disconnected();
        assert!(f.events.try_recv().is_err());

        assert!(f.session.connect(ADDR_A));
        assert_eq!(f.driver.clients().len(), 2);
    }

    #[test]
    fn test_stale_client_callbacks_ignored() {
        let mut f = fixture();

        f.session.connect(ADDR_A);
        f.session.connect(ADDR_B);
        let first = f.driver.clients()[0].clone();

        first.report_connected();
        assert!(f.events.try_recv().is_err());
        assert_eq!(f.session.state(), ConnectionState::Connecting);
        assert_eq!(first.log().discover_requests, 0);
    }

    #[test]
    fn test_listener_replacement() {
        let mut f = fixture();
        let (tx, mut second) = mpsc::unbounded_channel();

        f.session.connect(ADDR_A);
        f.session.set_listener(tx);
        f.driver.last_client().unwrap().report_connected();

        assert!(f.events.try_recv().is_err());
        assert_eq!(
            second.try_recv().unwrap(),
            GattEvent::ConnectionStateChanged { connected: true }
        );

        f.session.clear_listener();
        f.driver.last_client().unwrap().report_disconnected();
        assert!(second.try_recv().is_err());
        assert_eq!(f.session.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_connected_before_open_returns_still_discovers() {
        let mut f = fixture();
        f.driver.set_connect_on_open(true);

        assert!(f.session.connect(ADDR_A));
        let client = f.driver.last_client().unwrap();
        assert_eq!(f.session.state(), ConnectionState::Connected);
        assert_eq!(client.log().discover_requests, 1);
        assert_eq!(
            f.events.try_recv().unwrap(),
            GattEvent::ConnectionStateChanged { connected: true }
        );

        client.set_services(vec![service(0x1800)]);
        client.report_services_discovered(true);
        assert_eq!(f.session.supported_services().map(|s| s.len()), Some(1));
    }

    #[test]
    fn test_client_bound_to_target() {
        let f = fixture();
        let target: PeripheralAddress = ADDR_B.parse().unwrap();

        f.session.connect(ADDR_B);
        let client = f.driver.last_client().unwrap();
        assert_eq!(client.device().address, target);
        assert_eq!(client.sink().address(), target);
        assert!(!client.auto_connect());
    }
}
