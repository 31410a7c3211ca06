use anyhow::{bail, Context};
use ble_session_rust::domain::models::{
    properties, CharacteristicRef, GattCharacteristic, GattEvents, GattService, Peripheral,
    PeripheralAddress,
};
use ble_session_rust::domain::settings::SettingsService;
use ble_session_rust::infrastructure::bluetooth::simulated::SimulatedPlatform;
use ble_session_rust::infrastructure::bluetooth::SessionManager;
use ble_session_rust::infrastructure::logging;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

const HEART_RATE_SERVICE: u16 = 0x180d;
const HEART_RATE_MEASUREMENT: u16 = 0x2a37;
const BODY_SENSOR_LOCATION: u16 = 0x2a38;
const HEART_RATE_CONTROL_POINT: u16 = 0x2a39;

/// Expand a 16-bit assigned number onto the Bluetooth base UUID
fn assigned_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_1000_8000_0080_5f9b_34fb)
}

fn heart_rate_services() -> Vec<GattService> {
    vec![GattService {
        uuid: assigned_uuid(HEART_RATE_SERVICE),
        characteristics: vec![
            GattCharacteristic {
                uuid: assigned_uuid(HEART_RATE_MEASUREMENT),
                properties: properties::NOTIFY,
            },
            GattCharacteristic {
                uuid: assigned_uuid(BODY_SENSOR_LOCATION),
                properties: properties::READ,
            },
            GattCharacteristic {
                uuid: assigned_uuid(HEART_RATE_CONTROL_POINT),
                properties: properties::WRITE | properties::WRITE_WITHOUT_RESPONSE,
            },
        ],
    }]
}

#[derive(Default)]
struct EventLog {
    events: usize,
}

impl GattEvents for EventLog {
    fn device_connect_state(&mut self, connected: bool) {
        self.events += 1;
        info!(connected, "Connection state changed");
    }

    fn on_services_discovered(&mut self, address: PeripheralAddress, success: bool) {
        self.events += 1;
        info!(%address, success, "Services discovered");
    }

    fn characteristic_read_state(
        &mut self,
        characteristic: CharacteristicRef,
        value: &[u8],
        success: bool,
    ) {
        self.events += 1;
        info!(uuid = %characteristic.uuid, ?value, success, "Characteristic read");
    }

    fn characteristic_write_state(&mut self, characteristic: CharacteristicRef, success: bool) {
        self.events += 1;
        info!(uuid = %characteristic.uuid, success, "Characteristic written");
    }

    fn characteristic_data_change(
        &mut self,
        address: PeripheralAddress,
        characteristic: CharacteristicRef,
        value: &[u8],
    ) {
        self.events += 1;
        info!(%address, uuid = %characteristic.uuid, ?value, "Characteristic changed");
    }
}

fn find_characteristic(services: &[GattService], short: u16) -> anyhow::Result<CharacteristicRef> {
    services
        .iter()
        .find_map(|service| service.characteristic(assigned_uuid(short)))
        .with_context(|| format!("Characteristic {:#06x} not offered", short))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = SettingsService::new()?;
    let _logging_guard = logging::init_logger(&settings.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting BLE session demo");
    let session_settings = settings.get().session.clone();

    let sim = SimulatedPlatform::new();
    sim.adapter.set_enabled(false);
    let heart_rate = sim
        .add_peripheral("C8:FD:19:3A:52:0E", Some("Heart Rate Sensor"))
        .context("Invalid peripheral address")?;
    let beacon = sim
        .add_peripheral("F4:5E:AB:10:07:C2", None)
        .context("Invalid peripheral address")?;

    let manager = SessionManager::new(sim.platform(), &session_settings)?;
    if !manager.is_bluetooth_available() {
        bail!("No Bluetooth radio available");
    }
    if manager.enable_bluetooth() {
        // The simulated user accepts the prompt
        sim.adapter.set_enabled(true);
    }

    let mut devices = manager.observe_devices().subscribe();
    let mut started = manager.observe_discovery_started().subscribe();
    let mut finished = manager.observe_discovery_finished().subscribe();
    manager.flush().await;

    if !manager.start_discovery() {
        bail!("Discovery could not be started");
    }
    started.recv().await;
    info!("Scanning for {} ms", session_settings.demo_scan_window_ms);

    sim.adapter.announce(heart_rate.clone());
    sim.adapter.announce(beacon);
    sim.adapter.announce(heart_rate);
    tokio::time::sleep(Duration::from_millis(session_settings.demo_scan_window_ms)).await;
    sim.adapter.finish_discovery();
    finished.recv().await;

    let mut found: Vec<Peripheral> = Vec::new();
    while let Some(peripheral) = devices.try_recv() {
        if !found.contains(&peripheral) {
            println!("{}", peripheral.label());
            found.push(peripheral);
        }
    }
    devices.unsubscribe();
    started.unsubscribe();
    finished.unsubscribe();

    let Some(target) = found.first() else {
        warn!("No devices found");
        return Ok(());
    };

    let mut events = manager.gatt_events();
    let event_log = tokio::spawn(async move {
        let mut log = EventLog::default();
        while let Some(event) = events.recv().await {
            event.dispatch(&mut log);
        }
        log.events
    });

    if !manager.connect(&target.address.to_string()) {
        bail!("Could not connect to {}", target.address);
    }
    let client = sim.gatt.last_client().context("No GATT client was opened")?;
    client.set_services(heart_rate_services());
    client.report_connected();
    client.report_services_discovered(true);

    let services = manager.supported_services().unwrap_or_default();
    let measurement = find_characteristic(&services, HEART_RATE_MEASUREMENT)?;
    let location = find_characteristic(&services, BODY_SENSOR_LOCATION)?;
    let control_point = find_characteristic(&services, HEART_RATE_CONTROL_POINT)?;

    if manager.set_characteristic_notification(&measurement, true) {
        client.report_changed(measurement, vec![0x06, 72]);
        client.report_changed(measurement, vec![0x06, 74]);
    }

    manager.read_characteristic(&location);
    client.report_read(location, vec![0x01], true);

    // Reset energy expended
    if manager.write_characteristic_byte(&control_point, 0x01) {
        client.report_write(control_point, true);
    }

    manager.disconnect();
    client.report_disconnected();
    manager.close();
    manager.connection().clear_listener();

    let delivered = event_log.await?;
    info!(delivered, "Session closed");
    Ok(())
}
