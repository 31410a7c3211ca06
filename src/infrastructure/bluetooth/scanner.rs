//! BLE Scanner Module
//!
//! Adapter-level discovery: start/stop requests plus streams of discovered
//! devices, discovery phases and radio state changes.

use crate::domain::models::{DiscoveryPhase, Peripheral, RadioState};
use crate::infrastructure::bluetooth::events::{Dispatcher, Observable, Registration};
use crate::infrastructure::bluetooth::lock;
use crate::infrastructure::bluetooth::platform::{
    adapter_available, BluetoothAdapter, EventCategory, EventFilter, PlatformEvent,
};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Discovery controller for the local adapter
pub struct DiscoveryController {
    adapter: Option<Arc<dyn BluetoothAdapter>>,
    dispatcher: Dispatcher,
    phase: Arc<Mutex<DiscoveryPhase>>,
    // Keeps `phase` in step with platform-reported start/finish
    _phase_tracking: Registration,
}

impl DiscoveryController {
    pub fn new(adapter: Option<Arc<dyn BluetoothAdapter>>, dispatcher: Dispatcher) -> Self {
        let phase = Arc::new(Mutex::new(DiscoveryPhase::Idle));
        let tracked = phase.clone();
        let phase_tracking = discovery_phases(&dispatcher).subscribe_with(move |next| {
            let mut phase = lock(&tracked);
            if *phase != next {
                debug!("Platform reported discovery phase {:?}", next);
                *phase = next;
            }
        });

        Self {
            adapter,
            dispatcher,
            phase,
            _phase_tracking: phase_tracking,
        }
    }

    fn usable_adapter(&self) -> Option<&Arc<dyn BluetoothAdapter>> {
        if adapter_available(self.adapter.as_ref()) {
            self.adapter.as_ref()
        } else {
            None
        }
    }

    fn set_phase(&self, next: DiscoveryPhase) {
        *lock(&self.phase) = next;
    }

    fn replace_phase(&self, next: DiscoveryPhase) -> DiscoveryPhase {
        std::mem::replace(&mut *lock(&self.phase), next)
    }

    /// Start scanning. False when the radio is missing or off, a scan is
    /// already running, or the platform refuses.
    pub fn start_discovery(&self) -> bool {
        let Some(adapter) = self.usable_adapter() else {
            warn!("Cannot start discovery: Bluetooth unavailable");
            return false;
        };
        if !adapter.is_enabled() {
            warn!("Cannot start discovery: Bluetooth disabled");
            return false;
        }
        if adapter.is_discovering() {
            warn!("Discovery already running");
            return false;
        }
        // A finish broadcast raised during the request must win
        let previous = self.replace_phase(DiscoveryPhase::Scanning);
        if !adapter.start_discovery() {
            warn!("Platform refused to start discovery");
            self.set_phase(previous);
            return false;
        }

        info!("Discovery started");
        true
    }

    pub fn cancel_discovery(&self) -> bool {
        let Some(adapter) = self.usable_adapter() else {
            warn!("Cannot cancel discovery: Bluetooth unavailable");
            return false;
        };
        let previous = self.replace_phase(DiscoveryPhase::Idle);
        if !adapter.cancel_discovery() {
            warn!("Platform refused to cancel discovery");
            self.set_phase(previous);
            return false;
        }

        info!("Discovery cancelled");
        true
    }

    /// Platform scan state, queried synchronously
    pub fn is_discovering(&self) -> bool {
        self.adapter
            .as_ref()
            .map(|adapter| adapter.is_discovering())
            .unwrap_or(false)
    }

    /// Phase as tracked by this controller
    pub fn phase(&self) -> DiscoveryPhase {
        *lock(&self.phase)
    }

    /// Devices heard while discovering. Each subscriber sees every report,
    /// duplicates included.
    pub fn observe_devices(&self) -> Observable<Peripheral> {
        Observable::new(
            self.dispatcher.clone(),
            EventFilter::new(EventCategory::DeviceFound),
            |event| match event {
                PlatformEvent::DeviceFound(peripheral) => Some(peripheral.clone()),
                _ => None,
            },
        )
    }

    pub fn observe_discovery_phase(&self) -> Observable<DiscoveryPhase> {
        discovery_phases(&self.dispatcher)
    }

    pub fn observe_discovery_started(&self) -> Observable<DiscoveryPhase> {
        self.observe_discovery_phase()
            .filter(|phase| *phase == DiscoveryPhase::Scanning)
    }

    pub fn observe_discovery_finished(&self) -> Observable<DiscoveryPhase> {
        self.observe_discovery_phase()
            .filter(|phase| *phase == DiscoveryPhase::Idle)
    }

    pub fn observe_adapter_state(&self) -> Observable<RadioState> {
        Observable::new(
            self.dispatcher.clone(),
            EventFilter::new(EventCategory::AdapterStateChanged),
            |event| match event {
                PlatformEvent::AdapterStateChanged(state) => Some(*state),
                _ => None,
            },
        )
    }
}

fn discovery_phases(dispatcher: &Dispatcher) -> Observable<DiscoveryPhase> {
    Observable::new(
        dispatcher.clone(),
        EventFilter::new(EventCategory::DiscoveryStarted).with(EventCategory::DiscoveryFinished),
        |event| match event {
            PlatformEvent::DiscoveryStarted => Some(DiscoveryPhase::Scanning),
            PlatformEvent::DiscoveryFinished => Some(DiscoveryPhase::Idle),
            _ => None,
        },
    )
}
