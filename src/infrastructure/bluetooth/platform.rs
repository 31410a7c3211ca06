//! Platform Boundary
//!
//! Traits for everything the session manager consumes from the host
//! Bluetooth stack. Implementations wrap the native radio driver; the
//! [`simulated`](super::simulated) module provides an in-memory one.

use crate::domain::models::{
    CharacteristicRef, GattService, Peripheral, PeripheralAddress, RadioState, WriteType,
};
use crate::infrastructure::bluetooth::connection::GattCallbackSink;
use std::sync::Arc;

/// The local Bluetooth radio. Queried, never mutated, by the session.
pub trait BluetoothAdapter: Send + Sync {
    /// Hardware address of the local radio, `None` when unreadable
    fn address(&self) -> Option<String>;
    fn is_enabled(&self) -> bool;
    fn state(&self) -> RadioState;
    /// Ask the radio to start an inquiry scan. Returns whether it was accepted.
    fn start_discovery(&self) -> bool;
    fn cancel_discovery(&self) -> bool;
    fn is_discovering(&self) -> bool;
}

/// Category of broadcast a registration is interested in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    DeviceFound,
    DiscoveryStarted,
    DiscoveryFinished,
    AdapterStateChanged,
}

/// Set of categories a registration listens to
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventFilter {
    categories: Vec<EventCategory>,
}

impl EventFilter {
    pub fn new(category: EventCategory) -> Self {
        Self {
            categories: vec![category],
        }
    }

    pub fn with(mut self, category: EventCategory) -> Self {
        if !self.categories.contains(&category) {
            self.categories.push(category);
        }
        self
    }

    pub fn matches(&self, event: &PlatformEvent) -> bool {
        self.categories.contains(&event.category())
    }

    pub fn categories(&self) -> &[EventCategory] {
        &self.categories
    }
}

/// A broadcast from the platform event source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    DeviceFound(Peripheral),
    DiscoveryStarted,
    DiscoveryFinished,
    AdapterStateChanged(RadioState),
}

impl PlatformEvent {
    pub fn category(&self) -> EventCategory {
        match self {
            Self::DeviceFound(_) => EventCategory::DeviceFound,
            Self::DiscoveryStarted => EventCategory::DiscoveryStarted,
            Self::DiscoveryFinished => EventCategory::DiscoveryFinished,
            Self::AdapterStateChanged(_) => EventCategory::AdapterStateChanged,
        }
    }
}

/// Invoked by the platform, on any thread, for every matching event
pub type PlatformReceiver = Arc<dyn Fn(&PlatformEvent) + Send + Sync>;

/// Handle returned by the platform for one registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(pub u64);

/// Broadcast registration mechanism.
///
/// Registration and removal are thread-affine on real platforms, so the
/// session only ever calls these from its dispatch thread.
pub trait PlatformEventSource: Send {
    fn register(&mut self, filter: EventFilter, receiver: PlatformReceiver) -> RegistrationId;
    /// Returns false when `id` is unknown or already removed
    fn unregister(&mut self, id: RegistrationId) -> bool;
}

/// Platform reference to a remote device, resolved from its address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDevice {
    pub address: PeripheralAddress,
    pub name: Option<String>,
}

/// Entry point of the platform GATT driver
pub trait GattDriver: Send + Sync {
    fn resolve_device(&self, address: &PeripheralAddress) -> Option<RemoteDevice>;

    /// Open a GATT client to `device` and issue the initial connect request.
    ///
    /// Callbacks for the returned client go to `sink`, from any thread and
    /// possibly before this call returns.
    fn connect_gatt(
        &self,
        device: &RemoteDevice,
        auto_connect: bool,
        sink: GattCallbackSink,
    ) -> Option<Arc<dyn GattClient>>;
}

/// A platform GATT client bound to one remote device.
///
/// Every request is asynchronous: the boolean result only says whether the
/// platform queued it, the outcome arrives through the callback sink.
pub trait GattClient: Send + Sync {
    /// Re-issue a connect request on this client
    fn connect(&self) -> bool;
    fn disconnect(&self);
    /// Release the client; it must not be used afterwards
    fn close(&self);
    fn discover_services(&self) -> bool;
    fn read_characteristic(&self, characteristic: &CharacteristicRef) -> bool;
    fn write_characteristic(
        &self,
        characteristic: &CharacteristicRef,
        value: &[u8],
        write_type: WriteType,
    ) -> bool;
    fn set_characteristic_notification(
        &self,
        characteristic: &CharacteristicRef,
        enabled: bool,
    ) -> bool;
    /// Services from the last discovery
    fn services(&self) -> Vec<GattService>;
}

/// Outbound request for the surrounding application to ask the user to
/// turn the radio on
pub trait EnablePrompt: Send + Sync {
    fn request_enable(&self);
}

/// Everything the session manager needs from the host stack
pub struct Platform {
    /// `None` when the device has no Bluetooth radio
    pub adapter: Option<Arc<dyn BluetoothAdapter>>,
    pub events: Box<dyn PlatformEventSource>,
    pub gatt: Arc<dyn GattDriver>,
    pub prompt: Arc<dyn EnablePrompt>,
}

/// Radio present and its address readable
pub fn adapter_available(adapter: Option<&Arc<dyn BluetoothAdapter>>) -> bool {
    adapter
        .and_then(|a| a.address())
        .map(|addr| !addr.is_empty())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matches_categories() {
        let filter = EventFilter::new(EventCategory::DiscoveryStarted)
            .with(EventCategory::DiscoveryFinished)
            .with(EventCategory::DiscoveryFinished);
        assert_eq!(filter.categories().len(), 2);
        assert!(filter.matches(&PlatformEvent::DiscoveryStarted));
        assert!(filter.matches(&PlatformEvent::DiscoveryFinished));
        assert!(!filter.matches(&PlatformEvent::AdapterStateChanged(RadioState::On)));
    }
}
