//! BLE central-role session manager: discovery, one GATT connection and
//! characteristic access over an abstract platform stack.

pub mod domain;
pub mod infrastructure;

pub use domain::models::{
    CharacteristicRef, ConnectionState, DiscoveryPhase, GattEvent, GattEvents, GattService,
    Peripheral, PeripheralAddress, RadioState,
};
pub use infrastructure::bluetooth::SessionManager;
