use crate::domain::error::AddressError;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Hardware address of a remote peripheral, stored in canonical
/// upper-case `AA:BB:CC:DD:EE:FF` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeripheralAddress([u8; 6]);

impl PeripheralAddress {
    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for PeripheralAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AddressError::Empty);
        }

        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(AddressError::InvalidLength(parts.len()));
        }

        let mut octets = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(AddressError::InvalidOctet(part.to_string()));
            }
            octets[i] = u8::from_str_radix(part, 16)
                .map_err(|_| AddressError::InvalidOctet(part.to_string()))?;
        }

        Ok(Self(octets))
    }
}

impl fmt::Display for PeripheralAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a, b, c, d, e, g
        )
    }
}

/// A peripheral as reported by a device-found event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peripheral {
    pub address: PeripheralAddress,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

impl Peripheral {
    pub fn new(address: PeripheralAddress, name: Option<String>) -> Self {
        Self {
            address,
            name,
            rssi: None,
        }
    }

    /// Display label: the address, followed by the name when there is one.
    pub fn label(&self) -> String {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => format!("{} {}", self.address, name),
            _ => self.address.to_string(),
        }
    }
}

/// Local radio state as reported by the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    Off,
    TurningOn,
    On,
    TurningOff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoveryPhase {
    #[default]
    Idle,
    Scanning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Write mode requested from the GATT driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    /// Acknowledged by the peripheral
    WithResponse,
    /// Accepted once queued locally
    WithoutResponse,
}

/// Identifies a characteristic inside the discovered service tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicRef {
    pub service: Uuid,
    pub uuid: Uuid,
}

impl CharacteristicRef {
    pub fn new(service: Uuid, uuid: Uuid) -> Self {
        Self { service, uuid }
    }
}

/// Characteristic property bits, as advertised by the peripheral
pub mod properties {
    pub const READ: u8 = 0x02;
    pub const WRITE_WITHOUT_RESPONSE: u8 = 0x04;
    pub const WRITE: u8 = 0x08;
    pub const NOTIFY: u8 = 0x10;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub properties: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    /// Reference to one of this service's characteristics
    pub fn characteristic(&self, uuid: Uuid) -> Option<CharacteristicRef> {
        self.characteristics
            .iter()
            .find(|c| c.uuid == uuid)
            .map(|c| CharacteristicRef::new(self.uuid, c.uuid))
    }
}

/// Completion status reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    Failure(u8),
}

impl GattStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Link state carried by a platform connection-state callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Raw callbacks issued by the platform GATT driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattCallback {
    ConnectionStateChanged {
        status: GattStatus,
        new_state: LinkState,
    },
    ServicesDiscovered {
        status: GattStatus,
    },
    CharacteristicRead {
        characteristic: CharacteristicRef,
        value: Vec<u8>,
        status: GattStatus,
    },
    CharacteristicWrite {
        characteristic: CharacteristicRef,
        status: GattStatus,
    },
    CharacteristicChanged {
        characteristic: CharacteristicRef,
        value: Vec<u8>,
    },
}

/// Notifications delivered to the registered listener, in platform order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    ConnectionStateChanged {
        connected: bool,
    },
    ServicesDiscovered {
        address: PeripheralAddress,
        success: bool,
    },
    CharacteristicRead {
        characteristic: CharacteristicRef,
        value: Vec<u8>,
        success: bool,
    },
    CharacteristicWrite {
        characteristic: CharacteristicRef,
        success: bool,
    },
    CharacteristicChanged {
        address: PeripheralAddress,
        characteristic: CharacteristicRef,
        value: Vec<u8>,
    },
}

/// Callback-object form of the listener.
///
/// Callers that prefer one method per notification can implement this and
/// feed each received [`GattEvent`] through [`GattEvent::dispatch`].
pub trait GattEvents {
    fn device_connect_state(&mut self, connected: bool);
    fn on_services_discovered(&mut self, address: PeripheralAddress, success: bool);
    fn characteristic_read_state(
        &mut self,
        characteristic: CharacteristicRef,
        value: &[u8],
        success: bool,
    );
    fn characteristic_write_state(&mut self, characteristic: CharacteristicRef, success: bool);
    fn characteristic_data_change(
        &mut self,
        address: PeripheralAddress,
        characteristic: CharacteristicRef,
        value: &[u8],
    );
}

impl GattEvent {
    pub fn dispatch<L: GattEvents + ?Sized>(&self, listener: &mut L) {
        match self {
            Self::ConnectionStateChanged { connected } => listener.device_connect_state(*connected),
            Self::ServicesDiscovered { address, success } => {
                listener.on_services_discovered(*address, *success)
            }
            Self::CharacteristicRead {
                characteristic,
                value,
                success,
            } => listener.characteristic_read_state(*characteristic, value, *success),
            Self::CharacteristicWrite {
                characteristic,
                success,
            } => listener.characteristic_write_state(*characteristic, *success),
            Self::CharacteristicChanged {
                address,
                characteristic,
                value,
            } => listener.characteristic_data_change(*address, *characteristic, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        let addr: PeripheralAddress = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(addr.octets(), [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        assert_eq!(addr.to_string(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_parse_address_rejects_garbage() {
        assert_eq!("".parse::<PeripheralAddress>(), Err(AddressError::Empty));
        assert_eq!(
            "AA:BB:CC".parse::<PeripheralAddress>(),
            Err(AddressError::InvalidLength(3))
        );
        assert_eq!(
            "AA:BB:CC:DD:EE:GG".parse::<PeripheralAddress>(),
            Err(AddressError::InvalidOctet("GG".to_string()))
        );
        assert!("AABB:CC:DD:EE:FF:0".parse::<PeripheralAddress>().is_err());
        assert_eq!(
            "+A:BB:CC:DD:EE:FF".parse::<PeripheralAddress>(),
            Err(AddressError::InvalidOctet("+A".to_string()))
        );
    }

    #[test]
    fn test_peripheral_label() {
        let addr = PeripheralAddress::new([1, 2, 3, 4, 5, 6]);
        let named = Peripheral::new(addr, Some("Thermometer".to_string()));
        assert_eq!(named.label(), "01:02:03:04:05:06 Thermometer");

        let blank = Peripheral::new(addr, Some(String::new()));
        assert_eq!(blank.label(), "01:02:03:04:05:06");
        assert_eq!(Peripheral::new(addr, None).label(), "01:02:03:04:05:06");
    }

    #[derive(Default)]
    struct Recorder {
        calls: Vec<&'static str>,
    }

    impl GattEvents for Recorder {
        fn device_connect_state(&mut self, _connected: bool) {
            self.calls.push("connect");
        }
        fn on_services_discovered(&mut self, _address: PeripheralAddress, _success: bool) {
            self.calls.push("services");
        }
        fn characteristic_read_state(&mut self, _c: CharacteristicRef, _v: &[u8], _s: bool) {
            self.calls.push("read");
        }
        fn characteristic_write_state(&mut self, _c: CharacteristicRef, _s: bool) {
            self.calls.push("write");
        }
        fn characteristic_data_change(
            &mut self,
            _a: PeripheralAddress,
            _c: CharacteristicRef,
            _v: &[u8],
        ) {
            self.calls.push("changed");
        }
    }

    #[test]
    fn test_dispatch_routes_each_event() {
        let addr = PeripheralAddress::new([0; 6]);
        let c = CharacteristicRef::new(Uuid::nil(), Uuid::nil());
        let events = [
            GattEvent::ConnectionStateChanged { connected: true },
            GattEvent::ServicesDiscovered {
                address: addr,
                success: true,
            },
            GattEvent::CharacteristicRead {
                characteristic: c,
                value: vec![1],
                success: true,
            },
            GattEvent::CharacteristicWrite {
                characteristic: c,
                success: false,
            },
            GattEvent::CharacteristicChanged {
                address: addr,
                characteristic: c,
                value: vec![2],
            },
        ];

        let mut recorder = Recorder::default();
        for event in &events {
            event.dispatch(&mut recorder);
        }
        assert_eq!(
            recorder.calls,
            vec!["connect", "services", "read", "write", "changed"]
        );
    }

    #[test]
    fn test_service_characteristic_lookup() {
        let svc = Uuid::from_u128(0x180d);
        let chr = Uuid::from_u128(0x2a37);
        let service = GattService {
            uuid: svc,
            characteristics: vec![GattCharacteristic {
                uuid: chr,
                properties: properties::NOTIFY,
            }],
        };
        assert_eq!(
            service.characteristic(chr),
            Some(CharacteristicRef::new(svc, chr))
        );
        assert_eq!(service.characteristic(Uuid::nil()), None);
    }
}
