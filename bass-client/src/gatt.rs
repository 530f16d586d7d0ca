//! GATT transport seen by the state machine.
//!
//! The transport owns the radio side. The state machine only issues
//! primitives through [`GattSession`]; every completion comes back as a
//! [`GattEvent`] on the channel handed to [`GattTransport::connect`], so
//! callbacks are never processed on a transport thread.

use std::fmt;

use bytes::Bytes;
use tokio::sync::mpsc;

use bass_protocol::{AddressType, DeviceAddress, DeviceId};

/// Status of a completed GATT procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattStatus(pub u8);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0x00);
    /// Generic failure (ATT "unlikely error" is used by most stacks).
    pub const FAILURE: GattStatus = GattStatus(0x85);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

/// Link state reported by the transport and by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// CCC descriptor value that enables notifications.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

/// Characteristic property bits.
pub mod property {
    pub const READ: u8 = 0x02;
    pub const WRITE_NO_RESPONSE: u8 = 0x04;
    pub const WRITE: u8 = 0x08;
    pub const NOTIFY: u8 = 0x10;
}

/// A discovered characteristic of the BASS service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    /// Transport-unique instance id.
    pub instance_id: u32,
    pub uuid: u16,
    pub properties: u8,
    /// Whether a Client Characteristic Configuration descriptor is present.
    pub has_ccc: bool,
}

impl Characteristic {
    pub fn supports(&self, bits: u8) -> bool {
        self.properties & bits == bits
    }
}

/// Asynchronous completions from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    ConnectionStateChanged {
        status: GattStatus,
        state: ConnectionState,
    },
    ServicesDiscovered {
        status: GattStatus,
    },
    MtuChanged {
        mtu: u16,
        status: GattStatus,
    },
    CharacteristicRead {
        instance_id: u32,
        value: Bytes,
        status: GattStatus,
    },
    CharacteristicWrite {
        instance_id: u32,
        status: GattStatus,
    },
    DescriptorWrite {
        instance_id: u32,
        status: GattStatus,
    },
    /// Notification of a new characteristic value.
    CharacteristicChanged {
        instance_id: u32,
        value: Bytes,
    },
}

pub type GattEventSender = mpsc::UnboundedSender<GattEvent>;
pub type GattEventReceiver = mpsc::UnboundedReceiver<GattEvent>;

/// Opens GATT links to remote devices.
pub trait GattTransport: Send {
    /// Start connecting to `device`. `None` when the attempt could not be started.
    fn connect(
        &mut self,
        device: DeviceId,
        auto_connect: bool,
        events: GattEventSender,
    ) -> Option<Box<dyn GattSession>>;
}

/// One GATT link. Methods return `false` when the request was not queued.
pub trait GattSession: Send {
    fn discover_services(&mut self) -> bool;

    fn request_mtu(&mut self, mtu: u16) -> bool;

    /// Characteristics of the discovered service `uuid`, `None` when the
    /// service is missing.
    fn service_characteristics(&self, uuid: u16) -> Option<Vec<Characteristic>>;

    fn read_characteristic(&mut self, instance_id: u32) -> bool;

    fn write_characteristic(&mut self, instance_id: u32, value: &[u8], write_type: WriteType)
        -> bool;

    /// Write descriptor `uuid` of characteristic `instance_id`. Writing the
    /// CCC descriptor also enables notifications locally.
    fn write_descriptor(&mut self, instance_id: u32, uuid: u16, value: &[u8]) -> bool;

    fn disconnect(&mut self);

    fn close(&mut self);
}

/// Maps a reported source address to a stable device identity.
pub trait AddressResolver: Send + Sync {
    fn resolve(&self, address: DeviceAddress, address_type: AddressType) -> Option<DeviceId>;
}

impl<F> AddressResolver for F
where
    F: Fn(DeviceAddress, AddressType) -> Option<DeviceId> + Send + Sync,
{
    fn resolve(&self, address: DeviceAddress, address_type: AddressType) -> Option<DeviceId> {
        self(address, address_type)
    }
}

/// Resolver that takes every reported address at face value.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityResolver;

impl AddressResolver for IdentityResolver {
    fn resolve(&self, address: DeviceAddress, address_type: AddressType) -> Option<DeviceId> {
        Some(DeviceId::new(address, address_type))
    }
}

/// Decides whether the client may connect to a device.
pub trait ConnectionPolicy: Send + Sync {
    fn ok_to_connect(&self, device: &DeviceId) -> bool;
}

impl<F> ConnectionPolicy for F
where
    F: Fn(&DeviceId) -> bool + Send + Sync,
{
    fn ok_to_connect(&self, device: &DeviceId) -> bool {
        self(device)
    }
}

/// Policy that allows every connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl ConnectionPolicy for AllowAll {
    fn ok_to_connect(&self, _device: &DeviceId) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_characteristic_supports() {
        let c = Characteristic {
            instance_id: 1,
            uuid: bass_protocol::CONTROL_POINT_UUID,
            properties: property::WRITE | property::WRITE_NO_RESPONSE,
            has_ccc: false,
        };
        assert!(c.supports(property::WRITE | property::WRITE_NO_RESPONSE));
        assert!(!c.supports(property::WRITE | property::NOTIFY));
    }

    #[test]
    fn test_closure_collaborators() {
        let deny = |_: &DeviceId| false;
        assert!(!deny.ok_to_connect(&DeviceId::EMPTY));
        assert!(AllowAll.ok_to_connect(&DeviceId::EMPTY));

        let addr = DeviceAddress([1, 2, 3, 4, 5, 6]);
        let resolver = |a: DeviceAddress, _: AddressType| {
            (a == addr).then(|| DeviceId::new(a, AddressType::Random))
        };
        assert_eq!(
            resolver.resolve(addr, AddressType::Public),
            Some(DeviceId::new(addr, AddressType::Random))
        );
        assert_eq!(resolver.resolve(DeviceAddress::EMPTY, AddressType::Public), None);
        assert!(GattStatus::SUCCESS.is_success());
        assert_eq!(GattStatus::FAILURE.to_string(), "0x85");
    }
}
