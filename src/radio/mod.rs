//! The radio capability the link managers drive.
//!
//! Everything below this boundary (scanning, pairing, MTU negotiation, ATT
//! transport) belongs to the BLE stack. A stack integration implements
//! [`CentralRadio`] and/or [`PeripheralRadio`]; [`sim::SimAir`] is an
//! in-process implementation of both.

pub mod event;
pub mod sim;
#[cfg(test)]
pub(crate) mod stub;

use enumset::{EnumSet, EnumSetType};
use uuid::Uuid;

use crate::config::{ScanParams, SecurityPolicy, TxPower};
use crate::gatts::service::ServiceConfig;

pub use event::{DisconnectReason, RadioEvent};

/// Connection-state, advertisement and write events. Called from the radio
/// context.
pub type EventCallback = Box<dyn Fn(RadioEvent) + Send + Sync + 'static>;

/// Notification payloads of a subscribed remote characteristic. Called from
/// the radio context.
pub type NotifyCallback = Box<dyn Fn(&[u8]) + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BdAddr(pub [u8; 6]);

impl BdAddr {
    pub const fn from_bytes(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Display for BdAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a, b, c, d, e, g
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnHandle(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientHandle(pub u16);

#[derive(EnumSetType, Debug)]
pub enum Property {
    Broadcast,
    Read,
    WriteNoResponse,
    Write,
    Notify,
    Indicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteService {
    pub client: ClientHandle,
    pub handle: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteCharacteristic {
    pub client: ClientHandle,
    pub handle: u16,
    pub properties: EnumSet<Property>,
}

impl RemoteCharacteristic {
    pub fn can_notify(&self) -> bool {
        self.properties.contains(Property::Notify)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalCharacteristic {
    pub handle: u16,
}

/// One observed advertising report, with the scan response when the scan
/// was active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: BdAddr,
    pub rssi: i8,
    pub data: Vec<u8>,
    pub scan_response: Vec<u8>,
}

pub trait Radio: Send + Sync + 'static {
    fn init(&self, device_name: &str) -> anyhow::Result<()>;
    fn deinit(&self) -> anyhow::Result<()>;

    /// Registers the connection-state event handler. Replaces any previous
    /// handler.
    fn subscribe(&self, callback: EventCallback) -> anyhow::Result<()>;
}

pub trait CentralRadio: Radio {
    /// Blocks for `params.duration_ms` and returns every report seen.
    fn scan(&self, params: &ScanParams) -> anyhow::Result<Vec<Advertisement>>;

    fn create_client(&self) -> anyhow::Result<ClientHandle>;
    fn connect(&self, client: ClientHandle, target: &BdAddr) -> anyhow::Result<ConnHandle>;
    fn disconnect(&self, client: ClientHandle) -> anyhow::Result<()>;

    fn get_service(&self, client: ClientHandle, uuid: &Uuid) -> Option<RemoteService>;
    fn get_characteristic(
        &self,
        service: &RemoteService,
        uuid: &Uuid,
    ) -> Option<RemoteCharacteristic>;

    fn subscribe_notifications(
        &self,
        characteristic: &RemoteCharacteristic,
        callback: NotifyCallback,
    ) -> anyhow::Result<()>;

    fn write_characteristic(
        &self,
        characteristic: &RemoteCharacteristic,
        value: &[u8],
        with_response: bool,
    ) -> anyhow::Result<()>;
}

pub trait PeripheralRadio: Radio {
    fn set_tx_power(&self, power: TxPower) -> anyhow::Result<()>;
    fn set_security(&self, policy: &SecurityPolicy) -> anyhow::Result<()>;

    /// Creates and starts the service, returning its (single) characteristic.
    fn create_service(&self, service: &ServiceConfig) -> anyhow::Result<LocalCharacteristic>;

    fn set_advertising_data(&self, advertising: &[u8], scan_response: &[u8])
        -> anyhow::Result<()>;
    fn start_advertising(&self) -> anyhow::Result<()>;
    fn stop_advertising(&self) -> anyhow::Result<()>;

    /// Sets the characteristic value and notifies every subscribed central.
    fn notify(&self, characteristic: &LocalCharacteristic, value: &[u8]) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bd_addr_display_is_colon_separated_hex() {
        let addr = BdAddr::from_bytes([0xaa, 0xbb, 0xcc, 0x01, 0x02, 0x03]);
        assert_eq!(addr.to_string(), "aa:bb:cc:01:02:03");
    }

    #[test]
    fn can_notify_follows_properties() {
        let mut characteristic = RemoteCharacteristic {
            client: ClientHandle(1),
            handle: 3,
            properties: Property::Read | Property::WriteNoResponse,
        };
        assert!(!characteristic.can_notify());

        characteristic.properties.insert(Property::Notify);
        assert!(characteristic.can_notify());
    }
}
