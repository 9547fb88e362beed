//! Identifiers, fixed policy constants and the runtime configuration of a
//! MIDI link.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// BLE-MIDI service, as published by the MIDI Association.
pub const MIDI_SERVICE_UUID: Uuid = Uuid::from_u128(0x03b80e5a_ede8_4b33_a751_6ce34ec4c700);

/// BLE-MIDI I/O characteristic.
pub const MIDI_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x7772e5db_3868_4112_a1a9_f2669d106bf3);

/// GAP appearance "Generic Media Player".
pub const APPEARANCE_GENERIC_MEDIA_PLAYER: u16 = 640;

pub const DEFAULT_SCAN_DURATION_MS: u32 = 3000;

/// Upper bound of MIDI candidates kept from one scan.
pub const MAX_CANDIDATES: usize = 16;

/// Device names are kept in fixed 32 byte buffers.
pub const MAX_NAME_LEN: usize = 32;

/// Largest value the MIDI characteristic accepts (ATT MTU 517 minus header).
pub const CHARACTERISTIC_MAX_LEN: usize = 512;

/// Inbound packets that may wait for the application. Connect and
/// disconnect events are not counted against it.
pub const PACKET_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanParams {
    pub duration_ms: u32,
    // Active scans request the scan response, which carries the device name
    pub active: bool,
    /// Scan interval in 0.625 ms units.
    pub interval: u16,
    /// Scan window in 0.625 ms units, never larger than `interval`.
    pub window: u16,
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            duration_ms: DEFAULT_SCAN_DURATION_MS,
            active: true,
            interval: 100,
            window: 99,
        }
    }
}

impl ScanParams {
    pub fn with_duration(duration_ms: u32) -> Self {
        Self {
            duration_ms,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoCapability {
    DisplayOnly,
    DisplayYesNo,
    KeyboardOnly,
    NoInputNoOutput,
    KeyboardDisplay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityPolicy {
    pub bonding: bool,
    // Authenticated (man-in-the-middle protected) pairing
    pub mitm: bool,
    pub secure_connections: bool,
    pub io_capability: IoCapability,
}

impl SecurityPolicy {
    /// Policy applied by every MIDI peripheral. Not configurable per call.
    pub const MIDI: Self = Self {
        bonding: true,
        mitm: true,
        secure_connections: true,
        io_capability: IoCapability::NoInputNoOutput,
    };
}

/// Transmit power levels in dBm steps, as exposed by ESP32 controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxPower {
    N12,
    N9,
    N6,
    N3,
    N0,
    P3,
    P6,
    P9,
}

impl TxPower {
    pub fn dbm(self) -> i8 {
        match self {
            TxPower::N12 => -12,
            TxPower::N9 => -9,
            TxPower::N6 => -6,
            TxPower::N3 => -3,
            TxPower::N0 => 0,
            TxPower::P3 => 3,
            TxPower::P6 => 6,
            TxPower::P9 => 9,
        }
    }
}

/// Role configuration. Frozen once `begin` accepted it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MidiConfig {
    pub device_name: String,
    pub role: Role,
    pub tx_power: TxPower,
    pub appearance: u16,
    pub scan: ScanParams,
}

impl Default for MidiConfig {
    fn default() -> Self {
        Self {
            device_name: "ESP32 MIDI".to_string(),
            role: Role::Server,
            tx_power: TxPower::P9,
            appearance: APPEARANCE_GENERIC_MEDIA_PLAYER,
            scan: ScanParams::default(),
        }
    }
}

impl MidiConfig {
    pub fn server(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            role: Role::Server,
            ..Self::default()
        }
    }

    pub fn client(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            role: Role::Client,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn midi_uuids_match_published_values() {
        assert_eq!(
            MIDI_SERVICE_UUID.to_string(),
            "03b80e5a-ede8-4b33-a751-6ce34ec4c700"
        );
        assert_eq!(
            MIDI_CHARACTERISTIC_UUID.to_string(),
            "7772e5db-3868-4112-a1a9-f2669d106bf3"
        );
    }

    #[test]
    fn default_scan_is_active_three_seconds() {
        let scan = ScanParams::default();
        assert_eq!(scan.duration_ms, 3000);
        assert!(scan.active);
        assert!(scan.window <= scan.interval);
    }

    #[test]
    fn role_constructors() {
        assert_eq!(MidiConfig::server("Piano").role, Role::Server);
        let client = MidiConfig::client("Host");
        assert_eq!(client.role, Role::Client);
        assert_eq!(client.device_name, "Host");
        assert_eq!(client.appearance, APPEARANCE_GENERIC_MEDIA_PLAYER);
    }
}
