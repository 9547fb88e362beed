use enumset::EnumSet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{CHARACTERISTIC_MAX_LEN, MIDI_CHARACTERISTIC_UUID};
use crate::radio::Property;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicConfig {
    pub uuid: Uuid,
    pub value_max_len: usize,

    pub readable: bool,
    pub writable: bool,
    // Accept ATT Write Command (no response) in addition to Write Request
    pub write_without_response: bool,

    // Centrals can subscribe through the CCCD
    pub enable_notify: bool,
}

impl CharacteristicConfig {
    /// The BLE-MIDI I/O characteristic: read, write, write without response
    /// and notify.
    pub fn midi() -> Self {
        Self {
            uuid: MIDI_CHARACTERISTIC_UUID,
            value_max_len: CHARACTERISTIC_MAX_LEN,
            readable: true,
            writable: true,
            write_without_response: true,
            enable_notify: true,
        }
    }

    pub fn properties(&self) -> EnumSet<Property> {
        let mut properties = EnumSet::new();

        if self.readable {
            properties.insert(Property::Read);
        }

        if self.writable {
            properties.insert(Property::Write);
        }

        if self.write_without_response {
            properties.insert(Property::WriteNoResponse);
        }

        if self.enable_notify {
            properties.insert(Property::Notify);
        }

        properties
    }
}
