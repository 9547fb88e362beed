use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::characteristic::CharacteristicConfig;
use crate::config::MIDI_SERVICE_UUID;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub uuid: Uuid,
    pub is_primary: bool,
    pub characteristic: CharacteristicConfig,
}

impl ServiceConfig {
    pub fn midi() -> Self {
        Self {
            uuid: MIDI_SERVICE_UUID,
            is_primary: true,
            characteristic: CharacteristicConfig::midi(),
        }
    }
}
