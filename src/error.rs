use thiserror::Error;

use crate::config::Role;

#[derive(Debug, Error)]
pub enum MidiError {
    #[error("radio is not available")]
    Unavailable,
    #[error("link manager was not started with begin()")]
    NotBegun,
    #[error("link manager is already started")]
    AlreadyBegun,
    #[error("configuration is for the {0:?} role")]
    RoleMismatch(Role),
    #[error("already connected or connecting, disconnect first")]
    AlreadyConnected,
    #[error("candidate index {index} is out of range ({count} candidates)")]
    InvalidIndex { index: usize, count: usize },
    #[error("candidate belongs to scan #{found}, current scan is #{current}")]
    StaleCandidate { found: u32, current: u32 },
    #[error("remote device does not expose the MIDI service")]
    ServiceNotFound,
    #[error("remote device does not expose the MIDI characteristic")]
    CharacteristicNotFound,
    #[error("transport failure: {0:#}")]
    Transport(anyhow::Error),
    #[error("advertising failed to start: {0:#}")]
    StartupFatal(anyhow::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl MidiError {
    /// The remote was reachable but does not speak BLE-MIDI. Retrying will
    /// not help.
    pub fn is_protocol_incompatible(&self) -> bool {
        matches!(
            self,
            MidiError::ServiceNotFound | MidiError::CharacteristicNotFound
        )
    }
}

pub type MidiResult<T> = Result<T, MidiError>;
