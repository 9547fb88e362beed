use super::{Advertisement, BdAddr, ConnHandle};

/// Asynchronous events raised by the radio from its own execution context.
///
/// Handlers receiving these must return quickly and must never block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    AdvertisementFound(Advertisement),
    Connected {
        conn: ConnHandle,
        peer: BdAddr,
    },
    Disconnected {
        conn: ConnHandle,
        reason: DisconnectReason,
    },
    CharacteristicWritten {
        conn: ConnHandle,
        handle: u16,
        value: Vec<u8>,
    },
}

/// HCI disconnect reason code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DisconnectReason(pub u8);

impl DisconnectReason {
    pub const CONNECTION_TIMEOUT: Self = Self(0x08);
    pub const REMOTE_USER_TERMINATED: Self = Self(0x13);
    pub const LOCAL_HOST_TERMINATED: Self = Self(0x16);
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::CONNECTION_TIMEOUT => write!(f, "connection timeout"),
            Self::REMOTE_USER_TERMINATED => write!(f, "remote user terminated"),
            Self::LOCAL_HOST_TERMINATED => write!(f, "local host terminated"),
            Self(code) => write!(f, "hci reason {:#04x}", code),
        }
    }
}
