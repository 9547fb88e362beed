use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, RwLock,
};

use crate::radio::{ConnHandle, DisconnectReason};

const NO_LINK: u32 = u32::MAX;

/// Whether the MIDI link is established, and over which connection.
///
/// Both fields live in one atomic word so the radio context can flip the
/// state without taking a lock and readers never observe a torn value.
#[derive(Debug)]
pub struct LinkState {
    active: AtomicU32,
}

impl Default for LinkState {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkState {
    pub const fn new() -> Self {
        Self {
            active: AtomicU32::new(NO_LINK),
        }
    }

    pub fn is_established(&self) -> bool {
        self.active.load(Ordering::Acquire) != NO_LINK
    }

    pub fn connection(&self) -> Option<ConnHandle> {
        match self.active.load(Ordering::Acquire) {
            NO_LINK => None,
            conn => Some(ConnHandle(conn as u16)),
        }
    }

    /// Marks `conn` as the active link, returning the one it replaced.
    pub(crate) fn establish(&self, conn: ConnHandle) -> Option<ConnHandle> {
        match self.active.swap(u32::from(conn.0), Ordering::AcqRel) {
            NO_LINK => None,
            previous => Some(ConnHandle(previous as u16)),
        }
    }

    /// Clears the link only if `conn` is the active one.
    pub(crate) fn release(&self, conn: ConnHandle) -> bool {
        self.active
            .compare_exchange(
                u32::from(conn.0),
                NO_LINK,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Clears the link whatever it was, returning the previous connection.
    pub(crate) fn reset(&self) -> Option<ConnHandle> {
        match self.active.swap(NO_LINK, Ordering::AcqRel) {
            NO_LINK => None,
            previous => Some(ConnHandle(previous as u16)),
        }
    }
}

/// Receives link lifecycle notifications. Both methods run on the
/// application side, never inside the radio context.
pub trait LinkSink: Send + Sync {
    fn on_connect(&self) {}
    fn on_disconnect(&self) {}
}

pub(crate) type Notify = Arc<dyn Fn() + Send + Sync>;

/// The registered connect/disconnect handlers. Last registration wins.
#[derive(Default)]
pub(crate) struct Callbacks {
    on_connect: RwLock<Option<Notify>>,
    on_disconnect: RwLock<Option<Notify>>,
}

impl Callbacks {
    pub fn set_sink(&self, sink: Arc<dyn LinkSink>) -> anyhow::Result<()> {
        let connect_sink = sink.clone();
        self.set_on_connect(Some(Arc::new(move || connect_sink.on_connect())))?;
        self.set_on_disconnect(Some(Arc::new(move || sink.on_disconnect())))
    }

    pub fn set_on_connect(&self, callback: Option<Notify>) -> anyhow::Result<()> {
        *self
            .on_connect
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to write on_connect callback"))? = callback;
        Ok(())
    }

    pub fn set_on_disconnect(&self, callback: Option<Notify>) -> anyhow::Result<()> {
        *self
            .on_disconnect
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to write on_disconnect callback"))? = callback;
        Ok(())
    }

    // The lock is released before the callback runs, so a callback may
    // re-register itself.
    pub fn fire_connect(&self) -> anyhow::Result<()> {
        let callback = self
            .on_connect
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to read on_connect callback"))?
            .clone();
        if let Some(callback) = callback {
            callback();
        }
        Ok(())
    }

    pub fn fire_disconnect(&self) -> anyhow::Result<()> {
        let callback = self
            .on_disconnect
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to read on_disconnect callback"))?
            .clone();
        if let Some(callback) = callback {
            callback();
        }
        Ok(())
    }
}

/// What the radio context hands over to the application side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected(ConnHandle),
    Disconnected {
        conn: ConnHandle,
        reason: DisconnectReason,
    },
    Packet(Vec<u8>),
}
