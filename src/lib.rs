//! BLE-MIDI link management for both GATT roles.
//!
//! [`MidiServer`] advertises the BLE-MIDI service and accepts one central,
//! [`MidiClient`] scans for MIDI peripherals and connects to one. Both drive
//! a radio through the traits in [`radio`] and move opaque bytes between it
//! and a [`Packetizer`](packet::Packetizer).
//!
//! Radio events are handled in two halves. The radio callback updates the
//! link state and queues a [`LinkEvent`](link::LinkEvent); the application
//! runs callbacks and packet handlers when it drains the queue with
//! `process_events` or from the thread started by `spawn_dispatcher`.

pub mod ble;
pub mod config;
pub mod error;
pub mod gap;
pub mod gattc;
pub mod gatts;
pub mod link;
pub mod packet;
pub mod radio;

pub use ble::MidiLink;
pub use config::{MidiConfig, Role, ScanParams, SecurityPolicy, TxPower};
pub use error::{MidiError, MidiResult};
pub use gap::{Candidate, CandidateRef};
pub use gattc::{ClientState, MidiClient};
pub use gatts::MidiServer;
pub use link::LinkSink;
pub use packet::{Packetizer, Passthrough};
