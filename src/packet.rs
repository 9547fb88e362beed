//! Boundary to the BLE-MIDI packet format.
//!
//! Header/timestamp framing and MTU chunking belong to the packetizer; the
//! link managers only move opaque bytes between it and the radio.

use std::borrow::Cow;

pub trait Packetizer: Send + Sync + 'static {
    /// Outbound MIDI bytes to one BLE-MIDI packet.
    fn encode<'a>(&self, bytes: &'a [u8]) -> Cow<'a, [u8]>;

    /// Inbound BLE-MIDI packet to MIDI bytes.
    fn decode<'a>(&self, packet: &'a [u8]) -> Cow<'a, [u8]>;
}

/// Hands bytes through unchanged, for callers that already produce framed
/// packets.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl Packetizer for Passthrough {
    fn encode<'a>(&self, bytes: &'a [u8]) -> Cow<'a, [u8]> {
        Cow::Borrowed(bytes)
    }

    fn decode<'a>(&self, packet: &'a [u8]) -> Cow<'a, [u8]> {
        Cow::Borrowed(packet)
    }
}
