//! Legacy advertising payloads: building the peripheral's AD structures and
//! parsing the ones a scan reports.

use enumset::{EnumSet, EnumSetType};
use heapless::String;
use uuid::Uuid;

use crate::config::MAX_NAME_LEN;

/// Legacy advertising and scan response payloads are capped at 31 bytes.
pub const ADV_PAYLOAD_MAX: usize = 31;

pub const AD_TYPE_FLAGS: u8 = 0x01;
pub const AD_TYPE_INCOMPLETE_UUID128: u8 = 0x06;
pub const AD_TYPE_COMPLETE_UUID128: u8 = 0x07;
pub const AD_TYPE_SHORTENED_NAME: u8 = 0x08;
pub const AD_TYPE_COMPLETE_NAME: u8 = 0x09;
pub const AD_TYPE_APPEARANCE: u8 = 0x19;

/// Bits of the Flags AD structure, in bit order.
#[derive(EnumSetType, Debug)]
pub enum AdvFlag {
    LimitedDiscoverable,
    GeneralDiscoverable,
    BrEdrNotSupported,
    SimultaneousController,
    SimultaneousHost,
}

impl AdvFlag {
    fn bit(self) -> u8 {
        match self {
            AdvFlag::LimitedDiscoverable => 0x01,
            AdvFlag::GeneralDiscoverable => 0x02,
            AdvFlag::BrEdrNotSupported => 0x04,
            AdvFlag::SimultaneousController => 0x08,
            AdvFlag::SimultaneousHost => 0x10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisingData {
    pub flags: EnumSet<AdvFlag>,
    pub appearance: Option<u16>,
    pub service_uuids: Vec<Uuid>,
    pub name: Option<String<MAX_NAME_LEN>>,
}

impl AdvertisingData {
    /// Advertising payload of a MIDI peripheral: discoverable, LE only,
    /// with its appearance and service.
    pub fn midi(appearance: u16, service: Uuid) -> Self {
        Self {
            flags: AdvFlag::GeneralDiscoverable | AdvFlag::BrEdrNotSupported,
            appearance: Some(appearance),
            service_uuids: vec![service],
            name: None,
        }
    }

    /// Scan response carrying only the device name.
    pub fn scan_response(name: &str) -> Self {
        Self {
            name: Some(truncate_name(name)),
            ..Self::default()
        }
    }

    pub fn advertises_service(&self, uuid: &Uuid) -> bool {
        self.service_uuids.contains(uuid)
    }

    /// Encodes the AD structures. A name that does not fit in what is left of
    /// the payload is shortened and sent as a Shortened Local Name.
    pub fn to_bytes(&self) -> anyhow::Result<heapless::Vec<u8, ADV_PAYLOAD_MAX>> {
        let mut out = heapless::Vec::new();

        if !self.flags.is_empty() {
            let bits = self.flags.iter().fold(0u8, |acc, flag| acc | flag.bit());
            push_structure(&mut out, AD_TYPE_FLAGS, &[bits])?;
        }

        if let Some(appearance) = self.appearance {
            push_structure(&mut out, AD_TYPE_APPEARANCE, &appearance.to_le_bytes())?;
        }

        if !self.service_uuids.is_empty() {
            let mut uuids = std::vec::Vec::with_capacity(self.service_uuids.len() * 16);
            for uuid in &self.service_uuids {
                let mut bytes = *uuid.as_bytes();
                bytes.reverse();
                uuids.extend_from_slice(&bytes);
            }
            push_structure(&mut out, AD_TYPE_COMPLETE_UUID128, &uuids)?;
        }

        if let Some(name) = &self.name {
            let room = ADV_PAYLOAD_MAX.saturating_sub(out.len() + 2);
            if name.len() <= room {
                push_structure(&mut out, AD_TYPE_COMPLETE_NAME, name.as_bytes())?;
            } else {
                let cut = floor_char_boundary(name.as_str(), room);
                push_structure(&mut out, AD_TYPE_SHORTENED_NAME, &name.as_bytes()[..cut])?;
            }
        }

        Ok(out)
    }

    /// Parses AD structures, stopping quietly at the first malformed one.
    pub fn parse(data: &[u8]) -> Self {
        let mut parsed = Self::default();

        let mut i = 0;
        while i < data.len() {
            let len = data[i] as usize;
            if len == 0 || i + len >= data.len() {
                break;
            }
            let ad_type = data[i + 1];
            let value = &data[i + 2..i + 1 + len];

            match ad_type {
                AD_TYPE_FLAGS => {
                    if let Some(&bits) = value.first() {
                        parsed.flags = EnumSet::<AdvFlag>::all()
                            .iter()
                            .filter(|flag| bits & flag.bit() != 0)
                            .collect();
                    }
                }
                AD_TYPE_APPEARANCE if value.len() == 2 => {
                    parsed.appearance = Some(u16::from_le_bytes([value[0], value[1]]));
                }
                AD_TYPE_INCOMPLETE_UUID128 | AD_TYPE_COMPLETE_UUID128 => {
                    for chunk in value.chunks_exact(16) {
                        let mut bytes = [0u8; 16];
                        bytes.copy_from_slice(chunk);
                        bytes.reverse();
                        parsed.service_uuids.push(Uuid::from_bytes(bytes));
                    }
                }
                AD_TYPE_SHORTENED_NAME | AD_TYPE_COMPLETE_NAME => {
                    // A complete name wins over a shortened one
                    if parsed.name.is_none() || ad_type == AD_TYPE_COMPLETE_NAME {
                        parsed.name = Some(truncate_name(&std::string::String::from_utf8_lossy(
                            value,
                        )));
                    }
                }
                _ => {}
            }

            i += len + 1;
        }

        parsed
    }

    /// Merges the scan response into the advertising data.
    pub fn merge(mut self, other: AdvertisingData) -> Self {
        self.flags |= other.flags;
        self.appearance = self.appearance.or(other.appearance);
        for uuid in other.service_uuids {
            if !self.service_uuids.contains(&uuid) {
                self.service_uuids.push(uuid);
            }
        }
        if other.name.is_some() {
            self.name = other.name;
        }
        self
    }
}

fn push_structure(
    out: &mut heapless::Vec<u8, ADV_PAYLOAD_MAX>,
    ad_type: u8,
    value: &[u8],
) -> anyhow::Result<()> {
    let len = u8::try_from(value.len() + 1)
        .map_err(|_| anyhow::anyhow!("AD structure {:#04x} is too long", ad_type))?;

    out.push(len)
        .and_then(|_| out.push(ad_type))
        .map_err(|_| anyhow::anyhow!("Advertising payload exceeds {} bytes", ADV_PAYLOAD_MAX))?;
    out.extend_from_slice(value)
        .map_err(|_| anyhow::anyhow!("Advertising payload exceeds {} bytes", ADV_PAYLOAD_MAX))?;

    Ok(())
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    let mut cut = max.min(s.len());
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    cut
}

/// Copies at most `MAX_NAME_LEN` bytes of `name`, never splitting a char.
pub fn truncate_name(name: &str) -> String<MAX_NAME_LEN> {
    let mut out = String::new();
    let cut = floor_char_boundary(name, MAX_NAME_LEN);
    // Cannot fail, `cut` is within capacity
    let _ = out.push_str(&name[..cut]);
    out
}
