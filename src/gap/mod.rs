pub mod adv;

use std::sync::RwLock;

use adv::AdvertisingData;
use heapless::String;

use crate::{
    config::{ScanParams, MAX_CANDIDATES, MAX_NAME_LEN, MIDI_SERVICE_UUID},
    error::{MidiError, MidiResult},
    radio::{Advertisement, BdAddr, CentralRadio},
};

/// A device from the most recent scan that advertises the MIDI service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub address: BdAddr,
    pub name: String<MAX_NAME_LEN>,
    pub advertises_midi: bool,
    pub rssi: i8,
}

/// Names a candidate of one particular scan. Resolving it after a rescan
/// fails with [`MidiError::StaleCandidate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CandidateRef {
    pub version: u32,
    pub index: usize,
}

#[derive(Debug, Default)]
struct CandidateList {
    version: u32,
    devices: heapless::Vec<Candidate, MAX_CANDIDATES>,
}

/// Runs scans and owns the candidate list. Every scan replaces the list
/// wholesale and bumps its version.
#[derive(Debug, Default)]
pub struct Discovery {
    candidates: RwLock<CandidateList>,
}

impl Discovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops the current list. References into it become stale.
    pub fn clear(&self) -> anyhow::Result<u32> {
        let mut candidates = self
            .candidates
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to write candidate list"))?;

        candidates.version = candidates.version.wrapping_add(1);
        candidates.devices.clear();

        Ok(candidates.version)
    }

    /// Scans for `params.duration_ms` and keeps the MIDI devices found.
    /// A failed scan leaves an empty list and reports 0.
    pub fn scan<R: CentralRadio + ?Sized>(
        &self,
        radio: &R,
        params: &ScanParams,
    ) -> anyhow::Result<usize> {
        let version = self.clear()?;

        log::info!("Scanning for BLE MIDI devices ({} ms)", params.duration_ms);
        let reports = match radio.scan(params) {
            Ok(reports) => reports,
            Err(err) => {
                log::warn!("BLE scan failed: {:?}", err);
                return Ok(0);
            }
        };
        log::info!("Found {} BLE device(s)", reports.len());

        let devices = collect_candidates(&reports);
        let count = devices.len();

        let mut candidates = self
            .candidates
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to write candidate list"))?;

        // Another scan finished first, its list stays
        if candidates.version != version {
            log::warn!("Discarding results of superseded scan #{}", version);
            return Ok(0);
        }
        candidates.devices = devices;

        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.candidates
            .read()
            .map(|c| c.devices.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn version(&self) -> u32 {
        self.candidates.read().map(|c| c.version).unwrap_or(0)
    }

    pub fn get(&self, index: usize) -> Option<Candidate> {
        self.candidates.read().ok()?.devices.get(index).cloned()
    }

    pub fn get_ref(&self, index: usize) -> Option<CandidateRef> {
        let candidates = self.candidates.read().ok()?;
        (index < candidates.devices.len()).then_some(CandidateRef {
            version: candidates.version,
            index,
        })
    }

    pub fn resolve(&self, candidate: CandidateRef) -> MidiResult<Candidate> {
        let candidates = self
            .candidates
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to read candidate list"))?;

        if candidate.version != candidates.version {
            return Err(MidiError::StaleCandidate {
                found: candidate.version,
                current: candidates.version,
            });
        }

        candidates
            .devices
            .get(candidate.index)
            .cloned()
            .ok_or(MidiError::InvalidIndex {
                index: candidate.index,
                count: candidates.devices.len(),
            })
    }
}

fn collect_candidates(reports: &[Advertisement]) -> heapless::Vec<Candidate, MAX_CANDIDATES> {
    let mut devices = heapless::Vec::new();

    for report in reports {
        let data = AdvertisingData::parse(&report.data)
            .merge(AdvertisingData::parse(&report.scan_response));
        let name = data.name.clone().unwrap_or_default();

        if !data.advertises_service(&MIDI_SERVICE_UUID) {
            log::info!(
                " - Other type of BLE device : name = \"{}\", address = {}",
                name,
                report.address
            );
            continue;
        }

        log::info!(
            " - BLE MIDI device : name = \"{}\", address = {}, rssi = {}",
            name,
            report.address,
            report.rssi
        );

        // Active scans may report a device twice
        if devices
            .iter()
            .any(|c: &Candidate| c.address == report.address)
        {
            continue;
        }

        let candidate = Candidate {
            address: report.address,
            name,
            advertises_midi: true,
            rssi: report.rssi,
        };
        if devices.push(candidate).is_err() {
            log::warn!(
                "Candidate list is full, ignoring MIDI devices beyond {}",
                MAX_CANDIDATES
            );
            break;
        }
    }

    devices
}
