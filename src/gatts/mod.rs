pub mod characteristic;
pub mod service;

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use service::ServiceConfig;

use crate::{
    ble::{self, BleMidi, Dispatch, MidiLink},
    config::{MidiConfig, Role, SecurityPolicy, MIDI_SERVICE_UUID},
    error::{MidiError, MidiResult},
    gap::adv::AdvertisingData,
    link::LinkEvent,
    packet::{Packetizer, Passthrough},
    radio::{DisconnectReason, LocalCharacteristic, PeripheralRadio, RadioEvent},
};

const NO_CHARACTERISTIC: u32 = u32::MAX;

/// Peripheral role: advertises the MIDI service and accepts one central.
pub struct MidiServer<R: PeripheralRadio>(pub Arc<MidiServerInner<R>>);

impl<R: PeripheralRadio> Clone for MidiServer<R> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

pub struct MidiServerInner<R: PeripheralRadio> {
    radio: Arc<R>,
    core: BleMidi,

    characteristic: AtomicU32,
    advertising: AtomicBool,
    advertising_failures: AtomicU32,
}

impl<R: PeripheralRadio> MidiServer<R> {
    pub fn new(radio: Arc<R>) -> Self {
        Self::with_packetizer(radio, Passthrough)
    }

    pub fn with_packetizer<P: Packetizer>(radio: Arc<R>, packetizer: P) -> Self {
        Self(Arc::new(MidiServerInner {
            radio,
            core: BleMidi::new(Box::new(packetizer)),
            characteristic: AtomicU32::new(NO_CHARACTERISTIC),
            advertising: AtomicBool::new(false),
            advertising_failures: AtomicU32::new(0),
        }))
    }

    pub fn begin(&self, device_name: &str) -> MidiResult<()> {
        self.begin_with_config(MidiConfig::server(device_name))
    }

    /// Brings the peripheral up and starts advertising. Advertising that
    /// cannot start is fatal for the server and is not retried.
    pub fn begin_with_config(&self, config: MidiConfig) -> MidiResult<()> {
        if config.role != Role::Server {
            return Err(MidiError::RoleMismatch(config.role));
        }
        self.0.core.freeze_config(config.clone())?;

        let result = self.bring_up(&config);
        if result.is_err() {
            self.0.core.take_config()?;
            self.0.characteristic.store(NO_CHARACTERISTIC, Ordering::Release);
            if let Err(err) = self.0.radio.deinit() {
                log::warn!("Failed to deinit radio after failed begin: {:?}", err);
            }
        }

        result
    }

    fn bring_up(&self, config: &MidiConfig) -> MidiResult<()> {
        let radio = &self.0.radio;

        radio
            .init(&config.device_name)
            .map_err(MidiError::Transport)?;

        // Not fatal: the controller keeps its default power
        if let Err(err) = radio.set_tx_power(config.tx_power) {
            log::warn!(
                "Failed to set TX power to {} dBm: {:?}",
                config.tx_power.dbm(),
                err
            );
        }

        radio
            .set_security(&SecurityPolicy::MIDI)
            .map_err(MidiError::Transport)?;

        let server = Arc::downgrade(&self.0);
        radio
            .subscribe(Box::new(move |event| {
                let Some(server) = server.upgrade() else {
                    log::warn!("MIDI server is gone, ignoring radio event");
                    return;
                };
                server.handle_radio_event(event);
            }))
            .map_err(MidiError::Transport)?;

        let characteristic = radio
            .create_service(&ServiceConfig::midi())
            .map_err(MidiError::Transport)?;
        self.0
            .characteristic
            .store(u32::from(characteristic.handle), Ordering::Release);
        log::info!(
            "BLE MIDI service created, characteristic handle {}",
            characteristic.handle
        );

        let advertising = AdvertisingData::midi(config.appearance, MIDI_SERVICE_UUID).to_bytes()?;
        let scan_response = AdvertisingData::scan_response(&config.device_name).to_bytes()?;
        radio
            .set_advertising_data(&advertising, &scan_response)
            .map_err(MidiError::Transport)?;

        if let Err(err) = radio.start_advertising() {
            log::error!("BLE MIDI advertising failed: {:?}", err);
            return Err(MidiError::StartupFatal(err));
        }
        self.0.advertising.store(true, Ordering::Release);
        log::info!("BLE MIDI advertising started as \"{}\"", config.device_name);

        Ok(())
    }

    /// Stops advertising, drops the link and releases the radio.
    pub fn end(&self) -> MidiResult<()> {
        if self.0.core.take_config()?.is_none() {
            return Err(MidiError::NotBegun);
        }

        if self.0.advertising.swap(false, Ordering::AcqRel) {
            if let Err(err) = self.0.radio.stop_advertising() {
                log::warn!("Failed to stop advertising: {:?}", err);
            }
        }

        if let Some(conn) = self.0.core.link.reset() {
            self.0.core.post(LinkEvent::Disconnected {
                conn,
                reason: DisconnectReason::LOCAL_HOST_TERMINATED,
            });
        }
        self.0.characteristic.store(NO_CHARACTERISTIC, Ordering::Release);

        self.0.radio.deinit().map_err(MidiError::Transport)?;
        log::info!("BLE MIDI server stopped");

        Ok(())
    }

    /// Notifies the connected central. Dropped while no central is connected.
    pub fn send(&self, bytes: &[u8]) -> MidiResult<()> {
        if !self.0.core.link.is_established() {
            log::trace!("Not connected, dropping {} bytes", bytes.len());
            return Ok(());
        }

        let Some(characteristic) = self.0.characteristic() else {
            return Err(MidiError::NotBegun);
        };

        let packet = self.0.core.encode(bytes);
        self.0
            .radio
            .notify(&characteristic, &packet)
            .map_err(MidiError::Transport)
    }

    pub fn is_advertising(&self) -> bool {
        self.0.advertising.load(Ordering::Acquire)
    }

    /// Consecutive failed advertising restarts since the last success.
    pub fn advertising_failures(&self) -> u32 {
        self.0.advertising_failures.load(Ordering::Acquire)
    }

    /// Handles every queued link event on the calling thread.
    pub fn process_events(&self) -> usize {
        ble::drain(self.0.as_ref())
    }

    pub fn spawn_dispatcher(&self) -> MidiResult<JoinHandle<()>> {
        Ok(ble::spawn_dispatcher(&self.0, "midi-server-events")?)
    }
}

impl<R: PeripheralRadio> MidiLink for MidiServer<R> {
    fn core(&self) -> &BleMidi {
        &self.0.core
    }
}

impl<R: PeripheralRadio> MidiServerInner<R> {
    fn characteristic(&self) -> Option<LocalCharacteristic> {
        match self.characteristic.load(Ordering::Acquire) {
            NO_CHARACTERISTIC => None,
            handle => Some(LocalCharacteristic {
                handle: handle as u16,
            }),
        }
    }

    // Radio context
    fn handle_radio_event(&self, event: RadioEvent) {
        match event {
            RadioEvent::Connected { conn, peer } => {
                log::info!("Central {} connected ({:?})", peer, conn);
                self.advertising.store(false, Ordering::Release);
                if let Some(previous) = self.core.link.establish(conn) {
                    log::warn!("Connection {:?} replaced {:?}", conn, previous);
                }
                self.core.post(LinkEvent::Connected(conn));
            }
            RadioEvent::Disconnected { conn, reason } => {
                if !self.core.link.release(conn) {
                    log::debug!("Ignoring disconnect of inactive {:?}", conn);
                    return;
                }

                log::info!("Central disconnected ({:?}), reason {}", conn, reason);
                self.core.post(LinkEvent::Disconnected { conn, reason });
            }
            RadioEvent::CharacteristicWritten { handle, value, .. } => {
                if value.is_empty() {
                    return;
                }
                if self.characteristic().map(|c| c.handle) != Some(handle) {
                    log::debug!("Ignoring write to unknown handle {}", handle);
                    return;
                }
                self.core.receive(&value);
            }
            RadioEvent::AdvertisementFound(_) => {}
        }
    }

    fn restart_advertising(&self) {
        if !self.core.is_begun() {
            return;
        }

        match self.radio.start_advertising() {
            Ok(()) => {
                self.advertising.store(true, Ordering::Release);
                self.advertising_failures.store(0, Ordering::Release);
                log::info!("BLE MIDI advertising restarted");
            }
            Err(err) => {
                let failures = self.advertising_failures.fetch_add(1, Ordering::AcqRel) + 1;
                log::error!(
                    "Failed to restart BLE MIDI advertising ({} in a row): {:?}",
                    failures,
                    err
                );
            }
        }
    }
}

impl<R: PeripheralRadio> Dispatch for MidiServerInner<R> {
    fn midi(&self) -> &BleMidi {
        &self.core
    }

    fn dispatch(&self, event: LinkEvent) -> anyhow::Result<()> {
        match event {
            LinkEvent::Connected(_) => self.core.callbacks().fire_connect(),
            LinkEvent::Disconnected { .. } => {
                self.core.callbacks().fire_disconnect()?;
                self.restart_advertising();
                Ok(())
            }
            LinkEvent::Packet(packet) => self.core.deliver(&packet),
        }
    }
}
