use std::{
    sync::{
        atomic::{AtomicU32, AtomicU8, Ordering},
        Arc, RwLock,
    },
    thread::JoinHandle,
};

use crate::{
    ble::{self, BleMidi, Dispatch, MidiLink},
    config::{MidiConfig, Role, ScanParams, MIDI_CHARACTERISTIC_UUID, MIDI_SERVICE_UUID},
    error::{MidiError, MidiResult},
    gap::{Candidate, CandidateRef, Discovery},
    link::LinkEvent,
    packet::{Packetizer, Passthrough},
    radio::{
        BdAddr, CentralRadio, ClientHandle, ConnHandle, DisconnectReason, RadioEvent,
        RemoteCharacteristic,
    },
};

const NO_CONN: u32 = u32::MAX;
// The in-flight connection went down before it was committed
const DROPPED_CONN: u32 = u32::MAX - 1;

/// Where the client is in `Idle → Scanning → Connecting → Connected →
/// Disconnected → Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientState {
    Idle,
    Scanning,
    Connecting,
    Connected,
    Disconnected,
}

impl ClientState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ClientState::Scanning,
            2 => ClientState::Connecting,
            3 => ClientState::Connected,
            4 => ClientState::Disconnected,
            _ => ClientState::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Session {
    conn: ConnHandle,
    client: ClientHandle,
    characteristic: RemoteCharacteristic,
    peer: BdAddr,
}

/// Central role: scans for MIDI peripherals and connects to one of them.
pub struct MidiClient<R: CentralRadio>(pub Arc<MidiClientInner<R>>);

impl<R: CentralRadio> Clone for MidiClient<R> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

pub struct MidiClientInner<R: CentralRadio> {
    radio: Arc<R>,
    core: BleMidi,
    discovery: Discovery,

    state: AtomicU8,
    session: RwLock<Option<Session>>,
    // Connection being set up by `connect`, not yet the active link
    pending: AtomicU32,
}

impl<R: CentralRadio> MidiClient<R> {
    pub fn new(radio: Arc<R>) -> Self {
        Self::with_packetizer(radio, Passthrough)
    }

    pub fn with_packetizer<P: Packetizer>(radio: Arc<R>, packetizer: P) -> Self {
        Self(Arc::new(MidiClientInner {
            radio,
            core: BleMidi::new(Box::new(packetizer)),
            discovery: Discovery::new(),
            state: AtomicU8::new(ClientState::Idle as u8),
            session: RwLock::new(None),
            pending: AtomicU32::new(NO_CONN),
        }))
    }

    pub fn begin(&self, device_name: &str) -> MidiResult<()> {
        self.begin_with_config(MidiConfig::client(device_name))
    }

    pub fn begin_with_config(&self, config: MidiConfig) -> MidiResult<()> {
        if config.role != Role::Client {
            return Err(MidiError::RoleMismatch(config.role));
        }
        self.0.core.freeze_config(config.clone())?;

        let result = (|| -> anyhow::Result<()> {
            self.0.radio.init(&config.device_name)?;

            let client = Arc::downgrade(&self.0);
            self.0.radio.subscribe(Box::new(move |event| {
                let Some(client) = client.upgrade() else {
                    log::warn!("MIDI client is gone, ignoring radio event");
                    return;
                };
                client.handle_radio_event(event);
            }))?;

            Ok(())
        })()
        .map_err(MidiError::Transport);

        match &result {
            Ok(()) => log::info!("BLE MIDI client \"{}\" started", config.device_name),
            Err(err) => {
                log::error!("Failed to start BLE MIDI client: {}", err);
                self.0.core.take_config()?;
            }
        }

        result
    }

    /// Disconnects, forgets the candidates and releases the radio.
    pub fn end(&self) -> MidiResult<()> {
        if self.0.core.take_config()?.is_none() {
            return Err(MidiError::NotBegun);
        }

        if let Some(session) = self.0.take_session()? {
            if let Err(err) = self.0.radio.disconnect(session.client) {
                log::warn!("Failed to disconnect from {}: {:?}", session.peer, err);
            }
        }

        // The radio may not report the disconnect once it is torn down
        if let Some(conn) = self.0.core.link.reset() {
            self.0.set_state(ClientState::Disconnected);
            self.0.core.post(LinkEvent::Disconnected {
                conn,
                reason: DisconnectReason::LOCAL_HOST_TERMINATED,
            });
        }

        self.0.discovery.clear()?;
        self.0.radio.deinit().map_err(MidiError::Transport)?;
        log::info!("BLE MIDI client stopped");

        Ok(())
    }

    /// Scans with the configured parameters. Returns the number of MIDI
    /// devices found, 0 when the client is not started.
    pub fn scan(&self) -> MidiResult<usize> {
        let Some(config) = self.0.core.config()? else {
            return self.0.unavailable_scan();
        };
        self.0.scan(&config.scan)
    }

    pub fn scan_for(&self, duration_ms: u32) -> MidiResult<usize> {
        let Some(config) = self.0.core.config()? else {
            return self.0.unavailable_scan();
        };
        self.0.scan(&ScanParams {
            duration_ms,
            ..config.scan
        })
    }

    /// Candidate `index` of the most recent scan.
    pub fn candidate(&self, index: usize) -> Option<Candidate> {
        self.0.discovery.get(index)
    }

    pub fn candidate_ref(&self, index: usize) -> Option<CandidateRef> {
        self.0.discovery.get_ref(index)
    }

    pub fn candidate_count(&self) -> usize {
        self.0.discovery.len()
    }

    /// Connects to candidate `index` of the most recent scan. Nothing is
    /// left half connected on failure.
    pub fn connect(&self, index: usize) -> MidiResult<()> {
        if !self.0.core.is_begun() {
            return Err(MidiError::Unavailable);
        }

        let Some(candidate) = self.0.discovery.get(index) else {
            return Err(MidiError::InvalidIndex {
                index,
                count: self.0.discovery.len(),
            });
        };

        self.connect_to(candidate)
    }

    pub fn connect_ref(&self, candidate: CandidateRef) -> MidiResult<()> {
        if !self.0.core.is_begun() {
            return Err(MidiError::Unavailable);
        }

        let candidate = self.0.discovery.resolve(candidate)?;
        self.connect_to(candidate)
    }

    fn connect_to(&self, candidate: Candidate) -> MidiResult<()> {
        self.0
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                match ClientState::from_u8(state) {
                    ClientState::Connecting | ClientState::Connected => None,
                    _ => Some(ClientState::Connecting as u8),
                }
            })
            .map_err(|_| MidiError::AlreadyConnected)?;
        if self.0.core.link.is_established() {
            self.0.set_state(ClientState::Connected);
            return Err(MidiError::AlreadyConnected);
        }

        self.0.pending.store(NO_CONN, Ordering::Release);
        log::info!(
            "Connecting to \"{}\" ({})",
            candidate.name,
            candidate.address
        );

        let result = self
            .open_session(&candidate)
            .and_then(|session| self.commit(session));
        self.0.pending.store(NO_CONN, Ordering::Release);

        if let Err(err) = &result {
            log::warn!("Failed to connect to {}: {}", candidate.address, err);
            self.0.set_state(ClientState::Idle);
            return result;
        }

        log::info!("Connected to BLE MIDI device \"{}\"", candidate.name);
        Ok(())
    }

    /// Makes `session` the active link, unless its connection went down
    /// while it was being set up.
    fn commit(&self, session: Session) -> MidiResult<()> {
        let mut slot = self
            .0
            .session
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to write client session"))?;

        // Holding the session lock keeps the disconnect handler out until the
        // link is either committed or abandoned
        if self
            .0
            .pending
            .compare_exchange(
                u32::from(session.conn.0),
                NO_CONN,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(MidiError::Transport(anyhow::anyhow!(
                "Connection {:?} dropped while connecting",
                session.conn
            )));
        }

        let conn = session.conn;
        slot.replace(session);
        self.0.core.link.establish(conn);
        self.0.set_state(ClientState::Connected);
        self.0.core.post(LinkEvent::Connected(conn));

        Ok(())
    }

    fn open_session(&self, candidate: &Candidate) -> MidiResult<Session> {
        let radio = &self.0.radio;

        let client = radio.create_client().map_err(MidiError::Transport)?;
        let conn = radio
            .connect(client, &candidate.address)
            .map_err(MidiError::Transport)?;
        // The stack may already have reported it, or even dropped it
        let _ = self.0.pending.compare_exchange(
            NO_CONN,
            u32::from(conn.0),
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        let characteristic = self.wire_characteristic(client).inspect_err(|_| {
            if let Err(err) = radio.disconnect(client) {
                log::warn!("Failed to drop connection {:?}: {:?}", conn, err);
            }
        })?;

        Ok(Session {
            conn,
            client,
            characteristic,
            peer: candidate.address,
        })
    }

    fn wire_characteristic(&self, client: ClientHandle) -> MidiResult<RemoteCharacteristic> {
        let radio = &self.0.radio;

        let service = radio
            .get_service(client, &MIDI_SERVICE_UUID)
            .ok_or(MidiError::ServiceNotFound)?;
        let characteristic = radio
            .get_characteristic(&service, &MIDI_CHARACTERISTIC_UUID)
            .ok_or(MidiError::CharacteristicNotFound)?;

        if !characteristic.can_notify() {
            log::warn!("MIDI characteristic cannot notify, inbound MIDI is disabled");
            return Ok(characteristic);
        }

        let inner = Arc::downgrade(&self.0);
        radio
            .subscribe_notifications(
                &characteristic,
                Box::new(move |bytes| {
                    if let Some(inner) = inner.upgrade() {
                        inner.core.receive(bytes);
                    }
                }),
            )
            .map_err(MidiError::Transport)?;

        Ok(characteristic)
    }

    /// Closes the active connection. `on_disconnect` fires once the radio
    /// reports it.
    pub fn disconnect(&self) -> MidiResult<()> {
        let client = self
            .0
            .session
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to read client session"))?
            .map(|s| s.client);

        let Some(client) = client else {
            return Ok(());
        };

        self.0.radio.disconnect(client).map_err(MidiError::Transport)
    }

    /// Writes to the remote MIDI characteristic without response. Dropped
    /// while not connected.
    pub fn send(&self, bytes: &[u8]) -> MidiResult<()> {
        if !self.0.core.link.is_established() {
            log::trace!("Not connected, dropping {} bytes", bytes.len());
            return Ok(());
        }

        let characteristic = self
            .0
            .session
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to read client session"))?
            .map(|s| s.characteristic);

        let Some(characteristic) = characteristic else {
            return Ok(());
        };

        let packet = self.0.core.encode(bytes);
        self.0
            .radio
            .write_characteristic(&characteristic, &packet, false)
            .map_err(MidiError::Transport)
    }

    pub fn state(&self) -> ClientState {
        self.0.state()
    }

    /// Address of the connected peripheral.
    pub fn peer(&self) -> Option<BdAddr> {
        self.0.session.read().ok()?.map(|s| s.peer)
    }

    /// Handles every queued link event on the calling thread.
    pub fn process_events(&self) -> usize {
        ble::drain(self.0.as_ref())
    }

    pub fn spawn_dispatcher(&self) -> MidiResult<JoinHandle<()>> {
        Ok(ble::spawn_dispatcher(&self.0, "midi-client-events")?)
    }
}

impl<R: CentralRadio> MidiLink for MidiClient<R> {
    fn core(&self) -> &BleMidi {
        &self.0.core
    }
}

impl<R: CentralRadio> MidiClientInner<R> {
    fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ClientState) {
        let previous = self.state.swap(state as u8, Ordering::AcqRel);
        if previous != state as u8 {
            log::debug!(
                "Client state {:?} -> {:?}",
                ClientState::from_u8(previous),
                state
            );
        }
    }

    fn take_session(&self) -> anyhow::Result<Option<Session>> {
        Ok(self
            .session
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to write client session"))?
            .take())
    }

    fn unavailable_scan(&self) -> MidiResult<usize> {
        log::warn!("BLE MIDI client is not started, scan skipped");
        self.discovery.clear()?;
        Ok(0)
    }

    fn scan(&self, params: &ScanParams) -> MidiResult<usize> {
        self.set_state(ClientState::Scanning);
        let result = self.discovery.scan(self.radio.as_ref(), params);

        self.set_state(if self.core.link.is_established() {
            ClientState::Connected
        } else {
            ClientState::Idle
        });

        let count = result?;
        log::info!("{} BLE MIDI device(s) found", count);

        Ok(count)
    }

    // Radio context
    fn handle_radio_event(&self, event: RadioEvent) {
        match event {
            RadioEvent::Disconnected { conn, reason } => {
                let Ok(_session) = self.session.read() else {
                    log::error!(
                        "Failed to read client session, dropping disconnect of {:?}",
                        conn
                    );
                    return;
                };

                if self
                    .pending
                    .compare_exchange(
                        u32::from(conn.0),
                        DROPPED_CONN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    log::warn!(
                        "Connection {:?} dropped while connecting, reason {}",
                        conn,
                        reason
                    );
                    return;
                }

                if !self.core.link.release(conn) {
                    log::debug!("Ignoring disconnect of inactive {:?}", conn);
                    return;
                }

                log::info!("BLE MIDI device disconnected, reason {}", reason);
                self.set_state(ClientState::Disconnected);
                self.core.post(LinkEvent::Disconnected { conn, reason });
            }
            RadioEvent::Connected { conn, peer } => {
                log::debug!("Radio connected to {} ({:?})", peer, conn);
                if self.state() == ClientState::Connecting {
                    let _ = self.pending.compare_exchange(
                        NO_CONN,
                        u32::from(conn.0),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                }
            }
            RadioEvent::AdvertisementFound(report) => {
                log::trace!("Advertisement from {}", report.address);
            }
            RadioEvent::CharacteristicWritten { handle, .. } => {
                log::debug!("Ignoring write to local handle {}", handle);
            }
        }
    }
}

impl<R: CentralRadio> Dispatch for MidiClientInner<R> {
    fn midi(&self) -> &BleMidi {
        &self.core
    }

    fn dispatch(&self, event: LinkEvent) -> anyhow::Result<()> {
        match event {
            LinkEvent::Connected(_) => self.core.callbacks().fire_connect(),
            LinkEvent::Disconnected { conn, .. } => {
                {
                    let mut session = self
                        .session
                        .write()
                        .map_err(|_| anyhow::anyhow!("Failed to write client session"))?;
                    if session.map(|s| s.conn) == Some(conn) {
                        session.take();
                    }
                }

                self.core.callbacks().fire_disconnect()?;

                if !self.core.link.is_established() {
                    let _ = self.state.compare_exchange(
                        ClientState::Disconnected as u8,
                        ClientState::Idle as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                }

                Ok(())
            }
            LinkEvent::Packet(packet) => self.core.deliver(&packet),
        }
    }
}
