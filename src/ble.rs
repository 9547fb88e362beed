use std::{
    borrow::Cow,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, RwLock,
    },
    thread::JoinHandle,
};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::{
    config::{MidiConfig, PACKET_QUEUE_DEPTH},
    error::{MidiError, MidiResult},
    link::{Callbacks, LinkEvent, LinkSink, LinkState},
    packet::Packetizer,
};

// Callbacks and user code run on the dispatcher, so it gets more room than
// the radio event tasks.
const DISPATCHER_STACK_SIZE: usize = 64 * 1024;

type Handler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// State shared by both roles: the link, the registered callbacks, the
/// packetizer and the queue between radio context and application.
pub struct BleMidi {
    pub link: LinkState,
    callbacks: Callbacks,
    packet_handler: RwLock<Option<Handler>>,
    packetizer: Box<dyn Packetizer>,
    config: RwLock<Option<MidiConfig>>,

    events_tx: Sender<LinkEvent>,
    events_rx: Receiver<LinkEvent>,
    queued_packets: AtomicUsize,
}

impl BleMidi {
    pub fn new(packetizer: Box<dyn Packetizer>) -> Self {
        let (events_tx, events_rx) = unbounded();

        Self {
            link: LinkState::new(),
            callbacks: Callbacks::default(),
            packet_handler: RwLock::new(None),
            packetizer,
            config: RwLock::new(None),
            events_tx,
            events_rx,
            queued_packets: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> MidiResult<Option<MidiConfig>> {
        Ok(self
            .config
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to read MIDI config"))?
            .clone())
    }

    pub fn is_begun(&self) -> bool {
        self.config.read().map(|c| c.is_some()).unwrap_or(false)
    }

    pub(crate) fn freeze_config(&self, config: MidiConfig) -> MidiResult<()> {
        let mut current = self
            .config
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to write MIDI config"))?;

        if current.is_some() {
            return Err(MidiError::AlreadyBegun);
        }
        current.replace(config);

        Ok(())
    }

    pub(crate) fn take_config(&self) -> MidiResult<Option<MidiConfig>> {
        Ok(self
            .config
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to write MIDI config"))?
            .take())
    }

    pub(crate) fn callbacks(&self) -> &Callbacks {
        &self.callbacks
    }

    pub(crate) fn encode<'a>(&self, bytes: &'a [u8]) -> Cow<'a, [u8]> {
        self.packetizer.encode(bytes)
    }

    /// Queues a lifecycle event for the application side. Safe to call from
    /// the radio context: never blocks, and queued packets never crowd it out.
    pub(crate) fn post(&self, event: LinkEvent) {
        if let Err(err) = self.events_tx.send(event) {
            log::warn!("Link event queue is closed, dropping {:?}", err.into_inner());
        }
    }

    /// Packet receiver, runs in the radio context. At most
    /// [`PACKET_QUEUE_DEPTH`] packets wait for the application, the rest are
    /// dropped.
    pub(crate) fn receive(&self, bytes: &[u8]) {
        if !self.link.is_established() {
            log::debug!("Dropping {} inbound bytes, link is down", bytes.len());
            return;
        }

        let admitted = self
            .queued_packets
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |queued| {
                (queued < PACKET_QUEUE_DEPTH).then_some(queued + 1)
            });
        if admitted.is_err() {
            log::error!(
                "Packet queue is full, dropping {} inbound bytes",
                bytes.len()
            );
            return;
        }

        self.post(LinkEvent::Packet(bytes.to_vec()));
    }

    /// Accounts for an event leaving the queue.
    fn taken(&self, event: &LinkEvent) {
        if matches!(event, LinkEvent::Packet(_)) {
            self.queued_packets.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Decodes a queued packet and hands it to the application handler.
    pub(crate) fn deliver(&self, packet: &[u8]) -> anyhow::Result<()> {
        let handler = self
            .packet_handler
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to read packet handler"))?
            .clone();

        let Some(handler) = handler else {
            log::debug!("No packet handler, dropping {} bytes", packet.len());
            return Ok(());
        };

        let bytes = self.packetizer.decode(packet);
        handler(&bytes);

        Ok(())
    }

    pub(crate) fn set_packet_handler(&self, handler: Option<Handler>) -> MidiResult<()> {
        *self
            .packet_handler
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to write packet handler"))? = handler;
        Ok(())
    }

    pub(crate) fn next_event(&self) -> Option<LinkEvent> {
        let event = self.events_rx.try_recv().ok()?;
        self.taken(&event);
        Some(event)
    }

    pub(crate) fn events(&self) -> Receiver<LinkEvent> {
        self.events_rx.clone()
    }
}

/// Application-facing surface common to [`MidiClient`](crate::MidiClient)
/// and [`MidiServer`](crate::MidiServer).
pub trait MidiLink {
    fn core(&self) -> &BleMidi;

    fn is_connected(&self) -> bool {
        self.core().link.is_established()
    }

    fn set_sink(&self, sink: Arc<dyn LinkSink>) -> MidiResult<()> {
        Ok(self.core().callbacks().set_sink(sink)?)
    }

    fn set_on_connect<F>(&self, callback: F) -> MidiResult<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Ok(self
            .core()
            .callbacks()
            .set_on_connect(Some(Arc::new(callback)))?)
    }

    fn set_on_disconnect<F>(&self, callback: F) -> MidiResult<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Ok(self
            .core()
            .callbacks()
            .set_on_disconnect(Some(Arc::new(callback)))?)
    }

    fn clear_callbacks(&self) -> MidiResult<()> {
        self.core().callbacks().set_on_connect(None)?;
        Ok(self.core().callbacks().set_on_disconnect(None)?)
    }

    /// Receives decoded inbound bytes. Without a handler they are dropped.
    fn set_packet_handler<F>(&self, handler: F) -> MidiResult<()>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.core().set_packet_handler(Some(Arc::new(handler)))
    }
}

/// Role specific handling of queued link events.
pub(crate) trait Dispatch: Send + Sync + 'static {
    fn midi(&self) -> &BleMidi;
    fn dispatch(&self, event: LinkEvent) -> anyhow::Result<()>;
}

/// Runs every queued event on the caller's thread.
pub(crate) fn drain<D: Dispatch>(inner: &D) -> usize {
    let mut handled = 0;

    while let Some(event) = inner.midi().next_event() {
        if let Err(err) = inner.dispatch(event) {
            log::error!("Failed to handle link event: {:?}", err);
        }
        handled += 1;
    }

    handled
}

/// Runs queued events on a dedicated thread until the manager is dropped.
pub(crate) fn spawn_dispatcher<D: Dispatch>(
    inner: &Arc<D>,
    name: &str,
) -> anyhow::Result<JoinHandle<()>> {
    let events = inner.midi().events();
    let inner = Arc::downgrade(inner);

    let handle = std::thread::Builder::new()
        .name(name.to_string())
        .stack_size(DISPATCHER_STACK_SIZE)
        .spawn(move || {
            for event in events.iter() {
                let Some(inner) = inner.upgrade() else {
                    log::warn!("Link manager is gone, exiting dispatcher thread");
                    return;
                };
                inner.midi().taken(&event);

                if let Err(err) = inner.dispatch(event) {
                    log::error!("Failed to handle link event: {:?}", err);
                }
            }
        })?;

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::packet::Passthrough;
    use crate::radio::{ConnHandle, DisconnectReason};

    struct Reverse;

    impl Packetizer for Reverse {
        fn encode<'a>(&self, bytes: &'a [u8]) -> Cow<'a, [u8]> {
            Cow::Owned(bytes.iter().rev().copied().collect())
        }

        fn decode<'a>(&self, packet: &'a [u8]) -> Cow<'a, [u8]> {
            Cow::Owned(packet.iter().rev().copied().collect())
        }
    }

    #[test]
    fn config_is_frozen_once() {
        let midi = BleMidi::new(Box::new(Passthrough));
        assert!(!midi.is_begun());

        midi.freeze_config(MidiConfig::server("Piano")).unwrap();
        assert!(midi.is_begun());
        assert!(matches!(
            midi.freeze_config(MidiConfig::server("Organ")),
            Err(MidiError::AlreadyBegun)
        ));
        assert_eq!(
            midi.config().unwrap().map(|c| c.device_name),
            Some("Piano".to_string())
        );

        midi.take_config().unwrap();
        assert!(!midi.is_begun());
    }

    #[test]
    fn receive_is_gated_by_link() {
        let midi = BleMidi::new(Box::new(Passthrough));

        midi.receive(&[0x80, 0x80, 0x90]);
        assert_eq!(midi.next_event(), None);

        midi.link.establish(ConnHandle(0));
        midi.receive(&[0x80, 0x80, 0x90]);
        assert_eq!(
            midi.next_event(),
            Some(LinkEvent::Packet(vec![0x80, 0x80, 0x90]))
        );
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let midi = BleMidi::new(Box::new(Passthrough));
        midi.link.establish(ConnHandle(0));

        for i in 0..PACKET_QUEUE_DEPTH + 4 {
            midi.receive(&[i as u8]);
        }

        let mut queued = 0;
        while midi.next_event().is_some() {
            queued += 1;
        }
        assert_eq!(queued, PACKET_QUEUE_DEPTH);

        // Draining frees room again
        midi.receive(&[0x90]);
        assert_eq!(midi.next_event(), Some(LinkEvent::Packet(vec![0x90])));
    }

    #[test]
    fn lifecycle_events_survive_a_full_packet_queue() {
        let midi = BleMidi::new(Box::new(Passthrough));
        midi.link.establish(ConnHandle(0));

        for i in 0..PACKET_QUEUE_DEPTH + 1 {
            midi.receive(&[i as u8]);
        }
        midi.link.reset();
        midi.post(LinkEvent::Disconnected {
            conn: ConnHandle(0),
            reason: DisconnectReason::CONNECTION_TIMEOUT,
        });

        let events: Vec<_> = std::iter::from_fn(|| midi.next_event()).collect();
        assert_eq!(events.len(), PACKET_QUEUE_DEPTH + 1);
        assert_eq!(
            events.last(),
            Some(&LinkEvent::Disconnected {
                conn: ConnHandle(0),
                reason: DisconnectReason::CONNECTION_TIMEOUT,
            })
        );
    }

    #[test]
    fn deliver_decodes_through_packetizer() {
        let midi = BleMidi::new(Box::new(Reverse));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        midi.set_packet_handler(Some(Arc::new(move |bytes: &[u8]| {
            sink.lock().unwrap().push(bytes.to_vec());
        })))
        .unwrap();

        midi.deliver(&[1, 2, 3]).unwrap();
        assert_eq!(midi.encode(&[4, 5]).into_owned(), vec![5, 4]);
        assert_eq!(*seen.lock().unwrap(), vec![vec![3, 2, 1]]);
    }

    #[test]
    fn deliver_without_handler_is_dropped() {
        let midi = BleMidi::new(Box::new(Passthrough));
        midi.deliver(&[1, 2, 3]).unwrap();
    }
}
