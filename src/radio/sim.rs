//! In-process radio. Peripherals and centrals created from one [`SimAir`]
//! see each other: scans report advertising peripherals, connects open a
//! link, writes and notifications travel over it.
//!
//! Events are raised synchronously from the calling thread, after the air
//! lock has been released, so handlers may call back into the radio.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use uuid::Uuid;

use super::*;
use crate::config::{ScanParams, SecurityPolicy, TxPower};
use crate::gatts::service::ServiceConfig;

type Handler = Arc<dyn Fn(RadioEvent) + Send + Sync>;
type NotifyHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

const SERVICE_HANDLE: u16 = 0x0028;
const CHARACTERISTIC_HANDLE: u16 = 0x002a;
const SIM_RSSI: i8 = -42;

#[derive(Default)]
struct Peripheral {
    initialized: bool,
    events: Option<Handler>,

    tx_power: Option<TxPower>,
    security: Option<SecurityPolicy>,
    service: Option<ServiceConfig>,
    value: Vec<u8>,

    advertising_data: Vec<u8>,
    scan_response: Vec<u8>,
    advertising: bool,
    fail_advertising: bool,
}

#[derive(Default)]
struct Central {
    initialized: bool,
    events: Option<Handler>,
    notify: HashMap<u16, NotifyHandler>,
}

#[derive(Debug, Clone, Copy)]
struct Link {
    conn: ConnHandle,
    central: BdAddr,
    client: ClientHandle,
    peripheral: BdAddr,
}

#[derive(Default)]
struct Air {
    peripherals: HashMap<BdAddr, Peripheral>,
    centrals: HashMap<BdAddr, Central>,
    beacons: Vec<Advertisement>,
    links: Vec<Link>,
    next_conn: u16,
    next_client: u16,
}

impl Air {
    fn link_of(&self, central: BdAddr, client: ClientHandle) -> Option<Link> {
        self.links
            .iter()
            .find(|l| l.central == central && l.client == client)
            .copied()
    }

    fn remove_link(&mut self, conn: ConnHandle) -> Option<Link> {
        let index = self.links.iter().position(|l| l.conn == conn)?;
        Some(self.links.remove(index))
    }

    fn central_events(&self, address: BdAddr) -> Option<Handler> {
        self.centrals.get(&address).and_then(|c| c.events.clone())
    }

    fn peripheral_events(&self, address: BdAddr) -> Option<Handler> {
        self.peripherals.get(&address).and_then(|p| p.events.clone())
    }

    /// Handlers to run once a link went down, one per side.
    fn link_down(
        &self,
        link: &Link,
        central_reason: DisconnectReason,
        peripheral_reason: DisconnectReason,
    ) -> Vec<(Handler, RadioEvent)> {
        let mut pending = Vec::new();

        if let Some(events) = self.central_events(link.central) {
            pending.push((
                events,
                RadioEvent::Disconnected {
                    conn: link.conn,
                    reason: central_reason,
                },
            ));
        }
        if let Some(events) = self.peripheral_events(link.peripheral) {
            pending.push((
                events,
                RadioEvent::Disconnected {
                    conn: link.conn,
                    reason: peripheral_reason,
                },
            ));
        }

        pending
    }

    /// Removes every link `node` takes part in.
    fn drop_links_of(
        &mut self,
        node: BdAddr,
        central_reason: DisconnectReason,
        peripheral_reason: DisconnectReason,
    ) -> Vec<(Handler, RadioEvent)> {
        let (dropped, kept): (Vec<Link>, Vec<Link>) = self
            .links
            .iter()
            .partition(|l| l.central == node || l.peripheral == node);
        self.links = kept;

        dropped
            .iter()
            .flat_map(|link| self.link_down(link, central_reason, peripheral_reason))
            .collect()
    }
}

fn raise(pending: Vec<(Handler, RadioEvent)>) {
    for (handler, event) in pending {
        handler(event);
    }
}

/// The shared medium of the simulated radios.
#[derive(Clone, Default)]
pub struct SimAir(Arc<Mutex<Air>>);

impl SimAir {
    pub fn new() -> Self {
        Self::default()
    }

    fn air(&self) -> anyhow::Result<MutexGuard<'_, Air>> {
        self.0
            .lock()
            .map_err(|_| anyhow::anyhow!("Failed to lock simulated air"))
    }

    pub fn peripheral(&self, address: BdAddr) -> anyhow::Result<SimPeripheral> {
        self.air()?.peripherals.entry(address).or_default();
        Ok(SimPeripheral {
            air: self.clone(),
            address,
        })
    }

    pub fn central(&self, address: BdAddr) -> anyhow::Result<SimCentral> {
        self.air()?.centrals.entry(address).or_default();
        Ok(SimCentral {
            air: self.clone(),
            address,
        })
    }

    /// A non-connectable advertiser every scan reports.
    pub fn add_beacon(&self, advertisement: Advertisement) -> anyhow::Result<()> {
        self.air()?.beacons.push(advertisement);
        Ok(())
    }

    /// Drops a link as a supervision timeout would, telling both sides.
    pub fn drop_link(&self, conn: ConnHandle, reason: DisconnectReason) -> anyhow::Result<bool> {
        let pending = {
            let mut air = self.air()?;
            let Some(link) = air.remove_link(conn) else {
                return Ok(false);
            };
            air.link_down(&link, reason, reason)
        };

        raise(pending);
        Ok(true)
    }

    /// Makes `start_advertising` of the peripheral at `address` fail.
    pub fn fail_advertising(&self, address: BdAddr, fail: bool) -> anyhow::Result<()> {
        let mut air = self.air()?;
        let peripheral = air
            .peripherals
            .get_mut(&address)
            .ok_or_else(|| anyhow::anyhow!("No simulated peripheral at {}", address))?;
        peripheral.fail_advertising = fail;
        Ok(())
    }

    pub fn is_advertising(&self, address: BdAddr) -> bool {
        self.air()
            .map(|air| {
                air.peripherals
                    .get(&address)
                    .is_some_and(|p| p.advertising)
            })
            .unwrap_or(false)
    }

    pub fn connections(&self) -> Vec<ConnHandle> {
        self.air()
            .map(|air| air.links.iter().map(|l| l.conn).collect())
            .unwrap_or_default()
    }

    pub fn security(&self, address: BdAddr) -> Option<SecurityPolicy> {
        self.air().ok()?.peripherals.get(&address)?.security
    }

    pub fn tx_power(&self, address: BdAddr) -> Option<TxPower> {
        self.air().ok()?.peripherals.get(&address)?.tx_power
    }

    /// Current value of the peripheral's MIDI characteristic.
    pub fn characteristic_value(&self, address: BdAddr) -> Option<Vec<u8>> {
        self.air().ok()?.peripherals.get(&address).map(|p| p.value.clone())
    }
}

pub struct SimPeripheral {
    air: SimAir,
    address: BdAddr,
}

impl SimPeripheral {
    fn with<T>(&self, f: impl FnOnce(&mut Peripheral) -> anyhow::Result<T>) -> anyhow::Result<T> {
        let mut air = self.air.air()?;
        let peripheral = air
            .peripherals
            .get_mut(&self.address)
            .ok_or_else(|| anyhow::anyhow!("No simulated peripheral at {}", self.address))?;
        f(peripheral)
    }

    fn with_initialized<T>(
        &self,
        f: impl FnOnce(&mut Peripheral) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        self.with(|p| {
            if !p.initialized {
                return Err(anyhow::anyhow!("Radio is not initialized"));
            }
            f(p)
        })
    }
}

impl Radio for SimPeripheral {
    fn init(&self, _device_name: &str) -> anyhow::Result<()> {
        self.with(|p| {
            p.initialized = true;
            Ok(())
        })
    }

    fn deinit(&self) -> anyhow::Result<()> {
        let pending = {
            let mut air = self.air.air()?;
            if let Some(p) = air.peripherals.get_mut(&self.address) {
                *p = Peripheral::default();
            }

            air.drop_links_of(
                self.address,
                DisconnectReason::REMOTE_USER_TERMINATED,
                DisconnectReason::LOCAL_HOST_TERMINATED,
            )
        };

        raise(pending);
        Ok(())
    }

    fn subscribe(&self, callback: EventCallback) -> anyhow::Result<()> {
        self.with(|p| {
            p.events = Some(Arc::from(callback));
            Ok(())
        })
    }
}

impl PeripheralRadio for SimPeripheral {
    fn set_tx_power(&self, power: TxPower) -> anyhow::Result<()> {
        self.with_initialized(|p| {
            p.tx_power = Some(power);
            Ok(())
        })
    }

    fn set_security(&self, policy: &SecurityPolicy) -> anyhow::Result<()> {
        self.with_initialized(|p| {
            p.security = Some(*policy);
            Ok(())
        })
    }

    fn create_service(&self, service: &ServiceConfig) -> anyhow::Result<LocalCharacteristic> {
        self.with_initialized(|p| {
            if p.service.is_some() {
                return Err(anyhow::anyhow!("Service already created"));
            }
            p.service = Some(service.clone());
            Ok(LocalCharacteristic {
                handle: CHARACTERISTIC_HANDLE,
            })
        })
    }

    fn set_advertising_data(&self, advertising: &[u8], scan_response: &[u8]) -> anyhow::Result<()> {
        self.with_initialized(|p| {
            p.advertising_data = advertising.to_vec();
            p.scan_response = scan_response.to_vec();
            Ok(())
        })
    }

    fn start_advertising(&self) -> anyhow::Result<()> {
        self.with_initialized(|p| {
            if p.fail_advertising {
                return Err(anyhow::anyhow!("Advertising start failed"));
            }
            p.advertising = true;
            Ok(())
        })
    }

    fn stop_advertising(&self) -> anyhow::Result<()> {
        self.with(|p| {
            p.advertising = false;
            Ok(())
        })
    }

    fn notify(&self, characteristic: &LocalCharacteristic, value: &[u8]) -> anyhow::Result<()> {
        if characteristic.handle != CHARACTERISTIC_HANDLE {
            return Err(anyhow::anyhow!(
                "Unknown characteristic handle {}",
                characteristic.handle
            ));
        }

        let subscribers: Vec<NotifyHandler> = {
            let mut air = self.air.air()?;
            let peripheral = air
                .peripherals
                .get_mut(&self.address)
                .ok_or_else(|| anyhow::anyhow!("No simulated peripheral at {}", self.address))?;
            peripheral.value = value.to_vec();

            air.links
                .iter()
                .filter(|l| l.peripheral == self.address)
                .filter_map(|l| {
                    air.centrals
                        .get(&l.central)
                        .and_then(|c| c.notify.get(&l.client.0).cloned())
                })
                .collect()
        };

        for subscriber in subscribers {
            subscriber(value);
        }
        Ok(())
    }
}

pub struct SimCentral {
    air: SimAir,
    address: BdAddr,
}

impl SimCentral {
    fn initialized(&self, air: &Air) -> anyhow::Result<()> {
        match air.centrals.get(&self.address) {
            Some(c) if c.initialized => Ok(()),
            _ => Err(anyhow::anyhow!("Radio is not initialized")),
        }
    }

    fn service_of(&self, air: &Air, client: ClientHandle) -> Option<ServiceConfig> {
        let link = air.link_of(self.address, client)?;
        air.peripherals.get(&link.peripheral)?.service.clone()
    }
}

impl Radio for SimCentral {
    fn init(&self, _device_name: &str) -> anyhow::Result<()> {
        self.air.air()?.centrals.entry(self.address).or_default().initialized = true;
        Ok(())
    }

    fn deinit(&self) -> anyhow::Result<()> {
        let pending = {
            let mut air = self.air.air()?;
            air.centrals.insert(self.address, Central::default());

            air.drop_links_of(
                self.address,
                DisconnectReason::LOCAL_HOST_TERMINATED,
                DisconnectReason::REMOTE_USER_TERMINATED,
            )
        };

        raise(pending);
        Ok(())
    }

    fn subscribe(&self, callback: EventCallback) -> anyhow::Result<()> {
        self.air
            .air()?
            .centrals
            .entry(self.address)
            .or_default()
            .events = Some(Arc::from(callback));
        Ok(())
    }
}

impl CentralRadio for SimCentral {
    fn scan(&self, params: &ScanParams) -> anyhow::Result<Vec<Advertisement>> {
        let (reports, events) = {
            let air = self.air.air()?;
            self.initialized(&air)?;

            let mut reports: Vec<Advertisement> = air
                .peripherals
                .iter()
                .filter(|(_, p)| p.advertising)
                .map(|(address, p)| Advertisement {
                    address: *address,
                    rssi: SIM_RSSI,
                    data: p.advertising_data.clone(),
                    scan_response: if params.active {
                        p.scan_response.clone()
                    } else {
                        Vec::new()
                    },
                })
                .collect();
            // HashMap order is arbitrary, scans report in address order
            reports.sort_by_key(|r| r.address.0);
            reports.extend(air.beacons.iter().cloned());

            (reports, air.central_events(self.address))
        };

        if let Some(events) = events {
            for report in &reports {
                events(RadioEvent::AdvertisementFound(report.clone()));
            }
        }

        Ok(reports)
    }

    fn create_client(&self) -> anyhow::Result<ClientHandle> {
        let mut air = self.air.air()?;
        self.initialized(&air)?;

        let client = ClientHandle(air.next_client);
        air.next_client = air.next_client.wrapping_add(1);
        Ok(client)
    }

    fn connect(&self, client: ClientHandle, target: &BdAddr) -> anyhow::Result<ConnHandle> {
        let (conn, pending) = {
            let mut air = self.air.air()?;
            self.initialized(&air)?;

            let peripheral = air
                .peripherals
                .get_mut(target)
                .filter(|p| p.advertising)
                .ok_or_else(|| anyhow::anyhow!("No connectable device at {}", target))?;
            peripheral.advertising = false;

            let conn = ConnHandle(air.next_conn);
            air.next_conn = air.next_conn.wrapping_add(1);
            air.links.push(Link {
                conn,
                central: self.address,
                client,
                peripheral: *target,
            });

            let mut pending = Vec::new();
            if let Some(events) = air.peripheral_events(*target) {
                pending.push((
                    events,
                    RadioEvent::Connected {
                        conn,
                        peer: self.address,
                    },
                ));
            }
            if let Some(events) = air.central_events(self.address) {
                pending.push((
                    events,
                    RadioEvent::Connected {
                        conn,
                        peer: *target,
                    },
                ));
            }

            (conn, pending)
        };

        raise(pending);
        Ok(conn)
    }

    fn disconnect(&self, client: ClientHandle) -> anyhow::Result<()> {
        let pending = {
            let mut air = self.air.air()?;
            let Some(link) = air.link_of(self.address, client) else {
                return Ok(());
            };
            air.remove_link(link.conn);
            if let Some(central) = air.centrals.get_mut(&self.address) {
                central.notify.remove(&client.0);
            }

            air.link_down(
                &link,
                DisconnectReason::LOCAL_HOST_TERMINATED,
                DisconnectReason::REMOTE_USER_TERMINATED,
            )
        };

        raise(pending);
        Ok(())
    }

    fn get_service(&self, client: ClientHandle, uuid: &Uuid) -> Option<RemoteService> {
        let air = self.air.air().ok()?;
        let service = self.service_of(&air, client)?;

        (service.uuid == *uuid).then_some(RemoteService {
            client,
            handle: SERVICE_HANDLE,
        })
    }

    fn get_characteristic(
        &self,
        service: &RemoteService,
        uuid: &Uuid,
    ) -> Option<RemoteCharacteristic> {
        let air = self.air.air().ok()?;
        let config = self.service_of(&air, service.client)?.characteristic;

        (config.uuid == *uuid).then_some(RemoteCharacteristic {
            client: service.client,
            handle: CHARACTERISTIC_HANDLE,
            properties: config.properties(),
        })
    }

    fn subscribe_notifications(
        &self,
        characteristic: &RemoteCharacteristic,
        callback: NotifyCallback,
    ) -> anyhow::Result<()> {
        if !characteristic.can_notify() {
            return Err(anyhow::anyhow!("Characteristic does not support notify"));
        }

        let mut air = self.air.air()?;
        air.link_of(self.address, characteristic.client)
            .ok_or_else(|| anyhow::anyhow!("Not connected"))?;
        air.centrals
            .entry(self.address)
            .or_default()
            .notify
            .insert(characteristic.client.0, Arc::from(callback));

        Ok(())
    }

    fn write_characteristic(
        &self,
        characteristic: &RemoteCharacteristic,
        value: &[u8],
        with_response: bool,
    ) -> anyhow::Result<()> {
        let required = if with_response {
            Property::Write
        } else {
            Property::WriteNoResponse
        };
        if !characteristic.properties.contains(required) {
            return Err(anyhow::anyhow!("Characteristic does not allow {:?}", required));
        }

        let pending = {
            let mut air = self.air.air()?;
            let link = air
                .link_of(self.address, characteristic.client)
                .ok_or_else(|| anyhow::anyhow!("Not connected"))?;

            let peripheral = air
                .peripherals
                .get_mut(&link.peripheral)
                .ok_or_else(|| anyhow::anyhow!("Peer {} is gone", link.peripheral))?;

            let max_len = peripheral
                .service
                .as_ref()
                .map(|s| s.characteristic.value_max_len)
                .unwrap_or(0);
            if value.len() > max_len {
                return Err(anyhow::anyhow!(
                    "Write of {} bytes exceeds {} byte characteristic",
                    value.len(),
                    max_len
                ));
            }
            peripheral.value = value.to_vec();

            peripheral.events.clone().map(|events| {
                (
                    events,
                    RadioEvent::CharacteristicWritten {
                        conn: link.conn,
                        handle: characteristic.handle,
                        value: value.to_vec(),
                    },
                )
            })
        };

        raise(pending.into_iter().collect());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::config::MIDI_SERVICE_UUID;

    const PIANO: BdAddr = BdAddr::from_bytes([0x24, 0x0a, 0xc4, 0x00, 0x00, 0x01]);
    const HOST: BdAddr = BdAddr::from_bytes([0x24, 0x0a, 0xc4, 0x00, 0x00, 0x02]);

    fn advertising_peripheral(air: &SimAir) -> SimPeripheral {
        let peripheral = air.peripheral(PIANO).unwrap();
        peripheral.init("Piano").unwrap();
        peripheral.create_service(&ServiceConfig::midi()).unwrap();
        peripheral.set_advertising_data(&[0x02, 0x01, 0x06], &[]).unwrap();
        peripheral.start_advertising().unwrap();
        peripheral
    }

    #[test]
    fn uninitialized_central_cannot_scan() {
        let air = SimAir::new();
        let central = air.central(HOST).unwrap();
        assert!(central.scan(&ScanParams::default()).is_err());
    }

    #[test]
    fn scan_reports_advertisers_and_beacons() {
        let air = SimAir::new();
        advertising_peripheral(&air);
        air.add_beacon(Advertisement {
            address: BdAddr::from_bytes([9; 6]),
            rssi: -90,
            data: vec![],
            scan_response: vec![],
        })
        .unwrap();

        let central = air.central(HOST).unwrap();
        central.init("Host").unwrap();
        let reports = central.scan(&ScanParams::default()).unwrap();

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].address, PIANO);
    }

    #[test]
    fn connect_stops_advertising_and_resolves_service() {
        let air = SimAir::new();
        advertising_peripheral(&air);
        let central = air.central(HOST).unwrap();
        central.init("Host").unwrap();

        let client = central.create_client().unwrap();
        central.connect(client, &PIANO).unwrap();
        assert!(!air.is_advertising(PIANO));

        let service = central.get_service(client, &MIDI_SERVICE_UUID).unwrap();
        let characteristic = central
            .get_characteristic(&service, &crate::config::MIDI_CHARACTERISTIC_UUID)
            .unwrap();
        assert!(characteristic.can_notify());

        // A second central finds nothing to connect to
        let other = air.central(BdAddr::from_bytes([7; 6])).unwrap();
        other.init("Other").unwrap();
        let client = other.create_client().unwrap();
        assert!(other.connect(client, &PIANO).is_err());
    }

    #[test]
    fn notify_reaches_subscribed_central() {
        let air = SimAir::new();
        let peripheral = advertising_peripheral(&air);
        let central = air.central(HOST).unwrap();
        central.init("Host").unwrap();

        let client = central.create_client().unwrap();
        central.connect(client, &PIANO).unwrap();
        let service = central.get_service(client, &MIDI_SERVICE_UUID).unwrap();
        let characteristic = central
            .get_characteristic(&service, &crate::config::MIDI_CHARACTERISTIC_UUID)
            .unwrap();

        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();
        central
            .subscribe_notifications(
                &characteristic,
                Box::new(move |bytes| {
                    counter.fetch_add(bytes.len(), Ordering::SeqCst);
                }),
            )
            .unwrap();

        peripheral
            .notify(
                &LocalCharacteristic {
                    handle: CHARACTERISTIC_HANDLE,
                },
                &[0x80, 0x80, 0x90, 0x3c, 0x7f],
            )
            .unwrap();
        assert_eq!(received.load(Ordering::SeqCst), 5);
        assert_eq!(
            air.characteristic_value(PIANO),
            Some(vec![0x80, 0x80, 0x90, 0x3c, 0x7f])
        );
    }

    #[test]
    fn drop_link_tells_both_sides() {
        let air = SimAir::new();
        let peripheral = advertising_peripheral(&air);
        let central = air.central(HOST).unwrap();
        central.init("Host").unwrap();

        let events = Arc::new(AtomicUsize::new(0));
        let counter = events.clone();
        peripheral
            .subscribe(Box::new(move |event| {
                if matches!(event, RadioEvent::Disconnected { .. }) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }))
            .unwrap();
        let counter = events.clone();
        central
            .subscribe(Box::new(move |event| {
                if matches!(event, RadioEvent::Disconnected { .. }) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }))
            .unwrap();

        let client = central.create_client().unwrap();
        let conn = central.connect(client, &PIANO).unwrap();

        assert!(air
            .drop_link(conn, DisconnectReason::CONNECTION_TIMEOUT)
            .unwrap());
        assert!(!air
            .drop_link(conn, DisconnectReason::CONNECTION_TIMEOUT)
            .unwrap());
        assert_eq!(events.load(Ordering::SeqCst), 2);
        assert!(air.connections().is_empty());
    }
}
