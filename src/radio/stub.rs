//! Scriptable radio that records every call, for unit tests.

use std::sync::{
    atomic::{AtomicBool, AtomicU16, Ordering},
    Mutex,
};

use enumset::EnumSet;
use uuid::Uuid;

use super::*;
use crate::config::{ScanParams, SecurityPolicy, TxPower};
use crate::gatts::service::ServiceConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Init(String),
    Deinit,
    Scan(ScanParams),
    CreateClient,
    Connect(BdAddr),
    Disconnect(ClientHandle),
    SubscribeNotifications(u16),
    Write { value: Vec<u8>, with_response: bool },
    SetTxPower(TxPower),
    SetSecurity(SecurityPolicy),
    CreateService(Uuid, Uuid, EnumSet<Property>),
    SetAdvertisingData { advertising: Vec<u8>, scan_response: Vec<u8> },
    StartAdvertising,
    StopAdvertising,
    Notify(Vec<u8>),
}

#[derive(Default)]
pub struct StubRadio {
    calls: Mutex<Vec<Call>>,
    events: Mutex<Option<EventCallback>>,
    notifications: Mutex<Option<NotifyCallback>>,
    last_conn: Mutex<Option<ConnHandle>>,
    next_conn: AtomicU16,

    pub scan_results: Mutex<Vec<Advertisement>>,
    pub fail_scan: AtomicBool,
    pub fail_connect: AtomicBool,
    pub fail_advertising: AtomicBool,
    pub missing_service: AtomicBool,
    pub missing_characteristic: AtomicBool,
    pub without_notify: AtomicBool,
    /// The link goes down while notifications are being enabled.
    pub drop_on_subscribe: AtomicBool,
}

impl StubRadio {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| matches(c)).count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Raises an event as the stack would, from the caller's thread.
    pub fn emit(&self, event: RadioEvent) {
        if let Some(callback) = self.events.lock().unwrap().as_ref() {
            callback(event);
        }
    }

    pub fn notify_central(&self, bytes: &[u8]) {
        if let Some(callback) = self.notifications.lock().unwrap().as_ref() {
            callback(bytes);
        }
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Radio for StubRadio {
    fn init(&self, device_name: &str) -> anyhow::Result<()> {
        self.record(Call::Init(device_name.to_string()));
        Ok(())
    }

    fn deinit(&self) -> anyhow::Result<()> {
        self.record(Call::Deinit);
        Ok(())
    }

    fn subscribe(&self, callback: EventCallback) -> anyhow::Result<()> {
        self.events.lock().unwrap().replace(callback);
        Ok(())
    }
}

impl CentralRadio for StubRadio {
    fn scan(&self, params: &ScanParams) -> anyhow::Result<Vec<Advertisement>> {
        self.record(Call::Scan(*params));
        if self.fail_scan.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("scan failed"));
        }
        Ok(self.scan_results.lock().unwrap().clone())
    }

    fn create_client(&self) -> anyhow::Result<ClientHandle> {
        self.record(Call::CreateClient);
        Ok(ClientHandle(1))
    }

    fn connect(&self, _client: ClientHandle, target: &BdAddr) -> anyhow::Result<ConnHandle> {
        self.record(Call::Connect(*target));
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("connection refused"));
        }

        let conn = ConnHandle(self.next_conn.fetch_add(1, Ordering::SeqCst));
        self.last_conn.lock().unwrap().replace(conn);
        self.emit(RadioEvent::Connected { conn, peer: *target });
        Ok(conn)
    }

    fn disconnect(&self, client: ClientHandle) -> anyhow::Result<()> {
        self.record(Call::Disconnect(client));
        let conn = self.last_conn.lock().unwrap().take();
        if let Some(conn) = conn {
            self.emit(RadioEvent::Disconnected {
                conn,
                reason: DisconnectReason::LOCAL_HOST_TERMINATED,
            });
        }
        Ok(())
    }

    fn get_service(&self, client: ClientHandle, _uuid: &Uuid) -> Option<RemoteService> {
        if self.missing_service.load(Ordering::SeqCst) {
            return None;
        }
        Some(RemoteService { client, handle: 1 })
    }

    fn get_characteristic(
        &self,
        service: &RemoteService,
        _uuid: &Uuid,
    ) -> Option<RemoteCharacteristic> {
        if self.missing_characteristic.load(Ordering::SeqCst) {
            return None;
        }

        let mut properties = Property::Read | Property::Write | Property::WriteNoResponse;
        if !self.without_notify.load(Ordering::SeqCst) {
            properties.insert(Property::Notify);
        }

        Some(RemoteCharacteristic {
            client: service.client,
            handle: 3,
            properties,
        })
    }

    fn subscribe_notifications(
        &self,
        characteristic: &RemoteCharacteristic,
        callback: NotifyCallback,
    ) -> anyhow::Result<()> {
        self.record(Call::SubscribeNotifications(characteristic.handle));
        self.notifications.lock().unwrap().replace(callback);

        if self.drop_on_subscribe.load(Ordering::SeqCst) {
            let conn = self.last_conn.lock().unwrap().take();
            if let Some(conn) = conn {
                self.emit(RadioEvent::Disconnected {
                    conn,
                    reason: DisconnectReason::CONNECTION_TIMEOUT,
                });
            }
        }
        Ok(())
    }

    fn write_characteristic(
        &self,
        _characteristic: &RemoteCharacteristic,
        value: &[u8],
        with_response: bool,
    ) -> anyhow::Result<()> {
        self.record(Call::Write {
            value: value.to_vec(),
            with_response,
        });
        Ok(())
    }
}

impl PeripheralRadio for StubRadio {
    fn set_tx_power(&self, power: TxPower) -> anyhow::Result<()> {
        self.record(Call::SetTxPower(power));
        Ok(())
    }

    fn set_security(&self, policy: &SecurityPolicy) -> anyhow::Result<()> {
        self.record(Call::SetSecurity(*policy));
        Ok(())
    }

    fn create_service(&self, service: &ServiceConfig) -> anyhow::Result<LocalCharacteristic> {
        self.record(Call::CreateService(
            service.uuid,
            service.characteristic.uuid,
            service.characteristic.properties(),
        ));
        Ok(LocalCharacteristic { handle: 42 })
    }

    fn set_advertising_data(
        &self,
        advertising: &[u8],
        scan_response: &[u8],
    ) -> anyhow::Result<()> {
        self.record(Call::SetAdvertisingData {
            advertising: advertising.to_vec(),
            scan_response: scan_response.to_vec(),
        });
        Ok(())
    }

    fn start_advertising(&self) -> anyhow::Result<()> {
        self.record(Call::StartAdvertising);
        if self.fail_advertising.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("controller rejected advertising parameters"));
        }
        Ok(())
    }

    fn stop_advertising(&self) -> anyhow::Result<()> {
        self.record(Call::StopAdvertising);
        Ok(())
    }

    fn notify(&self, _characteristic: &LocalCharacteristic, value: &[u8]) -> anyhow::Result<()> {
        self.record(Call::Notify(value.to_vec()));
        Ok(())
    }
}
