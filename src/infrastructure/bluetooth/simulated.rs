//! Simulated Saber Controller
//!
//! An in-memory peripheral that speaks the saber protocol. Used by the
//! test suite and by the `--simulate` command line mode.

use crate::domain::command::Verb;
use crate::domain::error::TransportError;
use crate::domain::models::DeviceHandle;
use crate::infrastructure::bluetooth::protocol::{REQUEST_CHAR, RESPONSE_CHAR};
use crate::infrastructure::bluetooth::transport::{CharacteristicSet, Subscription, Transport};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Address of the device provided by [`SimulatedPeripheral::demo`].
pub const DEMO_ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

/// How the peripheral answers a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Notify the value on the response characteristic right away
    Notify(Vec<u8>),
    /// Notify the value after a delay
    NotifyAfter(Duration, Vec<u8>),
    /// Accept the write and never answer
    Silent,
}

#[derive(Debug)]
pub struct SimulatedConnection {
    id: u64,
    address: String,
}

impl SimulatedConnection {
    pub fn address(&self) -> &str {
        &self.address
    }
}

struct PeripheralState {
    adapter_enabled: bool,
    devices: HashSet<String>,
    characteristics: Vec<Uuid>,
    replies: HashMap<Verb, Reply>,
    values: HashMap<Uuid, Vec<u8>>,
    connect_delay: Option<Duration>,
    disconnect_delay: Option<Duration>,
    next_write_error: Option<TransportError>,
    subscribe_error: Option<TransportError>,
    connection: Option<u64>,
    next_connection_id: u64,
    subscribers: Vec<(u64, mpsc::UnboundedSender<Vec<u8>>)>,
    writes: Vec<Vec<u8>>,
}

impl Default for PeripheralState {
    fn default() -> Self {
        Self {
            adapter_enabled: true,
            devices: HashSet::new(),
            characteristics: vec![REQUEST_CHAR, RESPONSE_CHAR],
            replies: HashMap::new(),
            values: HashMap::new(),
            connect_delay: None,
            disconnect_delay: None,
            next_write_error: None,
            subscribe_error: None,
            connection: None,
            next_connection_id: 1,
            subscribers: Vec::new(),
            writes: Vec::new(),
        }
    }
}

impl PeripheralState {
    fn check_connected(&self, connection: &SimulatedConnection) -> Result<(), TransportError> {
        if self.connection == Some(connection.id) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    fn check_characteristic(&self, characteristic: Uuid) -> Result<(), TransportError> {
        if self.characteristics.contains(&characteristic) {
            Ok(())
        } else {
            Err(TransportError::CharacteristicNotFound(characteristic))
        }
    }

    /// Notify subscribers of connection `id`. Returns how many received it.
    fn notify(&self, id: u64, value: &[u8]) -> usize {
        if self.connection != Some(id) {
            return 0;
        }
        self.subscribers
            .iter()
            .filter(|(conn, _)| *conn == id)
            .filter(|(_, sender)| sender.send(value.to_vec()).is_ok())
            .count()
    }

    /// Store a command reply on the response characteristic and notify it.
    fn answer(&mut self, id: u64, value: Vec<u8>) {
        if self.connection == Some(id) {
            self.notify(id, &value);
            self.values.insert(RESPONSE_CHAR, value);
        }
    }
}

/// Cloning yields another handle to the same peripheral.
#[derive(Clone, Default)]
pub struct SimulatedPeripheral {
    inner: Arc<Mutex<PeripheralState>>,
}

impl SimulatedPeripheral {
    pub fn new() -> Self {
        Self::default()
    }

    /// A controller at [`DEMO_ADDRESS`] that knows two sabers and accepts settings.
    pub fn demo() -> Self {
        Self::new()
            .with_device(DEMO_ADDRESS)
            .on_command(
                Verb::GetSabers,
                Reply::NotifyAfter(
                    Duration::from_millis(150),
                    br#"["192.168.1.40","192.168.1.41"]"#.to_vec(),
                ),
            )
            .on_command(
                Verb::SaveSettings,
                Reply::NotifyAfter(Duration::from_millis(150), b"ok".to_vec()),
            )
    }

    fn state(&self) -> MutexGuard<'_, PeripheralState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_device(self, address: &str) -> Self {
        self.state().devices.insert(address.to_string());
        self
    }

    pub fn with_characteristics(self, characteristics: Vec<Uuid>) -> Self {
        self.state().characteristics = characteristics;
        self
    }

    pub fn on_command(self, verb: Verb, reply: Reply) -> Self {
        self.state().replies.insert(verb, reply);
        self
    }

    pub fn with_connect_delay(self, delay: Duration) -> Self {
        self.state().connect_delay = Some(delay);
        self
    }

    /// Hold every disconnect for `delay` before closing the link.
    pub fn with_disconnect_delay(self, delay: Duration) -> Self {
        self.state().disconnect_delay = Some(delay);
        self
    }

    pub fn with_subscribe_error(self, error: TransportError) -> Self {
        self.state().subscribe_error = Some(error);
        self
    }

    pub fn set_adapter_enabled(&self, enabled: bool) {
        self.state().adapter_enabled = enabled;
    }

    /// Make the next write fail with `error`.
    pub fn fail_next_write(&self, error: TransportError) {
        self.state().next_write_error = Some(error);
    }

    /// Set the stored value of a characteristic without notifying it.
    pub fn set_value(&self, characteristic: Uuid, value: &[u8]) {
        self.state().values.insert(characteristic, value.to_vec());
    }

    /// Push a notification on the response characteristic without changing
    /// its stored value. Returns how many subscribers received it.
    pub fn push_notification(&self, value: &[u8]) -> usize {
        let state = self.state();
        match state.connection {
            Some(id) => state.notify(id, value),
            None => 0,
        }
    }

    /// Drop the radio link as if the device went out of range.
    pub fn drop_link(&self) {
        let mut state = self.state();
        info!("Simulated link loss");
        state.connection = None;
        state.subscribers.clear();
    }

    /// Text of every successful write, oldest first.
    pub fn written(&self) -> Vec<String> {
        self.state()
            .writes
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    pub fn is_connected(&self) -> bool {
        self.state().connection.is_some()
    }

    /// Subscriptions whose receiving side is still alive.
    pub fn active_subscribers(&self) -> usize {
        self.state()
            .subscribers
            .iter()
            .filter(|(_, sender)| !sender.is_closed())
            .count()
    }
}

fn verb_of(payload: &[u8]) -> Option<Verb> {
    let text = std::str::from_utf8(payload).ok()?;
    let verb = text.split(|c: char| c == ':' || c == ';').next()?;
    verb.parse().ok()
}

#[async_trait]
impl Transport for SimulatedPeripheral {
    type Connection = SimulatedConnection;

    async fn connect(&self, device: &DeviceHandle) -> Result<Self::Connection, TransportError> {
        let delay = self.state().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if !state.adapter_enabled {
            return Err(TransportError::AdapterUnavailable);
        }
        if !state.devices.contains(device.address()) {
            return Err(TransportError::Unreachable(device.address().to_string()));
        }

        let id = state.next_connection_id;
        state.next_connection_id += 1;
        state.connection = Some(id);
        debug!("Simulated connection {} to {}", id, device);

        Ok(SimulatedConnection {
            id,
            address: device.address().to_string(),
        })
    }

    async fn discover_services(
        &self,
        connection: &Self::Connection,
    ) -> Result<CharacteristicSet, TransportError> {
        let state = self.state();
        state.check_connected(connection)?;
        Ok(state.characteristics.iter().copied().collect())
    }

    async fn read(
        &self,
        connection: &Self::Connection,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, TransportError> {
        let state = self.state();
        state.check_connected(connection)?;
        state.check_characteristic(characteristic)?;
        Ok(state.values.get(&characteristic).cloned().unwrap_or_default())
    }

    async fn write(
        &self,
        connection: &Self::Connection,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let reply = {
            let mut state = self.state();
            state.check_connected(connection)?;
            state.check_characteristic(characteristic)?;
            if let Some(error) = state.next_write_error.take() {
                return Err(error);
            }
            state.writes.push(payload.to_vec());
            verb_of(payload).and_then(|verb| state.replies.get(&verb).cloned())
        };

        match reply {
            Some(Reply::Notify(value)) => self.state().answer(connection.id, value),
            Some(Reply::NotifyAfter(delay, value)) => {
                let peripheral = self.clone();
                let id = connection.id;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    peripheral.state().answer(id, value);
                });
            }
            Some(Reply::Silent) | None => {}
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        connection: &Self::Connection,
        characteristic: Uuid,
    ) -> Result<Subscription, TransportError> {
        let mut state = self.state();
        state.check_connected(connection)?;
        state.check_characteristic(characteristic)?;
        if let Some(error) = state.subscribe_error.clone() {
            return Err(error);
        }

        let (sender, subscription) = Subscription::channel(characteristic);
        state.subscribers.push((connection.id, sender));
        Ok(subscription)
    }

    async fn disconnect(&self, connection: &Self::Connection) -> Result<(), TransportError> {
        let delay = self.state().disconnect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.connection == Some(connection.id) {
            state.connection = None;
            debug!("Simulated connection {} closed", connection.id);
        }
        state.subscribers.retain(|(id, _)| *id != connection.id);
        Ok(())
    }
}
