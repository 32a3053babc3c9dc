//! BLE Session Module
//!
//! One task per connection owns the state machine, the transport
//! connection, the response subscription and the single in-flight command.
//! Callers talk to it through [`SessionHandle`]; caller requests, transport
//! results and notifications are all serialized onto that task's loop.
//!
//! ```text
//!  SessionHandle ──requests──▶ ┌──────────────┐ ──write──▶ Transport
//!                              │ SessionActor │
//!  SessionEvent ◀──events───── └──────────────┘ ◀─notify── Subscription
//! ```

use crate::domain::command::{Command, Verb};
use crate::domain::error::{SessionError, TransportError};
use crate::domain::models::{DeviceHandle, MessageSeverity, Response, SessionEvent, StatusMessage};
use crate::domain::settings::BleSettings;
use crate::domain::state::{SessionState, StateMachine};
use crate::infrastructure::bluetooth::protocol::{self, REQUEST_CHAR, RESPONSE_CHAR};
use crate::infrastructure::bluetooth::transport::{Subscription, Transport};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const REQUEST_QUEUE_DEPTH: usize = 16;

/// Configuration for one session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Characteristic commands are written to
    pub request_characteristic: Uuid,
    /// Characteristic replies are notified on
    pub response_characteristic: Uuid,
    pub connect_timeout: Duration,
    pub discovery_timeout: Duration,
    /// Bound on the wait for a response after a successful write
    pub response_timeout: Duration,
    /// Read the response characteristic when a notification arrives instead
    /// of decoding the notification value
    pub read_response_after_notify: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let ble = BleSettings::default();
        Self {
            request_characteristic: REQUEST_CHAR,
            response_characteristic: RESPONSE_CHAR,
            connect_timeout: Duration::from_millis(ble.connect_timeout_ms),
            discovery_timeout: Duration::from_millis(ble.discovery_timeout_ms),
            response_timeout: Duration::from_millis(ble.response_timeout_ms),
            read_response_after_notify: ble.read_response_after_notify,
        }
    }
}

impl SessionConfig {
    pub fn from_settings(settings: &BleSettings) -> anyhow::Result<Self> {
        Ok(Self {
            request_characteristic: protocol::parse_uuid(&settings.request_char_uuid)?,
            response_characteristic: protocol::parse_uuid(&settings.response_char_uuid)?,
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            discovery_timeout: Duration::from_millis(settings.discovery_timeout_ms),
            response_timeout: Duration::from_millis(settings.response_timeout_ms),
            read_response_after_notify: settings.read_response_after_notify,
        })
    }
}

/// Observable view of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub device: Option<DeviceHandle>,
    /// Verb of the command awaiting its response
    pub pending: Option<Verb>,
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum SessionRequest {
    Connect {
        device: DeviceHandle,
        reply: Reply<()>,
    },
    Send {
        command: Command,
        reply: Reply<Response>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

/// Caller side of a session. Clones share the session; when the last
/// clone is dropped the session disconnects.
#[derive(Clone)]
pub struct SessionHandle {
    requests: mpsc::Sender<SessionRequest>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

/// Start a session task on the current tokio runtime.
pub fn spawn_session<T: Transport>(
    transport: Arc<T>,
    config: SessionConfig,
) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
    let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());

    let actor = SessionActor {
        transport,
        config,
        machine: StateMachine::new(),
        device: None,
        connection: None,
        subscription: None,
        pending: None,
        snapshot: snapshot_tx,
        events: event_tx,
    };
    tokio::spawn(actor.run(request_rx));

    (
        SessionHandle {
            requests: request_tx,
            snapshot: snapshot_rx,
        },
        event_rx,
    )
}

impl SessionHandle {
    /// Connect, discover and subscribe. Resolves once the session is
    /// `Ready` or has failed.
    pub async fn connect(&self, device: DeviceHandle) -> Result<(), SessionError> {
        let (reply, response) = oneshot::channel();
        if self
            .requests
            .send(SessionRequest::Connect { device, reply })
            .await
            .is_err()
        {
            return Err(SessionError::InvalidTransition {
                from: self.state(),
                to: SessionState::Connecting,
            });
        }
        response.await.unwrap_or(Err(SessionError::Cancelled))
    }

    /// Write `command` and wait for its response.
    pub async fn send_command(&self, command: Command) -> Result<Response, SessionError> {
        let (reply, response) = oneshot::channel();
        if self
            .requests
            .send(SessionRequest::Send { command, reply })
            .await
            .is_err()
        {
            return Err(SessionError::NotReady(self.state()));
        }
        response.await.unwrap_or(Err(SessionError::Cancelled))
    }

    /// Tear the session down. A pending command fails with `Cancelled`.
    /// Calling it on a closed session does nothing.
    pub async fn disconnect(&self) {
        let (reply, done) = oneshot::channel();
        if self
            .requests
            .send(SessionRequest::Disconnect { reply })
            .await
            .is_ok()
        {
            let _ = done.await;
        }
    }

    pub fn state(&self) -> SessionState {
        self.snapshot.borrow().state
    }

    pub fn pending_request(&self) -> Option<Verb> {
        self.snapshot.borrow().pending
    }

    pub fn device(&self) -> Option<DeviceHandle> {
        self.snapshot.borrow().device.clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }
}

struct PendingRequest {
    command: Command,
    reply: Reply<Response>,
    deadline: Instant,
}

enum PendingOutcome {
    TimedOut,
    /// The caller dropped its `send_command` future
    Abandoned,
}

/// Why a transport operation did not complete.
enum Interrupt {
    Disconnect(Option<oneshot::Sender<()>>),
    Transport(TransportError),
}

struct SessionActor<T: Transport> {
    transport: Arc<T>,
    config: SessionConfig,
    machine: StateMachine,
    device: Option<DeviceHandle>,
    connection: Option<T::Connection>,
    subscription: Option<Subscription>,
    pending: Option<PendingRequest>,
    snapshot: watch::Sender<SessionSnapshot>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl<T: Transport> SessionActor<T> {
    async fn run(mut self, mut requests: mpsc::Receiver<SessionRequest>) {
        while !self.machine.current().is_terminal() {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.handle_request(request, &mut requests).await,
                    None => {
                        debug!("All session handles dropped");
                        self.shutdown(None, &mut requests).await;
                    }
                },
                notification = next_notification(&mut self.subscription) => {
                    self.on_notification(notification, &mut requests).await;
                }
                outcome = watch_pending(&mut self.pending) => self.on_pending_outcome(outcome),
            }
        }

        requests.close();
        while let Ok(request) = requests.try_recv() {
            reject(request, self.machine.current(), &self.events);
        }
        debug!("Session task finished in state {}", self.machine.current());
    }

    async fn handle_request(
        &mut self,
        request: SessionRequest,
        requests: &mut mpsc::Receiver<SessionRequest>,
    ) {
        match request {
            SessionRequest::Connect { device, reply } => {
                let result = self.establish(device, requests).await;
                let _ = reply.send(result);
            }
            SessionRequest::Send { command, reply } => {
                self.start_command(command, reply, requests).await
            }
            SessionRequest::Disconnect { reply } => self.shutdown(Some(reply), requests).await,
        }
    }

    /// Idle -> Connecting -> Discovering -> Ready
    async fn establish(
        &mut self,
        device: DeviceHandle,
        requests: &mut mpsc::Receiver<SessionRequest>,
    ) -> Result<(), SessionError> {
        self.transition(SessionState::Connecting)?;
        self.device = Some(device.clone());
        self.publish();
        info!("Connecting to saber controller {}", device);
        self.send_status(format!("Connecting to {}...", device), MessageSeverity::Info);

        let transport = Arc::clone(&self.transport);

        let connection = match race(
            requests,
            &self.events,
            SessionState::Connecting,
            "connect",
            self.config.connect_timeout,
            transport.connect(&device),
        )
        .await
        {
            Ok(connection) => connection,
            Err(interrupt) => {
                return self
                    .interrupted(interrupt, None, SessionError::Connection, requests)
                    .await
            }
        };
        info!("Device connected: {}", device);
        self.transition(SessionState::Discovering)?;

        let characteristics = match race(
            requests,
            &self.events,
            SessionState::Discovering,
            "service discovery",
            self.config.discovery_timeout,
            transport.discover_services(&connection),
        )
        .await
        {
            Ok(characteristics) => characteristics,
            Err(interrupt) => {
                return self
                    .interrupted(interrupt, Some(connection), SessionError::Discovery, requests)
                    .await
            }
        };
        if characteristics.is_empty() {
            warn!("Device exposes no GATT characteristics");
        } else {
            info!("Found {} characteristics", characteristics.len());
        }

        let required = [
            self.config.request_characteristic,
            self.config.response_characteristic,
        ];
        if let Some(missing) = characteristics.first_missing(&required) {
            let interrupt = Interrupt::Transport(TransportError::CharacteristicNotFound(missing));
            return self
                .interrupted(interrupt, Some(connection), SessionError::Discovery, requests)
                .await;
        }

        let subscription = match race(
            requests,
            &self.events,
            SessionState::Discovering,
            "subscribe",
            self.config.discovery_timeout,
            transport.subscribe(&connection, self.config.response_characteristic),
        )
        .await
        {
            Ok(subscription) => subscription,
            Err(interrupt) => {
                return self
                    .interrupted(interrupt, Some(connection), SessionError::Connection, requests)
                    .await
            }
        };
        info!("Notifications enabled on {}", subscription.characteristic());
        self.send_status("Notifications enabled", MessageSeverity::Info);

        self.connection = Some(connection);
        self.subscription = Some(subscription);
        self.transition(SessionState::Ready)?;
        self.send_status("Connection established!", MessageSeverity::Success);
        Ok(())
    }

    /// Finish an `establish` step that did not complete.
    async fn interrupted(
        &mut self,
        interrupt: Interrupt,
        connection: Option<T::Connection>,
        wrap: fn(TransportError) -> SessionError,
        requests: &mut mpsc::Receiver<SessionRequest>,
    ) -> Result<(), SessionError> {
        if connection.is_some() {
            self.connection = connection;
        }
        match interrupt {
            Interrupt::Disconnect(reply) => {
                self.shutdown(reply, requests).await;
                Err(SessionError::Cancelled)
            }
            Interrupt::Transport(e) => Err(self.fail(wrap(e), requests).await),
        }
    }

    /// Ready -> Sending; the response is awaited by the main loop.
    async fn start_command(
        &mut self,
        command: Command,
        reply: Reply<Response>,
        requests: &mut mpsc::Receiver<SessionRequest>,
    ) {
        let state = self.machine.current();
        if self.pending.is_some() || state == SessionState::Sending {
            return self.resolve(reply, Err(SessionError::Busy));
        }
        if !state.accepts_commands() {
            return self.resolve(reply, Err(SessionError::NotReady(state)));
        }

        let payload = command.encode();
        debug!("Writing command: {}", payload);
        if let Err(e) = self.transition(SessionState::Sending) {
            return self.resolve(reply, Err(e));
        }

        let written = match self.connection.as_ref() {
            Some(connection) => {
                race(
                    requests,
                    &self.events,
                    SessionState::Sending,
                    "write",
                    self.config.response_timeout,
                    self.transport.write(
                        connection,
                        self.config.request_characteristic,
                        payload.as_bytes(),
                    ),
                )
                .await
            }
            None => Err(Interrupt::Transport(TransportError::NotConnected)),
        };

        match written {
            Ok(()) => {
                self.send_status("Data sent", MessageSeverity::Info);
                self.pending = Some(PendingRequest {
                    command,
                    reply,
                    deadline: Instant::now() + self.config.response_timeout,
                });
                self.publish();
            }
            Err(Interrupt::Disconnect(disconnect_reply)) => {
                self.resolve(reply, Err(SessionError::Cancelled));
                self.shutdown(disconnect_reply, requests).await;
            }
            Err(Interrupt::Transport(e)) if e.is_link_loss() => {
                let error = self.fail(SessionError::Write(e), requests).await;
                self.resolve(reply, Err(error));
            }
            Err(Interrupt::Transport(e)) => {
                warn!("Write of {} failed: {}", command.verb(), e);
                self.send_status("Data transfer failed", MessageSeverity::Error);
                let _ = self.transition(SessionState::Ready);
                self.resolve(reply, Err(SessionError::Write(e)));
            }
        }
    }

    async fn on_notification(
        &mut self,
        notification: Option<Vec<u8>>,
        requests: &mut mpsc::Receiver<SessionRequest>,
    ) {
        let Some(value) = notification else {
            warn!("Notification stream ended");
            self.fail(SessionError::Connection(TransportError::LinkLost), requests)
                .await;
            return;
        };
        debug!(
            "Notification ({} bytes): {}",
            value.len(),
            String::from_utf8_lossy(&value)
        );

        if self.pending.is_none() {
            let _ = self.events.send(SessionEvent::UnsolicitedData(value));
            return;
        }

        let payload = if self.config.read_response_after_notify {
            let read = match self.connection.as_ref() {
                Some(connection) => {
                    race(
                        requests,
                        &self.events,
                        SessionState::Sending,
                        "read",
                        self.config.response_timeout,
                        self.transport
                            .read(connection, self.config.response_characteristic),
                    )
                    .await
                }
                None => Err(Interrupt::Transport(TransportError::NotConnected)),
            };
            match read {
                Ok(payload) => Ok(payload),
                Err(Interrupt::Disconnect(reply)) => return self.shutdown(reply, requests).await,
                Err(Interrupt::Transport(e)) if e.is_link_loss() => {
                    self.fail(SessionError::Read(e), requests).await;
                    return;
                }
                Err(Interrupt::Transport(e)) => {
                    self.send_status("Reading data failed", MessageSeverity::Error);
                    Err(SessionError::Read(e))
                }
            }
        } else {
            Ok(value)
        };

        let Some(pending) = self.pending.take() else {
            return;
        };
        let _ = self.transition(SessionState::Ready);

        let verb = pending.command.verb();
        let result = payload.and_then(|payload| {
            pending
                .command
                .decode_response(&payload)
                .map_err(SessionError::from)
        });
        match &result {
            Ok(response) => info!("{} answered: {:?}", verb, response),
            Err(e) => warn!("{} failed: {}", verb, e),
        }
        self.resolve(pending.reply, result);
    }

    fn on_pending_outcome(&mut self, outcome: PendingOutcome) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let _ = self.transition(SessionState::Ready);
        let verb = pending.command.verb();

        match outcome {
            PendingOutcome::TimedOut => {
                warn!(
                    "No response to {} within {:?}",
                    verb, self.config.response_timeout
                );
                self.send_status(format!("No response to {}", verb), MessageSeverity::Warning);
                self.resolve(
                    pending.reply,
                    Err(SessionError::Timeout(self.config.response_timeout)),
                );
            }
            PendingOutcome::Abandoned => {
                debug!("Caller stopped waiting for {}", verb);
                let _ = self
                    .events
                    .send(SessionEvent::CommandResult(Err(SessionError::Cancelled)));
            }
        }
    }

    /// Any live state -> Disconnecting -> Closed
    async fn shutdown(
        &mut self,
        reply: Option<oneshot::Sender<()>>,
        requests: &mut mpsc::Receiver<SessionRequest>,
    ) {
        let mut waiting = Vec::new();
        if !self.machine.current().is_terminal() {
            let _ = self.transition(SessionState::Disconnecting);
            if let Some(pending) = self.pending.take() {
                self.publish();
                self.resolve(pending.reply, Err(SessionError::Cancelled));
            }
            waiting = self.release(requests).await;
            let _ = self.transition(SessionState::Closed);
            info!("Disconnected from device");
            self.send_status("Disconnected from device", MessageSeverity::Info);
        }
        for reply in reply.into_iter().chain(waiting) {
            let _ = reply.send(());
        }
    }

    /// Any live state -> Failed
    async fn fail(
        &mut self,
        error: SessionError,
        requests: &mut mpsc::Receiver<SessionRequest>,
    ) -> SessionError {
        error!("Session failed: {}", error);
        if let Some(pending) = self.pending.take() {
            self.publish();
            self.resolve(pending.reply, Err(error.clone()));
        }
        if let Err(e) = self.transition(SessionState::Failed) {
            debug!("Not entering Failed: {}", e);
        }
        let waiting = self.release(requests).await;
        self.send_status(format!("Connection error: {}", error), MessageSeverity::Error);
        for reply in waiting {
            let _ = reply.send(());
        }
        error
    }

    /// Cancel the subscription and close the transport connection.
    ///
    /// Requests arriving meanwhile are rejected for the current state;
    /// disconnect requests are returned so they can be answered once the
    /// session has settled.
    async fn release(
        &mut self,
        requests: &mut mpsc::Receiver<SessionRequest>,
    ) -> Vec<oneshot::Sender<()>> {
        self.subscription = None;
        let mut waiting = Vec::new();
        let Some(connection) = self.connection.take() else {
            return waiting;
        };

        let state = self.machine.current();
        let closing = timeout(
            self.config.connect_timeout,
            self.transport.disconnect(&connection),
        );
        tokio::pin!(closing);
        let mut open = true;

        let outcome = loop {
            tokio::select! {
                outcome = &mut closing => break outcome,
                request = requests.recv(), if open => match request {
                    Some(SessionRequest::Disconnect { reply }) => waiting.push(reply),
                    Some(request) => reject(request, state, &self.events),
                    None => open = false,
                },
            }
        };
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Transport disconnect failed: {}", e),
            Err(_) => warn!("Transport disconnect timed out"),
        }
        waiting
    }

    fn transition(&mut self, next: SessionState) -> Result<(), SessionError> {
        let previous = self.machine.transition(next)?;
        debug!("Session state {} -> {}", previous, next);
        self.publish();
        let _ = self.events.send(SessionEvent::StateChanged(next));
        Ok(())
    }

    fn publish(&self) {
        self.snapshot.send_replace(SessionSnapshot {
            state: self.machine.current(),
            device: self.device.clone(),
            pending: self.pending.as_ref().map(|p| p.command.verb()),
        });
    }

    fn resolve(&self, reply: Reply<Response>, result: Result<Response, SessionError>) {
        let _ = self
            .events
            .send(SessionEvent::CommandResult(result.clone()));
        let _ = reply.send(result);
    }

    fn send_status(&self, message: impl Into<String>, severity: MessageSeverity) {
        let _ = self.events.send(SessionEvent::Status(StatusMessage {
            message: message.into(),
            severity,
        }));
    }
}

async fn next_notification(subscription: &mut Option<Subscription>) -> Option<Vec<u8>> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}

async fn watch_pending(pending: &mut Option<PendingRequest>) -> PendingOutcome {
    match pending {
        Some(pending) => {
            let deadline = pending.deadline;
            tokio::select! {
                _ = sleep_until(deadline) => PendingOutcome::TimedOut,
                _ = pending.reply.closed() => PendingOutcome::Abandoned,
            }
        }
        None => std::future::pending().await,
    }
}

/// Run a transport operation while still answering requests: a disconnect
/// interrupts it, anything else is rejected for the current `state`.
async fn race<O>(
    requests: &mut mpsc::Receiver<SessionRequest>,
    events: &mpsc::UnboundedSender<SessionEvent>,
    state: SessionState,
    operation: &'static str,
    limit: Duration,
    work: impl Future<Output = Result<O, TransportError>>,
) -> Result<O, Interrupt> {
    let work = timeout(limit, work);
    tokio::pin!(work);

    loop {
        tokio::select! {
            outcome = &mut work => {
                return match outcome {
                    Ok(result) => result.map_err(Interrupt::Transport),
                    Err(_) => Err(Interrupt::Transport(TransportError::Timeout { operation })),
                };
            }
            request = requests.recv() => match request {
                Some(SessionRequest::Disconnect { reply }) => {
                    return Err(Interrupt::Disconnect(Some(reply)));
                }
                Some(request) => reject(request, state, events),
                None => return Err(Interrupt::Disconnect(None)),
            },
        }
    }
}

fn reject(
    request: SessionRequest,
    state: SessionState,
    events: &mpsc::UnboundedSender<SessionEvent>,
) {
    match request {
        SessionRequest::Connect { reply, .. } => {
            let _ = reply.send(Err(SessionError::InvalidTransition {
                from: state,
                to: SessionState::Connecting,
            }));
        }
        SessionRequest::Send { reply, .. } => {
            let error = if state == SessionState::Sending {
                SessionError::Busy
            } else {
                SessionError::NotReady(state)
            };
            let _ = events.send(SessionEvent::CommandResult(Err(error.clone())));
            let _ = reply.send(Err(error));
        }
        SessionRequest::Disconnect { reply } => {
            let _ = reply.send(());
        }
    }
}
