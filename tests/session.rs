use saber_link::domain::command::{Command, Verb, WifiSettings};
use saber_link::domain::error::{CodecError, SessionError, TransportError};
use saber_link::domain::models::{DeviceHandle, Response, SaberEntry, SessionEvent};
use saber_link::domain::state::SessionState;
use saber_link::infrastructure::bluetooth::protocol::{REQUEST_CHAR, RESPONSE_CHAR};
use saber_link::infrastructure::bluetooth::simulated::{Reply, SimulatedPeripheral, DEMO_ADDRESS};
use saber_link::infrastructure::bluetooth::{spawn_session, SessionConfig, SessionHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

fn device() -> DeviceHandle {
    DeviceHandle::new(DEMO_ADDRESS)
}

fn peripheral() -> SimulatedPeripheral {
    SimulatedPeripheral::new().with_device(DEMO_ADDRESS)
}

async fn connected(
    peripheral: &SimulatedPeripheral,
    config: SessionConfig,
) -> (SessionHandle, UnboundedReceiver<SessionEvent>) {
    let (session, events) = spawn_session(Arc::new(peripheral.clone()), config);
    session.connect(device()).await.unwrap();
    (session, events)
}

fn drain_states(events: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionState> {
    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::StateChanged(state) = event {
            states.push(state);
        }
    }
    states
}

async fn next_matching(
    events: &mut UnboundedReceiver<SessionEvent>,
    matches: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("session events ended");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not seen")
}

async fn wait_until_pending(session: &SessionHandle) {
    session
        .watch()
        .wait_for(|s| s.pending.is_some())
        .await
        .unwrap();
}

fn send_in_background(
    session: &SessionHandle,
    command: Command,
) -> tokio::task::JoinHandle<Result<Response, SessionError>> {
    let session = session.clone();
    tokio::spawn(async move { session.send_command(command).await })
}

#[tokio::test]
async fn test_connect_walks_through_discovery_to_ready() {
    let peripheral = peripheral();
    let (session, mut events) = connected(&peripheral, SessionConfig::default()).await;

    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.device(), Some(device()));
    assert_eq!(
        drain_states(&mut events),
        vec![
            SessionState::Connecting,
            SessionState::Discovering,
            SessionState::Ready
        ]
    );
    assert_eq!(peripheral.active_subscribers(), 1);
}

#[tokio::test]
async fn test_get_sabers_with_empty_list() {
    let peripheral = peripheral().on_command(Verb::GetSabers, Reply::Notify(b"[]".to_vec()));
    let (session, mut events) = connected(&peripheral, SessionConfig::default()).await;

    let response = session.send_command(Command::get_sabers()).await.unwrap();

    assert_eq!(response, Response::Sabers(Vec::new()));
    assert_eq!(peripheral.written(), vec!["get_sabers"]);
    assert_eq!(session.pending_request(), None);
    assert_eq!(session.state(), SessionState::Ready);

    let event = next_matching(&mut events, |e| matches!(e, SessionEvent::CommandResult(_))).await;
    assert!(matches!(event, SessionEvent::CommandResult(Ok(Response::Sabers(ref s))) if s.is_empty()));
}

#[tokio::test]
async fn test_get_sabers_lists_addresses() {
    let peripheral = peripheral().on_command(
        Verb::GetSabers,
        Reply::Notify(br#"["192.168.1.40","192.168.1.41"]"#.to_vec()),
    );
    let (session, _events) = connected(&peripheral, SessionConfig::default()).await;

    let response = session.send_command(Command::get_sabers()).await.unwrap();

    assert_eq!(
        response.sabers(),
        Some(
            &[
                SaberEntry {
                    address: "192.168.1.40".to_string()
                },
                SaberEntry {
                    address: "192.168.1.41".to_string()
                },
            ][..]
        )
    );
}

#[tokio::test]
async fn test_save_settings_wire_format() {
    let peripheral = peripheral().on_command(Verb::SaveSettings, Reply::Notify(b"ok".to_vec()));
    let (session, _events) = connected(&peripheral, SessionConfig::default()).await;
    let wifi = WifiSettings {
        ssid: "home".to_string(),
        pass: "secret".to_string(),
        universe: "1".to_string(),
        max_channels: "512".to_string(),
    };

    let response = session
        .send_command(Command::save_settings(&wifi))
        .await
        .unwrap();

    assert_eq!(response, Response::Ack);
    assert_eq!(
        peripheral.written(),
        vec!["save_settings:ssid=homepass=secretuniverse=1max_channels=512;"]
    );
}

#[tokio::test]
async fn test_second_command_while_pending_is_busy() {
    let peripheral = peripheral().on_command(Verb::GetSabers, Reply::Silent);
    let (session, _events) = connected(&peripheral, SessionConfig::default()).await;

    let first = send_in_background(&session, Command::get_sabers());
    wait_until_pending(&session).await;

    let second = session.send_command(Command::get_sabers()).await;
    assert_eq!(second, Err(SessionError::Busy));
    assert_eq!(session.pending_request(), Some(Verb::GetSabers));
    assert_eq!(peripheral.written().len(), 1);

    assert_eq!(peripheral.push_notification(b"[]"), 1);
    assert_eq!(first.await.unwrap(), Ok(Response::Sabers(Vec::new())));
    assert_eq!(session.pending_request(), None);
}

#[tokio::test]
async fn test_malformed_saber_list_is_protocol_error() {
    let peripheral = peripheral().on_command(Verb::GetSabers, Reply::Notify(b"[1, 2".to_vec()));
    let (session, _events) = connected(&peripheral, SessionConfig::default()).await;

    let result = session.send_command(Command::get_sabers()).await;

    assert!(matches!(
        result,
        Err(SessionError::Protocol(CodecError::MalformedList(_)))
    ));
    assert_eq!(session.pending_request(), None);
    assert_eq!(session.state(), SessionState::Ready);
}

#[tokio::test]
async fn test_non_utf8_reply_is_protocol_error() {
    let peripheral = peripheral().on_command(Verb::SaveSettings, Reply::Notify(vec![b'o', 0xFF]));
    let (session, _events) = connected(&peripheral, SessionConfig::default()).await;

    let result = session
        .send_command(Command::save_settings(&WifiSettings::default()))
        .await;

    assert_eq!(
        result,
        Err(SessionError::Protocol(CodecError::InvalidUtf8 { valid_up_to: 1 }))
    );
    assert_eq!(session.pending_request(), None);
    assert_eq!(session.state(), SessionState::Ready);

    // The session stays usable after a bad reply
    peripheral.clone().on_command(Verb::SaveSettings, Reply::Notify(b"ok".to_vec()));
    assert_eq!(
        session
            .send_command(Command::save_settings(&WifiSettings::default()))
            .await,
        Ok(Response::Ack)
    );
}

#[tokio::test(start_paused = true)]
async fn test_silent_controller_times_out() {
    let peripheral = peripheral().on_command(Verb::GetSabers, Reply::Silent);
    let (session, mut events) = connected(&peripheral, SessionConfig::default()).await;

    let result = session.send_command(Command::get_sabers()).await;

    assert_eq!(result, Err(SessionError::Timeout(Duration::from_secs(5))));
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.pending_request(), None);

    // A reply arriving after the deadline is no longer correlated
    while events.try_recv().is_ok() {}
    peripheral.push_notification(b"[]");
    let event = events.recv().await.unwrap();
    assert!(matches!(event, SessionEvent::UnsolicitedData(ref d) if d == b"[]"));
}

#[tokio::test(start_paused = true)]
async fn test_response_timeout_follows_config() {
    let peripheral = peripheral().on_command(
        Verb::GetSabers,
        Reply::NotifyAfter(Duration::from_millis(800), b"[]".to_vec()),
    );
    let config = SessionConfig {
        response_timeout: Duration::from_millis(500),
        ..SessionConfig::default()
    };
    let (session, _events) = connected(&peripheral, config).await;

    let result = session.send_command(Command::get_sabers()).await;
    assert_eq!(result, Err(SessionError::Timeout(Duration::from_millis(500))));
}

#[tokio::test]
async fn test_disconnect_cancels_pending_command() {
    let peripheral = peripheral().on_command(Verb::GetSabers, Reply::Silent);
    let (session, _events) = connected(&peripheral, SessionConfig::default()).await;

    let pending = send_in_background(&session, Command::get_sabers());
    wait_until_pending(&session).await;

    session.disconnect().await;

    assert_eq!(pending.await.unwrap(), Err(SessionError::Cancelled));
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(session.pending_request(), None);
    assert!(!peripheral.is_connected());
    assert_eq!(peripheral.active_subscribers(), 0);
}

#[tokio::test]
async fn test_disconnect_twice_is_harmless() {
    let peripheral = peripheral();
    let (session, mut events) = connected(&peripheral, SessionConfig::default()).await;
    drain_states(&mut events);

    session.disconnect().await;
    session.disconnect().await;

    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(
        drain_states(&mut events),
        vec![SessionState::Disconnecting, SessionState::Closed]
    );
}

#[tokio::test]
async fn test_notification_without_request_is_unsolicited() {
    let peripheral = peripheral();
    let (session, mut events) = connected(&peripheral, SessionConfig::default()).await;

    assert_eq!(peripheral.push_notification(b"saber:on"), 1);

    let event = next_matching(&mut events, |e| matches!(e, SessionEvent::UnsolicitedData(_))).await;
    assert!(matches!(event, SessionEvent::UnsolicitedData(ref d) if d == b"saber:on"));
    assert_eq!(session.state(), SessionState::Ready);
}

#[tokio::test]
async fn test_send_before_connect_is_not_ready() {
    let (session, _events) = spawn_session(Arc::new(peripheral()), SessionConfig::default());

    let result = session.send_command(Command::get_sabers()).await;

    assert_eq!(result, Err(SessionError::NotReady(SessionState::Idle)));
}

#[tokio::test]
async fn test_send_after_close_is_not_ready() {
    let peripheral = peripheral();
    let (session, _events) = connected(&peripheral, SessionConfig::default()).await;
    session.disconnect().await;

    let result = session.send_command(Command::get_sabers()).await;

    assert_eq!(result, Err(SessionError::NotReady(SessionState::Closed)));
    assert!(peripheral.written().is_empty());
}

#[tokio::test]
async fn test_connect_twice_is_invalid() {
    let peripheral = peripheral();
    let (session, _events) = connected(&peripheral, SessionConfig::default()).await;

    let result = session.connect(device()).await;

    assert_eq!(
        result,
        Err(SessionError::InvalidTransition {
            from: SessionState::Ready,
            to: SessionState::Connecting,
        })
    );
    assert_eq!(session.state(), SessionState::Ready);
}

#[tokio::test]
async fn test_unknown_device_fails_session() {
    let (session, _events) = spawn_session(Arc::new(SimulatedPeripheral::new()), SessionConfig::default());

    let result = session.connect(device()).await;

    assert_eq!(
        result,
        Err(SessionError::Connection(TransportError::Unreachable(
            DEMO_ADDRESS.to_string()
        )))
    );
    assert_eq!(session.state(), SessionState::Failed);
}

#[tokio::test]
async fn test_missing_response_characteristic_fails_discovery() {
    let peripheral = peripheral().with_characteristics(vec![REQUEST_CHAR]);
    let (session, mut events) = spawn_session(Arc::new(peripheral.clone()), SessionConfig::default());

    let result = session.connect(device()).await;

    assert_eq!(
        result,
        Err(SessionError::Discovery(TransportError::CharacteristicNotFound(
            RESPONSE_CHAR
        )))
    );
    assert_eq!(session.state(), SessionState::Failed);
    assert!(!peripheral.is_connected());
    assert_eq!(
        drain_states(&mut events),
        vec![
            SessionState::Connecting,
            SessionState::Discovering,
            SessionState::Failed
        ]
    );
}

#[tokio::test]
async fn test_subscribe_failure_fails_session() {
    let denied = TransportError::Subscription("access denied".to_string());
    let peripheral = peripheral().with_subscribe_error(denied.clone());
    let (session, _events) = spawn_session(Arc::new(peripheral.clone()), SessionConfig::default());

    let result = session.connect(device()).await;

    assert_eq!(result, Err(SessionError::Connection(denied)));
    assert_eq!(session.state(), SessionState::Failed);
    assert!(!peripheral.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout() {
    let peripheral = peripheral().with_connect_delay(Duration::from_secs(60));
    let (session, _events) = spawn_session(Arc::new(peripheral), SessionConfig::default());

    let result = session.connect(device()).await;

    assert_eq!(
        result,
        Err(SessionError::Connection(TransportError::Timeout {
            operation: "connect"
        }))
    );
    assert_eq!(session.state(), SessionState::Failed);
}

#[tokio::test]
async fn test_disconnect_while_connecting() {
    let peripheral = peripheral().with_connect_delay(Duration::from_secs(30));
    let (session, _events) = spawn_session(Arc::new(peripheral.clone()), SessionConfig::default());

    let connecting = {
        let session = session.clone();
        tokio::spawn(async move { session.connect(device()).await })
    };
    session
        .watch()
        .wait_for(|s| s.state == SessionState::Connecting)
        .await
        .unwrap();

    session.disconnect().await;

    assert_eq!(connecting.await.unwrap(), Err(SessionError::Cancelled));
    assert_eq!(session.state(), SessionState::Closed);
    assert!(!peripheral.is_connected());
}

#[tokio::test]
async fn test_link_loss_fails_pending_command() {
    let peripheral = peripheral().on_command(Verb::GetSabers, Reply::Silent);
    let (session, _events) = connected(&peripheral, SessionConfig::default()).await;

    let pending = send_in_background(&session, Command::get_sabers());
    wait_until_pending(&session).await;

    peripheral.drop_link();

    assert_eq!(
        pending.await.unwrap(),
        Err(SessionError::Connection(TransportError::LinkLost))
    );
    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(
        session.send_command(Command::get_sabers()).await,
        Err(SessionError::NotReady(SessionState::Failed))
    );
}

#[tokio::test]
async fn test_transient_write_error_keeps_session() {
    let peripheral = peripheral().on_command(Verb::GetSabers, Reply::Notify(b"[]".to_vec()));
    let (session, _events) = connected(&peripheral, SessionConfig::default()).await;
    peripheral.fail_next_write(TransportError::GattBusy);

    let first = session.send_command(Command::get_sabers()).await;
    assert_eq!(first, Err(SessionError::Write(TransportError::GattBusy)));
    assert_eq!(session.state(), SessionState::Ready);

    let second = session.send_command(Command::get_sabers()).await;
    assert_eq!(second, Ok(Response::Sabers(Vec::new())));
}

#[tokio::test]
async fn test_write_link_loss_fails_session() {
    let peripheral = peripheral();
    let (session, _events) = connected(&peripheral, SessionConfig::default()).await;
    peripheral.fail_next_write(TransportError::LinkLost);

    let result = session.send_command(Command::get_sabers()).await;

    assert_eq!(result, Err(SessionError::Write(TransportError::LinkLost)));
    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(session.pending_request(), None);
}

#[tokio::test]
async fn test_read_after_notify_uses_characteristic_value() {
    let peripheral = peripheral().on_command(Verb::GetSabers, Reply::Silent);
    let config = SessionConfig {
        read_response_after_notify: true,
        ..SessionConfig::default()
    };
    let (session, _events) = connected(&peripheral, config).await;

    let pending = send_in_background(&session, Command::get_sabers());
    wait_until_pending(&session).await;

    peripheral.set_value(RESPONSE_CHAR, br#"["10.0.0.7"]"#);
    peripheral.push_notification(b"!");

    assert_eq!(
        pending.await.unwrap(),
        Ok(Response::Sabers(vec![SaberEntry {
            address: "10.0.0.7".to_string()
        }]))
    );
}

#[tokio::test]
async fn test_abandoned_request_frees_the_session() {
    let peripheral = peripheral().on_command(Verb::GetSabers, Reply::Silent);
    let (session, _events) = connected(&peripheral, SessionConfig::default()).await;

    let pending = send_in_background(&session, Command::get_sabers());
    wait_until_pending(&session).await;
    pending.abort();

    session
        .watch()
        .wait_for(|s| s.pending.is_none() && s.state == SessionState::Ready)
        .await
        .unwrap();

    peripheral.clone().on_command(Verb::GetSabers, Reply::Notify(b"[]".to_vec()));
    assert_eq!(
        session.send_command(Command::get_sabers()).await,
        Ok(Response::Sabers(Vec::new()))
    );
}

#[tokio::test]
async fn test_dropping_every_handle_disconnects() {
    let peripheral = peripheral();
    let (session, mut events) = connected(&peripheral, SessionConfig::default()).await;
    let clone = session.clone();

    drop(session);
    assert!(peripheral.is_connected());
    drop(clone);

    next_matching(&mut events, |e| {
        matches!(e, SessionEvent::StateChanged(SessionState::Closed))
    })
    .await;
    assert!(!peripheral.is_connected());
    assert_eq!(peripheral.active_subscribers(), 0);
}

#[tokio::test]
async fn test_demo_controller_round_trip() {
    let peripheral = SimulatedPeripheral::demo();
    let (session, _events) = connected(&peripheral, SessionConfig::default()).await;

    let sabers = session.send_command(Command::get_sabers()).await.unwrap();
    assert_eq!(sabers.sabers().map(|s| s.len()), Some(2));

    let saved = session
        .send_command(Command::save_settings(&WifiSettings::default()))
        .await
        .unwrap();
    assert_eq!(saved, Response::Ack);

    session.disconnect().await;
    assert_eq!(
        peripheral.written(),
        vec!["get_sabers", "save_settings:ssid=pass=universe=max_channels=;"]
    );
}

#[tokio::test]
async fn test_requests_during_teardown_are_answered_at_once() {
    let peripheral = peripheral().with_disconnect_delay(Duration::from_secs(30));
    let config = SessionConfig {
        connect_timeout: Duration::from_secs(2),
        ..SessionConfig::default()
    };
    let (session, _events) = connected(&peripheral, config).await;

    let closing = {
        let session = session.clone();
        tokio::spawn(async move { session.disconnect().await })
    };
    session
        .watch()
        .wait_for(|s| s.state == SessionState::Disconnecting)
        .await
        .unwrap();

    let result = timeout(
        Duration::from_secs(1),
        session.send_command(Command::get_sabers()),
    )
    .await
    .expect("send_command waited for teardown");
    assert_eq!(result, Err(SessionError::NotReady(SessionState::Disconnecting)));

    // A second disconnect returns once the session is closed
    timeout(Duration::from_secs(5), session.disconnect())
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Closed);
    closing.await.unwrap();
}
