//! Drives a `Device` against an in-process receiver speaking the Cast framing
//! over plain TCP.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use googlecast::protocol::{
    CastMessage, NS_CONNECTION, NS_HEARTBEAT, NS_MEDIA, NS_RECEIVER, RECEIVER_ID,
};
use googlecast::{
    AddressPolicy, CastConfig, CastError, Change, ConnectionState, Device, DeviceRecord, ErrorReceiver, Intent,
    StateReceiver, StateUpdate,
};
use prost::Message;
use serde_json::{json, Value};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

const SENDER: &str = "sender-test";
const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(200);

/// Message received by the mock
#[derive(Debug)]
struct Received {
    destination: String,
    namespace: String,
    payload: Value,
}

impl Received {
    fn kind(&self) -> &str {
        self.payload["type"].as_str().unwrap_or_default()
    }
}

/// What the test asks the mock to do
enum Outbound {
    Frame(Bytes),
    HangUp,
}

struct MockReceiver {
    port: u16,
    inbound: mpsc::UnboundedReceiver<Received>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl MockReceiver {
    /// Serve one sender connection at a time, accepting again after each ends
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();

        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let mut framed = Framed::new(socket, LengthDelimitedCodec::new());
                loop {
                    tokio::select! {
                        frame = framed.next() => match frame {
                            Some(Ok(frame)) => {
                                let message = CastMessage::decode(frame.as_ref()).unwrap();
                                let payload = serde_json::from_str(
                                    message.payload_utf8.as_deref().unwrap_or("null"),
                                )
                                .unwrap();
                                let _ = inbound_tx.send(Received {
                                    destination: message.destination_id,
                                    namespace: message.namespace,
                                    payload,
                                });
                            }
                            _ => break,
                        },
                        out = outbound_rx.recv() => match out {
                            Some(Outbound::Frame(frame)) => framed.send(frame).await.unwrap(),
                            Some(Outbound::HangUp) => break,
                            None => return,
                        },
                    }
                }
            }
        });

        Self {
            port,
            inbound,
            outbound,
        }
    }

    async fn next(&mut self) -> Received {
        timeout(WAIT, self.inbound.recv())
            .await
            .expect("receiver saw nothing")
            .expect("receiver stopped")
    }

    async fn expect(&mut self, namespace: &str, kind: &str) -> Received {
        let received = self.next().await;
        assert_eq!(received.namespace, namespace, "{received:?}");
        assert_eq!(received.kind(), kind, "{received:?}");
        received
    }

    async fn assert_quiet(&mut self) {
        if let Ok(Some(received)) = timeout(QUIET, self.inbound.recv()).await {
            panic!("unexpected message {received:?}");
        }
    }

    fn reply(&self, source: &str, destination: &str, namespace: &str, payload: Value) {
        let frame = CastMessage::text(source, destination, namespace, payload.to_string());
        self.send_raw(Bytes::from(frame.encode_to_vec()));
    }

    fn send_raw(&self, frame: Bytes) {
        self.outbound.send(Outbound::Frame(frame)).unwrap();
    }

    /// Drop the current connection; the next connect is accepted
    fn hang_up(&self) {
        self.outbound.send(Outbound::HangUp).unwrap();
    }
}

/// Accepts connections and never says anything
async fn silent_listener() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    port
}

fn config() -> CastConfig {
    CastConfig::default()
        .with_tls(false)
        .with_sender_id(SENDER)
        .with_heartbeat_interval(Duration::from_secs(60))
}

fn device_at(addresses: Vec<IpAddr>, port: u16, config: CastConfig) -> Device {
    let record = DeviceRecord {
        id: "abc123".to_string(),
        friendly_name: String::new(),
        addresses,
        port,
        ..Default::default()
    };
    Device::with_config(record, config).unwrap()
}

fn device(port: u16) -> Device {
    device_at(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)], port, config())
}

fn receiver_status(request_id: i64) -> Value {
    json!({
        "type": "RECEIVER_STATUS",
        "requestId": request_id,
        "status": {
            "applications": [{
                "appId": "CC1AD845",
                "displayName": "Default Media Receiver",
                "transportId": "web-5",
                "sessionId": "7c4f0b2e",
                "statusText": "Ready to cast"
            }],
            "volume": { "level": 0.25, "muted": false }
        }
    })
}

async fn next_state(rx: &mut StateReceiver) -> StateUpdate {
    timeout(WAIT, rx.recv()).await.expect("no state update").unwrap()
}

fn connection(state: ConnectionState) -> StateUpdate {
    StateUpdate::Connection {
        id: "abc123".to_string(),
        state,
    }
}

fn changed(change: Change) -> StateUpdate {
    StateUpdate::Changed {
        id: "abc123".to_string(),
        change,
    }
}

async fn connected() -> (MockReceiver, Device, StateReceiver, ErrorReceiver) {
    let mut receiver = MockReceiver::start().await;
    let device = device(receiver.port);
    let (states, mut state_rx) = StateReceiver::channel();
    let (errors, error_rx) = ErrorReceiver::channel();

    device
        .connect_with_timeout(Duration::from_secs(2), errors, states)
        .await
        .unwrap();

    let handshake = receiver.expect(NS_CONNECTION, "CONNECT").await;
    assert_eq!(handshake.destination, RECEIVER_ID);
    assert_eq!(next_state(&mut state_rx).await, connection(ConnectionState::Connecting));
    assert_eq!(next_state(&mut state_rx).await, connection(ConnectionState::Connected));

    (receiver, device, state_rx, error_rx)
}

#[tokio::test]
async fn status_is_requested_once_and_merged() {
    let (mut receiver, device, mut state_rx, _error_rx) = connected().await;
    assert_eq!(device.name(), "abc123");
    assert_eq!(device.state(), ConnectionState::Connected);
    assert_eq!(device.volume(), None);

    device.update_status().await.unwrap();
    device.update_status().await.unwrap();

    let request = receiver.expect(NS_RECEIVER, "GET_STATUS").await;
    receiver.assert_quiet().await;

    let request_id = request.payload["requestId"].as_i64().unwrap();
    receiver.reply(RECEIVER_ID, SENDER, NS_RECEIVER, receiver_status(request_id));

    assert_eq!(next_state(&mut state_rx).await, changed(Change::Volume));
    assert_eq!(next_state(&mut state_rx).await, changed(Change::App));
    assert_eq!(
        device.volume(),
        Some(googlecast::VolumeState { level: 0.25, muted: false })
    );
    assert_eq!(device.service(), "Default Media Receiver");

    // everything is known now
    device.update_status().await.unwrap();
    receiver.assert_quiet().await;

    // the same status again changes nothing
    receiver.reply(RECEIVER_ID, SENDER, NS_RECEIVER, receiver_status(0));
    receiver.reply(RECEIVER_ID, SENDER, NS_HEARTBEAT, json!({ "type": "PING" }));
    receiver.expect(NS_HEARTBEAT, "PONG").await;
    assert!(state_rx.try_recv().unwrap().is_none());
}

#[tokio::test]
async fn load_media_binds_before_loading() {
    let (mut receiver, device, mut state_rx, _error_rx) = connected().await;

    receiver.reply(RECEIVER_ID, SENDER, NS_RECEIVER, receiver_status(0));
    assert_eq!(next_state(&mut state_rx).await, changed(Change::Volume));
    assert_eq!(next_state(&mut state_rx).await, changed(Change::App));

    device
        .load_media("http://example.com/film.mp4", "video/mp4", true)
        .await
        .unwrap();

    let bind = receiver.expect(NS_CONNECTION, "CONNECT").await;
    assert_eq!(bind.destination, "web-5");

    let load = receiver.expect(NS_MEDIA, "LOAD").await;
    assert_eq!(load.destination, "web-5");
    assert_eq!(load.payload["autoplay"], true);
    assert_eq!(load.payload["media"]["contentId"], "http://example.com/film.mp4");
    assert_eq!(load.payload["media"]["contentType"], "video/mp4");

    let request_id = load.payload["requestId"].as_i64().unwrap();
    receiver.reply(
        "web-5",
        SENDER,
        NS_MEDIA,
        json!({
            "type": "MEDIA_STATUS",
            "requestId": request_id,
            "status": [{
                "mediaSessionId": 1,
                "playerState": "BUFFERING",
                "currentTime": 0.0,
                "media": { "contentId": "http://example.com/film.mp4" }
            }]
        }),
    );
    assert_eq!(next_state(&mut state_rx).await, changed(Change::Media));
    assert_eq!(device.media().unwrap().player_state, googlecast::PlayerState::Buffering);
}

#[tokio::test]
async fn volume_requests_are_clamped() {
    let (mut receiver, device, _state_rx, _error_rx) = connected().await;

    device.set_volume_level(-0.3).await.unwrap();
    device.set_volume_level(0.0).await.unwrap();
    device.set_volume_level(1.7).await.unwrap();
    device.set_muted(true).await.unwrap();

    let below = receiver.expect(NS_RECEIVER, "SET_VOLUME").await;
    let zero = receiver.expect(NS_RECEIVER, "SET_VOLUME").await;
    let above = receiver.expect(NS_RECEIVER, "SET_VOLUME").await;
    let mute = receiver.expect(NS_RECEIVER, "SET_VOLUME").await;

    assert_eq!(below.payload["volume"], zero.payload["volume"]);
    assert_eq!(zero.payload["volume"], json!({ "level": 0.0, "muted": true }));
    assert_eq!(above.payload["volume"], json!({ "level": 1.0, "muted": false }));
    assert_eq!(mute.payload["volume"], json!({ "muted": true }));
}

#[tokio::test]
async fn second_connect_is_out_of_order() {
    let (_receiver, device, _state_rx, _error_rx) = connected().await;
    let (states, _) = StateReceiver::channel();
    let (errors, _) = ErrorReceiver::channel();

    let result = device
        .connect_with_timeout(Duration::from_secs(2), errors, states)
        .await;
    assert!(matches!(result, Err(CastError::OutOfOrder(_))));
    assert_eq!(device.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn disconnect_closes_and_forgets() {
    let (mut receiver, device, mut state_rx, _error_rx) = connected().await;

    receiver.reply(RECEIVER_ID, SENDER, NS_RECEIVER, receiver_status(0));
    assert_eq!(next_state(&mut state_rx).await, changed(Change::Volume));
    assert_eq!(next_state(&mut state_rx).await, changed(Change::App));

    device.disconnect().await.unwrap();
    receiver.expect(NS_CONNECTION, "CLOSE").await;

    assert_eq!(device.state(), ConnectionState::Disconnected);
    assert_eq!(device.volume(), None);
    assert_eq!(device.app(), None);
    assert_eq!(next_state(&mut state_rx).await, connection(ConnectionState::Disconnected));

    // idempotent
    device.disconnect().await.unwrap();
    assert!(matches!(device.set_muted(false).await, Err(CastError::OutOfOrder(_))));
}

#[tokio::test]
async fn hang_up_is_reported() {
    let (receiver, device, mut state_rx, _error_rx) = connected().await;

    receiver.hang_up();
    assert_eq!(next_state(&mut state_rx).await, connection(ConnectionState::Disconnected));
    assert_eq!(device.state(), ConnectionState::Disconnected);
    assert!(matches!(device.launch_app("CC1AD845").await, Err(CastError::OutOfOrder(_))));

    device.disconnect().await.unwrap();
}

#[tokio::test]
async fn bad_frames_do_not_end_the_connection() {
    let (mut receiver, device, _state_rx, mut error_rx) = connected().await;

    receiver.send_raw(Bytes::from_static(&[0xff, 0xff, 0xff]));
    let error = timeout(WAIT, error_rx.recv()).await.unwrap().unwrap();
    assert_eq!(error.id, "abc123");
    assert!(error.error.is_decode());

    receiver.reply(RECEIVER_ID, SENDER, NS_HEARTBEAT, json!({ "type": "PING" }));
    receiver.expect(NS_HEARTBEAT, "PONG").await;
    assert_eq!(device.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn rejected_requests_surface_on_the_error_sink() {
    let (mut receiver, device, _state_rx, mut error_rx) = connected().await;

    device.launch_app("NOSUCHAPP").await.unwrap();
    let launch = receiver.expect(NS_RECEIVER, "LAUNCH").await;
    assert_eq!(launch.payload["appId"], "NOSUCHAPP");

    let request_id = launch.payload["requestId"].as_i64().unwrap();
    receiver.reply(
        RECEIVER_ID,
        SENDER,
        NS_RECEIVER,
        json!({ "type": "LAUNCH_ERROR", "requestId": request_id, "reason": "NOT_FOUND" }),
    );

    let error = timeout(WAIT, error_rx.recv()).await.unwrap().unwrap();
    match error.error {
        CastError::Receiver {
            request_id: id,
            intent,
            reason,
        } => {
            assert_eq!(id, request_id);
            assert_eq!(intent, Some(Intent::LaunchApp));
            assert_eq!(reason, "NOT_FOUND");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnects_as_soon_as_loss_is_reported() {
    let (mut receiver, device, mut state_rx, _error_rx) = connected().await;

    for _ in 0..50 {
        receiver.hang_up();
        assert_eq!(next_state(&mut state_rx).await, connection(ConnectionState::Disconnected));

        let (states, rx) = StateReceiver::channel();
        let (errors, _) = ErrorReceiver::channel();
        state_rx = rx;
        device
            .connect_with_timeout(Duration::from_secs(2), errors, states)
            .await
            .unwrap();

        receiver.expect(NS_CONNECTION, "CONNECT").await;
        assert_eq!(next_state(&mut state_rx).await, connection(ConnectionState::Connecting));
        assert_eq!(next_state(&mut state_rx).await, connection(ConnectionState::Connected));
        assert_eq!(device.state(), ConnectionState::Connected);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_status_callers_share_one_request() {
    let (mut receiver, device, _state_rx, _error_rx) = connected().await;
    let device = std::sync::Arc::new(device);

    let callers: Vec<_> = (0..8)
        .map(|_| {
            let device = device.clone();
            tokio::spawn(async move { device.update_status().await })
        })
        .collect();
    for caller in callers {
        caller.await.unwrap().unwrap();
    }

    receiver.expect(NS_RECEIVER, "GET_STATUS").await;
    receiver.assert_quiet().await;
}

#[tokio::test]
async fn ordered_policy_falls_back_to_the_next_address() {
    let mut receiver = MockReceiver::start().await;
    // nothing listens on 127.0.0.2, the mock is bound to 127.0.0.1 only
    let dead = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2));
    let device = device_at(
        vec![dead, IpAddr::V4(Ipv4Addr::LOCALHOST)],
        receiver.port,
        config(),
    );

    let (states, _state_rx) = StateReceiver::channel();
    let (errors, _error_rx) = ErrorReceiver::channel();
    let first = device
        .connect_with_policy(
            Duration::from_secs(2),
            AddressPolicy::First,
            errors.clone(),
            states.clone(),
        )
        .await;
    assert!(first.unwrap_err().is_transport());
    assert_eq!(device.state(), ConnectionState::Disconnected);

    device
        .connect_with_policy(Duration::from_secs(2), AddressPolicy::Ordered, errors, states)
        .await
        .unwrap();
    receiver.expect(NS_CONNECTION, "CONNECT").await;
    assert_eq!(device.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn stalled_handshake_times_out() {
    let port = silent_listener().await;
    let device = device_at(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)], port, config().with_tls(true));

    let (states, _state_rx) = StateReceiver::channel();
    let (errors, _error_rx) = ErrorReceiver::channel();
    let result = device
        .connect_with_timeout(Duration::from_millis(300), errors, states)
        .await;

    assert!(matches!(result, Err(CastError::Timeout(_))), "{result:?}");
    assert_eq!(device.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn cancelled_connect_returns_to_disconnected() {
    let port = silent_listener().await;
    let device = device_at(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)], port, config().with_tls(true));

    let (states, mut state_rx) = StateReceiver::channel();
    let (errors, _error_rx) = ErrorReceiver::channel();
    let cancelled = timeout(
        Duration::from_millis(200),
        device.connect_with_timeout(Duration::from_secs(30), errors, states),
    )
    .await;

    assert!(cancelled.is_err());
    assert_eq!(device.state(), ConnectionState::Disconnected);
    assert_eq!(next_state(&mut state_rx).await, connection(ConnectionState::Connecting));
    assert_eq!(next_state(&mut state_rx).await, connection(ConnectionState::Disconnected));

    // a fresh attempt is accepted and gives up on its own deadline
    let (states, _state_rx) = StateReceiver::channel();
    let (errors, _error_rx) = ErrorReceiver::channel();
    let result = device
        .connect_with_timeout(Duration::from_millis(200), errors, states)
        .await;
    assert!(matches!(result, Err(CastError::Timeout(_))), "{result:?}");
}

#[tokio::test]
async fn unbounded_timeout_connects() {
    let mut receiver = MockReceiver::start().await;
    let device = device(receiver.port);

    let (states, _state_rx) = StateReceiver::channel();
    let (errors, _error_rx) = ErrorReceiver::channel();
    device
        .connect_with_timeout(Duration::MAX, errors, states)
        .await
        .unwrap();

    receiver.expect(NS_CONNECTION, "CONNECT").await;
    assert_eq!(device.state(), ConnectionState::Connected);
}
