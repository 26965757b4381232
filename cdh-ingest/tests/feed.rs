use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cdh_core::{ConnectionState, Cursor, EventId, FeedStatus, RawEvent};
use cdh_ingest::{
    ChannelSink, ClientError, ConfigError, EventSink, FeedClient, FeedConfig, MemoryCursorStore,
    SinkError, StallAction, StallPolicy,
};
use cdh_tls::TlsConfig;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::{
    AUTHORIZATION, HeaderName, SEC_WEBSOCKET_PROTOCOL,
};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

const WAIT: Duration = Duration::from_secs(5);

/// What the mock feed does after answering a request.
#[derive(Clone, Copy)]
enum After {
    Stay,
    /// Drop the TCP connection without a closing handshake.
    Drop,
    /// Close the websocket cleanly.
    Close,
    /// Send a ping and stay connected.
    Ping,
}

struct Reply {
    frames: Vec<String>,
    after: After,
}

#[derive(Debug)]
enum Seen {
    Handshake {
        connection: usize,
        authorization: Option<String>,
        protocol: Option<String>,
    },
    Request {
        connection: usize,
        request: Value,
    },
    Closed {
        connection: usize,
        code: Option<CloseCode>,
    },
    Ping {
        connection: usize,
    },
    Pong {
        connection: usize,
        payload: Vec<u8>,
    },
}

/// Minimal stand-in for the vendor feed. Answers each request with the next
/// scripted reply and reports everything it sees.
struct MockFeed {
    addr: SocketAddr,
    seen: mpsc::UnboundedReceiver<Seen>,
}

impl MockFeed {
    async fn spawn(replies: Vec<Reply>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, seen) = mpsc::unbounded_channel();
        let replies = Arc::new(Mutex::new(VecDeque::from(replies)));

        tokio::spawn(async move {
            let mut connection = 0;
            while let Ok((stream, _)) = listener.accept().await {
                connection += 1;
                tokio::spawn(serve(stream, connection, replies.clone(), tx.clone()));
            }
        });

        Self { addr, seen }
    }

    fn config(&self) -> FeedConfig {
        FeedConfig {
            url: format!("ws://{}/cdh", self.addr),
            username: "svc".into(),
            password: "secret".into(),
            initial_poll_delay_ms: 10,
            poll_interval_secs: 1,
            reconnect_base_secs: 1,
            reconnect_cap_secs: 2,
            max_event_count: 100,
            ..FeedConfig::default()
        }
    }

    async fn next(&mut self) -> Seen {
        timeout(WAIT, self.seen.recv())
            .await
            .expect("mock feed saw nothing in time")
            .expect("mock feed stopped")
    }

    async fn next_request(&mut self) -> (usize, Value) {
        loop {
            if let Seen::Request {
                connection,
                request,
            } = self.next().await
            {
                return (connection, request);
            }
        }
    }

    async fn next_close(&mut self) -> (usize, Option<CloseCode>) {
        loop {
            if let Seen::Closed { connection, code } = self.next().await {
                return (connection, code);
            }
        }
    }

    /// Collects whatever arrives within `window`.
    async fn drain_for(&mut self, window: Duration) -> Vec<Seen> {
        let mut seen = Vec::new();
        while let Ok(Some(item)) = timeout(window, self.seen.recv()).await {
            seen.push(item);
        }
        seen
    }
}

async fn serve(
    stream: TcpStream,
    connection: usize,
    replies: Arc<Mutex<VecDeque<Reply>>>,
    tx: mpsc::UnboundedSender<Seen>,
) {
    let handshake_tx = tx.clone();
    let callback = move |request: &Request, mut response: Response| {
        let header = |name: HeaderName| {
            request
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };
        let authorization = header(AUTHORIZATION);
        let protocol = header(SEC_WEBSOCKET_PROTOCOL);

        if let Some(value) = request.headers().get(SEC_WEBSOCKET_PROTOCOL) {
            response
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, value.clone());
        }
        let _ = handshake_tx.send(Seen::Handshake {
            connection,
            authorization,
            protocol,
        });
        Ok::<_, ErrorResponse>(response)
    };

    let Ok(mut ws) = accept_hdr_async(stream, callback).await else {
        return;
    };

    while let Some(Ok(message)) = ws.next().await {
        match message {
            Message::Text(text) => {
                let request = serde_json::from_str(text.as_str()).unwrap();
                let _ = tx.send(Seen::Request {
                    connection,
                    request,
                });

                let reply = replies.lock().unwrap().pop_front();
                let Some(reply) = reply else { continue };
                for frame in reply.frames {
                    if ws.send(Message::Text(frame.into())).await.is_err() {
                        return;
                    }
                }
                match reply.after {
                    After::Stay => {}
                    After::Drop => return,
                    After::Close => {
                        let _ = ws.close(None).await;
                    }
                    After::Ping => {
                        if ws.send(Message::Ping(b"cdh".to_vec().into())).await.is_err() {
                            return;
                        }
                    }
                }
            }
            Message::Ping(_) => {
                let _ = tx.send(Seen::Ping { connection });
            }
            Message::Pong(payload) => {
                let _ = tx.send(Seen::Pong {
                    connection,
                    payload: payload.to_vec(),
                });
            }
            Message::Close(frame) => {
                let _ = tx.send(Seen::Closed {
                    connection,
                    code: frame.map(|f| f.code),
                });
                break;
            }
            _ => {}
        }
    }
}

fn event(id: &str, sequence: u64) -> String {
    json!({
        "Event": {
            "MessageData": { "MsgID": id, "EventDtm": "2024-05-01T10:00:00Z" },
            "DeviceData": { "DeviceID": "DEV-1", "BatteryVoltage": 8.1 }
        },
        "Sequence": sequence
    })
    .to_string()
}

fn reply(frames: Vec<String>, after: After) -> Reply {
    Reply { frames, after }
}

async fn wait_for<F>(client: &FeedClient<MemoryCursorStore>, mut done: F) -> FeedStatus
where
    F: FnMut(&FeedStatus) -> bool,
{
    let poll = async {
        loop {
            let status = client.status().await;
            if done(&status) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    timeout(WAIT, poll).await.expect("condition not reached in time")
}

async fn recv(events: &mut mpsc::Receiver<RawEvent>) -> RawEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("no event in time")
        .expect("sink closed")
}

#[tokio::test]
async fn cold_start_sends_credentials_and_no_resume_point() {
    let mut feed = MockFeed::spawn(vec![reply(vec![event("E1", 1)], After::Stay)]).await;
    let store = MemoryCursorStore::default();
    let client = FeedClient::new(feed.config(), &TlsConfig::default(), store.clone()).unwrap();
    let (tx, mut events) = mpsc::channel(16);

    client.start(ChannelSink(tx)).await.unwrap();

    let Seen::Handshake {
        authorization,
        protocol,
        ..
    } = feed.next().await
    else {
        panic!("expected a handshake first");
    };
    assert_eq!(authorization.as_deref(), Some("Basic c3ZjOnNlY3JldA=="));
    assert_eq!(protocol.as_deref(), Some("cdh.orbcomm.com"));

    let (_, request) = feed.next_request().await;
    assert_eq!(
        request,
        json!({ "GetEvents": { "EventType": "all", "EventPartition": 1, "MaxEventCount": 100 } })
    );

    assert_eq!(recv(&mut events).await.event_id, Some(EventId::from("E1")));

    let status = wait_for(&client, |s| s.total_events_received == 1).await;
    assert!(status.connected);
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.last_event_id, Some(EventId::from("E1")));
    assert_eq!(status.device_count, 1);

    let device = client.device(&"DEV-1".into()).await.unwrap();
    assert_eq!(device.battery_pct, Some(100.0));

    client.stop().await.unwrap();

    let saved = store.current().unwrap();
    assert_eq!(saved.last_event_id, Some(EventId::from("E1")));
    assert_eq!(saved.total_events_received, 1);
}

#[tokio::test]
async fn resumes_after_stored_cursor() {
    let mut feed = MockFeed::spawn(vec![]).await;
    let store = MemoryCursorStore::with_cursor(Cursor {
        last_event_id: Some(EventId::from("E41")),
        event_sequence: 41,
        total_events_received: 41,
        ..Cursor::default()
    });
    let client = FeedClient::new(feed.config(), &TlsConfig::default(), store).unwrap();
    let (tx, _events) = mpsc::channel(16);

    client.start(ChannelSink(tx)).await.unwrap();

    let (_, request) = feed.next_request().await;
    assert_eq!(request["GetEvents"]["PrecedingEventID"], "E41");

    let status = client.status().await;
    assert_eq!(status.total_events_received, 41);
    assert_eq!(status.event_sequence, 41);

    client.stop().await.unwrap();
}

#[tokio::test]
async fn dropped_connection_reconnects_without_redelivery() {
    let mut feed = MockFeed::spawn(vec![
        reply(vec![event("E1", 1), event("E2", 2)], After::Drop),
        reply(vec![event("E2", 2), event("E3", 3)], After::Stay),
    ])
    .await;
    let client =
        FeedClient::new(feed.config(), &TlsConfig::default(), MemoryCursorStore::default())
            .unwrap();
    let (tx, mut events) = mpsc::channel(16);

    client.start(ChannelSink(tx)).await.unwrap();

    let (first, _) = feed.next_request().await;
    let (second, request) = feed.next_request().await;
    assert_ne!(first, second);
    assert_eq!(request["GetEvents"]["PrecedingEventID"], "E2");

    let mut delivered = Vec::new();
    for _ in 0..3 {
        delivered.push(recv(&mut events).await.event_id.unwrap());
    }
    assert_eq!(
        delivered,
        vec![EventId::from("E1"), EventId::from("E2"), EventId::from("E3")]
    );

    let status = wait_for(&client, |s| s.duplicates_skipped == 1).await;
    assert_eq!(status.total_events_received, 3);
    assert_eq!(status.event_sequence, 3);
    assert_eq!(status.reconnect_attempts, 0);
    assert!(status.connected);

    client.stop().await.unwrap();
}

#[tokio::test]
async fn server_close_also_reconnects() {
    let mut feed = MockFeed::spawn(vec![reply(vec![event("E1", 1)], After::Close)]).await;
    let client =
        FeedClient::new(feed.config(), &TlsConfig::default(), MemoryCursorStore::default())
            .unwrap();
    let (tx, _events) = mpsc::channel(16);

    client.start(ChannelSink(tx)).await.unwrap();

    let (first, _) = feed.next_request().await;
    let (second, request) = feed.next_request().await;
    assert_eq!(first + 1, second);
    assert_eq!(request["GetEvents"]["PrecedingEventID"], "E1");

    client.stop().await.unwrap();
}

#[tokio::test]
async fn stop_closes_normally_and_never_reconnects() {
    let mut feed = MockFeed::spawn(vec![]).await;
    let client =
        FeedClient::new(feed.config(), &TlsConfig::default(), MemoryCursorStore::default())
            .unwrap();
    let (tx, _events) = mpsc::channel(16);

    client.start(ChannelSink(tx.clone())).await.unwrap();
    feed.next_request().await;

    client.stop().await.unwrap();
    client.stop().await.unwrap();

    assert_eq!(feed.next_close().await.1, Some(CloseCode::Normal));
    assert_eq!(client.status().await.state, ConnectionState::Stopped);

    let later = feed.drain_for(Duration::from_millis(1500)).await;
    assert!(
        !later.iter().any(|s| matches!(s, Seen::Handshake { .. })),
        "client reconnected after stop: {later:?}"
    );

    assert!(matches!(
        client.start(ChannelSink(tx)).await,
        Err(ClientError::Stopped)
    ));
}

#[tokio::test]
async fn response_in_progress_is_not_retried() {
    let fault = json!({ "faults": [{ "fault": { "faultCode": 2006, "faultText": "Response in progress" } }] });
    let mut feed = MockFeed::spawn(vec![reply(vec![fault.to_string()], After::Stay)]).await;
    let config = FeedConfig {
        stall: StallPolicy {
            max_skipped_polls: None,
            ..StallPolicy::default()
        },
        ..feed.config()
    };
    let client =
        FeedClient::new(config, &TlsConfig::default(), MemoryCursorStore::default()).unwrap();
    let (tx, _events) = mpsc::channel(16);

    client.start(ChannelSink(tx)).await.unwrap();
    feed.next_request().await;

    let later = feed.drain_for(Duration::from_millis(2500)).await;
    assert!(
        !later.iter().any(|s| matches!(s, Seen::Request { .. })),
        "request was retried: {later:?}"
    );

    let status = client.status().await;
    assert_eq!(status.faults, 0);
    assert!(status.connected);

    client.stop().await.unwrap();
}

#[tokio::test]
async fn other_fault_lets_the_next_poll_through() {
    let fault = json!({ "faults": [{ "fault": { "faultCode": 2002, "faultText": "Preceding event not found" } }] });
    let mut feed = MockFeed::spawn(vec![reply(vec![fault.to_string()], After::Stay)]).await;
    let client =
        FeedClient::new(feed.config(), &TlsConfig::default(), MemoryCursorStore::default())
            .unwrap();
    let (tx, _events) = mpsc::channel(16);

    client.start(ChannelSink(tx)).await.unwrap();

    let (first, _) = feed.next_request().await;
    let (second, _) = feed.next_request().await;
    assert_eq!(first, second);

    assert_eq!(client.status().await.faults, 1);

    client.stop().await.unwrap();
}

#[tokio::test]
async fn gives_up_after_max_attempts() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let config = FeedConfig {
        url: format!("ws://{addr}/cdh"),
        reconnect_base_secs: 1,
        max_reconnect_attempts: 1,
        ..FeedConfig::default()
    };
    let client =
        FeedClient::new(config, &TlsConfig::default(), MemoryCursorStore::default()).unwrap();
    let (tx, _events) = mpsc::channel(16);

    client.start(ChannelSink(tx)).await.unwrap();

    let status = wait_for(&client, |s| s.state == ConnectionState::Failed).await;
    assert!(!status.connected);
    assert_eq!(status.reconnect_attempts, 1);
    assert_eq!(status.errors, 2);

    client.stop().await.unwrap();
    assert_eq!(client.status().await.state, ConnectionState::Stopped);
}

#[tokio::test]
async fn sends_heartbeat_pings() {
    let mut feed = MockFeed::spawn(vec![]).await;
    let config = FeedConfig {
        heartbeat_interval_secs: 1,
        ..feed.config()
    };
    let client =
        FeedClient::new(config, &TlsConfig::default(), MemoryCursorStore::default()).unwrap();
    let (tx, _events) = mpsc::channel(16);

    client.start(ChannelSink(tx)).await.unwrap();

    let connection = loop {
        if let Seen::Ping { connection } = feed.next().await {
            break connection;
        }
    };
    assert_eq!(connection, 1);
    assert!(client.status().await.connected);

    client.stop().await.unwrap();
}

#[tokio::test]
async fn answers_feed_ping_with_pong() {
    let mut feed = MockFeed::spawn(vec![reply(vec![event("E1", 1)], After::Ping)]).await;
    let client =
        FeedClient::new(feed.config(), &TlsConfig::default(), MemoryCursorStore::default())
            .unwrap();
    let (tx, _events) = mpsc::channel(16);

    client.start(ChannelSink(tx)).await.unwrap();

    let (connection, payload) = loop {
        if let Seen::Pong {
            connection,
            payload,
        } = feed.next().await
        {
            break (connection, payload);
        }
    };
    assert_eq!(connection, 1);
    assert_eq!(payload, b"cdh");
    assert!(client.status().await.connected);

    client.stop().await.unwrap();
}

#[tokio::test]
async fn request_timeout_frees_the_slot_for_the_next_poll() {
    let mut feed = MockFeed::spawn(vec![]).await;
    let config = FeedConfig {
        request_timeout_secs: 1,
        stall: StallPolicy {
            max_skipped_polls: None,
            ..StallPolicy::default()
        },
        ..feed.config()
    };
    let client =
        FeedClient::new(config, &TlsConfig::default(), MemoryCursorStore::default()).unwrap();
    let (tx, _events) = mpsc::channel(16);

    client.start(ChannelSink(tx)).await.unwrap();

    let (first, _) = feed.next_request().await;
    let (second, _) = feed.next_request().await;
    assert_eq!(first, second);

    let status = client.status().await;
    assert!(status.connected);
    assert_eq!(status.reconnect_attempts, 0);

    client.stop().await.unwrap();
}

#[tokio::test]
async fn stalled_feed_is_reconnected() {
    let mut feed = MockFeed::spawn(vec![]).await;
    let config = FeedConfig {
        request_timeout_secs: 30,
        stall: StallPolicy {
            max_skipped_polls: Some(2),
            action: StallAction::Reconnect,
        },
        ..feed.config()
    };
    let client =
        FeedClient::new(config, &TlsConfig::default(), MemoryCursorStore::default()).unwrap();
    let (tx, _events) = mpsc::channel(16);

    client.start(ChannelSink(tx)).await.unwrap();

    let (first, _) = feed.next_request().await;
    assert_eq!(feed.next_close().await, (first, Some(CloseCode::Normal)));

    let (second, _) = feed.next_request().await;
    assert_eq!(second, first + 1);

    client.stop().await.unwrap();
}

struct Picky(mpsc::Sender<EventId>);

#[async_trait]
impl EventSink for Picky {
    async fn on_event(&mut self, event: RawEvent) -> Result<(), SinkError> {
        let id = event.event_id.unwrap_or_else(|| EventId::from("?"));
        if id.as_str() == "BAD" {
            panic!("sink cannot handle {id}");
        }
        self.0
            .send(id)
            .await
            .map_err(|_| SinkError::msg("receiver dropped"))
    }
}

#[tokio::test]
async fn panicking_sink_does_not_lose_later_events() {
    let mut feed = MockFeed::spawn(vec![reply(
        vec![event("E1", 1), event("BAD", 2), event("E2", 3), event("E3", 4)],
        After::Stay,
    )])
    .await;
    let client =
        FeedClient::new(feed.config(), &TlsConfig::default(), MemoryCursorStore::default())
            .unwrap();
    let (tx, mut delivered) = mpsc::channel(16);

    client.start(Picky(tx)).await.unwrap();
    feed.next_request().await;

    let mut ids = Vec::new();
    for _ in 0..3 {
        let id = timeout(WAIT, delivered.recv()).await.unwrap().unwrap();
        ids.push(id);
    }
    assert_eq!(
        ids,
        vec![EventId::from("E1"), EventId::from("E2"), EventId::from("E3")]
    );

    let status = wait_for(&client, |s| s.sink_errors == 1).await;
    assert_eq!(status.total_events_received, 4);
    assert_eq!(status.errors, 0);

    client.stop().await.unwrap();
}

#[test]
fn invalid_config_is_rejected_up_front() {
    let config = FeedConfig {
        dedup_capacity: 10,
        dedup_retain: 10,
        ..FeedConfig::default()
    };
    let result = FeedClient::new(config, &TlsConfig::default(), MemoryCursorStore::default());
    assert!(matches!(
        result,
        Err(ClientError::Config(ConfigError::DedupBounds {
            retain: 10,
            capacity: 10
        }))
    ));

    let config = FeedConfig {
        poll_interval_secs: 0,
        ..FeedConfig::default()
    };
    let result = FeedClient::new(config, &TlsConfig::default(), MemoryCursorStore::default());
    assert!(matches!(
        result,
        Err(ClientError::Config(ConfigError::Zero("poll_interval_secs")))
    ));
}
