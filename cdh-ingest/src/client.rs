use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use cdh_core::{ConnectionState, Cursor, DeviceId, DeviceSnapshot, FeedStatus, RawEvent};
use cdh_tls::TlsConfig;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use jiff::Timestamp;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{
    AUTHORIZATION, HeaderValue, InvalidHeaderValue, SEC_WEBSOCKET_PROTOCOL,
};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{
    Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ConfigError, FeedConfig, StallAction};
use crate::poller::{Poller, Tick};
use crate::sink::{EventSink, run_sink};
use crate::state::{Handled, IngestState};
use crate::storage::CursorStore;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("client has been stopped and cannot be started again")]
    Stopped,
    #[error("invalid feed configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("cursor store error: {0}")]
    CursorStore(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
    #[error("tls error: {0}")]
    Tls(#[from] cdh_tls::TlsError),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("invalid header value: {0}")]
    Header(#[from] InvalidHeaderValue),
    #[error("handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),
}

impl ClientError {
    fn store<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        Self::CursorStore(Box::new(err))
    }
}

enum Lifecycle {
    Idle,
    Running(Tasks),
    Stopped,
}

struct Tasks {
    connection: JoinHandle<()>,
    writer: JoinHandle<()>,
    sink: JoinHandle<()>,
}

/// Resilient client for the vendor event feed.
///
/// Holds one websocket session at a time, polls it for events, and resumes
/// from the stored cursor after a restart. Owned by the caller, who decides
/// when to [`start`](Self::start) and [`stop`](Self::stop) it. Separate
/// instances share nothing.
pub struct FeedClient<S: CursorStore> {
    config: Arc<FeedConfig>,
    tls: Option<Arc<rustls::ClientConfig>>,
    store: Arc<S>,
    state: Arc<Mutex<IngestState>>,
    cancel: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
}

impl<S: CursorStore> FeedClient<S> {
    pub fn new(config: FeedConfig, tls: &TlsConfig, store: S) -> Result<Self, ClientError> {
        config.validate()?;
        let tls = cdh_tls::client_config(tls)?.map(Arc::new);
        let state = IngestState::new(&config, None);

        Ok(Self {
            config: Arc::new(config),
            tls,
            store: Arc::new(store),
            state: Arc::new(Mutex::new(state)),
            cancel: CancellationToken::new(),
            lifecycle: Mutex::new(Lifecycle::Idle),
        })
    }

    /// Loads the stored cursor and starts connecting. Does nothing if already
    /// running; fails once the client has been stopped.
    pub async fn start<K: EventSink>(&self, sink: K) -> Result<(), ClientError> {
        let mut lifecycle = self.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Running(_) => return Ok(()),
            Lifecycle::Stopped => return Err(ClientError::Stopped),
            Lifecycle::Idle => {}
        }

        let cursor = self.store.load().await.map_err(ClientError::store)?;
        match &cursor {
            Some(cursor) => info!(
                last_event_id = ?cursor.last_event_id,
                total_events_received = cursor.total_events_received,
                "Resuming from stored cursor"
            ),
            None => info!("No stored cursor, starting from the feed's default position"),
        }
        *self.state.lock().await = IngestState::new(&self.config, cursor.clone());

        let (cursor_tx, cursor_rx) = watch::channel(cursor.unwrap_or_default());
        let (event_tx, event_rx) = mpsc::channel(self.config.sink_buffer);

        let writer = tokio::spawn(run_cursor_writer(
            self.store.clone(),
            cursor_rx,
            self.cancel.clone(),
        ));
        let sink = tokio::spawn(run_sink(sink, event_rx, self.state.clone()));

        let connection = Connection {
            config: self.config.clone(),
            tls: self.tls.clone(),
            state: self.state.clone(),
            cancel: self.cancel.clone(),
            events: event_tx,
            cursor: cursor_tx,
        };
        let connection = tokio::spawn(connection.run());

        *lifecycle = Lifecycle::Running(Tasks {
            connection,
            writer,
            sink,
        });
        Ok(())
    }

    /// Closes the session with code 1000, waits for in-flight events to reach
    /// the sink and persists the cursor. The client never reconnects after
    /// this. Calling it again is a no-op.
    pub async fn stop(&self) -> Result<(), ClientError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let previous = std::mem::replace(&mut *lifecycle, Lifecycle::Stopped);
        self.cancel.cancel();

        let tasks = match previous {
            Lifecycle::Running(tasks) => tasks,
            Lifecycle::Idle => {
                self.state
                    .lock()
                    .await
                    .set_connection(ConnectionState::Stopped);
                return Ok(());
            }
            Lifecycle::Stopped => return Ok(()),
        };

        for (name, task) in [
            ("connection", tasks.connection),
            ("cursor writer", tasks.writer),
            ("sink", tasks.sink),
        ] {
            if let Err(e) = task.await {
                error!(task = name, error = %e, "Task ended abnormally");
            }
        }

        let cursor = {
            let mut state = self.state.lock().await;
            state.set_connection(ConnectionState::Stopped);
            state.cursor().clone()
        };
        save_cursor(self.store.as_ref(), cursor)
            .await
            .map_err(ClientError::store)?;

        info!("Feed client stopped");
        Ok(())
    }

    pub async fn status(&self) -> FeedStatus {
        self.state.lock().await.status()
    }

    pub async fn devices(&self) -> Vec<DeviceSnapshot> {
        self.state.lock().await.devices()
    }

    pub async fn device(&self, device_id: &DeviceId) -> Option<DeviceSnapshot> {
        self.state.lock().await.device(device_id)
    }
}

async fn save_cursor<S: CursorStore>(store: &S, mut cursor: Cursor) -> Result<(), S::Error> {
    cursor.last_saved = Timestamp::now();
    match store.save(&cursor).await {
        Ok(()) => {
            debug!(
                last_event_id = ?cursor.last_event_id,
                total_events_received = cursor.total_events_received,
                "Cursor saved"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Failed to save cursor");
            Err(e)
        }
    }
}

/// Persists cursor snapshots published by the connection. A failed save is
/// retried with the next snapshot.
async fn run_cursor_writer<S: CursorStore>(
    store: Arc<S>,
    mut cursor_rx: watch::Receiver<Cursor>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            changed = cursor_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let cursor = cursor_rx.borrow_and_update().clone();
                let _ = save_cursor(store.as_ref(), cursor).await;
            }
        }
    }
}

enum SessionEnd {
    /// `stop()` was called.
    Stopped,
    /// The connection went away for any other reason.
    Lost,
}

/// Owns the socket for the lifetime of a started client, reconnecting as
/// needed.
struct Connection {
    config: Arc<FeedConfig>,
    tls: Option<Arc<rustls::ClientConfig>>,
    state: Arc<Mutex<IngestState>>,
    cancel: CancellationToken,
    events: mpsc::Sender<RawEvent>,
    cursor: watch::Sender<Cursor>,
}

impl Connection {
    #[instrument(name = "feed", skip_all, fields(url = %self.config.url))]
    async fn run(self) {
        loop {
            self.state
                .lock()
                .await
                .set_connection(ConnectionState::Connecting);

            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                connected = self.connect() => connected,
            };

            let end = match connected {
                Ok(ws) => self.session(ws).await,
                Err(e) => {
                    warn!(error = %e, "Failed to connect to feed");
                    self.state.lock().await.record_error();
                    SessionEnd::Lost
                }
            };

            let mut state = self.state.lock().await;
            state.on_disconnected();
            if matches!(end, SessionEnd::Stopped) || self.cancel.is_cancelled() {
                break;
            }

            let attempts = state.reconnect_attempts();
            if attempts >= self.config.max_reconnect_attempts {
                state.set_connection(ConnectionState::Failed);
                error!(attempts, "Reconnect attempts exhausted, giving up");
                break;
            }

            let attempt = state.next_reconnect_attempt();
            state.set_connection(ConnectionState::ReconnectScheduled);
            drop(state);

            let delay = self.config.reconnect_delay(attempt);
            info!(attempt, delay_secs = delay.as_secs(), "Scheduling reconnect");

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn connect(&self) -> Result<WsStream, ClientError> {
        let mut request = self.config.url.as_str().into_client_request()?;

        let credentials = BASE64_STANDARD.encode(format!(
            "{}:{}",
            self.config.username, self.config.password
        ));
        let headers = request.headers_mut();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {credentials}"))?,
        );
        headers.insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_str(&self.config.subprotocol)?,
        );

        info!("Connecting to feed");

        let connector = self.tls.clone().map(Connector::Rustls);
        let handshake = connect_async_tls_with_config(request, None, false, connector);
        let timeout = self.config.handshake_timeout();
        let (ws, response) = tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| ClientError::HandshakeTimeout(timeout))??;

        debug!(status = %response.status(), "Handshake complete");
        Ok(ws)
    }

    async fn session(&self, ws: WsStream) -> SessionEnd {
        let (mut write, mut read) = ws.split();

        self.state.lock().await.on_connected(Timestamp::now());
        info!("Connected to feed");

        let now = Instant::now();
        let heartbeat_every = self.config.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(now + heartbeat_every, heartbeat_every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut poll = tokio::time::interval_at(
            now + self.config.initial_poll_delay(),
            self.config.poll_interval(),
        );
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut poller = Poller::new(self.config.stall);

        loop {
            let deadline = self.state.lock().await.request_deadline();

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    close(&mut write, "client stopped").await;
                    return SessionEnd::Stopped;
                }

                _ = heartbeat.tick() => {
                    if let Err(e) = write.send(Message::Ping(Default::default())).await {
                        warn!(error = %e, "Heartbeat failed");
                        self.state.lock().await.record_error();
                        return SessionEnd::Lost;
                    }
                }

                _ = poll.tick() => {
                    if !self.poll(&mut poller).await {
                        close(&mut write, "feed stalled").await;
                        return SessionEnd::Lost;
                    }
                }

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    warn!("No response to request in time, releasing request slot");
                    self.state.lock().await.on_request_timeout();
                }

                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()).await,
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) = write.send(Message::Pong(payload)).await {
                            warn!(error = %e, "Failed to answer ping");
                            self.state.lock().await.record_error();
                            return SessionEnd::Lost;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(frame = ?frame, "Feed closed the connection");
                        return SessionEnd::Lost;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "Feed connection error");
                        self.state.lock().await.record_error();
                        return SessionEnd::Lost;
                    }
                    None => {
                        info!("Feed connection ended");
                        return SessionEnd::Lost;
                    }
                },
            }

            if let Err(e) = self.drain(&mut write).await {
                warn!(error = %e, "Failed to send request");
                self.state.lock().await.record_error();
                return SessionEnd::Lost;
            }
        }
    }

    /// Runs one poll tick. Returns `false` when the stall policy asks for a
    /// fresh connection.
    async fn poll(&self, poller: &mut Poller) -> bool {
        let mut state = self.state.lock().await;

        match poller.tick(state.is_busy()) {
            Tick::Poll => {}
            Tick::Skip { skipped } => {
                debug!(skipped, "Previous request still pending, skipping poll");
                return true;
            }
            Tick::Stalled {
                skipped,
                action: StallAction::Wait,
            } => {
                warn!(skipped, "Feed stalled, still waiting for a response");
                return true;
            }
            Tick::Stalled {
                skipped,
                action: StallAction::Reset,
            } => {
                warn!(skipped, "Feed stalled, clearing request state");
                state.clear_wait();
            }
            Tick::Stalled {
                skipped,
                action: StallAction::Reconnect,
            } => {
                warn!(skipped, "Feed stalled, reconnecting");
                return false;
            }
        }

        debug!(preceding_event_id = ?state.cursor().last_event_id, "Polling for events");
        state.queue_poll(&self.config, Timestamp::now());
        true
    }

    async fn handle_text(&self, text: &str) {
        let (handled, cursor) = {
            let mut state = self.state.lock().await;
            let handled = state.handle_text(text, Timestamp::now());
            let cursor = matches!(handled, Handled::Event { flush: true, .. })
                .then(|| state.cursor().clone());
            (handled, cursor)
        };

        if let Some(cursor) = cursor {
            self.cursor.send_replace(cursor);
        }

        if let Handled::Event { event, .. } = handled {
            if self.events.send(event).await.is_err() {
                warn!("Sink consumer is gone, dropping event");
            }
        }
    }

    /// Sends the next queued request if the single request slot is free.
    async fn drain(&self, write: &mut WsWrite) -> Result<(), tungstenite::Error> {
        let Some(request) = self.state.lock().await.next_request(true, Instant::now()) else {
            return Ok(());
        };

        let json = match request.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "Failed to encode request");
                self.state.lock().await.request_send_failed();
                return Ok(());
            }
        };

        debug!(request = %json, "Sending request");
        if let Err(e) = write.send(Message::Text(json.into())).await {
            self.state.lock().await.request_send_failed();
            return Err(e);
        }

        Ok(())
    }
}

async fn close(write: &mut WsWrite, reason: &'static str) {
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: reason.into(),
    };
    if let Err(e) = write.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "Failed to send close frame");
    }
}
