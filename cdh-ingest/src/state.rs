use cdh_core::protocol::{Inbound, Request};
use cdh_core::{ConnectionState, Cursor, DeviceId, DeviceSnapshot, FeedStatus, RawEvent};
use jiff::Timestamp;
use tokio::time::Instant;

use crate::config::FeedConfig;
use crate::dedup::DedupWindow;
use crate::devices::DeviceCache;
use crate::poller;
use crate::sequencer::RequestSequencer;

/// Counters and timestamps reported through [`FeedStatus`].
#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub connected: bool,
    pub last_connected_at: Option<Timestamp>,
    pub last_event_at: Option<Timestamp>,
    pub last_poll_at: Option<Timestamp>,
    pub errors: u64,
    pub faults: u64,
    pub sink_errors: u64,
    pub duplicates_skipped: u64,
    pub reconnect_attempts: u32,
}

/// What the connection should do after a message was handled.
#[derive(Debug, PartialEq)]
pub enum Handled {
    /// A new event for the sink. `flush` is set when the cursor is due to be
    /// persisted.
    Event { event: RawEvent, flush: bool },
    Duplicate,
    Faults,
    Ignored,
    Malformed,
}

/// Everything one client mutates while a session runs.
///
/// Lives behind a single `tokio::sync::Mutex` per client. Nothing in here does
/// I/O: the connection task decides what to send and persist based on what
/// these methods return.
#[derive(Debug)]
pub struct IngestState {
    sequencer: RequestSequencer,
    dedup: DedupWindow,
    devices: DeviceCache,
    cursor: Cursor,
    stats: Stats,
    connection: ConnectionState,
    /// Events received for the current request.
    batch_count: u32,
    max_event_count: u32,
    flush_every: u64,
}

impl IngestState {
    /// Builds the state for a fresh run, resuming from `cursor` when one was
    /// stored. The stored last event id seeds the dedup window so that a
    /// vendor replaying it is caught.
    pub fn new(config: &FeedConfig, cursor: Option<Cursor>) -> Self {
        let mut dedup = DedupWindow::new(config.dedup_capacity, config.dedup_retain);
        let cursor = cursor.unwrap_or_default();
        if let Some(id) = &cursor.last_event_id {
            dedup.insert(id.clone());
        }

        Self {
            sequencer: RequestSequencer::new(config.request_timeout()),
            dedup,
            devices: DeviceCache::new(config.device_capacity),
            cursor,
            stats: Stats::default(),
            connection: ConnectionState::Disconnected,
            batch_count: 0,
            max_event_count: config.max_event_count,
            flush_every: config.flush_every,
        }
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn set_connection(&mut self, connection: ConnectionState) {
        self.connection = connection;
    }

    pub fn on_connected(&mut self, now: Timestamp) {
        self.connection = ConnectionState::Connected;
        self.stats.connected = true;
        self.stats.last_connected_at = Some(now);
        self.stats.reconnect_attempts = 0;
    }

    /// The socket is gone. Whatever was queued or in flight belonged to it.
    pub fn on_disconnected(&mut self) {
        if !self.connection.is_terminal() {
            self.connection = ConnectionState::Disconnected;
        }
        self.stats.connected = false;
        self.sequencer.reset();
        self.batch_count = 0;
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.stats.reconnect_attempts
    }

    /// Bumps the attempt counter and returns the new value.
    pub fn next_reconnect_attempt(&mut self) -> u32 {
        self.stats.reconnect_attempts += 1;
        self.stats.reconnect_attempts
    }

    pub fn record_error(&mut self) {
        self.stats.errors += 1;
    }

    pub fn record_sink_error(&mut self) {
        self.stats.sink_errors += 1;
    }

    pub fn is_busy(&self) -> bool {
        self.sequencer.is_busy()
    }

    /// Drops any local wait and queued requests so the next poll goes through.
    pub fn clear_wait(&mut self) {
        self.sequencer.reset();
    }

    /// Queues a GetEvents request resuming from the current cursor.
    pub fn queue_poll(&mut self, config: &FeedConfig, now: Timestamp) {
        let request = poller::get_events(config, &self.cursor);
        self.stats.last_poll_at = Some(now);
        self.sequencer.enqueue(request);
    }

    /// Next request to put on the wire, if the single slot is free.
    pub fn next_request(&mut self, socket_open: bool, now: Instant) -> Option<Request> {
        let request = self.sequencer.next_to_send(socket_open, now)?;
        self.batch_count = 0;
        Some(request)
    }

    pub fn request_send_failed(&mut self) {
        self.sequencer.send_failed();
    }

    pub fn request_deadline(&self) -> Option<Instant> {
        self.sequencer.deadline()
    }

    pub fn on_request_timeout(&mut self) {
        self.sequencer.on_timeout();
    }

    /// Processes one inbound text frame.
    pub fn handle_text(&mut self, raw: &str, now: Timestamp) -> Handled {
        match Inbound::parse(raw) {
            Ok(Inbound::Event(event)) => self.handle_event(event, now),
            Ok(Inbound::Faults(faults)) => {
                for fault in &faults {
                    if fault.is_response_in_progress() {
                        tracing::debug!("Feed is still preparing a response, waiting");
                        self.sequencer.on_fault(true);
                    } else {
                        self.stats.faults += 1;
                        tracing::warn!(
                            code = fault.code.as_i64(),
                            kind = fault.code.description(),
                            text = %fault.text,
                            "Feed returned a fault"
                        );
                        self.sequencer.on_fault(false);
                    }
                }
                Handled::Faults
            }
            Ok(Inbound::Other(value)) => {
                tracing::debug!(message = %value, "Ignoring unrecognised message");
                Handled::Ignored
            }
            Err(e) => {
                self.stats.errors += 1;
                tracing::warn!(error = %e, "Dropping malformed message");
                Handled::Malformed
            }
        }
    }

    fn handle_event(&mut self, event: RawEvent, now: Timestamp) -> Handled {
        // Any event answers the request, so in-progress is already clear when
        // a batch fills up.
        self.sequencer.on_response();
        self.batch_count += 1;
        if self.batch_count >= self.max_event_count {
            tracing::debug!(
                batch = self.batch_count,
                "Received a full batch, next poll will continue"
            );
            self.batch_count = 0;
        }

        if let Some(id) = &event.event_id {
            if !self.dedup.insert(id.clone()) {
                self.stats.duplicates_skipped += 1;
                tracing::debug!(event_id = %id, sequence = ?event.sequence, "Skipping duplicate event");
                return Handled::Duplicate;
            }

            self.cursor.last_event_id = Some(id.clone());
            self.cursor.event_sequence = match event.sequence {
                Some(sequence) => sequence,
                None => self.cursor.event_sequence + 1,
            };
        } else {
            tracing::debug!("Event without a message id, cursor not advanced");
        }
        self.cursor.total_events_received += 1;
        let flush = self.cursor.total_events_received % self.flush_every == 0;

        self.stats.last_event_at = Some(now);
        if let Some(device_id) = self.devices.apply(&event.payload, now) {
            tracing::trace!(device_id = %device_id, "Device snapshot updated");
        }

        Handled::Event { event, flush }
    }

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub fn device(&self, device_id: &DeviceId) -> Option<DeviceSnapshot> {
        self.devices.get(device_id)
    }

    pub fn devices(&self) -> Vec<DeviceSnapshot> {
        self.devices.snapshots()
    }

    pub fn status(&self) -> FeedStatus {
        FeedStatus {
            connected: self.stats.connected,
            state: self.connection,
            last_connected_at: self.stats.last_connected_at,
            total_events_received: self.cursor.total_events_received,
            last_event_at: self.stats.last_event_at,
            last_poll_at: self.stats.last_poll_at,
            errors: self.stats.errors,
            faults: self.stats.faults,
            sink_errors: self.stats.sink_errors,
            duplicates_skipped: self.stats.duplicates_skipped,
            reconnect_attempts: self.stats.reconnect_attempts,
            queue_length: self.sequencer.queue_len(),
            last_event_id: self.cursor.last_event_id.clone(),
            event_sequence: self.cursor.event_sequence,
            processed_event_count: self.dedup.len(),
            device_count: self.devices.len(),
        }
    }
}
