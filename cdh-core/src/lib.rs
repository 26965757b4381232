pub mod protocol;

use std::fmt;

use serde::{Deserialize, Serialize};

// We use `Box<str>` and `Box<[T]>` for values that never grow after they are
// built. This keeps the snapshots compact and makes accidental cloning of
// large values visible.
type BoxStr = Box<str>;
type BoxList<T> = Box<[T]>;

/// Vendor-assigned identifier of a feed event (`MessageData.MsgID`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub BoxStr);

impl EventId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

/// Identifier of a physical tracking device (IMEI or vendor device id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub BoxStr);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

/// Durable bookmark of ingestion progress.
///
/// `last_event_id` only ever moves forward in feed order. The only way back is
/// an explicit operator reset, which replaces the whole record with
/// [`Cursor::default`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    /// Last accepted event, used as `PrecedingEventID` on the next request.
    pub last_event_id: Option<EventId>,
    /// Last sequence number seen on the feed. Informational only.
    pub event_sequence: u64,
    /// When the record was last written to storage.
    pub last_saved: jiff::Timestamp,
    /// Number of distinct events accepted over the lifetime of the cursor.
    pub total_events_received: u64,
}

impl Default for Cursor {
    fn default() -> Self {
        Self {
            last_event_id: None,
            event_sequence: 0,
            last_saved: jiff::Timestamp::UNIX_EPOCH,
            total_events_received: 0,
        }
    }
}

/// A single event as delivered by the feed.
///
/// The payload is kept as the vendor sent it; only the fields needed to
/// drive the protocol are extracted.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    /// `Event.MessageData.MsgID`, when the vendor supplied one.
    pub event_id: Option<EventId>,
    /// Top-level `Sequence` counter, when present.
    pub sequence: Option<u64>,
    /// The full message as received.
    pub payload: serde_json::Value,
}

/// GPS position reported by a device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

/// Last known merged telemetry for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub device_id: DeviceId,
    /// Container or asset the device is currently mounted on.
    pub asset_id: Option<BoxStr>,
    pub last_seen: jiff::Timestamp,
    pub location: Option<Location>,
    /// Ambient temperature in degrees Celsius.
    pub temperature_c: Option<f64>,
    /// Lowercased door state, e.g. `open` / `closed`.
    pub door_status: Option<BoxStr>,
    /// `on` / `off`.
    pub power_status: Option<BoxStr>,
    /// Battery charge in the range 0–100.
    pub battery_pct: Option<f64>,
    /// Alarm codes active on the last event that reported any.
    pub active_error_codes: BoxList<BoxStr>,
}

/// Connection lifecycle of the feed client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting for the backoff timer before the next connection attempt.
    ReconnectScheduled,
    /// Reconnect attempts exhausted. Terminal.
    Failed,
    /// Stopped by the owner. Terminal.
    Stopped,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Stopped)
    }
}

/// Read-only view of the client exposed to operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedStatus {
    pub connected: bool,
    pub state: ConnectionState,
    pub last_connected_at: Option<jiff::Timestamp>,
    pub total_events_received: u64,
    pub last_event_at: Option<jiff::Timestamp>,
    pub last_poll_at: Option<jiff::Timestamp>,
    /// Transport and parse errors.
    pub errors: u64,
    /// Vendor faults other than "response in progress".
    pub faults: u64,
    /// Events the sink failed to process.
    pub sink_errors: u64,
    pub duplicates_skipped: u64,
    pub reconnect_attempts: u32,
    pub queue_length: usize,
    pub last_event_id: Option<EventId>,
    pub event_sequence: u64,
    pub processed_event_count: usize,
    pub device_count: usize,
}
