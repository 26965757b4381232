use std::collections::{BTreeMap, HashMap};

use cdh_core::protocol::as_identifier;
use cdh_core::{DeviceId, DeviceSnapshot, Location};
use jiff::{Timestamp, tz::TimeZone};
use serde_json::Value;

/// Full charge of the reefer tracking unit battery, in volts.
const FULL_BATTERY_VOLTS: f64 = 8.1;

/// Telemetry fields found in a single event. `None` means "not reported".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceUpdate {
    pub device_id: Option<DeviceId>,
    pub asset_id: Option<Box<str>>,
    pub seen_at: Option<Timestamp>,
    pub location: Option<Location>,
    pub temperature_c: Option<f64>,
    pub door_status: Option<Box<str>>,
    pub power_status: Option<Box<str>>,
    pub battery_pct: Option<f64>,
    pub active_error_codes: Vec<Box<str>>,
}

impl DeviceUpdate {
    /// Extracts telemetry from a raw feed message. Vendors disagree on field
    /// names, so each value is looked up under every spelling seen so far.
    pub fn from_payload(payload: &Value) -> Self {
        let event = payload.get("Event").unwrap_or(payload);

        let device_id = first_identifier(
            event,
            &[
                "/deviceId",
                "/DeviceId",
                "/IMEI",
                "/DeviceData/DeviceID",
                "/DeviceData/DeviceId",
                "/MessageData/DeviceID",
            ],
        )
        .map(|id| DeviceId(id.into()));

        let asset_id = first_identifier(
            event,
            &[
                "/assetId",
                "/AssetID",
                "/LastAssetID",
                "/ReeferData/AssetID",
                "/DeviceData/LastAssetID",
                "/MessageData/AssetID",
            ],
        )
        .map(Into::into);

        let seen_at = ["/timestamp", "/EventUTC", "/Timestamp", "/MessageData/EventDtm"]
            .iter()
            .filter_map(|path| event.pointer(path).and_then(Value::as_str))
            .find_map(parse_timestamp);

        let location = [
            ("/location/latitude", "/location/longitude"),
            ("/Latitude", "/Longitude"),
            ("/DeviceData/GPSLatitude", "/DeviceData/GPSLongitude"),
        ]
        .iter()
        .find_map(|(lat, lon)| {
            Some(Location {
                latitude: event.pointer(lat).and_then(as_number)?,
                longitude: event.pointer(lon).and_then(as_number)?,
            })
        });

        let temperature_c = first_number(
            event,
            &["/ReeferData/TAmb", "/DeviceData/DeviceTemp", "/Temperature"],
        );

        let door_status = ["/DeviceData/DoorState", "/DoorState"]
            .iter()
            .find_map(|path| event.pointer(path).and_then(Value::as_str))
            .map(|state| state.to_lowercase().into());

        let power_status = match event.pointer("/DeviceData/ExtPower") {
            Some(Value::Bool(on)) => Some(on_off(*on)),
            Some(Value::Number(n)) => Some(on_off(n.as_f64() != Some(0.0))),
            _ => event
                .get("PowerStatus")
                .and_then(Value::as_str)
                .map(|status| status.to_lowercase().into()),
        };

        let battery_pct = event
            .pointer("/DeviceData/BatteryVoltage")
            .and_then(as_number)
            .map(|volts| (volts / FULL_BATTERY_VOLTS * 100.0).clamp(0.0, 100.0));

        let active_error_codes = event
            .pointer("/ReeferData/ReeferAlarms")
            .and_then(Value::as_array)
            .map(|alarms| alarms.iter().filter_map(active_alarm_code).collect())
            .unwrap_or_default();

        Self {
            device_id,
            asset_id,
            seen_at,
            location,
            temperature_c,
            door_status,
            power_status,
            battery_pct,
            active_error_codes,
        }
    }

    /// Merges into `snapshot`. Fields this update does not carry keep their
    /// previous value.
    fn merge_into(self, snapshot: &mut DeviceSnapshot, now: Timestamp) {
        snapshot.last_seen = self.seen_at.unwrap_or(now);
        if let Some(asset_id) = self.asset_id {
            snapshot.asset_id = Some(asset_id);
        }
        if let Some(location) = self.location {
            snapshot.location = Some(location);
        }
        if let Some(temperature) = self.temperature_c {
            snapshot.temperature_c = Some(temperature);
        }
        if let Some(door) = self.door_status {
            snapshot.door_status = Some(door);
        }
        if let Some(power) = self.power_status {
            snapshot.power_status = Some(power);
        }
        if let Some(battery) = self.battery_pct {
            snapshot.battery_pct = Some(battery);
        }
        if !self.active_error_codes.is_empty() {
            snapshot.active_error_codes = self.active_error_codes.into_boxed_slice();
        }
    }
}

fn on_off(on: bool) -> Box<str> {
    if on { "on".into() } else { "off".into() }
}

fn active_alarm_code(alarm: &Value) -> Option<Box<str>> {
    let active = match alarm.get("Active")? {
        Value::Bool(active) => *active,
        Value::Number(n) => n.as_f64() != Some(0.0),
        _ => false,
    };
    if !active {
        return None;
    }

    match alarm.get("RCAlias").and_then(Value::as_str) {
        Some(alias) if !alias.is_empty() => Some(alias.into()),
        _ => alarm
            .get("OemAlarm")
            .and_then(as_identifier)
            .map(|code| format!("E{code}").into()),
    }
}

fn first_identifier(event: &Value, paths: &[&str]) -> Option<String> {
    paths
        .iter()
        .find_map(|path| event.pointer(path).and_then(as_identifier))
}

fn first_number(event: &Value, paths: &[&str]) -> Option<f64> {
    paths
        .iter()
        .find_map(|path| event.pointer(path).and_then(as_number))
}

fn as_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|n| n.is_finite())
}

/// Accepts RFC 3339 timestamps and offset-less date-times, which are taken to
/// be UTC.
fn parse_timestamp(raw: &str) -> Option<Timestamp> {
    if let Ok(ts) = raw.parse::<Timestamp>() {
        return Some(ts);
    }

    raw.parse::<jiff::civil::DateTime>()
        .ok()
        .and_then(|dt| dt.to_zoned(TimeZone::UTC).ok())
        .map(|zoned| zoned.timestamp())
}

#[derive(Debug)]
struct Entry {
    snapshot: DeviceSnapshot,
    touched: u64,
}

/// Last known telemetry per device, bounded to `capacity` devices.
///
/// When full, the device that has gone longest without an update is evicted.
#[derive(Debug)]
pub struct DeviceCache {
    entries: HashMap<DeviceId, Entry>,
    recency: BTreeMap<u64, DeviceId>,
    clock: u64,
    capacity: usize,
}

impl DeviceCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            clock: 0,
            capacity: capacity.max(1),
        }
    }

    /// Applies the telemetry in `payload`. Returns the device it was applied
    /// to, or `None` when the event names no device.
    pub fn apply(&mut self, payload: &Value, now: Timestamp) -> Option<DeviceId> {
        let update = DeviceUpdate::from_payload(payload);
        let device_id = update.device_id.clone()?;
        self.merge(device_id.clone(), update, now);
        Some(device_id)
    }

    fn merge(&mut self, device_id: DeviceId, update: DeviceUpdate, now: Timestamp) {
        self.clock += 1;
        let touched = self.clock;

        if let Some(entry) = self.entries.get_mut(&device_id) {
            self.recency.remove(&entry.touched);
            entry.touched = touched;
            update.merge_into(&mut entry.snapshot, now);
            self.recency.insert(touched, device_id);
            return;
        }

        if self.entries.len() >= self.capacity {
            if let Some((_, evicted)) = self.recency.pop_first() {
                self.entries.remove(&evicted);
                tracing::debug!(device_id = %evicted, "Evicted least recently updated device");
            }
        }

        let mut snapshot = DeviceSnapshot {
            device_id: device_id.clone(),
            asset_id: None,
            last_seen: now,
            location: None,
            temperature_c: None,
            door_status: None,
            power_status: None,
            battery_pct: None,
            active_error_codes: Box::new([]),
        };
        update.merge_into(&mut snapshot, now);

        self.entries.insert(device_id.clone(), Entry { snapshot, touched });
        self.recency.insert(touched, device_id);
    }

    pub fn get(&self, device_id: &DeviceId) -> Option<DeviceSnapshot> {
        self.entries.get(device_id).map(|e| e.snapshot.clone())
    }

    /// All snapshots, ordered by device id.
    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        let mut all: Vec<_> = self.entries.values().map(|e| e.snapshot.clone()).collect();
        all.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        all
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
