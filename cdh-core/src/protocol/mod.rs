mod error;
mod fault;

use std::borrow::Cow;

use serde::Serialize;
use serde_json::Value;

pub use error::{ParseResult, ProtocolError};
pub use fault::{Fault, FaultCode};

use crate::{EventId, RawEvent};

/// Websocket subprotocol negotiated with the vendor feed.
pub const DEFAULT_SUBPROTOCOL: &str = "cdh.orbcomm.com";
/// Upper bound the vendor accepts for `MaxEventCount`.
pub const MAX_EVENT_COUNT_LIMIT: u32 = 50_000;

/// Requests understood by the feed. Serializes externally tagged, e.g.
/// `{"GetEvents": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Request {
    GetEvents(GetEvents),
}

impl Request {
    pub fn to_json(&self) -> ParseResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventType {
    #[serde(rename = "all")]
    All,
}

/// Asks the feed for the next batch of events after `preceding_event_id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetEvents {
    pub event_type: EventType,
    pub event_partition: u8,
    pub max_event_count: u32,
    /// Omitted on a cold start with no stored cursor.
    #[serde(rename = "PrecedingEventID", skip_serializing_if = "Option::is_none")]
    pub preceding_event_id: Option<EventId>,
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Faults(Vec<Fault>),
    Event(RawEvent),
    /// Anything else the feed sends; logged and ignored.
    Other(Value),
}

impl Inbound {
    /// Decodes one text frame from the feed, dropping control characters the
    /// vendor occasionally embeds in string values.
    pub fn parse(raw: &str) -> ParseResult<Self> {
        let cleaned = strip_control_chars(raw);
        let value: Value = serde_json::from_str(&cleaned)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> ParseResult<Self> {
        let Some(object) = value.as_object() else {
            return Err(ProtocolError::NotAnObject(type_name(&value)));
        };

        if let Some(faults) = object.get("faults").and_then(Value::as_array) {
            let faults = faults
                .iter()
                .map(|entry| Fault::from_object(entry.get("fault").unwrap_or(entry)))
                .collect::<ParseResult<Vec<_>>>()?;
            return Ok(Self::Faults(faults));
        }

        if object.contains_key("Event") {
            let event_id = value
                .pointer("/Event/MessageData/MsgID")
                .and_then(as_identifier)
                .map(|id| EventId(id.into()));
            let sequence = object.get("Sequence").and_then(as_unsigned);

            return Ok(Self::Event(RawEvent {
                event_id,
                sequence,
                payload: value,
            }));
        }

        if object.contains_key("faultCode") {
            return Ok(Self::Faults(vec![Fault::from_object(&value)?]));
        }

        Ok(Self::Other(value))
    }
}

/// Removes C0 control characters and DEL. Tabs and line breaks become a
/// single space so that words on either side stay separated.
pub fn strip_control_chars(raw: &str) -> Cow<'_, str> {
    if !raw.chars().any(is_control) {
        return Cow::Borrowed(raw);
    }

    let cleaned = raw
        .chars()
        .filter_map(|c| match c {
            '\t' | '\n' | '\r' => Some(' '),
            c if is_control(c) => None,
            c => Some(c),
        })
        .collect();

    Cow::Owned(cleaned)
}

fn is_control(c: char) -> bool {
    matches!(c, '\u{0}'..='\u{1f}' | '\u{7f}')
}

/// Reads a string or a number as an identifier.
pub fn as_identifier(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_unsigned(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn get_events(preceding: Option<&str>) -> Request {
        Request::GetEvents(GetEvents {
            event_type: EventType::All,
            event_partition: 1,
            max_event_count: 100,
            preceding_event_id: preceding.map(EventId::from),
        })
    }

    #[test]
    fn get_events_without_cursor_omits_preceding_id() {
        let value: Value = serde_json::from_str(&get_events(None).to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({ "GetEvents": { "EventType": "all", "EventPartition": 1, "MaxEventCount": 100 } })
        );
    }

    #[test]
    fn get_events_with_cursor_carries_preceding_id() {
        let value: Value =
            serde_json::from_str(&get_events(Some("E42")).to_json().unwrap()).unwrap();
        assert_eq!(value["GetEvents"]["PrecedingEventID"], "E42");
    }

    #[test]
    fn parses_event_with_id_and_sequence() {
        let raw = r#"{"Event":{"MessageData":{"MsgID":"E1","EventDtm":"2024-05-01T10:00:00Z"}},"Sequence":7}"#;
        let Inbound::Event(event) = Inbound::parse(raw).unwrap() else {
            panic!("expected an event");
        };
        assert_eq!(event.event_id, Some(EventId::from("E1")));
        assert_eq!(event.sequence, Some(7));
    }

    #[test]
    fn numeric_message_id_is_accepted() {
        let Inbound::Event(event) =
            Inbound::parse(r#"{"Event":{"MessageData":{"MsgID":123456}}}"#).unwrap()
        else {
            panic!("expected an event");
        };
        assert_eq!(event.event_id, Some(EventId::from("123456")));
        assert_eq!(event.sequence, None);
    }

    #[test]
    fn parses_nested_fault_list() {
        let raw = r#"{"faults":[{"fault":{"faultCode":2006,"faultText":"Response in progress"}},{"fault":{"faultCode":2002,"faultText":"nope"}}]}"#;
        let Inbound::Faults(faults) = Inbound::parse(raw).unwrap() else {
            panic!("expected faults");
        };
        assert_eq!(faults.len(), 2);
        assert!(faults[0].is_response_in_progress());
        assert_eq!(faults[1].code, FaultCode::PrecedingEventNotFound);
    }

    #[test]
    fn parses_flat_fault() {
        let raw = r#"{"faultCode":1002,"faultString":"bad credentials"}"#;
        let Inbound::Faults(faults) = Inbound::parse(raw).unwrap() else {
            panic!("expected faults");
        };
        assert_eq!(faults[0].code, FaultCode::AuthenticationFailed);
        assert_eq!(faults[0].text, "bad credentials");
    }

    #[test]
    fn control_characters_do_not_break_parsing() {
        let raw = "{\"Event\":{\"MessageData\":{\"MsgID\":\"E9\",\"Note\":\"door\u{1}\topen\nnow\"}}}";
        let Inbound::Event(event) = Inbound::parse(raw).unwrap() else {
            panic!("expected an event");
        };
        assert_eq!(
            event.payload["Event"]["MessageData"]["Note"],
            Value::String("door open now".into())
        );
    }

    #[test]
    fn clean_input_is_borrowed() {
        assert!(matches!(strip_control_chars("{\"a\": 1}"), Cow::Borrowed(_)));
    }

    #[test]
    fn non_object_is_rejected() {
        assert!(matches!(
            Inbound::parse("[1,2]"),
            Err(ProtocolError::NotAnObject("array"))
        ));
        assert!(matches!(Inbound::parse("{not json"), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn unknown_object_is_passed_through() {
        assert!(matches!(
            Inbound::parse(r#"{"Status":"ok"}"#).unwrap(),
            Inbound::Other(_)
        ));
    }
}
