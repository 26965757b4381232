use serde_json::Value;

use super::error::{ParseResult, ProtocolError};

/// Fault codes documented by the vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCode {
    UnknownError,
    AuthenticationFailed,
    UnrecognizedRequest,
    UnallocatedPartition,
    PrecedingEventNotFound,
    FollowingEventMustBeEmpty,
    FollowingEventNotFound,
    FollowingPrecedesPreceding,
    /// The previous request is still being computed on the vendor side.
    ResponseInProgress,
    Other(i64),
}

impl From<i64> for FaultCode {
    fn from(value: i64) -> Self {
        match value {
            1001 => Self::UnknownError,
            1002 => Self::AuthenticationFailed,
            1003 => Self::UnrecognizedRequest,
            2001 => Self::UnallocatedPartition,
            2002 => Self::PrecedingEventNotFound,
            2003 => Self::FollowingEventMustBeEmpty,
            2004 => Self::FollowingEventNotFound,
            2005 => Self::FollowingPrecedesPreceding,
            2006 => Self::ResponseInProgress,
            other => Self::Other(other),
        }
    }
}

impl FaultCode {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::UnknownError => 1001,
            Self::AuthenticationFailed => 1002,
            Self::UnrecognizedRequest => 1003,
            Self::UnallocatedPartition => 2001,
            Self::PrecedingEventNotFound => 2002,
            Self::FollowingEventMustBeEmpty => 2003,
            Self::FollowingEventNotFound => 2004,
            Self::FollowingPrecedesPreceding => 2005,
            Self::ResponseInProgress => 2006,
            Self::Other(code) => code,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::UnknownError => "unknown vendor error",
            Self::AuthenticationFailed => "authentication failed",
            Self::UnrecognizedRequest => "unrecognized request",
            Self::UnallocatedPartition => "unallocated event partition",
            Self::PrecedingEventNotFound => "preceding event not found",
            Self::FollowingEventMustBeEmpty => {
                "following event must be empty without a preceding event"
            }
            Self::FollowingEventNotFound => "following event not found",
            Self::FollowingPrecedesPreceding => "following event precedes preceding event",
            Self::ResponseInProgress => "response already in progress",
            Self::Other(_) => "unrecognized fault code",
        }
    }
}

/// A fault reported by the vendor in response to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub code: FaultCode,
    pub text: String,
}

impl Fault {
    pub fn is_response_in_progress(&self) -> bool {
        self.code == FaultCode::ResponseInProgress
    }

    /// Reads one fault object. Accepts both `{faultCode, faultText}` and the
    /// flat variant's `{faultCode, faultString}`.
    pub(crate) fn from_object(value: &Value) -> ParseResult<Self> {
        let code = value
            .get("faultCode")
            .and_then(as_code)
            .ok_or(ProtocolError::MissingFaultCode)?;

        let text = value
            .get("faultText")
            .or_else(|| value.get("faultString"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();

        Ok(Self {
            code: FaultCode::from(code),
            text,
        })
    }
}

fn as_code(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
