//! Opportunistic JSON-RPC envelope parsing.
//!
//! The bridge never validates frames. It only peeks at `id`, `method` and
//! `error` to correlate requests with responses; anything that does not parse
//! is forwarded untouched.

use serde::Deserialize;
use serde_json::Value;
use std::fmt;

/// Correlation id normalized from the wire.
///
/// JSON-RPC allows a string or a number. Both forms keep their variant, so
/// `1` and `"1"` never collide in the pending table.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    /// Normalize a raw `id` value. Fractional numbers, `null`, booleans and
    /// structured values are not trackable and yield `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::String(s.clone())),
            Value::Number(n) => n.as_i64().map(Self::Number),
            _ => None,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

/// The correlation-relevant fields of one frame.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Envelope {
    pub id: Option<RequestId>,
    pub method: Option<String>,
    /// `true` when the frame carries a non-null `error` member.
    pub has_error: bool,
}

impl Envelope {
    /// Parse a frame. Returns `None` unless the frame is a JSON object.
    pub fn parse(frame: &str) -> Option<Self> {
        let raw: RawEnvelope = serde_json::from_str(frame).ok()?;
        Some(Self {
            id: raw.id.as_ref().and_then(RequestId::from_value),
            method: raw.method.as_ref().and_then(Value::as_str).map(str::to_owned),
            has_error: raw.error.is_some(),
        })
    }

    /// The `(id, method)` pair when this frame is a trackable request.
    pub fn request(&self) -> Option<(&RequestId, &str)> {
        match (&self.id, &self.method) {
            (Some(id), Some(method)) => Some((id, method.as_str())),
            _ => None,
        }
    }
}
