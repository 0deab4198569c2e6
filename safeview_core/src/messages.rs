//! Wire envelope for the live stream.
//!
//! Every frame is a JSON object `{"type": ..., "data": ...}`:
//!
//! | `type`         | `data`                                               |
//! |----------------|------------------------------------------------------|
//! | `scan_update`  | `{"ranges": [...], "angle_min": n, "angle_increment": n}` |
//! | `brake_update` | `true`/`false`, `"true"`/`"false"`, `1`/`0`          |
//!
//! JSON cannot carry NaN or Infinity, so encoders write `null`; a `null`
//! range or angle decodes to NaN and is filtered downstream like any other
//! invalid beam.

use crate::scan::ScanFrame;
use safeview_env::InboundFrame;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const SCAN_UPDATE: &str = "scan_update";
pub const BRAKE_UPDATE: &str = "brake_update";

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Scan(ScanFrame),
    Brake(bool),
}

impl StreamEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Scan(_) => SCAN_UPDATE,
            StreamEvent::Brake(_) => BRAKE_UPDATE,
        }
    }
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Binary frame is not UTF-8")]
    NotUtf8,

    #[error("Envelope has no string `type` field")]
    MissingType,

    #[error("Malformed `{kind}` payload: {reason}")]
    Payload { kind: &'static str, reason: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct WireScan {
    ranges: Vec<Option<f64>>,
    #[serde(default)]
    angle_min: Option<f64>,
    #[serde(default)]
    angle_increment: Option<f64>,
}

impl From<WireScan> for ScanFrame {
    fn from(wire: WireScan) -> Self {
        ScanFrame::new(
            wire.angle_min.unwrap_or(f64::NAN),
            wire.angle_increment.unwrap_or(f64::NAN),
            wire.ranges.into_iter().map(|r| r.unwrap_or(f64::NAN)).collect(),
        )
    }
}

/// Decodes one socket frame.
///
/// `Ok(None)` means a well-formed envelope of a type we do not handle.
pub fn decode_frame(frame: &InboundFrame) -> Result<Option<StreamEvent>, MessageError> {
    let text = frame.as_text().ok_or(MessageError::NotUtf8)?;
    decode_text(text)
}

pub fn decode_text(text: &str) -> Result<Option<StreamEvent>, MessageError> {
    let mut envelope: Value = serde_json::from_str(text)?;
    let kind = envelope
        .get("type")
        .and_then(Value::as_str)
        .ok_or(MessageError::MissingType)?
        .to_string();
    let data = envelope
        .get_mut("data")
        .map(Value::take)
        .unwrap_or(Value::Null);

    match kind.as_str() {
        SCAN_UPDATE => {
            let wire: WireScan = serde_json::from_value(data).map_err(|e| MessageError::Payload {
                kind: SCAN_UPDATE,
                reason: e.to_string(),
            })?;
            Ok(Some(StreamEvent::Scan(wire.into())))
        }
        BRAKE_UPDATE => parse_brake(&data).map(|b| Some(StreamEvent::Brake(b))),
        other => {
            tracing::trace!(kind = other, "ignoring message type");
            Ok(None)
        }
    }
}

fn parse_brake(data: &Value) -> Result<bool, MessageError> {
    let parsed = match data {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        Value::Number(n) => match n.as_f64() {
            Some(v) if v == 1.0 => Some(true),
            Some(v) if v == 0.0 => Some(false),
            _ => None,
        },
        _ => None,
    };

    parsed.ok_or_else(|| MessageError::Payload {
        kind: BRAKE_UPDATE,
        reason: format!("expected boolean-like value, got {data}"),
    })
}

/// Encodes a scan the way the robot does; non-finite values become `null`.
pub fn encode_scan(frame: &ScanFrame) -> String {
    let finite = |v: f64| v.is_finite().then_some(v);
    let envelope = serde_json::json!({
        "type": SCAN_UPDATE,
        "data": WireScan {
            ranges: frame.ranges.iter().copied().map(finite).collect(),
            angle_min: finite(frame.angle_min),
            angle_increment: finite(frame.angle_increment),
        },
    });
    envelope.to_string()
}

pub fn encode_brake(engaged: bool) -> String {
    serde_json::json!({ "type": BRAKE_UPDATE, "data": engaged }).to_string()
}
