//! Wire format of the die's notification characteristic.
//!
//! Every frame starts with a one-byte message type tag followed by the
//! fixed-offset fields of that message kind. Only [`ROLL_STATE_TAG`] is
//! understood today.
//!
//! | offset | field             | revision |
//! |--------|-------------------|----------|
//! | 0      | message type (3)  | 1        |
//! | 1      | roll state code   | 1        |
//! | 2      | current face code | 1        |
//!
//! Revision 1 does not carry battery level, charging flag, LED count or
//! design/color in a roll state frame. Those fields are decoded as `None`
//! and tagged with [`PROTOCOL_REVISION`] so that consumers never see
//! invented values. Bytes past the revision 1 layout are ignored.

use chrono::{DateTime, Utc};
use serde_derive::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Primary service advertised by the die.
pub const PIXELS_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
/// Characteristic the die sends notifications on.
pub const PIXELS_NOTIFY_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

pub const ROLL_STATE_TAG: u8 = 3;
/// Tag plus roll state plus face.
pub const ROLL_STATE_LEN: usize = 3;
/// Layout revision produced by [`decode`].
pub const PROTOCOL_REVISION: u8 = 1;

/// One notification as received from the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawFrame {
    pub device_id: String,
    pub bytes: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl RawFrame {
    pub fn new(device_id: impl Into<String>, bytes: Vec<u8>) -> Self {
        RawFrame {
            device_id: device_id.into(),
            bytes,
            received_at: Utc::now(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("frame too short: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    RollState,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RollState {
    pub roll_state: u8,
    pub current_face: u8,
    pub battery_level: Option<u8>,
    pub is_charging: Option<bool>,
    pub led_count: Option<u8>,
    pub design_and_color: Option<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    RollState(RollState),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::RollState(_) => MessageKind::RollState,
        }
    }
}

/// A frame that passed validation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DecodedEvent {
    pub device_id: String,
    pub protocol_revision: u8,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub message: Message,
}

impl DecodedEvent {
    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }
}

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Decode one frame. Never panics and never returns a partial event.
pub fn decode(frame: &RawFrame) -> Result<DecodedEvent, DecodeError> {
    let bytes = frame.bytes.as_slice();
    let Some(&tag) = bytes.first() else {
        return Err(DecodeError::Truncated {
            expected: 1,
            actual: 0,
        });
    };

    let message = match tag {
        ROLL_STATE_TAG => Message::RollState(decode_roll_state(bytes)?),
        other => return Err(DecodeError::UnknownType(other)),
    };

    Ok(DecodedEvent {
        device_id: frame.device_id.clone(),
        protocol_revision: PROTOCOL_REVISION,
        timestamp: frame.received_at,
        message,
    })
}

fn decode_roll_state(bytes: &[u8]) -> Result<RollState, DecodeError> {
    let &[_, roll_state, current_face, ..] = bytes else {
        return Err(DecodeError::Truncated {
            expected: ROLL_STATE_LEN,
            actual: bytes.len(),
        });
    };
    Ok(RollState {
        roll_state,
        current_face,
        battery_level: None,
        is_charging: None,
        led_count: None,
        design_and_color: None,
    })
}
