//! Wire format: JSON envelopes of the form `{"type": ..., "payload": ...}`.
//!
//! There is no schema versioning. Receivers ignore `type` values they do
//! not know.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::session::Phase;

pub const SUSPECT: &str = "SUSPECT";

pub const BREAKING_NEWS: &str = "Breaking news event!";

/// Accusing user id -> accused user id.
pub type Accusations = HashMap<String, String>;

/// Untyped envelope. Inbound frames are decoded through this first so an
/// unknown `type` can be told apart from a malformed frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

/// Messages a client may send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Suspect { target: String },
}

#[derive(Debug, Deserialize)]
struct SuspectPayload {
    target: String,
}

impl ClientMessage {
    /// `Ok(None)` for a well-formed envelope with an unrecognised type.
    pub fn decode(raw: &str) -> Result<Option<Self>, serde_json::Error> {
        let packet: Packet = serde_json::from_str(raw)?;

        match packet.kind.as_str() {
            SUSPECT => {
                let payload: SuspectPayload = serde_json::from_value(packet.payload)?;
                Ok(Some(ClientMessage::Suspect {
                    target: payload.target,
                }))
            }
            _ => Ok(None),
        }
    }
}

/// Messages the server pushes to every participant of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerMessage {
    #[serde(rename = "TICK")]
    Tick {
        phase: Phase,
        elapsed: f64,
        remaining: f64,
        accusations: Accusations,
    },
    #[serde(rename = "EVENT_NEWS")]
    EventNews { message: String, phase: Phase },
    #[serde(rename = "GAME_OVER")]
    GameOver {
        /// Sent as `""` when nobody was accused.
        #[serde(serialize_with = "none_as_empty")]
        winner_id: Option<String>,
        accusations: Accusations,
    },
}

impl ServerMessage {
    pub fn breaking_news(phase: Phase) -> Self {
        ServerMessage::EventNews {
            message: BREAKING_NEWS.to_string(),
            phase,
        }
    }
}

fn none_as_empty<S: serde::Serializer>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(value.as_deref().unwrap_or(""))
}
