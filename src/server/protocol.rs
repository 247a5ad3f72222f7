//! Protocol message definitions
//!
//! Defines the JSON messages exchanged between clients and the relay.
//! All messages are tagged with a `type` field, spelled in the dashboard
//! clients' SCREAMING_SNAKE_CASE convention.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use thiserror::Error;

/// Message kinds this relay handles
const KNOWN_KINDS: [&str; 2] = ["JOIN_ROOM", "MEAL_SCANNED"];

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid message: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("JSON serialization error: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Event id {0:?} is not an integer")]
    NonNumericEventId(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Event Identifiers
// ============================================================================

/// Event identifier as supplied by the client
///
/// The wire accepts both string and number forms; both normalize to the
/// string form, which is what group names and replies carry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct EventId(String);

impl EventId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The integer form used by the scan fan-out payload
    pub fn to_int(&self) -> ProtocolResult<i64> {
        self.0
            .parse()
            .map_err(|_| ProtocolError::NonNumericEventId(self.0.clone()))
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for EventId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct EventIdVisitor;

        impl Visitor<'_> for EventIdVisitor {
            type Value = EventId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string or number event id")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<EventId, E> {
                Ok(EventId(v.to_string()))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<EventId, E> {
                Ok(EventId(v.to_string()))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<EventId, E> {
                Ok(EventId(v.to_string()))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<EventId, E> {
                Ok(EventId(v.to_string()))
            }
        }

        deserializer.deserialize_any(EventIdVisitor)
    }
}

// ============================================================================
// Client Messages
// ============================================================================

/// Messages sent from client to relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// Join the broadcast group for an event
    JoinRoom {
        /// Event whose updates this connection wants
        event_id: EventId,
        /// Kind of client joining (scanner, dashboard, ...)
        client_type: String,
    },

    /// Report a meal scan for relay to the joined event's group
    MealScanned {
        /// Which meal was scanned
        meal_type: String,
        /// Updated count for that meal
        new_count: i64,
        /// Client-side timestamp of the scan
        timestamp: String,
    },
}

/// Outcome of decoding one inbound text frame
#[derive(Debug, PartialEq)]
pub enum Decoded {
    /// A message kind this relay handles
    Message(ClientMessage),
    /// Well-formed JSON carrying a kind this relay does not handle
    Unknown(String),
}

impl ClientMessage {
    /// Decode one inbound text frame.
    ///
    /// A well-formed object whose `type` names no known kind is reported as
    /// [`Decoded::Unknown`] so the caller can ignore it; everything else that
    /// fails to decode is a parse error.
    pub fn decode(text: &str) -> ProtocolResult<Decoded> {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => Ok(Decoded::Message(message)),
            Err(err) => {
                if let Ok(serde_json::Value::Object(object)) = serde_json::from_str(text) {
                    match object.get("type").and_then(serde_json::Value::as_str) {
                        Some(kind) if !KNOWN_KINDS.contains(&kind) => {
                            return Ok(Decoded::Unknown(kind.to_string()));
                        }
                        _ => {}
                    }
                }
                Err(ProtocolError::Parse(err))
            }
        }
    }

    /// Serialize the message to JSON
    pub fn encode(&self) -> ProtocolResult<String> {
        serde_json::to_string(self).map_err(ProtocolError::Serialize)
    }

    /// Create a JoinRoom message
    pub fn join_room(event_id: impl Into<String>, client_type: impl Into<String>) -> Self {
        ClientMessage::JoinRoom {
            event_id: EventId::new(event_id),
            client_type: client_type.into(),
        }
    }

    /// Create a MealScanned message
    pub fn meal_scanned(
        meal_type: impl Into<String>,
        new_count: i64,
        timestamp: impl Into<String>,
    ) -> Self {
        ClientMessage::MealScanned {
            meal_type: meal_type.into(),
            new_count,
            timestamp: timestamp.into(),
        }
    }
}

// ============================================================================
// Server Messages
// ============================================================================

/// Messages sent from relay to client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    /// Greeting sent as soon as the connection is accepted
    Connected {
        /// Human-readable greeting
        message: String,
        /// Echo of the `event_id` query parameter, null when absent
        event_id: Option<String>,
    },

    /// Confirmation that the connection joined an event group
    RoomJoinSuccess {
        /// Event whose group was joined
        event_id: EventId,
        /// Echo of the client's self-description
        client_type: String,
        /// Human-readable confirmation
        message: String,
    },

    /// Fan-out of a scan to every member of the event group
    MealScanned {
        meal_type: String,
        new_count: i64,
        /// Joined event id, as an integer
        event_id: i64,
        timestamp: String,
    },

    /// Something about the last inbound message failed
    Error {
        /// Error description
        message: String,
    },
}

impl ServerMessage {
    /// Serialize the message to JSON
    pub fn encode(&self) -> ProtocolResult<String> {
        serde_json::to_string(self).map_err(ProtocolError::Serialize)
    }

    /// Create the Connected greeting
    pub fn connected(event_id: Option<String>) -> Self {
        ServerMessage::Connected {
            message: "WebSocket connection established".to_string(),
            event_id,
        }
    }

    /// Create a RoomJoinSuccess confirmation
    pub fn room_join_success(event_id: EventId, client_type: impl Into<String>) -> Self {
        let client_type = client_type.into();
        let message = format!("{client_type} joined event {event_id}");
        ServerMessage::RoomJoinSuccess {
            event_id,
            client_type,
            message,
        }
    }

    /// Create a MealScanned fan-out message
    pub fn meal_scanned(
        meal_type: impl Into<String>,
        new_count: i64,
        event_id: i64,
        timestamp: impl Into<String>,
    ) -> Self {
        ServerMessage::MealScanned {
            meal_type: meal_type.into(),
            new_count,
            event_id,
            timestamp: timestamp.into(),
        }
    }

    /// Create an Error message
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

// ============================================================================
// Conversion Traits
// ============================================================================

impl From<ProtocolError> for ServerMessage {
    fn from(err: ProtocolError) -> Self {
        ServerMessage::error(err.to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================
