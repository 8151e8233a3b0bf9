//! Nostr relay message types.
//!
//! Relay protocol frames as specified in NIP-01:
//! - Client to Relay: EVENT, REQ, CLOSE
//! - Relay to Client: EVENT, OK, EOSE, CLOSED, NOTICE, AUTH

use nostr::Event;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors that can occur when parsing relay messages.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing field: {0}")]
    MissingField(String),
}

/// Messages sent from client to relay.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    /// Publish an event: ["EVENT", <event JSON>]
    Event(Event),

    /// Subscribe to events: ["REQ", <subscription_id>, <filter1>, <filter2>, ...]
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },

    /// Close a subscription: ["CLOSE", <subscription_id>]
    Close { subscription_id: String },
}

impl ClientMessage {
    /// Serialize to JSON array for sending to relay.
    pub fn to_json(&self) -> Result<String, MessageError> {
        let value = match self {
            ClientMessage::Event(event) => serde_json::json!(["EVENT", event]),
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut arr = vec![
                    Value::String("REQ".to_string()),
                    Value::String(subscription_id.clone()),
                ];
                for filter in filters {
                    arr.push(serde_json::to_value(filter)?);
                }
                Value::Array(arr)
            }
            ClientMessage::Close { subscription_id } => {
                serde_json::json!(["CLOSE", subscription_id])
            }
        };
        Ok(value.to_string())
    }
}

/// Messages sent from relay to client.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    /// Event matching a subscription: ["EVENT", <subscription_id>, <event JSON>]
    Event {
        subscription_id: String,
        event: Event,
    },

    /// Command result: ["OK", <event_id>, <true|false>, <message>]
    Ok {
        event_id: String,
        success: bool,
        message: String,
    },

    /// End of stored events: ["EOSE", <subscription_id>]
    Eose { subscription_id: String },

    /// Subscription closed by relay: ["CLOSED", <subscription_id>, <message>]
    Closed {
        subscription_id: String,
        message: String,
    },

    /// Human-readable notice: ["NOTICE", <message>]
    Notice { message: String },

    /// Authentication challenge (NIP-42): ["AUTH", <challenge>]
    Auth { challenge: String },
}

fn string_at(arr: &[Value], index: usize, field: &str) -> Result<String, MessageError> {
    arr.get(index)
        .ok_or_else(|| MessageError::MissingField(field.to_string()))?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| MessageError::InvalidFormat(format!("{} not a string", field)))
}

impl RelayMessage {
    /// Parse a JSON message from the relay.
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        let arr: Vec<Value> =
            serde_json::from_str(json).map_err(|e| MessageError::InvalidFormat(e.to_string()))?;

        let msg_type = arr
            .first()
            .ok_or_else(|| MessageError::InvalidFormat("empty array".to_string()))?
            .as_str()
            .ok_or_else(|| MessageError::InvalidFormat("first element not a string".to_string()))?;

        match msg_type {
            "EVENT" => {
                let subscription_id = string_at(&arr, 1, "subscription_id")?;
                let raw = arr
                    .get(2)
                    .ok_or_else(|| MessageError::MissingField("event".to_string()))?;
                let event: Event = serde_json::from_value(raw.clone())?;
                Ok(RelayMessage::Event {
                    subscription_id,
                    event,
                })
            }
            "OK" => {
                let event_id = string_at(&arr, 1, "event_id")?;
                let success = arr
                    .get(2)
                    .and_then(Value::as_bool)
                    .ok_or_else(|| MessageError::InvalidFormat("success not a boolean".to_string()))?;
                let message = arr.get(3).and_then(Value::as_str).unwrap_or("").to_string();
                Ok(RelayMessage::Ok {
                    event_id,
                    success,
                    message,
                })
            }
            "EOSE" => Ok(RelayMessage::Eose {
                subscription_id: string_at(&arr, 1, "subscription_id")?,
            }),
            "CLOSED" => Ok(RelayMessage::Closed {
                subscription_id: string_at(&arr, 1, "subscription_id")?,
                message: arr.get(2).and_then(Value::as_str).unwrap_or("").to_string(),
            }),
            "NOTICE" => Ok(RelayMessage::Notice {
                message: string_at(&arr, 1, "message")?,
            }),
            "AUTH" => Ok(RelayMessage::Auth {
                challenge: string_at(&arr, 1, "challenge")?,
            }),
            _ => Err(MessageError::UnknownType(msg_type.to_string())),
        }
    }

    /// Subscription this message belongs to, if any.
    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            RelayMessage::Event {
                subscription_id, ..
            }
            | RelayMessage::Eose { subscription_id }
            | RelayMessage::Closed {
                subscription_id, ..
            } => Some(subscription_id),
            _ => None,
        }
    }
}

/// Filter for subscription requests.
///
/// Two filters are equivalent only if structurally identical, so tag
/// constraints are kept in a sorted map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Event IDs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    /// Authors (pubkeys)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    /// Event kinds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    /// Events since timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    /// Events until timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    /// Maximum number of events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// Generic tag queries keyed `#<letter>` (e.g. `#e`, `#h`)
    #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Filter {
    /// Create a new empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by event IDs.
    pub fn ids(mut self, ids: Vec<String>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Filter by authors.
    pub fn authors(mut self, authors: Vec<String>) -> Self {
        self.authors = Some(authors);
        self
    }

    /// Filter by kinds.
    pub fn kinds(mut self, kinds: Vec<u16>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    /// Filter by events since timestamp.
    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    /// Filter by events until timestamp.
    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    /// Limit number of results.
    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// Add a tag filter. The key should be the tag letter (e.g., "e", "p").
    pub fn tag(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.tags.insert(format!("#{}", key.into()), values);
        self
    }

    /// Filter by #e (event reference) tags.
    pub fn event_refs(self, event_ids: Vec<String>) -> Self {
        self.tag("e", event_ids)
    }

    /// Filter by #p (pubkey reference) tags.
    pub fn pubkey_refs(self, pubkeys: Vec<String>) -> Self {
        self.tag("p", pubkeys)
    }

    /// Filter by #t (hashtag) tags.
    pub fn hashtags(self, hashtags: Vec<String>) -> Self {
        self.tag("t", hashtags)
    }

    /// Filter by #h (NIP-29 group) tags.
    pub fn groups(self, group_ids: Vec<String>) -> Self {
        self.tag("h", group_ids)
    }

    /// Filter by #d (addressable identifier) tags.
    pub fn identifiers(self, identifiers: Vec<String>) -> Self {
        self.tag("d", identifiers)
    }

    /// Whether `event` satisfies every constraint except `limit`.
    pub fn matches(&self, event: &Event) -> bool {
        fn contains<T: PartialEq>(list: &Option<Vec<T>>, value: &T) -> bool {
            list.as_ref().is_none_or(|l| l.contains(value))
        }

        contains(&self.ids, &event.id)
            && contains(&self.authors, &event.pubkey)
            && contains(&self.kinds, &event.kind)
            && self.since.is_none_or(|since| event.created_at >= since)
            && self.until.is_none_or(|until| event.created_at <= until)
            && self.tags.iter().all(|(key, values)| {
                let name = key.trim_start_matches('#');
                event.tag_values(name).any(|v| values.iter().any(|w| w == v))
            })
    }
}
