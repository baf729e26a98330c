// Event model
//
// One JSON object per WebSocket text frame or per line of a poll response.
// Unknown fields are ignored and every field has a default, so an `open`
// frame with only `id`, `time`, `event` and `topic` still decodes.

use serde::{Deserialize, Deserializer};

/// Discriminator carried in the `event` field
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Open,
    Keepalive,
    Message,
    PollRequest,
    #[default]
    #[serde(other)]
    Other,
}

/// Attachment metadata; carried but never downloaded
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct Attachment {
    pub name: String,
    #[serde(rename = "type")]
    pub content_type: String,
    pub size: u64,
    pub url: String,
}

/// A single event received from the subscription source
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct Event {
    pub id: String,
    /// Unix seconds as sent on the wire, kept verbatim for the checkpoint
    #[serde(deserialize_with = "raw_scalar")]
    pub time: String,
    #[serde(rename = "event")]
    pub kind: EventKind,
    pub topic: String,
    pub title: String,
    /// Notification body
    pub message: String,
    pub priority: u8,
    pub tags: Vec<String>,
    pub click: String,
    pub icon: String,
    pub attachment: Option<Attachment>,
}

impl Event {
    /// Decode one frame or line
    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }

    /// Only `message` events become notifications
    pub fn is_message(&self) -> bool {
        self.kind == EventKind::Message
    }

    /// Title shown to the user, falling back to the topic name
    pub fn display_title(&self) -> &str {
        if self.title.is_empty() {
            &self.topic
        } else {
            &self.title
        }
    }
}

/// Which producer handed an event to the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    Live,
    GapFill,
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventSource::Live => write!(f, "live"),
            EventSource::GapFill => write!(f, "gap_fill"),
        }
    }
}

/// An event tagged with its producer, as carried on the event channel
#[derive(Debug, Clone)]
pub struct Inbound {
    pub source: EventSource,
    pub event: Event,
}

/// Accept `1700000000`, `"1700000000"` or `null` and keep the textual form
fn raw_scalar<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s,
        serde_json::Value::Number(n) => n.to_string(),
        other => return Err(serde::de::Error::custom(format!("invalid time: {other}"))),
    })
}
