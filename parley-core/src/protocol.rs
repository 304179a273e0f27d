//! Wire protocol: inbound envelopes, outbound events and room frames
//!
//! Every frame is a JSON text message. Phased sessions exchange objects
//! discriminated by a `type` tag; the room variant exchanges bare
//! `{name, text}` objects stamped with a timestamp on the way out.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::LimitsConfig;
use crate::session::StateSnapshot;
use crate::utils::{cap_chars, epoch_secs_f64};

/// Upper bound for preset question ids
const MAX_QID_CHARS: usize = 64;

/// Name used for server-originated room notices
pub const SYSTEM_NAME: &str = "SYSTEM";

/// Name used when a room client sends none
pub const DEFAULT_ROOM_NAME: &str = "guest";

/// Typed client envelope.
///
/// `sid` is informational; the session bound at upgrade time is
/// authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Hello {
        #[serde(default)]
        sid: Option<String>,
        #[serde(default)]
        name: Option<String>,
    },
    UserMessage {
        #[serde(default)]
        sid: Option<String>,
        #[serde(default)]
        text: String,
    },
    FollowupAnswer {
        #[serde(default)]
        sid: Option<String>,
        #[serde(default)]
        text: String,
    },
    Question {
        #[serde(default)]
        sid: Option<String>,
        #[serde(default)]
        qid: String,
    },
    Exit {
        #[serde(default)]
        sid: Option<String>,
    },
}

impl Envelope {
    pub fn sid(&self) -> Option<&str> {
        match self {
            Envelope::Hello { sid, .. }
            | Envelope::UserMessage { sid, .. }
            | Envelope::FollowupAnswer { sid, .. }
            | Envelope::Question { sid, .. }
            | Envelope::Exit { sid } => sid.as_deref(),
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Envelope::Hello { .. } => "hello",
            Envelope::UserMessage { .. } => "user_message",
            Envelope::FollowupAnswer { .. } => "followup_answer",
            Envelope::Question { .. } => "question",
            Envelope::Exit { .. } => "exit",
        }
    }

    fn apply_limits(mut self, limits: &LimitsConfig) -> Self {
        match &mut self {
            Envelope::Hello { name, .. } => {
                if let Some(n) = name.as_mut() {
                    *n = cap_chars(n.trim(), limits.max_name_chars);
                }
            }
            Envelope::UserMessage { text, .. } | Envelope::FollowupAnswer { text, .. } => {
                *text = cap_chars(text, limits.max_text_chars);
            }
            Envelope::Question { qid, .. } => {
                *qid = cap_chars(qid.trim(), MAX_QID_CHARS);
            }
            Envelope::Exit { .. } => {}
        }
        self
    }
}

/// Result of decoding one inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A well-formed envelope with a known tag
    Envelope(Envelope),
    /// Well-formed JSON with a `type` this server does not handle
    Unknown { tag: String },
    /// Anything else, treated as free text (capped)
    Raw(String),
}

impl Inbound {
    /// Decode a frame. Never fails: malformed input degrades to [`Inbound::Raw`].
    pub fn parse(frame: &str, limits: &LimitsConfig) -> Self {
        let raw = || Inbound::Raw(cap_chars(frame, limits.max_text_chars));

        let Ok(value) = serde_json::from_str::<Value>(frame) else {
            return raw();
        };
        let Some(tag) = value.get("type").and_then(Value::as_str).map(str::to_owned) else {
            return raw();
        };

        match serde_json::from_value::<Envelope>(value) {
            Ok(envelope) => Inbound::Envelope(envelope.apply_limits(limits)),
            Err(_) if !is_known_tag(&tag) => Inbound::Unknown {
                tag: cap_chars(&tag, MAX_QID_CHARS),
            },
            Err(_) => raw(),
        }
    }
}

fn is_known_tag(tag: &str) -> bool {
    matches!(
        tag,
        "hello" | "user_message" | "followup_answer" | "question" | "exit"
    )
}

/// Server to client event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    /// Assistant/system text shown in the transcript
    Ai { text: String },
    /// Authoritative session state
    State(StateSnapshot),
    /// Generating indicator
    Typing { on: bool },
}

impl OutboundEvent {
    pub fn ai(text: impl Into<String>) -> Self {
        OutboundEvent::Ai { text: text.into() }
    }
}

/// One room chat line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMessage {
    /// Seconds since the Unix epoch
    pub ts: f64,
    pub name: String,
    pub text: String,
}

impl RoomMessage {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            ts: epoch_secs_f64(),
            name: name.into(),
            text: text.into(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(SYSTEM_NAME, text)
    }

    /// Decode a client frame. Returns `None` when there is nothing to say.
    pub fn from_frame(frame: &str, limits: &LimitsConfig) -> Option<Self> {
        let (name, text) = match serde_json::from_str::<Value>(frame) {
            Ok(Value::Object(map)) => {
                let name = map
                    .get("name")
                    .map(value_to_text)
                    .map(|n| n.trim().to_string())
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| DEFAULT_ROOM_NAME.to_string());
                let text = map.get("text").map(value_to_text).unwrap_or_default();
                (name, text)
            }
            _ => (DEFAULT_ROOM_NAME.to_string(), frame.to_string()),
        };

        let text = cap_chars(&text, limits.room_text_chars);
        if text.trim().is_empty() {
            return None;
        }
        Some(Self::new(cap_chars(&name, limits.max_name_chars), text))
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
