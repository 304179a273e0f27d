//! Event recorder
//!
//! An append-only sink for conversation events and follow-up answers.
//! Recording is fire-and-forget: implementations log their own failures
//! and never surface them to the conversation.

mod file;
mod memory;

pub use file::FileRecorder;
pub use memory::{MemoryRecorder, NullRecorder};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::RecorderConfig;
use crate::session::Phase;

/// Something worth keeping a record of
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RecordEvent {
    Connect {
        session_id: String,
        client_addr: String,
    },
    Disconnect {
        session_id: String,
        client_addr: String,
    },
    MessageReceived {
        session_id: String,
        kind: String,
        chars: usize,
    },
    QuotaIncrement {
        session_id: String,
        questions_asked: u32,
        max_questions: u32,
    },
    PhaseChange {
        session_id: String,
        from: Phase,
        to: Phase,
        reason: String,
    },
    BackendFailure {
        session_id: String,
        error: String,
    },
    FollowupAnswer {
        session_id: String,
        chars: usize,
    },
    Malformed {
        session_id: String,
        chars: usize,
    },
    Unknown {
        session_id: String,
        tag: String,
    },
    /// Input refused without touching session state
    Rejected {
        session_id: String,
        fault: String,
    },
}

impl RecordEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            RecordEvent::Connect { .. } => "connect",
            RecordEvent::Disconnect { .. } => "disconnect",
            RecordEvent::MessageReceived { .. } => "message_received",
            RecordEvent::QuotaIncrement { .. } => "quota_increment",
            RecordEvent::PhaseChange { .. } => "phase_change",
            RecordEvent::BackendFailure { .. } => "backend_failure",
            RecordEvent::FollowupAnswer { .. } => "followup_answer",
            RecordEvent::Malformed { .. } => "malformed",
            RecordEvent::Unknown { .. } => "unknown",
            RecordEvent::Rejected { .. } => "rejected",
        }
    }
}

/// One follow-up answer, stored as a CSV row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowupRow {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub client_addr: String,
    pub text: String,
}

impl FollowupRow {
    pub fn new(
        session_id: impl Into<String>,
        client_addr: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            session_id: session_id.into(),
            client_addr: client_addr.into(),
            text: text.into(),
        }
    }
}

/// Append-only event sink
pub trait EventRecorder: Send + Sync {
    fn record(&self, event: RecordEvent);

    fn record_followup(&self, row: FollowupRow);
}

/// Build the recorder described by `config`
pub fn from_config(config: &RecorderConfig) -> crate::Result<Arc<dyn EventRecorder>> {
    if !config.enabled {
        return Ok(Arc::new(NullRecorder));
    }
    let recorder = FileRecorder::open(&config.dir, &config.events_file, &config.followup_file)
        .map_err(|e| crate::Error::Recorder(format!("{}: {}", config.dir, e)))?;
    Ok(Arc::new(recorder))
}
