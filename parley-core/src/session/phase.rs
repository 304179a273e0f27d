//! Conversation phases

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle stage of a session.
///
/// Ordering follows the only legal direction of travel:
/// `Qa < Followup < Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    /// Metered questions are accepted
    Qa,
    /// Exactly one free-form closing answer is accepted
    Followup,
    /// Terminal
    Done,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Qa => "QA",
            Phase::Followup => "FOLLOWUP",
            Phase::Done => "DONE",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Phase::Done
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
