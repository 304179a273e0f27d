//! Session data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use super::phase::Phase;

/// Per-session quota and deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub max_questions: u32,
    pub time_limit: Duration,
}

impl SessionLimits {
    pub fn new(max_questions: u32, time_limit: Duration) -> Self {
        Self {
            max_questions,
            time_limit,
        }
    }
}

impl From<&crate::config::SessionConfig> for SessionLimits {
    fn from(config: &crate::config::SessionConfig) -> Self {
        Self::new(
            config.max_questions,
            Duration::from_secs(config.time_limit_secs),
        )
    }
}

/// Point-in-time view of a session sent to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub phase: Phase,
    pub remaining_questions: u32,
    pub remaining_seconds: u64,
}

/// A conversation session
#[derive(Debug, Clone)]
pub struct Session {
    /// Session identifier
    pub id: String,
    /// Wall-clock creation time
    pub created_at: DateTime<Utc>,
    /// Display name announced by the client
    pub name: Option<String>,
    limits: SessionLimits,
    started: Instant,
    last_active: Instant,
    questions_asked: u32,
    phase: Phase,
    awaiting_reply: bool,
    messages: Vec<ChatMessage>,
}

impl Session {
    /// Create a new session in `QA` whose clock starts at `now`
    pub fn new(id: impl Into<String>, limits: SessionLimits, now: Instant) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
            name: None,
            limits,
            started: now,
            last_active: now,
            questions_asked: 0,
            phase: Phase::Qa,
            awaiting_reply: false,
            messages: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn limits(&self) -> SessionLimits {
        self.limits
    }

    /// Move forward to `to`.
    ///
    /// Returns `Ok(true)` when the phase changed and `Ok(false)` when the
    /// session was already there. A backward move is rejected and leaves the
    /// phase untouched.
    pub fn advance(&mut self, to: Phase) -> crate::Result<bool> {
        if to < self.phase {
            return Err(crate::Error::PhaseRegression {
                from: self.phase,
                to,
            });
        }
        if to == self.phase {
            return Ok(false);
        }
        self.phase = to;
        Ok(true)
    }

    pub fn questions_asked(&self) -> u32 {
        self.questions_asked
    }

    pub fn remaining_questions(&self) -> u32 {
        self.limits.max_questions.saturating_sub(self.questions_asked)
    }

    pub fn quota_exhausted(&self) -> bool {
        self.questions_asked >= self.limits.max_questions
    }

    /// Count one metered question. Refuses once the quota is used up.
    pub fn consume_question(&mut self) -> bool {
        if self.quota_exhausted() {
            return false;
        }
        self.questions_asked += 1;
        true
    }

    /// Saturates at the latest representable instant instead of overflowing
    pub fn deadline(&self) -> Instant {
        self.started
            .checked_add(self.limits.time_limit)
            .unwrap_or_else(|| far_future(self.started))
    }

    /// Time left before the deadline, floored at zero
    pub fn remaining_time(&self, now: Instant) -> Duration {
        self.deadline().saturating_duration_since(now)
    }

    /// Remaining whole seconds, rounded up so a fresh session reports the
    /// full limit
    pub fn remaining_seconds(&self, now: Instant) -> u64 {
        let remaining = self.remaining_time(now);
        let secs = remaining.as_secs();
        if remaining.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.remaining_time(now).is_zero()
    }

    pub fn snapshot(&self, now: Instant) -> StateSnapshot {
        StateSnapshot {
            phase: self.phase,
            remaining_questions: self.remaining_questions(),
            remaining_seconds: self.remaining_seconds(now),
        }
    }

    pub fn touch(&mut self, now: Instant) {
        if now > self.last_active {
            self.last_active = now;
        }
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    pub fn is_awaiting_reply(&self) -> bool {
        self.awaiting_reply
    }

    /// Mark a generation as in flight. Returns `false` if one already is.
    pub fn begin_reply(&mut self) -> bool {
        if self.awaiting_reply {
            return false;
        }
        self.awaiting_reply = true;
        true
    }

    pub fn finish_reply(&mut self) {
        self.awaiting_reply = false;
    }

    /// Add a message to the session
    pub fn add_message(&mut self, role: impl Into<String>, content: impl Into<String>) {
        self.messages.push(ChatMessage::new(role, content));
    }

    /// Append one question/answer exchange
    pub fn add_exchange(&mut self, question: impl Into<String>, answer: impl Into<String>) {
        self.add_message("user", question);
        self.add_message("assistant", answer);
    }

    /// Most recent `max_messages` messages, oldest first
    pub fn get_history(&self, max_messages: usize) -> Vec<ChatMessage> {
        let start = self.messages.len().saturating_sub(max_messages);
        self.messages[start..].to_vec()
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }
}

/// A chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message role (user, assistant, system)
    pub role: String,
    /// Message content
    pub content: String,
    /// Message timestamp
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// Create a new chat message
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

fn far_future(from: Instant) -> Instant {
    let mut offset = Duration::MAX;
    while !offset.is_zero() {
        if let Some(at) = from.checked_add(offset) {
            return at;
        }
        offset /= 2;
    }
    from
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> SessionLimits {
        SessionLimits::new(3, Duration::from_secs(180))
    }

    #[test]
    fn test_new_session_starts_in_qa_with_full_budget() {
        let now = Instant::now();
        let session = Session::new("s1", limits(), now);
        assert_eq!(session.phase(), Phase::Qa);
        assert_eq!(
            session.snapshot(now),
            StateSnapshot {
                phase: Phase::Qa,
                remaining_questions: 3,
                remaining_seconds: 180,
            }
        );
    }

    #[test]
    fn test_advance_is_monotonic() {
        let mut session = Session::new("s1", limits(), Instant::now());
        assert!(session.advance(Phase::Followup).unwrap());
        assert!(!session.advance(Phase::Followup).unwrap());

        let err = session.advance(Phase::Qa).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::PhaseRegression {
                from: Phase::Followup,
                to: Phase::Qa
            }
        ));
        assert_eq!(session.phase(), Phase::Followup);

        assert!(session.advance(Phase::Done).unwrap());
        assert!(session.advance(Phase::Followup).is_err());
        assert_eq!(session.phase(), Phase::Done);
    }

    #[test]
    fn test_skip_straight_to_done() {
        let mut session = Session::new("s1", limits(), Instant::now());
        assert!(session.advance(Phase::Done).unwrap());
    }

    #[test]
    fn test_question_counter_never_exceeds_max() {
        let mut session = Session::new("s1", limits(), Instant::now());
        assert!(session.consume_question());
        assert!(session.consume_question());
        assert!(session.consume_question());
        assert!(!session.consume_question());
        assert_eq!(session.questions_asked(), 3);
        assert_eq!(session.remaining_questions(), 0);
        assert!(session.quota_exhausted());
    }

    #[test]
    fn test_remaining_time_floors_at_zero_and_never_increases() {
        let start = Instant::now();
        let session = Session::new("s1", limits(), start);

        let mut previous = session.remaining_time(start);
        for step in [1u64, 30, 90, 179, 180, 500] {
            let remaining = session.remaining_time(start + Duration::from_secs(step));
            assert!(remaining <= previous);
            previous = remaining;
        }
        assert_eq!(previous, Duration::ZERO);
        assert!(session.is_expired(start + Duration::from_secs(180)));
        assert_eq!(session.remaining_seconds(start + Duration::from_secs(900)), 0);
    }

    #[test]
    fn test_oversized_time_limit_saturates() {
        let start = Instant::now();
        let session = Session::new("s1", SessionLimits::new(3, Duration::MAX), start);

        assert!(session.deadline() > start);
        assert!(!session.is_expired(start + Duration::from_secs(86_400)));
        assert!(session.remaining_seconds(start) > 0);
        assert_eq!(session.snapshot(start).phase, Phase::Qa);
    }

    #[test]
    fn test_remaining_seconds_rounds_up() {
        let start = Instant::now();
        let session = Session::new("s1", limits(), start);
        let now = start + Duration::from_millis(1500);
        assert_eq!(session.remaining_seconds(now), 179);
        let now = start + Duration::from_millis(10);
        assert_eq!(session.remaining_seconds(now), 180);
    }

    #[test]
    fn test_awaiting_reply_flag() {
        let mut session = Session::new("s1", limits(), Instant::now());
        assert!(session.begin_reply());
        assert!(!session.begin_reply());
        session.finish_reply();
        assert!(!session.is_awaiting_reply());
    }

    #[test]
    fn test_get_history() {
        let mut session = Session::new("s1", limits(), Instant::now());
        for i in 0..30 {
            session.add_exchange(format!("q{}", i), format!("a{}", i));
        }

        let history = session.get_history(12);
        assert_eq!(history.len(), 12);
        assert_eq!(history[0].content, "q24");
        assert_eq!(history[11].content, "a29");
    }

    #[test]
    fn test_snapshot_wire_shape() {
        let snapshot = StateSnapshot {
            phase: Phase::Followup,
            remaining_questions: 0,
            remaining_seconds: 42,
        };
        let value = serde_json::to_value(snapshot).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"phase": "FOLLOWUP", "remainingQuestions": 0, "remainingSeconds": 42})
        );
    }
}
