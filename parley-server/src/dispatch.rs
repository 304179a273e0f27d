//! Per-connection dispatch loop for phased sessions.
//!
//! The loop is the only writer of its session. Each inbound frame runs
//! through the phase machine inside a short synchronous critical section;
//! slow generation calls are handed to the bridge and their results come
//! back through the same `select!` as client frames, so a connection never
//! blocks while a reply is pending.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use parley_agent::{GenerationError, GenerationRequest, PendingReply};
use parley_core::protocol::{Envelope, Inbound, OutboundEvent};
use parley_core::recorder::{FollowupRow, RecordEvent};
use parley_core::session::{Phase, SharedSession};
use parley_core::utils::truncate;

use crate::connection::ClientConnection;
use crate::state::AppState;

pub const FOLLOWUP_PROMPT: &str = "That was the last question. Before you go, please tell us in \
                                   one message what you thought of this conversation.";
pub const TERMINAL_NOTICE: &str = "This session has ended. Thank you for visiting!";
pub const DEADLINE_NOTICE: &str = "Time is up, so this session has ended. Thank you for visiting!";
pub const NOT_AVAILABLE: &str = "That question is not available.";
pub const BUSY_NOTICE: &str = "Please wait for the current answer before sending more.";
pub const EMPTY_QUESTION: &str = "Please type a question first.";
pub const EMPTY_ANSWER: &str = "Please write your answer before sending it.";
pub const QUESTIONS_OPEN: &str = "You still have questions left. Please ask them first.";
pub const UNSUPPORTED: &str = "Sorry, that kind of message is not supported.";
pub const APOLOGY: &str = "Sorry, I couldn't come up with an answer just now.";
pub const CLOSING: &str = "Thank you, your answer has been recorded. Goodbye!";
pub const GOODBYE: &str = "Goodbye! This session has ended.";

/// Ways an interaction can go wrong. Each is turned into a notice for the
/// client plus a record; none of them end the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DispatchFault {
    #[error("malformed envelope")]
    MalformedEnvelope,
    #[error("action not allowed in the current phase")]
    PhaseViolation,
    #[error("question quota exhausted")]
    QuotaExceeded,
    #[error("session deadline exceeded")]
    DeadlineExceeded,
    #[error("generation failed")]
    GenerationFailure,
    #[error("connection lost")]
    ConnectionLost,
    #[error("unknown envelope")]
    UnknownEnvelope,
    #[error("a reply is still pending")]
    Busy,
}

impl DispatchFault {
    pub fn as_str(self) -> &'static str {
        match self {
            DispatchFault::MalformedEnvelope => "malformed_envelope",
            DispatchFault::PhaseViolation => "phase_violation",
            DispatchFault::QuotaExceeded => "quota_exceeded",
            DispatchFault::DeadlineExceeded => "deadline_exceeded",
            DispatchFault::GenerationFailure => "generation_failure",
            DispatchFault::ConnectionLost => "connection_lost",
            DispatchFault::UnknownEnvelope => "unknown_envelope",
            DispatchFault::Busy => "busy",
        }
    }
}

/// How a dispatch loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The server finished the session and wants the socket closed
    Closed,
    /// The client went away
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

struct InFlight {
    reply: PendingReply,
    question: String,
}

enum AskDecision {
    Ended,
    InFollowup,
    Busy,
    Empty,
    ForcedFollowup,
    Dispatch(GenerationRequest),
}

enum AnswerDecision {
    Ended,
    QuestionsOpen,
    Busy,
    Empty,
    Accepted,
}

/// Drives one phased connection
pub struct SessionDispatcher {
    state: AppState,
    session: SharedSession,
    sid: String,
    conn: Arc<ClientConnection>,
    pending: Option<InFlight>,
}

impl SessionDispatcher {
    pub fn new(state: AppState, sid: String, conn: Arc<ClientConnection>) -> Self {
        let session = state.sessions.get_or_create(&sid);
        Self {
            state,
            session,
            sid,
            conn,
            pending: None,
        }
    }

    /// Serve frames until the client leaves or the session closes
    pub async fn run<S>(mut self, inbound: S) -> SessionEnd
    where
        S: Stream<Item = String>,
    {
        let mut inbound = std::pin::pin!(inbound);
        let mut resync = resync_interval(self.state.config.session.state_resync_secs);

        info!(session = %self.sid, peer = %self.conn.peer, "Session connected");
        self.record(RecordEvent::Connect {
            session_id: self.sid.clone(),
            client_addr: self.conn.peer.clone(),
        });

        let end = loop {
            tokio::select! {
                biased;
                result = wait_reply(&mut self.pending), if self.pending.is_some() => {
                    if let Some(inflight) = self.pending.take() {
                        if self.complete_reply(inflight.question, result) == Flow::Close {
                            break SessionEnd::Closed;
                        }
                    }
                }
                frame = inbound.next() => {
                    let Some(frame) = frame else {
                        break SessionEnd::Disconnected;
                    };
                    if self.handle_frame(&frame) == Flow::Close {
                        break SessionEnd::Closed;
                    }
                }
                _ = next_tick(&mut resync) => {
                    if self.resync() == Flow::Close {
                        break SessionEnd::Closed;
                    }
                }
            }
        };

        self.finish(end);
        end
    }

    fn handle_frame(&mut self, frame: &str) -> Flow {
        let now = Instant::now();
        let config = Arc::clone(&self.state.config);
        let inbound = Inbound::parse(frame, &config.limits);

        self.record(RecordEvent::MessageReceived {
            session_id: self.sid.clone(),
            kind: inbound_kind(&inbound).to_string(),
            chars: frame.chars().count(),
        });
        self.session.lock().touch(now);

        if let Inbound::Envelope(envelope) = &inbound {
            if let Some(claimed) = envelope.sid() {
                if claimed != self.sid {
                    debug!(
                        session = %self.sid,
                        claimed = %claimed,
                        "Envelope sid differs from connection session; using connection session"
                    );
                }
            }
        }

        if self.expire_if_due(now) {
            return Flow::Close;
        }

        match inbound {
            Inbound::Raw(text) => {
                debug!(session = %self.sid, fault = %DispatchFault::MalformedEnvelope, "Treating frame as text");
                self.record(RecordEvent::Malformed {
                    session_id: self.sid.clone(),
                    chars: text.chars().count(),
                });
                self.ask(text, now)
            }
            Inbound::Unknown { tag } => {
                self.record(RecordEvent::Unknown {
                    session_id: self.sid.clone(),
                    tag,
                });
                self.reject(DispatchFault::UnknownEnvelope, UNSUPPORTED, now);
                Flow::Continue
            }
            Inbound::Envelope(envelope) => match envelope {
                Envelope::Hello { name, .. } => self.hello(name, now),
                Envelope::UserMessage { text, .. } => self.ask(text, now),
                Envelope::Question { qid, .. } => match config.session.presets.get(&qid) {
                    Some(question) => self.ask(question.clone(), now),
                    None => {
                        self.send(OutboundEvent::ai(NOT_AVAILABLE));
                        self.send_state(now);
                        Flow::Continue
                    }
                },
                Envelope::FollowupAnswer { text, .. } => self.answer(text, now),
                Envelope::Exit { .. } => self.exit(now),
            },
        }
    }

    fn hello(&mut self, name: Option<String>, now: Instant) -> Flow {
        let (phase, greeting) = {
            let mut session = self.session.lock();
            if let Some(name) = name.filter(|n| !n.is_empty()) {
                session.name = Some(name);
            }
            let greeting = greeting(
                session.name.as_deref(),
                session.remaining_questions(),
                session.remaining_seconds(now),
            );
            (session.phase(), greeting)
        };

        match phase {
            Phase::Qa => self.send(OutboundEvent::ai(greeting)),
            Phase::Followup => self.send(OutboundEvent::ai(FOLLOWUP_PROMPT)),
            Phase::Done => return self.terminal(now),
        }
        self.send_state(now);
        Flow::Continue
    }

    /// A metered question: free text, raw text or a known preset
    fn ask(&mut self, text: String, now: Instant) -> Flow {
        let history_turns = self.state.bridge.context().history_turns();
        let decision = {
            let mut session = self.session.lock();
            match session.phase() {
                Phase::Done => AskDecision::Ended,
                Phase::Followup => AskDecision::InFollowup,
                Phase::Qa if self.pending.is_some() || session.is_awaiting_reply() => {
                    AskDecision::Busy
                }
                Phase::Qa if text.trim().is_empty() => AskDecision::Empty,
                Phase::Qa if session.quota_exhausted() => {
                    match session.advance(Phase::Followup) {
                        Ok(_) => AskDecision::ForcedFollowup,
                        Err(e) => {
                            warn!(session = %self.sid, "Forced transition failed: {}", e);
                            AskDecision::InFollowup
                        }
                    }
                }
                Phase::Qa => {
                    session.begin_reply();
                    AskDecision::Dispatch(GenerationRequest {
                        session_id: self.sid.clone(),
                        history: session.get_history(history_turns),
                        text: text.clone(),
                        visitor_name: session.name.clone(),
                    })
                }
            }
        };

        match decision {
            AskDecision::Ended => return self.terminal(now),
            AskDecision::InFollowup => {
                self.reject(DispatchFault::PhaseViolation, FOLLOWUP_PROMPT, now)
            }
            AskDecision::Busy => self.reject(DispatchFault::Busy, BUSY_NOTICE, now),
            AskDecision::Empty => {
                self.send(OutboundEvent::ai(EMPTY_QUESTION));
                self.send_state(now);
            }
            AskDecision::ForcedFollowup => {
                debug!(session = %self.sid, fault = %DispatchFault::QuotaExceeded, "Forcing follow-up");
                self.record_phase_change(Phase::Qa, Phase::Followup, "quota");
                self.send(OutboundEvent::ai(FOLLOWUP_PROMPT));
                self.send_state(now);
            }
            AskDecision::Dispatch(request) => {
                debug!(session = %self.sid, question = %truncate(&text, 80), "Dispatching question");
                self.send(OutboundEvent::Typing { on: true });
                let reply = self.state.bridge.dispatch(request);
                self.pending = Some(InFlight {
                    reply,
                    question: text,
                });
            }
        }
        Flow::Continue
    }

    fn complete_reply(&mut self, question: String, result: Result<String, GenerationError>) -> Flow {
        let now = Instant::now();
        if matches!(result, Err(ref e) if e.is_cancelled()) {
            self.session.lock().finish_reply();
            self.send(OutboundEvent::Typing { on: false });
            return Flow::Continue;
        }

        let late = {
            let mut session = self.session.lock();
            let late = !session.phase().is_terminal() && session.is_expired(now);
            if late {
                session.finish_reply();
            }
            late
        };
        if late {
            debug!(session = %self.sid, "Dropping reply that arrived after the deadline");
            self.send(OutboundEvent::Typing { on: false });
            return if self.expire_if_due(now) {
                Flow::Close
            } else {
                Flow::Continue
            };
        }

        let (reply, failure) = match result {
            Ok(reply) => (reply, None),
            Err(e) => (APOLOGY.to_string(), Some(e.to_string())),
        };
        let count_failures = self.state.config.session.count_failed_generations;

        let outcome = {
            let mut session = self.session.lock();
            session.finish_reply();
            if session.phase() != Phase::Qa {
                None
            } else {
                if failure.is_none() {
                    session.add_exchange(question.as_str(), reply.as_str());
                }
                let counted =
                    (failure.is_none() || count_failures) && session.consume_question();
                let moved = session.quota_exhausted()
                    && session.advance(Phase::Followup).unwrap_or(false);
                Some((
                    counted,
                    session.questions_asked(),
                    session.limits().max_questions,
                    moved,
                ))
            }
        };

        if let Some(error) = failure {
            warn!(session = %self.sid, fault = %DispatchFault::GenerationFailure, "Generation failed: {}", error);
            self.record(RecordEvent::BackendFailure {
                session_id: self.sid.clone(),
                error,
            });
        }

        self.send(OutboundEvent::Typing { on: false });

        let Some((counted, questions_asked, max_questions, moved)) = outcome else {
            debug!(session = %self.sid, "Discarding reply for a session that moved on");
            self.send_state(now);
            return Flow::Continue;
        };

        if counted {
            self.record(RecordEvent::QuotaIncrement {
                session_id: self.sid.clone(),
                questions_asked,
                max_questions,
            });
        }
        if moved {
            self.record_phase_change(Phase::Qa, Phase::Followup, "quota");
            self.send(OutboundEvent::ai(format!("{}\n\n{}", reply, FOLLOWUP_PROMPT)));
        } else {
            self.send(OutboundEvent::ai(reply));
        }
        self.send_state(now);
        Flow::Continue
    }

    fn answer(&mut self, text: String, now: Instant) -> Flow {
        let decision = {
            let mut session = self.session.lock();
            match session.phase() {
                Phase::Done => AnswerDecision::Ended,
                Phase::Qa if self.pending.is_some() || session.is_awaiting_reply() => {
                    AnswerDecision::Busy
                }
                Phase::Qa => AnswerDecision::QuestionsOpen,
                Phase::Followup if text.trim().is_empty() => AnswerDecision::Empty,
                Phase::Followup => match session.advance(Phase::Done) {
                    Ok(_) => AnswerDecision::Accepted,
                    Err(e) => {
                        warn!(session = %self.sid, "Closing transition failed: {}", e);
                        AnswerDecision::Ended
                    }
                },
            }
        };

        match decision {
            AnswerDecision::Ended => return self.terminal(now),
            AnswerDecision::Busy => self.reject(DispatchFault::Busy, BUSY_NOTICE, now),
            AnswerDecision::QuestionsOpen => {
                self.reject(DispatchFault::PhaseViolation, QUESTIONS_OPEN, now)
            }
            AnswerDecision::Empty => {
                self.send(OutboundEvent::ai(EMPTY_ANSWER));
                self.send_state(now);
            }
            AnswerDecision::Accepted => {
                self.record(RecordEvent::FollowupAnswer {
                    session_id: self.sid.clone(),
                    chars: text.chars().count(),
                });
                self.state.recorder.record_followup(FollowupRow::new(
                    self.sid.clone(),
                    self.conn.peer.clone(),
                    text,
                ));
                self.record_phase_change(Phase::Followup, Phase::Done, "followup");
                self.send(OutboundEvent::ai(CLOSING));
                self.send_state(now);
                return Flow::Close;
            }
        }
        Flow::Continue
    }

    fn exit(&mut self, now: Instant) -> Flow {
        if self.cancel_pending() {
            self.send(OutboundEvent::Typing { on: false });
        }
        let from = {
            let mut session = self.session.lock();
            let from = session.phase();
            matches!(session.advance(Phase::Done), Ok(true)).then_some(from)
        };
        if let Some(from) = from {
            self.record_phase_change(from, Phase::Done, "exit");
        }
        self.send(OutboundEvent::ai(GOODBYE));
        self.send_state(now);
        Flow::Close
    }

    /// Force `DONE` once the deadline has passed. Returns `true` when the
    /// session was expired by this call.
    fn expire_if_due(&mut self, now: Instant) -> bool {
        let from = {
            let mut session = self.session.lock();
            if session.phase().is_terminal() || !session.is_expired(now) {
                return false;
            }
            let from = session.phase();
            match session.advance(Phase::Done) {
                Ok(_) => from,
                Err(e) => {
                    warn!(session = %self.sid, "Deadline transition failed: {}", e);
                    return false;
                }
            }
        };

        debug!(session = %self.sid, fault = %DispatchFault::DeadlineExceeded, "Session expired");
        if self.cancel_pending() {
            self.send(OutboundEvent::Typing { on: false });
        }
        self.record_phase_change(from, Phase::Done, "deadline");
        self.send(OutboundEvent::ai(DEADLINE_NOTICE));
        self.send_state(now);
        true
    }

    fn resync(&mut self) -> Flow {
        let now = Instant::now();
        if self.expire_if_due(now) {
            return Flow::Close;
        }
        if !self.session.lock().phase().is_terminal() {
            self.send_state(now);
        }
        Flow::Continue
    }

    fn terminal(&mut self, now: Instant) -> Flow {
        self.send(OutboundEvent::ai(TERMINAL_NOTICE));
        self.send_state(now);
        Flow::Close
    }

    fn reject(&self, fault: DispatchFault, notice: &str, now: Instant) {
        debug!(session = %self.sid, fault = %fault, "Rejected input");
        self.record(RecordEvent::Rejected {
            session_id: self.sid.clone(),
            fault: fault.as_str().to_string(),
        });
        self.send(OutboundEvent::ai(notice));
        self.send_state(now);
    }

    /// Cancel an in-flight generation. Returns `true` if there was one.
    fn cancel_pending(&mut self) -> bool {
        match self.pending.take() {
            Some(inflight) => {
                inflight.reply.cancel();
                self.session.lock().finish_reply();
                true
            }
            None => false,
        }
    }

    fn finish(&mut self, end: SessionEnd) {
        if self.cancel_pending() {
            debug!(session = %self.sid, "Cancelled in-flight generation");
        }
        if end == SessionEnd::Disconnected && !self.session.lock().phase().is_terminal() {
            debug!(session = %self.sid, fault = %DispatchFault::ConnectionLost, "Client left mid-session");
        }
        self.record(RecordEvent::Disconnect {
            session_id: self.sid.clone(),
            client_addr: self.conn.peer.clone(),
        });
        info!(session = %self.sid, peer = %self.conn.peer, ?end, "Session disconnected");
    }

    fn send_state(&self, now: Instant) {
        let snapshot = self.session.lock().snapshot(now);
        self.send(OutboundEvent::State(snapshot));
    }

    fn send(&self, event: OutboundEvent) {
        if !self.conn.send_json(&event) {
            debug!(session = %self.sid, conn_id = %self.conn.id, "Outbound frame dropped");
        }
    }

    fn record(&self, event: RecordEvent) {
        self.state.recorder.record(event);
    }

    fn record_phase_change(&self, from: Phase, to: Phase, reason: &str) {
        info!(session = %self.sid, %from, %to, reason, "Phase change");
        self.record(RecordEvent::PhaseChange {
            session_id: self.sid.clone(),
            from,
            to,
            reason: reason.to_string(),
        });
    }
}

fn inbound_kind(inbound: &Inbound) -> &'static str {
    match inbound {
        Inbound::Envelope(envelope) => envelope.tag(),
        Inbound::Unknown { .. } => "unknown",
        Inbound::Raw(_) => "raw",
    }
}

fn greeting(name: Option<&str>, remaining_questions: u32, remaining_seconds: u64) -> String {
    let who = name.map(|n| format!(", {}", n)).unwrap_or_default();
    let plural = if remaining_questions == 1 { "" } else { "s" };
    format!(
        "Hello{}! You can ask me {} question{} in the next {}.",
        who,
        remaining_questions,
        plural,
        human_duration(remaining_seconds)
    )
}

fn human_duration(secs: u64) -> String {
    if secs >= 60 && secs % 60 == 0 {
        let minutes = secs / 60;
        format!("{} minute{}", minutes, if minutes == 1 { "" } else { "s" })
    } else {
        format!("{} second{}", secs, if secs == 1 { "" } else { "s" })
    }
}

fn resync_interval(secs: u64) -> Option<Interval> {
    if secs == 0 {
        return None;
    }
    let period = Duration::from_secs(secs);
    let start = Instant::now().checked_add(period)?;
    let mut interval = tokio::time::interval_at(start, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

async fn wait_reply(pending: &mut Option<InFlight>) -> Result<String, GenerationError> {
    match pending {
        Some(inflight) => (&mut inflight.reply).await,
        None => std::future::pending().await,
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parley_core::config::Config;
    use parley_core::recorder::MemoryRecorder;
    use parley_core::session::StateSnapshot;
    use parley_providers::{
        EchoProvider, LLMProvider, LLMResponse, Message, ProviderError, ProviderResult,
    };
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tokio_stream::wrappers::ReceiverStream;

    struct FailingProvider;

    #[async_trait]
    impl LLMProvider for FailingProvider {
        async fn chat(
            &self,
            _messages: Vec<Message>,
            _model: Option<String>,
            _max_tokens: u32,
            _temperature: f32,
        ) -> ProviderResult<LLMResponse> {
            Err(ProviderError::ApiError("backend down".into()))
        }

        fn get_default_model(&self) -> String {
            "failing".into()
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.session.state_resync_secs = 0;
        config
            .session
            .presets
            .insert("q1".into(), "What do you do?".into());
        config
    }

    struct Harness {
        state: AppState,
        recorder: Arc<MemoryRecorder>,
    }

    impl Harness {
        fn new(config: Config, provider: Arc<dyn LLMProvider>) -> Self {
            let recorder = Arc::new(MemoryRecorder::new());
            let state = AppState::new(config, provider, recorder.clone());
            Self { state, recorder }
        }

        fn echo() -> Self {
            Self::new(test_config(), Arc::new(EchoProvider::new()))
        }

        fn connect(&self, sid: &str) -> Client {
            let (in_tx, in_rx) = mpsc::channel::<String>(16);
            let (out_tx, out_rx) = mpsc::channel(64);
            let conn = Arc::new(ClientConnection::new("c-".to_string() + sid, "test-peer", out_tx));
            let dispatcher = SessionDispatcher::new(self.state.clone(), sid.to_string(), conn);
            let task = tokio::spawn(dispatcher.run(ReceiverStream::new(in_rx)));
            Client {
                tx: Some(in_tx),
                rx: out_rx,
                task,
            }
        }
    }

    struct Client {
        tx: Option<mpsc::Sender<String>>,
        rx: mpsc::Receiver<Arc<String>>,
        task: JoinHandle<SessionEnd>,
    }

    impl Client {
        async fn send(&self, frame: serde_json::Value) {
            self.send_raw(&frame.to_string()).await;
        }

        async fn send_raw(&self, frame: &str) {
            if let Some(tx) = &self.tx {
                tx.send(frame.to_string()).await.unwrap();
            }
        }

        async fn next(&mut self) -> Option<OutboundEvent> {
            let frame = self.rx.recv().await?;
            Some(serde_json::from_str(&frame).unwrap())
        }

        /// Next event that is not a typing indicator
        async fn next_visible(&mut self) -> OutboundEvent {
            loop {
                match self.next().await.expect("connection closed") {
                    OutboundEvent::Typing { .. } => continue,
                    other => return other,
                }
            }
        }

        async fn expect_ai(&mut self) -> String {
            match self.next_visible().await {
                OutboundEvent::Ai { text } => text,
                other => panic!("expected ai, got {other:?}"),
            }
        }

        async fn expect_state(&mut self) -> StateSnapshot {
            match self.next_visible().await {
                OutboundEvent::State(snapshot) => snapshot,
                other => panic!("expected state, got {other:?}"),
            }
        }

        async fn expect_closed(mut self) -> SessionEnd {
            while let Some(event) = self.next().await {
                assert!(
                    matches!(event, OutboundEvent::Typing { .. }),
                    "unexpected event before close: {event:?}"
                );
            }
            self.task.await.unwrap()
        }

        async fn disconnect(mut self) -> SessionEnd {
            self.tx.take();
            self.task.await.unwrap()
        }
    }

    fn user_message(text: &str) -> serde_json::Value {
        serde_json::json!({"type": "user_message", "sid": "s1", "text": text})
    }

    #[tokio::test(start_paused = true)]
    async fn test_hello_greets_and_reports_full_budget() {
        let harness = Harness::echo();
        let mut client = harness.connect("s1");

        client
            .send(serde_json::json!({"type": "hello", "sid": "s1", "name": "Mina"}))
            .await;
        let greeting = client.expect_ai().await;
        assert!(greeting.starts_with("Hello, Mina!"));
        assert!(greeting.contains("3 questions"));
        assert!(greeting.contains("3 minutes"));
        assert_eq!(
            client.expect_state().await,
            StateSnapshot {
                phase: Phase::Qa,
                remaining_questions: 3,
                remaining_seconds: 180
            }
        );
        assert_eq!(harness.recorder.count("connect"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_moves_session_to_followup_and_blocks_extra_questions() {
        let harness = Harness::echo();
        let mut client = harness.connect("s1");

        for i in 1..=3u32 {
            client.send(user_message(&format!("question {i}"))).await;
            let reply = client.expect_ai().await;
            assert!(reply.starts_with(&format!("You said: question {i}")));
            let state = client.expect_state().await;
            assert_eq!(state.remaining_questions, 3 - i);
            if i == 3 {
                assert_eq!(state.phase, Phase::Followup);
                assert!(reply.ends_with(FOLLOWUP_PROMPT));
            } else {
                assert_eq!(state.phase, Phase::Qa);
            }
        }

        client.send(user_message("one more?")).await;
        assert_eq!(client.expect_ai().await, FOLLOWUP_PROMPT);
        let state = client.expect_state().await;
        assert_eq!(state.phase, Phase::Followup);
        assert_eq!(state.remaining_questions, 0);

        assert_eq!(harness.recorder.count("quota_increment"), 3);
        assert_eq!(harness.recorder.count("phase_change"), 1);
        let session = harness.state.sessions.get("s1").unwrap();
        assert_eq!(session.lock().questions_asked(), 3);
        assert_eq!(session.lock().message_count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_followup_answer_closes_the_session() {
        let mut config = test_config();
        config.session.max_questions = 1;
        let harness = Harness::new(config, Arc::new(EchoProvider::new()));
        let mut client = harness.connect("s1");

        client.send(user_message("only question")).await;
        client.expect_ai().await;
        assert_eq!(client.expect_state().await.phase, Phase::Followup);

        client
            .send(serde_json::json!({"type": "followup_answer", "text": "Loved it, thanks"}))
            .await;
        assert_eq!(client.expect_ai().await, CLOSING);
        assert_eq!(client.expect_state().await.phase, Phase::Done);
        assert_eq!(client.expect_closed().await, SessionEnd::Closed);

        let rows = harness.recorder.followups();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text, "Loved it, thanks");
        assert_eq!(rows[0].client_addr, "test-peer");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_forces_done_on_next_message() {
        let harness = Harness::echo();
        let mut client = harness.connect("s1");

        client.send(serde_json::json!({"type": "hello"})).await;
        client.expect_ai().await;
        client.expect_state().await;

        tokio::time::advance(Duration::from_secs(181)).await;
        client.send(user_message("still there?")).await;
        assert_eq!(client.expect_ai().await, DEADLINE_NOTICE);
        let state = client.expect_state().await;
        assert_eq!(state.phase, Phase::Done);
        assert_eq!(state.remaining_seconds, 0);
        assert_eq!(client.expect_closed().await, SessionEnd::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_question_is_idempotent_in_every_phase() {
        let harness = Harness::echo();
        let mut client = harness.connect("s1");
        let unknown = serde_json::json!({"type": "question", "qid": "nope"});

        for _ in 0..2 {
            client.send(unknown.clone()).await;
            assert_eq!(client.expect_ai().await, NOT_AVAILABLE);
            let state = client.expect_state().await;
            assert_eq!(state.phase, Phase::Qa);
            assert_eq!(state.remaining_questions, 3);
        }

        client.send(serde_json::json!({"type": "exit"})).await;
        assert_eq!(client.expect_ai().await, GOODBYE);
        assert_eq!(client.expect_state().await.phase, Phase::Done);
        client.expect_closed().await;

        // a later connection to the finished session
        let mut client = harness.connect("s1");
        client.send(unknown.clone()).await;
        assert_eq!(client.expect_ai().await, NOT_AVAILABLE);
        assert_eq!(client.expect_state().await.phase, Phase::Done);

        client.send(serde_json::json!({"type": "hello"})).await;
        assert_eq!(client.expect_ai().await, TERMINAL_NOTICE);
        client.expect_state().await;
        assert_eq!(client.expect_closed().await, SessionEnd::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_known_preset_question_is_metered() {
        let harness = Harness::echo();
        let mut client = harness.connect("s1");

        client
            .send(serde_json::json!({"type": "question", "qid": "q1"}))
            .await;
        assert_eq!(client.expect_ai().await, "You said: What do you do?");
        assert_eq!(client.expect_state().await.remaining_questions, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_input_while_reply_pending_is_rejected() {
        let harness = Harness::new(
            test_config(),
            Arc::new(EchoProvider::with_delay(Duration::from_secs(10))),
        );
        let mut client = harness.connect("s1");

        client.send(user_message("first")).await;
        client.send(user_message("second")).await;

        assert_eq!(client.next().await, Some(OutboundEvent::Typing { on: true }));
        assert_eq!(client.expect_ai().await, BUSY_NOTICE);
        assert_eq!(client.expect_state().await.remaining_questions, 3);

        assert_eq!(client.next().await, Some(OutboundEvent::Typing { on: false }));
        assert_eq!(client.expect_ai().await, "You said: first");
        assert_eq!(client.expect_state().await.remaining_questions, 2);
        assert_eq!(harness.recorder.count("rejected"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_cancels_pending_generation_without_consuming_quota() {
        let harness = Harness::new(
            test_config(),
            Arc::new(EchoProvider::with_delay(Duration::from_secs(30))),
        );
        let mut client = harness.connect("s1");

        client.send(user_message("slow one")).await;
        client.send(serde_json::json!({"type": "exit"})).await;

        assert_eq!(client.expect_ai().await, GOODBYE);
        let state = client.expect_state().await;
        assert_eq!(state.phase, Phase::Done);
        assert_eq!(state.remaining_questions, 3);
        assert_eq!(client.expect_closed().await, SessionEnd::Closed);

        let session = harness.state.sessions.get("s1").unwrap();
        let session = session.lock();
        assert!(!session.is_awaiting_reply());
        assert_eq!(session.message_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_generation() {
        let harness = Harness::new(
            test_config(),
            Arc::new(EchoProvider::with_delay(Duration::from_secs(30))),
        );
        let client = harness.connect("s1");
        client.send(user_message("slow one")).await;
        tokio::task::yield_now().await;

        assert_eq!(client.disconnect().await, SessionEnd::Disconnected);
        let session = harness.state.sessions.get("s1").unwrap();
        assert!(!session.lock().is_awaiting_reply());
        assert_eq!(session.lock().questions_asked(), 0);
        assert_eq!(harness.recorder.count("disconnect"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_generation_apologises_and_counts_by_default() {
        let harness = Harness::new(test_config(), Arc::new(FailingProvider));
        let mut client = harness.connect("s1");

        client.send(user_message("anyone?")).await;
        assert_eq!(client.expect_ai().await, APOLOGY);
        assert_eq!(client.expect_state().await.remaining_questions, 2);
        assert_eq!(harness.recorder.count("backend_failure"), 1);
        let session = harness.state.sessions.get("s1").unwrap();
        assert_eq!(session.lock().message_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_generation_can_be_free() {
        let mut config = test_config();
        config.session.count_failed_generations = false;
        let harness = Harness::new(config, Arc::new(FailingProvider));
        let mut client = harness.connect("s1");

        client.send(user_message("anyone?")).await;
        assert_eq!(client.expect_ai().await, APOLOGY);
        assert_eq!(client.expect_state().await.remaining_questions, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_raw_text_is_treated_as_a_question() {
        let harness = Harness::echo();
        let mut client = harness.connect("s1");

        client.send_raw("is this thing on").await;
        assert_eq!(client.expect_ai().await, "You said: is this thing on");
        assert_eq!(client.expect_state().await.remaining_questions, 2);
        assert_eq!(harness.recorder.count("malformed"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejections_keep_state_untouched() {
        let harness = Harness::echo();
        let mut client = harness.connect("s1");

        client
            .send(serde_json::json!({"type": "dance", "sid": "s1"}))
            .await;
        assert_eq!(client.expect_ai().await, UNSUPPORTED);
        client.expect_state().await;

        client.send(user_message("   ")).await;
        assert_eq!(client.expect_ai().await, EMPTY_QUESTION);
        assert_eq!(client.expect_state().await.remaining_questions, 3);

        client
            .send(serde_json::json!({"type": "followup_answer", "text": "early"}))
            .await;
        assert_eq!(client.expect_ai().await, QUESTIONS_OPEN);
        let state = client.expect_state().await;
        assert_eq!(state.phase, Phase::Qa);
        assert_eq!(state.remaining_questions, 3);
        assert_eq!(harness.recorder.count("unknown"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_resync_pushes_state() {
        let mut config = test_config();
        config.session.state_resync_secs = 5;
        let harness = Harness::new(config, Arc::new(EchoProvider::new()));
        let mut client = harness.connect("s1");

        let state = client.expect_state().await;
        assert_eq!(state.phase, Phase::Qa);
        assert_eq!(state.remaining_seconds, 175);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_expires_idle_session() {
        let mut config = test_config();
        config.session.state_resync_secs = 60;
        let harness = Harness::new(config, Arc::new(EchoProvider::new()));
        let mut client = harness.connect("s1");

        for expected in [120, 60] {
            assert_eq!(client.expect_state().await.remaining_seconds, expected);
        }
        assert_eq!(client.expect_ai().await, DEADLINE_NOTICE);
        assert_eq!(client.expect_state().await.phase, Phase::Done);
        assert_eq!(client.expect_closed().await, SessionEnd::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_question_at_full_counter_forces_followup_uncounted() {
        let harness = Harness::echo();
        {
            let session = harness.state.sessions.get_or_create("s1");
            let mut session = session.lock();
            for _ in 0..3 {
                assert!(session.consume_question());
            }
            assert_eq!(session.phase(), Phase::Qa);
        }
        let mut client = harness.connect("s1");

        client.send(user_message("sneaking one in")).await;
        assert_eq!(client.expect_ai().await, FOLLOWUP_PROMPT);
        let state = client.expect_state().await;
        assert_eq!(state.phase, Phase::Followup);
        assert_eq!(state.remaining_questions, 0);

        let session = harness.state.sessions.get("s1").unwrap();
        assert_eq!(session.lock().questions_asked(), 3);
        assert_eq!(session.lock().message_count(), 0);
        assert_eq!(harness.recorder.count("quota_increment"), 0);
        let reasons: Vec<String> = harness
            .recorder
            .events()
            .into_iter()
            .filter_map(|event| match event {
                RecordEvent::PhaseChange { reason, to, .. } => {
                    assert_eq!(to, Phase::Followup);
                    Some(reason)
                }
                _ => None,
            })
            .collect();
        assert_eq!(reasons, vec!["quota".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_after_deadline_is_dropped_and_session_ends() {
        let mut config = test_config();
        config.session.time_limit_secs = 5;
        let harness = Harness::new(
            config,
            Arc::new(EchoProvider::with_delay(Duration::from_secs(10))),
        );
        let mut client = harness.connect("s1");

        client.send(user_message("slow one")).await;
        assert_eq!(client.next().await, Some(OutboundEvent::Typing { on: true }));
        assert_eq!(client.next().await, Some(OutboundEvent::Typing { on: false }));
        assert_eq!(client.expect_ai().await, DEADLINE_NOTICE);
        let state = client.expect_state().await;
        assert_eq!(state.phase, Phase::Done);
        assert_eq!(state.remaining_seconds, 0);
        assert_eq!(client.expect_closed().await, SessionEnd::Closed);

        let session = harness.state.sessions.get("s1").unwrap();
        let session = session.lock();
        assert_eq!(session.questions_asked(), 0);
        assert_eq!(session.message_count(), 0);
        assert!(!session.is_awaiting_reply());
        assert_eq!(harness.recorder.count("quota_increment"), 0);
        assert_eq!(harness.recorder.count("phase_change"), 1);
    }

    #[test]
    fn test_greeting_wording() {
        assert_eq!(
            greeting(None, 1, 45),
            "Hello! You can ask me 1 question in the next 45 seconds."
        );
        assert_eq!(
            greeting(Some("Ana"), 3, 120),
            "Hello, Ana! You can ask me 3 questions in the next 2 minutes."
        );
    }
}
