use parking_lot::Mutex;

use super::{EventRecorder, FollowupRow, RecordEvent};

/// Keeps everything in memory; used by tests and embedders
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<RecordEvent>>,
    followups: Mutex<Vec<FollowupRow>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordEvent> {
        self.events.lock().clone()
    }

    pub fn followups(&self) -> Vec<FollowupRow> {
        self.followups.lock().clone()
    }

    /// Number of recorded events of the given kind
    pub fn count(&self, kind: &str) -> usize {
        self.events.lock().iter().filter(|e| e.kind() == kind).count()
    }
}

impl EventRecorder for MemoryRecorder {
    fn record(&self, event: RecordEvent) {
        self.events.lock().push(event);
    }

    fn record_followup(&self, row: FollowupRow) {
        self.followups.lock().push(row);
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRecorder;

impl EventRecorder for NullRecorder {
    fn record(&self, _event: RecordEvent) {}

    fn record_followup(&self, _row: FollowupRow) {}
}
