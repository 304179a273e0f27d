use parking_lot::Mutex;
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{EventRecorder, FollowupRow, RecordEvent};

const FOLLOWUP_HEADER: &str = "timestamp,session_id,client_addr,text";

struct Sinks {
    events: File,
    followups: File,
}

/// JSONL event log plus a CSV file of follow-up answers
pub struct FileRecorder {
    events_path: PathBuf,
    followups_path: PathBuf,
    sinks: Mutex<Sinks>,
}

impl FileRecorder {
    /// Open (creating if needed) both record files under `dir`
    pub fn open(
        dir: impl AsRef<Path>,
        events_file: &str,
        followup_file: &str,
    ) -> crate::Result<Self> {
        let dir = crate::utils::ensure_dir(dir)?;
        let events_path = dir.join(events_file);
        let followups_path = dir.join(followup_file);

        let events = append(&events_path)?;

        let needs_header = std::fs::metadata(&followups_path)
            .map(|m| m.len() == 0)
            .unwrap_or(true);
        let mut followups = append(&followups_path)?;
        if needs_header {
            writeln!(followups, "{}", FOLLOWUP_HEADER)?;
        }

        debug!(
            events = %events_path.display(),
            followups = %followups_path.display(),
            "Recorder opened"
        );

        Ok(Self {
            events_path,
            followups_path,
            sinks: Mutex::new(Sinks { events, followups }),
        })
    }

    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    pub fn followups_path(&self) -> &Path {
        &self.followups_path
    }

    fn write_event(&self, event: &RecordEvent) -> crate::Result<()> {
        let mut value = serde_json::to_value(event)?;
        if let Value::Object(map) = &mut value {
            map.insert(
                "ts".to_string(),
                Value::String(chrono::Utc::now().to_rfc3339()),
            );
        }
        let line = serde_json::to_string(&value)?;

        let mut sinks = self.sinks.lock();
        writeln!(sinks.events, "{}", line)?;
        sinks.events.flush()?;
        Ok(())
    }

    fn write_followup(&self, row: &FollowupRow) -> crate::Result<()> {
        let line = [
            row.timestamp.to_rfc3339(),
            row.session_id.clone(),
            row.client_addr.clone(),
            row.text.clone(),
        ]
        .iter()
        .map(|field| csv_field(field))
        .collect::<Vec<_>>()
        .join(",");

        let mut sinks = self.sinks.lock();
        writeln!(sinks.followups, "{}", line)?;
        sinks.followups.flush()?;
        Ok(())
    }
}

impl EventRecorder for FileRecorder {
    fn record(&self, event: RecordEvent) {
        if let Err(e) = self.write_event(&event) {
            warn!(kind = event.kind(), "Failed to record event: {}", e);
        }
    }

    fn record_followup(&self, row: FollowupRow) {
        if let Err(e) = self.write_followup(&row) {
            warn!(session = %row.session_id, "Failed to record follow-up: {}", e);
        }
    }
}

fn append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Quote a CSV field when it holds a separator, quote or line break
fn csv_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
