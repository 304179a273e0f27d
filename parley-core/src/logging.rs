//! Logging initialization: stdout plus a daily rolling file.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

use crate::config::schema::LoggingConfig;

/// Prefix of the rolling log files (`parley.log.YYYY-MM-DD`)
const LOG_FILE_PREFIX: &str = "parley.log";

/// Rolled files older than this are removed at startup
const LOG_RETENTION_DAYS: u64 = 7;

/// Initialize the global subscriber.
///
/// `RUST_LOG` wins over `config.level`, `LOG_FORMAT` over `config.format`.
/// The returned guard must be held for the life of the process or buffered
/// file output is lost.
pub fn init_logging(config: &LoggingConfig) -> WorkerGuard {
    let filter = build_filter(config);
    let is_json = std::env::var("LOG_FORMAT")
        .unwrap_or_else(|_| config.format.clone())
        .eq_ignore_ascii_case("json");

    let file_appender = tracing_appender::rolling::daily(&config.dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let stdout_layer = if is_json {
        fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .boxed()
    } else {
        fmt::layer().with_target(true).with_thread_ids(true).boxed()
    };

    let file_layer = if is_json {
        fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    // try_init: a second call (tests, embedding) keeps the first subscriber
    let _ = Registry::default()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init();

    if let Err(e) = cleanup_old_logs(&config.dir, LOG_RETENTION_DAYS) {
        eprintln!("Failed to clean up old logs: {}", e);
    }

    guard
}

fn build_filter(config: &LoggingConfig) -> EnvFilter {
    let mut filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    for (module, level) in &config.overrides {
        match format!("{}={}", module, level).parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(_) => eprintln!("Invalid log directive: {}={}", module, level),
        }
    }
    filter
}

/// Remove rolled log files older than `days` days
fn cleanup_old_logs(dir: &str, days: u64) -> std::io::Result<usize> {
    let path = Path::new(dir);
    if !path.exists() {
        return Ok(0);
    }

    let now = std::time::SystemTime::now();
    let threshold = std::time::Duration::from_secs(days * 24 * 3600);
    let mut removed = 0;

    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let file = entry.path();
        if !file.is_file() {
            continue;
        }
        let is_ours = file
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(LOG_FILE_PREFIX));
        if !is_ours {
            continue;
        }

        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok());
        if age.is_some_and(|age| age > threshold) {
            match std::fs::remove_file(&file) {
                Ok(()) => removed += 1,
                Err(e) => eprintln!("Failed to remove old log file {:?}: {}", file, e),
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cleanup_missing_dir_is_noop() {
        let removed = cleanup_old_logs("/definitely/not/a/real/dir", 7).unwrap();
        assert_eq!(removed, 0);
    }

    #[test]
    fn test_cleanup_keeps_fresh_and_foreign_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("parley.log.2026-01-01"), "x").unwrap();
        std::fs::write(dir.path().join("other.txt"), "x").unwrap();

        let removed = cleanup_old_logs(dir.path().to_str().unwrap(), 7).unwrap();
        assert_eq!(removed, 0);
        assert!(dir.path().join("parley.log.2026-01-01").exists());
        assert!(dir.path().join("other.txt").exists());
    }

    #[test]
    fn test_cleanup_zero_retention_removes_only_log_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("parley.log.2026-01-01"), "x").unwrap();
        std::fs::write(dir.path().join("other.txt"), "x").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        let removed = cleanup_old_logs(dir.path().to_str().unwrap(), 0).unwrap();
        assert_eq!(removed, 1);
        assert!(dir.path().join("other.txt").exists());
    }

    #[test]
    fn test_invalid_override_is_skipped() {
        let mut config = LoggingConfig::default();
        config
            .overrides
            .insert("parley_server".to_string(), "not-a-level".to_string());
        // must not panic
        let _ = build_filter(&config);
    }
}
