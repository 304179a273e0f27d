//! Utility functions and helpers

use std::path::Path;

/// Ensure a directory exists, creating it if necessary
pub fn ensure_dir<P: AsRef<Path>>(path: P) -> std::io::Result<std::path::PathBuf> {
    let path = path.as_ref();
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(path.to_path_buf())
}

/// Keep at most `max_chars` characters of `s`.
///
/// Counts Unicode scalar values, so multi-byte text is never split.
pub fn cap_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((end, _)) => s[..end].to_string(),
        None => s.to_string(),
    }
}

/// Truncate for log output, marking the cut with `...`
pub fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        format!("{}...", cap_chars(s, max_chars.saturating_sub(3)))
    }
}

/// Normalize a client-supplied session id.
///
/// Returns `None` when the id is absent, empty after trimming, or contains
/// characters outside `[A-Za-z0-9-_.:]`. Valid ids are capped at `max_chars`.
pub fn sanitize_sid(raw: Option<&str>, max_chars: usize) -> Option<String> {
    let trimmed = raw?.trim();
    if trimmed.is_empty() {
        return None;
    }
    let valid = trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
    if !valid {
        return None;
    }
    Some(cap_chars(trimmed, max_chars))
}

/// Seconds since the Unix epoch as a float
pub fn epoch_secs_f64() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}
