//! Configuration validation rules.

use super::schema::{Config, MAX_SESSION_SECS};

/// Validate configuration and return aggregated validation errors.
pub fn validate_config(config: &Config) -> crate::Result<()> {
    let mut errors = Vec::new();

    if config.server.host.trim().is_empty() {
        errors.push("server.host must not be empty".to_string());
    }

    let session = &config.session;
    if session.max_questions == 0 {
        errors.push("session.max_questions must be > 0".to_string());
    }
    if session.time_limit_secs == 0 {
        errors.push("session.time_limit_secs must be > 0".to_string());
    } else if session.time_limit_secs > MAX_SESSION_SECS {
        errors.push(format!(
            "session.time_limit_secs must be <= {}",
            MAX_SESSION_SECS
        ));
    }
    if session.state_resync_secs > MAX_SESSION_SECS {
        errors.push(format!(
            "session.state_resync_secs must be <= {}",
            MAX_SESSION_SECS
        ));
    }
    if session.history_turns == 0 {
        errors.push("session.history_turns must be > 0".to_string());
    }
    if session.idle_ttl_secs > 0 && session.sweep_interval_secs == 0 {
        errors.push(
            "session.sweep_interval_secs must be > 0 when idle eviction is enabled".to_string(),
        );
    }
    if session.max_sid_chars == 0 {
        errors.push("session.max_sid_chars must be > 0".to_string());
    }
    if session.placeholder_sid.trim().is_empty() {
        errors.push("session.placeholder_sid must not be empty".to_string());
    } else if session.placeholder_sid.chars().count() > session.max_sid_chars {
        errors.push("session.placeholder_sid exceeds session.max_sid_chars".to_string());
    }
    for (qid, text) in &session.presets {
        if text.trim().is_empty() {
            errors.push(format!("session.presets.{} must not be empty", qid));
        }
    }

    let limits = &config.limits;
    if limits.max_text_chars == 0 {
        errors.push("limits.max_text_chars must be > 0".to_string());
    }
    if limits.max_name_chars == 0 {
        errors.push("limits.max_name_chars must be > 0".to_string());
    }
    if limits.room_text_chars == 0 {
        errors.push("limits.room_text_chars must be > 0".to_string());
    }

    let provider = &config.provider;
    if provider.api_base.trim().is_empty() {
        errors.push("provider.api_base must not be empty".to_string());
    }
    if provider.model.trim().is_empty() {
        errors.push("provider.model must not be empty".to_string());
    }
    if provider.max_tokens == 0 {
        errors.push("provider.max_tokens must be > 0".to_string());
    }
    if !(0.0..=2.0).contains(&provider.temperature) {
        errors.push("provider.temperature must be in [0.0, 2.0]".to_string());
    }
    if provider.timeout_secs == 0 {
        errors.push("provider.timeout_secs must be > 0".to_string());
    }
    if provider.workers == 0 {
        errors.push("provider.workers must be > 0".to_string());
    }

    if config.recorder.enabled {
        if config.recorder.events_file.trim().is_empty() {
            errors.push("recorder.events_file is required when the recorder is enabled".to_string());
        }
        if config.recorder.followup_file.trim().is_empty() {
            errors.push(
                "recorder.followup_file is required when the recorder is enabled".to_string(),
            );
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(crate::Error::Validation(errors.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_defaults() {
        validate_config(&Config::default()).unwrap();
    }

    #[test]
    fn test_validate_aggregates_errors() {
        let mut config = Config::default();
        config.provider.temperature = 3.0;
        config.provider.workers = 0;

        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("provider.temperature"));
        assert!(err.contains("provider.workers"));
    }

    #[test]
    fn test_validate_sweeper_interval_only_matters_with_eviction() {
        let mut config = Config::default();
        config.session.sweep_interval_secs = 0;
        assert!(validate_config(&config).is_err());

        config.session.idle_ttl_secs = 0;
        validate_config(&config).unwrap();
    }

    #[test]
    fn test_validate_bounds_session_durations() {
        let mut config = Config::default();
        config.session.time_limit_secs = MAX_SESSION_SECS;
        config.session.state_resync_secs = MAX_SESSION_SECS;
        validate_config(&config).unwrap();

        config.session.time_limit_secs = u64::MAX;
        config.session.state_resync_secs = u64::MAX;
        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("session.time_limit_secs"));
        assert!(err.contains("session.state_resync_secs"));
    }

    #[test]
    fn test_validate_rejects_empty_preset() {
        let mut config = Config::default();
        config
            .session
            .presets
            .insert("q9".to_string(), "   ".to_string());

        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("session.presets.q9"));
    }
}
