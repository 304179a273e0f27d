//! Configuration schema definitions

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Root configuration for parley
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Session lifecycle configuration
    #[serde(default)]
    pub session: SessionConfig,
    /// Inbound size limits
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Text-generation backend configuration
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Event recorder configuration
    #[serde(default)]
    pub recorder: RecorderConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Directory for log files
    #[serde(default = "default_log_dir")]
    pub dir: String,
    /// Module-specific overrides
    #[serde(default)]
    pub overrides: HashMap<String, String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            dir: default_log_dir(),
            overrides: HashMap::new(),
        }
    }
}

/// Which WebSocket variants the server exposes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServerMode {
    /// Metered question/answer sessions on `/ws`
    Phased,
    /// Multi-party broadcast room on `/ws/room`
    Room,
    /// Both endpoints
    #[default]
    Both,
}

impl ServerMode {
    pub fn serves_phased(self) -> bool {
        matches!(self, ServerMode::Phased | ServerMode::Both)
    }

    pub fn serves_room(self) -> bool {
        matches!(self, ServerMode::Room | ServerMode::Both)
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Presentation mode
    #[serde(default)]
    pub mode: ServerMode,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            mode: ServerMode::default(),
        }
    }
}

/// Session lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Metered questions allowed in the QA phase
    #[serde(default = "default_max_questions")]
    pub max_questions: u32,
    /// Wall-clock budget of a session, in seconds
    #[serde(default = "default_time_limit_secs")]
    pub time_limit_secs: u64,
    /// Most recent history turns sent to the backend
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    /// Idle time after which an unattached session is evicted (0 = never)
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,
    /// How often the sweeper looks for idle sessions
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Interval of unsolicited state snapshots (0 = disabled)
    #[serde(default = "default_state_resync_secs")]
    pub state_resync_secs: u64,
    /// Session id used when the client supplies none or a malformed one
    #[serde(default = "default_placeholder_sid")]
    pub placeholder_sid: String,
    /// Generate a fresh id instead of using the placeholder for absent ids
    #[serde(default)]
    pub assign_missing_ids: bool,
    /// Maximum length of a session id
    #[serde(default = "default_max_sid_chars")]
    pub max_sid_chars: usize,
    /// Whether a failed generation still consumes a question slot
    #[serde(default = "default_true")]
    pub count_failed_generations: bool,
    /// Preset questions addressable by id through `question` envelopes
    #[serde(default)]
    pub presets: HashMap<String, String>,
}

/// Upper bound for any configured session duration, in seconds
pub const MAX_SESSION_SECS: u64 = 365 * 24 * 60 * 60;

fn default_max_questions() -> u32 {
    3
}

fn default_time_limit_secs() -> u64 {
    180
}

fn default_history_turns() -> usize {
    12
}

fn default_idle_ttl_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_state_resync_secs() -> u64 {
    15
}

fn default_placeholder_sid() -> String {
    "anonymous".to_string()
}

fn default_max_sid_chars() -> usize {
    64
}

fn default_true() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_questions: default_max_questions(),
            time_limit_secs: default_time_limit_secs(),
            history_turns: default_history_turns(),
            idle_ttl_secs: default_idle_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            state_resync_secs: default_state_resync_secs(),
            placeholder_sid: default_placeholder_sid(),
            assign_missing_ids: false,
            max_sid_chars: default_max_sid_chars(),
            count_failed_generations: true,
            presets: HashMap::new(),
        }
    }
}

/// Inbound size limits, in characters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_text_chars")]
    pub max_text_chars: usize,
    #[serde(default = "default_max_name_chars")]
    pub max_name_chars: usize,
    #[serde(default = "default_room_text_chars")]
    pub room_text_chars: usize,
}

fn default_max_text_chars() -> usize {
    2000
}

fn default_max_name_chars() -> usize {
    20
}

fn default_room_text_chars() -> usize {
    500
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_text_chars: default_max_text_chars(),
            max_name_chars: default_max_name_chars(),
            room_text_chars: default_room_text_chars(),
        }
    }
}

/// Text-generation backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL of an OpenAI-compatible API
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub api_key: String,
    /// Model identifier
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Per-call timeout, in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Generation calls allowed in flight across the process
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Extra headers sent with every request
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

fn default_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_tokens() -> u32 {
    512
}

fn default_temperature() -> f32 {
    0.7
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_workers() -> usize {
    4
}

fn default_system_prompt() -> String {
    "You are a friendly interviewer answering a visitor's questions. \
     Keep every answer short, concrete and polite."
        .to_string()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            api_key: String::new(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
            workers: default_workers(),
            system_prompt: default_system_prompt(),
            extra_headers: HashMap::new(),
        }
    }
}

impl ProviderConfig {
    /// API key masked for display
    pub fn masked_api_key(&self) -> String {
        let key = self.api_key.trim();
        if key.is_empty() {
            return String::new();
        }
        let tail: String = key
            .chars()
            .rev()
            .take(4)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        format!("****{}", tail)
    }
}

/// Event recorder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Directory holding the record files
    #[serde(default = "default_recorder_dir")]
    pub dir: String,
    /// Append-only JSONL event log
    #[serde(default = "default_events_file")]
    pub events_file: String,
    /// CSV follow-up answers
    #[serde(default = "default_followup_file")]
    pub followup_file: String,
}

fn default_recorder_dir() -> String {
    "records".to_string()
}

fn default_events_file() -> String {
    "events.jsonl".to_string()
}

fn default_followup_file() -> String {
    "followups.csv".to_string()
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_recorder_dir(),
            events_file: default_events_file(),
            followup_file: default_followup_file(),
        }
    }
}
