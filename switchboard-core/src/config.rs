//! Orchestrator configuration
//!
//! Configuration is read from an optional JSON file and then overridden
//! from `SWITCHBOARD_*` environment variables.

use crate::admission::AdmissionLimits;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default time to wait for account suggestions, in milliseconds
pub const DEFAULT_SUGGESTION_TIMEOUT_MS: u64 = 1_500;

/// Default time to wait for a user prompt answer, in milliseconds
pub const DEFAULT_USER_PROMPT_TIMEOUT_MS: u64 = 60_000;

/// Default time to wait for a directory lookup, in milliseconds
pub const DEFAULT_LOOKUP_TIMEOUT_MS: u64 = 5_000;

/// Default time to wait for the incoming-call filter, in milliseconds
pub const DEFAULT_FILTER_TIMEOUT_MS: u64 = 5_000;

/// Default grace period before a pending-disconnect call is torn down, in milliseconds
pub const DEFAULT_PENDING_DISCONNECT_GRACE_MS: u64 = 3_000;

/// Default capacity of the broadcast event channel
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default per-direction buffer of an RTT stream pair, in bytes
pub const DEFAULT_RTT_BUFFER_BYTES: usize = 4_096;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A value is out of range
    #[error("Invalid configuration value: {0}")]
    Invalid(String),

    /// A file or variable could not be parsed
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// A file could not be read
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// Bounds on every suspension point of the call pipelines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineTimeouts {
    /// Account suggestion round trip
    pub suggestion_ms: u64,
    /// Account picker, drop confirmation and redirection confirmation
    pub user_prompt_ms: u64,
    /// Directory lookup and caller-ID screening
    pub lookup_ms: u64,
    /// Incoming-call content filter
    pub filter_ms: u64,
    /// Delay before a pending-disconnect call is torn down
    pub pending_disconnect_grace_ms: u64,
}

impl PipelineTimeouts {
    /// Suggestion timeout
    #[must_use]
    pub fn suggestion(&self) -> Duration {
        Duration::from_millis(self.suggestion_ms)
    }

    /// User prompt timeout
    #[must_use]
    pub fn user_prompt(&self) -> Duration {
        Duration::from_millis(self.user_prompt_ms)
    }

    /// Lookup timeout
    #[must_use]
    pub fn lookup(&self) -> Duration {
        Duration::from_millis(self.lookup_ms)
    }

    /// Filter timeout
    #[must_use]
    pub fn filter(&self) -> Duration {
        Duration::from_millis(self.filter_ms)
    }

    /// Pending-disconnect grace period
    #[must_use]
    pub fn pending_disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.pending_disconnect_grace_ms)
    }
}

impl Default for PipelineTimeouts {
    fn default() -> Self {
        Self {
            suggestion_ms: DEFAULT_SUGGESTION_TIMEOUT_MS,
            user_prompt_ms: DEFAULT_USER_PROMPT_TIMEOUT_MS,
            lookup_ms: DEFAULT_LOOKUP_TIMEOUT_MS,
            filter_ms: DEFAULT_FILTER_TIMEOUT_MS,
            pending_disconnect_grace_ms: DEFAULT_PENDING_DISCONNECT_GRACE_MS,
        }
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Admission ceilings
    pub admission: AdmissionLimits,
    /// Pipeline timeouts
    pub timeouts: PipelineTimeouts,
    /// Numbers treated as emergency numbers
    pub emergency_numbers: Vec<String>,
    /// Ask the user before dialing a redirected address
    pub confirm_redirection: bool,
    /// Capacity of the broadcast event channel
    pub event_channel_capacity: usize,
    /// Per-direction buffer of an RTT stream pair
    pub rtt_buffer_bytes: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            admission: AdmissionLimits::default(),
            timeouts: PipelineTimeouts::default(),
            emergency_numbers: vec!["911".to_string(), "112".to_string()],
            confirm_redirection: true,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            rtt_buffer_bytes: DEFAULT_RTT_BUFFER_BYTES,
        }
    }
}

impl OrchestratorConfig {
    /// Parse a JSON document; missing fields take their defaults
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` for malformed JSON and
    /// `ConfigError::Invalid` for out-of-range values.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON file
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Io` when the file cannot be read, otherwise as
    /// [`OrchestratorConfig::from_json_str`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Defaults overridden from the process environment
    ///
    /// # Errors
    ///
    /// Returns an error when a variable does not parse or a value is out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(&env::vars().collect())
    }

    /// Apply `SWITCHBOARD_*` overrides from `vars`
    ///
    /// # Errors
    ///
    /// Returns an error when a variable does not parse or a value is out of range.
    pub fn with_overrides(mut self, vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let limits = &mut self.admission;
        override_parsed(vars, "SWITCHBOARD_MAX_LIVE_CALLS", &mut limits.max_live_calls)?;
        override_parsed(vars, "SWITCHBOARD_MAX_HELD_CALLS", &mut limits.max_held_calls)?;
        override_parsed(vars, "SWITCHBOARD_MAX_RINGING_CALLS", &mut limits.max_ringing_calls)?;
        override_parsed(vars, "SWITCHBOARD_MAX_OUTGOING_CALLS", &mut limits.max_outgoing_calls)?;
        override_parsed(vars, "SWITCHBOARD_MAX_TOP_LEVEL_CALLS", &mut limits.max_top_level_calls)?;
        override_parsed(
            vars,
            "SWITCHBOARD_MAX_SELF_MANAGED_CALLS",
            &mut limits.max_self_managed_calls,
        )?;

        let timeouts = &mut self.timeouts;
        override_parsed(vars, "SWITCHBOARD_SUGGESTION_TIMEOUT_MS", &mut timeouts.suggestion_ms)?;
        override_parsed(vars, "SWITCHBOARD_USER_PROMPT_TIMEOUT_MS", &mut timeouts.user_prompt_ms)?;
        override_parsed(vars, "SWITCHBOARD_LOOKUP_TIMEOUT_MS", &mut timeouts.lookup_ms)?;
        override_parsed(vars, "SWITCHBOARD_FILTER_TIMEOUT_MS", &mut timeouts.filter_ms)?;
        override_parsed(
            vars,
            "SWITCHBOARD_PENDING_DISCONNECT_GRACE_MS",
            &mut timeouts.pending_disconnect_grace_ms,
        )?;

        if let Some(numbers) = vars.get("SWITCHBOARD_EMERGENCY_NUMBERS") {
            self.emergency_numbers = numbers
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect();
        }
        override_parsed(
            vars,
            "SWITCHBOARD_CONFIRM_REDIRECTION",
            &mut self.confirm_redirection,
        )?;

        self.validate()?;
        Ok(self)
    }

    /// Check every ceiling and timeout is non-zero
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits = &self.admission;
        let counts = [
            ("admission.max_live_calls", limits.max_live_calls),
            ("admission.max_held_calls", limits.max_held_calls),
            ("admission.max_ringing_calls", limits.max_ringing_calls),
            ("admission.max_outgoing_calls", limits.max_outgoing_calls),
            ("admission.max_top_level_calls", limits.max_top_level_calls),
            ("admission.max_self_managed_calls", limits.max_self_managed_calls),
            ("event_channel_capacity", self.event_channel_capacity),
            ("rtt_buffer_bytes", self.rtt_buffer_bytes),
        ];
        if let Some((name, _)) = counts.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }

        let t = &self.timeouts;
        let timeouts = [
            ("timeouts.suggestion_ms", t.suggestion_ms),
            ("timeouts.user_prompt_ms", t.user_prompt_ms),
            ("timeouts.lookup_ms", t.lookup_ms),
            ("timeouts.filter_ms", t.filter_ms),
            ("timeouts.pending_disconnect_grace_ms", t.pending_disconnect_grace_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        Ok(())
    }

    /// Whether `address` dials an emergency number
    #[must_use]
    pub fn is_emergency_address(&self, address: &str) -> bool {
        let number = address
            .strip_prefix("tel:")
            .unwrap_or(address)
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '+' || *c == '*' || *c == '#')
            .collect::<String>();
        self.emergency_numbers.iter().any(|n| *n == number)
    }
}

fn override_parsed<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    target: &mut T,
) -> Result<(), ConfigError> {
    if let Some(raw) = vars.get(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Parse(format!("{key}={raw}")))?;
    }
    Ok(())
}
