//! Configuration for the JDI debugger model.
//!
//! Everything is read from a single TOML file. Every section and field has a
//! default so an empty file (or no file at all) is a valid configuration.

mod logging;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use logging::{init_tracing, LoggingConfig};

/// Environment variable consulted when no `--config` path is given.
pub const CONFIG_ENV_VAR: &str = "JDI_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DebuggerConfig {
    #[serde(default)]
    pub connect: ConnectConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub step_filters: StepFilterConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Socket attach arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectConfig {
    #[serde(default = "ConnectConfig::default_host")]
    pub host: String,
    #[serde(default = "ConnectConfig::default_port")]
    pub port: u16,
    /// Whether terminating a thread or the target may exit the remote VM.
    #[serde(default)]
    pub allow_terminate: bool,
}

impl ConnectConfig {
    fn default_host() -> String {
        "127.0.0.1".to_owned()
    }

    fn default_port() -> u16 {
        5005
    }

    /// `host:port`, suitable for `tokio::net::lookup_host`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
            allow_terminate: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutConfig {
    /// Reply timeout for ordinary requests to the remote VM.
    #[serde(default = "TimeoutConfig::default_request_ms")]
    pub request_ms: u64,
    /// How long an explicit suspend waits for the VM to confirm.
    #[serde(default = "TimeoutConfig::default_suspend_ms")]
    pub suspend_ms: u64,
    #[serde(default = "TimeoutConfig::default_suspend_poll_ms")]
    pub suspend_poll_ms: u64,
    #[serde(default = "TimeoutConfig::default_handshake_ms")]
    pub handshake_ms: u64,
}

impl TimeoutConfig {
    fn default_request_ms() -> u64 {
        3_000
    }

    fn default_suspend_ms() -> u64 {
        3_000
    }

    fn default_suspend_poll_ms() -> u64 {
        50
    }

    fn default_handshake_ms() -> u64 {
        5_000
    }

    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }

    pub fn suspend(&self) -> Duration {
        Duration::from_millis(self.suspend_ms)
    }

    /// Poll interval of the suspend watchdog, never zero.
    pub fn suspend_poll(&self) -> Duration {
        Duration::from_millis(self.suspend_poll_ms.max(1))
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_millis(self.handshake_ms)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_ms: Self::default_request_ms(),
            suspend_ms: Self::default_suspend_ms(),
            suspend_poll_ms: Self::default_suspend_poll_ms(),
            handshake_ms: Self::default_handshake_ms(),
        }
    }
}

/// Step filter options. Patterns are class-name globs such as `java.*`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepFilterConfig {
    #[serde(default = "StepFilterConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub filter_statics: bool,
    #[serde(default = "StepFilterConfig::default_filter_synthetics")]
    pub filter_synthetics: bool,
    #[serde(default)]
    pub filter_constructors: bool,
    #[serde(default)]
    pub active_patterns: Vec<String>,
    /// Known patterns that are switched off. Kept so a UI can toggle them back on.
    #[serde(default = "StepFilterConfig::default_inactive_patterns")]
    pub inactive_patterns: Vec<String>,
}

impl StepFilterConfig {
    fn default_enabled() -> bool {
        true
    }

    fn default_filter_synthetics() -> bool {
        true
    }

    fn default_inactive_patterns() -> Vec<String> {
        ["com.sun.*", "java.*", "javax.*", "org.omg.*", "sun.*", "sunw.*"]
            .into_iter()
            .map(str::to_owned)
            .collect()
    }

    /// Moves `pattern` into the active list.
    pub fn activate(&mut self, pattern: &str) {
        self.inactive_patterns.retain(|p| p != pattern);
        if !self.active_patterns.iter().any(|p| p == pattern) {
            self.active_patterns.push(pattern.to_owned());
        }
    }

    /// Moves `pattern` into the inactive list.
    pub fn deactivate(&mut self, pattern: &str) {
        self.active_patterns.retain(|p| p != pattern);
        if !self.inactive_patterns.iter().any(|p| p == pattern) {
            self.inactive_patterns.push(pattern.to_owned());
        }
    }
}

impl Default for StepFilterConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            filter_statics: false,
            filter_synthetics: Self::default_filter_synthetics(),
            filter_constructors: false,
            active_patterns: Vec::new(),
            inactive_patterns: Self::default_inactive_patterns(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // Keep the message and span only; the default `Display` embeds a snippet of
        // the input.
        let message = err.message().to_owned();
        match err.span() {
            Some(span) => ConfigError::Toml(format!("{message} (at bytes {}..{})", span.start, span.end)),
            None => ConfigError::Toml(message),
        }
    }
}

/// A non-fatal problem found by [`DebuggerConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub path: String,
    pub message: String,
}

impl DebuggerConfig {
    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    /// Resolve the config path from an explicit argument, falling back to [`CONFIG_ENV_VAR`].
    pub fn discover_path(explicit: Option<PathBuf>) -> Option<PathBuf> {
        explicit.or_else(|| {
            std::env::var_os(CONFIG_ENV_VAR)
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        })
    }

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut warn = |path: String, message: String| warnings.push(ConfigWarning { path, message });

        for (list, patterns) in [
            ("active_patterns", &self.step_filters.active_patterns),
            ("inactive_patterns", &self.step_filters.inactive_patterns),
        ] {
            for (idx, pattern) in patterns.iter().enumerate() {
                if let Err(err) = globset::Glob::new(pattern) {
                    warn(
                        format!("step_filters.{list}[{idx}]"),
                        format!("invalid pattern {pattern:?}: {}", err.kind()),
                    );
                }
            }
        }
        for pattern in &self.step_filters.active_patterns {
            if self.step_filters.inactive_patterns.contains(pattern) {
                warn(
                    "step_filters".to_owned(),
                    format!("pattern {pattern:?} is listed as both active and inactive"),
                );
            }
        }
        if self.timeouts.suspend_ms == 0 {
            warn(
                "timeouts.suspend_ms".to_owned(),
                "a zero suspend timeout reports every suspend as timed out".to_owned(),
            );
        }
        if self.timeouts.request_ms == 0 {
            warn(
                "timeouts.request_ms".to_owned(),
                "a zero request timeout fails every request".to_owned(),
            );
        }
        if self.timeouts.suspend_poll_ms > self.timeouts.suspend_ms {
            warn(
                "timeouts.suspend_poll_ms".to_owned(),
                "poll interval is longer than the suspend timeout".to_owned(),
            );
        }
        warnings
    }
}
