//! Watchdog configuration.
//!
//! Every threshold, interval and classification table the core consults
//! lives here. Nothing in the analyzers is hard-coded per deployment: the
//! defaults mirror a desktop-style event loop (5 ms scans, 150 ms
//! "unreasonable" dispatch) and can be overridden from a JSON file.
//!
//! ```json
//! {
//!   "forced_logging_interval_ms": 2000,
//!   "application_prefixes": ["myapp::"],
//!   "risk_rules": [{ "owner_prefix": "myapp::db", "method": { "kind": "any" } }]
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{ConfigError, StackFrame, NANOS_PER_MICRO, NANOS_PER_MILLI};

// =============================================================================
// FRAME MATCHERS
// =============================================================================

/// How a [`RiskRule`] matches the method part of a frame.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MethodMatch {
    /// Any method of the owner
    #[default]
    Any,
    /// Exactly this method name
    Exact(String),
    /// Any of these method names
    OneOf(Vec<String>),
    /// Method name contains this text, ignoring ASCII case
    ContainsIgnoreCase(String),
}

impl MethodMatch {
    #[must_use]
    pub fn matches(&self, method: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(name) => method == name,
            Self::OneOf(names) => names.iter().any(|n| n == method),
            Self::ContainsIgnoreCase(needle) => {
                method.to_ascii_lowercase().contains(&needle.to_ascii_lowercase())
            }
        }
    }
}

/// A known slow or blocking call site: "do not run this on the dispatch
/// thread".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskRule {
    pub owner_prefix: String,
    #[serde(default)]
    pub method: MethodMatch,
}

impl RiskRule {
    pub fn new(owner_prefix: impl Into<String>, method: MethodMatch) -> Self {
        Self { owner_prefix: owner_prefix.into(), method }
    }

    #[must_use]
    pub fn matches(&self, frame: &StackFrame) -> bool {
        frame.owner.starts_with(&self.owner_prefix) && self.method.matches(&frame.method)
    }
}

/// Exact match on one frame. `None` components match anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramePattern {
    #[serde(default)]
    pub owner: Option<String>,
    pub method: String,
    #[serde(default)]
    pub native: Option<bool>,
}

impl FramePattern {
    pub fn new(owner: Option<&str>, method: &str, native: Option<bool>) -> Self {
        Self { owner: owner.map(str::to_owned), method: method.to_owned(), native }
    }

    #[must_use]
    pub fn matches(&self, frame: &StackFrame) -> bool {
        self.owner.as_ref().map_or(true, |o| *o == frame.owner)
            && self.method == frame.method
            && self.native.map_or(true, |n| n == frame.native)
    }
}

// =============================================================================
// WATCHDOG CONFIG
// =============================================================================

/// Complete configuration surface of the watchdog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Period of the dispatch scan loop.
    pub scan_interval_ms: u64,
    /// Delay before the first scan after the watchdog starts.
    pub scan_initial_delay_ms: u64,
    /// A still-running dispatch is force-reported every this often.
    pub forced_logging_interval_ms: u64,
    /// A running dispatch gets a thread contention check every this often.
    pub contention_check_interval_ms: u64,
    /// A dispatch longer than this is reported when it completes.
    pub unreasonable_dispatch_ms: u64,
    /// A retired frame that ran at least this long keeps its place in the
    /// profile synopsis.
    pub unreasonable_frame_us: u64,
    /// The first N dispatches are not analyzed (installation noise).
    pub startup_dispatch_exclusion: u64,
    /// Delay before the first deadlock scan.
    pub deadlock_initial_delay_ms: u64,
    /// Period of the deadlock scan.
    pub deadlock_interval_ms: u64,
    /// Try to enable blocked/waited time accounting at startup.
    pub monitor_thread_contention: bool,
    /// Owner prefixes of the monitored application's own code.
    pub application_prefixes: Vec<String>,
    /// Known slow/blocking call sites.
    pub risk_rules: Vec<RiskRule>,
    /// Top-of-stack pattern (innermost first) of a dispatch thread that is
    /// idle, waiting for its next unit of work.
    pub idle_wait_pattern: Vec<FramePattern>,
    /// Top frame pattern of a thread that put itself into a blocking wait.
    pub blocking_wait_pattern: FramePattern,
    /// Owner prefixes of the watchdog itself. A stack whose top frame is
    /// ours is never considered idle.
    pub self_prefixes: Vec<String>,
    /// Type prefixes of resources only the dispatch thread may touch.
    pub protected_resource_prefixes: Vec<String>,
    /// Lock type prefixes that are never a contention risk.
    pub non_risk_lock_prefixes: Vec<String>,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: 5,
            scan_initial_delay_ms: 100,
            forced_logging_interval_ms: 1_000,
            contention_check_interval_ms: 25,
            unreasonable_dispatch_ms: 150,
            unreasonable_frame_us: 100,
            startup_dispatch_exclusion: 2,
            deadlock_initial_delay_ms: 1_000,
            deadlock_interval_ms: 60_000,
            monitor_thread_contention: true,
            application_prefixes: vec!["app::".to_string()],
            risk_rules: default_risk_rules(),
            idle_wait_pattern: vec![
                FramePattern::new(Some("std::thread"), "park", Some(true)),
                FramePattern::new(Some("crossbeam_channel::Receiver"), "recv", Some(false)),
                FramePattern::new(Some("hangwatch::host::DispatchLoop"), "next_event", Some(false)),
            ],
            blocking_wait_pattern: FramePattern::new(None, "wait", Some(true)),
            self_prefixes: vec!["hangwatch::watchdog".to_string()],
            protected_resource_prefixes: vec!["ui::widget::".to_string()],
            non_risk_lock_prefixes: vec!["hangwatch::watchdog".to_string()],
        }
    }
}

/// Default table of call sites that should never run on a dispatch thread.
fn default_risk_rules() -> Vec<RiskRule> {
    use MethodMatch::{Any, ContainsIgnoreCase, Exact, OneOf};

    let one_of = |names: &[&str]| OneOf(names.iter().map(|s| (*s).to_string()).collect());
    vec![
        // Cryptographic initialization
        RiskRule::new("openssl::ssl::SslConnector", Exact("builder".into())),
        RiskRule::new("ring::rsa::KeyPair", ContainsIgnoreCase("from".into())),
        RiskRule::new("rustls::ClientConfig", Exact("builder".into())),
        // Compression and archives
        RiskRule::new("flate2::", Any),
        RiskRule::new("zip::", Any),
        RiskRule::new("tar::", Any),
        // Thread parking and waiting
        RiskRule::new("std::thread", one_of(&["park", "park_timeout", "sleep"])),
        RiskRule::new("std::sync::Condvar", ContainsIgnoreCase("wait".into())),
        // Blocking file and socket I/O
        RiskRule::new("std::fs::File", ContainsIgnoreCase("read".into())),
        RiskRule::new("std::net::TcpStream", Exact("connect".into())),
        RiskRule::new("std::net::TcpStream", ContainsIgnoreCase("read".into())),
        RiskRule::new("std::net::TcpStream", ContainsIgnoreCase("write".into())),
        RiskRule::new("std::net::ToSocketAddrs", Exact("to_socket_addrs".into())),
        RiskRule::new("reqwest::blocking", Any),
        // Clipboard access
        RiskRule::new("arboard::Clipboard", one_of(&["get_text", "get_image", "set_text"])),
        // Dynamic loading
        RiskRule::new("libloading::Library", Exact("new".into())),
    ]
}

impl WatchdogConfig {
    /// Load a configuration file. Missing fields keep their defaults.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, is not valid JSON, or
    /// fails [`validate`](Self::validate).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Parse a configuration from JSON text.
    ///
    /// # Errors
    /// Returns an error if the text is not valid JSON or fails validation.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would make a scan loop spin or an
    /// escalation threshold fire on every tick.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("scan_interval_ms", self.scan_interval_ms),
            ("forced_logging_interval_ms", self.forced_logging_interval_ms),
            ("contention_check_interval_ms", self.contention_check_interval_ms),
            ("deadlock_interval_ms", self.deadlock_interval_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        if self.idle_wait_pattern.is_empty() {
            return Err(ConfigError::Invalid("idle_wait_pattern must not be empty".into()));
        }
        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn scan_initial_delay(&self) -> Duration {
        Duration::from_millis(self.scan_initial_delay_ms)
    }

    pub fn deadlock_initial_delay(&self) -> Duration {
        Duration::from_millis(self.deadlock_initial_delay_ms)
    }

    pub fn deadlock_interval(&self) -> Duration {
        Duration::from_millis(self.deadlock_interval_ms)
    }

    pub fn forced_logging_interval_nanos(&self) -> u64 {
        self.forced_logging_interval_ms.saturating_mul(NANOS_PER_MILLI)
    }

    pub fn contention_check_interval_nanos(&self) -> u64 {
        self.contention_check_interval_ms.saturating_mul(NANOS_PER_MILLI)
    }

    pub fn unreasonable_dispatch_nanos(&self) -> u64 {
        self.unreasonable_dispatch_ms.saturating_mul(NANOS_PER_MILLI)
    }

    pub fn unreasonable_frame_nanos(&self) -> u64 {
        self.unreasonable_frame_us.saturating_mul(NANOS_PER_MICRO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = WatchdogConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scan_interval(), Duration::from_millis(5));
        assert_eq!(config.unreasonable_frame_nanos(), 100_000);
        assert_eq!(config.unreasonable_dispatch_nanos(), 150_000_000);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = WatchdogConfig::from_json_str(
            r#"{ "forced_logging_interval_ms": 2000, "application_prefixes": ["myapp::"] }"#,
        )
        .unwrap();
        assert_eq!(config.forced_logging_interval_ms, 2000);
        assert_eq!(config.application_prefixes, vec!["myapp::".to_string()]);
        assert_eq!(config.scan_interval_ms, 5);
        assert!(!config.risk_rules.is_empty());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = WatchdogConfig::from_json_str(r#"{ "scan_interval_ms": 0 }"#).unwrap_err();
        assert!(err.to_string().contains("scan_interval_ms"));
    }

    #[test]
    fn test_risk_rule_json_shape() {
        let config = WatchdogConfig::from_json_str(
            r#"{ "risk_rules": [
                { "owner_prefix": "myapp::db" },
                { "owner_prefix": "myapp::net", "method": { "kind": "exact", "value": "dial" } }
            ] }"#,
        )
        .unwrap();
        assert_eq!(config.risk_rules.len(), 2);
        assert_eq!(config.risk_rules[0].method, MethodMatch::Any);
        assert!(config.risk_rules[1].matches(&StackFrame::new("myapp::net::Client", "dial")));
    }

    #[test]
    fn test_method_match_contains_ignore_case() {
        let m = MethodMatch::ContainsIgnoreCase("read".into());
        assert!(m.matches("read_exact"));
        assert!(m.matches("doRead"));
        assert!(!m.matches("write"));
    }

    #[test]
    fn test_frame_pattern_wildcards() {
        let pattern = FramePattern::new(None, "wait", Some(true));
        assert!(pattern.matches(&StackFrame::native("std::sync::Condvar", "wait")));
        assert!(!pattern.matches(&StackFrame::new("std::sync::Condvar", "wait")));
        assert!(!pattern.matches(&StackFrame::native("std::sync::Condvar", "notify_one")));
    }
}
