//! Frame and resource classification.
//!
//! Pure predicates the analyzers consult while diffing stacks and scanning
//! thread dumps. Two questions are answered per frame:
//!
//! 1. **Is this the monitored application's own code?** Owner prefix match
//!    against the configured application namespaces.
//! 2. **Is this a known slow or blocking call site?** Match against the
//!    configured risk table (crypto initialization, compression, blocking
//!    socket and file I/O, parking, clipboard, dynamic loading).
//!
//! A third question is asked of lock types and stack owners seen on *other*
//! threads:
//!
//! 3. **Is this a protected resource?** A type only the dispatch thread may
//!    touch (widgets, in the typical GUI case). Unresolvable names are an
//!    expected outcome here, not an error: frames without symbols, raw
//!    addresses and anonymous locks show up in every real dump.
//!
//! All tables are fixed at construction; the classifier is shared between
//! threads without synchronization.

use log::debug;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::config::{RiskRule, WatchdogConfig};
use crate::domain::{IntrospectionError, StackFrame};

// =============================================================================
// RISK CLASSIFIER
// =============================================================================

/// Read-only classification tables for stack frames.
#[derive(Debug, Clone)]
pub struct RiskClassifier {
    application_prefixes: Vec<String>,
    risk_rules: Vec<RiskRule>,
}

impl RiskClassifier {
    #[must_use]
    pub fn new(application_prefixes: Vec<String>, risk_rules: Vec<RiskRule>) -> Self {
        Self { application_prefixes, risk_rules }
    }

    #[must_use]
    pub fn from_config(config: &WatchdogConfig) -> Self {
        Self::new(config.application_prefixes.clone(), config.risk_rules.clone())
    }

    /// True if the frame belongs to the monitored application.
    #[must_use]
    pub fn is_application_code(&self, frame: &StackFrame) -> bool {
        self.application_prefixes.iter().any(|p| frame.owner.starts_with(p.as_str()))
    }

    /// True if the frame matches a known slow/blocking call site.
    #[must_use]
    pub fn is_performance_risk(&self, frame: &StackFrame) -> bool {
        self.risk_rules.iter().any(|rule| rule.matches(frame))
    }
}

// =============================================================================
// PROTECTED RESOURCE CLASSIFICATION
// =============================================================================

/// Decides whether a type belongs to the resource family the dispatch
/// thread must exclusively own.
pub trait ResourceClassifier: Send + Sync {
    /// # Errors
    /// Returns [`IntrospectionError::UnresolvableType`] when the name cannot
    /// be classified at all. Callers record this and move on.
    fn is_protected(&self, type_name: &str) -> Result<bool, IntrospectionError>;
}

/// Prefix-based classifier over a configured namespace list.
#[derive(Debug, Clone)]
pub struct PrefixResourceClassifier {
    prefixes: Vec<String>,
}

impl PrefixResourceClassifier {
    #[must_use]
    pub fn new(prefixes: Vec<String>) -> Self {
        Self { prefixes }
    }

    #[must_use]
    pub fn from_config(config: &WatchdogConfig) -> Self {
        Self::new(config.protected_resource_prefixes.clone())
    }
}

impl ResourceClassifier for PrefixResourceClassifier {
    fn is_protected(&self, type_name: &str) -> Result<bool, IntrospectionError> {
        if is_unresolvable(type_name) {
            diagnostics().record_unresolvable(type_name);
            return Err(IntrospectionError::UnresolvableType(type_name.to_string()));
        }
        diagnostics().record_resolved();
        Ok(self.prefixes.iter().any(|p| type_name.starts_with(p.as_str())))
    }
}

/// Names no classifier can say anything about: empty, placeholder, or a raw
/// address from an unsymbolized frame.
fn is_unresolvable(type_name: &str) -> bool {
    type_name.is_empty()
        || type_name == "<unknown>"
        || type_name.starts_with("0x")
        || type_name.starts_with("<library>")
}

// =============================================================================
// CLASSIFICATION DIAGNOSTICS
// =============================================================================

/// Counts resolvable vs unresolvable names seen by resource classification,
/// logging each unresolvable name once.
pub struct ClassificationDiagnostics {
    /// Names already logged (to avoid log spam on every scan)
    logged_names: Mutex<HashSet<String>>,
    resolved: AtomicU64,
    unresolvable: AtomicU64,
}

impl ClassificationDiagnostics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            logged_names: Mutex::new(HashSet::new()),
            resolved: AtomicU64::new(0),
            unresolvable: AtomicU64::new(0),
        }
    }

    pub fn record_resolved(&self) {
        self.resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unresolvable(&self, type_name: &str) {
        self.unresolvable.fetch_add(1, Ordering::Relaxed);

        // Using insert() return value avoids double hash lookup vs contains() + insert()
        if let Ok(mut logged) = self.logged_names.lock() {
            if logged.insert(type_name.to_owned()) {
                debug!("Cannot classify type '{type_name}' - treating as unprotected");
            }
        }
    }

    /// Percentage of classified names that could be resolved.
    ///
    /// Returns 100.0 if nothing has been classified yet.
    #[allow(clippy::cast_precision_loss)] // Precision loss acceptable for percentages
    pub fn resolution_coverage(&self) -> f64 {
        let resolved = self.resolved.load(Ordering::Relaxed);
        let unresolvable = self.unresolvable.load(Ordering::Relaxed);
        let total = resolved + unresolvable;

        if total > 0 {
            (resolved as f64 / total as f64) * 100.0
        } else {
            100.0
        }
    }
}

impl Default for ClassificationDiagnostics {
    fn default() -> Self {
        Self::new()
    }
}

/// Global diagnostics instance, initialized on first access.
static DIAGNOSTICS: OnceLock<ClassificationDiagnostics> = OnceLock::new();

/// Get the global classification diagnostics tracker.
pub fn diagnostics() -> &'static ClassificationDiagnostics {
    DIAGNOSTICS.get_or_init(ClassificationDiagnostics::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> RiskClassifier {
        RiskClassifier::from_config(&WatchdogConfig::default())
    }

    #[test]
    fn test_application_code_by_prefix() {
        let c = classifier();
        assert!(c.is_application_code(&StackFrame::new("app::editor", "save")));
        assert!(!c.is_application_code(&StackFrame::new("std::fs::File", "open")));
    }

    #[test]
    fn test_socket_read_is_risk() {
        let c = classifier();
        assert!(c.is_performance_risk(&StackFrame::new("std::net::TcpStream", "read_exact")));
        assert!(c.is_performance_risk(&StackFrame::new("std::net::TcpStream", "connect")));
        assert!(!c.is_performance_risk(&StackFrame::new("std::net::TcpStream", "peer_addr")));
    }

    #[test]
    fn test_compression_any_method_is_risk() {
        let c = classifier();
        assert!(c.is_performance_risk(&StackFrame::new("flate2::read::GzDecoder", "new")));
    }

    #[test]
    fn test_plain_code_is_not_risk() {
        let c = classifier();
        assert!(!c.is_performance_risk(&StackFrame::new("app::model", "recompute")));
    }

    #[test]
    fn test_protected_prefix() {
        let c = PrefixResourceClassifier::new(vec!["ui::widget::".into()]);
        assert!(c.is_protected("ui::widget::Button").unwrap());
        assert!(!c.is_protected("app::Cache").unwrap());
    }

    #[test]
    fn test_unresolvable_names_are_errors() {
        let c = PrefixResourceClassifier::new(vec!["ui::".into()]);
        assert!(matches!(c.is_protected(""), Err(IntrospectionError::UnresolvableType(_))));
        assert!(c.is_protected("0x7fff1234").is_err());
        assert!(c.is_protected("<unknown>").is_err());
    }

    #[test]
    fn test_diagnostics_coverage_bounds() {
        let d = ClassificationDiagnostics::new();
        assert!((d.resolution_coverage() - 100.0).abs() < f64::EPSILON);
        d.record_resolved();
        d.record_unresolvable("0x1");
        assert!((d.resolution_coverage() - 50.0).abs() < f64::EPSILON);
    }
}
