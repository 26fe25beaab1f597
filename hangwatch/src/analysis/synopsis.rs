//! Per-dispatch call tree keyed by stack height.
//!
//! A [`ProfileSynopsis`] holds one [`CallTreeNode`] per height (0 = the
//! outermost frame) of the frames currently believed to be on the stack.
//! When the stack unwinds past a node, the node is retired into the new
//! crux: its time is credited to the crux, and if it looked interesting it
//! is kept in the crux's sub-profile so the final dump still shows it.

use std::collections::BTreeMap;
use std::fmt;

use crate::classification::RiskClassifier;
use crate::domain::StackFrame;
use crate::report::format_elapsed_seconds;

/// Elapsed time column width, so zero-time nodes still line up.
const BLANK_ELAPSED: &str = "             ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallTreeNode {
    pub height: usize,
    pub frame: StackFrame,
    pub elapsed_nanos: u64,
    pub called_blocking_wait: bool,
    pub performance_risk: bool,
    pub application_code: bool,
    /// Retired descendants worth keeping, created on first demotion
    sub_profile: Option<Box<ProfileSynopsis>>,
}

impl CallTreeNode {
    fn new(height: usize, frame: StackFrame, classifier: &RiskClassifier) -> Self {
        Self {
            height,
            performance_risk: classifier.is_performance_risk(&frame),
            application_code: classifier.is_application_code(&frame),
            frame,
            elapsed_nanos: 0,
            called_blocking_wait: false,
            sub_profile: None,
        }
    }

    /// Whether a retired node keeps its place in the crux's sub-profile.
    #[must_use]
    pub fn is_significant(&self, unreasonable_frame_nanos: u64) -> bool {
        self.elapsed_nanos >= unreasonable_frame_nanos
            || self.called_blocking_wait
            || self.performance_risk
            || self.application_code
    }

    pub fn sub_profile(&self) -> Option<&ProfileSynopsis> {
        self.sub_profile.as_deref()
    }

    fn sub_profile_mut(&mut self) -> &mut ProfileSynopsis {
        self.sub_profile.get_or_insert_with(Box::default)
    }

    fn dump_into(&self, out: &mut String, indent_sum: &mut String, indent: &str) {
        out.push('\n');
        out.push_str(indent_sum);
        out.push_str(&self.to_string());
        if let Some(sub) = &self.sub_profile {
            indent_sum.push_str(indent);
            sub.dump_into(out, indent_sum, indent);
            indent_sum.truncate(indent_sum.len() - indent.len());
        }
    }
}

impl fmt::Display for CallTreeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.elapsed_nanos == 0 {
            f.write_str(BLANK_ELAPSED)?;
        } else {
            f.write_str(&format_elapsed_seconds(self.elapsed_nanos))?;
        }
        write!(f, " [{}]{}", self.height, self.frame)?;
        if self.called_blocking_wait {
            f.write_str(" ** blocking wait **")?;
        }
        if self.performance_risk {
            f.write_str(" -- performance risk --")?;
        }
        Ok(())
    }
}

/// Call tree of one dispatch (or one node's retired descendants).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileSynopsis {
    nodes: BTreeMap<usize, CallTreeNode>,
}

impl ProfileSynopsis {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, height: usize) -> Option<&CallTreeNode> {
        self.nodes.get(&height)
    }

    pub fn get_mut(&mut self, height: usize) -> Option<&mut CallTreeNode> {
        self.nodes.get_mut(&height)
    }

    /// Node at `height`, created for `frame` if absent. An existing node is
    /// returned unchanged even if `frame` differs.
    pub fn get_or_create(
        &mut self,
        height: usize,
        frame: &StackFrame,
        classifier: &RiskClassifier,
    ) -> &mut CallTreeNode {
        self.nodes
            .entry(height)
            .or_insert_with(|| CallTreeNode::new(height, frame.clone(), classifier))
    }

    pub fn remove(&mut self, height: usize) -> Option<CallTreeNode> {
        self.nodes.remove(&height)
    }

    /// Fold a retired node into the crux at `crux_height`: its time is
    /// credited to the crux, and it is demoted into the crux's sub-profile
    /// if significant. Returns false (and drops the node) when there is no
    /// crux at that height.
    #[must_use]
    pub fn record_frame_info(
        &mut self,
        crux_height: usize,
        retired: CallTreeNode,
        unreasonable_frame_nanos: u64,
    ) -> bool {
        let Some(crux) = self.nodes.get_mut(&crux_height) else {
            return false;
        };
        crux.elapsed_nanos += retired.elapsed_nanos;
        if retired.is_significant(unreasonable_frame_nanos) {
            crux.sub_profile_mut().nodes.insert(retired.height, retired);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in height order.
    pub fn nodes(&self) -> impl Iterator<Item = &CallTreeNode> {
        self.nodes.values()
    }

    /// Indented tree, one node per line, each line preceded by a newline.
    #[must_use]
    pub fn dump(&self, indent: &str) -> String {
        let mut out = String::new();
        let mut indent_sum = indent.to_string();
        self.dump_into(&mut out, &mut indent_sum, indent);
        out
    }

    fn dump_into(&self, out: &mut String, indent_sum: &mut String, indent: &str) {
        for node in self.nodes.values() {
            node.dump_into(out, indent_sum, indent);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchdogConfig;

    const UNREASONABLE: u64 = 100_000;

    fn classifier() -> RiskClassifier {
        RiskClassifier::from_config(&WatchdogConfig::default())
    }

    fn plain(name: &str) -> StackFrame {
        StackFrame::new("lib::plain", name)
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let c = classifier();
        let mut tree = ProfileSynopsis::new();
        tree.get_or_create(1, &plain("b"), &c).elapsed_nanos += 5;
        let node = tree.get_or_create(1, &plain("other"), &c);
        assert_eq!(node.elapsed_nanos, 5);
        assert_eq!(node.frame, plain("b"));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_flags_classified_at_creation() {
        let c = classifier();
        let mut tree = ProfileSynopsis::new();
        let app = tree.get_or_create(0, &StackFrame::new("app::main", "run"), &c);
        assert!(app.application_code);
        let risk = tree.get_or_create(1, &StackFrame::new("flate2::read::GzDecoder", "read"), &c);
        assert!(risk.performance_risk);
    }

    #[test]
    fn test_insignificant_retired_node_vanishes() {
        let c = classifier();
        let mut tree = ProfileSynopsis::new();
        tree.get_or_create(0, &plain("a"), &c);
        tree.get_or_create(1, &plain("b"), &c).elapsed_nanos = 10;

        let retired = tree.remove(1).unwrap();
        assert!(tree.record_frame_info(0, retired, UNREASONABLE));

        let crux = tree.get(0).unwrap();
        assert_eq!(crux.elapsed_nanos, 10);
        assert!(crux.sub_profile().is_none());
    }

    #[test]
    fn test_significant_retired_nodes_demoted() {
        let c = classifier();
        let mut tree = ProfileSynopsis::new();
        tree.get_or_create(0, &plain("a"), &c);

        let mut slow = CallTreeNode::new(1, plain("slow"), &c);
        slow.elapsed_nanos = UNREASONABLE;
        let mut waited = CallTreeNode::new(2, plain("waited"), &c);
        waited.called_blocking_wait = true;
        let app = CallTreeNode::new(3, StackFrame::new("app::x", "y"), &c);

        assert!(tree.record_frame_info(0, slow, UNREASONABLE));
        assert!(tree.record_frame_info(0, waited, UNREASONABLE));
        assert!(tree.record_frame_info(0, app, UNREASONABLE));

        let crux = tree.get(0).unwrap();
        assert_eq!(crux.elapsed_nanos, UNREASONABLE);
        let sub = crux.sub_profile().unwrap();
        assert_eq!(sub.nodes().map(|n| n.height).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_missing_crux_reports_false() {
        let c = classifier();
        let mut tree = ProfileSynopsis::new();
        let node = CallTreeNode::new(2, plain("b"), &c);
        assert!(!tree.record_frame_info(1, node, UNREASONABLE));
        assert!(tree.is_empty());
    }

    #[test]
    fn test_dump_indents_sub_profiles() {
        let c = classifier();
        let mut tree = ProfileSynopsis::new();
        tree.get_or_create(0, &plain("a"), &c).elapsed_nanos = 5_000_000;
        let mut child = CallTreeNode::new(1, StackFrame::new("app::x", "y"), &c);
        child.called_blocking_wait = true;
        assert!(tree.record_frame_info(0, child, UNREASONABLE));

        let dump = tree.dump("  ");
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines[0], "");
        assert_eq!(lines[1], "  00:005.000000 [0]lib::plain::a(Unknown Source)");
        assert_eq!(
            lines[2],
            format!("    {BLANK_ELAPSED} [1]app::x::y(Unknown Source) ** blocking wait **")
        );
    }
}
