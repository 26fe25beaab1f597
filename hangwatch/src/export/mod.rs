//! Report export
//!
//! Collected reports are written as a single JSON document for offline
//! reading or diffing between runs.

pub mod json_report;

pub use json_report::{JsonReportExporter, ReportDocument};
