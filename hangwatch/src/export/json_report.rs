use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use crate::report::RenderedReport;

/// Top-level JSON container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportDocument {
    pub tool: String,
    pub version: String,
    /// Distinct hang IDs across all reports
    #[serde(rename = "hangCount")]
    pub hang_count: usize,
    pub reports: Vec<RenderedReport>,
}

/// Accumulates rendered reports and writes them as one document
#[derive(Debug, Default)]
pub struct JsonReportExporter {
    reports: Vec<RenderedReport>,
}

impl JsonReportExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, report: RenderedReport) {
        self.reports.push(report);
    }

    pub fn extend(&mut self, reports: impl IntoIterator<Item = RenderedReport>) {
        self.reports.extend(reports);
    }

    pub fn report_count(&self) -> usize {
        self.reports.len()
    }

    pub fn hang_count(&self) -> usize {
        self.reports.iter().filter_map(|r| r.hang).collect::<BTreeSet<_>>().len()
    }

    /// Write the document as pretty-printed JSON.
    ///
    /// # Example
    /// ```no_run
    /// # use hangwatch::export::JsonReportExporter;
    /// # use std::fs::File;
    /// # fn example(exporter: JsonReportExporter) -> anyhow::Result<()> {
    /// let file = File::create("hangs.json")?;
    /// exporter.export(file)?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn export<W: Write>(&self, writer: W) -> Result<()> {
        let document = ReportDocument {
            tool: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            hang_count: self.hang_count(),
            reports: self.reports.clone(),
        };
        serde_json::to_writer_pretty(writer, &document).context("Failed to write report JSON")?;
        Ok(())
    }

    pub fn export_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("Failed to create export file {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        self.export(&mut writer)?;
        writer.flush().context("Failed to flush export file")?;
        Ok(())
    }

    /// Read back a document written by [`export`](Self::export).
    pub fn load<R: Read>(reader: R) -> Result<ReportDocument> {
        serde_json::from_reader(reader).context("Failed to parse report JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DispatchId, HangId, RiskLevel};
    use crate::report::ReportKind;

    fn report(hang: Option<u64>) -> RenderedReport {
        RenderedReport {
            priority: RiskLevel::High,
            kind: ReportKind::Dispatch,
            dispatch: Some(DispatchId(3)),
            hang: hang.map(HangId),
            text: "==== Dispatch #3 in progress ====".to_string(),
        }
    }

    #[test]
    fn test_hang_count_is_distinct() {
        let mut exporter = JsonReportExporter::new();
        exporter.extend([report(Some(1)), report(Some(1)), report(Some(2)), report(None)]);
        assert_eq!(exporter.report_count(), 4);
        assert_eq!(exporter.hang_count(), 2);
    }

    #[test]
    fn test_export_reads_back() {
        let mut exporter = JsonReportExporter::new();
        exporter.add(report(Some(1)));
        let mut buffer = Vec::new();
        exporter.export(&mut buffer).unwrap();

        let document = JsonReportExporter::load(buffer.as_slice()).unwrap();
        assert_eq!(document.tool, "hangwatch");
        assert_eq!(document.hang_count, 1);
        assert_eq!(document.reports[0].hang, Some(HangId(1)));
    }
}
