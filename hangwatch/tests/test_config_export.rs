use std::io::Write;

use hangwatch::config::WatchdogConfig;
use hangwatch::domain::{ConfigError, DispatchId, HangId, RiskLevel};
use hangwatch::export::JsonReportExporter;
use hangwatch::report::{RenderedReport, ReportKind};

#[test]
fn test_config_file_overrides_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "forced_logging_interval_ms": 2000,
            "application_prefixes": ["editor::"],
            "protected_resource_prefixes": ["gui::"]
        }}"#
    )
    .unwrap();

    let config = WatchdogConfig::from_file(file.path()).unwrap();
    assert_eq!(config.forced_logging_interval_ms, 2_000);
    assert_eq!(config.application_prefixes, vec!["editor::".to_string()]);
    assert_eq!(config.protected_resource_prefixes, vec!["gui::".to_string()]);
    assert_eq!(config.scan_interval_ms, WatchdogConfig::default().scan_interval_ms);
    assert_eq!(config.idle_wait_pattern, WatchdogConfig::default().idle_wait_pattern);
}

#[test]
fn test_config_file_rejects_zero_interval() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{ "scan_interval_ms": 0 }}"#).unwrap();
    let err = WatchdogConfig::from_file(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));
    assert!(err.to_string().contains("scan_interval_ms"));
}

#[test]
fn test_missing_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = WatchdogConfig::from_file(dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}

fn report(kind: ReportKind, hang: Option<u64>, text: &str) -> RenderedReport {
    RenderedReport {
        priority: RiskLevel::High,
        kind,
        dispatch: Some(DispatchId(4)),
        hang: hang.map(HangId),
        text: text.to_string(),
    }
}

#[test]
fn test_export_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reports.json");

    let mut exporter = JsonReportExporter::new();
    exporter.add(report(ReportKind::Dispatch, Some(1), "==== Dispatch #4 in progress ===="));
    exporter.add(report(ReportKind::Contention, Some(1), "==== Risk Check #0 for dispatch #4 ===="));
    exporter.add(report(ReportKind::Dispatch, Some(2), "==== Dispatch #4 complete ===="));
    exporter.export_to_file(&path).unwrap();

    let document = JsonReportExporter::load(std::fs::File::open(&path).unwrap()).unwrap();
    assert_eq!(document.tool, "hangwatch");
    assert_eq!(document.hang_count, 2);
    assert_eq!(document.reports.len(), 3);
    assert_eq!(document.reports[1].kind, ReportKind::Contention);
    assert_eq!(document.reports[2].hang, Some(HangId(2)));

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(raw["hangCount"], 2);
}
