//! Batch summary renderers.

use std::io::Write;

use anyhow::anyhow;
use clap::ValueEnum;
use tescan_scan::{BatchSummary, ScanRecord};

use crate::error::{CliError, CliResult};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    #[default]
    Table,
    Json,
}

pub(crate) fn render_summary(
    summary: &BatchSummary,
    format: OutputFormat,
    out: &mut impl Write,
) -> CliResult<()> {
    let written = match format {
        OutputFormat::Json => {
            let text = serde_json::to_string_pretty(summary)
                .map_err(|err| CliError::failure(anyhow!("failed to format JSON: {err}")))?;
            writeln!(out, "{text}")
        }
        OutputFormat::Table => write_table(summary, out),
    };
    written.map_err(|err| CliError::failure(anyhow!("failed to write summary: {err}")))
}

fn write_table(summary: &BatchSummary, out: &mut impl Write) -> std::io::Result<()> {
    writeln!(out, "run: {}", summary.run_id)?;
    let elapsed = summary.finished_at - summary.started_at;
    writeln!(
        out,
        "files: {} in {:.1}s",
        summary.total(),
        duration_secs(elapsed)
    )?;
    writeln!(
        out,
        "benign: {}  malicious: {}  error: {}",
        summary.benign, summary.malicious, summary.error
    )?;
    writeln!(
        out,
        "cache hits: {}  transfer failures: {}  skipped: {}  directories removed: {}",
        summary.cache_hits,
        summary.transfer_failures,
        summary.skipped.len(),
        summary.removed_directories
    )?;

    let flagged: Vec<&ScanRecord> = summary
        .records
        .iter()
        .filter(|record| record.needs_attention())
        .collect();
    if !flagged.is_empty() {
        writeln!(out)?;
        writeln!(out, "{:<10} {:<48} DETAIL", "VERDICT", "PATH")?;
        for record in flagged {
            writeln!(
                out,
                "{:<10} {:<48} {}",
                record.verdict.as_str(),
                record.relative_path.display(),
                detail(record)
            )?;
        }
    }
    for path in &summary.skipped {
        writeln!(out, "skipped: {}", path.display())?;
    }
    Ok(())
}

fn detail(record: &ScanRecord) -> String {
    let mut parts = Vec::new();
    if let Some(error) = &record.error {
        parts.push(error.clone());
    }
    if let Some(error) = &record.transfer_error {
        if record.destination.is_some() {
            parts.push(format!("relocation incomplete: {error}"));
        } else {
            parts.push(format!("not relocated: {error}"));
        }
    }
    if let Some(error) = &record.report_error {
        parts.push(format!("report: {error}"));
    }
    if parts.is_empty() {
        if let Some(report) = &record.report_path {
            parts.push(format!("report at {}", report.display()));
        } else if let Some(destination) = &record.destination {
            parts.push(format!("moved to {}", destination.display()));
        }
    }
    parts.join("; ")
}

#[allow(clippy::cast_precision_loss)]
fn duration_secs(elapsed: chrono::TimeDelta) -> f64 {
    elapsed.num_milliseconds().max(0) as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tescan_appliance::Verdict;
    use tescan_scan::ScanState;

    fn record(path: &str, verdict: Verdict) -> ScanRecord {
        ScanRecord {
            relative_path: PathBuf::from(path),
            verdict,
            cache_hit: false,
            destination: Some(PathBuf::from("/sorted").join(path)),
            transcript_path: None,
            report_path: None,
            transfer_error: None,
            error: None,
            report_error: None,
            final_state: ScanState::Done,
        }
    }

    fn summary() -> BatchSummary {
        let mut evil = record("evil.exe", Verdict::Malicious);
        evil.report_path = Some(PathBuf::from("/reports/evil.exe.report.tar.gz"));
        let mut stuck = record("stuck.doc", Verdict::Error);
        stuck.error = Some("no verdict within the poll budget".into());
        BatchSummary::new(
            uuid::Uuid::nil(),
            chrono::Utc::now(),
            vec![record("clean.txt", Verdict::Benign), evil, stuck],
            vec![PathBuf::from("late.zip")],
            1,
        )
    }

    fn render(format: OutputFormat) -> CliResult<String> {
        let mut out = Vec::new();
        render_summary(&summary(), format, &mut out)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    #[test]
    fn table_lists_counts_and_flagged_files_only() -> CliResult<()> {
        let text = render(OutputFormat::Table)?;
        assert!(text.contains("benign: 1  malicious: 1  error: 1"));
        assert!(text.contains("skipped: 1"));
        assert!(text.contains("report at /reports/evil.exe.report.tar.gz"));
        assert!(text.contains("no verdict within the poll budget"));
        assert!(text.contains("skipped: late.zip"));
        assert!(!text.contains("clean.txt"));
        Ok(())
    }

    #[test]
    fn json_is_the_serialized_summary() -> CliResult<()> {
        let text = render(OutputFormat::Json)?;
        let value: serde_json::Value = serde_json::from_str(&text)
            .map_err(|err| CliError::failure(anyhow!("invalid JSON: {err}")))?;
        assert_eq!(value["malicious"], 1);
        assert_eq!(value["records"].as_array().map(Vec::len), Some(3));
        assert_eq!(value["records"][0]["relative_path"], "clean.txt");
        assert_eq!(value["skipped"][0], "late.zip");
        Ok(())
    }

    #[test]
    fn detail_reports_failed_relocation() {
        let mut kept = record("kept.txt", Verdict::Benign);
        kept.destination = None;
        kept.transfer_error = Some("transfer retries exhausted".into());
        assert!(kept.needs_attention());
        assert_eq!(detail(&kept), "not relocated: transfer retries exhausted");
    }

    #[test]
    fn detail_distinguishes_copy_left_behind() {
        let mut twice = record("twice.txt", Verdict::Benign);
        twice.transfer_error = Some("source not removed".into());
        assert_eq!(detail(&twice), "relocation incomplete: source not removed");
    }
}
