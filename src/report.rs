//! Human-readable run and validation output, plus CSV export.

use std::fmt::Write as _;
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use thiserror::Error;

use crate::job::PartitionUnit;
use crate::runner::{JobReport, RunObserver, RunSummary};
use crate::validate::ValidationReport;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Observer that keeps every job report for later export.
#[derive(Debug, Default)]
pub struct ReportCollector {
    reports: Mutex<Vec<JobReport>>,
}

impl ReportCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collected reports ordered by unit.
    pub fn reports(&self) -> Vec<JobReport> {
        let mut reports = self
            .reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        reports.sort_by_key(|report| report.unit);
        reports
    }
}

impl RunObserver for ReportCollector {
    fn on_job_complete(&self, _unit: &PartitionUnit, report: &JobReport) {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report.clone());
    }
}

pub fn summary_line(summary: &RunSummary) -> String {
    format!(
        "backfill {}: total={} completed={} empty={} failed={} incomplete={} not_started={} rows={} elapsed={:.1}s",
        if summary.is_success() { "ok" } else { "incomplete" },
        summary.total,
        summary.completed,
        summary.empty,
        summary.failed,
        summary.incomplete,
        summary.not_started,
        summary.rows_total,
        summary.elapsed_total_seconds
    )
}

/// One row per failed unit, columns padded to the widest value.
pub fn failure_table(summary: &RunSummary) -> String {
    let header = ["FAMILY", "PAIR", "MONTH", "KIND", "ELAPSED", "ERROR"];
    let rows: Vec<[String; 6]> = summary
        .failures
        .iter()
        .map(|failure| {
            [
                failure.unit.family.to_string(),
                failure.unit.pair.to_string(),
                failure.unit.month.to_string(),
                failure.kind.to_string(),
                format!("{:.1}s", failure.elapsed_seconds),
                failure.message.clone(),
            ]
        })
        .collect();

    let mut widths = header.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let mut out = String::new();
    push_row(&mut out, &widths, header.iter().map(|h| h.to_string()));
    for row in rows {
        push_row(&mut out, &widths, row.into_iter());
    }
    out
}

fn push_row(out: &mut String, widths: &[usize; 6], cells: impl Iterator<Item = String>) {
    let mut line = String::new();
    for (index, cell) in cells.enumerate() {
        if index + 1 == widths.len() {
            line.push_str(&cell);
        } else {
            let _ = write!(line, "{:<width$}  ", cell, width = widths[index]);
        }
    }
    out.push_str(line.trim_end());
    out.push('\n');
}

/// `PASS`/`FAIL` per check, offenders indented underneath.
pub fn validation_text(report: &ValidationReport) -> String {
    let mut out = String::new();
    for check in &report.checks {
        let _ = writeln!(
            out,
            "{} {} {} partitions={}",
            check.status().as_str(),
            check.family,
            check.check,
            check.partitions_checked
        );
        for offender in &check.offenders {
            let _ = writeln!(out, "    {}: {}", offender.unit, offender.detail);
        }
    }
    let _ = writeln!(
        out,
        "validation {}",
        if report.passed() { "PASSED" } else { "FAILED" }
    );
    out
}

#[derive(Debug, Serialize)]
struct JobCsvRow<'a> {
    family: &'static str,
    pair: &'static str,
    year: i32,
    month: u32,
    status: &'static str,
    rows_written: usize,
    batches: usize,
    elapsed_seconds: f64,
    error_kind: &'static str,
    error: &'a str,
}

#[derive(Debug, Serialize)]
struct CheckCsvRow<'a> {
    family: &'static str,
    check: &'static str,
    status: &'static str,
    partitions_checked: usize,
    pair: Option<&'static str>,
    year: Option<i32>,
    month: Option<u32>,
    detail: &'a str,
}

pub fn write_run_csv<W: io::Write>(writer: W, reports: &[JobReport]) -> Result<(), ReportError> {
    let mut csv = csv::Writer::from_writer(writer);
    for report in reports {
        csv.serialize(JobCsvRow {
            family: report.unit.family.as_str(),
            pair: report.unit.pair.as_str(),
            year: report.unit.month.year,
            month: report.unit.month.month,
            status: report.status.as_str(),
            rows_written: report.rows_written,
            batches: report.batches,
            elapsed_seconds: report.elapsed_seconds,
            error_kind: report.error_kind.unwrap_or(""),
            error: report.error.as_deref().unwrap_or(""),
        })?;
    }
    csv.flush()?;
    Ok(())
}

/// One row per offender; a passing check gets a single row with empty unit columns.
pub fn write_validation_csv<W: io::Write>(
    writer: W,
    report: &ValidationReport,
) -> Result<(), ReportError> {
    let mut csv = csv::Writer::from_writer(writer);
    for check in &report.checks {
        let base = |unit: Option<&PartitionUnit>, detail| CheckCsvRow {
            family: check.family.as_str(),
            check: check.check,
            status: check.status().as_str(),
            partitions_checked: check.partitions_checked,
            pair: unit.map(|u| u.pair.as_str()),
            year: unit.map(|u| u.month.year),
            month: unit.map(|u| u.month.month),
            detail,
        };
        if check.offenders.is_empty() {
            csv.serialize(base(None, ""))?;
        }
        for offender in &check.offenders {
            csv.serialize(base(Some(&offender.unit), offender.detail.as_str()))?;
        }
    }
    csv.flush()?;
    Ok(())
}

pub fn write_run_csv_file(path: &Path, reports: &[JobReport]) -> Result<(), ReportError> {
    write_run_csv(File::create(path)?, reports)
}

pub fn write_validation_csv_file(
    path: &Path,
    report: &ValidationReport,
) -> Result<(), ReportError> {
    write_validation_csv(File::create(path)?, report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::YearMonth;
    use crate::family::FamilyKind;
    use crate::pairs::Pair;
    use crate::runner::{FailureRecord, JobStatus};
    use crate::validate::{CheckResult, Offender, CHECK_PARTITION_COVERAGE};

    fn unit(pair: Pair) -> PartitionUnit {
        PartitionUnit {
            family: FamilyKind::Regression,
            pair,
            month: YearMonth::new(2020, 2).unwrap(),
        }
    }

    #[test]
    fn failure_table_lists_each_failure() {
        let summary = RunSummary {
            total: 2,
            failed: 1,
            completed: 1,
            failures: vec![FailureRecord {
                unit: unit(Pair::Gbpusd),
                kind: "missing_baseline",
                message: "no baseline rate for gbpusd".to_string(),
                elapsed_seconds: 0.25,
            }],
            ..RunSummary::default()
        };
        let table = failure_table(&summary);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("FAMILY"));
        assert!(lines[1].contains("gbpusd"));
        assert!(lines[1].contains("2020-02"));
        assert!(lines[1].ends_with("no baseline rate for gbpusd"));
        assert!(summary_line(&summary).contains("failed=1"));
    }

    #[test]
    fn run_csv_has_one_row_per_job() {
        let reports = vec![JobReport {
            unit: unit(Pair::Eurusd),
            status: JobStatus::Completed,
            rows_written: 120,
            batches: 1,
            elapsed_seconds: 1.5,
            error_kind: None,
            error: None,
        }];
        let mut buffer = Vec::new();
        write_run_csv(&mut buffer, &reports).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("family,pair,year,month,status,rows_written,batches,elapsed_seconds,error_kind,error")
        );
        assert_eq!(lines.next(), Some("reg,eurusd,2020,2,completed,120,1,1.5,,"));
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn validation_outputs_mark_failures() {
        let report = ValidationReport {
            checks: vec![CheckResult {
                family: FamilyKind::Regression,
                check: CHECK_PARTITION_COVERAGE,
                partitions_checked: 2,
                offenders: vec![Offender {
                    unit: unit(Pair::Usdjpy),
                    detail: "partition missing".to_string(),
                }],
            }],
        };
        let text = validation_text(&report);
        assert!(text.starts_with("FAIL reg partition_coverage partitions=2"));
        assert!(text.contains("reg/usdjpy/2020-02: partition missing"));
        assert!(text.trim_end().ends_with("validation FAILED"));

        let mut buffer = Vec::new();
        write_validation_csv(&mut buffer, &report).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("reg,partition_coverage,FAIL,2,usdjpy,2020,2,partition missing"));
    }
}
