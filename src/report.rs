//! Result reports: persisted JSON documents and terminal summaries

use crate::analyzer::AnalysisResult;
use crate::cleanup::RESULT_PREFIX;
use crate::diagnostic::Severity;
use crate::engine::FileResult;
use colored::*;
use log::debug;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResultDocument<'a> {
    tool_version: &'static str,
    generated_at: u64,
    exit_code: i32,
    #[serde(flatten)]
    result: &'a AnalysisResult,
}

/// Serialize a result as a JSON report
pub fn format_json(result: &AnalysisResult) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&ResultDocument {
        tool_version: env!("CARGO_PKG_VERSION"),
        generated_at: now_millis(),
        exit_code: result.exit_code(),
        result,
    })
}

/// Write `XFI_RESULT.json` and a timestamped copy into `dir`.
///
/// Returns the path of the timestamped copy.
pub fn write_result(dir: &Path, result: &AnalysisResult) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let content = format_json(result).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let latest = dir.join(format!("{}.json", RESULT_PREFIX));
    let mut stamp = now_millis();
    let mut history = dir.join(format!("{}-{}.json", RESULT_PREFIX, stamp));
    while history.exists() {
        stamp += 1;
        history = dir.join(format!("{}-{}.json", RESULT_PREFIX, stamp));
    }

    fs::write(&latest, &content)?;
    fs::write(&history, &content)?;
    debug!("Wrote {} and {}", latest.display(), history.display());
    Ok(history)
}

fn severity_str(severity: Severity, colored: bool) -> ColoredString {
    let s = severity.to_string();
    if !colored {
        return s.normal();
    }
    match severity {
        Severity::Fatal => s.red().bold(),
        Severity::Error => s.red(),
        Severity::Warning => s.yellow().bold(),
    }
}

fn format_file(file: &FileResult, colored: bool, output: &mut String) {
    if file.events.is_empty() && file.errors.is_empty() {
        return;
    }

    if colored {
        output.push_str(&format!("{}\n", file.file_path.underline()));
    } else {
        output.push_str(&format!("{}\n", file.file_path));
    }

    for event in &file.events {
        output.push_str(&format!(
            "  {} [{}] {}\n",
            severity_str(event.severity, colored),
            event.rule_name,
            event.message().unwrap_or(&event.event_type)
        ));
    }

    for error in &file.errors {
        let rule = error.rule_name.as_deref().unwrap_or("-");
        let label = if colored {
            "execution error".magenta().to_string()
        } else {
            "execution error".to_string()
        };
        output.push_str(&format!(
            "  {} [{}] {} ({})\n",
            label,
            rule,
            error.error.message,
            severity_str(error.level(), colored)
        ));
    }
    output.push('\n');
}

/// Human-readable summary separating findings from execution errors
pub fn format_text(result: &AnalysisResult, colored: bool) -> String {
    let mut output = String::new();

    for file in result.results() {
        format_file(file, colored, &mut output);
    }

    output.push_str(&format!(
        "{} {} analyzed, {} from cache\n",
        result.files_analyzed + result.files_from_cache,
        if result.files_analyzed + result.files_from_cache == 1 {
            "file"
        } else {
            "files"
        },
        result.files_from_cache
    ));

    let findings = format!(
        "Findings: {} fatal, {} error, {} warning",
        result.fatal_count, result.error_count, result.warning_count
    );
    let errors = format!(
        "Execution errors: {} ({} fatal)",
        result.execution_error_count, result.fatal_execution_error_count
    );

    if colored {
        let findings = if result.finding_count() == 0 {
            findings.green()
        } else {
            findings.yellow()
        };
        let errors = if result.fatal_execution_error_count > 0 {
            errors.red().bold()
        } else {
            errors.normal()
        };
        output.push_str(&format!("{}\n{}\n", findings, errors));
    } else {
        output.push_str(&format!("{}\n{}\n", findings, errors));
    }

    output.push_str(&format!("Finished in {:.2?}\n", result.duration));
    output
}

/// Rule timing table, slowest first
pub fn format_timings(result: &AnalysisResult) -> String {
    let timings = result.sorted_timings();
    if timings.is_empty() {
        return "No timing data available".to_string();
    }

    let mut output = String::new();
    output.push_str(&format!(
        "{:<40} {:>12} {:>12} {:>10} {:>12}\n",
        "Rule", "Total", "Avg", "Evals", "Matches"
    ));
    output.push_str(&"-".repeat(90));
    output.push('\n');

    for timing in timings {
        let total_ms = timing.total_time.as_secs_f64() * 1000.0;
        let avg_us = timing.avg_time().as_secs_f64() * 1_000_000.0;

        output.push_str(&format!(
            "{:<40} {:>10.2}ms {:>10.2}µs {:>10} {:>12}\n",
            timing.rule_name, total_ms, avg_us, timing.evaluation_count, timing.match_count
        ));
    }

    output
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
