//! Output formatters for command results.

use clap::ValueEnum;
use comfy_table::Table;
use spartan_migrate::{Direction, RunReport, StatusReport};

/// Output format for results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format
    Table,
    /// JSON format
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Trait for formatting output.
pub trait Formatter {
    /// Format the result of `migrate init`.
    fn format_init(&self, created: bool) -> String;

    /// Format an upgrade or rollback report.
    fn format_run(&self, report: &RunReport) -> String;

    /// Format a status report.
    fn format_status(&self, report: &StatusReport) -> String;
}

/// Create a formatter for the given output format.
pub fn create_formatter(format: OutputFormat) -> Box<dyn Formatter> {
    match format {
        OutputFormat::Table => Box::new(TableFormatter),
        OutputFormat::Json => Box::new(JsonFormatter),
    }
}

/// Plain text and table formatter using comfy-table.
pub struct TableFormatter;

impl Formatter for TableFormatter {
    fn format_init(&self, created: bool) -> String {
        if created {
            "initialized".to_string()
        } else {
            "already initialized".to_string()
        }
    }

    fn format_run(&self, report: &RunReport) -> String {
        let verb = match report.direction {
            Direction::Up => "applied",
            Direction::Down => "reverted",
        };

        let mut lines = Vec::new();
        for outcome in &report.completed {
            let mut line = format!(
                "{} {} ({} operation(s), {} ms)",
                verb,
                outcome.identifier,
                outcome.operations,
                outcome.elapsed.as_millis()
            );
            if !outcome.atomic {
                line.push_str(" [not transactional]");
            }
            lines.push(line);
        }

        if report.is_noop() {
            lines.push(match report.direction {
                Direction::Up => "no pending migrations".to_string(),
                Direction::Down => "no migrations to roll back".to_string(),
            });
        }

        for identifier in &report.not_run {
            lines.push(format!("not run {}", identifier));
        }
        for warning in &report.warnings {
            lines.push(format!("warning: {}", warning));
        }

        lines.join("\n")
    }

    fn format_status(&self, report: &StatusReport) -> String {
        let mut table = Table::new();
        table.set_header(vec!["Migration", "Status", "Applied At"]);

        for entry in &report.entries {
            let applied_at = entry
                .applied_at
                .map(|ts| ts.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_default();
            table.add_row(vec![
                entry.identifier.clone(),
                entry.status.to_string(),
                applied_at,
            ]);
        }

        let mut output = if report.entries.is_empty() {
            "No migrations".to_string()
        } else {
            table.to_string()
        };

        output.push_str(&format!(
            "\n{} migration(s), {} pending, {} drifted",
            report.entries.len(),
            report.pending_count(),
            report.drift_count()
        ));
        for warning in &report.warnings {
            output.push_str(&format!("\nwarning: {}", warning));
        }
        output
    }
}

/// JSON formatter.
pub struct JsonFormatter;

impl Formatter for JsonFormatter {
    fn format_init(&self, created: bool) -> String {
        serde_json::json!({ "initialized": true, "created": created }).to_string()
    }

    fn format_run(&self, report: &RunReport) -> String {
        let completed: Vec<serde_json::Value> = report
            .completed
            .iter()
            .map(|outcome| {
                serde_json::json!({
                    "identifier": outcome.identifier,
                    "operations": outcome.operations,
                    "atomic": outcome.atomic,
                    "elapsed_ms": outcome.elapsed.as_millis() as u64,
                })
            })
            .collect();

        let failed = match &report.failed {
            Some(failed) => serde_json::json!({
                "identifier": failed.identifier,
                "error": failed.error.to_string(),
            }),
            None => serde_json::Value::Null,
        };

        let warnings: Vec<String> = report.warnings.iter().map(|w| w.to_string()).collect();

        let value = serde_json::json!({
            "direction": report.direction,
            "completed": completed,
            "failed": failed,
            "not_run": report.not_run,
            "warnings": warnings,
        });
        serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_string())
    }

    fn format_status(&self, report: &StatusReport) -> String {
        serde_json::to_string_pretty(report).unwrap_or_else(|_| "{}".to_string())
    }
}
