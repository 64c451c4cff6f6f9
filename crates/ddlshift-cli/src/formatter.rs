//! Output formatters for plans, records and schemas.

use clap::ValueEnum;
use comfy_table::{Cell, Table};
use ddlshift_core::{MigrationRecord, PreviewResult, SchemaSnapshot};

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
pub trait Formatter: Send + Sync {
    /// Format a dry-run preview.
    fn format_preview(&self, preview: &PreviewResult) -> String;

    /// Format one migration record.
    fn format_record(&self, record: &MigrationRecord) -> String;

    /// Format a list of migration records.
    fn format_history(&self, records: &[MigrationRecord]) -> String;

    /// Format a schema snapshot.
    fn format_snapshot(&self, snapshot: &SchemaSnapshot) -> String;

    /// Format a simple message.
    fn format_message(&self, message: &str) -> String;
}

/// Create a formatter for the given output format.
pub fn create_formatter(format: OutputFormat) -> Box<dyn Formatter> {
    match format {
        OutputFormat::Table => Box::new(TableFormatter),
        OutputFormat::Json => Box::new(JsonFormatter),
    }
}

/// Table formatter using comfy-table.
pub struct TableFormatter;

impl Formatter for TableFormatter {
    fn format_preview(&self, preview: &PreviewResult) -> String {
        let mut output = format!(
            "Plan {} for scope '{}'\nChecksum: {}\nRisk: {}\n",
            preview.plan_id, preview.scope, preview.checksum, preview.aggregate_risk
        );

        if preview.batches.is_empty() {
            output.push_str("\nNo changes");
            return output;
        }

        let mut table = Table::new();
        table.set_header(vec!["Batch", "Risk", "Operation", "Action"]);
        for batch in &preview.batches {
            for stmt in &batch.statements {
                table.add_row(vec![
                    Cell::new(batch.index),
                    Cell::new(stmt.risk),
                    Cell::new(&stmt.description),
                    Cell::new(&stmt.action),
                ]);
            }
        }
        output.push('\n');
        output.push_str(&table.to_string());

        output.push_str("\n\nRollback:\n");
        for line in &preview.rollback {
            output.push_str("  ");
            output.push_str(line);
            output.push('\n');
        }

        if !preview.irreversible.is_empty() {
            output.push_str("\nIrreversible:\n");
            for reason in &preview.irreversible {
                output.push_str("  ");
                output.push_str(reason);
                output.push('\n');
            }
        }
        output
    }

    fn format_record(&self, record: &MigrationRecord) -> String {
        let mut table = Table::new();
        table.set_header(vec!["Batch", "Operation", "Outcome", "Message"]);
        for outcome in &record.outcomes {
            table.add_row(vec![
                Cell::new(outcome.batch_index),
                Cell::new(&outcome.description),
                Cell::new(outcome.status),
                Cell::new(outcome.message.as_deref().unwrap_or("")),
            ]);
        }

        let mut output = format!(
            "Record {} [{}]\nScope: {}\nChecksum: {}\nDuration: {}us\n",
            record.id, record.status, record.scope, record.checksum, record.duration_micros
        );
        if let Some(original) = &record.rollback_of {
            output.push_str(&format!("Rollback of: {}\n", original));
        }
        if let Some(error) = &record.error {
            output.push_str(&format!("Error: {}\n", error));
        }
        if !record.outcomes.is_empty() {
            output.push('\n');
            output.push_str(&table.to_string());
        }
        output
    }

    fn format_history(&self, records: &[MigrationRecord]) -> String {
        if records.is_empty() {
            return "No migrations".to_string();
        }

        let mut table = Table::new();
        table.set_header(vec!["Record", "Applied At", "Status", "Risk", "Ops", "Checksum"]);
        for record in records {
            table.add_row(vec![
                Cell::new(&record.id),
                Cell::new(record.applied_at),
                Cell::new(record.status),
                Cell::new(record.aggregate_risk),
                Cell::new(record.operations.len()),
                Cell::new(&record.checksum[..record.checksum.len().min(16)]),
            ]);
        }
        table.to_string()
    }

    fn format_snapshot(&self, snapshot: &SchemaSnapshot) -> String {
        if snapshot.is_empty() {
            return format!("Scope '{}' has no tables", snapshot.scope());
        }

        let mut table = Table::new();
        table.set_header(vec!["Table", "Column", "Type", "Nullable", "Rows"]);
        for spec in snapshot.tables() {
            let rows = spec
                .row_count
                .map(|r| r.to_string())
                .unwrap_or_else(|| "?".to_string());
            for (i, column) in spec.columns.iter().enumerate() {
                table.add_row(vec![
                    Cell::new(if i == 0 { spec.name.as_str() } else { "" }),
                    Cell::new(&column.name),
                    Cell::new(&column.logical_type),
                    Cell::new(if column.nullable { "yes" } else { "no" }),
                    Cell::new(if i == 0 { rows.as_str() } else { "" }),
                ]);
            }
        }
        table.to_string()
    }

    fn format_message(&self, message: &str) -> String {
        message.to_string()
    }
}

/// JSON formatter.
pub struct JsonFormatter;

impl JsonFormatter {
    fn render(value: &impl serde::Serialize) -> String {
        serde_json::to_string_pretty(value).unwrap_or_else(|e| {
            serde_json::json!({ "error": e.to_string() }).to_string()
        })
    }
}

impl Formatter for JsonFormatter {
    fn format_preview(&self, preview: &PreviewResult) -> String {
        Self::render(preview)
    }

    fn format_record(&self, record: &MigrationRecord) -> String {
        Self::render(record)
    }

    fn format_history(&self, records: &[MigrationRecord]) -> String {
        Self::render(&records)
    }

    fn format_snapshot(&self, snapshot: &SchemaSnapshot) -> String {
        Self::render(snapshot)
    }

    fn format_message(&self, message: &str) -> String {
        serde_json::json!({ "message": message }).to_string()
    }
}
