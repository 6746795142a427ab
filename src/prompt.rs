//! Prompt Builder
//!
//! Both prompts are pure functions of their inputs and the builder's caps, so
//! the same question over the same snapshot always yields the same text.

use crate::config::QueryConfig;
use crate::introspection::{ColumnDescriptor, SchemaSnapshot};
use crate::pipeline::types::QueryResult;
use serde_json::Value;
use std::fmt::Write;

/// Longest rendering of one sample row in the SQL prompt
const MAX_SAMPLE_ROW_CHARS: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptBuilder {
    row_cap: u64,
    answer_max_rows: usize,
    answer_max_columns: usize,
    answer_max_cell_chars: usize,
}

impl PromptBuilder {
    pub fn new(
        row_cap: u64,
        answer_max_rows: usize,
        answer_max_columns: usize,
        answer_max_cell_chars: usize,
    ) -> Self {
        Self {
            row_cap: row_cap.max(1),
            answer_max_rows: answer_max_rows.max(1),
            answer_max_columns: answer_max_columns.max(1),
            answer_max_cell_chars: answer_max_cell_chars.max(1),
        }
    }

    pub fn from_config(config: &QueryConfig) -> Self {
        Self::new(
            config.max_rows,
            config.answer_prompt_max_rows,
            config.answer_prompt_max_columns,
            config.answer_prompt_max_cell_chars,
        )
    }

    /// Same builder with a different row cap in the SQL instructions
    pub fn with_row_cap(mut self, row_cap: u64) -> Self {
        self.row_cap = row_cap.max(1);
        self
    }

    pub fn build_sql_prompt(&self, question: &str, schema: &SchemaSnapshot) -> String {
        let mut out = String::new();

        out.push_str("You are an expert PostgreSQL analyst for an e-commerce database.\n");
        out.push_str("Write one SQL query that answers the question below.\n\n");

        out.push_str("RULES:\n");
        let _ = writeln!(out, "1. Return exactly one SELECT statement (a WITH ... SELECT is fine).");
        let _ = writeln!(
            out,
            "2. Never modify data or schema: no INSERT, UPDATE, DELETE, DDL, or function calls with side effects."
        );
        let _ = writeln!(out, "3. Use only the tables and columns listed below.");
        let _ = writeln!(
            out,
            "4. Always include a LIMIT clause no greater than {}.",
            self.row_cap
        );
        let _ = writeln!(
            out,
            "5. Respond with the SQL only: no explanation, no markdown fences, and no SQL comments (-- or /* */). \
             A comment that mentions a write keyword such as UPDATE gets the whole query rejected."
        );

        let _ = writeln!(out, "\nDATABASE SCHEMA (schema \"{}\"):", schema.namespace);
        for table in &schema.tables {
            let kind = if table.is_view { "view" } else { "table" };
            let _ = writeln!(out, "{} {}:", kind, table.name);
            for column in &table.columns {
                let mut flags = Vec::new();
                if column.is_primary_key {
                    flags.push("primary key");
                }
                flags.push(if column.nullable { "nullable" } else { "not null" });
                let _ = writeln!(
                    out,
                    "  - {} ({}, {})",
                    column.name,
                    column.data_type,
                    flags.join(", ")
                );
            }
            if !table.samples.is_empty() {
                out.push_str("  sample rows:\n");
                for row in &table.samples {
                    let _ = writeln!(out, "    {}", sample_row(&table.columns, row));
                }
            }
        }

        if !schema.foreign_keys.is_empty() {
            out.push_str("\nRELATIONSHIPS:\n");
            for fk in &schema.foreign_keys {
                let _ = writeln!(
                    out,
                    "  - {}.({}) references {}.({})",
                    fk.source_table,
                    fk.source_columns.join(", "),
                    fk.referenced_table,
                    fk.referenced_columns.join(", ")
                );
            }
        }

        let _ = write!(out, "\nQUESTION:\n{}\n\nSQL:", question);
        out
    }

    pub fn build_answer_prompt(&self, question: &str, result: &QueryResult) -> String {
        let mut out = String::new();

        out.push_str("You are a business intelligence analyst for an e-commerce company.\n");
        out.push_str("Answer the question directly using only the query results below.\n");
        out.push_str("Be specific: quote the names and numbers from the data.\n");
        out.push_str("Do not mention SQL, queries, or other technical details.\n");
        out.push_str("Keep it to 2-4 sentences.\n\n");

        let _ = writeln!(out, "QUESTION:\n{}\n", question);

        let shown_columns = result.columns.len().min(self.answer_max_columns);
        let shown_rows = result.rows.len().min(self.answer_max_rows);

        let _ = writeln!(out, "RESULTS ({} rows):", result.row_count);
        let header: Vec<String> = result.columns[..shown_columns]
            .iter()
            .map(|c| self.clip(c))
            .collect();
        let _ = writeln!(out, "| {} |", header.join(" | "));
        let _ = writeln!(out, "|{}", " --- |".repeat(shown_columns));

        for row in &result.rows[..shown_rows] {
            let cells: Vec<String> = row
                .iter()
                .take(shown_columns)
                .map(|v| self.clip(&render_cell(v)))
                .collect();
            let _ = writeln!(out, "| {} |", cells.join(" | "));
        }

        let mut notes = Vec::new();
        if result.rows.len() > shown_rows {
            notes.push(format!(
                "{} more rows not shown.",
                result.rows.len() - shown_rows
            ));
        }
        if result.columns.len() > shown_columns {
            notes.push(format!(
                "{} more columns not shown.",
                result.columns.len() - shown_columns
            ));
        }
        if result.truncated {
            notes.push("The result was cut off at the row limit; more rows may exist.".to_string());
        }
        if !notes.is_empty() {
            out.push_str("\nNOTES:\n");
            for note in notes {
                let _ = writeln!(out, "- {}", note);
            }
        }

        out.push_str("\nANSWER:");
        out
    }

    fn clip(&self, text: &str) -> String {
        let flat = text.replace(['\n', '\r'], " ").replace('|', "\\|");
        if flat.chars().count() <= self.answer_max_cell_chars {
            return flat;
        }
        let mut clipped: String = flat.chars().take(self.answer_max_cell_chars).collect();
        clipped.push_str("...");
        clipped
    }
}

/// One sample row as a JSON-style object in column order, clipped
fn sample_row(columns: &[ColumnDescriptor], row: &[Value]) -> String {
    let fields: Vec<String> = columns
        .iter()
        .zip(row)
        .map(|(column, value)| format!("{}: {}", Value::from(column.name.as_str()), value))
        .collect();
    let text = format!("{{{}}}", fields.join(", "));
    if text.chars().count() <= MAX_SAMPLE_ROW_CHARS {
        return text;
    }
    let mut clipped: String = text.chars().take(MAX_SAMPLE_ROW_CHARS).collect();
    clipped.push_str("...");
    clipped
}

fn render_cell(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
