//! SQL Safety Validator
//!
//! The only producer of [`ValidatedSql`]. Model output is treated as untrusted
//! text: it is located, scanned lexically, parsed with the PostgreSQL dialect,
//! scope-checked against the current schema snapshot and given an enforced row
//! limit before anything can be executed.

use crate::error::PipelineError;
use crate::introspection::{SchemaSnapshot, TableDescriptor};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use sqlparser::ast::{
    Expr, Ident, Query, SelectItem, SetExpr, Statement, TableFactor, Value, Visit, Visitor,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::ControlFlow;
use thiserror::Error;
use tracing::debug;

/// Matched anywhere in the statement text, comments and literals included
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "insert", "update", "delete", "merge", "drop", "alter", "truncate", "create", "grant",
    "revoke", "copy", "call", "execute", "vacuum", "reindex",
];

/// Functions with side effects or access outside the analytics tables
const FORBIDDEN_FUNCTIONS: &[&str] = &[
    "pg_sleep",
    "pg_sleep_for",
    "pg_sleep_until",
    "pg_read_file",
    "pg_read_binary_file",
    "pg_ls_dir",
    "pg_stat_file",
    "lo_import",
    "lo_export",
    "lo_get",
    "dblink",
    "dblink_exec",
    "set_config",
    "nextval",
    "setval",
    "pg_terminate_backend",
    "pg_cancel_backend",
    "pg_reload_conf",
    "pg_rotate_logfile",
    "pg_advisory_lock",
    "pg_advisory_xact_lock",
    "query_to_xml",
    // server configuration and host details
    "current_setting",
    "pg_settings_get_flags",
    "inet_server_addr",
    "inet_server_port",
    "inet_client_addr",
    "inet_client_port",
    "version",
    "pg_postmaster_start_time",
    "pg_conf_load_time",
    "pg_current_logfile",
    "pg_ls_waldir",
    "pg_ls_logdir",
    "pg_ls_tmpdir",
    "pg_ls_archive_statusdir",
    "pg_ls_logicalmapdir",
    "pg_ls_logicalsnapdir",
    "pg_ls_replslotdir",
];

static FORBIDDEN_KEYWORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)\b({})\b", FORBIDDEN_KEYWORDS.join("|")))
        .expect("forbidden keyword pattern is valid")
});

/// Paragraph break, where models put explanations after the SQL
static BLANK_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\r?\n[ \t\r]*\n").expect("blank line pattern is valid"));

/// A SELECT, or a `WITH name [(cols)] AS [NOT] [MATERIALIZED] (` header
static STATEMENT_START: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?is)\b(?:select\b|with\s+(?:recursive\s+)?(?:"[^"]+"|[a-z_][a-z0-9_$]*)\s*(?:\([^)]*\)\s*)?as\s*(?:not\s+)?(?:materialized\s*)?\()"#,
    )
    .expect("statement start pattern is valid")
});

/// Why a candidate statement was refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    #[error("no SQL statement found")]
    EmptyStatement,

    #[error("forbidden keyword '{0}'")]
    ForbiddenKeyword(String),

    #[error("more than one statement")]
    MultipleStatements,

    #[error("could not parse SQL: {0}")]
    ParseError(String),

    #[error("statement is not a read-only query")]
    NotAQuery,

    #[error("SELECT ... INTO is not allowed")]
    SelectInto,

    #[error("row locking clauses are not allowed")]
    RowLocking,

    #[error("unsupported table source '{0}'")]
    UnsupportedTableSource(String),

    #[error("forbidden function '{0}'")]
    ForbiddenFunction(String),

    #[error("unknown table '{0}'")]
    UnknownTable(String),

    #[error("unknown column '{0}'")]
    UnknownColumn(String),

    #[error("row limit must be a literal row count")]
    UnsupportedLimit,
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::EmptyStatement => "empty_statement",
            RejectReason::ForbiddenKeyword(_) => "forbidden_keyword",
            RejectReason::MultipleStatements => "multiple_statements",
            RejectReason::ParseError(_) => "parse_error",
            RejectReason::NotAQuery => "not_read_only",
            RejectReason::SelectInto => "select_into",
            RejectReason::RowLocking => "row_locking",
            RejectReason::UnsupportedTableSource(_) => "unsupported_table_source",
            RejectReason::ForbiddenFunction(_) => "forbidden_function",
            RejectReason::UnknownTable(_) => "unknown_table",
            RejectReason::UnknownColumn(_) => "unknown_column",
            RejectReason::UnsupportedLimit => "unsupported_limit",
        }
    }
}

/// How the row limit of a validated statement came to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum LimitAction {
    /// The statement already asked for no more than the cap
    Kept,
    /// No limit was present; the cap was added
    Injected,
    /// The requested limit exceeded the cap and was lowered to it
    Clamped { requested: u64 },
}

/// A statement that passed every safety and scope check.
///
/// Fields are private so the only way to obtain one is [`SqlValidator::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedSql {
    sql: String,
    limit: u64,
    limit_action: LimitAction,
    row_cap: u64,
    tables: Vec<String>,
}

impl ValidatedSql {
    pub fn as_str(&self) -> &str {
        &self.sql
    }

    /// Effective row limit of the rewritten statement
    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn limit_action(&self) -> LimitAction {
        self.limit_action
    }

    /// Cap the statement was validated against
    pub fn row_cap(&self) -> u64 {
        self.row_cap
    }

    /// Catalog tables the statement reads
    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    /// True when the validator chose the limit rather than the model
    pub fn limit_enforced(&self) -> bool {
        !matches!(self.limit_action, LimitAction::Kept)
    }
}

impl fmt::Display for ValidatedSql {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}

/// Stateless validator bound to a row cap
#[derive(Debug, Clone, Copy)]
pub struct SqlValidator {
    max_rows: u64,
}

impl SqlValidator {
    pub fn new(max_rows: u64) -> Self {
        Self {
            max_rows: max_rows.max(1),
        }
    }

    /// Validate raw model output against the given snapshot
    pub fn validate(&self, raw: &str, schema: &SchemaSnapshot) -> Result<ValidatedSql, PipelineError> {
        self.check(raw, schema).map_err(|reason| {
            debug!(reason = reason.code(), sql = raw, "Rejected candidate SQL: {}", reason);
            PipelineError::UnsafeSqlRejected(reason)
        })
    }

    fn check(&self, raw: &str, schema: &SchemaSnapshot) -> Result<ValidatedSql, RejectReason> {
        let stripped = strip_code_fences(raw);
        if stripped.is_empty() {
            return Err(RejectReason::EmptyStatement);
        }
        // Scans prose around the statement too; a write hidden before the
        // first SELECT must not be silently reduced to its read half.
        if let Some(found) = FORBIDDEN_KEYWORD.find(stripped) {
            return Err(RejectReason::ForbiddenKeyword(found.as_str().to_lowercase()));
        }
        let dialect = PostgreSqlDialect {};
        let mut query = first_query(&dialect, stripped)?;

        let mut references = References::default();
        if let ControlFlow::Break(reason) = query.visit(&mut references) {
            return Err(reason);
        }
        let tables = references.resolve(schema)?;

        let (limit, limit_action) = enforce_limit(&mut query, self.max_rows)?;

        Ok(ValidatedSql {
            sql: query.to_string(),
            limit,
            limit_action,
            row_cap: self.max_rows,
            tables,
        })
    }
}

/// Return the body of the first fenced block, or the whole text
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(open) = trimmed.find("```") else {
        return trimmed;
    };
    let after_open = &trimmed[open + 3..];

    // Skip a language tag such as ```sql
    let (first_line, rest) = after_open.split_once('\n').unwrap_or((after_open, ""));
    let body = if first_line.trim().chars().all(|c| c.is_ascii_alphanumeric()) {
        rest
    } else {
        after_open
    };

    match body.find("```") {
        Some(close) => body[..close].trim(),
        None => body.trim(),
    }
}

/// Statement-like spans, most preferred first. The first SELECT/WITH start
/// and later ones that open a line are candidates; each is tried whole, then
/// cut back one paragraph at a time to drop trailing prose.
fn statement_candidates(text: &str) -> Vec<&str> {
    let mut candidates = Vec::new();

    for (n, start) in STATEMENT_START.find_iter(text).enumerate() {
        let line_start = text[..start.start()]
            .rsplit('\n')
            .next()
            .is_some_and(|before| before.trim().is_empty());
        if n > 0 && !line_start {
            continue;
        }

        let rest = text[start.start()..].trim_end();
        candidates.push(rest);
        let breaks: Vec<usize> = BLANK_LINE.find_iter(rest).map(|m| m.start()).collect();
        for cut in breaks.into_iter().rev() {
            candidates.push(rest[..cut].trim_end());
        }
    }

    candidates
}

/// First candidate that parses as exactly one query. Parse failures move on
/// to the next candidate; any other rejection is final.
fn first_query(dialect: &PostgreSqlDialect, text: &str) -> Result<Box<Query>, RejectReason> {
    let mut first_error = None;

    for candidate in statement_candidates(text) {
        match parse_query(dialect, candidate) {
            Ok(query) => return Ok(query),
            Err(RejectReason::ParseError(e)) => {
                first_error.get_or_insert(RejectReason::ParseError(e));
            }
            Err(other) => return Err(other),
        }
    }

    Err(first_error.unwrap_or(RejectReason::NotAQuery))
}

fn parse_query(dialect: &PostgreSqlDialect, text: &str) -> Result<Box<Query>, RejectReason> {
    let text = before_terminator(dialect, text)?;

    let mut statements =
        Parser::parse_sql(dialect, text).map_err(|e| RejectReason::ParseError(e.to_string()))?;
    let statement = match statements.len() {
        0 => return Err(RejectReason::EmptyStatement),
        1 => statements.remove(0),
        _ => return Err(RejectReason::MultipleStatements),
    };
    match statement {
        Statement::Query(query) => Ok(query),
        _ => Err(RejectReason::NotAQuery),
    }
}

/// Text up to the first top-level semicolon. What follows it may be
/// comments or prose; anything that parses as SQL is a second statement.
fn before_terminator<'a>(dialect: &PostgreSqlDialect, text: &'a str) -> Result<&'a str, RejectReason> {
    let tokens = Tokenizer::new(dialect, text)
        .tokenize_with_location()
        .map_err(|e| RejectReason::ParseError(e.to_string()))?;

    let Some(terminator) = tokens.iter().find(|t| t.token == Token::SemiColon) else {
        return Ok(text);
    };
    let at = byte_offset(text, terminator.location.line, terminator.location.column);
    let (head, tail) = (&text[..at], &text[at + 1..]);

    match Parser::parse_sql(dialect, tail) {
        Ok(statements) if !statements.is_empty() => Err(RejectReason::MultipleStatements),
        _ => Ok(head),
    }
}

/// Tokenizer locations are 1-based lines and character columns
fn byte_offset(text: &str, line: u64, column: u64) -> usize {
    let line_start: usize = text
        .split_inclusive('\n')
        .take(line.saturating_sub(1) as usize)
        .map(str::len)
        .sum();
    text[line_start..]
        .char_indices()
        .nth(column.saturating_sub(1) as usize)
        .map_or(text.len(), |(i, _)| line_start + i)
}

fn enforce_limit(query: &mut Query, max_rows: u64) -> Result<(u64, LimitAction), RejectReason> {
    if let Some(fetch) = query.fetch.as_mut() {
        if fetch.percent {
            return Err(RejectReason::UnsupportedLimit);
        }
        let requested = match &fetch.quantity {
            None => 1,
            Some(expr) => literal_row_count(expr)?,
        };
        if requested > max_rows {
            fetch.quantity = Some(row_count_literal(max_rows));
            return Ok((max_rows, LimitAction::Clamped { requested }));
        }
        return Ok((requested, LimitAction::Kept));
    }

    match &query.limit {
        None => {
            query.limit = Some(row_count_literal(max_rows));
            Ok((max_rows, LimitAction::Injected))
        }
        Some(expr) => {
            let requested = literal_row_count(expr)?;
            if requested > max_rows {
                query.limit = Some(row_count_literal(max_rows));
                Ok((max_rows, LimitAction::Clamped { requested }))
            } else {
                Ok((requested, LimitAction::Kept))
            }
        }
    }
}

fn literal_row_count(expr: &Expr) -> Result<u64, RejectReason> {
    match expr {
        Expr::Value(Value::Number(n, _)) => n.parse().map_err(|_| RejectReason::UnsupportedLimit),
        _ => Err(RejectReason::UnsupportedLimit),
    }
}

fn row_count_literal(n: u64) -> Expr {
    Expr::Value(Value::Number(n.to_string(), false))
}

/// Unquoted identifiers fold to lower case, quoted ones are exact
fn normalize(ident: &Ident) -> String {
    if ident.quote_style.is_some() {
        ident.value.clone()
    } else {
        ident.value.to_lowercase()
    }
}

fn into_flow(result: Result<(), RejectReason>) -> ControlFlow<RejectReason> {
    match result {
        Ok(()) => ControlFlow::Continue(()),
        Err(reason) => ControlFlow::Break(reason),
    }
}

/// Everything a statement names, collected across all nested queries.
///
/// Scopes are flattened: a reference is accepted when it resolves in any
/// scope of the statement. The database still enforces exact scoping.
#[derive(Default)]
struct References {
    /// (possibly schema-qualified table name, alias)
    relations: Vec<(Vec<String>, Option<String>)>,
    cte_names: HashSet<String>,
    /// CTE names and derived-table aliases
    virtual_tables: HashSet<String>,
    /// Projection aliases and declared CTE/derived column names
    output_names: HashSet<String>,
    columns: Vec<Vec<String>>,
    wildcard_qualifiers: Vec<Vec<String>>,
}

impl References {
    fn collect_body(&mut self, body: &SetExpr) -> Result<(), RejectReason> {
        match body {
            SetExpr::Select(select) => {
                if select.into.is_some() {
                    return Err(RejectReason::SelectInto);
                }
                for item in &select.projection {
                    match item {
                        SelectItem::ExprWithAlias { alias, .. } => {
                            self.output_names.insert(normalize(alias));
                        }
                        SelectItem::QualifiedWildcard(name, _) => {
                            self.wildcard_qualifiers
                                .push(name.0.iter().map(normalize).collect());
                        }
                        _ => {}
                    }
                }
                Ok(())
            }
            SetExpr::SetOperation { left, right, .. } => {
                self.collect_body(left)?;
                self.collect_body(right)
            }
            // Nested queries get their own pre_visit_query call
            SetExpr::Query(_) | SetExpr::Values(_) => Ok(()),
            SetExpr::Table(table) => Err(RejectReason::UnsupportedTableSource(table.to_string())),
            _ => Err(RejectReason::NotAQuery),
        }
    }

    /// Check every name against the snapshot; returns the catalog tables read
    fn resolve(&self, schema: &SchemaSnapshot) -> Result<Vec<String>, RejectReason> {
        // qualifier -> candidate sources, None for CTEs and derived tables
        let mut qualifiers: HashMap<&str, Vec<Option<&TableDescriptor>>> = HashMap::new();
        for name in &self.virtual_tables {
            qualifiers.entry(name.as_str()).or_default().push(None);
        }

        let mut referenced: Vec<&TableDescriptor> = Vec::new();
        for (path, alias) in &self.relations {
            let (namespace, table) = match path.as_slice() {
                [table] => (None, table),
                [namespace, table] => (Some(namespace), table),
                _ => return Err(RejectReason::UnknownTable(path.join("."))),
            };

            if namespace.is_none() && self.cte_names.contains(table) {
                if let Some(alias) = alias {
                    qualifiers.entry(alias.as_str()).or_default().push(None);
                }
                continue;
            }
            if namespace.is_some_and(|ns| ns.as_str() != schema.namespace) {
                return Err(RejectReason::UnknownTable(path.join(".")));
            }

            let descriptor = schema
                .table(table)
                .ok_or_else(|| RejectReason::UnknownTable(path.join(".")))?;
            if !referenced.iter().any(|t| t.name == descriptor.name) {
                referenced.push(descriptor);
            }
            let qualifier = alias.as_deref().unwrap_or(table.as_str());
            qualifiers.entry(qualifier).or_default().push(Some(descriptor));
        }

        let in_any_table = |column: &str| referenced.iter().any(|t| t.has_column(column));
        let qualified_ok = |qualifier: &str, column: &str| -> bool {
            qualifiers.get(qualifier).is_some_and(|sources| {
                sources.iter().any(|source| match source {
                    Some(table) => table.has_column(column),
                    None => self.output_names.contains(column) || in_any_table(column),
                })
            })
        };

        for path in &self.columns {
            let known = match path.as_slice() {
                [column] => in_any_table(column) || self.output_names.contains(column),
                [qualifier, column] => qualified_ok(qualifier, column),
                [namespace, table, column] if namespace == &schema.namespace => {
                    qualified_ok(table, column)
                }
                _ => false,
            };
            if !known {
                return Err(RejectReason::UnknownColumn(path.join(".")));
            }
        }

        for path in &self.wildcard_qualifiers {
            let qualifier = match path.as_slice() {
                [qualifier] => qualifier,
                [namespace, table] if namespace == &schema.namespace => table,
                _ => return Err(RejectReason::UnknownTable(path.join("."))),
            };
            if !qualifiers.contains_key(qualifier.as_str()) {
                return Err(RejectReason::UnknownTable(path.join(".")));
            }
        }

        Ok(referenced.into_iter().map(|t| t.name.clone()).collect())
    }
}

impl Visitor for References {
    type Break = RejectReason;

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if !query.locks.is_empty() {
            return ControlFlow::Break(RejectReason::RowLocking);
        }
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                let name = normalize(&cte.alias.name);
                self.cte_names.insert(name.clone());
                self.virtual_tables.insert(name);
                self.output_names
                    .extend(cte.alias.columns.iter().map(normalize));
            }
        }
        into_flow(self.collect_body(&query.body))
    }

    fn pre_visit_table_factor(&mut self, table_factor: &TableFactor) -> ControlFlow<Self::Break> {
        match table_factor {
            TableFactor::Table { name, alias, .. } => {
                self.relations.push((
                    name.0.iter().map(normalize).collect(),
                    alias.as_ref().map(|a| normalize(&a.name)),
                ));
            }
            TableFactor::Derived { alias, .. } => {
                if let Some(alias) = alias {
                    self.virtual_tables.insert(normalize(&alias.name));
                    self.output_names
                        .extend(alias.columns.iter().map(normalize));
                }
            }
            TableFactor::NestedJoin { .. } => {}
            other => {
                return ControlFlow::Break(RejectReason::UnsupportedTableSource(other.to_string()))
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Identifier(ident) => self.columns.push(vec![normalize(ident)]),
            Expr::CompoundIdentifier(parts) => {
                self.columns.push(parts.iter().map(normalize).collect())
            }
            Expr::Function(function) => {
                if let Some(name) = function.name.0.last() {
                    let name = name.value.to_lowercase();
                    if FORBIDDEN_FUNCTIONS.contains(&name.as_str()) {
                        return ControlFlow::Break(RejectReason::ForbiddenFunction(name));
                    }
                }
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}
