//! SELECT-only query execution with a row cap.
//!
//! Queries are screened lexically (single statement, SELECT/WITH prefix,
//! no mutating keywords outside literals and comments) and then checked
//! again with `Statement::readonly()` after preparation.

use rusqlite::types::ValueRef;
use serde::Serialize;

use super::SqlError;
use crate::db::Database;

pub const DEFAULT_MAX_ROWS: usize = 10_000;

const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "CREATE", "ALTER", "ATTACH", "DETACH", "PRAGMA",
    "REPLACE", "TRUNCATE", "VACUUM", "REINDEX", "GRANT", "REVOKE",
];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
    pub row_count: usize,
    pub truncated: bool,
}

#[derive(Clone)]
pub struct SqlSandbox {
    db: Database,
    max_rows: usize,
}

impl SqlSandbox {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            max_rows: DEFAULT_MAX_ROWS,
        }
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows.max(1);
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn execute(&self, sql: &str) -> Result<QueryResult, SqlError> {
        let sql = validate_select(sql)?;
        let max_rows = self.max_rows;
        tracing::debug!("[SqlSandbox] Executing: {}", sql);

        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                if !stmt.readonly() {
                    return Ok(Err(SqlError::NotReadOnly));
                }
                let columns: Vec<String> =
                    stmt.column_names().iter().map(|c| c.to_string()).collect();

                let mut rows = Vec::new();
                let mut truncated = false;
                let mut cursor = stmt.query([])?;
                while let Some(row) = cursor.next()? {
                    if rows.len() == max_rows {
                        truncated = true;
                        break;
                    }
                    let mut obj = serde_json::Map::with_capacity(columns.len());
                    for (i, name) in columns.iter().enumerate() {
                        obj.insert(name.clone(), cell_to_json(row.get_ref(i)?));
                    }
                    rows.push(obj);
                }

                Ok(Ok(QueryResult {
                    row_count: rows.len(),
                    columns,
                    rows,
                    truncated,
                }))
            })
            .await?
    }

    /// Run a query whose first column of the first row is a count.
    pub async fn count(&self, sql: &str) -> Result<u64, SqlError> {
        let result = self.execute(sql).await?;
        let first = result
            .rows
            .first()
            .and_then(|row| result.columns.first().and_then(|c| row.get(c)))
            .and_then(|v| v.as_u64().or_else(|| v.as_f64().map(|f| f.max(0.0) as u64)));
        Ok(first.unwrap_or(0))
    }
}

fn cell_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(t) => serde_json::Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => serde_json::Value::String(format!("<blob {} bytes>", b.len())),
    }
}

/// Screen a query and return it normalised (trimmed, trailing `;` removed).
pub fn validate_select(sql: &str) -> Result<String, SqlError> {
    let trimmed = sql.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace());
    if trimmed.is_empty() {
        return Err(SqlError::Empty);
    }

    let code = strip_literals_and_comments(trimmed);
    if code.contains(';') {
        return Err(SqlError::MultipleStatements);
    }

    let words: Vec<String> = code
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_ascii_uppercase())
        .collect();

    let first = words.first().cloned().unwrap_or_default();
    match first.as_str() {
        "SELECT" => {}
        "WITH" if words.iter().any(|w| w == "SELECT") => {}
        _ => return Err(SqlError::NotSelect(first)),
    }

    if let Some(bad) = words.iter().find(|w| FORBIDDEN_KEYWORDS.contains(&w.as_str())) {
        return Err(SqlError::ForbiddenKeyword(bad.clone()));
    }

    Ok(trimmed.to_string())
}

/// Blank out string literals, quoted identifiers and comments.
fn strip_literals_and_comments(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' | '`' => {
                let quote = c;
                while let Some(n) = chars.next() {
                    if n == quote {
                        if chars.peek() == Some(&quote) {
                            chars.next();
                            continue;
                        }
                        break;
                    }
                }
                out.push(' ');
            }
            '-' if chars.peek() == Some(&'-') => {
                for n in chars.by_ref() {
                    if n == '\n' {
                        break;
                    }
                }
                out.push(' ');
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for n in chars.by_ref() {
                    if prev == '*' && n == '/' {
                        break;
                    }
                    prev = n;
                }
                out.push(' ');
            }
            _ => out.push(c),
        }
    }
    out
}
