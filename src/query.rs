//! Query Builder - projection, join and DDL statements
//!
//! Every table and column identifier is quoted here before it reaches SQL
//! text. Raw join conditions are the one exception: they are trusted input
//! from the column picker and are interpolated as given.

use crate::error::{BridgeError, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Table engine used for tables created by an import.
pub const TABLE_ENGINE: &str = "MergeTree()";

/// Generic textual type; the default for every imported column.
pub const DEFAULT_COLUMN_TYPE: &str = "String";

/// Quote an identifier with backticks, doubling embedded backticks.
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Quote a possibly qualified column. Exactly one `.` splits it into table
/// and column; anything else is quoted as a single identifier.
pub fn quote_column(column: &str) -> String {
    match column.split_once('.') {
        Some((table, name)) if !name.contains('.') && !table.is_empty() && !name.is_empty() => {
            format!("{}.{}", quote_identifier(table), quote_identifier(name))
        }
        _ => quote_identifier(column),
    }
}

/// Single-quoted string literal with `\` and `'` escaped.
pub fn quote_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("''"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
}

impl JoinKind {
    pub fn keyword(self) -> &'static str {
        match self {
            JoinKind::Inner => "INNER JOIN",
            JoinKind::Left => "LEFT JOIN",
            JoinKind::Right => "RIGHT JOIN",
            JoinKind::Full => "FULL JOIN",
        }
    }
}

impl FromStr for JoinKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_uppercase();
        let mut words = normalized.split_whitespace().collect::<Vec<_>>();
        if words.last() == Some(&"JOIN") {
            words.pop();
        }
        if words.len() == 2 && words[1] == "OUTER" && words[0] != "INNER" {
            words.pop();
        }
        match words.as_slice() {
            ["INNER"] => Ok(JoinKind::Inner),
            ["LEFT"] => Ok(JoinKind::Left),
            ["RIGHT"] => Ok(JoinKind::Right),
            ["FULL"] => Ok(JoinKind::Full),
            _ => Err(BridgeError::Schema(format!("unknown join kind {:?}", s))),
        }
    }
}

impl TryFrom<String> for JoinKind {
    type Error = BridgeError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<JoinKind> for String {
    fn from(kind: JoinKind) -> Self {
        match kind {
            JoinKind::Inner => "INNER",
            JoinKind::Left => "LEFT",
            JoinKind::Right => "RIGHT",
            JoinKind::Full => "FULL",
        }
        .to_string()
    }
}

impl fmt::Display for JoinKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// How a joined table lines up with the tables before it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JoinCondition {
    /// Column pair; both sides are quoted.
    Columns { source: String, target: String },
    /// Trusted SQL fragment passed through unescaped. Only feed this from a
    /// column picker, never from free-text user input.
    Raw(String),
}

impl JoinCondition {
    fn to_sql(&self) -> String {
        match self {
            JoinCondition::Columns { source, target } => {
                format!("{} = {}", quote_column(source), quote_column(target))
            }
            JoinCondition::Raw(sql) => sql.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSpec {
    pub table: String,
    #[serde(default)]
    pub alias: Option<String>,
    pub kind: JoinKind,
    pub on: JoinCondition,
}

impl JoinSpec {
    pub fn new(table: impl Into<String>, kind: JoinKind, on: JoinCondition) -> Self {
        Self {
            table: table.into(),
            alias: None,
            kind,
            on,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Parse `KIND:TABLE:CONDITION`, as typed on the command line.
    pub fn parse_cli(raw: &str) -> Result<Self> {
        let mut parts = raw.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(kind), Some(table), Some(on)) if !table.is_empty() && !on.is_empty() => {
                let (table, alias) = match table.split_once(' ') {
                    Some((t, a)) => (t.to_string(), Some(a.trim().to_string())),
                    None => (table.to_string(), None),
                };
                Ok(JoinSpec {
                    table,
                    alias,
                    kind: kind.parse()?,
                    on: JoinCondition::Raw(on.to_string()),
                })
            }
            _ => Err(BridgeError::Schema(format!(
                "join must look like KIND:TABLE:CONDITION, got {:?}",
                raw
            ))),
        }
    }

    fn to_sql(&self) -> String {
        let mut clause = format!("{} {}", self.kind.keyword(), quote_identifier(&self.table));
        if let Some(alias) = &self.alias {
            clause.push_str(" AS ");
            clause.push_str(&quote_identifier(alias));
        }
        clause.push_str(" ON ");
        clause.push_str(&self.on.to_sql());
        clause
    }
}

/// A SELECT over a base table with ordered columns and joins.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionQuery {
    pub table: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub joins: Vec<JoinSpec>,
    #[serde(default)]
    pub limit: Option<u64>,
}

impl ProjectionQuery {
    pub fn new(table: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            table: table.into(),
            columns,
            joins: Vec::new(),
            limit: None,
        }
    }

    pub fn with_joins(mut self, joins: Vec<JoinSpec>) -> Self {
        self.joins = joins;
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn to_sql(&self) -> Result<String> {
        let mut sql = build_projection(&self.table, &self.columns, &self.joins)?;
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        Ok(sql)
    }
}

/// Build `SELECT <cols> FROM <table> [<JOIN> ...]`. Deterministic.
pub fn build_projection<S: AsRef<str>>(
    table: &str,
    columns: &[S],
    joins: &[JoinSpec],
) -> Result<String> {
    if table.trim().is_empty() {
        return Err(BridgeError::Schema("table name must not be empty".to_string()));
    }
    if columns.is_empty() {
        return Err(BridgeError::Schema("at least one column must be selected".to_string()));
    }

    let mut sql = format!(
        "SELECT {} FROM {}",
        columns.iter().map(|c| quote_column(c.as_ref())).join(", "),
        quote_identifier(table)
    );
    for join in joins {
        sql.push(' ');
        sql.push_str(&join.to_sql());
    }
    Ok(sql)
}

fn validate_type(name: &str, column_type: &str) -> Result<()> {
    let trimmed = column_type.trim();
    if trimmed.is_empty() {
        return Err(BridgeError::Schema(format!("column {:?} has no type", name)));
    }
    if trimmed.contains(';') || trimmed.contains('`') {
        return Err(BridgeError::Schema(format!(
            "column {:?} has an invalid type {:?}",
            name, column_type
        )));
    }
    Ok(())
}

/// Build an idempotent `CREATE TABLE IF NOT EXISTS` for ordered name/type pairs.
pub fn build_create_table<N, T>(name: &str, columns: &[(N, T)]) -> Result<String>
where
    N: AsRef<str>,
    T: AsRef<str>,
{
    if name.trim().is_empty() {
        return Err(BridgeError::Schema("table name must not be empty".to_string()));
    }
    if columns.is_empty() {
        return Err(BridgeError::Schema(format!(
            "cannot create table {:?} without columns",
            name
        )));
    }
    for (column, column_type) in columns {
        validate_type(column.as_ref(), column_type.as_ref())?;
    }

    let defs = columns
        .iter()
        .map(|(column, column_type)| {
            format!(
                "{} {}",
                quote_identifier(column.as_ref()),
                column_type.as_ref().trim()
            )
        })
        .join(", ");
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} ({}) ENGINE = {} ORDER BY tuple()",
        quote_identifier(name),
        defs,
        TABLE_ENGINE
    ))
}

/// Build one `INSERT INTO <table> (<cols>) VALUES (...), ...` batch. Every
/// value is sent as a string literal and left to the store to coerce.
pub fn build_insert_values<C, V>(table: &str, columns: &[C], rows: &[Vec<V>]) -> Result<String>
where
    C: AsRef<str>,
    V: AsRef<str>,
{
    if columns.is_empty() {
        return Err(BridgeError::Schema("at least one column must be selected".to_string()));
    }
    if rows.is_empty() {
        return Err(BridgeError::Schema("an insert batch needs at least one row".to_string()));
    }

    let tuples = rows
        .iter()
        .map(|row| format!("({})", row.iter().map(|v| quote_literal(v.as_ref())).join(", ")))
        .join(", ");
    Ok(format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote_identifier(table),
        columns.iter().map(|c| quote_identifier(c.as_ref())).join(", "),
        tuples
    ))
}
