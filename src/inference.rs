//! Schema Inference - suggest store column types from preview rows
//!
//! Suggestions only. An import with no explicit types still creates every
//! column as `String`.

use crate::codec::Row;
use crate::query::DEFAULT_COLUMN_TYPE;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CellKind {
    Bool,
    Int,
    Float,
    Date,
    DateTime,
    Text,
}

impl CellKind {
    pub fn store_type(self) -> &'static str {
        match self {
            CellKind::Bool => "Bool",
            CellKind::Int => "Int64",
            CellKind::Float => "Float64",
            CellKind::Date => "Date",
            CellKind::DateTime => "DateTime",
            CellKind::Text => DEFAULT_COLUMN_TYPE,
        }
    }

    /// Smallest kind that holds values of both.
    fn widen(self, other: CellKind) -> CellKind {
        use CellKind::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Int, Float) | (Float, Int) => Float,
            (Date, DateTime) | (DateTime, Date) => DateTime,
            _ => Text,
        }
    }
}

/// Classify one non-empty cell.
pub fn classify_cell(cell: &str) -> CellKind {
    let trimmed = cell.trim();
    if trimmed.eq_ignore_ascii_case("true") || trimmed.eq_ignore_ascii_case("false") {
        return CellKind::Bool;
    }
    if trimmed.parse::<i64>().is_ok() {
        return CellKind::Int;
    }
    if trimmed.parse::<f64>().map_or(false, |f| f.is_finite()) {
        return CellKind::Float;
    }
    if NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").is_ok() {
        return CellKind::Date;
    }
    if NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S").is_ok() {
        return CellKind::DateTime;
    }
    CellKind::Text
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferredColumn {
    pub name: String,
    pub store_type: String,
    pub nullable: bool,
}

/// Suggest a store type per header from sample rows.
///
/// Empty cells make a column `Nullable(..)`; a column with no non-empty
/// samples stays `String`.
pub fn infer_column_types(headers: &[String], rows: &[Row]) -> Vec<InferredColumn> {
    headers
        .iter()
        .enumerate()
        .map(|(idx, name)| {
            let mut kind: Option<CellKind> = None;
            let mut saw_empty = false;
            for row in rows {
                match row.get(idx).map(|c| c.trim()) {
                    None | Some("") => saw_empty = true,
                    Some(cell) => {
                        let cell_kind = classify_cell(cell);
                        kind = Some(kind.map_or(cell_kind, |k| k.widen(cell_kind)));
                    }
                }
            }

            match kind {
                None | Some(CellKind::Text) => InferredColumn {
                    name: name.clone(),
                    store_type: DEFAULT_COLUMN_TYPE.to_string(),
                    nullable: false,
                },
                Some(kind) if saw_empty => InferredColumn {
                    name: name.clone(),
                    store_type: format!("Nullable({})", kind.store_type()),
                    nullable: true,
                },
                Some(kind) => InferredColumn {
                    name: name.clone(),
                    store_type: kind.store_type().to_string(),
                    nullable: false,
                },
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(data: &[&[&str]]) -> Vec<Row> {
        data.iter()
            .map(|r| r.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    #[test]
    fn test_classify_cell() {
        assert_eq!(classify_cell("42"), CellKind::Int);
        assert_eq!(classify_cell("-3.5"), CellKind::Float);
        assert_eq!(classify_cell("TRUE"), CellKind::Bool);
        assert_eq!(classify_cell("2025-01-15"), CellKind::Date);
        assert_eq!(classify_cell("2025-01-15 10:30:00"), CellKind::DateTime);
        assert_eq!(classify_cell("NaN"), CellKind::Text);
        assert_eq!(classify_cell("Alice"), CellKind::Text);
    }

    #[test]
    fn test_infer_column_types() {
        let headers = vec!["id", "amount", "joined", "note", "blank"]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>();
        let sample = rows(&[
            &["1", "10", "2025-01-15", "hi", ""],
            &["2", "", "2025-01-16 08:00:00", "3", ""],
            &["3", "2.5", "2025-01-17", "x", ""],
        ]);
        let inferred = infer_column_types(&headers, &sample);
        let types = inferred.iter().map(|c| c.store_type.as_str()).collect::<Vec<_>>();
        assert_eq!(types, vec!["Int64", "Nullable(Float64)", "DateTime", "String", "String"]);
        assert!(inferred[1].nullable);
    }
}
