//! Filter predicates applied to rows and to file-level index statistics.

use crate::value::{Record, ScalarValue};
use serde::{Deserialize, Serialize};

/// A single-column filter condition.
///
/// Every operator is matched exhaustively wherever predicates are consumed,
/// so adding a variant is a compile error until row evaluation, pruning, and
/// selectivity estimation all handle it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    Eq { column: String, value: ScalarValue },
    Gt { column: String, value: ScalarValue },
    Lt { column: String, value: ScalarValue },
    Gte { column: String, value: ScalarValue },
    Lte { column: String, value: ScalarValue },
    In { column: String, values: Vec<ScalarValue> },
    Like { column: String, pattern: String },
}

impl Predicate {
    /// The column this predicate constrains.
    pub fn column(&self) -> &str {
        match self {
            Predicate::Eq { column, .. }
            | Predicate::Gt { column, .. }
            | Predicate::Lt { column, .. }
            | Predicate::Gte { column, .. }
            | Predicate::Lte { column, .. }
            | Predicate::In { column, .. }
            | Predicate::Like { column, .. } => column,
        }
    }

    /// Evaluate against a single row. Missing columns, nulls, and
    /// incomparable types all fail the row.
    pub fn matches(&self, row: &Record) -> bool {
        let Some(actual) = row.get(self.column()) else {
            return false;
        };
        if actual.is_null() {
            return false;
        }

        match self {
            Predicate::Eq { value, .. } => actual == value,
            Predicate::Gt { value, .. } => {
                matches!(actual.partial_cmp(value), Some(std::cmp::Ordering::Greater))
            }
            Predicate::Lt { value, .. } => {
                matches!(actual.partial_cmp(value), Some(std::cmp::Ordering::Less))
            }
            Predicate::Gte { value, .. } => matches!(
                actual.partial_cmp(value),
                Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
            ),
            Predicate::Lte { value, .. } => matches!(
                actual.partial_cmp(value),
                Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
            ),
            Predicate::In { values, .. } => values.iter().any(|v| actual == v),
            Predicate::Like { pattern, .. } => match actual.as_str() {
                Some(s) => like_match(pattern, s),
                None => false,
            },
        }
    }
}

/// Check every predicate against a row (implicit AND).
pub fn matches_all(predicates: &[Predicate], row: &Record) -> bool {
    predicates.iter().all(|p| p.matches(row))
}

/// SQL-style LIKE with `%` as the multi-character wildcard.
///
/// A pattern without `%` requires an exact match.
pub fn like_match(pattern: &str, text: &str) -> bool {
    if !pattern.contains('%') {
        return pattern == text;
    }

    let parts: Vec<&str> = pattern.split('%').collect();
    let mut pos = 0usize;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !text.starts_with(part) {
                return false;
            }
            pos = part.len();
        } else if i == parts.len() - 1 {
            return text.len() >= pos && text[pos..].ends_with(part);
        } else {
            match text[pos..].find(part) {
                Some(found) => pos += found + part.len(),
                None => return false,
            }
        }
    }
    true
}
