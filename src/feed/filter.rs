//! Equality row filters in `column=eq.value` form

use std::fmt;
use std::str::FromStr;

use crate::utils::EngineError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowFilter {
    pub column: String,
    pub value: String,
}

impl RowFilter {
    pub fn eq(column: impl Into<String>, value: impl ToString) -> Self {
        Self {
            column: column.into(),
            value: value.to_string(),
        }
    }

    /// Whether a row's column equals the filter value
    ///
    /// Scalars are compared by their textual form, so `user_id=eq.42` matches
    /// both `42` and `"42"`. Missing columns never match.
    pub fn matches(&self, row: &serde_json::Value) -> bool {
        let Some(field) = row.get(&self.column) else {
            return false;
        };
        match field {
            serde_json::Value::String(s) => s == &self.value,
            serde_json::Value::Number(n) => n.to_string() == self.value,
            serde_json::Value::Bool(b) => b.to_string() == self.value,
            serde_json::Value::Null => self.value == "null",
            _ => false,
        }
    }
}

impl fmt::Display for RowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=eq.{}", self.column, self.value)
    }
}

impl FromStr for RowFilter {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (column, rest) = s
            .split_once('=')
            .ok_or_else(|| EngineError::InvalidData(format!("filter '{}' has no '='", s)))?;
        let value = rest
            .strip_prefix("eq.")
            .ok_or_else(|| {
                EngineError::InvalidData(format!("filter '{}' is not an eq filter", s))
            })?;

        let column = column.trim();
        if column.is_empty() || value.is_empty() {
            return Err(EngineError::InvalidData(format!("filter '{}' is incomplete", s)));
        }

        Ok(RowFilter::eq(column, value))
    }
}
