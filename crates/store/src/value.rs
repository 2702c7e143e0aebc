//! SQL literal rendering for insert statements
//!
//! Null policy: strings that mean "absent" are NULL, zero-valued
//! timestamps and counts are NULL, string arrays are never NULL (an
//! absent list is the empty array).

use chrono::{DateTime, Utc};

/// One cell of an insert statement.
#[derive(Clone, Debug, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    U64(u64),
    Str(String),
    Array(Vec<String>),
    DateTime(DateTime<Utc>),
}

impl SqlValue {
    /// Empty strings collapse to NULL.
    #[must_use]
    pub fn opt_str(value: impl Into<String>) -> Self {
        let value = value.into();
        if value.is_empty() {
            Self::Null
        } else {
            Self::Str(value)
        }
    }

    /// Zero collapses to NULL.
    #[must_use]
    pub const fn opt_u64(value: u64) -> Self {
        if value == 0 {
            Self::Null
        } else {
            Self::U64(value)
        }
    }

    #[must_use]
    pub fn opt_datetime(value: Option<DateTime<Utc>>) -> Self {
        match value {
            Some(value) => Self::DateTime(value),
            None => Self::Null,
        }
    }

    /// Renders the value as a ClickHouse literal.
    pub fn render(&self, out: &mut String) {
        match self {
            Self::Null => out.push_str("NULL"),
            Self::Bool(value) => out.push(if *value { '1' } else { '0' }),
            Self::U64(value) => out.push_str(&value.to_string()),
            Self::Str(value) => render_str(value, out),
            Self::Array(values) => {
                out.push('[');
                for (position, value) in values.iter().enumerate() {
                    if position > 0 {
                        out.push(',');
                    }
                    render_str(value, out);
                }
                out.push(']');
            }
            Self::DateTime(value) => {
                out.push('\'');
                out.push_str(&value.format("%Y-%m-%d %H:%M:%S%.3f").to_string());
                out.push('\'');
            }
        }
    }
}

fn render_str(value: &str, out: &mut String) {
    out.push('\'');
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\0' => out.push_str("\\0"),
            other => out.push(other),
        }
    }
    out.push('\'');
}
