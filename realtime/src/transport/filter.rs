//! Row filters in PostgREST form, e.g. `id=eq.5` or `status=in.(open,reserved)`.

use crate::error::{transport_error, Error, TransportErrorKind};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// Filter operator for row filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
}

impl FilterOp {
    fn parse(op: &str) -> Option<Self> {
        match op {
            "eq" => Some(FilterOp::Eq),
            "neq" => Some(FilterOp::Neq),
            "gt" => Some(FilterOp::Gt),
            "gte" => Some(FilterOp::Gte),
            "lt" => Some(FilterOp::Lt),
            "lte" => Some(FilterOp::Lte),
            "in" => Some(FilterOp::In),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Neq => "neq",
            FilterOp::Gt => "gt",
            FilterOp::Gte => "gte",
            FilterOp::Lt => "lt",
            FilterOp::Lte => "lte",
            FilterOp::In => "in",
        }
    }
}

/// A single-column predicate evaluated against a row image.
#[derive(Debug, Clone, PartialEq)]
pub struct RowFilter {
    pub column: String,
    pub op: FilterOp,
    /// Literal operands; one element for every operator except `in`.
    pub values: Vec<String>,
}

impl RowFilter {
    pub fn parse(filter: &str) -> Result<Self, Error> {
        let invalid = || transport_error(TransportErrorKind::InvalidFilter, filter);

        let (column, rest) = filter.split_once('=').ok_or_else(invalid)?;
        let (op, literal) = rest.split_once('.').ok_or_else(invalid)?;
        let column = column.trim();
        if column.is_empty() {
            return Err(invalid());
        }
        let op = FilterOp::parse(op.trim()).ok_or_else(invalid)?;

        let values = if op == FilterOp::In {
            let list = literal
                .trim()
                .strip_prefix('(')
                .and_then(|l| l.strip_suffix(')'))
                .ok_or_else(invalid)?;
            list.split(',')
                .map(|v| v.trim().trim_matches('"').to_string())
                .filter(|v| !v.is_empty())
                .collect()
        } else {
            vec![literal.to_string()]
        };

        Ok(Self {
            column: column.to_string(),
            op,
            values,
        })
    }

    /// Check a row image against this filter. Missing columns never match.
    pub fn matches(&self, record: &Value) -> bool {
        let Some(field) = record.get(&self.column) else {
            return false;
        };
        let Some(field) = literal_of(field) else {
            return false;
        };

        match self.op {
            FilterOp::Eq => self.values.first().is_some_and(|v| *v == field),
            FilterOp::Neq => self.values.first().is_some_and(|v| *v != field),
            FilterOp::In => self.values.iter().any(|v| *v == field),
            FilterOp::Gt => self.compare(&field) == Some(Ordering::Greater),
            FilterOp::Gte => matches!(
                self.compare(&field),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::Lt => self.compare(&field) == Some(Ordering::Less),
            FilterOp::Lte => matches!(
                self.compare(&field),
                Some(Ordering::Less | Ordering::Equal)
            ),
        }
    }

    /// Orders the field against the operand: numerically when both parse as
    /// numbers, lexically otherwise (ISO timestamps sort correctly).
    fn compare(&self, field: &str) -> Option<Ordering> {
        let operand = self.values.first()?;
        match (field.parse::<f64>(), operand.parse::<f64>()) {
            (Ok(a), Ok(b)) => a.partial_cmp(&b),
            _ => Some(field.cmp(operand.as_str())),
        }
    }
}

impl fmt::Display for RowFilter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.op == FilterOp::In {
            write!(f, "{}=in.({})", self.column, self.values.join(","))
        } else {
            write!(
                f,
                "{}={}.{}",
                self.column,
                self.op.as_str(),
                self.values.first().map(String::as_str).unwrap_or_default()
            )
        }
    }
}

fn literal_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some("null".to_string()),
        Value::Array(_) | Value::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn parses_eq_filter() {
        let filter = RowFilter::parse("id=eq.5").unwrap();
        assert_eq!(filter.column, "id");
        assert_eq!(filter.op, FilterOp::Eq);
        assert_eq!(filter.values, vec!["5"]);
        assert_eq!(filter.to_string(), "id=eq.5");
    }

    #[test]
    fn eq_compares_numbers_and_strings() {
        let filter = RowFilter::parse("id=eq.5").unwrap();
        assert!(filter.matches(&json!({"id": 5})));
        assert!(filter.matches(&json!({"id": "5"})));
        assert!(!filter.matches(&json!({"id": 6})));
        assert!(!filter.matches(&json!({"title": "no id"})));
    }

    #[test]
    fn in_filter_matches_any_listed_value() {
        let filter = RowFilter::parse("status=in.(available,reserved)").unwrap();
        assert!(filter.matches(&json!({"status": "reserved"})));
        assert!(!filter.matches(&json!({"status": "collected"})));
    }

    #[test]
    fn range_filters_are_numeric_when_possible() {
        let filter = RowFilter::parse("quantity=gte.10").unwrap();
        assert!(filter.matches(&json!({"quantity": 10})));
        assert!(filter.matches(&json!({"quantity": 12.5})));
        assert!(!filter.matches(&json!({"quantity": 9})));

        let filter = RowFilter::parse("expires_at=lt.2024-06-01").unwrap();
        assert!(filter.matches(&json!({"expires_at": "2024-05-30T12:00:00Z"})));
        assert!(!filter.matches(&json!({"expires_at": "2024-06-02T00:00:00Z"})));
    }

    #[test]
    fn rejects_malformed_filters() {
        for bad in ["id", "id=5", "id=like.5", "=eq.5", "id=in.5"] {
            let err = RowFilter::parse(bad).unwrap_err();
            assert_eq!(
                err.error_kind,
                ErrorKind::Transport(TransportErrorKind::InvalidFilter),
                "{bad} should be rejected"
            );
        }
    }
}
