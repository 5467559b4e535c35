//! The `column=op.literal` filter mini-language attached to CDC
//! subscriptions. A filter narrows row changes to those whose record matches
//! a single column predicate, e.g. `id=eq.42` or `status=in.(open,stale)`.
use crate::{Error, Result};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
}

impl FilterOp {
    fn parse(value: &str) -> Result<Self> {
        match value {
            "eq" => Ok(FilterOp::Eq),
            "neq" => Ok(FilterOp::Neq),
            "lt" => Ok(FilterOp::Lt),
            "lte" => Ok(FilterOp::Lte),
            "gt" => Ok(FilterOp::Gt),
            "gte" => Ok(FilterOp::Gte),
            "in" => Ok(FilterOp::In),
            other => Err(Error::InvalidFilter(format!("unknown operator: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeFilter {
    pub column: String,
    pub op: FilterOp,
    /// Raw literal text; for `in`, the comma-separated members.
    values: Vec<String>,
}

impl ChangeFilter {
    /// Parse `column=op.literal`. The `in` operator takes a parenthesized
    /// comma list: `status=in.(open,closed)`.
    pub fn parse(input: &str) -> Result<Self> {
        let (column, rest) = input
            .split_once('=')
            .ok_or_else(|| Error::InvalidFilter(format!("missing '=' in {input:?}")))?;
        let (op_text, literal) = rest
            .split_once('.')
            .ok_or_else(|| Error::InvalidFilter(format!("missing operator in {input:?}")))?;
        if column.is_empty() {
            return Err(Error::InvalidFilter("empty column name".to_string()));
        }
        let op = FilterOp::parse(op_text)?;
        let values = match op {
            FilterOp::In => {
                let inner = literal
                    .strip_prefix('(')
                    .and_then(|rest| rest.strip_suffix(')'))
                    .ok_or_else(|| {
                        Error::InvalidFilter(format!("'in' needs a parenthesized list: {literal:?}"))
                    })?;
                inner.split(',').map(|v| v.trim().to_string()).collect()
            }
            _ => vec![literal.to_string()],
        };
        Ok(Self {
            column: column.to_string(),
            op,
            values,
        })
    }

    /// Evaluate the predicate against a record. A missing column never
    /// matches. Comparison is numeric when both sides parse as numbers,
    /// lexicographic otherwise.
    pub fn matches(&self, record: &serde_json::Map<String, Value>) -> bool {
        let Some(actual) = record.get(&self.column) else {
            return false;
        };
        let actual = literal_text(actual);
        match self.op {
            FilterOp::Eq => compare(&actual, &self.values[0]) == std::cmp::Ordering::Equal,
            FilterOp::Neq => compare(&actual, &self.values[0]) != std::cmp::Ordering::Equal,
            FilterOp::Lt => compare(&actual, &self.values[0]) == std::cmp::Ordering::Less,
            FilterOp::Lte => compare(&actual, &self.values[0]) != std::cmp::Ordering::Greater,
            FilterOp::Gt => compare(&actual, &self.values[0]) == std::cmp::Ordering::Greater,
            FilterOp::Gte => compare(&actual, &self.values[0]) != std::cmp::Ordering::Less,
            FilterOp::In => self
                .values
                .iter()
                .any(|v| compare(&actual, v) == std::cmp::Ordering::Equal),
        }
    }
}

// Render a JSON value the way it would have been written in a filter literal.
fn literal_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn compare(left: &str, right: &str) -> std::cmp::Ordering {
    if let (Ok(l), Ok(r)) = (left.parse::<f64>(), right.parse::<f64>()) {
        return l.partial_cmp(&r).unwrap_or(std::cmp::Ordering::Equal);
    }
    left.cmp(right)
}
