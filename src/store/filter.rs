//! Metadata filter language for store queries
//!
//! Filters are JSON expressions evaluated against a document's metadata map:
//!
//! ```json
//! {"$and": [
//!   {"conversation_id": "default"},
//!   {"role": {"$ne": "summary"}},
//!   {"salience": {"$gte": 0.5}}
//! ]}
//! ```
//!
//! Supported operators: equality, `$ne`, `$gt`, `$gte`, `$lt`, `$lte`,
//! `$in`, `$nin`, `$and`, `$or`. A plain map with several keys is
//! implicitly `$and`-ed.

use serde_json::Value;

use crate::error::{RecallError, Result};

/// A parsed filter expression
#[derive(Debug, Clone, PartialEq)]
pub enum WhereClause {
    And(Vec<WhereClause>),
    Or(Vec<WhereClause>),
    Cmp { field: String, op: CmpOp },
}

/// Comparison operator on a single field
#[derive(Debug, Clone, PartialEq)]
pub enum CmpOp {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
}

impl WhereClause {
    /// Shorthand equality filter
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        WhereClause::Cmp {
            field: field.into(),
            op: CmpOp::Eq(value.into()),
        }
    }

    /// Shorthand inequality filter
    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        WhereClause::Cmp {
            field: field.into(),
            op: CmpOp::Ne(value.into()),
        }
    }

    /// Conjunction of several clauses
    pub fn and(clauses: Vec<WhereClause>) -> Self {
        WhereClause::And(clauses)
    }

    /// Parse a JSON filter expression
    pub fn parse(value: &Value) -> Result<Self> {
        let obj = value.as_object().ok_or_else(|| {
            RecallError::InvalidInput("filter must be a JSON object".to_string())
        })?;

        if obj.is_empty() {
            return Err(RecallError::InvalidInput("empty filter".to_string()));
        }

        // Logical operators take a list of sub-filters.
        if let Some(list) = obj.get("$and") {
            return Ok(WhereClause::And(Self::parse_list(list, "$and")?));
        }
        if let Some(list) = obj.get("$or") {
            return Ok(WhereClause::Or(Self::parse_list(list, "$or")?));
        }

        // Field conditions; multiple keys are implicitly AND-ed.
        let mut clauses = Vec::with_capacity(obj.len());
        for (field, condition) in obj {
            if field.starts_with('$') {
                return Err(RecallError::InvalidInput(format!(
                    "unknown logical operator: {field}"
                )));
            }
            clauses.push(WhereClause::Cmp {
                field: field.clone(),
                op: CmpOp::parse(condition)?,
            });
        }
        if clauses.len() == 1 {
            Ok(clauses.pop().unwrap_or(WhereClause::And(vec![])))
        } else {
            Ok(WhereClause::And(clauses))
        }
    }

    fn parse_list(value: &Value, operator: &str) -> Result<Vec<WhereClause>> {
        value
            .as_array()
            .ok_or_else(|| {
                RecallError::InvalidInput(format!("{operator} expects a list of filters"))
            })?
            .iter()
            .map(Self::parse)
            .collect()
    }

    /// Evaluate against a metadata map
    pub fn matches(&self, metadata: &serde_json::Map<String, Value>) -> bool {
        match self {
            WhereClause::And(clauses) => clauses.iter().all(|c| c.matches(metadata)),
            WhereClause::Or(clauses) => clauses.iter().any(|c| c.matches(metadata)),
            WhereClause::Cmp { field, op } => op.matches(metadata.get(field)),
        }
    }
}

impl CmpOp {
    fn parse(condition: &Value) -> Result<Self> {
        let Some(obj) = condition.as_object() else {
            // Direct value means equality.
            return Ok(CmpOp::Eq(condition.clone()));
        };

        if obj.len() != 1 {
            return Err(RecallError::InvalidInput(
                "field condition must hold exactly one operator".to_string(),
            ));
        }
        let (op, value) = match obj.iter().next() {
            Some((k, v)) => (k.as_str(), v),
            None => return Err(RecallError::InvalidInput("empty field condition".to_string())),
        };

        let as_list = |v: &Value, name: &str| -> Result<Vec<Value>> {
            v.as_array().cloned().ok_or_else(|| {
                RecallError::InvalidInput(format!("{name} expects a list of values"))
            })
        };

        match op {
            "$ne" => Ok(CmpOp::Ne(value.clone())),
            "$gt" => Ok(CmpOp::Gt(value.clone())),
            "$gte" => Ok(CmpOp::Gte(value.clone())),
            "$lt" => Ok(CmpOp::Lt(value.clone())),
            "$lte" => Ok(CmpOp::Lte(value.clone())),
            "$in" => Ok(CmpOp::In(as_list(value, "$in")?)),
            "$nin" => Ok(CmpOp::Nin(as_list(value, "$nin")?)),
            other => Err(RecallError::InvalidInput(format!(
                "unknown filter operator: {other}"
            ))),
        }
    }

    fn matches(&self, actual: Option<&Value>) -> bool {
        match self {
            CmpOp::Eq(expected) => actual.map(|a| values_equal(a, expected)).unwrap_or(false),
            CmpOp::Ne(expected) => actual.map(|a| !values_equal(a, expected)).unwrap_or(true),
            CmpOp::Gt(expected) => compare(actual, expected)
                .map(|o| o == std::cmp::Ordering::Greater)
                .unwrap_or(false),
            CmpOp::Gte(expected) => compare(actual, expected)
                .map(|o| o != std::cmp::Ordering::Less)
                .unwrap_or(false),
            CmpOp::Lt(expected) => compare(actual, expected)
                .map(|o| o == std::cmp::Ordering::Less)
                .unwrap_or(false),
            CmpOp::Lte(expected) => compare(actual, expected)
                .map(|o| o != std::cmp::Ordering::Greater)
                .unwrap_or(false),
            CmpOp::In(values) => actual
                .map(|a| values.iter().any(|v| values_equal(a, v)))
                .unwrap_or(false),
            CmpOp::Nin(values) => actual
                .map(|a| !values.iter().any(|v| values_equal(a, v)))
                .unwrap_or(true),
        }
    }
}

/// Value equality with numeric normalization (1 == 1.0)
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Ordered comparison over numbers or strings
fn compare(actual: Option<&Value>, expected: &Value) -> Option<std::cmp::Ordering> {
    let actual = actual?;
    if let (Some(x), Some(y)) = (actual.as_f64(), expected.as_f64()) {
        return x.partial_cmp(&y);
    }
    if let (Some(x), Some(y)) = (actual.as_str(), expected.as_str()) {
        return Some(x.cmp(y));
    }
    None
}
