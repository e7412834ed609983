//! Raw text predicates and the injection scan guarding them.
//!
//! Raw text is an escape hatch for conditions the AST cannot express. It is
//! never produced by ordinary filter parsing: callers construct a [`RawSql`]
//! explicitly, and construction fails if the text trips the scan. The scan is
//! a heuristic gate in front of parameter binding, not a replacement for it;
//! values always travel as bound parameters.

use std::sync::LazyLock;

use regex::RegexSet;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::value::Value;

static INJECTION_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)\b(union|select|insert|delete|update|drop|alter|exec|execute|create)\b",
        r"--",
        r"/\*",
        r"\*/",
        r";",
        r"'",
        r#"""#,
        r"(?i)\bor\b.*=\s*\b1\b",
        r"(?i)\band\b.*=\s*\b0\b",
        r"(?i)\badmin\b",
        r"(?i)\b(xor|and|or|not)\b",
    ])
    .expect("injection patterns are valid")
});

/// Returns true when `input` looks like an injection attempt.
///
/// Empty input is treated as suspicious.
pub fn detect_injection(input: &str) -> bool {
    input.trim().is_empty() || INJECTION_PATTERNS.is_match(input)
}

/// A screened raw predicate with `?` placeholders and bound parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawSql {
    sql: String,
    params: Vec<Value>,
}

impl RawSql {
    /// Screens `sql` and wraps it.
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Result<Self> {
        let sql = sql.into();
        if detect_injection(&sql) {
            tracing::warn!("rejected raw predicate");
            return Err(Error::InjectionDetected(sql));
        }
        let placeholders = sql.matches('?').count();
        if placeholders != params.len() {
            return Err(Error::InvalidFilter(format!(
                "raw predicate has {placeholders} placeholders but {} parameters",
                params.len()
            )));
        }
        Ok(Self { sql, params })
    }

    /// Accepts either a bare string or `{"sql": "...", "params": [...]}`.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::String(sql) => Self::new(sql.as_str(), Vec::new()),
            serde_json::Value::Object(map) => {
                let sql = map
                    .get("sql")
                    .and_then(|s| s.as_str())
                    .ok_or_else(|| Error::InvalidFilter("raw predicate needs 'sql'".into()))?;
                let params = match map.get("params") {
                    None | Some(serde_json::Value::Null) => Vec::new(),
                    Some(serde_json::Value::Array(items)) => {
                        items.iter().map(Value::from_json).collect()
                    }
                    Some(_) => {
                        return Err(Error::InvalidFilter(
                            "raw predicate 'params' must be a list".into(),
                        ));
                    }
                };
                Self::new(sql, params)
            }
            _ => Err(Error::InvalidFilter(
                "raw predicate must be a string or an object".into(),
            )),
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_detects_statement_chaining() {
        assert!(detect_injection("1=1; DROP TABLE users;--"));
        assert!(detect_injection("name = 'x'"));
        assert!(detect_injection("a = 1 /* hi */"));
        assert!(detect_injection("a = 1 OR b = 1"));
        assert!(detect_injection(""));
    }

    #[test]
    fn test_accepts_plain_comparison() {
        assert!(!detect_injection("age > ?"));
        assert!(!detect_injection("length(name) < ?"));
    }

    #[test]
    fn test_keywords_are_case_insensitive() {
        assert!(detect_injection("x IN (SeLeCt id FROM t)"));
        assert!(detect_injection("Union"));
    }

    #[test]
    fn test_from_json_rejects_drop() {
        let err = RawSql::from_json(&json!({"sql": "1=1; DROP TABLE users;--"})).unwrap_err();
        assert!(matches!(err, Error::InjectionDetected(_)));
    }

    #[test]
    fn test_from_json_with_params() {
        let raw = RawSql::from_json(&json!({"sql": "age > ?", "params": [18]})).unwrap();
        assert_eq!(raw.sql(), "age > ?");
        assert_eq!(raw.params(), &[Value::Int(18)]);
    }

    #[test]
    fn test_placeholder_count_must_match() {
        assert!(matches!(
            RawSql::new("age > ?", vec![]),
            Err(Error::InvalidFilter(_))
        ));
    }
}
