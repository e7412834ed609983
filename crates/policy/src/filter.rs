//! Filter expression compiler.
//!
//! Filters are JSON objects whose keys drive the shape of the resulting
//! [`Expr`]:
//!
//! - `__or` / `__and`: a list of sub-filters, or one object whose entries
//!   are combined.
//! - `__not`: negation of the conjunction of a sub-filter.
//! - `__true` / `__false`: constant leaves.
//! - `__where`: a serialized [`Expr`], accepted when every column and join
//!   it references is registered on the [`TableSchema`].
//! - `"relation.attr"`: a condition on a related table, reached through a
//!   relation registered on the [`TableSchema`].
//! - `"field__op"`: an operator bound to a column. `field__or` takes an
//!   object of `op: value` pairs combined with OR on the same column.
//! - `"field"`: equality.
//!
//! Combinator keys are matched by prefix, so `__or_1` and `__or_2` can share
//! one object. Raw text (`__text`) is refused here; see [`crate::RawSql`].

use std::collections::BTreeSet;

use serde_json::Map;
use tracing::warn;

use crate::error::{Error, Result};
use crate::expr::{Comparison, Expr, Op, Operator, Transform};
use crate::schema::TableSchema;
use crate::value::Value;

type JsonMap = Map<String, serde_json::Value>;

/// Compiles a filter object against `schema`. `null` compiles to `True`.
pub fn compile_filter(schema: &TableSchema, filter: &serde_json::Value) -> Result<Expr> {
    match filter {
        serde_json::Value::Null => Ok(Expr::True),
        serde_json::Value::Object(map) => compile_map(schema, map),
        _ => Err(Error::InvalidFilter("filter must be an object".into())),
    }
}

fn compile_map(schema: &TableSchema, map: &JsonMap) -> Result<Expr> {
    let parts = map
        .iter()
        .map(|(key, value)| compile_entry(schema, key, value))
        .collect::<Result<Vec<_>>>()?;
    Ok(Expr::and(parts))
}

fn compile_entry(schema: &TableSchema, key: &str, value: &serde_json::Value) -> Result<Expr> {
    if key.starts_with("__or") {
        return Ok(Expr::or(compile_group(schema, key, value)?));
    }
    if key.starts_with("__and") {
        return Ok(Expr::and(compile_group(schema, key, value)?));
    }
    if key.starts_with("__not") {
        return Ok(Expr::not(Expr::and(compile_group(schema, key, value)?)));
    }
    if key.starts_with("__true") {
        return Ok(Expr::True);
    }
    if key.starts_with("__false") {
        return Ok(Expr::False);
    }
    if key.starts_with("__where") {
        let expr: Expr = serde_json::from_value(value.clone())
            .map_err(|e| Error::InvalidFilter(format!("{key}: {e}")))?;
        check_where(schema, &expr)?;
        return Ok(expr);
    }
    if key.starts_with("__text") {
        return Err(Error::RawTextNotAllowed);
    }
    if let Some((path, attr)) = key.rsplit_once('.') {
        return compile_relation(schema, path, attr, value);
    }
    compile_field(schema, key, value)
}

/// Walks a deserialized expression: comparisons must name columns of the
/// table they apply to, and relations must follow a registered join.
fn check_where(schema: &TableSchema, expr: &Expr) -> Result<()> {
    match expr {
        Expr::True | Expr::False => Ok(()),
        Expr::And(items) | Expr::Or(items) => {
            items.iter().try_for_each(|item| check_where(schema, item))
        }
        Expr::Not(inner) => check_where(schema, inner),
        Expr::Compare(cmp) if schema.has_column(&cmp.column) => Ok(()),
        Expr::Compare(cmp) => Err(unknown_column(schema, &cmp.column)),
        Expr::Relation { path, join, expr } => {
            let relation = schema
                .relation(path)
                .filter(|relation| relation.join == *join)
                .ok_or_else(|| {
                    Error::InvalidFilter(format!(
                        "__where: no relation '{path}' to '{}' on table '{}'",
                        join.table,
                        schema.name()
                    ))
                })?;
            check_where(&relation.target, expr)
        }
        Expr::Raw(_) => Err(Error::InvalidFilter("__where cannot carry raw SQL".into())),
    }
}

/// Operands of a combinator: each list item is a conjunction of its
/// entries; an object contributes one operand per entry.
fn compile_group(schema: &TableSchema, key: &str, value: &serde_json::Value) -> Result<Vec<Expr>> {
    match value {
        serde_json::Value::Array(items) => items
            .iter()
            .map(|item| match item {
                serde_json::Value::Object(map) => compile_map(schema, map),
                _ => Err(Error::InvalidFilter(format!("{key} items must be objects"))),
            })
            .collect(),
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| compile_entry(schema, k, v))
            .collect(),
        _ => Err(Error::InvalidFilter(format!(
            "{key} expects a list or an object"
        ))),
    }
}

fn compile_relation(
    schema: &TableSchema,
    path: &str,
    attr: &str,
    value: &serde_json::Value,
) -> Result<Expr> {
    let Some(hops) = schema.resolve_path(path) else {
        warn!(table = %schema.name(), path, "unknown relation path, compiling to false");
        return Ok(Expr::False);
    };
    let Some(last) = hops.last() else {
        return Ok(Expr::False);
    };
    let mut expr = compile_entry(&last.target, attr, value)?;
    for hop in hops.iter().rev() {
        expr = Expr::Relation {
            path: hop.path.clone(),
            join: hop.join.clone(),
            expr: Box::new(expr),
        };
    }
    Ok(expr)
}

fn compile_field(schema: &TableSchema, key: &str, value: &serde_json::Value) -> Result<Expr> {
    if schema.has_column(key) {
        return comparison(key, Operator::EQ, value);
    }
    let Some((field, op_name)) = key.rsplit_once("__") else {
        return Err(unknown_column(schema, key));
    };
    let (column, transform) = split_column(schema, field)?;

    if op_name == "or" {
        let serde_json::Value::Object(ops) = value else {
            return Err(Error::InvalidFilter(format!(
                "{key} expects an object of operator/value pairs"
            )));
        };
        let parts = ops
            .iter()
            .map(|(name, v)| {
                let operator = parse_operator(name)?;
                let transform = merge_transform(key, transform, operator.transform)?;
                comparison(column, operator.with_transform(transform), v)
            })
            .collect::<Result<Vec<_>>>()?;
        return Ok(Expr::or(parts));
    }

    let operator = parse_operator(op_name)?;
    let transform = merge_transform(key, transform, operator.transform)?;
    comparison(column, operator.with_transform(transform), value)
}

/// Splits `created__year` into its column and transform when the plain
/// name is not a column.
fn split_column<'a>(schema: &TableSchema, field: &'a str) -> Result<(&'a str, Option<Transform>)> {
    if schema.has_column(field) {
        return Ok((field, None));
    }
    if let Some((column, suffix)) = field.rsplit_once("__") {
        if let Some(transform) = Transform::parse(suffix) {
            if schema.has_column(column) {
                return Ok((column, Some(transform)));
            }
        }
    }
    Err(unknown_column(schema, field))
}

fn parse_operator(name: &str) -> Result<Operator> {
    Operator::parse(name).ok_or_else(|| Error::InvalidFilter(format!("unknown operator '{name}'")))
}

fn merge_transform(
    key: &str,
    a: Option<Transform>,
    b: Option<Transform>,
) -> Result<Option<Transform>> {
    match (a, b) {
        (Some(_), Some(_)) => Err(Error::InvalidFilter(format!(
            "{key} applies two column transforms"
        ))),
        (a, b) => Ok(a.or(b)),
    }
}

fn unknown_column(schema: &TableSchema, column: &str) -> Error {
    Error::UnknownColumn {
        table: schema.name().to_string(),
        column: column.to_string(),
    }
}

fn comparison(column: &str, operator: Operator, raw: &serde_json::Value) -> Result<Expr> {
    let value = Value::from_json(raw);
    let (op, value) = match operator.op {
        Op::IsNull | Op::IsNotNull => {
            let negate = value == Value::Bool(false);
            let op = match (operator.op, negate) {
                (Op::IsNull, false) | (Op::IsNotNull, true) => Op::IsNull,
                _ => Op::IsNotNull,
            };
            (op, Value::Null)
        }
        Op::In | Op::NotIn => match value {
            Value::List(_) => (operator.op, value),
            _ => {
                return Err(Error::InvalidFilter(format!(
                    "'{column}' {:?} requires a list",
                    operator.op
                )));
            }
        },
        Op::Between => {
            if !value.as_list().is_some_and(|items| items.len() == 2) {
                return Err(Error::InvalidFilter(format!(
                    "'{column}' between requires a list of two values"
                )));
            }
            (Op::Between, value)
        }
        Op::Regex | Op::IRegex => {
            let Some(pattern) = value.as_text() else {
                return Err(Error::InvalidFilter(format!(
                    "'{column}' regex requires a string pattern"
                )));
            };
            if regex::Regex::new(pattern).is_err() {
                warn!(column, "invalid regex pattern, compiling to false");
                return Ok(Expr::False);
            }
            (operator.op, value)
        }
        op => (op, value),
    };
    Ok(Expr::Compare(Comparison {
        column: column.to_string(),
        transform: operator.transform,
        op,
        value,
    }))
}

/// Checks that a filter key names a column (or relation path) and a known
/// operator on `schema`, without a value.
pub fn validate_key(schema: &TableSchema, key: &str) -> Result<()> {
    if key.starts_with("__") {
        return Err(Error::InvalidFilter(format!(
            "'{key}' is not a column filter"
        )));
    }
    if let Some((path, attr)) = key.rsplit_once('.') {
        let last = schema
            .resolve_path(path)
            .and_then(|hops| hops.last().map(|hop| &hop.target))
            .ok_or_else(|| {
                Error::InvalidFilter(format!(
                    "unknown relation '{path}' on table '{}'",
                    schema.name()
                ))
            })?;
        return validate_key(last, attr);
    }
    if schema.has_column(key) {
        return Ok(());
    }
    let (field, op_name) = key
        .rsplit_once("__")
        .ok_or_else(|| unknown_column(schema, key))?;
    let (_, transform) = split_column(schema, field)?;
    if op_name != "or" {
        let operator = parse_operator(op_name)?;
        merge_transform(key, transform, operator.transform)?;
    }
    Ok(())
}

/// The filter keys a route accepts from query parameters.
///
/// Keys are validated against the table schema when the set is built, so a
/// misconfigured key fails at startup rather than on a request.
#[derive(Debug, Clone)]
pub struct QueryFilterSet {
    schema: TableSchema,
    keys: BTreeSet<String>,
}

impl QueryFilterSet {
    pub fn new<I, S>(schema: TableSchema, keys: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys = keys.into_iter().map(Into::into).collect::<BTreeSet<_>>();
        for key in &keys {
            validate_key(&schema, key)?;
        }
        Ok(Self { schema, keys })
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }

    /// Builds the filter object for the declared keys present in `params`.
    /// List operators take comma-separated values.
    pub fn to_filter<'a, I>(&self, params: I) -> serde_json::Value
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        serde_json::Value::Object(self.entries(params))
    }

    /// Compiles the declared keys present in `params`. A value that does
    /// not fit its operator (a single bound for `between`, say) matches no
    /// rows instead of failing the request.
    pub fn compile<'a, I>(&self, params: I) -> Result<Expr>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let parts = self
            .entries(params)
            .iter()
            .map(|(key, value)| match compile_entry(&self.schema, key, value) {
                Err(Error::InvalidFilter(reason)) => {
                    warn!(
                        table = %self.schema.name(),
                        key = key.as_str(),
                        reason = %reason,
                        "malformed query parameter, compiling to false"
                    );
                    Ok(Expr::False)
                }
                compiled => compiled,
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Expr::and(parts))
    }

    fn entries<'a, I>(&self, params: I) -> JsonMap
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut map = JsonMap::new();
        for (key, raw) in params {
            if !self.keys.contains(key) {
                continue;
            }
            let takes_list = key
                .rsplit_once("__")
                .and_then(|(_, op)| Operator::parse(op))
                .is_some_and(|operator| operator.op.takes_list());
            let value = if takes_list {
                serde_json::Value::Array(raw.split(',').map(param_value).collect())
            } else {
                param_value(raw)
            };
            map.insert(key.to_string(), value);
        }
        map
    }
}

fn param_value(raw: &str) -> serde_json::Value {
    let raw = raw.trim();
    if let Ok(i) = raw.parse::<i64>() {
        return i.into();
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return serde_json::Value::Number(n);
        }
    }
    match raw {
        "true" => true.into(),
        "false" => false.into(),
        _ => raw.into(),
    }
}
