//! SQLite lowering of predicate trees.
//!
//! Identifiers are always quoted and values always bound as parameters.
//! The root table is aliased [`ROOT_ALIAS`]; relation subqueries get
//! their own aliases.

use policy::{Comparison, Expr, Op, TableSchema, Transform, Value};
use rusqlite::Connection;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::{Value as SqlValue, ValueRef};

use crate::Result;

/// Alias of the filtered table in lowered SQL.
pub const ROOT_ALIAS: &str = "t0";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A `WHERE` condition with its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlPredicate {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// Lowers `expr` over `schema`'s table, referenced as [`ROOT_ALIAS`].
pub fn lower(expr: &Expr, schema: &TableSchema) -> SqlPredicate {
    let mut lowering = Lowering::default();
    let sql = lowering.expr(expr, ROOT_ALIAS);
    tracing::trace!(table = %schema.name(), %sql, "lowered filter");
    SqlPredicate {
        sql,
        params: lowering.params,
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Registers `REGEXP` (Rust regex syntax) on `conn`.
pub fn register_functions(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let pattern: String = ctx.get(0)?;
            let text = match ctx.get_raw(1) {
                ValueRef::Text(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                ValueRef::Integer(i) => i.to_string(),
                ValueRef::Real(f) => f.to_string(),
                ValueRef::Null | ValueRef::Blob(_) => return Ok(false),
            };
            let re = regex::Regex::new(&pattern)
                .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
            Ok(re.is_match(&text))
        },
    )?;
    Ok(())
}

#[derive(Default)]
struct Lowering {
    params: Vec<SqlValue>,
    aliases: usize,
}

impl Lowering {
    fn expr(&mut self, expr: &Expr, alias: &str) -> String {
        match expr {
            Expr::True => "1".to_string(),
            Expr::False => "0".to_string(),
            Expr::And(items) => self.join(items, " AND ", "1", alias),
            Expr::Or(items) => self.join(items, " OR ", "0", alias),
            Expr::Not(inner) => format!("NOT ({})", self.expr(inner, alias)),
            Expr::Compare(comparison) => self.comparison(comparison, alias),
            Expr::Relation { join, expr, .. } => {
                self.aliases += 1;
                let inner = format!("r{}", self.aliases);
                let condition = self.expr(expr, &inner);
                format!(
                    "{alias}.{} IN (SELECT {inner}.{} FROM {} AS {inner} WHERE {condition})",
                    quote_ident(&join.local),
                    quote_ident(&join.remote),
                    quote_ident(&join.table),
                )
            }
            Expr::Raw(raw) => {
                self.params.extend(raw.params().iter().map(bind_value));
                format!("({})", raw.sql())
            }
        }
    }

    fn join(&mut self, items: &[Expr], separator: &str, empty: &str, alias: &str) -> String {
        if items.is_empty() {
            return empty.to_string();
        }
        let parts: Vec<String> = items.iter().map(|item| self.expr(item, alias)).collect();
        format!("({})", parts.join(separator))
    }

    fn bind(&mut self, value: &Value) -> &'static str {
        self.params.push(bind_value(value));
        "?"
    }

    fn comparison(&mut self, c: &Comparison, alias: &str) -> String {
        let column = transformed(&format!("{alias}.{}", quote_ident(&c.column)), c.transform);
        match c.op {
            Op::Eq if c.value == Value::Null => format!("{column} IS NULL"),
            Op::Ne if c.value == Value::Null => format!("{column} IS NOT NULL"),
            Op::Eq => format!("{column} = {}", self.bind(&c.value)),
            Op::Ne => format!("{column} != {}", self.bind(&c.value)),
            Op::Gt => format!("{column} > {}", self.bind(&c.value)),
            Op::Gte => format!("{column} >= {}", self.bind(&c.value)),
            Op::Lt => format!("{column} < {}", self.bind(&c.value)),
            Op::Lte => format!("{column} <= {}", self.bind(&c.value)),
            Op::In | Op::NotIn => {
                let items = list_of(&c.value);
                if items.is_empty() {
                    return if c.op == Op::In { "0" } else { "1" }.to_string();
                }
                let slots: Vec<&str> = items.iter().map(|item| self.bind(item)).collect();
                let keyword = if c.op == Op::In { "IN" } else { "NOT IN" };
                format!("{column} {keyword} ({})", slots.join(", "))
            }
            Op::Between => match c.value.as_list() {
                Some([low, high]) => {
                    let low = self.bind(low);
                    let high = self.bind(high);
                    format!("{column} BETWEEN {low} AND {high}")
                }
                _ => "0".to_string(),
            },
            Op::Contains | Op::StartsWith | Op::EndsWith => {
                let text = escape_like(&text_of(&c.value));
                let pattern = match c.op {
                    Op::Contains => format!("%{text}%"),
                    Op::StartsWith => format!("{text}%"),
                    _ => format!("%{text}"),
                };
                self.params.push(SqlValue::Text(pattern));
                format!("{column} LIKE ? ESCAPE '\\'")
            }
            Op::IsNull => format!("{column} IS NULL"),
            Op::IsNotNull => format!("{column} IS NOT NULL"),
            Op::Regex | Op::IRegex => {
                let mut pattern = text_of(&c.value);
                if c.op == Op::IRegex {
                    pattern.insert_str(0, "(?i)");
                }
                self.params.push(SqlValue::Text(pattern));
                format!("{column} REGEXP ?")
            }
        }
    }
}

fn transformed(column: &str, transform: Option<Transform>) -> String {
    let part = |fmt: &str| format!("CAST(strftime('{fmt}', {column}) AS INTEGER)");
    match transform {
        None => column.to_string(),
        Some(Transform::Year) => part("%Y"),
        Some(Transform::Month) => part("%m"),
        Some(Transform::Day) => part("%d"),
        Some(Transform::Hour) => part("%H"),
        Some(Transform::Minute) => part("%M"),
        Some(Transform::Second) => part("%S"),
        Some(Transform::Quarter) => format!("(({} + 2) / 3)", part("%m")),
        Some(Transform::Weekday) => part("%w"),
        Some(Transform::IsoWeekday) => format!("((({} + 6) % 7) + 1)", part("%w")),
        Some(Transform::Date) => format!("date({column})"),
        Some(Transform::Time) => format!("time({column})"),
    }
}

fn list_of(value: &Value) -> Vec<Value> {
    match value {
        Value::List(items) => items.clone(),
        other => vec![other.clone()],
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::Text(s) => s.clone(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Timestamp(t) => t.format(TIMESTAMP_FORMAT).to_string(),
        Value::Null => String::new(),
        Value::List(_) | Value::Json(_) => serde_json::to_string(value).unwrap_or_default(),
    }
}

fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

pub(crate) fn bind_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Int(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
        Value::Timestamp(t) => SqlValue::Text(t.format(TIMESTAMP_FORMAT).to_string()),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::List(_) | Value::Json(_) => SqlValue::Text(text_of(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use policy::{Join, RawSql};

    fn schema() -> TableSchema {
        TableSchema::new("people").with_columns(["id", "name", "age"])
    }

    #[test]
    fn test_lower_conjunction() {
        let expr = Expr::and([
            Expr::compare("name", Op::In, vec!["a", "b"]),
            Expr::or([Expr::compare("age", Op::Gte, 18), Expr::compare("age", Op::Lt, 5)]),
        ]);
        let lowered = lower(&expr, &schema());
        assert_eq!(
            lowered.sql,
            r#"(t0."name" IN (?, ?) AND (t0."age" >= ? OR t0."age" < ?))"#
        );
        assert_eq!(
            lowered.params,
            vec![
                SqlValue::Text("a".into()),
                SqlValue::Text("b".into()),
                SqlValue::Integer(18),
                SqlValue::Integer(5),
            ]
        );
    }

    #[test]
    fn test_empty_in_is_false() {
        let lowered = lower(&Expr::in_list("id", vec![]), &schema());
        assert_eq!(lowered.sql, "0");
        assert!(lowered.params.is_empty());
    }

    #[test]
    fn test_null_equality() {
        let lowered = lower(&Expr::eq("name", Value::Null), &schema());
        assert_eq!(lowered.sql, r#"t0."name" IS NULL"#);
    }

    #[test]
    fn test_relation_subquery() {
        let expr = Expr::Relation {
            path: "dept".into(),
            join: Join::new("departments", "dept_id", "id"),
            expr: Box::new(Expr::eq("name", "Sales")),
        };
        let lowered = lower(&expr, &schema());
        assert_eq!(
            lowered.sql,
            r#"t0."dept_id" IN (SELECT r1."id" FROM "departments" AS r1 WHERE r1."name" = ?)"#
        );
    }

    #[test]
    fn test_like_escapes_wildcards() {
        let lowered = lower(&Expr::compare("name", Op::Contains, "50%_off"), &schema());
        assert_eq!(lowered.params, vec![SqlValue::Text(r"%50\%\_off%".into())]);
    }

    #[test]
    fn test_identifiers_are_quoted() {
        let lowered = lower(&Expr::eq(r#"na"me"#, 1), &schema());
        assert_eq!(lowered.sql, r#"t0."na""me" = ?"#);
    }

    #[test]
    fn test_raw_params_bound_in_order() {
        let raw = RawSql::new("age > ?", vec![Value::Int(3)]).unwrap();
        let expr = Expr::and([Expr::eq("name", "x"), Expr::raw(raw)]);
        let lowered = lower(&expr, &schema());
        assert_eq!(lowered.sql, r#"(t0."name" = ? AND (age > ?))"#);
        assert_eq!(
            lowered.params,
            vec![SqlValue::Text("x".into()), SqlValue::Integer(3)]
        );
    }

    #[test]
    fn test_quarter_transform() {
        let expr = Expr::Compare(Comparison {
            column: "created".into(),
            transform: Some(Transform::Quarter),
            op: Op::Eq,
            value: Value::Int(2),
        });
        let lowered = lower(&expr, &schema());
        assert_eq!(
            lowered.sql,
            r#"((CAST(strftime('%m', t0."created") AS INTEGER) + 2) / 3) = ?"#
        );
    }

    #[test]
    fn test_regexp_function() {
        let conn = Connection::open_in_memory().unwrap();
        register_functions(&conn).unwrap();
        let matched: bool = conn
            .query_row("SELECT 'order-42' REGEXP '^order-\\d+$'", [], |row| row.get(0))
            .unwrap();
        assert!(matched);
        let matched: bool = conn
            .query_row("SELECT 'Order' REGEXP '(?i)^order$'", [], |row| row.get(0))
            .unwrap();
        assert!(matched);
    }
}
