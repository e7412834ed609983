//! Predicate tree handed to storage backends.

use serde::{Deserialize, Serialize};

use crate::raw::RawSql;
use crate::value::Value;

/// Comparison operator of a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Between,
    Contains,
    StartsWith,
    EndsWith,
    IsNull,
    IsNotNull,
    Regex,
    IRegex,
}

impl Op {
    /// Operators whose operand must be a list.
    pub fn takes_list(self) -> bool {
        matches!(self, Op::In | Op::NotIn | Op::Between)
    }
}

/// Transformation applied to a column before comparing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
    Quarter,
    Weekday,
    IsoWeekday,
    /// Truncate a timestamp to its date.
    Date,
    /// Truncate a timestamp to its time of day.
    Time,
}

impl Transform {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "year" => Transform::Year,
            "month" => Transform::Month,
            "day" => Transform::Day,
            "hour" => Transform::Hour,
            "minute" => Transform::Minute,
            "second" => Transform::Second,
            "quarter" => Transform::Quarter,
            "weekday" => Transform::Weekday,
            "iso_weekday" => Transform::IsoWeekday,
            "date" => Transform::Date,
            "time" => Transform::Time,
            _ => return None,
        })
    }
}

/// An operator suffix (`age__gte`, `created__year`) split into its parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operator {
    pub op: Op,
    pub transform: Option<Transform>,
}

impl Operator {
    pub const EQ: Operator = Operator {
        op: Op::Eq,
        transform: None,
    };

    /// Parses the name following `__` in a filter key.
    pub fn parse(name: &str) -> Option<Self> {
        if let Some(transform) = Transform::parse(name) {
            return Some(Operator {
                op: Op::Eq,
                transform: Some(transform),
            });
        }
        let op = match name {
            "eq" => Op::Eq,
            "ne" => Op::Ne,
            "gt" => Op::Gt,
            "gte" => Op::Gte,
            "lt" => Op::Lt,
            "lte" => Op::Lte,
            "in" => Op::In,
            "not_in" => Op::NotIn,
            "between" => Op::Between,
            "contains" => Op::Contains,
            "startswith" => Op::StartsWith,
            "endswith" => Op::EndsWith,
            "isnull" | "is" => Op::IsNull,
            "is_not" => Op::IsNotNull,
            "regex" => Op::Regex,
            "iregex" => Op::IRegex,
            _ => return None,
        };
        Some(Operator {
            op,
            transform: None,
        })
    }

    pub fn with_transform(self, transform: Option<Transform>) -> Self {
        Operator { transform, ..self }
    }
}

/// `column <op> value`, optionally on a transformed column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Transform>,
    pub op: Op,
    pub value: Value,
}

/// How a related table is reached: `local` on the outer table equals
/// `remote` on `table`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Join {
    pub table: String,
    pub local: String,
    pub remote: String,
}

impl Join {
    pub fn new(
        table: impl Into<String>,
        local: impl Into<String>,
        remote: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            local: local.into(),
            remote: remote.into(),
        }
    }
}

/// A boolean predicate over the rows of one table.
///
/// `True` means unrestricted and `False` means match nothing. Build
/// compound nodes with [`Expr::and`] / [`Expr::or`] so equal inputs yield
/// equal trees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    True,
    False,
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    Compare(Comparison),
    /// Holds when some row of the joined table satisfies `expr`.
    Relation {
        path: String,
        join: Join,
        expr: Box<Expr>,
    },
    /// Pre-screened raw text. Only constructible through [`RawSql`].
    #[serde(skip_deserializing)]
    Raw(RawSql),
}

impl Expr {
    pub fn compare(column: impl Into<String>, op: Op, value: impl Into<Value>) -> Self {
        Expr::Compare(Comparison {
            column: column.into(),
            transform: None,
            op,
            value: value.into(),
        })
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, Op::Eq, value)
    }

    pub fn in_list(column: impl Into<String>, values: Vec<Value>) -> Self {
        Self::compare(column, Op::In, Value::List(values))
    }

    pub fn raw(sql: RawSql) -> Self {
        Expr::Raw(sql)
    }

    /// Conjunction. Nested `And`s are flattened, `True` operands dropped,
    /// any `False` operand makes the whole conjunction `False`.
    pub fn and(items: impl IntoIterator<Item = Expr>) -> Self {
        let mut out = Vec::new();
        for item in items {
            match item {
                Expr::True => {}
                Expr::False => return Expr::False,
                Expr::And(inner) => out.extend(inner),
                other => out.push(other),
            }
        }
        match out.len() {
            0 => Expr::True,
            1 => out.pop().unwrap_or(Expr::True),
            _ => Expr::And(out),
        }
    }

    /// Disjunction. Mirror of [`Expr::and`].
    pub fn or(items: impl IntoIterator<Item = Expr>) -> Self {
        let mut out = Vec::new();
        for item in items {
            match item {
                Expr::False => {}
                Expr::True => return Expr::True,
                Expr::Or(inner) => out.extend(inner),
                other => out.push(other),
            }
        }
        match out.len() {
            0 => Expr::False,
            1 => out.pop().unwrap_or(Expr::False),
            _ => Expr::Or(out),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(expr: Expr) -> Self {
        match expr {
            Expr::True => Expr::False,
            Expr::False => Expr::True,
            Expr::Not(inner) => *inner,
            other => Expr::Not(Box::new(other)),
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        matches!(self, Expr::True)
    }

    pub fn is_deny_all(&self) -> bool {
        matches!(self, Expr::False)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_and_flattens_and_drops_true() {
        let a = Expr::eq("a", 1);
        let b = Expr::eq("b", 2);
        let c = Expr::eq("c", 3);
        let nested = Expr::and([Expr::True, Expr::and([a.clone(), b.clone()]), c.clone()]);
        assert_eq!(nested, Expr::And(vec![a, b, c]));
    }

    #[test]
    fn test_and_false_wins() {
        assert_eq!(Expr::and([Expr::eq("a", 1), Expr::False]), Expr::False);
        assert_eq!(Expr::and([]), Expr::True);
    }

    #[test]
    fn test_or_true_wins() {
        assert_eq!(Expr::or([Expr::eq("a", 1), Expr::True]), Expr::True);
        assert_eq!(Expr::or([]), Expr::False);
        assert_eq!(Expr::or([Expr::False, Expr::eq("a", 1)]), Expr::eq("a", 1));
    }

    #[test]
    fn test_double_negation() {
        let a = Expr::eq("a", 1);
        assert_eq!(Expr::not(Expr::not(a.clone())), a);
        assert_eq!(Expr::not(Expr::True), Expr::False);
    }

    #[test]
    fn test_operator_parse() {
        let op = Operator::parse("year").unwrap();
        assert_eq!(op.op, Op::Eq);
        assert_eq!(op.transform, Some(Transform::Year));
        assert_eq!(Operator::parse("is_not").unwrap().op, Op::IsNotNull);
        assert!(Operator::parse("like").is_none());
    }

    #[test]
    fn test_raw_is_never_deserialized() {
        let json = serde_json::json!({"raw": {"sql": "1=1", "params": []}});
        assert!(serde_json::from_value::<Expr>(json).is_err());
    }

    #[test]
    fn test_serde_shape() {
        let expr = Expr::and([Expr::eq("a", 1), Expr::compare("b", Op::Gte, 2)]);
        let json = serde_json::to_value(&expr).unwrap();
        let back: Expr = serde_json::from_value(json).unwrap();
        assert_eq!(back, expr);
    }
}
