//! Data permission rules and their clauses.
//!
//! Clauses are stored as JSON objects of the shape
//! `{"table", "field", "type", "match", "value", "exclude"}`. They are
//! decoded once, when a rule is read, into [`RuleClause`] with a typed
//! [`ClauseKind`]; a malformed clause is an error, not a silent skip.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::expr::Operator;
use crate::value::{Id, Value};

/// How sibling fragments combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Or,
    And,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Or => "or",
            Mode::And => "and",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "or" | "0" => Ok(Mode::Or),
            "and" | "1" => Ok(Mode::And),
            other => Err(Error::InvalidRule(format!("unknown mode '{other}'"))),
        }
    }
}

/// Which table a `TABLE_*` clause lists ids of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdTable {
    User,
    Menu,
    Role,
    Dept,
}

/// What a clause's value means, with its decoded payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ClauseKind {
    All,
    /// The acting user's id.
    Owner,
    /// The acting user's department id.
    OwnerDepartment,
    /// The acting user's department and all its descendants.
    OwnerDepartments,
    /// The listed departments and all their descendants.
    Departments(Vec<Id>),
    /// `now` shifted by `offset_secs`.
    Date { offset_secs: i64 },
    DateTime(DateTime<Utc>),
    DateTimeRange(DateTime<Utc>, DateTime<Utc>),
    TableIds { table: IdTable, ids: Vec<Value> },
    Json(serde_json::Value),
    Text(Value),
}

impl ClauseKind {
    /// Kinds whose resolved value is an id set compared with `IN`.
    pub fn forces_membership(&self) -> bool {
        matches!(
            self,
            ClauseKind::OwnerDepartments | ClauseKind::Departments(_) | ClauseKind::TableIds { .. }
        )
    }
}

/// A clause's match operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Match {
    Compare(Operator),
    /// No restriction.
    All,
    /// Membership in the value list.
    M2m,
    /// One membership fragment per listed value.
    M2mAll,
    /// Address membership: CIDR blocks, `a-b` ranges, exact or partial
    /// dotted quads, or `*`.
    IpIn,
}

impl Match {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "all" => Ok(Match::All),
            "m2m" => Ok(Match::M2m),
            "m2m_all" => Ok(Match::M2mAll),
            "ip_in" => Ok(Match::IpIn),
            other => Operator::parse(other)
                .map(Match::Compare)
                .ok_or_else(|| Error::InvalidRule(format!("unknown match operator '{other}'"))),
        }
    }
}

/// One decoded condition of a rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleClause {
    /// Target table, or `"*"` for every table.
    pub table: String,
    pub field: String,
    pub kind: ClauseKind,
    pub matcher: Match,
    pub exclude: bool,
}

impl RuleClause {
    pub fn applies_to(&self, table: &str) -> bool {
        self.table == "*" || self.table == table
    }

    /// Decodes the JSON array stored in a rule's clause column.
    pub fn decode_all(json: &str) -> Result<Vec<RuleClause>> {
        let raw: Vec<RawClause> =
            serde_json::from_str(json).map_err(|e| Error::InvalidRule(e.to_string()))?;
        raw.into_iter().map(RuleClause::try_from).collect()
    }

    /// Encodes clauses back into their stored JSON shape.
    pub fn encode_all(clauses: &[RuleClause]) -> Result<String> {
        let raw: Vec<RawClause> = clauses.iter().map(RawClause::from).collect();
        serde_json::to_string(&raw).map_err(|e| Error::Parse(e.to_string()))
    }
}

/// A permission rule as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPermissionRule {
    pub id: Id,
    pub name: String,
    pub mode: Mode,
    pub clauses: Vec<RuleClause>,
    pub active: bool,
}

/// Stored shape of a clause.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawClause {
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default)]
    pub field: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "match", default = "default_match")]
    pub matcher: String,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default)]
    pub exclude: bool,
}

fn default_table() -> String {
    "*".to_string()
}

fn default_match() -> String {
    "eq".to_string()
}

impl TryFrom<RawClause> for RuleClause {
    type Error = Error;

    fn try_from(raw: RawClause) -> Result<Self> {
        let value = structured(&raw.value);
        let kind = match raw.kind.as_str() {
            "all" => ClauseKind::All,
            "owner" => ClauseKind::Owner,
            "owner_department" => ClauseKind::OwnerDepartment,
            "owner_departments" => ClauseKind::OwnerDepartments,
            "departments" => ClauseKind::Departments(
                list_items(&value)
                    .iter()
                    .map(|item| decode_id(&id_of(item)))
                    .collect::<Result<_>>()?,
            ),
            "date" => ClauseKind::Date {
                offset_secs: decode_int(&value)?,
            },
            "datetime" => ClauseKind::DateTime(decode_epoch(&value)?),
            "datetime_range" => match list_items(&value).as_slice() {
                [start, end] => ClauseKind::DateTimeRange(decode_epoch(start)?, decode_epoch(end)?),
                _ => {
                    return Err(Error::InvalidRule(
                        "datetime_range needs two timestamps".into(),
                    ));
                }
            },
            "table_user" | "table_menu" | "table_role" | "table_dept" => {
                let table = match raw.kind.as_str() {
                    "table_user" => IdTable::User,
                    "table_menu" => IdTable::Menu,
                    "table_role" => IdTable::Role,
                    _ => IdTable::Dept,
                };
                let ids = list_items(&value)
                    .iter()
                    .map(|item| Value::from_json(&id_of(item)))
                    .collect();
                ClauseKind::TableIds { table, ids }
            }
            "json" => match &raw.value {
                serde_json::Value::String(s) => ClauseKind::Json(
                    serde_json::from_str(s).map_err(|e| Error::InvalidRule(e.to_string()))?,
                ),
                other => ClauseKind::Json(other.clone()),
            },
            "text" => ClauseKind::Text(Value::from_json(&raw.value)),
            other => return Err(Error::InvalidRule(format!("unknown clause type '{other}'"))),
        };
        Ok(RuleClause {
            table: raw.table,
            field: raw.field,
            kind,
            matcher: Match::parse(&raw.matcher)?,
            exclude: raw.exclude,
        })
    }
}

impl From<&RuleClause> for RawClause {
    fn from(clause: &RuleClause) -> Self {
        let (kind, value) = match &clause.kind {
            ClauseKind::All => ("all", serde_json::Value::Null),
            ClauseKind::Owner => ("owner", serde_json::Value::Null),
            ClauseKind::OwnerDepartment => ("owner_department", serde_json::Value::Null),
            ClauseKind::OwnerDepartments => ("owner_departments", serde_json::Value::Null),
            ClauseKind::Departments(ids) => ("departments", serde_json::json!(ids)),
            ClauseKind::Date { offset_secs } => ("date", serde_json::json!(offset_secs)),
            ClauseKind::DateTime(at) => ("datetime", serde_json::json!(at.timestamp())),
            ClauseKind::DateTimeRange(a, b) => (
                "datetime_range",
                serde_json::json!([a.timestamp(), b.timestamp()]),
            ),
            ClauseKind::TableIds { table, ids } => {
                let kind = match table {
                    IdTable::User => "table_user",
                    IdTable::Menu => "table_menu",
                    IdTable::Role => "table_role",
                    IdTable::Dept => "table_dept",
                };
                (kind, serde_json::to_value(ids).unwrap_or_default())
            }
            ClauseKind::Json(v) => ("json", v.clone()),
            ClauseKind::Text(v) => ("text", serde_json::to_value(v).unwrap_or_default()),
        };
        RawClause {
            table: clause.table.clone(),
            field: clause.field.clone(),
            kind: kind.to_string(),
            matcher: match_name(clause.matcher),
            value,
            exclude: clause.exclude,
        }
    }
}

fn match_name(matcher: Match) -> String {
    use crate::expr::{Op, Transform};
    let name = match matcher {
        Match::All => "all",
        Match::M2m => "m2m",
        Match::M2mAll => "m2m_all",
        Match::IpIn => "ip_in",
        Match::Compare(Operator {
            transform: Some(t), ..
        }) => match t {
            Transform::Year => "year",
            Transform::Month => "month",
            Transform::Day => "day",
            Transform::Hour => "hour",
            Transform::Minute => "minute",
            Transform::Second => "second",
            Transform::Quarter => "quarter",
            Transform::Weekday => "weekday",
            Transform::IsoWeekday => "iso_weekday",
            Transform::Date => "date",
            Transform::Time => "time",
        },
        Match::Compare(Operator { op, .. }) => match op {
            Op::Eq => "eq",
            Op::Ne => "ne",
            Op::Gt => "gt",
            Op::Gte => "gte",
            Op::Lt => "lt",
            Op::Lte => "lte",
            Op::In => "in",
            Op::NotIn => "not_in",
            Op::Between => "between",
            Op::Contains => "contains",
            Op::StartsWith => "startswith",
            Op::EndsWith => "endswith",
            Op::IsNull => "isnull",
            Op::IsNotNull => "is_not",
            Op::Regex => "regex",
            Op::IRegex => "iregex",
        },
    };
    name.to_string()
}

/// Clause values may be stored as JSON or as a JSON-encoded string.
fn structured(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => {
            serde_json::from_str(s).unwrap_or_else(|_| value.clone())
        }
        other => other.clone(),
    }
}

fn list_items(value: &serde_json::Value) -> Vec<serde_json::Value> {
    match value {
        serde_json::Value::Array(items) => items.clone(),
        serde_json::Value::Null => Vec::new(),
        other => vec![other.clone()],
    }
}

/// Id lists mix bare ids and `{"id": ..}` objects.
fn id_of(item: &serde_json::Value) -> serde_json::Value {
    match item {
        serde_json::Value::Object(map) => map.get("id").cloned().unwrap_or_default(),
        other => other.clone(),
    }
}

fn decode_int(value: &serde_json::Value) -> Result<i64> {
    match value {
        serde_json::Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| Error::InvalidRule(format!("'{n}' is not an integer"))),
        serde_json::Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| Error::InvalidRule(format!("'{s}' is not an integer"))),
        other => Err(Error::InvalidRule(format!("'{other}' is not an integer"))),
    }
}

fn decode_id(value: &serde_json::Value) -> Result<Id> {
    decode_int(value)
}

fn decode_epoch(value: &serde_json::Value) -> Result<DateTime<Utc>> {
    let secs = decode_int(value)?;
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| Error::InvalidRule(format!("timestamp {secs} out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Op;
    use serde_json::json;

    fn decode(value: serde_json::Value) -> Result<Vec<RuleClause>> {
        RuleClause::decode_all(&value.to_string())
    }

    #[test]
    fn test_decode_owner_department() {
        let clauses = decode(json!([
            {"table": "orders", "field": "dept_belong_id", "type": "owner_department"}
        ]))
        .unwrap();
        assert_eq!(clauses[0].kind, ClauseKind::OwnerDepartment);
        assert_eq!(clauses[0].matcher, Match::Compare(Operator::EQ));
        assert!(clauses[0].applies_to("orders"));
        assert!(!clauses[0].applies_to("users"));
    }

    #[test]
    fn test_decode_accepts_encoded_strings() {
        let clauses = decode(json!([
            {"table": "*", "field": "dept_id", "type": "departments", "match": "in", "value": "[3, {\"id\": 4}]"},
            {"table": "*", "field": "created", "type": "date", "match": "gte", "value": "-3600"}
        ]))
        .unwrap();
        assert_eq!(clauses[0].kind, ClauseKind::Departments(vec![3, 4]));
        assert_eq!(clauses[1].kind, ClauseKind::Date { offset_secs: -3600 });
        assert_eq!(
            clauses[1].matcher,
            Match::Compare(Operator {
                op: Op::Gte,
                transform: None
            })
        );
    }

    #[test]
    fn test_decode_table_ids_flattens_objects() {
        let clauses = decode(json!([
            {"table": "t", "field": "creator_id", "type": "table_user", "value": [1, {"id": 2, "name": "x"}]}
        ]))
        .unwrap();
        assert_eq!(
            clauses[0].kind,
            ClauseKind::TableIds {
                table: IdTable::User,
                ids: vec![Value::Int(1), Value::Int(2)],
            }
        );
    }

    #[test]
    fn test_decode_datetime_range() {
        let clauses = decode(json!([
            {"field": "created", "type": "datetime_range", "match": "between", "value": [0, 86400]}
        ]))
        .unwrap();
        let ClauseKind::DateTimeRange(a, b) = clauses[0].kind else {
            panic!("expected a range");
        };
        assert_eq!((b - a).num_days(), 1);
        assert_eq!(clauses[0].table, "*");
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        assert!(matches!(
            decode(json!([{"field": "x", "type": "custom"}])),
            Err(Error::InvalidRule(_))
        ));
        assert!(matches!(
            decode(json!([{"field": "x", "type": "text", "match": "like"}])),
            Err(Error::InvalidRule(_))
        ));
    }

    #[test]
    fn test_decode_json_kind_requires_valid_json() {
        assert!(decode(json!([{"field": "x", "type": "json", "value": "{oops"}])).is_err());
        let clauses = decode(json!([{"field": "x", "type": "json", "value": "{\"a\": 1}"}])).unwrap();
        assert_eq!(clauses[0].kind, ClauseKind::Json(json!({"a": 1})));
    }

    #[test]
    fn test_encode_then_decode_preserves_kinds() {
        let clauses = decode(json!([
            {"table": "*", "field": "*", "type": "all", "match": "all"},
            {"table": "t", "field": "ip", "type": "text", "match": "ip_in", "value": "10.0.0.0/24"}
        ]))
        .unwrap();
        let encoded = RuleClause::encode_all(&clauses).unwrap();
        assert_eq!(RuleClause::decode_all(&encoded).unwrap(), clauses);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("AND".parse::<Mode>().unwrap(), Mode::And);
        assert_eq!("or".parse::<Mode>().unwrap(), Mode::Or);
        assert!("xor".parse::<Mode>().is_err());
    }
}
