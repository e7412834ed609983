//! Compiles stored permission rules into a predicate for one table.

use std::net::Ipv4Addr;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, warn};

use crate::combine::{group_fragments, merge_groups};
use crate::expr::{Comparison, Expr, Op, Operator};
use crate::hierarchy::{DeptTree, Direction};
use crate::rule::{ClauseKind, DataPermissionRule, Match, Mode, RuleClause};
use crate::schema::TableSchema;
use crate::value::{Id, Value};

/// Largest CIDR block (smallest prefix) expanded into a host list. A /20
/// lowers to 4094 bound parameters, under SQLite's variable limit.
const MIN_EXPANDED_PREFIX: u8 = 20;

/// The user on whose behalf rules are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActingUser {
    pub id: Id,
    pub department_id: Option<Id>,
}

/// The department whose mode governs how rule groups merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActingDepartment {
    pub id: Id,
    pub mode: Mode,
}

/// Everything a compilation depends on besides the rules themselves.
#[derive(Debug, Clone, Copy)]
pub struct RuleContext<'a> {
    pub schema: &'a TableSchema,
    pub user: Option<ActingUser>,
    pub department: Option<ActingDepartment>,
    pub tree: &'a DeptTree,
    /// Reference time for relative date clauses.
    pub now: DateTime<Utc>,
}

/// Turns [`DataPermissionRule`]s into a predicate for one table.
#[derive(Debug, Clone, Copy)]
pub struct RuleCompiler<'a> {
    ctx: RuleContext<'a>,
}

impl<'a> RuleCompiler<'a> {
    pub fn new(ctx: RuleContext<'a>) -> Self {
        Self { ctx }
    }

    /// Compiles `rules` for the context's table.
    ///
    /// Returns `None` when no active rule has a clause for the table,
    /// `Some(Expr::True)` when the rules leave the table unrestricted and
    /// `Some(Expr::False)` when they allow nothing.
    pub fn compile(&self, rules: &[DataPermissionRule]) -> Option<Expr> {
        let table = self.ctx.schema.name();
        let selected: Vec<(Mode, Vec<&RuleClause>)> = rules
            .iter()
            .filter(|rule| rule.active)
            .filter_map(|rule| select_clauses(rule, table))
            .collect();
        if selected.is_empty() {
            debug!(table, "no applicable rule");
            return None;
        }

        let department_or = self
            .ctx
            .department
            .is_none_or(|department| department.mode == Mode::Or);
        let has_open_rule = selected.iter().any(|(mode, clauses)| {
            *mode == Mode::Or && clauses.iter().any(|c| matches!(c.kind, ClauseKind::All))
        });
        if department_or && has_open_rule {
            debug!(table, "rule grants all rows");
            return Some(Expr::True);
        }

        let groups = selected
            .into_iter()
            .map(|(mode, clauses)| {
                let fragments = clauses
                    .into_iter()
                    .flat_map(|clause| self.fragments(clause))
                    .collect();
                group_fragments(mode, fragments)
            })
            .collect();
        Some(merge_groups(
            groups,
            self.ctx.department.map(|department| department.mode),
        ))
    }

    fn fragments(&self, clause: &RuleClause) -> Vec<Option<Expr>> {
        if matches!(clause.kind, ClauseKind::All) || clause.matcher == Match::All {
            return vec![None];
        }
        let Some(column) = self.column_for(&clause.field) else {
            warn!(
                table = %self.ctx.schema.name(),
                field = %clause.field,
                "rule clause names an unknown column, compiling to false"
            );
            return vec![Some(Expr::False)];
        };
        let matcher = if clause.kind.forces_membership() {
            Match::Compare(Operator {
                op: Op::In,
                transform: None,
            })
        } else {
            clause.matcher
        };
        let fragments = build_fragments(column, matcher, self.resolve_value(&clause.kind));
        if clause.exclude {
            fragments
                .into_iter()
                .map(|fragment| fragment.map(Expr::not))
                .collect()
        } else {
            fragments
        }
    }

    /// A clause may name a column, or a relation whose join column is used.
    fn column_for<'f>(&'f self, field: &'f str) -> Option<&'f str> {
        if self.ctx.schema.has_column(field) {
            return Some(field);
        }
        self.ctx
            .schema
            .relation(field)
            .map(|relation| relation.join.local.as_str())
    }

    fn resolve_value(&self, kind: &ClauseKind) -> Value {
        let user = self.ctx.user;
        match kind {
            ClauseKind::All => Value::Null,
            ClauseKind::Owner => Value::Int(user.map_or(0, |u| u.id)),
            ClauseKind::OwnerDepartment => {
                Value::Int(user.and_then(|u| u.department_id).unwrap_or(0))
            }
            ClauseKind::OwnerDepartments => {
                let ids = user
                    .and_then(|u| u.department_id)
                    .map(|root| self.ctx.tree.resolve(root, Direction::Descendants))
                    .unwrap_or_default();
                id_list(ids)
            }
            ClauseKind::Departments(roots) => id_list(
                self.ctx
                    .tree
                    .resolve_many(roots.iter().copied(), Direction::Descendants),
            ),
            ClauseKind::Date { offset_secs } => {
                let shifted = TimeDelta::try_seconds(*offset_secs)
                    .and_then(|delta| self.ctx.now.checked_add_signed(delta))
                    .unwrap_or(self.ctx.now);
                Value::Timestamp(shifted)
            }
            ClauseKind::DateTime(at) => Value::Timestamp(*at),
            ClauseKind::DateTimeRange(start, end) => {
                Value::List(vec![Value::Timestamp(*start), Value::Timestamp(*end)])
            }
            ClauseKind::TableIds { ids, .. } => Value::List(ids.clone()),
            ClauseKind::Json(json) => Value::from_json(json),
            ClauseKind::Text(value) => value.clone(),
        }
    }
}

/// Keeps only the clauses of `rule` that target `table`, applying the
/// ALL rules: dropped under AND, sole survivor under OR. A rule with a
/// single clause is always OR.
fn select_clauses<'r>(
    rule: &'r DataPermissionRule,
    table: &str,
) -> Option<(Mode, Vec<&'r RuleClause>)> {
    let mode = if rule.clauses.len() == 1 {
        Mode::Or
    } else {
        rule.mode
    };
    let mut selected = Vec::new();
    for clause in rule.clauses.iter().filter(|c| c.applies_to(table)) {
        if matches!(clause.kind, ClauseKind::All) {
            match mode {
                Mode::And => continue,
                Mode::Or => {
                    selected = vec![clause];
                    break;
                }
            }
        }
        selected.push(clause);
    }
    (!selected.is_empty()).then_some((mode, selected))
}

fn id_list(ids: impl IntoIterator<Item = Id>) -> Value {
    Value::List(ids.into_iter().map(Value::Int).collect())
}

fn build_fragments(column: &str, matcher: Match, value: Value) -> Vec<Option<Expr>> {
    match matcher {
        Match::All => vec![None],
        Match::IpIn => vec![ip_fragment(column, &value)],
        Match::M2m => vec![Some(Expr::in_list(column, value.into_list()))],
        Match::M2mAll => {
            let items = value.into_list();
            if items.is_empty() {
                return vec![Some(Expr::False)];
            }
            items
                .into_iter()
                .map(|item| Some(Expr::in_list(column, vec![item])))
                .collect()
        }
        Match::Compare(operator) => vec![compare_fragment(column, operator, value)],
    }
}

fn compare_fragment(column: &str, operator: Operator, value: Value) -> Option<Expr> {
    let leaf = |op: Op, value: Value| {
        Some(Expr::Compare(Comparison {
            column: column.to_string(),
            transform: operator.transform,
            op,
            value,
        }))
    };
    match operator.op {
        Op::Eq => leaf(Op::Eq, value),
        Op::IsNull | Op::IsNotNull => leaf(operator.op, Value::Null),
        Op::In => {
            let items = value.into_list();
            if items.iter().any(Value::is_wildcard) {
                return None;
            }
            leaf(Op::In, Value::List(items))
        }
        // `"*"` is only a wildcard inside `in`; elsewhere it is a literal.
        Op::Contains
        | Op::StartsWith
        | Op::EndsWith
        | Op::Gt
        | Op::Gte
        | Op::Lt
        | Op::Lte
        | Op::Ne => leaf(operator.op, value),
        Op::Regex | Op::IRegex => {
            let valid = value
                .as_text()
                .is_some_and(|pattern| regex::Regex::new(pattern).is_ok());
            if !valid {
                warn!(column, "invalid regex in rule clause, compiling to false");
                return Some(Expr::False);
            }
            leaf(operator.op, value)
        }
        Op::NotIn => leaf(Op::NotIn, Value::List(value.into_list())),
        Op::Between => {
            if !value.as_list().is_some_and(|items| items.len() == 2) {
                warn!(column, "between clause needs two values, compiling to false");
                return Some(Expr::False);
            }
            leaf(Op::Between, value)
        }
    }
}

/// Address filter for `ip_in` clauses. Entries are comma separated (or a
/// list) and OR'ed together.
fn ip_fragment(column: &str, value: &Value) -> Option<Expr> {
    let entries: Vec<String> = match value {
        Value::List(items) => items
            .iter()
            .filter_map(|item| item.as_text().map(str::to_string))
            .collect(),
        Value::Text(text) => text.split(',').map(str::to_string).collect(),
        _ => Vec::new(),
    };
    let mut parts = Vec::new();
    for entry in entries.iter().map(|e| e.trim()).filter(|e| !e.is_empty()) {
        if entry == "*" {
            return None;
        }
        parts.push(ip_entry(column, entry));
    }
    Some(Expr::or(parts))
}

fn ip_entry(column: &str, entry: &str) -> Expr {
    if let Some((network, prefix)) = entry.split_once('/') {
        let hosts = network
            .trim()
            .parse::<Ipv4Addr>()
            .ok()
            .zip(prefix.trim().parse::<u8>().ok())
            .and_then(|(network, prefix)| cidr_hosts(network, prefix));
        return match hosts {
            Some(hosts) => Expr::in_list(column, hosts),
            None => {
                warn!(column, entry, "unsupported CIDR block, compiling to false");
                Expr::False
            }
        };
    }
    if let Some((start, end)) = entry.split_once('-') {
        return Expr::compare(
            column,
            Op::Between,
            vec![start.trim().to_string(), end.trim().to_string()],
        );
    }
    if entry.parse::<Ipv4Addr>().is_ok() {
        return Expr::eq(column, entry);
    }
    Expr::compare(column, Op::StartsWith, entry)
}

/// Usable host addresses of a block, or `None` for blocks too large to
/// expand or an invalid prefix.
fn cidr_hosts(network: Ipv4Addr, prefix: u8) -> Option<Vec<Value>> {
    if !(MIN_EXPANDED_PREFIX..=32).contains(&prefix) {
        return None;
    }
    let mask = u32::MAX.checked_shl(u32::from(32 - prefix)).unwrap_or(0);
    let first = u32::from(network) & mask;
    let last = first | !mask;
    let (start, end) = if prefix >= 31 {
        (first, last)
    } else {
        (first + 1, last - 1)
    };
    Some(
        (start..=end)
            .map(|addr| Value::Text(Ipv4Addr::from(addr).to_string()))
            .collect(),
    )
}
