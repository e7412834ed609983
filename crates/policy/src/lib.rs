//! Data and field authorization compiler.
//!
//! Given a caller, a department tree and stored permission rules, this crate
//! produces a predicate tree ([`Expr`]) restricting which rows of a table the
//! caller may access, and a [`FieldAccess`] restricting which columns.
//!
//! Core principle: **no applicable rule means no data.** Only the superuser
//! or an explicit ALL rule opens a table completely.
//!
//! # Pieces
//!
//! - [`compile_filter`]: the general filter language, used for rule clauses
//!   and for request query parameters ([`QueryFilterSet`]).
//! - [`RuleCompiler`]: stored [`DataPermissionRule`]s to a predicate.
//! - [`combine()`]: department and user results to the final filter.
//! - [`DeptTree`]: ancestor and descendant resolution.
//! - [`resolve_menu`] and [`FieldGrants`]: field whitelists per route.
//! - [`RawSql`]: the screened raw-text escape hatch.
//!
//! Everything here is pure; fetching rules and departments is the caller's
//! job.

mod combine;
mod compiler;
mod error;
mod expr;
mod fields;
mod filter;
mod hierarchy;
mod raw;
mod rule;
mod schema;
mod value;

pub use combine::{combine, group_fragments, merge_groups};
pub use compiler::{ActingDepartment, ActingUser, RuleCompiler, RuleContext};
pub use error::{Error, Result};
pub use expr::{Comparison, Expr, Join, Op, Operator, Transform};
pub use fields::{
    FieldAccess, FieldDescriptor, FieldGrants, FieldPermissionGrant, GrantedField, Menu,
    MenuType, RouteMatch, WILDCARD, WriteAcceptance, resolve_menu, split_auths,
};
pub use filter::{QueryFilterSet, compile_filter, validate_key};
pub use hierarchy::{DeptEdge, DeptTree, Direction};
pub use raw::{RawSql, detect_injection};
pub use rule::{ClauseKind, DataPermissionRule, IdTable, Match, Mode, RawClause, RuleClause};
pub use schema::{RelationPath, TableSchema};
pub use value::{Id, Value};
