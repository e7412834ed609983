//! SQLite storage for the permission directory and filtered row access.
//!
//! # Overview
//!
//! The [`Store`] persists everything permission resolution reads at request
//! time:
//!
//! - departments (a parent-linked tree) and users
//! - roles, assigned to users and to departments
//! - menus, the permission-scoping records routes resolve to
//! - data permission rules, assigned to departments and users and optionally
//!   scoped to menus
//! - model fields and field permissions per `(role, menu)`
//!
//! It also executes compiled predicates: [`lower`] turns a
//! [`policy::Expr`] into a parameterized SQLite condition, and
//! [`Store::select_rows`] reads rows through a filter and a
//! [`policy::FieldAccess`].
//!
//! # Example
//!
//! ```no_run
//! use policy::{Expr, FieldAccess, Mode, TableSchema};
//! use storage::{Page, Store};
//!
//! let store = Store::open("dataward.db")?;
//! let sales = store.create_department("Sales", None, Mode::Or)?;
//! let alice = store.create_user("alice", Some(sales), Mode::Or)?;
//!
//! let orders = TableSchema::new("orders").with_columns(["id", "creator_id"]);
//! let rows = store.select_rows(
//!     &orders,
//!     &Expr::eq("creator_id", alice),
//!     &FieldAccess::Unrestricted,
//!     Page::first(20),
//! )?;
//! println!("{} rows", rows.len());
//! # Ok::<(), storage::Error>(())
//! ```

mod error;
mod model;
mod rows;
mod sql;
mod store;

pub use error::{Error, Result};
pub use model::{Department, FieldKind, NewMenu, Role, User};
pub use rows::{Page, Row};
pub use sql::{ROOT_ALIAS, SqlPredicate, lower, quote_ident, register_functions};
pub use store::Store;
