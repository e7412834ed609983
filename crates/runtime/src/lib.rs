//! Request-time permission resolution.
//!
//! This crate ties the rule compiler in `policy` to the permission
//! directory in `storage` and answers, for one authenticated request, the
//! two questions a data-access layer asks:
//!
//! - which rows of a table may the caller see ([`RequestScope::resolve_data_filter`])
//! - which columns may they read and write ([`RequestScope::resolve_allowed_fields`])
//!
//! # Overview
//!
//! - **Caller**: the authenticated user, their department and roles.
//! - **Directory**: a trait over everything resolution reads from storage.
//!   [`storage::Store`] implements it.
//! - **RequestScope**: per-request state. Roles, menus, the department tree
//!   and compiled filters are loaded on first use and reused for the rest
//!   of the request, never across requests.
//!
//! # Example
//!
//! ```no_run
//! use policy::TableSchema;
//! use runtime::{Caller, FieldAccess, RequestScope, RouteMatch};
//! use storage::{Page, Store};
//!
//! # async fn example() -> runtime::Result<()> {
//! let store = Store::open("dataward.db")?;
//! let orders = TableSchema::new("orders").with_columns(["id", "creator_id", "total"]);
//!
//! let caller = Caller::load(&store, 7).await?;
//! let route = RouteMatch {
//!     path: "/api/orders".into(),
//!     template: "/api/orders".into(),
//!     method: "GET".into(),
//!     tags: vec![],
//! };
//! let mut scope = RequestScope::new(&store, caller).with_route(route);
//!
//! let query = runtime::compile_filter(&orders, &serde_json::json!({"total__gte": 100}))?;
//! let filter = scope.effective_filter(&orders, query).await?;
//! let access: FieldAccess = scope.resolve_allowed_fields(&orders).await?;
//! let rows = store.select_rows(&orders, &filter, &access, Page::first(50))?;
//! println!("{} rows", rows.len());
//! # Ok(())
//! # }
//! ```

mod directory;
mod error;
mod identity;
mod scope;

pub use directory::Directory;
pub use error::{Error, Result};
pub use identity::{Caller, RoleScope};
pub use scope::{DEFAULT_SUPERUSER_ID, RequestScope};

pub use policy::{Expr, FieldAccess, RouteMatch, TableSchema};

/// Compiles a request's query filter against `schema`.
///
/// Raw text conditions (`__text`) are rejected; raw SQL only enters a
/// predicate through [`policy::RawSql`].
pub fn compile_filter(schema: &TableSchema, filter: &serde_json::Value) -> Result<Expr> {
    Ok(policy::compile_filter(schema, filter)?)
}
