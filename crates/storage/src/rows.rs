//! Reading application rows through a data filter and a field whitelist.

use policy::{Expr, FieldAccess, TableSchema};
use rusqlite::params_from_iter;
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde_json::{Map, Value as Json};
use tracing::debug;

use crate::sql::{ROOT_ALIAS, lower, quote_ident};
use crate::{Result, Store};

/// A page of rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Page {
    pub limit: Option<u32>,
    pub offset: u32,
}

impl Page {
    pub fn first(limit: u32) -> Self {
        Self {
            limit: Some(limit),
            offset: 0,
        }
    }
}

pub type Row = Map<String, Json>;

impl Store {
    /// Rows of `schema`'s table matching `filter`, restricted to the
    /// columns `access` allows, in rowid order.
    pub fn select_rows(
        &self,
        schema: &TableSchema,
        filter: &Expr,
        access: &FieldAccess,
        page: Page,
    ) -> Result<Vec<Row>> {
        let columns = access.visible_columns(schema);
        if columns.is_empty() || filter.is_deny_all() {
            debug!(table = %schema.name(), "nothing visible, skipping query");
            return Ok(Vec::new());
        }
        let predicate = lower(filter, schema);
        let select = columns
            .iter()
            .map(|c| format!("{ROOT_ALIAS}.{}", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let mut params = predicate.params;
        params.push(SqlValue::Integer(page.limit.map_or(-1, i64::from)));
        params.push(SqlValue::Integer(i64::from(page.offset)));
        let sql = format!(
            "SELECT {select} FROM {} AS {ROOT_ALIAS} WHERE {} ORDER BY {ROOT_ALIAS}.rowid LIMIT ? OFFSET ?",
            quote_ident(schema.name()),
            predicate.sql,
        );

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(params), |row| {
                let mut record = Row::new();
                for (i, column) in columns.iter().enumerate() {
                    record.insert(column.to_string(), json_of(row.get_ref(i)?));
                }
                Ok(record)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Number of rows of `schema`'s table matching `filter`.
    pub fn count_rows(&self, schema: &TableSchema, filter: &Expr) -> Result<u64> {
        if filter.is_deny_all() {
            return Ok(0);
        }
        let predicate = lower(filter, schema);
        let sql = format!(
            "SELECT COUNT(*) FROM {} AS {ROOT_ALIAS} WHERE {}",
            quote_ident(schema.name()),
            predicate.sql,
        );
        let count: i64 =
            self.conn()?
                .query_row(&sql, params_from_iter(predicate.params), |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

fn json_of(value: ValueRef<'_>) -> Json {
    match value {
        ValueRef::Null => Json::Null,
        ValueRef::Integer(i) => Json::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map_or(Json::Null, Json::Number),
        ValueRef::Text(bytes) => Json::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Json::from(bytes.to_vec()),
    }
}
