//! Table schemas: declared columns and relation paths.

use std::collections::{BTreeMap, BTreeSet};

use crate::expr::Join;

/// A relation reachable from a table under a path name.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationPath {
    pub path: String,
    pub join: Join,
    pub target: TableSchema,
}

/// The columns and relations a filter may reference on one table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableSchema {
    name: String,
    columns: BTreeSet<String>,
    relations: BTreeMap<String, RelationPath>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns.extend(columns.into_iter().map(Into::into));
        self
    }

    /// Registers `path` as a relation to `target`, joined on
    /// `local` (this table) = `remote` (target table).
    pub fn with_relation(
        mut self,
        path: impl Into<String>,
        local: impl Into<String>,
        remote: impl Into<String>,
        target: TableSchema,
    ) -> Self {
        let path = path.into();
        let join = Join::new(target.name.clone(), local, remote);
        self.relations.insert(
            path.clone(),
            RelationPath { path, join, target },
        );
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.contains(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(String::as_str)
    }

    pub fn relation(&self, path: &str) -> Option<&RelationPath> {
        self.relations.get(path)
    }

    /// Resolves a dotted relation path (`creator.dept`) hop by hop.
    pub fn resolve_path(&self, path: &str) -> Option<Vec<&RelationPath>> {
        let mut hops = Vec::new();
        let mut current = self;
        for segment in path.split('.') {
            let hop = current.relation(segment)?;
            hops.push(hop);
            current = &hop.target;
        }
        Some(hops)
    }
}
