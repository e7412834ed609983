//! Field permissions: which columns a caller may read and write.
//!
//! Grants are configured per `(role, menu)`, where a menu is the
//! permission-scoping record an API route resolves to. The current menu
//! is picked from the caller's permission menus by [`resolve_menu`], and
//! the grants of all caller roles for that menu are unioned by
//! [`FieldGrants::from_grants`].

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::schema::TableSchema;
use crate::value::Id;

/// Grants every table or every field.
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MenuType {
    Directory,
    Menu,
    Permission,
}

/// A permission-scoping resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Menu {
    pub id: Id,
    pub name: String,
    pub menu_type: MenuType,
    pub path: Option<String>,
    pub method: Option<String>,
    /// Permission tags, stored comma separated.
    pub auths: Vec<String>,
    pub active: bool,
}

impl Menu {
    fn accepts_method(&self, method: &str) -> bool {
        self.method
            .as_deref()
            .is_some_and(|m| m.eq_ignore_ascii_case(method))
    }

    fn has_path(&self, path: &str) -> bool {
        self.path.as_deref() == Some(path)
    }
}

/// Splits a stored `a,b, c` tag list.
pub fn split_auths(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}

/// The route being served, as reported by the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RouteMatch {
    /// Concrete request path, e.g. `/api/orders/42`.
    pub path: String,
    /// Route template, e.g. `/api/orders/{id}`.
    pub template: String,
    pub method: String,
    /// Permission tags the route requires.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Picks the menu a route resolves to among `menus`.
///
/// Only active PERMISSION menus are candidates. An exact path match wins
/// over a template match, which wins over a shared permission tag. Within
/// a tier the first menu in `menus` wins.
pub fn resolve_menu(menus: &[Menu], route: &RouteMatch) -> Option<Id> {
    let candidates = || {
        menus
            .iter()
            .filter(|menu| menu.active && menu.menu_type == MenuType::Permission)
    };
    let tags: BTreeSet<&str> = route.tags.iter().map(String::as_str).collect();
    candidates()
        .find(|menu| menu.accepts_method(&route.method) && menu.has_path(&route.path))
        .or_else(|| {
            candidates()
                .find(|menu| menu.accepts_method(&route.method) && menu.has_path(&route.template))
        })
        .or_else(|| {
            candidates().find(|menu| menu.auths.iter().any(|tag| tags.contains(tag.as_str())))
        })
        .map(|menu| menu.id)
}

/// A granted column, joined with the table node that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantedField {
    pub id: Id,
    pub table: String,
    pub name: String,
    pub label: Option<String>,
}

/// One configured `(role, menu)` permission and its fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldPermissionGrant {
    pub role_id: Id,
    pub menu_id: Id,
    pub fields: Vec<GrantedField>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub id: Id,
    pub label: Option<String>,
}

/// Union of field grants for the current menu, grouped by table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldGrants {
    configured: bool,
    tables: BTreeMap<String, BTreeMap<String, FieldDescriptor>>,
}

impl FieldGrants {
    /// No permission configured: every column is allowed.
    pub fn unrestricted() -> Self {
        Self::default()
    }

    /// Unions `grants`. With no grant at all the result is unrestricted;
    /// a grant with no fields restricts to nothing.
    pub fn from_grants(grants: impl IntoIterator<Item = FieldPermissionGrant>) -> Self {
        let mut out = Self::default();
        for grant in grants {
            out.configured = true;
            for field in grant.fields {
                out.tables.entry(field.table).or_default().insert(
                    field.name,
                    FieldDescriptor {
                        id: field.id,
                        label: field.label,
                    },
                );
            }
        }
        out
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn for_table(&self, table: &str) -> FieldAccess {
        if !self.configured {
            return FieldAccess::Unrestricted;
        }
        let mut fields = BTreeMap::new();
        for key in [WILDCARD, table] {
            if let Some(granted) = self.tables.get(key) {
                fields.extend(granted.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        if fields.contains_key(WILDCARD) {
            FieldAccess::Unrestricted
        } else {
            FieldAccess::Only(fields)
        }
    }
}

/// Columns of one table a caller may touch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FieldAccess {
    Unrestricted,
    Only(BTreeMap<String, FieldDescriptor>),
}

/// Result of filtering a write payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteAcceptance {
    pub accepted: serde_json::Map<String, serde_json::Value>,
    pub rejected: Vec<String>,
}

impl FieldAccess {
    pub fn allows(&self, column: &str) -> bool {
        match self {
            FieldAccess::Unrestricted => true,
            FieldAccess::Only(fields) => fields.contains_key(column),
        }
    }

    /// Allowed columns of `schema`, in schema order.
    pub fn visible_columns<'s>(&self, schema: &'s TableSchema) -> Vec<&'s str> {
        schema.columns().filter(|c| self.allows(c)).collect()
    }

    /// Drops disallowed keys from a record before it is returned.
    pub fn prune(&self, record: &mut serde_json::Map<String, serde_json::Value>) {
        if let FieldAccess::Only(fields) = self {
            record.retain(|key, _| fields.contains_key(key));
        }
    }

    /// Splits a write payload into accepted and rejected keys.
    pub fn accept_write(
        &self,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> WriteAcceptance {
        let mut out = WriteAcceptance::default();
        for (key, value) in payload {
            if self.allows(&key) {
                out.accepted.insert(key, value);
            } else {
                out.rejected.push(key);
            }
        }
        out
    }
}
