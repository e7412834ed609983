//! Directory records stored alongside the permission rules.

use policy::{Id, MenuType, Mode};
use serde::{Deserialize, Serialize};

/// An organizational unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Department {
    pub id: Id,
    pub name: String,
    pub parent_id: Option<Id>,
    /// How rules combine for members of this department.
    pub mode: Mode,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Id,
    pub username: String,
    pub dept_id: Option<Id>,
    pub mode: Mode,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: Id,
    pub code: String,
    pub name: String,
}

/// Node kind of a model field: a table, or a column under a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Table,
    Column,
}

impl FieldKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldKind::Table => "table",
            FieldKind::Column => "column",
        }
    }
}

/// Input for [`crate::Store::create_menu`].
#[derive(Debug, Clone, Copy)]
pub struct NewMenu<'a> {
    pub name: &'a str,
    pub menu_type: MenuType,
    pub path: Option<&'a str>,
    pub method: Option<&'a str>,
    pub auths: &'a [&'a str],
}

impl<'a> NewMenu<'a> {
    /// An API permission bound to `method path`.
    pub fn permission(name: &'a str, method: &'a str, path: &'a str) -> Self {
        Self {
            name,
            menu_type: MenuType::Permission,
            path: Some(path),
            method: Some(method),
            auths: &[],
        }
    }

    pub fn with_auths(self, auths: &'a [&'a str]) -> Self {
        Self { auths, ..self }
    }
}

pub(crate) fn menu_type_name(menu_type: MenuType) -> &'static str {
    match menu_type {
        MenuType::Directory => "directory",
        MenuType::Menu => "menu",
        MenuType::Permission => "permission",
    }
}

pub(crate) fn parse_menu_type(name: &str) -> Option<MenuType> {
    match name {
        "directory" => Some(MenuType::Directory),
        "menu" => Some(MenuType::Menu),
        "permission" => Some(MenuType::Permission),
        _ => None,
    }
}
