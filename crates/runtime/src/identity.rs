//! Caller identity as handed over by authentication.

use std::collections::BTreeSet;

use policy::Id;
use serde::{Deserialize, Serialize};
use storage::Role;

use crate::directory::Directory;
use crate::{Error, Result};

/// The authenticated caller of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: Id,
    pub department_id: Option<Id>,
    pub roles: Vec<Role>,
}

impl Caller {
    pub fn new(user_id: Id) -> Self {
        Self {
            user_id,
            department_id: None,
            roles: Vec::new(),
        }
    }

    pub fn in_department(mut self, department_id: Id) -> Self {
        self.department_id = Some(department_id);
        self
    }

    pub fn with_roles(mut self, roles: Vec<Role>) -> Self {
        self.roles = roles;
        self
    }

    /// Builds the caller for an active user from the directory.
    pub async fn load<D: Directory>(directory: &D, user_id: Id) -> Result<Self> {
        let user = directory
            .user(user_id)
            .await?
            .filter(|user| user.active)
            .ok_or(Error::UnknownUser(user_id))?;
        let roles = directory.user_roles(user_id).await?;
        Ok(Self {
            user_id,
            department_id: user.dept_id,
            roles,
        })
    }
}

/// The caller's effective roles: their own plus their department's.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleScope {
    pub codes: BTreeSet<String>,
    pub ids: BTreeSet<Id>,
}

impl RoleScope {
    pub fn extend<'a>(&mut self, roles: impl IntoIterator<Item = &'a Role>) {
        for role in roles {
            self.codes.insert(role.code.clone());
            self.ids.insert(role.id);
        }
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.codes.contains(code)
    }
}
