//! Read access to the permission directory.

use std::collections::BTreeSet;
use std::future::Future;

use policy::{DataPermissionRule, DeptEdge, FieldPermissionGrant, Id, Menu};
use storage::{Department, Role, Store, User};

use crate::Result;

/// Everything permission resolution reads from storage.
///
/// Implementations must be shareable across concurrent requests; each
/// request scope holds a shared reference.
pub trait Directory: Send + Sync {
    fn user(&self, id: Id) -> impl Future<Output = Result<Option<User>>> + Send;

    fn user_roles(&self, user_id: Id) -> impl Future<Output = Result<Vec<Role>>> + Send;

    fn department(&self, id: Id) -> impl Future<Output = Result<Option<Department>>> + Send;

    /// `(id, parent_id)` projection of all active departments.
    fn department_edges(&self) -> impl Future<Output = Result<Vec<DeptEdge>>> + Send;

    fn department_roles(&self, department_id: Id)
    -> impl Future<Output = Result<Vec<Role>>> + Send;

    /// Menus granted to any of the roles.
    fn role_menu_ids(
        &self,
        role_ids: &BTreeSet<Id>,
    ) -> impl Future<Output = Result<BTreeSet<Id>>> + Send;

    /// Active PERMISSION menus among `menu_ids`.
    fn permission_menus(
        &self,
        menu_ids: &BTreeSet<Id>,
    ) -> impl Future<Output = Result<Vec<Menu>>> + Send;

    /// Active rules assigned to any of the departments, unbound or bound
    /// to `menu_id`.
    fn department_rules(
        &self,
        department_ids: &BTreeSet<Id>,
        menu_id: Option<Id>,
    ) -> impl Future<Output = Result<Vec<DataPermissionRule>>> + Send;

    /// Active rules assigned to the user, unbound or bound to `menu_id`.
    fn user_rules(
        &self,
        user_id: Id,
        menu_id: Option<Id>,
    ) -> impl Future<Output = Result<Vec<DataPermissionRule>>> + Send;

    fn field_permissions(
        &self,
        menu_id: Id,
        role_ids: &BTreeSet<Id>,
    ) -> impl Future<Output = Result<Vec<FieldPermissionGrant>>> + Send;
}

impl Directory for Store {
    async fn user(&self, id: Id) -> Result<Option<User>> {
        Ok(Store::user(self, id)?)
    }

    async fn user_roles(&self, user_id: Id) -> Result<Vec<Role>> {
        Ok(Store::user_roles(self, user_id)?)
    }

    async fn department(&self, id: Id) -> Result<Option<Department>> {
        Ok(Store::department(self, id)?)
    }

    async fn department_edges(&self) -> Result<Vec<DeptEdge>> {
        Ok(Store::department_edges(self)?)
    }

    async fn department_roles(&self, department_id: Id) -> Result<Vec<Role>> {
        Ok(Store::department_roles(self, department_id)?)
    }

    async fn role_menu_ids(&self, role_ids: &BTreeSet<Id>) -> Result<BTreeSet<Id>> {
        Ok(Store::role_menu_ids(self, role_ids)?)
    }

    async fn permission_menus(&self, menu_ids: &BTreeSet<Id>) -> Result<Vec<Menu>> {
        Ok(Store::permission_menus(self, menu_ids)?)
    }

    async fn department_rules(
        &self,
        department_ids: &BTreeSet<Id>,
        menu_id: Option<Id>,
    ) -> Result<Vec<DataPermissionRule>> {
        Ok(Store::department_rules(self, department_ids, menu_id)?)
    }

    async fn user_rules(&self, user_id: Id, menu_id: Option<Id>) -> Result<Vec<DataPermissionRule>> {
        Ok(Store::user_rules(self, user_id, menu_id)?)
    }

    async fn field_permissions(
        &self,
        menu_id: Id,
        role_ids: &BTreeSet<Id>,
    ) -> Result<Vec<FieldPermissionGrant>> {
        Ok(Store::field_permissions(self, menu_id, role_ids)?)
    }
}
