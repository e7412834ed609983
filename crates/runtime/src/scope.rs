//! Per-request permission scope.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use policy::{
    ActingDepartment, ActingUser, DeptTree, Direction, Expr, FieldAccess, FieldGrants, Id,
    RouteMatch, RuleCompiler, RuleContext, TableSchema, combine, resolve_menu,
};
use storage::Department;
use tracing::{debug, instrument};

use crate::Result;
use crate::directory::Directory;
use crate::identity::{Caller, RoleScope};

/// The user id that bypasses every data rule unless configured otherwise.
pub const DEFAULT_SUPERUSER_ID: Id = 1;

/// Everything derived for one request, computed on first use.
///
/// A scope is created when a request is authenticated and dropped with
/// it. Nothing is shared between scopes, so rule or membership changes
/// take effect on the next request.
pub struct RequestScope<'d, D> {
    directory: &'d D,
    caller: Caller,
    route: Option<RouteMatch>,
    superuser_id: Id,
    now: DateTime<Utc>,

    roles: Option<RoleScope>,
    menu_ids: Option<BTreeSet<Id>>,
    current_menu: Option<Option<Id>>,
    department: Option<Option<Department>>,
    tree: Option<DeptTree>,
    data_filters: HashMap<String, Expr>,
    field_grants: Option<FieldGrants>,
}

impl<'d, D: Directory> RequestScope<'d, D> {
    pub fn new(directory: &'d D, caller: Caller) -> Self {
        Self {
            directory,
            caller,
            route: None,
            superuser_id: DEFAULT_SUPERUSER_ID,
            now: Utc::now(),
            roles: None,
            menu_ids: None,
            current_menu: None,
            department: None,
            tree: None,
            data_filters: HashMap::new(),
            field_grants: None,
        }
    }

    /// The route being served; without one no menu resolves.
    pub fn with_route(mut self, route: RouteMatch) -> Self {
        self.route = Some(route);
        self
    }

    pub fn with_superuser(mut self, superuser_id: Id) -> Self {
        self.superuser_id = superuser_id;
        self
    }

    /// Pins the reference time for relative date rules.
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn caller(&self) -> &Caller {
        &self.caller
    }

    pub fn is_superuser(&self) -> bool {
        self.caller.user_id == self.superuser_id
    }

    /// The caller's active department, if any.
    pub async fn department(&mut self) -> Result<Option<&Department>> {
        let department = match self.department.take() {
            Some(cached) => cached,
            None => match self.caller.department_id {
                Some(id) => self
                    .directory
                    .department(id)
                    .await?
                    .filter(|department| department.active),
                None => None,
            },
        };
        Ok(self.department.insert(department).as_ref())
    }

    /// The caller's roles plus those of their department.
    pub async fn roles(&mut self) -> Result<&RoleScope> {
        let roles = match self.roles.take() {
            Some(cached) => cached,
            None => {
                let mut scope = RoleScope::default();
                scope.extend(&self.caller.roles);
                if let Some(department_id) = self.department().await?.map(|d| d.id) {
                    let inherited = self.directory.department_roles(department_id).await?;
                    scope.extend(&inherited);
                }
                scope
            }
        };
        Ok(self.roles.insert(roles))
    }

    /// Ids of the menus the caller's roles grant.
    pub async fn menu_ids(&mut self) -> Result<&BTreeSet<Id>> {
        let ids = match self.menu_ids.take() {
            Some(cached) => cached,
            None => {
                let role_ids = self.roles().await?.ids.clone();
                self.directory.role_menu_ids(&role_ids).await?
            }
        };
        Ok(self.menu_ids.insert(ids))
    }

    /// The permission menu the current route resolves to.
    pub async fn current_menu(&mut self) -> Result<Option<Id>> {
        if let Some(resolved) = self.current_menu {
            return Ok(resolved);
        }
        let resolved = match self.route.clone() {
            Some(route) => {
                let menu_ids = self.menu_ids().await?.clone();
                let menus = self.directory.permission_menus(&menu_ids).await?;
                resolve_menu(&menus, &route)
            }
            None => None,
        };
        debug!(user_id = self.caller.user_id, menu_id = ?resolved, "current menu");
        self.current_menu = Some(resolved);
        Ok(resolved)
    }

    async fn tree(&mut self) -> Result<&DeptTree> {
        let tree = match self.tree.take() {
            Some(cached) => cached,
            None => DeptTree::new(self.directory.department_edges().await?),
        };
        Ok(self.tree.insert(tree))
    }

    /// Departments reachable from `root`, using this request's projection.
    pub async fn resolve_tree(&mut self, root: Id, direction: Direction) -> Result<BTreeSet<Id>> {
        Ok(self.tree().await?.resolve(root, direction))
    }

    /// The row filter for `schema`'s table.
    ///
    /// Computed once per table per request. The superuser is unrestricted;
    /// a caller with no applicable rule gets `Expr::False`.
    #[instrument(skip(self, schema), fields(table = %schema.name(), user_id = self.caller.user_id))]
    pub async fn resolve_data_filter(&mut self, schema: &TableSchema) -> Result<Expr> {
        if let Some(cached) = self.data_filters.get(schema.name()) {
            return Ok(cached.clone());
        }
        let filter = self.compile_data_filter(schema).await?;
        self.data_filters
            .insert(schema.name().to_string(), filter.clone());
        Ok(filter)
    }

    /// The data filter AND'ed with a request's own query filter.
    pub async fn effective_filter(&mut self, schema: &TableSchema, query: Expr) -> Result<Expr> {
        let data = self.resolve_data_filter(schema).await?;
        Ok(Expr::and([data, query]))
    }

    async fn compile_data_filter(&mut self, schema: &TableSchema) -> Result<Expr> {
        if self.is_superuser() {
            debug!("superuser, data filter bypassed");
            return Ok(Expr::True);
        }
        let menu = self.current_menu().await?;
        let department = self
            .department()
            .await?
            .map(|department| ActingDepartment {
                id: department.id,
                mode: department.mode,
            });
        let user = ActingUser {
            id: self.caller.user_id,
            department_id: self.caller.department_id,
        };
        let now = self.now;
        let directory = self.directory;

        // rules of the caller's department apply together with those of
        // every ancestor department
        let department_rules = match department {
            Some(acting) => {
                let lineage = self.tree().await?.resolve(acting.id, Direction::Ancestors);
                directory.department_rules(&lineage, menu).await?
            }
            None => Vec::new(),
        };
        let user_rules = directory.user_rules(user.id, menu).await?;
        debug!(
            menu_id = ?menu,
            department_rules = department_rules.len(),
            user_rules = user_rules.len(),
            "rules fetched"
        );

        let tree = self.tree().await?;
        let compiler = RuleCompiler::new(RuleContext {
            schema,
            user: Some(user),
            department,
            tree,
            now,
        });
        let from_department = department.and_then(|_| compiler.compile(&department_rules));
        let from_user = compiler.compile(&user_rules);
        Ok(combine(false, from_department, from_user))
    }

    /// The columns of `schema`'s table the caller may read and write.
    ///
    /// Without a resolved menu, or with no field permission configured for
    /// it, every column is allowed.
    #[instrument(skip(self, schema), fields(table = %schema.name(), user_id = self.caller.user_id))]
    pub async fn resolve_allowed_fields(&mut self, schema: &TableSchema) -> Result<FieldAccess> {
        if self.is_superuser() {
            return Ok(FieldAccess::Unrestricted);
        }
        let grants = match self.field_grants.take() {
            Some(cached) => cached,
            None => self.load_field_grants().await?,
        };
        Ok(self.field_grants.insert(grants).for_table(schema.name()))
    }

    async fn load_field_grants(&mut self) -> Result<FieldGrants> {
        let Some(menu) = self.current_menu().await? else {
            debug!("no menu resolved, fields unrestricted");
            return Ok(FieldGrants::unrestricted());
        };
        let role_ids = self.roles().await?.ids.clone();
        let grants = self.directory.field_permissions(menu, &role_ids).await?;
        Ok(FieldGrants::from_grants(grants))
    }
}
