//! SQLite store for the permission directory.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use policy::{
    DataPermissionRule, DeptEdge, FieldPermissionGrant, GrantedField, Id, Menu, MenuType, Mode,
    RuleClause, split_auths,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde_rusqlite::from_rows;

use crate::model::{
    Department, FieldKind, NewMenu, Role, User, menu_type_name, parse_menu_type,
};
use crate::sql::register_functions;
use crate::{Error, Result};

/// SQLite-backed directory of departments, users, roles, menus, rules and
/// field permissions.
///
/// The connection sits behind a mutex so one store can serve concurrent
/// requests; every method runs a short statement and releases it.
#[derive(Debug)]
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Create an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        register_functions(&conn)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// A panic while holding the connection leaves the store unusable.
    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::LockPoisoned)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS departments (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                parent_id INTEGER REFERENCES departments(id),
                mode TEXT NOT NULL DEFAULT 'or',
                is_active INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                dept_id INTEGER REFERENCES departments(id),
                mode TEXT NOT NULL DEFAULT 'or',
                is_active INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS roles (
                id INTEGER PRIMARY KEY,
                code TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS user_roles (
                user_id INTEGER NOT NULL,
                role_id INTEGER NOT NULL,
                PRIMARY KEY (user_id, role_id)
            );
            CREATE TABLE IF NOT EXISTS department_roles (
                department_id INTEGER NOT NULL,
                role_id INTEGER NOT NULL,
                PRIMARY KEY (department_id, role_id)
            );
            CREATE TABLE IF NOT EXISTS menus (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                menu_type TEXT NOT NULL,
                path TEXT,
                method TEXT,
                auths TEXT NOT NULL DEFAULT '',
                is_active INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS role_menus (
                role_id INTEGER NOT NULL,
                menu_id INTEGER NOT NULL,
                PRIMARY KEY (role_id, menu_id)
            );
            CREATE TABLE IF NOT EXISTS data_permissions (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                mode TEXT NOT NULL DEFAULT 'or',
                clauses TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS department_data_permissions (
                department_id INTEGER NOT NULL,
                rule_id INTEGER NOT NULL,
                PRIMARY KEY (department_id, rule_id)
            );
            CREATE TABLE IF NOT EXISTS user_data_permissions (
                user_id INTEGER NOT NULL,
                rule_id INTEGER NOT NULL,
                PRIMARY KEY (user_id, rule_id)
            );
            CREATE TABLE IF NOT EXISTS menu_data_permissions (
                menu_id INTEGER NOT NULL,
                rule_id INTEGER NOT NULL,
                PRIMARY KEY (menu_id, rule_id)
            );
            CREATE TABLE IF NOT EXISTS model_fields (
                id INTEGER PRIMARY KEY,
                parent_id INTEGER REFERENCES model_fields(id),
                name TEXT NOT NULL,
                label TEXT,
                kind TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS field_permissions (
                id INTEGER PRIMARY KEY,
                role_id INTEGER NOT NULL,
                menu_id INTEGER NOT NULL,
                UNIQUE (role_id, menu_id)
            );
            CREATE TABLE IF NOT EXISTS field_permission_fields (
                permission_id INTEGER NOT NULL,
                field_id INTEGER NOT NULL,
                PRIMARY KEY (permission_id, field_id)
            );
            CREATE INDEX IF NOT EXISTS idx_departments_parent ON departments(parent_id);
            CREATE INDEX IF NOT EXISTS idx_field_permissions_menu
                ON field_permissions(menu_id, role_id);
            "#,
        )?;
        Ok(())
    }

    /// Run a batch of statements, e.g. to create application tables.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn()?.execute_batch(sql)?;
        Ok(())
    }

    // --- departments -----------------------------------------------------

    pub fn create_department(&self, name: &str, parent_id: Option<Id>, mode: Mode) -> Result<Id> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO departments (name, parent_id, mode) VALUES (?1, ?2, ?3)",
            params![name, parent_id, mode.as_str()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn set_department_active(&self, id: Id, active: bool) -> Result<()> {
        let changed = self.conn()?.execute(
            "UPDATE departments SET is_active = ?2 WHERE id = ?1",
            params![id, active],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("department {id}")));
        }
        Ok(())
    }

    /// `(id, parent_id)` of every active department.
    pub fn department_edges(&self) -> Result<Vec<DeptEdge>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, parent_id FROM departments WHERE is_active = 1 ORDER BY id",
        )?;
        let edges = from_rows::<DeptEdge>(stmt.query([])?).collect::<std::result::Result<_, _>>()?;
        Ok(edges)
    }

    pub fn department(&self, id: Id) -> Result<Option<Department>> {
        let row = self
            .conn()?
            .query_row(
                "SELECT id, name, parent_id, mode, is_active FROM departments WHERE id = ?1",
                [id],
                |row| {
                    Ok((
                        row.get::<_, Id>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<Id>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, bool>(4)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(id, name, parent_id, mode, active)| -> Result<Department> {
            Ok(Department {
                id,
                name,
                parent_id,
                mode: mode.parse()?,
                active,
            })
        })
        .transpose()
    }

    // --- users and roles ---------------------------------------------------

    pub fn create_user(&self, username: &str, dept_id: Option<Id>, mode: Mode) -> Result<Id> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (username, dept_id, mode) VALUES (?1, ?2, ?3)",
            params![username, dept_id, mode.as_str()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn user(&self, id: Id) -> Result<Option<User>> {
        let row = self
            .conn()?
            .query_row(
                "SELECT id, username, dept_id, mode, is_active FROM users WHERE id = ?1",
                [id],
                |row| {
                    Ok((
                        row.get::<_, Id>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<Id>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, bool>(4)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(id, username, dept_id, mode, active)| -> Result<User> {
            Ok(User {
                id,
                username,
                dept_id,
                mode: mode.parse()?,
                active,
            })
        })
        .transpose()
    }

    pub fn create_role(&self, code: &str, name: &str) -> Result<Id> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO roles (code, name) VALUES (?1, ?2)",
            params![code, name],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn assign_user_role(&self, user_id: Id, role_id: Id) -> Result<()> {
        self.conn()?.execute(
            "INSERT OR IGNORE INTO user_roles (user_id, role_id) VALUES (?1, ?2)",
            params![user_id, role_id],
        )?;
        Ok(())
    }

    pub fn assign_department_role(&self, department_id: Id, role_id: Id) -> Result<()> {
        self.conn()?.execute(
            "INSERT OR IGNORE INTO department_roles (department_id, role_id) VALUES (?1, ?2)",
            params![department_id, role_id],
        )?;
        Ok(())
    }

    pub fn user_roles(&self, user_id: Id) -> Result<Vec<Role>> {
        self.roles_via(
            "SELECT r.id, r.code, r.name FROM roles r
             JOIN user_roles ur ON ur.role_id = r.id
             WHERE ur.user_id = ?1 ORDER BY r.id",
            user_id,
        )
    }

    pub fn department_roles(&self, department_id: Id) -> Result<Vec<Role>> {
        self.roles_via(
            "SELECT r.id, r.code, r.name FROM roles r
             JOIN department_roles dr ON dr.role_id = r.id
             WHERE dr.department_id = ?1 ORDER BY r.id",
            department_id,
        )
    }

    fn roles_via(&self, sql: &str, owner: Id) -> Result<Vec<Role>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let roles = from_rows::<Role>(stmt.query([owner])?).collect::<std::result::Result<_, _>>()?;
        Ok(roles)
    }

    // --- menus -------------------------------------------------------------

    pub fn create_menu(&self, menu: NewMenu<'_>) -> Result<Id> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO menus (name, menu_type, path, method, auths) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                menu.name,
                menu_type_name(menu.menu_type),
                menu.path,
                menu.method,
                menu.auths.join(","),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn grant_menu(&self, role_id: Id, menu_id: Id) -> Result<()> {
        self.conn()?.execute(
            "INSERT OR IGNORE INTO role_menus (role_id, menu_id) VALUES (?1, ?2)",
            params![role_id, menu_id],
        )?;
        Ok(())
    }

    /// Menus granted to any of `role_ids`.
    pub fn role_menu_ids(&self, role_ids: &BTreeSet<Id>) -> Result<BTreeSet<Id>> {
        if role_ids.is_empty() {
            return Ok(BTreeSet::new());
        }
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT menu_id FROM role_menus WHERE role_id IN ({})",
            placeholders(role_ids.len())
        ))?;
        let ids = stmt
            .query_map(params_from_iter(role_ids.iter()), |row| row.get::<_, Id>(0))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(ids)
    }

    /// Active PERMISSION menus among `menu_ids`, ordered by id. A granted
    /// menu whose stored type is unknown fails the lookup.
    pub fn permission_menus(&self, menu_ids: &BTreeSet<Id>) -> Result<Vec<Menu>> {
        if menu_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, name, menu_type, path, method, auths, is_active FROM menus
             WHERE is_active = 1 AND id IN ({})
             ORDER BY id",
            placeholders(menu_ids.len())
        ))?;
        let rows = stmt
            .query_map(params_from_iter(menu_ids.iter()), |row| {
                Ok((
                    row.get::<_, Id>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, bool>(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut menus = Vec::new();
        for (id, name, menu_type, path, method, auths, active) in rows {
            let menu_type = parse_menu_type(&menu_type).ok_or_else(|| {
                Error::InvalidData(format!("menu {id} has unknown type '{menu_type}'"))
            })?;
            if menu_type != MenuType::Permission {
                continue;
            }
            menus.push(Menu {
                id,
                name,
                menu_type,
                path,
                method,
                auths: split_auths(&auths),
                active,
            });
        }
        Ok(menus)
    }

    // --- data permission rules ---------------------------------------------

    pub fn create_rule(&self, name: &str, mode: Mode, clauses: &[RuleClause]) -> Result<Id> {
        let encoded = RuleClause::encode_all(clauses)?;
        self.create_rule_raw(name, mode, &encoded)
    }

    /// Stores a rule whose clauses are given in their JSON form. The clauses
    /// are decoded first so malformed rules never reach the table.
    pub fn create_rule_raw(&self, name: &str, mode: Mode, clauses_json: &str) -> Result<Id> {
        RuleClause::decode_all(clauses_json)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO data_permissions (name, mode, clauses) VALUES (?1, ?2, ?3)",
            params![name, mode.as_str(), clauses_json],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn set_rule_active(&self, rule_id: Id, active: bool) -> Result<()> {
        let changed = self.conn()?.execute(
            "UPDATE data_permissions SET is_active = ?2 WHERE id = ?1",
            params![rule_id, active],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("rule {rule_id}")));
        }
        Ok(())
    }

    pub fn assign_rule_to_department(&self, rule_id: Id, department_id: Id) -> Result<()> {
        self.link(
            "INSERT OR IGNORE INTO department_data_permissions (rule_id, department_id) VALUES (?1, ?2)",
            rule_id,
            department_id,
        )
    }

    pub fn assign_rule_to_user(&self, rule_id: Id, user_id: Id) -> Result<()> {
        self.link(
            "INSERT OR IGNORE INTO user_data_permissions (rule_id, user_id) VALUES (?1, ?2)",
            rule_id,
            user_id,
        )
    }

    /// Scopes a rule to a menu. A rule with no menu applies everywhere.
    pub fn bind_rule_to_menu(&self, rule_id: Id, menu_id: Id) -> Result<()> {
        self.link(
            "INSERT OR IGNORE INTO menu_data_permissions (rule_id, menu_id) VALUES (?1, ?2)",
            rule_id,
            menu_id,
        )
    }

    fn link(&self, sql: &str, a: Id, b: Id) -> Result<()> {
        self.conn()?.execute(sql, params![a, b])?;
        Ok(())
    }

    pub fn rule(&self, id: Id) -> Result<Option<DataPermissionRule>> {
        let rules = self.query_rules(
            "SELECT id, name, mode, clauses, is_active FROM data_permissions WHERE id = ?",
            vec![SqlValue::Integer(id)],
        )?;
        Ok(rules.into_iter().next())
    }

    /// Active rules assigned to any of `department_ids` that are unbound or
    /// bound to `menu_id`.
    pub fn department_rules(
        &self,
        department_ids: &BTreeSet<Id>,
        menu_id: Option<Id>,
    ) -> Result<Vec<DataPermissionRule>> {
        if department_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT DISTINCT r.id, r.name, r.mode, r.clauses, r.is_active
             FROM data_permissions r
             JOIN department_data_permissions d ON d.rule_id = r.id
             WHERE r.is_active = 1 AND d.department_id IN ({}) AND {MENU_SCOPE}
             ORDER BY r.id",
            placeholders(department_ids.len())
        );
        let mut args: Vec<SqlValue> = department_ids.iter().map(|id| SqlValue::Integer(*id)).collect();
        args.push(menu_id.map_or(SqlValue::Null, SqlValue::Integer));
        self.query_rules(&sql, args)
    }

    /// Active rules assigned directly to the user, scoped like
    /// [`Store::department_rules`].
    pub fn user_rules(&self, user_id: Id, menu_id: Option<Id>) -> Result<Vec<DataPermissionRule>> {
        let sql = format!(
            "SELECT r.id, r.name, r.mode, r.clauses, r.is_active
             FROM data_permissions r
             JOIN user_data_permissions u ON u.rule_id = r.id
             WHERE r.is_active = 1 AND u.user_id = ? AND {MENU_SCOPE}
             ORDER BY r.id"
        );
        self.query_rules(
            &sql,
            vec![
                SqlValue::Integer(user_id),
                menu_id.map_or(SqlValue::Null, SqlValue::Integer),
            ],
        )
    }

    fn query_rules(&self, sql: &str, args: Vec<SqlValue>) -> Result<Vec<DataPermissionRule>> {
        let rows = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(sql)?;
            stmt.query_map(params_from_iter(args), |row| {
                Ok((
                    row.get::<_, Id>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, bool>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
        };
        rows.into_iter()
            .map(|(id, name, mode, clauses, active)| -> Result<DataPermissionRule> {
                Ok(DataPermissionRule {
                    id,
                    name,
                    mode: mode.parse()?,
                    clauses: RuleClause::decode_all(&clauses)?,
                    active,
                })
            })
            .collect()
    }

    // --- field permissions ---------------------------------------------------

    /// Adds a table node (`parent_id = None`) or a column under a table.
    pub fn create_model_field(
        &self,
        parent_id: Option<Id>,
        name: &str,
        label: Option<&str>,
        kind: FieldKind,
    ) -> Result<Id> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO model_fields (parent_id, name, label, kind) VALUES (?1, ?2, ?3, ?4)",
            params![parent_id, name, label, kind.as_str()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Grants `field_ids` to `role_id` under `menu_id`, replacing any
    /// previous grant for the pair.
    pub fn set_field_permission(&self, role_id: Id, menu_id: Id, field_ids: &[Id]) -> Result<Id> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO field_permissions (role_id, menu_id) VALUES (?1, ?2)
             ON CONFLICT (role_id, menu_id) DO NOTHING",
            params![role_id, menu_id],
        )?;
        let permission_id: Id = tx.query_row(
            "SELECT id FROM field_permissions WHERE role_id = ?1 AND menu_id = ?2",
            params![role_id, menu_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "DELETE FROM field_permission_fields WHERE permission_id = ?1",
            [permission_id],
        )?;
        for field_id in field_ids {
            tx.execute(
                "INSERT OR IGNORE INTO field_permission_fields (permission_id, field_id) VALUES (?1, ?2)",
                params![permission_id, field_id],
            )?;
        }
        tx.commit()?;
        Ok(permission_id)
    }

    /// Field grants configured for `menu_id` and any of `role_ids`.
    ///
    /// A column without a table node is reported under the `"*"` table.
    pub fn field_permissions(
        &self,
        menu_id: Id,
        role_ids: &BTreeSet<Id>,
    ) -> Result<Vec<FieldPermissionGrant>> {
        if role_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let mut args: Vec<SqlValue> = vec![SqlValue::Integer(menu_id)];
        args.extend(role_ids.iter().map(|id| SqlValue::Integer(*id)));
        let mut stmt = conn.prepare(&format!(
            "SELECT id, role_id, menu_id FROM field_permissions
             WHERE menu_id = ? AND role_id IN ({}) ORDER BY id",
            placeholders(role_ids.len())
        ))?;
        let permissions = stmt
            .query_map(params_from_iter(args), |row| {
                Ok((
                    row.get::<_, Id>(0)?,
                    row.get::<_, Id>(1)?,
                    row.get::<_, Id>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut fields_stmt = conn.prepare(
            r#"SELECT f.id AS id, COALESCE(t.name, '*') AS "table", f.name AS name, f.label AS label
               FROM field_permission_fields pf
               JOIN model_fields f ON f.id = pf.field_id
               LEFT JOIN model_fields t ON t.id = f.parent_id
               WHERE pf.permission_id = ?1 AND f.kind = 'column'
               ORDER BY f.id"#,
        )?;
        let mut grants = Vec::with_capacity(permissions.len());
        for (permission_id, role_id, menu_id) in permissions {
            let fields = from_rows::<GrantedField>(fields_stmt.query([permission_id])?)
                .collect::<std::result::Result<Vec<_>, _>>()?;
            grants.push(FieldPermissionGrant {
                role_id,
                menu_id,
                fields,
            });
        }
        Ok(grants)
    }
}

/// Rule menu scoping; binds one parameter, the current menu id or NULL.
const MENU_SCOPE: &str = "(NOT EXISTS (SELECT 1 FROM menu_data_permissions m WHERE m.rule_id = r.id)
      OR EXISTS (SELECT 1 FROM menu_data_permissions m WHERE m.rule_id = r.id AND m.menu_id = ?))";

pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn owner_rule() -> String {
        json!([{"table": "orders", "field": "creator_id", "type": "owner"}]).to_string()
    }

    #[test]
    fn test_department_edges_skip_inactive() {
        let store = Store::in_memory().unwrap();
        let a = store.create_department("A", None, Mode::Or).unwrap();
        let b = store.create_department("B", Some(a), Mode::And).unwrap();
        let c = store.create_department("C", Some(b), Mode::Or).unwrap();
        store.set_department_active(c, false).unwrap();

        let edges = store.department_edges().unwrap();
        assert_eq!(
            edges,
            vec![
                DeptEdge { id: a, parent_id: None },
                DeptEdge { id: b, parent_id: Some(a) },
            ]
        );
        let dept = store.department(b).unwrap().unwrap();
        assert_eq!(dept.mode, Mode::And);
        assert!(store.department(999).unwrap().is_none());
    }

    #[test]
    fn test_roles_and_menus() {
        let store = Store::in_memory().unwrap();
        let dept = store.create_department("Sales", None, Mode::Or).unwrap();
        let user = store.create_user("alice", Some(dept), Mode::Or).unwrap();
        let admin = store.create_role("admin", "Admin").unwrap();
        let viewer = store.create_role("viewer", "Viewer").unwrap();
        store.assign_user_role(user, admin).unwrap();
        store.assign_department_role(dept, viewer).unwrap();

        let list = store
            .create_menu(NewMenu::permission("orders list", "GET", "/api/orders").with_auths(&["orders:list"]))
            .unwrap();
        let folder = store
            .create_menu(NewMenu {
                name: "orders",
                menu_type: MenuType::Directory,
                path: None,
                method: None,
                auths: &[],
            })
            .unwrap();
        store.grant_menu(admin, list).unwrap();
        store.grant_menu(viewer, folder).unwrap();

        assert_eq!(store.user_roles(user).unwrap()[0].code, "admin");
        assert_eq!(store.department_roles(dept).unwrap()[0].code, "viewer");

        let menu_ids = store.role_menu_ids(&BTreeSet::from([admin, viewer])).unwrap();
        assert_eq!(menu_ids, BTreeSet::from([list, folder]));
        let menus = store.permission_menus(&menu_ids).unwrap();
        assert_eq!(menus.len(), 1);
        assert_eq!(menus[0].auths, vec!["orders:list".to_string()]);
    }

    #[test]
    fn test_rules_scoped_by_menu() {
        let store = Store::in_memory().unwrap();
        let dept = store.create_department("D", None, Mode::Or).unwrap();
        let menu = store
            .create_menu(NewMenu::permission("orders", "GET", "/api/orders"))
            .unwrap();
        let open = store.create_rule_raw("everywhere", Mode::Or, &owner_rule()).unwrap();
        let scoped = store.create_rule_raw("orders only", Mode::Or, &owner_rule()).unwrap();
        store.assign_rule_to_department(open, dept).unwrap();
        store.assign_rule_to_department(scoped, dept).unwrap();
        store.bind_rule_to_menu(scoped, menu).unwrap();

        let depts = BTreeSet::from([dept]);
        let ids = |rules: Vec<DataPermissionRule>| rules.iter().map(|r| r.id).collect::<Vec<_>>();
        assert_eq!(ids(store.department_rules(&depts, None).unwrap()), vec![open]);
        assert_eq!(
            ids(store.department_rules(&depts, Some(menu)).unwrap()),
            vec![open, scoped]
        );
        assert_eq!(ids(store.department_rules(&depts, Some(menu + 1)).unwrap()), vec![open]);
    }

    #[test]
    fn test_inactive_rules_not_returned() {
        let store = Store::in_memory().unwrap();
        let user = store.create_user("bob", None, Mode::Or).unwrap();
        let rule = store.create_rule_raw("mine", Mode::Or, &owner_rule()).unwrap();
        store.assign_rule_to_user(rule, user).unwrap();
        assert_eq!(store.user_rules(user, None).unwrap().len(), 1);
        store.set_rule_active(rule, false).unwrap();
        assert!(store.user_rules(user, None).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_rule_rejected() {
        let store = Store::in_memory().unwrap();
        let err = store
            .create_rule_raw("bad", Mode::Or, r#"[{"field": "x", "type": "nope"}]"#)
            .unwrap_err();
        assert!(matches!(err, Error::Policy(_)));
    }

    #[test]
    fn test_rule_round_trips_through_store() {
        let store = Store::in_memory().unwrap();
        let clauses = RuleClause::decode_all(&owner_rule()).unwrap();
        let id = store.create_rule("mine", Mode::And, &clauses).unwrap();
        let rule = store.rule(id).unwrap().unwrap();
        assert_eq!(rule.mode, Mode::And);
        assert_eq!(rule.clauses, clauses);
    }

    #[test]
    fn test_field_permissions() {
        let store = Store::in_memory().unwrap();
        let role = store.create_role("clerk", "Clerk").unwrap();
        let other = store.create_role("other", "Other").unwrap();
        let menu = store
            .create_menu(NewMenu::permission("orders", "GET", "/api/orders"))
            .unwrap();
        let orders = store
            .create_model_field(None, "orders", Some("Orders"), FieldKind::Table)
            .unwrap();
        let x = store
            .create_model_field(Some(orders), "x", Some("X"), FieldKind::Column)
            .unwrap();
        let y = store
            .create_model_field(Some(orders), "y", None, FieldKind::Column)
            .unwrap();
        store.set_field_permission(role, menu, &[x, y]).unwrap();
        store.set_field_permission(role, menu, &[x]).unwrap();

        let grants = store
            .field_permissions(menu, &BTreeSet::from([role, other]))
            .unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(
            grants[0].fields,
            vec![GrantedField {
                id: x,
                table: "orders".into(),
                name: "x".into(),
                label: Some("X".into()),
            }]
        );
        assert!(store.field_permissions(menu, &BTreeSet::from([other])).unwrap().is_empty());
    }

    #[test]
    fn test_poisoned_connection_is_an_error() {
        let store = Store::in_memory().unwrap();
        let user = store.create_user("alice", None, Mode::Or).unwrap();
        std::thread::scope(|s| {
            let holder = s.spawn(|| {
                let _guard = store.conn().unwrap();
                panic!("connection holder failed");
            });
            assert!(holder.join().is_err());
        });
        assert!(matches!(store.user(user), Err(Error::LockPoisoned)));
    }

    #[test]
    fn test_unknown_menu_type_is_invalid_data() {
        let store = Store::in_memory().unwrap();
        let role = store.create_role("r", "R").unwrap();
        store
            .execute_batch("INSERT INTO menus (id, name, menu_type) VALUES (40, 'legacy', 'button');")
            .unwrap();
        store.grant_menu(role, 40).unwrap();
        let err = store.permission_menus(&BTreeSet::from([40])).unwrap_err();
        assert!(matches!(err, Error::InvalidData(_)));
    }
}
