use policy::{Expr, FieldAccess, Mode, RawSql, TableSchema, Value};
use runtime::{Caller, RequestScope, RouteMatch};
use serde_json::json;
use storage::{FieldKind, NewMenu, Page, Store};

fn orders() -> TableSchema {
    TableSchema::new("orders").with_columns([
        "id",
        "name",
        "total",
        "creator_id",
        "dept_belong_id",
    ])
}

fn route(path: &str, method: &str) -> RouteMatch {
    RouteMatch {
        path: path.into(),
        template: path.into(),
        method: method.into(),
        tags: vec![],
    }
}

fn rule(store: &Store, mode: Mode, clauses: serde_json::Value) -> i64 {
    store
        .create_rule_raw("rule", mode, &clauses.to_string())
        .unwrap()
}

/// Superuser takes id 1; every other user is created after it.
fn seeded() -> (Store, i64) {
    let store = Store::in_memory().unwrap();
    let admin = store.create_user("admin", None, Mode::Or).unwrap();
    (store, admin)
}

#[tokio::test]
async fn test_no_rules_matches_nothing() {
    let (store, _) = seeded();
    let user = store.create_user("u", None, Mode::Or).unwrap();
    let caller = Caller::load(&store, user).await.unwrap();
    let mut scope = RequestScope::new(&store, caller);
    assert_eq!(
        scope.resolve_data_filter(&orders()).await.unwrap(),
        Expr::False
    );
}

#[tokio::test]
async fn test_superuser_is_unrestricted() {
    let (store, admin) = seeded();
    let deny = rule(
        &store,
        Mode::And,
        json!([
            {"table": "orders", "field": "creator_id", "type": "owner"},
            {"table": "orders", "field": "dept_belong_id", "type": "owner_department"}
        ]),
    );
    store.assign_rule_to_user(deny, admin).unwrap();

    let caller = Caller::load(&store, admin).await.unwrap();
    let mut scope = RequestScope::new(&store, caller).with_superuser(admin);
    assert!(scope.is_superuser());
    assert_eq!(
        scope.resolve_data_filter(&orders()).await.unwrap(),
        Expr::True
    );
    assert_eq!(
        scope.resolve_allowed_fields(&orders()).await.unwrap(),
        FieldAccess::Unrestricted
    );
}

#[tokio::test]
async fn test_owner_department_rule_of_users_department() {
    let (store, _) = seeded();
    let dept = store.create_department("D", None, Mode::Or).unwrap();
    let user = store.create_user("u", Some(dept), Mode::Or).unwrap();
    let r1 = rule(
        &store,
        Mode::Or,
        json!([{"table": "orders", "field": "dept_belong_id", "type": "owner_department"}]),
    );
    store.assign_rule_to_department(r1, dept).unwrap();

    let caller = Caller::load(&store, user).await.unwrap();
    let mut scope = RequestScope::new(&store, caller);
    assert_eq!(
        scope.resolve_data_filter(&orders()).await.unwrap(),
        Expr::eq("dept_belong_id", dept)
    );
}

#[tokio::test]
async fn test_wildcard_all_rule_without_department() {
    let (store, _) = seeded();
    let user = store.create_user("u", None, Mode::Or).unwrap();
    let open = rule(&store, Mode::Or, json!([{"table": "*", "type": "all"}]));
    store.assign_rule_to_user(open, user).unwrap();

    let mut scope = RequestScope::new(&store, Caller::load(&store, user).await.unwrap());
    assert_eq!(
        scope.resolve_data_filter(&orders()).await.unwrap(),
        Expr::True
    );
}

#[tokio::test]
async fn test_all_clause_in_or_rule_wins_over_siblings() {
    let (store, _) = seeded();
    let user = store.create_user("u", None, Mode::Or).unwrap();
    let open = rule(
        &store,
        Mode::Or,
        json!([
            {"table": "orders", "field": "creator_id", "type": "owner"},
            {"table": "orders", "type": "all"}
        ]),
    );
    store.assign_rule_to_user(open, user).unwrap();

    let mut scope = RequestScope::new(&store, Caller::load(&store, user).await.unwrap());
    assert_eq!(
        scope.resolve_data_filter(&orders()).await.unwrap(),
        Expr::True
    );
}

#[tokio::test]
async fn test_all_clause_in_and_rule_is_ignored() {
    let (store, _) = seeded();
    let with_all = store.create_user("with_all", None, Mode::Or).unwrap();
    let without_all = store.create_user("without_all", None, Mode::Or).unwrap();
    let r1 = rule(
        &store,
        Mode::And,
        json!([
            {"table": "orders", "field": "name", "type": "text", "value": "x"},
            {"table": "orders", "type": "all"}
        ]),
    );
    let r2 = rule(
        &store,
        Mode::And,
        json!([{"table": "orders", "field": "name", "type": "text", "value": "x"}]),
    );
    store.assign_rule_to_user(r1, with_all).unwrap();
    store.assign_rule_to_user(r2, without_all).unwrap();

    let mut a = RequestScope::new(&store, Caller::load(&store, with_all).await.unwrap());
    let mut b = RequestScope::new(&store, Caller::load(&store, without_all).await.unwrap());
    let fa = a.resolve_data_filter(&orders()).await.unwrap();
    let fb = b.resolve_data_filter(&orders()).await.unwrap();
    assert_eq!(fa, fb);
    assert_eq!(fa, Expr::eq("name", "x"));
}

#[tokio::test]
async fn test_compilation_is_deterministic() {
    let (store, _) = seeded();
    let dept = store.create_department("D", None, Mode::And).unwrap();
    let user = store.create_user("u", Some(dept), Mode::Or).unwrap();
    let r1 = rule(
        &store,
        Mode::Or,
        json!([
            {"table": "orders", "field": "creator_id", "type": "owner"},
            {"table": "orders", "field": "dept_belong_id", "type": "owner_departments"}
        ]),
    );
    let r2 = rule(
        &store,
        Mode::Or,
        json!([{"table": "orders", "field": "total", "type": "text", "match": "gte", "value": 10}]),
    );
    store.assign_rule_to_department(r1, dept).unwrap();
    store.assign_rule_to_user(r2, user).unwrap();

    let caller = Caller::load(&store, user).await.unwrap();
    let mut first = RequestScope::new(&store, caller.clone());
    let mut second = RequestScope::new(&store, caller);
    assert_eq!(
        first.resolve_data_filter(&orders()).await.unwrap(),
        second.resolve_data_filter(&orders()).await.unwrap()
    );
}

#[tokio::test]
async fn test_ancestor_department_rules_apply() {
    let (store, _) = seeded();
    let parent = store.create_department("P", None, Mode::Or).unwrap();
    let child = store.create_department("C", Some(parent), Mode::Or).unwrap();
    let grandchild = store
        .create_department("G", Some(child), Mode::Or)
        .unwrap();
    let user = store.create_user("u", Some(child), Mode::Or).unwrap();
    let r = rule(
        &store,
        Mode::Or,
        json!([{"table": "orders", "field": "dept_belong_id", "type": "owner_departments"}]),
    );
    store.assign_rule_to_department(r, parent).unwrap();

    let mut scope = RequestScope::new(&store, Caller::load(&store, user).await.unwrap());
    assert_eq!(
        scope.resolve_data_filter(&orders()).await.unwrap(),
        Expr::in_list(
            "dept_belong_id",
            vec![Value::Int(child), Value::Int(grandchild)]
        )
    );
}

#[tokio::test]
async fn test_menu_bound_rule_applies_only_on_its_route() {
    let (store, _) = seeded();
    let user = store.create_user("u", None, Mode::Or).unwrap();
    let role = store.create_role("clerk", "Clerk").unwrap();
    store.assign_user_role(user, role).unwrap();
    let list = store
        .create_menu(NewMenu::permission("list orders", "GET", "/api/orders"))
        .unwrap();
    let export = store
        .create_menu(NewMenu::permission("export orders", "GET", "/api/orders/export"))
        .unwrap();
    store.grant_menu(role, list).unwrap();
    store.grant_menu(role, export).unwrap();

    let everywhere = rule(
        &store,
        Mode::Or,
        json!([{"table": "orders", "field": "creator_id", "type": "owner"}]),
    );
    let on_export = rule(&store, Mode::Or, json!([{"table": "orders", "type": "all"}]));
    store.assign_rule_to_user(everywhere, user).unwrap();
    store.assign_rule_to_user(on_export, user).unwrap();
    store.bind_rule_to_menu(on_export, export).unwrap();

    let caller = Caller::load(&store, user).await.unwrap();
    let mut listing =
        RequestScope::new(&store, caller.clone()).with_route(route("/api/orders", "GET"));
    assert_eq!(
        listing.resolve_data_filter(&orders()).await.unwrap(),
        Expr::eq("creator_id", user)
    );

    let mut exporting =
        RequestScope::new(&store, caller).with_route(route("/api/orders/export", "GET"));
    assert_eq!(exporting.current_menu().await.unwrap(), Some(export));
    assert_eq!(
        exporting.resolve_data_filter(&orders()).await.unwrap(),
        Expr::True
    );
}

#[tokio::test]
async fn test_field_permission_restricts_columns() {
    let (store, _) = seeded();
    let user = store.create_user("u", None, Mode::Or).unwrap();
    let role = store.create_role("viewer", "Viewer").unwrap();
    store.assign_user_role(user, role).unwrap();
    let restricted = store
        .create_menu(NewMenu::permission("orders", "GET", "/api/orders"))
        .unwrap();
    let open = store
        .create_menu(NewMenu::permission("order detail", "GET", "/api/orders/1"))
        .unwrap();
    store.grant_menu(role, restricted).unwrap();
    store.grant_menu(role, open).unwrap();

    let table = store
        .create_model_field(None, "orders", Some("Orders"), FieldKind::Table)
        .unwrap();
    let id = store
        .create_model_field(Some(table), "id", None, FieldKind::Column)
        .unwrap();
    let name = store
        .create_model_field(Some(table), "name", Some("Name"), FieldKind::Column)
        .unwrap();
    store
        .set_field_permission(role, restricted, &[id, name])
        .unwrap();

    let caller = Caller::load(&store, user).await.unwrap();
    let mut scope =
        RequestScope::new(&store, caller.clone()).with_route(route("/api/orders", "GET"));
    let access = scope.resolve_allowed_fields(&orders()).await.unwrap();
    assert_eq!(access.visible_columns(&orders()), vec!["id", "name"]);

    let write = access.accept_write(
        json!({"name": "n", "total": 5})
            .as_object()
            .cloned()
            .unwrap_or_default(),
    );
    assert_eq!(write.rejected, vec!["total".to_string()]);
    assert!(write.accepted.contains_key("name"));

    let mut other = RequestScope::new(&store, caller).with_route(route("/api/orders/1", "GET"));
    assert_eq!(
        other.resolve_allowed_fields(&orders()).await.unwrap(),
        FieldAccess::Unrestricted
    );
}

#[tokio::test]
async fn test_empty_field_permission_allows_nothing() {
    let (store, _) = seeded();
    let user = store.create_user("u", None, Mode::Or).unwrap();
    let role = store.create_role("none", "None").unwrap();
    store.assign_user_role(user, role).unwrap();
    let menu = store
        .create_menu(NewMenu::permission("orders", "GET", "/api/orders"))
        .unwrap();
    store.grant_menu(role, menu).unwrap();
    store.set_field_permission(role, menu, &[]).unwrap();

    let caller = Caller::load(&store, user).await.unwrap();
    let mut scope = RequestScope::new(&store, caller).with_route(route("/api/orders", "GET"));
    let access = scope.resolve_allowed_fields(&orders()).await.unwrap();
    assert!(access.visible_columns(&orders()).is_empty());
}

#[test]
fn test_raw_sql_with_statement_chaining_is_rejected() {
    let err = RawSql::from_json(&json!({"sql": "1=1; DROP TABLE users;--"})).unwrap_err();
    assert!(matches!(err, policy::Error::InjectionDetected(_)));
}

#[tokio::test]
async fn test_filtered_rows_end_to_end() {
    let (store, _) = seeded();
    let dept = store.create_department("D", None, Mode::Or).unwrap();
    let user = store.create_user("u", Some(dept), Mode::Or).unwrap();
    let r = rule(
        &store,
        Mode::Or,
        json!([{"table": "orders", "field": "creator_id", "type": "owner"}]),
    );
    store.assign_rule_to_user(r, user).unwrap();

    store
        .execute_batch(&format!(
            "CREATE TABLE orders (id INTEGER PRIMARY KEY, name TEXT, total INTEGER,
                                  creator_id INTEGER, dept_belong_id INTEGER);
             INSERT INTO orders (name, total, creator_id, dept_belong_id) VALUES
                ('a', 10, {user}, {dept}), ('b', 200, {user}, {dept}),
                ('c', 300, 999, {dept}), ('d', 400, {user}, {dept});"
        ))
        .unwrap();

    let mut scope = RequestScope::new(&store, Caller::load(&store, user).await.unwrap());
    let query = runtime::compile_filter(&orders(), &json!({"total__gte": 100})).unwrap();
    let filter = scope.effective_filter(&orders(), query).await.unwrap();
    let access = scope.resolve_allowed_fields(&orders()).await.unwrap();
    let rows = store
        .select_rows(&orders(), &filter, &access, Page::default())
        .unwrap();
    let names: Vec<&str> = rows.iter().filter_map(|r| r["name"].as_str()).collect();
    assert_eq!(names, vec!["b", "d"]);
}
