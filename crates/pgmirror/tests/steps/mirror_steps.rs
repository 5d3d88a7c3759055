use std::sync::Arc;

use crate::MirrorWorld;
use cucumber::{given, then, when};
use pgmirror::{
    Completion, FieldType, NotificationDisposition, QueryOutcome, ReconcilePolicy, Row,
    TableDescriptor, TableManager, Value, WarningKind,
};

fn split_name(qualified: &str) -> (&str, &str) {
    qualified
        .split_once('.')
        .unwrap_or_else(|| panic!("expected schema.table, got {}", qualified))
}

fn row(id: &str, name: &str) -> Row {
    Row::new().with("_uuid", id).with("name", name)
}

fn rows(ids: &str) -> Vec<Row> {
    ids.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(|id| row(id, &format!("row {}", id)))
        .collect()
}

fn policy(name: &str) -> ReconcilePolicy {
    match name {
        "replay_newer" => ReconcilePolicy::ReplayNewer,
        "snapshot_wins" => ReconcilePolicy::SnapshotWins,
        other => panic!("unknown policy {}", other),
    }
}

async fn loaded_mirror(
    world: &mut MirrorWorld,
    qualified: &str,
    policy: ReconcilePolicy,
    snapshot: Vec<Row>,
) {
    let (schema, table) = split_name(qualified);
    let descriptor = TableDescriptor::new(schema, table).field("name", FieldType::String);
    let manager = Arc::new(
        TableManager::new(Arc::clone(&world.connector), descriptor).with_policy(policy),
    );

    let id = manager.load().await;
    manager
        .handle_completion(&Completion {
            id,
            outcome: Arc::new(QueryOutcome::rows(snapshot)),
        })
        .await;
    world.managers.insert(table.to_string(), manager);
}

#[given(regex = r#"^a mirror of "([^"]+)" loaded with rows "([^"]*)"$"#)]
async fn mirror_with_rows(world: &mut MirrorWorld, qualified: String, ids: String) {
    loaded_mirror(world, &qualified, ReconcilePolicy::default(), rows(&ids)).await;
}

#[given(regex = r#"^a "(replay_newer|snapshot_wins)" mirror of "([^"]+)" with row "([^"]+)" named "([^"]+)"$"#)]
async fn mirror_with_policy(
    world: &mut MirrorWorld,
    policy_name: String,
    qualified: String,
    id: String,
    name: String,
) {
    loaded_mirror(world, &qualified, policy(&policy_name), vec![row(&id, &name)]).await;
}

#[given(regex = r#"^a reload of "([^"]+)" is in flight that will return row "([^"]+)" named "([^"]+)"$"#)]
async fn reload_in_flight(world: &mut MirrorWorld, table: String, id: String, name: String) {
    let load = world.manager(&table).load().await;
    world.reload = Some((table, load, vec![row(&id, &name)]));
}

async fn deliver(world: &mut MirrorWorld, action: &str, qualified: &str, id: &str, name: &str) {
    let (schema, table) = split_name(qualified);
    let payload = serde_json::json!({
        "action": action,
        "schema": schema,
        "table": table,
        "data": if action == "DELETE" { serde_json::Value::Null } else { serde_json::json!({"_uuid": id, "name": name}) },
        "data_old": {"_uuid": id},
    });
    let change = world
        .router
        .parse(payload.to_string().as_bytes())
        .expect("well-formed notification");
    world.router.route(change.clone());

    world.dispositions.clear();
    for (table, manager) in &world.managers {
        let disposition = manager.apply_notification(&change).await;
        world.dispositions.push((table.clone(), disposition));
    }
}

async fn complete_reload(world: &mut MirrorWorld) {
    let (table, id, snapshot) = world.reload.take().expect("a reload is in flight");
    world
        .manager(&table)
        .handle_completion(&Completion {
            id,
            outcome: Arc::new(QueryOutcome::rows(snapshot)),
        })
        .await;
}

#[when(regex = r#"^a "(INSERT|UPDATE|DELETE)" notification for "([^"]+)" row "([^"]+)" arrives$"#)]
async fn notification(world: &mut MirrorWorld, action: String, qualified: String, id: String) {
    deliver(world, &action, &qualified, &id, "").await;
}

#[when(regex = r#"^a "(INSERT|UPDATE|DELETE)" notification for "([^"]+)" row "([^"]+)" named "([^"]+)" arrives$"#)]
async fn named_notification(
    world: &mut MirrorWorld,
    action: String,
    qualified: String,
    id: String,
    name: String,
) {
    deliver(world, &action, &qualified, &id, &name).await;
}

#[when(regex = r#"^row "([^"]+)" of "([^"]+)" is updated to "([^"]+)" and the reload completes, (update|reload) first$"#)]
async fn race(world: &mut MirrorWorld, id: String, table: String, name: String, first: String) {
    let qualified = {
        let manager = world.manager(&table);
        manager.descriptor().qualified_name()
    };
    if first == "update" {
        deliver(world, "UPDATE", &qualified, &id, &name).await;
        complete_reload(world).await;
    } else {
        complete_reload(world).await;
        deliver(world, "UPDATE", &qualified, &id, &name).await;
    }
}

#[when("the reload completes")]
async fn reload_completes(world: &mut MirrorWorld) {
    complete_reload(world).await;
}

#[then(regex = r#"^the "([^"]+)" mirror holds rows "([^"]*)"$"#)]
async fn holds_rows(world: &mut MirrorWorld, table: String, ids: String) {
    let expected: Vec<String> = ids
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(String::from)
        .collect();
    let actual: Vec<String> = world
        .manager(&table)
        .items()
        .await
        .iter()
        .map(|item| item.id().to_string())
        .collect();
    assert_eq!(actual, expected);
}

#[then(regex = r#"^row "([^"]+)" of "([^"]+)" is named "([^"]+)"$"#)]
async fn row_named(world: &mut MirrorWorld, id: String, table: String, name: String) {
    let item = world
        .manager(&table)
        .item(&id)
        .await
        .unwrap_or_else(|| panic!("row {} is not mirrored", id));
    assert_eq!(item.get("name"), Some(&Value::String(name)));
}

#[then(regex = r#"^the notification was "(ignored|inserted|replaced|updated|deleted|warned)" by "([^"]+)"$"#)]
async fn disposition(world: &mut MirrorWorld, expected: String, table: String) {
    let (_, actual) = world
        .dispositions
        .iter()
        .find(|(t, _)| *t == table)
        .unwrap_or_else(|| panic!("no disposition recorded for {}", table));
    let name = match actual {
        NotificationDisposition::Ignored => "ignored",
        NotificationDisposition::Inserted => "inserted",
        NotificationDisposition::Replaced => "replaced",
        NotificationDisposition::Updated => "updated",
        NotificationDisposition::Deleted => "deleted",
        NotificationDisposition::Warned(_) => "warned",
    };
    assert_eq!(name, expected);
}

#[then(regex = r#"^the "([^"]+)" mirror recorded an? "([^"]+)" warning for row "([^"]+)"$"#)]
async fn recorded_warning(world: &mut MirrorWorld, table: String, kind: String, id: String) {
    let warnings = world.manager(&table).warnings().await;
    let matching = warnings
        .iter()
        .filter(|w| w.row_id == id)
        .filter(|w| match (&w.kind, kind.as_str()) {
            (WarningKind::UpdateForUnknownRow, "update for unknown row") => true,
            (WarningKind::DeleteForUnknownRow, "delete for unknown row") => true,
            (WarningKind::UnparseableRow(_), "unparseable row") => true,
            _ => false,
        })
        .count();
    assert_eq!(matching, 1, "warnings: {:?}", warnings);
    assert_eq!(warnings.len(), 1, "warnings: {:?}", warnings);
}

#[then(regex = r#"^the "([^"]+)" mirror recorded no warnings$"#)]
async fn no_warnings(world: &mut MirrorWorld, table: String) {
    let warnings = world.manager(&table).warnings().await;
    assert!(warnings.is_empty(), "warnings: {:?}", warnings);
}
