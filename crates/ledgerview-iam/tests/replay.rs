//! IAM events replayed through real handlers into a projection database.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use ledgerview_core::config::{HandlerConfig, ProjectorConfig};
use ledgerview_core::db::{open_in_memory, open_projection, DEFAULT_BUSY_TIMEOUT};
use ledgerview_core::event::{Aggregate, BaseEvent, StoredEvent};
use ledgerview_core::eventstore::{Command, EventStore, MemoryEventStore, SqliteEventStore};
use ledgerview_core::handler::checkpoint;
use ledgerview_core::{Handler, Shutdown};
use ledgerview_iam::auth_request::AUTH_REQUEST_TABLE;
use ledgerview_iam::idp_template::IDP_TEMPLATE_TABLE;
use ledgerview_iam::label_policy::LABEL_POLICY_TABLE;
use ledgerview_iam::org_member::ORG_MEMBER_TABLE;
use ledgerview_iam::{AuthRequestProjection, LabelPolicyProjection};
use rusqlite::Connection;
use serde_json::json;

fn aggregate(aggregate_type: &str, id: &str, owner: &str) -> Aggregate {
    Aggregate {
        id: id.into(),
        aggregate_type: aggregate_type.into(),
        resource_owner: owner.into(),
        instance_id: "inst-1".into(),
        version: "v1".into(),
    }
}

fn count(conn: &Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        .expect("count rows")
}

#[test]
fn auth_request_checkpoint_follows_the_applied_event() {
    let store = Arc::new(MemoryEventStore::new());
    let payload = json!({
        "login_client": "loginClient",
        "client_id": "clientId",
        "redirect_uri": "https://app/callback",
        "scope": ["openid"],
        "prompt": [0],
        "max_age": 300
    });
    store
        .append_raw(vec![StoredEvent {
            base: BaseEvent {
                aggregate: aggregate("auth_request", "req-1", "ro-id"),
                event_type: "auth_request.added".into(),
                sequence: 15,
                previous_sequence: 14,
                position: 15,
                creation_date: Utc.with_ymd_and_hms(2024, 3, 4, 5, 6, 7).unwrap(),
                editor_user: String::new(),
                editor_service: String::new(),
            },
            payload: serde_json::to_vec(&payload).expect("encode payload"),
        }])
        .expect("append");

    let mut conn = open_in_memory().expect("open projection db");
    let handler = Handler::new(&AuthRequestProjection, store, HandlerConfig::default());
    handler.init(&mut conn).expect("init schema");
    let applied = handler
        .trigger(&mut conn, &["inst-1".to_owned()], &Shutdown::new())
        .expect("trigger");
    assert_eq!(applied, 1);

    let (client_id, prompt, max_age): (String, String, i64) = conn
        .query_row(
            &format!("SELECT client_id, prompt, max_age FROM {AUTH_REQUEST_TABLE} WHERE id = 'req-1'"),
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .expect("auth request row");
    assert_eq!(client_id, "clientId");
    assert_eq!(prompt, "[0]");
    assert_eq!(max_age, 300);

    let state = checkpoint::read(&conn, AUTH_REQUEST_TABLE, "inst-1")
        .expect("read checkpoint")
        .expect("checkpoint written");
    assert_eq!(state.sequence, 15);
    assert_eq!(state.position, 15);
    assert_eq!(state.aggregate_id, "req-1");
}

fn label_policy(conn: &Connection, state: i64) -> Option<(String, Option<String>, i64)> {
    conn.query_row(
        &format!(
            "SELECT light_primary_color, light_logo_url, sequence FROM {LABEL_POLICY_TABLE} \
             WHERE id = 'org-1' AND state = ?1"
        ),
        [state],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )
    .ok()
}

#[test]
fn label_policy_edits_after_activation_leave_the_active_row() {
    let store = Arc::new(MemoryEventStore::new());
    let org = || aggregate("org", "org-1", "org-1");
    store
        .push(vec![
            Command::new(org(), "org.policy.label.added").payload(json!({"primaryColor": "#111111"})),
            Command::new(org(), "org.policy.label.activated"),
            Command::new(org(), "org.policy.label.changed").payload(json!({"primaryColor": "#222222"})),
            Command::new(org(), "org.policy.label.logo.added")
                .payload(json!({"storeKey": "org-1/next.png"})),
        ])
        .expect("push");

    let mut conn = open_in_memory().expect("open projection db");
    let handler = Handler::new(&LabelPolicyProjection, store.clone(), HandlerConfig::default());
    handler.init(&mut conn).expect("init schema");
    handler
        .trigger_known(&mut conn, &Shutdown::new())
        .expect("trigger");

    assert_eq!(label_policy(&conn, 1), Some(("#111111".into(), None, 2)));
    assert_eq!(
        label_policy(&conn, 3),
        Some(("#222222".into(), Some("org-1/next.png".into()), 4))
    );

    store
        .push(vec![Command::new(org(), "org.policy.label.activated")])
        .expect("push activation");
    handler
        .trigger_known(&mut conn, &Shutdown::new())
        .expect("trigger");
    assert_eq!(
        label_policy(&conn, 1),
        Some(("#222222".into(), Some("org-1/next.png".into()), 5))
    );
    assert_eq!(count(&conn, LABEL_POLICY_TABLE), 2);

    store
        .push(vec![Command::new(org(), "org.policy.label.removed")])
        .expect("push removal");
    handler
        .trigger_known(&mut conn, &Shutdown::new())
        .expect("trigger");
    assert_eq!(count(&conn, LABEL_POLICY_TABLE), 0);
}

#[test]
fn org_and_instance_removal_reach_every_projection() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = Arc::new(
        SqliteEventStore::open(&dir.path().join("events.sqlite3"), DEFAULT_BUSY_TIMEOUT)
            .expect("open event store"),
    );
    let mut conn = open_projection(&dir.path().join("projections.sqlite3"), DEFAULT_BUSY_TIMEOUT)
        .expect("open projection db");
    let dyn_store: Arc<dyn EventStore> = store.clone();
    let workers = ledgerview_iam::workers(&dyn_store, &ProjectorConfig::default());
    assert_eq!(workers.len(), 4);
    for worker in &workers {
        worker.init(&mut conn).expect("init schema");
    }

    let org = || aggregate("org", "org-1", "org-1");
    store
        .push(vec![
            Command::new(org(), "org.member.added")
                .payload(json!({"userId": "user-1", "roles": ["ORG_OWNER"]})),
            Command::new(org(), "org.policy.label.added")
                .payload(json!({"primaryColor": "#5469d4", "hideLoginNameSuffix": true})),
            Command::new(org(), "org.policy.label.logo.added")
                .payload(json!({"storeKey": "org-1/logo.png"})),
            Command::new(org(), "org.policy.label.activated"),
            Command::new(org(), "org.idp.oidc.added").payload(json!({
                "id": "idp-1",
                "name": "Corporate",
                "issuer": "https://issuer",
                "clientId": "client",
                "scopes": ["openid", "profile"],
                "isCreationAllowed": true
            })),
            Command::new(aggregate("auth_request", "req-1", "inst-1"), "auth_request.added")
                .payload(json!({"login_client": "lc", "client_id": "cid"})),
        ])
        .expect("push");

    let shutdown = Shutdown::new();
    for worker in &workers {
        worker.trigger_known(&mut conn, &shutdown).expect("trigger");
    }
    assert_eq!(count(&conn, ORG_MEMBER_TABLE), 1);
    assert_eq!(count(&conn, AUTH_REQUEST_TABLE), 1);
    assert_eq!(count(&conn, &format!("{IDP_TEMPLATE_TABLE}_oidc")), 1);
    assert_eq!(count(&conn, LABEL_POLICY_TABLE), 2, "preview and active row");
    let logo: String = conn
        .query_row(
            &format!("SELECT light_logo_url FROM {LABEL_POLICY_TABLE} WHERE id = 'org-1' AND state = 1"),
            [],
            |row| row.get(0),
        )
        .expect("active label policy row");
    assert_eq!(logo, "org-1/logo.png");

    store
        .push(vec![Command::new(org(), "org.removed")])
        .expect("push org removal");
    for worker in &workers {
        worker.trigger_known(&mut conn, &shutdown).expect("trigger");
    }
    assert_eq!(count(&conn, ORG_MEMBER_TABLE), 0);
    assert_eq!(count(&conn, LABEL_POLICY_TABLE), 0);
    let owner_removed: bool = conn
        .query_row(
            &format!("SELECT owner_removed FROM {IDP_TEMPLATE_TABLE} WHERE id = 'idp-1'"),
            [],
            |row| row.get(0),
        )
        .expect("idp row survives org removal");
    assert!(owner_removed);

    store
        .push(vec![Command::new(aggregate("instance", "inst-1", "inst-1"), "instance.removed")])
        .expect("push instance removal");
    for worker in &workers {
        worker.trigger_known(&mut conn, &shutdown).expect("trigger");
    }
    assert_eq!(count(&conn, AUTH_REQUEST_TABLE), 0);
    assert_eq!(count(&conn, IDP_TEMPLATE_TABLE), 0);
    assert_eq!(
        count(&conn, &format!("{IDP_TEMPLATE_TABLE}_oidc")),
        0,
        "side table cascades with the template"
    );
}
