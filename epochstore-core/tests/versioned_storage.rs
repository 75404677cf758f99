//! End-to-end coverage of the versioned CRUD surface against a real,
//! tempfile-backed database, driven through `#[derive(Entity)]` the way a
//! downstream crate would use it (unlike the hand-rolled `Mapper` impl used
//! by `provider`'s own unit tests, which can't reach the derive macro from
//! inside the crate it's generated against).

use std::sync::Arc;

use epochstore_core::predicate::{OrderBy, Predicate};
use epochstore_core::{open_store, Entity as _, EntityDerive, PragmaConfig};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, EntityDerive)]
#[entity(table = "widgets")]
struct Widget {
    #[primary_key]
    id: String,
    name: String,
    state: String,
    #[primary_key]
    #[audit_field(version)]
    version: i64,
    #[audit_field(is_deleted)]
    is_deleted: bool,
    #[audit_field(created_time)]
    created_time: i64,
    #[audit_field(last_write_time)]
    last_write_time: i64,
}

impl Widget {
    fn new(id: &str, name: &str, state: &str) -> Self {
        Widget {
            id: id.to_string(),
            name: name.to_string(),
            state: state.to_string(),
            version: 0,
            is_deleted: false,
            created_time: 0,
            last_write_time: 0,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, EntityDerive)]
#[entity(table = "sessions")]
struct Session {
    #[primary_key]
    id: String,
    #[primary_key]
    #[audit_field(version)]
    version: i64,
    #[audit_field(is_deleted)]
    is_deleted: bool,
    #[audit_field(created_time)]
    created_time: i64,
    #[audit_field(last_write_time)]
    last_write_time: i64,
    #[audit_field(expiration_time)]
    expiration_time: Option<i64>,
}

impl Session {
    fn new(id: &str, expiration_time: Option<i64>) -> Self {
        Session { id: id.to_string(), version: 0, is_deleted: false, created_time: 0, last_write_time: 0, expiration_time }
    }
}

async fn session_provider() -> (tempfile::TempDir, epochstore_core::PersistenceProvider<Session>) {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("sessions.db");
    let pool = open_store(path, PragmaConfig::default(), 4).await.unwrap();
    let conn = pool.acquire().await.unwrap();
    let ddl = epochstore_core::ddl::render_schema(Session::descriptor());
    conn.call(move |db| -> rusqlite::Result<()> {
        db.execute_batch(&ddl)?;
        Ok(())
    })
    .await
    .unwrap();
    drop(conn);
    let audit = Arc::new(epochstore_core::audit::AuditSink::new(pool.clone()));
    (dir, epochstore_core::PersistenceProvider::new(pool, audit).await.unwrap())
}

async fn provider() -> (tempfile::TempDir, epochstore_core::PersistenceProvider<Widget>) {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("store.db");
    let pool = open_store(path, PragmaConfig::default(), 4).await.unwrap();
    let conn = pool.acquire().await.unwrap();
    let ddl = epochstore_core::ddl::render_schema(Widget::descriptor());
    conn.call(move |db| -> rusqlite::Result<()> {
        db.execute_batch(&ddl)?;
        Ok(())
    })
    .await
    .unwrap();
    drop(conn);
    let audit = Arc::new(epochstore_core::audit::AuditSink::new(pool.clone()));
    (dir, epochstore_core::PersistenceProvider::new(pool, audit).await.unwrap())
}

/// Scenario 1: create, update, get round-trips through strictly increasing versions.
#[tokio::test]
async fn create_update_get_round_trip() {
    let (_dir, provider) = provider().await;
    let token = CancellationToken::new();

    let created = provider.create(Widget::new("u-1", "A", "Ready"), &token).await.unwrap();
    assert!(created.version() > 0);
    assert!(!created.is_deleted());
    let v1 = created.version();

    let mut updated = created;
    updated.state = "InProgress".to_string();
    let updated = provider.update(updated, v1, &token).await.unwrap();
    assert!(updated.version() > v1, "I4: versions must strictly increase");

    let fetched = provider.get(&"u-1".to_string(), &token).await.unwrap().unwrap();
    assert_eq!(fetched.state, "InProgress");
    assert_eq!(fetched.version(), updated.version());
}

/// Scenario 2: a stale `original_version` loses the race (I5).
#[tokio::test]
async fn concurrent_update_with_stale_version_fails() {
    let (_dir, provider) = provider().await;
    let token = CancellationToken::new();

    let created = provider.create(Widget::new("u-2", "A", "Ready"), &token).await.unwrap();
    let v = created.version();

    let mut writer_a = created.clone();
    writer_a.state = "A-wins".to_string();
    let after_a = provider.update(writer_a, v, &token).await.unwrap();
    assert!(after_a.version() > v);

    let mut writer_b = created;
    writer_b.state = "B-loses".to_string();
    let err = provider.update(writer_b, v, &token).await.unwrap_err();
    assert!(err.is_concurrency(), "stale original_version must surface Error::Concurrency");
}

/// Scenario 3 + invariant I6: soft-delete then re-create produces a fresh version.
#[tokio::test]
async fn soft_delete_then_recreate() {
    let (_dir, provider) = provider().await;
    let token = CancellationToken::new();

    let created = provider.create(Widget::new("u-3", "A", "Ready"), &token).await.unwrap();
    provider.delete(&"u-3".to_string(), false, &token).await.unwrap();
    assert!(provider.get(&"u-3".to_string(), &token).await.unwrap().is_none(), "I3: soft-deleted current row must read as absent");

    let recreated = provider.create(Widget::new("u-3", "B", "Ready"), &token).await.unwrap();
    assert!(recreated.version() > created.version());
    let fetched = provider.get(&"u-3".to_string(), &token).await.unwrap().unwrap();
    assert_eq!(fetched.name, "B");
}

/// Creating over a live (non-deleted) key fails (I6, first half).
#[tokio::test]
async fn create_over_live_key_fails() {
    let (_dir, provider) = provider().await;
    let token = CancellationToken::new();

    provider.create(Widget::new("u-dup", "A", "Ready"), &token).await.unwrap();
    let err = provider.create(Widget::new("u-dup", "A", "Ready"), &token).await.unwrap_err();
    assert!(matches!(err, epochstore_core::Error::EntityAlreadyExists { .. }));
}

/// Scenario 4: batch membership create/update narrows and widens list membership.
#[tokio::test]
async fn batch_membership_tracks_list_key() {
    let (_dir, provider) = provider().await;
    let token = CancellationToken::new();

    let initial = vec![Widget::new("a", "A", "Ready"), Widget::new("b", "B", "Ready"), Widget::new("c", "C", "Ready")];
    provider.create_batch("L", initial, &token).await.unwrap();

    let members = provider.get_batch_by_list("L", &token).await.unwrap();
    let mut ids: Vec<_> = members.iter().map(|w| w.id.clone()).collect();
    ids.sort();
    assert_eq!(ids, vec!["a", "b", "c"]);

    let replacement = vec![Widget::new("a", "A", "Ready"), Widget::new("b", "B", "Ready"), Widget::new("d", "D", "Ready")];
    provider.update_batch("L", replacement, &token).await.unwrap();

    let members = provider.get_batch_by_list("L", &token).await.unwrap();
    let mut ids: Vec<_> = members.iter().map(|w| w.id.clone()).collect();
    ids.sort();
    assert_eq!(ids, vec!["a", "b", "d"], "'c' must be dropped from the list but keep its own row");

    // "c"'s entity row is still addressable directly even though it left the list.
    assert!(provider.get(&"c".to_string(), &token).await.unwrap().is_some());
}

/// Scenario 6: paged query over a larger data set, ordered ascending by a domain column.
#[tokio::test]
async fn paged_query_returns_the_requested_window() {
    let (_dir, provider) = provider().await;
    let token = CancellationToken::new();

    for i in 0..250 {
        let w = Widget::new(&format!("w-{i:04}"), &i.to_string(), "Ready");
        provider.create(w, &token).await.unwrap();
    }

    let total = provider.count(Some(&Predicate::eq("is_deleted", 0i64)), &token).await.unwrap();
    assert_eq!(total, 250);

    let page = provider
        .query_paged(
            &Predicate::eq("is_deleted", 0i64),
            30,
            4,
            Some(&OrderBy::asc("id")),
            &token,
        )
        .await
        .unwrap();
    assert_eq!(page.total, 250);
    assert_eq!(page.total_pages, 9);
    assert_eq!(page.items.len(), 30);
    assert_eq!(page.items.first().unwrap().id, "w-0090");
    assert_eq!(page.items.last().unwrap().id, "w-0119");
}

/// I2: created_time never exceeds last_write_time.
#[tokio::test]
async fn created_time_never_exceeds_last_write_time() {
    let (_dir, provider) = provider().await;
    let token = CancellationToken::new();
    let created = provider.create(Widget::new("u-ts", "A", "Ready"), &token).await.unwrap();
    assert!(created.created_time <= created.last_write_time);
}

/// Exercises a `TransactionScope` rollback (scenario 5): a later failure
/// undoes an earlier successful insert via its registered inverse.
#[tokio::test]
async fn transaction_scope_rolls_back_on_later_failure() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("scope.db");
    let conn = tokio_rusqlite::Connection::open(&path).await.unwrap();
    conn.call(|db| -> rusqlite::Result<()> {
        db.execute_batch("CREATE TABLE counters (name TEXT PRIMARY KEY, value INTEGER NOT NULL)")?;
        db.execute("INSERT INTO counters (name, value) VALUES ('y', 10)", [])?;
        Ok(())
    })
    .await
    .unwrap();

    let mut scope = epochstore_core::txn::TransactionScope::new(conn.clone());
    scope.push(
        epochstore_core::txn::Operation::new("bump y", epochstore_core::txn::ExecMode::Write, |tx| {
            tx.execute("UPDATE counters SET value = value + 5 WHERE name = 'y'", [])?;
            Ok(5i64)
        })
        .with_inverse(|tx, _delta: &i64| {
            tx.execute("UPDATE counters SET value = value - 5 WHERE name = 'y'", [])?;
            Ok(())
        }),
    );
    scope.push(epochstore_core::txn::Operation::new(
        "force failure",
        epochstore_core::txn::ExecMode::Write,
        |tx| tx.execute("UPDATE no_such_table SET value = 1", []),
    ));

    let err = scope.commit().await.unwrap_err();
    assert!(matches!(err, epochstore_core::Error::Aggregate { .. }));

    let value: i64 = conn
        .call(|db| Ok::<i64, rusqlite::Error>(db.query_row("SELECT value FROM counters WHERE name = 'y'", [], |r| r.get(0))?))
        .await
        .unwrap();
    assert_eq!(value, 10, "y must be left at its prior value after rollback");
}

/// `cleanup_expired` soft-deletes only entities past their `expiration_time`,
/// and leaves ones without one (or not yet due) untouched.
#[tokio::test]
async fn cleanup_expired_soft_deletes_only_past_ttl() {
    let (_dir, provider) = session_provider().await;
    let token = CancellationToken::new();

    provider.create(Session::new("s-past", Some(1)), &token).await.unwrap();
    provider.create(Session::new("s-future", Some(i64::MAX)), &token).await.unwrap();
    provider.create(Session::new("s-no-ttl", None), &token).await.unwrap();

    let removed = provider.cleanup_expired(false, &token).await.unwrap();
    assert_eq!(removed, 1);

    assert!(provider.get(&"s-past".to_string(), &token).await.unwrap().is_none());
    assert!(provider.get(&"s-future".to_string(), &token).await.unwrap().is_some());
    assert!(provider.get(&"s-no-ttl".to_string(), &token).await.unwrap().is_some());
}

/// An entity type that never declares `#[audit_field(expiration_time)]` has
/// nothing to clean up — `cleanup_expired` must not fail looking for a
/// column the table doesn't have.
#[tokio::test]
async fn cleanup_expired_is_a_noop_without_an_expiration_column() {
    let (_dir, provider) = provider().await;
    let token = CancellationToken::new();
    provider.create(Widget::new("w-1", "A", "Ready"), &token).await.unwrap();
    let removed = provider.cleanup_expired(false, &token).await.unwrap();
    assert_eq!(removed, 0);
}

/// `get_statistics` reports active/deleted/expired counts consistent with
/// the rows actually present.
#[tokio::test]
async fn get_statistics_reports_active_deleted_and_expired() {
    let (_dir, provider) = session_provider().await;
    let token = CancellationToken::new();

    provider.create(Session::new("s-live", Some(i64::MAX)), &token).await.unwrap();
    let stale = provider.create(Session::new("s-gone", None), &token).await.unwrap();
    provider.delete(&"s-gone".to_string(), false, &token).await.unwrap();
    let _ = stale;
    provider.create(Session::new("s-expired", Some(1)), &token).await.unwrap();

    let stats = provider.get_statistics(&token).await.unwrap();
    assert_eq!(stats.active, 2, "s-live and s-expired are both still the live row for their key");
    assert_eq!(stats.deleted, 1);
    assert_eq!(stats.expired, 1);
}
