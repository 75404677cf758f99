//! Persistence provider (C5): the public CRUD surface for one entity type.
//!
//! Generic over `E: Mapper` (which implies [`crate::metadata::Entity`]), so
//! one implementation serves every registered type. Every operation is
//! `async fn`, accepts a `tokio_util::sync::CancellationToken`, and runs
//! through [`crate::pool::ConnectionPool`] — optimistic concurrency is
//! enforced through the `entity_head` pointer table (see [`crate::mapper`]),
//! writes are versioned via [`crate::version::allocate`], and every
//! successful write (and every read attempt) is recorded by
//! [`crate::audit::AuditSink`] on a separate connection.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use rusqlite::OptionalExtension;
use tokio_util::sync::CancellationToken;

use crate::audit::{AccessEvent, AccessEventKind, AuditSink, UpdateEvent, UpdateEventKind};
use crate::error::{CallerSite, Error, Result};
use crate::mapper;
use crate::metadata::{Entity, Mapper};
use crate::pool::ConnectionPool;
use crate::predicate::{translate, OrderBy, Predicate};

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is after the unix epoch")
        .as_secs() as i64
}

/// Races a `Connection::call` future against cancellation, per §5 of the
/// specification: a cancelled operation's transaction is rolled back like
/// any other error path (SQLite aborts the transaction when the connection
/// call errors out without committing).
async fn run_cancellable<T>(
    token: &CancellationToken,
    operation: &'static str,
    fut: impl Future<Output = std::result::Result<T, tokio_rusqlite::Error>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Cancelled { operation }),
        result = fut => Error::from_call_result(result),
    }
}

/// One page of a [`PersistenceProvider::query_paged`] result.
#[derive(Debug, Clone)]
pub struct Page<E> {
    pub items: Vec<E>,
    pub total: u64,
    pub page_number: u64,
    pub page_size: u64,
    pub total_pages: u64,
}

/// Options honoured by [`PersistenceProvider::bulk_import`].
#[derive(Debug, Clone)]
pub struct BulkImportOptions {
    pub batch_size: usize,
    pub ignore_duplicates: bool,
    pub update_existing: bool,
    pub validate_before_import: bool,
}

impl Default for BulkImportOptions {
    fn default() -> Self {
        BulkImportOptions {
            batch_size: 100,
            ignore_duplicates: false,
            update_existing: false,
            validate_before_import: true,
        }
    }
}

/// Outcome of a [`PersistenceProvider::bulk_import`] run.
#[derive(Debug, Clone, Default)]
pub struct BulkImportReport {
    pub succeeded: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub errors: Vec<(usize, String)>,
    pub elapsed: std::time::Duration,
}

/// Options honoured by [`PersistenceProvider::bulk_export`].
#[derive(Debug, Clone, Default)]
pub struct BulkExportOptions {
    pub batch_size: usize,
    pub include_deleted: bool,
}

/// Progress callback payload for [`PersistenceProvider::bulk_export`].
#[derive(Debug, Clone, Copy)]
pub struct BulkExportProgress {
    pub exported_so_far: u64,
}

/// Aggregate counters returned by [`PersistenceProvider::get_statistics`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EntityStatistics {
    pub active: u64,
    pub deleted: u64,
    pub expired: u64,
    pub database_size_bytes: u64,
}

/// The public CRUD surface for one entity type `E`.
pub struct PersistenceProvider<E: Mapper> {
    pool: Arc<ConnectionPool>,
    audit: Arc<AuditSink>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Mapper + serde::Serialize + serde::de::DeserializeOwned> PersistenceProvider<E> {
    /// Builds a provider for `E` and records it in the `type_registry` table
    /// (C8), so a later reader can recover which store/serializer pair `E`'s
    /// rows were written with.
    pub async fn new(pool: Arc<ConnectionPool>, audit: Arc<AuditSink>) -> Result<Self> {
        let descriptor = E::descriptor();
        descriptor
            .validate_for_versioned_storage()
            .expect("entity type registered with PersistenceProvider must pass versioned-storage validation");

        let type_name = descriptor.table;
        let store_type = std::any::type_name::<E>();
        let serializer_type = crate::serializer::default_serializer_tag();
        {
            let conn = pool.acquire().await?;
            conn.call(move |db| {
                crate::serializer::register_type(db, type_name, env!("CARGO_PKG_VERSION"), store_type, serializer_type)
            })
            .await
            .map_err(|e| Error::connection("register_type", e))?;
        }

        Ok(PersistenceProvider { pool, audit, _entity: PhantomData })
    }

    fn type_name(&self) -> &'static str {
        E::descriptor().table
    }

    /// Returns the current, non-deleted row for `key`, if one exists.
    #[track_caller]
    pub async fn get(&self, key: &E::Key, token: &CancellationToken) -> Result<Option<E>> {
        let caller = CallerSite::capture("get");
        let started = Instant::now();
        let key_text = mapper::serialise_key(key);
        let type_name = self.type_name();
        let descriptor = E::descriptor();
        let select_sql = mapper::select_at_version_sql(descriptor);

        let conn = self.pool.acquire().await?;
        let kt = key_text.clone();
        let result = run_cancellable(
            token,
            "get",
            conn.call(move |db| {
                let head: Option<(i64, i64)> = db
                    .query_row(
                        "SELECT current_version, head_is_deleted FROM entity_head WHERE type_name = ?1 AND entity_key = ?2",
                        rusqlite::params![type_name, kt],
                        |r| Ok((r.get(0)?, r.get(1)?)),
                    )
                    .optional()?;
                let Some((version, deleted)) = head else {
                    return Ok(None);
                };
                if deleted != 0 {
                    return Ok(None);
                }
                let mut stmt = db.prepare(&select_sql)?;
                let entity = stmt
                    .query_row(
                        rusqlite::named_params! { ":key": kt, ":version": version },
                        E::from_row,
                    )
                    .optional()?;
                Ok(entity)
            }),
        )
        .await;

        let found = result.as_ref().map(|o| o.is_some()).unwrap_or(false);
        self.audit
            .record_access(AccessEvent {
                entity_key: key_text,
                type_name,
                kind: AccessEventKind::Get,
                hit: found,
                version: result.as_ref().ok().and_then(|o| o.as_ref().map(|e| e.version())),
                caller,
                elapsed: started.elapsed(),
                occurred_at: now_unix(),
            })
            .await;
        result
    }

    /// Returns true if any current, non-deleted row matches `pred`, without
    /// reading any payload.
    #[track_caller]
    pub async fn exists(&self, pred: &Predicate, token: &CancellationToken) -> Result<bool> {
        let caller = CallerSite::capture("exists");
        let descriptor = E::descriptor();
        let type_name = self.type_name();
        let translated = translate(pred, descriptor)?;
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {} t
             JOIN entity_head h ON h.type_name = :__type_name
                 AND h.entity_key = t.{}
                 AND h.current_version = t.{}
             WHERE h.head_is_deleted = 0 AND ({}))",
            descriptor.qualified_table(),
            descriptor.key_column(),
            descriptor.version_column(),
            translated.sql,
        );
        let started = Instant::now();

        let conn = self.pool.acquire().await?;
        let result = run_cancellable(
            token,
            "exists",
            conn.call(move |db| {
                let mut stmt = db.prepare(&sql)?;
                let mut bound: Vec<(&str, &dyn rusqlite::types::ToSql)> = vec![(":__type_name", &type_name)];
                for (name, value) in &translated.params {
                    bound.push((name.as_str(), value));
                }
                let found: i64 = stmt.query_row(bound.as_slice(), |r| r.get(0))?;
                Ok(found != 0)
            }),
        )
        .await;

        let found = *result.as_ref().unwrap_or(&false);
        self.audit
            .record_access(AccessEvent {
                entity_key: String::new(),
                type_name,
                kind: AccessEventKind::Exists,
                hit: found,
                version: None,
                caller,
                elapsed: started.elapsed(),
                occurred_at: now_unix(),
            })
            .await;
        result
    }

    /// Inserts a brand-new row for `entity.key()`.
    ///
    /// Fails with [`Error::EntityAlreadyExists`] if the current row for that
    /// key is live; succeeds (producing a new version) if it is absent or
    /// soft-deleted.
    #[track_caller]
    pub async fn create(&self, mut entity: E, token: &CancellationToken) -> Result<E> {
        let caller = CallerSite::capture("create");
        let type_name = self.type_name();
        let key_text = mapper::serialise_key(&entity.key());
        let descriptor = E::descriptor();
        let insert_sql = mapper::insert_sql(descriptor);
        let now = now_unix();

        let conn = self.pool.acquire().await?;
        let kt = key_text.clone();
        let result = run_cancellable(
            token,
            "create",
            conn.call(move |db| {
                let tx = db
                    .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                let existing: Option<i64> = tx
                    .query_row(
                        "SELECT head_is_deleted FROM entity_head WHERE type_name = ?1 AND entity_key = ?2",
                        rusqlite::params![type_name, kt],
                        |r| r.get(0),
                    )
                    .optional()?;
                if let Some(deleted) = existing {
                    if deleted == 0 {
                        return Err(Error::EntityAlreadyExists { table: type_name, key: kt }.into_call_error());
                    }
                }

                let new_version = crate::version::allocate(&tx)?;
                entity.set_version(new_version);
                entity.set_created_time(now);
                entity.set_last_write_time(now);
                entity.set_deleted(false);

                {
                    let mut stmt = tx.prepare(&insert_sql)?;
                    mapper::bind_and_execute(&mut stmt, &entity)?;
                }
                tx.execute(
                    "INSERT INTO entity_head (type_name, entity_key, current_version, head_is_deleted)
                     VALUES (?1, ?2, ?3, 0)
                     ON CONFLICT (type_name, entity_key) DO UPDATE SET
                        current_version = excluded.current_version, head_is_deleted = 0",
                    rusqlite::params![type_name, kt, new_version as i64],
                )?;

                tx.commit()?;
                Ok(entity)
            }),
        )
        .await;

        if let Ok(ref e) = result {
            let payload_size = mapper::serialise_entity::<E, crate::serializer::JsonSerializer>(e)
                .map(|bytes| bytes.len())
                .unwrap_or(0);
            self.audit
                .record_update(UpdateEvent {
                    entity_key: key_text,
                    type_name,
                    kind: UpdateEventKind::Insert,
                    old_version: None,
                    new_version: Some(e.version()),
                    payload_size,
                    caller,
                    occurred_at: now,
                })
                .await;
        }
        result
    }

    /// Appends a new version row for `entity.key()`, gated by
    /// `original_version` through an atomic compare-and-swap on the head
    /// pointer table.
    #[track_caller]
    pub async fn update(&self, mut entity: E, original_version: u64, token: &CancellationToken) -> Result<E> {
        let caller = CallerSite::capture("update");
        let type_name = self.type_name();
        let key_text = mapper::serialise_key(&entity.key());
        let descriptor = E::descriptor();
        let insert_sql = mapper::insert_sql(descriptor);
        let now = now_unix();

        let conn = self.pool.acquire().await?;
        let kt = key_text.clone();
        let result = run_cancellable(
            token,
            "update",
            conn.call(move |db| {
                let tx = db
                    .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

                let affected = tx
                    .execute(
                        "UPDATE entity_head SET current_version = current_version
                         WHERE type_name = ?1 AND entity_key = ?2
                           AND current_version = ?3 AND head_is_deleted = 0",
                        rusqlite::params![type_name, kt, original_version as i64],
                    )?;
                if affected == 0 {
                    return Err(Error::Concurrency { table: type_name, key: kt, expected: original_version }
                        .into_call_error());
                }

                let new_version = crate::version::allocate(&tx)?;
                entity.set_version(new_version);
                entity.set_last_write_time(now);
                entity.set_deleted(false);

                {
                    let mut stmt = tx.prepare(&insert_sql)?;
                    mapper::bind_and_execute(&mut stmt, &entity)?;
                }
                tx.execute(
                    "UPDATE entity_head SET current_version = ?3
                     WHERE type_name = ?1 AND entity_key = ?2 AND current_version = ?4",
                    rusqlite::params![type_name, kt, new_version as i64, original_version as i64],
                )?;

                tx.commit()?;
                Ok(entity)
            }),
        )
        .await;

        if let Ok(ref e) = result {
            let payload_size = mapper::serialise_entity::<E, crate::serializer::JsonSerializer>(e)
                .map(|bytes| bytes.len())
                .unwrap_or(0);
            self.audit
                .record_update(UpdateEvent {
                    entity_key: key_text,
                    type_name,
                    kind: UpdateEventKind::Update,
                    old_version: Some(original_version),
                    new_version: Some(e.version()),
                    payload_size,
                    caller,
                    occurred_at: now,
                })
                .await;
        }
        result
    }

    /// Deletes `key`: soft by default (flips `is_deleted`, keeps history;
    /// does not allocate a new version), or unconditionally when `hard` is set.
    #[track_caller]
    pub async fn delete(&self, key: &E::Key, hard: bool, token: &CancellationToken) -> Result<()> {
        let caller = CallerSite::capture("delete");
        let type_name = self.type_name();
        let key_text = mapper::serialise_key(key);
        let descriptor = E::descriptor();
        let soft_sql = mapper::soft_delete_sql(descriptor);
        let hard_sql = mapper::hard_delete_sql(descriptor);
        let now = now_unix();

        let conn = self.pool.acquire().await?;
        let kt = key_text.clone();
        let result = run_cancellable(
            token,
            "delete",
            conn.call(move |db| {
                let tx = db
                    .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                let head: Option<i64> = tx
                    .query_row(
                        "SELECT current_version FROM entity_head WHERE type_name = ?1 AND entity_key = ?2 AND head_is_deleted = 0",
                        rusqlite::params![type_name, kt],
                        |r| r.get(0),
                    )
                    .optional()?;
                let Some(version) = head else {
                    tx.commit()?;
                    return Ok(());
                };

                if hard {
                    tx.execute(&hard_sql, rusqlite::named_params! { ":key": kt })?;
                    tx.execute(
                        "DELETE FROM entity_head WHERE type_name = ?1 AND entity_key = ?2",
                        rusqlite::params![type_name, kt],
                    )?;
                } else {
                    let affected = tx
                        .execute(
                            &soft_sql,
                            rusqlite::named_params! { ":key": kt, ":version": version, ":now": now },
                        )?;
                    if affected == 0 {
                        return Err(Error::storage(
                            "delete",
                            rusqlite::Error::QueryReturnedNoRows,
                        )
                        .into_call_error());
                    }
                    tx.execute(
                        "UPDATE entity_head SET head_is_deleted = 1 WHERE type_name = ?1 AND entity_key = ?2",
                        rusqlite::params![type_name, kt],
                    )?;
                }
                tx.commit()?;
                Ok(())
            }),
        )
        .await;

        if result.is_ok() {
            self.audit
                .record_update(UpdateEvent {
                    entity_key: key_text,
                    type_name,
                    kind: UpdateEventKind::Delete,
                    old_version: None,
                    new_version: None,
                    payload_size: 0,
                    caller,
                    occurred_at: now,
                })
                .await;
        }
        result
    }

    /// Current (non-deleted, highest-version) rows matching `pred`, newest first.
    pub async fn query(&self, pred: &Predicate, order: Option<&OrderBy>, token: &CancellationToken) -> Result<Vec<E>> {
        let descriptor = E::descriptor();
        let translated = translate(pred, descriptor)?;
        let order_fragment = match order {
            Some(ob) => ob.to_sql_fragment(descriptor)?,
            None => format!("t.{} DESC", descriptor.version_column()),
        };
        let type_name = self.type_name();
        let sql = format!(
            "SELECT t.* FROM {} t
             JOIN entity_head h ON h.type_name = :__type_name
                 AND h.entity_key = t.{}
                 AND h.current_version = t.{}
             WHERE h.head_is_deleted = 0 AND ({})
             ORDER BY {order_fragment}",
            descriptor.qualified_table(),
            descriptor.key_column(),
            descriptor.version_column(),
            translated.sql,
        );

        let conn = self.pool.acquire().await?;
        run_cancellable(
            token,
            "query",
            conn.call(move |db| {
                let mut stmt = db.prepare(&sql)?;
                let mut bound: Vec<(&str, &dyn rusqlite::types::ToSql)> = vec![(":__type_name", &type_name)];
                for (name, value) in &translated.params {
                    bound.push((name.as_str(), value));
                }
                let rows = stmt.query_map(bound.as_slice(), E::from_row)?;
                rows.collect::<rusqlite::Result<Vec<E>>>()
            }),
        )
        .await
    }

    /// Windowed, paginated form of [`Self::query`]. Ranks the matching rows
    /// with `ROW_NUMBER()` and slices the requested page out of that ranking
    /// with `LIMIT`/`OFFSET`, rather than materialising the whole result set.
    pub async fn query_paged(
        &self,
        pred: &Predicate,
        page_size: u64,
        page_number: u64,
        order: Option<&OrderBy>,
        token: &CancellationToken,
    ) -> Result<Page<E>> {
        let total = self.count(Some(pred), token).await?;

        let descriptor = E::descriptor();
        let translated = translate(pred, descriptor)?;
        let order_fragment = match order {
            Some(ob) => ob.to_sql_fragment(descriptor)?,
            None => format!("t.{} DESC", descriptor.version_column()),
        };
        let type_name = self.type_name();
        let offset = (page_number.saturating_sub(1) * page_size) as i64;
        let limit = page_size as i64;
        let sql = format!(
            "WITH paged AS (
                 SELECT t.*, ROW_NUMBER() OVER (ORDER BY {order_fragment}) AS __row_num
                 FROM {} t
                 JOIN entity_head h ON h.type_name = :__type_name
                     AND h.entity_key = t.{}
                     AND h.current_version = t.{}
                 WHERE h.head_is_deleted = 0 AND ({})
             )
             SELECT * FROM paged
             WHERE __row_num > :__offset AND __row_num <= :__offset + :__limit
             ORDER BY __row_num",
            descriptor.qualified_table(),
            descriptor.key_column(),
            descriptor.version_column(),
            translated.sql,
        );

        let conn = self.pool.acquire().await?;
        let items = run_cancellable(
            token,
            "query_paged",
            conn.call(move |db| {
                let mut stmt = db.prepare(&sql)?;
                let mut bound: Vec<(&str, &dyn rusqlite::types::ToSql)> = vec![
                    (":__type_name", &type_name),
                    (":__offset", &offset),
                    (":__limit", &limit),
                ];
                for (name, value) in &translated.params {
                    bound.push((name.as_str(), value));
                }
                let rows = stmt.query_map(bound.as_slice(), E::from_row)?;
                rows.collect::<rusqlite::Result<Vec<E>>>()
            }),
        )
        .await?;

        let total_pages = if page_size == 0 { 0 } else { (total + page_size - 1) / page_size };
        Ok(Page { items, total, page_number, page_size, total_pages })
    }

    /// Counts current rows matching `pred` (or every current row if `None`).
    pub async fn count(&self, pred: Option<&Predicate>, token: &CancellationToken) -> Result<u64> {
        let descriptor = E::descriptor();
        let type_name = self.type_name();
        let where_fragment = match pred {
            Some(p) => translate(p, descriptor)?,
            None => crate::predicate::Translated { sql: "1 = 1".to_string(), params: vec![] },
        };
        let sql = format!(
            "SELECT COUNT(*) FROM {} t
             JOIN entity_head h ON h.type_name = :__type_name
                 AND h.entity_key = t.{}
                 AND h.current_version = t.{}
             WHERE h.head_is_deleted = 0 AND ({})",
            descriptor.qualified_table(),
            descriptor.key_column(),
            descriptor.version_column(),
            where_fragment.sql,
        );

        let conn = self.pool.acquire().await?;
        run_cancellable(
            token,
            "count",
            conn.call(move |db| {
                let mut stmt = db.prepare(&sql)?;
                let mut bound: Vec<(&str, &dyn rusqlite::types::ToSql)> = vec![(":__type_name", &type_name)];
                for (name, value) in &where_fragment.params {
                    bound.push((name.as_str(), value));
                }
                let count: i64 = stmt.query_row(bound.as_slice(), |r| r.get(0))?;
                Ok(count as u64)
            }),
        )
        .await
    }

    /// Creates every entity in `entities` and associates them with `list_key`
    /// under one shared version.
    pub async fn create_batch(&self, list_key: &str, entities: Vec<E>, token: &CancellationToken) -> Result<Vec<E>> {
        let type_name = self.type_name();
        let insert_sql = mapper::insert_sql(E::descriptor());
        let now = now_unix();
        let list_key = list_key.to_string();

        let conn = self.pool.acquire().await?;
        run_cancellable(
            token,
            "create_batch",
            conn.call(move |db| {
                let tx = db
                    .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                let shared_version = crate::version::allocate(&tx)?;
                let mut out = Vec::with_capacity(entities.len());
                for mut entity in entities {
                    let kt = mapper::serialise_key(&entity.key());
                    entity.set_version(shared_version);
                    entity.set_created_time(now);
                    entity.set_last_write_time(now);
                    entity.set_deleted(false);
                    {
                        let mut stmt = tx.prepare(&insert_sql)?;
                        mapper::bind_and_execute(&mut stmt, &entity)?;
                    }
                    tx.execute(
                        "INSERT INTO entity_head (type_name, entity_key, current_version, head_is_deleted)
                         VALUES (?1, ?2, ?3, 0)
                         ON CONFLICT (type_name, entity_key) DO UPDATE SET
                            current_version = excluded.current_version, head_is_deleted = 0",
                        rusqlite::params![type_name, kt, shared_version as i64],
                    )?;
                    tx.execute(
                        "INSERT INTO list_membership (type_name, list_key, entry_key, version)
                         VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT (type_name, list_key, entry_key) DO UPDATE SET version = excluded.version",
                        rusqlite::params![type_name, list_key, kt, shared_version as i64],
                    )?;
                    out.push(entity);
                }
                tx.commit()?;
                Ok(out)
            }),
        )
        .await
    }

    /// Replaces `list_key`'s membership rows with `entries`' keys, inserting
    /// a new version for each under one shared version number.
    pub async fn update_batch(&self, list_key: &str, entities: Vec<E>, token: &CancellationToken) -> Result<Vec<E>> {
        let type_name = self.type_name();
        let insert_sql = mapper::insert_sql(E::descriptor());
        let now = now_unix();
        let list_key = list_key.to_string();

        let conn = self.pool.acquire().await?;
        run_cancellable(
            token,
            "update_batch",
            conn.call(move |db| {
                let tx = db
                    .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                tx.execute(
                    "DELETE FROM list_membership WHERE type_name = ?1 AND list_key = ?2",
                    rusqlite::params![type_name, list_key],
                )?;

                let shared_version = crate::version::allocate(&tx)?;
                let mut out = Vec::with_capacity(entities.len());
                for mut entity in entities {
                    let kt = mapper::serialise_key(&entity.key());
                    entity.set_version(shared_version);
                    entity.set_last_write_time(now);
                    entity.set_deleted(false);
                    {
                        let mut stmt = tx.prepare(&insert_sql)?;
                        mapper::bind_and_execute(&mut stmt, &entity)?;
                    }
                    tx.execute(
                        "INSERT INTO entity_head (type_name, entity_key, current_version, head_is_deleted)
                         VALUES (?1, ?2, ?3, 0)
                         ON CONFLICT (type_name, entity_key) DO UPDATE SET
                            current_version = excluded.current_version, head_is_deleted = 0",
                        rusqlite::params![type_name, kt, shared_version as i64],
                    )?;
                    tx.execute(
                        "INSERT INTO list_membership (type_name, list_key, entry_key, version)
                         VALUES (?1, ?2, ?3, ?4)",
                        rusqlite::params![type_name, list_key, kt, shared_version as i64],
                    )?;
                    out.push(entity);
                }
                tx.commit()?;
                Ok(out)
            }),
        )
        .await
    }

    /// Removes `list_key`'s membership map rows (soft-deletes nothing by
    /// itself — members remain addressable by key).
    pub async fn delete_batch(&self, list_key: &str, token: &CancellationToken) -> Result<()> {
        let type_name = self.type_name();
        let list_key = list_key.to_string();
        let conn = self.pool.acquire().await?;
        run_cancellable(
            token,
            "delete_batch",
            conn.call(move |db| {
                db.execute(
                    "DELETE FROM list_membership WHERE type_name = ?1 AND list_key = ?2",
                    rusqlite::params![type_name, list_key],
                )?;
                Ok(())
            }),
        )
        .await
    }

    /// Current rows for every key in `list_key`'s membership map.
    pub async fn get_batch_by_list(&self, list_key: &str, token: &CancellationToken) -> Result<Vec<E>> {
        let descriptor = E::descriptor();
        let select_sql = mapper::select_at_version_sql(descriptor);
        let type_name = self.type_name();
        let list_key = list_key.to_string();

        let conn = self.pool.acquire().await?;
        run_cancellable(
            token,
            "get_batch_by_list",
            conn.call(move |db| {
                let mut member_stmt = db.prepare(
                    "SELECT m.entry_key FROM list_membership m
                     JOIN entity_head h ON h.type_name = m.type_name AND h.entity_key = m.entry_key
                     WHERE m.type_name = ?1 AND m.list_key = ?2 AND h.head_is_deleted = 0",
                )?;
                let keys: Vec<String> = member_stmt
                    .query_map(rusqlite::params![type_name, list_key], |r| r.get(0))?
                    .collect::<rusqlite::Result<_>>()?;
                drop(member_stmt);

                let mut out = Vec::with_capacity(keys.len());
                for key in keys {
                    let version: i64 = db.query_row(
                        "SELECT current_version FROM entity_head WHERE type_name = ?1 AND entity_key = ?2",
                        rusqlite::params![type_name, key],
                        |r| r.get(0),
                    )?;
                    let mut stmt = db.prepare(&select_sql)?;
                    if let Some(entity) = stmt
                        .query_row(rusqlite::named_params! { ":key": key, ":version": version }, E::from_row)
                        .optional()?
                    {
                        out.push(entity);
                    }
                }
                Ok(out)
            }),
        )
        .await
    }

    /// Imports `entities` in batches, honouring `options`. Never
    /// short-circuits on a single failure — every per-entity error is
    /// collected into the returned report.
    pub async fn bulk_import(&self, entities: Vec<E>, options: BulkImportOptions, token: &CancellationToken) -> Result<BulkImportReport> {
        let started = Instant::now();
        let mut report = BulkImportReport::default();

        for (chunk_index, chunk) in entities.chunks(options.batch_size.max(1)).enumerate() {
            for (offset, entity) in chunk.iter().enumerate() {
                let index = chunk_index * options.batch_size.max(1) + offset;
                if options.validate_before_import {
                    let key_text = mapper::serialise_key(&entity.key());
                    if key_text.is_empty() {
                        report.failed += 1;
                        report.errors.push((index, "entity key serialises to an empty string".to_string()));
                        continue;
                    }
                    if let Err(e) = mapper::deserialise_key::<E::Key>(&key_text) {
                        report.failed += 1;
                        report.errors.push((index, format!("entity key does not round-trip through serialise/deserialise: {e}")));
                        continue;
                    }
                }

                let existing = self.get(&entity.key(), token).await?;
                let outcome = match (existing, options.update_existing) {
                    (Some(current), true) => self.update(entity.clone(), current.version(), token).await.map(|_| ()),
                    (Some(_), false) => {
                        report.duplicates += 1;
                        if options.ignore_duplicates {
                            continue;
                        }
                        Err(Error::EntityAlreadyExists {
                            table: self.type_name(),
                            key: mapper::serialise_key(&entity.key()),
                        })
                    }
                    (None, _) => self.create(entity.clone(), token).await.map(|_| ()),
                };

                match outcome {
                    Ok(()) => report.succeeded += 1,
                    Err(e) => {
                        report.failed += 1;
                        report.errors.push((index, e.to_string()));
                    }
                }
            }
        }

        report.elapsed = started.elapsed();
        Ok(report)
    }

    /// Streams current rows matching `pred` (or every current row), invoking
    /// `progress` after each batch.
    pub async fn bulk_export(
        &self,
        pred: Option<&Predicate>,
        options: BulkExportOptions,
        mut progress: impl FnMut(BulkExportProgress),
        token: &CancellationToken,
    ) -> Result<Vec<E>> {
        let all = match pred {
            Some(p) => self.query(p, None, token).await?,
            None => {
                let always_true = Predicate::ge(E::descriptor().version_column(), 0i64);
                self.query(&always_true, None, token).await?
            }
        };
        let batch_size = options.batch_size.max(1);
        let mut exported = 0u64;
        for chunk in all.chunks(batch_size) {
            exported += chunk.len() as u64;
            progress(BulkExportProgress { exported_so_far: exported });
        }
        Ok(all)
    }

    /// Soft- (default) or hard-deletes rows whose `expiration_time` has passed.
    pub async fn cleanup_expired(&self, hard: bool, token: &CancellationToken) -> Result<u64> {
        let descriptor = E::descriptor();
        let table = descriptor.qualified_table();
        let type_name = self.type_name();
        let key_col = descriptor.key_column();
        let version_col = descriptor.version_column();
        let expiration_col = descriptor.expiration_time_column();
        let now = now_unix();

        let conn = self.pool.acquire().await?;
        run_cancellable(
            token,
            "cleanup_expired",
            conn.call(move |db| {
                let Some(expiration_col) = expiration_col else {
                    return Ok(0);
                };
                let tx = db.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                let expired_keys: Vec<(String, i64)> = {
                    let mut stmt = tx.prepare(&format!(
                        "SELECT t.{key_col}, t.{version_col} FROM {table} t
                         JOIN entity_head h ON h.type_name = ?1 AND h.entity_key = t.{key_col} AND h.current_version = t.{version_col}
                         WHERE h.head_is_deleted = 0 AND t.{expiration_col} IS NOT NULL AND t.{expiration_col} <= ?2"
                    ))?;
                    let rows = stmt.query_map(rusqlite::params![type_name, now], |r| Ok((r.get(0)?, r.get(1)?)))?
                        .collect::<rusqlite::Result<_>>()?;
                    rows
                };
                let count = expired_keys.len() as u64;
                for (key, _version) in expired_keys {
                    if hard {
                        tx.execute(&format!("DELETE FROM {table} WHERE {key_col} = ?1"), rusqlite::params![key])?;
                        tx.execute(
                            "DELETE FROM entity_head WHERE type_name = ?1 AND entity_key = ?2",
                            rusqlite::params![type_name, key],
                        )?;
                    } else {
                        tx.execute(
                            &format!("UPDATE {table} SET is_deleted = 1, last_write_time = ?1 WHERE {key_col} = ?2"),
                            rusqlite::params![now, key],
                        )?;
                        tx.execute(
                            "UPDATE entity_head SET head_is_deleted = 1 WHERE type_name = ?1 AND entity_key = ?2",
                            rusqlite::params![type_name, key],
                        )?;
                    }
                }
                tx.commit()?;
                Ok(count)
            }),
        )
        .await
    }

    /// Reclaims free pages via `VACUUM` (or incremental vacuum, when the
    /// connection's `auto_vacuum` pragma is set to `incremental`).
    pub async fn optimize_storage(&self, token: &CancellationToken) -> Result<()> {
        let conn = self.pool.acquire().await?;
        run_cancellable(
            token,
            "optimize_storage",
            conn.call(move |db| {
                let auto_vacuum: i64 = db.query_row("PRAGMA auto_vacuum", [], |r| r.get(0))?;
                if auto_vacuum == 2 {
                    db.execute_batch("PRAGMA incremental_vacuum")?;
                } else {
                    db.execute_batch("VACUUM")?;
                }
                Ok(())
            }),
        )
        .await
    }

    /// Aggregate counts and on-disk size for this entity type's table.
    pub async fn get_statistics(&self, token: &CancellationToken) -> Result<EntityStatistics> {
        let descriptor = E::descriptor();
        let table = descriptor.qualified_table();
        let key_col = descriptor.key_column();
        let version_col = descriptor.version_column();
        let expiration_col = descriptor.expiration_time_column();
        let type_name = self.type_name();
        let now = now_unix();

        let conn = self.pool.acquire().await?;
        run_cancellable(
            token,
            "get_statistics",
            conn.call(move |db| {
                let active: i64 = db.query_row(
                    &format!(
                        "SELECT COUNT(*) FROM {table} t
                         JOIN entity_head h ON h.type_name = ?1 AND h.entity_key = t.{key_col} AND h.current_version = t.{version_col}
                         WHERE h.head_is_deleted = 0"
                    ),
                    rusqlite::params![type_name],
                    |r| r.get(0),
                )?;
                let deleted: i64 = db.query_row(
                    "SELECT COUNT(*) FROM entity_head WHERE type_name = ?1 AND head_is_deleted = 1",
                    rusqlite::params![type_name],
                    |r| r.get(0),
                )?;
                let expired: i64 = match expiration_col {
                    Some(expiration_col) => db.query_row(
                        &format!(
                            "SELECT COUNT(*) FROM {table} t
                             JOIN entity_head h ON h.type_name = ?1 AND h.entity_key = t.{key_col} AND h.current_version = t.{version_col}
                             WHERE t.{expiration_col} IS NOT NULL AND t.{expiration_col} <= ?2"
                        ),
                        rusqlite::params![type_name, now],
                        |r| r.get(0),
                    )?,
                    None => 0,
                };
                let page_count: i64 = db.query_row("PRAGMA page_count", [], |r| r.get(0))?;
                let page_size: i64 = db.query_row("PRAGMA page_size", [], |r| r.get(0))?;
                Ok(EntityStatistics {
                    active: active as u64,
                    deleted: deleted as u64,
                    expired: expired as u64,
                    database_size_bytes: (page_count * page_size) as u64,
                })
            }),
        )
        .await
    }
}
