//! A versioned, audited SQLite persistence layer with optimistic
//! concurrency, append-only history, and inverse-based transaction scopes.
//!
//! The public surface is [`provider::PersistenceProvider`], generic over a
//! type implementing [`metadata::Entity`] and [`metadata::Mapper`] — both
//! produced for a struct by `#[derive(Entity)]` from the `epochstore-derive`
//! crate. See the module list below for how the pieces fit together.

pub mod audit;
pub mod config;
pub mod ddl;
pub mod error;
pub mod mapper;
pub mod metadata;
pub mod pool;
pub mod predicate;
pub mod provider;
pub mod serializer;
pub mod txn;
pub mod version;

pub use config::PragmaConfig;
pub use error::{Error, Result};
pub use metadata::{Entity, EntityKey, Mapper};
pub use pool::ConnectionPool;
pub use predicate::{CompareOp, Direction, OrderBy, Predicate};
pub use provider::PersistenceProvider;

/// Re-exported so a downstream crate only needs `use epochstore_core::Entity;`
/// to bring both the trait and its derive macro into scope.
pub use epochstore_derive::Entity as EntityDerive;

/// Opens a database at `path`, applies `config`, and creates every table
/// this crate owns (version sequence, entity head, list membership, audit
/// history, type registry) if they do not already exist.
///
/// Per-entity tables are created separately via [`ddl::render_schema`] once
/// the caller's entity types are known; this only prepares the tables the
/// core itself depends on regardless of which entities get registered.
pub async fn open_store(
    path: impl Into<std::path::PathBuf>,
    config: PragmaConfig,
    pool_size: usize,
) -> Result<std::sync::Arc<ConnectionPool>> {
    let pool = ConnectionPool::open(path, config, pool_size).await?;
    let conn = pool.acquire().await?;
    conn.call(|db| {
        db.execute_batch(version::VERSION_SEQUENCE_DDL)?;
        db.execute_batch(mapper::ENTITY_HEAD_DDL)?;
        db.execute_batch(mapper::LIST_MEMBERSHIP_DDL)?;
        db.execute_batch(audit::AUDIT_SCHEMA_DDL)?;
        db.execute_batch(serializer::TYPE_REGISTRY_DDL)?;
        Ok(())
    })
    .await
    .map_err(|e| Error::connection("open_store", e))?;
    drop(conn);
    Ok(pool)
}
