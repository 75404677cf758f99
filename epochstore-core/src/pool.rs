//! A small fixed-size pool of `tokio_rusqlite::Connection`s.
//!
//! SQLite's single-writer model makes a generic async pool crate (`deadpool`,
//! `bb8`) more machinery than the problem needs: every connection here opens
//! the same file with the same pragmas, and contention is already resolved
//! by the engine itself. This pool exists to avoid paying the cost of
//! opening a fresh connection (and re-applying pragmas) on every operation,
//! and to give the audit sink (C7) a connection that never waits behind an
//! active result-set cursor on the main path.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_rusqlite::Connection;

use crate::config::PragmaConfig;
use crate::error::{Error, Result};

struct Slot {
    conn: tokio::sync::Mutex<Option<Connection>>,
}

/// A pool of connections to a single SQLite database file.
///
/// Connections are acquired with [`ConnectionPool::acquire`] and returned
/// to the pool when the returned [`PooledConnection`] is dropped.
pub struct ConnectionPool {
    path: PathBuf,
    config: PragmaConfig,
    slots: Vec<Slot>,
    available: Arc<Semaphore>,
}

impl ConnectionPool {
    /// Opens `size` connections to `path`, applying `config`'s pragmas to each.
    pub async fn open(path: impl Into<PathBuf>, config: PragmaConfig, size: usize) -> Result<Arc<Self>> {
        config.validate()?;
        let path = path.into();
        let mut slots = Vec::with_capacity(size.max(1));
        for _ in 0..size.max(1) {
            let conn = open_one(&path, &config).await?;
            slots.push(Slot {
                conn: tokio::sync::Mutex::new(Some(conn)),
            });
        }
        Ok(Arc::new(ConnectionPool {
            path,
            config,
            available: Arc::new(Semaphore::new(slots.len())),
            slots,
        }))
    }

    /// Acquires a connection, waiting if every slot is currently checked out.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection<'_>> {
        let permit = self
            .available
            .acquire()
            .await
            .expect("ConnectionPool semaphore is never closed");
        for slot in &self.slots {
            let mut guard = slot.conn.lock().await;
            if let Some(conn) = guard.take() {
                return Ok(PooledConnection {
                    pool: self,
                    slot: Some(guard),
                    conn: Some(conn),
                    _permit: permit,
                });
            }
        }
        unreachable!("semaphore permit implies a free slot exists")
    }

    /// Opens a connection outside the pool, for the audit sink (C7), so audit
    /// writes never queue behind a checked-out connection doing a long scan.
    pub async fn open_side_connection(&self) -> Result<Connection> {
        open_one(&self.path, &self.config).await
    }

    /// Path to the underlying database file.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// The pragma configuration applied to every connection in this pool.
    pub fn config(&self) -> &PragmaConfig {
        &self.config
    }
}

async fn open_one(path: &std::path::Path, config: &PragmaConfig) -> Result<Connection> {
    let conn = Connection::open(path)
        .await
        .map_err(|e| Error::connection("open", tokio_rusqlite::Error::Error(e)))?;
    let config = config.clone();
    conn.call(move |db| {
        config.apply(db)?;
        Ok(())
    })
    .await
    .map_err(|e| Error::connection("apply_pragmas", e))?;
    Ok(conn)
}

/// A connection checked out of a [`ConnectionPool`].
///
/// Returns the connection to its slot when dropped; the permit releases at
/// the same time, waking the next waiter.
pub struct PooledConnection<'p> {
    pool: &'p ConnectionPool,
    slot: Option<tokio::sync::MutexGuard<'p, Option<Connection>>>,
    conn: Option<Connection>,
    _permit: SemaphorePermit<'p>,
}

impl<'p> std::ops::Deref for PooledConnection<'p> {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present while checked out")
    }
}

impl<'p> Drop for PooledConnection<'p> {
    fn drop(&mut self) {
        if let (Some(mut slot), Some(conn)) = (self.slot.take(), self.conn.take()) {
            tracing::trace!(path = %self.pool.path().display(), "returning connection to pool");
            *slot = Some(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pool_round_trips_a_connection() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("pool.db");
        let pool = ConnectionPool::open(path, PragmaConfig::default(), 2)
            .await
            .unwrap();

        {
            let conn = pool.acquire().await.unwrap();
            let journal: String = conn
                .call(|db| Ok::<String, rusqlite::Error>(db.query_row("PRAGMA journal_mode", [], |r| r.get(0))?))
                .await
                .unwrap();
            assert_eq!(journal, "wal");
        }

        // Slot should be returned and reusable.
        let _conn2 = pool.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn pool_blocks_when_exhausted_then_unblocks_on_drop() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("pool.db");
        let pool = ConnectionPool::open(path, PragmaConfig::default(), 1)
            .await
            .unwrap();

        let first = pool.acquire().await.unwrap();
        let pool2 = pool.clone();
        let handle = tokio::spawn(async move {
            let _second = pool2.acquire().await.unwrap();
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!handle.is_finished(), "second acquire should still be waiting");
        drop(first);
        handle.await.unwrap();
    }
}
