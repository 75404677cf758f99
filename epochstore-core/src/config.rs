//! Connection-scoped engine configuration.
//!
//! `PragmaConfig` is consumed as a plain struct — loading it from a file or
//! environment is an external collaborator's job. Every field here is
//! applied to a connection immediately after it is opened, the way the
//! reference crate's `db::open_db` hard-codes WAL/NORMAL, generalised to a
//! configurable struct per the composition-over-inheritance note in the
//! specification's design notes.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// SQLite journal mode. See <https://www.sqlite.org/pragma.html#pragma_journal_mode>.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    Delete,
    Truncate,
    Persist,
    Memory,
    Wal,
    Off,
}

impl JournalMode {
    fn as_pragma_value(self) -> &'static str {
        match self {
            JournalMode::Delete => "DELETE",
            JournalMode::Truncate => "TRUNCATE",
            JournalMode::Persist => "PERSIST",
            JournalMode::Memory => "MEMORY",
            JournalMode::Wal => "WAL",
            JournalMode::Off => "OFF",
        }
    }
}

/// When SQLite issues `fsync` around a commit.
/// See <https://www.sqlite.org/pragma.html#pragma_synchronous>.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynchronousMode {
    Off,
    Normal,
    Full,
    Extra,
}

impl SynchronousMode {
    fn as_pragma_value(self) -> &'static str {
        match self {
            SynchronousMode::Off => "OFF",
            SynchronousMode::Normal => "NORMAL",
            SynchronousMode::Full => "FULL",
            SynchronousMode::Extra => "EXTRA",
        }
    }
}

/// Connection-scoped SQLite pragmas, applied on every connection opened by
/// [`crate::pool::ConnectionPool`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PragmaConfig {
    /// Negative = KiB of page cache, positive = number of pages.
    pub cache_size: i64,
    /// Page size in bytes; must be a power of two between 512 and 65536.
    /// Only takes effect on an empty database (SQLite restriction).
    pub page_size: u32,
    /// Durability/concurrency regime.
    pub journal_mode: JournalMode,
    /// When fsync is issued around commits.
    pub synchronous_mode: SynchronousMode,
    /// Maximum time to wait on a locked database before failing with `SQLITE_BUSY`.
    pub busy_timeout_ms: u64,
    /// Whether `PRAGMA foreign_keys` is enabled for the connection.
    pub enable_foreign_keys: bool,
}

impl Default for PragmaConfig {
    fn default() -> Self {
        PragmaConfig {
            cache_size: -2000,
            page_size: 4096,
            journal_mode: JournalMode::Wal,
            synchronous_mode: SynchronousMode::Normal,
            busy_timeout_ms: 5_000,
            enable_foreign_keys: true,
        }
    }
}

impl PragmaConfig {
    /// Validates field ranges the type system can't express
    /// (`page_size` power-of-two, in-range).
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.page_size < 512 || self.page_size > 65536 || !self.page_size.is_power_of_two() {
            return Err(crate::error::Error::ValidationFailed(format!(
                "page_size {} must be a power of two between 512 and 65536",
                self.page_size
            )));
        }
        Ok(())
    }

    pub(crate) fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Applies this configuration to an already-open synchronous connection.
    ///
    /// Called from inside a `tokio_rusqlite::Connection::call` closure, so it
    /// runs on the background SQLite thread, never on a Tokio worker.
    pub fn apply(&self, conn: &rusqlite::Connection) -> rusqlite::Result<()> {
        conn.execute_batch(&format!(
            "PRAGMA cache_size = {cache};
             PRAGMA page_size = {page};
             PRAGMA journal_mode = {journal};
             PRAGMA synchronous = {sync};
             PRAGMA foreign_keys = {fk};",
            cache = self.cache_size,
            page = self.page_size,
            journal = self.journal_mode.as_pragma_value(),
            sync = self.synchronous_mode.as_pragma_value(),
            fk = if self.enable_foreign_keys { "ON" } else { "OFF" },
        ))?;
        conn.busy_timeout(self.busy_timeout())?;
        Ok(())
    }
}
