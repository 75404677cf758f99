//! Global monotonic version sequence (C1).
//!
//! Every entity table in a database shares this one sequence, so versions
//! are totally ordered across types, not just within one table. The
//! sequence is modelled as a table rather than a process-local counter —
//! an `INSERT` read back by `last_insert_rowid()` — so it is correct across
//! process restarts with no special initialisation and relies on SQLite's
//! single-writer serialisation for monotonicity rather than any lock taken
//! in this crate.

/// DDL for the version sequence table.
pub const VERSION_SEQUENCE_DDL: &str = "
    CREATE TABLE IF NOT EXISTS version_sequence (
        seq INTEGER PRIMARY KEY AUTOINCREMENT
    );
";

/// Allocates the next strictly-monotonic version number.
///
/// Must be called within the same `rusqlite::Transaction` as the dependent
/// entity write so that the allocation and the write commit atomically.
pub fn allocate(tx: &rusqlite::Transaction<'_>) -> rusqlite::Result<u64> {
    tx.execute("INSERT INTO version_sequence DEFAULT VALUES", [])?;
    Ok(tx.last_insert_rowid() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn versions_are_strictly_increasing() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(VERSION_SEQUENCE_DDL).unwrap();

        let mut last = 0u64;
        for _ in 0..100 {
            let tx = conn.transaction().unwrap();
            let v = allocate(&tx).unwrap();
            tx.commit().unwrap();
            assert!(v > last, "version {v} did not exceed previous {last}");
            last = v;
        }
    }

    #[test]
    fn rolled_back_allocation_is_not_reused() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(VERSION_SEQUENCE_DDL).unwrap();

        let tx = conn.transaction().unwrap();
        let v1 = allocate(&tx).unwrap();
        drop(tx); // rolled back implicitly

        let tx = conn.transaction().unwrap();
        let v2 = allocate(&tx).unwrap();
        tx.commit().unwrap();

        // SQLite's autoincrement sequence does not reuse rowids even across
        // a rolled-back transaction, so v2 is still strictly greater.
        assert!(v2 > v1);
    }
}
