//! Transaction scope (C6): chains operations with inverse-based compensation.
//!
//! One `tokio_rusqlite::Connection` runs `BEGIN IMMEDIATE`; each queued
//! operation executes against that same transaction. If every operation
//! succeeds the transaction commits once. If one fails, already-applied
//! operations are undone in reverse order by running their `inverse`
//! closures against the *same* transaction, before it is rolled back — so a
//! caller that only cares about end state sees "nothing happened", while a
//! caller inspecting individual operation outcomes can still see which step
//! failed.

use std::fmt;

use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Lifecycle state of a [`TransactionScope`]. Transitions only move forward;
/// there is no variant construction that can represent going back to an
/// earlier state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    Active,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    Failed,
}

impl fmt::Display for ScopeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScopeState::Active => "active",
            ScopeState::Committing => "committing",
            ScopeState::Committed => "committed",
            ScopeState::RollingBack => "rolling_back",
            ScopeState::RolledBack => "rolled_back",
            ScopeState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// How an operation is expected to behave, for logging/observer purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    Write,
    ReadOnly,
}

type CommitFn = Box<dyn FnOnce(&rusqlite::Transaction) -> rusqlite::Result<Box<dyn std::any::Any + Send>> + Send>;
type InverseFn = Box<dyn FnOnce(&rusqlite::Transaction, &(dyn std::any::Any + Send)) -> rusqlite::Result<()> + Send>;

/// A single unit of work queued onto a [`TransactionScope`].
///
/// `commit` runs against the scope's transaction and returns an opaque
/// output; `inverse`, if present, is handed that same output when a later
/// operation fails and this one must be undone.
pub struct Operation {
    pub op_id: Uuid,
    pub description: String,
    pub exec_mode: ExecMode,
    commit: CommitFn,
    inverse: Option<InverseFn>,
}

impl Operation {
    /// Builds an operation with no inverse — failures after this operation
    /// still roll back the whole transaction, but nothing runs to compensate
    /// for it individually (the transaction rollback itself is sufficient
    /// when every operation shares the one scope).
    pub fn new<F, T>(description: impl Into<String>, exec_mode: ExecMode, commit: F) -> Self
    where
        F: FnOnce(&rusqlite::Transaction) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        Operation {
            op_id: Uuid::new_v4(),
            description: description.into(),
            exec_mode,
            commit: Box::new(move |tx| commit(tx).map(|v| Box::new(v) as Box<dyn std::any::Any + Send>)),
            inverse: None,
        }
    }

    /// Attaches a compensating action, run with this operation's own output
    /// if a later operation in the same scope fails.
    pub fn with_inverse<F, T>(mut self, inverse: F) -> Self
    where
        F: FnOnce(&rusqlite::Transaction, &T) -> rusqlite::Result<()> + Send + 'static,
        T: Send + 'static,
    {
        self.inverse = Some(Box::new(move |tx, out| {
            let out = out
                .downcast_ref::<T>()
                .expect("inverse closure type matches the commit closure's output type");
            inverse(tx, out)
        }));
        self
    }
}

/// Hooks observing a scope's lifecycle. All methods default to no-ops;
/// implement only the ones a caller cares about.
pub trait ScopeObserver: Send + Sync {
    fn before_commit(&self, _op: &Operation) {}
    fn after_commit(&self, _op: &Operation) {}
    fn before_rollback(&self, _op: &Operation) {}
    fn after_rollback(&self, _op: &Operation) {}
}

struct NoopObserver;
impl ScopeObserver for NoopObserver {}

/// Chains a sequence of operations under one SQLite transaction, with
/// inverse-based compensation on failure.
pub struct TransactionScope {
    conn: Connection,
    observer: Box<dyn ScopeObserver>,
    operations: Vec<Operation>,
    state: ScopeState,
    finished: bool,
}

impl TransactionScope {
    pub fn new(conn: Connection) -> Self {
        TransactionScope {
            conn,
            observer: Box::new(NoopObserver),
            operations: Vec::new(),
            state: ScopeState::Active,
            finished: false,
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn ScopeObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Queues an operation. Only valid while the scope is still `Active`.
    pub fn push(&mut self, op: Operation) {
        assert_eq!(self.state, ScopeState::Active, "cannot push onto a scope that has already run");
        self.operations.push(op);
    }

    pub fn state(&self) -> ScopeState {
        self.state
    }

    /// Runs every queued operation in order under `BEGIN IMMEDIATE`.
    ///
    /// On success, commits and transitions to `Committed`. On failure,
    /// unwinds the undo stack (running inverses against the still-open
    /// transaction), rolls back, and transitions to `Failed` — the original
    /// error, plus any error raised while unwinding, surfaces as
    /// `Error::Aggregate`.
    pub async fn commit(mut self) -> Result<()> {
        self.state = ScopeState::Committing;
        let mut operations = std::mem::take(&mut self.operations);
        let observer = std::mem::replace(&mut self.observer, Box::new(NoopObserver));
        let result = self
            .conn
            .call(move |db| {
                let tx = db.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                let observer = observer;
                let mut undo_stack: Vec<(InverseFn, Box<dyn std::any::Any + Send>, String)> = Vec::new();

                for op in operations.drain(..) {
                    let Operation { description, commit, inverse, .. } = op;
                    let placeholder = Operation {
                        op_id: Uuid::nil(),
                        description: description.clone(),
                        exec_mode: ExecMode::Write,
                        commit: Box::new(|_| unreachable!()),
                        inverse: None,
                    };
                    observer.before_commit(&placeholder);
                    match commit(&tx) {
                        Ok(output) => {
                            observer.after_commit(&placeholder);
                            if let Some(inv) = inverse {
                                undo_stack.push((inv, output, description));
                            }
                        }
                        Err(e) => {
                            let mut causes = Vec::new();
                            while let Some((inv, output, desc)) = undo_stack.pop() {
                                let marker = Operation {
                                    op_id: Uuid::nil(),
                                    description: desc,
                                    exec_mode: ExecMode::Write,
                                    commit: Box::new(|_| unreachable!()),
                                    inverse: None,
                                };
                                observer.before_rollback(&marker);
                                if let Err(undo_err) = inv(&tx, output.as_ref()) {
                                    causes.push(Error::storage("rollback_inverse", undo_err));
                                }
                                observer.after_rollback(&marker);
                            }
                            let _ = tx.rollback();
                            return Err(rusqlite::Error::UserFunctionError(Box::new(ScopeFailure {
                                primary: Error::storage("commit", e),
                                causes,
                            })));
                        }
                    }
                }

                tx.commit()?;
                Ok(())
            })
            .await;

        self.finished = true;
        match result {
            Ok(()) => {
                self.state = ScopeState::Committed;
                Ok(())
            }
            Err(tokio_rusqlite::Error::Error(rusqlite::Error::UserFunctionError(boxed))) => {
                self.state = ScopeState::Failed;
                match boxed.downcast::<ScopeFailure>() {
                    Ok(failure) => Err(Error::Aggregate {
                        primary: Box::new(failure.primary),
                        causes: failure.causes,
                    }),
                    Err(other) => Err(Error::storage("commit", rusqlite::Error::UserFunctionError(other))),
                }
            }
            Err(e) => {
                self.state = ScopeState::Failed;
                Err(Error::connection("commit", e))
            }
        }
    }

    /// Explicitly rolls back without attempting any operation — used when a
    /// caller decides not to proceed after queuing work.
    pub async fn rollback(mut self) -> Result<()> {
        self.state = ScopeState::RollingBack;
        self.operations.clear();
        self.finished = true;
        self.state = ScopeState::RolledBack;
        Ok(())
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        if !self.finished && self.state == ScopeState::Active {
            tracing::error!(
                "TransactionScope dropped while still active without an explicit \
                 commit().await or rollback().await; its transaction was never \
                 resolved by this scope"
            );
        }
    }
}

#[derive(Debug)]
struct ScopeFailure {
    primary: Error,
    causes: Vec<Error>,
}

impl fmt::Display for ScopeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.primary)
    }
}

impl std::error::Error for ScopeFailure {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PragmaConfig;

    async fn open_conn() -> (tempfile::TempDir, Connection) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("txn.db");
        let conn = Connection::open(&path).await.unwrap();
        let cfg = PragmaConfig::default();
        conn.call(move |db| -> rusqlite::Result<()> {
            cfg.apply(db)?;
            db.execute_batch("CREATE TABLE counters (name TEXT PRIMARY KEY, value INTEGER NOT NULL)")?;
            db.execute(
                "INSERT INTO counters (name, value) VALUES ('n', 0)",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();
        (dir, conn)
    }

    #[tokio::test]
    async fn all_operations_commit_together() {
        let (_dir, conn) = open_conn().await;
        let mut scope = TransactionScope::new(conn);
        scope.push(Operation::new("bump by 1", ExecMode::Write, |tx| {
            tx.execute("UPDATE counters SET value = value + 1 WHERE name = 'n'", [])
        }));
        scope.push(Operation::new("bump by 2", ExecMode::Write, |tx| {
            tx.execute("UPDATE counters SET value = value + 2 WHERE name = 'n'", [])
        }));
        scope.commit().await.unwrap();
    }

    #[tokio::test]
    async fn failure_runs_inverses_and_rolls_back() {
        let (_dir, conn) = open_conn().await;
        let conn2 = conn.clone();
        let mut scope = TransactionScope::new(conn);

        scope.push(
            Operation::new("bump by 5", ExecMode::Write, |tx| {
                tx.execute("UPDATE counters SET value = value + 5 WHERE name = 'n'", [])?;
                Ok(5i64)
            })
            .with_inverse(|tx, _delta: &i64| {
                tx.execute("UPDATE counters SET value = value - 5 WHERE name = 'n'", [])?;
                Ok(())
            }),
        );
        scope.push(Operation::new("force failure", ExecMode::Write, |tx| {
            tx.execute("UPDATE missing_table SET value = 1", [])
        }));

        let err = scope.commit().await.unwrap_err();
        assert!(matches!(err, Error::Aggregate { .. }));

        let value: i64 = conn2
            .call(|db| Ok::<i64, rusqlite::Error>(db.query_row("SELECT value FROM counters WHERE name = 'n'", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(value, 0, "rolled-back transaction must leave the counter untouched");
    }
}
