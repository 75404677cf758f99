//! Driver binary over `epochstore-core`: creates a database's schema and
//! exercises versioned writes through a demo entity.
//!
//! Kept deliberately thin — every real decision (concurrency, versioning,
//! rollback) lives in the library; this binary only wires a `clap` surface
//! onto it the way a smoke-test harness would.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use epochstore_core::{open_store, Entity as _, EntityDerive, Mapper as _, PragmaConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// A minimal demo entity used only to exercise the provider end to end.
/// Real callers define their own `#[derive(Entity)]` structs.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, EntityDerive)]
#[entity(table = "demo_counters")]
struct DemoCounter {
    #[primary_key]
    #[column(name = "id")]
    id: String,
    #[column(name = "value")]
    value: i64,
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

#[derive(Parser)]
#[command(name = "epochstore", about = "Schema init and write-loop driver for epochstore-core")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database file and every table the core owns.
    Init {
        #[arg(long)]
        db_path: PathBuf,
    },
    /// Run `loops` create-then-update cycles against a demo counter entity.
    Update {
        #[arg(long)]
        db_path: PathBuf,
        #[arg(long)]
        loops: u32,
        /// Abort mid transaction-scope partway through, to exercise rollback.
        #[arg(long)]
        simulate_crash: bool,
    },
}

/// Exit code used when `--simulate-crash` fired as requested (not a real failure).
const EXIT_SIMULATED_CRASH: i32 = 99;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let code = match run().await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %err, "epochstore-cli failed");
            eprintln!("error: {err:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run() -> anyhow::Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { db_path } => {
            init(db_path).await?;
            Ok(0)
        }
        Command::Update { db_path, loops, simulate_crash } => update(db_path, loops, simulate_crash).await,
    }
}

async fn init(db_path: PathBuf) -> anyhow::Result<()> {
    let pool = open_store(db_path.clone(), PragmaConfig::default(), 4).await?;
    let conn = pool.acquire().await?;
    let ddl = epochstore_core::ddl::render_schema(DemoCounter::descriptor());
    conn.call(move |db| {
        db.execute_batch(&ddl)?;
        Ok(())
    })
    .await
    .map_err(|e| epochstore_core::Error::connection("init", e))?;
    tracing::info!(path = %db_path.display(), "schema initialised");
    Ok(())
}

async fn update(db_path: PathBuf, loops: u32, simulate_crash: bool) -> anyhow::Result<i32> {
    let pool = open_store(db_path.clone(), PragmaConfig::default(), 4).await?;
    let conn = pool.acquire().await?;
    let ddl = epochstore_core::ddl::render_schema(DemoCounter::descriptor());
    conn.call(move |db| {
        db.execute_batch(&ddl)?;
        Ok(())
    })
    .await
    .map_err(|e| epochstore_core::Error::connection("init", e))?;
    drop(conn);

    let audit = Arc::new(epochstore_core::audit::AuditSink::new(pool.clone()));
    let provider = epochstore_core::PersistenceProvider::<DemoCounter>::new(pool.clone(), audit).await?;
    let token = CancellationToken::new();

    let id = uuid::Uuid::new_v4().to_string();
    let now = now_unix();
    let mut current = provider
        .create(
            DemoCounter {
                id: id.clone(),
                value: 0,
                version: 0,
                is_deleted: false,
                created_time: now,
                last_write_time: now,
            },
            &token,
        )
        .await?;

    for i in 0..loops {
        if simulate_crash && i == loops / 2 {
            tracing::warn!(iteration = i, "simulating a crash mid write-loop");
            let conn = pool.open_side_connection().await?;
            let mut scope = epochstore_core::txn::TransactionScope::new(conn);
            let crash_id = id.clone();
            scope.push(epochstore_core::txn::Operation::new(
                "bump demo counter value",
                epochstore_core::txn::ExecMode::Write,
                move |tx| tx.execute("UPDATE demo_counters SET value = value + 1 WHERE id = ?1", [crash_id]),
            ));
            scope.push(epochstore_core::txn::Operation::new(
                "simulated crash",
                epochstore_core::txn::ExecMode::Write,
                |tx| tx.execute("UPDATE no_such_table SET value = 1", []),
            ));
            let err = scope.commit().await.unwrap_err();
            tracing::warn!(error = %err, iteration = i, "transaction scope rolled back after simulated crash");
            return Ok(EXIT_SIMULATED_CRASH);
        }
        let original_version = current.version();
        current.value += 1;
        current = provider.update(current, original_version, &token).await?;
        tracing::info!(iteration = i, value = current.value, version = current.version(), "counter updated");
    }

    Ok(0)
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is after the unix epoch")
        .as_secs() as i64
}
