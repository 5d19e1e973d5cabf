//! # sqlx-sqlite-txn
//!
//! Asynchronous SQLite access with serialized per-connection work queues,
//! lock-aware retry, and transactions run on a bounded pool of auxiliary
//! connections.
//!
//! A [`Database`] owns a primary connection for ordinary statements. Each
//! transaction leases a pooled connection for the same path (up to
//! `max_pooled_connections` at once; further transactions wait in FIFO order),
//! issues `BEGIN`, runs the caller's unit of work, and finishes with exactly one
//! `COMMIT` or `ROLLBACK`.
//!
//! ```no_run
//! use sqlx_sqlite_txn::{Args, Database, Error, IsolationMode};
//!
//! # async fn example() -> Result<(), Error> {
//! let db = Database::connect("app.db", None).await?;
//! db.run("CREATE TABLE IF NOT EXISTS items (id INTEGER PRIMARY KEY, name TEXT)", ()).await?;
//!
//! let count = db
//!    .transaction(|conn| async move {
//!       conn.run("INSERT INTO items (name) VALUES (:name)", Args::named([("name", "a")])).await?;
//!       let row = conn.one("SELECT COUNT(*) AS n FROM items", ()).await?;
//!       Ok::<_, Error>(row.and_then(|row| row["n"].as_i64()).unwrap_or(0))
//!    })
//!    .mode(IsolationMode::Immediate)
//!    .await?;
//! # Ok(())
//! # }
//! ```

mod builders;
mod error;
mod transactions;
mod wrapper;

pub use builders::TransactionBuilder;
pub use error::{Error, Result};
pub use transactions::{IsolationMode, TransactionState, with_transaction};
pub use wrapper::Database;

pub use sqlx_sqlite_conn_mgr::{
   Args, Connection, Initializer, Lease, PoolRegistry, PoolStats, Row, RunResult,
   SqliteDatabaseConfig, Value, initializer,
};
