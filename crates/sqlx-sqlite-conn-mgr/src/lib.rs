//! # sqlx-sqlite-conn-mgr
//!
//! Serialized SQLite connections with lock-aware retry and a per-path pool of
//! auxiliary connections for transactions, built on SQLx.
//!
//! ## Core Types
//!
//! - **[`Connection`]**: One native connection driven through its own FIFO work queue
//! - **[`PoolRegistry`]**: Opens primary connections and leases pooled ones, per database path
//! - **[`Lease`]**: RAII handle on a connection handed out for a transaction
//! - **[`SerialWorkQueue`]**: The queue underneath every connection
//! - **[`SqliteDatabaseConfig`]**: Pool limit, retry delay and closing grace period
//! - **[`Error`]**: Error type for database operations
//!
//! ## Architecture
//!
//! - **One operation at a time**: every operation on a connection runs in submission
//!   order on a task that owns the native handle; a failed operation never stalls the queue
//! - **Cancellation follows the caller**: dropping an operation's future before it is
//!   dispatched skips it, and dropping it mid-flight abandons it
//! - **No busy waiting in the engine**: `SQLITE_BUSY` / `SQLITE_LOCKED` are retried
//!   on the queue, either after a fixed delay (sole connection to the path) or when
//!   another connection to the path finishes a unit of work
//! - **Bounded pool**: at most `max_pooled_connections` auxiliary connections per path;
//!   further requests wait in FIFO order. Released connections linger for a grace
//!   period so they can be reclaimed instead of reopened
//!
//! ## Usage
//!
//! ```no_run
//! use sqlx_sqlite_conn_mgr::{Args, PoolRegistry};
//!
//! #[tokio::main]
//! async fn main() -> sqlx_sqlite_conn_mgr::Result<()> {
//!     let registry = PoolRegistry::new(None);
//!     let conn = registry.open("example.db").await?;
//!
//!     conn.run("CREATE TABLE IF NOT EXISTS users (id INTEGER PRIMARY KEY, name TEXT)", ()).await?;
//!     conn.run("INSERT INTO users (name) VALUES (?)", Args::positional(["Alice"])).await?;
//!
//!     let rows = conn.all("SELECT name FROM users", ()).await?;
//!     assert_eq!(rows[0]["name"].as_str(), Some("Alice"));
//!
//!     conn.close().await?;
//!     Ok(())
//! }
//! ```
//!
mod config;
mod connection;
mod error;
mod gateway;
mod pool;
mod queue;
mod retry;
mod value;

// Re-export public types
pub use config::SqliteDatabaseConfig;
pub use connection::{Connection, Role};
pub use error::{EngineError, Error, SQLITE_BUSY, SQLITE_BUSY_SNAPSHOT, SQLITE_LOCKED};
pub use pool::{Initializer, Lease, PoolRegistry, PoolStats, initializer};
pub use queue::SerialWorkQueue;
pub use retry::RetryStrategy;
pub use value::{Args, Row, RunResult, Statement, Value};

/// A type alias for Results with our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
