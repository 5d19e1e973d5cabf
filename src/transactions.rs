//! Transaction coordination: BEGIN / COMMIT / ROLLBACK around a unit of work

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use sqlx_sqlite_conn_mgr::{Args, Connection, Initializer, Lease, PoolRegistry};
use tracing::{debug, trace, warn};

use crate::Error;

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// When a transaction takes its locks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
   /// Locks are taken by the first read or write
   #[default]
   Deferred,
   /// A write lock is taken by BEGIN
   Immediate,
   /// An exclusive lock is taken by BEGIN
   Exclusive,
}

impl IsolationMode {
   pub fn as_sql(&self) -> &'static str {
      match self {
         IsolationMode::Deferred => "DEFERRED",
         IsolationMode::Immediate => "IMMEDIATE",
         IsolationMode::Exclusive => "EXCLUSIVE",
      }
   }

   fn begin_statement(&self) -> &'static str {
      match self {
         IsolationMode::Deferred => "BEGIN DEFERRED TRANSACTION",
         IsolationMode::Immediate => "BEGIN IMMEDIATE TRANSACTION",
         IsolationMode::Exclusive => "BEGIN EXCLUSIVE TRANSACTION",
      }
   }
}

impl fmt::Display for IsolationMode {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.as_sql())
   }
}

/// Lifecycle of a transaction driven by [`with_transaction`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
   Idle,
   AcquiringConnection,
   Began,
   Running,
   Committing,
   RollingBack,
   Released,
}

/// The connection a transaction runs on, and what is still owed on it
///
/// Dropped before COMMIT or ROLLBACK completes (the caller gave up on the
/// transaction future), it queues a ROLLBACK on the connection and releases the
/// lease.
struct TransactionHandle {
   id: u64,
   mode: IsolationMode,
   state: TransactionState,
   conn: Connection,
   lease: Option<Lease>,
   needs_rollback: bool,
}

impl TransactionHandle {
   fn new(id: u64, mode: IsolationMode, lease: Lease) -> Self {
      Self {
         id,
         mode,
         state: TransactionState::AcquiringConnection,
         conn: lease.connection().clone(),
         lease: Some(lease),
         needs_rollback: false,
      }
   }

   fn transition(&mut self, next: TransactionState) {
      trace!("Transaction {}: {:?} -> {:?}", self.id, self.state, next);
      self.state = next;
   }

   async fn begin(&mut self) -> sqlx_sqlite_conn_mgr::Result<()> {
      // Owed from the moment BEGIN may have reached the engine
      self.needs_rollback = true;

      match self.conn.run(self.mode.begin_statement(), Args::none()).await {
         Ok(_) => {
            self.transition(TransactionState::Began);
            Ok(())
         }
         Err(e) => {
            self.needs_rollback = false;
            Err(e)
         }
      }
   }

   async fn commit(&mut self) -> sqlx_sqlite_conn_mgr::Result<()> {
      self.transition(TransactionState::Committing);
      self.conn.run("COMMIT TRANSACTION", Args::none()).await?;
      self.needs_rollback = false;
      Ok(())
   }

   /// Roll back, logging rather than surfacing a failure so the caller sees the
   /// error that caused the rollback
   async fn rollback(&mut self) {
      self.transition(TransactionState::RollingBack);
      if let Err(e) = self.conn.run("ROLLBACK TRANSACTION", Args::none()).await {
         warn!("Rollback of transaction {} failed: {}", self.id, e);
      }
      self.needs_rollback = false;
   }

   fn release(&mut self) {
      if let Some(lease) = self.lease.take() {
         lease.release();
      }
      self.transition(TransactionState::Released);
   }
}

impl Drop for TransactionHandle {
   fn drop(&mut self) {
      if self.needs_rollback {
         debug!(
            "Transaction {} dropped in state {:?}; queueing rollback",
            self.id, self.state
         );
         if let Err(e) = self.conn.run_detached("rollback", "ROLLBACK TRANSACTION") {
            warn!("Could not queue rollback for transaction {}: {}", self.id, e);
         }
      }
      if self.lease.is_some() {
         self.release();
      }
   }
}

/// Run `unit` inside a transaction
///
/// A connection is leased from `registry`: a pooled connection for `primary`'s
/// path when `use_new_connection` is set (and the database is not in-memory),
/// otherwise `primary` itself. `initializer` runs once on a freshly opened pooled
/// connection. The unit of work receives the transaction's connection; every
/// operation it issues on it runs between BEGIN and the terminal statement.
///
/// On success the transaction is committed and the unit's value returned. If the
/// unit fails, or COMMIT fails, the transaction is rolled back and that error is
/// returned; a failing ROLLBACK is logged, never returned. A panic in the unit
/// rolls back and releases the connection before the panic resumes.
///
/// # Example
///
/// ```no_run
/// use sqlx_sqlite_conn_mgr::{Args, PoolRegistry};
/// use sqlx_sqlite_txn::{Error, IsolationMode, with_transaction};
///
/// # async fn example() -> Result<(), Error> {
/// let registry = PoolRegistry::new(None);
/// let primary = registry.open("app.db").await?;
///
/// let id = with_transaction(
///    &registry,
///    &primary,
///    |conn| async move {
///       let result = conn
///          .run("INSERT INTO users (name) VALUES (?)", Args::positional(["Alice"]))
///          .await?;
///       Ok::<_, Error>(result.last_insert_id)
///    },
///    IsolationMode::Immediate,
///    true,
///    None,
/// )
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn with_transaction<T, E, F, Fut>(
   registry: &PoolRegistry,
   primary: &Connection,
   unit: F,
   mode: IsolationMode,
   use_new_connection: bool,
   initializer: Option<&Initializer>,
) -> std::result::Result<T, E>
where
   F: FnOnce(Connection) -> Fut,
   Fut: Future<Output = std::result::Result<T, E>>,
   E: From<Error>,
{
   let id = NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed);
   trace!(
      "Transaction {}: {:?} -> {:?}",
      id,
      TransactionState::Idle,
      TransactionState::AcquiringConnection
   );

   let wants_new_connection = use_new_connection && !primary.is_memory();
   let lease = registry
      .acquire(primary, wants_new_connection, initializer)
      .await
      .map_err(|e| E::from(Error::from(e)))?;

   let mut handle = TransactionHandle::new(id, mode, lease);
   debug!(
      "Transaction {} on {} connection {} ({})",
      id,
      if wants_new_connection { "pooled" } else { "primary" },
      handle.conn.id(),
      mode
   );

   if let Err(e) = handle.begin().await {
      handle.release();
      return Err(E::from(Error::from(e)));
   }

   handle.transition(TransactionState::Running);
   let conn = handle.conn.clone();
   let outcome = AssertUnwindSafe(async move { unit(conn).await })
      .catch_unwind()
      .await;

   match outcome {
      Ok(Ok(value)) => match handle.commit().await {
         Ok(()) => {
            handle.release();
            debug!("Transaction {} committed", id);
            Ok(value)
         }
         Err(e) => {
            warn!("Commit of transaction {} failed: {}", id, e);
            handle.rollback().await;
            handle.release();
            Err(E::from(Error::from(e)))
         }
      },
      Ok(Err(e)) => {
         handle.rollback().await;
         handle.release();
         debug!("Transaction {} rolled back", id);
         Err(e)
      }
      Err(panic) => {
         warn!("Unit of work panicked in transaction {}; rolling back", id);
         handle.rollback().await;
         handle.release();
         std::panic::resume_unwind(panic)
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_begin_statements() {
      assert_eq!(IsolationMode::default(), IsolationMode::Deferred);
      assert_eq!(IsolationMode::Deferred.begin_statement(), "BEGIN DEFERRED TRANSACTION");
      assert_eq!(IsolationMode::Immediate.begin_statement(), "BEGIN IMMEDIATE TRANSACTION");
      assert_eq!(IsolationMode::Exclusive.begin_statement(), "BEGIN EXCLUSIVE TRANSACTION");
   }

   #[test]
   fn test_isolation_mode_serde() {
      let mode: IsolationMode = serde_json::from_str(r#""immediate""#).unwrap();
      assert_eq!(mode, IsolationMode::Immediate);
      assert_eq!(serde_json::to_string(&IsolationMode::Exclusive).unwrap(), r#""exclusive""#);
   }
}
