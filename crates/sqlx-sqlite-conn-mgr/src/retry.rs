//! Retry policy for operations that hit `SQLITE_BUSY` / `SQLITE_LOCKED`

use std::sync::{Arc, Weak};
use std::time::Duration;

use sqlx::sqlite::SqliteConnection;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::Result;
use crate::config::SqliteDatabaseConfig;
use crate::error::Error;
use crate::gateway;
use crate::pool::PoolEntry;

/// How a locked operation waits before its next attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
   /// Park in the path's waiter queue until another connection finishes a unit
   /// of work
   Queued,
   /// Sleep for a fixed delay
   Delayed(Duration),
}

impl RetryStrategy {
   /// Queue behind other work when other connections to the same path are
   /// open; otherwise nobody would wake us, so wait out a delay.
   pub fn for_open_connections(open_connections: usize, delay: Duration) -> Self {
      if open_connections > 1 {
         RetryStrategy::Queued
      } else {
         RetryStrategy::Delayed(delay)
      }
   }
}

/// Lock retry state for one operation
///
/// A retry woken from the path's waiter queue owes the queue one wake. It is
/// passed on when the retry parks again, or when the policy is dropped with the
/// operation finished or abandoned.
pub(crate) struct LockRetryPolicy {
   delay: Duration,
   max_retries: Option<u32>,
   pool: Weak<PoolEntry>,
   shutdown: watch::Receiver<bool>,
   owes_wake: bool,
}

impl LockRetryPolicy {
   pub(crate) fn new(
      config: &SqliteDatabaseConfig,
      pool: Weak<PoolEntry>,
      shutdown: watch::Receiver<bool>,
   ) -> Self {
      Self {
         delay: config.lock_retry_delay(),
         max_retries: config.max_lock_retries,
         pool,
         shutdown,
         owes_wake: false,
      }
   }

   /// Wait until the operation that failed with `err` should be attempted again
   ///
   /// Returns `err` once the retry limit is reached, or [`Error::Cancelled`] if the
   /// connection starts closing while waiting.
   pub(crate) async fn wait(
      &mut self,
      conn: &mut SqliteConnection,
      attempt: u32,
      err: Error,
   ) -> Result<()> {
      if self.max_retries.is_some_and(|max| attempt >= max) {
         warn!("Giving up after {} lock retries: {}", attempt, err);
         return Err(err);
      }

      let delay = self.delay;
      let owes_wake = self.owes_wake;
      let entry: Option<Arc<PoolEntry>> = self.pool.upgrade();
      let open_connections = entry.as_ref().map_or(1, |entry| entry.open_connections());
      let strategy = RetryStrategy::for_open_connections(open_connections, delay);
      debug!("Lock retry {} ({:?}): {}", attempt + 1, strategy, err);

      // Resolves to whether a wake is owed to the queue afterwards
      let pause = async move {
         match (strategy, entry) {
            (RetryStrategy::Queued, Some(entry)) => {
               // In autocommit mode this connection holds no locks and will never
               // COMMIT or ROLLBACK, so it wakes whoever is queued ahead itself
               let autocommit = gateway::autocommit(conn).await.unwrap_or(true);
               let (woken, still_owed) = entry.park_retry(autocommit, owes_wake);
               drop(entry);

               // Fall back to polling in case no unit of work ever finishes
               let woken = matches!(tokio::time::timeout(delay, woken).await, Ok(Ok(())));
               still_owed || woken
            }
            _ => {
               tokio::time::sleep(delay).await;
               owes_wake
            }
         }
      };

      let owes_wake = tokio::select! {
         owes_wake = pause => Ok(owes_wake),
         _ = self.shutdown.wait_for(|closing| *closing) => Err(Error::Cancelled),
      };
      self.owes_wake = owes_wake?;
      Ok(())
   }
}

impl Drop for LockRetryPolicy {
   fn drop(&mut self) {
      if self.owes_wake
         && let Some(entry) = self.pool.upgrade()
      {
         entry.wake_next();
      }
   }
}
