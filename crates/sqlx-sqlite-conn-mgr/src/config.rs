//! Configuration for connection queues, the transaction pool and lock retry

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration shared by every connection opened through a [`PoolRegistry`]
///
/// # Examples
///
/// ```
/// use sqlx_sqlite_conn_mgr::SqliteDatabaseConfig;
///
/// // Use defaults
/// let config = SqliteDatabaseConfig::default();
/// assert_eq!(config.max_pooled_connections, 5);
///
/// // Override just one field
/// let config = SqliteDatabaseConfig {
///     max_pooled_connections: 2,
///     ..Default::default()
/// };
/// ```
///
/// [`PoolRegistry`]: crate::PoolRegistry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteDatabaseConfig {
   /// Maximum number of auxiliary connections handed out to transactions
   /// at the same time for one database path
   ///
   /// Transaction requests beyond this limit wait in FIFO order until a
   /// connection is released.
   ///
   /// Default: 5
   pub max_pooled_connections: u32,

   /// Delay before retrying an operation that hit a lock while it was the only
   /// connection open for its path (in milliseconds)
   ///
   /// Also bounds how long a queued lock retry waits before trying again on its own.
   ///
   /// Default: 50
   pub lock_retry_delay_ms: u64,

   /// How long a released pooled connection stays open so a new transaction can
   /// reclaim it instead of opening a fresh one (in milliseconds)
   ///
   /// Default: 3000
   pub closing_grace_period_ms: u64,

   /// Maximum number of lock retries for a single operation
   ///
   /// `None` retries until the lock clears or the connection is closed.
   ///
   /// Default: None
   pub max_lock_retries: Option<u32>,

   /// Log every statement dispatched to the engine at debug level
   ///
   /// Default: false
   pub trace: bool,
}

impl SqliteDatabaseConfig {
   pub fn lock_retry_delay(&self) -> Duration {
      Duration::from_millis(self.lock_retry_delay_ms)
   }

   pub fn closing_grace_period(&self) -> Duration {
      Duration::from_millis(self.closing_grace_period_ms)
   }
}

impl Default for SqliteDatabaseConfig {
   fn default() -> Self {
      Self {
         max_pooled_connections: 5,
         lock_retry_delay_ms: 50,
         closing_grace_period_ms: 3000,
         max_lock_retries: None,
         trace: false,
      }
   }
}
