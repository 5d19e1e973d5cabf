//! Per-path pool of auxiliary connections handed out to transactions
//!
//! Each database path gets a [`PoolEntry`] holding the number of pooled
//! connections currently handed out, the FIFO of callers waiting for one (shared
//! with lock retries), and the released connections waiting out their closing
//! grace period. All bookkeeping happens under the entry's lock and never across
//! an await point.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::Result;
use crate::config::SqliteDatabaseConfig;
use crate::connection::{Connection, Role, is_memory_database};
use crate::error::Error;

/// Setup run once on every freshly opened pooled connection before it is handed
/// out (e.g. PRAGMA configuration)
pub type Initializer =
   Arc<dyn for<'a> Fn(&'a Connection) -> BoxFuture<'a, Result<()>> + Send + Sync>;

/// Wrap a closure as an [`Initializer`]
///
/// ```
/// use sqlx_sqlite_conn_mgr::{Connection, initializer};
///
/// let init = initializer(|conn: &Connection| {
///    Box::pin(async move { conn.run("PRAGMA foreign_keys = ON", ()).await.map(|_| ()) })
/// });
/// ```
pub fn initializer<F>(f: F) -> Initializer
where
   F: for<'a> Fn(&'a Connection) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
{
   Arc::new(f)
}

/// Registry of pool entries, keyed by database path
///
/// Every primary connection that should coordinate transactions and lock retries
/// with the others must be opened through the same registry.
///
/// # Example
///
/// ```no_run
/// use sqlx_sqlite_conn_mgr::{Args, PoolRegistry};
///
/// # async fn example() -> sqlx_sqlite_conn_mgr::Result<()> {
/// let registry = PoolRegistry::new(None);
/// let primary = registry.open("app.db").await?;
///
/// // Hand a separate connection to a transaction
/// let lease = registry.acquire(&primary, true, None).await?;
/// lease.run("BEGIN IMMEDIATE TRANSACTION", Args::none()).await?;
/// lease.run("COMMIT TRANSACTION", Args::none()).await?;
/// registry.release(lease);
/// # Ok(())
/// # }
/// ```
pub struct PoolRegistry {
   config: Arc<SqliteDatabaseConfig>,
   entries: Mutex<HashMap<PathBuf, Arc<PoolEntry>>>,
}

impl PoolRegistry {
   /// Create a registry. Pass `None` to use the default configuration.
   pub fn new(custom_config: Option<SqliteDatabaseConfig>) -> Arc<Self> {
      Arc::new(Self {
         config: Arc::new(custom_config.unwrap_or_default()),
         entries: Mutex::new(HashMap::new()),
      })
   }

   pub fn config(&self) -> &SqliteDatabaseConfig {
      &self.config
   }

   /// Open a primary connection to `path`
   ///
   /// The database file is created if it doesn't exist. In-memory databases are
   /// never registered: each one is private to its connection.
   pub async fn open(&self, path: impl AsRef<Path>) -> Result<Connection> {
      let path = path.as_ref();

      if is_memory_database(path) {
         return Connection::open(path, Arc::clone(&self.config), Role::Primary, None).await;
      }

      let entry = self.entry(path);
      let conn = Connection::open(
         path,
         Arc::clone(&self.config),
         Role::Primary,
         Some(Arc::downgrade(&entry)),
      )
      .await?;

      entry.register_primary();
      Ok(conn)
   }

   /// Obtain a connection for a transaction
   ///
   /// With `wants_new_connection` false, or for an in-memory database (which
   /// cannot be shared across connections), the primary connection itself is
   /// leased. Otherwise a pooled connection is reclaimed from its closing grace
   /// period or opened fresh, waiting in FIFO order while the path is at its
   /// connection limit. `initializer` runs once on a freshly opened connection.
   pub async fn acquire(
      &self,
      primary: &Connection,
      wants_new_connection: bool,
      initializer: Option<&Initializer>,
   ) -> Result<Lease> {
      if !wants_new_connection || primary.is_memory() {
         trace!("Leasing primary connection for {}", primary.path().display());
         return Ok(Lease::new(primary.clone(), false, primary.pool_entry()));
      }

      let entry = self.entry(primary.path());
      entry.acquire(initializer).await
   }

   /// Return a leased connection
   pub fn release(&self, lease: Lease) {
      lease.release();
   }

   /// Bookkeeping snapshot for `path`, if it has an entry
   pub fn stats(&self, path: impl AsRef<Path>) -> Option<PoolStats> {
      let entries = self.entries.lock();
      entries.get(path.as_ref()).map(|entry| entry.stats())
   }

   /// Drop entries with no connections, no waiters and no outstanding leases
   ///
   /// Returns the number of entries removed.
   pub fn prune(&self) -> usize {
      let mut entries = self.entries.lock();
      let before = entries.len();
      entries.retain(|_, entry| Arc::strong_count(entry) > 1 || !entry.is_unused());
      before - entries.len()
   }

   /// Close every pooled connection sitting in its closing grace period
   pub async fn shutdown(&self) {
      let entries: Vec<_> = self.entries.lock().values().cloned().collect();

      for entry in entries {
         let idle: Vec<_> = entry.state.lock().idle.drain(..).collect();
         for connection in idle {
            connection.timer.abort();
            if let Err(e) = connection.conn.close().await {
               warn!("Failed to close idle connection: {}", e);
            }
         }
      }
   }

   fn entry(&self, path: &Path) -> Arc<PoolEntry> {
      let mut entries = self.entries.lock();
      let entry = entries.entry(path.to_path_buf()).or_insert_with(|| {
         debug!("Creating pool entry for {}", path.display());
         Arc::new(PoolEntry::new(path.to_path_buf(), Arc::clone(&self.config)))
      });
      Arc::clone(entry)
   }
}

impl fmt::Debug for PoolRegistry {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("PoolRegistry")
         .field("config", &self.config)
         .field("paths", &self.entries.lock().len())
         .finish()
   }
}

/// Snapshot of one path's pool bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
   /// Open primary connections
   pub primaries: usize,
   /// Pooled connections currently handed out
   pub in_use: u32,
   /// Released pooled connections waiting out their grace period
   pub idle: usize,
   /// Queued acquisition requests and lock retries
   pub waiting: usize,
}

pub(crate) struct PoolEntry {
   path: PathBuf,
   config: Arc<SqliteDatabaseConfig>,
   state: Mutex<EntryState>,
}

#[derive(Default)]
struct EntryState {
   primaries: usize,
   in_use: u32,
   waiters: VecDeque<Waiter>,
   idle: Vec<IdleConnection>,
}

enum Waiter {
   /// A transaction waiting for capacity; resumed with a slot already reserved
   Acquire(oneshot::Sender<Reservation>),
   /// An operation that hit a lock and waits for another connection to finish
   Retry(oneshot::Sender<()>),
}

impl Waiter {
   /// Whoever parked this waiter is still waiting on it
   fn is_live(&self) -> bool {
      match self {
         Waiter::Acquire(tx) => !tx.is_closed(),
         Waiter::Retry(tx) => !tx.is_closed(),
      }
   }
}

struct IdleConnection {
   conn: Connection,
   timer: AbortHandle,
}

impl PoolEntry {
   pub(crate) fn new(path: PathBuf, config: Arc<SqliteDatabaseConfig>) -> Self {
      Self {
         path,
         config,
         state: Mutex::new(EntryState::default()),
      }
   }

   fn max_connections(&self) -> u32 {
      self.config.max_pooled_connections.max(1)
   }

   /// Connections currently doing work for this path: primaries plus pooled
   /// connections handed out to transactions
   pub(crate) fn open_connections(&self) -> usize {
      let state = self.state.lock();
      state.primaries + state.in_use as usize
   }

   pub(crate) fn register_primary(&self) {
      self.state.lock().primaries += 1;
   }

   pub(crate) fn unregister_primary(&self) {
      let mut state = self.state.lock();
      state.primaries = state.primaries.saturating_sub(1);
   }

   pub(crate) fn stats(&self) -> PoolStats {
      let state = self.state.lock();
      PoolStats {
         primaries: state.primaries,
         in_use: state.in_use,
         idle: state.idle.len(),
         waiting: state.waiters.iter().filter(|waiter| waiter.is_live()).count(),
      }
   }

   fn is_unused(&self) -> bool {
      let state = self.state.lock();
      state.primaries == 0 && state.in_use == 0 && state.idle.is_empty() && state.waiters.is_empty()
   }

   async fn acquire(self: &Arc<Self>, initializer: Option<&Initializer>) -> Result<Lease> {
      let reservation = match self.reserve() {
         Ok(reservation) => reservation,
         Err(granted) => {
            debug!(
               "Pool for {} at its limit of {}; waiting",
               self.path.display(),
               self.max_connections()
            );
            granted.await.map_err(|_| Error::Cancelled)?
         }
      };

      if let Some(conn) = self.take_idle() {
         debug!("Reclaimed idle connection for {}", self.path.display());
         return Ok(reservation.into_lease(conn));
      }

      let conn = Connection::open(
         &self.path,
         Arc::clone(&self.config),
         Role::Pooled,
         Some(Arc::downgrade(self)),
      )
      .await?;

      if let Some(initializer) = initializer
         && let Err(e) = initializer(&conn).await
      {
         warn!("Connection initializer failed for {}: {}", self.path.display(), e);
         let _ = conn.close().await;
         return Err(e);
      }

      Ok(reservation.into_lease(conn))
   }

   /// Reserve a slot, or queue for one when the path is at its limit
   fn reserve(
      self: &Arc<Self>,
   ) -> std::result::Result<Reservation, oneshot::Receiver<Reservation>> {
      let mut state = self.state.lock();
      if state.in_use < self.max_connections() {
         state.in_use += 1;
         Ok(Reservation::new(Arc::clone(self)))
      } else {
         let (tx, rx) = oneshot::channel();
         state.waiters.push_back(Waiter::Acquire(tx));
         Err(rx)
      }
   }

   fn take_idle(&self) -> Option<Connection> {
      let mut state = self.state.lock();
      while let Some(idle) = state.idle.pop() {
         idle.timer.abort();
         if idle.conn.is_open() {
            return Some(idle.conn);
         }
      }
      None
   }

   /// Give back a reserved slot that was never turned into a lease
   fn return_slot(self: &Arc<Self>) {
      let mut state = self.state.lock();
      state.in_use = state.in_use.saturating_sub(1);
      self.service(&mut state);
   }

   pub(crate) fn release(self: &Arc<Self>, conn: Connection, pooled: bool) {
      let mut state = self.state.lock();

      if pooled {
         state.in_use = state.in_use.saturating_sub(1);
         if conn.is_open()
            && let Some(timer) = self.schedule_close(&conn)
         {
            trace!("Connection {} released; closing after grace period", conn.id());
            state.idle.push(IdleConnection { conn, timer });
         }
      }

      self.service(&mut state);
   }

   /// Queue a lock retry behind the live waiters
   ///
   /// A connection in autocommit mode holds no locks and will never COMMIT or
   /// ROLLBACK, so it wakes the next waiter itself. `owes_wake` is set when the
   /// retry was itself woken from this queue and has not passed that wake on;
   /// it goes to an acquisition at the front that a slot is free for, and is
   /// kept otherwise.
   /// Returns the receiver to wait on and whether the wake is still owed.
   pub(crate) fn park_retry(
      self: &Arc<Self>,
      autocommit: bool,
      owes_wake: bool,
   ) -> (oneshot::Receiver<()>, bool) {
      let mut state = self.state.lock();
      // Retries that timed out leave their sender behind
      state.waiters.retain(Waiter::is_live);

      let acquisition_ready = matches!(state.waiters.front(), Some(Waiter::Acquire(_)))
         && state.in_use < self.max_connections();

      let owes_wake = if autocommit || (owes_wake && acquisition_ready) {
         self.service(&mut state);
         false
      } else {
         owes_wake
      };

      let (tx, rx) = oneshot::channel();
      state.waiters.push_back(Waiter::Retry(tx));
      (rx, owes_wake)
   }

   /// Hand one wake to the next live waiter
   pub(crate) fn wake_next(self: &Arc<Self>) {
      let mut state = self.state.lock();
      self.service(&mut state);
   }

   /// Wake the first live waiter: a queued lock retry, or an acquisition request
   /// once a slot is free
   fn service(self: &Arc<Self>, state: &mut EntryState) {
      while let Some(waiter) = state.waiters.pop_front() {
         match waiter {
            Waiter::Retry(tx) => {
               if tx.send(()).is_ok() {
                  break;
               }
            }
            Waiter::Acquire(tx) => {
               if tx.is_closed() {
                  continue;
               }
               if state.in_use >= self.max_connections() {
                  state.waiters.push_front(Waiter::Acquire(tx));
                  break;
               }

               state.in_use += 1;
               match tx.send(Reservation::new(Arc::clone(self))) {
                  Ok(()) => break,
                  Err(reservation) => {
                     // Waiter went away between the check and the send
                     reservation.disarm();
                     state.in_use -= 1;
                  }
               }
            }
         }
      }
   }

   fn schedule_close(self: &Arc<Self>, conn: &Connection) -> Option<AbortHandle> {
      let Ok(runtime) = tokio::runtime::Handle::try_current() else {
         return None;
      };

      let entry = Arc::downgrade(self);
      let id = conn.id();
      let grace = self.config.closing_grace_period();

      let task = runtime.spawn(async move {
         tokio::time::sleep(grace).await;
         let Some(entry) = entry.upgrade() else {
            return;
         };

         // Only one of this timer and a reclaim can take the connection
         let conn = {
            let mut state = entry.state.lock();
            state
               .idle
               .iter()
               .position(|idle| idle.conn.id() == id)
               .map(|index| state.idle.swap_remove(index).conn)
         };

         if let Some(conn) = conn {
            debug!("Closing idle connection {} for {}", id, entry.path.display());
            if let Err(e) = conn.close().await {
               warn!("Failed to close idle connection {}: {}", id, e);
            }
         }
      });

      Some(task.abort_handle())
   }
}

/// A slot counted against the path's limit, not yet bound to a connection
///
/// Dropping it unused gives the slot back and services the next waiter.
struct Reservation {
   entry: Arc<PoolEntry>,
   armed: bool,
}

impl Reservation {
   fn new(entry: Arc<PoolEntry>) -> Self {
      Self { entry, armed: true }
   }

   fn into_lease(mut self, conn: Connection) -> Lease {
      self.armed = false;
      Lease::new(conn, true, Some(Arc::clone(&self.entry)))
   }

   /// Drop without touching the entry; the caller fixes up the count itself
   fn disarm(mut self) {
      self.armed = false;
   }
}

impl Drop for Reservation {
   fn drop(&mut self) {
      if self.armed {
         self.entry.return_slot();
      }
   }
}

/// RAII lease on a connection handed out for a transaction
///
/// Derefs to [`Connection`]. The lease is returned to its pool entry by
/// [`release`](Lease::release) or, failing that, when dropped.
#[must_use = "if unused, the connection is immediately released"]
pub struct Lease {
   conn: Connection,
   pooled: bool,
   entry: Option<Arc<PoolEntry>>,
   released: bool,
}

impl Lease {
   fn new(conn: Connection, pooled: bool, entry: Option<Arc<PoolEntry>>) -> Self {
      Self {
         conn,
         pooled,
         entry,
         released: false,
      }
   }

   pub fn connection(&self) -> &Connection {
      &self.conn
   }

   /// Whether this is a pooled auxiliary connection rather than the primary
   pub fn is_pooled(&self) -> bool {
      self.pooled
   }

   /// Return the connection and wake the next waiter for its path
   pub fn release(mut self) {
      self.release_inner();
   }

   fn release_inner(&mut self) {
      if std::mem::replace(&mut self.released, true) {
         return;
      }
      if let Some(entry) = &self.entry {
         entry.release(self.conn.clone(), self.pooled);
      }
   }
}

impl Deref for Lease {
   type Target = Connection;

   fn deref(&self) -> &Self::Target {
      &self.conn
   }
}

impl Drop for Lease {
   fn drop(&mut self) {
      self.release_inner();
   }
}

impl fmt::Debug for Lease {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Lease")
         .field("conn", &self.conn)
         .field("pooled", &self.pooled)
         .finish()
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn entry(max: u32) -> Arc<PoolEntry> {
      let config = SqliteDatabaseConfig {
         max_pooled_connections: max,
         ..Default::default()
      };
      Arc::new(PoolEntry::new(PathBuf::from("unit.db"), Arc::new(config)))
   }

   #[test]
   fn test_reserve_until_limit_then_queue() {
      let entry = entry(2);

      let first = entry.reserve().ok().unwrap();
      let second = entry.reserve().ok().unwrap();
      let mut third = entry.reserve().err().unwrap();

      assert_eq!(entry.stats().in_use, 2);
      assert_eq!(entry.stats().waiting, 1);
      assert!(third.try_recv().is_err());

      // Dropping an unused reservation hands its slot straight to the waiter
      drop(first);
      let granted = third.try_recv().unwrap();
      assert_eq!(entry.stats().in_use, 2);
      assert_eq!(entry.stats().waiting, 0);

      drop(granted);
      drop(second);
      assert_eq!(entry.stats().in_use, 0);
   }

   #[test]
   fn test_waiters_are_served_in_order() {
      let entry = entry(1);
      let held = entry.reserve().ok().unwrap();

      let mut first = entry.reserve().err().unwrap();
      let mut second = entry.reserve().err().unwrap();

      drop(held);
      let granted = first.try_recv().unwrap();
      assert!(second.try_recv().is_err());

      drop(granted);
      assert!(second.try_recv().is_ok());
   }

   #[test]
   fn test_abandoned_waiter_is_skipped() {
      let entry = entry(1);
      let held = entry.reserve().ok().unwrap();

      let abandoned = entry.reserve().err().unwrap();
      let mut next = entry.reserve().err().unwrap();
      drop(abandoned);

      drop(held);
      assert!(next.try_recv().is_ok());
      assert_eq!(entry.stats().in_use, 1);
   }

   #[test]
   fn test_release_wakes_exactly_one_waiter() {
      let entry = entry(1);
      let held = entry.reserve().ok().unwrap();

      let (mut retry, _) = entry.park_retry(false, false);
      let mut acquire = entry.reserve().err().unwrap();

      drop(held);
      assert!(retry.try_recv().is_ok());
      assert!(acquire.try_recv().is_err());
      assert_eq!(entry.stats().waiting, 1);

      // The woken retry passes its wake on; retries never took the slot
      entry.wake_next();
      let granted = acquire.try_recv().unwrap();
      assert_eq!(entry.stats().in_use, 1);
      assert_eq!(entry.stats().waiting, 0);
      drop(granted);
   }

   #[test]
   fn test_autocommit_retry_services_waiters_ahead() {
      let entry = entry(1);
      let (mut earlier, _) = entry.park_retry(false, false);
      let (mut later, _) = entry.park_retry(true, false);

      assert!(earlier.try_recv().is_ok());
      assert!(later.try_recv().is_err());
      assert_eq!(entry.stats().waiting, 1);
   }

   #[test]
   fn test_timed_out_retries_are_dropped_from_queue() {
      let entry = entry(1);

      for _ in 0..50 {
         let (abandoned, _) = entry.park_retry(false, false);
         drop(abandoned);
      }
      let (_current, _) = entry.park_retry(false, false);

      assert_eq!(entry.stats().waiting, 1);
      assert_eq!(entry.state.lock().waiters.len(), 1);
   }

   #[test]
   fn test_owed_wake_goes_to_waiting_acquisition() {
      let entry = entry(1);
      let held = entry.reserve().ok().unwrap();
      let (mut retry, _) = entry.park_retry(false, false);
      let mut acquire = entry.reserve().err().unwrap();

      drop(held);
      assert!(retry.try_recv().is_ok());
      assert!(acquire.try_recv().is_err());

      // The woken retry hits the lock again inside its transaction
      let (_again, owes_wake) = entry.park_retry(false, true);
      assert!(!owes_wake);
      assert!(acquire.try_recv().is_ok());
   }

   #[test]
   fn test_owed_wake_is_kept_behind_other_retries() {
      let entry = entry(1);
      let (mut first, _) = entry.park_retry(false, false);

      let (_second, owes_wake) = entry.park_retry(false, true);
      assert!(owes_wake);
      assert!(first.try_recv().is_err());
   }

   #[test]
   fn test_open_connections_counts_primaries_and_leases() {
      let entry = entry(3);
      entry.register_primary();
      assert_eq!(entry.open_connections(), 1);

      let _reservation = entry.reserve().ok().unwrap();
      assert_eq!(entry.open_connections(), 2);

      entry.unregister_primary();
      assert_eq!(entry.open_connections(), 1);
      assert!(!entry.is_unused());
   }
}
