//! A single SQLite connection driven through its own serialized work queue

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use sqlx::ConnectOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::Result;
use crate::config::SqliteDatabaseConfig;
use crate::error::Error;
use crate::gateway;
use crate::pool::PoolEntry;
use crate::queue::SerialWorkQueue;
use crate::retry::LockRetryPolicy;
use crate::value::{Args, Row, RunResult, Statement};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Whether a connection is a database's primary connection or a pooled
/// connection handed out to transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
   Primary,
   Pooled,
}

/// Handle to one open SQLite connection
///
/// Cloning is cheap; all clones share the same work queue, so operations from
/// every clone run one at a time in submission order. Operations that hit
/// `SQLITE_BUSY` or `SQLITE_LOCKED` are retried on the queue until they succeed,
/// fail for another reason, or the connection is closed.
#[derive(Clone)]
pub struct Connection {
   inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
   id: u64,
   path: PathBuf,
   role: Role,
   memory: bool,
   config: Arc<SqliteDatabaseConfig>,
   queue: SerialWorkQueue,
   pool: Weak<PoolEntry>,
   closed: AtomicBool,
   last_insert_rowid: Arc<AtomicI64>,
   last_error: Arc<Mutex<Option<String>>>,
}

impl Connection {
   /// Open a native connection to `path` and start its work queue
   ///
   /// Busy waiting inside the engine is disabled: lock errors surface
   /// immediately and are retried by the connection's retry policy instead.
   pub(crate) async fn open(
      path: &Path,
      config: Arc<SqliteDatabaseConfig>,
      role: Role,
      pool: Option<Weak<PoolEntry>>,
   ) -> Result<Self> {
      if path.as_os_str().is_empty() {
         return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "Database path cannot be empty",
         )));
      }

      let options = SqliteConnectOptions::new()
         .filename(path)
         .create_if_missing(true)
         .busy_timeout(Duration::ZERO);

      let conn = options.connect().await.map_err(|source| Error::Open {
         path: path.display().to_string(),
         source,
      })?;

      let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
      let label = format!("{}#{}", path.display(), id);
      debug!("Opened {:?} connection [{}]", role, label);

      Ok(Self {
         inner: Arc::new(ConnectionInner {
            id,
            path: path.to_path_buf(),
            role,
            memory: is_memory_database(path),
            config,
            queue: SerialWorkQueue::start(label, conn),
            pool: pool.unwrap_or_default(),
            closed: AtomicBool::new(false),
            last_insert_rowid: Arc::new(AtomicI64::new(0)),
            last_error: Arc::new(Mutex::new(None)),
         }),
      })
   }

   /// Unique id of this connection within the process
   pub fn id(&self) -> u64 {
      self.inner.id
   }

   pub fn path(&self) -> &Path {
      &self.inner.path
   }

   pub fn role(&self) -> Role {
      self.inner.role
   }

   pub fn is_pooled(&self) -> bool {
      self.inner.role == Role::Pooled
   }

   /// Whether this connection is to a private in-memory database
   pub fn is_memory(&self) -> bool {
      self.inner.memory
   }

   /// Whether the connection still accepts work
   pub fn is_open(&self) -> bool {
      !self.inner.closed.load(Ordering::SeqCst) && !self.inner.queue.is_closing()
   }

   pub(crate) fn pool_entry(&self) -> Option<Arc<PoolEntry>> {
      self.inner.pool.upgrade()
   }

   /// Execute a statement that returns no rows
   ///
   /// # Example
   ///
   /// ```no_run
   /// use sqlx_sqlite_conn_mgr::{Args, PoolRegistry};
   ///
   /// # async fn example() -> sqlx_sqlite_conn_mgr::Result<()> {
   /// let registry = PoolRegistry::new(None);
   /// let conn = registry.open("app.db").await?;
   ///
   /// conn.run("CREATE TABLE IF NOT EXISTS users (id INTEGER PRIMARY KEY, name TEXT)", ()).await?;
   /// let result = conn
   ///    .run("INSERT INTO users (name) VALUES (:name)", Args::named([("name", "Alice")]))
   ///    .await?;
   /// assert_eq!(result.rows_affected, 1);
   /// # Ok(())
   /// # }
   /// ```
   pub async fn run(&self, sql: impl Into<String>, args: impl Into<Args>) -> Result<RunResult> {
      let last_insert_rowid = Arc::clone(&self.inner.last_insert_rowid);

      self
         .dispatch(Statement::new(sql, args), move |conn, statement| {
            let last_insert_rowid = Arc::clone(&last_insert_rowid);
            Box::pin(async move {
               let result = gateway::run(conn, statement).await?;
               last_insert_rowid.store(result.last_insert_id, Ordering::SeqCst);
               Ok(result)
            })
         })
         .await
   }

   /// Fetch the first row of a query, or `None` if it returns no rows
   pub async fn one(&self, sql: impl Into<String>, args: impl Into<Args>) -> Result<Option<Row>> {
      self
         .dispatch(Statement::new(sql, args), |conn, statement| {
            Box::pin(gateway::one(conn, statement))
         })
         .await
   }

   /// Fetch every row of a query
   pub async fn all(&self, sql: impl Into<String>, args: impl Into<Args>) -> Result<Vec<Row>> {
      self
         .dispatch(Statement::new(sql, args), |conn, statement| {
            Box::pin(gateway::all(conn, statement))
         })
         .await
   }

   /// Invoke `callback` once per row, in order, as rows are read
   ///
   /// The statement is stepped one row ahead of the callback at most. Returns the
   /// number of rows delivered. A lock error is retried only until the first row
   /// reaches the callback; after that it is returned.
   pub async fn each<F>(
      &self,
      sql: impl Into<String>,
      args: impl Into<Args>,
      mut callback: F,
   ) -> Result<u64>
   where
      F: FnMut(Row),
   {
      let (rows, mut received) = mpsc::channel(1);
      let delivered = Arc::new(AtomicU64::new(0));
      let progress = Arc::clone(&delivered);

      let dispatched = self.dispatch_with(
         Statement::new(sql, args),
         move |conn, statement| {
            Box::pin(gateway::each(conn, statement, rows.clone(), Arc::clone(&progress)))
         },
         // Restarting would hand the same rows to the callback twice
         move || delivered.load(Ordering::SeqCst) == 0,
      );

      // The sender lives in the work item, so the loop ends once it finishes
      let consume = async {
         while let Some(row) = received.recv().await {
            callback(row);
         }
      };

      let (result, ()) = tokio::join!(dispatched, consume);
      result
   }

   /// Collect the result of `f` for every row
   pub async fn mapped<T, F>(
      &self,
      sql: impl Into<String>,
      args: impl Into<Args>,
      mut f: F,
   ) -> Result<Vec<T>>
   where
      F: FnMut(Row) -> T,
   {
      let mut mapped = Vec::new();
      self.each(sql, args, |row| mapped.push(f(row))).await?;
      Ok(mapped)
   }

   /// Rowid of the most recent successful insert made through this connection
   pub fn last_insert_rowid(&self) -> i64 {
      self.inner.last_insert_rowid.load(Ordering::SeqCst)
   }

   /// Message of the most recent engine error seen by this connection
   pub fn last_error(&self) -> Option<String> {
      self.inner.last_error.lock().clone()
   }

   /// Whether the connection is outside an explicit transaction
   pub async fn autocommit(&self) -> Result<bool> {
      self
         .inner
         .queue
         .append(|conn| Box::pin(gateway::autocommit(conn)))
         .await
   }

   /// Rebuild the database file, reclaiming free pages
   pub async fn vacuum(&self) -> Result<()> {
      self.run("VACUUM", Args::none()).await.map(|_| ())
   }

   /// Run an arbitrary operation against the native connection on this
   /// connection's queue
   ///
   /// The operation is not retried on lock errors.
   pub async fn append<T, F>(&self, op: F) -> Result<T>
   where
      T: Send + 'static,
      F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T>> + Send + 'static,
   {
      if !self.is_open() {
         return Err(Error::DatabaseClosed);
      }
      self.inner.queue.append(op).await
   }

   /// Queue a statement nobody waits for; failures are logged
   ///
   /// Unlike [`run`](Self::run) the statement is not skipped when nobody is left
   /// to receive its result, which makes it usable from destructors.
   pub fn run_detached(&self, what: &'static str, sql: &'static str) -> Result<()> {
      let statement = Statement::new(sql, Args::none());
      self.inner.queue.enqueue_detached(what, move |conn| {
         Box::pin(async move { gateway::run(conn, &statement).await.map(|_| ()) })
      })
   }

   /// Close the connection
   ///
   /// Queued operations that have not started are canceled, the one in flight is
   /// allowed to finish, and the native connection is closed. Closing twice is a
   /// no-op.
   pub async fn close(&self) -> Result<()> {
      if !self.inner.closed.swap(true, Ordering::SeqCst) {
         self.inner.unregister();
      }
      self.inner.queue.close().await
   }

   async fn dispatch<T, F>(&self, statement: Statement, op: F) -> Result<T>
   where
      T: Send + 'static,
      F: for<'c> Fn(&'c mut SqliteConnection, &'c Statement) -> BoxFuture<'c, Result<T>>
         + Send
         + Sync
         + 'static,
   {
      self.dispatch_with(statement, op, || true).await
   }

   /// Queue `op`, retrying it on lock errors while `restartable` allows
   async fn dispatch_with<T, F, R>(&self, statement: Statement, op: F, restartable: R) -> Result<T>
   where
      T: Send + 'static,
      F: for<'c> Fn(&'c mut SqliteConnection, &'c Statement) -> BoxFuture<'c, Result<T>>
         + Send
         + Sync
         + 'static,
      R: Fn() -> bool + Send + 'static,
   {
      if !self.is_open() {
         return Err(Error::DatabaseClosed);
      }

      if self.inner.config.trace {
         debug!(sql = %statement.sql, "[{}] dispatching statement", self.inner.id);
      }

      let mut retry = LockRetryPolicy::new(
         &self.inner.config,
         self.inner.pool.clone(),
         self.inner.queue.shutdown_signal(),
      );
      let last_error = Arc::clone(&self.inner.last_error);
      let id = self.inner.id;

      self
         .inner
         .queue
         .append(move |conn| {
            Box::pin(async move {
               let mut attempt = 0;
               let result = loop {
                  match op(&mut *conn, &statement).await {
                     Err(err) if err.is_lock() && restartable() => {
                        trace!("[{}] lock on attempt {}: {}", id, attempt + 1, err);
                        if let Err(err) = retry.wait(&mut *conn, attempt, err).await {
                           break Err(err);
                        }
                        attempt += 1;
                     }
                     result => break result,
                  }
               };

               if let Err(Error::Engine(e)) = &result {
                  *last_error.lock() = Some(e.message.clone());
               }
               result
            })
         })
         .await
   }
}

impl ConnectionInner {
   fn unregister(&self) {
      if self.role == Role::Primary
         && let Some(entry) = self.pool.upgrade()
      {
         entry.unregister_primary();
      }
   }
}

impl Drop for ConnectionInner {
   fn drop(&mut self) {
      if !self.closed.swap(true, Ordering::SeqCst) {
         self.unregister();
      }
   }
}

impl fmt::Debug for Connection {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Connection")
         .field("id", &self.inner.id)
         .field("path", &self.inner.path)
         .field("role", &self.inner.role)
         .field("open", &self.is_open())
         .finish()
   }
}

/// Whether `path` names a private in-memory database rather than a file
pub(crate) fn is_memory_database(path: &Path) -> bool {
   let path = path.to_string_lossy();
   path == ":memory:" || path.starts_with("file::memory:") || path.contains("mode=memory")
}
