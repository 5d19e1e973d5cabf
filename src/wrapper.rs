use std::fs::create_dir_all;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use sqlx_sqlite_conn_mgr::{
   Args, Connection, Initializer, PoolRegistry, PoolStats, Row, RunResult, SqliteDatabaseConfig,
};

use crate::Error;
use crate::builders::TransactionBuilder;
use crate::transactions::IsolationMode;

/// A database opened through a [`PoolRegistry`]: its primary connection plus the
/// registry that hands out pooled connections to its transactions
///
/// Cloning is cheap and shares the primary connection.
#[derive(Clone, Debug)]
pub struct Database {
   primary: Connection,
   registry: Arc<PoolRegistry>,
}

impl Database {
   /// Open a database with its own registry
   ///
   /// Parent directories are created if missing. Pass `None` to use the default
   /// configuration.
   ///
   /// # Example
   ///
   /// ```no_run
   /// use sqlx_sqlite_txn::Database;
   ///
   /// # async fn example() -> Result<(), sqlx_sqlite_txn::Error> {
   /// let db = Database::connect("data/app.db", None).await?;
   /// db.run("CREATE TABLE IF NOT EXISTS users (id INTEGER PRIMARY KEY, name TEXT)", ()).await?;
   /// db.close().await?;
   /// # Ok(())
   /// # }
   /// ```
   pub async fn connect(
      path: impl AsRef<Path>,
      custom_config: Option<SqliteDatabaseConfig>,
   ) -> Result<Self, Error> {
      Self::open_with(PoolRegistry::new(custom_config), path).await
   }

   /// Open a database through a shared registry
   ///
   /// Databases opened through the same registry coordinate their transactions
   /// and lock retries per path.
   pub async fn open_with(
      registry: Arc<PoolRegistry>,
      path: impl AsRef<Path>,
   ) -> Result<Self, Error> {
      let path = path.as_ref();

      if let Some(parent) = path.parent()
         && !parent.as_os_str().is_empty()
         && !parent.exists()
      {
         create_dir_all(parent).map_err(sqlx_sqlite_conn_mgr::Error::Io)?;
      }

      let primary = registry.open(path).await?;
      Ok(Self { primary, registry })
   }

   /// Execute a statement that returns no rows
   pub async fn run(
      &self,
      sql: impl Into<String>,
      args: impl Into<Args>,
   ) -> Result<RunResult, Error> {
      Ok(self.primary.run(sql, args).await?)
   }

   /// Fetch the first row of a query, or `None` if it returns no rows
   pub async fn one(
      &self,
      sql: impl Into<String>,
      args: impl Into<Args>,
   ) -> Result<Option<Row>, Error> {
      Ok(self.primary.one(sql, args).await?)
   }

   /// Fetch every row of a query
   pub async fn all(
      &self,
      sql: impl Into<String>,
      args: impl Into<Args>,
   ) -> Result<Vec<Row>, Error> {
      Ok(self.primary.all(sql, args).await?)
   }

   /// Invoke `callback` once per row as rows are read
   pub async fn each<F>(
      &self,
      sql: impl Into<String>,
      args: impl Into<Args>,
      callback: F,
   ) -> Result<u64, Error>
   where
      F: FnMut(Row),
   {
      Ok(self.primary.each(sql, args, callback).await?)
   }

   /// Collect the result of `f` for every row
   ///
   /// # Example
   ///
   /// ```no_run
   /// # use sqlx_sqlite_txn::Database;
   /// # async fn example(db: Database) -> Result<(), sqlx_sqlite_txn::Error> {
   /// let names: Vec<String> = db
   ///    .mapped("SELECT name FROM users ORDER BY id", (), |row| {
   ///       row["name"].as_str().unwrap_or_default().to_string()
   ///    })
   ///    .await?;
   /// # Ok(())
   /// # }
   /// ```
   pub async fn mapped<T, F>(
      &self,
      sql: impl Into<String>,
      args: impl Into<Args>,
      f: F,
   ) -> Result<Vec<T>, Error>
   where
      F: FnMut(Row) -> T,
   {
      Ok(self.primary.mapped(sql, args, f).await?)
   }

   /// Rowid of the most recent successful insert on the primary connection
   pub fn last_insert_rowid(&self) -> i64 {
      self.primary.last_insert_rowid()
   }

   /// Message of the most recent engine error on the primary connection
   pub fn last_error(&self) -> Option<String> {
      self.primary.last_error()
   }

   pub async fn vacuum(&self) -> Result<(), Error> {
      Ok(self.primary.vacuum().await?)
   }

   /// Run `unit` inside a transaction
   ///
   /// See [`with_transaction`](crate::with_transaction) for the protocol. Use
   /// [`transaction`](Self::transaction) for a builder with defaults.
   pub async fn with_transaction<T, F, Fut>(
      &self,
      unit: F,
      mode: IsolationMode,
      use_new_connection: bool,
      initializer: Option<&Initializer>,
   ) -> Result<T, Error>
   where
      F: FnOnce(Connection) -> Fut,
      Fut: Future<Output = Result<T, Error>>,
   {
      crate::transactions::with_transaction(
         &self.registry,
         &self.primary,
         unit,
         mode,
         use_new_connection,
         initializer,
      )
      .await
   }

   /// Build a transaction around `unit`
   ///
   /// # Example
   ///
   /// ```no_run
   /// # use sqlx_sqlite_txn::{Database, IsolationMode};
   /// # use sqlx_sqlite_conn_mgr::Args;
   /// # async fn example(db: Database) -> Result<(), sqlx_sqlite_txn::Error> {
   /// let user_id = db
   ///    .transaction(|conn| async move {
   ///       let user = conn
   ///          .run("INSERT INTO users (name) VALUES (?)", Args::positional(["Alice"]))
   ///          .await?;
   ///       conn
   ///          .run(
   ///             "INSERT INTO audit_log (action) VALUES (?)",
   ///             Args::positional(["user_created"]),
   ///          )
   ///          .await?;
   ///       Ok::<_, sqlx_sqlite_txn::Error>(user.last_insert_id)
   ///    })
   ///    .mode(IsolationMode::Immediate)
   ///    .await?;
   /// # Ok(())
   /// # }
   /// ```
   pub fn transaction<F, Fut, T>(&self, unit: F) -> TransactionBuilder<F>
   where
      F: FnOnce(Connection) -> Fut + Send + 'static,
      Fut: Future<Output = Result<T, Error>> + Send + 'static,
      T: Send + 'static,
   {
      TransactionBuilder::new(Arc::clone(&self.registry), self.primary.clone(), unit)
   }

   /// The primary connection
   pub fn connection(&self) -> &Connection {
      &self.primary
   }

   pub fn registry(&self) -> &Arc<PoolRegistry> {
      &self.registry
   }

   pub fn path(&self) -> &Path {
      self.primary.path()
   }

   /// Pool bookkeeping for this database's path
   pub fn stats(&self) -> Option<PoolStats> {
      self.registry.stats(self.primary.path())
   }

   /// Close the primary connection
   ///
   /// Pending operations on it are canceled. Pooled connections close on their
   /// own once their grace period ends.
   pub async fn close(self) -> Result<(), Error> {
      self.primary.close().await?;
      Ok(())
   }
}
