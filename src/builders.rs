//! Awaitable transaction builder

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;

use futures::future::BoxFuture;
use sqlx_sqlite_conn_mgr::{Connection, Initializer, PoolRegistry};

use crate::Error;
use crate::transactions::{IsolationMode, with_transaction};

/// Builder for a transaction around a unit of work
///
/// Defaults to a deferred transaction on a pooled connection with no
/// initializer. Await the builder (or call [`execute`](Self::execute)) to run it.
pub struct TransactionBuilder<F> {
   registry: Arc<PoolRegistry>,
   primary: Connection,
   unit: F,
   mode: IsolationMode,
   use_new_connection: bool,
   initializer: Option<Initializer>,
}

impl<F, Fut, T> TransactionBuilder<F>
where
   F: FnOnce(Connection) -> Fut + Send + 'static,
   Fut: Future<Output = Result<T, Error>> + Send + 'static,
   T: Send + 'static,
{
   pub(crate) fn new(registry: Arc<PoolRegistry>, primary: Connection, unit: F) -> Self {
      Self {
         registry,
         primary,
         unit,
         mode: IsolationMode::default(),
         use_new_connection: true,
         initializer: None,
      }
   }

   /// Set when the transaction takes its locks
   pub fn mode(mut self, mode: IsolationMode) -> Self {
      self.mode = mode;
      self
   }

   /// Run on the primary connection (`false`) instead of a pooled one
   pub fn use_new_connection(mut self, use_new_connection: bool) -> Self {
      self.use_new_connection = use_new_connection;
      self
   }

   /// Setup to run once on a freshly opened pooled connection
   pub fn initializer<I>(mut self, initializer: I) -> Self
   where
      I: for<'a> Fn(&'a Connection) -> BoxFuture<'a, sqlx_sqlite_conn_mgr::Result<()>>
         + Send
         + Sync
         + 'static,
   {
      self.initializer = Some(Arc::new(initializer));
      self
   }

   /// Share an existing initializer
   pub fn with_initializer(mut self, initializer: Initializer) -> Self {
      self.initializer = Some(initializer);
      self
   }

   /// Run the transaction and return the unit of work's value
   pub async fn execute(self) -> Result<T, Error> {
      let Self {
         registry,
         primary,
         unit,
         mode,
         use_new_connection,
         initializer,
      } = self;

      with_transaction(
         &registry,
         &primary,
         unit,
         mode,
         use_new_connection,
         initializer.as_ref(),
      )
      .await
   }
}

impl<F, Fut, T> IntoFuture for TransactionBuilder<F>
where
   F: FnOnce(Connection) -> Fut + Send + 'static,
   Fut: Future<Output = Result<T, Error>> + Send + 'static,
   T: Send + 'static,
{
   type Output = Result<T, Error>;
   type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

   fn into_future(self) -> Self::IntoFuture {
      Box::pin(self.execute())
   }
}
