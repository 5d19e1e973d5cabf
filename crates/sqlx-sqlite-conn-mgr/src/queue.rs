//! Per-connection FIFO of work items, at most one in flight at a time

use futures::future::BoxFuture;
use parking_lot::Mutex;
use sqlx::Connection as _;
use sqlx::sqlite::SqliteConnection;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use crate::Result;
use crate::error::Error;

type Job = Box<dyn for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, ()> + Send>;

fn job<F>(f: F) -> Job
where
   F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, ()> + Send + 'static,
{
   Box::new(f)
}

/// Serialized work queue owning one native connection
///
/// Work items run in submission order on a dedicated task that owns the
/// `SqliteConnection`; only one item is ever dispatched at a time. A failed item
/// does not stop the queue.
///
/// Cancellation follows the caller's future: an item whose caller has gone away
/// before it is dispatched is skipped, and an item whose caller goes away while it
/// is running has its native future dropped, after which the queue moves on.
pub struct SerialWorkQueue {
   label: String,
   jobs: mpsc::UnboundedSender<Job>,
   shutdown: watch::Sender<bool>,
   finished: Mutex<Option<oneshot::Receiver<Result<()>>>>,
}

impl SerialWorkQueue {
   /// Take ownership of `conn` and start dispatching work to it
   pub(crate) fn start(label: String, conn: SqliteConnection) -> Self {
      let (jobs, receiver) = mpsc::unbounded_channel();
      let (shutdown, shutdown_rx) = watch::channel(false);
      let (finished_tx, finished_rx) = oneshot::channel();

      tokio::spawn(dispatch_loop(
         label.clone(),
         conn,
         receiver,
         shutdown_rx,
         finished_tx,
      ));

      Self {
         label,
         jobs,
         shutdown,
         finished: Mutex::new(Some(finished_rx)),
      }
   }

   /// Whether close has been requested
   pub fn is_closing(&self) -> bool {
      *self.shutdown.borrow()
   }

   /// A receiver that flips to `true` once close has been requested
   pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
      self.shutdown.subscribe()
   }

   /// Enqueue an operation without waiting for it
   ///
   /// The returned receiver resolves with the operation's result. Dropping it
   /// before the operation is dispatched cancels the operation.
   pub fn enqueue<T, F>(&self, op: F) -> Result<oneshot::Receiver<Result<T>>>
   where
      T: Send + 'static,
      F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T>> + Send + 'static,
   {
      if self.is_closing() {
         return Err(Error::DatabaseClosed);
      }

      let (mut tx, rx) = oneshot::channel();
      let label = self.label.clone();

      let job = job(move |conn| {
         Box::pin(async move {
            if tx.is_closed() {
               trace!("[{}] skipping canceled work item", label);
               return;
            }

            let outcome = tokio::select! {
               result = op(conn) => Some(result),
               _ = tx.closed() => None,
            };

            match outcome {
               Some(result) => {
                  let _ = tx.send(result);
               }
               None => trace!("[{}] work item canceled while in flight", label),
            }
         })
      });

      self.jobs.send(job).map_err(|_| Error::DatabaseClosed)?;
      Ok(rx)
   }

   /// Enqueue an operation nobody waits for
   ///
   /// Unlike [`enqueue`](Self::enqueue) the operation is never skipped for lack of a
   /// caller; a failure is logged.
   pub fn enqueue_detached<F>(&self, what: &'static str, op: F) -> Result<()>
   where
      F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<()>> + Send + 'static,
   {
      if self.is_closing() {
         return Err(Error::DatabaseClosed);
      }

      let label = self.label.clone();
      let job = job(move |conn| {
         Box::pin(async move {
            if let Err(e) = op(conn).await {
               warn!("[{}] {} failed: {}", label, what, e);
            }
         })
      });

      self.jobs.send(job).map_err(|_| Error::DatabaseClosed)
   }

   /// Append an operation and wait for its result
   pub async fn append<T, F>(&self, op: F) -> Result<T>
   where
      T: Send + 'static,
      F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T>> + Send + 'static,
   {
      let rx = self.enqueue(op)?;
      // A dropped sender means the queue closed before the item ran
      rx.await.map_err(|_| Error::Cancelled)?
   }

   /// Cancel all queued work, let the in-flight item finish, and close the native
   /// connection
   ///
   /// Subsequent calls return immediately.
   pub async fn close(&self) -> Result<()> {
      self.shutdown.send_replace(true);

      let finished = self.finished.lock().take();
      match finished {
         Some(rx) => rx.await.unwrap_or(Ok(())),
         None => Ok(()),
      }
   }
}

impl Drop for SerialWorkQueue {
   fn drop(&mut self) {
      self.shutdown.send_replace(true);
   }
}

async fn dispatch_loop(
   label: String,
   mut conn: SqliteConnection,
   mut jobs: mpsc::UnboundedReceiver<Job>,
   mut shutdown: watch::Receiver<bool>,
   finished: oneshot::Sender<Result<()>>,
) {
   loop {
      let job = tokio::select! {
         biased;
         _ = shutdown.wait_for(|closing| *closing) => None,
         job = jobs.recv() => job,
      };

      let Some(job) = job else {
         break;
      };

      job(&mut conn).await;

      // Hand control back to the scheduler between items so a long queue never
      // runs as one uninterrupted chain
      tokio::task::yield_now().await;
   }

   jobs.close();
   let mut canceled = 0;
   while let Ok(job) = jobs.try_recv() {
      drop(job);
      canceled += 1;
   }
   if canceled > 0 {
      debug!("[{}] canceled {} queued work item(s) on close", label, canceled);
   }

   let result = conn.close().await.map_err(Error::from);
   if let Err(e) = &result {
      warn!("[{}] failed to close native connection: {}", label, e);
   }
   debug!("[{}] connection closed", label);

   let _ = finished.send(result);
}
