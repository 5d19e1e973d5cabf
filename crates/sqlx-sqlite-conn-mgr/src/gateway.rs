//! Native calls against a single SQLite connection
//!
//! Every function here runs on the connection's work queue, so it has the
//! `SqliteConnection` to itself for the duration of the call.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::TryStreamExt;
use sqlx::sqlite::SqliteConnection;
use tokio::sync::mpsc;
use tracing::debug;

use crate::Result;
use crate::error::Error;
use crate::value::{Row, RunResult, Statement, bind_value, decode_row};

/// Execute a statement, returning the affected row count and last insert id
pub(crate) async fn run(conn: &mut SqliteConnection, statement: &Statement) -> Result<RunResult> {
   let (sql, values) = statement.prepare()?;
   let mut query = sqlx::query(&sql);
   for value in values {
      query = bind_value(query, value);
   }

   let result = query
      .execute(&mut *conn)
      .await
      .map_err(|e| Error::from_sqlx(e, statement))?;

   Ok(RunResult {
      rows_affected: result.rows_affected(),
      last_insert_id: result.last_insert_rowid(),
   })
}

/// Fetch the first row of a query, if any
pub(crate) async fn one(conn: &mut SqliteConnection, statement: &Statement) -> Result<Option<Row>> {
   let (sql, values) = statement.prepare()?;
   let mut query = sqlx::query(&sql);
   for value in values {
      query = bind_value(query, value);
   }

   let row = query
      .fetch_optional(&mut *conn)
      .await
      .map_err(|e| Error::from_sqlx(e, statement))?;

   row.as_ref().map(decode_row).transpose()
}

/// Fetch every row of a query
pub(crate) async fn all(conn: &mut SqliteConnection, statement: &Statement) -> Result<Vec<Row>> {
   let (sql, values) = statement.prepare()?;
   let mut query = sqlx::query(&sql);
   for value in values {
      query = bind_value(query, value);
   }

   let rows = query
      .fetch_all(&mut *conn)
      .await
      .map_err(|e| Error::from_sqlx(e, statement))?;

   rows.iter().map(decode_row).collect()
}

/// Stream every row of a query to `rows`, one at a time
///
/// Waits for the receiver to take each row before stepping the statement again.
/// Stops early without error when the receiver goes away. `progress` counts the
/// rows handed over, including when the statement later fails.
pub(crate) async fn each(
   conn: &mut SqliteConnection,
   statement: &Statement,
   rows: mpsc::Sender<Row>,
   progress: Arc<AtomicU64>,
) -> Result<u64> {
   let (sql, values) = statement.prepare()?;
   let mut query = sqlx::query(&sql);
   for value in values {
      query = bind_value(query, value);
   }

   let mut stream = query.fetch(&mut *conn);
   let mut delivered = 0;

   while let Some(row) = stream
      .try_next()
      .await
      .map_err(|e| Error::from_sqlx(e, statement))?
   {
      if rows.send(decode_row(&row)?).await.is_err() {
         debug!("Row receiver dropped after {} rows; stopping", delivered);
         break;
      }
      delivered += 1;
      progress.fetch_add(1, Ordering::SeqCst);
   }

   Ok(delivered)
}

/// Whether the connection is in autocommit mode (outside an explicit transaction)
pub(crate) async fn autocommit(conn: &mut SqliteConnection) -> Result<bool> {
   let mut handle = conn.lock_handle().await?;
   let db = handle.as_raw_handle().as_ptr();

   // SAFETY: the handle is locked for the duration of this call, so no other
   // statement is running on the connection.
   Ok(unsafe { libsqlite3_sys::sqlite3_get_autocommit(db) } != 0)
}
