//! Error types for sqlx-sqlite-conn-mgr

use std::fmt;

use thiserror::Error;

use crate::value::{Args, Statement};

/// Primary result code for `SQLITE_BUSY`
pub const SQLITE_BUSY: i32 = 5;
/// Primary result code for `SQLITE_LOCKED`
pub const SQLITE_LOCKED: i32 = 6;
/// Extended result code for a WAL read transaction whose snapshot is stale;
/// only ending the transaction clears it
pub const SQLITE_BUSY_SNAPSHOT: i32 = 517;

/// Errors that may occur when working with sqlx-sqlite-conn-mgr
#[derive(Error, Debug)]
pub enum Error {
   /// The engine rejected a statement (constraint violation, syntax error,
   /// type mismatch, lock, ...)
   #[error(transparent)]
   Engine(#[from] EngineError),

   /// A connection to the database could not be established
   #[error("could not open database '{path}': {source}")]
   Open {
      path: String,
      #[source]
      source: sqlx::Error,
   },

   /// The operation was canceled before it completed
   #[error("operation canceled before completion")]
   Cancelled,

   /// Connection has been closed and cannot be used
   #[error("Database has been closed")]
   DatabaseClosed,

   /// Arguments do not fit the statement they are bound to
   #[error("invalid arguments: {0}")]
   InvalidArguments(String),

   /// SQLite type that cannot be mapped to a [`Value`](crate::Value)
   #[error("unsupported datatype: {0}")]
   UnsupportedDatatype(String),

   /// Error from the sqlx library that did not come from the engine itself
   #[error("Sqlx error: {0}")]
   Sqlx(#[from] sqlx::Error),

   /// IO error when accessing database files
   #[error("IO error: {0}")]
   Io(#[from] std::io::Error),
}

impl Error {
   /// Build an error from a sqlx failure, keeping the engine result code and the
   /// statement that triggered it when the failure came from SQLite
   pub(crate) fn from_sqlx(err: sqlx::Error, statement: &Statement) -> Self {
      match EngineError::from_sqlx(&err) {
         Some(engine) => Error::Engine(engine.with_statement(statement)),
         None => Error::Sqlx(err),
      }
   }

   /// Returns true for engine errors caused by a busy database or locked table
   pub fn is_lock(&self) -> bool {
      matches!(self, Error::Engine(e) if e.is_lock())
   }

   /// The engine result code, if this error came from the engine
   pub fn code(&self) -> Option<i32> {
      match self {
         Error::Engine(e) => Some(e.code),
         Error::Open { source, .. } => EngineError::from_sqlx(source).map(|e| e.code),
         _ => None,
      }
   }
}

/// A failure reported by the SQLite engine
#[derive(Debug, Clone)]
pub struct EngineError {
   /// Extended result code as reported by the engine
   pub code: i32,
   /// Engine error message
   pub message: String,
   /// Statement that triggered the error, when known
   pub sql: Option<String>,
   /// Arguments bound to the statement, when known
   pub args: Option<Args>,
}

impl EngineError {
   pub fn new(code: i32, message: impl Into<String>) -> Self {
      Self {
         code,
         message: message.into(),
         sql: None,
         args: None,
      }
   }

   pub(crate) fn from_sqlx(err: &sqlx::Error) -> Option<Self> {
      let db_err = err.as_database_error()?;
      // sqlx reports the extended result code as a decimal string
      let code = db_err
         .code()
         .and_then(|code| code.parse::<i32>().ok())
         .unwrap_or(1);

      Some(Self::new(code, db_err.message()))
   }

   pub(crate) fn with_statement(mut self, statement: &Statement) -> Self {
      self.sql = Some(statement.sql.clone());
      self.args = Some(statement.args.clone());
      self
   }

   /// The primary result code (low byte of the extended code)
   pub fn primary_code(&self) -> i32 {
      self.code & 0xff
   }

   /// Whether retrying the same statement can succeed once another connection
   /// lets go of its lock
   pub fn is_lock(&self) -> bool {
      self.code != SQLITE_BUSY_SNAPSHOT
         && matches!(self.primary_code(), SQLITE_BUSY | SQLITE_LOCKED)
   }
}

impl fmt::Display for EngineError {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "SQLite error (result code {}): {}", self.code, self.message)?;
      if let Some(sql) = &self.sql {
         write!(f, " [sql: {sql}]")?;
      }
      Ok(())
   }
}

impl std::error::Error for EngineError {}
