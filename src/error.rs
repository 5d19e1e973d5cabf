use serde::{Serialize, Serializer};

/// Result type alias for crate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Structured error response for callers across a serialization boundary.
#[derive(Serialize)]
struct ErrorResponse {
   code: String,
   message: String,
}

/// Error types for database and transaction operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Error from the connection manager (engine errors, open failures,
   /// cancellation, closed connections).
   #[error(transparent)]
   ConnectionManager(#[from] sqlx_sqlite_conn_mgr::Error),

   /// Error from a caller's own SQLx calls.
   ///
   /// Units of work may mix in direct `sqlx` queries (for example against a
   /// separate pool) and use `?` on their errors; statements issued through a
   /// [`Connection`](sqlx_sqlite_conn_mgr::Connection) report through
   /// [`ConnectionManager`](Self::ConnectionManager) instead.
   #[error(transparent)]
   Sqlx(#[from] sqlx::Error),

   /// Failure raised by a caller's unit of work.
   #[error("{0}")]
   Other(String),
}

impl Error {
   /// Whether the error is an engine lock error that outlived its retries
   pub fn is_lock(&self) -> bool {
      matches!(self, Error::ConnectionManager(e) if e.is_lock())
   }

   /// Whether the operation was canceled before it completed
   pub fn is_cancelled(&self) -> bool {
      matches!(self, Error::ConnectionManager(sqlx_sqlite_conn_mgr::Error::Cancelled))
   }

   /// Extract a structured error code from the error type.
   ///
   /// This provides machine-readable error codes for error handling across a
   /// serialization boundary.
   pub fn error_code(&self) -> String {
      use sqlx_sqlite_conn_mgr::Error as ConnMgrError;

      match self {
         Error::ConnectionManager(e) => match e {
            ConnMgrError::Engine(engine) if engine.is_lock() => "LOCKED".to_string(),
            ConnMgrError::Engine(engine) => format!("SQLITE_{}", engine.code),
            ConnMgrError::Open { .. } => "OPEN_ERROR".to_string(),
            ConnMgrError::Cancelled => "CANCELLED".to_string(),
            ConnMgrError::DatabaseClosed => "DATABASE_CLOSED".to_string(),
            ConnMgrError::InvalidArguments(_) => "INVALID_ARGUMENTS".to_string(),
            ConnMgrError::UnsupportedDatatype(_) => "UNSUPPORTED_DATATYPE".to_string(),
            ConnMgrError::Sqlx(_) => "SQLX_ERROR".to_string(),
            ConnMgrError::Io(_) => "IO_ERROR".to_string(),
         },
         Error::Sqlx(e) => {
            // Extract SQLite error codes from sqlx errors
            if let Some(code) = e.as_database_error().and_then(|db_err| db_err.code()) {
               return format!("SQLITE_{}", code);
            }
            "SQLX_ERROR".to_string()
         }
         Error::Other(_) => "OTHER".to_string(),
      }
   }
}

impl Serialize for Error {
   fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
   where
      S: Serializer,
   {
      let response = ErrorResponse {
         code: self.error_code(),
         message: self.to_string(),
      };
      response.serialize(serializer)
   }
}
