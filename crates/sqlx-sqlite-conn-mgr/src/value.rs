//! Values, bind arguments and decoded rows exchanged with the engine

use std::borrow::Cow;
use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow, SqliteValueRef};
use sqlx::{Column, Row as _, Sqlite, TypeInfo, Value as _, ValueRef};
use time::PrimitiveDateTime;

use crate::Result;
use crate::error::Error;

/// A single SQLite value, either bound to a statement or read from a row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
   Null,
   Integer(i64),
   Real(f64),
   Text(String),
   Blob(Vec<u8>),
}

/// A decoded row, keyed by column name in column order
pub type Row = IndexMap<String, Value>;

impl Value {
   pub fn is_null(&self) -> bool {
      matches!(self, Value::Null)
   }

   pub fn as_i64(&self) -> Option<i64> {
      match self {
         Value::Integer(v) => Some(*v),
         _ => None,
      }
   }

   pub fn as_f64(&self) -> Option<f64> {
      match self {
         Value::Real(v) => Some(*v),
         Value::Integer(v) => Some(*v as f64),
         _ => None,
      }
   }

   pub fn as_str(&self) -> Option<&str> {
      match self {
         Value::Text(v) => Some(v),
         _ => None,
      }
   }

   pub fn as_bytes(&self) -> Option<&[u8]> {
      match self {
         Value::Blob(v) => Some(v),
         _ => None,
      }
   }
}

impl From<i64> for Value {
   fn from(v: i64) -> Self {
      Value::Integer(v)
   }
}

impl From<i32> for Value {
   fn from(v: i32) -> Self {
      Value::Integer(v.into())
   }
}

impl From<u32> for Value {
   fn from(v: u32) -> Self {
      Value::Integer(v.into())
   }
}

impl From<f64> for Value {
   fn from(v: f64) -> Self {
      Value::Real(v)
   }
}

impl From<bool> for Value {
   fn from(v: bool) -> Self {
      Value::Integer(v.into())
   }
}

impl From<&str> for Value {
   fn from(v: &str) -> Self {
      Value::Text(v.to_owned())
   }
}

impl From<String> for Value {
   fn from(v: String) -> Self {
      Value::Text(v)
   }
}

impl From<Vec<u8>> for Value {
   fn from(v: Vec<u8>) -> Self {
      Value::Blob(v)
   }
}

impl From<&[u8]> for Value {
   fn from(v: &[u8]) -> Self {
      Value::Blob(v.to_vec())
   }
}

impl<T: Into<Value>> From<Option<T>> for Value {
   fn from(v: Option<T>) -> Self {
      v.map_or(Value::Null, Into::into)
   }
}

impl From<JsonValue> for Value {
   fn from(value: JsonValue) -> Self {
      match value {
         JsonValue::Null => Value::Null,
         JsonValue::Bool(b) => b.into(),
         JsonValue::String(s) => Value::Text(s),
         JsonValue::Number(number) => {
            // Preserve integer precision by binding as i64 when possible
            if let Some(int_val) = number.as_i64() {
               Value::Integer(int_val)
            } else {
               // u64 beyond i64::MAX and true floats can only be REAL
               Value::Real(number.as_f64().unwrap_or_default())
            }
         }
         other => Value::Text(other.to_string()),
      }
   }
}

/// Arguments bound to a statement
///
/// Positional arguments fill `?`, `?NNN` and `$NNN` placeholders in order.
/// Named arguments fill `:name`, `@name` and `$name` placeholders; keys may be
/// given with or without their prefix. The two styles cannot be mixed in one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Args {
   Positional(Vec<Value>),
   Named(IndexMap<String, Value>),
}

impl Default for Args {
   fn default() -> Self {
      Args::Positional(Vec::new())
   }
}

impl Args {
   pub fn none() -> Self {
      Self::default()
   }

   pub fn positional<I, V>(values: I) -> Self
   where
      I: IntoIterator<Item = V>,
      V: Into<Value>,
   {
      Args::Positional(values.into_iter().map(Into::into).collect())
   }

   pub fn named<I, K, V>(values: I) -> Self
   where
      I: IntoIterator<Item = (K, V)>,
      K: Into<String>,
      V: Into<Value>,
   {
      Args::Named(
         values
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect(),
      )
   }

   pub fn is_empty(&self) -> bool {
      match self {
         Args::Positional(v) => v.is_empty(),
         Args::Named(m) => m.is_empty(),
      }
   }
}

impl From<()> for Args {
   fn from(_: ()) -> Self {
      Args::default()
   }
}

impl From<Vec<Value>> for Args {
   fn from(values: Vec<Value>) -> Self {
      Args::Positional(values)
   }
}

impl From<Vec<JsonValue>> for Args {
   fn from(values: Vec<JsonValue>) -> Self {
      Args::positional(values)
   }
}

impl From<IndexMap<String, Value>> for Args {
   fn from(values: IndexMap<String, Value>) -> Self {
      Args::Named(values)
   }
}

/// SQL text together with the arguments bound to it
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
   pub sql: String,
   pub args: Args,
}

impl Statement {
   pub fn new(sql: impl Into<String>, args: impl Into<Args>) -> Self {
      Self {
         sql: sql.into(),
         args: args.into(),
      }
   }

   /// Resolve the statement into SQL the engine can prepare and the values to
   /// bind, in placeholder order
   pub(crate) fn prepare(&self) -> Result<(Cow<'_, str>, Vec<Value>)> {
      match &self.args {
         Args::Positional(values) => Ok((Cow::Borrowed(self.sql.as_str()), values.clone())),
         Args::Named(values) => {
            let (sql, values) = expand_named(&self.sql, values)?;
            Ok((Cow::Owned(sql), values))
         }
      }
   }
}

/// Result returned from `run` (e.g. INSERT, UPDATE, DELETE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
   /// The number of rows affected by the statement.
   pub rows_affected: u64,
   /// The last inserted row ID (SQLite ROWID).
   ///
   /// Only meaningful for INSERT statements on tables with a ROWID.
   pub last_insert_id: i64,
}

/// Rewrite `:name`, `@name` and `$name` placeholders into numbered positional
/// placeholders and collect the values to bind for them
///
/// sqlx only binds SQLite parameters by position, so named parameters are
/// resolved here. String literals, quoted identifiers and comments are copied
/// untouched. A name missing from `named` binds NULL.
fn expand_named(sql: &str, named: &IndexMap<String, Value>) -> Result<(String, Vec<Value>)> {
   let bytes = sql.as_bytes();
   let mut out = String::with_capacity(sql.len());
   let mut values = Vec::new();
   let mut slots: HashMap<&str, usize> = HashMap::new();
   let mut copied = 0;
   let mut i = 0;

   while i < bytes.len() {
      match bytes[i] {
         quote @ (b'\'' | b'"' | b'`') => i = skip_past(bytes, i + 1, &[quote]),
         b'[' => i = skip_past(bytes, i + 1, b"]"),
         b'-' if bytes.get(i + 1) == Some(&b'-') => i = skip_past(bytes, i + 2, b"\n"),
         b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_past(bytes, i + 2, b"*/"),
         b'?' => {
            return Err(Error::InvalidArguments(
               "positional placeholder '?' in a statement bound with named arguments".into(),
            ));
         }
         b'$' if bytes.get(i + 1).is_some_and(u8::is_ascii_digit) => {
            return Err(Error::InvalidArguments(
               "positional placeholder '$N' in a statement bound with named arguments".into(),
            ));
         }
         b':' | b'@' | b'$' if bytes.get(i + 1).is_some_and(|b| is_ident_start(*b)) => {
            let start = i;
            let mut end = i + 1;
            while end < bytes.len() && is_ident_char(bytes[end]) {
               end += 1;
            }

            let name = &sql[start + 1..end];
            let index = match slots.get(name) {
               Some(&index) => index,
               None => {
                  let value = named
                     .get(name)
                     .or_else(|| named.get(&sql[start..end]))
                     .cloned()
                     .unwrap_or(Value::Null);
                  values.push(value);
                  slots.insert(name, values.len());
                  values.len()
               }
            };

            out.push_str(&sql[copied..start]);
            out.push('?');
            out.push_str(&index.to_string());
            copied = end;
            i = end;
         }
         _ => i += 1,
      }
   }

   out.push_str(&sql[copied..]);
   Ok((out, values))
}

/// Index just past the next occurrence of `terminator` at or after `from`,
/// or the end of input when it never appears
fn skip_past(bytes: &[u8], from: usize, terminator: &[u8]) -> usize {
   bytes[from..]
      .windows(terminator.len())
      .position(|w| w == terminator)
      .map_or(bytes.len(), |pos| from + pos + terminator.len())
}

fn is_ident_start(b: u8) -> bool {
   b.is_ascii_alphabetic() || b == b'_' || b >= 0x80
}

fn is_ident_char(b: u8) -> bool {
   b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80
}

/// Bind a value to a SQLx query
pub(crate) fn bind_value<'q>(
   query: Query<'q, Sqlite, SqliteArguments<'q>>,
   value: Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
   match value {
      Value::Null => query.bind(None::<i64>),
      Value::Integer(v) => query.bind(v),
      Value::Real(v) => query.bind(v),
      Value::Text(v) => query.bind(v),
      Value::Blob(v) => query.bind(v),
   }
}

/// Decode every column of a row
pub(crate) fn decode_row(row: &SqliteRow) -> Result<Row> {
   let mut decoded = Row::with_capacity(row.columns().len());
   for (i, column) in row.columns().iter().enumerate() {
      let value = row.try_get_raw(i)?;
      decoded.insert(column.name().to_string(), decode(value)?);
   }
   Ok(decoded)
}

/// Convert a SQLite value to a [`Value`].
///
/// Booleans are stored as INTEGER in SQLite and dates/times as TEXT, so both
/// come back in their storage form.
pub(crate) fn decode(value: SqliteValueRef) -> Result<Value> {
   if value.is_null() {
      return Ok(Value::Null);
   }

   let column_type = value.type_info();

   let result = match column_type.name() {
      "TEXT" | "DATE" | "TIME" => value
         .to_owned()
         .try_decode::<String>()
         .map_or(Value::Null, Value::Text),

      "REAL" => value
         .to_owned()
         .try_decode::<f64>()
         .map_or(Value::Null, Value::Real),

      "INTEGER" | "NUMERIC" | "BOOLEAN" => value
         .to_owned()
         .try_decode::<i64>()
         .map_or(Value::Null, Value::Integer),

      "DATETIME" => {
         if let Ok(dt) = value.to_owned().try_decode::<PrimitiveDateTime>() {
            Value::Text(dt.to_string())
         } else if let Ok(v) = value.to_owned().try_decode::<String>() {
            // Fall back to the stored representation
            Value::Text(v)
         } else if let Ok(v) = value.to_owned().try_decode::<i64>() {
            Value::Integer(v)
         } else {
            Value::Null
         }
      }

      "BLOB" => value
         .to_owned()
         .try_decode::<Vec<u8>>()
         .map_or(Value::Null, Value::Blob),

      "NULL" => Value::Null,

      _ => {
         // For unknown types, try to decode as text
         if let Ok(text) = value.to_owned().try_decode::<String>() {
            Value::Text(text)
         } else {
            return Err(Error::UnsupportedDatatype(format!(
               "Unknown SQLite type: {}",
               column_type.name()
            )));
         }
      }
   };

   Ok(result)
}
