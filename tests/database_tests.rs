use sqlx_sqlite_txn::{Args, Database, Error, PoolRegistry, Value};
use tempfile::TempDir;

async fn create_test_db() -> (TempDir, Database) {
   let temp_dir = TempDir::new().unwrap();
   let db = Database::connect(temp_dir.path().join("test.db"), None)
      .await
      .unwrap();
   db.run(
      "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, age INTEGER, avatar BLOB)",
      (),
   )
   .await
   .unwrap();
   (temp_dir, db)
}

#[tokio::test]
async fn test_connect_creates_parent_directories() {
   let temp_dir = TempDir::new().unwrap();
   let path = temp_dir.path().join("nested").join("deeper").join("app.db");

   let db = Database::connect(&path, None).await.unwrap();

   assert!(path.exists());
   assert_eq!(db.path(), path.as_path());
   db.close().await.unwrap();
}

#[tokio::test]
async fn test_run_reports_rows_and_insert_id() {
   let (_dir, db) = create_test_db().await;

   let first = db
      .run(
         "INSERT INTO users (name, age) VALUES (?, ?)",
         vec![Value::from("Alice"), Value::from(30)],
      )
      .await
      .unwrap();
   assert_eq!(first.rows_affected, 1);
   assert_eq!(first.last_insert_id, 1);

   db.run("INSERT INTO users (name, age) VALUES ('Bob', 25)", ()).await.unwrap();
   assert_eq!(db.last_insert_rowid(), 2);

   let updated = db.run("UPDATE users SET age = age + 1", ()).await.unwrap();
   assert_eq!(updated.rows_affected, 2);
}

#[tokio::test]
async fn test_named_arguments() {
   let (_dir, db) = create_test_db().await;

   db.run(
      "INSERT INTO users (name, age) VALUES (:name, :age)",
      Args::named([("name", Value::from("Carol")), ("age", Value::from(41))]),
   )
   .await
   .unwrap();

   let row = db
      .one(
         "SELECT name, age FROM users WHERE name = $name",
         Args::named([("$name", "Carol")]),
      )
      .await
      .unwrap()
      .expect("Row should exist");
   assert_eq!(row["name"].as_str(), Some("Carol"));
   assert_eq!(row["age"].as_i64(), Some(41));
}

#[tokio::test]
async fn test_values_round_trip_through_columns() {
   let (_dir, db) = create_test_db().await;

   db.run(
      "INSERT INTO users (name, age, avatar) VALUES (?, ?, ?)",
      vec![Value::from("Dana"), Value::Null, Value::from(vec![0xde_u8, 0xad])],
   )
   .await
   .unwrap();

   let row = db.one("SELECT age, avatar FROM users", ()).await.unwrap().unwrap();
   assert_eq!(row["age"], Value::Null);
   assert_eq!(row["avatar"], Value::Blob(vec![0xde, 0xad]));

   assert!(db.one("SELECT * FROM users WHERE id = 99", ()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_each_and_mapped() {
   let (_dir, db) = create_test_db().await;
   for name in ["a", "b", "c"] {
      db.run("INSERT INTO users (name) VALUES (?)", Args::positional([name]))
         .await
         .unwrap();
   }

   let mut seen = Vec::new();
   let count = db
      .each("SELECT name FROM users ORDER BY id", (), |row| {
         seen.push(row["name"].as_str().unwrap_or_default().to_string());
      })
      .await
      .unwrap();
   assert_eq!(count, 3);
   assert_eq!(seen, vec!["a", "b", "c"]);

   let upper = db
      .mapped("SELECT name FROM users ORDER BY id DESC", (), |row| {
         row["name"].as_str().unwrap_or_default().to_uppercase()
      })
      .await
      .unwrap();
   assert_eq!(upper, vec!["C", "B", "A"]);
}

#[tokio::test]
async fn test_engine_error_codes_and_last_error() {
   let (_dir, db) = create_test_db().await;

   let err = db.run("INSERT INTO users (name) VALUES (NULL)", ()).await.unwrap_err();
   // SQLITE_CONSTRAINT_NOTNULL
   let code = err.error_code();
   assert_eq!(code, "SQLITE_1299");
   assert!(!err.is_lock());
   assert!(db.last_error().unwrap().contains("NOT NULL"));

   let json = serde_json::to_value(&err).unwrap();
   assert_eq!(json["code"], code.as_str());
   assert!(json["message"].as_str().unwrap().contains("NOT NULL"));
}

#[tokio::test]
async fn test_closed_database_rejects_work() {
   let (_dir, db) = create_test_db().await;
   let handle = db.clone();

   db.close().await.unwrap();

   let err = handle.run("SELECT 1", ()).await.unwrap_err();
   assert_eq!(err.error_code(), "DATABASE_CLOSED");
   assert!(matches!(
      err,
      Error::ConnectionManager(sqlx_sqlite_conn_mgr::Error::DatabaseClosed)
   ));
}

#[tokio::test]
async fn test_vacuum() {
   let (_dir, db) = create_test_db().await;
   db.run("INSERT INTO users (name) VALUES ('x')", ()).await.unwrap();
   db.run("DELETE FROM users", ()).await.unwrap();

   db.vacuum().await.unwrap();
   assert!(db.connection().autocommit().await.unwrap());
}

#[tokio::test]
async fn test_64_bit_integers_keep_precision() {
   let (_dir, db) = create_test_db().await;

   for (name, age) in [("max", i64::MAX), ("min", i64::MIN), ("past f64", (1_i64 << 53) + 1)] {
      db.run(
         "INSERT INTO users (name, age) VALUES (:name, :age)",
         Args::named([("name", Value::from(name)), ("age", Value::from(age))]),
      )
      .await
      .unwrap();

      let row = db
         .one("SELECT age FROM users WHERE name = ?", Args::positional([name]))
         .await
         .unwrap()
         .unwrap();
      assert_eq!(row["age"], Value::Integer(age), "{name} lost precision");
   }

   let row = db
      .one("SELECT age FROM users WHERE age = ?", vec![Value::Integer(i64::MAX)])
      .await
      .unwrap()
      .unwrap();
   assert_eq!(row["age"].as_i64(), Some(i64::MAX));
}

#[tokio::test]
async fn test_open_failure_reports_open_error() {
   let temp_dir = TempDir::new().unwrap();
   let path = temp_dir.path().join("missing").join("app.db");

   let err = PoolRegistry::new(None).open(&path).await.unwrap_err();
   match &err {
      sqlx_sqlite_conn_mgr::Error::Open { path: reported, .. } => {
         assert!(reported.ends_with("app.db"));
      }
      other => panic!("Expected an open error, got {other:?}"),
   }

   let err = Error::from(err);
   assert_eq!(err.error_code(), "OPEN_ERROR");
   assert!(!path.exists());
}
