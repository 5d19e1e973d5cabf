use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use sqlx_sqlite_conn_mgr::{
   Args, Connection, Error, PoolRegistry, SqliteDatabaseConfig, initializer,
};
use tempfile::TempDir;

fn config(max: u32, grace_ms: u64) -> SqliteDatabaseConfig {
   SqliteDatabaseConfig {
      max_pooled_connections: max,
      closing_grace_period_ms: grace_ms,
      ..Default::default()
   }
}

async fn setup(config: SqliteDatabaseConfig) -> (TempDir, Arc<PoolRegistry>, Connection) {
   let temp_dir = TempDir::new().unwrap();
   let registry = PoolRegistry::new(Some(config));
   let primary = registry.open(temp_dir.path().join("pool.db")).await.unwrap();
   primary
      .run("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT)", ())
      .await
      .unwrap();
   (temp_dir, registry, primary)
}

#[tokio::test]
async fn test_acquire_waits_at_limit_until_release() {
   let (_dir, registry, primary) = setup(config(2, 3000)).await;

   let first = registry.acquire(&primary, true, None).await.unwrap();
   let second = registry.acquire(&primary, true, None).await.unwrap();
   assert!(first.is_pooled() && second.is_pooled());
   assert_ne!(first.id(), second.id());

   let mut third = {
      let (registry, primary) = (Arc::clone(&registry), primary.clone());
      tokio::spawn(async move { registry.acquire(&primary, true, None).await })
   };

   assert!(
      tokio::time::timeout(Duration::from_millis(100), &mut third).await.is_err(),
      "Third acquisition should wait while two connections are in use"
   );
   let stats = registry.stats(primary.path()).unwrap();
   assert_eq!(stats.in_use, 2);
   assert_eq!(stats.waiting, 1);

   registry.release(first);

   let third = tokio::time::timeout(Duration::from_secs(5), third)
      .await
      .unwrap()
      .unwrap()
      .unwrap();
   assert!(third.is_pooled());

   let stats = registry.stats(primary.path()).unwrap();
   assert_eq!(stats.in_use, 2);
   assert_eq!(stats.waiting, 0);

   drop(second);
   drop(third);
   assert_eq!(registry.stats(primary.path()).unwrap().in_use, 0);
}

#[tokio::test]
async fn test_waiters_are_served_fifo() {
   let (_dir, registry, primary) = setup(config(1, 3000)).await;
   let held = registry.acquire(&primary, true, None).await.unwrap();
   let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

   let mut handles = Vec::new();
   for i in 0..3 {
      let (task_registry, task_primary, task_order) =
         (Arc::clone(&registry), primary.clone(), Arc::clone(&order));
      handles.push(tokio::spawn(async move {
         let lease = task_registry.acquire(&task_primary, true, None).await.unwrap();
         task_order.lock().push(i);
         tokio::time::sleep(Duration::from_millis(10)).await;
         task_registry.release(lease);
      }));

      // Make sure each waiter is queued before the next one
      while registry.stats(primary.path()).unwrap().waiting < i + 1 {
         tokio::task::yield_now().await;
      }
   }

   registry.release(held);
   for handle in handles {
      handle.await.unwrap();
   }

   assert_eq!(*order.lock(), vec![0, 1, 2]);
}

#[tokio::test]
async fn test_reclaimed_connection_matches_fresh_one() {
   let (_dir, registry, primary) = setup(config(2, 3000)).await;

   let lease = registry.acquire(&primary, true, None).await.unwrap();
   let id = lease.id();
   lease.run("INSERT INTO items (name) VALUES ('a')", ()).await.unwrap();
   registry.release(lease);
   assert_eq!(registry.stats(primary.path()).unwrap().idle, 1);

   let reclaimed = registry.acquire(&primary, true, None).await.unwrap();
   assert_eq!(reclaimed.id(), id, "Idle connection should be reclaimed");
   assert_eq!(reclaimed.path(), primary.path());
   assert!(reclaimed.is_open());
   assert!(reclaimed.is_pooled());
   assert_eq!(registry.stats(primary.path()).unwrap().idle, 0);

   let row = reclaimed.one("SELECT COUNT(*) AS n FROM items", ()).await.unwrap().unwrap();
   assert_eq!(row["n"].as_i64(), Some(1));
}

#[tokio::test]
async fn test_idle_connection_closes_after_grace_period() {
   let (_dir, registry, primary) = setup(config(2, 50)).await;

   let lease = registry.acquire(&primary, true, None).await.unwrap();
   let conn = lease.connection().clone();
   registry.release(lease);

   tokio::time::sleep(Duration::from_millis(300)).await;

   assert!(!conn.is_open());
   assert_eq!(registry.stats(primary.path()).unwrap().idle, 0);

   let fresh = registry.acquire(&primary, true, None).await.unwrap();
   assert_ne!(fresh.id(), conn.id());
   assert!(fresh.is_open());
}

#[tokio::test]
async fn test_initializer_runs_once_per_fresh_connection() {
   let (_dir, registry, primary) = setup(config(2, 3000)).await;
   let runs = Arc::new(AtomicUsize::new(0));

   let init = {
      let runs = Arc::clone(&runs);
      initializer(move |conn: &Connection| {
         let runs = Arc::clone(&runs);
         Box::pin(async move {
            runs.fetch_add(1, Ordering::SeqCst);
            conn.run("PRAGMA foreign_keys = ON", ()).await.map(|_| ())
         })
      })
   };

   let lease = registry.acquire(&primary, true, Some(&init)).await.unwrap();
   let row = lease.one("PRAGMA foreign_keys", ()).await.unwrap().unwrap();
   assert_eq!(row["foreign_keys"].as_i64(), Some(1));
   registry.release(lease);

   // Reclaimed, not reopened
   let lease = registry.acquire(&primary, true, Some(&init)).await.unwrap();
   assert_eq!(runs.load(Ordering::SeqCst), 1);

   // A second concurrent lease needs a fresh connection
   let other = registry.acquire(&primary, true, Some(&init)).await.unwrap();
   assert_eq!(runs.load(Ordering::SeqCst), 2);

   drop(lease);
   drop(other);
}

#[tokio::test]
async fn test_failing_initializer_gives_slot_back() {
   let (_dir, registry, primary) = setup(config(1, 3000)).await;

   let init = initializer(|_conn: &Connection| {
      Box::pin(async move { Err(Error::InvalidArguments("initializer refused".into())) })
   });

   let err = registry.acquire(&primary, true, Some(&init)).await.unwrap_err();
   assert!(matches!(err, Error::InvalidArguments(_)));
   assert_eq!(registry.stats(primary.path()).unwrap().in_use, 0);

   // The slot is usable again
   let lease = registry.acquire(&primary, true, None).await.unwrap();
   assert!(lease.is_pooled());
}

#[tokio::test]
async fn test_abandoned_waiter_gives_slot_back() {
   let (_dir, registry, primary) = setup(config(1, 3000)).await;
   let held = registry.acquire(&primary, true, None).await.unwrap();

   let abandoned =
      tokio::time::timeout(Duration::from_millis(20), registry.acquire(&primary, true, None)).await;
   assert!(abandoned.is_err());

   registry.release(held);

   let lease = tokio::time::timeout(Duration::from_secs(5), registry.acquire(&primary, true, None))
      .await
      .unwrap()
      .unwrap();
   assert_eq!(registry.stats(primary.path()).unwrap().in_use, 1);
   drop(lease);
}

#[tokio::test]
async fn test_primary_is_leased_without_new_connection() {
   let (_dir, registry, primary) = setup(config(2, 3000)).await;

   let lease = registry.acquire(&primary, false, None).await.unwrap();
   assert!(!lease.is_pooled());
   assert_eq!(lease.id(), primary.id());
   assert_eq!(registry.stats(primary.path()).unwrap().in_use, 0);
}

#[tokio::test]
async fn test_memory_database_always_leases_primary() {
   let registry = PoolRegistry::new(None);
   let primary = registry.open(":memory:").await.unwrap();
   assert!(primary.is_memory());

   let lease = registry.acquire(&primary, true, None).await.unwrap();
   assert!(!lease.is_pooled());
   assert_eq!(lease.id(), primary.id());
   assert!(registry.stats(":memory:").is_none());
}

#[tokio::test]
async fn test_dropped_lease_is_released() {
   let (_dir, registry, primary) = setup(config(1, 3000)).await;

   {
      let _lease = registry.acquire(&primary, true, None).await.unwrap();
      assert_eq!(registry.stats(primary.path()).unwrap().in_use, 1);
   }

   let stats = registry.stats(primary.path()).unwrap();
   assert_eq!(stats.in_use, 0);
   assert_eq!(stats.idle, 1);
}

#[tokio::test]
async fn test_pooled_writes_visible_to_primary() {
   let (_dir, registry, primary) = setup(config(2, 3000)).await;

   let lease = registry.acquire(&primary, true, None).await.unwrap();
   let result = lease
      .run("INSERT INTO items (name) VALUES (?)", Args::positional(["pooled"]))
      .await
      .unwrap();
   assert_eq!(result.rows_affected, 1);
   registry.release(lease);

   let row = primary.one("SELECT name FROM items", ()).await.unwrap().unwrap();
   assert_eq!(row["name"].as_str(), Some("pooled"));
}

#[tokio::test]
async fn test_prune_and_shutdown() {
   let (_dir, registry, primary) = setup(config(2, 60_000)).await;

   let lease = registry.acquire(&primary, true, None).await.unwrap();
   let pooled = lease.connection().clone();
   registry.release(lease);

   // Still has a primary and an idle connection
   assert_eq!(registry.prune(), 0);

   registry.shutdown().await;
   assert!(!pooled.is_open());
   assert_eq!(registry.stats(primary.path()).unwrap().idle, 0);

   let path = primary.path().to_path_buf();
   primary.close().await.unwrap();
   assert_eq!(registry.stats(&path).unwrap().primaries, 0);

   assert_eq!(registry.prune(), 1);
   assert!(registry.stats(&path).is_none());
}
