//! End-to-end replication tests over real sockets

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::net::TcpListener;

use mirrorfs_core::types::{ReplicationConfig, StoreConfig};
use mirrorfs_core::Error;
use mirrorfs_replication::{ClientConfig, FollowerRunner, ReplicationClient, ReplicationServer};
use mirrorfs_store::{Database, Store};

fn store_config(dir: &TempDir) -> StoreConfig {
    StoreConfig {
        data_dir: dir.path().to_path_buf(),
        busy_timeout: Duration::from_millis(200),
        event_capacity: 64,
        ..StoreConfig::default()
    }
}

fn fast_replication_config() -> ReplicationConfig {
    ReplicationConfig {
        send_queue_depth: 16,
        reconnect_base_delay: Duration::from_millis(25),
        reconnect_max_delay: Duration::from_millis(200),
        connect_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(2),
        positions_poll_interval: Duration::from_millis(100),
        ..ReplicationConfig::default()
    }
}

/// Open a store and serve its replication API on an ephemeral port.
/// Returns the store and its advertise URL.
async fn start_node(dir: &TempDir) -> (Arc<Store>, String) {
    let store = Store::open(store_config(dir)).await.unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let server = ReplicationServer::new(
        Arc::clone(&store),
        fast_replication_config(),
        "test-node".to_string(),
    );
    tokio::spawn(server.serve_on(listener));
    (store, url)
}

/// Commit one transaction writing two patterned pages
async fn write_commit(db: &Arc<Database>, seed: u8) -> u64 {
    let mut txn = db.begin().await.unwrap();
    txn.write(0, vec![seed; 4096]);
    txn.write(4096, vec![seed.wrapping_add(1); 4096]);
    txn.commit().await.unwrap()
}

async fn wait_for_position(db: &Arc<Database>, want: u64) {
    let reached = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if db.position().await >= want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await;
    assert!(
        reached.is_ok(),
        "timed out waiting for position {want}, at {}",
        db.position().await
    );
}

async fn assert_identical(primary: &Arc<Database>, follower: &Arc<Database>) {
    let a = tokio::fs::read(primary.path()).await.unwrap();
    let b = tokio::fs::read(follower.path()).await.unwrap();
    assert_eq!(a.len(), b.len(), "file sizes differ");
    assert_eq!(a, b, "database files differ");
}

#[tokio::test]
async fn test_follower_streams_and_matches_primary() {
    let primary_dir = TempDir::new().unwrap();
    let (primary, primary_url) = start_node(&primary_dir).await;
    primary.set_primary(primary_url.clone());

    let db = primary.create_database("main").await.unwrap();
    for seed in 1..=3u8 {
        write_commit(&db, seed).await;
    }
    assert_eq!(db.position().await, 3);

    let follower_dir = TempDir::new().unwrap();
    let follower = Store::open(store_config(&follower_dir)).await.unwrap();
    follower.set_follower(Some(primary_url.clone()));
    let runner = Arc::new(FollowerRunner::new(Arc::clone(&follower), fast_replication_config()).unwrap());
    let supervisor = runner.start();

    // Backlog catch-up: all three frames existed before the connect
    let reached = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(follower_db) = follower.database("main") {
                if follower_db.position().await >= 3 {
                    return follower_db;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await;
    let follower_db = reached.expect("follower never caught up");
    assert_identical(&db, &follower_db).await;

    // Live tail: a commit made while the stream is open arrives too
    write_commit(&db, 9).await;
    wait_for_position(&follower_db, 4).await;
    assert_identical(&db, &follower_db).await;

    // The positions endpoint reports the committed state
    let client = ReplicationClient::new(ClientConfig::default()).unwrap();
    let positions = client.positions(&primary_url).await.unwrap();
    assert_eq!(positions.get("main"), Some(&4));

    runner.stop();
    supervisor.abort();
    follower.shutdown();
    primary.shutdown();
}

#[tokio::test]
async fn test_snapshot_resync_when_log_trimmed() {
    let primary_dir = TempDir::new().unwrap();
    let (primary, primary_url) = start_node(&primary_dir).await;
    primary.set_primary(primary_url.clone());

    let db = primary.create_database("main").await.unwrap();
    for seed in 1..=10u8 {
        write_commit(&db, seed).await;
    }
    // Keep only the two newest frames; a fresh follower cannot replay
    db.enforce_retention(2).await.unwrap();
    assert_eq!(db.retained_floor().await, 9);

    let follower_dir = TempDir::new().unwrap();
    let follower = Store::open(store_config(&follower_dir)).await.unwrap();
    follower.set_follower(Some(primary_url.clone()));
    let runner = Arc::new(FollowerRunner::new(Arc::clone(&follower), fast_replication_config()).unwrap());
    let supervisor = runner.start();

    let reached = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(follower_db) = follower.database("main") {
                if follower_db.position().await >= 10 {
                    return follower_db;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await;
    let follower_db = reached.expect("snapshot resync never completed");
    assert_eq!(follower_db.position().await, 10);
    assert_identical(&db, &follower_db).await;

    // After the snapshot the follower streams normally again
    write_commit(&db, 99).await;
    wait_for_position(&follower_db, 11).await;
    assert_identical(&db, &follower_db).await;

    runner.stop();
    supervisor.abort();
    follower.shutdown();
    primary.shutdown();
}

#[tokio::test]
async fn test_stream_rejected_when_not_primary() {
    let dir = TempDir::new().unwrap();
    let (store, url) = start_node(&dir).await;
    // Left as follower on purpose
    store.create_database("main").await.unwrap();

    let client = ReplicationClient::new(ClientConfig::default()).unwrap();
    match client.stream_frames(&url, "main", 0).await {
        Ok(_) => panic!("stream accepted by a non-primary node"),
        Err(e) => assert!(matches!(e, Error::NotPrimary), "unexpected error: {e}"),
    }

    store.shutdown();
}

#[tokio::test]
async fn test_snapshot_fetch_verifies_checksum_and_position() {
    let dir = TempDir::new().unwrap();
    let (primary, url) = start_node(&dir).await;
    primary.set_primary(url.clone());

    let db = primary.create_database("main").await.unwrap();
    for seed in 1..=2u8 {
        write_commit(&db, seed).await;
    }

    let client = ReplicationClient::new(ClientConfig::default()).unwrap();
    let (data, position) = client.fetch_snapshot(&url, "main").await.unwrap();
    assert_eq!(position, 2);
    let on_disk = tokio::fs::read(db.path()).await.unwrap();
    assert_eq!(&data[..], &on_disk[..]);

    primary.shutdown();
}
