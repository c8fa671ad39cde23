//! Persistence integration tests.
//!
//! Verifies:
//! - Room state survives a full store close and reopen
//! - Snapshot metadata tracks throttled and final writes
//! - Rooms are isolated under one store

use std::sync::Arc;

use canvas_room::codec;
use canvas_room::document::{Record, Schema};
use canvas_room::host::RoomHost;
use canvas_room::merge::{Change, Operation, RecordMerge};
use canvas_room::protocol::{RoomId, ServerMessage};
use canvas_room::room::{RoomConfig, RoomHandle};
use canvas_room::session::{outbound_channel, SessionReceiver};
use canvas_room::storage::{snapshot_key, KvStore, RocksStore, StoreConfig};
use tempfile::tempdir;
use tokio::time::{timeout, Duration};

const V: u32 = Schema::DEFAULT_VERSION;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn host_over(store: &Arc<RocksStore>) -> RoomHost {
    RoomHost::new(
        store.clone(),
        Arc::new(RecordMerge::default()),
        RoomConfig::for_testing(),
    )
}

async fn join(room: &RoomHandle, session: &str) -> (SessionReceiver, Vec<Record>) {
    let (tx, mut rx) = outbound_channel();
    room.connect(session.into(), tx).await.unwrap();
    let frame = timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    match ServerMessage::decode(&frame).unwrap() {
        ServerMessage::Connected { records, .. } => (rx, records),
        other => panic!("expected Connected, got {other:?}"),
    }
}

/// Wait until every room task has let go of the store.
async fn release(store: Arc<RocksStore>) {
    timeout(Duration::from_secs(2), async {
        while Arc::strong_count(&store) > 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("room tasks still hold the store");
    drop(store);
}

fn shape(id: &str, x: i64) -> Record {
    Record::new(id, "shape").with_prop("x", x)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_room_survives_store_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let room_id = RoomId::new("durable").unwrap();

    {
        let store = Arc::new(RocksStore::open(StoreConfig::for_testing(&path)).unwrap());
        let host = host_over(&store);
        let room = host.get_or_create(&room_id).await.unwrap();
        let (_rx, _) = join(&room, "writer").await;

        room.receive_operation("writer".into(), Operation::put(V, shape("shape:1", 10)))
            .unwrap();
        room.receive_operation(
            "writer".into(),
            Operation::new(
                V,
                vec![
                    Change::Put(shape("shape:2", 20)),
                    Change::Remove("shape:1".into()),
                ],
            ),
        )
        .unwrap();

        assert_eq!(host.shutdown().await, 1);
        drop(room);
        drop(host);
        release(store).await;
    }

    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(&path)).unwrap());
    let host = host_over(&store);
    let room = host.get_or_create(&room_id).await.unwrap();
    let (_rx, records) = join(&room, "reader").await;

    assert_eq!(records, vec![shape("shape:2", 20)]);
    assert_eq!(room.info().await.unwrap().clock, 2);
}

#[tokio::test]
async fn test_metadata_counts_snapshot_writes() {
    let dir = tempdir().unwrap();
    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
    let host = host_over(&store);
    let room_id = RoomId::new("metered").unwrap();
    let key = snapshot_key(&room_id);

    let room = host.get_or_create(&room_id).await.unwrap();
    let (_rx, _) = join(&room, "s1").await;
    room.receive_operation("s1".into(), Operation::put(V, shape("shape:1", 1)))
        .unwrap();

    timeout(Duration::from_secs(2), async {
        while store.metadata(&key).unwrap().is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("throttled write never landed");
    assert_eq!(store.metadata(&key).unwrap().unwrap().writes, 1);

    room.sleep().await.unwrap();
    let meta = store.metadata(&key).unwrap().unwrap();
    assert_eq!(meta.writes, 2);
    assert_eq!(meta.size as usize, store.get(&key).unwrap().unwrap().len());
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let dir = tempdir().unwrap();
    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
    let host = host_over(&store);

    for (name, count) in [("left", 3), ("right", 5)] {
        let room = host.room(name).await.unwrap();
        let (_rx, _) = join(&room, "s1").await;
        for i in 0..count {
            room.receive_operation("s1".into(), Operation::put(V, shape(&format!("shape:{i}"), i)))
                .unwrap();
        }
        room.sleep().await.unwrap();
    }

    let keys = store.keys_with_prefix("rooms/").unwrap();
    assert_eq!(keys, vec!["rooms/left/snapshot", "rooms/right/snapshot"]);

    let left = codec::decode(&store.get("rooms/left/snapshot").unwrap().unwrap()).unwrap();
    let right = codec::decode(&store.get("rooms/right/snapshot").unwrap().unwrap()).unwrap();
    assert_eq!(left.len(), 3);
    assert_eq!(right.len(), 5);
}
