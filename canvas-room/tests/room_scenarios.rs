//! End-to-end room scenarios against the in-memory store.
//!
//! These drive rooms through their handles exactly as the gateway does,
//! without a network in between.

use std::sync::Arc;

use canvas_room::codec;
use canvas_room::document::{Record, RecordId, Schema};
use canvas_room::host::RoomHost;
use canvas_room::merge::{Change, Operation, RecordMerge};
use canvas_room::protocol::{RoomId, ServerMessage, SessionId};
use canvas_room::room::{Room, RoomConfig, RoomError, RoomHandle, SessionRejection};
use canvas_room::session::{outbound_channel, SessionReceiver, DEFAULT_SESSION_QUEUE};
use canvas_room::storage::{snapshot_key, KvStore, MemoryStore};
use tokio::time::{timeout, Duration, Instant};

const V: u32 = Schema::DEFAULT_VERSION;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn host(store: &Arc<MemoryStore>) -> Arc<RoomHost> {
    Arc::new(RoomHost::new(
        store.clone(),
        Arc::new(RecordMerge::default()),
        RoomConfig::for_testing(),
    ))
}

async fn join(room: &RoomHandle, session: &str) -> SessionReceiver {
    let (tx, mut rx) = outbound_channel();
    room.connect(session.into(), tx).await.unwrap();
    match next(&mut rx).await {
        ServerMessage::Connected { .. } => rx,
        other => panic!("expected Connected, got {other:?}"),
    }
}

async fn next(rx: &mut SessionReceiver) -> ServerMessage {
    let frame = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("session closed");
    ServerMessage::decode(&frame).unwrap()
}

fn shape(id: &str) -> Record {
    Record::new(id, "shape").with_prop("type", "geo")
}

async fn wait_for_writes(store: &MemoryStore, key: &str, n: u64) {
    timeout(Duration::from_secs(2), async {
        while store.write_count(key) < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {n} writes to {key}"));
}

// ─── Scenarios ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_scenario_abc_change_reaches_peer_and_store() {
    let store = Arc::new(MemoryStore::new());
    let host = host(&store);
    let room_id = RoomId::new("abc").unwrap();
    let room = host.get_or_create(&room_id).await.unwrap();

    let mut s1 = join(&room, "s1").await;
    let mut s2 = join(&room, "s2").await;

    room.receive_operation("s1".into(), Operation::put(V, shape("shape:1")))
        .unwrap();

    match next(&mut s2).await {
        ServerMessage::Changes { origin, diff, .. } => {
            assert_eq!(origin, SessionId::from("s1"));
            assert_eq!(diff.put, vec![shape("shape:1")]);
            assert!(diff.removed.is_empty());
        }
        other => panic!("expected Changes, got {other:?}"),
    }

    assert!(host.sleep_room(&room_id).await.unwrap());

    // Sleep closes every session's stream; the origin never saw its own change
    assert!(timeout(Duration::from_secs(1), s1.recv()).await.unwrap().is_none());
    assert!(timeout(Duration::from_secs(1), s2.recv()).await.unwrap().is_none());

    let bytes = store.get(&snapshot_key(&room_id)).unwrap().unwrap();
    let state = codec::decode(&bytes).unwrap();
    let ids: Vec<&RecordId> = state.records.keys().collect();
    assert_eq!(ids, vec![&RecordId::new("shape:1")]);
}

#[tokio::test]
async fn test_scenario_xyz_corrupt_snapshot_starts_empty() {
    let store = Arc::new(MemoryStore::new());
    let room_id = RoomId::new("xyz").unwrap();
    store.insert_raw(&snapshot_key(&room_id), b"definitely not a snapshot".to_vec());

    let host = host(&store);
    let room = host.get_or_create(&room_id).await.unwrap();

    let (tx, mut rx) = outbound_channel();
    room.connect("s1".into(), tx).await.unwrap();
    match next(&mut rx).await {
        ServerMessage::Connected { records, clock, .. } => {
            assert!(records.is_empty());
            assert_eq!(clock, 0);
        }
        other => panic!("expected Connected, got {other:?}"),
    }
}

#[tokio::test]
async fn test_commuting_operations_converge() {
    let store = Arc::new(MemoryStore::new());
    let host = host(&store);
    let a = host.room("order-a").await.unwrap();
    let b = host.room("order-b").await.unwrap();

    let _sessions = (
        join(&a, "s1").await,
        join(&a, "s2").await,
        join(&b, "s1").await,
        join(&b, "s2").await,
    );

    let first = Operation::put(V, shape("shape:1"));
    let second = Operation::new(
        V,
        vec![
            Change::Put(shape("shape:2")),
            Change::Put(Record::new("page:1", "page").with_prop("name", "Page 1")),
        ],
    );

    a.receive_operation("s1".into(), first.clone()).unwrap();
    a.receive_operation("s2".into(), second.clone()).unwrap();
    b.receive_operation("s2".into(), second).unwrap();
    b.receive_operation("s1".into(), first).unwrap();

    let doc_a = a.document().await.unwrap();
    let doc_b = b.document().await.unwrap();
    assert_eq!(doc_a.records, doc_b.records);
    assert_eq!(doc_a.len(), 3);
}

#[tokio::test]
async fn test_at_most_one_room_per_id() {
    let store = Arc::new(MemoryStore::new());
    let host = host(&store);
    let room_id = RoomId::new("contended").unwrap();

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let host = Arc::clone(&host);
            let room_id = room_id.clone();
            tokio::spawn(async move { host.get_or_create(&room_id).await.unwrap() })
        })
        .collect();

    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap());
    }
    assert!(handles.windows(2).all(|w| w[0].same_room(&w[1])));
    assert_eq!(host.stats().rooms_created, 1);
}

#[tokio::test]
async fn test_burst_coalesces_into_one_write() {
    let store = Arc::new(MemoryStore::new());
    let room_id = RoomId::new("burst").unwrap();
    let key = snapshot_key(&room_id);
    let room = Room::create(
        room_id,
        store.clone(),
        Arc::new(RecordMerge::default()),
        RoomConfig {
            persist_interval: Duration::from_millis(100),
            ..RoomConfig::for_testing()
        },
    )
    .await
    .unwrap();
    let _rx = join(&room, "s1").await;

    for i in 0..20 {
        room.receive_operation("s1".into(), Operation::put(V, shape(&format!("shape:{i}"))))
            .unwrap();
    }

    wait_for_writes(&store, &key, 1).await;
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(store.write_count(&key), 1);

    // Sleep always writes once more, even with nothing new
    room.sleep().await.unwrap();
    assert_eq!(store.write_count(&key), 2);
    let state = codec::decode(&store.get(&key).unwrap().unwrap()).unwrap();
    assert_eq!(state.len(), 20);
}

#[tokio::test]
async fn test_steady_stream_is_persisted_every_interval() {
    let interval = Duration::from_millis(100);
    let store = Arc::new(MemoryStore::new());
    let room_id = RoomId::new("steady").unwrap();
    let key = snapshot_key(&room_id);
    let room = Room::create(
        room_id,
        store.clone(),
        Arc::new(RecordMerge::default()),
        RoomConfig {
            persist_interval: interval,
            ..RoomConfig::for_testing()
        },
    )
    .await
    .unwrap();
    let _rx = join(&room, "s1").await;

    // One edit every quarter interval for three intervals: a debounce would
    // never fire while the stream lasts
    let started = Instant::now();
    let mut first_write = None;
    for i in 0..12 {
        room.receive_operation("s1".into(), Operation::put(V, shape(&format!("shape:{i}"))))
            .unwrap();
        tokio::time::sleep(interval / 4).await;
        if first_write.is_none() && store.write_count(&key) > 0 {
            first_write = Some(started.elapsed());
        }
    }

    let first_write = first_write.expect("no snapshot written while edits kept arriving");
    assert!(first_write < interval * 2, "first write after {first_write:?}");
    let during = store.write_count(&key);
    assert!((2..=4).contains(&during), "{during} writes during the stream");

    // The tail of the stream lands at most one interval after it stops
    timeout(Duration::from_secs(2), async {
        loop {
            if let Some(bytes) = store.get(&key).unwrap() {
                if codec::decode(&bytes).unwrap().len() == 12 {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("tail of the stream never persisted");
}

#[tokio::test]
async fn test_stalled_session_is_bounded_and_evicted() {
    let store = Arc::new(MemoryStore::new());
    let host = host(&store);
    let room = host.room("stalled").await.unwrap();

    let _writer = join(&room, "writer").await;
    let mut stalled = join(&room, "stalled").await;

    for i in 0..(DEFAULT_SESSION_QUEUE * 2) {
        room.receive_operation("writer".into(), Operation::put(V, shape(&format!("shape:{i}"))))
            .unwrap();
    }

    let info = room.info().await.unwrap();
    assert_eq!(info.sessions, 1);
    assert_eq!(info.fanout.sessions_evicted, 1);

    let mut queued = 0;
    while stalled.recv().await.is_some() {
        queued += 1;
    }
    assert_eq!(queued, DEFAULT_SESSION_QUEUE);

    // A reconnect gets the full state instead of the missed changes
    let (tx, mut rx) = outbound_channel();
    room.connect("stalled".into(), tx).await.unwrap();
    match next(&mut rx).await {
        ServerMessage::Connected { records, .. } => {
            assert_eq!(records.len(), DEFAULT_SESSION_QUEUE * 2)
        }
        other => panic!("expected Connected, got {other:?}"),
    }
}

#[tokio::test]
async fn test_duplicate_session_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let host = host(&store);
    let room = host.room("dupes").await.unwrap();

    let _rx = join(&room, "same").await;
    let (tx, _rx2) = outbound_channel();
    let err = room.connect("same".into(), tx).await.unwrap_err();
    assert!(matches!(
        err,
        RoomError::InvalidSession {
            reason: SessionRejection::Duplicate,
            ..
        }
    ));
    assert_eq!(room.info().await.unwrap().sessions, 1);
}

#[tokio::test]
async fn test_reconnect_after_transport_drop() {
    let store = Arc::new(MemoryStore::new());
    let host = host(&store);
    let room = host.room("flaky").await.unwrap();

    let rx = join(&room, "s1").await;
    drop(rx);

    // A dead transport no longer holds the id
    let _rx = join(&room, "s1").await;
    assert_eq!(room.info().await.unwrap().sessions, 1);
}
