//! Placement layer: at most one live room per room id.
//!
//! ```text
//! slots: Mutex<HashMap<RoomId, Arc<Mutex<Option<RoomHandle>>>>>
//!                 │                         │
//!                 │ held only to find        │ held while creating,
//!                 │ or insert a slot         │ sleeping or evicting
//! ```
//!
//! Creation is serialized per key while different keys proceed in
//! parallel. Sleeping holds the slot until the final snapshot is written,
//! so a room re-created under the same id always loads that snapshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::merge::MergeEngine;
use crate::protocol::RoomId;
use crate::room::{Room, RoomConfig, RoomError, RoomHandle};
use crate::storage::KvStore;

type Slot = Arc<Mutex<Option<RoomHandle>>>;

/// Host counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStats {
    pub rooms_created: u64,
    pub rooms_slept: u64,
    pub final_write_failures: u64,
}

#[derive(Default)]
struct AtomicHostStats {
    rooms_created: AtomicU64,
    rooms_slept: AtomicU64,
    final_write_failures: AtomicU64,
}

/// Routes room ids to live room actors.
pub struct RoomHost {
    store: Arc<dyn KvStore>,
    engine: Arc<dyn MergeEngine>,
    config: RoomConfig,
    slots: Mutex<HashMap<RoomId, Slot>>,
    stats: AtomicHostStats,
}

impl RoomHost {
    pub fn new(store: Arc<dyn KvStore>, engine: Arc<dyn MergeEngine>, config: RoomConfig) -> Self {
        Self {
            store,
            engine,
            config,
            slots: Mutex::new(HashMap::new()),
            stats: AtomicHostStats::default(),
        }
    }

    /// Live room for `room_id`, created (and its snapshot loaded) on first access.
    pub async fn get_or_create(&self, room_id: &RoomId) -> Result<RoomHandle, RoomError> {
        let slot = self.slot(room_id).await;
        let mut current = slot.lock().await;
        if let Some(handle) = current.as_ref().filter(|handle| !handle.is_closed()) {
            return Ok(handle.clone());
        }

        let handle = Room::create(
            room_id.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.engine),
            self.config.clone(),
        )
        .await?;
        self.stats.rooms_created.fetch_add(1, Ordering::Relaxed);
        *current = Some(handle.clone());
        Ok(handle)
    }

    /// Like [`get_or_create`](Self::get_or_create), parsing the id first.
    pub async fn room(&self, raw_id: &str) -> Result<RoomHandle, RoomError> {
        let room_id = RoomId::new(raw_id).map_err(|e| RoomError::InvalidRoom(e.to_string()))?;
        self.get_or_create(&room_id).await
    }

    /// Live room for `room_id` without creating one.
    pub async fn get(&self, room_id: &RoomId) -> Option<RoomHandle> {
        let slot = self.slots.lock().await.get(room_id).cloned()?;
        let current = slot.lock().await;
        current.as_ref().filter(|handle| !handle.is_closed()).cloned()
    }

    /// Deliver the sleep signal and wait for the final snapshot.
    ///
    /// Returns `false` when no live room existed.
    pub async fn sleep_room(&self, room_id: &RoomId) -> Result<bool, RoomError> {
        let Some(slot) = self.slots.lock().await.get(room_id).cloned() else {
            return Ok(false);
        };
        let mut current = slot.lock().await;
        let Some(handle) = current.take() else {
            return Ok(false);
        };
        self.sleep_handle(handle).await
    }

    /// Sleep every room with no sessions that has been idle for `idle_timeout`.
    pub async fn evict_idle(&self, idle_timeout: Duration) -> Vec<RoomId> {
        let mut evicted = Vec::new();

        for (room_id, slot) in self.all_slots().await {
            let mut current = slot.lock().await;
            let Some(handle) = current.as_ref() else {
                continue;
            };
            let info = handle.info().await;
            match info {
                Ok(info)
                    if info.sessions == 0
                        && info.idle_for.is_some_and(|idle| idle >= idle_timeout) =>
                {
                    let Some(handle) = current.take() else {
                        continue;
                    };
                    log::info!("Evicting idle room {room_id} (idle {:?})", info.idle_for);
                    match self.sleep_handle(handle).await {
                        Ok(true) => evicted.push(room_id),
                        Ok(false) => {}
                        Err(e) => log::error!("Eviction of room {room_id} lost data: {e}"),
                    }
                }
                Ok(_) => {}
                Err(_) => {
                    // Actor already gone
                    *current = None;
                }
            }
        }

        self.prune().await;
        evicted
    }

    /// Sleep every live room. Returns how many were slept.
    pub async fn shutdown(&self) -> usize {
        let mut slept = 0;
        for (room_id, slot) in self.all_slots().await {
            let mut current = slot.lock().await;
            let Some(handle) = current.take() else {
                continue;
            };
            match self.sleep_handle(handle).await {
                Ok(true) => slept += 1,
                Ok(false) => {}
                Err(e) => log::error!("Room {room_id} failed to persist on shutdown: {e}"),
            }
        }
        self.prune().await;
        log::info!("Room host stopped ({slept} rooms slept)");
        slept
    }

    /// Ids of rooms with a live actor.
    pub async fn active_rooms(&self) -> Vec<RoomId> {
        let mut active = Vec::new();
        for (room_id, slot) in self.all_slots().await {
            if slot
                .lock()
                .await
                .as_ref()
                .is_some_and(|handle| !handle.is_closed())
            {
                active.push(room_id);
            }
        }
        active.sort();
        active
    }

    pub async fn room_count(&self) -> usize {
        self.active_rooms().await.len()
    }

    /// Slots currently tracked, live or not.
    pub async fn slot_count(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub fn stats(&self) -> HostStats {
        HostStats {
            rooms_created: self.stats.rooms_created.load(Ordering::Relaxed),
            rooms_slept: self.stats.rooms_slept.load(Ordering::Relaxed),
            final_write_failures: self.stats.final_write_failures.load(Ordering::Relaxed),
        }
    }

    /// Run [`evict_idle`](Self::evict_idle) every `every` until the host is dropped.
    pub fn spawn_reaper(self: &Arc<Self>, every: Duration, idle_timeout: Duration) -> JoinHandle<()> {
        let host = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(host) = host.upgrade() else {
                    break;
                };
                let evicted = host.evict_idle(idle_timeout).await;
                if !evicted.is_empty() {
                    log::debug!("Reaper evicted {} rooms", evicted.len());
                }
            }
        })
    }

    async fn sleep_handle(&self, handle: RoomHandle) -> Result<bool, RoomError> {
        match handle.sleep().await {
            Ok(()) => {
                self.stats.rooms_slept.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            Err(RoomError::Sleeping(_)) => Ok(false),
            Err(e) => {
                self.stats.final_write_failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    async fn slot(&self, room_id: &RoomId) -> Slot {
        let mut slots = self.slots.lock().await;
        Arc::clone(slots.entry(room_id.clone()).or_default())
    }

    async fn all_slots(&self) -> Vec<(RoomId, Slot)> {
        let slots = self.slots.lock().await;
        slots
            .iter()
            .map(|(room_id, slot)| (room_id.clone(), Arc::clone(slot)))
            .collect()
    }

    /// Drop empty slots nobody else is holding.
    async fn prune(&self) {
        let mut slots = self.slots.lock().await;
        slots.retain(|_, slot| {
            Arc::strong_count(slot) > 1
                || slot
                    .try_lock()
                    .map(|current| current.is_some())
                    .unwrap_or(true)
        });
    }
}
