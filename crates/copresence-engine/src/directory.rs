//! Room lookup and coordinator lifecycle.
//!
//! `room()` is the only way to reach a coordinator. It spawns one on first
//! use and replaces it if the previous one has exited, which is how rooms
//! recover after a coordinator crash: sessions call `room()` again and
//! re-announce into the fresh instance.

use std::collections::HashMap;

use copresence_core::RoomId;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::room::RoomHandle;

/// All live room coordinators on this node.
pub struct RoomDirectory {
    config: EngineConfig,
    rooms: Mutex<HashMap<RoomId, RoomHandle>>,
}

impl RoomDirectory {
    /// Empty directory.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// Handle for `room_id`, starting a coordinator if none is running.
    pub fn room(&self, room_id: &RoomId) -> RoomHandle {
        let mut rooms = self.rooms.lock();
        let handle = match rooms.get(room_id) {
            Some(handle) if !handle.is_closed() => return handle.clone(),
            Some(dead) => {
                let counter = dead.anonymous_counter();
                warn!(%room_id, counter, "room coordinator gone, restarting");
                dead.respawn(&self.config)
            }
            None => {
                debug!(%room_id, "starting room coordinator");
                RoomHandle::spawn(room_id.clone(), &self.config)
            }
        };
        let _ = rooms.insert(room_id.clone(), handle.clone());
        handle
    }

    /// Handle for `room_id` without starting anything.
    pub fn get(&self, room_id: &RoomId) -> Option<RoomHandle> {
        self.rooms
            .lock()
            .get(room_id)
            .filter(|h| !h.is_closed())
            .cloned()
    }

    /// Drop rooms that are empty and that no session holds a handle to.
    /// Returns how many were stopped.
    pub async fn prune(&self) -> usize {
        let idle: Vec<RoomHandle> = {
            let mut rooms = self.rooms.lock();
            let ids: Vec<RoomId> = rooms
                .iter()
                .filter(|(_, h)| h.is_closed() || (h.handle_count() == 1 && h.member_count() == 0))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| rooms.remove(id)).collect()
        };
        for handle in &idle {
            debug!(room_id = %handle.room_id(), "pruning idle room");
            handle.shutdown().await;
        }
        idle.len()
    }

    /// Rooms currently known.
    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }

    /// Total live records across all rooms.
    pub fn member_count(&self) -> usize {
        self.rooms.lock().values().map(RoomHandle::member_count).sum()
    }

    /// Stop every coordinator.
    pub async fn shutdown_all(&self) {
        let handles: Vec<RoomHandle> = self.rooms.lock().drain().map(|(_, h)| h).collect();
        info!(rooms = handles.len(), "stopping room coordinators");
        for handle in handles {
            handle.shutdown().await;
        }
    }
}
