use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::RelayError;
use crate::models::Room;

/// Process-wide room catalog. Lookup by name is case-insensitive and
/// whitespace-trimmed; rooms vanish in the same critical section that
/// removes their last member.
pub struct RoomRegistry {
    inner: RwLock<HashMap<String, Room>>,
    dirty: AtomicBool,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            dirty: AtomicBool::new(false),
        }
    }

    /// Create a room and make the creator its first member.
    pub async fn create(&self, name: &str, by: &str) -> Result<Room, RelayError> {
        let display = name.trim();
        if display.is_empty() {
            return Err(RelayError::RoomNameEmpty);
        }
        let folded = Room::fold_name(display);

        let mut rooms = self.inner.write().await;
        if rooms.values().any(|r| Room::fold_name(&r.name) == folded) {
            return Err(RelayError::RoomAlreadyExists);
        }

        let room = Room {
            id: Uuid::new_v4().to_string(),
            name: display.to_string(),
            created: Utc::now(),
            created_by: by.to_string(),
            members: std::iter::once(by.to_string()).collect(),
        };
        rooms.insert(room.id.clone(), room.clone());
        self.dirty.store(true, Ordering::Relaxed);
        info!(room_id = %room.id, name = %room.name, created_by = %by, "room created");
        Ok(room)
    }

    /// Add a member. `key` is either the server-minted id or the display
    /// name (case-insensitive, trimmed).
    pub async fn join(&self, key: &str, device_id: &str) -> Result<Room, RelayError> {
        let folded = Room::fold_name(key);
        let mut rooms = self.inner.write().await;
        let room = rooms
            .values_mut()
            .find(|r| r.id == key || Room::fold_name(&r.name) == folded)
            .ok_or(RelayError::RoomNotFound)?;
        room.members.insert(device_id.to_string());
        self.dirty.store(true, Ordering::Relaxed);
        Ok(room.clone())
    }

    /// Remove a member; delete the room if it empties out. Returns the room
    /// state after removal and whether it was deleted.
    pub async fn leave(&self, room_id: &str, device_id: &str) -> Option<(Room, bool)> {
        let mut rooms = self.inner.write().await;
        let room = rooms.get_mut(room_id)?;
        if !room.members.remove(device_id) {
            return None;
        }
        self.dirty.store(true, Ordering::Relaxed);
        let snapshot = room.clone();
        if room.members.is_empty() {
            rooms.remove(room_id);
            debug!(room_id = %room_id, "empty room deleted");
            return Some((snapshot, true));
        }
        Some((snapshot, false))
    }

    pub async fn get(&self, room_id: &str) -> Option<Room> {
        self.inner.read().await.get(room_id).cloned()
    }

    pub async fn member_count(&self, room_id: &str) -> usize {
        self.inner
            .read()
            .await
            .get(room_id)
            .map(|r| r.members.len())
            .unwrap_or(0)
    }

    pub async fn snapshot(&self) -> Vec<Room> {
        let rooms = self.inner.read().await;
        let mut all: Vec<Room> = rooms.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub async fn load(&self, rooms: Vec<Room>) {
        let mut inner = self.inner.write().await;
        for room in rooms {
            inner.insert(room.id.clone(), room);
        }
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.len()
    }

    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::Relaxed)
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}
