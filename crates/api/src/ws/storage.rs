use axum::extract::ws::{Message, WebSocket};
use bson::oid::ObjectId;
use connect_services::Metrics;
use dashmap::DashMap;
use futures::stream::SplitSink;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub type WsSender = Arc<Mutex<SplitSink<WebSocket, Message>>>;

pub struct SocketEntry {
    pub sender: WsSender,
    pub user_id: ObjectId,
}

/// Live sockets on this node plus the room-multicast index. One entry per
/// connection; the same user may hold several sockets (tabs/devices).
pub struct SignalStorage {
    sockets: DashMap<Uuid, SocketEntry>,
    rooms: DashMap<String, HashSet<Uuid>>,
    metrics: Option<Arc<Metrics>>,
}

impl SignalStorage {
    pub fn new(metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            sockets: DashMap::new(),
            rooms: DashMap::new(),
            metrics,
        }
    }

    pub fn add_socket(&self, socket_id: Uuid, user_id: ObjectId, sender: WsSender) {
        self.sockets.insert(socket_id, SocketEntry { sender, user_id });
        self.update_gauge();
    }

    pub fn remove_socket(&self, socket_id: &Uuid) {
        self.sockets.remove(socket_id);
        self.update_gauge();
    }

    pub fn sender_of(&self, socket_id: &Uuid) -> Option<WsSender> {
        self.sockets.get(socket_id).map(|e| e.sender.clone())
    }

    pub fn join_room(&self, room_key: &str, socket_id: Uuid) {
        self.rooms
            .entry(room_key.to_string())
            .or_default()
            .insert(socket_id);
    }

    pub fn leave_room(&self, room_key: &str, socket_id: &Uuid) {
        if let Some(mut members) = self.rooms.get_mut(room_key) {
            members.remove(socket_id);
            let empty = members.is_empty();
            drop(members);
            if empty {
                self.rooms.remove_if(room_key, |_, members| members.is_empty());
            }
        }
    }

    pub fn room_sockets(&self, room_key: &str) -> Vec<Uuid> {
        self.rooms
            .get(room_key)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn room_is_empty(&self, room_key: &str) -> bool {
        self.rooms
            .get(room_key)
            .map(|members| members.is_empty())
            .unwrap_or(true)
    }

    pub fn sockets_of_user_in_room(&self, room_key: &str, user_id: &ObjectId) -> Vec<Uuid> {
        self.room_sockets(room_key)
            .into_iter()
            .filter(|socket_id| {
                self.sockets
                    .get(socket_id)
                    .map(|e| &e.user_id == user_id)
                    .unwrap_or(false)
            })
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sockets.len()
    }

    fn update_gauge(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.sessions.set(self.sockets.len() as i64);
        }
    }
}
