//! Shared-store key schema. Every cross-node key lives under the `connect:`
//! namespace: `routing:*` for placement and liveness, `state:*` for the
//! resource mirror, `cluster:*` for node-to-node RPC.

use std::time::Duration;

pub const ROOM_ROUTE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const SERVER_STATUS_TTL: Duration = Duration::from_secs(90);
pub const STATE_TTL: Duration = Duration::from_secs(60 * 60);
pub const ROUTER_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const MUTE_TTL: Duration = Duration::from_secs(60 * 60);
pub const RECORDING_TTL: Duration = Duration::from_secs(15 * 60);

pub fn room_route(room_id: &str) -> String {
    format!("connect:routing:room:{room_id}")
}

pub fn server_rooms(server_id: &str) -> String {
    format!("connect:routing:server:{server_id}:rooms")
}

pub fn server_status(server_id: &str) -> String {
    format!("connect:routing:server:{server_id}:status")
}

pub fn server_status_pattern() -> &'static str {
    "connect:routing:server:*:status"
}

pub fn producer(producer_id: &str) -> String {
    format!("connect:state:producer:{producer_id}")
}

pub fn consumer(consumer_id: &str) -> String {
    format!("connect:state:consumer:{consumer_id}")
}

pub fn transport(transport_id: &str) -> String {
    format!("connect:state:transport:{transport_id}")
}

pub fn router(room_id: &str) -> String {
    format!("connect:state:router:{room_id}")
}

pub fn socket_producers(socket_id: &str) -> String {
    format!("connect:state:socket:{socket_id}:producers")
}

pub fn socket_consumers(socket_id: &str) -> String {
    format!("connect:state:socket:{socket_id}:consumers")
}

pub fn socket_transports(socket_id: &str) -> String {
    format!("connect:state:socket:{socket_id}:transports")
}

pub fn room_producers(room_id: &str) -> String {
    format!("connect:state:room:{room_id}:producers")
}

pub fn room_mute(room_code: &str, user_id: &str) -> String {
    format!("connect:state:room:{room_code}:mute:{user_id}")
}

pub fn room_control(room_code: &str) -> String {
    format!("connect:state:room:{room_code}:control")
}

pub fn recording(room_id: &str) -> String {
    format!("connect:state:recording:{room_id}")
}

pub fn cluster_channel(server_id: &str) -> String {
    format!("connect:cluster:server:{server_id}")
}

/// Extracts the server id from a `connect:routing:server:<id>:status` key.
pub fn server_id_from_status_key(key: &str) -> Option<&str> {
    key.strip_prefix("connect:routing:server:")?
        .strip_suffix(":status")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_key_round_trips() {
        let key = server_status("node-1");
        assert_eq!(server_id_from_status_key(&key), Some("node-1"));
        assert_eq!(server_id_from_status_key("connect:routing:room:x"), None);
    }
}
