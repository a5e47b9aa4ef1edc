//! Socket-scoped mirror cleanup. The registries clean their own entries as
//! resources close; this pass sweeps whatever survived a partial failure so
//! that after disconnect the store holds nothing for the socket.

use super::{PipelineOp, StoreClient, StoreError, keys};
use serde::Deserialize;
use tracing::debug;

#[derive(Deserialize)]
struct ProducerRoom {
    room_id: String,
}

/// Removes every mirror entry owned by `socket_id`: the per-resource JSON
/// keys, the room producer-index memberships, and the three per-socket sets.
pub async fn clean_socket(store: &StoreClient, socket_id: &str) -> Result<(), StoreError> {
    let mut ops = Vec::new();

    for producer_id in store.set_members(&keys::socket_producers(socket_id)).await? {
        let key = keys::producer(&producer_id);
        // The room index membership needs the entry's room; tolerate an
        // already-expired entry.
        if let Ok(Some(meta)) = store.get_json::<ProducerRoom>(&key).await {
            ops.push(PipelineOp::SetRemove {
                key: keys::room_producers(&meta.room_id),
                member: producer_id.clone(),
            });
        }
        ops.push(PipelineOp::Delete { key });
    }

    for consumer_id in store.set_members(&keys::socket_consumers(socket_id)).await? {
        ops.push(PipelineOp::Delete {
            key: keys::consumer(&consumer_id),
        });
    }

    for transport_id in store.set_members(&keys::socket_transports(socket_id)).await? {
        ops.push(PipelineOp::Delete {
            key: keys::transport(&transport_id),
        });
    }

    ops.push(PipelineOp::Delete {
        key: keys::socket_producers(socket_id),
    });
    ops.push(PipelineOp::Delete {
        key: keys::socket_consumers(socket_id),
    });
    ops.push(PipelineOp::Delete {
        key: keys::socket_transports(socket_id),
    });

    store.pipeline(ops).await?;
    debug!(%socket_id, "socket mirror cleaned");
    Ok(())
}

/// True while any per-socket mirror set still has members.
pub async fn socket_dirty(store: &StoreClient, socket_id: &str) -> Result<bool, StoreError> {
    for key in [
        keys::socket_producers(socket_id),
        keys::socket_consumers(socket_id),
        keys::socket_transports(socket_id),
    ] {
        if store.set_cardinality(&key).await? > 0 {
            return Ok(true);
        }
    }
    Ok(false)
}
