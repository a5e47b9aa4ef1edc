use mongodb::{Database, IndexModel, options::IndexOptions};
use tracing::info;

pub async fn ensure_indexes(db: &Database) -> Result<(), mongodb::error::Error> {
    // Users
    create_indexes(
        db,
        "users",
        vec![index_unique(bson::doc! { "email": 1 })],
    )
    .await?;

    // Rooms
    create_indexes(
        db,
        "rooms",
        vec![
            index_unique(bson::doc! { "room_code": 1 }),
            index(bson::doc! { "host_user_id": 1 }),
            index(bson::doc! { "status": 1 }),
        ],
    )
    .await?;

    // Room participants
    create_indexes(
        db,
        "room_participants",
        vec![
            index_unique(bson::doc! { "room_id": 1, "user_id": 1 }),
            index(bson::doc! { "user_id": 1 }),
            index(bson::doc! { "room_id": 1, "left_at": 1 }),
        ],
    )
    .await?;

    // Join requests: one pending request per (room, user)
    create_indexes(
        db,
        "join_requests",
        vec![
            index_unique_partial(
                bson::doc! { "room_id": 1, "user_id": 1 },
                bson::doc! { "status": "pending" },
            ),
            index(bson::doc! { "room_id": 1, "status": 1 }),
        ],
    )
    .await?;

    // Chat messages
    create_indexes(
        db,
        "chat_messages",
        vec![
            index(bson::doc! { "room_id": 1, "created_at": -1 }),
            index(bson::doc! { "room_id": 1, "recipient_id": 1, "created_at": -1 }),
        ],
    )
    .await?;

    // Recording sessions
    create_indexes(
        db,
        "recording_sessions",
        vec![
            index(bson::doc! { "room_id": 1, "status": 1 }),
            index(bson::doc! { "started_at": -1 }),
        ],
    )
    .await?;

    info!("MongoDB indexes ensured");
    Ok(())
}

async fn create_indexes(
    db: &Database,
    collection: &str,
    indexes: Vec<IndexModel>,
) -> Result<(), mongodb::error::Error> {
    db.collection::<bson::Document>(collection)
        .create_indexes(indexes)
        .await?;
    Ok(())
}

fn index(keys: bson::Document) -> IndexModel {
    IndexModel::builder().keys(keys).build()
}

fn index_unique(keys: bson::Document) -> IndexModel {
    IndexModel::builder()
        .keys(keys)
        .options(IndexOptions::builder().unique(true).build())
        .build()
}

fn index_unique_partial(keys: bson::Document, filter: bson::Document) -> IndexModel {
    IndexModel::builder()
        .keys(keys)
        .options(
            IndexOptions::builder()
                .unique(true)
                .partial_filter_expression(filter)
                .build(),
        )
        .build()
}
