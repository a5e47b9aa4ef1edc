pub mod chat_message;
pub mod participant;
pub mod recording;
pub mod room;
pub mod user;

pub use chat_message::ChatMessage;
pub use participant::{ParticipantRole, RoomParticipant};
pub use recording::{AssetType, RecordingAsset, RecordingSession, RecordingStatus};
pub use room::{JoinRequest, JoinRequestStatus, Room, RoomSettings, RoomStatus};
pub use user::User;
