pub mod base;
pub mod chat;
pub mod recording;
pub mod room;
pub mod user;

pub use base::{BaseDao, DaoError, DaoResult, DbGuard};
pub use chat::ChatDao;
pub use recording::RecordingDao;
pub use room::RoomDao;
pub use user::UserDao;
