pub mod auth;
pub mod breaker;
pub mod cluster;
pub mod codes;
pub mod dao;
pub mod media;
pub mod metrics;
pub mod mute;
pub mod recording;
pub mod retry;
pub mod routing;
pub mod store;

pub use auth::AuthService;
pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use metrics::Metrics;
pub use retry::RetryPolicy;
pub use routing::RoomRoutingService;
pub use store::StoreClient;
