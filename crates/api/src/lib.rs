pub mod error;
pub mod extractors;
pub mod routes;
pub mod state;
pub mod ws;

use axum::{
    Router,
    routing::{get, patch, post},
};
use state::AppState;
use std::sync::Arc;
use std::time::Duration;
use tower_governor::{GovernorLayer, governor::GovernorConfigBuilder};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // One bucket of `max` requests refilled over the configured window;
    // applied to the credential endpoints only.
    let rate = &state.settings.rate_limit;
    let replenish_ms =
        (rate.time_window_secs * 1000).max(1) / u64::from(rate.max.max(1));
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .period(Duration::from_millis(replenish_ms.max(1)))
            .burst_size(rate.max.max(1))
            .finish()
            .expect("rate limit configuration is valid"),
    );

    let auth_routes = Router::new()
        .route("/register", post(routes::auth::register))
        .route("/login", post(routes::auth::login))
        .route("/refresh", post(routes::auth::refresh))
        .route("/me", get(routes::auth::me))
        .layer(GovernorLayer {
            config: governor_conf,
        });

    let room_routes = Router::new()
        .route("/", post(routes::room::create))
        .route("/{room_code}", get(routes::room::get))
        .route("/{room_code}/join", post(routes::room::join))
        .route("/{room_code}/leave", post(routes::room::leave))
        .route("/{room_code}/request-join", post(routes::room::request_join))
        .route(
            "/{room_code}/approve/{request_id}",
            post(routes::room::approve),
        )
        .route(
            "/{room_code}/reject/{request_id}",
            post(routes::room::reject),
        )
        .route(
            "/{room_code}/pending-requests",
            get(routes::room::pending_requests),
        )
        .route("/{room_code}/settings", patch(routes::room::update_settings))
        .route(
            "/{room_code}/recording/start",
            post(routes::room::recording_start),
        )
        .route(
            "/{room_code}/recording/stop",
            post(routes::room::recording_stop),
        );

    let health = Router::new()
        .route("/health", get(routes::health::health))
        .route("/health/live", get(routes::health::live))
        .route("/health/ready", get(routes::health::ready))
        .route("/health/info", get(routes::health::info))
        .route("/metrics", get(routes::health::metrics));

    Router::new()
        .nest("/auth", auth_routes)
        .nest("/rooms", room_routes)
        .merge(health)
        .route("/ws", get(ws::handler::ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
