use anyhow::Context;
use connect_api::ws::dispatcher;
use connect_api::ws::signal::ServerSignal;
use connect_api::{build_router, state::AppState};
use connect_config::Settings;
use connect_db::{connect, ensure_indexes};
use connect_services::cluster::ClusterCommand;
use connect_services::media::producer_registry::{ControlOutcome, SOURCE_SCREEN};
use connect_services::routing::HEARTBEAT_INTERVAL;
use connect_services::store::RedisBackend;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "connect_api=debug,connect_services=debug,connect_db=debug,tower_http=info".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::load()?;

    // Startup order: database → shared store → heartbeat → workers →
    // HTTP API → signaling. Database or an empty worker pool are
    // fatal-global; the process exits non-zero and the environment
    // restarts it.
    let db = connect(&settings)
        .await
        .context("database unavailable at startup")?;
    ensure_indexes(&db).await?;

    let backend = RedisBackend::connect(&settings.redis.url())
        .await
        .map_err(|e| anyhow::anyhow!("shared store unreachable at startup: {e}"))?;

    let state = AppState::new(db, Arc::new(backend), settings.clone()).await?;
    info!(
        instance_id = %state.instance_id,
        workers = state.worker_pool.worker_count(),
        "connect control plane starting"
    );

    if let Err(e) = state.routing.heartbeat().await {
        warn!(%e, "initial heartbeat failed, continuing");
    }
    let heartbeat = {
        let routing = state.routing.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = routing.heartbeat().await {
                    warn!(%e, "heartbeat failed");
                }
            }
        })
    };

    let cluster = spawn_cluster_subscriber(state.clone());

    let app = build_router(state.clone());
    let (shutdown_tx, _) = tokio::sync::watch::channel(false);
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        });
    }

    let api_addr = format!("{}:{}", settings.app.host, settings.app.port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr).await?;
    info!("API listening on {api_addr}");

    let serve_api = {
        let mut rx = shutdown_tx.subscribe();
        axum::serve(
            api_listener,
            app.clone()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = rx.changed().await;
        })
    };

    // A distinct signaling port gets its own listener over the same router.
    if settings.server.signaling_port != settings.app.port {
        let ws_addr = format!("{}:{}", settings.app.host, settings.server.signaling_port);
        let ws_listener = tokio::net::TcpListener::bind(&ws_addr).await?;
        info!("signaling listening on {ws_addr}");

        let serve_ws = {
            let mut rx = shutdown_tx.subscribe();
            axum::serve(
                ws_listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = rx.changed().await;
            })
        };
        tokio::try_join!(serve_api, serve_ws)?;
    } else {
        serve_api.await?;
    }

    // Reverse order, idempotent: signaling listeners are already down.
    info!("shutting down");
    state.recording.stop_all().await;
    cluster.abort();
    heartbeat.abort();
    state.routing.shutdown().await;
    info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Applies close/pause/resume commands delegated from peer nodes to the
/// local registries and notifies this node's room members.
fn spawn_cluster_subscriber(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut inbox = match state.cluster.subscribe_own().await {
            Ok(inbox) => inbox,
            Err(e) => {
                warn!(%e, "cluster channel unavailable; cross-node controls disabled");
                return;
            }
        };
        while let Some(command) = inbox.recv().await {
            apply_cluster_command(&state, command).await;
        }
    })
}

async fn apply_cluster_command(state: &AppState, command: ClusterCommand) {
    match command {
        ClusterCommand::CloseProducer {
            producer_id,
            room_id,
            user_id,
        } => match state.producers.close(&user_id, &producer_id).await {
            ControlOutcome::Done(meta) => {
                let signal = if meta.source == SOURCE_SCREEN {
                    ServerSignal::ScreenShareStopped {
                        producer_id: meta.producer_id,
                        user_id: meta.user_id,
                    }
                } else {
                    ServerSignal::ProducerClosed {
                        producer_id: meta.producer_id,
                        user_id: meta.user_id,
                    }
                };
                dispatcher::broadcast_room(&state.signals, &room_id, None, &signal).await;
            }
            _ => debug!(%producer_id, "delegated close had no local producer"),
        },
        ClusterCommand::PauseProducer {
            producer_id,
            room_id,
            user_id,
        } => {
            if let ControlOutcome::Done(meta) =
                state.producers.pause(&user_id, &producer_id).await
            {
                dispatcher::broadcast_room(
                    &state.signals,
                    &room_id,
                    None,
                    &ServerSignal::ProducerPaused {
                        producer_id: meta.producer_id,
                        user_id: meta.user_id,
                    },
                )
                .await;
            }
        }
        ClusterCommand::ResumeProducer {
            producer_id,
            room_id,
            user_id,
        } => {
            if let ControlOutcome::Done(meta) =
                state.producers.resume(&user_id, &producer_id).await
            {
                dispatcher::broadcast_room(
                    &state.signals,
                    &room_id,
                    None,
                    &ServerSignal::ProducerResumed {
                        producer_id: meta.producer_id,
                        user_id: meta.user_id,
                    },
                )
                .await;
            }
        }
    }
}
