use connect_config::Settings;
use connect_services::cluster::ClusterRpc;
use connect_services::dao::{ChatDao, DbGuard, RecordingDao, RoomDao, UserDao};
use connect_services::media::consumer_registry::ConsumerRegistry;
use connect_services::media::producer_registry::ProducerRegistry;
use connect_services::media::router_registry::RouterRegistry;
use connect_services::media::transport_registry::TransportRegistry;
use connect_services::media::worker_pool::WorkerPool;
use connect_services::mute::MuteService;
use connect_services::recording::RecordingOrchestrator;
use connect_services::store::StoreBackend;
use connect_services::{AuthService, Metrics, RoomRoutingService, StoreClient};
use mongodb::Database;
use std::sync::Arc;

use crate::ws::storage::SignalStorage;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub settings: Settings,
    pub instance_id: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub auth: Arc<AuthService>,
    pub users: Arc<UserDao>,
    pub rooms: Arc<RoomDao>,
    pub chat: Arc<ChatDao>,
    pub recordings: Arc<RecordingDao>,
    pub store: StoreClient,
    pub routing: Arc<RoomRoutingService>,
    pub cluster: Arc<ClusterRpc>,
    pub worker_pool: Arc<WorkerPool>,
    pub routers: Arc<RouterRegistry>,
    pub transports: Arc<TransportRegistry>,
    pub producers: Arc<ProducerRegistry>,
    pub consumers: Arc<ConsumerRegistry>,
    pub mute: Arc<MuteService>,
    pub recording: Arc<RecordingOrchestrator>,
    pub signals: Arc<SignalStorage>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    /// Wires the components in dependency order. Fails (fatal-global) when
    /// the worker pool comes up empty.
    pub async fn new(
        db: Database,
        backend: Arc<dyn StoreBackend>,
        settings: Settings,
    ) -> anyhow::Result<Self> {
        let instance_id = if settings.server.instance_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            settings.server.instance_id.clone()
        };

        let metrics = Arc::new(Metrics::new()?);
        let store = StoreClient::new(backend, Some(metrics.clone()));

        let guard = DbGuard::new(Some(metrics.clone()));
        let auth = Arc::new(AuthService::new(settings.jwt.clone()));
        let users = Arc::new(UserDao::new(&db, guard.clone()));
        let rooms = Arc::new(RoomDao::new(&db, guard.clone()));
        let chat = Arc::new(ChatDao::new(&db, guard.clone()));
        let recordings = Arc::new(RecordingDao::new(&db, guard));

        let routing = Arc::new(RoomRoutingService::new(
            store.clone(),
            instance_id.clone(),
            settings.server.signaling_port,
            settings.app.port,
        ));
        let cluster = Arc::new(ClusterRpc::new(store.clone(), instance_id.clone()));

        let worker_pool = WorkerPool::new(&settings.mediasoup, Some(metrics.clone())).await?;
        if worker_pool.live_count() == 0 {
            anyhow::bail!("no live media workers after startup");
        }

        let routers = Arc::new(RouterRegistry::new(
            worker_pool.clone(),
            routing.clone(),
            store.clone(),
            Some(metrics.clone()),
        ));
        let transports = TransportRegistry::new(
            store.clone(),
            instance_id.clone(),
            &settings.mediasoup,
            Some(metrics.clone()),
        );
        let producers = ProducerRegistry::new(
            store.clone(),
            instance_id.clone(),
            Some(metrics.clone()),
        );
        let consumers = ConsumerRegistry::new(
            store.clone(),
            instance_id.clone(),
            Some(metrics.clone()),
        );

        let mute = Arc::new(MuteService::new(store.clone(), rooms.clone()));
        let recording = RecordingOrchestrator::new(
            settings.recording.clone(),
            &settings.aws,
            store.clone(),
            recordings.clone(),
            routers.clone(),
            producers.clone(),
            instance_id.clone(),
            Some(metrics.clone()),
        )
        .await;

        let signals = Arc::new(SignalStorage::new(Some(metrics.clone())));

        Ok(Self {
            db,
            settings,
            instance_id,
            started_at: chrono::Utc::now(),
            auth,
            users,
            rooms,
            chat,
            recordings,
            store,
            routing,
            cluster,
            worker_pool,
            routers,
            transports,
            producers,
            consumers,
            mute,
            recording,
            signals,
            metrics,
        })
    }
}
