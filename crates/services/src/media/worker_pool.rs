use crate::metrics::Metrics;
use connect_config::MediasoupSettings;
use mediasoup::worker::{Worker, WorkerLogLevel, WorkerLogTag, WorkerSettings};
use mediasoup::worker_manager::WorkerManager;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Pool of media workers with round-robin selection, death detection and
/// restart-in-place. Routers living on a dead worker are lost; their rooms
/// recreate routers on reconnect.
pub struct WorkerPool {
    manager: WorkerManager,
    slots: RwLock<Vec<WorkerSlot>>,
    next: AtomicUsize,
    restart_tx: mpsc::UnboundedSender<usize>,
    settings: MediasoupSettings,
    metrics: Option<Arc<Metrics>>,
}

struct WorkerSlot {
    worker: Worker,
    dead: Arc<AtomicBool>,
    routers: Arc<AtomicUsize>,
}

impl WorkerSlot {
    fn is_live(&self) -> bool {
        !self.dead.load(Ordering::SeqCst) && !self.worker.closed()
    }
}

impl WorkerPool {
    /// Spawns `num_workers` workers (0 = one per CPU core). The restart
    /// loop is the sole consumer of death notices, so at most one restart
    /// runs at a time.
    pub async fn new(
        settings: &MediasoupSettings,
        metrics: Option<Arc<Metrics>>,
    ) -> anyhow::Result<Arc<Self>> {
        let count = if settings.num_workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            settings.num_workers as usize
        };

        let (restart_tx, restart_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(Self {
            manager: WorkerManager::new(),
            slots: RwLock::new(Vec::new()),
            next: AtomicUsize::new(0),
            restart_tx,
            settings: settings.clone(),
            metrics,
        });

        let mut slots = Vec::with_capacity(count);
        for index in 0..count {
            slots.push(pool.spawn_worker(index).await?);
        }
        *pool.slots.write() = slots;
        pool.update_worker_gauge();

        tokio::spawn(Self::restart_loop(pool.clone(), restart_rx));
        Ok(pool)
    }

    fn worker_settings(&self) -> WorkerSettings {
        let mut worker_settings = WorkerSettings::default();
        worker_settings.rtc_port_range = self.settings.rtc_min_port..=self.settings.rtc_max_port;
        worker_settings.log_level = parse_log_level(&self.settings.log_level);
        let tags: Vec<WorkerLogTag> = self
            .settings
            .log_tags
            .iter()
            .filter_map(|t| parse_log_tag(t))
            .collect();
        if !tags.is_empty() {
            worker_settings.log_tags = tags;
        }
        worker_settings
    }

    async fn spawn_worker(&self, index: usize) -> anyhow::Result<WorkerSlot> {
        let worker = self
            .manager
            .create_worker(self.worker_settings())
            .await
            .map_err(|e| anyhow::anyhow!("failed to create media worker {}: {}", index, e))?;

        let dead = Arc::new(AtomicBool::new(false));
        let worker_id = worker.id();
        let flag = dead.clone();
        let tx = self.restart_tx.clone();
        worker
            .on_dead(move |reason| {
                error!(%worker_id, ?reason, "media worker died");
                flag.store(true, Ordering::SeqCst);
                let _ = tx.send(index);
            })
            .detach();

        info!(%worker_id, index, "media worker created");
        Ok(WorkerSlot {
            worker,
            dead,
            routers: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Round-robin over live workers. Observing a dead slot nudges the
    /// restart loop; duplicates are deduplicated by the dead flag check
    /// there.
    pub fn acquire(&self) -> Option<(Worker, usize)> {
        let slots = self.slots.read();
        let len = slots.len();
        if len == 0 {
            return None;
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        for offset in 0..len {
            let index = (start + offset) % len;
            let slot = &slots[index];
            if !slot.is_live() {
                slot.dead.store(true, Ordering::SeqCst);
                let _ = self.restart_tx.send(index);
                continue;
            }
            return Some((slot.worker.clone(), index));
        }
        None
    }

    async fn restart_loop(pool: Arc<Self>, mut rx: mpsc::UnboundedReceiver<usize>) {
        while let Some(index) = rx.recv().await {
            let (needs_restart, lost_routers) = {
                let slots = pool.slots.read();
                match slots.get(index) {
                    Some(slot) => (!slot.is_live(), slot.routers.load(Ordering::SeqCst)),
                    None => (false, 0),
                }
            };
            if !needs_restart {
                continue;
            }

            warn!(index, lost_routers, "restarting media worker");
            match pool.spawn_worker(index).await {
                Ok(slot) => {
                    let mut slots = pool.slots.write();
                    if index < slots.len() {
                        slots[index] = slot;
                    }
                    drop(slots);
                    pool.update_worker_gauge();
                }
                Err(e) => {
                    error!(index, %e, "worker restart failed, retrying");
                    let tx = pool.restart_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        let _ = tx.send(index);
                    });
                }
            }
        }
    }

    /// Advisory router accounting per slot.
    pub fn register_router(&self, index: usize) {
        if let Some(slot) = self.slots.read().get(index) {
            slot.routers.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn unregister_router(&self, index: usize) {
        if let Some(slot) = self.slots.read().get(index) {
            let _ = slot
                .routers
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        }
    }

    pub fn live_count(&self) -> usize {
        self.slots.read().iter().filter(|s| s.is_live()).count()
    }

    pub fn worker_count(&self) -> usize {
        self.slots.read().len()
    }

    fn update_worker_gauge(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.workers_live.set(self.live_count() as i64);
        }
    }
}

fn parse_log_level(level: &str) -> WorkerLogLevel {
    match level.to_ascii_lowercase().as_str() {
        "debug" => WorkerLogLevel::Debug,
        "warn" => WorkerLogLevel::Warn,
        "none" => WorkerLogLevel::None,
        _ => WorkerLogLevel::Error,
    }
}

fn parse_log_tag(tag: &str) -> Option<WorkerLogTag> {
    match tag.to_ascii_lowercase().as_str() {
        "info" => Some(WorkerLogTag::Info),
        "ice" => Some(WorkerLogTag::Ice),
        "dtls" => Some(WorkerLogTag::Dtls),
        "rtp" => Some(WorkerLogTag::Rtp),
        "srtp" => Some(WorkerLogTag::Srtp),
        "rtcp" => Some(WorkerLogTag::Rtcp),
        "rtx" => Some(WorkerLogTag::Rtx),
        "bwe" => Some(WorkerLogTag::Bwe),
        "score" => Some(WorkerLogTag::Score),
        "simulcast" => Some(WorkerLogTag::Simulcast),
        "svc" => Some(WorkerLogTag::Svc),
        "sctp" => Some(WorkerLogTag::Sctp),
        "message" => Some(WorkerLogTag::Message),
        _ => None,
    }
}
