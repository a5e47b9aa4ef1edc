pub mod compositor;
pub mod ports;
pub mod sdp;
pub mod upload;

use crate::dao::{DaoError, RecordingDao};
use crate::media::producer_registry::{ProducerEvent, ProducerMeta, ProducerRegistry};
use crate::media::router_registry::RouterRegistry;
use crate::metrics::Metrics;
use crate::store::{StoreClient, keys};
use bson::oid::ObjectId;
use compositor::{CompositorHandle, CompositorSpec, SIGINT_GRACE, session_paths};
use connect_db::models::{AssetType, RecordingAsset, RecordingStatus};
use connect_config::{AwsSettings, RecordingSettings};
use dashmap::DashMap;
use mediasoup::plain_transport::{
    PlainTransport, PlainTransportOptions, PlainTransportRemoteParameters,
};
use mediasoup::prelude::*;
use ports::{PortAllocator, PortPair};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use upload::ArtifactUploader;

#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("recording is disabled")]
    Disabled,
    #[error("recording already active for this room")]
    AlreadyActive,
    #[error("no recording active for this room")]
    NotActive,
    #[error("room has no active router on this node")]
    NoRouter,
    #[error("no recording ports available")]
    NoPorts,
    #[error(transparent)]
    Db(#[from] DaoError),
    #[error("SFU error: {0}")]
    Sfu(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeRole {
    Primary,
    Pip,
}

/// Screen share wins the full frame; otherwise the first-attached video
/// does. Everyone else is picture-in-picture.
pub fn video_roles(sources: &[&str]) -> Vec<CompositeRole> {
    if sources.is_empty() {
        return Vec::new();
    }
    let primary = sources
        .iter()
        .position(|s| *s == "screen")
        .unwrap_or(0);
    (0..sources.len())
        .map(|i| {
            if i == primary {
                CompositeRole::Primary
            } else {
                CompositeRole::Pip
            }
        })
        .collect()
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordingMirror {
    session_id: String,
    room_id: String,
    server_id: String,
    status: String,
    started_at_ms: i64,
}

#[derive(Debug)]
enum RecordingCommand {
    ProducerAdded(ProducerMeta),
    Stop,
    ProcessExited(ExitStatus),
}

struct RecordingHandle {
    tx: mpsc::Sender<RecordingCommand>,
    session_id: ObjectId,
}

/// Opt-in composite recording of a room: plain transports feeding an
/// external ffmpeg process, with the artifact persisted and uploaded.
pub struct RecordingOrchestrator {
    settings: RecordingSettings,
    store: StoreClient,
    dao: Arc<RecordingDao>,
    routers: Arc<RouterRegistry>,
    producers: Arc<ProducerRegistry>,
    ports: Arc<PortAllocator>,
    uploader: Option<Arc<ArtifactUploader>>,
    active: Arc<DashMap<String, RecordingHandle>>,
    instance_id: String,
    metrics: Option<Arc<Metrics>>,
}

impl RecordingOrchestrator {
    pub async fn new(
        settings: RecordingSettings,
        aws: &AwsSettings,
        store: StoreClient,
        dao: Arc<RecordingDao>,
        routers: Arc<RouterRegistry>,
        producers: Arc<ProducerRegistry>,
        instance_id: String,
        metrics: Option<Arc<Metrics>>,
    ) -> Arc<Self> {
        let uploader = if settings.enabled {
            ArtifactUploader::new(&settings, aws).await.map(Arc::new)
        } else {
            None
        };
        let ports = Arc::new(PortAllocator::new(settings.port_min, settings.port_max));

        let orchestrator = Arc::new(Self {
            settings,
            store,
            dao,
            routers,
            producers,
            ports,
            uploader,
            active: Arc::new(DashMap::new()),
            instance_id,
            metrics,
        });
        orchestrator.spawn_producer_feed();
        orchestrator
    }

    /// Routes producer-added events from the local registry into the
    /// per-room recording mailboxes.
    fn spawn_producer_feed(self: &Arc<Self>) {
        let mut events = self.producers.subscribe();
        let active = self.active.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ProducerEvent::Added(meta)) => {
                        if let Some(handle) = active.get(&meta.room_id) {
                            let _ = handle
                                .tx
                                .send(RecordingCommand::ProducerAdded(meta.clone()))
                                .await;
                        }
                    }
                    Ok(ProducerEvent::Closed(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "recording producer feed lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    pub fn is_active(&self, room_id: &str) -> bool {
        self.active.contains_key(room_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub async fn start(
        &self,
        room_id: ObjectId,
        host_user_id: ObjectId,
    ) -> Result<ObjectId, RecordingError> {
        if !self.settings.enabled {
            return Err(RecordingError::Disabled);
        }
        let room_key = room_id.to_hex();
        if self.active.contains_key(&room_key) {
            return Err(RecordingError::AlreadyActive);
        }

        let router = self
            .routers
            .get(&room_key)
            .ok_or(RecordingError::NoRouter)?;
        let ports = self.ports.allocate_pair().ok_or(RecordingError::NoPorts)?;

        let bind_ip: IpAddr = self
            .settings
            .bind_ip
            .parse()
            .unwrap_or_else(|_| "127.0.0.1".parse().expect("static address parses"));

        let transports = self.create_plain_transports(&router, bind_ip, ports).await;
        let (audio_transport, video_transport) = match transports {
            Ok(pair) => pair,
            Err(e) => {
                self.ports.release_pair(ports);
                return Err(e);
            }
        };

        tokio::fs::create_dir_all(&self.settings.tmp_dir).await?;

        let session = match self.dao.create(room_id, host_user_id).await {
            Ok(session) => session,
            Err(e) => {
                // Rollback: transports drop here, ports return to the pool.
                self.ports.release_pair(ports);
                return Err(e.into());
            }
        };
        let session_id = session.id.ok_or(DaoError::NotFound)?;

        let mirror = RecordingMirror {
            session_id: session_id.to_hex(),
            room_id: room_key.clone(),
            server_id: self.instance_id.clone(),
            status: "STARTING".into(),
            started_at_ms: chrono::Utc::now().timestamp_millis(),
        };
        if let Err(e) = self
            .store
            .set_json_with_ttl(&keys::recording(&room_key), &mirror, keys::RECORDING_TTL)
            .await
        {
            warn!(%room_key, %e, "recording mirror write failed");
        }

        let (tx, rx) = mpsc::channel(64);
        let (sdp_path, output_path, log_path) = session_paths(
            std::path::Path::new(&self.settings.tmp_dir),
            &session_id.to_hex(),
        );

        let task = RecordingTask {
            settings: self.settings.clone(),
            store: self.store.clone(),
            dao: self.dao.clone(),
            uploader: self.uploader.clone(),
            room_key: room_key.clone(),
            session_id,
            instance_id: self.instance_id.clone(),
            started: Instant::now(),
            router,
            audio_transport,
            video_transport,
            ports,
            port_pool: self.ports.clone(),
            attached: Vec::new(),
            compositor: None,
            stop_requested: false,
            failed: None,
            tx: tx.clone(),
            sdp_path,
            output_path,
            log_path,
            bind_ip,
        };

        self.active.insert(
            room_key.clone(),
            RecordingHandle {
                tx: tx.clone(),
                session_id,
            },
        );
        if let Some(metrics) = &self.metrics {
            metrics.recordings_active.set(self.active.len() as i64);
        }

        let active = self.active.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            task.run(rx).await;
            active.remove(&room_key);
            if let Some(metrics) = &metrics {
                metrics.recordings_active.set(active.len() as i64);
            }
        });

        // Attach whatever the room is already producing.
        for meta in self.producers.list_room(&room_id.to_hex(), None) {
            let _ = tx.send(RecordingCommand::ProducerAdded(meta)).await;
        }

        info!(room_id = %room_id.to_hex(), session_id = %session_id.to_hex(), "recording started");
        Ok(session_id)
    }

    async fn create_plain_transports(
        &self,
        router: &Router,
        bind_ip: IpAddr,
        ports: PortPair,
    ) -> Result<(PlainTransport, PlainTransport), RecordingError> {
        let audio = self.create_plain_transport(router, bind_ip, ports.audio).await?;
        let video = self.create_plain_transport(router, bind_ip, ports.video).await?;
        Ok((audio, video))
    }

    async fn create_plain_transport(
        &self,
        router: &Router,
        bind_ip: IpAddr,
        port: u16,
    ) -> Result<PlainTransport, RecordingError> {
        let listen_info = ListenInfo {
            protocol: Protocol::Udp,
            ip: bind_ip,
            announced_address: None,
            port: None,
            port_range: None,
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
            expose_internal_ip: false,
        };
        let mut options = PlainTransportOptions::new(listen_info);
        options.rtcp_mux = true;
        options.comedia = false;

        let transport = router
            .create_plain_transport(options)
            .await
            .map_err(|e| RecordingError::Sfu(format!("plain transport: {e}")))?;
        transport
            .connect(PlainTransportRemoteParameters {
                ip: Some(bind_ip),
                port: Some(port),
                rtcp_port: None,
                srtp_parameters: None,
            })
            .await
            .map_err(|e| RecordingError::Sfu(format!("plain transport connect: {e}")))?;
        Ok(transport)
    }

    /// Shutdown path: asks every active recording to stop.
    pub async fn stop_all(&self) {
        let handles: Vec<mpsc::Sender<RecordingCommand>> =
            self.active.iter().map(|e| e.tx.clone()).collect();
        for tx in handles {
            let _ = tx.send(RecordingCommand::Stop).await;
        }
    }

    pub async fn stop(&self, room_id: ObjectId) -> Result<ObjectId, RecordingError> {
        let room_key = room_id.to_hex();
        let (tx, session_id) = {
            let handle = self
                .active
                .get(&room_key)
                .ok_or(RecordingError::NotActive)?;
            (handle.tx.clone(), handle.session_id)
        };
        let _ = tx.send(RecordingCommand::Stop).await;
        Ok(session_id)
    }
}

struct Attached {
    consumer: Consumer,
    meta: ProducerMeta,
}

struct RecordingTask {
    settings: RecordingSettings,
    store: StoreClient,
    dao: Arc<RecordingDao>,
    uploader: Option<Arc<ArtifactUploader>>,
    room_key: String,
    session_id: ObjectId,
    instance_id: String,
    started: Instant,
    router: Router,
    audio_transport: PlainTransport,
    video_transport: PlainTransport,
    ports: PortPair,
    port_pool: Arc<PortAllocator>,
    attached: Vec<Attached>,
    compositor: Option<CompositorHandle>,
    stop_requested: bool,
    failed: Option<String>,
    tx: mpsc::Sender<RecordingCommand>,
    sdp_path: PathBuf,
    output_path: PathBuf,
    log_path: PathBuf,
    bind_ip: IpAddr,
}

impl RecordingTask {
    async fn run(mut self, mut rx: mpsc::Receiver<RecordingCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                RecordingCommand::ProducerAdded(meta) => self.attach(meta).await,
                RecordingCommand::Stop => {
                    self.stop_requested = true;
                    break;
                }
                RecordingCommand::ProcessExited(status) => {
                    // Dying mid-recording fails the session and triggers
                    // the stop flow.
                    self.compositor = None;
                    self.failed = Some(format!("compositor exited with {status}"));
                    break;
                }
            }
        }
        self.finish(&mut rx).await;
    }

    async fn attach(&mut self, meta: ProducerMeta) {
        if self.stop_requested || self.failed.is_some() {
            debug!(producer_id = %meta.producer_id, "recording stopping, producer not attached");
            return;
        }
        let Ok(producer_id) = meta.producer_id.parse::<ProducerId>() else {
            warn!(producer_id = %meta.producer_id, "unparseable producer id");
            return;
        };

        // The finalized capability table and RtpCapabilities share a JSON
        // schema; convert through serde.
        let caps_value = match serde_json::to_value(self.router.rtp_capabilities()) {
            Ok(v) => v,
            Err(e) => {
                warn!(%e, "router capabilities serialization failed");
                return;
            }
        };
        let rtp_capabilities: RtpCapabilities = match serde_json::from_value(caps_value) {
            Ok(c) => c,
            Err(e) => {
                warn!(%e, "router capabilities conversion failed");
                return;
            }
        };

        let transport = if meta.kind == "audio" {
            &self.audio_transport
        } else {
            &self.video_transport
        };

        let mut options = ConsumerOptions::new(producer_id, rtp_capabilities);
        options.paused = true;
        let consumer = match transport.consume(options).await {
            Ok(consumer) => consumer,
            Err(e) => {
                warn!(producer_id = %meta.producer_id, %e, "recording consume failed");
                return;
            }
        };

        debug!(
            producer_id = %meta.producer_id,
            kind = %meta.kind,
            source = %meta.source,
            "recording consumer attached"
        );
        self.attached.push(Attached { consumer, meta });

        if self.compositor.is_none() && self.video_count() >= 1 {
            if let Err(e) = self.start_compositor().await {
                error!(%e, "compositor start failed");
                self.failed = Some(format!("compositor start failed: {e}"));
                let _ = self.tx.try_send(RecordingCommand::Stop);
                return;
            }
            if let Err(e) = self
                .dao
                .set_status(self.session_id, RecordingStatus::Recording)
                .await
            {
                warn!(%e, "recording status update failed");
            }
            self.refresh_mirror("RECORDING").await;
        }

        if let Some(last) = self.attached.last() {
            if let Err(e) = last.consumer.resume().await {
                warn!(%e, "recording consumer resume failed");
            }
        }
    }

    fn video_count(&self) -> usize {
        self.attached.iter().filter(|a| a.meta.kind == "video").count()
    }

    /// Rewrites the mirror entry, restarting its refresh TTL.
    async fn refresh_mirror(&self, status: &str) {
        let mirror = RecordingMirror {
            session_id: self.session_id.to_hex(),
            room_id: self.room_key.clone(),
            server_id: self.instance_id.clone(),
            status: status.to_string(),
            started_at_ms: chrono::Utc::now().timestamp_millis()
                - self.started.elapsed().as_millis() as i64,
        };
        if let Err(e) = self
            .store
            .set_json_with_ttl(&keys::recording(&self.room_key), &mirror, keys::RECORDING_TTL)
            .await
        {
            warn!(room_id = %self.room_key, %e, "recording mirror refresh failed");
        }
    }

    /// Video inputs ordered primary-first, per the composite roles.
    fn ordered_video_streams(&self) -> Vec<sdp::SdpStream> {
        let videos: Vec<&Attached> = self
            .attached
            .iter()
            .filter(|a| a.meta.kind == "video")
            .collect();
        let sources: Vec<&str> = videos.iter().map(|a| a.meta.source.as_str()).collect();
        let roles = video_roles(&sources);

        let mut ordered: Vec<(&Attached, CompositeRole)> =
            videos.into_iter().zip(roles).collect();
        ordered.sort_by_key(|(_, role)| match role {
            CompositeRole::Primary => 0,
            CompositeRole::Pip => 1,
        });

        ordered
            .into_iter()
            .filter_map(|(attached, _)| {
                serde_json::to_value(attached.consumer.rtp_parameters())
                    .ok()
                    .as_ref()
                    .and_then(sdp::stream_from_rtp_parameters)
            })
            .collect()
    }

    async fn start_compositor(&mut self) -> std::io::Result<()> {
        let audio_stream = self
            .attached
            .iter()
            .find(|a| a.meta.kind == "audio")
            .and_then(|a| {
                serde_json::to_value(a.consumer.rtp_parameters())
                    .ok()
                    .as_ref()
                    .and_then(sdp::stream_from_rtp_parameters)
            });
        let video_streams = self.ordered_video_streams();

        let sdp_text = sdp::render(
            &self.bind_ip.to_string(),
            self.ports.audio,
            self.ports.video,
            audio_stream.as_ref(),
            &video_streams,
        );
        tokio::fs::write(&self.sdp_path, &sdp_text).await?;

        let spec = CompositorSpec {
            ffmpeg_path: self.settings.ffmpeg_path.clone(),
            sdp_path: self.sdp_path.clone(),
            output_path: self.output_path.clone(),
            log_path: self.log_path.clone(),
            video_inputs: video_streams.len(),
            layout: self.settings.layout.clone(),
        };
        let tx = self.tx.clone();
        let handle = CompositorHandle::spawn(&spec, move |status| {
            let _ = tx.try_send(RecordingCommand::ProcessExited(status));
        })
        .await?;
        self.compositor = Some(handle);
        Ok(())
    }

    async fn finish(mut self, rx: &mut mpsc::Receiver<RecordingCommand>) {
        self.stop_requested = true;

        // Close every attached consumer before tearing the pipeline down.
        self.attached.clear();

        if let Some(compositor) = self.compositor.take() {
            compositor.signal_int();
            let exited = tokio::time::timeout(SIGINT_GRACE, async {
                while let Some(command) = rx.recv().await {
                    if matches!(command, RecordingCommand::ProcessExited(_)) {
                        return true;
                    }
                }
                false
            })
            .await
            .unwrap_or(false);
            if !exited {
                warn!(session_id = %self.session_id.to_hex(), "compositor ignored SIGINT");
                compositor.signal_kill();
            }
        }

        // Transports close on drop; ports go back to the pool.
        let RecordingTask {
            store,
            dao,
            uploader,
            room_key,
            session_id,
            started,
            ports,
            port_pool,
            failed,
            output_path,
            sdp_path,
            audio_transport,
            video_transport,
            ..
        } = self;
        drop(audio_transport);
        drop(video_transport);
        port_pool.release_pair(ports);

        let _ = tokio::fs::remove_file(&sdp_path).await;
        if let Err(e) = store.delete(&keys::recording(&room_key)).await {
            warn!(%room_key, %e, "recording mirror delete failed");
        }

        let duration_secs = started.elapsed().as_secs() as u32;

        if let Some(reason) = failed {
            error!(session_id = %session_id.to_hex(), %reason, "recording failed");
            if let Err(e) = dao.mark_failed(session_id, &reason).await {
                warn!(%e, "recording failure persistence failed");
            }
            return;
        }

        if let Err(e) = dao.set_status(session_id, RecordingStatus::Uploading).await {
            warn!(%e, "recording status update failed");
        }

        let size = tokio::fs::metadata(&output_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let mut asset = RecordingAsset {
            asset_type: AssetType::Composite,
            format: "mp4".into(),
            size,
            local_path: Some(output_path.display().to_string()),
            bucket: None,
            key: None,
        };
        if let Err(e) = dao.set_asset(session_id, &asset).await {
            warn!(%e, "recording asset persistence failed");
        }

        match &uploader {
            Some(uploader) => {
                let key = uploader.object_key(&room_key, &session_id.to_hex());
                match uploader.upload(&output_path, &key).await {
                    Ok((bucket, key, size)) => {
                        asset.bucket = Some(bucket);
                        asset.key = Some(key);
                        asset.size = size;
                        asset.local_path = None;
                        if let Err(e) = dao.set_asset(session_id, &asset).await {
                            warn!(%e, "recording asset persistence failed");
                        }
                        let _ = tokio::fs::remove_file(&output_path).await;
                        if let Err(e) = dao
                            .finish(session_id, RecordingStatus::Completed, duration_secs)
                            .await
                        {
                            warn!(%e, "recording completion persistence failed");
                        }
                        info!(session_id = %session_id.to_hex(), "recording completed and uploaded");
                    }
                    Err(e) => {
                        error!(session_id = %session_id.to_hex(), %e, "recording upload failed");
                        let _ = dao
                            .mark_failed(session_id, &format!("upload failed: {e}"))
                            .await;
                    }
                }
            }
            // No bucket configured: the composite stays local.
            None => {
                if let Err(e) = dao
                    .finish(session_id, RecordingStatus::Completed, duration_secs)
                    .await
                {
                    warn!(%e, "recording completion persistence failed");
                }
                info!(session_id = %session_id.to_hex(), "recording completed (local asset)");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_video_is_primary_until_screen_arrives() {
        assert_eq!(video_roles(&["camera"]), vec![CompositeRole::Primary]);
        assert_eq!(
            video_roles(&["camera", "camera"]),
            vec![CompositeRole::Primary, CompositeRole::Pip]
        );
    }

    #[test]
    fn screen_share_takes_primary_over_camera() {
        assert_eq!(
            video_roles(&["camera", "screen"]),
            vec![CompositeRole::Pip, CompositeRole::Primary]
        );
    }

    #[test]
    fn no_videos_no_roles() {
        assert!(video_roles(&[]).is_empty());
    }
}
