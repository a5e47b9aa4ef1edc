use crate::metrics::Metrics;
use crate::store::{PipelineOp, StoreClient, keys};
use connect_config::MediasoupSettings;
use dashmap::DashMap;
use event_listener_primitives::HandlerId;
use mediasoup::prelude::*;
use mediasoup::types::data_structures::DtlsState;
use mediasoup::webrtc_transport::{
    WebRtcTransportListenInfos, WebRtcTransportOptions, WebRtcTransportRemoteParameters,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Connection details handed to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub id: String,
    pub ice_parameters: serde_json::Value,
    pub ice_candidates: serde_json::Value,
    pub dtls_parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportMirror {
    pub socket_id: String,
    pub room_id: String,
    pub is_producer: bool,
    pub server_id: String,
}

struct TransportEntry {
    transport: WebRtcTransport,
    socket_id: String,
    is_producer: bool,
    _handlers: Vec<HandlerId>,
}

enum TransportEvent {
    DtlsClosed(String),
}

/// WebRTC transports owned by this node's sockets. DTLS `closed` tears a
/// transport down without waiting for the client to say goodbye.
pub struct TransportRegistry {
    transports: DashMap<String, TransportEntry>,
    store: StoreClient,
    instance_id: String,
    listen_ip: IpAddr,
    announced_ip: Option<String>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    metrics: Option<Arc<Metrics>>,
}

impl TransportRegistry {
    pub fn new(
        store: StoreClient,
        instance_id: String,
        settings: &MediasoupSettings,
        metrics: Option<Arc<Metrics>>,
    ) -> Arc<Self> {
        let listen_ip: IpAddr = settings
            .listen_ip
            .parse()
            .unwrap_or_else(|_| "0.0.0.0".parse().expect("static address parses"));

        // Explicit configuration wins over interface probing.
        let announced_ip = if settings.announced_ip.is_empty() {
            super::detect_announced_ip()
        } else {
            Some(settings.announced_ip.clone())
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            transports: DashMap::new(),
            store,
            instance_id,
            listen_ip,
            announced_ip,
            events_tx,
            metrics,
        });
        tokio::spawn(Self::event_loop(registry.clone(), events_rx));
        registry
    }

    async fn event_loop(registry: Arc<Self>, mut rx: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                TransportEvent::DtlsClosed(transport_id) => {
                    debug!(%transport_id, "transport DTLS closed");
                    registry.close(&transport_id).await;
                }
            }
        }
    }

    pub async fn create(
        &self,
        router: &Router,
        socket_id: &str,
        room_id: &str,
        is_producer: bool,
    ) -> anyhow::Result<TransportInfo> {
        let udp_info = ListenInfo {
            protocol: Protocol::Udp,
            ip: self.listen_ip,
            announced_address: self.announced_ip.clone(),
            port: None,
            port_range: None,
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
            expose_internal_ip: false,
        };
        let tcp_info = ListenInfo {
            protocol: Protocol::Tcp,
            ip: self.listen_ip,
            announced_address: self.announced_ip.clone(),
            port: None,
            port_range: None,
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
            expose_internal_ip: false,
        };

        let listen_infos = WebRtcTransportListenInfos::new(udp_info).insert(tcp_info);
        let mut transport_options = WebRtcTransportOptions::new(listen_infos);
        transport_options.enable_udp = true;
        transport_options.enable_tcp = true;
        transport_options.prefer_udp = true;
        transport_options.initial_available_outgoing_bitrate = 600_000;

        let transport = router
            .create_webrtc_transport(transport_options)
            .await
            .map_err(|e| anyhow::anyhow!("failed to create WebRTC transport: {}", e))?;

        let transport_id = transport.id().to_string();
        let mut handlers = Vec::new();

        {
            let id = transport_id.clone();
            handlers.push(transport.on_ice_state_change(move |state| {
                debug!(transport_id = %id, ?state, "ICE state change");
            }));
        }
        {
            let id = transport_id.clone();
            let tx = self.events_tx.clone();
            handlers.push(transport.on_dtls_state_change(move |state| {
                debug!(transport_id = %id, ?state, "DTLS state change");
                if state == DtlsState::Closed {
                    let _ = tx.send(TransportEvent::DtlsClosed(id.clone()));
                }
            }));
        }

        let info = TransportInfo {
            id: transport_id.clone(),
            ice_parameters: serde_json::to_value(transport.ice_parameters()).unwrap_or_default(),
            ice_candidates: serde_json::to_value(transport.ice_candidates()).unwrap_or_default(),
            dtls_parameters: serde_json::to_value(transport.dtls_parameters()).unwrap_or_default(),
        };

        let mirror = TransportMirror {
            socket_id: socket_id.to_string(),
            room_id: room_id.to_string(),
            is_producer,
            server_id: self.instance_id.clone(),
        };
        let mirror_write = self
            .store
            .pipeline(vec![
                PipelineOp::SetWithTtl {
                    key: keys::transport(&transport_id),
                    value: serde_json::to_string(&mirror)?,
                    ttl: keys::STATE_TTL,
                },
                PipelineOp::SetAdd {
                    key: keys::socket_transports(socket_id),
                    member: transport_id.clone(),
                },
            ])
            .await;
        if let Err(e) = mirror_write {
            warn!(%transport_id, %e, "transport mirror write failed");
        }

        self.transports.insert(
            transport_id.clone(),
            TransportEntry {
                transport,
                socket_id: socket_id.to_string(),
                is_producer,
                _handlers: handlers,
            },
        );
        self.update_gauge();
        debug!(%transport_id, %socket_id, %room_id, is_producer, "transport created");
        Ok(info)
    }

    pub async fn connect(
        &self,
        socket_id: &str,
        transport_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> anyhow::Result<()> {
        let transport = {
            let entry = self
                .transports
                .get(transport_id)
                .filter(|e| e.socket_id == socket_id)
                .ok_or_else(|| anyhow::anyhow!("transport not found"))?;
            entry.transport.clone()
        };
        transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| anyhow::anyhow!("failed to connect transport: {}", e))?;
        debug!(%transport_id, "transport connected");
        Ok(())
    }

    /// The socket's transport of the given direction, for produce/consume.
    pub fn owned(
        &self,
        socket_id: &str,
        transport_id: &str,
        is_producer: bool,
    ) -> Option<WebRtcTransport> {
        self.transports
            .get(transport_id)
            .filter(|e| e.socket_id == socket_id && e.is_producer == is_producer)
            .map(|e| e.transport.clone())
    }

    /// Closes one transport and removes its mirror entry.
    pub async fn close(&self, transport_id: &str) {
        let removed = self.transports.remove(transport_id);
        let socket_id = removed.as_ref().map(|(_, e)| e.socket_id.clone());
        drop(removed);
        self.update_gauge();

        let mut ops = vec![PipelineOp::Delete {
            key: keys::transport(transport_id),
        }];
        if let Some(socket_id) = socket_id {
            ops.push(PipelineOp::SetRemove {
                key: keys::socket_transports(&socket_id),
                member: transport_id.to_string(),
            });
        }
        if let Err(e) = self.store.pipeline(ops).await {
            warn!(%transport_id, %e, "transport mirror cleanup failed");
        }
    }

    /// Closes everything the socket owned. The mirror index is the source
    /// of truth so entries that never made it into (or already left) the
    /// local map are still cleaned.
    pub async fn close_all(&self, socket_id: &str) -> usize {
        let mut ids: HashSet<String> = self
            .transports
            .iter()
            .filter(|e| e.value().socket_id == socket_id)
            .map(|e| e.key().clone())
            .collect();

        match self
            .store
            .set_members(&keys::socket_transports(socket_id))
            .await
        {
            Ok(mirrored) => ids.extend(mirrored),
            Err(e) => warn!(%socket_id, %e, "transport mirror index unavailable"),
        }

        let mut closed = 0;
        let mut ops = Vec::new();
        for transport_id in &ids {
            if self.transports.remove(transport_id).is_some() {
                closed += 1;
            }
            ops.push(PipelineOp::Delete {
                key: keys::transport(transport_id),
            });
        }
        ops.push(PipelineOp::Delete {
            key: keys::socket_transports(socket_id),
        });
        if let Err(e) = self.store.pipeline(ops).await {
            warn!(%socket_id, %e, "transport mirror cleanup failed");
        }

        self.update_gauge();
        debug!(%socket_id, closed, "all transports closed for socket");
        closed
    }

    pub fn count(&self) -> usize {
        self.transports.len()
    }

    fn update_gauge(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.transports.set(self.transports.len() as i64);
        }
    }
}
