use super::signal::{ChatMessagePayload, ClientSignal, ServerSignal};
use crate::state::AppState;
use bson::{doc, oid::ObjectId};
use connect_db::models::ChatMessage;
use connect_services::cluster::ClusterCommand;
use connect_services::codes;
use connect_services::dao::DaoError;
use connect_services::media::producer_registry::{ControlOutcome, ProducerMeta, SOURCE_SCREEN};
use connect_services::store::{StoreError, mirror};
use mediasoup::prelude::*;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug)]
pub enum SignalError {
    Validation(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    CannotConsume,
    Unavailable(String),
    Internal(String),
}

impl SignalError {
    pub fn code(&self) -> &'static str {
        match self {
            SignalError::Validation(_) => "bad_request",
            SignalError::Unauthorized(_) => "unauthorized",
            SignalError::NotFound(_) => "not_found",
            SignalError::Conflict(_) => "conflict",
            SignalError::CannotConsume => "cannot_consume",
            SignalError::Unavailable(_) => "unavailable",
            SignalError::Internal(_) => "internal",
        }
    }

    pub fn message(&self) -> String {
        match self {
            SignalError::Validation(msg)
            | SignalError::Unauthorized(msg)
            | SignalError::NotFound(msg)
            | SignalError::Conflict(msg)
            | SignalError::Unavailable(msg)
            | SignalError::Internal(msg) => msg.clone(),
            SignalError::CannotConsume => "Cannot consume".to_string(),
        }
    }
}

impl From<DaoError> for SignalError {
    fn from(err: DaoError) -> Self {
        match err {
            DaoError::NotFound => SignalError::NotFound("Not found".into()),
            DaoError::DuplicateKey(msg) => SignalError::Conflict(msg),
            DaoError::Validation(msg) => SignalError::Validation(msg),
            DaoError::Forbidden(msg) => SignalError::Unauthorized(msg),
            DaoError::Timeout | DaoError::CircuitOpen => {
                SignalError::Unavailable("service temporarily unavailable, retry".into())
            }
            other => SignalError::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for SignalError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::CircuitOpen | StoreError::Timeout => {
                SignalError::Unavailable("service temporarily unavailable, retry".into())
            }
            other => SignalError::Internal(other.to_string()),
        }
    }
}

/// Where an emission goes, after the ack has been written.
pub enum Outbound {
    Room {
        room_key: String,
        except: Option<Uuid>,
        signal: ServerSignal,
    },
    User {
        room_key: String,
        user_id: ObjectId,
        signal: ServerSignal,
    },
}

pub struct RoomCtx {
    pub room_id: ObjectId,
    pub room_key: String,
    pub room_code: String,
    pub is_host: bool,
    pub display_name: String,
    pub picture: Option<String>,
}

/// Per-connection state machine. The socket loop awaits each `handle`
/// before reading the next frame, so a session's events are strictly
/// ordered while sessions run in parallel.
pub struct Session {
    pub socket_id: Uuid,
    pub user_id: ObjectId,
    pub email: String,
    pub name: String,
    pub room: Option<RoomCtx>,
}

impl Session {
    pub fn new(socket_id: Uuid, user_id: ObjectId, email: String, name: String) -> Self {
        Self {
            socket_id,
            user_id,
            email,
            name,
            room: None,
        }
    }

    fn socket_key(&self) -> String {
        self.socket_id.to_string()
    }

    fn ctx(&self) -> Result<&RoomCtx, SignalError> {
        self.room
            .as_ref()
            .ok_or_else(|| SignalError::Validation("Join a room first".into()))
    }

    pub async fn handle(
        &mut self,
        state: &AppState,
        signal: ClientSignal,
    ) -> Result<(Value, Vec<Outbound>), SignalError> {
        match signal {
            ClientSignal::JoinRoom {
                room_code,
                name,
                email,
                picture,
            } => self.join_room(state, room_code, name, email, picture).await,
            ClientSignal::LeaveRoom => self.leave_room(state).await,
            ClientSignal::CreateTransport { is_producer } => {
                self.create_transport(state, is_producer).await
            }
            ClientSignal::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => self.connect_transport(state, transport_id, dtls_parameters).await,
            ClientSignal::Produce {
                transport_id,
                kind,
                rtp_parameters,
                app_data,
            } => {
                self.produce(state, transport_id, kind, rtp_parameters, app_data)
                    .await
            }
            ClientSignal::Consume {
                transport_id,
                producer_id,
                rtp_capabilities,
            } => {
                self.consume(state, transport_id, producer_id, rtp_capabilities)
                    .await
            }
            ClientSignal::CloseProducer { producer_id } => {
                self.close_producer(state, producer_id).await
            }
            ClientSignal::PauseProducer { producer_id } => {
                self.pause_producer(state, producer_id, true).await
            }
            ClientSignal::ResumeProducer { producer_id } => {
                self.pause_producer(state, producer_id, false).await
            }
            ClientSignal::ReplaceTrack { producer_id } => {
                self.replace_track(state, producer_id).await
            }
            ClientSignal::ChatSend {
                content,
                recipient_id,
                client_message_id,
            } => {
                self.chat_send(state, content, recipient_id, client_message_id)
                    .await
            }
            ClientSignal::ChatHistory {
                limit,
                cursor,
                participant_id,
            } => self.chat_history(state, limit, cursor, participant_id).await,
            ClientSignal::AudioMute {
                is_audio_muted,
                uid,
            } => self.set_mute(state, MediaKind::Audio, is_audio_muted, uid).await,
            ClientSignal::VideoMute {
                is_video_muted,
                uid,
            } => self.set_mute(state, MediaKind::Video, is_video_muted, uid).await,
        }
    }

    async fn join_room(
        &mut self,
        state: &AppState,
        room_code: String,
        name: Option<String>,
        email: Option<String>,
        picture: Option<String>,
    ) -> Result<(Value, Vec<Outbound>), SignalError> {
        let normalized = codes::normalize(&room_code);
        if !codes::is_valid(&normalized) {
            return Err(SignalError::Validation(format!(
                "malformed room code: {room_code}"
            )));
        }

        let mut emits = Vec::new();
        let rejoining = self
            .room
            .as_ref()
            .is_some_and(|ctx| ctx.room_code == normalized);
        if !rejoining && self.room.is_some() {
            // Implicit leave when hopping rooms on one socket.
            emits.extend(self.teardown(state, 1).await);
        }

        let room = state.rooms.find_by_code(&normalized).await.map_err(|e| {
            if matches!(e, DaoError::NotFound) {
                SignalError::NotFound("Room not found".into())
            } else {
                e.into()
            }
        })?;
        let room_id = room.id.ok_or_else(|| SignalError::Internal("room without id".into()))?;
        let room_key = room_id.to_hex();
        let is_host = room.host_user_id == self.user_id;

        if room.settings.waiting_room && !is_host {
            let approved = state
                .rooms
                .join_requests
                .find_one(doc! {
                    "room_id": room_id,
                    "user_id": self.user_id,
                    "status": "approved",
                })
                .await?;
            if approved.is_none() {
                return Err(SignalError::Unauthorized("Join approval required".into()));
            }
        }

        // Placement check; serving a re-mapped room locally is allowed, the
        // ack carries a hint for the front door.
        let assigned = state.routing.get_or_assign(&room_key).await;
        if assigned != state.instance_id {
            warn!(room_code = %normalized, %assigned, "serving a room assigned to another server");
        }

        let display_name = name.unwrap_or_else(|| self.name.clone());
        state
            .rooms
            .join_participant(&room, self.user_id, display_name.clone(), email, picture.clone())
            .await?;

        let router = state
            .routers
            .get_or_create(&room_key)
            .await
            .map_err(|e| SignalError::Unavailable(e.to_string()))?;

        state.signals.join_room(&room_key, self.socket_id);
        self.room = Some(RoomCtx {
            room_id,
            room_key: room_key.clone(),
            room_code: normalized.clone(),
            is_host,
            display_name: display_name.clone(),
            picture: picture.clone(),
        });

        if !rejoining {
            emits.push(Outbound::Room {
                room_key: room_key.clone(),
                except: Some(self.socket_id),
                signal: ServerSignal::UserJoined {
                    user_id: self.user_id.to_hex(),
                    name: display_name.clone(),
                    picture,
                },
            });
        }

        // Existing participants (durable rows, mute shadow included).
        let participants = state.rooms.active_participants(room_id).await?;
        let mut names: HashMap<String, String> = HashMap::new();
        let mut existing = Vec::new();
        for participant in &participants {
            let uid = participant.user_id.to_hex();
            names.insert(uid.clone(), participant.display_name.clone());
            if participant.user_id == self.user_id {
                continue;
            }
            existing.push(json!({
                "userId": uid,
                "name": participant.display_name,
                "picture": participant.picture,
                "isAudioMuted": participant.audio_muted,
                "isVideoMuted": participant.video_muted,
            }));
        }

        // Producers already live in this room, local registry, grouped by
        // user.
        let socket_key = self.socket_key();
        let mut by_user: HashMap<String, Vec<Value>> = HashMap::new();
        for meta in state.producers.list_room(&room_key, Some(&socket_key)) {
            by_user.entry(meta.user_id.clone()).or_default().push(json!({
                "producerId": meta.producer_id,
                "kind": meta.kind,
                "source": meta.source,
                "appData": meta.app_data,
            }));
        }
        let other_producers: Vec<Value> = by_user
            .into_iter()
            .map(|(user_id, producers)| {
                json!({
                    "userId": user_id,
                    "name": names.get(&user_id).cloned().unwrap_or_default(),
                    "producers": producers,
                })
            })
            .collect();

        let rtp_capabilities =
            serde_json::to_value(router.rtp_capabilities()).unwrap_or_default();

        let mut ack = json!({
            "success": true,
            "rtpCapabilities": rtp_capabilities,
            "otherProducers": other_producers,
            "existingParticipants": existing,
        });
        if assigned != state.instance_id {
            ack["assignedServer"] = Value::String(assigned);
        }

        info!(socket_id = %self.socket_id, user_id = %self.user_id.to_hex(), room_code = %normalized, "joined room");
        Ok((ack, emits))
    }

    async fn leave_room(
        &mut self,
        state: &AppState,
    ) -> Result<(Value, Vec<Outbound>), SignalError> {
        self.ctx()?;
        let emits = self.teardown(state, 1).await;
        Ok((json!({ "success": true }), emits))
    }

    async fn create_transport(
        &mut self,
        state: &AppState,
        is_producer: bool,
    ) -> Result<(Value, Vec<Outbound>), SignalError> {
        let ctx = self.ctx()?;
        let router = state
            .routers
            .get_or_create(&ctx.room_key)
            .await
            .map_err(|e| SignalError::Unavailable(e.to_string()))?;
        let info = state
            .transports
            .create(&router, &self.socket_key(), &ctx.room_key, is_producer)
            .await
            .map_err(|e| SignalError::Internal(e.to_string()))?;
        let ack = serde_json::to_value(info)
            .map_err(|e| SignalError::Internal(e.to_string()))?;
        Ok((ack, Vec::new()))
    }

    async fn connect_transport(
        &mut self,
        state: &AppState,
        transport_id: String,
        dtls_parameters: Value,
    ) -> Result<(Value, Vec<Outbound>), SignalError> {
        self.ctx()?;
        let dtls_parameters: DtlsParameters = serde_json::from_value(dtls_parameters)
            .map_err(|_| SignalError::Validation("Invalid dtlsParameters".into()))?;
        state
            .transports
            .connect(&self.socket_key(), &transport_id, dtls_parameters)
            .await
            .map_err(|_| SignalError::NotFound("Transport not found".into()))?;
        Ok((json!({ "success": true }), Vec::new()))
    }

    async fn produce(
        &mut self,
        state: &AppState,
        transport_id: String,
        kind: String,
        rtp_parameters: Value,
        app_data: Value,
    ) -> Result<(Value, Vec<Outbound>), SignalError> {
        let ctx = self.ctx()?;
        let kind = match kind.as_str() {
            "audio" => MediaKind::Audio,
            "video" => MediaKind::Video,
            other => {
                return Err(SignalError::Validation(format!("unknown kind: {other}")));
            }
        };
        let rtp_parameters: RtpParameters = serde_json::from_value(rtp_parameters)
            .map_err(|_| SignalError::Validation("Invalid rtpParameters".into()))?;

        let transport = state
            .transports
            .owned(&self.socket_key(), &transport_id, true)
            .ok_or_else(|| SignalError::NotFound("Transport not found".into()))?;

        let producer = transport
            .produce(ProducerOptions::new(kind, rtp_parameters))
            .await
            .map_err(|e| SignalError::Internal(format!("produce failed: {e}")))?;

        let meta = state
            .producers
            .add(
                &self.socket_key(),
                &self.user_id.to_hex(),
                &ctx.room_key,
                producer,
                app_data,
            )
            .await;

        let mut emits = vec![Outbound::Room {
            room_key: ctx.room_key.clone(),
            except: Some(self.socket_id),
            signal: ServerSignal::NewProducer {
                producer_id: meta.producer_id.clone(),
                user_id: meta.user_id.clone(),
                kind: meta.kind.clone(),
                source: meta.source.clone(),
                name: ctx.display_name.clone(),
                app_data: meta.app_data.clone(),
            },
        }];
        if meta.source == SOURCE_SCREEN {
            emits.push(Outbound::Room {
                room_key: ctx.room_key.clone(),
                except: Some(self.socket_id),
                signal: ServerSignal::ScreenShareStarted {
                    producer_id: meta.producer_id.clone(),
                    user_id: meta.user_id.clone(),
                    name: ctx.display_name.clone(),
                },
            });
        }

        Ok((json!({ "id": meta.producer_id }), emits))
    }

    async fn consume(
        &mut self,
        state: &AppState,
        transport_id: String,
        producer_id: String,
        rtp_capabilities: Value,
    ) -> Result<(Value, Vec<Outbound>), SignalError> {
        let ctx = self.ctx()?;
        let rtp_capabilities: RtpCapabilities = serde_json::from_value(rtp_capabilities)
            .map_err(|_| SignalError::Validation("Invalid rtpCapabilities".into()))?;
        let parsed_producer_id: ProducerId = producer_id
            .parse()
            .map_err(|_| SignalError::Validation("Invalid producerId".into()))?;

        let transport = state
            .transports
            .owned(&self.socket_key(), &transport_id, false)
            .ok_or_else(|| SignalError::NotFound("Transport not found".into()))?;

        // The producer must be local; media on another node cannot be
        // consumed here.
        let meta = state
            .producers
            .find(&producer_id)
            .await
            .ok_or(SignalError::CannotConsume)?;
        if meta.server_id != state.instance_id || state.producers.get(&producer_id).is_none() {
            return Err(SignalError::CannotConsume);
        }

        let router = state
            .routers
            .get(&ctx.room_key)
            .ok_or_else(|| SignalError::Internal("room has no router".into()))?;
        if !router.can_consume(&parsed_producer_id, &rtp_capabilities) {
            return Err(SignalError::CannotConsume);
        }

        let consumer = transport
            .consume(ConsumerOptions::new(parsed_producer_id, rtp_capabilities))
            .await
            .map_err(|e| {
                debug!(%producer_id, %e, "consume failed");
                SignalError::CannotConsume
            })?;

        let ack = json!({
            "id": consumer.id().to_string(),
            "producerId": producer_id,
            "kind": connect_services::media::kind_str(consumer.kind()),
            "rtpParameters": serde_json::to_value(consumer.rtp_parameters()).unwrap_or_default(),
        });
        state.consumers.add(&self.socket_key(), consumer).await;

        Ok((ack, Vec::new()))
    }

    async fn close_producer(
        &mut self,
        state: &AppState,
        producer_id: String,
    ) -> Result<(Value, Vec<Outbound>), SignalError> {
        let ctx = self.ctx()?;
        let user_id = self.user_id.to_hex();
        match state.producers.close(&user_id, &producer_id).await {
            ControlOutcome::Done(meta) => {
                Ok((json!({ "success": true }), self.producer_closed_emits(ctx, &meta)))
            }
            ControlOutcome::Foreign(meta) => {
                let command = ClusterCommand::CloseProducer {
                    producer_id: meta.producer_id.clone(),
                    room_id: meta.room_id.clone(),
                    user_id: meta.user_id.clone(),
                };
                if let Err(e) = state.cluster.delegate(&meta.server_id, &command).await {
                    warn!(%producer_id, %e, "cross-node close delegation failed");
                }
                Ok((json!({ "success": true }), self.producer_closed_emits(ctx, &meta)))
            }
            ControlOutcome::Unauthorized | ControlOutcome::NotFound => Err(SignalError::NotFound(
                "Producer not found or unauthorized".into(),
            )),
        }
    }

    fn producer_closed_emits(&self, ctx: &RoomCtx, meta: &ProducerMeta) -> Vec<Outbound> {
        let signal = if meta.source == SOURCE_SCREEN {
            ServerSignal::ScreenShareStopped {
                producer_id: meta.producer_id.clone(),
                user_id: meta.user_id.clone(),
            }
        } else {
            ServerSignal::ProducerClosed {
                producer_id: meta.producer_id.clone(),
                user_id: meta.user_id.clone(),
            }
        };
        vec![Outbound::Room {
            room_key: ctx.room_key.clone(),
            except: Some(self.socket_id),
            signal,
        }]
    }

    async fn pause_producer(
        &mut self,
        state: &AppState,
        producer_id: String,
        pause: bool,
    ) -> Result<(Value, Vec<Outbound>), SignalError> {
        let ctx = self.ctx()?;
        let user_id = self.user_id.to_hex();
        let outcome = if pause {
            state.producers.pause(&user_id, &producer_id).await
        } else {
            state.producers.resume(&user_id, &producer_id).await
        };

        let meta = match outcome {
            ControlOutcome::Done(meta) => meta,
            ControlOutcome::Foreign(meta) => {
                let command = if pause {
                    ClusterCommand::PauseProducer {
                        producer_id: meta.producer_id.clone(),
                        room_id: meta.room_id.clone(),
                        user_id: meta.user_id.clone(),
                    }
                } else {
                    ClusterCommand::ResumeProducer {
                        producer_id: meta.producer_id.clone(),
                        room_id: meta.room_id.clone(),
                        user_id: meta.user_id.clone(),
                    }
                };
                if let Err(e) = state.cluster.delegate(&meta.server_id, &command).await {
                    warn!(%producer_id, %e, "cross-node pause delegation failed");
                }
                meta
            }
            ControlOutcome::Unauthorized | ControlOutcome::NotFound => {
                return Err(SignalError::NotFound(
                    "Producer not found or unauthorized".into(),
                ));
            }
        };

        let signal = if pause {
            ServerSignal::ProducerPaused {
                producer_id: meta.producer_id.clone(),
                user_id: meta.user_id.clone(),
            }
        } else {
            ServerSignal::ProducerResumed {
                producer_id: meta.producer_id.clone(),
                user_id: meta.user_id.clone(),
            }
        };
        Ok((
            json!({ "success": true }),
            vec![Outbound::Room {
                room_key: ctx.room_key.clone(),
                except: Some(self.socket_id),
                signal,
            }],
        ))
    }

    async fn replace_track(
        &mut self,
        state: &AppState,
        producer_id: String,
    ) -> Result<(Value, Vec<Outbound>), SignalError> {
        let ctx = self.ctx()?;
        let meta = state
            .producers
            .find(&producer_id)
            .await
            .filter(|meta| meta.user_id == self.user_id.to_hex())
            .ok_or_else(|| SignalError::NotFound("Producer not found or unauthorized".into()))?;

        Ok((
            json!({ "success": true }),
            vec![Outbound::Room {
                room_key: ctx.room_key.clone(),
                except: Some(self.socket_id),
                signal: ServerSignal::ProducerTrackReplaced {
                    producer_id: meta.producer_id,
                    user_id: meta.user_id,
                },
            }],
        ))
    }

    async fn chat_send(
        &mut self,
        state: &AppState,
        content: String,
        recipient_id: Option<String>,
        client_message_id: Option<String>,
    ) -> Result<(Value, Vec<Outbound>), SignalError> {
        let ctx = self.ctx()?;
        let content = content.trim().to_string();
        if content.is_empty() {
            return Err(SignalError::Validation("Message is empty".into()));
        }
        if content.len() > ChatMessage::MAX_CONTENT_LEN {
            return Err(SignalError::Validation("Message too long".into()));
        }

        let control = state.mute.control(&ctx.room_code).await;
        if control.chat_muted && !ctx.is_host {
            return Err(SignalError::Unauthorized("Chat is muted".into()));
        }

        let recipient = match recipient_id {
            Some(raw) => {
                let recipient = ObjectId::parse_str(&raw)
                    .map_err(|_| SignalError::Validation("Invalid recipientId".into()))?;
                let participant = state
                    .rooms
                    .find_participant(ctx.room_id, recipient)
                    .await?
                    .filter(|p| p.left_at.is_none())
                    .ok_or_else(|| SignalError::NotFound("No such recipient".into()))?;
                Some(participant.user_id)
            }
            None => None,
        };

        let message = state
            .chat
            .create(
                ctx.room_id,
                self.user_id,
                ctx.display_name.clone(),
                recipient,
                content,
                client_message_id,
            )
            .await?;
        let payload = ChatMessagePayload::from(&message);

        let emits = match recipient {
            Some(recipient) => vec![Outbound::User {
                room_key: ctx.room_key.clone(),
                user_id: recipient,
                signal: ServerSignal::ChatMessage {
                    message: payload.clone(),
                },
            }],
            None => vec![Outbound::Room {
                room_key: ctx.room_key.clone(),
                except: Some(self.socket_id),
                signal: ServerSignal::ChatMessage {
                    message: payload.clone(),
                },
            }],
        };

        Ok((json!({ "success": true, "message": payload }), emits))
    }

    async fn chat_history(
        &mut self,
        state: &AppState,
        limit: Option<u32>,
        cursor: Option<String>,
        participant_id: Option<String>,
    ) -> Result<(Value, Vec<Outbound>), SignalError> {
        let ctx = self.ctx()?;
        let participant = participant_id
            .map(|raw| {
                ObjectId::parse_str(&raw)
                    .map_err(|_| SignalError::Validation("Invalid participantId".into()))
            })
            .transpose()?;

        let page = state
            .chat
            .history(
                ctx.room_id,
                self.user_id,
                limit.unwrap_or(50),
                cursor.as_deref(),
                participant,
            )
            .await?;

        let messages: Vec<ChatMessagePayload> =
            page.messages.iter().map(ChatMessagePayload::from).collect();
        Ok((
            json!({ "messages": messages, "nextCursor": page.next_cursor }),
            Vec::new(),
        ))
    }

    async fn set_mute(
        &mut self,
        state: &AppState,
        kind: MediaKind,
        muted: bool,
        uid: Option<String>,
    ) -> Result<(Value, Vec<Outbound>), SignalError> {
        let ctx = self.ctx()?;
        let target = match uid {
            Some(raw) => ObjectId::parse_str(&raw)
                .map_err(|_| SignalError::Validation("Invalid uid".into()))?,
            None => self.user_id,
        };
        let forced = target != self.user_id;
        if forced && !ctx.is_host {
            return Err(SignalError::Unauthorized(
                "Only the host can mute other participants".into(),
            ));
        }

        match kind {
            MediaKind::Audio => {
                state
                    .mute
                    .set_audio(&ctx.room_code, ctx.room_id, target, muted, forced)
                    .await?
            }
            MediaKind::Video => {
                state
                    .mute
                    .set_video(&ctx.room_code, ctx.room_id, target, muted, forced)
                    .await?
            }
        };

        let mut emits = Vec::new();
        if forced {
            let target_hex = target.to_hex();
            let affected = if muted {
                state
                    .producers
                    .pause_by_kind(&ctx.room_key, &target_hex, kind)
                    .await
            } else {
                state
                    .producers
                    .resume_by_kind(&ctx.room_key, &target_hex, kind)
                    .await
            };
            for meta in affected {
                let signal = if muted {
                    ServerSignal::ProducerPaused {
                        producer_id: meta.producer_id,
                        user_id: meta.user_id,
                    }
                } else {
                    ServerSignal::ProducerResumed {
                        producer_id: meta.producer_id,
                        user_id: meta.user_id,
                    }
                };
                emits.push(Outbound::Room {
                    room_key: ctx.room_key.clone(),
                    except: None,
                    signal,
                });
            }
        }

        let signal = match kind {
            MediaKind::Audio => ServerSignal::AudioMuteChanged {
                user_id: target.to_hex(),
                is_audio_muted: muted,
                forced,
            },
            MediaKind::Video => ServerSignal::VideoMuteChanged {
                user_id: target.to_hex(),
                is_video_muted: muted,
                forced,
            },
        };
        emits.push(Outbound::Room {
            room_key: ctx.room_key.clone(),
            except: Some(self.socket_id),
            signal,
        });

        Ok((json!({ "success": true }), emits))
    }

    /// Disconnect path: close everything the socket owns, verify the mirror
    /// is clean, retry up to three times with growing sleeps, then hand
    /// leftovers to TTL expiry.
    pub async fn disconnect_cleanup(&mut self, state: &AppState) -> Vec<Outbound> {
        self.teardown(state, 3).await
    }

    async fn teardown(&mut self, state: &AppState, max_attempts: u32) -> Vec<Outbound> {
        let socket_key = self.socket_key();
        let Some(ctx) = self.room.take() else {
            // Never joined; sweep any stray mirror entries anyway.
            if let Err(e) = mirror::clean_socket(&state.store, &socket_key).await {
                debug!(%socket_key, %e, "idle socket mirror sweep failed");
            }
            return Vec::new();
        };

        let mut closed_producers: Vec<ProducerMeta> = Vec::new();
        for attempt in 1..=max_attempts {
            let (closed, _, _) = tokio::join!(
                state.producers.close_all(&socket_key),
                state.consumers.close_all(&socket_key),
                state.transports.close_all(&socket_key),
            );
            if attempt == 1 {
                closed_producers = closed;
            }

            if let Err(e) = mirror::clean_socket(&state.store, &socket_key).await {
                warn!(%socket_key, attempt, %e, "mirror cleanup failed");
            }

            match mirror::socket_dirty(&state.store, &socket_key).await {
                Ok(false) => break,
                Ok(true) if attempt < max_attempts => {
                    warn!(%socket_key, attempt, "socket mirror still dirty, retrying");
                    tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                }
                Ok(true) => {
                    warn!(%socket_key, "socket mirror still dirty, leaving to TTL expiry");
                }
                Err(e) => {
                    warn!(%socket_key, %e, "mirror verification unavailable");
                    break;
                }
            }
        }

        if let Err(e) = state.rooms.leave_participant(ctx.room_id, self.user_id).await {
            warn!(room_id = %ctx.room_key, %e, "participant row update failed");
        }
        state.signals.leave_room(&ctx.room_key, &self.socket_id);

        let mut emits = Vec::new();
        for meta in closed_producers {
            emits.extend(self.producer_closed_emits(&ctx, &meta));
        }
        emits.push(Outbound::Room {
            room_key: ctx.room_key.clone(),
            except: Some(self.socket_id),
            signal: ServerSignal::UserLeft {
                user_id: self.user_id.to_hex(),
                name: ctx.display_name.clone(),
            },
        });

        // Last socket out closes the room's local media.
        if state.signals.room_is_empty(&ctx.room_key) {
            if state.recording.is_active(&ctx.room_key) {
                if let Err(e) = state.recording.stop(ctx.room_id).await {
                    warn!(room_id = %ctx.room_key, %e, "recording stop on empty room failed");
                }
            }
            state.routers.close(&ctx.room_key).await;
        }

        info!(socket_id = %self.socket_id, room_code = %ctx.room_code, "left room");
        emits
    }
}
