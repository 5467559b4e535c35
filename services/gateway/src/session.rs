//! Per-connection WebSocket session.
//!
//! Inbound frames are handled serially in arrival order; outbound frames
//! flow through the bounded hub queue whose overflow closes the session as a
//! slow consumer. Heartbeats, token expiry, tenant drain, and hub-initiated
//! closes all converge on the session gate.
use crate::app::AppState;
use crate::http;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use sluice_auth::Claims;
use sluice_common::Tenant;
use sluice_common::ids::SessionRef;
use sluice_hub::{BroadcastRequest, SessionHandle, SessionReceiver, SubscribeRequest, session_channel};
use sluice_tenant::{Lookup, TenantNode};
use sluice_wire::{ClientFrame, JoinConfig, JoinPayload, ServerFrame, close, event};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub apikey: Option<String>,
}

pub async fn websocket_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let apikey = params.apikey.clone().or_else(|| http::apikey_from(&headers));
    let token = params.token.clone().or_else(|| apikey.clone());
    let Some(token) = token else {
        return (StatusCode::UNAUTHORIZED, "missing token").into_response();
    };
    let Some(external_id) = http::resolve_tenant(&headers, Some(&token)) else {
        return (StatusCode::UNAUTHORIZED, "cannot resolve tenant").into_response();
    };

    let tenant = match state.registry.lookup(&external_id).await {
        Ok(Lookup::Found(tenant)) => tenant,
        Ok(Lookup::NotFound) => {
            return (StatusCode::NOT_FOUND, "tenant not found").into_response();
        }
        Ok(Lookup::Suspended) => {
            return (StatusCode::FORBIDDEN, "tenant suspended").into_response();
        }
        Err(err) => {
            tracing::error!(tenant = %external_id, error = %err, "tenant lookup failed");
            return (StatusCode::SERVICE_UNAVAILABLE, "control database unavailable")
                .into_response();
        }
    };
    let claims = match state.verifier.verify(&tenant, &token).await {
        Ok(claims) => claims,
        Err(err) => return (StatusCode::UNAUTHORIZED, err.to_string()).into_response(),
    };
    let node = match state.supervisors.start_if_needed(&external_id).await {
        Ok(node) => node,
        Err(err) => return (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response(),
    };
    if let Some(reason) = node.degraded() {
        return (StatusCode::SERVICE_UNAVAILABLE, reason).into_response();
    }

    let buckets = state.hub.limits().for_tenant(&external_id, &tenant.quotas).await;
    if buckets.client_connected().is_err() {
        return (StatusCode::TOO_MANY_REQUESTS, "tenant connection limit reached")
            .into_response();
    }

    ws.on_upgrade(move |socket| async move {
        let (session, receiver) = Session::new(state, tenant, node, claims);
        session.run(socket, receiver).await;
    })
}

struct Session {
    state: Arc<AppState>,
    tenant: Arc<Tenant>,
    node: Arc<TenantNode>,
    claims: Arc<Claims>,
    session: SessionRef,
    handle: SessionHandle,
    /// Join config per joined topic; also the open-channel count.
    joined: HashMap<String, JoinConfig>,
    /// Consecutive rate-limited operations; persistent overage closes the
    /// connection for a cool-down.
    rate_limit_violations: u32,
}

const MAX_RATE_LIMIT_VIOLATIONS: u32 = 5;

impl Session {
    fn new(
        state: Arc<AppState>,
        tenant: Arc<Tenant>,
        node: Arc<TenantNode>,
        claims: Arc<Claims>,
    ) -> (Self, SessionReceiver) {
        let session = SessionRef::new();
        let (capacity, max_bytes) = state.hub.queue_bounds();
        let (handle, receiver) = session_channel(session, capacity, max_bytes);
        (
            Self {
                state,
                tenant,
                node,
                claims,
                session,
                handle,
                joined: HashMap::new(),
                rate_limit_violations: 0,
            },
            receiver,
        )
    }

    fn note_hub_result<T>(&mut self, result: &Result<T, sluice_hub::HubError>) {
        match result {
            Err(sluice_hub::HubError::RateLimited(_)) => {
                self.rate_limit_violations += 1;
                if self.rate_limit_violations >= MAX_RATE_LIMIT_VIOLATIONS {
                    tracing::warn!(
                        tenant = %self.tenant.external_id,
                        session = %self.session,
                        "persistent rate-limit overage, closing"
                    );
                    self.handle.gate().force_close(close::RATE_LIMITED);
                }
            }
            Ok(_) => self.rate_limit_violations = 0,
            Err(_) => {}
        }
    }

    async fn run(mut self, socket: WebSocket, mut receiver: SessionReceiver) {
        let session = &mut self;
        session.node.session_started();
        metrics::gauge!("sluice_sessions_open").increment(1.0);
        tracing::debug!(tenant = %session.tenant.external_id, session = %session.session, "session opened");

        let (mut ws_sender, mut ws_receiver) = socket.split();

        // Writer: drain the hub queue until the gate closes, then emit the
        // close frame carrying the gate's code.
        let gate = session.handle.gate().clone();
        let mut writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = receiver.recv() => match frame {
                        Some(text) => {
                            if ws_sender
                                .send(Message::Text(text.as_ref().into()))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = gate.closed() => {
                        let code = gate.close_code().unwrap_or(close::GOING_AWAY);
                        let _ = ws_sender
                            .send(Message::Close(Some(CloseFrame {
                                code,
                                reason: close_reason(code).into(),
                            })))
                            .await;
                        break;
                    }
                }
            }
        });

        let heartbeat = session.state.config.heartbeat_interval;
        let mut heartbeat_deadline = Instant::now() + heartbeat * 2;
        let mut token_deadline = expiry_deadline(&session.claims);
        let gate = session.handle.gate().clone();
        let node_gate = session.node.gate().clone();

        loop {
            tokio::select! {
                message = ws_receiver.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            match ClientFrame::decode(&text) {
                                Ok(frame) => {
                                    session
                                        .handle_frame(frame, &mut heartbeat_deadline, &mut token_deadline, heartbeat)
                                        .await;
                                }
                                Err(err) => {
                                    tracing::debug!(error = %err, "dropping malformed frame");
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_))) => {}
                        Some(Err(_)) => break,
                    }
                }
                _ = tokio::time::sleep_until(heartbeat_deadline) => {
                    gate.force_close(close::HEARTBEAT_TIMEOUT);
                    break;
                }
                _ = tokio::time::sleep_until(token_deadline) => {
                    gate.force_close(close::TOKEN_EXPIRED);
                    break;
                }
                _ = node_gate.cancelled() => {
                    gate.force_close(close::GOING_AWAY);
                    break;
                }
                _ = gate.closed() => break,
            }
        }

        // Pending enqueues are dropped with the receiver; topic state is
        // swept so no dead subscriber lingers. The writer gets one second to
        // flush the close frame before it is abandoned.
        gate.force_close(close::GOING_AWAY);
        if tokio::time::timeout(Duration::from_secs(1), &mut writer)
            .await
            .is_err()
        {
            writer.abort();
        }
        session
            .state
            .hub
            .session_closed(&session.tenant.external_id, session.session)
            .await;
        if let Some(buckets) = session
            .state
            .hub
            .limits()
            .get(&session.tenant.external_id)
            .await
        {
            buckets.client_disconnected();
        }
        session.node.session_ended();
        metrics::gauge!("sluice_sessions_open").decrement(1.0);
        tracing::debug!(tenant = %session.tenant.external_id, session = %session.session, "session closed");
    }

    async fn handle_frame(
        &mut self,
        frame: ClientFrame,
        heartbeat_deadline: &mut Instant,
        token_deadline: &mut Instant,
        heartbeat: Duration,
    ) {
        self.node.touch();
        match frame.event.as_str() {
            event::HEARTBEAT => {
                *heartbeat_deadline = Instant::now() + heartbeat * 2;
                self.reply_ok(&frame, json!({}));
            }
            event::JOIN => self.handle_join(frame).await,
            event::LEAVE => self.handle_leave(frame).await,
            event::ACCESS_TOKEN => self.handle_access_token(frame, token_deadline).await,
            event::PRESENCE => self.handle_presence(frame).await,
            _ => self.handle_broadcast(frame).await,
        }
    }

    async fn handle_join(&mut self, frame: ClientFrame) {
        let payload: JoinPayload = match serde_json::from_value(frame.payload.clone()) {
            Ok(payload) => payload,
            Err(err) => {
                self.reply_error(&frame, json!({"reason": format!("bad join payload: {err}")}));
                return;
            }
        };
        if let Some(token) = &payload.access_token {
            if !self.rotate_token(token, &frame).await {
                return;
            }
        }

        let request = SubscribeRequest {
            tenant: self.tenant.external_id.clone(),
            quotas: self.tenant.quotas,
            topic: frame.topic.clone(),
            session: self.handle.clone(),
            config: payload.config.clone(),
            claims: Some(self.claims.clone()),
            channels_opened: self.joined.len() as u32,
        };
        let result = self.state.hub.subscribe(request).await;
        self.note_hub_result(&result);
        match result {
            Ok(subscribed) => {
                let change_entries: Vec<Value> = subscribed
                    .change_ids
                    .iter()
                    .zip(&payload.config.postgres_changes)
                    .map(|(id, params)| {
                        json!({
                            "id": id,
                            "event": params.event,
                            "schema": params.schema,
                            "table": params.table,
                            "filter": params.filter,
                        })
                    })
                    .collect();
                let has_presence = payload.config.presence.is_some();
                self.joined.insert(frame.topic.clone(), payload.config);
                self.reply_ok(&frame, json!({"postgres_changes": change_entries}));
                self.push(ServerFrame::system(&frame.topic, "ok", "SUBSCRIBED"));
                if has_presence || subscribed.presence_state.as_object().is_some_and(|o| !o.is_empty()) {
                    self.push(ServerFrame {
                        topic: frame.topic.clone(),
                        event: event::PRESENCE_STATE.to_string(),
                        payload: subscribed.presence_state,
                        reference: None,
                    });
                }
                metrics::counter!("sluice_session_joins_total").increment(1);
            }
            Err(err) => {
                self.reply_error(&frame, json!({"reason": err.to_string()}));
                self.push(ServerFrame::system(&frame.topic, "error", "CHANNEL_ERROR"));
            }
        }
    }

    async fn handle_leave(&mut self, frame: ClientFrame) {
        self.state
            .hub
            .unsubscribe(&self.tenant.external_id, &frame.topic, self.session)
            .await;
        self.joined.remove(&frame.topic);
        self.reply_ok(&frame, json!({}));
    }

    async fn handle_access_token(&mut self, frame: ClientFrame, token_deadline: &mut Instant) {
        let Some(token) = frame
            .payload
            .get("access_token")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            self.reply_error(&frame, json!({"reason": "missing access_token"}));
            return;
        };
        if self.rotate_token(&token, &frame).await {
            *token_deadline = expiry_deadline(&self.claims);
            self.reply_ok(&frame, json!({}));
        }
    }

    /// Swap the session's claims for a fresh token. On verification failure
    /// the session closes: subscriptions must not outlive their proof.
    async fn rotate_token(&mut self, token: &str, frame: &ClientFrame) -> bool {
        match self.state.verifier.verify(&self.tenant, token).await {
            Ok(claims) => {
                self.claims = claims;
                true
            }
            Err(err) => {
                self.reply_error(frame, json!({"reason": err.to_string()}));
                self.handle.gate().force_close(close::TOKEN_EXPIRED);
                false
            }
        }
    }

    async fn handle_presence(&mut self, frame: ClientFrame) {
        let action = frame
            .payload
            .get("event")
            .or_else(|| frame.payload.get("type"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let result = match action.as_str() {
            "track" => {
                let meta = frame.payload.get("payload").cloned().unwrap_or(json!({}));
                self.state
                    .hub
                    .track(&self.tenant.external_id, &frame.topic, self.session, meta)
                    .await
            }
            "untrack" => {
                self.state
                    .hub
                    .untrack(&self.tenant.external_id, &frame.topic, self.session)
                    .await
            }
            other => {
                self.reply_error(&frame, json!({"reason": format!("unknown presence event {other:?}")}));
                return;
            }
        };
        self.note_hub_result(&result);
        match result {
            Ok(()) => self.reply_ok(&frame, json!({})),
            Err(err) => self.reply_error(&frame, json!({"reason": err.to_string()})),
        }
    }

    async fn handle_broadcast(&mut self, frame: ClientFrame) {
        let Some(config) = self.joined.get(&frame.topic).cloned() else {
            self.reply_error(&frame, json!({"reason": "you must join the topic first"}));
            return;
        };
        // A `broadcast` frame nests the event name in its payload; a custom
        // event uses the frame event directly.
        let (event_name, data) = if frame.event == event::BROADCAST {
            let name = frame
                .payload
                .get("event")
                .and_then(Value::as_str)
                .unwrap_or(event::BROADCAST)
                .to_string();
            let data = frame.payload.get("payload").cloned().unwrap_or(Value::Null);
            (name, data)
        } else {
            (frame.event.clone(), frame.payload.clone())
        };

        let result = self
            .state
            .hub
            .broadcast(BroadcastRequest {
                tenant: self.tenant.external_id.clone(),
                quotas: self.tenant.quotas,
                topic: frame.topic.clone(),
                event: event_name.clone(),
                payload: data.clone(),
                sender: Some(self.session),
                claims: Some(self.claims.clone()),
                assume_private: self.state.config.secure_channels,
            })
            .await;
        self.note_hub_result(&result);
        match result {
            Ok(_) => {
                if self.tenant.persist_broadcasts {
                    if let Err(err) = self
                        .node
                        .persist_broadcast(&frame.topic, &event_name, &data, config.private)
                        .await
                    {
                        tracing::warn!(error = %err, "broadcast persistence failed");
                    }
                }
                if config.broadcast.ack && frame.reference.is_some() {
                    self.reply_ok(&frame, json!({}));
                }
            }
            Err(err) => self.reply_error(&frame, json!({"reason": err.to_string()})),
        }
    }

    fn reply_ok(&self, frame: &ClientFrame, response: Value) {
        self.push(ServerFrame::reply_ok(
            &frame.topic,
            frame.reference.clone(),
            response,
        ));
    }

    fn reply_error(&self, frame: &ClientFrame, response: Value) {
        self.push(ServerFrame::reply_error(
            &frame.topic,
            frame.reference.clone(),
            response,
        ));
    }

    fn push(&self, frame: ServerFrame) {
        // Queue pressure is handled by the hub's slow-consumer policy; a
        // failed push here means the session is already closing.
        let _ = self.handle.push_frame(&frame);
    }
}

fn expiry_deadline(claims: &Claims) -> Instant {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let remaining = claims.exp.saturating_sub(now).max(0) as u64;
    Instant::now() + Duration::from_secs(remaining)
}

fn close_reason(code: u16) -> &'static str {
    match code {
        close::GOING_AWAY => "server going away",
        close::SLOW_CONSUMER => "outbound queue overflow",
        close::HEARTBEAT_TIMEOUT => "heartbeat timeout",
        close::TOKEN_EXPIRED => "access token expired",
        close::TENANT_SUSPENDED => "tenant suspended",
        _ => "closed",
    }
}
