//! Gateway HTTP + WebSocket server (single port).
//!
//! Serves the chat surface (open/chat/retry) and the admin CRM methods
//! (login, leads, settings) over one WebSocket protocol, plus an HTTP health
//! probe. Admin methods require a successful `admin.login` on the same
//! connection.

use crate::config::{self, Config};
use crate::consultant::{Consultant, RetryPolicy, TokioDelay, TurnError};
use crate::gateway::protocol::{
    ChatParams, ConnectParams, HelloOk, LeadParams, LeadsListParams, LoginParams, RetryParams,
    SettingsUpdateParams, WsRequest, WsResponse,
};
use crate::init;
use crate::lead::LeadRecord;
use crate::llm::{GeminiClient, LlmBackend};
use crate::persona;
use crate::session::SessionStore;
use crate::store::{LeadStore, SettingsStore};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const PROTOCOL_VERSION: u32 = 1;

const SHUTDOWN_EVENT_JSON: &str = r#"{"type":"event","event":"shutdown","payload":{}}"#;

/// User-facing notice when no model credential can be resolved.
const MISSING_KEY_NOTICE: &str =
    "Configure a variável GEMINI_API_KEY (ou defina uma chave no painel) para ativar as respostas da IA.";

/// Shared state for the gateway (config, stores, consultant).
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    /// When Some, WebSocket connect must provide params.auth.token matching this.
    pub required_token: Option<String>,
    /// Broadcasts events to connected clients (cooldown ticks, session
    /// messages, shutdown). Subscribers receive JSON event frames.
    pub event_tx: broadcast::Sender<String>,
    pub sessions: Arc<SessionStore>,
    pub leads: Arc<LeadStore>,
    pub settings: Arc<SettingsStore>,
    pub consultant: Arc<Consultant>,
}

impl GatewayState {
    /// Build the state from config plus an already-constructed backend. The
    /// gateway uses [`GeminiClient`]; tests may inject a fake.
    pub async fn build(
        config: Config,
        config_path: &PathBuf,
        backend: Arc<dyn LlmBackend>,
    ) -> Self {
        let required_token = if config.gateway.auth.mode == config::GatewayAuthMode::Token {
            config::resolve_gateway_token(&config)
        } else {
            None
        };
        let (event_tx, _) = broadcast::channel(64);
        let sessions = Arc::new(SessionStore::new());
        let leads = Arc::new(LeadStore::load(config::leads_path(config_path)).await);
        let settings = Arc::new(SettingsStore::load(config::settings_path(config_path)).await);

        let workspace_dir = config::resolve_workspace_dir(&config);
        let persona_ctx = persona::load_persona_ctx(workspace_dir.as_deref());
        let system_instruction = persona::build_system_instruction(persona_ctx.as_deref());

        let policy = RetryPolicy {
            max_attempts: config.consultant.max_attempts.max(1),
            base_delay: Duration::from_millis(config.consultant.base_delay_ms),
            cooldown: Duration::from_secs(config.consultant.cooldown_secs),
        };
        let consultant = Arc::new(Consultant::new(
            backend,
            Arc::new(TokioDelay),
            policy,
            config.consultant.history_window.max(1),
            system_instruction,
            sessions.clone(),
            leads.clone(),
        ));

        Self {
            config: Arc::new(config),
            required_token,
            event_tx,
            sessions,
            leads,
            settings,
            consultant,
        }
    }

    /// Credential for the next turn: admin override, then env, then config.
    async fn resolve_api_key(&self) -> Option<String> {
        let settings = self.settings.get().await;
        config::resolve_api_key(settings.custom_api_key.as_deref(), &self.config)
    }
}

/// Broadcast a session.message event over WebSocket to connected clients.
fn broadcast_session_message(
    state: &GatewayState,
    session_id: &str,
    role: &str,
    content: &str,
    error: bool,
) {
    let event = json!({
        "type": "event",
        "event": "session.message",
        "payload": {
            "sessionId": session_id,
            "role": role,
            "content": content,
            "error": error,
        }
    });
    if let Ok(text) = serde_json::to_string(&event) {
        let _ = state.event_tx.send(text);
    }
}

/// One chat.cooldown event per second until the countdown reaches zero, then
/// the task ends. The gate itself is time-based; this is the client's clock.
fn spawn_cooldown_ticker(state: &GatewayState, session_id: String) {
    let event_tx = state.event_tx.clone();
    let consultant = state.consultant.clone();
    tokio::spawn(async move {
        loop {
            let remaining = consultant
                .cooldown_remaining(&session_id)
                .await
                .unwrap_or(0);
            let event = json!({
                "type": "event",
                "event": "chat.cooldown",
                "payload": { "sessionId": session_id, "remaining": remaining }
            });
            let _ = event_tx.send(event.to_string());
            if remaining == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    });
}

fn lead_payload(lead: &LeadRecord) -> serde_json::Value {
    json!({
        "stage": lead.stage,
        "status": lead.status,
        "score": lead.score,
    })
}

/// Map a turn error to the wire message a client shows; cooldown and
/// credential errors carry their distinct texts.
fn turn_error_message(err: &TurnError) -> String {
    match err {
        TurnError::MissingApiKey => MISSING_KEY_NOTICE.to_string(),
        other => other.to_string(),
    }
}

/// Run the gateway server; binds to config.gateway.bind:config.gateway.port.
/// When bind is not loopback, a gateway token must be configured or startup fails.
/// Blocks until shutdown (e.g. Ctrl+C).
pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    init::require_initialized(&config_path, &config)?;
    let bind = config.gateway.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) {
        let token = config::resolve_gateway_token(&config);
        if token.is_none() || config.gateway.auth.mode != config::GatewayAuthMode::Token {
            anyhow::bail!(
                "refusing to bind gateway to {} without auth (set gateway.auth.mode to \"token\" and gateway.auth.token or FUNIL_GATEWAY_TOKEN)",
                bind
            );
        }
    }

    let backend: Arc<dyn LlmBackend> = Arc::new(GeminiClient::new(
        None,
        config.consultant.model.clone(),
    ));
    let state = GatewayState::build(config, &config_path, backend).await;
    serve(state, &bind).await
}

/// Bind and serve an already-built state (also used by integration tests).
pub async fn serve(state: GatewayState, bind: &str) -> Result<()> {
    let event_tx = state.event_tx.clone();
    let port = state.config.gateway.port;
    let app = Router::new()
        .route("/", get(health_http))
        .route("/ws", get(ws_handler))
        .with_state(state);

    let bind_addr = format!("{}:{}", bind, port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(event_tx))
        .await
        .context("gateway server exited")?;
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
/// Broadcasts a shutdown event to WebSocket clients first.
async fn shutdown_signal(event_tx: broadcast::Sender<String>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, broadcasting shutdown");
    let _ = event_tx.send(SHUTDOWN_EVENT_JSON.to_string());
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "protocol": PROTOCOL_VERSION,
        "port": state.config.gateway.port,
    }))
}

/// GET /ws upgrades to WebSocket. First request should be connect; we reply
/// with hello-ok.
async fn ws_handler(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send_res(socket: &mut WebSocket, res: WsResponse) -> bool {
    socket
        .send(Message::Text(
            serde_json::to_string(&res).unwrap_or_default(),
        ))
        .await
        .is_ok()
}

async fn handle_socket(mut socket: WebSocket, state: GatewayState) {
    let mut event_rx = state.event_tx.subscribe();
    let mut admin_authed = false;

    loop {
        tokio::select! {
            biased;

            event = event_rx.recv() => {
                match event {
                    Ok(text) => {
                        let is_shutdown = text == SHUTDOWN_EVENT_JSON;
                        let _ = socket.send(Message::Text(text)).await;
                        if is_shutdown {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("ws client lagged {} broadcast messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                let Message::Text(text) = msg else { continue };
                let Ok(req): Result<WsRequest, _> = serde_json::from_str(&text) else { continue };
                if req.typ != "req" {
                    continue;
                }
                if !handle_request(&mut socket, &state, &mut admin_authed, req).await {
                    break;
                }
            }
        }
    }
}

/// Dispatch one request frame; returns false when the socket is gone.
async fn handle_request(
    socket: &mut WebSocket,
    state: &GatewayState,
    admin_authed: &mut bool,
    req: WsRequest,
) -> bool {
    match req.method.as_str() {
        "connect" => {
            let params: ConnectParams = match serde_json::from_value(req.params.clone()) {
                Ok(p) => p,
                Err(_) => return send_res(socket, WsResponse::err(&req.id, "invalid connect params")).await,
            };
            if let Some(ref required) = state.required_token {
                let provided = params.auth.token.as_deref().unwrap_or("").trim();
                if provided.is_empty() {
                    return send_res(
                        socket,
                        WsResponse::err(
                            &req.id,
                            "unauthorized: gateway token missing (set FUNIL_GATEWAY_TOKEN or gateway.auth.token)",
                        ),
                    )
                    .await;
                }
                if provided != required {
                    return send_res(
                        socket,
                        WsResponse::err(&req.id, "unauthorized: gateway token mismatch"),
                    )
                    .await;
                }
            }
            let protocol = params
                .max_protocol
                .unwrap_or(PROTOCOL_VERSION)
                .min(PROTOCOL_VERSION);
            let hello = HelloOk {
                typ: "hello-ok".to_string(),
                protocol,
            };
            send_res(
                socket,
                WsResponse::ok(&req.id, serde_json::to_value(&hello).unwrap_or(json!({}))),
            )
            .await
        }
        "health" => {
            let payload = json!({
                "runtime": "running",
                "protocol": PROTOCOL_VERSION,
            });
            send_res(socket, WsResponse::ok(&req.id, payload)).await
        }
        "status" => {
            let policy = state.consultant.policy();
            let has_api_key = state.resolve_api_key().await.is_some();
            let payload = json!({
                "runtime": "running",
                "protocol": PROTOCOL_VERSION,
                "port": state.config.gateway.port,
                "bind": state.config.gateway.bind,
                "auth": if state.required_token.is_some() { "token" } else { "none" },
                "model": state.config.consultant.model.as_deref().unwrap_or(crate::llm::DEFAULT_MODEL),
                "hasApiKey": has_api_key,
                "historyWindow": state.config.consultant.history_window,
                "retry": {
                    "maxAttempts": policy.max_attempts,
                    "baseDelayMs": policy.base_delay.as_millis() as u64,
                    "cooldownSecs": policy.cooldown.as_secs(),
                },
            });
            send_res(socket, WsResponse::ok(&req.id, payload)).await
        }
        "open" => match state.consultant.open_conversation().await {
            Ok((session_id, greeting)) => {
                broadcast_session_message(state, &session_id, "assistant", &greeting, false);
                let payload = json!({ "sessionId": session_id, "greeting": greeting });
                send_res(socket, WsResponse::ok(&req.id, payload)).await
            }
            Err(e) => send_res(socket, WsResponse::err(&req.id, e.to_string())).await,
        },
        "chat" => {
            let params: ChatParams = match serde_json::from_value(req.params.clone()) {
                Ok(p) => p,
                Err(_) => return send_res(socket, WsResponse::err(&req.id, "invalid chat params")).await,
            };
            let session_id = match params.session_id {
                Some(id) => state.sessions.get_or_create(id).await,
                None => match state.consultant.open_conversation().await {
                    Ok((id, greeting)) => {
                        broadcast_session_message(state, &id, "assistant", &greeting, false);
                        id
                    }
                    Err(e) => {
                        return send_res(socket, WsResponse::err(&req.id, e.to_string())).await
                    }
                },
            };
            let api_key = state.resolve_api_key().await;
            let result = state
                .consultant
                .run_turn(&session_id, &params.message, api_key.as_deref())
                .await;
            finish_turn(
                socket,
                state,
                &req.id,
                &session_id,
                Some(&params.message),
                result,
            )
            .await
        }
        "retry" => {
            let params: RetryParams = match serde_json::from_value(req.params.clone()) {
                Ok(p) => p,
                Err(_) => return send_res(socket, WsResponse::err(&req.id, "invalid retry params")).await,
            };
            let api_key = state.resolve_api_key().await;
            let result = state
                .consultant
                .retry_last(&params.session_id, api_key.as_deref())
                .await;
            finish_turn(socket, state, &req.id, &params.session_id, None, result).await
        }
        "admin.login" => {
            let params: LoginParams = match serde_json::from_value(req.params.clone()) {
                Ok(p) => p,
                Err(_) => return send_res(socket, WsResponse::err(&req.id, "invalid login params")).await,
            };
            let expected = config::resolve_admin_password(&state.config);
            let ok = match expected {
                Some(ref password) => {
                    params.username == state.config.admin.username
                        && params.password == *password
                }
                None => false,
            };
            if ok {
                *admin_authed = true;
                send_res(socket, WsResponse::ok(&req.id, json!({ "authenticated": true }))).await
            } else {
                log::warn!("admin login rejected for user {:?}", params.username);
                send_res(socket, WsResponse::err(&req.id, "acesso restrito")).await
            }
        }
        "leads.list" => {
            if !*admin_authed {
                return send_res(socket, WsResponse::err(&req.id, "admin login required")).await;
            }
            let params: LeadsListParams =
                serde_json::from_value(req.params.clone()).unwrap_or_default();
            let leads = match params.query.as_deref() {
                Some(q) => state.leads.search(q).await,
                None => state.leads.list().await,
            };
            send_res(socket, WsResponse::ok(&req.id, json!({ "leads": leads }))).await
        }
        "leads.get" => {
            if !*admin_authed {
                return send_res(socket, WsResponse::err(&req.id, "admin login required")).await;
            }
            let params: LeadParams = match serde_json::from_value(req.params.clone()) {
                Ok(p) => p,
                Err(_) => return send_res(socket, WsResponse::err(&req.id, "invalid lead params")).await,
            };
            match state.leads.get(&params.id).await {
                Some(lead) => send_res(socket, WsResponse::ok(&req.id, json!({ "lead": lead }))).await,
                None => send_res(socket, WsResponse::err(&req.id, "lead not found")).await,
            }
        }
        "leads.delete" => {
            if !*admin_authed {
                return send_res(socket, WsResponse::err(&req.id, "admin login required")).await;
            }
            let params: LeadParams = match serde_json::from_value(req.params.clone()) {
                Ok(p) => p,
                Err(_) => return send_res(socket, WsResponse::err(&req.id, "invalid lead params")).await,
            };
            match state.leads.delete(&params.id).await {
                Ok(existed) => {
                    if existed {
                        state.sessions.remove(&params.id).await;
                    }
                    send_res(socket, WsResponse::ok(&req.id, json!({ "deleted": existed }))).await
                }
                Err(e) => send_res(socket, WsResponse::err(&req.id, e.to_string())).await,
            }
        }
        "settings.get" => {
            if !*admin_authed {
                return send_res(socket, WsResponse::err(&req.id, "admin login required")).await;
            }
            let settings = state.settings.get().await;
            send_res(socket, WsResponse::ok(&req.id, json!({ "settings": settings }))).await
        }
        "settings.update" => {
            if !*admin_authed {
                return send_res(socket, WsResponse::err(&req.id, "admin login required")).await;
            }
            let params: SettingsUpdateParams =
                serde_json::from_value(req.params.clone()).unwrap_or_default();
            match state.settings.update(params.custom_api_key).await {
                Ok(settings) => {
                    send_res(socket, WsResponse::ok(&req.id, json!({ "settings": settings }))).await
                }
                Err(e) => send_res(socket, WsResponse::err(&req.id, e.to_string())).await,
            }
        }
        _ => {
            send_res(
                socket,
                WsResponse::err(&req.id, format!("unknown method: {}", req.method)),
            )
            .await
        }
    }
}

/// Shared tail of chat/retry: broadcast, start the cooldown ticker on a
/// terminal failure, and answer the request frame. `user_text` is broadcast
/// only when the turn actually consumed it (accepted or terminally failed);
/// up-front rejections never reached the conversation.
async fn finish_turn(
    socket: &mut WebSocket,
    state: &GatewayState,
    req_id: &str,
    session_id: &str,
    user_text: Option<&str>,
    result: Result<crate::consultant::TurnOutcome, TurnError>,
) -> bool {
    if let Some(text) = user_text {
        if matches!(result, Ok(_) | Err(TurnError::Failed(_))) {
            broadcast_session_message(state, session_id, "user", text, false);
        }
    }
    match result {
        Ok(outcome) => {
            broadcast_session_message(state, session_id, "assistant", &outcome.reply, false);
            let payload = json!({
                "sessionId": session_id,
                "reply": outcome.reply,
                "lead": lead_payload(&outcome.lead),
            });
            send_res(socket, WsResponse::ok(req_id, payload)).await
        }
        Err(err) => {
            if matches!(err, TurnError::Failed(_)) {
                // The synthetic notice is the last message of the session.
                if let Some(session) = state.sessions.get(session_id).await {
                    if let Some(last) = session.messages.last().filter(|m| m.error) {
                        broadcast_session_message(state, session_id, &last.role, &last.text, true);
                    }
                }
                spawn_cooldown_ticker(state, session_id.to_string());
            }
            send_res(socket, WsResponse::err(req_id, turn_error_message(&err))).await
        }
    }
}
