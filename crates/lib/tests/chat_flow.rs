//! Integration test: drive the WebSocket protocol end to end against a
//! scripted backend — connect, open, chat, then the admin methods.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use lib::config::Config;
use lib::gateway::{self, GatewayState};
use lib::llm::{ChatMessage, LlmBackend, LlmError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

struct ScriptedBackend {
    reply: String,
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    async fn send_turn(
        &self,
        _api_key: &str,
        _system_instruction: &str,
        _history: &[ChatMessage],
        _text: &str,
    ) -> Result<String, LlmError> {
        Ok(self.reply.clone())
    }
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

fn temp_config_path() -> PathBuf {
    std::env::temp_dir()
        .join(format!("funil-chat-flow-test-{}", uuid::Uuid::new_v4()))
        .join("config.json")
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Send one request frame and wait for the matching response frame,
/// skipping any event frames in between.
async fn request(
    ws: &mut WsStream,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let req = serde_json::json!({ "type": "req", "id": id, "method": method, "params": params });
    ws.send(Message::Text(req.to_string())).await.expect("send");
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("response in time")
            .expect("stream open")
            .expect("frame");
        let Message::Text(text) = msg else { continue };
        let value: serde_json::Value = serde_json::from_str(&text).expect("json frame");
        if value.get("type").and_then(|v| v.as_str()) == Some("res")
            && value.get("id").and_then(|v| v.as_str()) == Some(id)
        {
            return value;
        }
    }
}

#[tokio::test]
async fn chat_and_admin_round_trip() {
    let port = free_port();
    let config_path = temp_config_path();

    let mut config = Config::default();
    config.gateway.port = port;
    config.consultant.api_key = Some("test-key".to_string());
    config.admin.password = Some("segredo".to_string());

    let backend: Arc<dyn LlmBackend> = Arc::new(ScriptedBackend {
        reply: "Ótimo, vamos começar!<analysis>{\"stage\":\"Diagnóstico\",\"status\":\"Morno\",\"score\":30,\"next_step\":\"perguntar sobre orçamento\",\"extracted_data\":{}}</analysis>".to_string(),
    });
    let state = GatewayState::build(config, &config_path, backend).await;
    tokio::spawn(async move {
        let _ = gateway::serve(state, "127.0.0.1").await;
    });

    let ws_url = format!("ws://127.0.0.1:{}/ws", port);
    let mut ws = None;
    for _ in 0..100 {
        match tokio_tungstenite::connect_async(&ws_url).await {
            Ok((stream, _)) => {
                ws = Some(stream);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    let mut ws = ws.expect("gateway up within 5s");

    let res = request(&mut ws, "1", "connect", serde_json::json!({})).await;
    assert_eq!(res["ok"], true);
    assert_eq!(res["payload"]["protocol"], 1);

    let res = request(&mut ws, "2", "open", serde_json::json!({})).await;
    assert_eq!(res["ok"], true);
    let session_id = res["payload"]["sessionId"].as_str().expect("session id").to_string();
    assert!(res["payload"]["greeting"].as_str().unwrap().starts_with("Olá!"));

    let res = request(
        &mut ws,
        "3",
        "chat",
        serde_json::json!({ "sessionId": session_id, "message": "Quero gerar mais leads" }),
    )
    .await;
    assert_eq!(res["ok"], true);
    assert_eq!(res["payload"]["reply"], "Ótimo, vamos começar!");
    assert_eq!(res["payload"]["lead"]["stage"], "Diagnóstico");
    assert_eq!(res["payload"]["lead"]["status"], "Morno");
    assert_eq!(res["payload"]["lead"]["score"], 30);

    // Admin methods are gated until login.
    let res = request(&mut ws, "4", "leads.list", serde_json::json!({})).await;
    assert_eq!(res["ok"], false);

    let res = request(
        &mut ws,
        "5",
        "admin.login",
        serde_json::json!({ "username": "admin", "password": "errada" }),
    )
    .await;
    assert_eq!(res["ok"], false);

    let res = request(
        &mut ws,
        "6",
        "admin.login",
        serde_json::json!({ "username": "admin", "password": "segredo" }),
    )
    .await;
    assert_eq!(res["ok"], true);

    let res = request(&mut ws, "7", "leads.list", serde_json::json!({})).await;
    assert_eq!(res["ok"], true);
    let leads = res["payload"]["leads"].as_array().expect("leads array");
    assert_eq!(leads.len(), 1);
    assert_eq!(leads[0]["id"], session_id.as_str());
    assert_eq!(leads[0]["score"], 30);

    let res = request(
        &mut ws,
        "8",
        "settings.update",
        serde_json::json!({ "customApiKey": "painel-key" }),
    )
    .await;
    assert_eq!(res["ok"], true);
    assert_eq!(res["payload"]["settings"]["customApiKey"], "painel-key");

    let res = request(
        &mut ws,
        "9",
        "leads.delete",
        serde_json::json!({ "id": session_id }),
    )
    .await;
    assert_eq!(res["ok"], true);
    assert_eq!(res["payload"]["deleted"], true);

    let res = request(&mut ws, "10", "leads.list", serde_json::json!({})).await;
    assert_eq!(res["payload"]["leads"].as_array().unwrap().len(), 0);
}
