use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser)]
#[command(name = "funil")]
#[command(about = "Funil CLI — sales consultant gateway and lead CRM", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and default files (config, workspace, PERSONA.md).
    Init {
        /// Config file path (default: FUNIL_CONFIG_PATH or ~/.funil/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Run the gateway (HTTP + WebSocket for the chat widget and admin panel).
    Gateway {
        /// Config file path (default: FUNIL_CONFIG_PATH or ~/.funil/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// WebSocket and HTTP port (default from config or 16161)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Chat with the consultant via the gateway (interactive).
    Chat {
        /// Config file path (default: FUNIL_CONFIG_PATH or ~/.funil/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Optional existing session id to continue.
        #[arg(long, value_name = "ID")]
        session: Option<String>,
    },

    /// Admin: inspect or delete captured leads via the gateway.
    Leads {
        /// Config file path (default: FUNIL_CONFIG_PATH or ~/.funil/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        #[command(subcommand)]
        action: LeadsAction,
    },

    /// Admin: show or change runtime settings (API key override).
    Settings {
        /// Config file path (default: FUNIL_CONFIG_PATH or ~/.funil/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Set the API key override used instead of GEMINI_API_KEY.
        #[arg(long, value_name = "KEY", conflicts_with = "clear_key")]
        set_key: Option<String>,

        /// Clear the API key override.
        #[arg(long)]
        clear_key: bool,
    },
}

#[derive(Subcommand)]
enum LeadsAction {
    /// List leads, optionally filtered by a name/email/phone substring.
    List {
        #[arg(long, value_name = "TEXT")]
        query: Option<String>,
    },
    /// Show one lead with its conversation transcript.
    Show {
        #[arg(value_name = "ID")]
        id: String,
    },
    /// Delete a lead (and its conversation).
    Delete {
        #[arg(value_name = "ID")]
        id: String,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("funil {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Gateway { config, port }) => {
            if let Err(e) = run_gateway(config, port).await {
                log::error!("gateway failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat { config, session }) => {
            if let Err(e) = run_chat(config, session).await {
                log::error!("chat failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Leads { config, action }) => {
            if let Err(e) = run_leads(config, action).await {
                log::error!("leads failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Settings {
            config,
            set_key,
            clear_key,
        }) => {
            if let Err(e) = run_settings(config, set_key, clear_key).await {
                log::error!("settings failed: {}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(lib::config::default_config_path);
    let _dir = lib::init::init_config_dir(&path)?;
    println!(
        "initialized configuration at {}",
        path.parent().unwrap_or(std::path::Path::new(".")).display()
    );
    Ok(())
}

async fn run_gateway(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let (mut config, path) = lib::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!(
        "starting gateway on {}:{}",
        config.gateway.bind,
        config.gateway.port
    );
    lib::gateway::run_gateway(config, path).await
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Connect to the gateway WebSocket and complete the connect handshake.
async fn gateway_connect(config_path: Option<std::path::PathBuf>) -> Result<WsStream, String> {
    let (config, _) = lib::config::load_config(config_path).map_err(|e| e.to_string())?;
    let bind = config.gateway.bind.trim().to_string();
    let port = config.gateway.port;
    let token = lib::config::resolve_gateway_token(&config);
    let ws_url = format!("ws://{}:{}/ws", bind, port);

    let (mut ws, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .map_err(|e| e.to_string())?;

    let mut connect_params = serde_json::json!({
        "client": { "id": "funil-cli" },
    });
    if let Some(ref t) = token {
        connect_params["auth"] = serde_json::json!({ "token": t });
    }
    request(&mut ws, "connect", connect_params).await?;
    Ok(ws)
}

/// Send one request and wait for the matching response frame; event frames
/// in between are skipped.
async fn request(
    ws: &mut WsStream,
    method: &str,
    params: serde_json::Value,
) -> Result<serde_json::Value, String> {
    let id = format!("{}-{}", method, std::process::id());
    let req = serde_json::json!({
        "type": "req",
        "id": id,
        "method": method,
        "params": params
    });
    ws.send(Message::Text(req.to_string()))
        .await
        .map_err(|e| e.to_string())?;

    while let Some(msg) = ws.next().await {
        let msg = msg.map_err(|e| e.to_string())?;
        let Message::Text(text) = msg else { continue };
        let res: serde_json::Value = serde_json::from_str(&text).map_err(|e| e.to_string())?;
        if res.get("type").and_then(|v| v.as_str()) != Some("res") {
            continue;
        }
        if res.get("id").and_then(|v| v.as_str()) != Some(id.as_str()) {
            continue;
        }
        if !res.get("ok").and_then(|v| v.as_bool()).unwrap_or(false) {
            let err = res
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("request failed");
            return Err(err.to_string());
        }
        return Ok(res.get("payload").cloned().unwrap_or(serde_json::json!({})));
    }
    Err(format!("no response for {}", method))
}

async fn run_chat(
    config_path: Option<std::path::PathBuf>,
    session: Option<String>,
) -> anyhow::Result<()> {
    use std::io::{self, Write};

    let mut ws = gateway_connect(config_path)
        .await
        .map_err(anyhow::Error::msg)?;

    let mut current_session = match session {
        Some(id) => id,
        None => {
            let payload = request(&mut ws, "open", serde_json::json!({}))
                .await
                .map_err(anyhow::Error::msg)?;
            if let Some(greeting) = payload.get("greeting").and_then(|v| v.as_str()) {
                println!("< {}", greeting);
            }
            payload
                .get("sessionId")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        }
    };

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
            break;
        }

        let result = if input.eq_ignore_ascii_case("/retry") {
            request(
                &mut ws,
                "retry",
                serde_json::json!({ "sessionId": current_session }),
            )
            .await
        } else {
            request(
                &mut ws,
                "chat",
                serde_json::json!({ "sessionId": current_session, "message": input }),
            )
            .await
        };

        match result {
            Ok(payload) => {
                if let Some(id) = payload.get("sessionId").and_then(|v| v.as_str()) {
                    current_session = id.to_string();
                }
                let reply = payload.get("reply").and_then(|v| v.as_str()).unwrap_or("");
                println!("< {}", reply.trim());
            }
            Err(e) => {
                // Cooldown and credential errors arrive here; /retry re-sends
                // the last message once the countdown is over.
                eprintln!("chat error: {}", e);
            }
        }
    }

    Ok(())
}

/// Log in as admin on an open connection using configured credentials.
async fn admin_login(
    ws: &mut WsStream,
    config_path: Option<std::path::PathBuf>,
) -> Result<(), String> {
    let (config, _) = lib::config::load_config(config_path).map_err(|e| e.to_string())?;
    let password = lib::config::resolve_admin_password(&config).ok_or(
        "no admin password configured (set FUNIL_ADMIN_PASSWORD or admin.password in config.json)",
    )?;
    request(
        ws,
        "admin.login",
        serde_json::json!({ "username": config.admin.username, "password": password }),
    )
    .await
    .map(|_| ())
}

async fn run_leads(
    config_path: Option<std::path::PathBuf>,
    action: LeadsAction,
) -> anyhow::Result<()> {
    let mut ws = gateway_connect(config_path.clone())
        .await
        .map_err(anyhow::Error::msg)?;
    admin_login(&mut ws, config_path).await.map_err(anyhow::Error::msg)?;

    match action {
        LeadsAction::List { query } => {
            let mut params = serde_json::json!({});
            if let Some(q) = query {
                params["query"] = serde_json::Value::String(q);
            }
            let payload = request(&mut ws, "leads.list", params)
                .await
                .map_err(anyhow::Error::msg)?;
            let leads = payload
                .get("leads")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            if leads.is_empty() {
                println!("no leads");
                return Ok(());
            }
            for lead in leads {
                println!(
                    "{}  {}  {}  {}  score {}",
                    lead.get("id").and_then(|v| v.as_str()).unwrap_or("?"),
                    lead.get("name").and_then(|v| v.as_str()).unwrap_or("?"),
                    lead.get("stage").and_then(|v| v.as_str()).unwrap_or("?"),
                    lead.get("status").and_then(|v| v.as_str()).unwrap_or("?"),
                    lead.get("score").and_then(|v| v.as_u64()).unwrap_or(0),
                );
            }
        }
        LeadsAction::Show { id } => {
            let payload = request(&mut ws, "leads.get", serde_json::json!({ "id": id }))
                .await
                .map_err(anyhow::Error::msg)?;
            let lead = payload.get("lead").cloned().unwrap_or(serde_json::json!({}));
            println!("{}", serde_json::to_string_pretty(&lead)?);
        }
        LeadsAction::Delete { id } => {
            let payload = request(&mut ws, "leads.delete", serde_json::json!({ "id": id }))
                .await
                .map_err(anyhow::Error::msg)?;
            let deleted = payload
                .get("deleted")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            println!("{}", if deleted { "deleted" } else { "not found" });
        }
    }
    Ok(())
}

async fn run_settings(
    config_path: Option<std::path::PathBuf>,
    set_key: Option<String>,
    clear_key: bool,
) -> anyhow::Result<()> {
    let mut ws = gateway_connect(config_path.clone())
        .await
        .map_err(anyhow::Error::msg)?;
    admin_login(&mut ws, config_path).await.map_err(anyhow::Error::msg)?;

    let payload = if let Some(key) = set_key {
        request(
            &mut ws,
            "settings.update",
            serde_json::json!({ "customApiKey": key }),
        )
        .await
        .map_err(anyhow::Error::msg)?
    } else if clear_key {
        request(
            &mut ws,
            "settings.update",
            serde_json::json!({ "customApiKey": "" }),
        )
        .await
        .map_err(anyhow::Error::msg)?
    } else {
        request(&mut ws, "settings.get", serde_json::json!({}))
            .await
            .map_err(anyhow::Error::msg)?
    };

    let settings = payload
        .get("settings")
        .cloned()
        .unwrap_or(serde_json::json!({}));
    let has_override = settings
        .get("customApiKey")
        .and_then(|v| v.as_str())
        .is_some();
    println!(
        "api key override: {}",
        if has_override { "set" } else { "not set" }
    );
    Ok(())
}
