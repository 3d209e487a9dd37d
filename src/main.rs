use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use clap::{Parser, Subcommand};
use clawlink::chat::{
    CachedChatProvider, ChatEvent, ChatProvider, FileStore, GatewayChatProvider, SendParams,
};
use clawlink::config::{Config, ServerConfig};
use clawlink::logging::{self, LogConfig};
use clawlink::{GatewayClient, GatewayError, PairingMachine, PairingState};
use tracing::warn;

// ── CLI ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "clawlink",
    version,
    about = "Talk to an OpenClaw-compatible gateway, with an offline chat history cache"
)]
struct Cli {
    /// Config file (defaults to ~/.clawlink/config.toml)
    #[arg(long, global = true, value_name = "PATH", env = "CLAWLINK_CONFIG")]
    config: Option<PathBuf>,
    /// Server id from the config (defaults to the first one)
    #[arg(long, global = true, value_name = "ID")]
    server: Option<String>,
    /// More logging (-v debug, -vv trace)
    #[arg(long, short, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Send a message and stream the reply
    Send {
        session: String,
        message: String,
    },
    /// Show a session's history (served from cache when offline)
    History {
        session: String,
        #[arg(long, short = 'n')]
        limit: Option<usize>,
        /// Output JSON
        #[arg(long)]
        json: bool,
    },
    /// List known sessions
    Sessions {
        /// Output JSON
        #[arg(long)]
        json: bool,
    },
    /// Clear a session on the gateway and in the local cache
    Reset { session: String },
    /// Request pairing and wait for an operator to approve this device
    Pair {
        /// Name shown to the approving operator
        #[arg(long)]
        name: Option<String>,
        /// Give up after this many seconds
        #[arg(long, value_name = "SECS", default_value_t = 600)]
        timeout: u64,
    },
    /// Connect, report the negotiated protocol and check the auth token
    Status,
}

// ── Wiring ──────────────────────────────────────────────────────────────────

struct Context {
    config: Config,
    config_path: PathBuf,
    server: ServerConfig,
}

impl Context {
    fn load(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
        let mut config = Config::load(Some(config_path.as_path()))?;
        if config.ensure_device_id() {
            config
                .save(Some(config_path.as_path()))
                .context("Failed to persist generated device id")?;
        }
        let server = config.server(cli.server.as_deref())?.clone();
        Ok(Self {
            config,
            config_path,
            server,
        })
    }

    fn client(&self) -> GatewayClient {
        GatewayClient::new(self.config.client_options(&self.server))
    }

    fn chat(&self, client: GatewayClient) -> Result<CachedChatProvider<GatewayChatProvider>> {
        let store = FileStore::open(self.config.cache_dir())?;
        let backend = GatewayChatProvider::new(client, self.server.capabilities());
        Ok(
            CachedChatProvider::new(backend, Arc::new(store), Some(&self.server.id))
                .with_max_messages(self.config.cache.max_messages),
        )
    }

    fn save_token(&mut self, token: &str) -> Result<()> {
        let Some(server) = self.config.server_mut(&self.server.id) else {
            bail!("Server '{}' disappeared from config", self.server.id);
        };
        server.token = Some(token.to_string());
        self.config.save(Some(self.config_path.as_path()))
    }
}

/// Connect, but keep going offline: the cache still answers reads.
async fn connect_or_warn(client: &GatewayClient) {
    if let Err(err) = client.connect().await {
        warn!(error = %err, "gateway unavailable, using local cache");
    }
}

fn format_time(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

// ── Commands ────────────────────────────────────────────────────────────────

async fn send(ctx: &Context, session: String, message: String) -> Result<()> {
    let client = ctx.client();
    client.connect().await.context("Failed to connect to gateway")?;
    let chat = ctx.chat(client.clone())?;

    let on_event = |event: &ChatEvent| match event {
        ChatEvent::Delta { text } => {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
        ChatEvent::Snapshot { text } => {
            // The reply was rewritten; start it again on a fresh line.
            print!("\n{text}");
            let _ = std::io::stdout().flush();
        }
        ChatEvent::Tool { name, phase } => {
            eprintln!("[tool {name} {}]", phase.as_deref().unwrap_or(""));
        }
        ChatEvent::Error { message } => eprintln!("error: {message}"),
        ChatEvent::Done => println!(),
        ChatEvent::Started { .. } => {}
    };
    let result = chat
        .send_message(SendParams::new(session, message), &on_event)
        .await;
    client.disconnect();
    result
}

async fn history(ctx: &Context, session: &str, limit: Option<usize>, json: bool) -> Result<()> {
    let client = ctx.client();
    connect_or_warn(&client).await;
    let messages = ctx.chat(client.clone())?.get_chat_history(session, limit).await?;
    client.disconnect();

    if json {
        println!("{}", serde_json::to_string_pretty(&messages)?);
        return Ok(());
    }
    if messages.is_empty() {
        println!("(no messages)");
    }
    for message in &messages {
        let role = serde_json::to_value(message.role)?;
        println!(
            "[{}] {}: {}",
            format_time(message.timestamp),
            role.as_str().unwrap_or("?"),
            message.text()
        );
    }
    Ok(())
}

async fn sessions(ctx: &Context, json: bool) -> Result<()> {
    let client = ctx.client();
    connect_or_warn(&client).await;
    let chat = ctx.chat(client.clone())?;
    let sessions = if client.is_connected() {
        chat.list_sessions().await
    } else {
        chat.local_sessions()
    };
    client.disconnect();
    let sessions = sessions?;

    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }
    for session in &sessions {
        println!(
            "{:<24} {:>6} msgs  {}{}",
            session.key,
            session
                .message_count
                .map(|n| n.to_string())
                .unwrap_or_else(|| "?".to_string()),
            session.last_activity.map(format_time).unwrap_or_default(),
            session
                .label
                .as_deref()
                .map(|label| format!("  ({label})"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn reset(ctx: &Context, session: &str) -> Result<()> {
    let client = ctx.client();
    connect_or_warn(&client).await;
    let result = ctx.chat(client.clone())?.reset_session(session).await;
    client.disconnect();
    result?;
    println!("Session '{session}' cleared");
    Ok(())
}

async fn pair(ctx: &mut Context, name: Option<String>, timeout: u64) -> Result<()> {
    let client = ctx.client();
    let node_id = ctx.config.device.id.clone().unwrap_or_default();
    let name = name.unwrap_or_else(|| ctx.config.device.name.clone());
    let pairing = PairingMachine::new(client.clone(), node_id);

    let request = pairing.request_pairing(&name).await?;
    println!(
        "Pairing requested for '{name}' (request {}). Approve it on the gateway.",
        request.request_id.as_deref().unwrap_or("?")
    );
    if let Some(code) = &request.code {
        println!("Code: {code}");
    }

    let decision = pairing.wait_for_outcome();
    let outcome = match tokio::time::timeout(Duration::from_secs(timeout), decision).await {
        Ok(state) => state,
        Err(_) => {
            pairing.cancel();
            bail!("No decision within {timeout}s; pairing cancelled");
        }
    };
    client.disconnect();

    match outcome {
        PairingState::Paired { token } => {
            ctx.save_token(&token)?;
            println!("Paired. Token saved to {}", ctx.config_path.display());
            Ok(())
        }
        PairingState::Error { message } => bail!("Pairing failed: {message}"),
        other => bail!("Pairing ended in state {}", other.as_str()),
    }
}

async fn status(ctx: &Context) -> Result<()> {
    let client = ctx.client();
    println!("Server:  {} ({})", ctx.server.id, ctx.server.url);
    match client.connect().await {
        Ok(hello) => {
            println!("State:   {}", client.state());
            println!("Gateway: {} (protocol {})", hello.gateway.version, hello.protocol);
            if !hello.gateway.capabilities.is_empty() {
                println!("Caps:    {}", hello.gateway.capabilities.join(", "));
            }
            let node_id = ctx.config.device.id.clone().unwrap_or_default();
            let pairing = PairingMachine::new(client.clone(), node_id);
            match pairing.verify().await {
                Ok(true) => println!("Token:   valid"),
                Ok(false) => println!("Token:   missing or invalid"),
                Err(err) => println!("Token:   not checked ({err})"),
            }
        }
        Err(GatewayError::PairingRequired) => {
            println!("State:   {}", client.state());
            println!("This device is not paired yet; run `clawlink pair`.");
        }
        Err(err) => {
            println!("State:   {}", client.state());
            println!("Error:   {err}");
        }
    }
    client.disconnect();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(LogConfig::from_env().with_verbosity(cli.verbose));
    // wss:// endpoints need a process-wide rustls provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut ctx = Context::load(&cli)?;
    match cli.command {
        Commands::Send { session, message } => send(&ctx, session, message).await,
        Commands::History {
            session,
            limit,
            json,
        } => history(&ctx, &session, limit, json).await,
        Commands::Sessions { json } => sessions(&ctx, json).await,
        Commands::Reset { session } => reset(&ctx, &session).await,
        Commands::Pair { name, timeout } => pair(&mut ctx, name, timeout).await,
        Commands::Status => status(&ctx).await,
    }
}
