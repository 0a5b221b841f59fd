use std::io::Write as _;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use gatehouse_console_core::config::ConsoleConfig;
use gatehouse_console_core::session::SessionManager;
use gatehouse_console_core::session::auth::StepUpClient;
use gatehouse_console_core::session::connection::{Presentation, SessionConnection};
use gatehouse_console_core::telemetry::logging::{self, LogConfig, LogLevel};
use gatehouse_console_core::tunnel::websocket::WebSocketTunnelFactory;
use gatehouse_console_core::tunnel::{DisplaySize, Protocol};

#[derive(Parser, Debug)]
#[command(name = "gatehouse", about = "Open a remote-access session through the bastion")]
struct Cli {
    /// Asset to connect to.
    asset_id: String,

    #[arg(long, default_value = "ssh")]
    protocol: String,

    /// Bastion API base, e.g. `bastion.example.com` or `localhost:4132`.
    #[arg(long, env = "GATEHOUSE_API_BASE", default_value = "localhost:4132")]
    api_base: String,

    /// Bearer token for the bastion API.
    #[arg(long, env = "GATEHOUSE_API_TOKEN")]
    token: Option<String>,

    /// One-time step-up code, exchanged for a session security token.
    #[arg(long)]
    step_up_code: Option<String>,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    #[arg(long)]
    log_file: Option<std::path::PathBuf>,

    #[arg(long, default_value_t = 1024)]
    width: u32,

    #[arg(long, default_value_t = 768)]
    height: u32,
}

fn parse_protocol(raw: &str) -> Option<Protocol> {
    match raw {
        "ssh" => Some(Protocol::Ssh),
        "rdp" => Some(Protocol::Rdp),
        "vnc" => Some(Protocol::Vnc),
        "telnet" => Some(Protocol::Telnet),
        "kubernetes" | "k8s" => Some(Protocol::Kubernetes),
        "http-terminal" => Some(Protocol::HttpTerminal),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;

    let Some(protocol) = parse_protocol(&cli.protocol) else {
        eprintln!("unknown protocol: {}", cli.protocol);
        std::process::exit(2);
    };

    let config = ConsoleConfig::new(&cli.api_base)?.with_bearer_token(cli.token.clone());
    let manager = SessionManager::new(config.clone())?;
    let factory = Arc::new(WebSocketTunnelFactory::new(config.api_base().clone()));

    let security_token = match cli.step_up_code.as_deref() {
        Some(code) => {
            let step_up = StepUpClient::new(config.clone())?;
            Some(step_up.exchange_code(&cli.asset_id, code).await?)
        }
        None => None,
    };

    let connection = Arc::new(SessionConnection::new(
        &cli.asset_id,
        protocol,
        manager,
        factory,
        DisplaySize {
            width: cli.width,
            height: cli.height,
        },
    ));

    let mut output = connection
        .take_output_events()
        .expect("output stream claimed once at startup");
    let mut snapshots = connection.subscribe();

    connection.connect(security_token.as_ref()).await?;
    info!(target = "console::cli", asset_id = %cli.asset_id, %protocol, "session requested");

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                match snapshot.presentation() {
                    Presentation::Connected => {
                        eprintln!("connected ({})", snapshot.session_id.as_deref().unwrap_or("-"));
                    }
                    Presentation::Error { code, message } => {
                        match code {
                            Some(code) => eprintln!("session error {code}: {message}"),
                            None => eprintln!("session error: {message}"),
                        }
                        break;
                    }
                    Presentation::Loading { client_state, tunnel_state } => {
                        eprintln!("connecting... (client {client_state:?}, tunnel {tunnel_state:?})");
                    }
                }
            }
            bytes = output.recv() => {
                let Some(bytes) = bytes else { break };
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(&bytes)?;
                stdout.flush()?;
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("disconnecting");
                break;
            }
        }
    }

    connection.disconnect().await;
    Ok(())
}
