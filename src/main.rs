//! CLI for subpub
//!
//! Subcommands:
//! - `server`: run the WebSocket service in front of a broker
//! - `subscribe`: connect to a server and print messages for one subject
//! - `publish`: connect to a server and publish one message

use std::path::PathBuf;

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use subpub::broker::{Broker, Message};
use subpub::config::{Settings, load_config, load_config_from};
use subpub::transport::{ClientMessage, ServerMessage, start_websocket_server};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "subpub")]
enum Command {
    /// Start the WebSocket server
    Server {
        /// Config file to load instead of `config/default`
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Subscribe to a subject and print every delivered message
    Subscribe {
        #[arg(long, default_value = "ws://127.0.0.1:8080")]
        url: String,
        #[arg(long)]
        subject: String,
    },
    /// Publish one message to a subject
    Publish {
        #[arg(long, default_value = "ws://127.0.0.1:8080")]
        url: String,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        payload: String,
    },
}

type BoxError = Box<dyn std::error::Error>;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cmd = Command::parse();

    let result = match cmd {
        Command::Server { config } => run_server(config).await,
        Command::Subscribe { url, subject } => {
            subpub::utils::logging::init("info");
            run_subscribe(&url, subject).await
        }
        Command::Publish {
            url,
            subject,
            payload,
        } => {
            subpub::utils::logging::init("info");
            run_publish(&url, subject, payload).await
        }
    };

    if let Err(e) = result {
        // No-op if already initialized; covers config errors before logging is set up.
        subpub::utils::logging::init("info");
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run_server(config: Option<PathBuf>) -> Result<(), BoxError> {
    let settings: Settings = match config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    subpub::utils::logging::init(&settings.log.level);

    let broker: Broker<Message> = Broker::new();
    let addr = settings.server_addr();

    tokio::select! {
        res = start_websocket_server(&addr, broker.clone()) => {
            res?;
            error!("WebSocket server exited unexpectedly.");
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    let timeout = settings.broker.shutdown_timeout();
    match broker.close(timeout).await {
        Ok(()) => info!("server exited"),
        Err(e) => warn!(error = %e, label = e.as_label(), "broker did not drain in time"),
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn run_subscribe(url: &str, subject: String) -> Result<(), BoxError> {
    let (mut ws, _) = connect_async(url).await?;
    let frame = serde_json::to_string(&ClientMessage::Subscribe { subject })?;
    ws.send(WsMessage::text(frame)).await?;

    while let Some(msg) = ws.next().await {
        let msg = msg?;
        if !msg.is_text() {
            continue;
        }
        match serde_json::from_str::<ServerMessage>(msg.to_text()?)? {
            ServerMessage::Message {
                subject,
                payload,
                timestamp,
            } => println!("[{timestamp}] {subject}: {payload}"),
            ServerMessage::Error { code, message } => {
                return Err(format!("server error ({code:?}): {message}").into());
            }
            other => info!("{other:?}"),
        }
    }
    Ok(())
}

async fn run_publish(url: &str, subject: String, payload: String) -> Result<(), BoxError> {
    let (mut ws, _) = connect_async(url).await?;
    let frame = serde_json::to_string(&ClientMessage::Publish { subject, payload })?;
    ws.send(WsMessage::text(frame)).await?;

    if let Some(msg) = ws.next().await {
        match serde_json::from_str::<ServerMessage>(msg?.to_text()?)? {
            ServerMessage::Published { subject } => info!("published to {subject}"),
            ServerMessage::Error { code, message } => {
                return Err(format!("server error ({code:?}): {message}").into());
            }
            other => warn!("unexpected reply: {other:?}"),
        }
    }
    ws.close(None).await?;
    Ok(())
}
