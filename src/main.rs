use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tasksync::cascade::ENTITY_CHANGE_EVENT;
use tasksync::transport::{SessionTicketSource, StaticToken, TokenSource, WsConnector};
use tasksync::{ConfigError, ConnectionStatus, EntityKind, NotificationPreferences, SyncContext, TransportError};
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("missing credentials; pass --session-token or --ws-ticket")]
    MissingCredentials,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("link went down for good after {0} retries")]
    Offline(u32),
}

#[derive(Parser, Debug)]
#[command(name = "tasksync", about = "Realtime sync watcher for the task server")]
struct Cli {
    /// Overrides `TASKSYNC_BASE_URL` from the environment.
    #[arg(long)]
    base_url: Option<String>,

    #[arg(long, env = "TASKSYNC_SESSION_TOKEN")]
    session_token: Option<String>,

    /// Pre-issued one-time websocket ticket; skips the ticket exchange.
    #[arg(long, env = "TASKSYNC_WS_TICKET")]
    ws_ticket: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Join channels and log everything that arrives until Ctrl-C.
    Watch(WatchCommand),
}

#[derive(Args, Debug)]
struct WatchCommand {
    /// Channel to join, e.g. `project:7`. Repeatable.
    #[arg(long = "channel")]
    channels: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = tasksync::SyncConfig::from_env()?;
    if let Some(base_url) = cli.base_url {
        config.base_url = base_url.trim_end_matches('/').to_owned();
    }

    let tokens: Arc<dyn TokenSource> = match (cli.ws_ticket, cli.session_token) {
        (Some(ticket), _) => Arc::new(StaticToken::new(ticket)),
        (None, Some(session)) => Arc::new(SessionTicketSource::new(config.base_url.clone(), session)),
        (None, None) => return Err(CliError::MissingCredentials),
    };

    match cli.command {
        Command::Watch(watch_cmd) => run_watch(config, tokens, watch_cmd).await,
    }
}

async fn run_watch(
    config: tasksync::SyncConfig,
    tokens: Arc<dyn TokenSource>,
    cmd: WatchCommand,
) -> Result<(), CliError> {
    let connector = Arc::new(WsConnector::new(config.base_url.clone()));
    let (_prefs_tx, prefs_rx) = watch::channel(NotificationPreferences::default());
    let ctx = SyncContext::new(config, connector, tokens, prefs_rx);

    let event_types = EntityKind::ALL
        .iter()
        .flat_map(|kind| ["create", "update", "delete"].map(|op| format!("{kind}:{op}")))
        .chain(std::iter::once(ENTITY_CHANGE_EVENT.to_owned()));
    let _loggers: Vec<_> = event_types
        .map(|event_type| {
            ctx.bus().subscribe(event_type, |event| {
                info!(
                    event_type = %event.event_type,
                    channel = event.channel.as_deref().unwrap_or("-"),
                    payload = %event.payload,
                    "watch: event"
                );
            })
        })
        .collect();
    let _channels: Vec<_> = cmd.channels.iter().map(|c| ctx.channels().join_scoped(c)).collect();

    let mut status = ctx.status();
    ctx.start().await?;

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("watch: interrupted");
                break Ok(());
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let state = *status.borrow_and_update();
                info!(status = ?state.status, retry = state.retry_count, generation = state.generation, "watch: connection");
                if state.status == ConnectionStatus::Offline {
                    break Err(CliError::Offline(state.retry_count));
                }
            }
        }
    };

    ctx.shutdown().await;
    outcome
}
