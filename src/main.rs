mod bot;
mod chat;
mod command;
mod config;
mod credentials;
mod message;
mod overlay;
mod storage;
mod supervisor;
mod vote;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bot::Bot;
use chat::IrcConnector;
use config::Config;
use credentials::TokenClient;
use overlay::OverlayServer;
use storage::SqliteStore;
use supervisor::CredentialSupervisor;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    let cfg = Config::build("settings.toml")?;
    let commands = command::load_commands("commands.yaml")?;
    let store = Arc::new(
        SqliteStore::open(&cfg.storage.database_path).context("opening the credential store")?,
    );

    let overlay = OverlayServer::new();
    overlay.start(cfg.overlay.port).await?;

    let tokens = TokenClient::new(&cfg.twitch.client_id, &cfg.twitch.client_secret);
    let connector_for = |account: &str| IrcConnector {
        host: cfg.twitch.irc_host.clone(),
        port: cfg.twitch.irc_port,
        account: account.to_string(),
        channel: cfg.twitch.channel.clone(),
        tokens: tokens.clone(),
    };

    // The bot role carries the chat session; without it there is nothing to run.
    let session = {
        let supervisor =
            CredentialSupervisor::initialize("bot", &cfg.twitch.bot_seed, Arc::clone(&store))?;
        supervisor.connect(&connector_for(&cfg.twitch.account)).await?
    };

    // The streamer role only voices the triggered announcement; losing it is
    // logged and the bot keeps going without it.
    let announcer =
        match CredentialSupervisor::initialize("streamer", &cfg.twitch.streamer_seed, Arc::clone(&store)) {
            Ok(supervisor) => match supervisor.connect(&connector_for(&cfg.twitch.channel)).await {
                Ok(session) => Some(session),
                Err(e) => {
                    tracing::warn!("streamer session unavailable, announcing as the bot: {e}");
                    None
                }
            },
            Err(e) => {
                tracing::warn!("streamer role skipped: {e}");
                None
            }
        };

    let mut bot = Bot::new(session, announcer, commands, overlay);
    tracing::info!(channel = %cfg.twitch.channel, "mutiny-bot running");
    bot.run().await;

    Ok(())
}

fn init_tracing() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).compact())
        .try_init()?;
    Ok(())
}
