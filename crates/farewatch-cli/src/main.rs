use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use farewatch_adapters::{ReplayProvider, SearchProvider, SerpApiProvider};
use farewatch_alerts::{AlertJob, AlertScheduler, AppConfig};
use farewatch_bot::{CommandHandler, DealRegions, DiscordSink, GatewayListener};
use farewatch_core::notify::ConsoleSink;
use farewatch_core::{NotificationSink, Recipient};
use farewatch_storage::{FareStore, MemoryStore, PostgrestStore};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "farewatch")]
#[command(about = "Flight price alerts for Discord")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Listen for chat commands and run the alert job on its interval.
    Serve,
    /// Run one alert reconciliation pass and print its summary.
    RunAlerts {
        /// Serve provider answers from a recorded response file.
        #[arg(long)]
        replay: Option<PathBuf>,
        /// Print alerts instead of posting them to Discord.
        #[arg(long)]
        console: bool,
    },
    /// Run a single chat command locally and print the reply.
    Exec {
        #[arg(long)]
        user: String,
        #[arg(long)]
        replay: Option<PathBuf>,
        /// Use an in-memory store instead of the hosted tables.
        #[arg(long)]
        offline: bool,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        text: Vec<String>,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_regions(path: Option<&Path>) -> Result<DealRegions> {
    match path {
        Some(path) => DealRegions::load(path),
        None => Ok(DealRegions::default()),
    }
}

fn provider(config: &AppConfig, replay: Option<&Path>) -> Result<Arc<dyn SearchProvider>> {
    Ok(match replay {
        Some(path) => Arc::new(ReplayProvider::from_file(path)?),
        None => Arc::new(SerpApiProvider::new(
            config.serpapi_api_key.clone(),
            &config.provider_http_config(),
        )?),
    })
}

fn store(config: &AppConfig) -> Result<Arc<dyn FareStore>> {
    Ok(Arc::new(PostgrestStore::new(&config.store, &config.http_client_config())?))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve().await,
        Commands::RunAlerts { replay, console } => {
            let config = AppConfig::from_env().context("loading configuration")?;
            let sink: Arc<dyn NotificationSink> = if console {
                Arc::new(ConsoleSink)
            } else {
                Arc::new(DiscordSink::new(
                    config.discord_token.clone(),
                    config.broadcast_channel_id,
                    &config.http_client_config(),
                )?)
            };
            let job = AlertJob::new(
                store(&config)?,
                provider(&config, replay.as_deref())?,
                sink,
                config.provider_timeout,
            );
            let summary = job.run_once().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Commands::Exec {
            user,
            replay,
            offline,
            text,
        } => {
            let line = text.join(" ");
            let handler = if offline {
                let provider: Arc<dyn SearchProvider> = match replay {
                    Some(path) => Arc::new(ReplayProvider::from_file(path)?),
                    None => Arc::new(ReplayProvider::new()),
                };
                CommandHandler::new(Arc::new(MemoryStore::new()), provider, DealRegions::default())
            } else {
                let config = AppConfig::from_env().context("loading configuration")?;
                CommandHandler::new(
                    store(&config)?,
                    provider(&config, replay.as_deref())?,
                    load_regions(config.deal_regions_file.as_deref())?,
                )
                .with_prefix(config.command_prefix.clone())
            };
            match handler.handle_line(&user, &line).await {
                Some(reply) => {
                    ConsoleSink
                        .deliver(&Recipient::DirectMessage(user), &reply)
                        .await?
                }
                None => eprintln!(
                    "`{line}` is not a command; commands start with `{}`",
                    handler.prefix()
                ),
            }
            Ok(())
        }
    }
}

async fn serve() -> Result<()> {
    let config = AppConfig::from_env().context("loading configuration")?;
    let store = store(&config)?;
    let provider = provider(&config, None)?;
    let sink: Arc<dyn NotificationSink> = Arc::new(DiscordSink::new(
        config.discord_token.clone(),
        config.broadcast_channel_id,
        &config.http_client_config(),
    )?);

    let job = AlertJob::new(store.clone(), provider.clone(), sink.clone(), config.provider_timeout);
    let scheduler =
        AlertScheduler::start(job, config.alert_interval, config.alerts_run_on_startup).await?;

    let regions = load_regions(config.deal_regions_file.as_deref())?;
    let handler =
        CommandHandler::new(store, provider, regions).with_prefix(config.command_prefix.clone());
    let listener = GatewayListener::new(config.discord_token.clone(), Arc::new(handler), sink);

    info!(channel_id = config.broadcast_channel_id, "farewatch serving");
    let outcome = tokio::select! {
        result = listener.run() => result,
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for ctrl-c")?;
            info!("shutdown requested");
            Ok(())
        }
    };
    scheduler.shutdown().await?;
    outcome
}
