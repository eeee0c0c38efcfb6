use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use intim_storage::PgStore;
use intim_sync::{SyncConfig, SyncState, TriggerMode};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod logging;

#[derive(Debug, Parser)]
#[command(name = "intim")]
#[command(about = "Legal-notice sync: trigger API, reconciliation loop and one-off runs")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Web endpoints plus the reconciliation loop, until Ctrl-C.
    Serve,
    /// Reconciliation loop only; runs are triggered over HTTP.
    Reconcile,
    /// One synchronous pipeline run for a stored subject.
    Sync {
        #[arg(long)]
        subject: String,
    },
    /// Apply database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    logging::init_tracing(logging::LogFormat::from_env())?;
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(SyncConfig::from_env(), true).await?,
        Commands::Reconcile => {
            let mut config = SyncConfig::from_env();
            config.trigger_mode = TriggerMode::Http;
            serve(config, false).await?;
        }
        Commands::Sync { subject } => {
            let summary = intim_sync::run_subject_once_from_env(&subject).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("running migrations")?;
            info!("migrations applied");
        }
    }

    Ok(())
}

async fn serve(config: SyncConfig, with_web: bool) -> Result<()> {
    let store = Arc::new(
        PgStore::connect(&config.database_url)
            .await
            .context("connecting to database")?,
    );
    let state = SyncState::from_config(&config, store.clone())?;
    let trigger = state.trigger_for(&config)?;
    let reconciler = state.reconciliation_loop(&config, store, trigger)?;

    let cancel = CancellationToken::new();
    let loop_handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { reconciler.run(cancel).await })
    };
    let web_handle = with_web.then(|| {
        let (state, cancel, port) = (state.clone(), cancel.clone(), config.web_port);
        tokio::spawn(async move { intim_web::serve(state, port, cancel).await })
    });

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutdown requested");
    cancel.cancel();

    if let Err(err) = loop_handle.await {
        error!(error = %err, "reconciliation loop task failed");
    }
    if let Some(handle) = web_handle {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(error = %err, "web server failed"),
            Err(err) => error!(error = %err, "web server task failed"),
        }
    }

    if !state.shutdown().await {
        warn!("some pipeline runs were still in flight at exit");
    }
    for (subject_id, reason) in state.dedup().failures() {
        warn!(%subject_id, %reason, "subject was marked after a failed trigger");
    }
    Ok(())
}
