use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use collector_sync::{
    bootstrap, maybe_build_scheduler, run_ingestion_once_from_env, sources_path_from_env,
    SourceRegistry, SyncConfig,
};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "collector-cli")]
#[command(about = "Headline and paper collector")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass for every enabled source, or just one.
    Sync {
        #[arg(long)]
        source: Option<String>,
    },
    /// Create collection tables.
    Migrate,
    /// Run the scheduler and the HTTP API until ctrl-c.
    Serve,
    /// List configured sources.
    Sources,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { source: None }) {
        Commands::Sync { source } => {
            let results = run_ingestion_once_from_env(source.as_deref()).await?;
            for result in &results {
                println!("run_id={} {}", result.run_id, result.summary_message());
            }
        }
        Commands::Migrate => {
            let ctx = bootstrap(SyncConfig::from_env()?).await?;
            let collections = ctx.migrate().await?;
            println!("migrated collections: {}", collections.join(", "));
        }
        Commands::Serve => {
            let config = SyncConfig::from_env()?;
            let port = config.web_port;
            let ctx = Arc::new(bootstrap(config).await?);
            let mut scheduler = maybe_build_scheduler(Arc::clone(&ctx)).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!("scheduler started");
            }

            collector_web::serve(Arc::clone(&ctx), port).await?;

            if let Some(sched) = scheduler.as_mut() {
                sched.shutdown().await.context("stopping scheduler")?;
                info!("scheduler stopped");
            }
        }
        Commands::Sources => {
            let registry = SourceRegistry::load(sources_path_from_env())?;
            for source in &registry.sources {
                println!(
                    "{}\t{}\tenabled={}\tcollection={}\tevery {}m\t{}",
                    source.source_id,
                    source.kind.as_str(),
                    source.enabled,
                    source.collection,
                    source.interval_minutes,
                    source.display_name
                );
            }
        }
    }

    Ok(())
}
