use anyhow::Result;
use clap::{Parser, Subcommand};
use cisync_core::Domain;
use cisync_sync::{service_from_config, SyncConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "cisync")]
#[command(about = "Sync Culture Index surveys into BambooHR applicants and employees")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation, over both domains unless one is given.
    Sync {
        #[arg(long)]
        domain: Option<Domain>,
    },
    /// Show the writes a sync would make, without making them.
    Plan {
        #[arg(long)]
        domain: Domain,
    },
    /// Serve the trigger endpoints (and the scheduler when enabled).
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { domain: None }) {
        Commands::Sync { domain } => {
            let outcome = cisync_sync::run_sync_once_from_env(domain).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.aborted.is_empty() {
                anyhow::bail!("{} domain(s) aborted", outcome.aborted.len());
            }
        }
        Commands::Plan { domain } => {
            let config = SyncConfig::from_env()?;
            let plan = service_from_config(&config)?.plan_domain(domain).await?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        Commands::Serve => cisync_web::serve_from_env().await?,
    }

    Ok(())
}
