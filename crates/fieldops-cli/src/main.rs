use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use fieldops_core::Urgency;
use fieldops_storage::PgStore;
use fieldops_web::ServerConfig;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "fieldops-cli")]
#[command(about = "Field operations dispatch core")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the JSON API
    Serve,
    /// Apply database migrations
    Migrate,
    /// Price a service without creating a request
    Quote {
        service_id: Uuid,
        zone_id: Uuid,
        /// RFC 3339 instant to price at; defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
        #[arg(long, default_value = "normal")]
        urgency: Urgency,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = ServerConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => fieldops_web::serve(config).await?,
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required to migrate")?;
            PgStore::connect(url, 1).await?.migrate().await?;
            println!("migrations applied");
        }
        Commands::Quote {
            service_id,
            zone_id,
            at,
            urgency,
        } => {
            let lifecycle = config.lifecycle().await?;
            let breakdown = lifecycle
                .quote(service_id, zone_id, at, Some(urgency))
                .await?;
            println!("{}", serde_json::to_string_pretty(&breakdown)?);
        }
    }

    Ok(())
}
