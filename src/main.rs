use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use modelstream::config::Settings;
use modelstream::distribution::{Client, PullOptions};
use modelstream::memory::NoopMemoryEstimator;
use modelstream::progress::ProgressSink;
use modelstream::registry::auth::AnonymousCredentials;
use modelstream::registry::RegistryClient;
use modelstream::server::{AppState, ModelServer};
use modelstream::store::LocalStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "modelstream", about = "Local model distribution and serving runtime", version)]
struct Cli {
    /// Root directory of the model store.
    #[arg(long, global = true)]
    store_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API server.
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Pull a model from the registry.
    Pull { reference: String },
    /// List local models.
    List,
    /// Remove a model.
    Rm {
        reference: String,
        #[arg(long)]
        force: bool,
    },
    /// Apply an additional tag to a model.
    Tag { source: String, target: String },
    /// Remove all models, tags, and blobs.
    Purge,
    /// Remove stale incomplete downloads.
    Cleanup {
        /// Maximum age in hours before an incomplete download is stale.
        #[arg(long, default_value_t = 24)]
        max_age_hours: u64,
    },
}

async fn build_client(settings: &Settings) -> Result<Arc<Client>> {
    let store = Arc::new(
        LocalStore::open(&settings.store_root)
            .await
            .with_context(|| format!("open store at {}", settings.store_root.display()))?,
    );
    let registry = Arc::new(RegistryClient::new(
        settings.registry.clone(),
        Arc::new(AnonymousCredentials),
    )?);
    Ok(Arc::new(Client::new(
        store,
        registry,
        settings.registry.clone(),
        settings.max_concurrent_pulls,
        Arc::new(NoopMemoryEstimator),
    )))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::from_env()?;
    if let Some(store_root) = cli.store_root {
        settings.store_root = store_root;
    }

    match cli.command {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                settings.host = host;
            }
            if let Some(port) = port {
                settings.port = port;
            }
            let client = build_client(&settings).await?;
            let state = AppState {
                client,
                settings: Arc::new(settings.clone()),
            };
            let listener =
                tokio::net::TcpListener::bind((settings.host.as_str(), settings.port)).await?;
            ModelServer::new(state).serve(listener).await?;
        }
        Command::Pull { reference } => {
            let client = build_client(&settings).await?;
            let canonical = client
                .pull(&reference, ProgressSink::discard(), PullOptions::default())
                .await?;
            println!("Pulled {canonical}");
        }
        Command::List => {
            let client = build_client(&settings).await?;
            for model in client.list_models().await? {
                for tag in &model.tags {
                    println!(
                        "{}\t{}\t{}",
                        modelstream::reference::display(tag, &settings.registry),
                        &model.id,
                        model.config.architecture,
                    );
                }
            }
        }
        Command::Rm { reference, force } => {
            let client = build_client(&settings).await?;
            let response = client.delete_model(&reference, force).await?;
            for tag in response.untagged {
                println!("Untagged: {tag}");
            }
            if let Some(deleted) = response.deleted {
                println!("Deleted: {deleted}");
            }
        }
        Command::Tag { source, target } => {
            let client = build_client(&settings).await?;
            let applied = client.tag(&source, &target).await?;
            println!("Tagged {applied}");
        }
        Command::Purge => {
            let client = build_client(&settings).await?;
            client.purge().await?;
            println!("Store purged");
        }
        Command::Cleanup { max_age_hours } => {
            let client = build_client(&settings).await?;
            let max_age = Duration::from_secs(max_age_hours * 60 * 60);
            let cleaned = client.store().cleanup_stale(max_age)?;
            println!("Removed {cleaned} stale incomplete download(s)");
        }
    }

    Ok(())
}
