//! scene-link server binary.
//!
//! Serves a scene snapshot file over request/reply and runs the sync relay.

use clap::{Parser, Subcommand};
use scene_link::{init_debug_mode, load_snapshot, log_snapshot, LinkConfig, Relay, ResponderServer, SceneResponder};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(name = "scene-link")]
#[command(author, version, about = "Scene distribution and sync relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Host address to bind to
    #[arg(short = 'H', long, global = true)]
    host: Option<String>,

    /// Base port; the relay uses the next two ports
    #[arg(short = 'p', long, global = true)]
    base_port: Option<u16>,

    /// Client id stamped on relay-originated messages
    #[arg(long, global = true)]
    relay_id: Option<u8>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scene responder and the sync relay
    Serve {
        /// Scene snapshot file (.json, .msgpack or .bin)
        #[arg(short, long)]
        scene: PathBuf,
    },

    /// Run only the sync relay
    Relay,

    /// Run only the scene responder
    Distribute {
        /// Scene snapshot file (.json, .msgpack or .bin)
        #[arg(short, long)]
        scene: PathBuf,
    },
}

impl Cli {
    fn link_config(&self) -> scene_link::Result<LinkConfig> {
        let mut config = match &self.config {
            Some(path) => LinkConfig::from_json_file(path)?,
            None => LinkConfig::default(),
        };
        if let Some(host) = &self.host {
            config = config.with_bind_host(host.clone());
        }
        if let Some(port) = self.base_port {
            config = config.with_base_port(port);
        }
        if let Some(relay_id) = self.relay_id {
            config = config.with_relay_id(relay_id);
        }
        config.validate()?;
        Ok(config)
    }
}

fn responder_server(scene: &Path) -> scene_link::Result<ResponderServer> {
    let snapshot = load_snapshot(scene)?;
    log_snapshot("served", &snapshot);
    Ok(ResponderServer::new(SceneResponder::new(snapshot)))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("scene_link=info".parse()?),
        )
        .init();
    init_debug_mode();

    let cli = Cli::parse();
    let config = cli.link_config()?;

    match &cli.command {
        Commands::Serve { scene } => {
            let server = responder_server(scene)?;
            let responder_listener = TcpListener::bind(config.responder_addr()?).await?;
            let ingest = TcpListener::bind(config.ingest_addr()?).await?;
            let publish = TcpListener::bind(config.publish_addr()?).await?;
            let relay = Arc::new(Relay::new(config));

            tokio::select! {
                result = server.serve(responder_listener) => result?,
                result = relay.serve(ingest, publish) => result?,
                _ = shutdown_signal() => tracing::info!("Shutdown signal received"),
            }
        }
        Commands::Relay => {
            let ingest = TcpListener::bind(config.ingest_addr()?).await?;
            let publish = TcpListener::bind(config.publish_addr()?).await?;
            Arc::new(Relay::new(config))
                .run_until(ingest, publish, shutdown_signal())
                .await?;
        }
        Commands::Distribute { scene } => {
            let server = responder_server(scene)?;
            let listener = TcpListener::bind(config.responder_addr()?).await?;
            server.run_until(listener, shutdown_signal()).await?;
        }
    }

    Ok(())
}
