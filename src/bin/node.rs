//! Node binary

use chronodb::{Config, Node};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "chronodb-node")]
#[command(about = "chronodb time-series database node")]
#[command(version)]
struct Cli {
    /// Config file (defaults to $CHRONODB_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node
    Serve {
        /// Data directory
        #[arg(long)]
        data: Option<PathBuf>,

        /// Bind address for the consensus transport
        #[arg(long)]
        raft: Option<SocketAddr>,

        /// Bind address for the shard RPC
        #[arg(long)]
        rpc: Option<SocketAddr>,

        /// Bind address for the status API
        #[arg(long)]
        status: Option<SocketAddr>,

        /// Advertised consensus address (e.g. http://10.0.0.5:8090)
        #[arg(long)]
        raft_advertise: Option<String>,

        /// Advertised shard RPC address
        #[arg(long)]
        rpc_advertise: Option<String>,

        /// Consensus addresses of existing members (comma-separated)
        #[arg(long, value_delimiter = ',')]
        seeds: Vec<String>,

        /// Join as a non-voting member
        #[arg(long)]
        non_voter: bool,

        /// Owners per shard
        #[arg(long)]
        replicas: Option<usize>,
    },

    /// Print the effective configuration and exit
    Config,
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| level.to_string().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve {
            data,
            raft,
            rpc,
            status,
            raft_advertise,
            rpc_advertise,
            seeds,
            non_voter,
            replicas,
        } => {
            // CLI flags win over file and environment
            if let Some(data) = data {
                config.data_dir = data;
            }
            if let Some(raft) = raft {
                config.raft_bind = raft;
            }
            if let Some(rpc) = rpc {
                config.rpc_bind = rpc;
            }
            if status.is_some() {
                config.status_bind = status;
            }
            if raft_advertise.is_some() {
                config.raft_advertise = raft_advertise;
            }
            if rpc_advertise.is_some() {
                config.rpc_advertise = rpc_advertise;
            }
            if !seeds.is_empty() {
                config.seed_servers = seeds;
            }
            if non_voter {
                config.leader_eligible = false;
            }
            if let Some(replicas) = replicas {
                config.replication_factor = replicas;
            }

            init_tracing(&config.log_level);
            tracing::info!("chronodb {}", chronodb::BUILD_INFO);

            let node = Node::new(config)?;
            let started = tokio::select! {
                result = node.listen_and_serve() => result,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupted during startup");
                    Err(chronodb::Error::ShuttingDown)
                }
            };
            if let Err(e) = started {
                tracing::error!("Startup failed: {}", e);
                node.stop().await?;
                return Err(e.into());
            }

            tokio::signal::ctrl_c().await?;
            tracing::info!("Shutdown requested");
            node.stop().await?;
        }

        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
