use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use tokio::signal;
use tracing::{debug, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use doracle::api::{self, AppState};
use doracle::client::Client;
use doracle::raft::conn::ConnectionLayer;
use doracle::raft::util::load_or_create_node_name;
use doracle::raft::{Raft, Role};
use doracle::utils::helpers;

#[derive(Parser, Debug)]
#[command(about = "Replicated timestamp oracle")]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run a replica.
    Serve {
        #[arg(short, long)]
        conf_path: PathBuf,
        /// HTTP address of the leader to join, overrides `raft.leader`.
        #[arg(short, long)]
        join: Option<String>,
    },
    /// Fetch numbers from a cluster.
    Ts {
        #[arg(short, long, value_delimiter = ',', required = true)]
        servers: Vec<String>,
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
    },
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().ok();
    let default_filter = filter::filter_fn(|metadata| metadata.target().starts_with("doracle"));

    match env_filter {
        Some(env_filter) => tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
            .init(),
        None => tracing_subscriber::registry()
            .with(default_filter)
            .with(tracing_subscriber::fmt::layer().with_filter(LevelFilter::DEBUG))
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    match Args::parse().command {
        Cmd::Serve { conf_path, join } => serve(conf_path, join).await,
        Cmd::Ts { servers, count } => fetch(servers, count).await,
    }
}

async fn serve(conf_path: PathBuf, join: Option<String>) -> anyhow::Result<()> {
    let mut config = helpers::parse_config(&conf_path)
        .with_context(|| format!("loading {}", conf_path.display()))?;
    if join.is_some() {
        config.raft.leader = join;
    }

    let name = match config.node_name.clone() {
        Some(name) => name,
        None => load_or_create_node_name(&config.raft.persist_path)
            .context("reading node identity")?,
    };

    info!(path = %config.raft.persist_path.display(), name = %name, "initializing raft server");
    let raft = Raft::init(name, config.raft.clone()).context("initializing consensus layer")?;
    ConnectionLayer::init_layer(&config.raft.listener_addr, raft.clone())
        .await
        .context("starting peer rpc listener")?;

    match &config.raft.leader {
        Some(leader) => {
            if raft.role() == Role::Leader && !raft.is_log_empty() {
                bail!("cannot join with an existing log");
            }
            info!(leader = %leader, "attempting to join leader");
            raft.join(leader).await.context("joining leader")?;
        }
        None if raft.is_log_empty() => {
            info!("initializing new cluster");
            raft.bootstrap().await.context("bootstrapping cluster")?;
        }
        None => info!("recovered from log"),
    }

    debug!("initializing node daemon");
    tokio::spawn(raft.clone().node_daemon());

    let state = Arc::new(AppState::new(raft));
    api::start_server(config.http_addr, state, async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Unable to listen for shutdown: {:?}", e);
        }
    })
    .await
    .context("serving http")?;

    info!("shut down");
    Ok(())
}

async fn fetch(servers: Vec<String>, count: usize) -> anyhow::Result<()> {
    let client = Client::new(servers)?;
    let results = join_all((0..count).map(|_| client.ts())).await;
    for result in results {
        println!("{}", result?);
    }
    client.close();
    Ok(())
}
