use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;

use canopy_core::{
    FileInfo, Leaf, LeafConfig, LeafHandle, PeerAddr, SuperPeerConfig, SuperPeerHandle, Topology,
    DEFAULT_TTL,
};

#[derive(Parser)]
#[command(name = "canopy")]
#[command(about = "Super-peer file-sharing overlay with replica coherence")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a leaf peer with an interactive shell.
    Leaf {
        /// Address other nodes reach this leaf at, e.g. 127.0.0.1:6001
        #[arg(long, value_name = "HOST:PORT")]
        bind: String,
        /// Root directory holding owned/ and downloads/
        #[arg(long, value_name = "DIR")]
        dir: PathBuf,
        /// Topology config file shared by the whole overlay
        #[arg(long, value_name = "FILE")]
        config: PathBuf,
        /// Hop budget for flooded messages
        #[arg(long, default_value_t = DEFAULT_TTL)]
        ttl: u32,
    },
    /// Run a super-peer.
    Super {
        /// Address other nodes reach this super-peer at, e.g. 127.0.0.1:5000
        #[arg(long, value_name = "HOST:PORT")]
        bind: String,
        /// Topology config file shared by the whole overlay
        #[arg(long, value_name = "FILE")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();
    let cli = Cli::parse();

    match cli.command {
        Command::Super { bind, config } => run_super(bind, config).await,
        Command::Leaf {
            bind,
            dir,
            config,
            ttl,
        } => run_leaf(bind, dir, config, ttl).await,
    }
}

async fn run_super(bind: String, config: PathBuf) -> anyhow::Result<()> {
    let addr: PeerAddr = bind.parse()?;
    let topology = Topology::load(&config).await?;

    let handle = SuperPeerHandle::new(SuperPeerConfig {
        neighbors: topology.neighbors_of(&addr),
        leaves: topology.leaves_of(&addr),
        addr,
    });
    let listener = handle.bind().await.context("binding listen socket")?;
    handle.clone().spawn_listener(listener).await?;
    Ok(())
}

async fn run_leaf(bind: String, dir: PathBuf, config: PathBuf, ttl: u32) -> anyhow::Result<()> {
    let addr: PeerAddr = bind.parse()?;
    let topology = Topology::load(&config).await?;
    let super_peer = topology
        .super_peer_of(&addr)
        .with_context(|| format!("config does not attach leaf {addr} to a super-peer"))?;

    // Bind before connecting so the super-peer can reach us immediately.
    let listener = TcpListener::bind((addr.host.as_str(), addr.port))
        .await
        .context("binding listen socket")?;

    let mut leaf_config = LeafConfig::new(addr, super_peer, dir, topology.model);
    leaf_config.ttl = ttl;
    leaf_config.config_path = Some(config);
    let leaf = Leaf::start(leaf_config).await?;

    let mut services = vec![
        leaf.clone().spawn_listener(listener),
        leaf.clone().spawn_watcher(),
    ];
    if leaf.model().is_pull() {
        services.push(leaf.clone().spawn_checker());
    }

    let result = shell(&leaf).await;

    leaf.shutdown();
    for service in services {
        service.abort();
    }
    tracing::info!("leaf {}: quitting", leaf.addr());
    result
}

/// Interactive command loop. Syntax: `<command> <fileName>`, plus the
/// zero-argument `print` and `exit`.
async fn shell(leaf: &LeafHandle) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt();
    while let Some(line) = lines.next_line().await? {
        let mut tokens = line.split_whitespace();
        match (tokens.next(), tokens.next()) {
            (None, _) => {}
            (Some("exit"), _) => return Ok(()),
            (Some("print"), _) => println!("{}", leaf.info().await),
            (Some("register"), Some(name)) => {
                report(leaf.register(FileInfo::owned(name, leaf.addr().clone())).await);
            }
            (Some("deregister"), Some(name)) => report(leaf.deregister(name).await),
            (Some("search"), Some(name)) => report(leaf.query(name).await),
            (Some("refresh"), Some(name)) => report(leaf.refresh(name).await),
            (Some(command), _) => {
                tracing::warn!("unknown command '{command}', expected '<command> <fileName>'");
            }
        }
        prompt();
    }
    Ok(())
}

fn prompt() {
    use std::io::Write;
    print!("(leaf) => ");
    let _ = std::io::stdout().flush();
}

fn report(result: anyhow::Result<()>) {
    if let Err(err) = result {
        tracing::error!("{err:#}");
    }
}
