//! flipmeshd: flipmesh peer-to-peer daemon.
//!
//! Usage: flipmeshd [listen_port] [seed_ip:port ...]

use anyhow::{Context, Result};
use tokio::io::BufReader;

use flipmesh_core::config::{parse_seed, FlipmeshConfig};
use flipmeshd::console::{self, ConsoleExit};
use flipmeshd::{Node, NodeConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = FlipmeshConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = FlipmeshConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        FlipmeshConfig::default()
    });

    // Positional args override the file.
    let mut args = std::env::args().skip(1);
    if let Some(port) = args.next() {
        config.network.listen_port = port
            .parse()
            .with_context(|| format!("invalid listen port {port:?}"))?;
    }
    let seeds: Vec<_> = args.map(|arg| parse_seed(&arg)).collect();
    if !seeds.is_empty() {
        config.seeds.peers = seeds;
    }

    tracing::info!(
        listen_port = config.network.listen_port,
        seeds = config.seeds.peers.len(),
        "flipmeshd starting"
    );

    let node = Node::start(NodeConfig::from(&config))
        .await
        .context("failed to start node")?;

    node.on_change(|value| println!("{}", console::describe(value)));
    println!("{}", console::describe(node.state()));
    tracing::info!(
        listen_port = node.listen_port(),
        peers = node.peer_count(),
        "flipmeshd running"
    );

    let mut console_task = {
        let node = node.clone();
        tokio::spawn(async move {
            console::run(&node, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await
        })
    };
    let mut console_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received");
                break;
            }
            _ = node.wait_closed() => break,
            exit = &mut console_task, if console_open => {
                console_open = false;
                match exit {
                    Ok(Ok(ConsoleExit::Quit)) => break,
                    Ok(Ok(ConsoleExit::Eof)) => tracing::debug!("stdin closed, console disabled"),
                    Ok(Err(e)) => tracing::warn!(error = %e, "console failed"),
                    Err(e) => tracing::warn!(error = %e, "console task panicked"),
                }
            }
        }
    }

    node.close().await;
    // A pending stdin read would hold up runtime shutdown.
    std::process::exit(0)
}
