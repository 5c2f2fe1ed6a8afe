//! Peer agent: holds one control connection to the daemon and runs (or
//! stops) a single DHT node on its say-so. The agent binds the node's
//! sockets itself so it can report the exact port upstream.

use anyhow::bail;
use anyhow::Result;
use chord_node::transport;
use chord_node::transport::ConnEvent;
use chord_node::Intervals;
use chord_node::Node;
use chord_node::NodeConfig;
use clap::Parser;
use rand::Rng;
use tokio::net::TcpListener;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::metadata::LevelFilter;

mod cli;
mod logger;

const BIND_ATTEMPTS: usize = 50;

#[tokio::main]
async fn main() -> Result<()> {
    let opts = cli::Opts::parse();
    logger::init_tracing(LevelFilter::DEBUG, opts.json)?;

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let daemon = transport::spawn_outbound(0, opts.daemon.clone(), events_tx);
    daemon.write_line(format!("HELLO {}", opts.host));
    tracing::info!(daemon = %opts.daemon, host = %opts.host, "Registered with control daemon");

    let mut node: Option<JoinHandle<()>> = None;

    loop {
        match events_rx.recv().await {
            Some(ConnEvent::Line { line, .. }) => {
                let tokens: Vec<&str> = line.split(' ').collect();
                match tokens.as_slice() {
                    ["START", bootstrap] => {
                        if node.is_some() {
                            tracing::warn!("Already running, ignoring START");
                            continue;
                        }
                        let (port, task) = start_node(&opts.host, bootstrap).await?;
                        node = Some(task);
                        daemon.write_line(format!("STARTED {} {port}", opts.host));
                    }
                    ["STOP"] => match node.take() {
                        Some(task) => {
                            // Cancelling the task closes every socket the
                            // node owns and drops its timers with it.
                            task.abort();
                            tracing::info!("Node stopped");
                            daemon.write_line(format!("STOPPED {}", opts.host));
                        }
                        None => tracing::warn!("Not running, ignoring STOP"),
                    },
                    ["KILL"] => bail!("killed by control daemon"),
                    _ => tracing::debug!(line, "Unknown control message"),
                }
            }
            Some(ConnEvent::Closed { .. }) | None => bail!("lost connection to control daemon"),
        }
    }
}

/// Binds a random port for the node (TCP and UDP under the same number)
/// and launches its event loop. A node that loses the ring entirely takes
/// the whole process down, so the daemon sees us drop and can redeliver.
async fn start_node(host: &str, bootstrap: &str) -> Result<(u16, JoinHandle<()>)> {
    for _ in 0..BIND_ATTEMPTS {
        let port: u16 = rand::thread_rng().gen_range(10_000..=65_535);
        let Ok(listener) = TcpListener::bind(("0.0.0.0", port)).await else {
            continue;
        };
        let Ok(udp) = UdpSocket::bind(("0.0.0.0", port)).await else {
            continue;
        };

        let listen_addr = format!("{host}:{port}");
        let boot_peer = (bootstrap != "none").then(|| bootstrap.to_string());
        tracing::info!(%listen_addr, ?boot_peer, "Starting node");
        let node = Node::new(NodeConfig {
            listen_addr,
            listener,
            udp,
            boot_peer,
            intervals: Intervals::default(),
        });
        let task = tokio::spawn(async move {
            if let Err(e) = node.run().await {
                tracing::error!("Node died: {e:#}");
                std::process::exit(1);
            }
        });
        return Ok((port, task));
    }
    bail!("could not bind a port for the node")
}
