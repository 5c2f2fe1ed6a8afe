//! Central control daemon. Peer agents and operator clients share one TCP
//! line protocol: agents report their lifecycle, operators steer it, and
//! every state change is broadcast to all connected operators. Dead peers
//! get redelivered periodically through an external shell script.

use crate::registry::PeerRegistry;
use crate::registry::PeerState;
use anyhow::Context;
use anyhow::Result;
use chord_node::transport;
use chord_node::transport::ConnEvent;
use chord_node::transport::ConnHandle;
use chord_node::transport::ConnId;
use clap::Parser;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::interval_at;
use tokio::time::Instant;
use tracing::metadata::LevelFilter;

mod cli;
mod logger;
mod registry;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const REVIVE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let opts = cli::Opts::parse();
    logger::init_tracing(LevelFilter::DEBUG, opts.json)?;

    let listener = TcpListener::bind(&opts.listen_address)
        .await
        .with_context(|| format!("Failed to bind {}", opts.listen_address))?;
    tracing::info!(addr = %opts.listen_address, peers = opts.peers.len(), "Control daemon up");

    let daemon = Daemon::new(opts.listen_address, opts.deliver_script, opts.peers);
    daemon.run(listener).await
}

struct Daemon {
    listen_address: String,
    deliver_script: PathBuf,
    registry: PeerRegistry,
    /// Operator connections subscribed to state broadcasts.
    clients: HashSet<ConnId>,
    conns: HashMap<ConnId, ConnHandle>,
    next_conn: ConnId,
    events_tx: mpsc::UnboundedSender<ConnEvent>,
    events_rx: mpsc::UnboundedReceiver<ConnEvent>,
}

impl Daemon {
    fn new(listen_address: String, deliver_script: PathBuf, peers: Vec<String>) -> Daemon {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Daemon {
            listen_address,
            deliver_script,
            registry: PeerRegistry::new(peers),
            clients: HashSet::new(),
            conns: HashMap::new(),
            next_conn: 0,
            events_tx,
            events_rx,
        }
    }

    async fn run(mut self, listener: TcpListener) -> Result<()> {
        let mut keepalive = interval_at(Instant::now() + KEEPALIVE_INTERVAL, KEEPALIVE_INTERVAL);
        let mut revive = interval_at(Instant::now() + REVIVE_INTERVAL, REVIVE_INTERVAL);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let conn = self.next_conn;
                        self.next_conn += 1;
                        tracing::debug!(conn, %addr, "Accepted control connection");
                        let handle = transport::spawn_accepted(conn, stream, self.events_tx.clone());
                        self.conns.insert(conn, handle);
                    }
                    Err(e) => tracing::warn!("Accept failed: {e}"),
                },
                event = self.events_rx.recv() => match event {
                    Some(ConnEvent::Line { conn, line }) => self.on_line(conn, line),
                    Some(ConnEvent::Closed { conn }) => self.on_closed(conn),
                    None => continue,
                },
                _ = keepalive.tick() => self.keepalive(),
                _ = revive.tick() => self.revive(),
            }
        }
    }

    fn on_line(&mut self, conn: ConnId, line: String) {
        let tokens: Vec<&str> = line.split(' ').collect();
        match tokens.as_slice() {
            // Peer agent lifecycle reports.
            ["HELLO", host] => {
                if self.registry.hello(host, conn) {
                    tracing::info!(%host, conn, "Peer agent connected");
                    self.broadcast_state(host);
                } else {
                    tracing::warn!(%host, "HELLO from a host outside the fleet");
                }
            }
            ["STARTED", host, port] => match port.parse::<u16>() {
                Ok(port) => {
                    if self.registry.started(host, port) {
                        tracing::info!(%host, port, "Peer started");
                        self.broadcast_state(host);
                    } else {
                        tracing::warn!(%host, "STARTED from a host outside the fleet");
                    }
                }
                Err(_) => tracing::warn!(%host, %port, "STARTED with a bad port"),
            },
            ["STOPPED", host] => {
                if self.registry.stopped(host) {
                    tracing::info!(%host, "Peer stopped");
                    self.broadcast_state(host);
                } else {
                    tracing::warn!(%host, "STOPPED from a host outside the fleet");
                }
            }
            // Operator commands.
            ["CHELLO"] => {
                if let Some(handle) = self.conns.get(&conn) {
                    for line in self.registry.state_lines() {
                        handle.write_line(line);
                    }
                }
                self.clients.insert(conn);
            }
            ["CSTART", host] => self.do_start(host),
            ["CSTOP", host] => self.do_stop(host),
            ["CKILL", host] => self.do_kill(host),
            _ => tracing::debug!(conn, line, "Unknown control message"),
        }
    }

    fn on_closed(&mut self, conn: ConnId) {
        self.conns.remove(&conn);
        self.clients.remove(&conn);
        if let Some(host) = self.registry.disconnected(conn) {
            tracing::info!(%host, "Peer agent disconnected");
            self.broadcast_state(&host);
        }
    }

    /// Start a stopped peer, pointing it at a running node as bootstrap
    /// when there is one.
    fn do_start(&self, host: &str) {
        let Some(entry) = self.registry.get(host) else {
            tracing::warn!(%host, "CSTART for a host outside the fleet");
            return;
        };
        if entry.state != PeerState::Stopped {
            tracing::debug!(%host, state = %entry.state, "CSTART ignored");
            return;
        }
        let bootstrap = self
            .registry
            .started_addrs()
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_else(|| "none".to_string());
        if let Some(handle) = entry.conn.and_then(|conn| self.conns.get(&conn)) {
            tracing::info!(%host, %bootstrap, "Starting peer");
            handle.write_line(format!("START {bootstrap}"));
        }
    }

    fn do_stop(&self, host: &str) {
        let Some(entry) = self.registry.get(host) else {
            tracing::warn!(%host, "CSTOP for a host outside the fleet");
            return;
        };
        if entry.state != PeerState::Started {
            tracing::debug!(%host, state = %entry.state, "CSTOP ignored");
            return;
        }
        if let Some(handle) = entry.conn.and_then(|conn| self.conns.get(&conn)) {
            tracing::info!(%host, "Stopping peer");
            handle.write_line("STOP");
        }
    }

    fn do_kill(&self, host: &str) {
        let Some(entry) = self.registry.get(host) else {
            tracing::warn!(%host, "CKILL for a host outside the fleet");
            return;
        };
        if entry.state == PeerState::Dead {
            return;
        }
        if let Some(handle) = entry.conn.and_then(|conn| self.conns.get(&conn)) {
            tracing::info!(%host, "Killing peer");
            handle.write_line("KILL");
        }
    }

    fn broadcast_state(&self, host: &str) {
        let Some(line) = self.registry.state_line(host) else {
            return;
        };
        for client in &self.clients {
            if let Some(handle) = self.conns.get(client) {
                handle.write_line(line.clone());
            }
        }
    }

    /// An empty line to every connected agent, so half-dead links surface
    /// as write failures instead of lingering forever.
    fn keepalive(&self) {
        for (_, entry) in self.registry.entries() {
            if let Some(handle) = entry.conn.and_then(|conn| self.conns.get(&conn)) {
                handle.write_line("");
            }
        }
    }

    /// Spawn the delivery script for every dead peer. The script is
    /// responsible for getting an agent running on the target host.
    fn revive(&self) {
        for host in self.registry.dead_hosts() {
            tracing::info!(%host, "Delivering peer payload");
            let spawned = tokio::process::Command::new(&self.deliver_script)
                .arg(&host)
                .arg(&self.listen_address)
                .spawn();
            if let Err(e) = spawned {
                tracing::warn!(%host, "Failed to spawn deliver script: {e}");
            }
        }
    }
}
