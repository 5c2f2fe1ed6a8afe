//! The DHT peer itself.
//!
//! Every piece of protocol state lives on [`Node`] and is only ever
//! touched from [`Node::run`]'s task: socket readiness, accepted
//! connections, decoded lines and timer firings all funnel into one loop,
//! so no callback ever observes another mid-flight. Due timers fire before
//! I/O is polled again.

use crate::config::Intervals;
use crate::config::NodeConfig;
use crate::id::Id;
use crate::ring::Ring;
use crate::transport;
use crate::transport::ConnEvent;
use crate::transport::ConnHandle;
use crate::transport::ConnId;
use crate::wire::Packet;
use crate::wire::StreamMsg;
use anyhow::Result;
use rand::Rng;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;

mod handlers;
mod timers;

/// Why a pending lookup was started. Client kinds carry the operator
/// connection waiting on the outcome; the kind-specific fields are only
/// reachable after discriminating the tag.
#[derive(Debug, Clone)]
enum Transaction {
    /// Fill finger table slot `index` with whoever owns the target id.
    Finger { index: usize },
    /// Refresh the successor's successor.
    Backup,
    /// Check whether we still own one of our items. Nothing schedules this
    /// lookup: pruning while the ring is still converging can drop an item
    /// from its rightful owner, so only the resolution logic is kept.
    #[allow(dead_code)]
    Prune,
    Get { client: ConnId },
    Put { client: ConnId, payload: Vec<u8> },
    Show { client: ConnId },
}

impl Transaction {
    /// The operator connection this transaction answers to, if any.
    fn client(&self) -> Option<ConnId> {
        match self {
            Transaction::Get { client }
            | Transaction::Put { client, .. }
            | Transaction::Show { client } => Some(*client),
            Transaction::Finger { .. } | Transaction::Backup | Transaction::Prune => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum TimerKind {
    Stabilize,
    FixFinger,
    Backup,
    Ping,
    /// Ends the roll call: close the operator socket and drop the SHOW
    /// transaction.
    ShowExpiry(String),
}

/// One input drawn from the multiplexed sources per loop iteration.
enum Input {
    TimerDue,
    Datagram { data: Vec<u8>, from: SocketAddr },
    Accepted { stream: TcpStream, addr: SocketAddr },
    Conn(ConnEvent),
}

/// A Chord-style DHT peer.
pub struct Node {
    name: String,
    id: Id,
    ring: Ring,
    items: HashMap<Id, Vec<u8>>,
    transactions: HashMap<String, Transaction>,
    next_trans: u64,
    conns: HashMap<ConnId, ConnHandle>,
    next_conn: ConnId,
    listener: TcpListener,
    udp: UdpSocket,
    boot_peer: Option<String>,
    intervals: Intervals,
    /// One-shot timers; periodic behavior comes from handlers scheduling
    /// their own successor.
    timers: BinaryHeap<Reverse<(Instant, TimerKind)>>,
    events_tx: mpsc::UnboundedSender<ConnEvent>,
    events_rx: mpsc::UnboundedReceiver<ConnEvent>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Node {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ring = Ring::new(config.listen_addr.clone());
        Node {
            name: config.listen_addr,
            id: ring.id(),
            ring,
            items: HashMap::new(),
            transactions: HashMap::new(),
            next_trans: 0,
            conns: HashMap::new(),
            next_conn: 0,
            listener: config.listener,
            udp: config.udp,
            boot_peer: config.boot_peer,
            intervals: config.intervals,
            timers: BinaryHeap::new(),
            events_tx,
            events_rx,
        }
    }

    /// Drives the node until its task is cancelled or the ring is
    /// irrecoverably lost (successor and backup both gone).
    pub async fn run(mut self) -> Result<()> {
        tracing::info!(id = %self.id, name = %self.name, "Node starting");
        self.boot().await;

        let mut packet = [0u8; 4096];
        loop {
            self.fire_due_timers().await?;
            let deadline = self.timers.peek().map(|Reverse((at, _))| *at);

            let input = tokio::select! {
                _ = tokio::time::sleep_until(
                    deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600)),
                ), if deadline.is_some() => Input::TimerDue,
                recv = self.udp.recv_from(&mut packet) => match recv {
                    Ok((len, from)) => Input::Datagram { data: packet[..len].to_vec(), from },
                    Err(e) => {
                        tracing::warn!("UDP receive failed: {e}");
                        continue;
                    }
                },
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => Input::Accepted { stream, addr },
                    Err(e) => {
                        tracing::warn!("Accept failed: {e}");
                        continue;
                    }
                },
                event = self.events_rx.recv() => match event {
                    Some(event) => Input::Conn(event),
                    // We hold a sender ourselves, so this cannot run dry.
                    None => continue,
                },
            };

            match input {
                Input::TimerDue => {}
                Input::Datagram { data, from } => self.on_datagram(&data, from).await,
                Input::Accepted { stream, addr } => self.on_accept(stream, addr),
                Input::Conn(ConnEvent::Line { conn, line }) => self.on_line(conn, line).await,
                Input::Conn(ConnEvent::Closed { conn }) => self.on_closed(conn),
            }
        }
    }

    /// Arm the maintenance timers at staggered offsets and either join an
    /// existing ring through the bootstrap peer or start a fresh one.
    async fn boot(&mut self) {
        {
            let mut rng = rand::thread_rng();
            for kind in [
                TimerKind::Stabilize,
                TimerKind::FixFinger,
                TimerKind::Backup,
                TimerKind::Ping,
            ] {
                let delay = Duration::from_millis(rng.gen_range(self.intervals.stagger_ms.clone()));
                self.schedule(delay, kind);
            }
        }

        match self.boot_peer.take() {
            Some(boot_peer) => {
                // Joining is just looking up our own successor through
                // someone who is already in the ring.
                let trans = self.next_trans_id();
                self.transactions.insert(trans.clone(), Transaction::Finger { index: 0 });
                let find = Packet::Find {
                    hash: self.id,
                    origin: self.name.clone(),
                    trans,
                };
                self.send_packet(&boot_peer, find).await;
            }
            None => self.ring.start_singleton(),
        }
    }

    async fn fire_due_timers(&mut self) -> Result<()> {
        loop {
            match self.timers.peek() {
                Some(Reverse((at, _))) if *at <= Instant::now() => {}
                _ => return Ok(()),
            }
            if let Some(Reverse((_, kind))) = self.timers.pop() {
                self.on_timer(kind).await?;
            }
        }
    }

    fn schedule(&mut self, after: Duration, kind: TimerKind) {
        self.timers.push(Reverse((Instant::now() + after, kind)));
    }

    async fn on_datagram(&mut self, data: &[u8], from: SocketAddr) {
        let Ok(line) = std::str::from_utf8(data) else {
            tracing::debug!(%from, "Dropping non-UTF-8 datagram");
            return;
        };
        match Packet::parse(line) {
            Ok(packet) => self.handle_packet(packet).await,
            Err(e) => tracing::debug!(%from, line, "Dropping datagram: {e}"),
        }
    }

    fn on_accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        let conn = self.next_conn;
        self.next_conn += 1;
        tracing::debug!(conn, %addr, "Accepted connection");
        let handle = transport::spawn_accepted(conn, stream, self.events_tx.clone());
        self.conns.insert(conn, handle);
    }

    /// Opens a TCP connection to a peer. Lines queued on the handle flush
    /// once the connect completes.
    fn connect(&mut self, peer: &str) -> ConnHandle {
        let conn = self.next_conn;
        self.next_conn += 1;
        tracing::debug!(conn, %peer, "Connecting");
        let handle = transport::spawn_outbound(conn, peer.to_string(), self.events_tx.clone());
        self.conns.insert(conn, handle.clone());
        handle
    }

    async fn on_line(&mut self, conn: ConnId, line: String) {
        match StreamMsg::parse(&line) {
            Ok(msg) => self.handle_stream(conn, msg).await,
            Err(e) => tracing::debug!(conn, line, "Dropping line: {e}"),
        }
    }

    /// The other end is gone: whatever operator transactions were waiting
    /// on that socket can never be answered.
    fn on_closed(&mut self, conn: ConnId) {
        self.conns.remove(&conn);
        let purged: Vec<String> = self
            .transactions
            .iter()
            .filter(|(_, transaction)| transaction.client() == Some(conn))
            .map(|(trans, _)| trans.clone())
            .collect();
        for trans in purged {
            tracing::debug!(conn, %trans, "Connection gone, purging transaction");
            self.transactions.remove(&trans);
        }
    }

    /// Transaction ids embed the originating node, which keeps them
    /// globally unique without coordination.
    fn next_trans_id(&mut self) -> String {
        let trans = format!("{}-{}", self.name, self.next_trans);
        self.next_trans += 1;
        trans
    }

    async fn send_packet(&self, to: &str, packet: Packet) {
        if let Err(e) = self.udp.send_to(packet.encode().as_bytes(), to).await {
            tracing::debug!(%to, "UDP send failed: {e}");
        }
    }

    /// Sending to a peer we do not have is a no-op, not an error; the
    /// periodic timers will fill the slot back in.
    async fn send_packet_opt(&self, to: Option<&str>, packet: Packet) {
        if let Some(to) = to {
            self.send_packet(to, packet).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_transactions_know_their_connection() {
        assert_eq!(Transaction::Get { client: 3 }.client(), Some(3));
        assert_eq!(
            Transaction::Put { client: 9, payload: b"x".to_vec() }.client(),
            Some(9)
        );
        assert_eq!(Transaction::Show { client: 1 }.client(), Some(1));
        assert_eq!(Transaction::Finger { index: 0 }.client(), None);
        assert_eq!(Transaction::Backup.client(), None);
    }
}
