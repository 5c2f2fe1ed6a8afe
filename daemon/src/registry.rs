//! The fleet registry: which peer is reachable, stopped or running, and on
//! which control connection. Pure state; the daemon loop does the I/O.

use chord_node::transport::ConnId;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// No control connection; a candidate for redelivery.
    Dead,
    /// Agent connected, node not running.
    Stopped,
    /// Node running and listening on `port`.
    Started,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerState::Dead => "DEAD",
            PeerState::Stopped => "STOPPED",
            PeerState::Started => "STARTED",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct PeerEntry {
    pub state: PeerState,
    pub port: u16,
    pub conn: Option<ConnId>,
}

/// Keyed by the host name given on the command line. Iteration order is
/// stable so status dumps come out the same way every time.
pub struct PeerRegistry {
    peers: BTreeMap<String, PeerEntry>,
}

impl PeerRegistry {
    pub fn new(hosts: impl IntoIterator<Item = String>) -> PeerRegistry {
        let peers = hosts
            .into_iter()
            .map(|host| (host, PeerEntry { state: PeerState::Dead, port: 0, conn: None }))
            .collect();
        PeerRegistry { peers }
    }

    pub fn get(&self, host: &str) -> Option<&PeerEntry> {
        self.peers.get(host)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &PeerEntry)> {
        self.peers.iter().map(|(host, entry)| (host.as_str(), entry))
    }

    /// A peer agent announced itself on `conn`.
    pub fn hello(&mut self, host: &str, conn: ConnId) -> bool {
        match self.peers.get_mut(host) {
            Some(entry) => {
                entry.state = PeerState::Stopped;
                entry.port = 0;
                entry.conn = Some(conn);
                true
            }
            None => false,
        }
    }

    pub fn started(&mut self, host: &str, port: u16) -> bool {
        match self.peers.get_mut(host) {
            Some(entry) => {
                entry.state = PeerState::Started;
                entry.port = port;
                true
            }
            None => false,
        }
    }

    pub fn stopped(&mut self, host: &str) -> bool {
        match self.peers.get_mut(host) {
            Some(entry) => {
                entry.state = PeerState::Stopped;
                entry.port = 0;
                true
            }
            None => false,
        }
    }

    /// A control connection went away. Returns the host that was on it,
    /// if it belonged to a peer at all.
    pub fn disconnected(&mut self, conn: ConnId) -> Option<String> {
        for (host, entry) in &mut self.peers {
            if entry.conn == Some(conn) {
                entry.state = PeerState::Dead;
                entry.port = 0;
                entry.conn = None;
                return Some(host.clone());
            }
        }
        None
    }

    /// `STATE host DEAD|STOPPED|STARTED`, the line broadcast on every
    /// transition and dumped on `CHELLO`.
    pub fn state_line(&self, host: &str) -> Option<String> {
        self.peers
            .get(host)
            .map(|entry| format!("STATE {host} {}", entry.state))
    }

    pub fn state_lines(&self) -> Vec<String> {
        self.peers
            .iter()
            .map(|(host, entry)| format!("STATE {host} {}", entry.state))
            .collect()
    }

    /// `HOST:PORT` of every running node; bootstrap candidates.
    pub fn started_addrs(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter(|(_, entry)| entry.state == PeerState::Started)
            .map(|(host, entry)| format!("{host}:{}", entry.port))
            .collect()
    }

    pub fn dead_hosts(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter(|(_, entry)| entry.state == PeerState::Dead)
            .map(|(host, _)| host.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> PeerRegistry {
        PeerRegistry::new(["alpha".to_string(), "beta".to_string()])
    }

    #[test]
    fn peers_start_out_dead() {
        let registry = registry();
        assert_eq!(
            registry.state_lines(),
            ["STATE alpha DEAD", "STATE beta DEAD"]
        );
        assert_eq!(registry.dead_hosts(), ["alpha", "beta"]);
    }

    #[test]
    fn hello_started_stopped_walk_the_lifecycle() {
        let mut registry = registry();
        assert!(registry.hello("alpha", 3));
        assert_eq!(registry.state_line("alpha").unwrap(), "STATE alpha STOPPED");

        assert!(registry.started("alpha", 12345));
        assert_eq!(registry.state_line("alpha").unwrap(), "STATE alpha STARTED");
        assert_eq!(registry.started_addrs(), ["alpha:12345"]);

        assert!(registry.stopped("alpha"));
        assert_eq!(registry.state_line("alpha").unwrap(), "STATE alpha STOPPED");
        assert!(registry.started_addrs().is_empty());
    }

    #[test]
    fn unknown_hosts_are_rejected() {
        let mut registry = registry();
        assert!(!registry.hello("gamma", 1));
        assert!(!registry.started("gamma", 1));
        assert!(!registry.stopped("gamma"));
        assert_eq!(registry.state_line("gamma"), None);
    }

    #[test]
    fn disconnect_resolves_the_connection_to_its_host() {
        let mut registry = registry();
        registry.hello("beta", 9);
        registry.started("beta", 20000);

        assert_eq!(registry.disconnected(9).as_deref(), Some("beta"));
        assert_eq!(registry.state_line("beta").unwrap(), "STATE beta DEAD");
        // A client connection matches no peer.
        assert_eq!(registry.disconnected(42), None);
    }
}
