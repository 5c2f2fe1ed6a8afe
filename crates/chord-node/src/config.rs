use std::ops::Range;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::net::UdpSocket;

/// Everything a node needs to come up.
///
/// The process manager opens the sockets so it can report the exact port
/// upstream before the node exists; the node never binds anything itself.
pub struct NodeConfig {
    /// Our own `HOST:PORT`, exactly as peers will address us. The node id
    /// is derived from this string.
    pub listen_addr: String,
    /// Pre-bound TCP listener for peer and operator connections.
    pub listener: TcpListener,
    /// Pre-bound UDP socket for the routing plane.
    pub udp: UdpSocket,
    /// Existing peer to join through, or `None` to start a fresh ring.
    pub boot_peer: Option<String>,
    pub intervals: Intervals,
}

/// Periods of the maintenance timers. The defaults are the protocol
/// values; tests shrink them to keep wall-clock time down.
#[derive(Debug, Clone)]
pub struct Intervals {
    pub stabilize: Duration,
    pub fix_finger: Duration,
    pub backup: Duration,
    pub ping: Duration,
    /// How long a roll call stays open before the operator socket is
    /// closed. Seeing our own SHOW come back around does not mean every
    /// PEER reply has arrived, so a deadline is the only way to finish.
    pub show_timeout: Duration,
    /// Millisecond range for the one-off random delay before each timer
    /// first fires; staggering keeps a booting fleet from thundering.
    pub stagger_ms: Range<u64>,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            stabilize: Duration::from_secs(10),
            fix_finger: Duration::from_secs(15),
            backup: Duration::from_secs(10),
            ping: Duration::from_secs(10),
            show_timeout: Duration::from_secs(10),
            stagger_ms: 5_000..10_000,
        }
    }
}
