//! A Chord-style distributed hash table peer.
//!
//! Nodes address each other by `HOST:PORT`; ids are SHA-1 digests in a
//! 160-bit circular space. Lookups hop along finger tables in O(log N),
//! periodic stabilization repairs the ring under churn, and items move to
//! their new owner when a node joins. See [`node::Node`] for the event
//! model.

pub mod config;
pub mod id;
pub mod node;
pub mod transport;
pub mod wire;

mod ring;

pub use config::Intervals;
pub use config::NodeConfig;
pub use node::Node;
