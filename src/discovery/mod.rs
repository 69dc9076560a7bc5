//! Peer discovery over UDP presence broadcasts.

pub mod service;
pub mod table;

pub use service::{DiscoveryEvent, DiscoveryService};
pub use table::PeerTable;
