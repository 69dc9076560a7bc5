//! Failure and partition detection.
//!
//! Turns best-effort heartbeat delivery into a reachability classification:
//!
//! - [`PartitionDetector`]: the classifier itself, driven by an injected clock
//! - [`PartitionMonitor`]: owns a detector and runs its periodic sweep
//!
//! The detector's output is advisory. The election coordinator may use a
//! leader's unreachability to start an election early, but never consults
//! the detector to decide votes or leadership.

pub mod monitor;
pub mod tracker;

pub use monitor::PartitionMonitor;
pub use tracker::{DetectorEvent, PartitionDetector, PartitionStatus, PeerHealth};
