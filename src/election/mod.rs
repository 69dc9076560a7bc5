//! Raft-style leader election over UDP.
//!
//! [`ElectionNode`] is the runtime; the protocol rules themselves live in
//! [`rpc`] and [`state`] as plain functions over [`ElectionState`] so they can
//! be exercised without sockets or timers.

pub mod log;
pub mod node;
pub mod rpc;
pub mod state;
pub mod timer;

pub use log::{LogEntry, ReplicatedLog};
pub use node::{ElectionEvent, ElectionMessage, ElectionNode};
pub use state::{ElectionRole, ElectionState, VoteOutcome};
