pub mod config;
pub mod detector;
pub mod discovery;
pub mod election;
pub mod error;
pub mod node;
pub mod peer;
pub mod protocol;
pub mod shutdown;
pub mod transport;

pub use error::{CoordError, Result};
