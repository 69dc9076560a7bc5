use std::net::SocketAddr;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("{0} is already started")]
    AlreadyStarted(&'static str),

    #[error("Not the leader, current leader is {0:?}")]
    NotLeader(Option<String>),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Timed out binding socket on {0}")]
    BindTimeout(SocketAddr),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CoordError>;
