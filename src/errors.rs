//! Error types for the BLA coordination engine

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlaError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown trunk: {0}")]
    UnknownTrunk(String),

    #[error("Unknown station: {0}")]
    UnknownStation(String),

    #[error("Trunk busy: {0}")]
    TrunkBusy(String),

    #[error("Dial failed: {0}")]
    DialFailed(String),

    #[error("Coordinator channel closed")]
    ChannelClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BlaError {
    pub fn config(msg: impl Into<String>) -> Self {
        BlaError::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        BlaError::Internal(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, BlaError>;
