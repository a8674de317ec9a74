//! Error types for the reliability layer

use thiserror::Error;

/// Reliable bus error
#[derive(Debug, Error)]
pub enum Error {
    /// Opening or configuring a channel failed
    #[error("Channel error: {0}")]
    Channel(String),

    /// Publish error
    #[error("Publish error: {0}")]
    Publish(String),

    /// The broker rejected a publish (negative publisher confirm)
    #[error("Publish to exchange '{exchange}' was nacked by the broker")]
    Nacked {
        /// Target exchange of the nacked publish
        exchange: String,
    },

    /// Subscribe error
    #[error("Subscribe error: {0}")]
    Subscribe(String),

    /// Ack or reject of a delivery failed
    #[error("Acknowledge error: {0}")]
    Acknowledge(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// The caller's cancellation token fired
    #[error("Operation cancelled")]
    Cancelled,

    /// The channel was already closed
    #[error("Channel is closed")]
    ChannelClosed,

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Broker client error
    #[error("Broker error: {0}")]
    Broker(String),
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;
