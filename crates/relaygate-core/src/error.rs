use thiserror::Error;

/// Errors produced by the relaygate protocol layer and engine.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ciborium::de::Error<std::io::Error>> for GatewayError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        GatewayError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for GatewayError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        GatewayError::Codec(e.to_string())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
