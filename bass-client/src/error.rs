//! Errors surfaced by the client handle and the command-line tool.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The device actor has stopped and no longer accepts commands.
    #[error("BASS client actor is closed")]
    ActorClosed,

    /// Invalid configuration or command-line input.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid hex input: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

impl From<bass_protocol::ProtocolError> for ClientError {
    fn from(err: bass_protocol::ProtocolError) -> Self {
        ClientError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(ClientError::ActorClosed.to_string(), "BASS client actor is closed");
        let err: ClientError = hex::decode("zz").unwrap_err().into();
        assert!(matches!(err, ClientError::InvalidHex(_)));
    }
}
