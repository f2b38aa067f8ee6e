use thiserror::Error;

/// Errors produced by the framing, cipher, and session layers.
///
/// `ShortRead` is the only kind that is not an error in the usual sense: the
/// frame reader returns it when a frame is incomplete and the caller should
/// simply wait for more bytes. Everything else tears the session down or is
/// logged and dropped, per kind.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("not enough bytes for a whole frame")]
    ShortRead,

    #[error("malformed frame: {0}")]
    Framing(String),

    #[error("no candidate key matches the first inbound frame")]
    CipherMismatch,

    #[error("unexpected opcode {opcode:02X} in state {state}")]
    HandshakeUnexpected { opcode: u16, state: &'static str },

    #[error("no handler installed for subcommand {0:02X}")]
    Unimplemented(u8),

    #[error("cannot reach upstream {0}")]
    UpstreamUnavailable(String),

    #[error("{0} endpoint is not connected")]
    PeerAbsent(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    pub fn framing(msg: impl Into<String>) -> Self {
        ProxyError::Framing(msg.into())
    }
}
