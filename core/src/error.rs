use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Frame encoding error: {0}")]
    EncodingError(String),

    #[error("Failed to decode acoustic data")]
    DecodeFailed,

    #[error("Negotiation mismatch: {0}")]
    NegotiationMismatch(String),

    #[error("No local candidate matches {0}")]
    MissingCandidate(Ipv4Addr),

    #[error("SDP error: {0}")]
    Sdp(String),

    #[error("Invalid template: {0}")]
    InvalidTemplate(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("File is empty")]
    EmptyFile,

    #[error("Unexpected data channel message: {0}")]
    UnexpectedMessage(String),

    #[error("Received {received} bytes but only {expected} were announced")]
    TransferOverrun { expected: u64, received: u64 },

    #[error("Data channel closed")]
    ChannelClosed,

    #[error("Peer connection error: {0}")]
    Peer(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SignalingError>;
