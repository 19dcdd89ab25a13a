use thiserror::Error;

/// Errors produced by the codec, broker, and client.
///
/// Every fallible operation in this crate reports one of these kinds; the
/// broker maps them onto ERROR frames before closing a misbehaving session.
#[derive(Error, Debug)]
pub enum StompError {
    /// Bytes on the wire did not parse as a STOMP frame.
    #[error("invalid wire format: {0}")]
    InvalidWireFormat(String),

    /// A parsed frame violates STOMP semantics (unknown command, missing
    /// required header, bad escape, bad heart-beat value).
    #[error("invalid frame: {0}")]
    ProtocolFrame(String),

    /// Operation not legal in the broker's current state.
    #[error("broker state: {0}")]
    BrokerState(String),

    /// Client-side state violation (e.g. CONNECTED without a session id).
    #[error("client state: {0}")]
    ClientState(String),

    /// Transaction id missing, duplicate, or unknown.
    #[error("transaction: {0}")]
    Transaction(String),

    /// Underlying I/O failure.
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Programmer misuse of the API.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, StompError>;
