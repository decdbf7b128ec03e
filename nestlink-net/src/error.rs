use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

/// Enumeration of errors that may occur while talking to the peer process.
#[derive(Error, Debug)]
pub enum Error {
    /// Slot-level connect/send/receive failure. Propagated to the caller,
    /// never retried silently.
    #[error("connection failed: {0}")]
    Connection(String),
    /// Malformed frame on an inbound slot. Message-local; listeners log it
    /// and keep draining.
    #[error("failed decoding frame: {0}")]
    Decode(String),
    /// Unexpected command label or a completion pulse with no outstanding
    /// command. Logged and ignored on the listener side.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// Barrier exceeded its deadline. The session returns to `Ready`.
    #[error("timed out waiting for the peer to finish")]
    TimedOut,
    /// The session was shut down while a wait was outstanding.
    #[error("session terminated")]
    Terminated,
    /// The peer process exited while a barrier was outstanding.
    #[error("peer process terminated")]
    PeerTerminated,
    /// Failure reported by the simulator collaborator.
    #[error("simulator error: {0}")]
    Simulation(String),

    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("other: {0}")]
    Other(String),

    #[error("failed parsing address: {0}")]
    AddrParseError(#[from] std::net::AddrParseError),
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("bincode error: {0}")]
    BincodeError(#[from] bincode::Error),
    #[error("serde_json error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[cfg(feature = "zmq_transport")]
    #[error("zmq error: {0}")]
    ZmqError(#[from] zmq::Error),
}
