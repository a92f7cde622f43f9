use thiserror::Error;

/// Errors surfaced by the protocol and its front ends.
///
/// Transport loss, duplication and reordering are never reported here; the pull protocol absorbs
/// them by re-requesting on the next tick.
#[derive(Error, Debug)]
pub enum Error {
    /// A received datagram could not be decoded. Receivers log and drop it.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
