//! Error types for GTunnel.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The envelope is truncated or its header block will not inflate.
    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Header block too large: {0} compressed bytes")]
    HeaderTooLarge(usize),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
