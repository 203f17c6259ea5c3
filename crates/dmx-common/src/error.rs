//! Central error types for the engine (thiserror-based).

use thiserror::Error;

/// Errors surfaced by the demultiplexer engine.
#[derive(Error, Debug)]
pub enum DemuxError {
    /// No format driver accepted the source during probing.
    #[error("container format not recognized")]
    UnrecognizedFormat,

    /// A format was forced by name but no such driver is registered.
    #[error("unknown format driver: {0}")]
    UnknownDriver(String),

    /// The byte source's cancel token tripped before or during open.
    #[error("operation cancelled")]
    Cancelled,

    /// The format driver failed in a way that is not a probe rejection.
    #[error("driver error: {0}")]
    Driver(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type for engine operations.
pub type DemuxResult<T> = Result<T, DemuxError>;
