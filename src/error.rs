use std::io;

/// Error returned by most functions in this crate.
///
/// The variants mirror the disposition table of the error-handling design:
/// each one maps onto a single row (config validation, bind/listen, a
/// `decode` failure, a misused lifecycle call). Connection-level I/O errors
/// never reach a caller as an `Error` — they close the offending connection
/// and are only ever logged (see `io_thread::IoThread::close_connection`).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid server configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to bind {addr}:{port}: {source}")]
    Bind {
        addr: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("server already started")]
    AlreadyStarted,

    #[error("server not started")]
    NotStarted,

    #[error("connection is closed")]
    Closed,

    #[error("decode error: {0}")]
    Decode(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A specialized `Result` type for this crate's operations.
pub type Result<T> = std::result::Result<T, Error>;
