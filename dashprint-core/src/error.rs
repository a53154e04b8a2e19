//! Error taxonomy for the adapter/link layer and for individual commands.

/// Failures that can occur opening or operating the serial port itself, below
/// the level of any single command.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),
}

/// The terminal outcome of one `send_command` call. All variants are final
/// for that call; the engine separately decides whether to reconnect.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("printer is not connected")]
    NotConnected,

    #[error("timed out waiting for a reply")]
    CommTimeout,

    #[error("firmware requested resend of a line that was not the last one sent")]
    UnrecoverableResend,

    #[error("failed to write to printer: {0}")]
    WriteFailed(String),

    #[error("connection to printer was lost")]
    LinkLost,
}
