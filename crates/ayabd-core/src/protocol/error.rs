//! Protocol errors

use thiserror::Error;

use super::SessionState;

/// Errors that can occur while talking to the AYAB controller
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("AYAB response timeout")]
    Timeout,

    #[error("Not connected to AYAB")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection to AYAB lost")]
    ConnectionLost,

    #[error("Invalid connection specification: {0}")]
    InvalidConnectionSpec(String),

    #[error("Invalid knitting job: first needle {first_needle}, width {width}")]
    InvalidJob { first_needle: u16, width: u16 },

    #[error("AYAB reports API version {actual}, but we expect version {expected}")]
    VersionMismatch { expected: u8, actual: u8 },

    #[error("AYAB start command failed with status {0}")]
    StartFailed(u8),

    #[error("AYAB invalid response for command: 0x{0:02X}")]
    UnexpectedResponse(u8),

    #[error("Another command is still waiting for its response")]
    Busy,

    #[error("Invalid session transition from {from:?} to {to:?}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
