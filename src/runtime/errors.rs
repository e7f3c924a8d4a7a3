//! Runtime errors

use crate::runtime::fiber::FiberStatus;
use thiserror::Error;

/// Runtime result
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Runtime errors
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Cannot resume fiber with status {0:?}")]
    NotResumable(FiberStatus),

    #[error("Cannot resume a root fiber owned by the scheduler")]
    CannotResumeRoot,

    #[error("Fiber has no body to run")]
    NoBody,

    #[error("Channel is closed")]
    ChannelClosed,

    #[error("Value of type {0} cannot cross threads")]
    NotSendable(&'static str),

    #[error("Malformed cross-thread payload: {0}")]
    MalformedPayload(String),

    #[error("Stream is closed")]
    StreamClosed,

    #[error("Stream does not support this operation")]
    InvalidStreamRole,

    #[error("Fiber already has an outstanding wait registration")]
    AlreadyWaiting,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
