//! Server-side error taxonomy.
//!
//! Analysis and worker faults are recoverable per track (the scheduler picks
//! a replacement); everything else is surfaced to the caller. A fault inside
//! one session's pipeline tears down that session only.

use thiserror::Error;

use crate::worker::WorkerError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("unknown collection '{0}'")]
    UnknownCollection(String),

    #[error("collection '{0}' has no playable tracks")]
    EmptyCatalog(String),

    #[error("unknown session '{0}'")]
    UnknownSession(String),

    #[error("unknown track '{0}'")]
    UnknownTrack(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("session terminated")]
    SessionClosed,

    #[error("encoder process: {0}")]
    Encoder(String),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;
