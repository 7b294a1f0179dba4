// Error types shared by the registry and the session filter

use crate::session::SessionId;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// No live record exists for the id
    #[error("session {0} not found")]
    NotFound(SessionId),

    /// The request never passed through the session filter
    #[error("no session attached to request; is the session middleware installed?")]
    NotAttached,

    #[error("invalid session configuration: {0}")]
    InvalidConfig(String),
}
