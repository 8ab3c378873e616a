//! Errors surfaced by the PTY and session registries.

use thiserror::Error;

use super::{PtyId, SessionId};

/// Errors that can occur during session and PTY operations.
///
/// Every variant is scoped to the single request that produced it; none of
/// them leave a registry in an inconsistent state.
#[derive(Error, Debug)]
pub enum PtyError {
    /// The session was not found.
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// The session has been terminated and accepts no new PTYs.
    #[error("session is terminated: {0}")]
    SessionClosed(SessionId),

    /// The PTY was not found within an existing session.
    #[error("pty not found: {0}")]
    PtyNotFound(PtyId),

    /// The OS refused to allocate the pty or spawn the child.
    #[error("failed to spawn process: {0}")]
    Spawn(String),

    /// The PTY is terminating or has terminated.
    #[error("pty is no longer running: {0}")]
    StaleProcess(PtyId),

    /// The OS rejected a terminal resize.
    #[error("failed to resize pty: {0}")]
    Resize(String),

    /// The requested terminal geometry is not usable.
    #[error("invalid terminal size: {cols}x{rows}")]
    InvalidSize { cols: u16, rows: u16 },

    /// The identifier generator kept producing ids that are already taken.
    #[error("could not allocate a unique id after {0} attempts")]
    IdExhausted(usize),

    /// A configured limit would be exceeded.
    #[error("limit reached: {0}")]
    LimitReached(String),

    /// I/O error while talking to the pty.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PtyError {
    /// Returns true for errors caused by an unknown session or PTY id.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::SessionNotFound(_) | Self::PtyNotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = PtyError::SessionNotFound("s1".to_string());
        assert_eq!(err.to_string(), "session not found: s1");

        let err = PtyError::InvalidSize { cols: 0, rows: 24 };
        assert_eq!(err.to_string(), "invalid terminal size: 0x24");
    }

    #[test]
    fn test_is_not_found() {
        assert!(PtyError::SessionNotFound("s".into()).is_not_found());
        assert!(PtyError::PtyNotFound("p".into()).is_not_found());
        assert!(!PtyError::StaleProcess("p".into()).is_not_found());
        assert!(!PtyError::Spawn("nope".into()).is_not_found());
    }
}
