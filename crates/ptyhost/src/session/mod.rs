//! Session and PTY lifecycle.
//!
//! A session owns a [`PtyManager`], which owns the [`PtyProcess`]es spawned
//! within it. Sessions are created and torn down through a
//! [`SessionManagerImpl`]; tearing one down terminates all of its PTYs.

pub mod error;
pub mod id;
mod limit;
pub mod manager;
pub mod output;
pub mod pty;
pub mod registry;
pub mod screen;

/// Identifier of a PTY, unique within its session.
pub type PtyId = String;

/// Identifier of a session.
pub type SessionId = String;

pub use error::PtyError;
pub use id::{IdGenerator, UuidV7Generator};
pub use manager::{SessionInfo, SessionManager, SessionManagerImpl, SessionStatus};
pub use output::{OutputChunk, OutputRecord};
pub use pty::{PtyDefaults, PtyInfo, PtyOptions, PtyProcess, PtyStatus};
pub use registry::PtyManager;
pub use screen::{Screen, Vt100Screen};
