//! # ptyhost
//!
//! Pseudo-terminal process hosting for remote terminal services.
//!
//! ## Overview
//!
//! The crate spawns programs inside pseudo-terminals and manages their whole
//! lifecycle on behalf of a protocol layer:
//!
//! - **PTY processes**: spawn, write input, resize, capture output (raw and
//!   rendered through a headless terminal), and terminate with SIGTERM then
//!   SIGKILL escalation
//! - **PTY registry**: per-session map of PTYs with unique ids and optional
//!   auto-disposal when a process exits
//! - **Session registry**: creates sessions and cascades teardown to every
//!   PTY they own
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              SessionManagerImpl              │
//! │  session id ──► Session { status, PtyManager }│
//! └──────────────────────┬───────────────────────┘
//!                        │ one per session
//!             ┌──────────▼──────────┐
//!             │      PtyManager     │
//!             │ pty id ──► PtyProcess│
//!             └──────────┬──────────┘
//!                        │
//!      ┌─────────────────▼──────────────────┐
//!      │ PtyProcess: child + master + reader │
//!      │ OutputRecord (raw) + Screen (vt100) │
//!      └────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ptyhost::session::{PtyOptions, SessionManager, SessionManagerImpl};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = SessionManagerImpl::default();
//!     let session = manager.create_session()?;
//!
//!     let pty = manager.create_pty(&session, PtyOptions::new("echo").args(["hi"]))?;
//!     manager.get_pty(&session, &pty)?.wait_for_exit().await;
//!
//!     print!("{}", manager.get_output_buffer(&session, &pty, true)?);
//!     manager.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: PTY processes, the per-session PTY registry, and the
//!   session registry

pub mod config;
pub mod session;

// Re-export config types for convenience
pub use config::Config;

// Re-export session types for convenience
pub use session::{
    PtyDefaults, PtyError, PtyId, PtyInfo, PtyManager, PtyOptions, PtyProcess, PtyStatus,
    SessionId, SessionInfo, SessionManager, SessionManagerImpl, SessionStatus,
};
