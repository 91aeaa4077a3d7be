//! Core terminal session components.
//!
//! - **transport**: the SSH connection boundary (traits + error taxonomy)
//! - **ssh**: libssh2 implementation of the transport boundary
//! - **term**: ANSI escape sequence interpreter and display buffer
//! - **session**: one PTY channel with its input/output pumps
//! - **registry**: named sessions sharing one transport
//!
//! # Architecture
//!
//! ```text
//! SessionRegistry
//! └── TerminalSession (one per tab)
//!     ├── ShellChannel (PTY channel over the shared Transport)
//!     ├── output pump ──> SessionEvent::Output ──> consumer
//!     └── input pump  <── send_input()
//!
//! consumer: AnsiInterpreter ──> DisplayBuffer
//! ```

pub mod registry;
pub mod session;
pub mod ssh;
pub mod term;
pub mod transport;
