//! sshpane - SSH terminal sessions, SFTP transfers and an encrypted
//! profile store.
//!
//! # Modules
//!
//! - [`vault`]: connection profiles encrypted at rest (AES-256-GCM)
//! - [`core`]: the transport boundary, terminal sessions, the session
//!   registry and the ANSI interpreter
//! - [`transfer`]: chunked, progress-reporting file transfer over SFTP
//! - [`connect`]: profile to transport, with a named result message
//! - [`config`]: `~/.sshpane/config.toml`
//! - [`ui`]: key mapping for interactive sessions
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use sshpane::connect::{connect_profile, SshConnector};
//! use sshpane::core::registry::{RegistryEvent, SessionRegistry};
//! use sshpane::core::session::SessionEvent;
//! use sshpane::core::term::{AnsiInterpreter, DisplayBuffer};
//! use sshpane::vault::Vault;
//!
//! let vault = Vault::open("/tmp/vault").unwrap();
//! let transport = connect_profile(
//!     &vault,
//!     &SshConnector::default(),
//!     "web",
//!     Duration::from_secs(10),
//!     &mut |ok, message| println!("{}: {}", ok, message),
//! )
//! .unwrap();
//!
//! let (mut registry, events) = SessionRegistry::with_channel();
//! let id = registry.create(transport, None).unwrap();
//! registry.get_mut(&id).unwrap().start("xterm-256color", 80, 24).unwrap();
//!
//! let mut interpreter = AnsiInterpreter::new();
//! let mut buffer = DisplayBuffer::new(5000);
//! while let Ok(RegistryEvent { event: SessionEvent::Output(text), .. }) = events.recv() {
//!     interpreter.process(&text, &mut buffer);
//! }
//! ```

pub mod config;
pub mod connect;
pub mod core;
pub mod transfer;
pub mod ui;
pub mod vault;

#[cfg(test)]
pub(crate) mod testing;
