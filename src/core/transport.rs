//! Transport boundary
//!
//! The SSH connection itself is an external collaborator. The rest of the
//! crate talks to it through the traits in this module:
//!
//! - [`Transport`]: one authenticated connection (shell channels, exec, SFTP)
//! - [`ShellChannel`]: one PTY-backed interactive byte stream
//! - [`RemoteFs`]: the file subsystem used by the transfer engine
//!
//! `core::ssh` implements them on top of libssh2.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Failures crossing the transport boundary.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Bad credentials. Never retried automatically.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Network or channel failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The operation did not finish within the caller's timeout.
    #[error("Timed out during {operation}")]
    Timeout { operation: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    pub fn timeout(operation: impl Into<String>) -> Self {
        TransportError::Timeout {
            operation: operation.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, TransportError::Authentication(_))
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Outcome of a single non-blocking read on a shell channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were copied into the buffer
    Data(usize),
    /// Nothing ready right now
    Idle,
    /// The remote side closed the channel
    Closed,
}

/// Output of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// An interactive PTY channel.
///
/// Implementations must tolerate `read`/`write` being called from two
/// different threads while `close` is called from a third.
pub trait ShellChannel: Send + Sync {
    /// Read whatever is available without blocking.
    fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome>;

    /// Write all bytes, in order.
    fn write_all(&self, data: &[u8]) -> Result<()>;

    /// Ask the remote side to resize the pseudo-terminal.
    fn resize(&self, cols: u16, rows: u16) -> Result<()>;

    /// Close the channel. Closing twice is not an error.
    fn close(&self) -> Result<()>;
}

/// One authenticated connection. Channels multiplex over it.
pub trait Transport: Send + Sync {
    fn open_shell(
        &self,
        term_type: &str,
        cols: u16,
        rows: u16,
        timeout: Duration,
    ) -> Result<Arc<dyn ShellChannel>>;

    fn open_fs(&self) -> Result<Arc<dyn RemoteFs>>;

    fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput>;
}

/// Attributes of a remote path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteStat {
    pub size: u64,
    /// Seconds since the epoch
    pub mtime: u64,
    /// Full mode bits (type + permissions)
    pub mode: u32,
    pub is_dir: bool,
}

impl RemoteStat {
    /// Permission bits as three octal digits, e.g. `"644"`.
    pub fn permissions(&self) -> String {
        format!("{:03o}", self.mode & 0o777)
    }
}

/// A directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub stat: RemoteStat,
}

impl RemoteEntry {
    pub fn is_dir(&self) -> bool {
        self.stat.is_dir
    }
}

/// Sort entries directories first, then by case-insensitive name.
pub fn sort_entries(entries: &mut [RemoteEntry]) {
    entries.sort_by(|a, b| {
        b.is_dir()
            .cmp(&a.is_dir())
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
}

/// The remote file subsystem (SFTP).
pub trait RemoteFs: Send + Sync {
    /// List a directory, excluding `.` and `..`.
    fn list(&self, path: &str) -> Result<Vec<RemoteEntry>>;
    fn stat(&self, path: &str) -> Result<RemoteStat>;
    fn open_read(&self, path: &str) -> Result<Box<dyn Read + Send>>;
    /// Create or truncate a file for writing.
    fn open_write(&self, path: &str) -> Result<Box<dyn Write + Send>>;
    fn mkdir(&self, path: &str) -> Result<()>;
    fn remove(&self, path: &str) -> Result<()>;
    fn rmdir(&self, path: &str) -> Result<()>;
    fn rename(&self, from: &str, to: &str) -> Result<()>;
}

/// Parent of a remote (POSIX) path, or `None` at the root.
pub fn remote_parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&trimmed[..idx]),
        None => None,
    }
}

/// Join a remote directory and a child name with exactly one `/`.
pub fn remote_join(dir: &str, name: &str) -> String {
    if dir.is_empty() || dir == "." {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, is_dir: bool) -> RemoteEntry {
        RemoteEntry {
            name: name.to_string(),
            stat: RemoteStat {
                is_dir,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_remote_parent() {
        assert_eq!(remote_parent("/home/user/file.txt"), Some("/home/user"));
        assert_eq!(remote_parent("/file.txt"), Some("/"));
        assert_eq!(remote_parent("dir/file.txt"), Some("dir"));
        assert_eq!(remote_parent("file.txt"), None);
        assert_eq!(remote_parent("/home/user/"), Some("/home"));
    }

    #[test]
    fn test_remote_join() {
        assert_eq!(remote_join("/srv", "a.txt"), "/srv/a.txt");
        assert_eq!(remote_join("/srv/", "a.txt"), "/srv/a.txt");
        assert_eq!(remote_join(".", "a.txt"), "a.txt");
    }

    #[test]
    fn test_sort_entries_dirs_first() {
        let mut entries = vec![
            entry("b.txt", false),
            entry("Zeta", true),
            entry("a.txt", false),
            entry("alpha", true),
        ];
        sort_entries(&mut entries);
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "Zeta", "a.txt", "b.txt"]);
    }

    #[test]
    fn test_permissions_string() {
        let stat = RemoteStat {
            mode: 0o100644,
            ..Default::default()
        };
        assert_eq!(stat.permissions(), "644");
    }

    #[test]
    fn test_timeout_is_distinct() {
        let err = TransportError::timeout("open shell");
        assert!(err.is_timeout());
        assert!(!err.is_authentication());
        assert_eq!(err.to_string(), "Timed out during open shell");
    }
}
