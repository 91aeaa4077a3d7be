//! libssh2-backed transport
//!
//! The session is switched to non-blocking mode once authenticated so that a
//! shell channel waiting for output never holds the session lock that every
//! other channel (and SFTP) on the same connection needs. Every libssh2 call
//! is therefore wrapped in a retry loop that treats `EAGAIN` as "try again
//! shortly" and gives up with [`TransportError::Timeout`] at a deadline.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use ssh2::{Channel, ErrorCode, FileStat, Session, Sftp};
use tracing::{debug, info};

use super::transport::{
    ExecOutput, ReadOutcome, RemoteEntry, RemoteFs, RemoteStat, Result, ShellChannel, Transport,
    TransportError,
};

/// libssh2 error codes
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_EAGAIN: i32 = -37;
const LIBSSH2_FX_NO_SUCH_FILE: i32 = 2;

/// Sleep between retries of a call that returned EAGAIN
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// How long a channel close may take before we give up on it
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Mode for directories created over SFTP
const DIR_MODE: i32 = 0o755;

fn would_block(err: &ssh2::Error) -> bool {
    matches!(err.code(), ErrorCode::Session(LIBSSH2_ERROR_EAGAIN))
}

fn map_error(operation: &str, err: ssh2::Error) -> TransportError {
    match err.code() {
        ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED) => {
            TransportError::Authentication(err.message().to_string())
        }
        ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => TransportError::timeout(operation),
        ErrorCode::SFTP(LIBSSH2_FX_NO_SUCH_FILE) => TransportError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{}: {}", operation, err.message()),
        )),
        _ => TransportError::Transport(format!("{}: {}", operation, err.message())),
    }
}

/// Run a libssh2 call until it stops returning EAGAIN or the deadline passes.
fn retry<T>(
    operation: &str,
    timeout: Duration,
    mut op: impl FnMut() -> std::result::Result<T, ssh2::Error>,
) -> Result<T> {
    let deadline = Instant::now() + timeout;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if would_block(&e) => {
                if Instant::now() >= deadline {
                    return Err(TransportError::timeout(operation));
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => return Err(map_error(operation, e)),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Connection parameters for a single SSH login.
#[derive(Debug, Clone)]
pub struct ConnectParams<'a> {
    pub host: &'a str,
    pub port: u16,
    pub username: &'a str,
    pub secret: &'a str,
    pub timeout: Duration,
}

/// An authenticated SSH connection.
pub struct SshTransport {
    session: Session,
    /// Timeout for SFTP operations issued through [`SshFs`]
    fs_timeout: Duration,
}

impl SshTransport {
    /// Connect and authenticate with a password.
    pub fn connect(params: &ConnectParams<'_>) -> Result<Self> {
        let addrs: Vec<_> = (params.host, params.port)
            .to_socket_addrs()
            .map_err(|e| TransportError::Transport(format!("resolve {}: {}", params.host, e)))?
            .collect();

        let mut last_err = None;
        let mut tcp = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, params.timeout) {
                Ok(stream) => {
                    tcp = Some(stream);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        let tcp = match (tcp, last_err) {
            (Some(stream), _) => stream,
            (None, Some(e)) if e.kind() == io::ErrorKind::TimedOut => {
                return Err(TransportError::timeout("connect"))
            }
            (None, Some(e)) => {
                return Err(TransportError::Transport(format!(
                    "connect {}:{}: {}",
                    params.host, params.port, e
                )))
            }
            (None, None) => {
                return Err(TransportError::Transport(format!(
                    "no address for {}",
                    params.host
                )))
            }
        };

        let mut session = Session::new().map_err(|e| map_error("session", e))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(params.timeout.as_millis().min(u32::MAX as u128) as u32);
        session.handshake().map_err(|e| map_error("handshake", e))?;

        if let Err(e) = session.userauth_password(params.username, params.secret) {
            return Err(match map_error("authentication", e) {
                TransportError::Transport(msg) => TransportError::Authentication(msg),
                other => other,
            });
        }
        if !session.authenticated() {
            return Err(TransportError::Authentication(
                "server rejected the credentials".to_string(),
            ));
        }

        session.set_timeout(0);
        session.set_blocking(false);
        info!("Connected to {}:{} as {}", params.host, params.port, params.username);

        Ok(Self {
            session,
            fs_timeout: params.timeout,
        })
    }

    /// Use a different timeout for SFTP operations.
    pub fn with_fs_timeout(mut self, timeout: Duration) -> Self {
        self.fs_timeout = timeout;
        self
    }

    fn open_channel(&self, timeout: Duration) -> Result<Channel> {
        retry("open channel", timeout, || self.session.channel_session())
    }
}

impl Transport for SshTransport {
    fn open_shell(
        &self,
        term_type: &str,
        cols: u16,
        rows: u16,
        timeout: Duration,
    ) -> Result<Arc<dyn ShellChannel>> {
        let deadline = Instant::now() + timeout;
        let remaining = || deadline.saturating_duration_since(Instant::now());

        let mut channel = self.open_channel(timeout)?;
        retry("request pty", remaining(), || {
            channel.request_pty(term_type, None, Some((cols as u32, rows as u32, 0, 0)))
        })?;
        retry("start shell", remaining(), || channel.shell())?;
        debug!("Shell channel open ({}, {}x{})", term_type, cols, rows);

        Ok(Arc::new(SshChannel {
            channel: Mutex::new(channel),
            closed: AtomicBool::new(false),
        }))
    }

    fn open_fs(&self) -> Result<Arc<dyn RemoteFs>> {
        let sftp = retry("open sftp", self.fs_timeout, || self.session.sftp())?;
        Ok(Arc::new(SshFs {
            sftp,
            timeout: self.fs_timeout,
        }))
    }

    fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput> {
        let deadline = Instant::now() + timeout;
        let remaining = || deadline.saturating_duration_since(Instant::now());

        let mut channel = self.open_channel(timeout)?;
        retry("exec", remaining(), || channel.exec(command))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let mut progressed = false;
            match channel.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    stdout.extend_from_slice(&buf[..n]);
                    progressed = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(TransportError::Io(e)),
            }
            match channel.stderr().read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    stderr.extend_from_slice(&buf[..n]);
                    progressed = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(TransportError::Io(e)),
            }
            if !progressed {
                if channel.eof() {
                    break;
                }
                if Instant::now() >= deadline {
                    return Err(TransportError::timeout("exec"));
                }
                thread::sleep(POLL_INTERVAL);
            }
        }

        retry("exec", remaining(), || channel.wait_close())?;
        let exit_code = channel.exit_status().map_err(|e| map_error("exec", e))?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }
}

/// A PTY shell channel on a non-blocking session.
pub struct SshChannel {
    channel: Mutex<Channel>,
    closed: AtomicBool,
}

impl ShellChannel for SshChannel {
    fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(ReadOutcome::Closed);
        }
        let mut channel = lock(&self.channel);
        match channel.read(buf) {
            Ok(0) if channel.eof() => Ok(ReadOutcome::Closed),
            Ok(0) => Ok(ReadOutcome::Idle),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if channel.eof() {
                    Ok(ReadOutcome::Closed)
                } else {
                    Ok(ReadOutcome::Idle)
                }
            }
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn write_all(&self, data: &[u8]) -> Result<()> {
        let mut offset = 0;
        while offset < data.len() {
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Transport("channel closed".to_string()));
            }
            // Lock per attempt so the output pump is never starved
            let written = {
                let mut channel = lock(&self.channel);
                channel.write(&data[offset..])
            };
            match written {
                Ok(n) => offset += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
        Ok(())
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let mut channel = lock(&self.channel);
        retry("resize", CLOSE_TIMEOUT, || {
            channel.request_pty_size(cols as u32, rows as u32, None, None)
        })
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut channel = lock(&self.channel);
        retry("close channel", CLOSE_TIMEOUT, || channel.close())
    }
}

/// Adapts an SFTP file on a non-blocking session to blocking `Read`/`Write`.
struct BlockingFile {
    file: ssh2::File,
    timeout: Duration,
}

impl BlockingFile {
    fn wait<T>(&mut self, mut op: impl FnMut(&mut ssh2::File) -> io::Result<T>) -> io::Result<T> {
        let deadline = Instant::now() + self.timeout;
        loop {
            match op(&mut self.file) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "sftp i/o timed out"));
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                other => return other,
            }
        }
    }
}

impl Read for BlockingFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.wait(|file| file.read(buf))
    }
}

impl Write for BlockingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.wait(|file| file.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.wait(|file| file.flush())
    }
}

fn to_stat(stat: &FileStat) -> RemoteStat {
    RemoteStat {
        size: stat.size.unwrap_or(0),
        mtime: stat.mtime.unwrap_or(0),
        mode: stat.perm.unwrap_or(0),
        is_dir: stat.is_dir(),
    }
}

/// SFTP file subsystem.
pub struct SshFs {
    sftp: Sftp,
    timeout: Duration,
}

impl RemoteFs for SshFs {
    fn list(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let entries = retry("list", self.timeout, || self.sftp.readdir(Path::new(path)))?;
        Ok(entries
            .into_iter()
            .filter_map(|(entry_path, stat)| {
                let name = entry_path.file_name()?.to_string_lossy().into_owned();
                if name == "." || name == ".." {
                    return None;
                }
                Some(RemoteEntry {
                    name,
                    stat: to_stat(&stat),
                })
            })
            .collect())
    }

    fn stat(&self, path: &str) -> Result<RemoteStat> {
        retry("stat", self.timeout, || self.sftp.stat(Path::new(path))).map(|s| to_stat(&s))
    }

    fn open_read(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        let file = retry("open", self.timeout, || self.sftp.open(Path::new(path)))?;
        Ok(Box::new(BlockingFile {
            file,
            timeout: self.timeout,
        }))
    }

    fn open_write(&self, path: &str) -> Result<Box<dyn Write + Send>> {
        let file = retry("create", self.timeout, || self.sftp.create(Path::new(path)))?;
        Ok(Box::new(BlockingFile {
            file,
            timeout: self.timeout,
        }))
    }

    fn mkdir(&self, path: &str) -> Result<()> {
        retry("mkdir", self.timeout, || self.sftp.mkdir(Path::new(path), DIR_MODE))
    }

    fn remove(&self, path: &str) -> Result<()> {
        retry("remove", self.timeout, || self.sftp.unlink(Path::new(path)))
    }

    fn rmdir(&self, path: &str) -> Result<()> {
        retry("rmdir", self.timeout, || self.sftp.rmdir(Path::new(path)))
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        retry("rename", self.timeout, || {
            self.sftp.rename(Path::new(from), Path::new(to), None)
        })
    }
}
