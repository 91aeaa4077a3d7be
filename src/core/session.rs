//! Terminal session
//!
//! One PTY channel plus the two pumps that move bytes through it:
//! the output pump polls the channel and hands decoded text to the session's
//! sink, the input pump drains queued input into the channel in FIFO order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::transport::{ReadOutcome, ShellChannel, Transport, TransportError};

/// Read buffer for the output pump
const READ_BUFFER_SIZE: usize = 4096;

/// Output pump back-off when the channel has nothing ready
const IDLE_BACKOFF: Duration = Duration::from_millis(10);

/// How often the input pump re-checks the running flag while idle
const INPUT_POLL: Duration = Duration::from_millis(50);

/// Default channel open timeout
const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on waiting for the pumps to exit
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session {0} is already running")]
    AlreadyRunning(String),

    #[error("A session named {0} already exists")]
    DuplicateName(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Lifecycle of a terminal session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    /// Stop requested, or the channel failed; pumps may still be exiting
    Stopping,
    Closed,
}

/// Events delivered to the session's sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Decoded output, in channel byte order
    Output(String),
    /// The remote side closed the channel
    Exited,
    /// The channel failed; the session stopped itself
    Error(String),
}

/// Consumer callback, invoked on the output pump's thread.
///
/// Consumers that own a UI thread should forward events through a channel
/// rather than touch UI state here.
pub type OutputSink = Arc<dyn Fn(SessionEvent) + Send + Sync>;

/// Snapshot of a session for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub name: String,
    pub state: SessionState,
    pub running: bool,
    pub size: (u16, u16),
}

/// Incremental UTF-8 decoder.
///
/// Holds back an incomplete trailing sequence until the next chunk; invalid
/// bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        let mut data = std::mem::take(&mut self.pending);
        data.extend_from_slice(bytes);

        let mut out = String::with_capacity(data.len());
        let mut rest: &[u8] = &data;
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    if let Ok(s) = std::str::from_utf8(&rest[..valid]) {
                        out.push_str(s);
                    }
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid + len..];
                        }
                        None => {
                            // Incomplete sequence at the end of the chunk
                            self.pending = rest[valid..].to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush any held-back bytes.
    pub fn finish(&mut self) -> String {
        let pending = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&pending).into_owned()
    }
}

fn set_state(state: &Mutex<SessionState>, new: SessionState) {
    *state.lock().unwrap_or_else(|p| p.into_inner()) = new;
}

fn get_state(state: &Mutex<SessionState>) -> SessionState {
    *state.lock().unwrap_or_else(|p| p.into_inner())
}

/// Running -> Stopping, leaving any other state alone.
fn mark_stopping(state: &Mutex<SessionState>) {
    let mut guard = state.lock().unwrap_or_else(|p| p.into_inner());
    if *guard == SessionState::Running {
        *guard = SessionState::Stopping;
    }
}

/// An interactive shell session over one PTY channel.
pub struct TerminalSession {
    name: String,
    transport: Arc<dyn Transport>,
    sink: OutputSink,
    channel: Option<Arc<dyn ShellChannel>>,
    running: Arc<AtomicBool>,
    state: Arc<Mutex<SessionState>>,
    input_tx: Option<Sender<Vec<u8>>>,
    output_thread: Option<JoinHandle<()>>,
    input_thread: Option<JoinHandle<()>>,
    size: (u16, u16),
    open_timeout: Duration,
    stop_timeout: Duration,
}

impl TerminalSession {
    /// Create an idle session. Nothing is opened until [`start`](Self::start).
    pub fn new(name: impl Into<String>, transport: Arc<dyn Transport>, sink: OutputSink) -> Self {
        Self {
            name: name.into(),
            transport,
            sink,
            channel: None,
            running: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(SessionState::Idle)),
            input_tx: None,
            output_thread: None,
            input_thread: None,
            size: (80, 24),
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, open: Duration, stop: Duration) -> Self {
        self.open_timeout = open;
        self.stop_timeout = stop;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SessionState {
        get_state(&self.state)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            name: self.name.clone(),
            state: self.state(),
            running: self.is_running(),
            size: self.size,
        }
    }

    /// Open a PTY channel and spawn the pumps.
    ///
    /// Restarting a closed session opens a fresh channel.
    pub fn start(&mut self, term_type: &str, cols: u16, rows: u16) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Starting | SessionState::Running => {
                return Err(SessionError::AlreadyRunning(self.name.clone()))
            }
            // The channel died on its own; finish tearing it down first
            SessionState::Stopping => {
                self.stop();
            }
            SessionState::Idle | SessionState::Closed => {}
        }

        set_state(&self.state, SessionState::Starting);
        let channel = match self
            .transport
            .open_shell(term_type, cols, rows, self.open_timeout)
        {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Session {}: failed to open shell channel: {}", self.name, e);
                set_state(&self.state, SessionState::Closed);
                return Err(e.into());
            }
        };

        self.size = (cols, rows);
        self.running.store(true, Ordering::SeqCst);
        let (input_tx, input_rx) = mpsc::channel::<Vec<u8>>();

        let output_thread = {
            let channel = channel.clone();
            let running = self.running.clone();
            let state = self.state.clone();
            let sink = self.sink.clone();
            thread::Builder::new()
                .name(format!("{}-output", self.name))
                .spawn(move || output_pump(channel, running, state, sink))
        };
        let input_thread = {
            let channel = channel.clone();
            let running = self.running.clone();
            let state = self.state.clone();
            let sink = self.sink.clone();
            thread::Builder::new()
                .name(format!("{}-input", self.name))
                .spawn(move || input_pump(channel, input_rx, running, state, sink))
        };

        let (output_thread, input_thread) = match (output_thread, input_thread) {
            (Ok(out), Ok(inp)) => (out, inp),
            (out, inp) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = channel.close();
                for handle in [out.ok(), inp.ok()].into_iter().flatten() {
                    let _ = handle.join();
                }
                set_state(&self.state, SessionState::Closed);
                return Err(
                    TransportError::Transport("failed to spawn session pumps".to_string()).into(),
                );
            }
        };

        self.channel = Some(channel);
        self.input_tx = Some(input_tx);
        self.output_thread = Some(output_thread);
        self.input_thread = Some(input_thread);
        set_state(&self.state, SessionState::Running);
        info!("Session {} started ({}, {}x{})", self.name, term_type, cols, rows);
        Ok(())
    }

    /// Queue raw bytes for the channel. Returns false if not running.
    pub fn send_bytes(&self, data: &[u8]) -> bool {
        if self.state() != SessionState::Running || !self.is_running() {
            return false;
        }
        match &self.input_tx {
            Some(tx) => tx.send(data.to_vec()).is_ok(),
            None => false,
        }
    }

    /// Queue text for the channel. Returns false if not running.
    pub fn send_input(&self, text: &str) -> bool {
        self.send_bytes(text.as_bytes())
    }

    /// Send a command followed by a newline.
    pub fn send_command(&self, command: &str) -> bool {
        self.send_input(&format!("{}\n", command))
    }

    /// Forward a resize to the channel. Failures are logged, never fatal.
    pub fn resize(&mut self, cols: u16, rows: u16) {
        if self.state() != SessionState::Running {
            return;
        }
        self.size = (cols, rows);
        if let Some(channel) = &self.channel {
            match channel.resize(cols, rows) {
                Ok(()) => debug!("Session {} resized to {}x{}", self.name, cols, rows),
                Err(e) => warn!("Session {}: resize failed: {}", self.name, e),
            }
        }
    }

    /// Stop the pumps and close the channel.
    ///
    /// Idempotent. Returns false if a pump failed to exit within the stop
    /// timeout (it is left detached).
    pub fn stop(&mut self) -> bool {
        let state = self.state();
        if matches!(state, SessionState::Idle | SessionState::Closed) && self.channel.is_none() {
            return true;
        }

        set_state(&self.state, SessionState::Stopping);
        self.running.store(false, Ordering::SeqCst);
        // Wakes the input pump
        self.input_tx = None;

        let deadline = Instant::now() + self.stop_timeout;
        let mut clean = true;
        for (label, handle) in [
            ("output", self.output_thread.take()),
            ("input", self.input_thread.take()),
        ] {
            if let Some(handle) = handle {
                if !join_until(handle, deadline) {
                    warn!("Session {}: {} pump did not exit in time", self.name, label);
                    clean = false;
                }
            }
        }

        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.close() {
                debug!("Session {}: close channel: {}", self.name, e);
            }
        }

        set_state(&self.state, SessionState::Closed);
        info!("Session {} closed", self.name);
        clean
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Join a thread if it finishes before `deadline`.
fn join_until(handle: JoinHandle<()>, deadline: Instant) -> bool {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
    handle.join().is_ok()
}

fn output_pump(
    channel: Arc<dyn ShellChannel>,
    running: Arc<AtomicBool>,
    state: Arc<Mutex<SessionState>>,
    sink: OutputSink,
) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    let mut decoder = Utf8Decoder::default();

    while running.load(Ordering::SeqCst) {
        match channel.read(&mut buffer) {
            Ok(ReadOutcome::Data(n)) => {
                let text = decoder.decode(&buffer[..n]);
                if !text.is_empty() {
                    sink(SessionEvent::Output(text));
                }
            }
            Ok(ReadOutcome::Idle) => thread::sleep(IDLE_BACKOFF),
            Ok(ReadOutcome::Closed) => {
                // A stop() in progress closes the channel under us; that is not an exit event
                if running.swap(false, Ordering::SeqCst) {
                    let tail = decoder.finish();
                    if !tail.is_empty() {
                        sink(SessionEvent::Output(tail));
                    }
                    mark_stopping(&state);
                    sink(SessionEvent::Exited);
                }
                break;
            }
            Err(e) => {
                if running.swap(false, Ordering::SeqCst) {
                    warn!("Output pump stopping: {}", e);
                    mark_stopping(&state);
                    sink(SessionEvent::Error(e.to_string()));
                }
                break;
            }
        }
    }
    debug!("Output pump exited");
}

fn input_pump(
    channel: Arc<dyn ShellChannel>,
    input_rx: mpsc::Receiver<Vec<u8>>,
    running: Arc<AtomicBool>,
    state: Arc<Mutex<SessionState>>,
    sink: OutputSink,
) {
    loop {
        match input_rx.recv_timeout(INPUT_POLL) {
            Ok(data) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = channel.write_all(&data) {
                    if running.swap(false, Ordering::SeqCst) {
                        warn!("Input pump stopping: {}", e);
                        mark_stopping(&state);
                        sink(SessionEvent::Error(e.to_string()));
                    }
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("Input pump exited");
}
