//! In-memory transport fakes for unit tests.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::io::{self, Cursor, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::core::transport::{
    ExecOutput, ReadOutcome, RemoteEntry, RemoteFs, RemoteStat, Result, ShellChannel, Transport,
    TransportError,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// Scripted shell channel. With `echo` on, written input comes back as output.
#[derive(Default)]
pub struct FakeChannel {
    output: Mutex<VecDeque<Vec<u8>>>,
    written: Mutex<Vec<u8>>,
    resizes: Mutex<Vec<(u16, u16)>>,
    pub echo: AtomicBool,
    pub closed: AtomicBool,
    pub remote_eof: AtomicBool,
    pub fail_reads: AtomicBool,
    pub fail_resize: AtomicBool,
    pub close_calls: AtomicUsize,
}

impl FakeChannel {
    pub fn push_output(&self, data: &[u8]) {
        lock(&self.output).push_back(data.to_vec());
    }

    pub fn written(&self) -> Vec<u8> {
        lock(&self.written).clone()
    }

    pub fn resizes(&self) -> Vec<(u16, u16)> {
        lock(&self.resizes).clone()
    }
}

impl ShellChannel for FakeChannel {
    fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(ReadOutcome::Closed);
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(TransportError::Transport("connection reset".to_string()));
        }
        let mut output = lock(&self.output);
        match output.pop_front() {
            Some(chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    output.push_front(chunk[n..].to_vec());
                }
                Ok(ReadOutcome::Data(n))
            }
            None if self.remote_eof.load(Ordering::SeqCst) => Ok(ReadOutcome::Closed),
            None => Ok(ReadOutcome::Idle),
        }
    }

    fn write_all(&self, data: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Transport("channel closed".to_string()));
        }
        lock(&self.written).extend_from_slice(data);
        if self.echo.load(Ordering::SeqCst) {
            self.push_output(data);
        }
        Ok(())
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        if self.fail_resize.load(Ordering::SeqCst) {
            return Err(TransportError::Transport("resize refused".to_string()));
        }
        lock(&self.resizes).push((cols, rows));
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Transport handing out [`FakeChannel`]s and a shared [`MemoryFs`].
#[derive(Default)]
pub struct FakeTransport {
    pub channels: Mutex<Vec<Arc<FakeChannel>>>,
    pub shell_requests: Mutex<Vec<(String, u16, u16)>>,
    pub fail_open: AtomicBool,
    pub fs: Arc<MemoryFs>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn channel(&self, index: usize) -> Arc<FakeChannel> {
        lock(&self.channels)[index].clone()
    }

    pub fn channel_count(&self) -> usize {
        lock(&self.channels).len()
    }
}

impl Transport for FakeTransport {
    fn open_shell(
        &self,
        term_type: &str,
        cols: u16,
        rows: u16,
        _timeout: Duration,
    ) -> Result<Arc<dyn ShellChannel>> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(TransportError::Transport("channel open refused".to_string()));
        }
        lock(&self.shell_requests).push((term_type.to_string(), cols, rows));
        let channel = Arc::new(FakeChannel::default());
        channel.echo.store(true, Ordering::SeqCst);
        lock(&self.channels).push(channel.clone());
        Ok(channel)
    }

    fn open_fs(&self) -> Result<Arc<dyn RemoteFs>> {
        Ok(self.fs.clone())
    }

    fn exec(&self, command: &str, _timeout: Duration) -> Result<ExecOutput> {
        match command.strip_prefix("echo ") {
            Some(rest) => Ok(ExecOutput {
                stdout: format!("{}\n", rest),
                ..Default::default()
            }),
            None => Ok(ExecOutput {
                stderr: format!("{}: command not found\n", command),
                exit_code: 127,
                ..Default::default()
            }),
        }
    }
}

#[derive(Clone, Debug)]
enum Node {
    Dir,
    File(Vec<u8>),
}

type Tree = Arc<Mutex<BTreeMap<String, Node>>>;

/// In-memory remote filesystem rooted at `/`.
pub struct MemoryFs {
    tree: Tree,
    /// Writes to these paths fail
    pub fail_writes: Mutex<HashSet<String>>,
    /// mkdir on these paths fails after someone else created the directory
    pub racing_mkdirs: Mutex<HashSet<String>>,
    pub mkdir_calls: AtomicUsize,
}

impl Default for MemoryFs {
    fn default() -> Self {
        let mut tree = BTreeMap::new();
        tree.insert("/".to_string(), Node::Dir);
        Self {
            tree: Arc::new(Mutex::new(tree)),
            fail_writes: Mutex::new(HashSet::new()),
            racing_mkdirs: Mutex::new(HashSet::new()),
            mkdir_calls: AtomicUsize::new(0),
        }
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

fn not_found(path: &str) -> TransportError {
    TransportError::Io(io::Error::new(io::ErrorKind::NotFound, path.to_string()))
}

impl MemoryFs {
    pub fn add_dir(&self, path: &str) {
        lock(&self.tree).insert(normalize(path), Node::Dir);
    }

    pub fn add_file(&self, path: &str, content: &[u8]) {
        lock(&self.tree).insert(normalize(path), Node::File(content.to_vec()));
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match lock(&self.tree).get(&normalize(path)) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(lock(&self.tree).get(&normalize(path)), Some(Node::Dir))
    }

    fn require_parent_dir(&self, path: &str) -> Result<()> {
        if self.is_dir(&parent_of(path)) {
            Ok(())
        } else {
            Err(not_found(&parent_of(path)))
        }
    }
}

struct MemWriter {
    tree: Tree,
    path: String,
}

impl Write for MemWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut tree = lock(&self.tree);
        match tree.get_mut(&self.path) {
            Some(Node::File(data)) => {
                data.extend_from_slice(buf);
                Ok(buf.len())
            }
            _ => Err(io::Error::new(io::ErrorKind::NotFound, self.path.clone())),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct FailingWriter;

impl Write for FailingWriter {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::Other, "disk quota exceeded"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl RemoteFs for MemoryFs {
    fn list(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let dir = normalize(path);
        if !self.is_dir(&dir) {
            return Err(not_found(&dir));
        }
        let tree = lock(&self.tree);
        Ok(tree
            .iter()
            .filter(|(p, _)| p.as_str() != dir && parent_of(p) == dir)
            .map(|(p, node)| RemoteEntry {
                name: p.rsplit('/').next().unwrap_or_default().to_string(),
                stat: stat_of(node),
            })
            .collect())
    }

    fn stat(&self, path: &str) -> Result<RemoteStat> {
        lock(&self.tree)
            .get(&normalize(path))
            .map(stat_of)
            .ok_or_else(|| not_found(path))
    }

    fn open_read(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        match self.file(path) {
            Some(data) => Ok(Box::new(Cursor::new(data))),
            None => Err(not_found(path)),
        }
    }

    fn open_write(&self, path: &str) -> Result<Box<dyn Write + Send>> {
        let path = normalize(path);
        self.require_parent_dir(&path)?;
        if lock(&self.fail_writes).contains(&path) {
            return Ok(Box::new(FailingWriter));
        }
        lock(&self.tree).insert(path.clone(), Node::File(Vec::new()));
        Ok(Box::new(MemWriter {
            tree: self.tree.clone(),
            path,
        }))
    }

    fn mkdir(&self, path: &str) -> Result<()> {
        self.mkdir_calls.fetch_add(1, Ordering::SeqCst);
        let path = normalize(path);
        self.require_parent_dir(&path)?;
        if lock(&self.racing_mkdirs).remove(&path) {
            self.add_dir(&path);
            return Err(TransportError::Transport(format!("mkdir {}: failure", path)));
        }
        let mut tree = lock(&self.tree);
        if tree.contains_key(&path) {
            return Err(TransportError::Transport(format!("mkdir {}: exists", path)));
        }
        tree.insert(path, Node::Dir);
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<()> {
        match lock(&self.tree).remove(&normalize(path)) {
            Some(_) => Ok(()),
            None => Err(not_found(path)),
        }
    }

    fn rmdir(&self, path: &str) -> Result<()> {
        self.remove(path)
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut tree = lock(&self.tree);
        let node = tree.remove(&normalize(from)).ok_or_else(|| not_found(from))?;
        tree.insert(normalize(to), node);
        Ok(())
    }
}

fn stat_of(node: &Node) -> RemoteStat {
    match node {
        Node::Dir => RemoteStat {
            size: 4096,
            mtime: 0,
            mode: 0o040755,
            is_dir: true,
        },
        Node::File(data) => RemoteStat {
            size: data.len() as u64,
            mtime: 0,
            mode: 0o100644,
            is_dir: false,
        },
    }
}
