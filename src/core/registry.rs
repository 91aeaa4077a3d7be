//! Session registry
//!
//! Owns every live [`TerminalSession`] under a unique name and tags each
//! session's events with that name on one shared channel.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::session::{OutputSink, SessionError, SessionEvent, TerminalSession};
use super::transport::Transport;

pub type SessionId = String;

/// A session event tagged with the session's name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEvent {
    pub session: SessionId,
    pub event: SessionEvent,
}

/// Registry of named terminal sessions.
pub struct SessionRegistry {
    sessions: HashMap<SessionId, TerminalSession>,
    /// Creation order
    order: Vec<SessionId>,
    /// Last number used for a generated "Terminal N" name; never reused
    counter: u64,
    events: Sender<RegistryEvent>,
    open_timeout: Duration,
    stop_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(events: Sender<RegistryEvent>) -> Self {
        Self {
            sessions: HashMap::new(),
            order: Vec::new(),
            counter: 0,
            events,
            open_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(1),
        }
    }

    /// A registry plus the receiving end of its event channel.
    pub fn with_channel() -> (Self, Receiver<RegistryEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self::new(tx), rx)
    }

    pub fn with_timeouts(mut self, open: Duration, stop: Duration) -> Self {
        self.open_timeout = open;
        self.stop_timeout = stop;
        self
    }

    /// Create a session on `transport`.
    ///
    /// Without a name the session is called "Terminal N" with N strictly
    /// increasing. The session is created idle; call `start` on it.
    pub fn create(
        &mut self,
        transport: Arc<dyn Transport>,
        name: Option<&str>,
    ) -> Result<SessionId, SessionError> {
        let id = match name {
            Some(name) => {
                if self.sessions.contains_key(name) {
                    return Err(SessionError::DuplicateName(name.to_string()));
                }
                name.to_string()
            }
            None => self.next_name(),
        };

        let sink: OutputSink = {
            let tx = self.events.clone();
            let session = id.clone();
            Arc::new(move |event| {
                // Receiver gone means nobody is listening any more
                let _ = tx.send(RegistryEvent {
                    session: session.clone(),
                    event,
                });
            })
        };

        let session = TerminalSession::new(id.clone(), transport, sink)
            .with_timeouts(self.open_timeout, self.stop_timeout);
        self.sessions.insert(id.clone(), session);
        self.order.push(id.clone());
        debug!("Registered session {}", id);
        Ok(id)
    }

    fn next_name(&mut self) -> SessionId {
        loop {
            self.counter += 1;
            let candidate = format!("Terminal {}", self.counter);
            if !self.sessions.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&TerminalSession> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut TerminalSession> {
        self.sessions.get_mut(id)
    }

    /// Stop and drop a session. Returns false if unknown.
    pub fn remove(&mut self, id: &str) -> bool {
        match self.sessions.remove(id) {
            Some(mut session) => {
                session.stop();
                self.order.retain(|n| n != id);
                info!("Removed session {}", id);
                true
            }
            None => false,
        }
    }

    /// Stop every session, leaving the registry empty.
    pub fn close_all(&mut self) {
        for id in std::mem::take(&mut self.order) {
            if let Some(mut session) = self.sessions.remove(&id) {
                session.stop();
            }
        }
        self.sessions.clear();
    }

    /// Session names in creation order
    pub fn names(&self) -> &[SessionId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}
