use std::{
    fmt,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use dashmap::{mapref::entry::Entry, DashMap};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::{wrappers::ReceiverStream, Stream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One encoded protocol message, ready to be framed as a single SSE event.
pub type Frame = Arc<str>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(Arc<str>);

impl SessionId {
    fn generate() -> Self {
        Self(Arc::from(Uuid::new_v4().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session registry is shut down")]
    ShutDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    Evicted,
    Unknown,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub evicted: usize,
}

impl DeliveryReport {
    pub(crate) fn record(&mut self, outcome: SendOutcome) {
        match outcome {
            SendOutcome::Delivered => self.delivered += 1,
            SendOutcome::Evicted => self.evicted += 1,
            SendOutcome::Unknown => {}
        }
    }
}

struct SessionEntry {
    sink: mpsc::Sender<Frame>,
    cancellation: CancellationToken,
}

/// Open streaming sessions keyed by [`SessionId`].
///
/// The registry owns the write side of every session. The read side is the
/// [`SessionStream`] handed to the HTTP response; dropping that stream (client
/// disconnect) removes the session and cancels work addressed to it.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionEntry>,
    buffer: usize,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl SessionRegistry {
    pub fn new(buffer: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            buffer: buffer.max(1),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn register(self: &Arc<Self>) -> Result<SessionStream, RegistryError> {
        if self.is_closed() {
            return Err(RegistryError::ShutDown);
        }

        let (sink, receiver) = mpsc::channel(self.buffer);
        let cancellation = self.shutdown.child_token();

        let id = loop {
            let id = SessionId::generate();
            if let Entry::Vacant(slot) = self.sessions.entry(id.clone()) {
                slot.insert(SessionEntry {
                    sink,
                    cancellation,
                });
                break id;
            }
        };

        // close_all may have drained the map between the check above and the insert.
        if self.is_closed() {
            self.remove(&id);
            return Err(RegistryError::ShutDown);
        }

        info!(session_id = %id, open_sessions = self.len(), "session opened");

        Ok(SessionStream {
            id,
            frames: ReceiverStream::new(receiver),
            registry: Arc::clone(self),
        })
    }

    pub fn remove(&self, id: &SessionId) -> bool {
        match self.sessions.remove(id) {
            Some((_, entry)) => {
                entry.cancellation.cancel();
                info!(session_id = %id, open_sessions = self.len(), "session closed");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Token cancelled when the session closes, or a fresh child of the
    /// shutdown token when no such session is open.
    pub fn cancellation_for(&self, id: Option<&SessionId>) -> CancellationToken {
        id.and_then(|id| self.sessions.get(id).map(|entry| entry.cancellation.clone()))
            .unwrap_or_else(|| self.shutdown.child_token())
    }

    /// Best-effort, non-blocking write to one session. Any failure evicts the
    /// session: a closed channel means the client went away, a full one means
    /// it stopped reading.
    pub fn send(&self, id: &SessionId, frame: Frame) -> SendOutcome {
        let Some(entry) = self.sessions.get(id) else {
            return SendOutcome::Unknown;
        };
        let result = entry.sink.try_send(frame);
        drop(entry);

        match result {
            Ok(()) => SendOutcome::Delivered,
            Err(err) => {
                self.evict(id, &err);
                SendOutcome::Evicted
            }
        }
    }

    pub fn fan_out(&self, frame: &Frame) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let mut failed = Vec::new();

        for entry in self.sessions.iter() {
            match entry.sink.try_send(Arc::clone(frame)) {
                Ok(()) => report.record(SendOutcome::Delivered),
                Err(err) => failed.push((entry.key().clone(), err)),
            }
        }

        // Evict only after the iteration guards are released.
        for (id, err) in failed {
            self.evict(&id, &err);
            report.record(SendOutcome::Evicted);
        }

        debug!(
            delivered = report.delivered,
            evicted = report.evicted,
            "fan-out complete"
        );
        report
    }

    /// Ends every open stream, cancels in-flight work, and refuses further
    /// registrations.
    pub fn close_all(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown.cancel();

        let ids: Vec<SessionId> = self
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in &ids {
            self.remove(id);
        }

        info!(closed_sessions = ids.len(), "session registry shut down");
    }

    fn evict(&self, id: &SessionId, err: &TrySendError<Frame>) {
        let reason = match err {
            TrySendError::Full(_) => "buffer full",
            TrySendError::Closed(_) => "stream closed",
        };
        if self.remove(id) {
            warn!(session_id = %id, reason, "session write failed, evicted");
        }
    }
}

/// Read side of a session, consumed as the SSE response body.
pub struct SessionStream {
    id: SessionId,
    frames: ReceiverStream<Frame>,
    registry: Arc<SessionRegistry>,
}

impl SessionStream {
    pub fn id(&self) -> &SessionId {
        &self.id
    }
}

impl Stream for SessionStream {
    type Item = Frame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.frames).poll_next(cx)
    }
}

impl Drop for SessionStream {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}
