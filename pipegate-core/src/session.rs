//! Session registry.
//!
//! Owns every [`Session`] and the sink currently allowed to receive its
//! traffic. A session without a sink is *orphaned*: frames pushed to it are
//! queued (bounded, oldest dropped) and flushed on the next attach. Orphans
//! are discarded once `orphan_grace` has elapsed.
//!
//! Sinks are bounded `mpsc` senders. The registry only ever uses
//! `try_send`, so a stalled consumer never blocks delivery to other sessions.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::dedup::{DedupFilter, DedupKey};
use crate::error::BridgeError;

// ─────────────────────────────────────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────────────────────────────────────

/// Opaque, unguessable session token (UUID v4, simple form).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(Arc<str>);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.into())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

/// A frame written to a session's push stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A JSON-RPC message (reply, error, or unrouted backend traffic).
    Message(Value),
    /// Liveness comment; never queued.
    Keepalive,
}

/// Result of [`SessionRegistry::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Written to the attached sink.
    Delivered,
    /// Held in the session queue (orphaned, sink full, or earlier frames queued).
    Queued,
    /// Already forwarded to this session; skipped.
    Duplicate,
    /// Session does not exist (never did, or was reaped).
    UnknownSession,
}

/// Result of [`SessionRegistry::attach_sink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachOutcome {
    /// Identifies this attachment for [`SessionRegistry::detach_sink`].
    pub generation: u64,
    /// A previous sink was replaced.
    pub superseded: bool,
    /// The session was orphaned after an earlier attachment.
    pub resumed: bool,
    /// Queued frames written to the new sink.
    pub flushed: usize,
}

/// Result of one keepalive pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KeepaliveReport {
    pub pinged: usize,
    pub failed: usize,
    pub detached: Vec<SessionId>,
}

/// Public view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub created: DateTime<Utc>,
    pub active: bool,
    pub interested: bool,
    pub queued: usize,
}

/// Registry tunables.
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub orphan_grace: Duration,
    pub max_queued_messages: usize,
    pub dedup_capacity: usize,
    pub max_keepalive_failures: u32,
}

impl RegistryOptions {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            orphan_grace: config.orphan_grace,
            max_queued_messages: config.max_queued_messages,
            dedup_capacity: config.dedup_capacity,
            max_keepalive_failures: config.max_keepalive_failures,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct AttachedSink {
    tx: mpsc::Sender<Frame>,
    generation: u64,
    keepalive_failures: u32,
}

#[derive(Debug)]
struct Session {
    created: DateTime<Utc>,
    sink: Option<AttachedSink>,
    orphaned_since: Option<Instant>,
    ever_attached: bool,
    queue: VecDeque<Frame>,
    interested: bool,
    dedup: DedupFilter,
}

impl Session {
    fn orphan(&mut self, now: Instant) {
        self.sink = None;
        self.orphaned_since = Some(now);
    }

    /// Append to the queue. Returns true if the oldest frame was dropped.
    fn enqueue(&mut self, frame: Frame, max: usize) -> bool {
        self.queue.push_back(frame);
        if self.queue.len() > max {
            self.queue.pop_front();
            return true;
        }
        false
    }

    /// Move queued frames into the sink until it is full or closed.
    fn flush(&mut self, now: Instant) -> usize {
        let mut sent = 0;
        let mut closed = false;
        if let Some(sink) = self.sink.as_ref() {
            while let Some(frame) = self.queue.pop_front() {
                match sink.tx.try_send(frame) {
                    Ok(()) => sent += 1,
                    Err(TrySendError::Full(frame)) => {
                        self.queue.push_front(frame);
                        break;
                    }
                    Err(TrySendError::Closed(frame)) => {
                        self.queue.push_front(frame);
                        closed = true;
                        break;
                    }
                }
            }
        }
        if closed {
            self.orphan(now);
        }
        sent
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SessionRegistry
// ─────────────────────────────────────────────────────────────────────────────

/// Sole owner of session state.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: parking_lot::Mutex<HashMap<SessionId, Session>>,
    next_generation: AtomicU64,
    options: RegistryOptions,
}

impl SessionRegistry {
    pub fn new(options: RegistryOptions) -> Self {
        Self {
            sessions: parking_lot::Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            options,
        }
    }

    /// Allocate a fresh session with no sink.
    ///
    /// `interested` sessions also receive unrouted backend traffic.
    pub fn open_session(&self, interested: bool) -> SessionId {
        let id = SessionId::generate();
        let session = Session {
            created: Utc::now(),
            sink: None,
            orphaned_since: Some(Instant::now()),
            ever_attached: false,
            queue: VecDeque::new(),
            interested,
            dedup: DedupFilter::new(self.options.dedup_capacity),
        };
        self.sessions.lock().insert(id.clone(), session);
        tracing::debug!(session_id = %id, interested, "session opened");
        id
    }

    /// Bind `sink` to a session, replacing any existing sink, and flush the
    /// orphan queue into it.
    pub fn attach_sink(
        &self,
        id: &SessionId,
        sink: mpsc::Sender<Frame>,
    ) -> Result<AttachOutcome, BridgeError> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| BridgeError::UnknownSession {
                session_id: id.to_string(),
            })?;

        let superseded = session.sink.is_some();
        let resumed = session.ever_attached && session.orphaned_since.is_some();
        if resumed {
            // A reconnect is a new delivery context.
            session.dedup.clear();
        }

        session.sink = Some(AttachedSink {
            tx: sink,
            generation,
            keepalive_failures: 0,
        });
        session.orphaned_since = None;
        session.ever_attached = true;
        let flushed = session.flush(now);

        Ok(AttachOutcome {
            generation,
            superseded,
            resumed,
            flushed,
        })
    }

    /// Detach the sink of `generation`. A stale detach from a superseded
    /// sink is ignored. Returns whether the session became orphaned.
    pub fn detach_sink(&self, id: &SessionId, generation: u64) -> bool {
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(id) else {
            return false;
        };
        match &session.sink {
            Some(sink) if sink.generation == generation => {
                session.orphan(Instant::now());
                true
            }
            _ => false,
        }
    }

    /// Check that a submission targets a live session.
    ///
    /// Never falls back to another session.
    pub fn route_submission(&self, id: &SessionId) -> Result<(), BridgeError> {
        if self.sessions.lock().contains_key(id) {
            Ok(())
        } else {
            Err(BridgeError::UnknownSession {
                session_id: id.to_string(),
            })
        }
    }

    /// Deliver a frame to one session.
    ///
    /// With `key`, the frame passes the session's dedup filter first.
    pub fn push(&self, id: &SessionId, frame: Frame, key: Option<DedupKey>) -> PushOutcome {
        let now = Instant::now();
        let max = self.options.max_queued_messages;
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(id) else {
            return PushOutcome::UnknownSession;
        };

        if let Some(key) = key {
            if !session.dedup.admit(key) {
                return PushOutcome::Duplicate;
            }
        }

        // Earlier frames still queued: keep order.
        if !session.queue.is_empty() {
            if session.enqueue(frame, max) {
                tracing::warn!(session_id = %id, max, "session queue full; dropped oldest frame");
            }
            session.flush(now);
            return PushOutcome::Queued;
        }

        let frame = match session.sink.as_ref() {
            Some(sink) => match sink.tx.try_send(frame) {
                Ok(()) => return PushOutcome::Delivered,
                Err(TrySendError::Full(frame)) => frame,
                Err(TrySendError::Closed(frame)) => {
                    session.orphan(now);
                    frame
                }
            },
            None => frame,
        };

        if session.enqueue(frame, max) {
            tracing::warn!(session_id = %id, max, "session queue full; dropped oldest frame");
        }
        PushOutcome::Queued
    }

    /// Write a keepalive to every attached sink, flushing queues first.
    ///
    /// A closed sink is detached immediately. A full sink counts as a failed
    /// write; after `max_keepalive_failures` consecutive failures it is
    /// detached and later passes skip it.
    pub fn ping_sinks(&self) -> KeepaliveReport {
        let now = Instant::now();
        let max_failures = self.options.max_keepalive_failures;
        let mut report = KeepaliveReport::default();
        let mut sessions = self.sessions.lock();

        for (id, session) in sessions.iter_mut() {
            if session.sink.is_none() {
                continue;
            }
            session.flush(now);
            let Some(sink) = session.sink.as_mut() else {
                report.detached.push(id.clone());
                continue;
            };

            let detach = match sink.tx.try_send(Frame::Keepalive) {
                Ok(()) => {
                    sink.keepalive_failures = 0;
                    report.pinged += 1;
                    false
                }
                Err(TrySendError::Full(_)) => {
                    sink.keepalive_failures += 1;
                    report.failed += 1;
                    tracing::debug!(
                        session_id = %id,
                        failures = sink.keepalive_failures,
                        "keepalive write failed; sink full"
                    );
                    sink.keepalive_failures >= max_failures
                }
                Err(TrySendError::Closed(_)) => true,
            };

            if detach {
                session.orphan(now);
                report.detached.push(id.clone());
            }
        }

        report
    }

    /// Discard sessions orphaned for at least `orphan_grace`.
    pub fn reap_orphans(&self, now: Instant) -> Vec<SessionId> {
        let grace = self.options.orphan_grace;
        let mut reaped = Vec::new();
        self.sessions.lock().retain(|id, session| match session.orphaned_since {
            Some(since) if now.saturating_duration_since(since) >= grace => {
                if !session.queue.is_empty() {
                    tracing::debug!(session_id = %id, discarded = session.queue.len(), "discarding queued frames of expired session");
                }
                reaped.push(id.clone());
                false
            }
            _ => true,
        });
        reaped
    }

    /// Drop every sink so that all push streams end. Sessions are kept.
    pub fn close_all(&self) -> usize {
        let now = Instant::now();
        let mut closed = 0;
        for session in self.sessions.lock().values_mut() {
            if session.sink.is_some() {
                session.orphan(now);
                closed += 1;
            }
        }
        closed
    }

    /// Sessions that opted in to unrouted backend traffic.
    pub fn interested_sessions(&self) -> Vec<SessionId> {
        self.sessions
            .lock()
            .iter()
            .filter(|(_, s)| s.interested)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn info(&self, id: &SessionId) -> Option<SessionInfo> {
        self.sessions.lock().get(id).map(|s| SessionInfo {
            id: id.clone(),
            created: s.created,
            active: s.sink.is_some(),
            interested: s.interested,
            queued: s.queue.len(),
        })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn attached_count(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|s| s.sink.is_some())
            .count()
    }
}
