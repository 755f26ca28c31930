//! Stream session manager.
//!
//! A session owns one poller task per watched source and the fan-in queue they
//! share. The consumer pulls events with [`StreamSession::next`]; cancellation
//! (explicit or by the subscriber going away) stops every poller and waits for
//! them, bounded by the configured grace period.
//!
//! ```text
//! Starting ──► Streaming ──► Cancelling ──► Terminated
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::{Id as TaskId, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::activity::ActivityEvent;
use crate::config::FeedConfig;
use crate::error::{FeedError, FeedResult};
use crate::fanin::{self, FanInReceiver};
use crate::feed::SourceSet;
use crate::poller::{PollerConfig, PollerStats, SourcePoller};
use crate::record::SourceKind;
use crate::storage::CursorStore;

/// Unique identifier for a session.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Create a new random session id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Pollers are being created.
    Starting,
    /// Events are being delivered.
    Streaming,
    /// Pollers have been told to stop; waiting for them.
    Cancelling,
    /// Terminal. Nothing more is delivered.
    Terminated,
}

/// How a poller task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollerExit {
    /// Returned normally after cancellation.
    Stopped(PollerStats),
    /// Returned a fatal error.
    Failed(String),
    /// Panicked or was aborted.
    Crashed(String),
}

/// Outcome of a session shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Poller tasks observed terminated within the grace period.
    pub joined: usize,
    /// Poller tasks that had to be aborted after the grace period.
    pub aborted: usize,
    /// Poller tasks that could not be observed even after abort.
    pub detached: usize,
}

type PollerOutput = (SourceKind, FeedResult<PollerStats>);

enum Step {
    Cancelled,
    Joined(Result<(TaskId, PollerOutput), JoinError>),
    Event(Option<ActivityEvent>),
}

/// One subscriber's streaming session.
pub struct StreamSession {
    id: SessionId,
    state: SessionState,
    receiver: FanInReceiver,
    tasks: JoinSet<PollerOutput>,
    task_kinds: HashMap<TaskId, SourceKind>,
    exits: Vec<(SourceKind, PollerExit)>,
    cancel: CancellationToken,
    shutdown_grace: Duration,
}

impl StreamSession {
    /// Start a session: one poller per configured source, all feeding one queue.
    ///
    /// Every source's cursor is read before any poller is spawned, so an
    /// unreachable cursor store fails the session up front.
    ///
    /// # Errors
    /// - `Config`: invalid configuration
    /// - `SourceNotRegistered`: a configured source has no document source
    /// - `CursorRead`: the cursor store is unavailable
    pub async fn start(config: &FeedConfig, sources: &SourceSet, cursors: Arc<dyn CursorStore>) -> FeedResult<Self> {
        config.validate()?;

        let id = SessionId::new();
        let kinds = config.unique_sources();
        debug!(session_id = %id, state = ?SessionState::Starting, sources = ?kinds, "starting session");

        let mut pollers = Vec::with_capacity(kinds.len());
        for kind in &kinds {
            let source = sources.get(*kind).ok_or(FeedError::SourceNotRegistered { kind: *kind })?;
            let poller_config = PollerConfig::new(&config.namespace, *kind, config.batch_size, config.poll_interval);
            let mut poller = SourcePoller::new(poller_config, source, Arc::clone(&cursors));
            let cursor = poller.load_cursor().await?;
            debug!(session_id = %id, source = %kind, cursor = %cursor, "resuming from cursor");
            pollers.push(poller);
        }

        let (sender, receiver) = fanin::bounded(config.queue_capacity);
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();
        let mut task_kinds = HashMap::with_capacity(pollers.len());
        for poller in pollers {
            let kind = poller.kind();
            let sender = sender.clone();
            let cancel = cancel.child_token();
            let handle = tasks.spawn(async move { (kind, poller.run(sender, cancel).await) });
            task_kinds.insert(handle.id(), kind);
        }
        drop(sender);

        info!(session_id = %id, sources = ?kinds, "session streaming");
        Ok(Self {
            id,
            state: SessionState::Streaming,
            receiver,
            tasks,
            task_kinds,
            exits: Vec::new(),
            cancel,
            shutdown_grace: config.shutdown_grace,
        })
    }

    /// Session id.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Token that cancels this session when fired.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request cancellation. The next `next` call performs the shutdown.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Number of poller tasks not yet observed terminated.
    #[must_use]
    pub fn running_pollers(&self) -> usize {
        self.tasks.len()
    }

    /// How each finished poller ended.
    #[must_use]
    pub fn exits(&self) -> &[(SourceKind, PollerExit)] {
        &self.exits
    }

    /// Next event in delivery order.
    ///
    /// Returns `None` once the session is cancelled or terminated, and
    /// `Some(Err(_))` exactly once when a poller fails fatally; the session is
    /// torn down before that error is returned.
    pub async fn next(&mut self) -> Option<FeedResult<ActivityEvent>> {
        loop {
            if self.state != SessionState::Streaming {
                return None;
            }

            let step = tokio::select! {
                biased;
                () = self.cancel.cancelled() => Step::Cancelled,
                Some(joined) = self.tasks.join_next_with_id() => Step::Joined(joined),
                event = self.receiver.get(&self.cancel) => Step::Event(event),
            };

            match step {
                Step::Cancelled | Step::Event(None) => {
                    self.shutdown().await;
                    return None;
                }
                Step::Event(Some(event)) => return Some(Ok(event)),
                Step::Joined(joined) => {
                    if let Some(err) = self.record_exit(joined) {
                        error!(session_id = %self.id, error = %err, "tearing down session");
                        self.shutdown().await;
                        return Some(Err(err));
                    }
                }
            }
        }
    }

    /// Cancel every poller and wait for them, bounded by the grace period.
    ///
    /// Idempotent; the session is `Terminated` afterwards.
    pub async fn shutdown(&mut self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        if self.state == SessionState::Terminated {
            return report;
        }

        self.state = SessionState::Cancelling;
        self.cancel.cancel();
        self.receiver.close();

        let grace = self.shutdown_grace;
        // Counted outside the timed future so a timeout keeps the tally.
        let drained = tokio::time::timeout(grace, async {
            while let Some(res) = self.tasks.join_next_with_id().await {
                self.record_exit(res);
                report.joined += 1;
            }
        })
        .await;

        if drained.is_err() {
            report.aborted = self.tasks.len();
            warn!(
                session_id = %self.id,
                remaining = report.aborted,
                grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                "pollers did not stop within grace period, aborting"
            );
            self.tasks.abort_all();
            let drained = tokio::time::timeout(grace, async {
                while let Some(res) = self.tasks.join_next_with_id().await {
                    self.record_exit(res);
                }
            })
            .await;
            if drained.is_err() {
                report.detached = self.tasks.len();
                error!(session_id = %self.id, detached = report.detached, "abandoning unresponsive pollers");
                self.tasks.detach_all();
            }
        }

        self.state = SessionState::Terminated;
        info!(
            session_id = %self.id,
            joined = report.joined,
            aborted = report.aborted,
            "session terminated"
        );
        report
    }

    /// Record how a task ended; returns the error that must end the session.
    fn record_exit(&mut self, joined: Result<(TaskId, PollerOutput), JoinError>) -> Option<FeedError> {
        match joined {
            Ok((task_id, (kind, result))) => {
                self.task_kinds.remove(&task_id);
                match result {
                    Ok(stats) => {
                        debug!(session_id = %self.id, source = %kind, delivered = stats.delivered, "poller exited");
                        self.exits.push((kind, PollerExit::Stopped(stats)));
                        None
                    }
                    Err(err) => {
                        self.exits.push((kind, PollerExit::Failed(err.to_string())));
                        Some(err)
                    }
                }
            }
            Err(join_err) => {
                let kind = self.task_kinds.remove(&join_err.id());
                let reason = if join_err.is_panic() {
                    "poller task panicked".to_string()
                } else {
                    "poller task aborted".to_string()
                };
                let Some(kind) = kind else {
                    return Some(FeedError::internal(format!("unknown poller task: {reason}")));
                };
                self.exits.push((kind, PollerExit::Crashed(reason.clone())));
                if self.state == SessionState::Streaming {
                    Some(FeedError::PollerFailed { kind, reason })
                } else {
                    None
                }
            }
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        // JoinSet aborts remaining tasks on drop; cancel first so pollers
        // blocked on the queue or a sleep exit at their next suspension point.
        self.cancel.cancel();
    }
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("running_pollers", &self.tasks.len())
            .field("exits", &self.exits)
            .finish_non_exhaustive()
    }
}
