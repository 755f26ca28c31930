//! gRPC transport for the activity feed.
//!
//! `ReceiveActivityUpdates` opens one streaming session per call and drains it
//! into the response stream until the client goes away. `GetActivities` is the
//! one-shot per-user query.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::activity::{ActivityEvent, ActivityPayload};
use crate::error::FeedError;
use crate::feed::ActivityFeed;
use crate::session::StreamSession;

/// Generated protobuf types.
#[allow(missing_docs, clippy::pedantic)]
pub mod proto {
    tonic::include_proto!("activities");
}

use proto::activities_service_server::{ActivitiesService, ActivitiesServiceServer};

pub use proto::activities_service_client::ActivitiesServiceClient;

// ----------------------------------------------------------------------------
// Limits (DoS protection)
// ----------------------------------------------------------------------------

/// Maximum number of user ids in one `GetActivities` request.
pub const MAX_USER_IDS: usize = 1024;

/// Maximum length of a single user id, in bytes.
pub const MAX_USER_ID_LEN: usize = 64;

/// Maximum number of concurrently open streaming sessions.
pub const MAX_OPEN_SESSIONS: usize = 4096;

type ActivityStream = ReceiverStream<Result<proto::Activity, Status>>;

/// gRPC service implementation for the activity feed.
#[derive(Debug, Clone)]
pub struct ActivitiesServiceImpl {
    feed: Arc<ActivityFeed>,
    open_sessions: Arc<AtomicUsize>,
}

/// Holds one slot of the open-session count until dropped.
struct SessionSlot(Arc<AtomicUsize>);

impl SessionSlot {
    fn acquire(counter: &Arc<AtomicUsize>) -> Result<Self, Status> {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < MAX_OPEN_SESSIONS).then_some(n + 1))
            .map_err(|_| Status::resource_exhausted("too many open sessions"))?;
        Ok(Self(Arc::clone(counter)))
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ActivitiesServiceImpl {
    /// Serve `feed`.
    #[must_use]
    pub fn new(feed: ActivityFeed) -> Self {
        Self {
            feed: Arc::new(feed),
            open_sessions: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Streaming sessions not yet shut down.
    #[must_use]
    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    /// Wrap in the generated tonic server.
    #[must_use]
    pub fn into_server(self) -> ActivitiesServiceServer<Self> {
        ActivitiesServiceServer::new(self)
    }
}

fn invalid_argument(msg: impl Into<String>) -> Status {
    Status::invalid_argument(msg.into())
}

fn validate_user_ids(user_ids: &[String]) -> Result<(), Status> {
    if user_ids.len() > MAX_USER_IDS {
        return Err(invalid_argument(format!("at most {MAX_USER_IDS} user_ids per request")));
    }
    for id in user_ids {
        if id.is_empty() {
            return Err(invalid_argument("user_id must not be empty"));
        }
        if id.len() > MAX_USER_ID_LEN {
            return Err(invalid_argument("user_id too long"));
        }
    }
    Ok(())
}

/// Map a feed error onto the gRPC status a client sees.
#[must_use]
pub fn status_from_feed_error(err: &FeedError) -> Status {
    match err {
        FeedError::Config { .. } | FeedError::InvalidRequest { .. } => Status::invalid_argument(err.to_string()),
        FeedError::CursorPersist { .. } | FeedError::PollerFailed { .. } => Status::aborted(err.to_string()),
        FeedError::CursorRead { .. } => Status::unavailable(err.to_string()),
        FeedError::Fetch { source, .. }
        | FeedError::SequenceAllocation { source, .. }
        | FeedError::Write { source, .. }
            if source.is_transient() =>
        {
            Status::unavailable(err.to_string())
        }
        _ => Status::internal(err.to_string()),
    }
}

fn to_timestamp(at: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: at.timestamp(),
        nanos: i32::try_from(at.timestamp_subsec_nanos()).unwrap_or(i32::MAX),
    }
}

/// Wire form of an activity.
#[must_use]
pub fn to_proto(event: ActivityEvent) -> proto::Activity {
    use proto::activity::Payload;

    let payload = match event.payload {
        ActivityPayload::Bookmark { film_id } => Payload::Bookmark(proto::Bookmark { film_id }),
        ActivityPayload::Review { film_id, review_text } => {
            Payload::Review(proto::Review { film_id, review_text })
        }
        ActivityPayload::Rating { film_id, rating } => Payload::Rating(proto::Rating { film_id, rating }),
    };

    proto::Activity {
        id: event.id,
        user_id: event.user_id,
        activity_type: event.activity_type.as_i32(),
        created_at: Some(to_timestamp(event.created_at)),
        payload: Some(payload),
    }
}

/// Forward session events to the client until either side ends, then shut the
/// session down.
async fn drain_session(
    mut session: StreamSession,
    tx: mpsc::Sender<Result<proto::Activity, Status>>,
    slot: SessionSlot,
) {
    let session_id = session.id();
    loop {
        let next = tokio::select! {
            biased;
            () = tx.closed() => None,
            next = session.next() => Some(next),
        };

        let Some(next) = next else {
            debug!(%session_id, "subscriber disconnected");
            break;
        };

        let item = match next {
            Some(Ok(event)) => Ok(to_proto(event)),
            Some(Err(err)) => {
                warn!(%session_id, error = %err, "terminating stream with error");
                let _ = tx.send(Err(status_from_feed_error(&err))).await;
                break;
            }
            None => break,
        };

        if tx.send(item).await.is_err() {
            debug!(%session_id, "subscriber disconnected");
            break;
        }
    }

    session.shutdown().await;
    drop(slot);
}

#[tonic::async_trait]
impl ActivitiesService for ActivitiesServiceImpl {
    type ReceiveActivityUpdatesStream = ActivityStream;

    async fn receive_activity_updates(
        &self,
        _request: Request<()>,
    ) -> Result<Response<Self::ReceiveActivityUpdatesStream>, Status> {
        let slot = SessionSlot::acquire(&self.open_sessions)?;
        let session = self
            .feed
            .open_session()
            .await
            .map_err(|e| status_from_feed_error(&e))?;
        info!(session_id = %session.id(), "subscriber attached");

        let (tx, rx) = mpsc::channel(self.feed.config().stream_buffer);
        tokio::spawn(drain_session(session, tx, slot));

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type GetActivitiesStream = ActivityStream;

    async fn get_activities(
        &self,
        request: Request<proto::GetActivitiesRequest>,
    ) -> Result<Response<Self::GetActivitiesStream>, Status> {
        let req = request.into_inner();
        validate_user_ids(&req.user_ids)?;

        let feed = Arc::clone(&self.feed);
        let (tx, rx) = mpsc::channel(self.feed.config().stream_buffer);
        tokio::spawn(async move {
            for user_id in &req.user_ids {
                let events = match feed.user_activities(user_id).await {
                    Ok(events) => events,
                    Err(err) => {
                        warn!(user_id = %user_id, error = %err, "user query failed");
                        let _ = tx.send(Err(status_from_feed_error(&err))).await;
                        return;
                    }
                };
                for event in events {
                    if tx.send(Ok(to_proto(event))).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
