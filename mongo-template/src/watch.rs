//! Change-stream dispatch.
//!
//! [`Template::watch_handler`] opens a change stream and hands each event to
//! a handler, one event at a time. Every invocation gets its own
//! [`CancellationToken`], cancelled only when the handler overruns its
//! timeout. The dispatcher then moves on to the next event; a handler that
//! ignores its token keeps running detached until it returns.
//!
//! Cancelling the shutdown token ends the watch before the next event. A
//! handler already running keeps its token live and is awaited as usual.
//!
//! ```rust,ignore
//! let shutdown = CancellationToken::new();
//!
//! let summary = template
//!     .watch_handler(
//!         WatchOptions::for_reference::<Order>()
//!             .handler_timeout(Duration::from_secs(2)),
//!         shutdown.clone(),
//!         |event, cancel| async move {
//!             tokio::select! {
//!                 _ = cancel.cancelled() => {}
//!                 _ = project(event) => {}
//!             }
//!         },
//!     )
//!     .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use bson::{Bson, Document, Timestamp};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use mongodb::options::{Collation, FullDocumentType};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::document::from_document;
use crate::driver::{ChangeStreamRequest, Driver, Namespace, WatchTarget};
use crate::error::{MongoError, MongoResult};
use crate::reference::Reference;
use crate::template::Template;

/// What to do with a change event that cannot be decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DecodeErrorPolicy {
    /// Log the event at `warn` and continue.
    #[default]
    Skip,
    /// End the watch with the decode error.
    Stop,
}

/// Scope and behaviour of a watch.
///
/// With neither name set the whole deployment is watched; a database name
/// alone watches that database. A collection name needs a database name.
#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    /// Database to watch.
    pub database_name: Option<String>,
    /// Collection to watch.
    pub collection_name: Option<String>,
    /// Aggregation stages applied to the change events.
    pub pipeline: Vec<Document>,
    /// Resume after this token.
    pub resume_after: Option<Document>,
    /// Start after this token.
    pub start_after: Option<Document>,
    /// Start at this cluster time.
    pub start_at_operation_time: Option<Timestamp>,
    /// Whether update events carry the full document.
    pub full_document: Option<FullDocumentType>,
    /// Cursor batch size.
    pub batch_size: Option<u32>,
    /// How long the server waits for new events per batch.
    pub max_await_time: Option<Duration>,
    /// Collation used by the pipeline.
    pub collation: Option<Collation>,
    /// Per-event handler timeout; the template default when unset.
    pub handler_timeout: Option<Duration>,
    /// Pause after each event; the template default when unset.
    pub delay: Option<Duration>,
    /// Handling of undecodable events.
    pub decode_error_policy: DecodeErrorPolicy,
}

impl WatchOptions {
    /// Watch the whole deployment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch the collection of `T`, or its database when `T` names no
    /// collection.
    pub fn for_reference<T: Reference>() -> Self {
        Self {
            database_name: T::database_name().map(String::from),
            collection_name: T::collection_name().map(String::from),
            ..Self::default()
        }
    }

    /// Set the database.
    pub fn database_name(mut self, name: impl Into<String>) -> Self {
        self.database_name = Some(name.into());
        self
    }

    /// Set the collection.
    pub fn collection_name(mut self, name: impl Into<String>) -> Self {
        self.collection_name = Some(name.into());
        self
    }

    /// Append a pipeline stage.
    pub fn stage(mut self, stage: Document) -> Self {
        self.pipeline.push(stage);
        self
    }

    /// Resume after an event's token.
    pub fn resume_after(mut self, token: Document) -> Self {
        self.resume_after = Some(token);
        self
    }

    /// Start after an event's token.
    pub fn start_after(mut self, token: Document) -> Self {
        self.start_after = Some(token);
        self
    }

    /// Start at a cluster time.
    pub fn start_at_operation_time(mut self, time: Timestamp) -> Self {
        self.start_at_operation_time = Some(time);
        self
    }

    /// Set the full-document mode.
    pub fn full_document(mut self, mode: FullDocumentType) -> Self {
        self.full_document = Some(mode);
        self
    }

    /// Set the cursor batch size.
    pub fn batch_size(mut self, size: u32) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Set the server-side await time.
    pub fn max_await_time(mut self, duration: Duration) -> Self {
        self.max_await_time = Some(duration);
        self
    }

    /// Set the collation.
    pub fn collation(mut self, collation: Collation) -> Self {
        self.collation = Some(collation);
        self
    }

    /// Set the per-event handler timeout.
    pub fn handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    /// Pause after each event.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Set the decode error policy.
    pub fn decode_error_policy(mut self, policy: DecodeErrorPolicy) -> Self {
        self.decode_error_policy = policy;
        self
    }

    /// The scope these options select.
    pub fn target(&self) -> MongoResult<WatchTarget> {
        let database = self.database_name.as_deref().filter(|name| !name.is_empty());
        let collection = self.collection_name.as_deref().filter(|name| !name.is_empty());

        match (database, collection) {
            (Some(database), Some(collection)) => {
                Ok(WatchTarget::Collection(Namespace::new(database, collection)))
            }
            (Some(database), None) => Ok(WatchTarget::Database(database.into())),
            (None, Some(collection)) => Err(MongoError::config(format!(
                "watching collection `{}` requires a database name",
                collection
            ))),
            (None, None) => Ok(WatchTarget::Deployment),
        }
    }

    /// The driver request these options describe.
    pub fn to_request(&self) -> MongoResult<ChangeStreamRequest> {
        let mut request = ChangeStreamRequest::new(self.target()?);
        request.pipeline = self.pipeline.clone();
        request.resume_after = self.resume_after.clone();
        request.start_after = self.start_after.clone();
        request.start_at_operation_time = self.start_at_operation_time;
        request.full_document = self.full_document.clone();
        request.batch_size = self.batch_size;
        request.max_await_time = self.max_await_time;
        request.collation = self.collation.clone();
        Ok(request)
    }
}

/// Kind of change an event reports.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationType {
    /// A document was inserted.
    Insert,
    /// A document was updated.
    Update,
    /// A document was replaced.
    Replace,
    /// A document was deleted.
    Delete,
    /// A collection was dropped.
    Drop,
    /// A collection was renamed.
    Rename,
    /// A database was dropped.
    DropDatabase,
    /// The stream was invalidated.
    Invalidate,
    /// Any other event type.
    #[serde(other)]
    Other,
}

/// Namespace an event happened in.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EventNamespace {
    /// Database.
    pub db: String,
    /// Collection, absent for database-level events.
    #[serde(default)]
    pub coll: Option<String>,
}

/// An array shortened by an update.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TruncatedArray {
    /// Path of the array.
    pub field: String,
    /// Length after truncation.
    pub new_size: i64,
}

/// Field-level description of an update.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDescription {
    /// Fields set by the update.
    #[serde(default)]
    pub updated_fields: Document,
    /// Fields removed by the update.
    #[serde(default)]
    pub removed_fields: Vec<String>,
    /// Arrays truncated by the update.
    #[serde(default)]
    pub truncated_arrays: Vec<TruncatedArray>,
}

/// A decoded change event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchEvent {
    /// Resume token; pass it to [`WatchOptions::resume_after`] to continue
    /// after this event.
    #[serde(rename = "_id")]
    pub resume_token: Document,
    /// Kind of change.
    pub operation_type: OperationType,
    /// Where it happened.
    #[serde(default)]
    pub ns: Option<EventNamespace>,
    /// `_id` of the changed document.
    #[serde(default)]
    pub document_key: Option<Document>,
    /// Document after the change, when requested or inserted.
    #[serde(default)]
    pub full_document: Option<Document>,
    /// Changed fields of an update.
    #[serde(default)]
    pub update_description: Option<UpdateDescription>,
    /// Cluster time of the change.
    #[serde(default)]
    pub cluster_time: Option<Timestamp>,
}

impl WatchEvent {
    /// `_id` of the changed document.
    pub fn document_id(&self) -> Option<&Bson> {
        self.document_key.as_ref().and_then(|key| key.get("_id"))
    }

    /// Cluster time as a wall-clock instant, to the second.
    pub fn cluster_time_utc(&self) -> Option<DateTime<Utc>> {
        self.cluster_time
            .and_then(|ts| DateTime::from_timestamp(i64::from(ts.time), 0))
    }

    /// Decode the full document.
    pub fn full_document_as<T: DeserializeOwned>(&self) -> MongoResult<Option<T>> {
        self.full_document.clone().map(from_document).transpose()
    }
}

/// Counters reported when a watch ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchSummary {
    /// Events whose handler returned in time.
    pub completed: u64,
    /// Events whose handler overran its timeout.
    pub timed_out: u64,
    /// Events whose handler panicked.
    pub panicked: u64,
    /// Events skipped because they could not be decoded.
    pub skipped: u64,
}

enum Dispatch {
    Completed,
    TimedOut,
    Panicked,
}

impl<D: Driver> Template<D> {
    /// Watch for changes and run `handler` for each event, in order.
    ///
    /// Returns when `shutdown` is cancelled or the stream ends. A stream
    /// error ends the watch with that error; undecodable events follow
    /// [`WatchOptions::decode_error_policy`].
    pub async fn watch_handler<H, Fut>(
        &self,
        options: WatchOptions,
        shutdown: CancellationToken,
        handler: H,
    ) -> MongoResult<WatchSummary>
    where
        H: Fn(WatchEvent, CancellationToken) -> Fut + Send + Sync,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let request = options.to_request()?;
        let timeout = options
            .handler_timeout
            .unwrap_or_else(|| self.config().watch_handler_timeout());
        if timeout.is_zero() {
            return Err(MongoError::config("watch handler timeout must be positive"));
        }
        let delay = options.delay.or_else(|| self.config().watch_delay());

        let watch_id = Uuid::new_v4();
        let mut stream = self.driver().watch(&request).await?;
        info!(%watch_id, target = %request.target, "Change stream opened");

        let mut summary = WatchSummary::default();
        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                next = stream.next() => next,
            };

            let raw = match next {
                Some(Ok(raw)) => raw,
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            };

            let event = match bson::from_document::<WatchEvent>(raw) {
                Ok(event) => event,
                Err(e) => match options.decode_error_policy {
                    DecodeErrorPolicy::Skip => {
                        warn!(%watch_id, error = %e, "Skipping undecodable change event");
                        summary.skipped += 1;
                        continue;
                    }
                    DecodeErrorPolicy::Stop => break Err(e.into()),
                },
            };

            match dispatch(&handler, event, timeout, watch_id).await {
                Dispatch::Completed => summary.completed += 1,
                Dispatch::TimedOut => summary.timed_out += 1,
                Dispatch::Panicked => summary.panicked += 1,
            }

            if let Some(delay) = delay {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        };

        drop(stream);
        debug!(%watch_id, ?summary, "Change stream closed");
        outcome.map(|()| summary)
    }
}

async fn dispatch<H, Fut>(
    handler: &H,
    event: WatchEvent,
    timeout: Duration,
    watch_id: Uuid,
) -> Dispatch
where
    H: Fn(WatchEvent, CancellationToken) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let operation = event.operation_type.clone();
    let token = CancellationToken::new();
    let task = tokio::spawn(handler(event, token.clone()));

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(())) => Dispatch::Completed,
        Ok(Err(e)) => {
            error!(%watch_id, ?operation, error = %e, "Change handler failed");
            Dispatch::Panicked
        }
        Err(_) => {
            token.cancel();
            warn!(
                %watch_id,
                ?operation,
                timeout_ms = timeout.as_millis() as u64,
                "Change handler timed out, cancelling it"
            );
            Dispatch::TimedOut
        }
    }
}
