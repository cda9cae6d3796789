//! The boundary between templates and a document-database driver.
//!
//! [`Template`](crate::Template) never talks to `mongodb` directly; it drives
//! a [`Driver`]. [`MongoClient`](crate::MongoClient) is the production
//! implementation and [`MemoryDriver`](crate::MemoryDriver) runs in-process.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bson::{Bson, Document, Timestamp};
use futures::stream::BoxStream;
use mongodb::options::{
    AggregateOptions, Collation, CountOptions, DeleteOptions, FindOneOptions, FindOptions,
    FullDocumentType, InsertOneOptions, UpdateOptions,
};
use smol_str::SmolStr;

use crate::error::MongoResult;

/// A database and collection pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    /// Database name.
    pub database: SmolStr,
    /// Collection name.
    pub collection: SmolStr,
}

impl Namespace {
    /// Create a namespace.
    pub fn new(database: impl Into<SmolStr>, collection: impl Into<SmolStr>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// What a change stream is opened against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchTarget {
    /// Every database of the deployment.
    Deployment,
    /// One database.
    Database(SmolStr),
    /// One collection.
    Collection(Namespace),
}

impl WatchTarget {
    /// Whether a change in `ns` is visible through this target.
    pub fn covers(&self, database: &str, collection: &str) -> bool {
        match self {
            Self::Deployment => true,
            Self::Database(db) => db == database,
            Self::Collection(ns) => ns.database == database && ns.collection == collection,
        }
    }
}

impl fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deployment => f.write_str("<deployment>"),
            Self::Database(db) => f.write_str(db),
            Self::Collection(ns) => ns.fmt(f),
        }
    }
}

/// Counts reported by an update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOutcome {
    /// Documents matched by the filter.
    pub matched_count: u64,
    /// Documents actually changed.
    pub modified_count: u64,
    /// `_id` of a document inserted by an upsert.
    pub upserted_id: Option<Bson>,
}

/// Everything needed to open a change-stream cursor.
#[derive(Debug, Clone)]
pub struct ChangeStreamRequest {
    /// Scope of the stream.
    pub target: WatchTarget,
    /// Aggregation stages applied to the change events.
    pub pipeline: Vec<Document>,
    /// Resume after this token (an event's `_id`).
    pub resume_after: Option<Document>,
    /// Start after this token; unlike `resume_after` this survives invalidation.
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
}

impl ChangeStreamRequest {
    /// A request for `target` with no pipeline and default cursor options.
    pub fn new(target: WatchTarget) -> Self {
        Self {
            target,
            pipeline: Vec::new(),
            resume_after: None,
            start_after: None,
            start_at_operation_time: None,
            full_document: None,
            batch_size: None,
            max_await_time: None,
            collation: None,
        }
    }
}

/// A change-stream cursor yielding raw change documents.
///
/// Dropping the stream closes the cursor.
pub type ChangeStream = BoxStream<'static, MongoResult<Document>>;

/// Operations a template needs from a driver.
///
/// Every data operation takes an optional session. `None` means the call runs
/// outside any transaction.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Driver session handle with an open transaction.
    type Session: Send + 'static;

    /// Check that the deployment answers.
    async fn ping(&self) -> MongoResult<()>;

    /// Release the connection pool.
    async fn disconnect(&self);

    /// Start a session and begin a transaction on it.
    async fn start_session(&self) -> MongoResult<Self::Session>;

    /// Commit the session's transaction.
    async fn commit_transaction(&self, session: &mut Self::Session) -> MongoResult<()>;

    /// Abort the session's transaction.
    async fn abort_transaction(&self, session: &mut Self::Session) -> MongoResult<()>;

    /// End a session.
    async fn end_session(&self, session: Self::Session);

    /// Insert one document, returning its `_id`.
    async fn insert_one(
        &self,
        session: Option<&mut Self::Session>,
        ns: &Namespace,
        document: Document,
        options: InsertOneOptions,
    ) -> MongoResult<Bson>;

    /// Find the first document matching `filter`.
    async fn find_one(
        &self,
        session: Option<&mut Self::Session>,
        ns: &Namespace,
        filter: Document,
        options: FindOneOptions,
    ) -> MongoResult<Option<Document>>;

    /// Find every document matching `filter`.
    async fn find(
        &self,
        session: Option<&mut Self::Session>,
        ns: &Namespace,
        filter: Document,
        options: FindOptions,
    ) -> MongoResult<Vec<Document>>;

    /// Update documents matching `filter`.
    async fn update(
        &self,
        session: Option<&mut Self::Session>,
        ns: &Namespace,
        filter: Document,
        update: Document,
        many: bool,
        options: UpdateOptions,
    ) -> MongoResult<UpdateOutcome>;

    /// Delete documents matching `filter`, returning how many were removed.
    async fn delete(
        &self,
        session: Option<&mut Self::Session>,
        ns: &Namespace,
        filter: Document,
        many: bool,
        options: DeleteOptions,
    ) -> MongoResult<u64>;

    /// Count documents matching `filter`.
    async fn count_documents(
        &self,
        session: Option<&mut Self::Session>,
        ns: &Namespace,
        filter: Document,
        options: CountOptions,
    ) -> MongoResult<u64>;

    /// Run an aggregation pipeline.
    async fn aggregate(
        &self,
        session: Option<&mut Self::Session>,
        ns: &Namespace,
        pipeline: Vec<Document>,
        options: AggregateOptions,
    ) -> MongoResult<Vec<Document>>;

    /// Open a change stream.
    async fn watch(&self, request: &ChangeStreamRequest) -> MongoResult<ChangeStream>;
}
