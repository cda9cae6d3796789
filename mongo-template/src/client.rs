//! MongoDB-backed [`Driver`] with built-in connection pooling.
//!
//! ```rust,ignore
//! let config = MongoConfig::builder()
//!     .uri("mongodb://localhost:27017")
//!     .max_pool_size(20)
//!     .build()?;
//! let client = MongoClient::new(config).await?;
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use bson::{Bson, Document, doc};
use futures::{StreamExt, TryStreamExt};
use mongodb::options::{
    AggregateOptions, ChangeStreamOptions, CountOptions, DeleteOptions, FindOneOptions,
    FindOptions, InsertOneOptions, UpdateOptions,
};
use mongodb::change_stream::event::ResumeToken;
use mongodb::{Client, ClientSession, Collection};
use tracing::{debug, info};

use crate::config::MongoConfig;
use crate::driver::{
    ChangeStream, ChangeStreamRequest, Driver, Namespace, UpdateOutcome, WatchTarget,
};
use crate::error::{MongoError, MongoResult};

/// A MongoDB client with connection pooling.
///
/// The MongoDB driver pools connections internally; cloning a `MongoClient`
/// shares the pool.
#[derive(Clone)]
pub struct MongoClient {
    client: Client,
    config: Arc<MongoConfig>,
}

impl MongoClient {
    /// Connect using `config`.
    pub async fn new(config: MongoConfig) -> MongoResult<Self> {
        let options = config.to_client_options().await?;

        let client = Client::with_options(options)
            .map_err(|e| MongoError::config(format!("failed to create client: {}", e)))?;

        info!(uri = %config.uri, "MongoDB client created");

        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }

    /// Wrap an already configured driver client.
    pub fn from_client(client: Client) -> Self {
        Self {
            client,
            config: Arc::new(MongoConfig::default()),
        }
    }

    /// Get the underlying MongoDB client.
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the configuration.
    pub fn config(&self) -> &MongoConfig {
        &self.config
    }

    fn collection(&self, ns: &Namespace) -> Collection<Document> {
        self.client
            .database(&ns.database)
            .collection::<Document>(&ns.collection)
    }
}

#[async_trait]
impl Driver for MongoClient {
    type Session = ClientSession;

    async fn ping(&self) -> MongoResult<()> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await?;
        Ok(())
    }

    async fn disconnect(&self) {
        info!("Shutting down MongoDB client");
        self.client.clone().shutdown().await;
    }

    async fn start_session(&self) -> MongoResult<ClientSession> {
        let mut session = self.client.start_session(None).await?;
        session.start_transaction(None).await?;
        Ok(session)
    }

    async fn commit_transaction(&self, session: &mut ClientSession) -> MongoResult<()> {
        session.commit_transaction().await?;
        Ok(())
    }

    async fn abort_transaction(&self, session: &mut ClientSession) -> MongoResult<()> {
        session.abort_transaction().await?;
        Ok(())
    }

    async fn end_session(&self, session: ClientSession) {
        // Dropping returns the server session to the pool.
        drop(session);
    }

    async fn insert_one(
        &self,
        session: Option<&mut ClientSession>,
        ns: &Namespace,
        document: Document,
        options: InsertOneOptions,
    ) -> MongoResult<Bson> {
        let coll = self.collection(ns);
        let result = match session {
            Some(session) => {
                coll.insert_one_with_session(document, options, session)
                    .await?
            }
            None => coll.insert_one(document, options).await?,
        };
        Ok(result.inserted_id)
    }

    async fn find_one(
        &self,
        session: Option<&mut ClientSession>,
        ns: &Namespace,
        filter: Document,
        options: FindOneOptions,
    ) -> MongoResult<Option<Document>> {
        let coll = self.collection(ns);
        let found = match session {
            Some(session) => coll.find_one_with_session(filter, options, session).await?,
            None => coll.find_one(filter, options).await?,
        };
        Ok(found)
    }

    async fn find(
        &self,
        session: Option<&mut ClientSession>,
        ns: &Namespace,
        filter: Document,
        options: FindOptions,
    ) -> MongoResult<Vec<Document>> {
        let coll = self.collection(ns);
        match session {
            Some(session) => {
                let mut cursor = coll.find_with_session(filter, options, session).await?;
                let mut docs = Vec::new();
                while let Some(doc) = cursor.next(session).await {
                    docs.push(doc?);
                }
                Ok(docs)
            }
            None => Ok(coll.find(filter, options).await?.try_collect().await?),
        }
    }

    async fn update(
        &self,
        session: Option<&mut ClientSession>,
        ns: &Namespace,
        filter: Document,
        update: Document,
        many: bool,
        options: UpdateOptions,
    ) -> MongoResult<UpdateOutcome> {
        let coll = self.collection(ns);
        let result = match (session, many) {
            (Some(session), false) => {
                coll.update_one_with_session(filter, update, options, session)
                    .await?
            }
            (Some(session), true) => {
                coll.update_many_with_session(filter, update, options, session)
                    .await?
            }
            (None, false) => coll.update_one(filter, update, options).await?,
            (None, true) => coll.update_many(filter, update, options).await?,
        };
        Ok(UpdateOutcome {
            matched_count: result.matched_count,
            modified_count: result.modified_count,
            upserted_id: result.upserted_id,
        })
    }

    async fn delete(
        &self,
        session: Option<&mut ClientSession>,
        ns: &Namespace,
        filter: Document,
        many: bool,
        options: DeleteOptions,
    ) -> MongoResult<u64> {
        let coll = self.collection(ns);
        let result = match (session, many) {
            (Some(session), false) => coll.delete_one_with_session(filter, options, session).await?,
            (Some(session), true) => coll.delete_many_with_session(filter, options, session).await?,
            (None, false) => coll.delete_one(filter, options).await?,
            (None, true) => coll.delete_many(filter, options).await?,
        };
        Ok(result.deleted_count)
    }

    async fn count_documents(
        &self,
        session: Option<&mut ClientSession>,
        ns: &Namespace,
        filter: Document,
        options: CountOptions,
    ) -> MongoResult<u64> {
        let coll = self.collection(ns);
        let count = match session {
            Some(session) => {
                coll.count_documents_with_session(filter, options, session)
                    .await?
            }
            None => coll.count_documents(filter, options).await?,
        };
        Ok(count)
    }

    async fn aggregate(
        &self,
        session: Option<&mut ClientSession>,
        ns: &Namespace,
        pipeline: Vec<Document>,
        options: AggregateOptions,
    ) -> MongoResult<Vec<Document>> {
        let coll = self.collection(ns);
        match session {
            Some(session) => {
                let mut cursor = coll.aggregate_with_session(pipeline, options, session).await?;
                let mut docs = Vec::new();
                while let Some(doc) = cursor.next(session).await {
                    docs.push(doc?);
                }
                Ok(docs)
            }
            None => Ok(coll.aggregate(pipeline, options).await?.try_collect().await?),
        }
    }

    async fn watch(&self, request: &ChangeStreamRequest) -> MongoResult<ChangeStream> {
        debug!(target = %request.target, "Opening change stream");

        let options = change_stream_options(request)?;
        let pipeline = request.pipeline.clone();

        let stream = match &request.target {
            WatchTarget::Deployment => self.client.watch(pipeline, options).await?,
            WatchTarget::Database(db) => self.client.database(db).watch(pipeline, options).await?,
            WatchTarget::Collection(ns) => self.collection(ns).watch(pipeline, options).await?,
        };

        Ok(stream
            .with_type::<Document>()
            .map(|item| item.map_err(MongoError::from))
            .boxed())
    }
}

fn change_stream_options(request: &ChangeStreamRequest) -> MongoResult<ChangeStreamOptions> {
    let mut options = ChangeStreamOptions::default();
    options.full_document = request.full_document.clone();
    options.resume_after = request.resume_after.clone().map(resume_token).transpose()?;
    options.start_after = request.start_after.clone().map(resume_token).transpose()?;
    options.start_at_operation_time = request.start_at_operation_time;
    options.batch_size = request.batch_size;
    options.max_await_time = request.max_await_time;
    options.collation = request.collation.clone();
    Ok(options)
}

/// Rebuild a driver resume token from an event's `_id` document.
fn resume_token(token: Document) -> MongoResult<ResumeToken> {
    bson::from_document(token)
        .map_err(|e| MongoError::config(format!("invalid resume token: {}", e)))
}
