//! Typed data access with an implicit session.
//!
//! A [`Template`] owns at most one session at a time. Each operation:
//!
//! 1. makes sure a session with an open transaction exists, replacing the
//!    current one first when the call asks for `force_recreate_session`;
//! 2. runs against that session;
//! 3. unless `disable_auto_close_session` was given, closes the session:
//!    abort when the operation failed, commit otherwise. With
//!    `disable_auto_rollback_session` a failed operation commits too.
//!
//! A session left open by `disable_auto_close_session` carries the following
//! operations until one of them closes it, or until
//! [`Template::close_session`] is called.
//!
//! ```rust,ignore
//! let template = Template::with_config(driver, config);
//!
//! // Two writes, one transaction
//! template
//!     .insert_one(&order, [InsertOneOptions::new().disable_auto_close_session()])
//!     .await?;
//! template.insert_one(&receipt, None).await?;
//! ```
//!
//! The session slot is guarded by an async mutex held for the whole
//! ensure, run and close sequence, so concurrent callers on one template
//! are serialized. Use one template per task for parallel transactions.

use std::path::Path;

use bson::{Bson, Document};
use futures::future::BoxFuture;
use mongodb::options as driver_options;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::client::MongoClient;
use crate::config::{FileConfig, TemplateConfig};
use crate::document::{from_document, to_non_zero_document};
use crate::driver::{Driver, Namespace, UpdateOutcome};
use crate::error::{BulkItemError, BulkWriteFailure, MongoError, MongoResult};
use crate::options::{
    AggregateOptions, CountOptions, DeleteOptions, FindOneOptions, FindOptions,
    InsertManyOptions, InsertOneOptions, SessionPolicy, UpdateOptions, merge_options,
};
use crate::pagination::{PageInput, PageOutput};
use crate::reference::{Reference, resolve_namespace};

/// Session-aware data access over a [`Driver`].
pub struct Template<D: Driver = MongoClient> {
    driver: D,
    config: TemplateConfig,
    session: Mutex<Option<D::Session>>,
}

impl Template<MongoClient> {
    /// Connect using a loaded configuration file.
    pub async fn connect(config: FileConfig) -> MongoResult<Self> {
        let client = MongoClient::new(config.connection).await?;
        Ok(Self::with_config(client, config.template))
    }

    /// Load `path` and connect.
    pub async fn from_file(path: impl AsRef<Path>) -> MongoResult<Self> {
        Self::connect(FileConfig::from_file(path)?).await
    }
}

impl<D: Driver> Template<D> {
    /// Create a template with the default configuration.
    pub fn new(driver: D) -> Self {
        Self::with_config(driver, TemplateConfig::default())
    }

    /// Create a template.
    pub fn with_config(driver: D, config: TemplateConfig) -> Self {
        Self {
            driver,
            config,
            session: Mutex::new(None),
        }
    }

    /// The underlying driver.
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// The template configuration.
    pub fn config(&self) -> &TemplateConfig {
        &self.config
    }

    /// Resolve where documents of `T` live.
    pub fn namespace<T: Reference>(&self) -> MongoResult<Namespace> {
        resolve_namespace::<T>(self.config.database.as_deref())
    }

    // ==================== Sessions ====================

    /// Make sure a session with an open transaction exists.
    ///
    /// With `force_recreate`, an open session is committed and replaced.
    pub async fn start_session(&self, force_recreate: bool) -> MongoResult<()> {
        let mut slot = self.session.lock().await;
        self.ensure_session(&mut slot, force_recreate).await
    }

    /// Close the open session, aborting its transaction when `abort` is set
    /// and committing it otherwise. Does nothing without a session.
    pub async fn close_session(&self, abort: bool) -> MongoResult<()> {
        let mut slot = self.session.lock().await;
        self.close_slot(&mut slot, abort).await
    }

    /// Commit the open transaction and end its session.
    ///
    /// The next operation starts a new session. Does nothing without a
    /// session.
    pub async fn commit_transaction(&self) -> MongoResult<()> {
        let mut slot = self.session.lock().await;
        self.close_slot(&mut slot, false).await
    }

    /// Abort the open transaction and end its session.
    ///
    /// The next operation starts a new session. Does nothing without a
    /// session.
    pub async fn abort_transaction(&self) -> MongoResult<()> {
        let mut slot = self.session.lock().await;
        self.close_slot(&mut slot, true).await
    }

    /// Whether a session is currently open.
    pub async fn has_active_session(&self) -> bool {
        self.session.lock().await.is_some()
    }

    async fn ensure_session(
        &self,
        slot: &mut Option<D::Session>,
        force_recreate: bool,
    ) -> MongoResult<()> {
        if slot.is_some() {
            if !force_recreate {
                return Ok(());
            }
            debug!("Recreating session, committing the open transaction");
            self.close_slot(slot, false).await?;
        }

        match self.driver.start_session().await {
            Ok(session) => {
                *slot = Some(session);
                debug!("Session started");
                Ok(())
            }
            Err(e) if self.config.best_effort_sessions => {
                warn!(error = %e, "Failed to start session, running without a transaction");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn close_slot(&self, slot: &mut Option<D::Session>, abort: bool) -> MongoResult<()> {
        let Some(mut session) = slot.take() else {
            return Ok(());
        };

        let outcome = if abort {
            self.driver.abort_transaction(&mut session).await
        } else {
            self.driver.commit_transaction(&mut session).await
        };
        self.driver.end_session(session).await;

        debug!(abort, ok = outcome.is_ok(), "Session closed");
        outcome
    }

    /// Run `operation` under the session policy.
    ///
    /// A failure to close the session replaces the operation's own result.
    async fn execute<T, F>(
        &self,
        name: &'static str,
        policy: SessionPolicy,
        operation: F,
    ) -> MongoResult<T>
    where
        T: Send,
        F: for<'s> FnOnce(&'s D, Option<&'s mut D::Session>) -> BoxFuture<'s, MongoResult<T>>,
    {
        let mut slot = self.session.lock().await;
        self.ensure_session(&mut slot, policy.force_recreate_session)
            .await?;

        let result = operation(&self.driver, slot.as_mut()).await;

        if policy.disable_auto_close_session {
            return result;
        }

        let abort = result.is_err() && !policy.disable_auto_rollback_session;
        if let Err(close_error) = self.close_slot(&mut slot, abort).await {
            if let Err(operation_error) = &result {
                warn!(
                    operation = name,
                    error = %operation_error,
                    "Operation error superseded by session close failure"
                );
            }
            return Err(close_error);
        }

        result
    }

    // ==================== Writes ====================

    /// Insert one document, returning its `_id`.
    ///
    /// A document whose fields all hold zero values is rejected with
    /// [`MongoError::EmptyDocument`] before a session is touched.
    pub async fn insert_one<T>(
        &self,
        document: &T,
        options: impl IntoIterator<Item = InsertOneOptions>,
    ) -> MongoResult<Bson>
    where
        T: Reference + Serialize + Sync,
    {
        let ns = self.namespace::<T>()?;
        let document = to_non_zero_document(document)?;
        let options = merge_options(options);
        let driver_options = options.to_driver();

        debug!(namespace = %ns, "Executing insert_one");
        self.execute("insert_one", options.session, move |driver, session| {
            Box::pin(async move {
                driver
                    .insert_one(session, &ns, document, driver_options)
                    .await
            })
        })
        .await
    }

    /// Insert every document, one sub-operation each, inside one session.
    ///
    /// Every item is attempted. When any fail, the result is
    /// [`MongoError::Bulk`] listing each failed index, and the session is
    /// closed once according to that combined outcome.
    pub async fn insert_many<T>(
        &self,
        documents: &[T],
        options: impl IntoIterator<Item = InsertManyOptions>,
    ) -> MongoResult<Vec<Bson>>
    where
        T: Reference + Serialize + Sync,
    {
        let ns = self.namespace::<T>()?;
        if documents.is_empty() {
            return Err(MongoError::empty_input("insert_many needs at least one document"));
        }
        let prepared: Vec<MongoResult<Document>> =
            documents.iter().map(to_non_zero_document).collect();
        let options = merge_options(options);
        let driver_options = options.to_driver();

        debug!(namespace = %ns, count = prepared.len(), "Executing insert_many");
        self.execute("insert_many", options.session, move |driver, mut session| {
            Box::pin(async move {
                let mut ids = Vec::with_capacity(prepared.len());
                let mut failure = BulkWriteFailure {
                    errors: Vec::new(),
                    attempted: prepared.len(),
                };

                for (index, document) in prepared.into_iter().enumerate() {
                    let result = match document {
                        Ok(document) => {
                            driver
                                .insert_one(
                                    session.as_deref_mut(),
                                    &ns,
                                    document,
                                    driver_options.clone(),
                                )
                                .await
                        }
                        Err(error) => Err(error),
                    };
                    match result {
                        Ok(id) => ids.push(id),
                        Err(error) => failure.errors.push(BulkItemError { index, error }),
                    }
                }

                if failure.errors.is_empty() {
                    Ok(ids)
                } else {
                    Err(MongoError::Bulk(failure))
                }
            })
        })
        .await
    }

    /// Update the first document of `T` matching `filter`.
    pub async fn update_one<T: Reference>(
        &self,
        filter: Document,
        update: Document,
        options: impl IntoIterator<Item = UpdateOptions>,
    ) -> MongoResult<UpdateOutcome> {
        self.update::<T>("update_one", filter, update, false, options)
            .await
    }

    /// Update every document of `T` matching `filter`.
    pub async fn update_many<T: Reference>(
        &self,
        filter: Document,
        update: Document,
        options: impl IntoIterator<Item = UpdateOptions>,
    ) -> MongoResult<UpdateOutcome> {
        self.update::<T>("update_many", filter, update, true, options)
            .await
    }

    async fn update<T: Reference>(
        &self,
        name: &'static str,
        filter: Document,
        update: Document,
        many: bool,
        options: impl IntoIterator<Item = UpdateOptions>,
    ) -> MongoResult<UpdateOutcome> {
        let ns = self.namespace::<T>()?;
        if update.is_empty() {
            return Err(MongoError::empty_input(format!("{} needs an update document", name)));
        }
        let options = merge_options(options);
        let driver_options = options.to_driver();

        debug!(operation = name, namespace = %ns, filter = %filter, "Executing write");
        self.execute(name, options.session, move |driver, session| {
            Box::pin(async move {
                driver
                    .update(session, &ns, filter, update, many, driver_options)
                    .await
            })
        })
        .await
    }

    /// Delete the first document of `T` matching `filter`.
    pub async fn delete_one<T: Reference>(
        &self,
        filter: Document,
        options: impl IntoIterator<Item = DeleteOptions>,
    ) -> MongoResult<u64> {
        self.delete::<T>("delete_one", filter, false, options).await
    }

    /// Delete every document of `T` matching `filter`.
    pub async fn delete_many<T: Reference>(
        &self,
        filter: Document,
        options: impl IntoIterator<Item = DeleteOptions>,
    ) -> MongoResult<u64> {
        self.delete::<T>("delete_many", filter, true, options).await
    }

    async fn delete<T: Reference>(
        &self,
        name: &'static str,
        filter: Document,
        many: bool,
        options: impl IntoIterator<Item = DeleteOptions>,
    ) -> MongoResult<u64> {
        let ns = self.namespace::<T>()?;
        let options = merge_options(options);
        let driver_options = options.to_driver();

        debug!(operation = name, namespace = %ns, filter = %filter, "Executing write");
        self.execute(name, options.session, move |driver, session| {
            Box::pin(async move {
                driver
                    .delete(session, &ns, filter, many, driver_options)
                    .await
            })
        })
        .await
    }

    // ==================== Reads ====================

    /// Find the first document of `T` matching `filter`.
    ///
    /// Returns [`MongoError::NotFound`] when nothing matches.
    pub async fn find_one<T>(
        &self,
        filter: Document,
        options: impl IntoIterator<Item = FindOneOptions>,
    ) -> MongoResult<T>
    where
        T: Reference + DeserializeOwned,
    {
        let ns = self.namespace::<T>()?;
        let options = merge_options(options);
        let driver_options = options.to_driver();

        debug!(namespace = %ns, filter = %filter, "Executing find_one");
        let document = self
            .execute("find_one", options.session, move |driver, session| {
                Box::pin(async move {
                    driver
                        .find_one(session, &ns, filter, driver_options)
                        .await?
                        .ok_or_else(|| {
                            MongoError::not_found(format!("no document in {} matches", ns))
                        })
                })
            })
            .await?;

        from_document(document)
    }

    /// Find every document of `T` matching `filter`.
    pub async fn find<T>(
        &self,
        filter: Document,
        options: impl IntoIterator<Item = FindOptions>,
    ) -> MongoResult<Vec<T>>
    where
        T: Reference + DeserializeOwned,
    {
        let ns = self.namespace::<T>()?;
        let options = merge_options(options);
        let driver_options = options.to_driver();

        debug!(namespace = %ns, filter = %filter, "Executing find");
        let documents = self
            .execute("find", options.session, move |driver, session| {
                Box::pin(async move { driver.find(session, &ns, filter, driver_options).await })
            })
            .await?;

        documents.into_iter().map(from_document).collect()
    }

    /// Find one page of documents of `T` matching `filter`.
    ///
    /// The total count and the page are read in the same session. `skip`
    /// and `limit` from `options` are replaced by the page window.
    pub async fn find_page<T>(
        &self,
        filter: Document,
        page: PageInput,
        options: impl IntoIterator<Item = FindOptions>,
    ) -> MongoResult<PageOutput<T>>
    where
        T: Reference + DeserializeOwned,
    {
        let ns = self.namespace::<T>()?;
        let options = merge_options(options);

        let mut find_options = options.to_driver();
        find_options.skip = Some(page.skip());
        find_options.limit = page
            .limit()
            .map(|limit| {
                i64::try_from(limit).map_err(|_| {
                    MongoError::config(format!("page size {} is out of range", limit))
                })
            })
            .transpose()?;

        let mut count_options = driver_options::CountOptions::default();
        count_options.hint = options.hint.clone();
        count_options.collation = options.collation.clone();
        count_options.max_time = options.max_time;
        count_options.comment = options.comment.clone();

        debug!(
            namespace = %ns,
            page = page.page(),
            page_size = page.page_size,
            "Executing find_page"
        );
        let (total, documents) = self
            .execute("find_page", options.session, move |driver, mut session| {
                Box::pin(async move {
                    let total = driver
                        .count_documents(
                            session.as_deref_mut(),
                            &ns,
                            filter.clone(),
                            count_options,
                        )
                        .await?;
                    let documents = driver.find(session, &ns, filter, find_options).await?;
                    Ok((total, documents))
                })
            })
            .await?;

        let content = documents
            .into_iter()
            .map(from_document)
            .collect::<MongoResult<Vec<T>>>()?;

        Ok(PageOutput::new(page, total, content))
    }

    /// Count documents of `T` matching `filter`.
    pub async fn count_documents<T: Reference>(
        &self,
        filter: Document,
        options: impl IntoIterator<Item = CountOptions>,
    ) -> MongoResult<u64> {
        let ns = self.namespace::<T>()?;
        let options = merge_options(options);
        let driver_options = options.to_driver();

        debug!(namespace = %ns, filter = %filter, "Executing count_documents");
        self.execute("count_documents", options.session, move |driver, session| {
            Box::pin(async move {
                driver
                    .count_documents(session, &ns, filter, driver_options)
                    .await
            })
        })
        .await
    }

    /// Run an aggregation pipeline over the collection of `T`.
    pub async fn aggregate<T, R>(
        &self,
        pipeline: Vec<Document>,
        options: impl IntoIterator<Item = AggregateOptions>,
    ) -> MongoResult<Vec<R>>
    where
        T: Reference,
        R: DeserializeOwned,
    {
        let ns = self.namespace::<T>()?;
        let options = merge_options(options);
        let driver_options = options.to_driver();

        debug!(namespace = %ns, stages = pipeline.len(), "Executing aggregate");
        let documents = self
            .execute("aggregate", options.session, move |driver, session| {
                Box::pin(async move {
                    driver
                        .aggregate(session, &ns, pipeline, driver_options)
                        .await
                })
            })
            .await?;

        documents.into_iter().map(from_document).collect()
    }

    // ==================== Connection ====================

    /// Check that the deployment answers.
    pub async fn ping(&self) -> MongoResult<()> {
        self.driver.ping().await
    }

    /// Abort any open session and release the connection.
    pub async fn disconnect(&self) {
        let mut slot = self.session.lock().await;
        if slot.is_some() {
            warn!("Disconnecting with an open session, aborting its transaction");
            if let Err(e) = self.close_slot(&mut slot, true).await {
                warn!(error = %e, "Failed to abort transaction on disconnect");
            }
        }
        self.driver.disconnect().await;
        info!("Disconnected");
    }
}

impl<D: Driver + std::fmt::Debug> std::fmt::Debug for Template<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Template")
            .field("driver", &self.driver)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
