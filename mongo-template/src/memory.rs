//! In-process [`Driver`] implementation.
//!
//! `MemoryDriver` keeps committed documents per namespace and gives each
//! session a private copy of every namespace it writes to. Commit publishes
//! the copies and appends change events to a log; abort throws them away.
//! Writes issued without a session apply immediately.
//!
//! A namespace changed by anyone else after a session copied it makes that
//! session's commit fail with a write conflict, and the transaction is
//! aborted.
//!
//! It understands a useful subset of the query language:
//! - filters: field equality (dotted paths allowed) and `$eq`, `$ne`, `$in`,
//!   `$nin`, `$exists`, `$gt`, `$gte`, `$lt`, `$lte`
//! - updates: `$set`, `$unset`, `$inc`, or a replacement document
//! - find: `sort`, `skip`, `limit`
//! - aggregate and change-stream pipelines: `$match`, `$sort`, `$skip`,
//!   `$limit`, `$count`
//!
//! Change streams are a snapshot of the change log at open time, so a watch
//! ends once it has replayed every matching event.
//!
//! Every call is journaled as a [`DriverCall`] and any call can be made to
//! fail once with [`MemoryDriver::fail_next`].

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bson::{Bson, Document, Timestamp, doc, oid::ObjectId};
use futures::StreamExt;
use mongodb::options::{
    AggregateOptions, CountOptions, DeleteOptions, FindOneOptions, FindOptions,
    InsertOneOptions, UpdateOptions,
};
use parking_lot::Mutex;
use tracing::trace;

use crate::driver::{
    ChangeStream, ChangeStreamRequest, Driver, Namespace, UpdateOutcome, WatchTarget,
};
use crate::error::{MongoError, MongoResult};

/// A call received by a [`MemoryDriver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    /// `ping`.
    Ping,
    /// `disconnect`.
    Disconnect,
    /// A session was started with the given id.
    StartSession(u64),
    /// Commit on the given session.
    CommitTransaction(u64),
    /// Abort on the given session.
    AbortTransaction(u64),
    /// The given session was ended.
    EndSession(u64),
    /// A data operation.
    Operation {
        /// Operation name, e.g. `insert_one`.
        name: &'static str,
        /// Target namespace.
        namespace: Namespace,
        /// Session the operation ran in.
        session: Option<u64>,
    },
    /// A change stream was opened.
    Watch(WatchTarget),
}

impl DriverCall {
    /// Whether this call touched data (as opposed to session bookkeeping).
    pub fn is_operation(&self) -> bool {
        matches!(self, Self::Operation { .. })
    }
}

/// A call that can be made to fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    /// `start_session`.
    StartSession,
    /// `commit_transaction`.
    CommitTransaction,
    /// `abort_transaction`.
    AbortTransaction,
    /// A data operation by name (`insert_one`, `find`, `watch`, ...).
    Operation(&'static str),
}

/// Lifecycle of the transaction carried by a [`MemorySession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Open and accepting writes.
    Active,
    /// Committed; writes were published.
    Committed,
    /// Aborted; writes were discarded.
    Aborted,
}

/// Session handle of a [`MemoryDriver`].
#[derive(Debug)]
pub struct MemorySession {
    id: u64,
    state: TransactionState,
    staged: HashMap<Namespace, Vec<Document>>,
    versions: HashMap<Namespace, u64>,
    pending: Vec<PendingChange>,
}

impl MemorySession {
    /// Session id, as journaled in [`DriverCall`]s.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current transaction state.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    fn discard(&mut self) {
        self.staged.clear();
        self.versions.clear();
        self.pending.clear();
    }

    fn ensure_active(&self) -> MongoResult<()> {
        match self.state {
            TransactionState::Active => Ok(()),
            TransactionState::Committed => Err(MongoError::session(format!(
                "transaction of session {} was already committed",
                self.id
            ))),
            TransactionState::Aborted => Err(MongoError::session(format!(
                "transaction of session {} was already aborted",
                self.id
            ))),
        }
    }
}

#[derive(Debug, Clone)]
struct PendingChange {
    ns: Namespace,
    operation: &'static str,
    key: Bson,
    full_document: Option<Document>,
    update_description: Option<Document>,
}

#[derive(Debug, Default)]
struct MemoryState {
    collections: HashMap<Namespace, Vec<Document>>,
    changes: Vec<Document>,
    journal: Vec<DriverCall>,
    failures: Vec<FailPoint>,
    versions: HashMap<Namespace, u64>,
    next_session: u64,
    open_sessions: usize,
}

impl MemoryState {
    fn version(&self, ns: &Namespace) -> u64 {
        self.versions.get(ns).copied().unwrap_or_default()
    }

    fn bump(&mut self, ns: &Namespace) {
        *self.versions.entry(ns.clone()).or_default() += 1;
    }

    fn take_failure(&mut self, point: FailPoint) -> bool {
        match self.failures.iter().position(|p| *p == point) {
            Some(index) => {
                self.failures.remove(index);
                true
            }
            None => false,
        }
    }

    fn operation(
        &mut self,
        name: &'static str,
        ns: &Namespace,
        session: Option<&MemorySession>,
    ) -> MongoResult<()> {
        self.journal.push(DriverCall::Operation {
            name,
            namespace: ns.clone(),
            session: session.map(|s| s.id),
        });
        if self.take_failure(FailPoint::Operation(name)) {
            return Err(MongoError::query(format!("injected failure in {}", name)));
        }
        if let Some(session) = session {
            session.ensure_active()?;
        }
        Ok(())
    }

    fn publish(&mut self, pending: Vec<PendingChange>) {
        let time = chrono::Utc::now().timestamp().max(0) as u32;

        for change in pending {
            let seq = self.changes.len() as u32 + 1;
            let mut event = doc! {
                "_id": { "_data": format!("{:016x}", seq) },
                "operationType": change.operation,
                "clusterTime": Bson::Timestamp(Timestamp { time, increment: seq }),
                "ns": { "db": change.ns.database.as_str(), "coll": change.ns.collection.as_str() },
                "documentKey": { "_id": change.key },
            };
            if let Some(full) = change.full_document {
                event.insert("fullDocument", full);
            }
            if let Some(description) = change.update_description {
                event.insert("updateDescription", description);
            }
            self.changes.push(event);
        }
    }

    fn snapshot(&self, session: Option<&MemorySession>, ns: &Namespace) -> Vec<Document> {
        session
            .and_then(|s| s.staged.get(ns))
            .or_else(|| self.collections.get(ns))
            .cloned()
            .unwrap_or_default()
    }
}

/// In-process driver with transactional sessions and a change log.
///
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryDriver {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDriver {
    /// Create an empty driver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store documents as committed data, bypassing sessions and the journal.
    pub fn seed(&self, ns: &Namespace, documents: impl IntoIterator<Item = Document>) {
        let mut state = self.state.lock();
        state
            .collections
            .entry(ns.clone())
            .or_default()
            .extend(documents);
        state.bump(ns);
    }

    /// Committed documents of a namespace.
    pub fn documents(&self, ns: &Namespace) -> Vec<Document> {
        self.state.lock().snapshot(None, ns)
    }

    /// Append a raw change event, delivered to every later watch whose scope
    /// covers it. Events without an `ns` field reach every watch.
    pub fn push_change(&self, event: Document) {
        self.state.lock().changes.push(event);
    }

    /// The change log.
    pub fn changes(&self) -> Vec<Document> {
        self.state.lock().changes.clone()
    }

    /// Every call received so far.
    pub fn calls(&self) -> Vec<DriverCall> {
        self.state.lock().journal.clone()
    }

    /// Forget the journal.
    pub fn clear_calls(&self) {
        self.state.lock().journal.clear();
    }

    /// Sessions started and not yet ended.
    pub fn open_sessions(&self) -> usize {
        self.state.lock().open_sessions
    }

    /// Make the next matching call fail.
    pub fn fail_next(&self, point: FailPoint) {
        self.state.lock().failures.push(point);
    }

    /// Run `write` against the documents `session` sees for `ns`.
    ///
    /// Inside a session the write lands in the session's private copy;
    /// without one it is committed and published right away.
    fn write<R>(
        &self,
        name: &'static str,
        session: Option<&mut MemorySession>,
        ns: &Namespace,
        write: impl FnOnce(&mut Vec<Document>, &mut Vec<PendingChange>) -> MongoResult<R>,
    ) -> MongoResult<R> {
        let mut state = self.state.lock();
        state.operation(name, ns, session.as_deref())?;

        match session {
            Some(session) => {
                if !session.staged.contains_key(ns) {
                    let committed = state.collections.get(ns).cloned().unwrap_or_default();
                    session.staged.insert(ns.clone(), committed);
                    session.versions.insert(ns.clone(), state.version(ns));
                }
                let docs = session
                    .staged
                    .get_mut(ns)
                    .ok_or_else(|| MongoError::Internal("staged namespace vanished".into()))?;
                write(docs, &mut session.pending)
            }
            None => {
                let mut pending = Vec::new();
                let result = {
                    let docs = state.collections.entry(ns.clone()).or_default();
                    write(docs, &mut pending)?
                };
                state.bump(ns);
                state.publish(pending);
                Ok(result)
            }
        }
    }

    fn read(
        &self,
        name: &'static str,
        session: Option<&MemorySession>,
        ns: &Namespace,
    ) -> MongoResult<Vec<Document>> {
        let mut state = self.state.lock();
        state.operation(name, ns, session)?;
        Ok(state.snapshot(session, ns))
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    type Session = MemorySession;

    async fn ping(&self) -> MongoResult<()> {
        let mut state = self.state.lock();
        state.journal.push(DriverCall::Ping);
        if state.take_failure(FailPoint::Operation("ping")) {
            return Err(MongoError::query("injected failure in ping"));
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.state.lock().journal.push(DriverCall::Disconnect);
    }

    async fn start_session(&self) -> MongoResult<MemorySession> {
        let mut state = self.state.lock();
        state.next_session += 1;
        let id = state.next_session;
        state.journal.push(DriverCall::StartSession(id));

        if state.take_failure(FailPoint::StartSession) {
            return Err(MongoError::session("injected failure in start_session"));
        }

        state.open_sessions += 1;
        trace!(session = id, "memory session started");

        Ok(MemorySession {
            id,
            state: TransactionState::Active,
            staged: HashMap::new(),
            versions: HashMap::new(),
            pending: Vec::new(),
        })
    }

    async fn commit_transaction(&self, session: &mut MemorySession) -> MongoResult<()> {
        let mut state = self.state.lock();
        state.journal.push(DriverCall::CommitTransaction(session.id));

        if state.take_failure(FailPoint::CommitTransaction) {
            return Err(MongoError::session("injected failure in commit_transaction"));
        }
        session.ensure_active()?;

        let conflict = session
            .versions
            .iter()
            .find(|(ns, base)| state.version(ns) != **base)
            .map(|(ns, _)| ns.clone());
        if let Some(ns) = conflict {
            session.discard();
            session.state = TransactionState::Aborted;
            return Err(MongoError::session(format!(
                "write conflict on {}, transaction of session {} aborted",
                ns, session.id
            )));
        }

        for (ns, docs) in session.staged.drain() {
            state.bump(&ns);
            state.collections.insert(ns, docs);
        }
        session.versions.clear();
        state.publish(std::mem::take(&mut session.pending));
        session.state = TransactionState::Committed;
        Ok(())
    }

    async fn abort_transaction(&self, session: &mut MemorySession) -> MongoResult<()> {
        let mut state = self.state.lock();
        state.journal.push(DriverCall::AbortTransaction(session.id));

        if state.take_failure(FailPoint::AbortTransaction) {
            return Err(MongoError::session("injected failure in abort_transaction"));
        }
        session.ensure_active()?;

        session.discard();
        session.state = TransactionState::Aborted;
        Ok(())
    }

    async fn end_session(&self, session: MemorySession) {
        let mut state = self.state.lock();
        state.journal.push(DriverCall::EndSession(session.id));
        state.open_sessions = state.open_sessions.saturating_sub(1);

        if session.state == TransactionState::Active {
            trace!(session = session.id, "ending session with open transaction, discarding writes");
        }
    }

    async fn insert_one(
        &self,
        session: Option<&mut MemorySession>,
        ns: &Namespace,
        document: Document,
        _options: InsertOneOptions,
    ) -> MongoResult<Bson> {
        self.write("insert_one", session, ns, |docs, pending| {
            insert_document(docs, pending, ns, document)
        })
    }

    async fn find_one(
        &self,
        session: Option<&mut MemorySession>,
        ns: &Namespace,
        filter: Document,
        options: FindOneOptions,
    ) -> MongoResult<Option<Document>> {
        let docs = self.read("find_one", session.as_deref(), ns)?;
        let mut matched = filter_documents(docs, &filter)?;
        if let Some(sort) = &options.sort {
            sort_documents(&mut matched, sort);
        }
        let skip = options.skip.unwrap_or(0) as usize;
        Ok(matched.into_iter().nth(skip))
    }

    async fn find(
        &self,
        session: Option<&mut MemorySession>,
        ns: &Namespace,
        filter: Document,
        options: FindOptions,
    ) -> MongoResult<Vec<Document>> {
        let docs = self.read("find", session.as_deref(), ns)?;
        let mut matched = filter_documents(docs, &filter)?;
        if let Some(sort) = &options.sort {
            sort_documents(&mut matched, sort);
        }
        Ok(window(
            matched,
            options.skip,
            options.limit.map(|l| l.unsigned_abs()),
        ))
    }

    async fn update(
        &self,
        session: Option<&mut MemorySession>,
        ns: &Namespace,
        filter: Document,
        update: Document,
        many: bool,
        options: UpdateOptions,
    ) -> MongoResult<UpdateOutcome> {
        let name = if many { "update_many" } else { "update_one" };
        let upsert = options.upsert.unwrap_or(false);

        self.write(name, session, ns, |docs, pending| {
            update_documents(docs, pending, ns, &filter, &update, many, upsert)
        })
    }

    async fn delete(
        &self,
        session: Option<&mut MemorySession>,
        ns: &Namespace,
        filter: Document,
        many: bool,
        _options: DeleteOptions,
    ) -> MongoResult<u64> {
        let name = if many { "delete_many" } else { "delete_one" };

        self.write(name, session, ns, |docs, pending| {
            let mut deleted = 0;
            let mut index = 0;
            while index < docs.len() {
                if (many || deleted == 0) && matches_filter(&docs[index], &filter)? {
                    let removed = docs.remove(index);
                    pending.push(PendingChange {
                        ns: ns.clone(),
                        operation: "delete",
                        key: removed.get("_id").cloned().unwrap_or(Bson::Null),
                        full_document: None,
                        update_description: None,
                    });
                    deleted += 1;
                } else {
                    index += 1;
                }
            }
            Ok(deleted)
        })
    }

    async fn count_documents(
        &self,
        session: Option<&mut MemorySession>,
        ns: &Namespace,
        filter: Document,
        options: CountOptions,
    ) -> MongoResult<u64> {
        let docs = self.read("count_documents", session.as_deref(), ns)?;
        let matched = filter_documents(docs, &filter)?;
        Ok(window(matched, options.skip, options.limit).len() as u64)
    }

    async fn aggregate(
        &self,
        session: Option<&mut MemorySession>,
        ns: &Namespace,
        pipeline: Vec<Document>,
        _options: AggregateOptions,
    ) -> MongoResult<Vec<Document>> {
        let docs = self.read("aggregate", session.as_deref(), ns)?;
        run_pipeline(docs, &pipeline)
    }

    async fn watch(&self, request: &ChangeStreamRequest) -> MongoResult<ChangeStream> {
        let events = {
            let mut state = self.state.lock();
            state.journal.push(DriverCall::Watch(request.target.clone()));
            if state.take_failure(FailPoint::Operation("watch")) {
                return Err(MongoError::query("injected failure in watch"));
            }
            state
                .changes
                .iter()
                .filter(|event| event_in_scope(event, &request.target))
                .cloned()
                .collect::<Vec<_>>()
        };

        let mut events: Vec<Document> =
            match request.resume_after.as_ref().or(request.start_after.as_ref()) {
                Some(token) => {
                    let position = events
                        .iter()
                        .position(|event| event.get_document("_id").ok() == Some(token))
                        .ok_or_else(|| MongoError::query("resume token not found in change log"))?;
                    events.into_iter().skip(position + 1).collect()
                }
                None => events,
            };

        if let Some(start) = request.start_at_operation_time {
            events.retain(|event| match event.get("clusterTime") {
                Some(Bson::Timestamp(ts)) => (ts.time, ts.increment) >= (start.time, start.increment),
                _ => true,
            });
        }

        let events = run_pipeline(events, &request.pipeline)?;
        Ok(futures::stream::iter(events.into_iter().map(Ok)).boxed())
    }
}

fn event_in_scope(event: &Document, target: &WatchTarget) -> bool {
    match event.get_document("ns") {
        Ok(ns) => target.covers(
            ns.get_str("db").unwrap_or_default(),
            ns.get_str("coll").unwrap_or_default(),
        ),
        Err(_) => true,
    }
}

fn insert_document(
    docs: &mut Vec<Document>,
    pending: &mut Vec<PendingChange>,
    ns: &Namespace,
    document: Document,
) -> MongoResult<Bson> {
    let (id, document) = match document.get("_id").cloned() {
        Some(id) => (id, document),
        None => {
            let id = Bson::ObjectId(ObjectId::new());
            let mut with_id = doc! { "_id": id.clone() };
            for (key, value) in document {
                with_id.insert(key, value);
            }
            (id, with_id)
        }
    };

    if docs
        .iter()
        .any(|d| d.get("_id").is_some_and(|existing| bson_eq(existing, &id)))
    {
        return Err(MongoError::query(format!(
            "E11000 duplicate key error collection: {} index: _id_ dup key: {}",
            ns, id
        )));
    }

    docs.push(document.clone());
    pending.push(PendingChange {
        ns: ns.clone(),
        operation: "insert",
        key: id.clone(),
        full_document: Some(document),
        update_description: None,
    });
    Ok(id)
}

fn update_documents(
    docs: &mut Vec<Document>,
    pending: &mut Vec<PendingChange>,
    ns: &Namespace,
    filter: &Document,
    update: &Document,
    many: bool,
    upsert: bool,
) -> MongoResult<UpdateOutcome> {
    let mut outcome = UpdateOutcome::default();

    for doc in docs.iter_mut() {
        if !many && outcome.matched_count > 0 {
            break;
        }
        if !matches_filter(doc, filter)? {
            continue;
        }
        outcome.matched_count += 1;

        let before = doc.clone();
        let description = apply_update(doc, update)?;
        if *doc != before {
            outcome.modified_count += 1;
            pending.push(PendingChange {
                ns: ns.clone(),
                operation: if description.is_some() { "update" } else { "replace" },
                key: doc.get("_id").cloned().unwrap_or(Bson::Null),
                full_document: description.is_none().then(|| doc.clone()),
                update_description: description,
            });
        }
    }

    if outcome.matched_count == 0 && upsert {
        let mut seed = Document::new();
        for (key, value) in filter {
            if !key.starts_with('$') && !is_operator_document(value) {
                seed.insert(key.clone(), value.clone());
            }
        }
        apply_update(&mut seed, update)?;
        let id = insert_document(docs, pending, ns, seed)?;
        outcome.upserted_id = Some(id);
    }

    Ok(outcome)
}

/// Apply `update` to `doc`. Returns an update description for operator
/// updates and `None` for replacements.
fn apply_update(doc: &mut Document, update: &Document) -> MongoResult<Option<Document>> {
    let operator_keys = update.keys().filter(|k| k.starts_with('$')).count();

    if operator_keys == 0 {
        let id = doc.get("_id").cloned();
        let mut replacement = Document::new();
        if let Some(id) = id {
            replacement.insert("_id", id);
        }
        for (key, value) in update {
            if key != "_id" {
                replacement.insert(key.clone(), value.clone());
            }
        }
        *doc = replacement;
        return Ok(None);
    }
    if operator_keys != update.len() {
        return Err(MongoError::query(
            "update document mixes operators and plain fields",
        ));
    }

    let mut updated = Document::new();
    let mut removed = Vec::new();

    for (operator, fields) in update {
        let fields = match fields {
            Bson::Document(fields) => fields,
            _ => {
                return Err(MongoError::query(format!(
                    "{} expects a document",
                    operator
                )));
            }
        };

        for (path, value) in fields {
            match operator.as_str() {
                "$set" => {
                    set_path(doc, path, value.clone());
                    updated.insert(path.clone(), value.clone());
                }
                "$unset" => {
                    remove_path(doc, path);
                    removed.push(Bson::String(path.clone()));
                }
                "$inc" => {
                    let current = lookup(doc, path).cloned().unwrap_or(Bson::Int32(0));
                    let sum = add_numbers(&current, value).ok_or_else(|| {
                        MongoError::query(format!("cannot apply $inc to field '{}'", path))
                    })?;
                    set_path(doc, path, sum.clone());
                    updated.insert(path.clone(), sum);
                }
                other => {
                    return Err(MongoError::query(format!(
                        "unsupported update operator {}",
                        other
                    )));
                }
            }
        }
    }

    Ok(Some(doc! {
        "updatedFields": updated,
        "removedFields": removed,
        "truncatedArrays": [],
    }))
}

fn run_pipeline(mut docs: Vec<Document>, pipeline: &[Document]) -> MongoResult<Vec<Document>> {
    for stage in pipeline {
        let (name, spec) = stage
            .iter()
            .next()
            .ok_or_else(|| MongoError::query("empty pipeline stage"))?;

        docs = match (name.as_str(), spec) {
            ("$match", Bson::Document(filter)) => filter_documents(docs, filter)?,
            ("$sort", Bson::Document(sort)) => {
                sort_documents(&mut docs, sort);
                docs
            }
            ("$skip", n) => window(docs, as_f64(n).map(|n| n as u64), None),
            ("$limit", n) => window(docs, None, as_f64(n).map(|n| n as u64)),
            ("$count", Bson::String(field)) => {
                let mut counted = Document::new();
                counted.insert(field.clone(), docs.len() as i64);
                vec![counted]
            }
            (other, _) => {
                return Err(MongoError::query(format!(
                    "unsupported pipeline stage {}",
                    other
                )));
            }
        };
    }
    Ok(docs)
}

fn window(docs: Vec<Document>, skip: Option<u64>, limit: Option<u64>) -> Vec<Document> {
    let skipped = docs.into_iter().skip(skip.unwrap_or(0) as usize);
    match limit {
        Some(limit) if limit > 0 => skipped.take(limit as usize).collect(),
        _ => skipped.collect(),
    }
}

fn filter_documents(docs: Vec<Document>, filter: &Document) -> MongoResult<Vec<Document>> {
    let mut matched = Vec::with_capacity(docs.len());
    for doc in docs {
        if matches_filter(&doc, filter)? {
            matched.push(doc);
        }
    }
    Ok(matched)
}

fn matches_filter(doc: &Document, filter: &Document) -> MongoResult<bool> {
    for (path, expected) in filter {
        let actual = lookup(doc, path);
        let matched = match expected {
            Bson::Document(ops) if is_operator_document(expected) => matches_operators(actual, ops)?,
            _ => actual.is_some_and(|a| bson_eq(a, expected)),
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn matches_operators(actual: Option<&Bson>, ops: &Document) -> MongoResult<bool> {
    for (op, operand) in ops {
        let matched = match op.as_str() {
            "$eq" => actual.is_some_and(|a| bson_eq(a, operand)),
            "$ne" => !actual.is_some_and(|a| bson_eq(a, operand)),
            "$in" | "$nin" => {
                let items = operand
                    .as_array()
                    .ok_or_else(|| MongoError::query(format!("{} expects an array", op)))?;
                let found = actual.is_some_and(|a| items.iter().any(|i| bson_eq(a, i)));
                found == (op == "$in")
            }
            "$exists" => actual.is_some() == operand.as_bool().unwrap_or(true),
            "$gt" => actual.is_some_and(|a| compare_bson(a, operand) == Ordering::Greater),
            "$gte" => actual.is_some_and(|a| compare_bson(a, operand) != Ordering::Less),
            "$lt" => actual.is_some_and(|a| compare_bson(a, operand) == Ordering::Less),
            "$lte" => actual.is_some_and(|a| compare_bson(a, operand) != Ordering::Greater),
            other => {
                return Err(MongoError::query(format!(
                    "unsupported filter operator {}",
                    other
                )));
            }
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn is_operator_document(value: &Bson) -> bool {
    matches!(value, Bson::Document(d) if d.keys().next().is_some_and(|k| k.starts_with('$')))
}

fn sort_documents(docs: &mut [Document], sort: &Document) {
    docs.sort_by(|a, b| {
        for (path, direction) in sort {
            let left = lookup(a, path).unwrap_or(&Bson::Null);
            let right = lookup(b, path).unwrap_or(&Bson::Null);
            let ordering = compare_bson(left, right);
            if ordering != Ordering::Equal {
                let descending = as_f64(direction).is_some_and(|d| d < 0.0);
                return if descending { ordering.reverse() } else { ordering };
            }
        }
        Ordering::Equal
    });
}

fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = current.as_document()?.get(part)?;
    }
    Some(current)
}

fn set_path(doc: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
        }
        Some((head, rest)) => {
            if !matches!(doc.get(head), Some(Bson::Document(_))) {
                doc.insert(head, Document::new());
            }
            if let Some(Bson::Document(child)) = doc.get_mut(head) {
                set_path(child, rest, value);
            }
        }
    }
}

fn remove_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Bson::Document(child)) = doc.get_mut(head) {
                remove_path(child, rest);
            }
        }
    }
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(*n as f64),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

fn add_numbers(a: &Bson, b: &Bson) -> Option<Bson> {
    match (a, b) {
        (Bson::Int32(x), Bson::Int32(y)) => Some(
            x.checked_add(*y)
                .map(Bson::Int32)
                .unwrap_or(Bson::Int64(*x as i64 + *y as i64)),
        ),
        (Bson::Int32(x), Bson::Int64(y)) => Some(Bson::Int64(*x as i64 + y)),
        (Bson::Int64(x), Bson::Int32(y)) => Some(Bson::Int64(x + *y as i64)),
        (Bson::Int64(x), Bson::Int64(y)) => Some(Bson::Int64(x + y)),
        _ => Some(Bson::Double(as_f64(a)? + as_f64(b)?)),
    }
}

/// Equality that treats numbers of different widths as equal.
fn bson_eq(a: &Bson, b: &Bson) -> bool {
    match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare_bson(a: &Bson, b: &Bson) -> Ordering {
    if let (Some(x), Some(y)) = (as_f64(a), as_f64(b)) {
        return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
    }
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => x.cmp(y),
        (Bson::DateTime(x), Bson::DateTime(y)) => x.cmp(y),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::Null => 0,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => 1,
        Bson::String(_) => 2,
        Bson::Document(_) => 3,
        Bson::Array(_) => 4,
        Bson::ObjectId(_) => 5,
        Bson::Boolean(_) => 6,
        Bson::DateTime(_) => 7,
        _ => 8,
    }
}
