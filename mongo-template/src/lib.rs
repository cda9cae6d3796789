//! # mongo-template
//!
//! Typed, session-aware data access for MongoDB.
//!
//! This crate provides:
//! - Record types bound to a database and collection with `#[derive(Reference)]`
//! - An implicit session per [`Template`], with commit on success and abort on error
//! - CRUD, counting, pagination, and aggregation over typed records
//! - A change-stream dispatcher with per-event handler timeouts
//! - An in-process [`MemoryDriver`] for tests
//!
//! ## Example
//!
//! ```rust,ignore
//! use mongo_template::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Reference, Serialize, Deserialize)]
//! #[reference(database = "shop", collection = "orders")]
//! struct Order {
//!     #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
//!     id: Option<ObjectId>,
//!     total: i64,
//! }
//!
//! #[tokio::main]
//! async fn main() -> MongoResult<()> {
//!     let template = Template::from_file("mongo-template.toml").await?;
//!
//!     template.insert_one(&Order { id: None, total: 42 }, None).await?;
//!
//!     let big: Vec<Order> = template
//!         .find(doc! { "total": { "$gt": 10 } }, None)
//!         .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Sessions
//!
//! Operations accept option values that change how the implicit session is
//! handled; see [`template`] for the lifecycle.
//!
//! ```rust,ignore
//! template
//!     .insert_one(&order, [InsertOneOptions::new().disable_auto_close_session()])
//!     .await?;
//! template.update_one::<Stock>(filter, update, None).await?; // commits both
//! ```

extern crate self as mongo_template;

pub mod client;
pub mod config;
pub mod document;
pub mod driver;
pub mod error;
pub mod memory;
pub mod options;
pub mod pagination;
pub mod reference;
pub mod template;
pub mod watch;

pub use bson::oid::ObjectId;
pub use bson::{Bson, Document, doc};
pub use client::MongoClient;
pub use config::{FileConfig, MongoConfig, MongoConfigBuilder, TemplateConfig};
pub use driver::{Driver, Namespace, UpdateOutcome, WatchTarget};
pub use error::{BulkItemError, BulkWriteFailure, MongoError, MongoResult};
pub use memory::MemoryDriver;
pub use mongo_template_codegen::Reference;
pub use pagination::{PageInput, PageOutput};
pub use reference::Reference;
pub use template::Template;
pub use tokio_util::sync::CancellationToken;
pub use watch::{WatchEvent, WatchOptions, WatchSummary};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::client::MongoClient;
    pub use crate::config::{FileConfig, MongoConfig, TemplateConfig};
    pub use crate::error::{MongoError, MongoResult};
    pub use crate::options::{
        AggregateOptions, CountOptions, DeleteOptions, FindOneOptions, FindOptions,
        InsertManyOptions, InsertOneOptions, UpdateOptions,
    };
    pub use crate::pagination::{PageInput, PageOutput};
    pub use crate::template::Template;
    pub use crate::watch::{DecodeErrorPolicy, OperationType, WatchEvent, WatchOptions};
    pub use crate::{CancellationToken, Reference};
    pub use bson::oid::ObjectId;
    pub use bson::{Bson, Document, doc};
}
