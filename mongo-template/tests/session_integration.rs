//! Integration tests for session handling and typed operations.
//!
//! These tests drive a `Template` over the in-memory driver and check the
//! session lifecycle through the driver's call journal.

use mongo_template::memory::{DriverCall, FailPoint, MemoryDriver};
use mongo_template::prelude::*;
use mongo_template::{Namespace, UpdateOutcome};
use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Reference, Serialize, Deserialize)]
#[reference(database = "shop", collection = "orders")]
struct Order {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    id: Option<i32>,
    #[serde(default)]
    customer: String,
    #[serde(default)]
    total: i64,
}

#[derive(Debug, Reference, Serialize, Deserialize)]
#[reference(collection = "notes")]
struct Note {
    text: String,
}

#[derive(Debug, Reference, Serialize, Deserialize)]
#[reference(database = "shop")]
struct Loose {
    text: String,
}

fn order(id: i32, customer: &str, total: i64) -> Order {
    Order {
        id: Some(id),
        customer: customer.into(),
        total,
    }
}

fn orders_ns() -> Namespace {
    Namespace::new("shop", "orders")
}

fn operation(name: &'static str, session: Option<u64>) -> DriverCall {
    DriverCall::Operation {
        name,
        namespace: orders_ns(),
        session,
    }
}

/// A record type without a database fails before any driver call.
#[tokio::test]
async fn test_missing_database_is_rejected() {
    let driver = MemoryDriver::new();
    let template = Template::new(driver.clone());

    let err = template
        .insert_one(&Note { text: "hi".into() }, None)
        .await
        .unwrap_err();

    assert!(matches!(err, MongoError::MissingDatabase(_)));
    assert!(err.is_config_error());
    assert!(driver.calls().is_empty());
}

/// A record type without a collection fails before any driver call.
#[tokio::test]
async fn test_missing_collection_is_rejected() {
    let driver = MemoryDriver::new();
    let template = Template::new(driver.clone());

    let err = template
        .find::<Loose>(doc! {}, None)
        .await
        .unwrap_err();

    assert!(matches!(err, MongoError::MissingCollection(_)));
    assert!(driver.calls().is_empty());
}

/// The configured database fills in for record types that name none.
#[tokio::test]
async fn test_default_database_from_config() {
    let driver = MemoryDriver::new();
    let config = TemplateConfig::builder().database("archive").build().unwrap();
    let template = Template::with_config(driver.clone(), config);

    template
        .insert_one(&Note { text: "hi".into() }, None)
        .await
        .unwrap();

    assert_eq!(driver.documents(&Namespace::new("archive", "notes")).len(), 1);
}

/// A successful operation starts, commits, and clears the session.
#[tokio::test]
async fn test_successful_operation_commits() {
    let driver = MemoryDriver::new();
    let template = Template::new(driver.clone());

    let id = template.insert_one(&order(1, "ada", 40), None).await.unwrap();

    assert_eq!(id, Bson::Int32(1));
    assert_eq!(
        driver.calls(),
        vec![
            DriverCall::StartSession(1),
            operation("insert_one", Some(1)),
            DriverCall::CommitTransaction(1),
            DriverCall::EndSession(1),
        ]
    );
    assert!(!template.has_active_session().await);
    assert_eq!(driver.documents(&orders_ns()).len(), 1);
    assert_eq!(driver.changes().len(), 1);
}

/// A failing operation aborts its transaction.
#[tokio::test]
async fn test_failed_operation_rolls_back() {
    let driver = MemoryDriver::new();
    let template = Template::new(driver.clone());
    driver.seed(&orders_ns(), [doc! { "_id": 1, "customer": "ada", "total": 40_i64 }]);

    driver.fail_next(FailPoint::Operation("update_one"));
    let err = template
        .update_one::<Order>(doc! { "_id": 1 }, doc! { "$set": { "total": 0_i64 } }, None)
        .await
        .unwrap_err();

    assert!(matches!(err, MongoError::Query(_)));
    assert_eq!(
        driver.calls(),
        vec![
            DriverCall::StartSession(1),
            operation("update_one", Some(1)),
            DriverCall::AbortTransaction(1),
            DriverCall::EndSession(1),
        ]
    );
    assert_eq!(driver.open_sessions(), 0);
}

/// `disable_auto_close_session` keeps the session for following operations.
#[tokio::test]
async fn test_disable_auto_close_spans_operations() {
    let driver = MemoryDriver::new();
    let template = Template::new(driver.clone());

    template
        .insert_one(
            &order(1, "ada", 40),
            [InsertOneOptions::new().disable_auto_close_session()],
        )
        .await
        .unwrap();

    assert!(template.has_active_session().await);
    assert!(driver.documents(&orders_ns()).is_empty());

    template.insert_one(&order(2, "bob", 15), None).await.unwrap();

    assert!(!template.has_active_session().await);
    assert_eq!(driver.documents(&orders_ns()).len(), 2);
    assert_eq!(
        driver.calls(),
        vec![
            DriverCall::StartSession(1),
            operation("insert_one", Some(1)),
            operation("insert_one", Some(1)),
            DriverCall::CommitTransaction(1),
            DriverCall::EndSession(1),
        ]
    );
}

/// `disable_auto_rollback_session` commits even when the operation failed.
#[tokio::test]
async fn test_disable_auto_rollback_commits_on_error() {
    let driver = MemoryDriver::new();
    let template = Template::new(driver.clone());

    template
        .insert_one(
            &order(1, "ada", 40),
            [InsertOneOptions::new().disable_auto_close_session()],
        )
        .await
        .unwrap();

    let err = template
        .insert_one(
            &order(1, "ada", 40),
            [InsertOneOptions::new().disable_auto_rollback_session()],
        )
        .await
        .unwrap_err();

    assert!(matches!(err, MongoError::Query(_)));
    assert!(driver.calls().contains(&DriverCall::CommitTransaction(1)));
    assert_eq!(driver.documents(&orders_ns()).len(), 1);
}

/// `force_recreate_session` commits the open transaction before starting anew.
#[tokio::test]
async fn test_force_recreate_commits_previous_session() {
    let driver = MemoryDriver::new();
    let template = Template::new(driver.clone());

    template
        .insert_one(
            &order(1, "ada", 40),
            [InsertOneOptions::new().disable_auto_close_session()],
        )
        .await
        .unwrap();
    template
        .insert_one(
            &order(2, "bob", 15),
            [InsertOneOptions::new().force_recreate_session()],
        )
        .await
        .unwrap();

    assert_eq!(
        driver.calls(),
        vec![
            DriverCall::StartSession(1),
            operation("insert_one", Some(1)),
            DriverCall::CommitTransaction(1),
            DriverCall::EndSession(1),
            DriverCall::StartSession(2),
            operation("insert_one", Some(2)),
            DriverCall::CommitTransaction(2),
            DriverCall::EndSession(2),
        ]
    );
    assert_eq!(driver.documents(&orders_ns()).len(), 2);
}

/// A document with only zero values never reaches the driver.
#[tokio::test]
async fn test_zero_document_is_rejected_without_session() {
    let driver = MemoryDriver::new();
    let template = Template::new(driver.clone());

    let err = template.insert_one(&Order::default(), None).await.unwrap_err();

    assert!(matches!(err, MongoError::EmptyDocument));
    assert!(driver.calls().is_empty());
    assert!(!template.has_active_session().await);
}

/// Bulk insert attempts every item and names each failed index.
#[tokio::test]
async fn test_insert_many_reports_failed_indexes() {
    let driver = MemoryDriver::new();
    let template = Template::new(driver.clone());

    let orders = vec![
        order(1, "ada", 40),
        order(1, "ada", 40),
        Order::default(),
        order(3, "cy", 7),
    ];
    let err = template.insert_many(&orders, None).await.unwrap_err();

    let failure = err.bulk_failure().unwrap();
    assert_eq!(failure.failed_indexes(), vec![1, 2]);
    assert_eq!(failure.attempted, 4);
    assert!(matches!(failure.errors[1].error, MongoError::EmptyDocument));

    let inserts = driver
        .calls()
        .into_iter()
        .filter(|call| *call == operation("insert_one", Some(1)))
        .count();
    assert_eq!(inserts, 3);
    assert!(driver.calls().contains(&DriverCall::AbortTransaction(1)));
    assert!(driver.documents(&orders_ns()).is_empty());
}

/// With rollback disabled, the items that succeeded are kept.
#[tokio::test]
async fn test_insert_many_partial_commit() {
    let driver = MemoryDriver::new();
    let template = Template::new(driver.clone());

    let orders = vec![order(1, "ada", 40), order(1, "ada", 40), order(3, "cy", 7)];
    let err = template
        .insert_many(&orders, [InsertManyOptions::new().disable_auto_rollback_session()])
        .await
        .unwrap_err();

    assert_eq!(err.bulk_failure().unwrap().failed_indexes(), vec![1]);
    assert_eq!(driver.documents(&orders_ns()).len(), 2);
}

/// An empty slice is rejected up front.
#[tokio::test]
async fn test_insert_many_empty_input() {
    let driver = MemoryDriver::new();
    let template = Template::new(driver.clone());

    let err = template.insert_many::<Order>(&[], None).await.unwrap_err();

    assert!(matches!(err, MongoError::EmptyInput(_)));
    assert!(driver.calls().is_empty());
}

/// A failed commit replaces the operation's result.
#[tokio::test]
async fn test_commit_failure_is_reported() {
    let driver = MemoryDriver::new();
    let template = Template::new(driver.clone());

    driver.fail_next(FailPoint::CommitTransaction);
    let err = template.insert_one(&order(1, "ada", 40), None).await.unwrap_err();

    assert!(matches!(err, MongoError::Session(_)));
    assert!(driver.documents(&orders_ns()).is_empty());
    assert_eq!(driver.open_sessions(), 0);
}

/// Reads decode typed records and report a missing match.
#[tokio::test]
async fn test_find_one_and_not_found() {
    let driver = MemoryDriver::new();
    let template = Template::new(driver.clone());
    template
        .insert_many(&[order(1, "ada", 40), order(2, "bob", 15)], None)
        .await
        .unwrap();

    let found: Order = template
        .find_one(doc! { "customer": "bob" }, None)
        .await
        .unwrap();
    assert_eq!(found, order(2, "bob", 15));

    let err = template
        .find_one::<Order>(doc! { "customer": "eve" }, None)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

/// `find` honours sort and limit options.
#[tokio::test]
async fn test_find_with_options() {
    let driver = MemoryDriver::new();
    let template = Template::new(driver.clone());
    template
        .insert_many(
            &[order(1, "ada", 40), order(2, "bob", 15), order(3, "cy", 70)],
            None,
        )
        .await
        .unwrap();

    let top: Vec<Order> = template
        .find(
            doc! { "total": { "$gt": 10_i64 } },
            [
                FindOptions::new().sort(doc! { "total": -1 }).limit(10),
                FindOptions::new().limit(2),
            ],
        )
        .await
        .unwrap();

    let ids: Vec<_> = top.iter().map(|o| o.id).collect();
    assert_eq!(ids, vec![Some(3), Some(1)]);
}

/// `find_page` counts and windows in one session.
#[tokio::test]
async fn test_find_page() {
    let driver = MemoryDriver::new();
    let template = Template::new(driver.clone());
    let orders: Vec<Order> = (1..=5).map(|i| order(i, "ada", i64::from(i))).collect();
    template.insert_many(&orders, None).await.unwrap();
    driver.clear_calls();

    let page: PageOutput<Order> = template
        .find_page(
            doc! {},
            PageInput::new(2, 2),
            [FindOptions::new().sort(doc! { "total": 1 })],
        )
        .await
        .unwrap();

    assert_eq!(page.total, 5);
    assert_eq!(page.page_total, 3);
    assert_eq!(
        page.content.iter().map(|o| o.id).collect::<Vec<_>>(),
        vec![Some(3), Some(4)]
    );
    assert_eq!(
        driver.calls(),
        vec![
            DriverCall::StartSession(2),
            operation("count_documents", Some(2)),
            operation("find", Some(2)),
            DriverCall::CommitTransaction(2),
            DriverCall::EndSession(2),
        ]
    );
}

/// Update, count, aggregate, and delete over the same collection.
#[tokio::test]
async fn test_update_count_aggregate_delete() {
    let driver = MemoryDriver::new();
    let template = Template::new(driver.clone());
    template
        .insert_many(
            &[order(1, "ada", 40), order(2, "ada", 15), order(3, "bob", 70)],
            None,
        )
        .await
        .unwrap();

    let outcome = template
        .update_many::<Order>(
            doc! { "customer": "ada" },
            doc! { "$inc": { "total": 5_i64 } },
            None,
        )
        .await
        .unwrap();
    assert_eq!(
        outcome,
        UpdateOutcome {
            matched_count: 2,
            modified_count: 2,
            upserted_id: None,
        }
    );

    let upserted = template
        .update_one::<Order>(
            doc! { "_id": 9 },
            doc! { "$set": { "customer": "zed", "total": 1_i64 } },
            [UpdateOptions::new().upsert(true)],
        )
        .await
        .unwrap();
    assert_eq!(upserted.upserted_id, Some(Bson::Int32(9)));

    let count = template
        .count_documents::<Order>(doc! { "total": { "$gte": 20_i64 } }, None)
        .await
        .unwrap();
    assert_eq!(count, 3);

    let counted: Vec<Document> = template
        .aggregate::<Order, Document>(
            vec![
                doc! { "$match": { "customer": "ada" } },
                doc! { "$count": "orders" },
            ],
            None,
        )
        .await
        .unwrap();
    assert_eq!(counted, vec![doc! { "orders": 2_i64 }]);

    let deleted = template
        .delete_many::<Order>(doc! { "customer": "ada" }, None)
        .await
        .unwrap();
    assert_eq!(deleted, 2);

    let deleted = template
        .delete_one::<Order>(doc! { "customer": "nobody" }, None)
        .await
        .unwrap();
    assert_eq!(deleted, 0);
    assert_eq!(driver.documents(&orders_ns()).len(), 2);
}

/// Sessions opened manually are closed explicitly.
#[tokio::test]
async fn test_manual_transaction() {
    let driver = MemoryDriver::new();
    let template = Template::new(driver.clone());

    template.start_session(false).await.unwrap();
    template
        .insert_one(
            &order(1, "ada", 40),
            [InsertOneOptions::new().disable_auto_close_session()],
        )
        .await
        .unwrap();
    template.close_session(true).await.unwrap();

    assert!(driver.documents(&orders_ns()).is_empty());
    assert_eq!(driver.open_sessions(), 0);
    assert!(template.ping().await.is_ok());
}

/// A committed transaction ends its session; the next operation starts another.
#[tokio::test]
async fn test_operation_after_commit_transaction() {
    let driver = MemoryDriver::new();
    let template = Template::new(driver.clone());

    template.start_session(false).await.unwrap();
    template
        .insert_one(
            &order(1, "ada", 40),
            [InsertOneOptions::new().disable_auto_close_session()],
        )
        .await
        .unwrap();
    template.commit_transaction().await.unwrap();
    assert!(!template.has_active_session().await);

    template.insert_one(&order(2, "bob", 15), None).await.unwrap();

    assert_eq!(
        driver.calls(),
        vec![
            DriverCall::StartSession(1),
            operation("insert_one", Some(1)),
            DriverCall::CommitTransaction(1),
            DriverCall::EndSession(1),
            DriverCall::StartSession(2),
            operation("insert_one", Some(2)),
            DriverCall::CommitTransaction(2),
            DriverCall::EndSession(2),
        ]
    );
    assert_eq!(driver.documents(&orders_ns()).len(), 2);
    assert_eq!(driver.open_sessions(), 0);
}

/// An aborted transaction ends its session; the next operation starts another.
#[tokio::test]
async fn test_operation_after_abort_transaction() {
    let driver = MemoryDriver::new();
    let template = Template::new(driver.clone());

    template
        .insert_one(
            &order(1, "ada", 40),
            [InsertOneOptions::new().disable_auto_close_session()],
        )
        .await
        .unwrap();
    template.abort_transaction().await.unwrap();

    template.insert_one(&order(2, "bob", 15), None).await.unwrap();

    let committed = driver.documents(&orders_ns());
    assert_eq!(committed.len(), 1);
    assert_eq!(committed[0].get_i32("_id").unwrap(), 2);
    assert!(driver.calls().contains(&DriverCall::EndSession(1)));
    assert!(driver.calls().contains(&operation("insert_one", Some(2))));
}

/// Closing without abort publishes the writes staged in the session.
#[tokio::test]
async fn test_close_session_commits_staged_writes() {
    let driver = MemoryDriver::new();
    let template = Template::new(driver.clone());

    for (id, customer) in [(1, "ada"), (2, "bob")] {
        template
            .insert_one(
                &order(id, customer, 10),
                [InsertOneOptions::new().disable_auto_close_session()],
            )
            .await
            .unwrap();
    }
    assert!(driver.documents(&orders_ns()).is_empty());

    template.close_session(false).await.unwrap();

    assert_eq!(driver.documents(&orders_ns()).len(), 2);
    assert_eq!(driver.changes().len(), 2);
    assert!(driver.calls().contains(&DriverCall::CommitTransaction(1)));
    assert_eq!(driver.open_sessions(), 0);
}

/// Tasks sharing one template run their operations one session at a time.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shared_template_serializes_sessions() {
    let driver = MemoryDriver::new();
    let template = std::sync::Arc::new(Template::new(driver.clone()));

    let tasks: Vec<_> = (1..=8)
        .map(|id| {
            let template = template.clone();
            tokio::spawn(async move {
                template
                    .insert_one(&order(id, "ada", i64::from(id)), None)
                    .await
                    .unwrap();
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let calls = driver.calls();
    assert_eq!(calls.len(), 32);
    for chunk in calls.chunks(4) {
        let DriverCall::StartSession(id) = chunk[0] else {
            panic!("expected a session start, got {:?}", chunk[0]);
        };
        assert_eq!(
            chunk,
            &[
                DriverCall::StartSession(id),
                operation("insert_one", Some(id)),
                DriverCall::CommitTransaction(id),
                DriverCall::EndSession(id),
            ]
        );
    }
    assert_eq!(driver.documents(&orders_ns()).len(), 8);
    assert_eq!(driver.open_sessions(), 0);
}

/// A page size beyond the driver's limit range is rejected.
#[tokio::test]
async fn test_find_page_rejects_oversized_page() {
    let driver = MemoryDriver::new();
    let template = Template::new(driver.clone());

    let err = template
        .find_page::<Order>(doc! {}, PageInput::new(1, u64::MAX), None)
        .await
        .unwrap_err();

    assert!(err.is_config_error());
    assert!(driver.calls().is_empty());
}
