//! The `flushed` signal counts the rows a flush actually wrote.
//!
//! Kept in its own test binary: the payload carries no entity ids, so no
//! other test may flush while the receiver is connected.

use std::sync::{Arc, Mutex};

use persist_rs_db::{EntityMeta, FieldType, MetaRegistry, Session, Value};
use persist_rs_db_backends::SqliteBackend;
use persist_rs_signals::{Flushed, SIGNALS};

#[tokio::test]
async fn test_flushed_counts_rows_written() {
    let mut registry = MetaRegistry::new();
    registry
        .define(EntityMeta::builder("Task").field("title", FieldType::Text).build())
        .unwrap();
    let db = Arc::new(SqliteBackend::memory().unwrap());
    let mut session = Session::new(db, Arc::new(registry));
    session.schema_sync(None).await.unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    SIGNALS.flushed.connect(
        "flush-count-test",
        Arc::new(move |event: &Flushed| sink.lock().unwrap().push(event.clone())),
    );

    let first = session.create("Task", &[("title", Value::from("a"))]).unwrap();
    session.create("Task", &[("title", Value::from("b"))]).unwrap();
    session.flush(None).await.unwrap();

    // Both tasks stay tracked, but only the edited one is written.
    first.set("title", "a2").unwrap();
    session.flush(None).await.unwrap();

    // Nothing pending: no signal at all.
    session.flush(None).await.unwrap();
    SIGNALS.flushed.disconnect("flush-count-test");

    let events = events.lock().unwrap();
    assert_eq!(
        *events,
        vec![
            Flushed { persisted: 2, removed: 0 },
            Flushed { persisted: 1, removed: 0 },
        ]
    );
}
