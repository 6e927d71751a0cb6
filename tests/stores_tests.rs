use armada::armada::dataset::Dataset;
use armada::armada::schema::{FieldSpec, FieldType};
use armada::armada::stores::{
    DatasetStore, InMemoryDatasetStore, InMemoryKnowledgeStore, InMemorySessionStore,
    IterationOutput, KnowledgeStore, SessionSnapshot, SessionStore, SnapshotMessage, StoreError,
    TaskOutput, TaskStatus,
};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn knowledge_store_replaces_outputs_and_keeps_iteration_order() {
    let store = InMemoryKnowledgeStore::new();
    store
        .put_task_output(
            "m",
            TaskOutput::single("collect", TaskStatus::Failed, "first try", None),
        )
        .await
        .unwrap();
    store
        .put_task_output(
            "m",
            TaskOutput::single("collect", TaskStatus::Success, "second try", None),
        )
        .await
        .unwrap();

    let output = store.get_task_output("m", "collect").await.unwrap().unwrap();
    assert_eq!(output.status, TaskStatus::Success);
    assert_eq!(output.summary, "second try");
    assert_eq!(store.list_task_outputs("m").await.unwrap().len(), 1);
    assert!(store.get_task_output("m", "nope").await.unwrap().is_none());

    for index in 0..3 {
        store
            .put_iteration_output(
                "m",
                "summarise",
                IterationOutput {
                    index,
                    item_id: index.to_string(),
                    status: TaskStatus::Success,
                    summary: format!("item {}", index),
                    output: None,
                    timestamp: Utc::now(),
                },
            )
            .await
            .unwrap();
    }
    let pending = store.pending_iterations("m", "summarise").await;
    let indices: Vec<usize> = pending.iter().map(|i| i.index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
}

#[tokio::test]
async fn dataset_store_enforces_unique_names_and_mutates_records() {
    let store = InMemoryDatasetStore::new();
    store
        .create(Dataset::new("urls").with_records(vec![json!({"u": 1})]))
        .await
        .unwrap();

    match store.create(Dataset::new("urls")).await {
        Err(StoreError::Conflict(message)) => assert!(message.contains("urls")),
        other => panic!("expected a conflict, got {:?}", other),
    }

    let total = store
        .append_records("urls", vec![json!({"u": 2}), json!({"u": 3})])
        .await
        .unwrap();
    assert_eq!(total, 3);
    assert_eq!(store.count("urls").await.unwrap(), 3);

    store
        .replace_records("urls", vec![json!({"u": 9})])
        .await
        .unwrap();
    assert_eq!(store.count("urls").await.unwrap(), 1);
    assert_eq!(store.get("urls").await.unwrap().unwrap().records[0]["u"], 9);

    assert!(matches!(
        store.count("missing").await,
        Err(StoreError::NotFound(_))
    ));
    assert_eq!(store.list_names().await.unwrap(), vec!["urls".to_string()]);
}

#[tokio::test]
async fn session_store_keeps_the_latest_snapshot() {
    let store = InMemorySessionStore::new();
    let snapshot = |content: &str| SessionSnapshot {
        session_id: "s-1".to_string(),
        mission_id: Some("m".to_string()),
        task_name: Some("t".to_string()),
        messages: vec![SnapshotMessage {
            role: "assistant".to_string(),
            content: content.to_string(),
        }],
        created_at: Utc::now(),
    };
    store.put(snapshot("first")).await.unwrap();
    store.put(snapshot("second")).await.unwrap();

    let stored = store.get("s-1").await.unwrap().unwrap();
    assert_eq!(stored.messages[0].content, "second");
    assert!(store.get("s-2").await.unwrap().is_none());
}

#[tokio::test]
async fn dataset_validation_applies_to_store_contents() {
    let dataset = Dataset::new("typed")
        .with_schema(vec![FieldSpec::new("url", FieldType::String).required()])
        .with_records(vec![json!({"url": "https://a"}), json!({"url": 7})]);
    let error = dataset.validate().unwrap_err();
    assert!(error.contains("record 1"));
    assert!(error.contains("url"));

    let store: Arc<dyn DatasetStore> = Arc::new(InMemoryDatasetStore::new());
    // The store itself does not re-validate; callers validate snapshots.
    store.create(dataset).await.unwrap();
    assert_eq!(store.count("typed").await.unwrap(), 2);
}
