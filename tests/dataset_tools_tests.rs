use armada::armada::stores::{DatasetStore, InMemoryDatasetStore};
use armada::armada::tools::dataset_tools::install_dataset_tools;
use armada::armada::tools::ToolMap;
use serde_json::{json, Value};
use std::sync::Arc;

fn tools() -> (Arc<InMemoryDatasetStore>, ToolMap) {
    let store = Arc::new(InMemoryDatasetStore::new());
    let mut tools = ToolMap::new();
    install_dataset_tools(&mut tools, store.clone() as Arc<dyn DatasetStore>);
    (store, tools)
}

#[tokio::test]
async fn agents_can_create_append_and_inspect_datasets() {
    let (store, tools) = tools();

    let out = tools["dataset_create"]
        .call(
            &json!({
                "name": "leads",
                "description": "collected leads",
                "records": [{"company": "a"}, {"company": "b"}]
            })
            .to_string(),
        )
        .await
        .unwrap();
    assert_eq!(out, "dataset 'leads' created with 2 records");

    let out = tools["dataset_append"]
        .call(&json!({"name": "leads", "records": [{"company": "c"}]}).to_string())
        .await
        .unwrap();
    assert_eq!(out, "dataset 'leads' now has 3 records");

    let out = tools["dataset_count"]
        .call(&json!({"name": "leads"}).to_string())
        .await
        .unwrap();
    assert_eq!(out, "3");

    let out = tools["dataset_sample"]
        .call(&json!({"name": "leads", "count": 2}).to_string())
        .await
        .unwrap();
    let sample: Vec<Value> = serde_json::from_str(&out).unwrap();
    assert_eq!(sample.len(), 2);
    assert_eq!(sample[0]["company"], "a");

    let out = tools["dataset_replace"]
        .call(&json!({"name": "leads", "records": [{"company": "z"}]}).to_string())
        .await
        .unwrap();
    assert_eq!(out, "dataset 'leads' replaced with 1 records");
    assert_eq!(store.count("leads").await.unwrap(), 1);
}

#[tokio::test]
async fn dataset_tools_surface_readable_errors() {
    let (_store, tools) = tools();

    let error = tools["dataset_append"]
        .call(&json!({"name": "ghost", "records": []}).to_string())
        .await
        .unwrap_err();
    assert!(error.to_string().contains("ghost"));

    let error = tools["dataset_create"]
        .call(&json!({"name": "bad", "records": "not an array"}).to_string())
        .await
        .unwrap_err();
    assert!(error.to_string().contains("'records' must be an array"));

    let error = tools["dataset_count"].call("not json").await.unwrap_err();
    assert!(error.to_string().contains("not valid JSON"));
}
