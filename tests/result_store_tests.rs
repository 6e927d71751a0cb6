use armada::armada::dataset::Dataset;
use armada::armada::result_store::{
    InterceptorConfig, ResultInterceptor, ResultKind, ResultStore,
};
use armada::armada::stores::{DatasetStore, InMemoryDatasetStore};
use armada::armada::tools::result_access::install_result_tools;
use armada::armada::tools::ToolMap;
use serde_json::{json, Value};
use std::sync::Arc;

fn default_interceptor() -> (Arc<ResultStore>, ResultInterceptor) {
    let store = Arc::new(ResultStore::new());
    let interceptor = ResultInterceptor::new(Arc::clone(&store), InterceptorConfig::default());
    (store, interceptor)
}

fn metadata_value<'a>(metadata: &'a [(String, String)], key: &str) -> &'a str {
    metadata
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
        .unwrap_or_else(|| panic!("metadata key '{}' missing", key))
}

fn twenty_five_objects() -> String {
    let items: Vec<Value> = (0..25).map(|i| json!({ "i": i })).collect();
    serde_json::to_string(&items).unwrap()
}

#[test]
fn arrays_at_item_threshold_spill_with_a_sample() {
    let (store, interceptor) = default_interceptor();
    let raw = twenty_five_objects();
    let intercepted = interceptor.intercept("fetch_numbers", &raw);

    let metadata = intercepted.metadata.expect("array should be spilled");
    assert_eq!(metadata_value(&metadata, "type"), "array");
    assert_eq!(metadata_value(&metadata, "partial"), "true");
    assert_eq!(metadata_value(&metadata, "total_items"), "25");
    assert_eq!(metadata_value(&metadata, "shown_items"), "5");
    let id = metadata_value(&metadata, "id");
    assert_eq!(id, "_result_fetch_numbers_0");

    let sample: Vec<Value> = serde_json::from_str(&intercepted.data).unwrap();
    assert_eq!(sample.len(), 5);
    assert_eq!(sample[0]["i"], 0);
    assert_eq!(sample[4]["i"], 4);

    let stored = store.get(id).expect("stored result retrievable by id");
    assert_eq!(stored.kind, ResultKind::Array);
    assert_eq!(stored.size, 25);
    assert_eq!(stored.raw, raw);
}

#[test]
fn small_results_pass_through_unchanged() {
    let (store, interceptor) = default_interceptor();
    let small_array = serde_json::to_string(&(0..19).collect::<Vec<_>>()).unwrap();
    let intercepted = interceptor.intercept("t", &small_array);
    assert!(intercepted.metadata.is_none());
    assert_eq!(intercepted.data, small_array);

    let intercepted = interceptor.intercept("t", "short text");
    assert!(intercepted.metadata.is_none());
    assert_eq!(store.len(), 0);
}

#[test]
fn few_item_arrays_above_the_byte_threshold_spill_as_text() {
    // Below the item threshold an array is not spilled as an array, but
    // it still falls through the byte check: a fat ten-element array is
    // spilled as text, so the LM always gets a stable id for oversize
    // results.
    let store = Arc::new(ResultStore::new());
    let interceptor = ResultInterceptor::new(
        Arc::clone(&store),
        InterceptorConfig {
            byte_threshold: 64,
            preview_length: 16,
            ..InterceptorConfig::default()
        },
    );
    let items: Vec<Value> = (0..10).map(|i| json!({"i": i, "pad": "x".repeat(20)})).collect();
    let raw = serde_json::to_string(&items).unwrap();
    assert!(raw.len() >= 64);

    let intercepted = interceptor.intercept("fetch_fat", &raw);
    let metadata = intercepted.metadata.expect("oversize array should be spilled");
    assert_eq!(metadata_value(&metadata, "type"), "text");
    assert_eq!(
        metadata_value(&metadata, "total_bytes"),
        raw.len().to_string()
    );
    let id = metadata_value(&metadata, "id");
    assert!(id.starts_with("_result_fetch_fat_"));
    assert!(intercepted.data.ends_with("..."));

    let stored = store.get(id).expect("retrievable by the stable id");
    assert_eq!(stored.kind, ResultKind::Text);
    assert_eq!(stored.raw, raw);
}

#[test]
fn oversize_objects_spill_with_a_key_summary() {
    let store = Arc::new(ResultStore::new());
    let interceptor = ResultInterceptor::new(
        Arc::clone(&store),
        InterceptorConfig {
            byte_threshold: 32,
            ..InterceptorConfig::default()
        },
    );
    let raw = json!({"alpha": "x".repeat(40), "beta": 1, "gamma": [1, 2]}).to_string();
    let intercepted = interceptor.intercept("profile", &raw);
    let metadata = intercepted.metadata.expect("object should be spilled");
    assert_eq!(metadata_value(&metadata, "type"), "object");
    assert_eq!(metadata_value(&metadata, "total_keys"), "3");
    assert_eq!(
        metadata_value(&metadata, "total_bytes"),
        raw.len().to_string()
    );
    assert!(intercepted.data.starts_with("Top-level keys: "));
    assert!(intercepted.data.contains("alpha"));
    assert!(intercepted.data.contains("gamma"));
}

#[test]
fn oversize_text_spills_with_a_truncated_preview() {
    let store = Arc::new(ResultStore::new());
    let interceptor = ResultInterceptor::new(
        Arc::clone(&store),
        InterceptorConfig {
            byte_threshold: 100,
            preview_length: 10,
            ..InterceptorConfig::default()
        },
    );
    let raw = "abcdefghij".repeat(20);
    let intercepted = interceptor.intercept("read_file", &raw);
    let metadata = intercepted.metadata.expect("text should be spilled");
    assert_eq!(metadata_value(&metadata, "type"), "text");
    assert_eq!(metadata_value(&metadata, "shown_bytes"), "10");
    assert_eq!(intercepted.data, "abcdefghij...");
}

#[test]
fn ids_sanitise_dots_and_hyphens_and_stay_unique() {
    let store = ResultStore::new();
    let first = store.store("web.search-v2", ResultKind::Text, 3, "abc".into(), None);
    let second = store.store("web.search-v2", ResultKind::Text, 3, "def".into(), None);
    assert_eq!(first, "_result_web_search_v2_0");
    assert_eq!(second, "_result_web_search_v2_1");
    assert_ne!(first, second);
    assert_eq!(store.get(&first).unwrap().raw, "abc");
    assert_eq!(store.get(&second).unwrap().raw, "def");
}

#[test]
fn access_tool_results_are_never_respilled() {
    let (store, interceptor) = default_interceptor();
    let huge = "x".repeat(64 * 1024);
    let intercepted = interceptor.intercept("result_chunk", &huge);
    assert!(intercepted.metadata.is_none());
    assert_eq!(intercepted.data.len(), huge.len());
    assert_eq!(store.len(), 0);
}

// ---------------------------------------------------------------------------
// Access tools
// ---------------------------------------------------------------------------

fn tools_over(store: Arc<ResultStore>) -> ToolMap {
    let mut tools = ToolMap::new();
    install_result_tools(&mut tools, store, None);
    tools
}

#[tokio::test]
async fn result_items_slices_and_clamps() {
    let (store, interceptor) = default_interceptor();
    let raw = twenty_five_objects();
    let intercepted = interceptor.intercept("fetch_numbers", &raw);
    let id = metadata_value(intercepted.metadata.as_ref().unwrap(), "id").to_string();
    let tools = tools_over(store);

    let out = tools["result_items"]
        .call(&json!({"id": id, "offset": 10, "count": 5}).to_string())
        .await
        .unwrap();
    let items: Vec<Value> = serde_json::from_str(&out).unwrap();
    let indices: Vec<i64> = items.iter().map(|v| v["i"].as_i64().unwrap()).collect();
    assert_eq!(indices, vec![10, 11, 12, 13, 14]);

    // Out-of-range offsets return an empty array.
    let out = tools["result_items"]
        .call(&json!({"id": id, "offset": 99, "count": 5}).to_string())
        .await
        .unwrap();
    assert_eq!(out, "[]");

    // Interception composed with a full-range slice is the identity.
    let out = tools["result_items"]
        .call(&json!({"id": id, "offset": 0, "count": 25}).to_string())
        .await
        .unwrap();
    assert_eq!(out, raw);
}

#[tokio::test]
async fn result_chunk_round_trips_raw_text() {
    let store = Arc::new(ResultStore::new());
    let interceptor = ResultInterceptor::new(
        Arc::clone(&store),
        InterceptorConfig {
            byte_threshold: 16,
            preview_length: 4,
            ..InterceptorConfig::default()
        },
    );
    let raw = "the quick brown fox jumps over the lazy dog";
    let intercepted = interceptor.intercept("read_file", raw);
    let id = metadata_value(intercepted.metadata.as_ref().unwrap(), "id").to_string();
    let tools = tools_over(store);

    // Interception composed with result_chunk is the identity.
    let out = tools["result_chunk"]
        .call(&json!({"id": id, "offset": 0, "length": raw.len()}).to_string())
        .await
        .unwrap();
    assert_eq!(out, raw);

    let out = tools["result_chunk"]
        .call(&json!({"id": id, "offset": 4, "length": 5}).to_string())
        .await
        .unwrap();
    assert_eq!(out, "quick");

    let out = tools["result_chunk"]
        .call(&json!({"id": id, "offset": 9999, "length": 5}).to_string())
        .await
        .unwrap();
    assert_eq!(out, "");
}

#[tokio::test]
async fn result_get_and_keys_navigate_dotted_paths() {
    let store = Arc::new(ResultStore::new());
    let interceptor = ResultInterceptor::new(
        Arc::clone(&store),
        InterceptorConfig {
            byte_threshold: 8,
            ..InterceptorConfig::default()
        },
    );
    let raw = json!({"a": {"b": [{"c": 41}, {"c": 42}]}, "d": true}).to_string();
    let intercepted = interceptor.intercept("api", &raw);
    let id = metadata_value(intercepted.metadata.as_ref().unwrap(), "id").to_string();
    let tools = tools_over(store);

    let out = tools["result_get"]
        .call(&json!({"id": id, "path": "a.b.1.c"}).to_string())
        .await
        .unwrap();
    assert_eq!(out, "42");

    let err = tools["result_get"]
        .call(&json!({"id": id, "path": "a.missing"}).to_string())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("'missing' not found"));

    let err = tools["result_get"]
        .call(&json!({"id": id, "path": "a.b.9"}).to_string())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("out of range"));

    let out = tools["result_keys"]
        .call(&json!({"id": id}).to_string())
        .await
        .unwrap();
    let keys: Vec<String> = serde_json::from_str(&out).unwrap();
    assert_eq!(keys, vec!["a".to_string(), "d".to_string()]);

    let out = tools["result_info"]
        .call(&json!({"id": id}).to_string())
        .await
        .unwrap();
    let info: Value = serde_json::from_str(&out).unwrap();
    assert_eq!(info["type"], "object");
    assert_eq!(info["id"], Value::String(id));
}

#[tokio::test]
async fn access_tools_report_unknown_ids_and_type_mismatches() {
    let (store, interceptor) = default_interceptor();
    let raw = twenty_five_objects();
    let intercepted = interceptor.intercept("fetch", &raw);
    let id = metadata_value(intercepted.metadata.as_ref().unwrap(), "id").to_string();
    let tools = tools_over(store);

    let err = tools["result_info"]
        .call(&json!({"id": "_result_nope_0"}).to_string())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("result '_result_nope_0' not found"));

    let err = tools["result_chunk"]
        .call(&json!({"id": id, "offset": 0, "length": 4}).to_string())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("is array, not text"));
}

#[tokio::test]
async fn result_to_dataset_promotes_arrays_in_mission_context() {
    let store = Arc::new(ResultStore::new());
    let interceptor = ResultInterceptor::new(Arc::clone(&store), InterceptorConfig::default());
    let raw = twenty_five_objects();
    let intercepted = interceptor.intercept("fetch", &raw);
    let id = metadata_value(intercepted.metadata.as_ref().unwrap(), "id").to_string();

    // Outside a mission the tool is unavailable.
    let bare_tools = tools_over(Arc::clone(&store));
    let err = bare_tools["result_to_dataset"]
        .call(&json!({"id": id, "dataset_name": "numbers"}).to_string())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no dataset store attached"));

    // Inside a mission the array becomes a dataset.
    let datasets: Arc<dyn DatasetStore> = Arc::new(InMemoryDatasetStore::new());
    let mut tools = ToolMap::new();
    install_result_tools(&mut tools, Arc::clone(&store), Some(Arc::clone(&datasets)));
    let out = tools["result_to_dataset"]
        .call(&json!({"id": id, "dataset_name": "numbers"}).to_string())
        .await
        .unwrap();
    assert_eq!(out, "dataset 'numbers' created with 25 records");

    let dataset: Dataset = datasets.get("numbers").await.unwrap().unwrap();
    assert_eq!(dataset.records.len(), 25);
    assert_eq!(dataset.records[7]["i"], 7);
}
