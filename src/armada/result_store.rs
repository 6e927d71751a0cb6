//! Large-result interception and the content-addressable result store.
//!
//! Every tool result flows through a [`ResultInterceptor`] before it is
//! wrapped as an observation. Results that would bloat the LM context
//! (big text blobs, big JSON objects, arrays with many items) are spilled
//! into a [`ResultStore`] and replaced inline by a small sample plus
//! structured metadata naming the stored id. The model then reads the full
//! payload lazily through the `result_*` access tools
//! ([`crate::armada::tools::result_access`]).
//!
//! Stored ids have the form `_result_<sanitised-tool>_<n>` where `.` and
//! `-` in the tool name are replaced by `_` and `n` is strictly increasing
//! per tool. Stored results are immutable and the store is append-only, so
//! `get` is safe under concurrent `store`.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Classification of a stored result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    Array,
    Object,
    Text,
}

impl ResultKind {
    /// Lowercase name used in observation metadata and `result_info`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultKind::Array => "array",
            ResultKind::Object => "object",
            ResultKind::Text => "text",
        }
    }
}

/// An immutable spilled tool result.
#[derive(Debug)]
pub struct StoredResult {
    /// Generated id of the form `_result_<sanitised-tool>_<n>`.
    pub id: String,
    pub kind: ResultKind,
    /// Item count for arrays, byte count otherwise.
    pub size: usize,
    /// The raw string payload exactly as the tool returned it.
    pub raw: String,
    /// Parsed structure for arrays and objects; `None` for text.
    pub parsed: Option<Value>,
}

struct StoreInner {
    results: HashMap<String, Arc<StoredResult>>,
    counters: HashMap<String, usize>,
}

/// Append-only store of spilled results, keyed by generated id.
pub struct ResultStore {
    inner: Mutex<StoreInner>,
}

impl Default for ResultStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                results: HashMap::new(),
                counters: HashMap::new(),
            }),
        }
    }

    /// Replace `.` and `-` with `_` so ids stay single-token friendly.
    pub fn sanitize_tool_name(tool_name: &str) -> String {
        tool_name.replace(['.', '-'], "_")
    }

    /// Store a result produced by `tool_name`, returning its generated id.
    pub fn store(
        &self,
        tool_name: &str,
        kind: ResultKind,
        size: usize,
        raw: String,
        parsed: Option<Value>,
    ) -> String {
        let sanitised = Self::sanitize_tool_name(tool_name);
        let mut inner = self.inner.lock().expect("result store lock poisoned");
        let counter = inner.counters.entry(sanitised.clone()).or_insert(0);
        let id = format!("_result_{}_{}", sanitised, *counter);
        *counter += 1;
        inner.results.insert(
            id.clone(),
            Arc::new(StoredResult {
                id: id.clone(),
                kind,
                size,
                raw,
                parsed,
            }),
        );
        id
    }

    /// Look up a stored result by id.
    pub fn get(&self, id: &str) -> Option<Arc<StoredResult>> {
        self.inner
            .lock()
            .expect("result store lock poisoned")
            .results
            .get(id)
            .cloned()
    }

    /// Number of results stored so far.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("result store lock poisoned")
            .results
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Thresholds controlling when a result is spilled and how much of it is
/// shown inline.
#[derive(Debug, Clone)]
pub struct InterceptorConfig {
    /// Text/object results at or above this byte count are spilled.
    pub byte_threshold: usize,
    /// Array results with at least this many items are spilled regardless
    /// of byte size.
    pub item_threshold: usize,
    /// Items shown inline for a spilled array.
    pub sample_size: usize,
    /// Characters shown inline for a spilled text.
    pub preview_length: usize,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            byte_threshold: 8 * 1024,
            item_threshold: 20,
            sample_size: 5,
            preview_length: 500,
        }
    }
}

/// The inline replacement for a (possibly spilled) tool result.
///
/// `metadata` is `None` when the result passed through unchanged; when
/// present it is rendered into an `<OBSERVATION_METADATA>` block as
/// ordered `key: value` lines.
#[derive(Debug, Clone)]
pub struct Intercepted {
    pub data: String,
    pub metadata: Option<Vec<(String, String)>>,
}

impl Intercepted {
    fn passthrough(raw: &str) -> Self {
        Self {
            data: raw.to_string(),
            metadata: None,
        }
    }
}

/// Applies the spill policy to raw tool results.
pub struct ResultInterceptor {
    store: Arc<ResultStore>,
    config: InterceptorConfig,
}

impl ResultInterceptor {
    pub fn new(store: Arc<ResultStore>, config: InterceptorConfig) -> Self {
        Self { store, config }
    }

    /// Borrow the backing store.
    pub fn store(&self) -> &Arc<ResultStore> {
        &self.store
    }

    /// Classify and, if oversize, spill a raw tool result.
    ///
    /// Results produced by the `result_*` access tools short-circuit: they
    /// are already store reads and must never be re-spilled.
    pub fn intercept(&self, tool_name: &str, raw: &str) -> Intercepted {
        if tool_name.starts_with("result_") {
            return Intercepted::passthrough(raw);
        }

        // 1. Arrays spill on item count, regardless of byte size. An
        //    array below the item threshold falls through to the byte
        //    checks like any other result.
        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(raw) {
            if items.len() >= self.config.item_threshold {
                return self.spill_array(tool_name, raw, items);
            }
        }

        // 2. Small results pass through untouched.
        if raw.len() < self.config.byte_threshold {
            return Intercepted::passthrough(raw);
        }

        // 3. Oversize objects get a key summary.
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw) {
            return self.spill_object(tool_name, raw, map);
        }

        // 4. Everything else (including few-item oversize arrays) is
        //    oversize text.
        self.spill_text(tool_name, raw)
    }

    fn spill_array(&self, tool_name: &str, raw: &str, items: Vec<Value>) -> Intercepted {
        let total_items = items.len();
        let shown_items = self.config.sample_size.min(total_items);
        let sample = serde_json::to_string(&items[..shown_items])
            .unwrap_or_else(|_| "[]".to_string());
        let id = self.store.store(
            tool_name,
            ResultKind::Array,
            total_items,
            raw.to_string(),
            Some(Value::Array(items)),
        );
        Intercepted {
            data: sample,
            metadata: Some(vec![
                ("type".to_string(), "array".to_string()),
                ("id".to_string(), id),
                ("partial".to_string(), "true".to_string()),
                ("total_items".to_string(), total_items.to_string()),
                ("shown_items".to_string(), shown_items.to_string()),
            ]),
        }
    }

    fn spill_object(
        &self,
        tool_name: &str,
        raw: &str,
        map: serde_json::Map<String, Value>,
    ) -> Intercepted {
        let total_bytes = raw.len();
        let total_keys = map.len();
        let keys: Vec<&String> = map.keys().collect();
        let key_list = serde_json::to_string(&keys).unwrap_or_else(|_| "[]".to_string());
        let id = self.store.store(
            tool_name,
            ResultKind::Object,
            total_bytes,
            raw.to_string(),
            Some(Value::Object(map)),
        );
        Intercepted {
            data: format!("Top-level keys: {}", key_list),
            metadata: Some(vec![
                ("type".to_string(), "object".to_string()),
                ("id".to_string(), id),
                ("partial".to_string(), "true".to_string()),
                ("total_bytes".to_string(), total_bytes.to_string()),
                ("total_keys".to_string(), total_keys.to_string()),
            ]),
        }
    }

    fn spill_text(&self, tool_name: &str, raw: &str) -> Intercepted {
        let total_bytes = raw.len();
        let preview_end = raw
            .char_indices()
            .nth(self.config.preview_length)
            .map(|(i, _)| i)
            .unwrap_or(raw.len());
        let truncated = preview_end < raw.len();
        let preview = &raw[..preview_end];
        let shown_bytes = preview.len();
        let id = self.store.store(
            tool_name,
            ResultKind::Text,
            total_bytes,
            raw.to_string(),
            None,
        );
        Intercepted {
            data: if truncated {
                format!("{}...", preview)
            } else {
                preview.to_string()
            },
            metadata: Some(vec![
                ("type".to_string(), "text".to_string()),
                ("id".to_string(), id),
                ("partial".to_string(), "true".to_string()),
                ("total_bytes".to_string(), total_bytes.to_string()),
                ("shown_bytes".to_string(), shown_bytes.to_string()),
            ]),
        }
    }
}
