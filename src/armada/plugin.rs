//! Process-wide cache of plugin clients.
//!
//! Plugins can outlive individual agents (a browser session may span
//! several tasks), so clients are cached globally, keyed on
//! `(name, version)`. Creation is exclusive: two concurrent lookups for
//! the same key produce exactly one client. Shutdown is a
//! program-lifecycle concern; [`clear`] exists mainly for tests.

use crate::armada::tools::Tool;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::error::Error;
use std::sync::{Arc, Mutex};

/// A connected plugin exposing a set of tools.
///
/// The plugin host itself is out of scope for the engine; it only
/// consumes the tools a client yields.
pub trait PluginClient: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> &str;
    /// The tools this client currently offers.
    fn tools(&self) -> Vec<Arc<dyn Tool>>;
}

lazy_static! {
    static ref PLUGIN_CLIENTS: Mutex<HashMap<(String, String), Arc<dyn PluginClient>>> =
        Mutex::new(HashMap::new());
}

/// Fetch the cached client for `(name, version)`, creating it with
/// `factory` on first use.
///
/// The registry lock is held across creation, which is what makes
/// creation exclusive; factories should therefore be quick and defer
/// slow connection work to first tool use.
pub fn get_or_create<F>(
    name: &str,
    version: &str,
    factory: F,
) -> Result<Arc<dyn PluginClient>, Box<dyn Error + Send + Sync>>
where
    F: FnOnce() -> Result<Arc<dyn PluginClient>, Box<dyn Error + Send + Sync>>,
{
    let key = (name.to_string(), version.to_string());
    let mut clients = PLUGIN_CLIENTS.lock().expect("plugin registry lock poisoned");
    if let Some(existing) = clients.get(&key) {
        return Ok(Arc::clone(existing));
    }
    let client = factory()?;
    log::info!("plugin client created for {}@{}", name, version);
    clients.insert(key, Arc::clone(&client));
    Ok(client)
}

/// Number of cached clients.
pub fn cached_count() -> usize {
    PLUGIN_CLIENTS
        .lock()
        .expect("plugin registry lock poisoned")
        .len()
}

/// Drop every cached client. Intended for tests and process teardown.
pub fn clear() {
    PLUGIN_CLIENTS
        .lock()
        .expect("plugin registry lock poisoned")
        .clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::armada::schema::FieldSpec;
    use async_trait::async_trait;

    struct NoopTool;

    #[async_trait]
    impl Tool for NoopTool {
        fn name(&self) -> &str {
            "noop"
        }
        fn description(&self) -> &str {
            "does nothing"
        }
        fn parameters(&self) -> Vec<FieldSpec> {
            Vec::new()
        }
        async fn call(
            &self,
            _input: &str,
        ) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
            Ok("ok".to_string())
        }
    }

    struct FakeClient;

    impl PluginClient for FakeClient {
        fn name(&self) -> &str {
            "fake"
        }
        fn version(&self) -> &str {
            "1.0.0"
        }
        fn tools(&self) -> Vec<Arc<dyn Tool>> {
            vec![Arc::new(NoopTool)]
        }
    }

    #[test]
    fn second_lookup_reuses_the_cached_client() {
        clear();
        let mut creations = 0;
        let first = get_or_create("fake", "1.0.0", || {
            creations += 1;
            Ok(Arc::new(FakeClient) as Arc<dyn PluginClient>)
        })
        .unwrap();
        let second = get_or_create("fake", "1.0.0", || {
            creations += 1;
            Ok(Arc::new(FakeClient) as Arc<dyn PluginClient>)
        })
        .unwrap();
        assert_eq!(creations, 1);
        assert!(Arc::ptr_eq(&first, &second));
        clear();
    }
}
