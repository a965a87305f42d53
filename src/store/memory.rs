use super::{KeyStore, Namespace, StoreValue};
use crate::error::Result;
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;

/// In-memory reference implementation of [`KeyStore`]. Suitable for tests and
/// short-lived processes; nothing is persisted across restarts.
#[derive(Default)]
pub struct MemoryKeyStore {
    state: RwLock<HashMap<&'static str, HashMap<String, StoreValue>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self { state: RwLock::new(HashMap::new()) }
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) {
        self.state.write().await.clear();
    }

    async fn get(&self, ns: Namespace, key: &str) -> Result<Option<StoreValue>> {
        let state = self.state.read().await;
        Ok(state.get(ns.as_str()).and_then(|bucket| bucket.get(key)).cloned())
    }

    async fn set(&self, ns: Namespace, key: &str, value: StoreValue) -> Result<()> {
        let mut state = self.state.write().await;
        state.entry(ns.as_str()).or_default().insert(key.to_string(), value);
        Ok(())
    }

    async fn has(&self, ns: Namespace, key: &str) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state.get(ns.as_str()).map(|bucket| bucket.contains_key(key)).unwrap_or(false))
    }

    async fn remove(&self, ns: Namespace, key: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(bucket) = state.get_mut(ns.as_str()) {
            bucket.remove(key);
        }
        Ok(())
    }

    async fn keys(&self, ns: Namespace, prefix: Option<&str>) -> Result<Vec<String>> {
        let state = self.state.read().await;
        let Some(bucket) = state.get(ns.as_str()) else {
            return Ok(Vec::new());
        };
        Ok(bucket
            .keys()
            .filter(|k| prefix.map(|p| k.starts_with(p)).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn keys_matching(&self, ns: Namespace, pattern: &Regex) -> Result<Vec<String>> {
        let state = self.state.read().await;
        let Some(bucket) = state.get(ns.as_str()) else {
            return Ok(Vec::new());
        };
        Ok(bucket.keys().filter(|k| pattern.is_match(k)).cloned().collect())
    }
}
