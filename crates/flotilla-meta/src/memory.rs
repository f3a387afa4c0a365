use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;
use tokio::sync::RwLock;

use crate::types::MetaStore;

/// In-memory store for tests and single-process deployments. BTreeMap keeps
/// prefix listings in stable key order.
#[derive(Debug, Clone, Default)]
pub struct MemoryMetaStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    revision: u64,
    kv: BTreeMap<String, (Vec<u8>, u64)>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_revision(inner: &mut Inner) -> u64 {
        inner.revision = inner.revision.saturating_add(1);
        inner.revision
    }
}

#[async_trait::async_trait]
impl MetaStore for MemoryMetaStore {
    async fn put(&self, key: &str, value: Vec<u8>, _ttl_ms: Option<u64>) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let rev = Self::next_revision(&mut inner);
        inner.kv.insert(key.to_string(), (value, rev));
        Ok(rev)
    }

    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let inner = self.inner.read().await;
        Ok(inner.kv.get(key).map(|(v, rev)| (v.clone(), *rev)))
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let mut inner = self.inner.write().await;
        inner.kv.remove(key);
        let rev = Self::next_revision(&mut inner);
        Ok(rev)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>> {
        let inner = self.inner.read().await;
        let mut out = Vec::new();
        for (k, (v, rev)) in inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
        {
            out.push((k.clone(), v.clone(), *rev));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryMetaStore::new();
        store.put("/a", b"1".to_vec(), None).await.unwrap();
        let (v, _) = store.get("/a").await.unwrap().unwrap();
        assert_eq!(v, b"1");

        store.delete("/a").await.unwrap();
        assert!(store.get("/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_prefix_is_ordered() {
        let store = MemoryMetaStore::new();
        store.put("/c/2", b"y".to_vec(), None).await.unwrap();
        store.put("/c/1", b"x".to_vec(), None).await.unwrap();
        store.put("/d/1", b"z".to_vec(), None).await.unwrap();

        let items = store.list_prefix("/c/").await.unwrap();
        let keys: Vec<&str> = items.iter().map(|(k, _, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["/c/1", "/c/2"]);
    }
}
