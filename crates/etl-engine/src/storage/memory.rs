//! Object store held in memory

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use super::ObjectStore;
use crate::error::{EngineError, EngineResult};

#[derive(Default)]
struct Objects {
    buckets: HashSet<String>,
    data: BTreeMap<(String, String), Vec<u8>>,
}

/// In-process object store with S3 bucket semantics
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<Objects>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Objects) -> EngineResult<T>) -> EngineResult<T> {
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| EngineError::Storage("object store lock poisoned".to_string()))?;
        f(&mut objects)
    }

    /// Keys in `bucket`, sorted
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.with(|o| {
            Ok(o.data
                .keys()
                .filter(|(b, _)| b == bucket)
                .map(|(_, k)| k.clone())
                .collect())
        })
        .unwrap_or_default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn ensure_bucket(&self, bucket: &str) -> EngineResult<()> {
        self.with(|o| {
            o.buckets.insert(bucket.to_string());
            Ok(())
        })
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        _content_type: Option<&str>,
    ) -> EngineResult<()> {
        self.with(|o| {
            if !o.buckets.contains(bucket) {
                return Err(EngineError::Storage(format!("no such bucket: {bucket}")));
            }
            o.data.insert((bucket.to_string(), key.to_string()), data);
            Ok(())
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> EngineResult<Vec<u8>> {
        self.with(|o| {
            o.data
                .get(&(bucket.to_string(), key.to_string()))
                .cloned()
                .ok_or_else(|| EngineError::Storage(format!("no such key: s3://{bucket}/{key}")))
        })
    }
}
