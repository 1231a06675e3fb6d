use super::{validate, EmbeddingStore, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use facedex_core::{Embedding, Identity};
use tokio::sync::RwLock;

/// Process-lifetime store. Contents are lost on restart.
pub struct MemoryStore {
    dimension: usize,
    identities: RwLock<Vec<Identity>>,
}

impl MemoryStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            identities: RwLock::new(Vec::new()),
        }
    }
}

#[async_trait]
impl EmbeddingStore for MemoryStore {
    async fn upsert(&self, name: &str, embedding: Embedding) -> Result<Identity, StoreError> {
        validate(name, &embedding, self.dimension)?;

        // Held across find-and-append so same-name writers serialise.
        let mut identities = self.identities.write().await;
        let now = Utc::now();

        let identity = match identities.iter_mut().find(|i| i.name == name) {
            Some(existing) => {
                existing.embeddings.push(embedding);
                existing.updated = Some(now);
                existing.clone()
            }
            None => {
                let identity = Identity::new(name, embedding, now);
                identities.push(identity.clone());
                identity
            }
        };
        Ok(identity)
    }

    async fn list_all(&self) -> Result<Vec<Identity>, StoreError> {
        Ok(self.identities.read().await.clone())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.identities.read().await.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_create_then_append() {
        contract::create_then_append(&MemoryStore::new(3)).await;
    }

    #[tokio::test]
    async fn test_names_are_case_sensitive_and_ordered() {
        contract::names_are_case_sensitive_and_ordered(&MemoryStore::new(3)).await;
    }

    #[tokio::test]
    async fn test_rejects_invalid_input() {
        contract::rejects_invalid_input(&MemoryStore::new(3)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_are_not_lost() {
        contract::concurrent_appends_are_not_lost(Arc::new(MemoryStore::new(3))).await;
    }
}
