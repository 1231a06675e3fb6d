//! Embedding store: named identities, each with an append-only list of embeddings.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use facedex_core::{Embedding, Identity};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("stored embeddings have {found} dimensions but the embedder produces {expected}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store write failed: {0}")]
    WriteFailure(String),
}

/// Shared registry of identities.
///
/// `upsert` is atomic per identity: concurrent registrations under the same
/// name never lose an append.
#[async_trait]
pub trait EmbeddingStore: Send + Sync {
    /// Append `embedding` to `name`, creating the identity if it does not exist.
    /// Returns the identity as stored after the write.
    async fn upsert(&self, name: &str, embedding: Embedding) -> Result<Identity, StoreError>;

    /// Snapshot of every identity with all of its embeddings, in registration order.
    async fn list_all(&self) -> Result<Vec<Identity>, StoreError>;

    /// Number of registered identities.
    async fn count(&self) -> Result<usize, StoreError>;
}

/// Reject blank names and embeddings that do not fit the store or hold
/// non-finite values.
fn validate(name: &str, embedding: &Embedding, dimension: usize) -> Result<(), StoreError> {
    if name.trim().is_empty() {
        return Err(StoreError::Validation("name must not be empty".into()));
    }
    if embedding.is_empty() {
        return Err(StoreError::Validation("embedding must not be empty".into()));
    }
    if embedding.dimension() != dimension {
        return Err(StoreError::Validation(format!(
            "embedding has {} dimensions, expected {dimension}",
            embedding.dimension()
        )));
    }
    if embedding.values.iter().any(|v| !v.is_finite()) {
        return Err(StoreError::Validation(
            "embedding must contain only finite values".into(),
        ));
    }
    Ok(())
}

/// Behaviour every backend must share, run against each implementation.
#[cfg(test)]
pub(crate) mod contract {
    use super::*;
    use std::sync::Arc;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    pub async fn create_then_append(store: &dyn EmbeddingStore) {
        let created = store.upsert("Alice", emb(&[0.1, 0.2, 0.3])).await.unwrap();
        assert_eq!(created.embeddings.len(), 1);
        assert!(created.updated.is_none());

        let appended = store.upsert("Alice", emb(&[0.4, 0.5, 0.6])).await.unwrap();
        assert_eq!(appended.created, created.created);
        assert!(appended.updated.is_some());
        assert_eq!(appended.embeddings, vec![emb(&[0.1, 0.2, 0.3]), emb(&[0.4, 0.5, 0.6])]);

        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "Alice");
        assert_eq!(all[0].embeddings.len(), 2);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    pub async fn names_are_case_sensitive_and_ordered(store: &dyn EmbeddingStore) {
        store.upsert("bob", emb(&[1.0, 0.0, 0.0])).await.unwrap();
        store.upsert("Bob", emb(&[0.0, 1.0, 0.0])).await.unwrap();
        store.upsert("alice", emb(&[0.0, 0.0, 1.0])).await.unwrap();
        store.upsert("bob", emb(&[1.0, 1.0, 0.0])).await.unwrap();

        let all = store.list_all().await.unwrap();
        let names: Vec<&str> = all.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["bob", "Bob", "alice"]);
        assert_eq!(store.count().await.unwrap(), 3);

        // Interleaved appends stay with their owner, in append order.
        assert_eq!(all[0].embeddings, vec![emb(&[1.0, 0.0, 0.0]), emb(&[1.0, 1.0, 0.0])]);
        assert_eq!(all[1].embeddings, vec![emb(&[0.0, 1.0, 0.0])]);
        assert_eq!(all[2].embeddings, vec![emb(&[0.0, 0.0, 1.0])]);
    }

    pub async fn rejects_invalid_input(store: &dyn EmbeddingStore) {
        for (name, embedding) in [
            ("", emb(&[0.0, 0.0, 0.0])),
            ("   ", emb(&[0.0, 0.0, 0.0])),
            ("carol", emb(&[])),
            ("carol", emb(&[0.0, 0.0])),
            ("carol", emb(&[0.0, f32::NAN, 0.0])),
            ("carol", emb(&[f32::INFINITY, 0.0, 0.0])),
        ] {
            let err = store.upsert(name, embedding).await.unwrap_err();
            assert!(matches!(err, StoreError::Validation(_)), "{err}");
        }
        assert!(store.list_all().await.unwrap().is_empty());
    }

    pub async fn concurrent_appends_are_not_lost(store: Arc<dyn EmbeddingStore>) {
        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.upsert("crowd", emb(&[i as f32, 0.0, 0.0])).await.unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].embeddings.len(), 16);
    }
}
