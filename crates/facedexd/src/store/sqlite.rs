use super::{validate, EmbeddingStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use facedex_core::{Embedding, Identity};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::path::Path;
use tokio_rusqlite::Connection;

const SCHEMA: &str = "
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS identities (
        name     TEXT PRIMARY KEY NOT NULL,
        created  TEXT NOT NULL,
        updated  TEXT
    );

    CREATE TABLE IF NOT EXISTS embeddings (
        id        INTEGER PRIMARY KEY AUTOINCREMENT,
        identity  TEXT NOT NULL REFERENCES identities(name),
        position  INTEGER NOT NULL,
        dim       INTEGER NOT NULL,
        vector    BLOB NOT NULL,
        UNIQUE (identity, position)
    );
";

/// Persistent store in a single SQLite file.
///
/// Vectors are kept as little-endian `f32` blobs. Each upsert runs in one
/// `BEGIN IMMEDIATE` transaction.
pub struct SqliteStore {
    conn: Connection,
    dimension: usize,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    ///
    /// Fails if embeddings already stored there have a different
    /// dimensionality than `dimension`.
    pub async fn open(path: &Path, dimension: usize) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("creating {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path).await.map_err(unavailable)?;
        conn.call(|c| {
            c.pragma_update(None, "journal_mode", "WAL")?;
            Ok(())
        })
        .await
        .map_err(unavailable)?;
        Self::init(conn, dimension).await
    }

    /// Private database that disappears with the connection.
    pub async fn open_in_memory(dimension: usize) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await.map_err(unavailable)?;
        Self::init(conn, dimension).await
    }

    async fn init(conn: Connection, dimension: usize) -> Result<Self, StoreError> {
        let found: Option<i64> = conn
            .call(|c| {
                c.execute_batch(SCHEMA)?;
                Ok(c.query_row("SELECT DISTINCT dim FROM embeddings LIMIT 1", [], |r| r.get(0))
                    .optional()?)
            })
            .await
            .map_err(unavailable)?;

        if let Some(found) = found {
            if found as usize != dimension {
                return Err(StoreError::DimensionMismatch {
                    expected: dimension,
                    found: found as usize,
                });
            }
        }

        Ok(Self { conn, dimension })
    }
}

fn unavailable(e: tokio_rusqlite::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn write_failure(e: tokio_rusqlite::Error) -> StoreError {
    StoreError::WriteFailure(e.to_string())
}

fn encode_vector(embedding: &Embedding) -> Vec<u8> {
    embedding.values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(blob: &[u8], dim: usize, column: usize) -> rusqlite::Result<Embedding> {
    if blob.len() != dim * 4 {
        return Err(rusqlite::Error::FromSqlConversionFailure(
            column,
            Type::Blob,
            format!("vector blob has {} bytes, expected {}", blob.len(), dim * 4).into(),
        ));
    }
    Ok(Embedding::new(
        blob.chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    ))
}

/// Read back one identity with its embeddings in append order.
fn load_identity(c: &rusqlite::Connection, name: &str) -> rusqlite::Result<Identity> {
    let (created, updated): (DateTime<Utc>, Option<DateTime<Utc>>) = c.query_row(
        "SELECT created, updated FROM identities WHERE name = ?1",
        [name],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;

    let mut stmt =
        c.prepare("SELECT dim, vector FROM embeddings WHERE identity = ?1 ORDER BY position")?;
    let embeddings = stmt
        .query_map([name], |r| {
            let dim: i64 = r.get(0)?;
            let blob: Vec<u8> = r.get(1)?;
            decode_vector(&blob, dim as usize, 1)
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(Identity {
        name: name.to_string(),
        embeddings,
        created,
        updated,
    })
}

#[async_trait]
impl EmbeddingStore for SqliteStore {
    async fn upsert(&self, name: &str, embedding: Embedding) -> Result<Identity, StoreError> {
        validate(name, &embedding, self.dimension)?;

        let name = name.to_string();
        let dim = embedding.dimension() as i64;
        let blob = encode_vector(&embedding);
        let now = Utc::now();

        self.conn
            .call(move |c| {
                let tx = c.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let touched = tx.execute(
                    "UPDATE identities SET updated = ?2 WHERE name = ?1",
                    params![name, now],
                )?;
                if touched == 0 {
                    tx.execute(
                        "INSERT INTO identities (name, created) VALUES (?1, ?2)",
                        params![name, now],
                    )?;
                }

                let position: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM embeddings WHERE identity = ?1",
                    [&name],
                    |r| r.get(0),
                )?;
                tx.execute(
                    "INSERT INTO embeddings (identity, position, dim, vector) VALUES (?1, ?2, ?3, ?4)",
                    params![name, position, dim, blob],
                )?;

                let identity = load_identity(&tx, &name)?;
                tx.commit()?;
                Ok(identity)
            })
            .await
            .map_err(write_failure)
    }

    async fn list_all(&self) -> Result<Vec<Identity>, StoreError> {
        self.conn
            .call(|c| {
                let mut identities: Vec<Identity> = c
                    .prepare("SELECT name, created, updated FROM identities ORDER BY rowid")?
                    .query_map([], |r| {
                        Ok(Identity {
                            name: r.get(0)?,
                            embeddings: Vec::new(),
                            created: r.get(1)?,
                            updated: r.get(2)?,
                        })
                    })?
                    .collect::<rusqlite::Result<_>>()?;

                let index: HashMap<String, usize> = identities
                    .iter()
                    .enumerate()
                    .map(|(i, identity)| (identity.name.clone(), i))
                    .collect();

                let mut stmt = c.prepare(
                    "SELECT identity, dim, vector FROM embeddings ORDER BY identity, position",
                )?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    let owner: String = row.get(0)?;
                    let dim: i64 = row.get(1)?;
                    let blob: Vec<u8> = row.get(2)?;
                    if let Some(&i) = index.get(&owner) {
                        identities[i].embeddings.push(decode_vector(&blob, dim as usize, 2)?);
                    }
                }

                Ok(identities)
            })
            .await
            .map_err(unavailable)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        self.conn
            .call(|c| Ok(c.query_row("SELECT COUNT(*) FROM identities", [], |r| r.get::<_, i64>(0))?))
            .await
            .map(|n| n as usize)
            .map_err(unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_create_then_append() {
        let store = SqliteStore::open_in_memory(3).await.unwrap();
        contract::create_then_append(&store).await;
    }

    #[tokio::test]
    async fn test_names_are_case_sensitive_and_ordered() {
        let store = SqliteStore::open_in_memory(3).await.unwrap();
        contract::names_are_case_sensitive_and_ordered(&store).await;
    }

    #[tokio::test]
    async fn test_rejects_invalid_input() {
        let store = SqliteStore::open_in_memory(3).await.unwrap();
        contract::rejects_invalid_input(&store).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_are_not_lost() {
        let store = SqliteStore::open_in_memory(3).await.unwrap();
        contract::concurrent_appends_are_not_lost(Arc::new(store)).await;
    }

    #[test]
    fn test_vector_blob_roundtrip() {
        let embedding = Embedding::new(vec![1.5, -0.25, f32::MIN_POSITIVE]);
        let blob = encode_vector(&embedding);
        assert_eq!(blob.len(), 12);
        assert_eq!(decode_vector(&blob, 3, 0).unwrap(), embedding);
        assert!(decode_vector(&blob, 4, 0).is_err());
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = std::env::temp_dir().join(format!("facedex-store-{}", std::process::id()));
        let path = dir.join("faces.db");
        let _ = std::fs::remove_file(&path);

        {
            let store = SqliteStore::open(&path, 3).await.unwrap();
            store.upsert("Alice", Embedding::new(vec![0.1, 0.2, 0.3])).await.unwrap();
            store.upsert("Alice", Embedding::new(vec![0.3, 0.2, 0.1])).await.unwrap();
        }

        let reopened = SqliteStore::open(&path, 3).await.unwrap();
        let all = reopened.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].embeddings[1], Embedding::new(vec![0.3, 0.2, 0.1]));

        let err = SqliteStore::open(&path, 512).await.err();
        assert!(matches!(
            err,
            Some(StoreError::DimensionMismatch { expected: 512, found: 3 })
        ));

        std::fs::remove_dir_all(&dir).ok();
    }
}
