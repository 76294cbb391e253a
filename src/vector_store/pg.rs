//! Postgres + pgvector index driven from a private current-thread runtime.

use std::collections::HashSet;

use pgvector::Vector;
use tokio::runtime::{Builder, Runtime};
use tokio_postgres::types::Json;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, info, warn};

use super::{CollectionName, IndexMatch, UpsertBatch, VectorIndex};
use crate::artwork::ArtworkMetadata;
use crate::error::IndexError;

/// pgvector-backed collection store; one table per collection.
pub struct PgVectorIndex {
    runtime: Runtime,
    client: Client,
}

impl PgVectorIndex {
    /// Connects to Postgres at `database_url`.
    pub fn connect(database_url: &str) -> Result<Self, IndexError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| IndexError::Backend(format!("failed to start tokio runtime: {err}")))?;
        let (client, connection) = runtime
            .block_on(tokio_postgres::connect(database_url, NoTls))
            .map_err(backend("failed to connect to Postgres"))?;
        runtime.spawn(async move {
            if let Err(err) = connection.await {
                warn!(error = %err, "postgres connection error");
            }
        });
        Ok(Self { runtime, client })
    }

    fn table_dimension(&self, collection: &CollectionName) -> Result<Option<usize>, IndexError> {
        let qualified = collection.qualified();
        let row = self
            .runtime
            .block_on(self.client.query_opt(dimension_sql(), &[&qualified]))
            .map_err(backend("failed to inspect collection"))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let typmod: i32 = row
            .try_get(0)
            .map_err(backend("failed to read embedding dimension"))?;
        Ok(usize::try_from(typmod).ok())
    }

    fn exists(&self, collection: &CollectionName) -> Result<bool, IndexError> {
        let qualified = collection.qualified();
        let row = self
            .runtime
            .block_on(
                self.client
                    .query_one("SELECT to_regclass($1::text) IS NOT NULL", &[&qualified]),
            )
            .map_err(backend("failed to look up collection"))?;
        row.try_get(0).map_err(backend("failed to look up collection"))
    }
}

impl VectorIndex for PgVectorIndex {
    fn ensure_collection(
        &mut self,
        collection: &CollectionName,
        dimension: usize,
    ) -> Result<(), IndexError> {
        if dimension == 0 {
            return Err(IndexError::Backend(
                "embedding dimension must be positive".to_string(),
            ));
        }
        let statements = [
            "CREATE EXTENSION IF NOT EXISTS vector".to_string(),
            format!(
                "CREATE SCHEMA IF NOT EXISTS {}",
                super::quote_ident(collection.schema())
            ),
            create_table_sql(collection, dimension),
            create_index_sql(collection),
        ];
        self.runtime
            .block_on(async {
                for statement in &statements {
                    self.client.batch_execute(statement).await?;
                }
                Ok::<_, tokio_postgres::Error>(())
            })
            .map_err(backend("failed to prepare collection"))?;

        match self.table_dimension(collection)? {
            Some(existing) if existing != dimension => Err(IndexError::DimensionMismatch {
                collection: collection.label(),
                expected: existing,
                actual: dimension,
            }),
            _ => {
                debug!(collection = %collection.label(), dimension, "collection ready");
                Ok(())
            }
        }
    }

    fn reset(&mut self, collection: &CollectionName) -> Result<(), IndexError> {
        let sql = format!("DROP TABLE IF EXISTS {}", collection.qualified());
        self.runtime
            .block_on(self.client.batch_execute(&sql))
            .map_err(backend("failed to drop collection"))?;
        info!(collection = %collection.label(), "collection reset");
        Ok(())
    }

    fn upsert(
        &mut self,
        collection: &CollectionName,
        batch: &UpsertBatch,
    ) -> Result<(), IndexError> {
        if batch.is_empty() {
            return Ok(());
        }
        let sql = upsert_sql(collection);
        let client = &mut self.client;
        self.runtime
            .block_on(async {
                let transaction = client.transaction().await?;
                let statement = transaction.prepare(&sql).await?;
                for entry in batch.entries() {
                    let vector = Vector::from(entry.vector.clone());
                    let metadata = Json(&entry.metadata);
                    transaction
                        .execute(
                            &statement,
                            &[
                                &entry.id,
                                &entry.metadata.museum,
                                &metadata,
                                &entry.precision.as_str(),
                                &entry.model_version,
                                &vector,
                            ],
                        )
                        .await?;
                }
                transaction.commit().await
            })
            .map_err(backend("upsert transaction failed"))
    }

    fn query(
        &mut self,
        collection: &CollectionName,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<IndexMatch>, IndexError> {
        if !self.exists(collection)? {
            return Err(IndexError::MissingCollection(collection.label()));
        }
        let sql = select_sql(collection);
        let embedding = Vector::from(vector.to_vec());
        let limit = i64::try_from(top_k)
            .map_err(|_| IndexError::Backend(format!("top_k {top_k} exceeds i64 range")))?;
        let rows = self
            .runtime
            .block_on(self.client.query(&sql, &[&embedding, &limit]))
            .map_err(backend("similarity query failed"))?;
        rows.into_iter()
            .map(|row| {
                let id: String = row.try_get("id").map_err(backend("invalid id column"))?;
                let Json(metadata): Json<ArtworkMetadata> = row
                    .try_get("metadata")
                    .map_err(backend("invalid metadata column"))?;
                let distance: f64 = row
                    .try_get("distance")
                    .map_err(backend("invalid distance column"))?;
                Ok(IndexMatch {
                    id,
                    score: (1.0 - distance) as f32,
                    metadata,
                })
            })
            .collect()
    }

    fn count(&mut self, collection: &CollectionName) -> Result<usize, IndexError> {
        if !self.exists(collection)? {
            return Ok(0);
        }
        let sql = format!("SELECT COUNT(*) FROM {}", collection.qualified());
        let row = self
            .runtime
            .block_on(self.client.query_one(&sql, &[]))
            .map_err(backend("count query failed"))?;
        let total: i64 = row.try_get(0).map_err(backend("invalid count"))?;
        Ok(usize::try_from(total).unwrap_or(0))
    }

    fn existing_ids(
        &mut self,
        collection: &CollectionName,
        ids: &[String],
    ) -> Result<HashSet<String>, IndexError> {
        if ids.is_empty() || !self.exists(collection)? {
            return Ok(HashSet::new());
        }
        let sql = format!(
            "SELECT id FROM {} WHERE id = ANY($1)",
            collection.qualified()
        );
        let rows = self
            .runtime
            .block_on(self.client.query(&sql, &[&ids]))
            .map_err(backend("existing id lookup failed"))?;
        rows.iter()
            .map(|row| row.try_get::<_, String>(0).map_err(backend("invalid id column")))
            .collect()
    }
}

fn backend(context: &'static str) -> impl Fn(tokio_postgres::Error) -> IndexError {
    move |err| IndexError::Backend(format!("{context}: {err}"))
}

fn create_table_sql(collection: &CollectionName, dimension: usize) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (
            id TEXT PRIMARY KEY,
            museum TEXT NOT NULL,
            metadata JSONB NOT NULL,
            precision TEXT NOT NULL,
            model_version TEXT NOT NULL,
            embedding VECTOR({dimension}) NOT NULL
        )",
        collection.qualified()
    )
}

fn create_index_sql(collection: &CollectionName) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} USING hnsw (embedding vector_cosine_ops)",
        super::quote_ident(&collection.embedding_index_name()),
        collection.qualified()
    )
}

fn dimension_sql() -> &'static str {
    "SELECT a.atttypmod FROM pg_attribute a \
        WHERE a.attrelid = to_regclass($1::text) AND a.attname = 'embedding' AND NOT a.attisdropped"
}

fn upsert_sql(collection: &CollectionName) -> String {
    format!(
        "INSERT INTO {} \
            (id, museum, metadata, precision, model_version, embedding) \
            VALUES ($1, $2, $3, $4, $5, $6) \
            ON CONFLICT (id) DO UPDATE SET \
                museum = EXCLUDED.museum, \
                metadata = EXCLUDED.metadata, \
                precision = EXCLUDED.precision, \
                model_version = EXCLUDED.model_version, \
                embedding = EXCLUDED.embedding",
        collection.qualified()
    )
}

fn select_sql(collection: &CollectionName) -> String {
    format!(
        "SELECT id, metadata, embedding <=> $1 AS distance \
        FROM {} \
        ORDER BY distance ASC, id ASC \
        LIMIT $2",
        collection.qualified()
    )
}
