use crate::traits::{check_parallel_lengths, VectorIndex};
use crate::{ChunkMetadata, RetrievalHit, ServiceError, WriteMode};
use arrow_array::types::Float32Type;
use arrow_array::{
    Array, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator, StringArray, UInt64Array,
};
use arrow_schema::{ArrowError, DataType, Field, Schema};
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{connect, Connection, DistanceType, Table};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

fn collection_schema(dimensions: i32) -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("text", DataType::Utf8, false),
        Field::new("source", DataType::Utf8, false),
        Field::new("chunk", DataType::UInt64, false),
        Field::new(
            "vector",
            DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), dimensions),
            true,
        ),
    ]))
}

/// Embedded vector index: one LanceDB table per collection under a storage directory.
///
/// The table is created on the first add, with the vector width of that batch.
pub struct LocalVectorIndex {
    db: Connection,
    collection: String,
    write_mode: WriteMode,
    create_lock: Mutex<()>,
}

impl LocalVectorIndex {
    /// Opens the LanceDB database at `dir`; the collection is the table name.
    pub async fn open(
        dir: impl AsRef<Path>,
        collection: impl Into<String>,
        write_mode: WriteMode,
    ) -> Result<Self, ServiceError> {
        let uri = dir.as_ref().to_string_lossy().to_string();
        let db = connect(&uri).execute().await?;
        let collection = collection.into();
        debug!(collection = %collection, uri = %uri, "opened local index");

        Ok(Self {
            db,
            collection,
            write_mode,
            create_lock: Mutex::new(()),
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    async fn existing_table(&self) -> Result<Option<Table>, ServiceError> {
        let names = self.db.table_names().execute().await?;
        if !names.contains(&self.collection) {
            return Ok(None);
        }
        Ok(Some(self.db.open_table(&self.collection).execute().await?))
    }

    async fn table_for(&self, dimensions: i32) -> Result<Table, ServiceError> {
        let _guard = self.create_lock.lock().await;
        if let Some(table) = self.existing_table().await? {
            return Ok(table);
        }

        let empty = RecordBatchIterator::new(
            Vec::<Result<RecordBatch, ArrowError>>::new().into_iter(),
            collection_schema(dimensions),
        );
        match self.db.create_table(&self.collection, Box::new(empty)).execute().await {
            Ok(table) => {
                info!(collection = %self.collection, dimensions, "created local collection");
                Ok(table)
            }
            // another handle created it first
            Err(lancedb::Error::TableAlreadyExists { .. }) => {
                Ok(self.db.open_table(&self.collection).execute().await?)
            }
            Err(error) => Err(error.into()),
        }
    }
}

async fn vector_dimension(table: &Table) -> Result<i32, ServiceError> {
    let schema = table.schema().await?;
    match schema.field_with_name("vector").map(|field| field.data_type().clone()) {
        Ok(DataType::FixedSizeList(_, size)) => Ok(size),
        _ => Err(ServiceError::backend("local", "collection has no fixed-size vector column")),
    }
}

fn check_dimension(expected: i32, actual: usize) -> Result<(), ServiceError> {
    if i32::try_from(actual).ok() != Some(expected) {
        return Err(ServiceError::Request(format!(
            "embedding dimension {actual} != collection dimension {expected}"
        )));
    }
    Ok(())
}

/// Width shared by every vector of a batch.
fn batch_dimension(embeddings: &[Vec<f32>]) -> Result<i32, ServiceError> {
    let width = embeddings.first().map(Vec::len).unwrap_or_default();
    if width == 0 || embeddings.iter().any(|embedding| embedding.len() != width) {
        return Err(ServiceError::Request(
            "embeddings must be non-empty and share one dimension".to_string(),
        ));
    }
    i32::try_from(width).map_err(|_| ServiceError::Request(format!("embedding dimension {width} too large")))
}

fn record_batch(
    ids: &[String],
    texts: &[String],
    embeddings: &[Vec<f32>],
    metadatas: &[ChunkMetadata],
    dimensions: i32,
) -> Result<RecordBatch, ServiceError> {
    let sources: Vec<String> = metadatas.iter().map(|metadata| metadata.source.clone()).collect();
    let chunks: Vec<u64> = metadatas.iter().map(|metadata| metadata.chunk as u64).collect();
    let vectors = embeddings
        .iter()
        .map(|embedding| Some(embedding.iter().copied().map(Some).collect::<Vec<_>>()));

    Ok(RecordBatch::try_new(
        collection_schema(dimensions),
        vec![
            Arc::new(StringArray::from(ids.to_vec())),
            Arc::new(StringArray::from(texts.to_vec())),
            Arc::new(StringArray::from(sources)),
            Arc::new(UInt64Array::from(chunks)),
            Arc::new(FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(vectors, dimensions)),
        ],
    )?)
}

fn column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T, ServiceError> {
    batch
        .column_by_name(name)
        .and_then(|column| column.as_any().downcast_ref::<T>())
        .ok_or_else(|| ServiceError::backend("local", format!("search result without {name} column")))
}

fn scored_hits(batch: &RecordBatch) -> Result<Vec<(f32, RetrievalHit)>, ServiceError> {
    let texts = column::<StringArray>(batch, "text")?;
    let sources = column::<StringArray>(batch, "source")?;
    let chunks = column::<UInt64Array>(batch, "chunk")?;
    let distances = column::<Float32Array>(batch, "_distance")?;

    Ok((0..batch.num_rows())
        .map(|row| {
            let hit = RetrievalHit {
                text: texts.value(row).to_string(),
                metadata: ChunkMetadata {
                    source: sources.value(row).to_string(),
                    chunk: chunks.value(row) as usize,
                },
            };
            (distances.value(row), hit)
        })
        .collect())
}

#[async_trait]
impl VectorIndex for LocalVectorIndex {
    async fn add(
        &self,
        ids: &[String],
        texts: &[String],
        embeddings: &[Vec<f32>],
        metadatas: &[ChunkMetadata],
    ) -> Result<(), ServiceError> {
        check_parallel_lengths(ids, texts, embeddings, metadatas)?;
        if ids.is_empty() {
            return Ok(());
        }

        let dimensions = batch_dimension(embeddings)?;
        let table = self.table_for(dimensions).await?;
        check_dimension(vector_dimension(&table).await?, embeddings[0].len())?;

        let batch = record_batch(ids, texts, embeddings, metadatas, dimensions)?;
        let schema = batch.schema();
        let reader = Box::new(RecordBatchIterator::new(vec![Ok(batch)].into_iter(), schema));

        match self.write_mode {
            WriteMode::Upsert => {
                let mut merge = table.merge_insert(&["id"]);
                merge.when_matched_update_all(None).when_not_matched_insert_all();
                merge.execute(reader).await?;
            }
            WriteMode::Append => {
                table.add(reader).execute().await?;
            }
        }
        debug!(collection = %self.collection, records = ids.len(), "stored records");
        Ok(())
    }

    async fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<RetrievalHit>, ServiceError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let Some(table) = self.existing_table().await? else {
            return Ok(Vec::new());
        };
        check_dimension(vector_dimension(&table).await?, embedding.len())?;

        let mut results = table
            .vector_search(embedding.to_vec())?
            .distance_type(DistanceType::Cosine)
            .limit(k)
            .execute()
            .await?;

        let mut scored = Vec::new();
        while let Some(batch) = results.try_next().await? {
            scored.extend(scored_hits(&batch)?);
        }
        scored.sort_by(|left, right| left.0.total_cmp(&right.0));

        Ok(scored.into_iter().take(k).map(|(_, hit)| hit).collect())
    }

    async fn count(&self) -> Result<usize, ServiceError> {
        match self.existing_table().await? {
            Some(table) => Ok(table.count_rows(None).await?),
            None => Ok(0),
        }
    }
}

/// Index in a fresh temporary directory; the directory lives as long as the returned guard.
#[cfg(test)]
pub(crate) async fn scratch_index(
    write_mode: WriteMode,
) -> Result<(tempfile::TempDir, LocalVectorIndex), ServiceError> {
    let dir = tempfile::tempdir()?;
    let index = LocalVectorIndex::open(dir.path(), "docs", write_mode).await?;
    Ok((dir, index))
}
