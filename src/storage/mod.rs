//! Concrete [`crate::traits::VectorStore`] adapter: one LanceDB table plus
//! one [`crate::search::text_search::TextSearch`] Tantivy index per physical
//! index name, one pair per document index rather than one pair for the
//! whole corpus, matching the index router's per-document sharding.
//!
//! LanceDB stays the single source of truth for a chunk's full fields: each
//! row carries the queryable `id`/`document_id`/`source`/`page`/
//! `chunk_index`/`vector` columns plus a `chunk_json` column holding the
//! chunk's full serialized form, so the lexical leg (which only knows ids
//! and text) can resolve a hit back to a complete [`Chunk`] with one lookup.

use crate::search::text_search::TextSearch;
use crate::traits::{LexicalQuery, StoreHit, VectorQuery, VectorStore};
use crate::types::{Chunk, MetadataFilter};
use anyhow::{Context, Result};
use arrow_array::{Array, Float32Array, RecordBatch, RecordBatchIterator, StringArray, UInt32Array, FixedSizeListArray};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use std::path::PathBuf;
use std::sync::Arc;

fn sql_quote(value: &str) -> String {
    value.replace('\'', "''")
}

/// Build the `only_if` SQL predicate for a [`MetadataFilter`]. `date_from`/
/// `date_to`/`custom` have no backing column in this store's schema (the
/// chunk data model carries no timestamp or arbitrary key-value fields) and
/// are accepted but not enforced, matching `search::executor::filter_from_metadata`'s
/// own `None` defaults for those fields.
fn predicate_from_filter(filter: &MetadataFilter) -> Option<String> {
    let mut clauses = Vec::new();
    if let Some(source) = &filter.source {
        clauses.push(format!("source = '{}'", sql_quote(source)));
    }
    if let Some(document_id) = &filter.document_id {
        clauses.push(format!("document_id = '{}'", sql_quote(document_id)));
    }
    if clauses.is_empty() {
        None
    } else {
        Some(clauses.join(" AND "))
    }
}

struct TextIndex {
    search: TextSearch,
}

/// One physical index: a LanceDB table named `index_name` plus a Tantivy
/// directory `<base_dir>/tantivy/<index_name>`, created lazily on first use.
pub struct LanceTantivyStore {
    db: lancedb::Connection,
    base_dir: PathBuf,
    text_indexes: DashMap<String, Arc<TextIndex>>,
}

impl LanceTantivyStore {
    pub async fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir).ok();
        let lance_dir = base_dir.join("lancedb");
        std::fs::create_dir_all(&lance_dir).ok();
        let db = lancedb::connect(&lance_dir.to_string_lossy())
            .execute()
            .await
            .context("failed to connect to LanceDB")?;
        Ok(Self {
            db,
            base_dir,
            text_indexes: DashMap::new(),
        })
    }

    fn schema(dimension: usize) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("document_id", DataType::Utf8, false),
            Field::new("source", DataType::Utf8, false),
            Field::new("page", DataType::UInt32, false),
            Field::new("chunk_index", DataType::UInt32, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), dimension as i32),
                true,
            ),
            Field::new("chunk_json", DataType::Utf8, false),
        ]))
    }

    fn text_index(&self, index_name: &str) -> Result<Arc<TextIndex>> {
        if let Some(existing) = self.text_indexes.get(index_name) {
            return Ok(existing.clone());
        }
        let path = self.base_dir.join("tantivy").join(index_name);
        std::fs::create_dir_all(&path).ok();
        let path_str = path.to_string_lossy().into_owned();
        let search = TextSearch::new(&path_str)
            .with_context(|| format!("failed to open Tantivy index for '{index_name}'"))?;
        let entry = Arc::new(TextIndex { search });
        self.text_indexes.insert(index_name.to_string(), entry.clone());
        Ok(entry)
    }

    fn row_to_chunk(batch: &RecordBatch, row: usize) -> Option<Chunk> {
        let chunk_json = batch
            .column_by_name("chunk_json")?
            .as_any()
            .downcast_ref::<StringArray>()?;
        serde_json::from_str(chunk_json.value(row)).ok()
    }

    fn batches_to_hits(batches: &[RecordBatch], score_from_distance: bool) -> Vec<StoreHit> {
        let mut hits = Vec::new();
        for batch in batches {
            let distances = batch.column_by_name("_distance").and_then(|c| c.as_any().downcast_ref::<Float32Array>());
            for row in 0..batch.num_rows() {
                let Some(chunk) = Self::row_to_chunk(batch, row) else { continue };
                let score = if score_from_distance {
                    distances.map(|d| (1.0 - d.value(row)).max(0.0)).unwrap_or(0.0)
                } else {
                    0.0
                };
                hits.push(StoreHit { chunk, score });
            }
        }
        hits
    }

    /// Insert or replace chunks in `index_name`'s table, creating the table
    /// with `dimension` if it does not exist yet. Called by the ingestion
    /// pipeline (out of this crate's scope); exposed here so a caller can
    /// populate an index without going through the `VectorStore` trait
    /// object, which only exposes query-path operations.
    pub async fn upsert_chunks(&self, index_name: &str, dimension: usize, chunks: &[Chunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        self.ensure_index(index_name, dimension).await?;
        let table = self.db.open_table(index_name).execute().await?;

        let schema = Self::schema(dimension);
        let ids: Vec<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
        let document_ids: Vec<&str> = chunks.iter().map(|c| c.document_id.as_str()).collect();
        let sources: Vec<&str> = chunks.iter().map(|c| c.source.as_str()).collect();
        let pages: Vec<u32> = chunks.iter().map(|c| c.page).collect();
        let chunk_indices: Vec<u32> = chunks.iter().map(|c| c.chunk_index as u32).collect();
        let jsons: Vec<String> = chunks
            .iter()
            .map(|c| serde_json::to_string(c).unwrap_or_default())
            .collect();

        let flat_vectors: Vec<f32> = chunks
            .iter()
            .flat_map(|c| {
                let mut v = c.vector.clone();
                v.resize(dimension, 0.0);
                v
            })
            .collect();
        let values = Float32Array::from(flat_vectors);
        let vector_field = Field::new("item", DataType::Float32, true);
        let vector_array = FixedSizeListArray::new(
            Arc::new(vector_field),
            dimension as i32,
            Arc::new(values) as Arc<dyn Array>,
            None,
        );

        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(ids)) as Arc<dyn Array>,
                Arc::new(StringArray::from(document_ids)),
                Arc::new(StringArray::from(sources)),
                Arc::new(UInt32Array::from(pages)),
                Arc::new(UInt32Array::from(chunk_indices)),
                Arc::new(vector_array) as Arc<dyn Array>,
                Arc::new(StringArray::from(jsons)),
            ],
        )
        .context("failed to build chunk RecordBatch")?;

        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);
        table.add(Box::new(reader)).execute().await.context("failed to insert chunks")?;

        let text_index = self.text_index(index_name)?;
        let rows: Vec<(String, String, String, String)> = chunks
            .iter()
            .map(|c| (c.id.clone(), c.text.clone(), String::new(), c.source.clone()))
            .collect();
        text_index.search.index_chunks_batch(&rows)?;
        text_index.search.commit()?;

        Ok(())
    }
}

#[async_trait]
impl VectorStore for LanceTantivyStore {
    async fn vector_search(&self, index_name: &str, query: &VectorQuery) -> Result<Vec<StoreHit>> {
        if !self.index_exists(index_name).await? {
            return Ok(Vec::new());
        }
        let table = self.db.open_table(index_name).execute().await?;
        let mut builder = table.query().nearest_to(query.vector.as_slice())?;
        builder = builder.distance_type(lancedb::DistanceType::Cosine).limit(query.fetch_k);
        if let Some(filter) = query.filter.as_ref().and_then(predicate_from_filter) {
            builder = builder.only_if(filter);
        }
        let stream = builder.execute().await.context("LanceDB vector search failed")?;
        let batches: Vec<RecordBatch> = stream.try_collect().await?;
        let mut hits = Self::batches_to_hits(&batches, true);
        if let Some(min_score) = query.min_score {
            hits.retain(|h| h.score >= min_score);
        }
        Ok(hits)
    }

    async fn lexical_search(&self, index_name: &str, query: &LexicalQuery) -> Result<Vec<StoreHit>> {
        if !self.index_exists(index_name).await? {
            return Ok(Vec::new());
        }
        let text_index = self.text_index(index_name)?;
        let source_filter = query.filter.as_ref().and_then(|f| f.source.as_deref());

        let mut hits_by_id: std::collections::HashMap<String, f32> = std::collections::HashMap::new();
        for (id, score) in text_index.search.search_filtered(&query.text, query.fetch_k, source_filter)? {
            hits_by_id.entry(id).and_modify(|s| *s = s.max(score)).or_insert(score);
        }
        // Cross-language alternate-text leg, boosted down relative to the
        // primary-language match per the alt_* weights in the config.
        if let Some(alternate) = &query.alternate_text {
            for (id, score) in text_index.search.search_filtered(alternate, query.fetch_k, source_filter)? {
                let boosted = score * (query.boost_alt_multi_match / query.boost_fuzzy_multi_match.max(1.0)).max(0.1);
                hits_by_id.entry(id).and_modify(|s| *s = s.max(boosted)).or_insert(boosted);
            }
        }

        if hits_by_id.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = hits_by_id.keys().cloned().collect();
        let chunks = self.fetch_by_ids(index_name, &ids).await?;
        Ok(chunks
            .into_iter()
            .filter_map(|chunk| hits_by_id.get(&chunk.id).map(|score| StoreHit { chunk, score: *score }))
            .collect())
    }

    async fn delete_by_document(&self, index_name: &str, document_id: &str) -> Result<()> {
        if !self.index_exists(index_name).await? {
            return Ok(());
        }
        let table = self.db.open_table(index_name).execute().await?;
        let predicate = format!("document_id = '{}'", sql_quote(document_id));

        let stream = table.query().only_if(predicate.clone()).execute().await?;
        let batches: Vec<RecordBatch> = stream.try_collect().await?;
        let ids: Vec<String> = batches
            .iter()
            .enumerate()
            .flat_map(|(_, batch)| (0..batch.num_rows()).filter_map(move |row| Self::row_to_chunk(batch, row)))
            .map(|c| c.id)
            .collect();

        table.delete(&predicate).await.context("failed to delete chunks by document")?;

        if let Ok(text_index) = self.text_index(index_name) {
            for id in &ids {
                text_index.search.delete_by_id(id).ok();
            }
            text_index.search.commit().ok();
        }
        Ok(())
    }

    async fn ensure_index(&self, index_name: &str, dimension: usize) -> Result<()> {
        let names = self.db.table_names().execute().await?;
        if names.contains(&index_name.to_string()) {
            return Ok(());
        }
        let schema = Self::schema(dimension);
        let batches = RecordBatchIterator::new(Vec::<Result<RecordBatch, arrow_schema::ArrowError>>::new(), schema);
        self.db
            .create_table(index_name, Box::new(batches))
            .execute()
            .await
            .context("failed to create index table")?;
        self.text_index(index_name)?;
        Ok(())
    }

    async fn delete_index(&self, index_name: &str) -> Result<()> {
        let names = self.db.table_names().execute().await?;
        if names.contains(&index_name.to_string()) {
            self.db.drop_table(index_name, &[]).await.ok();
        }
        self.text_indexes.remove(index_name);
        let path = self.base_dir.join("tantivy").join(index_name);
        std::fs::remove_dir_all(path).ok();
        Ok(())
    }

    async fn index_exists(&self, index_name: &str) -> Result<bool> {
        let names = self.db.table_names().execute().await?;
        Ok(names.contains(&index_name.to_string()))
    }

    async fn index_dimension(&self, index_name: &str) -> Result<Option<usize>> {
        if !self.index_exists(index_name).await? {
            return Ok(None);
        }
        let table = self.db.open_table(index_name).execute().await?;
        let schema = table.schema().await?;
        let Some(field) = schema.column_with_name("vector") else {
            return Ok(None);
        };
        match field.1.data_type() {
            DataType::FixedSizeList(_, len) => Ok(Some(*len as usize)),
            _ => Ok(None),
        }
    }

    async fn count(&self, index_name: &str) -> Result<usize> {
        if !self.index_exists(index_name).await? {
            return Ok(0);
        }
        let table = self.db.open_table(index_name).execute().await?;
        Ok(table.count_rows(None).await?)
    }

    async fn all_chunks(&self, index_name: &str) -> Result<Vec<Chunk>> {
        if !self.index_exists(index_name).await? {
            return Ok(Vec::new());
        }
        let table = self.db.open_table(index_name).execute().await?;
        let stream = table.query().execute().await.context("LanceDB scan failed")?;
        let batches: Vec<RecordBatch> = stream.try_collect().await?;
        Ok(batches
            .iter()
            .flat_map(|batch| (0..batch.num_rows()).filter_map(move |row| Self::row_to_chunk(batch, row)))
            .collect())
    }
}

impl LanceTantivyStore {
    async fn fetch_by_ids(&self, index_name: &str, ids: &[String]) -> Result<Vec<Chunk>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let table = self.db.open_table(index_name).execute().await?;
        let mut out = Vec::with_capacity(ids.len());
        for chunk_ids in ids.chunks(100) {
            let quoted: Vec<String> = chunk_ids.iter().map(|id| format!("'{}'", sql_quote(id))).collect();
            let predicate = format!("id IN ({})", quoted.join(", "));
            let stream = table.query().only_if(predicate).execute().await.context("LanceDB id lookup failed")?;
            let batches: Vec<RecordBatch> = stream.try_collect().await?;
            out.extend(batches.iter().flat_map(|batch| (0..batch.num_rows()).filter_map(move |row| Self::row_to_chunk(batch, row))));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContentType, MetadataFilter};

    fn chunk(id: &str, document_id: &str, text: &str, vector: Vec<f32>) -> Chunk {
        Chunk {
            id: id.to_string(),
            text: text.to_string(),
            vector,
            source: "handbook.pdf".to_string(),
            document_id: document_id.to_string(),
            page: 1,
            start_char: 0,
            end_char: text.len(),
            chunk_index: 0,
            language: "eng".to_string(),
            content_type: ContentType::Text,
            page_blocks: vec![],
            image_ref: None,
            text_english: None,
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn ensure_index_then_upsert_then_vector_search_round_trips_chunk() {
        let dir = tempfile_dir();
        let store = LanceTantivyStore::new(&dir).await.unwrap();
        let c = chunk("c1", "doc-1", "the quick brown fox", vec![1.0, 0.0, 0.0]);
        store.upsert_chunks("idx-doc-1", 3, &[c]).await.unwrap();

        let query = VectorQuery {
            vector: vec![1.0, 0.0, 0.0],
            fetch_k: 5,
            ef_search: 64,
            min_score: None,
            filter: None,
        };
        let hits = store.vector_search("idx-doc-1", &query).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.id, "c1");
    }

    #[tokio::test]
    async fn delete_by_document_removes_chunk_from_both_backends() {
        let dir = tempfile_dir();
        let store = LanceTantivyStore::new(&dir).await.unwrap();
        let c = chunk("c1", "doc-1", "the quick brown fox", vec![1.0, 0.0, 0.0]);
        store.upsert_chunks("idx-doc-1", 3, &[c]).await.unwrap();
        store.delete_by_document("idx-doc-1", "doc-1").await.unwrap();
        assert_eq!(store.count("idx-doc-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn index_dimension_reports_none_for_missing_index() {
        let dir = tempfile_dir();
        let store = LanceTantivyStore::new(&dir).await.unwrap();
        assert_eq!(store.index_dimension("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn metadata_filter_with_only_unsupported_fields_yields_no_predicate() {
        let filter = MetadataFilter { date_from: Some(1), ..Default::default() };
        assert_eq!(predicate_from_filter(&filter), None);
    }

    fn tempfile_dir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("retrieval-core-test-{}", uuid::Uuid::new_v4()));
        dir
    }
}
