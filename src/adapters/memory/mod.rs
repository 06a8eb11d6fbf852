//! In-process document store with the same query semantics as the MongoDB
//! adapter. Used by tests and by `backend: memory`.

mod aggregate;
mod eval;

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use futures::StreamExt;
use mongodb::bson::{Bson, Document};

use crate::config::types::AppUser;
use crate::domain::filter::Filter;
use crate::domain::geo::GeoPoint;
use crate::domain::index::IndexSpec;
use crate::domain::listing::{ListingId, ensure_object_id};
use crate::domain::pipeline::Pipeline;
use crate::domain::query::FindQuery;
use crate::domain::schema::{self, fields};
use crate::domain::value::{add_numbers, compare, get_path, set_path, values_equal};
use crate::error::{ListingsError, Result};
use crate::ports::listing_store::{
    CollectionStats, DocumentStream, IndexReport, ListingStore, UpdateOutcome,
};

use aggregate::{sort_documents, to_usize};
use eval::CompiledFilter;

#[derive(Default)]
struct MemoryState {
    documents: Vec<Document>,
    collection_exists: bool,
    validated: bool,
    indexes: Vec<IndexSpec>,
    users: Vec<String>,
    closed: bool,
}

impl MemoryState {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(ListingsError::Connectivity {
                reason: "store has been closed".into(),
            });
        }
        Ok(())
    }

    fn text_fields(&self) -> Vec<String> {
        self.indexes
            .iter()
            .filter(|i| i.is_text())
            .flat_map(|i| i.fields().map(str::to_string).collect::<Vec<_>>())
            .collect()
    }

    fn compile(&self, filter: &Filter) -> Result<CompiledFilter> {
        CompiledFilter::compile(filter, &self.text_fields())
    }

    fn matching_positions(&self, filter: &Filter) -> Result<Vec<usize>> {
        let compiled = self.compile(filter)?;
        Ok(self
            .documents
            .iter()
            .enumerate()
            .filter(|(_, d)| compiled.matches(d))
            .map(|(i, _)| i)
            .collect())
    }

    fn insert(&mut self, mut doc: Document) -> Result<ListingId> {
        let id = ensure_object_id(&mut doc)?;
        if self.validated {
            schema::validate_document(&doc)?;
        }
        if self
            .documents
            .iter()
            .any(|d| d.get(fields::ID) == Some(&Bson::from(id)))
        {
            return Err(ListingsError::Database(format!(
                "E11000 duplicate key error: _id {id}"
            )));
        }
        self.documents.push(doc);
        self.collection_exists = true;
        Ok(id)
    }

    fn check_post_image(&self, doc: &Document) -> Result<()> {
        if self.validated {
            schema::validate_document(doc)?;
        }
        Ok(())
    }

    fn apply_set(&mut self, filter: &Filter, changes: &Document, many: bool) -> Result<UpdateOutcome> {
        if let Some(key) = changes.keys().find(|k| k.is_empty() || k.starts_with('$')) {
            return Err(ListingsError::query(format!("'{key}' is not a valid field to set")));
        }
        if changes.contains_key(fields::ID) {
            return Err(ListingsError::validation(fields::ID, "cannot be modified"));
        }
        let mut positions = self.matching_positions(filter)?;
        if !many {
            positions.truncate(1);
        }
        let mut staged = Vec::with_capacity(positions.len());
        for &pos in &positions {
            let mut updated = self.documents[pos].clone();
            for (path, value) in changes {
                if !set_path(&mut updated, path, value.clone()) {
                    return Err(ListingsError::query(format!(
                        "cannot create field '{path}' inside a non-document value"
                    )));
                }
            }
            self.check_post_image(&updated)?;
            staged.push((pos, updated));
        }
        let mut outcome = UpdateOutcome {
            matched: positions.len() as u64,
            modified: 0,
        };
        for (pos, updated) in staged {
            if self.documents[pos] != updated {
                self.documents[pos] = updated;
                outcome.modified += 1;
            }
        }
        Ok(outcome)
    }
}

pub struct MemoryStore {
    namespace: String,
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new(database: &str, collection: &str) -> Self {
        Self {
            namespace: format!("{database}.{collection}"),
            state: RwLock::new(MemoryState::default()),
        }
    }

    /// A store whose collection already carries the listing validator.
    pub fn with_validator(database: &str, collection: &str) -> Self {
        let store = Self::new(database, collection);
        if let Ok(mut state) = store.state.write() {
            state.collection_exists = true;
            state.validated = true;
        }
        store
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>> {
        let state = self.state.read().map_err(|_| {
            tracing::error!("Memory store lock poisoned on read ({})", self.namespace);
            ListingsError::Database("memory store lock poisoned".into())
        })?;
        state.ensure_open()?;
        Ok(state)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>> {
        let state = self.state.write().map_err(|_| {
            tracing::error!("Memory store lock poisoned on write ({})", self.namespace);
            ListingsError::Database("memory store lock poisoned".into())
        })?;
        state.ensure_open()?;
        Ok(state)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new("airbnb_madrid", "listings")
    }
}

fn snapshot_stream(docs: Vec<Document>) -> DocumentStream {
    futures::stream::iter(docs.into_iter().map(Ok)).boxed()
}

#[async_trait]
impl ListingStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        self.read().map(|_| ())
    }

    async fn insert_one(&self, doc: Document) -> Result<ListingId> {
        self.write()?.insert(doc)
    }

    async fn insert_many(&self, docs: Vec<Document>) -> Result<Vec<ListingId>> {
        let mut state = self.write()?;
        let mut ids = Vec::with_capacity(docs.len());
        for doc in docs {
            ids.push(state.insert(doc)?);
        }
        Ok(ids)
    }

    async fn find(&self, query: &FindQuery) -> Result<DocumentStream> {
        query.validate()?;
        let state = self.read()?;
        let compiled = state.compile(&query.filter)?;
        let mut docs: Vec<Document> = state
            .documents
            .iter()
            .filter(|d| compiled.matches(d))
            .cloned()
            .collect();
        drop(state);
        sort_documents(&mut docs, &query.sort);
        let limit = query.limit.map_or(usize::MAX, to_usize);
        let docs = docs
            .into_iter()
            .skip(to_usize(query.skip))
            .take(limit)
            .map(|d| match query.projection {
                Some(ref p) => p.apply(&d),
                None => d,
            })
            .collect();
        Ok(snapshot_stream(docs))
    }

    async fn find_near(
        &self,
        point: GeoPoint,
        max_distance_m: Option<f64>,
        limit: Option<u64>,
    ) -> Result<Vec<Document>> {
        let state = self.read()?;
        let mut hits: Vec<(f64, &Document)> = state
            .documents
            .iter()
            .filter_map(|d| {
                let at = get_path(d, fields::LOCATION).and_then(GeoPoint::from_bson)?;
                let distance = point.distance_m(at);
                max_distance_m
                    .is_none_or(|max| distance <= max)
                    .then_some((distance, d))
            })
            .collect();
        hits.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(hits
            .into_iter()
            .take(limit.map_or(usize::MAX, to_usize))
            .map(|(_, d)| d.clone())
            .collect())
    }

    async fn count(&self, filter: &Filter) -> Result<u64> {
        let state = self.read()?;
        Ok(state.matching_positions(filter)?.len() as u64)
    }

    async fn distinct(&self, field: &str, filter: &Filter) -> Result<Vec<Bson>> {
        let state = self.read()?;
        let compiled = state.compile(filter)?;
        let mut values: Vec<Bson> = Vec::new();
        for doc in state.documents.iter().filter(|d| compiled.matches(d)) {
            let found: Vec<&Bson> = match get_path(doc, field) {
                None => continue,
                Some(Bson::Array(items)) => items.iter().collect(),
                Some(value) => vec![value],
            };
            for value in found {
                if !values.iter().any(|v| values_equal(v, value)) {
                    values.push(value.clone());
                }
            }
        }
        values.sort_by(compare);
        Ok(values)
    }

    async fn update_one(&self, filter: &Filter, changes: &Document) -> Result<UpdateOutcome> {
        self.write()?.apply_set(filter, changes, false)
    }

    async fn update_many(&self, filter: &Filter, changes: &Document) -> Result<UpdateOutcome> {
        self.write()?.apply_set(filter, changes, true)
    }

    async fn increment(&self, filter: &Filter, field: &str, by: Bson) -> Result<UpdateOutcome> {
        if !matches!(by, Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_)) {
            return Err(ListingsError::query("$inc needs a numeric amount"));
        }
        let mut state = self.write()?;
        let Some(&pos) = state.matching_positions(filter)?.first() else {
            return Ok(UpdateOutcome::default());
        };
        let mut updated = state.documents[pos].clone();
        let next = match get_path(&updated, field) {
            None => by,
            Some(current) => add_numbers(current, &by).ok_or_else(|| {
                ListingsError::query(format!(
                    "cannot apply $inc to non-numeric field '{field}'"
                ))
            })?,
        };
        if !set_path(&mut updated, field, next) {
            return Err(ListingsError::query(format!(
                "cannot create field '{field}' inside a non-document value"
            )));
        }
        state.check_post_image(&updated)?;
        let modified = u64::from(state.documents[pos] != updated);
        state.documents[pos] = updated;
        Ok(UpdateOutcome {
            matched: 1,
            modified,
        })
    }

    async fn delete_many(&self, filter: &Filter) -> Result<u64> {
        let mut state = self.write()?;
        let compiled = state.compile(filter)?;
        let before = state.documents.len();
        state.documents.retain(|d| !compiled.matches(d));
        Ok((before - state.documents.len()) as u64)
    }

    async fn aggregate(&self, pipeline: &Pipeline) -> Result<DocumentStream> {
        pipeline.validate()?;
        let (docs, text_fields) = {
            let state = self.read()?;
            (state.documents.clone(), state.text_fields())
        };
        let out = aggregate::run(pipeline, docs, &text_fields)?;
        Ok(snapshot_stream(out))
    }

    /// Switches on validation with the listing rules. The `$jsonSchema`
    /// document itself is not interpreted.
    async fn ensure_collection(&self, validator: Document) -> Result<bool> {
        let mut state = self.write()?;
        tracing::debug!(
            "Memory store {} enforcing validator with {} top-level keys",
            self.namespace,
            validator.len()
        );
        let created = !state.collection_exists;
        state.collection_exists = true;
        state.validated = true;
        Ok(created)
    }

    async fn ensure_indexes(&self, indexes: &[IndexSpec]) -> Result<IndexReport> {
        let mut state = self.write()?;
        let mut report = IndexReport::default();
        for spec in indexes {
            if state.indexes.iter().any(|i| i.name == spec.name) {
                report.existing.push(spec.name.clone());
            } else {
                state.indexes.push(spec.clone());
                report.created.push(spec.name.clone());
            }
        }
        state.collection_exists = true;
        Ok(report)
    }

    async fn index_names(&self) -> Result<Vec<String>> {
        let state = self.read()?;
        if !state.collection_exists {
            return Ok(Vec::new());
        }
        Ok(std::iter::once("_id_".to_string())
            .chain(state.indexes.iter().map(|i| i.name.clone()))
            .collect())
    }

    async fn ensure_user(&self, user: &AppUser) -> Result<bool> {
        let mut state = self.write()?;
        if state.users.contains(&user.username) {
            return Ok(false);
        }
        state.users.push(user.username.clone());
        Ok(true)
    }

    async fn stats(&self) -> Result<CollectionStats> {
        let state = self.read()?;
        let mut size_bytes = 0_u64;
        for doc in &state.documents {
            let mut buf = Vec::new();
            doc.to_writer(&mut buf)?;
            size_bytes += buf.len() as u64;
        }
        let count = state.documents.len() as u64;
        Ok(CollectionStats {
            namespace: self.namespace.clone(),
            count,
            size_bytes,
            avg_obj_size_bytes: size_bytes.checked_div(count).unwrap_or(0),
            storage_size_bytes: size_bytes,
            index_count: if state.collection_exists {
                state.indexes.len() as u64 + 1
            } else {
                0
            },
            total_index_size_bytes: 0,
        })
    }

    async fn close(&self) {
        match self.state.write() {
            Ok(mut state) => state.closed = true,
            Err(_) => tracing::error!("Memory store lock poisoned on close ({})", self.namespace),
        }
    }
}
