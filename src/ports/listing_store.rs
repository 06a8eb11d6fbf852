use async_trait::async_trait;
use futures::stream::BoxStream;
use mongodb::bson::{Bson, Document};
use serde::Serialize;

use crate::config::types::AppUser;
use crate::domain::filter::Filter;
use crate::domain::geo::GeoPoint;
use crate::domain::index::IndexSpec;
use crate::domain::listing::ListingId;
use crate::domain::pipeline::Pipeline;
use crate::domain::query::FindQuery;
use crate::error::Result;

/// Lazily evaluated result set. Each call to `find`/`aggregate` produces a
/// fresh stream.
pub type DocumentStream = BoxStream<'static, Result<Document>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub modified: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct CollectionStats {
    pub namespace: String,
    pub count: u64,
    pub size_bytes: u64,
    pub avg_obj_size_bytes: u64,
    pub storage_size_bytes: u64,
    pub index_count: u64,
    pub total_index_size_bytes: u64,
}

#[allow(clippy::cast_precision_loss)]
fn megabytes(bytes: u64) -> f64 {
    bytes as f64 / 1024.0 / 1024.0
}

impl std::fmt::Display for CollectionStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "# Collection: {}", self.namespace)?;
        writeln!(f, "Documents: {}", self.count)?;
        writeln!(f, "Data size: {:.2} MB", megabytes(self.size_bytes))?;
        writeln!(f, "Average document: {} bytes", self.avg_obj_size_bytes)?;
        writeln!(f, "Storage size: {:.2} MB", megabytes(self.storage_size_bytes))?;
        writeln!(f, "Indexes: {}", self.index_count)?;
        write!(
            f,
            "Index size: {:.2} MB",
            megabytes(self.total_index_size_bytes)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct IndexReport {
    pub created: Vec<String>,
    pub existing: Vec<String>,
    /// Geo and text indexes the server refused to build (for example over
    /// malformed legacy documents). Other index failures are errors.
    pub failed: Vec<String>,
}

/// Storage port for the listings collection.
///
/// Writes go through as given; client-side validation is the repository's
/// job. Once `ensure_collection` has installed the validator the store also
/// rejects documents that break it.
#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn ping(&self) -> Result<()>;

    async fn insert_one(&self, doc: Document) -> Result<ListingId>;

    /// Inserts in order, stopping at the first failure.
    async fn insert_many(&self, docs: Vec<Document>) -> Result<Vec<ListingId>>;

    async fn find(&self, query: &FindQuery) -> Result<DocumentStream>;

    /// Documents with a `location`, closest first, within `max_distance_m`.
    async fn find_near(
        &self,
        point: GeoPoint,
        max_distance_m: Option<f64>,
        limit: Option<u64>,
    ) -> Result<Vec<Document>>;

    async fn count(&self, filter: &Filter) -> Result<u64>;

    async fn distinct(&self, field: &str, filter: &Filter) -> Result<Vec<Bson>>;

    /// `$set` on the first matching document.
    async fn update_one(&self, filter: &Filter, changes: &Document) -> Result<UpdateOutcome>;

    async fn update_many(&self, filter: &Filter, changes: &Document) -> Result<UpdateOutcome>;

    /// `$inc` on the first matching document.
    async fn increment(&self, filter: &Filter, field: &str, by: Bson) -> Result<UpdateOutcome>;

    async fn delete_many(&self, filter: &Filter) -> Result<u64>;

    async fn aggregate(&self, pipeline: &Pipeline) -> Result<DocumentStream>;

    /// Creates the collection with `validator`, or updates the validator on an
    /// existing one. Returns whether the collection was created.
    async fn ensure_collection(&self, validator: Document) -> Result<bool>;

    /// Creates the indexes whose names are missing.
    async fn ensure_indexes(&self, indexes: &[IndexSpec]) -> Result<IndexReport>;

    async fn index_names(&self) -> Result<Vec<String>>;

    /// Creates the application user if missing. Returns whether it was created.
    async fn ensure_user(&self, user: &AppUser) -> Result<bool>;

    async fn stats(&self) -> Result<CollectionStats>;

    /// Releases the connection pool. Further calls fail.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_stats_display_in_megabytes() {
        let stats = CollectionStats {
            namespace: "airbnb_madrid.listings".into(),
            count: 20_000,
            size_bytes: 3 * 1024 * 1024,
            avg_obj_size_bytes: 157,
            storage_size_bytes: 1024 * 1024,
            index_count: 7,
            total_index_size_bytes: 512 * 1024,
        };
        let text = stats.to_string();
        assert!(text.contains("Documents: 20000"));
        assert!(text.contains("Data size: 3.00 MB"));
        assert!(text.contains("Index size: 0.50 MB"));
    }
}
