//! Data-access layer over a [`ListingStore`]. Everything that writes goes
//! through the listing validator here before reaching the store.

use std::sync::Arc;

use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use mongodb::bson::{Bson, DateTime, Document};

use crate::domain::analytics::{
    NeighbourhoodPriceStats, RoomTypeCount, price_stats_pipeline, room_type_count_pipeline,
};
use crate::domain::filter::Filter;
use crate::domain::geo::GeoPoint;
use crate::domain::listing::{Listing, ListingId, RoomType, ensure_object_id};
use crate::domain::pipeline::{Pipeline, SortKey};
use crate::domain::query::FindQuery;
use crate::domain::schema::{self, fields};
use crate::domain::value::{add_numbers, get_path};
use crate::error::{ListingsError, Result};
use crate::ports::listing_store::{CollectionStats, DocumentStream, ListingStore};

pub const CREATED_AT: &str = "created_at";
pub const UPDATED_AT: &str = "updated_at";

/// A document `create_many` refused, by position in the input.
#[derive(Debug)]
pub struct RejectedDocument {
    pub index: usize,
    pub error: ListingsError,
}

#[derive(Debug, Default)]
pub struct BulkInsertReport {
    pub inserted: Vec<ListingId>,
    pub rejected: Vec<RejectedDocument>,
}

impl BulkInsertReport {
    pub fn inserted_count(&self) -> usize {
        self.inserted.len()
    }

    pub fn rejected_count(&self) -> usize {
        self.rejected.len()
    }
}

impl std::fmt::Display for BulkInsertReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} inserted, {} rejected",
            self.inserted.len(),
            self.rejected.len()
        )
    }
}

#[derive(Clone)]
pub struct ListingRepository {
    store: Arc<dyn ListingStore>,
    record_timestamps: bool,
}

impl ListingRepository {
    pub fn new(store: Arc<dyn ListingStore>) -> Self {
        Self {
            store,
            record_timestamps: false,
        }
    }

    /// Stamp `created_at` on inserts and `updated_at` on every write.
    #[must_use]
    pub fn with_timestamps(mut self, enabled: bool) -> Self {
        self.record_timestamps = enabled;
        self
    }

    pub fn store(&self) -> &Arc<dyn ListingStore> {
        &self.store
    }

    fn prepare_insert(&self, doc: &mut Document) -> Result<ListingId> {
        schema::validate_document(doc)?;
        let id = ensure_object_id(doc)?;
        if self.record_timestamps {
            let now = DateTime::now();
            doc.insert(CREATED_AT, now);
            doc.insert(UPDATED_AT, now);
        }
        Ok(id)
    }

    fn prepare_changes(&self, changes: &Document) -> Result<Document> {
        schema::validate_changes(changes)?;
        let mut changes = changes.clone();
        if self.record_timestamps && !changes.is_empty() {
            changes.insert(UPDATED_AT, DateTime::now());
        }
        Ok(changes)
    }

    // ----- Create -----

    /// Validates and inserts one listing document. Nothing is written when
    /// validation fails.
    pub async fn create(&self, mut doc: Document) -> Result<ListingId> {
        self.prepare_insert(&mut doc)?;
        let id = self.store.insert_one(doc).await?;
        tracing::debug!("Created listing {id}");
        Ok(id)
    }

    pub async fn create_listing(&self, listing: &Listing) -> Result<ListingId> {
        self.create(listing.to_document()).await
    }

    /// Inserts every valid document; invalid ones are reported by position.
    pub async fn create_many(&self, docs: Vec<Document>) -> Result<BulkInsertReport> {
        let mut report = BulkInsertReport::default();
        let mut valid = Vec::with_capacity(docs.len());
        for (index, mut doc) in docs.into_iter().enumerate() {
            match self.prepare_insert(&mut doc) {
                Ok(_) => valid.push(doc),
                Err(error) => {
                    tracing::warn!("Skipping document {index}: {error}");
                    report.rejected.push(RejectedDocument { index, error });
                }
            }
        }
        if !valid.is_empty() {
            report.inserted = self.store.insert_many(valid).await?;
        }
        tracing::info!("Bulk insert: {report}");
        Ok(report)
    }

    // ----- Read -----

    /// Lazy result set. Each call runs the query again.
    pub async fn find(&self, query: &FindQuery) -> Result<DocumentStream> {
        self.store.find(query).await
    }

    pub async fn find_by_id(&self, id: ListingId) -> Result<Option<Document>> {
        let mut stream = self.store.find(&FindQuery::new(Filter::id(id)).limit(1)).await?;
        stream.try_next().await
    }

    /// Typed view of `find`. Documents that break the listing rules surface as
    /// validation errors in the stream.
    pub async fn find_listings(
        &self,
        query: &FindQuery,
    ) -> Result<BoxStream<'static, Result<Listing>>> {
        let stream = self.store.find(query).await?;
        Ok(stream
            .map(|item| item.and_then(Listing::try_from))
            .boxed())
    }

    async fn collect(&self, query: FindQuery) -> Result<Vec<Document>> {
        self.store.find(&query).await?.try_collect().await
    }

    pub async fn find_by_neighbourhood(&self, neighbourhood: &str, limit: u64) -> Result<Vec<Document>> {
        self.collect(FindQuery::new(Filter::eq(fields::NEIGHBOURHOOD, neighbourhood)).limit(limit))
            .await
    }

    /// Listings priced within `[min, max]`, cheapest first.
    pub async fn find_by_price_range(&self, min: f64, max: f64, limit: u64) -> Result<Vec<Document>> {
        if min.is_nan() || max.is_nan() || min > max {
            return Err(ListingsError::query(format!(
                "invalid price range {min}..{max}"
            )));
        }
        let filter = Filter::gte(fields::PRICE, min).and(Filter::lte(fields::PRICE, max));
        self.collect(
            FindQuery::new(filter)
                .sort_by(SortKey::asc(fields::PRICE))
                .limit(limit),
        )
        .await
    }

    pub async fn find_by_room_type(&self, room_type: RoomType, limit: u64) -> Result<Vec<Document>> {
        self.collect(FindQuery::new(Filter::eq(fields::ROOM_TYPE, room_type)).limit(limit))
            .await
    }

    /// Case-insensitive substring match on the name. `term` is literal text.
    pub async fn search_by_name(&self, term: &str, limit: u64) -> Result<Vec<Document>> {
        let filter = Filter::regex(fields::NAME, regex::escape(term), true);
        self.collect(FindQuery::new(filter).limit(limit)).await
    }

    /// Full-text search over name and description. Needs the text index.
    pub async fn search_text(&self, terms: &str, limit: u64) -> Result<Vec<Document>> {
        if terms.trim().is_empty() {
            return Err(ListingsError::query("empty text search"));
        }
        self.collect(FindQuery::new(Filter::text(terms)).limit(limit))
            .await
    }

    /// Nearest listings first.
    pub async fn find_near(
        &self,
        point: GeoPoint,
        max_distance_m: Option<f64>,
        limit: u64,
    ) -> Result<Vec<Document>> {
        if !(-180.0..=180.0).contains(&point.longitude) || !(-90.0..=90.0).contains(&point.latitude) {
            return Err(ListingsError::query(format!("point {point} is out of bounds")));
        }
        if let Some(max) = max_distance_m
            && (max.is_nan() || max < 0.0)
        {
            return Err(ListingsError::query(format!(
                "max distance must be >= 0, got {max}"
            )));
        }
        self.store
            .find_near(point, max_distance_m, (limit > 0).then_some(limit))
            .await
    }

    pub async fn count(&self, filter: &Filter) -> Result<u64> {
        self.store.count(filter).await
    }

    pub async fn total_listings(&self) -> Result<u64> {
        self.store.count(&Filter::all()).await
    }

    /// Distinct values of `field` across the collection, flattened and sorted.
    pub async fn distinct_values(&self, field: &str) -> Result<Vec<Bson>> {
        self.distinct_values_matching(field, &Filter::all()).await
    }

    pub async fn distinct_values_matching(&self, field: &str, filter: &Filter) -> Result<Vec<Bson>> {
        if field.is_empty() || field.starts_with('$') {
            return Err(ListingsError::query(format!(
                "'{field}' is not a valid field name"
            )));
        }
        self.store.distinct(field, filter).await
    }

    // ----- Update -----

    /// Merges `changes` into the listing. Returns the modified count (0 when
    /// the values were already equal).
    pub async fn update(&self, id: ListingId, changes: &Document) -> Result<u64> {
        let changes = self.prepare_changes(changes)?;
        let filter = Filter::id(id);
        if changes.is_empty() {
            if self.store.count(&filter).await? == 0 {
                return Err(ListingsError::NotFound { id: id.to_string() });
            }
            return Ok(0);
        }
        let outcome = self.store.update_one(&filter, &changes).await?;
        if outcome.matched == 0 {
            tracing::warn!("Update of missing listing {id}");
            return Err(ListingsError::NotFound { id: id.to_string() });
        }
        Ok(outcome.modified)
    }

    pub async fn update_many(&self, filter: &Filter, changes: &Document) -> Result<u64> {
        let changes = self.prepare_changes(changes)?;
        if changes.is_empty() {
            return Ok(0);
        }
        let outcome = self.store.update_many(filter, &changes).await?;
        tracing::info!(
            "Updated {} of {} matching listings",
            outcome.modified,
            outcome.matched
        );
        Ok(outcome.modified)
    }

    /// Adds `by` to a numeric field. Constrained fields are checked against
    /// their rule before the increment is sent.
    pub async fn increment_field(&self, id: ListingId, field: &str, by: impl Into<Bson>) -> Result<u64> {
        let by = by.into();
        if !matches!(by, Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_)) {
            return Err(ListingsError::query(format!(
                "increment for '{field}' must be a number"
            )));
        }
        if field.is_empty() || field.starts_with('$') {
            return Err(ListingsError::query(format!(
                "'{field}' is not a valid field name"
            )));
        }
        if field == fields::ID {
            return Err(ListingsError::validation(fields::ID, "cannot be modified"));
        }
        if schema::is_constrained(field) {
            let current = self
                .find_by_id(id)
                .await?
                .ok_or_else(|| ListingsError::NotFound { id: id.to_string() })?;
            let next = match get_path(&current, field) {
                None | Some(Bson::Null) => by.clone(),
                Some(value) => add_numbers(value, &by).ok_or_else(|| {
                    ListingsError::query(format!("'{field}' is not numeric"))
                })?,
            };
            let mut probe = Document::new();
            probe.insert(field, next);
            schema::validate_changes(&probe)?;
        }
        let outcome = self.store.increment(&Filter::id(id), field, by).await?;
        if outcome.matched == 0 {
            return Err(ListingsError::NotFound { id: id.to_string() });
        }
        if self.record_timestamps {
            let mut stamp = Document::new();
            stamp.insert(UPDATED_AT, DateTime::now());
            self.store.update_one(&Filter::id(id), &stamp).await?;
        }
        Ok(outcome.modified)
    }

    // ----- Delete -----

    /// Removes every match. No match is not an error.
    pub async fn delete(&self, filter: &Filter) -> Result<u64> {
        let deleted = self.store.delete_many(filter).await?;
        tracing::info!("Deleted {deleted} listings");
        Ok(deleted)
    }

    pub async fn delete_by_id(&self, id: ListingId) -> Result<u64> {
        self.store.delete_many(&Filter::id(id)).await
    }

    /// Drops listings with no availability in the coming year.
    pub async fn delete_unavailable(&self) -> Result<u64> {
        self.delete(&Filter::eq(fields::AVAILABILITY_365, 0)).await
    }

    // ----- Aggregation -----

    pub async fn aggregate(&self, pipeline: &Pipeline) -> Result<DocumentStream> {
        self.store.aggregate(pipeline).await
    }

    async fn aggregate_rows<T>(&self, pipeline: &Pipeline) -> Result<Vec<T>>
    where
        T: for<'a> TryFrom<&'a Document, Error = ListingsError>,
    {
        let rows: Vec<Document> = self.store.aggregate(pipeline).await?.try_collect().await?;
        rows.iter().map(T::try_from).collect()
    }

    pub async fn price_stats_by_neighbourhood(&self) -> Result<Vec<NeighbourhoodPriceStats>> {
        self.aggregate_rows(&price_stats_pipeline()).await
    }

    pub async fn count_by_room_type(&self) -> Result<Vec<RoomTypeCount>> {
        self.aggregate_rows(&room_type_count_pipeline()).await
    }

    // ----- Maintenance -----

    pub async fn collection_stats(&self) -> Result<CollectionStats> {
        self.store.stats().await
    }

    pub async fn ping(&self) -> Result<()> {
        self.store.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryStore;
    use crate::domain::index::listing_indexes;
    use crate::test_helpers::{centro_flat, listing_doc, memory_repository};
    use mongodb::bson::doc;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn create_then_find_by_id_returns_the_document() {
        let repo = memory_repository();
        let doc = centro_flat();
        let id = repo.create(doc.clone()).await.unwrap();
        let found = repo.find_by_id(id).await.unwrap().unwrap();
        let mut expected = doc! { "_id": id };
        expected.extend(doc);
        assert_eq!(found, expected);
    }

    #[tokio::test]
    async fn invalid_create_persists_nothing() {
        let repo = memory_repository();
        let err = repo
            .create(listing_doc("Bad", -1.0, "Centro"))
            .await
            .unwrap_err();
        assert!(matches!(err, ListingsError::Validation { ref field, .. } if field == "price"));
        assert_eq!(repo.total_listings().await.unwrap(), 0);
        assert!(repo.create(listing_doc("Free", 0.0, "Centro")).await.is_ok());
    }

    #[tokio::test]
    async fn create_many_skips_invalid_documents() {
        let repo = memory_repository();
        let docs = vec![
            listing_doc("a", 10.0, "Centro"),
            doc! { "name": "no price" },
            listing_doc("b", 20.0, "Retiro"),
            doc! { "name": "castle", "price": 5, "room_type": "Luxury Suite" },
        ];
        let report = repo.create_many(docs).await.unwrap();
        assert_eq!(report.inserted_count(), 2);
        let rejected: Vec<usize> = report.rejected.iter().map(|r| r.index).collect();
        assert_eq!(rejected, vec![1, 3]);
        assert_eq!(repo.total_listings().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn update_missing_listing_is_not_found() {
        let repo = memory_repository();
        let err = repo
            .update(ListingId::new(), &doc! { "price": 80 })
            .await
            .unwrap_err();
        assert!(matches!(err, ListingsError::NotFound { .. }));
    }

    #[tokio::test]
    async fn update_changes_only_the_given_fields() {
        let repo = memory_repository();
        let id = repo.create(centro_flat()).await.unwrap();
        assert_eq!(repo.update(id, &doc! { "price": 80 }).await.unwrap(), 1);
        let found = repo.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(found.get_i32("price").unwrap(), 80);
        assert_eq!(found.get_str("name").unwrap(), "Test Flat");
        assert_eq!(repo.update(id, &doc! { "price": 80 }).await.unwrap(), 0);
        assert_eq!(repo.update(id, &doc! {}).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn update_rejects_invalid_changes() {
        let repo = memory_repository();
        let id = repo.create(centro_flat()).await.unwrap();
        let err = repo.update(id, &doc! { "price": -3 }).await.unwrap_err();
        assert!(matches!(err, ListingsError::Validation { .. }));
        let err = repo.update(id, &doc! { "$set": { "x": 1 } }).await.unwrap_err();
        assert!(matches!(err, ListingsError::Query { .. }));
    }

    #[tokio::test]
    async fn increment_checks_constrained_post_image() {
        let repo = memory_repository();
        let id = repo
            .create(doc! { "name": "a", "price": 10, "availability_365": 360 })
            .await
            .unwrap();
        assert_eq!(repo.increment_field(id, "availability_365", 5).await.unwrap(), 1);
        let err = repo
            .increment_field(id, "availability_365", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ListingsError::Validation { .. }));
        let err = repo
            .increment_field(ListingId::new(), "number_of_reviews", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ListingsError::NotFound { .. }));
    }

    #[tokio::test]
    async fn price_range_is_sorted_and_inclusive() {
        let repo = memory_repository();
        for (name, price) in [("a", 120.0), ("b", 50.0), ("c", 80.0), ("d", 300.0)] {
            repo.create(listing_doc(name, price, "Centro")).await.unwrap();
        }
        let found = repo.find_by_price_range(50.0, 120.0, 0).await.unwrap();
        let names: Vec<&str> = found.iter().map(|d| d.get_str("name").unwrap()).collect();
        assert_eq!(names, vec!["b", "c", "a"]);
        assert!(repo.find_by_price_range(10.0, 5.0, 0).await.is_err());
    }

    #[tokio::test]
    async fn search_by_name_treats_term_literally() {
        let repo = memory_repository();
        repo.create(listing_doc("Piso (centro)", 10.0, "Centro")).await.unwrap();
        repo.create(listing_doc("Piso centro", 10.0, "Centro")).await.unwrap();
        let found = repo.search_by_name("PISO (", 10).await.unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn search_text_uses_text_index() {
        let store = Arc::new(MemoryStore::default());
        store.ensure_indexes(&listing_indexes()).await.unwrap();
        let repo = ListingRepository::new(store);
        repo.create(doc! { "name": "Ático", "price": 90, "description": "Terraza con vistas" })
            .await
            .unwrap();
        repo.create(doc! { "name": "Estudio", "price": 40 }).await.unwrap();
        assert_eq!(repo.search_text("terraza", 10).await.unwrap().len(), 1);
        assert!(repo.search_text("  ", 10).await.is_err());
    }

    #[tokio::test]
    async fn delete_unavailable_removes_only_zero_availability() {
        let repo = memory_repository();
        repo.create(doc! { "name": "a", "price": 1, "availability_365": 0 }).await.unwrap();
        repo.create(doc! { "name": "b", "price": 1, "availability_365": 12 }).await.unwrap();
        repo.create(doc! { "name": "c", "price": 1 }).await.unwrap();
        assert_eq!(repo.delete_unavailable().await.unwrap(), 1);
        assert_eq!(repo.total_listings().await.unwrap(), 2);
        assert_eq!(repo.delete_by_id(ListingId::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn canned_aggregations() {
        let repo = memory_repository();
        repo.create(centro_flat()).await.unwrap();
        repo.create(listing_doc("b", 125.0, "Centro")).await.unwrap();
        repo.create(listing_doc("c", 40.0, "Usera")).await.unwrap();

        let stats = repo.price_stats_by_neighbourhood().await.unwrap();
        assert_eq!(stats[0].neighbourhood.as_deref(), Some("Centro"));
        assert!((stats[0].avg_price - 100.0).abs() < f64::EPSILON);
        assert_eq!(stats[0].count, 2);

        let rooms = repo.count_by_room_type().await.unwrap();
        assert_eq!(rooms[0].room_type.as_deref(), Some("Private room"));
        assert_eq!(rooms[0].count, 2);
        assert_eq!(rooms[1].room_type.as_deref(), Some("Entire home/apt"));
    }

    #[tokio::test]
    async fn timestamps_are_opt_in() {
        let repo = memory_repository().with_timestamps(true);
        let id = repo.create(centro_flat()).await.unwrap();
        let found = repo.find_by_id(id).await.unwrap().unwrap();
        assert!(found.get_datetime(CREATED_AT).is_ok());
        assert!(found.get_datetime(UPDATED_AT).is_ok());

        let plain = memory_repository();
        let id = plain.create(centro_flat()).await.unwrap();
        let found = plain.find_by_id(id).await.unwrap().unwrap();
        assert!(!found.contains_key(CREATED_AT));
    }

    #[tokio::test]
    async fn find_listings_yields_typed_records() {
        let repo = memory_repository();
        let listing = Listing::new("Loft", 70.0)
            .with_room_type(RoomType::EntireHome)
            .with_coordinates(40.41, -3.70);
        repo.create_listing(&listing).await.unwrap();
        let listings: Vec<Listing> = repo
            .find_listings(&FindQuery::all())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].room_type, Some(RoomType::EntireHome));
        assert!(listings[0].id.is_some());
    }

    #[tokio::test]
    async fn distinct_values_reject_operator_names() {
        let repo = memory_repository();
        repo.create(centro_flat()).await.unwrap();
        let values = repo.distinct_values("neighbourhood").await.unwrap();
        assert_eq!(values, vec![Bson::from("Centro")]);
        assert!(repo.distinct_values("$where").await.is_err());
    }
}
