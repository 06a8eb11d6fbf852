//! CSV and JSON loaders feeding the repository in batches.

pub mod clean;

use std::io::Read;
use std::path::Path;

use indicatif::{ProgressBar, ProgressStyle};
use mongodb::bson::{Bson, DateTime, Document};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;

use crate::config::types::{ImportConfig, InvalidRowPolicy};
use crate::domain::filter::Filter;
use crate::domain::schema;
use crate::domain::value::parse_json;
use crate::error::{ListingsError, Result};
use crate::repository::ListingRepository;

pub use clean::{ColumnSummary, RowCleaner};

pub const IMPORTED_AT: &str = "imported_at";
pub const SOURCE: &str = "source";

/// Seed for `sample_size`, so repeated imports pick the same rows.
pub const SAMPLE_SEED: u64 = 42;

#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// 0 imports every row.
    pub sample_size: usize,
    pub batch_size: usize,
    pub keep_all_columns: bool,
    pub clear_existing: bool,
    pub on_invalid: InvalidRowPolicy,
    pub source: String,
    pub show_progress: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self::from(&ImportConfig::default())
    }
}

impl From<&ImportConfig> for ImportOptions {
    fn from(config: &ImportConfig) -> Self {
        Self {
            sample_size: config.sample_size,
            batch_size: config.batch_size,
            keep_all_columns: config.keep_all_columns,
            clear_existing: true,
            on_invalid: config.on_invalid,
            source: config.source.clone(),
            show_progress: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ImportReport {
    pub rows_read: usize,
    /// Rows thrown away during cleaning (no usable coordinates).
    pub rows_dropped: usize,
    pub inserted: usize,
    /// Cleaned rows the listing validator refused.
    pub rejected: usize,
    pub cleared: u64,
}

impl std::fmt::Display for ImportReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} rows read, {} dropped, {} inserted, {} rejected",
            self.rows_read, self.rows_dropped, self.inserted, self.rejected
        )?;
        if self.cleared > 0 {
            write!(f, " ({} previous listings removed)", self.cleared)?;
        }
        Ok(())
    }
}

/// Indices of a deterministic random sample of `amount` out of `len` rows,
/// in file order.
pub fn sample_indices(len: usize, amount: usize) -> Vec<usize> {
    if amount == 0 || amount >= len {
        return (0..len).collect();
    }
    let mut rng = StdRng::seed_from_u64(SAMPLE_SEED);
    let mut picked = rand::seq::index::sample(&mut rng, len, amount).into_vec();
    picked.sort_unstable();
    picked
}

fn progress_bar(len: usize, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(len as u64);
    if let Ok(style) =
        ProgressStyle::with_template("Importing [{bar:40}] {pos}/{len} ({eta})")
    {
        bar.set_style(style.progress_chars("=> "));
    }
    bar
}

pub struct Importer {
    repository: ListingRepository,
    options: ImportOptions,
}

impl Importer {
    pub fn new(repository: ListingRepository, options: ImportOptions) -> Self {
        Self {
            repository,
            options,
        }
    }

    pub fn options(&self) -> &ImportOptions {
        &self.options
    }

    pub async fn import_csv(&self, path: &Path) -> Result<ImportReport> {
        tracing::info!("Reading {}", path.display());
        let file = std::fs::File::open(path).map_err(|e| {
            ListingsError::Io(std::io::Error::new(
                e.kind(),
                format!("{}: {e}", path.display()),
            ))
        })?;
        self.import_csv_reader(file).await
    }

    /// Reads every row, samples, cleans and writes in batches.
    pub async fn import_csv_reader<R: Read>(&self, reader: R) -> Result<ImportReport> {
        let mut table = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
        let headers = table.headers()?.clone();
        let rows = table.records().collect::<std::result::Result<Vec<_>, _>>()?;

        let summary = ColumnSummary::from_headers(&headers);
        tracing::info!(
            "Loaded {} rows with {} columns (coordinates: {}, price: {}, reviews: {})",
            rows.len(),
            summary.columns,
            summary.has_location,
            summary.has_price,
            summary.has_reviews
        );

        let mut report = ImportReport {
            rows_read: rows.len(),
            ..ImportReport::default()
        };
        let picked = sample_indices(rows.len(), self.options.sample_size);
        if picked.len() < rows.len() {
            tracing::info!("Using a sample of {} rows", picked.len());
        }

        let cleaner = RowCleaner::new(self.options.keep_all_columns);
        let mut docs = Vec::with_capacity(picked.len());
        for index in picked {
            match cleaner.clean(&headers, &rows[index]) {
                Some(doc) => docs.push(doc),
                None => report.rows_dropped += 1,
            }
        }
        if report.rows_dropped > 0 {
            tracing::warn!(
                "Dropped {} rows without valid coordinates",
                report.rows_dropped
            );
        }

        self.write(docs, &mut report).await?;
        Ok(report)
    }

    /// Loads a JSON array of listing documents (extended JSON is accepted).
    /// A non-empty collection is left alone unless `clear_existing` is set.
    pub async fn import_json(&self, path: &Path) -> Result<ImportReport> {
        let text = tokio::fs::read_to_string(path).await?;
        let Bson::Array(items) = parse_json(&text)? else {
            return Err(ListingsError::Bson(format!(
                "{} must hold a JSON array of listings",
                path.display()
            )));
        };
        let docs = items
            .into_iter()
            .enumerate()
            .map(|(i, item)| match item {
                Bson::Document(doc) => Ok(doc),
                other => Err(ListingsError::Bson(format!(
                    "entry {i} is not a document: {other}"
                ))),
            })
            .collect::<Result<Vec<_>>>()?;

        if !self.options.clear_existing {
            let existing = self.repository.total_listings().await?;
            if existing > 0 {
                return Err(ListingsError::Config(format!(
                    "collection already holds {existing} listings; clear it first to load the sample"
                )));
            }
        }

        let mut report = ImportReport {
            rows_read: docs.len(),
            ..ImportReport::default()
        };
        self.write(docs, &mut report).await?;
        Ok(report)
    }

    async fn write(&self, mut docs: Vec<Document>, report: &mut ImportReport) -> Result<()> {
        if self.options.on_invalid == InvalidRowPolicy::Abort {
            // Nothing is written when any row would be refused.
            for doc in &docs {
                schema::validate_document(doc)?;
            }
        }

        if self.options.clear_existing {
            report.cleared = self.repository.delete(&Filter::all()).await?;
            if report.cleared > 0 {
                tracing::info!("Removed {} existing listings", report.cleared);
            }
        }

        let imported_at = DateTime::now();
        for doc in &mut docs {
            doc.insert(IMPORTED_AT, imported_at);
            doc.insert(SOURCE, self.options.source.as_str());
        }

        let batch_size = self.options.batch_size.max(1);
        let bar = progress_bar(docs.len(), self.options.show_progress);
        let mut rest = docs;
        while !rest.is_empty() {
            let tail = rest.split_off(batch_size.min(rest.len()));
            let batch = std::mem::replace(&mut rest, tail);
            let size = batch.len();
            let outcome = self.repository.create_many(batch).await?;
            report.inserted += outcome.inserted_count();
            report.rejected += outcome.rejected_count();
            bar.inc(size as u64);
        }
        bar.finish_and_clear();

        if report.rejected > 0 {
            tracing::warn!("{} rows failed validation and were skipped", report.rejected);
        }
        tracing::info!("Import finished: {report}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{listing_doc, memory_repository};

    const CSV: &str = "\
id,name,neighbourhood,latitude,longitude,room_type,price,availability_365
1,Sol flat,Centro,40.4168,-3.7038,Entire home/apt,$80.00,200
2,Retiro room,Retiro,40.4153,-3.6846,Private room,$45.00,0
3,No coords,Centro,,,Private room,$30.00,10
4,Bad type,Centro,40.41,-3.70,Castle,$30.00,10
5,Too long,Centro,40.41,-3.70,Private room,$30.00,400
";

    fn importer(options: ImportOptions) -> Importer {
        Importer::new(memory_repository(), options)
    }

    #[tokio::test]
    async fn csv_rows_are_cleaned_and_invalid_ones_skipped() {
        let importer = importer(ImportOptions::default());
        let report = importer.import_csv_reader(CSV.as_bytes()).await.unwrap();
        assert_eq!(
            report,
            ImportReport {
                rows_read: 5,
                rows_dropped: 1,
                inserted: 2,
                rejected: 2,
                cleared: 0,
            }
        );
        let docs = importer
            .repository
            .find_by_neighbourhood("Centro", 0)
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].get_str(SOURCE).unwrap(), "csv_import");
        assert!(docs[0].get_datetime(IMPORTED_AT).is_ok());
        assert!(docs[0].get_document("location").is_ok());
    }

    #[tokio::test]
    async fn abort_policy_writes_nothing() {
        let importer = importer(ImportOptions {
            on_invalid: InvalidRowPolicy::Abort,
            ..ImportOptions::default()
        });
        let err = importer.import_csv_reader(CSV.as_bytes()).await.unwrap_err();
        assert!(matches!(err, ListingsError::Validation { .. }));
        assert_eq!(importer.repository.total_listings().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn clear_existing_replaces_and_append_keeps() {
        let importer = importer(ImportOptions::default());
        importer.repository.create(listing_doc("old", 10.0, "Sol")).await.unwrap();
        let report = importer.import_csv_reader(CSV.as_bytes()).await.unwrap();
        assert_eq!(report.cleared, 1);
        assert_eq!(importer.repository.total_listings().await.unwrap(), 2);

        let appending = Importer::new(
            importer.repository.clone(),
            ImportOptions {
                clear_existing: false,
                ..ImportOptions::default()
            },
        );
        appending.import_csv_reader(CSV.as_bytes()).await.unwrap();
        assert_eq!(importer.repository.total_listings().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn small_batches_insert_everything() {
        let importer = importer(ImportOptions {
            batch_size: 1,
            ..ImportOptions::default()
        });
        let report = importer.import_csv_reader(CSV.as_bytes()).await.unwrap();
        assert_eq!(report.inserted, 2);
    }

    #[test]
    fn sampling_is_deterministic() {
        let first = sample_indices(100, 10);
        assert_eq!(first.len(), 10);
        assert_eq!(first, sample_indices(100, 10));
        assert!(first.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(sample_indices(3, 10), vec![0, 1, 2]);
        assert_eq!(sample_indices(3, 0), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn json_import_refuses_populated_collection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.json");
        std::fs::write(
            &path,
            r#"[{"name": "A", "price": 50}, {"name": "B", "price": {"$numberInt": "60"}}]"#,
        )
        .unwrap();

        let keep = ImportOptions {
            clear_existing: false,
            ..ImportOptions::default()
        };
        let importer = importer(keep.clone());
        let report = importer.import_json(&path).await.unwrap();
        assert_eq!(report.inserted, 2);

        let err = importer.import_json(&path).await.unwrap_err();
        assert!(matches!(err, ListingsError::Config(_)));
        assert_eq!(importer.repository.total_listings().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn json_import_rejects_non_arrays() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"name": "A"}"#).unwrap();
        let err = importer(ImportOptions::default())
            .import_json(&path)
            .await
            .unwrap_err();
        assert!(matches!(err, ListingsError::Bson(_)));
    }
}
