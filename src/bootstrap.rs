//! One-off database initialisation: application user, validated collection
//! and the listing indexes. Safe to run any number of times.

use serde::Serialize;

use crate::config::types::AppUser;
use crate::domain::index::listing_indexes;
use crate::domain::schema;
use crate::error::Result;
use crate::ports::listing_store::{IndexReport, ListingStore};

#[derive(Debug, Clone, Default)]
pub struct BootstrapOptions {
    /// Skipped when `None`.
    pub app_user: Option<AppUser>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct BootstrapReport {
    pub user_created: bool,
    pub collection_created: bool,
    pub indexes: IndexReport,
}

impl std::fmt::Display for BootstrapReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "User: {}",
            if self.user_created { "created" } else { "unchanged" }
        )?;
        writeln!(
            f,
            "Collection: {}",
            if self.collection_created {
                "created"
            } else {
                "validator updated"
            }
        )?;
        write!(
            f,
            "Indexes: {} created, {} already present",
            self.indexes.created.len(),
            self.indexes.existing.len()
        )?;
        if !self.indexes.failed.is_empty() {
            write!(f, ", failed: {}", self.indexes.failed.join(", "))?;
        }
        Ok(())
    }
}

/// Creates what is missing: user, collection with validator, indexes.
pub async fn bootstrap(store: &dyn ListingStore, options: &BootstrapOptions) -> Result<BootstrapReport> {
    let user_created = match options.app_user {
        Some(ref user) => store.ensure_user(user).await?,
        None => {
            tracing::debug!("No application user configured");
            false
        }
    };
    let collection_created = store.ensure_collection(schema::json_schema()).await?;
    let indexes = create_indexes(store).await?;
    let report = BootstrapReport {
        user_created,
        collection_created,
        indexes,
    };
    tracing::info!(
        "Bootstrap done: user created {}, collection created {}, {} indexes created",
        report.user_created,
        report.collection_created,
        report.indexes.created.len()
    );
    Ok(report)
}

/// Ensures the listing index set, creating only the missing names.
pub async fn create_indexes(store: &dyn ListingStore) -> Result<IndexReport> {
    let report = store.ensure_indexes(&listing_indexes()).await?;
    for name in &report.created {
        tracing::info!("Created index {name}");
    }
    if !report.existing.is_empty() {
        tracing::debug!("Indexes already present: {}", report.existing.join(", "));
    }
    Ok(report)
}
