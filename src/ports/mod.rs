pub mod listing_store;

pub use listing_store::{CollectionStats, DocumentStream, IndexReport, ListingStore, UpdateOutcome};
