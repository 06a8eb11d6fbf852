use std::sync::Arc;

use mongodb::bson::{Document, doc};

use crate::adapters::memory::MemoryStore;
use crate::repository::ListingRepository;

/// Repository over an empty, already bootstrapped memory store.
pub fn memory_repository() -> ListingRepository {
    ListingRepository::new(Arc::new(MemoryStore::with_validator(
        "airbnb_madrid",
        "listings",
    )))
}

/// The "Test Flat" listing used across the scenario tests.
pub fn centro_flat() -> Document {
    doc! {
        "name": "Test Flat",
        "price": 75,
        "neighbourhood": "Centro",
        "room_type": "Entire home/apt",
    }
}

pub fn listing_doc(name: &str, price: f64, neighbourhood: &str) -> Document {
    doc! {
        "name": name,
        "price": price,
        "neighbourhood": neighbourhood,
        "room_type": "Private room",
    }
}
