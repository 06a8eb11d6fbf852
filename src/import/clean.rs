//! Turns raw Inside Airbnb CSV rows into listing documents.

use chrono::{DateTime as ChronoDateTime, NaiveDate};
use csv::StringRecord;
use mongodb::bson::{Bson, DateTime, Document};

use crate::domain::geo::GeoPoint;
use crate::domain::schema::fields;

/// Columns kept when the importer is not asked to keep everything.
pub const STANDARD_COLUMNS: &[&str] = &[
    "id",
    "listing_url",
    "scrape_id",
    "last_scraped",
    "name",
    "description",
    "neighborhood_overview",
    "picture_url",
    "host_id",
    "host_url",
    "host_name",
    "host_since",
    "host_location",
    "host_about",
    "host_response_time",
    "host_response_rate",
    "host_acceptance_rate",
    "host_is_superhost",
    "host_thumbnail_url",
    "host_picture_url",
    "host_neighbourhood",
    "host_listings_count",
    "host_total_listings_count",
    "host_verifications",
    "host_has_profile_pic",
    "host_identity_verified",
    "neighbourhood",
    "neighbourhood_cleansed",
    "neighbourhood_group_cleansed",
    "latitude",
    "longitude",
    "property_type",
    "room_type",
    "accommodates",
    "bathrooms",
    "bathrooms_text",
    "bedrooms",
    "beds",
    "amenities",
    "price",
    "minimum_nights",
    "maximum_nights",
    "minimum_minimum_nights",
    "maximum_minimum_nights",
    "minimum_maximum_nights",
    "maximum_maximum_nights",
    "minimum_nights_avg_ntm",
    "maximum_nights_avg_ntm",
    "calendar_updated",
    "has_availability",
    "availability_30",
    "availability_60",
    "availability_90",
    "availability_365",
    "calendar_last_scraped",
    "number_of_reviews",
    "number_of_reviews_ltm",
    "number_of_reviews_l30d",
    "first_review",
    "last_review",
    "review_scores_rating",
    "review_scores_accuracy",
    "review_scores_cleanliness",
    "review_scores_checkin",
    "review_scores_communication",
    "review_scores_location",
    "review_scores_value",
    "license",
    "instant_bookable",
    "calculated_host_listings_count",
    "calculated_host_listings_count_entire_homes",
    "calculated_host_listings_count_private_rooms",
    "calculated_host_listings_count_shared_rooms",
    "reviews_per_month",
];

pub const DATE_COLUMNS: &[&str] = &[
    "last_scraped",
    "host_since",
    "calendar_updated",
    "first_review",
    "last_review",
    "calendar_last_scraped",
];

pub const BOOLEAN_COLUMNS: &[&str] = &[
    "host_is_superhost",
    "host_has_profile_pic",
    "host_identity_verified",
    "has_availability",
    "instant_bookable",
];

pub const PERCENTAGE_COLUMNS: &[&str] = &["host_response_rate", "host_acceptance_rate"];

/// Free-text columns. Kept as strings even when a value looks numeric
/// (a listing called "1984", a neighbourhood "28012").
pub const TEXT_COLUMNS: &[&str] = &[
    "listing_url",
    "name",
    "description",
    "neighborhood_overview",
    "picture_url",
    "host_url",
    "host_name",
    "host_location",
    "host_about",
    "host_response_time",
    "host_thumbnail_url",
    "host_picture_url",
    "host_neighbourhood",
    "host_verifications",
    "neighbourhood",
    "neighbourhood_cleansed",
    "neighbourhood_group_cleansed",
    "property_type",
    "room_type",
    "bathrooms_text",
    "amenities",
    "license",
    "source",
];

const UNNAMED: &str = "Sin nombre";

/// What a header row says about the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSummary {
    pub columns: usize,
    pub has_location: bool,
    pub has_price: bool,
    pub has_reviews: bool,
}

impl ColumnSummary {
    pub fn from_headers(headers: &StringRecord) -> Self {
        let has = |name: &str| headers.iter().any(|h| h == name);
        Self {
            columns: headers.len(),
            has_location: has(fields::LATITUDE) && has(fields::LONGITUDE),
            has_price: has(fields::PRICE),
            has_reviews: has("number_of_reviews"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RowCleaner {
    keep_all_columns: bool,
}

impl RowCleaner {
    pub fn new(keep_all_columns: bool) -> Self {
        Self { keep_all_columns }
    }

    fn keeps(&self, column: &str) -> bool {
        self.keep_all_columns || STANDARD_COLUMNS.contains(&column)
    }

    /// Cleans one row. `None` when the file has coordinates but this row's
    /// are missing or out of range.
    pub fn clean(&self, headers: &StringRecord, row: &StringRecord) -> Option<Document> {
        let mut doc = Document::new();
        for (column, raw) in headers.iter().zip(row.iter()) {
            if column.is_empty() || !self.keeps(column) {
                continue;
            }
            doc.insert(column, clean_value(column, raw));
        }

        for column in [fields::NAME, "host_name"] {
            if matches!(doc.get(column), Some(Bson::Null)) {
                doc.insert(column, UNNAMED);
            }
        }
        if matches!(doc.get("reviews_per_month"), Some(Bson::Null)) {
            doc.insert("reviews_per_month", 0.0);
        }

        let summary = ColumnSummary::from_headers(headers);
        if summary.has_location {
            let point = coordinate(&doc, fields::LONGITUDE)
                .zip(coordinate(&doc, fields::LATITUDE))
                .map(|(lng, lat)| GeoPoint::new(lng, lat))
                .filter(|p| {
                    (-180.0..=180.0).contains(&p.longitude) && (-90.0..=90.0).contains(&p.latitude)
                })?;
            doc.insert(fields::LOCATION, point.to_document());
        }
        Some(doc)
    }
}

fn coordinate(doc: &Document, field: &str) -> Option<f64> {
    match doc.get(field)? {
        Bson::Double(v) => Some(*v),
        Bson::Int32(v) => Some(f64::from(*v)),
        #[allow(clippy::cast_precision_loss)]
        Bson::Int64(v) => Some(*v as f64),
        _ => None,
    }
}

/// Applies the per-column conversion rules to one cell.
pub fn clean_value(column: &str, raw: &str) -> Bson {
    let raw = raw.trim();
    if column == fields::PRICE {
        return Bson::Double(parse_price(raw));
    }
    if raw.is_empty() {
        return Bson::Null;
    }
    if TEXT_COLUMNS.contains(&column) {
        return Bson::String(raw.to_string());
    }
    if DATE_COLUMNS.contains(&column) {
        return parse_date(raw).map_or(Bson::Null, Bson::DateTime);
    }
    if BOOLEAN_COLUMNS.contains(&column) {
        return match raw {
            "t" => Bson::Boolean(true),
            "f" => Bson::Boolean(false),
            _ => Bson::Null,
        };
    }
    if PERCENTAGE_COLUMNS.contains(&column) {
        return raw
            .trim_end_matches('%')
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map_or(Bson::Null, |v| Bson::Double(v / 100.0));
    }
    infer(raw)
}

/// `"$1,234.00"` is 1234.0. Anything unparseable is 0.
pub fn parse_price(raw: &str) -> f64 {
    let digits: String = raw.chars().filter(|c| !matches!(c, '$' | ',')).collect();
    digits
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

/// Accepts `YYYY-MM-DD` and RFC 3339 timestamps.
pub fn parse_date(raw: &str) -> Option<DateTime> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let midnight = date.and_hms_opt(0, 0, 0)?;
        return Some(DateTime::from_millis(midnight.and_utc().timestamp_millis()));
    }
    ChronoDateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| DateTime::from_millis(dt.timestamp_millis()))
}

// Integer, then float, then text. Non-finite floats become null.
fn infer(raw: &str) -> Bson {
    if let Ok(n) = raw.parse::<i64>() {
        return i32::try_from(n).map_or(Bson::Int64(n), Bson::Int32);
    }
    if let Ok(v) = raw.parse::<f64>() {
        return if v.is_finite() { Bson::Double(v) } else { Bson::Null };
    }
    Bson::String(raw.to_string())
}
