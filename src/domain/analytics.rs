use mongodb::bson::{Bson, Document};
use serde::{Deserialize, Serialize};

use super::filter::Filter;
use super::listing::RoomType;
use super::pipeline::{Group, Operand, Pipeline, Reducer, SortKey};
use super::schema::fields;
use super::value::{as_integer, as_number};
use crate::error::{ListingsError, Result};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighbourhoodPriceStats {
    /// `None` for listings without a neighbourhood.
    pub neighbourhood: Option<String>,
    pub avg_price: f64,
    pub min_price: f64,
    pub max_price: f64,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomTypeCount {
    pub room_type: Option<String>,
    pub count: u64,
}

// ---------------------------------------------------------------------------
// Pipelines
// ---------------------------------------------------------------------------

/// Average, min and max price per neighbourhood, most expensive first.
pub fn price_stats_pipeline() -> Pipeline {
    Pipeline::new()
        .filter(Filter::exists(fields::PRICE, true))
        .group(
            Group::by(fields::NEIGHBOURHOOD)
                .reduce("avg_price", Reducer::Avg(Operand::field(fields::PRICE)))
                .reduce("min_price", Reducer::Min(Operand::field(fields::PRICE)))
                .reduce("max_price", Reducer::Max(Operand::field(fields::PRICE)))
                .reduce("count", Reducer::Count),
        )
        .sort(vec![SortKey::desc("avg_price"), SortKey::asc("_id")])
}

/// Listings per room type, most common first.
pub fn room_type_count_pipeline() -> Pipeline {
    Pipeline::new()
        .group(Group::by(fields::ROOM_TYPE).reduce("count", Reducer::Count))
        .sort(vec![SortKey::desc("count"), SortKey::asc("_id")])
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

fn group_label(row: &Document) -> Result<Option<String>> {
    match row.get("_id") {
        Some(Bson::String(s)) => Ok(Some(s.clone())),
        Some(Bson::Null) | None => Ok(None),
        Some(other) => Err(ListingsError::Database(format!(
            "unexpected group key {other}"
        ))),
    }
}

fn number(row: &Document, key: &str) -> f64 {
    row.get(key).and_then(as_number).unwrap_or_default()
}

fn count(row: &Document) -> u64 {
    row.get("count")
        .and_then(as_integer)
        .and_then(|n| u64::try_from(n).ok())
        .unwrap_or_default()
}

impl TryFrom<&Document> for NeighbourhoodPriceStats {
    type Error = ListingsError;

    fn try_from(row: &Document) -> Result<Self> {
        Ok(Self {
            neighbourhood: group_label(row)?,
            avg_price: number(row, "avg_price"),
            min_price: number(row, "min_price"),
            max_price: number(row, "max_price"),
            count: count(row),
        })
    }
}

impl TryFrom<&Document> for RoomTypeCount {
    type Error = ListingsError;

    fn try_from(row: &Document) -> Result<Self> {
        Ok(Self {
            room_type: group_label(row)?,
            count: count(row),
        })
    }
}

// ---------------------------------------------------------------------------
// Display impls
// ---------------------------------------------------------------------------

impl std::fmt::Display for NeighbourhoodPriceStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: avg {:.2} EUR (min {:.2}, max {:.2}) over {} listings",
            self.neighbourhood.as_deref().unwrap_or("(sin barrio)"),
            self.avg_price,
            self.min_price,
            self.max_price,
            self.count
        )
    }
}

impl std::fmt::Display for RoomTypeCount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label: &str = match self.room_type.as_deref() {
            Some(raw) => RoomType::parse(raw).map_or(raw, |rt| rt.spanish_label()),
            None => "(sin tipo)",
        };
        write!(f, "{label}: {}", self.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;

    #[test]
    fn price_stats_pipeline_shape() {
        let stages = price_stats_pipeline().to_documents();
        assert_eq!(stages.len(), 3);
        assert!(stages[1].contains_key("$group"));
        assert_eq!(
            stages[2],
            doc! { "$sort": { "avg_price": -1, "_id": 1 } }
        );
        price_stats_pipeline().validate().unwrap();
    }

    #[test]
    fn decodes_price_stats_row() {
        let row = doc! {
            "_id": "Centro",
            "avg_price": 98.5,
            "min_price": 20,
            "max_price": 450.0,
            "count": 1_250,
        };
        let stats = NeighbourhoodPriceStats::try_from(&row).unwrap();
        assert_eq!(stats.neighbourhood.as_deref(), Some("Centro"));
        assert!((stats.min_price - 20.0).abs() < f64::EPSILON);
        assert_eq!(stats.count, 1_250);
        assert!(stats.to_string().contains("Centro: avg 98.50 EUR"));
    }

    #[test]
    fn null_group_key_decodes_to_none() {
        let row = doc! { "_id": Bson::Null, "count": 3_i64 };
        let counts = RoomTypeCount::try_from(&row).unwrap();
        assert_eq!(counts.room_type, None);
        assert_eq!(counts.count, 3);
        assert_eq!(counts.to_string(), "(sin tipo): 3");
    }

    #[test]
    fn room_type_counts_print_spanish_labels() {
        let row = doc! { "_id": "Entire home/apt", "count": 12 };
        let counts = RoomTypeCount::try_from(&row).unwrap();
        assert_eq!(counts.room_type.as_deref(), Some("Entire home/apt"));
        assert_eq!(counts.to_string(), "Casa/apartamento completo: 12");

        let row = doc! { "_id": "Castle", "count": 1 };
        assert_eq!(RoomTypeCount::try_from(&row).unwrap().to_string(), "Castle: 1");
    }

    #[test]
    fn unexpected_group_key_is_an_error() {
        let row = doc! { "_id": 7, "count": 1 };
        assert!(RoomTypeCount::try_from(&row).is_err());
    }
}
