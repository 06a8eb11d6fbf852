use mongodb::bson::{Bson, Document, doc};
use serde::{Deserialize, Serialize};

use crate::domain::value::as_number;
use crate::error::{ListingsError, Result};

/// Radius used by the document store for `$centerSphere` and `$nearSphere`.
pub const EARTH_RADIUS_M: f64 = 6_378_100.0;

/// A GeoJSON point. Coordinates are stored as `[longitude, latitude]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub longitude: f64,
    pub latitude: f64,
}

impl GeoPoint {
    pub fn new(longitude: f64, latitude: f64) -> Self {
        Self {
            longitude,
            latitude,
        }
    }

    pub fn to_document(self) -> Document {
        doc! { "type": "Point", "coordinates": [self.longitude, self.latitude] }
    }

    /// Reads a `{type: "Point", coordinates: [lng, lat]}` document.
    pub fn from_document(doc: &Document) -> Option<Self> {
        if doc.get_str("type").ok()? != "Point" {
            return None;
        }
        let coords = doc.get_array("coordinates").ok()?;
        if coords.len() != 2 {
            return None;
        }
        Some(Self::new(as_number(&coords[0])?, as_number(&coords[1])?))
    }

    /// Reads either a GeoJSON point or a legacy `[lng, lat]` pair.
    pub fn from_bson(value: &Bson) -> Option<Self> {
        match value {
            Bson::Document(d) => Self::from_document(d),
            Bson::Array(items) if items.len() == 2 => {
                Some(Self::new(as_number(&items[0])?, as_number(&items[1])?))
            }
            _ => None,
        }
    }

    /// Great-circle distance in metres.
    pub fn distance_m(self, other: Self) -> f64 {
        let (lat1, lat2) = (self.latitude.to_radians(), other.latitude.to_radians());
        let d_lat = lat2 - lat1;
        let d_lng = (other.longitude - self.longitude).to_radians();
        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().min(1.0).asin()
    }
}

impl std::fmt::Display for GeoPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.5}, {:.5})", self.latitude, self.longitude)
    }
}

/// Area used by `$geoWithin` filters.
#[derive(Debug, Clone, PartialEq)]
pub enum Region {
    Circle { center: GeoPoint, radius_m: f64 },
    /// Outer ring; closing the ring is optional.
    Polygon(Vec<GeoPoint>),
}

impl Region {
    pub fn circle(center: GeoPoint, radius_m: f64) -> Self {
        Self::Circle { center, radius_m }
    }

    pub fn contains(&self, point: GeoPoint) -> bool {
        match self {
            Self::Circle { center, radius_m } => center.distance_m(point) <= *radius_m,
            Self::Polygon(ring) => ring_contains(ring, point),
        }
    }

    /// Renders the `$geoWithin` operand.
    pub fn to_document(&self) -> Document {
        match self {
            Self::Circle { center, radius_m } => doc! {
                "$centerSphere": [[center.longitude, center.latitude], radius_m / EARTH_RADIUS_M]
            },
            Self::Polygon(ring) => {
                let mut coords: Vec<Bson> = ring
                    .iter()
                    .map(|p| Bson::Array(vec![p.longitude.into(), p.latitude.into()]))
                    .collect();
                if ring.first() != ring.last()
                    && let Some(first) = coords.first().cloned()
                {
                    coords.push(first);
                }
                doc! { "$geometry": { "type": "Polygon", "coordinates": [coords] } }
            }
        }
    }

    /// Parses a `$geoWithin` operand (`$centerSphere` or `$geometry` polygon).
    pub fn from_document(doc: &Document) -> Result<Self> {
        if let Ok(spec) = doc.get_array("$centerSphere") {
            let center = spec
                .first()
                .and_then(GeoPoint::from_bson)
                .ok_or_else(|| ListingsError::query("$centerSphere needs a [lng, lat] center"))?;
            let radians = spec
                .get(1)
                .and_then(as_number)
                .filter(|r| *r >= 0.0)
                .ok_or_else(|| ListingsError::query("$centerSphere needs a non-negative radius"))?;
            return Ok(Self::circle(center, radians * EARTH_RADIUS_M));
        }
        if let Ok(geometry) = doc.get_document("$geometry") {
            if geometry.get_str("type").ok() != Some("Polygon") {
                return Err(ListingsError::query("$geometry must be a Polygon"));
            }
            let outer = geometry
                .get_array("coordinates")
                .ok()
                .and_then(|rings| rings.first())
                .and_then(Bson::as_array)
                .ok_or_else(|| ListingsError::query("Polygon needs an outer ring"))?;
            let ring = outer
                .iter()
                .map(GeoPoint::from_bson)
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| ListingsError::query("Polygon ring has a malformed point"))?;
            if ring.len() < 3 {
                return Err(ListingsError::query("Polygon needs at least three points"));
            }
            return Ok(Self::Polygon(ring));
        }
        Err(ListingsError::query(
            "$geoWithin supports $centerSphere or a $geometry Polygon",
        ))
    }
}

// Planar ray casting. Good enough at city scale.
fn ring_contains(ring: &[GeoPoint], point: GeoPoint) -> bool {
    if ring.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = ring.len() - 1;
    for i in 0..ring.len() {
        let (a, b) = (ring[i], ring[j]);
        if (a.latitude > point.latitude) != (b.latitude > point.latitude) {
            let cross = (b.longitude - a.longitude) * (point.latitude - a.latitude)
                / (b.latitude - a.latitude)
                + a.longitude;
            if point.longitude < cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}
