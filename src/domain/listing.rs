use std::str::FromStr;

use mongodb::bson::oid::ObjectId;
use mongodb::bson::{Bson, Document};
use serde::{Deserialize, Serialize};

use crate::domain::geo::GeoPoint;
use crate::domain::schema::{self, fields};
use crate::domain::value::{as_integer, as_number};
use crate::error::{ListingsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoomType {
    #[serde(rename = "Entire home/apt")]
    EntireHome,
    #[serde(rename = "Private room")]
    PrivateRoom,
    #[serde(rename = "Shared room")]
    SharedRoom,
    #[serde(rename = "Hotel room")]
    HotelRoom,
}

impl RoomType {
    pub const ALL: [Self; 4] = [
        Self::EntireHome,
        Self::PrivateRoom,
        Self::SharedRoom,
        Self::HotelRoom,
    ];

    pub const ALL_LABELS: [&'static str; 4] = [
        "Entire home/apt",
        "Private room",
        "Shared room",
        "Hotel room",
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::EntireHome => "Entire home/apt",
            Self::PrivateRoom => "Private room",
            Self::SharedRoom => "Shared room",
            Self::HotelRoom => "Hotel room",
        }
    }

    /// Exact match on the stored label.
    pub fn parse(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|rt| rt.as_str() == label)
    }

    /// Label used in Spanish-language reports.
    pub fn spanish_label(self) -> &'static str {
        match self {
            Self::EntireHome => "Casa/apartamento completo",
            Self::PrivateRoom => "Habitación privada",
            Self::SharedRoom => "Habitación compartida",
            Self::HotelRoom => "Habitación de hotel",
        }
    }
}

impl std::fmt::Display for RoomType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<RoomType> for Bson {
    fn from(rt: RoomType) -> Self {
        Bson::String(rt.as_str().to_string())
    }
}

/// Identifier assigned by the store on insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListingId(pub ObjectId);

impl ListingId {
    pub fn new() -> Self {
        Self(ObjectId::new())
    }

    pub fn object_id(self) -> ObjectId {
        self.0
    }
}

impl Default for ListingId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for ListingId {
    type Err = ListingsError;

    fn from_str(s: &str) -> Result<Self> {
        ObjectId::parse_str(s.trim())
            .map(Self)
            .map_err(|_| ListingsError::query(format!("'{s}' is not a valid listing id")))
    }
}

impl std::fmt::Display for ListingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_hex())
    }
}

impl From<ObjectId> for ListingId {
    fn from(oid: ObjectId) -> Self {
        Self(oid)
    }
}

impl From<ListingId> for Bson {
    fn from(id: ListingId) -> Self {
        Bson::ObjectId(id.0)
    }
}

/// Returns the document's `_id`, generating one when absent.
pub fn ensure_object_id(doc: &mut Document) -> Result<ListingId> {
    match doc.get(fields::ID) {
        Some(Bson::ObjectId(oid)) => Ok(ListingId(*oid)),
        Some(other) => Err(ListingsError::validation(
            fields::ID,
            format!("expected objectId, got {other}"),
        )),
        None => {
            let id = ListingId::new();
            doc.insert(fields::ID, id);
            Ok(id)
        }
    }
}

/// Typed view of a listing document. Fields outside the core record are kept
/// verbatim in `extra`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Listing {
    pub id: Option<ListingId>,
    pub name: String,
    pub price: f64,
    pub neighbourhood: Option<String>,
    pub room_type: Option<RoomType>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub availability_365: Option<i64>,
    pub location: Option<GeoPoint>,
    pub description: Option<String>,
    pub extra: Document,
}

impl Listing {
    pub fn new(name: impl Into<String>, price: f64) -> Self {
        Self {
            name: name.into(),
            price,
            ..Self::default()
        }
    }

    pub fn with_neighbourhood(mut self, neighbourhood: impl Into<String>) -> Self {
        self.neighbourhood = Some(neighbourhood.into());
        self
    }

    pub fn with_room_type(mut self, room_type: RoomType) -> Self {
        self.room_type = Some(room_type);
        self
    }

    /// Sets latitude, longitude and the derived GeoJSON point together.
    pub fn with_coordinates(mut self, latitude: f64, longitude: f64) -> Self {
        self.latitude = Some(latitude);
        self.longitude = Some(longitude);
        self.location = Some(GeoPoint::new(longitude, latitude));
        self
    }

    pub fn with_availability(mut self, days: i64) -> Self {
        self.availability_365 = Some(days);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        if let Some(id) = self.id {
            doc.insert(fields::ID, id);
        }
        doc.insert(fields::NAME, self.name.as_str());
        doc.insert(fields::PRICE, self.price);
        if let Some(ref n) = self.neighbourhood {
            doc.insert(fields::NEIGHBOURHOOD, n.as_str());
        }
        if let Some(rt) = self.room_type {
            doc.insert(fields::ROOM_TYPE, rt);
        }
        if let Some(lat) = self.latitude {
            doc.insert(fields::LATITUDE, lat);
        }
        if let Some(lng) = self.longitude {
            doc.insert(fields::LONGITUDE, lng);
        }
        if let Some(days) = self.availability_365 {
            doc.insert(fields::AVAILABILITY_365, days);
        }
        if let Some(point) = self.location {
            doc.insert(fields::LOCATION, point.to_document());
        }
        if let Some(ref d) = self.description {
            doc.insert(fields::DESCRIPTION, d.as_str());
        }
        for (k, v) in &self.extra {
            doc.insert(k.clone(), v.clone());
        }
        doc
    }
}

impl TryFrom<Document> for Listing {
    type Error = ListingsError;

    fn try_from(mut doc: Document) -> Result<Self> {
        schema::validate_document(&doc)?;
        let id = match doc.remove(fields::ID) {
            Some(Bson::ObjectId(oid)) => Some(ListingId(oid)),
            _ => None,
        };
        let name = match doc.remove(fields::NAME) {
            Some(Bson::String(s)) => s,
            _ => String::new(),
        };
        let price = doc.remove(fields::PRICE).as_ref().and_then(as_number).unwrap_or_default();
        let neighbourhood = take_string(&mut doc, fields::NEIGHBOURHOOD);
        let room_type = take_string(&mut doc, fields::ROOM_TYPE).and_then(|s| RoomType::parse(&s));
        let latitude = doc.remove(fields::LATITUDE).as_ref().and_then(as_number);
        let longitude = doc.remove(fields::LONGITUDE).as_ref().and_then(as_number);
        let availability_365 = doc
            .remove(fields::AVAILABILITY_365)
            .as_ref()
            .and_then(as_integer);
        let location = doc.remove(fields::LOCATION).as_ref().and_then(GeoPoint::from_bson);
        // description is free-form; keep non-string values in `extra`
        let description = match doc.get(fields::DESCRIPTION) {
            Some(Bson::String(_)) => take_string(&mut doc, fields::DESCRIPTION),
            _ => None,
        };
        Ok(Self {
            id,
            name,
            price,
            neighbourhood,
            room_type,
            latitude,
            longitude,
            availability_365,
            location,
            description,
            extra: doc,
        })
    }
}

fn take_string(doc: &mut Document, key: &str) -> Option<String> {
    match doc.remove(key) {
        Some(Bson::String(s)) => Some(s),
        _ => None,
    }
}

impl std::fmt::Display for Listing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} - {:.2} EUR/night", self.name, self.price)?;
        if let Some(ref n) = self.neighbourhood {
            write!(f, " | {n}")?;
        }
        if let Some(rt) = self.room_type {
            write!(f, " | {rt}")?;
        }
        if let Some(days) = self.availability_365 {
            write!(f, " | {days} days/year")?;
        }
        if let Some(id) = self.id {
            write!(f, " [{id}]")?;
        }
        Ok(())
    }
}
