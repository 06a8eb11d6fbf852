//! Listing document rules, shared by the client-side validator, the memory
//! adapter and the `$jsonSchema` installed on the server collection.

use mongodb::bson::{Bson, Document, doc};

use crate::domain::geo::GeoPoint;
use crate::domain::listing::RoomType;
use crate::domain::value::{as_integer, as_number, type_name};
use crate::error::{ListingsError, Result};

pub mod fields {
    pub const ID: &str = "_id";
    pub const NAME: &str = "name";
    pub const PRICE: &str = "price";
    pub const NEIGHBOURHOOD: &str = "neighbourhood";
    pub const ROOM_TYPE: &str = "room_type";
    pub const LATITUDE: &str = "latitude";
    pub const LONGITUDE: &str = "longitude";
    pub const AVAILABILITY_365: &str = "availability_365";
    pub const LOCATION: &str = "location";
    pub const DESCRIPTION: &str = "description";
}

pub const REQUIRED_FIELDS: [&str; 2] = [fields::NAME, fields::PRICE];

/// Fields the validator has an opinion about.
pub const CONSTRAINED_FIELDS: [&str; 9] = [
    fields::ID,
    fields::NAME,
    fields::PRICE,
    fields::NEIGHBOURHOOD,
    fields::ROOM_TYPE,
    fields::LATITUDE,
    fields::LONGITUDE,
    fields::AVAILABILITY_365,
    fields::LOCATION,
];

/// True when `path` is, or reaches into, a schema-constrained field.
pub fn is_constrained(path: &str) -> bool {
    let root = path.split('.').next().unwrap_or(path);
    CONSTRAINED_FIELDS.contains(&root)
}

/// Validates a complete listing document.
pub fn validate_document(doc: &Document) -> Result<()> {
    for field in REQUIRED_FIELDS {
        match doc.get(field) {
            None | Some(Bson::Null) => {
                return Err(ListingsError::validation(field, "is required"));
            }
            Some(_) => {}
        }
    }
    for field in CONSTRAINED_FIELDS {
        if let Some(value) = doc.get(field) {
            check_field(field, value)?;
        }
    }
    Ok(())
}

/// Validates the field map of a partial update (`$set` operand).
pub fn validate_changes(changes: &Document) -> Result<()> {
    for (path, value) in changes {
        if path.is_empty() || path.starts_with('$') {
            return Err(ListingsError::query(format!(
                "'{path}' is not a valid field name"
            )));
        }
        if path == fields::ID {
            return Err(ListingsError::validation(fields::ID, "cannot be modified"));
        }
        if path.contains('.') {
            let root = path.split('.').next().unwrap_or_default();
            if is_constrained(path) {
                return Err(ListingsError::validation(
                    root,
                    "must be replaced as a whole, not through a dotted path",
                ));
            }
            continue;
        }
        if REQUIRED_FIELDS.contains(&path.as_str()) && matches!(value, Bson::Null) {
            return Err(ListingsError::validation(path.as_str(), "is required"));
        }
        if CONSTRAINED_FIELDS.contains(&path.as_str()) {
            check_field(path, value)?;
        }
    }
    Ok(())
}

/// Checks a single top-level field. Null is accepted for optional fields.
pub fn check_field(field: &str, value: &Bson) -> Result<()> {
    let optional = field != fields::ID && !REQUIRED_FIELDS.contains(&field);
    if optional && matches!(value, Bson::Null) {
        return Ok(());
    }
    match field {
        fields::ID => match value {
            Bson::ObjectId(_) => Ok(()),
            other => Err(type_error(field, "objectId", other)),
        },
        fields::NAME | fields::NEIGHBOURHOOD => match value {
            Bson::String(_) => Ok(()),
            other => Err(type_error(field, "string", other)),
        },
        fields::PRICE => {
            let price = as_number(value).ok_or_else(|| type_error(field, "number", value))?;
            if price.is_nan() || price < 0.0 {
                return Err(ListingsError::validation(field, format!("must be >= 0, got {price}")));
            }
            Ok(())
        }
        fields::ROOM_TYPE => match value {
            Bson::String(s) if RoomType::parse(s).is_some() => Ok(()),
            Bson::String(s) => Err(ListingsError::validation(
                field,
                format!("'{s}' is not one of {}", RoomType::ALL_LABELS.join(", ")),
            )),
            other => Err(type_error(field, "string", other)),
        },
        fields::LATITUDE => check_range(field, value, -90.0, 90.0),
        fields::LONGITUDE => check_range(field, value, -180.0, 180.0),
        fields::AVAILABILITY_365 => {
            let days = as_integer(value).ok_or_else(|| type_error(field, "integer", value))?;
            if !(0..=365).contains(&days) {
                return Err(ListingsError::validation(
                    field,
                    format!("must be between 0 and 365, got {days}"),
                ));
            }
            Ok(())
        }
        fields::LOCATION => check_location(value),
        _ => Ok(()),
    }
}

fn check_range(field: &str, value: &Bson, min: f64, max: f64) -> Result<()> {
    let v = as_number(value).ok_or_else(|| type_error(field, "number", value))?;
    if !(min..=max).contains(&v) {
        return Err(ListingsError::validation(
            field,
            format!("must be between {min} and {max}, got {v}"),
        ));
    }
    Ok(())
}

fn check_location(value: &Bson) -> Result<()> {
    let Bson::Document(doc) = value else {
        return Err(type_error(fields::LOCATION, "object", value));
    };
    match doc.get("type") {
        Some(Bson::String(t)) if t == "Point" => {}
        Some(_) => {
            return Err(ListingsError::validation(
                fields::LOCATION,
                "type must be \"Point\"",
            ));
        }
        None => {
            return Err(ListingsError::validation(fields::LOCATION, "type is required"));
        }
    }
    let Ok(coords) = doc.get_array("coordinates") else {
        return Err(ListingsError::validation(
            fields::LOCATION,
            "coordinates must be an array",
        ));
    };
    if coords.len() != 2 || GeoPoint::from_document(doc).is_none() {
        return Err(ListingsError::validation(
            fields::LOCATION,
            "coordinates must hold exactly two numbers [longitude, latitude]",
        ));
    }
    Ok(())
}

fn type_error(field: &str, expected: &str, got: &Bson) -> ListingsError {
    ListingsError::validation(
        field,
        format!("expected {expected}, got {}", type_name(got)),
    )
}

/// The same rules as a server-side `$jsonSchema` validator.
pub fn json_schema() -> Document {
    let room_types: Vec<Bson> = RoomType::ALL_LABELS
        .iter()
        .map(|label| Bson::String((*label).to_string()))
        .chain(std::iter::once(Bson::Null))
        .collect();
    doc! {
        "$jsonSchema": {
            "bsonType": "object",
            "required": [fields::NAME, fields::PRICE],
            "properties": {
                "name": {
                    "bsonType": "string",
                    "description": "Listing name, required",
                },
                "price": {
                    "bsonType": ["double", "int", "long", "decimal"],
                    "minimum": 0,
                    "description": "Nightly price, required and non-negative",
                },
                "neighbourhood": { "bsonType": ["string", "null"] },
                "room_type": { "enum": room_types },
                "latitude": {
                    "bsonType": ["double", "int", "long", "decimal", "null"],
                    "minimum": -90,
                    "maximum": 90,
                },
                "longitude": {
                    "bsonType": ["double", "int", "long", "decimal", "null"],
                    "minimum": -180,
                    "maximum": 180,
                },
                "availability_365": {
                    "bsonType": ["int", "long", "double", "null"],
                    "minimum": 0,
                    "maximum": 365,
                    "multipleOf": 1,
                },
                "location": {
                    "bsonType": ["object", "null"],
                    "required": ["type", "coordinates"],
                    "properties": {
                        "type": { "enum": ["Point"] },
                        "coordinates": {
                            "bsonType": "array",
                            "minItems": 2,
                            "maxItems": 2,
                            "items": { "bsonType": ["double", "int", "long", "decimal"] },
                        },
                    },
                },
            },
        }
    }
}
