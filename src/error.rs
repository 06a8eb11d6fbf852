use mongodb::bson::{Bson, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use thiserror::Error;

/// Server error code for a write rejected by the collection validator.
const DOCUMENT_VALIDATION_FAILURE: i32 = 121;

/// Server error codes that mean the request itself was malformed.
const QUERY_ERROR_CODES: &[i32] = &[
    2,     // BadValue
    9,     // FailedToParse
    14,    // TypeMismatch
    27,    // IndexNotFound ($text without a text index)
    40_323, // pipeline stage must have exactly one field
    40_324, // unrecognized pipeline stage
    15_952, // unknown group operator
    16_410, // field path references must be prefixed with '$'
    17_287, // can't canonicalize query
    31_249, // path collision in projection
    31_254, // cannot do exclusion on field in inclusion projection
    51_024, // BSON field value must be >= 0
];

#[derive(Error, Debug)]
pub enum ListingsError {
    #[error("Cannot reach the database: {reason}")]
    Connectivity { reason: String },

    #[error("Validation failed for field '{field}': {reason}")]
    Validation { field: String, reason: String },

    #[error("Listing not found: {id}")]
    NotFound { id: String },

    #[error("Invalid query: {reason}")]
    Query { reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yml::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("BSON error: {0}")]
    Bson(String),
}

impl ListingsError {
    pub(crate) fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn query(reason: impl Into<String>) -> Self {
        Self::Query {
            reason: reason.into(),
        }
    }
}

// Field and message of the first write the collection validator refused, if any.
fn validator_rejection(kind: &ErrorKind) -> Option<(String, String)> {
    let (message, details) = match kind {
        ErrorKind::Write(WriteFailure::WriteError(write))
            if write.code == DOCUMENT_VALIDATION_FAILURE =>
        {
            (&write.message, write.details.as_ref())
        }
        ErrorKind::InsertMany(failure) => failure
            .write_errors
            .as_ref()?
            .iter()
            .find(|w| w.code == DOCUMENT_VALIDATION_FAILURE)
            .map(|w| (&w.message, w.details.as_ref()))?,
        _ => return None,
    };
    let field = details
        .and_then(rejected_field)
        .unwrap_or_else(|| "document".to_string());
    Some((field, message.clone()))
}

/// First property named in a `$jsonSchema` failure report (`errInfo`).
fn rejected_field(err_info: &Document) -> Option<String> {
    let details = err_info.get_document("details").unwrap_or(err_info);
    details
        .get_array("schemaRulesNotSatisfied")
        .ok()?
        .iter()
        .filter_map(Bson::as_document)
        .find_map(|rule| {
            let from_properties = rule
                .get_array("propertiesNotSatisfied")
                .ok()
                .and_then(|props| props.iter().filter_map(Bson::as_document).next())
                .and_then(|prop| prop.get_str("propertyName").ok());
            let from_required = rule
                .get_array("missingProperties")
                .ok()
                .and_then(|missing| missing.iter().find_map(Bson::as_str));
            from_properties.or(from_required).map(str::to_string)
        })
}

impl From<mongodb::error::Error> for ListingsError {
    fn from(err: mongodb::error::Error) -> Self {
        if let Some((field, reason)) = validator_rejection(err.kind.as_ref()) {
            return Self::validation(field, reason);
        }
        match err.kind.as_ref() {
            ErrorKind::ServerSelection { .. }
            | ErrorKind::Io(_)
            | ErrorKind::DnsResolve { .. }
            | ErrorKind::ConnectionPoolCleared { .. }
            | ErrorKind::Authentication { .. } => Self::Connectivity {
                reason: err.to_string(),
            },
            ErrorKind::Command(command) if QUERY_ERROR_CODES.contains(&command.code) => {
                Self::query(command.message.clone())
            }
            ErrorKind::InvalidArgument { message, .. } => Self::query(message.clone()),
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<mongodb::bson::ser::Error> for ListingsError {
    fn from(err: mongodb::bson::ser::Error) -> Self {
        Self::Bson(err.to_string())
    }
}

impl From<mongodb::bson::de::Error> for ListingsError {
    fn from(err: mongodb::bson::de::Error) -> Self {
        Self::Bson(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ListingsError>;
