use mongodb::IndexModel;
use mongodb::bson::{Bson, Document, doc};
use mongodb::error::{Error, ErrorKind};
use mongodb::options::IndexOptions;

use crate::domain::geo::GeoPoint;
use crate::domain::index::{IndexKind, IndexSpec};
use crate::domain::pipeline::{Pipeline, SortKey, Stage, sort_document};
use crate::domain::schema::fields;
use crate::domain::value::as_integer;
use crate::ports::listing_store::CollectionStats;

/// `NamespaceNotFound`
pub(super) const NAMESPACE_NOT_FOUND: i32 = 26;
/// `NamespaceExists`
pub(super) const NAMESPACE_EXISTS: i32 = 48;

pub(super) fn command_code(err: &Error) -> Option<i32> {
    match err.kind.as_ref() {
        ErrorKind::Command(command) => Some(command.code),
        _ => None,
    }
}

pub(super) fn index_model(spec: &IndexSpec) -> IndexModel {
    let mut options = IndexOptions::builder().name(spec.name.clone()).build();
    if spec.is_text() {
        options.default_language = Some("spanish".to_string());
    }
    IndexModel::builder()
        .keys(spec.keys_document())
        .options(options)
        .build()
}

/// Geo and text indexes are best effort; the rest must build.
pub(super) fn is_optional_index(spec: &IndexSpec) -> bool {
    spec.keys
        .iter()
        .any(|(_, kind)| matches!(kind, IndexKind::Sphere2d | IndexKind::Text))
}

/// Sort document with `_id` appended so ties come back in insertion order.
pub(super) fn sort_with_tiebreak(keys: &[SortKey]) -> Option<Document> {
    if keys.is_empty() {
        return None;
    }
    let mut sort = sort_document(keys);
    if !sort.contains_key(fields::ID) {
        sort.insert(fields::ID, 1);
    }
    Some(sort)
}

/// Stages as sent to the server, every `$sort` carrying the `_id` tiebreak.
pub(super) fn pipeline_documents(pipeline: &Pipeline) -> Vec<Document> {
    pipeline
        .stages()
        .iter()
        .map(|stage| match stage {
            Stage::Sort(keys) => sort_with_tiebreak(keys)
                .map_or_else(|| stage.to_document(), |sort| doc! { "$sort": sort }),
            other => other.to_document(),
        })
        .collect()
}

pub(super) fn near_filter(point: GeoPoint, max_distance_m: Option<f64>) -> Document {
    let mut near = doc! { "$geometry": point.to_document() };
    if let Some(max) = max_distance_m {
        near.insert("$maxDistance", max);
    }
    doc! { "location": { "$nearSphere": near } }
}

fn stat(doc: &Document, key: &str) -> u64 {
    doc.get(key)
        .and_then(|v| match v {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            Bson::Double(d) if *d >= 0.0 => Some(d.round() as u64),
            other => as_integer(other).and_then(|n| u64::try_from(n).ok()),
        })
        .unwrap_or_default()
}

/// Reads the reply of the `collStats` command.
pub(super) fn stats_from_reply(namespace: &str, reply: &Document) -> CollectionStats {
    CollectionStats {
        namespace: namespace.to_string(),
        count: stat(reply, "count"),
        size_bytes: stat(reply, "size"),
        avg_obj_size_bytes: stat(reply, "avgObjSize"),
        storage_size_bytes: stat(reply, "storageSize"),
        index_count: stat(reply, "nindexes"),
        total_index_size_bytes: stat(reply, "totalIndexSize"),
    }
}
