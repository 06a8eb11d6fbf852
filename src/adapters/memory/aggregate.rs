use std::cmp::Ordering;

use mongodb::bson::{Bson, Document};

use super::eval::CompiledFilter;
use crate::domain::pipeline::{Group, GroupKey, Operand, Pipeline, Reducer, SortDirection, SortKey, Stage};
use crate::domain::value::{as_number, compare, get_path, values_equal};
use crate::error::Result;

/// Runs `pipeline` over a snapshot of the collection.
pub(crate) fn run(pipeline: &Pipeline, mut docs: Vec<Document>, text_fields: &[String]) -> Result<Vec<Document>> {
    for stage in pipeline.stages() {
        docs = match stage {
            Stage::Match(filter) => {
                let compiled = CompiledFilter::compile(filter, text_fields)?;
                docs.into_iter().filter(|d| compiled.matches(d)).collect()
            }
            Stage::Group(group) => group_documents(group, &docs),
            Stage::Sort(keys) => {
                sort_documents(&mut docs, keys);
                docs
            }
            Stage::Skip(n) => docs.into_iter().skip(to_usize(*n)).collect(),
            Stage::Limit(n) => docs.into_iter().take(to_usize(*n)).collect(),
            Stage::Project(projection) => docs.iter().map(|d| projection.apply(d)).collect(),
        };
    }
    Ok(docs)
}

pub(crate) fn to_usize(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

/// Stable multi-key sort; missing fields sort as null.
pub(crate) fn sort_documents(docs: &mut [Document], keys: &[SortKey]) {
    if keys.is_empty() {
        return;
    }
    docs.sort_by(|a, b| {
        for key in keys {
            let left = get_path(a, &key.field).unwrap_or(&Bson::Null);
            let right = get_path(b, &key.field).unwrap_or(&Bson::Null);
            let ord = match key.direction {
                SortDirection::Ascending => compare(left, right),
                SortDirection::Descending => compare(right, left),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

enum Accumulator {
    Sum { int: i64, float: f64, is_float: bool },
    Avg { total: f64, n: u64 },
    Min(Option<Bson>),
    Max(Option<Bson>),
    Count(i64),
}

impl Accumulator {
    fn new(reducer: &Reducer) -> Self {
        match reducer {
            Reducer::Sum(_) => Self::Sum {
                int: 0,
                float: 0.0,
                is_float: false,
            },
            Reducer::Avg(_) => Self::Avg { total: 0.0, n: 0 },
            Reducer::Min(_) => Self::Min(None),
            Reducer::Max(_) => Self::Max(None),
            Reducer::Count => Self::Count(0),
        }
    }

    fn add(&mut self, value: Option<&Bson>) {
        match self {
            Self::Sum { int, float, is_float } => match value {
                Some(Bson::Int32(v)) => add_integer(int, float, is_float, i64::from(*v)),
                Some(Bson::Int64(v)) => add_integer(int, float, is_float, *v),
                Some(Bson::Double(v)) => {
                    *float += v;
                    *is_float = true;
                }
                _ => {}
            },
            Self::Avg { total, n } => {
                if let Some(v) = value.and_then(as_number) {
                    *total += v;
                    *n += 1;
                }
            }
            Self::Min(current) => keep_extreme(current, value, Ordering::Less),
            Self::Max(current) => keep_extreme(current, value, Ordering::Greater),
            Self::Count(n) => *n += 1,
        }
    }

    fn finish(self) -> Bson {
        match self {
            #[allow(clippy::cast_precision_loss)]
            Self::Sum { int, float, is_float } if is_float => Bson::Double(int as f64 + float),
            Self::Sum { int, .. } | Self::Count(int) => {
                i32::try_from(int).map_or(Bson::Int64(int), Bson::Int32)
            }
            #[allow(clippy::cast_precision_loss)]
            Self::Avg { total, n } if n > 0 => Bson::Double(total / n as f64),
            Self::Avg { .. } => Bson::Null,
            Self::Min(v) | Self::Max(v) => v.unwrap_or(Bson::Null),
        }
    }
}

// Integer $sum that leaves the i64 range continues as a double.
#[allow(clippy::cast_precision_loss)]
fn add_integer(int: &mut i64, float: &mut f64, is_float: &mut bool, v: i64) {
    match int.checked_add(v) {
        Some(sum) => *int = sum,
        None => {
            *float += *int as f64 + v as f64;
            *int = 0;
            *is_float = true;
        }
    }
}

// $min/$max ignore null and missing values.
fn keep_extreme(current: &mut Option<Bson>, value: Option<&Bson>, wanted: Ordering) {
    let Some(value) = value.filter(|v| !matches!(v, Bson::Null | Bson::Undefined)) else {
        return;
    };
    let replace = current
        .as_ref()
        .is_none_or(|c| compare(value, c) == wanted);
    if replace {
        *current = Some(value.clone());
    }
}

fn operand_value<'a>(operand: &'a Operand, doc: &'a Document) -> Option<&'a Bson> {
    match operand {
        Operand::Field(path) => get_path(doc, path),
        Operand::Constant(value) => Some(value),
    }
}

fn group_key(key: &GroupKey, doc: &Document) -> Bson {
    match key {
        GroupKey::Constant(value) => value.clone(),
        GroupKey::Field(path) => get_path(doc, path).cloned().unwrap_or(Bson::Null),
        GroupKey::Compound(parts) => {
            let mut out = Document::new();
            for (name, path) in parts {
                if let Some(value) = get_path(doc, path) {
                    out.insert(name.clone(), value.clone());
                }
            }
            Bson::Document(out)
        }
    }
}

/// One output document per distinct key, in first-seen order.
fn group_documents(group: &Group, docs: &[Document]) -> Vec<Document> {
    let mut groups: Vec<(Bson, Vec<Accumulator>)> = Vec::new();
    for doc in docs {
        let key = group_key(&group.key, doc);
        let slot = match groups.iter().position(|(k, _)| values_equal(k, &key)) {
            Some(i) => i,
            None => {
                let accs = group
                    .accumulators
                    .iter()
                    .map(|(_, r)| Accumulator::new(r))
                    .collect();
                groups.push((key, accs));
                groups.len() - 1
            }
        };
        for ((_, reducer), acc) in group.accumulators.iter().zip(groups[slot].1.iter_mut()) {
            let value = match reducer {
                Reducer::Sum(op) | Reducer::Avg(op) | Reducer::Min(op) | Reducer::Max(op) => {
                    operand_value(op, doc)
                }
                Reducer::Count => None,
            };
            acc.add(value);
        }
    }
    groups
        .into_iter()
        .map(|(key, accs)| {
            let mut out = Document::new();
            out.insert("_id", key);
            for ((name, _), acc) in group.accumulators.iter().zip(accs) {
                out.insert(name.clone(), acc.finish());
            }
            out
        })
        .collect()
}
