//! Typed query filters and their MongoDB rendering.

use mongodb::bson::{Bson, Document, doc};

use crate::domain::geo::Region;
use crate::domain::listing::ListingId;
use crate::domain::schema::fields;
use crate::domain::value::{parse_json_document, type_name};
use crate::error::{ListingsError, Result};

/// Regex flags the server and the memory adapter agree on.
const REGEX_OPTIONS: &str = "imsx";

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(Bson),
    Ne(Bson),
    Gt(Bson),
    Gte(Bson),
    Lt(Bson),
    Lte(Bson),
    In(Vec<Bson>),
    Nin(Vec<Bson>),
    Regex { pattern: String, options: String },
    Exists(bool),
}

impl Predicate {
    fn operator(&self) -> &'static str {
        match self {
            Self::Eq(_) => "$eq",
            Self::Ne(_) => "$ne",
            Self::Gt(_) => "$gt",
            Self::Gte(_) => "$gte",
            Self::Lt(_) => "$lt",
            Self::Lte(_) => "$lte",
            Self::In(_) => "$in",
            Self::Nin(_) => "$nin",
            Self::Regex { .. } => "$regex",
            Self::Exists(_) => "$exists",
        }
    }

    fn to_bson(&self) -> Bson {
        match self {
            Self::Eq(v) if !matches!(v, Bson::Document(_) | Bson::RegularExpression(_)) => v.clone(),
            Self::Regex { pattern, options } if options.is_empty() => {
                Bson::Document(doc! { "$regex": pattern.as_str() })
            }
            Self::Regex { pattern, options } => Bson::Document(doc! {
                "$regex": pattern.as_str(),
                "$options": options.as_str(),
            }),
            Self::Eq(v) | Self::Ne(v) | Self::Gt(v) | Self::Gte(v) | Self::Lt(v) | Self::Lte(v) => {
                let mut d = Document::new();
                d.insert(self.operator(), v.clone());
                Bson::Document(d)
            }
            Self::In(vs) | Self::Nin(vs) => {
                let mut d = Document::new();
                d.insert(self.operator(), vs.clone());
                Bson::Document(d)
            }
            Self::Exists(b) => Bson::Document(doc! { "$exists": *b }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// All children must match. Empty matches every document.
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Field { path: String, predicate: Predicate },
    /// Full-text search over the text-indexed fields.
    Text(String),
    GeoWithin { path: String, region: Region },
}

impl Default for Filter {
    fn default() -> Self {
        Self::all()
    }
}

impl Filter {
    pub fn all() -> Self {
        Self::And(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::And(children) if children.is_empty())
    }

    pub fn field(path: impl Into<String>, predicate: Predicate) -> Self {
        Self::Field {
            path: path.into(),
            predicate,
        }
    }

    pub fn eq(path: impl Into<String>, value: impl Into<Bson>) -> Self {
        Self::field(path, Predicate::Eq(value.into()))
    }

    pub fn ne(path: impl Into<String>, value: impl Into<Bson>) -> Self {
        Self::field(path, Predicate::Ne(value.into()))
    }

    pub fn gt(path: impl Into<String>, value: impl Into<Bson>) -> Self {
        Self::field(path, Predicate::Gt(value.into()))
    }

    pub fn gte(path: impl Into<String>, value: impl Into<Bson>) -> Self {
        Self::field(path, Predicate::Gte(value.into()))
    }

    pub fn lt(path: impl Into<String>, value: impl Into<Bson>) -> Self {
        Self::field(path, Predicate::Lt(value.into()))
    }

    pub fn lte(path: impl Into<String>, value: impl Into<Bson>) -> Self {
        Self::field(path, Predicate::Lte(value.into()))
    }

    pub fn is_in<V: Into<Bson>>(path: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self::field(path, Predicate::In(values.into_iter().map(Into::into).collect()))
    }

    pub fn not_in<V: Into<Bson>>(path: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self::field(path, Predicate::Nin(values.into_iter().map(Into::into).collect()))
    }

    pub fn regex(path: impl Into<String>, pattern: impl Into<String>, case_insensitive: bool) -> Self {
        Self::field(
            path,
            Predicate::Regex {
                pattern: pattern.into(),
                options: if case_insensitive { "i".into() } else { String::new() },
            },
        )
    }

    pub fn exists(path: impl Into<String>, present: bool) -> Self {
        Self::field(path, Predicate::Exists(present))
    }

    pub fn text(terms: impl Into<String>) -> Self {
        Self::Text(terms.into())
    }

    pub fn within(path: impl Into<String>, region: Region) -> Self {
        Self::GeoWithin {
            path: path.into(),
            region,
        }
    }

    pub fn id(id: ListingId) -> Self {
        Self::eq(fields::ID, id)
    }

    /// Conjunction, flattening nested `And`s.
    #[must_use]
    pub fn and(self, other: Filter) -> Self {
        let mut children = match self {
            Self::And(children) => children,
            single => vec![single],
        };
        match other {
            Self::And(more) => children.extend(more),
            single => children.push(single),
        }
        if children.len() == 1 {
            return children.remove(0);
        }
        Self::And(children)
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Self::Or(filters)
    }

    /// Renders the MongoDB query document.
    pub fn to_document(&self) -> Document {
        match self {
            Self::And(children) => {
                let rendered: Vec<Document> = children.iter().map(Self::to_document).collect();
                merge_conjunction(&rendered).unwrap_or_else(|| {
                    doc! { "$and": rendered.into_iter().map(Bson::Document).collect::<Vec<_>>() }
                })
            }
            Self::Or(children) => doc! {
                "$or": children.iter().map(|c| Bson::Document(c.to_document())).collect::<Vec<_>>()
            },
            Self::Field { path, predicate } => {
                let mut d = Document::new();
                d.insert(path.clone(), predicate.to_bson());
                d
            }
            Self::Text(terms) => doc! { "$text": { "$search": terms.as_str() } },
            Self::GeoWithin { path, region } => {
                let mut d = Document::new();
                d.insert(path.clone(), doc! { "$geoWithin": region.to_document() });
                d
            }
        }
    }

    /// True when the filter contains a `$text` clause anywhere.
    pub fn uses_text(&self) -> bool {
        match self {
            Self::Text(_) => true,
            Self::And(children) | Self::Or(children) => children.iter().any(Self::uses_text),
            _ => false,
        }
    }

    /// Parses a MongoDB-style query document.
    pub fn from_document(doc: &Document) -> Result<Self> {
        let mut clauses = Vec::new();
        for (key, value) in doc {
            match key.as_str() {
                "$and" | "$or" => {
                    let children = parse_filter_list(key, value)?;
                    clauses.push(if key == "$and" {
                        Self::And(children)
                    } else {
                        Self::Or(children)
                    });
                }
                "$text" => clauses.push(parse_text(value)?),
                op if op.starts_with('$') => {
                    return Err(ListingsError::query(format!(
                        "unsupported top-level operator {op}"
                    )));
                }
                "" => return Err(ListingsError::query("empty field name in filter")),
                path => clauses.extend(parse_field(path, value)?),
            }
        }
        Ok(match clauses.len() {
            1 => clauses.remove(0),
            _ => Self::And(clauses),
        })
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Self::from_document(&parse_json_document(text)?)
    }
}

impl std::fmt::Display for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_document())
    }
}

// Folds sibling documents into one when their keys do not collide, merging
// operator documents on the same path (`{price: {$gte: 50, $lte: 100}}`).
fn merge_conjunction(parts: &[Document]) -> Option<Document> {
    let mut merged = Document::new();
    for part in parts {
        for (key, value) in part {
            match (merged.get_mut(key), value) {
                (None, _) => {
                    merged.insert(key.clone(), value.clone());
                }
                (Some(Bson::Document(existing)), Bson::Document(incoming))
                    if is_operator_doc(existing)
                        && is_operator_doc(incoming)
                        && incoming.keys().all(|k| !existing.contains_key(k)) =>
                {
                    for (op, operand) in incoming {
                        existing.insert(op.clone(), operand.clone());
                    }
                }
                _ => return None,
            }
        }
    }
    Some(merged)
}

fn is_operator_doc(doc: &Document) -> bool {
    !doc.is_empty() && doc.keys().all(|k| k.starts_with('$')) && !doc.contains_key("$regex")
}

fn parse_filter_list(op: &str, value: &Bson) -> Result<Vec<Filter>> {
    let Bson::Array(items) = value else {
        return Err(ListingsError::query(format!("{op} expects an array")));
    };
    if items.is_empty() {
        return Err(ListingsError::query(format!("{op} needs at least one clause")));
    }
    items
        .iter()
        .map(|item| match item {
            Bson::Document(d) => Filter::from_document(d),
            other => Err(ListingsError::query(format!(
                "{op} clauses must be documents, got {}",
                type_name(other)
            ))),
        })
        .collect()
}

fn parse_text(value: &Bson) -> Result<Filter> {
    let Bson::Document(spec) = value else {
        return Err(ListingsError::query("$text expects a document"));
    };
    if let Some(key) = spec.keys().find(|k| k.as_str() != "$search") {
        return Err(ListingsError::query(format!("unsupported $text option {key}")));
    }
    match spec.get("$search") {
        Some(Bson::String(terms)) => Ok(Filter::Text(terms.clone())),
        _ => Err(ListingsError::query("$text needs a $search string")),
    }
}

fn parse_field(path: &str, value: &Bson) -> Result<Vec<Filter>> {
    match value {
        Bson::Document(ops) if ops.keys().any(|k| k.starts_with('$')) => {
            if ops.keys().any(|k| !k.starts_with('$')) {
                return Err(ListingsError::query(format!(
                    "cannot mix operators and fields under '{path}'"
                )));
            }
            parse_operators(path, ops)
        }
        Bson::RegularExpression(re) => {
            let predicate = regex_predicate(path, re.pattern.clone(), re.options.clone())?;
            Ok(vec![Filter::field(path, predicate)])
        }
        other => Ok(vec![Filter::eq(path, other.clone())]),
    }
}

fn parse_operators(path: &str, ops: &Document) -> Result<Vec<Filter>> {
    let mut out = Vec::new();
    for (op, operand) in ops {
        let predicate = match op.as_str() {
            "$eq" => Predicate::Eq(operand.clone()),
            "$ne" => Predicate::Ne(operand.clone()),
            "$gt" => Predicate::Gt(operand.clone()),
            "$gte" => Predicate::Gte(operand.clone()),
            "$lt" => Predicate::Lt(operand.clone()),
            "$lte" => Predicate::Lte(operand.clone()),
            "$in" | "$nin" => {
                let Bson::Array(values) = operand else {
                    return Err(ListingsError::query(format!("{op} on '{path}' expects an array")));
                };
                if op == "$in" {
                    Predicate::In(values.clone())
                } else {
                    Predicate::Nin(values.clone())
                }
            }
            "$exists" => Predicate::Exists(match operand {
                Bson::Boolean(b) => *b,
                Bson::Int32(n) => *n != 0,
                Bson::Int64(n) => *n != 0,
                other => {
                    return Err(ListingsError::query(format!(
                        "$exists expects a boolean, got {}",
                        type_name(other)
                    )));
                }
            }),
            "$regex" => {
                let (pattern, mut options) = match operand {
                    Bson::String(p) => (p.clone(), String::new()),
                    Bson::RegularExpression(re) => (re.pattern.clone(), re.options.clone()),
                    other => {
                        return Err(ListingsError::query(format!(
                            "$regex expects a string, got {}",
                            type_name(other)
                        )));
                    }
                };
                if let Some(extra) = ops.get("$options") {
                    let Bson::String(extra) = extra else {
                        return Err(ListingsError::query("$options expects a string"));
                    };
                    options.push_str(extra);
                }
                regex_predicate(path, pattern, options)?
            }
            "$options" if ops.contains_key("$regex") => continue,
            "$options" => return Err(ListingsError::query("$options without $regex")),
            "$geoWithin" => {
                let Bson::Document(spec) = operand else {
                    return Err(ListingsError::query("$geoWithin expects a document"));
                };
                out.push(Filter::within(path, Region::from_document(spec)?));
                continue;
            }
            other => {
                return Err(ListingsError::query(format!(
                    "unsupported operator {other} on '{path}'"
                )));
            }
        };
        out.push(Filter::field(path, predicate));
    }
    Ok(out)
}

fn regex_predicate(path: &str, pattern: String, options: String) -> Result<Predicate> {
    if let Some(bad) = options.chars().find(|c| !REGEX_OPTIONS.contains(*c)) {
        return Err(ListingsError::query(format!(
            "unsupported regex option '{bad}' on '{path}'"
        )));
    }
    regex::Regex::new(&pattern).map_err(|e| {
        ListingsError::query(format!("invalid regex on '{path}': {e}"))
    })?;
    let mut options: Vec<char> = options.chars().collect();
    options.sort_unstable();
    options.dedup();
    Ok(Predicate::Regex {
        pattern,
        options: options.into_iter().collect(),
    })
}
