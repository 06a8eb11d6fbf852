//! Aggregation pipelines as tagged stage sequences.

use mongodb::bson::{Bson, Document, doc};

use crate::domain::filter::Filter;
use crate::domain::projection::Projection;
use crate::domain::value::{parse_json, type_name};
use crate::error::{ListingsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub direction: SortDirection,
}

impl SortKey {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Ascending,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Descending,
        }
    }
}

pub fn sort_document(keys: &[SortKey]) -> Document {
    let mut doc = Document::new();
    for key in keys {
        let dir = match key.direction {
            SortDirection::Ascending => 1,
            SortDirection::Descending => -1,
        };
        doc.insert(key.field.clone(), dir);
    }
    doc
}

/// Parses `{field: 1, other: -1}`.
pub fn parse_sort(doc: &Document) -> Result<Vec<SortKey>> {
    if doc.is_empty() {
        return Err(ListingsError::query("sort needs at least one field"));
    }
    doc.iter()
        .map(|(field, dir)| match dir {
            Bson::Int32(1) | Bson::Int64(1) => Ok(SortKey::asc(field.clone())),
            Bson::Int32(-1) | Bson::Int64(-1) => Ok(SortKey::desc(field.clone())),
            Bson::Double(d) if *d == 1.0 => Ok(SortKey::asc(field.clone())),
            Bson::Double(d) if *d == -1.0 => Ok(SortKey::desc(field.clone())),
            other => Err(ListingsError::query(format!(
                "sort direction for '{field}' must be 1 or -1, got {other}"
            ))),
        })
        .collect()
}

/// Accumulator input: a field path or a literal.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Field(String),
    Constant(Bson),
}

impl Operand {
    pub fn field(path: impl Into<String>) -> Self {
        Self::Field(path.into())
    }

    fn to_bson(&self) -> Bson {
        match self {
            Self::Field(path) => Bson::String(format!("${path}")),
            Self::Constant(value) => value.clone(),
        }
    }

    fn from_bson(value: &Bson) -> Result<Self> {
        match value {
            Bson::String(s) if s.starts_with('$') => {
                let path = &s[1..];
                if path.is_empty() || path.starts_with('$') {
                    return Err(ListingsError::query(format!("'{s}' is not a field path")));
                }
                Ok(Self::Field(path.to_string()))
            }
            Bson::Document(_) | Bson::Array(_) => Err(ListingsError::query(
                "accumulator expressions are limited to field paths and literals",
            )),
            other => Ok(Self::Constant(other.clone())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reducer {
    Sum(Operand),
    Avg(Operand),
    Min(Operand),
    Max(Operand),
    Count,
}

impl Reducer {
    fn to_document(&self) -> Document {
        match self {
            Self::Sum(op) => doc! { "$sum": op.to_bson() },
            Self::Avg(op) => doc! { "$avg": op.to_bson() },
            Self::Min(op) => doc! { "$min": op.to_bson() },
            Self::Max(op) => doc! { "$max": op.to_bson() },
            Self::Count => doc! { "$sum": 1 },
        }
    }

    fn from_document(name: &str, spec: &Document) -> Result<Self> {
        let mut entries = spec.iter();
        let (Some((op, arg)), None) = (entries.next(), entries.next()) else {
            return Err(ListingsError::query(format!(
                "accumulator '{name}' must have exactly one operator"
            )));
        };
        match op.as_str() {
            "$sum" if matches!(arg, Bson::Int32(1) | Bson::Int64(1)) => Ok(Self::Count),
            "$sum" => Ok(Self::Sum(Operand::from_bson(arg)?)),
            "$avg" => Ok(Self::Avg(Operand::from_bson(arg)?)),
            "$min" => Ok(Self::Min(Operand::from_bson(arg)?)),
            "$max" => Ok(Self::Max(Operand::from_bson(arg)?)),
            "$count" => Ok(Self::Count),
            other => Err(ListingsError::query(format!(
                "unsupported accumulator {other} in '{name}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GroupKey {
    /// Every document lands in one group (`_id: null` or another literal).
    Constant(Bson),
    Field(String),
    /// `_id: {out: "$path", ...}`
    Compound(Vec<(String, String)>),
}

impl GroupKey {
    fn to_bson(&self) -> Bson {
        match self {
            Self::Constant(value) => value.clone(),
            Self::Field(path) => Bson::String(format!("${path}")),
            Self::Compound(parts) => {
                let mut doc = Document::new();
                for (name, path) in parts {
                    doc.insert(name.clone(), format!("${path}"));
                }
                Bson::Document(doc)
            }
        }
    }

    fn from_bson(value: &Bson) -> Result<Self> {
        match value {
            Bson::Document(parts) => {
                let mut out = Vec::with_capacity(parts.len());
                for (name, path) in parts {
                    match Operand::from_bson(path)? {
                        Operand::Field(p) => out.push((name.clone(), p)),
                        Operand::Constant(_) => {
                            return Err(ListingsError::query(format!(
                                "compound group key '{name}' must be a field path"
                            )));
                        }
                    }
                }
                Ok(Self::Compound(out))
            }
            other => match Operand::from_bson(other)? {
                Operand::Field(path) => Ok(Self::Field(path)),
                Operand::Constant(c) => Ok(Self::Constant(c)),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub key: GroupKey,
    pub accumulators: Vec<(String, Reducer)>,
}

impl Group {
    pub fn by(field: impl Into<String>) -> Self {
        Self {
            key: GroupKey::Field(field.into()),
            accumulators: Vec::new(),
        }
    }

    pub fn all() -> Self {
        Self {
            key: GroupKey::Constant(Bson::Null),
            accumulators: Vec::new(),
        }
    }

    #[must_use]
    pub fn reduce(mut self, name: impl Into<String>, reducer: Reducer) -> Self {
        self.accumulators.push((name.into(), reducer));
        self
    }

    fn to_document(&self) -> Document {
        let mut doc = doc! { "_id": self.key.to_bson() };
        for (name, reducer) in &self.accumulators {
            doc.insert(name.clone(), reducer.to_document());
        }
        doc
    }

    fn from_document(spec: &Document) -> Result<Self> {
        let key = spec
            .get("_id")
            .ok_or_else(|| ListingsError::query("$group needs an _id"))?;
        let mut group = Self {
            key: GroupKey::from_bson(key)?,
            accumulators: Vec::new(),
        };
        for (name, value) in spec {
            if name == "_id" {
                continue;
            }
            let Bson::Document(acc) = value else {
                return Err(ListingsError::query(format!(
                    "accumulator '{name}' must be a document, got {}",
                    type_name(value)
                )));
            };
            group
                .accumulators
                .push((name.clone(), Reducer::from_document(name, acc)?));
        }
        Ok(group)
    }

    fn validate(&self) -> Result<()> {
        for (name, _) in &self.accumulators {
            if name.is_empty() || name.contains('.') || name.starts_with('$') {
                return Err(ListingsError::query(format!(
                    "'{name}' is not a valid $group output field"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(Filter),
    Group(Group),
    Sort(Vec<SortKey>),
    Skip(u64),
    Limit(u64),
    Project(Projection),
}

impl Stage {
    pub fn to_document(&self) -> Document {
        match self {
            Self::Match(filter) => doc! { "$match": filter.to_document() },
            Self::Group(group) => doc! { "$group": group.to_document() },
            Self::Sort(keys) => doc! { "$sort": sort_document(keys) },
            Self::Skip(n) => doc! { "$skip": i64::try_from(*n).unwrap_or(i64::MAX) },
            Self::Limit(n) => doc! { "$limit": i64::try_from(*n).unwrap_or(i64::MAX) },
            Self::Project(projection) => doc! { "$project": projection.to_document() },
        }
    }

    pub fn from_document(stage: &Document) -> Result<Self> {
        let mut entries = stage.iter();
        let (Some((name, spec)), None) = (entries.next(), entries.next()) else {
            return Err(ListingsError::query(
                "a pipeline stage must have exactly one field",
            ));
        };
        match (name.as_str(), spec) {
            ("$match", Bson::Document(d)) => Ok(Self::Match(Filter::from_document(d)?)),
            ("$group", Bson::Document(d)) => Ok(Self::Group(Group::from_document(d)?)),
            ("$sort", Bson::Document(d)) => Ok(Self::Sort(parse_sort(d)?)),
            ("$project", Bson::Document(d)) => Ok(Self::Project(Projection::from_document(d)?)),
            ("$skip", n) => Ok(Self::Skip(non_negative(name, n)?)),
            ("$limit", n) => Ok(Self::Limit(non_negative(name, n)?)),
            ("$match" | "$group" | "$sort" | "$project", other) => Err(ListingsError::query(
                format!("{name} expects a document, got {}", type_name(other)),
            )),
            (other, _) => Err(ListingsError::query(format!(
                "unsupported pipeline stage {other}"
            ))),
        }
    }
}

fn non_negative(stage: &str, value: &Bson) -> Result<u64> {
    let n = match value {
        Bson::Int32(n) => i64::from(*n),
        Bson::Int64(n) => *n,
        #[allow(clippy::cast_possible_truncation)]
        Bson::Double(d) if d.fract() == 0.0 => *d as i64,
        other => {
            return Err(ListingsError::query(format!(
                "{stage} expects an integer, got {}",
                type_name(other)
            )));
        }
    };
    u64::try_from(n).map_err(|_| ListingsError::query(format!("{stage} must be >= 0, got {n}")))
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    #[must_use]
    pub fn filter(self, filter: Filter) -> Self {
        self.stage(Stage::Match(filter))
    }

    #[must_use]
    pub fn group(self, group: Group) -> Self {
        self.stage(Stage::Group(group))
    }

    #[must_use]
    pub fn sort(self, keys: Vec<SortKey>) -> Self {
        self.stage(Stage::Sort(keys))
    }

    #[must_use]
    pub fn skip(self, n: u64) -> Self {
        self.stage(Stage::Skip(n))
    }

    #[must_use]
    pub fn limit(self, n: u64) -> Self {
        self.stage(Stage::Limit(n))
    }

    #[must_use]
    pub fn project(self, projection: Projection) -> Self {
        self.stage(Stage::Project(projection))
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn validate(&self) -> Result<()> {
        for (i, stage) in self.stages.iter().enumerate() {
            match stage {
                Stage::Match(filter) if i > 0 && filter.uses_text() => {
                    return Err(ListingsError::query(
                        "$text is only allowed in the first $match stage",
                    ));
                }
                Stage::Limit(0) => {
                    return Err(ListingsError::query("$limit must be positive"));
                }
                Stage::Sort(keys) if keys.is_empty() => {
                    return Err(ListingsError::query("$sort needs at least one field"));
                }
                Stage::Group(group) => group.validate()?,
                Stage::Project(projection) => {
                    if projection.is_empty() {
                        return Err(ListingsError::query("$project needs at least one field"));
                    }
                    projection.validate()?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn to_documents(&self) -> Vec<Document> {
        self.stages.iter().map(Stage::to_document).collect()
    }

    pub fn from_documents(stages: &[Document]) -> Result<Self> {
        let pipeline = Self {
            stages: stages
                .iter()
                .map(Stage::from_document)
                .collect::<Result<_>>()?,
        };
        pipeline.validate()?;
        Ok(pipeline)
    }

    /// Parses a JSON array of stages.
    pub fn from_json(text: &str) -> Result<Self> {
        let Bson::Array(items) = parse_json(text)? else {
            return Err(ListingsError::query("a pipeline must be a JSON array of stages"));
        };
        let stages = items
            .into_iter()
            .map(|item| match item {
                Bson::Document(d) => Ok(d),
                other => Err(ListingsError::query(format!(
                    "pipeline stages must be objects, got {}",
                    type_name(&other)
                ))),
            })
            .collect::<Result<Vec<_>>>()?;
        Self::from_documents(&stages)
    }
}

impl std::fmt::Display for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rendered: Vec<String> = self.to_documents().iter().map(ToString::to_string).collect();
        write!(f, "[{}]", rendered.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn avg_price_by_neighbourhood() -> Pipeline {
        Pipeline::new()
            .group(
                Group::by("neighbourhood")
                    .reduce("avg_price", Reducer::Avg(Operand::field("price")))
                    .reduce("count", Reducer::Count),
            )
            .sort(vec![SortKey::desc("avg_price")])
            .limit(10)
    }

    #[test]
    fn renders_mongo_stages() {
        assert_eq!(
            avg_price_by_neighbourhood().to_documents(),
            vec![
                doc! { "$group": {
                    "_id": "$neighbourhood",
                    "avg_price": { "$avg": "$price" },
                    "count": { "$sum": 1 },
                } },
                doc! { "$sort": { "avg_price": -1 } },
                doc! { "$limit": 10_i64 },
            ]
        );
    }

    #[test]
    fn parses_rendered_pipeline_back() {
        let original = avg_price_by_neighbourhood();
        let parsed = Pipeline::from_documents(&original.to_documents()).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn parses_json_pipeline() {
        let p = Pipeline::from_json(
            r#"[
                {"$match": {"room_type": "Private room"}},
                {"$group": {"_id": null, "total": {"$sum": "$price"}, "n": {"$count": {}}}},
                {"$project": {"_id": 0, "total": 1}}
            ]"#,
        )
        .unwrap();
        assert_eq!(p.stages().len(), 3);
        let Stage::Group(group) = &p.stages()[1] else {
            panic!("expected group");
        };
        assert_eq!(group.key, GroupKey::Constant(Bson::Null));
        assert_eq!(group.accumulators[1].1, Reducer::Count);
    }

    #[test]
    fn compound_group_key() {
        let stage = Stage::from_document(&doc! {
            "$group": { "_id": { "n": "$neighbourhood", "r": "$room_type" }, "c": { "$sum": 1 } }
        })
        .unwrap();
        let Stage::Group(group) = stage else {
            panic!("expected group");
        };
        assert_eq!(
            group.key,
            GroupKey::Compound(vec![
                ("n".into(), "neighbourhood".into()),
                ("r".into(), "room_type".into()),
            ])
        );
    }

    #[test]
    fn rejects_unknown_stages_and_operators() {
        for bad in [
            r#"[{"$lookup": {"from": "hosts"}}]"#,
            r#"[{"$group": {"_id": "$x", "s": {"$push": "$price"}}}]"#,
            r#"[{"$group": {"total": {"$sum": "$price"}}}]"#,
            r#"[{"$limit": 0}]"#,
            r#"[{"$limit": -3}]"#,
            r#"[{"$sort": {"price": 2}}]"#,
            r#"[{"$match": {}, "$limit": 1}]"#,
            r#"[{"$match": {"price": 1}}, {"$match": {"$text": {"$search": "sol"}}}]"#,
            r#"[{"$project": {"name": 1, "price": 0}}]"#,
            r#"{"$match": {}}"#,
        ] {
            let err = Pipeline::from_json(bad).unwrap_err();
            assert!(matches!(err, ListingsError::Query { .. }), "{bad}: {err}");
        }
    }

    #[test]
    fn display_lists_stages() {
        let text = Pipeline::new().skip(5).limit(5).to_string();
        assert!(text.starts_with('['));
        assert!(text.contains("$skip"));
    }
}
