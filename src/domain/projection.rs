use mongodb::bson::{Bson, Document};

use crate::domain::schema::fields;
use crate::domain::value::{get_path, remove_path, set_path, type_name};
use crate::error::{ListingsError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionRule {
    Include,
    Exclude,
    /// `{out: "$source.path"}`; only valid in `$project` stages.
    Rename(String),
}

/// Ordered field selection, as in `find(..).projection(..)` or `$project`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Projection {
    rules: Vec<(String, ProjectionRule)>,
}

impl Projection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            rules: fields
                .into_iter()
                .map(|f| (f.into(), ProjectionRule::Include))
                .collect(),
        }
    }

    pub fn exclude<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            rules: fields
                .into_iter()
                .map(|f| (f.into(), ProjectionRule::Exclude))
                .collect(),
        }
    }

    #[must_use]
    pub fn with(mut self, field: impl Into<String>, rule: ProjectionRule) -> Self {
        self.rules.push((field.into(), rule));
        self
    }

    #[must_use]
    pub fn without_id(self) -> Self {
        self.with(fields::ID, ProjectionRule::Exclude)
    }

    pub fn rules(&self) -> &[(String, ProjectionRule)] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn is_inclusion(&self) -> bool {
        let only_id = self.rules.iter().all(|(field, _)| field == fields::ID);
        self.rules.iter().any(|(field, rule)| {
            (only_id || field != fields::ID) && !matches!(rule, ProjectionRule::Exclude)
        })
    }

    /// Rejects projections that mix inclusion and exclusion outside `_id`.
    pub fn validate(&self) -> Result<()> {
        let mut includes = false;
        let mut excludes = false;
        for (field, rule) in &self.rules {
            if field.is_empty() || field.starts_with('$') {
                return Err(ListingsError::query(format!(
                    "'{field}' is not a valid projection field"
                )));
            }
            if field == fields::ID {
                if matches!(rule, ProjectionRule::Rename(_)) {
                    includes = true;
                }
                continue;
            }
            match rule {
                ProjectionRule::Exclude => excludes = true,
                ProjectionRule::Include | ProjectionRule::Rename(_) => includes = true,
            }
        }
        if includes && excludes {
            return Err(ListingsError::query(
                "projection cannot mix inclusion and exclusion",
            ));
        }
        Ok(())
    }

    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        for (field, rule) in &self.rules {
            let value = match rule {
                ProjectionRule::Include => Bson::Int32(1),
                ProjectionRule::Exclude => Bson::Int32(0),
                ProjectionRule::Rename(source) => Bson::String(format!("${source}")),
            };
            doc.insert(field.clone(), value);
        }
        doc
    }

    pub fn from_document(doc: &Document) -> Result<Self> {
        let mut rules = Vec::with_capacity(doc.len());
        for (field, value) in doc {
            let rule = match value {
                Bson::Boolean(false) | Bson::Int32(0) | Bson::Int64(0) => ProjectionRule::Exclude,
                Bson::Double(v) if *v == 0.0 => ProjectionRule::Exclude,
                Bson::Boolean(true) | Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => {
                    ProjectionRule::Include
                }
                Bson::String(s) if s.len() > 1 && s.starts_with('$') => {
                    ProjectionRule::Rename(s[1..].to_string())
                }
                other => {
                    return Err(ListingsError::query(format!(
                        "unsupported projection value for '{field}': {}",
                        type_name(other)
                    )));
                }
            };
            rules.push((field.clone(), rule));
        }
        let projection = Self { rules };
        projection.validate()?;
        Ok(projection)
    }

    /// Applies the projection to one document. `_id` is kept unless excluded.
    pub fn apply(&self, doc: &Document) -> Document {
        if self.rules.is_empty() {
            return doc.clone();
        }
        let id_excluded = self
            .rules
            .iter()
            .any(|(f, r)| f == fields::ID && *r == ProjectionRule::Exclude);
        if self.is_inclusion() {
            let mut out = Document::new();
            if !id_excluded && let Some(id) = doc.get(fields::ID) {
                out.insert(fields::ID, id.clone());
            }
            for (field, rule) in &self.rules {
                let source = match rule {
                    ProjectionRule::Include => field.as_str(),
                    ProjectionRule::Rename(source) => source.as_str(),
                    ProjectionRule::Exclude => continue,
                };
                if let Some(value) = get_path(doc, source) {
                    set_path(&mut out, field, value.clone());
                }
            }
            out
        } else {
            let mut out = doc.clone();
            for (field, rule) in &self.rules {
                if *rule == ProjectionRule::Exclude {
                    remove_path(&mut out, field);
                }
            }
            out
        }
    }
}

impl std::fmt::Display for Projection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_document())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::{doc, oid::ObjectId};
    use pretty_assertions::assert_eq;

    fn listing() -> Document {
        doc! {
            "_id": ObjectId::parse_str("65a1f0c2e4b0a1b2c3d4e5f6").unwrap(),
            "name": "Test Flat",
            "price": 75,
            "host": { "name": "Ana", "since": 2019 },
        }
    }

    #[test]
    fn inclusion_keeps_id_by_default() {
        let out = Projection::include(["name"]).apply(&listing());
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["_id", "name"]);
    }

    #[test]
    fn inclusion_without_id() {
        let out = Projection::include(["name", "price"]).without_id().apply(&listing());
        assert_eq!(out, doc! { "name": "Test Flat", "price": 75 });
    }

    #[test]
    fn exclusion_removes_nested_fields() {
        let out = Projection::exclude(["host.since", "_id"]).apply(&listing());
        assert_eq!(
            out,
            doc! { "name": "Test Flat", "price": 75, "host": { "name": "Ana" } }
        );
    }

    #[test]
    fn rename_copies_from_source_path() {
        let p = Projection::from_document(&doc! { "_id": 0, "host_name": "$host.name" }).unwrap();
        assert_eq!(p.apply(&listing()), doc! { "host_name": "Ana" });
    }

    #[test]
    fn mixing_inclusion_and_exclusion_is_rejected() {
        let err = Projection::from_document(&doc! { "name": 1, "price": 0 }).unwrap_err();
        assert!(matches!(err, ListingsError::Query { .. }));
        Projection::from_document(&doc! { "name": 1, "_id": 0 }).unwrap();
    }

    #[test]
    fn unsupported_values_are_rejected() {
        assert!(Projection::from_document(&doc! { "name": { "$slice": 1 } }).is_err());
        assert!(Projection::from_document(&doc! { "name": "plain" }).is_err());
    }

    #[test]
    fn id_only_projection_keeps_just_the_id() {
        let out = Projection::include(["_id"]).apply(&listing());
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["_id"]);
    }

    #[test]
    fn to_document_renders_rules() {
        let p = Projection::include(["name"]).without_id();
        assert_eq!(p.to_document(), doc! { "name": 1, "_id": 0 });
    }
}
