//! Filter evaluation against in-memory documents.

use std::cmp::Ordering;

use mongodb::bson::{Bson, Document};
use regex::{Regex, RegexBuilder};

use crate::domain::filter::{Filter, Predicate};
use crate::domain::geo::{GeoPoint, Region};
use crate::domain::value::{comparable, compare, get_path, values_equal};
use crate::error::{ListingsError, Result};

pub(crate) enum FieldTest {
    Eq(Bson),
    Ne(Bson),
    Cmp(Bson, fn(Ordering) -> bool),
    In(Vec<Bson>),
    Nin(Vec<Bson>),
    Regex(Regex),
    Exists(bool),
}

pub(crate) struct TextQuery {
    fields: Vec<String>,
    terms: Vec<String>,
    negated: Vec<String>,
    phrases: Vec<String>,
}

/// A filter with its regexes built once, ready to test many documents.
pub(crate) enum CompiledFilter {
    And(Vec<CompiledFilter>),
    Or(Vec<CompiledFilter>),
    Field { path: String, test: FieldTest },
    Text(TextQuery),
    Within { path: String, region: Region },
}

impl CompiledFilter {
    /// `text_fields` are the fields covered by the text index; `$text`
    /// without one is rejected like the server does.
    pub(crate) fn compile(filter: &Filter, text_fields: &[String]) -> Result<Self> {
        Ok(match filter {
            Filter::And(children) => Self::And(
                children
                    .iter()
                    .map(|c| Self::compile(c, text_fields))
                    .collect::<Result<_>>()?,
            ),
            Filter::Or(children) => Self::Or(
                children
                    .iter()
                    .map(|c| Self::compile(c, text_fields))
                    .collect::<Result<_>>()?,
            ),
            Filter::Field { path, predicate } => Self::Field {
                path: path.clone(),
                test: compile_predicate(path, predicate)?,
            },
            Filter::Text(search) => {
                if text_fields.is_empty() {
                    return Err(ListingsError::query("text index required for $text query"));
                }
                Self::Text(TextQuery::parse(search, text_fields))
            }
            Filter::GeoWithin { path, region } => Self::Within {
                path: path.clone(),
                region: region.clone(),
            },
        })
    }

    pub(crate) fn matches(&self, doc: &Document) -> bool {
        match self {
            Self::And(children) => children.iter().all(|c| c.matches(doc)),
            Self::Or(children) => children.iter().any(|c| c.matches(doc)),
            Self::Field { path, test } => test.matches(doc, path),
            Self::Text(query) => query.matches(doc),
            Self::Within { path, region } => get_path(doc, path)
                .and_then(GeoPoint::from_bson)
                .is_some_and(|p| region.contains(p)),
        }
    }
}

fn compile_predicate(path: &str, predicate: &Predicate) -> Result<FieldTest> {
    Ok(match predicate {
        Predicate::Eq(v) => FieldTest::Eq(v.clone()),
        Predicate::Ne(v) => FieldTest::Ne(v.clone()),
        Predicate::Gt(v) => FieldTest::Cmp(v.clone(), Ordering::is_gt),
        Predicate::Gte(v) => FieldTest::Cmp(v.clone(), Ordering::is_ge),
        Predicate::Lt(v) => FieldTest::Cmp(v.clone(), Ordering::is_lt),
        Predicate::Lte(v) => FieldTest::Cmp(v.clone(), Ordering::is_le),
        Predicate::In(vs) => FieldTest::In(vs.clone()),
        Predicate::Nin(vs) => FieldTest::Nin(vs.clone()),
        Predicate::Regex { pattern, options } => {
            let regex = RegexBuilder::new(pattern)
                .case_insensitive(options.contains('i'))
                .multi_line(options.contains('m'))
                .dot_matches_new_line(options.contains('s'))
                .ignore_whitespace(options.contains('x'))
                .build()
                .map_err(|e| ListingsError::query(format!("invalid regex on '{path}': {e}")))?;
            FieldTest::Regex(regex)
        }
        Predicate::Exists(b) => FieldTest::Exists(*b),
    })
}

// The value at `path` plus, for arrays, each element.
fn candidates<'a>(doc: &'a Document, path: &str) -> Vec<&'a Bson> {
    match get_path(doc, path) {
        None => Vec::new(),
        Some(whole @ Bson::Array(items)) => {
            let mut out: Vec<&Bson> = items.iter().collect();
            out.push(whole);
            out
        }
        Some(value) => vec![value],
    }
}

fn equals_any(values: &[&Bson], target: &Bson) -> bool {
    if values.is_empty() {
        return matches!(target, Bson::Null);
    }
    values.iter().any(|v| values_equal(v, target))
}

impl FieldTest {
    fn matches(&self, doc: &Document, path: &str) -> bool {
        let values = candidates(doc, path);
        match self {
            Self::Eq(target) => equals_any(&values, target),
            Self::Ne(target) => !equals_any(&values, target),
            Self::Cmp(target, accept) => values
                .iter()
                .any(|v| comparable(v, target) && accept(compare(v, target))),
            Self::In(targets) => targets.iter().any(|t| equals_any(&values, t)),
            Self::Nin(targets) => !targets.iter().any(|t| equals_any(&values, t)),
            Self::Regex(regex) => values.iter().any(|v| match v {
                Bson::String(s) => regex.is_match(s),
                _ => false,
            }),
            Self::Exists(expected) => get_path(doc, path).is_some() == *expected,
        }
    }
}

// Lowercase and strip the accents common in Spanish text.
fn fold(text: &str) -> String {
    text.chars()
        .flat_map(char::to_lowercase)
        .map(|c| match c {
            'á' | 'à' | 'ä' | 'â' => 'a',
            'é' | 'è' | 'ë' | 'ê' => 'e',
            'í' | 'ì' | 'ï' | 'î' => 'i',
            'ó' | 'ò' | 'ö' | 'ô' => 'o',
            'ú' | 'ù' | 'ü' | 'û' => 'u',
            'ñ' => 'n',
            'ç' => 'c',
            other => other,
        })
        .collect()
}

fn words(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
}

impl TextQuery {
    fn parse(search: &str, fields: &[String]) -> Self {
        let folded = fold(search);
        let mut phrases = Vec::new();
        let mut rest = String::new();
        for (i, part) in folded.split('"').enumerate() {
            if i % 2 == 1 {
                let phrase = part.trim();
                if !phrase.is_empty() {
                    phrases.push(phrase.to_string());
                }
            } else {
                rest.push(' ');
                rest.push_str(part);
            }
        }
        let mut terms = Vec::new();
        let mut negated = Vec::new();
        for token in rest.split_whitespace() {
            if let Some(neg) = token.strip_prefix('-') {
                negated.extend(words(neg).map(str::to_string));
            } else {
                terms.extend(words(token).map(str::to_string));
            }
        }
        Self {
            fields: fields.to_vec(),
            terms,
            negated,
            phrases,
        }
    }

    fn matches(&self, doc: &Document) -> bool {
        if self.terms.is_empty() && self.phrases.is_empty() {
            return false;
        }
        let mut text = String::new();
        for field in &self.fields {
            if let Some(Bson::String(s)) = get_path(doc, field) {
                text.push_str(&fold(s));
                text.push(' ');
            }
        }
        let tokens: Vec<&str> = words(&text).collect();
        if self.negated.iter().any(|n| tokens.contains(&n.as_str())) {
            return false;
        }
        if !self.phrases.iter().all(|p| text.contains(p.as_str())) {
            return false;
        }
        self.terms.is_empty() || self.terms.iter().any(|t| tokens.contains(&t.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;

    fn text_fields() -> Vec<String> {
        vec!["name".into(), "description".into()]
    }

    fn check(filter: &Filter, doc: &Document) -> bool {
        CompiledFilter::compile(filter, &text_fields())
            .unwrap()
            .matches(doc)
    }

    fn flat() -> Document {
        doc! {
            "name": "Ático luminoso en Sol",
            "description": "Terraza con vistas",
            "price": 75,
            "neighbourhood": "Centro",
            "amenities": ["Wifi", "Kitchen"],
            "location": { "type": "Point", "coordinates": [-3.7038, 40.4168] },
            "license": Bson::Null,
        }
    }

    #[test]
    fn equality_and_ranges_compare_numbers_by_value() {
        assert!(check(&Filter::eq("price", 75.0), &flat()));
        assert!(check(&Filter::lt("price", 100), &flat()));
        assert!(!check(&Filter::gt("price", 75), &flat()));
        assert!(check(&Filter::gte("price", 75_i64), &flat()));
    }

    #[test]
    fn ranges_do_not_cross_type_brackets() {
        assert!(!check(&Filter::lt("price", "100"), &flat()));
        assert!(!check(&Filter::gt("neighbourhood", 0), &flat()));
    }

    #[test]
    fn null_equality_matches_missing_and_null() {
        assert!(check(&Filter::eq("license", Bson::Null), &flat()));
        assert!(check(&Filter::eq("missing", Bson::Null), &flat()));
        assert!(!check(&Filter::eq("price", Bson::Null), &flat()));
        assert!(check(&Filter::ne("missing", 3), &flat()));
    }

    #[test]
    fn membership_and_arrays() {
        assert!(check(&Filter::is_in("neighbourhood", ["Centro", "Retiro"]), &flat()));
        assert!(!check(&Filter::not_in("neighbourhood", ["Centro"]), &flat()));
        assert!(check(&Filter::eq("amenities", "Wifi"), &flat()));
        assert!(!check(&Filter::eq("amenities", "Pool"), &flat()));
    }

    #[test]
    fn regex_and_exists() {
        assert!(check(&Filter::regex("name", "^ático", true), &flat()));
        assert!(!check(&Filter::regex("name", "^ático", false), &flat()));
        assert!(check(&Filter::exists("license", true), &flat()));
        assert!(check(&Filter::exists("reviews", false), &flat()));
    }

    #[test]
    fn text_search_folds_accents_and_honours_negation() {
        assert!(check(&Filter::text("atico"), &flat()));
        assert!(check(&Filter::text("piscina terraza"), &flat()));
        assert!(!check(&Filter::text("terraza -vistas"), &flat()));
        assert!(check(&Filter::text("\"con vistas\""), &flat()));
        assert!(!check(&Filter::text("-vistas"), &flat()));
    }

    #[test]
    fn text_without_index_is_a_query_error() {
        let result = CompiledFilter::compile(&Filter::text("sol"), &[]);
        assert!(matches!(result, Err(ListingsError::Query { .. })));
    }

    #[test]
    fn geo_within_circle() {
        let near_sol = Region::circle(GeoPoint::new(-3.7040, 40.4170), 200.0);
        assert!(check(&Filter::within("location", near_sol), &flat()));
        let retiro = Region::circle(GeoPoint::new(-3.6846, 40.4153), 200.0);
        assert!(!check(&Filter::within("location", retiro), &flat()));
    }

    #[test]
    fn logical_combinators() {
        let f = Filter::or(vec![Filter::eq("price", 1), Filter::eq("neighbourhood", "Centro")]);
        assert!(check(&f, &flat()));
        let f = Filter::eq("price", 75).and(Filter::eq("neighbourhood", "Retiro"));
        assert!(!check(&f, &flat()));
        assert!(check(&Filter::all(), &flat()));
    }
}
