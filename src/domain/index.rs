use mongodb::bson::{Bson, Document};

use crate::domain::schema::fields;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Ascending,
    Sphere2d,
    Text,
}

impl IndexKind {
    fn suffix(self) -> &'static str {
        match self {
            Self::Ascending => "1",
            Self::Sphere2d => "2dsphere",
            Self::Text => "text",
        }
    }

    fn key_value(self) -> Bson {
        match self {
            Self::Ascending => Bson::Int32(1),
            Self::Sphere2d => Bson::String("2dsphere".into()),
            Self::Text => Bson::String("text".into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: String,
    pub keys: Vec<(String, IndexKind)>,
}

impl IndexSpec {
    /// Builds a spec named the way the server names indexes by default
    /// (`neighbourhood_1_price_1`).
    pub fn new(keys: &[(&str, IndexKind)]) -> Self {
        let name = keys
            .iter()
            .map(|(field, kind)| format!("{field}_{}", kind.suffix()))
            .collect::<Vec<_>>()
            .join("_");
        Self {
            name,
            keys: keys.iter().map(|(f, k)| ((*f).to_string(), *k)).collect(),
        }
    }

    pub fn keys_document(&self) -> Document {
        let mut doc = Document::new();
        for (field, kind) in &self.keys {
            doc.insert(field.clone(), kind.key_value());
        }
        doc
    }

    pub fn is_text(&self) -> bool {
        self.keys.iter().any(|(_, k)| *k == IndexKind::Text)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(|(f, _)| f.as_str())
    }
}

impl std::fmt::Display for IndexSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.name, self.keys_document())
    }
}

/// The index set installed on the listings collection.
pub fn listing_indexes() -> Vec<IndexSpec> {
    use IndexKind::{Ascending, Sphere2d, Text};
    vec![
        IndexSpec::new(&[(fields::PRICE, Ascending)]),
        IndexSpec::new(&[(fields::NEIGHBOURHOOD, Ascending)]),
        IndexSpec::new(&[(fields::ROOM_TYPE, Ascending)]),
        IndexSpec::new(&[(fields::NEIGHBOURHOOD, Ascending), (fields::PRICE, Ascending)]),
        IndexSpec::new(&[(fields::LOCATION, Sphere2d)]),
        IndexSpec::new(&[(fields::NAME, Text), (fields::DESCRIPTION, Text)]),
    ]
}
