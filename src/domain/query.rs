use crate::domain::filter::Filter;
use crate::domain::pipeline::SortKey;
use crate::domain::projection::Projection;
use crate::error::{ListingsError, Result};

/// Arguments of a `find` call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FindQuery {
    pub filter: Filter,
    pub projection: Option<Projection>,
    pub sort: Vec<SortKey>,
    pub skip: u64,
    pub limit: Option<u64>,
}

impl FindQuery {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn project(mut self, projection: Projection) -> Self {
        self.projection = Some(projection);
        self
    }

    #[must_use]
    pub fn sort_by(mut self, key: SortKey) -> Self {
        self.sort.push(key);
        self
    }

    #[must_use]
    pub fn skip(mut self, n: u64) -> Self {
        self.skip = n;
        self
    }

    /// `0` means no limit.
    #[must_use]
    pub fn limit(mut self, n: u64) -> Self {
        self.limit = (n > 0).then_some(n);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(ref projection) = self.projection {
            projection.validate()?;
        }
        if let Some(key) = self.sort.iter().find(|k| k.field.is_empty()) {
            return Err(ListingsError::query(format!(
                "invalid sort field '{}'",
                key.field
            )));
        }
        Ok(())
    }
}

impl From<Filter> for FindQuery {
    fn from(filter: Filter) -> Self {
        Self::new(filter)
    }
}

impl std::fmt::Display for FindQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "find {}", self.filter)?;
        if let Some(ref p) = self.projection {
            write!(f, " projection {p}")?;
        }
        if !self.sort.is_empty() {
            write!(
                f,
                " sort {}",
                crate::domain::pipeline::sort_document(&self.sort)
            )?;
        }
        if self.skip > 0 {
            write!(f, " skip {}", self.skip)?;
        }
        if let Some(limit) = self.limit {
            write!(f, " limit {limit}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_limit_means_unbounded() {
        assert_eq!(FindQuery::all().limit(0).limit, None);
        assert_eq!(FindQuery::all().limit(5).limit, Some(5));
    }

    #[test]
    fn display_mentions_each_part() {
        let q = FindQuery::new(Filter::eq("neighbourhood", "Centro"))
            .sort_by(SortKey::asc("price"))
            .skip(2)
            .limit(3);
        let text = q.to_string();
        assert!(text.contains("Centro"));
        assert!(text.contains("sort"));
        assert!(text.contains("skip 2"));
        assert!(text.contains("limit 3"));
    }

    #[test]
    fn validate_rejects_mixed_projection() {
        let q = FindQuery::all().project(
            Projection::include(["name"])
                .with("price", crate::domain::projection::ProjectionRule::Exclude),
        );
        assert!(q.validate().is_err());
    }
}
