pub mod analytics;
pub mod filter;
pub mod geo;
pub mod index;
pub mod listing;
pub mod pipeline;
pub mod projection;
pub mod query;
pub mod schema;
pub mod value;

pub use filter::{Filter, Predicate};
pub use geo::{GeoPoint, Region};
pub use listing::{Listing, ListingId, RoomType};
pub use pipeline::{Group, GroupKey, Operand, Pipeline, Reducer, SortDirection, SortKey, Stage};
pub use projection::{Projection, ProjectionRule};
pub use query::FindQuery;
