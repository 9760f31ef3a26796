//! Catalog store: relational persistence and the record types it serves.

pub mod migrations;
pub(crate) mod store;
mod types;

pub use store::{Catalog, CatalogError, IngestCommit, Result};
pub use types::{
    CategorizedTags, DeltaOp, ExtendedCategory, ImageRecord, ImageRelation, Rating, RawMetadata,
    RelationSource, RelationType, TagCategory, TagDelta, TagOrigin, TagRecord,
};
