//! Storage-engine interfaces consumed by the query substrate.
//!
//! - [`engine`]: the narrow traits executors call (`get_shard`, `suggest_tag_values`,
//!   `get_grouping_context`, `collect_tag_values`, ...)
//! - [`series`]: series/field data model shared by scans, leaves and mergers
//! - [`memory`]: an in-memory engine backing tests and the demo storage node

pub mod engine;
pub mod memory;
pub mod series;

pub use engine::*;
pub use memory::{MemoryDatabase, MemoryEngine, Point};
pub use series::*;
