//! Physical planning for distributed statements.
//!
//! - [`physical_plan`]: the `Root -> [Intermediate] -> Leaf` tree and its invariants
//! - [`physical_planner`]: compiles a statement plus cluster view into a plan
//! - [`explain`]: text rendering for logs and tests

pub mod explain;
pub mod physical_plan;
pub mod physical_planner;

pub use explain::explain;
pub use physical_plan::{BaseNode, Intermediate, Leaf, PhysicalPlan, Root};
pub use physical_planner::{DatabaseAssignment, PhysicalPlanner};
