use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;
use tsdq_common::{Node, Result, ShardId, TsdqError};
use tsdq_sql::Query;

use crate::physical_plan::{BaseNode, Intermediate, Leaf, PhysicalPlan, Root};

/// Active shard assignment of one database: storage node -> shard ids.
///
/// Keyed by a `BTreeMap` so plans built from it are ordered by storage
/// indicator regardless of how membership was discovered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseAssignment {
    pub name: String,
    pub nodes: BTreeMap<Node, Vec<ShardId>>,
}

impl DatabaseAssignment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: BTreeMap::new(),
        }
    }

    pub fn with_node(mut self, node: Node, shards: Vec<ShardId>) -> Self {
        self.nodes.insert(node, shards);
        self
    }

    pub fn active_shards(&self) -> BTreeSet<ShardId> {
        self.nodes.values().flatten().copied().collect()
    }
}

/// Compiles statements plus a cluster view into [`PhysicalPlan`]s.
///
/// Contracts:
/// - deterministic and side-effect free: equal inputs give equal plans;
/// - no storage node fails with [`TsdqError::NoAvailableStorageNode`];
/// - queries without `group by` stream every leaf straight to the root;
/// - grouped queries fan in through `min(S, max(1, B - 1))` intermediates,
///   picked from the lexicographically sorted broker list, non-local first.
#[derive(Debug, Clone)]
pub struct PhysicalPlanner {
    current: Node,
}

impl PhysicalPlanner {
    pub fn new(current: Node) -> Self {
        Self { current }
    }

    pub fn current(&self) -> &Node {
        &self.current
    }

    /// Plans a data query. `live_brokers` may or may not contain the local broker.
    pub fn plan_query(
        &self,
        database: &DatabaseAssignment,
        query: &Query,
        live_brokers: &[Node],
    ) -> Result<PhysicalPlan> {
        self.check_storage(database)?;
        if !query.has_group_by() {
            return self.no_group_plan(database);
        }

        let storage_count = database.nodes.len();
        let brokers: BTreeSet<&Node> = live_brokers
            .iter()
            .chain(std::iter::once(&self.current))
            .collect();
        let intermediate_count = storage_count.min(brokers.len().saturating_sub(1).max(1));

        // Non-local brokers in indicator order, then the local broker as a filler.
        let mut candidates: Vec<&Node> = brokers
            .iter()
            .copied()
            .filter(|b| **b != self.current)
            .collect();
        candidates.sort_by_key(|b| b.indicator());
        if candidates.len() < intermediate_count {
            candidates.push(&self.current);
        }
        let chosen: Vec<Node> = candidates
            .into_iter()
            .take(intermediate_count)
            .cloned()
            .collect();

        let only_self = chosen.len() == 1 && chosen[0] == self.current;
        if storage_count == 1 || only_self {
            debug!(
                database = %database.name,
                storage_count,
                broker_count = brokers.len(),
                "grouped query planned without intermediates"
            );
            return self.no_group_plan(database);
        }

        let root = self.current.indicator();
        let mut plan = PhysicalPlan::new(
            database.name.clone(),
            Root {
                indicator: root.clone(),
                num_of_task: chosen.len() as i32,
            },
        );
        for node in &chosen {
            plan.add_intermediate(Intermediate {
                base: BaseNode {
                    parent: root.clone(),
                    indicator: node.indicator(),
                },
                num_of_task: storage_count as i32,
            });
        }
        for (storage, shards) in &database.nodes {
            plan.add_leaf(Leaf {
                base: BaseNode {
                    parent: root.clone(),
                    indicator: storage.indicator(),
                },
                shard_ids: shards.clone(),
                receivers: chosen.clone(),
            });
        }
        plan.validate(&database.active_shards())?;
        Ok(plan)
    }

    /// Plans a metadata suggest: every storage node answers straight to the root.
    pub fn plan_metadata(&self, database: &DatabaseAssignment) -> Result<PhysicalPlan> {
        self.check_storage(database)?;
        self.no_group_plan(database)
    }

    fn check_storage(&self, database: &DatabaseAssignment) -> Result<()> {
        if database.nodes.is_empty() {
            return Err(TsdqError::NoAvailableStorageNode);
        }
        Ok(())
    }

    fn no_group_plan(&self, database: &DatabaseAssignment) -> Result<PhysicalPlan> {
        let root = self.current.indicator();
        let mut plan = PhysicalPlan::new(
            database.name.clone(),
            Root {
                indicator: root.clone(),
                num_of_task: database.nodes.len() as i32,
            },
        );
        for (storage, shards) in &database.nodes {
            plan.add_leaf(Leaf {
                base: BaseNode {
                    parent: root.clone(),
                    indicator: storage.indicator(),
                },
                shard_ids: shards.clone(),
                receivers: vec![self.current.clone()],
            });
        }
        plan.validate(&database.active_shards())?;
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(s: &str) -> Node {
        s.parse().expect("node")
    }

    #[test]
    fn metadata_plan_ignores_brokers() {
        let planner = PhysicalPlanner::new(node("1.1.1.3:8000"));
        let db = DatabaseAssignment::new("db")
            .with_node(node("1.1.1.1:9000"), vec![1])
            .with_node(node("1.1.1.2:9000"), vec![2]);
        let plan = planner.plan_metadata(&db).expect("plan");
        assert!(plan.intermediates.is_empty());
        assert_eq!(plan.root.num_of_task, 2);
    }

    #[test]
    fn inconsistent_assignment_fails_validation() {
        let planner = PhysicalPlanner::new(node("1.1.1.3:8000"));
        let db = DatabaseAssignment::new("db")
            .with_node(node("1.1.1.1:9000"), vec![1, 2])
            .with_node(node("1.1.1.2:9000"), vec![2, 3]);
        let err = planner
            .plan_query(&db, &Query::new("cpu"), &[])
            .expect_err("shard 2 twice");
        assert_eq!(err.kind(), tsdq_common::ErrorKind::Planning);
    }
}
