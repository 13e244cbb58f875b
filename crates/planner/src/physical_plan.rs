use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tsdq_common::{Node, Result, ShardId, TsdqError};

/// Execution tree `Root -> [Intermediate] -> Leaf` for one statement.
///
/// Nodes refer to each other by indicator string only; a plan never holds
/// pointers to other nodes. Plans are immutable once returned by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicalPlan {
    pub database: String,
    pub root: Root,
    #[serde(default)]
    pub intermediates: Vec<Intermediate>,
    pub leaves: Vec<Leaf>,
}

/// The broker that received the statement and emits the final event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
    pub indicator: String,
    /// Number of direct children the root receives completions from.
    pub num_of_task: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseNode {
    pub parent: String,
    pub indicator: String,
}

/// A broker aggregating one partition of grouped results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intermediate {
    pub base: BaseNode,
    /// Number of leaves streaming into this intermediate.
    pub num_of_task: i32,
}

/// A storage node executing against its local shards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leaf {
    pub base: BaseNode,
    pub shard_ids: Vec<ShardId>,
    /// Nodes this leaf streams its partial results to.
    pub receivers: Vec<Node>,
}

impl PhysicalPlan {
    pub fn new(database: impl Into<String>, root: Root) -> Self {
        Self {
            database: database.into(),
            root,
            intermediates: Vec::new(),
            leaves: Vec::new(),
        }
    }

    pub fn add_intermediate(&mut self, intermediate: Intermediate) {
        self.intermediates.push(intermediate);
    }

    pub fn add_leaf(&mut self, leaf: Leaf) {
        self.leaves.push(leaf);
    }

    pub fn find_leaf(&self, indicator: &str) -> Option<&Leaf> {
        self.leaves.iter().find(|l| l.base.indicator == indicator)
    }

    pub fn find_intermediate(&self, indicator: &str) -> Option<&Intermediate> {
        self.intermediates
            .iter()
            .find(|i| i.base.indicator == indicator)
    }

    /// All shard ids across leaves, in leaf order.
    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.leaves
            .iter()
            .flat_map(|l| l.shard_ids.iter().copied())
            .collect()
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| TsdqError::Protocol(format!("encode plan: {e}")))
    }

    pub fn from_json_bytes(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).map_err(|e| TsdqError::Protocol(format!("decode plan: {e}")))
    }

    /// Checks the structural invariants of the tree against the database's
    /// active shard set. Returns the first violation found.
    pub fn validate(&self, active_shards: &BTreeSet<ShardId>) -> Result<()> {
        if self.leaves.is_empty() {
            return Err(TsdqError::NoAvailableStorageNode);
        }
        let root = self.root.indicator.as_str();
        for intermediate in &self.intermediates {
            if intermediate.base.parent != root {
                return Err(TsdqError::Planning(format!(
                    "intermediate {} has parent {}, expected root {root}",
                    intermediate.base.indicator, intermediate.base.parent
                )));
            }
        }

        let expected_children = if self.intermediates.is_empty() {
            self.leaves.len()
        } else {
            self.intermediates.len()
        };
        if self.root.num_of_task != expected_children as i32 {
            return Err(TsdqError::Planning(format!(
                "root expects {} tasks but has {expected_children} direct children",
                self.root.num_of_task
            )));
        }

        let mut seen = BTreeSet::new();
        let mut inbound: BTreeMap<String, i32> = BTreeMap::new();
        for leaf in &self.leaves {
            let parent = leaf.base.parent.as_str();
            if parent != root && self.find_intermediate(parent).is_none() {
                return Err(TsdqError::Planning(format!(
                    "leaf {} has unknown parent {parent}",
                    leaf.base.indicator
                )));
            }
            if leaf.receivers.is_empty() {
                return Err(TsdqError::Planning(format!(
                    "leaf {} has no receivers",
                    leaf.base.indicator
                )));
            }
            for receiver in &leaf.receivers {
                let indicator = receiver.indicator();
                let known = if self.intermediates.is_empty() {
                    indicator == root
                } else {
                    self.find_intermediate(&indicator).is_some()
                };
                if !known {
                    return Err(TsdqError::Planning(format!(
                        "leaf {} streams to {indicator}, which is not part of the plan",
                        leaf.base.indicator
                    )));
                }
                *inbound.entry(indicator).or_default() += 1;
            }
            for shard in &leaf.shard_ids {
                if !seen.insert(*shard) {
                    return Err(TsdqError::Planning(format!(
                        "shard {shard} is assigned to more than one leaf"
                    )));
                }
            }
        }
        if &seen != active_shards {
            return Err(TsdqError::Planning(format!(
                "leaves cover shards {seen:?}, database has {active_shards:?}"
            )));
        }

        for intermediate in &self.intermediates {
            let got = inbound
                .get(intermediate.base.indicator.as_str())
                .copied()
                .unwrap_or(0);
            if intermediate.num_of_task != got {
                return Err(TsdqError::Planning(format!(
                    "intermediate {} expects {} tasks but {got} leaves stream to it",
                    intermediate.base.indicator, intermediate.num_of_task
                )));
            }
        }
        Ok(())
    }
}
