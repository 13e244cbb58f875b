use crate::physical_plan::PhysicalPlan;

/// Render a physical plan as human-readable multiline text.
pub fn explain(plan: &PhysicalPlan) -> String {
    let mut s = String::new();
    s.push_str(&format!(
        "Root {} db={} tasks={}\n",
        plan.root.indicator, plan.database, plan.root.num_of_task
    ));
    for intermediate in &plan.intermediates {
        s.push_str(&format!(
            "  Intermediate {} tasks={}\n",
            intermediate.base.indicator, intermediate.num_of_task
        ));
    }
    let pad = if plan.intermediates.is_empty() {
        "  "
    } else {
        "    "
    };
    for leaf in &plan.leaves {
        let receivers: Vec<String> = leaf.receivers.iter().map(|r| r.indicator()).collect();
        s.push_str(&format!(
            "{pad}Leaf {} shards={:?} receivers=[{}]\n",
            leaf.base.indicator,
            leaf.shard_ids,
            receivers.join(", ")
        ));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::explain;
    use crate::physical_plan::{BaseNode, Leaf, PhysicalPlan, Root};
    use tsdq_common::Node;

    #[test]
    fn renders_tree() {
        let mut plan = PhysicalPlan::new(
            "db",
            Root {
                indicator: "1.1.1.3:8000".to_string(),
                num_of_task: 1,
            },
        );
        plan.add_leaf(Leaf {
            base: BaseNode {
                parent: "1.1.1.3:8000".to_string(),
                indicator: "1.1.1.1:9000".to_string(),
            },
            shard_ids: vec![1, 2],
            receivers: vec![Node::new("1.1.1.3", 8000)],
        });
        let text = explain(&plan);
        assert!(text.starts_with("Root 1.1.1.3:8000 db=db tasks=1\n"));
        assert!(text.contains("  Leaf 1.1.1.1:9000 shards=[1, 2] receivers=[1.1.1.3:8000]"));
    }
}
