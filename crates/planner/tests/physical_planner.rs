use std::collections::BTreeSet;

use tsdq_common::{Node, ShardId, TsdqError};
use tsdq_planner::{explain, DatabaseAssignment, PhysicalPlanner};
use tsdq_sql::Query;

fn node(s: &str) -> Node {
    s.parse().expect("node")
}

fn grouped_query() -> Query {
    let mut q = Query::new("cpu");
    q.group_by = vec!["host".to_string()];
    q
}

fn storage(n: usize) -> DatabaseAssignment {
    let mut db = DatabaseAssignment::new("db");
    for i in 0..n {
        let base = (i * 3) as ShardId;
        db = db.with_node(
            node(&format!("1.1.1.{}:9000", i + 1)),
            vec![base + 1, base + 2, base + 3],
        );
    }
    db
}

fn brokers(n: usize) -> Vec<Node> {
    (0..n).map(|i| node(&format!("1.1.2.{}:8000", i + 1))).collect()
}

#[test]
fn no_storage_nodes_fails() {
    let planner = PhysicalPlanner::new(node("1.1.1.3:8000"));
    let err = planner
        .plan_query(&DatabaseAssignment::new("db"), &Query::new("cpu"), &[])
        .expect_err("no storage");
    assert!(matches!(err, TsdqError::NoAvailableStorageNode));
}

#[test]
fn no_group_plan_streams_leaves_to_root() {
    let me = node("1.1.1.3:8000");
    let planner = PhysicalPlanner::new(me.clone());
    let db = DatabaseAssignment::new("db")
        .with_node(node("1.1.1.1:9000"), vec![1, 2, 4])
        .with_node(node("1.1.1.2:9000"), vec![3, 5, 6]);
    let plan = planner
        .plan_query(&db, &Query::new("cpu"), &[])
        .expect("plan");

    assert!(plan.intermediates.is_empty());
    assert_eq!(plan.leaves.len(), 2);
    assert_eq!(plan.root.num_of_task, 2);
    assert_eq!(plan.root.indicator, "1.1.1.3:8000");
    for leaf in &plan.leaves {
        assert_eq!(leaf.receivers, vec![me.clone()]);
        assert_eq!(leaf.base.parent, "1.1.1.3:8000");
    }
    assert_eq!(plan.find_leaf("1.1.1.1:9000").expect("leaf").shard_ids, vec![1, 2, 4]);
}

#[test]
fn odd_group_plan_uses_three_intermediates() {
    let me = node("1.1.2.1:8000");
    let planner = PhysicalPlanner::new(me.clone());
    let db = storage(5);
    let plan = planner
        .plan_query(&db, &grouped_query(), &brokers(4))
        .expect("plan");

    assert_eq!(plan.intermediates.len(), 3);
    assert_eq!(plan.root.num_of_task, 3);
    for intermediate in &plan.intermediates {
        assert_eq!(intermediate.num_of_task, 5);
        assert_ne!(intermediate.base.indicator, me.indicator());
    }
    let chosen: Vec<Node> = plan
        .intermediates
        .iter()
        .map(|i| node(&i.base.indicator))
        .collect();
    assert_eq!(
        chosen,
        vec![node("1.1.2.2:8000"), node("1.1.2.3:8000"), node("1.1.2.4:8000")]
    );
    for leaf in &plan.leaves {
        assert_eq!(leaf.receivers.len(), 3);
        assert_eq!(leaf.receivers, chosen);
    }
    let union: BTreeSet<ShardId> = plan.shard_ids().into_iter().collect();
    assert_eq!(union, db.active_shards());
}

#[test]
fn even_group_plan_uses_two_intermediates() {
    let planner = PhysicalPlanner::new(node("1.1.2.1:8000"));
    let plan = planner
        .plan_query(&storage(2), &grouped_query(), &brokers(3))
        .expect("plan");
    assert_eq!(plan.intermediates.len(), 2);
    assert_eq!(plan.root.num_of_task, 2);
    assert!(plan.leaves.iter().all(|l| l.receivers.len() == 2));
}

#[test]
fn fewer_storage_nodes_than_brokers_caps_intermediates() {
    let planner = PhysicalPlanner::new(node("1.1.2.1:8000"));
    let plan = planner
        .plan_query(&storage(2), &grouped_query(), &brokers(4))
        .expect("plan");
    assert_eq!(plan.intermediates.len(), 2);
}

#[test]
fn single_storage_node_needs_no_intermediates() {
    let planner = PhysicalPlanner::new(node("1.1.2.1:8000"));
    for broker_count in [0, 1, 4] {
        let plan = planner
            .plan_query(&storage(1), &grouped_query(), &brokers(broker_count))
            .expect("plan");
        assert!(plan.intermediates.is_empty(), "brokers={broker_count}");
        assert_eq!(plan.root.num_of_task, 1);
    }
}

#[test]
fn lone_broker_plans_without_intermediates() {
    let me = node("1.1.2.1:8000");
    let planner = PhysicalPlanner::new(me.clone());
    let plan = planner
        .plan_query(&storage(3), &grouped_query(), &[me.clone()])
        .expect("plan");
    assert!(plan.intermediates.is_empty());
    assert_eq!(plan.root.num_of_task, 3);
    assert!(plan.leaves.iter().all(|l| l.receivers == vec![me.clone()]));
}

#[test]
fn plans_are_deterministic_under_membership_order() {
    let planner = PhysicalPlanner::new(node("1.1.2.3:8000"));
    let mut shuffled = brokers(5);
    shuffled.reverse();
    let a = planner
        .plan_query(&storage(4), &grouped_query(), &brokers(5))
        .expect("plan");
    let b = planner
        .plan_query(&storage(4), &grouped_query(), &shuffled)
        .expect("plan");
    assert_eq!(a, b);
    assert_eq!(explain(&a), explain(&b));
}

#[test]
fn grouped_plan_invariants_hold_across_cluster_shapes() {
    for s in 1..=6 {
        for b in 0..=6 {
            let planner = PhysicalPlanner::new(node("1.1.2.1:8000"));
            let db = storage(s);
            let plan = planner
                .plan_query(&db, &grouped_query(), &brokers(b))
                .expect("plan");

            let union: BTreeSet<ShardId> = plan.shard_ids().into_iter().collect();
            assert_eq!(union, db.active_shards(), "s={s} b={b}");
            assert_eq!(plan.shard_ids().len(), union.len(), "s={s} b={b}");

            if plan.intermediates.is_empty() {
                assert_eq!(plan.root.num_of_task as usize, s, "s={s} b={b}");
                continue;
            }
            assert_eq!(
                plan.root.num_of_task as usize,
                plan.intermediates.len(),
                "s={s} b={b}"
            );
            let expected = b.saturating_sub(1).max(1).min(s);
            assert_eq!(plan.intermediates.len(), expected, "s={s} b={b}");
            let receivers: Vec<String> = plan
                .intermediates
                .iter()
                .map(|i| i.base.indicator.clone())
                .collect();
            for leaf in &plan.leaves {
                let got: Vec<String> = leaf.receivers.iter().map(|r| r.indicator()).collect();
                assert_eq!(got, receivers, "s={s} b={b}");
            }
        }
    }
}
