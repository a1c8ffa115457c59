//! Admission control through the consideration graph: once value has flowed
//! a->b->c, a consideration c->a would close a cycle and is rejected.

mod common;

use common::{start_node, test_key};

use focalpoint::consideration::{now_unix, Consideration};
use focalpoint::consideration_queue::ConsiderationQueue as _;
use focalpoint::error::{ProcessError, ValidationError};
use focalpoint::graph::graph_key;

#[tokio::test]
async fn cyclic_considerations_are_rejected_at_admission() {
    let (sk_a, pk_a) = test_key(1);
    let (sk_b, pk_b) = test_key(2);
    let (sk_c, pk_c) = test_key(3);
    let node = start_node(pk_a, now_unix() - 5_000).await;
    let genesis = node.genesis.clone();
    node.processor
        .process_view(node.genesis_id, genesis, "localhost")
        .await
        .unwrap();

    // give pk_a two spendable units
    node.extend(101, pk_a).await;
    assert_eq!(node.imbalance(&pk_a), 2);

    // a -> b twice, then b -> c; each confirmed view lets the indexer fold
    // the transfer edges into the graph
    let (_, tip_height) = node.tip();
    let mut first = Consideration::new(Some(pk_a), pk_b, 0, 0, tip_height + 1, "");
    first.sign(&sk_a).unwrap();
    let mut second = Consideration::new(Some(pk_a), pk_b, 0, 0, tip_height + 1, "");
    second.sign(&sk_a).unwrap();
    let (tip_id, _) = node.tip();
    let (id, view) = node.build_next(&tip_id, vec![first, second], pk_a);
    node.processor.process_view(id, view, "localhost").await.unwrap();
    assert_eq!(node.imbalance(&pk_b), 2);

    let (_, tip_height) = node.tip();
    let mut onward = Consideration::new(Some(pk_b), pk_c, 0, 0, tip_height + 1, "");
    onward.sign(&sk_b).unwrap();
    let (tip_id, _) = node.tip();
    let (id, view) = node.build_next(&tip_id, vec![onward], pk_b);
    node.processor.process_view(id, view, "localhost").await.unwrap();
    assert_eq!(node.imbalance(&pk_c), 1);

    // the graph now reaches pk_b from pk_a, and pk_c from both
    {
        let graph = node.graph.read();
        assert!(graph.is_parent_descendant(
            &graph_key(Some(&pk_a)),
            &graph_key(Some(&pk_c)),
        ));
        assert!(!graph.is_parent_descendant(
            &graph_key(Some(&pk_c)),
            &graph_key(Some(&pk_a)),
        ));
    }

    // c -> a would make the recipient an ancestor of the sender
    let (_, tip_height) = node.tip();
    let mut cycle = Consideration::new(Some(pk_c), pk_a, 0, 0, tip_height + 1, "");
    cycle.sign(&sk_c).unwrap();
    let cycle_id = cycle.id().unwrap();
    let err = node
        .processor
        .process_consideration(cycle_id, cycle, "localhost")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProcessError::Validation(ValidationError::AncestorCycle(id)) if id == cycle_id
    ));
    assert!(!node.cn_queue.exists(&cycle_id));

    // the rejected consideration still consumed pk_c's cached imbalance;
    // the overlay resets when the next view connects
    node.extend(1, pk_a).await;

    // c -> b closes a shorter cycle the same way: pk_c is reachable from
    // pk_b through the earlier transfer
    let (_, tip_height) = node.tip();
    let mut shorter = Consideration::new(Some(pk_c), pk_b, 0, 0, tip_height + 1, "");
    shorter.sign(&sk_c).unwrap();
    let err = node
        .processor
        .process_consideration(shorter.id().unwrap(), shorter, "localhost")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProcessError::Validation(ValidationError::AncestorCycle(_))
    ));
    node.extend(1, pk_a).await;

    // a transfer to an unrelated key is admitted
    let (_, pk_d) = test_key(4);
    let (_, tip_height) = node.tip();
    let mut unrelated = Consideration::new(Some(pk_c), pk_d, 0, 0, tip_height + 1, "");
    unrelated.sign(&sk_c).unwrap();
    node.processor
        .process_consideration(unrelated.id().unwrap(), unrelated, "localhost")
        .await
        .expect("no cycle");

    node.shutdown().await;
}
