//! Load-balancing scheduler tests driven through simulated workers

mod common;

use common::{Cluster, index_of, scheduler, scoped_items};
use std::collections::HashSet;
use std::time::Duration;
use testfan_core::DistMode;

const LOAD_MODES: [DistMode; 6] = [
    DistMode::Load,
    DistMode::LoadScope,
    DistMode::LoadFile,
    DistMode::LoadGroup,
    DistMode::LoadScopeShuffled,
    DistMode::SingleCollect,
];

fn abc() -> Vec<String> {
    vec!["a".to_string(), "b".to_string(), "c".to_string()]
}

#[test]
fn test_two_workers_share_three_items() {
    let _ = tracing_subscriber::fmt::try_init();

    let mut cluster = Cluster::new(scheduler(DistMode::Load, 2));
    cluster.start(&["w1", "w2"], &abc());

    // Nobody starves while work is left
    assert!(!cluster.worker("w1").pending.is_empty());
    assert!(!cluster.worker("w2").pending.is_empty());
    assert_eq!(
        cluster.worker("w1").pending.len() + cluster.worker("w2").pending.len(),
        3
    );

    cluster.run();
    assert_eq!(cluster.completed(), vec![0, 1, 2]);
    assert!(cluster.scheduler.all_work_finished());
}

#[test]
fn test_crashed_worker_items_move_to_survivor() {
    let _ = tracing_subscriber::fmt::try_init();

    let items: Vec<String> = ["a", "b", "x", "y", "c", "z1", "z2", "z3"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let mut cluster = Cluster::new(scheduler(DistMode::Load, 2));
    cluster.start(&["w1", "w2"], &items);
    assert_eq!(
        cluster.worker("w1").pending,
        [index_of(&items, "a"), index_of(&items, "b")]
    );

    // w1 finishes a and is refilled with c, then dies while running b
    cluster.complete("w1", Duration::from_millis(1));
    assert_eq!(
        cluster.worker("w1").pending,
        [index_of(&items, "b"), index_of(&items, "c")]
    );
    assert_eq!(cluster.crash("w1").as_deref(), Some("b"));

    cluster.run();
    let c = index_of(&items, "c");
    assert!(cluster.worker("w2").completed.contains(&c));

    let b = index_of(&items, "b");
    let expected: Vec<usize> = (0..items.len()).filter(|i| *i != b).collect();
    assert_eq!(cluster.completed(), expected);
    assert_eq!(cluster.crashed, vec!["b".to_string()]);
}

#[test]
fn test_no_item_lost_or_duplicated() {
    let _ = tracing_subscriber::fmt::try_init();

    let items = scoped_items(&[
        ("tests/test_api.py::TestUsers", 9),
        ("tests/test_api.py::TestGroups", 4),
        ("tests/test_db.py::TestSchema", 13),
        ("tests/test_db.py", 6),
        ("tests/test_cli.py", 21),
    ]);
    for mode in LOAD_MODES {
        let mut cluster = Cluster::new(scheduler(mode, 3));
        cluster.start(&["gw0", "gw1", "gw2"], &items);

        cluster.run_with(|cluster| {
            let sent: Vec<usize> = cluster
                .workers
                .iter()
                .flat_map(|w| w.record.sent())
                .collect();
            let unique: HashSet<usize> = sent.iter().copied().collect();
            assert_eq!(sent.len(), unique.len(), "{} sent an item twice", mode);
        });

        assert_eq!(
            cluster.completed(),
            (0..items.len()).collect::<Vec<_>>(),
            "mode {}",
            mode
        );
        let sent: usize = cluster.workers.iter().map(|w| w.record.sent().len()).sum();
        assert_eq!(sent, items.len());
    }
}

#[test]
fn test_groups_never_split() {
    let items = scoped_items(&[("a.py::A", 5), ("a.py::B", 3), ("b.py", 7), ("c.py", 2)]);
    for mode in [DistMode::LoadScope, DistMode::LoadScopeShuffled] {
        let mut cluster = Cluster::new(scheduler(mode, 2));
        cluster.start(&["gw0", "gw1"], &items);
        cluster.run();

        for worker in &cluster.workers {
            for batch in worker.record.batches() {
                let scopes: HashSet<&str> = batch
                    .iter()
                    .map(|i| testfan_core::grouping::scope_of(&items[*i]))
                    .collect();
                // A batch holds whole scopes only
                for scope in scopes {
                    let expected = items
                        .iter()
                        .filter(|id| testfan_core::grouping::scope_of(id) == scope)
                        .count();
                    let got = batch
                        .iter()
                        .filter(|i| testfan_core::grouping::scope_of(&items[**i]) == scope)
                        .count();
                    assert_eq!(got, expected, "{} split {}", mode, scope);
                }
            }
        }
    }
}

#[test]
fn test_collection_stays_complete() {
    let mut cluster = Cluster::new(scheduler(DistMode::Load, 2));
    cluster.start(&["w1", "w2"], &abc());
    assert!(cluster.scheduler.is_collection_complete());

    // A late worker with a different collection changes nothing
    cluster.join("w3");
    let mismatches = cluster
        .scheduler
        .add_worker_collection("w3", vec!["a".to_string(), "d".to_string()])
        .unwrap();
    assert_eq!(mismatches.len(), 1);
    assert!(mismatches[0].diff.contains("+d"));
    assert!(cluster.scheduler.is_collection_complete());
    assert_eq!(cluster.scheduler.collection(), Some(abc().as_slice()));

    assert_eq!(cluster.crash("w1").as_deref(), Some("a"));
    assert!(cluster.scheduler.is_collection_complete());
    assert!(cluster.scheduler.has_pending_work());
    assert!(cluster.worker("w3").record.sent().is_empty());
}
