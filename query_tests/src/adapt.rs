//! Adapt plans: refinement, the count invariant and crash safety.

use std::collections::HashSet;

use access_method::AccessMethod;
use data_types::{PartitionId, Predicate, PredicateType, Query, Record};
use planner::{PartitionSplit, ReadStrategy};
use pretty_assertions::assert_eq;

use crate::scenarios::{DatasetScenario, DatasetSetup, TwoSkewedPartitions, UniformGrid};

fn between(attribute: usize, low: i64, high: i64) -> Query {
    Query::new(vec![
        Predicate::new(attribute, PredicateType::Geq, low),
        Predicate::new(attribute, PredicateType::Leq, high),
    ])
}

async fn run(scenario: &DatasetScenario, splits: &[PartitionSplit]) -> HashSet<Record> {
    run_on(&scenario.access, splits).await
}

async fn run_on(access: &AccessMethod, splits: &[PartitionSplit]) -> HashSet<Record> {
    let mut out = HashSet::new();
    for split in splits {
        out.extend(access.execute_split(split).await.unwrap());
    }
    out
}

/// Live partitions agree between the persisted index, the bucket store and
/// the object store, no record was gained or lost and nothing is left in
/// flight.
async fn check_consistent(scenario: &DatasetScenario) {
    let name = &scenario.scenario_name;
    let store = &scenario.access.dataset().store;
    let index = store.load_index().await.unwrap();
    index.validate().unwrap();
    assert!(index.version() >= scenario.access.index().version(), "{}", name);

    let mut leaves: Vec<_> = index.leaves().into_iter().map(|l| l.partition).collect();
    leaves.sort();
    let counts = scenario.counts().await;
    let registered: Vec<_> = counts.iter().map(|(p, _)| *p).collect();
    assert_eq!(leaves, registered, "{}", name);

    let files = store.list_partitions().await.unwrap();
    assert_eq!(leaves, files, "{}", name);

    let total: u64 = counts.iter().map(|(_, c)| c).sum();
    assert_eq!(total, scenario.records.len() as u64, "{}", name);
    assert!(store.list_journals().await.unwrap().is_empty(), "{}", name);
    assert_eq!(scenario.coordinator.held_count(), 0, "{}", name);
}

#[tokio::test]
async fn test_refine_partition_at_median() {
    for scenario in TwoSkewedPartitions.make().await {
        let name = scenario.scenario_name.clone();
        let query = between(2, 500, 600);

        let splits = scenario
            .access
            .get_partition_splits(&query, false)
            .await
            .unwrap();
        assert_eq!(splits.len(), 1, "{}", name);
        assert_eq!(splits[0].partition_ids, vec![PartitionId::new(1)], "{}", name);
        let plan = match &splits[0].iterator {
            ReadStrategy::Repartition(plan) => plan,
            other => panic!("{}: expected a repartition split, got {:?}", name, other),
        };
        let (left, right) = (plan.splits[0].left, plan.splits[0].right);

        assert_eq!(run(&scenario, &splits).await, scenario.expected(&query), "{}", name);

        // partition 1 is gone, its halves hold 45% to 55% each
        let counts = scenario.counts().await;
        assert_eq!(
            counts.iter().map(|(p, _)| *p).collect::<Vec<_>>(),
            vec![PartitionId::new(2), left, right],
            "{}",
            name
        );
        assert_eq!(counts[0].1, 1000, "{}", name);
        for (_, c) in &counts[1..] {
            assert!((1350..=1650).contains(c), "{}: {:?}", name, counts);
        }
        assert_eq!(counts[1].1 + counts[2].1, 3000, "{}", name);
        assert!(!scenario
            .access
            .dataset()
            .store
            .partition_exists(PartitionId::new(1))
            .await
            .unwrap());
        check_consistent(&scenario).await;

        // the same query now reads only the left half
        let splits = scenario
            .access
            .get_partition_splits(&query, true)
            .await
            .unwrap();
        assert_eq!(
            splits,
            vec![PartitionSplit::new(
                vec![left],
                ReadStrategy::Filter(between(0, 500, 600))
            )],
            "{}",
            name
        );
        assert_eq!(run(&scenario, &splits).await, scenario.expected(&query), "{}", name);
    }
}

#[tokio::test]
async fn test_leaf_goes_to_one_plan_only() {
    for scenario in TwoSkewedPartitions.make().await {
        let query = between(2, 500, 600);
        let first = scenario
            .access
            .get_partition_splits(&query, false)
            .await
            .unwrap();
        let second = scenario
            .access
            .get_partition_splits(&query, false)
            .await
            .unwrap();

        assert!(matches!(first[0].iterator, ReadStrategy::Repartition(_)));
        assert!(
            matches!(second[0].iterator, ReadStrategy::Filter(_)),
            "{}: {:?}",
            scenario.scenario_name,
            second
        );

        // once the first plan is gone the leaf can be planned again
        drop(first);
        let third = scenario
            .access
            .get_partition_splits(&query, false)
            .await
            .unwrap();
        assert!(matches!(third[0].iterator, ReadStrategy::Repartition(_)));
    }
}

#[tokio::test]
async fn test_repeated_adaptation_preserves_records() {
    let queries = [
        between(0, 3, 8),
        between(1, 30, 35),
        between(0, 3, 8),
        Query::new(vec![
            Predicate::new(0, PredicateType::Gt, 25),
            Predicate::new(1, PredicateType::Lt, 4),
        ]),
        between(1, 0, 2),
        Query::new(vec![Predicate::new(0, PredicateType::Eq, 17)]),
    ];

    for scenario in UniformGrid.make().await {
        let mut refined = 0;
        for query in &queries {
            let splits = scenario
                .access
                .get_partition_splits(query, false)
                .await
                .unwrap();
            refined += splits
                .iter()
                .filter(|s| matches!(s.iterator, ReadStrategy::Repartition(_)))
                .count();

            assert_eq!(
                run(&scenario, &splits).await,
                scenario.expected(query),
                "{}: {}",
                scenario.scenario_name,
                query
            );
            check_consistent(&scenario).await;
        }
        assert!(refined > 0, "{}", scenario.scenario_name);
        assert_eq!(scenario.access.index().version(), refined as u64);

        // every record is still reachable through a full scan
        let splits = scenario
            .access
            .get_partition_splits(&Query::default(), true)
            .await
            .unwrap();
        assert_eq!(run(&scenario, &splits).await.len(), 1600);
    }
}

#[tokio::test]
async fn test_two_processes_adapt_concurrently() {
    for scenario in TwoSkewedPartitions.make().await {
        let name = scenario.scenario_name.clone();
        let other = scenario.open_again().await;

        // the first two queries race for partition 1
        let queries = [
            between(2, 500, 600),
            between(2, 2000, 2100),
            between(2, 3500, 3600),
        ];
        let first = scenario
            .access
            .get_partition_splits(&queries[0], false)
            .await
            .unwrap();
        let second = other.get_partition_splits(&queries[1], false).await.unwrap();
        let third = other.get_partition_splits(&queries[2], false).await.unwrap();
        assert!(matches!(first[0].iterator, ReadStrategy::Repartition(_)), "{}", name);
        assert!(matches!(second[0].iterator, ReadStrategy::Repartition(_)), "{}", name);

        let (a, b, c) = tokio::join!(
            run(&scenario, &first),
            run_on(&other, &second),
            run_on(&other, &third)
        );
        assert_eq!(a, scenario.expected(&queries[0]), "{}", name);
        assert_eq!(b, scenario.expected(&queries[1]), "{}", name);
        assert_eq!(c, scenario.expected(&queries[2]), "{}", name);
        check_consistent(&scenario).await;

        // partition 1 was replaced exactly once
        let counts = scenario.counts().await;
        assert!(!counts.iter().any(|(p, _)| *p == PartitionId::new(1)), "{}", name);
        let index = scenario.access.dataset().store.load_index().await.unwrap();
        assert!(index.leaves().len() >= 3, "{}: {:?}", name, counts);

        // both processes still answer every query correctly
        for query in &queries {
            let splits = other.get_partition_splits(query, true).await.unwrap();
            assert_eq!(run_on(&other, &splits).await, scenario.expected(query), "{}", name);
            let splits = scenario
                .access
                .get_partition_splits(query, true)
                .await
                .unwrap();
            assert_eq!(run(&scenario, &splits).await, scenario.expected(query), "{}", name);
        }
        other.close().await.unwrap();
    }
}
