//! Access plans: coverage, disjointness and relevance.

use std::collections::HashSet;

use data_types::{PartitionId, Predicate, PredicateType, Query, Record};
use planner::{PartitionSplit, ReadStrategy};
use pretty_assertions::assert_eq;

use crate::scenarios::{DatasetScenario, DatasetSetup, TwoSkewedPartitions, UniformGrid};

fn range(attribute: usize, low: i64, high: i64) -> Vec<Predicate> {
    vec![
        Predicate::new(attribute, PredicateType::Geq, low),
        Predicate::new(attribute, PredicateType::Leq, high),
    ]
}

/// Runs every split of `splits` and checks no partition is read twice.
async fn run(scenario: &DatasetScenario, splits: &[PartitionSplit]) -> HashSet<Record> {
    let mut seen = HashSet::new();
    let mut out = HashSet::new();
    for split in splits {
        for p in &split.partition_ids {
            assert!(
                seen.insert(*p),
                "{}: partition {} in two splits",
                scenario.scenario_name,
                p
            );
        }
        out.extend(scenario.access.execute_split(split).await.unwrap());
    }
    out
}

#[tokio::test]
async fn test_query_inside_one_partition() {
    for scenario in TwoSkewedPartitions.make().await {
        let query = Query::new(range(2, 500, 600));
        let splits = scenario
            .access
            .get_partition_splits(&query, true)
            .await
            .unwrap();

        assert_eq!(
            splits,
            vec![PartitionSplit::new(
                vec![PartitionId::new(1)],
                ReadStrategy::Filter(Query::new(range(0, 500, 600)))
            )],
            "{}",
            scenario.scenario_name
        );
        assert_eq!(run(&scenario, &splits).await, scenario.expected(&query));
    }
}

#[tokio::test]
async fn test_full_scan_groups_partitions() {
    for scenario in TwoSkewedPartitions.make().await {
        let splits = scenario
            .access
            .get_partition_splits(&Query::default(), true)
            .await
            .unwrap();

        // 4000 records fit one split
        assert_eq!(
            splits,
            vec![PartitionSplit::new(
                vec![PartitionId::new(1), PartitionId::new(2)],
                ReadStrategy::Scan
            )],
            "{}",
            scenario.scenario_name
        );
        assert_eq!(run(&scenario, &splits).await.len(), 4000);
    }
}

fn grid_queries() -> Vec<Query> {
    let mut queries = vec![
        Query::default(),
        Query::new(range(0, 0, 19)),
        Query::new(range(1, 5, 30)),
        Query::new(vec![Predicate::new(0, PredicateType::Eq, 9)]),
        Query::new(vec![Predicate::new(1, PredicateType::Gt, 39)]),
        Query::new(vec![
            Predicate::new(0, PredicateType::Lt, 10),
            Predicate::new(1, PredicateType::Geq, 20),
        ]),
    ];
    for x in (0..40).step_by(7) {
        for y in (0..40).step_by(11) {
            let mut predicates = range(0, x, x + 5);
            predicates.extend(range(1, y, y + 3));
            queries.push(Query::new(predicates));
        }
    }
    queries
}

#[tokio::test]
async fn test_access_plans_cover_exactly() {
    for scenario in UniformGrid.make().await {
        assert_eq!(scenario.access.index().leaves().len(), 8);
        for query in grid_queries() {
            let splits = scenario
                .access
                .get_partition_splits(&query, true)
                .await
                .unwrap();
            assert_eq!(
                run(&scenario, &splits).await,
                scenario.expected(&query),
                "{}: {}",
                scenario.scenario_name,
                query
            );
        }
    }
}

#[tokio::test]
async fn test_is_relevant_never_misses() {
    for scenario in UniformGrid.make().await {
        let store = &scenario.access.dataset().store;
        for leaf in scenario.access.index().leaves() {
            let records = store.read_partition(leaf.partition).await.unwrap();
            for query in grid_queries() {
                for predicate in &query.predicates {
                    let matching = records
                        .iter()
                        .any(|r| Query::new(vec![predicate.clone()]).matches(r.values()));
                    if matching {
                        assert!(
                            scenario.access.is_relevant(leaf.partition, predicate),
                            "{}: {} {}",
                            scenario.scenario_name,
                            leaf.partition,
                            predicate
                        );
                    }
                }
            }
        }
    }
}
