use std::collections::HashSet;

use common::config::PartitionerConfig;
use common::error::Error as CommonError;
use common::for_testing::uniform_token_map;
use common::token::Partitioner;
use common::topology::{StaticTopology, TokenMap, TopologyProvider};
use num::BigInt;
use partitioner::error::Error;
use partitioner::planner::ScanPlanner;
use partitioner::ring::check_ring;
use test_case::test_case;

struct UnavailableTopology;

impl TopologyProvider for UnavailableTopology {
    async fn token_map(&self) -> Result<TokenMap, CommonError> {
        Err(CommonError::TopologyUnavailable("no contact points".to_string()))
    }
}

#[test_case(Partitioner::Murmur3 ; "murmur3")]
#[test_case(Partitioner::Random ; "random")]
#[tokio::test]
async fn plan_covers_whole_ring(partitioner: Partitioner) {
    let provider = StaticTopology::new(uniform_token_map(partitioner, 6, 3));
    let planner = ScanPlanner::new(&PartitionerConfig {
        split_count: Some(96),
        max_groups_per_replica: 2,
    });
    let plan = planner.plan(&provider).await.unwrap();

    assert_eq!(plan.partitioner, partitioner);
    assert_eq!(plan.range_count(), 96);
    // Six owners, two groups each.
    assert_eq!(plan.groups.len(), 12);
    let owners: HashSet<_> = plan.groups.iter().filter_map(|g| g.primary()).collect();
    assert_eq!(owners.len(), 6);

    let ranges: Vec<_> = plan
        .groups
        .iter()
        .flat_map(|g| g.ranges().iter().cloned())
        .collect();
    assert_eq!(check_ring(partitioner, &ranges), Ok(()));
    let unique: HashSet<_> = ranges.iter().collect();
    assert_eq!(unique.len(), ranges.len());

    let total: BigInt = ranges.iter().map(|r| r.size().clone()).sum();
    assert_eq!(total, partitioner.ring_size());
    let fraction: f64 = plan.groups.iter().map(|g| g.fraction()).sum();
    assert!((fraction - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn default_split_count_scales_with_cores() {
    let planner = ScanPlanner::new(&PartitionerConfig::default());
    assert!(planner.split_count() >= 8);
    assert_eq!(planner.split_count() % 8, 0);
}

#[tokio::test]
async fn topology_failure_is_surfaced() {
    let planner = ScanPlanner::new(&PartitionerConfig::default());
    let result = planner.plan(&UnavailableTopology).await;
    assert!(matches!(
        result,
        Err(Error::Topology(CommonError::TopologyUnavailable(_)))
    ));
}
