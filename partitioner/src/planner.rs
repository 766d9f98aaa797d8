use common::config::PartitionerConfig;
use common::token::Partitioner;
use common::topology::TopologyProvider;
use tracing::{info, instrument, warn};

use crate::clusterer::{RangeGroup, TokenRangeClusterer};
use crate::error::Error;
use crate::ring::check_ring;
use crate::splitter::split_all;

/// The read work for a full table scan.
#[derive(Clone, Debug)]
pub struct ScanPlan {
    pub partitioner: Partitioner,
    pub groups: Vec<RangeGroup>,
}

impl ScanPlan {
    pub fn range_count(&self) -> usize {
        self.groups.iter().map(|g| g.ranges().len()).sum()
    }
}

pub struct ScanPlanner {
    split_count: usize,
    clusterer: TokenRangeClusterer,
}

impl ScanPlanner {
    pub fn new(config: &PartitionerConfig) -> ScanPlanner {
        ScanPlanner {
            split_count: config.split_count.unwrap_or_else(default_split_count),
            clusterer: TokenRangeClusterer::new(config.max_groups_per_replica),
        }
    }

    pub fn split_count(&self) -> usize {
        self.split_count
    }

    #[instrument(skip_all, fields(split_count = self.split_count))]
    pub async fn plan<P: TopologyProvider>(&self, provider: &P) -> Result<ScanPlan, Error> {
        let token_map = provider.token_map().await?;
        let partitioner = token_map.partitioner();
        // A partially known ring still gets scanned, just not completely.
        if let Err(e) = check_ring(partitioner, token_map.ranges()) {
            warn!("Token ring reported by the cluster is incomplete: {}", e);
        }
        let splits = split_all(token_map.ranges(), self.split_count);
        let groups = self.clusterer.cluster(splits);
        let plan = ScanPlan {
            partitioner,
            groups,
        };
        info!(
            "Planned scan of {} token ranges in {} groups.",
            plan.range_count(),
            plan.groups.len()
        );
        Ok(plan)
    }
}

fn default_split_count() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    8 * cores
}
