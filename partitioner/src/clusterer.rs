use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use common::endpoint::Endpoint;
use common::token_range::TokenRange;
use num::{BigInt, Zero};
use tracing::debug;

/// A unit of scan work: ranges owned by one primary replica, to be read by a
/// single concurrent task.
#[derive(Clone, Debug, PartialEq)]
pub struct RangeGroup {
    primary: Option<Endpoint>,
    ranges: Vec<TokenRange>,
}

impl RangeGroup {
    /// The replica owning every range of the group, or `None` for ranges
    /// without replica information.
    pub fn primary(&self) -> Option<&Endpoint> {
        self.primary.as_ref()
    }

    pub fn ranges(&self) -> &[TokenRange] {
        &self.ranges
    }

    pub fn into_ranges(self) -> Vec<TokenRange> {
        self.ranges
    }

    pub fn fraction(&self) -> f64 {
        self.ranges.iter().map(TokenRange::fraction).sum()
    }
}

/// Groups ranges by owning replica and caps how many groups each replica
/// gets, so scan parallelism is bounded per replica rather than per range.
#[derive(Clone, Debug)]
pub struct TokenRangeClusterer {
    max_groups_per_replica: usize,
}

impl TokenRangeClusterer {
    pub fn new(max_groups_per_replica: usize) -> TokenRangeClusterer {
        TokenRangeClusterer {
            max_groups_per_replica: max_groups_per_replica.max(1),
        }
    }

    pub fn cluster(&self, ranges: Vec<TokenRange>) -> Vec<RangeGroup> {
        let input_len = ranges.len();
        let mut index: HashMap<Option<Endpoint>, usize> = HashMap::new();
        let mut by_primary: Vec<(Option<Endpoint>, Vec<TokenRange>)> = Vec::new();
        for range in ranges {
            let primary = range.primary().cloned();
            let i = *index.entry(primary.clone()).or_insert_with(|| {
                by_primary.push((primary, Vec::new()));
                by_primary.len() - 1
            });
            by_primary[i].1.push(range);
        }

        let mut groups = Vec::new();
        for (primary, ranges) in by_primary {
            groups.extend(self.chunk(primary, ranges));
        }
        debug!(
            "Clustered {} token ranges into {} groups.",
            input_len,
            groups.len()
        );
        groups
    }

    /// Spreads one replica's ranges over at most `max_groups_per_replica`
    /// groups, always handing the next largest range to the least loaded
    /// group.
    fn chunk(&self, primary: Option<Endpoint>, mut ranges: Vec<TokenRange>) -> Vec<RangeGroup> {
        let group_count = self.max_groups_per_replica.min(ranges.len());
        ranges.sort_by(|a, b| b.size().cmp(a.size()).then_with(|| a.start().cmp(b.start())));

        let mut buckets: Vec<Vec<TokenRange>> = vec![Vec::new(); group_count];
        let mut heap = BinaryHeap::new();
        for i in 0..group_count {
            heap.push(Reverse((BigInt::zero(), i)));
        }
        for range in ranges {
            let Some(Reverse((load, i))) = heap.pop() else {
                break;
            };
            let load = load + range.size();
            buckets[i].push(range);
            heap.push(Reverse((load, i)));
        }

        buckets
            .into_iter()
            .filter(|bucket| !bucket.is_empty())
            .map(|mut bucket| {
                bucket.sort_by(|a, b| a.start().cmp(b.start()));
                RangeGroup {
                    primary: primary.clone(),
                    ranges: bucket,
                }
            })
            .collect()
    }
}
