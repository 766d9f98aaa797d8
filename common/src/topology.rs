use std::collections::BTreeSet;

use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::token::{Partitioner, Token};
use crate::token_range::TokenRange;

/// Resolves the replicas responsible for a token or a routing key.
pub trait ReplicaLookup: Send + Sync {
    fn replicas_for_token(&self, token: &Token) -> Option<&BTreeSet<Endpoint>>;

    fn token_of_key(&self, key: &[u8]) -> Option<Token>;
}

/// Supplies the cluster's token ranges. Queried once at the start of a run.
pub trait TopologyProvider: Send + Sync + 'static {
    fn token_map(&self) -> impl std::future::Future<Output = Result<TokenMap, Error>> + Send;
}

/// Snapshot of the token ring: the active partitioner and every range
/// with its owning replicas, ordered by end token.
#[derive(Clone, Debug)]
pub struct TokenMap {
    partitioner: Partitioner,
    ranges: Vec<TokenRange>,
}

impl TokenMap {
    pub fn new(partitioner: Partitioner, mut ranges: Vec<TokenRange>) -> Result<TokenMap, Error> {
        for range in ranges.iter() {
            partitioner.check_token(range.start())?;
            partitioner.check_token(range.end())?;
        }
        ranges.sort_by(|a, b| a.end().cmp(b.end()));
        Ok(TokenMap {
            partitioner,
            ranges,
        })
    }

    /// Builds the map the way a cluster describes its ring: each token is
    /// the inclusive end of a range starting at the previous token. Replicas
    /// are listed in placement order, the token's owner first.
    pub fn from_token_ring(
        partitioner: Partitioner,
        mut ring: Vec<(Token, Vec<Endpoint>)>,
    ) -> Result<TokenMap, Error> {
        if ring.is_empty() {
            return Err(Error::TopologyUnavailable("empty token ring".to_string()));
        }
        ring.sort_by(|a, b| a.0.cmp(&b.0));
        let mut ranges = Vec::with_capacity(ring.len());
        let mut previous = ring[ring.len() - 1].0.clone();
        for (token, replicas) in ring {
            let owner = replicas.first().cloned();
            let range = TokenRange::new(
                partitioner,
                previous,
                token.clone(),
                replicas.into_iter().collect(),
            );
            ranges.push(match owner {
                Some(owner) => range.with_primary(owner),
                None => range,
            });
            previous = token;
        }
        debug!("Built token map with {} ranges.", ranges.len());
        TokenMap::new(partitioner, ranges)
    }

    pub fn partitioner(&self) -> Partitioner {
        self.partitioner
    }

    pub fn ranges(&self) -> &[TokenRange] {
        &self.ranges
    }

    pub fn into_ranges(self) -> Vec<TokenRange> {
        self.ranges
    }

    pub fn range_for_token(&self, token: &Token) -> Option<&TokenRange> {
        if self.ranges.is_empty() {
            return None;
        }
        let idx = self.ranges.partition_point(|r| r.end() < token);
        let range = if idx == self.ranges.len() {
            &self.ranges[0]
        } else {
            &self.ranges[idx]
        };
        if range.contains(token) {
            Some(range)
        } else {
            None
        }
    }
}

impl ReplicaLookup for TokenMap {
    fn replicas_for_token(&self, token: &Token) -> Option<&BTreeSet<Endpoint>> {
        self.range_for_token(token)
            .map(TokenRange::replicas)
            .filter(|replicas| !replicas.is_empty())
    }

    fn token_of_key(&self, key: &[u8]) -> Option<Token> {
        self.partitioner.token_of_key(key)
    }
}

/// A provider over a fixed, already known ring.
pub struct StaticTopology {
    token_map: TokenMap,
}

impl StaticTopology {
    pub fn new(token_map: TokenMap) -> StaticTopology {
        StaticTopology { token_map }
    }
}

impl TopologyProvider for StaticTopology {
    async fn token_map(&self) -> Result<TokenMap, Error> {
        Ok(self.token_map.clone())
    }
}
