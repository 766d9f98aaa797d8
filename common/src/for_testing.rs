use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bytes::Bytes;
use num::BigInt;

use crate::endpoint::Endpoint;
use crate::statement::BulkStatement;
use crate::token::{Partitioner, Token};
use crate::topology::TokenMap;

pub fn endpoint(i: u8) -> Endpoint {
    Endpoint::new(
        format!("node{}", i),
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, i)), 9042),
    )
}

/// A ring of `nodes` evenly spaced tokens where each range is owned by one
/// node and replicated to the next `replication_factor - 1` nodes.
pub fn uniform_token_map(
    partitioner: Partitioner,
    nodes: u8,
    replication_factor: u8,
) -> TokenMap {
    let ring_size = partitioner.ring_size();
    let min = partitioner.min_token();
    let ring: Vec<(Token, Vec<Endpoint>)> = (0..nodes)
        .map(|i| {
            let offset = &ring_size * BigInt::from(i) / BigInt::from(nodes);
            let token = partitioner.advance(&min, &offset);
            let replicas = (0..replication_factor)
                .map(|r| endpoint(((i + r) % nodes) + 1))
                .collect();
            (token, replicas)
        })
        .collect();
    TokenMap::from_token_ring(partitioner, ring).expect("uniform ring is valid")
}

/// A statement with an identity, used to check which statements end up in
/// which batch or result.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TestStatement {
    pub id: u32,
    pub routing_key: Option<Bytes>,
    pub routing_token: Option<Token>,
    pub size: usize,
}

impl TestStatement {
    pub fn new(id: u32) -> TestStatement {
        TestStatement {
            id,
            routing_key: None,
            routing_token: None,
            size: 1,
        }
    }

    pub fn with_routing_key(mut self, key: &'static [u8]) -> TestStatement {
        self.routing_key = Some(Bytes::from_static(key));
        self
    }

    pub fn with_routing_token(mut self, token: Token) -> TestStatement {
        self.routing_token = Some(token);
        self
    }

    pub fn with_size(mut self, size: usize) -> TestStatement {
        self.size = size;
        self
    }
}

impl BulkStatement for TestStatement {
    fn routing_token(&self) -> Option<Token> {
        self.routing_token.clone()
    }

    fn routing_key(&self) -> Option<Bytes> {
        self.routing_key.clone()
    }

    fn estimated_size_in_bytes(&self) -> usize {
        self.size
    }
}
