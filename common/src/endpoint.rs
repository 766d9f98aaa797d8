use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// A replica node. Ordering and equality are by host id first, so that
/// replica sets have a stable iteration order across runs.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host_id: String,
    pub address: SocketAddr,
}

impl Endpoint {
    pub fn new(host_id: impl Into<String>, address: SocketAddr) -> Endpoint {
        Endpoint {
            host_id: host_id.into(),
            address,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.host_id, self.address)
    }
}
