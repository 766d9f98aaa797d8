use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

use num::{BigInt, ToPrimitive};
use once_cell::sync::OnceCell;

use crate::endpoint::Endpoint;
use crate::token::{Partitioner, Token};

/// A contiguous span of the ring, exclusive start and inclusive end, along
/// with the replicas owning it. `start == end` denotes the whole ring.
#[derive(Clone, Debug)]
pub struct TokenRange {
    partitioner: Partitioner,
    start: Token,
    end: Token,
    replicas: BTreeSet<Endpoint>,
    primary: Option<Endpoint>,
    size: OnceCell<BigInt>,
}

impl TokenRange {
    pub fn new(
        partitioner: Partitioner,
        start: Token,
        end: Token,
        replicas: BTreeSet<Endpoint>,
    ) -> TokenRange {
        TokenRange {
            partitioner,
            start,
            end,
            replicas,
            primary: None,
            size: OnceCell::new(),
        }
    }

    /// Names the node owning the range's end token, the first of its
    /// replicas in ring order.
    pub fn with_primary(mut self, primary: Endpoint) -> TokenRange {
        self.primary = Some(primary);
        self
    }

    /// Same replicas and primary, different bounds.
    pub fn with_bounds(&self, start: Token, end: Token) -> TokenRange {
        TokenRange {
            primary: self.primary.clone(),
            ..TokenRange::new(self.partitioner, start, end, self.replicas.clone())
        }
    }

    pub fn partitioner(&self) -> Partitioner {
        self.partitioner
    }

    pub fn start(&self) -> &Token {
        &self.start
    }

    pub fn end(&self) -> &Token {
        &self.end
    }

    pub fn replicas(&self) -> &BTreeSet<Endpoint> {
        &self.replicas
    }

    pub fn primary(&self) -> Option<&Endpoint> {
        self.primary.as_ref()
    }

    pub fn size(&self) -> &BigInt {
        self.size
            .get_or_init(|| self.partitioner.distance(&self.start, &self.end))
    }

    /// Share of the whole ring covered by this range, in `(0, 1]`.
    pub fn fraction(&self) -> f64 {
        let size = self.size().to_f64().unwrap_or_default();
        let ring = self.partitioner.ring_size().to_f64().unwrap_or(f64::MAX);
        size / ring
    }

    pub fn contains(&self, token: &Token) -> bool {
        if self.start == self.end {
            return true;
        }
        if self.start < self.end {
            *token > self.start && *token <= self.end
        } else {
            *token > self.start || *token <= self.end
        }
    }

    pub fn is_wrapped_around(&self) -> bool {
        self.start > self.end && self.end != self.partitioner.min_token()
    }

    /// Splits a wrapping range at the ring minimum, so each piece can be
    /// expressed as a plain `token > start AND token <= end` restriction.
    pub fn unwrap(&self) -> Vec<TokenRange> {
        if !self.is_wrapped_around() {
            return vec![self.clone()];
        }
        let min = self.partitioner.min_token();
        vec![
            self.with_bounds(self.start.clone(), min.clone()),
            self.with_bounds(min, self.end.clone()),
        ]
    }
}

impl PartialEq for TokenRange {
    fn eq(&self, other: &Self) -> bool {
        self.partitioner == other.partitioner
            && self.start == other.start
            && self.end == other.end
            && self.replicas == other.replicas
            && self.primary == other.primary
    }
}

impl Eq for TokenRange {}

impl Hash for TokenRange {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.partitioner.hash(state);
        self.start.hash(state);
        self.end.hash(state);
        self.replicas.hash(state);
        self.primary.hash(state);
    }
}

impl fmt::Display for TokenRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "]{},{}]", self.start, self.end)
    }
}
