use std::collections::BTreeSet;

use bytes::Bytes;
use common::endpoint::Endpoint;
use common::token::Token;

/// What statements are batched by. Two statements may share a batch only
/// if their keys are equal.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum GroupingKey {
    Token(Token),
    RoutingKey(Bytes),
    ReplicaSet(BTreeSet<Endpoint>),
    /// Shared by every statement when batching without routing affinity.
    Global,
}
