use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("Unknown partitioner: {0}")]
    UnknownPartitioner(String),
    #[error("Invalid token '{token}' for the {partitioner} partitioner")]
    InvalidToken { partitioner: String, token: String },
    #[error("Token {token} does not belong to the {partitioner} partitioner")]
    PartitionerMismatch { partitioner: String, token: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Topology unavailable: {0}")]
    TopologyUnavailable(String),
}
