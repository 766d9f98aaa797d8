use common::token::Token;
use num::BigInt;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum Error {
    #[error("Gap in token ring: a range ends at {end} but the next one starts at {next_start}")]
    RingGap { end: Token, next_start: Token },
    #[error("Overlap in token ring: a range ends at {end} but the next one starts at {next_start}")]
    RingOverlap { end: Token, next_start: Token },
    #[error("Token ranges cover {actual} tokens but the ring has {expected}")]
    RingSizeMismatch { expected: BigInt, actual: BigInt },
    #[error(transparent)]
    Topology(#[from] common::error::Error),
}
