use std::fmt;
use std::str::FromStr;

use num::{BigInt, One, ToPrimitive, Zero};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A position on the token ring. The variant fixes the partitioner the token
/// was produced by; arithmetic between tokens always goes through the
/// owning [`Partitioner`] so that wraparound follows that scheme.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Token {
    Murmur3(i64),
    Random(BigInt),
}

impl Token {
    pub fn value(&self) -> BigInt {
        match self {
            Token::Murmur3(v) => BigInt::from(*v),
            Token::Random(v) => v.clone(),
        }
    }

    pub fn partitioner(&self) -> Partitioner {
        match self {
            Token::Murmur3(_) => Partitioner::Murmur3,
            Token::Random(_) => Partitioner::Random,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Murmur3(v) => write!(f, "{}", v),
            Token::Random(v) => write!(f, "{}", v),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, strum::Display)]
pub enum Partitioner {
    Murmur3,
    Random,
}

impl Partitioner {
    pub fn min_token(&self) -> Token {
        match self {
            Partitioner::Murmur3 => Token::Murmur3(i64::MIN),
            Partitioner::Random => Token::Random(BigInt::from(-1)),
        }
    }

    pub fn max_token(&self) -> Token {
        match self {
            Partitioner::Murmur3 => Token::Murmur3(i64::MAX),
            Partitioner::Random => Token::Random(BigInt::one() << 127),
        }
    }

    /// Modulus of the ring arithmetic. Murmur3 tokens wrap like a signed
    /// 64-bit integer. Random tokens live in `]-1, 2^127]`, so their ring
    /// is `max - min` tokens long and the minimum coincides with the maximum.
    pub fn ring_size(&self) -> BigInt {
        match self {
            Partitioner::Murmur3 => BigInt::one() << 64,
            Partitioner::Random => self.max_token().value() - self.min_token().value(),
        }
    }

    /// Forward distance from `start` to `end` around the ring. Equal tokens
    /// denote the whole ring.
    pub fn distance(&self, start: &Token, end: &Token) -> BigInt {
        let distance = end.value() - start.value();
        if distance <= BigInt::zero() {
            distance + self.ring_size()
        } else {
            distance
        }
    }

    /// Moves `start` forward by `increment` tokens, wrapping around the ring
    /// the way the server's own token arithmetic does.
    pub fn advance(&self, start: &Token, increment: &BigInt) -> Token {
        match self {
            Partitioner::Murmur3 => {
                let start = start.value().to_i128().unwrap_or_default();
                let increment = increment.to_i128().unwrap_or_default();
                // Truncating to 64 bits is the intended two's complement wrap.
                Token::Murmur3((start + increment) as i64)
            }
            Partitioner::Random => {
                let mut value = start.value() + increment;
                if value > self.max_token().value() {
                    value -= self.ring_size();
                }
                Token::Random(value)
            }
        }
    }

    pub fn parse_token(&self, token: &str) -> Result<Token, Error> {
        let invalid = || Error::InvalidToken {
            partitioner: self.to_string(),
            token: token.to_string(),
        };
        match self {
            Partitioner::Murmur3 => token
                .trim()
                .parse::<i64>()
                .map(Token::Murmur3)
                .map_err(|_| invalid()),
            Partitioner::Random => {
                let value = token.trim().parse::<BigInt>().map_err(|_| invalid())?;
                if value < self.min_token().value() || value > self.max_token().value() {
                    return Err(invalid());
                }
                Ok(Token::Random(value))
            }
        }
    }

    pub fn check_token(&self, token: &Token) -> Result<(), Error> {
        if token.partitioner() == *self {
            Ok(())
        } else {
            Err(Error::PartitionerMismatch {
                partitioner: self.to_string(),
                token: token.to_string(),
            })
        }
    }

    /// Computes the token a routing key hashes to. Only supported for
    /// Murmur3; callers fall back to key-based grouping otherwise.
    pub fn token_of_key(&self, key: &[u8]) -> Option<Token> {
        match self {
            Partitioner::Murmur3 => {
                let hash = murmur3_x64_128_h1(key);
                let hash = if hash == i64::MIN { i64::MAX } else { hash };
                Some(Token::Murmur3(hash))
            }
            Partitioner::Random => None,
        }
    }
}

impl FromStr for Partitioner {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let short = s.rsplit('.').next().unwrap_or(s).to_ascii_lowercase();
        match short.as_str() {
            "murmur3" | "murmur3partitioner" => Ok(Partitioner::Murmur3),
            "random" | "randompartitioner" => Ok(Partitioner::Random),
            _ => Err(Error::UnknownPartitioner(s.to_string())),
        }
    }
}

const C1: u64 = 0x87c3_7b91_1142_53d5;
const C2: u64 = 0x4cf5_ad43_2745_937f;

fn fmix(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

fn read_block(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .take(8)
        .enumerate()
        .fold(0u64, |acc, (i, b)| acc | (u64::from(*b) << (8 * i)))
}

// Tail bytes are sign-extended before shifting. The server hashes keys this
// way, so tokens only line up with the cluster if we do the same.
fn signed_tail_byte(b: u8, shift: usize) -> u64 {
    ((b as i8) as i64 as u64) << shift
}

/// First 64 bits of the server's Murmur3 x64/128 variant, seed 0.
fn murmur3_x64_128_h1(data: &[u8]) -> i64 {
    let len = data.len();
    let nblocks = len / 16;
    let mut h1: u64 = 0;
    let mut h2: u64 = 0;

    for block in data.chunks_exact(16) {
        let mut k1 = read_block(&block[..8]);
        let mut k2 = read_block(&block[8..]);

        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1
            .rotate_left(27)
            .wrapping_add(h2)
            .wrapping_mul(5)
            .wrapping_add(0x52dc_e729);

        k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
        h2 ^= k2;
        h2 = h2
            .rotate_left(31)
            .wrapping_add(h1)
            .wrapping_mul(5)
            .wrapping_add(0x3849_5ab5);
    }

    let tail = &data[nblocks * 16..];
    let mut k1: u64 = 0;
    let mut k2: u64 = 0;
    for i in (8..tail.len()).rev() {
        k2 ^= signed_tail_byte(tail[i], (i - 8) * 8);
    }
    if tail.len() > 8 {
        k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
        h2 ^= k2;
    }
    for i in (0..tail.len().min(8)).rev() {
        k1 ^= signed_tail_byte(tail[i], i * 8);
    }
    if !tail.is_empty() {
        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= len as u64;
    h2 ^= len as u64;
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    h1 = fmix(h1);
    h2 = fmix(h2);
    h1 = h1.wrapping_add(h2);
    h1 as i64
}
