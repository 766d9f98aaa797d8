use common::token::Partitioner;
use common::token_range::TokenRange;
use num::BigInt;

use crate::error::Error;

/// Verifies that `ranges` cover the whole ring exactly once.
pub fn check_ring(partitioner: Partitioner, ranges: &[TokenRange]) -> Result<(), Error> {
    for range in ranges {
        partitioner.check_token(range.start())?;
        partitioner.check_token(range.end())?;
    }
    let mut sorted: Vec<&TokenRange> = ranges.iter().collect();
    sorted.sort_by(|a, b| a.start().cmp(b.start()));

    for (i, current) in sorted.iter().enumerate() {
        let next = sorted[(i + 1) % sorted.len()];
        if current.end() == next.start() {
            continue;
        }
        let to_end = partitioner.distance(current.start(), current.end());
        let to_next = partitioner.distance(current.start(), next.start());
        let end = current.end().clone();
        let next_start = next.start().clone();
        return if to_end < to_next {
            Err(Error::RingGap { end, next_start })
        } else {
            Err(Error::RingOverlap { end, next_start })
        };
    }

    let actual: BigInt = ranges.iter().map(|r| r.size().clone()).sum();
    let expected = partitioner.ring_size();
    if actual != expected {
        return Err(Error::RingSizeMismatch { expected, actual });
    }
    Ok(())
}
