use common::token_range::TokenRange;
use num::{BigInt, ToPrimitive};
use tracing::debug;

/// Splits `range` into `split_count` contiguous sub-ranges of nearly equal
/// size. A range holding fewer tokens than requested splits is cut into
/// single-token ranges instead.
pub fn split(range: &TokenRange, split_count: usize) -> Vec<TokenRange> {
    let size = range.size();
    let requested = split_count.max(1);
    let count = if *size < BigInt::from(requested) {
        size.to_usize().unwrap_or(requested)
    } else {
        requested
    };
    if count <= 1 {
        return vec![range.clone()];
    }

    let partitioner = range.partitioner();
    let divisor = BigInt::from(count);
    let mut splits = Vec::with_capacity(count);
    let mut previous = range.start().clone();
    for i in 1..count {
        // Recomputed from the start at every step, never accumulated.
        let increment = size * BigInt::from(i) / &divisor;
        let point = partitioner.advance(range.start(), &increment);
        splits.push(range.with_bounds(previous, point.clone()));
        previous = point;
    }
    splits.push(range.with_bounds(previous, range.end().clone()));
    splits
}

/// Splits every range proportionally to its share of the ring, aiming at
/// `total_split_count` splits overall. The resulting count is approximate.
pub fn split_all(ranges: &[TokenRange], total_split_count: usize) -> Vec<TokenRange> {
    let fraction_per_split = 1.0 / total_split_count.max(1) as f64;
    let splits: Vec<TokenRange> = ranges
        .iter()
        .flat_map(|range| {
            let count = (range.fraction() / fraction_per_split)
                .round_ties_even()
                .max(1.0) as usize;
            if count == 1 {
                vec![range.clone()]
            } else {
                split(range, count)
            }
        })
        .collect();
    debug!(
        "Split {} token ranges into {} (target {}).",
        ranges.len(),
        splits.len(),
        total_split_count
    );
    splits
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::for_testing::{endpoint, uniform_token_map};
    use common::token::{Partitioner, Token};
    use std::collections::BTreeSet;
    use test_case::test_case;

    fn murmur3(start: i64, end: i64) -> TokenRange {
        TokenRange::new(
            Partitioner::Murmur3,
            Token::Murmur3(start),
            Token::Murmur3(end),
            BTreeSet::from([endpoint(1)]),
        )
    }

    fn random(start: i64, end: i64) -> TokenRange {
        TokenRange::new(
            Partitioner::Random,
            Token::Random(BigInt::from(start)),
            Token::Random(BigInt::from(end)),
            BTreeSet::from([endpoint(1)]),
        )
    }

    fn assert_reconstructs(parent: &TokenRange, parts: &[TokenRange]) {
        assert_eq!(parts.first().unwrap().start(), parent.start());
        assert_eq!(parts.last().unwrap().end(), parent.end());
        for pair in parts.windows(2) {
            assert_eq!(pair[0].end(), pair[1].start());
        }
        let total: BigInt = parts.iter().map(|r| r.size().clone()).sum();
        assert_eq!(&total, parent.size());
        for part in parts {
            assert_eq!(part.replicas(), parent.replicas());
        }
    }

    #[test_case(murmur3(0, 100), 3 ; "murmur3 simple")]
    #[test_case(murmur3(i64::MAX - 50, i64::MIN + 50), 7 ; "murmur3 wrapping")]
    #[test_case(murmur3(i64::MIN, i64::MIN), 16 ; "murmur3 full ring")]
    #[test_case(random(10, 1000), 9 ; "random simple")]
    #[test_case(random(-1, -1), 5 ; "random full ring")]
    fn split_covers_parent(range: TokenRange, count: usize) {
        let parts = split(&range, count);
        assert_eq!(parts.len(), count);
        assert_reconstructs(&range, &parts);
    }

    #[test]
    fn split_sizes_differ_by_at_most_one() {
        let range = murmur3(0, 100);
        let parts = split(&range, 3);
        let sizes: Vec<BigInt> = parts.iter().map(|r| r.size().clone()).collect();
        assert_eq!(
            sizes,
            vec![BigInt::from(33), BigInt::from(33), BigInt::from(34)]
        );
    }

    #[test]
    fn split_floor_is_one_token() {
        let range = murmur3(0, 5);
        let parts = split(&range, 10);
        assert_eq!(parts.len(), 5);
        for part in parts.iter() {
            assert_eq!(*part.size(), BigInt::from(1));
        }
        assert_reconstructs(&range, &parts);
    }

    #[test]
    fn split_of_one_returns_range_unchanged() {
        let range = murmur3(0, 5);
        assert_eq!(split(&range, 1), vec![range.clone()]);
        assert_eq!(split(&range, 0), vec![range]);
    }

    #[test]
    fn split_wraps_past_max_token() {
        let range = murmur3(i64::MAX - 1, i64::MIN + 1);
        let parts = split(&range, 3);
        assert_eq!(
            parts,
            vec![
                murmur3(i64::MAX - 1, i64::MAX),
                murmur3(i64::MAX, i64::MIN),
                murmur3(i64::MIN, i64::MIN + 1),
            ]
        );
    }

    #[test]
    fn split_all_is_proportional_to_fraction() {
        let half = murmur3(i64::MIN, 0);
        let quarter = murmur3(0, i64::MAX / 2);
        let rest = murmur3(i64::MAX / 2, i64::MIN);
        let parts = split_all(&[half.clone(), quarter, rest], 8);
        let in_half = parts.iter().filter(|r| half.contains(r.end())).count();
        assert_eq!(in_half, 4);
        assert_eq!(parts.len(), 8);
    }

    #[test]
    fn split_all_keeps_small_ranges_whole() {
        let tiny = murmur3(0, 10);
        let parts = split_all(&[tiny.clone()], 4);
        assert_eq!(parts, vec![tiny]);
    }

    #[test]
    fn split_all_covers_the_ring() {
        let map = uniform_token_map(Partitioner::Murmur3, 6, 3);
        let parts = split_all(map.ranges(), 60);
        let total: BigInt = parts.iter().map(|r| r.size().clone()).sum();
        assert_eq!(total, Partitioner::Murmur3.ring_size());
        assert_eq!(parts.len(), 60);
    }
}
