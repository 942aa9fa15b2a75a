//! Token partitioning across cluster members.
//!
//! The token space `[0, total)` is split into contiguous ranges, one per
//! member in registry order. Range assignment rounds the per-member share
//! up, reverse lookup rounds the bucket size down.

/// Token range `(start, end)`, both inclusive, owned by member `index` of `members`.
///
/// An empty cluster is treated as a single member.
pub fn calc_tokens(members: usize, total: usize, index: usize) -> (usize, usize) {
    let members = members.max(1);
    let per_member = total.div_ceil(members);
    let start = per_member * index;
    let end = (start + per_member).saturating_sub(1);
    (start, end.min(total.saturating_sub(1)))
}

/// Index of the member responsible for `token`.
///
/// Tokens past the last full bucket yield `members`, which names no member;
/// callers resolve the index against the registry and report a miss.
pub fn calc_index(token: usize, total: usize, members: usize) -> usize {
    let members = members.max(1);
    let bucket = (total / members).max(1);
    token / bucket
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calc_tokens_vectors() {
        assert_eq!(calc_tokens(7, 100, 0), (0, 14));
        assert_eq!(calc_tokens(7, 100, 4), (60, 74));
        assert_eq!(calc_tokens(7, 100, 5), (75, 89));
        assert_eq!(calc_tokens(7, 100, 6), (90, 99));
        assert_eq!(calc_tokens(1, 100, 0), (0, 99));
        assert_eq!(calc_tokens(3, 100, 1), (34, 67));
    }

    #[test]
    fn test_calc_index_vectors() {
        assert_eq!(calc_index(100, 1000, 100), 10);
        assert_eq!(calc_index(0, 100, 3), 0);
        assert_eq!(calc_index(99, 100, 3), 3);
        assert_eq!(calc_index(98, 100, 3), 2);
    }

    #[test]
    fn test_ranges_are_contiguous_and_cover_space() {
        let total = 100;
        for n in 1..=total {
            let mut next = 0;
            for i in 0..n {
                let (start, end) = calc_tokens(n, total, i);
                if start > total - 1 {
                    // Trailing members get nothing once the space is used up.
                    continue;
                }
                assert_eq!(start, next, "gap before member {i} of {n}");
                assert!(end >= start);
                next = end + 1;
            }
            assert_eq!(next, total, "space not covered for n={n}");
        }
    }

    #[test]
    fn test_empty_cluster_is_single_member() {
        assert_eq!(calc_tokens(0, 100, 0), (0, 99));
        assert_eq!(calc_index(42, 100, 0), 0);
    }

    #[test]
    fn test_calc_index_past_last_bucket() {
        // 100 / 7 rounds down to 14, so tokens 98 and 99 fall past member 6.
        assert_eq!(calc_index(97, 100, 7), 6);
        assert_eq!(calc_index(98, 100, 7), 7);
        // More members than tokens still divides by a bucket of one.
        assert_eq!(calc_index(5, 3, 10), 5);
    }
}
