//! Cache sizing from a memory budget.

/// Approximate in-memory size of one decoded image.
const BYTES_PER_IMAGE: f64 = 1024.0 * 1024.0;
/// Approximate in-memory size of one diff metrics record.
const BYTES_PER_DIFF_METRIC: f64 = 100.0;
const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Split a memory budget of `gigs` GiB into an image cache of `n` entries
/// and a diff metrics cache of `n²` entries.
///
/// Every image can be compared against every other, so the diff cache grows
/// with the square of the image cache. `n` is the positive root of
/// `BYTES_PER_IMAGE·n + BYTES_PER_DIFF_METRIC·n² = budget`.
///
/// ```
/// use diffcache_diffstore::cache_counts;
/// assert_eq!(cache_counts(0), (0, 0));
/// let (images, diffs) = cache_counts(1);
/// assert_eq!(diffs, images * images);
/// ```
pub fn cache_counts(gigs: u64) -> (usize, usize) {
    if gigs == 0 {
        return (0, 0);
    }
    let budget = gigs as f64 * BYTES_PER_GIB;
    let discriminant = BYTES_PER_IMAGE.mul_add(BYTES_PER_IMAGE, 4.0 * BYTES_PER_DIFF_METRIC * budget);
    let images = ((discriminant.sqrt() - BYTES_PER_IMAGE) / (2.0 * BYTES_PER_DIFF_METRIC)) as usize;
    (images, images.saturating_mul(images))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(16)]
    #[case(256)]
    fn test_counts_fill_the_budget(#[case] gigs: u64) {
        let (images, diffs) = cache_counts(gigs);
        assert!(images > 0);
        assert_eq!(diffs, images * images);
        let used = images as f64 * BYTES_PER_IMAGE + diffs as f64 * BYTES_PER_DIFF_METRIC;
        let budget = gigs as f64 * BYTES_PER_GIB;
        assert!(used <= budget);
        // One more image would overshoot.
        let next = (images + 1) as f64;
        assert!(next * BYTES_PER_IMAGE + next * next * BYTES_PER_DIFF_METRIC > budget);
    }

    #[test]
    fn test_one_gib() {
        assert_eq!(cache_counts(1).0, 939);
    }

    #[test]
    fn test_zero_budget_retains_nothing() {
        assert_eq!(cache_counts(0), (0, 0));
    }
}
