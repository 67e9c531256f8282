//! Segment classifier. Pure and total; signal totals are the caller's concern.

use outreach_core::types::{Segment, SignalCounts};

/// Ordered rule evaluation, first match wins. Red severity dominates the
/// orange count: a single red outranks any number of oranges.
pub fn classify(signals: &SignalCounts) -> Segment {
    if signals.red >= 2 {
        Segment::Critical
    } else if signals.red == 1 || signals.orange >= 2 {
        Segment::Urgent
    } else {
        Segment::Optimize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> impl Iterator<Item = SignalCounts> {
        (0..=8u32).flat_map(|red| {
            (0..=8u32).flat_map(move |orange| {
                (0..=4u32).flat_map(move |yellow| {
                    (0..=4u32).map(move |green| SignalCounts::new(red, orange, yellow, green))
                })
            })
        })
    }

    #[test]
    fn test_two_or_more_red_is_critical() {
        for s in grid().filter(|s| s.red >= 2) {
            assert_eq!(classify(&s), Segment::Critical, "{s:?}");
        }
    }

    #[test]
    fn test_one_red_or_two_orange_is_urgent() {
        for s in grid().filter(|s| s.red < 2 && (s.red == 1 || s.orange >= 2)) {
            assert_eq!(classify(&s), Segment::Urgent, "{s:?}");
        }
    }

    #[test]
    fn test_everything_else_is_optimize() {
        for s in grid().filter(|s| s.red == 0 && s.orange < 2) {
            assert_eq!(classify(&s), Segment::Optimize, "{s:?}");
        }
    }

    #[test]
    fn test_red_dominates_orange() {
        assert_eq!(classify(&SignalCounts::new(2, 6, 0, 0)), Segment::Critical);
        assert_eq!(classify(&SignalCounts::new(1, 0, 7, 0)), Segment::Urgent);
    }

    #[test]
    fn test_classify_is_stable() {
        let s = SignalCounts::new(0, 1, 3, 4);
        let first = classify(&s);
        for _ in 0..10 {
            assert_eq!(classify(&s), first);
        }
        assert_eq!(first, Segment::Optimize);
    }

    #[test]
    fn test_tolerates_counts_beyond_expected_total() {
        assert_eq!(
            classify(&SignalCounts::new(0, 0, u32::MAX, u32::MAX)),
            Segment::Optimize
        );
    }
}
