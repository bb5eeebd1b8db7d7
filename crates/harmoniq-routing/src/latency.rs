use serde::{Deserialize, Serialize};

/// Lowest latency any device may be configured for.
pub const ABSOLUTE_MIN_LATENCY: u64 = 500;
/// Highest latency any device may be configured for.
pub const ABSOLUTE_MAX_LATENCY: u64 = 10 * 1_000_000;
pub const DEFAULT_FIXED_LATENCY: u64 = 250_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyRange {
    pub min: u64,
    pub max: u64,
}

impl Default for LatencyRange {
    fn default() -> Self {
        Self {
            min: ABSOLUTE_MIN_LATENCY,
            max: ABSOLUTE_MAX_LATENCY,
        }
    }
}

impl LatencyRange {
    /// Builds a range from user input where 0 means "no limit".
    pub fn bounded(min: u64, max: u64) -> Self {
        let min = if min == 0 { ABSOLUTE_MIN_LATENCY } else { min };
        let max = if max == 0 { ABSOLUTE_MAX_LATENCY } else { max };
        let min = min.clamp(ABSOLUTE_MIN_LATENCY, ABSOLUTE_MAX_LATENCY);
        let max = max.clamp(ABSOLUTE_MIN_LATENCY, ABSOLUTE_MAX_LATENCY);
        Self {
            min: min.min(max),
            max,
        }
    }

    pub fn clamp(&self, usec: u64) -> u64 {
        usec.clamp(self.min, self.max)
    }
}

pub fn clamp_fixed_latency(usec: u64) -> u64 {
    usec.clamp(ABSOLUTE_MIN_LATENCY, ABSOLUTE_MAX_LATENCY)
}

/// Effective request of a set of streams: the smallest request, clamped to the
/// range. `None` when no stream asked for anything.
pub fn combine_requests<I>(requests: I, range: &LatencyRange) -> Option<u64>
where
    I: IntoIterator<Item = Option<u64>>,
{
    requests
        .into_iter()
        .flatten()
        .min()
        .map(|usec| range.clamp(usec))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_means_unbounded() {
        let range = LatencyRange::bounded(0, 0);
        assert_eq!(range, LatencyRange::default());
        let tight = LatencyRange::bounded(100, 20_000_000);
        assert_eq!(tight.min, ABSOLUTE_MIN_LATENCY);
        assert_eq!(tight.max, ABSOLUTE_MAX_LATENCY);
    }

    #[test]
    fn minimum_request_wins() {
        let range = LatencyRange::bounded(10_000, 200_000);
        assert_eq!(combine_requests([None, Some(50_000), Some(30_000)], &range), Some(30_000));
        assert_eq!(combine_requests([Some(1_000)], &range), Some(10_000));
        assert_eq!(combine_requests([None, None], &range), None);
    }
}
