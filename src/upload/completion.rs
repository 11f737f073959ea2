use std::collections::BTreeSet;

/// Decides whether a session holds every chunk it declared.
#[derive(Debug, Default, Copy, Clone)]
pub struct CompletionDetector;

impl CompletionDetector {
    /// Returns `true` iff `received` is exactly `{0, …, expected_total - 1}`.
    ///
    /// Comparing counts alone is not enough: a stray index outside of the range
    /// would make up for a missing one.
    pub fn is_complete(received: &BTreeSet<u32>, expected_total: u32) -> bool {
        if expected_total == 0 || received.len() != expected_total as usize {
            return false;
        }

        // A sorted set of `n` distinct values starting at 0 and ending at n-1 has no holes.
        received.first() == Some(&0) && received.last() == Some(&(expected_total - 1))
    }

    /// Lists the indices still missing from `received`.
    pub fn missing(received: &BTreeSet<u32>, expected_total: u32) -> Vec<u32> {
        (0..expected_total)
            .filter(|index| !received.contains(index))
            .collect()
    }
}
