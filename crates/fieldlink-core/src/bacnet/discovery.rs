// ── Discovery cursor ──
//
// Walks the configured instance range in fixed batches, wrapping to the
// start in the step that reaches the end of the range.

use crate::controller::Sweep;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryCursor {
    start: u32,
    end: u32,
    batch: u32,
    offset: u32,
}

impl DiscoveryCursor {
    /// Cursor over instances `start..end` in batches of `batch`.
    pub fn new(start: u32, end: u32, batch: u32) -> Self {
        Self {
            start,
            end: end.max(start),
            batch: batch.max(1),
            offset: start,
        }
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Next batch of instance ids, and whether the sweep finished with it.
    pub fn next_batch(&mut self) -> (std::ops::Range<u32>, Sweep) {
        let first = self.offset;
        let last = first.saturating_add(self.batch).min(self.end);
        if last >= self.end {
            self.offset = self.start;
            (first..last, Sweep::Complete)
        } else {
            self.offset = last;
            (first..last, Sweep::Continue)
        }
    }

    pub fn reset(&mut self) {
        self.offset = self.start;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_of_25_in_batches_of_10_wraps_on_third_step() {
        let mut cursor = DiscoveryCursor::new(0, 25, 10);
        assert_eq!(cursor.next_batch(), (0..10, Sweep::Continue));
        assert_eq!(cursor.next_batch(), (10..20, Sweep::Continue));
        assert_eq!(cursor.next_batch(), (20..25, Sweep::Complete));
        assert_eq!(cursor.offset(), 0);
        assert_eq!(cursor.next_batch(), (0..10, Sweep::Continue));
    }

    #[test]
    fn exact_multiple_completes_on_last_full_batch() {
        let mut cursor = DiscoveryCursor::new(100, 120, 10);
        assert_eq!(cursor.next_batch(), (100..110, Sweep::Continue));
        assert_eq!(cursor.next_batch(), (110..120, Sweep::Complete));
        assert_eq!(cursor.offset(), 100);
    }

    #[test]
    fn empty_range_completes_immediately() {
        let mut cursor = DiscoveryCursor::new(5, 5, 10);
        let (ids, sweep) = cursor.next_batch();
        assert!(ids.is_empty());
        assert_eq!(sweep, Sweep::Complete);
    }
}
