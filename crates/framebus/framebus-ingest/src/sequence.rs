/// Tracks the last delivered frame number and decides continuity.
#[derive(Debug, Default, Clone, Copy)]
pub struct SequenceTracker {
    last: Option<u32>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `frame_number`; `true` if it directly follows the previous one
    /// or is the first frame seen.
    pub fn observe(&mut self, frame_number: u32) -> bool {
        let consecutive = self
            .last
            .is_none_or(|prev| prev.wrapping_add(1) == frame_number);
        self.last = Some(frame_number);
        consecutive
    }

    pub fn last(&self) -> Option<u32> {
        self.last
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_frame_is_consecutive_then_gaps_are_not() {
        let mut t = SequenceTracker::new();
        assert!(t.observe(7));
        assert!(t.observe(8));
        assert!(!t.observe(8));
        assert!(!t.observe(3));
        assert!(t.observe(4));
        t.reset();
        assert!(t.observe(100));
    }

    #[test]
    fn counter_wrap_is_consecutive() {
        let mut t = SequenceTracker::new();
        t.observe(u32::MAX);
        assert!(t.observe(0));
    }
}
