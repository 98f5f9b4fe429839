//! Step-wise progress milestones

/// Tracks the next percentage boundary a transfer has to cross
#[derive(Debug, Clone)]
pub struct Milestones {
    total: u64,
    step: u8,
    next: u8,
}

impl Milestones {
    pub fn new(total: u64, step: u8) -> Self {
        let step = step.clamp(1, 100);
        Self {
            total,
            step,
            next: step,
        }
    }

    /// Record `done` bytes; returns the boundary crossed, if any.
    ///
    /// When a single update jumps several boundaries only the highest one
    /// is returned.
    pub fn advance(&mut self, done: u64) -> Option<u8> {
        if self.next > 100 {
            return None;
        }

        let percent = if self.total == 0 {
            100
        } else {
            (done.min(self.total).saturating_mul(100) / self.total) as u8
        };

        if percent < self.next {
            return None;
        }

        let crossed = percent - percent % self.step;
        let crossed = if percent == 100 { 100 } else { crossed };
        self.next = crossed.saturating_add(self.step);
        if crossed == 100 {
            self.next = u8::MAX;
        }
        Some(crossed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_each_ten_percent_once() {
        let mut milestones = Milestones::new(1000, 10);
        let mut seen = Vec::new();
        for done in (0..=1000).step_by(25) {
            if let Some(p) = milestones.advance(done) {
                seen.push(p);
            }
        }
        assert_eq!(seen, vec![10, 20, 30, 40, 50, 60, 70, 80, 90, 100]);
    }

    #[test]
    fn big_jump_reports_highest_boundary() {
        let mut milestones = Milestones::new(100, 10);
        assert_eq!(milestones.advance(47), Some(40));
        assert_eq!(milestones.advance(49), None);
        assert_eq!(milestones.advance(50), Some(50));
        assert_eq!(milestones.advance(100), Some(100));
        assert_eq!(milestones.advance(100), None);
    }

    #[test]
    fn odd_step_still_ends_at_hundred() {
        let mut milestones = Milestones::new(10, 30);
        assert_eq!(milestones.advance(3), Some(30));
        assert_eq!(milestones.advance(10), Some(100));
    }

    #[test]
    fn empty_transfer_is_complete() {
        let mut milestones = Milestones::new(0, 10);
        assert_eq!(milestones.advance(0), Some(100));
    }
}
