//! Quality ladder
//!
//! An ordered list of per-frame byte sizes. Level 0 is the lowest quality; each higher level
//! carries strictly larger frames.

/// Quality ladder with a current position.
#[derive(Debug, Clone)]
pub struct QualityLadder {
    resolutions: Vec<u32>,
    current_level: usize,
}

impl QualityLadder {
    /// Creates a ladder positioned at `initial_level`.
    ///
    /// Panics if the ladder is empty or `initial_level` is out of range; configuration validation
    /// rules both out.
    pub fn new(resolutions: Vec<u32>, initial_level: usize) -> Self {
        assert!(!resolutions.is_empty(), "quality ladder is empty");
        assert!(
            initial_level < resolutions.len(),
            "initial level {} outside ladder of {} levels",
            initial_level,
            resolutions.len()
        );

        Self {
            resolutions,
            current_level: initial_level,
        }
    }

    /// Frame byte size at the current level.
    pub fn resolution(&self) -> u32 {
        self.resolutions[self.current_level]
    }

    /// Current level index.
    pub fn level(&self) -> usize {
        self.current_level
    }

    /// Highest level index.
    pub fn max_level(&self) -> usize {
        self.resolutions.len() - 1
    }

    /// Largest frame byte size on the ladder.
    pub fn max_resolution(&self) -> u32 {
        self.resolutions[self.max_level()]
    }

    pub fn can_step_down(&self) -> bool {
        self.current_level > 0
    }

    pub fn can_step_up(&self) -> bool {
        self.current_level < self.max_level()
    }

    /// Moves one level down, returning the new resolution.
    pub fn step_down(&mut self) -> Option<u32> {
        if self.can_step_down() {
            self.current_level -= 1;
            Some(self.resolution())
        } else {
            None
        }
    }

    /// Moves one level up, returning the new resolution.
    pub fn step_up(&mut self) -> Option<u32> {
        if self.can_step_up() {
            self.current_level += 1;
            Some(self.resolution())
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.resolutions.len()
    }

    pub fn resolutions(&self) -> &[u32] {
        &self.resolutions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ladder(initial_level: usize) -> QualityLadder {
        QualityLadder::new(vec![100, 200, 300], initial_level)
    }

    #[test]
    fn step_down_up() {
        let mut ladder = ladder(1);

        assert_eq!(ladder.resolution(), 200);
        assert_eq!(ladder.step_down(), Some(100));
        assert_eq!(ladder.level(), 0);
        assert_eq!(ladder.step_up(), Some(200));
        assert_eq!(ladder.step_up(), Some(300));
        assert_eq!(ladder.level(), ladder.max_level());
    }

    #[test]
    fn saturates_at_ends() {
        let mut ladder = ladder(0);

        assert!(!ladder.can_step_down());
        assert_eq!(ladder.step_down(), None);
        assert_eq!(ladder.level(), 0);

        let mut ladder = self::ladder(2);

        assert!(!ladder.can_step_up());
        assert_eq!(ladder.step_up(), None);
        assert_eq!(ladder.resolution(), 300);
        assert_eq!(ladder.max_resolution(), 300);
    }

    #[test]
    #[should_panic]
    fn initial_level_out_of_range() {
        ladder(3);
    }
}
