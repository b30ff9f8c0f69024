//! Aged damage history for one output
//!
//! Accumulates pending damage and keeps the regions of the last few
//! committed frames, so a renderer handed a buffer of age `k` can repaint
//! exactly what changed since that buffer was last on screen.

use crate::utils::{Physical, Rectangle, Region, Size};

/// Number of committed frames the ring remembers
pub const PREVIOUS_LEN: usize = 4;

/// Damage accumulator with a fixed history
#[derive(Debug, Clone)]
pub struct DamageRing {
    bounds: Size<i32, Physical>,
    current: Region<Physical>,
    previous: [Region<Physical>; PREVIOUS_LEN],
    /// Index of the most recently committed region
    previous_idx: usize,
}

impl DamageRing {
    /// Create a ring for an output of the given size
    pub fn new(bounds: Size<i32, Physical>) -> DamageRing {
        DamageRing {
            bounds,
            current: Region::new(),
            previous: std::array::from_fn(|_| Region::new()),
            previous_idx: 0,
        }
    }

    /// Change the output size
    ///
    /// Everything is damaged afterwards.
    pub fn set_bounds(&mut self, bounds: Size<i32, Physical>) {
        if self.bounds == bounds {
            return;
        }
        self.bounds = bounds;
        self.current = Region::from_rect(Rectangle::from_size(bounds));
        self.previous = std::array::from_fn(|_| Region::new());
    }

    /// The output size this ring covers
    pub fn bounds(&self) -> Size<i32, Physical> {
        self.bounds
    }

    /// Add damage, clamped to the output bounds
    pub fn add(&mut self, region: &Region<Physical>) {
        let mut clamped = region.clone();
        clamped.clamp(Rectangle::from_size(self.bounds));
        self.current.union(&clamped);
    }

    /// Add a single damaged rectangle
    pub fn add_rect(&mut self, rect: Rectangle<i32, Physical>) {
        if let Some(clamped) = rect.intersection(Rectangle::from_size(self.bounds)) {
            self.current.add(clamped);
        }
    }

    /// Damage the whole output
    pub fn add_whole(&mut self) {
        self.current.add(Rectangle::from_size(self.bounds));
    }

    /// The damage pending for the next frame
    pub fn current(&self) -> &Region<Physical> {
        &self.current
    }

    /// Returns true if nothing is pending
    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    /// A frame with the current damage was committed
    ///
    /// Pushes the current region into the history and clears it.
    pub fn rotate(&mut self) {
        self.previous_idx = (self.previous_idx + PREVIOUS_LEN - 1) % PREVIOUS_LEN;
        self.previous[self.previous_idx] = std::mem::take(&mut self.current);
    }

    /// The region a buffer of the given age needs repainted
    ///
    /// Age 0 (or anything beyond the history) means the buffer content is
    /// unknown and the whole output is returned; age `k` yields the union
    /// of the pending damage and the `k - 1` most recent committed regions.
    pub fn buffer_damage(&self, age: usize) -> Region<Physical> {
        if age == 0 || age > PREVIOUS_LEN {
            return Region::from_rect(Rectangle::from_size(self.bounds));
        }

        let mut damage = self.current.clone();
        for step in 0..age - 1 {
            let idx = (self.previous_idx + step) % PREVIOUS_LEN;
            damage.union(&self.previous[idx]);
        }
        damage.clamp(Rectangle::from_size(self.bounds));
        damage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(x: i32, y: i32, w: i32, h: i32) -> Rectangle<i32, Physical> {
        Rectangle::new((x, y).into(), (w, h).into())
    }

    fn ring() -> DamageRing {
        DamageRing::new((100, 100).into())
    }

    #[test]
    fn age_zero_is_everything() {
        let mut ring = ring();
        ring.add_rect(rect(0, 0, 5, 5));
        assert_eq!(ring.buffer_damage(0), Region::from_rect(rect(0, 0, 100, 100)));
    }

    #[test]
    fn age_beyond_history_is_everything() {
        let ring = ring();
        assert_eq!(
            ring.buffer_damage(PREVIOUS_LEN + 1),
            Region::from_rect(rect(0, 0, 100, 100))
        );
    }

    #[test]
    fn age_law_unions_history() {
        let mut ring = ring();

        // frame 1 damages a, frame 2 damages b, now c is pending
        ring.add_rect(rect(0, 0, 10, 10));
        ring.rotate();
        ring.add_rect(rect(20, 0, 10, 10));
        ring.rotate();
        ring.add_rect(rect(40, 0, 10, 10));

        // age 1: only the pending damage
        assert_eq!(ring.buffer_damage(1), Region::from_rect(rect(40, 0, 10, 10)));

        // age 2: pending plus the last committed frame
        let mut expected = Region::from_rect(rect(40, 0, 10, 10));
        expected.add(rect(20, 0, 10, 10));
        assert_eq!(ring.buffer_damage(2), expected);

        // age 3: pending plus the last two frames
        expected.add(rect(0, 0, 10, 10));
        assert_eq!(ring.buffer_damage(3), expected);
    }

    #[test]
    fn rotate_clears_pending() {
        let mut ring = ring();
        ring.add_rect(rect(0, 0, 10, 10));
        ring.rotate();
        assert!(ring.is_empty());
    }

    #[test]
    fn damage_is_clamped_to_bounds() {
        let mut ring = ring();
        ring.add_rect(rect(90, 90, 50, 50));
        assert_eq!(ring.current().bounds(), rect(90, 90, 10, 10));
    }
}
