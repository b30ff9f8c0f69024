use std::fmt;

use smallvec::SmallVec;

use super::{Coordinate, Physical, Point, Rectangle};

/// Maximum number of rectangles a region keeps before collapsing
/// into its bounding box.
const MAX_RECTS: usize = 20;

/// A set of non-negative rectangles, used to describe damaged or
/// visible areas of a plane.
///
/// The rectangles of a region may overlap; a region describes coverage,
/// not a partition. Operations that would fragment a region beyond
/// [`MAX_RECTS`] collapse it to its bounding box instead.
pub struct Region<Kind = Physical> {
    rects: SmallVec<[Rectangle<i32, Kind>; 4]>,
}

impl<Kind> Region<Kind> {
    /// Create an empty region
    #[inline]
    pub fn new() -> Self {
        Region {
            rects: SmallVec::new(),
        }
    }

    /// Create a region covering a single rectangle
    #[inline]
    pub fn from_rect(rect: Rectangle<i32, Kind>) -> Self {
        let mut region = Region::new();
        region.add(rect);
        region
    }

    /// Returns true if this region covers nothing
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    /// The rectangles making up this region
    #[inline]
    pub fn rects(&self) -> &[Rectangle<i32, Kind>] {
        &self.rects
    }

    /// Remove all rectangles from this region
    #[inline]
    pub fn clear(&mut self) {
        self.rects.clear();
    }

    /// Add a single rectangle to the coverage of this region
    pub fn add(&mut self, rect: Rectangle<i32, Kind>) {
        if rect.is_empty() {
            return;
        }
        // skip rects already covered by a single existing one
        if self
            .rects
            .iter()
            .any(|r| r.contains(rect.loc) && r.contains(rect.loc + rect.size.to_point() - (1, 1).into()))
        {
            return;
        }
        self.rects.retain(|r| {
            !(rect.contains(r.loc) && rect.contains(r.loc + r.size.to_point() - (1, 1).into()))
        });
        self.rects.push(rect);
        self.defragment();
    }

    /// Union this region with another one
    pub fn union(&mut self, other: &Region<Kind>) {
        for rect in other.rects() {
            self.add(*rect);
        }
    }

    /// Restrict this region to the area of `bounds`
    pub fn clamp(&mut self, bounds: Rectangle<i32, Kind>) {
        let mut clamped = SmallVec::new();
        for rect in self.rects.drain(..) {
            if let Some(intersection) = rect.intersection(bounds) {
                clamped.push(intersection);
            }
        }
        self.rects = clamped;
    }

    /// Intersect this region with another one
    pub fn intersect(&self, other: &Region<Kind>) -> Region<Kind> {
        let mut result = Region::new();
        for a in self.rects() {
            for b in other.rects() {
                if let Some(intersection) = a.intersection(*b) {
                    result.add(intersection);
                }
            }
        }
        result
    }

    /// Subtract the coverage of `other` from this region
    pub fn subtract(&self, other: &Region<Kind>) -> Region<Kind> {
        let mut remaining: Vec<Rectangle<i32, Kind>> = self.rects.to_vec();
        for hole in other.rects() {
            let mut next = Vec::with_capacity(remaining.len());
            for rect in remaining {
                subtract_rect(rect, *hole, &mut next);
            }
            remaining = next;
        }
        let mut result = Region::new();
        for rect in remaining {
            result.add(rect);
        }
        result
    }

    /// Move every rectangle of the region by the given offset
    pub fn translate(&mut self, offset: Point<i32, Kind>) {
        for rect in self.rects.iter_mut() {
            rect.loc += offset;
        }
    }

    /// The smallest rectangle containing the whole region
    pub fn bounds(&self) -> Rectangle<i32, Kind> {
        self.rects
            .iter()
            .copied()
            .reduce(|acc, rect| acc.merge(rect))
            .unwrap_or_default()
    }

    /// Returns true if every pixel of `other` is covered by this region
    pub fn contains_region(&self, other: &Region<Kind>) -> bool {
        other.subtract(self).is_empty()
    }

    /// Returns true if any pixel of `rect` is covered by this region
    pub fn overlaps(&self, rect: Rectangle<i32, Kind>) -> bool {
        self.rects.iter().any(|r| r.overlaps(rect))
    }

    /// Map this region to another coordinate space
    pub(crate) fn map<OtherKind>(
        &self,
        mut f: impl FnMut(Rectangle<i32, Kind>) -> Rectangle<i32, OtherKind>,
    ) -> Region<OtherKind> {
        let mut result = Region::new();
        for rect in self.rects() {
            result.add(f(*rect));
        }
        result
    }

    fn defragment(&mut self) {
        if self.rects.len() > MAX_RECTS {
            let bounds = self.bounds();
            self.rects.clear();
            self.rects.push(bounds);
        }
    }
}

/// Push the parts of `rect` not covered by `hole` (at most four rectangles).
fn subtract_rect<Kind>(
    rect: Rectangle<i32, Kind>,
    hole: Rectangle<i32, Kind>,
    out: &mut Vec<Rectangle<i32, Kind>>,
) {
    let Some(overlap) = rect.intersection(hole) else {
        out.push(rect);
        return;
    };

    let rect_bottom = rect.loc.y + rect.size.h;
    let rect_right = rect.loc.x + rect.size.w;
    let overlap_bottom = overlap.loc.y + overlap.size.h;
    let overlap_right = overlap.loc.x + overlap.size.w;

    // band above the hole
    if overlap.loc.y > rect.loc.y {
        out.push(Rectangle::from_extremities(
            (rect.loc.x, rect.loc.y),
            (rect_right, overlap.loc.y),
        ));
    }
    // band below the hole
    if overlap_bottom < rect_bottom {
        out.push(Rectangle::from_extremities(
            (rect.loc.x, overlap_bottom),
            (rect_right, rect_bottom),
        ));
    }
    // left of the hole, within its vertical span
    if overlap.loc.x > rect.loc.x {
        out.push(Rectangle::from_extremities(
            (rect.loc.x, overlap.loc.y),
            (overlap.loc.x, overlap_bottom),
        ));
    }
    // right of the hole, within its vertical span
    if overlap_right < rect_right {
        out.push(Rectangle::from_extremities(
            (overlap_right, overlap.loc.y),
            (rect_right, overlap_bottom),
        ));
    }
}

impl<Kind> Default for Region<Kind> {
    #[inline]
    fn default() -> Self {
        Region::new()
    }
}

impl<Kind> Clone for Region<Kind> {
    #[inline]
    fn clone(&self) -> Self {
        Region {
            rects: self.rects.clone(),
        }
    }
}

impl<Kind> fmt::Debug for Region<Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.rects.iter()).finish()
    }
}

impl<Kind> PartialEq for Region<Kind> {
    fn eq(&self, other: &Self) -> bool {
        self.contains_region(other) && other.contains_region(self)
    }
}

impl<Kind> From<Rectangle<i32, Kind>> for Region<Kind> {
    #[inline]
    fn from(rect: Rectangle<i32, Kind>) -> Self {
        Region::from_rect(rect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::Physical;

    fn rect(x: i32, y: i32, w: i32, h: i32) -> Rectangle<i32, Physical> {
        Rectangle::new((x, y).into(), (w, h).into())
    }

    #[test]
    fn add_covered_is_noop() {
        let mut region = Region::from_rect(rect(0, 0, 100, 100));
        region.add(rect(10, 10, 20, 20));
        assert_eq!(region.rects().len(), 1);
    }

    #[test]
    fn subtract_center_leaves_frame() {
        let region = Region::from_rect(rect(0, 0, 30, 30));
        let hole = Region::from_rect(rect(10, 10, 10, 10));
        let result = region.subtract(&hole);
        assert_eq!(result.rects().len(), 4);
        assert!(!result.overlaps(rect(10, 10, 10, 10)));
        assert!(result.overlaps(rect(0, 0, 10, 10)));
        assert_eq!(result.bounds(), rect(0, 0, 30, 30));
    }

    #[test]
    fn subtract_all_is_empty() {
        let region = Region::from_rect(rect(5, 5, 10, 10));
        let hole = Region::from_rect(rect(0, 0, 100, 100));
        assert!(region.subtract(&hole).is_empty());
    }

    #[test]
    fn coverage_equality_ignores_fragmentation() {
        let mut split = Region::from_rect(rect(0, 0, 10, 20));
        split.add(rect(10, 0, 10, 20));
        let whole = Region::from_rect(rect(0, 0, 20, 20));
        assert_eq!(split, whole);
    }

    #[test]
    fn fragmentation_cap_collapses_to_bounds() {
        let mut region = Region::new();
        for i in 0..MAX_RECTS as i32 + 5 {
            region.add(rect(i * 3, i * 3, 2, 2));
        }
        assert!(region.rects().len() <= MAX_RECTS);
        assert!(region.overlaps(rect(0, 0, 2, 2)));
    }

    #[test]
    fn clamp_drops_outside_rects() {
        let mut region = Region::from_rect(rect(-10, -10, 15, 15));
        region.add(rect(100, 100, 10, 10));
        region.clamp(rect(0, 0, 50, 50));
        assert_eq!(region.bounds(), rect(0, 0, 5, 5));
    }
}
