//! Occupancy-bitmap slot container
//!
//! First-fit scanning over a row-major occupancy bitmap. Rectangles are
//! searched top-to-bottom, left-to-right at the requested x alignment;
//! strips are searched as linear runs over the same bitmap, bottom row
//! upward so 1D traffic stays away from the rectangle packing region.

use crate::container::{ContainerStats, SlotContainer};
use crate::error::{PoolError, PoolResult};
use crate::geom::SlotArea;

/// In-crate geometric container over a fixed `width x height` slot grid.
#[derive(Debug)]
pub struct GridContainer {
    width: u16,
    height: u16,
    /// Row-major occupancy, one entry per slot
    occupied: Vec<bool>,
    reserved_slots: u32,
    reservations: usize,
}

impl GridContainer {
    pub fn new(width: u16, height: u16) -> PoolResult<Self> {
        if width == 0 || height == 0 {
            return Err(PoolError::InvalidConfiguration(
                "container dimensions must be nonzero".to_string(),
            ));
        }
        Ok(GridContainer {
            width,
            height,
            occupied: vec![false; width as usize * height as usize],
            reserved_slots: 0,
            reservations: 0,
        })
    }

    fn index(&self, x: u16, y: u16) -> usize {
        y as usize * self.width as usize + x as usize
    }

    fn rect_is_free(&self, x: u16, y: u16, w: u16, h: u16) -> bool {
        for row in y..y + h {
            let base = self.index(x, row);
            if self.occupied[base..base + w as usize].iter().any(|&o| o) {
                return false;
            }
        }
        true
    }

    fn mark_rect(&mut self, x: u16, y: u16, w: u16, h: u16, value: bool) {
        for row in y..y + h {
            let base = self.index(x, row);
            for slot in &mut self.occupied[base..base + w as usize] {
                *slot = value;
            }
        }
    }

    fn mark_run(&mut self, start: u32, len: u32, value: bool) {
        for slot in &mut self.occupied[start as usize..(start + len) as usize] {
            *slot = value;
        }
    }
}

impl SlotContainer for GridContainer {
    fn reserve_rect(&mut self, width: u16, height: u16, align: u16) -> PoolResult<SlotArea> {
        if width == 0 || height == 0 || width > self.width || height > self.height {
            return Err(PoolError::OutOfSpace);
        }
        let step = align.max(1);

        for y in 0..=self.height - height {
            let mut x = 0u16;
            while x + width <= self.width {
                if self.rect_is_free(x, y, width, height) {
                    self.mark_rect(x, y, width, height, true);
                    self.reserved_slots += width as u32 * height as u32;
                    self.reservations += 1;
                    return Ok(SlotArea::rect(x, y, x + width - 1, y + height - 1));
                }
                x += step;
            }
        }
        Err(PoolError::OutOfSpace)
    }

    fn reserve_strip(&mut self, slots: u32) -> PoolResult<SlotArea> {
        let total = self.occupied.len() as u32;
        if slots == 0 || slots > total {
            return Err(PoolError::OutOfSpace);
        }

        // scan from the end of the grid backward for the last free run
        let mut run = 0u32;
        let mut idx = total;
        while idx > 0 {
            idx -= 1;
            if self.occupied[idx as usize] {
                run = 0;
            } else {
                run += 1;
                if run == slots {
                    self.mark_run(idx, slots, true);
                    self.reserved_slots += slots;
                    self.reservations += 1;
                    return Ok(SlotArea::strip(idx, idx + slots - 1, self.width));
                }
            }
        }
        Err(PoolError::OutOfSpace)
    }

    fn free(&mut self, area: &SlotArea) -> PoolResult<()> {
        let indices = area.slot_indices(self.width);
        for &i in &indices {
            if i >= self.occupied.len() as u32 || !self.occupied[i as usize] {
                return Err(PoolError::InvalidConfiguration(format!(
                    "freeing unreserved slot {}",
                    i
                )));
            }
        }
        for &i in &indices {
            self.occupied[i as usize] = false;
        }
        self.reserved_slots -= indices.len() as u32;
        self.reservations -= 1;
        Ok(())
    }

    fn width(&self) -> u16 {
        self.width
    }

    fn height(&self) -> u16 {
        self.height
    }

    fn stats(&self) -> ContainerStats {
        ContainerStats {
            total_slots: self.occupied.len() as u32,
            reserved_slots: self.reserved_slots,
            reservations: self.reservations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_rect_alignment() {
        let mut c = GridContainer::new(64, 32).unwrap();
        let a = c.reserve_rect(10, 4, 8).unwrap();
        assert_eq!(a.p0.x % 8, 0);
        assert_eq!(a.width(), 10);
        assert_eq!(a.height(), 4);

        let b = c.reserve_rect(10, 4, 8).unwrap();
        assert_eq!(b.p0.x % 8, 0);
        assert_ne!(a.p0, b.p0);
    }

    #[test]
    fn test_reservations_do_not_overlap() {
        let mut c = GridContainer::new(16, 16).unwrap();
        let mut areas = Vec::new();
        while let Ok(a) = c.reserve_rect(4, 4, 4) {
            areas.push(a);
        }
        assert_eq!(areas.len(), 16);
        for (i, a) in areas.iter().enumerate() {
            for b in areas.iter().skip(i + 1) {
                let disjoint = a.p1.x < b.p0.x
                    || b.p1.x < a.p0.x
                    || a.p1.y < b.p0.y
                    || b.p1.y < a.p0.y;
                assert!(disjoint, "{:?} overlaps {:?}", a, b);
            }
        }
    }

    #[test]
    fn test_free_restores_capacity() {
        let mut c = GridContainer::new(16, 16).unwrap();
        let before = c.stats();
        let a = c.reserve_rect(8, 8, 1).unwrap();
        assert_eq!(c.stats().reserved_slots, 64);
        c.free(&a).unwrap();
        assert_eq!(c.stats(), before);
    }

    #[test]
    fn test_double_free_is_rejected() {
        let mut c = GridContainer::new(16, 16).unwrap();
        let a = c.reserve_rect(4, 4, 1).unwrap();
        c.free(&a).unwrap();
        assert!(c.free(&a).is_err());
    }

    #[test]
    fn test_strip_wraps_rows() {
        let mut c = GridContainer::new(8, 8).unwrap();
        let s = c.reserve_strip(12).unwrap();
        assert!(!s.is_2d());
        assert_eq!(s.slot_count(8), 12);
        assert_eq!(c.stats().reserved_slots, 12);
        c.free(&s).unwrap();
        assert_eq!(c.stats().reserved_slots, 0);
    }

    #[test]
    fn test_strips_allocate_from_the_bottom() {
        let mut c = GridContainer::new(8, 8).unwrap();
        let s = c.reserve_strip(8).unwrap();
        // last row of the grid
        assert_eq!(s.p0.y, 7);
        let r = c.reserve_rect(8, 1, 1).unwrap();
        assert_eq!(r.p0.y, 0);
    }

    #[test]
    fn test_out_of_space() {
        let mut c = GridContainer::new(8, 8).unwrap();
        assert!(matches!(
            c.reserve_rect(9, 1, 1),
            Err(PoolError::OutOfSpace)
        ));
        assert!(matches!(
            c.reserve_strip(65),
            Err(PoolError::OutOfSpace)
        ));
        c.reserve_rect(8, 8, 1).unwrap();
        assert!(matches!(
            c.reserve_strip(1),
            Err(PoolError::OutOfSpace)
        ));
    }
}
