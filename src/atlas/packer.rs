//! Greedy row packer.
//!
//! Images are placed left to right in horizontal rows. A row accepts images
//! whose height is close to its own, so rows stay reasonably full without a
//! bin-packing solve. Placement order for an image of height `h`:
//!
//! 1. the first row with room where `row.h * min_height_ratio <= h <= row.h`;
//! 2. the last row, raised to `h`, when `row.h < h < row.h * max_growth_ratio`;
//! 3. a new row below the last one;
//! 4. the first row with room where `h <= row.h`;
//! 5. otherwise the surface has to grow (the caller doubles the height and
//!    tries again).

use crate::error::{GraphicsError, GraphicsResult};

/// Exact fraction `num / den`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ratio {
    pub num: u32,
    pub den: u32,
}

impl Ratio {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// `value >= self * of`
    fn le_scaled(self, of: u32, value: u32) -> bool {
        value as u64 * self.den as u64 >= of as u64 * self.num as u64
    }

    /// `value < self * of`
    fn gt_scaled(self, of: u32, value: u32) -> bool {
        (value as u64 * self.den as u64) < of as u64 * self.num as u64
    }
}

/// Height tolerances of the packer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackingParams {
    /// Smallest image height, relative to a row, that may share the row.
    pub min_height_ratio: Ratio,
    /// Largest factor by which the last row may be raised.
    pub max_growth_ratio: Ratio,
}

impl Default for PackingParams {
    fn default() -> Self {
        Self {
            min_height_ratio: Ratio::new(3, 5),
            max_growth_ratio: Ratio::new(5, 3),
        }
    }
}

/// Final position of a packed image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AtlasRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// One horizontal strip. `width` is the filled part, starting at x = 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtlasRow {
    pub y: u32,
    pub height: u32,
    pub width: u32,
}

#[derive(Debug, Clone)]
pub struct AtlasPacker {
    width: u32,
    height: u32,
    rows: Vec<AtlasRow>,
    params: PackingParams,
}

impl AtlasPacker {
    pub fn new(width: u32, height: u32, params: PackingParams) -> Self {
        Self {
            width,
            height,
            rows: Vec::new(),
            params,
        }
    }

    /// Place a `width x height` image. `Ok(None)` means the surface is full.
    pub fn pack(&mut self, width: u32, height: u32) -> GraphicsResult<Option<AtlasRect>> {
        if width == 0 || height == 0 {
            return Err(GraphicsError::misuse(format!(
                "cannot pack an empty {width}x{height} image"
            )));
        }
        if width > self.width {
            return Err(GraphicsError::misuse(format!(
                "image width {width} exceeds atlas width {}",
                self.width
            )));
        }

        let min_ratio = self.params.min_height_ratio;
        if let Some(index) = self.find_row(width, |row_h| {
            height <= row_h && min_ratio.le_scaled(row_h, height)
        }) {
            return Ok(Some(self.place(index, width, height)));
        }

        if let Some(index) = self.raise_last_row(width, height) {
            return Ok(Some(self.place(index, width, height)));
        }

        let next_y = self.rows.last().map_or(0, |row| row.y + row.height);
        if next_y as u64 + height as u64 <= self.height as u64 {
            self.rows.push(AtlasRow {
                y: next_y,
                height,
                width: 0,
            });
            let index = self.rows.len() - 1;
            return Ok(Some(self.place(index, width, height)));
        }

        if let Some(index) = self.find_row(width, |row_h| height <= row_h) {
            return Ok(Some(self.place(index, width, height)));
        }

        Ok(None)
    }

    /// Extend the surface downwards. Existing rows are unaffected.
    pub fn grow_height(&mut self, height: u32) {
        debug_assert!(height >= self.height);
        self.height = height;
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn rows(&self) -> &[AtlasRow] {
        &self.rows
    }

    pub fn params(&self) -> PackingParams {
        self.params
    }

    fn find_row(&self, width: u32, accepts: impl Fn(u32) -> bool) -> Option<usize> {
        self.rows
            .iter()
            .position(|row| row.width + width <= self.width && accepts(row.height))
    }

    fn raise_last_row(&mut self, width: u32, height: u32) -> Option<usize> {
        let max_growth = self.params.max_growth_ratio;
        let surface_height = self.height;
        let surface_width = self.width;
        let row = self.rows.last_mut()?;
        let fits = height > row.height
            && max_growth.gt_scaled(row.height, height)
            && row.y as u64 + height as u64 <= surface_height as u64
            && row.width + width <= surface_width;
        if !fits {
            return None;
        }
        row.height = height;
        Some(self.rows.len() - 1)
    }

    fn place(&mut self, index: usize, width: u32, height: u32) -> AtlasRect {
        let row = &mut self.rows[index];
        let rect = AtlasRect {
            x: row.width,
            y: row.y,
            width,
            height,
        };
        row.width += width;
        rect
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packer(width: u32, height: u32) -> AtlasPacker {
        AtlasPacker::new(width, height, PackingParams::default())
    }

    fn rect(x: u32, y: u32, width: u32, height: u32) -> AtlasRect {
        AtlasRect {
            x,
            y,
            width,
            height,
        }
    }

    #[test]
    fn test_similar_heights_share_a_row() {
        let mut packer = packer(2048, 2048);
        assert_eq!(packer.pack(100, 20).unwrap(), Some(rect(0, 0, 100, 20)));
        assert_eq!(packer.pack(100, 20).unwrap(), Some(rect(100, 0, 100, 20)));
        assert_eq!(packer.pack(100, 13).unwrap(), Some(rect(200, 0, 100, 13)));
        assert_eq!(packer.rows().len(), 1);
        assert_eq!(packer.height(), 2048);
    }

    #[test]
    fn test_short_image_starts_new_row() {
        let mut packer = packer(2048, 2048);
        packer.pack(100, 20).unwrap();
        // 11 < 20 * 3/5
        assert_eq!(packer.pack(50, 11).unwrap(), Some(rect(0, 20, 50, 11)));
        assert_eq!(packer.rows().len(), 2);
    }

    #[test]
    fn test_last_row_is_raised_within_tolerance() {
        let mut packer = packer(2048, 2048);
        packer.pack(100, 20).unwrap();
        // 30 < 20 * 5/3
        assert_eq!(packer.pack(100, 30).unwrap(), Some(rect(100, 0, 100, 30)));
        assert_eq!(packer.rows()[0].height, 30);

        // 50 >= 30 * 5/3
        assert_eq!(packer.pack(100, 50).unwrap(), Some(rect(0, 30, 100, 50)));
    }

    #[test]
    fn test_full_row_overflows_to_next() {
        let mut packer = packer(256, 256);
        packer.pack(200, 20).unwrap();
        assert_eq!(packer.pack(100, 20).unwrap(), Some(rect(0, 20, 100, 20)));
    }

    #[test]
    fn test_relaxed_scan_when_no_vertical_room() {
        let mut packer = packer(256, 40);
        packer.pack(100, 30).unwrap();
        packer.pack(10, 10).unwrap();
        // No room below and 5 < 30 * 3/5: only the relaxed pass accepts it.
        assert_eq!(packer.pack(20, 5).unwrap(), Some(rect(100, 0, 20, 5)));
    }

    #[test]
    fn test_full_surface_reports_growth_then_fits() {
        let mut packer = packer(64, 32);
        packer.pack(64, 32).unwrap();
        assert_eq!(packer.pack(64, 32).unwrap(), None);

        packer.grow_height(64);
        assert_eq!(packer.pack(64, 32).unwrap(), Some(rect(0, 32, 64, 32)));
    }

    #[test]
    fn test_rows_stay_ordered_and_disjoint() {
        let mut packer = packer(128, 4096);
        let sizes = [(40, 17), (90, 33), (30, 8), (60, 21), (128, 50), (10, 49), (70, 9)];
        for (w, h) in sizes {
            packer.pack(w, h).unwrap();
        }
        for pair in packer.rows().windows(2) {
            assert!(pair[0].y + pair[0].height <= pair[1].y);
        }
        assert!(packer.rows().iter().all(|r| r.width <= 128));
    }

    #[test]
    fn test_too_wide_is_misuse() {
        let mut packer = packer(64, 64);
        assert!(packer.pack(65, 1).unwrap_err().is_misuse());
        assert!(packer.pack(0, 1).unwrap_err().is_misuse());
    }

    #[test]
    fn test_custom_params() {
        let params = PackingParams {
            min_height_ratio: Ratio::new(9, 10),
            max_growth_ratio: Ratio::new(1, 1),
        };
        let mut packer = AtlasPacker::new(512, 512, params);
        packer.pack(10, 20).unwrap();
        // 13 < 20 * 9/10, and the last row may not be raised.
        assert_eq!(packer.pack(10, 13).unwrap(), Some(rect(0, 20, 10, 13)));
    }
}
