// image.rs -- Packed RGBA image container.
//
// One `u32` per pixel (see pack.rs for the bit layout), row-major, no row
// padding: the buffer is uploaded to the device as-is and the kernel
// indexes it as `y * width + x`.
//
// Pixel classes used throughout the crate:
//
//   x:   0   1   2  ...  w-2  w-1
//   y=0  B   B   B  ...   B    B
//   y=1  B   I   I  ...   I    B
//   ...
//   h-1  B   B   B  ...   B    B
//
//   B = border pixel, never written by any engine.
//   I = interior pixel, updated once per iteration.
//
// Images narrower or shorter than 3 pixels have no interior at all.

use std::fmt;

use crate::error::{DiffusionError, Result};
use crate::pack;

/// A rectangular pixel region, `[x, x + width) × [y, y + height)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl Rect {
    pub fn new(x: usize, y: usize, width: usize, height: usize) -> Self {
        Rect { x, y, width, height }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Intersection with the interior of a `width × height` image.
    /// Empty when the two do not overlap.
    pub fn clip_to_interior(&self, width: usize, height: usize) -> Rect {
        let x0 = self.x.max(1);
        let y0 = self.y.max(1);
        let x1 = (self.x + self.width).min(width.saturating_sub(1));
        let y1 = (self.y + self.height).min(height.saturating_sub(1));
        if x1 <= x0 || y1 <= y0 {
            return Rect::new(x0, y0, 0, 0);
        }
        Rect::new(x0, y0, x1 - x0, y1 - y0)
    }
}

/// An RGBA image stored as packed words.
#[derive(Clone, PartialEq, Eq)]
pub struct PackedImage {
    data: Vec<u32>,
    width: usize,
    height: usize,
}

impl PackedImage {
    /// Zero-filled image (every channel 0, including alpha).
    pub fn new(width: usize, height: usize) -> Self {
        PackedImage {
            data: vec![0; width * height],
            width,
            height,
        }
    }

    /// Image where every pixel holds `word`.
    pub fn filled(width: usize, height: usize, word: u32) -> Self {
        PackedImage {
            data: vec![word; width * height],
            width,
            height,
        }
    }

    /// Wrap an existing vector of packed words.
    ///
    /// # Panics
    /// Panics if `data.len() != width * height`.
    pub fn from_words(width: usize, height: usize, data: Vec<u32>) -> Self {
        assert_eq!(
            data.len(),
            width * height,
            "data length ({}) must equal width * height ({})",
            data.len(),
            width * height,
        );
        PackedImage { data, width, height }
    }

    /// Pack an interleaved RGBA byte buffer.
    ///
    /// # Errors
    /// `Format` if the dimensions are zero or the buffer length is not
    /// `width * height * 4`.
    pub fn from_rgba(width: usize, height: usize, rgba: &[u8]) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(DiffusionError::Format(format!(
                "image dimensions must be positive, got {width}x{height}"
            )));
        }
        let expected = width
            .checked_mul(height)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| {
                DiffusionError::Format(format!("{width}x{height} image is too large to address"))
            })?;
        if rgba.len() != expected {
            return Err(DiffusionError::Format(format!(
                "RGBA buffer holds {} bytes, expected {expected} for {width}x{height}",
                rgba.len()
            )));
        }
        Ok(PackedImage {
            data: pack::pack(rgba)?,
            width,
            height,
        })
    }

    /// Unpack into an interleaved RGBA byte buffer.
    pub fn to_rgba(&self) -> Vec<u8> {
        pack::unpack(&self.data, self.data.len())
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn pixel_count(&self) -> usize {
        self.data.len()
    }

    /// Size of the packed buffer in bytes (`width * height * 4`).
    #[inline]
    pub fn byte_len(&self) -> u64 {
        (self.data.len() * std::mem::size_of::<u32>()) as u64
    }

    /// Whether (x, y) is updated by the stencil.
    #[inline]
    pub fn is_interior(&self, x: usize, y: usize) -> bool {
        x >= 1 && y >= 1 && x + 1 < self.width && y + 1 < self.height
    }

    /// The updatable region. Empty for images under 3×3.
    pub fn interior(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height).clip_to_interior(self.width, self.height)
    }

    /// # Panics
    /// Panics if (x, y) is out of bounds.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> u32 {
        self.bounds_check(x, y);
        self.data[y * self.width + x]
    }

    /// # Panics
    /// Panics if (x, y) is out of bounds.
    #[inline]
    pub fn set(&mut self, x: usize, y: usize, word: u32) {
        self.bounds_check(x, y);
        self.data[y * self.width + x] = word;
    }

    #[inline]
    pub fn row(&self, y: usize) -> &[u32] {
        assert!(y < self.height, "row {y} out of bounds (height {})", self.height);
        let start = y * self.width;
        &self.data[start..start + self.width]
    }

    /// Iterate over all pixels as `(x, y, word)`.
    pub fn pixels(&self) -> impl Iterator<Item = (usize, usize, u32)> + '_ {
        (0..self.height).flat_map(move |y| {
            (0..self.width).map(move |x| (x, y, self.data[y * self.width + x]))
        })
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u32] {
        &mut self.data
    }

    pub fn into_words(self) -> Vec<u32> {
        self.data
    }

    /// Exchange the pixel buffer with `other`, which must hold exactly
    /// `width * height` words.
    ///
    /// # Panics
    /// Panics on a length mismatch.
    pub fn swap_words(&mut self, other: &mut Vec<u32>) {
        assert_eq!(other.len(), self.data.len(), "swap buffer length mismatch");
        std::mem::swap(&mut self.data, other);
    }

    #[inline]
    fn bounds_check(&self, x: usize, y: usize) {
        assert!(
            x < self.width && y < self.height,
            "pixel ({x},{y}) out of bounds for image {}×{}",
            self.width,
            self.height,
        );
    }
}

// Small images print as a grid of hex words, which is what the tests want
// to see when an assertion fails.
impl fmt::Debug for PackedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "PackedImage {{ {}×{} }}", self.width, self.height)?;
        for y in 0..self.height.min(8) {
            write!(f, "  row {y}: [")?;
            for x in 0..self.width.min(8) {
                if x > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{:08x}", self.get(x, y))?;
            }
            if self.width > 8 {
                write!(f, ", ...")?;
            }
            writeln!(f, "]")?;
        }
        if self.height > 8 {
            writeln!(f, "  ...")?;
        }
        Ok(())
    }
}

impl std::ops::Index<(usize, usize)> for PackedImage {
    type Output = u32;

    #[inline]
    fn index(&self, (x, y): (usize, usize)) -> &u32 {
        self.bounds_check(x, y);
        &self.data[y * self.width + x]
    }
}

impl std::ops::IndexMut<(usize, usize)> for PackedImage {
    #[inline]
    fn index_mut(&mut self, (x, y): (usize, usize)) -> &mut u32 {
        self.bounds_check(x, y);
        let idx = y * self.width + x;
        &mut self.data[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::pack_pixel;

    #[test]
    fn test_from_rgba_layout() {
        let rgba: Vec<u8> = (0..16).collect();
        let img = PackedImage::from_rgba(2, 2, &rgba).unwrap();
        assert_eq!(img.get(0, 0), pack_pixel(0, 1, 2, 3));
        assert_eq!(img.get(1, 1), pack_pixel(12, 13, 14, 15));
        assert_eq!(img.to_rgba(), rgba);
    }

    #[test]
    fn test_from_rgba_wrong_length() {
        let err = PackedImage::from_rgba(2, 2, &[0u8; 12]).unwrap_err();
        assert!(matches!(err, DiffusionError::Format(_)));
        assert!(PackedImage::from_rgba(0, 2, &[]).is_err());
    }

    #[test]
    fn test_from_rgba_size_overflow() {
        let err = PackedImage::from_rgba(usize::MAX / 2, 3, &[0u8; 4]).unwrap_err();
        assert!(matches!(err, DiffusionError::Format(_)));
    }

    #[test]
    fn test_interior_classification() {
        let img = PackedImage::new(4, 3);
        assert!(!img.is_interior(0, 1));
        assert!(img.is_interior(1, 1));
        assert!(img.is_interior(2, 1));
        assert!(!img.is_interior(3, 1));
        assert!(!img.is_interior(1, 2));
        assert_eq!(img.interior(), Rect::new(1, 1, 2, 1));
    }

    #[test]
    fn test_tiny_image_has_no_interior() {
        assert!(PackedImage::new(2, 10).interior().is_empty());
        assert!(PackedImage::new(10, 1).interior().is_empty());
    }

    #[test]
    fn test_clip_to_interior() {
        // 10×6 image, tile at the right edge.
        let r = Rect::new(8, 0, 4, 4).clip_to_interior(10, 6);
        assert_eq!(r, Rect::new(8, 1, 1, 3));
        // Tile entirely on the last column.
        assert!(Rect::new(9, 0, 1, 6).clip_to_interior(10, 6).is_empty());
    }

    #[test]
    fn test_index_and_row() {
        let mut img = PackedImage::new(3, 2);
        img[(2, 1)] = 7;
        assert_eq!(img.row(1), &[0, 0, 7]);
        assert_eq!(img.byte_len(), 24);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_get_out_of_bounds() {
        PackedImage::new(2, 2).get(2, 0);
    }
}
