// stencil.rs -- One Perona-Malik update for a single pixel.
//
// For an interior pixel p and each color channel:
//
//            N
//            |
//      W --- p --- E        dX = X - p,   cX = g(|dX|, K)
//            |
//            S              p' = p + λ (cN·dN + cS·dS + cE·dE + cW·dW)
//
// p' is truncated toward zero and clamped to [0, 255]. Alpha is copied from
// the centre word untouched.
//
// This file is the single CPU definition of the update. The sequential
// engine and the host emulation backend both call into it, and
// shaders/diffusion.wgsl evaluates the same expression in the same order
// so device output can be compared pixel-for-pixel.

use crate::conduction::Conduction;
use crate::image::Rect;
use crate::pack::{extract_channel, Channel};
use crate::params::ProcessingParams;

/// The per-pixel update, with parameters fixed for one run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stencil {
    pub conduction: Conduction,
    pub threshold: f32,
    pub lambda: f32,
}

impl Stencil {
    pub fn new(conduction: Conduction, threshold: f32, lambda: f32) -> Self {
        Stencil { conduction, threshold, lambda }
    }

    pub fn from_params(params: &ProcessingParams) -> Self {
        Stencil::new(params.conduction, params.threshold, params.lambda)
    }

    /// Update one channel value from its four neighbours.
    #[inline]
    pub fn step_channel(&self, p: u8, north: u8, south: u8, east: u8, west: u8) -> u8 {
        let p = p as f32;
        let d_n = north as f32 - p;
        let d_s = south as f32 - p;
        let d_e = east as f32 - p;
        let d_w = west as f32 - p;

        let c_n = self.conduction.weight(d_n.abs(), self.threshold);
        let c_s = self.conduction.weight(d_s.abs(), self.threshold);
        let c_e = self.conduction.weight(d_e.abs(), self.threshold);
        let c_w = self.conduction.weight(d_w.abs(), self.threshold);

        let flux = c_n * d_n + c_s * d_s + c_e * d_e + c_w * d_w;
        (p + self.lambda * flux).trunc().clamp(0.0, 255.0) as u8
    }

    /// Update all three color channels of a packed word. Alpha passes through.
    #[inline]
    pub fn step_word(&self, center: u32, north: u32, south: u32, east: u32, west: u32) -> u32 {
        let mut out = center & 0xff00_0000;
        for channel in Channel::COLOR {
            let v = self.step_channel(
                extract_channel(center, channel),
                extract_channel(north, channel),
                extract_channel(south, channel),
                extract_channel(east, channel),
                extract_channel(west, channel),
            );
            out = crate::pack::with_channel(out, channel, v);
        }
        out
    }

    /// New word for interior pixel (x, y) of a row-major buffer `width` wide.
    ///
    /// # Panics
    /// Panics (index out of range) if (x, y) is on the border.
    #[inline]
    pub fn step_pixel(&self, words: &[u32], width: usize, x: usize, y: usize) -> u32 {
        let i = y * width + x;
        self.step_word(
            words[i],
            words[i - width],
            words[i + width],
            words[i + 1],
            words[i - 1],
        )
    }

    /// Update every pixel of `region` (already clipped to the interior),
    /// reading from `src` and writing to `dst`. Pixels outside `region` are
    /// left as they are in `dst`.
    ///
    /// # Panics
    /// Panics if the buffers differ in length.
    pub fn apply_region(&self, src: &[u32], dst: &mut [u32], width: usize, region: Rect) {
        assert_eq!(src.len(), dst.len(), "source and destination differ in length");
        for y in region.y..region.y + region.height {
            for x in region.x..region.x + region.width {
                dst[y * width + x] = self.step_pixel(src, width, x, y);
            }
        }
    }

    /// Update every pixel of `region` in row-major order, writing each result
    /// back into `words` before the next pixel is read.
    pub fn apply_region_in_place(&self, words: &mut [u32], width: usize, region: Rect) {
        for y in region.y..region.y + region.height {
            for x in region.x..region.x + region.width {
                let v = self.step_pixel(words, width, x, y);
                words[y * width + x] = v;
            }
        }
    }
}
