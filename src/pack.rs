// pack.rs -- Conversions between byte-channel pixels and packed 32-bit words.
//
// Every engine operates on one `u32` per pixel with the layout
//
//   bit  31..24  23..16  15..8  7..0
//        A       R       G      B
//
// This is the same word the WGSL stencil reads out of its storage buffer,
// so a packed buffer can be uploaded to the device without reshuffling.
//
// Conversions provided:
//   RGBA bytes → words       (pack)
//   words      → RGBA bytes  (unpack)
//   RGB bytes ↔ RGBA bytes   (the PPM codec stores three channels)

use crate::error::{DiffusionError, Result};

/// Channel index inside a packed word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Red = 0,
    Green = 1,
    Blue = 2,
    Alpha = 3,
}

impl Channel {
    /// The three color channels touched by the stencil, in update order.
    pub const COLOR: [Channel; 3] = [Channel::Red, Channel::Green, Channel::Blue];

    /// Map `0 = R, 1 = G, 2 = B, 3 = A`. Anything else is `None`.
    pub fn from_index(index: usize) -> Option<Channel> {
        match index {
            0 => Some(Channel::Red),
            1 => Some(Channel::Green),
            2 => Some(Channel::Blue),
            3 => Some(Channel::Alpha),
            _ => None,
        }
    }

    #[inline]
    fn shift(self) -> u32 {
        match self {
            Channel::Red => 16,
            Channel::Green => 8,
            Channel::Blue => 0,
            Channel::Alpha => 24,
        }
    }
}

/// Build one packed word from its four channels.
#[inline]
pub fn pack_pixel(r: u8, g: u8, b: u8, a: u8) -> u32 {
    ((a as u32) << 24) | ((r as u32) << 16) | ((g as u32) << 8) | b as u32
}

/// Read one channel out of a packed word.
#[inline]
pub fn extract_channel(word: u32, channel: Channel) -> u8 {
    ((word >> channel.shift()) & 0xff) as u8
}

/// Replace one channel of a packed word, leaving the other three intact.
#[inline]
pub fn with_channel(word: u32, channel: Channel, value: u8) -> u32 {
    let shift = channel.shift();
    (word & !(0xff << shift)) | ((value as u32) << shift)
}

/// Group every 4 consecutive bytes (R, G, B, A) into one packed word.
///
/// # Errors
/// `Format` if `rgba.len()` is not a multiple of 4.
pub fn pack(rgba: &[u8]) -> Result<Vec<u32>> {
    if rgba.len() % 4 != 0 {
        return Err(DiffusionError::Format(format!(
            "RGBA buffer length {} is not a multiple of 4",
            rgba.len()
        )));
    }
    Ok(rgba
        .chunks_exact(4)
        .map(|px| pack_pixel(px[0], px[1], px[2], px[3]))
        .collect())
}

/// Expand the first `count` packed words back into RGBA bytes.
///
/// The result always has length `4 * count`.
///
/// # Panics
/// Panics if `count > words.len()`.
pub fn unpack(words: &[u32], count: usize) -> Vec<u8> {
    assert!(
        count <= words.len(),
        "cannot unpack {count} words from a buffer of {}",
        words.len()
    );
    let mut out = Vec::with_capacity(count * 4);
    for &word in &words[..count] {
        out.push(extract_channel(word, Channel::Red));
        out.push(extract_channel(word, Channel::Green));
        out.push(extract_channel(word, Channel::Blue));
        out.push(extract_channel(word, Channel::Alpha));
    }
    out
}

/// Insert an alpha byte after every RGB triple.
///
/// # Errors
/// `Format` if `rgb.len()` is not a multiple of 3.
pub fn rgb_to_rgba(rgb: &[u8], alpha: u8) -> Result<Vec<u8>> {
    if rgb.len() % 3 != 0 {
        return Err(DiffusionError::Format(format!(
            "RGB buffer length {} is not a multiple of 3",
            rgb.len()
        )));
    }
    let mut out = Vec::with_capacity(rgb.len() / 3 * 4);
    for px in rgb.chunks_exact(3) {
        out.extend_from_slice(px);
        out.push(alpha);
    }
    Ok(out)
}

/// Drop the alpha byte of every RGBA quad.
///
/// # Errors
/// `Format` if `rgba.len()` is not a multiple of 4.
pub fn rgba_to_rgb(rgba: &[u8]) -> Result<Vec<u8>> {
    if rgba.len() % 4 != 0 {
        return Err(DiffusionError::Format(format!(
            "RGBA buffer length {} is not a multiple of 4",
            rgba.len()
        )));
    }
    let mut out = Vec::with_capacity(rgba.len() / 4 * 3);
    for px in rgba.chunks_exact(4) {
        out.extend_from_slice(&px[..3]);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_pixel_layout() {
        let w = pack_pixel(0x11, 0x22, 0x33, 0x44);
        assert_eq!(w, 0x4411_2233);
    }

    #[test]
    fn test_extract_each_channel() {
        let w = 0xA1B2_C3D4;
        assert_eq!(extract_channel(w, Channel::Alpha), 0xA1);
        assert_eq!(extract_channel(w, Channel::Red), 0xB2);
        assert_eq!(extract_channel(w, Channel::Green), 0xC3);
        assert_eq!(extract_channel(w, Channel::Blue), 0xD4);
    }

    #[test]
    fn test_channel_from_index() {
        assert_eq!(Channel::from_index(0), Some(Channel::Red));
        assert_eq!(Channel::from_index(3), Some(Channel::Alpha));
        assert_eq!(Channel::from_index(4), None);
    }

    #[test]
    fn test_with_channel_only_touches_one_byte() {
        let w = pack_pixel(1, 2, 3, 4);
        let w = with_channel(w, Channel::Green, 200);
        assert_eq!(w, pack_pixel(1, 200, 3, 4));
    }

    #[test]
    fn test_pack_rejects_ragged_input() {
        let err = pack(&[1, 2, 3, 4, 5]).unwrap_err();
        assert!(matches!(err, DiffusionError::Format(_)));
    }

    #[test]
    fn test_pack_empty() {
        assert!(pack(&[]).unwrap().is_empty());
        assert!(unpack(&[], 0).is_empty());
    }

    #[test]
    fn test_unpack_prefix_only() {
        let words = [pack_pixel(1, 2, 3, 4), pack_pixel(5, 6, 7, 8)];
        assert_eq!(unpack(&words, 1), vec![1, 2, 3, 4]);
    }

    #[test]
    #[should_panic(expected = "cannot unpack")]
    fn test_unpack_count_too_large() {
        unpack(&[0u32], 2);
    }

    #[test]
    fn test_rgb_rgba_conversion() {
        let rgb = [10u8, 20, 30, 40, 50, 60];
        let rgba = rgb_to_rgba(&rgb, 0).unwrap();
        assert_eq!(rgba, vec![10, 20, 30, 0, 40, 50, 60, 0]);
        assert_eq!(rgba_to_rgb(&rgba).unwrap(), rgb.to_vec());
        assert!(rgb_to_rgba(&[1, 2], 0).is_err());
        assert!(rgba_to_rgb(&[1, 2, 3]).is_err());
    }
}
