// ppm.rs -- Binary PPM ("P6") codec.
//
// Accepted layout:
//
//   P6                     magic token
//   # any comment          zero or more, anywhere between header tokens
//   <width> <height>       positive decimal integers
//   255                    maximum channel value; nothing else is accepted
//   <one whitespace byte>
//   width * height * 3     raw RGB bytes, row-major, nothing after them
//
// `save` always writes the minimal form: "P6\n<w> <h>\n255\n" + payload.
// The engines work on RGBA, so `to_packed` expands with alpha 0 and
// `from_packed` drops alpha again.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::{DiffusionError, Result};
use crate::image::PackedImage;
use crate::pack;

const MAGIC: &[u8] = b"P6";
const MAX_VALUE: u32 = 255;

/// An 8-bit RGB image as stored in a P6 file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PpmImage {
    pub width: usize,
    pub height: usize,
    /// Interleaved RGB, `width * height * 3` bytes.
    pub pixels: Vec<u8>,
}

impl PpmImage {
    /// # Errors
    /// `Format` if `pixels` is not `width * height * 3` bytes long.
    pub fn new(width: usize, height: usize, pixels: Vec<u8>) -> Result<Self> {
        let expected = rgb_len(width, height)?;
        if pixels.len() != expected {
            return Err(DiffusionError::Format(format!(
                "{width}x{height} RGB image needs {expected} bytes, got {}",
                pixels.len()
            )));
        }
        Ok(PpmImage { width, height, pixels })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Self::decode(BufReader::new(file))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut out = BufWriter::new(File::create(path.as_ref())?);
        self.encode(&mut out)?;
        out.flush()?;
        Ok(())
    }

    /// Parse a complete P6 stream.
    pub fn decode<R: Read>(mut reader: R) -> Result<Self> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        let mut header = Header { bytes: &bytes, pos: 0 };

        let magic = header.token()?;
        if magic != MAGIC {
            return Err(DiffusionError::Format(format!(
                "bad magic `{}`, expected P6",
                String::from_utf8_lossy(magic)
            )));
        }
        let width = header.number("width")?;
        let height = header.number("height")?;
        let max_value = header.number("maximum value")?;
        if width == 0 || height == 0 {
            return Err(DiffusionError::Format(format!(
                "image dimensions must be positive, got {width}x{height}"
            )));
        }
        if max_value != MAX_VALUE {
            return Err(DiffusionError::Format(format!(
                "maximum channel value must be {MAX_VALUE}, got {max_value}"
            )));
        }
        header.single_whitespace()?;

        let (width, height) = (width as usize, height as usize);
        let payload = &bytes[header.pos..];
        let expected = rgb_len(width, height)?;
        if payload.len() != expected {
            return Err(DiffusionError::Format(format!(
                "payload holds {} bytes, expected {expected} for {width}x{height}",
                payload.len()
            )));
        }
        Ok(PpmImage { width, height, pixels: payload.to_vec() })
    }

    pub fn encode<W: Write>(&self, mut writer: W) -> Result<()> {
        write!(writer, "P6\n{} {}\n{MAX_VALUE}\n", self.width, self.height)?;
        writer.write_all(&self.pixels)?;
        Ok(())
    }

    /// Pack to RGBA words, alpha 0.
    pub fn to_packed(&self) -> Result<PackedImage> {
        let rgba = pack::rgb_to_rgba(&self.pixels, 0)?;
        PackedImage::from_rgba(self.width, self.height, &rgba)
    }

    /// Drop alpha from a packed image.
    pub fn from_packed(image: &PackedImage) -> Result<Self> {
        let rgb = pack::rgba_to_rgb(&image.to_rgba())?;
        PpmImage::new(image.width(), image.height(), rgb)
    }
}

/// Payload size of a `width × height` RGB image, or `Format` if it does
/// not fit in `usize`.
fn rgb_len(width: usize, height: usize) -> Result<usize> {
    width
        .checked_mul(height)
        .and_then(|n| n.checked_mul(3))
        .ok_or_else(|| {
            DiffusionError::Format(format!("{width}x{height} image is too large to address"))
        })
}

/// Cursor over the text header.
struct Header<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Header<'a> {
    /// Skip whitespace and `#` comments (to end of line).
    fn skip_separators(&mut self) {
        while let Some(&b) = self.bytes.get(self.pos) {
            if b == b'#' {
                while let Some(&c) = self.bytes.get(self.pos) {
                    self.pos += 1;
                    if c == b'\n' || c == b'\r' {
                        break;
                    }
                }
            } else if b.is_ascii_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn token(&mut self) -> Result<&'a [u8]> {
        self.skip_separators();
        let start = self.pos;
        while let Some(&b) = self.bytes.get(self.pos) {
            if b.is_ascii_whitespace() || b == b'#' {
                break;
            }
            self.pos += 1;
        }
        if start == self.pos {
            return Err(DiffusionError::Format("truncated header".into()));
        }
        Ok(&self.bytes[start..self.pos])
    }

    fn number(&mut self, what: &str) -> Result<u32> {
        let token = self.token()?;
        std::str::from_utf8(token)
            .ok()
            .filter(|s| s.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                DiffusionError::Format(format!(
                    "{what} `{}` is not a number",
                    String::from_utf8_lossy(token)
                ))
            })
    }

    /// Consume the one whitespace byte separating the header from the
    /// payload.
    fn single_whitespace(&mut self) -> Result<()> {
        match self.bytes.get(self.pos) {
            Some(b) if b.is_ascii_whitespace() => {
                self.pos += 1;
                Ok(())
            }
            _ => Err(DiffusionError::Format("missing separator after header".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn file(header: &str, payload: &[u8]) -> Vec<u8> {
        let mut v = header.as_bytes().to_vec();
        v.extend_from_slice(payload);
        v
    }

    #[test]
    fn test_decode_minimal() {
        let img = PpmImage::decode(&file("P6\n2 1\n255\n", &[1, 2, 3, 4, 5, 6])[..]).unwrap();
        assert_eq!((img.width, img.height), (2, 1));
        assert_eq!(img.pixels, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_decode_with_comments() {
        let data = file("P6\n# made by hand\n# second line\n1 1\n255\n", &[9, 8, 7]);
        let img = PpmImage::decode(&data[..]).unwrap();
        assert_eq!(img.pixels, vec![9, 8, 7]);
    }

    #[test]
    fn test_payload_may_start_with_whitespace_bytes() {
        // 0x0a and 0x20 are valid pixel values right after the separator.
        let img = PpmImage::decode(&file("P6 1 1 255\n", &[b'\n', b' ', 0])[..]).unwrap();
        assert_eq!(img.pixels, vec![b'\n', b' ', 0]);
    }

    #[test]
    fn test_rejects_wrong_magic() {
        let err = PpmImage::decode(&file("P3\n1 1\n255\n", &[0, 0, 0])[..]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn test_rejects_other_max_values() {
        for maxval in ["65535", "15", "abc"] {
            let data = file(&format!("P6\n1 1\n{maxval}\n"), &[0, 0, 0]);
            assert_eq!(PpmImage::decode(&data[..]).unwrap_err().kind(), ErrorKind::Format);
        }
    }

    #[test]
    fn test_rejects_bad_payload_length() {
        let short = file("P6\n2 2\n255\n", &[0; 11]);
        assert!(PpmImage::decode(&short[..]).is_err());
        let long = file("P6\n1 1\n255\n", &[0; 4]);
        assert!(PpmImage::decode(&long[..]).is_err());
    }

    #[test]
    fn test_rejects_zero_dimension_and_truncated_header() {
        assert!(PpmImage::decode(&b"P6\n0 4\n255\n"[..]).is_err());
        assert!(PpmImage::decode(&b"P6\n4"[..]).is_err());
        assert!(PpmImage::decode(&b""[..]).is_err());
    }

    #[test]
    fn test_rejects_dimensions_that_overflow() {
        let data = file("P6\n4294967295 4294967295\n255\n", &[0, 0, 0]);
        let err = PpmImage::decode(&data[..]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
        assert_eq!(PpmImage::new(usize::MAX, 2, Vec::new()).unwrap_err().kind(), ErrorKind::Format);
    }

    #[test]
    fn test_encode_layout() {
        let img = PpmImage::new(1, 2, vec![1, 2, 3, 4, 5, 6]).unwrap();
        let mut out = Vec::new();
        img.encode(&mut out).unwrap();
        assert_eq!(out, file("P6\n1 2\n255\n", &[1, 2, 3, 4, 5, 6]));
        assert_eq!(PpmImage::decode(&out[..]).unwrap(), img);
    }

    #[test]
    fn test_packed_conversion_sets_alpha_zero() {
        let img = PpmImage::new(1, 1, vec![10, 20, 30]).unwrap();
        let packed = img.to_packed().unwrap();
        assert_eq!(packed.get(0, 0), 0x000a_141e);
        assert_eq!(PpmImage::from_packed(&packed).unwrap(), img);
    }
}
