// params.rs -- Filter parameters shared by the sequential engine and the
// tile scheduler.

use std::fmt;
use std::str::FromStr;

use crate::conduction::Conduction;
use crate::error::{DiffusionError, Result};

/// Largest `lambda` for which the explicit 4-neighbour scheme is stable.
pub const MAX_STABLE_LAMBDA: f32 = 0.25;

/// How one iteration reads and writes the pixel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateScheme {
    /// Read and write the same buffer. Later pixels in a sweep see neighbours
    /// already updated in this iteration, so the result depends on the sweep
    /// order and, on a device, on the tile shape.
    InPlace,
    /// Read from one buffer, write to another, swap after each iteration.
    /// The result is independent of sweep order and tiling.
    #[default]
    DoubleBuffered,
}

impl UpdateScheme {
    /// Number of full-image buffers a device needs for this scheme.
    pub fn buffer_count(self) -> u64 {
        match self {
            UpdateScheme::InPlace => 1,
            UpdateScheme::DoubleBuffered => 2,
        }
    }
}

impl fmt::Display for UpdateScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateScheme::InPlace => write!(f, "in-place"),
            UpdateScheme::DoubleBuffered => write!(f, "double-buffered"),
        }
    }
}

impl FromStr for UpdateScheme {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "in-place" | "inplace" => Ok(UpdateScheme::InPlace),
            "double-buffered" | "double" => Ok(UpdateScheme::DoubleBuffered),
            other => Err(format!(
                "unknown update scheme `{other}` (expected in-place or double-buffered)"
            )),
        }
    }
}

/// Parameters of one diffusion run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessingParams {
    /// Number of full passes over the image. Zero leaves it untouched.
    pub iterations: u32,
    pub conduction: Conduction,
    /// Gradient magnitude at which the conduction weight starts to fall off.
    /// Must be positive.
    pub threshold: f32,
    /// Integration step, `0 < lambda <= 0.25`.
    pub lambda: f32,
    pub scheme: UpdateScheme,
}

impl Default for ProcessingParams {
    fn default() -> Self {
        ProcessingParams {
            iterations: 16,
            conduction: Conduction::Exponential,
            threshold: 30.0,
            lambda: MAX_STABLE_LAMBDA,
            scheme: UpdateScheme::DoubleBuffered,
        }
    }
}

impl ProcessingParams {
    /// Check ranges. Both engines call this before touching the image.
    pub fn validate(&self) -> Result<()> {
        if !(self.threshold.is_finite() && self.threshold > 0.0) {
            return Err(DiffusionError::InvalidParams(format!(
                "threshold must be a positive finite number, got {}",
                self.threshold
            )));
        }
        if !(self.lambda > 0.0 && self.lambda <= MAX_STABLE_LAMBDA) {
            return Err(DiffusionError::InvalidParams(format!(
                "lambda must be in (0, {MAX_STABLE_LAMBDA}], got {}",
                self.lambda
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let p = ProcessingParams::default();
        assert!(p.validate().is_ok());
        assert_eq!(p.iterations, 16);
        assert_eq!(p.scheme, UpdateScheme::DoubleBuffered);
    }

    #[test]
    fn test_rejects_bad_threshold() {
        for t in [0.0, -1.0, f32::NAN, f32::INFINITY] {
            let p = ProcessingParams { threshold: t, ..Default::default() };
            assert!(
                matches!(p.validate(), Err(DiffusionError::InvalidParams(_))),
                "threshold {t} accepted"
            );
        }
    }

    #[test]
    fn test_rejects_unstable_lambda() {
        for l in [0.0, -0.1, 0.26, f32::NAN] {
            let p = ProcessingParams { lambda: l, ..Default::default() };
            assert!(p.validate().is_err(), "lambda {l} accepted");
        }
        let p = ProcessingParams { lambda: 0.25, ..Default::default() };
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_scheme_parse_and_buffers() {
        assert_eq!("in-place".parse::<UpdateScheme>(), Ok(UpdateScheme::InPlace));
        assert_eq!("double".parse::<UpdateScheme>(), Ok(UpdateScheme::DoubleBuffered));
        assert!("triple".parse::<UpdateScheme>().is_err());
        assert_eq!(UpdateScheme::InPlace.buffer_count(), 1);
        assert_eq!(UpdateScheme::DoubleBuffered.buffer_count(), 2);
    }
}
