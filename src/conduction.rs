// conduction.rs -- Edge-stopping functions of the Perona-Malik filter.
//
// Both functions map a gradient magnitude to a weight in (0, 1]:
// 1 on flat regions, falling toward 0 across strong edges.
//
//   Quadric      g(∇) = 1 / (1 + (∇/K)²)   favours wide regions over small ones
//   Exponential  g(∇) = exp(−(∇/K)²)       favours high-contrast edges
//
// The variant is picked once per run. The WGSL stencil receives the same
// choice as `Conduction::code()` and evaluates the identical expression.

use std::fmt;
use std::str::FromStr;

/// Which conduction function the stencil uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Conduction {
    Quadric,
    #[default]
    Exponential,
}

impl Conduction {
    /// Edge-stopping weight for `gradient` at threshold `threshold`.
    #[inline]
    pub fn weight(self, gradient: f32, threshold: f32) -> f32 {
        match self {
            Conduction::Quadric => quadric(gradient, threshold),
            Conduction::Exponential => exponential(gradient, threshold),
        }
    }

    /// Integer tag passed to the device kernel (`0 = quadric`, `1 = exponential`).
    pub fn code(self) -> u32 {
        match self {
            Conduction::Quadric => 0,
            Conduction::Exponential => 1,
        }
    }
}

#[inline]
pub fn quadric(gradient: f32, threshold: f32) -> f32 {
    let r = gradient / threshold;
    1.0 / (1.0 + r * r)
}

#[inline]
pub fn exponential(gradient: f32, threshold: f32) -> f32 {
    let r = gradient / threshold;
    (-(r * r)).exp()
}

impl fmt::Display for Conduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conduction::Quadric => write!(f, "quadric"),
            Conduction::Exponential => write!(f, "exponential"),
        }
    }
}

impl FromStr for Conduction {
    type Err = String;

    /// Accepts the names and the numeric codes `0` / `1`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "quadric" | "0" => Ok(Conduction::Quadric),
            "exponential" | "1" => Ok(Conduction::Exponential),
            other => Err(format!(
                "unknown conduction function `{other}` (expected quadric or exponential)"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_weight_at_zero_gradient() {
        for t in [0.5f32, 1.0, 30.0, 255.0] {
            assert_eq!(quadric(0.0, t), 1.0);
            assert_eq!(exponential(0.0, t), 1.0);
        }
    }

    #[test]
    fn test_strictly_decreasing() {
        let t = 30.0;
        for kind in [Conduction::Quadric, Conduction::Exponential] {
            let mut prev = kind.weight(0.0, t);
            for g in 1..=60 {
                let w = kind.weight(g as f32, t);
                assert!(w < prev, "{kind} not decreasing at {g}: {w} >= {prev}");
                assert!(w > 0.0 && w <= 1.0);
                prev = w;
            }
        }
    }

    #[test]
    fn test_quadric_value() {
        // (100/30)² = 11.11…, 1 / 12.11… ≈ 0.0825688
        assert!((quadric(100.0, 30.0) - 0.082_568_8).abs() < 1e-6);
    }

    #[test]
    fn test_exponential_value() {
        // exp(-1) at gradient == threshold.
        assert!((exponential(30.0, 30.0) - (-1.0f32).exp()).abs() < 1e-7);
    }

    #[test]
    fn test_parse_and_code() {
        assert_eq!("quadric".parse::<Conduction>(), Ok(Conduction::Quadric));
        assert_eq!("1".parse::<Conduction>(), Ok(Conduction::Exponential));
        assert!("linear".parse::<Conduction>().is_err());
        assert_eq!(Conduction::Quadric.code(), 0);
        assert_eq!(Conduction::Exponential.code(), 1);
        assert_eq!(Conduction::default(), Conduction::Exponential);
    }
}
