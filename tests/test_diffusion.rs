// tests/test_diffusion.rs -- End-to-end checks of the sequential engine.
//
// Expected values are worked by hand from
//   p' = trunc(p + λ Σ c(|d|) d),  quadric c(g) = 1 / (1 + (g/K)²)
// with K = 30, λ = 0.25, so c(100) ≈ 0.0825688, c(5) ≈ 0.972973,
// c(6) ≈ 0.961538.

use pm_diffusion::pack::pack_pixel;
use pm_diffusion::stencil::Stencil;
use pm_diffusion::{sequential, Conduction, ErrorKind, PackedImage, ProcessingParams, UpdateScheme};

const BORDER: u32 = 0xff00_0000;

/// 4×4, black opaque border, 2×2 interior at gray 100.
fn square_4x4() -> PackedImage {
    let mut img = PackedImage::filled(4, 4, BORDER);
    for (x, y) in [(1, 1), (2, 1), (1, 2), (2, 2)] {
        img.set(x, y, pack_pixel(100, 100, 100, 255));
    }
    img
}

fn gray(v: u8) -> u32 {
    pack_pixel(v, v, v, 255)
}

fn quadric(scheme: UpdateScheme, iterations: u32) -> ProcessingParams {
    ProcessingParams { iterations, conduction: Conduction::Quadric, threshold: 30.0, lambda: 0.25, scheme }
}

fn assert_border_unchanged(before: &PackedImage, after: &PackedImage) {
    for (x, y, word) in before.pixels() {
        if !before.is_interior(x, y) {
            assert_eq!(after.get(x, y), word, "border pixel ({x},{y}) changed");
        }
    }
}

// ===== Hand-computed single iteration =====

#[test]
fn double_buffered_square() {
    // Every interior pixel sees two dark border neighbours and two at 100:
    // 100 + 0.25 * 2 * (-100 * 0.0825688) = 95.87 → 95.
    let original = square_4x4();
    let mut img = original.clone();
    sequential::diffuse(&mut img, &quadric(UpdateScheme::DoubleBuffered, 1)).unwrap();
    for (x, y) in [(1, 1), (2, 1), (1, 2), (2, 2)] {
        assert_eq!(img.get(x, y), gray(95), "({x},{y})");
    }
    assert_border_unchanged(&original, &img);
}

#[test]
fn in_place_square_sees_updated_neighbours() {
    // Row-major sweep:
    //   (1,1): as above                                   → 95
    //   (2,1): W = 95 already updated, d = -5             → 94.655 → 94
    //   (1,2): N = 95 already updated                     → 94
    //   (2,2): N = 94, W = 94, both d = -6                → 92.987 → 92
    let original = square_4x4();
    let mut img = original.clone();
    sequential::diffuse(&mut img, &quadric(UpdateScheme::InPlace, 1)).unwrap();
    assert_eq!(img.get(1, 1), gray(95));
    assert_eq!(img.get(2, 1), gray(94));
    assert_eq!(img.get(1, 2), gray(94));
    assert_eq!(img.get(2, 2), gray(92));
    assert_border_unchanged(&original, &img);
}

#[test]
fn exponential_barely_moves_across_strong_edge_but_truncates() {
    // exp(-(100/30)²) ≈ 1.5e-5: the update is -0.00075, and truncation of
    // 99.99925 still drops one step.
    let mut img = square_4x4();
    let p = ProcessingParams { iterations: 1, ..ProcessingParams::default() };
    sequential::diffuse(&mut img, &p).unwrap();
    assert_eq!(img.get(1, 1), gray(99));
}

// ===== Invariants over many iterations =====

#[test]
fn uniform_image_is_fixed_point() {
    for conduction in [Conduction::Quadric, Conduction::Exponential] {
        for scheme in [UpdateScheme::InPlace, UpdateScheme::DoubleBuffered] {
            let original = PackedImage::filled(9, 7, pack_pixel(42, 180, 7, 3));
            let mut img = original.clone();
            let p = ProcessingParams { iterations: 20, conduction, scheme, ..Default::default() };
            sequential::diffuse(&mut img, &p).unwrap();
            assert_eq!(img, original, "{conduction} {scheme}");
        }
    }
}

#[test]
fn alpha_and_border_survive_many_iterations() {
    let mut original = PackedImage::new(12, 10);
    for (x, y, _) in PackedImage::new(12, 10).pixels() {
        let v = ((x * 29 + y * 53) % 256) as u8;
        original.set(x, y, pack_pixel(v, v / 3, 255 - v, (x + y) as u8));
    }
    let mut img = original.clone();
    sequential::diffuse(&mut img, &quadric(UpdateScheme::DoubleBuffered, 30)).unwrap();
    assert_border_unchanged(&original, &img);
    for (x, y, word) in img.pixels() {
        assert_eq!(word >> 24, original.get(x, y) >> 24, "alpha at ({x},{y})");
    }
}

#[test]
fn diffusion_reduces_total_variation() {
    let mut img = PackedImage::new(16, 16);
    for (x, y, _) in PackedImage::new(16, 16).pixels() {
        let v = if (x / 2 + y / 2) % 2 == 0 { 120 } else { 140 };
        img.set(x, y, gray(v));
    }
    let variation = |img: &PackedImage| -> u64 {
        let mut tv = 0u64;
        for y in 1..15 {
            for x in 1..15 {
                let a = img.get(x, y) & 0xff;
                let b = img.get(x + 1, y) & 0xff;
                tv += a.abs_diff(b) as u64;
            }
        }
        tv
    };
    let before = variation(&img);
    sequential::diffuse(&mut img, &quadric(UpdateScheme::DoubleBuffered, 10)).unwrap();
    assert!(variation(&img) < before);
}

#[test]
fn sequential_matches_stencil_applied_by_hand() {
    let mut original = PackedImage::new(7, 6);
    for (x, y, _) in PackedImage::new(7, 6).pixels() {
        original.set(x, y, pack_pixel((x * 40) as u8, (y * 40) as u8, 90, 0));
    }
    let p = quadric(UpdateScheme::DoubleBuffered, 1);
    let stencil = Stencil::from_params(&p);

    let mut expected = original.clone();
    for y in 1..5 {
        for x in 1..6 {
            expected.set(x, y, stencil.step_pixel(original.as_slice(), 7, x, y));
        }
    }
    let mut img = original;
    sequential::diffuse(&mut img, &p).unwrap();
    assert_eq!(img, expected);
}

#[test]
fn rejects_unstable_lambda() {
    let mut img = square_4x4();
    let p = ProcessingParams { lambda: 0.3, ..Default::default() };
    let err = sequential::diffuse(&mut img, &p).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParams);
    assert_eq!(img, square_4x4());
}
