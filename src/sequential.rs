// sequential.rs -- Single-threaded reference engine.
//
// Sweeps the interior row by row (y outer, x inner) for every iteration.
// This is the authoritative output: the tile scheduler is validated against
// it, on the host emulation backend exactly and on a real GPU within ±1.
//
//   InPlace         results are written into the buffer being read, so the
//                   sweep sees pixels above and to the left already updated.
//   DoubleBuffered  each iteration reads the previous iteration's buffer and
//                   writes a scratch copy, then the two are swapped.

use log::debug;

use crate::error::Result;
use crate::image::PackedImage;
use crate::params::{ProcessingParams, UpdateScheme};
use crate::stencil::Stencil;

/// Run `params.iterations` diffusion passes over `image`.
///
/// # Errors
/// `InvalidParams` if `params` fail validation. The image is untouched then.
pub fn diffuse(image: &mut PackedImage, params: &ProcessingParams) -> Result<()> {
    params.validate()?;

    let region = image.interior();
    if params.iterations == 0 || region.is_empty() {
        return Ok(());
    }

    let stencil = Stencil::from_params(params);
    let width = image.width();
    debug!(
        "sequential: {}×{} image, {} iterations, {} {}",
        width,
        image.height(),
        params.iterations,
        params.conduction,
        params.scheme
    );

    match params.scheme {
        UpdateScheme::InPlace => {
            for _ in 0..params.iterations {
                stencil.apply_region_in_place(image.as_mut_slice(), width, region);
            }
        }
        UpdateScheme::DoubleBuffered => {
            // Border words never change, so a one-time copy keeps them valid
            // in the scratch buffer for the whole run.
            let mut scratch = image.as_slice().to_vec();
            for _ in 0..params.iterations {
                stencil.apply_region(image.as_slice(), &mut scratch, width, region);
                image.swap_words(&mut scratch);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conduction::Conduction;
    use crate::pack::pack_pixel;

    fn params(scheme: UpdateScheme, iterations: u32) -> ProcessingParams {
        ProcessingParams {
            iterations,
            conduction: Conduction::Quadric,
            threshold: 30.0,
            lambda: 0.25,
            scheme,
        }
    }

    #[test]
    fn test_zero_iterations_is_identity() {
        let words: Vec<u32> = (0..25).map(|i| i * 0x010203).collect();
        let mut img = PackedImage::from_words(5, 5, words.clone());
        diffuse(&mut img, &params(UpdateScheme::InPlace, 0)).unwrap();
        assert_eq!(img.as_slice(), &words[..]);
    }

    #[test]
    fn test_invalid_params_leave_image_untouched() {
        let words: Vec<u32> = (0..9).collect();
        let mut img = PackedImage::from_words(3, 3, words.clone());
        let bad = ProcessingParams { lambda: 0.5, ..params(UpdateScheme::InPlace, 4) };
        assert!(diffuse(&mut img, &bad).is_err());
        assert_eq!(img.as_slice(), &words[..]);
    }

    #[test]
    fn test_single_interior_pixel() {
        // 3×3, centre 100, ring of zeros: all four neighbours dark.
        // 100 + 0.25 * 4 * (-100 * 0.0825688) = 91.74 → 91.
        let mut img = PackedImage::filled(3, 3, pack_pixel(0, 0, 0, 255));
        img.set(1, 1, pack_pixel(100, 100, 100, 255));
        diffuse(&mut img, &params(UpdateScheme::DoubleBuffered, 1)).unwrap();
        assert_eq!(img.get(1, 1), pack_pixel(91, 91, 91, 255));
        assert_eq!(img.get(0, 0), pack_pixel(0, 0, 0, 255));
    }

    #[test]
    fn test_schemes_agree_on_isolated_pixels() {
        // A single interior pixel has no interior neighbours, so reading
        // updated or stale neighbours makes no difference.
        let mut a = PackedImage::filled(3, 3, pack_pixel(10, 20, 30, 0));
        a.set(1, 1, pack_pixel(200, 150, 100, 0));
        let mut b = a.clone();
        diffuse(&mut a, &params(UpdateScheme::InPlace, 3)).unwrap();
        diffuse(&mut b, &params(UpdateScheme::DoubleBuffered, 3)).unwrap();
        assert_eq!(a, b);
    }
}
