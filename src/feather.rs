// feather.rs — Gradient-gated edge feathering.
//
// CPU reference for shaders/feather.wgsl.
//
// Blurring the whole mask would soften the interior for no benefit; only
// the silhouette boundary needs it. Each pixel measures the maximum
// absolute difference to its 8 neighbours at a 2-texel stride. Flat
// regions (gradient < 0.01) pass through untouched — the shader's early
// exit, which skips the 5x5 kernel for the vast majority of pixels. Edge
// pixels blend toward a 5x5 Gaussian of the mask, with the blend amount
// ramping over gradient in [0.02, 0.15] so faint boundaries feather
// gently and hard boundaries feather fully.

use crate::image::Image;
use crate::math::{mix, smoothstep};

/// Gradient below which a pixel is copied verbatim.
const FLAT_GRADIENT: f32 = 0.01;

/// Neighbour sampling stride in texels.
const GRADIENT_STRIDE: isize = 2;

/// One feather pass. `radius` is the Gaussian sigma in texels.
pub fn edge_feather(src: &Image<f32>, radius: f32, out: &mut Image<f32>) {
    let w = src.width();
    let h = src.height();
    assert_eq!((out.width(), out.height()), (w, h), "output dims");

    // 5x5 Gaussian weights for the configured sigma, normalised. Computed
    // once per pass; the shader bakes these into a uniform array.
    let sigma = radius.max(0.25);
    let mut kernel = [[0.0f32; 5]; 5];
    let mut kernel_sum = 0.0f32;
    for (j, row) in kernel.iter_mut().enumerate() {
        for (i, k) in row.iter_mut().enumerate() {
            let dx = i as f32 - 2.0;
            let dy = j as f32 - 2.0;
            *k = (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
            kernel_sum += *k;
        }
    }
    for row in kernel.iter_mut() {
        for k in row.iter_mut() {
            *k /= kernel_sum;
        }
    }

    for y in 0..h {
        for x in 0..w {
            let center = src.get(x, y);

            // Max |difference| over the 8 neighbours at the stride.
            let mut gradient = 0.0f32;
            for dy in -1isize..=1 {
                for dx in -1isize..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let s = src.get_clamped(
                        x as isize + dx * GRADIENT_STRIDE,
                        y as isize + dy * GRADIENT_STRIDE,
                    );
                    gradient = gradient.max((s - center).abs());
                }
            }

            if gradient < FLAT_GRADIENT {
                out.set(x, y, center);
                continue;
            }

            let mut blurred = 0.0f32;
            for (j, row) in kernel.iter().enumerate() {
                for (i, &k) in row.iter().enumerate() {
                    let s = src.get_clamped(
                        x as isize + i as isize - 2,
                        y as isize + j as isize - 2,
                    );
                    blurred += s * k;
                }
            }

            let t = smoothstep(0.02, 0.15, gradient);
            out.set(x, y, mix(center, blurred, t));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_mask_passes_through() {
        let mut src = Image::new(8, 8);
        src.fill(0.73);
        let mut out = Image::new(8, 8);
        edge_feather(&src, 2.0, &mut out);
        for (_, _, v) in out.pixels() {
            assert_eq!(v, 0.73, "flat region is copied verbatim");
        }
    }

    #[test]
    fn test_hard_edge_is_softened() {
        let mut src = Image::new(16, 16);
        for y in 0..16 {
            for x in 8..16 {
                src.set(x, y, 1.0);
            }
        }
        let mut out = Image::new(16, 16);
        edge_feather(&src, 2.0, &mut out);

        // The pixel just inside the edge is pulled below 1, the pixel just
        // outside is pulled above 0.
        assert!(out.get(8, 8) < 1.0, "inside edge feathered: {}", out.get(8, 8));
        assert!(out.get(7, 8) > 0.0, "outside edge feathered: {}", out.get(7, 8));
        // Monotonic ramp across the boundary.
        assert!(out.get(6, 8) <= out.get(7, 8));
        assert!(out.get(7, 8) <= out.get(9, 8));
    }

    #[test]
    fn test_interior_far_from_edge_untouched() {
        let mut src = Image::new(16, 16);
        for y in 0..16 {
            for x in 8..16 {
                src.set(x, y, 1.0);
            }
        }
        let mut out = Image::new(16, 16);
        edge_feather(&src, 2.0, &mut out);
        // 4+ texels from the boundary the stride-2 gradient sees nothing.
        assert_eq!(out.get(13, 8), 1.0);
        assert_eq!(out.get(2, 8), 0.0);
    }

    #[test]
    fn test_larger_radius_feathers_wider() {
        let mut src = Image::new(16, 16);
        for y in 0..16 {
            for x in 8..16 {
                src.set(x, y, 1.0);
            }
        }
        let mut narrow = Image::new(16, 16);
        let mut wide = Image::new(16, 16);
        edge_feather(&src, 0.5, &mut narrow);
        edge_feather(&src, 3.0, &mut wide);

        // A wider sigma pulls the just-inside pixel further from 1.
        assert!(
            wide.get(8, 8) < narrow.get(8, 8),
            "wide {} vs narrow {}",
            wide.get(8, 8),
            narrow.get(8, 8)
        );
    }
}
