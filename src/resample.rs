// resample.rs — Mask shift and guided bilateral upsample.
//
// CPU references for shaders/shift.wgsl and shaders/bilateral.wgsl.
//
// SHIFT
// ──────
// On interpolated frames (no fresh model output) the previous mask is
// translated toward the predicted person position. The kernel samples the
// mask at `uv + shift` with coordinates clamped into the image — never
// zero-filled, so the leading edge drags border values instead of cutting
// a black band.
//
// BILATERAL UPSAMPLE
// ───────────────────
// The model mask is 5-10x smaller than the camera frame. Plain bilinear
// upsampling smears the silhouette across ~8 output pixels; the joint
// bilateral filter instead weights each low-res sample by its colour
// similarity to the full-res pixel being produced, snapping the boundary
// to the camera image's real edges. Colour similarity uses the perceptual
// distance in math.rs (3x chroma weight).

use crate::frame::Frame;
use crate::image::{sample_bilinear, Image};
use crate::math::perceptual_dist2;

// ---------------------------------------------------------------------------
// Mask shift
// ---------------------------------------------------------------------------

/// Translate `src` by sampling at `uv + shift` (shift in normalised
/// coordinates). Sampled coordinates clamp to the border.
pub fn shift_mask(src: &Image<f32>, shift: (f32, f32), out: &mut Image<f32>) {
    let w = src.width();
    let h = src.height();
    assert_eq!((out.width(), out.height()), (w, h), "output dims");

    let dx = shift.0 * w as f32;
    let dy = shift.1 * h as f32;
    for y in 0..h {
        for x in 0..w {
            out.set(x, y, sample_bilinear(src, x as f32 + dx, y as f32 + dy));
        }
    }
}

// ---------------------------------------------------------------------------
// Bilateral upsample
// ---------------------------------------------------------------------------

/// Kernel half-width in low-res texels. The 5x5 footprint and its spatial
/// weights are compile-time constants, mirroring the unrolled shader loop.
const KERNEL_RADIUS: i32 = 2;

/// Spatial sigma in low-res texels.
const SIGMA_SPATIAL: f32 = 1.5;

/// Below this total weight the filter is considered degenerate (all
/// neighbours colour-rejected) and the unfiltered centre sample is used.
const MIN_TOTAL_WEIGHT: f32 = 1e-4;

/// Joint bilateral upsample of a low-resolution mask to frame resolution,
/// guided by the RGB frame. `range_sigma` is the colour-domain sigma in
/// perceptual distance units.
pub fn bilateral_upsample(
    mask: &Image<f32>,
    guide: &Frame,
    range_sigma: f32,
    out: &mut Image<f32>,
) {
    let fw = guide.width();
    let fh = guide.height();
    assert_eq!((out.width(), out.height()), (fw, fh), "output dims");
    let mw = mask.width();
    let mh = mask.height();

    let inv_2ss = 1.0 / (2.0 * SIGMA_SPATIAL * SIGMA_SPATIAL);
    let inv_2sr = 1.0 / (2.0 * range_sigma * range_sigma);

    // Full-res pixel pitch of one low-res texel, for guide lookups.
    let scale_x = fw as f32 / mw as f32;
    let scale_y = fh as f32 / mh as f32;

    for y in 0..fh {
        for x in 0..fw {
            // Position of this output pixel in low-res texel space.
            let lx = (x as f32 + 0.5) * mw as f32 / fw as f32 - 0.5;
            let ly = (y as f32 + 0.5) * mh as f32 / fh as f32 - 0.5;
            let bx = lx.round() as i32;
            let by = ly.round() as i32;

            let center_rgb = guide.rgb(x, y);

            let mut acc = 0.0f32;
            let mut weight_sum = 0.0f32;
            for j in -KERNEL_RADIUS..=KERNEL_RADIUS {
                for i in -KERNEL_RADIUS..=KERNEL_RADIUS {
                    let sx = bx + i;
                    let sy = by + j;

                    let ddx = sx as f32 - lx;
                    let ddy = sy as f32 - ly;
                    let w_spatial = (-(ddx * ddx + ddy * ddy) * inv_2ss).exp();

                    // Guide colour at the full-res position of this low-res
                    // texel centre.
                    let gx = (sx as f32 + 0.5) * scale_x - 0.5;
                    let gy = (sy as f32 + 0.5) * scale_y - 0.5;
                    let sample_rgb = guide.sample_bilinear(gx, gy);

                    let dist2 = perceptual_dist2(center_rgb, sample_rgb);
                    let w_range = (-dist2 * inv_2sr).exp();

                    let w = w_spatial * w_range;
                    acc += mask.get_clamped(sx as isize, sy as isize) * w;
                    weight_sum += w;
                }
            }

            let v = if weight_sum < MIN_TOTAL_WEIGHT {
                // Degenerate kernel: fall back to the unfiltered centre.
                sample_bilinear(mask, lx, ly)
            } else {
                acc / weight_sum
            };
            out.set(x, y, v);
        }
    }
}
