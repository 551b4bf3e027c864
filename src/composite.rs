// composite.rs — Final composite, light wrap, colour match and crop.
//
// CPU references for shaders/composite.wgsl, light_wrap.wgsl,
// color_match.wgsl and crop.wgsl.
//
// The composite does three things beyond a naive mix(bg, camera, mask):
//
//   1. EDGE-ADAPTIVE HARDENING — where the camera itself has a strong
//      edge, the mask threshold window narrows so the cut follows the
//      image edge; in flat regions the window widens and the blend stays
//      soft (hair, motion blur).
//
//   2. CLOSED-FORM ALPHA MATTING — inside the transition band the true
//      opacity is estimated from local foreground/background colour
//      samples: alpha = ((I-B)·(F-B)) / ((F-B)·(F-B)). Only trusted when
//      the local F and B are actually separable in perceptual colour
//      space (the gate), otherwise the matte estimate is noise.
//
//   3. FOREGROUND RECOVERY — mixed edge pixels carry the *old*
//      background's colour. Replacing the background without correcting
//      them leaves a halo of the old background along the silhouette:
//      recovered = I + (newBg - B) * (1 - alpha) swaps the background
//      contribution out of the observed colour.

use crate::frame::Frame;
use crate::image::Image;
use crate::math::{
    add3, clamp3, dot3, mix, mix3, perceptual_dist2, scale3, smoothstep, sub3,
};

// ---------------------------------------------------------------------------
// Background source
// ---------------------------------------------------------------------------

/// What the compositor samples behind the person. The pipeline resolves
/// the configured `BackgroundMode` into one of these per dispatch.
pub enum BackgroundSource<'a> {
    /// Blurred camera or uploaded image, in output UV space. May be a
    /// lower resolution than the camera; sampling is normalised.
    Frame(&'a Frame),
    /// Solid colour.
    Color([f32; 3]),
}

impl BackgroundSource<'_> {
    #[inline]
    fn sample(&self, u: f32, v: f32) -> [f32; 3] {
        match self {
            BackgroundSource::Frame(f) => f.sample_bilinear(
                u * (f.width() - 1) as f32,
                v * (f.height() - 1) as f32,
            ),
            BackgroundSource::Color(rgb) => *rgb,
        }
    }
}

// ---------------------------------------------------------------------------
// Composite parameters
// ---------------------------------------------------------------------------

/// Per-dispatch uniforms of the composite stage.
#[derive(Clone, Copy, Debug)]
pub struct CompositeParams {
    /// Auto-frame crop in normalised output coordinates, if one is active.
    /// Used only to reverse-transform the background UV.
    pub crop_offset: (f32, f32),
    pub crop_size: (f32, f32),
    /// Keep the background stationary under the auto-frame crop.
    pub background_fixed: bool,
    /// Per-channel background gain from the colour match stage.
    pub bg_gain: [f32; 3],
}

impl Default for CompositeParams {
    fn default() -> Self {
        CompositeParams {
            crop_offset: (0.0, 0.0),
            crop_size: (1.0, 1.0),
            background_fixed: false,
            bg_gain: [1.0; 3],
        }
    }
}

/// Transition-band cross-kernel stride in texels.
const CROSS_STRIDE: isize = 4;

/// Minimum accumulated weight for a trusted local F or B estimate.
const MIN_ACC_WEIGHT: f32 = 0.01;

/// One full composite pass: camera + refined mask + background → output.
///
/// `mask` is the full-resolution mask after bilateral, feather and
/// erosion. The mode dispatch (blur / image / colour) happens in the
/// pipeline, which hands the resolved `BackgroundSource` here.
pub fn composite(
    camera: &Frame,
    mask: &Image<f32>,
    bg: &BackgroundSource<'_>,
    params: &CompositeParams,
    out: &mut Frame,
) {
    let w = camera.width();
    let h = camera.height();
    assert_eq!((mask.width(), mask.height()), (w, h), "mask dims");
    assert_eq!((out.width(), out.height()), (w, h), "output dims");

    for y in 0..h {
        for x in 0..w {
            let i_rgb = camera.rgb(x, y);
            let raw_mask = mask.get(x, y);

            // Edge-adaptive threshold window from the camera's own
            // luminance gradient (central differences).
            let dx = camera.rgb_clamped(x as isize + 1, y as isize)
                .iter()
                .zip(camera.rgb_clamped(x as isize - 1, y as isize).iter())
                .map(|(a, b)| a - b)
                .fold(0.0f32, |acc, d| acc + d * d);
            let dy = camera.rgb_clamped(x as isize, y as isize + 1)
                .iter()
                .zip(camera.rgb_clamped(x as isize, y as isize - 1).iter())
                .map(|(a, b)| a - b)
                .fold(0.0f32, |acc, d| acc + d * d);
            let edge_strength = dx + dy;
            let sharpness = smoothstep(0.001, 0.02, edge_strength);
            let lo = mix(0.15, 0.35, sharpness);
            let hi = mix(0.85, 0.65, sharpness);
            let hard_mask = smoothstep(lo, hi, raw_mask);

            // Background UV, reverse-transformed when the background is
            // pinned under an active auto-frame crop.
            let u = x as f32 / (w - 1).max(1) as f32;
            let v = y as f32 / (h - 1).max(1) as f32;
            let (bu, bv) = if params.background_fixed {
                (
                    (u - params.crop_offset.0) / params.crop_size.0,
                    (v - params.crop_offset.1) / params.crop_size.1,
                )
            } else {
                (u, v)
            };
            let mut new_bg = bg.sample(bu.clamp(0.0, 1.0), bv.clamp(0.0, 1.0));
            new_bg = clamp3(
                [
                    new_bg[0] * params.bg_gain[0],
                    new_bg[1] * params.bg_gain[1],
                    new_bg[2] * params.bg_gain[2],
                ],
                0.0,
                1.0,
            );

            // Outside the transition band the hardened mix is the answer.
            if !(0.02..=0.98).contains(&raw_mask) {
                out.set_rgb(x, y, mix3(new_bg, i_rgb, hard_mask));
                continue;
            }

            // 13-sample cross kernel: offsets 0, ±1, ±2, ±3 on each axis
            // at a 4-texel stride, proximity-weighted.
            let mut fg_acc = [0.0f32; 3];
            let mut fg_w = 0.0f32;
            let mut bg_acc = [0.0f32; 3];
            let mut bg_w = 0.0f32;
            for (ox, oy) in cross_offsets() {
                let sx = x as isize + ox * CROSS_STRIDE;
                let sy = y as isize + oy * CROSS_STRIDE;
                let m_i = mask.get_clamped(sx, sy);
                let c_i = camera.rgb_clamped(sx, sy);
                let proximity = 1.0 / (1.0 + (ox.abs() + oy.abs()) as f32);

                let wf = smoothstep(0.6, 0.9, m_i) * proximity;
                let wb = (1.0 - smoothstep(0.1, 0.4, m_i)) * proximity;
                fg_acc = add3(fg_acc, scale3(c_i, wf));
                fg_w += wf;
                bg_acc = add3(bg_acc, scale3(c_i, wb));
                bg_w += wb;
            }

            let (alpha_final, recovered, beta) =
                if fg_w >= MIN_ACC_WEIGHT && bg_w >= MIN_ACC_WEIGHT {
                    let f_est = scale3(fg_acc, 1.0 / fg_w);
                    let b_est = scale3(bg_acc, 1.0 / bg_w);

                    let fb = sub3(f_est, b_est);
                    let alpha_matte =
                        (dot3(sub3(i_rgb, b_est), fb) / dot3(fb, fb).max(0.01)).clamp(0.0, 1.0);

                    // The matte is only as good as the colour separation of
                    // its F/B estimates.
                    let separation = perceptual_dist2(f_est, b_est).sqrt();
                    let gate = smoothstep(0.02, 0.08, separation);

                    let beta = smoothstep(0.02, 0.15, raw_mask)
                        * (1.0 - smoothstep(0.9, 1.0, raw_mask))
                        * gate;

                    let recovered = clamp3(
                        add3(i_rgb, scale3(sub3(new_bg, b_est), 1.0 - alpha_matte)),
                        0.0,
                        1.0,
                    );
                    let alpha_final = mix(hard_mask, alpha_matte, 0.8 * beta);
                    (alpha_final, recovered, beta)
                } else {
                    (hard_mask, i_rgb, 0.0)
                };

            let base = mix3(new_bg, i_rgb, alpha_final);
            out.set_rgb(x, y, mix3(base, recovered, beta));
        }
    }
}

/// The 13 cross-kernel offsets: centre plus ±1, ±2, ±3 on each axis.
fn cross_offsets() -> [(isize, isize); 13] {
    [
        (0, 0),
        (1, 0), (2, 0), (3, 0), (-1, 0), (-2, 0), (-3, 0),
        (0, 1), (0, 2), (0, 3), (0, -1), (0, -2), (0, -3),
    ]
}

// ---------------------------------------------------------------------------
// Light wrap
// ---------------------------------------------------------------------------

/// Bleed a narrow band of background colour onto the subject's edge.
/// `composited` is the output of `composite`; the result overwrites `out`
/// (which may alias a different buffer, not `composited`).
pub fn light_wrap(
    composited: &Frame,
    mask: &Image<f32>,
    bg: &BackgroundSource<'_>,
    params: &CompositeParams,
    strength: f32,
    out: &mut Frame,
) {
    let w = composited.width();
    let h = composited.height();
    assert_eq!((out.width(), out.height()), (w, h), "output dims");

    for y in 0..h {
        for x in 0..w {
            let m = mask.get(x, y);
            let band = smoothstep(0.25, 0.45, m) * (1.0 - smoothstep(0.55, 0.75, m));

            let u = x as f32 / (w - 1).max(1) as f32;
            let v = y as f32 / (h - 1).max(1) as f32;
            let (bu, bv) = if params.background_fixed {
                (
                    (u - params.crop_offset.0) / params.crop_size.0,
                    (v - params.crop_offset.1) / params.crop_size.1,
                )
            } else {
                (u, v)
            };
            let bg_rgb = bg.sample(bu.clamp(0.0, 1.0), bv.clamp(0.0, 1.0));

            out.set_rgb(
                x,
                y,
                mix3(composited.rgb(x, y), bg_rgb, band * strength),
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Colour match
// ---------------------------------------------------------------------------

/// Sampling grid for the mean estimates. 16x16 positions are plenty for a
/// global gain and keep the stage off the per-pixel budget.
const MATCH_GRID: usize = 16;

/// Per-channel gain pulling the background image toward the camera
/// foreground's colour cast: clamp(fgMean / bgMean, 0.7, 1.4), blended at
/// `strength`. Returns unity gain when either mean is degenerate.
///
/// The mask may be at any resolution (full-frame or model space); the
/// sampling grid addresses it in normalised coordinates.
pub fn color_match_gain(
    camera: &Frame,
    mask: &Image<f32>,
    background: &Frame,
    strength: f32,
) -> [f32; 3] {
    let mut fg_sum = [0.0f32; 3];
    let mut fg_n = 0.0f32;
    let mut bg_sum = [0.0f32; 3];

    for gy in 0..MATCH_GRID {
        for gx in 0..MATCH_GRID {
            let u = (gx as f32 + 0.5) / MATCH_GRID as f32;
            let v = (gy as f32 + 0.5) / MATCH_GRID as f32;

            let cx = (u * (camera.width() - 1) as f32) as usize;
            let cy = (v * (camera.height() - 1) as f32) as usize;
            let mx = (u * (mask.width() - 1) as f32) as usize;
            let my = (v * (mask.height() - 1) as f32) as usize;
            if mask.get(mx, my) > 0.5 {
                let p = camera.rgb(cx, cy);
                fg_sum = add3(fg_sum, p);
                fg_n += 1.0;
            }

            let bx = (u * (background.width() - 1) as f32) as usize;
            let by = (v * (background.height() - 1) as f32) as usize;
            bg_sum = add3(bg_sum, background.rgb(bx, by));
        }
    }

    let bg_n = (MATCH_GRID * MATCH_GRID) as f32;
    if fg_n < 8.0 {
        return [1.0; 3];
    }

    let mut gain = [1.0f32; 3];
    for c in 0..3 {
        let fg_mean = fg_sum[c] / fg_n;
        let bg_mean = bg_sum[c] / bg_n;
        if bg_mean > 1e-3 {
            let g = (fg_mean / bg_mean).clamp(0.7, 1.4);
            gain[c] = mix(1.0, g, strength);
        }
    }
    gain
}

// ---------------------------------------------------------------------------
// Crop
// ---------------------------------------------------------------------------

/// Sample the sub-rectangle `offset + uv * size` of `src` into `out`.
pub fn crop_frame(src: &Frame, offset: (f32, f32), size: (f32, f32), out: &mut Frame) {
    let w = out.width();
    let h = out.height();
    for y in 0..h {
        for x in 0..w {
            let u = offset.0 + (x as f32 / (w - 1).max(1) as f32) * size.0;
            let v = offset.1 + (y as f32 / (h - 1).max(1) as f32) * size.1;
            let p = src.sample_bilinear(
                u * (src.width() - 1) as f32,
                v * (src.height() - 1) as f32,
            );
            out.set_rgb(x, y, p);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform_mask(w: usize, h: usize, v: f32) -> Image<f32> {
        let mut m = Image::new(w, h);
        m.fill(v);
        m
    }

    #[test]
    fn test_saturated_mask_passes_camera() {
        // mask == 1 everywhere: output equals the camera frame within 1/255.
        let mut camera = Frame::new(16, 16);
        for y in 0..16 {
            for x in 0..16 {
                camera.set_rgb(x, y, [x as f32 / 15.0, y as f32 / 15.0, 0.4]);
            }
        }
        let mask = uniform_mask(16, 16, 1.0);
        let bg = BackgroundSource::Color([0.0, 1.0, 0.0]);
        let mut out = Frame::new(16, 16);
        composite(&camera, &mask, &bg, &CompositeParams::default(), &mut out);
        for y in 0..16 {
            for x in 0..16 {
                let a = camera.rgb(x, y);
                let b = out.rgb(x, y);
                for c in 0..3 {
                    assert!((a[c] - b[c]).abs() <= 1.5 / 255.0, "({x},{y}) ch{c}");
                }
            }
        }
    }

    #[test]
    fn test_zero_mask_passes_background() {
        let mut camera = Frame::new(8, 8);
        camera.fill_rgb([1.0, 1.0, 1.0]);
        let mask = uniform_mask(8, 8, 0.0);
        let bg = BackgroundSource::Color([0.0, 0.0, 0.0]);
        let mut out = Frame::new(8, 8);
        composite(&camera, &mask, &bg, &CompositeParams::default(), &mut out);
        for y in 0..8 {
            for x in 0..8 {
                assert_eq!(out.rgb(x, y), [0.0, 0.0, 0.0], "({x},{y})");
            }
        }
    }

    #[test]
    fn test_transition_zone_recovers_foreground() {
        // Gray observed pixel halfway between a white person and a black
        // old background, composited over a green new background. The
        // matte should attribute ~0.5 opacity and recovery should add the
        // new background's contribution.
        let w = 33;
        let mut camera = Frame::new(w, 9);
        let mut mask = Image::new(w, 9);
        for y in 0..9 {
            for x in 0..w {
                // Mask ramps from 1 (left, white camera) to 0 (right, black).
                let m = 1.0 - x as f32 / (w - 1) as f32;
                mask.set(x, y, m);
                let c = m; // camera brightness tracks the mask
                camera.set_rgb(x, y, [c, c, c]);
            }
        }
        let bg = BackgroundSource::Color([0.0, 0.5, 0.0]);
        let mut out = Frame::new(w, 9);
        composite(&camera, &mask, &bg, &CompositeParams::default(), &mut out);

        // Mid-transition pixel: green channel picks up new background.
        let mid = out.rgb(w / 2, 4);
        assert!(
            mid[1] > mid[0] + 0.05,
            "recovery bleeds new bg into the mixed pixel: {mid:?}"
        );
    }

    #[test]
    fn test_background_fixed_reverse_transform() {
        // Background is a horizontal ramp; with a centred half-size crop
        // and background_fixed, the composite must sample the *unzoomed*
        // ramp position.
        let mut bg_frame = Frame::new(32, 8);
        for y in 0..8 {
            for x in 0..32 {
                bg_frame.set_rgb(x, y, [x as f32 / 31.0, 0.0, 0.0]);
            }
        }
        let camera = Frame::new(32, 8);
        let mask = uniform_mask(32, 8, 0.0);
        let bg = BackgroundSource::Frame(&bg_frame);

        let fixed = CompositeParams {
            crop_offset: (0.25, 0.25),
            crop_size: (0.5, 0.5),
            background_fixed: true,
            ..Default::default()
        };
        let mut out_fixed = Frame::new(32, 8);
        composite(&camera, &mask, &bg, &fixed, &mut out_fixed);

        let mut out_plain = Frame::new(32, 8);
        composite(&camera, &mask, &bg, &CompositeParams::default(), &mut out_plain);

        // At u = 0.25 the fixed path samples (0.25-0.25)/0.5 = 0.0.
        let u25 = 8; // x/31 ~ 0.258
        assert!(
            out_fixed.rgb(u25, 4)[0] < out_plain.rgb(u25, 4)[0],
            "fixed background samples further left"
        );
    }

    #[test]
    fn test_light_wrap_only_touches_edge_band() {
        let mut composited = Frame::new(8, 8);
        composited.fill_rgb([1.0, 0.0, 0.0]);
        let bg = BackgroundSource::Color([0.0, 0.0, 1.0]);

        // Mask 0.5 = centre of the wrap band; mask 1.0 = outside it.
        let band_mask = uniform_mask(8, 8, 0.5);
        let solid_mask = uniform_mask(8, 8, 1.0);

        let mut wrapped = Frame::new(8, 8);
        light_wrap(&composited, &band_mask, &bg, &CompositeParams::default(), 0.06, &mut wrapped);
        assert!(wrapped.rgb(4, 4)[2] > 0.0, "band pixel picks up bg blue");

        light_wrap(&composited, &solid_mask, &bg, &CompositeParams::default(), 0.06, &mut wrapped);
        assert_eq!(wrapped.rgb(4, 4)[2], 0.0, "solid interior untouched");
    }

    #[test]
    fn test_color_match_gain_unity_without_foreground() {
        let camera = Frame::new(16, 16);
        let mask = uniform_mask(16, 16, 0.0);
        let mut bg = Frame::new(16, 16);
        bg.fill_rgb([0.5, 0.5, 0.5]);
        assert_eq!(color_match_gain(&camera, &mask, &bg, 0.2), [1.0; 3]);
    }

    #[test]
    fn test_color_match_gain_direction_and_clamp() {
        // Bright foreground over a dark background image: gain > 1, but
        // clamped at 1.4 before the strength blend.
        let mut camera = Frame::new(16, 16);
        camera.fill_rgb([0.9, 0.9, 0.9]);
        let mask = uniform_mask(16, 16, 1.0);
        let mut bg = Frame::new(16, 16);
        bg.fill_rgb([0.1, 0.1, 0.1]);

        let gain = color_match_gain(&camera, &mask, &bg, 1.0);
        for c in gain {
            assert!((c - 1.4).abs() < 1e-5, "clamped at 1.4: {c}");
        }

        let gentle = color_match_gain(&camera, &mask, &bg, 0.2);
        for c in gentle {
            assert!((c - 1.08).abs() < 1e-5, "strength 0.2 blends toward 1: {c}");
        }
    }

    #[test]
    fn test_crop_frame_identity() {
        let mut src = Frame::new(8, 8);
        for y in 0..8 {
            for x in 0..8 {
                src.set_rgb(x, y, [x as f32 / 7.0, y as f32 / 7.0, 0.0]);
            }
        }
        let mut out = Frame::new(8, 8);
        crop_frame(&src, (0.0, 0.0), (1.0, 1.0), &mut out);
        for y in 0..8 {
            for x in 0..8 {
                let a = src.rgb(x, y);
                let b = out.rgb(x, y);
                assert!((a[0] - b[0]).abs() < 0.01 && (a[1] - b[1]).abs() < 0.01);
            }
        }
    }

    #[test]
    fn test_crop_frame_zooms() {
        let mut src = Frame::new(16, 16);
        for y in 0..16 {
            for x in 0..16 {
                src.set_rgb(x, y, [x as f32 / 15.0, 0.0, 0.0]);
            }
        }
        let mut out = Frame::new(16, 16);
        crop_frame(&src, (0.25, 0.25), (0.5, 0.5), &mut out);
        // Output spans source u in [0.25, 0.75].
        assert!((out.rgb(0, 8)[0] - 0.25).abs() < 0.05);
        assert!((out.rgb(15, 8)[0] - 0.75).abs() < 0.05);
    }
}
