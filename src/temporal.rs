// temporal.rs — Temporal mask smoothing with asymmetric hysteresis.
//
// CPU reference for shaders/temporal.wgsl. The GPU kernel is validated
// against this implementation pixel-for-pixel.
//
// The raw model output flickers: confidence at the silhouette boundary
// oscillates frame to frame even for a motionless subject. This stage
// blends each new mask against the previous smoothed mask with two
// different rates — foreground appears fast, disappears slowly — so a
// momentary confidence dip does not punch a hole in the person.
//
// Where the motion map reports genuine movement the blend rates are pushed
// toward 1 so the mask keeps up with the subject instead of trailing it.
// The whole per-pixel path is branchless (select via step/mix) to match
// the shader exactly.

use crate::image::Image;
use crate::math::{mix, smoothstep, step};

/// Per-dispatch parameters of the temporal stage.
#[derive(Clone, Copy, Debug)]
pub struct TemporalParams {
    /// Blend rate when confidence is rising (foreground appearing).
    pub appear: f32,
    /// Blend rate when confidence is falling. Lower than `appear`, so the
    /// silhouette decays slower than it grows.
    pub disappear: f32,
    /// Soft-threshold half-width around 0.5.
    pub softness: f32,
    /// True until the first full pipeline dispatch completes. Forces the
    /// blend factor to 1 and skips the soft threshold, so the very first
    /// mask is adopted verbatim.
    pub first_frame: bool,
}

impl Default for TemporalParams {
    fn default() -> Self {
        TemporalParams {
            appear: 0.85,
            disappear: 0.75,
            softness: 0.25,
            first_frame: false,
        }
    }
}

/// Blend rates under confirmed motion: near-instant adoption.
const MOTION_APPEAR: f32 = 0.98;
const MOTION_DISAPPEAR: f32 = 0.95;

/// One temporal smoothing pass.
///
/// `current_raw` is the mask fresh from the producer, `previous` the result
/// of the last pass, `motion` the |mask_t − mask_{t−Δ}| map (absent on the
/// first fresh mask after init). All images share the mask resolution.
pub fn temporal_smooth(
    current_raw: &Image<f32>,
    previous: &Image<f32>,
    motion: Option<&Image<f32>>,
    params: &TemporalParams,
    out: &mut Image<f32>,
) {
    let w = current_raw.width();
    let h = current_raw.height();
    assert_eq!((previous.width(), previous.height()), (w, h), "previous mask dims");
    assert_eq!((out.width(), out.height()), (w, h), "output dims");

    if params.first_frame {
        out.copy_from(current_raw);
        return;
    }

    let lo = 0.5 - params.softness;
    let hi = 0.5 + params.softness;

    for y in 0..h {
        for x in 0..w {
            let current = smoothstep(lo, hi, current_raw.get(x, y));
            let prev = previous.get(x, y);

            let (appear, disappear) = match motion {
                Some(m) => {
                    let boost = smoothstep(0.03, 0.2, m.get(x, y));
                    (
                        mix(params.appear, MOTION_APPEAR, boost),
                        mix(params.disappear, MOTION_DISAPPEAR, boost),
                    )
                }
                None => (params.appear, params.disappear),
            };

            let alpha = mix(disappear, appear, step(prev, current));
            out.set(x, y, mix(prev, current, alpha));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform(w: usize, h: usize, v: f32) -> Image<f32> {
        let mut img = Image::new(w, h);
        img.fill(v);
        img
    }

    #[test]
    fn test_first_frame_adopts_raw_verbatim() {
        // The alpha = 1 path must reproduce the raw value exactly, even
        // values the soft threshold would otherwise remap.
        for c in [0.0f32, 0.3, 0.5, 0.62, 1.0] {
            let raw = uniform(8, 8, c);
            let prev = uniform(8, 8, 0.0);
            let mut out = Image::new(8, 8);
            let params = TemporalParams { first_frame: true, ..Default::default() };
            temporal_smooth(&raw, &prev, None, &params, &mut out);
            assert!(out.pixels().all(|(_, _, v)| v == c), "c = {c}");
        }
    }

    #[test]
    fn test_appear_faster_than_disappear() {
        let params = TemporalParams::default();

        // Rising confidence: prev 0, raw 1 (soft threshold keeps 1 at 1).
        let mut out_up = Image::new(4, 4);
        temporal_smooth(&uniform(4, 4, 1.0), &uniform(4, 4, 0.0), None, &params, &mut out_up);

        // Falling confidence: prev 1, raw 0.
        let mut out_down = Image::new(4, 4);
        temporal_smooth(&uniform(4, 4, 0.0), &uniform(4, 4, 1.0), None, &params, &mut out_down);

        let up = out_up.get(0, 0);
        let down = out_down.get(0, 0);
        assert!((up - params.appear).abs() < 1e-6, "rise reaches appear rate");
        assert!((down - (1.0 - params.disappear)).abs() < 1e-6, "fall leaves 1-disappear");
        assert!(up > 1.0 - down - 1e-6, "appear outpaces disappear");
    }

    #[test]
    fn test_soft_threshold_hardens_boundary() {
        // Values outside 0.5 +/- softness saturate before blending.
        let params = TemporalParams { softness: 0.25, ..Default::default() };
        let mut out = Image::new(2, 2);
        temporal_smooth(&uniform(2, 2, 0.2), &uniform(2, 2, 0.0), None, &params, &mut out);
        assert_eq!(out.get(0, 0), 0.0, "0.2 is below the 0.25 lower edge");

        temporal_smooth(&uniform(2, 2, 0.8), &uniform(2, 2, 1.0), None, &params, &mut out);
        assert_eq!(out.get(0, 0), 1.0, "0.8 is above the 0.75 upper edge");
    }

    #[test]
    fn test_motion_boost_raises_rates() {
        let params = TemporalParams { appear: 0.7, disappear: 0.6, ..Default::default() };
        let motion = uniform(2, 2, 0.5); // far above the 0.2 upper edge

        let mut with_motion = Image::new(2, 2);
        temporal_smooth(
            &uniform(2, 2, 1.0),
            &uniform(2, 2, 0.0),
            Some(&motion),
            &params,
            &mut with_motion,
        );
        assert!((with_motion.get(0, 0) - MOTION_APPEAR).abs() < 1e-6);

        let mut falling = Image::new(2, 2);
        temporal_smooth(
            &uniform(2, 2, 0.0),
            &uniform(2, 2, 1.0),
            Some(&motion),
            &params,
            &mut falling,
        );
        assert!((falling.get(0, 0) - (1.0 - MOTION_DISAPPEAR)).abs() < 1e-6);
    }

    #[test]
    fn test_zero_motion_keeps_base_rates() {
        let params = TemporalParams { appear: 0.7, disappear: 0.6, ..Default::default() };
        let motion = uniform(2, 2, 0.0);
        let mut out = Image::new(2, 2);
        temporal_smooth(
            &uniform(2, 2, 1.0),
            &uniform(2, 2, 0.0),
            Some(&motion),
            &params,
            &mut out,
        );
        assert!((out.get(0, 0) - 0.7).abs() < 1e-6, "motion 0 behaves like no map");
    }

    #[test]
    fn test_converges_to_stable_value() {
        // Repeated application with a constant input converges to it.
        let params = TemporalParams::default();
        let raw = uniform(4, 4, 1.0);
        let mut prev = uniform(4, 4, 0.0);
        let mut out = Image::new(4, 4);
        for _ in 0..20 {
            temporal_smooth(&raw, &prev, None, &params, &mut out);
            prev.copy_from(&out);
        }
        assert!(prev.get(2, 2) > 0.999, "converged: {}", prev.get(2, 2));
    }
}
