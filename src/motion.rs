// motion.rs — Person bounding box and centroid velocity tracking.
//
// Between model frames the person keeps moving; the orchestrator translates
// the stale mask by a predicted shift instead of letting it trail behind.
// The prediction comes from here: three horizontal centroids (top / middle /
// bottom thirds of the person bbox, so a lean or a wave is tracked
// separately from a whole-body slide) plus one vertical centroid, each with
// an EMA-smoothed velocity.
//
// First detection after init or reset() only seeds the history — velocities
// stay zero, so a person walking into frame never causes a shift spike.

use crate::image::Image;

/// Confidence above which a pixel counts as "person" for bbox and
/// centroid purposes.
pub const PERSON_THRESHOLD: f32 = 0.5;

// ---------------------------------------------------------------------------
// PixelBox
// ---------------------------------------------------------------------------

/// Inclusive pixel-space bounding box in mask coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelBox {
    pub min_x: usize,
    pub min_y: usize,
    pub max_x: usize,
    pub max_y: usize,
}

impl PixelBox {
    /// Running-min/max accumulator seed: an empty box any pixel extends.
    pub fn empty() -> Self {
        PixelBox { min_x: usize::MAX, min_y: usize::MAX, max_x: 0, max_y: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.min_x > self.max_x || self.min_y > self.max_y
    }

    #[inline]
    pub fn include(&mut self, x: usize, y: usize) {
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
    }

    pub fn width(&self) -> usize {
        self.max_x - self.min_x + 1
    }

    pub fn height(&self) -> usize {
        self.max_y - self.min_y + 1
    }

    /// True if the box touches any edge of an m x n mask.
    pub fn at_edge(&self, m: usize, n: usize) -> bool {
        self.min_x == 0 || self.min_y == 0 || self.max_x + 1 >= m || self.max_y + 1 >= n
    }
}

/// Scan a full mask for the person bbox. The ROI back-map path computes
/// this in the same pass as the copy; this standalone scan serves the
/// non-crop path.
pub fn scan_bbox(mask: &Image<f32>) -> Option<PixelBox> {
    let mut bbox = PixelBox::empty();
    for (x, y, v) in mask.pixels() {
        if v > PERSON_THRESHOLD {
            bbox.include(x, y);
        }
    }
    if bbox.is_empty() {
        None
    } else {
        Some(bbox)
    }
}

// ---------------------------------------------------------------------------
// MotionVector
// ---------------------------------------------------------------------------

/// EMA-smoothed centroid velocities in normalised units per model frame.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MotionVector {
    /// Horizontal velocity per bbox third: [top, middle, bottom].
    pub vx: [f32; 3],
    /// Vertical velocity of the whole-bbox centroid.
    pub vy: f32,
}

impl MotionVector {
    /// `sqrt(max |vx|² + vy²)` — the scalar the orchestrator feeds into
    /// the model-rate speedup.
    pub fn magnitude(&self) -> f32 {
        let max_vx = self.vx.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        (max_vx * max_vx + self.vy * self.vy).sqrt()
    }
}

// ---------------------------------------------------------------------------
// CentroidTracker
// ---------------------------------------------------------------------------

/// EMA retention of the previous velocity (new = 0.8·raw + 0.2·old).
const VELOCITY_EMA: f32 = 0.8;

pub struct CentroidTracker {
    /// Previous horizontal centroids per band, normalised. None until the
    /// first detection seeds the history.
    prev_cx: Option<[f32; 3]>,
    prev_cy: f32,
    velocity: MotionVector,
}

impl CentroidTracker {
    pub fn new() -> Self {
        CentroidTracker { prev_cx: None, prev_cy: 0.0, velocity: MotionVector::default() }
    }

    pub fn velocity(&self) -> MotionVector {
        self.velocity
    }

    /// Feed one fresh detection. Computes value-weighted centroids over the
    /// bbox (X per vertical third, Y overall), then updates the EMA
    /// velocities. The first observation after `new()` / `reset()` is
    /// seed-only.
    pub fn observe(&mut self, mask: &Image<f32>, bbox: PixelBox) {
        let m = mask.width() as f32;
        let n = mask.height() as f32;

        let band_h = (bbox.height() as f32 / 3.0).max(1.0);
        let mut band_sum = [0.0f32; 3];
        let mut band_wx = [0.0f32; 3];
        let mut cy_sum = 0.0f32;
        let mut cy_w = 0.0f32;

        for y in bbox.min_y..=bbox.max_y {
            let band = (((y - bbox.min_y) as f32 / band_h) as usize).min(2);
            for x in bbox.min_x..=bbox.max_x {
                let v = mask.get(x, y);
                if v > PERSON_THRESHOLD {
                    band_sum[band] += x as f32 * v;
                    band_wx[band] += v;
                    cy_sum += y as f32 * v;
                    cy_w += v;
                }
            }
        }

        if cy_w <= 0.0 {
            return;
        }

        let mut cx = [0.0f32; 3];
        for band in 0..3 {
            cx[band] = if band_wx[band] > 0.0 {
                band_sum[band] / band_wx[band] / m
            } else {
                // Empty band inherits the whole-box horizontal centre so
                // its velocity reads as zero rather than a jump to 0.
                self.prev_cx.map(|p| p[band]).unwrap_or(
                    (bbox.min_x + bbox.max_x) as f32 / 2.0 / m,
                )
            };
        }
        let cy = cy_sum / cy_w / n;

        match self.prev_cx {
            None => {
                // Seed only; no velocity on first detection.
                self.prev_cx = Some(cx);
                self.prev_cy = cy;
            }
            Some(prev) => {
                for band in 0..3 {
                    let raw = cx[band] - prev[band];
                    self.velocity.vx[band] =
                        VELOCITY_EMA * raw + (1.0 - VELOCITY_EMA) * self.velocity.vx[band];
                }
                let raw_y = cy - self.prev_cy;
                self.velocity.vy = VELOCITY_EMA * raw_y + (1.0 - VELOCITY_EMA) * self.velocity.vy;
                self.prev_cx = Some(cx);
                self.prev_cy = cy;
            }
        }
    }

    /// Clear history and velocities. The next observation is seed-only.
    pub fn reset(&mut self) {
        self.prev_cx = None;
        self.prev_cy = 0.0;
        self.velocity = MotionVector::default();
    }
}

impl Default for CentroidTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 64x64 mask with a solid box centred at normalised (cx, cy).
    fn mask_with_box(cx: f32, cy: f32, bw: f32, bh: f32) -> (Image<f32>, PixelBox) {
        let m = 64;
        let mut img = Image::new(m, m);
        let x0 = ((cx - bw / 2.0) * m as f32) as usize;
        let y0 = ((cy - bh / 2.0) * m as f32) as usize;
        let x1 = (((cx + bw / 2.0) * m as f32) as usize).min(m - 1);
        let y1 = (((cy + bh / 2.0) * m as f32) as usize).min(m - 1);
        for y in y0..=y1 {
            for x in x0..=x1 {
                img.set(x, y, 1.0);
            }
        }
        (img, PixelBox { min_x: x0, min_y: y0, max_x: x1, max_y: y1 })
    }

    #[test]
    fn test_scan_bbox_finds_box() {
        let (mask, expected) = mask_with_box(0.5, 0.5, 0.25, 0.25);
        assert_eq!(scan_bbox(&mask), Some(expected));
    }

    #[test]
    fn test_scan_bbox_empty_mask() {
        assert_eq!(scan_bbox(&Image::new(32, 32)), None);
    }

    #[test]
    fn test_first_observation_is_seed_only() {
        let mut tracker = CentroidTracker::new();
        let (mask, bbox) = mask_with_box(0.5, 0.5, 0.25, 0.5);
        tracker.observe(&mask, bbox);
        assert_eq!(tracker.velocity(), MotionVector::default(), "seed produces no velocity");
    }

    #[test]
    fn test_velocity_converges_to_step_size() {
        // Centroids at 0.50, 0.52, 0.54, 0.56: raw velocity 0.02 each
        // frame; after the EMA warms up, vx ≈ 0.02.
        let mut tracker = CentroidTracker::new();
        for (i, cx) in [0.50f32, 0.52, 0.54, 0.56].iter().enumerate() {
            let (mask, bbox) = mask_with_box(*cx, 0.5, 0.25, 0.5);
            tracker.observe(&mask, bbox);
            if i == 0 {
                assert_eq!(tracker.velocity().vx[0], 0.0);
            }
        }
        let v = tracker.velocity();
        // Rasterisation quantises the 0.02 steps to 1/64; the EMA-warmed
        // velocity lands a little under the nominal step.
        for band in 0..3 {
            assert!(
                v.vx[band] > 0.010 && v.vx[band] < 0.022,
                "band {band} velocity near the step size: {}",
                v.vx[band]
            );
        }
        assert!(v.vy.abs() < 1e-3, "no vertical motion");
    }

    #[test]
    fn test_vertical_velocity() {
        let mut tracker = CentroidTracker::new();
        for cy in [0.4f32, 0.45, 0.5] {
            let (mask, bbox) = mask_with_box(0.5, cy, 0.4, 0.3);
            tracker.observe(&mask, bbox);
        }
        assert!(tracker.velocity().vy > 0.02, "downward motion: {}", tracker.velocity().vy);
        assert!(tracker.velocity().vx[1].abs() < 1e-3);
    }

    #[test]
    fn test_reset_clears_and_reseeds() {
        let mut tracker = CentroidTracker::new();
        for cx in [0.3f32, 0.4, 0.5] {
            let (mask, bbox) = mask_with_box(cx, 0.5, 0.2, 0.4);
            tracker.observe(&mask, bbox);
        }
        assert!(tracker.velocity().magnitude() > 0.0);

        tracker.reset();
        assert_eq!(tracker.velocity(), MotionVector::default());

        // A large jump right after reset must not spike: first observation
        // re-seeds.
        let (mask, bbox) = mask_with_box(0.9, 0.5, 0.2, 0.4);
        tracker.observe(&mask, bbox);
        assert_eq!(tracker.velocity(), MotionVector::default(), "post-reset observation seeds only");
    }

    #[test]
    fn test_magnitude_uses_max_band() {
        let v = MotionVector { vx: [0.01, -0.04, 0.02], vy: 0.03 };
        let expected = (0.04f32 * 0.04 + 0.03 * 0.03).sqrt();
        assert!((v.magnitude() - expected).abs() < 1e-6);
    }

    #[test]
    fn test_bbox_at_edge() {
        let b = PixelBox { min_x: 0, min_y: 10, max_x: 20, max_y: 30 };
        assert!(b.at_edge(64, 64), "touches left edge");
        let c = PixelBox { min_x: 5, min_y: 10, max_x: 20, max_y: 63 };
        assert!(c.at_edge(64, 64), "touches bottom edge");
        let d = PixelBox { min_x: 5, min_y: 10, max_x: 20, max_y: 30 };
        assert!(!d.at_edge(64, 64));
    }
}
