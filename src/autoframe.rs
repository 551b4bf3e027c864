// autoframe.rs — Mask-driven auto-framing.
//
// Derives a smoothed square crop that keeps the person filling the frame
// with their head in the upper third. The target crop is recomputed on
// every fresh mask from the person's weighted bounding box; the published
// crop chases the target with an EMA so camera noise and breathing don't
// translate into visible zoom jitter.

use crate::image::Image;
use crate::math::mix;

// ---------------------------------------------------------------------------
// CropRect
// ---------------------------------------------------------------------------

/// A normalised square crop. Invariants: `w == h == 1/zoom`,
/// `zoom ∈ [min_zoom, max_zoom]`, and the rectangle lies inside [0,1]².
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CropRect {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub zoom: f32,
}

impl CropRect {
    /// The identity crop (whole frame, zoom 1).
    pub fn full() -> Self {
        CropRect { x: 0.0, y: 0.0, w: 1.0, h: 1.0, zoom: 1.0 }
    }

    /// Zooms at or below this are treated as "no crop" by the processor.
    pub const NO_CROP_ZOOM: f32 = 1.02;

    pub fn is_effective(&self) -> bool {
        self.zoom > Self::NO_CROP_ZOOM
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// What steers the framer: the segmentation mask, or face boxes supplied
/// by the host through `update_from_face`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AutoFrameMode {
    Mask,
    Face,
}

/// Auto-framer behaviour.
#[derive(Clone, Copy, Debug)]
pub struct AutoFrameOptions {
    pub enabled: bool,
    pub mode: AutoFrameMode,
    /// Keep tracking after the first lock (`true`) or freeze the crop once
    /// it has settled, 30 frames after the first detection (`false`).
    pub continuous: bool,
    /// Fraction of the crop the person's bbox should fill.
    pub target_fill: f32,
    /// Vertical placement: the crop's top edge sits this many crop-heights
    /// above the person centroid (larger pushes the head up).
    pub headroom: f32,
    /// Extra padding applied to the detected bbox before fitting.
    pub padding: f32,
    /// EMA retention factor: smoothed = smoothed*s + target*(1-s).
    pub smoothing: f32,
    pub min_zoom: f32,
    pub max_zoom: f32,
    /// Minimum normalised target movement before the smoothed crop chases it.
    pub dead_zone: f32,
}

impl Default for AutoFrameOptions {
    fn default() -> Self {
        AutoFrameOptions {
            enabled: false,
            mode: AutoFrameMode::Mask,
            continuous: true,
            target_fill: 0.9,
            headroom: 0.55,
            padding: 0.05,
            smoothing: 0.75,
            min_zoom: 1.0,
            max_zoom: 1.5,
            dead_zone: 0.01,
        }
    }
}

// ---------------------------------------------------------------------------
// AutoFramer
// ---------------------------------------------------------------------------

/// State: the smoothed crop persists across frames; the target is
/// recomputed on each new mask.
pub struct AutoFramer {
    options: AutoFrameOptions,
    smoothed: CropRect,
    /// False until the first accepted detection (first frame snaps).
    locked_on: bool,
    frames_since_lock: u32,
}

/// Minimum normalised bbox area for a detection to steer the framer.
const MIN_BBOX_AREA: f32 = 0.01;

/// Frames after first lock at which a non-continuous framer freezes.
const SETTLE_FRAMES: u32 = 30;

impl AutoFramer {
    pub fn new(options: AutoFrameOptions) -> Self {
        AutoFramer {
            options,
            smoothed: CropRect::full(),
            locked_on: false,
            frames_since_lock: 0,
        }
    }

    /// The current smoothed crop.
    pub fn crop(&self) -> CropRect {
        self.smoothed
    }

    /// Feed one fresh mask. Returns the updated smoothed crop.
    pub fn update_from_mask(&mut self, mask: &Image<f32>) -> CropRect {
        let mw = mask.width();
        let mh = mask.height();

        // Weighted bbox + centroid over pixels above 0.5.
        let mut min_x = usize::MAX;
        let mut min_y = usize::MAX;
        let mut max_x = 0usize;
        let mut max_y = 0usize;
        let mut wsum = 0.0f32;
        let mut cx = 0.0f32;
        let mut cy = 0.0f32;
        for (x, y, v) in mask.pixels() {
            if v > 0.5 {
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);
                wsum += v;
                cx += x as f32 * v;
                cy += y as f32 * v;
            }
        }

        if wsum < 1.0 {
            return self.smoothed;
        }

        let bw = (max_x - min_x + 1) as f32 / mw as f32;
        let bh = (max_y - min_y + 1) as f32 / mh as f32;
        if bw * bh < MIN_BBOX_AREA {
            return self.smoothed;
        }

        let center_x = cx / wsum / mw as f32;
        let center_y = cy / wsum / mh as f32;
        let extent = bw.max(bh) + 2.0 * self.options.padding;

        self.update_from_target(center_x, center_y, extent)
    }

    /// Feed an externally detected face box (normalised). The body is
    /// extrapolated downward from the face: shoulders span about three
    /// face widths and the torso extends roughly four face heights.
    pub fn update_from_face(&mut self, x: f32, y: f32, w: f32, h: f32) -> CropRect {
        let body_w = (w * 3.0).min(1.0);
        let body_h = (h * 4.5).min(1.0);
        let center_x = x + w / 2.0;
        // Face occupies the top of the body box.
        let center_y = (y + body_h * 0.45).min(1.0);
        let extent = body_w.max(body_h) + 2.0 * self.options.padding;
        self.update_from_target(center_x, center_y, extent)
    }

    fn update_from_target(&mut self, center_x: f32, center_y: f32, extent: f32) -> CropRect {
        if !self.options.continuous && self.locked_on && self.frames_since_lock > SETTLE_FRAMES {
            self.frames_since_lock += 1;
            return self.smoothed;
        }

        let zoom = (self.options.target_fill / extent.max(1e-3))
            .clamp(self.options.min_zoom, self.options.max_zoom);
        let size = 1.0 / zoom;

        // Head in the upper third: the crop's top edge sits vert_offset
        // crop-heights above the person centroid, slightly more for small
        // (distant) subjects.
        let vert_offset = self.options.headroom + (1.0 - extent.min(1.0)) * 0.03;
        let mut target = CropRect {
            x: center_x - size / 2.0,
            y: center_y - size * vert_offset,
            w: size,
            h: size,
            zoom,
        };
        clamp_into_frame(&mut target);

        if !self.locked_on {
            self.locked_on = true;
            self.frames_since_lock = 1;
            self.smoothed = target;
            return self.smoothed;
        }
        self.frames_since_lock += 1;

        // Dead zone: ignore sub-threshold target drift.
        let drift = (target.x - self.smoothed.x)
            .abs()
            .max((target.y - self.smoothed.y).abs())
            .max((target.zoom - self.smoothed.zoom).abs());
        if drift < self.options.dead_zone {
            return self.smoothed;
        }

        // Smooth zoom and position; size is re-derived from the smoothed
        // zoom so w = h = 1/zoom survives the EMA.
        let s = self.options.smoothing;
        let new_zoom = mix(target.zoom, self.smoothed.zoom, s);
        let new_size = 1.0 / new_zoom;
        self.smoothed = CropRect {
            x: mix(target.x, self.smoothed.x, s),
            y: mix(target.y, self.smoothed.y, s),
            w: new_size,
            h: new_size,
            zoom: new_zoom,
        };
        clamp_into_frame(&mut self.smoothed);
        self.smoothed
    }

    /// Drop the lock and return to the identity crop.
    pub fn reset(&mut self) {
        self.smoothed = CropRect::full();
        self.locked_on = false;
        self.frames_since_lock = 0;
    }
}

/// Clamp a crop into [0,1]² preserving its size.
fn clamp_into_frame(c: &mut CropRect) {
    c.w = c.w.clamp(0.0, 1.0);
    c.h = c.h.clamp(0.0, 1.0);
    c.x = c.x.clamp(0.0, 1.0 - c.w);
    c.y = c.y.clamp(0.0, 1.0 - c.h);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Mask with a solid box of the given normalised size, centred.
    fn box_mask(m: usize, cx: f32, cy: f32, bw: f32, bh: f32) -> Image<f32> {
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
        img
    }

    fn framer(max_zoom: f32) -> AutoFramer {
        AutoFramer::new(AutoFrameOptions {
            enabled: true,
            max_zoom,
            padding: 0.0,
            dead_zone: 0.0,
            ..Default::default()
        })
    }

    #[test]
    fn test_empty_mask_holds_crop() {
        let mut f = framer(1.5);
        let empty = Image::new(64, 64);
        let crop = f.update_from_mask(&empty);
        assert_eq!(crop, CropRect::full(), "no detection leaves the identity crop");
    }

    #[test]
    fn test_first_detection_snaps() {
        let mut f = framer(1.5);
        let mask = box_mask(64, 0.5, 0.5, 0.3, 0.3);
        let crop = f.update_from_mask(&mask);
        assert!(crop.zoom > 1.4, "snaps straight to the clamped target: {}", crop.zoom);
    }

    #[test]
    fn test_zoom_clamped_to_max() {
        // bbox 0.3 wide: unclamped zoom would be 0.9/0.3 = 3.0.
        let mut f = framer(1.5);
        let mask = box_mask(64, 0.5, 0.5, 0.3, 0.3);
        let crop = f.update_from_mask(&mask);
        assert!((crop.zoom - 1.5).abs() < 1e-5, "clamped to max_zoom: {}", crop.zoom);
        assert!((crop.w - 1.0 / 1.5).abs() < 1e-5, "w = 1/zoom");
        assert_eq!(crop.w, crop.h, "square crop");
    }

    #[test]
    fn test_smoothing_approaches_target_asymptotically() {
        // Generous max_zoom so the target (0.9 / 0.3 = 3.0) is not clamped.
        let mut f = framer(4.0);
        for width in [0.3f32, 0.302, 0.299, 0.298] {
            let mask = box_mask(128, 0.5, 0.5, width, width);
            f.update_from_mask(&mask);
        }
        let z = f.crop().zoom;
        assert!(z > 2.7 && z <= 3.2, "smoothed zoom near 3.0: {z}");

        // Feed the same bbox repeatedly; each step closes 25% of the gap.
        let mask = box_mask(128, 0.5, 0.5, 0.3, 0.3);
        let before = (f.crop().zoom - 3.0).abs();
        f.update_from_mask(&mask);
        let after = (f.crop().zoom - 3.0).abs();
        assert!(after <= before, "monotone approach");
    }

    #[test]
    fn test_crop_stays_inside_frame() {
        let mut f = framer(2.0);
        // Person at the far left edge.
        let mask = box_mask(64, 0.05, 0.5, 0.2, 0.6);
        for _ in 0..5 {
            let c = f.update_from_mask(&mask);
            assert!(c.x >= 0.0 && c.y >= 0.0, "{c:?}");
            assert!(c.x + c.w <= 1.0 + 1e-5 && c.y + c.h <= 1.0 + 1e-5, "{c:?}");
            assert!((c.w - 1.0 / c.zoom).abs() < 1e-4, "w tracks 1/zoom");
        }
    }

    #[test]
    fn test_dead_zone_suppresses_jitter() {
        let mut f = AutoFramer::new(AutoFrameOptions {
            enabled: true,
            max_zoom: 2.0,
            padding: 0.0,
            dead_zone: 0.05,
            ..Default::default()
        });
        let mask = box_mask(128, 0.5, 0.5, 0.4, 0.4);
        let first = f.update_from_mask(&mask);
        // A 1-pixel bbox wobble is far below the dead zone.
        let wobble = box_mask(128, 0.505, 0.5, 0.4, 0.4);
        let second = f.update_from_mask(&wobble);
        assert_eq!(first, second, "sub-threshold drift ignored");
    }

    #[test]
    fn test_non_continuous_freezes_after_settling() {
        let mut f = AutoFramer::new(AutoFrameOptions {
            enabled: true,
            continuous: false,
            max_zoom: 2.0,
            padding: 0.0,
            dead_zone: 0.0,
            ..Default::default()
        });
        let mask = box_mask(64, 0.5, 0.5, 0.5, 0.5);
        for _ in 0..40 {
            f.update_from_mask(&mask);
        }
        let settled = f.crop();
        // A big subject move after settling must not move the crop.
        let moved = box_mask(64, 0.2, 0.5, 0.5, 0.5);
        let after = f.update_from_mask(&moved);
        assert_eq!(settled, after, "frozen after 30 frames");
    }

    #[test]
    fn test_update_from_face_extends_body() {
        let mut f = framer(3.0);
        // Small face near the top.
        let crop = f.update_from_face(0.45, 0.1, 0.1, 0.12);
        assert!(crop.is_effective(), "face lock produces a real crop");
        // Crop centre sits below the face (body extends downward).
        assert!(crop.y + crop.h / 2.0 > 0.16, "{crop:?}");
    }

    #[test]
    fn test_reset_returns_identity() {
        let mut f = framer(2.0);
        f.update_from_mask(&box_mask(64, 0.5, 0.5, 0.4, 0.4));
        assert!(f.crop().is_effective());
        f.reset();
        assert_eq!(f.crop(), CropRect::full());
    }
}
