// adapter.rs — Mask producer adapter.
//
// Sits between the orchestrator and the external model. Owns the model
// handle, the scratch tile the (cropped) frame is downscaled into, and all
// the per-frame mask buffers. One call does the whole round trip:
//
//   rasterize ROI → infer → extract person class → back-map into
//   full-frame space (+ bbox in the same pass) → centroid/velocity
//   update → motion map
//
// Inference failures never propagate: the call reports `Failed`, the
// previous full-frame mask stays available, and the frame downgrades to
// interpolation in the orchestrator.
//
// Buffer discipline: every buffer here is allocated at construction and
// reused; only a model-resolution change (quality tier) reallocates the
// model-space buffers.

use std::time::Instant;

use tracing::debug;

use crate::frame::Frame;
use crate::image::Image;
use crate::motion::{scan_bbox, CentroidTracker, MotionVector, PixelBox, PERSON_THRESHOLD};
use crate::producer::{extract_person_confidence, MaskProducer};

// ---------------------------------------------------------------------------
// CropRegion
// ---------------------------------------------------------------------------

/// Normalised region-of-interest rectangle: x, y, w, h in [0, 1] with
/// x+w <= 1 and y+h <= 1. Lifetime is one model call.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CropRegion {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl CropRegion {
    pub fn full() -> Self {
        CropRegion { x: 0.0, y: 0.0, w: 1.0, h: 1.0 }
    }

    /// Clamp into the unit square, preserving size where possible.
    pub fn clamped(mut self) -> Self {
        self.w = self.w.clamp(0.0, 1.0);
        self.h = self.h.clamp(0.0, 1.0);
        self.x = self.x.clamp(0.0, 1.0 - self.w);
        self.y = self.y.clamp(0.0, 1.0 - self.h);
        self
    }

    pub fn is_valid(&self) -> bool {
        self.x >= 0.0
            && self.y >= 0.0
            && self.w >= 0.0
            && self.h >= 0.0
            && self.x + self.w <= 1.0 + 1e-6
            && self.y + self.h <= 1.0 + 1e-6
    }
}

/// Outcome of one `segment` call. On `Failed` the previous full-frame
/// mask (if any) is still available through `full_mask()`, but the caller
/// should run the frame as interpolation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentStatus {
    /// A new mask was computed and is current.
    Fresh,
    /// The producer errored; state is unchanged.
    Failed,
}

// ---------------------------------------------------------------------------
// ProducerAdapter
// ---------------------------------------------------------------------------

pub struct ProducerAdapter {
    producer: Box<dyn MaskProducer>,

    // Model-space dimensions (tile fed to the producer). Change with the
    // quality tier.
    model_w: usize,
    model_h: usize,
    // Full-frame mask dimensions. Fixed for the life of the adapter.
    full_w: usize,
    full_h: usize,

    // Reused buffers.
    scratch: Frame,
    person: Vec<f32>,
    crop_mask: Image<f32>,
    full_mask: Image<f32>,
    prev_full: Image<f32>,
    motion: Image<f32>,

    bbox: Option<PixelBox>,
    tracker: CentroidTracker,

    /// Successful inference count; the motion map is valid from the second.
    successes: u64,
    last_inference_ms: f64,
}

impl ProducerAdapter {
    /// `model_*` is the producer's input tile size; `full_*` the full-frame
    /// mask resolution the pipeline consumes (fixed at the tier-0 size).
    pub fn new(
        producer: Box<dyn MaskProducer>,
        model_w: usize,
        model_h: usize,
        full_w: usize,
        full_h: usize,
    ) -> Self {
        ProducerAdapter {
            producer,
            model_w,
            model_h,
            full_w,
            full_h,
            scratch: Frame::new(model_w, model_h),
            person: vec![0.0; model_w * model_h],
            crop_mask: Image::new(model_w, model_h),
            full_mask: Image::new(full_w, full_h),
            prev_full: Image::new(full_w, full_h),
            motion: Image::new(full_w, full_h),
            bbox: None,
            tracker: CentroidTracker::new(),
            successes: 0,
            last_inference_ms: 0.0,
        }
    }

    pub fn model_dims(&self) -> (usize, usize) {
        (self.model_w, self.model_h)
    }

    pub fn full_dims(&self) -> (usize, usize) {
        (self.full_w, self.full_h)
    }

    /// Change the producer tile size (quality tier change). Reallocates
    /// only the model-space buffers, and only when the size actually
    /// changed.
    pub fn set_model_dims(&mut self, w: usize, h: usize) {
        if w == self.model_w && h == self.model_h {
            return;
        }
        debug!(w, h, "resizing producer tile");
        self.model_w = w;
        self.model_h = h;
        self.scratch = Frame::new(w, h);
        self.person = vec![0.0; w * h];
        self.crop_mask = Image::new(w, h);
    }

    /// One inference round trip. `Fresh` means `full_mask()` now holds a
    /// new mask; `Failed` leaves all state (including any stale mask)
    /// untouched so the frame can run as interpolation.
    pub fn segment(
        &mut self,
        frame: &Frame,
        timestamp_ms: f64,
        crop: Option<CropRegion>,
    ) -> SegmentStatus {
        // 1. Rasterize the source region into the scratch tile.
        let region = crop.unwrap_or_else(CropRegion::full).clamped();
        self.rasterize(frame, region);

        // 2. Invoke the producer.
        let t0 = Instant::now();
        let maps = match self.producer.produce(&self.scratch, timestamp_ms) {
            Ok(maps) => maps,
            Err(e) => {
                debug!(error = %e, "producer failed, keeping previous mask");
                return SegmentStatus::Failed;
            }
        };
        self.last_inference_ms = t0.elapsed().as_secs_f64() * 1000.0;

        // 3. Person confidence into the crop-space mask.
        if !extract_person_confidence(&maps, &mut self.person) {
            return SegmentStatus::Failed;
        }
        for y in 0..self.model_h {
            let row = &self.person[y * self.model_w..(y + 1) * self.model_w];
            self.crop_mask.row_mut(y).copy_from_slice(row);
        }

        // 4/5. Back-map into full-frame space; bbox in the same pass.
        std::mem::swap(&mut self.full_mask, &mut self.prev_full);
        if crop.is_none() && (self.model_w, self.model_h) == (self.full_w, self.full_h) {
            self.full_mask.copy_from(&self.crop_mask);
            self.bbox = scan_bbox(&self.full_mask);
        } else {
            self.bbox = back_map(&self.crop_mask, region, &mut self.full_mask);
        }

        // 6. Centroids and velocities.
        if let Some(bbox) = self.bbox {
            self.tracker.observe(&self.full_mask, bbox);
        }

        // 7. Motion map, valid once two full-frame masks exist.
        self.successes += 1;
        if self.successes >= 2 {
            self.full_mask.absdiff_into(&self.prev_full, &mut self.motion);
        }

        SegmentStatus::Fresh
    }

    fn rasterize(&mut self, frame: &Frame, region: CropRegion) {
        let fw = frame.width() as f32;
        let fh = frame.height() as f32;
        let sx0 = region.x * fw;
        let sy0 = region.y * fh;
        let sw = region.w * fw;
        let sh = region.h * fh;
        for y in 0..self.model_h {
            for x in 0..self.model_w {
                let u = (x as f32 + 0.5) / self.model_w as f32;
                let v = (y as f32 + 0.5) / self.model_h as f32;
                let p = frame.sample_bilinear(sx0 + u * sw - 0.5, sy0 + v * sh - 0.5);
                self.scratch.set_rgb(x, y, p);
            }
        }
    }

    /// Cached person bbox, normalised and padded, or None when the last
    /// mask held no person.
    pub fn person_bbox(&self, padding: f32) -> Option<CropRegion> {
        let bbox = self.bbox?;
        let m = self.full_w as f32;
        let n = self.full_h as f32;
        let region = CropRegion {
            x: bbox.min_x as f32 / m - padding,
            y: bbox.min_y as f32 / n - padding,
            w: bbox.width() as f32 / m + 2.0 * padding,
            h: bbox.height() as f32 / n + 2.0 * padding,
        };
        Some(region.clamped())
    }

    /// Raw pixel-space bbox of the last mask.
    pub fn bbox(&self) -> Option<PixelBox> {
        self.bbox
    }

    pub fn motion_vector(&self) -> MotionVector {
        self.tracker.velocity()
    }

    /// The reused |current − previous| map, or None before the second
    /// successful inference.
    pub fn motion_map(&self) -> Option<&Image<f32>> {
        if self.successes >= 2 {
            Some(&self.motion)
        } else {
            None
        }
    }

    pub fn full_mask(&self) -> Option<&Image<f32>> {
        if self.successes > 0 {
            Some(&self.full_mask)
        } else {
            None
        }
    }

    pub fn last_inference_ms(&self) -> f64 {
        self.last_inference_ms
    }

    /// Forget all temporal state: velocities, masks, bbox. The producer's
    /// own recurrent state is reset too.
    pub fn reset(&mut self) {
        self.tracker.reset();
        self.producer.reset();
        self.bbox = None;
        self.successes = 0;
        self.full_mask.fill(0.0);
        self.prev_full.fill(0.0);
    }
}

/// Place a crop-space mask back into its ROI rectangle of the full-frame
/// mask (zeros elsewhere), updating the person bbox in the same pass.
///
/// Destination bounds are floor/ceil of the normalised region scaled to
/// full-mask pixels; each destination pixel maps to its source via
/// `sx = min(⌊(x − x0)·M/cw⌋, M−1)`.
fn back_map(
    crop_mask: &Image<f32>,
    region: CropRegion,
    full: &mut Image<f32>,
) -> Option<PixelBox> {
    let fw = full.width();
    let fh = full.height();
    let mw = crop_mask.width();
    let mh = crop_mask.height();

    full.fill(0.0);

    let x0 = (region.x * fw as f32).floor() as usize;
    let y0 = (region.y * fh as f32).floor() as usize;
    let x1 = (((region.x + region.w) * fw as f32).ceil() as usize).min(fw);
    let y1 = (((region.y + region.h) * fh as f32).ceil() as usize).min(fh);
    if x0 >= x1 || y0 >= y1 {
        return None;
    }
    let cw = (x1 - x0) as f32;
    let ch = (y1 - y0) as f32;

    let mut bbox = PixelBox::empty();
    for y in y0..y1 {
        let sy = (((y - y0) as f32 * mh as f32 / ch) as usize).min(mh - 1);
        for x in x0..x1 {
            let sx = (((x - x0) as f32 * mw as f32 / cw) as usize).min(mw - 1);
            let v = crop_mask.get(sx, sy);
            full.set(x, y, v);
            if v > PERSON_THRESHOLD {
                bbox.include(x, y);
            }
        }
    }

    if bbox.is_empty() {
        None
    } else {
        Some(bbox)
    }
}
