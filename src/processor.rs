// processor.rs — Top-level per-frame orchestrator.
//
// Drives everything: decides fresh-mask versus interpolation, schedules
// the producer (inline or worker), accumulates the motion-predicted shift
// across interpolated frames, smooths the ROI crop, forwards the
// auto-frame crop, applies tier changes, and feeds the diagnostics.
//
// CONTROL FLOW PER FRAME
//   1. apply any tier change the controller requested last frame
//   2. compute the motion-scaled effective model interval
//   3. forward the auto-frame crop to the pipeline
//   4. fresh mask available (or due, inline)?  → pipeline.process
//      otherwise                               → pipeline.process_interpolated
//   5. (worker) dispatch the next request if due, non-blocking
//   6. report frame time to the adaptive controller; record diagnostics
//
// The processor is a plain state machine — no coroutines, no locks. The
// only asynchrony is the worker's message channel, and at most one
// request is ever in flight.

use std::fmt;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::adaptive::{AdaptiveController, TierChange, TIER_TABLE};
use crate::adapter::{CropRegion, ProducerAdapter, SegmentStatus};
use crate::autoframe::{AutoFrameMode, AutoFramer};
use crate::config::{BackgroundMode, EngineOptions, OptionsUpdate};
use crate::diagnostics::{Diagnostics, DiagnosticSink, FrameStatus, FrameTimings};
use crate::frame::Frame;
use crate::motion::{MotionVector, PixelBox};
use crate::pipeline::{Compositor, PipelineError};
use crate::worker::{MaskReply, ProducerFactory, WorkerHandle, INIT_TIMEOUT};

// ---------------------------------------------------------------------------
// Tuning constants
// ---------------------------------------------------------------------------

/// Normalised padding around the detected person bbox for the ROI crop.
const ROI_PADDING: f32 = 0.08;

/// Motion-vector dead zone: below this the accumulated shift is zero.
const SHIFT_DEAD_ZONE: f32 = 0.003;

/// Per-axis clamp on the accumulated shift.
const SHIFT_CLAMP: f32 = 0.12;

/// ROI position change (normalised) above which the crop re-blends.
const ROI_POS_DEAD_ZONE: f32 = 0.03;

/// ROI size change above which the crop re-blends.
const ROI_SIZE_DEAD_ZONE: f32 = 0.015;

/// ROI blend retention when a change exceeds the dead zone.
const ROI_EMA: f32 = 0.5;

/// Hard floor on the effective model interval.
const MIN_MODEL_INTERVAL_MS: f64 = 16.0;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ProcessorError {
    /// Pipeline construction/init failed.
    Init(PipelineError),
    /// The GPU context is gone. The session is over; re-init everything.
    ContextLost,
}

impl fmt::Display for ProcessorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessorError::Init(e) => write!(f, "processor init failed: {e}"),
            ProcessorError::ContextLost => write!(f, "GPU context lost; re-init required"),
        }
    }
}

impl std::error::Error for ProcessorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProcessorError::Init(e) => Some(e),
            ProcessorError::ContextLost => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Producer routing
// ---------------------------------------------------------------------------

enum ProducerRoute {
    Inline(ProducerAdapter),
    Worker(WorkerHandle),
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

pub struct Processor<C: Compositor> {
    pipeline: C,
    route: ProducerRoute,
    options: EngineOptions,
    adaptive: AdaptiveController,
    framer: AutoFramer,
    diagnostics: Diagnostics,

    /// ROI handed to the next model call. Smoothed with a dead zone to
    /// stop the crop and the mask chasing each other.
    roi: Option<CropRegion>,
    /// Latest centroid velocities from the adapter/worker.
    motion: MotionVector,
    /// Consecutive interpolated frames since the last fresh mask.
    interp_frames: u32,
    last_model_run_ms: f64,
    /// Tier change to apply at the start of the next frame.
    pending_tier: Option<TierChange>,
    /// Model time of the most recent inference, charged to the frame that
    /// consumed it.
    last_model_ms: f64,
}

impl<C: Compositor> Processor<C> {
    /// Build a processor around an already-initialised pipeline.
    ///
    /// The producer factory is invoked once — on the worker thread when
    /// `use_worker` is set, inline otherwise. Worker startup failure falls
    /// back to the inline adapter transparently.
    pub fn new(pipeline: C, factory: ProducerFactory, options: EngineOptions) -> Self {
        let seed = options.quality.seed_tier();
        let adaptive = AdaptiveController::new(options.adaptive_config, seed);
        let tier = adaptive.tier_params();
        let (full_w, full_h) = pipeline.mask_dims();

        let route = if options.use_worker {
            match WorkerHandle::spawn(
                factory.clone(),
                tier.mask_width,
                tier.mask_height,
                full_w,
                full_h,
                INIT_TIMEOUT,
            ) {
                Ok(handle) => ProducerRoute::Worker(handle),
                Err(e) => {
                    warn!(error = %e, "mask worker unavailable, using in-thread adapter");
                    ProducerRoute::Inline(ProducerAdapter::new(
                        factory(),
                        tier.mask_width,
                        tier.mask_height,
                        full_w,
                        full_h,
                    ))
                }
            }
        } else {
            ProducerRoute::Inline(ProducerAdapter::new(
                factory(),
                tier.mask_width,
                tier.mask_height,
                full_w,
                full_h,
            ))
        };

        let framer = AutoFramer::new(options.auto_frame);
        let diagnostics = Diagnostics::new(options.diagnostics.clone());

        info!(
            tier = tier.label,
            worker = matches!(route, ProducerRoute::Worker(_)),
            "processor initialised"
        );

        Processor {
            pipeline,
            route,
            options,
            adaptive,
            framer,
            diagnostics,
            roi: None,
            motion: MotionVector::default(),
            interp_frames: 0,
            last_model_run_ms: f64::NEG_INFINITY,
            pending_tier: None,
            last_model_ms: 0.0,
        }
    }

    /// Install the diagnostics callback and emit the init event.
    pub fn set_diagnostic_sink(&mut self, sink: DiagnosticSink, device: String) {
        self.diagnostics.set_sink(sink);
        let (fw, fh) = self.pipeline.frame_dims();
        let (mw, mh) = self.pipeline.mask_dims();
        self.diagnostics.emit_init(device, fw, fh, mw, mh);
    }

    pub fn pipeline(&self) -> &C {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut C {
        &mut self.pipeline
    }

    pub fn current_tier(&self) -> usize {
        self.adaptive.tier()
    }

    pub fn adaptive_mut(&mut self) -> &mut AdaptiveController {
        &mut self.adaptive
    }

    pub fn roi(&self) -> Option<CropRegion> {
        self.roi
    }

    /// The auto-framer's current smoothed crop.
    pub fn auto_frame_crop(&self) -> crate::autoframe::CropRect {
        self.framer.crop()
    }

    /// Feed an externally detected face box (normalised). Steers the
    /// framer when the auto-frame mode is `Face`.
    pub fn observe_face(&mut self, x: f32, y: f32, w: f32, h: f32) {
        if self.options.auto_frame.enabled && self.options.auto_frame.mode == AutoFrameMode::Face {
            self.framer.update_from_face(x, y, w, h);
        }
    }

    /// Replace engine options that the processor owns (background handled
    /// via the pipeline update).
    pub fn update_options(&mut self, update: &OptionsUpdate) {
        self.pipeline.update_options(update);
    }

    /// Process one camera frame. Returns the composited surface, or None
    /// when bypassing (mode = none) or when the frame was dropped.
    pub fn process_frame(
        &mut self,
        frame: &Frame,
        timestamp_ms: f64,
    ) -> Result<Option<&C::Surface>, ProcessorError> {
        if self.options.background.is_none() {
            return Ok(None);
        }
        if self.pipeline.context_lost() {
            return Err(ProcessorError::ContextLost);
        }

        let t_start = Instant::now();
        self.apply_pending_tier();

        // Motion-scaled model cadence.
        let base_interval = if self.options.model_fps > 0.0 {
            1000.0 / self.options.model_fps as f64
        } else {
            self.adaptive.tier_params().model_interval_ms
        };
        let speedup = (1.0 + 20.0 * self.motion.magnitude() as f64).min(4.0);
        let effective_interval = (base_interval / speedup).max(MIN_MODEL_INTERVAL_MS);
        let should_run_model = timestamp_ms - self.last_model_run_ms >= effective_interval;

        // Auto-frame crop into the pipeline.
        let auto_zoom = if self.options.auto_frame.enabled {
            let crop = self.framer.crop();
            if crop.is_effective() {
                self.pipeline.set_crop_rect(Some(crop));
            } else {
                self.pipeline.set_crop_rect(None);
            }
            crop.zoom
        } else {
            1.0
        };

        // Fresh mask or interpolation.
        let dispatch = match &mut self.route {
            ProducerRoute::Worker(worker) => {
                let dispatch = match worker.poll() {
                    Some(Some(reply)) => {
                        self.last_model_ms = reply.inference_ms;
                        Self::consume_reply(
                            &mut self.pipeline,
                            &mut self.framer,
                            &mut self.diagnostics,
                            &mut self.roi,
                            &mut self.motion,
                            &mut self.interp_frames,
                            self.options.auto_frame.enabled
                                && self.options.auto_frame.mode == AutoFrameMode::Mask,
                            frame,
                            reply,
                        )
                    }
                    Some(None) => {
                        // Producer failed; count and coast.
                        self.diagnostics.record_model_failure();
                        self.interp_frames += 1;
                        let shift = accumulated_shift(&self.motion, self.interp_frames);
                        self.pipeline.process_interpolated(frame, shift)
                    }
                    None => {
                        self.interp_frames += 1;
                        let shift = accumulated_shift(&self.motion, self.interp_frames);
                        self.pipeline.process_interpolated(frame, shift)
                    }
                };

                // Fire the next request after compositing; never blocks.
                if should_run_model && !worker.in_flight() {
                    let sent = worker.request_segment(frame.clone(), timestamp_ms, self.roi);
                    if sent {
                        self.last_model_run_ms = timestamp_ms;
                    }
                }
                dispatch
            }
            ProducerRoute::Inline(adapter) => {
                if should_run_model {
                    self.last_model_run_ms = timestamp_ms;
                    match adapter.segment(frame, timestamp_ms, self.roi) {
                        SegmentStatus::Fresh => {
                            self.last_model_ms = adapter.last_inference_ms();
                            let mask = adapter.full_mask().expect("fresh mask present");
                            let bbox = adapter.bbox();
                            let (mw, mh) = adapter.full_dims();

                            if self.options.auto_frame.enabled
                                && self.options.auto_frame.mode == AutoFrameMode::Mask
                            {
                                self.framer.update_from_mask(mask);
                            }
                            self.diagnostics.record_model_run(
                                mask,
                                bbox.map(|b| b.at_edge(mw, mh)).unwrap_or(false),
                                bbox.is_none(),
                            );
                            if let Some(bbox) = bbox {
                                let candidate = roi_candidate(bbox, mw, mh);
                                self.roi = Some(smooth_roi(self.roi, candidate));
                            }
                            self.motion = adapter.motion_vector();
                            self.interp_frames = 0;

                            let motion_map = adapter.motion_map();
                            let mask = adapter.full_mask().expect("fresh mask present");
                            self.pipeline.process(frame, mask, motion_map)
                        }
                        SegmentStatus::Failed => {
                            // The frame runs as interpolation over the
                            // pipeline's persisted mask.
                            self.diagnostics.record_model_failure();
                            self.interp_frames += 1;
                            let shift = accumulated_shift(&self.motion, self.interp_frames);
                            self.pipeline.process_interpolated(frame, shift)
                        }
                    }
                } else {
                    self.interp_frames += 1;
                    let shift = accumulated_shift(&self.motion, self.interp_frames);
                    self.pipeline.process_interpolated(frame, shift)
                }
            }
        };

        // Steady-state error policy: uploads drop the frame, context loss
        // ends the session, nothing else escapes the pipeline.
        match dispatch {
            Ok(()) => {}
            Err(PipelineError::BadUpload(reason)) => {
                debug!(%reason, "frame dropped");
                self.diagnostics.record_dropped();
                return Ok(None);
            }
            Err(PipelineError::ContextLost) => return Err(ProcessorError::ContextLost),
            Err(e) => {
                warn!(error = %e, "pipeline dispatch failed");
                self.diagnostics.record_dropped();
                return Ok(None);
            }
        }

        // Timing, adaptation, diagnostics.
        let total_ms = t_start.elapsed().as_secs_f64() * 1000.0;
        if self.options.adaptive {
            if let Some(change) = self.adaptive.report_frame(total_ms, timestamp_ms) {
                self.pending_tier = Some(change);
            }
        }

        let tier = self.adaptive.tier_params();
        let timings = FrameTimings {
            model_ms: self.last_model_ms,
            pipeline_ms: (total_ms - self.last_model_ms).max(0.0),
            total_ms,
        };
        let status = FrameStatus {
            quality_tier: self.adaptive.tier(),
            quality_label: tier.label,
            roi_crop: self.roi,
            auto_frame_zoom: auto_zoom,
            context_lost: false,
        };
        self.diagnostics.record_frame(&timings, &status, timestamp_ms);

        Ok(Some(self.pipeline.surface()))
    }

    /// Fresh-mask path for a worker reply. Free function over disjoint
    /// fields so the borrow of `route` stays local to the caller.
    #[allow(clippy::too_many_arguments)]
    fn consume_reply(
        pipeline: &mut C,
        framer: &mut AutoFramer,
        diagnostics: &mut Diagnostics,
        roi: &mut Option<CropRegion>,
        motion: &mut MotionVector,
        interp_frames: &mut u32,
        auto_frame: bool,
        frame: &Frame,
        reply: MaskReply,
    ) -> Result<(), PipelineError> {
        let (mw, mh) = (reply.full_mask.width(), reply.full_mask.height());

        if auto_frame {
            framer.update_from_mask(&reply.full_mask);
        }
        diagnostics.record_model_run(
            &reply.full_mask,
            reply.bbox.map(|b| b.at_edge(mw, mh)).unwrap_or(false),
            reply.bbox.is_none(),
        );
        if let Some(bbox) = reply.bbox {
            let candidate = roi_candidate(bbox, mw, mh);
            *roi = Some(smooth_roi(*roi, candidate));
        }
        *motion = reply.motion_vector;
        *interp_frames = 0;

        pipeline.process(frame, &reply.full_mask, reply.motion.as_ref())
    }

    fn apply_pending_tier(&mut self) {
        let Some(change) = self.pending_tier.take() else {
            return;
        };
        let tier = &TIER_TABLE[change.to];
        debug!(from = change.from, to = change.to, label = tier.label, "applying tier change");

        self.pipeline.update_options(&OptionsUpdate {
            appear_rate: Some(tier.appear_rate),
            disappear_rate: Some(tier.disappear_rate),
            feather_radius: Some(tier.feather_radius),
            range_sigma: Some(tier.range_sigma),
            blur_radius: if matches!(self.options.background, BackgroundMode::Blur { .. }) {
                Some(tier.blur_radius)
            } else {
                None
            },
            light_wrap: Some(tier.light_wrap),
            morphology: Some(tier.morphology),
            ..Default::default()
        });

        match &mut self.route {
            ProducerRoute::Inline(adapter) => {
                adapter.set_model_dims(tier.mask_width, tier.mask_height);
            }
            ProducerRoute::Worker(worker) => {
                worker.set_model_dims(tier.mask_width, tier.mask_height);
            }
        }
    }

    /// Forget all temporal state: masks, velocities, ROI, auto-frame lock,
    /// adaptive windows. GPU/pipeline resources are untouched.
    pub fn reset(&mut self) {
        self.roi = None;
        self.motion = MotionVector::default();
        self.interp_frames = 0;
        self.last_model_run_ms = f64::NEG_INFINITY;
        self.pending_tier = None;
        self.framer.reset();
        self.adaptive.reset();
        match &mut self.route {
            ProducerRoute::Inline(adapter) => adapter.reset(),
            ProducerRoute::Worker(worker) => worker.reset(),
        }
    }
}

// ---------------------------------------------------------------------------
// Shift and ROI helpers
// ---------------------------------------------------------------------------

/// Weighted motion shift after `t` consecutive interpolated frames.
///
/// The three horizontal bands blend 0.6/0.3/0.1 (torso dominates), with a
/// dead zone so sensor noise never translates the mask, and a per-axis
/// clamp so a stale prediction cannot run away.
pub fn accumulated_shift(motion: &MotionVector, t: u32) -> (f32, f32) {
    let vx = 0.6 * motion.vx[0] + 0.3 * motion.vx[1] + 0.1 * motion.vx[2];
    if vx.abs() < SHIFT_DEAD_ZONE && motion.vy.abs() < SHIFT_DEAD_ZONE {
        return (0.0, 0.0);
    }
    let t = t as f32;
    (
        (vx * t).clamp(-SHIFT_CLAMP, SHIFT_CLAMP),
        (motion.vy * t).clamp(-SHIFT_CLAMP, SHIFT_CLAMP),
    )
}

/// Normalised, padded ROI candidate from a pixel-space bbox.
fn roi_candidate(bbox: PixelBox, mask_w: usize, mask_h: usize) -> CropRegion {
    let m = mask_w as f32;
    let n = mask_h as f32;
    CropRegion {
        x: bbox.min_x as f32 / m - ROI_PADDING,
        y: bbox.min_y as f32 / n - ROI_PADDING,
        w: bbox.width() as f32 / m + 2.0 * ROI_PADDING,
        h: bbox.height() as f32 / n + 2.0 * ROI_PADDING,
    }
    .clamped()
}

/// Dead-zoned EMA toward the candidate ROI. Sub-threshold changes keep
/// the prior crop verbatim, preventing crop↔mask oscillation.
fn smooth_roi(prior: Option<CropRegion>, candidate: CropRegion) -> CropRegion {
    let Some(prior) = prior else {
        return candidate;
    };
    let pos_shift = (candidate.x - prior.x).abs().max((candidate.y - prior.y).abs());
    let size_shift = (candidate.w - prior.w).abs().max((candidate.h - prior.h).abs());
    if pos_shift <= ROI_POS_DEAD_ZONE && size_shift <= ROI_SIZE_DEAD_ZONE {
        return prior;
    }
    CropRegion {
        x: ROI_EMA * prior.x + (1.0 - ROI_EMA) * candidate.x,
        y: ROI_EMA * prior.y + (1.0 - ROI_EMA) * candidate.y,
        w: ROI_EMA * prior.w + (1.0 - ROI_EMA) * candidate.w,
        h: ROI_EMA * prior.h + (1.0 - ROI_EMA) * candidate.h,
    }
    .clamped()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulated_shift_dead_zone() {
        let motion = MotionVector { vx: [0.002, 0.002, 0.002], vy: 0.002 };
        assert_eq!(accumulated_shift(&motion, 10), (0.0, 0.0));
    }

    #[test]
    fn test_accumulated_shift_scales_with_frames() {
        let motion = MotionVector { vx: [0.02, 0.02, 0.02], vy: 0.0 };
        let (dx, _) = accumulated_shift(&motion, 3);
        assert!((dx - 0.06).abs() < 1e-6, "0.02 * 3 = 0.06: {dx}");
    }

    #[test]
    fn test_accumulated_shift_clamps() {
        let motion = MotionVector { vx: [0.05, 0.05, 0.05], vy: -0.08 };
        let (dx, dy) = accumulated_shift(&motion, 50);
        assert_eq!(dx, SHIFT_CLAMP);
        assert_eq!(dy, -SHIFT_CLAMP);
    }

    #[test]
    fn test_accumulated_shift_band_weights() {
        let motion = MotionVector { vx: [0.1, 0.0, 0.0], vy: 0.0 };
        let (dx, _) = accumulated_shift(&motion, 1);
        assert!((dx - 0.06).abs() < 1e-6, "top band weighted 0.6: {dx}");
    }

    #[test]
    fn test_smooth_roi_adopts_first() {
        let candidate = CropRegion { x: 0.2, y: 0.2, w: 0.5, h: 0.5 };
        assert_eq!(smooth_roi(None, candidate), candidate);
    }

    #[test]
    fn test_smooth_roi_dead_zone_retains_prior() {
        let prior = CropRegion { x: 0.2, y: 0.2, w: 0.5, h: 0.5 };
        let wobble = CropRegion { x: 0.21, y: 0.2, w: 0.505, h: 0.5 };
        assert_eq!(smooth_roi(Some(prior), wobble), prior);
    }

    #[test]
    fn test_smooth_roi_blends_large_moves() {
        let prior = CropRegion { x: 0.2, y: 0.2, w: 0.5, h: 0.5 };
        let moved = CropRegion { x: 0.4, y: 0.2, w: 0.5, h: 0.5 };
        let blended = smooth_roi(Some(prior), moved);
        assert!((blended.x - 0.3).abs() < 1e-6, "EMA 0.5 midpoint: {}", blended.x);
    }

    #[test]
    fn test_roi_candidate_is_valid() {
        let bbox = PixelBox { min_x: 0, min_y: 0, max_x: 31, max_y: 31 };
        let roi = roi_candidate(bbox, 32, 32);
        assert!(roi.is_valid(), "{roi:?}");
    }
}
