// pipeline.rs — CPU reference compositing pipeline.
//
// The authoritative implementation of the per-frame mask post-processing
// chain. The wgpu pipeline in gpu/pipeline.rs mirrors this stage-for-stage
// and is validated against it; every invariant test in tests/ runs against
// this implementation, GPU or not.
//
// FRESH-MASK ORDER
//   temporal smooth → blit into previous-mask → (morphology close) →
//   bilateral upsample → edge feather → 0.5-texel erode →
//   (background blur) → composite → (light wrap) → (crop)
//
// INTERPOLATED ORDER
//   (mask shift) → bilateral → feather → erode → (blur) → composite →
//   (light wrap) → (crop)
//
// Every buffer is allocated at init and reused; process() performs no
// allocation. The previous-mask buffer is written only by the fresh-mask
// path, so interpolated frames always re-refine the last temporal result.

use std::fmt;

use crate::autoframe::CropRect;
use crate::blur;
use crate::composite::{self, BackgroundSource, CompositeParams};
use crate::config::{BackgroundMode, OptionsUpdate, PipelineConfig};
use crate::feather;
use crate::frame::Frame;
use crate::image::Image;
use crate::morphology::{self, MorphOp};
use crate::resample;
use crate::temporal::{self, TemporalParams};

/// Width of the duplicate-extended border band applied to every mask
/// before it enters the chain.
pub const MASK_EDGE_PAD: usize = 4;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Pipeline failures. Everything at init is fatal; `BadUpload` is the only
/// steady-state kind and the processor absorbs it as a dropped frame.
#[derive(Debug)]
pub enum PipelineError {
    /// No usable device / offscreen context.
    ContextUnavailable(String),
    /// A shader failed to compile or link.
    ShaderCompile(String),
    /// A framebuffer attachment combination is unsupported.
    FramebufferIncomplete(String),
    /// The device was lost mid-session. The session is over; re-init.
    ContextLost,
    /// A per-frame upload was rejected (dimension mismatch, zero size).
    BadUpload(String),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::ContextUnavailable(s) => write!(f, "context unavailable: {s}"),
            PipelineError::ShaderCompile(s) => write!(f, "shader compilation failed: {s}"),
            PipelineError::FramebufferIncomplete(s) => {
                write!(f, "framebuffer incomplete: {s}")
            }
            PipelineError::ContextLost => write!(f, "GPU context lost"),
            PipelineError::BadUpload(s) => write!(f, "resource upload failed: {s}"),
        }
    }
}

impl std::error::Error for PipelineError {}

// ---------------------------------------------------------------------------
// Compositor trait
// ---------------------------------------------------------------------------

/// The seam between the orchestrator and a concrete pipeline track.
///
/// Implemented by [`CpuPipeline`] here and by `gpu::GpuPipeline`. The
/// processor drives either through this trait, which is what lets the
/// whole control loop run in tests without a GPU.
pub trait Compositor {
    /// The composited output handle: a `Frame` on the CPU track, a texture
    /// on the GPU track.
    type Surface;

    /// Full dispatch with a fresh full-frame mask (and motion map when one
    /// exists).
    fn process(
        &mut self,
        frame: &Frame,
        mask: &Image<f32>,
        motion: Option<&Image<f32>>,
    ) -> Result<(), PipelineError>;

    /// Dispatch without a fresh mask: refine the persisted previous mask,
    /// translated by `shift` (normalised coordinates).
    fn process_interpolated(
        &mut self,
        frame: &Frame,
        shift: (f32, f32),
    ) -> Result<(), PipelineError>;

    /// Install or clear the final-stage crop. Never reallocates.
    fn set_crop_rect(&mut self, rect: Option<CropRect>);

    /// Apply a partial options update. Never reallocates; a new background
    /// image is re-uploaded.
    fn update_options(&mut self, update: &OptionsUpdate);

    /// The most recent composited surface.
    fn surface(&self) -> &Self::Surface;

    /// Configured full-frame mask dimensions.
    fn mask_dims(&self) -> (usize, usize);

    /// Configured camera / output dimensions.
    fn frame_dims(&self) -> (usize, usize);

    /// True once the device has been lost; all further dispatches fail.
    fn context_lost(&self) -> bool;
}

// ---------------------------------------------------------------------------
// CpuPipeline
// ---------------------------------------------------------------------------

/// CPU reference pipeline. Owns the full buffer set mirroring the GPU
/// framebuffer list: mask-resolution ping-pongs, full-resolution mask
/// stages, the half-resolution blur pair and the output/pre-crop frames.
pub struct CpuPipeline {
    cfg: PipelineConfig,

    // Mask-resolution (M x N) stages.
    raw_mask: Image<f32>,
    temporal: Image<f32>,
    previous_mask: Image<f32>,
    morph_a: Image<f32>,
    morph_b: Image<f32>,
    shifted: Image<f32>,

    // Full-resolution (W x H) mask stages. `bilateral` and `feathered`
    // ping-pong: bilateral → feather → erode lands back in `bilateral`.
    bilateral: Image<f32>,
    feathered: Image<f32>,
    refined: Image<f32>,

    // Background production.
    blur_a: Frame,
    blur_b: Frame,
    half: Frame,

    // Output chain.
    composited: Frame,
    pre_crop: Frame,
    output: Frame,

    crop: Option<CropRect>,
    first_frame: bool,
}

impl CpuPipeline {
    /// Allocate every buffer for the configured dimensions.
    pub fn new(cfg: PipelineConfig) -> Result<Self, PipelineError> {
        let (w, h) = (cfg.frame_width, cfg.frame_height);
        let (mw, mh) = (cfg.mask_width, cfg.mask_height);
        if w == 0 || h == 0 || mw == 0 || mh == 0 {
            return Err(PipelineError::ContextUnavailable(format!(
                "degenerate dimensions {w}x{h} / {mw}x{mh}"
            )));
        }
        let hw = (w / 2).max(1);
        let hh = (h / 2).max(1);
        Ok(CpuPipeline {
            raw_mask: Image::new(mw, mh),
            temporal: Image::new(mw, mh),
            previous_mask: Image::new(mw, mh),
            morph_a: Image::new(mw, mh),
            morph_b: Image::new(mw, mh),
            shifted: Image::new(mw, mh),
            bilateral: Image::new(w, h),
            feathered: Image::new(w, h),
            refined: Image::new(w, h),
            blur_a: Frame::new(hw, hh),
            blur_b: Frame::new(hw, hh),
            half: Frame::new(hw, hh),
            composited: Frame::new(w, h),
            pre_crop: Frame::new(w, h),
            output: Frame::new(w, h),
            crop: None,
            first_frame: true,
            cfg,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.cfg
    }

    /// The persisted temporally-smoothed mask (mask resolution). Exposed
    /// for validation; the GPU track reads this back from its FBO.
    pub fn previous_mask(&self) -> &Image<f32> {
        &self.previous_mask
    }

    /// The refined full-resolution mask fed to the compositor.
    pub fn refined_mask(&self) -> &Image<f32> {
        &self.refined
    }

    /// Mean wall-clock cost of one fresh dispatch over synthetic inputs,
    /// in milliseconds. Feeds `AdaptiveController::calibrate_from_benchmark`
    /// before a session starts; it runs real dispatches, so call it before
    /// the first camera frame (it overwrites the persisted mask state).
    pub fn benchmark_sample_ms(&mut self, iterations: u32) -> f64 {
        let (w, h) = (self.cfg.frame_width, self.cfg.frame_height);
        let (mw, mh) = (self.cfg.mask_width, self.cfg.mask_height);

        let mut frame = Frame::new(w, h);
        for y in 0..h {
            for x in 0..w {
                frame.set_rgb(x, y, [x as f32 / w as f32, y as f32 / h as f32, 0.5]);
            }
        }
        let mut mask = Image::new(mw, mh);
        for y in mh / 4..(3 * mh / 4) {
            for x in mw / 3..(2 * mw / 3) {
                mask.set(x, y, 0.95);
            }
        }

        let iterations = iterations.max(1);
        let t0 = std::time::Instant::now();
        for _ in 0..iterations {
            // Dimensions are taken from our own config; this cannot fail.
            let _ = self.process(&frame, &mask, None);
        }
        t0.elapsed().as_secs_f64() * 1000.0 / iterations as f64
    }

    fn check_frame(&self, frame: &Frame) -> Result<(), PipelineError> {
        if frame.width() != self.cfg.frame_width || frame.height() != self.cfg.frame_height {
            return Err(PipelineError::BadUpload(format!(
                "frame {}x{} != configured {}x{}",
                frame.width(),
                frame.height(),
                self.cfg.frame_width,
                self.cfg.frame_height
            )));
        }
        Ok(())
    }

    /// Shared tail of both dispatch paths: mask-space input (held in
    /// morph_b) → full-res refinement → background → composite →
    /// light wrap → crop.
    fn refine_and_composite(&mut self, frame: &Frame) {
        let _span = tracing::debug_span!("refine_and_composite").entered();

        resample::bilateral_upsample(&self.morph_b, frame, self.cfg.range_sigma, &mut self.bilateral);
        feather::edge_feather(&self.bilateral, self.cfg.feather_radius, &mut self.feathered);
        morphology::morph(&self.feathered, MorphOp::Erode, 0.5, &mut self.refined);

        // Background production + composite parameters.
        let mut params = CompositeParams::default();
        if let Some(c) = self.crop {
            params.crop_offset = (c.x, c.y);
            params.crop_size = (c.w, c.h);
        }

        let light_wrap = self.cfg.light_wrap;
        let wrap_strength = self.cfg.light_wrap_strength;

        match &self.cfg.background {
            BackgroundMode::Blur { radius } => {
                let r = radius.clamp(4.0, 24.0);
                blur::downscale_half(frame, &mut self.half);
                blur::blur_iterated(&self.half, r, &mut self.blur_a, &mut self.blur_b);
                let bg = BackgroundSource::Frame(&self.blur_b);
                composite::composite(frame, &self.refined, &bg, &params, &mut self.composited);
                if light_wrap {
                    composite::light_wrap(
                        &self.composited, &self.refined, &bg, &params, wrap_strength,
                        &mut self.pre_crop,
                    );
                    std::mem::swap(&mut self.pre_crop, &mut self.composited);
                }
            }
            BackgroundMode::Image { image, match_strength, fixed } => {
                params.background_fixed = *fixed && self.crop.is_some();
                if *match_strength > 0.0 {
                    params.bg_gain =
                        composite::color_match_gain(frame, &self.refined, image, *match_strength);
                }
                let bg = BackgroundSource::Frame(image);
                composite::composite(frame, &self.refined, &bg, &params, &mut self.composited);
                if light_wrap {
                    composite::light_wrap(
                        &self.composited, &self.refined, &bg, &params, wrap_strength,
                        &mut self.pre_crop,
                    );
                    std::mem::swap(&mut self.pre_crop, &mut self.composited);
                }
            }
            BackgroundMode::Color { rgb, fixed } => {
                params.background_fixed = *fixed && self.crop.is_some();
                let bg = BackgroundSource::Color(*rgb);
                composite::composite(frame, &self.refined, &bg, &params, &mut self.composited);
                if light_wrap {
                    composite::light_wrap(
                        &self.composited, &self.refined, &bg, &params, wrap_strength,
                        &mut self.pre_crop,
                    );
                    std::mem::swap(&mut self.pre_crop, &mut self.composited);
                }
            }
            BackgroundMode::None => {
                // The processor bypasses the pipeline in this mode; if a
                // dispatch arrives anyway, pass the camera through.
                self.composited.as_rgba_mut().copy_from_slice(frame.as_rgba());
            }
        }

        // Final stage: crop into the visible surface, or publish directly.
        match self.crop {
            Some(c) if c.w < 1.0 || c.h < 1.0 => {
                composite::crop_frame(&self.composited, (c.x, c.y), (c.w, c.h), &mut self.output);
            }
            _ => {
                self.output.as_rgba_mut().copy_from_slice(self.composited.as_rgba());
            }
        }

        self.first_frame = false;
    }
}

impl Compositor for CpuPipeline {
    type Surface = Frame;

    fn process(
        &mut self,
        frame: &Frame,
        mask: &Image<f32>,
        motion: Option<&Image<f32>>,
    ) -> Result<(), PipelineError> {
        self.check_frame(frame)?;
        if mask.width() != self.cfg.mask_width || mask.height() != self.cfg.mask_height {
            return Err(PipelineError::BadUpload(format!(
                "mask {}x{} != configured {}x{}",
                mask.width(),
                mask.height(),
                self.cfg.mask_width,
                self.cfg.mask_height
            )));
        }

        // Upload: copy and duplicate-extend the border band.
        self.raw_mask.copy_from(mask);
        self.raw_mask.pad_edges(MASK_EDGE_PAD);

        let params = TemporalParams {
            appear: self.cfg.appear_rate,
            disappear: self.cfg.disappear_rate,
            softness: self.cfg.softness,
            first_frame: self.first_frame,
        };
        temporal::temporal_smooth(&self.raw_mask, &self.previous_mask, motion, &params, &mut self.temporal);

        // Blit the temporal result into the persisted previous-mask.
        self.previous_mask.copy_from(&self.temporal);

        // Morphological close, or a plain copy into the bilateral input.
        if self.cfg.morphology {
            morphology::close(&self.temporal, 1.0, &mut self.morph_a, &mut self.morph_b);
        } else {
            self.morph_b.copy_from(&self.temporal);
        }

        self.refine_and_composite(frame);
        Ok(())
    }

    fn process_interpolated(
        &mut self,
        frame: &Frame,
        shift: (f32, f32),
    ) -> Result<(), PipelineError> {
        self.check_frame(frame)?;

        if shift.0.abs() > 1e-4 || shift.1.abs() > 1e-4 {
            resample::shift_mask(&self.previous_mask, shift, &mut self.shifted);
            self.morph_b.copy_from(&self.shifted);
        } else {
            self.morph_b.copy_from(&self.previous_mask);
        }

        self.refine_and_composite(frame);
        Ok(())
    }

    fn set_crop_rect(&mut self, rect: Option<CropRect>) {
        self.crop = rect;
    }

    fn update_options(&mut self, update: &OptionsUpdate) {
        self.cfg.apply(update);
    }

    fn surface(&self) -> &Frame {
        &self.output
    }

    fn mask_dims(&self) -> (usize, usize) {
        (self.cfg.mask_width, self.cfg.mask_height)
    }

    fn frame_dims(&self) -> (usize, usize) {
        (self.cfg.frame_width, self.cfg.frame_height)
    }

    fn context_lost(&self) -> bool {
        false
    }
}
