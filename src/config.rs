// config.rs — Engine options and the pipeline configuration surface.
//
// Three layers:
//   EngineOptions   — what the host passes at construction: background,
//                     quality, worker routing, auto-frame, diagnostics.
//   PipelineConfig  — the compositing pipeline's init-time parameters,
//                     derived from EngineOptions + the active quality tier.
//   OptionsUpdate   — the partial update accepted mid-session. Applying one
//                     never reallocates pipeline resources; only a changed
//                     background image triggers a texture re-upload.

use crate::adaptive::{AdaptiveConfig, Quality};
use crate::autoframe::AutoFrameOptions;
use crate::frame::Frame;

// ---------------------------------------------------------------------------
// Background mode
// ---------------------------------------------------------------------------

/// What replaces the background. A tagged union; the compositor dispatches
/// on the variant.
#[derive(Clone, Debug)]
pub enum BackgroundMode {
    /// Blur the camera's own background (3-pass separable Gaussian at half
    /// resolution). `radius` is clamped to [4, 24] at the pipeline boundary.
    Blur { radius: f32 },
    /// Replace with an uploaded image. `match_strength` drives the colour
    /// match stage (0 disables); `fixed` keeps the background stationary
    /// under auto-frame cropping.
    Image {
        image: Frame,
        match_strength: f32,
        fixed: bool,
    },
    /// Replace with a solid colour (normalised RGB).
    Color { rgb: [f32; 3], fixed: bool },
    /// Bypass: the processor returns no surface and touches nothing.
    None,
}

impl BackgroundMode {
    /// Solid colour from a packed 24-bit RGB value (0xRRGGBB).
    pub fn color_from_rgb24(rgb: u32) -> Self {
        BackgroundMode::Color {
            rgb: [
                ((rgb >> 16) & 0xff) as f32 / 255.0,
                ((rgb >> 8) & 0xff) as f32 / 255.0,
                (rgb & 0xff) as f32 / 255.0,
            ],
            fixed: false,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, BackgroundMode::None)
    }

    pub fn is_blur(&self) -> bool {
        matches!(self, BackgroundMode::Blur { .. })
    }
}

// ---------------------------------------------------------------------------
// Engine options
// ---------------------------------------------------------------------------

/// Top-level engine configuration, passed once at construction.
#[derive(Clone, Debug)]
pub struct EngineOptions {
    pub background: BackgroundMode,
    /// Base model rate in frames per second. 0 means "use tier default".
    pub model_fps: f32,
    /// Advisory only; the output rate is driven by the frame source.
    pub output_fps: f32,
    /// Seed quality tier. The adaptive controller may move off it.
    pub quality: Quality,
    /// Enable the adaptive quality controller.
    pub adaptive: bool,
    /// Overrides of the controller constants.
    pub adaptive_config: AdaptiveConfig,
    /// Route inference through the worker thread.
    pub use_worker: bool,
    pub auto_frame: AutoFrameOptions,
    pub diagnostics: DiagnosticsOptions,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            background: BackgroundMode::Blur { radius: 12.0 },
            model_fps: 0.0,
            output_fps: 30.0,
            quality: Quality::High,
            adaptive: true,
            adaptive_config: AdaptiveConfig::default(),
            use_worker: false,
            auto_frame: AutoFrameOptions::default(),
            diagnostics: DiagnosticsOptions::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Diagnostics options
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiagnosticsLevel {
    Off,
    Summary,
}

#[derive(Clone, Debug)]
pub struct DiagnosticsOptions {
    pub level: DiagnosticsLevel,
    /// Interval between summary events, in milliseconds.
    pub interval_ms: f64,
    /// Attach a downscaled mask snapshot to summary events.
    pub include_image: bool,
    /// Opaque identifier echoed in every event.
    pub client_id: String,
}

impl Default for DiagnosticsOptions {
    fn default() -> Self {
        DiagnosticsOptions {
            level: DiagnosticsLevel::Off,
            interval_ms: 10_000.0,
            include_image: false,
            client_id: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline configuration
// ---------------------------------------------------------------------------

/// Init-time parameters of the compositing pipeline (CPU or GPU track).
///
/// Rates and radii here are the *active* values; the processor rebuilds the
/// update whenever the quality tier changes and pushes it through
/// `Compositor::update_options`.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Output / camera dimensions.
    pub frame_width: usize,
    pub frame_height: usize,
    /// Full-frame mask dimensions. Fixed at init from the tier-0 mask
    /// resolution; lower tiers change only the model input, not this.
    pub mask_width: usize,
    pub mask_height: usize,
    /// Temporal hysteresis rates (appear faster than disappear).
    pub appear_rate: f32,
    pub disappear_rate: f32,
    /// Soft-threshold half-width around 0.5 for the temporal stage.
    pub softness: f32,
    /// Edge feather Gaussian radius in texels.
    pub feather_radius: f32,
    /// Bilateral range sigma (perceptual colour distance).
    pub range_sigma: f32,
    pub background: BackgroundMode,
    /// Morphological close (dilate then erode) on the mask-resolution FBOs.
    pub morphology: bool,
    /// Light-wrap pass over the composite.
    pub light_wrap: bool,
    /// Strength of the light wrap band.
    pub light_wrap_strength: f32,
}

impl PipelineConfig {
    pub fn new(frame_width: usize, frame_height: usize, mask_width: usize, mask_height: usize) -> Self {
        PipelineConfig {
            frame_width,
            frame_height,
            mask_width,
            mask_height,
            appear_rate: 0.85,
            disappear_rate: 0.75,
            softness: 0.25,
            feather_radius: 2.0,
            range_sigma: 0.1,
            background: BackgroundMode::Blur { radius: 12.0 },
            morphology: true,
            light_wrap: true,
            light_wrap_strength: 0.06,
        }
    }

    /// Apply a partial update in place.
    pub fn apply(&mut self, update: &OptionsUpdate) {
        if let Some(v) = update.appear_rate {
            self.appear_rate = v;
        }
        if let Some(v) = update.disappear_rate {
            self.disappear_rate = v;
        }
        if let Some(v) = update.feather_radius {
            self.feather_radius = v;
        }
        if let Some(v) = update.range_sigma {
            self.range_sigma = v;
        }
        if let Some(ref bg) = update.background {
            self.background = bg.clone();
        } else if let Some(radius) = update.blur_radius {
            // Radius-only update keeps the current mode when it is Blur.
            if let BackgroundMode::Blur { radius: r } = &mut self.background {
                *r = radius.clamp(4.0, 24.0);
            }
        }
        if let Some(v) = update.morphology {
            self.morphology = v;
        }
        if let Some(v) = update.light_wrap {
            self.light_wrap = v;
        }
    }
}

/// Partial pipeline update. All fields optional; absent fields keep their
/// current value. `background` replaces the whole mode (including a new
/// background image, which is re-uploaded unconditionally).
#[derive(Clone, Debug, Default)]
pub struct OptionsUpdate {
    pub appear_rate: Option<f32>,
    pub disappear_rate: Option<f32>,
    pub feather_radius: Option<f32>,
    pub range_sigma: Option<f32>,
    pub blur_radius: Option<f32>,
    pub background: Option<BackgroundMode>,
    pub morphology: Option<bool>,
    pub light_wrap: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_from_rgb24() {
        let mode = BackgroundMode::color_from_rgb24(0xff8000);
        match mode {
            BackgroundMode::Color { rgb, fixed } => {
                assert_eq!(rgb[0], 1.0);
                assert!((rgb[1] - 128.0 / 255.0).abs() < 1e-6);
                assert_eq!(rgb[2], 0.0);
                assert!(!fixed);
            }
            _ => panic!("expected Color"),
        }
    }

    #[test]
    fn test_apply_partial_update() {
        let mut cfg = PipelineConfig::new(1280, 720, 256, 256);
        cfg.apply(&OptionsUpdate {
            feather_radius: Some(1.0),
            light_wrap: Some(false),
            ..Default::default()
        });
        assert_eq!(cfg.feather_radius, 1.0);
        assert!(!cfg.light_wrap);
        assert_eq!(cfg.appear_rate, 0.85, "untouched fields keep defaults");
    }

    #[test]
    fn test_blur_radius_update_clamps() {
        let mut cfg = PipelineConfig::new(64, 64, 32, 32);
        cfg.apply(&OptionsUpdate {
            blur_radius: Some(100.0),
            ..Default::default()
        });
        match cfg.background {
            BackgroundMode::Blur { radius } => assert_eq!(radius, 24.0),
            _ => panic!("expected Blur"),
        }
    }
}
