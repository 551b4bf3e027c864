// adaptive.rs — Tier table and the adaptive quality controller.
//
// A tier is a complete operating point: model resolution and rate plus the
// post-processing parameters that dominate frame cost. The controller
// watches measured frame times in 30-frame windows and walks the tier
// index with hysteresis:
//
//   - sustained mean above target, or P95 above critical → downgrade
//     (after 2 bad windows, 1 s cooldown)
//   - sustained mean below 0.6x target → upgrade (after 5 good windows,
//     1 s cooldown)
//   - 3 *consecutive* frames above critical → downgrade immediately,
//     ignoring window boundaries and cooldown
//
// The asymmetry (2 windows down, 5 up) is the point: dropping quality on
// a struggling machine must be fast, climbing back must be cautious or
// the controller oscillates at a tier boundary.
//
// Transitions are reported to the caller as a pending `TierChange`; the
// orchestrator applies it at the start of the next frame (mid-frame
// parameter changes are forbidden).

// ---------------------------------------------------------------------------
// Quality tiers
// ---------------------------------------------------------------------------

/// Host-facing quality selector. Seeds the tier index; the adaptive
/// controller may move off it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Quality {
    Low,
    Medium,
    High,
    Ultra,
}

impl Quality {
    /// Index into [`TIER_TABLE`]. The bottom (minimal) tier is reachable
    /// only through adaptive downgrades.
    pub fn seed_tier(self) -> usize {
        match self {
            Quality::Ultra => 0,
            Quality::High => 1,
            Quality::Medium => 2,
            Quality::Low => 3,
        }
    }
}

/// One fully specified operating point. Immutable.
#[derive(Clone, Copy, Debug)]
pub struct QualityTier {
    pub label: &'static str,
    pub mask_width: usize,
    pub mask_height: usize,
    /// Base interval between model runs, in milliseconds.
    pub model_interval_ms: f64,
    pub appear_rate: f32,
    pub disappear_rate: f32,
    pub feather_radius: f32,
    pub range_sigma: f32,
    pub blur_radius: f32,
    pub light_wrap: bool,
    pub morphology: bool,
}

/// Ordered ultra → minimal. Index 0 is the most expensive.
pub const TIER_TABLE: [QualityTier; 5] = [
    QualityTier {
        label: "ultra",
        mask_width: 256,
        mask_height: 256,
        model_interval_ms: 33.0,
        appear_rate: 0.90,
        disappear_rate: 0.80,
        feather_radius: 2.0,
        range_sigma: 0.10,
        blur_radius: 16.0,
        light_wrap: true,
        morphology: true,
    },
    QualityTier {
        label: "high",
        mask_width: 256,
        mask_height: 256,
        model_interval_ms: 50.0,
        appear_rate: 0.85,
        disappear_rate: 0.75,
        feather_radius: 2.0,
        range_sigma: 0.10,
        blur_radius: 12.0,
        light_wrap: true,
        morphology: true,
    },
    QualityTier {
        label: "medium",
        mask_width: 192,
        mask_height: 192,
        model_interval_ms: 66.0,
        appear_rate: 0.80,
        disappear_rate: 0.70,
        feather_radius: 1.5,
        range_sigma: 0.12,
        blur_radius: 10.0,
        light_wrap: false,
        morphology: true,
    },
    QualityTier {
        label: "low",
        mask_width: 160,
        mask_height: 160,
        model_interval_ms: 100.0,
        appear_rate: 0.75,
        disappear_rate: 0.65,
        feather_radius: 1.0,
        range_sigma: 0.14,
        blur_radius: 8.0,
        light_wrap: false,
        morphology: false,
    },
    QualityTier {
        label: "minimal",
        mask_width: 128,
        mask_height: 128,
        model_interval_ms: 150.0,
        appear_rate: 0.70,
        disappear_rate: 0.60,
        feather_radius: 1.0,
        range_sigma: 0.16,
        blur_radius: 6.0,
        light_wrap: false,
        morphology: false,
    },
];

// ---------------------------------------------------------------------------
// Controller configuration
// ---------------------------------------------------------------------------

/// Controller constants, all overridable by the host.
#[derive(Clone, Copy, Debug)]
pub struct AdaptiveConfig {
    /// Budget for the mean frame time, in milliseconds.
    pub target_ms: f64,
    /// A frame above this is "critical".
    pub critical_ms: f64,
    /// Window length in frames.
    pub window: usize,
    /// Bad windows before a downgrade.
    pub downgrade_threshold: u32,
    /// Good windows before an upgrade.
    pub upgrade_threshold: u32,
    /// Consecutive critical frames forcing an immediate downgrade.
    pub critical_streak: u32,
    /// Minimum time between tier changes (except critical downgrades).
    pub cooldown_ms: f64,
    /// Upgrade only when mean < headroom * target.
    pub upgrade_headroom: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        AdaptiveConfig {
            target_ms: 28.0,
            critical_ms: 40.0,
            window: 30,
            downgrade_threshold: 2,
            upgrade_threshold: 5,
            critical_streak: 3,
            cooldown_ms: 1000.0,
            upgrade_headroom: 0.6,
        }
    }
}

/// An applied tier transition, reported for the orchestrator to act on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TierChange {
    pub from: usize,
    pub to: usize,
}

// ---------------------------------------------------------------------------
// AdaptiveController
// ---------------------------------------------------------------------------

pub struct AdaptiveController {
    config: AdaptiveConfig,
    tier: usize,
    /// Ring of the last `window` frame times.
    ring: Vec<f64>,
    ring_pos: usize,
    ring_filled: usize,
    frames_since_eval: usize,
    good_windows: u32,
    bad_windows: u32,
    critical_in_a_row: u32,
    last_adjustment_ms: f64,
    locked: bool,
}

impl AdaptiveController {
    pub fn new(config: AdaptiveConfig, seed_tier: usize) -> Self {
        let window = config.window.max(1);
        AdaptiveController {
            config,
            tier: seed_tier.min(TIER_TABLE.len() - 1),
            ring: vec![0.0; window],
            ring_pos: 0,
            ring_filled: 0,
            frames_since_eval: 0,
            good_windows: 0,
            bad_windows: 0,
            critical_in_a_row: 0,
            last_adjustment_ms: f64::NEG_INFINITY,
            locked: false,
        }
    }

    pub fn tier(&self) -> usize {
        self.tier
    }

    pub fn tier_params(&self) -> &'static QualityTier {
        &TIER_TABLE[self.tier]
    }

    pub fn config(&self) -> &AdaptiveConfig {
        &self.config
    }

    /// Feed one measured total frame time. `now_ms` is the host's
    /// monotonic clock, used for the cooldown. Returns a transition when
    /// one fired.
    pub fn report_frame(&mut self, frame_ms: f64, now_ms: f64) -> Option<TierChange> {
        self.ring[self.ring_pos] = frame_ms;
        self.ring_pos = (self.ring_pos + 1) % self.ring.len();
        self.ring_filled = (self.ring_filled + 1).min(self.ring.len());
        self.frames_since_eval += 1;

        // Critical streak: bypasses windows and cooldown entirely.
        if frame_ms > self.config.critical_ms {
            self.critical_in_a_row += 1;
            if self.critical_in_a_row >= self.config.critical_streak {
                self.critical_in_a_row = 0;
                return self.downgrade(now_ms, true);
            }
        } else {
            self.critical_in_a_row = 0;
        }

        if self.frames_since_eval < self.ring.len() || self.ring_filled < self.ring.len() {
            return None;
        }
        self.frames_since_eval = 0;

        let mean = self.ring.iter().sum::<f64>() / self.ring.len() as f64;
        let p95 = self.p95();

        if mean > self.config.target_ms || p95 > self.config.critical_ms {
            self.bad_windows += 1;
            self.good_windows = 0;
            if self.bad_windows >= self.config.downgrade_threshold
                && self.cooldown_elapsed(now_ms)
            {
                self.bad_windows = 0;
                return self.downgrade(now_ms, false);
            }
        } else if mean < self.config.upgrade_headroom * self.config.target_ms {
            self.good_windows += 1;
            self.bad_windows = 0;
            if self.good_windows >= self.config.upgrade_threshold
                && self.cooldown_elapsed(now_ms)
            {
                self.good_windows = 0;
                return self.upgrade(now_ms);
            }
        } else {
            // Stable zone: neither counter accumulates.
            self.good_windows = 0;
            self.bad_windows = 0;
        }
        None
    }

    fn p95(&self) -> f64 {
        let mut sorted: Vec<f64> = self.ring[..self.ring_filled].to_vec();
        sorted.sort_by(f64::total_cmp);
        let idx = ((sorted.len() as f64 * 0.95).ceil() as usize).clamp(1, sorted.len()) - 1;
        sorted[idx]
    }

    fn cooldown_elapsed(&self, now_ms: f64) -> bool {
        now_ms - self.last_adjustment_ms >= self.config.cooldown_ms
    }

    fn downgrade(&mut self, now_ms: f64, _critical: bool) -> Option<TierChange> {
        if self.locked || self.tier + 1 >= TIER_TABLE.len() {
            return None;
        }
        let from = self.tier;
        self.tier += 1;
        self.last_adjustment_ms = now_ms;
        tracing::debug!(from, to = self.tier, "quality downgrade");
        Some(TierChange { from, to: self.tier })
    }

    fn upgrade(&mut self, now_ms: f64) -> Option<TierChange> {
        if self.locked || self.tier == 0 {
            return None;
        }
        let from = self.tier;
        self.tier -= 1;
        self.last_adjustment_ms = now_ms;
        tracing::debug!(from, to = self.tier, "quality upgrade");
        Some(TierChange { from, to: self.tier })
    }

    /// Pick a starting tier from a benchmark sample: thresholds at
    /// target * {0.5, 0.8, 1.0, 1.5} map to tiers 0..4.
    pub fn calibrate_from_benchmark(&mut self, sample_ms: f64) -> usize {
        let t = self.config.target_ms;
        self.tier = if sample_ms < 0.5 * t {
            0
        } else if sample_ms < 0.8 * t {
            1
        } else if sample_ms < 1.0 * t {
            2
        } else if sample_ms < 1.5 * t {
            3
        } else {
            4
        };
        self.tier
    }

    /// Force a tier. Does not disturb the cooldown.
    pub fn set_tier(&mut self, tier: usize) {
        self.tier = tier.min(TIER_TABLE.len() - 1);
    }

    /// Prevent transitions until `unlock`.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn unlock(&mut self) {
        self.locked = false;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Clear windows, counters and cooldown; keep the current tier.
    pub fn reset(&mut self) {
        self.ring.fill(0.0);
        self.ring_pos = 0;
        self.ring_filled = 0;
        self.frames_since_eval = 0;
        self.good_windows = 0;
        self.bad_windows = 0;
        self.critical_in_a_row = 0;
        self.last_adjustment_ms = f64::NEG_INFINITY;
    }
}
