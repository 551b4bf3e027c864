// diagnostics.rs — Per-interval accumulators and summary events.
//
// Pure bookkeeping: nothing here touches processing. The processor feeds
// one record per frame; every `interval_ms` the accumulators collapse
// into a single summary event handed to the host callback.

use crate::adapter::CropRegion;
use crate::config::{DiagnosticsLevel, DiagnosticsOptions};
use crate::image::Image;

/// Timings of one processed frame, in milliseconds.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameTimings {
    pub model_ms: f64,
    pub pipeline_ms: f64,
    pub total_ms: f64,
}

/// Engine status snapshot attached to each frame record.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameStatus {
    pub quality_tier: usize,
    pub quality_label: &'static str,
    pub roi_crop: Option<CropRegion>,
    pub auto_frame_zoom: f32,
    pub context_lost: bool,
}

/// Emitted once at init.
#[derive(Clone, Debug)]
pub struct InitEvent {
    pub client_id: String,
    pub device: String,
    pub frame_width: usize,
    pub frame_height: usize,
    pub mask_width: usize,
    pub mask_height: usize,
}

/// Emitted every interval.
#[derive(Clone, Debug)]
pub struct SummaryEvent {
    pub client_id: String,
    pub fps: f64,
    pub model_fps: f64,
    pub avg_model_ms: f64,
    pub avg_pipeline_ms: f64,
    pub avg_total_ms: f64,
    pub p95_total_ms: f64,
    pub dropped_frames: u64,
    pub quality_tier: usize,
    pub quality_label: &'static str,
    pub roi_crop: Option<CropRegion>,
    pub auto_frame_zoom: f32,
    /// Mean fraction of mask pixels above the person threshold.
    pub mask_coverage: f64,
    pub bbox_at_edge_count: u64,
    pub mask_empty_count: u64,
    pub context_lost: bool,
    /// Downscaled mask snapshot (side length, row-major u8), when enabled.
    pub mask_snapshot: Option<(usize, Vec<u8>)>,
}

#[derive(Clone, Debug)]
pub enum DiagnosticEvent {
    Init(InitEvent),
    Summary(SummaryEvent),
}

pub type DiagnosticSink = Box<dyn FnMut(DiagnosticEvent) + Send>;

/// Snapshot side length when `include_image` is set.
const SNAPSHOT_SIDE: usize = 32;

pub struct Diagnostics {
    options: DiagnosticsOptions,
    sink: Option<DiagnosticSink>,

    frames: u64,
    dropped: u64,
    model_runs: u64,
    sum_model: f64,
    sum_pipeline: f64,
    sum_total: f64,
    totals: Vec<f64>,
    coverage_sum: f64,
    coverage_n: u64,
    bbox_at_edge: u64,
    mask_empty: u64,
    snapshot: Option<(usize, Vec<u8>)>,

    interval_start_ms: f64,
    started: bool,
}

impl Diagnostics {
    pub fn new(options: DiagnosticsOptions) -> Self {
        Diagnostics {
            options,
            sink: None,
            frames: 0,
            dropped: 0,
            model_runs: 0,
            sum_model: 0.0,
            sum_pipeline: 0.0,
            sum_total: 0.0,
            totals: Vec::new(),
            coverage_sum: 0.0,
            coverage_n: 0,
            bbox_at_edge: 0,
            mask_empty: 0,
            snapshot: None,
            interval_start_ms: 0.0,
            started: false,
        }
    }

    pub fn enabled(&self) -> bool {
        self.options.level != DiagnosticsLevel::Off
    }

    /// Install the host callback.
    pub fn set_sink(&mut self, sink: DiagnosticSink) {
        self.sink = Some(sink);
    }

    pub fn emit_init(&mut self, device: String, fw: usize, fh: usize, mw: usize, mh: usize) {
        if !self.enabled() {
            return;
        }
        let event = DiagnosticEvent::Init(InitEvent {
            client_id: self.options.client_id.clone(),
            device,
            frame_width: fw,
            frame_height: fh,
            mask_width: mw,
            mask_height: mh,
        });
        if let Some(sink) = &mut self.sink {
            sink(event);
        }
    }

    /// Record one fresh-mask inference: coverage, emptiness, edge contact.
    pub fn record_model_run(&mut self, mask: &Image<f32>, bbox_at_edge: bool, empty: bool) {
        if !self.enabled() {
            return;
        }
        self.model_runs += 1;
        let coverage = mask
            .as_slice()
            .iter()
            .filter(|&&v| v > crate::motion::PERSON_THRESHOLD)
            .count() as f64
            / (mask.width() * mask.height()) as f64;
        self.coverage_sum += coverage;
        self.coverage_n += 1;
        if bbox_at_edge {
            self.bbox_at_edge += 1;
        }
        if empty {
            self.mask_empty += 1;
        }
        if self.options.include_image {
            self.snapshot = Some(snapshot_mask(mask));
        }
    }

    /// A model call failed outright; counts against `mask_empty_count`
    /// only.
    pub fn record_model_failure(&mut self) {
        if self.enabled() {
            self.mask_empty += 1;
        }
    }

    pub fn record_dropped(&mut self) {
        self.dropped += 1;
    }

    /// Record one emitted frame; emits a summary when the interval is up.
    pub fn record_frame(&mut self, timings: &FrameTimings, status: &FrameStatus, now_ms: f64) {
        if !self.enabled() {
            return;
        }
        if !self.started {
            self.started = true;
            self.interval_start_ms = now_ms;
        }
        self.frames += 1;
        self.sum_model += timings.model_ms;
        self.sum_pipeline += timings.pipeline_ms;
        self.sum_total += timings.total_ms;
        self.totals.push(timings.total_ms);

        let elapsed = now_ms - self.interval_start_ms;
        if elapsed >= self.options.interval_ms && self.frames > 0 {
            self.emit_summary(status, elapsed);
            self.interval_start_ms = now_ms;
        }
    }

    fn emit_summary(&mut self, status: &FrameStatus, elapsed_ms: f64) {
        let n = self.frames.max(1) as f64;
        let mut sorted = self.totals.clone();
        sorted.sort_by(f64::total_cmp);
        let p95 = if sorted.is_empty() {
            0.0
        } else {
            let idx = ((sorted.len() as f64 * 0.95).ceil() as usize).clamp(1, sorted.len()) - 1;
            sorted[idx]
        };

        let event = DiagnosticEvent::Summary(SummaryEvent {
            client_id: self.options.client_id.clone(),
            fps: self.frames as f64 * 1000.0 / elapsed_ms.max(1.0),
            model_fps: self.model_runs as f64 * 1000.0 / elapsed_ms.max(1.0),
            avg_model_ms: self.sum_model / self.model_runs.max(1) as f64,
            avg_pipeline_ms: self.sum_pipeline / n,
            avg_total_ms: self.sum_total / n,
            p95_total_ms: p95,
            dropped_frames: self.dropped,
            quality_tier: status.quality_tier,
            quality_label: status.quality_label,
            roi_crop: status.roi_crop,
            auto_frame_zoom: status.auto_frame_zoom,
            mask_coverage: if self.coverage_n > 0 {
                self.coverage_sum / self.coverage_n as f64
            } else {
                0.0
            },
            bbox_at_edge_count: self.bbox_at_edge,
            mask_empty_count: self.mask_empty,
            context_lost: status.context_lost,
            mask_snapshot: self.snapshot.take(),
        });

        if let Some(sink) = &mut self.sink {
            sink(event);
        }

        // Interval accumulators restart; dropped is cumulative per session.
        self.frames = 0;
        self.model_runs = 0;
        self.sum_model = 0.0;
        self.sum_pipeline = 0.0;
        self.sum_total = 0.0;
        self.totals.clear();
        self.coverage_sum = 0.0;
        self.coverage_n = 0;
        self.bbox_at_edge = 0;
        self.mask_empty = 0;
    }
}

/// Nearest-neighbour downscale of the mask to a u8 thumbnail.
fn snapshot_mask(mask: &Image<f32>) -> (usize, Vec<u8>) {
    let side = SNAPSHOT_SIDE.min(mask.width()).min(mask.height());
    let mut data = Vec::with_capacity(side * side);
    for y in 0..side {
        for x in 0..side {
            let sx = x * mask.width() / side;
            let sy = y * mask.height() / side;
            data.push((mask.get(sx, sy).clamp(0.0, 1.0) * 255.0) as u8);
        }
    }
    (side, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn opts(level: DiagnosticsLevel, interval_ms: f64) -> DiagnosticsOptions {
        DiagnosticsOptions {
            level,
            interval_ms,
            include_image: false,
            client_id: "test-client".into(),
        }
    }

    fn collect() -> (Arc<Mutex<Vec<DiagnosticEvent>>>, DiagnosticSink) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = events.clone();
        let sink: DiagnosticSink = Box::new(move |e| sink_events.lock().unwrap().push(e));
        (events, sink)
    }

    #[test]
    fn test_off_level_emits_nothing() {
        let mut d = Diagnostics::new(opts(DiagnosticsLevel::Off, 100.0));
        let (events, sink) = collect();
        d.set_sink(sink);
        d.emit_init("cpu".into(), 64, 64, 32, 32);
        for i in 0..100 {
            d.record_frame(&FrameTimings::default(), &FrameStatus::default(), i as f64 * 16.0);
        }
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_summary_after_interval() {
        let mut d = Diagnostics::new(opts(DiagnosticsLevel::Summary, 500.0));
        let (events, sink) = collect();
        d.set_sink(sink);

        let timings = FrameTimings { model_ms: 5.0, pipeline_ms: 8.0, total_ms: 16.0 };
        let status = FrameStatus {
            quality_tier: 1,
            quality_label: "high",
            ..Default::default()
        };
        // ~32 frames over 512 ms crosses the 500 ms interval once.
        for i in 0..33 {
            d.record_frame(&timings, &status, i as f64 * 16.0);
        }

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            DiagnosticEvent::Summary(s) => {
                assert_eq!(s.client_id, "test-client");
                assert_eq!(s.quality_tier, 1);
                assert_eq!(s.quality_label, "high");
                assert!((s.avg_total_ms - 16.0).abs() < 1e-6);
                assert!((s.fps - 62.5).abs() < 5.0, "fps {}", s.fps);
            }
            _ => panic!("expected summary"),
        }
    }

    #[test]
    fn test_mask_stats_accumulate() {
        let mut d = Diagnostics::new(opts(DiagnosticsLevel::Summary, 100.0));
        let (events, sink) = collect();
        d.set_sink(sink);

        // Quarter-coverage mask (16x16 of 32x32).
        let mut mask = Image::new(32, 32);
        for y in 0..16 {
            for x in 0..16 {
                mask.set(x, y, 1.0);
            }
        }
        d.record_model_run(&mask, true, false);
        d.record_model_run(&Image::new(32, 32), false, true);

        d.record_frame(&FrameTimings::default(), &FrameStatus::default(), 0.0);
        d.record_frame(&FrameTimings::default(), &FrameStatus::default(), 150.0);

        let events = events.lock().unwrap();
        match &events[0] {
            DiagnosticEvent::Summary(s) => {
                assert!((s.mask_coverage - 0.125).abs() < 1e-6, "mean of 0.25 and 0");
                assert_eq!(s.bbox_at_edge_count, 1);
                assert_eq!(s.mask_empty_count, 1);
            }
            _ => panic!("expected summary"),
        }
    }

    #[test]
    fn test_init_event() {
        let mut d = Diagnostics::new(opts(DiagnosticsLevel::Summary, 100.0));
        let (events, sink) = collect();
        d.set_sink(sink);
        d.emit_init("wgpu:TestAdapter".into(), 1280, 720, 256, 256);
        let events = events.lock().unwrap();
        match &events[0] {
            DiagnosticEvent::Init(i) => {
                assert_eq!(i.device, "wgpu:TestAdapter");
                assert_eq!(i.frame_width, 1280);
                assert_eq!(i.mask_width, 256);
            }
            _ => panic!("expected init"),
        }
    }

    #[test]
    fn test_snapshot_when_enabled() {
        let mut d = Diagnostics::new(DiagnosticsOptions {
            level: DiagnosticsLevel::Summary,
            interval_ms: 10.0,
            include_image: true,
            client_id: String::new(),
        });
        let (events, sink) = collect();
        d.set_sink(sink);

        let mut mask = Image::new(64, 64);
        mask.fill(1.0);
        d.record_model_run(&mask, false, false);
        d.record_frame(&FrameTimings::default(), &FrameStatus::default(), 0.0);
        d.record_frame(&FrameTimings::default(), &FrameStatus::default(), 20.0);

        let events = events.lock().unwrap();
        match &events[0] {
            DiagnosticEvent::Summary(s) => {
                let (side, data) = s.mask_snapshot.as_ref().expect("snapshot attached");
                assert_eq!(*side, 32);
                assert!(data.iter().all(|&v| v == 255));
            }
            _ => panic!("expected summary"),
        }
    }
}
