// benches/benchmarks.rs — Per-stage and full-pipeline benchmarks.
//
// All synthetic, always runnable:
//   cargo bench
//
// The per-stage numbers are what the quality tiers were budgeted
// against; the full-pipeline benchmark is the input to
// `calibrate_from_benchmark`.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use greenroom::config::{BackgroundMode, PipelineConfig};
use greenroom::pipeline::{Compositor, CpuPipeline};
use greenroom::temporal::{temporal_smooth, TemporalParams};
use greenroom::{blur, composite, feather, morphology, resample};
use greenroom::{Frame, Image};

// ============================================================
// Helpers
// ============================================================

/// Synthetic camera frame: gradient plus a person-ish bright region.
fn make_frame(w: usize, h: usize) -> Frame {
    let mut f = Frame::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let r = x as f32 / w as f32;
            let g = y as f32 / h as f32;
            f.set_rgb(x, y, [r, g, 0.5]);
        }
    }
    for y in h / 4..(3 * h / 4) {
        for x in w / 3..(2 * w / 3) {
            f.set_rgb(x, y, [0.8, 0.7, 0.6]);
        }
    }
    f
}

/// Mask with a soft-edged person box.
fn make_mask(m: usize, n: usize) -> Image<f32> {
    let mut img = Image::new(m, n);
    for y in n / 4..(3 * n / 4) {
        for x in m / 3..(2 * m / 3) {
            img.set(x, y, 0.95);
        }
    }
    img
}

// ============================================================
// Per-stage benchmarks
// ============================================================

fn bench_temporal(c: &mut Criterion) {
    let current = make_mask(256, 256);
    let previous = make_mask(256, 256);
    let mut out = Image::new(256, 256);
    let params = TemporalParams::default();
    c.bench_function("temporal_smooth_256", |b| {
        b.iter(|| temporal_smooth(&current, &previous, None, &params, &mut out))
    });
}

fn bench_morphology(c: &mut Criterion) {
    let src = make_mask(256, 256);
    let mut scratch = Image::new(256, 256);
    let mut out = Image::new(256, 256);
    c.bench_function("morph_close_256", |b| {
        b.iter(|| morphology::close(&src, 1.0, &mut scratch, &mut out))
    });
}

fn bench_bilateral(c: &mut Criterion) {
    let mut group = c.benchmark_group("bilateral_upsample");
    for (mask_size, frame_size) in [(160usize, 640usize), (256, 640)] {
        let mask = make_mask(mask_size, mask_size);
        let guide = make_frame(frame_size, frame_size * 9 / 16);
        let mut out = Image::new(guide.width(), guide.height());
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{mask_size}->{frame_size}")),
            &mask_size,
            |b, _| b.iter(|| resample::bilateral_upsample(&mask, &guide, 0.1, &mut out)),
        );
    }
    group.finish();
}

fn bench_feather(c: &mut Criterion) {
    let mut src = Image::new(640, 360);
    for y in 0..360 {
        for x in 200..440 {
            src.set(x, y, 1.0);
        }
    }
    let mut out = Image::new(640, 360);
    c.bench_function("edge_feather_640x360", |b| {
        b.iter(|| feather::edge_feather(&src, 2.0, &mut out))
    });
}

fn bench_blur(c: &mut Criterion) {
    let src = make_frame(320, 180);
    let mut scratch = Frame::new(320, 180);
    let mut out = Frame::new(320, 180);
    c.bench_function("background_blur_320x180", |b| {
        b.iter(|| blur::blur_iterated(&src, 12.0, &mut scratch, &mut out))
    });
}

fn bench_composite(c: &mut Criterion) {
    let camera = make_frame(640, 360);
    let mut mask = Image::new(640, 360);
    for y in 90..270 {
        for x in 213..426 {
            mask.set(x, y, 0.9);
        }
    }
    let bg = composite::BackgroundSource::Color([0.1, 0.4, 0.2]);
    let params = composite::CompositeParams::default();
    let mut out = Frame::new(640, 360);
    c.bench_function("composite_640x360", |b| {
        b.iter(|| composite::composite(&camera, &mask, &bg, &params, &mut out))
    });
}

// ============================================================
// Full pipeline
// ============================================================

fn bench_full_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("cpu_pipeline");
    group.sample_size(20);

    for mode in ["color", "blur"] {
        let mut cfg = PipelineConfig::new(640, 360, 160, 160);
        cfg.background = match mode {
            "blur" => BackgroundMode::Blur { radius: 12.0 },
            _ => BackgroundMode::Color { rgb: [0.0, 0.6, 0.0], fixed: false },
        };
        let mut pipe = CpuPipeline::new(cfg).unwrap();
        let frame = make_frame(640, 360);
        let mask = make_mask(160, 160);
        // Warm the temporal stage so the steady state is measured.
        pipe.process(&frame, &mask, None).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(mode), &mode, |b, _| {
            b.iter(|| pipe.process(&frame, &mask, None).unwrap())
        });
    }

    // The interpolated path (no temporal stage, no model).
    let mut cfg = PipelineConfig::new(640, 360, 160, 160);
    cfg.background = BackgroundMode::Color { rgb: [0.0, 0.6, 0.0], fixed: false };
    let mut pipe = CpuPipeline::new(cfg).unwrap();
    let frame = make_frame(640, 360);
    let mask = make_mask(160, 160);
    pipe.process(&frame, &mask, None).unwrap();
    group.bench_function("interpolated", |b| {
        b.iter(|| pipe.process_interpolated(&frame, (0.02, 0.01)).unwrap())
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_temporal,
    bench_morphology,
    bench_bilateral,
    bench_feather,
    bench_blur,
    bench_composite,
    bench_full_pipeline,
);
criterion_main!(benches);
