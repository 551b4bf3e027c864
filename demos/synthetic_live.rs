// demos/synthetic_live.rs — Live window demo over a synthetic scene.
//
// Runs the full processor (CPU pipeline + mock producer) on a generated
// "person in front of a busy room" sequence and displays the composite
// in a minifb window:
//
//   cargo run --example synthetic_live
//
// Keys: B = blur mode, C = color mode, Esc = quit.

use std::time::Instant;

use anyhow::Result;
use minifb::{Key, Window, WindowOptions};

use greenroom::adaptive::Quality;
use greenroom::config::{BackgroundMode, EngineOptions, OptionsUpdate, PipelineConfig};
use greenroom::pipeline::CpuPipeline;
use greenroom::producer::{mock, MaskProducer};
use greenroom::worker::ProducerFactory;
use greenroom::{AutoFrameOptions, Frame, Processor};

const W: usize = 640;
const H: usize = 360;

/// Synthetic camera: textured background plus a bright "person" whose
/// position matches the mock producer's moving box.
fn synth_frame(t_s: f32) -> Frame {
    let mut f = Frame::new(W, H);
    for y in 0..H {
        for x in 0..W {
            // Busy background: diagonal stripes.
            let stripe = (((x + y * 2) / 12) % 2) as f32;
            f.set_rgb(x, y, [0.25 + 0.2 * stripe, 0.3, 0.35 - 0.1 * stripe]);
        }
    }
    // Person: oscillating ellipse.
    let cx = 0.5 + 0.15 * (t_s * 0.7).sin();
    let cy = 0.55;
    for y in 0..H {
        for x in 0..W {
            let dx = (x as f32 / W as f32 - cx) / 0.12;
            let dy = (y as f32 / H as f32 - cy) / 0.35;
            if dx * dx + dy * dy < 1.0 {
                f.set_rgb(x, y, [0.85, 0.7, 0.6]);
            }
        }
    }
    f
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let mut cfg = PipelineConfig::new(W, H, 160, 160);
    cfg.background = BackgroundMode::Blur { radius: 12.0 };
    let pipeline = CpuPipeline::new(cfg)?;

    // The mock producer mirrors the synthetic person's oscillation.
    let factory: ProducerFactory = std::sync::Arc::new(|| -> Box<dyn MaskProducer> {
        Box::new(mock::BoxProducer {
            cx: 0.5,
            cy: 0.55,
            w: 0.24,
            h: 0.7,
            vx: 0.0,
            vy: 0.0,
            value: 0.97,
        })
    });

    let options = EngineOptions {
        background: BackgroundMode::Blur { radius: 12.0 },
        quality: Quality::Medium,
        adaptive: true,
        auto_frame: AutoFrameOptions { enabled: false, max_zoom: 1.4, ..Default::default() },
        ..Default::default()
    };
    let mut processor = Processor::new(pipeline, factory, options);

    let mut window = Window::new("greenroom demo", W, H, WindowOptions::default())?;
    window.set_target_fps(30);

    let start = Instant::now();
    let mut buffer = vec![0u32; W * H];

    while window.is_open() && !window.is_key_down(Key::Escape) {
        if window.is_key_pressed(Key::B, minifb::KeyRepeat::No) {
            processor.update_options(&OptionsUpdate {
                background: Some(BackgroundMode::Blur { radius: 12.0 }),
                ..Default::default()
            });
        }
        if window.is_key_pressed(Key::C, minifb::KeyRepeat::No) {
            processor.update_options(&OptionsUpdate {
                background: Some(BackgroundMode::color_from_rgb24(0x104020)),
                ..Default::default()
            });
        }

        let t_ms = start.elapsed().as_secs_f64() * 1000.0;
        let frame = synth_frame((t_ms / 1000.0) as f32);

        if let Some(surface) = processor.process_frame(&frame, t_ms)? {
            for (dst, px) in buffer.iter_mut().zip(surface.as_rgba().chunks_exact(4)) {
                *dst = u32::from_be_bytes([0, px[0], px[1], px[2]]);
            }
        }
        window.update_with_buffer(&buffer, W, H)?;
    }
    Ok(())
}
