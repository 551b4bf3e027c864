// demos/offline_frames.rs — Offline composite, written as PNGs.
//
// Processes a short synthetic sequence through the CPU pipeline in each
// background mode and writes the results next to the current directory:
//
//   cargo run --example offline_frames
//
// Useful for eyeballing the matting quality without a camera or a GPU.

use anyhow::Result;

use greenroom::config::{BackgroundMode, PipelineConfig};
use greenroom::pipeline::{Compositor, CpuPipeline};
use greenroom::{Frame, Image};

const W: usize = 640;
const H: usize = 360;

fn synth_frame() -> Frame {
    let mut f = Frame::new(W, H);
    for y in 0..H {
        for x in 0..W {
            let stripe = (((x + y * 2) / 12) % 2) as f32;
            f.set_rgb(x, y, [0.25 + 0.2 * stripe, 0.3, 0.35 - 0.1 * stripe]);
        }
    }
    for y in 0..H {
        for x in 0..W {
            let dx = (x as f32 / W as f32 - 0.5) / 0.12;
            let dy = (y as f32 / H as f32 - 0.55) / 0.35;
            if dx * dx + dy * dy < 1.0 {
                f.set_rgb(x, y, [0.85, 0.7, 0.6]);
            }
        }
    }
    f
}

fn synth_mask(m: usize, n: usize) -> Image<f32> {
    let mut img = Image::new(m, n);
    for y in 0..n {
        for x in 0..m {
            let dx = (x as f32 / m as f32 - 0.5) / 0.12;
            let dy = (y as f32 / n as f32 - 0.55) / 0.35;
            let d = dx * dx + dy * dy;
            // Soft edge to exercise the matting path.
            img.set(x, y, (1.2 - d).clamp(0.0, 1.0).min(0.97));
        }
    }
    img
}

fn save(frame: &Frame, path: &str) -> Result<()> {
    let img = image::RgbaImage::from_raw(W as u32, H as u32, frame.as_rgba().to_vec())
        .expect("buffer size matches");
    img.save(path)?;
    println!("wrote {path}");
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let frame = synth_frame();
    let mask = synth_mask(160, 160);

    let mut bg_image = Frame::new(W, H);
    for y in 0..H {
        for x in 0..W {
            bg_image.set_rgb(x, y, [0.1, 0.15, 0.4 + 0.2 * (y as f32 / H as f32)]);
        }
    }

    let modes: [(&str, BackgroundMode); 3] = [
        ("blur", BackgroundMode::Blur { radius: 14.0 }),
        ("color", BackgroundMode::color_from_rgb24(0x104020)),
        (
            "image",
            BackgroundMode::Image { image: bg_image, match_strength: 0.2, fixed: false },
        ),
    ];

    for (name, mode) in modes {
        let mut cfg = PipelineConfig::new(W, H, 160, 160);
        cfg.background = mode;
        let mut pipe = CpuPipeline::new(cfg)?;
        // A few frames so the temporal stage settles.
        for _ in 0..3 {
            pipe.process(&frame, &mask, None)?;
        }
        save(pipe.surface(), &format!("greenroom_{name}.png"))?;
    }
    Ok(())
}
