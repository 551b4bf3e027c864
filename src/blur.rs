// blur.rs — Separable Gaussian background blur.
//
// CPU reference for shaders/blur.wgsl.
//
// The blur-mode background is produced at half resolution (nobody can see
// detail in a defocused background, and the kernel cost drops 4x), with a
// 13-tap separable Gaussian run as three full horizontal+vertical
// iterations. Iterations two and three shrink the radius to 0.7x, which
// approximates a much wider single-pass kernel without ringing.
//
// The 13 tap weights are fixed (sigma = 2 in tap units) and the radius
// acts as a scalar multiplier on the tap spacing, matching the shader's
// `direction` uniform of (radius/6 / W', 0) or (0, radius/6 / H').

use crate::frame::Frame;

pub const BLUR_TAPS: usize = 13;

/// Normalised 13-tap Gaussian weights, sigma = 2 tap units.
pub fn blur_weights() -> [f32; BLUR_TAPS] {
    let mut w = [0.0f32; BLUR_TAPS];
    let sigma = 2.0f32;
    let mut sum = 0.0;
    for (i, wi) in w.iter_mut().enumerate() {
        let d = i as f32 - 6.0;
        *wi = (-(d * d) / (2.0 * sigma * sigma)).exp();
        sum += *wi;
    }
    for wi in w.iter_mut() {
        *wi /= sum;
    }
    w
}

/// One 13-tap pass along `direction` ((1, 0) or (0, 1)). `radius` scales
/// the tap spacing so the footprint spans roughly ±radius texels.
pub fn blur_pass(src: &Frame, direction: (f32, f32), radius: f32, out: &mut Frame) {
    let w = src.width();
    let h = src.height();
    assert_eq!((out.width(), out.height()), (w, h), "output dims");

    let weights = blur_weights();
    let step = radius / 6.0;

    for y in 0..h {
        for x in 0..w {
            let mut acc = [0.0f32; 3];
            for (i, &wi) in weights.iter().enumerate() {
                let off = (i as f32 - 6.0) * step;
                let s = src.sample_bilinear(
                    x as f32 + off * direction.0,
                    y as f32 + off * direction.1,
                );
                acc[0] += s[0] * wi;
                acc[1] += s[1] * wi;
                acc[2] += s[2] * wi;
            }
            out.set_rgb(x, y, acc);
        }
    }
}

/// Three full separable iterations into `out`, ping-ponging through
/// `scratch`. Iterations 2 and 3 run at 0.7x radius.
pub fn blur_iterated(src: &Frame, radius: f32, scratch: &mut Frame, out: &mut Frame) {
    blur_pass(src, (1.0, 0.0), radius, scratch);
    blur_pass(scratch, (0.0, 1.0), radius, out);
    let reduced = radius * 0.7;
    for _ in 0..2 {
        blur_pass(out, (1.0, 0.0), reduced, scratch);
        blur_pass(scratch, (0.0, 1.0), reduced, out);
    }
}

/// 2x2 box downscale to half resolution (rounding down on odd sizes).
pub fn downscale_half(src: &Frame, out: &mut Frame) {
    let hw = out.width();
    let hh = out.height();
    assert!(hw <= src.width().div_ceil(2) && hh <= src.height().div_ceil(2));
    for y in 0..hh {
        for x in 0..hw {
            let x0 = (2 * x).min(src.width() - 1);
            let y0 = (2 * y).min(src.height() - 1);
            let x1 = (2 * x + 1).min(src.width() - 1);
            let y1 = (2 * y + 1).min(src.height() - 1);
            let mut acc = [0.0f32; 3];
            for (sx, sy) in [(x0, y0), (x1, y0), (x0, y1), (x1, y1)] {
                let p = src.rgb(sx, sy);
                acc[0] += p[0];
                acc[1] += p[1];
                acc[2] += p[2];
            }
            out.set_rgb(x, y, [acc[0] / 4.0, acc[1] / 4.0, acc[2] / 4.0]);
        }
    }
}
