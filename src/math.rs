// math.rs — Scalar helpers shared by the CPU reference stages.
//
// These mirror the WGSL built-ins (smoothstep, mix, step) so that each CPU
// stage reads line-for-line like its shader counterpart, plus the
// perceptual colour distance both the bilateral and composite stages use.

/// Hermite smoothstep, identical to the WGSL built-in.
#[inline]
pub fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

/// Linear blend, identical to the WGSL built-in.
#[inline]
pub fn mix(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

#[inline]
pub fn mix3(a: [f32; 3], b: [f32; 3], t: f32) -> [f32; 3] {
    [mix(a[0], b[0], t), mix(a[1], b[1], t), mix(a[2], b[2], t)]
}

/// step(edge, x) = 1 if x >= edge else 0, identical to the WGSL built-in.
#[inline]
pub fn step(edge: f32, x: f32) -> f32 {
    if x >= edge {
        1.0
    } else {
        0.0
    }
}

#[inline]
pub fn dot3(a: [f32; 3], b: [f32; 3]) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
pub fn sub3(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
pub fn add3(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

#[inline]
pub fn scale3(a: [f32; 3], s: f32) -> [f32; 3] {
    [a[0] * s, a[1] * s, a[2] * s]
}

#[inline]
pub fn clamp3(a: [f32; 3], lo: f32, hi: f32) -> [f32; 3] {
    [a[0].clamp(lo, hi), a[1].clamp(lo, hi), a[2].clamp(lo, hi)]
}

/// Squared perceptual distance between two RGB colours.
///
/// Splits the difference into a luminance component (BT.601 weights) and a
/// chroma residual, then weights chroma 3x. The chroma boost separates
/// skin tones from near-white walls, which plain Euclidean RGB distance
/// confuses at webcam exposure levels.
#[inline]
pub fn perceptual_dist2(a: [f32; 3], b: [f32; 3]) -> f32 {
    let d = sub3(a, b);
    let lum = 0.299 * d[0] + 0.587 * d[1] + 0.114 * d[2];
    let chroma = [d[0] - lum, d[1] - lum, d[2] - lum];
    lum * lum + 3.0 * dot3(chroma, chroma)
}
