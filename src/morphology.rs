// morphology.rs — Mask dilate / erode.
//
// CPU reference for shaders/morphology.wgsl.
//
// A single 3x3 neighbourhood pass; the operation (dilate = max, erode =
// min) is selected by a 0/1 parameter so the shader can stay branchless:
// the per-sample step is `mix(max(acc, s), min(acc, s), operation)`. The
// kernel radius is a scalar multiplier on the texel step, which is how the
// pipeline reuses the same kernel for the 0.5-texel full-resolution
// erosion after feathering.
//
// A morphological close (dilate then erode) fills pinholes in the torso
// that low-resolution models produce around high-contrast clothing.

use crate::image::{sample_bilinear, Image};

/// Operation selector. Stored as 0/1 in the shader uniform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MorphOp {
    Dilate,
    Erode,
}

impl MorphOp {
    /// Uniform encoding: dilate = 0, erode = 1.
    pub fn as_uniform(self) -> f32 {
        match self {
            MorphOp::Dilate => 0.0,
            MorphOp::Erode => 1.0,
        }
    }
}

/// One 3x3 morphology pass with the given texel radius.
///
/// `radius` scales the sample offsets: 1.0 reads the 8 direct neighbours,
/// 0.5 reads half-texel offsets (bilinear), which gives the gentle
/// sub-pixel erosion used at full resolution after feathering.
pub fn morph(src: &Image<f32>, op: MorphOp, radius: f32, out: &mut Image<f32>) {
    let w = src.width();
    let h = src.height();
    assert_eq!((out.width(), out.height()), (w, h), "output dims");

    for y in 0..h {
        for x in 0..w {
            let mut acc = src.get(x, y);
            for dy in -1i32..=1 {
                for dx in -1i32..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let sx = x as f32 + dx as f32 * radius;
                    let sy = y as f32 + dy as f32 * radius;
                    let s = sample_bilinear(src, sx, sy);
                    acc = match op {
                        MorphOp::Dilate => acc.max(s),
                        MorphOp::Erode => acc.min(s),
                    };
                }
            }
            out.set(x, y, acc);
        }
    }
}

/// Morphological close: dilate into `scratch`, erode back into `out`.
pub fn close(src: &Image<f32>, radius: f32, scratch: &mut Image<f32>, out: &mut Image<f32>) {
    morph(src, MorphOp::Dilate, radius, scratch);
    morph(scratch, MorphOp::Erode, radius, out);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point_mask(w: usize, h: usize, px: usize, py: usize) -> Image<f32> {
        let mut img = Image::new(w, h);
        img.set(px, py, 1.0);
        img
    }

    #[test]
    fn test_dilate_grows_point() {
        let src = point_mask(5, 5, 2, 2);
        let mut out = Image::new(5, 5);
        morph(&src, MorphOp::Dilate, 1.0, &mut out);
        for y in 1..=3 {
            for x in 1..=3 {
                assert_eq!(out.get(x, y), 1.0, "({x},{y}) inside dilated block");
            }
        }
        assert_eq!(out.get(0, 0), 0.0, "corner untouched");
    }

    #[test]
    fn test_erode_removes_point() {
        let src = point_mask(5, 5, 2, 2);
        let mut out = Image::new(5, 5);
        morph(&src, MorphOp::Erode, 1.0, &mut out);
        assert!(out.pixels().all(|(_, _, v)| v == 0.0), "isolated pixel erodes away");
    }

    #[test]
    fn test_erode_preserves_solid_interior() {
        let mut src = Image::new(7, 7);
        for y in 1..6 {
            for x in 1..6 {
                src.set(x, y, 1.0);
            }
        }
        let mut out = Image::new(7, 7);
        morph(&src, MorphOp::Erode, 1.0, &mut out);
        for y in 2..5 {
            for x in 2..5 {
                assert_eq!(out.get(x, y), 1.0, "interior survives");
            }
        }
        assert_eq!(out.get(1, 1), 0.0, "boundary ring eroded");
    }

    #[test]
    fn test_close_fills_pinhole() {
        // Solid 5x5 block with a single-pixel hole in the middle.
        let mut src = Image::new(7, 7);
        for y in 1..6 {
            for x in 1..6 {
                src.set(x, y, 1.0);
            }
        }
        src.set(3, 3, 0.0);

        let mut scratch = Image::new(7, 7);
        let mut out = Image::new(7, 7);
        close(&src, 1.0, &mut scratch, &mut out);
        assert_eq!(out.get(3, 3), 1.0, "close fills the pinhole");
    }

    #[test]
    fn test_half_texel_radius_is_gentler_than_full() {
        let mut src = Image::new(9, 9);
        for y in 2..7 {
            for x in 2..7 {
                src.set(x, y, 1.0);
            }
        }
        let mut half = Image::new(9, 9);
        let mut full = Image::new(9, 9);
        morph(&src, MorphOp::Erode, 0.5, &mut half);
        morph(&src, MorphOp::Erode, 1.0, &mut full);

        // Edge pixel of the block: half-texel erosion keeps part of the
        // value, full-texel removes it entirely.
        assert_eq!(full.get(2, 4), 0.0);
        assert!(half.get(2, 4) > 0.0 && half.get(2, 4) < 1.0);
    }

    #[test]
    fn test_constant_mask_is_fixed_point() {
        let mut src = Image::new(5, 5);
        src.fill(0.6);
        let mut out = Image::new(5, 5);
        for op in [MorphOp::Dilate, MorphOp::Erode] {
            morph(&src, op, 1.0, &mut out);
            assert!(out.pixels().all(|(_, _, v)| (v - 0.6).abs() < 1e-6), "{op:?}");
        }
    }
}
