// image.rs — Runtime-sized single-channel image container.
//
// The workhorse buffer type of the crate: person-confidence masks, motion
// maps and intermediate mask-space stages are all `Image<f32>` with values
// in [0, 1]. `Image<u8>` exists for unorm masks delivered by producers that
// quantise their output.
//
// Memory layout is row-major with an explicit stride in *elements*:
//
//   data index:  0  1  2  3 [4]  5  6  7  8 [9] 10 11 12 13 [14]
//   pixel:       ■  ■  ■  ■  ·   ■  ■  ■  ■  ·   ■  ■  ■  ■  ·
//   row:         |--- row 0 ---|  |--- row 1 ---|  |--- row 2 ---|
//
// stride >= width; padding elements exist so rows can start at aligned
// addresses for the GPU staging-buffer copy in gpu/texture.rs. Most masks
// are allocated with stride == width.

use std::fmt;

// ---------------------------------------------------------------------------
// MaskPixel trait
// ---------------------------------------------------------------------------

/// Trait for types that can serve as pixel values in an `Image`.
///
/// `to_unit`/`from_unit` convert to and from the [0, 1] confidence range:
/// `u8` maps 0..=255 onto the unit interval, `f32` is the identity.
pub trait MaskPixel: Copy + Default + Send + Sync + PartialOrd + 'static {
    /// Convert this pixel to a confidence value in [0, 1].
    fn to_unit(self) -> f32;

    /// Construct a pixel from a confidence value (clamped to [0, 1]).
    fn from_unit(v: f32) -> Self;
}

impl MaskPixel for u8 {
    #[inline]
    fn to_unit(self) -> f32 {
        self as f32 / 255.0
    }

    #[inline]
    fn from_unit(v: f32) -> Self {
        (v.clamp(0.0, 1.0) * 255.0).round() as u8
    }
}

impl MaskPixel for f32 {
    #[inline]
    fn to_unit(self) -> f32 {
        self
    }

    #[inline]
    fn from_unit(v: f32) -> Self {
        v.clamp(0.0, 1.0)
    }
}

// ---------------------------------------------------------------------------
// Image<T>
// ---------------------------------------------------------------------------

/// A 2D single-channel image with runtime dimensions.
pub struct Image<T: MaskPixel> {
    /// Pixel data in row-major order. Length = height * stride.
    data: Vec<T>,
    /// Image width in pixels.
    width: usize,
    /// Image height in pixels.
    height: usize,
    /// Row stride in elements (not bytes). stride >= width.
    stride: usize,
}

impl<T: MaskPixel> Image<T> {
    /// Create a zero-filled image with stride == width.
    pub fn new(width: usize, height: usize) -> Self {
        Image {
            data: vec![T::default(); width * height],
            width,
            height,
            stride: width,
        }
    }

    /// Create a zero-filled image with an explicit stride.
    ///
    /// # Panics
    /// Panics if `stride < width`.
    pub fn new_with_stride(width: usize, height: usize, stride: usize) -> Self {
        assert!(stride >= width, "stride {stride} < width {width}");
        Image {
            data: vec![T::default(); stride * height],
            width,
            height,
            stride,
        }
    }

    /// Wrap an existing buffer (stride == width).
    ///
    /// # Panics
    /// Panics if `data.len() != width * height`.
    pub fn from_vec(width: usize, height: usize, data: Vec<T>) -> Self {
        assert_eq!(
            data.len(),
            width * height,
            "buffer length {} != {width}x{height}",
            data.len()
        );
        Image { data, width, height, stride: width }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Read the pixel at (x, y).
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> T {
        debug_assert!(x < self.width && y < self.height, "({x}, {y}) out of bounds");
        self.data[y * self.stride + x]
    }

    /// Write the pixel at (x, y).
    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: T) {
        debug_assert!(x < self.width && y < self.height, "({x}, {y}) out of bounds");
        self.data[y * self.stride + x] = value;
    }

    /// Read the pixel at clamped coordinates — negative or past-the-edge
    /// indices snap to the nearest valid pixel. Kernel loops use this for
    /// duplicate-extend boundary behaviour.
    #[inline]
    pub fn get_clamped(&self, x: isize, y: isize) -> T {
        let cx = x.clamp(0, self.width as isize - 1) as usize;
        let cy = y.clamp(0, self.height as isize - 1) as usize;
        self.data[cy * self.stride + cx]
    }

    /// One image row (active pixels only, padding excluded).
    pub fn row(&self, y: usize) -> &[T] {
        let start = y * self.stride;
        &self.data[start..start + self.width]
    }

    pub fn row_mut(&mut self, y: usize) -> &mut [T] {
        let start = y * self.stride;
        &mut self.data[start..start + self.width]
    }

    /// Iterate over (x, y, value) for every active pixel.
    pub fn pixels(&self) -> impl Iterator<Item = (usize, usize, T)> + '_ {
        (0..self.height).flat_map(move |y| {
            (0..self.width).map(move |x| (x, y, self.get(x, y)))
        })
    }

    /// The raw buffer, including any stride padding.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Set every active pixel to `value`. Padding elements are untouched.
    pub fn fill(&mut self, value: T) {
        for y in 0..self.height {
            let start = y * self.stride;
            self.data[start..start + self.width].fill(value);
        }
    }

    /// Copy the active pixels of `src` into this image.
    ///
    /// # Panics
    /// Panics if dimensions differ. Strides may differ.
    pub fn copy_from(&mut self, src: &Image<T>) {
        assert_eq!(self.width, src.width, "width mismatch");
        assert_eq!(self.height, src.height, "height mismatch");
        for y in 0..self.height {
            let d = y * self.stride;
            let s = y * src.stride;
            self.data[d..d + self.width].copy_from_slice(&src.data[s..s + self.width]);
        }
    }
}

impl Image<f32> {
    /// Duplicate-extend the `pad` outermost rows and columns from their
    /// inward neighbours: every pixel within `pad` of an edge is replaced
    /// by the value at the nearest pixel that is exactly `pad` pixels in.
    ///
    /// Applied to every mask before GPU upload so that wide-kernel stages
    /// (bilateral, feather) never sample the model's unreliable border
    /// band. With `pad` = 4 the 4 outermost rows/cols equal the values at
    /// the 5th-from-outside row/col.
    pub fn pad_edges(&mut self, pad: usize) {
        if self.width <= 2 * pad || self.height <= 2 * pad {
            return;
        }
        for y in 0..pad {
            let src_top = self.row(pad).to_vec();
            self.row_mut(y).copy_from_slice(&src_top);
            let src_bot = self.row(self.height - 1 - pad).to_vec();
            self.row_mut(self.height - 1 - y).copy_from_slice(&src_bot);
        }
        for y in 0..self.height {
            let left = self.get(pad, y);
            let right = self.get(self.width - 1 - pad, y);
            for x in 0..pad {
                self.set(x, y, left);
                self.set(self.width - 1 - x, y, right);
            }
        }
    }

    /// Element-wise `|self − other|` written into `out`. All three images
    /// must share dimensions. `out` is reused across frames by the adapter.
    pub fn absdiff_into(&self, other: &Image<f32>, out: &mut Image<f32>) {
        assert_eq!(self.width, other.width);
        assert_eq!(self.height, other.height);
        assert_eq!(self.width, out.width);
        assert_eq!(self.height, out.height);
        for y in 0..self.height {
            for x in 0..self.width {
                out.set(x, y, (self.get(x, y) - other.get(x, y)).abs());
            }
        }
    }

    /// Mean of all active pixels. Zero-area images return 0.
    pub fn mean(&self) -> f32 {
        if self.width == 0 || self.height == 0 {
            return 0.0;
        }
        let mut sum = 0.0f64;
        for y in 0..self.height {
            for &v in self.row(y) {
                sum += v as f64;
            }
        }
        (sum / (self.width * self.height) as f64) as f32
    }
}

impl<T: MaskPixel> Clone for Image<T> {
    fn clone(&self) -> Self {
        Image {
            data: self.data.clone(),
            width: self.width,
            height: self.height,
            stride: self.stride,
        }
    }
}

impl<T: MaskPixel + fmt::Debug> fmt::Debug for Image<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Image {{ {}x{}, stride {} }}",
            self.width, self.height, self.stride
        )
    }
}

// ---------------------------------------------------------------------------
// Bilinear interpolation
// ---------------------------------------------------------------------------

/// Sample `img` at fractional coordinates with bilinear filtering.
///
/// Coordinates are in pixel space ((0,0) = centre of the top-left pixel).
/// Out-of-range coordinates clamp to the image border — never zero-fill,
/// so a shifted mask does not grow a black frame at the leading edge.
pub fn sample_bilinear(img: &Image<f32>, x: f32, y: f32) -> f32 {
    let xc = x.clamp(0.0, (img.width() - 1) as f32);
    let yc = y.clamp(0.0, (img.height() - 1) as f32);
    let x0 = xc.floor() as usize;
    let y0 = yc.floor() as usize;
    let x1 = (x0 + 1).min(img.width() - 1);
    let y1 = (y0 + 1).min(img.height() - 1);
    let fx = xc - x0 as f32;
    let fy = yc - y0 as f32;

    let top = img.get(x0, y0) * (1.0 - fx) + img.get(x1, y0) * fx;
    let bot = img.get(x0, y1) * (1.0 - fx) + img.get(x1, y1) * fx;
    top * (1.0 - fy) + bot * fy
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_zero_filled() {
        let img = Image::<f32>::new(4, 3);
        assert_eq!(img.width(), 4);
        assert_eq!(img.height(), 3);
        assert!(img.pixels().all(|(_, _, v)| v == 0.0));
    }

    #[test]
    fn test_get_set_round_trip() {
        let mut img = Image::<f32>::new(5, 5);
        img.set(2, 3, 0.75);
        assert_eq!(img.get(2, 3), 0.75);
        assert_eq!(img.get(3, 2), 0.0);
    }

    #[test]
    fn test_stride_rows_are_independent() {
        let mut img = Image::<f32>::new_with_stride(3, 2, 8);
        img.set(2, 0, 1.0);
        img.set(0, 1, 0.5);
        assert_eq!(img.row(0), &[0.0, 0.0, 1.0]);
        assert_eq!(img.row(1), &[0.5, 0.0, 0.0]);
        assert_eq!(img.as_slice().len(), 16);
    }

    #[test]
    fn test_get_clamped_snaps_to_border() {
        let mut img = Image::<f32>::new(3, 3);
        img.set(0, 0, 0.25);
        img.set(2, 2, 0.5);
        assert_eq!(img.get_clamped(-5, -5), 0.25);
        assert_eq!(img.get_clamped(10, 10), 0.5);
        assert_eq!(img.get_clamped(1, 1), 0.0);
    }

    #[test]
    fn test_u8_unit_conversion() {
        assert_eq!(255u8.to_unit(), 1.0);
        assert_eq!(0u8.to_unit(), 0.0);
        assert_eq!(u8::from_unit(1.0), 255);
        assert_eq!(u8::from_unit(0.5), 128);
        assert_eq!(u8::from_unit(2.0), 255, "out of range clamps");
    }

    #[test]
    fn test_pad_edges_duplicates_interior() {
        // 12x12 ramp; after pad_edges(4) the 4 outermost rows/cols must
        // equal the values at the 5th-from-outside row/col.
        let mut img = Image::<f32>::new(12, 12);
        for y in 0..12 {
            for x in 0..12 {
                img.set(x, y, (y * 12 + x) as f32 / 144.0);
            }
        }
        img.pad_edges(4);
        for i in 0..4 {
            for x in 4..8 {
                assert_eq!(img.get(x, i), img.get(x, 4), "top band row {i}");
                assert_eq!(img.get(x, 11 - i), img.get(x, 7), "bottom band row {i}");
            }
            for y in 0..12 {
                assert_eq!(img.get(i, y), img.get(4, y), "left band col {i}");
                assert_eq!(img.get(11 - i, y), img.get(7, y), "right band col {i}");
            }
        }
    }

    #[test]
    fn test_pad_edges_small_image_is_noop() {
        let mut img = Image::<f32>::new(6, 6);
        img.set(0, 0, 0.9);
        img.pad_edges(4);
        assert_eq!(img.get(0, 0), 0.9, "image smaller than 2*pad is untouched");
    }

    #[test]
    fn test_absdiff_into() {
        let mut a = Image::<f32>::new(2, 2);
        let mut b = Image::<f32>::new(2, 2);
        let mut out = Image::<f32>::new(2, 2);
        a.set(0, 0, 0.8);
        b.set(0, 0, 0.3);
        b.set(1, 1, 0.4);
        a.absdiff_into(&b, &mut out);
        assert!((out.get(0, 0) - 0.5).abs() < 1e-6);
        assert!((out.get(1, 1) - 0.4).abs() < 1e-6);
        assert_eq!(out.get(1, 0), 0.0);
    }

    #[test]
    fn test_sample_bilinear_interpolates() {
        let mut img = Image::<f32>::new(2, 1);
        img.set(0, 0, 0.0);
        img.set(1, 0, 1.0);
        assert!((sample_bilinear(&img, 0.5, 0.0) - 0.5).abs() < 1e-6);
        assert_eq!(sample_bilinear(&img, 0.0, 0.0), 0.0);
        assert_eq!(sample_bilinear(&img, 1.0, 0.0), 1.0);
    }

    #[test]
    fn test_sample_bilinear_clamps_not_zero_fills() {
        let mut img = Image::<f32>::new(2, 2);
        img.fill(0.7);
        assert_eq!(sample_bilinear(&img, -3.0, 0.5), 0.7);
        assert_eq!(sample_bilinear(&img, 5.0, 5.0), 0.7);
    }

    #[test]
    fn test_mean() {
        let mut img = Image::<f32>::new(2, 2);
        img.set(0, 0, 1.0);
        assert!((img.mean() - 0.25).abs() < 1e-6);
    }
}
