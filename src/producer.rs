// producer.rs — External mask producer interface.
//
// The engine never runs a segmentation model itself. Anything that can
// turn an RGB tile into per-class confidence maps plugs in behind the
// `MaskProducer` trait; the adapter owns a `Box<dyn MaskProducer>` so
// backends can be swapped without touching the pipeline.
//
// Class-count convention (matches the common model families):
//   >= 3 maps  → multiclass semantic head; person = 1 − background class,
//                and the background class is map 0.
//   1..2 maps  → matting-style head; person confidence is the last map.

use std::fmt;

use crate::frame::Frame;

// ---------------------------------------------------------------------------
// ConfidenceMap
// ---------------------------------------------------------------------------

/// One single-channel confidence map from a producer, values in [0, 1],
/// row-major, tightly packed.
pub struct ConfidenceMap {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl ConfidenceMap {
    /// # Panics
    /// Panics if `data.len() != width * height`.
    pub fn new(width: usize, height: usize, data: Vec<f32>) -> Self {
        assert_eq!(data.len(), width * height, "confidence map size");
        ConfidenceMap { width, height, data }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Consume the map, releasing its buffer to the caller.
    pub fn into_data(self) -> Vec<f32> {
        self.data
    }
}

impl fmt::Debug for ConfidenceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConfidenceMap {{ {}x{} }}", self.width, self.height)
    }
}

// ---------------------------------------------------------------------------
// Class layout
// ---------------------------------------------------------------------------

/// How person confidence is derived from a producer's output maps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClassLayout {
    /// Semantic head: person = 1 − background (map 0).
    Multiclass,
    /// Matting head: person confidence is the last map.
    PersonChannel,
}

impl ClassLayout {
    pub fn detect(map_count: usize) -> Self {
        if map_count >= 3 {
            ClassLayout::Multiclass
        } else {
            ClassLayout::PersonChannel
        }
    }
}

/// Write the person confidence derived from `maps` into `out` (length
/// width*height of the maps). Returns false if `maps` is empty.
pub fn extract_person_confidence(maps: &[ConfidenceMap], out: &mut [f32]) -> bool {
    if maps.is_empty() {
        return false;
    }
    match ClassLayout::detect(maps.len()) {
        ClassLayout::Multiclass => {
            let bg = maps[0].as_slice();
            assert_eq!(out.len(), bg.len(), "person buffer size");
            for (o, &b) in out.iter_mut().zip(bg) {
                *o = (1.0 - b).clamp(0.0, 1.0);
            }
        }
        ClassLayout::PersonChannel => {
            let person = maps[maps.len() - 1].as_slice();
            assert_eq!(out.len(), person.len(), "person buffer size");
            out.copy_from_slice(person);
        }
    }
    true
}

// ---------------------------------------------------------------------------
// Errors and the trait
// ---------------------------------------------------------------------------

/// A single inference call failed. The adapter absorbs this by reusing the
/// previous mask; it never reaches the pipeline as an error.
#[derive(Debug)]
pub struct ProducerError(pub String);

impl fmt::Display for ProducerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mask producer inference failed: {}", self.0)
    }
}

impl std::error::Error for ProducerError {}

/// An external segmentation backend.
///
/// `input` is an RGB tile already downscaled to the model's expected
/// dimensions; `timestamp_ms` is the source frame's monotonic timestamp.
/// Returned maps must all share `input`'s dimensions.
pub trait MaskProducer: Send {
    fn produce(
        &mut self,
        input: &Frame,
        timestamp_ms: f64,
    ) -> Result<Vec<ConfidenceMap>, ProducerError>;

    /// Drop any temporal state (recurrent models). Default: no-op.
    fn reset(&mut self) {}
}

// ---------------------------------------------------------------------------
// Mock producers (tests, benches, demos)
// ---------------------------------------------------------------------------

pub mod mock {
    //! Deterministic synthetic producers. No model, no I/O.

    use super::{ConfidenceMap, MaskProducer, ProducerError};
    use crate::frame::Frame;

    /// Emits a single-channel map with a solid axis-aligned box of
    /// confidence `value`, at a position that may move linearly with time.
    pub struct BoxProducer {
        /// Box centre at t=0, normalised.
        pub cx: f32,
        pub cy: f32,
        /// Box size, normalised.
        pub w: f32,
        pub h: f32,
        /// Centre velocity in normalised units per second.
        pub vx: f32,
        pub vy: f32,
        /// Confidence inside the box.
        pub value: f32,
    }

    impl BoxProducer {
        /// A static centred person-ish box.
        pub fn centered(w: f32, h: f32) -> Self {
            BoxProducer { cx: 0.5, cy: 0.5, w, h, vx: 0.0, vy: 0.0, value: 1.0 }
        }

        /// A uniform map (use 0.0 for "no person anywhere").
        pub fn uniform(value: f32) -> Self {
            BoxProducer { cx: 0.5, cy: 0.5, w: 2.0, h: 2.0, vx: 0.0, vy: 0.0, value }
        }
    }

    impl MaskProducer for BoxProducer {
        fn produce(
            &mut self,
            input: &Frame,
            timestamp_ms: f64,
        ) -> Result<Vec<ConfidenceMap>, ProducerError> {
            let m = input.width();
            let n = input.height();
            let t = (timestamp_ms / 1000.0) as f32;
            let cx = self.cx + self.vx * t;
            let cy = self.cy + self.vy * t;

            let mut data = vec![0.0f32; m * n];
            let x0 = ((cx - self.w / 2.0) * m as f32).floor().max(0.0) as usize;
            let y0 = ((cy - self.h / 2.0) * n as f32).floor().max(0.0) as usize;
            let x1 = (((cx + self.w / 2.0) * m as f32) as usize).min(m.saturating_sub(1));
            let y1 = (((cy + self.h / 2.0) * n as f32) as usize).min(n.saturating_sub(1));
            if x0 <= x1 && y0 <= y1 {
                for y in y0..=y1 {
                    for x in x0..=x1 {
                        data[y * m + x] = self.value;
                    }
                }
            }
            Ok(vec![ConfidenceMap::new(m, n, data)])
        }
    }

    /// Wraps another producer and re-emits its person map as a 3-class
    /// output (background, filler, person) to exercise the multiclass path.
    pub struct Multiclass<P>(pub P);

    impl<P: MaskProducer> MaskProducer for Multiclass<P> {
        fn produce(
            &mut self,
            input: &Frame,
            timestamp_ms: f64,
        ) -> Result<Vec<ConfidenceMap>, ProducerError> {
            let maps = self.0.produce(input, timestamp_ms)?;
            let person = maps.into_iter().next_back().expect("inner producer emits maps");
            let (w, h) = (person.width(), person.height());
            let person_data = person.into_data();
            let bg: Vec<f32> = person_data.iter().map(|&p| 1.0 - p).collect();
            let filler = vec![0.0f32; w * h];
            Ok(vec![
                ConfidenceMap::new(w, h, bg),
                ConfidenceMap::new(w, h, filler),
                ConfidenceMap::new(w, h, person_data),
            ])
        }
    }

    /// Fails every call. Exercises the previous-mask fallback.
    pub struct Failing;

    impl MaskProducer for Failing {
        fn produce(
            &mut self,
            _input: &Frame,
            _timestamp_ms: f64,
        ) -> Result<Vec<ConfidenceMap>, ProducerError> {
            Err(ProducerError("synthetic failure".into()))
        }
    }

    /// Fails after the first `good` successful calls.
    pub struct FailingAfter<P> {
        pub inner: P,
        pub good: usize,
        calls: usize,
    }

    impl<P> FailingAfter<P> {
        pub fn new(inner: P, good: usize) -> Self {
            FailingAfter { inner, good, calls: 0 }
        }
    }

    impl<P: MaskProducer> MaskProducer for FailingAfter<P> {
        fn produce(
            &mut self,
            input: &Frame,
            timestamp_ms: f64,
        ) -> Result<Vec<ConfidenceMap>, ProducerError> {
            self.calls += 1;
            if self.calls > self.good {
                return Err(ProducerError(format!("failing after {} calls", self.good)));
            }
            self.inner.produce(input, timestamp_ms)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_layout_detection() {
        assert_eq!(ClassLayout::detect(1), ClassLayout::PersonChannel);
        assert_eq!(ClassLayout::detect(2), ClassLayout::PersonChannel);
        assert_eq!(ClassLayout::detect(3), ClassLayout::Multiclass);
        assert_eq!(ClassLayout::detect(21), ClassLayout::Multiclass);
    }

    #[test]
    fn test_extract_person_single_channel() {
        let maps = vec![ConfidenceMap::new(2, 1, vec![0.2, 0.9])];
        let mut out = vec![0.0f32; 2];
        assert!(extract_person_confidence(&maps, &mut out));
        assert_eq!(out, vec![0.2, 0.9]);
    }

    #[test]
    fn test_extract_person_two_channels_uses_last() {
        let maps = vec![
            ConfidenceMap::new(2, 1, vec![0.8, 0.1]),
            ConfidenceMap::new(2, 1, vec![0.3, 0.7]),
        ];
        let mut out = vec![0.0f32; 2];
        assert!(extract_person_confidence(&maps, &mut out));
        assert_eq!(out, vec![0.3, 0.7]);
    }

    #[test]
    fn test_extract_person_multiclass_inverts_background() {
        let maps = vec![
            ConfidenceMap::new(2, 1, vec![0.9, 0.25]), // background
            ConfidenceMap::new(2, 1, vec![0.0, 0.0]),
            ConfidenceMap::new(2, 1, vec![0.1, 0.75]),
        ];
        let mut out = vec![0.0f32; 2];
        assert!(extract_person_confidence(&maps, &mut out));
        assert!((out[0] - 0.1).abs() < 1e-6);
        assert!((out[1] - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_extract_person_empty() {
        let mut out = vec![0.0f32; 4];
        assert!(!extract_person_confidence(&[], &mut out));
    }

    #[test]
    fn test_box_producer_emits_box() {
        let mut p = mock::BoxProducer::centered(0.5, 0.5);
        let maps = p.produce(&Frame::new(32, 32), 0.0).unwrap();
        assert_eq!(maps.len(), 1);
        let m = &maps[0];
        assert_eq!((m.width(), m.height()), (32, 32));
        let data = m.as_slice();
        assert_eq!(data[16 * 32 + 16], 1.0, "centre inside box");
        assert_eq!(data[0], 0.0, "corner outside box");
    }

    #[test]
    fn test_box_producer_moves_with_time() {
        let mut p = mock::BoxProducer {
            cx: 0.25, cy: 0.5, w: 0.2, h: 0.2, vx: 0.25, vy: 0.0, value: 1.0,
        };
        let at0 = p.produce(&Frame::new(64, 64), 0.0).unwrap();
        let at1s = p.produce(&Frame::new(64, 64), 1000.0).unwrap();
        // At t=1s the centre has moved from 0.25 to 0.5.
        assert_eq!(at0[0].as_slice()[32 * 64 + 16], 1.0);
        assert_eq!(at1s[0].as_slice()[32 * 64 + 16], 0.0);
        assert_eq!(at1s[0].as_slice()[32 * 64 + 32], 1.0);
    }

    #[test]
    fn test_multiclass_wrapper_round_trips() {
        let mut p = mock::Multiclass(mock::BoxProducer::centered(0.5, 0.5));
        let maps = p.produce(&Frame::new(16, 16), 0.0).unwrap();
        assert_eq!(maps.len(), 3);
        let mut out = vec![0.0f32; 16 * 16];
        extract_person_confidence(&maps, &mut out);
        assert_eq!(out[8 * 16 + 8], 1.0, "person recovered through multiclass path");
        assert_eq!(out[0], 0.0);
    }
}
