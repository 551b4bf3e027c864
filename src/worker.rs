// worker.rs — Off-thread mask producer.
//
// Identical output semantics to the in-thread adapter: the worker thread
// owns its own ProducerAdapter (previous-mask buffer, motion map,
// centroid tracker and all), so the caller cannot tell which variant
// produced a reply.
//
// Concurrency contract:
//   - At most one segment request in flight. `request_segment` refuses a
//     second one (returns false) instead of queueing — the caller simply
//     interpolates that frame.
//   - The request moves the frame into the channel and the reply moves
//     its buffers out; the channel transfer itself never copies.
//   - No shared state: the only cross-thread communication is the two
//     mpsc channels.
//
// Init is asynchronous with a bounded wait: the thread constructs the
// producer and signals ready; if the signal does not arrive within the
// timeout the handle reports failure and the processor falls back to an
// in-thread adapter built from the same factory.

use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use crate::adapter::{CropRegion, ProducerAdapter, SegmentStatus};
use crate::frame::Frame;
use crate::image::Image;
use crate::motion::{MotionVector, PixelBox};
use crate::producer::MaskProducer;

/// Default bound on worker startup.
pub const INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Constructs a producer instance. Called once on the worker thread; called
/// again on the caller's thread if the worker falls back.
pub type ProducerFactory = Arc<dyn Fn() -> Box<dyn MaskProducer> + Send + Sync>;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

enum Request {
    Segment {
        frame: Frame,
        timestamp_ms: f64,
        crop: Option<CropRegion>,
    },
    SetModelDims(usize, usize),
    Reset,
    Shutdown,
}

/// One completed inference, buffers owned by the receiver.
pub struct MaskReply {
    pub full_mask: Image<f32>,
    pub motion: Option<Image<f32>>,
    pub bbox: Option<PixelBox>,
    pub motion_vector: MotionVector,
    pub inference_ms: f64,
}

enum Reply {
    Ready,
    /// None: the producer failed for this request; the caller interpolates.
    Mask(Option<MaskReply>),
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum WorkerInitError {
    /// The OS refused the thread.
    Spawn(std::io::Error),
    /// No ready signal within the timeout.
    Timeout,
    /// The worker thread died during startup.
    Died,
}

impl fmt::Display for WorkerInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerInitError::Spawn(e) => write!(f, "failed to spawn mask worker: {e}"),
            WorkerInitError::Timeout => write!(f, "mask worker init timed out"),
            WorkerInitError::Died => write!(f, "mask worker died during init"),
        }
    }
}

impl std::error::Error for WorkerInitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WorkerInitError::Spawn(e) => Some(e),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// WorkerHandle
// ---------------------------------------------------------------------------

/// Caller-side end of the worker. Dropping it shuts the thread down.
pub struct WorkerHandle {
    tx: Sender<Request>,
    rx: Receiver<Reply>,
    join: Option<JoinHandle<()>>,
    in_flight: bool,
}

impl WorkerHandle {
    /// Spawn the worker and wait (bounded) for it to come up.
    pub fn spawn(
        factory: ProducerFactory,
        model_w: usize,
        model_h: usize,
        full_w: usize,
        full_h: usize,
        init_timeout: Duration,
    ) -> Result<Self, WorkerInitError> {
        let (req_tx, req_rx) = mpsc::channel::<Request>();
        let (rep_tx, rep_rx) = mpsc::channel::<Reply>();

        let join = std::thread::Builder::new()
            .name("greenroom-mask-worker".into())
            .spawn(move || worker_main(factory, model_w, model_h, full_w, full_h, req_rx, rep_tx))
            .map_err(WorkerInitError::Spawn)?;

        match rep_rx.recv_timeout(init_timeout) {
            Ok(Reply::Ready) => {
                debug!("mask worker ready");
                Ok(WorkerHandle { tx: req_tx, rx: rep_rx, join: Some(join), in_flight: false })
            }
            Ok(_) => Err(WorkerInitError::Died),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(WorkerInitError::Timeout),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(WorkerInitError::Died),
        }
    }

    /// Dispatch a segment request, moving the frame to the worker. Returns
    /// false (and drops nothing but the frame) when a request is already
    /// in flight or the worker is gone.
    pub fn request_segment(
        &mut self,
        frame: Frame,
        timestamp_ms: f64,
        crop: Option<CropRegion>,
    ) -> bool {
        if self.in_flight {
            return false;
        }
        match self.tx.send(Request::Segment { frame, timestamp_ms, crop }) {
            Ok(()) => {
                self.in_flight = true;
                true
            }
            Err(_) => {
                warn!("mask worker channel closed");
                false
            }
        }
    }

    /// Non-blocking poll for a completed inference.
    ///
    /// `Some(None)` means the worker answered but the producer failed for
    /// that request; the caller runs the frame as interpolation.
    pub fn poll(&mut self) -> Option<Option<MaskReply>> {
        match self.rx.try_recv() {
            Ok(Reply::Mask(reply)) => {
                self.in_flight = false;
                Some(reply)
            }
            Ok(Reply::Ready) => None,
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.in_flight = false;
                None
            }
        }
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Blocking poll with a deadline. Test helper; the hot path never waits.
    pub fn poll_blocking(&mut self, timeout: Duration) -> Option<Option<MaskReply>> {
        match self.rx.recv_timeout(timeout) {
            Ok(Reply::Mask(reply)) => {
                self.in_flight = false;
                Some(reply)
            }
            _ => None,
        }
    }

    pub fn set_model_dims(&self, w: usize, h: usize) {
        let _ = self.tx.send(Request::SetModelDims(w, h));
    }

    pub fn reset(&self) {
        let _ = self.tx.send(Request::Reset);
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        let _ = self.tx.send(Request::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Worker thread body
// ---------------------------------------------------------------------------

fn worker_main(
    factory: ProducerFactory,
    model_w: usize,
    model_h: usize,
    full_w: usize,
    full_h: usize,
    rx: Receiver<Request>,
    tx: Sender<Reply>,
) {
    let producer = factory();
    let mut adapter = ProducerAdapter::new(producer, model_w, model_h, full_w, full_h);
    if tx.send(Reply::Ready).is_err() {
        return;
    }

    while let Ok(request) = rx.recv() {
        match request {
            Request::Segment { frame, timestamp_ms, crop } => {
                let reply = match adapter.segment(&frame, timestamp_ms, crop) {
                    SegmentStatus::Fresh => {
                        // One copy out of the adapter's persistent buffers
                        // into the transferable reply; the channel send
                        // moves it from there.
                        let mask = adapter.full_mask().expect("fresh mask present");
                        Some(MaskReply {
                            full_mask: mask.clone(),
                            motion: adapter.motion_map().cloned(),
                            bbox: adapter.bbox(),
                            motion_vector: adapter.motion_vector(),
                            inference_ms: adapter.last_inference_ms(),
                        })
                    }
                    // Failure: the caller interpolates this frame.
                    SegmentStatus::Failed => None,
                };
                if tx.send(Reply::Mask(reply)).is_err() {
                    return;
                }
            }
            Request::SetModelDims(w, h) => adapter.set_model_dims(w, h),
            Request::Reset => adapter.reset(),
            Request::Shutdown => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::mock;

    fn box_factory() -> ProducerFactory {
        Arc::new(|| -> Box<dyn MaskProducer> { Box::new(mock::BoxProducer::centered(0.5, 0.5)) })
    }

    #[test]
    fn test_spawn_and_segment_round_trip() {
        let mut worker =
            WorkerHandle::spawn(box_factory(), 32, 32, 32, 32, INIT_TIMEOUT).unwrap();

        assert!(worker.request_segment(Frame::new(64, 64), 0.0, None));
        let reply = worker
            .poll_blocking(Duration::from_secs(5))
            .expect("reply arrives")
            .expect("mask present");
        assert_eq!((reply.full_mask.width(), reply.full_mask.height()), (32, 32));
        assert_eq!(reply.full_mask.get(16, 16), 1.0);
        assert!(reply.bbox.is_some());
    }

    #[test]
    fn test_single_in_flight_request() {
        let mut worker =
            WorkerHandle::spawn(box_factory(), 32, 32, 32, 32, INIT_TIMEOUT).unwrap();

        assert!(worker.request_segment(Frame::new(64, 64), 0.0, None));
        // Second request while busy is refused, not queued.
        assert!(!worker.request_segment(Frame::new(64, 64), 16.0, None));
        assert!(worker.in_flight());

        worker.poll_blocking(Duration::from_secs(5)).expect("reply");
        assert!(!worker.in_flight());
        assert!(worker.request_segment(Frame::new(64, 64), 33.0, None));
        worker.poll_blocking(Duration::from_secs(5)).expect("second reply");
    }

    #[test]
    fn test_failed_producer_reports_none() {
        let factory: ProducerFactory =
            Arc::new(|| -> Box<dyn MaskProducer> { Box::new(mock::Failing) });
        let mut worker =
            WorkerHandle::spawn(factory, 32, 32, 32, 32, INIT_TIMEOUT).unwrap();
        assert!(worker.request_segment(Frame::new(64, 64), 0.0, None));
        let reply = worker.poll_blocking(Duration::from_secs(5)).expect("answered");
        assert!(reply.is_none(), "no mask before any success");
    }

    #[test]
    fn test_motion_map_on_second_reply() {
        let factory: ProducerFactory = Arc::new(|| -> Box<dyn MaskProducer> {
            Box::new(mock::BoxProducer {
                cx: 0.3, cy: 0.5, w: 0.25, h: 0.25, vx: 0.2, vy: 0.0, value: 1.0,
            })
        });
        let mut worker =
            WorkerHandle::spawn(factory, 32, 32, 32, 32, INIT_TIMEOUT).unwrap();

        worker.request_segment(Frame::new(64, 64), 0.0, None);
        let first = worker.poll_blocking(Duration::from_secs(5)).unwrap().unwrap();
        assert!(first.motion.is_none());

        worker.request_segment(Frame::new(64, 64), 1000.0, None);
        let second = worker.poll_blocking(Duration::from_secs(5)).unwrap().unwrap();
        assert!(second.motion.is_some(), "motion map from the second inference");
    }

    #[test]
    fn test_poll_is_nonblocking() {
        let mut worker =
            WorkerHandle::spawn(box_factory(), 32, 32, 32, 32, INIT_TIMEOUT).unwrap();
        assert!(worker.poll().is_none(), "nothing pending");
    }
}
