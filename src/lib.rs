// greenroom — real-time virtual-background compositing.
//
// Turns a noisy low-resolution person-confidence mask into a
// display-rate composite (blurred / replaced / recoloured background)
// with temporally stable, edge-snapped, halo-free boundaries.
//
// CPU reference implementations of every stage live in the top-level
// modules and are the authoritative semantics; the gpu module mirrors
// them with wgpu compute kernels validated against the CPU results.

pub mod image;
pub mod frame;
pub mod math;

pub mod temporal;
pub mod morphology;
pub mod resample;
pub mod feather;
pub mod blur;
pub mod composite;
pub mod pipeline;

pub mod producer;
pub mod motion;
pub mod adapter;
pub mod worker;

pub mod autoframe;
pub mod adaptive;
pub mod config;
pub mod diagnostics;
pub mod processor;

pub mod gpu;

pub use adapter::{CropRegion, ProducerAdapter};
pub use autoframe::{AutoFrameOptions, AutoFramer, CropRect};
pub use config::{BackgroundMode, EngineOptions, OptionsUpdate, PipelineConfig};
pub use frame::Frame;
pub use image::Image;
pub use pipeline::{Compositor, CpuPipeline, PipelineError};
pub use processor::{Processor, ProcessorError};
pub use producer::{ConfidenceMap, MaskProducer, ProducerError};
