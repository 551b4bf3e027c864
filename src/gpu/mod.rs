// gpu/mod.rs — wgpu acceleration layer.
//
// GPU mirrors of the CPU reference pipeline in the parent crate. The CPU
// implementations remain the authoritative reference — every kernel here
// is validated against them, and the ignored integration tests compare
// whole dispatches end-to-end.
//
// Architecture: the entire per-frame chain runs on the GPU as compute
// dispatches over ping-pong storage textures; the CPU side only uploads
// the camera frame, the padded mask and the motion map, and reads back
// nothing on the hot path.

pub mod device;
pub mod pipeline;
pub mod texture;

pub use device::{CapabilityProbe, GpuDevice, GpuError};
pub use pipeline::GpuPipeline;
