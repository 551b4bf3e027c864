// gpu/texture.rs — Texture allocation, CPU→GPU upload and readback.
//
// Upload goes through a staging buffer with rows compacted to wgpu's
// 256-byte `bytes_per_row` alignment: the CPU `Image<f32>` stride is in
// elements and rarely lands on the alignment, so each active row is
// copied into an aligned staging row before `copy_buffer_to_texture`.
//
// Readback is the reverse copy into a MAP_READ buffer, polled to
// completion. It stalls the GPU; tests only.

use wgpu::util::DeviceExt;

use crate::frame::Frame;
use crate::gpu::device::GpuDevice;
use crate::image::Image;

/// wgpu requires buffer→texture rows aligned to this many bytes.
const COPY_ALIGNMENT: u32 = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

/// Round `value` up to the next multiple of `alignment`.
#[inline]
pub(crate) fn align_to(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

// ---------------------------------------------------------------------------
// Allocation
// ---------------------------------------------------------------------------

/// An R32Float mask texture with read and storage-write views.
pub struct MaskTexture {
    pub texture: wgpu::Texture,
    pub read_view: wgpu::TextureView,
    pub write_view: wgpu::TextureView,
    pub width: u32,
    pub height: u32,
}

impl MaskTexture {
    pub fn new(device: &wgpu::Device, width: u32, height: u32, label: &str) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::R32Float,
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::STORAGE_BINDING
                | wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let read_view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let write_view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        MaskTexture { texture, read_view, write_view, width, height }
    }

    /// Upload a CPU mask, stride-compacted through a staging buffer.
    pub fn upload(&self, gpu: &GpuDevice, src: &Image<f32>) {
        debug_assert_eq!(src.width() as u32, self.width);
        debug_assert_eq!(src.height() as u32, self.height);

        let bytes_per_pixel = 4u32;
        let aligned = align_to(self.width * bytes_per_pixel, COPY_ALIGNMENT);
        let mut staging = vec![0u8; (aligned * self.height) as usize];

        for y in 0..self.height as usize {
            let row = src.row(y);
            let dst_start = y * aligned as usize;
            for (x, &v) in row.iter().enumerate() {
                let off = dst_start + x * 4;
                staging[off..off + 4].copy_from_slice(&v.to_le_bytes());
            }
        }

        upload_staging(gpu, &self.texture, &staging, aligned, self.width, self.height);
    }

    /// Read the texture back to a flat `Vec<f32>`. Tests only.
    pub fn readback(&self, gpu: &GpuDevice) -> Vec<f32> {
        let bytes = readback_texture(gpu, &self.texture, self.width * 4, self.width, self.height);
        bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    }
}

/// An RGBA8 colour texture (camera, background image, composite chain).
pub struct ColorTexture {
    pub texture: wgpu::Texture,
    pub read_view: wgpu::TextureView,
    pub write_view: wgpu::TextureView,
    pub width: u32,
    pub height: u32,
}

impl ColorTexture {
    /// `storage` adds STORAGE_BINDING for kernels that write the texture.
    pub fn new(device: &wgpu::Device, width: u32, height: u32, storage: bool, label: &str) -> Self {
        let mut usage = wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::COPY_DST
            | wgpu::TextureUsages::COPY_SRC;
        if storage {
            usage |= wgpu::TextureUsages::STORAGE_BINDING;
        }
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage,
            view_formats: &[],
        });
        let read_view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let write_view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        ColorTexture { texture, read_view, write_view, width, height }
    }

    pub fn upload(&self, gpu: &GpuDevice, src: &Frame) {
        debug_assert_eq!(src.width() as u32, self.width);
        debug_assert_eq!(src.height() as u32, self.height);

        let bytes_per_pixel = 4u32;
        let row_bytes = self.width * bytes_per_pixel;
        let aligned = align_to(row_bytes, COPY_ALIGNMENT);
        let mut staging = vec![0u8; (aligned * self.height) as usize];

        let src_bytes = src.as_rgba();
        for y in 0..self.height as usize {
            let src_start = y * row_bytes as usize;
            let dst_start = y * aligned as usize;
            staging[dst_start..dst_start + row_bytes as usize]
                .copy_from_slice(&src_bytes[src_start..src_start + row_bytes as usize]);
        }

        upload_staging(gpu, &self.texture, &staging, aligned, self.width, self.height);
    }

    /// Read back as a `Frame`. Tests only.
    pub fn readback(&self, gpu: &GpuDevice) -> Frame {
        let bytes = readback_texture(gpu, &self.texture, self.width * 4, self.width, self.height);
        Frame::from_rgba(self.width as usize, self.height as usize, bytes)
    }
}

/// An RGBA16Float target for the half-resolution blur chain.
pub struct HdrTexture {
    pub texture: wgpu::Texture,
    pub read_view: wgpu::TextureView,
    pub write_view: wgpu::TextureView,
    pub width: u32,
    pub height: u32,
}

impl HdrTexture {
    pub fn new(device: &wgpu::Device, width: u32, height: u32, label: &str) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba16Float,
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::STORAGE_BINDING,
            view_formats: &[],
        });
        let read_view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let write_view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        HdrTexture { texture, read_view, write_view, width, height }
    }
}

// ---------------------------------------------------------------------------
// Shared staging plumbing
// ---------------------------------------------------------------------------

fn upload_staging(
    gpu: &GpuDevice,
    texture: &wgpu::Texture,
    staging: &[u8],
    aligned_bytes_per_row: u32,
    width: u32,
    height: u32,
) {
    let staging_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("texture upload staging"),
        contents: staging,
        usage: wgpu::BufferUsages::COPY_SRC,
    });

    let mut encoder = gpu
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("texture upload") });
    encoder.copy_buffer_to_texture(
        wgpu::ImageCopyBuffer {
            buffer: &staging_buf,
            layout: wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(aligned_bytes_per_row),
                rows_per_image: Some(height),
            },
        },
        wgpu::ImageCopyTexture {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
    );
    gpu.queue.submit(std::iter::once(encoder.finish()));
}

fn readback_texture(
    gpu: &GpuDevice,
    texture: &wgpu::Texture,
    row_bytes: u32,
    width: u32,
    height: u32,
) -> Vec<u8> {
    let aligned = align_to(row_bytes, COPY_ALIGNMENT);
    let readback_buf = gpu.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("texture readback"),
        size: (aligned * height) as u64,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    let mut encoder = gpu
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("texture readback") });
    encoder.copy_texture_to_buffer(
        wgpu::ImageCopyTexture {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        wgpu::ImageCopyBuffer {
            buffer: &readback_buf,
            layout: wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(aligned),
                rows_per_image: Some(height),
            },
        },
        wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
    );
    gpu.queue.submit(std::iter::once(encoder.finish()));

    let slice = readback_buf.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |r| {
        tx.send(r).expect("readback channel closed");
    });
    gpu.device.poll(wgpu::Maintain::Wait);
    rx.recv().expect("readback callback never fired").expect("readback map failed");

    let mapped = slice.get_mapped_range();
    let mut out = vec![0u8; (row_bytes * height) as usize];
    for y in 0..height as usize {
        let src = y * aligned as usize;
        let dst = y * row_bytes as usize;
        out[dst..dst + row_bytes as usize].copy_from_slice(&mapped[src..src + row_bytes as usize]);
    }
    drop(mapped);
    readback_buf.unmap();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_to() {
        assert_eq!(align_to(0, 256), 0);
        assert_eq!(align_to(1, 256), 256);
        assert_eq!(align_to(256, 256), 256);
        assert_eq!(align_to(257, 256), 512);
        assert_eq!(align_to(1024, 256), 1024);
        // 64-wide f32 mask: 256 bytes exactly.
        assert_eq!(align_to(64 * 4, 256), 256);
    }

    #[test]
    fn test_staging_row_layout() {
        // Mirror the upload loop: a 3x2 f32 image lands in 256-byte rows.
        let mut img = Image::<f32>::new(3, 2);
        img.set(0, 0, 1.0);
        img.set(2, 1, 0.5);
        let aligned = align_to(3 * 4, 256) as usize;
        let mut staging = vec![0u8; aligned * 2];
        for y in 0..2 {
            let row = img.row(y);
            for (x, &v) in row.iter().enumerate() {
                let off = y * aligned + x * 4;
                staging[off..off + 4].copy_from_slice(&v.to_le_bytes());
            }
        }
        assert_eq!(f32::from_le_bytes(staging[0..4].try_into().unwrap()), 1.0);
        assert_eq!(
            f32::from_le_bytes(staging[aligned + 8..aligned + 12].try_into().unwrap()),
            0.5
        );
        assert_eq!(&staging[12..aligned], &vec![0u8; aligned - 12][..], "padding untouched");
    }
}
