// gpu/pipeline.rs — wgpu compositing pipeline.
//
// GPU mirror of pipeline.rs::CpuPipeline. Same stage order, same
// uniforms, same buffer set — every kernel is validated against its CPU
// reference, and the ignored GPU tests at the bottom compare whole
// dispatches end-to-end.
//
// All work is compute: each stage is one dispatch writing a single
// storage texture, with ping-pong pairs at mask resolution (temporal /
// previous, morph A/B), full resolution (bilateral / feathered /
// refined) and half resolution (blur A/B). Intermediate mask targets are
// R32Float so sub-threshold confidence survives the chain; colour
// targets are Rgba8Unorm except the blur pair (Rgba16Float).
//
// One `CommandEncoder` per dispatch: intra-frame ordering is implicit in
// submission order, and nothing here ever waits on the GPU.

use wgpu::util::DeviceExt;

use crate::autoframe::CropRect;
use crate::composite::color_match_gain;
use crate::config::{BackgroundMode, OptionsUpdate, PipelineConfig};
use crate::frame::Frame;
use crate::gpu::device::{CapabilityProbe, GpuDevice};
use crate::gpu::texture::{ColorTexture, HdrTexture, MaskTexture};
use crate::image::Image;
use crate::pipeline::{Compositor, PipelineError, MASK_EDGE_PAD};

// ---------------------------------------------------------------------------
// Uniform structs (layouts must match the WGSL param blocks exactly)
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct TemporalParams {
    width: u32,
    height: u32,
    appear: f32,
    disappear: f32,
    softness: f32,
    has_motion: f32,
    first_frame: f32,
    _pad: f32,
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct MorphParams {
    width: u32,
    height: u32,
    radius: f32,
    operation: f32,
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct ShiftParams {
    width: u32,
    height: u32,
    shift_x: f32,
    shift_y: f32,
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct BilateralParams {
    out_width: u32,
    out_height: u32,
    mask_width: u32,
    mask_height: u32,
    range_sigma: f32,
    _pad0: f32,
    _pad1: f32,
    _pad2: f32,
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct FeatherParams {
    width: u32,
    height: u32,
    radius: f32,
    _pad: f32,
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct BlurParams {
    width: u32,
    height: u32,
    dir_x: f32,
    dir_y: f32,
    step: f32,
    _pad0: f32,
    _pad1: f32,
    _pad2: f32,
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct CompositeUniform {
    width: u32,
    height: u32,
    crop_offset_x: f32,
    crop_offset_y: f32,
    crop_size_x: f32,
    crop_size_y: f32,
    bg_fixed: f32,
    _pad: f32,
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct LightWrapParams {
    width: u32,
    height: u32,
    strength: f32,
    bg_fixed: f32,
    crop_offset_x: f32,
    crop_offset_y: f32,
    crop_size_x: f32,
    crop_size_y: f32,
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct CropParams {
    width: u32,
    height: u32,
    offset_x: f32,
    offset_y: f32,
    size_x: f32,
    size_y: f32,
    _pad0: f32,
    _pad1: f32,
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct ColorMatchParams {
    width: u32,
    height: u32,
    gain_r: f32,
    gain_g: f32,
    gain_b: f32,
    _pad0: f32,
    _pad1: f32,
    _pad2: f32,
}

// ---------------------------------------------------------------------------
// BGL entry helpers
// ---------------------------------------------------------------------------

fn tex_entry(binding: u32, filterable: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Texture {
            multisampled: false,
            view_dimension: wgpu::TextureViewDimension::D2,
            sample_type: wgpu::TextureSampleType::Float { filterable },
        },
        count: None,
    }
}

fn storage_entry(binding: u32, format: wgpu::TextureFormat) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::StorageTexture {
            access: wgpu::StorageTextureAccess::WriteOnly,
            format,
            view_dimension: wgpu::TextureViewDimension::D2,
        },
        count: None,
    }
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn sampler_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
        count: None,
    }
}

/// One compiled stage: compute pipeline + its bind group layout.
struct Stage {
    pipeline: wgpu::ComputePipeline,
    bgl: wgpu::BindGroupLayout,
}

fn make_stage(
    gpu: &GpuDevice,
    label: &str,
    source: &str,
    entry: &str,
    entries: &[wgpu::BindGroupLayoutEntry],
) -> Stage {
    let patched = gpu.workgroup_size.patch_shader(source);
    let module = gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(patched.into()),
    });
    let bgl = gpu
        .device
        .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor { label: Some(label), entries });
    let layout = gpu
        .device
        .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(label),
            bind_group_layouts: &[&bgl],
            push_constant_ranges: &[],
        });
    let pipeline = gpu
        .device
        .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(label),
            layout: Some(&layout),
            module: &module,
            entry_point: entry,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });
    Stage { pipeline, bgl }
}

// ---------------------------------------------------------------------------
// GpuPipeline
// ---------------------------------------------------------------------------

pub struct GpuPipeline {
    gpu: GpuDevice,
    cfg: PipelineConfig,

    // Stages (compiled once).
    st_temporal: Stage,
    st_morph: Stage,
    st_shift: Stage,
    st_bilateral: Stage,
    st_feather: Stage,
    st_downscale: Stage,
    st_blur: Stage,
    st_composite: Stage,
    st_light_wrap: Stage,
    st_crop: Stage,
    st_color_match: Stage,

    sampler: wgpu::Sampler,

    // Inputs.
    camera: ColorTexture,
    raw_mask: MaskTexture,
    motion_tex: MaskTexture,
    bg_image: Option<ColorTexture>,
    bg_matched: Option<ColorTexture>,
    color_1x1: ColorTexture,

    // Mask-resolution targets.
    temporal_t: MaskTexture,
    previous_t: MaskTexture,
    morph_a: MaskTexture,
    morph_b: MaskTexture,
    shift_t: MaskTexture,

    // Full-resolution mask targets.
    bilateral_t: MaskTexture,
    feathered_t: MaskTexture,
    refined_t: MaskTexture,

    // Half-resolution blur chain.
    half_t: HdrTexture,
    blur_a: HdrTexture,
    blur_b: HdrTexture,

    // Output chain.
    composited: ColorTexture,
    pre_crop: ColorTexture,
    output: ColorTexture,

    // CPU-side reuse buffers.
    pad_scratch: Image<f32>,
    bg_image_cpu: Option<Frame>,
    bg_gain: [f32; 3],

    crop: Option<CropRect>,
    first_frame: bool,
}

impl GpuPipeline {
    /// Probe capabilities, create the device, compile every stage and
    /// allocate the full framebuffer set.
    pub fn new(cfg: PipelineConfig) -> Result<Self, PipelineError> {
        let probe = CapabilityProbe::run();
        probe
            .ensure_required()
            .map_err(|e| PipelineError::ContextUnavailable(e.to_string()))?;

        let gpu = GpuDevice::new()
            .map_err(|e| PipelineError::ContextUnavailable(e.to_string()))?;
        tracing::info!(adapter = %gpu.adapter_info, "GPU pipeline initialising");

        let (w, h) = (cfg.frame_width as u32, cfg.frame_height as u32);
        let (mw, mh) = (cfg.mask_width as u32, cfg.mask_height as u32);
        if w == 0 || h == 0 || mw == 0 || mh == 0 {
            return Err(PipelineError::FramebufferIncomplete(format!(
                "degenerate dimensions {w}x{h} / {mw}x{mh}"
            )));
        }
        let (hw, hh) = ((w / 2).max(1), (h / 2).max(1));

        // Shader compilation errors surface through a validation scope:
        // wgpu reports them asynchronously, so the scope is the only way
        // to turn them into a Result.
        gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let st_temporal = make_stage(
            &gpu,
            "temporal.wgsl",
            include_str!("../shaders/temporal.wgsl"),
            "temporal_smooth",
            &[
                tex_entry(0, false),
                tex_entry(1, false),
                tex_entry(2, false),
                storage_entry(3, wgpu::TextureFormat::R32Float),
                uniform_entry(4),
            ],
        );
        let mask_kernel_entries = [
            tex_entry(0, false),
            storage_entry(1, wgpu::TextureFormat::R32Float),
            uniform_entry(2),
        ];
        let st_morph = make_stage(
            &gpu,
            "morphology.wgsl",
            include_str!("../shaders/morphology.wgsl"),
            "morph",
            &mask_kernel_entries,
        );
        let st_shift = make_stage(
            &gpu,
            "shift.wgsl",
            include_str!("../shaders/shift.wgsl"),
            "shift_mask",
            &mask_kernel_entries,
        );
        let st_bilateral = make_stage(
            &gpu,
            "bilateral.wgsl",
            include_str!("../shaders/bilateral.wgsl"),
            "bilateral_upsample",
            &[
                tex_entry(0, false),
                tex_entry(1, false),
                storage_entry(2, wgpu::TextureFormat::R32Float),
                uniform_entry(3),
            ],
        );
        let st_feather = make_stage(
            &gpu,
            "feather.wgsl",
            include_str!("../shaders/feather.wgsl"),
            "edge_feather",
            &mask_kernel_entries,
        );
        let blur_entries = [
            tex_entry(0, false),
            storage_entry(1, wgpu::TextureFormat::Rgba16Float),
            uniform_entry(2),
        ];
        let st_downscale = make_stage(
            &gpu,
            "blur.wgsl#downscale",
            include_str!("../shaders/blur.wgsl"),
            "downscale_half",
            &blur_entries,
        );
        let st_blur = make_stage(
            &gpu,
            "blur.wgsl#blur",
            include_str!("../shaders/blur.wgsl"),
            "blur_pass",
            &blur_entries,
        );
        let composite_entries = [
            tex_entry(0, false),
            tex_entry(1, false),
            tex_entry(2, true),
            sampler_entry(3),
            storage_entry(4, wgpu::TextureFormat::Rgba8Unorm),
            uniform_entry(5),
        ];
        let st_composite = make_stage(
            &gpu,
            "composite.wgsl",
            include_str!("../shaders/composite.wgsl"),
            "composite",
            &composite_entries,
        );
        let st_light_wrap = make_stage(
            &gpu,
            "light_wrap.wgsl",
            include_str!("../shaders/light_wrap.wgsl"),
            "light_wrap",
            &composite_entries,
        );
        let st_crop = make_stage(
            &gpu,
            "crop.wgsl",
            include_str!("../shaders/crop.wgsl"),
            "crop",
            &[
                tex_entry(0, true),
                sampler_entry(1),
                storage_entry(2, wgpu::TextureFormat::Rgba8Unorm),
                uniform_entry(3),
            ],
        );
        let st_color_match = make_stage(
            &gpu,
            "color_match.wgsl",
            include_str!("../shaders/color_match.wgsl"),
            "color_match",
            &[
                tex_entry(0, false),
                storage_entry(1, wgpu::TextureFormat::Rgba8Unorm),
                uniform_entry(2),
            ],
        );

        if let Some(err) = pollster::block_on(gpu.device.pop_error_scope()) {
            return Err(PipelineError::ShaderCompile(err.to_string()));
        }

        let sampler = gpu.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("background sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        let device = &gpu.device;
        let camera = ColorTexture::new(device, w, h, false, "camera");
        let raw_mask = MaskTexture::new(device, mw, mh, "raw mask");
        let motion_tex = MaskTexture::new(device, mw, mh, "motion map");
        let color_1x1 = ColorTexture::new(device, 1, 1, false, "solid color");

        let temporal_t = MaskTexture::new(device, mw, mh, "temporal");
        let previous_t = MaskTexture::new(device, mw, mh, "previous mask");
        let morph_a = MaskTexture::new(device, mw, mh, "morph A");
        let morph_b = MaskTexture::new(device, mw, mh, "morph B");
        let shift_t = MaskTexture::new(device, mw, mh, "shift");

        let bilateral_t = MaskTexture::new(device, w, h, "bilateral");
        let feathered_t = MaskTexture::new(device, w, h, "feather");
        let refined_t = MaskTexture::new(device, w, h, "refined");

        let half_t = HdrTexture::new(device, hw, hh, "blur half");
        let blur_a = HdrTexture::new(device, hw, hh, "blur A");
        let blur_b = HdrTexture::new(device, hw, hh, "blur B");

        let composited = ColorTexture::new(device, w, h, true, "composite");
        let pre_crop = ColorTexture::new(device, w, h, true, "pre-crop");
        let output = ColorTexture::new(device, w, h, true, "output");

        let mut pipeline = GpuPipeline {
            gpu,
            st_temporal,
            st_morph,
            st_shift,
            st_bilateral,
            st_feather,
            st_downscale,
            st_blur,
            st_composite,
            st_light_wrap,
            st_crop,
            st_color_match,
            sampler,
            camera,
            raw_mask,
            motion_tex,
            bg_image: None,
            bg_matched: None,
            color_1x1,
            temporal_t,
            previous_t,
            morph_a,
            morph_b,
            shift_t,
            bilateral_t,
            feathered_t,
            refined_t,
            half_t,
            blur_a,
            blur_b,
            composited,
            pre_crop,
            output,
            pad_scratch: Image::new(cfg.mask_width, cfg.mask_height),
            bg_image_cpu: None,
            bg_gain: [1.0; 3],
            crop: None,
            first_frame: true,
            cfg,
        };
        pipeline.sync_background_resources();
        Ok(pipeline)
    }

    pub fn adapter_name(&self) -> String {
        self.gpu.adapter_info.to_string()
    }

    /// The persisted previous-mask FBO, read back to CPU. Tests only.
    pub fn previous_mask_readback(&self) -> Image<f32> {
        let data = self.previous_t.readback(&self.gpu);
        Image::from_vec(self.cfg.mask_width, self.cfg.mask_height, data)
    }

    /// The visible surface, read back to CPU. Tests only.
    pub fn surface_readback(&self) -> Frame {
        self.output.readback(&self.gpu)
    }

    /// Upload the background image / solid colour for the current mode.
    /// Image uploads are unconditional on every background change.
    fn sync_background_resources(&mut self) {
        match &self.cfg.background {
            BackgroundMode::Image { image, .. } => {
                let (iw, ih) = (image.width() as u32, image.height() as u32);
                let needs_alloc = self
                    .bg_image
                    .as_ref()
                    .map(|t| (t.width, t.height) != (iw, ih))
                    .unwrap_or(true);
                if needs_alloc {
                    self.bg_image =
                        Some(ColorTexture::new(&self.gpu.device, iw, ih, false, "background image"));
                    self.bg_matched =
                        Some(ColorTexture::new(&self.gpu.device, iw, ih, true, "matched background"));
                }
                self.bg_image.as_ref().unwrap().upload(&self.gpu, image);
                self.bg_image_cpu = Some(image.clone());
            }
            BackgroundMode::Color { rgb, .. } => {
                let mut px = Frame::new(1, 1);
                px.set_rgb(0, 0, *rgb);
                self.color_1x1.upload(&self.gpu, &px);
            }
            _ => {}
        }
    }

    fn uniform(&self, data: &[u8], label: &str) -> wgpu::Buffer {
        self.gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: data,
            usage: wgpu::BufferUsages::UNIFORM,
        })
    }

    fn run_stage(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        stage: &Stage,
        bindings: &[wgpu::BindGroupEntry],
        out_w: u32,
        out_h: u32,
        label: &str,
    ) {
        let bind_group = self.gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout: &stage.bgl,
            entries: bindings,
        });
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(label),
            timestamp_writes: None,
        });
        pass.set_pipeline(&stage.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        let (dx, dy) = self.gpu.dispatch_size(out_w, out_h);
        pass.dispatch_workgroups(dx, dy, 1);
    }

    fn copy_mask(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        src: &MaskTexture,
        dst: &MaskTexture,
    ) {
        encoder.copy_texture_to_texture(
            src.texture.as_image_copy(),
            dst.texture.as_image_copy(),
            wgpu::Extent3d { width: src.width, height: src.height, depth_or_array_layers: 1 },
        );
    }

    fn check_frame(&self, frame: &Frame) -> Result<(), PipelineError> {
        if self.gpu.is_lost() {
            return Err(PipelineError::ContextLost);
        }
        if frame.width() != self.cfg.frame_width || frame.height() != self.cfg.frame_height {
            return Err(PipelineError::BadUpload(format!(
                "frame {}x{} != configured {}x{}",
                frame.width(),
                frame.height(),
                self.cfg.frame_width,
                self.cfg.frame_height
            )));
        }
        Ok(())
    }

    /// Shared tail of both dispatch paths: `use_shift` selects which
    /// mask-space result feeds the bilateral upsample.
    fn refine_and_composite(&self, encoder: &mut wgpu::CommandEncoder, use_shift: bool) {
        let (w, h) = (self.cfg.frame_width as u32, self.cfg.frame_height as u32);
        let (mw, mh) = (self.cfg.mask_width as u32, self.cfg.mask_height as u32);

        // Bilateral upsample from morph_b (both paths stage into it).
        let bilateral_params = BilateralParams {
            out_width: w,
            out_height: h,
            mask_width: mw,
            mask_height: mh,
            range_sigma: self.cfg.range_sigma,
            _pad0: 0.0,
            _pad1: 0.0,
            _pad2: 0.0,
        };
        let ub = self.uniform(bytemuck::bytes_of(&bilateral_params), "bilateral params");
        let mask_src = if use_shift { &self.shift_t } else { &self.morph_b };
        self.run_stage(
            encoder,
            &self.st_bilateral,
            &[
                bind_tex(0, &mask_src.read_view),
                bind_tex(1, &self.camera.read_view),
                bind_tex(2, &self.bilateral_t.write_view),
                bind_buf(3, &ub),
            ],
            w,
            h,
            "bilateral",
        );

        // Edge feather.
        let feather_params = FeatherParams {
            width: w,
            height: h,
            radius: self.cfg.feather_radius,
            _pad: 0.0,
        };
        let uf = self.uniform(bytemuck::bytes_of(&feather_params), "feather params");
        self.run_stage(
            encoder,
            &self.st_feather,
            &[
                bind_tex(0, &self.bilateral_t.read_view),
                bind_tex(1, &self.feathered_t.write_view),
                bind_buf(2, &uf),
            ],
            w,
            h,
            "feather",
        );

        // 0.5-texel erode at full resolution.
        let erode_params = MorphParams { width: w, height: h, radius: 0.5, operation: 1.0 };
        let ue = self.uniform(bytemuck::bytes_of(&erode_params), "erode params");
        self.run_stage(
            encoder,
            &self.st_morph,
            &[
                bind_tex(0, &self.feathered_t.read_view),
                bind_tex(1, &self.refined_t.write_view),
                bind_buf(2, &ue),
            ],
            w,
            h,
            "erode",
        );

        // Background production.
        let (hw, hh) = (self.half_t.width, self.half_t.height);
        if let BackgroundMode::Blur { radius } = self.cfg.background {
            let r = radius.clamp(4.0, 24.0);
            let down = BlurParams {
                width: hw,
                height: hh,
                dir_x: 0.0,
                dir_y: 0.0,
                step: 0.0,
                _pad0: 0.0,
                _pad1: 0.0,
                _pad2: 0.0,
            };
            let ud = self.uniform(bytemuck::bytes_of(&down), "downscale params");
            self.run_stage(
                encoder,
                &self.st_downscale,
                &[
                    bind_tex(0, &self.camera.read_view),
                    bind_tex(1, &self.half_t.write_view),
                    bind_buf(2, &ud),
                ],
                hw,
                hh,
                "downscale",
            );

            // Three full separable iterations; 2 and 3 at 0.7x radius.
            let radii = [r, r * 0.7, r * 0.7];
            let mut src: &HdrTexture = &self.half_t;
            for &ri in radii.iter() {
                let step = ri / 6.0;
                let hp = BlurParams {
                    width: hw,
                    height: hh,
                    dir_x: 1.0,
                    dir_y: 0.0,
                    step,
                    _pad0: 0.0,
                    _pad1: 0.0,
                    _pad2: 0.0,
                };
                let uh = self.uniform(bytemuck::bytes_of(&hp), "blur h params");
                self.run_stage(
                    encoder,
                    &self.st_blur,
                    &[
                        bind_tex(0, &src.read_view),
                        bind_tex(1, &self.blur_a.write_view),
                        bind_buf(2, &uh),
                    ],
                    hw,
                    hh,
                    "blur h",
                );
                let vp = BlurParams { dir_x: 0.0, dir_y: 1.0, ..hp };
                let uv = self.uniform(bytemuck::bytes_of(&vp), "blur v params");
                self.run_stage(
                    encoder,
                    &self.st_blur,
                    &[
                        bind_tex(0, &self.blur_a.read_view),
                        bind_tex(1, &self.blur_b.write_view),
                        bind_buf(2, &uv),
                    ],
                    hw,
                    hh,
                    "blur v",
                );
                src = &self.blur_b;
            }
        }

        // Colour match (image mode): apply the CPU-computed gain.
        let mut use_matched_bg = false;
        if let BackgroundMode::Image { match_strength, .. } = self.cfg.background {
            if match_strength > 0.0 && self.bg_gain != [1.0; 3] {
                if let (Some(bg), Some(matched)) = (&self.bg_image, &self.bg_matched) {
                    let cm = ColorMatchParams {
                        width: bg.width,
                        height: bg.height,
                        gain_r: self.bg_gain[0],
                        gain_g: self.bg_gain[1],
                        gain_b: self.bg_gain[2],
                        _pad0: 0.0,
                        _pad1: 0.0,
                        _pad2: 0.0,
                    };
                    let ucm = self.uniform(bytemuck::bytes_of(&cm), "color match params");
                    self.run_stage(
                        encoder,
                        &self.st_color_match,
                        &[
                            bind_tex(0, &bg.read_view),
                            bind_tex(1, &matched.write_view),
                            bind_buf(2, &ucm),
                        ],
                        bg.width,
                        bg.height,
                        "color match",
                    );
                    use_matched_bg = true;
                }
            }
        }

        // Composite parameters shared with light wrap.
        let (crop_off, crop_size) = match self.crop {
            Some(c) => ((c.x, c.y), (c.w, c.h)),
            None => ((0.0, 0.0), (1.0, 1.0)),
        };
        let bg_fixed = match &self.cfg.background {
            BackgroundMode::Image { fixed, .. } | BackgroundMode::Color { fixed, .. } => {
                *fixed && self.crop.is_some()
            }
            _ => false,
        };

        let bg_view: &wgpu::TextureView = match &self.cfg.background {
            BackgroundMode::Blur { .. } => &self.blur_b.read_view,
            BackgroundMode::Image { .. } => {
                if use_matched_bg {
                    &self.bg_matched.as_ref().unwrap().read_view
                } else {
                    &self.bg_image.as_ref().unwrap().read_view
                }
            }
            _ => &self.color_1x1.read_view,
        };

        let cu = CompositeUniform {
            width: w,
            height: h,
            crop_offset_x: crop_off.0,
            crop_offset_y: crop_off.1,
            crop_size_x: crop_size.0,
            crop_size_y: crop_size.1,
            bg_fixed: if bg_fixed { 1.0 } else { 0.0 },
            _pad: 0.0,
        };
        let ucu = self.uniform(bytemuck::bytes_of(&cu), "composite params");

        let crop_active = self.crop.map(|c| c.w < 1.0 || c.h < 1.0).unwrap_or(false);
        // Composite target: composited when light wrap follows, else the
        // pre-crop FBO when cropping, else the visible surface.
        let composite_out = if self.cfg.light_wrap {
            &self.composited
        } else if crop_active {
            &self.pre_crop
        } else {
            &self.output
        };
        self.run_stage(
            encoder,
            &self.st_composite,
            &[
                bind_tex(0, &self.camera.read_view),
                bind_tex(1, &self.refined_t.read_view),
                bind_tex(2, bg_view),
                bind_sampler(3, &self.sampler),
                bind_tex(4, &composite_out.write_view),
                bind_buf(5, &ucu),
            ],
            w,
            h,
            "composite",
        );

        if self.cfg.light_wrap {
            let lw = LightWrapParams {
                width: w,
                height: h,
                strength: self.cfg.light_wrap_strength,
                bg_fixed: cu.bg_fixed,
                crop_offset_x: crop_off.0,
                crop_offset_y: crop_off.1,
                crop_size_x: crop_size.0,
                crop_size_y: crop_size.1,
            };
            let ulw = self.uniform(bytemuck::bytes_of(&lw), "light wrap params");
            let wrap_out = if crop_active { &self.pre_crop } else { &self.output };
            self.run_stage(
                encoder,
                &self.st_light_wrap,
                &[
                    bind_tex(0, &self.composited.read_view),
                    bind_tex(1, &self.refined_t.read_view),
                    bind_tex(2, bg_view),
                    bind_sampler(3, &self.sampler),
                    bind_tex(4, &wrap_out.write_view),
                    bind_buf(5, &ulw),
                ],
                w,
                h,
                "light wrap",
            );
        }

        if crop_active {
            let c = self.crop.unwrap();
            let cp = CropParams {
                width: w,
                height: h,
                offset_x: c.x,
                offset_y: c.y,
                size_x: c.w,
                size_y: c.h,
                _pad0: 0.0,
                _pad1: 0.0,
            };
            let ucp = self.uniform(bytemuck::bytes_of(&cp), "crop params");
            self.run_stage(
                encoder,
                &self.st_crop,
                &[
                    bind_tex(0, &self.pre_crop.read_view),
                    bind_sampler(1, &self.sampler),
                    bind_tex(2, &self.output.write_view),
                    bind_buf(3, &ucp),
                ],
                w,
                h,
                "crop",
            );
        }
    }
}

fn bind_tex<'a>(binding: u32, view: &'a wgpu::TextureView) -> wgpu::BindGroupEntry<'a> {
    wgpu::BindGroupEntry { binding, resource: wgpu::BindingResource::TextureView(view) }
}

fn bind_buf<'a>(binding: u32, buf: &'a wgpu::Buffer) -> wgpu::BindGroupEntry<'a> {
    wgpu::BindGroupEntry { binding, resource: buf.as_entire_binding() }
}

fn bind_sampler<'a>(binding: u32, sampler: &'a wgpu::Sampler) -> wgpu::BindGroupEntry<'a> {
    wgpu::BindGroupEntry { binding, resource: wgpu::BindingResource::Sampler(sampler) }
}

impl Compositor for GpuPipeline {
    type Surface = ColorTexture;

    fn process(
        &mut self,
        frame: &Frame,
        mask: &Image<f32>,
        motion: Option<&Image<f32>>,
    ) -> Result<(), PipelineError> {
        self.check_frame(frame)?;
        if mask.width() != self.cfg.mask_width || mask.height() != self.cfg.mask_height {
            return Err(PipelineError::BadUpload(format!(
                "mask {}x{} != configured {}x{}",
                mask.width(),
                mask.height(),
                self.cfg.mask_width,
                self.cfg.mask_height
            )));
        }

        // Uploads: camera, edge-padded mask, motion map.
        self.camera.upload(&self.gpu, frame);
        self.pad_scratch.copy_from(mask);
        self.pad_scratch.pad_edges(MASK_EDGE_PAD);
        self.raw_mask.upload(&self.gpu, &self.pad_scratch);
        if let Some(m) = motion {
            self.motion_tex.upload(&self.gpu, m);
        }

        // Colour match gain from the CPU-side inputs, fresh masks only.
        // The raw full-frame mask approximates the refined one well
        // enough for a global mean.
        if let BackgroundMode::Image { match_strength, .. } = self.cfg.background {
            if match_strength > 0.0 {
                if let Some(bg) = &self.bg_image_cpu {
                    self.bg_gain = color_match_gain(frame, mask, bg, match_strength);
                }
            }
        }

        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("process") });

        let (mw, mh) = (self.cfg.mask_width as u32, self.cfg.mask_height as u32);
        let tp = TemporalParams {
            width: mw,
            height: mh,
            appear: self.cfg.appear_rate,
            disappear: self.cfg.disappear_rate,
            softness: self.cfg.softness,
            has_motion: if motion.is_some() { 1.0 } else { 0.0 },
            first_frame: if self.first_frame { 1.0 } else { 0.0 },
            _pad: 0.0,
        };
        let ut = self.uniform(bytemuck::bytes_of(&tp), "temporal params");
        self.run_stage(
            &mut encoder,
            &self.st_temporal,
            &[
                bind_tex(0, &self.raw_mask.read_view),
                bind_tex(1, &self.previous_t.read_view),
                bind_tex(2, &self.motion_tex.read_view),
                bind_tex(3, &self.temporal_t.write_view),
                bind_buf(4, &ut),
            ],
            mw,
            mh,
            "temporal",
        );

        // Atomic blit into the persisted previous-mask FBO.
        self.copy_mask(&mut encoder, &self.temporal_t, &self.previous_t);

        if self.cfg.morphology {
            let dilate = MorphParams { width: mw, height: mh, radius: 1.0, operation: 0.0 };
            let udl = self.uniform(bytemuck::bytes_of(&dilate), "dilate params");
            self.run_stage(
                &mut encoder,
                &self.st_morph,
                &[
                    bind_tex(0, &self.temporal_t.read_view),
                    bind_tex(1, &self.morph_a.write_view),
                    bind_buf(2, &udl),
                ],
                mw,
                mh,
                "dilate",
            );
            let erode = MorphParams { width: mw, height: mh, radius: 1.0, operation: 1.0 };
            let uer = self.uniform(bytemuck::bytes_of(&erode), "close erode params");
            self.run_stage(
                &mut encoder,
                &self.st_morph,
                &[
                    bind_tex(0, &self.morph_a.read_view),
                    bind_tex(1, &self.morph_b.write_view),
                    bind_buf(2, &uer),
                ],
                mw,
                mh,
                "close erode",
            );
        } else {
            self.copy_mask(&mut encoder, &self.temporal_t, &self.morph_b);
        }

        self.refine_and_composite(&mut encoder, false);
        self.gpu.queue.submit(std::iter::once(encoder.finish()));
        self.first_frame = false;
        Ok(())
    }

    fn process_interpolated(
        &mut self,
        frame: &Frame,
        shift: (f32, f32),
    ) -> Result<(), PipelineError> {
        self.check_frame(frame)?;
        self.camera.upload(&self.gpu, frame);

        let mut encoder = self.gpu.device.create_command_encoder(
            &wgpu::CommandEncoderDescriptor { label: Some("process interpolated") },
        );

        let (mw, mh) = (self.cfg.mask_width as u32, self.cfg.mask_height as u32);
        let use_shift = shift.0.abs() > 1e-4 || shift.1.abs() > 1e-4;
        if use_shift {
            let sp = ShiftParams { width: mw, height: mh, shift_x: shift.0, shift_y: shift.1 };
            let us = self.uniform(bytemuck::bytes_of(&sp), "shift params");
            self.run_stage(
                &mut encoder,
                &self.st_shift,
                &[
                    bind_tex(0, &self.previous_t.read_view),
                    bind_tex(1, &self.shift_t.write_view),
                    bind_buf(2, &us),
                ],
                mw,
                mh,
                "shift",
            );
        } else {
            self.copy_mask(&mut encoder, &self.previous_t, &self.morph_b);
        }

        self.refine_and_composite(&mut encoder, use_shift);
        self.gpu.queue.submit(std::iter::once(encoder.finish()));
        self.first_frame = false;
        Ok(())
    }

    fn set_crop_rect(&mut self, rect: Option<CropRect>) {
        self.crop = rect;
    }

    fn update_options(&mut self, update: &OptionsUpdate) {
        let background_changed = update.background.is_some();
        self.cfg.apply(update);
        if background_changed {
            self.sync_background_resources();
        }
    }

    fn surface(&self) -> &ColorTexture {
        &self.output
    }

    fn mask_dims(&self) -> (usize, usize) {
        (self.cfg.mask_width, self.cfg.mask_height)
    }

    fn frame_dims(&self) -> (usize, usize) {
        (self.cfg.frame_width, self.cfg.frame_height)
    }

    fn context_lost(&self) -> bool {
        self.gpu.is_lost()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
