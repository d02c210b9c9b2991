//! Runs a short frame loop on the headless backend.
//!
//! Two graphics contexts record on their own threads each frame. Context 0 renders a quad into an offscreen target,
//! context 1 samples it while drawing into the back buffer. Neither context knows what the other did; the context
//! manager inserts the barriers that glue them together when the frame is executed.
//! The GPU lags two submissions behind, so the swap chain and the context manager have to pace the CPU.

use anyhow::{Result, anyhow, bail};
use tessel::{
    backend::headless::{GpuProgress, HeadlessConfig},
    context::Device,
    resources::{
        BufDesc, Format, GfxResourceState, PipelineStateDesc, ScissorRect, TexDesc, VertexBufferView, Viewport,
    },
    swapchain::SwapChainDesc,
};
use tessel_ctx::{ConstantAllocator, ContextManager, ContextManagerDesc, ResourceStatePool, UploadPool};

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct Vertex {
    pos: [f32; 2],
    uv: [f32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct FrameConstants {
    time: f32,
    frame: u32,
    _pad: [u32; 2],
}

const FRAMES: u32 = 12;
const RESIZE_AT: u32 = 6;
const CHECKER_SIZE: u32 = 64;

fn checker(size: u32) -> Vec<u8> {
    let mut texels = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let value = if (x / 8 + y / 8) % 2 == 0 { 255 } else { 32 };
            texels.extend_from_slice(&[value, value, value, 255]);
        }
    }
    texels
}

fn main() -> Result<()> {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()?;

    let device = Device::headless(HeadlessConfig::default().with(|c| c.progress = GpuProgress::Lagged(2)))?;
    let queue = device.create_command_queue()?;
    let mut swap_chain = device.create_swap_chain(&queue, SwapChainDesc::default().with(|d| d.buffer_count = 3))?;

    let mut pool = ResourceStatePool::new(&device);
    let mut back_buffers = pool.register_swap_chain(&swap_chain);
    let mut manager = ContextManager::initialize(
        &device,
        ContextManagerDesc::default().with(|d| {
            d.context_count = 2;
            d.name = Some("frame loop".to_owned());
        }),
    )?;
    let mut constants = ConstantAllocator::new(&swap_chain, 1024)?;

    let pipeline = device.create_graphics_state(PipelineStateDesc::default().with(|d| {
        d.render_target_formats.push(swap_chain.format());
        d.name = Some("quad".to_owned());
    }))?;

    //static data is uploaded once, by whichever context flushes the upload pool
    let vertices = [
        Vertex { pos: [-1.0, -1.0], uv: [0.0, 1.0] },
        Vertex { pos: [1.0, -1.0], uv: [1.0, 1.0] },
        Vertex { pos: [-1.0, 1.0], uv: [0.0, 0.0] },
        Vertex { pos: [1.0, 1.0], uv: [1.0, 0.0] },
    ];
    let vertex_bytes: &[u8] = bytemuck::cast_slice(&vertices);
    let vertex_buffer = pool.create_buffer(
        BufDesc::gpu_only(vertex_bytes.len() as u64).with(|d| d.name = Some("quad vertices".to_owned())),
    )?;
    manager.upload_pool().add_buffer(
        vertex_buffer,
        UploadPool::stage_buffer(&device, vertex_bytes)?,
        0,
        Some(GfxResourceState::VERTEX_AND_CONSTANT_BUFFER),
    )?;

    let checker_desc = TexDesc::texture_2d(CHECKER_SIZE, CHECKER_SIZE, Format::Rgba8Unorm)
        .with(|d| d.name = Some("checker".to_owned()));
    let checker_texture = pool.create_texture(checker_desc.clone())?;
    let (staging, footprints) = UploadPool::stage_texture(&device, &checker_desc, &checker(CHECKER_SIZE))?;
    manager.upload_pool().add_texture(
        checker_texture,
        staging,
        footprints,
        Some(GfxResourceState::PIXEL_SHADER_RESOURCE),
    )?;

    let (offscreen_width, offscreen_height) = swap_chain.extent();
    let offscreen = pool.create_texture(
        TexDesc::render_target(offscreen_width, offscreen_height, swap_chain.format())
            .with(|d| d.name = Some("offscreen".to_owned())),
    )?;

    let vertex_view = VertexBufferView {
        gpu_address: pool.buffer(vertex_buffer).gpu_address(),
        size_in_bytes: vertex_bytes.len() as u32,
        stride_in_bytes: std::mem::size_of::<Vertex>() as u32,
    };

    for frame in 0..FRAMES {
        if frame == RESIZE_AT {
            swap_chain.resize(1600, 900)?;
            back_buffers = pool.rebind_swap_chain(back_buffers, &swap_chain);
        }

        manager.reset_contexts()?;
        if !manager.upload_pool().is_empty() {
            let uploaded = manager.flush_uploads(0, &pool)?;
            log::info!("Uploaded {} resources", uploaded);
        }

        let frame_constants = constants.allocate(&FrameConstants {
            time: frame as f32 / 60.0,
            frame,
            _pad: [0; 2],
        })?;
        let target = back_buffers.current(&swap_chain);
        let (width, height) = swap_chain.extent();
        let shared = &pool;
        let pipeline = &pipeline;

        let (first, second) = manager.contexts_mut().split_at_mut(1);
        let (offscreen_ctx, present_ctx) = (&mut first[0], &mut second[0]);
        std::thread::scope(|s| -> Result<()> {
            let offscreen_pass = s.spawn(move || -> Result<()> {
                offscreen_ctx.transition(shared, offscreen, GfxResourceState::RENDER_TARGET)?;
                offscreen_ctx.require(shared, checker_texture, GfxResourceState::PIXEL_SHADER_RESOURCE)?;
                offscreen_ctx.set_render_targets(shared, &[offscreen], None);
                offscreen_ctx.clear_render_target(shared, offscreen, [0.1, 0.1, 0.1, 1.0]);
                offscreen_ctx.set_pipeline_state(pipeline);
                offscreen_ctx.set_viewports(&[Viewport::from_extent(offscreen_width, offscreen_height)]);
                offscreen_ctx.set_scissor_rects(&[ScissorRect::from_extent(offscreen_width, offscreen_height)]);
                offscreen_ctx.set_vertex_buffers(0, &[vertex_view]);
                offscreen_ctx.set_graphics_root_constant_buffer(0, frame_constants);
                offscreen_ctx.draw_instanced(4, 1, 0, 0);
                offscreen_ctx.transition(shared, offscreen, GfxResourceState::PIXEL_SHADER_RESOURCE)?;
                offscreen_ctx.close()?;
                Ok(())
            });

            let present_pass = s.spawn(move || -> Result<()> {
                present_ctx.transition(shared, target, GfxResourceState::RENDER_TARGET)?;
                present_ctx.require(shared, offscreen, GfxResourceState::PIXEL_SHADER_RESOURCE)?;
                present_ctx.set_render_targets(shared, &[target], None);
                present_ctx.clear_render_target(shared, target, [0.0, 0.0, 0.0, 1.0]);
                present_ctx.set_pipeline_state(pipeline);
                present_ctx.set_viewports(&[Viewport::from_extent(width, height)]);
                present_ctx.set_scissor_rects(&[ScissorRect::from_extent(width, height)]);
                present_ctx.set_vertex_buffers(0, &[vertex_view]);
                present_ctx.set_graphics_root_constant_buffer(0, frame_constants);
                present_ctx.draw_instanced(4, 1, 0, 0);
                present_ctx.transition(shared, target, GfxResourceState::PRESENT)?;
                present_ctx.close()?;
                Ok(())
            });

            offscreen_pass
                .join()
                .map_err(|_| anyhow!("offscreen recording thread panicked"))??;
            present_pass
                .join()
                .map_err(|_| anyhow!("present recording thread panicked"))??;
            Ok(())
        })?;

        let submission = manager.execute(&mut pool, &queue)?;
        swap_chain.present(1)?;
        let flip = swap_chain.flip()?;
        constants.begin_frame(&flip);

        log::info!(
            "frame {}: {} lists, {} coordinator barriers, flip {} (blocked: {}), GPU retired {} frames",
            frame,
            submission.command_lists,
            submission.coordinator_barriers,
            flip.fence_value,
            flip.blocked,
            swap_chain.completed_frames()
        );
    }

    manager.wait_idle()?;
    swap_chain.wait_idle()?;

    log::info!("Swap chain stalled {} times", swap_chain.stall_count());
    log::info!("Most states tracked at once: {}", pool.max_allocated_state_count());
    log::info!("{:#?}", device.inner.stats());

    let errors = device.inner.validation_errors();
    for error in &errors {
        log::error!("{}", error);
    }
    if !errors.is_empty() {
        bail!("GPU timeline reported {} validation errors", errors.len());
    }
    Ok(())
}
