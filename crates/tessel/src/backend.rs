//! # Backend
//!
//! The traits in this module are the seam to the native graphics API. They follow the API's resource model one to one:
//! resources carry explicit [states](crate::resources::GfxResourceState), command lists record
//! [Barrier]s, queues signal and wait on fences, and fences can arm an OS event.
//!
//! A backend implements [Backend] with one associated type per native object. The wrappers in [context](crate::context),
//! [resources](crate::resources), [sync](crate::sync) and [swapchain](crate::swapchain) take care of lifetimes and
//! invariants, so a backend can stay a thin translation layer.
//!
//! The [headless] backend simulates the GPU in software.

use std::{sync::Arc, time::Duration};

use crate::{
    DeviceError,
    resources::{
        BufDesc, GfxResourceState, IndexBufferView, PipelineStateDesc, PrimitiveTopology, ScissorRect,
        SubresourceFootprint, TexDesc, VertexBufferView, Viewport, copyable_footprints,
    },
    swapchain::SwapChainDesc,
};

pub mod headless;

///Collection of the native object types of one graphics API binding.
pub trait Backend: Sized + Send + Sync + 'static {
    type Device: RawDevice<Self>;
    type Queue: RawQueue<Self>;
    type CommandList: RawCommandList<Self>;
    type Fence: RawFence<Self>;
    type Event: RawEvent;
    type SwapChain: RawSwapChain<Self>;
    type Resource: RawResource;
    type PipelineState: Send + Sync + 'static;
}

///A native buffer or texture.
pub trait RawResource: Send + Sync + 'static {
    ///Virtual address of the resource on the GPU. Zero for resources that are not addressable (textures).
    fn gpu_address(&self) -> u64;
    ///Size of the resource's backing memory in bytes.
    fn size(&self) -> u64;
}

pub trait RawDevice<B: Backend>: Send + Sync + 'static {
    fn create_queue(&self) -> Result<B::Queue, DeviceError>;
    ///Creates a command list in the closed state.
    fn create_command_list(&self) -> Result<B::CommandList, DeviceError>;
    fn create_fence(&self, initial_value: u64) -> Result<B::Fence, DeviceError>;
    fn create_event(&self) -> Result<B::Event, DeviceError>;
    fn create_swap_chain(&self, queue: &B::Queue, desc: &SwapChainDesc) -> Result<B::SwapChain, DeviceError>;
    fn create_pipeline_state(&self, desc: &PipelineStateDesc) -> Result<B::PipelineState, DeviceError>;
    fn create_buffer(&self, desc: &BufDesc, initial_state: GfxResourceState) -> Result<B::Resource, DeviceError>;
    fn create_texture(&self, desc: &TexDesc, initial_state: GfxResourceState) -> Result<B::Resource, DeviceError>;
    ///Writes `data` into a host visible buffer.
    fn write_buffer(&self, buffer: &B::Resource, offset: u64, data: &[u8]) -> Result<(), DeviceError>;
    ///Reads a host visible buffer into `dst`.
    fn read_buffer(&self, buffer: &B::Resource, offset: u64, dst: &mut [u8]) -> Result<(), DeviceError>;

    ///Placed footprints for copying each subresource of a texture described by `desc` out of a buffer. Returns
    /// the footprints and the total buffer size needed.
    fn copyable_footprints(&self, desc: &TexDesc) -> (Vec<SubresourceFootprint>, u64) {
        copyable_footprints(desc)
    }
}

pub trait RawQueue<B: Backend>: Send + Sync + 'static {
    ///Submits closed command lists. They execute in order.
    fn execute(&self, lists: &[&B::CommandList]);
    ///Sets `fence` to `value` once all previously submitted work finished.
    fn signal(&self, fence: &B::Fence, value: u64) -> Result<(), DeviceError>;
    ///Lets the queue wait until `fence` reached `value` before executing later work.
    fn wait(&self, fence: &B::Fence, value: u64) -> Result<(), DeviceError>;
}

///Marks a split barrier's half. See [Barrier::Transition].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BarrierFlags {
    #[default]
    None,
    BeginOnly,
    EndOnly,
}

///Addresses every subresource of a resource within a [Barrier::Transition].
pub const ALL_SUBRESOURCES: u32 = u32::MAX;

pub enum Barrier<B: Backend> {
    ///Transitions `resource` from `before` to `after`. A split barrier is recorded as a `BeginOnly` and an `EndOnly` half
    /// with the same states. The resource can't be used in between.
    Transition {
        resource: Arc<B::Resource>,
        subresource: u32,
        before: GfxResourceState,
        after: GfxResourceState,
        flags: BarrierFlags,
    },
    ///Orders unordered access of `resource`, or of all resources if `None`.
    Uav { resource: Option<Arc<B::Resource>> },
}

impl<B: Backend> Barrier<B> {
    pub fn transition(resource: Arc<B::Resource>, before: GfxResourceState, after: GfxResourceState) -> Self {
        Barrier::Transition {
            resource,
            subresource: ALL_SUBRESOURCES,
            before,
            after,
            flags: BarrierFlags::None,
        }
    }
}

impl<B: Backend> Clone for Barrier<B> {
    fn clone(&self) -> Self {
        match self {
            Barrier::Transition {
                resource,
                subresource,
                before,
                after,
                flags,
            } => Barrier::Transition {
                resource: resource.clone(),
                subresource: *subresource,
                before: *before,
                after: *after,
                flags: *flags,
            },
            Barrier::Uav { resource } => Barrier::Uav {
                resource: resource.clone(),
            },
        }
    }
}

///Native command list. Resources are passed as `Arc`s so a backend can track (but not necessarily extend) their lifetime.
pub trait RawCommandList<B: Backend>: Send + 'static {
    fn reset(&mut self) -> Result<(), DeviceError>;
    fn close(&mut self) -> Result<(), DeviceError>;

    fn resource_barrier(&mut self, barriers: &[Barrier<B>]);

    fn set_pipeline_state(&mut self, pipeline: &Arc<B::PipelineState>);
    fn set_viewports(&mut self, viewports: &[Viewport]);
    fn set_scissor_rects(&mut self, rects: &[ScissorRect]);
    fn set_primitive_topology(&mut self, topology: PrimitiveTopology);
    fn set_render_targets(&mut self, targets: &[&Arc<B::Resource>], depth: Option<&Arc<B::Resource>>);
    fn clear_render_target(&mut self, target: &Arc<B::Resource>, color: [f32; 4]);
    fn clear_depth_stencil(&mut self, target: &Arc<B::Resource>, depth: f32, stencil: u8);
    fn set_vertex_buffers(&mut self, start_slot: u32, views: &[VertexBufferView]);
    fn set_index_buffer(&mut self, view: &IndexBufferView);
    fn set_graphics_root_constant_buffer(&mut self, slot: u32, gpu_address: u64);
    fn set_compute_root_constant_buffer(&mut self, slot: u32, gpu_address: u64);

    fn draw_instanced(&mut self, vertex_count: u32, instance_count: u32, start_vertex: u32, start_instance: u32);
    fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    );
    fn dispatch(&mut self, x: u32, y: u32, z: u32);

    fn copy_buffer_region(
        &mut self,
        dst: &Arc<B::Resource>,
        dst_offset: u64,
        src: &Arc<B::Resource>,
        src_offset: u64,
        size: u64,
    );
    ///Copies one subresource of `dst` from the placed `footprint` in buffer `src`.
    fn copy_texture_region(
        &mut self,
        dst: &Arc<B::Resource>,
        subresource: u32,
        src: &Arc<B::Resource>,
        footprint: &SubresourceFootprint,
    );
    fn copy_resource(&mut self, dst: &Arc<B::Resource>, src: &Arc<B::Resource>);
}

pub trait RawFence<B: Backend>: Send + Sync + 'static {
    ///Highest value the GPU confirmed. `u64::MAX` signals a removed device.
    fn completed_value(&self) -> u64;
    ///Arms `event` to be signaled once the fence reaches `value`.
    fn set_event_on_completion(&self, value: u64, event: &B::Event) -> Result<(), DeviceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitStatus {
    Signaled,
    TimedOut,
}

///OS wait primitive.
pub trait RawEvent: Send + Sync + 'static {
    ///Blocks until the event is signaled or `timeout` passed. `None` waits forever.
    fn wait(&self, timeout: Option<Duration>) -> WaitStatus;
}

pub trait RawSwapChain<B: Backend>: Send + 'static {
    fn buffer_count(&self) -> u32;
    ///Index of the back buffer that is rendered to next, as reported by the presentation engine.
    fn current_back_buffer_index(&self) -> u32;
    fn back_buffer(&self, index: u32) -> Result<Arc<B::Resource>, DeviceError>;
    fn present(&mut self, sync_interval: u32) -> Result<(), DeviceError>;
    ///Resizes all back buffers. No back buffer may be referenced while resizing.
    fn resize(&mut self, width: u32, height: u32) -> Result<(), DeviceError>;
}
