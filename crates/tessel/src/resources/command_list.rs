use std::sync::Arc;

use smallvec::SmallVec;

use crate::{
    DeviceError,
    backend::{Backend, Barrier, RawCommandList, RawDevice},
    context::Device,
};

use super::{
    Buffer, GfxResourceState, GraphicsState, IndexBufferView, PrimitiveTopology, ScissorRect, SubresourceFootprint,
    Texture, VertexBufferView, Viewport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListState {
    Recording,
    Closed,
}

///Graphics command list. Lists are created closed and have to be [reset](GraphicsCommandList::reset) before recording.
///
/// Recording into a closed list, resetting a recording list or closing a closed list are programming errors and panic.
pub struct GraphicsCommandList<B: Backend> {
    pub inner: B::CommandList,
    pub device: Arc<Device<B>>,
    state: ListState,
    barrier_count: usize,
    command_count: usize,
}

impl<B: Backend> GraphicsCommandList<B> {
    pub fn new(device: &Arc<Device<B>>) -> Result<Self, DeviceError> {
        let inner = device.inner.create_command_list()?;
        Ok(GraphicsCommandList {
            inner,
            device: device.clone(),
            state: ListState::Closed,
            barrier_count: 0,
            command_count: 0,
        })
    }

    pub fn state(&self) -> ListState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ListState::Closed
    }

    ///Number of barriers recorded since the last reset.
    pub fn barrier_count(&self) -> usize {
        self.barrier_count
    }

    ///Number of commands (including barrier batches) recorded since the last reset.
    pub fn command_count(&self) -> usize {
        self.command_count
    }

    pub fn is_empty(&self) -> bool {
        self.command_count == 0
    }

    ///Starts recording. The GPU must be done with previously recorded work.
    pub fn reset(&mut self) -> Result<(), DeviceError> {
        assert!(
            self.state == ListState::Closed,
            "command list must be closed before it can be reset"
        );
        self.inner.reset()?;
        self.state = ListState::Recording;
        self.barrier_count = 0;
        self.command_count = 0;
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), DeviceError> {
        assert!(
            self.state == ListState::Recording,
            "command list is already closed"
        );
        self.inner.close()?;
        self.state = ListState::Closed;
        Ok(())
    }

    #[inline]
    fn record(&mut self, op: &str) -> &mut B::CommandList {
        assert!(
            self.state == ListState::Recording,
            "can't record {op} into a closed command list"
        );
        self.command_count += 1;
        &mut self.inner
    }

    pub fn resource_barrier(&mut self, barriers: &[Barrier<B>]) {
        if barriers.is_empty() {
            return;
        }
        self.record("resource_barrier").resource_barrier(barriers);
        self.barrier_count += barriers.len();
    }

    ///Records a single full transition of `resource`.
    pub fn transition(&mut self, resource: &Arc<B::Resource>, before: GfxResourceState, after: GfxResourceState) {
        self.resource_barrier(&[Barrier::transition(resource.clone(), before, after)]);
    }

    pub fn set_pipeline_state(&mut self, pipeline: &GraphicsState<B>) {
        self.record("set_pipeline_state").set_pipeline_state(&pipeline.inner);
    }

    pub fn set_viewports(&mut self, viewports: &[Viewport]) {
        self.record("set_viewports").set_viewports(viewports);
    }

    pub fn set_scissor_rects(&mut self, rects: &[ScissorRect]) {
        self.record("set_scissor_rects").set_scissor_rects(rects);
    }

    pub fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        self.record("set_primitive_topology").set_primitive_topology(topology);
    }

    pub fn set_render_targets(&mut self, targets: &[&Texture<B>], depth: Option<&Texture<B>>) {
        let raw: SmallVec<[&Arc<B::Resource>; 8]> = targets.iter().map(|t| &t.inner).collect();
        self.record("set_render_targets")
            .set_render_targets(&raw, depth.map(|d| &d.inner));
    }

    pub fn clear_render_target(&mut self, target: &Texture<B>, color: [f32; 4]) {
        self.record("clear_render_target").clear_render_target(&target.inner, color);
    }

    pub fn clear_depth_stencil(&mut self, target: &Texture<B>, depth: f32, stencil: u8) {
        self.record("clear_depth_stencil")
            .clear_depth_stencil(&target.inner, depth, stencil);
    }

    pub fn set_vertex_buffers(&mut self, start_slot: u32, views: &[VertexBufferView]) {
        self.record("set_vertex_buffers").set_vertex_buffers(start_slot, views);
    }

    pub fn set_index_buffer(&mut self, view: &IndexBufferView) {
        self.record("set_index_buffer").set_index_buffer(view);
    }

    pub fn set_graphics_root_constant_buffer(&mut self, slot: u32, gpu_address: u64) {
        self.record("set_graphics_root_constant_buffer")
            .set_graphics_root_constant_buffer(slot, gpu_address);
    }

    pub fn set_compute_root_constant_buffer(&mut self, slot: u32, gpu_address: u64) {
        self.record("set_compute_root_constant_buffer")
            .set_compute_root_constant_buffer(slot, gpu_address);
    }

    pub fn draw_instanced(&mut self, vertex_count: u32, instance_count: u32, start_vertex: u32, start_instance: u32) {
        self.record("draw_instanced")
            .draw_instanced(vertex_count, instance_count, start_vertex, start_instance);
    }

    pub fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    ) {
        self.record("draw_indexed_instanced").draw_indexed_instanced(
            index_count,
            instance_count,
            start_index,
            base_vertex,
            start_instance,
        );
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.record("dispatch").dispatch(x, y, z);
    }

    pub fn copy_buffer_region(
        &mut self,
        dst: &Buffer<B>,
        dst_offset: u64,
        src: &Buffer<B>,
        src_offset: u64,
        size: u64,
    ) {
        self.record("copy_buffer_region")
            .copy_buffer_region(&dst.inner, dst_offset, &src.inner, src_offset, size);
    }

    pub fn copy_texture_region(&mut self, dst: &Texture<B>, src: &Buffer<B>, footprint: &SubresourceFootprint) {
        self.record("copy_texture_region")
            .copy_texture_region(&dst.inner, footprint.subresource, &src.inner, footprint);
    }

    pub fn copy_resource(&mut self, dst: &Arc<B::Resource>, src: &Arc<B::Resource>) {
        self.record("copy_resource").copy_resource(dst, src);
    }
}
