use std::{sync::Arc, time::Duration};

use slotmap::SecondaryMap;
use smallvec::SmallVec;
use tessel::{
    DeviceError, StateError,
    backend::{Backend, BarrierFlags},
    context::Device,
    sync::{DEFAULT_WAIT_TIMEOUT, Fence},
    resources::{
        Buffer, GfxResourceState, GraphicsCommandList, GraphicsState, IndexBufferView, PrimitiveTopology, ScissorRect,
        SubresourceFootprint, Texture, VertexBufferView, Viewport,
    },
};

use crate::{BarrierBatch, ContextError, ResourceStatePool, StateHandle};

///What a [GraphicsContext] knows about one resource during a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackedState {
    ///Pool state when the context referenced the resource first. This is the state the context's commands expect
    /// the resource to be in when they start executing.
    pub assumed: GfxResourceState,
    ///State after all barriers recorded so far.
    pub current: GfxResourceState,
    ///State the resource is left in by this context. `None` while the context did not request any state.
    pub pending: Option<GfxResourceState>,
    ///Target of a [BarrierFlags::BeginOnly] half that was not ended yet.
    pub split: Option<GfxResourceState>,
}

///Command recording context that tracks resource states.
///
/// Every barrier is recorded relative to the state the context *believes* the resource is in. The first time a
/// handle is used that belief is taken from the [ResourceStatePool]. Since other contexts of the same frame might leave
/// the resource in a different state, the [ContextManager](crate::ContextManager) inserts coordinator barriers before
/// this context's commands as needed.
///
/// The context owns one command list per frame in flight. Contexts can be recorded on different threads, all of them
/// only need `&ResourceStatePool`.
pub struct GraphicsContext<B: Backend> {
    id: usize,
    lists: SmallVec<[GraphicsCommandList<B>; 3]>,
    slot: usize,
    tracked: SecondaryMap<StateHandle, TrackedState>,
    ///Handles in first-touch order.
    touched: Vec<StateHandle>,
    barriers: BarrierBatch<B>,
    ///Fence the lists are submitted with, set by the owning manager.
    fence: Option<Arc<Fence<B>>>,
    ///Fence value each slot's list was submitted with last.
    submitted: SmallVec<[u64; 3]>,
    timeout: Option<Duration>,
    pub device: Arc<Device<B>>,
}

impl<B: Backend> GraphicsContext<B> {
    ///Creates a closed context with one command list per frame in flight.
    pub fn new(device: &Arc<Device<B>>, id: usize, frames_in_flight: usize) -> Result<Self, DeviceError> {
        let lists = (0..frames_in_flight.max(1))
            .map(|_| device.create_graphics_command_list())
            .collect::<Result<SmallVec<_>, _>>()?;
        Ok(GraphicsContext {
            id,
            submitted: smallvec::smallvec![0; lists.len()],
            lists,
            slot: 0,
            tracked: SecondaryMap::new(),
            touched: Vec::new(),
            barriers: BarrierBatch::new(),
            fence: None,
            timeout: Some(DEFAULT_WAIT_TIMEOUT),
            device: device.clone(),
        })
    }

    pub(crate) fn attach_fence(&mut self, fence: Arc<Fence<B>>, timeout: Option<Duration>) {
        self.fence = Some(fence);
        self.timeout = timeout;
    }

    ///Marks the current slot's list as submitted before `value` is signaled on the attached fence.
    pub(crate) fn mark_submitted(&mut self, value: u64) {
        self.submitted[self.slot] = value;
    }

    pub fn id(&self) -> usize {
        self.id
    }

    ///Ring slot whose command list is recorded.
    pub fn slot(&self) -> usize {
        self.slot
    }

    ///Command list of the current ring slot.
    pub fn command_list(&self) -> &GraphicsCommandList<B> {
        &self.lists[self.slot]
    }

    pub fn is_closed(&self) -> bool {
        self.command_list().is_closed()
    }

    ///Starts recording into the command list of `slot`. The GPU must be done with that slot.
    pub(crate) fn reset_slot(&mut self, slot: usize) -> Result<(), ContextError> {
        assert!(slot < self.lists.len(), "ring slot {slot} out of range");
        self.slot = slot;
        self.reset()
    }

    ///Forgets all tracked states and restarts recording of the current slot's command list. Anything recorded since the
    /// last reset is discarded. Calling it twice in a row is the same as calling it once.
    ///
    /// For contexts of a [ContextManager](crate::ContextManager) this first waits until the GPU executed the list's
    /// last submission.
    pub fn reset(&mut self) -> Result<(), ContextError> {
        if let Some(fence) = &self.fence {
            fence.wait_blocking(self.submitted[self.slot], self.timeout)?;
        }
        let list = &mut self.lists[self.slot];
        if !list.is_closed() {
            list.close()?;
        }
        list.reset()?;
        self.tracked.clear();
        self.touched.clear();
        self.barriers.barriers.clear();
        Ok(())
    }

    ///Records outstanding barriers and closes the command list.
    ///
    /// # Panics
    ///
    /// if a [BarrierFlags::BeginOnly] half was not ended by a matching [BarrierFlags::EndOnly] half.
    pub fn close(&mut self) -> Result<(), DeviceError> {
        if let Some((handle, tracked)) = self.tracked.iter().find(|(_, t)| t.split.is_some()) {
            panic!(
                "graphics context {} closed with an open split barrier on {:?} (to {:?})",
                self.id, handle, tracked.split
            );
        }
        self.flush_barriers();
        self.lists[self.slot].close()
    }

    fn assert_recording(&self, op: &str) {
        assert!(!self.is_closed(), "can't record {op} into closed graphics context {}", self.id);
    }

    ///Materializes the tracked state of `handle` from the pool on first use.
    fn track(&mut self, pool: &ResourceStatePool<B>, handle: StateHandle) -> &mut TrackedState {
        if !self.tracked.contains_key(handle) {
            let state = pool.resource_states(handle);
            self.tracked.insert(
                handle,
                TrackedState {
                    assumed: state,
                    current: state,
                    pending: None,
                    split: None,
                },
            );
            self.touched.push(handle);
        }
        &mut self.tracked[handle]
    }

    fn flush_barriers(&mut self) {
        let list = &mut self.lists[self.slot];
        self.barriers.flush(list);
    }

    fn commands(&mut self, op: &str) -> &mut GraphicsCommandList<B> {
        self.assert_recording(op);
        self.flush_barriers();
        &mut self.lists[self.slot]
    }

    ///Requests `after` as the state of `handle`. Records a transition from the current state if they differ.
    ///
    /// A [BarrierFlags::BeginOnly] half leaves the current state untouched, the resource is considered to be in
    /// `after` once the matching [BarrierFlags::EndOnly] half was recorded. Every begun split has to be ended before
    /// [close](Self::close).
    pub fn resource_barrier(
        &mut self,
        pool: &ResourceStatePool<B>,
        handle: StateHandle,
        after: GfxResourceState,
        flags: BarrierFlags,
    ) -> Result<(), StateError> {
        let after = after.validate()?;
        self.assert_recording("resource_barrier");
        let resource = pool.gpu_resource(handle).raw().clone();

        let tracked = self.track(pool, handle);
        let before = tracked.current;
        match flags {
            BarrierFlags::BeginOnly => tracked.split = Some(after),
            BarrierFlags::EndOnly => {
                assert_eq!(
                    tracked.split.take(),
                    Some(after),
                    "split barrier end on {handle:?} does not match its begin"
                );
                tracked.current = after;
            }
            BarrierFlags::None => tracked.current = after,
        }
        tracked.pending = Some(after);

        self.barriers.split(resource, before, after, flags);
        Ok(())
    }

    ///Full transition of `handle` to `after`.
    pub fn transition(
        &mut self,
        pool: &ResourceStatePool<B>,
        handle: StateHandle,
        after: GfxResourceState,
    ) -> Result<(), StateError> {
        self.resource_barrier(pool, handle, after, BarrierFlags::None)
    }

    ///Makes sure `handle` allows `required` access. Unlike [transition](Self::transition) nothing is recorded if the
    /// current state already contains `required`, for instance `GENERIC_READ` for a copy source.
    pub fn require(
        &mut self,
        pool: &ResourceStatePool<B>,
        handle: StateHandle,
        required: GfxResourceState,
    ) -> Result<(), StateError> {
        self.assert_recording("require");
        let tracked = self.track(pool, handle);
        if tracked.current.allows(required) {
            tracked.pending = Some(tracked.current);
            Ok(())
        } else {
            self.transition(pool, handle, required)
        }
    }

    ///Orders unordered access to `handle`, or to all resources.
    pub fn uav_barrier(&mut self, pool: &ResourceStatePool<B>, handle: Option<StateHandle>) {
        self.assert_recording("uav_barrier");
        let resource = handle.map(|h| pool.gpu_resource(h).raw().clone());
        self.barriers.uav(resource);
    }

    pub fn pending_state(&self, handle: StateHandle) -> Option<GfxResourceState> {
        self.tracked.get(handle).and_then(|t| t.pending)
    }

    pub fn current_state(&self, handle: StateHandle) -> Option<GfxResourceState> {
        self.tracked.get(handle).map(|t| t.current)
    }

    pub fn assumed_state(&self, handle: StateHandle) -> Option<GfxResourceState> {
        self.tracked.get(handle).map(|t| t.assumed)
    }

    pub fn tracked(&self, handle: StateHandle) -> Option<&TrackedState> {
        self.tracked.get(handle)
    }

    ///Handles referenced since the last reset, in the order they were referenced first.
    pub fn touched(&self) -> &[StateHandle] {
        &self.touched
    }

    ///Number of handles with a pending state.
    pub fn touched_count(&self) -> usize {
        self.tracked.values().filter(|t| t.pending.is_some()).count()
    }

    //Recording helpers. States are not changed, the caller transitions resources beforehand.

    pub fn set_pipeline_state(&mut self, pipeline: &GraphicsState<B>) {
        self.commands("set_pipeline_state").set_pipeline_state(pipeline);
    }

    pub fn set_viewports(&mut self, viewports: &[Viewport]) {
        self.commands("set_viewports").set_viewports(viewports);
    }

    pub fn set_scissor_rects(&mut self, rects: &[ScissorRect]) {
        self.commands("set_scissor_rects").set_scissor_rects(rects);
    }

    pub fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        self.commands("set_primitive_topology").set_primitive_topology(topology);
    }

    pub fn set_render_targets(
        &mut self,
        pool: &ResourceStatePool<B>,
        targets: &[StateHandle],
        depth: Option<StateHandle>,
    ) {
        let textures: SmallVec<[&Texture<B>; 8]> = targets.iter().map(|h| pool.texture(*h)).collect();
        let depth = depth.map(|h| pool.texture(h));
        self.commands("set_render_targets").set_render_targets(&textures, depth);
    }

    pub fn clear_render_target(&mut self, pool: &ResourceStatePool<B>, target: StateHandle, color: [f32; 4]) {
        let texture = pool.texture(target);
        self.commands("clear_render_target").clear_render_target(texture, color);
    }

    pub fn clear_depth_stencil(&mut self, pool: &ResourceStatePool<B>, target: StateHandle, depth: f32, stencil: u8) {
        let texture = pool.texture(target);
        self.commands("clear_depth_stencil").clear_depth_stencil(texture, depth, stencil);
    }

    pub fn set_vertex_buffers(&mut self, start_slot: u32, views: &[VertexBufferView]) {
        self.commands("set_vertex_buffers").set_vertex_buffers(start_slot, views);
    }

    pub fn set_index_buffer(&mut self, view: &IndexBufferView) {
        self.commands("set_index_buffer").set_index_buffer(view);
    }

    pub fn set_graphics_root_constant_buffer(&mut self, slot: u32, gpu_address: u64) {
        self.commands("set_graphics_root_constant_buffer")
            .set_graphics_root_constant_buffer(slot, gpu_address);
    }

    pub fn set_compute_root_constant_buffer(&mut self, slot: u32, gpu_address: u64) {
        self.commands("set_compute_root_constant_buffer")
            .set_compute_root_constant_buffer(slot, gpu_address);
    }

    pub fn draw_instanced(&mut self, vertex_count: u32, instance_count: u32, start_vertex: u32, start_instance: u32) {
        self.commands("draw_instanced")
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
        self.commands("draw_indexed_instanced").draw_indexed_instanced(
            index_count,
            instance_count,
            start_index,
            base_vertex,
            start_instance,
        );
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.commands("dispatch").dispatch(x, y, z);
    }

    //Copies transition their operands into copy states themselves.

    ///Copies between two tracked buffers.
    pub fn copy_buffer_region(
        &mut self,
        pool: &ResourceStatePool<B>,
        dst: StateHandle,
        dst_offset: u64,
        src: StateHandle,
        src_offset: u64,
        size: u64,
    ) -> Result<(), StateError> {
        self.require(pool, dst, GfxResourceState::COPY_DEST)?;
        self.require(pool, src, GfxResourceState::COPY_SOURCE)?;
        let (dst, src) = (pool.buffer(dst), pool.buffer(src));
        self.commands("copy_buffer_region")
            .copy_buffer_region(dst, dst_offset, src, src_offset, size);
        Ok(())
    }

    ///Copies from an untracked upload buffer into a tracked buffer.
    pub fn copy_from_staging(
        &mut self,
        pool: &ResourceStatePool<B>,
        dst: StateHandle,
        dst_offset: u64,
        staging: &Buffer<B>,
        src_offset: u64,
        size: u64,
    ) -> Result<(), StateError> {
        self.require(pool, dst, GfxResourceState::COPY_DEST)?;
        let dst = pool.buffer(dst);
        self.commands("copy_from_staging")
            .copy_buffer_region(dst, dst_offset, staging, src_offset, size);
        Ok(())
    }

    ///Copies the placed `footprints` of an untracked upload buffer into the subresources of a tracked texture.
    pub fn copy_texture_from_staging(
        &mut self,
        pool: &ResourceStatePool<B>,
        dst: StateHandle,
        staging: &Buffer<B>,
        footprints: &[SubresourceFootprint],
    ) -> Result<(), StateError> {
        self.require(pool, dst, GfxResourceState::COPY_DEST)?;
        let texture = pool.texture(dst);
        let list = self.commands("copy_texture_from_staging");
        for footprint in footprints {
            list.copy_texture_region(texture, staging, footprint);
        }
        Ok(())
    }

    ///Copies the whole content of `src` into `dst`.
    pub fn copy_resource(
        &mut self,
        pool: &ResourceStatePool<B>,
        dst: StateHandle,
        src: StateHandle,
    ) -> Result<(), StateError> {
        self.require(pool, dst, GfxResourceState::COPY_DEST)?;
        self.require(pool, src, GfxResourceState::COPY_SOURCE)?;
        let (dst, src) = (pool.gpu_resource(dst).raw(), pool.gpu_resource(src).raw());
        self.commands("copy_resource").copy_resource(dst, src);
        Ok(())
    }
}
