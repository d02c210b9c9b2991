use std::sync::Arc;

use slotmap::SlotMap;
use smallvec::SmallVec;
use tessel::{
    StateError,
    backend::Backend,
    context::Device,
    resources::{BufDesc, Buffer, GfxResourceState, TexDesc, Texture},
    swapchain::SwapChain,
    sync::{Fence, GuardFence},
};

use crate::ContextError;

slotmap::new_key_type!(
    ///Handle of a resource registered in a [ResourceStatePool]. Handles are versioned, a released handle never aliases
    /// a resource registered later.
    pub struct StateHandle;
);

///Resource owned by the pool.
pub enum GpuResource<B: Backend> {
    Buffer(Buffer<B>),
    Texture(Texture<B>),
}

impl<B: Backend> GpuResource<B> {
    pub fn raw(&self) -> &Arc<B::Resource> {
        match self {
            GpuResource::Buffer(b) => &b.inner,
            GpuResource::Texture(t) => &t.inner,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            GpuResource::Buffer(b) => b.desc.name.as_deref(),
            GpuResource::Texture(t) => t.desc.name.as_deref(),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            GpuResource::Buffer(_) => "buffer",
            GpuResource::Texture(_) => "texture",
        }
    }

    pub fn as_buffer(&self) -> Option<&Buffer<B>> {
        if let GpuResource::Buffer(b) = self { Some(b) } else { None }
    }

    pub fn as_texture(&self) -> Option<&Texture<B>> {
        if let GpuResource::Texture(t) = self { Some(t) } else { None }
    }
}

impl<B: Backend> From<Buffer<B>> for GpuResource<B> {
    fn from(b: Buffer<B>) -> Self {
        GpuResource::Buffer(b)
    }
}

impl<B: Backend> From<Texture<B>> for GpuResource<B> {
    fn from(t: Texture<B>) -> Self {
        GpuResource::Texture(t)
    }
}

struct Entry<B: Backend> {
    state: GfxResourceState,
    resource: GpuResource<B>,
}

///Pool handles of all back buffers of a [SwapChain], indexed by back buffer index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapChainStates {
    handles: SmallVec<[StateHandle; 4]>,
}

impl SwapChainStates {
    ///Handle of the back buffer that is currently rendered to.
    pub fn current<B: Backend>(&self, swap_chain: &SwapChain<B>) -> StateHandle {
        self.handles[swap_chain.back_buffer_index() as usize]
    }

    pub fn handle(&self, back_buffer_index: u32) -> StateHandle {
        self.handles[back_buffer_index as usize]
    }

    pub fn handles(&self) -> &[StateHandle] {
        &self.handles
    }
}

///Authoritative table of the state every tracked resource is in after the last submitted command list that touched it.
///
/// During recording the pool is shared immutably between all [GraphicsContext](crate::GraphicsContext)s. Only
/// [ContextManager::execute](crate::ContextManager::execute) takes it mutably to commit the contexts' pending states.
///
/// Using a handle that is not (or no longer) registered is a programming error and panics.
pub struct ResourceStatePool<B: Backend> {
    pub device: Arc<Device<B>>,
    entries: SlotMap<StateHandle, Entry<B>>,
    high_water: usize,
    ///Released resources that might still be in use on the GPU.
    graveyard: Vec<GuardFence<B, GpuResource<B>>>,
}

impl<B: Backend> ResourceStatePool<B> {
    pub fn new(device: &Arc<Device<B>>) -> Self {
        ResourceStatePool {
            device: device.clone(),
            entries: SlotMap::with_key(),
            high_water: 0,
            graveyard: Vec::new(),
        }
    }

    ///Starts tracking `resource`, which has to be in `initial_state` right now.
    pub fn register(
        &mut self,
        resource: impl Into<GpuResource<B>>,
        initial_state: GfxResourceState,
    ) -> Result<StateHandle, StateError> {
        let state = initial_state.validate()?;
        let resource = resource.into();
        #[cfg(feature = "logging")]
        log::trace!("Registering {} {:?} in {:?}", resource.kind_name(), resource.name(), state);

        let handle = self.entries.insert(Entry { state, resource });
        self.high_water = self.high_water.max(self.entries.len());
        Ok(handle)
    }

    ///Creates a buffer and registers it in the state its heap requires.
    pub fn create_buffer(&mut self, desc: BufDesc) -> Result<StateHandle, ContextError> {
        let buffer = Buffer::new(&self.device, desc)?;
        let state = buffer.initial_state();
        Ok(self.register(buffer, state)?)
    }

    pub fn create_texture(&mut self, desc: TexDesc) -> Result<StateHandle, ContextError> {
        let texture = Texture::new(&self.device, desc)?;
        Ok(self.register(texture, Texture::<B>::INITIAL_STATE)?)
    }

    ///Registers all back buffers of `swap_chain` in the present state.
    pub fn register_swap_chain(&mut self, swap_chain: &SwapChain<B>) -> SwapChainStates {
        let handles = swap_chain
            .back_buffers()
            .iter()
            .map(|bb| {
                let texture = Texture::from_raw(&self.device, bb.desc.clone(), bb.inner.clone());
                let handle = self.entries.insert(Entry {
                    state: GfxResourceState::PRESENT,
                    resource: GpuResource::Texture(texture),
                });
                self.high_water = self.high_water.max(self.entries.len());
                handle
            })
            .collect();
        SwapChainStates { handles }
    }

    ///Replaces the back buffer registrations after the swap chain was [resized](SwapChain::resize). The old back
    /// buffers are dropped right away since resizing waits for the GPU.
    pub fn rebind_swap_chain(&mut self, states: SwapChainStates, swap_chain: &SwapChain<B>) -> SwapChainStates {
        for handle in states.handles {
            self.remove(handle);
        }
        self.register_swap_chain(swap_chain)
    }

    fn entry(&self, handle: StateHandle) -> &Entry<B> {
        match self.entries.get(handle) {
            Some(e) => e,
            None => panic!("resource state handle {handle:?} is not registered in the pool"),
        }
    }

    ///Committed state of `handle`.
    ///
    /// # Panics
    ///
    /// if `handle` is not registered.
    pub fn resource_states(&self, handle: StateHandle) -> GfxResourceState {
        self.entry(handle).state
    }

    pub fn try_resource_states(&self, handle: StateHandle) -> Option<GfxResourceState> {
        self.entries.get(handle).map(|e| e.state)
    }

    ///Overwrites the committed state. Only correct if the resource is actually in `state` once all submitted work
    /// finished.
    pub fn set_resource_states(&mut self, handle: StateHandle, state: GfxResourceState) {
        match self.entries.get_mut(handle) {
            Some(e) => e.state = state,
            None => panic!("can't set the state of unregistered handle {handle:?}"),
        }
    }

    pub fn gpu_resource(&self, handle: StateHandle) -> &GpuResource<B> {
        &self.entry(handle).resource
    }

    ///# Panics
    ///
    /// if `handle` is not a registered buffer.
    pub fn buffer(&self, handle: StateHandle) -> &Buffer<B> {
        match &self.entry(handle).resource {
            GpuResource::Buffer(b) => b,
            GpuResource::Texture(_) => panic!("handle {handle:?} is a texture, not a buffer"),
        }
    }

    ///# Panics
    ///
    /// if `handle` is not a registered texture.
    pub fn texture(&self, handle: StateHandle) -> &Texture<B> {
        match &self.entry(handle).resource {
            GpuResource::Texture(t) => t,
            GpuResource::Buffer(_) => panic!("handle {handle:?} is a buffer, not a texture"),
        }
    }

    pub fn contains(&self, handle: StateHandle) -> bool {
        self.entries.contains_key(handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    ///Highest number of resources that were registered at the same time.
    pub fn max_allocated_state_count(&self) -> usize {
        self.high_water
    }

    ///Unregisters `handle`. The resource is kept alive until `fence` reached `value`, see
    /// [collect_garbage](Self::collect_garbage).
    pub fn release(&mut self, handle: StateHandle, fence: Arc<Fence<B>>, value: u64) {
        let Some(entry) = self.entries.remove(handle) else {
            panic!("can't release unregistered handle {handle:?}");
        };
        #[cfg(feature = "logging")]
        log::trace!(
            "Releasing {} {:?} once fence reached {}",
            entry.resource.kind_name(),
            entry.resource.name(),
            value
        );
        self.graveyard.push(GuardFence::guard(fence, value, entry.resource));
    }

    ///Unregisters `handle` and hands out the resource right away. The caller has to make sure the GPU no longer
    /// uses it.
    pub fn remove(&mut self, handle: StateHandle) -> GpuResource<B> {
        match self.entries.remove(handle) {
            Some(e) => e.resource,
            None => panic!("can't remove unregistered handle {handle:?}"),
        }
    }

    ///Drops all released resources the GPU is done with. Returns how many were dropped.
    pub fn collect_garbage(&mut self) -> usize {
        let before = self.graveyard.len();
        self.graveyard = std::mem::take(&mut self.graveyard)
            .into_iter()
            .filter_map(|guard| guard.try_drop().err())
            .collect();
        before - self.graveyard.len()
    }

    ///Released resources that are still waiting for the GPU.
    pub fn pending_releases(&self) -> usize {
        self.graveyard.len()
    }

    pub fn handles(&self) -> impl Iterator<Item = StateHandle> + '_ {
        self.entries.keys()
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;
    use tessel::{
        backend::headless::{GpuProgress, Headless, HeadlessConfig},
        context::Device,
        resources::{BufDesc, Format, GfxResourceState, MemoryUsage, TexDesc},
        swapchain::SwapChainDesc,
    };

    use super::*;

    assert_impl_all!(ResourceStatePool<Headless>: Send, Sync);
    assert_impl_all!(StateHandle: Send, Sync, Copy);

    #[test]
    fn register_and_query() {
        let device = Device::headless(HeadlessConfig::default()).unwrap();
        let mut pool = ResourceStatePool::new(&device);
        let vb = pool.create_buffer(BufDesc::gpu_only(64)).unwrap();
        let up = pool.create_buffer(BufDesc::upload(64)).unwrap();
        let tex = pool
            .create_texture(TexDesc::render_target(4, 4, Format::Rgba8Unorm))
            .unwrap();

        assert_eq!(pool.resource_states(vb), GfxResourceState::COMMON);
        assert_eq!(pool.resource_states(up), GfxResourceState::GENERIC_READ);
        assert_eq!(pool.resource_states(tex), GfxResourceState::COMMON);
        assert_eq!(pool.buffer(up).desc.usage, MemoryUsage::CpuToGpu);
        assert!(pool.gpu_resource(tex).as_texture().is_some());

        pool.set_resource_states(tex, GfxResourceState::RENDER_TARGET);
        assert_eq!(pool.resource_states(tex), GfxResourceState::RENDER_TARGET);
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.max_allocated_state_count(), 3);

        let invalid = GfxResourceState::RENDER_TARGET | GfxResourceState::COPY_DEST;
        let buffer = device.create_buffer(BufDesc::gpu_only(4)).unwrap();
        assert!(pool.register(buffer, invalid).is_err());
    }

    #[test]
    #[should_panic(expected = "not registered")]
    fn stale_handle_panics() {
        let device = Device::headless(HeadlessConfig::default()).unwrap();
        let mut pool = ResourceStatePool::new(&device);
        let h = pool.create_buffer(BufDesc::gpu_only(64)).unwrap();
        pool.remove(h);
        //reuses the slot with a new version
        let _other = pool.create_buffer(BufDesc::gpu_only(64)).unwrap();
        assert_eq!(pool.try_resource_states(h), None);
        pool.resource_states(h);
    }

    #[test]
    fn released_resources_wait_for_fence() {
        let device = Device::headless(HeadlessConfig::default().with(|c| c.progress = GpuProgress::Manual)).unwrap();
        let queue = device.create_command_queue().unwrap();
        let fence = device.create_fence(0).unwrap();
        let mut pool = ResourceStatePool::new(&device);
        let h = pool.create_buffer(BufDesc::gpu_only(64)).unwrap();
        let weak = Arc::downgrade(pool.gpu_resource(h).raw());

        queue.signal(&fence, 1).unwrap();
        pool.release(h, fence.clone(), 1);
        assert!(!pool.contains(h));
        assert_eq!(pool.collect_garbage(), 0);
        assert!(weak.upgrade().is_some());
        assert_eq!(pool.max_allocated_state_count(), 1);

        device.inner.retire_all();
        assert_eq!(pool.collect_garbage(), 1);
        assert!(weak.upgrade().is_none());
        assert_eq!(pool.pending_releases(), 0);
    }

    #[test]
    fn swap_chain_registration() {
        let device = Device::headless(HeadlessConfig::default()).unwrap();
        let queue = device.create_command_queue().unwrap();
        let mut swap_chain = device
            .create_swap_chain(&queue, SwapChainDesc::default().with(|d| d.buffer_count = 3))
            .unwrap();
        let mut pool = ResourceStatePool::new(&device);
        let states = pool.register_swap_chain(&swap_chain);
        assert_eq!(states.handles().len(), 3);
        assert_eq!(pool.resource_states(states.current(&swap_chain)), GfxResourceState::PRESENT);

        swap_chain.resize(64, 32).unwrap();
        let states = pool.rebind_swap_chain(states, &swap_chain);
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.texture(states.handle(1)).extent(), (64, 32));
    }
}
