use std::sync::Arc;

use crate::{
    DeviceError, SwapChainError,
    backend::{
        Backend,
        headless::{Headless, HeadlessConfig, HeadlessDevice},
    },
    resources::{
        BufDesc, Buffer, GraphicsCommandList, GraphicsState, PipelineStateDesc, TexDesc, Texture,
    },
    swapchain::{SwapChain, SwapChainDesc},
    sync::{Fence, FenceEvent},
};

use super::CommandQueue;

///The logical device. Creates all other GPU objects.
///
/// Every object created by the device keeps an `Arc` of it. The native device is therefore destroyed after the last
/// object that was created from it.
pub struct Device<B: Backend> {
    pub inner: B::Device,
    pub name: Option<String>,
}

impl Device<Headless> {
    ///Creates a device on the software [headless](crate::backend::headless) backend.
    pub fn headless(config: HeadlessConfig) -> Result<Arc<Self>, DeviceError> {
        Ok(Self::new(HeadlessDevice::new(config)?, Some("headless")))
    }
}

impl<B: Backend> Device<B> {
    ///Wraps an already created native device.
    pub fn new(inner: B::Device, name: Option<&str>) -> Arc<Self> {
        Arc::new(Device {
            inner,
            name: name.map(|n| n.to_owned()),
        })
    }

    pub fn create_command_queue(self: &Arc<Self>) -> Result<Arc<CommandQueue<B>>, DeviceError> {
        CommandQueue::new(self)
    }

    ///Creates a closed graphics command list.
    pub fn create_graphics_command_list(self: &Arc<Self>) -> Result<GraphicsCommandList<B>, DeviceError> {
        GraphicsCommandList::new(self)
    }

    pub fn create_fence(self: &Arc<Self>, initial_value: u64) -> Result<Arc<Fence<B>>, DeviceError> {
        Fence::new(self, initial_value)
    }

    pub fn create_fence_event(self: &Arc<Self>) -> Result<FenceEvent<B>, DeviceError> {
        FenceEvent::new(self)
    }

    ///Creates a swap chain that presents through `queue`.
    pub fn create_swap_chain(
        self: &Arc<Self>,
        queue: &Arc<CommandQueue<B>>,
        desc: SwapChainDesc,
    ) -> Result<SwapChain<B>, SwapChainError> {
        SwapChain::new(self, queue, desc)
    }

    pub fn create_graphics_state(self: &Arc<Self>, desc: PipelineStateDesc) -> Result<GraphicsState<B>, DeviceError> {
        GraphicsState::new(self, desc)
    }

    pub fn create_buffer(self: &Arc<Self>, desc: BufDesc) -> Result<Buffer<B>, DeviceError> {
        Buffer::new(self, desc)
    }

    pub fn create_texture(self: &Arc<Self>, desc: TexDesc) -> Result<Texture<B>, DeviceError> {
        Texture::new(self, desc)
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use crate::{
        backend::headless::{Headless, HeadlessConfig},
        context::{CommandQueue, Device},
        resources::{Buffer, GraphicsCommandList, GraphicsState, PipelineStateDesc, Texture},
        swapchain::SwapChain,
        sync::{Fence, FenceEvent},
    };

    #[test]
    fn assure_send_sync() {
        assert_impl_all!(Device<Headless>: Send, Sync);
        assert_impl_all!(CommandQueue<Headless>: Send, Sync);
        assert_impl_all!(Fence<Headless>: Send, Sync);
        assert_impl_all!(FenceEvent<Headless>: Send, Sync);
        assert_impl_all!(Buffer<Headless>: Send, Sync);
        assert_impl_all!(Texture<Headless>: Send, Sync);
        assert_impl_all!(GraphicsState<Headless>: Send, Sync);
        assert_impl_all!(GraphicsCommandList<Headless>: Send);
        assert_impl_all!(SwapChain<Headless>: Send);
    }

    #[test]
    fn children_keep_device_alive() {
        let device = Device::headless(HeadlessConfig::default()).unwrap();
        let pso = device.create_graphics_state(PipelineStateDesc::default()).unwrap();
        let list = device.create_graphics_command_list().unwrap();
        assert_eq!(std::sync::Arc::strong_count(&device), 3);
        drop(pso);
        drop(list);
        assert_eq!(std::sync::Arc::strong_count(&device), 1);
        assert_eq!(device.name.as_deref(), Some("headless"));
    }
}
