use std::sync::Arc;

use smallvec::SmallVec;

use crate::{
    DeviceError,
    backend::{Backend, RawDevice, RawQueue},
    resources::GraphicsCommandList,
    sync::Fence,
};

use super::Device;

///Command queue. Lists submitted to one queue execute in submission order.
pub struct CommandQueue<B: Backend> {
    pub inner: B::Queue,
    pub device: Arc<Device<B>>,
}

impl<B: Backend> CommandQueue<B> {
    pub fn new(device: &Arc<Device<B>>) -> Result<Arc<Self>, DeviceError> {
        let inner = device.inner.create_queue()?;
        Ok(Arc::new(CommandQueue {
            inner,
            device: device.clone(),
        }))
    }

    ///Submits `lists` in order. All lists must be closed.
    pub fn execute(&self, lists: &[&GraphicsCommandList<B>]) {
        #[cfg(feature = "profiling")]
        puffin::profile_function!();

        let raw: SmallVec<[&B::CommandList; 16]> = lists
            .iter()
            .map(|l| {
                assert!(l.is_closed(), "only closed command lists can be executed");
                &l.inner
            })
            .collect();
        if raw.is_empty() {
            return;
        }
        self.inner.execute(&raw);
    }

    ///Signals `fence` with `value` after all work submitted so far. See [Fence::signal].
    pub fn signal(&self, fence: &Fence<B>, value: u64) -> Result<(), DeviceError> {
        fence.signal(self, value)
    }

    ///Lets the GPU wait until `fence` reached `value` before starting work submitted afterwards.
    pub fn wait(&self, fence: &Fence<B>, value: u64) -> Result<(), DeviceError> {
        self.inner.wait(&fence.inner, value)
    }
}
