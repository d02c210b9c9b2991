use std::{sync::Arc, time::Duration};

use raw_window_handle::RawWindowHandle;
use smallvec::{SmallVec, smallvec};

use crate::{
    DeviceError, SwapChainError,
    backend::{Backend, RawDevice, RawSwapChain},
    context::{CommandQueue, Device},
    resources::{Format, TexDesc, Texture},
    sync::{DEFAULT_WAIT_TIMEOUT, Fence, FenceEvent},
};

#[derive(Debug, Clone)]
pub struct SwapChainDesc {
    ///Window the swap chain presents to. `None` creates an offscreen swap chain, which is only supported by some backends.
    pub window: Option<RawWindowHandle>,
    pub width: u32,
    pub height: u32,
    pub buffer_count: u32,
    pub format: Format,
    ///Longest time [flip](SwapChain::flip) may block.
    pub wait_timeout: Option<Duration>,
}

impl Default for SwapChainDesc {
    fn default() -> Self {
        SwapChainDesc {
            window: None,
            width: 1280,
            height: 720,
            buffer_count: 2,
            format: Format::Bgra8Unorm,
            wait_timeout: Some(DEFAULT_WAIT_TIMEOUT),
        }
    }
}

impl SwapChainDesc {
    pub fn with(mut self, f: impl FnOnce(&mut Self)) -> Self {
        f(&mut self);
        self
    }

    pub fn validate(&self) -> Result<(), SwapChainError> {
        if self.width == 0 || self.height == 0 {
            return Err(SwapChainError::InvalidSize {
                width: self.width,
                height: self.height,
            });
        }
        if !(2..=16).contains(&self.buffer_count) {
            return Err(SwapChainError::InvalidBufferCount(self.buffer_count));
        }
        if self.format.is_depth() {
            return Err(DeviceError::InvalidDescription(format!(
                "{:?} can't be presented",
                self.format
            ))
            .into());
        }
        Ok(())
    }
}

///Result of a [flip](SwapChain::flip).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Flip {
    ///Back buffer that is rendered to in the next frame.
    pub back_buffer_index: u32,
    ///Frame fence value signaled for the frame that was just presented.
    pub fence_value: u64,
    ///True if the CPU had to wait for the GPU.
    pub blocked: bool,
}

///Flip-model swap chain with bounded frame pacing.
///
/// Each frame is finished by [present](SwapChain::present) followed by exactly one [flip](SwapChain::flip). The flip
/// signals the frame fence and blocks as long as the CPU is `buffer_count` or more frames ahead of the GPU.
pub struct SwapChain<B: Backend> {
    pub inner: B::SwapChain,
    pub device: Arc<Device<B>>,
    queue: Arc<CommandQueue<B>>,
    fence: Arc<Fence<B>>,
    event: FenceEvent<B>,
    ///Last signaled frame fence value.
    fence_value: u64,
    ///Frame fence value signaled when each back buffer was presented last.
    slot_values: SmallVec<[u64; 4]>,
    back_buffers: Vec<Texture<B>>,
    index: u32,
    presented: bool,
    timeout: Option<Duration>,
    width: u32,
    height: u32,
    format: Format,
    stalls: u64,
}

impl<B: Backend> SwapChain<B> {
    pub fn new(
        device: &Arc<Device<B>>,
        queue: &Arc<CommandQueue<B>>,
        desc: SwapChainDesc,
    ) -> Result<Self, SwapChainError> {
        desc.validate()?;
        let inner = device.inner.create_swap_chain(&queue.inner, &desc)?;
        let fence = Fence::new(device, 0)?;
        let event = FenceEvent::new(device)?;

        let mut swap_chain = SwapChain {
            slot_values: smallvec![0; inner.buffer_count() as usize],
            inner,
            device: device.clone(),
            queue: queue.clone(),
            fence,
            event,
            fence_value: 0,
            back_buffers: Vec::new(),
            index: 0,
            presented: false,
            timeout: desc.wait_timeout,
            width: desc.width,
            height: desc.height,
            format: desc.format,
            stalls: 0,
        };
        swap_chain.acquire_back_buffers()?;

        #[cfg(feature = "logging")]
        log::info!(
            "Created swap chain {}x{} with {} buffers of {:?}",
            desc.width,
            desc.height,
            swap_chain.buffer_count(),
            desc.format
        );

        Ok(swap_chain)
    }

    fn acquire_back_buffers(&mut self) -> Result<(), DeviceError> {
        self.back_buffers.clear();
        for i in 0..self.inner.buffer_count() {
            let raw = self.inner.back_buffer(i)?;
            let desc = TexDesc::render_target(self.width, self.height, self.format)
                .with(|d| d.name = Some(format!("back buffer {i}")));
            self.back_buffers.push(Texture::from_raw(&self.device, desc, raw));
        }
        self.index = self.inner.current_back_buffer_index();
        Ok(())
    }

    pub fn buffer_count(&self) -> u32 {
        self.back_buffers.len() as u32
    }

    pub fn extent(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn format(&self) -> Format {
        self.format
    }

    ///Index of the back buffer that is currently rendered to.
    pub fn back_buffer_index(&self) -> u32 {
        self.index
    }

    ///The back buffer for the current frame, in the index order reported by the presentation engine.
    pub fn swap_chain_texture(&self) -> &Texture<B> {
        &self.back_buffers[self.index as usize]
    }

    pub fn back_buffers(&self) -> &[Texture<B>] {
        &self.back_buffers
    }

    pub fn frame_fence(&self) -> &Arc<Fence<B>> {
        &self.fence
    }

    ///Number of frames flipped so far.
    pub fn frame_count(&self) -> u64 {
        self.fence_value
    }

    ///Number of frames the GPU retired.
    pub fn completed_frames(&self) -> u64 {
        self.fence.completed_value()
    }

    ///Number of flips that had to wait for the GPU.
    pub fn stall_count(&self) -> u64 {
        self.stalls
    }

    ///Queues the current back buffer for presentation. The back buffer has to be in the present state.
    ///
    /// # Panics
    ///
    /// if called twice without [flip](SwapChain::flip) in between.
    pub fn present(&mut self, sync_interval: u32) -> Result<(), SwapChainError> {
        assert!(!self.presented, "present() called twice without flip()");
        self.inner.present(sync_interval)?;
        self.presented = true;
        Ok(())
    }

    ///Finishes the frame. Signals the frame fence and advances to the next back buffer. Blocks if the GPU did not yet
    /// retire the frame that last rendered to that back buffer, which is exactly the case if the CPU is `buffer_count`
    /// frames ahead.
    ///
    /// # Panics
    ///
    /// if [present](SwapChain::present) was not called before.
    pub fn flip(&mut self) -> Result<Flip, SwapChainError> {
        #[cfg(feature = "profiling")]
        puffin::profile_function!();

        assert!(self.presented, "flip() requires a preceding present()");
        self.presented = false;

        self.fence_value += 1;
        let value = self.fence_value;
        self.slot_values[self.index as usize] = value;
        self.fence.signal(&self.queue, value)?;

        self.index = self.inner.current_back_buffer_index();
        let wait_for = self.slot_values[self.index as usize];
        let blocked = self.fence.wait(&self.event, wait_for, self.timeout)?;
        if blocked {
            self.stalls += 1;
            #[cfg(feature = "logging")]
            log::trace!("flip {} waited for frame {}", value, wait_for);
        }

        Ok(Flip {
            back_buffer_index: self.index,
            fence_value: value,
            blocked,
        })
    }

    ///Blocks until the GPU retired every flipped frame.
    pub fn wait_idle(&self) -> Result<(), SwapChainError> {
        self.fence.wait(&self.event, self.fence_value, self.timeout)?;
        Ok(())
    }

    ///Resizes all back buffers. Waits for the GPU to become idle first. Any external reference to the old back buffers
    /// (for instance a state pool registration) has to be dropped or rebound afterwards.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), SwapChainError> {
        assert!(!self.presented, "resize() between present() and flip()");
        if width == 0 || height == 0 {
            return Err(SwapChainError::InvalidSize { width, height });
        }
        self.wait_idle()?;
        self.back_buffers.clear();
        self.inner.resize(width, height)?;
        self.width = width;
        self.height = height;
        self.acquire_back_buffers()?;

        #[cfg(feature = "logging")]
        log::info!("Resized swap chain to {}x{}", width, height);
        Ok(())
    }
}

impl<B: Backend> Drop for SwapChain<B> {
    fn drop(&mut self) {
        if let Err(_e) = self.wait_idle() {
            #[cfg(feature = "logging")]
            log::error!("Failed to wait for swap chain idle on drop: {}", _e);
        }
    }
}
