use tessel::{
    backend::Backend,
    resources::{BufDesc, Buffer},
    swapchain::{Flip, SwapChain},
    util::align_up,
};

use crate::ConstantError;

///Alignment of constant buffer views.
pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

///Linear allocator for per-frame constant data in upload memory.
///
/// The buffer is split into one region per back buffer. A region is reused without any fence of its own: when
/// [SwapChain::flip] returns a back buffer index, the frame that used the same back buffer (and therefore the same
/// region) was retired by the GPU. This is why [begin_frame](Self::begin_frame) takes the [Flip].
pub struct ConstantAllocator<B: Backend> {
    buffer: Buffer<B>,
    region_size: u64,
    region: u32,
    head: u64,
}

impl<B: Backend> ConstantAllocator<B> {
    ///Creates an allocator with `region_size` bytes per back buffer of `swap_chain`. Allocation starts in the region of
    /// the current back buffer.
    pub fn new(swap_chain: &SwapChain<B>, region_size: u64) -> Result<Self, ConstantError> {
        if region_size == 0 {
            return Err(ConstantError::EmptyRegion);
        }
        let region_size = align_up(region_size, CONSTANT_BUFFER_ALIGNMENT);
        let buffer = Buffer::new(
            &swap_chain.device,
            BufDesc::upload(region_size * swap_chain.buffer_count() as u64)
                .with(|d| d.name = Some("frame constants".to_owned())),
        )?;
        Ok(ConstantAllocator {
            buffer,
            region_size,
            region: swap_chain.back_buffer_index(),
            head: 0,
        })
    }

    ///Switches to the region of the back buffer `flip` returned and discards its previous content.
    pub fn begin_frame(&mut self, flip: &Flip) {
        self.region = flip.back_buffer_index;
        self.head = 0;
    }

    ///Copies `data` into the current region. Returns its GPU address.
    pub fn allocate_bytes(&mut self, data: &[u8]) -> Result<u64, ConstantError> {
        let size = align_up(data.len().max(1) as u64, CONSTANT_BUFFER_ALIGNMENT);
        let available = self.region_size - self.head;
        if size > available {
            return Err(ConstantError::OutOfSpace {
                requested: size,
                available,
            });
        }
        let offset = self.region as u64 * self.region_size + self.head;
        self.buffer.write(offset, data)?;
        self.head += size;
        Ok(self.buffer.gpu_address() + offset)
    }

    pub fn allocate<T: bytemuck::Pod>(&mut self, value: &T) -> Result<u64, ConstantError> {
        self.allocate_bytes(bytemuck::bytes_of(value))
    }

    ///Bytes allocated in the current frame.
    pub fn used(&self) -> u64 {
        self.head
    }

    pub fn region(&self) -> u32 {
        self.region
    }

    pub fn region_size(&self) -> u64 {
        self.region_size
    }

    pub fn buffer(&self) -> &Buffer<B> {
        &self.buffer
    }
}
