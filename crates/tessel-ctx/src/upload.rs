use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tessel::{
    FenceError,
    backend::{Backend, RawDevice},
    context::Device,
    resources::{BufDesc, Buffer, GfxResourceState, MemoryUsage, SubresourceFootprint, TexDesc},
    sync::{Fence, GuardFence},
};

use crate::{ContextError, GraphicsContext, ResourceStatePool, StateHandle, UploadError};

pub enum UploadKind {
    Buffer { dst_offset: u64 },
    Texture { footprints: Vec<SubresourceFootprint> },
}

///A staging buffer waiting to be copied into `target`.
pub struct UploadRequest<B: Backend> {
    pub target: StateHandle,
    pub staging: Buffer<B>,
    pub kind: UploadKind,
    ///State `target` is transitioned to after the copy. Stays in `COPY_DEST` if `None`.
    pub final_state: Option<GfxResourceState>,
}

///Queue of pending staging copies.
///
/// Uploads can be added from any thread. [flush](UploadPool::flush) records them into a [GraphicsContext] and hands the
/// staging buffers to a [StagingRing], which keeps them alive until the GPU executed the copies.
pub struct UploadPool<B: Backend> {
    queue: Mutex<Vec<UploadRequest<B>>>,
}

impl<B: Backend> Default for UploadPool<B> {
    fn default() -> Self {
        UploadPool {
            queue: Mutex::new(Vec::new()),
        }
    }
}

impl<B: Backend> UploadPool<B> {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_request(staging: &Buffer<B>, final_state: Option<GfxResourceState>) -> Result<(), UploadError> {
        if staging.desc.usage != MemoryUsage::CpuToGpu {
            return Err(UploadError::NotHostVisible);
        }
        if let Some(state) = final_state {
            state.validate()?;
        }
        Ok(())
    }

    ///Queues a copy of the whole `staging` buffer to `dst_offset` of the `target` buffer.
    pub fn add_buffer(
        &self,
        target: StateHandle,
        staging: Buffer<B>,
        dst_offset: u64,
        final_state: Option<GfxResourceState>,
    ) -> Result<(), UploadError> {
        Self::check_request(&staging, final_state)?;
        self.queue.lock().push(UploadRequest {
            target,
            staging,
            kind: UploadKind::Buffer { dst_offset },
            final_state,
        });
        Ok(())
    }

    ///Queues a copy of the placed `footprints` in `staging` into the subresources of the `target` texture.
    pub fn add_texture(
        &self,
        target: StateHandle,
        staging: Buffer<B>,
        footprints: Vec<SubresourceFootprint>,
        final_state: Option<GfxResourceState>,
    ) -> Result<(), UploadError> {
        Self::check_request(&staging, final_state)?;
        if let Some(fp) = footprints.iter().find(|fp| fp.offset + fp.span() > staging.size()) {
            return Err(UploadError::OutOfBounds {
                target: staging.desc.name.clone(),
                offset: fp.offset,
                size: fp.span(),
                capacity: staging.size(),
            });
        }
        self.queue.lock().push(UploadRequest {
            target,
            staging,
            kind: UploadKind::Texture { footprints },
            final_state,
        });
        Ok(())
    }

    ///Number of queued uploads.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    ///Creates a staging buffer holding `data`.
    pub fn stage_buffer(device: &Arc<Device<B>>, data: &[u8]) -> Result<Buffer<B>, UploadError> {
        if data.is_empty() {
            return Err(UploadError::SizeMismatch { expected: 1, actual: 0 });
        }
        Ok(Buffer::new_staging_for_data(device, Some("staging"), data)?)
    }

    ///Creates a staging buffer holding the tightly packed subresources in `data`, laid out in placed footprints.
    pub fn stage_texture(
        device: &Arc<Device<B>>,
        desc: &TexDesc,
        data: &[u8],
    ) -> Result<(Buffer<B>, Vec<SubresourceFootprint>), UploadError> {
        let expected = desc.packed_size();
        if data.len() as u64 != expected {
            return Err(UploadError::SizeMismatch {
                expected,
                actual: data.len() as u64,
            });
        }

        let (footprints, size) = device.inner.copyable_footprints(desc);
        let staging = Buffer::new(
            device,
            BufDesc::upload(size).with(|d| d.name = Some("texture staging".to_owned())),
        )?;
        for fp in &footprints {
            let src = desc.packed_offset(fp.subresource) as usize;
            let row = fp.row_size() as usize;
            for y in 0..fp.height as usize {
                let from = src + y * row;
                staging.write(fp.offset + (y as u64 * fp.row_pitch as u64), &data[from..from + row])?;
            }
        }
        Ok((staging, footprints))
    }

    fn check_target(pool: &ResourceStatePool<B>, request: &UploadRequest<B>) -> Result<(), UploadError> {
        let resource = pool.gpu_resource(request.target);
        match &request.kind {
            UploadKind::Buffer { dst_offset } => {
                let Some(target) = resource.as_buffer() else {
                    return Err(UploadError::WrongTarget {
                        expected: "buffer",
                        found: resource.kind_name(),
                    });
                };
                let size = request.staging.size();
                if dst_offset + size > target.size() {
                    return Err(UploadError::OutOfBounds {
                        target: target.desc.name.clone(),
                        offset: *dst_offset,
                        size,
                        capacity: target.size(),
                    });
                }
            }
            UploadKind::Texture { .. } => {
                if resource.as_texture().is_none() {
                    return Err(UploadError::WrongTarget {
                        expected: "texture",
                        found: resource.kind_name(),
                    });
                }
            }
        }
        Ok(())
    }

    fn record(
        context: &mut GraphicsContext<B>,
        pool: &ResourceStatePool<B>,
        ring: &mut StagingRing<B>,
        slot: usize,
        fence_value: u64,
        request: UploadRequest<B>,
    ) -> Result<(), ContextError> {
        match &request.kind {
            UploadKind::Buffer { dst_offset } => {
                let size = request.staging.size();
                context.copy_from_staging(pool, request.target, *dst_offset, &request.staging, 0, size)?;
            }
            UploadKind::Texture { footprints } => {
                context.copy_texture_from_staging(pool, request.target, &request.staging, footprints)?;
            }
        }
        ring.retain(slot, fence_value, request.staging);
        if let Some(state) = request.final_state {
            context.transition(pool, request.target, state)?;
        }
        Ok(())
    }

    ///Records all queued uploads into `context`. The staging buffers are retained in `slot` of `ring` until the
    /// fence reached `fence_value`, the value that is signaled after the context was executed.
    ///
    /// Every request is checked before anything is recorded. A request whose target has the wrong kind or is too small
    /// is dropped and reported, the other requests stay queued.
    ///
    /// Returns the number of recorded uploads.
    pub fn flush(
        &self,
        context: &mut GraphicsContext<B>,
        pool: &ResourceStatePool<B>,
        ring: &mut StagingRing<B>,
        slot: usize,
        fence_value: u64,
    ) -> Result<usize, ContextError> {
        #[cfg(feature = "profiling")]
        puffin::profile_function!();

        let requests = {
            let mut queue = self.queue.lock();
            let rejected = queue
                .iter()
                .enumerate()
                .find_map(|(i, request)| Self::check_target(pool, request).err().map(|e| (i, e)));
            if let Some((index, e)) = rejected {
                //can never succeed, everything else stays queued
                queue.remove(index);
                return Err(e.into());
            }
            std::mem::take(&mut *queue)
        };
        let count = requests.len();
        let mut requests = requests.into_iter();
        while let Some(request) = requests.next() {
            if let Err(e) = Self::record(context, pool, ring, slot, fence_value, request) {
                self.queue.lock().extend(requests);
                return Err(e);
            }
        }

        #[cfg(feature = "logging")]
        if count > 0 {
            log::trace!("Flushed {} uploads into context {}", count, context.id());
        }
        Ok(count)
    }
}

///Staging buffers retained per ring slot until the GPU consumed them.
pub struct StagingRing<B: Backend> {
    slots: Vec<Vec<GuardFence<B, Buffer<B>>>>,
    fence: Arc<Fence<B>>,
    timeout: Option<Duration>,
}

impl<B: Backend> StagingRing<B> {
    pub fn new(fence: Arc<Fence<B>>, frames_in_flight: usize, timeout: Option<Duration>) -> Self {
        StagingRing {
            slots: (0..frames_in_flight.max(1)).map(|_| Vec::new()).collect(),
            fence,
            timeout,
        }
    }

    ///Keeps `staging` alive until the fence reached `value`.
    pub fn retain(&mut self, slot: usize, value: u64, staging: Buffer<B>) {
        self.slots[slot].push(GuardFence::guard(self.fence.clone(), value, staging).with_timeout(self.timeout));
    }

    ///Releases all staging buffers of `slot`. Blocks until the fence reached their value if the GPU is not done yet.
    /// Returns the number of released buffers. If the wait fails, the buffers stay retained.
    pub fn recycle(&mut self, slot: usize) -> Result<usize, FenceError> {
        let retained = &mut self.slots[slot];
        for guard in retained.iter().filter(|g| !g.is_expired()) {
            #[cfg(feature = "logging")]
            log::warn!("Recycling staging slot {} before fence value {}", slot, guard.target());
            guard.wait()?;
        }
        let count = retained.len();
        retained.clear();
        Ok(count)
    }

    ///Staging buffers retained in `slot`.
    pub fn retained(&self, slot: usize) -> usize {
        self.slots[slot].len()
    }

    pub fn total_retained(&self) -> usize {
        self.slots.iter().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use static_assertions::assert_impl_all;
    use tessel::{
        FenceError,
        backend::headless::{GpuProgress, Headless, HeadlessConfig},
        context::Device,
        resources::{BufDesc, Format, GfxResourceState, TexDesc},
    };

    use super::{StagingRing, UploadPool};
    use crate::{ContextError, GraphicsContext, ResourceStatePool, UploadError};

    assert_impl_all!(UploadPool<Headless>: Send, Sync);

    #[test]
    fn producers_on_several_threads() {
        let device = Device::headless(HeadlessConfig::default()).unwrap();
        let mut pool = ResourceStatePool::new(&device);
        let targets: Vec<_> = (0..4)
            .map(|_| pool.create_buffer(BufDesc::gpu_only(16)).unwrap())
            .collect();
        let uploads = Arc::new(UploadPool::new());

        std::thread::scope(|s| {
            for (i, target) in targets.iter().enumerate() {
                let uploads = uploads.clone();
                let device = device.clone();
                s.spawn(move || {
                    let staging = UploadPool::stage_buffer(&device, &[i as u8; 16]).unwrap();
                    uploads.add_buffer(*target, staging, 0, None).unwrap();
                });
            }
        });
        assert_eq!(uploads.len(), 4);

        let queue = device.create_command_queue().unwrap();
        let fence = device.create_fence(0).unwrap();
        let mut ring = StagingRing::new(fence.clone(), 2, None);
        let mut ctx = GraphicsContext::new(&device, 0, 2).unwrap();
        ctx.reset().unwrap();
        assert_eq!(uploads.flush(&mut ctx, &pool, &mut ring, 0, 1).unwrap(), 4);
        assert!(uploads.is_empty());
        assert_eq!(ring.retained(0), 4);
        assert_eq!(ctx.pending_state(targets[0]), Some(GfxResourceState::COPY_DEST));

        ctx.close().unwrap();
        queue.execute(&[ctx.command_list()]);
        queue.signal(&fence, 1).unwrap();
        assert!(device.inner.validation_errors().is_empty());
        assert_eq!(pool.buffer(targets[3]).size(), 16);
        assert_eq!(ring.recycle(0).unwrap(), 4);
        assert_eq!(ring.total_retained(), 0);
    }

    #[test]
    fn texture_upload_roundtrip() {
        let device = Device::headless(HeadlessConfig::default()).unwrap();
        let queue = device.create_command_queue().unwrap();
        let mut pool = ResourceStatePool::new(&device);
        let desc = TexDesc::texture_2d(3, 2, Format::R32Uint);
        let tex = pool.create_texture(desc.clone()).unwrap();
        let texels: Vec<u32> = (0..6).collect();

        let (staging, footprints) = UploadPool::stage_texture(&device, &desc, bytemuck::cast_slice(&texels)).unwrap();
        let uploads = UploadPool::new();
        uploads
            .add_texture(tex, staging, footprints, Some(GfxResourceState::PIXEL_SHADER_RESOURCE))
            .unwrap();

        let fence = device.create_fence(0).unwrap();
        let mut ring = StagingRing::new(fence.clone(), 2, None);
        let mut ctx = GraphicsContext::new(&device, 0, 2).unwrap();
        ctx.reset().unwrap();
        uploads.flush(&mut ctx, &pool, &mut ring, 0, 1).unwrap();
        ctx.close().unwrap();
        queue.execute(&[ctx.command_list()]);
        queue.signal(&fence, 1).unwrap();

        assert!(device.inner.validation_errors().is_empty());
        assert_eq!(
            device.inner.resource_bytes(&pool.texture(tex).inner),
            bytemuck::cast_slice::<u32, u8>(&texels)
        );
        assert_eq!(
            device.inner.resource_state(&pool.texture(tex).inner),
            GfxResourceState::PIXEL_SHADER_RESOURCE
        );
        assert_eq!(ring.recycle(0).unwrap(), 1);
    }

    #[test]
    fn rejects_bad_requests() {
        let device = Device::headless(HeadlessConfig::default()).unwrap();
        let mut pool = ResourceStatePool::new(&device);
        let small = pool.create_buffer(BufDesc::gpu_only(4)).unwrap();
        let uploads = UploadPool::new();

        let not_staging = device.create_buffer(BufDesc::gpu_only(4)).unwrap();
        assert!(matches!(
            uploads.add_buffer(small, not_staging, 0, None),
            Err(UploadError::NotHostVisible)
        ));
        let staging = UploadPool::stage_buffer(&device, &[0; 4]).unwrap();
        assert!(matches!(
            uploads.add_buffer(
                small,
                staging,
                0,
                Some(GfxResourceState::COPY_DEST | GfxResourceState::RENDER_TARGET)
            ),
            Err(UploadError::InvalidState(_))
        ));
        assert!(matches!(
            UploadPool::stage_texture(&device, &TexDesc::texture_2d(2, 2, Format::Rgba8Unorm), &[0; 4]),
            Err(UploadError::SizeMismatch { expected: 16, actual: 4 })
        ));

        let staging = UploadPool::stage_buffer(&device, &[0; 8]).unwrap();
        uploads.add_buffer(small, staging, 0, None).unwrap();
        let fence = device.create_fence(0).unwrap();
        let mut ring = StagingRing::new(fence, 1, None);
        let mut ctx = GraphicsContext::new(&device, 0, 1).unwrap();
        ctx.reset().unwrap();
        assert!(matches!(
            uploads.flush(&mut ctx, &pool, &mut ring, 0, 1),
            Err(ContextError::Upload(UploadError::OutOfBounds { size: 8, capacity: 4, .. }))
        ));
    }

    #[test]
    fn recycle_blocks_until_fence() {
        let device = Device::headless(HeadlessConfig::default().with(|c| c.progress = GpuProgress::Manual)).unwrap();
        let queue = device.create_command_queue().unwrap();
        let fence = device.create_fence(0).unwrap();
        let mut ring = StagingRing::new(fence.clone(), 2, None);
        let staging = UploadPool::stage_buffer(&device, &[1; 4]).unwrap();
        let weak = Arc::downgrade(&staging.inner);
        ring.retain(1, 1, staging);
        queue.signal(&fence, 1).unwrap();

        assert!(weak.upgrade().is_some());
        assert_eq!(ring.recycle(1).unwrap(), 1);
        assert!(weak.upgrade().is_none());
        //the drop had to wait for the GPU
        assert!(fence.is_reached(1));
        assert_eq!(device.inner.stats().stalls, 1);
    }

    #[test]
    fn rejected_request_keeps_the_rest_queued() {
        let device = Device::headless(HeadlessConfig::default()).unwrap();
        let mut pool = ResourceStatePool::new(&device);
        let tex = pool
            .create_texture(TexDesc::texture_2d(2, 2, Format::Rgba8Unorm))
            .unwrap();
        let buf = pool.create_buffer(BufDesc::gpu_only(16)).unwrap();
        let uploads = UploadPool::new();
        //buffer copy into a texture
        uploads
            .add_buffer(tex, UploadPool::stage_buffer(&device, &[1; 16]).unwrap(), 0, None)
            .unwrap();
        uploads
            .add_buffer(buf, UploadPool::stage_buffer(&device, &[2; 16]).unwrap(), 0, None)
            .unwrap();

        let fence = device.create_fence(0).unwrap();
        let mut ring = StagingRing::new(fence, 1, None);
        let mut ctx = GraphicsContext::new(&device, 0, 1).unwrap();
        ctx.reset().unwrap();
        assert!(matches!(
            uploads.flush(&mut ctx, &pool, &mut ring, 0, 1),
            Err(ContextError::Upload(UploadError::WrongTarget {
                expected: "buffer",
                found: "texture"
            }))
        ));
        assert_eq!(uploads.len(), 1);
        assert_eq!(ctx.pending_state(buf), None);
        assert_eq!(ring.total_retained(), 0);

        assert_eq!(uploads.flush(&mut ctx, &pool, &mut ring, 0, 1).unwrap(), 1);
        assert!(uploads.is_empty());
        assert_eq!(ctx.pending_state(buf), Some(GfxResourceState::COPY_DEST));
        assert_eq!(ring.retained(0), 1);
    }

    #[test]
    fn recycle_keeps_staging_if_wait_fails() {
        let device = Device::headless(HeadlessConfig::default().with(|c| c.progress = GpuProgress::Manual)).unwrap();
        let queue = device.create_command_queue().unwrap();
        let mut pool = ResourceStatePool::new(&device);
        let buf = pool.create_buffer(BufDesc::gpu_only(16)).unwrap();
        let uploads = UploadPool::new();
        let staging = UploadPool::stage_buffer(&device, &[7; 16]).unwrap();
        let weak = Arc::downgrade(&staging.inner);
        uploads.add_buffer(buf, staging, 0, None).unwrap();

        let fence = device.create_fence(0).unwrap();
        let mut ring = StagingRing::new(fence.clone(), 1, Some(Duration::from_millis(5)));
        let mut ctx = GraphicsContext::new(&device, 0, 1).unwrap();
        ctx.reset().unwrap();
        uploads.flush(&mut ctx, &pool, &mut ring, 0, 1).unwrap();
        ctx.close().unwrap();
        queue.execute(&[ctx.command_list()]);
        queue.signal(&fence, 1).unwrap();

        device.inner.set_hung(true);
        assert!(matches!(ring.recycle(0), Err(FenceError::Timeout { value: 1, .. })));
        assert_eq!(ring.retained(0), 1);
        assert!(weak.upgrade().is_some());

        device.inner.set_hung(false);
        device.inner.retire_all();
        assert!(device.inner.validation_errors().is_empty());
        assert_eq!(device.inner.resource_bytes(&pool.buffer(buf).inner), vec![7; 16]);
        assert_eq!(ring.recycle(0).unwrap(), 1);
        assert!(weak.upgrade().is_none());
    }
}
