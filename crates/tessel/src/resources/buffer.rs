use std::{
    hash::{Hash, Hasher},
    sync::Arc,
};

use crate::{
    DeviceError,
    backend::{Backend, RawDevice, RawResource},
    context::Device,
};

use super::{GfxResourceState, IndexBufferView, IndexFormat, VertexBufferView};

///Heap a buffer is placed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemoryUsage {
    ///Device local, not host visible.
    #[default]
    GpuOnly,
    ///Upload heap. Host writable, read by the GPU.
    CpuToGpu,
    ///Readback heap. Written by the GPU, host readable.
    GpuToCpu,
}

impl MemoryUsage {
    ///The state a resource on this heap is created in. Upload and readback heaps can't leave those states.
    pub fn initial_state(&self) -> GfxResourceState {
        match self {
            MemoryUsage::GpuOnly => GfxResourceState::COMMON,
            MemoryUsage::CpuToGpu => GfxResourceState::GENERIC_READ,
            MemoryUsage::GpuToCpu => GfxResourceState::COPY_DEST,
        }
    }

    pub fn is_host_visible(&self) -> bool {
        !matches!(self, MemoryUsage::GpuOnly)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BufDesc {
    pub size: u64,
    pub usage: MemoryUsage,
    ///Debug name of the resource.
    pub name: Option<String>,
}

impl BufDesc {
    pub fn gpu_only(size: u64) -> Self {
        BufDesc {
            size,
            usage: MemoryUsage::GpuOnly,
            name: None,
        }
    }

    ///Buffer on the upload heap.
    pub fn upload(size: u64) -> Self {
        BufDesc {
            size,
            usage: MemoryUsage::CpuToGpu,
            name: None,
        }
    }

    pub fn readback(size: u64) -> Self {
        BufDesc {
            size,
            usage: MemoryUsage::GpuToCpu,
            name: None,
        }
    }

    ///Lets you change fields inline, for instance `BufDesc::upload(64).with(|d| d.name = Some("x".into()))`.
    pub fn with(mut self, f: impl FnOnce(&mut Self)) -> Self {
        f(&mut self);
        self
    }
}

///Self managing buffer. The native resource is released when the last reference to `inner` is dropped.
pub struct Buffer<B: Backend> {
    pub desc: BufDesc,
    pub inner: Arc<B::Resource>,
    pub device: Arc<Device<B>>,
}

///The hash implementation is based on the buffer's GPU address.
impl<B: Backend> Hash for Buffer<B> {
    fn hash<H: Hasher>(&self, hasher: &mut H) {
        self.inner.gpu_address().hash(hasher)
    }
}

impl<B: Backend> Buffer<B> {
    pub fn new(device: &Arc<Device<B>>, desc: BufDesc) -> Result<Self, DeviceError> {
        if desc.size == 0 {
            return Err(DeviceError::InvalidDescription(
                "buffer size can't be 0".to_owned(),
            ));
        }
        let inner = device.inner.create_buffer(&desc, desc.usage.initial_state())?;

        #[cfg(feature = "logging")]
        log::trace!("Created buffer {:?} of {} bytes", desc.name, desc.size);

        Ok(Buffer {
            desc,
            inner: Arc::new(inner),
            device: device.clone(),
        })
    }

    ///Creates an upload buffer that is initialized to `data`.
    pub fn new_staging_for_data<T: bytemuck::Pod>(
        device: &Arc<Device<B>>,
        name: Option<&str>,
        data: &[T],
    ) -> Result<Self, DeviceError> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let buffer = Self::new(
            device,
            BufDesc::upload(bytes.len() as u64).with(|d| d.name = name.map(|n| n.to_owned())),
        )?;
        buffer.write(0, bytes)?;
        Ok(buffer)
    }

    pub fn gpu_address(&self) -> u64 {
        self.inner.gpu_address()
    }

    pub fn size(&self) -> u64 {
        self.desc.size
    }

    ///State the buffer was created in.
    pub fn initial_state(&self) -> GfxResourceState {
        self.desc.usage.initial_state()
    }

    ///Writes `data` at `offset`. Fails if the buffer is not host visible or the write exceeds the buffer.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        self.check_host_access(offset, data.len() as u64)?;
        self.device.inner.write_buffer(&self.inner, offset, data)
    }

    ///Casts `data` to bytes and writes it at `offset`.
    pub fn write_pod<T: bytemuck::Pod>(&self, offset: u64, data: &[T]) -> Result<(), DeviceError> {
        self.write(offset, bytemuck::cast_slice(data))
    }

    ///Reads `len` bytes starting at `offset`.
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, DeviceError> {
        self.check_host_access(offset, len as u64)?;
        let mut dst = vec![0u8; len];
        self.device.inner.read_buffer(&self.inner, offset, &mut dst)?;
        Ok(dst)
    }

    fn check_host_access(&self, offset: u64, size: u64) -> Result<(), DeviceError> {
        if !self.desc.usage.is_host_visible() {
            return Err(DeviceError::NotMappable);
        }
        if offset.checked_add(size).is_none_or(|end| end > self.desc.size) {
            return Err(DeviceError::OutOfBounds {
                offset,
                size,
                capacity: self.desc.size,
            });
        }
        Ok(())
    }

    ///View of the whole buffer as vertex buffer with `stride` bytes per vertex.
    pub fn vertex_view(&self, stride: u32) -> VertexBufferView {
        VertexBufferView {
            gpu_address: self.gpu_address(),
            size_in_bytes: self.desc.size as u32,
            stride_in_bytes: stride,
        }
    }

    pub fn index_view(&self, format: IndexFormat) -> IndexBufferView {
        IndexBufferView {
            gpu_address: self.gpu_address(),
            size_in_bytes: self.desc.size as u32,
            format,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        DeviceError,
        backend::headless::HeadlessConfig,
        context::Device,
        resources::{BufDesc, GfxResourceState, MemoryUsage},
    };

    #[test]
    fn host_access() {
        let device = Device::headless(HeadlessConfig::default()).unwrap();
        let upload = device.create_buffer(BufDesc::upload(16)).unwrap();
        upload.write_pod(4, &[1u32, 2, 3]).unwrap();
        assert_eq!(upload.read(4, 4).unwrap(), 1u32.to_ne_bytes());
        assert!(matches!(
            upload.write(8, &[0; 16]),
            Err(DeviceError::OutOfBounds { offset: 8, size: 16, capacity: 16 })
        ));

        let local = device.create_buffer(BufDesc::gpu_only(16)).unwrap();
        assert!(matches!(local.write(0, &[1]), Err(DeviceError::NotMappable)));
        assert!(matches!(
            device.create_buffer(BufDesc::gpu_only(0)),
            Err(DeviceError::InvalidDescription(_))
        ));
    }

    #[test]
    fn heap_states() {
        assert_eq!(MemoryUsage::CpuToGpu.initial_state(), GfxResourceState::GENERIC_READ);
        assert_eq!(MemoryUsage::GpuToCpu.initial_state(), GfxResourceState::COPY_DEST);
        assert_eq!(MemoryUsage::GpuOnly.initial_state(), GfxResourceState::COMMON);
    }

    #[test]
    fn staging_for_data() {
        let device = Device::headless(HeadlessConfig::default()).unwrap();
        let staging = crate::resources::Buffer::new_staging_for_data(&device, Some("verts"), &[1.0f32, 2.0]).unwrap();
        assert_eq!(staging.size(), 8);
        assert_eq!(staging.desc.name.as_deref(), Some("verts"));
        assert_eq!(staging.read(4, 4).unwrap(), 2.0f32.to_ne_bytes());
        assert_ne!(staging.gpu_address(), 0);
    }
}
