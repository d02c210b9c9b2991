use std::{
    hash::{Hash, Hasher},
    sync::Arc,
};

use crate::{
    DeviceError,
    backend::{Backend, RawDevice, RawResource},
    context::Device,
    util::align_up,
};

///Row pitch alignment of placed texture footprints within buffers.
pub const TEXTURE_DATA_PITCH_ALIGNMENT: u64 = 256;
///Offset alignment of placed texture footprints within buffers.
pub const TEXTURE_DATA_PLACEMENT_ALIGNMENT: u64 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Format {
    #[default]
    Rgba8Unorm,
    Bgra8Unorm,
    R32Uint,
    R32Float,
    Rgba32Float,
    D32Float,
}

impl Format {
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            Format::Rgba8Unorm | Format::Bgra8Unorm | Format::R32Uint | Format::R32Float | Format::D32Float => 4,
            Format::Rgba32Float => 16,
        }
    }

    pub fn is_depth(&self) -> bool {
        matches!(self, Format::D32Float)
    }

    ///Encodes a clear color into a single texel. Integer formats take the red channel unchanged.
    pub fn encode_color(&self, color: [f32; 4]) -> Vec<u8> {
        let unorm = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
        match self {
            Format::Rgba8Unorm => color.iter().map(|c| unorm(*c)).collect(),
            Format::Bgra8Unorm => [color[2], color[1], color[0], color[3]]
                .iter()
                .map(|c| unorm(*c))
                .collect(),
            Format::R32Uint => (color[0] as u32).to_ne_bytes().to_vec(),
            Format::R32Float | Format::D32Float => color[0].to_ne_bytes().to_vec(),
            Format::Rgba32Float => bytemuck::cast_slice::<f32, u8>(&color).to_vec(),
        }
    }
}

bitflags::bitflags! {
    ///Which states a texture may ever be transitioned to, beside the read and copy states.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TexUsage: u32 {
        const RENDER_TARGET = 0x1;
        const DEPTH_STENCIL = 0x2;
        const UNORDERED_ACCESS = 0x4;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TexDesc {
    pub width: u32,
    pub height: u32,
    pub array_layers: u16,
    pub mip_levels: u16,
    pub format: Format,
    pub usage: TexUsage,
    pub name: Option<String>,
}

impl Default for TexDesc {
    fn default() -> Self {
        TexDesc {
            width: 1,
            height: 1,
            array_layers: 1,
            mip_levels: 1,
            format: Format::default(),
            usage: TexUsage::empty(),
            name: None,
        }
    }
}

impl TexDesc {
    pub fn texture_2d(width: u32, height: u32, format: Format) -> Self {
        TexDesc {
            width,
            height,
            format,
            ..Default::default()
        }
    }

    pub fn render_target(width: u32, height: u32, format: Format) -> Self {
        Self::texture_2d(width, height, format).with(|d| d.usage = TexUsage::RENDER_TARGET)
    }

    pub fn with(mut self, f: impl FnOnce(&mut Self)) -> Self {
        f(&mut self);
        self
    }

    pub fn subresource_count(&self) -> u32 {
        self.mip_levels as u32 * self.array_layers as u32
    }

    ///Subresource index of `mip` in array layer `layer`.
    pub fn subresource(&self, mip: u16, layer: u16) -> u32 {
        mip as u32 + layer as u32 * self.mip_levels as u32
    }

    ///Width and height of the given subresource.
    pub fn subresource_extent(&self, subresource: u32) -> (u32, u32) {
        let mip = subresource % self.mip_levels as u32;
        ((self.width >> mip).max(1), (self.height >> mip).max(1))
    }

    ///Tightly packed size of one subresource.
    pub fn subresource_size(&self, subresource: u32) -> u64 {
        let (w, h) = self.subresource_extent(subresource);
        w as u64 * h as u64 * self.format.bytes_per_pixel() as u64
    }

    ///Offset of `subresource` if all subresources are tightly packed in index order.
    pub fn packed_offset(&self, subresource: u32) -> u64 {
        (0..subresource).map(|s| self.subresource_size(s)).sum()
    }

    ///Size of all subresources when tightly packed.
    pub fn packed_size(&self) -> u64 {
        self.packed_offset(self.subresource_count())
    }

    pub fn validate(&self) -> Result<(), DeviceError> {
        if self.width == 0 || self.height == 0 || self.array_layers == 0 || self.mip_levels == 0 {
            return Err(DeviceError::InvalidDescription(format!(
                "texture extent {}x{} with {} layers and {} mips is empty",
                self.width, self.height, self.array_layers, self.mip_levels
            )));
        }
        let max_mips = 32 - self.width.max(self.height).leading_zeros();
        if self.mip_levels as u32 > max_mips {
            return Err(DeviceError::InvalidDescription(format!(
                "{} mip levels requested, {}x{} supports at most {}",
                self.mip_levels, self.width, self.height, max_mips
            )));
        }
        if self.format.is_depth() && self.usage.intersects(TexUsage::RENDER_TARGET | TexUsage::UNORDERED_ACCESS) {
            return Err(DeviceError::InvalidDescription(
                "depth formats can only be used as depth stencil".to_owned(),
            ));
        }
        Ok(())
    }
}

///Layout of one subresource placed in a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubresourceFootprint {
    pub subresource: u32,
    ///Offset of the first row within the buffer.
    pub offset: u64,
    pub format: Format,
    pub width: u32,
    pub height: u32,
    ///Distance between rows in the buffer, aligned to [TEXTURE_DATA_PITCH_ALIGNMENT].
    pub row_pitch: u32,
}

impl SubresourceFootprint {
    ///Bytes of actual texel data per row.
    pub fn row_size(&self) -> u64 {
        self.width as u64 * self.format.bytes_per_pixel() as u64
    }

    ///Bytes the footprint spans in the buffer.
    pub fn span(&self) -> u64 {
        (self.height as u64 - 1) * self.row_pitch as u64 + self.row_size()
    }
}

///Calculates placed footprints for all subresources of `desc`. Returns them with the total buffer size needed.
pub fn copyable_footprints(desc: &TexDesc) -> (Vec<SubresourceFootprint>, u64) {
    let mut offset = 0;
    let footprints = (0..desc.subresource_count())
        .map(|subresource| {
            let (width, height) = desc.subresource_extent(subresource);
            let row_size = width as u64 * desc.format.bytes_per_pixel() as u64;
            let fp = SubresourceFootprint {
                subresource,
                offset: align_up(offset, TEXTURE_DATA_PLACEMENT_ALIGNMENT),
                format: desc.format,
                width,
                height,
                row_pitch: align_up(row_size, TEXTURE_DATA_PITCH_ALIGNMENT) as u32,
            };
            offset = fp.offset + fp.span();
            fp
        })
        .collect();

    (footprints, offset)
}

pub struct Texture<B: Backend> {
    pub desc: TexDesc,
    pub inner: Arc<B::Resource>,
    pub device: Arc<Device<B>>,
}

impl<B: Backend> Hash for Texture<B> {
    fn hash<H: Hasher>(&self, hasher: &mut H) {
        (Arc::as_ptr(&self.inner) as usize).hash(hasher)
    }
}

impl<B: Backend> Texture<B> {
    pub fn new(device: &Arc<Device<B>>, desc: TexDesc) -> Result<Self, DeviceError> {
        desc.validate()?;
        let inner = device.inner.create_texture(&desc, Self::INITIAL_STATE)?;
        #[cfg(feature = "logging")]
        log::trace!(
            "Created texture {:?} {}x{} {:?}",
            desc.name,
            desc.width,
            desc.height,
            desc.format
        );
        Ok(Texture {
            desc,
            inner: Arc::new(inner),
            device: device.clone(),
        })
    }

    ///Textures are always created in the common state.
    pub const INITIAL_STATE: super::GfxResourceState = super::GfxResourceState::COMMON;

    ///Wraps an already existing native texture, for instance a swap chain back buffer.
    pub fn from_raw(device: &Arc<Device<B>>, desc: TexDesc, inner: Arc<B::Resource>) -> Self {
        Texture {
            desc,
            inner,
            device: device.clone(),
        }
    }

    pub fn extent(&self) -> (u32, u32) {
        (self.desc.width, self.desc.height)
    }

    ///Placed footprints for uploading this texture. See [copyable_footprints].
    pub fn copyable_footprints(&self) -> (Vec<SubresourceFootprint>, u64) {
        self.device.inner.copyable_footprints(&self.desc)
    }

    pub fn size(&self) -> u64 {
        self.inner.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn footprints_are_aligned() {
        let desc = TexDesc::texture_2d(10, 4, Format::Rgba8Unorm).with(|d| d.mip_levels = 2);
        let (fps, total) = copyable_footprints(&desc);
        assert_eq!(fps.len(), 2);
        assert_eq!(fps[0].offset, 0);
        assert_eq!(fps[0].row_pitch, 256);
        assert_eq!(fps[0].row_size(), 40);
        assert_eq!(fps[0].span(), 3 * 256 + 40);
        assert_eq!((fps[1].width, fps[1].height), (5, 2));
        assert_eq!(fps[1].offset, 1024);
        assert_eq!(total, 1024 + 256 + 20);
    }

    #[test]
    fn subresource_indexing() {
        let desc = TexDesc::texture_2d(8, 8, Format::R32Float).with(|d| {
            d.mip_levels = 3;
            d.array_layers = 2;
        });
        assert_eq!(desc.subresource_count(), 6);
        assert_eq!(desc.subresource(1, 1), 4);
        assert_eq!(desc.subresource_extent(4), (4, 4));
        assert_eq!(desc.packed_size(), 2 * (64 + 16 + 4) * 4);
    }

    #[test]
    fn invalid_descriptions() {
        assert!(TexDesc::texture_2d(0, 4, Format::Rgba8Unorm).validate().is_err());
        assert!(
            TexDesc::texture_2d(4, 4, Format::Rgba8Unorm)
                .with(|d| d.mip_levels = 4)
                .validate()
                .is_err()
        );
        assert!(TexDesc::render_target(4, 4, Format::D32Float).validate().is_err());
        assert!(TexDesc::render_target(4, 4, Format::Bgra8Unorm).validate().is_ok());
    }

    #[test]
    fn clear_color_encoding() {
        assert_eq!(Format::Rgba8Unorm.encode_color([1.0, 0.0, 0.5, 1.0]), vec![255, 0, 128, 255]);
        assert_eq!(Format::Bgra8Unorm.encode_color([1.0, 0.0, 0.0, 1.0]), vec![0, 0, 255, 255]);
        assert_eq!(Format::Rgba32Float.encode_color([1.0; 4]).len(), 16);
    }
}
