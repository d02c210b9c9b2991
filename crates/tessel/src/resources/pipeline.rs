use std::sync::Arc;

use smallvec::SmallVec;

use crate::{
    DeviceError,
    backend::{Backend, RawDevice},
    context::Device,
};

use super::{Format, PrimitiveTopology};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PipelineKind {
    ///Vertex and pixel shader bytecode, compiled elsewhere.
    Graphics { vertex: Vec<u8>, pixel: Vec<u8> },
    Compute { shader: Vec<u8> },
    ///No shaders at all. Only useful for clears and copies, or on backends that don't execute shaders.
    #[default]
    Empty,
}

///Description of a pipeline state object. The shader bytecode is opaque to tessel and passed through to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PipelineStateDesc {
    pub kind: PipelineKind,
    pub render_target_formats: SmallVec<[Format; 8]>,
    pub depth_format: Option<Format>,
    pub topology: PrimitiveTopology,
    pub name: Option<String>,
}

impl PipelineStateDesc {
    pub fn with(mut self, f: impl FnOnce(&mut Self)) -> Self {
        f(&mut self);
        self
    }

    pub fn validate(&self) -> Result<(), DeviceError> {
        if self.render_target_formats.len() > 8 {
            return Err(DeviceError::InvalidDescription(format!(
                "at most 8 render targets can be bound, got {}",
                self.render_target_formats.len()
            )));
        }
        if let Some(depth) = self.depth_format {
            if !depth.is_depth() {
                return Err(DeviceError::InvalidDescription(format!("{depth:?} is not a depth format")));
            }
        }
        if let Some(fmt) = self.render_target_formats.iter().find(|f| f.is_depth()) {
            return Err(DeviceError::InvalidDescription(format!(
                "{fmt:?} can't be used as render target format"
            )));
        }
        if let PipelineKind::Compute { .. } = self.kind {
            if !self.render_target_formats.is_empty() || self.depth_format.is_some() {
                return Err(DeviceError::InvalidDescription(
                    "compute pipelines have no attachments".to_owned(),
                ));
            }
        }
        Ok(())
    }
}

///Compiled pipeline state.
pub struct GraphicsState<B: Backend> {
    pub inner: Arc<B::PipelineState>,
    pub desc: PipelineStateDesc,
    pub device: Arc<Device<B>>,
}

impl<B: Backend> GraphicsState<B> {
    pub fn new(device: &Arc<Device<B>>, desc: PipelineStateDesc) -> Result<Self, DeviceError> {
        desc.validate()?;
        let inner = device.inner.create_pipeline_state(&desc)?;
        Ok(GraphicsState {
            inner: Arc::new(inner),
            desc,
            device: device.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use smallvec::smallvec;

    use super::*;

    #[test]
    fn attachment_validation() {
        let desc = PipelineStateDesc {
            render_target_formats: smallvec![Format::Rgba8Unorm],
            depth_format: Some(Format::D32Float),
            ..Default::default()
        };
        assert!(desc.validate().is_ok());
        assert!(desc.clone().with(|d| d.depth_format = Some(Format::R32Float)).validate().is_err());
        assert!(
            desc.clone()
                .with(|d| d.render_target_formats.push(Format::D32Float))
                .validate()
                .is_err()
        );
        assert!(
            desc.with(|d| d.kind = PipelineKind::Compute { shader: vec![0; 4] })
                .validate()
                .is_err()
        );
    }
}
