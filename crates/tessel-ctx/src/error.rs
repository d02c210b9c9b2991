use tessel::{DeviceError, FenceError, StateError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Upload data has {actual} bytes, but the target expects {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("Upload into {target:?} would write {size} bytes at offset {offset} of {capacity}")]
    OutOfBounds {
        target: Option<String>,
        offset: u64,
        size: u64,
        capacity: u64,
    },
    #[error("Upload target is a {found}, expected a {expected}")]
    WrongTarget {
        expected: &'static str,
        found: &'static str,
    },
    #[error("Staging buffer is not host visible")]
    NotHostVisible,
    #[error("Invalid final state: {0}")]
    InvalidState(#[from] StateError),
    #[error("Device error while staging: {0}")]
    Device(#[from] DeviceError),
}

#[derive(Error, Debug)]
pub enum ConstantError {
    #[error("Constant allocation of {requested} bytes exceeds the {available} bytes left in this frame")]
    OutOfSpace { requested: u64, available: u64 },
    #[error("Constant region size can't be 0")]
    EmptyRegion,
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
}

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Invalid resource state: {0}")]
    State(#[from] StateError),
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
    #[error("Fence error: {0}")]
    Fence(#[from] FenceError),
    #[error("Upload failed: {0}")]
    Upload(#[from] UploadError),
    #[error("Invalid description: {0}")]
    InvalidDescription(String),
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(ContextError: Send, Sync);
    assert_impl_all!(UploadError: Send, Sync);
    assert_impl_all!(ConstantError: Send, Sync);

    #[test]
    fn conversions() {
        let err: ContextError = FenceError::DeviceLost.into();
        assert!(matches!(err, ContextError::Fence(FenceError::DeviceLost)));
        let err: ContextError = UploadError::NotHostVisible.into();
        assert!(err.to_string().contains("host visible"));
    }
}
