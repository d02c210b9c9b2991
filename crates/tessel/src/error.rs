use thiserror::Error;

use crate::resources::GfxResourceState;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("No adapter found. Is a capable GPU and driver installed?")]
    NoAdapter,
    #[error("Feature {0} not supported")]
    UnsupportedFeature(String),
    #[error("Out of device memory while allocating {0} bytes")]
    OutOfMemory(u64),
    #[error("Invalid description: {0}")]
    InvalidDescription(String),
    #[error("Resource is not host visible")]
    NotMappable,
    #[error("Access of {size} bytes at offset {offset} exceeds resource size {capacity}")]
    OutOfBounds { offset: u64, size: u64, capacity: u64 },
    #[error("Device was removed: {0}")]
    DeviceLost(String),
    #[error("Backend error: {0}")]
    Backend(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FenceError {
    #[error("Timed out waiting for fence value {value}, completed value was {completed}")]
    Timeout { value: u64, completed: u64 },
    #[error("Device was lost while waiting for a fence")]
    DeviceLost,
    #[error("Failed to arm fence event: {0}")]
    Event(String),
}

impl From<DeviceError> for FenceError {
    fn from(value: DeviceError) -> Self {
        match value {
            DeviceError::DeviceLost(_) => FenceError::DeviceLost,
            other => FenceError::Event(other.to_string()),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("Write state can't be combined with other states, was: {0:?}")]
    ExclusiveWrite(GfxResourceState),
    #[error("Unknown resource state bits: {0:#x}")]
    UnknownBits(u32),
}

#[derive(Error, Debug)]
pub enum SwapChainError {
    #[error("Swap chain can't have an extent of 0 on either axis, was: {width}x{height}")]
    InvalidSize { width: u32, height: u32 },
    #[error("Swap chain needs between 2 and 16 buffers, got {0}")]
    InvalidBufferCount(u32),
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
    #[error("Fence error: {0}")]
    Fence(#[from] FenceError),
}

#[derive(Error, Debug)]
pub enum TesselError {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
    #[error("Fence error: {0}")]
    Fence(#[from] FenceError),
    #[error("Resource state error: {0}")]
    State(#[from] StateError),
    #[error("Swap chain error: {0}")]
    SwapChain(#[from] SwapChainError),
    #[error("Other error: {0}")]
    Other(String),
}

#[cfg(test)]
mod test {
    use static_assertions::assert_impl_all;

    use crate::{DeviceError, FenceError, StateError, SwapChainError, TesselError};

    #[test]
    fn assure_send_sync() {
        assert_impl_all!(DeviceError: Send, Sync);
        assert_impl_all!(FenceError: Send, Sync);
        assert_impl_all!(StateError: Send, Sync);
        assert_impl_all!(SwapChainError: Send, Sync);
        assert_impl_all!(TesselError: Send, Sync);
    }

    #[test]
    fn device_lost_maps_to_fence_error() {
        let err: FenceError = DeviceError::DeviceLost("hung".to_owned()).into();
        assert_eq!(err, FenceError::DeviceLost);
        let err: FenceError = DeviceError::Backend("oops".to_owned()).into();
        assert!(matches!(err, FenceError::Event(_)));
    }
}
