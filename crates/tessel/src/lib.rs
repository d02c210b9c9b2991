//! # Tessel
//!
//! Thin layer above an explicit graphics API. Tessel takes care of object lifetimes, command list state, fences and
//! flip-model frame pacing, while leaving resource-state decisions to the caller (or to `tessel-ctx`).
//!
//! # Usage
//!
//! Everything starts at a [Device](context::Device). The device creates [CommandQueue](context::CommandQueue)s,
//! [SwapChain](swapchain::SwapChain)s, [GraphicsCommandList](resources::GraphicsCommandList)s,
//! [Fence](sync::Fence)s and resources. Every created object is a move-only owner that releases its native object when dropped.
//! Children keep an `Arc` of the device, so the device always outlives them.
//!
//! The native API is consumed through the [backend] traits. They mirror exactly one resource model (explicit
//! resource states, command lists, fences and a flip swap chain). The crate ships the [headless](backend::headless) backend, a
//! software GPU timeline that validates resource states. It is used by tests and by applications that want to run
//! the frame loop without a display.
//!
//! Structures that are not sensitive to lifetime requirements (like descriptions) are not wrapped.

pub use bytemuck;
pub use raw_window_handle;

///Traits the native API is consumed through, as well as the [headless](backend::headless) implementation.
pub mod backend;

///[Device](context::Device) and [CommandQueue](context::CommandQueue).
pub mod context;

///Buffers, textures, pipeline states, command lists and the [GfxResourceState](resources::GfxResourceState) flags.
pub mod resources;

///Flip-model [SwapChain](swapchain::SwapChain) with bounded frame pacing.
pub mod swapchain;

///Fences, fence events and fence guarded values.
pub mod sync;

mod error;
pub use error::{DeviceError, FenceError, StateError, SwapChainError, TesselError};

///Small helpers like alignment calculations.
pub mod util;
