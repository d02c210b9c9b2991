//! # Tessel context layer
//!
//! Resource state tracking on top of [tessel]. Instead of recording native barriers by hand, resources are
//! registered in a [ResourceStatePool] and recorded through [GraphicsContext]s that remember which state each resource
//! is expected to be in. The [ContextManager] reconciles those expectations before submission, so contexts can be
//! recorded in parallel without knowing about each other.
//!
//! A frame usually looks like this:
//!
//! 1. [ContextManager::reset_contexts] waits until the ring slot of this frame is free again,
//! 2. the contexts are recorded (possibly on several threads, sharing `&ResourceStatePool`),
//! 3. [ContextManager::flush_uploads] records pending staging copies into one of the contexts,
//! 4. [ContextManager::close_contexts] and [ContextManager::execute] reconcile states and submit.
//!
//! Staging memory handed to the [UploadPool] and resources released through
//! [ContextManager::release_resource] stay alive until the GPU is done with them.

///Batched barrier recording.
pub mod barrier;
///Per-frame constant buffer allocator.
pub mod constants;
///State tracking graphics context.
pub mod graphics;
///Reconciliation and submission of several contexts.
pub mod manager;
///Authoritative resource state table.
pub mod pool;
///Staging uploads.
pub mod upload;

mod error;
pub use error::{ConstantError, ContextError, UploadError};

pub use barrier::BarrierBatch;
pub use constants::ConstantAllocator;
pub use graphics::{GraphicsContext, TrackedState};
pub use manager::{ContextManager, ContextManagerDesc, Submission};
pub use pool::{GpuResource, ResourceStatePool, StateHandle, SwapChainStates};
pub use upload::{StagingRing, UploadPool};

pub use tessel;
