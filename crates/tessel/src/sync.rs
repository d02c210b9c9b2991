//! # Synchronisation
//!
//! tessel exposes the native API's timeline primitives almost unchanged:
//!
//! - [Fence]: a 64bit counter on the GPU timeline. The queue sets it to a value once all work submitted before the
//!   signal has finished. The CPU can read the value that was reached last, or block until a value is reached.
//! - [FenceEvent]: the OS primitive the CPU blocks on. An event is armed for a fence value and then waited on.
//! - barriers: recorded into command lists, see [Barrier](crate::backend::Barrier).
//!
//! ## Timeouts
//!
//! All CPU side waits take an optional timeout. An expired timeout surfaces as [FenceError::Timeout], a removed device
//! (reported as a completed value of `u64::MAX`) as [FenceError::DeviceLost]. Neither is retried.
//!
//! ## Important note on `GuardFence`s
//! Since [GuardFence]s protect values the GPU still uses, they block till the fence reached the target value when dropped.
//! If that wait fails (timeout or device loss while the value was pending) the value is leaked instead of freed.

use std::{
    fmt::Debug,
    mem::ManuallyDrop,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use crate::{
    DeviceError, FenceError,
    backend::{Backend, RawDevice, RawEvent, RawFence, RawQueue, WaitStatus},
    context::{CommandQueue, Device},
};

///Timeout used when no explicit timeout is configured.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

///Completed value the native API reports for fences of a removed device.
pub const DEVICE_LOST_VALUE: u64 = u64::MAX;

///GPU timeline counter.
pub struct Fence<B: Backend> {
    pub inner: B::Fence,
    pub device: Arc<Device<B>>,
    ///Highest value that was ever signaled.
    last_signaled: AtomicU64,
    ///Highest completed value observed by the CPU.
    observed: AtomicU64,
}

impl<B: Backend> Fence<B> {
    pub fn new(device: &Arc<Device<B>>, initial_value: u64) -> Result<Arc<Self>, DeviceError> {
        let inner = device.inner.create_fence(initial_value)?;
        Ok(Arc::new(Fence {
            inner,
            device: device.clone(),
            last_signaled: AtomicU64::new(initial_value),
            observed: AtomicU64::new(initial_value),
        }))
    }

    ///Enqueues a GPU side signal that sets the fence to `value` once all work submitted to `queue` so far has finished.
    ///
    /// # Panics
    ///
    /// if `value` is not greater than any value signaled before.
    pub fn signal(&self, queue: &CommandQueue<B>, value: u64) -> Result<(), DeviceError> {
        let before = self.last_signaled.fetch_max(value, Ordering::AcqRel);
        assert!(
            value > before,
            "fence values must increase, signaled {value} after {before}"
        );
        queue.inner.signal(&self.inner, value)
    }

    ///Highest value signaled so far.
    pub fn last_signaled_value(&self) -> u64 {
        self.last_signaled.load(Ordering::Acquire)
    }

    ///Highest value the GPU confirmed. Never decreases between calls. Returns [DEVICE_LOST_VALUE] once the device was removed.
    pub fn completed_value(&self) -> u64 {
        let raw = self.inner.completed_value();
        if raw == DEVICE_LOST_VALUE {
            return DEVICE_LOST_VALUE;
        }
        let before = self.observed.fetch_max(raw, Ordering::AcqRel);
        let completed = before.max(raw);
        debug_assert!(
            completed <= self.last_signaled_value(),
            "fence completed {completed} which was never signaled"
        );
        completed
    }

    pub fn is_device_lost(&self) -> bool {
        self.inner.completed_value() == DEVICE_LOST_VALUE
    }

    ///Returns true if `value` was reached.
    pub fn is_reached(&self, value: u64) -> bool {
        self.completed_value() >= value
    }

    ///Arms `event` to be signaled once the fence reaches `value`.
    pub fn set_event_on_completion(&self, value: u64, event: &FenceEvent<B>) -> Result<(), DeviceError> {
        self.inner.set_event_on_completion(value, &event.inner)
    }

    ///Blocks until the fence reached `value` or `timeout` passed. Returns true if the calling thread actually had to block.
    pub fn wait(&self, event: &FenceEvent<B>, value: u64, timeout: Option<Duration>) -> Result<bool, FenceError> {
        let completed = self.completed_value();
        if completed == DEVICE_LOST_VALUE {
            return Err(FenceError::DeviceLost);
        }
        if completed >= value {
            return Ok(false);
        }

        #[cfg(feature = "profiling")]
        puffin::profile_scope!("fence wait");

        self.set_event_on_completion(value, event)?;
        match event.inner.wait(timeout) {
            WaitStatus::Signaled => {
                if self.is_device_lost() {
                    Err(FenceError::DeviceLost)
                } else {
                    Ok(true)
                }
            }
            WaitStatus::TimedOut => {
                let completed = self.completed_value();
                if completed == DEVICE_LOST_VALUE {
                    Err(FenceError::DeviceLost)
                } else {
                    Err(FenceError::Timeout { value, completed })
                }
            }
        }
    }

    ///Like [wait](Fence::wait), but creates a temporary event.
    pub fn wait_blocking(&self, value: u64, timeout: Option<Duration>) -> Result<bool, FenceError> {
        match self.completed_value() {
            DEVICE_LOST_VALUE => return Err(FenceError::DeviceLost),
            completed if completed >= value => return Ok(false),
            _ => {}
        }
        let event = FenceEvent::new(&self.device)?;
        self.wait(&event, value, timeout)
    }
}

impl<B: Backend> Debug for Fence<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("last_signaled", &self.last_signaled_value())
            .field("observed", &self.observed.load(Ordering::Acquire))
            .finish()
    }
}

///OS event a thread can block on until a fence reaches a value.
///
/// The event is initialized on creation and terminated when dropped or [terminate](FenceEvent::terminate)d. It can't be
/// used afterwards.
pub struct FenceEvent<B: Backend> {
    pub inner: B::Event,
    pub device: Arc<Device<B>>,
}

impl<B: Backend> FenceEvent<B> {
    pub fn new(device: &Arc<Device<B>>) -> Result<Self, DeviceError> {
        let inner = device.inner.create_event()?;
        Ok(FenceEvent {
            inner,
            device: device.clone(),
        })
    }

    ///Closes the event.
    pub fn terminate(self) {}
}

///A fence that guards a value `T` until a certain target value is reached.
pub struct GuardFence<B: Backend, T> {
    fence: Arc<Fence<B>>,
    target: u64,
    timeout: Option<Duration>,
    ///Only dropped once the target was reached.
    value: ManuallyDrop<T>,
}

impl<B: Backend, T> GuardFence<B, T> {
    ///Creates a guard that won't drop `T` until `target` is reached as the fence's value.
    ///
    /// # Safety
    ///
    /// Note that dropping the guard blocks (up to [DEFAULT_WAIT_TIMEOUT]) if `target` is not reached yet. If the wait
    /// fails, `T` is leaked.
    pub fn guard(fence: Arc<Fence<B>>, target: u64, guarded: T) -> GuardFence<B, T> {
        GuardFence {
            fence,
            target,
            timeout: Some(DEFAULT_WAIT_TIMEOUT),
            value: ManuallyDrop::new(guarded),
        }
    }

    ///Changes the time a drop may block.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn target(&self) -> u64 {
        self.target
    }

    pub fn is_expired(&self) -> bool {
        self.fence.is_reached(self.target)
    }

    ///Blocks until the target value was reached, or the guard's timeout passed.
    pub fn wait(&self) -> Result<(), FenceError> {
        self.fence.wait_blocking(self.target, self.timeout)?;
        Ok(())
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    ///Tries to drop self, returns `Self` as an error if the target value wasn't reached yet.
    pub fn try_drop(self) -> Result<(), Self> {
        if self.is_expired() { Ok(()) } else { Err(self) }
    }
}

impl<B: Backend, T> Drop for GuardFence<B, T> {
    fn drop(&mut self) {
        if !self.is_expired() {
            #[cfg(feature = "logging")]
            log::warn!(
                "Dropping guard with unfulfilled target {}, blocking in drop implementation!",
                self.target
            );

            if let Err(_e) = self.wait() {
                #[cfg(feature = "logging")]
                log::error!(
                    "Failed to wait for GuardFence target {}: {}. Leaking the guarded value",
                    self.target,
                    _e
                );
                return;
            }
        }
        //Safety: the GPU is done with the value and it is never accessed again.
        unsafe { ManuallyDrop::drop(&mut self.value) }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use static_assertions::assert_impl_all;

    use crate::{
        FenceError,
        backend::headless::{GpuProgress, Headless, HeadlessConfig},
        context::Device,
        sync::{DEVICE_LOST_VALUE, GuardFence},
    };

    fn manual() -> HeadlessConfig {
        HeadlessConfig::default().with(|c| c.progress = GpuProgress::Manual)
    }

    #[test]
    fn assure_send_sync() {
        assert_impl_all!(GuardFence<Headless, Vec<u8>>: Send, Sync);
    }

    #[test]
    fn completed_value_is_monotonic() {
        let device = Device::headless(manual()).unwrap();
        let queue = device.create_command_queue().unwrap();
        let fence = device.create_fence(3).unwrap();
        assert_eq!(fence.completed_value(), 3);
        queue.signal(&fence, 4).unwrap();
        queue.signal(&fence, 7).unwrap();
        assert_eq!(fence.last_signaled_value(), 7);
        assert_eq!(fence.completed_value(), 3);
        device.inner.retire(1);
        assert_eq!(fence.completed_value(), 4);
        device.inner.retire_all();
        assert_eq!(fence.completed_value(), 7);
        assert_eq!(fence.completed_value(), 7);
    }

    #[test]
    #[should_panic(expected = "fence values must increase")]
    fn signal_must_increase() {
        let device = Device::headless(HeadlessConfig::default()).unwrap();
        let queue = device.create_command_queue().unwrap();
        let fence = device.create_fence(0).unwrap();
        queue.signal(&fence, 2).unwrap();
        queue.signal(&fence, 2).unwrap();
    }

    #[test]
    fn wait_blocks_only_if_pending() {
        let device = Device::headless(manual()).unwrap();
        let queue = device.create_command_queue().unwrap();
        let fence = device.create_fence(0).unwrap();
        let event = device.create_fence_event().unwrap();

        assert_eq!(fence.wait(&event, 0, None), Ok(false));
        queue.signal(&fence, 1).unwrap();
        assert_eq!(fence.wait(&event, 1, Some(Duration::from_millis(10))), Ok(true));
        assert_eq!(device.inner.stats().stalls, 1);
        assert_eq!(fence.wait(&event, 1, None), Ok(false));
        event.terminate();
    }

    #[test]
    fn wait_times_out_on_hung_gpu() {
        let device = Device::headless(manual()).unwrap();
        let queue = device.create_command_queue().unwrap();
        let fence = device.create_fence(0).unwrap();
        queue.signal(&fence, 1).unwrap();
        device.inner.set_hung(true);
        assert_eq!(
            fence.wait_blocking(1, Some(Duration::from_millis(1))),
            Err(FenceError::Timeout { value: 1, completed: 0 })
        );
    }

    #[test]
    fn device_lost() {
        let device = Device::headless(manual()).unwrap();
        let queue = device.create_command_queue().unwrap();
        let fence = device.create_fence(0).unwrap();
        queue.signal(&fence, 1).unwrap();
        device.inner.remove();
        assert_eq!(fence.completed_value(), DEVICE_LOST_VALUE);
        assert!(fence.is_device_lost());
        assert_eq!(fence.wait_blocking(1, None), Err(FenceError::DeviceLost));
    }

    #[test]
    fn guard_keeps_value_until_target() {
        let device = Device::headless(manual()).unwrap();
        let queue = device.create_command_queue().unwrap();
        let fence = device.create_fence(0).unwrap();
        queue.signal(&fence, 1).unwrap();

        let payload = Arc::new(());
        let guard = GuardFence::guard(fence.clone(), 1, payload.clone());
        assert_eq!(guard.target(), 1);
        let guard = guard.try_drop().err().expect("target not yet reached");
        assert_eq!(Arc::strong_count(&payload), 2);

        device.inner.retire_all();
        assert!(guard.try_drop().is_ok());
        assert_eq!(Arc::strong_count(&payload), 1);
    }

    #[test]
    fn guard_drop_blocks_until_reached() {
        let device = Device::headless(manual()).unwrap();
        let queue = device.create_command_queue().unwrap();
        let fence = device.create_fence(0).unwrap();
        queue.signal(&fence, 1).unwrap();

        drop(GuardFence::guard(fence.clone(), 1, ()).with_timeout(Some(Duration::from_secs(1))));
        //the blocking wait let the simulated GPU catch up
        assert_eq!(fence.completed_value(), 1);
        assert_eq!(device.inner.stats().stalls, 1);
    }

    #[test]
    fn guard_leaks_value_if_wait_fails() {
        let device = Device::headless(manual()).unwrap();
        let queue = device.create_command_queue().unwrap();
        let fence = device.create_fence(0).unwrap();
        queue.signal(&fence, 1).unwrap();
        device.inner.set_hung(true);

        let payload = Arc::new(());
        let guard = GuardFence::guard(fence.clone(), 1, payload.clone()).with_timeout(Some(Duration::from_millis(5)));
        assert_eq!(guard.wait(), Err(FenceError::Timeout { value: 1, completed: 0 }));
        drop(guard);
        //still referenced by the leaked guard value
        assert_eq!(Arc::strong_count(&payload), 2);
    }
}
