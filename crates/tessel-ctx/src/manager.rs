use std::{sync::Arc, time::Duration};

use smallvec::SmallVec;
use tessel::{
    FenceError,
    backend::Backend,
    context::{CommandQueue, Device},
    resources::GraphicsCommandList,
    sync::{DEFAULT_WAIT_TIMEOUT, Fence, FenceEvent},
};

use crate::{
    BarrierBatch, ContextError, GraphicsContext, ResourceStatePool, StagingRing, StateHandle, UploadPool,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextManagerDesc {
    ///Number of graphics contexts. Contexts are submitted in index order.
    pub context_count: usize,
    ///Number of frames the CPU may record while the GPU still executes older ones.
    pub frames_in_flight: usize,
    ///Timeout of every CPU wait. `None` waits forever.
    pub wait_timeout: Option<Duration>,
    pub name: Option<String>,
}

impl Default for ContextManagerDesc {
    fn default() -> Self {
        ContextManagerDesc {
            context_count: 1,
            frames_in_flight: 2,
            wait_timeout: Some(DEFAULT_WAIT_TIMEOUT),
            name: None,
        }
    }
}

impl ContextManagerDesc {
    pub fn with(mut self, f: impl FnOnce(&mut Self)) -> Self {
        f(&mut self);
        self
    }
}

///Summary of one [execute](ContextManager::execute) call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Submission {
    ///Frame fence value signaled after the submitted lists.
    pub fence_value: u64,
    ///Barriers recorded by all coordinators.
    pub coordinator_barriers: usize,
    ///Command lists handed to the queue.
    pub command_lists: usize,
}

///Owns a set of [GraphicsContext]s and submits them.
///
/// Each context records against the states it assumed when it first touched a resource. Before submission the
/// manager compares those assumptions with the [ResourceStatePool], context by context in index order. Where they
/// differ a *coordinator* list that runs right before the context transitions the resource into the assumed state.
/// Afterwards the pool holds the state each context left the resource in.
///
/// Command lists, coordinators and staging memory are kept per frame in flight. A ring slot is only reused after the
/// frame fence reached the value signaled when the slot was submitted last.
pub struct ContextManager<B: Backend> {
    pub device: Arc<Device<B>>,
    contexts: Vec<GraphicsContext<B>>,
    ///Indexed by `slot * context_count + context`.
    coordinators: Vec<GraphicsCommandList<B>>,
    coordinator_barriers: BarrierBatch<B>,
    fence: Arc<Fence<B>>,
    event: FenceEvent<B>,
    ///Last fence value signaled for each ring slot.
    slot_values: SmallVec<[u64; 3]>,
    ring_index: usize,
    fence_value: u64,
    ///True between `reset_contexts` and `execute`.
    recording: bool,
    uploads: Arc<UploadPool<B>>,
    staging: StagingRing<B>,
    timeout: Option<Duration>,
    name: Option<String>,
}

impl<B: Backend> ContextManager<B> {
    pub fn initialize(device: &Arc<Device<B>>, desc: ContextManagerDesc) -> Result<Self, ContextError> {
        if desc.context_count == 0 {
            return Err(ContextError::InvalidDescription(
                "context manager needs at least one context".to_owned(),
            ));
        }
        if desc.frames_in_flight == 0 {
            return Err(ContextError::InvalidDescription(
                "at least one frame has to be in flight".to_owned(),
            ));
        }

        let fence = device.create_fence(0)?;
        let mut contexts = (0..desc.context_count)
            .map(|id| GraphicsContext::new(device, id, desc.frames_in_flight))
            .collect::<Result<Vec<_>, _>>()?;
        for context in &mut contexts {
            context.attach_fence(fence.clone(), desc.wait_timeout);
        }
        let coordinators = (0..desc.context_count * desc.frames_in_flight)
            .map(|_| device.create_graphics_command_list())
            .collect::<Result<Vec<_>, _>>()?;
        let event = device.create_fence_event()?;
        let staging = StagingRing::new(fence.clone(), desc.frames_in_flight, desc.wait_timeout);

        #[cfg(feature = "logging")]
        log::info!(
            "Context manager {:?}: {} contexts, {} frames in flight",
            desc.name,
            desc.context_count,
            desc.frames_in_flight
        );

        Ok(ContextManager {
            device: device.clone(),
            contexts,
            coordinators,
            coordinator_barriers: BarrierBatch::new(),
            fence,
            event,
            slot_values: smallvec::smallvec![0; desc.frames_in_flight],
            ring_index: 0,
            fence_value: 0,
            recording: false,
            uploads: Arc::new(UploadPool::new()),
            staging,
            timeout: desc.wait_timeout,
            name: desc.name,
        })
    }

    ///Waits until the GPU is done with the current ring slot, recycles its staging memory and resets all contexts
    /// into it.
    pub fn reset_contexts(&mut self) -> Result<(), ContextError> {
        #[cfg(feature = "profiling")]
        puffin::profile_function!();

        let wait_for = self.slot_values[self.ring_index];
        let blocked = self.fence.wait(&self.event, wait_for, self.timeout)?;
        if blocked {
            #[cfg(feature = "logging")]
            log::warn!(
                "{:?} stalled on ring slot {} (fence value {})",
                self.name,
                self.ring_index,
                wait_for
            );
        }
        self.staging.recycle(self.ring_index)?;

        for context in &mut self.contexts {
            context.reset_slot(self.ring_index)?;
        }
        self.recording = true;
        Ok(())
    }

    ///Closes every context that is still recording.
    pub fn close_contexts(&mut self) -> Result<(), ContextError> {
        for context in &mut self.contexts {
            if !context.is_closed() {
                context.close()?;
            }
        }
        Ok(())
    }

    ///Reconciles the contexts' assumed states with `pool`, commits their pending states and submits
    /// `[coordinator 0, context 0, coordinator 1, context 1, ...]` to `queue`. Coordinators without barriers are left
    /// out. Afterwards the frame fence is signaled and the ring advances.
    ///
    /// # Panics
    ///
    /// if [reset_contexts](Self::reset_contexts) was not called since the last `execute`, if any context is still
    /// recording, or if a context touched a handle that is no longer registered in `pool`.
    pub fn execute(
        &mut self,
        pool: &mut ResourceStatePool<B>,
        queue: &CommandQueue<B>,
    ) -> Result<Submission, ContextError> {
        #[cfg(feature = "profiling")]
        puffin::profile_function!();

        assert!(self.recording, "execute() requires reset_contexts() first");
        assert!(
            self.contexts.iter().all(|c| c.is_closed()),
            "execute() requires all graphics contexts to be closed"
        );

        let count = self.contexts.len();
        let base = self.ring_index * count;
        let mut barrier_counts: SmallVec<[usize; 8]> = SmallVec::with_capacity(count);
        for (i, context) in self.contexts.iter().enumerate() {
            for handle in context.touched() {
                Self::reconcile(&mut self.coordinator_barriers, pool, context, *handle);
            }
            let coordinator = &mut self.coordinators[base + i];
            let recorded = if self.coordinator_barriers.is_empty() {
                0
            } else {
                coordinator.reset()?;
                let recorded = self.coordinator_barriers.flush(coordinator);
                coordinator.close()?;
                recorded
            };
            barrier_counts.push(recorded);
        }

        let mut lists: SmallVec<[&GraphicsCommandList<B>; 8]> = SmallVec::with_capacity(count * 2);
        for (i, context) in self.contexts.iter().enumerate() {
            if barrier_counts[i] > 0 {
                lists.push(&self.coordinators[base + i]);
            }
            lists.push(context.command_list());
        }
        queue.execute(&lists);
        let command_lists = lists.len();
        drop(lists);

        self.fence_value += 1;
        self.fence.signal(queue, self.fence_value)?;
        self.slot_values[self.ring_index] = self.fence_value;
        for context in &mut self.contexts {
            context.mark_submitted(self.fence_value);
        }
        self.ring_index = (self.ring_index + 1) % self.slot_values.len();
        self.recording = false;

        let submission = Submission {
            fence_value: self.fence_value,
            coordinator_barriers: barrier_counts.iter().sum(),
            command_lists,
        };
        #[cfg(feature = "logging")]
        log::trace!("{:?} submitted {:?}", self.name, submission);
        Ok(submission)
    }

    fn reconcile(
        barriers: &mut BarrierBatch<B>,
        pool: &mut ResourceStatePool<B>,
        context: &GraphicsContext<B>,
        handle: StateHandle,
    ) {
        let Some(tracked) = context.tracked(handle) else {
            return;
        };
        let Some(next) = tracked.pending else {
            return;
        };
        let prev = match pool.try_resource_states(handle) {
            Some(state) => state,
            None => panic!(
                "graphics context {} used handle {:?} which is not registered in the pool",
                context.id(),
                handle
            ),
        };
        let wanted = tracked.assumed;
        if prev != wanted {
            #[cfg(feature = "logging")]
            log::trace!(
                "coordinator {}: {:?} {:?} -> {:?}",
                context.id(),
                pool.gpu_resource(handle).name(),
                prev,
                wanted
            );
            barriers.transition(pool.gpu_resource(handle).raw().clone(), prev, wanted);
        }
        pool.set_resource_states(handle, next);
    }

    pub fn graphics_context(&mut self, id: usize) -> &mut GraphicsContext<B> {
        &mut self.contexts[id]
    }

    ///All contexts, for instance to record them on separate threads.
    pub fn contexts_mut(&mut self) -> &mut [GraphicsContext<B>] {
        &mut self.contexts
    }

    pub fn contexts(&self) -> &[GraphicsContext<B>] {
        &self.contexts
    }

    ///Records all queued uploads into context `id`. Their staging memory is retained until this frame finished on
    /// the GPU.
    pub fn flush_uploads(&mut self, id: usize, pool: &ResourceStatePool<B>) -> Result<usize, ContextError> {
        let value = self.fence_value + 1;
        self.uploads
            .flush(&mut self.contexts[id], pool, &mut self.staging, self.ring_index, value)
    }

    ///Upload queue. Can be cloned and handed to other threads.
    pub fn upload_pool(&self) -> &Arc<UploadPool<B>> {
        &self.uploads
    }

    pub fn staging(&self) -> &StagingRing<B> {
        &self.staging
    }

    ///Fence value the GPU has to reach before work recorded right now is done.
    fn release_value(&self) -> u64 {
        if self.recording { self.fence_value + 1 } else { self.fence_value }
    }

    ///Unregisters `handle`. The resource is dropped by [collect_garbage](Self::collect_garbage) once all work that
    /// might use it was executed.
    pub fn release_resource(&self, pool: &mut ResourceStatePool<B>, handle: StateHandle) {
        pool.release(handle, self.fence.clone(), self.release_value());
    }

    pub fn collect_garbage(&self, pool: &mut ResourceStatePool<B>) -> usize {
        pool.collect_garbage()
    }

    ///Blocks until the GPU executed everything submitted so far.
    pub fn wait_idle(&self) -> Result<(), FenceError> {
        self.fence.wait(&self.event, self.fence_value, self.timeout)?;
        Ok(())
    }

    pub fn frame_fence(&self) -> &Arc<Fence<B>> {
        &self.fence
    }

    ///Fence value signaled by the last [execute](Self::execute).
    pub fn last_submitted_value(&self) -> u64 {
        self.fence_value
    }

    pub fn ring_index(&self) -> usize {
        self.ring_index
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slot_values.len()
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }
}

impl<B: Backend> Drop for ContextManager<B> {
    fn drop(&mut self) {
        if let Err(_e) = self.wait_idle() {
            #[cfg(feature = "logging")]
            log::error!("Failed to wait for context manager idle on drop: {}", _e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rand::{Rng, SeedableRng, rngs::StdRng};
    use slotmap::SecondaryMap;
    use static_assertions::assert_impl_all;
    use tessel::{
        backend::{
            BarrierFlags,
            headless::{GpuProgress, Headless, HeadlessConfig, TraceCommand, TraceEntry},
        },
        context::{CommandQueue, Device},
        resources::{BufDesc, Format, GfxResourceState as S, TexDesc},
    };

    use super::{ContextManager, ContextManagerDesc};
    use crate::{ResourceStatePool, StateHandle, UploadPool};

    assert_impl_all!(ContextManager<Headless>: Send);

    struct Setup {
        device: Arc<Device<Headless>>,
        queue: Arc<CommandQueue<Headless>>,
        pool: ResourceStatePool<Headless>,
        manager: ContextManager<Headless>,
    }

    fn setup(config: HeadlessConfig, contexts: usize) -> Setup {
        let device = Device::headless(config).unwrap();
        let queue = device.create_command_queue().unwrap();
        let pool = ResourceStatePool::new(&device);
        let manager = ContextManager::initialize(
            &device,
            ContextManagerDesc::default().with(|d| {
                d.context_count = contexts;
                d.name = Some("test".to_owned());
            }),
        )
        .unwrap();
        Setup {
            device,
            queue,
            pool,
            manager,
        }
    }

    fn render_target(pool: &mut ResourceStatePool<Headless>) -> StateHandle {
        pool.create_texture(TexDesc::render_target(8, 8, Format::Rgba8Unorm))
            .unwrap()
    }

    #[test]
    fn two_context_scenario() {
        let Setup {
            device,
            queue,
            mut pool,
            mut manager,
        } = setup(HeadlessConfig::default().with(|c| c.trace = true), 2);
        let rt = render_target(&mut pool);

        manager.reset_contexts().unwrap();
        manager.graphics_context(0).transition(&pool, rt, S::RENDER_TARGET).unwrap();
        manager.graphics_context(0).clear_render_target(&pool, rt, [0.0, 0.0, 1.0, 1.0]);
        manager
            .graphics_context(1)
            .transition(&pool, rt, S::PIXEL_SHADER_RESOURCE)
            .unwrap();
        manager.close_contexts().unwrap();
        let submission = manager.execute(&mut pool, &queue).unwrap();

        assert_eq!(submission.coordinator_barriers, 1);
        //coordinator 0 had nothing to do
        assert_eq!(submission.command_lists, 3);
        assert_eq!(submission.fence_value, 1);
        assert_eq!(pool.resource_states(rt), S::PIXEL_SHADER_RESOURCE);

        let id = pool.texture(rt).inner.id();
        let transition = |list: u64, before, after| TraceEntry {
            list,
            command: TraceCommand::Transition {
                resource: id,
                before,
                after,
                flags: BarrierFlags::None,
            },
        };
        let transitions: Vec<_> = device
            .inner
            .take_trace()
            .into_iter()
            .filter(|e| matches!(e.command, TraceCommand::Transition { .. }))
            .collect();
        assert_eq!(
            transitions,
            vec![
                transition(manager.contexts()[0].command_list().inner.id(), S::COMMON, S::RENDER_TARGET),
                transition(manager.coordinators[1].inner.id(), S::RENDER_TARGET, S::COMMON),
                transition(
                    manager.contexts()[1].command_list().inner.id(),
                    S::COMMON,
                    S::PIXEL_SHADER_RESOURCE
                ),
            ]
        );
        assert!(device.inner.validation_errors().is_empty());
    }

    #[test]
    fn matching_assumption_needs_no_coordinator() {
        let Setup {
            device,
            queue,
            mut pool,
            mut manager,
        } = setup(HeadlessConfig::default(), 2);
        let a = render_target(&mut pool);
        let b = render_target(&mut pool);

        manager.reset_contexts().unwrap();
        manager.graphics_context(0).transition(&pool, a, S::RENDER_TARGET).unwrap();
        manager.graphics_context(1).transition(&pool, b, S::COPY_DEST).unwrap();
        manager.close_contexts().unwrap();
        let submission = manager.execute(&mut pool, &queue).unwrap();
        assert_eq!(submission.coordinator_barriers, 0);
        assert_eq!(submission.command_lists, 2);

        //next frame starts where the last one ended
        manager.reset_contexts().unwrap();
        manager.graphics_context(1).transition(&pool, a, S::COMMON).unwrap();
        manager.close_contexts().unwrap();
        let submission = manager.execute(&mut pool, &queue).unwrap();
        assert_eq!(submission.coordinator_barriers, 0);
        assert_eq!(pool.resource_states(a), S::COMMON);
        assert_eq!(pool.resource_states(b), S::COPY_DEST);
        assert!(device.inner.validation_errors().is_empty());
    }

    #[test]
    fn one_coordinator_barrier_per_mismatch() {
        let Setup {
            device,
            queue,
            mut pool,
            mut manager,
        } = setup(HeadlessConfig::default(), 3);
        let rt = render_target(&mut pool);
        let buf = pool.create_buffer(BufDesc::gpu_only(64)).unwrap();

        manager.reset_contexts().unwrap();
        for context in manager.contexts_mut() {
            context.transition(&pool, rt, S::RENDER_TARGET).unwrap();
            context.transition(&pool, rt, S::PIXEL_SHADER_RESOURCE).unwrap();
            context.transition(&pool, buf, S::UNORDERED_ACCESS).unwrap();
        }
        manager.close_contexts().unwrap();
        let submission = manager.execute(&mut pool, &queue).unwrap();

        //contexts 1 and 2 each need rt back in COMMON and buf back in COMMON
        assert_eq!(submission.coordinator_barriers, 4);
        assert_eq!(manager.coordinators[1].barrier_count(), 2);
        assert_eq!(manager.coordinators[2].barrier_count(), 2);
        assert_eq!(submission.command_lists, 5);
        assert!(device.inner.validation_errors().is_empty());
    }

    #[test]
    fn randomized_interleavings_commit_last_pending_state() {
        let Setup {
            device,
            queue,
            mut pool,
            mut manager,
        } = setup(HeadlessConfig::default(), 4);
        let handles: Vec<_> = (0..6).map(|_| render_target(&mut pool)).collect();
        let states = [
            S::COMMON,
            S::RENDER_TARGET,
            S::PIXEL_SHADER_RESOURCE,
            S::PIXEL_SHADER_RESOURCE | S::NON_PIXEL_SHADER_RESOURCE,
            S::COPY_DEST,
            S::COPY_SOURCE,
            S::UNORDERED_ACCESS,
        ];
        let mut rng = StdRng::seed_from_u64(0x7e55e1);

        for _frame in 0..16 {
            manager.reset_contexts().unwrap();
            let mut expected = SecondaryMap::new();
            for context in manager.contexts_mut() {
                for _ in 0..rng.gen_range(0..8) {
                    let handle = handles[rng.gen_range(0..handles.len())];
                    let state = states[rng.gen_range(0..states.len())];
                    context.transition(&pool, handle, state).unwrap();
                    expected.insert(handle, state);
                }
            }
            let untouched: Vec<_> = handles
                .iter()
                .filter(|h| !expected.contains_key(**h))
                .map(|h| (*h, pool.resource_states(*h)))
                .collect();

            manager.close_contexts().unwrap();
            manager.execute(&mut pool, &queue).unwrap();

            for (handle, state) in expected.iter() {
                assert_eq!(pool.resource_states(handle), *state);
            }
            for (handle, state) in untouched {
                assert_eq!(pool.resource_states(handle), state);
            }
        }

        manager.wait_idle().unwrap();
        assert_eq!(device.inner.validation_errors(), vec![]);
        for handle in &handles {
            assert_eq!(
                device.inner.resource_state(pool.gpu_resource(*handle).raw()),
                pool.resource_states(*handle)
            );
        }
    }

    #[test]
    fn staging_outlives_pending_fence() {
        let Setup {
            device,
            queue,
            mut pool,
            mut manager,
        } = setup(HeadlessConfig::default().with(|c| c.progress = GpuProgress::Manual), 1);
        let vb = pool.create_buffer(BufDesc::gpu_only(16)).unwrap();

        manager.reset_contexts().unwrap();
        let staging = UploadPool::stage_buffer(&device, &[3; 16]).unwrap();
        let weak = Arc::downgrade(&staging.inner);
        manager
            .upload_pool()
            .add_buffer(vb, staging, 0, Some(S::VERTEX_AND_CONSTANT_BUFFER))
            .unwrap();
        assert_eq!(manager.flush_uploads(0, &pool).unwrap(), 1);
        manager.close_contexts().unwrap();
        manager.execute(&mut pool, &queue).unwrap();
        assert_eq!(manager.staging().retained(0), 1);

        //second slot, the first frame may still run
        manager.reset_contexts().unwrap();
        manager.close_contexts().unwrap();
        manager.execute(&mut pool, &queue).unwrap();
        assert!(weak.upgrade().is_some());
        assert_eq!(manager.frame_fence().completed_value(), 0);

        //back at slot 0, which has to wait for frame 1
        manager.reset_contexts().unwrap();
        assert!(weak.upgrade().is_none());
        assert!(manager.frame_fence().completed_value() >= 1);
        assert_eq!(manager.staging().total_retained(), 0);
        assert_eq!(device.inner.stats().stalls, 1);
        assert!(device.inner.validation_errors().is_empty());
        assert_eq!(pool.resource_states(vb), S::VERTEX_AND_CONSTANT_BUFFER);
    }

    #[test]
    fn reset_twice_leaves_nothing_pending() {
        let Setup {
            queue,
            mut pool,
            mut manager,
            ..
        } = setup(HeadlessConfig::default(), 2);
        let rt = render_target(&mut pool);

        manager.reset_contexts().unwrap();
        manager.graphics_context(0).transition(&pool, rt, S::RENDER_TARGET).unwrap();
        manager.graphics_context(0).reset().unwrap();
        manager.graphics_context(0).reset().unwrap();
        assert_eq!(manager.graphics_context(0).touched_count(), 0);

        manager.close_contexts().unwrap();
        let submission = manager.execute(&mut pool, &queue).unwrap();
        assert_eq!(submission.coordinator_barriers, 0);
        assert_eq!(pool.resource_states(rt), S::COMMON);
    }

    #[test]
    fn parallel_recording() {
        let Setup {
            device,
            queue,
            mut pool,
            mut manager,
        } = setup(HeadlessConfig::default(), 4);
        let targets: Vec<_> = (0..4).map(|_| render_target(&mut pool)).collect();

        manager.reset_contexts().unwrap();
        let shared = &pool;
        std::thread::scope(|s| {
            for (context, target) in manager.contexts_mut().iter_mut().zip(&targets) {
                s.spawn(move || {
                    context.transition(shared, *target, S::RENDER_TARGET).unwrap();
                    context.clear_render_target(shared, *target, [1.0; 4]);
                    context
                        .transition(shared, *target, S::PIXEL_SHADER_RESOURCE)
                        .unwrap();
                    context.close().unwrap();
                });
            }
        });
        let submission = manager.execute(&mut pool, &queue).unwrap();

        assert_eq!(submission.coordinator_barriers, 0);
        assert_eq!(submission.command_lists, 4);
        assert_eq!(device.inner.stats().clears, 4);
        assert!(
            targets
                .iter()
                .all(|t| pool.resource_states(*t) == S::PIXEL_SHADER_RESOURCE)
        );
    }

    #[test]
    fn released_resources_outlive_frame() {
        let Setup {
            device,
            queue,
            mut pool,
            mut manager,
        } = setup(HeadlessConfig::default().with(|c| c.progress = GpuProgress::Manual), 1);
        let buf = pool.create_buffer(BufDesc::gpu_only(64)).unwrap();
        let weak = Arc::downgrade(pool.gpu_resource(buf).raw());

        manager.reset_contexts().unwrap();
        manager.graphics_context(0).transition(&pool, buf, S::COPY_DEST).unwrap();
        manager.close_contexts().unwrap();
        manager.execute(&mut pool, &queue).unwrap();

        manager.release_resource(&mut pool, buf);
        assert_eq!(manager.collect_garbage(&mut pool), 0);
        assert!(weak.upgrade().is_some());

        device.inner.retire_all();
        assert_eq!(manager.collect_garbage(&mut pool), 1);
        assert!(weak.upgrade().is_none());
        assert!(device.inner.validation_errors().is_empty());
    }

    #[test]
    #[should_panic(expected = "closed")]
    fn execute_requires_closed_contexts() {
        let Setup {
            queue,
            mut pool,
            mut manager,
            ..
        } = setup(HeadlessConfig::default(), 2);
        manager.reset_contexts().unwrap();
        manager.graphics_context(0).close().unwrap();
        let _ = manager.execute(&mut pool, &queue);
    }

    #[test]
    fn invalid_descriptions() {
        let device = Device::headless(HeadlessConfig::default()).unwrap();
        let no_contexts = ContextManagerDesc::default().with(|d| d.context_count = 0);
        assert!(ContextManager::initialize(&device, no_contexts).is_err());
        let no_frames = ContextManagerDesc::default().with(|d| d.frames_in_flight = 0);
        assert!(ContextManager::initialize(&device, no_frames).is_err());
    }

    #[test]
    #[should_panic(expected = "reset_contexts")]
    fn execute_twice_without_reset_panics() {
        let Setup {
            queue,
            mut pool,
            mut manager,
            ..
        } = setup(HeadlessConfig::default(), 1);
        manager.reset_contexts().unwrap();
        manager.close_contexts().unwrap();
        manager.execute(&mut pool, &queue).unwrap();
        let _ = manager.execute(&mut pool, &queue);
    }

    #[test]
    fn context_reset_waits_for_its_submission() {
        let Setup {
            device,
            queue,
            mut pool,
            mut manager,
        } = setup(HeadlessConfig::default().with(|c| c.progress = GpuProgress::Manual), 1);
        let rt = render_target(&mut pool);

        manager.reset_contexts().unwrap();
        manager.graphics_context(0).transition(&pool, rt, S::RENDER_TARGET).unwrap();
        manager.close_contexts().unwrap();
        manager.execute(&mut pool, &queue).unwrap();
        assert_eq!(manager.frame_fence().completed_value(), 0);

        //slot 0 is still in flight
        manager.graphics_context(0).reset().unwrap();
        assert_eq!(manager.frame_fence().completed_value(), 1);
        assert_eq!(device.inner.stats().stalls, 1);
        assert!(device.inner.validation_errors().is_empty());
    }
}
