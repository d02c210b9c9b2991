use std::sync::Arc;

use smallvec::SmallVec;
use tessel::{
    backend::{ALL_SUBRESOURCES, Backend, Barrier, BarrierFlags},
    resources::{GfxResourceState, GraphicsCommandList},
};

///Amount of barriers that are stored inline before the batch allocates.
pub const BARRIER_STACK_ALLOCATION: usize = 6;

///Collects barriers so they can be recorded with a single `resource_barrier` call.
///
/// Transitions whose before and after state are equal are dropped, they would be no-ops anyways.
pub struct BarrierBatch<B: Backend> {
    pub barriers: SmallVec<[Barrier<B>; BARRIER_STACK_ALLOCATION]>,
}

impl<B: Backend> Default for BarrierBatch<B> {
    fn default() -> Self {
        BarrierBatch {
            barriers: SmallVec::new(),
        }
    }
}

impl<B: Backend> BarrierBatch<B> {
    pub fn new() -> Self {
        Self::default()
    }

    ///Adds a full transition of all subresources.
    pub fn transition(
        &mut self,
        resource: Arc<B::Resource>,
        before: GfxResourceState,
        after: GfxResourceState,
    ) -> &mut Self {
        self.split(resource, before, after, BarrierFlags::None)
    }

    ///Adds one half of a split transition, or a full transition for [BarrierFlags::None].
    pub fn split(
        &mut self,
        resource: Arc<B::Resource>,
        before: GfxResourceState,
        after: GfxResourceState,
        flags: BarrierFlags,
    ) -> &mut Self {
        if before == after {
            return self;
        }
        self.barriers.push(Barrier::Transition {
            resource,
            subresource: ALL_SUBRESOURCES,
            before,
            after,
            flags,
        });
        self
    }

    ///Adds an unordered access barrier for `resource`, or for all resources if `None`.
    pub fn uav(&mut self, resource: Option<Arc<B::Resource>>) -> &mut Self {
        self.barriers.push(Barrier::Uav { resource });
        self
    }

    pub fn custom(&mut self, barrier: Barrier<B>) -> &mut Self {
        self.barriers.push(barrier);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.barriers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.barriers.len()
    }

    ///Records all collected barriers into `list` and empties the batch. Returns how many barriers were recorded.
    pub fn flush(&mut self, list: &mut GraphicsCommandList<B>) -> usize {
        let count = self.barriers.len();
        if count > 0 {
            list.resource_barrier(&self.barriers);
            self.barriers.clear();
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use tessel::{
        backend::headless::{Headless, HeadlessConfig},
        context::Device,
        resources::{BufDesc, GfxResourceState},
    };

    use super::BarrierBatch;

    #[test]
    fn no_op_transitions_are_dropped() {
        let device = Device::headless(HeadlessConfig::default()).unwrap();
        let buffer = device.create_buffer(BufDesc::gpu_only(16)).unwrap();

        let mut batch = BarrierBatch::<Headless>::new();
        batch
            .transition(buffer.inner.clone(), GfxResourceState::COMMON, GfxResourceState::COMMON)
            .transition(buffer.inner.clone(), GfxResourceState::COMMON, GfxResourceState::COPY_DEST)
            .uav(None);
        assert_eq!(batch.len(), 2);

        let mut list = device.create_graphics_command_list().unwrap();
        list.reset().unwrap();
        assert_eq!(batch.flush(&mut list), 2);
        assert!(batch.is_empty());
        assert_eq!(batch.flush(&mut list), 0);
        assert_eq!(list.barrier_count(), 2);
    }
}
