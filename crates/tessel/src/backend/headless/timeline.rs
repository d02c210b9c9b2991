use std::{
    collections::VecDeque,
    sync::{Arc, Weak, atomic::Ordering},
};

use ahash::AHashMap;
use smallvec::SmallVec;
use thiserror::Error;

use crate::{
    backend::BarrierFlags,
    resources::{GfxResourceState, SubresourceFootprint},
};

use super::{FenceState, GpuProgress, HeadlessResource, ResourceKind};

///Misuse detected while the simulated GPU executed work.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{command} expected {resource} in {expected:?}, but it was in {actual:?}")]
    StateMismatch {
        command: &'static str,
        resource: String,
        expected: GfxResourceState,
        actual: GfxResourceState,
    },
    #[error("{command} used a resource that was already released")]
    UseAfterFree { command: &'static str },
    #[error("{command} accessed {size} bytes at {offset} of {resource} with {capacity} bytes")]
    OutOfBounds {
        command: &'static str,
        resource: String,
        offset: u64,
        size: u64,
        capacity: u64,
    },
    #[error("Invalid state {state:?} used in a barrier of {resource}")]
    InvalidState { resource: String, state: GfxResourceState },
    #[error("Split barrier end of {resource} has no matching begin")]
    SplitBarrierMismatch { resource: String },
    #[error("{command} can't be used on {resource}")]
    WrongResourceKind { command: &'static str, resource: String },
    #[error("Queue waits for fence value {value} that is never signaled")]
    QueueWaitDeadlock { value: u64 },
    #[error("Command list {list} was executed while recording")]
    ExecuteOpenList { list: u64 },
}

///Counters of everything the simulated GPU executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    ///`execute` batches retired.
    pub submissions: u64,
    pub command_lists: u64,
    ///Transition barriers, split halves count separately.
    pub barriers: u64,
    pub uav_barriers: u64,
    pub clears: u64,
    pub draws: u64,
    pub dispatches: u64,
    pub copies: u64,
    pub presents: u64,
    pub signals: u64,
    ///Number of CPU waits that had to let the GPU catch up.
    pub stalls: u64,
    pub retired_ops: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TraceCommand {
    Transition {
        resource: u64,
        before: GfxResourceState,
        after: GfxResourceState,
        flags: BarrierFlags,
    },
    Uav {
        resource: Option<u64>,
    },
    ClearRenderTarget {
        resource: u64,
    },
    ClearDepthStencil {
        resource: u64,
    },
    Draw {
        indexed: bool,
    },
    Dispatch,
    Copy {
        dst: u64,
        src: u64,
    },
    Present {
        resource: u64,
    },
    Signal {
        fence: u64,
        value: u64,
    },
    Wait {
        fence: u64,
        value: u64,
    },
}

///One executed command in GPU order. `list` is the id of the command list it was recorded in, or 0 for queue operations.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceEntry {
    pub list: u64,
    pub command: TraceCommand,
}

pub(crate) enum RecordedBarrier {
    Transition {
        resource: Weak<HeadlessResource>,
        before: GfxResourceState,
        after: GfxResourceState,
        flags: BarrierFlags,
    },
    Uav {
        resource: Option<Weak<HeadlessResource>>,
    },
}

///Commands as recorded by a headless command list. Resources are held weakly so releasing them too early is detected.
pub(crate) enum Command {
    Barrier(SmallVec<[RecordedBarrier; 4]>),
    ///Pipeline state like viewports or bound buffers. Not validated.
    SetState,
    SetRenderTargets {
        targets: SmallVec<[Weak<HeadlessResource>; 8]>,
        depth: Option<Weak<HeadlessResource>>,
    },
    ClearRenderTarget {
        target: Weak<HeadlessResource>,
        color: [f32; 4],
    },
    ClearDepthStencil {
        target: Weak<HeadlessResource>,
        depth: f32,
    },
    Draw {
        indexed: bool,
    },
    Dispatch,
    CopyBuffer {
        dst: Weak<HeadlessResource>,
        dst_offset: u64,
        src: Weak<HeadlessResource>,
        src_offset: u64,
        size: u64,
    },
    CopyTexture {
        dst: Weak<HeadlessResource>,
        subresource: u32,
        src: Weak<HeadlessResource>,
        footprint: SubresourceFootprint,
    },
    CopyResource {
        dst: Weak<HeadlessResource>,
        src: Weak<HeadlessResource>,
    },
}

pub(crate) enum GpuOp {
    Execute(Vec<(u64, Arc<Vec<Command>>)>),
    Signal { fence: Arc<FenceState>, value: u64 },
    Wait { fence: Arc<FenceState>, value: u64 },
    Present { back_buffer: Arc<HeadlessResource> },
}

///Render targets bound while executing a single command list.
#[derive(Default)]
struct Bindings {
    targets: SmallVec<[Weak<HeadlessResource>; 8]>,
    depth: Option<Weak<HeadlessResource>>,
}

pub(crate) struct Timeline {
    pub(crate) progress: GpuProgress,
    pub(crate) trace_enabled: bool,
    ops: VecDeque<GpuOp>,
    pending_presents: usize,
    ///Open split barriers by resource id.
    splits: AHashMap<u64, GfxResourceState>,
    pub(crate) stats: HeadlessStats,
    pub(crate) errors: Vec<ValidationError>,
    pub(crate) trace: Vec<TraceEntry>,
}

impl Timeline {
    pub(crate) fn new(progress: GpuProgress, trace_enabled: bool) -> Self {
        Timeline {
            progress,
            trace_enabled,
            ops: VecDeque::new(),
            pending_presents: 0,
            splits: AHashMap::default(),
            stats: HeadlessStats::default(),
            errors: Vec::new(),
            trace: Vec::new(),
        }
    }

    pub(crate) fn pending_ops(&self) -> usize {
        self.ops.len()
    }

    pub(crate) fn submit(&mut self, op: GpuOp) {
        if let GpuOp::Present { .. } = op {
            self.pending_presents += 1;
        }
        self.ops.push_back(op);

        match self.progress {
            GpuProgress::Immediate => {
                self.retire_all();
            }
            GpuProgress::Manual => {}
            GpuProgress::Lagged(frames) => {
                while self.pending_presents > frames as usize && self.retire_one() {}
            }
        }
    }

    pub(crate) fn retire_all(&mut self) -> usize {
        let mut count = 0;
        while self.retire_one() {
            count += 1;
        }
        count
    }

    ///Retires ops until `fence` reached `value`. Returns false if the queue ran dry before.
    pub(crate) fn retire_until(&mut self, fence: &FenceState, value: u64) -> bool {
        while fence.value.load(Ordering::Acquire) < value {
            if !self.retire_one() {
                return false;
            }
        }
        true
    }

    pub(crate) fn retire_one(&mut self) -> bool {
        let Some(op) = self.ops.pop_front() else {
            return false;
        };
        self.stats.retired_ops += 1;

        match op {
            GpuOp::Execute(lists) => {
                self.stats.submissions += 1;
                for (list, commands) in lists {
                    self.stats.command_lists += 1;
                    let mut bindings = Bindings::default();
                    for command in commands.iter() {
                        self.run(list, command, &mut bindings);
                    }
                }
            }
            GpuOp::Signal { fence, value } => {
                self.stats.signals += 1;
                fence.value.fetch_max(value, Ordering::AcqRel);
                self.record(0, TraceCommand::Signal { fence: fence.id, value });
            }
            GpuOp::Wait { fence, value } => {
                //Single queue: nothing else could signal the fence while we wait.
                if fence.value.load(Ordering::Acquire) < value {
                    self.errors.push(ValidationError::QueueWaitDeadlock { value });
                }
                self.record(0, TraceCommand::Wait { fence: fence.id, value });
            }
            GpuOp::Present { back_buffer } => {
                self.pending_presents -= 1;
                self.stats.presents += 1;
                self.require(&back_buffer, GfxResourceState::PRESENT, "present");
                self.record(0, TraceCommand::Present { resource: back_buffer.id });
            }
        }
        true
    }

    fn record(&mut self, list: u64, command: TraceCommand) {
        if self.trace_enabled {
            self.trace.push(TraceEntry { list, command });
        }
    }

    fn upgrade(&mut self, resource: &Weak<HeadlessResource>, command: &'static str) -> Option<Arc<HeadlessResource>> {
        let res = resource.upgrade();
        if res.is_none() {
            self.errors.push(ValidationError::UseAfterFree { command });
        }
        res
    }

    ///Checks that `resource` currently allows `required` access.
    fn require(&mut self, resource: &HeadlessResource, required: GfxResourceState, command: &'static str) -> bool {
        let actual = *resource.state.lock();
        if actual.allows(required) {
            true
        } else {
            self.errors.push(ValidationError::StateMismatch {
                command,
                resource: resource.label(),
                expected: required,
                actual,
            });
            false
        }
    }

    fn check_bounds(
        &mut self,
        resource: &HeadlessResource,
        offset: u64,
        size: u64,
        command: &'static str,
    ) -> bool {
        let capacity = resource.size;
        if offset.checked_add(size).is_some_and(|end| end <= capacity) {
            true
        } else {
            self.errors.push(ValidationError::OutOfBounds {
                command,
                resource: resource.label(),
                offset,
                size,
                capacity,
            });
            false
        }
    }

    fn run(&mut self, list: u64, command: &Command, bindings: &mut Bindings) {
        match command {
            Command::Barrier(barriers) => {
                for barrier in barriers {
                    self.barrier(list, barrier);
                }
            }
            Command::SetState => {}
            Command::SetRenderTargets { targets, depth } => {
                bindings.targets = targets.clone();
                bindings.depth = depth.clone();
            }
            Command::ClearRenderTarget { target, color } => {
                self.stats.clears += 1;
                let Some(target) = self.upgrade(target, "clear_render_target") else {
                    return;
                };
                self.record(list, TraceCommand::ClearRenderTarget { resource: target.id });
                if self.require(&target, GfxResourceState::RENDER_TARGET, "clear_render_target") {
                    if let ResourceKind::Texture(desc) = &target.kind {
                        fill(&target, &desc.format.encode_color(*color));
                    }
                }
            }
            Command::ClearDepthStencil { target, depth } => {
                self.stats.clears += 1;
                let Some(target) = self.upgrade(target, "clear_depth_stencil") else {
                    return;
                };
                self.record(list, TraceCommand::ClearDepthStencil { resource: target.id });
                if self.require(&target, GfxResourceState::DEPTH_WRITE, "clear_depth_stencil") {
                    fill(&target, &depth.to_ne_bytes());
                }
            }
            Command::Draw { indexed } => {
                self.stats.draws += 1;
                self.record(list, TraceCommand::Draw { indexed: *indexed });
                for target in bindings.targets.iter() {
                    if let Some(target) = self.upgrade(target, "draw") {
                        self.require(&target, GfxResourceState::RENDER_TARGET, "draw");
                    }
                }
                if let Some(depth) = &bindings.depth {
                    if let Some(depth) = self.upgrade(depth, "draw") {
                        let state = *depth.state.lock();
                        if state != GfxResourceState::DEPTH_WRITE && !state.contains(GfxResourceState::DEPTH_READ) {
                            self.require(&depth, GfxResourceState::DEPTH_WRITE, "draw");
                        }
                    }
                }
            }
            Command::Dispatch => {
                self.stats.dispatches += 1;
                self.record(list, TraceCommand::Dispatch);
            }
            Command::CopyBuffer {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            } => {
                self.stats.copies += 1;
                let (Some(dst), Some(src)) = (
                    self.upgrade(dst, "copy_buffer_region"),
                    self.upgrade(src, "copy_buffer_region"),
                ) else {
                    return;
                };
                self.record(list, TraceCommand::Copy { dst: dst.id, src: src.id });
                let valid = self.require(&src, GfxResourceState::COPY_SOURCE, "copy_buffer_region")
                    & self.require(&dst, GfxResourceState::COPY_DEST, "copy_buffer_region")
                    & self.check_bounds(&src, *src_offset, *size, "copy_buffer_region")
                    & self.check_bounds(&dst, *dst_offset, *size, "copy_buffer_region");
                if valid {
                    copy_bytes(&dst, *dst_offset, &src, *src_offset, *size);
                }
            }
            Command::CopyTexture {
                dst,
                subresource,
                src,
                footprint,
            } => {
                self.stats.copies += 1;
                let (Some(dst), Some(src)) = (
                    self.upgrade(dst, "copy_texture_region"),
                    self.upgrade(src, "copy_texture_region"),
                ) else {
                    return;
                };
                self.record(list, TraceCommand::Copy { dst: dst.id, src: src.id });
                let ResourceKind::Texture(desc) = &dst.kind else {
                    self.errors.push(ValidationError::WrongResourceKind {
                        command: "copy_texture_region",
                        resource: dst.label(),
                    });
                    return;
                };
                if *subresource >= desc.subresource_count()
                    || desc.subresource_extent(*subresource) != (footprint.width, footprint.height)
                    || desc.format != footprint.format
                {
                    self.errors.push(ValidationError::OutOfBounds {
                        command: "copy_texture_region",
                        resource: dst.label(),
                        offset: *subresource as u64,
                        size: footprint.row_size() * footprint.height as u64,
                        capacity: dst.size,
                    });
                    return;
                }
                let valid = self.require(&src, GfxResourceState::COPY_SOURCE, "copy_texture_region")
                    & self.require(&dst, GfxResourceState::COPY_DEST, "copy_texture_region")
                    & self.check_bounds(&src, footprint.offset, footprint.span(), "copy_texture_region");
                if valid {
                    let dst_base = desc.packed_offset(*subresource);
                    let row = footprint.row_size();
                    for y in 0..footprint.height as u64 {
                        copy_bytes(
                            &dst,
                            dst_base + y * row,
                            &src,
                            footprint.offset + y * footprint.row_pitch as u64,
                            row,
                        );
                    }
                }
            }
            Command::CopyResource { dst, src } => {
                self.stats.copies += 1;
                let (Some(dst), Some(src)) = (
                    self.upgrade(dst, "copy_resource"),
                    self.upgrade(src, "copy_resource"),
                ) else {
                    return;
                };
                self.record(list, TraceCommand::Copy { dst: dst.id, src: src.id });
                let valid = self.require(&src, GfxResourceState::COPY_SOURCE, "copy_resource")
                    & self.require(&dst, GfxResourceState::COPY_DEST, "copy_resource")
                    & self.check_bounds(&dst, 0, src.size, "copy_resource");
                if valid {
                    copy_bytes(&dst, 0, &src, 0, src.size);
                }
            }
        }
    }

    fn barrier(&mut self, list: u64, barrier: &RecordedBarrier) {
        match barrier {
            RecordedBarrier::Transition {
                resource,
                before,
                after,
                flags,
            } => {
                self.stats.barriers += 1;
                let Some(resource) = self.upgrade(resource, "resource_barrier") else {
                    return;
                };
                self.record(
                    list,
                    TraceCommand::Transition {
                        resource: resource.id,
                        before: *before,
                        after: *after,
                        flags: *flags,
                    },
                );
                for state in [before, after] {
                    if state.validate().is_err() {
                        self.errors.push(ValidationError::InvalidState {
                            resource: resource.label(),
                            state: *state,
                        });
                    }
                }

                let actual = *resource.state.lock();
                if actual != *before {
                    self.errors.push(ValidationError::StateMismatch {
                        command: "resource_barrier",
                        resource: resource.label(),
                        expected: *before,
                        actual,
                    });
                }
                match flags {
                    BarrierFlags::None => *resource.state.lock() = *after,
                    BarrierFlags::BeginOnly => {
                        self.splits.insert(resource.id, *after);
                    }
                    BarrierFlags::EndOnly => {
                        if self.splits.remove(&resource.id) != Some(*after) {
                            self.errors.push(ValidationError::SplitBarrierMismatch {
                                resource: resource.label(),
                            });
                        }
                        *resource.state.lock() = *after;
                    }
                }
            }
            RecordedBarrier::Uav { resource } => {
                self.stats.uav_barriers += 1;
                let id = match resource {
                    Some(weak) => {
                        let Some(resource) = self.upgrade(weak, "uav_barrier") else {
                            return;
                        };
                        self.require(&resource, GfxResourceState::UNORDERED_ACCESS, "uav_barrier");
                        Some(resource.id)
                    }
                    None => None,
                };
                self.record(list, TraceCommand::Uav { resource: id });
            }
        }
    }
}

fn fill(resource: &HeadlessResource, texel: &[u8]) {
    if texel.is_empty() {
        return;
    }
    for chunk in resource.bytes.lock().chunks_exact_mut(texel.len()) {
        chunk.copy_from_slice(texel);
    }
}

fn copy_bytes(dst: &HeadlessResource, dst_offset: u64, src: &HeadlessResource, src_offset: u64, size: u64) {
    let (dst_offset, src_offset, size) = (dst_offset as usize, src_offset as usize, size as usize);
    if std::ptr::eq(dst, src) {
        dst.bytes
            .lock()
            .copy_within(src_offset..src_offset + size, dst_offset);
    } else {
        let src = src.bytes.lock();
        dst.bytes.lock()[dst_offset..dst_offset + size].copy_from_slice(&src[src_offset..src_offset + size]);
    }
}
