//! # Headless backend
//!
//! Software implementation of the [backend](crate::backend) traits. Nothing is rendered. Instead every submitted
//! operation is placed on a simulated GPU timeline and executed when it is *retired*:
//!
//! - barriers are checked against the state the resource is actually in on the GPU timeline,
//! - copies and clears move real bytes, so uploads can be read back,
//! - resources are referenced weakly by recorded commands, releasing one before the GPU used it is reported,
//! - fences only advance when the signal operation is retired.
//!
//! When ops are retired is controlled by [GpuProgress]. A CPU that blocks on a fence event lets the simulated GPU catch up
//! until the awaited value is reached, which is counted as a [stall](HeadlessStats::stalls). Call
//! [set_hung](HeadlessDevice::set_hung) to simulate a GPU that never finishes, and [remove](HeadlessDevice::remove) to
//! simulate device removal.
//!
//! Everything the GPU found is collected as [ValidationError]s.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::{
    DeviceError,
    resources::{
        BufDesc, GfxResourceState, IndexBufferView, MemoryUsage, PipelineStateDesc, PrimitiveTopology, ScissorRect,
        SubresourceFootprint, TexDesc, VertexBufferView, Viewport,
    },
    swapchain::SwapChainDesc,
    util::align_up,
};

use super::{
    Backend, Barrier, RawCommandList, RawDevice, RawEvent, RawFence, RawQueue, RawResource, RawSwapChain, WaitStatus,
};

mod timeline;
pub use timeline::{HeadlessStats, TraceCommand, TraceEntry, ValidationError};
use timeline::{Command, GpuOp, RecordedBarrier, Timeline};

///Longest time a wait on a hung GPU actually sleeps before reporting a timeout.
const HUNG_WAIT_CAP: Duration = Duration::from_millis(50);
///Alignment of buffer addresses.
const ADDRESS_ALIGNMENT: u64 = 1 << 16;

pub struct Headless;

impl Backend for Headless {
    type Device = HeadlessDevice;
    type Queue = HeadlessQueue;
    type CommandList = HeadlessCommandList;
    type Fence = HeadlessFence;
    type Event = HeadlessEvent;
    type SwapChain = HeadlessSwapChain;
    type Resource = HeadlessResource;
    type PipelineState = HeadlessPipeline;
}

///When submitted operations are retired by the simulated GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GpuProgress {
    ///Right when they are submitted.
    #[default]
    Immediate,
    ///Only when [retire](HeadlessDevice::retire) is called or the CPU blocks on a fence.
    Manual,
    ///The GPU keeps up to `n` presented frames in flight. Submitting a present beyond that retires everything up to
    /// the oldest pending present.
    Lagged(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadlessConfig {
    pub progress: GpuProgress,
    ///Records a [TraceEntry] for every executed command.
    pub trace: bool,
    ///Bytes that can be allocated before creation fails with [DeviceError::OutOfMemory].
    pub memory_budget: u64,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        HeadlessConfig {
            progress: GpuProgress::Immediate,
            trace: false,
            memory_budget: 1 << 30,
        }
    }
}

impl HeadlessConfig {
    pub fn with(mut self, f: impl FnOnce(&mut Self)) -> Self {
        f(&mut self);
        self
    }
}

pub(crate) struct Shared {
    timeline: Mutex<Timeline>,
    removed: AtomicBool,
    hung: AtomicBool,
    next_id: AtomicU64,
    next_address: AtomicU64,
    allocated: AtomicU64,
    live: AtomicUsize,
    budget: u64,
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn check_removed(&self) -> Result<(), DeviceError> {
        if self.removed.load(Ordering::Acquire) {
            Err(DeviceError::DeviceLost("headless device was removed".to_owned()))
        } else {
            Ok(())
        }
    }

    fn submit(&self, op: GpuOp) -> Result<(), DeviceError> {
        self.check_removed()?;
        self.timeline.lock().submit(op);
        Ok(())
    }

    fn allocate(
        self: &Arc<Self>,
        kind: ResourceKind,
        size: u64,
        initial_state: GfxResourceState,
        name: Option<String>,
    ) -> Result<HeadlessResource, DeviceError> {
        self.check_removed()?;
        let initial_state = initial_state
            .validate()
            .map_err(|e| DeviceError::InvalidDescription(e.to_string()))?;
        let before = self.allocated.fetch_add(size, Ordering::AcqRel);
        if before + size > self.budget {
            self.allocated.fetch_sub(size, Ordering::AcqRel);
            return Err(DeviceError::OutOfMemory(size));
        }
        self.live.fetch_add(1, Ordering::AcqRel);

        let address = match kind {
            ResourceKind::Buffer(_) => self
                .next_address
                .fetch_add(align_up(size, ADDRESS_ALIGNMENT), Ordering::Relaxed),
            ResourceKind::Texture(_) => 0,
        };

        Ok(HeadlessResource {
            id: self.next_id(),
            address,
            size,
            kind,
            name,
            state: Mutex::new(initial_state),
            bytes: Mutex::new(vec![0; size as usize]),
            shared: self.clone(),
        })
    }
}

///Simulated device. Besides implementing [RawDevice] it lets you control and inspect the GPU timeline.
pub struct HeadlessDevice {
    shared: Arc<Shared>,
}

impl HeadlessDevice {
    pub fn new(config: HeadlessConfig) -> Result<Self, DeviceError> {
        if config.memory_budget == 0 {
            return Err(DeviceError::InvalidDescription(
                "memory budget can't be 0".to_owned(),
            ));
        }
        Ok(HeadlessDevice {
            shared: Arc::new(Shared {
                timeline: Mutex::new(Timeline::new(config.progress, config.trace)),
                removed: AtomicBool::new(false),
                hung: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                next_address: AtomicU64::new(ADDRESS_ALIGNMENT),
                allocated: AtomicU64::new(0),
                live: AtomicUsize::new(0),
                budget: config.memory_budget,
            }),
        })
    }

    ///Retires up to `count` operations. Returns how many were retired.
    pub fn retire(&self, count: usize) -> usize {
        let mut timeline = self.shared.timeline.lock();
        (0..count).take_while(|_| timeline.retire_one()).count()
    }

    pub fn retire_all(&self) -> usize {
        self.shared.timeline.lock().retire_all()
    }

    ///Retires operations until `fence` reached `value`. Returns false if all operations were retired without reaching it.
    pub fn retire_until(&self, fence: &HeadlessFence, value: u64) -> bool {
        self.shared.timeline.lock().retire_until(&fence.state, value)
    }

    ///Operations submitted but not yet retired.
    pub fn pending_ops(&self) -> usize {
        self.shared.timeline.lock().pending_ops()
    }

    pub fn set_progress(&self, progress: GpuProgress) {
        self.shared.timeline.lock().progress = progress;
    }

    ///A hung GPU never retires anything on its own. CPU waits time out.
    pub fn set_hung(&self, hung: bool) {
        self.shared.hung.store(hung, Ordering::Release);
    }

    ///Simulates device removal. All fences report `u64::MAX` from now on and new work is rejected.
    pub fn remove(&self) {
        #[cfg(feature = "logging")]
        log::error!("Headless device removed");
        self.shared.removed.store(true, Ordering::Release);
    }

    pub fn stats(&self) -> HeadlessStats {
        self.shared.timeline.lock().stats
    }

    pub fn validation_errors(&self) -> Vec<ValidationError> {
        self.shared.timeline.lock().errors.clone()
    }

    ///Takes all trace entries recorded so far. Only filled if [HeadlessConfig::trace] is set.
    pub fn take_trace(&self) -> Vec<TraceEntry> {
        std::mem::take(&mut self.shared.timeline.lock().trace)
    }

    ///State the resource is in on the GPU timeline, i.e. after all retired work.
    pub fn resource_state(&self, resource: &HeadlessResource) -> GfxResourceState {
        *resource.state.lock()
    }

    ///Current content of a resource, regardless of its heap.
    pub fn resource_bytes(&self, resource: &HeadlessResource) -> Vec<u8> {
        resource.bytes.lock().clone()
    }

    ///Number of resources that are alive.
    pub fn live_resources(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.shared.allocated.load(Ordering::Acquire)
    }

    fn buffer_access(resource: &HeadlessResource, offset: u64, size: u64) -> Result<(usize, usize), DeviceError> {
        match resource.kind {
            ResourceKind::Buffer(usage) if usage.is_host_visible() => {}
            _ => return Err(DeviceError::NotMappable),
        }
        match offset.checked_add(size) {
            Some(end) if end <= resource.size => Ok((offset as usize, end as usize)),
            _ => Err(DeviceError::OutOfBounds {
                offset,
                size,
                capacity: resource.size,
            }),
        }
    }
}

impl RawDevice<Headless> for HeadlessDevice {
    fn create_queue(&self) -> Result<HeadlessQueue, DeviceError> {
        self.shared.check_removed()?;
        Ok(HeadlessQueue {
            shared: self.shared.clone(),
        })
    }

    fn create_command_list(&self) -> Result<HeadlessCommandList, DeviceError> {
        self.shared.check_removed()?;
        Ok(HeadlessCommandList {
            id: self.shared.next_id(),
            commands: Vec::new(),
            recorded: Arc::new(Vec::new()),
            closed: true,
        })
    }

    fn create_fence(&self, initial_value: u64) -> Result<HeadlessFence, DeviceError> {
        self.shared.check_removed()?;
        Ok(HeadlessFence {
            state: Arc::new(FenceState {
                id: self.shared.next_id(),
                value: AtomicU64::new(initial_value),
            }),
            shared: self.shared.clone(),
        })
    }

    fn create_event(&self) -> Result<HeadlessEvent, DeviceError> {
        Ok(HeadlessEvent {
            armed: Mutex::new(None),
            shared: self.shared.clone(),
        })
    }

    fn create_swap_chain(&self, _queue: &HeadlessQueue, desc: &SwapChainDesc) -> Result<HeadlessSwapChain, DeviceError> {
        let mut swap_chain = HeadlessSwapChain {
            shared: self.shared.clone(),
            buffers: Vec::new(),
            index: 0,
            desc: TexDesc::render_target(desc.width, desc.height, desc.format),
            count: desc.buffer_count,
        };
        swap_chain.allocate_buffers()?;
        Ok(swap_chain)
    }

    fn create_pipeline_state(&self, desc: &PipelineStateDesc) -> Result<HeadlessPipeline, DeviceError> {
        self.shared.check_removed()?;
        Ok(HeadlessPipeline { desc: desc.clone() })
    }

    fn create_buffer(&self, desc: &BufDesc, initial_state: GfxResourceState) -> Result<HeadlessResource, DeviceError> {
        self.shared.allocate(
            ResourceKind::Buffer(desc.usage),
            desc.size,
            initial_state,
            desc.name.clone(),
        )
    }

    fn create_texture(&self, desc: &TexDesc, initial_state: GfxResourceState) -> Result<HeadlessResource, DeviceError> {
        desc.validate()?;
        self.shared.allocate(
            ResourceKind::Texture(desc.clone()),
            desc.packed_size(),
            initial_state,
            desc.name.clone(),
        )
    }

    fn write_buffer(&self, buffer: &HeadlessResource, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        let (start, end) = Self::buffer_access(buffer, offset, data.len() as u64)?;
        buffer.bytes.lock()[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: &HeadlessResource, offset: u64, dst: &mut [u8]) -> Result<(), DeviceError> {
        let (start, end) = Self::buffer_access(buffer, offset, dst.len() as u64)?;
        dst.copy_from_slice(&buffer.bytes.lock()[start..end]);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceKind {
    Buffer(MemoryUsage),
    Texture(TexDesc),
}

pub struct HeadlessResource {
    id: u64,
    address: u64,
    size: u64,
    kind: ResourceKind,
    name: Option<String>,
    ///State on the GPU timeline.
    state: Mutex<GfxResourceState>,
    bytes: Mutex<Vec<u8>>,
    shared: Arc<Shared>,
}

impl HeadlessResource {
    ///Unique id, used in [TraceEntry]s.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("'{name}'"),
            None => format!("resource #{}", self.id),
        }
    }
}

impl RawResource for HeadlessResource {
    fn gpu_address(&self) -> u64 {
        self.address
    }

    fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for HeadlessResource {
    fn drop(&mut self) {
        self.shared.allocated.fetch_sub(self.size, Ordering::AcqRel);
        self.shared.live.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct HeadlessQueue {
    shared: Arc<Shared>,
}

impl RawQueue<Headless> for HeadlessQueue {
    fn execute(&self, lists: &[&HeadlessCommandList]) {
        let mut timeline = self.shared.timeline.lock();
        let mut batch = Vec::with_capacity(lists.len());
        for list in lists {
            if !list.closed {
                timeline.errors.push(ValidationError::ExecuteOpenList { list: list.id });
                continue;
            }
            batch.push((list.id, list.recorded.clone()));
        }
        if self.shared.removed.load(Ordering::Acquire) {
            return;
        }
        timeline.submit(GpuOp::Execute(batch));
    }

    fn signal(&self, fence: &HeadlessFence, value: u64) -> Result<(), DeviceError> {
        self.shared.submit(GpuOp::Signal {
            fence: fence.state.clone(),
            value,
        })
    }

    fn wait(&self, fence: &HeadlessFence, value: u64) -> Result<(), DeviceError> {
        self.shared.submit(GpuOp::Wait {
            fence: fence.state.clone(),
            value,
        })
    }
}

pub struct HeadlessCommandList {
    id: u64,
    commands: Vec<Command>,
    ///Commands as of the last close.
    recorded: Arc<Vec<Command>>,
    closed: bool,
}

impl HeadlessCommandList {
    ///Unique id, used in [TraceEntry]s.
    pub fn id(&self) -> u64 {
        self.id
    }

    fn push(&mut self, command: Command) {
        debug_assert!(!self.closed, "recording into closed headless command list");
        self.commands.push(command);
    }
}

impl RawCommandList<Headless> for HeadlessCommandList {
    fn reset(&mut self) -> Result<(), DeviceError> {
        self.commands.clear();
        self.closed = false;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.recorded = Arc::new(std::mem::take(&mut self.commands));
        self.closed = true;
        Ok(())
    }

    fn resource_barrier(&mut self, barriers: &[Barrier<Headless>]) {
        let recorded = barriers
            .iter()
            .map(|b| match b {
                Barrier::Transition {
                    resource,
                    before,
                    after,
                    flags,
                    ..
                } => RecordedBarrier::Transition {
                    resource: Arc::downgrade(resource),
                    before: *before,
                    after: *after,
                    flags: *flags,
                },
                Barrier::Uav { resource } => RecordedBarrier::Uav {
                    resource: resource.as_ref().map(Arc::downgrade),
                },
            })
            .collect();
        self.push(Command::Barrier(recorded));
    }

    fn set_pipeline_state(&mut self, _pipeline: &Arc<HeadlessPipeline>) {
        self.push(Command::SetState);
    }

    fn set_viewports(&mut self, _viewports: &[Viewport]) {
        self.push(Command::SetState);
    }

    fn set_scissor_rects(&mut self, _rects: &[ScissorRect]) {
        self.push(Command::SetState);
    }

    fn set_primitive_topology(&mut self, _topology: PrimitiveTopology) {
        self.push(Command::SetState);
    }

    fn set_render_targets(&mut self, targets: &[&Arc<HeadlessResource>], depth: Option<&Arc<HeadlessResource>>) {
        let targets: SmallVec<[_; 8]> = targets.iter().map(|t| Arc::downgrade(t)).collect();
        self.push(Command::SetRenderTargets {
            targets,
            depth: depth.map(Arc::downgrade),
        });
    }

    fn clear_render_target(&mut self, target: &Arc<HeadlessResource>, color: [f32; 4]) {
        self.push(Command::ClearRenderTarget {
            target: Arc::downgrade(target),
            color,
        });
    }

    fn clear_depth_stencil(&mut self, target: &Arc<HeadlessResource>, depth: f32, _stencil: u8) {
        self.push(Command::ClearDepthStencil {
            target: Arc::downgrade(target),
            depth,
        });
    }

    fn set_vertex_buffers(&mut self, _start_slot: u32, _views: &[VertexBufferView]) {
        self.push(Command::SetState);
    }

    fn set_index_buffer(&mut self, _view: &IndexBufferView) {
        self.push(Command::SetState);
    }

    fn set_graphics_root_constant_buffer(&mut self, _slot: u32, _gpu_address: u64) {
        self.push(Command::SetState);
    }

    fn set_compute_root_constant_buffer(&mut self, _slot: u32, _gpu_address: u64) {
        self.push(Command::SetState);
    }

    fn draw_instanced(&mut self, _vertex_count: u32, _instance_count: u32, _start_vertex: u32, _start_instance: u32) {
        self.push(Command::Draw { indexed: false });
    }

    fn draw_indexed_instanced(
        &mut self,
        _index_count: u32,
        _instance_count: u32,
        _start_index: u32,
        _base_vertex: i32,
        _start_instance: u32,
    ) {
        self.push(Command::Draw { indexed: true });
    }

    fn dispatch(&mut self, _x: u32, _y: u32, _z: u32) {
        self.push(Command::Dispatch);
    }

    fn copy_buffer_region(
        &mut self,
        dst: &Arc<HeadlessResource>,
        dst_offset: u64,
        src: &Arc<HeadlessResource>,
        src_offset: u64,
        size: u64,
    ) {
        self.push(Command::CopyBuffer {
            dst: Arc::downgrade(dst),
            dst_offset,
            src: Arc::downgrade(src),
            src_offset,
            size,
        });
    }

    fn copy_texture_region(
        &mut self,
        dst: &Arc<HeadlessResource>,
        subresource: u32,
        src: &Arc<HeadlessResource>,
        footprint: &SubresourceFootprint,
    ) {
        self.push(Command::CopyTexture {
            dst: Arc::downgrade(dst),
            subresource,
            src: Arc::downgrade(src),
            footprint: *footprint,
        });
    }

    fn copy_resource(&mut self, dst: &Arc<HeadlessResource>, src: &Arc<HeadlessResource>) {
        self.push(Command::CopyResource {
            dst: Arc::downgrade(dst),
            src: Arc::downgrade(src),
        });
    }
}

pub(crate) struct FenceState {
    id: u64,
    value: AtomicU64,
}

pub struct HeadlessFence {
    state: Arc<FenceState>,
    shared: Arc<Shared>,
}

impl HeadlessFence {
    pub fn id(&self) -> u64 {
        self.state.id
    }
}

impl RawFence<Headless> for HeadlessFence {
    fn completed_value(&self) -> u64 {
        if self.shared.removed.load(Ordering::Acquire) {
            u64::MAX
        } else {
            self.state.value.load(Ordering::Acquire)
        }
    }

    fn set_event_on_completion(&self, value: u64, event: &HeadlessEvent) -> Result<(), DeviceError> {
        *event.armed.lock() = Some((self.state.clone(), value));
        Ok(())
    }
}

pub struct HeadlessEvent {
    armed: Mutex<Option<(Arc<FenceState>, u64)>>,
    shared: Arc<Shared>,
}

impl RawEvent for HeadlessEvent {
    fn wait(&self, timeout: Option<Duration>) -> WaitStatus {
        let Some((fence, value)) = self.armed.lock().take() else {
            //Nothing will ever signal an event that was not armed.
            std::thread::sleep(timeout.unwrap_or(HUNG_WAIT_CAP).min(HUNG_WAIT_CAP));
            return WaitStatus::TimedOut;
        };
        if self.shared.removed.load(Ordering::Acquire) || fence.value.load(Ordering::Acquire) >= value {
            return WaitStatus::Signaled;
        }
        if self.shared.hung.load(Ordering::Acquire) {
            std::thread::sleep(timeout.unwrap_or(HUNG_WAIT_CAP).min(HUNG_WAIT_CAP));
            return WaitStatus::TimedOut;
        }

        let mut timeline = self.shared.timeline.lock();
        timeline.stats.stalls += 1;
        if timeline.retire_until(&fence, value) {
            WaitStatus::Signaled
        } else {
            WaitStatus::TimedOut
        }
    }
}

pub struct HeadlessSwapChain {
    shared: Arc<Shared>,
    buffers: Vec<Arc<HeadlessResource>>,
    index: u32,
    desc: TexDesc,
    count: u32,
}

impl HeadlessSwapChain {
    fn allocate_buffers(&mut self) -> Result<(), DeviceError> {
        self.buffers.clear();
        for i in 0..self.count {
            let desc = self.desc.clone().with(|d| d.name = Some(format!("back buffer {i}")));
            let size = desc.packed_size();
            let buffer = self.shared.allocate(
                ResourceKind::Texture(desc.clone()),
                size,
                GfxResourceState::PRESENT,
                desc.name,
            )?;
            self.buffers.push(Arc::new(buffer));
        }
        self.index = 0;
        Ok(())
    }
}

impl RawSwapChain<Headless> for HeadlessSwapChain {
    fn buffer_count(&self) -> u32 {
        self.count
    }

    fn current_back_buffer_index(&self) -> u32 {
        self.index
    }

    fn back_buffer(&self, index: u32) -> Result<Arc<HeadlessResource>, DeviceError> {
        self.buffers
            .get(index as usize)
            .cloned()
            .ok_or_else(|| DeviceError::Backend(format!("no back buffer {index}")))
    }

    fn present(&mut self, _sync_interval: u32) -> Result<(), DeviceError> {
        self.shared.submit(GpuOp::Present {
            back_buffer: self.buffers[self.index as usize].clone(),
        })?;
        self.index = (self.index + 1) % self.count;
        Ok(())
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<(), DeviceError> {
        self.desc.width = width;
        self.desc.height = height;
        self.allocate_buffers()
    }
}

pub struct HeadlessPipeline {
    pub desc: PipelineStateDesc,
}
