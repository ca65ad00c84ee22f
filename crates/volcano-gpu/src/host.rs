//! A software [`GpuDevice`] that executes command buffers in host memory.
//!
//! Copies, layout tracking and dispatches behave like a single in-order
//! queue. Dispatches run a [`HostKernel`] registered under the shader's name;
//! a program without a kernel still counts its dispatches. Submissions either
//! complete inside `submit` or wait for [`HostDevice::complete_next`] and
//! [`HostDevice::complete_pending`], which makes fence timing deterministic.

use crate::device::{
    texel_size, BufferDesc, ComputeProgram, ComputeShader, DescriptorBinding, GpuDevice,
    ImageDesc, MappedPtr, SubmitInfo,
};
use crate::error::{GpuError, Result};
use ash::vk::{self, Handle};
use gpu_allocator::MemoryLocation;
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, VecDeque};
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Host implementation of a compute shader.
///
/// Receives the dispatch size and the contents of every bound buffer keyed by
/// binding index. Changes to the map are written back to the buffers.
pub type HostKernel = Arc<dyn Fn([u32; 3], &mut BTreeMap<u32, Vec<u8>>) + Send + Sync>;

/// When submitted work executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// Work runs inside `submit` and its fence is signalled on return.
    #[default]
    Immediate,
    /// Work is queued until the caller completes it.
    Deferred,
}

fn to_usize(value: u64) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| GpuError::InvalidState(format!("{value} does not fit in host memory")))
}

struct HostBuffer {
    ptr: NonNull<u8>,
    len: usize,
    location: MemoryLocation,
}

// SAFETY: the allocation is owned by the buffer and only touched under the
// device mutex or through a mapping whose user owns the buffer.
unsafe impl Send for HostBuffer {}

impl HostBuffer {
    fn zeroed(len: usize, location: MemoryLocation) -> Self {
        let data: &mut [u8] = Box::leak(vec![0u8; len].into_boxed_slice());
        Self {
            ptr: NonNull::from(data).cast(),
            len,
            location,
        }
    }

    fn span(&self, offset: u64, len: usize) -> Result<usize> {
        let start = to_usize(offset)?;
        match start.checked_add(len) {
            Some(end) if end <= self.len => Ok(start),
            _ => Err(GpuError::InvalidState(format!(
                "range {offset}+{len} outside a {} byte buffer",
                self.len
            ))),
        }
    }

    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let start = self.span(offset, len)?;
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(start), out.as_mut_ptr(), len);
        }
        Ok(out)
    }

    fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let start = self.span(offset, bytes.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr().add(start), bytes.len());
        }
        Ok(())
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.len,
            )));
        }
    }
}

struct HostImage {
    data: Vec<u8>,
    extent: vk::Extent3D,
    texel: u64,
    layout: vk::ImageLayout,
}

/// One contiguous row of a buffer/image copy: buffer offset, image byte
/// offset, length.
type CopyRow = (u64, usize, usize);

fn copy_rows(region: &vk::BufferImageCopy, image: &HostImage) -> Result<Vec<CopyRow>> {
    let copy = region.image_extent;
    let (w, h, d) = (
        u64::from(copy.width),
        u64::from(copy.height),
        u64::from(copy.depth),
    );
    let row_length = match region.buffer_row_length {
        0 => w,
        n => u64::from(n),
    };
    let image_height = match region.buffer_image_height {
        0 => h,
        n => u64::from(n),
    };
    let offset = |v: i32| {
        u64::try_from(v)
            .map_err(|_| GpuError::InvalidState(format!("negative image offset {v}")))
    };
    let (ox, oy, oz) = (
        offset(region.image_offset.x)?,
        offset(region.image_offset.y)?,
        offset(region.image_offset.z)?,
    );
    let extent = image.extent;
    if ox + w > u64::from(extent.width)
        || oy + h > u64::from(extent.height)
        || oz + d > u64::from(extent.depth)
    {
        return Err(GpuError::InvalidState(format!(
            "copy of {w}x{h}x{d} at ({ox}, {oy}, {oz}) outside a {}x{}x{} image",
            extent.width, extent.height, extent.depth
        )));
    }

    let texel = image.texel;
    let row_bytes = to_usize(w * texel)?;
    let mut rows = Vec::with_capacity(to_usize(h * d)?);
    for z in 0..d {
        for y in 0..h {
            let buffer_offset = region.buffer_offset + (z * image_height + y) * row_length * texel;
            let image_offset = (((oz + z) * u64::from(extent.height) + oy + y)
                * u64::from(extent.width)
                + ox)
                * texel;
            rows.push((buffer_offset, to_usize(image_offset)?, row_bytes));
        }
    }
    Ok(rows)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmdState {
    Initial,
    Recording,
    Executable,
    Pending,
}

#[derive(Clone)]
enum HostOp {
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<vk::BufferCopy>,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        regions: Vec<vk::BufferImageCopy>,
    },
    CopyImageToBuffer {
        src: vk::Image,
        dst: vk::Buffer,
        regions: Vec<vk::BufferImageCopy>,
    },
    BindCompute {
        pipeline: vk::Pipeline,
        set: vk::DescriptorSet,
    },
    Dispatch {
        groups: [u32; 3],
    },
}

struct HostCommandBuffer {
    state: CmdState,
    ops: Vec<HostOp>,
    bound: bool,
}

struct HostProgram {
    name: String,
    bindings: Vec<DescriptorBinding>,
}

struct HostSet {
    pipeline: vk::Pipeline,
    writes: BTreeMap<u32, (vk::Buffer, u64)>,
}

#[derive(Default)]
struct HostFence {
    signaled: bool,
    borrowed: bool,
    in_flight: bool,
}

struct Submission {
    command_buffers: Vec<vk::CommandBuffer>,
    fence: vk::Fence,
}

#[derive(Default)]
struct HostState {
    mode: CompletionMode,
    next_handle: u64,
    buffers: HashMap<vk::Buffer, HostBuffer>,
    images: HashMap<vk::Image, HostImage>,
    command_buffers: HashMap<vk::CommandBuffer, HostCommandBuffer>,
    programs: HashMap<vk::Pipeline, HostProgram>,
    sets: HashMap<vk::DescriptorSet, HostSet>,
    fences: HashMap<vk::Fence, HostFence>,
    free_fences: Vec<vk::Fence>,
    queue: VecDeque<Submission>,
    kernels: HashMap<String, HostKernel>,
    dispatches: u64,
    submissions: u64,
    memory_budget: Option<u64>,
}

impl HostState {
    fn handle<T: Handle>(&mut self) -> T {
        self.next_handle += 1;
        T::from_raw(self.next_handle)
    }

    fn buffer(&self, buffer: vk::Buffer) -> Result<&HostBuffer> {
        self.buffers
            .get(&buffer)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("buffer {buffer:?}")))
    }

    fn buffer_mut(&mut self, buffer: vk::Buffer) -> Result<&mut HostBuffer> {
        self.buffers
            .get_mut(&buffer)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("buffer {buffer:?}")))
    }

    fn image(&self, image: vk::Image) -> Result<&HostImage> {
        self.images
            .get(&image)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("image {image:?}")))
    }

    fn image_mut(&mut self, image: vk::Image) -> Result<&mut HostImage> {
        self.images
            .get_mut(&image)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("image {image:?}")))
    }

    fn command_buffer(&mut self, cmd: vk::CommandBuffer) -> Result<&mut HostCommandBuffer> {
        self.command_buffers
            .get_mut(&cmd)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("command buffer {cmd:?}")))
    }

    fn recording(&mut self, cmd: vk::CommandBuffer) -> Result<&mut HostCommandBuffer> {
        let buffer = self.command_buffer(cmd)?;
        if buffer.state != CmdState::Recording {
            return Err(GpuError::ContractViolation(format!(
                "command buffer {cmd:?} is {:?}, not recording",
                buffer.state
            )));
        }
        Ok(buffer)
    }

    fn expect_layout(&self, image: vk::Image, layout: vk::ImageLayout) -> Result<()> {
        let current = self.image(image)?.layout;
        if current != layout && current != vk::ImageLayout::GENERAL {
            return Err(GpuError::ContractViolation(format!(
                "image {image:?} is in {current:?}, copy expects {layout:?}"
            )));
        }
        Ok(())
    }

    fn fences_ready(&self, fences: &[vk::Fence], wait_all: bool) -> Result<bool> {
        let mut signaled = Vec::with_capacity(fences.len());
        for fence in fences {
            let state = self
                .fences
                .get(fence)
                .ok_or_else(|| GpuError::ResourceNotFound(format!("fence {fence:?}")))?;
            signaled.push(state.signaled);
        }
        Ok(if wait_all {
            signaled.iter().all(|s| *s)
        } else {
            signaled.iter().any(|s| *s)
        })
    }

    fn execute(&mut self, submission: Submission) -> Result<()> {
        let mut outcome = Ok(());
        for cmd in &submission.command_buffers {
            let Some(buffer) = self.command_buffers.get_mut(cmd) else {
                tracing::warn!("Command buffer {cmd:?} was freed while pending");
                continue;
            };
            buffer.state = CmdState::Executable;
            let ops = buffer.ops.clone();
            if outcome.is_ok() {
                outcome = self.run(&ops);
            }
        }
        if let Some(fence) = self.fences.get_mut(&submission.fence) {
            fence.signaled = true;
            fence.in_flight = false;
        }
        outcome
    }

    fn run(&mut self, ops: &[HostOp]) -> Result<()> {
        let mut bound = None;
        for op in ops {
            match op {
                HostOp::CopyBuffer { src, dst, regions } => {
                    for region in regions {
                        let bytes = self.buffer(*src)?.read(region.src_offset, to_usize(region.size)?)?;
                        self.buffer_mut(*dst)?.write(region.dst_offset, &bytes)?;
                    }
                }
                HostOp::CopyBufferToImage { src, dst, regions } => {
                    for region in regions {
                        for (from, to, len) in copy_rows(region, self.image(*dst)?)? {
                            let bytes = self.buffer(*src)?.read(from, len)?;
                            self.image_mut(*dst)?.data[to..to + len].copy_from_slice(&bytes);
                        }
                    }
                }
                HostOp::CopyImageToBuffer { src, dst, regions } => {
                    for region in regions {
                        let image = self.image(*src)?;
                        let rows: Vec<(u64, Vec<u8>)> = copy_rows(region, image)?
                            .into_iter()
                            .map(|(to, from, len)| (to, image.data[from..from + len].to_vec()))
                            .collect();
                        let buffer = self.buffer_mut(*dst)?;
                        for (to, bytes) in rows {
                            buffer.write(to, &bytes)?;
                        }
                    }
                }
                HostOp::BindCompute { pipeline, set } => bound = Some((*pipeline, *set)),
                HostOp::Dispatch { groups } => {
                    let (pipeline, set) = bound.ok_or_else(|| {
                        GpuError::ContractViolation("dispatch without a bound program".to_string())
                    })?;
                    self.dispatch(pipeline, set, *groups)?;
                }
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, pipeline: vk::Pipeline, set: vk::DescriptorSet, groups: [u32; 3]) -> Result<()> {
        self.dispatches += 1;
        let host_set = self
            .sets
            .get(&set)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("descriptor set {set:?}")))?;
        if host_set.pipeline != pipeline {
            return Err(GpuError::ContractViolation(format!(
                "descriptor set {set:?} belongs to another program"
            )));
        }
        let writes = host_set.writes.clone();
        let program = self
            .programs
            .get(&pipeline)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("program {pipeline:?}")))?;
        let Some(kernel) = self.kernels.get(&program.name).cloned() else {
            return Ok(());
        };

        let mut bindings = BTreeMap::new();
        for (binding, (buffer, range)) in &writes {
            bindings.insert(*binding, self.buffer(*buffer)?.read(0, to_usize(*range)?)?);
        }
        kernel(groups, &mut bindings);
        for (binding, (buffer, range)) in &writes {
            if let Some(data) = bindings.get(binding) {
                let len = data.len().min(to_usize(*range)?);
                self.buffer_mut(*buffer)?.write(0, &data[..len])?;
            }
        }
        Ok(())
    }
}

/// Software device for tests and machines without Vulkan.
pub struct HostDevice {
    state: Mutex<HostState>,
    completed: Condvar,
    queue_count: usize,
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDevice {
    /// A device with one queue that completes work inside `submit`.
    pub fn new() -> Self {
        Self::with_mode(CompletionMode::Immediate)
    }

    pub fn with_mode(mode: CompletionMode) -> Self {
        Self {
            state: Mutex::new(HostState {
                mode,
                ..HostState::default()
            }),
            completed: Condvar::new(),
            queue_count: 1,
        }
    }

    pub fn with_queue_count(mut self, count: usize) -> Self {
        self.queue_count = count.max(1);
        self
    }

    pub fn mode(&self) -> CompletionMode {
        self.state.lock().mode
    }

    /// Change the completion mode. Already queued work stays queued.
    pub fn set_mode(&self, mode: CompletionMode) {
        self.state.lock().mode = mode;
    }

    /// Run `kernel` for every dispatch of programs created with `name`.
    pub fn register_kernel<F>(&self, name: impl Into<String>, kernel: F)
    where
        F: Fn([u32; 3], &mut BTreeMap<u32, Vec<u8>>) + Send + Sync + 'static,
    {
        self.state.lock().kernels.insert(name.into(), Arc::new(kernel));
    }

    /// Execute the oldest queued submission. Returns `false` if none was queued.
    pub fn complete_next(&self) -> Result<bool> {
        let mut state = self.state.lock();
        let Some(submission) = state.queue.pop_front() else {
            return Ok(false);
        };
        let outcome = state.execute(submission);
        drop(state);
        self.completed.notify_all();
        outcome.map(|()| true)
    }

    /// Execute every queued submission in order. Returns how many ran.
    pub fn complete_pending(&self) -> Result<usize> {
        let mut state = self.state.lock();
        let mut count = 0;
        let mut outcome = Ok(());
        while let Some(submission) = state.queue.pop_front() {
            count += 1;
            let result = state.execute(submission);
            if outcome.is_ok() {
                outcome = result;
            }
        }
        drop(state);
        self.completed.notify_all();
        outcome.map(|()| count)
    }

    /// Cap the bytes live buffers may hold. Creating a buffer past the cap
    /// fails with `AllocationFailed`. `None` removes the cap.
    pub fn set_memory_budget(&self, bytes: Option<u64>) {
        self.state.lock().memory_budget = bytes;
    }

    pub fn pending_submissions(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Total submissions accepted so far.
    pub fn submission_count(&self) -> u64 {
        self.state.lock().submissions
    }

    /// Dispatches executed so far.
    pub fn dispatch_count(&self) -> u64 {
        self.state.lock().dispatches
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_command_buffers(&self) -> usize {
        self.state.lock().command_buffers.len()
    }

    pub fn borrowed_fences(&self) -> usize {
        self.state.lock().fences.values().filter(|f| f.borrowed).count()
    }

    /// Copy of a buffer's contents, regardless of memory location.
    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let host = state.buffer(buffer)?;
        host.read(0, host.len)
    }

    /// Overwrite part of a buffer, regardless of memory location.
    pub fn write_buffer(&self, buffer: vk::Buffer, offset: u64, bytes: &[u8]) -> Result<()> {
        self.state.lock().buffer_mut(buffer)?.write(offset, bytes)
    }

    pub fn image_contents(&self, image: vk::Image) -> Result<Vec<u8>> {
        Ok(self.state.lock().image(image)?.data.clone())
    }
}

impl GpuDevice for HostDevice {
    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<vk::Buffer> {
        let len = to_usize(desc.size)?;
        let mut state = self.state.lock();
        if let Some(budget) = state.memory_budget {
            let live: u64 = state.buffers.values().map(|b| b.len as u64).sum();
            if live + desc.size > budget {
                return Err(GpuError::AllocationFailed(format!(
                    "{}: {} bytes over a {budget} byte budget ({live} live)",
                    desc.name, desc.size
                )));
            }
        }
        let handle = state.handle();
        state
            .buffers
            .insert(handle, HostBuffer::zeroed(len, desc.location));
        tracing::trace!("Host buffer {} ({} bytes)", desc.name, desc.size);
        Ok(handle)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) -> Result<()> {
        self.state
            .lock()
            .buffers
            .remove(&buffer)
            .map(drop)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("buffer {buffer:?}")))
    }

    fn mapped_ptr(&self, buffer: vk::Buffer) -> Result<MappedPtr> {
        let state = self.state.lock();
        let host = state.buffer(buffer)?;
        if host.location == MemoryLocation::GpuOnly {
            return Err(GpuError::InvalidState(format!(
                "buffer {buffer:?} is not host visible"
            )));
        }
        Ok(MappedPtr::new(host.ptr))
    }

    fn create_image(&self, desc: &ImageDesc<'_>) -> Result<vk::Image> {
        let texel = texel_size(desc.format).ok_or_else(|| {
            GpuError::InvalidState(format!("unsupported image format {:?}", desc.format))
        })?;
        let extent = desc.extent;
        let len = u64::from(extent.width)
            * u64::from(extent.height)
            * u64::from(extent.depth)
            * u64::from(texel);
        let data = vec![0u8; to_usize(len)?];
        let mut state = self.state.lock();
        let handle = state.handle();
        state.images.insert(
            handle,
            HostImage {
                data,
                extent,
                texel: u64::from(texel),
                layout: vk::ImageLayout::UNDEFINED,
            },
        );
        Ok(handle)
    }

    fn destroy_image(&self, image: vk::Image) -> Result<()> {
        self.state
            .lock()
            .images
            .remove(&image)
            .map(drop)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("image {image:?}")))
    }

    fn image_layout(&self, image: vk::Image) -> Result<vk::ImageLayout> {
        Ok(self.state.lock().image(image)?.layout)
    }

    fn allocate_command_buffers(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let mut state = self.state.lock();
        let mut buffers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let handle = state.handle();
            state.command_buffers.insert(
                handle,
                HostCommandBuffer {
                    state: CmdState::Initial,
                    ops: Vec::new(),
                    bound: false,
                },
            );
            buffers.push(handle);
        }
        Ok(buffers)
    }

    fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.lock();
        for cmd in command_buffers {
            match state.command_buffers.remove(cmd) {
                Some(buffer) if buffer.state == CmdState::Pending => {
                    tracing::warn!("Freed pending command buffer {cmd:?}");
                }
                Some(_) => {}
                None => tracing::warn!("Freed unknown command buffer {cmd:?}"),
            }
        }
    }

    fn begin_simultaneous_use(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        let buffer = state.command_buffer(cmd)?;
        match buffer.state {
            CmdState::Initial | CmdState::Executable => {
                buffer.state = CmdState::Recording;
                buffer.ops.clear();
                buffer.bound = false;
                Ok(())
            }
            other => Err(GpuError::ContractViolation(format!(
                "begin on command buffer {cmd:?} in state {other:?}"
            ))),
        }
    }

    fn end(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        state.recording(cmd)?.state = CmdState::Executable;
        Ok(())
    }

    fn reset(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        let buffer = state.command_buffer(cmd)?;
        if buffer.state == CmdState::Pending {
            return Err(GpuError::ContractViolation(format!(
                "reset of pending command buffer {cmd:?}"
            )));
        }
        buffer.state = CmdState::Initial;
        buffer.ops.clear();
        buffer.bound = false;
        Ok(())
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.buffer(src)?;
        state.buffer(dst)?;
        state.recording(cmd)?.ops.push(HostOp::CopyBuffer {
            src,
            dst,
            regions: regions.to_vec(),
        });
        Ok(())
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.buffer(src)?;
        state.expect_layout(dst, layout)?;
        state.recording(cmd)?.ops.push(HostOp::CopyBufferToImage {
            src,
            dst,
            regions: regions.to_vec(),
        });
        Ok(())
    }

    fn cmd_copy_image_to_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.buffer(dst)?;
        state.expect_layout(src, layout)?;
        state.recording(cmd)?.ops.push(HostOp::CopyImageToBuffer {
            src,
            dst,
            regions: regions.to_vec(),
        });
        Ok(())
    }

    fn cmd_transition_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        new_layout: vk::ImageLayout,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.recording(cmd)?;
        state.image_mut(image)?.layout = new_layout;
        Ok(())
    }

    fn cmd_bind_compute(
        &self,
        cmd: vk::CommandBuffer,
        program: &ComputeProgram,
        set: vk::DescriptorSet,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if !state.programs.contains_key(&program.pipeline) {
            return Err(GpuError::ResourceNotFound(format!(
                "program {:?}",
                program.pipeline
            )));
        }
        let buffer = state.recording(cmd)?;
        buffer.bound = true;
        buffer.ops.push(HostOp::BindCompute {
            pipeline: program.pipeline,
            set,
        });
        Ok(())
    }

    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, x: u32, y: u32, z: u32) -> Result<()> {
        let mut state = self.state.lock();
        let buffer = state.recording(cmd)?;
        if !buffer.bound {
            return Err(GpuError::ContractViolation(format!(
                "dispatch on {cmd:?} without a bound program"
            )));
        }
        buffer.ops.push(HostOp::Dispatch { groups: [x, y, z] });
        Ok(())
    }

    fn create_compute_program(&self, shader: &ComputeShader<'_>) -> Result<ComputeProgram> {
        if shader.spirv.is_empty() {
            return Err(GpuError::ShaderCompilation(format!(
                "{}: empty SPIR-V",
                shader.name
            )));
        }
        let mut state = self.state.lock();
        let program = ComputeProgram {
            pipeline: state.handle(),
            layout: state.handle(),
            set_layout: state.handle(),
        };
        state.programs.insert(
            program.pipeline,
            HostProgram {
                name: shader.name.to_string(),
                bindings: shader.bindings.to_vec(),
            },
        );
        Ok(program)
    }

    fn destroy_compute_program(&self, program: &ComputeProgram) {
        self.state.lock().programs.remove(&program.pipeline);
    }

    fn allocate_descriptor_set(&self, program: &ComputeProgram) -> Result<vk::DescriptorSet> {
        let mut state = self.state.lock();
        if !state.programs.contains_key(&program.pipeline) {
            return Err(GpuError::ResourceNotFound(format!(
                "program {:?}",
                program.pipeline
            )));
        }
        let handle = state.handle();
        state.sets.insert(
            handle,
            HostSet {
                pipeline: program.pipeline,
                writes: BTreeMap::new(),
            },
        );
        Ok(handle)
    }

    fn free_descriptor_sets(&self, sets: &[vk::DescriptorSet]) {
        let mut state = self.state.lock();
        for set in sets {
            state.sets.remove(set);
        }
    }

    fn write_buffer_descriptor(
        &self,
        set: vk::DescriptorSet,
        binding: u32,
        ty: vk::DescriptorType,
        buffer: vk::Buffer,
        range: u64,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let len = state.buffer(buffer)?.len;
        if to_usize(range)? > len {
            return Err(GpuError::InvalidState(format!(
                "descriptor range {range} exceeds a {len} byte buffer"
            )));
        }
        let pipeline = state
            .sets
            .get(&set)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("descriptor set {set:?}")))?
            .pipeline;
        let declared = state
            .programs
            .get(&pipeline)
            .is_some_and(|p| p.bindings.contains(&DescriptorBinding { binding, ty }));
        if !declared {
            return Err(GpuError::InvalidState(format!(
                "binding {binding} ({ty:?}) is not part of the set layout"
            )));
        }
        if let Some(host_set) = state.sets.get_mut(&set) {
            host_set.writes.insert(binding, (buffer, range));
        }
        Ok(())
    }

    fn queue_count(&self) -> usize {
        self.queue_count
    }

    fn submit(&self, queue_index: usize, batches: &[SubmitInfo], fence: vk::Fence) -> Result<()> {
        if queue_index >= self.queue_count {
            return Err(GpuError::InvalidState(format!(
                "queue {queue_index} out of range ({} queues)",
                self.queue_count
            )));
        }
        let mut state = self.state.lock();

        let mut command_buffers = Vec::new();
        for batch in batches {
            if batch.wait_semaphores.len() != batch.wait_stages.len() {
                return Err(GpuError::InvalidState(format!(
                    "{} wait semaphores but {} wait stages",
                    batch.wait_semaphores.len(),
                    batch.wait_stages.len()
                )));
            }
            for cmd in &batch.command_buffers {
                let buffer = state.command_buffer(*cmd)?;
                if buffer.state != CmdState::Executable || command_buffers.contains(cmd) {
                    return Err(GpuError::ContractViolation(format!(
                        "submit of command buffer {cmd:?} in state {:?}",
                        buffer.state
                    )));
                }
                command_buffers.push(*cmd);
            }
        }
        if fence != vk::Fence::null() {
            let host_fence = state
                .fences
                .get(&fence)
                .ok_or_else(|| GpuError::ResourceNotFound(format!("fence {fence:?}")))?;
            if host_fence.signaled || host_fence.in_flight {
                return Err(GpuError::ContractViolation(format!(
                    "fence {fence:?} submitted while signalled or pending"
                )));
            }
        }

        for cmd in &command_buffers {
            state.command_buffer(*cmd)?.state = CmdState::Pending;
        }
        if let Some(host_fence) = state.fences.get_mut(&fence) {
            host_fence.in_flight = true;
        }
        state.submissions += 1;

        let submission = Submission {
            command_buffers,
            fence,
        };
        match state.mode {
            CompletionMode::Deferred => {
                state.queue.push_back(submission);
                Ok(())
            }
            CompletionMode::Immediate => {
                let outcome = state.execute(submission);
                drop(state);
                self.completed.notify_all();
                outcome
            }
        }
    }

    fn borrow_fence(&self) -> Result<vk::Fence> {
        let mut state = self.state.lock();
        let fence = match state.free_fences.pop() {
            Some(fence) => fence,
            None => {
                let fence = state.handle();
                state.fences.insert(fence, HostFence::default());
                fence
            }
        };
        if let Some(host_fence) = state.fences.get_mut(&fence) {
            host_fence.borrowed = true;
        }
        Ok(fence)
    }

    fn unborrow_fence(&self, fence: vk::Fence) -> Result<()> {
        let mut state = self.state.lock();
        let host_fence = state
            .fences
            .get_mut(&fence)
            .filter(|f| f.borrowed)
            .ok_or_else(|| {
                GpuError::ContractViolation(format!("fence {fence:?} was not borrowed"))
            })?;
        if host_fence.in_flight {
            return Err(GpuError::ContractViolation(format!(
                "fence {fence:?} returned while its submission is pending"
            )));
        }
        *host_fence = HostFence::default();
        state.free_fences.push(fence);
        Ok(())
    }

    fn fence_status(&self, fence: vk::Fence) -> Result<bool> {
        self.state.lock().fences_ready(&[fence], true)
    }

    fn wait_for_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> Result<bool> {
        if fences.is_empty() {
            return Err(GpuError::InvalidState("wait on zero fences".to_string()));
        }
        let deadline = Instant::now().checked_add(Duration::from_nanos(timeout_ns));
        let mut state = self.state.lock();
        loop {
            if state.fences_ready(fences, wait_all)? {
                return Ok(true);
            }
            match deadline {
                Some(deadline) => {
                    if self.completed.wait_until(&mut state, deadline).timed_out() {
                        return state.fences_ready(fences, wait_all);
                    }
                }
                None => self.completed.wait(&mut state),
            }
        }
    }

    /// Runs every queued submission, as a real device would drain its queues.
    fn wait_idle(&self) -> Result<()> {
        self.complete_pending().map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_buffer(device: &HostDevice, size: u64) -> vk::Buffer {
        device
            .create_buffer(&BufferDesc {
                name: "test",
                size,
                usage: vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
                location: MemoryLocation::CpuToGpu,
            })
            .unwrap()
    }

    fn recorded_copy(device: &HostDevice, src: vk::Buffer, dst: vk::Buffer, size: u64) -> vk::CommandBuffer {
        let cmd = device.allocate_command_buffers(1).unwrap()[0];
        device.begin_simultaneous_use(cmd).unwrap();
        device
            .cmd_copy_buffer(
                cmd,
                src,
                dst,
                &[vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size,
                }],
            )
            .unwrap();
        device.end(cmd).unwrap();
        cmd
    }

    #[test]
    fn buffer_copy_executes_on_submit() {
        let device = HostDevice::new();
        let src = host_buffer(&device, 16);
        let dst = host_buffer(&device, 16);
        device.write_buffer(src, 0, &[7u8; 16]).unwrap();

        let cmd = recorded_copy(&device, src, dst, 16);
        let fence = device.borrow_fence().unwrap();
        device
            .submit(0, &[SubmitInfo::with_command_buffer(cmd)], fence)
            .unwrap();

        assert!(device.fence_status(fence).unwrap());
        assert_eq!(device.buffer_contents(dst).unwrap(), vec![7u8; 16]);
        device.unborrow_fence(fence).unwrap();
        assert!(!device.fence_status(fence).unwrap());
    }

    #[test]
    fn mapped_writes_are_visible_to_copies() {
        let device = HostDevice::new();
        let src = host_buffer(&device, 4);
        let dst = host_buffer(&device, 4);
        let ptr = device.mapped_ptr(src).unwrap();
        unsafe { std::ptr::copy_nonoverlapping([1u8, 2, 3, 4].as_ptr(), ptr.as_ptr(), 4) };

        let cmd = recorded_copy(&device, src, dst, 4);
        device
            .submit(0, &[SubmitInfo::with_command_buffer(cmd)], vk::Fence::null())
            .unwrap();
        assert_eq!(device.buffer_contents(dst).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn deferred_submission_signals_on_completion() {
        let device = HostDevice::with_mode(CompletionMode::Deferred);
        let src = host_buffer(&device, 8);
        let dst = host_buffer(&device, 8);
        device.write_buffer(src, 0, &[3u8; 8]).unwrap();
        let cmd = recorded_copy(&device, src, dst, 8);
        let fence = device.borrow_fence().unwrap();
        device
            .submit(0, &[SubmitInfo::with_command_buffer(cmd)], fence)
            .unwrap();

        assert_eq!(device.pending_submissions(), 1);
        assert!(!device.fence_status(fence).unwrap());
        assert!(!device.wait_for_fences(&[fence], false, 1_000_000).unwrap());
        assert!(device.unborrow_fence(fence).is_err());
        assert!(device.reset(cmd).is_err());

        assert!(device.complete_next().unwrap());
        assert!(!device.complete_next().unwrap());
        assert!(device.wait_for_fences(&[fence], true, 0).unwrap());
        assert_eq!(device.buffer_contents(dst).unwrap(), vec![3u8; 8]);
    }

    #[test]
    fn command_buffer_state_is_enforced() {
        let device = HostDevice::new();
        let src = host_buffer(&device, 4);
        let cmd = device.allocate_command_buffers(1).unwrap()[0];

        assert!(device.end(cmd).is_err());
        device.begin_simultaneous_use(cmd).unwrap();
        assert!(device.begin_simultaneous_use(cmd).is_err());
        assert!(device
            .submit(0, &[SubmitInfo::with_command_buffer(cmd)], vk::Fence::null())
            .is_err());
        device.end(cmd).unwrap();
        assert!(device
            .cmd_copy_buffer(cmd, src, src, &[vk::BufferCopy::default()])
            .is_err());
        assert!(device
            .submit(1, &[SubmitInfo::with_command_buffer(cmd)], vk::Fence::null())
            .is_err());

        device.reset(cmd).unwrap();
        assert!(device.end(cmd).is_err());
    }

    #[test]
    fn image_copies_follow_regions_and_layouts() {
        let device = HostDevice::new();
        let image = device
            .create_image(&ImageDesc {
                name: "texture",
                format: vk::Format::R8G8B8A8_UNORM,
                extent: vk::Extent3D {
                    width: 4,
                    height: 2,
                    depth: 1,
                },
                usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::TRANSFER_SRC,
            })
            .unwrap();
        let upload = host_buffer(&device, 32);
        let download = host_buffer(&device, 32);
        let texels: Vec<u8> = (0..32).collect();
        device.write_buffer(upload, 0, &texels).unwrap();

        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D {
                width: 4,
                height: 2,
                depth: 1,
            },
        };

        let cmd = device.allocate_command_buffers(1).unwrap()[0];
        device.begin_simultaneous_use(cmd).unwrap();
        assert!(device
            .cmd_copy_buffer_to_image(cmd, upload, image, vk::ImageLayout::TRANSFER_DST_OPTIMAL, &[region])
            .is_err());
        device
            .cmd_transition_image(cmd, image, vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .unwrap();
        device
            .cmd_copy_buffer_to_image(cmd, upload, image, vk::ImageLayout::TRANSFER_DST_OPTIMAL, &[region])
            .unwrap();
        device
            .cmd_transition_image(cmd, image, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .unwrap();

        // Only the right half of the second row comes back.
        let partial = vk::BufferImageCopy {
            buffer_offset: 8,
            image_offset: vk::Offset3D { x: 2, y: 1, z: 0 },
            image_extent: vk::Extent3D {
                width: 2,
                height: 1,
                depth: 1,
            },
            ..region
        };
        device
            .cmd_copy_image_to_buffer(cmd, image, vk::ImageLayout::TRANSFER_SRC_OPTIMAL, download, &[partial])
            .unwrap();
        device.end(cmd).unwrap();
        device
            .submit(0, &[SubmitInfo::with_command_buffer(cmd)], vk::Fence::null())
            .unwrap();

        assert_eq!(device.image_contents(image).unwrap(), texels);
        assert_eq!(
            device.image_layout(image).unwrap(),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL
        );
        let out = device.buffer_contents(download).unwrap();
        assert_eq!(&out[8..16], &texels[24..32]);
        assert!(out[..8].iter().all(|b| *b == 0));
    }

    #[test]
    fn kernels_run_on_dispatch() {
        let device = HostDevice::new();
        device.register_kernel("double", |_groups, bindings| {
            let input = bindings[&0].clone();
            if let Some(output) = bindings.get_mut(&1) {
                for (o, i) in output.iter_mut().zip(input) {
                    *o = i * 2;
                }
            }
        });
        let bindings = [
            DescriptorBinding::storage_buffer(0),
            DescriptorBinding::storage_buffer(1),
        ];
        let program = device
            .create_compute_program(&ComputeShader {
                name: "double",
                spirv: &[0x0723_0203],
                bindings: &bindings,
            })
            .unwrap();
        let input = host_buffer(&device, 4);
        let output = host_buffer(&device, 4);
        device.write_buffer(input, 0, &[1, 2, 3, 4]).unwrap();

        let set = device.allocate_descriptor_set(&program).unwrap();
        device
            .write_buffer_descriptor(set, 0, vk::DescriptorType::STORAGE_BUFFER, input, 4)
            .unwrap();
        device
            .write_buffer_descriptor(set, 1, vk::DescriptorType::STORAGE_BUFFER, output, 4)
            .unwrap();
        assert!(device
            .write_buffer_descriptor(set, 2, vk::DescriptorType::UNIFORM_BUFFER, output, 4)
            .is_err());

        let cmd = device.allocate_command_buffers(1).unwrap()[0];
        device.begin_simultaneous_use(cmd).unwrap();
        assert!(device.cmd_dispatch(cmd, 1, 1, 1).is_err());
        device.cmd_bind_compute(cmd, &program, set).unwrap();
        device.cmd_dispatch(cmd, 1, 1, 1).unwrap();
        device.end(cmd).unwrap();
        device
            .submit(0, &[SubmitInfo::with_command_buffer(cmd)], vk::Fence::null())
            .unwrap();

        assert_eq!(device.dispatch_count(), 1);
        assert_eq!(device.buffer_contents(output).unwrap(), vec![2, 4, 6, 8]);
    }

    #[test]
    fn gpu_only_buffers_are_not_mappable() {
        let device = HostDevice::new();
        let buffer = device
            .create_buffer(&BufferDesc {
                name: "device-local",
                size: 64,
                usage: vk::BufferUsageFlags::STORAGE_BUFFER,
                location: MemoryLocation::GpuOnly,
            })
            .unwrap();
        assert!(device.mapped_ptr(buffer).is_err());
        device.destroy_buffer(buffer).unwrap();
        assert_eq!(device.live_buffers(), 0);
        assert!(device.destroy_buffer(buffer).is_err());
    }

    #[test]
    fn memory_budget_limits_live_buffers() {
        let device = HostDevice::new();
        device.set_memory_budget(Some(96));
        let desc = BufferDesc {
            name: "budgeted",
            size: 64,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER,
            location: MemoryLocation::GpuOnly,
        };
        let first = device.create_buffer(&desc).unwrap();
        assert!(matches!(
            device.create_buffer(&desc),
            Err(GpuError::AllocationFailed(_))
        ));
        device.destroy_buffer(first).unwrap();
        let second = device.create_buffer(&desc).unwrap();
        device.set_memory_budget(None);
        device.create_buffer(&desc).unwrap();
        assert_eq!(device.live_buffers(), 2);
        device.destroy_buffer(second).unwrap();
    }
}
