//! Compute block scheduling.
//!
//! A [`ComputePipeline`] owns an arena of [`ComputeBlock`]s. Callers take
//! blocks with [`ComputePipeline::new_blocks`], fill them, submit them with
//! [`ComputePipeline::enqueue_blocks`] or [`ComputePipeline::enqueue_chain`],
//! observe completion with [`ComputePipeline::poll`] and hand them back with
//! [`ComputePipeline::delete_blocks`].
//!
//! Pipelines can be chained. A chained submission carries the work of every
//! link in one batch guarded by one fence, which only the first pipeline
//! holds. The others keep child wait-list entries that retire with it.
//! No barrier is inserted between links.

use crate::block::{BlockCounts, BlockId, BlockSet, BlockVec, ComputeBlock};
use crate::fence::{ChainLink, ComputeFence, WaitOutcome};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use volcano_gpu::{
    vk, BufferDesc, ComputeProgram, ComputeShader, DescriptorBinding, GpuDevice, GpuError,
    MemoryLocation, Result, SubmitInfo,
};

/// First word of every SPIR-V module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Named SPIR-V code of a compute shader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeShaderSource {
    pub name: String,
    pub spirv: Vec<u32>,
}

impl ComputeShaderSource {
    pub fn new(name: impl Into<String>, spirv: Vec<u32>) -> Self {
        Self {
            name: name.into(),
            spirv,
        }
    }

    /// Parse a little-endian `.spv` file.
    pub fn from_spirv_bytes(name: impl Into<String>, bytes: &[u8]) -> Result<Self> {
        let name = name.into();
        if bytes.is_empty() || bytes.len() % 4 != 0 {
            return Err(GpuError::ShaderCompilation(format!(
                "{name}: {} bytes is not a whole number of SPIR-V words",
                bytes.len()
            )));
        }
        let spirv: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect();
        if spirv[0] != SPIRV_MAGIC {
            return Err(GpuError::ShaderCompilation(format!(
                "{name}: bad SPIR-V magic {:#010x}",
                spirv[0]
            )));
        }
        Ok(Self { name, spirv })
    }
}

/// Shape of the blocks and uniform of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeConfig {
    /// Bytes of each block's input buffer. Zero for none.
    pub block_in_size: u64,
    /// Bytes of each block's output buffer. Zero for none.
    pub block_out_size: u64,
    /// Binding of the input buffer. The output binds at `binding_in + 1`.
    pub binding_in: u32,
    pub ubo_binding: u32,
    /// Bytes of the uniform buffer shared by all blocks. Zero for none.
    pub ubo_size: u64,
    pub queue_index: usize,
    /// Free blocks `init` allocates.
    pub next_size: usize,
    /// Prefix of buffer debug names.
    pub debug_name: String,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            block_in_size: 0,
            block_out_size: 0,
            binding_in: 0,
            ubo_binding: 2,
            ubo_size: 0,
            queue_index: 0,
            next_size: 3,
            debug_name: "compute".to_string(),
        }
    }
}

impl ComputeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_in_size(mut self, bytes: u64) -> Self {
        self.block_in_size = bytes;
        self
    }

    pub fn block_out_size(mut self, bytes: u64) -> Self {
        self.block_out_size = bytes;
        self
    }

    pub fn binding_in(mut self, binding: u32) -> Self {
        self.binding_in = binding;
        self
    }

    pub fn ubo(mut self, binding: u32, bytes: u64) -> Self {
        self.ubo_binding = binding;
        self.ubo_size = bytes;
        self
    }

    pub fn queue_index(mut self, index: usize) -> Self {
        self.queue_index = index;
        self
    }

    pub fn next_size(mut self, count: usize) -> Self {
        self.next_size = count;
        self
    }

    pub fn debug_name(mut self, name: impl Into<String>) -> Self {
        self.debug_name = name.into();
        self
    }

    /// Descriptor set 0 of the shader.
    pub fn bindings(&self) -> Result<Vec<DescriptorBinding>> {
        let mut bindings = Vec::with_capacity(3);
        if self.block_in_size > 0 {
            bindings.push(DescriptorBinding::storage_buffer(self.binding_in));
        }
        if self.block_out_size > 0 {
            bindings.push(DescriptorBinding::storage_buffer(self.binding_in + 1));
        }
        if self.ubo_size > 0 {
            if bindings.iter().any(|b| b.binding == self.ubo_binding) {
                return Err(GpuError::InvalidState(format!(
                    "uniform binding {} collides with a block buffer",
                    self.ubo_binding
                )));
            }
            bindings.push(DescriptorBinding::uniform_buffer(self.ubo_binding));
        }
        Ok(bindings)
    }
}

struct PipelineState {
    program: Option<ComputeProgram>,
    uniform: Option<vk::Buffer>,
    blocks: Vec<ComputeBlock>,
    wait_list: Vec<ComputeFence>,
    next_size: usize,
    chain: Option<Arc<ComputePipeline>>,
}

impl PipelineState {
    fn new(next_size: usize) -> Self {
        Self {
            program: None,
            uniform: None,
            blocks: Vec::new(),
            wait_list: Vec::new(),
            next_size,
            chain: None,
        }
    }

    fn counts(&self) -> BlockCounts {
        let mut counts = BlockCounts::default();
        for block in &self.blocks {
            counts.add(block.set);
        }
        counts
    }

    fn free_count(&self) -> usize {
        self.blocks.iter().filter(|b| b.set == BlockSet::Free).count()
    }

    fn block(&self, id: BlockId) -> Result<&ComputeBlock> {
        self.blocks
            .get(id.0)
            .ok_or_else(|| GpuError::ResourceNotFound(id.to_string()))
    }

    fn check_running(&self, blocks: &[BlockId]) -> Result<()> {
        for id in blocks {
            if self.block(*id)?.set != BlockSet::Run {
                tracing::error!("Retiring {id}, which is not running");
                return Err(GpuError::InvalidState(format!("{id} is not running")));
            }
        }
        Ok(())
    }

    /// Move checked `blocks` from `Run` to `Done`.
    fn finish(&mut self, blocks: &[BlockId]) {
        for id in blocks {
            self.blocks[id.0].set = BlockSet::Done;
        }
    }

    fn child_entry(&self, link: ChainLink) -> Option<usize> {
        self.wait_list
            .iter()
            .position(|e| e.fence.is_none() && e.link == link)
    }
}

/// Schedules blocks of one compute shader.
pub struct ComputePipeline {
    device: Arc<dyn GpuDevice>,
    config: ComputeConfig,
    shader: ComputeShaderSource,
    state: Mutex<PipelineState>,
}

impl ComputePipeline {
    /// Create an empty pipeline. Nothing is allocated until
    /// [`Self::alloc_blocks`] or [`Self::init`].
    pub fn new(
        device: Arc<dyn GpuDevice>,
        shader: ComputeShaderSource,
        config: ComputeConfig,
    ) -> Self {
        let next_size = config.next_size;
        Self {
            device,
            config,
            shader,
            state: Mutex::new(PipelineState::new(next_size)),
        }
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub fn config(&self) -> &ComputeConfig {
        &self.config
    }

    pub fn shader_name(&self) -> &str {
        &self.shader.name
    }

    /// Grow the free set to at least `min_size` blocks.
    ///
    /// New blocks are initialised right away once [`Self::init`] has run.
    pub fn alloc_blocks(&self, min_size: usize) -> Result<()> {
        let mut state = self.state.lock();
        Self::grow_free(&mut state, min_size);
        let Some(program) = state.program else {
            return Ok(());
        };
        let uniform = state.uniform;
        self.init_blocks(&mut state, program, uniform)
    }

    fn grow_free(state: &mut PipelineState, min_size: usize) {
        let mut free = state.free_count();
        if min_size < free {
            tracing::warn!("alloc_blocks({min_size}) cannot shrink {free} free blocks");
        }
        while free < min_size {
            state.blocks.push(ComputeBlock::new());
            free += 1;
        }
    }

    /// Create the program, the uniform buffer and `next_size` blocks.
    /// Can only run once. On failure everything it created is freed and the
    /// call can be retried.
    pub fn init(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.program.is_some() {
            tracing::error!("ComputePipeline {} initialised twice", self.shader.name);
            return Err(GpuError::InvalidState(format!(
                "pipeline {} already initialised",
                self.shader.name
            )));
        }
        if self.shader.spirv.is_empty() {
            return Err(GpuError::InvalidState(format!(
                "pipeline {} has no SPIR-V",
                self.shader.name
            )));
        }

        let bindings = self.config.bindings()?;
        let program = self.device.create_compute_program(&ComputeShader {
            name: &self.shader.name,
            spirv: &self.shader.spirv,
            bindings: &bindings,
        })?;

        let mut uniform = None;
        if self.config.ubo_size > 0 {
            let name = format!("{}.uniform", self.config.debug_name);
            let created = self.device.create_buffer(&BufferDesc {
                name: &name,
                size: self.config.ubo_size,
                usage: vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
                location: MemoryLocation::GpuOnly,
            });
            match created {
                Ok(buffer) => uniform = Some(buffer),
                Err(e) => {
                    self.device.destroy_compute_program(&program);
                    return Err(e);
                }
            }
        }

        let next_size = state.next_size;
        Self::grow_free(&mut state, next_size);
        if let Err(e) = self.init_blocks(&mut state, program, uniform) {
            for block in &mut state.blocks {
                self.release_block(block);
            }
            if let Some(buffer) = uniform {
                self.destroy_buffer_logged(buffer);
            }
            self.device.destroy_compute_program(&program);
            return Err(e);
        }
        state.program = Some(program);
        state.uniform = uniform;
        tracing::debug!(
            "ComputePipeline {} ready with {} blocks",
            self.shader.name,
            state.blocks.len()
        );
        Ok(())
    }

    /// Give every uninitialised block its buffers, descriptor set and
    /// command buffers.
    fn init_blocks(
        &self,
        state: &mut PipelineState,
        program: ComputeProgram,
        uniform: Option<vk::Buffer>,
    ) -> Result<()> {
        let pending: Vec<usize> = state
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.initialized)
            .map(|(i, _)| i)
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let count = u32::try_from(pending.len() * 2)
            .map_err(|_| GpuError::InvalidState(format!("{} blocks", pending.len())))?;
        let mut cmds = self.device.allocate_command_buffers(count)?.into_iter();
        for index in pending {
            let (Some(cmd), Some(cmd_post)) = (cmds.next(), cmds.next()) else {
                return Err(GpuError::AllocationFailed(
                    "too few command buffers for blocks".to_string(),
                ));
            };
            let block = &mut state.blocks[index];
            if let Err(e) = self.init_block(block, index, &program, uniform, cmd, cmd_post) {
                tracing::error!("Initialising block {index} failed: {e}");
                self.release_block(block);
                let unused: Vec<vk::CommandBuffer> = cmds.collect();
                self.device.free_command_buffers(&unused);
                return Err(e);
            }
        }
        Ok(())
    }

    fn init_block(
        &self,
        block: &mut ComputeBlock,
        index: usize,
        program: &ComputeProgram,
        uniform: Option<vk::Buffer>,
        cmd: vk::CommandBuffer,
        cmd_post: vk::CommandBuffer,
    ) -> Result<()> {
        let device = &self.device;
        let config = &self.config;
        block.cmd = cmd;
        block.cmd_post = cmd_post;

        let set = device.allocate_descriptor_set(program)?;
        block.descriptor_set = set;

        let name = format!("{}.blocks[{index}]", config.debug_name);
        let usage = vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::TRANSFER_SRC
            | vk::BufferUsageFlags::TRANSFER_DST;
        let io = [
            (config.block_in_size, config.binding_in, ".i"),
            (config.block_out_size, config.binding_in + 1, ".o"),
        ];
        for (size, binding, suffix) in io {
            if size == 0 {
                continue;
            }
            let buffer = device.create_buffer(&BufferDesc {
                name: &format!("{name}{suffix}"),
                size,
                usage,
                location: MemoryLocation::GpuOnly,
            })?;
            if binding == config.binding_in {
                block.input = Some(buffer);
            } else {
                block.output = Some(buffer);
            }
            device.write_buffer_descriptor(
                set,
                binding,
                vk::DescriptorType::STORAGE_BUFFER,
                buffer,
                size,
            )?;
        }
        if let Some(ubo) = uniform {
            device.write_buffer_descriptor(
                set,
                config.ubo_binding,
                vk::DescriptorType::UNIFORM_BUFFER,
                ubo,
                config.ubo_size,
            )?;
        }

        device.begin_simultaneous_use(cmd)?;
        device.begin_simultaneous_use(cmd_post)?;
        block.initialized = true;
        Ok(())
    }

    /// Free whatever device objects a block holds and mark it uninitialised.
    fn release_block(&self, block: &mut ComputeBlock) {
        let device = &self.device;
        let cmds: Vec<vk::CommandBuffer> = [block.cmd, block.cmd_post]
            .into_iter()
            .filter(|c| *c != vk::CommandBuffer::null())
            .collect();
        device.free_command_buffers(&cmds);
        if block.descriptor_set != vk::DescriptorSet::null() {
            device.free_descriptor_sets(&[block.descriptor_set]);
        }
        for buffer in [block.input.take(), block.output.take()].into_iter().flatten() {
            self.destroy_buffer_logged(buffer);
        }
        block.cmd = vk::CommandBuffer::null();
        block.cmd_post = vk::CommandBuffer::null();
        block.descriptor_set = vk::DescriptorSet::null();
        block.initialized = false;
    }

    fn destroy_buffer_logged(&self, buffer: vk::Buffer) {
        if let Err(e) = self.device.destroy_buffer(buffer) {
            tracing::warn!("Failed to destroy buffer of {}: {e}", self.shader.name);
        }
    }

    /// Move `n` free blocks to `Prep` and return them.
    pub fn new_blocks(&self, n: usize) -> Result<BlockVec> {
        let mut state = self.state.lock();
        if state.program.is_none() {
            return Err(GpuError::InvalidState(format!(
                "new_blocks on {} before init",
                self.shader.name
            )));
        }
        let free: BlockVec = state
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.set == BlockSet::Free && b.initialized)
            .map(|(i, _)| BlockId(i))
            .take(n)
            .collect();
        if free.len() < n {
            tracing::warn!("new_blocks({n}): only {} free", free.len());
            return Err(GpuError::PoolExhausted {
                what: "compute blocks",
                requested: n,
                available: free.len(),
            });
        }
        for id in &free {
            state.blocks[id.0].set = BlockSet::Prep;
        }
        Ok(free)
    }

    /// Run `f` on a block while holding the pipeline lock.
    pub fn with_block<R>(&self, id: BlockId, f: impl FnOnce(&mut ComputeBlock) -> R) -> Result<R> {
        let mut state = self.state.lock();
        let block = state
            .blocks
            .get_mut(id.0)
            .ok_or_else(|| GpuError::ResourceNotFound(id.to_string()))?;
        Ok(f(block))
    }

    pub fn block_set(&self, id: BlockId) -> Result<BlockSet> {
        Ok(self.state.lock().block(id)?.set)
    }

    /// Submit `blocks` with a pooled fence.
    pub fn enqueue_blocks(&self, blocks: &BlockVec, submit: &mut SubmitInfo) -> Result<()> {
        self.enqueue_chain(&[blocks], submit)
    }

    /// Submit `work[0]` on this pipeline and `work[i]` on the i-th chained
    /// pipeline as one batch.
    ///
    /// Dispatches are appended to `submit`, which is then submitted with a
    /// borrowed fence. On failure every block stays in `Prep` and `submit`
    /// is restored.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn enqueue_chain(&self, work: &[&BlockVec], submit: &mut SubmitInfo) -> Result<()> {
        if work.is_empty() {
            return Err(GpuError::InvalidState("enqueue_chain with no work".to_string()));
        }

        let mut links = Vec::with_capacity(work.len() - 1);
        let mut next = self.state.lock().chain.clone();
        while links.len() + 1 < work.len() {
            let Some(link) = next else {
                tracing::error!(
                    "enqueue_chain: {} work lists but only {} chain links",
                    work.len(),
                    links.len()
                );
                return Err(GpuError::InvalidState(format!(
                    "{} work lists for a chain of {}",
                    work.len(),
                    links.len() + 1
                )));
            };
            next = link.state.lock().chain.clone();
            links.push(link);
        }

        let pipelines: Vec<&Self> = std::iter::once(self)
            .chain(links.iter().map(|p| &**p))
            .collect();
        // Parent before child.
        let mut guards: Vec<MutexGuard<'_, PipelineState>> =
            pipelines.iter().map(|p| p.state.lock()).collect();

        for ((pipeline, state), blocks) in pipelines.iter().zip(&guards).zip(work) {
            pipeline.validate_prep(state, blocks)?;
        }

        let submitted_len = submit.command_buffers.len();
        let mut moved: Vec<(usize, BlockId)> = Vec::new();
        let outcome = self.record_and_submit(&pipelines, &mut guards, work, submit, &mut moved);
        let fence = match outcome {
            Ok(fence) => fence,
            Err(e) => {
                tracing::error!("enqueue_chain on {} failed: {e}", self.shader.name);
                for (k, id) in &moved {
                    let block = &mut guards[*k].blocks[id.0];
                    block.set = BlockSet::Prep;
                    pipelines[*k].recycle(block);
                }
                submit.command_buffers.truncate(submitted_len);
                return Err(e);
            }
        };

        let link = ChainLink::next();
        guards[0]
            .wait_list
            .push(ComputeFence::root(fence, link, work[0].clone(), links.clone()));
        for (state, blocks) in guards.iter_mut().zip(work).skip(1) {
            state.wait_list.push(ComputeFence::child(link, (*blocks).clone()));
        }
        tracing::trace!(
            "Submitted {} blocks across {} pipelines",
            moved.len(),
            work.len()
        );
        Ok(())
    }

    fn validate_prep(&self, state: &PipelineState, blocks: &[BlockId]) -> Result<()> {
        let program_ready = state.program.is_some();
        for (j, id) in blocks.iter().enumerate() {
            let block = state.block(*id)?;
            let problem = if !program_ready || !block.initialized {
                Some("is not initialised")
            } else if block.set != BlockSet::Prep {
                Some("is not in Prep")
            } else if blocks[..j].contains(id) {
                Some("is listed twice")
            } else if !block.work.is_valid() {
                Some("has an empty work size")
            } else if block.dispatch_flight().is_some_and(|f| !f.is_flushed()) {
                Some("has a flight that was not flushed")
            } else {
                None
            };
            if let Some(problem) = problem {
                tracing::error!("enqueue on {}: {id} {problem}", self.shader.name);
                return Err(GpuError::ContractViolation(format!("{id} {problem}")));
            }
        }
        Ok(())
    }

    fn record_and_submit(
        &self,
        pipelines: &[&Self],
        guards: &mut [MutexGuard<'_, PipelineState>],
        work: &[&BlockVec],
        submit: &mut SubmitInfo,
        moved: &mut Vec<(usize, BlockId)>,
    ) -> Result<vk::Fence> {
        for (k, blocks) in work.iter().enumerate() {
            let pipeline = pipelines[k];
            let state = &mut guards[k];
            let program = state
                .program
                .ok_or_else(|| GpuError::InvalidState("pipeline not initialised".to_string()))?;
            for id in blocks.iter() {
                let block = &mut state.blocks[id.0];
                block.set = BlockSet::Run;
                moved.push((k, *id));
                pipeline.record_dispatch(block, &program, submit)?;
            }
        }

        let fence = self.device.borrow_fence()?;
        if let Err(e) = self
            .device
            .submit(self.config.queue_index, std::slice::from_ref(submit), fence)
        {
            if let Err(unborrow) = self.device.unborrow_fence(fence) {
                tracing::warn!("Fence {fence:?} kept after a failed submit: {unborrow}");
            }
            return Err(e);
        }
        Ok(fence)
    }

    fn record_dispatch(
        &self,
        block: &ComputeBlock,
        program: &ComputeProgram,
        submit: &mut SubmitInfo,
    ) -> Result<()> {
        let device = &self.device;
        let cmd = block
            .dispatch_flight()
            .map_or(block.cmd, volcano_memory::Flight::command_buffer);
        let work = block.work;
        device.cmd_bind_compute(cmd, program, block.descriptor_set)?;
        device.cmd_dispatch(cmd, work.x, work.y, work.z)?;
        device.end(cmd)?;
        submit.push(cmd);
        device.end(block.cmd_post)?;
        submit.push(block.cmd_post);
        Ok(())
    }

    /// Put a block's own command buffers back into the recording state.
    fn try_recycle(&self, block: &ComputeBlock) -> Result<()> {
        for cmd in [block.cmd, block.cmd_post] {
            self.device.reset(cmd)?;
            self.device.begin_simultaneous_use(cmd)?;
        }
        Ok(())
    }

    fn recycle(&self, block: &ComputeBlock) {
        if let Err(e) = self.try_recycle(block) {
            tracing::warn!("Recycling the command buffers of a block failed: {e}");
        }
    }

    /// Retire every root entry whose fence has signalled. Never blocks.
    pub fn poll(&self) -> Result<()> {
        let mut state = self.state.lock();
        let mut i = 0;
        while i < state.wait_list.len() {
            let Some(fence) = state.wait_list[i].fence else {
                i += 1;
                continue;
            };
            if self.device.fence_status(fence)? {
                self.retire_locked(&mut state, i)?;
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    /// Block until any root fence signals or `nanos` pass. Blocks do not
    /// move; call [`Self::poll`] afterwards.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait(&self, nanos: u64) -> Result<WaitOutcome> {
        let fences: Vec<vk::Fence> = self
            .state
            .lock()
            .wait_list
            .iter()
            .filter_map(|e| e.fence)
            .collect();
        if fences.is_empty() {
            tracing::error!("ComputePipeline {}: wait with no fences", self.shader.name);
            return Err(GpuError::InvalidState("nothing to wait for".to_string()));
        }
        if self.device.wait_for_fences(&fences, false, nanos)? {
            Ok(WaitOutcome::Ready)
        } else {
            Ok(WaitOutcome::TimedOut)
        }
    }

    /// Retire root entry `index` and the matching entries of the pipelines
    /// it was submitted to. Nothing changes unless every entry is found.
    pub fn retire(&self, index: usize) -> Result<()> {
        let mut state = self.state.lock();
        self.retire_locked(&mut state, index)
    }

    fn retire_locked(&self, state: &mut PipelineState, index: usize) -> Result<()> {
        let entry = state.wait_list.get(index).ok_or_else(|| {
            GpuError::InvalidState(format!(
                "wait entry {index} of {}",
                state.wait_list.len()
            ))
        })?;
        let Some(fence) = entry.fence else {
            tracing::error!("retire({index}) on a chained entry of {}", self.shader.name);
            return Err(GpuError::ContractViolation(
                "chained entries retire through their root".to_string(),
            ));
        };
        let link = entry.link;
        let chain = entry.chain.clone();

        let mut guards: Vec<MutexGuard<'_, PipelineState>> =
            chain.iter().map(|p| p.state.lock()).collect();
        let mut positions = Vec::with_capacity(guards.len());
        for (depth, child) in guards.iter().enumerate() {
            let position = child.child_entry(link).ok_or_else(|| {
                tracing::error!("{} lost chained entry {link:?}", chain[depth].shader.name);
                GpuError::InvalidState(format!("chain link {} has no entry", depth + 1))
            })?;
            child.check_running(&child.wait_list[position].blocks)?;
            positions.push(position);
        }
        state.check_running(&state.wait_list[index].blocks)?;

        for (child, position) in guards.iter_mut().zip(positions) {
            let entry = child.wait_list.remove(position);
            child.finish(&entry.blocks);
        }
        let entry = state.wait_list.remove(index);
        state.finish(&entry.blocks);
        drop(guards);
        self.device.unborrow_fence(fence)
    }

    /// Return `Done` or `Prep` blocks to the free set and clear `blocks`.
    ///
    /// Drops each block's transfer, which releases its stage source.
    pub fn delete_blocks(&self, blocks: &mut BlockVec) -> Result<()> {
        let mut state = self.state.lock();
        for (j, id) in blocks.iter().enumerate() {
            let set = state.block(*id)?.set;
            if !matches!(set, BlockSet::Done | BlockSet::Prep) || blocks[..j].contains(id) {
                tracing::error!("delete_blocks: {id} is {set:?}");
                return Err(GpuError::ContractViolation(format!(
                    "{id} is {set:?}, not Done or Prep"
                )));
            }
        }

        // Recycling can be repeated, so a failure leaves every block as it was.
        for id in blocks.iter() {
            let block = &state.blocks[id.0];
            if block.set == BlockSet::Done {
                self.try_recycle(block)?;
            }
        }
        for id in blocks.iter() {
            let block = &mut state.blocks[id.0];
            block.flight = None;
            block.set = BlockSet::Free;
        }
        blocks.clear();
        Ok(())
    }

    /// Chain `child` after this pipeline. Cycles are rejected, and so is
    /// changing the chain while this pipeline has wait-list entries.
    pub fn set_chain(&self, child: Arc<Self>) -> Result<()> {
        let mut cursor = Some(Arc::clone(&child));
        while let Some(pipeline) = cursor {
            if std::ptr::eq(&*pipeline, self) {
                return Err(GpuError::InvalidState(format!(
                    "chaining {} after {} makes a cycle",
                    child.shader.name, self.shader.name
                )));
            }
            cursor = pipeline.state.lock().chain.clone();
        }
        self.replace_chain(Some(child))
    }

    pub fn clear_chain(&self) -> Result<()> {
        self.replace_chain(None)
    }

    fn replace_chain(&self, chain: Option<Arc<Self>>) -> Result<()> {
        let mut state = self.state.lock();
        if !state.wait_list.is_empty() {
            tracing::error!(
                "Changing the chain of {} with {} wait-list entries",
                self.shader.name,
                state.wait_list.len()
            );
            return Err(GpuError::InvalidState(format!(
                "{} has submissions in flight",
                self.shader.name
            )));
        }
        state.chain = chain;
        Ok(())
    }

    pub fn chain(&self) -> Option<Arc<Self>> {
        self.state.lock().chain.clone()
    }

    pub fn set_next_size(&self, count: usize) {
        self.state.lock().next_size = count;
    }

    pub fn next_size(&self) -> usize {
        self.state.lock().next_size
    }

    pub fn counts(&self) -> BlockCounts {
        self.state.lock().counts()
    }

    pub fn total_blocks(&self) -> usize {
        self.state.lock().blocks.len()
    }

    /// Wait-list entries that hold a fence.
    pub fn pending_fences(&self) -> usize {
        self.state
            .lock()
            .wait_list
            .iter()
            .filter(|e| e.is_root())
            .count()
    }

    /// Wait-list entries, roots and chained.
    pub fn wait_entries(&self) -> usize {
        self.state.lock().wait_list.len()
    }

    pub fn uniform_buffer(&self) -> Option<vk::Buffer> {
        self.state.lock().uniform
    }

    pub fn program(&self) -> Option<ComputeProgram> {
        self.state.lock().program
    }
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        let mut state = std::mem::replace(self.state.get_mut(), PipelineState::new(0));
        let running = state.counts().run;
        if running > 0 || !state.wait_list.is_empty() {
            tracing::warn!(
                "ComputePipeline {} dropped with {running} blocks running",
                self.shader.name
            );
            if let Err(e) = self.device.wait_idle() {
                tracing::error!("wait_idle while dropping {}: {e}", self.shader.name);
            }
        }
        for entry in state.wait_list.drain(..) {
            let Some(fence) = entry.fence else {
                continue;
            };
            for child in &entry.chain {
                let mut child_state = child.state.lock();
                if let Some(position) = child_state.child_entry(entry.link) {
                    let child_entry = child_state.wait_list.remove(position);
                    if child_state.check_running(&child_entry.blocks).is_ok() {
                        child_state.finish(&child_entry.blocks);
                    }
                }
            }
            if let Err(e) = self.device.unborrow_fence(fence) {
                tracing::warn!("Returning fence of {}: {e}", self.shader.name);
            }
        }

        for block in &mut state.blocks {
            block.flight = None;
            self.release_block(block);
        }
        if let Some(uniform) = state.uniform.take() {
            self.destroy_buffer_logged(uniform);
        }
        if let Some(program) = state.program.take() {
            self.device.destroy_compute_program(&program);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use volcano_gpu::{CompletionMode, HostDevice};
    use volcano_memory::{Stage, StageConfig};

    fn words(bytes: &[u8]) -> Vec<u32> {
        bytes
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect()
    }

    fn pipeline(device: &Arc<HostDevice>, name: &str, config: ComputeConfig) -> ComputePipeline {
        ComputePipeline::new(
            device.clone(),
            ComputeShaderSource::new(name, vec![SPIRV_MAGIC]),
            config,
        )
    }

    fn counts(free: usize, prep: usize, run: usize, done: usize) -> BlockCounts {
        BlockCounts {
            free,
            prep,
            run,
            done,
        }
    }

    #[test]
    fn exhausted_free_set_recovers_after_delete() {
        let device = Arc::new(HostDevice::new());
        let p = pipeline(&device, "sum", ComputeConfig::new().block_in_size(64).next_size(2));
        p.alloc_blocks(2).unwrap();
        p.init().unwrap();
        assert_eq!(p.counts(), counts(2, 0, 0, 0));

        let blocks = p.new_blocks(2).unwrap();
        assert_eq!(p.counts(), counts(0, 2, 0, 0));
        assert!(matches!(
            p.new_blocks(1),
            Err(GpuError::PoolExhausted {
                requested: 1,
                available: 0,
                ..
            })
        ));
        assert_eq!(p.counts(), counts(0, 2, 0, 0));

        let mut one = vec![blocks[0]];
        p.delete_blocks(&mut one).unwrap();
        assert!(one.is_empty());
        assert_eq!(p.counts(), counts(1, 1, 0, 0));
        assert_eq!(p.new_blocks(1).unwrap(), vec![blocks[0]]);
        assert_eq!(p.counts().total(), p.total_blocks());
    }

    #[test]
    fn running_blocks_cannot_be_deleted() {
        let device = Arc::new(HostDevice::with_mode(CompletionMode::Deferred));
        let p = pipeline(
            &device,
            "copy",
            ComputeConfig::new().block_in_size(16).block_out_size(16),
        );
        p.init().unwrap();
        let mut blocks = p.new_blocks(2).unwrap();
        assert_eq!(p.counts(), counts(1, 2, 0, 0));

        p.enqueue_blocks(&blocks, &mut SubmitInfo::new()).unwrap();
        assert_eq!(p.counts(), counts(1, 0, 2, 0));
        assert_eq!(p.pending_fences(), 1);

        assert!(matches!(
            p.delete_blocks(&mut blocks),
            Err(GpuError::ContractViolation(_))
        ));
        assert_eq!(blocks.len(), 2);
        let cmd_post = p.with_block(blocks[0], |b| b.post_command_buffer()).unwrap();
        assert!(device.reset(cmd_post).is_err());

        p.poll().unwrap();
        assert_eq!(p.counts(), counts(1, 0, 2, 0));
        assert_eq!(p.wait(0).unwrap(), WaitOutcome::TimedOut);

        device.complete_pending().unwrap();
        assert_eq!(p.wait(0).unwrap(), WaitOutcome::Ready);
        assert_eq!(p.counts(), counts(1, 0, 2, 0));

        p.poll().unwrap();
        assert_eq!(p.counts(), counts(1, 0, 0, 2));
        assert_eq!(p.pending_fences(), 0);
        assert_eq!(device.borrowed_fences(), 0);
        assert!(p.wait(0).is_err());

        p.delete_blocks(&mut blocks).unwrap();
        assert_eq!(p.counts(), counts(3, 0, 0, 0));

        // Recycled blocks can run again.
        let again = p.new_blocks(3).unwrap();
        p.enqueue_blocks(&again, &mut SubmitInfo::new()).unwrap();
        device.complete_pending().unwrap();
        p.poll().unwrap();
        assert_eq!(p.counts(), counts(0, 0, 0, 3));
    }

    #[test]
    fn chained_blocks_retire_with_the_root_fence() {
        let device = Arc::new(HostDevice::with_mode(CompletionMode::Deferred));
        let parent = Arc::new(pipeline(&device, "first", ComputeConfig::new().block_in_size(8)));
        let child = Arc::new(pipeline(&device, "second", ComputeConfig::new().block_in_size(8)));
        parent.init().unwrap();
        child.init().unwrap();
        parent.set_chain(child.clone()).unwrap();

        let v0 = parent.new_blocks(1).unwrap();
        let v1 = child.new_blocks(2).unwrap();
        let mut submit = SubmitInfo::new();
        parent.enqueue_chain(&[&v0, &v1], &mut submit).unwrap();
        assert_eq!(submit.command_buffers.len(), 6);
        assert_eq!(device.submission_count(), 1);
        assert_eq!(parent.counts(), counts(2, 0, 1, 0));
        assert_eq!(child.counts(), counts(1, 0, 2, 0));
        assert_eq!(child.pending_fences(), 0);
        assert_eq!(child.wait_entries(), 1);
        assert!(child.wait(0).is_err());
        assert!(matches!(child.retire(0), Err(GpuError::ContractViolation(_))));

        parent.poll().unwrap();
        child.poll().unwrap();
        assert_eq!(parent.counts().done, 0);
        assert_eq!(child.counts().done, 0);

        device.complete_pending().unwrap();
        child.poll().unwrap();
        assert_eq!(child.counts().done, 0);
        parent.poll().unwrap();
        assert_eq!(parent.counts(), counts(2, 0, 0, 1));
        assert_eq!(child.counts(), counts(1, 0, 0, 2));
        assert_eq!(child.wait_entries(), 0);
        assert_eq!(device.borrowed_fences(), 0);
    }

    #[test]
    fn chain_is_fixed_while_submissions_are_in_flight() {
        let device = Arc::new(HostDevice::with_mode(CompletionMode::Deferred));
        let parent = Arc::new(pipeline(&device, "first", ComputeConfig::new().block_in_size(8)));
        let child = Arc::new(pipeline(&device, "second", ComputeConfig::new().block_in_size(8)));
        let other = Arc::new(pipeline(&device, "third", ComputeConfig::new().block_in_size(8)));
        for p in [&parent, &child, &other] {
            p.init().unwrap();
        }
        parent.set_chain(child.clone()).unwrap();

        let v0 = parent.new_blocks(1).unwrap();
        let v1 = child.new_blocks(1).unwrap();
        parent.enqueue_chain(&[&v0, &v1], &mut SubmitInfo::new()).unwrap();

        assert!(matches!(parent.clear_chain(), Err(GpuError::InvalidState(_))));
        assert!(matches!(
            parent.set_chain(other.clone()),
            Err(GpuError::InvalidState(_))
        ));
        assert!(matches!(
            child.set_chain(other.clone()),
            Err(GpuError::InvalidState(_))
        ));
        assert!(Arc::ptr_eq(&parent.chain().unwrap(), &child));

        // A later single-pipeline submission shares the wait list.
        let v2 = parent.new_blocks(1).unwrap();
        parent.enqueue_blocks(&v2, &mut SubmitInfo::new()).unwrap();
        assert_eq!(parent.pending_fences(), 2);

        device.complete_pending().unwrap();
        parent.poll().unwrap();
        assert_eq!(parent.counts(), counts(1, 0, 0, 2));
        assert_eq!(child.counts(), counts(2, 0, 0, 1));
        assert_eq!(child.wait_entries(), 0);
        assert_eq!(other.wait_entries(), 0);
        assert_eq!(device.borrowed_fences(), 0);

        parent.clear_chain().unwrap();
        parent.set_chain(other.clone()).unwrap();
    }

    #[test]
    fn retire_leaves_everything_in_place_when_a_chained_entry_is_missing() {
        let device = Arc::new(HostDevice::with_mode(CompletionMode::Deferred));
        let parent = Arc::new(pipeline(&device, "first", ComputeConfig::new().block_in_size(8)));
        let child = Arc::new(pipeline(&device, "second", ComputeConfig::new().block_in_size(8)));
        let grandchild = Arc::new(pipeline(&device, "third", ComputeConfig::new().block_in_size(8)));
        for p in [&parent, &child, &grandchild] {
            p.init().unwrap();
        }
        parent.set_chain(child.clone()).unwrap();
        child.set_chain(grandchild.clone()).unwrap();

        let v0 = parent.new_blocks(1).unwrap();
        let v1 = child.new_blocks(1).unwrap();
        let v2 = grandchild.new_blocks(1).unwrap();
        parent
            .enqueue_chain(&[&v0, &v1, &v2], &mut SubmitInfo::new())
            .unwrap();
        device.complete_pending().unwrap();

        // Lose the last link's entry behind the pipeline's back.
        let lost = grandchild.state.lock().wait_list.pop().unwrap();
        assert!(matches!(parent.poll(), Err(GpuError::InvalidState(_))));
        assert_eq!(parent.wait_entries(), 1);
        assert_eq!(child.wait_entries(), 1);
        assert_eq!(parent.counts().run, 1);
        assert_eq!(child.counts().run, 1);
        assert_eq!(device.borrowed_fences(), 1);

        grandchild.state.lock().wait_list.push(lost);
        parent.poll().unwrap();
        assert_eq!(parent.counts().done, 1);
        assert_eq!(child.counts().done, 1);
        assert_eq!(grandchild.counts().done, 1);
        assert_eq!(device.borrowed_fences(), 0);
    }

    #[test]
    fn dropping_a_parent_retires_its_chained_entries() {
        let device = Arc::new(HostDevice::with_mode(CompletionMode::Deferred));
        let parent = Arc::new(pipeline(&device, "first", ComputeConfig::new().block_in_size(8)));
        let child = Arc::new(pipeline(&device, "second", ComputeConfig::new().block_in_size(8)));
        parent.init().unwrap();
        child.init().unwrap();
        parent.set_chain(child.clone()).unwrap();

        let v0 = parent.new_blocks(1).unwrap();
        let v1 = child.new_blocks(2).unwrap();
        parent.enqueue_chain(&[&v0, &v1], &mut SubmitInfo::new()).unwrap();
        drop(parent);

        assert_eq!(device.pending_submissions(), 0);
        assert_eq!(child.wait_entries(), 0);
        assert_eq!(child.counts(), counts(1, 0, 0, 2));
        assert_eq!(device.borrowed_fences(), 0);
        child.set_chain(Arc::new(pipeline(&device, "third", ComputeConfig::new()))).unwrap();
    }

    #[test]
    fn blocked_wait_wakes_when_another_thread_completes_the_work() {
        let device = Arc::new(HostDevice::with_mode(CompletionMode::Deferred));
        let p = pipeline(&device, "slow", ComputeConfig::new().block_in_size(8));
        p.init().unwrap();
        let blocks = p.new_blocks(2).unwrap();
        p.enqueue_blocks(&blocks, &mut SubmitInfo::new()).unwrap();

        let outcome = std::thread::scope(|scope| {
            let device = device.clone();
            scope.spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                device.complete_pending().unwrap();
            });
            p.wait(5_000_000_000).unwrap()
        });
        assert_eq!(outcome, WaitOutcome::Ready);
        p.poll().unwrap();
        assert_eq!(p.counts(), counts(1, 0, 0, 2));
        assert_eq!(device.borrowed_fences(), 0);
    }

    #[test]
    fn failed_init_frees_what_it_created() {
        let device = Arc::new(HostDevice::new());
        let p = pipeline(
            &device,
            "big",
            ComputeConfig::new()
                .block_in_size(64)
                .block_out_size(64)
                .next_size(3),
        );
        device.set_memory_budget(Some(200));
        assert!(matches!(p.init(), Err(GpuError::AllocationFailed(_))));
        assert!(p.program().is_none());
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_command_buffers(), 0);
        assert_eq!(p.counts(), counts(3, 0, 0, 0));
        assert!(p.new_blocks(1).is_err());

        device.set_memory_budget(None);
        p.init().unwrap();
        assert!(p.program().is_some());
        assert_eq!(device.live_buffers(), 6);
        let blocks = p.new_blocks(3).unwrap();
        p.enqueue_blocks(&blocks, &mut SubmitInfo::new()).unwrap();
        p.poll().unwrap();
        assert_eq!(p.counts(), counts(0, 0, 0, 3));
    }

    #[test]
    fn delete_blocks_changes_nothing_when_recycling_fails() {
        let device = Arc::new(HostDevice::with_mode(CompletionMode::Deferred));
        let p = pipeline(&device, "again", ComputeConfig::new().block_in_size(8));
        p.init().unwrap();
        let mut blocks = p.new_blocks(2).unwrap();
        p.enqueue_blocks(&blocks, &mut SubmitInfo::new()).unwrap();
        device.complete_pending().unwrap();
        p.poll().unwrap();
        assert_eq!(p.counts(), counts(1, 0, 0, 2));

        // The caller resubmits the second block's recorded work.
        let cmd = p.with_block(blocks[1], |b| b.command_buffer()).unwrap();
        device
            .submit(0, &[SubmitInfo::with_command_buffer(cmd)], vk::Fence::null())
            .unwrap();

        assert!(matches!(
            p.delete_blocks(&mut blocks),
            Err(GpuError::ContractViolation(_))
        ));
        assert_eq!(blocks.len(), 2);
        assert_eq!(p.counts(), counts(1, 0, 0, 2));

        device.complete_pending().unwrap();
        p.delete_blocks(&mut blocks).unwrap();
        assert!(blocks.is_empty());
        assert_eq!(p.counts(), counts(3, 0, 0, 0));

        let again = p.new_blocks(3).unwrap();
        p.enqueue_blocks(&again, &mut SubmitInfo::new()).unwrap();
        device.complete_pending().unwrap();
        p.poll().unwrap();
        assert_eq!(p.counts(), counts(0, 0, 0, 3));
    }

    #[test]
    fn chain_must_cover_the_work() {
        let device = Arc::new(HostDevice::new());
        let p = pipeline(&device, "only", ComputeConfig::new().block_in_size(8));
        p.init().unwrap();
        let v = p.new_blocks(1).unwrap();
        assert!(p.enqueue_chain(&[], &mut SubmitInfo::new()).is_err());
        assert!(p.enqueue_chain(&[&v, &v], &mut SubmitInfo::new()).is_err());
        assert_eq!(p.counts(), counts(2, 1, 0, 0));
    }

    #[test]
    fn chains_cannot_loop() {
        let device = Arc::new(HostDevice::new());
        let a = Arc::new(pipeline(&device, "a", ComputeConfig::new()));
        let b = Arc::new(pipeline(&device, "b", ComputeConfig::new()));
        a.set_chain(b.clone()).unwrap();
        assert!(b.set_chain(a.clone()).is_err());
        assert!(a.set_chain(a.clone()).is_err());
        assert!(b.chain().is_none());
        a.clear_chain().unwrap();
    }

    #[test]
    fn invalid_blocks_are_rejected_before_recording() {
        let device = Arc::new(HostDevice::new());
        let p = pipeline(&device, "check", ComputeConfig::new().block_in_size(8));
        p.init().unwrap();
        let blocks = p.new_blocks(2).unwrap();
        p.with_block(blocks[1], |b| b.work.y = 0).unwrap();

        let mut submit = SubmitInfo::new();
        assert!(matches!(
            p.enqueue_blocks(&blocks, &mut submit),
            Err(GpuError::ContractViolation(_))
        ));
        assert!(submit.is_empty());
        assert_eq!(p.counts(), counts(1, 2, 0, 0));
        assert_eq!(device.submission_count(), 0);

        let twice = vec![blocks[0], blocks[0]];
        assert!(p.enqueue_blocks(&twice, &mut submit).is_err());

        let stage = Stage::new(device.clone(), StageConfig::new());
        let input = p.with_block(blocks[0], |b| b.input()).unwrap().unwrap();
        let transfer = stage.mmap(input, 0, 8).unwrap();
        p.with_block(blocks[0], |b| b.flight = Some(transfer)).unwrap();
        assert!(p.enqueue_blocks(&vec![blocks[0]], &mut submit).is_err());
        assert_eq!(p.counts(), counts(1, 2, 0, 0));
    }

    #[test]
    fn failed_submit_returns_blocks_to_prep() {
        let device = Arc::new(HostDevice::new());
        let p = pipeline(
            &device,
            "lost",
            ComputeConfig::new().block_in_size(8).queue_index(4),
        );
        p.init().unwrap();
        let mut blocks = p.new_blocks(2).unwrap();
        let mut submit = SubmitInfo::new();
        assert!(p.enqueue_blocks(&blocks, &mut submit).is_err());
        assert!(submit.is_empty());
        assert_eq!(p.counts(), counts(1, 2, 0, 0));
        assert_eq!(p.wait_entries(), 0);
        assert_eq!(device.borrowed_fences(), 0);
        p.delete_blocks(&mut blocks).unwrap();
        assert_eq!(p.counts(), counts(3, 0, 0, 0));
    }

    #[test]
    fn init_rules() {
        let device = Arc::new(HostDevice::new());
        let p = pipeline(&device, "once", ComputeConfig::new().block_in_size(8));
        assert!(matches!(p.new_blocks(1), Err(GpuError::InvalidState(_))));
        p.init().unwrap();
        assert!(matches!(p.init(), Err(GpuError::InvalidState(_))));

        let clash = pipeline(
            &device,
            "clash",
            ComputeConfig::new()
                .block_in_size(8)
                .block_out_size(8)
                .ubo(1, 64),
        );
        assert!(matches!(clash.init(), Err(GpuError::InvalidState(_))));
        assert!(clash.program().is_none());

        let empty = ComputePipeline::new(
            device.clone(),
            ComputeShaderSource::new("empty", Vec::new()),
            ComputeConfig::new(),
        );
        assert!(empty.init().is_err());
    }

    #[test]
    fn blocks_bind_io_and_uniform() {
        let device = Arc::new(HostDevice::new());
        let baseline = device.live_buffers();
        let p = pipeline(
            &device,
            "ubo",
            ComputeConfig::new()
                .block_in_size(16)
                .block_out_size(32)
                .ubo(2, 64),
        );
        p.init().unwrap();
        assert!(p.uniform_buffer().is_some());
        assert_eq!(device.live_buffers(), baseline + 3 * 2 + 1);

        let id = p.new_blocks(1).unwrap()[0];
        let (input, output) = p.with_block(id, |b| (b.input(), b.output())).unwrap();
        assert_eq!(device.buffer_contents(input.unwrap()).unwrap().len(), 16);
        assert_eq!(device.buffer_contents(output.unwrap()).unwrap().len(), 32);

        drop(p);
        assert_eq!(device.live_buffers(), baseline);
        assert_eq!(device.live_command_buffers(), 0);
    }

    #[test]
    fn alloc_blocks_grows_after_init() {
        let device = Arc::new(HostDevice::new());
        let p = pipeline(&device, "grow", ComputeConfig::new().block_in_size(4));
        p.init().unwrap();
        assert_eq!(p.total_blocks(), 3);

        p.alloc_blocks(5).unwrap();
        assert_eq!(p.counts(), counts(5, 0, 0, 0));
        let blocks = p.new_blocks(5).unwrap();
        for id in &blocks {
            assert!(p.with_block(*id, |b| b.is_initialized()).unwrap());
        }

        p.alloc_blocks(2).unwrap();
        assert_eq!(p.total_blocks(), 7);
        p.set_next_size(8);
        assert_eq!(p.next_size(), 8);
    }

    #[test]
    fn staged_input_dispatches_through_the_kernel() {
        let device = Arc::new(HostDevice::new());
        device.register_kernel("double", |_groups, bindings| {
            let doubled: Vec<u32> = words(&bindings[&0]).iter().map(|v| v * 2).collect();
            bindings.insert(1, doubled.iter().flat_map(|v| v.to_le_bytes()).collect());
        });
        let stage = Stage::new(device.clone(), StageConfig::new().mmap_max_size(256));
        let p = pipeline(
            &device,
            "double",
            ComputeConfig::new().block_in_size(16).block_out_size(16),
        );
        p.init().unwrap();

        let mut blocks = p.new_blocks(1).unwrap();
        let id = blocks[0];
        let (input, output) = p
            .with_block(id, |b| (b.input().unwrap(), b.output().unwrap()))
            .unwrap();

        let mut transfer = stage.mmap(input, 0, 16).unwrap();
        transfer
            .flight_mut()
            .unwrap()
            .write_pod(&[1u32, 2, 3, 4])
            .unwrap();
        stage.flush_but_not_submit(&mut transfer).unwrap();
        p.with_block(id, |b| {
            b.flight = Some(transfer);
            b.user_id = 42;
        })
        .unwrap();

        p.enqueue_blocks(&blocks, &mut SubmitInfo::new()).unwrap();
        p.poll().unwrap();
        assert_eq!(p.block_set(id).unwrap(), BlockSet::Done);
        assert_eq!(device.dispatch_count(), 1);

        let out = stage.read_back(output, 0, 16).unwrap();
        assert_eq!(words(&out), vec![2, 4, 6, 8]);
        assert_eq!(stage.sources_in_use(), 1);

        p.delete_blocks(&mut blocks).unwrap();
        assert_eq!(stage.sources_in_use(), 0);
        assert!(p
            .with_block(id, |b| b.flight.is_none() && b.user_id == 42)
            .unwrap());
    }

    #[test]
    fn spirv_bytes_are_checked() {
        let words = [SPIRV_MAGIC, 0x0001_0000];
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        let source = ComputeShaderSource::from_spirv_bytes("k", &bytes).unwrap();
        assert_eq!(source.spirv, words);
        assert!(ComputeShaderSource::from_spirv_bytes("k", &bytes[..6]).is_err());
        assert!(ComputeShaderSource::from_spirv_bytes("k", &[0u8; 8]).is_err());
    }
}
