//! Compute blocks and their lifecycle sets.

use std::any::Any;
use std::fmt;
use volcano_gpu::vk;
use volcano_memory::Transfer;

/// Stable index of a block in its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub(crate) usize);

impl BlockId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block {}", self.0)
    }
}

pub type BlockVec = Vec<BlockId>;

/// The lifecycle set a block is in.
///
/// `Free -> Prep -> Run -> Done -> Free`, and `Prep -> Free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockSet {
    Free,
    Prep,
    Run,
    Done,
}

/// Workgroup counts of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkSize {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Default for WorkSize {
    fn default() -> Self {
        Self { x: 1, y: 1, z: 1 }
    }
}

impl WorkSize {
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Every dimension dispatches at least one workgroup.
    pub fn is_valid(&self) -> bool {
        self.x >= 1 && self.y >= 1 && self.z >= 1
    }
}

/// Number of blocks in each set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockCounts {
    pub free: usize,
    pub prep: usize,
    pub run: usize,
    pub done: usize,
}

impl BlockCounts {
    pub fn total(&self) -> usize {
        self.free + self.prep + self.run + self.done
    }

    pub(crate) fn add(&mut self, set: BlockSet) {
        match set {
            BlockSet::Free => self.free += 1,
            BlockSet::Prep => self.prep += 1,
            BlockSet::Run => self.run += 1,
            BlockSet::Done => self.done += 1,
        }
    }
}

/// One unit of compute work: I/O buffers, a descriptor set and the command
/// buffers that dispatch it.
pub struct ComputeBlock {
    pub(crate) set: BlockSet,
    pub(crate) input: Option<vk::Buffer>,
    pub(crate) output: Option<vk::Buffer>,
    pub(crate) descriptor_set: vk::DescriptorSet,
    pub(crate) cmd: vk::CommandBuffer,
    pub(crate) cmd_post: vk::CommandBuffer,
    pub(crate) initialized: bool,
    /// Transfer that produces the input. When it is staged and flushed, the
    /// dispatch is recorded after its copy in the same command buffer.
    pub flight: Option<Transfer>,
    pub work: WorkSize,
    pub user_id: u64,
    pub user_data: Option<Box<dyn Any + Send>>,
}

impl ComputeBlock {
    pub(crate) fn new() -> Self {
        Self {
            set: BlockSet::Free,
            input: None,
            output: None,
            descriptor_set: vk::DescriptorSet::null(),
            cmd: vk::CommandBuffer::null(),
            cmd_post: vk::CommandBuffer::null(),
            initialized: false,
            flight: None,
            work: WorkSize::default(),
            user_id: 0,
            user_data: None,
        }
    }

    pub fn set(&self) -> BlockSet {
        self.set
    }

    /// Input storage buffer, absent when the pipeline has no input.
    pub fn input(&self) -> Option<vk::Buffer> {
        self.input
    }

    pub fn output(&self) -> Option<vk::Buffer> {
        self.output
    }

    pub fn descriptor_set(&self) -> vk::DescriptorSet {
        self.descriptor_set
    }

    /// Command buffer the dispatch goes into when the block has no flight.
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.cmd
    }

    /// Command buffer submitted after the dispatch. It is recording while the
    /// block is in `Prep`, so callers can append readbacks to it.
    pub fn post_command_buffer(&self) -> vk::CommandBuffer {
        self.cmd_post
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// The staged flight whose command buffer carries the dispatch, if any.
    pub(crate) fn dispatch_flight(&self) -> Option<&volcano_memory::Flight> {
        self.flight.as_ref().and_then(Transfer::flight)
    }
}

impl fmt::Debug for ComputeBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeBlock")
            .field("set", &self.set)
            .field("input", &self.input)
            .field("output", &self.output)
            .field("work", &self.work)
            .field("user_id", &self.user_id)
            .field("flight", &self.flight)
            .finish_non_exhaustive()
    }
}
