//! Wait-list bookkeeping for submitted blocks.

use crate::block::BlockVec;
use crate::compute::ComputePipeline;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use volcano_gpu::vk;

/// Ties together the wait-list entries one chained submission creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainLink(u64);

impl ChainLink {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

/// One wait-list entry.
///
/// A root entry owns the borrowed fence of a submission and the pipelines
/// the submission was chained to. Each of those holds a child entry with the
/// same link and no fence; children retire when their root does.
pub struct ComputeFence {
    pub(crate) fence: Option<vk::Fence>,
    pub(crate) link: ChainLink,
    pub(crate) blocks: BlockVec,
    pub(crate) chain: Vec<Arc<ComputePipeline>>,
}

impl ComputeFence {
    pub(crate) fn root(
        fence: vk::Fence,
        link: ChainLink,
        blocks: BlockVec,
        chain: Vec<Arc<ComputePipeline>>,
    ) -> Self {
        Self {
            fence: Some(fence),
            link,
            blocks,
            chain,
        }
    }

    pub(crate) fn child(link: ChainLink, blocks: BlockVec) -> Self {
        Self {
            fence: None,
            link,
            blocks,
            chain: Vec::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.fence.is_some()
    }

    pub fn fence(&self) -> Option<vk::Fence> {
        self.fence
    }

    pub fn link(&self) -> ChainLink {
        self.link
    }

    pub fn blocks(&self) -> &[crate::BlockId] {
        &self.blocks
    }

    /// Chained pipelines that retire through this entry.
    pub fn children(&self) -> usize {
        self.chain.len()
    }
}

impl fmt::Debug for ComputeFence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeFence")
            .field("fence", &self.fence)
            .field("link", &self.link)
            .field("blocks", &self.blocks)
            .field("children", &self.chain.len())
            .finish()
    }
}

/// Result of [`crate::ComputePipeline::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// At least one fence signalled.
    Ready,
    TimedOut,
}

#[cfg(test)]
mod tests {
    use super::*;
    use volcano_gpu::vk::Handle;

    #[test]
    fn links_are_unique() {
        let a = ChainLink::next();
        let b = ChainLink::next();
        assert_ne!(a, b);
        assert!(b.id() > a.id());
    }

    #[test]
    fn only_roots_hold_fences() {
        let link = ChainLink::next();
        let root = ComputeFence::root(vk::Fence::from_raw(9), link, Vec::new(), Vec::new());
        let child = ComputeFence::child(link, Vec::new());
        assert!(root.is_root());
        assert!(!child.is_root());
        assert_eq!(root.link(), child.link());
        assert_eq!(child.children(), 0);
    }
}
