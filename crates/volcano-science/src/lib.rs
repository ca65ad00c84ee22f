//! Compute block scheduling for the Volcano compute engine.
//!
//! Blocks move `Free -> Prep -> Run -> Done -> Free`. Submissions are tracked
//! by a wait list of pooled fences, and pipelines can be chained so several
//! shaders run in one submission.

pub mod block;
pub mod compute;
pub mod fence;

pub use block::{BlockCounts, BlockId, BlockSet, BlockVec, ComputeBlock, WorkSize};
pub use compute::{ComputeConfig, ComputePipeline, ComputeShaderSource, SPIRV_MAGIC};
pub use fence::{ChainLink, ComputeFence, WaitOutcome};
