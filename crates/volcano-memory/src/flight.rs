//! One in-progress transfer through a staging source.

use crate::stage::StageShared;
use bytemuck::Pod;
use std::sync::Arc;
use volcano_gpu::{vk, GpuError, MappedPtr, Result};

/// The device resource a flight copies to or from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightTarget {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

/// Which way the bytes move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host writes the mapping, flush copies it to the target.
    Upload,
    /// Flush copies the target into the mapping, host reads it afterwards.
    Download,
}

/// A transfer staged through one of the stage's sources.
///
/// The flight owns its source until it is dropped. Dropping it does not wait
/// for the device: a flushed flight must only be dropped once its fence has
/// signalled.
pub struct Flight {
    pub(crate) stage: Arc<StageShared>,
    pub(crate) source: usize,
    pub(crate) staging: vk::Buffer,
    pub(crate) cmd: vk::CommandBuffer,
    pub(crate) mapping: MappedPtr,
    pub(crate) target: FlightTarget,
    pub(crate) direction: Direction,
    pub(crate) offset: u64,
    pub(crate) size: u64,
    pub(crate) host_map: bool,
    pub(crate) flushed: bool,
    /// Buffer/image regions for image targets. Buffer offsets are relative
    /// to the start of the mapping.
    pub copies: Vec<vk::BufferImageCopy>,
}

impl Flight {
    pub fn target(&self) -> FlightTarget {
        self.target
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Index of the staging source backing this flight.
    pub fn source(&self) -> usize {
        self.source
    }

    /// Byte offset into a buffer target.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// The staging buffer holding the mapped bytes.
    pub fn staging_buffer(&self) -> vk::Buffer {
        self.staging
    }

    /// Command buffer the copy is recorded into. It is recording until the
    /// flight is submitted, so callers may add their own commands.
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.cmd
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    /// Whether the mapping currently holds the caller's view of the data.
    pub fn host_map(&self) -> bool {
        self.host_map
    }

    /// The mapped bytes, once they are meaningful to the host.
    pub fn mapped(&self) -> Option<&[u8]> {
        self.host_map.then(|| unsafe { self.bytes() })
    }

    pub fn mapped_mut(&mut self) -> Option<&mut [u8]> {
        if !self.host_map {
            return None;
        }
        let len = self.len();
        Some(unsafe { std::slice::from_raw_parts_mut(self.mapping.as_ptr(), len) })
    }

    /// Copy `bytes` into the mapping at `offset`.
    pub fn write_bytes(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let size = self.size;
        let mapped = self.mapped_mut().ok_or_else(|| {
            GpuError::ContractViolation("write to a flight whose mapping is not host owned".into())
        })?;
        let start = usize::try_from(offset).ok();
        let range = start.and_then(|s| Some(s..s.checked_add(bytes.len())?));
        match range {
            Some(range) if range.end <= mapped.len() => {
                mapped[range].copy_from_slice(bytes);
                Ok(())
            }
            _ => Err(GpuError::InvalidState(format!(
                "write of {} bytes at {offset} exceeds a {size} byte flight",
                bytes.len()
            ))),
        }
    }

    /// Copy a slice of plain values to the start of the mapping.
    pub fn write_pod<T: Pod>(&mut self, data: &[T]) -> Result<()> {
        self.write_bytes(0, bytemuck::cast_slice(data))
    }

    fn len(&self) -> usize {
        // `size` never exceeds the stage's mmap limit, which was allocated.
        usize::try_from(self.size).unwrap_or(0)
    }

    unsafe fn bytes(&self) -> &[u8] {
        std::slice::from_raw_parts(self.mapping.as_ptr(), self.len())
    }
}

impl Drop for Flight {
    fn drop(&mut self) {
        self.stage.release(self.source);
    }
}

impl std::fmt::Debug for Flight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flight")
            .field("source", &self.source)
            .field("target", &self.target)
            .field("direction", &self.direction)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("host_map", &self.host_map)
            .field("flushed", &self.flushed)
            .finish_non_exhaustive()
    }
}

/// Result of a stage request.
#[derive(Debug)]
pub enum Transfer {
    /// A zero byte request. Nothing to copy and nothing to submit.
    Empty,
    Staged(Flight),
}

impl Transfer {
    /// Whether flushing records and submits a copy.
    pub fn can_submit(&self) -> bool {
        matches!(self, Self::Staged(_))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn flight(&self) -> Option<&Flight> {
        match self {
            Self::Empty => None,
            Self::Staged(flight) => Some(flight),
        }
    }

    pub fn flight_mut(&mut self) -> Option<&mut Flight> {
        match self {
            Self::Empty => None,
            Self::Staged(flight) => Some(flight),
        }
    }

    /// Mapped bytes of a staged transfer, empty for [`Transfer::Empty`].
    pub fn mapped(&self) -> Option<&[u8]> {
        match self {
            Self::Empty => Some(&[]),
            Self::Staged(flight) => flight.mapped(),
        }
    }
}
