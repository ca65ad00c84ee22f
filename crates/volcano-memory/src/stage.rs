//! Staging buffer pool for host/device transfers.
//!
//! A [`Stage`] owns a small ring of persistently mapped staging buffers, the
//! sources. Each request takes one source for the lifetime of the returned
//! [`Flight`]; when every source is busy the request fails instead of
//! blocking, so the caller decides whether to wait or grow the pool.

use crate::flight::{Direction, Flight, FlightTarget, Transfer};
use bytemuck::Pod;
use parking_lot::Mutex;
use std::sync::Arc;
use volcano_gpu::{
    vk, BufferDesc, GpuDevice, GpuError, MappedPtr, MemoryLocation, Result, SubmitInfo,
};

/// How long [`Stage::flush_and_wait`] waits for its fence.
pub const FLUSH_WAIT_MS: u64 = 1000;

/// Default largest single transfer.
pub const DEFAULT_MMAP_MAX_SIZE: u64 = 2 * 1024 * 1024;

/// Stage construction parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageConfig {
    /// Number of staging sources. At least 2.
    pub sources: usize,
    /// Size of each source, the largest single transfer.
    pub mmap_max_size: u64,
    /// Queue the stage submits its copies to.
    pub queue_index: usize,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            sources: 2,
            mmap_max_size: DEFAULT_MMAP_MAX_SIZE,
            queue_index: 0,
        }
    }
}

impl StageConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sources(mut self, count: usize) -> Self {
        self.sources = count;
        self
    }

    pub fn mmap_max_size(mut self, bytes: u64) -> Self {
        self.mmap_max_size = bytes;
        self
    }

    pub fn queue_index(mut self, index: usize) -> Self {
        self.queue_index = index;
        self
    }
}

struct FlightSource {
    buffer: vk::Buffer,
    cmd: vk::CommandBuffer,
    mapping: MappedPtr,
    in_use: bool,
}

#[derive(Default)]
struct SourcePool {
    sources: Vec<FlightSource>,
    next_source: usize,
}

impl SourcePool {
    /// Take the first free source at or after `next_source`.
    fn alloc(&mut self) -> Option<usize> {
        let count = self.sources.len();
        for _ in 0..count {
            let found = self.next_source;
            self.next_source = (self.next_source + 1) % count;
            if !self.sources[found].in_use {
                self.sources[found].in_use = true;
                return Some(found);
            }
        }
        None
    }
}

/// State shared by a stage and its outstanding flights.
pub(crate) struct StageShared {
    device: Arc<dyn GpuDevice>,
    config: StageConfig,
    pool: Mutex<SourcePool>,
}

impl StageShared {
    pub(crate) fn release(&self, source: usize) {
        let mut pool = self.pool.lock();
        match pool.sources.get_mut(source) {
            Some(s) => s.in_use = false,
            None => tracing::error!(
                "Flight refers to source {source} of {}",
                pool.sources.len()
            ),
        }
    }

    fn destroy_sources(&self, sources: Vec<FlightSource>) {
        let cmds: Vec<vk::CommandBuffer> = sources.iter().map(|s| s.cmd).collect();
        self.device.free_command_buffers(&cmds);
        for source in sources {
            if let Err(e) = self.device.destroy_buffer(source.buffer) {
                tracing::warn!("Failed to destroy staging buffer: {e}");
            }
        }
    }
}

impl Drop for StageShared {
    fn drop(&mut self) {
        let sources = std::mem::take(&mut self.pool.get_mut().sources);
        self.destroy_sources(sources);
    }
}

/// Multiplexes host/device transfers over a fixed set of staging buffers.
#[derive(Clone)]
pub struct Stage {
    shared: Arc<StageShared>,
}

impl Stage {
    /// Create a stage. Sources are allocated on first use.
    pub fn new(device: Arc<dyn GpuDevice>, config: StageConfig) -> Self {
        Self {
            shared: Arc::new(StageShared {
                device,
                config,
                pool: Mutex::new(SourcePool::default()),
            }),
        }
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.shared.device
    }

    pub fn config(&self) -> &StageConfig {
        &self.shared.config
    }

    /// Allocate and map every source. Returns at once if already done.
    pub fn init(&self) -> Result<()> {
        let mut pool = self.shared.pool.lock();
        if !pool.sources.is_empty() {
            return Ok(());
        }
        let config = &self.shared.config;
        if config.sources < 2 {
            tracing::error!("Stage needs at least 2 sources, got {}", config.sources);
            return Err(GpuError::InvalidState(format!(
                "stage needs at least 2 sources, got {}",
                config.sources
            )));
        }

        let device = &self.shared.device;
        let count = u32::try_from(config.sources)
            .map_err(|_| GpuError::InvalidState(format!("{} sources", config.sources)))?;
        let cmds = device.allocate_command_buffers(count)?;
        let mut sources = Vec::with_capacity(cmds.len());
        for (i, cmd) in cmds.iter().enumerate() {
            match Self::create_source(&**device, config, i, *cmd) {
                Ok(source) => sources.push(source),
                Err(e) => {
                    tracing::error!("Stage source {i} failed: {e}");
                    for source in &sources {
                        if let Err(e) = device.destroy_buffer(source.buffer) {
                            tracing::warn!("Failed to destroy stage source buffer: {e}");
                        }
                    }
                    device.free_command_buffers(&cmds);
                    return Err(e);
                }
            }
        }

        tracing::debug!(
            "Stage allocated {} sources of {} bytes",
            sources.len(),
            config.mmap_max_size
        );
        pool.sources = sources;
        pool.next_source = 0;
        Ok(())
    }

    fn create_source(
        device: &dyn GpuDevice,
        config: &StageConfig,
        index: usize,
        cmd: vk::CommandBuffer,
    ) -> Result<FlightSource> {
        let name = format!("stage.sources[{index}]");
        let buffer = device.create_buffer(&BufferDesc {
            name: &name,
            size: config.mmap_max_size,
            usage: vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            location: MemoryLocation::CpuToGpu,
        })?;
        match device.mapped_ptr(buffer) {
            Ok(mapping) => Ok(FlightSource {
                buffer,
                cmd,
                mapping,
                in_use: false,
            }),
            Err(e) => {
                if let Err(destroy) = device.destroy_buffer(buffer) {
                    tracing::warn!("Failed to destroy unmappable {name}: {destroy}");
                }
                Err(e)
            }
        }
    }

    /// Prepare to write `bytes` into `dst` at `offset`.
    pub fn mmap(&self, dst: vk::Buffer, offset: u64, bytes: u64) -> Result<Transfer> {
        self.begin(FlightTarget::Buffer(dst), Direction::Upload, offset, bytes)
    }

    /// Prepare to write `bytes` into `image`. Fill [`Flight::copies`] before
    /// flushing.
    pub fn mmap_image(&self, image: vk::Image, bytes: u64) -> Result<Transfer> {
        self.begin(FlightTarget::Image(image), Direction::Upload, 0, bytes)
    }

    /// Prepare to read `bytes` from `src` at `offset`.
    pub fn read(&self, src: vk::Buffer, offset: u64, bytes: u64) -> Result<Transfer> {
        self.begin(FlightTarget::Buffer(src), Direction::Download, offset, bytes)
    }

    /// Prepare to read `bytes` from `image`. Fill [`Flight::copies`] before
    /// flushing.
    pub fn read_image(&self, image: vk::Image, bytes: u64) -> Result<Transfer> {
        self.begin(FlightTarget::Image(image), Direction::Download, 0, bytes)
    }

    fn begin(
        &self,
        target: FlightTarget,
        direction: Direction,
        offset: u64,
        bytes: u64,
    ) -> Result<Transfer> {
        let max = self.shared.config.mmap_max_size;
        if bytes > max {
            tracing::error!("{direction:?} of {bytes} bytes to {target:?}: mmap_max is {max}");
            return Err(GpuError::TransferTooLarge { bytes, max });
        }
        if bytes == 0 {
            return Ok(Transfer::Empty);
        }
        self.init()?;

        let (source, staging, cmd, mapping) = {
            let mut pool = self.shared.pool.lock();
            let total = pool.sources.len();
            let Some(index) = pool.alloc() else {
                tracing::warn!("{direction:?} to {target:?}: all {total} stage sources in use");
                return Err(GpuError::PoolExhausted {
                    what: "stage sources",
                    requested: 1,
                    available: 0,
                });
            };
            let s = &pool.sources[index];
            (index, s.buffer, s.cmd, s.mapping)
        };

        // Built before recording starts so an error below releases the source.
        let flight = Flight {
            stage: Arc::clone(&self.shared),
            source,
            staging,
            cmd,
            mapping,
            target,
            direction,
            offset,
            size: bytes,
            host_map: direction == Direction::Upload,
            flushed: false,
            copies: Vec::new(),
        };
        let device = &self.shared.device;
        device.reset(cmd)?;
        device.begin_simultaneous_use(cmd)?;
        Ok(Transfer::Staged(flight))
    }

    fn check_owner(&self, flight: &Flight) -> Result<()> {
        if Arc::ptr_eq(&flight.stage, &self.shared) {
            Ok(())
        } else {
            Err(GpuError::ContractViolation(
                "flight belongs to a different stage".to_string(),
            ))
        }
    }

    fn transition(&self, cmd: vk::CommandBuffer, image: vk::Image, layout: vk::ImageLayout) -> Result<()> {
        let device = &self.shared.device;
        if device.image_layout(image)? != layout {
            device.cmd_transition_image(cmd, image, layout)?;
        }
        Ok(())
    }

    /// Record the copy for `transfer` without submitting it.
    ///
    /// Uploads copy the mapping into the target; downloads copy the target
    /// into the mapping. Images are transitioned to the matching transfer
    /// layout first.
    pub fn flush_but_not_submit(&self, transfer: &mut Transfer) -> Result<()> {
        let Transfer::Staged(flight) = transfer else {
            return Ok(());
        };
        self.check_owner(flight)?;
        if flight.flushed {
            tracing::error!("Flight on source {} flushed twice", flight.source);
            return Err(GpuError::ContractViolation("flight already flushed".to_string()));
        }
        if matches!(flight.target, FlightTarget::Image(_)) && flight.copies.is_empty() {
            tracing::error!("Image flight on source {} has no copies", flight.source);
            return Err(GpuError::ContractViolation(
                "image flight flushed without copy regions".to_string(),
            ));
        }

        let device = &self.shared.device;
        let cmd = flight.cmd;
        match (flight.direction, flight.target) {
            (Direction::Upload, FlightTarget::Buffer(dst)) => {
                let region = vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: flight.offset,
                    size: flight.size,
                };
                device.cmd_copy_buffer(cmd, flight.staging, dst, &[region])?;
            }
            (Direction::Upload, FlightTarget::Image(image)) => {
                let layout = vk::ImageLayout::TRANSFER_DST_OPTIMAL;
                self.transition(cmd, image, layout)?;
                device.cmd_copy_buffer_to_image(cmd, flight.staging, image, layout, &flight.copies)?;
            }
            (Direction::Download, FlightTarget::Buffer(src)) => {
                let region = vk::BufferCopy {
                    src_offset: flight.offset,
                    dst_offset: 0,
                    size: flight.size,
                };
                device.cmd_copy_buffer(cmd, src, flight.staging, &[region])?;
            }
            (Direction::Download, FlightTarget::Image(image)) => {
                let layout = vk::ImageLayout::TRANSFER_SRC_OPTIMAL;
                self.transition(cmd, image, layout)?;
                device.cmd_copy_image_to_buffer(cmd, image, layout, flight.staging, &flight.copies)?;
            }
        }
        flight.flushed = true;
        flight.host_map = !flight.host_map;
        Ok(())
    }

    /// Record and submit the copy with `fence`.
    ///
    /// Returns `true` when work was submitted and the caller must wait on
    /// `fence` before reading the mapping or dropping the flight.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn flush(&self, transfer: &mut Transfer, fence: vk::Fence) -> Result<bool> {
        self.flush_but_not_submit(transfer)?;
        let Transfer::Staged(flight) = transfer else {
            return Ok(false);
        };
        let device = &self.shared.device;
        device.end(flight.cmd)?;
        device.submit(
            self.shared.config.queue_index,
            &[SubmitInfo::with_command_buffer(flight.cmd)],
            fence,
        )?;
        Ok(true)
    }

    /// Flush with a pooled fence and block until the copy completes.
    ///
    /// On timeout the fence is left borrowed, since its submission may still
    /// be pending. Any other failure returns the fence to the pool when the
    /// device allows it.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn flush_and_wait(&self, transfer: &mut Transfer) -> Result<()> {
        if !transfer.can_submit() {
            return Ok(());
        }
        let device = &self.shared.device;
        let fence = device.borrow_fence()?;
        let waited = self.flush(transfer, fence).and_then(|submitted| {
            Ok(!submitted || device.wait_for_fences(&[fence], true, FLUSH_WAIT_MS * 1_000_000)?)
        });
        match waited {
            Ok(true) => device.unborrow_fence(fence),
            Ok(false) => {
                tracing::warn!("Stage copy did not finish within {FLUSH_WAIT_MS} ms");
                Err(GpuError::Timeout(format!(
                    "stage flush exceeded {FLUSH_WAIT_MS} ms"
                )))
            }
            Err(e) => {
                if let Err(unborrow) = device.unborrow_fence(fence) {
                    tracing::warn!("Stage fence {fence:?} kept after a failed flush: {unborrow}");
                }
                Err(e)
            }
        }
    }

    /// Upload `data` to `dst` at `offset` and wait for it.
    pub fn copy<T: Pod>(&self, dst: vk::Buffer, offset: u64, data: &[T]) -> Result<()> {
        let bytes = bytemuck::cast_slice::<T, u8>(data);
        let mut transfer = self.mmap(dst, offset, bytes.len() as u64)?;
        if let Some(flight) = transfer.flight_mut() {
            flight.write_bytes(0, bytes)?;
        }
        self.flush_and_wait(&mut transfer)
    }

    /// Download `bytes` from `src` at `offset` and wait for them.
    pub fn read_back(&self, src: vk::Buffer, offset: u64, bytes: u64) -> Result<Vec<u8>> {
        let mut transfer = self.read(src, offset, bytes)?;
        self.flush_and_wait(&mut transfer)?;
        Ok(transfer.mapped().map(<[u8]>::to_vec).unwrap_or_default())
    }

    /// Largest single transfer.
    pub fn mmap_max(&self) -> u64 {
        self.shared.config.mmap_max_size
    }

    /// Staging memory the stage uses once initialised.
    pub fn total_size(&self) -> u64 {
        self.shared.config.mmap_max_size * self.shared.config.sources as u64
    }

    /// Sources currently owned by a flight.
    pub fn sources_in_use(&self) -> usize {
        self.shared
            .pool
            .lock()
            .sources
            .iter()
            .filter(|s| s.in_use)
            .count()
    }

    /// Sources allocated so far; zero until the first transfer.
    pub fn source_count(&self) -> usize {
        self.shared.pool.lock().sources.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use volcano_gpu::{CompletionMode, HostDevice, ImageDesc};

    fn host_stage(config: StageConfig) -> (Arc<HostDevice>, Stage) {
        let device = Arc::new(HostDevice::new());
        let stage = Stage::new(device.clone(), config);
        (device, stage)
    }

    fn device_buffer(device: &HostDevice, size: u64) -> vk::Buffer {
        device
            .create_buffer(&BufferDesc {
                name: "target",
                size,
                usage: vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::TRANSFER_DST,
                location: MemoryLocation::GpuOnly,
            })
            .unwrap()
    }

    fn full_region(width: u32, height: u32) -> vk::BufferImageCopy {
        vk::BufferImageCopy {
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
                width,
                height,
                depth: 1,
            },
        }
    }

    #[test]
    fn exhausted_pool_recovers_after_release() {
        let (device, stage) = host_stage(StageConfig::new().sources(2).mmap_max_size(1024));
        let dst = device_buffer(&device, 4096);

        let first = stage.mmap(dst, 0, 16).unwrap();
        let second = stage.mmap(dst, 16, 16).unwrap();
        assert_eq!(stage.sources_in_use(), 2);
        assert!(matches!(
            stage.mmap(dst, 32, 16),
            Err(GpuError::PoolExhausted { .. })
        ));
        assert!(matches!(
            stage.read(dst, 0, 16),
            Err(GpuError::PoolExhausted { .. })
        ));

        drop(first);
        assert_eq!(stage.sources_in_use(), 1);
        let third = stage.mmap(dst, 32, 16).unwrap();
        assert!(third.can_submit());
        assert_eq!(stage.sources_in_use(), 2);
        drop((second, third));
        assert_eq!(stage.sources_in_use(), 0);
    }

    #[test]
    fn oversized_requests_leave_the_pool_alone() {
        let (device, stage) = host_stage(StageConfig::new().mmap_max_size(1024));
        let dst = device_buffer(&device, 4096);
        let live = device.live_buffers();

        assert!(matches!(
            stage.mmap(dst, 0, 1025),
            Err(GpuError::TransferTooLarge {
                bytes: 1025,
                max: 1024
            })
        ));
        assert_eq!(stage.source_count(), 0);
        assert_eq!(device.live_buffers(), live);

        stage.init().unwrap();
        assert!(stage.read(dst, 0, 2048).is_err());
        assert_eq!(stage.sources_in_use(), 0);
    }

    #[test]
    fn zero_byte_requests_are_empty() {
        let (device, stage) = host_stage(StageConfig::new());
        let dst = device_buffer(&device, 64);

        let mut transfer = stage.mmap(dst, 0, 0).unwrap();
        assert!(transfer.is_empty());
        assert!(!transfer.can_submit());
        assert_eq!(stage.sources_in_use(), 0);

        let fence = device.borrow_fence().unwrap();
        assert!(!stage.flush(&mut transfer, fence).unwrap());
        stage.flush_and_wait(&mut transfer).unwrap();
        assert_eq!(device.submission_count(), 0);
        assert!(stage.read_back(dst, 0, 0).unwrap().is_empty());
    }

    #[test]
    fn buffer_round_trip() {
        let (device, stage) = host_stage(StageConfig::new().mmap_max_size(1024));
        let dst = device_buffer(&device, 256);
        let data: Vec<u32> = (0..16).map(|i| i * 0x0101_0101).collect();

        stage.copy(dst, 64, &data).unwrap();
        assert_eq!(
            &device.buffer_contents(dst).unwrap()[64..128],
            bytemuck::cast_slice::<u32, u8>(&data)
        );

        let back = stage.read_back(dst, 64, 64).unwrap();
        assert_eq!(back, bytemuck::cast_slice::<u32, u8>(&data));
        assert_eq!(stage.sources_in_use(), 0);
        assert_eq!(device.borrowed_fences(), 0);
    }

    #[test]
    fn image_round_trip() {
        let (device, stage) = host_stage(StageConfig::new().mmap_max_size(1024));
        let image = device
            .create_image(&ImageDesc {
                name: "texture",
                format: vk::Format::R8G8B8A8_UNORM,
                extent: vk::Extent3D {
                    width: 4,
                    height: 4,
                    depth: 1,
                },
                usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::TRANSFER_SRC,
            })
            .unwrap();
        let texels: Vec<u8> = (0..64).map(|i| i * 3).collect();

        let mut upload = stage.mmap_image(image, 64).unwrap();
        let flight = upload.flight_mut().unwrap();
        flight.write_bytes(0, &texels).unwrap();
        flight.copies.push(full_region(4, 4));
        stage.flush_and_wait(&mut upload).unwrap();
        drop(upload);
        assert_eq!(
            device.image_layout(image).unwrap(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        );

        let mut download = stage.read_image(image, 64).unwrap();
        download.flight_mut().unwrap().copies.push(full_region(4, 4));
        stage.flush_and_wait(&mut download).unwrap();
        assert_eq!(download.mapped().unwrap(), texels.as_slice());
        assert_eq!(
            device.image_layout(image).unwrap(),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL
        );
    }

    #[test]
    fn image_flush_needs_copy_regions() {
        let (device, stage) = host_stage(StageConfig::new());
        let image = device
            .create_image(&ImageDesc {
                name: "texture",
                format: vk::Format::R32_SFLOAT,
                extent: vk::Extent3D {
                    width: 2,
                    height: 2,
                    depth: 1,
                },
                usage: vk::ImageUsageFlags::TRANSFER_DST,
            })
            .unwrap();
        let mut transfer = stage.mmap_image(image, 16).unwrap();
        assert!(matches!(
            stage.flush_but_not_submit(&mut transfer),
            Err(GpuError::ContractViolation(_))
        ));
        assert!(matches!(
            stage.flush_and_wait(&mut transfer),
            Err(GpuError::ContractViolation(_))
        ));
        assert_eq!(device.borrowed_fences(), 0);
    }

    #[test]
    fn flushing_twice_is_rejected() {
        let (device, stage) = host_stage(StageConfig::new());
        let dst = device_buffer(&device, 64);
        let mut transfer = stage.mmap(dst, 0, 8).unwrap();
        stage.flush_but_not_submit(&mut transfer).unwrap();
        assert!(transfer.flight().unwrap().is_flushed());
        assert!(matches!(
            stage.flush_but_not_submit(&mut transfer),
            Err(GpuError::ContractViolation(_))
        ));
    }

    #[test]
    fn read_mapping_waits_for_flush() {
        let (device, stage) = host_stage(StageConfig::new());
        let src = device_buffer(&device, 64);
        device.write_buffer(src, 8, &[9u8; 8]).unwrap();

        let mut read = stage.read(src, 8, 8).unwrap();
        assert!(read.mapped().is_none());
        assert!(read.flight_mut().unwrap().write_bytes(0, &[1]).is_err());
        stage.flush_and_wait(&mut read).unwrap();
        assert_eq!(read.mapped().unwrap(), &[9u8; 8]);

        let mut write = stage.mmap(src, 0, 8).unwrap();
        assert!(write.mapped().is_some());
        assert!(write.flight_mut().unwrap().write_bytes(4, &[0u8; 8]).is_err());
    }

    #[test]
    fn sources_are_taken_round_robin() {
        let (device, stage) = host_stage(StageConfig::new().sources(3));
        let dst = device_buffer(&device, 64);

        let first = stage.mmap(dst, 0, 4).unwrap();
        assert_eq!(first.flight().unwrap().source(), 0);
        drop(first);
        let second = stage.mmap(dst, 0, 4).unwrap();
        assert_eq!(second.flight().unwrap().source(), 1);
        let third = stage.mmap(dst, 0, 4).unwrap();
        assert_eq!(third.flight().unwrap().source(), 2);
        let fourth = stage.mmap(dst, 0, 4).unwrap();
        assert_eq!(fourth.flight().unwrap().source(), 0);
        assert_eq!(stage.total_size(), 3 * DEFAULT_MMAP_MAX_SIZE);
    }

    #[test]
    fn fewer_than_two_sources_is_invalid() {
        let (device, stage) = host_stage(StageConfig::new().sources(1));
        let dst = device_buffer(&device, 64);
        assert!(matches!(
            stage.mmap(dst, 0, 4),
            Err(GpuError::InvalidState(_))
        ));
    }

    #[test]
    fn flights_belong_to_their_stage() {
        let device = Arc::new(HostDevice::new());
        let a = Stage::new(device.clone(), StageConfig::new());
        let b = Stage::new(device.clone(), StageConfig::new());
        let dst = device_buffer(&device, 64);
        let mut transfer = a.mmap(dst, 0, 4).unwrap();
        assert!(matches!(
            b.flush(&mut transfer, vk::Fence::null()),
            Err(GpuError::ContractViolation(_))
        ));
    }

    #[test]
    fn flush_signals_the_callers_fence() {
        let device = Arc::new(HostDevice::with_mode(CompletionMode::Deferred));
        let stage = Stage::new(device.clone(), StageConfig::new());
        let dst = device_buffer(&device, 64);

        let mut transfer = stage.mmap(dst, 0, 4).unwrap();
        transfer.flight_mut().unwrap().write_pod(&[0xdead_beef_u32]).unwrap();
        let fence = device.borrow_fence().unwrap();
        assert!(stage.flush(&mut transfer, fence).unwrap());
        assert!(!device.fence_status(fence).unwrap());

        device.complete_pending().unwrap();
        assert!(device.fence_status(fence).unwrap());
        assert_eq!(
            &device.buffer_contents(dst).unwrap()[..4],
            &0xdead_beef_u32.to_ne_bytes()
        );
        device.unborrow_fence(fence).unwrap();
    }

    #[test]
    fn dropping_the_stage_frees_sources_after_flights() {
        let (device, stage) = host_stage(StageConfig::new());
        let dst = device_buffer(&device, 64);
        let transfer = stage.mmap(dst, 0, 4).unwrap();
        let before = device.live_buffers();
        drop(stage);
        assert_eq!(device.live_buffers(), before);
        drop(transfer);
        assert_eq!(device.live_buffers(), 1);
    }

    #[test]
    fn flush_and_wait_returns_once_another_thread_completes_the_copy() {
        let device = Arc::new(HostDevice::with_mode(CompletionMode::Deferred));
        let stage = Stage::new(device.clone(), StageConfig::new());
        let dst = device_buffer(&device, 64);
        let mut transfer = stage.mmap(dst, 0, 8).unwrap();
        transfer.flight_mut().unwrap().write_pod(&[7_u32, 9]).unwrap();

        std::thread::scope(|scope| {
            let device = device.clone();
            scope.spawn(move || {
                while device.pending_submissions() == 0 {
                    std::thread::yield_now();
                }
                device.complete_pending().unwrap();
            });
            stage.flush_and_wait(&mut transfer).unwrap();
        });
        assert_eq!(device.borrowed_fences(), 0);
        drop(transfer);
        assert_eq!(
            &device.buffer_contents(dst).unwrap()[..8],
            bytemuck::cast_slice::<u32, u8>(&[7, 9])
        );
    }

    #[test]
    fn timed_out_flush_keeps_its_fence() {
        let device = Arc::new(HostDevice::with_mode(CompletionMode::Deferred));
        let stage = Stage::new(device.clone(), StageConfig::new());
        let dst = device_buffer(&device, 64);
        let mut transfer = stage.mmap(dst, 0, 4).unwrap();
        transfer.flight_mut().unwrap().write_pod(&[1_u32]).unwrap();

        assert!(matches!(
            stage.flush_and_wait(&mut transfer),
            Err(GpuError::Timeout(_))
        ));
        assert_eq!(device.borrowed_fences(), 1);
        assert_eq!(stage.sources_in_use(), 1);

        device.complete_pending().unwrap();
        drop(transfer);
        assert_eq!(stage.sources_in_use(), 0);
        assert_eq!(&device.buffer_contents(dst).unwrap()[..4], &1_u32.to_ne_bytes());
    }

    #[test]
    fn threads_share_one_stage() {
        let (device, stage) = host_stage(StageConfig::new().sources(2));
        stage.init().unwrap();
        let targets: Vec<vk::Buffer> = (0..4).map(|_| device_buffer(&device, 64)).collect();

        std::thread::scope(|scope| {
            for (t, dst) in targets.iter().enumerate() {
                let stage = stage.clone();
                let dst = *dst;
                scope.spawn(move || {
                    for i in 0..50_u32 {
                        let words = [t as u32, i, t as u32 ^ i, 0xffff_0000 | i];
                        let back = loop {
                            let round_trip = stage
                                .copy(dst, 0, &words)
                                .and_then(|()| stage.read_back(dst, 0, 16));
                            match round_trip {
                                Ok(back) => break back,
                                Err(e) if e.is_recoverable() => std::thread::yield_now(),
                                Err(e) => panic!("thread {t}: {e}"),
                            }
                        };
                        assert_eq!(back, bytemuck::cast_slice::<u32, u8>(&words));
                        assert!(stage.sources_in_use() <= stage.source_count());
                    }
                });
            }
        });
        assert_eq!(stage.sources_in_use(), 0);
        assert_eq!(device.borrowed_fences(), 0);
    }
}
