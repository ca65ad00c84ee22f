//! Volcano throughput benchmark.
//!
//! Measures staged upload/readback round trips and chained compute
//! submissions on the host device, or on Vulkan with `--vulkan`.
//!
//! ```text
//! volcano-bench [--vulkan] [--iterations N] [--bytes N] [--shader FILE.spv]
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use volcano_gpu::{
    vk, BufferDesc, GpuContextBuilder, GpuDevice, HostDevice, MemoryLocation, SubmitInfo,
    VulkanDevice,
};
use volcano_memory::{Stage, StageConfig, DEFAULT_MMAP_MAX_SIZE, FLUSH_WAIT_MS};
use volcano_science::{
    BlockVec, ComputeConfig, ComputePipeline, ComputeShaderSource, WaitOutcome, WorkSize,
    SPIRV_MAGIC,
};

/// Invocations per workgroup the benchmark shaders are written for.
const LOCAL_SIZE: usize = 64;

struct Options {
    vulkan: bool,
    iterations: usize,
    bytes: u64,
    shader: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            vulkan: false,
            iterations: 64,
            bytes: 256 * 1024,
            shader: None,
        }
    }
}

impl Options {
    fn parse() -> anyhow::Result<Self> {
        let mut options = Self::default();
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--vulkan" => options.vulkan = true,
                "--iterations" => {
                    options.iterations = args
                        .next()
                        .context("--iterations needs a value")?
                        .parse()
                        .context("--iterations")?;
                }
                "--bytes" => {
                    options.bytes = args
                        .next()
                        .context("--bytes needs a value")?
                        .parse()
                        .context("--bytes")?;
                }
                "--shader" => {
                    options.shader = Some(args.next().context("--shader needs a path")?);
                }
                other => bail!("unknown argument {other}"),
            }
        }
        if options.bytes == 0 || options.bytes % 4 != 0 {
            bail!("--bytes must be a positive multiple of 4");
        }
        Ok(options)
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let options = Options::parse()?;
    info!("Volcano benchmark");

    let device: Arc<dyn GpuDevice> = if options.vulkan {
        let context = GpuContextBuilder::new()
            .app_name("volcano-bench")
            .validation(cfg!(debug_assertions))
            .build()?;
        info!("Using {}", context.capabilities().summary());
        Arc::new(VulkanDevice::new(context)?)
    } else {
        let host = HostDevice::new();
        register_host_kernels(&host);
        info!("Using the host device");
        Arc::new(host)
    };

    let mmap_max = options.bytes.max(DEFAULT_MMAP_MAX_SIZE);
    let stage = Stage::new(device.clone(), StageConfig::new().mmap_max_size(mmap_max));
    stage.init()?;

    bench_stage(&device, &stage, &options)?;

    let shaders = match (&options.shader, options.vulkan) {
        (Some(path), _) => {
            let bytes = std::fs::read(path).with_context(|| format!("reading {path}"))?;
            vec![ComputeShaderSource::from_spirv_bytes("bench", &bytes)?]
        }
        (None, false) => vec![
            ComputeShaderSource::new("scale", vec![SPIRV_MAGIC]),
            ComputeShaderSource::new("offset", vec![SPIRV_MAGIC]),
        ],
        (None, true) => {
            warn!("Skipping the compute benchmark: pass --shader with a SPIR-V file");
            return Ok(());
        }
    };
    bench_compute(&device, &stage, &options, shaders)?;
    Ok(())
}

/// Kernels the host device runs for the built-in shaders.
fn register_host_kernels(host: &HostDevice) {
    host.register_kernel("scale", |_groups, bindings| {
        let out = map_words(&bindings[&0], |v| v.wrapping_mul(3));
        bindings.insert(1, out);
    });
    host.register_kernel("offset", |_groups, bindings| {
        let out = map_words(&bindings[&0], |v| v.wrapping_add(1));
        bindings.insert(1, out);
    });
}

fn map_words(bytes: &[u8], f: impl Fn(u32) -> u32) -> Vec<u8> {
    bytes
        .chunks_exact(4)
        .flat_map(|w| f(u32::from_le_bytes([w[0], w[1], w[2], w[3]])).to_le_bytes())
        .collect()
}

fn test_words(bytes: u64, seed: usize) -> Vec<u32> {
    (0..bytes / 4)
        .map(|i| (i as u32).wrapping_mul(2_654_435_761).wrapping_add(seed as u32))
        .collect()
}

fn throughput(bytes: u64, iterations: usize, elapsed: Duration) -> f64 {
    let total = bytes as f64 * iterations as f64;
    total / (1024.0 * 1024.0) / elapsed.as_secs_f64().max(f64::EPSILON)
}

/// Upload and read back one buffer per iteration.
fn bench_stage(
    device: &Arc<dyn GpuDevice>,
    stage: &Stage,
    options: &Options,
) -> anyhow::Result<()> {
    let buffer = device.create_buffer(&BufferDesc {
        name: "bench.target",
        size: options.bytes,
        usage: vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::TRANSFER_SRC
            | vk::BufferUsageFlags::TRANSFER_DST,
        location: MemoryLocation::GpuOnly,
    })?;

    let start = Instant::now();
    let mut outcome = Ok(());
    for i in 0..options.iterations {
        let words = test_words(options.bytes, i);
        let round_trip = stage
            .copy(buffer, 0, &words)
            .and_then(|()| stage.read_back(buffer, 0, options.bytes));
        match round_trip {
            Ok(back) if back == bytemuck::cast_slice::<u32, u8>(&words) => {}
            Ok(_) => {
                outcome = Err(anyhow::anyhow!("iteration {i}: read back different bytes"));
                break;
            }
            Err(e) => {
                outcome = Err(e.into());
                break;
            }
        }
    }
    let elapsed = start.elapsed();
    device.destroy_buffer(buffer)?;
    outcome?;

    info!(
        "stage: {} round trips of {} bytes in {:.2?} ({:.1} MiB/s each way)",
        options.iterations,
        options.bytes,
        elapsed,
        throughput(options.bytes, options.iterations, elapsed)
    );
    Ok(())
}

/// Submit one block per pipeline per iteration as a single chained batch.
fn bench_compute(
    device: &Arc<dyn GpuDevice>,
    stage: &Stage,
    options: &Options,
    shaders: Vec<ComputeShaderSource>,
) -> anyhow::Result<()> {
    let pipelines: Vec<Arc<ComputePipeline>> = shaders
        .into_iter()
        .map(|shader| {
            let config = ComputeConfig::new()
                .block_in_size(options.bytes)
                .block_out_size(options.bytes)
                .next_size(2)
                .debug_name(format!("bench.{}", shader.name));
            Arc::new(ComputePipeline::new(device.clone(), shader, config))
        })
        .collect();
    for pipeline in &pipelines {
        pipeline.init()?;
    }
    for pair in pipelines.windows(2) {
        pair[0].set_chain(pair[1].clone())?;
    }

    let groups = u32::try_from((options.bytes as usize / 4).div_ceil(LOCAL_SIZE))?;
    let start = Instant::now();
    for i in 0..options.iterations {
        let words = test_words(options.bytes, i);
        let outputs = run_chain(&pipelines, stage, &words, WorkSize::new(groups, 1, 1))?;
        if !options.vulkan {
            check_host_outputs(&words, &outputs)
                .with_context(|| format!("iteration {i}"))?;
        }
    }
    let elapsed = start.elapsed();

    info!(
        "compute: {} chained submissions over {} pipelines in {:.2?} ({:.1} MiB/s in)",
        options.iterations,
        pipelines.len(),
        elapsed,
        throughput(options.bytes * pipelines.len() as u64, options.iterations, elapsed)
    );
    if let Some(first) = pipelines.first() {
        first.clear_chain()?;
    }
    Ok(())
}

fn run_chain(
    pipelines: &[Arc<ComputePipeline>],
    stage: &Stage,
    words: &[u32],
    work: WorkSize,
) -> anyhow::Result<Vec<Vec<u8>>> {
    let bytes = std::mem::size_of_val(words) as u64;
    let mut lists = Vec::with_capacity(pipelines.len());
    for (k, pipeline) in pipelines.iter().enumerate() {
        let blocks = pipeline.new_blocks(1)?;
        let id = blocks[0];
        let input = pipeline
            .with_block(id, |b| b.input())?
            .context("block without an input buffer")?;
        if k == 0 {
            let mut transfer = stage.mmap(input, 0, bytes)?;
            if let Some(flight) = transfer.flight_mut() {
                flight.write_pod(words)?;
            }
            stage.flush_but_not_submit(&mut transfer)?;
            pipeline.with_block(id, |b| {
                b.flight = Some(transfer);
                b.work = work;
            })?;
        } else {
            stage.copy(input, 0, words)?;
            pipeline.with_block(id, |b| b.work = work)?;
        }
        lists.push(blocks);
    }

    let work_lists: Vec<&BlockVec> = lists.iter().collect();
    pipelines[0].enqueue_chain(&work_lists, &mut SubmitInfo::new())?;
    if pipelines[0].wait(FLUSH_WAIT_MS * 1_000_000)? == WaitOutcome::TimedOut {
        bail!("compute chain did not finish within {FLUSH_WAIT_MS} ms");
    }
    pipelines[0].poll()?;

    let mut outputs = Vec::with_capacity(pipelines.len());
    for (pipeline, blocks) in pipelines.iter().zip(&mut lists) {
        let output = pipeline
            .with_block(blocks[0], |b| b.output())?
            .context("block without an output buffer")?;
        outputs.push(stage.read_back(output, 0, bytes)?);
        pipeline.delete_blocks(blocks)?;
    }
    Ok(outputs)
}

fn check_host_outputs(words: &[u32], outputs: &[Vec<u8>]) -> anyhow::Result<()> {
    let input = bytemuck::cast_slice::<u32, u8>(words);
    let expected = [
        map_words(input, |v| v.wrapping_mul(3)),
        map_words(input, |v| v.wrapping_add(1)),
    ];
    for (k, (output, expected)) in outputs.iter().zip(&expected).enumerate() {
        if output != expected {
            bail!("pipeline {k} produced unexpected output");
        }
    }
    Ok(())
}
