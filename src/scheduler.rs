// scheduler.rs -- Tiled execution of the diffusion stencil on a device.
//
// The image is cut into a grid of tiles no larger than the device's maximum
// dispatch extent and every tile is dispatched once per iteration:
//
//   tile_extent = min(image, device max)      per axis
//   parts       = ceil(image / tile_extent)   per axis
//   offset      = part * tile_extent
//
//   +--------+--------+----+      Tiles are visited row-major (all px for
//   | (0,0)  | (1,0)  |(2,0)      py = 0, then py = 1, ...). The last
//   +--------+--------+----+      column and row are clipped to the image;
//   | (0,1)  | (1,1)  |(2,1)      the kernel never writes border pixels.
//   +--------+--------+----+
//
// Dispatches are strictly serialised: before each enqueue the scheduler
// waits for the previous task. With `UpdateScheme::InPlace` all tiles share
// one mutable buffer, so overlapping dispatches would race on tile edges.
// With `UpdateScheme::DoubleBuffered` two buffers alternate as source and
// destination, one swap per iteration, and the output is independent of the
// tile grid.
//
// State machine (Done and Failed are terminal):
//
//   Idle → PlatformSelected → DeviceSelected → ProgramBuilt
//        → BufferAllocated → Dispatching(it, tile) → ReadBack → Done
//   any  → Failed(kind)
//
// The host image is written only after a successful readback. Device
// buffers are released on every path out of `run`.

use std::fmt;
use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::backend::{
    BufferHandle, DeviceBackend, DeviceCapabilities, DeviceInfo, Dispatch, PlatformInfo,
    ProgramHandle, ProgramSource, TaskHandle, TileParams,
};
use crate::error::{DiffusionError, ErrorKind, Result};
use crate::image::{PackedImage, Rect};
use crate::params::{ProcessingParams, UpdateScheme};

// ============================================================
// Tile plan
// ============================================================

/// One dispatch region, in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    pub offset_x: usize,
    pub offset_y: usize,
    pub extent_x: usize,
    pub extent_y: usize,
}

impl Tile {
    pub fn rect(&self) -> Rect {
        Rect::new(self.offset_x, self.offset_y, self.extent_x, self.extent_y)
    }
}

/// Partition of a `width × height` image into device-sized tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilePlan {
    pub width: usize,
    pub height: usize,
    pub tile_extent_x: usize,
    pub tile_extent_y: usize,
    pub parts_x: usize,
    pub parts_y: usize,
}

impl TilePlan {
    /// # Errors
    /// `Format` for an empty image, `Dispatch` if the device reports a zero
    /// tile extent.
    pub fn new(width: usize, height: usize, caps: &DeviceCapabilities) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(DiffusionError::Format(format!(
                "cannot tile an empty {width}x{height} image"
            )));
        }
        if caps.max_tile_extent_x == 0 || caps.max_tile_extent_y == 0 {
            return Err(DiffusionError::Dispatch(format!(
                "device reports a {}x{} maximum tile extent",
                caps.max_tile_extent_x, caps.max_tile_extent_y
            )));
        }
        let tile_extent_x = width.min(caps.max_tile_extent_x);
        let tile_extent_y = height.min(caps.max_tile_extent_y);
        Ok(TilePlan {
            width,
            height,
            tile_extent_x,
            tile_extent_y,
            parts_x: width.div_ceil(tile_extent_x),
            parts_y: height.div_ceil(tile_extent_y),
        })
    }

    /// Dispatches per iteration.
    pub fn tile_count(&self) -> usize {
        self.parts_x * self.parts_y
    }

    /// Tiles in dispatch order, extents clipped to the image.
    pub fn tiles(&self) -> impl Iterator<Item = Tile> + '_ {
        (0..self.parts_y).flat_map(move |py| {
            (0..self.parts_x).map(move |px| {
                let offset_x = px * self.tile_extent_x;
                let offset_y = py * self.tile_extent_y;
                Tile {
                    offset_x,
                    offset_y,
                    extent_x: self.tile_extent_x.min(self.width - offset_x),
                    extent_y: self.tile_extent_y.min(self.height - offset_y),
                }
            })
        })
    }
}

impl fmt::Display for TilePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}×{} image as {}×{} tiles of {}×{}",
            self.width, self.height, self.parts_x, self.parts_y, self.tile_extent_x, self.tile_extent_y
        )
    }
}

// ============================================================
// State and configuration
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    PlatformSelected,
    DeviceSelected,
    ProgramBuilt,
    BufferAllocated,
    Dispatching { iteration: u32, tile: usize },
    ReadBack,
    Done,
    Failed(ErrorKind),
}

impl SchedulerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SchedulerState::Done | SchedulerState::Failed(_))
    }
}

/// Device selection and program choice for one run.
#[derive(Debug, Clone, Default)]
pub struct SchedulerOptions {
    /// Platform to use. `None` or an out-of-range index selects the first.
    pub platform_index: Option<usize>,
    /// Device on that platform. `None` or out of range selects the first.
    pub device_index: Option<usize>,
    pub program: ProgramSource,
    /// Accumulate device time over all dispatches.
    pub profiling: bool,
}

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub platform: String,
    pub device: String,
    pub plan: TilePlan,
    /// Total kernel launches, `iterations * plan.tile_count()`.
    pub dispatches: usize,
    /// Summed device time. `Some` only when profiling was enabled.
    pub device_time: Option<Duration>,
}

// ============================================================
// Scheduler
// ============================================================

/// Drives a `DeviceBackend` through one diffusion run.
pub struct TileScheduler<B: DeviceBackend> {
    backend: B,
    options: SchedulerOptions,
    state: SchedulerState,
}

impl<B: DeviceBackend> TileScheduler<B> {
    pub fn new(backend: B, options: SchedulerOptions) -> Self {
        TileScheduler { backend, options, state: SchedulerState::Idle }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    /// Run `params.iterations` tiled passes over `image` on the selected
    /// device and write the result back into `image`.
    ///
    /// A scheduler runs once. On error the image is left as it was and the
    /// state becomes `Failed(kind)`.
    pub fn run(&mut self, image: &mut PackedImage, params: &ProcessingParams) -> Result<RunReport> {
        if self.state != SchedulerState::Idle {
            return Err(DiffusionError::Dispatch(format!(
                "scheduler already ran (state {:?})",
                self.state
            )));
        }
        let result = self.execute(image, params);
        if let Err(e) = &result {
            warn!("{} run failed in {:?}: {e}", self.backend.name(), self.state);
            self.transition(SchedulerState::Failed(e.kind()));
        }
        result
    }

    fn transition(&mut self, next: SchedulerState) {
        match next {
            SchedulerState::Dispatching { .. } => trace!("scheduler: {:?} → {:?}", self.state, next),
            _ => debug!("scheduler: {:?} → {:?}", self.state, next),
        }
        self.state = next;
    }

    fn execute(&mut self, image: &mut PackedImage, params: &ProcessingParams) -> Result<RunReport> {
        params.validate()?;

        let platforms = self.backend.list_platforms()?;
        if platforms.is_empty() {
            return Err(DiffusionError::NoPlatform);
        }
        let platform = pick(&platforms, self.options.platform_index, "platform").clone();
        info!("platform: {}", platform.name);
        self.transition(SchedulerState::PlatformSelected);

        let devices = self.backend.list_devices(&platform)?;
        if devices.is_empty() {
            return Err(DiffusionError::NoDevice { platform: platform.name });
        }
        let device = pick(&devices, self.options.device_index, "device").clone();
        info!("device: {device}");
        self.transition(SchedulerState::DeviceSelected);

        let plan = TilePlan::new(image.width(), image.height(), &device.capabilities)?;
        check_capacity(image, params.scheme, &device)?;
        info!("tiling: {plan}");

        let program = self.backend.compile(&self.options.program, &device)?;
        debug!("built program `{}`", self.options.program.label());
        self.transition(SchedulerState::ProgramBuilt);

        let mut buffers = Vec::with_capacity(2);
        let outcome = self.dispatch_all(image, params, &plan, program, &mut buffers);
        for buffer in buffers {
            self.backend.release_buffer(buffer);
        }
        let (dispatches, device_time) = outcome?;

        self.transition(SchedulerState::Done);
        if let Some(t) = device_time {
            info!(
                "device time: {:.3} ms over {dispatches} dispatches",
                t.as_secs_f64() * 1e3
            );
        }
        Ok(RunReport {
            platform: platform.name,
            device: device.name,
            plan,
            dispatches,
            device_time,
        })
    }

    /// Allocate, run every tile of every iteration and read back. Every
    /// buffer allocated is pushed onto `buffers` for the caller to release.
    fn dispatch_all(
        &mut self,
        image: &mut PackedImage,
        params: &ProcessingParams,
        plan: &TilePlan,
        program: ProgramHandle,
        buffers: &mut Vec<BufferHandle>,
    ) -> Result<(usize, Option<Duration>)> {
        let size = image.byte_len();
        let mut front = self.backend.allocate_buffer(size, image.as_slice())?;
        buffers.push(front);
        let mut back = match params.scheme {
            UpdateScheme::InPlace => front,
            UpdateScheme::DoubleBuffered => {
                let b = self.backend.allocate_buffer(size, image.as_slice())?;
                buffers.push(b);
                b
            }
        };
        self.transition(SchedulerState::BufferAllocated);

        let profile = self.options.profiling;
        let mut device_time = profile.then_some(Duration::ZERO);
        let mut pending: Option<TaskHandle> = None;
        let mut dispatches = 0;

        for iteration in 0..params.iterations {
            for (index, tile) in plan.tiles().enumerate() {
                if let Some(task) = pending.take() {
                    self.complete(task, &mut device_time)?;
                }
                self.transition(SchedulerState::Dispatching { iteration, tile: index });
                let dispatch = Dispatch {
                    src: front,
                    dst: back,
                    tile: TileParams {
                        width: plan.width,
                        height: plan.height,
                        offset_x: tile.offset_x,
                        offset_y: tile.offset_y,
                        extent_x: tile.extent_x,
                        extent_y: tile.extent_y,
                        conduction: params.conduction,
                        threshold: params.threshold,
                        lambda: params.lambda,
                    },
                    profile,
                };
                pending = Some(self.backend.enqueue(program, &dispatch)?);
                dispatches += 1;
            }
            std::mem::swap(&mut front, &mut back);
        }
        if let Some(task) = pending.take() {
            self.complete(task, &mut device_time)?;
        }

        self.transition(SchedulerState::ReadBack);
        let mut out = vec![0u32; image.pixel_count()];
        self.backend.read_buffer(front, &mut out)?;
        image.swap_words(&mut out);
        Ok((dispatches, device_time))
    }

    fn complete(&mut self, task: TaskHandle, device_time: &mut Option<Duration>) -> Result<()> {
        self.backend.wait(task)?;
        if let Some(total) = device_time {
            *total += self.backend.elapsed_time(task)?;
        }
        Ok(())
    }
}

/// Bytes of device memory a run needs: one packed word per pixel per buffer.
pub fn required_bytes(image: &PackedImage, scheme: UpdateScheme) -> u64 {
    image.byte_len() * scheme.buffer_count()
}

fn check_capacity(image: &PackedImage, scheme: UpdateScheme, device: &DeviceInfo) -> Result<()> {
    let required = required_bytes(image, scheme);
    let available = device.capabilities.global_memory_bytes;
    if required > available {
        return Err(DiffusionError::Capacity {
            required,
            available,
            device: device.name.clone(),
        });
    }
    Ok(())
}

trait Indexed {
    fn describe(&self) -> &str;
}

impl Indexed for PlatformInfo {
    fn describe(&self) -> &str {
        &self.name
    }
}

impl Indexed for DeviceInfo {
    fn describe(&self) -> &str {
        &self.name
    }
}

/// Entry `wanted` of a non-empty list, or the first entry if `wanted` is
/// absent or out of range.
fn pick<'a, T: Indexed>(items: &'a [T], wanted: Option<usize>, what: &str) -> &'a T {
    match wanted {
        Some(i) if i < items.len() => &items[i],
        Some(i) => {
            warn!(
                "{what} index {i} out of range ({} available), using `{}`",
                items.len(),
                items[0].describe()
            );
            &items[0]
        }
        None => &items[0],
    }
}
