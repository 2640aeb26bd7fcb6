// backend/mod.rs -- Compute backend contract consumed by the tile scheduler.
//
// The scheduler only ever talks to a `DeviceBackend`. It never sees wgpu
// types, so its tiling, ordering and capacity logic can be exercised on the
// CPU emulator in `host` and on hand-written failing backends in tests.
//
// Lifecycle of one run, as driven by `TileScheduler`:
//
//   list_platforms → list_devices → compile → allocate_buffer (×1 or ×2)
//     → { wait(prev); enqueue(tile) } for every tile of every iteration
//     → wait(last) → read_buffer → release_buffer
//
// Handles are plain indices into backend-owned arenas. A backend may reject
// a handle it did not issue with `Dispatch`.

pub mod host;

use std::fmt;
use std::time::Duration;

use crate::conduction::Conduction;
use crate::error::Result;

pub use host::HostBackend;

/// One discoverable platform (an API or driver family).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    pub index: usize,
    pub name: String,
}

/// Limits the scheduler plans against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// Largest tile width one dispatch may cover.
    pub max_tile_extent_x: usize,
    /// Largest tile height one dispatch may cover.
    pub max_tile_extent_y: usize,
    /// Bytes of device memory available for image buffers.
    pub global_memory_bytes: u64,
}

/// One device on a platform.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub platform: usize,
    pub index: usize,
    pub name: String,
    pub capabilities: DeviceCapabilities,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (tile ≤ {}×{}, {} MiB)",
            self.name,
            self.capabilities.max_tile_extent_x,
            self.capabilities.max_tile_extent_y,
            self.capabilities.global_memory_bytes >> 20
        )
    }
}

/// What to build into a program.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ProgramSource {
    /// The stencil shipped with the crate.
    #[default]
    Builtin,
    /// User-supplied WGSL text. Must expose the same entry points and
    /// bindings as the built-in stencil.
    Wgsl { label: String, source: String },
}

impl ProgramSource {
    pub fn label(&self) -> &str {
        match self {
            ProgramSource::Builtin => "builtin",
            ProgramSource::Wgsl { label, .. } => label,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramHandle(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(pub usize);

/// Per-dispatch arguments of the stencil kernel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileParams {
    /// Full image size, needed to find the border.
    pub width: usize,
    pub height: usize,
    pub offset_x: usize,
    pub offset_y: usize,
    pub extent_x: usize,
    pub extent_y: usize,
    pub conduction: Conduction,
    pub threshold: f32,
    pub lambda: f32,
}

/// One kernel launch. `src == dst` requests an in-place update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dispatch {
    pub src: BufferHandle,
    pub dst: BufferHandle,
    pub tile: TileParams,
    /// Capture device time for `elapsed_time`.
    pub profile: bool,
}

impl Dispatch {
    pub fn is_in_place(&self) -> bool {
        self.src == self.dst
    }
}

/// A compute device able to run the diffusion stencil over tiles of a
/// packed image buffer.
pub trait DeviceBackend {
    /// Short name used in logs and reports.
    fn name(&self) -> &str;

    fn list_platforms(&mut self) -> Result<Vec<PlatformInfo>>;

    fn list_devices(&mut self, platform: &PlatformInfo) -> Result<Vec<DeviceInfo>>;

    /// Build `source` for `device`. Selecting the device happens here: every
    /// later call targets the device of the most recent successful compile.
    ///
    /// # Errors
    /// `Compile` with the backend's diagnostic log.
    fn compile(&mut self, source: &ProgramSource, device: &DeviceInfo) -> Result<ProgramHandle>;

    /// Allocate `size_bytes` of device memory initialised from `host_data`.
    fn allocate_buffer(&mut self, size_bytes: u64, host_data: &[u32]) -> Result<BufferHandle>;

    /// Queue one tile dispatch. May return before the work completes.
    fn enqueue(&mut self, program: ProgramHandle, dispatch: &Dispatch) -> Result<TaskHandle>;

    /// Block until `task` has completed. An unprofiled task is forgotten
    /// afterwards and its handle becomes unknown.
    fn wait(&mut self, task: TaskHandle) -> Result<()>;

    /// Device time spent on `task`. Only meaningful for dispatches enqueued
    /// with `profile` set, after `wait` has returned. Reading the time
    /// retires the task.
    fn elapsed_time(&mut self, task: TaskHandle) -> Result<Duration>;

    /// Copy the buffer contents into `out`, which must hold exactly as many
    /// words as the buffer.
    fn read_buffer(&mut self, buffer: BufferHandle, out: &mut [u32]) -> Result<()>;

    /// Free a buffer. Releasing an unknown handle is a no-op. The handle
    /// may be handed out again by a later allocation.
    fn release_buffer(&mut self, buffer: BufferHandle);
}
