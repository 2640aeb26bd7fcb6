// backend/host.rs -- CPU emulation of a compute device.
//
// Runs every dispatch synchronously on the calling thread with the same
// `Stencil` the sequential engine uses, so a tiled run on this backend must
// match the sequential engine bit-for-bit. Platforms, devices and their
// capabilities are plain configuration, which lets tests provoke the
// scheduler's discovery and capacity failures without any hardware.
//
// Only `ProgramSource::Builtin` compiles here. WGSL text is rejected with a
// `Compile` error because there is nothing on the host to run it.
//
// Task records are retired once nothing more can be asked of them: at
// `wait` for unprofiled tasks, at `elapsed_time` for profiled ones. Freed
// buffer slots are handed out again by later allocations.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::debug;

use super::{
    BufferHandle, DeviceBackend, DeviceCapabilities, DeviceInfo, Dispatch, PlatformInfo,
    ProgramHandle, ProgramSource, TaskHandle,
};
use crate::error::{DiffusionError, Result};
use crate::image::Rect;
use crate::stencil::Stencil;

/// A configured device of the emulator.
#[derive(Debug, Clone, PartialEq)]
pub struct HostDevice {
    pub name: String,
    pub capabilities: DeviceCapabilities,
}

/// A configured platform of the emulator.
#[derive(Debug, Clone, PartialEq)]
pub struct HostPlatform {
    pub name: String,
    pub devices: Vec<HostDevice>,
}

impl HostPlatform {
    pub fn new(name: &str, devices: Vec<HostDevice>) -> Self {
        HostPlatform { name: name.to_string(), devices }
    }
}

impl HostDevice {
    pub fn new(name: &str, capabilities: DeviceCapabilities) -> Self {
        HostDevice { name: name.to_string(), capabilities }
    }
}

/// Capabilities of the default emulated device.
pub const DEFAULT_HOST_CAPABILITIES: DeviceCapabilities = DeviceCapabilities {
    max_tile_extent_x: 256,
    max_tile_extent_y: 256,
    global_memory_bytes: 1 << 30,
};

#[derive(Debug)]
struct TaskRecord {
    elapsed: Option<Duration>,
}

/// CPU-backed `DeviceBackend`.
#[derive(Debug)]
pub struct HostBackend {
    platforms: Vec<HostPlatform>,
    selected: Option<DeviceInfo>,
    programs: Vec<ProgramSource>,
    buffers: Vec<Option<Vec<u32>>>,
    tasks: HashMap<usize, TaskRecord>,
    next_task: usize,
    dispatch_log: Vec<Dispatch>,
    allocations: usize,
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBackend {
    /// One platform with one device using `DEFAULT_HOST_CAPABILITIES`.
    pub fn new() -> Self {
        Self::with_capabilities(DEFAULT_HOST_CAPABILITIES)
    }

    /// One platform with one device using `capabilities`.
    pub fn with_capabilities(capabilities: DeviceCapabilities) -> Self {
        Self::with_platforms(vec![HostPlatform::new(
            "host",
            vec![HostDevice::new("cpu-emulator", capabilities)],
        )])
    }

    /// Arbitrary platform/device layout. An empty list models a machine
    /// with no accelerator runtime installed.
    pub fn with_platforms(platforms: Vec<HostPlatform>) -> Self {
        HostBackend {
            platforms,
            selected: None,
            programs: Vec::new(),
            buffers: Vec::new(),
            tasks: HashMap::new(),
            next_task: 0,
            dispatch_log: Vec::new(),
            allocations: 0,
        }
    }

    /// Every dispatch enqueued so far, in order.
    pub fn dispatch_log(&self) -> &[Dispatch] {
        &self.dispatch_log
    }

    /// Number of `allocate_buffer` calls that succeeded.
    pub fn allocation_count(&self) -> usize {
        self.allocations
    }

    /// Buffers allocated and not yet released.
    pub fn live_buffers(&self) -> usize {
        self.buffers.iter().filter(|b| b.is_some()).count()
    }

    /// Task records not yet retired.
    pub fn live_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Device targeted by the last successful compile.
    pub fn selected_device(&self) -> Option<&DeviceInfo> {
        self.selected.as_ref()
    }

    fn buffer(&self, handle: BufferHandle) -> Result<&Vec<u32>> {
        self.buffers
            .get(handle.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| DiffusionError::Dispatch(format!("unknown buffer {}", handle.0)))
    }

    fn take_buffer(&mut self, handle: BufferHandle) -> Result<Vec<u32>> {
        self.buffers
            .get_mut(handle.0)
            .and_then(Option::take)
            .ok_or_else(|| DiffusionError::Dispatch(format!("unknown buffer {}", handle.0)))
    }

    fn task(&self, task: TaskHandle) -> Result<&TaskRecord> {
        self.tasks
            .get(&task.0)
            .ok_or_else(|| DiffusionError::Dispatch(format!("unknown task {}", task.0)))
    }
}

impl DeviceBackend for HostBackend {
    fn name(&self) -> &str {
        "host"
    }

    fn list_platforms(&mut self) -> Result<Vec<PlatformInfo>> {
        Ok(self
            .platforms
            .iter()
            .enumerate()
            .map(|(index, p)| PlatformInfo { index, name: p.name.clone() })
            .collect())
    }

    fn list_devices(&mut self, platform: &PlatformInfo) -> Result<Vec<DeviceInfo>> {
        let p = self
            .platforms
            .get(platform.index)
            .ok_or(DiffusionError::NoDevice { platform: platform.name.clone() })?;
        Ok(p.devices
            .iter()
            .enumerate()
            .map(|(index, d)| DeviceInfo {
                platform: platform.index,
                index,
                name: d.name.clone(),
                capabilities: d.capabilities,
            })
            .collect())
    }

    fn compile(&mut self, source: &ProgramSource, device: &DeviceInfo) -> Result<ProgramHandle> {
        match source {
            ProgramSource::Builtin => {
                self.selected = Some(device.clone());
                self.programs.push(source.clone());
                Ok(ProgramHandle(self.programs.len() - 1))
            }
            ProgramSource::Wgsl { label, .. } => Err(DiffusionError::Compile {
                log: format!("{label}: the host emulator runs only the built-in stencil"),
            }),
        }
    }

    fn allocate_buffer(&mut self, size_bytes: u64, host_data: &[u32]) -> Result<BufferHandle> {
        let words = (size_bytes / 4) as usize;
        if size_bytes % 4 != 0 || words != host_data.len() {
            return Err(DiffusionError::Dispatch(format!(
                "buffer of {size_bytes} bytes cannot hold {} words",
                host_data.len()
            )));
        }
        if let Some(device) = &self.selected {
            let live: u64 = self.buffers.iter().flatten().map(|b| b.len() as u64 * 4).sum();
            let available = device.capabilities.global_memory_bytes;
            if live + size_bytes > available {
                return Err(DiffusionError::Capacity {
                    required: live + size_bytes,
                    available,
                    device: device.name.clone(),
                });
            }
        }
        let words = Some(host_data.to_vec());
        self.allocations += 1;
        match self.buffers.iter().position(Option::is_none) {
            Some(slot) => {
                self.buffers[slot] = words;
                Ok(BufferHandle(slot))
            }
            None => {
                self.buffers.push(words);
                Ok(BufferHandle(self.buffers.len() - 1))
            }
        }
    }

    fn enqueue(&mut self, program: ProgramHandle, dispatch: &Dispatch) -> Result<TaskHandle> {
        if program.0 >= self.programs.len() {
            return Err(DiffusionError::Dispatch(format!("unknown program {}", program.0)));
        }
        let t = &dispatch.tile;
        let stencil = Stencil::new(t.conduction, t.threshold, t.lambda);
        let region = Rect::new(t.offset_x, t.offset_y, t.extent_x, t.extent_y)
            .clip_to_interior(t.width, t.height);

        let start = Instant::now();
        if dispatch.is_in_place() {
            let mut words = self.take_buffer(dispatch.dst)?;
            if words.len() != t.width * t.height {
                self.buffers[dispatch.dst.0] = Some(words);
                return Err(DiffusionError::Dispatch("tile does not match buffer size".into()));
            }
            stencil.apply_region_in_place(&mut words, t.width, region);
            self.buffers[dispatch.dst.0] = Some(words);
        } else {
            let mut dst = self.take_buffer(dispatch.dst)?;
            let result = match self.buffer(dispatch.src) {
                Ok(src) if src.len() == dst.len() && src.len() == t.width * t.height => {
                    stencil.apply_region(src, &mut dst, t.width, region);
                    Ok(())
                }
                Ok(_) => Err(DiffusionError::Dispatch("tile does not match buffer size".into())),
                Err(e) => Err(e),
            };
            self.buffers[dispatch.dst.0] = Some(dst);
            result?;
        }
        let elapsed = dispatch.profile.then(|| start.elapsed());

        debug!(
            "host: tile ({},{}) {}×{} → {} pixels",
            t.offset_x,
            t.offset_y,
            t.extent_x,
            t.extent_y,
            region.width * region.height
        );
        self.dispatch_log.push(*dispatch);
        let handle = self.next_task;
        self.next_task += 1;
        self.tasks.insert(handle, TaskRecord { elapsed });
        Ok(TaskHandle(handle))
    }

    fn wait(&mut self, task: TaskHandle) -> Result<()> {
        // Dispatches complete inside `enqueue`.
        if self.task(task)?.elapsed.is_none() {
            self.tasks.remove(&task.0);
        }
        Ok(())
    }

    fn elapsed_time(&mut self, task: TaskHandle) -> Result<Duration> {
        let elapsed = self.task(task)?.elapsed.ok_or_else(|| {
            DiffusionError::Dispatch(format!("task {} was not profiled", task.0))
        })?;
        self.tasks.remove(&task.0);
        Ok(elapsed)
    }

    fn read_buffer(&mut self, buffer: BufferHandle, out: &mut [u32]) -> Result<()> {
        let words = self.buffer(buffer)?;
        if words.len() != out.len() {
            return Err(DiffusionError::Dispatch(format!(
                "read of {} words from a buffer of {}",
                out.len(),
                words.len()
            )));
        }
        out.copy_from_slice(words);
        Ok(())
    }

    fn release_buffer(&mut self, buffer: BufferHandle) {
        if let Some(slot) = self.buffers.get_mut(buffer.0) {
            *slot = None;
        }
    }
}
