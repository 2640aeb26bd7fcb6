// gpu/mod.rs -- wgpu acceleration layer.
//
// `WgpuBackend` implements the crate's `DeviceBackend` contract on top of
// wgpu, so the tile scheduler drives a real GPU exactly as it drives the
// host emulator. The CPU stencil in `stencil.rs` remains the authoritative
// reference: the WGSL kernel in `shaders/diffusion.wgsl` is validated
// against it (within one intensity step per channel, see the backend tests).

pub mod backend;
pub mod device;

pub use backend::{WgpuBackend, WgpuConfig};
pub use device::{DeviceProfile, GpuDevice, WorkgroupSize};
