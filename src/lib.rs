// pm-diffusion: Perona-Malik anisotropic diffusion
// CPU reference engine plus a tiled device scheduler (wgpu or host emulation)
//
// Reference: Perona, Malik -- "Scale-Space and Edge Detection Using
// Anisotropic Diffusion" (IEEE PAMI 1990)

pub mod error;
pub mod pack;
pub mod conduction;
pub mod params;
pub mod image;
pub mod stencil;
pub mod sequential;
pub mod backend;
pub mod scheduler;
pub mod gpu;
pub mod ppm;
pub mod report;

pub use conduction::Conduction;
pub use error::{DiffusionError, ErrorKind, Result};
pub use image::PackedImage;
pub use params::{ProcessingParams, UpdateScheme};
pub use scheduler::{RunReport, SchedulerOptions, SchedulerState, TilePlan, TileScheduler};
