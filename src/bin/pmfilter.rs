// pmfilter -- command-line front end.
//
//   pmfilter run input.ppm output.ppm [--mode both] [-i 16] [-t 30] ...
//   pmfilter platforms
//   pmfilter devices --platform 0
//
// In `both` mode the two results are written next to OUTPUT with `s_` and
// `p_` prefixes and compared pixel by pixel.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{info, warn};

use pm_diffusion::backend::{DeviceBackend, HostBackend, ProgramSource};
use pm_diffusion::gpu::{DeviceProfile, WgpuBackend, WgpuConfig};
use pm_diffusion::ppm::PpmImage;
use pm_diffusion::report::{self, ReportRow};
use pm_diffusion::{
    sequential, Conduction, PackedImage, ProcessingParams, RunReport, SchedulerOptions,
    TileScheduler, UpdateScheme,
};

#[derive(Parser)]
#[command(name = "pmfilter", version, about = "Perona-Malik anisotropic diffusion for PPM images")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Compute backend for accelerated runs and device listings
    #[arg(long, value_enum, default_value_t = BackendKind::Wgpu, global = true)]
    backend: BackendKind,

    /// Hardware profile applied to wgpu device limits: native or rpi
    #[arg(long, default_value_t = DeviceProfile::Native, global = true)]
    gpu_profile: DeviceProfile,

    /// Cap the tile extent reported by wgpu devices
    #[arg(long, global = true)]
    max_tile: Option<usize>,
}

#[derive(Subcommand)]
enum Command {
    /// Filter a P6 image
    Run {
        /// Source image (binary PPM)
        input: PathBuf,

        /// Destination image (binary PPM)
        output: PathBuf,

        /// Which engine(s) to run
        #[arg(short = 'r', long, value_enum, default_value_t = RunMode::Accelerated)]
        mode: RunMode,

        /// Number of diffusion passes
        #[arg(short, long, default_value_t = 16)]
        iterations: u32,

        /// Conduction function: quadric (0) or exponential (1)
        #[arg(short = 'f', long, default_value_t = Conduction::Exponential)]
        conduction: Conduction,

        /// Edge threshold of the conduction function
        #[arg(short, long, default_value_t = 30.0)]
        threshold: f32,

        /// Integration step, 0 < lambda <= 0.25
        #[arg(long, default_value_t = 0.25)]
        lambda: f32,

        /// Buffer update scheme: in-place or double-buffered
        #[arg(long, default_value_t = UpdateScheme::DoubleBuffered)]
        scheme: UpdateScheme,

        /// Platform index (falls back to the first)
        #[arg(short, long)]
        platform: Option<usize>,

        /// Device index on that platform (falls back to the first)
        #[arg(short, long)]
        device: Option<usize>,

        /// WGSL kernel to build instead of the built-in stencil
        #[arg(short, long)]
        kernel: Option<PathBuf>,

        /// Measure device time of every dispatch
        #[arg(long)]
        profile: bool,

        /// Append a timing row to this markdown file
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// List available platforms
    Platforms,

    /// List devices of one platform
    Devices {
        #[arg(short, long, default_value_t = 0)]
        platform: usize,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RunMode {
    Sequential,
    Accelerated,
    Both,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    Wgpu,
    Host,
}

struct Accelerated {
    options: SchedulerOptions,
    report: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.backend {
        BackendKind::Wgpu => {
            let config = WgpuConfig {
                profile: cli.gpu_profile,
                max_tile_extent: cli.max_tile,
                ..Default::default()
            };
            dispatch_command(cli.command, || WgpuBackend::new(config))
        }
        BackendKind::Host => dispatch_command(cli.command, HostBackend::new),
    }
}

fn dispatch_command<B: DeviceBackend>(command: Command, make_backend: impl FnOnce() -> B) -> Result<()> {
    match command {
        Command::Platforms => {
            let mut backend = make_backend();
            let platforms = backend.list_platforms()?;
            if platforms.is_empty() {
                println!("no platforms found");
            }
            for p in platforms {
                println!("{}: {}", p.index, p.name);
            }
            Ok(())
        }

        Command::Devices { platform } => {
            let mut backend = make_backend();
            let platforms = backend.list_platforms()?;
            let Some(p) = platforms.get(platform) else {
                bail!("platform index {platform} out of range ({} available)", platforms.len());
            };
            for d in backend.list_devices(p)? {
                println!("{}: {d}", d.index);
            }
            Ok(())
        }

        Command::Run {
            input,
            output,
            mode,
            iterations,
            conduction,
            threshold,
            lambda,
            scheme,
            platform,
            device,
            kernel,
            profile,
            report,
        } => {
            let params = ProcessingParams { iterations, conduction, threshold, lambda, scheme };
            params.validate()?;
            info!(
                "{iterations} iterations, {conduction} conduction, threshold {threshold}, \
                 lambda {lambda}, {scheme}"
            );

            let source = PpmImage::load(&input)
                .with_context(|| format!("reading {}", input.display()))?;
            let image = source.to_packed()?;
            info!("image: {}×{}", image.width(), image.height());

            let program = match &kernel {
                Some(path) => ProgramSource::Wgsl {
                    label: path.display().to_string(),
                    source: std::fs::read_to_string(path)
                        .with_context(|| format!("reading kernel {}", path.display()))?,
                },
                None => ProgramSource::Builtin,
            };
            let accel = Accelerated {
                options: SchedulerOptions {
                    platform_index: platform,
                    device_index: device,
                    program,
                    profiling: profile,
                },
                report,
            };

            match mode {
                RunMode::Sequential => {
                    let out = run_sequential(&image, &params)?;
                    save(&out, &output)
                }
                RunMode::Accelerated => {
                    let out = run_accelerated(make_backend(), accel, &image, &params)?;
                    save(&out, &output)
                }
                RunMode::Both => {
                    let seq = run_sequential(&image, &params)?;
                    save(&seq, &prefixed(&output, "s_"))?;
                    let par = run_accelerated(make_backend(), accel, &image, &params)?;
                    save(&par, &prefixed(&output, "p_"))?;
                    compare(&seq, &par);
                    Ok(())
                }
            }
        }
    }
}

fn run_sequential(image: &PackedImage, params: &ProcessingParams) -> Result<PackedImage> {
    info!("processing sequentially...");
    let mut out = image.clone();
    let start = Instant::now();
    sequential::diffuse(&mut out, params)?;
    info!("sequential time: {:.3} ms", start.elapsed().as_secs_f64() * 1e3);
    Ok(out)
}

fn run_accelerated<B: DeviceBackend>(
    backend: B,
    accel: Accelerated,
    image: &PackedImage,
    params: &ProcessingParams,
) -> Result<PackedImage> {
    info!("processing on {}...", backend.name());
    let mut out = image.clone();
    let mut scheduler = TileScheduler::new(backend, accel.options);
    let start = Instant::now();
    let run: RunReport = scheduler.run(&mut out, params)?;
    let wall = start.elapsed();
    info!(
        "accelerated time: {:.3} ms ({} dispatches, {})",
        wall.as_secs_f64() * 1e3,
        run.dispatches,
        run.plan
    );

    if let Some(path) = &accel.report {
        let row = ReportRow {
            platform: run.platform.clone(),
            device: run.device.clone(),
            iterations: params.iterations,
            width: image.width(),
            height: image.height(),
            time: run.device_time.unwrap_or(wall),
        };
        report::append(path, &row).with_context(|| format!("writing report {}", path.display()))?;
    }
    Ok(out)
}

fn save(image: &PackedImage, path: &Path) -> Result<()> {
    info!("saving {}", path.display());
    PpmImage::from_packed(image)?
        .save(path)
        .with_context(|| format!("writing {}", path.display()))
}

/// `dir/name.ppm` → `dir/<prefix>name.ppm`.
fn prefixed(path: &Path, prefix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{prefix}{name}"))
}

fn compare(seq: &PackedImage, par: &PackedImage) {
    let mut differing = 0usize;
    let mut max_delta = 0u8;
    for (a, b) in seq.as_slice().iter().zip(par.as_slice()) {
        if a != b {
            differing += 1;
            for shift in [0, 8, 16] {
                let ca = (a >> shift) as u8;
                let cb = (b >> shift) as u8;
                max_delta = max_delta.max(ca.abs_diff(cb));
            }
        }
    }
    if differing == 0 {
        info!("sequential and accelerated outputs are identical");
    } else {
        warn!(
            "{differing} of {} pixels differ (max channel delta {max_delta})",
            seq.pixel_count()
        );
    }
}
