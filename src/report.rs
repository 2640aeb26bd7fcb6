// report.rs -- Markdown timing table appended after accelerated runs.
//
//   | platform & device | iterations | width x height, px | time, ms |
//   |-------------------|------------|--------------------|----------|
//   | Vulkan NVIDIA ... | 16 | 1920 x 1080 | 12.345 |
//
// The header is written only when the file is new or empty, so repeated
// runs accumulate rows in one table.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

pub const HEADER: &str = "| platform & device | iterations | width x height, px | time, ms |\n\
                          |-------------------|------------|--------------------|----------|\n";

/// One timed run.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportRow {
    pub platform: String,
    pub device: String,
    pub iterations: u32,
    pub width: usize,
    pub height: usize,
    pub time: Duration,
}

impl ReportRow {
    pub fn to_markdown(&self) -> String {
        format!(
            "| {} {} | {} | {} x {} | {:.3} |\n",
            self.platform,
            self.device,
            self.iterations,
            self.width,
            self.height,
            self.time.as_secs_f64() * 1e3
        )
    }
}

/// Append `row` to the table at `path`, creating the file if needed.
pub fn append(path: impl AsRef<Path>, row: &ReportRow) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path.as_ref())?;
    if file.metadata()?.len() == 0 {
        file.write_all(HEADER.as_bytes())?;
    }
    file.write_all(row.to_markdown().as_bytes())?;
    Ok(())
}
