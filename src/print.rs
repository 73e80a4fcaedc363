//! Print sink
//!
//! The composite reaches the sink at native resolution. A sink may convert
//! colour, but it never resamples: a width that does not match the print
//! head is an error, not something to stretch.

use image::{DynamicImage, RgbaImage};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::THERMAL_WIDTH;

#[derive(Debug, Error)]
pub enum PrintError {
    #[error("Composite is {actual} px wide, printer expects {expected}")]
    WidthMismatch { expected: u32, actual: u32 },

    #[error("Print spec rejected: {0}")]
    InvalidSpec(&'static str),

    #[error("Could not write print output: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not encode print output: {0}")]
    Encode(#[from] image::ImageError),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ColorSpace {
    Rgb,
    Grayscale,
}

/// Print specifications for physical output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrintSpec {
    #[serde(default = "default_dots_per_line")]
    pub dots_per_line: u32,
    #[serde(default = "default_dpi")]
    pub dpi: u32,
    #[serde(default = "default_color_space")]
    pub color_space: ColorSpace,
}

fn default_dots_per_line() -> u32 { THERMAL_WIDTH }
fn default_dpi() -> u32 { 203 }
fn default_color_space() -> ColorSpace { ColorSpace::Grayscale }

impl Default for PrintSpec {
    fn default() -> Self {
        Self {
            dots_per_line: default_dots_per_line(),
            dpi: default_dpi(),
            color_space: default_color_space(),
        }
    }
}

impl PrintSpec {
    /// Check values loaded from configuration.
    pub fn validate(&self) -> Result<(), PrintError> {
        if self.dots_per_line == 0 {
            return Err(PrintError::InvalidSpec("dots per line must be positive"));
        }
        if self.dpi < 72 || self.dpi > 1200 {
            return Err(PrintError::InvalidSpec("DPI must be between 72 and 1200"));
        }
        Ok(())
    }

    /// Printed length of a composite, in millimetres.
    pub fn length_mm(&self, height_px: u32) -> f64 {
        height_px as f64 / self.dpi as f64 * 25.4
    }

    pub fn check_width(&self, composite: &RgbaImage) -> Result<(), PrintError> {
        if composite.width() != self.dots_per_line {
            return Err(PrintError::WidthMismatch {
                expected: self.dots_per_line,
                actual: composite.width(),
            });
        }
        Ok(())
    }
}

pub trait PrintSink {
    fn submit(&mut self, composite: &RgbaImage, spec: &PrintSpec) -> Result<(), PrintError>;
}

/// Writes each job as a numbered PNG; stands in for a driver queue.
pub struct PngFileSink {
    dir: PathBuf,
    jobs: u32,
    last_output: Option<PathBuf>,
}

impl PngFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, PrintError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let jobs = highest_job_number(&dir)?;
        if jobs > 0 {
            log::debug!("continuing print numbering in {} after job {}", dir.display(), jobs);
        }
        Ok(Self { dir, jobs, last_output: None })
    }

    pub fn last_output(&self) -> Option<&Path> {
        self.last_output.as_deref()
    }
}

/// Highest `NNNN` among `print-NNNN.png` files already in `dir`.
fn highest_job_number(dir: &Path) -> Result<u32, PrintError> {
    let mut highest = 0;
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let number = name
            .to_str()
            .and_then(|n| n.strip_prefix("print-"))
            .and_then(|n| n.strip_suffix(".png"))
            .and_then(|n| n.parse::<u32>().ok());
        if let Some(number) = number {
            highest = highest.max(number);
        }
    }
    Ok(highest)
}

impl PrintSink for PngFileSink {
    fn submit(&mut self, composite: &RgbaImage, spec: &PrintSpec) -> Result<(), PrintError> {
        spec.check_width(composite)?;

        self.jobs = self.jobs.saturating_add(1);
        let path = self.dir.join(format!("print-{:04}.png", self.jobs));
        let image = DynamicImage::ImageRgba8(composite.clone());
        match spec.color_space {
            ColorSpace::Grayscale => image.to_luma8().save(&path)?,
            ColorSpace::Rgb => image.to_rgb8().save(&path)?,
        }
        log::info!(
            "print job {} written to {} ({}x{}, {:.1} mm)",
            self.jobs,
            path.display(),
            composite.width(),
            composite.height(),
            spec.length_mm(composite.height())
        );
        self.last_output = Some(path);
        Ok(())
    }
}
