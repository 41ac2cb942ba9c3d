//! Detector configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Options applied to the module and to the probe.
///
/// Every field has a default, so a config file only needs the values it
/// changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Physical tag edge length in meters
    pub tag_size_m: f64,
    /// Detector worker threads (0 means one)
    pub n_threads: u32,
    /// Quad decimation factor (0 means no decimation)
    pub quad_decimate: f64,
    /// Gaussian blur sigma applied before quad detection
    pub quad_sigma: f64,
    /// Snap quad edges to strong gradients
    pub refine_edges: bool,
    /// Sharpening applied while decoding tag bits
    pub decode_sharpening: f64,
    /// Width of the blank probe frame
    pub probe_width: u32,
    /// Height of the blank probe frame
    pub probe_height: u32,
    /// Keep probing after the first accepted pair to complete the attempt log
    pub exhaustive_probe: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            tag_size_m: 0.20,
            n_threads: 1,
            quad_decimate: 1.0,
            quad_sigma: 0.0,
            refine_edges: true,
            decode_sharpening: 0.25,
            probe_width: 64,
            probe_height: 64,
            exhaustive_probe: false,
        }
    }
}

impl DetectorConfig {
    /// Parse a JSON config document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Check that every value can be sent to the module.
    pub fn validate(&self) -> Result<()> {
        let non_negative = [
            ("tag_size_m", self.tag_size_m),
            ("quad_decimate", self.quad_decimate),
            ("quad_sigma", self.quad_sigma),
            ("decode_sharpening", self.decode_sharpening),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::Config(format!(
                    "{} must be a finite non-negative number, got {}",
                    name, value
                )));
            }
        }
        if self.n_threads > i32::MAX as u32 {
            return Err(Error::Config(format!(
                "n_threads is too large: {}",
                self.n_threads
            )));
        }
        if self.probe_width == 0 || self.probe_height == 0 {
            return Err(Error::Config(format!(
                "probe frame must be non-empty, got {}x{}",
                self.probe_width, self.probe_height
            )));
        }
        if (self.probe_width as u64) * (self.probe_height as u64) > i32::MAX as u64 {
            return Err(Error::Config(format!(
                "probe frame {}x{} exceeds the module address space",
                self.probe_width, self.probe_height
            )));
        }
        Ok(())
    }
}
