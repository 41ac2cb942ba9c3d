//! Bound detector.
//!
//! A [`Detector`] owns its module and the binding its own probe chose. Two
//! detectors over different module builds never share state. Every method
//! that calls into the module takes `&mut self`, so the module sees at most
//! one call at a time and a detect can never overlap the probe.

use std::time::Instant;

use image::GrayImage;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::DetectorConfig;
use crate::error::{Error, Result};
use crate::exports::{ExportFn, ExportTable};
use crate::frame::{self, FrameFormat};
use crate::module::{NativeModule, Value};
use crate::probe::{self, ChosenBinding, ProbeLog};
use crate::scratch::ScratchRegion;
use crate::signature::{Catalogs, FrameArgs, OptionValues};

/// Pinhole camera parameters in pixels, for pose estimation inside the module.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

/// Outcome of one detect call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionResult {
    /// Non-negative detection count; zero when the module signalled an error.
    pub count: u32,
    /// What the module's detect call returned.
    pub raw_return: Option<Value>,
    /// Conventions used for the call.
    pub binding: ChosenBinding,
    /// Sequence number of this frame, starting at 1.
    pub frame: u64,
    /// Wall time spent in the call (microseconds)
    pub elapsed_us: u64,
}

/// A detection module bound to a discovered calling convention.
pub struct Detector<M: NativeModule> {
    module: M,
    exports: ExportTable,
    config: DetectorConfig,
    options: OptionValues,
    binding: ChosenBinding,
    probe_log: ProbeLog,
    frames: u64,
}

impl<M: NativeModule> Detector<M> {
    /// Bind to `module`, probing the built-in catalogs.
    pub fn create(module: M, config: DetectorConfig) -> Result<Self> {
        Self::with_catalogs(module, config, &Catalogs::default())
    }

    /// Bind to `module`, probing the given catalogs.
    ///
    /// Resolves exports, runs the best-effort `init` and `setTagSize` calls,
    /// then probes. Fails if a mandatory export is missing or no convention
    /// is accepted; there is no partially working detector.
    pub fn with_catalogs(mut module: M, config: DetectorConfig, catalogs: &Catalogs) -> Result<Self> {
        config.validate()?;
        let exports = ExportTable::resolve(&module)?;

        if let Some(init) = exports.init {
            best_effort(&mut module, init, &[]);
        }
        if let Some(set_tag_size) = exports.set_tag_size {
            best_effort(&mut module, set_tag_size, &[Value::F64(config.tag_size_m)]);
        }

        let report = probe::run(&mut module, &exports, catalogs, &config)?;
        info!("detector bound with {}", report.binding);

        Ok(Self {
            module,
            exports,
            options: OptionValues::from(&config),
            config,
            binding: report.binding,
            probe_log: report.log,
            frames: 0,
        })
    }

    /// Run detection on a grayscale frame of exactly `width * height` bytes.
    ///
    /// Options are re-sent before every frame: the module's option state is
    /// not guaranteed to survive between calls. A failed call only fails this
    /// frame; the detector stays usable.
    pub fn detect(&mut self, gray: &[u8], width: u32, height: u32) -> Result<DetectionResult> {
        let started = Instant::now();
        self.frames += 1;
        let len = frame_len(gray.len(), width, height)?;

        if let (Some(sig), Some(export)) = (self.binding.configure, self.exports.configure_options) {
            export.call(&mut self.module, &sig.apply(&self.options))?;
        }

        let mut region = ScratchRegion::acquire(&mut self.module, &self.exports, len)?;
        region.write(gray)?;
        let frame = FrameArgs {
            pointer: region.address(),
            width,
            height,
        };
        self.exports
            .set_image_buffer
            .call(region.module(), &self.binding.image.apply(&frame))?;
        let raw_return = self
            .exports
            .detect
            .call(region.module(), &self.binding.detect.apply(&frame))?;
        region.release()?;

        let count = raw_return.and_then(|v| v.as_count()).unwrap_or(0);
        debug!(
            "frame {} ({}x{}): ret={:?} count={}",
            self.frames, width, height, raw_return, count
        );

        Ok(DetectionResult {
            count,
            raw_return,
            binding: self.binding,
            frame: self.frames,
            elapsed_us: started.elapsed().as_micros() as u64,
        })
    }

    /// Convert a colour frame to grayscale and detect on it.
    pub fn detect_frame(
        &mut self,
        data: &[u8],
        width: u32,
        height: u32,
        format: FrameFormat,
    ) -> Result<DetectionResult> {
        let gray = frame::to_gray(data, width, height, format)?;
        self.detect(&gray, width, height)
    }

    /// Detect on a grayscale image buffer.
    pub fn detect_image(&mut self, image: &GrayImage) -> Result<DetectionResult> {
        self.detect(image.as_raw(), image.width(), image.height())
    }

    /// Hand camera intrinsics to the module. Best-effort.
    ///
    /// Returns `false` when the module has no pose-info export or the call
    /// failed.
    pub fn set_pose_info(&mut self, intrinsics: CameraIntrinsics) -> bool {
        match self.exports.set_pose_info {
            Some(export) => best_effort(
                &mut self.module,
                export,
                &[
                    Value::F64(intrinsics.fx),
                    Value::F64(intrinsics.fy),
                    Value::F64(intrinsics.cx),
                    Value::F64(intrinsics.cy),
                ],
            ),
            None => false,
        }
    }

    /// Replace the detector options used from the next frame on.
    ///
    /// Probe settings in the new config have no effect; the binding is fixed.
    pub fn update_config(&mut self, config: DetectorConfig) -> Result<()> {
        config.validate()?;
        if config.tag_size_m != self.config.tag_size_m {
            if let Some(set_tag_size) = self.exports.set_tag_size {
                best_effort(&mut self.module, set_tag_size, &[Value::F64(config.tag_size_m)]);
            }
        }
        self.options = OptionValues::from(&config);
        self.config = config;
        Ok(())
    }

    /// The binding chosen at construction.
    pub fn chosen_binding(&self) -> ChosenBinding {
        self.binding
    }

    /// Attempts made by the construction probe.
    pub fn probe_log(&self) -> &ProbeLog {
        &self.probe_log
    }

    pub fn exports(&self) -> &ExportTable {
        &self.exports
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    /// Direct access to the module, bypassing the binding.
    pub fn module_mut(&mut self) -> &mut M {
        &mut self.module
    }

    /// Frames submitted so far, including failed ones.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Tear the module down and hand it back. Never fails.
    pub fn destroy(mut self) -> M {
        if let Some(destroy) = self.exports.destroy {
            best_effort(&mut self.module, destroy, &[]);
        }
        self.module
    }
}

/// Call an export whose failure must not stop the caller.
fn best_effort<M: NativeModule + ?Sized>(module: &mut M, export: ExportFn, args: &[Value]) -> bool {
    match export.try_call(module, args) {
        Ok(_) => true,
        Err(trap) => {
            warn!("{} ({}) failed but continuing: {}", export.operation, export.name, trap);
            false
        }
    }
}

fn frame_len(actual: usize, width: u32, height: u32) -> Result<usize> {
    if width == 0 || height == 0 {
        return Err(Error::InvalidFrame(format!(
            "empty frame {}x{}",
            width, height
        )));
    }
    let expected = (width as usize)
        .checked_mul(height as usize)
        .ok_or_else(|| Error::InvalidFrame(format!("frame {}x{} is too large", width, height)))?;
    if actual != expected {
        return Err(Error::InvalidFrame(format!(
            "{}x{} grayscale frame needs {} bytes, got {}",
            width, height, expected, actual
        )));
    }
    Ok(expected)
}
