//! # atag-core
//!
//! Binds a host to a pre-compiled AprilTag detection module whose exported
//! entry points change names and argument order between builds.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────┐   ┌──────────────┐   ┌─────────────────┐
//! │ NativeModule │──▶│ ExportTable │──▶│ probe::run   │──▶│ Detector        │
//! │ (opaque)     │   │ (by name)   │   │ (catalogs)   │   │ (ChosenBinding) │
//! └──────────────┘   └─────────────┘   └──────────────┘   └─────────────────┘
//!                                             │                    │
//!                                             └── ScratchRegion ───┘
//! ```
//!
//! 1. [`ExportTable::resolve`] binds each logical operation to the first
//!    export name the module actually has.
//! 2. [`probe::run`] tries configure/detect conventions against a blank frame
//!    and keeps the first pair whose detect call returns a non-negative
//!    number.
//! 3. [`Detector::detect`] replays that pair on every real frame.
//!
//! Frames cross into the module through a [`ScratchRegion`], which releases
//! its allocation on every exit path.
//!
//! ## Usage
//!
//! ```rust
//! use atag_core::{Detector, DetectorConfig, ModuleScript, ScriptedModule};
//!
//! let module = ScriptedModule::new(ModuleScript::default());
//! let mut detector = Detector::create(module, DetectorConfig::default())?;
//! println!("bound: {}", detector.chosen_binding());
//!
//! let frame = vec![0u8; 320 * 240];
//! let result = detector.detect(&frame, 320, 240)?;
//! assert_eq!(result.count, 0);
//! # Ok::<(), atag_core::Error>(())
//! ```

pub mod config;
pub mod detector;
pub mod error;
pub mod exports;
pub mod frame;
pub mod module;
pub mod probe;
pub mod scratch;
pub mod scripted;
pub mod signature;
pub mod tracing;

// Re-export main types
pub use config::DetectorConfig;
pub use detector::{CameraIntrinsics, DetectionResult, Detector};
pub use error::{Error, Result};
pub use exports::{ExportFn, ExportTable, Operation};
pub use frame::FrameFormat;
pub use module::{ExportKind, NativeModule, Trap, Value};
pub use probe::{ChosenBinding, ProbeAttempt, ProbeLog, ProbeReport};
pub use scratch::ScratchRegion;
pub use scripted::{Mismatch, ModuleScript, ScriptedModule};
pub use signature::{Catalogs, ConfigureSignature, FrameSignature, Signature};
