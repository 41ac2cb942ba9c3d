//! Capability resolution.
//!
//! Module builds have shipped the same entry points under several names. Each
//! logical [`Operation`] carries the ordered list of names it has been seen
//! under; the first one the module exports as a function wins.

use std::fmt;

use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::module::{ExportKind, NativeModule, Trap, Value};

/// Logical operations the detector needs from a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    Init,
    Destroy,
    ConfigureOptions,
    SetPoseInfo,
    SetImageBuffer,
    SetTagSize,
    Detect,
    Allocate,
    Release,
}

impl Operation {
    pub const ALL: [Operation; 9] = [
        Operation::Init,
        Operation::Destroy,
        Operation::ConfigureOptions,
        Operation::SetPoseInfo,
        Operation::SetImageBuffer,
        Operation::SetTagSize,
        Operation::Detect,
        Operation::Allocate,
        Operation::Release,
    ];

    /// Export names this operation has been published under, most recent first.
    pub fn candidates(&self) -> &'static [&'static str] {
        match self {
            Operation::Init => &["_atagjs_init", "atagjs_init"],
            Operation::Destroy => &["_atagjs_destroy", "atagjs_destroy"],
            Operation::ConfigureOptions => {
                &["_atagjs_set_detector_options", "atagjs_set_detector_options"]
            }
            Operation::SetPoseInfo => &["_atagjs_set_pose_info", "atagjs_set_pose_info"],
            Operation::SetImageBuffer => &["_atagjs_set_img_buffer", "atagjs_set_img_buffer"],
            Operation::SetTagSize => &["_atagjs_set_tag_size", "atagjs_set_tag_size"],
            Operation::Detect => &["_atagjs_detect", "atagjs_detect"],
            Operation::Allocate => &["_malloc", "malloc"],
            Operation::Release => &["_free", "free"],
        }
    }

    /// Whether a detector can be built without this operation.
    pub fn is_mandatory(&self) -> bool {
        matches!(
            self,
            Operation::SetImageBuffer | Operation::Detect | Operation::Allocate | Operation::Release
        )
    }

    fn as_str(&self) -> &'static str {
        match self {
            Operation::Init => "init",
            Operation::Destroy => "destroy",
            Operation::ConfigureOptions => "configureOptions",
            Operation::SetPoseInfo => "setPoseInfo",
            Operation::SetImageBuffer => "setImageBuffer",
            Operation::SetTagSize => "setTagSize",
            Operation::Detect => "detect",
            Operation::Allocate => "allocate",
            Operation::Release => "release",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to a resolved function export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExportFn {
    pub operation: Operation,
    pub name: &'static str,
}

impl ExportFn {
    /// Call the export, mapping a trap to [`Error::Call`].
    pub fn call<M: NativeModule + ?Sized>(
        &self,
        module: &mut M,
        args: &[Value],
    ) -> Result<Option<Value>> {
        self.try_call(module, args).map_err(|trap| Error::Call {
            export: self.name,
            message: trap.message,
        })
    }

    /// Call the export, handing back the raw trap.
    pub fn try_call<M: NativeModule + ?Sized>(
        &self,
        module: &mut M,
        args: &[Value],
    ) -> std::result::Result<Option<Value>, Trap> {
        module.call(self.name, args)
    }
}

/// Operations bound to concrete exports. Immutable once resolved.
#[derive(Debug, Clone, Serialize)]
pub struct ExportTable {
    pub init: Option<ExportFn>,
    pub destroy: Option<ExportFn>,
    pub configure_options: Option<ExportFn>,
    pub set_pose_info: Option<ExportFn>,
    pub set_image_buffer: ExportFn,
    pub set_tag_size: Option<ExportFn>,
    pub detect: ExportFn,
    pub allocate: ExportFn,
    pub release: ExportFn,
}

impl ExportTable {
    /// Resolve every operation against the module's exports.
    ///
    /// Fails on the first mandatory operation that cannot be bound, in
    /// [`Operation::ALL`] order.
    pub fn resolve<M: NativeModule + ?Sized>(module: &M) -> Result<Self> {
        let lookup = |operation: Operation| -> Option<ExportFn> {
            let found = operation
                .candidates()
                .iter()
                .find(|name| module.export_kind(name) == Some(ExportKind::Function))
                .map(|&name| ExportFn { operation, name });
            match found {
                Some(f) => debug!("bound {} -> {}", operation, f.name),
                None => debug!("{} not exported", operation),
            }
            found
        };
        let required = |operation: Operation| -> Result<ExportFn> {
            lookup(operation).ok_or(Error::Resolution {
                operation,
                tried: operation.candidates(),
            })
        };

        Ok(Self {
            init: lookup(Operation::Init),
            destroy: lookup(Operation::Destroy),
            configure_options: lookup(Operation::ConfigureOptions),
            set_pose_info: lookup(Operation::SetPoseInfo),
            set_image_buffer: required(Operation::SetImageBuffer)?,
            set_tag_size: lookup(Operation::SetTagSize),
            detect: required(Operation::Detect)?,
            allocate: required(Operation::Allocate)?,
            release: required(Operation::Release)?,
        })
    }

    /// The export bound to `operation`, if any.
    pub fn get(&self, operation: Operation) -> Option<ExportFn> {
        match operation {
            Operation::Init => self.init,
            Operation::Destroy => self.destroy,
            Operation::ConfigureOptions => self.configure_options,
            Operation::SetPoseInfo => self.set_pose_info,
            Operation::SetImageBuffer => Some(self.set_image_buffer),
            Operation::SetTagSize => self.set_tag_size,
            Operation::Detect => Some(self.detect),
            Operation::Allocate => Some(self.allocate),
            Operation::Release => Some(self.release),
        }
    }
}
