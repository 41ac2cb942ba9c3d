//! Candidate calling conventions.
//!
//! A signature is data: an ordered list of role tags, one per positional
//! argument. [`Signature::apply`] is the only place roles are turned into
//! argument values, so adding a convention means adding a catalog entry and
//! nothing else.

use std::fmt;

use serde::{Serialize, Serializer};

use crate::config::DetectorConfig;
use crate::module::Value;

/// A kind of positional slot, and how to fill it from a source record.
pub trait Role: Copy + fmt::Debug + 'static {
    /// Record the slot values are drawn from.
    type Source;

    /// Short token used in signature labels.
    fn token(&self) -> &'static str;

    fn value(&self, source: &Self::Source) -> Value;
}

/// Slots of the configure-options call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionRole {
    Threads,
    QuadDecimate,
    QuadSigma,
    RefineEdges,
    DecodeSharpening,
    /// Literal zero padding.
    Zero,
}

/// Detector options in the form they are sent to the module.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptionValues {
    pub n_threads: i32,
    pub quad_decimate: f64,
    pub quad_sigma: f64,
    pub refine_edges: bool,
    pub decode_sharpening: f64,
}

impl From<&DetectorConfig> for OptionValues {
    /// Unset (zero) thread count, decimation and sharpening fall back to the
    /// module's usual defaults rather than being sent as zero.
    fn from(config: &DetectorConfig) -> Self {
        let n_threads = if config.n_threads == 0 {
            1
        } else {
            i32::try_from(config.n_threads).unwrap_or(i32::MAX)
        };
        let quad_decimate = if config.quad_decimate == 0.0 {
            1.0
        } else {
            config.quad_decimate
        };
        let decode_sharpening = if config.decode_sharpening == 0.0 {
            0.25
        } else {
            config.decode_sharpening
        };
        Self {
            n_threads,
            quad_decimate,
            quad_sigma: config.quad_sigma,
            refine_edges: config.refine_edges,
            decode_sharpening,
        }
    }
}

impl Role for OptionRole {
    type Source = OptionValues;

    fn token(&self) -> &'static str {
        match self {
            OptionRole::Threads => "n",
            OptionRole::QuadDecimate => "qd",
            OptionRole::QuadSigma => "qs",
            OptionRole::RefineEdges => "re",
            OptionRole::DecodeSharpening => "ds",
            OptionRole::Zero => "0",
        }
    }

    fn value(&self, options: &OptionValues) -> Value {
        match self {
            OptionRole::Threads => Value::I32(options.n_threads),
            OptionRole::QuadDecimate => Value::F64(options.quad_decimate),
            OptionRole::QuadSigma => Value::F64(options.quad_sigma),
            OptionRole::RefineEdges => Value::I32(options.refine_edges as i32),
            OptionRole::DecodeSharpening => Value::F64(options.decode_sharpening),
            OptionRole::Zero => Value::I32(0),
        }
    }
}

/// Slots of the image-binding and detect calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameRole {
    Pointer,
    Width,
    Height,
}

/// A frame placed in module memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameArgs {
    pub pointer: u32,
    pub width: u32,
    pub height: u32,
}

impl Role for FrameRole {
    type Source = FrameArgs;

    fn token(&self) -> &'static str {
        match self {
            FrameRole::Pointer => "ptr",
            FrameRole::Width => "w",
            FrameRole::Height => "h",
        }
    }

    fn value(&self, frame: &FrameArgs) -> Value {
        match self {
            FrameRole::Pointer => Value::I32(frame.pointer as i32),
            FrameRole::Width => Value::I32(frame.width as i32),
            FrameRole::Height => Value::I32(frame.height as i32),
        }
    }
}

/// An ordered assignment of roles to positional arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature<R: 'static> {
    label: &'static str,
    slots: &'static [R],
}

impl<R> Signature<R> {
    pub const fn new(label: &'static str, slots: &'static [R]) -> Self {
        Self { label, slots }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn slots(&self) -> &'static [R] {
        self.slots
    }

    pub fn arity(&self) -> usize {
        self.slots.len()
    }
}

impl<R: Role> Signature<R> {
    /// Map `source` onto this signature's positional slots.
    pub fn apply(&self, source: &R::Source) -> Vec<Value> {
        self.slots.iter().map(|role| role.value(source)).collect()
    }

    /// Label rebuilt from the slot tokens (`"none"` for no arguments).
    pub fn describe_slots(&self) -> String {
        if self.slots.is_empty() {
            return "none".to_string();
        }
        self.slots
            .iter()
            .map(|role| role.token())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl<R> fmt::Display for Signature<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label)
    }
}

impl<R> Serialize for Signature<R> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label)
    }
}

pub type ConfigureSignature = Signature<OptionRole>;
pub type FrameSignature = Signature<FrameRole>;

use FrameRole::{Height as H, Pointer as P, Width as W};
use OptionRole::{
    DecodeSharpening as DS, QuadDecimate as QD, QuadSigma as QS, RefineEdges as RE, Threads as N,
    Zero as Z,
};

/// Known configure-options conventions, most likely first.
pub const CONFIGURE_CATALOG: &[ConfigureSignature] = &[
    Signature::new("n", &[N]),
    Signature::new("n,qd,qs,re,ds", &[N, QD, QS, RE, DS]),
    Signature::new("qd,qs,re,ds,n", &[QD, QS, RE, DS, N]),
    Signature::new("n,0,0,0,0,0", &[N, Z, Z, Z, Z, Z]),
    Signature::new("0,0,0,0,0,n", &[Z, Z, Z, Z, Z, N]),
    Signature::new("n,qd,qs,re,ds,0", &[N, QD, QS, RE, DS, Z]),
    Signature::new("qd,qs,re,ds,0,n", &[QD, QS, RE, DS, Z, N]),
];

/// Known detect conventions, most likely first.
pub const DETECT_CATALOG: &[FrameSignature] = &[
    Signature::new("none", &[]),
    Signature::new("ptr,w,h", &[P, W, H]),
    Signature::new("w,h,ptr", &[W, H, P]),
    Signature::new("w,h", &[W, H]),
    Signature::new("ptr", &[P]),
];

/// The image-binding convention. Settled independently, never searched.
pub const IMAGE_SIGNATURE: FrameSignature = Signature::new("ptr,w,h", &[P, W, H]);

/// Label used when no configure call is made.
pub const UNCONFIGURED: &str = "(none)";

/// The pair of catalogs a probe searches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalogs {
    pub configure: Vec<ConfigureSignature>,
    pub detect: Vec<FrameSignature>,
}

impl Catalogs {
    pub fn new(configure: Vec<ConfigureSignature>, detect: Vec<FrameSignature>) -> Self {
        Self { configure, detect }
    }
}

impl Default for Catalogs {
    fn default() -> Self {
        Self {
            configure: CONFIGURE_CATALOG.to_vec(),
            detect: DETECT_CATALOG.to_vec(),
        }
    }
}
