//! Calling-convention discovery.
//!
//! The module's configure and detect entry points have taken their arguments
//! in different orders across builds, and nothing in the export table says
//! which order a given build expects. The probe finds out by trial: it binds
//! a blank frame, then walks the cross product of the configure and detect
//! catalogs until a detect call returns a non-negative number.
//!
//! ```text
//! for configure in catalog.configure ++ [(none)]
//!     configure(options as configure)        trap -> next configure
//!     set_image_buffer(ptr, w, h)            trap -> next configure
//!     for detect in catalog.detect
//!         detect(frame as detect)            ret >= 0 -> chosen
//! ```
//!
//! The acceptance test is weak on purpose: a blank frame contains no tags, so
//! the only thing a probe can establish is that a convention is callable. A
//! wrong convention that happens to return 0 is indistinguishable from the
//! right one. Catalog order is the tie-break, so catalogs list the most
//! likely convention first.
//!
//! The `(none)` pass runs after the configure catalog, so the module may still
//! hold options from an earlier configure call that returned cleanly. Its
//! detect attempts are therefore made against a configured module, while a
//! detector bound to `(none)` never configures it. Module builds that only
//! bind under `(none)` run on their built-in defaults from the first frame.

use std::fmt;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::DetectorConfig;
use crate::error::{Error, Result};
use crate::exports::ExportTable;
use crate::module::{NativeModule, Trap, Value};
use crate::scratch::ScratchRegion;
use crate::signature::{
    Catalogs, ConfigureSignature, FrameArgs, FrameSignature, OptionValues, IMAGE_SIGNATURE,
    UNCONFIGURED,
};

/// The conventions a detector commits to for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChosenBinding {
    /// `None` when the module is driven without a configure call.
    pub configure: Option<ConfigureSignature>,
    pub detect: FrameSignature,
    pub image: FrameSignature,
}

impl ChosenBinding {
    pub fn configure_label(&self) -> &'static str {
        self.configure.map_or(UNCONFIGURED, |sig| sig.label())
    }
}

impl fmt::Display for ChosenBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "configure={} detect={} image={}",
            self.configure_label(),
            self.detect,
            self.image
        )
    }
}

/// Which call an attempt exercised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStage {
    Configure,
    SetImage,
    Detect,
}

/// What a probe call did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Returned { value: Option<Value> },
    Trapped { message: String },
}

impl AttemptOutcome {
    /// Whether this outcome passes the acceptance test.
    pub fn is_accepted(&self) -> bool {
        matches!(self, AttemptOutcome::Returned { value: Some(v) } if v.as_count().is_some())
    }
}

impl From<&std::result::Result<Option<Value>, Trap>> for AttemptOutcome {
    fn from(result: &std::result::Result<Option<Value>, Trap>) -> Self {
        match result {
            Ok(value) => AttemptOutcome::Returned { value: *value },
            Err(trap) => AttemptOutcome::Trapped {
                message: trap.message.clone(),
            },
        }
    }
}

/// One recorded probe call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeAttempt {
    pub stage: ProbeStage,
    /// Configure convention in effect (`"(none)"` when no call was made).
    pub configure: &'static str,
    /// Detect convention tried, for detect-stage attempts.
    pub detect: Option<&'static str>,
    pub outcome: AttemptOutcome,
}

impl fmt::Display for ProbeAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stage {
            ProbeStage::Configure => write!(f, "configure {}", self.configure)?,
            ProbeStage::SetImage => write!(
                f,
                "set-image {} after configure {}",
                IMAGE_SIGNATURE, self.configure
            )?,
            ProbeStage::Detect => write!(
                f,
                "detect {} after configure {}",
                self.detect.unwrap_or("?"),
                self.configure
            )?,
        }
        match &self.outcome {
            AttemptOutcome::Returned { value: Some(v) } => write!(f, " -> ret={}", v),
            AttemptOutcome::Returned { value: None } => write!(f, " -> ret=void"),
            AttemptOutcome::Trapped { message } => write!(f, " -> error: {}", message),
        }
    }
}

/// Every call a probe made, in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ProbeLog {
    attempts: Vec<ProbeAttempt>,
}

impl ProbeLog {
    pub fn push(&mut self, attempt: ProbeAttempt) {
        debug!("probe: {}", attempt);
        self.attempts.push(attempt);
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    pub fn attempts(&self) -> &[ProbeAttempt] {
        &self.attempts
    }

    /// Detect-stage attempts, i.e. signature pairs actually tried.
    pub fn pairs(&self) -> impl Iterator<Item = &ProbeAttempt> {
        self.attempts
            .iter()
            .filter(|a| a.stage == ProbeStage::Detect)
    }
}

impl fmt::Display for ProbeLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, attempt) in self.attempts.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", attempt)?;
        }
        Ok(())
    }
}

/// A successful probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeReport {
    pub binding: ChosenBinding,
    /// Value the accepted detect call returned.
    pub accepted: Value,
    pub log: ProbeLog,
}

/// Search the catalogs for a configure/detect pair the module accepts.
///
/// The probe frame is allocated once, zero-filled, and released before this
/// returns, whatever the outcome. Traps from individual candidates are logged
/// and skipped; only allocation failures and exhausting every pair are
/// errors. A trap while releasing the probe frame is logged and does not
/// discard the result.
pub fn run<M: NativeModule + ?Sized>(
    module: &mut M,
    exports: &ExportTable,
    catalogs: &Catalogs,
    config: &DetectorConfig,
) -> Result<ProbeReport> {
    let options = OptionValues::from(config);
    let len = config.probe_width as usize * config.probe_height as usize;

    let mut region = ScratchRegion::acquire(module, exports, len)?;
    region.zero_fill()?;
    let frame = FrameArgs {
        pointer: region.address(),
        width: config.probe_width,
        height: config.probe_height,
    };

    // Without a configure export, or after every configure convention, the
    // module is tried unconfigured.
    let mut configure_candidates: Vec<Option<ConfigureSignature>> = Vec::new();
    if exports.configure_options.is_some() {
        configure_candidates.extend(catalogs.configure.iter().copied().map(Some));
    }
    configure_candidates.push(None);

    let mut log = ProbeLog::default();
    let mut chosen: Option<(ChosenBinding, Value)> = None;

    'configure: for configure in configure_candidates {
        let configure_label = configure.map_or(UNCONFIGURED, |sig| sig.label());

        if let (Some(sig), Some(export)) = (configure, exports.configure_options) {
            if let Err(trap) = export.try_call(region.module(), &sig.apply(&options)) {
                log.push(ProbeAttempt {
                    stage: ProbeStage::Configure,
                    configure: configure_label,
                    detect: None,
                    outcome: AttemptOutcome::Trapped {
                        message: trap.message,
                    },
                });
                continue;
            }
        }

        let image_args = IMAGE_SIGNATURE.apply(&frame);
        if let Err(trap) = exports.set_image_buffer.try_call(region.module(), &image_args) {
            log.push(ProbeAttempt {
                stage: ProbeStage::SetImage,
                configure: configure_label,
                detect: None,
                outcome: AttemptOutcome::Trapped {
                    message: trap.message,
                },
            });
            continue;
        }

        for detect in &catalogs.detect {
            let result = exports.detect.try_call(region.module(), &detect.apply(&frame));
            let outcome = AttemptOutcome::from(&result);
            let accepted = outcome.is_accepted();
            log.push(ProbeAttempt {
                stage: ProbeStage::Detect,
                configure: configure_label,
                detect: Some(detect.label()),
                outcome,
            });

            if accepted && chosen.is_none() {
                let binding = ChosenBinding {
                    configure,
                    detect: *detect,
                    image: IMAGE_SIGNATURE,
                };
                let value = match result {
                    Ok(Some(value)) => value,
                    _ => continue,
                };
                chosen = Some((binding, value));
                if !config.exhaustive_probe {
                    break 'configure;
                }
            }
        }
    }

    // The chosen binding stands even if the probe frame leaks.
    if let Err(e) = region.release() {
        warn!("probe frame was not released: {}", e);
    }

    match chosen {
        Some((binding, accepted)) => {
            info!(
                "probe chose {} (ret={}) after {} attempts",
                binding,
                accepted,
                log.len()
            );
            Ok(ProbeReport {
                binding,
                accepted,
                log,
            })
        }
        None => {
            warn!("probe exhausted every convention:\n{}", log);
            Err(Error::ProbeExhausted { log })
        }
    }
}
