//! atag-probe - calling-convention probe for detection modules
//!
//! Runs the same probe a detector runs at startup against a scripted module
//! description, and reports which conventions were tried and which one was
//! chosen. Useful for replaying a module build's behavior without a camera or
//! a host application.
//!
//! Usage:
//!     atag-probe --script module.json
//!     atag-probe --script module.json --config detector.json --frames 3 --json

use std::path::PathBuf;
use std::process::ExitCode;

use atag_core::{
    DetectionResult, Detector, DetectorConfig, Error, ExportTable, ModuleScript, ProbeLog,
    ScriptedModule,
};
use clap::Parser;
use serde::Serialize;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "atag-probe")]
#[command(about = "Discover the calling convention a detection module accepts")]
#[command(version)]
struct Args {
    /// Module script (JSON) describing exports and accepted conventions
    #[arg(short, long)]
    script: PathBuf,

    /// Detector config (JSON); defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Blank frames to run through the bound detector after probing
    #[arg(long, default_value = "0")]
    frames: u32,

    /// Frame size used with --frames, as WIDTHxHEIGHT
    #[arg(long, default_value = "640x480", value_parser = parse_size)]
    size: (u32, u32),

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Default log filter (RUST_LOG overrides)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Serialize)]
struct Report<'a> {
    binding: atag_core::ChosenBinding,
    exports: &'a ExportTable,
    probe_log: &'a ProbeLog,
    frames: Vec<FrameReport>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum FrameReport {
    Ok(DetectionResult),
    Failed { frame: u32, error: String },
}

#[derive(Serialize)]
struct FailureReport<'a> {
    error: String,
    probe_log: Option<&'a ProbeLog>,
}

fn parse_size(s: &str) -> Result<(u32, u32), String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{}'", s))?;
    let w: u32 = w.trim().parse().map_err(|e| format!("bad width: {}", e))?;
    let h: u32 = h.trim().parse().map_err(|e| format!("bad height: {}", e))?;
    if w == 0 || h == 0 {
        return Err("frame size must be non-zero".to_string());
    }
    Ok((w, h))
}

fn load(args: &Args) -> atag_core::Result<(ModuleScript, DetectorConfig)> {
    let script = ModuleScript::from_path(&args.script)?;
    let config = match &args.config {
        Some(path) => DetectorConfig::from_path(path)?,
        None => DetectorConfig::default(),
    };
    Ok((script, config))
}

fn main() -> ExitCode {
    let args = Args::parse();
    atag_core::tracing::init_with_filter(&args.log_level);

    info!("Starting atag-probe v{}", env!("CARGO_PKG_VERSION"));

    let (script, config) = match load(&args) {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("failed to load inputs: {}", e);
            return ExitCode::from(2);
        }
    };

    let mut detector = match Detector::create(ScriptedModule::new(script), config) {
        Ok(detector) => detector,
        Err(e) => {
            let log = match &e {
                Error::ProbeExhausted { log } => Some(log),
                _ => None,
            };
            if args.json {
                let report = FailureReport {
                    error: e.to_string(),
                    probe_log: log,
                };
                print_json(&report);
            } else {
                println!("binding failed: {}", e);
            }
            return ExitCode::FAILURE;
        }
    };

    let (width, height) = args.size;
    let blank = vec![0u8; width as usize * height as usize];
    let mut frames = Vec::with_capacity(args.frames as usize);
    for i in 1..=args.frames {
        match detector.detect(&blank, width, height) {
            Ok(result) => frames.push(FrameReport::Ok(result)),
            Err(e) => {
                error!("frame {} failed: {}", i, e);
                frames.push(FrameReport::Failed {
                    frame: i,
                    error: e.to_string(),
                });
            }
        }
    }

    if args.json {
        let report = Report {
            binding: detector.chosen_binding(),
            exports: detector.exports(),
            probe_log: detector.probe_log(),
            frames,
        };
        print_json(&report);
    } else {
        println!("{}", detector.probe_log());
        println!();
        println!("chosen: {}", detector.chosen_binding());
        for frame in &frames {
            match frame {
                FrameReport::Ok(r) => println!(
                    "frame {}: count={} ret={} ({}us)",
                    r.frame,
                    r.count,
                    r.raw_return.map_or("void".to_string(), |v| v.to_string()),
                    r.elapsed_us
                ),
                FrameReport::Failed { frame, error } => println!("frame {}: {}", frame, error),
            }
        }
    }

    detector.destroy();
    ExitCode::SUCCESS
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => error!("failed to serialize report: {}", e),
    }
}
