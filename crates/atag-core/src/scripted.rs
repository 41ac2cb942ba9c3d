//! In-process scripted detection module.
//!
//! Behaves like a detection module whose conventions are described by a
//! [`ModuleScript`] instead of compiled in. Useful for:
//! - Unit and integration testing
//! - Reproducing a probe log reported against a real module build
//! - Exercising hosts without loading a real module
//!
//! It does not detect anything: detect returns a fixed value when called with
//! an accepted arity.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::exports::Operation;
use crate::module::{ExportKind, NativeModule, Trap, Value};

/// Lowest address the allocator hands out. Zero stays reserved for null.
const HEAP_BASE: u32 = 8;
const ALIGN: u32 = 8;

/// What a call with an unexpected argument count does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mismatch {
    /// Trap, as a strictly typed runtime does.
    Trap,
    /// Return a fixed value, as lenient JS glue does.
    Return(i32),
}

/// Description of a scripted module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleScript {
    /// Exported function names
    pub exports: Vec<String>,
    /// Argument counts the configure call accepts
    pub configure_arities: Vec<usize>,
    /// Argument count the image-binding call accepts
    pub set_image_arity: usize,
    /// Argument counts the detect call accepts
    pub detect_arities: Vec<usize>,
    /// Value detect returns for an accepted call
    pub detect_returns: i32,
    /// Behavior on an argument count mismatch
    pub on_mismatch: Mismatch,
    /// Size of linear memory in bytes
    pub memory_bytes: usize,
    /// Make the allocator return null
    pub fail_allocations: bool,
    /// Exported names that trap on every call
    pub failing_exports: Vec<String>,
}

impl Default for ModuleScript {
    fn default() -> Self {
        Self {
            exports: Operation::ALL
                .iter()
                .map(|op| op.candidates()[0].to_string())
                .collect(),
            configure_arities: vec![1],
            set_image_arity: 3,
            detect_arities: vec![3],
            detect_returns: 0,
            on_mismatch: Mismatch::Trap,
            memory_bytes: 1 << 20,
            fail_allocations: false,
            failing_exports: Vec::new(),
        }
    }
}

impl ModuleScript {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Remove every export name of `operation`.
    pub fn without(mut self, operation: Operation) -> Self {
        self.exports
            .retain(|name| !operation.candidates().contains(&name.as_str()));
        self
    }
}

/// A module driven by a [`ModuleScript`].
#[derive(Debug)]
pub struct ScriptedModule {
    script: ModuleScript,
    memory: Vec<u8>,
    next_address: u32,
    live: HashMap<u32, usize>,
    allocations: usize,
    releases: usize,
    calls: HashMap<Operation, usize>,
    last_args: HashMap<Operation, Vec<Value>>,
    bound_image: Option<(u32, u32, u32)>,
    fail_detects: u32,
    tag_size: Option<f64>,
    pose_info: Option<[f64; 4]>,
    initialized: bool,
    destroyed: bool,
}

impl ScriptedModule {
    pub fn new(script: ModuleScript) -> Self {
        let memory = vec![0; script.memory_bytes];
        Self {
            script,
            memory,
            next_address: HEAP_BASE,
            live: HashMap::new(),
            allocations: 0,
            releases: 0,
            calls: HashMap::new(),
            last_args: HashMap::new(),
            bound_image: None,
            fail_detects: 0,
            tag_size: None,
            pose_info: None,
            initialized: false,
            destroyed: false,
        }
    }

    pub fn script(&self) -> &ModuleScript {
        &self.script
    }

    /// Change behavior after construction. Memory size changes are ignored.
    pub fn script_mut(&mut self) -> &mut ModuleScript {
        &mut self.script
    }

    /// Make the next `n` detect calls trap.
    pub fn fail_next_detects(&mut self, n: u32) {
        self.fail_detects = n;
    }

    /// Successful allocations so far.
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    /// Successful releases so far.
    pub fn releases(&self) -> usize {
        self.releases
    }

    /// Allocations not yet released.
    pub fn outstanding(&self) -> usize {
        self.live.len()
    }

    /// Calls made to `operation`, including ones that trapped.
    pub fn call_count(&self, operation: Operation) -> usize {
        self.calls.get(&operation).copied().unwrap_or(0)
    }

    pub fn last_args(&self, operation: Operation) -> Option<&[Value]> {
        self.last_args.get(&operation).map(|v| v.as_slice())
    }

    /// `(pointer, width, height)` of the last bound image.
    pub fn bound_image(&self) -> Option<(u32, u32, u32)> {
        self.bound_image
    }

    pub fn tag_size(&self) -> Option<f64> {
        self.tag_size
    }

    /// `[fx, fy, cx, cy]` of the last pose-info call.
    pub fn pose_info(&self) -> Option<[f64; 4]> {
        self.pose_info
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Bytes of linear memory at `address`.
    pub fn read(&self, address: u32, len: usize) -> Option<&[u8]> {
        let start = address as usize;
        self.memory.get(start..start.checked_add(len)?)
    }

    fn operation_of(&self, name: &str) -> Option<Operation> {
        if !self.script.exports.iter().any(|e| e == name) {
            return None;
        }
        Operation::ALL
            .iter()
            .copied()
            .find(|op| op.candidates().contains(&name))
    }

    fn mismatch(&self, name: &str, expected: &str, got: usize) -> std::result::Result<Option<Value>, Trap> {
        match self.script.on_mismatch {
            Mismatch::Trap => Err(Trap::new(format!(
                "{}: expected {} arguments, got {}",
                name, expected, got
            ))),
            Mismatch::Return(v) => Ok(Some(Value::I32(v))),
        }
    }

    fn allocate(&mut self, len: usize) -> Value {
        if self.script.fail_allocations || len == 0 {
            return Value::I32(0);
        }
        if self.live.is_empty() {
            self.next_address = HEAP_BASE;
        }
        let address = self.next_address;
        let end = address as usize + len;
        if end > self.memory.len() {
            return Value::I32(0);
        }
        let aligned_end = (end as u32).div_ceil(ALIGN) * ALIGN;
        self.next_address = aligned_end;
        self.live.insert(address, len);
        self.allocations += 1;
        Value::I32(address as i32)
    }
}

fn int_arg(args: &[Value], index: usize) -> std::result::Result<i64, Trap> {
    match args.get(index) {
        Some(Value::I32(v)) => Ok(*v as i64),
        Some(Value::F64(v)) if v.fract() == 0.0 => Ok(*v as i64),
        Some(other) => Err(Trap::new(format!("argument {} is not an integer: {}", index, other))),
        None => Err(Trap::new(format!("missing argument {}", index))),
    }
}

impl NativeModule for ScriptedModule {
    fn export_kind(&self, name: &str) -> Option<ExportKind> {
        if name == "memory" {
            return Some(ExportKind::Memory);
        }
        self.script
            .exports
            .iter()
            .any(|e| e == name)
            .then_some(ExportKind::Function)
    }

    fn call(&mut self, name: &str, args: &[Value]) -> std::result::Result<Option<Value>, Trap> {
        let operation = self
            .operation_of(name)
            .ok_or_else(|| Trap::new(format!("{} is not an exported function", name)))?;
        *self.calls.entry(operation).or_default() += 1;
        self.last_args.insert(operation, args.to_vec());
        if self.script.failing_exports.iter().any(|e| e == name) {
            return Err(Trap::new(format!("{} failed", name)));
        }

        match operation {
            Operation::Init => {
                self.initialized = true;
                Ok(None)
            }
            Operation::Destroy => {
                self.destroyed = true;
                Ok(None)
            }
            Operation::ConfigureOptions => {
                if self.script.configure_arities.contains(&args.len()) {
                    Ok(None)
                } else {
                    let expected = format!("{:?}", self.script.configure_arities);
                    self.mismatch(name, &expected, args.len())
                }
            }
            Operation::SetPoseInfo => {
                if args.len() != 4 {
                    return self.mismatch(name, "4", args.len());
                }
                let mut pose = [0.0; 4];
                for (slot, arg) in pose.iter_mut().zip(args) {
                    *slot = arg.as_f64();
                }
                self.pose_info = Some(pose);
                Ok(None)
            }
            Operation::SetImageBuffer => {
                if args.len() != self.script.set_image_arity {
                    let expected = self.script.set_image_arity.to_string();
                    return self.mismatch(name, &expected, args.len());
                }
                let pointer = int_arg(args, 0)? as u32;
                let width = int_arg(args, 1)? as u32;
                let height = int_arg(args, 2)? as u32;
                let end = pointer as usize + width as usize * height as usize;
                if end > self.memory.len() {
                    return Err(Trap::new("image buffer out of bounds"));
                }
                self.bound_image = Some((pointer, width, height));
                Ok(None)
            }
            Operation::SetTagSize => {
                if args.len() != 1 {
                    return self.mismatch(name, "1", args.len());
                }
                self.tag_size = Some(args[0].as_f64());
                Ok(None)
            }
            Operation::Detect => {
                if self.fail_detects > 0 {
                    self.fail_detects -= 1;
                    return Err(Trap::new("injected detect fault"));
                }
                if !self.script.detect_arities.contains(&args.len()) {
                    let expected = format!("{:?}", self.script.detect_arities);
                    return self.mismatch(name, &expected, args.len());
                }
                if self.bound_image.is_none() {
                    return Ok(Some(Value::I32(-1)));
                }
                Ok(Some(Value::I32(self.script.detect_returns)))
            }
            Operation::Allocate => {
                let len = int_arg(args, 0)?;
                let len = usize::try_from(len).map_err(|_| Trap::new("negative allocation"))?;
                Ok(Some(self.allocate(len)))
            }
            Operation::Release => {
                let address = int_arg(args, 0)? as u32;
                if self.live.remove(&address).is_none() {
                    return Err(Trap::new(format!(
                        "free of unallocated address {:#x}",
                        address
                    )));
                }
                self.releases += 1;
                Ok(None)
            }
        }
    }

    fn memory(&mut self) -> &mut [u8] {
        &mut self.memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(module: &mut ScriptedModule, op: Operation, args: &[Value]) -> std::result::Result<Option<Value>, Trap> {
        module.call(op.candidates()[0], args)
    }

    #[test]
    fn test_default_exports_every_operation() {
        let module = ScriptedModule::new(ModuleScript::default());
        for op in Operation::ALL {
            assert_eq!(module.export_kind(op.candidates()[0]), Some(ExportKind::Function));
        }
        assert_eq!(module.export_kind("memory"), Some(ExportKind::Memory));
        assert_eq!(module.export_kind("_atagjs_frobnicate"), None);
    }

    #[test]
    fn test_without_removes_export() {
        let script = ModuleScript::default().without(Operation::Detect);
        let mut module = ScriptedModule::new(script);
        assert_eq!(module.export_kind("_atagjs_detect"), None);
        assert!(call(&mut module, Operation::Detect, &[]).is_err());
    }

    #[test]
    fn test_allocator_tracks_live_regions() {
        let mut module = ScriptedModule::new(ModuleScript::default());
        let a = call(&mut module, Operation::Allocate, &[Value::I32(10)]).unwrap().unwrap();
        let b = call(&mut module, Operation::Allocate, &[Value::I32(10)]).unwrap().unwrap();
        assert_eq!(a, Value::I32(8));
        assert_eq!(b, Value::I32(24));
        assert_eq!(module.outstanding(), 2);

        call(&mut module, Operation::Release, &[a]).unwrap();
        assert!(call(&mut module, Operation::Release, &[a]).is_err());
        call(&mut module, Operation::Release, &[b]).unwrap();
        assert_eq!(module.outstanding(), 0);
        assert_eq!(module.releases(), 2);

        // An empty heap starts over at the base.
        let c = call(&mut module, Operation::Allocate, &[Value::I32(4)]).unwrap().unwrap();
        assert_eq!(c, Value::I32(8));
    }

    #[test]
    fn test_allocation_beyond_memory_is_null() {
        let script = ModuleScript {
            memory_bytes: 64,
            ..ModuleScript::default()
        };
        let mut module = ScriptedModule::new(script);
        let ret = call(&mut module, Operation::Allocate, &[Value::I32(128)]).unwrap();
        assert_eq!(ret, Some(Value::I32(0)));
        assert_eq!(module.allocations(), 0);
    }

    #[test]
    fn test_detect_arity() {
        let mut module = ScriptedModule::new(ModuleScript::default());
        call(&mut module, Operation::SetImageBuffer, &[Value::I32(8), Value::I32(4), Value::I32(4)]).unwrap();
        let args = [Value::I32(8), Value::I32(4), Value::I32(4)];
        assert_eq!(call(&mut module, Operation::Detect, &args).unwrap(), Some(Value::I32(0)));
        assert!(call(&mut module, Operation::Detect, &[]).is_err());

        module.script_mut().on_mismatch = Mismatch::Return(-1);
        assert_eq!(call(&mut module, Operation::Detect, &[]).unwrap(), Some(Value::I32(-1)));
        assert_eq!(module.call_count(Operation::Detect), 3);
    }

    #[test]
    fn test_injected_detect_faults() {
        let mut module = ScriptedModule::new(ModuleScript::default());
        call(&mut module, Operation::SetImageBuffer, &[Value::I32(8), Value::I32(1), Value::I32(1)]).unwrap();
        module.fail_next_detects(1);
        let args = [Value::I32(8), Value::I32(1), Value::I32(1)];
        assert!(call(&mut module, Operation::Detect, &args).is_err());
        assert!(call(&mut module, Operation::Detect, &args).is_ok());
    }

    #[test]
    fn test_script_json() {
        let script = ModuleScript::from_json_str(
            r#"{
                "exports": ["atagjs_detect", "atagjs_set_img_buffer", "malloc", "free"],
                "detect_arities": [0],
                "on_mismatch": {"return": -1}
            }"#,
        )
        .unwrap();
        assert_eq!(script.detect_arities, vec![0]);
        assert_eq!(script.on_mismatch, Mismatch::Return(-1));
        assert_eq!(script.set_image_arity, 3);
    }
}
