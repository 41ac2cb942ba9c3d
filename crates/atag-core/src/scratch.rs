//! Scratch regions in module memory.
//!
//! Image bytes cross into the module through a region obtained from the
//! module's own allocator. The module never reclaims that memory on its own,
//! so a [`ScratchRegion`] releases itself when dropped unless it was released
//! explicitly first. Every early return and `?` inside a bracket therefore
//! still frees the region exactly once.
//!
//! The region borrows the module mutably for its whole lifetime, so two
//! regions can never be live against the same module at once. Calls made
//! while a region is held go through [`ScratchRegion::module`].

use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::exports::{ExportFn, ExportTable};
use crate::module::{NativeModule, Value};

/// A live allocation inside module memory.
pub struct ScratchRegion<'m, M: NativeModule + ?Sized> {
    module: &'m mut M,
    release: ExportFn,
    address: u32,
    len: usize,
    released: bool,
}

impl<'m, M: NativeModule + ?Sized> ScratchRegion<'m, M> {
    /// Allocate `len` bytes through the module's allocator.
    pub fn acquire(module: &'m mut M, exports: &ExportTable, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::Allocation {
                len,
                reason: "zero-length region".to_string(),
            });
        }
        let len_arg = i32::try_from(len).map_err(|_| Error::Allocation {
            len,
            reason: "length exceeds the module address space".to_string(),
        })?;

        let ret = exports
            .allocate
            .try_call(&mut *module, &[Value::I32(len_arg)])
            .map_err(|trap| Error::Allocation {
                len,
                reason: format!("{} trapped: {}", exports.allocate.name, trap),
            })?;

        let address = match ret.and_then(address_of) {
            Some(0) | None => {
                return Err(Error::Allocation {
                    len,
                    reason: format!("{} returned {}", exports.allocate.name, describe(ret)),
                })
            }
            Some(address) => address,
        };

        let memory_len = module.memory().len();
        let mut region = Self {
            module,
            release: exports.release,
            address,
            len,
            released: false,
        };

        if address as usize + len > memory_len {
            // The allocator handed out something, so it still gets it back.
            if let Err(e) = region.release_once() {
                warn!("out-of-bounds region {:#x} was not released cleanly: {}", address, e);
            }
            return Err(Error::Allocation {
                len,
                reason: format!(
                    "region {:#x}+{} lies outside linear memory ({} bytes)",
                    address, len, memory_len
                ),
            });
        }

        trace!("acquired scratch region {:#x}+{}", address, len);
        Ok(region)
    }

    /// Address of the first byte in module memory.
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Length requested at acquisition.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `bytes` into the start of the region.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_at(0, bytes)
    }

    /// Copy `bytes` into the region starting `offset` bytes in.
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(bytes.len())
            .filter(|&end| end <= self.len)
            .ok_or_else(|| {
                Error::Memory(format!(
                    "write of {} bytes at offset {} exceeds region of {} bytes",
                    bytes.len(),
                    offset,
                    self.len
                ))
            })?;
        let start = self.address as usize + offset;
        let stop = self.address as usize + end;
        let memory = self.module.memory();
        let memory_len = memory.len();
        let target = memory.get_mut(start..stop).ok_or_else(|| {
            Error::Memory(format!(
                "range {:#x}..{:#x} outside linear memory ({} bytes)",
                start, stop, memory_len
            ))
        })?;
        target.copy_from_slice(bytes);
        Ok(())
    }

    /// Overwrite the whole region with zeros.
    pub fn zero_fill(&mut self) -> Result<()> {
        let start = self.address as usize;
        let stop = start + self.len;
        let memory = self.module.memory();
        let memory_len = memory.len();
        memory
            .get_mut(start..stop)
            .ok_or_else(|| {
                Error::Memory(format!(
                    "range {:#x}..{:#x} outside linear memory ({} bytes)",
                    start, stop, memory_len
                ))
            })?
            .fill(0);
        Ok(())
    }

    /// The module, for calls made while the region is held.
    pub fn module(&mut self) -> &mut M {
        &mut *self.module
    }

    /// Release the region now and report whether the module accepted it.
    pub fn release(mut self) -> Result<()> {
        self.release_once()
    }

    fn release_once(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        trace!("releasing scratch region {:#x}+{}", self.address, self.len);
        self.release
            .call(&mut *self.module, &[Value::I32(self.address as i32)])
            .map(|_| ())
    }
}

impl<M: NativeModule + ?Sized> Drop for ScratchRegion<'_, M> {
    fn drop(&mut self) {
        if let Err(e) = self.release_once() {
            warn!("scratch region {:#x} was not released cleanly: {}", self.address, e);
        }
    }
}

/// Pointers come back as i32 for wasm32 modules and as doubles from JS glue.
fn address_of(value: Value) -> Option<u32> {
    match value {
        Value::I32(v) => Some(v as u32),
        Value::F64(v) if v.is_finite() && v >= 0.0 && v.fract() == 0.0 && v <= u32::MAX as f64 => {
            Some(v as u32)
        }
        Value::F64(_) => None,
    }
}

fn describe(value: Option<Value>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "nothing".to_string(),
    }
}
