//! RAM-backed plugin: one export served out of a byte vector.
//!
//! All connections share the same storage, so the export is
//! multi-connection safe; flush is a no-op because nothing is more durable
//! than the memory it already sits in.

use std::sync::{PoisonError, RwLock};

use crate::backend::{CacheMode, FuaMode, Handle, HandleRef, NbdError, OpFlags, OpResult, Plugin};
use crate::proto::ErrorType;

/// An in-memory disk image.
pub struct MemoryPlugin {
    export: String,
    description: Option<String>,
    data: RwLock<Vec<u8>>,
}

impl MemoryPlugin {
    /// A zero-filled image of `size` bytes, served as `export`.
    pub fn new<S: Into<String>>(export: S, size: u64) -> MemoryPlugin {
        MemoryPlugin {
            export: export.into(),
            description: None,
            data: RwLock::new(vec![0u8; size as usize]),
        }
    }

    /// Attach a human-readable description.
    pub fn with_description<S: Into<String>>(mut self, description: S) -> MemoryPlugin {
        self.description = Some(description.into());
        self
    }

    fn check_name(&self, name: &str) -> OpResult<()> {
        if name.is_empty() || name == self.export {
            Ok(())
        } else {
            Err(NbdError::invalid(format!("no export named {name:?}")))
        }
    }

    fn range(&self, count: u32, offset: u64) -> OpResult<std::ops::Range<usize>> {
        let start = offset as usize;
        let end = start
            .checked_add(count as usize)
            .ok_or_else(|| NbdError::invalid("range wraps the offset space"))?;
        if end > self.data.read().unwrap_or_else(PoisonError::into_inner).len() {
            return Err(NbdError::new(ErrorType::EIO, "range beyond end of image"));
        }
        Ok(start..end)
    }
}

impl Plugin for MemoryPlugin {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn default_export(&self, _readonly: bool, _is_tls: bool) -> OpResult<String> {
        Ok(self.export.clone())
    }

    fn list_exports(
        &self,
        _readonly: bool,
        _is_tls: bool,
        exports: &mut crate::extents::Exports,
    ) -> OpResult<()> {
        exports.add(&self.export, self.description.as_deref())
    }

    fn open(&self, _readonly: bool, name: &str, _is_tls: bool) -> OpResult<Handle> {
        self.check_name(name)?;
        Ok(Box::new(()))
    }

    fn get_size(&self, _handle: HandleRef) -> OpResult<u64> {
        Ok(self
            .data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len() as u64)
    }

    fn can_write(&self, _handle: HandleRef) -> OpResult<bool> {
        Ok(true)
    }

    fn can_flush(&self, _handle: HandleRef) -> OpResult<bool> {
        Ok(true)
    }

    fn can_trim(&self, _handle: HandleRef) -> OpResult<bool> {
        Ok(true)
    }

    fn can_zero(&self, _handle: HandleRef) -> OpResult<bool> {
        Ok(true)
    }

    fn can_fast_zero(&self, _handle: HandleRef) -> OpResult<bool> {
        Ok(true)
    }

    // flush is a no-op, so per-request durability costs nothing
    fn can_fua(&self, _handle: HandleRef) -> OpResult<FuaMode> {
        Ok(FuaMode::Native)
    }

    fn can_multi_conn(&self, _handle: HandleRef) -> OpResult<bool> {
        Ok(true)
    }

    // everything is already in memory; advertising native cache lets the
    // engine answer cache requests as no-ops
    fn can_cache(&self, _handle: HandleRef) -> OpResult<CacheMode> {
        Ok(CacheMode::Native)
    }

    fn export_description(&self, _handle: HandleRef) -> OpResult<Option<String>> {
        Ok(self.description.clone())
    }

    fn pread(
        &self,
        _handle: HandleRef,
        buf: &mut [u8],
        offset: u64,
        _flags: OpFlags,
    ) -> OpResult<()> {
        let range = self.range(buf.len() as u32, offset)?;
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        buf.copy_from_slice(&data[range]);
        Ok(())
    }

    fn pwrite(
        &self,
        _handle: HandleRef,
        buf: &[u8],
        offset: u64,
        _flags: OpFlags,
    ) -> OpResult<()> {
        let range = self.range(buf.len() as u32, offset)?;
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        data[range].copy_from_slice(buf);
        Ok(())
    }

    fn zero(&self, _handle: HandleRef, count: u32, offset: u64, _flags: OpFlags) -> OpResult<()> {
        let range = self.range(count, offset)?;
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        data[range].fill(0);
        Ok(())
    }

    fn trim(&self, handle: HandleRef, count: u32, offset: u64, flags: OpFlags) -> OpResult<()> {
        // trimmed ranges read back as zeroes
        self.zero(handle, count, offset, flags)
    }

    fn flush(&self, _handle: HandleRef, _flags: OpFlags) -> OpResult<()> {
        Ok(())
    }

    fn cache(&self, _handle: HandleRef, _count: u32, _offset: u64, _flags: OpFlags) -> OpResult<()> {
        Ok(())
    }
}
