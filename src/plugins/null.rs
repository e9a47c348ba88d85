//! Synthetic plugin: reads produce zeroes, writes disappear. Useful for
//! benchmarking the wire path and for tests that care about capability
//! plumbing rather than data.

use crate::backend::{CacheMode, FuaMode, Handle, HandleRef, OpFlags, OpResult, Plugin};
use crate::extents::{ExtentFlags, Extents};

/// A disk of nothing.
pub struct NullPlugin {
    size: u64,
}

impl NullPlugin {
    /// A discarding export of `size` bytes.
    pub fn new(size: u64) -> NullPlugin {
        NullPlugin { size }
    }
}

impl Plugin for NullPlugin {
    fn name(&self) -> &'static str {
        "null"
    }

    fn open(&self, _readonly: bool, _name: &str, _is_tls: bool) -> OpResult<Handle> {
        Ok(Box::new(()))
    }

    fn get_size(&self, _handle: HandleRef) -> OpResult<u64> {
        Ok(self.size)
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

    // nothing is persistent, so every write is trivially durable
    fn can_fua(&self, _handle: HandleRef) -> OpResult<FuaMode> {
        Ok(FuaMode::Native)
    }

    fn can_multi_conn(&self, _handle: HandleRef) -> OpResult<bool> {
        Ok(true)
    }

    fn can_extents(&self, _handle: HandleRef) -> OpResult<bool> {
        Ok(true)
    }

    fn can_cache(&self, _handle: HandleRef) -> OpResult<CacheMode> {
        Ok(CacheMode::Native)
    }

    fn pread(
        &self,
        _handle: HandleRef,
        buf: &mut [u8],
        _offset: u64,
        _flags: OpFlags,
    ) -> OpResult<()> {
        buf.fill(0);
        Ok(())
    }

    fn pwrite(&self, _handle: HandleRef, _buf: &[u8], _offset: u64, _flags: OpFlags) -> OpResult<()> {
        Ok(())
    }

    fn zero(&self, _handle: HandleRef, _count: u32, _offset: u64, _flags: OpFlags) -> OpResult<()> {
        Ok(())
    }

    fn trim(&self, _handle: HandleRef, _count: u32, _offset: u64, _flags: OpFlags) -> OpResult<()> {
        Ok(())
    }

    fn flush(&self, _handle: HandleRef, _flags: OpFlags) -> OpResult<()> {
        Ok(())
    }

    fn cache(&self, _handle: HandleRef, _count: u32, _offset: u64, _flags: OpFlags) -> OpResult<()> {
        Ok(())
    }

    // the whole device is one unallocated, zero-reading extent
    fn extents(
        &self,
        _handle: HandleRef,
        count: u32,
        offset: u64,
        _flags: OpFlags,
        out: &mut Extents,
    ) -> OpResult<()> {
        let _ = (count, offset);
        out.add(0, self.size, ExtentFlags::HOLE | ExtentFlags::ZERO)
    }
}
