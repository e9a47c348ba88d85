//! Delay filter: injects artificial latency ahead of chosen operation
//! classes, for simulating slow media over fast storage.

use std::thread;
use std::time::Duration;

use crate::backend::{Filter, HandleRef, NbdError, OpFlags, OpResult};
use crate::extents::Extents;
use crate::proto::ErrorType;
use crate::stack::Next;

/// Sleeps before delegating. All delays default to zero.
#[derive(Default)]
pub struct DelayFilter {
    read: Duration,
    write: Duration,
    zero: Duration,
    trim: Duration,
    extents: Duration,
}

impl DelayFilter {
    /// A filter that delays nothing.
    pub fn new() -> DelayFilter {
        Self::default()
    }

    /// Delay reads by `d`.
    pub fn read(mut self, d: Duration) -> DelayFilter {
        self.read = d;
        self
    }

    /// Delay writes by `d`.
    pub fn write(mut self, d: Duration) -> DelayFilter {
        self.write = d;
        self
    }

    /// Delay zero requests by `d`.
    pub fn zero(mut self, d: Duration) -> DelayFilter {
        self.zero = d;
        self
    }

    /// Delay trims by `d`.
    pub fn trim(mut self, d: Duration) -> DelayFilter {
        self.trim = d;
        self
    }

    /// Delay extents queries by `d`.
    pub fn extents(mut self, d: Duration) -> DelayFilter {
        self.extents = d;
        self
    }

    fn sleep(d: Duration) {
        if !d.is_zero() {
            thread::sleep(d);
        }
    }
}

impl Filter for DelayFilter {
    fn name(&self) -> &'static str {
        "delay"
    }

    // a delayed zero cannot be fast; refuse the capability rather than lie
    fn can_fast_zero(&self, next: &Next, _handle: HandleRef) -> OpResult<bool> {
        if self.zero.is_zero() {
            next.can_fast_zero()
        } else {
            Ok(false)
        }
    }

    fn pread(
        &self,
        next: &Next,
        _handle: HandleRef,
        buf: &mut [u8],
        offset: u64,
        flags: OpFlags,
    ) -> OpResult<()> {
        Self::sleep(self.read);
        next.pread(buf, offset, flags)
    }

    fn pwrite(
        &self,
        next: &Next,
        _handle: HandleRef,
        buf: &[u8],
        offset: u64,
        flags: OpFlags,
    ) -> OpResult<()> {
        Self::sleep(self.write);
        next.pwrite(buf, offset, flags)
    }

    fn zero(
        &self,
        next: &Next,
        _handle: HandleRef,
        count: u32,
        offset: u64,
        flags: OpFlags,
    ) -> OpResult<()> {
        if flags.contains(OpFlags::FAST_ZERO) && !self.zero.is_zero() {
            return Err(NbdError::new(
                ErrorType::ENOTSUP,
                "fast zero would not be fast here",
            ));
        }
        Self::sleep(self.zero);
        next.zero(count, offset, flags)
    }

    fn trim(
        &self,
        next: &Next,
        _handle: HandleRef,
        count: u32,
        offset: u64,
        flags: OpFlags,
    ) -> OpResult<()> {
        Self::sleep(self.trim);
        next.trim(count, offset, flags)
    }

    fn extents(
        &self,
        next: &Next,
        _handle: HandleRef,
        count: u32,
        offset: u64,
        flags: OpFlags,
        out: &mut Extents,
    ) -> OpResult<()> {
        Self::sleep(self.extents);
        next.extents(count, offset, flags, out)
    }
}
