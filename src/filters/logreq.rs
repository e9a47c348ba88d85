//! Logging filter: records every operation that crosses it, then passes
//! the call through unchanged.

use std::sync::atomic::{AtomicU64, Ordering};

use log::info;

use crate::backend::{Filter, Handle, HandleRef, NbdError, OpFlags, OpResult};
use crate::extents::Extents;
use crate::stack::Next;

/// Pass-through filter that logs data operations and their outcomes.
#[derive(Default)]
pub struct LogFilter {
    next_conn: AtomicU64,
}

/// Per-connection handle: a stable number to correlate log lines.
struct LogHandle {
    conn: u64,
    export: String,
}

impl LogFilter {
    /// A fresh logging filter.
    pub fn new() -> LogFilter {
        Self::default()
    }

    fn handle<'a>(&self, handle: HandleRef<'a>) -> OpResult<&'a LogHandle> {
        handle
            .downcast_ref::<LogHandle>()
            .ok_or_else(|| NbdError::invalid("not a log handle"))
    }

    fn record<T>(&self, handle: HandleRef, what: String, result: OpResult<T>) -> OpResult<T> {
        let h = self.handle(handle)?;
        match &result {
            Ok(_) => info!(target: "filter::log", "[{}] {what} -> ok", h.conn),
            Err(err) => info!(target: "filter::log", "[{}] {what} -> {err}", h.conn),
        }
        result
    }
}

impl Filter for LogFilter {
    fn name(&self) -> &'static str {
        "log"
    }

    fn open(&self, _next: &Next, readonly: bool, name: &str, _is_tls: bool) -> OpResult<Handle> {
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "filter::log",
            "[{conn}] open export={name:?} readonly={readonly}"
        );
        Ok(Box::new(LogHandle {
            conn,
            export: name.to_string(),
        }))
    }

    fn close(&self, handle: Handle) {
        if let Some(h) = handle.downcast_ref::<LogHandle>() {
            info!(target: "filter::log", "[{}] close export={:?}", h.conn, h.export);
        }
    }

    fn pread(
        &self,
        next: &Next,
        handle: HandleRef,
        buf: &mut [u8],
        offset: u64,
        flags: OpFlags,
    ) -> OpResult<()> {
        let what = format!("pread count={} offset={offset}", buf.len());
        let result = next.pread(buf, offset, flags);
        self.record(handle, what, result)
    }

    fn pwrite(
        &self,
        next: &Next,
        handle: HandleRef,
        buf: &[u8],
        offset: u64,
        flags: OpFlags,
    ) -> OpResult<()> {
        let what = format!(
            "pwrite count={} offset={offset} fua={}",
            buf.len(),
            flags.contains(OpFlags::FUA)
        );
        let result = next.pwrite(buf, offset, flags);
        self.record(handle, what, result)
    }

    fn zero(
        &self,
        next: &Next,
        handle: HandleRef,
        count: u32,
        offset: u64,
        flags: OpFlags,
    ) -> OpResult<()> {
        let what = format!(
            "zero count={count} offset={offset} may_trim={} fast={}",
            flags.contains(OpFlags::MAY_TRIM),
            flags.contains(OpFlags::FAST_ZERO)
        );
        let result = next.zero(count, offset, flags);
        self.record(handle, what, result)
    }

    fn trim(
        &self,
        next: &Next,
        handle: HandleRef,
        count: u32,
        offset: u64,
        flags: OpFlags,
    ) -> OpResult<()> {
        let what = format!("trim count={count} offset={offset}");
        let result = next.trim(count, offset, flags);
        self.record(handle, what, result)
    }

    fn flush(&self, next: &Next, handle: HandleRef, flags: OpFlags) -> OpResult<()> {
        let result = next.flush(flags);
        self.record(handle, "flush".to_string(), result)
    }

    fn extents(
        &self,
        next: &Next,
        handle: HandleRef,
        count: u32,
        offset: u64,
        flags: OpFlags,
        out: &mut Extents,
    ) -> OpResult<()> {
        let what = format!("extents count={count} offset={offset}");
        let result = next.extents(count, offset, flags, out);
        self.record(handle, what, result)
    }

    fn cache(
        &self,
        next: &Next,
        handle: HandleRef,
        count: u32,
        offset: u64,
        flags: OpFlags,
    ) -> OpResult<()> {
        let what = format!("cache count={count} offset={offset}");
        let result = next.cache(count, offset, flags);
        self.record(handle, what, result)
    }
}
