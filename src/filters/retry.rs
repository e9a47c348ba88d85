//! Retry filter: when a data operation fails, reopen the plugin through
//! the engine's reopen hook and try again, with optional exponential
//! back-off. Filters above keep their handles throughout.

use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use log::debug;

use crate::backend::{Filter, Handle, HandleRef, NbdError, OpFlags, OpResult, ThreadModel};
use crate::extents::Extents;
use crate::proto::ErrorType;
use crate::stack::Next;

/// Transparent retry-with-reopen for every data operation.
pub struct RetryFilter {
    retries: u32,
    initial_delay: Duration,
    exponential: bool,
}

/// Per-connection handle: the open arguments, remembered so the plugin can
/// be reopened the same way, plus a reopen counter for the log.
struct RetryHandle {
    readonly: bool,
    export: String,
    is_tls: bool,
    reopens: AtomicU32,
}

impl RetryFilter {
    /// Retry up to `retries` times, waiting `initial_delay` before each
    /// attempt and doubling the wait when `exponential` is set.
    pub fn new(retries: u32, initial_delay: Duration, exponential: bool) -> RetryFilter {
        RetryFilter {
            retries,
            initial_delay,
            exponential,
        }
    }

    fn handle<'a>(&self, handle: HandleRef<'a>) -> OpResult<&'a RetryHandle> {
        handle
            .downcast_ref::<RetryHandle>()
            .ok_or_else(|| NbdError::invalid("not a retry handle"))
    }

    /// The shared retry loop: run `op`; on failure sleep, reopen the plugin
    /// below, and run it again, up to the configured attempt count.
    fn with_retry<T>(
        &self,
        next: &Next,
        handle: HandleRef,
        what: &str,
        mut op: impl FnMut(&Next) -> OpResult<T>,
    ) -> OpResult<T> {
        let h = self.handle(handle)?;
        let mut delay = self.initial_delay;
        let mut attempt = 0;
        loop {
            let err = match op(next) {
                Ok(v) => {
                    if attempt > 0 {
                        debug!(target: "filter::retry", "{what} recovered after {attempt} retries");
                    }
                    return Ok(v);
                }
                Err(err) => err,
            };
            if attempt >= self.retries {
                debug!(
                    target: "filter::retry",
                    "{what}: could not recover after {} retries", self.retries
                );
                return Err(err);
            }
            attempt += 1;
            debug!(
                target: "filter::retry",
                "{what} failed ({err}); retry {attempt} in {delay:?}"
            );
            thread::sleep(delay);
            if self.exponential {
                delay *= 2;
            }
            h.reopens.fetch_add(1, Ordering::Relaxed);
            if let Err(reopen_err) = next.reopen(h.readonly, &h.export, h.is_tls) {
                // a failed reopen counts as a failed attempt; keep going
                // until the attempts run out
                debug!(target: "filter::retry", "reopen failed: {reopen_err}");
                if attempt >= self.retries {
                    return Err(reopen_err.with_errno(ErrorType::ESHUTDOWN));
                }
            }
        }
    }
}

impl Filter for RetryFilter {
    fn name(&self) -> &'static str {
        "retry"
    }

    // reopen is not safe against other requests in flight on the same
    // connection, so keep them serialized
    fn thread_model(&self) -> ThreadModel {
        ThreadModel::SerializeRequests
    }

    fn open(&self, _next: &Next, readonly: bool, name: &str, is_tls: bool) -> OpResult<Handle> {
        Ok(Box::new(RetryHandle {
            readonly,
            export: name.to_string(),
            is_tls,
            reopens: AtomicU32::new(0),
        }))
    }

    fn close(&self, handle: Handle) {
        if let Some(h) = handle.downcast_ref::<RetryHandle>() {
            debug!(
                target: "filter::retry",
                "reopens needed: {}", h.reopens.load(Ordering::Relaxed)
            );
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
        self.with_retry(next, handle, "pread", |next| next.pread(buf, offset, flags))
    }

    fn pwrite(
        &self,
        next: &Next,
        handle: HandleRef,
        buf: &[u8],
        offset: u64,
        flags: OpFlags,
    ) -> OpResult<()> {
        self.with_retry(next, handle, "pwrite", |next| next.pwrite(buf, offset, flags))
    }

    fn zero(
        &self,
        next: &Next,
        handle: HandleRef,
        count: u32,
        offset: u64,
        flags: OpFlags,
    ) -> OpResult<()> {
        self.with_retry(next, handle, "zero", |next| next.zero(count, offset, flags))
    }

    fn trim(
        &self,
        next: &Next,
        handle: HandleRef,
        count: u32,
        offset: u64,
        flags: OpFlags,
    ) -> OpResult<()> {
        self.with_retry(next, handle, "trim", |next| next.trim(count, offset, flags))
    }

    fn flush(&self, next: &Next, handle: HandleRef, flags: OpFlags) -> OpResult<()> {
        self.with_retry(next, handle, "flush", |next| next.flush(flags))
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
        self.with_retry(next, handle, "extents", |next| {
            // a partially filled accumulator from a failed attempt must not
            // leak into the retried call
            out.reset();
            next.extents(count, offset, flags, out)
        })
    }

    fn cache(
        &self,
        next: &Next,
        handle: HandleRef,
        count: u32,
        offset: u64,
        flags: OpFlags,
    ) -> OpResult<()> {
        self.with_retry(next, handle, "cache", |next| next.cache(count, offset, flags))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Plugin;
    use crate::stack::Stack;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    /// Plugin that fails every data call until it has been reopened.
    struct FlakyPlugin {
        healed: Arc<AtomicBool>,
        opens: Arc<AtomicU32>,
    }

    impl Plugin for FlakyPlugin {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn open(&self, _r: bool, _n: &str, _t: bool) -> OpResult<Handle> {
            if self.opens.fetch_add(1, Ordering::SeqCst) > 0 {
                // any reopen heals the backend
                self.healed.store(true, Ordering::SeqCst);
            }
            Ok(Box::new(()))
        }

        fn get_size(&self, _h: HandleRef) -> OpResult<u64> {
            Ok(4096)
        }

        fn pread(&self, _h: HandleRef, buf: &mut [u8], _o: u64, _f: OpFlags) -> OpResult<()> {
            if self.healed.load(Ordering::SeqCst) {
                buf.fill(7);
                Ok(())
            } else {
                Err(NbdError::new(ErrorType::EIO, "backend is down"))
            }
        }
    }

    #[test]
    fn failed_read_recovers_through_reopen() {
        let healed = Arc::new(AtomicBool::new(false));
        let opens = Arc::new(AtomicU32::new(0));
        let stack = Stack::new(
            vec![Box::new(RetryFilter::new(2, Duration::ZERO, false)) as Box<dyn Filter>],
            Box::new(FlakyPlugin {
                healed: healed.clone(),
                opens: opens.clone(),
            }),
        );
        let chain = stack.new_chain();
        stack.open_chain(&chain, false, "", false).unwrap();

        let mut buf = [0u8; 8];
        stack
            .top(&chain)
            .pread(&mut buf, 0, OpFlags::empty())
            .unwrap();
        assert_eq!(buf, [7u8; 8]);
        // initial open plus one reopen
        assert_eq!(opens.load(Ordering::SeqCst), 2);
    }

    /// Plugin that never recovers, whatever is done to it.
    struct DeadPlugin {
        attempts: Arc<AtomicU32>,
    }

    impl Plugin for DeadPlugin {
        fn name(&self) -> &'static str {
            "dead"
        }

        fn open(&self, _r: bool, _n: &str, _t: bool) -> OpResult<Handle> {
            Ok(Box::new(()))
        }

        fn get_size(&self, _h: HandleRef) -> OpResult<u64> {
            Ok(4096)
        }

        fn pread(&self, _h: HandleRef, _b: &mut [u8], _o: u64, _f: OpFlags) -> OpResult<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(NbdError::new(ErrorType::EIO, "backend is down"))
        }
    }

    #[test]
    fn retries_are_bounded() {
        let attempts = Arc::new(AtomicU32::new(0));
        let stack = Stack::new(
            vec![Box::new(RetryFilter::new(2, Duration::ZERO, false)) as Box<dyn Filter>],
            Box::new(DeadPlugin {
                attempts: attempts.clone(),
            }),
        );
        let chain = stack.new_chain();
        stack.open_chain(&chain, false, "", false).unwrap();

        let mut buf = [0u8; 8];
        let err = stack
            .top(&chain)
            .pread(&mut buf, 0, OpFlags::empty())
            .unwrap_err();
        assert_eq!(err.errno(), ErrorType::EIO);
        // the first call plus two retries, then give up
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
