//! The layer contract: the operation vocabulary every backend layer
//! implements.
//!
//! A backend stack is an ordered list of layers. The bottom layer is a
//! [`Plugin`], which actually produces and consumes bytes; every layer above
//! it is a [`Filter`], which sees the same vocabulary plus a [`Next`] object
//! for delegating down the stack. Layers communicate results as
//! `(value, NBD error number)` pairs, rendered here as [`OpResult`].
//!
//! [`Next`]: crate::stack::Next

use std::any::Any;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;
use color_eyre::Result;

use crate::extents::{Exports, Extents};
use crate::proto::ErrorType;
use crate::stack::Next;

/// An opaque per-connection handle produced by a layer's `open`. Only the
/// layer that created a handle may look inside it (by downcasting).
pub type Handle = Box<dyn Any + Send + Sync>;

/// Borrowed form of [`Handle`] passed to every per-connection operation.
pub type HandleRef<'a> = &'a (dyn Any + Send + Sync);

/// Error half of the `(result, error-code)` pair every operation returns.
/// Carries the NBD error number that will reach the wire plus a message for
/// the connection log.
#[derive(Debug, Clone)]
pub struct NbdError {
    errno: ErrorType,
    msg: String,
}

impl NbdError {
    /// An error with an explicit NBD error number.
    pub fn new<S: Into<String>>(errno: ErrorType, msg: S) -> Self {
        NbdError {
            errno,
            msg: msg.into(),
        }
    }

    /// `ENOTSUP`: the layer does not implement this operation. The engine
    /// may emulate on seeing this.
    pub fn not_supported(what: &str) -> Self {
        Self::new(ErrorType::ENOTSUP, format!("{what} is not supported"))
    }

    /// `EPERM`: the operation is forbidden on this connection.
    pub fn read_only() -> Self {
        Self::new(ErrorType::EPERM, "export is read-only")
    }

    /// `EINVAL` with a message.
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        Self::new(ErrorType::EINVAL, msg)
    }

    /// `EIO`: a layer was used before `open` or after `close`.
    pub fn not_open() -> Self {
        Self::new(ErrorType::EIO, "layer has no open handle")
    }

    /// The NBD error number that reaches the wire.
    pub fn errno(&self) -> ErrorType {
        self.errno
    }

    /// Replace the error number, keeping the message. Filters use this when
    /// they translate semantics.
    pub fn with_errno(mut self, errno: ErrorType) -> Self {
        self.errno = errno;
        self
    }
}

impl fmt::Display for NbdError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.errno, self.msg)
    }
}

impl std::error::Error for NbdError {}

impl From<io::Error> for NbdError {
    fn from(err: io::Error) -> Self {
        NbdError {
            errno: ErrorType::from_io_kind(err.kind()),
            msg: err.to_string(),
        }
    }
}

/// Result of every backend operation.
pub type OpResult<T> = std::result::Result<T, NbdError>;

bitflags! {
    /// Flags passed down the stack with data operations.
    pub struct OpFlags: u32 {
        /// On `zero`: the layer may punch a hole instead of writing zeroes.
        const MAY_TRIM = 1 << 0;
        /// The operation must be durable before it returns.
        const FUA = 1 << 1;
        /// On `extents`: the caller only needs one extent.
        const REQ_ONE = 1 << 2;
        /// On `zero`: fail with `ENOTSUP` rather than write slowly.
        const FAST_ZERO = 1 << 3;
    }
}

/// How far a layer supports forced unit access.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum FuaMode {
    /// No durability guarantee per request.
    None,
    /// The engine emulates FUA with a flush after the operation.
    Emulate,
    /// The layer honors [`OpFlags::FUA`] natively.
    Native,
}

/// How far a layer supports cache (prefetch) requests.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum CacheMode {
    /// Cache requests are rejected.
    None,
    /// The engine emulates cache with a throwaway read.
    Emulate,
    /// The layer implements `cache` itself.
    Native,
}

/// Concurrency ceiling a layer is prepared for, in increasing strictness.
/// The engine runs the whole stack at the strictest declared model.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThreadModel {
    /// Multiple in-flight requests per connection.
    Parallel,
    /// One request at a time per connection.
    SerializeRequests,
    /// One request at a time across the whole process.
    SerializeAllRequests,
    /// One connection at a time.
    SerializeConnections,
}

impl ThreadModel {
    /// The stricter of two models.
    pub fn stricter(self, other: ThreadModel) -> ThreadModel {
        self.max(other)
    }
}

/// Block size constraint triple, in bytes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BlockSize {
    /// Smallest request the export can serve.
    pub minimum: u32,
    /// Request size the export prefers.
    pub preferred: u32,
    /// Largest single request the export accepts.
    pub maximum: u32,
}

impl Default for BlockSize {
    fn default() -> Self {
        BlockSize {
            minimum: 1,
            preferred: 4096,
            maximum: 32 * 1024 * 1024,
        }
    }
}

/// Engine handle given to every layer at `load`. Lets a layer request
/// process shutdown without a reference back into the server.
#[derive(Debug, Default)]
pub struct Control {
    shutdown: AtomicBool,
}

impl Control {
    /// Fresh control block with no shutdown requested.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the server to stop accepting and wind down. Existing requests
    /// finish; the accept loop and request loops observe the flag between
    /// operations.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// The terminal layer of a stack: produces and consumes the actual bytes.
///
/// A minimal plugin implements `name`, `open`, `get_size` and `pread`; every
/// other operation defaults to "not supported" (or a reasonable no-op) so the
/// capability resolver can emulate or refuse it. A plugin that implements
/// `pwrite` must also override `can_write`.
#[allow(unused_variables)]
pub trait Plugin: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Called once at startup, before any connection.
    fn load(&self, ctl: &Control) {}

    /// Called once at process exit.
    fn unload(&self) {}

    /// Last chance to fail before the server starts accepting.
    fn get_ready(&self) -> Result<()> {
        Ok(())
    }

    /// Called in the child after the server daemonizes.
    fn after_fork(&self) -> Result<()> {
        Ok(())
    }

    /// Called after all connections close, before `unload`.
    fn cleanup(&self) {}

    /// Veto point before any handshake work happens for a connection.
    fn preconnect(&self, readonly: bool) -> OpResult<()> {
        Ok(())
    }

    /// Append the exports this plugin serves. The default advertises the
    /// default export.
    fn list_exports(&self, readonly: bool, is_tls: bool, exports: &mut Exports) -> OpResult<()> {
        let name = self.default_export(readonly, is_tls)?;
        exports.add(&name, None)
    }

    /// The export used when the client requests the empty name.
    fn default_export(&self, readonly: bool, is_tls: bool) -> OpResult<String> {
        Ok(String::new())
    }

    /// Create the per-connection handle.
    fn open(&self, readonly: bool, name: &str, is_tls: bool) -> OpResult<Handle>;

    /// Destroy a handle produced by `open`.
    fn close(&self, handle: Handle) {}

    /// Called after the whole chain has opened, bottom-up.
    fn prepare(&self, handle: HandleRef, readonly: bool) -> OpResult<()> {
        Ok(())
    }

    /// Called before the chain closes, top-down.
    fn finalize(&self, handle: HandleRef) -> OpResult<()> {
        Ok(())
    }

    /// Size of the export in bytes.
    fn get_size(&self, handle: HandleRef) -> OpResult<u64>;

    /// Block size constraints for this export.
    fn block_size(&self, handle: HandleRef) -> OpResult<BlockSize> {
        Ok(BlockSize::default())
    }

    /// Whether writes are possible at all.
    fn can_write(&self, handle: HandleRef) -> OpResult<bool> {
        Ok(false)
    }

    /// Whether `flush` does anything meaningful.
    fn can_flush(&self, handle: HandleRef) -> OpResult<bool> {
        Ok(false)
    }

    /// Whether the backing store is rotational media.
    fn is_rotational(&self, handle: HandleRef) -> OpResult<bool> {
        Ok(false)
    }

    /// Whether `trim` is implemented.
    fn can_trim(&self, handle: HandleRef) -> OpResult<bool> {
        Ok(false)
    }

    /// Whether `zero` is implemented natively.
    fn can_zero(&self, handle: HandleRef) -> OpResult<bool> {
        Ok(false)
    }

    /// Whether a fast-zero request can be honored.
    fn can_fast_zero(&self, handle: HandleRef) -> OpResult<bool> {
        Ok(false)
    }

    /// FUA support level. The resolver upgrades `None` to `Emulate` when the
    /// layer can flush.
    fn can_fua(&self, handle: HandleRef) -> OpResult<FuaMode> {
        Ok(FuaMode::None)
    }

    /// Whether multiple connections may safely share this export.
    fn can_multi_conn(&self, handle: HandleRef) -> OpResult<bool> {
        Ok(false)
    }

    /// Whether `extents` reports real allocation data.
    fn can_extents(&self, handle: HandleRef) -> OpResult<bool> {
        Ok(false)
    }

    /// Cache support level.
    fn can_cache(&self, handle: HandleRef) -> OpResult<CacheMode> {
        Ok(CacheMode::None)
    }

    /// Optional free-form description shown to clients.
    fn export_description(&self, handle: HandleRef) -> OpResult<Option<String>> {
        Ok(None)
    }

    /// Fill `buf` from `offset`.
    fn pread(&self, handle: HandleRef, buf: &mut [u8], offset: u64, flags: OpFlags)
        -> OpResult<()>;

    /// Write `buf` at `offset`.
    fn pwrite(&self, handle: HandleRef, buf: &[u8], offset: u64, flags: OpFlags) -> OpResult<()> {
        Err(NbdError::read_only())
    }

    /// Write `count` zero bytes at `offset`. Returning `ENOTSUP` makes the
    /// engine fall back to `pwrite` with a zero buffer.
    fn zero(&self, handle: HandleRef, count: u32, offset: u64, flags: OpFlags) -> OpResult<()> {
        Err(NbdError::not_supported("zero"))
    }

    /// Discard `count` bytes at `offset`.
    fn trim(&self, handle: HandleRef, count: u32, offset: u64, flags: OpFlags) -> OpResult<()> {
        Err(NbdError::not_supported("trim"))
    }

    /// Make completed writes durable.
    fn flush(&self, handle: HandleRef, flags: OpFlags) -> OpResult<()> {
        Err(NbdError::invalid("flush is not supported"))
    }

    /// Append allocation extents covering `offset`..`offset + count` to
    /// `out`. The default reports one allocated data extent.
    fn extents(
        &self,
        handle: HandleRef,
        count: u32,
        offset: u64,
        flags: OpFlags,
        out: &mut Extents,
    ) -> OpResult<()> {
        out.add(offset, count as u64, crate::extents::ExtentFlags::empty())
    }

    /// Prefetch a range. Returning `ENOTSUP` lets the engine emulate with a
    /// throwaway read when `can_cache` says `Emulate`.
    fn cache(&self, handle: HandleRef, count: u32, offset: u64, flags: OpFlags) -> OpResult<()> {
        Err(NbdError::not_supported("cache"))
    }

    /// The loosest concurrency model this plugin tolerates.
    fn thread_model(&self) -> ThreadModel {
        ThreadModel::Parallel
    }
}

impl fmt::Debug for dyn Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Plugin").field(&self.name()).finish()
    }
}

/// A layer stacked above the plugin. Every operation receives a [`Next`]
/// that dispatches to the layer below; the default implementation of each
/// operation passes straight through.
///
/// A filter may implement an operation by passing through, by intercepting
/// (returning without calling `next`), or by decorating (adjusting arguments
/// or issuing extra `next` calls, such as a follow-up flush). Filters may
/// call any operation on `next`, not just the one matching the entry point.
#[allow(unused_variables)]
pub trait Filter: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Called once at startup, before any connection.
    fn load(&self, ctl: &Control) {}

    /// Called once at process exit.
    fn unload(&self) {}

    /// Last chance to fail before the server starts accepting.
    fn get_ready(&self) -> Result<()> {
        Ok(())
    }

    /// Called in the child after the server daemonizes.
    fn after_fork(&self) -> Result<()> {
        Ok(())
    }

    /// Called after all connections close, before `unload`.
    fn cleanup(&self) {}

    /// Veto point before any handshake work happens for a connection.
    fn preconnect(&self, next: &Next, readonly: bool) -> OpResult<()> {
        next.preconnect(readonly)
    }

    /// Append or rewrite the set of advertised exports.
    fn list_exports(
        &self,
        next: &Next,
        readonly: bool,
        is_tls: bool,
        exports: &mut Exports,
    ) -> OpResult<()> {
        next.list_exports(readonly, is_tls, exports)
    }

    /// The export used when the client requests the empty name.
    fn default_export(&self, next: &Next, readonly: bool, is_tls: bool) -> OpResult<String> {
        next.default_export(readonly, is_tls)
    }

    /// Create this filter's per-connection handle. Runs after every layer
    /// below has opened, so `next` is fully usable.
    fn open(&self, next: &Next, readonly: bool, name: &str, is_tls: bool) -> OpResult<Handle> {
        Ok(Box::new(()))
    }

    /// Destroy a handle produced by `open`. Runs before the layers below
    /// close.
    fn close(&self, handle: Handle) {}

    /// Called after the whole chain has opened, bottom-up.
    fn prepare(&self, next: &Next, handle: HandleRef, readonly: bool) -> OpResult<()> {
        Ok(())
    }

    /// Called before the chain closes, top-down.
    fn finalize(&self, next: &Next, handle: HandleRef) -> OpResult<()> {
        Ok(())
    }

    /// Size of the export in bytes.
    fn get_size(&self, next: &Next, handle: HandleRef) -> OpResult<u64> {
        next.get_size()
    }

    /// Block size constraints. A filter may narrow or widen the triple it
    /// sees below, subject to the resolver's validation.
    fn block_size(&self, next: &Next, handle: HandleRef) -> OpResult<BlockSize> {
        next.block_size()
    }

    /// Whether writes are possible at all.
    fn can_write(&self, next: &Next, handle: HandleRef) -> OpResult<bool> {
        next.can_write()
    }

    /// Whether `flush` does anything meaningful.
    fn can_flush(&self, next: &Next, handle: HandleRef) -> OpResult<bool> {
        next.can_flush()
    }

    /// Whether the backing store is rotational media.
    fn is_rotational(&self, next: &Next, handle: HandleRef) -> OpResult<bool> {
        next.is_rotational()
    }

    /// Whether `trim` is implemented.
    fn can_trim(&self, next: &Next, handle: HandleRef) -> OpResult<bool> {
        next.can_trim()
    }

    /// Whether `zero` is implemented natively.
    fn can_zero(&self, next: &Next, handle: HandleRef) -> OpResult<bool> {
        next.can_zero()
    }

    /// Whether a fast-zero request can be honored.
    fn can_fast_zero(&self, next: &Next, handle: HandleRef) -> OpResult<bool> {
        next.can_fast_zero()
    }

    /// FUA support level.
    fn can_fua(&self, next: &Next, handle: HandleRef) -> OpResult<FuaMode> {
        next.can_fua()
    }

    /// Whether multiple connections may safely share this export.
    fn can_multi_conn(&self, next: &Next, handle: HandleRef) -> OpResult<bool> {
        next.can_multi_conn()
    }

    /// Whether `extents` reports real allocation data.
    fn can_extents(&self, next: &Next, handle: HandleRef) -> OpResult<bool> {
        next.can_extents()
    }

    /// Cache support level.
    fn can_cache(&self, next: &Next, handle: HandleRef) -> OpResult<CacheMode> {
        next.can_cache()
    }

    /// Optional free-form description shown to clients.
    fn export_description(&self, next: &Next, handle: HandleRef) -> OpResult<Option<String>> {
        next.export_description()
    }

    /// Fill `buf` from `offset`.
    fn pread(
        &self,
        next: &Next,
        handle: HandleRef,
        buf: &mut [u8],
        offset: u64,
        flags: OpFlags,
    ) -> OpResult<()> {
        next.pread(buf, offset, flags)
    }

    /// Write `buf` at `offset`.
    fn pwrite(
        &self,
        next: &Next,
        handle: HandleRef,
        buf: &[u8],
        offset: u64,
        flags: OpFlags,
    ) -> OpResult<()> {
        next.pwrite(buf, offset, flags)
    }

    /// Write `count` zero bytes at `offset`.
    fn zero(
        &self,
        next: &Next,
        handle: HandleRef,
        count: u32,
        offset: u64,
        flags: OpFlags,
    ) -> OpResult<()> {
        next.zero(count, offset, flags)
    }

    /// Discard `count` bytes at `offset`.
    fn trim(
        &self,
        next: &Next,
        handle: HandleRef,
        count: u32,
        offset: u64,
        flags: OpFlags,
    ) -> OpResult<()> {
        next.trim(count, offset, flags)
    }

    /// Make completed writes durable.
    fn flush(&self, next: &Next, handle: HandleRef, flags: OpFlags) -> OpResult<()> {
        next.flush(flags)
    }

    /// Append allocation extents covering `offset`..`offset + count`.
    fn extents(
        &self,
        next: &Next,
        handle: HandleRef,
        count: u32,
        offset: u64,
        flags: OpFlags,
        out: &mut Extents,
    ) -> OpResult<()> {
        next.extents(count, offset, flags, out)
    }

    /// Prefetch a range.
    fn cache(
        &self,
        next: &Next,
        handle: HandleRef,
        count: u32,
        offset: u64,
        flags: OpFlags,
    ) -> OpResult<()> {
        next.cache(count, offset, flags)
    }

    /// The loosest concurrency model this filter tolerates. The engine runs
    /// the stack at the strictest model any layer declares.
    fn thread_model(&self) -> ThreadModel {
        ThreadModel::Parallel
    }
}
