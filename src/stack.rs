//! The backend stack: an ordered list of filters terminating in a plugin,
//! plus the per-connection handle chain and the [`Next`] object filters use
//! to delegate downward.
//!
//! The stack itself is process-wide and immutable once the server starts;
//! only the handle chain is per-connection. Handles live in per-layer slots
//! behind read/write locks: normal dispatch takes a read lock, and the
//! reopen hook takes the plugin slot's write lock, which serializes it with
//! in-flight requests on the same connection.

use std::sync::{PoisonError, RwLock};

use log::debug;

use crate::backend::{
    BlockSize, CacheMode, Control, Filter, FuaMode, Handle, NbdError, OpFlags, OpResult, Plugin,
    ThreadModel,
};
use crate::extents::{Exports, Extents};

/// One layer of the stack.
pub enum Layer {
    /// An intermediate layer that can intercept or decorate operations.
    Filter(Box<dyn Filter>),
    /// The terminal layer that produces and consumes bytes.
    Plugin(Box<dyn Plugin>),
}

impl Layer {
    fn name(&self) -> &'static str {
        match self {
            Layer::Filter(f) => f.name(),
            Layer::Plugin(p) => p.name(),
        }
    }
}

/// The process-wide backend stack. Index 0 is the topmost filter; the last
/// index is always the plugin.
pub struct Stack {
    layers: Vec<Layer>,
}

/// Per-connection handle storage, one slot per layer. A slot is `None`
/// outside the layer's `open`..`close` window.
pub struct HandleChain {
    slots: Vec<RwLock<Option<Handle>>>,
}

impl HandleChain {
    fn slot(&self, depth: usize) -> &RwLock<Option<Handle>> {
        &self.slots[depth]
    }
}

/// A filter's window onto the layer directly below it. Encapsulates the
/// next layer's handle and operations; filters never see the handle itself.
pub struct Next<'a> {
    stack: &'a Stack,
    chain: &'a HandleChain,
    depth: usize,
}

macro_rules! dispatch {
    ($self:ident, $method:ident ( $($arg:expr),* )) => {{
        let slot = $self.chain.slot($self.depth).read()
            .unwrap_or_else(PoisonError::into_inner);
        let handle = slot.as_ref().ok_or_else(NbdError::not_open)?;
        match &$self.stack.layers[$self.depth] {
            Layer::Plugin(p) => p.$method(handle.as_ref() $(, $arg)*),
            Layer::Filter(f) => {
                let next = $self.below();
                f.$method(&next, handle.as_ref() $(, $arg)*)
            }
        }
    }};
}

impl<'a> Next<'a> {
    fn below(&self) -> Next<'a> {
        Next {
            stack: self.stack,
            chain: self.chain,
            depth: self.depth + 1,
        }
    }

    /// Veto point before the handshake; does not need an open handle.
    pub fn preconnect(&self, readonly: bool) -> OpResult<()> {
        match &self.stack.layers[self.depth] {
            Layer::Plugin(p) => p.preconnect(readonly),
            Layer::Filter(f) => f.preconnect(&self.below(), readonly),
        }
    }

    /// Enumerate exports; does not need an open handle.
    pub fn list_exports(&self, readonly: bool, is_tls: bool, out: &mut Exports) -> OpResult<()> {
        match &self.stack.layers[self.depth] {
            Layer::Plugin(p) => p.list_exports(readonly, is_tls, out),
            Layer::Filter(f) => f.list_exports(&self.below(), readonly, is_tls, out),
        }
    }

    /// Resolve the empty export name; does not need an open handle.
    pub fn default_export(&self, readonly: bool, is_tls: bool) -> OpResult<String> {
        match &self.stack.layers[self.depth] {
            Layer::Plugin(p) => p.default_export(readonly, is_tls),
            Layer::Filter(f) => f.default_export(&self.below(), readonly, is_tls),
        }
    }

    /// Size of the export in bytes.
    pub fn get_size(&self) -> OpResult<u64> {
        dispatch!(self, get_size())
    }

    /// Block size constraint triple.
    pub fn block_size(&self) -> OpResult<BlockSize> {
        dispatch!(self, block_size())
    }

    /// Whether writes are possible.
    pub fn can_write(&self) -> OpResult<bool> {
        dispatch!(self, can_write())
    }

    /// Whether `flush` is meaningful.
    pub fn can_flush(&self) -> OpResult<bool> {
        dispatch!(self, can_flush())
    }

    /// Whether the media is rotational.
    pub fn is_rotational(&self) -> OpResult<bool> {
        dispatch!(self, is_rotational())
    }

    /// Whether `trim` is implemented.
    pub fn can_trim(&self) -> OpResult<bool> {
        dispatch!(self, can_trim())
    }

    /// Whether `zero` is implemented natively.
    pub fn can_zero(&self) -> OpResult<bool> {
        dispatch!(self, can_zero())
    }

    /// Whether fast-zero can be honored.
    pub fn can_fast_zero(&self) -> OpResult<bool> {
        dispatch!(self, can_fast_zero())
    }

    /// FUA support level.
    pub fn can_fua(&self) -> OpResult<FuaMode> {
        dispatch!(self, can_fua())
    }

    /// Whether multiple connections may share the export.
    pub fn can_multi_conn(&self) -> OpResult<bool> {
        dispatch!(self, can_multi_conn())
    }

    /// Whether `extents` reports real allocation data.
    pub fn can_extents(&self) -> OpResult<bool> {
        dispatch!(self, can_extents())
    }

    /// Cache support level.
    pub fn can_cache(&self) -> OpResult<CacheMode> {
        dispatch!(self, can_cache())
    }

    /// Optional export description.
    pub fn export_description(&self) -> OpResult<Option<String>> {
        dispatch!(self, export_description())
    }

    /// Fill `buf` from `offset`.
    pub fn pread(&self, buf: &mut [u8], offset: u64, flags: OpFlags) -> OpResult<()> {
        dispatch!(self, pread(buf, offset, flags))
    }

    /// Write `buf` at `offset`.
    pub fn pwrite(&self, buf: &[u8], offset: u64, flags: OpFlags) -> OpResult<()> {
        dispatch!(self, pwrite(buf, offset, flags))
    }

    /// Write `count` zero bytes at `offset`.
    pub fn zero(&self, count: u32, offset: u64, flags: OpFlags) -> OpResult<()> {
        dispatch!(self, zero(count, offset, flags))
    }

    /// Discard `count` bytes at `offset`.
    pub fn trim(&self, count: u32, offset: u64, flags: OpFlags) -> OpResult<()> {
        dispatch!(self, trim(count, offset, flags))
    }

    /// Make completed writes durable.
    pub fn flush(&self, flags: OpFlags) -> OpResult<()> {
        dispatch!(self, flush(flags))
    }

    /// Append allocation extents for `offset..offset + count` to `out`.
    pub fn extents(
        &self,
        count: u32,
        offset: u64,
        flags: OpFlags,
        out: &mut Extents,
    ) -> OpResult<()> {
        dispatch!(self, extents(count, offset, flags, out))
    }

    /// Prefetch a range.
    pub fn cache(&self, count: u32, offset: u64, flags: OpFlags) -> OpResult<()> {
        dispatch!(self, cache(count, offset, flags))
    }

    /// Close and reopen the plugin's handle while every filter keeps its
    /// own. Serialized against in-flight requests on this connection by the
    /// plugin slot's write lock. This is the hook retrying filters use to
    /// recover from a dead backend.
    pub fn reopen(&self, readonly: bool, name: &str, is_tls: bool) -> OpResult<()> {
        self.stack.reopen_plugin(self.chain, readonly, name, is_tls)
    }
}

impl Stack {
    /// Assemble a stack from filters (listed topmost first) above a plugin.
    pub fn new(filters: Vec<Box<dyn Filter>>, plugin: Box<dyn Plugin>) -> Self {
        let mut layers: Vec<Layer> = filters.into_iter().map(Layer::Filter).collect();
        layers.push(Layer::Plugin(plugin));
        Stack { layers }
    }

    fn plugin(&self) -> &dyn Plugin {
        match self.layers.last() {
            Some(Layer::Plugin(p)) => p.as_ref(),
            // Stack::new guarantees the bottom layer is the plugin
            _ => unreachable!("stack has no plugin"),
        }
    }

    /// Number of layers, plugin included.
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    /// A fresh all-empty handle chain for one connection.
    pub fn new_chain(&self) -> HandleChain {
        HandleChain {
            slots: (0..self.layers.len()).map(|_| RwLock::new(None)).collect(),
        }
    }

    /// The topmost layer's view, used by the engine to enter the stack.
    pub fn top<'a>(&'a self, chain: &'a HandleChain) -> Next<'a> {
        Next {
            stack: self,
            chain,
            depth: 0,
        }
    }

    /// Called once at startup before any connection.
    pub fn load(&self, ctl: &Control) {
        // bottom-up so a filter's load sees a loaded plugin
        for layer in self.layers.iter().rev() {
            debug!(target: "nbd", "load: {}", layer.name());
            match layer {
                Layer::Plugin(p) => p.load(ctl),
                Layer::Filter(f) => f.load(ctl),
            }
        }
    }

    /// Called once at process exit, top-down.
    pub fn unload(&self) {
        for layer in &self.layers {
            debug!(target: "nbd", "unload: {}", layer.name());
            match layer {
                Layer::Plugin(p) => {
                    p.cleanup();
                    p.unload()
                }
                Layer::Filter(f) => {
                    f.cleanup();
                    f.unload()
                }
            }
        }
    }

    /// Last chance for any layer to fail before the listener starts.
    pub fn get_ready(&self) -> color_eyre::Result<()> {
        for layer in self.layers.iter().rev() {
            match layer {
                Layer::Plugin(p) => p.get_ready()?,
                Layer::Filter(f) => f.get_ready()?,
            }
        }
        Ok(())
    }

    /// Notify every layer that the server forked into the background.
    pub fn after_fork(&self) -> color_eyre::Result<()> {
        for layer in self.layers.iter().rev() {
            match layer {
                Layer::Plugin(p) => p.after_fork()?,
                Layer::Filter(f) => f.after_fork()?,
            }
        }
        Ok(())
    }

    /// The strictest thread model any layer declares.
    pub fn thread_model(&self) -> ThreadModel {
        let mut model = ThreadModel::Parallel;
        for layer in &self.layers {
            let layer_model = match layer {
                Layer::Plugin(p) => p.thread_model(),
                Layer::Filter(f) => f.thread_model(),
            };
            if layer_model > model {
                debug!(
                    target: "nbd",
                    "{} restricts thread model to {:?}",
                    layer.name(),
                    layer_model
                );
            }
            model = model.stricter(layer_model);
        }
        model
    }

    /// Open every layer's handle for one connection: the plugin first, then
    /// each filter above it, so a layer's `open` may already use everything
    /// below. Follows with `prepare`, also bottom-up. On failure the layers
    /// that did open are closed again.
    pub fn open_chain(
        &self,
        chain: &HandleChain,
        readonly: bool,
        name: &str,
        is_tls: bool,
    ) -> OpResult<()> {
        let n = self.layers.len();
        for depth in (0..n).rev() {
            let result = match &self.layers[depth] {
                Layer::Plugin(p) => p.open(readonly, name, is_tls),
                Layer::Filter(f) => {
                    let next = Next {
                        stack: self,
                        chain,
                        depth: depth + 1,
                    };
                    f.open(&next, readonly, name, is_tls)
                }
            };
            match result {
                Ok(handle) => {
                    *chain.slot(depth).write().unwrap_or_else(PoisonError::into_inner) =
                        Some(handle)
                }
                Err(err) => {
                    debug!(target: "nbd", "open failed at {}: {}", self.layers[depth].name(), err);
                    self.close_below(chain, depth);
                    return Err(err);
                }
            }
        }
        for depth in (0..n).rev() {
            let result = {
                let slot = chain.slot(depth).read().unwrap_or_else(PoisonError::into_inner);
                let handle = slot.as_ref().ok_or_else(NbdError::not_open)?;
                match &self.layers[depth] {
                    Layer::Plugin(p) => p.prepare(handle.as_ref(), readonly),
                    Layer::Filter(f) => {
                        let next = Next {
                            stack: self,
                            chain,
                            depth: depth + 1,
                        };
                        f.prepare(&next, handle.as_ref(), readonly)
                    }
                }
            };
            if let Err(err) = result {
                debug!(target: "nbd", "prepare failed at {}: {}", self.layers[depth].name(), err);
                self.close_chain(chain);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Finalize and close every open handle, topmost layer first, so a
    /// layer closes only after everything above it is gone. Close errors
    /// are logged, never propagated: disconnect must always finish.
    pub fn close_chain(&self, chain: &HandleChain) {
        let n = self.layers.len();
        for depth in 0..n {
            let result = {
                let slot = chain.slot(depth).read().unwrap_or_else(PoisonError::into_inner);
                match slot.as_ref() {
                    Some(handle) => match &self.layers[depth] {
                        Layer::Plugin(p) => p.finalize(handle.as_ref()),
                        Layer::Filter(f) => {
                            let next = Next {
                                stack: self,
                                chain,
                                depth: depth + 1,
                            };
                            f.finalize(&next, handle.as_ref())
                        }
                    },
                    None => Ok(()),
                }
            };
            if let Err(err) = result {
                debug!(target: "nbd", "finalize failed at {}: {}", self.layers[depth].name(), err);
            }
        }
        self.close_below(chain, 0);
    }

    /// Close handles at `from` and below (higher indices), top-down.
    fn close_below(&self, chain: &HandleChain, from: usize) {
        for depth in from..self.layers.len() {
            let handle = chain
                .slot(depth)
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(handle) = handle {
                match &self.layers[depth] {
                    Layer::Plugin(p) => p.close(handle),
                    Layer::Filter(f) => f.close(handle),
                }
            }
        }
    }

    /// Reopen the plugin layer only; filters keep their handles. Takes the
    /// plugin slot's write lock, so it waits for in-flight requests that
    /// have reached the plugin and blocks new ones until done.
    fn reopen_plugin(
        &self,
        chain: &HandleChain,
        readonly: bool,
        name: &str,
        is_tls: bool,
    ) -> OpResult<()> {
        let depth = self.layers.len() - 1;
        let plugin = self.plugin();
        let mut slot = chain.slot(depth).write().unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = slot.take() {
            if let Err(err) = plugin.finalize(old.as_ref()) {
                debug!(target: "nbd", "finalize during reopen failed: {err}");
            }
            plugin.close(old);
        }
        let handle = plugin.open(readonly, name, is_tls)?;
        plugin.prepare(handle.as_ref(), readonly)?;
        *slot = Some(handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records the order lifecycle callbacks fire in, shared by one plugin
    /// and any number of filters.
    #[derive(Clone, Default)]
    struct Trace(Arc<Mutex<Vec<String>>>);

    impl Trace {
        fn push(&self, event: &str) {
            self.0.lock().unwrap().push(event.to_string());
        }

        fn take(&self) -> Vec<String> {
            std::mem::take(&mut self.0.lock().unwrap())
        }
    }

    struct TracingPlugin {
        trace: Trace,
    }

    impl Plugin for TracingPlugin {
        fn name(&self) -> &'static str {
            "tracing"
        }

        fn open(&self, _readonly: bool, _name: &str, _is_tls: bool) -> OpResult<Handle> {
            self.trace.push("plugin.open");
            Ok(Box::new(()))
        }

        fn close(&self, _handle: Handle) {
            self.trace.push("plugin.close");
        }

        fn prepare(&self, _handle: crate::backend::HandleRef, _readonly: bool) -> OpResult<()> {
            self.trace.push("plugin.prepare");
            Ok(())
        }

        fn finalize(&self, _handle: crate::backend::HandleRef) -> OpResult<()> {
            self.trace.push("plugin.finalize");
            Ok(())
        }

        fn get_size(&self, _handle: crate::backend::HandleRef) -> OpResult<u64> {
            Ok(1024)
        }

        fn pread(
            &self,
            _handle: crate::backend::HandleRef,
            buf: &mut [u8],
            _offset: u64,
            _flags: OpFlags,
        ) -> OpResult<()> {
            self.trace.push("plugin.pread");
            buf.fill(0);
            Ok(())
        }
    }

    struct TracingFilter {
        tag: &'static str,
        trace: Trace,
    }

    impl Filter for TracingFilter {
        fn name(&self) -> &'static str {
            "tracing"
        }

        fn open(
            &self,
            next: &Next,
            _readonly: bool,
            _name: &str,
            _is_tls: bool,
        ) -> OpResult<Handle> {
            // everything below must already be open
            assert_eq!(next.get_size()?, 1024);
            self.trace.push(&format!("{}.open", self.tag));
            Ok(Box::new(self.tag))
        }

        fn close(&self, handle: Handle) {
            let tag = handle.downcast_ref::<&'static str>().unwrap();
            assert_eq!(*tag, self.tag);
            self.trace.push(&format!("{}.close", self.tag));
        }

        fn pread(
            &self,
            next: &Next,
            _handle: crate::backend::HandleRef,
            buf: &mut [u8],
            offset: u64,
            flags: OpFlags,
        ) -> OpResult<()> {
            self.trace.push(&format!("{}.pread", self.tag));
            next.pread(buf, offset, flags)
        }
    }

    fn tracing_stack(trace: &Trace) -> Stack {
        Stack::new(
            vec![
                Box::new(TracingFilter {
                    tag: "top",
                    trace: trace.clone(),
                }),
                Box::new(TracingFilter {
                    tag: "mid",
                    trace: trace.clone(),
                }),
            ],
            Box::new(TracingPlugin {
                trace: trace.clone(),
            }),
        )
    }

    #[test]
    fn open_is_bottom_up_and_close_top_down() {
        let trace = Trace::default();
        let stack = tracing_stack(&trace);
        let chain = stack.new_chain();
        stack.open_chain(&chain, false, "", false).unwrap();
        assert_eq!(
            trace.take(),
            ["plugin.open", "mid.open", "top.open", "plugin.prepare"]
        );
        stack.close_chain(&chain);
        assert_eq!(
            trace.take(),
            ["plugin.finalize", "top.close", "mid.close", "plugin.close"]
        );
    }

    #[test]
    fn dispatch_descends_the_chain_in_order() {
        let trace = Trace::default();
        let stack = tracing_stack(&trace);
        let chain = stack.new_chain();
        stack.open_chain(&chain, false, "", false).unwrap();
        trace.take();

        let mut buf = [1u8; 16];
        stack.top(&chain).pread(&mut buf, 0, OpFlags::empty()).unwrap();
        assert_eq!(trace.take(), ["top.pread", "mid.pread", "plugin.pread"]);
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn reopen_replaces_only_the_plugin_handle() {
        let trace = Trace::default();
        let stack = tracing_stack(&trace);
        let chain = stack.new_chain();
        stack.open_chain(&chain, false, "", false).unwrap();
        trace.take();

        stack.top(&chain).reopen(false, "", false).unwrap();
        assert_eq!(
            trace.take(),
            ["plugin.finalize", "plugin.close", "plugin.open", "plugin.prepare"]
        );

        // filters kept their handles and dispatch still works
        let mut buf = [0u8; 4];
        stack.top(&chain).pread(&mut buf, 0, OpFlags::empty()).unwrap();
        assert_eq!(trace.take(), ["top.pread", "mid.pread", "plugin.pread"]);
    }

    #[test]
    fn ops_before_open_report_a_closed_layer() {
        let trace = Trace::default();
        let stack = tracing_stack(&trace);
        let chain = stack.new_chain();
        let mut buf = [0u8; 4];
        let err = stack
            .top(&chain)
            .pread(&mut buf, 0, OpFlags::empty())
            .unwrap_err();
        assert_eq!(err.errno(), crate::proto::ErrorType::EIO);
    }
}
