//! A user-space Network Block Device (NBD) server with a pluggable backend
//! stack.
//!
//! Bytes are produced and consumed by a [`Plugin`]; between the wire and
//! the plugin sits an ordered chain of [`Filter`]s that can intercept,
//! decorate, rate-limit, retry, or log every storage operation. The engine
//! itself speaks the protocol (handshake, option negotiation, optional
//! TLS upgrade, and the request/reply loop in both simple and structured
//! framing) and enforces no policy on the bytes.
//!
//! See <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md>
//! for the protocol description.
//!
//! ```no_run
//! use nbdstack::plugins::MemoryPlugin;
//! use nbdstack::{Config, Server, Stack};
//!
//! let plugin = Box::new(MemoryPlugin::new("scratch", 64 * 1024 * 1024));
//! let server = Server::new(Stack::new(vec![], plugin), Config::default());
//! server.start().unwrap();
//! ```

pub mod backend;
pub mod caps;
pub mod conn;
pub mod extents;
pub mod filters;
pub mod handshake;
pub mod plugins;
pub mod proto;
pub mod registry;
pub mod server;
pub mod stack;
pub mod threads;
pub mod tls;
pub mod transmit;

pub use backend::{
    BlockSize, CacheMode, Control, Filter, FuaMode, Handle, HandleRef, NbdError, OpFlags,
    OpResult, Plugin, ThreadModel,
};
pub use caps::Caps;
pub use extents::{Exports, ExtentFlags, Extents};
pub use registry::{Registry, Settings};
pub use server::{Config, Listen, Server};
pub use stack::{Next, Stack};
pub use tls::TlsMode;
