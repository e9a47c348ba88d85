//! Built-in plugins: the terminal layers that actually produce and consume
//! bytes.

mod file;
mod memory;
mod null;

pub use file::FilePlugin;
pub use memory::MemoryPlugin;
pub use null::NullPlugin;
