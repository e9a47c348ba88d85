//! File-backed plugin, exporting an underlying file through positional
//! reads and writes.

use std::fs::{File, OpenOptions};
use std::os::unix::prelude::FileExt;
use std::path::PathBuf;

use log::warn;

use crate::backend::{Handle, HandleRef, NbdError, OpFlags, OpResult, Plugin};
use crate::proto::ErrorType;

/// A disk image stored in a regular file.
pub struct FilePlugin {
    export: String,
    path: PathBuf,
}

/// Per-connection handle: each connection gets its own descriptor.
struct FileHandle {
    file: File,
}

impl FilePlugin {
    /// Serve the file at `path` as export `export`.
    pub fn new<S: Into<String>, P: Into<PathBuf>>(export: S, path: P) -> FilePlugin {
        FilePlugin {
            export: export.into(),
            path: path.into(),
        }
    }

    fn handle<'a>(&self, handle: HandleRef<'a>) -> OpResult<&'a FileHandle> {
        handle
            .downcast_ref::<FileHandle>()
            .ok_or_else(|| NbdError::new(ErrorType::EIO, "not a file handle"))
    }
}

impl Plugin for FilePlugin {
    fn name(&self) -> &'static str {
        "file"
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
        exports.add(&self.export, None)
    }

    fn open(&self, readonly: bool, name: &str, _is_tls: bool) -> OpResult<Handle> {
        if !name.is_empty() && name != self.export {
            return Err(NbdError::invalid(format!("no export named {name:?}")));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(!readonly)
            .open(&self.path)?;
        Ok(Box::new(FileHandle { file }))
    }

    fn get_size(&self, handle: HandleRef) -> OpResult<u64> {
        let h = self.handle(handle)?;
        let meta = h.file.metadata()?;
        Ok(meta.len())
    }

    fn can_write(&self, _handle: HandleRef) -> OpResult<bool> {
        Ok(true)
    }

    fn can_flush(&self, _handle: HandleRef) -> OpResult<bool> {
        Ok(true)
    }

    // all connections write through the same page cache, so a flush on any
    // of them covers the others
    fn can_multi_conn(&self, _handle: HandleRef) -> OpResult<bool> {
        Ok(true)
    }

    fn pread(
        &self,
        handle: HandleRef,
        buf: &mut [u8],
        offset: u64,
        _flags: OpFlags,
    ) -> OpResult<()> {
        let h = self.handle(handle)?;
        h.file.read_exact_at(buf, offset).map_err(|err| {
            warn!(target: "nbd", "file read at {offset} failed: {err}");
            NbdError::from(err)
        })
    }

    fn pwrite(&self, handle: HandleRef, buf: &[u8], offset: u64, _flags: OpFlags) -> OpResult<()> {
        let h = self.handle(handle)?;
        h.file.write_all_at(buf, offset).map_err(|err| {
            warn!(target: "nbd", "file write at {offset} failed: {err}");
            NbdError::from(err)
        })
    }

    fn flush(&self, handle: HandleRef, _flags: OpFlags) -> OpResult<()> {
        let h = self.handle(handle)?;
        h.file.sync_data()?;
        Ok(())
    }
}
