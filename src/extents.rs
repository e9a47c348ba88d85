//! Accumulators passed down the stack during `extents` and `list_exports`
//! calls.

use bitflags::bitflags;

use crate::backend::{NbdError, OpResult};
use crate::proto::MAX_EXPORT_NAME_LEN;

bitflags! {
    /// Allocation status of one extent.
    pub struct ExtentFlags: u32 {
        /// The range is a hole (unallocated).
        const HOLE = 1 << 0;
        /// The range reads as zeroes.
        const ZERO = 1 << 1;
    }
}

/// One contiguous range with uniform allocation status.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Extent {
    /// Byte offset of the range.
    pub offset: u64,
    /// Length of the range in bytes.
    pub length: u64,
    /// Allocation status bits.
    pub flags: ExtentFlags,
}

/// Append-only extent list built up while an `extents` call descends the
/// stack.
///
/// The accumulator maintains the reply invariants itself, whatever the
/// layers feed it: the first extent starts at the requested offset, extents
/// are contiguous (gaps are filled with allocated-data ranges), nothing
/// extends past the requested range, and adjacent ranges with equal status
/// are merged.
#[derive(Debug)]
pub struct Extents {
    start: u64,
    end: u64,
    extents: Vec<Extent>,
}

impl Extents {
    /// An empty accumulator for a request covering
    /// `offset..offset + count`.
    pub fn new(offset: u64, count: u32) -> Self {
        Extents {
            start: offset,
            end: offset + count as u64,
            extents: vec![],
        }
    }

    /// Offset one past the last accumulated byte.
    fn next_offset(&self) -> u64 {
        match self.extents.last() {
            Some(e) => e.offset + e.length,
            None => self.start,
        }
    }

    /// Whether the accumulator already covers the whole requested range.
    pub fn is_complete(&self) -> bool {
        self.next_offset() >= self.end
    }

    /// Append a range with the given status.
    ///
    /// Ranges must be added in ascending order; a range wholly before what
    /// has already been covered is ignored, a partial overlap is clamped,
    /// and a gap below `offset` is filled with an allocated-data range.
    /// Anything past the requested range is discarded.
    pub fn add(&mut self, offset: u64, length: u64, flags: ExtentFlags) -> OpResult<()> {
        let next = self.next_offset();
        let end = offset
            .checked_add(length)
            .ok_or_else(|| NbdError::invalid("extent wraps the offset space"))?;
        // clip to the requested range
        let end = end.min(self.end);
        if end <= next {
            return Ok(());
        }
        let offset = offset.max(next);
        if offset > next {
            // fill the gap with allocated data
            self.push(Extent {
                offset: next,
                length: offset - next,
                flags: ExtentFlags::empty(),
            });
        }
        self.push(Extent {
            offset,
            length: end - offset,
            flags,
        });
        Ok(())
    }

    fn push(&mut self, e: Extent) {
        if let Some(last) = self.extents.last_mut() {
            if last.flags == e.flags {
                last.length += e.length;
                return;
            }
        }
        self.extents.push(e);
    }

    /// Drop everything but the first extent (`REQ_ONE` semantics).
    pub fn truncate_to_one(&mut self) {
        self.extents.truncate(1);
    }

    /// Throw away all accumulated extents, keeping the requested range.
    /// Used before a retry or an inner sub-call.
    pub fn reset(&mut self) {
        self.extents.clear();
    }

    /// The accumulated extents.
    pub fn as_slice(&self) -> &[Extent] {
        &self.extents
    }

    /// Render as `(length, status-bits)` descriptor pairs for a
    /// `BLOCK_STATUS` chunk.
    pub fn descriptors(&self) -> Vec<(u32, u32)> {
        self.extents
            .iter()
            .map(|e| (e.length.min(u32::MAX as u64) as u32, e.flags.bits()))
            .collect()
    }
}

/// One advertised export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportInfo {
    /// Name the client passes to select this export.
    pub name: String,
    /// Optional free-form description.
    pub description: Option<String>,
}

/// Ordered collection built up while a `list_exports` call descends the
/// stack.
#[derive(Debug, Default)]
pub struct Exports {
    exports: Vec<ExportInfo>,
}

impl Exports {
    /// An empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one export.
    pub fn add(&mut self, name: &str, description: Option<&str>) -> OpResult<()> {
        if name.len() > MAX_EXPORT_NAME_LEN {
            return Err(NbdError::invalid(format!(
                "export name of length {} is too long",
                name.len()
            )));
        }
        self.exports.push(ExportInfo {
            name: name.to_string(),
            description: description.map(str::to_string),
        });
        Ok(())
    }

    /// Drop all accumulated exports. Filters that rewrite the export list
    /// call this before adding their own.
    pub fn reset(&mut self) {
        self.exports.clear();
    }

    /// The accumulated exports.
    pub fn as_slice(&self) -> &[ExportInfo] {
        &self.exports
    }
}
