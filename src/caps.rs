//! Per-connection capability negotiation.
//!
//! Runs once, right after every layer has opened, by querying the topmost
//! layer (which descends and combines via its defaults). The result is
//! cached on the connection: the request loop consults plain fields, never
//! the stack, so repeated capability checks cost nothing.

use crate::backend::{BlockSize, CacheMode, FuaMode, NbdError, OpResult};
use crate::proto::TransmitFlags;
use crate::stack::Next;

/// Smallest preferred block size the protocol allows.
const MIN_PREFERRED: u32 = 512;
/// Largest preferred block size the protocol allows (32 MiB).
const MAX_PREFERRED: u32 = 32 * 1024 * 1024;
/// Largest minimum block size the protocol allows.
const MAX_MINIMUM: u32 = 65536;

/// The effective feature set of one connection, frozen at negotiation.
#[derive(Debug, Clone)]
pub struct Caps {
    /// Export size in bytes.
    pub size: u64,
    /// Whether this connection may modify the export. False for read-only
    /// connections regardless of what the chain reports.
    pub writable: bool,
    /// Whether `FLUSH` is supported.
    pub can_flush: bool,
    /// Whether the export sits on rotational media.
    pub rotational: bool,
    /// Whether `TRIM` is supported.
    pub can_trim: bool,
    /// Whether the chain zeroes natively. When false on a writable
    /// connection the engine emulates zeroing through `pwrite`.
    pub zero_native: bool,
    /// Whether fast-zero requests can be honored.
    pub can_fast_zero: bool,
    /// Effective FUA level for this connection.
    pub fua: FuaMode,
    /// Effective cache level for this connection.
    pub cache: CacheMode,
    /// Whether several connections may share this export consistently.
    pub multi_conn: bool,
    /// Whether `BLOCK_STATUS` is backed by real allocation data.
    pub can_extents: bool,
    /// Validated block size constraints.
    pub block_size: BlockSize,
    /// Optional human-readable export description.
    pub description: Option<String>,
}

impl Caps {
    /// Query the chain through its topmost layer and reconcile the answers.
    /// `readonly` reflects both server configuration and the client's
    /// request and clamps every write-ish capability.
    pub fn resolve(top: &Next, readonly: bool) -> OpResult<Caps> {
        let size = top.get_size()?;
        let writable = !readonly && top.can_write()?;
        let can_flush = top.can_flush()?;
        let rotational = top.is_rotational()?;
        let can_trim = writable && top.can_trim()?;
        let zero_native = writable && top.can_zero()?;
        let can_fast_zero = writable && top.can_fast_zero()?;

        let fua = if !writable {
            FuaMode::None
        } else {
            match top.can_fua()? {
                // a flush-capable chain gets write-then-flush emulation
                FuaMode::None if can_flush => FuaMode::Emulate,
                mode => mode,
            }
        };

        let cache = top.can_cache()?;
        let multi_conn = top.can_multi_conn()?;
        let can_extents = top.can_extents()?;
        let block_size = top.block_size()?;
        validate_block_size(&block_size)?;
        let description = top.export_description()?;

        Ok(Caps {
            size,
            writable,
            can_flush,
            rotational,
            can_trim,
            zero_native,
            can_fast_zero,
            fua,
            cache,
            multi_conn,
            can_extents,
            block_size,
            description,
        })
    }

    /// Render the capability set as per-export transmission flags.
    /// `structured` is whether structured replies were negotiated (controls
    /// the no-fragmenting bit).
    pub fn export_flags(&self, structured: bool) -> TransmitFlags {
        let mut flags = TransmitFlags::HAS_FLAGS;
        if !self.writable {
            flags |= TransmitFlags::READ_ONLY;
        }
        if self.can_flush {
            flags |= TransmitFlags::SEND_FLUSH;
        }
        if self.writable && self.fua != FuaMode::None {
            flags |= TransmitFlags::SEND_FUA;
        }
        if self.rotational {
            flags |= TransmitFlags::ROTATIONAL;
        }
        if self.can_trim {
            flags |= TransmitFlags::SEND_TRIM;
        }
        // zeroing is always available on a writable connection, natively or
        // through pwrite emulation
        if self.writable {
            flags |= TransmitFlags::SEND_WRITE_ZEROES;
        }
        if structured {
            flags |= TransmitFlags::SEND_DF;
        }
        if self.multi_conn {
            flags |= TransmitFlags::CAN_MULTI_CONN;
        }
        if self.cache != CacheMode::None {
            flags |= TransmitFlags::SEND_CACHE;
        }
        if self.can_fast_zero {
            flags |= TransmitFlags::SEND_FAST_ZERO;
        }
        flags
    }

    /// Whether the block size triple differs from the protocol defaults and
    /// is therefore worth advertising.
    pub fn nondefault_block_size(&self) -> bool {
        self.block_size != BlockSize::default()
    }
}

/// Enforce the block size invariants. A violation is a fatal negotiation
/// error: the connection is refused rather than served with constraints no
/// client could obey.
pub fn validate_block_size(bs: &BlockSize) -> OpResult<()> {
    if bs.minimum == 0 || bs.minimum > MAX_MINIMUM || !bs.minimum.is_power_of_two() {
        return Err(NbdError::invalid(format!(
            "minimum block size {} must be a power of 2 between 1 and {MAX_MINIMUM}",
            bs.minimum
        )));
    }
    if bs.preferred < MIN_PREFERRED
        || bs.preferred > MAX_PREFERRED
        || !bs.preferred.is_power_of_two()
    {
        return Err(NbdError::invalid(format!(
            "preferred block size {} must be a power of 2 between {MIN_PREFERRED} and {MAX_PREFERRED}",
            bs.preferred
        )));
    }
    if bs.minimum > bs.preferred || bs.preferred > bs.maximum {
        return Err(NbdError::invalid(format!(
            "block sizes must be ordered: {} <= {} <= {}",
            bs.minimum, bs.preferred, bs.maximum
        )));
    }
    Ok(())
}
