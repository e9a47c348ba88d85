//! NBD wire protocol constants and frame definitions.
//!
//! See <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md> for
//! the protocol description. All multi-byte fields are big-endian.

#![deny(missing_docs)]
#![allow(clippy::upper_case_acronyms)]
#![allow(non_camel_case_types)]
use color_eyre::eyre::{bail, ensure, WrapErr};
use color_eyre::Result;
use std::error::Error;
use std::fmt;
use std::io::{self, prelude::*, ErrorKind};

use bitflags::bitflags;
use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use log::warn;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Default NBD port.
pub const TCP_PORT: u16 = 10809;

/// Initial handshake magic, b"NBDMAGIC".
pub const MAGIC: u64 = 0x4e42444d41474943;
/// Newstyle version tag, b"IHAVEOPT"; doubles as the client option magic.
pub const IHAVEOPT: u64 = 0x49484156454F5054;
/// Version tag sent in the oldstyle handshake.
pub const OLD_VERSION: u64 = 0x420281861253;
/// Magic prefixing every fixed-newstyle option reply.
pub const REPLY_MAGIC: u64 = 0x3e889045565a9;

// transmission constants
/// Magic prefixing every client request.
pub const REQUEST_MAGIC: u32 = 0x25609513;
/// Magic prefixing a simple (untyped) reply.
pub const SIMPLE_REPLY_MAGIC: u32 = 0x67446698;
/// Magic prefixing every structured reply chunk.
pub const STRUCTURED_REPLY_MAGIC: u32 = 0x668e33ef;

/// Upper bound on a single request payload; larger writes are refused and the
/// connection dropped.
pub const MAX_REQUEST_SIZE: u32 = 64 * 1024 * 1024;
/// Upper bound on option data during the handshake.
pub const MAX_OPTION_LEN: u32 = 65536;
/// Longest export name the server accepts.
pub const MAX_EXPORT_NAME_LEN: usize = 4096;

/// A violation of the wire protocol by the peer. The connection is closed
/// without a reply when one of these surfaces.
#[derive(Debug, Clone)]
pub struct ProtocolError(String);

impl ProtocolError {
    /// Wrap a description of the violation.
    pub fn new<S: AsRef<str>>(s: S) -> Self {
        ProtocolError(s.as_ref().to_string())
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "nbd protocol error: {}", self.0)?;
        Ok(())
    }
}

impl Error for ProtocolError {}

bitflags! {
  /// Global flags sent by the server in the newstyle greeting.
  pub struct HandshakeFlags: u16 {
    /// Server supports fixed-newstyle option replies.
    const FIXED_NEWSTYLE = 0b01;
    /// Server may omit the 124 reserved zero bytes after `EXPORT_NAME`.
    const NO_ZEROES = 0b10;
  }

  /// Global flags echoed back by the client.
  pub struct ClientHandshakeFlags: u32 {
    /// Client understands fixed newstyle.
    const C_FIXED_NEWSTYLE = 0b01;
    /// Client asks the server to skip the reserved zero bytes.
    const C_NO_ZEROES = 0b10;
  }

  /// Per-export transmission flags advertised at handshake termination.
  pub struct TransmitFlags: u16 {
    /// Always set; the remaining bits are meaningful.
    const HAS_FLAGS = 1 << 0;
    /// Export is read-only.
    const READ_ONLY = 1 << 1;
    /// `FLUSH` is supported.
    const SEND_FLUSH = 1 << 2;
    /// The FUA command flag is supported.
    const SEND_FUA = 1 << 3;
    /// Export is backed by rotational media.
    const ROTATIONAL = 1 << 4;
    /// `TRIM` is supported.
    const SEND_TRIM = 1 << 5;
    /// `WRITE_ZEROES` is supported.
    const SEND_WRITE_ZEROES = 1 << 6;
    /// Reads will not be fragmented into multiple chunks.
    const SEND_DF = 1 << 7;
    /// Multiple connections to this export see a consistent view.
    const CAN_MULTI_CONN = 1 << 8;
    /// `RESIZE` extension.
    const SEND_RESIZE = 1 << 9;
    /// `CACHE` is supported.
    const SEND_CACHE = 1 << 10;
    /// The fast-zero command flag is supported.
    const SEND_FAST_ZERO = 1 << 11;
  }
}

/// Handshake option codes sent by the client.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum OptType {
    /// Terminate the handshake with a named export (no error channel).
    EXPORT_NAME = 1,
    /// Client gives up; close the connection.
    ABORT = 2,
    /// List the server's exports.
    LIST = 3,
    /// Unused historical option.
    PEEK_EXPORT = 4,
    /// Upgrade the connection to TLS.
    STARTTLS = 5,
    /// Query an export without terminating the handshake.
    INFO = 6,
    /// Like `INFO`, but terminate the handshake on success.
    GO = 7,
    /// Enable structured replies for the transmission phase.
    STRUCTURED_REPLY = 8,
}

/// Information request codes carried inside `INFO`/`GO` options.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum InfoType {
    /// Export size and transmission flags (mandatory in every reply set).
    EXPORT = 0,
    /// Canonical name of the export.
    NAME = 1,
    /// Free-form description of the export.
    DESCRIPTION = 2,
    /// Block size constraint triple.
    BLOCK_SIZE = 3,
}

/// Option reply codes.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum ReplyType {
    /// Successful completion of the option.
    ACK = 1,
    /// One export name (reply to `LIST`).
    SERVER = 2,
    /// One information block (reply to `INFO`/`GO`).
    INFO = 3,
    /// Option not known to this server.
    ERR_UNSUP = (1 << 31) + 1,
    /// Option forbidden by server policy.
    ERR_POLICY = (1 << 31) + 2,
    /// Option was malformed.
    ERR_INVALID = (1 << 31) + 3,
    /// Option not supported on this platform.
    ERR_PLATFORM = (1 << 31) + 4,
    /// Option refused until the client upgrades to TLS.
    ERR_TLS_REQD = (1 << 31) + 5,
    /// Requested export does not exist.
    ERR_UNKNOWN = (1 << 31) + 6,
    /// Server is shutting down.
    ERR_SHUTDOWN = (1 << 31) + 7,
    /// Export requires block size negotiation.
    ERR_BLOCK_SIZE_REQD = (1 << 31) + 8,
    /// Option data was too large.
    ERR_TOO_BIG = (1 << 31) + 9,
}

/// Builder for replying to an option
#[must_use]
pub struct OptReply {
    opt: u32,
    reply_type: ReplyType,
    data: Vec<u8>,
}

impl OptReply {
    /// A bare `ACK` for `opt`.
    pub fn ack(opt: OptType) -> Self {
        Self {
            opt: opt.into(),
            reply_type: ReplyType::ACK,
            data: vec![],
        }
    }

    /// A reply of type `reply_type` carrying `data`.
    pub fn new(opt: OptType, reply_type: ReplyType, data: Vec<u8>) -> Self {
        Self {
            opt: opt.into(),
            reply_type,
            data,
        }
    }

    /// An error reply carrying a human-readable message.
    pub fn error(opt: OptType, reply_type: ReplyType, msg: &str) -> Self {
        Self::new(opt, reply_type, msg.as_bytes().to_vec())
    }

    /// An error reply echoing a raw (possibly unrecognized) option code.
    pub fn error_raw(opt: u32, reply_type: ReplyType, msg: &str) -> Self {
        Self {
            opt,
            reply_type,
            data: msg.as_bytes().to_vec(),
        }
    }

    /// Write the reply frame.
    pub fn put<IO: Write>(self, mut stream: IO) -> io::Result<()> {
        // The server will reply to any option apart from NBD_OPT_EXPORT_NAME
        // with reply packets in the following format:
        //
        // S: 64 bits, 0x3e889045565a9 (magic number for replies)
        // S: 32 bits, the option as sent by the client to which this is a reply
        // S: 32 bits, reply type
        // S: 32 bits, length of the reply; MAY be zero
        // S: any data as required by the reply
        stream.write_u64::<BE>(REPLY_MAGIC)?;
        stream.write_u32::<BE>(self.opt)?;
        stream.write_u32::<BE>(self.reply_type.into())?;
        stream.write_u32::<BE>(self.data.len() as u32)?;
        stream.write_all(&self.data)?;
        stream.flush()?;
        Ok(())
    }
}

/// One handshake option as read off the wire. The option code is kept raw so
/// that unknown options get an `ERR_UNSUP` reply instead of dropping the
/// connection.
#[derive(Debug, Clone)]
pub struct Opt {
    /// Raw option code.
    pub code: u32,
    /// Option payload.
    pub data: Vec<u8>,
}

impl Opt {
    /// Parse the recognized option code, if any.
    pub fn typ(&self) -> Option<OptType> {
        OptType::try_from(self.code).ok()
    }

    /// Read one option frame.
    pub fn get<IO: Read>(mut stream: IO) -> Result<Self> {
        // C: 64 bits, 0x49484156454F5054 (ASCII 'IHAVEOPT')
        // C: 32 bits, option
        // C: 32 bits, length of option data (unsigned)
        // C: any data needed for the chosen option, of length as specified above.
        let magic = stream.read_u64::<BE>()?;
        if magic != IHAVEOPT {
            bail!(ProtocolError(format!("unexpected option magic {magic:#x}")));
        }
        let code = stream.read_u32::<BE>()?;
        let option_len = stream.read_u32::<BE>()?;
        ensure!(
            option_len <= MAX_OPTION_LEN,
            ProtocolError(format!("option length {option_len} is too large"))
        );
        let mut data = vec![0u8; option_len as usize];
        stream
            .read_exact(&mut data)
            .wrap_err_with(|| format!("reading option {code} of size {option_len}"))?;
        Ok(Self { code, data })
    }
}

/// An `INFO`/`GO` payload: the export the client is asking about plus the
/// information blocks it wants.
#[derive(Debug, Clone)]
pub struct InfoRequest {
    /// Requested export name.
    pub name: String,
    /// Requested information blocks (unrecognized codes are dropped).
    pub typs: Vec<InfoType>,
}

impl InfoRequest {
    /// Parse an `INFO`/`GO` payload.
    pub fn get<IO: Read>(mut stream: IO) -> Result<Self> {
        let name_len = stream.read_u32::<BE>()?;
        ensure!(
            name_len as usize <= MAX_EXPORT_NAME_LEN,
            ProtocolError(format!("export name of length {name_len} is too long"))
        );
        let mut buf = vec![0; name_len as usize];
        stream.read_exact(&mut buf)?;
        let name = String::from_utf8(buf)
            .wrap_err(ProtocolError::new("invalid UTF-8 in requested export"))?;
        let num_requests = stream.read_u16::<BE>()?;
        let mut typs = vec![];
        for _ in 0..num_requests {
            let typ = stream.read_u16::<BE>()?;
            match InfoType::try_from(typ) {
                Ok(typ) => typs.push(typ),
                // unknown info requests are ignored, not errors
                Err(_) => warn!(target: "nbd", "ignoring unknown info request {typ}"),
            }
        }
        Ok(InfoRequest { name, typs })
    }
}

// -------------------
// Transmission phase
// -------------------

/// Transmission-phase command codes.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum Cmd {
    /// Read `count` bytes at `offset`.
    READ = 0,
    /// Write the payload at `offset`.
    WRITE = 1,
    /// NBD_CMD_DISC: orderly disconnect, no reply.
    DISCONNECT = 2,
    /// Make completed writes durable.
    FLUSH = 3,
    /// Hint that a range is no longer needed.
    TRIM = 4,
    /// Prefetch a range.
    CACHE = 5,
    /// Write zeroes without a payload.
    WRITE_ZEROES = 6,
    /// Query allocation status (structured replies only).
    BLOCK_STATUS = 7,
}

bitflags! {
    /// Per-request command flags.
    pub struct CmdFlags: u16 {
        /// Force unit access: the request must be durable before its reply.
        const FUA = 1 << 0;
        /// On `WRITE_ZEROES`: do not punch a hole.
        const NO_HOLE = 1 << 1;
        /// "don't fragment" (structured reads)
        const DF = 1 << 2;
        /// On `BLOCK_STATUS`: return at most one extent.
        const REQ_ONE = 1 << 3;
        /// On `WRITE_ZEROES`: fail with `ENOTSUP` rather than fall back to
        /// slow emulation.
        const FAST_ZERO = 1 << 4;
    }
}

/// A request header as read off the wire, before interpretation. Flags and
/// type are kept raw: unrecognized values get an error *reply* with the
/// client's cookie echoed back, not a dropped connection.
#[derive(Clone, Copy)]
pub struct RequestHeader {
    /// Raw command flags.
    pub flags: u16,
    /// Raw command type.
    pub typ: u16,
    /// Opaque client identifier, echoed in the reply.
    pub cookie: u64,
    /// Byte offset of the request.
    pub offset: u64,
    /// Byte count of the request.
    pub count: u32,
}

impl fmt::Debug for RequestHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = &mut f.debug_struct("Request");
        if self.flags != 0 {
            f = f.field("flags", &self.flags);
        }
        match self.cmd() {
            Some(cmd) => f = f.field("typ", &cmd),
            None => f = f.field("typ", &self.typ),
        }
        if self.count != 0 {
            f = f.field("offset", &self.offset).field("count", &self.count);
        }
        f.finish_non_exhaustive()
    }
}

impl RequestHeader {
    /// Parse the recognized command, if any.
    pub fn cmd(&self) -> Option<Cmd> {
        Cmd::try_from(self.typ).ok()
    }

    /// Parse the command flags, unless unknown bits are set.
    pub fn cmd_flags(&self) -> Option<CmdFlags> {
        CmdFlags::from_bits(self.flags)
    }

    /// Read one 28-byte request header.
    pub fn get<IO: Read>(mut stream: IO) -> Result<Self> {
        // C: 32 bits, 0x25609513, magic (NBD_REQUEST_MAGIC)
        // C: 16 bits, command flags
        // C: 16 bits, type
        // C: 64 bits, cookie
        // C: 64 bits, offset (unsigned)
        // C: 32 bits, length (unsigned)
        // C: (length bytes of data if the request is of type NBD_CMD_WRITE)
        let magic = stream.read_u32::<BE>()?;
        if magic != REQUEST_MAGIC {
            bail!(ProtocolError(format!("wrong request magic {magic:#x}")));
        }
        let flags = stream.read_u16::<BE>()?;
        let typ = stream.read_u16::<BE>()?;
        let cookie = stream.read_u64::<BE>()?;
        let offset = stream.read_u64::<BE>()?;
        let count = stream.read_u32::<BE>()?;
        Ok(Self {
            flags,
            typ,
            cookie,
            offset,
            count,
        })
    }
}

/// NBD error numbers used on the wire.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorType {
    /// Success.
    OK = 0,
    /// Operation not permitted (e.g. write to a read-only export).
    EPERM = 1,
    /// Input/output error.
    EIO = 5,
    /// Server ran out of memory.
    ENOMEM = 12,
    /// Request was malformed or out of range.
    EINVAL = 22,
    /// Write beyond end of device.
    ENOSPC = 28,
    /// Payload exceeded the server's limit.
    EOVERFLOW = 75,
    /// Operation not negotiated or not supported.
    ENOTSUP = 95,
    /// Server is shutting down.
    ESHUTDOWN = 108,
}

impl ErrorType {
    /// Map an I/O error kind to the closest NBD error number.
    pub fn from_io_kind(kind: io::ErrorKind) -> Self {
        match kind {
            ErrorKind::PermissionDenied => Self::EPERM,
            ErrorKind::InvalidInput => Self::EINVAL,
            ErrorKind::UnexpectedEof => Self::EOVERFLOW,
            _ => {
                warn!(target: "nbd", "unexpected error kind {kind:?}");
                Self::EIO
            }
        }
    }
}

/// An untyped reply: error code, cookie, then data (for successful reads).
#[derive(Debug)]
#[must_use]
pub struct SimpleReply<'a> {
    err: ErrorType,
    cookie: u64,
    data: &'a [u8],
}

impl<'a> SimpleReply<'a> {
    /// Success carrying read data.
    pub fn data(cookie: u64, data: &'a [u8]) -> Self {
        SimpleReply {
            err: ErrorType::OK,
            cookie,
            data,
        }
    }

    /// Success with no payload.
    pub fn ok(cookie: u64) -> Self {
        Self::data(cookie, &[])
    }

    /// Failure with `err`.
    pub fn err(err: ErrorType, cookie: u64) -> Self {
        SimpleReply {
            err,
            cookie,
            data: &[],
        }
    }

    /// Write the reply frame.
    pub fn put<IO: Write>(self, mut stream: IO) -> io::Result<()> {
        stream.write_u32::<BE>(SIMPLE_REPLY_MAGIC)?;
        stream.write_u32::<BE>(self.err.into())?;
        stream.write_u64::<BE>(self.cookie)?;
        stream.write_all(self.data)?;
        stream.flush()?;
        Ok(())
    }
}

bitflags! {
    /// Structured reply chunk flags.
    pub struct ChunkFlags: u16 {
        /// This is the final chunk of the reply.
        const DONE = 1 << 0;
    }
}

/// Structured reply chunk types.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum ChunkType {
    /// Carries no payload; used for a bare `DONE`.
    NONE = 0,
    /// 8-byte offset followed by data read from that offset.
    OFFSET_DATA = 1,
    /// 8-byte offset plus 4-byte length of a hole.
    OFFSET_HOLE = 2,
    /// Allocation status descriptors for a `BLOCK_STATUS` request.
    BLOCK_STATUS = 3,
    /// Error without an offset.
    ERROR = (1 << 15) + 1,
    /// Error at a specific offset.
    ERROR_OFFSET = (1 << 15) + 2,
}

/// One structured reply chunk. A single request may elicit several chunks;
/// exactly one of them (the last) carries [`ChunkFlags::DONE`].
#[must_use]
pub struct Chunk<'a> {
    flags: ChunkFlags,
    typ: ChunkType,
    cookie: u64,
    /// Fixed fields preceding `data` (e.g. the offset prefix).
    prefix: Vec<u8>,
    data: &'a [u8],
}

impl<'a> Chunk<'a> {
    fn done_flags(done: bool) -> ChunkFlags {
        if done {
            ChunkFlags::DONE
        } else {
            ChunkFlags::empty()
        }
    }

    /// An `OFFSET_DATA` chunk for a (piece of a) successful read.
    pub fn offset_data(cookie: u64, offset: u64, data: &'a [u8], done: bool) -> Self {
        let mut prefix = vec![];
        prefix.extend_from_slice(&offset.to_be_bytes());
        Chunk {
            flags: Self::done_flags(done),
            typ: ChunkType::OFFSET_DATA,
            cookie,
            prefix,
            data,
        }
    }

    /// An `OFFSET_HOLE` chunk describing `length` unallocated bytes.
    pub fn offset_hole(cookie: u64, offset: u64, length: u32, done: bool) -> Self {
        let mut prefix = vec![];
        prefix.extend_from_slice(&offset.to_be_bytes());
        prefix.extend_from_slice(&length.to_be_bytes());
        Chunk {
            flags: Self::done_flags(done),
            typ: ChunkType::OFFSET_HOLE,
            cookie,
            prefix,
            data: &[],
        }
    }

    /// A `BLOCK_STATUS` chunk: metadata context id then (length, flags)
    /// descriptor pairs.
    pub fn block_status(cookie: u64, context_id: u32, descriptors: &[(u32, u32)], done: bool) -> Self {
        let mut prefix = vec![];
        prefix.extend_from_slice(&context_id.to_be_bytes());
        for &(length, flags) in descriptors {
            prefix.extend_from_slice(&length.to_be_bytes());
            prefix.extend_from_slice(&flags.to_be_bytes());
        }
        Chunk {
            flags: Self::done_flags(done),
            typ: ChunkType::BLOCK_STATUS,
            cookie,
            prefix,
            data: &[],
        }
    }

    /// A terminal `ERROR` chunk carrying a human-readable message.
    pub fn error(cookie: u64, err: ErrorType, msg: &str) -> Self {
        let mut prefix = vec![];
        prefix.extend_from_slice(&u32::from(err).to_be_bytes());
        prefix.extend_from_slice(&(msg.len() as u16).to_be_bytes());
        prefix.extend_from_slice(msg.as_bytes());
        Chunk {
            flags: ChunkFlags::DONE,
            typ: ChunkType::ERROR,
            cookie,
            prefix,
            data: &[],
        }
    }

    /// Write the chunk frame.
    pub fn put<IO: Write>(self, mut stream: IO) -> io::Result<()> {
        // S: 32 bits, 0x668e33ef, magic (NBD_STRUCTURED_REPLY_MAGIC)
        // S: 16 bits, flags
        // S: 16 bits, type
        // S: 64 bits, cookie
        // S: 32 bits, length of payload
        // S: length bytes of payload
        stream.write_u32::<BE>(STRUCTURED_REPLY_MAGIC)?;
        stream.write_u16::<BE>(self.flags.bits())?;
        stream.write_u16::<BE>(self.typ.into())?;
        stream.write_u64::<BE>(self.cookie)?;
        stream.write_u32::<BE>((self.prefix.len() + self.data.len()) as u32)?;
        stream.write_all(&self.prefix)?;
        stream.write_all(self.data)?;
        stream.flush()?;
        Ok(())
    }
}
