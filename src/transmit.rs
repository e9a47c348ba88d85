//! The request loop: parse requests, enforce bounds, dispatch into the
//! backend stack, and frame replies (simple or structured).
//!
//! One connection runs one or more copies of [`run_loop`], each on its own
//! worker thread; the connection's transport locks keep header parsing and
//! reply framing atomic. The loop also owns the engine-side emulations:
//! zeroing through `pwrite`, forced unit access through write-then-flush,
//! and cache through a throwaway read.

use std::io::{self, ErrorKind, Read};
use std::sync::Mutex;

use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use log::{debug, warn};

use crate::backend::{CacheMode, Control, FuaMode, NbdError, OpFlags, OpResult, ThreadModel};
use crate::caps::Caps;
use crate::conn::Connection;
use crate::extents::{ExtentFlags, Extents};
use crate::proto::*;
use crate::stack::Stack;

/// Chunk size for the zero-emulation and cache-emulation loops.
const EMULATION_CHUNK: usize = 1024 * 1024;

/// Metadata context id used in `BLOCK_STATUS` chunks (base:allocation).
const BASE_ALLOCATION_ID: u32 = 0;

/// Everything one worker needs besides the connection itself.
pub struct TransmitCtx<'a> {
    /// The process-wide backend stack.
    pub stack: &'a Stack,
    /// Shutdown flag shared with the layers.
    pub ctl: &'a Control,
    /// Effective thread model for this connection.
    pub model: ThreadModel,
    /// Held across dispatch under `SerializeAllRequests` and stricter.
    pub all_requests: &'a Mutex<()>,
}

/// A fully parsed and interpreted request.
struct Request {
    cmd: Cmd,
    flags: CmdFlags,
    cookie: u64,
    offset: u64,
    count: u32,
}

/// What `read_request` decided about the bytes it saw.
enum Incoming {
    /// A well-formed request (payload, if any, is in the worker's buffer).
    Req(Request),
    /// Reply with this error and keep serving.
    Bad { cookie: u64, errno: ErrorType },
    /// The client went away between requests.
    Eof,
}

/// Serve requests until the client disconnects, the transport fails, or
/// shutdown is requested. Returns `Ok` for orderly ends.
pub fn run_loop(ctx: &TransmitCtx, conn: &Connection) -> Result<()> {
    let mut payload = Vec::new();
    loop {
        if ctx.ctl.is_shutdown() || conn.disconnect_requested() {
            return Ok(());
        }
        let incoming = {
            let mut r = conn.io.reader();
            read_request(&mut **r, conn, &mut payload)?
        };
        let req = match incoming {
            Incoming::Req(req) => req,
            Incoming::Bad { cookie, errno } => {
                reply_err(conn, cookie, NbdError::new(errno, "malformed request"), false)?;
                continue;
            }
            Incoming::Eof => {
                debug!(target: "nbd", "conn {}: client closed the socket", conn.id);
                return Ok(());
            }
        };
        let seq = conn.next_seq();
        debug!(
            target: "nbd",
            "conn {}: request {} {:?} cookie {:#x}", conn.id, seq, req.cmd, req.cookie
        );
        if req.cmd == Cmd::DISCONNECT {
            // no reply: the client is not listening anymore
            debug!(target: "nbd", "conn {}: orderly disconnect", conn.id);
            return Ok(());
        }
        {
            let _global = (ctx.model >= ThreadModel::SerializeAllRequests)
                .then(|| ctx.all_requests.lock().unwrap_or_else(|e| e.into_inner()));
            handle_request(ctx, conn, &req, &payload)?;
        }
    }
}

/// Read one request header (and payload for writes) off the wire, applying
/// the checks that must happen before dispatch is even considered.
fn read_request(
    stream: &mut (dyn Read + Send),
    conn: &Connection,
    payload: &mut Vec<u8>,
) -> Result<Incoming> {
    let header = match RequestHeader::get(&mut *stream) {
        Ok(header) => header,
        Err(err) => {
            // EOF on a request boundary is a silent client disconnect, not
            // a protocol violation
            if let Some(ioe) = err.downcast_ref::<io::Error>() {
                if ioe.kind() == ErrorKind::UnexpectedEof {
                    return Ok(Incoming::Eof);
                }
            }
            return Err(err);
        }
    };
    payload.clear();

    let cmd = match header.cmd() {
        Some(cmd) => cmd,
        None => {
            warn!(target: "nbd", "conn {}: unknown command {}", conn.id, header.typ);
            return Ok(Incoming::Bad {
                cookie: header.cookie,
                errno: ErrorType::EINVAL,
            });
        }
    };

    if cmd == Cmd::WRITE && header.count > 0 {
        if header.count > MAX_REQUEST_SIZE {
            // refuse to buffer this much; the payload is unread so the
            // stream cannot be resynchronized afterwards
            reply_err(
                conn,
                header.cookie,
                NbdError::new(ErrorType::EOVERFLOW, "write payload exceeds server limit"),
                false,
            )?;
            return Err(ProtocolError::new(format!(
                "oversized write of {} bytes",
                header.count
            ))
            .into());
        }
        payload.resize(header.count as usize, 0);
        stream
            .read_exact(payload)
            .wrap_err_with(|| format!("reading write payload of {} bytes", header.count))?;
    }

    let flags = match header.cmd_flags() {
        Some(flags) => flags,
        None => {
            warn!(target: "nbd", "conn {}: unknown command flags {:#x}", conn.id, header.flags);
            return Ok(Incoming::Bad {
                cookie: header.cookie,
                errno: ErrorType::EINVAL,
            });
        }
    };

    Ok(Incoming::Req(Request {
        cmd,
        flags,
        cookie: header.cookie,
        offset: header.offset,
        count: header.count,
    }))
}

/// The command flags each command accepts.
fn allowed_flags(cmd: Cmd, structured: bool) -> CmdFlags {
    match cmd {
        Cmd::READ => {
            if structured {
                CmdFlags::DF
            } else {
                CmdFlags::empty()
            }
        }
        Cmd::WRITE | Cmd::TRIM => CmdFlags::FUA,
        Cmd::WRITE_ZEROES => CmdFlags::FUA | CmdFlags::NO_HOLE | CmdFlags::FAST_ZERO,
        Cmd::BLOCK_STATUS => CmdFlags::REQ_ONE,
        Cmd::DISCONNECT | Cmd::FLUSH | Cmd::CACHE => CmdFlags::empty(),
    }
}

/// Pre-dispatch validation, in precedence order. `Err` is the error number
/// to put on the wire; the backend is not called at all in that case.
fn validate(conn: &Connection, caps: &Caps, req: &Request) -> std::result::Result<(), ErrorType> {
    if !allowed_flags(req.cmd, conn.structured).contains(req.flags) {
        return Err(ErrorType::EINVAL);
    }
    let is_write = matches!(req.cmd, Cmd::WRITE | Cmd::WRITE_ZEROES | Cmd::TRIM);
    if is_write && !caps.writable {
        return Err(ErrorType::EPERM);
    }
    if req.count == 0 && req.cmd != Cmd::FLUSH {
        return Err(ErrorType::EINVAL);
    }
    if req.cmd != Cmd::FLUSH {
        if req.count > caps.block_size.maximum {
            return Err(ErrorType::EINVAL);
        }
        let in_range = req
            .offset
            .checked_add(req.count as u64)
            .map_or(false, |end| end <= caps.size);
        if !in_range {
            return Err(if is_write {
                ErrorType::ENOSPC
            } else {
                ErrorType::EINVAL
            });
        }
    }
    if req.flags.contains(CmdFlags::FAST_ZERO) && !caps.can_fast_zero {
        return Err(ErrorType::ENOTSUP);
    }
    if req.flags.contains(CmdFlags::FUA) && caps.fua == FuaMode::None {
        return Err(ErrorType::EINVAL);
    }
    match req.cmd {
        Cmd::FLUSH if !caps.can_flush => Err(ErrorType::EINVAL),
        Cmd::CACHE if caps.cache == CacheMode::None => Err(ErrorType::EINVAL),
        Cmd::BLOCK_STATUS if !conn.structured || !caps.can_extents => Err(ErrorType::EINVAL),
        _ => Ok(()),
    }
}

/// Validate, dispatch, and emit exactly one reply for `req`.
fn handle_request(
    ctx: &TransmitCtx,
    conn: &Connection,
    req: &Request,
    payload: &[u8],
) -> Result<()> {
    let caps = conn.caps();
    if let Err(errno) = validate(conn, caps, req) {
        debug!(
            target: "nbd",
            "conn {}: {:?} cookie {:#x} rejected with {:?}", conn.id, req.cmd, req.cookie, errno
        );
        return reply_err(
            conn,
            req.cookie,
            NbdError::new(errno, "request validation failed"),
            req.cmd == Cmd::READ || req.cmd == Cmd::BLOCK_STATUS,
        );
    }

    // the FUA level decides whether the flag is passed down or emulated
    // with a follow-up flush
    let wants_fua = req.flags.contains(CmdFlags::FUA);
    let mut flags = OpFlags::empty();
    if wants_fua && caps.fua == FuaMode::Native {
        flags |= OpFlags::FUA;
    }
    let emulate_fua = wants_fua && caps.fua == FuaMode::Emulate;

    let top = ctx.stack.top(&conn.chain);
    match req.cmd {
        Cmd::READ => {
            let mut buf = vec![0u8; req.count as usize];
            match top.pread(&mut buf, req.offset, flags) {
                Ok(()) => {
                    let mut w = conn.io.writer();
                    if conn.structured {
                        Chunk::offset_data(req.cookie, req.offset, &buf, true).put(&mut **w)?;
                    } else {
                        SimpleReply::data(req.cookie, &buf).put(&mut **w)?;
                    }
                    Ok(())
                }
                Err(err) => reply_op_err(conn, req, err),
            }
        }

        Cmd::WRITE => {
            let mut result = top.pwrite(payload, req.offset, flags);
            if result.is_ok() && emulate_fua {
                result = top.flush(OpFlags::empty());
            }
            finish_simple(conn, req, result)
        }

        Cmd::WRITE_ZEROES => {
            if !req.flags.contains(CmdFlags::NO_HOLE) {
                flags |= OpFlags::MAY_TRIM;
            }
            if req.flags.contains(CmdFlags::FAST_ZERO) {
                flags |= OpFlags::FAST_ZERO;
            }
            let mut result = if caps.zero_native {
                match top.zero(req.count, req.offset, flags) {
                    // a layer may still say "not supported"; fall back to
                    // writing zeroes unless the client demanded fast-zero
                    Err(err)
                        if err.errno() == ErrorType::ENOTSUP
                            && !req.flags.contains(CmdFlags::FAST_ZERO) =>
                    {
                        emulate_zero(&top, req.count, req.offset, flags)
                    }
                    other => other,
                }
            } else {
                emulate_zero(&top, req.count, req.offset, flags)
            };
            if result.is_ok() && emulate_fua {
                result = top.flush(OpFlags::empty());
            }
            finish_simple(conn, req, result)
        }

        Cmd::TRIM => {
            let mut result = top.trim(req.count, req.offset, flags);
            if result.is_ok() && emulate_fua {
                result = top.flush(OpFlags::empty());
            }
            finish_simple(conn, req, result)
        }

        Cmd::FLUSH => {
            let result = top.flush(OpFlags::empty());
            finish_simple(conn, req, result)
        }

        Cmd::CACHE => {
            let result = match caps.cache {
                CacheMode::Native => top.cache(req.count, req.offset, flags),
                CacheMode::Emulate => emulate_cache(&top, req.count, req.offset),
                CacheMode::None => unreachable!("validated above"),
            };
            finish_simple(conn, req, result)
        }

        Cmd::BLOCK_STATUS => {
            if req.flags.contains(CmdFlags::REQ_ONE) {
                flags |= OpFlags::REQ_ONE;
            }
            let mut extents = Extents::new(req.offset, req.count);
            match top.extents(req.count, req.offset, flags, &mut extents) {
                Ok(()) => {
                    if extents.as_slice().is_empty() {
                        // a reply must cover at least one extent; an empty
                        // accumulator means allocated data
                        extents.add(req.offset, req.count as u64, ExtentFlags::empty())?;
                    }
                    if req.flags.contains(CmdFlags::REQ_ONE) {
                        extents.truncate_to_one();
                    }
                    let mut w = conn.io.writer();
                    Chunk::block_status(
                        req.cookie,
                        BASE_ALLOCATION_ID,
                        &extents.descriptors(),
                        true,
                    )
                    .put(&mut **w)?;
                    Ok(())
                }
                Err(err) => reply_op_err(conn, req, err),
            }
        }

        Cmd::DISCONNECT => unreachable!("handled by the loop"),
    }
}

/// Write zeroes through `pwrite` in bounded chunks. Used when the chain has
/// no native `zero` (or refused it) on a writable connection.
fn emulate_zero(top: &crate::stack::Next, count: u32, offset: u64, flags: OpFlags) -> OpResult<()> {
    // MAY_TRIM/FAST_ZERO mean nothing to pwrite
    let flags = flags & OpFlags::FUA;
    let buf = vec![0u8; (count as usize).min(EMULATION_CHUNK)];
    let mut offset = offset;
    let mut remaining = count as usize;
    while remaining > 0 {
        let n = remaining.min(buf.len());
        top.pwrite(&buf[..n], offset, flags)?;
        offset += n as u64;
        remaining -= n;
    }
    Ok(())
}

/// Drive a cache request through `pread` into a throwaway buffer.
fn emulate_cache(top: &crate::stack::Next, count: u32, offset: u64) -> OpResult<()> {
    let mut buf = vec![0u8; (count as usize).min(EMULATION_CHUNK)];
    let mut offset = offset;
    let mut remaining = count as usize;
    while remaining > 0 {
        let n = remaining.min(buf.len());
        top.pread(&mut buf[..n], offset, OpFlags::empty())?;
        offset += n as u64;
        remaining -= n;
    }
    Ok(())
}

/// Emit the success-or-error reply for a command with no response payload.
fn finish_simple(conn: &Connection, req: &Request, result: OpResult<()>) -> Result<()> {
    match result {
        Ok(()) => {
            let mut w = conn.io.writer();
            SimpleReply::ok(req.cookie).put(&mut **w)?;
            Ok(())
        }
        Err(err) => reply_op_err(conn, req, err),
    }
}

/// Emit an error reply for a failed backend call, in the framing the
/// command used. A downstream `ESHUTDOWN` additionally winds the
/// connection down once the reply is out.
fn reply_op_err(conn: &Connection, req: &Request, err: NbdError) -> Result<()> {
    warn!(
        target: "nbd",
        "conn {}: {:?} cookie {:#x} failed: {err}", conn.id, req.cmd, req.cookie
    );
    let structured = req.cmd == Cmd::READ || req.cmd == Cmd::BLOCK_STATUS;
    let errno = err.errno();
    reply_err(conn, req.cookie, err, structured)?;
    if errno == ErrorType::ESHUTDOWN {
        conn.request_disconnect();
    }
    Ok(())
}

/// Frame one error reply for `cookie`.
fn reply_err(conn: &Connection, cookie: u64, err: NbdError, structured: bool) -> Result<()> {
    let mut w = conn.io.writer();
    if conn.structured && structured {
        Chunk::error(cookie, err.errno(), &err.to_string()).put(&mut **w)?;
    } else {
        SimpleReply::err(err.errno(), cookie).put(&mut **w)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Handle, HandleRef, Plugin};
    use crate::conn::ConnIo;
    use crate::stack::Stack;
    use byteorder::{ReadBytesExt, WriteBytesExt, BE};
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    /// Records the data calls reaching the plugin, for asserting emulation
    /// sequences.
    #[derive(Clone, Default)]
    struct CallLog(Arc<Mutex<Vec<String>>>);

    impl CallLog {
        fn push(&self, s: String) {
            self.0.lock().unwrap().push(s);
        }

        fn take(&self) -> Vec<String> {
            std::mem::take(&mut self.0.lock().unwrap())
        }
    }

    struct RecordingPlugin {
        log: CallLog,
        size: u64,
        native_zero: bool,
    }

    impl Plugin for RecordingPlugin {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn open(&self, _readonly: bool, _name: &str, _is_tls: bool) -> OpResult<Handle> {
            Ok(Box::new(()))
        }

        fn get_size(&self, _h: HandleRef) -> OpResult<u64> {
            Ok(self.size)
        }

        fn can_write(&self, _h: HandleRef) -> OpResult<bool> {
            Ok(true)
        }

        fn can_flush(&self, _h: HandleRef) -> OpResult<bool> {
            Ok(true)
        }

        fn can_zero(&self, _h: HandleRef) -> OpResult<bool> {
            Ok(self.native_zero)
        }

        fn pread(&self, _h: HandleRef, buf: &mut [u8], _o: u64, _f: OpFlags) -> OpResult<()> {
            buf.fill(0);
            Ok(())
        }

        fn pwrite(&self, _h: HandleRef, buf: &[u8], offset: u64, flags: OpFlags) -> OpResult<()> {
            self.log.push(format!(
                "pwrite len={} off={offset} fua={}",
                buf.len(),
                flags.contains(OpFlags::FUA)
            ));
            Ok(())
        }

        fn zero(&self, _h: HandleRef, count: u32, offset: u64, _f: OpFlags) -> OpResult<()> {
            self.log.push(format!("zero len={count} off={offset}"));
            Err(NbdError::not_supported("zero"))
        }

        fn flush(&self, _h: HandleRef, _f: OpFlags) -> OpResult<()> {
            self.log.push("flush".to_string());
            Ok(())
        }
    }

    /// A negotiated connection over in-process pipes, plus the client's
    /// transport halves.
    fn pipe_connection(stack: &Stack) -> (Connection, pipe::PipeWriter, pipe::PipeReader) {
        let (server_r, client_w) = pipe::pipe();
        let (client_r, server_w) = pipe::pipe();
        let io = ConnIo::from_parts(Box::new(server_r), Box::new(server_w));
        let mut conn = Connection::with_io(7, io, "test".to_string(), stack, false);
        stack.open_chain(&conn.chain, false, "", false).unwrap();
        conn.caps = Some(Caps::resolve(&stack.top(&conn.chain), false).unwrap());
        (conn, client_w, client_r)
    }

    fn send_request(
        w: &mut impl Write,
        flags: CmdFlags,
        cmd: Cmd,
        cookie: u64,
        offset: u64,
        count: u32,
        payload: &[u8],
    ) {
        w.write_u32::<BE>(REQUEST_MAGIC).unwrap();
        w.write_u16::<BE>(flags.bits()).unwrap();
        w.write_u16::<BE>(cmd.into()).unwrap();
        w.write_u64::<BE>(cookie).unwrap();
        w.write_u64::<BE>(offset).unwrap();
        w.write_u32::<BE>(count).unwrap();
        w.write_all(payload).unwrap();
        w.flush().unwrap();
    }

    fn read_simple_reply(r: &mut impl Read) -> (u32, u64) {
        assert_eq!(r.read_u32::<BE>().unwrap(), SIMPLE_REPLY_MAGIC);
        let err = r.read_u32::<BE>().unwrap();
        let cookie = r.read_u64::<BE>().unwrap();
        (err, cookie)
    }

    fn serve(stack: &Stack, conn: &Connection) {
        let ctl = Control::new();
        let all_requests = Mutex::new(());
        let ctx = TransmitCtx {
            stack,
            ctl: &ctl,
            model: ThreadModel::SerializeRequests,
            all_requests: &all_requests,
        };
        run_loop(&ctx, conn).unwrap();
    }

    #[test]
    fn fua_write_is_emulated_with_a_trailing_flush() {
        let log = CallLog::default();
        let stack = Stack::new(
            vec![],
            Box::new(RecordingPlugin {
                log: log.clone(),
                size: 1 << 16,
                native_zero: false,
            }),
        );
        let (conn, mut w, mut r) = pipe_connection(&stack);
        // plugin has flush but no native FUA, so the engine must emulate
        assert_eq!(conn.caps().fua, FuaMode::Emulate);

        let client = std::thread::spawn(move || {
            send_request(&mut w, CmdFlags::FUA, Cmd::WRITE, 0x11, 1024, 4, &[0x55; 4]);
            let (err, cookie) = read_simple_reply(&mut r);
            assert_eq!(err, 0);
            assert_eq!(cookie, 0x11);
            send_request(&mut w, CmdFlags::empty(), Cmd::DISCONNECT, 0x12, 0, 0, &[]);
        });
        serve(&stack, &conn);
        client.join().unwrap();

        assert_eq!(log.take(), ["pwrite len=4 off=1024 fua=false", "flush"]);
    }

    #[test]
    fn unsupported_zero_falls_back_to_writing_zero_buffers() {
        let log = CallLog::default();
        let stack = Stack::new(
            vec![],
            Box::new(RecordingPlugin {
                log: log.clone(),
                size: 1 << 16,
                native_zero: true,
            }),
        );
        let (conn, mut w, mut r) = pipe_connection(&stack);

        let client = std::thread::spawn(move || {
            send_request(&mut w, CmdFlags::empty(), Cmd::WRITE_ZEROES, 0x21, 512, 1024, &[]);
            let (err, cookie) = read_simple_reply(&mut r);
            assert_eq!(err, 0);
            assert_eq!(cookie, 0x21);
            send_request(&mut w, CmdFlags::empty(), Cmd::DISCONNECT, 0x22, 0, 0, &[]);
        });
        serve(&stack, &conn);
        client.join().unwrap();

        assert_eq!(
            log.take(),
            ["zero len=1024 off=512", "pwrite len=1024 off=512 fua=false"]
        );
    }

    #[test]
    fn out_of_range_requests_never_reach_the_plugin() {
        let log = CallLog::default();
        let stack = Stack::new(
            vec![],
            Box::new(RecordingPlugin {
                log: log.clone(),
                size: 4096,
                native_zero: false,
            }),
        );
        let (conn, mut w, mut r) = pipe_connection(&stack);

        let client = std::thread::spawn(move || {
            // read past the end: EINVAL
            send_request(&mut w, CmdFlags::empty(), Cmd::READ, 0x31, 4095, 2, &[]);
            let (err, cookie) = read_simple_reply(&mut r);
            assert_eq!(err, u32::from(ErrorType::EINVAL));
            assert_eq!(cookie, 0x31);
            // write past the end: ENOSPC, payload still consumed
            send_request(&mut w, CmdFlags::empty(), Cmd::WRITE, 0x32, 4095, 2, &[0; 2]);
            let (err, cookie) = read_simple_reply(&mut r);
            assert_eq!(err, u32::from(ErrorType::ENOSPC));
            assert_eq!(cookie, 0x32);
            // zero-length read: EINVAL
            send_request(&mut w, CmdFlags::empty(), Cmd::READ, 0x33, 0, 0, &[]);
            let (err, _) = read_simple_reply(&mut r);
            assert_eq!(err, u32::from(ErrorType::EINVAL));
            // flush may have count == 0
            send_request(&mut w, CmdFlags::empty(), Cmd::FLUSH, 0x34, 0, 0, &[]);
            let (err, _) = read_simple_reply(&mut r);
            assert_eq!(err, 0);
            send_request(&mut w, CmdFlags::empty(), Cmd::DISCONNECT, 0x35, 0, 0, &[]);
        });
        serve(&stack, &conn);
        client.join().unwrap();

        // only the flush reached the plugin
        assert_eq!(log.take(), ["flush"]);
    }

    #[test]
    fn cache_is_emulated_with_a_throwaway_read() {
        struct EmulatedCache(CallLog);
        impl Plugin for EmulatedCache {
            fn name(&self) -> &'static str {
                "emulated-cache"
            }
            fn open(&self, _r: bool, _n: &str, _t: bool) -> OpResult<Handle> {
                Ok(Box::new(()))
            }
            fn get_size(&self, _h: HandleRef) -> OpResult<u64> {
                Ok(1 << 16)
            }
            fn can_cache(&self, _h: HandleRef) -> OpResult<CacheMode> {
                Ok(CacheMode::Emulate)
            }
            fn pread(&self, _h: HandleRef, buf: &mut [u8], offset: u64, _f: OpFlags) -> OpResult<()> {
                self.0.push(format!("pread len={} off={offset}", buf.len()));
                buf.fill(0);
                Ok(())
            }
        }

        let log = CallLog::default();
        let stack = Stack::new(vec![], Box::new(EmulatedCache(log.clone())));
        let (conn, mut w, mut r) = pipe_connection(&stack);
        assert_eq!(conn.caps().cache, CacheMode::Emulate);

        let client = std::thread::spawn(move || {
            send_request(&mut w, CmdFlags::empty(), Cmd::CACHE, 0x51, 2048, 512, &[]);
            let (err, cookie) = read_simple_reply(&mut r);
            assert_eq!(err, 0);
            assert_eq!(cookie, 0x51);
            send_request(&mut w, CmdFlags::empty(), Cmd::DISCONNECT, 0x52, 0, 0, &[]);
        });
        serve(&stack, &conn);
        client.join().unwrap();

        // the prefetch went through pread; nothing else was called
        assert_eq!(log.take(), ["pread len=512 off=2048"]);
    }

    #[test]
    fn fua_flag_is_passed_through_when_native() {
        struct NativeFua(CallLog);
        impl Plugin for NativeFua {
            fn name(&self) -> &'static str {
                "native-fua"
            }
            fn open(&self, _r: bool, _n: &str, _t: bool) -> OpResult<Handle> {
                Ok(Box::new(()))
            }
            fn get_size(&self, _h: HandleRef) -> OpResult<u64> {
                Ok(1 << 16)
            }
            fn can_write(&self, _h: HandleRef) -> OpResult<bool> {
                Ok(true)
            }
            fn can_fua(&self, _h: HandleRef) -> OpResult<FuaMode> {
                Ok(FuaMode::Native)
            }
            fn pread(&self, _h: HandleRef, buf: &mut [u8], _o: u64, _f: OpFlags) -> OpResult<()> {
                buf.fill(0);
                Ok(())
            }
            fn pwrite(&self, _h: HandleRef, b: &[u8], o: u64, f: OpFlags) -> OpResult<()> {
                self.0.push(format!(
                    "pwrite len={} off={o} fua={}",
                    b.len(),
                    f.contains(OpFlags::FUA)
                ));
                Ok(())
            }
            fn flush(&self, _h: HandleRef, _f: OpFlags) -> OpResult<()> {
                self.0.push("flush".to_string());
                Ok(())
            }
        }

        let log = CallLog::default();
        let stack = Stack::new(vec![], Box::new(NativeFua(log.clone())));
        let (conn, mut w, mut r) = pipe_connection(&stack);
        assert_eq!(conn.caps().fua, FuaMode::Native);

        let client = std::thread::spawn(move || {
            send_request(&mut w, CmdFlags::FUA, Cmd::WRITE, 0x41, 0, 4, &[1; 4]);
            let (err, _) = read_simple_reply(&mut r);
            assert_eq!(err, 0);
            send_request(&mut w, CmdFlags::empty(), Cmd::DISCONNECT, 0x42, 0, 0, &[]);
        });
        serve(&stack, &conn);
        client.join().unwrap();

        // no emulation flush, the flag went straight down
        assert_eq!(log.take(), ["pwrite len=4 off=0 fua=true"]);
    }
}
