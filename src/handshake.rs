//! Handshake engine: oldstyle and fixed-newstyle negotiation, option
//! handling, TLS policy enforcement, and export selection.
//!
//! Negotiation ends in one of two ways: the connection transitions to the
//! request loop with an open handle chain and a frozen capability cache, or
//! it closes. `INFO` performs a full trial negotiation and then rolls it
//! back, returning the connection to the option-reading state.

use std::sync::Arc;

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;
use log::{debug, info, warn};
use rustls::ServerConfig;

use crate::caps::Caps;
use crate::conn::{Connection, ProtocolMode};
use crate::proto::*;
use crate::server::Admission;
use crate::stack::Stack;
use crate::tls::{self, TlsMode};

/// What the handshake decided.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Negotiation succeeded; enter the request loop.
    Serve,
    /// The client aborted or was refused; close without serving.
    Closed,
}

/// Everything the handshake needs from the server.
pub struct HandshakeCtx<'a> {
    /// The process-wide backend stack.
    pub stack: &'a Stack,
    /// TLS policy for this server.
    pub tls_mode: TlsMode,
    /// TLS parameters, provided by the caller when TLS is enabled.
    pub tls_config: Option<Arc<ServerConfig>>,
    /// Multi-connection admission registry.
    pub admission: &'a Admission,
}

/// Why a trial negotiation failed, which decides the option reply.
enum NegotiateError {
    /// The export could not be opened (unknown name, backend failure).
    Open(crate::backend::NbdError),
    /// The chain produced an inconsistent capability set; the connection
    /// must be failed rather than served.
    Invariant(crate::backend::NbdError),
    /// Another connection holds the export and it is not multi-conn safe.
    Refused(crate::backend::NbdError),
}

/// Run the configured handshake dialect to completion.
pub fn run(ctx: &HandshakeCtx, conn: &mut Connection) -> Result<Outcome> {
    match conn.mode {
        ProtocolMode::Oldstyle => oldstyle(ctx, conn),
        ProtocolMode::Newstyle => newstyle(ctx, conn),
    }
}

/// Open the chain for `requested` and freeze the capability cache. On
/// success the connection is fully negotiated (and counted in the admission
/// registry if `admit`).
fn negotiate(
    ctx: &HandshakeCtx,
    conn: &mut Connection,
    requested: &str,
    admit: bool,
) -> std::result::Result<(), NegotiateError> {
    let name = if requested.is_empty() {
        ctx.stack
            .top(&conn.chain)
            .default_export(conn.readonly, conn.tls)
            .map_err(NegotiateError::Open)?
    } else {
        requested.to_string()
    };
    ctx.stack
        .open_chain(&conn.chain, conn.readonly, &name, conn.tls)
        .map_err(NegotiateError::Open)?;
    let caps = match Caps::resolve(&ctx.stack.top(&conn.chain), conn.readonly) {
        Ok(caps) => caps,
        Err(err) => {
            ctx.stack.close_chain(&conn.chain);
            return Err(NegotiateError::Invariant(err));
        }
    };
    if admit {
        if let Err(err) = ctx.admission.admit(&name, &caps) {
            ctx.stack.close_chain(&conn.chain);
            return Err(NegotiateError::Refused(err));
        }
    }
    info!(
        target: "nbd",
        "conn {}: negotiated export {:?} ({} bytes, {})",
        conn.id,
        name,
        caps.size,
        if caps.writable { "writable" } else { "read-only" }
    );
    conn.export_name = name;
    conn.caps = Some(caps);
    Ok(())
}

/// Throw away the results of a trial negotiation (`INFO`).
fn rollback(ctx: &HandshakeCtx, conn: &mut Connection) {
    ctx.stack.close_chain(&conn.chain);
    conn.caps = None;
    conn.export_name.clear();
}

/// Legacy handshake: greet, advertise the default export, and go straight
/// to the request loop. Exactly 152 bytes cross the wire.
fn oldstyle(ctx: &HandshakeCtx, conn: &mut Connection) -> Result<Outcome> {
    match negotiate(ctx, conn, "", true) {
        Ok(()) => {}
        Err(NegotiateError::Open(err))
        | Err(NegotiateError::Invariant(err))
        | Err(NegotiateError::Refused(err)) => {
            warn!(target: "nbd", "conn {}: oldstyle negotiation failed: {err}", conn.id);
            return Ok(Outcome::Closed);
        }
    }
    let caps = conn.caps().clone();
    let mut w = conn.io.writer();
    w.write_u64::<BE>(MAGIC)?;
    w.write_u64::<BE>(OLD_VERSION)?;
    w.write_u64::<BE>(caps.size)?;
    // 16 bits of global flags (none apply to oldstyle), 16 bits of export
    // flags, then the reserved block
    w.write_u16::<BE>(0)?;
    w.write_u16::<BE>(caps.export_flags(false).bits())?;
    w.write_all(&[0u8; 124])?;
    w.flush()?;
    Ok(Outcome::Serve)
}

/// Fixed-newstyle handshake: greet, then answer options until one of them
/// terminates the handshake.
fn newstyle(ctx: &HandshakeCtx, conn: &mut Connection) -> Result<Outcome> {
    {
        let mut w = conn.io.writer();
        w.write_u64::<BE>(MAGIC)?;
        w.write_u64::<BE>(IHAVEOPT)?;
        w.write_u16::<BE>((HandshakeFlags::FIXED_NEWSTYLE | HandshakeFlags::NO_ZEROES).bits())?;
        w.flush()?;
    }
    let client_flags = {
        let mut r = conn.io.reader();
        r.read_u32::<BE>()?
    };
    let client_flags = ClientHandshakeFlags::from_bits(client_flags)
        .ok_or_else(|| ProtocolError::new(format!("unexpected client flags {client_flags:#x}")))?;
    if !client_flags.contains(ClientHandshakeFlags::C_FIXED_NEWSTYLE) {
        bail!(ProtocolError::new("client does not support FIXED_NEWSTYLE"));
    }
    conn.no_zeroes = client_flags.contains(ClientHandshakeFlags::C_NO_ZEROES);

    loop {
        let opt = {
            let mut r = conn.io.reader();
            Opt::get(&mut **r).wrap_err("reading handshake option")?
        };
        let typ = match opt.typ() {
            Some(typ) => typ,
            None => {
                debug!(target: "nbd", "conn {}: unknown option {}", conn.id, opt.code);
                let mut w = conn.io.writer();
                OptReply::error_raw(opt.code, ReplyType::ERR_UNSUP, "unknown option")
                    .put(&mut **w)?;
                continue;
            }
        };
        debug!(target: "nbd", "conn {}: option {:?}", conn.id, typ);

        // TLS-required mode refuses anything that would touch or leak
        // export data before the upgrade
        if ctx.tls_mode == TlsMode::Required
            && !conn.tls
            && !matches!(typ, OptType::STARTTLS | OptType::ABORT)
        {
            let mut w = conn.io.writer();
            OptReply::error(typ, ReplyType::ERR_TLS_REQD, "this server requires TLS")
                .put(&mut **w)?;
            continue;
        }

        match typ {
            OptType::STARTTLS => {
                if !opt.data.is_empty() {
                    let mut w = conn.io.writer();
                    OptReply::error(typ, ReplyType::ERR_INVALID, "STARTTLS takes no data")
                        .put(&mut **w)?;
                    continue;
                }
                if conn.tls {
                    let mut w = conn.io.writer();
                    OptReply::error(typ, ReplyType::ERR_INVALID, "TLS is already active")
                        .put(&mut **w)?;
                    continue;
                }
                let config = match (ctx.tls_mode, &ctx.tls_config) {
                    (TlsMode::Disabled, _) | (_, None) => {
                        let mut w = conn.io.writer();
                        OptReply::error(typ, ReplyType::ERR_POLICY, "TLS is not enabled")
                            .put(&mut **w)?;
                        continue;
                    }
                    (_, Some(config)) => Arc::clone(config),
                };
                {
                    let mut w = conn.io.writer();
                    OptReply::ack(typ).put(&mut **w)?;
                }
                tls::upgrade(&conn.io, config).wrap_err("STARTTLS upgrade failed")?;
                conn.tls = true;
                info!(target: "nbd", "conn {}: upgraded to TLS", conn.id);
            }

            OptType::STRUCTURED_REPLY => {
                let mut w = conn.io.writer();
                if !opt.data.is_empty() {
                    OptReply::error(typ, ReplyType::ERR_INVALID, "STRUCTURED_REPLY takes no data")
                        .put(&mut **w)?;
                    continue;
                }
                conn.structured = true;
                OptReply::ack(typ).put(&mut **w)?;
            }

            OptType::LIST => {
                let mut exports = crate::extents::Exports::new();
                let listed = ctx
                    .stack
                    .top(&conn.chain)
                    .list_exports(conn.readonly, conn.tls, &mut exports);
                let mut w = conn.io.writer();
                if let Err(err) = listed {
                    OptReply::error(typ, ReplyType::ERR_PLATFORM, &err.to_string())
                        .put(&mut **w)?;
                    continue;
                }
                for export in exports.as_slice() {
                    let mut data = vec![];
                    data.write_u32::<BE>(export.name.len() as u32)?;
                    data.extend_from_slice(export.name.as_bytes());
                    if let Some(desc) = &export.description {
                        data.extend_from_slice(desc.as_bytes());
                    }
                    OptReply::new(typ, ReplyType::SERVER, data).put(&mut **w)?;
                }
                OptReply::ack(typ).put(&mut **w)?;
            }

            OptType::ABORT => {
                // best-effort: clients often hang up without reading this
                let mut w = conn.io.writer();
                let _ = OptReply::ack(typ).put(&mut **w);
                return Ok(Outcome::Closed);
            }

            OptType::EXPORT_NAME => {
                if opt.data.len() > MAX_EXPORT_NAME_LEN {
                    bail!(ProtocolError::new("export name too long"));
                }
                let requested = String::from_utf8(opt.data)
                    .wrap_err(ProtocolError::new("non-UTF8 export name"))?;
                // this option has no error channel: any failure closes
                match negotiate(ctx, conn, &requested, true) {
                    Ok(()) => {}
                    Err(NegotiateError::Open(err))
                    | Err(NegotiateError::Invariant(err))
                    | Err(NegotiateError::Refused(err)) => {
                        warn!(
                            target: "nbd",
                            "conn {}: export {:?} refused: {err}", conn.id, requested
                        );
                        return Ok(Outcome::Closed);
                    }
                }
                let caps = conn.caps().clone();
                let mut w = conn.io.writer();
                w.write_u64::<BE>(caps.size)?;
                w.write_u16::<BE>(caps.export_flags(conn.structured).bits())?;
                if !conn.no_zeroes {
                    w.write_all(&[0u8; 124])?;
                }
                w.flush()?;
                return Ok(Outcome::Serve);
            }

            // the only difference between INFO and GO is that on success GO
            // starts the transmission phase
            OptType::INFO | OptType::GO => {
                let info_req = InfoRequest::get(&mut &opt.data[..])
                    .wrap_err("parsing INFO/GO payload")?;
                match negotiate(ctx, conn, &info_req.name, typ == OptType::GO) {
                    Ok(()) => {}
                    Err(NegotiateError::Open(err)) => {
                        let mut w = conn.io.writer();
                        OptReply::error(typ, ReplyType::ERR_UNKNOWN, &err.to_string())
                            .put(&mut **w)?;
                        continue;
                    }
                    Err(NegotiateError::Invariant(err)) => {
                        // inconsistent capability set: refuse to serve at all
                        warn!(target: "nbd", "conn {}: {err}", conn.id);
                        let mut w = conn.io.writer();
                        OptReply::error(typ, ReplyType::ERR_INVALID, &err.to_string())
                            .put(&mut **w)?;
                        return Ok(Outcome::Closed);
                    }
                    Err(NegotiateError::Refused(err)) => {
                        let mut w = conn.io.writer();
                        OptReply::error(typ, ReplyType::ERR_POLICY, &err.to_string())
                            .put(&mut **w)?;
                        continue;
                    }
                }
                send_info_replies(conn, typ, &info_req)?;
                if typ == OptType::GO {
                    return Ok(Outcome::Serve);
                }
                rollback(ctx, conn);
            }

            OptType::PEEK_EXPORT => {
                let mut w = conn.io.writer();
                OptReply::error(typ, ReplyType::ERR_UNSUP, "PEEK_EXPORT is obsolete")
                    .put(&mut **w)?;
            }
        }
    }
}

/// Answer the information blocks of a successful `INFO`/`GO`, ending with
/// `ACK`. `INFO_EXPORT` is always included whether requested or not.
fn send_info_replies(conn: &Connection, typ: OptType, req: &InfoRequest) -> Result<()> {
    let caps = conn.caps().clone();
    let mut w = conn.io.writer();

    // Mandatory information before a successful completion of NBD_OPT_INFO
    // or NBD_OPT_GO:
    // - 16 bits, NBD_INFO_EXPORT
    // - 64 bits, size of the export in bytes (unsigned)
    // - 16 bits, transmission flags
    let mut buf = vec![];
    buf.write_u16::<BE>(InfoType::EXPORT.into())?;
    buf.write_u64::<BE>(caps.size)?;
    buf.write_u16::<BE>(caps.export_flags(conn.structured).bits())?;
    OptReply::new(typ, ReplyType::INFO, buf).put(&mut **w)?;

    if req.typs.contains(&InfoType::BLOCK_SIZE) || caps.nondefault_block_size() {
        // - 16 bits, NBD_INFO_BLOCK_SIZE
        // - 32 bits each: minimum, preferred, maximum block size
        let mut buf = vec![];
        buf.write_u16::<BE>(InfoType::BLOCK_SIZE.into())?;
        buf.write_u32::<BE>(caps.block_size.minimum)?;
        buf.write_u32::<BE>(caps.block_size.preferred)?;
        buf.write_u32::<BE>(caps.block_size.maximum)?;
        OptReply::new(typ, ReplyType::INFO, buf).put(&mut **w)?;
    }

    if req.typs.contains(&InfoType::NAME) {
        let mut buf = vec![];
        buf.write_u16::<BE>(InfoType::NAME.into())?;
        buf.extend_from_slice(conn.export_name.as_bytes());
        OptReply::new(typ, ReplyType::INFO, buf).put(&mut **w)?;
    }

    if req.typs.contains(&InfoType::DESCRIPTION) {
        if let Some(desc) = &caps.description {
            let mut buf = vec![];
            buf.write_u16::<BE>(InfoType::DESCRIPTION.into())?;
            buf.extend_from_slice(desc.as_bytes());
            OptReply::new(typ, ReplyType::INFO, buf).put(&mut **w)?;
        }
    }

    OptReply::ack(typ).put(&mut **w)?;
    Ok(())
}
