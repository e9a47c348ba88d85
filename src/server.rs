//! The listener and per-connection lifecycle: accept, preconnect,
//! handshake, request loop, teardown.
//!
//! The server receives a validated [`Config`] and an assembled [`Stack`]
//! from its caller; it owns nothing about storage and enforces no policy on
//! bytes. Certificates, command-line parsing, and daemonization all live
//! outside this module.

use std::collections::HashMap;
use std::io;
use std::net::TcpListener;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use log::{info, warn};
use rustls::ServerConfig;

use crate::backend::{Control, NbdError, OpResult, ThreadModel};
use crate::caps::Caps;
use crate::conn::{Connection, ProtocolMode, RawSocket};
use crate::handshake::{self, HandshakeCtx, Outcome};
use crate::proto::ErrorType;
use crate::stack::Stack;
use crate::threads::{self, ServerLocks};
use crate::tls::TlsMode;

/// How long a shutdown waits for live connections before giving up on them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Accept-loop poll interval; bounds how quickly shutdown is noticed.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Where the server listens.
#[derive(Debug, Clone)]
pub enum Listen {
    /// A TCP address like `127.0.0.1:10809`.
    Tcp(String),
    /// A local stream socket path.
    Unix(PathBuf),
}

/// Validated server configuration, produced by the caller.
#[derive(Clone)]
pub struct Config {
    /// Listen address.
    pub listen: Listen,
    /// Run the legacy oldstyle handshake instead of newstyle.
    pub oldstyle: bool,
    /// Refuse writes on every connection regardless of the plugin.
    pub readonly: bool,
    /// TLS policy.
    pub tls_mode: TlsMode,
    /// TLS parameters; required unless `tls_mode` is `Disabled`.
    pub tls_config: Option<Arc<ServerConfig>>,
    /// Worker threads per parallel connection; `None` sizes to the machine.
    pub workers: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: Listen::Tcp(format!("127.0.0.1:{}", crate::proto::TCP_PORT)),
            oldstyle: false,
            readonly: false,
            tls_mode: TlsMode::Disabled,
            tls_config: None,
            workers: None,
        }
    }
}

/// Tracks which exports have live connections so that exports without
/// multi-connection support are not shared.
#[derive(Default)]
pub struct Admission {
    active: Mutex<HashMap<String, usize>>,
}

impl Admission {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a freshly negotiated connection, unless the export is writable
    /// without multi-connection support and someone else already holds it.
    pub fn admit(&self, export: &str, caps: &Caps) -> OpResult<()> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let count = active.entry(export.to_string()).or_insert(0);
        if *count > 0 && caps.writable && !caps.multi_conn {
            return Err(NbdError::new(
                ErrorType::EPERM,
                format!("export {export:?} does not support multiple connections"),
            ));
        }
        *count += 1;
        Ok(())
    }

    /// Drop a connection's claim on `export`.
    pub fn release(&self, export: &str) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = active.get_mut(export) {
            *count -= 1;
            if *count == 0 {
                active.remove(export);
            }
        }
    }
}

enum ListenerSock {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl ListenerSock {
    fn bind(listen: &Listen) -> Result<ListenerSock> {
        Ok(match listen {
            Listen::Tcp(addr) => {
                let l = TcpListener::bind(addr).wrap_err_with(|| format!("binding {addr}"))?;
                l.set_nonblocking(true)?;
                ListenerSock::Tcp(l)
            }
            Listen::Unix(path) => {
                // a previous run may have left its socket behind
                let _ = std::fs::remove_file(path);
                let l = UnixListener::bind(path)
                    .wrap_err_with(|| format!("binding {}", path.display()))?;
                l.set_nonblocking(true)?;
                ListenerSock::Unix(l)
            }
        })
    }

    fn accept(&self) -> io::Result<RawSocket> {
        match self {
            ListenerSock::Tcp(l) => {
                let (sock, _) = l.accept()?;
                sock.set_nonblocking(false)?;
                sock.set_nodelay(true)?;
                Ok(RawSocket::Tcp(sock))
            }
            ListenerSock::Unix(l) => {
                let (sock, _) = l.accept()?;
                sock.set_nonblocking(false)?;
                Ok(RawSocket::Unix(sock))
            }
        }
    }
}

/// The server: a stack, a config, and the shared runtime state.
pub struct Server {
    stack: Arc<Stack>,
    cfg: Config,
    ctl: Arc<Control>,
    locks: Arc<ServerLocks>,
    admission: Arc<Admission>,
    next_conn_id: AtomicU64,
    live_conns: Arc<AtomicUsize>,
}

impl Server {
    /// Wrap an assembled stack and a validated configuration.
    pub fn new(stack: Stack, cfg: Config) -> Server {
        Server {
            stack: Arc::new(stack),
            cfg,
            ctl: Arc::new(Control::new()),
            locks: Arc::new(ServerLocks::new()),
            admission: Arc::new(Admission::new()),
            next_conn_id: AtomicU64::new(1),
            live_conns: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The shutdown handle shared with the layers. Callers keep a clone to
    /// stop the server (e.g. from a signal handler).
    pub fn control(&self) -> Arc<Control> {
        Arc::clone(&self.ctl)
    }

    /// Bind, accept, and serve until shutdown is requested.
    pub fn start(self) -> Result<()> {
        let listener = ListenerSock::bind(&self.cfg.listen)?;
        info!(target: "nbd", "listening on {:?}", self.cfg.listen);
        self.run(listener)
    }

    /// Serve on a TCP socket the caller already bound (e.g. one inherited
    /// from a supervisor).
    pub fn start_on(self, listener: TcpListener) -> Result<()> {
        listener.set_nonblocking(true)?;
        self.run(ListenerSock::Tcp(listener))
    }

    fn run(self, listener: ListenerSock) -> Result<()> {
        self.stack.load(&self.ctl);
        self.stack.get_ready()?;

        let server = Arc::new(self);
        while !server.ctl.is_shutdown() {
            let sock = match listener.accept() {
                Ok(sock) => sock,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL);
                    continue;
                }
                Err(err) => {
                    warn!(target: "nbd", "accept failed: {err}");
                    continue;
                }
            };
            let id = server.next_conn_id.fetch_add(1, Ordering::Relaxed);
            let server = Arc::clone(&server);
            server.live_conns.fetch_add(1, Ordering::SeqCst);
            std::thread::spawn(move || {
                if let Err(err) = server.handle_client(id, sock) {
                    warn!(target: "nbd", "conn {id}: {err:#}");
                }
                server.live_conns.fetch_sub(1, Ordering::SeqCst);
            });
        }

        // drain: connections notice the flag between requests; anything
        // still blocked on an idle client is abandoned after the grace
        // period (the process usually exits right after)
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while server.live_conns.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            std::thread::sleep(ACCEPT_POLL);
        }
        let stranded = server.live_conns.load(Ordering::SeqCst);
        if stranded > 0 {
            warn!(target: "nbd", "shutdown with {stranded} connection(s) still open");
        }
        server.stack.unload();
        info!(target: "nbd", "server stopped");
        Ok(())
    }

    /// Serve one accepted socket from handshake to teardown.
    fn handle_client(&self, id: u64, sock: RawSocket) -> Result<()> {
        // the strictest model admits one connection at a time
        let _conn_guard = (self.stack.thread_model() == ThreadModel::SerializeConnections)
            .then(|| {
                self.locks
                    .connections
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
            });

        let mut conn = Connection::new(id, sock, &self.stack, self.cfg.readonly)?;
        if self.cfg.oldstyle {
            conn.mode = ProtocolMode::Oldstyle;
        }
        info!(target: "nbd", "conn {id}: accepted from {}", conn.peer);

        if let Err(err) = self.stack.top(&conn.chain).preconnect(self.cfg.readonly) {
            warn!(target: "nbd", "conn {id}: refused by preconnect: {err}");
            return Ok(());
        }

        let ctx = HandshakeCtx {
            stack: &self.stack,
            tls_mode: self.cfg.tls_mode,
            tls_config: self.cfg.tls_config.clone(),
            admission: &self.admission,
        };
        let outcome = handshake::run(&ctx, &mut conn);

        let result = match outcome {
            Ok(Outcome::Serve) => threads::serve_connection(
                &self.stack,
                &self.ctl,
                &self.locks,
                &conn,
                self.cfg.workers,
            ),
            Ok(Outcome::Closed) => Ok(()),
            Err(err) => Err(err),
        };

        // teardown always runs, whatever the request loop did
        self.stack.close_chain(&conn.chain);
        if conn.caps.is_some() {
            self.admission.release(&conn.export_name);
        }
        info!(target: "nbd", "conn {id}: closed");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BlockSize;
    use crate::backend::FuaMode;

    fn caps(writable: bool, multi_conn: bool) -> Caps {
        Caps {
            size: 1024,
            writable,
            can_flush: false,
            rotational: false,
            can_trim: false,
            zero_native: false,
            can_fast_zero: false,
            fua: FuaMode::None,
            cache: crate::backend::CacheMode::None,
            multi_conn,
            can_extents: false,
            block_size: BlockSize::default(),
            description: None,
        }
    }

    #[test]
    fn unsafe_export_is_not_shared() {
        let admission = Admission::new();
        let unsafe_caps = caps(true, false);
        admission.admit("disk", &unsafe_caps).unwrap();
        let err = admission.admit("disk", &unsafe_caps).unwrap_err();
        assert_eq!(err.errno(), ErrorType::EPERM);
        // a different export is unaffected
        admission.admit("other", &unsafe_caps).unwrap();
        // once released, the export can be reacquired
        admission.release("disk");
        admission.admit("disk", &unsafe_caps).unwrap();
    }

    #[test]
    fn multi_conn_and_read_only_connections_share_freely() {
        let admission = Admission::new();
        let shared = caps(true, true);
        admission.admit("disk", &shared).unwrap();
        admission.admit("disk", &shared).unwrap();

        let ro = caps(false, false);
        admission.admit("snap", &ro).unwrap();
        admission.admit("snap", &ro).unwrap();
    }
}
