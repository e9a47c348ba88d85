//! Per-client connection state: the transport (plain or TLS-wrapped), the
//! negotiated protocol mode, the per-layer handle chain, and the cached
//! capability set.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use color_eyre::Result;

use crate::caps::Caps;
use crate::stack::{HandleChain, Stack};

/// A connected stream socket before any TLS wrapping.
pub enum RawSocket {
    /// TCP (v4 or v6).
    Tcp(TcpStream),
    /// Local stream socket.
    Unix(UnixStream),
}

impl RawSocket {
    /// Duplicate the underlying socket handle.
    pub fn try_clone(&self) -> io::Result<RawSocket> {
        Ok(match self {
            RawSocket::Tcp(s) => RawSocket::Tcp(s.try_clone()?),
            RawSocket::Unix(s) => RawSocket::Unix(s.try_clone()?),
        })
    }

    /// Human-readable peer address for the connection log.
    pub fn peer(&self) -> String {
        match self {
            RawSocket::Tcp(s) => s
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "tcp:?".to_string()),
            RawSocket::Unix(_) => "unix".to_string(),
        }
    }
}

impl Read for RawSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            RawSocket::Tcp(s) => s.read(buf),
            RawSocket::Unix(s) => s.read(buf),
        }
    }
}

impl Write for RawSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            RawSocket::Tcp(s) => s.write(buf),
            RawSocket::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            RawSocket::Tcp(s) => s.flush(),
            RawSocket::Unix(s) => s.flush(),
        }
    }
}

/// The connection's two transport halves, separately lockable so that under
/// the parallel thread model one worker can read the next request while
/// another writes a reply. These mutexes are the per-connection read and
/// write locks of the threading runtime.
pub struct ConnIo {
    reader: Mutex<Box<dyn Read + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    raw: Mutex<Option<RawSocket>>,
}

impl ConnIo {
    /// Wrap a freshly accepted socket.
    pub fn new(sock: RawSocket) -> io::Result<ConnIo> {
        let reader = sock.try_clone()?;
        let writer = sock.try_clone()?;
        Ok(ConnIo {
            reader: Mutex::new(Box::new(reader)),
            writer: Mutex::new(Box::new(writer)),
            raw: Mutex::new(Some(sock)),
        })
    }

    /// Build from pre-split halves. Used when the server is handed an
    /// internal stream pair by a supervisor instead of accepting a socket
    /// itself; such a connection cannot upgrade to TLS.
    pub fn from_parts(reader: Box<dyn Read + Send>, writer: Box<dyn Write + Send>) -> ConnIo {
        ConnIo {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            raw: Mutex::new(None),
        }
    }

    /// Lock the receive half.
    pub fn reader(&self) -> MutexGuard<'_, Box<dyn Read + Send>> {
        self.reader.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock the send half.
    pub fn writer(&self) -> MutexGuard<'_, Box<dyn Write + Send>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the raw socket out for a TLS upgrade. Returns `None` if the
    /// connection was already upgraded.
    pub fn take_raw(&self) -> Option<RawSocket> {
        self.raw.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Swap in new transport halves after a TLS upgrade; the plain halves
    /// are dropped.
    pub fn replace(&self, reader: Box<dyn Read + Send>, writer: Box<dyn Write + Send>) {
        *self.reader.lock().unwrap_or_else(PoisonError::into_inner) = reader;
        *self.writer.lock().unwrap_or_else(PoisonError::into_inner) = writer;
    }
}

/// Which handshake dialect the connection runs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProtocolMode {
    /// Legacy: no option negotiation, implicit default export.
    Oldstyle,
    /// Fixed-newstyle option negotiation.
    Newstyle,
}

/// State for one client connection, created on accept and destroyed after
/// the request loop ends.
///
/// Fields are filled in by the handshake (which holds the connection
/// exclusively); the transmission phase shares the connection across worker
/// threads and only touches the transport locks, the atomics, and the
/// frozen capability cache.
pub struct Connection {
    /// Process-unique connection id for the log.
    pub id: u64,
    /// Transport halves.
    pub io: ConnIo,
    /// Peer address for the log.
    pub peer: String,
    /// Handshake dialect.
    pub mode: ProtocolMode,
    /// Whether the transport has been upgraded to TLS.
    pub tls: bool,
    /// Whether structured replies were negotiated.
    pub structured: bool,
    /// Whether the client asked to skip the 124 reserved zero bytes.
    pub no_zeroes: bool,
    /// Export name the client selected (empty until negotiation).
    pub export_name: String,
    /// Whether this connection is read-only (server config or client).
    pub readonly: bool,
    /// Per-layer handles for this connection.
    pub chain: HandleChain,
    /// Negotiated capabilities; `Some` exactly from successful negotiation
    /// until the connection dies, and never mutated in between.
    pub caps: Option<Caps>,
    seq: AtomicU64,
    disconnect: AtomicBool,
}

impl Connection {
    /// Wrap an accepted socket into a fresh connection.
    pub fn new(id: u64, sock: RawSocket, stack: &Stack, readonly: bool) -> Result<Connection> {
        let peer = sock.peer();
        Ok(Self::with_io(id, ConnIo::new(sock)?, peer, stack, readonly))
    }

    /// Build a connection over arbitrary transport halves (supervisor
    /// stream pairs, tests).
    pub fn with_io(
        id: u64,
        io: ConnIo,
        peer: String,
        stack: &Stack,
        readonly: bool,
    ) -> Connection {
        Connection {
            id,
            io,
            peer,
            mode: ProtocolMode::Newstyle,
            tls: false,
            structured: false,
            no_zeroes: false,
            export_name: String::new(),
            readonly,
            chain: stack.new_chain(),
            caps: None,
            seq: AtomicU64::new(0),
            disconnect: AtomicBool::new(false),
        }
    }

    /// The frozen capability cache. Panics if negotiation has not finished;
    /// the request loop only runs on negotiated connections.
    pub fn caps(&self) -> &Caps {
        self.caps
            .as_ref()
            .expect("capabilities queried before negotiation")
    }

    /// Next value of the per-connection request sequence (log correlation
    /// only; the client's cookie is what goes back on the wire).
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Ask the request loop to wind the connection down after in-flight
    /// requests complete.
    pub fn request_disconnect(&self) {
        self.disconnect.store(true, Ordering::SeqCst);
    }

    /// Whether an orderly disconnect has been requested.
    pub fn disconnect_requested(&self) -> bool {
        self.disconnect.load(Ordering::SeqCst)
    }
}
