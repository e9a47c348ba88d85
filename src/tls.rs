//! TLS upgrade driver.
//!
//! The engine never loads certificates; it receives a ready
//! [`rustls::ServerConfig`] from its caller and only drives the `STARTTLS`
//! upgrade: complete the TLS handshake on the raw socket, then swap the
//! connection's transport halves for ones that speak through the session.
//!
//! One TLS session serves both halves, so reads and writes share a lock.
//! The threading runtime accounts for this by serializing requests on TLS
//! connections.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, PoisonError};

use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use rustls::{ServerConfig, ServerConnection, StreamOwned};

use crate::conn::{ConnIo, RawSocket};

/// Server-wide TLS policy, fixed at startup.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum TlsMode {
    /// `STARTTLS` is refused.
    #[default]
    Disabled,
    /// The client may upgrade but does not have to.
    Allowed,
    /// Every data-affecting option is refused until the client upgrades.
    Required,
}

/// Both transport halves of an upgraded connection share the one TLS
/// session behind a lock.
#[derive(Clone)]
struct SharedTls(Arc<Mutex<StreamOwned<ServerConnection, RawSocket>>>);

impl Read for SharedTls {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .read(buf)
    }
}

impl Write for SharedTls {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
    }
}

/// Complete a TLS handshake on the connection's raw socket and swap the
/// transport halves. Called after the `STARTTLS` acknowledgment has been
/// written; every subsequent byte flows through the session.
pub fn upgrade(io: &ConnIo, config: Arc<ServerConfig>) -> Result<()> {
    let mut sock = io
        .take_raw()
        .ok_or_else(|| color_eyre::eyre::eyre!("connection was already upgraded"))?;
    let mut session =
        ServerConnection::new(config).wrap_err("initializing TLS session")?;
    while session.is_handshaking() {
        session
            .complete_io(&mut sock)
            .wrap_err("completing TLS handshake")?;
    }
    let shared = SharedTls(Arc::new(Mutex::new(StreamOwned::new(session, sock))));
    io.replace(Box::new(shared.clone()), Box::new(shared));
    Ok(())
}
