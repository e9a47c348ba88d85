//! Shared harness for the integration tests: a server on an ephemeral port
//! and a minimal NBD client speaking literal wire bytes.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::JoinHandle;

use byteorder::{ReadBytesExt, WriteBytesExt, BE};

use nbdstack::proto::*;
use nbdstack::{Config, Control, Server, Stack};

/// A server running on its own thread, torn down on drop.
pub struct TestServer {
    pub addr: SocketAddr,
    ctl: Arc<Control>,
    handle: Option<JoinHandle<()>>,
}

pub fn start_server(stack: Stack, cfg: Config) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("binding ephemeral port");
    let addr = listener.local_addr().unwrap();
    let server = Server::new(stack, cfg);
    let ctl = server.control();
    let handle = std::thread::spawn(move || {
        server.start_on(listener).expect("server failed");
    });
    TestServer {
        addr,
        ctl,
        handle: Some(handle),
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.ctl.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// A test client over any transport (plain TCP or TLS-wrapped).
pub struct Client<S> {
    pub stream: S,
}

impl Client<TcpStream> {
    /// Connect and run the fixed-newstyle greeting.
    pub fn connect(addr: SocketAddr) -> Client<TcpStream> {
        Self::connect_with_flags(addr, ClientHandshakeFlags::C_FIXED_NEWSTYLE.bits())
    }

    /// Connect, announcing the given client flags.
    pub fn connect_with_flags(addr: SocketAddr, flags: u32) -> Client<TcpStream> {
        let mut stream = TcpStream::connect(addr).expect("connecting to test server");
        stream.set_nodelay(true).unwrap();
        assert_eq!(stream.read_u64::<BE>().unwrap(), MAGIC, "greeting magic");
        assert_eq!(stream.read_u64::<BE>().unwrap(), IHAVEOPT, "greeting version");
        let gflags = stream.read_u16::<BE>().unwrap();
        assert_ne!(gflags & HandshakeFlags::FIXED_NEWSTYLE.bits(), 0);
        stream.write_u32::<BE>(flags).unwrap();
        Client { stream }
    }
}

impl<S: Read + Write> Client<S> {
    /// Send one raw option frame.
    pub fn send_option(&mut self, code: u32, data: &[u8]) {
        self.stream.write_u64::<BE>(IHAVEOPT).unwrap();
        self.stream.write_u32::<BE>(code).unwrap();
        self.stream.write_u32::<BE>(data.len() as u32).unwrap();
        self.stream.write_all(data).unwrap();
        self.stream.flush().unwrap();
    }

    /// Read one option reply; returns (echoed option, reply code, payload).
    pub fn read_reply(&mut self) -> (u32, u32, Vec<u8>) {
        assert_eq!(self.stream.read_u64::<BE>().unwrap(), REPLY_MAGIC);
        let opt = self.stream.read_u32::<BE>().unwrap();
        let code = self.stream.read_u32::<BE>().unwrap();
        let len = self.stream.read_u32::<BE>().unwrap();
        let mut payload = vec![0u8; len as usize];
        self.stream.read_exact(&mut payload).unwrap();
        (opt, code, payload)
    }

    /// Negotiate structured replies.
    pub fn enable_structured(&mut self) {
        self.send_option(OptType::STRUCTURED_REPLY.into(), &[]);
        let (opt, code, _) = self.read_reply();
        assert_eq!(opt, u32::from(OptType::STRUCTURED_REPLY));
        assert_eq!(code, u32::from(ReplyType::ACK));
    }

    /// Build an `INFO`/`GO` payload.
    pub fn info_payload(name: &str, infos: &[u16]) -> Vec<u8> {
        let mut data = vec![];
        data.write_u32::<BE>(name.len() as u32).unwrap();
        data.extend_from_slice(name.as_bytes());
        data.write_u16::<BE>(infos.len() as u16).unwrap();
        for &info in infos {
            data.write_u16::<BE>(info).unwrap();
        }
        data
    }

    /// Send `GO` and drive it to `ACK`, returning (size, transmission
    /// flags) from the mandatory `INFO_EXPORT` block.
    pub fn go(&mut self, name: &str) -> (u64, u16) {
        self.send_option(OptType::GO.into(), &Self::info_payload(name, &[]));
        let mut export = None;
        loop {
            let (opt, code, payload) = self.read_reply();
            assert_eq!(opt, u32::from(OptType::GO));
            if code == u32::from(ReplyType::ACK) {
                return export.expect("GO acked without INFO_EXPORT");
            }
            assert_eq!(code, u32::from(ReplyType::INFO), "unexpected GO reply");
            let mut p = &payload[..];
            if p.read_u16::<BE>().unwrap() == u16::from(InfoType::EXPORT) {
                let size = p.read_u64::<BE>().unwrap();
                let flags = p.read_u16::<BE>().unwrap();
                export = Some((size, flags));
            }
        }
    }

    /// Send one request frame.
    pub fn request(
        &mut self,
        flags: u16,
        cmd: Cmd,
        cookie: u64,
        offset: u64,
        count: u32,
        payload: &[u8],
    ) {
        self.stream.write_u32::<BE>(REQUEST_MAGIC).unwrap();
        self.stream.write_u16::<BE>(flags).unwrap();
        self.stream.write_u16::<BE>(cmd.into()).unwrap();
        self.stream.write_u64::<BE>(cookie).unwrap();
        self.stream.write_u64::<BE>(offset).unwrap();
        self.stream.write_u32::<BE>(count).unwrap();
        self.stream.write_all(payload).unwrap();
        self.stream.flush().unwrap();
    }

    /// Read one simple reply plus `data_len` bytes of payload (for
    /// successful reads).
    pub fn simple_reply(&mut self, data_len: usize) -> (u32, u64, Vec<u8>) {
        assert_eq!(self.stream.read_u32::<BE>().unwrap(), SIMPLE_REPLY_MAGIC);
        let err = self.stream.read_u32::<BE>().unwrap();
        let cookie = self.stream.read_u64::<BE>().unwrap();
        let mut data = vec![0u8; if err == 0 { data_len } else { 0 }];
        self.stream.read_exact(&mut data).unwrap();
        (err, cookie, data)
    }

    /// Read one structured reply chunk.
    pub fn chunk(&mut self) -> (u16, u16, u64, Vec<u8>) {
        assert_eq!(self.stream.read_u32::<BE>().unwrap(), STRUCTURED_REPLY_MAGIC);
        let flags = self.stream.read_u16::<BE>().unwrap();
        let typ = self.stream.read_u16::<BE>().unwrap();
        let cookie = self.stream.read_u64::<BE>().unwrap();
        let len = self.stream.read_u32::<BE>().unwrap();
        let mut payload = vec![0u8; len as usize];
        self.stream.read_exact(&mut payload).unwrap();
        (flags, typ, cookie, payload)
    }

    /// Orderly client-side disconnect.
    pub fn disconnect(&mut self) {
        self.request(0, Cmd::DISCONNECT, 0xdead, 0, 0, &[]);
    }
}
