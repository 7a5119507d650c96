//! TCP stream channels.
//!
//! One protocol, three kinds selected at init time via `mode=`:
//!
//! - `client` (default): non-blocking connect to `host:port` or a Unix
//!   socket path. Stays `Opening` until the connect completes, then
//!   `Active`.
//! - `server`: binds a listener; every accepted connection becomes an
//!   internal child socket channel. DATA from any socket is re-emitted on
//!   the server with `addr` identifying the peer; posting with that `addr`
//!   routes the reply to exactly that peer.
//! - `socket`: one accepted connection, created by the server with the fd
//!   handed over through the open parameters.
//!
//! Messages are framed with a 16 byte little-endian header
//! (`size: u32, msgid: i32, seq: i64`) followed by the payload.

use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::path::PathBuf;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::{debug, info, trace, warn};

use crate::channel::base::{Base, ChannelImpl, ChildPolicy, Impl, InitAction, OpenPolicy};
use crate::channel::{Callback, Caps, Channel, DCaps, State};
use crate::config::default_usize;
use crate::error::{Error, Result};
use crate::msg::{Message, MsgMask, MsgType};
use crate::url::Url;

const FRAME_LEN: usize = 16;
const DEFAULT_MAX_READ: usize = 64 * 1024;

// ============================================================================
// Address and Socket Wrappers
// ============================================================================

#[derive(Debug, Clone)]
enum HostAddr {
    Inet(SocketAddr),
    Unix(PathBuf),
}

fn parse_host(host: &str) -> Result<HostAddr> {
    if host.is_empty() {
        return Err(Error::invalid_arg("tcp channel requires a host"));
    }
    if host.contains('/') {
        return Ok(HostAddr::Unix(PathBuf::from(host)));
    }
    use std::net::ToSocketAddrs;
    host.to_socket_addrs()
        .map_err(|e| Error::invalid_arg(format!("can not resolve '{host}': {e}")))?
        .next()
        .map(HostAddr::Inet)
        .ok_or_else(|| Error::invalid_arg(format!("can not resolve '{host}': no addresses")))
}

enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    fn raw_fd(&self) -> RawFd {
        match self {
            Stream::Tcp(s) => s.as_raw_fd(),
            Stream::Unix(s) => s.as_raw_fd(),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn take_error(&self) -> std::io::Result<Option<std::io::Error>> {
        match self {
            Stream::Tcp(s) => s.take_error(),
            Stream::Unix(s) => s.take_error(),
        }
    }

    // Distinguishes a completed non-blocking connect from one still in
    // flight.
    fn peer_connected(&self) -> std::io::Result<bool> {
        let result = match self {
            Stream::Tcp(s) => s.peer_addr().map(|_| ()),
            Stream::Unix(s) => s.peer_addr().map(|_| ()),
        };
        match result {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(false),
            Err(e) if e.raw_os_error() == Some(libc_einprogress()) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

// ENOTCONN covers most platforms; Linux reports a connect in flight from
// peer_addr as EINPROGRESS.
fn libc_einprogress() -> i32 {
    115
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    fn raw_fd(&self) -> RawFd {
        match self {
            Listener::Tcp(l) => l.as_raw_fd(),
            Listener::Unix(l) => l.as_raw_fd(),
        }
    }

    fn accept(&self) -> std::io::Result<Stream> {
        match self {
            Listener::Tcp(l) => l.accept().map(|(s, _)| Stream::Tcp(s)),
            Listener::Unix(l) => l.accept().map(|(s, _)| Stream::Unix(s)),
        }
    }
}

// ============================================================================
// Framing
// ============================================================================

fn frame_encode(msg: &Message) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_LEN + msg.data.len());
    buf.extend_from_slice(&(msg.data.len() as u32).to_le_bytes());
    buf.extend_from_slice(&msg.msgid.to_le_bytes());
    buf.extend_from_slice(&msg.seq.to_le_bytes());
    buf.extend_from_slice(&msg.data);
    buf
}

// ============================================================================
// Shared Stream State
// ============================================================================

// Read buffer and connected stream, shared by client and socket kinds.
struct SocketCore {
    stream: Option<Stream>,
    rbuf: Vec<u8>,
    max_read: usize,
}

impl Default for SocketCore {
    fn default() -> Self {
        SocketCore {
            stream: None,
            rbuf: Vec::new(),
            max_read: DEFAULT_MAX_READ,
        }
    }
}

impl SocketCore {
    // Buffer sizing comes from the context defaults store; a channel
    // specific `{name}.max_read_size` entry wins over the global one.
    fn configure(&mut self, base: &Base) {
        if let Some(size) = default_usize(&base.defaults(), &base.name(), "max_read_size") {
            self.max_read = size.max(FRAME_LEN);
        }
    }

    // Drains the socket and emits one DATA callback per complete frame.
    // Returns Again when neither bytes nor frames arrived.
    fn process_read(&mut self, base: &Base, addr: i64) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::Again)?;
        let mut progress = false;
        let mut closed = false;
        let mut failure = None;
        loop {
            let pos = self.rbuf.len();
            self.rbuf.resize(pos + self.max_read, 0);
            match stream.read(&mut self.rbuf[pos..]) {
                Ok(0) => {
                    self.rbuf.truncate(pos);
                    info!(channel = %base.name(), "Connection closed by peer");
                    closed = true;
                    break;
                }
                Ok(n) => {
                    trace!(channel = %base.name(), len = n, "Read data from socket");
                    self.rbuf.truncate(pos + n);
                    progress = true;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.rbuf.truncate(pos);
                    break;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {
                    self.rbuf.truncate(pos);
                    continue;
                }
                Err(e) => {
                    self.rbuf.truncate(pos);
                    if matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::BrokenPipe) {
                        warn!(channel = %base.name(), "Connection reset");
                        closed = true;
                        break;
                    }
                    failure = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = failure {
            self.disconnect(base);
            return Err(e.into());
        }

        let mut offset = 0;
        while self.rbuf.len() - offset >= FRAME_LEN {
            let head = &self.rbuf[offset..offset + FRAME_LEN];
            let size = u32::from_le_bytes(head[0..4].try_into().expect("4 byte slice")) as usize;
            let msgid = i32::from_le_bytes(head[4..8].try_into().expect("4 byte slice"));
            let seq = i64::from_le_bytes(head[8..16].try_into().expect("8 byte slice"));
            if self.rbuf.len() - offset - FRAME_LEN < size {
                break;
            }
            let payload = &self.rbuf[offset + FRAME_LEN..offset + FRAME_LEN + size];
            let msg = Message {
                msgid,
                seq,
                addr,
                data: payload.to_vec(),
                ..Default::default()
            };
            base.callback_data(&msg);
            offset += FRAME_LEN + size;
        }
        self.rbuf.drain(..offset);

        if closed {
            self.disconnect(base);
            base.set_state(State::Closing);
            base.closed();
            return Ok(());
        }
        if progress {
            Ok(())
        } else {
            Err(Error::Again)
        }
    }

    fn post_data(&mut self, base: &Base, msg: &Message) -> Result<()> {
        if msg.msg_type != MsgType::Data {
            return Ok(());
        }
        if base.state() != State::Active {
            return Err(Error::State {
                op: "post",
                state: base.state(),
            });
        }
        let stream = self.stream.as_mut().ok_or(Error::Again)?;
        let frame = frame_encode(msg);
        debug!(channel = %base.name(), len = msg.data.len(), "Post data");
        match stream.write(&frame) {
            Ok(n) if n == frame.len() => Ok(()),
            Ok(n) => Err(Error::Io(std::io::Error::new(
                ErrorKind::WriteZero,
                format!("truncated write: {n} of {} bytes", frame.len()),
            ))),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Err(Error::Again),
            Err(e) => Err(e.into()),
        }
    }

    fn disconnect(&mut self, base: &Base) {
        base.dcaps_poll(DCaps::empty());
        base.update_fd(-1);
        self.stream = None;
        self.rbuf.clear();
    }
}

// ============================================================================
// Mode Dispatch
// ============================================================================

#[derive(Default)]
struct Tcp;

impl ChannelImpl for Tcp {
    fn init(&mut self, _base: &Base, url: &Url, _master: Option<&Channel>) -> Result<InitAction> {
        match url.get("mode").unwrap_or("client") {
            "client" => Ok(InitAction::Replace(&TCP_CLIENT_IMPL)),
            "server" => Ok(InitAction::Replace(&TCP_SERVER_IMPL)),
            "socket" => Ok(InitAction::Replace(&TCP_SOCKET_IMPL)),
            other => Err(Error::invalid_arg(format!(
                "invalid mode '{other}', expected one of: client, server, socket"
            ))),
        }
    }

    fn post(&mut self, _base: &Base, _msg: &Message) -> Result<()> {
        Err(Error::Again)
    }
}

/// Descriptor for the `tcp` protocol; init replaces itself with the
/// mode-specific kind.
pub static TCP_IMPL: Impl = Impl {
    protocol: "tcp",
    new: || Box::new(Tcp),
};

// ============================================================================
// Client
// ============================================================================

#[derive(Default)]
struct TcpClient {
    core: SocketCore,
    host: Option<HostAddr>,
}

impl ChannelImpl for TcpClient {
    fn open_policy(&self) -> OpenPolicy {
        OpenPolicy::Manual
    }

    fn init(&mut self, base: &Base, url: &Url, _master: Option<&Channel>) -> Result<InitAction> {
        base.caps_add(Caps::INOUT);
        self.host = Some(parse_host(url.host())?);
        self.core.configure(base);
        Ok(InitAction::Ok)
    }

    fn open(&mut self, base: &Base, _params: &Url) -> Result<()> {
        let host = self.host.as_ref().ok_or(Error::Again)?;
        let stream = match host {
            HostAddr::Inet(addr) => Stream::Tcp(TcpStream::connect(*addr)?),
            HostAddr::Unix(path) => Stream::Unix(UnixStream::connect(path)?),
        };
        info!(channel = %base.name(), fd = stream.raw_fd(), "Connecting");
        base.update_fd(stream.raw_fd());
        base.dcaps_poll(DCaps::POLL_OUT);
        self.core.stream = Some(stream);
        Ok(())
    }

    fn close(&mut self, base: &Base, _force: bool) -> Result<()> {
        self.core.disconnect(base);
        Ok(())
    }

    fn process(&mut self, base: &Base, _timeout: Duration) -> Result<()> {
        match base.state() {
            State::Opening => {
                let stream = self.core.stream.as_mut().ok_or(Error::Again)?;
                if let Some(e) = stream.take_error()? {
                    self.core.disconnect(base);
                    return Err(e.into());
                }
                if stream.peer_connected()? {
                    info!(channel = %base.name(), "Connection established");
                    base.dcaps_poll(DCaps::POLL_IN);
                    base.set_state(State::Active);
                    Ok(())
                } else {
                    Err(Error::Again)
                }
            }
            State::Active => self.core.process_read(base, 0),
            _ => Err(Error::Again),
        }
    }

    fn post(&mut self, base: &Base, msg: &Message) -> Result<()> {
        self.core.post_data(base, msg)
    }
}

static TCP_CLIENT_IMPL: Impl = Impl {
    protocol: "tcp",
    new: || Box::new(TcpClient::default()),
};

// ============================================================================
// Server
// ============================================================================

#[derive(Default)]
struct TcpServer {
    listener: Option<Listener>,
    host: Option<HostAddr>,
    next_addr: i64,
}

impl TcpServer {
    fn accept_one(&mut self, base: &Base, stream: Stream) -> Result<()> {
        let addr = self.next_addr;
        self.next_addr += 1;
        let af = match &stream {
            Stream::Tcp(_) => "inet",
            Stream::Unix(_) => "unix",
        };
        let fd = match stream {
            Stream::Tcp(s) => s.into_raw_fd(),
            Stream::Unix(s) => s.into_raw_fd(),
        };
        info!(channel = %base.name(), addr, fd, "Accepting connection");

        let url = Url::parse(&format!(
            "tcp://;mode=socket;name={}/{addr};tll.internal=yes;addr={addr};af={af}",
            base.name()
        ))?;
        let child =
            base.context()
                .channel_with_impl(&url, Some(base.channel()), Some(&TCP_SOCKET_IMPL))?;
        child.open(&format!("fd={fd}"))?;

        // DATA from the socket surfaces on the server, already stamped
        // with the peer's addr.
        let weak = base.channel().downgrade();
        let data_cb = Callback::new(move |_socket: &Channel, msg: &Message| {
            if let Some(server) = weak.upgrade() {
                if let Some(stat) = server.stat() {
                    stat.update_rx(msg.data.len());
                }
                server.emit(msg);
            }
            0
        });
        child.callback_add(&data_cb, MsgMask::DATA)?;

        // A socket that reaches Closed is detached and reclaimed.
        let weak = base.channel().downgrade();
        let state_cb = Callback::new(move |socket: &Channel, msg: &Message| {
            if State::from_msgid(msg.msgid) == Some(State::Closed) {
                if let Some(server) = weak.upgrade() {
                    debug!(channel = %server.name(), socket = %socket.name(), "Drop closed socket");
                    server.child_del(socket);
                    socket.free();
                }
            }
            0
        });
        child.callback_add(&state_cb, MsgMask::STATE)?;

        base.child_add(&child, "tcp");
        Ok(())
    }

    fn drop_children(&mut self, base: &Base) {
        for child in base.channel().children() {
            let _ = child.close_force(true);
            base.child_del(&child);
            child.free();
        }
    }
}

impl ChannelImpl for TcpServer {
    fn child_policy(&self) -> ChildPolicy {
        ChildPolicy::Many
    }

    fn init(&mut self, base: &Base, url: &Url, _master: Option<&Channel>) -> Result<InitAction> {
        base.caps_add(Caps::INOUT);
        self.host = Some(parse_host(url.host())?);
        Ok(InitAction::Ok)
    }

    fn open(&mut self, base: &Base, _params: &Url) -> Result<()> {
        let host = self.host.as_ref().ok_or(Error::Again)?;
        let listener = match host {
            HostAddr::Inet(addr) => Listener::Tcp(TcpListener::bind(*addr)?),
            HostAddr::Unix(path) => Listener::Unix(UnixListener::bind(path)?),
        };
        info!(channel = %base.name(), fd = listener.raw_fd(), "Listening for connections");
        base.update_fd(listener.raw_fd());
        base.dcaps_poll(DCaps::POLL_IN);
        self.listener = Some(listener);
        Ok(())
    }

    fn close(&mut self, base: &Base, _force: bool) -> Result<()> {
        self.drop_children(base);
        base.dcaps_poll(DCaps::empty());
        base.update_fd(-1);
        self.listener = None;
        if let Some(HostAddr::Unix(path)) = &self.host {
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }

    fn process(&mut self, base: &Base, _timeout: Duration) -> Result<()> {
        let mut accepted = Vec::new();
        {
            let listener = self.listener.as_ref().ok_or(Error::Again)?;
            loop {
                match listener.accept() {
                    Ok(stream) => accepted.push(stream),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e)
                        if matches!(
                            e.kind(),
                            ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset
                        ) =>
                    {
                        warn!(channel = %base.name(), "Transient accept error: {e}");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        if accepted.is_empty() {
            return Err(Error::Again);
        }
        for stream in accepted {
            self.accept_one(base, stream)?;
        }
        Ok(())
    }

    fn post(&mut self, base: &Base, msg: &Message) -> Result<()> {
        if msg.msg_type != MsgType::Data {
            return Ok(());
        }
        let target = format!("{}/{}", base.name(), msg.addr);
        for child in base.channel().children() {
            if child.name() == target {
                return child.post(msg);
            }
        }
        Err(Error::NotFound {
            kind: "channel",
            name: target,
        })
    }

    fn free(&mut self, _base: &Base) {
        if let Some(HostAddr::Unix(path)) = &self.host {
            let _ = std::fs::remove_file(path);
        }
    }
}

static TCP_SERVER_IMPL: Impl = Impl {
    protocol: "tcp",
    new: || Box::new(TcpServer::default()),
};

// ============================================================================
// Accepted Socket
// ============================================================================

#[derive(Default)]
struct TcpSocket {
    core: SocketCore,
    addr: i64,
    unix: bool,
}

impl ChannelImpl for TcpSocket {
    fn init(&mut self, base: &Base, url: &Url, _master: Option<&Channel>) -> Result<InitAction> {
        base.caps_add(Caps::INOUT);
        self.addr = url.get_int("addr", 0)?;
        self.unix = url.get("af") == Some("unix");
        self.core.configure(base);
        Ok(InitAction::Ok)
    }

    fn open(&mut self, base: &Base, params: &Url) -> Result<()> {
        let fd = params.get_int("fd", -1)?;
        if fd < 0 {
            return Err(Error::invalid_arg("socket open requires an fd parameter"));
        }
        let fd = fd as RawFd;
        // Ownership of the fd transfers from the server's accept call; it
        // is open and non-blocking, nobody else holds it.
        let stream = if self.unix {
            Stream::Unix(unsafe { UnixStream::from_raw_fd(fd) })
        } else {
            Stream::Tcp(unsafe { TcpStream::from_raw_fd(fd) })
        };
        base.update_fd(fd);
        base.dcaps_poll(DCaps::POLL_IN);
        self.core.stream = Some(stream);
        Ok(())
    }

    fn close(&mut self, base: &Base, _force: bool) -> Result<()> {
        self.core.disconnect(base);
        Ok(())
    }

    fn process(&mut self, base: &Base, _timeout: Duration) -> Result<()> {
        match base.state() {
            State::Active => self.core.process_read(base, self.addr),
            _ => Err(Error::Again),
        }
    }

    fn post(&mut self, base: &Base, msg: &Message) -> Result<()> {
        self.core.post_data(base, msg)
    }
}

static TCP_SOCKET_IMPL: Impl = Impl {
    protocol: "tcp",
    new: || Box::new(TcpSocket::default()),
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let msg = Message {
            msgid: 7,
            seq: 100,
            data: b"xxx".to_vec(),
            ..Default::default()
        };
        let frame = frame_encode(&msg);
        assert_eq!(frame.len(), FRAME_LEN + 3);
        assert_eq!(u32::from_le_bytes(frame[0..4].try_into().unwrap()), 3);
        assert_eq!(i32::from_le_bytes(frame[4..8].try_into().unwrap()), 7);
        assert_eq!(i64::from_le_bytes(frame[8..16].try_into().unwrap()), 100);
        assert_eq!(&frame[16..], b"xxx");
    }

    #[test]
    fn host_parsing() {
        assert!(matches!(
            parse_host("./sock.path").unwrap(),
            HostAddr::Unix(_)
        ));
        assert!(matches!(
            parse_host("127.0.0.1:5555").unwrap(),
            HostAddr::Inet(_)
        ));
        assert!(parse_host("").is_err());
    }
}
