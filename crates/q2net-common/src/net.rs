// net.rs -- addresses and datagram transports
//
// The protocol code never touches sockets directly. It hands finished
// datagrams to a `NetTransport` and polls one for incoming packets, so the
// same client and server code runs over UDP or over in-process loopback.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::common::sys_milliseconds;
use crate::net_queue::{PacketQueue, PacketQueueSender, QueuedPacket, DEFAULT_QUEUE_CAPACITY};
use crate::qcommon::{MAX_MSGLEN, PORT_SERVER};

// =============================================================================
// Addresses
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetAdr {
    /// In-process endpoint bound to a port of a `LoopbackHub`.
    Loopback(u16),
    Ip(SocketAddr),
}

impl NetAdr {
    pub fn port(&self) -> u16 {
        match self {
            NetAdr::Loopback(port) => *port,
            NetAdr::Ip(sa) => sa.port(),
        }
    }

    pub fn is_loopback(&self) -> bool {
        matches!(self, NetAdr::Loopback(_))
    }
}

impl fmt::Display for NetAdr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetAdr::Loopback(port) => write!(f, "loopback:{}", port),
            NetAdr::Ip(sa) => write!(f, "{}", sa),
        }
    }
}

/// Compare two addresses ignoring the port.
pub fn net_compare_base_adr(a: &NetAdr, b: &NetAdr) -> bool {
    match (a, b) {
        (NetAdr::Loopback(_), NetAdr::Loopback(_)) => true,
        (NetAdr::Ip(x), NetAdr::Ip(y)) => x.ip() == y.ip(),
        _ => false,
    }
}

/// Parse an address string.
///
/// Supports:
/// - "loopback" or "loopback:27911" -> in-process endpoint
/// - "1.2.3.4", "1.2.3.4:27910", "[::1]:27910"
/// - "hostname" or "hostname:27910" -> DNS resolution
///
/// A missing port is filled with `default_port`.
pub fn net_string_to_adr(s: &str, default_port: u16) -> Option<NetAdr> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Some(rest) = s.strip_prefix("loopback") {
        return match rest.strip_prefix(':') {
            Some(port) => port.parse().ok().map(NetAdr::Loopback),
            None if rest.is_empty() => Some(NetAdr::Loopback(default_port)),
            None => None,
        };
    }

    if let Ok(sa) = s.parse::<SocketAddr>() {
        return Some(NetAdr::Ip(sa));
    }
    if let Ok(ip) = s.parse::<std::net::IpAddr>() {
        return Some(NetAdr::Ip(SocketAddr::new(ip, default_port)));
    }

    // host or host:port
    let with_port = if s.rsplit_once(':').is_some_and(|(_, p)| p.parse::<u16>().is_ok()) {
        s.to_string()
    } else {
        format!("{}:{}", s, default_port)
    };
    with_port
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .map(NetAdr::Ip)
}

/// Parse a server address, defaulting to the standard server port.
pub fn net_string_to_server_adr(s: &str) -> Option<NetAdr> {
    net_string_to_adr(s, PORT_SERVER)
}

// =============================================================================
// Transport trait
// =============================================================================

/// A datagram endpoint. Sends never block and `get_packet` returns `None`
/// when nothing is waiting.
pub trait NetTransport: Send {
    fn send_packet(&self, data: &[u8], to: &NetAdr) -> io::Result<()>;
    fn get_packet(&self) -> Option<(NetAdr, Vec<u8>)>;
    /// The address peers see for this endpoint.
    fn local_adr(&self) -> NetAdr;
}

impl<T: NetTransport + Sync> NetTransport for Arc<T> {
    fn send_packet(&self, data: &[u8], to: &NetAdr) -> io::Result<()> {
        (**self).send_packet(data, to)
    }

    fn get_packet(&self) -> Option<(NetAdr, Vec<u8>)> {
        (**self).get_packet()
    }

    fn local_adr(&self) -> NetAdr {
        (**self).local_adr()
    }
}

/// Send and log failures. Socket errors are never fatal to the caller.
pub fn net_send_packet(transport: &dyn NetTransport, data: &[u8], to: &NetAdr) {
    if let Err(e) = transport.send_packet(data, to) {
        log::debug!("NET_SendPacket to {}: {}", to, e);
    }
}

// =============================================================================
// Loopback
// =============================================================================

/// Packets queued per loopback port. The oldest are dropped past this.
pub const MAX_LOOPBACK: usize = 64;

#[derive(Default)]
struct LoopbackPorts {
    queues: HashMap<u16, VecDeque<(NetAdr, Vec<u8>)>>,
}

/// Shared in-process "network" connecting any number of loopback endpoints.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    ports: Arc<Mutex<LoopbackPorts>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an endpoint reachable as `NetAdr::Loopback(port)`. Binding a
    /// port again replaces its queue.
    pub fn bind(&self, port: u16) -> LoopbackTransport {
        self.ports.lock().queues.insert(port, VecDeque::new());
        LoopbackTransport {
            hub: self.clone(),
            port,
        }
    }
}

pub struct LoopbackTransport {
    hub: LoopbackHub,
    port: u16,
}

impl NetTransport for LoopbackTransport {
    fn send_packet(&self, data: &[u8], to: &NetAdr) -> io::Result<()> {
        let NetAdr::Loopback(port) = to else {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "loopback transport cannot reach network addresses",
            ));
        };

        let mut ports = self.hub.ports.lock();
        // unbound ports swallow packets like an unreachable host
        if let Some(queue) = ports.queues.get_mut(port) {
            if queue.len() >= MAX_LOOPBACK {
                queue.pop_front();
            }
            let len = data.len().min(MAX_MSGLEN);
            queue.push_back((NetAdr::Loopback(self.port), data[..len].to_vec()));
        }
        Ok(())
    }

    fn get_packet(&self) -> Option<(NetAdr, Vec<u8>)> {
        self.hub
            .ports
            .lock()
            .queues
            .get_mut(&self.port)
            .and_then(|q| q.pop_front())
    }

    fn local_adr(&self) -> NetAdr {
        NetAdr::Loopback(self.port)
    }
}

// =============================================================================
// UDP
// =============================================================================

/// IP type of service: low delay.
pub const IPTOS_LOWDELAY: u32 = 0x10;

/// Non-blocking UDP socket. With an I/O thread, receiving happens on a
/// dedicated thread and packets are handed over through a `PacketQueue`.
pub struct UdpTransport {
    socket: UdpSocket,
    local: NetAdr,
    io_thread: Option<IoThread>,
}

struct IoThread {
    queue: PacketQueue,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl UdpTransport {
    /// Bind to `port` on all interfaces. Port 0 picks any free port.
    pub fn bind(port: u16) -> io::Result<Self> {
        let socket = udp_socket(port)?;
        let local = NetAdr::Ip(socket.local_addr()?);
        log::info!("UDP socket bound to {}", local);
        Ok(Self {
            socket,
            local,
            io_thread: None,
        })
    }

    /// Move receiving onto a background thread.
    pub fn start_io_thread(&mut self) -> io::Result<()> {
        if self.io_thread.is_some() {
            return Ok(());
        }

        let socket = self.socket.try_clone()?;
        socket.set_nonblocking(false)?;
        socket.set_read_timeout(Some(Duration::from_millis(100)))?;

        let queue = PacketQueue::new(DEFAULT_QUEUE_CAPACITY);
        let sender = queue.sender();
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();

        let handle = std::thread::Builder::new()
            .name("net-io".into())
            .spawn(move || io_thread_loop(socket, sender, flag))?;

        self.io_thread = Some(IoThread {
            queue,
            shutdown,
            handle: Some(handle),
        });
        Ok(())
    }

    fn recv_direct(&self) -> Option<(NetAdr, Vec<u8>)> {
        let mut buf = [0u8; MAX_MSGLEN * 4];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    if len > MAX_MSGLEN {
                        log::debug!("Oversize packet from {}", from);
                        continue;
                    }
                    return Some((NetAdr::Ip(from), buf[..len].to_vec()));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
                // ICMP port unreachable surfaces here on some platforms
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    log::debug!("NET_GetPacket: {}", e);
                    return None;
                }
            }
        }
    }
}

/// Open a non-blocking, broadcast-capable UDP socket with low-delay ToS.
fn udp_socket(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    // not every platform honours ToS
    if let Err(e) = socket.set_tos(IPTOS_LOWDELAY) {
        log::warn!("UDP socket: set_tos: {}", e);
    }

    let addr = SockAddr::from(SocketAddrV4::new([0, 0, 0, 0].into(), port));
    socket.bind(&addr)?;
    socket.set_nonblocking(true)?;
    socket.set_broadcast(true)?;
    Ok(socket.into())
}

fn io_thread_loop(socket: UdpSocket, sender: PacketQueueSender, shutdown: Arc<AtomicBool>) {
    let mut buf = [0u8; MAX_MSGLEN * 4];
    while !shutdown.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                if len > MAX_MSGLEN {
                    continue;
                }
                let packet = QueuedPacket::new(NetAdr::Ip(from), buf[..len].to_vec(), sys_milliseconds());
                if !sender.try_send(packet) {
                    log::trace!("packet queue full, dropped packet from {}", from);
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::ConnectionReset
                ) => {}
            Err(e) => {
                log::warn!("net-io thread: {}", e);
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

impl NetTransport for UdpTransport {
    fn send_packet(&self, data: &[u8], to: &NetAdr) -> io::Result<()> {
        match to {
            NetAdr::Ip(sa) => self.socket.send_to(data, sa).map(|_| ()),
            NetAdr::Loopback(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "UDP transport cannot reach loopback addresses",
            )),
        }
    }

    fn get_packet(&self) -> Option<(NetAdr, Vec<u8>)> {
        match &self.io_thread {
            Some(io) => io.queue.try_recv().map(|p| (p.from, p.data)),
            None => self.recv_direct(),
        }
    }

    fn local_adr(&self) -> NetAdr {
        self.local
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        if let Some(io) = self.io_thread.as_mut() {
            io.shutdown.store(true, Ordering::Relaxed);
            if let Some(handle) = io.handle.take() {
                let _ = handle.join();
            }
        }
    }
}
