//! Outer transport adapter: raw IPv4, UDP, or a single TCP connection
//! carrying the multiplexed bundles.

mod checksum;
mod ipv4;
mod stream;

pub use stream::{FastStreamReader, StreamError, StreamEvent};

use crate::config::{
    Config, Mode, BUFSIZE, IPV4_HEADER_SIZE, TCP_HEADER_SIZE, UDP_HEADER_SIZE,
};
use crate::logger::{self, TraceFlags};
use std::io::{self, Write};
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream, UdpSocket};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("TCP stream desynchronised: separator announces {0} bytes")]
    TcpDesync(usize),
    #[error("TCP connection closed by the peer")]
    PeerClosed,
    #[error("no TCP connection established yet")]
    NotConnected,
}

/// One received item from the outer side.
#[derive(Debug)]
pub enum Inbound {
    /// A complete bundle to demultiplex.
    Muxed(Vec<u8>),
    /// A single Fast packet reassembled from the TCP byte stream.
    Packet { protocol: u8, payload: Vec<u8> },
    /// Arrived on the right socket but is not multiplexed traffic; it is
    /// forwarded verbatim to the inner interface.
    PassThrough(Vec<u8>),
    /// Nothing usable this readiness cycle (short TCP read).
    Pending,
}

enum Kind {
    Raw {
        socket: RawSocket,
        next_ip_id: u16,
    },
    Udp {
        socket: UdpSocket,
    },
    Tcp {
        stream: Option<TcpStream>,
        listener: Option<TcpListener>,
        reader: FastStreamReader,
        accepting: bool,
    },
}

/// The outer link. Sends are blocking; a slow TCP peer can stall the whole
/// loop inside `send_bundle`.
pub struct OuterTransport {
    kind: Kind,
    local: Ipv4Addr,
    remote: Ipv4Addr,
    port: u16,
    outer_protocol: u8,
}

impl OuterTransport {
    pub fn open(config: &Config, local: Ipv4Addr) -> Result<Self, TransportError> {
        let kind = match config.mode {
            Mode::Network => Kind::Raw {
                socket: RawSocket::open(config.flavor.outer_protocol(), &config.mux_ifname)?,
                next_ip_id: 0,
            },
            Mode::Udp => {
                let socket = UdpSocket::bind(SocketAddrV4::new(local, config.port))?;
                Kind::Udp { socket }
            }
            Mode::TcpClient => {
                let stream =
                    TcpStream::connect(SocketAddrV4::new(config.remote_ip, config.port))?;
                configure_tcp(&stream);
                logger::debug(
                    1,
                    TraceFlags::POLL,
                    format!(
                        "Successfully connected to the TCP server at {}:{}",
                        config.remote_ip, config.port
                    ),
                );
                Kind::Tcp {
                    stream: Some(stream),
                    listener: None,
                    reader: FastStreamReader::new(),
                    accepting: false,
                }
            }
            Mode::TcpServer => {
                let listener = TcpListener::bind(SocketAddrV4::new(local, config.port))?;
                Kind::Tcp {
                    stream: None,
                    listener: Some(listener),
                    reader: FastStreamReader::new(),
                    accepting: true,
                }
            }
        };
        Ok(Self {
            kind,
            local,
            remote: config.remote_ip,
            port: config.port,
            outer_protocol: config.flavor.outer_protocol(),
        })
    }

    /// The fd the scheduler watches: the welcoming socket until a client
    /// connects, the connection afterwards.
    pub fn pollable_fd(&self) -> RawFd {
        match &self.kind {
            Kind::Raw { socket, .. } => socket.as_raw_fd(),
            Kind::Udp { socket } => socket.as_raw_fd(),
            Kind::Tcp {
                stream, listener, ..
            } => match stream {
                Some(stream) => stream.as_raw_fd(),
                None => listener
                    .as_ref()
                    .map(|listener| listener.as_raw_fd())
                    .unwrap_or(-1),
            },
        }
    }

    pub fn awaiting_accept(&self) -> bool {
        matches!(&self.kind, Kind::Tcp { accepting: true, .. })
    }

    /// Accepts the first (and only) TCP client. The welcoming socket is
    /// never re-armed after this.
    pub fn accept_client(&mut self) -> io::Result<()> {
        if let Kind::Tcp {
            stream,
            listener,
            accepting,
            ..
        } = &mut self.kind
        {
            if let Some(listener) = listener.as_ref() {
                let (connection, peer) = listener.accept()?;
                configure_tcp(&connection);
                logger::debug(
                    1,
                    TraceFlags::POLL,
                    format!("TCP connection started by the client {peer}"),
                );
                *stream = Some(connection);
                *accepting = false;
            }
        }
        Ok(())
    }

    /// Sends one bundle, prepending whatever outer framing the mode needs.
    /// Returns the outer packet size in bytes, headers included.
    pub fn send_bundle(&mut self, bundle: &[u8]) -> Result<usize, TransportError> {
        match &mut self.kind {
            Kind::Raw { socket, next_ip_id } => {
                let packet = ipv4::build_outer_packet(
                    self.local,
                    self.remote,
                    self.outer_protocol,
                    *next_ip_id,
                    bundle,
                );
                *next_ip_id = next_ip_id.wrapping_add(1);
                socket.send_to(&packet, self.remote)?;
                Ok(packet.len())
            }
            Kind::Udp { socket } => {
                socket.send_to(bundle, SocketAddrV4::new(self.remote, self.port))?;
                Ok(bundle.len() + IPV4_HEADER_SIZE + UDP_HEADER_SIZE)
            }
            Kind::Tcp { stream, .. } => {
                let stream = stream.as_mut().ok_or(TransportError::NotConnected)?;
                stream.write_all(bundle)?;
                Ok(bundle.len() + IPV4_HEADER_SIZE + TCP_HEADER_SIZE)
            }
        }
    }

    /// Reads whatever the outer side has ready and classifies it.
    pub fn recv(&mut self, scratch: &mut [u8; BUFSIZE]) -> Result<Inbound, TransportError> {
        match &mut self.kind {
            Kind::Raw { socket, .. } => {
                let nread = socket.recv(scratch)?;
                if nread < IPV4_HEADER_SIZE {
                    return Ok(Inbound::Pending);
                }
                let packet = &scratch[..nread];
                match ipv4::strip_outer_header(packet, self.outer_protocol) {
                    Some(payload) => Ok(Inbound::Muxed(payload.to_vec())),
                    // Unexpected header shape or protocol: hand the bytes
                    // behind the fixed header to the inner interface.
                    None => Ok(Inbound::PassThrough(packet[IPV4_HEADER_SIZE..].to_vec())),
                }
            }
            Kind::Udp { socket } => {
                let (nread, source) = socket.recv_from(scratch)?;
                let datagram = scratch[..nread].to_vec();
                match source {
                    SocketAddr::V4(addr) if addr.port() == self.port => {
                        Ok(Inbound::Muxed(datagram))
                    }
                    _ => Ok(Inbound::PassThrough(datagram)),
                }
            }
            Kind::Tcp { stream, reader, .. } => {
                let stream = stream.as_mut().ok_or(TransportError::NotConnected)?;
                match reader.read_from(stream) {
                    Ok(StreamEvent::Packet { protocol, payload }) => {
                        Ok(Inbound::Packet { protocol, payload })
                    }
                    Ok(StreamEvent::Pending) => Ok(Inbound::Pending),
                    Ok(StreamEvent::Eof) => Err(TransportError::PeerClosed),
                    Err(StreamError::Desync(length)) => Err(TransportError::TcpDesync(length)),
                    Err(StreamError::Io(err)) => Err(TransportError::Io(err)),
                }
            }
        }
    }
}

fn configure_tcp(stream: &TcpStream) {
    // A muxed segment should leave as soon as it is built.
    let _ = stream.set_nodelay(true);
    #[cfg(target_os = "linux")]
    {
        let flag: libc::c_int = 1;
        let _ = unsafe {
            libc::setsockopt(
                stream.as_raw_fd(),
                libc::IPPROTO_TCP,
                libc::TCP_QUICKACK,
                &flag as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
    }
}

struct RawSocket {
    fd: OwnedFd,
}

impl RawSocket {
    fn open(protocol: u8, ifname: &str) -> io::Result<Self> {
        let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_RAW, i32::from(protocol)) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // The IPv4 header is built here, not by the kernel.
        let on: libc::c_int = 1;
        let status = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::IPPROTO_IP,
                libc::IP_HDRINCL,
                &on as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if status < 0 {
            return Err(io::Error::last_os_error());
        }

        if !ifname.is_empty() {
            let status = unsafe {
                libc::setsockopt(
                    fd.as_raw_fd(),
                    libc::SOL_SOCKET,
                    libc::SO_BINDTODEVICE,
                    ifname.as_ptr() as *const libc::c_void,
                    ifname.len() as libc::socklen_t,
                )
            };
            if status < 0 {
                return Err(io::Error::last_os_error());
            }
        }

        Ok(Self { fd })
    }

    fn send_to(&self, packet: &[u8], dst: Ipv4Addr) -> io::Result<usize> {
        let addr = sockaddr_in_for(dst, 0);
        let sent = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                packet.as_ptr() as *const libc::c_void,
                packet.len(),
                0,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(sent as usize)
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let nread = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if nread < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(nread as usize)
    }
}

impl AsRawFd for RawSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

fn sockaddr_in_for(addr: Ipv4Addr, port: u16) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from(addr).to_be(),
        },
        sin_zero: [0; 8],
    }
}

/// The UDP socket of the ROHC feedback channel, bound like the muxing
/// socket but on the feedback port.
pub fn open_feedback_socket(local: Ipv4Addr, port: u16) -> io::Result<UdpSocket> {
    UdpSocket::bind(SocketAddrV4::new(local, port))
}

fn ifreq_for(name: &str) -> io::Result<libc::ifreq> {
    if name.is_empty() || name.len() >= libc::IFNAMSIZ {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "bad interface name",
        ));
    }
    let mut ifreq: libc::ifreq = unsafe { mem::zeroed() };
    for (index, byte) in name.as_bytes().iter().enumerate() {
        ifreq.ifr_name[index] = *byte as libc::c_char;
    }
    Ok(ifreq)
}

/// MTU of a local interface, via `SIOCGIFMTU`.
pub fn interface_mtu(name: &str) -> io::Result<usize> {
    let probe = UdpSocket::bind("0.0.0.0:0")?;
    let mut ifreq = ifreq_for(name)?;
    let status = unsafe { libc::ioctl(probe.as_raw_fd(), libc::SIOCGIFMTU, &mut ifreq) };
    if status < 0 {
        return Err(io::Error::last_os_error());
    }
    let mtu = unsafe { ifreq.ifr_ifru.ifru_mtu };
    Ok(mtu.max(0) as usize)
}

/// First IPv4 address of a local interface, via `SIOCGIFADDR`.
pub fn interface_ipv4(name: &str) -> io::Result<Ipv4Addr> {
    let probe = UdpSocket::bind("0.0.0.0:0")?;
    let mut ifreq = ifreq_for(name)?;
    let status = unsafe { libc::ioctl(probe.as_raw_fd(), libc::SIOCGIFADDR, &mut ifreq) };
    if status < 0 {
        return Err(io::Error::last_os_error());
    }
    let sockaddr = unsafe { &ifreq.ifr_ifru.ifru_addr };
    if i32::from(sockaddr.sa_family) != libc::AF_INET {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "interface has no IPv4 address",
        ));
    }
    let sin = unsafe { &*(sockaddr as *const libc::sockaddr as *const libc::sockaddr_in) };
    Ok(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)))
}
