//! Multicast UDP transport.
//!
//! Sockets are created through `socket2` so `SO_REUSEADDR` can be set before
//! binding: the external process listens on the same group and port.
//!
//! On Unix the receive socket is bound to the group address itself rather
//! than the wildcard address. Linux delivers a multicast datagram to every
//! wildcard-bound socket on the port once any socket on the host joined the
//! group, so binding to the group is what keeps concurrent sessions apart.

use crate::allocator::MulticastAddress;
use crate::config::NetworkConfig;
use crate::error::Result;
use crate::proto::WrapperPacket;
use prost::Message as ProstMessage;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Largest datagram we accept (UDP maximum)
pub const MAX_DATAGRAM_SIZE: usize = 65536;

/// Shortest read timeout; a zero timeout is rejected by the OS
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// Anything that can emit wrapper packets.
pub trait PacketSink {
    /// Send one packet. Best effort: no acknowledgment.
    fn send(&self, packet: &WrapperPacket) -> Result<()>;
}

/// UDP socket attached to one multicast group.
pub struct MulticastSocket {
    socket: UdpSocket,
    address: MulticastAddress,
    interface: Ipv4Addr,
    joined: AtomicBool,
}

impl MulticastSocket {
    /// Bind, join the group and prepare the send path to the same group.
    pub fn open(address: MulticastAddress, config: &NetworkConfig) -> Result<Self> {
        let socket = new_socket(config)?;

        let bind_ip = if cfg!(unix) {
            address.ip
        } else {
            Ipv4Addr::UNSPECIFIED
        };
        let bind_addr = SocketAddr::V4(SocketAddrV4::new(bind_ip, address.port));
        socket.bind(&SockAddr::from(bind_addr))?;

        let socket: UdpSocket = socket.into();
        socket.join_multicast_v4(&address.ip, &config.interface)?;
        socket.set_read_timeout(Some(config.recv_timeout().max(MIN_READ_TIMEOUT)))?;

        log::debug!("Joined {} on interface {}", address, config.interface);

        Ok(Self {
            socket,
            address,
            interface: config.interface,
            joined: AtomicBool::new(true),
        })
    }

    /// Send-only socket on an ephemeral port (no group membership).
    pub fn sender(address: MulticastAddress, config: &NetworkConfig) -> Result<Self> {
        let socket = new_socket(config)?;
        let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
        socket.bind(&SockAddr::from(bind_addr))?;

        Ok(Self {
            socket: socket.into(),
            address,
            interface: config.interface,
            joined: AtomicBool::new(false),
        })
    }

    pub fn address(&self) -> MulticastAddress {
        self.address
    }

    /// Send raw bytes as one datagram to the group
    pub fn send_bytes(&self, bytes: &[u8]) -> Result<()> {
        self.socket.send_to(bytes, self.address.socket_addr())?;
        Ok(())
    }

    /// Receive one datagram. `None` when the read timed out.
    pub fn recv(&self, buffer: &mut [u8]) -> Result<Option<usize>> {
        match self.socket.recv_from(buffer) {
            Ok((len, _src)) => Ok(Some(len)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Switch between blocking-with-timeout and non-blocking reads
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.socket.set_nonblocking(nonblocking)?;
        Ok(())
    }

    /// Leave the multicast group. Safe to call more than once.
    pub fn leave(&self) {
        if self.joined.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.socket.leave_multicast_v4(&self.address.ip, &self.interface) {
                log::warn!("Failed to leave multicast group {}: {}", self.address, e);
            } else {
                log::debug!("Left {}", self.address);
            }
        }
    }
}

impl PacketSink for MulticastSocket {
    fn send(&self, packet: &WrapperPacket) -> Result<()> {
        self.send_bytes(&packet.encode_to_vec())
    }
}

impl Drop for MulticastSocket {
    fn drop(&mut self) {
        self.leave();
    }
}

fn new_socket(config: &NetworkConfig) -> Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_multicast_ttl_v4(config.ttl)?;
    if !config.interface.is_unspecified() {
        socket.set_multicast_if_v4(&config.interface)?;
    }
    Ok(socket)
}
