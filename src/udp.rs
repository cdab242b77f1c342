//! Mesh emulation over localhost UDP.
//!
//! Mesh address `a` is the UDP port `port_base + a` on 127.0.0.1. Until a
//! mode is chosen the node sits on an ephemeral port, so any number of nodes
//! can start against the same port base.
//!
//! Datagram layout:
//! - \[0..2\]: source mesh address, little-endian
//! - \[2..\]:  envelope, at most [`MAX_PAYLOAD_SIZE`] bytes

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};

use tracing::{info, trace, warn};

use crate::transport::{ConfirmStatus, DataRequest, MeshTransport, TransportEvent};
use crate::types::{Result, LISTENER_ADDRESS, MAX_PAYLOAD_SIZE};

/// Size of the source address prefix.
pub const UDP_HEADER_SIZE: usize = 2;

/// Receive buffer size. Anything that fills it is oversized by definition.
const RECV_BUFFER_SIZE: usize = 2048;

/// A node attached to the UDP mesh emulation.
#[derive(Debug)]
pub struct UdpMesh {
    socket: UdpSocket,
    port_base: u16,
    address: Option<u16>,
    events: VecDeque<TransportEvent>,
}

impl UdpMesh {
    /// Opens an unbound node on an ephemeral port.
    pub fn new(port_base: u16) -> Result<Self> {
        Ok(Self {
            socket: bind_socket(0)?,
            port_base,
            address: None,
            events: VecDeque::new(),
        })
    }

    /// True once the node holds a mesh address.
    pub fn is_bound(&self) -> bool {
        self.address.is_some()
    }

    /// UDP port of a mesh address.
    pub fn port_of(&self, address: u16) -> u16 {
        self.port_base.wrapping_add(address)
    }

    fn handle_datagram(&mut self, datagram: &[u8]) {
        if datagram.len() < UDP_HEADER_SIZE {
            warn!(len = datagram.len(), "Runt datagram");
            return;
        }
        if datagram.len() > UDP_HEADER_SIZE + MAX_PAYLOAD_SIZE {
            warn!(len = datagram.len(), max = UDP_HEADER_SIZE + MAX_PAYLOAD_SIZE, "Oversized datagram");
            return;
        }

        let src_addr = u16::from_le_bytes([datagram[0], datagram[1]]);
        self.events.push_back(TransportEvent::Indication {
            src_addr,
            data: datagram[UDP_HEADER_SIZE..].to_vec(),
        });
    }
}

fn bind_socket(port: u16) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

impl MeshTransport for UdpMesh {
    fn send(&mut self, request: DataRequest) -> Result<()> {
        let mut datagram = Vec::with_capacity(UDP_HEADER_SIZE + request.data.len());
        datagram.extend_from_slice(&self.local_address().to_le_bytes());
        datagram.extend_from_slice(&request.data);

        let target = SocketAddrV4::new(Ipv4Addr::LOCALHOST, self.port_of(request.dst_addr));
        let status = match self.socket.send_to(&datagram, target) {
            Ok(_) => ConfirmStatus::Success,
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => ConfirmStatus::NoRoute,
            Err(e) => {
                warn!(error = %e, dst_addr = request.dst_addr, "UDP send failed");
                ConfirmStatus::Error
            }
        };
        self.events.push_back(TransportEvent::Confirm(status));
        Ok(())
    }

    /// Binds the port of `address`. On failure the previous socket and
    /// address are kept.
    fn set_local_address(&mut self, address: u16) -> Result<()> {
        if self.address == Some(address) {
            return Ok(());
        }
        let port = self.port_of(address);
        self.socket = bind_socket(port).map_err(|e| {
            warn!(address, port, error = %e, "Cannot take mesh address");
            e
        })?;
        self.address = Some(address);
        info!(address, port, "Mesh address changed");
        Ok(())
    }

    /// The bound address, or the listener address while unbound.
    fn local_address(&self) -> u16 {
        self.address.unwrap_or(LISTENER_ADDRESS)
    }

    fn poll(&mut self) -> Vec<TransportEvent> {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    trace!(%from, len, "UDP datagram");
                    self.handle_datagram(&buf[..len]);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "UDP receive failed");
                    break;
                }
            }
        }
        self.events.drain(..).collect()
    }
}
