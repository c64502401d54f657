//! Datagram media
//!
//! A medium moves whole datagrams between agents. The receive pipeline is
//! written once against the `Medium` trait and runs unchanged over UDP
//! multicast, UDP broadcast, or the in-process loopback network.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex};

/// Kind of UDP medium
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediumKind {
    #[default]
    Multicast,
    Broadcast,
}

/// A datagram transport shared by the send path and the receive task
#[async_trait]
pub trait Medium: Send + Sync + 'static {
    /// Short name used in log lines
    fn name(&self) -> &str;

    /// Identity to stamp as originator when none is configured
    fn local_identity(&self) -> String;

    /// Wait for the next datagram. Datagrams longer than `buf` are truncated.
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Send one datagram to every listener on the medium
    async fn send(&self, datagram: &[u8]) -> io::Result<usize>;
}

/// Bind a UDP socket on `port` that other sockets on this host may share
fn bind_shared(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    UdpSocket::from_std(socket.into())
}

/// IPv4 address of every local interface
fn ipv4_interfaces() -> Vec<Ipv4Addr> {
    let interfaces = match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            tracing::debug!("Failed to list interfaces: {}", e);
            return Vec::new();
        }
    };

    let mut addrs: Vec<Ipv4Addr> = interfaces
        .iter()
        .filter_map(|iface| match iface.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .collect();
    addrs.sort();
    addrs.dedup();
    addrs
}

/// Join `group` on every IPv4 interface. Falls back to the default
/// interface when no per-interface join succeeds.
fn join_all_interfaces(socket: &UdpSocket, group: Ipv4Addr) -> io::Result<Vec<Ipv4Addr>> {
    let mut joined = Vec::new();
    for interface in ipv4_interfaces() {
        match socket.join_multicast_v4(group, interface) {
            Ok(()) => joined.push(interface),
            Err(e) => tracing::debug!("Could not join {} on {}: {}", group, interface, e),
        }
    }

    if joined.is_empty() {
        socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
        joined.push(Ipv4Addr::UNSPECIFIED);
    }
    Ok(joined)
}

/// UDP multicast or broadcast medium.
///
/// Owns two sockets: one bound to the group port for receiving and one
/// bound to an ephemeral port for sending. Both close when the medium drops.
/// The receive socket is bound with address reuse so several agents on one
/// host can listen on the same group port.
pub struct UdpMedium {
    kind: MediumKind,
    group: SocketAddrV4,
    /// Interfaces the group was joined on
    joined: Vec<Ipv4Addr>,
    recv_socket: UdpSocket,
    send_socket: UdpSocket,
    name: String,
}

impl UdpMedium {
    /// Bind both sockets and join the group.
    ///
    /// `hops` is the IP multicast TTL; it is unrelated to the rebroadcast
    /// TTL carried in message headers.
    pub async fn open(kind: MediumKind, group: SocketAddr, hops: u32) -> io::Result<Self> {
        let group = match group {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(addr) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("IPv6 group {} is not supported", addr),
                ));
            }
        };

        if kind == MediumKind::Multicast && !group.ip().is_multicast() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a multicast address", group.ip()),
            ));
        }

        let recv_socket = bind_shared(group.port())?;
        let send_socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;

        let joined = match kind {
            MediumKind::Multicast => {
                let joined = join_all_interfaces(&recv_socket, *group.ip())?;
                send_socket.set_multicast_ttl_v4(hops)?;
                send_socket.set_multicast_loop_v4(true)?;
                tracing::info!(
                    "Joined multicast group {} on {} interfaces",
                    group,
                    joined.len()
                );
                joined
            }
            MediumKind::Broadcast => {
                send_socket.set_broadcast(true)?;
                tracing::info!("Listening for broadcasts on port {}", group.port());
                Vec::new()
            }
        };

        Ok(Self {
            kind,
            group,
            joined,
            recv_socket,
            send_socket,
            name: format!("udp-{:?}", kind).to_lowercase(),
        })
    }

    pub fn group(&self) -> SocketAddrV4 {
        self.group
    }

    pub fn kind(&self) -> MediumKind {
        self.kind
    }
}

#[async_trait]
impl Medium for UdpMedium {
    fn name(&self) -> &str {
        &self.name
    }

    /// host:port of the sending socket
    fn local_identity(&self) -> String {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "localhost".to_string());
        let port = self
            .send_socket
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(0);
        format!("{}:{}", host, port)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.recv_socket.recv_from(buf).await
    }

    async fn send(&self, datagram: &[u8]) -> io::Result<usize> {
        self.send_socket
            .send_to(datagram, SocketAddr::V4(self.group))
            .await
    }
}

impl Drop for UdpMedium {
    fn drop(&mut self) {
        for interface in &self.joined {
            if let Err(e) = self
                .recv_socket
                .leave_multicast_v4(*self.group.ip(), *interface)
            {
                tracing::debug!(
                    "Failed to leave multicast group {} on {}: {}",
                    self.group,
                    interface,
                    e
                );
            }
        }
        tracing::debug!("Closed {} sockets for {}", self.name, self.group);
    }
}

type Packet = (SocketAddr, Bytes);

/// In-process network connecting loopback media.
///
/// Every datagram sent by any attached medium, including the sender itself,
/// is delivered to every attached medium, the way multicast loopback does.
#[derive(Clone, Debug)]
pub struct LoopbackNetwork {
    tx: broadcast::Sender<Packet>,
    next_port: Arc<AtomicU16>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self {
            tx: broadcast::channel(1024).0,
            next_port: Arc::new(AtomicU16::new(40000)),
        }
    }

    /// Attach a medium with a generated name
    pub fn attach(&self) -> LoopbackMedium {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.attach_named(&format!("node-{}", &id[..8]))
    }

    /// Attach a medium whose identity is `name`
    pub fn attach_named(&self, name: &str) -> LoopbackMedium {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        LoopbackMedium {
            name: name.to_string(),
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            tx: self.tx.clone(),
            rx: Mutex::new(self.tx.subscribe()),
        }
    }

    /// Put raw bytes on the network as if `from` had sent them
    pub fn inject(&self, from: SocketAddr, datagram: &[u8]) {
        let _ = self.tx.send((from, Bytes::copy_from_slice(datagram)));
    }
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// One agent's attachment to a `LoopbackNetwork`
pub struct LoopbackMedium {
    name: String,
    addr: SocketAddr,
    tx: broadcast::Sender<Packet>,
    rx: Mutex<broadcast::Receiver<Packet>>,
}

impl LoopbackMedium {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl Medium for LoopbackMedium {
    fn name(&self) -> &str {
        &self.name
    }

    fn local_identity(&self) -> String {
        self.name.clone()
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut rx = self.rx.lock().await;
        loop {
            match rx.recv().await {
                Ok((from, data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    return Ok((n, from));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("{} lagged, {} datagrams lost", self.name, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "loopback network closed",
                    ));
                }
            }
        }
    }

    async fn send(&self, datagram: &[u8]) -> io::Result<usize> {
        self.tx
            .send((self.addr, Bytes::copy_from_slice(datagram)))
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "no loopback listeners"))?;
        Ok(datagram.len())
    }
}
