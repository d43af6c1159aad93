//! Control-plane transport for session management.
//!
//! The SM thread is generic over [`SmTransport`], which reports connect,
//! receive and disconnect events and sends packets to connected peers.
//! [`UdpSmTransport`] is the default backend: one UDP socket per process,
//! with a small handshake in which each side declares its host name.

use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use slab::Slab;
use tracing::{debug, trace, warn};

use crate::config::UdpSmConfig;
use crate::error::{Error, Result};
use crate::sm::{PeerId, SmPkt};

/// An event reported by a control-plane transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmEvent {
    /// A connection finished its handshake, in either direction.
    Connect(PeerId),
    /// A packet arrived on a connection.
    Receive { peer: PeerId, pkt: SmPkt },
    /// A connection was closed by the peer or failed to establish.
    Disconnect(PeerId),
}

/// Capabilities the SM thread needs from a control-plane transport.
pub trait SmTransport: Send + 'static {
    /// Wait up to `timeout` for the next event. A zero timeout only polls.
    fn service(&mut self, timeout: Duration) -> Result<Option<SmEvent>>;

    /// Start connecting to `hostname`.
    ///
    /// Returns the handle of the new (or existing) connection. A `Connect` or
    /// `Disconnect` event for it follows from `service`.
    fn connect(&mut self, hostname: &str) -> Result<PeerId>;

    /// Send a packet on a connected peer.
    fn send(&mut self, peer: PeerId, pkt: &SmPkt) -> Result<()>;

    /// Port the transport listens on.
    fn local_port(&self) -> u16;
}

const FRAME_HELLO: u8 = 0;
const FRAME_HELLO_ACK: u8 = 1;
const FRAME_DATA: u8 = 2;
const FRAME_BYE: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UdpPeerState {
    Connecting,
    Connected,
}

#[derive(Debug)]
struct UdpPeer {
    addr: SocketAddr,
    /// Declared name of the remote host, known once it said hello.
    rem_hostname: Option<String>,
    state: UdpPeerState,
    started: Instant,
    last_hello: Instant,
}

/// UDP session management transport.
pub struct UdpSmTransport {
    socket: UdpSocket,
    hostname: String,
    port: u16,
    config: UdpSmConfig,
    peers: Slab<UdpPeer>,
    addr_map: HashMap<SocketAddr, PeerId>,
    events: VecDeque<SmEvent>,
    recv_buf: Vec<u8>,
    send_buf: Vec<u8>,
    /// Read timeout currently set on the socket; None means nonblocking.
    cur_timeout: Option<Duration>,
}

impl UdpSmTransport {
    /// Bind the session management socket on `port` (0 for ephemeral).
    pub fn bind(hostname: &str, port: u16, config: UdpSmConfig) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).map_err(|source| Error::Bind { port, source })?;
        let port = socket.local_addr()?.port();
        debug!(hostname, port, "bound session management socket");

        Ok(Self {
            socket,
            hostname: hostname.to_string(),
            port,
            recv_buf: vec![0u8; config.max_pkt_size],
            config,
            peers: Slab::new(),
            addr_map: HashMap::new(),
            events: VecDeque::new(),
            send_buf: Vec::new(),
            cur_timeout: Some(Duration::ZERO),
        })
    }

    /// Declared host name of a peer, if it has completed a handshake.
    pub fn peer_hostname(&self, peer: PeerId) -> Option<&str> {
        self.peers.get(peer.0)?.rem_hostname.as_deref()
    }

    /// Number of known connections, pending or established.
    pub fn num_peers(&self) -> usize {
        self.peers.len()
    }

    fn resolve(&self, hostname: &str) -> Result<SocketAddr> {
        if let Ok(addr) = hostname.parse::<SocketAddr>() {
            return Ok(addr);
        }
        // Every Nexus in the cluster listens on the same port.
        (hostname, self.port)
            .to_socket_addrs()?
            .find(|a| a.is_ipv4())
            .ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    ErrorKind::NotFound,
                    format!("no IPv4 address for {}", hostname),
                ))
            })
    }

    fn send_frame(&mut self, addr: SocketAddr, frame_type: u8, pkt: Option<&SmPkt>) -> Result<()> {
        self.send_buf.clear();
        self.send_buf.push(frame_type);
        match (frame_type, pkt) {
            (FRAME_DATA, Some(pkt)) => pkt.encode(&mut self.send_buf),
            (FRAME_HELLO | FRAME_HELLO_ACK, _) => self.send_buf.extend_from_slice(self.hostname.as_bytes()),
            _ => {}
        }
        self.socket.send_to(&self.send_buf, addr)?;
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        let want = (!timeout.is_zero()).then_some(timeout);
        if want == self.cur_timeout {
            return Ok(());
        }
        match want {
            None => self.socket.set_nonblocking(true)?,
            Some(t) => {
                self.socket.set_nonblocking(false)?;
                self.socket.set_read_timeout(Some(t))?;
            }
        }
        self.cur_timeout = want;
        Ok(())
    }

    /// Retransmit hellos to pending peers and expire those that timed out.
    fn check_pending(&mut self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut retry = Vec::new();
        for (key, peer) in self.peers.iter_mut() {
            if peer.state != UdpPeerState::Connecting {
                continue;
            }
            if now.duration_since(peer.started) >= self.config.connect_timeout {
                expired.push(key);
            } else if now.duration_since(peer.last_hello) >= self.config.connect_retry {
                peer.last_hello = now;
                retry.push(peer.addr);
            }
        }

        for addr in retry {
            if let Err(e) = self.send_frame(addr, FRAME_HELLO, None) {
                warn!(%addr, error = %e, "failed to retransmit hello");
            }
        }
        for key in expired {
            let peer = self.peers.remove(key);
            self.addr_map.remove(&peer.addr);
            debug!(addr = %peer.addr, "connect timed out");
            self.events.push_back(SmEvent::Disconnect(PeerId(key)));
        }
    }

    fn handle_datagram(&mut self, addr: SocketAddr, len: usize) {
        if len == 0 {
            return;
        }
        let frame_type = self.recv_buf[0];
        let body = &self.recv_buf[1..len];
        let known = self.addr_map.get(&addr).copied();

        match frame_type {
            FRAME_HELLO | FRAME_HELLO_ACK => {
                let rem_hostname = String::from_utf8_lossy(body).into_owned();
                let peer_id = match known {
                    Some(peer_id) => {
                        let peer = &mut self.peers[peer_id.0];
                        if peer.state == UdpPeerState::Connecting {
                            peer.state = UdpPeerState::Connected;
                            peer.rem_hostname = Some(rem_hostname);
                            self.events.push_back(SmEvent::Connect(peer_id));
                        }
                        peer_id
                    }
                    None if frame_type == FRAME_HELLO => {
                        let now = Instant::now();
                        let key = self.peers.insert(UdpPeer {
                            addr,
                            rem_hostname: Some(rem_hostname),
                            state: UdpPeerState::Connected,
                            started: now,
                            last_hello: now,
                        });
                        self.addr_map.insert(addr, PeerId(key));
                        self.events.push_back(SmEvent::Connect(PeerId(key)));
                        PeerId(key)
                    }
                    None => {
                        trace!(%addr, "ignoring hello ack from unknown address");
                        return;
                    }
                };
                if frame_type == FRAME_HELLO
                    && let Err(e) = self.send_frame(addr, FRAME_HELLO_ACK, None)
                {
                    warn!(%addr, ?peer_id, error = %e, "failed to acknowledge hello");
                }
            }
            FRAME_DATA => {
                let Some(peer) = known.filter(|p| self.peers[p.0].state == UdpPeerState::Connected) else {
                    warn!(%addr, "dropping SM packet from unconnected address");
                    return;
                };
                match SmPkt::decode(body) {
                    Ok(pkt) => self.events.push_back(SmEvent::Receive { peer, pkt }),
                    Err(e) => warn!(%addr, error = %e, "dropping malformed SM packet"),
                }
            }
            FRAME_BYE => {
                if let Some(peer) = known {
                    self.peers.remove(peer.0);
                    self.addr_map.remove(&addr);
                    self.events.push_back(SmEvent::Disconnect(peer));
                }
            }
            other => warn!(%addr, frame_type = other, "unknown control-plane frame"),
        }
    }
}

impl SmTransport for UdpSmTransport {
    fn service(&mut self, timeout: Duration) -> Result<Option<SmEvent>> {
        if let Some(event) = self.events.pop_front() {
            return Ok(Some(event));
        }
        self.check_pending();
        if let Some(event) = self.events.pop_front() {
            return Ok(Some(event));
        }

        // Wake up in time for the next hello retransmission.
        let mut wait = timeout;
        if self.peers.iter().any(|(_, p)| p.state == UdpPeerState::Connecting) {
            wait = wait.min(self.config.connect_retry);
        }
        self.set_timeout(wait)?;

        match self.socket.recv_from(&mut self.recv_buf) {
            Ok((len, addr)) => self.handle_datagram(addr, len),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                self.check_pending();
            }
            // ICMP port unreachable from an earlier send surfaces here on some
            // platforms; the connect timeout covers the peer.
            Err(e) if e.kind() == ErrorKind::ConnectionReset => {}
            Err(e) => return Err(e.into()),
        }
        Ok(self.events.pop_front())
    }

    fn connect(&mut self, hostname: &str) -> Result<PeerId> {
        let addr = self.resolve(hostname)?;
        if let Some(&peer) = self.addr_map.get(&addr) {
            if self.peers[peer.0].state == UdpPeerState::Connected {
                self.events.push_back(SmEvent::Connect(peer));
            }
            return Ok(peer);
        }

        let now = Instant::now();
        let key = self.peers.insert(UdpPeer {
            addr,
            rem_hostname: None,
            state: UdpPeerState::Connecting,
            started: now,
            last_hello: now,
        });
        self.addr_map.insert(addr, PeerId(key));
        debug!(hostname, %addr, peer = key, "connecting");
        if let Err(e) = self.send_frame(addr, FRAME_HELLO, None) {
            // Retransmission retries until the connect timeout.
            warn!(%addr, error = %e, "failed to send hello");
        }
        Ok(PeerId(key))
    }

    fn send(&mut self, peer: PeerId, pkt: &SmPkt) -> Result<()> {
        let addr = match self.peers.get(peer.0) {
            Some(p) if p.state == UdpPeerState::Connected => p.addr,
            _ => {
                return Err(Error::Io(std::io::Error::new(
                    ErrorKind::NotConnected,
                    format!("peer {} is not connected", peer.0),
                )));
            }
        };
        if pkt.encoded_len() + 1 > self.config.max_pkt_size {
            return Err(Error::InvalidSmPacket(format!(
                "{} bytes exceeds max_pkt_size {}",
                pkt.encoded_len() + 1,
                self.config.max_pkt_size
            )));
        }
        self.send_frame(addr, FRAME_DATA, Some(pkt))
    }

    fn local_port(&self) -> u16 {
        self.port
    }
}

impl Drop for UdpSmTransport {
    fn drop(&mut self) {
        let addrs: Vec<_> = self
            .peers
            .iter()
            .filter(|(_, p)| p.state == UdpPeerState::Connected)
            .map(|(_, p)| p.addr)
            .collect();
        for addr in addrs {
            let _ = self.send_frame(addr, FRAME_BYE, None);
        }
    }
}
