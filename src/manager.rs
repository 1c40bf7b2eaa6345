//! The session table and the socket side effects of creating and closing sessions.

use std::io;
use std::net::{Shutdown, SocketAddr, SocketAddrV6};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::config::SessionConf;
use crate::flow::{Direction, FlowSink, TracingFlowSink};
use crate::packet::IpAddress;
use crate::session::{Session, SessionKey, SessionProtocol, SessionState};

/// Outcome of a create call.
#[derive(Debug, Clone)]
pub enum Opened {
    /// A socket was opened and the session inserted.
    New(Arc<Session>),
    /// The key was already in the table; the session is returned unchanged.
    Existing(Arc<Session>),
}

impl Opened {
    pub fn session(&self) -> &Arc<Session> {
        match self {
            Self::New(session) | Self::Existing(session) => session,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::New(_))
    }

    pub fn into_session(self) -> Arc<Session> {
        match self {
            Self::New(session) | Self::Existing(session) => session,
        }
    }
}

pub struct SessionManager {
    table: DashMap<SessionKey, Arc<Session>>,
    conf: SessionConf,
    flow_sink: Arc<dyn FlowSink>,
}

impl SessionManager {
    pub fn new(conf: SessionConf) -> Self {
        Self {
            table: DashMap::new(),
            conf,
            flow_sink: Arc::new(TracingFlowSink),
        }
    }

    pub fn with_flow_sink(mut self, flow_sink: Arc<dyn FlowSink>) -> Self {
        self.flow_sink = flow_sink;
        self
    }

    pub fn flow_sink(&self) -> &Arc<dyn FlowSink> {
        &self.flow_sink
    }

    pub fn get_session(
        &self,
        protocol: SessionProtocol,
        destination: IpAddress,
        destination_port: u16,
        source: IpAddress,
        source_port: u16,
    ) -> Option<Arc<Session>> {
        let key = SessionKey::new(protocol, destination, destination_port, source, source_port);
        self.get_session_by_key(&key)
    }

    pub fn get_session_by_key(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.table.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Opens a non-blocking connection towards `key`'s destination (or its port redirection).
    ///
    /// An existing session for `key` is returned untouched: the caller received a duplicate
    /// SYN and must not handshake again. `packet_len` is the IP length of the SYN and is
    /// counted as the flow's first egress packet.
    pub fn create_tcp_session(&self, key: SessionKey, packet_len: usize) -> io::Result<Opened> {
        debug_assert_eq!(key.protocol, SessionProtocol::Tcp);
        let session = match self.table.entry(key) {
            Entry::Occupied(entry) => return Ok(Opened::Existing(Arc::clone(entry.get()))),
            Entry::Vacant(entry) => {
                let target = self
                    .conf
                    .redirection_for(key.destination_port)
                    .unwrap_or_else(|| SocketAddr::new(key.destination.to_std(), key.destination_port));
                debug!(%key, %target, "connecting outbound TCP socket");
                let (socket, connected) = self.open_tcp_socket(target)?;

                let session = Arc::new(Session::new(key, Some(socket)));
                {
                    let mut state = session.lock();
                    state.set_connected(connected);
                    state.flow_mut().record(Direction::Egress, packet_len);
                }
                session.touch();
                entry.insert(Arc::clone(&session));
                session
            }
        };
        self.flow_sink.flow_created(session.lock().flow());
        info!(key = %session.key(), "created TCP session");
        Ok(Opened::New(session))
    }

    /// Opens a connected, non-blocking datagram socket towards `key`'s destination.
    ///
    /// Unlike TCP, finding an existing session is the normal case for every datagram after the
    /// first.
    pub fn create_udp_session(&self, key: SessionKey, packet_len: usize) -> io::Result<Opened> {
        debug_assert_eq!(key.protocol, SessionProtocol::Udp);
        let session = match self.table.entry(key) {
            Entry::Occupied(entry) => return Ok(Opened::Existing(Arc::clone(entry.get()))),
            Entry::Vacant(entry) => {
                let target = self.udp_address(&key.destination, key.destination_port);
                let socket = open_udp_socket(target)?;

                let session = Arc::new(Session::new(key, Some(socket)));
                {
                    let mut state = session.lock();
                    state.set_connected(true);
                    state.flow_mut().record(Direction::Egress, packet_len);
                }
                session.touch();
                entry.insert(Arc::clone(&session));
                session
            }
        };
        self.flow_sink.flow_created(session.lock().flow());
        debug!(key = %session.key(), "created UDP session");
        Ok(Opened::New(session))
    }

    /// Queues client payload for the real socket. Returns the number of bytes taken.
    pub fn add_client_data(&self, state: &mut SessionState, payload: &[u8]) -> usize {
        state.append_outbound(payload)
    }

    /// Refreshes liveness, but only while `session` is still the table's entry.
    pub fn keep_alive(&self, session: &Arc<Session>) {
        if let Some(entry) = self.table.get(session.key()) {
            if Arc::ptr_eq(entry.value(), session) {
                session.touch();
            }
        }
    }

    /// Removes the entry and closes its socket. Returns false if the key was not present.
    pub fn close_session_by_key(&self, key: &SessionKey) -> bool {
        let Some((_, session)) = self.table.remove(key) else {
            return false;
        };
        if let Some(socket) = session.take_socket() {
            if let Err(err) = socket.shutdown(Shutdown::Both) {
                debug!(%key, %err, "ignoring error while closing session socket");
            }
        }
        debug!(%key, "closed session");
        true
    }

    pub fn close_session(&self, session: &Session) -> bool {
        self.close_session_by_key(session.key())
    }

    /// Point-in-time copy of the table, for sweeps.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.table.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    fn open_tcp_socket(&self, target: SocketAddr) -> io::Result<(Socket, bool)> {
        let socket = Socket::new(Domain::for_address(target), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_keepalive(true)?;
        socket.set_nodelay(true)?;
        if let Err(err) = socket.set_recv_buffer_size(self.conf.receive_buffer_size) {
            warn!(%err, "could not set receive buffer size");
        }
        socket.set_nonblocking(true)?;

        match socket.connect(&target.into()) {
            Ok(()) => Ok((socket, true)),
            Err(err) if connect_in_progress(&err) => Ok((socket, false)),
            Err(err) => Err(err),
        }
    }

    /// Link-local IPv6 destinations need a scope to be routable; use the configured one.
    fn udp_address(&self, ip: &IpAddress, port: u16) -> SocketAddr {
        match ip {
            IpAddress::V6(octets) if ip.is_ipv6_link_local() && self.conf.link_local_scope_id != 0 => {
                SocketAddr::V6(SocketAddrV6::new(
                    (*octets).into(),
                    port,
                    0,
                    self.conf.link_local_scope_id,
                ))
            }
            _ => SocketAddr::new(ip.to_std(), port),
        }
    }
}

fn open_udp_socket(target: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(target), Type::DGRAM, Some(Protocol::UDP))?;
    if target.is_ipv4() {
        socket.set_broadcast(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.connect(&target.into())?;
    Ok(socket)
}

pub(crate) fn connect_in_progress(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EINPROGRESS)
}
