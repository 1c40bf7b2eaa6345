//! A simple polling [`SocketMultiplexer`]: one thread walks every registered session,
//! flushes buffered client data, reads the real sockets and evicts idle sessions.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use dashmap::DashMap;
use socket2::Socket;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::flow::{classify_once, Direction, NoClassifier, PayloadClassifier};
use crate::io::{SocketMultiplexer, TunnelWriter};
use crate::manager::SessionManager;
use crate::packet::udp;
use crate::session::{Session, SessionKey, SessionProtocol, SessionState};
use crate::tcp;

/// Upper bound on reads per session per pass, so one busy socket cannot starve the rest.
const MAX_READS_PER_PASS: usize = 16;
const READ_BUFFER_LEN: usize = 64 * 1024;

/// Writes as much buffered client data as the socket takes without blocking.
///
/// Chunks are sent whole where possible, so datagram sockets keep one datagram per chunk.
pub(crate) fn flush_outbound(state: &mut SessionState, socket: &Socket) -> io::Result<()> {
    while let Some(chunk) = state.front_outbound() {
        match socket.send(chunk) {
            Ok(0) => return Ok(()),
            Ok(n) => state.consume_outbound(n),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(err) => return Err(err),
        }
    }
    state.set_data_ready(false);
    Ok(())
}

/// Whether a non-blocking connect has completed. Errors mean it failed.
fn check_connected(socket: &Socket) -> io::Result<bool> {
    if let Some(err) = socket.take_error()? {
        return Err(err);
    }
    match socket.peer_addr() {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(false),
        Err(err) => Err(err),
    }
}

enum Pass {
    Keep,
    RemoteClosed,
    Failed(io::Error),
    Gone,
}

pub struct PollingMultiplexer {
    registered: DashMap<SessionKey, Arc<Session>>,
    manager: Arc<SessionManager>,
    writer: Arc<dyn TunnelWriter>,
    classifier: Arc<dyn PayloadClassifier>,
    poll_interval: Duration,
    idle_timeout: Duration,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    running: AtomicBool,
}

impl PollingMultiplexer {
    pub fn new(manager: Arc<SessionManager>, writer: Arc<dyn TunnelWriter>, config: &Config) -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            registered: DashMap::new(),
            manager,
            writer,
            classifier: Arc::new(NoClassifier),
            poll_interval: config.relay.poll_interval(),
            idle_timeout: config.session.idle_timeout(),
            wake_tx,
            wake_rx,
            running: AtomicBool::new(false),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn PayloadClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Starts the polling thread. It runs until [`PollingMultiplexer::stop`].
    pub fn start(self: &Arc<Self>) -> io::Result<JoinHandle<()>> {
        self.running.store(true, Ordering::Release);
        let relay = Arc::clone(self);
        thread::Builder::new()
            .name("relay".to_string())
            .spawn(move || relay.run())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let _ = self.wake_tx.try_send(());
    }

    fn run(&self) {
        debug!("relay thread started");
        while self.running.load(Ordering::Acquire) {
            self.poll_once();
            let _ = self.wake_rx.recv_timeout(self.poll_interval);
        }
        debug!("relay thread stopped");
    }

    pub fn registered(&self) -> usize {
        self.registered.len()
    }

    /// One pass over every registered session, then the idle sweep.
    pub fn poll_once(&self) {
        let sessions: Vec<Arc<Session>> = self
            .registered
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for session in &sessions {
            self.service(session);
        }
        self.evict_idle();
    }

    fn service(&self, session: &Arc<Session>) {
        let mut state = session.lock();
        if state.is_aborting_connection() {
            self.abort(session, &mut state);
            return;
        }

        let outcome = match session.socket().as_ref() {
            Some(socket) => self.pump(session, &mut state, socket),
            None => Pass::Gone,
        };

        match outcome {
            Pass::Keep => {}
            Pass::RemoteClosed => {
                debug!(key = %session.key(), "remote side closed");
                tcp::remote_close(self.writer.as_ref(), &mut state);
            }
            Pass::Failed(err) => {
                warn!(key = %session.key(), %err, "session socket failed");
                self.abort(session, &mut state);
            }
            Pass::Gone => {
                self.registered.remove(session.key());
            }
        }
    }

    fn pump(&self, session: &Arc<Session>, state: &mut SessionState, socket: &Socket) -> Pass {
        if !state.is_connected() {
            match check_connected(socket) {
                Ok(true) => {
                    trace!(key = %session.key(), "outbound connection established");
                    state.set_connected(true);
                }
                Ok(false) => return Pass::Keep,
                Err(err) => return Pass::Failed(err),
            }
        }

        if state.outbound_len() > 0 || state.is_data_ready() {
            if let Err(err) = flush_outbound(state, socket) {
                return Pass::Failed(err);
            }
        }

        // Nothing more to read once our FIN is out or pending.
        if state.is_acked_to_fin() || state.is_closing_connection() {
            return Pass::Keep;
        }

        let mut buf = vec![0u8; READ_BUFFER_LEN];
        let mut reader: &Socket = socket;
        for _ in 0..MAX_READS_PER_PASS {
            let n = match reader.read(&mut buf) {
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Pass::Failed(err),
            };
            if n == 0 && session.protocol() == SessionProtocol::Tcp {
                return Pass::RemoteClosed;
            }
            self.deliver(session, state, &buf[..n]);
        }
        Pass::Keep
    }

    fn deliver(&self, session: &Arc<Session>, state: &mut SessionState, data: &[u8]) {
        trace!(key = %session.key(), len = data.len(), "inbound data");
        classify_once(
            self.classifier.as_ref(),
            self.manager.flow_sink().as_ref(),
            state,
            Direction::Ingress,
            data,
        );
        match session.protocol() {
            SessionProtocol::Tcp => {
                if !tcp::send_inbound(self.writer.as_ref(), state, data) {
                    debug!(key = %session.key(), "no TCP header recorded yet, dropping inbound data");
                }
            }
            SessionProtocol::Udp => {
                let reply = match (state.last_ip_header(), state.last_udp_header()) {
                    (Some(ip), Some(header)) => Some(udp::response(ip, header, data).buffer),
                    _ => None,
                };
                match reply {
                    Some(reply) => {
                        self.writer.write(&reply);
                        state.flow_mut().record(Direction::Ingress, reply.len());
                    }
                    None => debug!(key = %session.key(), "no UDP header recorded yet, dropping datagram"),
                }
            }
        }
        self.manager.keep_alive(session);
    }

    /// Resets the peer (TCP) and closes the session. The caller holds the session lock.
    fn abort(&self, session: &Arc<Session>, state: &mut SessionState) {
        if session.protocol() == SessionProtocol::Tcp {
            tcp::reset_peer(self.writer.as_ref(), state);
        }
        self.registered.remove(session.key());
        self.manager.flow_sink().flow_updated(state.flow());
        self.manager.close_session(session);
    }

    fn evict_idle(&self) {
        for session in self.manager.sessions() {
            if session.idle_for() <= self.idle_timeout {
                continue;
            }
            let state = session.lock();
            debug!(key = %session.key(), idle = ?session.idle_for(), "evicting idle session");
            self.registered.remove(session.key());
            self.manager.flow_sink().flow_updated(state.flow());
            self.manager.close_session(&session);
        }
    }
}

impl SocketMultiplexer for PollingMultiplexer {
    fn register_session(&self, session: &Arc<Session>) {
        self.registered.insert(*session.key(), Arc::clone(session));
        let _ = self.wake_tx.try_send(());
    }

    fn refresh_select(&self, _session: &Arc<Session>) {
        let _ = self.wake_tx.try_send(());
    }

    fn cancel(&self, key: &SessionKey) {
        self.registered.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConf;
    use crate::packet::IpAddress;
    use std::net::UdpSocket;

    struct Discard;

    impl TunnelWriter for Discard {
        fn write(&self, _packet: &[u8]) {}
    }

    #[test]
    fn flush_keeps_datagram_boundaries() {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let manager = SessionManager::new(SessionConf::default());
        let key = SessionKey::new(
            SessionProtocol::Udp,
            IpAddress::V4([127, 0, 0, 1]),
            peer.local_addr().unwrap().port(),
            IpAddress::V4([10, 0, 0, 2]),
            5353,
        );
        let session = manager.create_udp_session(key, 0).unwrap().into_session();
        {
            let mut state = session.lock();
            state.append_outbound(b"first");
            state.append_outbound(b"second");
            state.set_data_ready(true);
            let socket = session.socket();
            flush_outbound(&mut state, socket.as_ref().unwrap()).unwrap();
            assert_eq!(state.outbound_len(), 0);
            assert!(!state.is_data_ready());
        }

        let mut buf = [0u8; 64];
        let n = peer.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"first");
        let n = peer.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"second");
    }

    #[test]
    fn idle_sessions_are_evicted() {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut config = Config::default();
        config.session.idle_timeout_secs = 0;
        let manager = Arc::new(SessionManager::new(config.session.clone()));
        let relay = PollingMultiplexer::new(Arc::clone(&manager), Arc::new(Discard), &config);

        let key = SessionKey::new(
            SessionProtocol::Udp,
            IpAddress::V4([127, 0, 0, 1]),
            peer.local_addr().unwrap().port(),
            IpAddress::V4([10, 0, 0, 2]),
            5353,
        );
        let session = manager.create_udp_session(key, 0).unwrap().into_session();
        relay.register_session(&session);
        thread::sleep(Duration::from_millis(5));

        relay.poll_once();
        assert!(manager.is_empty());
        assert_eq!(relay.registered(), 0);
    }
}
