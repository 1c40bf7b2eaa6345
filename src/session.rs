use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, MutexGuard};
use socket2::Socket;

use crate::flow::{Direction, FlowRecord};
use crate::packet::tcp::{DEFAULT_MSS, MAX_MSS};
use crate::packet::{IpAddress, IpHeader, TcpHeader, Timestamps, UdpHeader};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionProtocol {
    Tcp,
    Udp,
}

impl fmt::Display for SessionProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("TCP"),
            Self::Udp => f.write_str("UDP"),
        }
    }
}

/// Flow identity. Destination first, matching how the real socket addresses its peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub protocol: SessionProtocol,
    pub destination: IpAddress,
    pub destination_port: u16,
    pub source: IpAddress,
    pub source_port: u16,
}

impl SessionKey {
    pub fn new(
        protocol: SessionProtocol,
        destination: IpAddress,
        destination_port: u16,
        source: IpAddress,
        source_port: u16,
    ) -> Self {
        Self {
            protocol,
            destination,
            destination_port,
            source,
            source_port,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}:{}|{}:{}",
            self.protocol, self.destination, self.destination_port, self.source, self.source_port
        )
    }
}

/// `a > b` in sequence-number space.
pub fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// `a >= b` in sequence-number space.
pub fn seq_ge(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

/// Milliseconds since the epoch, truncated to the width of a TCP timestamp.
pub fn now_millis() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or_default()
}

/// RFC-793 S3.2 F4, our side of the connection.
/// ```text
///                    1         2          3          4
///               ----------|----------|----------|----------
///                      SND.UNA    SND.NXT    SND.UNA
///                                           +SND.WND
///
///         1 - old sequence numbers which have been acknowledged
///         2 - sequence numbers of unacknowledged data
///         3 - sequence numbers allowed for new data transmission
///         4 - future sequence numbers which are not yet allowed
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SendSequenceSpace {
    /// send unacknowledged
    pub una: u32,
    /// send next
    pub nxt: u32,
}

/// RFC-793 S3.2 F5, the tunneled peer's side.
/// ```text
///                        1          2          3
///                    ----------|----------|----------
///                           RCV.NXT    RCV.NXT
///                                     +RCV.WND
///
///         1 - old sequence numbers which have been acknowledged
///         2 - sequence numbers allowed for new reception
///         3 - future sequence numbers which are not yet allowed
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecvSequenceSpace {
    /// receive next
    pub nxt: u32,
}

/// Everything about a flow that changes while packets are processed.
///
/// Only reachable through [`Session::lock`].
#[derive(Debug)]
pub struct SessionState {
    send: SendSequenceSpace,
    recv: RecvSequenceSpace,
    connected: bool,

    outbound: VecDeque<Vec<u8>>,
    outbound_bytes: usize,
    data_ready: bool,

    timestamp_sender: u32,
    timestamp_reply_to: u32,

    closing_connection: bool,
    aborting_connection: bool,
    acked_to_fin: bool,
    packet_corrupted: bool,
    acked: bool,

    last_ip_header: Option<IpHeader>,
    last_tcp_header: Option<TcpHeader>,
    last_udp_header: Option<UdpHeader>,

    max_segment_size: u16,
    classified_egress: bool,
    classified_ingress: bool,
    flow: FlowRecord,
}

impl SessionState {
    pub fn new(key: SessionKey) -> Self {
        Self {
            send: SendSequenceSpace::default(),
            recv: RecvSequenceSpace::default(),
            connected: false,
            outbound: VecDeque::new(),
            outbound_bytes: 0,
            data_ready: false,
            timestamp_sender: 0,
            timestamp_reply_to: 0,
            closing_connection: false,
            aborting_connection: false,
            acked_to_fin: false,
            packet_corrupted: false,
            acked: false,
            last_ip_header: None,
            last_tcp_header: None,
            last_udp_header: None,
            max_segment_size: DEFAULT_MSS,
            classified_egress: false,
            classified_ingress: false,
            flow: FlowRecord::new(key),
        }
    }

    pub fn send_next(&self) -> u32 {
        self.send.nxt
    }

    pub fn set_send_next(&mut self, nxt: u32) {
        self.send.nxt = nxt;
    }

    pub fn send_unacknowledged(&self) -> u32 {
        self.send.una
    }

    pub fn set_send_unacknowledged(&mut self, una: u32) {
        self.send.una = una;
    }

    pub fn recv_next(&self) -> u32 {
        self.recv.nxt
    }

    pub fn set_recv_next(&mut self, nxt: u32) {
        self.recv.nxt = nxt;
    }

    /// Whether a data segment starting at `seq` is in order (or the first one seen).
    pub fn accepts_data(&self, seq: u32) -> bool {
        self.recv.nxt == 0 || seq_ge(seq, self.recv.nxt)
    }

    /// Applies an acknowledgment-only segment.
    ///
    /// Accepted iff `ack > SND.UNA` or `ack == SND.NXT`; SND.UNA never passes SND.NXT and
    /// RCV.NXT never moves backwards.
    pub fn accept_ack(&mut self, ack: u32, seq: u32, timestamps: Option<Timestamps>) -> bool {
        if seq_gt(ack, self.send.una) || ack == self.send.nxt {
            self.send.una = if seq_gt(ack, self.send.nxt) {
                self.send.nxt
            } else {
                ack
            };
            if self.recv.nxt == 0 || seq_gt(seq, self.recv.nxt) {
                self.recv.nxt = seq;
            }
            if let Some(ts) = timestamps {
                self.timestamp_reply_to = ts.value;
            }
            self.timestamp_sender = now_millis();
            self.acked = true;
        } else {
            self.acked = false;
        }
        self.acked
    }

    /// Data we sent that the peer has not acknowledged yet.
    pub fn unacknowledged_bytes(&self) -> u32 {
        self.send.nxt.wrapping_sub(self.send.una)
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
        if connected && self.flow.protocol() == SessionProtocol::Tcp {
            self.flow.tcp_established = true;
        }
    }

    /// Queues payload for the real socket. Chunks keep datagram boundaries.
    pub fn append_outbound(&mut self, payload: &[u8]) -> usize {
        if payload.is_empty() {
            return 0;
        }
        self.outbound.push_back(payload.to_vec());
        self.outbound_bytes += payload.len();
        payload.len()
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound_bytes
    }

    pub fn front_outbound(&self) -> Option<&[u8]> {
        self.outbound.front().map(Vec::as_slice)
    }

    /// Drops `n` bytes from the front chunk, removing it once empty.
    pub fn consume_outbound(&mut self, n: usize) {
        if let Some(front) = self.outbound.front_mut() {
            let n = n.min(front.len());
            front.drain(..n);
            self.outbound_bytes -= n;
            if front.is_empty() {
                self.outbound.pop_front();
            }
        }
    }

    pub fn is_data_ready(&self) -> bool {
        self.data_ready
    }

    pub fn set_data_ready(&mut self, ready: bool) {
        self.data_ready = ready;
    }

    pub fn timestamp_sender(&self) -> u32 {
        self.timestamp_sender
    }

    pub fn timestamp_reply_to(&self) -> u32 {
        self.timestamp_reply_to
    }

    /// Records the peer's timestamp and stamps ours for the next reply.
    pub fn stamp_timestamps(&mut self, peer: Option<Timestamps>) {
        if let Some(ts) = peer {
            self.timestamp_reply_to = ts.value;
        }
        self.timestamp_sender = now_millis();
    }

    /// Timestamp option for segments we send, if the peer uses timestamps.
    pub fn reply_timestamps(&self) -> Option<Timestamps> {
        self.last_tcp_header
            .as_ref()
            .and_then(TcpHeader::timestamps)
            .map(|_| Timestamps {
                value: self.timestamp_sender,
                echo_reply: self.timestamp_reply_to,
            })
    }

    pub fn is_closing_connection(&self) -> bool {
        self.closing_connection
    }

    pub fn set_closing_connection(&mut self, closing: bool) {
        self.closing_connection = closing;
    }

    pub fn is_aborting_connection(&self) -> bool {
        self.aborting_connection
    }

    pub fn set_aborting_connection(&mut self, aborting: bool) {
        self.aborting_connection = aborting;
    }

    pub fn is_acked_to_fin(&self) -> bool {
        self.acked_to_fin
    }

    pub fn set_acked_to_fin(&mut self, acked_to_fin: bool) {
        self.acked_to_fin = acked_to_fin;
    }

    pub fn is_packet_corrupted(&self) -> bool {
        self.packet_corrupted
    }

    pub fn set_packet_corrupted(&mut self, corrupted: bool) {
        self.packet_corrupted = corrupted;
    }

    pub fn is_acked(&self) -> bool {
        self.acked
    }

    pub fn last_ip_header(&self) -> Option<&IpHeader> {
        self.last_ip_header.as_ref()
    }

    pub fn last_tcp_header(&self) -> Option<&TcpHeader> {
        self.last_tcp_header.as_ref()
    }

    pub fn last_udp_header(&self) -> Option<&UdpHeader> {
        self.last_udp_header.as_ref()
    }

    pub fn set_last_tcp_headers(&mut self, ip: IpHeader, tcp: TcpHeader) {
        self.last_ip_header = Some(ip);
        self.last_tcp_header = Some(tcp);
    }

    pub fn set_last_udp_headers(&mut self, ip: IpHeader, udp: UdpHeader) {
        self.last_ip_header = Some(ip);
        self.last_udp_header = Some(udp);
    }

    pub fn max_segment_size(&self) -> u16 {
        self.max_segment_size
    }

    pub fn set_max_segment_size(&mut self, mss: u16) {
        self.max_segment_size = mss.clamp(1, MAX_MSS);
    }

    /// Returns true the first time it is called for `direction`.
    pub fn claim_classification(&mut self, direction: Direction) -> bool {
        let flag = match direction {
            Direction::Egress => &mut self.classified_egress,
            Direction::Ingress => &mut self.classified_ingress,
        };
        !std::mem::replace(flag, true)
    }

    pub fn flow(&self) -> &FlowRecord {
        &self.flow
    }

    pub fn flow_mut(&mut self) -> &mut FlowRecord {
        &mut self.flow
    }
}

/// One proxied flow: a key, its state behind a lock, and the real socket it owns.
///
/// Lock order is always `state` before `socket`.
#[derive(Debug)]
pub struct Session {
    key: SessionKey,
    created: Instant,
    last_seen_ms: AtomicU64,
    state: Mutex<SessionState>,
    socket: Mutex<Option<Socket>>,
}

impl Session {
    pub fn new(key: SessionKey, socket: Option<Socket>) -> Self {
        Self {
            key,
            created: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
            state: Mutex::new(SessionState::new(key)),
            socket: Mutex::new(socket),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn protocol(&self) -> SessionProtocol {
        self.key.protocol
    }

    /// Locks the session for the duration of one packet or one socket pass.
    pub fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock()
    }

    pub fn socket(&self) -> MutexGuard<'_, Option<Socket>> {
        self.socket.lock()
    }

    pub(crate) fn take_socket(&self) -> Option<Socket> {
        self.socket.lock().take()
    }

    /// Refreshes liveness.
    pub fn touch(&self) {
        let elapsed = self.created.elapsed().as_millis() as u64;
        self.last_seen_ms.store(elapsed, Ordering::Relaxed);
    }

    /// Time since the last [`Session::touch`] (or creation).
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(protocol: SessionProtocol) -> SessionKey {
        SessionKey::new(
            protocol,
            IpAddress::V4([93, 184, 216, 34]),
            443,
            IpAddress::V4([10, 0, 0, 2]),
            40000,
        )
    }

    fn state(una: u32, nxt: u32) -> SessionState {
        let mut state = SessionState::new(key(SessionProtocol::Tcp));
        state.set_send_unacknowledged(una);
        state.set_send_next(nxt);
        state
    }

    #[test]
    fn ack_acceptance_law() {
        assert!(!state(100, 150).accept_ack(100, 1, None));
        assert!(state(100, 150).accept_ack(101, 1, None));
        assert!(state(100, 150).accept_ack(150, 1, None));
        // Anything past SND.UNA counts as progress, even short of SND.NXT.
        assert!(state(100, 150).accept_ack(149, 1, None));
        assert!(!state(100, 150).accept_ack(99, 1, None));
    }

    #[test]
    fn rejected_ack_leaves_counters_alone() {
        let mut s = state(100, 150);
        s.set_recv_next(77);
        assert!(!s.accept_ack(90, 5, None));
        assert_eq!(s.send_unacknowledged(), 100);
        assert_eq!(s.send_next(), 150);
        assert_eq!(s.recv_next(), 77);
        assert!(!s.is_acked());
    }

    #[test]
    fn accepted_ack_never_passes_send_next() {
        let mut s = state(100, 150);
        assert!(s.accept_ack(400, 9, None));
        assert_eq!(s.send_unacknowledged(), 150);
        assert_eq!(s.recv_next(), 9);
    }

    #[test]
    fn stale_ack_does_not_rewind_recv_next() {
        let mut s = state(100, 150);
        s.set_recv_next(1006);
        assert!(s.accept_ack(120, 1001, None));
        assert_eq!(s.recv_next(), 1006);
        assert!(s.accept_ack(130, 1010, None));
        assert_eq!(s.recv_next(), 1010);
    }

    #[test]
    fn sequence_comparisons_wrap() {
        assert!(seq_gt(5, u32::MAX - 5));
        assert!(seq_ge(7, 7));
        assert!(!seq_gt(u32::MAX - 5, 5));
    }

    #[test]
    fn data_acceptance_is_in_order_or_first() {
        let mut s = state(0, 0);
        assert!(s.accepts_data(12345));
        s.set_recv_next(500);
        assert!(s.accepts_data(500));
        assert!(s.accepts_data(510));
        assert!(!s.accepts_data(490));
    }

    #[test]
    fn outbound_buffer_keeps_chunks() {
        let mut s = state(0, 0);
        assert_eq!(s.append_outbound(b""), 0);
        assert_eq!(s.append_outbound(b"hello"), 5);
        assert_eq!(s.append_outbound(b"world!"), 6);
        assert_eq!(s.outbound_len(), 11);
        s.consume_outbound(3);
        assert_eq!(s.front_outbound(), Some(&b"lo"[..]));
        s.consume_outbound(2);
        assert_eq!(s.front_outbound(), Some(&b"world!"[..]));
        assert_eq!(s.outbound_len(), 6);
    }

    #[test]
    fn classification_is_claimed_once_per_direction() {
        let mut s = state(0, 0);
        assert!(s.claim_classification(Direction::Egress));
        assert!(!s.claim_classification(Direction::Egress));
        assert!(s.claim_classification(Direction::Ingress));
    }

    #[test]
    fn keys_render_destination_first() {
        assert_eq!(
            key(SessionProtocol::Udp).to_string(),
            "UDP|93.184.216.34:443|10.0.0.2:40000"
        );
        assert_ne!(key(SessionProtocol::Udp), key(SessionProtocol::Tcp));
    }

    #[test]
    fn touch_resets_idle_time() {
        let session = Session::new(key(SessionProtocol::Tcp), None);
        std::thread::sleep(Duration::from_millis(20));
        assert!(session.idle_for() >= Duration::from_millis(20));
        session.touch();
        assert!(session.idle_for() < Duration::from_millis(20));
    }
}
