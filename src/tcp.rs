//! The TCP side of the relay: answering the tunneled peer on behalf of the real socket.
//!
//! We never run a full RFC-793 state machine. The session's sequence spaces and flags are
//! enough: the real socket does the actual TCP work with the remote host, and this module
//! only keeps the tunneled peer's view consistent.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::flow::Direction;
use crate::handler::SessionHandler;
use crate::io::TunnelWriter;
use crate::manager::Opened;
use crate::packet::tcp::{self as segment, DEFAULT_MSS};
use crate::packet::{IpHeader, TcpFlags, TcpHeader};
use crate::relay::flush_outbound;
use crate::session::{now_millis, Session, SessionKey, SessionProtocol, SessionState};

fn session_key(ip: &IpHeader, tcp: &TcpHeader) -> SessionKey {
    SessionKey::new(
        SessionProtocol::Tcp,
        ip.destination(),
        tcp.destination_port,
        ip.source(),
        tcp.source_port,
    )
}

impl SessionHandler {
    pub(crate) fn handle_tcp(&self, ip: IpHeader, tcp: TcpHeader, bytes: &[u8], payload: &[u8]) {
        trace!(
            "{}:{} -> {}:{} flags={:#04x} seq={} ack={} {}b",
            ip.source(),
            tcp.source_port,
            ip.destination(),
            tcp.destination_port,
            tcp.flags.0,
            tcp.sequence_number,
            tcp.acknowledgment_number,
            payload.len(),
        );

        if tcp.is_syn() {
            self.on_syn(ip, tcp);
        } else if tcp.is_ack() {
            self.on_ack(ip, tcp, bytes, payload);
        } else if tcp.is_fin() {
            self.on_fin(&ip, &tcp);
        } else if tcp.is_rst() {
            self.on_rst(&ip, &tcp);
        } else {
            debug!(flags = tcp.flags.0, "dropping TCP segment without SYN, ACK, FIN or RST");
        }
    }

    fn on_syn(&self, ip: IpHeader, tcp: TcpHeader) {
        let key = session_key(&ip, &tcp);
        let isn: u32 = rand::random();
        let now = now_millis();

        let opened = match self.manager.create_tcp_session(key, ip.total_len()) {
            Ok(opened) => opened,
            Err(err) => {
                warn!(%key, %err, "outbound connect failed, resetting peer");
                self.writer.write(&segment::rst(&ip, &tcp, 0));
                return;
            }
        };

        let session = match opened {
            Opened::Existing(session) => {
                debug!(%key, "duplicate SYN, re-sending last ACK");
                resend_last_ack(self.writer.as_ref(), &session.lock());
                return;
            }
            Opened::New(session) => session,
        };

        let syn_ack = segment::syn_ack(&ip, &tcp, isn, now);
        {
            let mut state = session.lock();
            state.set_max_segment_size(tcp.mss().unwrap_or(DEFAULT_MSS).min(self.mss_limit));
            state.set_send_unacknowledged(isn);
            state.set_send_next(isn.wrapping_add(1));
            state.set_recv_next(tcp.sequence_number.wrapping_add(1));
            state.stamp_timestamps(tcp.timestamps());
            state.set_last_tcp_headers(ip, tcp);
        }
        self.multiplexer.register_session(&session);
        self.writer.write(&syn_ack.buffer);
    }

    fn on_ack(&self, ip: IpHeader, tcp: TcpHeader, bytes: &[u8], payload: &[u8]) {
        let key = session_key(&ip, &tcp);
        let Some(session) = self.manager.get_session_by_key(&key) else {
            self.answer_orphan_ack(&ip, &tcp, payload.len());
            return;
        };

        let mut refresh = false;
        let mut close = false;
        let mut in_order = true;
        let mut state = session.lock();
        state.set_last_tcp_headers(ip.clone(), tcp.clone());

        let seq = tcp.sequence_number;
        if !payload.is_empty() {
            if state.accepts_data(seq) {
                let base = if state.recv_next() == 0 { seq } else { state.recv_next() };
                let accepted = self.manager.add_client_data(&mut state, payload);
                state.set_recv_next(base.wrapping_add(accepted as u32));
                state.flow_mut().record(Direction::Egress, ip.total_len());
                self.classify(&mut state, Direction::Egress, payload);
                state.stamp_timestamps(tcp.timestamps());
                state.set_data_ready(true);
                refresh = true;
                self.writer.write(&segment::response_ack(
                    &ip,
                    &tcp,
                    state.recv_next(),
                    state.reply_timestamps(),
                ));
            } else {
                trace!(%key, seq, expected = state.recv_next(), "out of order segment");
                in_order = false;
                self.writer.write(&segment::response_ack(
                    &ip,
                    &tcp,
                    seq.wrapping_add(payload.len() as u32),
                    state.reply_timestamps(),
                ));
            }
        } else {
            state.set_packet_corrupted(segment::is_corrupted(&ip, &tcp, bytes));
            if state.is_packet_corrupted() {
                debug!(%key, "corrupted segment");
            }
            state.accept_ack(tcp.acknowledgment_number, seq, tcp.timestamps());

            if state.is_closing_connection() {
                if state.is_acked() && state.unacknowledged_bytes() == 0 {
                    send_fin_ack(self.writer.as_ref(), &mut state);
                    state.set_send_next(tcp.acknowledgment_number.wrapping_add(1));
                }
            } else if state.is_acked_to_fin() && !tcp.is_fin() {
                debug!(%key, "peer acknowledged our FIN");
                close = true;
            }
        }

        if tcp.is_psh() {
            state.set_data_ready(true);
            state.stamp_timestamps(tcp.timestamps());
            refresh = true;
        }
        // A FIN may ride on a PSH segment. It occupies the sequence number after the payload.
        if tcp.is_fin() && in_order {
            let ack = seq.wrapping_add(payload.len() as u32).wrapping_add(1);
            self.writer.write(&segment::fin_ack(&ip, &tcp, tcp.acknowledgment_number, ack));
            close = true;
        } else if tcp.is_fin() {
            trace!(%key, seq, "ignoring FIN on an out of order segment");
        } else if tcp.is_rst() && !tcp.is_psh() {
            debug!(%key, "peer reset the connection");
            state.set_aborting_connection(true);
        }

        if close {
            self.finish(&session, &mut state);
            return;
        }
        let aborting = state.is_aborting_connection();
        drop(state);

        if refresh {
            self.multiplexer.refresh_select(&session);
        }
        if !aborting {
            self.manager.keep_alive(&session);
        }
    }

    fn on_fin(&self, ip: &IpHeader, tcp: &TcpHeader) {
        match self.manager.get_session_by_key(&session_key(ip, tcp)) {
            Some(session) => self.manager.keep_alive(&session),
            None => self.writer.write(&segment::fin_ack(
                ip,
                tcp,
                tcp.acknowledgment_number,
                tcp.sequence_number.wrapping_add(1),
            )),
        }
    }

    fn on_rst(&self, ip: &IpHeader, tcp: &TcpHeader) {
        if let Some(session) = self.manager.get_session_by_key(&session_key(ip, tcp)) {
            session.lock().set_aborting_connection(true);
        }
    }

    /// An ACK for a connection we do not know. Keeps the peer from waiting on a dead flow.
    fn answer_orphan_ack(&self, ip: &IpHeader, tcp: &TcpHeader, data_len: usize) {
        if tcp.is_fin() {
            self.writer.write(&segment::response_ack(
                ip,
                tcp,
                tcp.sequence_number.wrapping_add(1),
                None,
            ));
        } else if !tcp.is_rst() {
            self.writer.write(&segment::rst(ip, tcp, data_len));
        }
    }

    /// Closes a session whose lock the caller holds.
    ///
    /// Buffered client data gets one last non-blocking flush before the socket goes away.
    fn finish(&self, session: &Arc<Session>, state: &mut SessionState) {
        self.multiplexer.cancel(session.key());
        if state.is_connected() && state.outbound_len() > 0 {
            if let Some(socket) = session.socket().as_ref() {
                if let Err(err) = flush_outbound(state, socket) {
                    debug!(key = %session.key(), %err, "final flush failed");
                }
            }
        }
        self.manager.flow_sink().flow_updated(state.flow());
        self.manager.close_session(session);
    }
}

fn resend_last_ack(writer: &dyn TunnelWriter, state: &SessionState) {
    let (Some(ip), Some(tcp)) = (state.last_ip_header(), state.last_tcp_header()) else {
        return;
    };
    let reply = tcp.reply(state.send_next(), state.recv_next(), TcpFlags::ACK);
    let reply = match state.reply_timestamps() {
        Some(ts) => reply.with_timestamps(ts),
        None => reply,
    };
    writer.write(&segment::build_packet(&ip.reply_template(), &reply, &[]).buffer);
}

/// FIN-ACK from our side, sequenced by the session's own counters.
fn send_fin_ack(writer: &dyn TunnelWriter, state: &mut SessionState) {
    let (Some(ip), Some(tcp)) = (state.last_ip_header(), state.last_tcp_header()) else {
        return;
    };
    writer.write(&segment::fin_ack(ip, tcp, state.send_next(), state.recv_next()));
    state.set_closing_connection(false);
    state.set_acked_to_fin(true);
}

/// Wraps bytes read from the real socket into PSH-ACK segments of at most one MSS each.
///
/// Returns false if the session has not seen a TCP header yet.
pub(crate) fn send_inbound(writer: &dyn TunnelWriter, state: &mut SessionState, data: &[u8]) -> bool {
    let (Some(ip), Some(tcp)) = (state.last_ip_header().cloned(), state.last_tcp_header().cloned())
    else {
        return false;
    };
    let mss = usize::from(state.max_segment_size());
    for chunk in data.chunks(mss) {
        let packet = segment::data(
            &ip,
            &tcp,
            state.send_next(),
            state.recv_next(),
            chunk,
            state.reply_timestamps(),
        );
        state.set_send_next(state.send_next().wrapping_add(chunk.len() as u32));
        state.flow_mut().record(Direction::Ingress, packet.len());
        writer.write(&packet);
    }
    true
}

/// The real socket reached end of stream.
///
/// With nothing left in flight the peer gets our FIN-ACK now; otherwise it is deferred until
/// the peer acknowledges everything we sent.
pub(crate) fn remote_close(writer: &dyn TunnelWriter, state: &mut SessionState) {
    if state.unacknowledged_bytes() > 0 {
        state.set_closing_connection(true);
        return;
    }
    let next = state.send_next();
    send_fin_ack(writer, state);
    state.set_send_next(next.wrapping_add(1));
}

/// Resets the tunneled peer after the real connection failed.
pub(crate) fn reset_peer(writer: &dyn TunnelWriter, state: &SessionState) {
    if let (Some(ip), Some(tcp)) = (state.last_ip_header(), state.last_tcp_header()) {
        writer.write(&segment::rst(ip, tcp, 0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{IpAddress, Ipv4Header, Packet, TransportHeader};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Capture(Mutex<Vec<Vec<u8>>>);

    impl TunnelWriter for Capture {
        fn write(&self, packet: &[u8]) {
            self.0.lock().push(packet.to_vec());
        }
    }

    impl Capture {
        fn segments(&self) -> Vec<(TcpHeader, Vec<u8>)> {
            self.0
                .lock()
                .iter()
                .map(|buf| {
                    let packet = Packet::parse(buf).unwrap();
                    let TransportHeader::Tcp(tcp) = packet.transport.clone() else {
                        panic!("expected TCP");
                    };
                    (tcp, packet.payload().to_vec())
                })
                .collect()
        }
    }

    fn established(send_next: u32, recv_next: u32, mss: u16) -> SessionState {
        let mut state = SessionState::new(SessionKey::new(
            SessionProtocol::Tcp,
            IpAddress::V4([1, 1, 1, 1]),
            443,
            IpAddress::V4([10, 0, 0, 2]),
            40000,
        ));
        let ip = IpHeader::V4(Ipv4Header {
            ihl: 5,
            dscp: 0,
            ecn: 0,
            total_length: 40,
            identification: 0,
            reserved_flag: false,
            may_fragment: true,
            last_fragment: false,
            fragment_offset: 0,
            ttl: 64,
            protocol: crate::packet::ip::IPPROTO_TCP,
            checksum: 0,
            source: [10, 0, 0, 2],
            destination: [1, 1, 1, 1],
            options: Vec::new(),
        });
        let tcp = TcpHeader {
            source_port: 40000,
            destination_port: 443,
            sequence_number: recv_next,
            acknowledgment_number: send_next,
            data_offset: 5,
            flags: TcpFlags::ACK,
            ..TcpHeader::default()
        };
        state.set_last_tcp_headers(ip, tcp);
        state.set_send_unacknowledged(send_next);
        state.set_send_next(send_next);
        state.set_recv_next(recv_next);
        state.set_max_segment_size(mss);
        state
    }

    #[test]
    fn inbound_data_is_segmented_by_mss() {
        let writer = Capture::default();
        let mut state = established(5000, 9000, 4);

        assert!(send_inbound(&writer, &mut state, b"0123456789"));

        let segments = writer.segments();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].0.sequence_number, 5000);
        assert_eq!(segments[1].0.sequence_number, 5004);
        assert_eq!(segments[2].0.sequence_number, 5008);
        assert_eq!(segments[2].1, b"89");
        assert!(segments.iter().all(|(tcp, _)| tcp.flags == TcpFlags::PSH | TcpFlags::ACK));
        assert!(segments.iter().all(|(tcp, _)| tcp.acknowledgment_number == 9000));
        assert_eq!(state.send_next(), 5010);
        assert_eq!(state.unacknowledged_bytes(), 10);
    }

    #[test]
    fn oversized_mss_keeps_segments_parseable() {
        let writer = Capture::default();
        let mut state = established(5000, 9000, u16::MAX);
        assert_eq!(state.max_segment_size(), segment::MAX_MSS);

        assert!(send_inbound(&writer, &mut state, &[7; 65_500]));

        let packets = writer.0.lock().clone();
        assert_eq!(packets.len(), 2);
        for buf in &packets {
            let packet = Packet::parse(buf).unwrap();
            assert_eq!(packet.ip.total_len(), buf.len());
        }
        assert_eq!(state.send_next(), 5000 + 65_500);
    }

    #[test]
    fn remote_close_sends_fin_when_everything_is_acked() {
        let writer = Capture::default();
        let mut state = established(5000, 9000, 536);

        remote_close(&writer, &mut state);

        let segments = writer.segments();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].0.flags, TcpFlags::FIN | TcpFlags::ACK);
        assert_eq!(segments[0].0.sequence_number, 5000);
        assert_eq!(segments[0].0.acknowledgment_number, 9000);
        assert_eq!(state.send_next(), 5001);
        assert!(state.is_acked_to_fin());
    }

    #[test]
    fn remote_close_waits_for_outstanding_data() {
        let writer = Capture::default();
        let mut state = established(5000, 9000, 536);
        send_inbound(&writer, &mut state, b"tail");
        writer.0.lock().clear();

        remote_close(&writer, &mut state);

        assert!(writer.segments().is_empty());
        assert!(state.is_closing_connection());
        assert!(!state.is_acked_to_fin());
    }

    #[test]
    fn reset_uses_peer_acknowledgment() {
        let writer = Capture::default();
        let state = established(5000, 9000, 536);
        reset_peer(&writer, &state);
        let segments = writer.segments();
        assert_eq!(segments[0].0.flags, TcpFlags::RST);
        assert_eq!(segments[0].0.sequence_number, 5000);
    }
}
