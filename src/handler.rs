//! Entry point for packets read from the tunnel.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::error::PacketError;
use crate::flow::{classify_once, Direction, NoClassifier, PayloadClassifier};
use crate::io::{SocketMultiplexer, TunnelWriter};
use crate::manager::SessionManager;
use crate::packet::tcp::MAX_MSS;
use crate::packet::{IcmpKind, IcmpPacket, IpHeader, IpProtocol, TcpHeader, UdpHeader};
use crate::ping::PingPool;
use crate::session::{SessionKey, SessionProtocol, SessionState};

/// Parses tunnel packets and drives sessions, the multiplexer and the tunnel writer.
pub struct SessionHandler {
    pub(crate) manager: Arc<SessionManager>,
    pub(crate) multiplexer: Arc<dyn SocketMultiplexer>,
    pub(crate) writer: Arc<dyn TunnelWriter>,
    pub(crate) classifier: Arc<dyn PayloadClassifier>,
    /// Upper bound for the MSS a peer may ask for.
    pub(crate) mss_limit: u16,
    ping: PingPool,
}

impl SessionHandler {
    pub fn new(
        manager: Arc<SessionManager>,
        multiplexer: Arc<dyn SocketMultiplexer>,
        writer: Arc<dyn TunnelWriter>,
        ping: PingPool,
    ) -> Self {
        Self {
            manager,
            multiplexer,
            writer,
            classifier: Arc::new(NoClassifier),
            mss_limit: MAX_MSS,
            ping,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn PayloadClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Caps segments sent back to peers so they fit a tunnel of `mtu` bytes.
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mss_limit = crate::packet::tcp::mss_for_mtu(mtu);
        self
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Handles one raw IP packet. Header errors are returned; everything else is handled or
    /// logged here.
    pub fn handle_packet(&self, buf: &[u8]) -> Result<(), PacketError> {
        let ip = IpHeader::parse(buf)?;
        let end = ip.total_len().min(buf.len());
        let body = &buf[ip.header_len()..end];

        match ip.protocol() {
            IpProtocol::Tcp => {
                let tcp = TcpHeader::parse(body)?;
                let payload = &body[tcp.header_len()..];
                self.handle_tcp(ip, tcp, body, payload);
                Ok(())
            }
            IpProtocol::Udp => {
                let udp = UdpHeader::parse(body)?;
                let payload = &body[UdpHeader::LEN..];
                self.handle_udp(ip, udp, payload);
                Ok(())
            }
            IpProtocol::Icmp => self.handle_icmp(ip, body),
            IpProtocol::Other(number) => {
                debug!(protocol = number, "dropping packet with unsupported IP protocol");
                Ok(())
            }
        }
    }

    fn handle_udp(&self, ip: IpHeader, udp: UdpHeader, payload: &[u8]) {
        let key = SessionKey::new(
            SessionProtocol::Udp,
            ip.destination(),
            udp.destination_port,
            ip.source(),
            udp.source_port,
        );
        trace!(%key, len = payload.len(), "udp datagram");

        let packet_len = ip.total_len();
        let opened = match self.manager.create_udp_session(key, packet_len) {
            Ok(opened) => opened,
            Err(err) => {
                warn!(%key, %err, "could not open UDP socket, dropping datagram");
                return;
            }
        };
        let session = opened.session();
        {
            let mut state = session.lock();
            state.set_last_udp_headers(ip, udp);
            if !opened.is_new() {
                state.flow_mut().record(Direction::Egress, packet_len);
            }
            self.manager.add_client_data(&mut state, payload);
            self.classify(&mut state, Direction::Egress, payload);
            state.set_data_ready(true);
        }
        if opened.is_new() {
            self.multiplexer.register_session(session);
        }
        self.multiplexer.refresh_select(session);
        self.manager.keep_alive(session);
    }

    fn handle_icmp(&self, ip: IpHeader, body: &[u8]) -> Result<(), PacketError> {
        let icmp = IcmpPacket::parse(ip.version(), body)?;
        match icmp.kind() {
            IcmpKind::DestinationUnreachable | IcmpKind::RouterSolicitation => {
                trace!(icmp_type = icmp.icmp_type, "ignoring ICMP message");
                Ok(())
            }
            IcmpKind::EchoRequest => {
                trace!(
                    destination = %ip.destination(),
                    id = icmp.identifier,
                    seq = icmp.sequence_number,
                    "echo request"
                );
                if !self.ping.submit(ip, icmp) {
                    debug!("ping workers saturated, dropping echo request");
                }
                Ok(())
            }
            IcmpKind::EchoReply | IcmpKind::Unsupported(_) => Err(PacketError::UnsupportedIcmp {
                icmp_type: icmp.icmp_type,
            }),
        }
    }

    pub(crate) fn classify(&self, state: &mut SessionState, direction: Direction, payload: &[u8]) {
        classify_once(
            self.classifier.as_ref(),
            self.manager.flow_sink().as_ref(),
            state,
            direction,
            payload,
        );
    }
}
