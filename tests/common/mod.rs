#![allow(dead_code)]

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use etherparse::{PacketBuilder, PacketBuilderStep, TcpHeader as EtherTcp};
use parking_lot::Mutex;

use tun_relay::config::{PingConf, SessionConf};
use tun_relay::packet::{Packet, TcpHeader, TransportHeader, UdpHeader};
use tun_relay::{
    PingPool, Reachability, Session, SessionHandler, SessionKey, SessionManager,
    SocketMultiplexer, TunnelWriter,
};

pub const PEER: [u8; 4] = [10, 0, 0, 2];
pub const PEER_PORT: u16 = 40000;
pub const LOCALHOST: [u8; 4] = [127, 0, 0, 1];

#[derive(Default)]
pub struct Recorder(Mutex<Vec<Vec<u8>>>);

impl TunnelWriter for Recorder {
    fn write(&self, packet: &[u8]) {
        self.0.lock().push(packet.to_vec());
    }
}

impl Recorder {
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.0.lock())
    }

    /// Drains everything written so far as TCP segments.
    pub fn take_tcp(&self) -> Vec<(TcpHeader, Vec<u8>)> {
        self.take()
            .iter()
            .map(|buf| {
                let packet = Packet::parse(buf).expect("valid packet");
                let payload = packet.payload().to_vec();
                match packet.transport {
                    TransportHeader::Tcp(tcp) => (tcp, payload),
                    other => panic!("expected TCP, got {other:?}"),
                }
            })
            .collect()
    }

    pub fn take_udp(&self) -> Vec<(UdpHeader, Vec<u8>)> {
        self.take()
            .iter()
            .map(|buf| {
                let packet = Packet::parse(buf).expect("valid packet");
                let payload = packet.payload().to_vec();
                match packet.transport {
                    TransportHeader::Udp(udp) => (udp, payload),
                    other => panic!("expected UDP, got {other:?}"),
                }
            })
            .collect()
    }
}

#[derive(Default)]
pub struct RecordingMux {
    pub registered: Mutex<Vec<SessionKey>>,
    pub refreshed: Mutex<Vec<SessionKey>>,
    pub cancelled: Mutex<Vec<SessionKey>>,
}

impl SocketMultiplexer for RecordingMux {
    fn register_session(&self, session: &Arc<Session>) {
        self.registered.lock().push(*session.key());
    }

    fn refresh_select(&self, session: &Arc<Session>) {
        self.refreshed.lock().push(*session.key());
    }

    fn cancel(&self, key: &SessionKey) {
        self.cancelled.lock().push(*key);
    }
}

pub struct Unreachable;

impl Reachability for Unreachable {
    fn is_reachable(&self, _addr: IpAddr, _timeout: Duration) -> bool {
        false
    }
}

pub struct Harness {
    pub handler: SessionHandler,
    pub manager: Arc<SessionManager>,
    pub writer: Arc<Recorder>,
    pub mux: Arc<RecordingMux>,
}

pub fn harness() -> Harness {
    harness_with(|handler| handler)
}

/// Like [`harness`], with a chance to configure the handler.
pub fn harness_with(configure: impl FnOnce(SessionHandler) -> SessionHandler) -> Harness {
    let manager = Arc::new(SessionManager::new(SessionConf::default()));
    let writer = Arc::new(Recorder::default());
    let mux = Arc::new(RecordingMux::default());
    let ping = PingPool::new(
        PingConf::default(),
        Arc::new(Unreachable),
        Arc::clone(&writer) as Arc<dyn TunnelWriter>,
    );
    let handler = configure(SessionHandler::new(
        Arc::clone(&manager),
        Arc::clone(&mux) as Arc<dyn SocketMultiplexer>,
        Arc::clone(&writer) as Arc<dyn TunnelWriter>,
        ping,
    ));
    Harness {
        handler,
        manager,
        writer,
        mux,
    }
}

pub type TcpStep = PacketBuilderStep<EtherTcp>;

/// IPv4/TCP packet from the tunneled peer to `127.0.0.1:port`.
pub fn tcp_to(port: u16, seq: u32, flags: impl FnOnce(TcpStep) -> TcpStep, payload: &[u8]) -> Vec<u8> {
    let builder = flags(PacketBuilder::ipv4(PEER, LOCALHOST, 64).tcp(PEER_PORT, port, seq, 64240));
    let mut buf = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut buf, payload).expect("serialize TCP packet");
    buf
}

pub fn udp_to(port: u16, payload: &[u8]) -> Vec<u8> {
    let builder = PacketBuilder::ipv4(PEER, LOCALHOST, 64).udp(PEER_PORT, port);
    let mut buf = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut buf, payload).expect("serialize UDP packet");
    buf
}
