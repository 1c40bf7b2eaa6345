//! Echo requests answered by probing the real destination.
//!
//! Probes block for up to the configured timeout, so they run on a small elastic pool of
//! worker threads. Work is handed off through a zero-capacity channel: a request is only
//! accepted if an idle worker takes it or a new worker may be started, otherwise it is dropped.

use std::io;
use std::net::{IpAddr, SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace, warn};

use crate::config::PingConf;
use crate::io::TunnelWriter;
use crate::packet::checksum::internet_checksum;
use crate::packet::icmp::{packet_to_buffer, IcmpKind, IcmpPacket};
use crate::packet::IpHeader;

/// TCP echo service, used when ICMP sockets are not available.
const ECHO_PORT: u16 = 7;
const PROBE_PAYLOAD: &[u8] = b"tun-relay reachability probe";

/// Decides whether a destination answers.
pub trait Reachability: Send + Sync {
    fn is_reachable(&self, addr: IpAddr, timeout: Duration) -> bool;
}

/// Probes with an unprivileged ICMP echo socket, falling back to a TCP connect to the echo port.
#[derive(Debug, Default)]
pub struct IcmpProbe;

impl Reachability for IcmpProbe {
    fn is_reachable(&self, addr: IpAddr, timeout: Duration) -> bool {
        match icmp_echo(addr, timeout) {
            Ok(reachable) => reachable,
            Err(err) => {
                debug!(%addr, %err, "ICMP echo socket unavailable, trying TCP echo port");
                tcp_echo_port(addr, timeout)
            }
        }
    }
}

fn icmp_echo(addr: IpAddr, timeout: Duration) -> io::Result<bool> {
    let (domain, protocol, version) = match addr {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4, 4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6, 6),
    };
    let socket: UdpSocket = Socket::new(domain, Type::DGRAM, Some(protocol))?.into();

    let sequence: u16 = rand::random();
    let request = IcmpPacket::echo_request(version, 0, sequence, PROBE_PAYLOAD.to_vec());
    let mut bytes = Vec::with_capacity(IcmpPacket::HEADER_LEN + PROBE_PAYLOAD.len());
    request.write(&mut bytes);
    // The kernel fills in the ICMPv6 checksum and the identifier on ping sockets.
    if version == 4 {
        let csum = internet_checksum(&bytes);
        bytes[2..4].copy_from_slice(&csum.to_be_bytes());
    }
    socket.send_to(&bytes, SocketAddr::new(addr, 0))?;

    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 1500];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(false);
        }
        socket.set_read_timeout(Some(remaining))?;
        let n = match socket.recv(&mut buf) {
            Ok(n) => n,
            Err(err)
                if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                return Ok(false)
            }
            Err(err) => return Err(err),
        };
        if let Ok(reply) = IcmpPacket::parse(version, &buf[..n]) {
            if reply.kind() == IcmpKind::EchoReply && reply.sequence_number == sequence {
                return Ok(true);
            }
        }
    }
}

fn tcp_echo_port(addr: IpAddr, timeout: Duration) -> bool {
    match TcpStream::connect_timeout(&SocketAddr::new(addr, ECHO_PORT), timeout) {
        Ok(_) => true,
        // Something answered, even if nothing listens there.
        Err(err) => err.kind() == io::ErrorKind::ConnectionRefused,
    }
}

struct PingJob {
    ip: IpHeader,
    icmp: IcmpPacket,
}

struct Workers {
    jobs: Receiver<PingJob>,
    live: AtomicUsize,
    conf: PingConf,
    probe: Arc<dyn Reachability>,
    writer: Arc<dyn TunnelWriter>,
}

impl Workers {
    fn reserve(&self) -> bool {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.conf.max_workers).then_some(n + 1)
            })
            .is_ok()
    }

    /// Gives up an idle worker slot, unless that would go below the core size.
    fn retire(&self) -> bool {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > self.conf.core_workers).then(|| n - 1)
            })
            .is_ok()
    }

    fn run(self: Arc<Self>, first: PingJob) {
        self.process(first);
        loop {
            match self.jobs.recv_timeout(self.conf.keep_alive()) {
                Ok(job) => self.process(job),
                Err(RecvTimeoutError::Timeout) => {
                    if self.retire() {
                        trace!("idle ping worker exiting");
                        return;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    fn process(&self, job: PingJob) {
        let destination = job.ip.destination().to_std();
        if !self.probe.is_reachable(destination, self.conf.probe_timeout()) {
            trace!(%destination, "destination unreachable, dropping echo request");
            return;
        }
        match packet_to_buffer(&job.ip.reply_template(), &job.icmp.echo_reply()) {
            Ok(reply) => self.writer.write(&reply),
            Err(err) => warn!(%err, "could not build echo reply"),
        }
    }
}

/// Elastic pool of probe workers with discard-on-saturation hand-off.
pub struct PingPool {
    jobs: Sender<PingJob>,
    workers: Arc<Workers>,
}

impl PingPool {
    pub fn new(conf: PingConf, probe: Arc<dyn Reachability>, writer: Arc<dyn TunnelWriter>) -> Self {
        let (jobs, rx) = bounded(0);
        Self {
            jobs,
            workers: Arc::new(Workers {
                jobs: rx,
                live: AtomicUsize::new(0),
                conf,
                probe,
                writer,
            }),
        }
    }

    /// Hands an echo request to a worker. Returns false if it was discarded.
    pub fn submit(&self, ip: IpHeader, icmp: IcmpPacket) -> bool {
        let job = match self.jobs.try_send(PingJob { ip, icmp }) {
            Ok(()) => return true,
            Err(TrySendError::Full(job)) => job,
            Err(TrySendError::Disconnected(_)) => return false,
        };
        if !self.workers.reserve() {
            return false;
        }
        let workers = Arc::clone(&self.workers);
        let spawned = thread::Builder::new()
            .name("ping-worker".to_string())
            .spawn(move || workers.run(job));
        match spawned {
            Ok(_) => true,
            Err(err) => {
                warn!(%err, "could not start ping worker");
                self.workers.live.fetch_sub(1, Ordering::AcqRel);
                false
            }
        }
    }

    /// Number of live worker threads.
    pub fn workers(&self) -> usize {
        self.workers.live.load(Ordering::Acquire)
    }
}
