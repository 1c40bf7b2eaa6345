//! Flow records handed to the statistics sink, and the payload classification port.

use std::time::SystemTime;

use tracing::debug;

use crate::session::{SessionKey, SessionProtocol, SessionState};

/// Which way payload was travelling when it was observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Tunnel to real socket.
    Egress,
    /// Real socket to tunnel.
    Ingress,
}

/// Result of a payload classification pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Classification {
    pub protocol: String,
    pub report: String,
}

/// Observational record of one flow, keyed like its session.
///
/// Byte counters count whole IP packets on the tunnel side (IP total length): egress for packets
/// from the peer that open the session or carry payload, ingress for packets we write back with
/// data from the real socket. Both protocols use the same unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowRecord {
    pub key: SessionKey,
    pub created_at: SystemTime,
    pub egress_bytes: u64,
    pub egress_packets: u64,
    pub ingress_bytes: u64,
    pub ingress_packets: u64,
    pub tcp_established: bool,
    pub classification: Option<Classification>,
}

impl FlowRecord {
    pub fn new(key: SessionKey) -> Self {
        Self {
            key,
            created_at: SystemTime::now(),
            egress_bytes: 0,
            egress_packets: 0,
            ingress_bytes: 0,
            ingress_packets: 0,
            tcp_established: false,
            classification: None,
        }
    }

    pub fn protocol(&self) -> SessionProtocol {
        self.key.protocol
    }

    pub fn record(&mut self, direction: Direction, bytes: usize) {
        match direction {
            Direction::Egress => {
                self.egress_packets += 1;
                self.egress_bytes += bytes as u64;
            }
            Direction::Ingress => {
                self.ingress_packets += 1;
                self.ingress_bytes += bytes as u64;
            }
        }
    }
}

/// Receives flow records. Never feeds anything back into session state.
pub trait FlowSink: Send + Sync {
    fn flow_created(&self, flow: &FlowRecord);
    fn flow_updated(&self, flow: &FlowRecord);
}

/// Inspects payload bytes and optionally names the application protocol.
pub trait PayloadClassifier: Send + Sync {
    fn classify(&self, payload: &[u8]) -> Option<Classification>;
}

/// Runs `classifier` over the first non-empty payload seen in `direction` and reports a hit.
pub fn classify_once(
    classifier: &dyn PayloadClassifier,
    sink: &dyn FlowSink,
    state: &mut SessionState,
    direction: Direction,
    payload: &[u8],
) {
    if payload.is_empty() || !state.claim_classification(direction) {
        return;
    }
    if let Some(classification) = classifier.classify(payload) {
        debug!(key = %state.flow().key, protocol = %classification.protocol, ?direction, "classified flow");
        state.flow_mut().classification = Some(classification);
        sink.flow_updated(state.flow());
    }
}

/// Sink that only logs.
#[derive(Debug, Default)]
pub struct TracingFlowSink;

impl FlowSink for TracingFlowSink {
    fn flow_created(&self, flow: &FlowRecord) {
        debug!(key = %flow.key, "flow created");
    }

    fn flow_updated(&self, flow: &FlowRecord) {
        debug!(
            key = %flow.key,
            egress = flow.egress_bytes,
            ingress = flow.ingress_bytes,
            protocol = flow.classification.as_ref().map(|c| c.protocol.as_str()),
            "flow updated"
        );
    }
}

/// Classifier that never recognizes anything.
#[derive(Debug, Default)]
pub struct NoClassifier;

impl PayloadClassifier for NoClassifier {
    fn classify(&self, _payload: &[u8]) -> Option<Classification> {
        None
    }
}
