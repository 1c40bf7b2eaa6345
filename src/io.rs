//! Collaborators the protocol engine drives but does not own.

use std::sync::Arc;

use tracing::warn;

use crate::session::{Session, SessionKey};

/// Sink for complete outgoing IP packets, injected back into the tunnel.
///
/// Implementations must not block the caller for long.
pub trait TunnelWriter: Send + Sync {
    fn write(&self, packet: &[u8]);
}

/// Owns readiness notification for session sockets.
pub trait SocketMultiplexer: Send + Sync {
    /// Starts watching a fully initialized session.
    fn register_session(&self, session: &Arc<Session>);

    /// Asks for a write-readiness pass over `session` soon.
    fn refresh_select(&self, session: &Arc<Session>);

    /// Stops watching. Called before the session's socket is closed.
    fn cancel(&self, key: &SessionKey);
}

impl TunnelWriter for tun_tap::Iface {
    fn write(&self, packet: &[u8]) {
        if let Err(err) = self.send(packet) {
            warn!(%err, len = packet.len(), "failed to write packet to tunnel");
        }
    }
}
