//! User-space relay between a TUN device and ordinary sockets.
//!
//! Each TCP connection or UDP flow seen on the tunnel becomes a [`session::Session`] owning a
//! real socket. The [`handler::SessionHandler`] terminates TCP towards the tunneled peer
//! (handshake, sequencing, acknowledgment, teardown) while the real socket talks to the
//! actual destination.

pub mod config;
pub mod error;
pub mod flow;
pub mod handler;
pub mod io;
pub mod manager;
pub mod packet;
pub mod ping;
pub mod relay;
pub mod session;
mod tcp;

pub use config::Config;
pub use error::{Error, PacketError, Result};
pub use flow::{Classification, FlowRecord, FlowSink, PayloadClassifier};
pub use handler::SessionHandler;
pub use io::{SocketMultiplexer, TunnelWriter};
pub use manager::{Opened, SessionManager};
pub use ping::{IcmpProbe, PingPool, Reachability};
pub use relay::PollingMultiplexer;
pub use session::{Session, SessionKey, SessionProtocol, SessionState};
