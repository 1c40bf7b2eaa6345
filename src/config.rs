//! Runtime configuration: defaults, then an optional YAML file, then `TUN_RELAY_*` variables.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable prefix. Nested keys are separated by `__`,
/// e.g. `TUN_RELAY_PING__MAX_WORKERS=8`.
pub const ENV_PREFIX: &str = "TUN_RELAY_";

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct TunnelConf {
    /// Name of the TUN interface to open.
    pub name: String,
    /// Largest packet read from the interface.
    pub mtu: usize,
}

impl Default for TunnelConf {
    fn default() -> Self {
        Self {
            name: "tun0".to_string(),
            mtu: 1500,
        }
    }
}

/// Outbound TCP connections to `port` go to `target` instead of their original destination.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct PortRedirection {
    pub port: u16,
    pub target: SocketAddr,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConf {
    /// Sessions untouched for longer than this are evicted by the relay sweep.
    pub idle_timeout_secs: u64,
    /// SO_RCVBUF for outbound TCP sockets.
    pub receive_buffer_size: usize,
    /// Interface index used as the scope of fe80::/10 UDP destinations. 0 leaves it unset.
    pub link_local_scope_id: u32,
    pub tcp_port_redirections: Vec<PortRedirection>,
}

impl Default for SessionConf {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 120,
            receive_buffer_size: 65535,
            link_local_scope_id: 0,
            tcp_port_redirections: Vec::new(),
        }
    }
}

impl SessionConf {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn redirection_for(&self, port: u16) -> Option<SocketAddr> {
        self.tcp_port_redirections
            .iter()
            .find(|r| r.port == port)
            .map(|r| r.target)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct PingConf {
    pub core_workers: usize,
    pub max_workers: usize,
    /// Idle time after which workers beyond the core exit.
    pub keep_alive_secs: u64,
    pub probe_timeout_secs: u64,
}

impl Default for PingConf {
    fn default() -> Self {
        Self {
            core_workers: 1,
            max_workers: 20,
            keep_alive_secs: 60,
            probe_timeout_secs: 10,
        }
    }
}

impl PingConf {
    /// Upper bound for `max_workers`.
    pub const WORKER_LIMIT: usize = 20;

    pub fn validate(&self) -> Result<()> {
        if !(1..=Self::WORKER_LIMIT).contains(&self.max_workers) {
            return Err(Error::InvalidConfig(format!(
                "ping.max_workers must be between 1 and {}, got {}",
                Self::WORKER_LIMIT,
                self.max_workers
            )));
        }
        if self.core_workers > self.max_workers {
            return Err(Error::InvalidConfig(format!(
                "ping.core_workers ({}) exceeds ping.max_workers ({})",
                self.core_workers, self.max_workers
            )));
        }
        Ok(())
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConf {
    /// Upper bound on how long the relay sleeps between socket passes.
    pub poll_interval_ms: u64,
}

impl Default for RelayConf {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
        }
    }
}

impl RelayConf {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub tunnel: TunnelConf,
    pub session: SessionConf,
    pub ping: PingConf,
    pub relay: RelayConf,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tunnel: TunnelConf::default(),
            session: SessionConf::default(),
            ping: PingConf::default(),
            relay: RelayConf::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: Self = Self::figment(path).extract()?;
        config.ping.validate()?;
        Ok(config)
    }
}
