use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use tun_tap::{Iface, Mode};

use tun_relay::{
    Config, IcmpProbe, PingPool, PollingMultiplexer, SessionHandler, SessionManager,
    SocketMultiplexer, TunnelWriter,
};

#[derive(Debug, Parser)]
#[command(name = "tun-relay", version, about = "Relay TUN traffic through ordinary sockets")]
struct Args {
    /// YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TUN interface name, overrides the configuration.
    #[arg(short, long)]
    interface: Option<String>,

    /// Log filter used when RUST_LOG is unset, overrides the configuration.
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> tun_relay::Result<()> {
    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(name) = args.interface {
        config.tunnel.name = name;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let nic = Arc::new(Iface::without_packet_info(&config.tunnel.name, Mode::Tun)?);
    info!(interface = nic.name(), "opened tunnel");
    let writer: Arc<dyn TunnelWriter> = nic.clone();

    let manager = Arc::new(SessionManager::new(config.session.clone()));
    let relay = Arc::new(PollingMultiplexer::new(
        Arc::clone(&manager),
        Arc::clone(&writer),
        &config,
    ));
    let relay_thread = relay.start()?;

    let ping = PingPool::new(config.ping.clone(), Arc::new(IcmpProbe), Arc::clone(&writer));
    let multiplexer: Arc<dyn SocketMultiplexer> = relay.clone();
    let handler =
        SessionHandler::new(manager, multiplexer, writer, ping).with_mtu(config.tunnel.mtu);

    let mut buf = vec![0u8; config.tunnel.mtu];
    loop {
        let nbytes = match nic.recv(&mut buf) {
            Ok(n) => n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(%err, "tunnel read failed, shutting down");
                break;
            }
        };
        if let Err(err) = handler.handle_packet(&buf[..nbytes]) {
            debug!(%err, len = nbytes, "dropping packet");
        }
    }

    relay.stop();
    if relay_thread.join().is_err() {
        warn!("relay thread panicked");
    }
    Ok(())
}
