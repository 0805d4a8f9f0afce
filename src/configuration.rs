pub use clap::Parser;

use std::{
    net::{IpAddr, SocketAddr, ToSocketAddrs},
    path::PathBuf,
    time::Duration,
};

use thiserror::Error;

use crate::{
    collector::OutputFormat,
    peers::{validate_name, PeerRegistry, RegistryError},
    prober::{ProbeMode, ProberConfig},
    report::{ReportMode, DEFAULT_COLLECTOR_PORT},
    responder::DEFAULT_RESPONDER_PORT,
};

#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Invalid peer entry {0:?}, expected <name>:<host>[:<port>]")]
    InvalidPeerEntry(String),
    #[error("Cannot resolve address {0:?}")]
    UnresolvableAddress(String),
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Relay daemon configuration: Responder, one Prober per peer and the Reporter.
#[derive(Parser, Debug, Clone)]
#[clap(author = "Piotr Olszewski", version, long_about = None)]
#[clap(about = "One-way delay relay daemon")]
pub struct Configuration {
    /// Name of this host as it appears in reports
    #[clap(short, long)]
    pub name: String,
    /// Peers to measure, as "name:host[:port]|name:host[:port]|..."
    #[clap(short = 'P', long, default_value = "")]
    pub peers: String,
    /// Collector address, as "host[:port]"
    #[clap(short, long)]
    pub collector: String,
    /// Local address to bind for
    #[clap(short, long, default_value = "0.0.0.0")]
    pub local_addr: IpAddr,
    /// UDP port of the Responder, here and on peers without an explicit port
    #[clap(short = 'r', long, default_value_t = DEFAULT_RESPONDER_PORT)]
    pub responder_port: u16,
    /// UDP port of the collector when the collector address has none
    #[clap(long, default_value_t = DEFAULT_COLLECTOR_PORT)]
    pub collector_port: u16,
    /// Time to wait for a probe reply (milliseconds)
    #[clap(short, long, default_value_t = 5000)]
    pub timeout: u64,
    /// Period between reports (seconds)
    #[clap(short = 'i', long, default_value_t = 20)]
    pub report_interval: u64,
    /// Pause between measurement windows in continuous mode (seconds)
    #[clap(long, default_value_t = 10)]
    pub round_interval: u64,
    /// Stop after one window or keep measuring
    #[clap(short = 'm', long, value_enum, default_value_t = ProbeMode::Continuous)]
    pub probe_mode: ProbeMode,
    /// Report periodically or once before exiting
    #[clap(long, value_enum, default_value_t = ReportMode::Periodic)]
    pub report_mode: ReportMode,
}

impl Configuration {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        validate_name(&self.name)?;
        if self.timeout == 0 {
            return Err(ConfigurationError::ZeroValue("timeout"));
        }
        if self.report_interval == 0 {
            return Err(ConfigurationError::ZeroValue("report interval"));
        }
        self.registry()?;
        self.collector_addr()?;
        Ok(())
    }

    pub fn registry(&self) -> Result<PeerRegistry, ConfigurationError> {
        let pairs = parse_peer_list(&self.peers, self.responder_port)?;
        Ok(PeerRegistry::from_pairs(pairs)?)
    }

    pub fn collector_addr(&self) -> Result<SocketAddr, ConfigurationError> {
        resolve_addr(&self.collector, self.collector_port)
    }

    pub fn responder_addr(&self) -> SocketAddr {
        SocketAddr::new(self.local_addr, self.responder_port)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval)
    }

    pub fn prober_config(&self) -> ProberConfig {
        ProberConfig {
            timeout: Duration::from_millis(self.timeout),
            mode: self.probe_mode,
            round_interval: Duration::from_secs(self.round_interval),
        }
    }
}

/// Collector configuration.
#[derive(Parser, Debug, Clone)]
#[clap(author = "Piotr Olszewski", version, long_about = None)]
#[clap(about = "One-way delay report collector")]
pub struct CollectorConfiguration {
    /// Local address to bind for
    #[clap(short, long, default_value = "0.0.0.0")]
    pub local_addr: IpAddr,
    /// UDP port number for incoming reports
    #[clap(short = 'o', long, default_value_t = DEFAULT_COLLECTOR_PORT)]
    pub local_port: u16,
    /// How received reports are printed
    #[clap(short = 'f', long, value_enum, default_value_t = OutputFormat::Text)]
    pub output_format: OutputFormat,
    /// Directory for per-relay latest and history files (not written if unset)
    #[clap(short = 'd', long)]
    pub output_dir: Option<PathBuf>,
}

impl CollectorConfiguration {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.local_addr, self.local_port)
    }
}

/// Parses `name:host[:port]|name:host[:port]|...`.
///
/// Empty entries are skipped, so an empty string yields no peers.
pub fn parse_peer_list(
    list: &str,
    default_port: u16,
) -> Result<Vec<(String, SocketAddr)>, ConfigurationError> {
    list.split('|')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (name, host) = entry
                .split_once(':')
                .filter(|(name, host)| !name.is_empty() && !host.is_empty())
                .ok_or_else(|| ConfigurationError::InvalidPeerEntry(entry.to_string()))?;
            Ok((name.to_string(), resolve_addr(host, default_port)?))
        })
        .collect()
}

/// Resolves `host[:port]`, falling back to `default_port` when none is given.
pub fn resolve_addr(host: &str, default_port: u16) -> Result<SocketAddr, ConfigurationError> {
    if let Ok(addr) = host.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    let resolved = if host.contains(':') {
        host.to_socket_addrs()
    } else {
        (host, default_port).to_socket_addrs()
    };
    resolved
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ConfigurationError::UnresolvableAddress(host.to_string()))
}
