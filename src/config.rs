use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::ValueEnum;

use crate::protocol::DEFAULT_PORT;
use crate::registry::RegistryConfig;
use crate::session::SessionConfig;
use crate::store::StatePaths;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_BRIDGE_ADDR: &str = "127.0.0.1:7780";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportKind {
    /// In-process simulated agents.
    Sim,
    /// UDP datagrams to an external radio gateway.
    Bridge,
}

impl TransportKind {
    pub fn name(self) -> &'static str {
        match self {
            TransportKind::Sim => "sim",
            TransportKind::Bridge => "bridge",
        }
    }
}

/// Options for `northstar run`.
#[derive(Debug, Clone, clap::Args)]
pub struct RunConfig {
    #[arg(long, default_value = DEFAULT_HOST)]
    pub host: String,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    #[arg(long, value_enum, default_value_t = TransportKind::Sim)]
    pub transport: TransportKind,

    /// Radio gateway address for `--transport bridge`.
    #[arg(long, default_value = DEFAULT_BRIDGE_ADDR)]
    pub bridge_addr: SocketAddr,

    /// Re-assertion period per agent, in milliseconds.
    #[arg(long, default_value_t = 30)]
    pub tick_ms: u64,

    /// KILL frames sent when a session is torn down.
    #[arg(long, default_value_t = 1000)]
    pub kill_retries: u32,

    /// Pause between opening successive new sessions, in milliseconds.
    #[arg(long, default_value_t = 50)]
    pub link_stagger_ms: u64,

    /// Seconds to wait for every session to tear down on shutdown.
    #[arg(long, default_value_t = 10)]
    pub shutdown_grace_secs: u64,

    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[arg(long, default_value_t = false)]
    pub json_events: bool,
}

impl RunConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn state_paths(&self) -> StatePaths {
        StatePaths::new(self.state_dir.clone().unwrap_or_else(StatePaths::default_root))
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            session: SessionConfig {
                tick: Duration::from_millis(self.tick_ms.max(1)),
                kill_retries: self.kill_retries,
                ..SessionConfig::default()
            },
            link_stagger: Duration::from_millis(self.link_stagger_ms),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Where client subcommands find the daemon. Given before the subcommand.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ClientConfig {
    #[arg(long)]
    pub host: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long)]
    pub state_dir: Option<PathBuf>,
}

impl ClientConfig {
    pub fn state_paths(&self) -> StatePaths {
        StatePaths::new(self.state_dir.clone().unwrap_or_else(StatePaths::default_root))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Debug, Parser)]
    struct Harness {
        #[command(flatten)]
        run: RunConfig,
    }

    #[test]
    fn defaults_match_fleet_timing() {
        let cfg = Harness::parse_from(["northstar"]).run;
        assert_eq!(cfg.listen_addr(), "127.0.0.1:7777");
        assert_eq!(cfg.transport, TransportKind::Sim);
        assert_eq!(cfg.bridge_addr, "127.0.0.1:7780".parse::<SocketAddr>().unwrap());

        let registry = cfg.registry_config();
        assert_eq!(registry.session.tick, Duration::from_millis(30));
        assert_eq!(registry.session.kill_retries, 1000);
        assert_eq!(registry.link_stagger, Duration::from_millis(50));
    }

    #[test]
    fn flags_override_defaults() {
        let cfg = Harness::parse_from([
            "northstar",
            "--port",
            "9000",
            "--transport",
            "bridge",
            "--kill-retries",
            "200",
            "--state-dir",
            "/tmp/ns",
        ])
        .run;
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.transport, TransportKind::Bridge);
        assert_eq!(cfg.registry_config().session.kill_retries, 200);
        assert_eq!(cfg.state_paths().links, PathBuf::from("/tmp/ns/links.json"));
    }
}
