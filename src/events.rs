use std::io::{self, Write};

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::{fmt, EnvFilter};

use crate::session::AgentId;

/// Install the global subscriber. Falls back to `info` when `level` is not a
/// valid filter directive.
pub fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FleetEvent {
    DaemonStarted {
        addr: String,
        transport: String,
    },
    AgentLinked {
        id: AgentId,
        channel: usize,
    },
    AgentLinkFailed {
        id: AgentId,
        reason: String,
    },
    AgentUnlinked {
        id: AgentId,
    },
    Launch {
        ids: Vec<AgentId>,
        repeat: u32,
    },
    Shutdown {
        reason: String,
    },
}

impl FleetEvent {
    pub fn name(&self) -> &'static str {
        match self {
            FleetEvent::DaemonStarted { .. } => "daemon_started",
            FleetEvent::AgentLinked { .. } => "agent_linked",
            FleetEvent::AgentLinkFailed { .. } => "agent_link_failed",
            FleetEvent::AgentUnlinked { .. } => "agent_unlinked",
            FleetEvent::Launch { .. } => "launch",
            FleetEvent::Shutdown { .. } => "shutdown",
        }
    }
}

/// Writes one JSON line per fleet event to stderr when enabled.
#[derive(Clone, Debug)]
pub struct EventEmitter {
    json_output: bool,
}

impl EventEmitter {
    pub fn new(json_output: bool) -> Self {
        Self { json_output }
    }

    pub fn disabled() -> Self {
        Self::new(false)
    }

    pub fn emit(&self, event: &FleetEvent) {
        if !self.json_output {
            return;
        }

        let line = json!({
            "ts": Utc::now().to_rfc3339(),
            "type": event.name(),
            "payload": event,
        });

        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "{}", line);
    }
}
