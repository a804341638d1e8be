use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::net::TcpListener;

use northstar_fleet::{
    bridge::BridgeProvider,
    client::DaemonClient,
    config::{ClientConfig, RunConfig, TransportKind},
    daemon::{Daemon, DaemonConfig},
    events::{init_logging, EventEmitter},
    protocol::{Request, Response},
    registry::Registry,
    session::{AgentId, FlightMode},
    sim::SimProvider,
    store::{DaemonInfo, LinkStore, StatePaths},
    transport::TransportProvider,
};

#[derive(Debug, Parser)]
#[command(name = "northstar")]
#[command(about = "Fleet command daemon and control client for radio-linked agents")]
struct Cli {
    #[command(flatten)]
    client: ClientConfig,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the fleet daemon in the foreground.
    Run(RunConfig),
    /// Ask the running daemon to tear down every session and exit.
    Stop,
    Link {
        #[arg(required = true)]
        ids: Vec<AgentId>,
    },
    Unlink(TargetArgs),
    Status {
        #[arg(long)]
        pos: bool,
        #[arg(long)]
        rot: bool,
        #[arg(long)]
        nav: bool,
        #[arg(long)]
        batt: bool,
        ids: Vec<AgentId>,
    },
    Arm(TargetArgs),
    Disarm(TargetArgs),
    Land(TargetArgs),
    Home(TargetArgs),
    /// Emergency stop. Never queued.
    Kill(TargetArgs),
    /// Run whatever each agent has stored. No ids means every linked agent.
    Launch {
        /// Send the trigger this many times per agent.
        #[arg(long, default_value_t = 1)]
        repeat: u32,
        #[command(flatten)]
        targets: TargetArgs,
    },
    Takeoff {
        altitude: f64,
        /// Accepted for compatibility; agents are not told a duration.
        #[arg(long)]
        time: Option<f64>,
        #[command(flatten)]
        targets: TargetArgs,
    },
    Move {
        /// `x,y,z`
        #[arg(allow_hyphen_values = true)]
        position: String,
        #[arg(long)]
        time: Option<f64>,
        #[command(flatten)]
        targets: TargetArgs,
    },
    Yaw {
        #[arg(allow_hyphen_values = true)]
        angle: f64,
        #[command(flatten)]
        targets: TargetArgs,
    },
    Origin {
        /// `lat,lon`
        #[arg(allow_hyphen_values = true)]
        coords: String,
        #[command(flatten)]
        targets: TargetArgs,
    },
    /// Run a DELAY on the agents, then wait in the daemon before answering.
    Delay {
        seconds: f64,
        #[command(flatten)]
        targets: TargetArgs,
    },
    Print {
        text: String,
        #[command(flatten)]
        targets: TargetArgs,
    },
    Mode {
        mode: ModeArg,
        /// AUTO target as `x,y,z`.
        #[arg(long, allow_hyphen_values = true)]
        target: Option<String>,
        #[command(flatten)]
        targets: TargetArgs,
    },
    Formation {
        pattern: String,
        size: f64,
        #[arg(long)]
        altitude: Option<f64>,
        #[arg(long)]
        set: bool,
        ids: Vec<AgentId>,
    },
    /// Store a command on the agents for a later `launch`.
    Set {
        #[command(subcommand)]
        command: SetCommand,
    },
}

#[derive(Debug, Subcommand)]
enum SetCommand {
    Arm(TargetArgs),
    Disarm(TargetArgs),
    Land(TargetArgs),
    Home(TargetArgs),
    Takeoff {
        altitude: f64,
        #[command(flatten)]
        targets: TargetArgs,
    },
    Move {
        #[arg(allow_hyphen_values = true)]
        position: String,
        #[command(flatten)]
        targets: TargetArgs,
    },
    Yaw {
        #[arg(allow_hyphen_values = true)]
        angle: f64,
        #[command(flatten)]
        targets: TargetArgs,
    },
    Delay {
        seconds: f64,
        #[command(flatten)]
        targets: TargetArgs,
    },
    Print {
        text: String,
        #[command(flatten)]
        targets: TargetArgs,
    },
}

#[derive(Debug, Clone, clap::Args)]
struct TargetArgs {
    /// Every linked agent.
    #[arg(long)]
    all: bool,

    ids: Vec<AgentId>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Idle,
    Ready,
    Auto,
    Moving,
    Takeoff,
    Land,
}

impl From<ModeArg> for FlightMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Idle => FlightMode::Idle,
            ModeArg::Ready => FlightMode::Ready,
            ModeArg::Auto => FlightMode::Auto,
            ModeArg::Moving => FlightMode::Moving,
            ModeArg::Takeoff => FlightMode::Takeoff,
            ModeArg::Land => FlightMode::Land,
        }
    }
}

/// `(id, ids)` request fields. One explicit id addresses that agent alone;
/// anything else is a batch.
type Addressing = (Option<AgentId>, Option<Vec<AgentId>>);

impl TargetArgs {
    fn addressing(&self, paths: &StatePaths) -> Result<Addressing> {
        if self.all {
            let linked = LinkStore::new(&paths.links)
                .load()
                .context("failed reading linked agents")?;
            return Ok((None, Some(linked.into_iter().collect())));
        }
        match self.ids.as_slice() {
            [] => bail!("no agent ids given (pass ids or --all)"),
            [id] => Ok((Some(*id), None)),
            ids => Ok((None, Some(ids.to_vec()))),
        }
    }

    /// Like [`addressing`](Self::addressing) but no ids means "let the daemon pick".
    fn optional_addressing(&self, paths: &StatePaths) -> Result<Addressing> {
        if !self.all && self.ids.is_empty() {
            return Ok((None, None));
        }
        self.addressing(paths)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(cfg) => run_daemon(cfg).await,
        command => {
            init_logging("warn")?;
            let paths = cli.client.state_paths();
            let request = build_request(command, &paths)?;
            let client = DaemonClient::resolve(cli.client.host.as_deref(), cli.client.port, &paths);
            let response = client.send(&request).await?;
            print_response(&response)?;
            if !response.ok {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

async fn run_daemon(cfg: RunConfig) -> Result<()> {
    init_logging(&cfg.log_level)?;

    let paths = cfg.state_paths();
    paths.ensure()?;
    let store = LinkStore::new(&paths.links);
    // Every run starts with an empty fleet.
    store.clear().context("failed clearing linked agents")?;

    let provider: Arc<dyn TransportProvider> = match cfg.transport {
        TransportKind::Sim => Arc::new(SimProvider::new()),
        TransportKind::Bridge => Arc::new(
            BridgeProvider::bind(cfg.bridge_addr)
                .with_context(|| format!("failed binding radio bridge for {}", cfg.bridge_addr))?,
        ),
    };
    let registry = Arc::new(Registry::new(provider, cfg.registry_config()).with_store(store));

    let listener = TcpListener::bind(cfg.listen_addr())
        .await
        .with_context(|| format!("failed binding {}", cfg.listen_addr()))?;
    let local = listener.local_addr()?;
    DaemonInfo {
        host: local.ip().to_string(),
        port: local.port(),
        pid: std::process::id(),
        started_at: Utc::now(),
        transport: cfg.transport.name().to_string(),
    }
    .save(&paths.daemon)?;

    let daemon = Daemon::new(
        registry,
        EventEmitter::new(cfg.json_events),
        DaemonConfig {
            accept_timeout: Duration::from_secs(1),
            shutdown_grace: cfg.shutdown_grace(),
        },
    );

    let watcher = daemon.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        watcher.request_shutdown();
    });

    let result = daemon.serve(listener).await;
    if let Err(error) = DaemonInfo::remove(&paths.daemon) {
        tracing::warn!(path = %paths.daemon.display(), error = %error, "failed removing daemon info");
    }
    result
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("received SIGINT, shutting down");
                    }
                    _ = sigterm.recv() => {
                        tracing::info!("received SIGTERM, shutting down");
                    }
                }
                return;
            }
            Err(error) => {
                tracing::warn!(error = %error, "SIGTERM handler unavailable");
            }
        }
    }

    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %error, "ctrl-c handler unavailable");
        std::future::pending::<()>().await;
    }
    tracing::info!("received SIGINT, shutting down");
}

fn build_request(command: Commands, paths: &StatePaths) -> Result<Request> {
    let request = match command {
        Commands::Run(_) => bail!("`run` is not a client command"),
        Commands::Stop => Request::Shutdown,
        Commands::Link { ids } => Request::Link { ids },
        Commands::Unlink(targets) => {
            if targets.all {
                Request::Unlink {
                    ids: Vec::new(),
                    all: true,
                }
            } else if targets.ids.is_empty() {
                bail!("no agent ids given (pass ids or --all)");
            } else {
                Request::Unlink {
                    ids: targets.ids,
                    all: false,
                }
            }
        }
        Commands::Status {
            pos,
            rot,
            nav,
            batt,
            ids,
        } => Request::Status {
            ids: (!ids.is_empty()).then_some(ids),
            pos,
            rot,
            nav,
            batt,
        },
        Commands::Arm(targets) => {
            let (id, ids) = targets.addressing(paths)?;
            Request::Arm { id, ids, setcmd: false }
        }
        Commands::Disarm(targets) => {
            let (id, ids) = targets.addressing(paths)?;
            Request::Disarm { id, ids, setcmd: false }
        }
        Commands::Land(targets) => {
            let (id, ids) = targets.addressing(paths)?;
            Request::Land { id, ids, setcmd: false }
        }
        Commands::Home(targets) => {
            let (id, ids) = targets.addressing(paths)?;
            Request::Home { id, ids, setcmd: false }
        }
        Commands::Kill(targets) => {
            let (id, ids) = targets.addressing(paths)?;
            Request::Kill { id, ids, setcmd: false }
        }
        Commands::Launch { repeat, targets } => {
            let (id, ids) = targets.optional_addressing(paths)?;
            Request::Launch {
                id,
                ids,
                repeat: Some(repeat),
            }
        }
        Commands::Takeoff {
            altitude,
            time,
            targets,
        } => {
            let (id, ids) = targets.addressing(paths)?;
            Request::Takeoff {
                id,
                ids,
                altitude,
                time,
                setcmd: false,
            }
        }
        Commands::Move {
            position,
            time,
            targets,
        } => {
            let (id, ids) = targets.addressing(paths)?;
            Request::Move {
                id,
                ids,
                position: parse_numbers(&position, 3)?,
                time,
                setcmd: false,
            }
        }
        Commands::Yaw { angle, targets } => {
            let (id, ids) = targets.addressing(paths)?;
            Request::Yaw {
                id,
                ids,
                angle,
                setcmd: false,
            }
        }
        Commands::Origin { coords, targets } => {
            let (id, ids) = targets.addressing(paths)?;
            let coords = parse_numbers(&coords, 2)?;
            Request::Origin {
                id,
                ids,
                lat: coords[0],
                lon: coords[1],
            }
        }
        Commands::Delay { seconds, targets } => {
            let (id, ids) = targets.addressing(paths)?;
            Request::Delay {
                id,
                ids,
                seconds,
                setcmd: false,
            }
        }
        Commands::Print { text, targets } => {
            let (id, ids) = targets.addressing(paths)?;
            Request::Print {
                id,
                ids,
                text,
                setcmd: false,
            }
        }
        Commands::Mode {
            mode,
            target,
            targets,
        } => {
            let (id, ids) = targets.addressing(paths)?;
            Request::Mode {
                id,
                ids,
                mode: mode.into(),
                target: target.as_deref().map(|t| parse_numbers(t, 3)).transpose()?,
            }
        }
        Commands::Formation {
            pattern,
            size,
            altitude,
            set,
            ids,
        } => Request::Formation {
            pattern,
            size,
            ids: (!ids.is_empty()).then_some(ids),
            altitude,
            setcmd: set,
        },
        Commands::Set { command } => build_stored_request(command, paths)?,
    };
    Ok(request)
}

fn build_stored_request(command: SetCommand, paths: &StatePaths) -> Result<Request> {
    let request = match command {
        SetCommand::Arm(targets) => {
            let (id, ids) = targets.addressing(paths)?;
            Request::Arm { id, ids, setcmd: true }
        }
        SetCommand::Disarm(targets) => {
            let (id, ids) = targets.addressing(paths)?;
            Request::Disarm { id, ids, setcmd: true }
        }
        SetCommand::Land(targets) => {
            let (id, ids) = targets.addressing(paths)?;
            Request::Land { id, ids, setcmd: true }
        }
        SetCommand::Home(targets) => {
            let (id, ids) = targets.addressing(paths)?;
            Request::Home { id, ids, setcmd: true }
        }
        SetCommand::Takeoff { altitude, targets } => {
            let (id, ids) = targets.addressing(paths)?;
            Request::Takeoff {
                id,
                ids,
                altitude,
                time: None,
                setcmd: true,
            }
        }
        SetCommand::Move { position, targets } => {
            let (id, ids) = targets.addressing(paths)?;
            Request::Move {
                id,
                ids,
                position: parse_numbers(&position, 3)?,
                time: None,
                setcmd: true,
            }
        }
        SetCommand::Yaw { angle, targets } => {
            let (id, ids) = targets.addressing(paths)?;
            Request::Yaw {
                id,
                ids,
                angle,
                setcmd: true,
            }
        }
        SetCommand::Delay { seconds, targets } => {
            let (id, ids) = targets.addressing(paths)?;
            Request::Delay {
                id,
                ids,
                seconds,
                setcmd: true,
            }
        }
        SetCommand::Print { text, targets } => {
            let (id, ids) = targets.addressing(paths)?;
            Request::Print {
                id,
                ids,
                text,
                setcmd: true,
            }
        }
    };
    Ok(request)
}

/// Parse `a,b,c` into exactly `count` numbers.
fn parse_numbers(raw: &str, count: usize) -> Result<Vec<f64>> {
    let values = raw
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<f64>()
                .with_context(|| format!("`{}` is not a number", part.trim()))
        })
        .collect::<Result<Vec<f64>>>()?;
    if values.len() != count {
        bail!("expected {count} comma-separated numbers, got {}", values.len());
    }
    Ok(values)
}

fn print_response(response: &Response) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(response)?);
    Ok(())
}
