//! Fleet daemon: accepts control connections and drives the registry.
//!
//! The accept loop polls with a bounded timeout so it notices a shutdown
//! request promptly. Each connection runs on its own task and answers its
//! requests in order, so a slow request (a server-side `delay`, a staggered
//! `link`) never holds up the accept loop or other clients.

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tracing::Instrument;
use uuid::Uuid;

use crate::codec::{self, Command};
use crate::envelope::DispatchMode;
use crate::error::{FleetError, Result as FleetResult};
use crate::events::{EventEmitter, FleetEvent};
use crate::formation::{self, Pattern, FORMATION_ALTITUDE};
use crate::protocol::{AgentEntry, Navigation, Request, Response, Targets};
use crate::registry::Registry;
use crate::session::{AgentId, AgentSession, FlightMode, Vector3};

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// How long one accept attempt waits before re-checking for shutdown.
    pub accept_timeout: Duration,
    /// Upper bound on registry teardown once the accept loop has stopped.
    pub shutdown_grace: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            accept_timeout: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

pub struct Daemon {
    registry: Arc<Registry>,
    events: EventEmitter,
    config: DaemonConfig,
    shutdown: AtomicBool,
}

/// Which status fields to report.
#[derive(Debug, Clone, Copy)]
struct StatusFlags {
    pos: bool,
    rot: bool,
    nav: bool,
    batt: bool,
}

impl Daemon {
    pub fn new(registry: Arc<Registry>, events: EventEmitter, config: DaemonConfig) -> Arc<Self> {
        Arc::new(Self {
            registry,
            events,
            config,
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn request_shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            tracing::info!(target = "northstar::daemon", "shutdown requested");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Run the accept loop until shutdown is requested, then tear down every
    /// session (bounded by the shutdown grace) before releasing the socket.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(target = "northstar::daemon", addr = %addr, transport = self.registry.provider_name(), "fleet daemon listening");
        self.events.emit(&FleetEvent::DaemonStarted {
            addr: addr.to_string(),
            transport: self.registry.provider_name().to_string(),
        });

        while !self.is_shutting_down() {
            match timeout(self.config.accept_timeout, listener.accept()).await {
                Err(_) => continue,
                Ok(Ok((stream, peer))) => {
                    let daemon = self.clone();
                    tokio::spawn(async move { daemon.handle_connection(stream, peer).await });
                }
                Ok(Err(error)) => {
                    tracing::warn!(target = "northstar::daemon", error = %error, "accept failed");
                }
            }
        }

        self.events.emit(&FleetEvent::Shutdown {
            reason: "requested".into(),
        });
        let unfinished = self
            .registry
            .shutdown_within(Some(self.config.shutdown_grace))
            .await;
        if !unfinished.is_empty() {
            tracing::warn!(
                target = "northstar::daemon",
                grace_secs = self.config.shutdown_grace.as_secs(),
                unfinished = unfinished.len(),
                "session teardown did not finish in time"
            );
        }
        drop(listener);
        tracing::info!(target = "northstar::daemon", "fleet daemon stopped");
        Ok(())
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(error) => {
                    tracing::debug!(target = "northstar::daemon", peer = %peer, error = %error, "connection read failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let response = self.handle_line(&line).await;
            let mut body = match serde_json::to_vec(&response) {
                Ok(body) => body,
                Err(error) => {
                    tracing::error!(target = "northstar::daemon", error = %error, "failed to encode response");
                    break;
                }
            };
            body.push(b'\n');
            if let Err(error) = writer.write_all(&body).await {
                tracing::debug!(target = "northstar::daemon", peer = %peer, error = %error, "connection write failed");
                break;
            }
        }
    }

    /// Parse and answer one request line.
    pub async fn handle_line(&self, line: &str) -> Response {
        match Request::parse(line) {
            Ok(request) => self.handle(request).await,
            Err(error) => {
                tracing::debug!(target = "northstar::daemon", error = %error, "rejected request");
                Response::error(error.to_string())
            }
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        let span = tracing::info_span!(
            "request",
            request_id = %Uuid::new_v4(),
            action = request.action()
        );
        async {
            let response = self.dispatch(request).await;
            if let Some(error) = &response.error {
                tracing::debug!(target = "northstar::daemon", error = %error, "request failed");
            }
            response
        }
        .instrument(span)
        .await
    }

    async fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::Link { ids } => self.handle_link(&ids).await,
            Request::Unlink { ids, all } => self.handle_unlink(&ids, all).await,
            Request::Status {
                ids,
                pos,
                rot,
                nav,
                batt,
            } => {
                // No flags means everything.
                let flags = if pos || rot || nav || batt {
                    StatusFlags { pos, rot, nav, batt }
                } else {
                    StatusFlags {
                        pos: true,
                        rot: true,
                        nav: true,
                        batt: true,
                    }
                };
                self.handle_status(ids, flags)
            }
            Request::Arm { id, ids, setcmd } => {
                let mode = DispatchMode::from_setcmd(setcmd);
                self.command(id, ids, Command::Arm, |s| s.arm(mode))
            }
            Request::Disarm { id, ids, setcmd } => {
                let mode = DispatchMode::from_setcmd(setcmd);
                self.command(id, ids, Command::Disarm, |s| s.disarm(mode))
            }
            Request::Land { id, ids, setcmd } => {
                let mode = DispatchMode::from_setcmd(setcmd);
                self.command(id, ids, Command::Land, |s| s.land(mode))
            }
            Request::Home { id, ids, setcmd } => {
                let mode = DispatchMode::from_setcmd(setcmd);
                self.command(id, ids, Command::Home, |s| s.home(mode))
            }
            Request::Kill { id, ids, setcmd } => {
                if setcmd {
                    tracing::debug!(target = "northstar::daemon", "kill ignores setcmd");
                }
                self.command(id, ids, Command::Kill, |s| s.kill())
            }
            Request::Takeoff {
                id,
                ids,
                altitude,
                time,
                setcmd,
            } => {
                log_ignored_time(time);
                let mode = DispatchMode::from_setcmd(setcmd);
                let command = Command::Takeoff {
                    altitude: altitude as f32,
                };
                self.command(id, ids, command, |s| s.takeoff(altitude, mode))
            }
            Request::Move {
                id,
                ids,
                position,
                time,
                setcmd,
            } => {
                log_ignored_time(time);
                let command = match Command::move_to(&position) {
                    Ok(command) => command,
                    Err(error) => return Response::error(FleetError::from(error).to_string()),
                };
                let mode = DispatchMode::from_setcmd(setcmd);
                self.command(id, ids, command, |s| s.move_to(&position, mode))
            }
            Request::Yaw {
                id,
                ids,
                angle,
                setcmd,
            } => {
                let mode = DispatchMode::from_setcmd(setcmd);
                let command = Command::Yaw {
                    angle: angle as f32,
                };
                self.command(id, ids, command, |s| s.yaw(angle, mode))
            }
            Request::Origin { id, ids, lat, lon } => {
                self.command(id, ids, Command::Origin { lat, lon }, |s| s.origin(lat, lon))
            }
            Request::Launch { id, ids, repeat } => self.handle_launch(id, ids, repeat.unwrap_or(1)),
            Request::Delay {
                id,
                ids,
                seconds,
                setcmd,
            } => self.handle_delay(id, ids, seconds, setcmd).await,
            Request::Print {
                id,
                ids,
                text,
                setcmd,
            } => {
                let mode = DispatchMode::from_setcmd(setcmd);
                match Targets::from_fields(id, ids) {
                    Some(targets) => self.fan_out(targets, |s| s.print(&text, mode)),
                    None => missing_target(),
                }
            }
            Request::Mode {
                id,
                ids,
                mode,
                target,
            } => self.handle_mode(id, ids, mode, target),
            Request::Formation {
                pattern,
                size,
                ids,
                altitude,
                setcmd,
            } => self.handle_formation(&pattern, size, ids, altitude, setcmd),
            Request::Shutdown => {
                self.request_shutdown();
                Response::ok()
            }
        }
    }

    async fn handle_link(&self, ids: &[AgentId]) -> Response {
        let outcome = self.registry.link(ids).await;
        let mut status = BTreeMap::new();
        for id in outcome.opened.iter().chain(&outcome.already_linked) {
            status.insert(*id, AgentEntry::success());
        }
        for id in &outcome.opened {
            let channel = self.registry.resolve(*id).map(|s| s.channel()).unwrap_or_default();
            self.events.emit(&FleetEvent::AgentLinked { id: *id, channel });
        }
        for (id, reason) in &outcome.failed {
            self.events.emit(&FleetEvent::AgentLinkFailed {
                id: *id,
                reason: reason.clone(),
            });
            status.insert(*id, AgentEntry::failure(reason.clone()));
        }
        Response::with_status(status)
    }

    async fn handle_unlink(&self, ids: &[AgentId], all: bool) -> Response {
        let outcome = if all {
            self.registry.unlink_all().await
        } else if ids.is_empty() {
            return Response::error("unlink needs `ids` or `all`");
        } else {
            self.registry.unlink(ids).await
        };

        let mut status = BTreeMap::new();
        for id in &outcome.closed {
            self.events.emit(&FleetEvent::AgentUnlinked { id: *id });
            status.insert(*id, AgentEntry::success());
        }
        for id in &outcome.not_linked {
            status.insert(*id, AgentEntry::failure("Not linked"));
        }
        Response::with_status(status)
    }

    /// Reads only the mirrored scalars; never waits on an agent.
    fn handle_status(&self, ids: Option<Vec<AgentId>>, flags: StatusFlags) -> Response {
        let ids = ids.unwrap_or_else(|| self.registry.linked_ids());
        let mut status = BTreeMap::new();
        for (id, resolved) in self.registry.resolve_many(&ids) {
            let entry = match resolved {
                Ok(session) => status_entry(&session, flags),
                Err(error) => AgentEntry::failure(error.to_string()),
            };
            status.insert(id, entry);
        }
        Response::with_status(status)
    }

    fn handle_launch(&self, id: Option<AgentId>, ids: Option<Vec<AgentId>>, repeat: u32) -> Response {
        let targets = Targets::from_fields(id, ids)
            .unwrap_or_else(|| Targets::Batch(self.registry.linked_ids()));
        let target_ids = targets.ids();
        if target_ids.is_empty() {
            return Response::error("No agents to launch");
        }

        // Resolve everyone before the first trigger so the triggers go out
        // back to back.
        let resolved = self.registry.resolve_many(&target_ids);
        let mut results = Vec::with_capacity(resolved.len());
        for (agent, session) in resolved {
            let result = session.and_then(|s| s.launch(repeat).map(|_| ()));
            results.push((agent, result));
        }
        self.events.emit(&FleetEvent::Launch {
            ids: target_ids,
            repeat: repeat.max(1),
        });

        match targets {
            Targets::Single(agent) => match results.pop() {
                Some((_, Ok(()))) => Response::ok(),
                Some((_, Err(FleetError::NotConnected(_)))) | None => not_connected(agent),
                Some((_, Err(error))) => Response::error(error.to_string()),
            },
            Targets::Batch(_) => Response::with_status(
                results
                    .into_iter()
                    .map(|(agent, result)| (agent, entry_for(result)))
                    .collect(),
            ),
        }
    }

    async fn handle_delay(
        &self,
        id: Option<AgentId>,
        ids: Option<Vec<AgentId>>,
        seconds: f64,
        setcmd: bool,
    ) -> Response {
        if let Err(error) = codec::encode_millis(seconds) {
            return Response::error(FleetError::from(error).to_string());
        }
        let Some(targets) = Targets::from_fields(id, ids) else {
            return missing_target();
        };
        if setcmd {
            return self.fan_out(targets, |s| s.delay(seconds, DispatchMode::Store));
        }
        let Ok(wait) = Duration::try_from_secs_f64(seconds) else {
            return Response::error(format!("delay of {seconds}s is out of range"));
        };

        // Immediate delay: agents get the DELAY slot right away and the
        // daemon waits before answering. Only this connection's task is held
        // up.
        let response = self.fan_out(targets, |s| s.delay(seconds, DispatchMode::Immediate));
        if response.ok {
            tokio::time::sleep(wait).await;
        }
        response
    }

    fn handle_mode(
        &self,
        id: Option<AgentId>,
        ids: Option<Vec<AgentId>>,
        mode: FlightMode,
        target: Option<Vec<f64>>,
    ) -> Response {
        if !mode.is_bound() {
            return Response::error(format!("flight mode {} cannot be selected", mode.name().to_ascii_lowercase()));
        }
        let target: Option<Vector3> = match target.as_deref() {
            None => None,
            Some([x, y, z]) => Some([*x, *y, *z]),
            Some(other) => {
                return Response::error(format!(
                    "encode error: expected 3 components, got {}",
                    other.len()
                ))
            }
        };
        if let Some(target) = target {
            if let Err(error) = Command::move_to(&target).and_then(|c| c.encode()) {
                return Response::error(FleetError::from(error).to_string());
            }
        }

        match Targets::from_fields(id, ids) {
            Some(targets) => self.fan_out(targets, |s| {
                if let Some(target) = target {
                    s.set_target(target)?;
                }
                s.set_mode(mode);
                Ok(())
            }),
            None => missing_target(),
        }
    }

    fn handle_formation(
        &self,
        pattern: &str,
        size: f64,
        ids: Option<Vec<AgentId>>,
        altitude: Option<f64>,
        setcmd: bool,
    ) -> Response {
        let mut ids = ids.unwrap_or_else(|| self.registry.linked_ids());
        ids.sort();
        ids.dedup();

        let plan = pattern
            .parse::<Pattern>()
            .and_then(|p| formation::plan_at(p, size, ids.len(), altitude.unwrap_or(FORMATION_ALTITUDE)));
        let positions = match plan {
            Ok(positions) => positions,
            Err(error) => return Response::error(FleetError::from(error).to_string()),
        };

        let mode = DispatchMode::from_setcmd(setcmd);
        let mut status = BTreeMap::new();
        for (agent, position) in ids.iter().zip(&positions) {
            let result = self
                .registry
                .resolve(*agent)
                .and_then(|s| s.move_to(position, mode));
            status.insert(*agent, entry_for(result));
        }
        tracing::info!(
            target = "northstar::daemon",
            pattern,
            placed = positions.len(),
            "formation dispatched"
        );
        Response::with_status(status)
    }

    /// Validate `command` once, then run `op` on every target.
    fn command<F>(&self, id: Option<AgentId>, ids: Option<Vec<AgentId>>, command: Command, op: F) -> Response
    where
        F: Fn(&AgentSession) -> FleetResult<()>,
    {
        if let Err(error) = command.encode() {
            return Response::error(FleetError::from(error).to_string());
        }
        match Targets::from_fields(id, ids) {
            Some(targets) => self.fan_out(targets, op),
            None => missing_target(),
        }
    }

    /// Run `op` per target. A single target turns failure into `ok:false`; a
    /// batch folds each failure into that agent's entry and keeps going.
    fn fan_out<F>(&self, targets: Targets, op: F) -> Response
    where
        F: Fn(&AgentSession) -> FleetResult<()>,
    {
        match targets {
            Targets::Single(agent) => match self.registry.resolve(agent) {
                Err(_) => not_connected(agent),
                Ok(session) => match op(session.as_ref()) {
                    Ok(()) => Response::ok(),
                    Err(error) => Response::error(error.to_string()),
                },
            },
            Targets::Batch(agents) => {
                let mut status = BTreeMap::new();
                for (agent, resolved) in self.registry.resolve_many(&agents) {
                    let result = resolved.and_then(|s| op(s.as_ref()));
                    if let Err(error) = &result {
                        if !error.is_per_agent() {
                            tracing::warn!(target = "northstar::daemon", agent_id = %agent, error = %error, "batch command failed");
                        }
                    }
                    status.insert(agent, entry_for(result));
                }
                Response::with_status(status)
            }
        }
    }
}

fn status_entry(session: &AgentSession, flags: StatusFlags) -> AgentEntry {
    let snapshot = session.status();
    AgentEntry {
        ok: None,
        pos: flags.pos.then_some(snapshot.telemetry.position),
        rot: flags.rot.then_some(snapshot.telemetry.heading),
        nav: flags.nav.then(|| Navigation {
            mode: snapshot.mode,
            connected: snapshot.telemetry.connected,
            channel: snapshot.channel,
            target: snapshot.target,
        }),
        batt: flags.batt.then_some(serde_json::Value::Null),
        error: None,
    }
}

fn entry_for(result: FleetResult<()>) -> AgentEntry {
    match result {
        Ok(()) => AgentEntry::success(),
        Err(error) => AgentEntry::failure(error.to_string()),
    }
}

fn not_connected(id: AgentId) -> Response {
    Response::error(format!("Agent {id} not connected"))
}

fn missing_target() -> Response {
    Response::error("missing field `id`")
}

fn log_ignored_time(time: Option<f64>) {
    if let Some(time) = time {
        tracing::debug!(target = "northstar::daemon", time, "command duration is not forwarded to agents");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryConfig;
    use crate::session::SessionConfig;
    use crate::sim::{Executed, SimProvider};

    fn id(raw: u32) -> AgentId {
        AgentId::new(raw).unwrap()
    }

    fn daemon(provider: Arc<SimProvider>) -> Arc<Daemon> {
        let registry = Registry::new(
            provider,
            RegistryConfig {
                session: SessionConfig {
                    kill_retries: 10,
                    ..SessionConfig::default()
                },
                link_stagger: Duration::ZERO,
            },
        );
        Daemon::new(Arc::new(registry), EventEmitter::disabled(), DaemonConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn batch_with_missing_agent_reports_per_agent() {
        let provider = Arc::new(SimProvider::new());
        let daemon = daemon(provider);
        daemon.handle_line(r#"{"action":"link","ids":[1,3]}"#).await;

        let response = daemon
            .handle_line(r#"{"action":"arm","ids":[1,2,3]}"#)
            .await;
        assert!(response.ok);
        assert_eq!(response.entry(id(1)), Some(&AgentEntry::success()));
        assert_eq!(response.entry(id(2)).unwrap().error.as_deref(), Some("Not connected"));
        assert_eq!(response.entry(id(3)), Some(&AgentEntry::success()));
        daemon.registry().shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn single_missing_agent_fails_the_request() {
        let daemon = daemon(Arc::new(SimProvider::new()));
        let response = daemon.handle_line(r#"{"action":"land","id":5}"#).await;
        assert!(!response.ok);
        assert_eq!(response.error.as_deref(), Some("Agent 5 not connected"));
    }

    #[tokio::test(start_paused = true)]
    async fn bad_position_sends_nothing() {
        let provider = Arc::new(SimProvider::new());
        let daemon = daemon(provider.clone());
        daemon.handle_line(r#"{"action":"link","ids":[1]}"#).await;
        let agent = provider.agent(id(1)).unwrap();
        agent.clear_frames();

        let response = daemon
            .handle_line(r#"{"action":"move","ids":[1],"position":[1.0,2.0]}"#)
            .await;
        assert!(!response.ok);
        assert!(response.error.unwrap().contains("expected 3 components"));
        assert!(agent.frames().iter().all(|f| f[1] != codec::OP_MOVE));
        daemon.registry().shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn store_then_launch_runs_once_per_agent() {
        let provider = Arc::new(SimProvider::new());
        let daemon = daemon(provider.clone());
        daemon.handle_line(r#"{"action":"link","ids":[1,2]}"#).await;

        let response = daemon
            .handle_line(r#"{"action":"takeoff","ids":[1,2],"altitude":2.0,"setcmd":true}"#)
            .await;
        assert!(response.ok);
        let response = daemon.handle_line(r#"{"action":"launch","repeat":5}"#).await;
        assert!(response.ok);
        assert_eq!(response.status.as_ref().unwrap().len(), 2);

        for raw in [1, 2] {
            let session = daemon.registry().resolve(id(raw)).unwrap();
            assert_eq!(session.mode(), FlightMode::Takeoff);
            let agent = provider.agent(id(raw)).unwrap();
            // Stored takeoff ran exactly once via the queue; later ones come
            // from re-assertion, which has not ticked yet.
            assert_eq!(
                agent.count_executed(|e| matches!(e, Executed::Command(Command::Takeoff { .. }))),
                1
            );
        }
        daemon.registry().shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn launch_with_nothing_linked_is_an_error() {
        let daemon = daemon(Arc::new(SimProvider::new()));
        let response = daemon.handle_line(r#"{"action":"launch"}"#).await;
        assert_eq!(response.error.as_deref(), Some("No agents to launch"));
    }

    #[tokio::test(start_paused = true)]
    async fn status_defaults_to_every_field() {
        let daemon = daemon(Arc::new(SimProvider::new()));
        daemon.handle_line(r#"{"action":"link","ids":[4]}"#).await;

        let response = daemon.handle_line(r#"{"action":"status"}"#).await;
        let entry = response.entry(id(4)).unwrap();
        assert_eq!(entry.pos, Some([0.0, 0.0, 0.0]));
        assert_eq!(entry.rot, Some(0.0));
        assert_eq!(entry.batt, Some(serde_json::Value::Null));
        let nav = entry.nav.as_ref().unwrap();
        assert_eq!(nav.mode, FlightMode::Idle);
        assert!(nav.connected);
        assert_eq!(nav.channel, 0);

        let response = daemon
            .handle_line(r#"{"action":"status","ids":[4,9],"pos":true}"#)
            .await;
        let entry = response.entry(id(4)).unwrap();
        assert!(entry.pos.is_some() && entry.nav.is_none());
        assert_eq!(response.entry(id(9)).unwrap().error.as_deref(), Some("Not connected"));
        daemon.registry().shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reserved_mode_is_refused_not_fatal() {
        let daemon = daemon(Arc::new(SimProvider::new()));
        daemon.handle_line(r#"{"action":"link","ids":[1]}"#).await;
        let response = daemon
            .handle_line(r#"{"action":"mode","id":1,"mode":"moving"}"#)
            .await;
        assert!(!response.ok);

        let response = daemon
            .handle_line(r#"{"action":"mode","id":1,"mode":"auto","target":[1,2,3]}"#)
            .await;
        assert!(response.ok);
        let session = daemon.registry().resolve(id(1)).unwrap();
        assert_eq!(session.mode(), FlightMode::Auto);
        assert_eq!(session.target(), [1.0, 2.0, 3.0]);
        daemon.registry().shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn formation_moves_agents_in_id_order() {
        let provider = Arc::new(SimProvider::new());
        let daemon = daemon(provider.clone());
        daemon.handle_line(r#"{"action":"link","ids":[7,3,5]}"#).await;

        let response = daemon
            .handle_line(r#"{"action":"formation","pattern":"line","size":2.0}"#)
            .await;
        assert!(response.ok);
        assert_eq!(daemon.registry().resolve(id(3)).unwrap().target(), [0.0, 0.0, 5.0]);
        assert_eq!(daemon.registry().resolve(id(5)).unwrap().target(), [2.0, 0.0, 5.0]);
        assert_eq!(daemon.registry().resolve(id(7)).unwrap().target(), [4.0, 0.0, 5.0]);

        let response = daemon
            .handle_line(r#"{"action":"formation","pattern":"triangle","size":1.0,"ids":[3,5]}"#)
            .await;
        assert!(!response.ok);
        let response = daemon
            .handle_line(r#"{"action":"formation","pattern":"star","size":1.0}"#)
            .await;
        assert!(response.error.unwrap().contains("unsupported formation"));
        daemon.registry().shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_delay_reaches_agent_then_waits() {
        let provider = Arc::new(SimProvider::new());
        let daemon = daemon(provider.clone());
        daemon.handle_line(r#"{"action":"link","ids":[1]}"#).await;
        let agent = provider.agent(id(1)).unwrap();

        let start = tokio::time::Instant::now();
        let response = daemon.handle_line(r#"{"action":"delay","id":1,"seconds":1.5}"#).await;
        assert!(response.ok);
        assert!(start.elapsed() >= Duration::from_millis(1500));
        assert_eq!(agent.count_executed(|e| matches!(e, Executed::Delay(1500))), 1);
        assert!(agent.frames().iter().any(|f| f.starts_with(&[42, 0, 0])));

        let response = daemon.handle_line(r#"{"action":"delay","id":1,"seconds":-1}"#).await;
        assert!(!response.ok);
        daemon.registry().shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn delay_for_unlinked_agent_is_not_connected() {
        let provider = Arc::new(SimProvider::new());
        let daemon = daemon(provider.clone());
        daemon.handle_line(r#"{"action":"link","ids":[1]}"#).await;

        let start = tokio::time::Instant::now();
        let response = daemon.handle_line(r#"{"action":"delay","id":9,"seconds":0.5}"#).await;
        assert!(!response.ok);
        assert_eq!(response.error.as_deref(), Some("Agent 9 not connected"));
        assert!(start.elapsed() < Duration::from_millis(500));

        let response = daemon
            .handle_line(r#"{"action":"delay","ids":[1,9],"seconds":0.5}"#)
            .await;
        assert!(response.ok);
        assert_eq!(response.entry(id(1)), Some(&AgentEntry::success()));
        assert_eq!(response.entry(id(9)).unwrap().error.as_deref(), Some("Not connected"));

        let response = daemon.handle_line(r#"{"action":"delay","seconds":0.5}"#).await;
        assert!(!response.ok);
        daemon.registry().shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unlink_reports_unknown_ids() {
        let daemon = daemon(Arc::new(SimProvider::new()));
        daemon.handle_line(r#"{"action":"link","ids":[1]}"#).await;
        let response = daemon
            .handle_line(r#"{"action":"unlink","ids":[1,2]}"#)
            .await;
        assert_eq!(response.entry(id(1)), Some(&AgentEntry::success()));
        assert_eq!(response.entry(id(2)).unwrap().error.as_deref(), Some("Not linked"));
        assert!(daemon.registry().linked_ids().is_empty());
    }

    #[tokio::test]
    async fn unknown_action_is_reported() {
        let daemon = daemon(Arc::new(SimProvider::new()));
        let response = daemon.handle_line(r#"{"action":"loop"}"#).await;
        assert_eq!(response.error.as_deref(), Some("Unknown action: loop"));
    }
}
