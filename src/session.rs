//! Agent session: one linked agent's logical connection.
//!
//! A session owns the agent's transport, a ground-side mirror of what the
//! agent last reported, and a background task that re-sends the command bound
//! to the current flight mode every tick. The link has no acknowledgements,
//! so intent is re-asserted continuously instead of sent once.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{timeout, MissedTickBehavior},
};

use crate::codec::{self, Command, OP_KILL};
use crate::envelope::{self, DispatchMode, QueueSlot};
use crate::error::{FleetError, Result};
use crate::transport::{command_frame, LinkUri, Transport, TransportProvider, COMMAND_PACKET};

pub type Vector3 = [f64; 3];

pub const DEFAULT_TICK: Duration = Duration::from_millis(30);
pub const DEFAULT_KILL_RETRIES: u32 = 1000;
pub const DEFAULT_TAKEOFF_ALTITUDE: f64 = 3.0;

/// Externally assigned agent id. Small, positive, never reused while linked.
///
/// Accepts JSON numbers or numeric strings; older clients send ids as strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AgentId(u32);

impl AgentId {
    pub fn new(raw: u32) -> Option<Self> {
        (raw > 0).then_some(Self(raw))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for AgentId {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        let value: u32 = raw
            .trim()
            .parse()
            .map_err(|_| format!("invalid agent id `{raw}`"))?;
        Self::new(value).ok_or_else(|| format!("agent id must be positive, got `{raw}`"))
    }
}

impl Serialize for AgentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.0)
    }
}

impl<'de> Deserialize<'de> for AgentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct AgentIdVisitor;

        impl de::Visitor<'_> for AgentIdVisitor {
            type Value = AgentId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a positive agent id")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<AgentId, E> {
                u32::try_from(v)
                    .ok()
                    .and_then(AgentId::new)
                    .ok_or_else(|| E::custom(format!("agent id out of range: {v}")))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<AgentId, E> {
                u64::try_from(v)
                    .map_err(|_| E::custom(format!("agent id must be positive, got {v}")))
                    .and_then(|v| self.visit_u64(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<AgentId, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(AgentIdVisitor)
    }
}

/// Ground-declared flight mode. `Moving` is a reserved slot with no handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum FlightMode {
    Idle = 0,
    Ready = 1,
    Auto = 2,
    Moving = 3,
    Takeoff = 4,
    Land = 5,
}

impl FlightMode {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Idle),
            1 => Some(Self::Ready),
            2 => Some(Self::Auto),
            3 => Some(Self::Moving),
            4 => Some(Self::Takeoff),
            5 => Some(Self::Land),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Ready => "READY",
            Self::Auto => "AUTO",
            Self::Moving => "MOVING",
            Self::Takeoff => "TAKEOFF",
            Self::Land => "LAND",
        }
    }

    /// Whether the mode has a re-assertion action bound to it.
    pub fn is_bound(self) -> bool {
        !matches!(self, Self::Moving)
    }
}

impl fmt::Display for FlightMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Scalars the agent reports back. Always replaced as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Telemetry {
    pub position: Vector3,
    pub heading: f64,
    pub connected: bool,
}

/// Ground-side mirror of agent telemetry. Written only by the transport,
/// read by any number of status requests.
#[derive(Debug, Default)]
pub struct Mirror {
    telemetry: RwLock<Telemetry>,
}

impl Mirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Telemetry {
        *self.telemetry.read()
    }

    pub fn report(&self, telemetry: Telemetry) {
        *self.telemetry.write() = telemetry;
    }

    /// Read-modify-write under one lock so readers never see a partial update.
    pub fn update(&self, f: impl FnOnce(&mut Telemetry)) {
        let mut guard = self.telemetry.write();
        let mut next = *guard;
        f(&mut next);
        *guard = next;
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub tick: Duration,
    pub kill_retries: u32,
    /// Upper bound on waiting for the re-assertion task to exit.
    pub teardown_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK,
            kill_retries: DEFAULT_KILL_RETRIES,
            teardown_timeout: Duration::from_secs(2),
        }
    }
}

/// What the ground believes is sitting in one remote queue slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Pending {
    Command(Command),
    Delay { millis: u32 },
    Print(String),
}

#[derive(Debug, Clone)]
struct Intent {
    target: Vector3,
    takeoff_altitude: f64,
    position_bias: Vector3,
    pending: [Option<Pending>; 3],
}

impl Default for Intent {
    fn default() -> Self {
        Self {
            target: [0.0; 3],
            takeoff_altitude: DEFAULT_TAKEOFF_ALTITUDE,
            position_bias: [0.0; 3],
            pending: [None, None, None],
        }
    }
}

/// Point-in-time view of a session for status replies.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub id: AgentId,
    pub channel: usize,
    pub mode: FlightMode,
    pub target: Vector3,
    pub telemetry: Telemetry,
    pub alive: bool,
}

pub struct AgentSession {
    id: AgentId,
    channel: usize,
    uri: LinkUri,
    transport: Arc<dyn Transport>,
    mirror: Arc<Mirror>,
    mode: AtomicU8,
    intent: Mutex<Intent>,
    alive: AtomicBool,
    closing: AtomicBool,
    cancel_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    config: SessionConfig,
}

impl fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentSession")
            .field("id", &self.id)
            .field("uri", &self.uri.to_string())
            .field("mode", &self.mode())
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl AgentSession {
    /// Open the agent's link on `channel` and start the re-assertion loop.
    /// Must be called inside a tokio runtime.
    pub fn open(
        id: AgentId,
        channel: usize,
        provider: &dyn TransportProvider,
        config: SessionConfig,
    ) -> Result<Arc<Self>> {
        let uri = LinkUri::for_agent(id, channel);
        let mirror = Arc::new(Mirror::new());
        let transport = provider.open(&uri, mirror.clone())?;
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let session = Arc::new(Self {
            id,
            channel,
            uri,
            transport,
            mirror,
            mode: AtomicU8::new(FlightMode::Idle as u8),
            intent: Mutex::new(Intent::default()),
            alive: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            cancel_tx,
            task: Mutex::new(None),
            config,
        });

        let handle = tokio::spawn(session.clone().run_reassertion(cancel_rx));
        *session.task.lock() = Some(handle);

        tracing::info!(
            target = "northstar::session",
            agent_id = %id,
            channel,
            uri = %session.uri,
            provider = provider.name(),
            "session opened"
        );
        Ok(session)
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    /// Channel index bound at open time. May be stale after later links.
    pub fn channel(&self) -> usize {
        self.channel
    }

    pub fn uri(&self) -> &LinkUri {
        &self.uri
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn mirror(&self) -> &Arc<Mirror> {
        &self.mirror
    }

    pub fn mode(&self) -> FlightMode {
        // Only bound modes are ever stored.
        FlightMode::from_u8(self.mode.load(Ordering::SeqCst)).unwrap_or(FlightMode::Idle)
    }

    /// Select the mode re-asserted every tick.
    ///
    /// # Panics
    ///
    /// Panics when `mode` has no bound action. The mode table is closed; an
    /// unbound mode reaching here is a programming error, and release builds
    /// abort on it.
    pub fn set_mode(&self, mode: FlightMode) {
        if !mode.is_bound() {
            tracing::error!(target = "northstar::session", agent_id = %self.id, mode = %mode, "flight mode has no bound action");
            panic!("flight mode {mode} has no bound action");
        }
        let previous = self.mode.swap(mode as u8, Ordering::SeqCst);
        if previous != mode as u8 {
            tracing::debug!(target = "northstar::session", agent_id = %self.id, mode = %mode, "flight mode changed");
        }
    }

    /// [`set_mode`](Self::set_mode) from a raw wire value.
    ///
    /// # Panics
    ///
    /// Panics when `raw` names no mode or an unbound one.
    pub fn set_mode_raw(&self, raw: u8) {
        match FlightMode::from_u8(raw) {
            Some(mode) => self.set_mode(mode),
            None => {
                tracing::error!(target = "northstar::session", agent_id = %self.id, raw, "unknown flight mode");
                panic!("unknown flight mode {raw}");
            }
        }
    }

    pub fn target(&self) -> Vector3 {
        self.intent.lock().target
    }

    /// Set the AUTO-mode target. Non-finite components are rejected.
    pub fn set_target(&self, target: Vector3) -> Result<()> {
        Command::move_to(&target)?.encode()?;
        self.intent.lock().target = target;
        Ok(())
    }

    /// Offset of the agent's frame origin; AUTO moves toward `target - bias`.
    pub fn set_position_bias(&self, bias: Vector3) {
        self.intent.lock().position_bias = bias;
    }

    pub fn pending(&self, slot: QueueSlot) -> Option<Pending> {
        self.intent.lock().pending[slot.index()].clone()
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            id: self.id,
            channel: self.channel,
            mode: self.mode(),
            target: self.target(),
            telemetry: self.mirror.snapshot(),
            alive: self.is_alive(),
        }
    }

    pub fn arm(&self, mode: DispatchMode) -> Result<()> {
        self.dispatch(Command::Arm, mode)
    }

    pub fn disarm(&self, mode: DispatchMode) -> Result<()> {
        self.dispatch(Command::Disarm, mode)
    }

    pub fn takeoff(&self, altitude: f64, mode: DispatchMode) -> Result<()> {
        self.dispatch(
            Command::Takeoff {
                altitude: altitude as f32,
            },
            mode,
        )
    }

    pub fn land(&self, mode: DispatchMode) -> Result<()> {
        self.dispatch(Command::Land, mode)
    }

    pub fn move_to(&self, position: &[f64], mode: DispatchMode) -> Result<()> {
        self.dispatch(Command::move_to(position)?, mode)
    }

    pub fn yaw(&self, angle: f64, mode: DispatchMode) -> Result<()> {
        self.dispatch(
            Command::Yaw {
                angle: angle as f32,
            },
            mode,
        )
    }

    pub fn home(&self, mode: DispatchMode) -> Result<()> {
        self.dispatch(Command::Home, mode)
    }

    /// Emergency stop. Never queued.
    pub fn kill(&self) -> Result<()> {
        self.dispatch(Command::Kill, DispatchMode::Immediate)
    }

    /// Set the GPS origin. Never queued.
    pub fn origin(&self, lat: f64, lon: f64) -> Result<()> {
        self.dispatch(Command::Origin { lat, lon }, DispatchMode::Immediate)
    }

    /// Ask the agent to wait. Only meaningful inside a stored sequence.
    pub fn delay(&self, seconds: f64, mode: DispatchMode) -> Result<()> {
        let millis = codec::encode_millis(seconds)?;
        self.send_slot(
            QueueSlot::Delay,
            mode,
            &millis,
            Pending::Delay {
                millis: u32::from_le_bytes(millis),
            },
        )
    }

    /// Have the agent print `text` on its console.
    pub fn print(&self, text: &str, mode: DispatchMode) -> Result<()> {
        self.send_slot(
            QueueSlot::Print,
            mode,
            text.as_bytes(),
            Pending::Print(text.to_string()),
        )
    }

    /// Send the trigger frame `repeats` times (at least once) and adopt the
    /// intent of whatever command was stored. Returns the slots that were
    /// pending.
    pub fn launch(&self, repeats: u32) -> Result<Vec<QueueSlot>> {
        let frame = envelope::trigger();
        for _ in 0..repeats.max(1) {
            self.transport.send(&frame)?;
        }

        let drained: Vec<(QueueSlot, Pending)> = {
            let mut intent = self.intent.lock();
            QueueSlot::ALL
                .iter()
                .filter_map(|slot| intent.pending[slot.index()].take().map(|p| (*slot, p)))
                .collect()
        };
        for (_, pending) in &drained {
            if let Pending::Command(command) = pending {
                self.adopt_intent(command);
            }
        }
        tracing::debug!(target = "northstar::session", agent_id = %self.id, slots = drained.len(), "trigger sent");
        Ok(drained.into_iter().map(|(slot, _)| slot).collect())
    }

    fn dispatch(&self, command: Command, mode: DispatchMode) -> Result<()> {
        match mode {
            DispatchMode::Immediate => {
                let frame = command_frame(&command)?;
                self.transport.send(&frame)?;
                self.adopt_intent(&command);
            }
            DispatchMode::Store => {
                let frame = envelope::wrap_command(DispatchMode::Store, &command)?;
                self.transport.send(&frame)?;
                self.intent.lock().pending[QueueSlot::UavCommand.index()] =
                    Some(Pending::Command(command));
            }
            DispatchMode::Trigger => {
                return Err(FleetError::malformed(format!(
                    "{} cannot be dispatched as a trigger",
                    command.name()
                )));
            }
        }
        tracing::debug!(target = "northstar::session", agent_id = %self.id, command = command.name(), mode = ?mode, "command sent");
        Ok(())
    }

    fn send_slot(
        &self,
        slot: QueueSlot,
        mode: DispatchMode,
        payload: &[u8],
        pending: Pending,
    ) -> Result<()> {
        if mode == DispatchMode::Trigger {
            return Err(FleetError::malformed("a slot payload cannot be sent as a trigger"));
        }
        self.transport.send(&envelope::wrap(mode, slot, payload))?;
        if mode == DispatchMode::Store {
            self.intent.lock().pending[slot.index()] = Some(pending);
        }
        Ok(())
    }

    /// Make the re-assertion loop repeat what the operator just asked for.
    fn adopt_intent(&self, command: &Command) {
        match *command {
            Command::Arm => self.set_mode(FlightMode::Ready),
            Command::Disarm | Command::Kill => self.set_mode(FlightMode::Idle),
            Command::Takeoff { altitude } => {
                self.intent.lock().takeoff_altitude = altitude as f64;
                self.set_mode(FlightMode::Takeoff);
            }
            Command::Land => self.set_mode(FlightMode::Land),
            Command::Move { x, y, z } => {
                self.intent.lock().target = [x as f64, y as f64, z as f64];
                self.set_mode(FlightMode::Auto);
            }
            // Stop overriding the home run with AUTO moves.
            Command::Home => {
                if self.mode() == FlightMode::Auto {
                    self.set_mode(FlightMode::Ready);
                }
            }
            Command::Yaw { .. } | Command::Origin { .. } => {}
        }
    }

    /// The command bound to `mode`. `None` only for the reserved slot.
    fn mode_command(&self, mode: FlightMode) -> Option<Command> {
        let intent = self.intent.lock();
        match mode {
            FlightMode::Idle => Some(Command::Disarm),
            FlightMode::Ready => Some(Command::Arm),
            FlightMode::Auto => {
                let [tx, ty, tz] = intent.target;
                let [bx, by, bz] = intent.position_bias;
                Some(Command::Move {
                    x: (tx - bx) as f32,
                    y: (ty - by) as f32,
                    z: (tz - bz) as f32,
                })
            }
            FlightMode::Takeoff => Some(Command::Takeoff {
                altitude: intent.takeoff_altitude as f32,
            }),
            FlightMode::Land => Some(Command::Land),
            FlightMode::Moving => None,
        }
    }

    /// Send the current mode's command once. Failures are absorbed; the next
    /// tick tries again.
    fn reassert(&self) {
        let mode = self.mode();
        let Some(command) = self.mode_command(mode) else {
            tracing::error!(target = "northstar::session", agent_id = %self.id, mode = %mode, "no action bound to flight mode");
            panic!("flight mode {mode} has no bound action");
        };
        match command_frame(&command) {
            Ok(frame) => {
                if let Err(error) = self.transport.send(&frame) {
                    tracing::trace!(target = "northstar::session", agent_id = %self.id, error = %error, "re-assertion send failed");
                }
            }
            Err(error) => {
                tracing::warn!(target = "northstar::session", agent_id = %self.id, mode = %mode, error = %error, "re-assertion command not encodable");
            }
        }
    }

    async fn run_reassertion(self: Arc<Self>, mut cancel_rx: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.config.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if !self.is_alive() {
                        break;
                    }
                    self.reassert();
                }
                changed = cancel_rx.changed() => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(target = "northstar::session", agent_id = %self.id, "re-assertion loop stopped");
    }

    /// Tear the session down.
    ///
    /// KILL is sent `kill_retries` times back to back. On a lossy link with no
    /// acknowledgement a single KILL is no more likely to arrive than any other
    /// frame, and a missed one means losing control authority, so the burst is
    /// the delivery strategy. Per-attempt errors are swallowed. Afterwards the
    /// session is marked not-alive, the loop is awaited (bounded) and the
    /// transport released. Idempotent.
    pub async fn shutdown(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        // Loop keeps running during the burst; make it repeat DISARM, not a move.
        self.mode.store(FlightMode::Idle as u8, Ordering::SeqCst);

        let kill = [COMMAND_PACKET, OP_KILL];
        let mut delivered = 0u32;
        for attempt in 0..self.config.kill_retries {
            if self.transport.send(&kill).is_ok() {
                delivered += 1;
            }
            if attempt % 100 == 99 {
                tokio::task::yield_now().await;
            }
        }

        self.alive.store(false, Ordering::SeqCst);
        let _ = self.cancel_tx.send(true);

        let handle = self.task.lock().take();
        if let Some(mut handle) = handle {
            if timeout(self.config.teardown_timeout, &mut handle).await.is_err() {
                tracing::warn!(target = "northstar::session", agent_id = %self.id, "re-assertion loop did not stop in time, aborting");
                handle.abort();
            }
        }

        self.transport.close();
        tracing::info!(
            target = "northstar::session",
            agent_id = %self.id,
            kills_sent = delivered,
            kill_attempts = self.config.kill_retries,
            "session closed"
        );
    }
}
