//! In-process simulated agents.
//!
//! Each [`SimAgent`] decodes the frames it receives the way flight firmware
//! would: direct command packets run at once, envelope frames go through a
//! three-slot queue, and executed commands move the agent's reported state.
//! Used by `run --transport sim` and by the test suite.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::codec::Command;
use crate::envelope::{self, DispatchMode, QueueSlot};
use crate::error::TransportError;
use crate::session::{AgentId, Mirror, Telemetry};
use crate::transport::{LinkUri, Transport, TransportProvider, COMMAND_PACKET};

/// Frames and executions kept per agent before the oldest are dropped.
pub const DEFAULT_LOG_CAPACITY: usize = 16_384;

/// Something the simulated agent actually did.
#[derive(Debug, Clone, PartialEq)]
pub enum Executed {
    Command(Command),
    Delay(u32),
    Print(String),
}

struct AgentLog {
    frames: VecDeque<Vec<u8>>,
    executed: VecDeque<Executed>,
    slots: [Option<Vec<u8>>; 3],
    capacity: usize,
}

impl AgentLog {
    fn push_frame(&mut self, frame: &[u8]) {
        if self.frames.len() >= self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame.to_vec());
    }

    fn push_executed(&mut self, executed: Executed) {
        if self.executed.len() >= self.capacity {
            self.executed.pop_front();
        }
        self.executed.push_back(executed);
    }
}

/// One simulated agent reachable over a fake link.
pub struct SimAgent {
    id: AgentId,
    uri: LinkUri,
    mirror: Arc<Mirror>,
    log: Mutex<AgentLog>,
    alive: AtomicBool,
    drop_every: Option<u64>,
    sent: AtomicU64,
}

impl SimAgent {
    fn new(id: AgentId, uri: LinkUri, mirror: Arc<Mirror>, drop_every: Option<u64>) -> Self {
        mirror.update(|t| t.connected = true);
        Self {
            id,
            uri,
            mirror,
            log: Mutex::new(AgentLog {
                frames: VecDeque::new(),
                executed: VecDeque::new(),
                slots: [None, None, None],
                capacity: DEFAULT_LOG_CAPACITY,
            }),
            alive: AtomicBool::new(true),
            drop_every,
            sent: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn uri(&self) -> &LinkUri {
        &self.uri
    }

    /// Frames that reached the agent, oldest first.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.log.lock().frames.iter().cloned().collect()
    }

    pub fn clear_frames(&self) {
        self.log.lock().frames.clear();
    }

    pub fn executed(&self) -> Vec<Executed> {
        self.log.lock().executed.iter().cloned().collect()
    }

    pub fn count_executed(&self, pred: impl Fn(&Executed) -> bool) -> usize {
        self.log.lock().executed.iter().filter(|e| pred(e)).count()
    }

    /// Whether `slot` holds a stored payload that has not been triggered yet.
    pub fn has_stored(&self, slot: QueueSlot) -> bool {
        self.log.lock().slots[slot.index()].is_some()
    }

    pub fn telemetry(&self) -> Telemetry {
        self.mirror.snapshot()
    }

    fn receive(&self, frame: &[u8]) {
        let mut log = self.log.lock();
        log.push_frame(frame);

        if frame.first() == Some(&COMMAND_PACKET) {
            match Command::decode(&frame[1..]) {
                Ok(command) => self.execute(&mut log, Executed::Command(command)),
                Err(error) => {
                    tracing::debug!(target = "northstar::sim", agent_id = %self.id, error = %error, "dropping bad command frame")
                }
            }
            return;
        }

        let Some(env) = envelope::unwrap(frame) else {
            tracing::debug!(target = "northstar::sim", agent_id = %self.id, len = frame.len(), "dropping unknown frame");
            return;
        };
        match (env.mode, env.slot) {
            (DispatchMode::Immediate, Some(slot)) => {
                if let Some(executed) = decode_slot(slot, env.payload) {
                    self.execute(&mut log, executed);
                }
            }
            (DispatchMode::Store, Some(slot)) => {
                log.slots[slot.index()] = Some(env.payload.to_vec());
            }
            (DispatchMode::Trigger, _) => {
                // Run each stored slot once, in slot order, then forget it.
                for slot in QueueSlot::ALL {
                    let Some(payload) = log.slots[slot.index()].take() else {
                        continue;
                    };
                    if let Some(executed) = decode_slot(slot, &payload) {
                        self.execute(&mut log, executed);
                    }
                }
            }
            (_, None) => {}
        }
    }

    fn execute(&self, log: &mut AgentLog, executed: Executed) {
        if let Executed::Command(command) = &executed {
            apply_command(&self.mirror, command);
        }
        if let Executed::Print(text) = &executed {
            tracing::info!(target = "northstar::sim", agent_id = %self.id, "{text}");
        }
        log.push_executed(executed);
    }
}

fn decode_slot(slot: QueueSlot, payload: &[u8]) -> Option<Executed> {
    match slot {
        QueueSlot::UavCommand => Command::decode(payload).ok().map(Executed::Command),
        QueueSlot::Delay => {
            let raw: [u8; 4] = payload.get(..4)?.try_into().ok()?;
            Some(Executed::Delay(u32::from_le_bytes(raw)))
        }
        QueueSlot::Print => Some(Executed::Print(String::from_utf8_lossy(payload).into_owned())),
    }
}

/// Crude kinematics: the agent jumps straight to whatever it was told.
fn apply_command(mirror: &Mirror, command: &Command) {
    match *command {
        Command::Move { x, y, z } => mirror.update(|t| t.position = [x as f64, y as f64, z as f64]),
        Command::Takeoff { altitude } => mirror.update(|t| t.position[2] = altitude as f64),
        Command::Land | Command::Kill => mirror.update(|t| t.position[2] = 0.0),
        Command::Home => mirror.update(|t| {
            t.position[0] = 0.0;
            t.position[1] = 0.0;
        }),
        Command::Yaw { angle } => mirror.update(|t| t.heading = angle as f64),
        Command::Arm | Command::Disarm | Command::Origin { .. } => {}
    }
}

impl Transport for SimAgent {
    fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::LinkDown);
        }
        let n = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(every) = self.drop_every {
            if n % every == 0 {
                // Lost in the air; the sender cannot tell.
                return Ok(());
            }
        }
        self.receive(frame);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.mirror.update(|t| t.connected = false);
    }
}

/// Opens [`SimAgent`]s on demand. Relinking an id replaces its agent.
#[derive(Default)]
pub struct SimProvider {
    agents: Mutex<HashMap<AgentId, Arc<SimAgent>>>,
    drop_every: Option<u64>,
    unreachable: Mutex<Vec<AgentId>>,
}

impl SimProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `drop_every`-th frame on each link is silently lost.
    pub fn lossy(drop_every: u64) -> Self {
        Self {
            drop_every: Some(drop_every.max(2)),
            ..Self::default()
        }
    }

    /// Make future opens for `id` fail, as if the agent were powered off.
    pub fn set_unreachable(&self, id: AgentId) {
        self.unreachable.lock().push(id);
    }

    pub fn agent(&self, id: AgentId) -> Option<Arc<SimAgent>> {
        self.agents.lock().get(&id).cloned()
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.agents.lock().keys().copied().collect();
        ids.sort();
        ids
    }
}

impl TransportProvider for SimProvider {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn open(&self, uri: &LinkUri, mirror: Arc<Mirror>) -> Result<Arc<dyn Transport>, TransportError> {
        let id = AgentId::new(uri.rf_channel).ok_or(TransportError::LinkDown)?;
        if self.unreachable.lock().contains(&id) {
            return Err(TransportError::LinkDown);
        }
        let agent = Arc::new(SimAgent::new(id, uri.clone(), mirror, self.drop_every));
        self.agents.lock().insert(id, agent.clone());
        Ok(agent)
    }

    fn shutdown(&self) {
        for agent in self.agents.lock().values() {
            agent.close();
        }
    }
}
