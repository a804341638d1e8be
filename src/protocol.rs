//! Control protocol between clients and the fleet daemon.
//!
//! One JSON object per line in each direction. Requests are tagged by
//! `action`; every request gets exactly one [`Response`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FleetError;
use crate::session::{AgentId, FlightMode, Vector3};

pub const DEFAULT_PORT: u16 = 7777;

pub const ACTIONS: &[&str] = &[
    "link", "unlink", "status", "arm", "disarm", "takeoff", "move", "land", "home", "kill", "yaw",
    "origin", "launch", "delay", "print", "mode", "formation", "shutdown",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    Link {
        ids: Vec<AgentId>,
    },
    Unlink {
        #[serde(default)]
        ids: Vec<AgentId>,
        #[serde(default)]
        all: bool,
    },
    Status {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ids: Option<Vec<AgentId>>,
        #[serde(default)]
        pos: bool,
        #[serde(default)]
        rot: bool,
        #[serde(default)]
        nav: bool,
        #[serde(default)]
        batt: bool,
    },
    Arm {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<AgentId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ids: Option<Vec<AgentId>>,
        #[serde(default)]
        setcmd: bool,
    },
    Disarm {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<AgentId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ids: Option<Vec<AgentId>>,
        #[serde(default)]
        setcmd: bool,
    },
    Takeoff {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<AgentId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ids: Option<Vec<AgentId>>,
        altitude: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time: Option<f64>,
        #[serde(default)]
        setcmd: bool,
    },
    Move {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<AgentId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ids: Option<Vec<AgentId>>,
        position: Vec<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time: Option<f64>,
        #[serde(default)]
        setcmd: bool,
    },
    Land {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<AgentId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ids: Option<Vec<AgentId>>,
        #[serde(default)]
        setcmd: bool,
    },
    Home {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<AgentId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ids: Option<Vec<AgentId>>,
        #[serde(default)]
        setcmd: bool,
    },
    /// `setcmd` is accepted and ignored; KILL is never queued.
    Kill {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<AgentId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ids: Option<Vec<AgentId>>,
        #[serde(default)]
        setcmd: bool,
    },
    Yaw {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<AgentId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ids: Option<Vec<AgentId>>,
        angle: f64,
        #[serde(default)]
        setcmd: bool,
    },
    Origin {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<AgentId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ids: Option<Vec<AgentId>>,
        lat: f64,
        lon: f64,
    },
    /// Trigger every listed agent; no ids means every linked agent.
    Launch {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<AgentId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ids: Option<Vec<AgentId>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        repeat: Option<u32>,
    },
    /// Without `setcmd` the daemon itself waits before replying.
    Delay {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<AgentId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ids: Option<Vec<AgentId>>,
        seconds: f64,
        #[serde(default)]
        setcmd: bool,
    },
    Print {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<AgentId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ids: Option<Vec<AgentId>>,
        text: String,
        #[serde(default)]
        setcmd: bool,
    },
    Mode {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<AgentId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ids: Option<Vec<AgentId>>,
        mode: FlightMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<Vec<f64>>,
    },
    /// Agents are placed in ascending id order; no ids means every linked agent.
    Formation {
        pattern: String,
        size: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ids: Option<Vec<AgentId>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        altitude: Option<f64>,
        #[serde(default)]
        setcmd: bool,
    },
    Shutdown,
}

impl Request {
    /// Parse one request line. An unrecognised `action` is reported by name
    /// instead of as a generic decode failure.
    pub fn parse(line: &str) -> Result<Self, FleetError> {
        let value: Value =
            serde_json::from_str(line).map_err(|e| FleetError::malformed(format!("invalid JSON: {e}")))?;
        let action = value
            .get("action")
            .ok_or_else(|| FleetError::malformed("missing field `action`"))?;
        let Some(action) = action.as_str() else {
            return Err(FleetError::malformed(format!("Unknown action: {action}")));
        };
        if !ACTIONS.contains(&action) {
            return Err(FleetError::malformed(format!("Unknown action: {action}")));
        }
        serde_json::from_value(value).map_err(|e| FleetError::malformed(e.to_string()))
    }

    pub fn action(&self) -> &'static str {
        match self {
            Request::Link { .. } => "link",
            Request::Unlink { .. } => "unlink",
            Request::Status { .. } => "status",
            Request::Arm { .. } => "arm",
            Request::Disarm { .. } => "disarm",
            Request::Takeoff { .. } => "takeoff",
            Request::Move { .. } => "move",
            Request::Land { .. } => "land",
            Request::Home { .. } => "home",
            Request::Kill { .. } => "kill",
            Request::Yaw { .. } => "yaw",
            Request::Origin { .. } => "origin",
            Request::Launch { .. } => "launch",
            Request::Delay { .. } => "delay",
            Request::Print { .. } => "print",
            Request::Mode { .. } => "mode",
            Request::Formation { .. } => "formation",
            Request::Shutdown => "shutdown",
        }
    }
}

/// Who a command is addressed to. A single id fails the whole request when
/// it is not connected; a batch reports per agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Targets {
    Single(AgentId),
    Batch(Vec<AgentId>),
}

impl Targets {
    pub fn from_fields(id: Option<AgentId>, ids: Option<Vec<AgentId>>) -> Option<Self> {
        match (id, ids) {
            (Some(id), _) => Some(Targets::Single(id)),
            (None, Some(ids)) => Some(Targets::Batch(ids)),
            (None, None) => None,
        }
    }

    pub fn ids(&self) -> Vec<AgentId> {
        match self {
            Targets::Single(id) => vec![*id],
            Targets::Batch(ids) => ids.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Navigation {
    pub mode: FlightMode,
    pub connected: bool,
    pub channel: usize,
    pub target: Vector3,
}

/// One agent's slot in a response: requested status fields, a success
/// marker, or an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pos: Option<Vector3>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rot: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nav: Option<Navigation>,
    /// Agents do not report battery; present as `null` when requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batt: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentEntry {
    pub fn success() -> Self {
        Self {
            ok: Some(true),
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<BTreeMap<AgentId, AgentEntry>>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            ok: true,
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
            status: None,
        }
    }

    pub fn with_status(status: BTreeMap<AgentId, AgentEntry>) -> Self {
        Self {
            ok: true,
            error: None,
            status: Some(status),
        }
    }

    pub fn entry(&self, id: AgentId) -> Option<&AgentEntry> {
        self.status.as_ref()?.get(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(raw: u32) -> AgentId {
        AgentId::new(raw).unwrap()
    }

    #[test]
    fn parses_command_with_defaults() {
        let request = Request::parse(r#"{"action":"takeoff","id":"3","altitude":2.5}"#).unwrap();
        assert_eq!(
            request,
            Request::Takeoff {
                id: Some(id(3)),
                ids: None,
                altitude: 2.5,
                time: None,
                setcmd: false,
            }
        );
        assert_eq!(request.action(), "takeoff");
    }

    #[test]
    fn parses_shutdown_and_status_flags() {
        assert_eq!(Request::parse(r#"{"action":"shutdown"}"#).unwrap(), Request::Shutdown);
        let request = Request::parse(r#"{"action":"status","ids":[1,2],"pos":true}"#).unwrap();
        assert!(matches!(request, Request::Status { pos: true, rot: false, .. }));
    }

    #[test]
    fn unknown_action_is_named() {
        let err = Request::parse(r#"{"action":"barrel_roll","id":1}"#).unwrap_err();
        assert_eq!(err.to_string(), "Unknown action: barrel_roll");
    }

    #[test]
    fn missing_fields_are_malformed() {
        let err = Request::parse(r#"{"action":"move","id":1}"#).unwrap_err();
        assert!(matches!(err, FleetError::Malformed(_)));
        assert!(err.to_string().contains("position"));

        assert!(Request::parse(r#"{"id":1}"#).is_err());
        assert!(Request::parse("not json").is_err());
        assert!(Request::parse(r#"{"action":"link","ids":[0]}"#).is_err());
    }

    #[test]
    fn mode_accepts_every_flight_mode_name() {
        let request = Request::parse(r#"{"action":"mode","id":1,"mode":"moving"}"#).unwrap();
        assert!(matches!(request, Request::Mode { mode: FlightMode::Moving, .. }));
    }

    #[test]
    fn response_omits_empty_fields_and_keys_by_id() {
        assert_eq!(serde_json::to_value(Response::ok()).unwrap(), json!({"ok": true}));

        let mut status = BTreeMap::new();
        status.insert(id(1), AgentEntry::success());
        status.insert(id(2), AgentEntry::failure("Not connected"));
        let value = serde_json::to_value(Response::with_status(status)).unwrap();
        assert_eq!(
            value,
            json!({"ok": true, "status": {"1": {"ok": true}, "2": {"error": "Not connected"}}})
        );

        let back: Response = serde_json::from_value(value).unwrap();
        assert!(back.entry(id(2)).unwrap().is_error());
    }

    #[test]
    fn targets_prefer_single_id() {
        assert_eq!(Targets::from_fields(Some(id(1)), Some(vec![id(2)])), Some(Targets::Single(id(1))));
        assert_eq!(
            Targets::from_fields(None, Some(vec![id(2), id(3)])).unwrap().ids(),
            vec![id(2), id(3)]
        );
        assert!(Targets::from_fields(None, None).is_none());
    }
}
