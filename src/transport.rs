//! Byte transport seam.
//!
//! The radio link is an external collaborator: the fleet layer only needs a
//! fire-and-forget byte sink per agent plus an `is_alive` signal. A
//! [`TransportProvider`] is injected into the registry at construction and
//! opens one [`Transport`] per linked agent.

use std::{fmt, str::FromStr, sync::Arc};

use crate::codec::Command;
use crate::error::{CodecError, TransportError};
use crate::session::{AgentId, Mirror};

/// Packet id selecting the agent's direct command handler.
pub const COMMAND_PACKET: u8 = 40;

/// Default radio data rate (Mbps) and pipe address of the fleet.
pub const DEFAULT_DATA_RATE: u8 = 2;
pub const DEFAULT_ADDRESS: &str = "E7E7E7E301";

/// Frame for an immediately executed command: `[COMMAND_PACKET, opcode, args...]`.
pub fn command_frame(command: &Command) -> Result<Vec<u8>, CodecError> {
    let encoded = command.encode()?;
    let mut frame = Vec::with_capacity(1 + encoded.len());
    frame.push(COMMAND_PACKET);
    frame.extend_from_slice(&encoded);
    Ok(frame)
}

/// One agent's outbound link. Sends are fire-and-forget: `Ok` means the
/// frame left the ground station, not that the agent received it.
pub trait Transport: Send + Sync {
    fn send(&self, frame: &[u8]) -> Result<(), TransportError>;

    fn is_alive(&self) -> bool;

    /// Release the link. Further sends fail with [`TransportError::LinkDown`].
    fn close(&self);
}

/// Opens per-agent links. Inbound telemetry for an agent is written into the
/// [`Mirror`] handed to [`TransportProvider::open`].
pub trait TransportProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn open(&self, uri: &LinkUri, mirror: Arc<Mirror>) -> Result<Arc<dyn Transport>, TransportError>;

    /// Tear down provider-wide resources after every link has been closed.
    fn shutdown(&self) {}
}

/// Radio address of one agent: `radio:/{radio}/{rf_channel:02}/{data_rate}/{address}`.
///
/// `radio` is the agent's channel index (its rank among linked ids) and
/// `rf_channel` is the agent id itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkUri {
    pub radio: usize,
    pub rf_channel: u32,
    pub data_rate: u8,
    pub address: String,
}

impl LinkUri {
    pub fn for_agent(id: AgentId, channel_index: usize) -> Self {
        Self {
            radio: channel_index,
            rf_channel: id.get(),
            data_rate: DEFAULT_DATA_RATE,
            address: DEFAULT_ADDRESS.to_string(),
        }
    }
}

impl fmt::Display for LinkUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "radio:/{}/{:02}/{}/{}",
            self.radio, self.rf_channel, self.data_rate, self.address
        )
    }
}

impl FromStr for LinkUri {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let rest = raw
            .trim()
            .strip_prefix("radio:/")
            .ok_or_else(|| format!("link uri must start with `radio:/`: {raw}"))?;
        let parts: Vec<&str> = rest.split('/').collect();
        let [radio, channel, rate, address] = parts.as_slice() else {
            return Err(format!("link uri needs 4 segments: {raw}"));
        };
        Ok(Self {
            radio: radio.parse().map_err(|_| format!("bad radio index in {raw}"))?,
            rf_channel: channel
                .parse()
                .map_err(|_| format!("bad rf channel in {raw}"))?,
            data_rate: rate.parse().map_err(|_| format!("bad data rate in {raw}"))?,
            address: address.to_string(),
        })
    }
}
