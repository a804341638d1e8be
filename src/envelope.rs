//! Macro queue envelope.
//!
//! Wraps a command payload so the agent either runs it now (`Immediate`),
//! buffers it in a queue slot (`Store`), or runs everything it has buffered
//! (`Trigger`). Storing to every agent first and triggering afterwards lets a
//! batch start together without clock sync between ground and agents.
//!
//! Frame layout: `[ENVELOPE_OPCODE, mode, slot, payload...]`. Trigger frames
//! carry [`NO_SLOT`] in the slot position and no payload.

use serde::{Deserialize, Serialize};

use crate::codec::Command;
use crate::error::CodecError;

/// Packet id selecting the queue-envelope handler on the agent.
pub const ENVELOPE_OPCODE: u8 = 42;

/// Slot byte written into Trigger frames.
pub const NO_SLOT: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    Immediate,
    Store,
    Trigger,
}

impl DispatchMode {
    pub fn as_u8(self) -> u8 {
        match self {
            DispatchMode::Immediate => 0,
            DispatchMode::Store => 1,
            DispatchMode::Trigger => 2,
        }
    }

    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(DispatchMode::Immediate),
            1 => Some(DispatchMode::Store),
            2 => Some(DispatchMode::Trigger),
            _ => None,
        }
    }

    /// `setcmd=true` on a request selects Store; anything else is Immediate.
    pub fn from_setcmd(setcmd: bool) -> Self {
        if setcmd {
            DispatchMode::Store
        } else {
            DispatchMode::Immediate
        }
    }
}

/// Remote command category that holds at most one pending stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueSlot {
    Delay,
    UavCommand,
    Print,
}

impl QueueSlot {
    pub const ALL: [QueueSlot; 3] = [QueueSlot::Delay, QueueSlot::UavCommand, QueueSlot::Print];

    pub fn as_u8(self) -> u8 {
        match self {
            QueueSlot::Delay => 0,
            QueueSlot::UavCommand => 1,
            QueueSlot::Print => 2,
        }
    }

    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(QueueSlot::Delay),
            1 => Some(QueueSlot::UavCommand),
            2 => Some(QueueSlot::Print),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        self.as_u8() as usize
    }
}

/// Wrap `payload` for `slot`. `Trigger` ignores both and yields the fixed
/// trigger frame.
pub fn wrap(mode: DispatchMode, slot: QueueSlot, payload: &[u8]) -> Vec<u8> {
    if mode == DispatchMode::Trigger {
        return trigger();
    }
    let mut out = Vec::with_capacity(3 + payload.len());
    out.push(ENVELOPE_OPCODE);
    out.push(mode.as_u8());
    out.push(slot.as_u8());
    out.extend_from_slice(payload);
    out
}

/// The trigger frame. Tiny and identical every time, so it can be repeated
/// or fanned out freely.
pub fn trigger() -> Vec<u8> {
    vec![ENVELOPE_OPCODE, DispatchMode::Trigger.as_u8(), NO_SLOT]
}

/// Wrap an agent command into the `UavCommand` slot.
pub fn wrap_command(mode: DispatchMode, command: &Command) -> Result<Vec<u8>, CodecError> {
    Ok(wrap(mode, QueueSlot::UavCommand, &command.encode()?))
}

/// A parsed envelope frame, borrowed from the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope<'a> {
    pub mode: DispatchMode,
    pub slot: Option<QueueSlot>,
    pub payload: &'a [u8],
}

/// Parse an envelope frame (the inverse of [`wrap`]). Returns `None` when the
/// frame is not an envelope or its header is malformed.
pub fn unwrap(frame: &[u8]) -> Option<Envelope<'_>> {
    match frame {
        [ENVELOPE_OPCODE, mode, rest @ ..] => {
            let mode = DispatchMode::from_u8(*mode)?;
            if mode == DispatchMode::Trigger {
                return Some(Envelope {
                    mode,
                    slot: None,
                    payload: &[],
                });
            }
            let (slot, payload) = rest.split_first()?;
            Some(Envelope {
                mode,
                slot: Some(QueueSlot::from_u8(*slot)?),
                payload,
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_frame_layout() {
        let frame = wrap_command(DispatchMode::Store, &Command::Arm).unwrap();
        assert_eq!(frame, vec![42, 1, 1, 1]);
    }

    #[test]
    fn immediate_delay_frame_layout() {
        let frame = wrap(DispatchMode::Immediate, QueueSlot::Delay, &2500u32.to_le_bytes());
        assert_eq!(frame[..3], [42, 0, 0]);
        assert_eq!(frame[3..], 2500u32.to_le_bytes());
    }

    #[test]
    fn trigger_is_fixed_and_payload_free() {
        assert_eq!(trigger(), vec![42, 2, NO_SLOT]);
        assert_eq!(wrap(DispatchMode::Trigger, QueueSlot::Print, b"ignored"), trigger());
    }

    #[test]
    fn unwrap_recovers_header() {
        let frame = wrap(DispatchMode::Store, QueueSlot::Print, b"hi");
        let env = unwrap(&frame).unwrap();
        assert_eq!(env.mode, DispatchMode::Store);
        assert_eq!(env.slot, Some(QueueSlot::Print));
        assert_eq!(env.payload, b"hi");

        let frame = trigger();
        let env = unwrap(&frame).unwrap();
        assert_eq!(env.mode, DispatchMode::Trigger);
        assert!(env.slot.is_none());
    }

    #[test]
    fn unwrap_rejects_foreign_frames() {
        assert!(unwrap(&[40, 1]).is_none());
        assert!(unwrap(&[42, 9, 0]).is_none());
        assert!(unwrap(&[42, 1]).is_none());
        assert!(unwrap(&[42, 1, 7]).is_none());
    }

    #[test]
    fn setcmd_selects_store() {
        assert_eq!(DispatchMode::from_setcmd(true), DispatchMode::Store);
        assert_eq!(DispatchMode::from_setcmd(false), DispatchMode::Immediate);
    }
}
