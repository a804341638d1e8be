//! Binary command codec.
//!
//! A command is one opcode byte followed by its arguments in fixed-width
//! little-endian form: `f32` for spatial, angle and altitude values, `f64` for
//! latitude/longitude. There is no length prefix; the receiver knows the
//! argument count from the opcode.

use crate::error::CodecError;

pub const OP_ARM: u8 = 1;
pub const OP_DISARM: u8 = 2;
pub const OP_TAKEOFF: u8 = 3;
pub const OP_LAND: u8 = 4;
pub const OP_MOVE: u8 = 5;
pub const OP_YAW: u8 = 6;
pub const OP_HOME: u8 = 7;
pub const OP_KILL: u8 = 8;
pub const OP_ORIGIN: u8 = 9;

/// A single agent command. Built per call and consumed by [`Command::encode`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Arm,
    Disarm,
    Takeoff { altitude: f32 },
    Land,
    Move { x: f32, y: f32, z: f32 },
    Yaw { angle: f32 },
    Home,
    Kill,
    Origin { lat: f64, lon: f64 },
}

impl Command {
    /// Build a MOVE from an operator-supplied vector. Anything but exactly
    /// three components is rejected.
    pub fn move_to(position: &[f64]) -> Result<Self, CodecError> {
        match position {
            [x, y, z] => Ok(Self::Move {
                x: *x as f32,
                y: *y as f32,
                z: *z as f32,
            }),
            other => Err(CodecError::WrongArity {
                expected: 3,
                actual: other.len(),
            }),
        }
    }

    pub fn opcode(&self) -> u8 {
        match self {
            Self::Arm => OP_ARM,
            Self::Disarm => OP_DISARM,
            Self::Takeoff { .. } => OP_TAKEOFF,
            Self::Land => OP_LAND,
            Self::Move { .. } => OP_MOVE,
            Self::Yaw { .. } => OP_YAW,
            Self::Home => OP_HOME,
            Self::Kill => OP_KILL,
            Self::Origin { .. } => OP_ORIGIN,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Arm => "ARM",
            Self::Disarm => "DISARM",
            Self::Takeoff { .. } => "TAKEOFF",
            Self::Land => "LAND",
            Self::Move { .. } => "MOVE",
            Self::Yaw { .. } => "YAW",
            Self::Home => "HOME",
            Self::Kill => "KILL",
            Self::Origin { .. } => "ORIGIN",
        }
    }

    /// Encoded size in bytes: the opcode plus the fixed argument widths.
    pub fn encoded_len(&self) -> usize {
        1 + 4 * f32_arg_count(self.opcode()) + 8 * f64_arg_count(self.opcode())
    }

    /// Encode into the wire form. Non-finite arguments are rejected before a
    /// single byte is produced.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.push(self.opcode());
        match *self {
            Self::Arm | Self::Disarm | Self::Land | Self::Home | Self::Kill => {}
            Self::Takeoff { altitude } => put_f32(&mut out, "altitude", altitude)?,
            Self::Move { x, y, z } => {
                put_f32(&mut out, "x", x)?;
                put_f32(&mut out, "y", y)?;
                put_f32(&mut out, "z", z)?;
            }
            Self::Yaw { angle } => put_f32(&mut out, "angle", angle)?,
            Self::Origin { lat, lon } => {
                put_f64(&mut out, "lat", lat)?;
                put_f64(&mut out, "lon", lon)?;
            }
        }
        debug_assert_eq!(out.len(), self.encoded_len());
        Ok(out)
    }

    /// Decode a command frame. Only the simulated agent needs this; the
    /// ground station never reads commands back from the link.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let (&opcode, args) = bytes.split_first().ok_or(CodecError::Truncated {
            need: 1,
            have: 0,
        })?;
        let need = 4 * f32_arg_count(opcode) + 8 * f64_arg_count(opcode);
        if args.len() < need {
            return Err(CodecError::Truncated {
                need: need + 1,
                have: bytes.len(),
            });
        }
        let f32_at = |i: usize| f32::from_le_bytes([args[i], args[i + 1], args[i + 2], args[i + 3]]);
        let f64_at = |i: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&args[i..i + 8]);
            f64::from_le_bytes(raw)
        };

        let command = match opcode {
            OP_ARM => Self::Arm,
            OP_DISARM => Self::Disarm,
            OP_TAKEOFF => Self::Takeoff { altitude: f32_at(0) },
            OP_LAND => Self::Land,
            OP_MOVE => Self::Move {
                x: f32_at(0),
                y: f32_at(4),
                z: f32_at(8),
            },
            OP_YAW => Self::Yaw { angle: f32_at(0) },
            OP_HOME => Self::Home,
            OP_KILL => Self::Kill,
            OP_ORIGIN => Self::Origin {
                lat: f64_at(0),
                lon: f64_at(8),
            },
            other => return Err(CodecError::UnknownOpcode(other)),
        };
        Ok(command)
    }
}

/// Number of `f32` arguments carried by `opcode`.
pub fn f32_arg_count(opcode: u8) -> usize {
    match opcode {
        OP_TAKEOFF | OP_YAW => 1,
        OP_MOVE => 3,
        _ => 0,
    }
}

/// Number of `f64` arguments carried by `opcode`.
pub fn f64_arg_count(opcode: u8) -> usize {
    match opcode {
        OP_ORIGIN => 2,
        _ => 0,
    }
}

/// Encode a wait duration as little-endian `u32` milliseconds.
pub fn encode_millis(seconds: f64) -> Result<[u8; 4], CodecError> {
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(CodecError::NonFinite {
            field: "seconds",
            value: seconds,
        });
    }
    // `as` saturates at u32::MAX for oversized waits.
    let millis = (seconds * 1000.0) as u32;
    Ok(millis.to_le_bytes())
}

fn put_f32(out: &mut Vec<u8>, field: &'static str, value: f32) -> Result<(), CodecError> {
    if !value.is_finite() {
        return Err(CodecError::NonFinite {
            field,
            value: value as f64,
        });
    }
    out.extend_from_slice(&value.to_le_bytes());
    Ok(())
}

fn put_f64(out: &mut Vec<u8>, field: &'static str, value: f64) -> Result<(), CodecError> {
    if !value.is_finite() {
        return Err(CodecError::NonFinite { field, value });
    }
    out.extend_from_slice(&value.to_le_bytes());
    Ok(())
}
