//! Raw touch-daemon commands, capability negotiation, and coordinate scaling.
//!
//! # The daemon protocol (for beginners)
//!
//! The on-device touch daemon reads newline-terminated text commands from a
//! socket and turns them into kernel touch events:
//!
//! ```text
//! d <contact> <x> <y> <pressure>   put a finger down
//! m <contact> <x> <y> <pressure>   move a finger that is down
//! u <contact>                      lift a finger
//! c                                commit: flush everything queued so far
//! w <ms>                           wait before processing the next command
//! ```
//!
//! Coordinates are in the daemon's **raw** space (`0..=max_x`, `0..=max_y`),
//! which the daemon announces when a client connects:
//!
//! ```text
//! v 1
//! ^ 10 32767 32767 255
//! $ 12345
//! ```
//!
//! The raw space rarely matches the screen's pixel grid, so every logical
//! pixel coordinate goes through [`CoordinateScaler`] before it is sent.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::device::Resolution;

/// Maximum simultaneous contacts the daemon protocol supports.
pub const MAX_CONTACTS: usize = 10;

/// Pressure used when the daemon does not announce one.
pub const DEFAULT_MAX_PRESSURE: u32 = 255;

/// Interpolated points in a swipe when the caller does not choose.
pub const DEFAULT_SWIPE_STEPS: u32 = 10;

/// Validation errors raised before anything is written to the daemon.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GestureError {
    /// More points than the protocol can address.
    #[error("too many touch points: {0} (maximum {MAX_CONTACTS})")]
    TooManyContacts(usize),

    /// Contact id outside `0..=9`.
    #[error("contact id {0} out of range 0-9")]
    InvalidContact(u8),

    /// The same contact id appears twice in one multi-touch gesture.
    #[error("contact id {0} used more than once")]
    DuplicateContact(u8),

    /// A gesture needs at least one point.
    #[error("gesture has no touch points")]
    Empty,

    /// A swipe needs at least one interpolation step.
    #[error("swipe needs at least one step")]
    ZeroSteps,

    /// More points, or a higher contact id, than the daemon announced.
    #[error("contact {contact} of {count} exceeds the daemon's {supported} contacts")]
    ExceedsDaemonContacts {
        contact: u8,
        count: usize,
        supported: u32,
    },
}

/// One raw daemon command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GestureCommand {
    Down {
        contact: u8,
        x: u32,
        y: u32,
        pressure: u32,
    },
    Move {
        contact: u8,
        x: u32,
        y: u32,
        pressure: u32,
    },
    Up {
        contact: u8,
    },
    Commit,
    Wait(u64),
}

impl fmt::Display for GestureCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Down {
                contact,
                x,
                y,
                pressure,
            } => write!(f, "d {contact} {x} {y} {pressure}"),
            Self::Move {
                contact,
                x,
                y,
                pressure,
            } => write!(f, "m {contact} {x} {y} {pressure}"),
            Self::Up { contact } => write!(f, "u {contact}"),
            Self::Commit => f.write_str("c"),
            Self::Wait(ms) => write!(f, "w {ms}"),
        }
    }
}

/// Renders a command sequence as the daemon's wire text.
///
/// Every command is newline terminated, and a final commit is appended if the
/// sequence does not already end with one, so nothing is left queued on the
/// device.
pub fn encode_commands(commands: &[GestureCommand]) -> String {
    let mut out = String::with_capacity(commands.len() * 16 + 2);
    for cmd in commands {
        out.push_str(&cmd.to_string());
        out.push('\n');
    }
    if commands.last() != Some(&GestureCommand::Commit) {
        out.push_str("c\n");
    }
    out
}

// ── Capability handshake ──────────────────────────────────────────────────────

/// Coordinate and contact limits announced by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonCapability {
    pub max_contacts: u32,
    pub max_x: u32,
    pub max_y: u32,
    pub max_pressure: u32,
}

/// One recognised banner line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BannerLine {
    /// `v <version>`
    Version(u32),
    /// `^ <contacts> <max_x> <max_y> <max_pressure>`
    Capability(DaemonCapability),
    /// `$ <pid>`
    Pid(u32),
}

/// Parses one banner line; unknown or malformed lines yield `None`.
///
/// A capability line with a missing or zero pressure falls back to
/// [`DEFAULT_MAX_PRESSURE`].
pub fn parse_banner_line(line: &str) -> Option<BannerLine> {
    let mut parts = line.split_whitespace();
    match parts.next()? {
        "v" => parts.next()?.parse().ok().map(BannerLine::Version),
        "$" => parts.next()?.parse().ok().map(BannerLine::Pid),
        "^" => {
            let max_contacts = parts.next()?.parse().ok()?;
            let max_x = parts.next()?.parse().ok()?;
            let max_y = parts.next()?.parse().ok()?;
            let max_pressure = parts
                .next()
                .and_then(|p| p.parse().ok())
                .filter(|p: &u32| *p > 0)
                .unwrap_or(DEFAULT_MAX_PRESSURE);
            Some(BannerLine::Capability(DaemonCapability {
                max_contacts,
                max_x,
                max_y,
                max_pressure,
            }))
        }
        _ => None,
    }
}

// ── Coordinate scaling ────────────────────────────────────────────────────────

/// Maps one logical axis value into the daemon's raw range.
///
/// `raw = round(logical * max / screen)`, clamped to `[0, max]`.  A zero
/// screen dimension maps everything to 0.
pub fn scale_axis(logical: f64, screen: u32, max: u32) -> u32 {
    if screen == 0 || !logical.is_finite() {
        return 0;
    }
    let raw = (logical * f64::from(max) / f64::from(screen)).round();
    raw.clamp(0.0, f64::from(max)) as u32
}

/// Converts logical screen pixels into raw daemon coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinateScaler {
    pub screen: Resolution,
    pub capability: DaemonCapability,
}

impl CoordinateScaler {
    pub fn new(screen: Resolution, capability: DaemonCapability) -> Self {
        Self { screen, capability }
    }

    /// Scales a logical pixel position.
    pub fn to_raw(&self, x: f64, y: f64) -> RawPoint {
        RawPoint {
            x: scale_axis(x, self.screen.width, self.capability.max_x),
            y: scale_axis(y, self.screen.height, self.capability.max_y),
        }
    }

    /// Converts a normalized `[0, 1]` position to logical pixels.
    pub fn denormalize(&self, nx: f64, ny: f64) -> (f64, f64) {
        (
            nx.clamp(0.0, 1.0) * f64::from(self.screen.width),
            ny.clamp(0.0, 1.0) * f64::from(self.screen.height),
        )
    }

    /// Checks contacts against the `^` line's contact count.
    ///
    /// # Errors
    ///
    /// Returns [`GestureError::ExceedsDaemonContacts`] when there are more
    /// contacts than the daemon tracks or an id is not below that count.
    pub fn check_contacts(&self, contacts: &[Contact]) -> Result<(), GestureError> {
        let supported = self.capability.max_contacts;
        let count = contacts.len();
        let beyond = contacts.iter().find(|c| u32::from(c.id) >= supported);
        let excess = contacts.last().filter(|_| count as u64 > u64::from(supported));
        match beyond.or(excess) {
            Some(c) => Err(GestureError::ExceedsDaemonContacts {
                contact: c.id,
                count,
                supported,
            }),
            None => Ok(()),
        }
    }

    /// Clamps a requested pressure to the daemon's range.
    pub fn pressure(&self, requested: u32) -> u32 {
        requested.min(self.capability.max_pressure)
    }
}

/// A point in raw daemon coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawPoint {
    pub x: u32,
    pub y: u32,
}

/// One finger of a multi-touch gesture, in raw coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Contact {
    pub id: u8,
    pub point: RawPoint,
}

// ── Gesture builders ──────────────────────────────────────────────────────────

/// `down → commit → wait → up → commit` on contact 0.
pub fn tap(at: RawPoint, pressure: u32, duration_ms: u64) -> Vec<GestureCommand> {
    vec![
        GestureCommand::Down {
            contact: 0,
            x: at.x,
            y: at.y,
            pressure,
        },
        GestureCommand::Commit,
        GestureCommand::Wait(duration_ms),
        GestureCommand::Up { contact: 0 },
        GestureCommand::Commit,
    ]
}

/// Fixed-step linear swipe on contact 0.
///
/// Emits `steps` interpolated moves regardless of `duration_ms`; the duration
/// is spread as equal waits between steps.
///
/// # Errors
///
/// Returns [`GestureError::ZeroSteps`] if `steps` is 0.
pub fn swipe(
    from: RawPoint,
    to: RawPoint,
    pressure: u32,
    duration_ms: u64,
    steps: u32,
) -> Result<Vec<GestureCommand>, GestureError> {
    if steps == 0 {
        return Err(GestureError::ZeroSteps);
    }
    let step_wait = duration_ms / u64::from(steps);

    let mut cmds = Vec::with_capacity(4 + steps as usize * 3);
    cmds.push(GestureCommand::Down {
        contact: 0,
        x: from.x,
        y: from.y,
        pressure,
    });
    cmds.push(GestureCommand::Commit);

    for i in 1..=steps {
        let ratio = f64::from(i) / f64::from(steps);
        let x = lerp(from.x, to.x, ratio);
        let y = lerp(from.y, to.y, ratio);
        if step_wait > 0 {
            cmds.push(GestureCommand::Wait(step_wait));
        }
        cmds.push(GestureCommand::Move {
            contact: 0,
            x,
            y,
            pressure,
        });
        cmds.push(GestureCommand::Commit);
    }

    cmds.push(GestureCommand::Up { contact: 0 });
    cmds.push(GestureCommand::Commit);
    Ok(cmds)
}

/// All fingers down under one commit, wait, all fingers up under one commit.
///
/// # Errors
///
/// Returns [`GestureError`] for more than [`MAX_CONTACTS`] points, an empty
/// point list, or a contact id that is out of range or repeated.
pub fn multi_touch(
    contacts: &[Contact],
    pressure: u32,
    duration_ms: u64,
) -> Result<Vec<GestureCommand>, GestureError> {
    validate_contacts(contacts)?;

    let mut cmds = Vec::with_capacity(contacts.len() * 2 + 3);
    for c in contacts {
        cmds.push(GestureCommand::Down {
            contact: c.id,
            x: c.point.x,
            y: c.point.y,
            pressure,
        });
    }
    cmds.push(GestureCommand::Commit);
    cmds.push(GestureCommand::Wait(duration_ms));
    for c in contacts {
        cmds.push(GestureCommand::Up { contact: c.id });
    }
    cmds.push(GestureCommand::Commit);
    Ok(cmds)
}

/// Checks a multi-touch contact list without building it.
pub fn validate_contacts(contacts: &[Contact]) -> Result<(), GestureError> {
    if contacts.len() > MAX_CONTACTS {
        return Err(GestureError::TooManyContacts(contacts.len()));
    }
    if contacts.is_empty() {
        return Err(GestureError::Empty);
    }
    let mut seen = [false; MAX_CONTACTS];
    for c in contacts {
        let idx = c.id as usize;
        if idx >= MAX_CONTACTS {
            return Err(GestureError::InvalidContact(c.id));
        }
        if seen[idx] {
            return Err(GestureError::DuplicateContact(c.id));
        }
        seen[idx] = true;
    }
    Ok(())
}

fn lerp(a: u32, b: u32, t: f64) -> u32 {
    let v = f64::from(a) + (f64::from(b) - f64::from(a)) * t;
    v.round().max(0.0) as u32
}
