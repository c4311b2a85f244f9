//! Structured command builder for the ASCII pump command language.
//!
//! A transmission is a sequence of typed primitives serialised in one pass.
//! Without a terminal `R` the device buffers the sequence until a later run
//! command, which is how several devices are started simultaneously.

use crate::constants::*;
use crate::error::{PumpError, Result};
use std::fmt;

/// One-shot hardware reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Query {
    /// `?` absolute plunger position in microsteps
    Position,
    /// `?1` start velocity
    StartVelocity,
    /// `?2` top velocity
    TopVelocity,
    /// `?3` stop velocity
    StopVelocity,
    /// `?12` return steps
    ReturnSteps,
    /// `?10000` syringe status word
    SyringeStatus,
    /// `?20000` valve status word
    ValveStatus,
    /// `?21000` valve type
    ValveType,
    /// `?24000` numeric valve position
    ValvePosition,
}

impl Query {
    pub fn code(&self) -> Option<u32> {
        match self {
            Query::Position => None,
            Query::StartVelocity => Some(1),
            Query::TopVelocity => Some(2),
            Query::StopVelocity => Some(3),
            Query::ReturnSteps => Some(12),
            Query::SyringeStatus => Some(10_000),
            Query::ValveStatus => Some(20_000),
            Query::ValveType => Some(21_000),
            Query::ValvePosition => Some(24_000),
        }
    }

    pub fn from_code(code: Option<u32>) -> Option<Query> {
        Some(match code {
            None => Query::Position,
            Some(1) => Query::StartVelocity,
            Some(2) => Query::TopVelocity,
            Some(3) => Query::StopVelocity,
            Some(12) => Query::ReturnSteps,
            Some(10_000) => Query::SyringeStatus,
            Some(20_000) => Query::ValveStatus,
            Some(21_000) => Query::ValveType,
            Some(24_000) => Query::ValvePosition,
            Some(_) => return None,
        })
    }
}

/// Command primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `&` firmware version
    Firmware,
    Query(Query),
    /// `h30001`
    EnableExtended,
    /// `h20000`
    InitValve,
    /// `h21000 + type`
    SetValveType(u8),
    /// `h26000 + position`
    MoveValve(u8),
    /// `h10000 + speed code`
    InitSyringe(u8),
    /// `k` backoff steps
    Backoff(u32),
    /// `v` start velocity
    StartVelocity(u32),
    /// `V` top velocity
    TopVelocity(u32),
    /// `c` stop velocity
    StopVelocity(u32),
    /// `K` return steps
    ReturnSteps(u32),
    /// `L` acceleration code
    Acceleration(u8),
    /// `A` absolute move in microsteps
    Absolute(u32),
    /// `D` relative dispense in microsteps
    Dispense(u32),
    /// `P` relative pickup in microsteps
    Pickup(u32),
    /// `M` delay in milliseconds
    Delay(u32),
    /// `z` init from encoder
    InitFromEncoder,
    /// `R` run
    Run,
    /// `T` terminate
    Terminate,
    /// `t` pause buffered commands
    PauseBuffer,
}

impl Command {
    /// True for primitives that move the plunger or valve
    pub fn is_motion(&self) -> bool {
        matches!(
            self,
            Command::InitValve
                | Command::MoveValve(_)
                | Command::InitSyringe(_)
                | Command::Absolute(_)
                | Command::Dispense(_)
                | Command::Pickup(_)
                | Command::Delay(_)
                | Command::InitFromEncoder
        )
    }

    /// Parse a whole command string such as `h26001D9600R`
    pub fn parse_sequence(text: &str) -> Result<Vec<Command>> {
        let bytes = text.as_bytes();
        let mut commands = Vec::new();
        let mut i = 0;
        while i < bytes.len() {
            let letter = bytes[i] as char;
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            let operand = if i > start {
                Some(text[start..i].parse::<u32>().map_err(|e| {
                    PumpError::InvalidArgument(format!("operand of '{}': {}", letter, e))
                })?)
            } else {
                None
            };
            commands.push(Self::from_parts(letter, operand)?);
        }
        Ok(commands)
    }

    fn from_parts(letter: char, operand: Option<u32>) -> Result<Command> {
        let need = |op: Option<u32>| {
            op.ok_or_else(|| PumpError::InvalidArgument(format!("'{}' needs an operand", letter)))
        };
        let small = |op: Option<u32>| -> Result<u8> {
            u8::try_from(need(op)?)
                .map_err(|_| PumpError::InvalidArgument(format!("operand of '{}' too large", letter)))
        };
        Ok(match letter {
            '&' => Command::Firmware,
            '?' => Command::Query(Query::from_code(operand).ok_or_else(|| {
                PumpError::InvalidArgument(format!("unknown query ?{:?}", operand))
            })?),
            'h' => {
                let code = need(operand)?;
                match code {
                    ENABLE_EXTENDED => Command::EnableExtended,
                    VALVE_INIT => Command::InitValve,
                    c if (VALVE_TYPE_OFFSET..VALVE_TYPE_OFFSET + 10).contains(&c) => {
                        Command::SetValveType((c - VALVE_TYPE_OFFSET) as u8)
                    }
                    c if (VALVE_MOVE_OFFSET..VALVE_MOVE_OFFSET + 100).contains(&c) => {
                        Command::MoveValve((c - VALVE_MOVE_OFFSET) as u8)
                    }
                    c if (SYRINGE_INIT_OFFSET..SYRINGE_INIT_OFFSET + 100).contains(&c) => {
                        Command::InitSyringe((c - SYRINGE_INIT_OFFSET) as u8)
                    }
                    other => {
                        return Err(PumpError::InvalidArgument(format!(
                            "unsupported h command {}",
                            other
                        )))
                    }
                }
            }
            'k' => Command::Backoff(need(operand)?),
            'v' => Command::StartVelocity(need(operand)?),
            'V' => Command::TopVelocity(need(operand)?),
            'c' => Command::StopVelocity(need(operand)?),
            'K' => Command::ReturnSteps(need(operand)?),
            'L' => Command::Acceleration(small(operand)?),
            'A' => Command::Absolute(need(operand)?),
            'D' => Command::Dispense(need(operand)?),
            'P' => Command::Pickup(need(operand)?),
            'M' => Command::Delay(need(operand)?),
            'z' => Command::InitFromEncoder,
            'R' => Command::Run,
            'T' => Command::Terminate,
            't' => Command::PauseBuffer,
            other => {
                return Err(PumpError::InvalidArgument(format!(
                    "unknown command letter '{}'",
                    other
                )))
            }
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Firmware => f.write_str("&"),
            Command::Query(q) => match q.code() {
                Some(code) => write!(f, "?{}", code),
                None => f.write_str("?"),
            },
            Command::EnableExtended => write!(f, "h{}", ENABLE_EXTENDED),
            Command::InitValve => write!(f, "h{}", VALVE_INIT),
            Command::SetValveType(t) => write!(f, "h{}", VALVE_TYPE_OFFSET + *t as u32),
            Command::MoveValve(p) => write!(f, "h{}", VALVE_MOVE_OFFSET + *p as u32),
            Command::InitSyringe(s) => write!(f, "h{}", SYRINGE_INIT_OFFSET + *s as u32),
            Command::Backoff(n) => write!(f, "k{}", n),
            Command::StartVelocity(n) => write!(f, "v{}", n),
            Command::TopVelocity(n) => write!(f, "V{}", n),
            Command::StopVelocity(n) => write!(f, "c{}", n),
            Command::ReturnSteps(n) => write!(f, "K{}", n),
            Command::Acceleration(n) => write!(f, "L{}", n),
            Command::Absolute(n) => write!(f, "A{}", n),
            Command::Dispense(n) => write!(f, "D{}", n),
            Command::Pickup(n) => write!(f, "P{}", n),
            Command::Delay(n) => write!(f, "M{}", n),
            Command::InitFromEncoder => f.write_str("z"),
            Command::Run => f.write_str("R"),
            Command::Terminate => f.write_str("T"),
            Command::PauseBuffer => f.write_str("t"),
        }
    }
}

/// Ordered list of primitives sent as one transmission
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandString {
    commands: Vec<Command>,
}

impl CommandString {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn with(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    /// Append another command string, dropping its terminal run
    pub fn append(&mut self, other: &CommandString) -> &mut Self {
        self.commands
            .extend(other.commands.iter().copied().filter(|c| *c != Command::Run));
        self
    }

    /// Terminate with `R` unless the sequence is being buffered
    pub fn finish(mut self, enqueue: bool) -> Self {
        self.commands.retain(|c| *c != Command::Run);
        if !enqueue {
            self.commands.push(Command::Run);
        }
        self
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// True when transmitting this string sets a device in motion
    pub fn is_move(&self) -> bool {
        self.commands.contains(&Command::Run)
    }

    pub fn ends_with_run(&self) -> bool {
        self.commands.last() == Some(&Command::Run)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for CommandString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for command in &self.commands {
            write!(f, "{}", command)?;
        }
        Ok(())
    }
}

impl From<Command> for CommandString {
    fn from(command: Command) -> Self {
        CommandString {
            commands: vec![command],
        }
    }
}

impl FromIterator<Command> for CommandString {
    fn from_iter<I: IntoIterator<Item = Command>>(iter: I) -> Self {
        CommandString {
            commands: iter.into_iter().collect(),
        }
    }
}
