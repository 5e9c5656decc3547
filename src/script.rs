//! # Fault Script Parsing
//!
//! A fault script is a line-oriented text file: one command per line,
//! whitespace-delimited tokens, `#` comments. Parsing validates every
//! command against the target's embedded [`Config`]: the blacklists act
//! as a capability gate enforced here, before the victim is ever spawned.

use crate::config::{parse_i64, parse_u64, Config};
use std::fmt;
use thiserror::Error;

/// The five command kinds a script may use.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum FaultKind {
    Skip,
    Bitflip,
    Log,
    Havoc,
    Zero,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultKind::Skip => "skip",
            FaultKind::Bitflip => "bitflip",
            FaultKind::Log => "log",
            FaultKind::Havoc => "havoc",
            FaultKind::Zero => "zero",
        };
        f.write_str(name)
    }
}

/// Runtime conditions a fault command can trigger on.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum TriggerKind {
    InstructionPointer,
    InstructionCount,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerKind::InstructionPointer => f.write_str("instruction-pointer"),
            TriggerKind::InstructionCount => f.write_str("instruction-count"),
        }
    }
}

/// Targets of the `log` command.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogKind {
    Rip,
    InstructionCount,
    Fault,
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogKind::Rip => f.write_str("rip"),
            LogKind::InstructionCount => f.write_str("inscnt"),
            LogKind::Fault => f.write_str("fault"),
        }
    }
}

/// Position at which a fault command fires: `@addr` in the script selects
/// an instruction-pointer value, `#n` a retired-instruction count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    InstructionPointer(u64),
    InstructionCount(u64),
}

impl Trigger {
    pub fn kind(&self) -> TriggerKind {
        match self {
            Trigger::InstructionPointer(_) => TriggerKind::InstructionPointer,
            Trigger::InstructionCount(_) => TriggerKind::InstructionCount,
        }
    }

    /// Whether this trigger fires for the current stop.
    pub fn matches(&self, instruction_pointer: u64, instruction_counter: u64) -> bool {
        match self {
            Trigger::InstructionPointer(address) => *address == instruction_pointer,
            Trigger::InstructionCount(count) => *count == instruction_counter,
        }
    }
}

/// The perturbation a fault command applies once its trigger fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultEffect {
    /// Advance the instruction pointer by `distance` (may be negative).
    Skip { distance: i64 },
    /// Toggle bit `bit` of the word at `destination`.
    Bitflip { bit: u32, destination: u64 },
    /// Overwrite the word at `destination` with a fresh random value.
    Havoc { destination: u64 },
    /// Overwrite the word at `destination` with zero.
    Zero { destination: u64 },
}

impl FaultEffect {
    pub fn kind(&self) -> FaultKind {
        match self {
            FaultEffect::Skip { .. } => FaultKind::Skip,
            FaultEffect::Bitflip { .. } => FaultKind::Bitflip,
            FaultEffect::Havoc { .. } => FaultKind::Havoc,
            FaultEffect::Zero { .. } => FaultKind::Zero,
        }
    }
}

/// One parsed script line. Fault commands carry a trigger; log commands
/// are evaluated on every step and carry none.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Fault { effect: FaultEffect, trigger: Trigger },
    Log(LogKind),
}

/// Script rejection reasons. Every variant names the offending 1-based
/// line so the user can fix the script without a partial run occurring.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ScriptError {
    #[error("line {line}: unknown command '{token}'")]
    UnknownCommand { line: usize, token: String },
    #[error("line {line}: no {what} given")]
    MissingArgument { line: usize, what: &'static str },
    #[error("line {line}: invalid {what} '{token}'")]
    InvalidArgument {
        line: usize,
        what: &'static str,
        token: String,
    },
    #[error("line {line}: skip distance {distance} outside permitted range {min}..={max}")]
    SkipOutOfRange {
        line: usize,
        distance: i64,
        min: i64,
        max: i64,
    },
    #[error("line {line}: unknown logging target '{token}'")]
    UnknownLogTarget { line: usize, token: String },
    #[error("line {line}: command '{kind}' not allowed for this binary")]
    ForbiddenFault { line: usize, kind: FaultKind },
    #[error("line {line}: {kind} triggers not allowed for this binary")]
    ForbiddenTrigger { line: usize, kind: TriggerKind },
    #[error("line {line}: logging '{kind}' not allowed for this binary")]
    ForbiddenLog { line: usize, kind: LogKind },
}

/// Parses a whole script against the target's configuration.
///
/// Returns the commands in script order; evaluation order during the
/// run is insertion order, not any priority. The first offending line
/// aborts parsing.
pub fn parse_script(text: &str, config: &Config) -> Result<Vec<Command>, ScriptError> {
    let mut commands = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        if let Some(command) = parse_line(raw, index + 1, config)? {
            commands.push(command);
        }
    }
    Ok(commands)
}

/// Parses one line; blank lines and comments yield `None`.
///
/// Arguments are parsed and validated first, the capability gate against
/// the embedded config runs second, so a malformed line reports the
/// syntax problem even when the command would also be forbidden.
fn parse_line(raw: &str, line: usize, config: &Config) -> Result<Option<Command>, ScriptError> {
    let mut tokens = raw.split_whitespace();
    let head = match tokens.next() {
        Some(head) => head,
        None => return Ok(None),
    };
    if head.starts_with('#') {
        return Ok(None);
    }

    let command = match head.to_ascii_lowercase().as_str() {
        "skip" => {
            let distance = parse_signed(tokens.next(), line, "index")?;
            if distance < config.skip_min || distance > config.skip_max {
                return Err(ScriptError::SkipOutOfRange {
                    line,
                    distance,
                    min: config.skip_min,
                    max: config.skip_max,
                });
            }
            let trigger = parse_position(tokens.next(), line)?;
            Command::Fault {
                effect: FaultEffect::Skip { distance },
                trigger,
            }
        }
        "log" => {
            let target = tokens
                .next()
                .ok_or(ScriptError::MissingArgument {
                    line,
                    what: "logging target",
                })?;
            let kind = match target.to_ascii_lowercase().as_str() {
                "inscnt" => LogKind::InstructionCount,
                "rip" => LogKind::Rip,
                "fault" => LogKind::Fault,
                _ => {
                    return Err(ScriptError::UnknownLogTarget {
                        line,
                        token: target.to_string(),
                    })
                }
            };
            Command::Log(kind)
        }
        "havoc" => {
            let destination = parse_destination(tokens.next(), line)?;
            let trigger = parse_position(tokens.next(), line)?;
            Command::Fault {
                effect: FaultEffect::Havoc { destination },
                trigger,
            }
        }
        "zero" => {
            let destination = parse_destination(tokens.next(), line)?;
            let trigger = parse_position(tokens.next(), line)?;
            Command::Fault {
                effect: FaultEffect::Zero { destination },
                trigger,
            }
        }
        "bitflip" => {
            let bit = parse_bit(tokens.next(), line)?;
            let destination = parse_destination(tokens.next(), line)?;
            let trigger = parse_position(tokens.next(), line)?;
            Command::Fault {
                effect: FaultEffect::Bitflip { bit, destination },
                trigger,
            }
        }
        _ => {
            return Err(ScriptError::UnknownCommand {
                line,
                token: head.to_string(),
            })
        }
    };

    // Capability gate: the binary's embedded blacklists.
    match &command {
        Command::Fault { effect, trigger } => {
            if config.fault_blacklist.contains(&effect.kind()) {
                return Err(ScriptError::ForbiddenFault {
                    line,
                    kind: effect.kind(),
                });
            }
            if config.position_blacklist.contains(&trigger.kind()) {
                return Err(ScriptError::ForbiddenTrigger {
                    line,
                    kind: trigger.kind(),
                });
            }
        }
        Command::Log(kind) => {
            if config.fault_blacklist.contains(&FaultKind::Log) {
                return Err(ScriptError::ForbiddenFault {
                    line,
                    kind: FaultKind::Log,
                });
            }
            if config.log_blacklist.contains(kind) {
                return Err(ScriptError::ForbiddenLog { line, kind: *kind });
            }
        }
    }

    Ok(Some(command))
}

fn parse_position(token: Option<&str>, line: usize) -> Result<Trigger, ScriptError> {
    let token = token.ok_or(ScriptError::MissingArgument {
        line,
        what: "position",
    })?;
    let invalid = || ScriptError::InvalidArgument {
        line,
        what: "position",
        token: token.to_string(),
    };
    if let Some(address) = token.strip_prefix('@') {
        Ok(Trigger::InstructionPointer(
            parse_u64(address).ok_or_else(invalid)?,
        ))
    } else if let Some(count) = token.strip_prefix('#') {
        Ok(Trigger::InstructionCount(
            parse_u64(count).ok_or_else(invalid)?,
        ))
    } else {
        Err(invalid())
    }
}

fn parse_destination(token: Option<&str>, line: usize) -> Result<u64, ScriptError> {
    let token = token.ok_or(ScriptError::MissingArgument {
        line,
        what: "destination",
    })?;
    parse_u64(token).ok_or_else(|| ScriptError::InvalidArgument {
        line,
        what: "destination",
        token: token.to_string(),
    })
}

fn parse_signed(token: Option<&str>, line: usize, what: &'static str) -> Result<i64, ScriptError> {
    let token = token.ok_or(ScriptError::MissingArgument { line, what })?;
    parse_i64(token).ok_or_else(|| ScriptError::InvalidArgument {
        line,
        what,
        token: token.to_string(),
    })
}

fn parse_bit(token: Option<&str>, line: usize) -> Result<u32, ScriptError> {
    let token = token.ok_or(ScriptError::MissingArgument {
        line,
        what: "index",
    })?;
    parse_u64(token)
        .and_then(|bit| u32::try_from(bit).ok())
        .ok_or_else(|| ScriptError::InvalidArgument {
            line,
            what: "index",
            token: token.to_string(),
        })
}
