//! # Embedded Per-Binary Configuration
//!
//! Target binaries may carry `FAULTCONFIG` directives in their raw bytes
//! (emitted by the build-time macro mechanism) which restrict the fault
//! types a script may use against them and tune simulation parameters.
//! This module scans a binary for those directives and folds them into a
//! [`Config`].

use crate::script::{FaultKind, LogKind, TriggerKind};
use itertools::Itertools;
use log::{debug, warn};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// 12-byte marker preceding every embedded directive: the ASCII tag plus
/// its NUL terminator.
const MARKER: &[u8] = b"FAULTCONFIG\0";

/// Process-wide simulation configuration, extracted once from the target
/// binary before the victim is spawned and immutable afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Fault kinds the target forbids.
    pub fault_blacklist: HashSet<FaultKind>,
    /// Trigger kinds the target forbids.
    pub position_blacklist: HashSet<TriggerKind>,
    /// Log kinds the target forbids.
    pub log_blacklist: HashSet<LogKind>,
    /// Lower bound for `skip` distances.
    pub skip_min: i64,
    /// Upper bound for `skip` distances.
    pub skip_max: i64,
    /// Wall-clock budget for the whole trace.
    pub timeout: Duration,
    /// If > 0, one in N fault applications is randomly suppressed.
    pub fail_every: u64,
    /// RNG seed declared by the binary, for havoc values and
    /// probabilistic suppression. When absent the simulation seeds from
    /// the clock at run start; extraction itself never consults the
    /// clock, so the same bytes always decode to the same `Config`.
    pub seed: Option<u64>,
    /// Minimum number of steps between two applied faults.
    pub cooldown: u64,
    /// Launch-address override declared by the binary. Decoded but not
    /// otherwise consumed.
    pub entry: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fault_blacklist: HashSet::new(),
            position_blacklist: HashSet::new(),
            log_blacklist: HashSet::new(),
            skip_min: -15,
            skip_max: 15,
            timeout: Duration::from_secs(30),
            fail_every: 0,
            seed: None,
            cooldown: 0,
            entry: None,
        }
    }
}

impl Config {
    /// Extracts the configuration from the binary at `path`.
    ///
    /// A missing or unreadable file is not an error; the defaults apply.
    pub fn from_binary(path: &Path) -> Self {
        match std::fs::read(path) {
            Ok(bytes) => Self::from_bytes(&bytes),
            Err(e) => {
                warn!(
                    "Could not read '{}' for config extraction: {e}",
                    path.display()
                );
                Self::default()
            }
        }
    }

    /// Extracts the configuration from raw binary bytes.
    ///
    /// The buffer is scanned at every offset for the `FAULTCONFIG` marker;
    /// the format of the surrounding file is irrelevant. Blacklist
    /// directives accumulate, scalar directives overwrite, unknown
    /// directives are ignored.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut config = Self::default();
        let mut offset = 0;
        while offset + MARKER.len() <= bytes.len() {
            if bytes[offset..].starts_with(MARKER) {
                let start = offset + MARKER.len();
                let rest = &bytes[start..];
                let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
                if let Ok(directive) = std::str::from_utf8(&rest[..end]) {
                    debug!("Config: {directive}");
                    // Bytes after the directive's terminator carry the
                    // payload of address-carrying directives.
                    config.apply_directive(directive, rest.get(end + 1..).unwrap_or(&[]));
                }
                offset = start + end;
            } else {
                offset += 1;
            }
        }
        config
    }

    fn apply_directive(&mut self, directive: &str, trailer: &[u8]) {
        match directive {
            "NOZERO" => {
                self.fault_blacklist.insert(FaultKind::Zero);
            }
            "NOHAVOC" => {
                self.fault_blacklist.insert(FaultKind::Havoc);
            }
            "NOSKIP" => {
                self.fault_blacklist.insert(FaultKind::Skip);
            }
            "NOBITFLIP" => {
                self.fault_blacklist.insert(FaultKind::Bitflip);
            }
            "NOLOG" => {
                self.fault_blacklist.insert(FaultKind::Log);
            }
            "NOLOGFAULT" => {
                self.log_blacklist.insert(LogKind::Fault);
            }
            "NOLOGRIP" => {
                self.log_blacklist.insert(LogKind::Rip);
            }
            "NOLOGINSTRUCTION" => {
                self.log_blacklist.insert(LogKind::InstructionCount);
            }
            "NORIPTRIGGER" => {
                self.position_blacklist
                    .insert(TriggerKind::InstructionPointer);
            }
            "NOINSTRUCTIONTRIGGER" => {
                self.position_blacklist.insert(TriggerKind::InstructionCount);
            }
            "ENTRY" => {
                // Address-carrying form: a native-endian pointer follows
                // the directive's terminator.
                if let Some(raw) = trailer.get(..8) {
                    let address = u64::from_ne_bytes(raw.try_into().unwrap());
                    debug!("Entry override: {address:#x}");
                    self.entry = Some(address);
                }
            }
            _ => {
                if let Some(value) = directive.strip_prefix("MINSKIP=") {
                    parse_scalar(directive, parse_i64(value), &mut self.skip_min);
                } else if let Some(value) = directive.strip_prefix("MAXSKIP=") {
                    parse_scalar(directive, parse_i64(value), &mut self.skip_max);
                } else if let Some(value) = directive.strip_prefix("TIMEOUT=") {
                    let mut secs = self.timeout.as_secs();
                    parse_scalar(directive, parse_u64(value), &mut secs);
                    self.timeout = Duration::from_secs(secs);
                } else if let Some(value) = directive.strip_prefix("FAILEVERY=") {
                    parse_scalar(directive, parse_u64(value), &mut self.fail_every);
                } else if let Some(value) = directive.strip_prefix("SEED=") {
                    let mut seed = 0;
                    if parse_scalar(directive, parse_u64(value), &mut seed) {
                        self.seed = Some(seed);
                    }
                } else if let Some(value) = directive.strip_prefix("COOLDOWN=") {
                    parse_scalar(directive, parse_u64(value), &mut self.cooldown);
                } else if let Some(value) = directive.strip_prefix("ENTRY=") {
                    let mut entry = 0;
                    if parse_scalar(directive, parse_u64(value), &mut entry) {
                        self.entry = Some(entry);
                    }
                }
                // Anything else was emitted by a newer macro set; ignore.
            }
        }
    }

    /// One-line summary of the restrictions a binary declares, for the
    /// debug channel.
    pub fn summary(&self) -> String {
        format!(
            "faults forbidden: [{}], triggers forbidden: [{}], logs forbidden: [{}], \
             skip {}..={}, timeout {}s, fail_every {}, cooldown {}",
            self.fault_blacklist.iter().sorted().join(", "),
            self.position_blacklist.iter().sorted().join(", "),
            self.log_blacklist.iter().sorted().join(", "),
            self.skip_min,
            self.skip_max,
            self.timeout.as_secs(),
            self.fail_every,
            self.cooldown,
        )
    }
}

fn parse_scalar<T>(directive: &str, parsed: Option<T>, slot: &mut T) -> bool {
    match parsed {
        Some(value) => {
            *slot = value;
            true
        }
        None => {
            debug!("Ignoring directive with malformed number: {directive}");
            false
        }
    }
}

/// Parses an unsigned integer with auto-detected radix (`0x` hex, `0o`
/// octal, `0b` binary, decimal otherwise).
pub(crate) fn parse_u64(text: &str) -> Option<u64> {
    let text = text.trim();
    let (digits, radix) = match text.get(..2) {
        Some("0x") | Some("0X") => (&text[2..], 16),
        Some("0o") | Some("0O") => (&text[2..], 8),
        Some("0b") | Some("0B") => (&text[2..], 2),
        _ => (text, 10),
    };
    u64::from_str_radix(digits, radix).ok()
}

/// Signed companion of [`parse_u64`].
pub(crate) fn parse_i64(text: &str) -> Option<i64> {
    let text = text.trim();
    if let Some(positive) = text.strip_prefix('-') {
        parse_u64(positive).and_then(|v| Some(-(i64::try_from(v).ok()?)))
    } else {
        parse_u64(text).and_then(|v| i64::try_from(v).ok())
    }
}
