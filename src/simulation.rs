//! # Simulation Run
//!
//! The fault matcher/effect engine and the single-step run loop. A
//! [`Simulation`] owns everything mutable for one run (command list,
//! instruction counter, cooldown, RNG), so nothing lives in process-wide
//! state and runs never leak into each other.

use crate::config::Config;
use crate::script::{Command, FaultEffect, LogKind};
use crate::tracer::{log_status, Registers, TraceAccess, TraceController, TraceError};
use log::{debug, error, warn};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::path::Path;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Engine result for one retired step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    TimedOut,
}

/// Why a run did not count as an exploitation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureReason {
    Exit(i32),
    Signal(Signal),
    Timeout,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Exit(code) => write!(f, "victim exited with status {code}"),
            FailureReason::Signal(signal) => write!(f, "victim killed by {signal}"),
            FailureReason::Timeout => f.write_str("timeout reached"),
        }
    }
}

/// The experiment's verdict: only a clean zero exit of the victim counts
/// as a successful exploitation. Everything else (nonzero exit, crash,
/// timeout) is a failure of the attack, not an internal error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Exploited,
    Failed(FailureReason),
}

impl Verdict {
    pub fn success(&self) -> bool {
        matches!(self, Verdict::Exploited)
    }
}

/// Mutable context of one simulation run.
pub struct Simulation {
    config: Config,
    commands: Vec<Command>,
    instruction_counter: u64,
    fault_cooldown: u64,
    rng: SmallRng,
    start_time: Option<Instant>,
}

impl Simulation {
    /// Creates a run context. The RNG is seeded from the binary's
    /// declared seed, so a fixed `SEED` directive reproduces the exact
    /// havoc values and probabilistic suppressions; without one the
    /// clock seeds each run differently.
    pub fn new(config: Config, commands: Vec<Command>) -> Self {
        let seed = config.seed.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0)
        });
        let rng = SmallRng::seed_from_u64(seed);
        Self {
            config,
            commands,
            instruction_counter: 0,
            fault_cooldown: 0,
            rng,
            start_time: None,
        }
    }

    /// Captures the start of the wall-clock budget. Called at the first
    /// trace stop, before the first step is retired.
    pub fn start_clock(&mut self) {
        self.start_time = Some(Instant::now());
    }

    /// Launches the victim under trace and drives it to completion.
    ///
    /// Loop per stop: apply faults for the current position, single-step,
    /// wait for the next stop. The victim's exit, a signal, or the
    /// timeout terminates the loop; the controller then detaches and the
    /// outcome is classified into a [`Verdict`].
    pub fn run(&mut self, program: &Path, args: &[String]) -> Result<Verdict, TraceError> {
        let mut controller = TraceController::launch(program, args)?;
        let mut status = controller.wait()?;
        log_status(&status);
        self.start_clock();

        let mut timed_out = false;
        while let WaitStatus::Stopped(..) = status {
            if self.step_faults(&mut controller) == StepOutcome::TimedOut {
                error!("Timeout of {}s reached", self.config.timeout.as_secs());
                timed_out = true;
                break;
            }
            if let Err(e) = controller.step() {
                warn!("{e}");
            }
            status = controller.wait()?;
        }

        log_status(&status);
        debug!("Detaching from pid {}", controller.pid());
        controller.detach();

        Ok(Self::classify(status, timed_out))
    }

    fn classify(status: WaitStatus, timed_out: bool) -> Verdict {
        if timed_out {
            return Verdict::Failed(FailureReason::Timeout);
        }
        match status {
            WaitStatus::Exited(_, 0) => Verdict::Exploited,
            WaitStatus::Exited(_, code) => Verdict::Failed(FailureReason::Exit(code)),
            WaitStatus::Signaled(_, signal, _) => Verdict::Failed(FailureReason::Signal(signal)),
            other => {
                warn!("Trace loop left in unexpected state: {other:?}");
                Verdict::Failed(FailureReason::Exit(-1))
            }
        }
    }

    /// Engine entry point, invoked exactly once per retired single-step.
    ///
    /// Order is fixed: log commands, cooldown decrement, fault matching
    /// and effects, counter increment, timeout check.
    pub fn step_faults(&mut self, access: &mut dyn TraceAccess) -> StepOutcome {
        self.apply_commands(access);
        self.instruction_counter += 1;
        if let Some(start) = self.start_time {
            if start.elapsed() > self.config.timeout {
                return StepOutcome::TimedOut;
            }
        }
        StepOutcome::Continue
    }

    fn apply_commands(&mut self, access: &mut dyn TraceAccess) {
        let mut registers = match access.registers() {
            Ok(registers) => registers,
            Err(e) => {
                warn!("Could not fetch registers: {e}");
                return;
            }
        };

        // Log commands run on every step; `log fault` only arms the
        // fault logging below for this step.
        let mut log_fault = false;
        for command in &self.commands {
            if let Command::Log(kind) = command {
                match kind {
                    LogKind::Rip => println!("RIP: {:#x}", registers.instruction_pointer()),
                    LogKind::InstructionCount => {
                        println!("Instruction #{}", self.instruction_counter)
                    }
                    LogKind::Fault => log_fault = true,
                }
            }
        }

        if self.fault_cooldown > 0 {
            self.fault_cooldown -= 1;
        }

        // Matching reads the live register file: an applied skip moves
        // the pointer that later commands of the same step are matched
        // and applied against.
        for i in 0..self.commands.len() {
            let (effect, trigger) = match self.commands[i] {
                Command::Fault { effect, trigger } => (effect, trigger),
                Command::Log(_) => continue,
            };
            if !trigger.matches(registers.instruction_pointer(), self.instruction_counter) {
                continue;
            }

            if self.fault_cooldown != 0 {
                debug!("Cooldown - skipping fault '{}'", effect.kind());
                if log_fault {
                    println!(
                        "Cannot induce fault '{}' - last fault was too recent",
                        effect.kind()
                    );
                }
                continue;
            }
            self.fault_cooldown = self.config.cooldown;

            // A suppressed attempt still consumed the glitch hardware,
            // hence the cooldown above stays armed.
            if self.config.fail_every > 0 && self.rng.gen::<u64>() % self.config.fail_every == 0 {
                debug!("Command '{}' randomly failed", effect.kind());
                continue;
            }

            self.apply_effect(effect, &mut registers, access, log_fault);
        }
    }

    fn apply_effect(
        &mut self,
        effect: FaultEffect,
        registers: &mut Registers,
        access: &mut dyn TraceAccess,
        log_fault: bool,
    ) {
        let instruction_pointer = registers.instruction_pointer();
        let counter = self.instruction_counter;
        match effect {
            FaultEffect::Skip { distance } => {
                debug!("Skip {distance} @ {instruction_pointer:#x}");
                if log_fault {
                    println!(
                        "SKIP {distance} (RIP: {instruction_pointer:#x}, Instruction #{counter})"
                    );
                }
                registers.set_instruction_pointer(instruction_pointer.wrapping_add_signed(distance));
                if let Err(e) = access.set_registers(registers) {
                    warn!("Could not write registers: {e}");
                }
            }
            FaultEffect::Havoc { destination } => {
                let value: u64 = self.rng.gen();
                debug!("Havoc {destination:#x} @ {instruction_pointer:#x}");
                if log_fault {
                    println!(
                        "HAVOC {destination:#x} -> {value:#x} \
                         (RIP: {instruction_pointer:#x}, Instruction #{counter})"
                    );
                }
                if let Err(e) = access.write_word(destination, value) {
                    warn!("Could not write word at {destination:#x}: {e}");
                }
            }
            FaultEffect::Zero { destination } => {
                debug!("Zero {destination:#x} @ {instruction_pointer:#x}");
                if log_fault {
                    println!(
                        "ZERO {destination:#x} (RIP: {instruction_pointer:#x}, \
                         Instruction #{counter})"
                    );
                }
                if let Err(e) = access.write_word(destination, 0) {
                    warn!("Could not write word at {destination:#x}: {e}");
                }
            }
            FaultEffect::Bitflip { bit, destination } => {
                debug!("Bitflip #{bit} -> {destination:#x} @ {instruction_pointer:#x}");
                if log_fault {
                    println!(
                        "BITFLIP #{bit} -> {destination:#x} \
                         (RIP: {instruction_pointer:#x}, Instruction #{counter})"
                    );
                }
                match access.read_word(destination) {
                    Ok(word) => {
                        if let Err(e) = access.write_word(destination, word ^ 1u64.wrapping_shl(bit))
                        {
                            warn!("Could not write word at {destination:#x}: {e}");
                        }
                    }
                    Err(e) => warn!("Could not read word at {destination:#x}: {e}"),
                }
            }
        }
    }

    pub fn instruction_counter(&self) -> u64 {
        self.instruction_counter
    }
}
