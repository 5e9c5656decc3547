//! # Trace Control
//!
//! Owns the ptrace attachment to the victim process: launch, wait,
//! single-step, detach, and the register/memory access primitives. The
//! fault engine only ever talks to the [`TraceAccess`] trait, so it can
//! be exercised against an in-memory fake without a real traced process.

use log::debug;
use nix::libc;
use nix::sys::ptrace;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use std::fmt;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;
use thiserror::Error;

/// Tracing failures. Spawn errors abort the run; individual register or
/// memory access errors are logged by the caller and treated as no-ops.
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("failed to start binary '{path}': {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("ptrace {request} failed for pid {pid}: {source}")]
    Ptrace {
        request: &'static str,
        pid: Pid,
        #[source]
        source: nix::Error,
    },
    #[error("waitpid failed for pid {pid}: {source}")]
    Wait {
        pid: Pid,
        #[source]
        source: nix::Error,
    },
}

/// Full register set of a stopped tracee.
///
/// Wraps the raw kernel register file; the engine only steers the
/// instruction pointer, but whole-set get/set keeps the write-back a
/// single ptrace call.
#[derive(Clone, Copy)]
pub struct Registers(pub libc::user_regs_struct);

impl Registers {
    pub fn instruction_pointer(&self) -> u64 {
        self.0.rip
    }

    pub fn set_instruction_pointer(&mut self, address: u64) {
        self.0.rip = address;
    }
}

impl Default for Registers {
    fn default() -> Self {
        // Plain-old-data kernel struct, all-zero is a valid value.
        Self(unsafe { std::mem::zeroed() })
    }
}

impl fmt::Debug for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registers")
            .field("rip", &format_args!("{:#x}", self.0.rip))
            .finish_non_exhaustive()
    }
}

/// Register/memory access primitives the fault engine depends on.
pub trait TraceAccess {
    fn registers(&mut self) -> Result<Registers, TraceError>;
    fn set_registers(&mut self, registers: &Registers) -> Result<(), TraceError>;
    fn read_word(&mut self, address: u64) -> Result<u64, TraceError>;
    fn write_word(&mut self, address: u64, word: u64) -> Result<(), TraceError>;
}

/// Ptrace attachment to one victim process.
pub struct TraceController {
    pid: Pid,
}

impl TraceController {
    /// Spawns `program` as a traced child. The child requests tracing
    /// before replacing its image, so the parent observes the post-exec
    /// stop. Arguments are forwarded verbatim, environment and stdio are
    /// inherited.
    pub fn launch(program: &Path, args: &[String]) -> Result<Self, TraceError> {
        let mut command = Command::new(program);
        command.args(args);
        unsafe {
            command.pre_exec(|| Ok(ptrace::traceme()?));
        }
        let child = command.spawn().map_err(|source| TraceError::Spawn {
            path: program.display().to_string(),
            source,
        })?;
        let pid = Pid::from_raw(child.id() as i32);
        debug!("Launched '{}' as pid {pid}", program.display());
        Ok(Self { pid })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Blocks until the child changes state.
    pub fn wait(&mut self) -> Result<WaitStatus, TraceError> {
        waitpid(self.pid, None).map_err(|source| TraceError::Wait {
            pid: self.pid,
            source,
        })
    }

    /// Resumes the child for exactly one instruction.
    pub fn step(&mut self) -> Result<(), TraceError> {
        ptrace::step(self.pid, None).map_err(|source| self.call_error("SINGLESTEP", source))
    }

    /// Releases the (possibly already gone) child.
    pub fn detach(self) {
        if let Err(e) = ptrace::detach(self.pid, None) {
            debug!("Detach from pid {}: {e}", self.pid);
        }
    }

    fn call_error(&self, request: &'static str, source: nix::Error) -> TraceError {
        TraceError::Ptrace {
            request,
            pid: self.pid,
            source,
        }
    }
}

impl TraceAccess for TraceController {
    fn registers(&mut self) -> Result<Registers, TraceError> {
        ptrace::getregs(self.pid)
            .map(Registers)
            .map_err(|source| self.call_error("GETREGS", source))
    }

    fn set_registers(&mut self, registers: &Registers) -> Result<(), TraceError> {
        ptrace::setregs(self.pid, registers.0).map_err(|source| self.call_error("SETREGS", source))
    }

    fn read_word(&mut self, address: u64) -> Result<u64, TraceError> {
        ptrace::read(self.pid, address as ptrace::AddressType)
            .map(|word| word as u64)
            .map_err(|source| self.call_error("PEEKDATA", source))
    }

    fn write_word(&mut self, address: u64, word: u64) -> Result<(), TraceError> {
        ptrace::write(
            self.pid,
            address as ptrace::AddressType,
            word as libc::c_long,
        )
        .map_err(|source| self.call_error("POKEDATA", source))
    }
}

/// Routes a wait status to the debug channel.
pub fn log_status(status: &WaitStatus) {
    match status {
        WaitStatus::Stopped(pid, signal) => debug!("Child {pid} stopped: {signal}"),
        WaitStatus::Exited(pid, code) => debug!("Child {pid} exited: {code}"),
        WaitStatus::Signaled(pid, signal, core_dumped) => {
            debug!("Child {pid} signaled: {signal} (core dumped: {core_dumped})")
        }
        other => debug!("Child status: {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_default_and_pointer_roundtrip() {
        let mut registers = Registers::default();
        assert_eq!(registers.instruction_pointer(), 0);
        registers.set_instruction_pointer(0x401000);
        assert_eq!(registers.instruction_pointer(), 0x401000);
        assert!(format!("{registers:?}").contains("0x401000"));
    }
}
