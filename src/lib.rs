mod config;
mod script;
mod simulation;
mod tracer;

pub mod prelude {
    pub use crate::config::Config;
    pub use crate::script::{
        parse_script, Command, FaultEffect, FaultKind, LogKind, ScriptError, Trigger, TriggerKind,
    };
    pub use crate::simulation::{FailureReason, Simulation, StepOutcome, Verdict};
    pub use crate::tracer::{Registers, TraceAccess, TraceController, TraceError};
}
