use clap::Parser;
use colored::Colorize;
use log::debug;
use std::path::PathBuf;

use fault_injector::prelude::*;

/// Command line parameter structure
///
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Fault script to execute against the target
    script: PathBuf,

    /// Target binary to run under trace
    binary: PathBuf,

    /// Arguments forwarded verbatim to the target
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

/// Program to simulate hardware fault attacks against a traced victim binary
///
fn main() -> Result<(), String> {
    let args = Args::parse();
    env_logger::init(); // Switch on with: RUST_LOG=debug

    // The binary's embedded directives gate what the script may do.
    let config = Config::from_binary(&args.binary);
    debug!("{}", config.summary());

    let script = std::fs::read_to_string(&args.script)
        .map_err(|e| format!("Could not open script file '{}': {e}", args.script.display()))?;
    let commands = parse_script(&script, &config).map_err(|e| e.to_string())?;
    debug!("Loaded {} commands", commands.len());

    let mut simulation = Simulation::new(config, commands);
    let verdict = simulation
        .run(&args.binary, &args.args)
        .map_err(|e| e.to_string())?;

    let target = args.binary.display();
    if verdict.success() {
        println!("\n{}", format!("Successfully exploited {target}!").green());
    } else {
        println!("\n{}", format!("Failed to exploit {target}!").red());
    }
    Ok(())
}
