// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! ClawFault front-end: parse flags, spawn the target program, and hand the
//! child over to the monitor core. The core itself never sees argv; it
//! consumes a validated [`MonitorOptions`].

use std::path::PathBuf;
use std::process::Command;

use anyhow::{bail, Context, Result};
use tracing_subscriber::EnvFilter;

use clawfault::channel;
use clawfault::monitor::{self, MonitorController};
use clawfault::{MonitorOptions, RunMode};

fn print_usage() {
    eprintln!(
        "Usage: clawfault <periodic|command> [options] <program> [program args...]\n\
         \n\
         Options:\n\
           --config=PATH                 Load monitor options from a TOML file\n\
           --threads=N                   Scanner worker threads (1-256, default 12)\n\
           --error-mode=MODE             bitflip | zero | one\n\
           --pointer-error-rate=F        Injection rate for pointers [0,1]\n\
           --non-pointer-error-rate=F    Injection rate for non-pointers [0,1]\n\
           --error-limit=N               Global fault budget\n\
           --error-seed=N                RNG seed (0 = wall clock)\n\
           --delay-ms=N                  Periodic mode: initial delay\n\
           --interval-ms=N               Periodic mode: scan interval\n\
           --max-iterations=N            Periodic mode: iteration cap\n\
           --verbose                     Debug-level console output"
    );
}

extern "C" fn on_terminate(_signo: libc::c_int) {
    monitor::request_shutdown();
}

fn install_shutdown_handlers() {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = on_terminate as extern "C" fn(libc::c_int) as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
        libc::sigaction(libc::SIGTERM, &sa, std::ptr::null_mut());
    }
}

struct Cli {
    options: MonitorOptions,
    verbose: bool,
    program: String,
    program_args: Vec<String>,
}

fn parse_args(args: &[String]) -> Result<Cli> {
    let mode: RunMode = args
        .get(1)
        .map(String::as_str)
        .unwrap_or("help")
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;

    // Config file first, flag overrides second.
    let config_path: Option<PathBuf> = args
        .iter()
        .find_map(|a| a.strip_prefix("--config=").map(PathBuf::from));
    let mut options = match &config_path {
        Some(path) => MonitorOptions::load(path)?,
        None => MonitorOptions::default(),
    };
    options.mode = mode;

    let mut verbose = false;
    let mut rest = args[2..].iter();
    let mut program: Option<String> = None;
    let mut program_args: Vec<String> = Vec::new();

    for arg in rest.by_ref() {
        if arg == "--verbose" || arg == "-v" {
            verbose = true;
        } else if arg.starts_with("--config=") {
            // Handled above.
        } else if let Some(v) = arg.strip_prefix("--threads=") {
            options.workers = v.parse().context("invalid --threads")?;
        } else if let Some(v) = arg.strip_prefix("--error-mode=") {
            options.error_mode = v.parse().map_err(|e: String| anyhow::anyhow!(e))?;
        } else if let Some(v) = arg.strip_prefix("--pointer-error-rate=") {
            options.pointer_error_rate = v.parse().context("invalid --pointer-error-rate")?;
        } else if let Some(v) = arg.strip_prefix("--non-pointer-error-rate=") {
            options.non_pointer_error_rate =
                v.parse().context("invalid --non-pointer-error-rate")?;
        } else if let Some(v) = arg.strip_prefix("--error-limit=") {
            options.error_limit = v.parse().context("invalid --error-limit")?;
        } else if let Some(v) = arg.strip_prefix("--error-seed=") {
            options.error_seed = v.parse().context("invalid --error-seed")?;
        } else if let Some(v) = arg.strip_prefix("--delay-ms=") {
            options.initial_delay_ms = v.parse().context("invalid --delay-ms")?;
        } else if let Some(v) = arg.strip_prefix("--interval-ms=") {
            options.interval_ms = v.parse().context("invalid --interval-ms")?;
        } else if let Some(v) = arg.strip_prefix("--max-iterations=") {
            options.max_iterations = Some(v.parse().context("invalid --max-iterations")?);
        } else if arg == "--" {
            break;
        } else if arg.starts_with("--") {
            bail!("unknown option '{}'", arg);
        } else {
            program = Some(arg.clone());
            break;
        }
    }
    if program.is_none() {
        program = rest.next().cloned();
    }
    program_args.extend(rest.cloned());

    let program = match program {
        Some(p) => p,
        None => bail!("no program to monitor was given"),
    };

    options.validate()?;
    Ok(Cli {
        options,
        verbose,
        program,
        program_args,
    })
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 || args[1] == "help" || args[1] == "--help" || args[1] == "-h" {
        print_usage();
        return Ok(());
    }

    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("clawfault: {e:#}\n");
            print_usage();
            std::process::exit(2);
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    install_shutdown_handlers();
    // The command handler must exist before the child can send anything;
    // the default disposition of the request signal would kill us.
    channel::install_request_handler().context("failed to install command handler")?;

    let mut child = Command::new(&cli.program)
        .args(&cli.program_args)
        .spawn()
        .with_context(|| format!("failed to spawn '{}'", cli.program))?;
    let child_pid = child.id() as i32;
    tracing::info!(pid = child_pid, program = %cli.program, "spawned target");

    let mut controller = MonitorController::new(child_pid, &cli.options)?;
    let run_result = controller.run();

    tracing::info!(pid = child_pid, "terminating child process");
    let _ = child.kill();
    let _ = child.wait();
    tracing::info!("monitoring complete");

    run_result
}
