use std::cell::RefCell;
use std::fs::File;
use std::io::BufWriter;
use std::rc::Rc;

use anyhow::Context;
use log::debug;

use systrace::cli;
use systrace::coverage::{CoverageReader, CoverageWriter, Placement};
use systrace::dispatch::{HandlerRegistry, SyscallDispatcher};
use systrace::error::exit_code_for;
use systrace::inferior;
use systrace::supervisor::Supervisor;
use systrace::traced_task::TracedTask;

fn log_kernel_release() {
    match nix::sys::utsname::uname() {
        Ok(uts) => debug!("running on kernel release {}", uts.release().to_string_lossy()),
        Err(e) => debug!("uname probe failed: {}", e),
    }
}

fn load_placements(path: &str) -> anyhow::Result<Vec<Placement>> {
    let reader = CoverageReader::<File>::open(path, false)
        .with_context(|| format!("failed to open coverage descriptor `{}`", path))?;
    let placements: Vec<Placement> = reader.collect();
    Ok(placements)
}

fn run() -> anyhow::Result<()> {
    let config = cli::parse_args();
    systrace::logging::init(config.verbosity).context("failed to initialize logging")?;
    log_kernel_release();

    let placements = match &config.cov_descriptor_path {
        Some(path) => load_placements(path)?,
        None => Vec::new(),
    };

    let coverage_writer = match (&config.cov_descriptor_path, &config.trace_output_path) {
        (Some(_), Some(out_path)) => {
            let writer = CoverageWriter::create(out_path)
                .with_context(|| format!("failed to create trace output `{}`", out_path))?;
            Some(Rc::new(RefCell::new(writer)))
        }
        (Some(_), None) => {
            log::warn!("--cov given without --trace-output; breakpoints will arm but hits are discarded");
            None
        }
        (None, _) => None,
    };

    let registry = Rc::new(HandlerRegistry::new());
    let dispatcher = SyscallDispatcher::new(registry);

    let pid = inferior::spawn(&config.program, &config.program_args)
        .with_context(|| format!("failed to spawn `{}`", config.program))?;

    let task = TracedTask::new(
        pid,
        config.follow_fork,
        config.syscall_trace,
        dispatcher,
        placements,
        coverage_writer,
    );

    let mut supervisor = Supervisor::new();
    supervisor.add(task);
    supervisor.run()?;
    Ok(())
}

fn main() {
    if let Err(err) = run() {
        eprintln!("systrace: {:#}", err);
        let code = err
            .downcast_ref::<systrace::error::TraceError>()
            .map(exit_code_for)
            .unwrap_or(1);
        std::process::exit(code);
    }
}
