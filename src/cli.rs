//! Command-line surface: `systrace [-v]... [--follow-fork] [--cov <path>]
//! [--trace-output <path>] [--no-syscall-trace] -- <program> [args...]`.

use clap::{App, Arg};

#[derive(Debug, Clone)]
pub struct Config {
    pub program: String,
    pub program_args: Vec<String>,
    pub follow_fork: bool,
    pub syscall_trace: bool,
    pub cov_descriptor_path: Option<String>,
    pub trace_output_path: Option<String>,
    pub verbosity: u64,
}

pub fn parse_args() -> Config {
    let matches = App::new("systrace")
        .about("ptrace-based syscall tracer and basic-block coverage collector")
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .multiple(true)
                .help("increase log verbosity (repeatable: warn, info, debug, trace)"),
        )
        .arg(
            Arg::with_name("follow-fork")
                .long("follow-fork")
                .help("trace children created by fork/vfork/clone as well"),
        )
        .arg(
            Arg::with_name("no-syscall-trace")
                .long("no-syscall-trace")
                .help("disable PTRACE_SYSCALL stops; resume with PTRACE_CONT instead"),
        )
        .arg(
            Arg::with_name("cov")
                .long("cov")
                .takes_value(true)
                .value_name("PATH")
                .help("binary coverage descriptor to arm breakpoints from"),
        )
        .arg(
            Arg::with_name("trace-output")
                .long("trace-output")
                .takes_value(true)
                .value_name("PATH")
                .help("where to write the coverage hit trace (requires --cov)"),
        )
        .arg(
            Arg::with_name("program")
                .required(true)
                .multiple(true)
                .last(true)
                .help("program to launch under trace, followed by its arguments"),
        )
        .get_matches();

    let mut program_args: Vec<String> = matches
        .values_of("program")
        .expect("program is required")
        .map(String::from)
        .collect();
    let program = program_args.remove(0);

    Config {
        program,
        program_args,
        follow_fork: matches.is_present("follow-fork"),
        syscall_trace: !matches.is_present("no-syscall-trace"),
        cov_descriptor_path: matches.value_of("cov").map(String::from),
        trace_output_path: matches.value_of("trace-output").map(String::from),
        verbosity: matches.occurrences_of("verbose"),
    }
}
