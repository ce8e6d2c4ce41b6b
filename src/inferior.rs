//! Launching a traced inferior (C1).
//!
//! `spawn` forks, has the child request tracing, then `execvp`s the target
//! program and returns immediately — it does not wait out the resulting
//! `SIGTRAP`. That stop is just the tracee's `INITIAL_STOP` (§4.7) and is
//! picked up by the supervisor's ordinary wait loop like any other event, so
//! a freshly spawned root tracee and a freshly forked child tracee go
//! through the exact same code path in `traced_task`. `install_options`
//! installs the ptrace option set the rest of the supervisor relies on
//! (`PTRACE_O_TRACESYSGOOD` so syscall-stops are unambiguous) once that stop
//! is observed; the `TRACE{CLONE,FORK,VFORK}` family is only added when the
//! caller intends to follow children — the kernel auto-attaches them the
//! moment those options are set, and a child the supervisor doesn't add to
//! its tracee map would then sit stopped forever with nobody to resume it.

use std::ffi::CString;

use nix::sys::ptrace;
use nix::unistd::{execvp, fork, ForkResult, Pid};

use crate::error::{Result, TraceError};

pub fn default_options(follow_fork: bool) -> ptrace::Options {
    let mut opts = ptrace::Options::PTRACE_O_TRACESYSGOOD
        | ptrace::Options::PTRACE_O_TRACEEXEC
        | ptrace::Options::PTRACE_O_TRACEEXIT;
    if follow_fork {
        opts |= ptrace::Options::PTRACE_O_TRACECLONE
            | ptrace::Options::PTRACE_O_TRACEFORK
            | ptrace::Options::PTRACE_O_TRACEVFORK
            | ptrace::Options::PTRACE_O_TRACEVFORKDONE;
    }
    opts
}

/// Fork + exec `program` under trace. Returns the child's pid right away;
/// the child is running (or about to take its post-`execve` trap) and is
/// not waited on here.
pub fn spawn(program: &str, args: &[String]) -> Result<Pid> {
    let c_program = CString::new(program).map_err(|_| TraceError::Spawn {
        program: program.to_string(),
        source: nix::Error::EINVAL,
    })?;
    let mut c_args = Vec::with_capacity(args.len() + 1);
    c_args.push(c_program.clone());
    for a in args {
        c_args.push(CString::new(a.as_str()).map_err(|_| TraceError::Spawn {
            program: program.to_string(),
            source: nix::Error::EINVAL,
        })?);
    }

    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            // Errors here can't be reported through our Result type since
            // we're in the child post-fork; best effort is to exit loudly.
            if ptrace::traceme().is_err() {
                std::process::exit(127);
            }
            let _ = execvp(&c_program, &c_args);
            std::process::exit(127);
        }
        Ok(ForkResult::Parent { child }) => Ok(child),
        Err(e) => Err(TraceError::Spawn {
            program: program.to_string(),
            source: e,
        }),
    }
}

/// Attach to an already-running process (`PTRACE_SEIZE`, which installs
/// options without forcing a group-stop the way `PTRACE_ATTACH` would).
pub fn attach(pid: Pid, follow_fork: bool) -> Result<()> {
    ptrace::seize(pid, default_options(follow_fork)).map_err(|e| TraceError::Attach(pid, e))
}

/// Install the standard option set on a tracee that has just taken its
/// `INITIAL_STOP` (§4.7's `INITIAL_STOP → RUNNING` transition).
pub fn install_options(pid: Pid, follow_fork: bool) -> Result<()> {
    ptrace::setoptions(pid, default_options(follow_fork)).map_err(|e| TraceError::Attach(pid, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::{waitpid, WaitStatus};

    #[test]
    fn spawn_true_reaches_initial_stop_and_exits() {
        let pid = spawn("/bin/true", &[]).expect("spawn should succeed");
        let status = waitpid(pid, None).expect("wait for initial stop");
        assert!(matches!(status, WaitStatus::Stopped(_, _)));
        install_options(pid, false).expect("install options");
        ptrace::cont(pid, None).expect("resume after initial stop");
        let status = waitpid(pid, None).expect("wait for exit");
        assert!(matches!(status, WaitStatus::Exited(_, 0)));
    }
}
