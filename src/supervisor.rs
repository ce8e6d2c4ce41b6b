//! Tracee map and the top-level wait loop (C8).
//!
//! Each iteration peeks at which pid has an event pending via a
//! non-consuming `waitid(P_ALL, WNOWAIT)`, then actually reaps that event
//! with a per-pid `waitpid`. If `waitid` reports a pid this supervisor isn't
//! tracking yet (a race between a fork event and the child's first stop)
//! it falls back to scanning every tracked pid with `waitpid(WNOHANG)`.

use std::collections::HashMap;

use log::{debug, trace, warn};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::error::{from_nix, Result, TraceError};
use crate::task::TaskAction;
use crate::traced_task::TracedTask;

pub struct Supervisor {
    tracees: HashMap<Pid, TracedTask>,
}

impl Supervisor {
    pub fn new() -> Self {
        Supervisor {
            tracees: HashMap::new(),
        }
    }

    pub fn add(&mut self, task: TracedTask) {
        self.tracees.insert(task.pid(), task);
    }

    pub fn is_empty(&self) -> bool {
        self.tracees.is_empty()
    }

    /// Drive every tracked tracee to exit. Returns once the tracee map is
    /// empty.
    pub fn run(&mut self) -> Result<()> {
        while !self.tracees.is_empty() {
            self.step()?;
        }
        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        let (pid, status) = match self.wait_for_event()? {
            Some(event) => event,
            None => return Ok(()),
        };

        let Some(task) = self.tracees.get_mut(&pid) else {
            warn!("event for untracked pid {}, ignoring", pid);
            return Ok(());
        };

        let run_task = task.run(status)?;
        for action in run_task.actions {
            match action {
                TaskAction::AddTracee(child_pid) => {
                    let parent = self.tracees.get(&pid).expect("just matched above");
                    let child = parent.forked(child_pid);
                    debug!("tracking new tracee {}", child_pid);
                    self.tracees.insert(child_pid, child);
                }
                TaskAction::RemoveSelf => {
                    trace!("dropping tracee {}", pid);
                    self.tracees.remove(&pid);
                }
            }
        }
        Ok(())
    }

    /// Peek which pid has an event ready without consuming it, then reap it
    /// with an ordinary `waitpid`. Falls back to a linear per-pid
    /// `WNOHANG` scan if the peeked pid isn't one we're tracking yet.
    fn wait_for_event(&self) -> Result<Option<(Pid, WaitStatus)>> {
        use nix::sys::wait::{Id, WaitPidFlag as F};

        let peeked = nix::sys::wait::waitid(
            Id::All,
            F::WEXITED | F::WSTOPPED | F::WCONTINUED | F::WNOWAIT,
        );

        let peeked_pid = match peeked {
            Ok(nix::sys::wait::WaitStatus::StillAlive) | Err(nix::Error::ECHILD) => None,
            Ok(status) => status.pid(),
            Err(e) => return Err(TraceError::Ptrace {
                pid: Pid::from_raw(0),
                source: e,
            }),
        };

        if let Some(pid) = peeked_pid {
            if self.tracees.contains_key(&pid) {
                let status = waitpid(pid, Some(WaitPidFlag::WNOHANG)).map_err(|e| from_nix(pid, e))?;
                if !matches!(status, WaitStatus::StillAlive) {
                    return Ok(Some((pid, status)));
                }
            }
        }

        for &pid in self.tracees.keys() {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => continue,
                Ok(status) => return Ok(Some((pid, status))),
                Err(nix::Error::ECHILD) => continue,
                Err(e) => return Err(from_nix(pid, e)),
            }
        }
        Ok(None)
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Supervisor::new()
    }
}
