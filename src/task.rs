//! Shared vocabulary between the per-tracee state machine (C7) and the
//! supervisor loop (C8): lifecycle states and the action list a tracee
//! hands back after processing one event, so the supervisor (the sole owner
//! of the tracee map) can apply additions/removals without the tracee
//! holding a reference back into the map itself.

use nix::unistd::Pid;

/// A tracee's lifecycle state (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    InitialStop,
    Running,
    Syscall,
    Exited,
}

/// What the supervisor should do to its tracee map after a state-machine
/// step. A step can both register a new child and (on the same event, in
/// the fork/vfork/clone case) leave the parent running.
#[derive(Debug, Clone)]
pub enum TaskAction {
    AddTracee(Pid),
    RemoveSelf,
}

/// Result of driving a tracee's state machine through one kernel event.
pub struct RunTask {
    pub actions: Vec<TaskAction>,
}

impl RunTask {
    pub fn none() -> Self {
        RunTask { actions: Vec::new() }
    }

    pub fn with(actions: Vec<TaskAction>) -> Self {
        RunTask { actions }
    }
}
