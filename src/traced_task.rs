//! Per-tracee lifecycle state machine (C7): decodes the kernel stop kinds
//! the supervisor hands it, drives the syscall dispatcher (C6) on syscall
//! stops, and arms/handles coverage breakpoints (C3/C4) on trap stops.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::rc::Rc;

use log::{debug, trace, warn};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use crate::breakpoint::Breakpoint;
use crate::coverage::{CoverageWriter, Placement};
use crate::dispatch::{SyscallDispatcher, SyscallResult};
use crate::error::Result;
use crate::inferior;
use crate::proc::find_module_base;
use crate::remote::{Remote, RemotePtr};
use crate::task::{RunTask, TaskAction, TaskState};

pub type SharedCoverageWriter = Rc<RefCell<CoverageWriter<BufWriter<File>>>>;

/// A breakpoint the supervisor has successfully armed, plus the module name
/// it belongs to (needed to look up the coverage writer's module id on
/// hit, and to requeue as a fresh placement if the address space is
/// replaced by `execve`).
struct ArmedBreakpoint {
    bp: Breakpoint,
    module: String,
}

pub struct TracedTask {
    pid: Pid,
    state: TaskState,
    follow_fork: bool,
    syscall_trace: bool,
    dispatcher: SyscallDispatcher,
    pending_placements: Vec<Placement>,
    armed: HashMap<u64, ArmedBreakpoint>,
    rearming: Option<u64>,
    module_bases: HashMap<String, u64>,
    coverage_writer: Option<SharedCoverageWriter>,
}

impl TracedTask {
    pub fn new(
        pid: Pid,
        follow_fork: bool,
        syscall_trace: bool,
        dispatcher: SyscallDispatcher,
        pending_placements: Vec<Placement>,
        coverage_writer: Option<SharedCoverageWriter>,
    ) -> Self {
        TracedTask {
            pid,
            state: TaskState::InitialStop,
            follow_fork,
            syscall_trace,
            dispatcher,
            pending_placements,
            armed: HashMap::new(),
            rearming: None,
            module_bases: HashMap::new(),
            coverage_writer,
        }
    }

    /// Build the tracee object for a just-observed fork/vfork/clone child.
    /// It inherits the parent's handler registry (via the dispatcher's own
    /// `fork_child`), placement catalog, and module-base cache, but starts
    /// with no breakpoints armed in its own address space yet.
    pub fn forked(&self, child_pid: Pid) -> Self {
        TracedTask {
            pid: child_pid,
            state: TaskState::InitialStop,
            follow_fork: self.follow_fork,
            syscall_trace: self.syscall_trace,
            dispatcher: self.dispatcher.fork_child(),
            pending_placements: self.pending_placements.clone(),
            armed: HashMap::new(),
            rearming: None,
            module_bases: self.module_bases.clone(),
            coverage_writer: self.coverage_writer.clone(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Drive the state machine through one kernel stop event, per §4.7's
    /// transition table.
    pub fn run(&mut self, status: WaitStatus) -> Result<RunTask> {
        match status {
            WaitStatus::Exited(_, code) => {
                debug!("{} exited with status {}", self.pid, code);
                self.state = TaskState::Exited;
                Ok(RunTask::with(vec![TaskAction::RemoveSelf]))
            }
            WaitStatus::Signaled(_, sig, _) => {
                debug!("{} terminated by signal {:?}", self.pid, sig);
                self.state = TaskState::Exited;
                Ok(RunTask::with(vec![TaskAction::RemoveSelf]))
            }
            WaitStatus::PtraceEvent(_, _, event) => self.on_group_stop(event),
            WaitStatus::PtraceSyscall(_) => self.on_syscall_stop(),
            WaitStatus::Stopped(_, Signal::SIGTRAP) if self.state == TaskState::InitialStop => {
                self.on_initial_stop()
            }
            WaitStatus::Stopped(_, Signal::SIGTRAP) => self.on_trap_stop(),
            WaitStatus::Stopped(_, sig) => self.on_signal_stop(sig),
            WaitStatus::Continued(_) | WaitStatus::StillAlive => Ok(RunTask::none()),
        }
    }

    fn resume_default(&self, sig: Option<Signal>) -> Result<()> {
        if self.syscall_trace {
            self.pid.resume_syscall(sig)
        } else {
            self.pid.resume(sig)
        }
    }

    fn on_initial_stop(&mut self) -> Result<RunTask> {
        inferior::install_options(self.pid, self.follow_fork)?;
        self.state = TaskState::Running;
        self.try_arm_pending()?;
        self.resume_default(None)?;
        Ok(RunTask::none())
    }

    fn on_syscall_stop(&mut self) -> Result<RunTask> {
        match self.state {
            TaskState::Running => {
                let result = self.dispatcher.on_enter(self.pid)?;
                if result == SyscallResult::BlockSyscall {
                    trace!("{}: syscall blocked on enter", self.pid);
                }
                self.state = TaskState::Syscall;
            }
            TaskState::Syscall => {
                self.dispatcher.on_exit(self.pid)?;
                self.state = TaskState::Running;
            }
            other => {
                warn!(
                    "{}: syscall-stop observed in state {:?}, forcing RUNNING",
                    self.pid, other
                );
                self.state = TaskState::Running;
            }
        }
        self.resume_default(None)?;
        Ok(RunTask::none())
    }

    fn on_group_stop(&mut self, event: libc::c_int) -> Result<RunTask> {
        let mut actions = Vec::new();
        match event {
            libc::PTRACE_EVENT_CLONE | libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK => {
                let new_pid = Pid::from_raw(self.pid.getevent()? as i32);
                debug!("{}: new tracee {} (event {})", self.pid, new_pid, event);
                if self.follow_fork {
                    actions.push(TaskAction::AddTracee(new_pid));
                }
            }
            libc::PTRACE_EVENT_EXEC => {
                trace!("{}: exec event, invalidating armed breakpoints", self.pid);
                self.requeue_placements_after_exec();
                self.try_arm_pending()?;
            }
            libc::PTRACE_EVENT_EXIT => {
                trace!("{}: exit event", self.pid);
            }
            other => {
                trace!("{}: ptrace event {}", self.pid, other);
            }
        }
        self.state = TaskState::Running;
        self.pid.resume(None)?;
        Ok(RunTask::with(actions))
    }

    fn on_trap_stop(&mut self) -> Result<RunTask> {
        if let Some(addr) = self.rearming.take() {
            if let Some(armed) = self.armed.get_mut(&addr) {
                armed.bp.enable(self.pid)?;
            }
            self.resume_default(None)?;
            return Ok(RunTask::none());
        }

        let regs = self.pid.getregs()?;
        let candidate = regs.rip.wrapping_sub(1);
        if self.armed.contains_key(&candidate) {
            self.handle_breakpoint_hit(candidate)?;
            return Ok(RunTask::none());
        }

        warn!(
            "{}: unexpected trap stop at {:#x}, resuming",
            self.pid, regs.rip
        );
        self.resume_default(None)?;
        Ok(RunTask::none())
    }

    fn handle_breakpoint_hit(&mut self, addr: u64) -> Result<()> {
        let single_shot = {
            let armed = self.armed.get_mut(&addr).expect("checked by caller");
            armed.bp.handle_hit(self.pid)?;
            armed.bp.single_shot
        };

        if let Some(writer) = &self.coverage_writer {
            let module = &self.armed[&addr].module;
            let mut writer = writer.borrow_mut();
            let module_id = writer.get_module_id(module);
            writer.record_cov(self.pid.as_raw() as u32, module_id, addr)?;
        }

        if single_shot {
            self.resume_default(None)?;
        } else {
            self.pid.step(None)?;
            self.rearming = Some(addr);
        }
        Ok(())
    }

    /// Every placement in the coverage catalog whose module base is already
    /// known (cached locally, or newly resolved via `/proc/<pid>/maps`) is
    /// armed; the rest stay pending for a later call (e.g. after the next
    /// `execve`, when new modules may have been mapped).
    fn try_arm_pending(&mut self) -> Result<()> {
        if self.coverage_writer.is_none() || self.pending_placements.is_empty() {
            return Ok(());
        }
        let placements = std::mem::take(&mut self.pending_placements);
        let mut still_pending = Vec::with_capacity(placements.len());

        for placement in placements {
            let base = match self.module_bases.get(&placement.module).copied() {
                Some(base) => Some(base),
                None => match find_module_base(self.pid, &placement.module) {
                    Ok(Some(base)) => {
                        self.module_bases.insert(placement.module.clone(), base);
                        if let Some(writer) = &self.coverage_writer {
                            writer
                                .borrow_mut()
                                .update_module_base_addr(&placement.module, base)?;
                        }
                        Some(base)
                    }
                    Ok(None) => None,
                    Err(e) => {
                        warn!(
                            "{}: failed resolving base for module {}: {}",
                            self.pid, placement.module, e
                        );
                        None
                    }
                },
            };

            match base {
                Some(base) => {
                    let addr = RemotePtr::new(base + placement.offset);
                    let mut bp = Breakpoint::new(addr, placement.single_shot);
                    match bp.enable(self.pid) {
                        Ok(()) => {
                            self.armed.insert(
                                addr.addr(),
                                ArmedBreakpoint {
                                    bp,
                                    module: placement.module,
                                },
                            );
                        }
                        Err(e) => {
                            warn!(
                                "{}: breakpoint injection failed at {:#x}: {}",
                                self.pid,
                                addr.addr(),
                                e
                            );
                            still_pending.push(placement);
                        }
                    }
                }
                None => still_pending.push(placement),
            }
        }

        self.pending_placements = still_pending;
        Ok(())
    }

    fn requeue_placements_after_exec(&mut self) {
        let mut requeued = Vec::with_capacity(self.armed.len());
        for (addr, armed) in self.armed.drain() {
            if let Some(base) = self.module_bases.get(&armed.module) {
                requeued.push(Placement {
                    module: armed.module,
                    offset: addr - base,
                    single_shot: armed.bp.single_shot,
                });
            }
        }
        self.pending_placements.extend(requeued);
        self.module_bases.clear();
    }

    fn on_signal_stop(&mut self, sig: Signal) -> Result<RunTask> {
        trace!("{}: forwarding signal {:?} on resume", self.pid, sig);
        self.resume_default(Some(sig))?;
        Ok(RunTask::none())
    }
}
