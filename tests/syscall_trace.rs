//! Scenario S1 (§8): an inferior that calls `write` and exits produces a
//! strictly alternating enter/exit dispatch on canonical `WRITE`, the exit
//! record carries the byte count, and the tracee map is empty once the
//! supervisor loop returns.

use std::cell::RefCell;
use std::rc::Rc;

use systrace::dispatch::{
    HandlerRegistry, SyscallHandler, SyscallResult, SyscallState, SyscallTraceData,
};
use systrace::inferior;
use systrace::nr::CanonicalSyscallId;
use systrace::supervisor::Supervisor;
use systrace::traced_task::TracedTask;

struct WriteRecorder {
    events: Rc<RefCell<Vec<(SyscallState, i64)>>>,
}

impl SyscallHandler for WriteRecorder {
    fn id(&self) -> CanonicalSyscallId {
        CanonicalSyscallId::Write
    }

    fn on_enter(&self, _sc: &mut SyscallTraceData) -> SyscallResult {
        self.events.borrow_mut().push((SyscallState::OnEnter, 0));
        SyscallResult::Continue
    }

    fn on_exit(&self, sc: &mut SyscallTraceData) -> SyscallResult {
        self.events
            .borrow_mut()
            .push((SyscallState::OnExit, sc.rval));
        SyscallResult::Continue
    }
}

#[test]
fn write_is_traced_enter_then_exit_and_map_drains() {
    let events = Rc::new(RefCell::new(Vec::new()));
    let mut registry = HandlerRegistry::new();
    registry.add_syscall_handler(Rc::new(WriteRecorder {
        events: events.clone(),
    }));
    let registry = Rc::new(registry);
    let dispatcher = systrace::dispatch::SyscallDispatcher::new(registry);

    let pid = inferior::spawn("/bin/echo", &["-n".to_string(), "hi".to_string()])
        .expect("spawn /bin/echo");
    let task = TracedTask::new(pid, false, true, dispatcher, Vec::new(), None);

    let mut supervisor = Supervisor::new();
    supervisor.add(task);
    supervisor.run().expect("supervisor loop should finish cleanly");

    assert!(supervisor.is_empty());

    let recorded = events.borrow();
    assert!(!recorded.is_empty(), "expected at least one write() enter/exit pair");
    for pair in recorded.chunks(2) {
        assert_eq!(pair[0].0, SyscallState::OnEnter);
        if let Some(exit) = pair.get(1) {
            assert_eq!(exit.0, SyscallState::OnExit);
            assert!(exit.1 >= 0, "write() should not fail here");
        }
    }
}
