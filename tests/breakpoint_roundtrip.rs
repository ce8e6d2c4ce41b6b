//! Invariant 6 (§8): `inject(addr); restore(addr, backup)` leaves inferior
//! memory byte-identical. Exercised against a real traced process since
//! both halves go through actual `ptrace` memory access.

use nix::sys::ptrace;
use nix::sys::wait::{waitpid, WaitStatus};

use systrace::breakpoint::Breakpoint;
use systrace::inferior;
use systrace::proc::decode_proc_maps;
use systrace::remote::{Remote, RemotePtr};

#[test]
fn inject_then_restore_is_byte_identical() {
    let pid = inferior::spawn("/bin/true", &[]).expect("spawn /bin/true");
    let status = waitpid(pid, None).expect("initial stop");
    assert!(matches!(status, WaitStatus::Stopped(_, _)));
    inferior::install_options(pid, false).expect("install options");

    let maps = decode_proc_maps(pid).expect("read maps of stopped tracee");
    let text = maps
        .iter()
        .find(|e| e.filename().is_some())
        .expect("at least one file-backed mapping");
    let addr: RemotePtr<u8> = RemotePtr::new(text.base());

    let original = pid.peek_bytes(addr, 1).expect("peek original byte");

    let mut bp = Breakpoint::new(addr, true);
    bp.enable(pid).expect("inject breakpoint");
    let trapped = pid.peek_bytes(addr, 1).expect("peek trapped byte");
    assert_eq!(trapped[0], 0xcc);

    bp.disable(pid).expect("restore breakpoint");
    let restored = pid.peek_bytes(addr, 1).expect("peek restored byte");
    assert_eq!(restored, original);

    ptrace::kill(pid).ok();
    waitpid(pid, None).ok();
}
