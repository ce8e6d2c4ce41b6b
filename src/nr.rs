//! Canonical syscall identity (C2).
//!
//! `CanonicalSyscallId` is the cross-architecture identifier the rest of the
//! supervisor dispatches on; `raw_number` stays around only long enough to be
//! logged and latched into a `SyscallTraceData`. Only the x86_64 table is
//! shipped; a second architecture is a new `canonicalize`-style function and
//! table, not new branching logic (see SPEC_FULL.md §9).

use libc;

/// A closed, cross-architecture syscall identifier plus the `NO_SYSCALL`
/// sentinel for raw numbers this table doesn't recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CanonicalSyscallId {
    NoSyscall,

    Read,
    Write,
    Open,
    Openat,
    Close,
    Dup,
    Dup2,
    Dup3,
    Stat,
    Fstat,
    Lstat,
    Lseek,
    Mmap,
    Munmap,
    Mprotect,
    Ioctl,
    Pread64,
    Pwrite64,

    Socket,
    Bind,
    Listen,
    Accept,
    Accept4,
    Connect,
    Sendto,
    Recvfrom,
    Sendmsg,
    Recvmsg,
    Shutdown,
    Getsockopt,
    Setsockopt,

    Clone,
    Fork,
    Vfork,
    Execve,
    Exit,
    ExitGroup,
    Wait4,
    Kill,

    Brk,
    Rt_sigaction,
    Rt_sigprocmask,
    Rt_sigreturn,
    Access,
    Pipe,
    Pipe2,
    Select,
    Nanosleep,
    Getpid,
    Getppid,
    Gettid,
    Unlink,
    Unlinkat,
    Mkdir,
    Rmdir,
    Rename,
    Fcntl,
    Fsync,
    Ftruncate,
    Getdents64,
    Readlink,
    Futex,
    SetRobustList,
    GetRobustList,
    SchedYield,
    ArchPrctl,
    SetTidAddress,
    ExitRestartSyscall,
}

/// Raw x86_64 syscall number → canonical id. Built as a flat match so a
/// number that has no canonical id falls through to `NoSyscall` rather than
/// panicking — unsupported-but-legitimate syscalls are common and are not a
/// protocol violation (SPEC_FULL.md §9, open question (d)).
pub fn canonicalize(raw_number: i64) -> CanonicalSyscallId {
    use CanonicalSyscallId::*;
    match raw_number {
        libc::SYS_read => Read,
        libc::SYS_write => Write,
        libc::SYS_open => Open,
        libc::SYS_openat => Openat,
        libc::SYS_close => Close,
        libc::SYS_dup => Dup,
        libc::SYS_dup2 => Dup2,
        libc::SYS_dup3 => Dup3,
        libc::SYS_stat => Stat,
        libc::SYS_fstat => Fstat,
        libc::SYS_lstat => Lstat,
        libc::SYS_lseek => Lseek,
        libc::SYS_mmap => Mmap,
        libc::SYS_munmap => Munmap,
        libc::SYS_mprotect => Mprotect,
        libc::SYS_ioctl => Ioctl,
        libc::SYS_pread64 => Pread64,
        libc::SYS_pwrite64 => Pwrite64,

        libc::SYS_socket => Socket,
        libc::SYS_bind => Bind,
        libc::SYS_listen => Listen,
        libc::SYS_accept => Accept,
        libc::SYS_accept4 => Accept4,
        libc::SYS_connect => Connect,
        libc::SYS_sendto => Sendto,
        libc::SYS_recvfrom => Recvfrom,
        libc::SYS_sendmsg => Sendmsg,
        libc::SYS_recvmsg => Recvmsg,
        libc::SYS_shutdown => Shutdown,
        libc::SYS_getsockopt => Getsockopt,
        libc::SYS_setsockopt => Setsockopt,

        libc::SYS_clone => Clone,
        libc::SYS_fork => Fork,
        libc::SYS_vfork => Vfork,
        libc::SYS_execve => Execve,
        libc::SYS_exit => Exit,
        libc::SYS_exit_group => ExitGroup,
        libc::SYS_wait4 => Wait4,
        libc::SYS_kill => Kill,

        libc::SYS_brk => Brk,
        libc::SYS_rt_sigaction => Rt_sigaction,
        libc::SYS_rt_sigprocmask => Rt_sigprocmask,
        libc::SYS_rt_sigreturn => Rt_sigreturn,
        libc::SYS_access => Access,
        libc::SYS_pipe => Pipe,
        libc::SYS_pipe2 => Pipe2,
        libc::SYS_select => Select,
        libc::SYS_nanosleep => Nanosleep,
        libc::SYS_getpid => Getpid,
        libc::SYS_getppid => Getppid,
        libc::SYS_gettid => Gettid,
        libc::SYS_unlink => Unlink,
        libc::SYS_unlinkat => Unlinkat,
        libc::SYS_mkdir => Mkdir,
        libc::SYS_rmdir => Rmdir,
        libc::SYS_rename => Rename,
        libc::SYS_fcntl => Fcntl,
        libc::SYS_fsync => Fsync,
        libc::SYS_ftruncate => Ftruncate,
        libc::SYS_getdents64 => Getdents64,
        libc::SYS_readlink => Readlink,
        libc::SYS_futex => Futex,
        libc::SYS_set_robust_list => SetRobustList,
        libc::SYS_get_robust_list => GetRobustList,
        libc::SYS_sched_yield => SchedYield,
        libc::SYS_arch_prctl => ArchPrctl,
        libc::SYS_set_tid_address => SetTidAddress,
        libc::SYS_restart_syscall => ExitRestartSyscall,

        _ => NoSyscall,
    }
}

/// Argument count per canonical id, used to decide how many argument
/// registers C6 latches on syscall enter. Syscalls not given an explicit
/// arm here (and `NoSyscall`) default to the architecture max, since
/// over-reading unused argument registers is harmless.
pub fn nargs(id: CanonicalSyscallId) -> u8 {
    use CanonicalSyscallId::*;
    match id {
        NoSyscall => 0,
        Read | Write | Pread64 | Pwrite64 => 4,
        Open => 3,
        Openat => 4,
        Close | Fsync | SchedYield | Gettid | Getpid | Getppid | ExitRestartSyscall => 1,
        Dup => 1,
        Dup2 | Dup3 => 2,
        Stat | Lstat | Access | Readlink | Unlink | Rmdir | Mkdir => 2,
        Fstat => 2,
        Lseek => 3,
        Mmap => 6,
        Munmap => 2,
        Mprotect => 3,
        Ioctl => 3,
        Socket => 3,
        Bind | Listen | Connect => 3,
        Accept => 3,
        Accept4 => 4,
        Sendto | Recvfrom => 6,
        Sendmsg | Recvmsg => 3,
        Shutdown => 2,
        Getsockopt | Setsockopt => 5,
        Clone => 5,
        Fork | Vfork => 0,
        Execve => 3,
        Exit | ExitGroup => 1,
        Wait4 => 4,
        Kill => 2,
        Brk => 1,
        Rt_sigaction => 4,
        Rt_sigprocmask => 4,
        Rt_sigreturn => 0,
        Pipe => 1,
        Pipe2 => 2,
        Select => 5,
        Nanosleep => 2,
        Unlinkat => 3,
        Rename => 2,
        Fcntl => 3,
        Ftruncate => 2,
        Getdents64 => 3,
        Futex => 6,
        SetRobustList | GetRobustList => 2,
        ArchPrctl => 2,
        SetTidAddress => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_known_numbers() {
        assert_eq!(canonicalize(libc::SYS_write), CanonicalSyscallId::Write);
        assert_eq!(canonicalize(libc::SYS_openat), CanonicalSyscallId::Openat);
        assert_eq!(canonicalize(libc::SYS_socket), CanonicalSyscallId::Socket);
    }

    #[test]
    fn unknown_number_is_no_syscall() {
        assert_eq!(canonicalize(-1), CanonicalSyscallId::NoSyscall);
        assert_eq!(canonicalize(9999), CanonicalSyscallId::NoSyscall);
    }

    #[test]
    fn nargs_is_bounded() {
        for id in [
            CanonicalSyscallId::Write,
            CanonicalSyscallId::Mmap,
            CanonicalSyscallId::Socket,
            CanonicalSyscallId::NoSyscall,
        ] {
            assert!(nargs(id) <= 6);
        }
    }
}
