//! Per-tracee syscall enter/exit dispatch (C6): canonical-id lookup, the
//! cached `SyscallTraceData` half-turn record, and the file/network
//! resource-tracer tables keyed by file descriptor.

use std::collections::HashMap;
use std::rc::Rc;

use libc;
use log::{debug, trace, warn};
use nix::unistd::Pid;

use crate::error::Result;
use crate::nr::{canonicalize, nargs, CanonicalSyscallId};
use crate::remote::{Remote, RemotePtr};

pub const MAX_SYSCALL_ARGS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallState {
    OnEnter,
    OnExit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallResult {
    Continue,
    BlockSyscall,
}

/// Outcome of a resource tracer's filter pass, matching the six-way result
/// the original syscall manager exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceTraceResult {
    TraceOnly,
    TraceAndKeep,
    DoNotTrace,
    BlockSyscall,
    Continue,
    Detach,
}

/// One half-turn of a syscall: latched on enter, finalized on exit, then
/// reset. Exactly one of these exists per tracee at any time.
#[derive(Debug, Clone, Copy)]
pub struct SyscallTraceData {
    pub pid: Pid,
    pub syscall_id: CanonicalSyscallId,
    pub orig_syscall_number: i64,
    pub rval: i64,
    pub nargs: u8,
    pub args: [u64; MAX_SYSCALL_ARGS],
}

impl Default for SyscallTraceData {
    fn default() -> Self {
        SyscallTraceData {
            pid: Pid::from_raw(0),
            syscall_id: CanonicalSyscallId::NoSyscall,
            orig_syscall_number: 0,
            rval: 0,
            nargs: 0,
            args: [0; MAX_SYSCALL_ARGS],
        }
    }
}

impl SyscallTraceData {
    pub fn reset(&mut self) {
        *self = SyscallTraceData::default();
    }

    pub fn is_valid(&self) -> bool {
        self.pid.as_raw() != 0
    }

    /// First argument interpreted as a file descriptor, for the common case
    /// of fd-bound calls (read/write/close/bind/...).
    pub fn first_arg_as_fd(&self) -> Option<i32> {
        if self.nargs >= 1 {
            Some(self.args[0] as i32)
        } else {
            None
        }
    }
}

/// Observe/mutate a single syscall by canonical id.
pub trait SyscallHandler {
    fn id(&self) -> CanonicalSyscallId;

    fn on_enter(&self, _sc: &mut SyscallTraceData) -> SyscallResult {
        SyscallResult::Continue
    }

    fn on_exit(&self, _sc: &mut SyscallTraceData) -> SyscallResult {
        SyscallResult::Continue
    }
}

/// Observe file-lifecycle and file-bound calls. Every method defaults to
/// logging that the callback isn't implemented, mirroring the base class
/// the original syscall manager ships (every virtual logs rather than
/// silently no-opping, so a half-built tracer is visible in the log).
pub trait FileOperationTracer {
    fn on_filter(&self, _sc: &SyscallTraceData) -> bool {
        warn!("FileOperationTracer::on_filter: not implemented");
        false
    }

    fn on_open(&self, _state: SyscallState, _sc: &SyscallTraceData) {
        warn!("FileOperationTracer::on_open: not implemented");
    }

    fn on_close(&self, _state: SyscallState, _sc: &SyscallTraceData) {
        warn!("FileOperationTracer::on_close: not implemented");
    }

    fn on_read(&self, _state: SyscallState, _sc: &SyscallTraceData) {
        warn!("FileOperationTracer::on_read: not implemented");
    }

    fn on_seek(&self, _state: SyscallState, _sc: &SyscallTraceData) {
        warn!("FileOperationTracer::on_seek: not implemented");
    }

    fn on_write(&self, _state: SyscallState, _sc: &SyscallTraceData) {
        warn!("FileOperationTracer::on_write: not implemented");
    }

    fn on_stats(&self, _state: SyscallState, _sc: &SyscallTraceData) {
        warn!("FileOperationTracer::on_stats: not implemented");
    }

    fn on_ioctl(&self, _state: SyscallState, _sc: &SyscallTraceData) {
        warn!("FileOperationTracer::on_ioctl: not implemented");
    }

    fn on_mmap(&self, _state: SyscallState, _sc: &SyscallTraceData) {
        warn!("FileOperationTracer::on_mmap: not implemented");
    }

    fn on_munmap(&self, _state: SyscallState, _sc: &SyscallTraceData) {
        warn!("FileOperationTracer::on_munmap: not implemented");
    }

    fn on_misc(&self, _state: SyscallState, _sc: &SyscallTraceData) {
        warn!("FileOperationTracer::on_misc: not implemented");
    }
}

fn socket_domain_name(domain: i32) -> &'static str {
    match domain {
        libc::AF_INET => "AF_INET",
        libc::AF_INET6 => "AF_INET6",
        libc::AF_UNIX => "AF_UNIX",
        libc::AF_NETLINK => "AF_NETLINK",
        libc::AF_PACKET => "AF_PACKET",
        _ => "Unknown",
    }
}

fn socket_type_name(raw_type: i32) -> &'static str {
    let masked = raw_type & !(libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC);
    match masked {
        libc::SOCK_STREAM => "SOCK_STREAM",
        libc::SOCK_DGRAM => "SOCK_DGRAM",
        libc::SOCK_RAW => "SOCK_RAW",
        libc::SOCK_SEQPACKET => "SOCK_SEQPACKET",
        _ => "Unknown",
    }
}

fn socket_protocol_name(protocol: i32) -> String {
    match protocol {
        0 => "0".to_string(),
        libc::IPPROTO_TCP => "IPPROTO_TCP".to_string(),
        libc::IPPROTO_UDP => "IPPROTO_UDP".to_string(),
        other => other.to_string(),
    }
}

/// Best-effort human-readable rendering of a `sockaddr` read from inferior
/// memory; only inet families are decoded further, matching what the
/// original implementation's `logSockaddrDetails` prints.
fn describe_sockaddr(bytes: &[u8]) -> String {
    if bytes.len() < 2 {
        return "<truncated sockaddr>".to_string();
    }
    let family = u16::from_ne_bytes([bytes[0], bytes[1]]) as i32;
    match family {
        libc::AF_INET if bytes.len() >= 8 => {
            let port = u16::from_be_bytes([bytes[2], bytes[3]]);
            let addr = std::net::Ipv4Addr::new(bytes[4], bytes[5], bytes[6], bytes[7]);
            format!("AF_INET {}:{}", addr, port)
        }
        libc::AF_INET6 => "AF_INET6 <addr elided>".to_string(),
        libc::AF_UNIX => "AF_UNIX".to_string(),
        other => format!("family {}", other),
    }
}

fn read_sockaddr(pid: Pid, addr_arg: u64, len: u64) -> Option<String> {
    if addr_arg == 0 {
        return None;
    }
    let len = len.min(128) as usize;
    pid.peek_bytes(RemotePtr::new(addr_arg), len)
        .ok()
        .map(|bytes| describe_sockaddr(&bytes))
}

/// Observe network-lifecycle and fd-bound network calls. `on_filter` carries
/// real logic (decoding and logging socket/bind/connect/accept calls) the
/// way the original base class does; the per-event callbacks below it
/// default to "not implemented" like `FileOperationTracer`'s.
pub trait NetworkOperationTracer {
    fn on_filter(
        &self,
        pid: Pid,
        state: SyscallState,
        sc: &SyscallTraceData,
    ) -> ResourceTraceResult {
        use CanonicalSyscallId::*;
        match sc.syscall_id {
            Socket => {
                let domain = sc.args[0] as i32;
                let raw_type = sc.args[1] as i32;
                let protocol = sc.args[2] as i32;
                debug!(
                    "new socket: domain={} type={} protocol={} -> fd {}",
                    socket_domain_name(domain),
                    socket_type_name(raw_type),
                    socket_protocol_name(protocol),
                    sc.rval
                );
                ResourceTraceResult::DoNotTrace
            }
            Bind => {
                if let Some(desc) = read_sockaddr(pid, sc.args[1], sc.args[2]) {
                    debug!("bind: {}", desc);
                }
                self.on_bind(state, sc)
            }
            Connect => {
                if let Some(desc) = read_sockaddr(pid, sc.args[1], sc.args[2]) {
                    debug!("connect: {}", desc);
                }
                self.on_connect(state, sc)
            }
            Accept | Accept4 => {
                if let Some(desc) = read_sockaddr(pid, sc.args[1], sc.args[2]) {
                    debug!("accept: {}", desc);
                }
                self.on_accept(state, sc)
            }
            Listen => {
                trace!("listen: fd {}", sc.args[0]);
                self.on_listen(state, sc)
            }
            _ => ResourceTraceResult::DoNotTrace,
        }
    }

    fn on_listen(&self, _state: SyscallState, _sc: &SyscallTraceData) -> ResourceTraceResult {
        debug!("NetworkOperationTracer::on_listen: not implemented");
        ResourceTraceResult::DoNotTrace
    }

    fn on_connect(&self, _state: SyscallState, _sc: &SyscallTraceData) -> ResourceTraceResult {
        debug!("NetworkOperationTracer::on_connect: not implemented");
        ResourceTraceResult::DoNotTrace
    }

    fn on_accept(&self, _state: SyscallState, _sc: &SyscallTraceData) -> ResourceTraceResult {
        debug!("NetworkOperationTracer::on_accept: not implemented");
        ResourceTraceResult::DoNotTrace
    }

    fn on_bind(&self, _state: SyscallState, _sc: &SyscallTraceData) -> ResourceTraceResult {
        debug!("NetworkOperationTracer::on_bind: not implemented");
        ResourceTraceResult::DoNotTrace
    }

    fn on_client_open(&self, _state: SyscallState, _sc: &SyscallTraceData) {
        debug!("NetworkOperationTracer::on_client_open: not implemented");
    }

    fn on_client_closed(&self, _state: SyscallState, _sc: &SyscallTraceData) {
        debug!("NetworkOperationTracer::on_client_closed: not implemented");
    }

    fn on_recv(&self, _state: SyscallState, _sc: &SyscallTraceData) {
        debug!("NetworkOperationTracer::on_recv: not implemented");
    }

    fn on_send(&self, _state: SyscallState, _sc: &SyscallTraceData) {
        debug!("NetworkOperationTracer::on_send: not implemented");
    }

    fn on_ioctl(&self, _state: SyscallState, _sc: &SyscallTraceData) {
        debug!("NetworkOperationTracer::on_ioctl: not implemented");
    }

    fn on_close(&self, _state: SyscallState, _sc: &SyscallTraceData) {
        debug!("NetworkOperationTracer::on_close: not implemented");
    }

    fn on_misc(&self, _state: SyscallState, _sc: &SyscallTraceData) {
        debug!("NetworkOperationTracer::on_misc: not implemented");
    }
}

fn is_file_call(id: CanonicalSyscallId) -> bool {
    use CanonicalSyscallId::*;
    matches!(
        id,
        Open | Openat
            | Close
            | Dup
            | Dup2
            | Dup3
            | Read
            | Pread64
            | Write
            | Pwrite64
            | Ioctl
            | Stat
            | Fstat
            | Lstat
            | Lseek
            | Mmap
            | Munmap
    )
}

fn is_network_call(id: CanonicalSyscallId) -> bool {
    use CanonicalSyscallId::*;
    matches!(
        id,
        Socket
            | Bind
            | Listen
            | Accept
            | Accept4
            | Connect
            | Sendto
            | Recvfrom
            | Sendmsg
            | Recvmsg
            | Shutdown
    )
}

/// Process-wide set of registered observers, built once before `spawn` and
/// shared (via `Rc`) into every tracee's dispatcher, including forked
/// children (§9, open question (c)).
#[derive(Default)]
pub struct HandlerRegistry {
    syscall_handlers: HashMap<CanonicalSyscallId, Vec<Rc<dyn SyscallHandler>>>,
    file_tracers: Vec<Rc<dyn FileOperationTracer>>,
    network_tracers: Vec<Rc<dyn NetworkOperationTracer>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry::default()
    }

    pub fn add_syscall_handler(&mut self, handler: Rc<dyn SyscallHandler>) {
        self.syscall_handlers
            .entry(handler.id())
            .or_insert_with(Vec::new)
            .push(handler);
    }

    pub fn add_file_tracer(&mut self, tracer: Rc<dyn FileOperationTracer>) {
        self.file_tracers.push(tracer);
    }

    pub fn add_network_tracer(&mut self, tracer: Rc<dyn NetworkOperationTracer>) {
        self.network_tracers.push(tracer);
    }
}

/// Per-tracee dispatcher: the cached half-turn record plus this tracee's own
/// fd-bound tracer tables, seeded from the shared registry's pending lists.
pub struct SyscallDispatcher {
    registry: Rc<HandlerRegistry>,
    cached: SyscallTraceData,
    pending_file: Vec<Rc<dyn FileOperationTracer>>,
    active_file: HashMap<i32, Rc<dyn FileOperationTracer>>,
    pending_network: Vec<Rc<dyn NetworkOperationTracer>>,
    active_network: HashMap<i32, Rc<dyn NetworkOperationTracer>>,
}

impl SyscallDispatcher {
    pub fn new(registry: Rc<HandlerRegistry>) -> Self {
        let pending_file = registry.file_tracers.clone();
        let pending_network = registry.network_tracers.clone();
        SyscallDispatcher {
            registry,
            cached: SyscallTraceData::default(),
            pending_file,
            active_file: HashMap::new(),
            pending_network,
            active_network: HashMap::new(),
        }
    }

    /// Forked/cloned children start with the same pending lists as their
    /// parent (handlers are process-wide) but no fd bindings of their own.
    pub fn fork_child(&self) -> Self {
        SyscallDispatcher::new(self.registry.clone())
    }

    pub fn on_enter(&mut self, pid: Pid) -> Result<SyscallResult> {
        let regs = pid.getregs()?;
        let raw_number = regs.orig_rax as i64;
        let id = canonicalize(raw_number);
        let n = (nargs(id) as usize).min(MAX_SYSCALL_ARGS);
        let raw_args = [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9];
        let mut args = [0u64; MAX_SYSCALL_ARGS];
        args[..n].copy_from_slice(&raw_args[..n]);

        self.cached = SyscallTraceData {
            pid,
            syscall_id: id,
            orig_syscall_number: raw_number,
            rval: 0,
            nargs: n as u8,
            args,
        };

        let mut result = SyscallResult::Continue;
        if let Some(handlers) = self.registry.syscall_handlers.get(&id) {
            for handler in handlers {
                if handler.on_enter(&mut self.cached) == SyscallResult::BlockSyscall {
                    result = SyscallResult::BlockSyscall;
                }
            }
        } else {
            trace!("no syscall handler registered for {:?}", id);
        }

        if is_file_call(id) {
            self.dispatch_file(pid, SyscallState::OnEnter);
        }
        if is_network_call(id) {
            self.dispatch_network(pid, SyscallState::OnEnter);
        }

        if result == SyscallResult::BlockSyscall {
            let mut blocked = regs;
            blocked.orig_rax = u64::MAX;
            pid.setregs(blocked)?;
        }
        Ok(result)
    }

    pub fn on_exit(&mut self, pid: Pid) -> Result<()> {
        let regs = pid.getregs()?;
        self.cached.rval = regs.rax as i64;
        let id = self.cached.syscall_id;

        if let Some(handlers) = self.registry.syscall_handlers.get(&id) {
            for handler in handlers {
                handler.on_exit(&mut self.cached);
            }
        }

        if is_file_call(id) {
            self.dispatch_file_exit_binding(id);
            self.dispatch_file(pid, SyscallState::OnExit);
        }
        if is_network_call(id) {
            self.dispatch_network_exit_binding(pid, id);
            self.dispatch_network(pid, SyscallState::OnExit);
        }

        self.cached.reset();
        Ok(())
    }

    fn dispatch_file(&self, _pid: Pid, state: SyscallState) {
        let Some(fd) = self.cached.first_arg_as_fd() else {
            return;
        };
        let Some(tracer) = self.active_file.get(&fd) else {
            return;
        };
        use CanonicalSyscallId::*;
        match self.cached.syscall_id {
            Read | Pread64 => tracer.on_read(state, &self.cached),
            Write | Pwrite64 => tracer.on_write(state, &self.cached),
            Lseek => tracer.on_seek(state, &self.cached),
            Ioctl => tracer.on_ioctl(state, &self.cached),
            Stat | Fstat | Lstat => tracer.on_stats(state, &self.cached),
            Mmap => tracer.on_mmap(state, &self.cached),
            Munmap => tracer.on_munmap(state, &self.cached),
            Close => tracer.on_close(state, &self.cached),
            _ => tracer.on_misc(state, &self.cached),
        }
    }

    /// On exit of an open/openat that succeeded, give pending file tracers a
    /// chance to claim the new fd; on exit of a close, release the binding.
    fn dispatch_file_exit_binding(&mut self, id: CanonicalSyscallId) {
        match id {
            CanonicalSyscallId::Open | CanonicalSyscallId::Openat if self.cached.rval >= 0 => {
                if let Some(pos) = self
                    .pending_file
                    .iter()
                    .position(|t| t.on_filter(&self.cached))
                {
                    let tracer = self.pending_file.remove(pos);
                    tracer.on_open(SyscallState::OnExit, &self.cached);
                    self.active_file.insert(self.cached.rval as i32, tracer);
                }
            }
            CanonicalSyscallId::Close => {
                if let Some(fd) = self.cached.first_arg_as_fd() {
                    self.active_file.remove(&fd);
                }
            }
            _ => {}
        }
    }

    fn dispatch_network(&self, _pid: Pid, state: SyscallState) {
        let Some(fd) = self.cached.first_arg_as_fd() else {
            return;
        };
        let Some(tracer) = self.active_network.get(&fd) else {
            return;
        };
        use CanonicalSyscallId::*;
        match self.cached.syscall_id {
            Recvfrom | Recvmsg => tracer.on_recv(state, &self.cached),
            Sendto | Sendmsg => tracer.on_send(state, &self.cached),
            Shutdown => tracer.on_close(state, &self.cached),
            _ => tracer.on_misc(state, &self.cached),
        }
    }

    /// The fd a network lifecycle call's result should be filed under:
    /// the syscall's own return value for socket/accept, the listening
    /// socket's fd (first argument) for bind/listen/connect.
    fn fd_for_binding(&self, id: CanonicalSyscallId) -> Option<i32> {
        match id {
            CanonicalSyscallId::Socket | CanonicalSyscallId::Accept | CanonicalSyscallId::Accept4 => {
                if self.cached.rval >= 0 {
                    Some(self.cached.rval as i32)
                } else {
                    None
                }
            }
            CanonicalSyscallId::Bind | CanonicalSyscallId::Listen | CanonicalSyscallId::Connect => {
                self.cached.first_arg_as_fd()
            }
            _ => None,
        }
    }

    fn dispatch_network_exit_binding(&mut self, pid: Pid, id: CanonicalSyscallId) {
        if !matches!(
            id,
            CanonicalSyscallId::Socket
                | CanonicalSyscallId::Bind
                | CanonicalSyscallId::Listen
                | CanonicalSyscallId::Accept
                | CanonicalSyscallId::Accept4
                | CanonicalSyscallId::Connect
        ) {
            return;
        }
        let mut claim = None;
        for (i, tracer) in self.pending_network.iter().enumerate() {
            let result = tracer.on_filter(pid, SyscallState::OnExit, &self.cached);
            if result != ResourceTraceResult::DoNotTrace {
                claim = Some((i, result));
                break;
            }
        }
        let Some((i, result)) = claim else {
            return;
        };
        let fd = self.fd_for_binding(id);
        match result {
            ResourceTraceResult::TraceOnly => {
                let tracer = self.pending_network.remove(i);
                if let Some(fd) = fd {
                    self.active_network.insert(fd, tracer);
                }
            }
            ResourceTraceResult::TraceAndKeep => {
                let tracer = self.pending_network[i].clone();
                if let Some(fd) = fd {
                    self.active_network.insert(fd, tracer);
                }
            }
            ResourceTraceResult::Detach => {
                if let Some(fd) = fd {
                    self.active_network.remove(&fd);
                }
            }
            _ => {}
        }
    }

    #[cfg(test)]
    pub fn active_file_fds(&self) -> Vec<i32> {
        self.active_file.keys().copied().collect()
    }

    #[cfg(test)]
    pub fn active_network_fds(&self) -> Vec<i32> {
        let mut fds: Vec<i32> = self.active_network.keys().copied().collect();
        fds.sort();
        fds
    }

    #[cfg(test)]
    pub fn pending_network_len(&self) -> usize {
        self.pending_network.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysKeepThenOnly;

    impl NetworkOperationTracer for AlwaysKeepThenOnly {
        fn on_bind(&self, _state: SyscallState, _sc: &SyscallTraceData) -> ResourceTraceResult {
            ResourceTraceResult::TraceAndKeep
        }

        fn on_accept(&self, _state: SyscallState, _sc: &SyscallTraceData) -> ResourceTraceResult {
            ResourceTraceResult::TraceOnly
        }
    }

    fn sc(id: CanonicalSyscallId, rval: i64, args: [u64; MAX_SYSCALL_ARGS]) -> SyscallTraceData {
        SyscallTraceData {
            pid: Pid::from_raw(1234),
            syscall_id: id,
            orig_syscall_number: 0,
            rval,
            nargs: MAX_SYSCALL_ARGS as u8,
            args,
        }
    }

    #[test]
    fn bind_then_accept_binds_both_fds_and_drains_pending() {
        let mut registry = HandlerRegistry::new();
        registry.add_network_tracer(Rc::new(AlwaysKeepThenOnly));
        let registry = Rc::new(registry);
        let mut dispatcher = SyscallDispatcher::new(registry);

        dispatcher.cached = sc(CanonicalSyscallId::Bind, 0, [5, 0, 0, 0, 0, 0]);
        dispatcher.dispatch_network_exit_binding(Pid::from_raw(1234), CanonicalSyscallId::Bind);

        dispatcher.cached = sc(CanonicalSyscallId::Accept, 9, [5, 0, 0, 0, 0, 0]);
        dispatcher.dispatch_network_exit_binding(Pid::from_raw(1234), CanonicalSyscallId::Accept);

        assert_eq!(dispatcher.active_network_fds(), vec![5, 9]);
        assert_eq!(dispatcher.pending_network_len(), 0);
    }

    #[test]
    fn socket_trace_data_resets_to_invalid() {
        let mut data = sc(CanonicalSyscallId::Write, 2, [1, 0, 2, 0, 0, 0]);
        assert!(data.is_valid());
        data.reset();
        assert!(!data.is_valid());
        assert_eq!(data.syscall_id, CanonicalSyscallId::NoSyscall);
    }
}
