use nix::unistd::Pid;
use thiserror::Error;

/// Error taxonomy for the supervisor, one variant per failure kind named in
/// the error handling design rather than per underlying syscall.
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("tracee {0} vanished (ESRCH)")]
    Vanished(Pid),

    #[error("ptrace/wait failure on {pid}: {source}")]
    Ptrace { pid: Pid, source: nix::Error },

    #[error("protocol violation for {pid}: {detail}")]
    ProtocolViolation { pid: Pid, detail: String },

    #[error("failed to read/write inferior memory at {0:#x}: {1}")]
    MemoryAccess(u64, nix::Error),

    #[error("malformed coverage descriptor: {0}")]
    MalformedDescriptor(String),

    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        source: nix::Error,
    },

    #[error("failed to attach to pid {0}: {1}")]
    Attach(Pid, nix::Error),

    #[error("trace output I/O failure: {0}")]
    TraceOutputIo(#[from] std::io::Error),
}

impl TraceError {
    pub fn is_vanished(&self) -> bool {
        matches!(self, TraceError::Vanished(_))
            || matches!(self, TraceError::Ptrace { source, .. } if *source == nix::Error::ESRCH)
    }
}

pub type Result<T> = std::result::Result<T, TraceError>;

/// Lift a `nix::Error` observed while operating on `pid` into our taxonomy,
/// distinguishing "tracee vanished" from other ptrace failures the way §4.1
/// requires.
pub fn from_nix(pid: Pid, err: nix::Error) -> TraceError {
    if err == nix::Error::ESRCH {
        TraceError::Vanished(pid)
    } else {
        TraceError::Ptrace { pid, source: err }
    }
}

/// Process exit codes, one per fatal error class in §6.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const SPAWN_FAILED: i32 = 1;
    pub const ATTACH_FAILED: i32 = 2;
    pub const MALFORMED_DESCRIPTOR: i32 = 3;
    pub const TRACE_OUTPUT_IO: i32 = 4;
}

pub fn exit_code_for(err: &TraceError) -> i32 {
    match err {
        TraceError::Spawn { .. } => exit_code::SPAWN_FAILED,
        TraceError::Attach(..) => exit_code::ATTACH_FAILED,
        TraceError::MalformedDescriptor(_) => exit_code::MALFORMED_DESCRIPTOR,
        TraceError::TraceOutputIo(_) => exit_code::TRACE_OUTPUT_IO,
        _ => 1,
    }
}
