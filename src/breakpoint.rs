//! Software breakpoint injection used to mark basic-block entries for
//! coverage collection (C3).
//!
//! A breakpoint is injected by backing up the original instruction byte(s)
//! at an address and writing a trap in their place; it is removed by
//! restoring the backup. Hitting one rewinds the tracee's instruction
//! pointer back past the trap before control returns to the caller, so the
//! resumed tracee re-executes the original instruction rather than whatever
//! follows the trap.

use nix::unistd::Pid;

use crate::remote::{Remote, RemotePtr};
use crate::error::Result;

/// Trap encoding, architecture-dependent. x86/x86_64 uses a single `int3`
/// byte; ARM/AArch64 uses a fixed 4-byte undefined instruction. Only the
/// x86_64 variant is constructed anywhere in this crate today; the enum
/// exists so a second architecture is a new variant, not a rewrite.
#[derive(Debug, Clone)]
pub enum BreakpointBackup {
    X86 { original_byte: u8 },
    Arm { original_word: [u8; 4] },
}

impl BreakpointBackup {
    fn trap_bytes(&self) -> &'static [u8] {
        match self {
            BreakpointBackup::X86 { .. } => &[0xcc],
            BreakpointBackup::Arm { .. } => &[0x00, 0x00, 0x20, 0xd4],
        }
    }

    fn original_bytes(&self) -> Vec<u8> {
        match self {
            BreakpointBackup::X86 { original_byte } => vec![*original_byte],
            BreakpointBackup::Arm { original_word } => original_word.to_vec(),
        }
    }
}

/// A single breakpoint at a resolved (post-relocation) address in a tracee's
/// address space.
pub struct Breakpoint {
    addr: RemotePtr<u8>,
    backup: Option<BreakpointBackup>,
    /// If set, the breakpoint removes itself on first hit instead of
    /// re-arming — used for the coverage descriptor's single-shot flag.
    pub single_shot: bool,
}

impl Breakpoint {
    pub fn new(addr: RemotePtr<u8>, single_shot: bool) -> Self {
        Breakpoint {
            addr,
            backup: None,
            single_shot,
        }
    }

    pub fn addr(&self) -> RemotePtr<u8> {
        self.addr
    }

    pub fn is_enabled(&self) -> bool {
        self.backup.is_some()
    }

    /// Back up the original bytes at `addr` and write the trap. Assumes an
    /// x86_64 target; ARM support only needs a different `BreakpointBackup`
    /// constructed here.
    pub fn enable(&mut self, pid: Pid) -> Result<()> {
        if self.backup.is_some() {
            return Ok(());
        }
        let original = pid.peek_bytes(self.addr, 1)?;
        let backup = BreakpointBackup::X86 {
            original_byte: original[0],
        };
        pid.poke_bytes(self.addr, backup.trap_bytes())?;
        self.backup = Some(backup);
        Ok(())
    }

    /// Restore the original bytes, leaving the breakpoint disarmed.
    pub fn disable(&mut self, pid: Pid) -> Result<()> {
        if let Some(backup) = self.backup.take() {
            pid.poke_bytes(self.addr, &backup.original_bytes())?;
        }
        Ok(())
    }

    /// Called once a `SIGTRAP` has been attributed to this breakpoint's
    /// address: rewinds the tracee's instruction pointer past the trap byte
    /// so the original instruction executes on resume, and disarms the
    /// breakpoint for single-shot use or leaves it disabled for the caller
    /// to re-enable once the tracee has stepped past it.
    pub fn handle_hit(&mut self, pid: Pid) -> Result<()> {
        let mut regs = pid.getregs()?;
        regs.rip = self.addr.addr();
        pid.setregs(regs)?;
        self.disable(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trap_bytes_match_architecture() {
        let x86 = BreakpointBackup::X86 { original_byte: 0x90 };
        assert_eq!(x86.trap_bytes(), &[0xcc]);
        assert_eq!(x86.original_bytes(), vec![0x90]);
    }

    #[test]
    fn fresh_breakpoint_is_disabled() {
        let bp = Breakpoint::new(RemotePtr::new(0x4000), false);
        assert!(!bp.is_enabled());
    }
}
