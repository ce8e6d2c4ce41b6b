//! Register and memory access on a stopped inferior (C1), plus the
//! `RemotePtr<T>` address wrapper the rest of the crate passes around instead
//! of raw `u64`s.

use std::marker::PhantomData;

use libc;
use nix::sys::{ptrace, signal, uio};
use nix::unistd::Pid;

use crate::error::{from_nix, Result};

/// A typed pointer into a tracee's address space. Carries no provenance of
/// its own; it exists so call sites read `RemotePtr<u8>` instead of a bare
/// integer that could be confused with a local address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemotePtr<T> {
    addr: u64,
    _marker: PhantomData<T>,
}

impl<T> RemotePtr<T> {
    pub fn new(addr: u64) -> Self {
        RemotePtr {
            addr,
            _marker: PhantomData,
        }
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn offset(&self, by: u64) -> Self {
        RemotePtr::new(self.addr + by)
    }
}

/// Register/memory/control operations the rest of the crate needs against a
/// stopped tracee. Implemented once, on `Pid` directly: ptrace operates on a
/// tid regardless of which in-process object is modeling that tracee.
pub trait Remote {
    fn peek_bytes(&self, addr: RemotePtr<u8>, size: usize) -> Result<Vec<u8>>;
    fn poke_bytes(&self, addr: RemotePtr<u8>, bytes: &[u8]) -> Result<()>;
    fn getregs(&self) -> Result<libc::user_regs_struct>;
    fn setregs(&self, regs: libc::user_regs_struct) -> Result<()>;
    fn resume(&self, sig: Option<signal::Signal>) -> Result<()>;
    fn step(&self, sig: Option<signal::Signal>) -> Result<()>;
    fn resume_syscall(&self, sig: Option<signal::Signal>) -> Result<()>;
    fn getsiginfo(&self) -> Result<libc::siginfo_t>;
    fn getevent(&self) -> Result<i64>;
}

impl Remote for Pid {
    fn peek_bytes(&self, addr: RemotePtr<u8>, size: usize) -> Result<Vec<u8>> {
        let pid = *self;
        if size <= std::mem::size_of::<u64>() {
            let word = ptrace::read(pid, addr.addr() as ptrace::AddressType)
                .map_err(|e| from_nix(pid, e))?;
            let bytes = (word as u64).to_ne_bytes();
            Ok(bytes[..size].to_vec())
        } else {
            let remote_iov = [uio::RemoteIoVec {
                base: addr.addr() as usize,
                len: size,
            }];
            let mut buf = vec![0u8; size];
            let local_iov = [std::io::IoSliceMut::new(&mut buf)];
            uio::process_vm_readv(pid, &local_iov, &remote_iov).map_err(|e| from_nix(pid, e))?;
            Ok(buf)
        }
    }

    fn poke_bytes(&self, addr: RemotePtr<u8>, bytes: &[u8]) -> Result<()> {
        let pid = *self;
        let size = bytes.len();
        if size <= std::mem::size_of::<u64>() {
            // partial word: read-modify-write so we don't clobber the bytes
            // beyond `size` that belong to whatever is adjacent in memory.
            let mut word = if size < std::mem::size_of::<u64>() {
                ptrace::read(pid, addr.addr() as ptrace::AddressType)
                    .map_err(|e| from_nix(pid, e))? as u64
            } else {
                0u64
            };
            let keep_mask: u64 = if size >= 8 { 0 } else { !0u64 << (8 * size) };
            word &= keep_mask;
            for (i, b) in bytes.iter().enumerate() {
                word |= (*b as u64) << (8 * i);
            }
            ptrace::write(
                pid,
                addr.addr() as ptrace::AddressType,
                word as *mut libc::c_void,
            )
            .map_err(|e| from_nix(pid, e))?;
            Ok(())
        } else {
            let remote_iov = [uio::RemoteIoVec {
                base: addr.addr() as usize,
                len: size,
            }];
            let local_iov = [std::io::IoSlice::new(bytes)];
            uio::process_vm_writev(pid, &local_iov, &remote_iov).map_err(|e| from_nix(pid, e))?;
            Ok(())
        }
    }

    fn getregs(&self) -> Result<libc::user_regs_struct> {
        ptrace::getregs(*self).map_err(|e| from_nix(*self, e))
    }

    fn setregs(&self, regs: libc::user_regs_struct) -> Result<()> {
        ptrace::setregs(*self, regs).map_err(|e| from_nix(*self, e))
    }

    fn resume(&self, sig: Option<signal::Signal>) -> Result<()> {
        ptrace::cont(*self, sig).map_err(|e| from_nix(*self, e))
    }

    fn step(&self, sig: Option<signal::Signal>) -> Result<()> {
        ptrace::step(*self, sig).map_err(|e| from_nix(*self, e))
    }

    fn resume_syscall(&self, sig: Option<signal::Signal>) -> Result<()> {
        ptrace::syscall(*self, sig).map_err(|e| from_nix(*self, e))
    }

    fn getsiginfo(&self) -> Result<libc::siginfo_t> {
        ptrace::getsiginfo(*self).map_err(|e| from_nix(*self, e))
    }

    fn getevent(&self) -> Result<i64> {
        ptrace::getevent(*self).map_err(|e| from_nix(*self, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_ptr_offset() {
        let p: RemotePtr<u8> = RemotePtr::new(0x1000);
        assert_eq!(p.offset(0x10).addr(), 0x1010);
    }
}
