//! Answers the platform's private syscalls from host-side data.
//!
//! Both queries take a destination buffer in `di` and its length in `si`.
//! The list query follows a two-phase protocol: a null buffer or zero length
//! returns the size (terminator included) without touching guest memory; a
//! real buffer receives at most `si` bytes of the NUL-terminated listing and
//! the call returns how many were copied. A short second-phase buffer gets a
//! truncated prefix, not an error.

use std::path::PathBuf;

use anyhow::Result;
use portator_contracts::{is_private_syscall, PORTATOR_VERSION_STRING, SYS_LIST, SYS_VERSION};
use portator_runner_common::{discover, serialize_listing};

use crate::machine::{GuestMemory, SyscallHook, SyscallRequest};

const SYSCALL_FAILED: i64 = -1;

#[derive(Debug, Clone)]
pub struct SyscallBridge {
    version: String,
    roots: Vec<PathBuf>,
}

impl SyscallBridge {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self::with_version(PORTATOR_VERSION_STRING, roots)
    }

    pub fn with_version(version: impl Into<String>, roots: Vec<PathBuf>) -> Self {
        SyscallBridge {
            version: version.into(),
            roots,
        }
    }

    pub fn dispatch(&self, request: SyscallRequest, memory: &dyn GuestMemory) -> i64 {
        match request.number {
            SYS_VERSION => self.version_query(memory, request.buffer_addr(), request.buffer_len()),
            SYS_LIST => self.list_query(memory, request.buffer_addr(), request.buffer_len()),
            other => {
                tracing::debug!(number = format_args!("{other:#x}"), "unrecognized private syscall");
                SYSCALL_FAILED
            }
        }
    }

    fn version_query(&self, memory: &dyn GuestMemory, addr: u64, len: u64) -> i64 {
        if len == 0 {
            return SYSCALL_FAILED;
        }
        let version = self.version.as_bytes();
        let n = version.len().min(clamp_len(len - 1));
        let mut buf = Vec::with_capacity(n + 1);
        buf.extend_from_slice(&version[..n]);
        buf.push(0);
        match memory.copy_to_guest(addr, &buf) {
            Ok(()) => n as i64,
            Err(fault) => {
                tracing::debug!("version query: {fault}");
                SYSCALL_FAILED
            }
        }
    }

    fn list_query(&self, memory: &dyn GuestMemory, addr: u64, len: u64) -> i64 {
        let mut doc = match self.listing() {
            Ok(doc) => doc,
            Err(err) => {
                tracing::warn!("list query: {err:#}");
                return SYSCALL_FAILED;
            }
        };
        doc.push(0);

        if addr == 0 || len == 0 {
            return doc.len() as i64;
        }

        let n = doc.len().min(clamp_len(len));
        match memory.copy_to_guest(addr, &doc[..n]) {
            Ok(()) => n as i64,
            Err(fault) => {
                tracing::debug!("list query: {fault}");
                SYSCALL_FAILED
            }
        }
    }

    /// Listing document as served to guests, without the terminator.
    pub fn listing(&self) -> Result<Vec<u8>> {
        serialize_listing(&discover(&self.roots))
    }
}

fn clamp_len(len: u64) -> usize {
    usize::try_from(len).unwrap_or(usize::MAX)
}

impl SyscallHook for SyscallBridge {
    fn intercepts(&self, number: u64) -> bool {
        is_private_syscall(number)
    }

    fn dispatch(&self, request: SyscallRequest, memory: &dyn GuestMemory) -> i64 {
        SyscallBridge::dispatch(self, request, memory)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use portator_contracts::{SYS_APP_TYPE, SYS_PRESENT};
    use portator_runner_common::registry::{parse_listing_names, program_executable};

    use super::*;
    use crate::test_support::FlatMemory;

    const BASE: u64 = 0x1000;

    fn install_program(root: &Path, name: &str) {
        let exe = program_executable(root, name);
        std::fs::create_dir_all(exe.parent().unwrap()).unwrap();
        std::fs::write(&exe, b"").unwrap();
    }

    fn req(number: u64, addr: u64, len: u64) -> SyscallRequest {
        SyscallRequest::new(number, [addr, len, 0, 0])
    }

    #[test]
    fn version_fits() {
        let mem = FlatMemory::new(BASE, 64);
        let bridge = SyscallBridge::new(Vec::new());
        let n = bridge.dispatch(req(SYS_VERSION, BASE, 64), &mem);
        assert_eq!(n as usize, PORTATOR_VERSION_STRING.len());
        let written = mem.read(BASE, PORTATOR_VERSION_STRING.len() + 1);
        assert_eq!(&written[..n as usize], PORTATOR_VERSION_STRING.as_bytes());
        assert_eq!(written[n as usize], 0);
    }

    #[test]
    fn version_truncates_to_small_buffer() {
        let mem = FlatMemory::new(BASE, 16);
        let bridge = SyscallBridge::with_version("Portator 9.9.9", Vec::new());
        assert_eq!(bridge.dispatch(req(SYS_VERSION, BASE, 4), &mem), 3);
        assert_eq!(mem.read(BASE, 5), vec![b'P', b'o', b'r', 0, 0xAA]);
    }

    #[test]
    fn version_copy_failures_return_minus_one() {
        let mem = FlatMemory::new(BASE, 8);
        let bridge = SyscallBridge::new(Vec::new());
        assert_eq!(bridge.dispatch(req(SYS_VERSION, 0x10, 64), &mem), -1);
        assert_eq!(bridge.dispatch(req(SYS_VERSION, BASE, 64), &mem), -1);
        assert_eq!(bridge.dispatch(req(SYS_VERSION, BASE, 0), &mem), -1);
    }

    #[test]
    fn list_size_query_matches_copy() {
        let root = tempfile::tempdir().unwrap();
        install_program(root.path(), "snake");
        install_program(root.path(), "list");
        let bridge = SyscallBridge::new(vec![root.path().to_path_buf()]);
        let mem = FlatMemory::new(BASE, 256);

        let need = bridge.dispatch(req(SYS_LIST, 0, 0), &mem);
        assert_eq!(need, bridge.dispatch(req(SYS_LIST, BASE, 0), &mem));
        assert_eq!(mem.read(BASE, 1), vec![0xAA]);

        let copied = bridge.dispatch(req(SYS_LIST, BASE, need as u64 + 10), &mem);
        assert_eq!(copied, need);
        let bytes = mem.read(BASE, copied as usize);
        assert_eq!(bytes.last(), Some(&0));
        assert_eq!(
            parse_listing_names(&bytes).unwrap(),
            vec!["list".to_string(), "snake".to_string()]
        );
    }

    #[test]
    fn list_short_buffer_gets_prefix() {
        let root = tempfile::tempdir().unwrap();
        install_program(root.path(), "snake");
        let bridge = SyscallBridge::new(vec![root.path().to_path_buf()]);
        let mem = FlatMemory::new(BASE, 64);

        assert_eq!(bridge.dispatch(req(SYS_LIST, BASE, 5), &mem), 5);
        assert_eq!(mem.read(BASE, 6), b"{\"app\xAA".to_vec());
    }

    #[test]
    fn list_copy_fault_returns_minus_one() {
        let bridge = SyscallBridge::new(Vec::new());
        let mem = FlatMemory::new(BASE, 4);
        assert_eq!(bridge.dispatch(req(SYS_LIST, BASE, 64), &mem), -1);
        assert_eq!(bridge.dispatch(req(SYS_LIST, 0x10, 64), &mem), -1);
    }

    #[test]
    fn other_private_numbers_are_rejected() {
        let bridge = SyscallBridge::new(Vec::new());
        let mem = FlatMemory::new(BASE, 64);
        assert!(SyscallHook::intercepts(&bridge, SYS_PRESENT));
        assert!(!SyscallHook::intercepts(&bridge, 1));
        assert_eq!(bridge.dispatch(req(SYS_PRESENT, BASE, 64), &mem), -1);
        assert_eq!(bridge.dispatch(req(SYS_APP_TYPE, BASE, 64), &mem), -1);
        assert_eq!(mem.read(BASE, 1), vec![0xAA]);
    }
}
