//! Seam between the platform layer and the CPU emulation engine.
//!
//! The engine is an external collaborator. Everything this crate needs from it
//! is expressed by [`Emulator`] (machine factory) and [`Machine`] (one guest
//! instance). A machine is owned by exactly one guest-hosting process.

use std::ffi::OsString;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use portator_runner_common::LaunchConfig;

/// Descriptors passed through to the guest unchanged.
pub const GUEST_INHERITED_FDS: Range<i32> = 0..10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub host_path: PathBuf,
    pub guest_path: PathBuf,
    pub readonly: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineCaps {
    pub supports_mounts: bool,
    pub supports_jit: bool,
    /// The guest is a separate host process in the hosting process's group,
    /// so terminal signals reach it without forwarding.
    pub guest_in_host_group: bool,
}

#[derive(Debug, Clone)]
pub struct MachineOptions {
    /// Overlay list in `:`-separated form. Engines with a virtual filesystem
    /// mount these as the guest root; backends on the host filesystem log and
    /// ignore it.
    pub overlays: String,
    pub vfs_prefix: PathBuf,
    pub linear_memory: bool,
}

impl MachineOptions {
    pub fn from_config(config: &LaunchConfig) -> Self {
        MachineOptions {
            overlays: config.overlays.clone(),
            vfs_prefix: config.vfs_prefix.clone(),
            linear_memory: config.linear_memory,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadSpec {
    pub executable: PathBuf,
    /// Full guest argv; `argv[0]` is the program name the guest sees.
    pub argv: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
    pub mounts: Vec<MountSpec>,
    /// Guest directories created before the program starts. A backend without
    /// its own filesystem only checks that they exist on the host.
    pub ensure_dirs: Vec<PathBuf>,
    /// Host descriptors mapped one-to-one into the guest.
    pub inherited_fds: Range<i32>,
    /// Host `RLIMIT_NOFILE` as `(soft, hard)`.
    pub rlimit_nofile: Option<(u64, u64)>,
}

/// Why [`Machine::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    Exited(i32),
    /// Guest was killed by a signal, in guest numbering.
    Signaled(i32),
    /// A host fault signal unwound the machine to its halt point.
    FatalSystemSignal { signal: i32, fault_addr: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryFault {
    pub addr: u64,
    pub len: usize,
}

impl std::fmt::Display for MemoryFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "guest memory fault writing {} bytes at {:#x}",
            self.len, self.addr
        )
    }
}

impl std::error::Error for MemoryFault {}

/// One decoded private-syscall trap. Not retained past its dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallRequest {
    pub number: u64,
    pub args: [u64; 4],
}

impl SyscallRequest {
    pub fn new(number: u64, args: [u64; 4]) -> Self {
        SyscallRequest { number, args }
    }

    /// Destination buffer address (`di`).
    pub fn buffer_addr(&self) -> u64 {
        self.args[0]
    }

    /// Destination buffer length (`si`).
    pub fn buffer_len(&self) -> u64 {
        self.args[1]
    }
}

pub trait GuestMemory {
    fn copy_to_guest(&self, addr: u64, bytes: &[u8]) -> Result<(), MemoryFault>;
}

/// Receives syscall traps the engine does not implement itself.
pub trait SyscallHook: Send + Sync {
    fn intercepts(&self, number: u64) -> bool;

    fn dispatch(&self, request: SyscallRequest, memory: &dyn GuestMemory) -> i64;
}

/// One emulated guest.
///
/// `enqueue_signal`, `is_self_modifying_code_fault`, `can_halt`,
/// `unwind_to_halt`, `kill_other_threads`, `disable_jit` and `release` are
/// called from host signal handlers and must be async-signal-safe.
pub trait Machine: GuestMemory + Send + Sync {
    fn caps(&self) -> MachineCaps;

    fn set_syscall_hook(&self, hook: Arc<dyn SyscallHook>);

    fn load(&self, spec: &LoadSpec) -> Result<()>;

    fn run(&self) -> Result<HaltReason>;

    /// Deliver `guest_sig` as if the guest process received it.
    fn enqueue_signal(&self, guest_sig: i32);

    /// True when `addr` lies in code the JIT is currently rewriting.
    fn is_self_modifying_code_fault(&self, addr: usize) -> bool;

    /// Whether a halt point is armed for [`Machine::unwind_to_halt`].
    fn can_halt(&self) -> bool;

    /// Transfer control to the armed halt point; `run` then returns `reason`.
    fn unwind_to_halt(&self, reason: HaltReason) -> !;

    fn kill_other_threads(&self);

    /// Disable and shut down the JIT.
    fn disable_jit(&self);

    fn release(&self);
}

pub trait Emulator {
    fn name(&self) -> &'static str;

    fn create_machine(&self, opts: &MachineOptions) -> Result<Arc<dyn Machine>>;
}
