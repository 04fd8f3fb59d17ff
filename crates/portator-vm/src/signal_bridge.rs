//! Host signal handling for a guest-hosting process.
//!
//! One process hosts one machine. [`install`] stores that machine in
//! process-local state and routes host signals through [`SignalBridge`]:
//! control signals are ignored, interactive ones are forwarded into the guest,
//! and synchronous faults either get absorbed (JIT self-modifying code) or tear
//! the machine down and re-raise against this process.
//!
//! Teardown is `Running -> HandlingFault -> Terminated` and runs at most once.
//! Nothing here allocates or logs once a handler is running.

use std::ffi::c_void;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use libc::c_int;
use portator_contracts::EXIT_SIGNAL_BASE;

use crate::machine::{HaltReason, Machine};
use crate::xlat;

/// Sent between emulated threads to interrupt blocking syscalls.
pub const SUSPEND_SIGNAL: c_int = libc::SIGSYS;

pub const FORWARDED_SIGNALS: [c_int; 6] = [
    libc::SIGINT,
    libc::SIGQUIT,
    libc::SIGHUP,
    libc::SIGTERM,
    libc::SIGXCPU,
    libc::SIGXFSZ,
];

pub const FAULT_SIGNALS: [c_int; 4] = [libc::SIGBUS, libc::SIGILL, libc::SIGTRAP, libc::SIGSEGV];

/// Forwarded signals a terminal sends to its whole foreground process group.
const TERMINAL_SIGNALS: [c_int; 3] = [libc::SIGINT, libc::SIGQUIT, libc::SIGHUP];

/// Who raised a signal, from `si_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalSource {
    /// Generated by the kernel, e.g. a terminal interrupt.
    Kernel,
    /// Sent by a process with `kill` or `sigqueue`.
    Process,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalReason {
    SystemSignal { fault_addr: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalDisposition {
    Ignore,
    ForwardToGuest(i32),
    Fatal { signal: c_int, reason: FatalReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BridgeState {
    Running = 0,
    HandlingFault = 1,
    Terminated = 2,
}

impl BridgeState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => BridgeState::Running,
            1 => BridgeState::HandlingFault,
            _ => BridgeState::Terminated,
        }
    }
}

pub struct SignalBridge {
    machine: Arc<dyn Machine>,
    state: AtomicU8,
}

impl SignalBridge {
    pub fn new(machine: Arc<dyn Machine>) -> Self {
        SignalBridge {
            machine,
            state: AtomicU8::new(BridgeState::Running as u8),
        }
    }

    pub fn state(&self) -> BridgeState {
        BridgeState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn classify(
        &self,
        sig: c_int,
        fault_addr: usize,
        source: SignalSource,
    ) -> SignalDisposition {
        if sig == SUSPEND_SIGNAL {
            return SignalDisposition::Ignore;
        }
        if FORWARDED_SIGNALS.contains(&sig) {
            if source == SignalSource::Kernel
                && TERMINAL_SIGNALS.contains(&sig)
                && self.machine.caps().guest_in_host_group
            {
                // The guest got its own copy from the terminal.
                return SignalDisposition::Ignore;
            }
            let guest = xlat::host_to_guest(sig).unwrap_or(xlat::GUEST_SIGKILL);
            return SignalDisposition::ForwardToGuest(guest);
        }
        if FAULT_SIGNALS.contains(&sig) {
            if self.machine.caps().supports_jit
                && self.machine.is_self_modifying_code_fault(fault_addr)
            {
                return SignalDisposition::Ignore;
            }
            return SignalDisposition::Fatal {
                signal: sig,
                reason: FatalReason::SystemSignal { fault_addr },
            };
        }
        SignalDisposition::Ignore
    }

    /// Handler body. Returns only for ignored and forwarded signals.
    pub fn handle(&self, sig: c_int, fault_addr: usize, source: SignalSource) {
        match self.classify(sig, fault_addr, source) {
            SignalDisposition::Ignore => {}
            SignalDisposition::ForwardToGuest(guest_sig) => self.machine.enqueue_signal(guest_sig),
            SignalDisposition::Fatal {
                signal,
                reason: FatalReason::SystemSignal { fault_addr },
            } => self.on_fatal(signal, fault_addr),
        }
    }

    fn on_fatal(&self, sig: c_int, fault_addr: usize) {
        let entered = self
            .state
            .compare_exchange(
                BridgeState::Running as u8,
                BridgeState::HandlingFault as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !entered {
            // Faulted again while tearing down.
            exit_for_signal(sig);
        }
        if self.machine.can_halt() {
            self.machine
                .unwind_to_halt(HaltReason::FatalSystemSignal {
                    signal: sig,
                    fault_addr,
                });
        }
        self.terminate(sig);
    }

    fn begin_teardown(&self) -> bool {
        self.state
            .swap(BridgeState::Terminated as u8, Ordering::AcqRel)
            != BridgeState::Terminated as u8
    }

    /// Stop auxiliary threads, shut the JIT down and free the machine.
    /// Returns false when a teardown already happened.
    pub fn teardown(&self) -> bool {
        if !self.begin_teardown() {
            return false;
        }
        self.machine.kill_other_threads();
        self.machine.disable_jit();
        self.machine.release();
        true
    }

    /// Free the machine after a normal halt. Shares the once-guard with
    /// [`SignalBridge::teardown`].
    pub fn release_after_halt(&self) -> bool {
        if !self.begin_teardown() {
            return false;
        }
        self.machine.release();
        true
    }

    /// Tear down, then die from `sig` so the parent observes a
    /// signal-terminated status.
    pub fn terminate(&self, sig: c_int) -> ! {
        if self.teardown() {
            reraise(sig);
        }
        exit_for_signal(sig)
    }
}

fn reraise(sig: c_int) {
    unsafe {
        if sig != libc::SIGKILL && sig != libc::SIGSTOP {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = libc::SIG_DFL;
            libc::sigemptyset(&mut sa.sa_mask);
            libc::sigaction(sig, &sa, std::ptr::null_mut());
        }
        let mut unblock: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut unblock);
        libc::sigaddset(&mut unblock, sig);
        libc::sigprocmask(libc::SIG_UNBLOCK, &unblock, std::ptr::null_mut());
        libc::kill(libc::getpid(), sig);
    }
}

fn exit_for_signal(sig: c_int) -> ! {
    unsafe { libc::_exit(EXIT_SIGNAL_BASE + sig) }
}

static BRIDGE: OnceLock<SignalBridge> = OnceLock::new();

type SigInfoHandler = extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void);

/// Install host handlers for `machine`. Valid once per process.
pub fn install(machine: Arc<dyn Machine>) -> Result<&'static SignalBridge> {
    if BRIDGE.set(SignalBridge::new(machine)).is_err() {
        anyhow::bail!("signal bridge already installed in this process");
    }
    let bridge = BRIDGE.get().context("signal bridge state")?;

    unsafe {
        if libc::signal(libc::SIGPIPE, libc::SIG_IGN) == libc::SIG_ERR {
            return Err(std::io::Error::last_os_error()).context("ignore SIGPIPE");
        }
    }
    set_handler(SUSPEND_SIGNAL, on_suspend_signal, libc::SA_SIGINFO)?;
    for sig in FORWARDED_SIGNALS {
        set_handler(sig, on_host_signal, libc::SA_SIGINFO | libc::SA_RESTART)?;
    }
    for sig in FAULT_SIGNALS {
        set_handler(sig, on_host_signal, libc::SA_SIGINFO | libc::SA_NODEFER)?;
    }
    Ok(bridge)
}

fn set_handler(sig: c_int, handler: SigInfoHandler, flags: c_int) -> Result<()> {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handler as libc::sighandler_t;
        sa.sa_flags = flags;
        libc::sigfillset(&mut sa.sa_mask);
        if libc::sigaction(sig, &sa, std::ptr::null_mut()) != 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("sigaction({sig})"));
        }
    }
    Ok(())
}

extern "C" fn on_suspend_signal(_sig: c_int, _info: *mut libc::siginfo_t, _ctx: *mut c_void) {}

extern "C" fn on_host_signal(sig: c_int, info: *mut libc::siginfo_t, _ctx: *mut c_void) {
    if let Some(bridge) = BRIDGE.get() {
        bridge.handle(sig, fault_addr(info), signal_source(info));
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const SI_KERNEL: c_int = 0x80;

fn signal_source(info: *const libc::siginfo_t) -> SignalSource {
    if info.is_null() {
        return SignalSource::Process;
    }
    #[cfg(any(target_os = "linux", target_os = "android"))]
    if unsafe { (*info).si_code } == SI_KERNEL {
        return SignalSource::Kernel;
    }
    SignalSource::Process
}

fn fault_addr(info: *const libc::siginfo_t) -> usize {
    if info.is_null() {
        return 0;
    }
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let addr = unsafe { (*info).si_addr() as usize };
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let addr = unsafe { (*info).si_addr as usize };
    addr
}
