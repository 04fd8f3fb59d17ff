//! Native backend: the guest runs as a real process under `ptrace`.
//!
//! Only Linux x86-64 is supported. Ordinary syscalls run on the host kernel;
//! syscalls the hook intercepts are cancelled on entry and their result is
//! written into `rax` on exit. There is no JIT and no in-process halt point,
//! and mounts are not virtualized.

use std::sync::Arc;

use anyhow::Result;

use crate::machine::{Emulator, Machine, MachineOptions};

pub const NATIVE_EMULATOR_NAME: &str = "native";

#[derive(Debug, Clone, Copy, Default)]
pub struct NativeEmulator;

impl Emulator for NativeEmulator {
    fn name(&self) -> &'static str {
        NATIVE_EMULATOR_NAME
    }

    fn create_machine(&self, opts: &MachineOptions) -> Result<Arc<dyn Machine>> {
        create(opts)
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn create(opts: &MachineOptions) -> Result<Arc<dyn Machine>> {
    Ok(Arc::new(traced::TracedMachine::new(opts.clone())))
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn create(_opts: &MachineOptions) -> Result<Arc<dyn Machine>> {
    anyhow::bail!("the native backend requires linux x86-64")
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod traced {
    use std::collections::{BTreeMap, BTreeSet};
    use std::ffi::c_void;
    use std::os::unix::process::CommandExt as _;
    use std::process::Command;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::{Arc, Mutex};

    use anyhow::{Context, Result};
    use libc::pid_t;

    use crate::machine::{
        GuestMemory, HaltReason, LoadSpec, Machine, MachineCaps, MachineOptions, MemoryFault,
        SyscallHook, SyscallRequest,
    };
    use crate::xlat;

    const SYSCALL_STOP: i32 = libc::SIGTRAP | 0x80;

    pub struct TracedMachine {
        opts: MachineOptions,
        pid: AtomicI32,
        hook: Mutex<Option<Arc<dyn SyscallHook>>>,
    }

    impl TracedMachine {
        pub fn new(opts: MachineOptions) -> Self {
            TracedMachine {
                opts,
                pid: AtomicI32::new(0),
                hook: Mutex::new(None),
            }
        }

        fn leader(&self) -> pid_t {
            self.pid.load(Ordering::Acquire)
        }

        fn trace_loop(&self, leader: pid_t, hook: Option<&dyn SyscallHook>) -> Result<HaltReason> {
            // tid -> pending result while stopped inside an intercepted syscall
            let mut in_syscall: BTreeMap<pid_t, Option<i64>> = BTreeMap::new();
            let mut known: BTreeSet<pid_t> = BTreeSet::new();
            known.insert(leader);
            resume(leader, 0)?;

            loop {
                let (tid, status) = wait_any()?;

                if libc::WIFEXITED(status) || libc::WIFSIGNALED(status) {
                    in_syscall.remove(&tid);
                    known.remove(&tid);
                    if tid != leader {
                        continue;
                    }
                    self.pid.store(0, Ordering::Release);
                    if libc::WIFEXITED(status) {
                        return Ok(HaltReason::Exited(libc::WEXITSTATUS(status)));
                    }
                    let sig = libc::WTERMSIG(status);
                    return Ok(HaltReason::Signaled(xlat::host_to_guest(sig).unwrap_or(sig)));
                }

                if !libc::WIFSTOPPED(status) {
                    continue;
                }

                let stop = libc::WSTOPSIG(status);
                let mut inject = 0;
                if stop == SYSCALL_STOP {
                    let entering = !in_syscall.contains_key(&tid);
                    if entering {
                        let pending = self.on_syscall_entry(tid, hook)?;
                        in_syscall.insert(tid, pending);
                    } else if let Some(Some(result)) = in_syscall.remove(&tid) {
                        set_return(tid, result)?;
                    }
                } else if stop == libc::SIGTRAP && (status >> 16) != 0 {
                    // clone/exec event stop
                } else if stop == libc::SIGSTOP && !known.contains(&tid) {
                    known.insert(tid);
                } else {
                    inject = stop;
                }
                resume(tid, inject)?;
            }
        }

        fn on_syscall_entry(
            &self,
            tid: pid_t,
            hook: Option<&dyn SyscallHook>,
        ) -> Result<Option<i64>> {
            let Some(hook) = hook else { return Ok(None) };
            let mut regs = get_regs(tid)?;
            let number = regs.orig_rax;
            if !hook.intercepts(number) {
                return Ok(None);
            }
            let request = SyscallRequest::new(number, [regs.rdi, regs.rsi, regs.rdx, regs.r10]);
            let result = hook.dispatch(request, self);
            regs.orig_rax = u64::MAX;
            set_regs(tid, &regs)?;
            Ok(Some(result))
        }
    }

    impl GuestMemory for TracedMachine {
        fn copy_to_guest(&self, addr: u64, bytes: &[u8]) -> Result<(), MemoryFault> {
            let fault = MemoryFault {
                addr,
                len: bytes.len(),
            };
            let pid = self.leader();
            if pid <= 0 || addr == 0 {
                return Err(fault);
            }
            let local = libc::iovec {
                iov_base: bytes.as_ptr() as *mut c_void,
                iov_len: bytes.len(),
            };
            let remote = libc::iovec {
                iov_base: addr as usize as *mut c_void,
                iov_len: bytes.len(),
            };
            let n = unsafe { libc::process_vm_writev(pid, &local, 1, &remote, 1, 0) };
            if n < 0 || n as usize != bytes.len() {
                return Err(fault);
            }
            Ok(())
        }
    }

    impl Machine for TracedMachine {
        fn caps(&self) -> MachineCaps {
            MachineCaps {
                supports_mounts: false,
                supports_jit: false,
                guest_in_host_group: true,
            }
        }

        fn set_syscall_hook(&self, hook: Arc<dyn SyscallHook>) {
            if let Ok(mut slot) = self.hook.lock() {
                *slot = Some(hook);
            }
        }

        fn load(&self, spec: &LoadSpec) -> Result<()> {
            if self.leader() != 0 {
                anyhow::bail!("machine already has a program loaded");
            }
            if !self.opts.linear_memory {
                tracing::debug!("native backend always uses host memory mapping");
            }
            tracing::debug!(
                overlays = %self.opts.overlays,
                fds = ?spec.inherited_fds,
                "guest runs on the host filesystem and inherits open descriptors"
            );
            for dir in &spec.ensure_dirs {
                if !dir.is_dir() {
                    tracing::warn!(dir = %dir.display(), "guest directory missing on host");
                }
            }

            let (arg0, rest) = spec
                .argv
                .split_first()
                .context("guest argv must include the program name")?;
            let mut cmd = Command::new(&spec.executable);
            cmd.arg0(arg0)
                .args(rest)
                .env_clear()
                .envs(spec.env.iter().map(|(k, v)| (k, v)))
                .current_dir(&self.opts.vfs_prefix);

            let rlimit = spec.rlimit_nofile;
            unsafe {
                cmd.pre_exec(move || {
                    if let Some((cur, max)) = rlimit {
                        let lim = libc::rlimit {
                            rlim_cur: cur as libc::rlim_t,
                            rlim_max: max as libc::rlim_t,
                        };
                        if libc::setrlimit(libc::RLIMIT_NOFILE, &lim) != 0 {
                            return Err(std::io::Error::last_os_error());
                        }
                    }
                    if libc::ptrace(
                        libc::PTRACE_TRACEME,
                        0,
                        std::ptr::null_mut::<c_void>(),
                        std::ptr::null_mut::<c_void>(),
                    ) != 0
                    {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }

            let child = cmd
                .spawn()
                .with_context(|| format!("spawn guest: {}", spec.executable.display()))?;
            let pid = child.id() as pid_t;
            start_tracing(pid)?;

            self.pid.store(pid, Ordering::Release);
            tracing::debug!(pid, exe = %spec.executable.display(), "guest loaded under trace");
            Ok(())
        }

        fn run(&self) -> Result<HaltReason> {
            let leader = self.leader();
            if leader <= 0 {
                anyhow::bail!("no program loaded");
            }
            let hook = self
                .hook
                .lock()
                .map_err(|_| anyhow::anyhow!("syscall hook lock poisoned"))?
                .clone();
            self.trace_loop(leader, hook.as_deref())
        }

        fn enqueue_signal(&self, guest_sig: i32) {
            let pid = self.leader();
            if pid <= 0 {
                return;
            }
            let sig = xlat::guest_to_host_or_kill(guest_sig);
            unsafe {
                libc::kill(pid, sig);
            }
        }

        fn is_self_modifying_code_fault(&self, _addr: usize) -> bool {
            false
        }

        fn can_halt(&self) -> bool {
            false
        }

        fn unwind_to_halt(&self, reason: HaltReason) -> ! {
            self.release();
            let code = match reason {
                HaltReason::Exited(code) => code,
                HaltReason::Signaled(sig) | HaltReason::FatalSystemSignal { signal: sig, .. } => {
                    portator_contracts::EXIT_SIGNAL_BASE + sig
                }
            };
            unsafe { libc::_exit(code) }
        }

        fn kill_other_threads(&self) {
            let pid = self.leader();
            if pid > 0 {
                unsafe {
                    libc::kill(pid, libc::SIGKILL);
                }
            }
        }

        fn disable_jit(&self) {}

        fn release(&self) {
            let pid = self.pid.swap(0, Ordering::AcqRel);
            if pid > 0 {
                discard(pid);
            }
        }
    }

    /// Consume the exec stop of a freshly spawned tracee and set the trace
    /// options. On failure a still-running tracee is killed and reaped.
    pub(super) fn start_tracing(pid: pid_t) -> Result<()> {
        let status = match wait_pid(pid) {
            Ok(status) => status,
            Err(err) => {
                discard(pid);
                return Err(err);
            }
        };
        if libc::WIFEXITED(status) || libc::WIFSIGNALED(status) {
            anyhow::bail!("guest {pid} exited before exec (status {status:#x})");
        }
        if !libc::WIFSTOPPED(status) || libc::WSTOPSIG(status) != libc::SIGTRAP {
            discard(pid);
            anyhow::bail!("guest {pid} did not stop at exec (status {status:#x})");
        }
        let options = libc::PTRACE_O_TRACESYSGOOD
            | libc::PTRACE_O_EXITKILL
            | libc::PTRACE_O_TRACECLONE
            | libc::PTRACE_O_TRACEEXEC;
        if let Err(err) = ptrace_checked(libc::PTRACE_SETOPTIONS, pid, options as usize) {
            discard(pid);
            return Err(err.context("PTRACE_SETOPTIONS"));
        }
        Ok(())
    }

    fn discard(pid: pid_t) {
        unsafe {
            libc::kill(pid, libc::SIGKILL);
            let mut status = 0;
            libc::waitpid(pid, &mut status, libc::__WALL);
        }
    }

    fn ptrace_checked(request: libc::c_uint, pid: pid_t, data: usize) -> Result<()> {
        let rc = unsafe {
            libc::ptrace(
                request,
                pid,
                std::ptr::null_mut::<c_void>(),
                data as *mut c_void,
            )
        };
        if rc == -1 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn resume(tid: pid_t, sig: i32) -> Result<()> {
        match ptrace_checked(libc::PTRACE_SYSCALL, tid, sig as usize) {
            Ok(()) => Ok(()),
            // The tracee died between the stop and the resume; its exit
            // status is collected by the next wait.
            Err(err) if is_esrch(&err) => Ok(()),
            Err(err) => Err(err).with_context(|| format!("PTRACE_SYSCALL({tid})")),
        }
    }

    fn is_esrch(err: &anyhow::Error) -> bool {
        err.downcast_ref::<std::io::Error>()
            .and_then(std::io::Error::raw_os_error)
            == Some(libc::ESRCH)
    }

    fn get_regs(tid: pid_t) -> Result<libc::user_regs_struct> {
        let mut regs: libc::user_regs_struct = unsafe { std::mem::zeroed() };
        ptrace_checked(
            libc::PTRACE_GETREGS,
            tid,
            &mut regs as *mut libc::user_regs_struct as usize,
        )
        .with_context(|| format!("PTRACE_GETREGS({tid})"))?;
        Ok(regs)
    }

    fn set_regs(tid: pid_t, regs: &libc::user_regs_struct) -> Result<()> {
        ptrace_checked(
            libc::PTRACE_SETREGS,
            tid,
            regs as *const libc::user_regs_struct as usize,
        )
        .with_context(|| format!("PTRACE_SETREGS({tid})"))
    }

    fn set_return(tid: pid_t, result: i64) -> Result<()> {
        let mut regs = get_regs(tid)?;
        regs.rax = result as u64;
        set_regs(tid, &regs)
    }

    fn wait_pid(pid: pid_t) -> Result<i32> {
        loop {
            let mut status = 0;
            let rc = unsafe { libc::waitpid(pid, &mut status, libc::__WALL) };
            if rc == -1 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err).with_context(|| format!("waitpid({pid})"));
            }
            return Ok(status);
        }
    }

    fn wait_any() -> Result<(pid_t, i32)> {
        loop {
            let mut status = 0;
            let rc = unsafe { libc::waitpid(-1, &mut status, libc::__WALL) };
            if rc == -1 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err).context("waitpid(-1)");
            }
            return Ok((rc, status));
        }
    }
}
