//! Guest launch: resolve a program name, fork a guest-hosting child, drive the
//! machine there and report the child's status to the caller.

use std::ffi::{OsStr, OsString};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use portator_contracts::{
    EXIT_FAILURE, EXIT_LAUNCH_FAILED, EXIT_NOT_FOUND, EXIT_SIGNAL_BASE, GUEST_APP_MOUNT,
    GUEST_BUNDLE_MOUNT, GUEST_TMP_DIR,
};
use portator_runner_common::paths::resolve_command;
use portator_runner_common::registry::program_executable;
use portator_runner_common::{is_program_name, LaunchConfig, Origin};

use crate::machine::{
    Emulator, HaltReason, LoadSpec, MachineOptions, MountSpec, GUEST_INHERITED_FDS,
};
use crate::signal_bridge;
use crate::syscall_bridge::SyscallBridge;
use crate::xlat;

/// Local programs may carry guest data under `<name>/zip`.
const LOCAL_DATA_DIR: &str = "zip";

#[derive(Debug, Clone)]
pub struct GuestLaunchRequest {
    pub program_name: String,
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
}

impl GuestLaunchRequest {
    /// Request carrying this process's environment.
    pub fn new(program_name: impl Into<String>, args: Vec<OsString>) -> Self {
        GuestLaunchRequest {
            program_name: program_name.into(),
            args,
            env: std::env::vars_os().collect(),
        }
    }
}

#[derive(Debug)]
pub enum LaunchError {
    NotFound { name: String },
    CommandNotFound { name: OsString },
    SourceNotFound { path: PathBuf },
    Setup(anyhow::Error),
    Fork(std::io::Error),
    Wait(std::io::Error),
}

impl LaunchError {
    pub fn exit_code(&self) -> i32 {
        match self {
            LaunchError::NotFound { .. } | LaunchError::CommandNotFound { .. } => EXIT_NOT_FOUND,
            LaunchError::SourceNotFound { .. }
            | LaunchError::Setup(_)
            | LaunchError::Fork(_)
            | LaunchError::Wait(_) => EXIT_FAILURE,
        }
    }

    pub fn hint(&self) -> Option<String> {
        match self {
            LaunchError::NotFound { name } => Some(format!("Try: portator build {name}")),
            _ => None,
        }
    }
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::NotFound { name } => write!(f, "program not found: {name}"),
            LaunchError::CommandNotFound { name } => {
                write!(f, "command not found: {}", name.to_string_lossy())
            }
            LaunchError::SourceNotFound { path } => {
                write!(f, "source not found: {}", path.display())
            }
            LaunchError::Setup(err) => write!(f, "{err:#}"),
            LaunchError::Fork(err) => write!(f, "fork failed: {err}"),
            LaunchError::Wait(err) => write!(f, "waitpid failed: {err}"),
        }
    }
}

impl std::error::Error for LaunchError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedProgram {
    pub name: String,
    pub executable: PathBuf,
    pub origin: Origin,
    /// Host directory mounted at `/app`.
    pub data_dir: Option<PathBuf>,
}

/// Local `<name>/bin/<name>` first, then the bundled copy.
pub fn resolve(config: &LaunchConfig, name: &str) -> Option<ResolvedProgram> {
    if !is_program_name(name) {
        tracing::debug!(name, "not a program name");
        return None;
    }

    let local = program_executable(&config.local_root, name);
    tracing::debug!(path = %local.display(), "trying local path");
    if local.exists() {
        let data = config.local_root.join(name).join(LOCAL_DATA_DIR);
        return Some(ResolvedProgram {
            name: name.to_string(),
            executable: local,
            origin: Origin::Local,
            data_dir: data.is_dir().then_some(data),
        });
    }

    let apps = config.apps_root()?;
    let bundled = program_executable(&apps, name);
    tracing::debug!(path = %bundled.display(), "trying bundled path");
    if bundled.exists() {
        return Some(ResolvedProgram {
            name: name.to_string(),
            executable: bundled,
            origin: Origin::Bundled,
            data_dir: Some(apps.join(name)),
        });
    }
    None
}

pub fn load_spec(
    config: &LaunchConfig,
    program: &ResolvedProgram,
    request: &GuestLaunchRequest,
) -> LoadSpec {
    let mut argv = Vec::with_capacity(request.args.len() + 1);
    argv.push(OsString::from(&program.name));
    argv.extend(request.args.iter().cloned());

    let mut mounts = Vec::new();
    if let Some(bundle) = &config.bundle_dir {
        mounts.push(MountSpec {
            host_path: bundle.clone(),
            guest_path: PathBuf::from(GUEST_BUNDLE_MOUNT),
            readonly: true,
        });
    }
    if let Some(data) = &program.data_dir {
        mounts.push(MountSpec {
            host_path: data.clone(),
            guest_path: PathBuf::from(GUEST_APP_MOUNT),
            readonly: true,
        });
    }

    LoadSpec {
        executable: program.executable.clone(),
        argv,
        env: request.env.clone(),
        mounts,
        ensure_dirs: vec![PathBuf::from(GUEST_TMP_DIR)],
        inherited_fds: GUEST_INHERITED_FDS,
        rlimit_nofile: host_rlimit_nofile(),
    }
}

fn host_rlimit_nofile() -> Option<(u64, u64)> {
    let mut lim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) } != 0 {
        return None;
    }
    Some((lim.rlim_cur as u64, lim.rlim_max as u64))
}

/// Run `request` in a forked child and return the status to report.
///
/// A name that resolves nowhere fails with [`LaunchError::NotFound`] before
/// anything is forked.
pub fn launch(
    config: &LaunchConfig,
    emulator: &dyn Emulator,
    request: &GuestLaunchRequest,
) -> Result<i32, LaunchError> {
    let program = resolve(config, &request.program_name).ok_or_else(|| LaunchError::NotFound {
        name: request.program_name.clone(),
    })?;
    tracing::debug!(
        name = %program.name,
        origin = %program.origin,
        exe = %program.executable.display(),
        "resolved program"
    );
    let spec = load_spec(config, &program, request);
    launch_resolved(config, emulator, &spec)
}

/// Run a host command (a path, or a name found on `PATH`) under the emulator.
pub fn launch_external(
    config: &LaunchConfig,
    emulator: &dyn Emulator,
    command: &OsStr,
    args: Vec<OsString>,
) -> Result<i32, LaunchError> {
    let executable = resolve_command(command).ok_or_else(|| LaunchError::CommandNotFound {
        name: command.to_os_string(),
    })?;
    tracing::debug!(exe = %executable.display(), "resolved external command");

    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(executable.clone().into_os_string());
    argv.extend(args);
    let spec = LoadSpec {
        executable,
        argv,
        env: std::env::vars_os().collect(),
        mounts: Vec::new(),
        ensure_dirs: vec![PathBuf::from(GUEST_TMP_DIR)],
        inherited_fds: GUEST_INHERITED_FDS,
        rlimit_nofile: host_rlimit_nofile(),
    };
    launch_resolved(config, emulator, &spec)
}

/// Run an already-resolved executable under the emulator in a forked child.
pub fn launch_resolved(
    config: &LaunchConfig,
    emulator: &dyn Emulator,
    spec: &LoadSpec,
) -> Result<i32, LaunchError> {
    let status = run_isolated(|| host_guest(config, emulator, spec))?;
    tracing::info!(exe = %spec.executable.display(), status, "guest finished");
    Ok(status)
}

fn host_guest(config: &LaunchConfig, emulator: &dyn Emulator, spec: &LoadSpec) -> i32 {
    match drive_machine(config, emulator, spec) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("portator: {err:#}");
            EXIT_LAUNCH_FAILED
        }
    }
}

fn drive_machine(config: &LaunchConfig, emulator: &dyn Emulator, spec: &LoadSpec) -> Result<i32> {
    let machine = emulator
        .create_machine(&MachineOptions::from_config(config))
        .with_context(|| format!("create {} machine", emulator.name()))?;
    let bridge = signal_bridge::install(Arc::clone(&machine))?;
    if !machine.caps().supports_mounts {
        for mount in &spec.mounts {
            tracing::debug!(
                host = %mount.host_path.display(),
                guest = %mount.guest_path.display(),
                backend = emulator.name(),
                "mount not supported by backend; skipping"
            );
        }
    }
    machine.set_syscall_hook(Arc::new(SyscallBridge::new(config.search_roots())));

    let halt = match machine
        .load(spec)
        .with_context(|| format!("load {}", spec.executable.display()))
        .and_then(|()| machine.run())
    {
        Ok(halt) => halt,
        Err(err) => {
            bridge.release_after_halt();
            return Err(err);
        }
    };

    match halt {
        HaltReason::Exited(code) => {
            bridge.release_after_halt();
            Ok(code)
        }
        HaltReason::Signaled(guest_sig) => bridge.terminate(xlat::guest_to_host_or_kill(guest_sig)),
        HaltReason::FatalSystemSignal { signal, fault_addr } => {
            eprintln!("portator: fatal signal {signal} at {fault_addr:#x}");
            bridge.terminate(signal)
        }
    }
}

/// Terminal signals the waiting parent leaves to the guest.
const PARENT_IGNORED_SIGNALS: [libc::c_int; 2] = [libc::SIGINT, libc::SIGQUIT];

type SavedDispositions = Vec<(libc::c_int, libc::sigaction)>;

fn ignore_terminal_signals() -> std::io::Result<SavedDispositions> {
    let mut saved = Vec::with_capacity(PARENT_IGNORED_SIGNALS.len());
    for sig in PARENT_IGNORED_SIGNALS {
        let rc = unsafe {
            let mut ignore: libc::sigaction = std::mem::zeroed();
            ignore.sa_sigaction = libc::SIG_IGN;
            libc::sigemptyset(&mut ignore.sa_mask);
            let mut old: libc::sigaction = std::mem::zeroed();
            let rc = libc::sigaction(sig, &ignore, &mut old);
            if rc == 0 {
                saved.push((sig, old));
            }
            rc
        };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            restore_signals(&saved);
            return Err(err);
        }
    }
    Ok(saved)
}

fn restore_signals(saved: &SavedDispositions) {
    for (sig, old) in saved {
        unsafe {
            libc::sigaction(*sig, old, std::ptr::null_mut());
        }
    }
}

/// Fork, run `child` in the new process and exit with its result; the parent
/// waits and maps the child's status.
///
/// While waiting, the parent ignores SIGINT and SIGQUIT so a terminal
/// interrupt is handled by the guest alone; the child starts with the
/// dispositions the caller had.
pub fn run_isolated(child: impl FnOnce() -> i32) -> Result<i32, LaunchError> {
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    let saved = ignore_terminal_signals().map_err(|err| {
        LaunchError::Setup(anyhow::Error::new(err).context("ignore SIGINT/SIGQUIT"))
    })?;

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        let err = std::io::Error::last_os_error();
        restore_signals(&saved);
        return Err(LaunchError::Fork(err));
    }
    if pid == 0 {
        restore_signals(&saved);
        let code = std::panic::catch_unwind(std::panic::AssertUnwindSafe(child))
            .unwrap_or(EXIT_LAUNCH_FAILED);
        let _ = std::io::stdout().flush();
        unsafe { libc::_exit(code) }
    }
    let status = wait_child(pid);
    restore_signals(&saved);
    status
}

fn wait_child(pid: libc::pid_t) -> Result<i32, LaunchError> {
    let mut status = 0;
    loop {
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rc == -1 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(LaunchError::Wait(err));
        }
        break;
    }
    if libc::WIFEXITED(status) {
        return Ok(libc::WEXITSTATUS(status));
    }
    if libc::WIFSIGNALED(status) {
        return Ok(EXIT_SIGNAL_BASE + libc::WTERMSIG(status));
    }
    Ok(EXIT_FAILURE)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use portator_contracts::ENV_BUNDLE_DIR;

    use super::*;
    use crate::test_support::RecordingEmulator;

    fn install_program(root: &Path, name: &str) {
        let exe = program_executable(root, name);
        std::fs::create_dir_all(exe.parent().unwrap()).unwrap();
        std::fs::write(&exe, b"").unwrap();
    }

    fn config(local: &Path, bundle: &Path) -> LaunchConfig {
        let bundle = bundle.to_path_buf();
        LaunchConfig::from_lookup(
            move |k| (k == ENV_BUNDLE_DIR).then(|| bundle.clone().into_os_string()),
            local,
            None,
        )
        .unwrap()
    }

    #[test]
    fn missing_program_spawns_nothing() {
        let local = tempfile::tempdir().unwrap();
        let bundle = tempfile::tempdir().unwrap();
        let cfg = config(local.path(), bundle.path());
        let emulator = RecordingEmulator::new(HaltReason::Exited(0));

        let err = launch(&cfg, &emulator, &GuestLaunchRequest::new("missing", Vec::new()))
            .unwrap_err();
        assert!(matches!(err, LaunchError::NotFound { .. }));
        assert_eq!(err.exit_code(), 127);
        assert_eq!(err.to_string(), "program not found: missing");
        assert!(!emulator.was_used());
    }

    #[test]
    fn unknown_command_is_not_found() {
        let local = tempfile::tempdir().unwrap();
        let bundle = tempfile::tempdir().unwrap();
        let cfg = config(local.path(), bundle.path());
        let emulator = RecordingEmulator::new(HaltReason::Exited(0));

        let err = launch_external(
            &cfg,
            &emulator,
            OsStr::new("definitely-not-a-real-command-xyz"),
            Vec::new(),
        )
        .unwrap_err();
        assert_eq!(err.exit_code(), 127);
        assert!(err.to_string().starts_with("command not found"));
        assert!(!emulator.was_used());
    }

    #[test]
    fn resolution_prefers_local() {
        let local = tempfile::tempdir().unwrap();
        let bundle = tempfile::tempdir().unwrap();
        install_program(local.path(), "foo");
        install_program(&bundle.path().join("apps"), "foo");
        install_program(&bundle.path().join("apps"), "bar");
        let cfg = config(local.path(), bundle.path());

        let foo = resolve(&cfg, "foo").unwrap();
        assert_eq!(foo.origin, Origin::Local);
        assert_eq!(foo.data_dir, None);

        let bar = resolve(&cfg, "bar").unwrap();
        assert_eq!(bar.origin, Origin::Bundled);
        assert_eq!(bar.data_dir, Some(bundle.path().join("apps/bar")));

        assert_eq!(resolve(&cfg, "../foo"), None);
        assert_eq!(resolve(&cfg, "foo/bin"), None);
        assert_eq!(resolve(&cfg, ".foo"), None);
        assert_eq!(resolve(&cfg, "foo/"), None);
        assert_eq!(resolve(&cfg, ""), None);
    }

    #[test]
    fn load_spec_rewrites_argv_and_mounts() {
        let local = tempfile::tempdir().unwrap();
        let bundle = tempfile::tempdir().unwrap();
        install_program(local.path(), "snake");
        std::fs::create_dir_all(local.path().join("snake/zip")).unwrap();
        let cfg = config(local.path(), bundle.path());

        let program = resolve(&cfg, "snake").unwrap();
        let request = GuestLaunchRequest {
            program_name: "snake".to_string(),
            args: vec![OsString::from("--fast")],
            env: Vec::new(),
        };
        let spec = load_spec(&cfg, &program, &request);
        assert_eq!(spec.argv, vec![OsString::from("snake"), OsString::from("--fast")]);
        let guest_paths: Vec<&Path> = spec.mounts.iter().map(|m| m.guest_path.as_path()).collect();
        assert_eq!(guest_paths, vec![Path::new("/zip"), Path::new("/app")]);
        assert_eq!(spec.mounts[1].host_path, local.path().join("snake/zip"));
        assert!(spec.mounts.iter().all(|m| m.readonly));
        assert_eq!(spec.ensure_dirs, vec![PathBuf::from("/tmp")]);
        assert_eq!(spec.inherited_fds, 0..10);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn exit_code_is_propagated() {
        let local = tempfile::tempdir().unwrap();
        let bundle = tempfile::tempdir().unwrap();
        install_program(local.path(), "seven");
        let cfg = config(local.path(), bundle.path());
        let emulator = RecordingEmulator::new(HaltReason::Exited(7));

        let status = launch(&cfg, &emulator, &GuestLaunchRequest::new("seven", Vec::new()))
            .unwrap();
        assert_eq!(status, 7);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn guest_signal_becomes_signal_status() {
        let local = tempfile::tempdir().unwrap();
        let bundle = tempfile::tempdir().unwrap();
        install_program(local.path(), "doomed");
        let cfg = config(local.path(), bundle.path());
        let emulator = RecordingEmulator::new(HaltReason::Signaled(15));

        let status = launch(&cfg, &emulator, &GuestLaunchRequest::new("doomed", Vec::new()))
            .unwrap();
        assert_eq!(status, 128 + libc::SIGTERM);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn isolated_child_status_mapping() {
        assert_eq!(run_isolated(|| 3).unwrap(), 3);
        assert_eq!(run_isolated(|| panic!("boom")).unwrap(), EXIT_LAUNCH_FAILED);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn fatal_halt_becomes_signal_status() {
        let local = tempfile::tempdir().unwrap();
        let bundle = tempfile::tempdir().unwrap();
        install_program(local.path(), "crash");
        let cfg = config(local.path(), bundle.path());
        let emulator = RecordingEmulator::new(HaltReason::FatalSystemSignal {
            signal: libc::SIGSEGV,
            fault_addr: 0x9000,
        });

        let status = launch(&cfg, &emulator, &GuestLaunchRequest::new("crash", Vec::new()))
            .unwrap();
        assert_eq!(status, 128 + libc::SIGSEGV);
    }

    /// Runs `run_isolated` in a fresh process group and sends SIGINT to the
    /// whole group once the child is up. Returns the waiting process's exit
    /// code, or `None` when it was killed.
    #[cfg(target_os = "linux")]
    fn interrupt_group_while_waiting(child_ignores_interrupt: bool) -> Option<i32> {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let pid = unsafe { libc::fork() };
        assert!(pid >= 0);
        if pid == 0 {
            unsafe {
                libc::setpgid(0, 0);
                libc::signal(libc::SIGINT, libc::SIG_DFL);
                libc::close(read_fd);
            }
            let status = run_isolated(move || {
                if child_ignores_interrupt {
                    unsafe {
                        libc::signal(libc::SIGINT, libc::SIG_IGN);
                    }
                }
                unsafe {
                    libc::write(write_fd, b"r".as_ptr().cast(), 1);
                }
                std::thread::sleep(std::time::Duration::from_millis(300));
                5
            });
            unsafe { libc::_exit(status.unwrap_or(EXIT_FAILURE)) }
        }

        unsafe {
            libc::setpgid(pid, pid);
            libc::close(write_fd);
        }
        let mut ready = [0u8; 1];
        assert_eq!(unsafe { libc::read(read_fd, ready.as_mut_ptr().cast(), 1) }, 1);
        unsafe {
            libc::close(read_fd);
        }
        assert_eq!(unsafe { libc::kill(-pid, libc::SIGINT) }, 0);

        let mut status = 0;
        assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);
        libc::WIFEXITED(status).then(|| libc::WEXITSTATUS(status))
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn terminal_interrupt_waits_for_child_status() {
        assert_eq!(interrupt_group_while_waiting(true), Some(5));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn child_starts_with_default_interrupt_handling() {
        assert_eq!(
            interrupt_group_while_waiting(false),
            Some(128 + libc::SIGINT)
        );
    }
}
