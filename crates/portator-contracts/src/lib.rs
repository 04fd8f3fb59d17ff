//! Shared, version-pinned protocol identifiers.
//!
//! These constants are the single source of truth for numbers and strings that
//! cross the host/guest boundary or appear in machine-readable output.

pub const PORTATOR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Guest-visible platform version string returned by the version syscall.
pub const PORTATOR_VERSION_STRING: &str = concat!("Portator ", env!("CARGO_PKG_VERSION"));

// Private syscall numbers. Arguments arrive in di (argument0) and si (argument1).
pub const SYS_PRIVATE_FIRST: u64 = 0x7000;
pub const SYS_PRIVATE_LAST: u64 = 0x70ff;

pub const SYS_PRESENT: u64 = 0x7000;
pub const SYS_POLL: u64 = 0x7001;
pub const SYS_EXIT: u64 = 0x7002;
pub const SYS_WS_SEND: u64 = 0x7003;
pub const SYS_WS_RECV: u64 = 0x7004;
pub const SYS_APP_TYPE: u64 = 0x7005;
pub const SYS_VERSION: u64 = 0x7006;
pub const SYS_LIST: u64 = 0x7007;

pub fn is_private_syscall(number: u64) -> bool {
    (SYS_PRIVATE_FIRST..=SYS_PRIVATE_LAST).contains(&number)
}

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_INTERNAL_ERROR: i32 = 2;
/// The guest-hosting child could not load or start its program.
pub const EXIT_LAUNCH_FAILED: i32 = 126;
/// Program, template or command not found. No process was spawned.
pub const EXIT_NOT_FOUND: i32 = 127;
/// Signal-terminated children report `EXIT_SIGNAL_BASE + signo`.
pub const EXIT_SIGNAL_BASE: i32 = 128;

pub const ENV_LOG: &str = "PORTATOR_LOG";
pub const ENV_BUNDLE_DIR: &str = "PORTATOR_BUNDLE_DIR";
pub const ENV_OVERLAYS: &str = "PORTATOR_OVERLAYS";
pub const ENV_NOLINEAR: &str = "PORTATOR_NOLINEAR";
pub const ENV_CC: &str = "PORTATOR_CC";

pub const DEFAULT_OVERLAYS: &str = ":o";
pub const DEFAULT_CC: &str = "cosmocc";
pub const DEFAULT_WEB_PORT: u16 = 6711;

/// Guest mount point of the read-only bundle.
pub const GUEST_BUNDLE_MOUNT: &str = "/zip";
/// Guest mount point of the running program's data directory.
pub const GUEST_APP_MOUNT: &str = "/app";
pub const GUEST_TMP_DIR: &str = "/tmp";

/// Filename placeholder replaced by the project name during scaffolding.
pub const TEMPLATE_NAME_PLACEHOLDER: &str = "__NAME__";
