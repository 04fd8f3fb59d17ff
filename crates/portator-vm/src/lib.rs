//! Guest execution for Portator: the emulator seam, the bridges a guest talks
//! to, and the supervisor that runs each guest in its own process.

mod build;
pub mod machine;
mod native;
pub mod signal_bridge;
pub mod supervisor;
pub mod syscall_bridge;
pub mod xlat;

#[cfg(test)]
mod test_support;

pub use build::{build, extract_shared_files, BuildReport};
pub use machine::{
    Emulator, GuestMemory, HaltReason, LoadSpec, Machine, MachineCaps, MachineOptions,
    MemoryFault, MountSpec, SyscallHook, SyscallRequest,
};
pub use native::{NativeEmulator, NATIVE_EMULATOR_NAME};
pub use signal_bridge::{SignalBridge, SignalDisposition, SignalSource};
pub use supervisor::{
    launch, launch_external, resolve, GuestLaunchRequest, LaunchError, ResolvedProgram,
};
pub use syscall_bridge::SyscallBridge;
