use std::cell::RefCell;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::machine::{
    Emulator, GuestMemory, HaltReason, LoadSpec, Machine, MachineCaps, MachineOptions,
    MemoryFault, SyscallHook,
};

/// Flat guest memory mapped at `base`.
pub struct FlatMemory {
    pub base: u64,
    pub bytes: RefCell<Vec<u8>>,
}

impl FlatMemory {
    pub fn new(base: u64, len: usize) -> Self {
        FlatMemory {
            base,
            bytes: RefCell::new(vec![0xAA; len]),
        }
    }

    pub fn read(&self, addr: u64, len: usize) -> Vec<u8> {
        let off = (addr - self.base) as usize;
        self.bytes.borrow()[off..off + len].to_vec()
    }
}

impl GuestMemory for FlatMemory {
    fn copy_to_guest(&self, addr: u64, bytes: &[u8]) -> Result<(), MemoryFault> {
        let fault = MemoryFault {
            addr,
            len: bytes.len(),
        };
        let mut mem = self.bytes.borrow_mut();
        let off = addr.checked_sub(self.base).ok_or(fault)? as usize;
        let end = off.checked_add(bytes.len()).ok_or(fault)?;
        if end > mem.len() {
            return Err(fault);
        }
        mem[off..end].copy_from_slice(bytes);
        Ok(())
    }
}

/// Machine double that records teardown calls and halts with a fixed reason.
///
/// With a halt point armed, `unwind_to_halt` records the call and unwinds by
/// panicking with the [`HaltReason`] as payload.
pub struct RecordingMachine {
    pub calls: Mutex<Vec<&'static str>>,
    pub jit_region: Range<usize>,
    pub halt: HaltReason,
    pub halt_point: bool,
    pub guest_in_host_group: bool,
}

impl RecordingMachine {
    pub fn new(halt: HaltReason) -> Self {
        RecordingMachine {
            calls: Mutex::new(Vec::new()),
            jit_region: 0x4000..0x5000,
            halt,
            halt_point: false,
            guest_in_host_group: false,
        }
    }

    pub fn with_halt_point(mut self) -> Self {
        self.halt_point = true;
        self
    }

    pub fn sharing_process_group(mut self) -> Self {
        self.guest_in_host_group = true;
        self
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: &'static str) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

impl GuestMemory for RecordingMachine {
    fn copy_to_guest(&self, addr: u64, bytes: &[u8]) -> Result<(), MemoryFault> {
        Err(MemoryFault {
            addr,
            len: bytes.len(),
        })
    }
}

impl Machine for RecordingMachine {
    fn caps(&self) -> MachineCaps {
        MachineCaps {
            supports_mounts: true,
            supports_jit: true,
            guest_in_host_group: self.guest_in_host_group,
        }
    }

    fn set_syscall_hook(&self, _hook: Arc<dyn SyscallHook>) {
        self.record("set_syscall_hook");
    }

    fn load(&self, _spec: &LoadSpec) -> Result<()> {
        self.record("load");
        Ok(())
    }

    fn run(&self) -> Result<HaltReason> {
        self.record("run");
        Ok(self.halt)
    }

    fn enqueue_signal(&self, guest_sig: i32) {
        self.record(match guest_sig {
            2 => "enqueue:2",
            9 => "enqueue:9",
            15 => "enqueue:15",
            _ => "enqueue:other",
        });
    }

    fn is_self_modifying_code_fault(&self, addr: usize) -> bool {
        self.jit_region.contains(&addr)
    }

    fn can_halt(&self) -> bool {
        self.halt_point
    }

    fn unwind_to_halt(&self, reason: HaltReason) -> ! {
        self.record("unwind_to_halt");
        std::panic::panic_any(reason)
    }

    fn kill_other_threads(&self) {
        self.record("kill_other_threads");
    }

    fn disable_jit(&self) {
        self.record("disable_jit");
    }

    fn release(&self) {
        self.record("release");
    }
}

/// Emulator double handing out [`RecordingMachine`]s.
pub struct RecordingEmulator {
    pub halt: HaltReason,
    pub created: AtomicBool,
}

impl RecordingEmulator {
    pub fn new(halt: HaltReason) -> Self {
        RecordingEmulator {
            halt,
            created: AtomicBool::new(false),
        }
    }

    pub fn was_used(&self) -> bool {
        self.created.load(Ordering::SeqCst)
    }
}

impl Emulator for RecordingEmulator {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn create_machine(&self, _opts: &MachineOptions) -> Result<Arc<dyn Machine>> {
        self.created.store(true, Ordering::SeqCst);
        Ok(Arc::new(RecordingMachine::new(self.halt)))
    }
}
