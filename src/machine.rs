//! The machine façade: one CPU plus one memory, the dispatch loop, and
//! the boundary where system calls leave the guest.

use crate::arch::Address;
use crate::cpu::Cpu;
use crate::error::MachineError;
use crate::loader;
use crate::memory::Memory;
use crate::registers::{REG_A0, REG_A1, REG_A2, REG_A3, REG_A7, REG_RA, REG_SP};
use crate::syscall::{self, SyscallHandler};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const DEFAULT_MAX_MEMORY: usize = 64 << 20;
pub const DEFAULT_STACK_SIZE: usize = 1 << 20;

#[derive(Debug, Clone)]
pub struct MachineOptions {
    /// Upper bound on dynamically allocated page bytes (and the arena
    /// span when the arena is enabled).
    pub max_memory: usize,
    /// Initial stack reservation; pages materialise lazily.
    pub stack_size: usize,
    pub argv: Vec<String>,
    pub envp: Vec<String>,
    /// Back the low address range with one flat allocation.
    pub use_memory_arena: bool,
    /// Permit W+X load segments (denied by default).
    pub allow_write_exec_segment: bool,
    /// Decode the compressed extension; fixes decoder-cache granularity
    /// and pc alignment for the machine's lifetime.
    pub compressed_isa: bool,
}

impl Default for MachineOptions {
    fn default() -> Self {
        MachineOptions {
            max_memory: DEFAULT_MAX_MEMORY,
            stack_size: DEFAULT_STACK_SIZE,
            argv: Vec::new(),
            envp: Vec::new(),
            use_memory_arena: true,
            allow_write_exec_segment: false,
            compressed_isa: true,
        }
    }
}

/// Outcome of `run` / `step_one`. A timeout is not an error: the
/// machine stays resumable with a fresh budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// One step completed, machine still running (`step_one` only).
    Ok,
    /// The guest exited or reached the exit sentinel.
    Halted,
    /// The instruction budget ran out.
    Timeout,
    /// The stop flag was set; `run` keeps returning this until the flag
    /// is cleared.
    Stopped,
}

pub struct Machine {
    pub cpu: Cpu,
    pub memory: Memory,

    compressed: bool,
    syscall_handlers: BTreeMap<u64, SyscallHandler>,
    syscall_fallback: SyscallHandler,

    pub(crate) stdout: Box<dyn Write>,
    pub(crate) stderr: Box<dyn Write>,

    stop_flag: Arc<AtomicBool>,
    pub(crate) exited: bool,
    pub(crate) exit_code: u32,
    counter: u64,
}

impl Machine {
    /// Load a RISC-V ELF and build the initial process image. Failures
    /// here are host-side errors and produce no machine.
    pub fn new(elf_bytes: &[u8], options: MachineOptions) -> anyhow::Result<Machine> {
        let mut memory = Memory::new(options.max_memory, options.use_memory_arena);
        let info = loader::load(elf_bytes, &options, &mut memory)?;

        let mut cpu = Cpu::new();
        cpu.pc = info.entry;
        cpu.regs[REG_SP] = info.stack_pointer;
        cpu.regs[REG_RA] = memory.exit_address();
        cpu.regs[REG_A0] = info.argc;
        cpu.regs[REG_A1] = info.argv_ptr;
        cpu.regs[REG_A2] = info.envp_ptr;

        let mut machine = Machine {
            cpu,
            memory,
            compressed: options.compressed_isa,
            syscall_handlers: BTreeMap::new(),
            syscall_fallback: syscall::fallback_enosys,
            stdout: Box::new(std::io::stdout()),
            stderr: Box::new(std::io::stderr()),
            stop_flag: Arc::new(AtomicBool::new(false)),
            exited: false,
            exit_code: 0,
            counter: 0,
        };
        syscall::install_default_handlers(&mut machine);
        log::debug!(
            "machine ready: entry {:#x} sp {:#x} {}",
            machine.cpu.pc,
            machine.cpu.regs[REG_SP],
            machine.memory.usage()
        );
        Ok(machine)
    }

    // ------------------------------------------------------------------
    // dispatch

    fn execute_one(&mut self) -> Result<(), MachineError> {
        let pc = self.cpu.pc;
        let misalign = if self.compressed { 1 } else { 3 };
        if pc & misalign != 0 {
            return Err(MachineError::MisalignedInstruction { pc });
        }
        let segment = self.cpu.find_segment(&self.memory, pc)?;
        let slot = segment
            .slot_at(pc)
            .ok_or(MachineError::ExecutionSpaceProtectionFault { pc })?;
        log::trace!("pc: {:#x}, insn: {:#x}", pc, slot.word);
        (slot.handler)(self, slot.ops)
    }

    /// Drive the dispatch loop for at most `budget` instructions.
    pub fn run(&mut self, budget: u64) -> Result<RunOutcome, MachineError> {
        let mut executed = 0u64;
        while executed < budget {
            if self.stop_flag.load(Ordering::Relaxed) {
                return Ok(RunOutcome::Stopped);
            }
            if self.exited || self.cpu.pc == self.memory.exit_address() {
                self.exited = true;
                return Ok(RunOutcome::Halted);
            }
            self.execute_one()?;
            executed += 1;
            self.counter += 1;
            if self.exited {
                return Ok(RunOutcome::Halted);
            }
        }
        Ok(RunOutcome::Timeout)
    }

    /// Run exactly one instruction.
    pub fn step_one(&mut self) -> Result<RunOutcome, MachineError> {
        if self.stop_flag.load(Ordering::Relaxed) {
            return Ok(RunOutcome::Stopped);
        }
        if self.exited || self.cpu.pc == self.memory.exit_address() {
            self.exited = true;
            return Ok(RunOutcome::Halted);
        }
        self.execute_one()?;
        self.counter += 1;
        if self.exited {
            return Ok(RunOutcome::Halted);
        }
        Ok(RunOutcome::Ok)
    }

    /// Request a stop. Safe to call from another thread through
    /// [`Machine::stop_token`]; the loop observes the flag at the top
    /// of every iteration. Idempotent.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }

    /// Shared handle for stopping a running machine from elsewhere.
    pub fn stop_token(&self) -> Arc<AtomicBool> {
        self.stop_flag.clone()
    }

    /// Clear a previous stop so `run` makes progress again.
    pub fn clear_stop(&self) {
        self.stop_flag.store(false, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // guest call interface

    /// Call a guest function: arguments in a0.., return address at the
    /// exit sentinel, result read back from a0.
    pub fn vmcall(
        &mut self,
        addr: Address,
        args: &[Address],
        budget: u64,
    ) -> Result<Address, MachineError> {
        self.exited = false;
        self.cpu.pc = addr;
        self.cpu.regs[REG_RA] = self.memory.exit_address();
        self.cpu.regs[REG_SP] &= !0xf;
        for (i, &arg) in args.iter().take(8).enumerate() {
            self.cpu.regs[REG_A0 + i] = arg;
        }
        match self.run(budget)? {
            RunOutcome::Timeout => Err(MachineError::MaxInstructionsReached),
            _ => Ok(self.return_value()),
        }
    }

    // ------------------------------------------------------------------
    // syscalls

    /// Install a handler for one syscall number (looked up from a7 at
    /// ECALL time).
    pub fn set_syscall_handler(&mut self, number: u64, handler: SyscallHandler) {
        self.syscall_handlers.insert(number, handler);
    }

    /// Handler for syscall numbers with no installed handler.
    pub fn set_syscall_fallback(&mut self, handler: SyscallHandler) {
        self.syscall_fallback = handler;
    }

    pub(crate) fn dispatch_syscall(&mut self) -> Result<(), MachineError> {
        let number = self.cpu.regs[REG_A7] as u64;
        log::debug!(
            "syscall {} {:#x} {:#x} {:#x} {:#x}",
            number,
            self.cpu.regs[REG_A0],
            self.cpu.regs[REG_A1],
            self.cpu.regs[REG_A2],
            self.cpu.regs[REG_A3],
        );
        let handler = self
            .syscall_handlers
            .get(&number)
            .copied()
            .unwrap_or(self.syscall_fallback);
        handler(self, number)
    }

    /// Mark the guest as exited with `code`; the dispatch loop halts
    /// before the next instruction.
    pub fn set_exited(&mut self, code: u32) {
        self.exited = true;
        self.exit_code = code;
    }

    pub fn has_exited(&self) -> bool {
        self.exited
    }

    pub fn exit_code(&self) -> u32 {
        self.exit_code
    }

    // ------------------------------------------------------------------
    // state accessors

    /// Guest return value (a0).
    pub fn return_value(&self) -> Address {
        self.cpu.regs[REG_A0]
    }

    /// Instructions executed over the machine's lifetime.
    pub fn instruction_counter(&self) -> u64 {
        self.counter
    }

    pub fn regs(&self) -> &[Address; 32] {
        &self.cpu.regs
    }

    pub fn regs_mut(&mut self) -> &mut [Address; 32] {
        &mut self.cpu.regs
    }

    pub fn fp_regs(&self) -> &[u64; 32] {
        &self.cpu.fregs
    }

    pub fn pc(&self) -> Address {
        self.cpu.pc
    }

    pub fn set_stdout(&mut self, writer: Box<dyn Write>) {
        self.stdout = writer;
    }

    pub fn set_stderr(&mut self, writer: Box<dyn Write>) {
        self.stderr = writer;
    }

    // ------------------------------------------------------------------
    // csr file

    pub(crate) fn read_csr(&self, csr: u32) -> Result<Address, MachineError> {
        match csr {
            0x001 => Ok((self.cpu.fcsr & 0x1f) as Address),
            0x002 => Ok(((self.cpu.fcsr >> 5) & 0x7) as Address),
            0x003 => Ok(self.cpu.fcsr as Address),
            // cycle, time and instret all track retired instructions
            0xc00 | 0xc01 | 0xc02 => Ok(self.counter as Address),
            _ => Err(MachineError::IllegalInstruction {
                pc: self.cpu.pc,
                word: csr,
            }),
        }
    }

    pub(crate) fn write_csr(&mut self, csr: u32, value: Address) -> Result<(), MachineError> {
        match csr {
            0x001 => self.cpu.fcsr = (self.cpu.fcsr & !0x1f) | (value as u32 & 0x1f),
            0x002 => self.cpu.fcsr = (self.cpu.fcsr & !0xe0) | ((value as u32 & 0x7) << 5),
            0x003 => self.cpu.fcsr = value as u32 & 0xff,
            _ => {
                return Err(MachineError::IllegalInstruction {
                    pc: self.cpu.pc,
                    word: csr,
                })
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------

    /// Copy-on-write fork: the child shares every page until one side
    /// writes. Execute segments are shared outright (they are sealed).
    /// The parent's guest-visible state is unaffected.
    pub fn fork(&mut self) -> Machine {
        Machine {
            cpu: self.cpu.clone(),
            memory: self.memory.fork(),
            compressed: self.compressed,
            syscall_handlers: self.syscall_handlers.clone(),
            syscall_fallback: self.syscall_fallback,
            stdout: Box::new(std::io::stdout()),
            stderr: Box::new(std::io::stderr()),
            stop_flag: Arc::new(AtomicBool::new(false)),
            exited: self.exited,
            exit_code: self.exit_code,
            counter: self.counter,
        }
    }

    /// Drop all execute segments (and the CPU's cached handles).
    pub fn evict_execute_segments(&mut self) {
        self.memory.evict_execute_segments();
        self.cpu.invalidate_segments();
    }
}

impl std::fmt::Display for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "machine: exited={} exit_code={} steps={} memory={}",
            self.exited,
            self.exit_code,
            self.counter,
            self.memory.usage()
        )?;
        write!(f, "{}", self.cpu)
    }
}
