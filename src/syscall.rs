//! Default system-call layer.
//!
//! Linux RISC-V numbers, dispatched on a7. The defaults cover what a
//! static newlib/musl guest needs to print and exit; hosts override or
//! extend the table per machine. Unknown numbers go to the fallback,
//! which by default returns -ENOSYS rather than faulting.

use crate::arch::Address;
use crate::error::MachineError;
use crate::machine::Machine;
use crate::registers::{REG_A0, REG_A1, REG_A2};

pub const SYS_FCNTL: u64 = 25;
pub const SYS_WRITE: u64 = 64;
pub const SYS_EXIT: u64 = 93;
pub const SYS_EXIT_GROUP: u64 = 94;
pub const SYS_BRK: u64 = 214;
pub const SYS_MUNMAP: u64 = 215;
pub const SYS_MMAP: u64 = 222;

const EBADF: i64 = 9;
const ENOSYS: i64 = 38;

pub type SyscallHandler = fn(&mut Machine, u64) -> Result<(), MachineError>;

pub(crate) fn install_default_handlers(machine: &mut Machine) {
    machine.set_syscall_handler(SYS_WRITE, sys_write);
    machine.set_syscall_handler(SYS_EXIT, sys_exit);
    machine.set_syscall_handler(SYS_EXIT_GROUP, sys_exit);
    machine.set_syscall_handler(SYS_BRK, sys_brk);
    machine.set_syscall_handler(SYS_MMAP, sys_mmap);
    machine.set_syscall_handler(SYS_MUNMAP, sys_munmap);
    machine.set_syscall_handler(SYS_FCNTL, sys_fcntl);
}

fn ret(machine: &mut Machine, value: Address) {
    machine.cpu.regs[REG_A0] = value;
}

fn ret_err(machine: &mut Machine, errno: i64) {
    machine.cpu.regs[REG_A0] = (-errno) as Address;
}

/// The default fallback: report -ENOSYS and keep running.
pub fn fallback_enosys(machine: &mut Machine, number: u64) -> Result<(), MachineError> {
    log::warn!("unhandled syscall {}", number);
    ret_err(machine, ENOSYS);
    Ok(())
}

/// Strict fallback for hosts that want unknown syscalls to fault.
pub fn fallback_error(_machine: &mut Machine, number: u64) -> Result<(), MachineError> {
    Err(MachineError::UnhandledSyscall { number })
}

fn sys_exit(machine: &mut Machine, _number: u64) -> Result<(), MachineError> {
    let code = machine.cpu.regs[REG_A0] as u32;
    log::debug!("guest exit with status {}", code);
    machine.set_exited(code);
    Ok(())
}

fn sys_write(machine: &mut Machine, number: u64) -> Result<(), MachineError> {
    let fd = machine.cpu.regs[REG_A0];
    let addr = machine.cpu.regs[REG_A1];
    // bound one write so a hostile guest cannot force a huge host
    // allocation
    let len = (machine.cpu.regs[REG_A2] as usize).min(1 << 24);
    log::trace!("write fd {} addr {:#x} len {:#x}", fd, addr, len);
    match fd {
        1 | 2 => {
            let mut data = vec![0u8; len];
            if machine.memory.memcpy_out(&mut data, addr).is_err() {
                log::warn!("write source range {:#x}+{:#x} unreadable", addr, len);
                ret_err(machine, EBADF);
                return Ok(());
            }
            let writer = if fd == 1 {
                machine.stdout.as_mut()
            } else {
                machine.stderr.as_mut()
            };
            if writer.write_all(&data).is_err() {
                return Err(MachineError::SystemCallFailed { number });
            }
            ret(machine, len as Address);
        }
        _ => ret_err(machine, EBADF),
    }
    Ok(())
}

fn sys_brk(machine: &mut Machine, _number: u64) -> Result<(), MachineError> {
    let requested = machine.cpu.regs[REG_A0];
    let current = machine.memory.heap_address();
    if requested > current && requested < machine.memory.stack_address() {
        machine.memory.heap_address = requested;
    }
    let brk = machine.memory.heap_address();
    log::trace!("brk {:#x} -> {:#x}", requested, brk);
    ret(machine, brk);
    Ok(())
}

fn sys_mmap(machine: &mut Machine, _number: u64) -> Result<(), MachineError> {
    let length = machine.cpu.regs[REG_A1];
    let addr = machine.memory.mmap_allocate(length);
    log::trace!("mmap {:#x} bytes -> {:#x}", length, addr);
    ret(machine, addr);
    Ok(())
}

fn sys_munmap(machine: &mut Machine, _number: u64) -> Result<(), MachineError> {
    let addr = machine.cpu.regs[REG_A0];
    let length = machine.cpu.regs[REG_A1];
    log::trace!("munmap {:#x} len {:#x}", addr, length);
    machine.memory.mmap_unmap(addr, length);
    ret(machine, 0);
    Ok(())
}

fn sys_fcntl(machine: &mut Machine, _number: u64) -> Result<(), MachineError> {
    let fd = machine.cpu.regs[REG_A0];
    let cmd = machine.cpu.regs[REG_A1];
    log::trace!("fcntl fd {} cmd {}", fd, cmd);
    match cmd {
        // F_GETFD
        1 => match fd {
            0 | 1 | 2 => ret(machine, 0),
            _ => ret_err(machine, EBADF),
        },
        // F_GETFL: O_RDONLY for stdin, O_WRONLY for the output fds
        3 => match fd {
            0 => ret(machine, 0),
            1 | 2 => ret(machine, 1),
            _ => ret_err(machine, EBADF),
        },
        _ => ret_err(machine, EBADF),
    }
    Ok(())
}
