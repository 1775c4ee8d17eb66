//! End-to-end scenarios driving whole guest programs through the
//! machine façade.

use crate::arch::{page_number, Address, PAGE_SIZE};
use crate::error::{
    KIND_MISALIGNED_INSTRUCTION, KIND_PROTECTION_FAULT, MachineError,
};
use crate::machine::{Machine, MachineOptions, RunOutcome};
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

const VADDR: u64 = 0x10000;

/// Just enough of an assembler for the scenarios.
mod asm {
    pub fn i_type(op: u32, rd: u32, f3: u32, rs1: u32, imm: i32) -> u32 {
        ((imm as u32 & 0xfff) << 20) | (rs1 << 15) | (f3 << 12) | (rd << 7) | op
    }

    pub fn s_type(f3: u32, rs1: u32, rs2: u32, imm: i32) -> u32 {
        let imm = imm as u32;
        (((imm >> 5) & 0x7f) << 25)
            | (rs2 << 20)
            | (rs1 << 15)
            | (f3 << 12)
            | ((imm & 0x1f) << 7)
            | 0x23
    }

    pub fn addi(rd: u32, rs1: u32, imm: i32) -> u32 {
        i_type(0x13, rd, 0, rs1, imm)
    }

    pub fn lui(rd: u32, imm20: u32) -> u32 {
        (imm20 << 12) | (rd << 7) | 0x37
    }

    pub fn jal(rd: u32, imm: i32) -> u32 {
        let imm = imm as u32;
        (((imm >> 20) & 1) << 31)
            | (((imm >> 1) & 0x3ff) << 21)
            | (((imm >> 11) & 1) << 20)
            | (((imm >> 12) & 0xff) << 12)
            | (rd << 7)
            | 0x6f
    }

    pub fn jalr(rd: u32, rs1: u32, imm: i32) -> u32 {
        i_type(0x67, rd, 0, rs1, imm)
    }

    pub fn ld(rd: u32, rs1: u32, imm: i32) -> u32 {
        i_type(0x03, rd, 3, rs1, imm)
    }

    pub fn sw(rs1: u32, rs2: u32, imm: i32) -> u32 {
        s_type(2, rs1, rs2, imm)
    }

    pub fn ecall() -> u32 {
        0x73
    }
}

fn words(ws: &[u32]) -> Vec<u8> {
    ws.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// A minimal static ELF64 image: one R+X load segment at `VADDR`.
fn build_elf(code: &[u8], entry: u64) -> Vec<u8> {
    fn w16(out: &mut [u8], off: usize, v: u16) {
        out[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }
    fn w32(out: &mut [u8], off: usize, v: u32) {
        out[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }
    fn w64(out: &mut [u8], off: usize, v: u64) {
        out[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }

    let mut out = vec![0u8; 0x1000 + code.len()];
    out[0..4].copy_from_slice(b"\x7fELF");
    out[4] = 2; // ELFCLASS64
    out[5] = 1; // little endian
    out[6] = 1; // EV_CURRENT
    w16(&mut out, 0x10, 2); // ET_EXEC
    w16(&mut out, 0x12, 243); // EM_RISCV
    w32(&mut out, 0x14, 1);
    w64(&mut out, 0x18, entry);
    w64(&mut out, 0x20, 0x40); // e_phoff
    w16(&mut out, 0x34, 64); // e_ehsize
    w16(&mut out, 0x36, 56); // e_phentsize
    w16(&mut out, 0x38, 1); // e_phnum

    w32(&mut out, 0x40, 1); // PT_LOAD
    w32(&mut out, 0x44, 5); // R + X
    w64(&mut out, 0x48, 0x1000); // p_offset
    w64(&mut out, 0x50, VADDR);
    w64(&mut out, 0x58, VADDR);
    w64(&mut out, 0x60, code.len() as u64);
    w64(&mut out, 0x68, code.len() as u64);
    w64(&mut out, 0x70, 0x1000);

    out[0x1000..].copy_from_slice(code);
    out
}

#[derive(Clone, Default)]
struct SharedWriter(Rc<RefCell<Vec<u8>>>);

impl SharedWriter {
    fn contents(&self) -> Vec<u8> {
        self.0.borrow().clone()
    }
}

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn machine_for(code: &[u8], options: MachineOptions) -> Machine {
    let elf = build_elf(code, VADDR);
    Machine::new(&elf, options).expect("machine construction failed")
}

fn exit_with(code_reg_value: i32) -> Vec<u32> {
    vec![
        asm::addi(10, 0, code_reg_value),
        asm::addi(17, 0, 93),
        asm::ecall(),
    ]
}

#[test]
fn hello_world_reaches_the_stdout_writer() {
    // write(1, str, 6); exit(0)
    let code = vec![
        asm::addi(10, 0, 1),
        asm::lui(11, 0x10),
        asm::addi(11, 11, 36),
        asm::addi(12, 0, 6),
        asm::addi(17, 0, 64),
        asm::ecall(),
        asm::addi(10, 0, 0),
        asm::addi(17, 0, 93),
        asm::ecall(),
    ];
    assert_eq!(code.len() * 4, 36);
    let mut bytes = words(&code);
    bytes.extend_from_slice(b"hello\n");

    let mut machine = machine_for(&bytes, MachineOptions::default());
    let out = SharedWriter::default();
    machine.set_stdout(Box::new(out.clone()));

    let outcome = machine.run(10_000).unwrap();
    assert_eq!(outcome, RunOutcome::Halted);
    assert_eq!(out.contents(), b"hello\n");
    assert_eq!(machine.return_value(), 0);
    assert_eq!(machine.exit_code(), 0);
}

#[test]
fn tight_loop_times_out_with_exact_budget() {
    // a0 += 1 forever
    let code = words(&[asm::addi(10, 10, 1), asm::jal(0, -4)]);
    let mut machine = machine_for(&code, MachineOptions::default());

    let outcome = machine.run(1_000_000).unwrap();
    assert_eq!(outcome, RunOutcome::Timeout);
    assert_eq!(machine.instruction_counter(), 1_000_000);
    // two instructions per iteration
    assert_eq!(machine.return_value(), 500_000);
}

#[test]
fn budget_exhaustion_is_resumable() {
    let code = words(&exit_with(7));
    let mut machine = machine_for(&code, MachineOptions::default());
    assert_eq!(machine.run(1).unwrap(), RunOutcome::Timeout);
    assert_eq!(machine.run(100).unwrap(), RunOutcome::Halted);
    assert_eq!(machine.exit_code(), 7);
}

#[test]
fn misaligned_jump_faults_with_the_target_address() {
    // jump to VADDR + 6 in non-compressed mode
    let code = words(&[
        asm::lui(5, 0x10),
        asm::jalr(0, 5, 6),
    ]);
    let mut machine = machine_for(
        &code,
        MachineOptions {
            compressed_isa: false,
            ..Default::default()
        },
    );
    let err = machine.run(100).unwrap_err();
    assert_eq!(err, MachineError::MisalignedInstruction { pc: 0x10006 });
    assert_eq!(err.kind(), KIND_MISALIGNED_INSTRUCTION);
    assert_eq!(err.data(), 0x10006);
}

#[test]
fn guest_store_into_code_is_a_protection_fault() {
    let code = words(&[
        asm::lui(5, 0x10),
        asm::sw(5, 0, 0),
    ]);
    let mut machine = machine_for(&code, MachineOptions::default());
    let before = machine.memory.read::<u32>(0x10000).unwrap();
    let err = machine.run(100).unwrap_err();
    assert_eq!(err.kind(), KIND_PROTECTION_FAULT);
    assert_eq!(err.data(), 0x10000);
    // the faulted store left memory unchanged
    assert_eq!(machine.memory.read::<u32>(0x10000).unwrap(), before);
}

#[test]
fn illegal_encoding_reports_the_word() {
    let code = words(&[0x0000_0000]);
    let mut machine = machine_for(&code, MachineOptions::default());
    let err = machine.run(10).unwrap_err();
    assert!(matches!(err, MachineError::IllegalInstruction { pc: 0x10000, .. }));
}

#[test]
fn copy_on_write_fork_isolates_the_machines() {
    let code = words(&exit_with(0));
    let mut parent = machine_for(&code, MachineOptions::default());
    let probe: Address = 0x20000;

    parent.memory.write::<u8>(probe, 0xAA).unwrap();
    let mut child = parent.fork();
    child.memory.write::<u8>(probe, 0xBB).unwrap();

    assert_eq!(parent.memory.read::<u8>(probe).unwrap(), 0xAA);
    assert_eq!(child.memory.read::<u8>(probe).unwrap(), 0xBB);

    // both still run to completion independently
    assert_eq!(parent.run(100).unwrap(), RunOutcome::Halted);
    assert_eq!(child.run(100).unwrap(), RunOutcome::Halted);
}

#[test]
fn mmap_grows_and_shrinks_the_cursor() {
    let code = words(&exit_with(0));
    let mut machine = machine_for(&code, MachineOptions::default());
    let page = PAGE_SIZE as Address;

    let a = machine.memory.mmap_allocate(2 * page);
    assert!(machine.memory.mmap_relax(a, 2 * page, page));
    let b = machine.memory.mmap_allocate(page);
    assert_eq!(b, a + page);
}

#[test]
fn shared_page_is_visible_to_both_machines() {
    let code = words(&exit_with(0));
    let mut first = machine_for(&code, MachineOptions::default());
    let mut second = machine_for(&code, MachineOptions::default());

    let addr = first.memory.mmap_allocate(PAGE_SIZE as Address);
    let page = first.memory.share_page(page_number(addr)).unwrap();
    second
        .memory
        .install_shared_page(page_number(addr), page)
        .unwrap();

    first.memory.write::<u32>(addr, 42).unwrap();
    assert_eq!(second.memory.read::<u32>(addr).unwrap(), 42);
    second.memory.write::<u32>(addr + 4, 7).unwrap();
    assert_eq!(first.memory.read::<u32>(addr + 4).unwrap(), 7);
}

#[test]
fn stop_latches_until_cleared() {
    let code = words(&[asm::addi(10, 10, 1), asm::jal(0, -4)]);
    let mut machine = machine_for(&code, MachineOptions::default());

    machine.stop();
    machine.stop();
    let before = machine.instruction_counter();
    assert_eq!(machine.run(1_000).unwrap(), RunOutcome::Stopped);
    assert_eq!(machine.instruction_counter(), before);

    machine.clear_stop();
    assert_eq!(machine.run(10).unwrap(), RunOutcome::Timeout);
    assert_eq!(machine.instruction_counter(), before + 10);
}

#[test]
fn identical_runs_produce_identical_state() {
    let code = vec![
        asm::addi(10, 0, 1),
        asm::lui(11, 0x10),
        asm::addi(11, 11, 36),
        asm::addi(12, 0, 6),
        asm::addi(17, 0, 64),
        asm::ecall(),
        asm::addi(10, 0, 0),
        asm::addi(17, 0, 93),
        asm::ecall(),
    ];
    let mut bytes = words(&code);
    bytes.extend_from_slice(b"hello\n");

    let run = || {
        let mut machine = machine_for(
            &bytes,
            MachineOptions {
                argv: vec!["guest".into(), "arg".into()],
                ..Default::default()
            },
        );
        machine.set_stdout(Box::new(SharedWriter::default()));
        machine.run(10_000).unwrap();
        (*machine.regs(), machine.instruction_counter(), machine.pc())
    };
    assert_eq!(run(), run());
}

#[test]
fn argc_lands_on_the_stack() {
    // exit(*(u64*)sp), i.e. exit(argc)
    let code = words(&[
        asm::ld(10, 2, 0),
        asm::addi(17, 0, 93),
        asm::ecall(),
    ]);
    let mut machine = machine_for(
        &code,
        MachineOptions {
            argv: vec!["prog".into(), "one".into(), "two".into()],
            ..Default::default()
        },
    );
    assert_eq!(machine.run(100).unwrap(), RunOutcome::Halted);
    assert_eq!(machine.exit_code(), 3);
}

#[test]
fn vmcall_returns_the_guest_result() {
    // main: exit(0); func at +12: a0 += 7; ret
    let code = words(&[
        asm::addi(10, 0, 0),
        asm::addi(17, 0, 93),
        asm::ecall(),
        asm::addi(10, 10, 7),
        asm::jalr(0, 1, 0),
    ]);
    let mut machine = machine_for(&code, MachineOptions::default());
    assert_eq!(machine.run(100).unwrap(), RunOutcome::Halted);

    let result = machine.vmcall(0x10000 + 12, &[35], 100).unwrap();
    assert_eq!(result, 42);
}

#[test]
fn compressed_code_executes_at_half_word_granularity() {
    // c.li a0, 5 ; c.addi a0, 1 ; then a full-width exit sequence at a
    // 2-byte-aligned offset
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&0x4515u16.to_le_bytes()); // c.li a0, 5
    bytes.extend_from_slice(&0x0505u16.to_le_bytes()); // c.addi a0, 1
    bytes.extend_from_slice(&asm::addi(17, 0, 93).to_le_bytes());
    bytes.extend_from_slice(&asm::ecall().to_le_bytes());

    let mut machine = machine_for(&bytes, MachineOptions::default());
    assert_eq!(machine.run(100).unwrap(), RunOutcome::Halted);
    assert_eq!(machine.exit_code(), 6);
}

#[test]
fn arena_and_paged_machines_agree_on_guest_state() {
    let code = words(&exit_with(11));
    for use_arena in [true, false] {
        let mut machine = machine_for(
            &code,
            MachineOptions {
                use_memory_arena: use_arena,
                ..Default::default()
            },
        );
        assert_eq!(machine.run(100).unwrap(), RunOutcome::Halted);
        assert_eq!(machine.exit_code(), 11);
        assert_eq!(machine.instruction_counter(), 3);
    }
}
