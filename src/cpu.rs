//! Architectural state and the canonical instruction handlers.
//!
//! Handlers are plain functions taking the machine and the packed
//! operands out of a decoder-cache slot. Each one fully executes its
//! instruction: register reads/writes, memory traffic, and the pc
//! update (sequential handlers advance by the encoded length, control
//! transfers set the pc directly).

use crate::arch::{sext, Address, SignedAddress};
use crate::error::MachineError;
use crate::memory::Memory;
use crate::registers::REG_NAMES;
use crate::segment::ExecuteSegment;
use std::rc::Rc;

/// Rolling cache of recently executing segments.
const SEGMENT_CACHE_SIZE: usize = 4;

#[derive(Clone)]
pub struct Cpu {
    pub regs: [Address; 32],
    pub pc: Address,
    /// Floating-point register state. Carried for forks and host
    /// inspection; the F/D extensions are not interpreted.
    pub fregs: [u64; 32],
    pub fcsr: u32,

    current_segment: Option<Rc<ExecuteSegment>>,
    segment_cache: [Option<Rc<ExecuteSegment>>; SEGMENT_CACHE_SIZE],
    next_cache_slot: usize,
}

impl Cpu {
    pub fn new() -> Cpu {
        Cpu {
            regs: [0; 32],
            pc: 0,
            fregs: [0; 32],
            fcsr: 0,
            current_segment: None,
            segment_cache: Default::default(),
            next_cache_slot: 0,
        }
    }

    pub fn reg(&self, index: usize) -> Address {
        self.regs[index]
    }

    /// Register write honouring the zero register: writes to x0 are
    /// silently discarded.
    pub fn set_reg(&mut self, index: usize, value: Address) {
        if index != 0 {
            self.regs[index] = value;
        }
    }

    /// Segment lookup for the executing pc: current segment first, then
    /// the rolling cache, then the memory registry.
    pub(crate) fn find_segment(
        &mut self,
        memory: &Memory,
        pc: Address,
    ) -> Result<Rc<ExecuteSegment>, MachineError> {
        if let Some(seg) = &self.current_segment {
            if seg.contains(pc) {
                return Ok(seg.clone());
            }
        }
        let cached = self
            .segment_cache
            .iter()
            .flatten()
            .find(|seg| seg.contains(pc))
            .cloned();
        if let Some(seg) = cached {
            self.current_segment = Some(seg.clone());
            return Ok(seg);
        }
        let seg = memory
            .exec_segment_for(pc)
            .ok_or(MachineError::ExecutionSpaceProtectionFault { pc })?;
        self.segment_cache[self.next_cache_slot] = Some(seg.clone());
        self.next_cache_slot = (self.next_cache_slot + 1) % SEGMENT_CACHE_SIZE;
        self.current_segment = Some(seg.clone());
        Ok(seg)
    }

    /// Drop stale segment handles after eviction or teardown.
    pub(crate) fn invalidate_segments(&mut self) {
        self.current_segment = None;
        self.segment_cache = Default::default();
        self.next_cache_slot = 0;
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Cpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "pc: {:#x}", self.pc)?;
        for (i, value) in self.regs.iter().enumerate() {
            write!(f, "{:>4}: {:#10x}", REG_NAMES[i], value)?;
            if i % 4 == 3 {
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

/// The canonical instruction handlers referenced by decoder-cache
/// slots.
pub(crate) mod exec {
    use super::*;
    use crate::decoder::Operands;
    use crate::machine::Machine;

    type Result = std::result::Result<(), MachineError>;

    #[inline]
    fn rs1(m: &Machine, ops: Operands) -> Address {
        m.cpu.regs[ops.rs1 as usize]
    }

    #[inline]
    fn rs2(m: &Machine, ops: Operands) -> Address {
        m.cpu.regs[ops.rs2 as usize]
    }

    #[inline]
    fn wr(m: &mut Machine, ops: Operands, value: Address) {
        m.cpu.set_reg(ops.rd as usize, value);
    }

    #[inline]
    fn next(m: &mut Machine, ops: Operands) -> Result {
        m.cpu.pc = m.cpu.pc.wrapping_add(ops.len as Address);
        Ok(())
    }

    #[inline]
    fn sext32(value: u32) -> Address {
        value as i32 as SignedAddress as Address
    }

    pub fn illegal(m: &mut Machine, ops: Operands) -> Result {
        Err(MachineError::IllegalInstruction {
            pc: m.cpu.pc,
            word: ops.imm as u32,
        })
    }

    pub fn unimplemented(m: &mut Machine, ops: Operands) -> Result {
        Err(MachineError::UnimplementedInstruction {
            pc: m.cpu.pc,
            word: ops.imm as u32,
        })
    }

    // ------------------------------------------------------------------
    // upper immediates and control transfer

    pub fn lui(m: &mut Machine, ops: Operands) -> Result {
        wr(m, ops, sext(ops.imm));
        next(m, ops)
    }

    pub fn auipc(m: &mut Machine, ops: Operands) -> Result {
        wr(m, ops, m.cpu.pc.wrapping_add(sext(ops.imm)));
        next(m, ops)
    }

    pub fn jal(m: &mut Machine, ops: Operands) -> Result {
        let link = m.cpu.pc.wrapping_add(ops.len as Address);
        m.cpu.pc = m.cpu.pc.wrapping_add(sext(ops.imm));
        wr(m, ops, link);
        Ok(())
    }

    pub fn jalr(m: &mut Machine, ops: Operands) -> Result {
        let link = m.cpu.pc.wrapping_add(ops.len as Address);
        m.cpu.pc = rs1(m, ops).wrapping_add(sext(ops.imm)) & !1;
        wr(m, ops, link);
        Ok(())
    }

    macro_rules! branch {
        ($name:ident, $cond:expr) => {
            pub fn $name(m: &mut Machine, ops: Operands) -> Result {
                let a = rs1(m, ops);
                let b = rs2(m, ops);
                let taken: bool = $cond(a, b);
                if taken {
                    m.cpu.pc = m.cpu.pc.wrapping_add(sext(ops.imm));
                    Ok(())
                } else {
                    next(m, ops)
                }
            }
        };
    }

    branch!(beq, |a, b| a == b);
    branch!(bne, |a, b| a != b);
    branch!(blt, |a: Address, b: Address| (a as SignedAddress) < (b as SignedAddress));
    branch!(bge, |a: Address, b: Address| (a as SignedAddress) >= (b as SignedAddress));
    branch!(bltu, |a, b| a < b);
    branch!(bgeu, |a, b| a >= b);

    // ------------------------------------------------------------------
    // loads and stores

    #[inline]
    fn effective(m: &Machine, ops: Operands) -> Address {
        rs1(m, ops).wrapping_add(sext(ops.imm))
    }

    pub fn lb(m: &mut Machine, ops: Operands) -> Result {
        let value = m.memory.read::<u8>(effective(m, ops))?;
        wr(m, ops, value as i8 as SignedAddress as Address);
        next(m, ops)
    }

    pub fn lbu(m: &mut Machine, ops: Operands) -> Result {
        let value = m.memory.read::<u8>(effective(m, ops))?;
        wr(m, ops, value as Address);
        next(m, ops)
    }

    pub fn lh(m: &mut Machine, ops: Operands) -> Result {
        let value = m.memory.read::<u16>(effective(m, ops))?;
        wr(m, ops, value as i16 as SignedAddress as Address);
        next(m, ops)
    }

    pub fn lhu(m: &mut Machine, ops: Operands) -> Result {
        let value = m.memory.read::<u16>(effective(m, ops))?;
        wr(m, ops, value as Address);
        next(m, ops)
    }

    pub fn lw(m: &mut Machine, ops: Operands) -> Result {
        let value = m.memory.read::<u32>(effective(m, ops))?;
        wr(m, ops, sext32(value));
        next(m, ops)
    }

    pub fn lwu(m: &mut Machine, ops: Operands) -> Result {
        let value = m.memory.read::<u32>(effective(m, ops))?;
        wr(m, ops, value as Address);
        next(m, ops)
    }

    pub fn ld(m: &mut Machine, ops: Operands) -> Result {
        let value = m.memory.read::<u64>(effective(m, ops))?;
        wr(m, ops, value as Address);
        next(m, ops)
    }

    pub fn sb(m: &mut Machine, ops: Operands) -> Result {
        m.memory.write::<u8>(effective(m, ops), rs2(m, ops) as u8)?;
        next(m, ops)
    }

    pub fn sh(m: &mut Machine, ops: Operands) -> Result {
        m.memory.write::<u16>(effective(m, ops), rs2(m, ops) as u16)?;
        next(m, ops)
    }

    pub fn sw(m: &mut Machine, ops: Operands) -> Result {
        m.memory.write::<u32>(effective(m, ops), rs2(m, ops) as u32)?;
        next(m, ops)
    }

    pub fn sd(m: &mut Machine, ops: Operands) -> Result {
        m.memory.write::<u64>(effective(m, ops), rs2(m, ops) as u64)?;
        next(m, ops)
    }

    // ------------------------------------------------------------------
    // integer register-immediate

    pub fn addi(m: &mut Machine, ops: Operands) -> Result {
        let value = rs1(m, ops).wrapping_add(sext(ops.imm));
        wr(m, ops, value);
        next(m, ops)
    }

    pub fn slti(m: &mut Machine, ops: Operands) -> Result {
        let value = ((rs1(m, ops) as SignedAddress) < ops.imm as SignedAddress) as Address;
        wr(m, ops, value);
        next(m, ops)
    }

    pub fn sltiu(m: &mut Machine, ops: Operands) -> Result {
        let value = (rs1(m, ops) < sext(ops.imm)) as Address;
        wr(m, ops, value);
        next(m, ops)
    }

    pub fn xori(m: &mut Machine, ops: Operands) -> Result {
        let value = rs1(m, ops) ^ sext(ops.imm);
        wr(m, ops, value);
        next(m, ops)
    }

    pub fn ori(m: &mut Machine, ops: Operands) -> Result {
        let value = rs1(m, ops) | sext(ops.imm);
        wr(m, ops, value);
        next(m, ops)
    }

    pub fn andi(m: &mut Machine, ops: Operands) -> Result {
        let value = rs1(m, ops) & sext(ops.imm);
        wr(m, ops, value);
        next(m, ops)
    }

    pub fn slli(m: &mut Machine, ops: Operands) -> Result {
        let value = rs1(m, ops) << ops.imm;
        wr(m, ops, value);
        next(m, ops)
    }

    pub fn srli(m: &mut Machine, ops: Operands) -> Result {
        let value = rs1(m, ops) >> ops.imm;
        wr(m, ops, value);
        next(m, ops)
    }

    pub fn srai(m: &mut Machine, ops: Operands) -> Result {
        let value = ((rs1(m, ops) as SignedAddress) >> ops.imm) as Address;
        wr(m, ops, value);
        next(m, ops)
    }

    pub fn addiw(m: &mut Machine, ops: Operands) -> Result {
        let value = (rs1(m, ops) as u32).wrapping_add(ops.imm as u32);
        wr(m, ops, sext32(value));
        next(m, ops)
    }

    pub fn slliw(m: &mut Machine, ops: Operands) -> Result {
        let value = (rs1(m, ops) as u32) << ops.imm;
        wr(m, ops, sext32(value));
        next(m, ops)
    }

    pub fn srliw(m: &mut Machine, ops: Operands) -> Result {
        let value = (rs1(m, ops) as u32) >> ops.imm;
        wr(m, ops, sext32(value));
        next(m, ops)
    }

    pub fn sraiw(m: &mut Machine, ops: Operands) -> Result {
        let value = ((rs1(m, ops) as u32 as i32) >> ops.imm) as u32;
        wr(m, ops, sext32(value));
        next(m, ops)
    }

    // ------------------------------------------------------------------
    // integer register-register

    macro_rules! op_rr {
        ($name:ident, $body:expr) => {
            pub fn $name(m: &mut Machine, ops: Operands) -> Result {
                let a = rs1(m, ops);
                let b = rs2(m, ops);
                let value: Address = $body(a, b);
                wr(m, ops, value);
                next(m, ops)
            }
        };
    }

    const SHIFT_MASK: Address = (Address::BITS - 1) as Address;

    op_rr!(add, |a: Address, b: Address| a.wrapping_add(b));
    op_rr!(sub, |a: Address, b: Address| a.wrapping_sub(b));
    op_rr!(sll, |a: Address, b: Address| a << (b & SHIFT_MASK));
    op_rr!(slt, |a: Address, b: Address| ((a as SignedAddress) < (b as SignedAddress)) as Address);
    op_rr!(sltu, |a: Address, b: Address| (a < b) as Address);
    op_rr!(xor, |a: Address, b: Address| a ^ b);
    op_rr!(srl, |a: Address, b: Address| a >> (b & SHIFT_MASK));
    op_rr!(sra, |a: Address, b: Address| ((a as SignedAddress) >> (b & SHIFT_MASK)) as Address);
    op_rr!(or, |a: Address, b: Address| a | b);
    op_rr!(and, |a: Address, b: Address| a & b);

    op_rr!(mul, |a: Address, b: Address| a.wrapping_mul(b));
    op_rr!(mulh, |a: Address, b: Address| {
        let product = (a as SignedAddress as i128) * (b as SignedAddress as i128);
        (product >> Address::BITS) as Address
    });
    op_rr!(mulhsu, |a: Address, b: Address| {
        let product = (a as SignedAddress as i128) * (b as u128 as i128);
        (product >> Address::BITS) as Address
    });
    op_rr!(mulhu, |a: Address, b: Address| {
        let product = (a as u128) * (b as u128);
        (product >> Address::BITS) as Address
    });
    op_rr!(div, |a: Address, b: Address| {
        if b == 0 {
            Address::MAX
        } else {
            (a as SignedAddress).wrapping_div(b as SignedAddress) as Address
        }
    });
    op_rr!(divu, |a: Address, b: Address| if b == 0 { Address::MAX } else { a / b });
    op_rr!(rem, |a: Address, b: Address| {
        if b == 0 {
            a
        } else {
            (a as SignedAddress).wrapping_rem(b as SignedAddress) as Address
        }
    });
    op_rr!(remu, |a: Address, b: Address| if b == 0 { a } else { a % b });

    op_rr!(addw, |a: Address, b: Address| sext32((a as u32).wrapping_add(b as u32)));
    op_rr!(subw, |a: Address, b: Address| sext32((a as u32).wrapping_sub(b as u32)));
    op_rr!(sllw, |a: Address, b: Address| sext32((a as u32) << (b & 31)));
    op_rr!(srlw, |a: Address, b: Address| sext32((a as u32) >> (b & 31)));
    op_rr!(sraw, |a: Address, b: Address| sext32(((a as u32 as i32) >> (b & 31)) as u32));
    op_rr!(mulw, |a: Address, b: Address| sext32((a as u32).wrapping_mul(b as u32)));
    op_rr!(divw, |a: Address, b: Address| {
        let (a, b) = (a as u32 as i32, b as u32 as i32);
        if b == 0 { Address::MAX } else { sext32(a.wrapping_div(b) as u32) }
    });
    op_rr!(divuw, |a: Address, b: Address| {
        let (a, b) = (a as u32, b as u32);
        if b == 0 { Address::MAX } else { sext32(a / b) }
    });
    op_rr!(remw, |a: Address, b: Address| {
        let (a, b) = (a as u32 as i32, b as u32 as i32);
        if b == 0 { sext32(a as u32) } else { sext32(a.wrapping_rem(b) as u32) }
    });
    op_rr!(remuw, |a: Address, b: Address| {
        let (a, b) = (a as u32, b as u32);
        if b == 0 { sext32(a) } else { sext32(a % b) }
    });

    // ------------------------------------------------------------------
    // system

    pub fn fence(m: &mut Machine, ops: Operands) -> Result {
        // single hart, nothing to order
        next(m, ops)
    }

    pub fn ecall(m: &mut Machine, ops: Operands) -> Result {
        next(m, ops)?;
        m.dispatch_syscall()
    }

    pub fn ebreak(m: &mut Machine, ops: Operands) -> Result {
        m.stop();
        next(m, ops)
    }

    macro_rules! csr_op {
        ($name:ident, $source:expr, $update:expr) => {
            pub fn $name(m: &mut Machine, ops: Operands) -> Result {
                let csr = ops.imm as u32;
                let old = m.read_csr(csr)?;
                let source: Address = $source(m, ops);
                let update: Option<Address> = $update(old, source, ops);
                if let Some(new) = update {
                    m.write_csr(csr, new)?;
                }
                wr(m, ops, old);
                next(m, ops)
            }
        };
    }

    fn reg_source(m: &Machine, ops: Operands) -> Address {
        m.cpu.regs[ops.rs1 as usize]
    }

    fn imm_source(_m: &Machine, ops: Operands) -> Address {
        ops.rs1 as Address
    }

    csr_op!(csrrw, reg_source, |_old, src, _ops| Some(src));
    csr_op!(csrrs, reg_source, |old, src, ops: Operands| {
        (ops.rs1 != 0).then_some(old | src)
    });
    csr_op!(csrrc, reg_source, |old, src: Address, ops: Operands| {
        (ops.rs1 != 0).then_some(old & !src)
    });
    csr_op!(csrrwi, imm_source, |_old, src, _ops| Some(src));
    csr_op!(csrrsi, imm_source, |old, src, ops: Operands| {
        (ops.rs1 != 0).then_some(old | src)
    });
    csr_op!(csrrci, imm_source, |old, src: Address, ops: Operands| {
        (ops.rs1 != 0).then_some(old & !src)
    });

    // ------------------------------------------------------------------
    // atomics: single hart, so they reduce to sequential read-modify-
    // write through the write path; LR/SC still fails when the
    // reservation was broken by an intervening store.

    pub fn lr_w(m: &mut Machine, ops: Operands) -> Result {
        let addr = rs1(m, ops);
        if addr % 4 != 0 {
            return Err(MachineError::InvalidAlignment { addr });
        }
        let value = m.memory.read::<u32>(addr)?;
        m.memory.set_reservation(addr);
        wr(m, ops, sext32(value));
        next(m, ops)
    }

    pub fn sc_w(m: &mut Machine, ops: Operands) -> Result {
        let addr = rs1(m, ops);
        if addr % 4 != 0 {
            return Err(MachineError::InvalidAlignment { addr });
        }
        if m.memory.take_reservation(addr) {
            let value = rs2(m, ops) as u32;
            m.memory.write::<u32>(addr, value)?;
            wr(m, ops, 0);
        } else {
            wr(m, ops, 1);
        }
        next(m, ops)
    }

    pub fn lr_d(m: &mut Machine, ops: Operands) -> Result {
        let addr = rs1(m, ops);
        if addr % 8 != 0 {
            return Err(MachineError::InvalidAlignment { addr });
        }
        let value = m.memory.read::<u64>(addr)?;
        m.memory.set_reservation(addr);
        wr(m, ops, value as Address);
        next(m, ops)
    }

    pub fn sc_d(m: &mut Machine, ops: Operands) -> Result {
        let addr = rs1(m, ops);
        if addr % 8 != 0 {
            return Err(MachineError::InvalidAlignment { addr });
        }
        if m.memory.take_reservation(addr) {
            let value = rs2(m, ops) as u64;
            m.memory.write::<u64>(addr, value)?;
            wr(m, ops, 0);
        } else {
            wr(m, ops, 1);
        }
        next(m, ops)
    }

    fn amo32(funct5: i32, old: u32, src: u32) -> u32 {
        match funct5 {
            0 => old.wrapping_add(src),
            1 => src,
            4 => old ^ src,
            8 => old | src,
            0xc => old & src,
            0x10 => (old as i32).min(src as i32) as u32,
            0x14 => (old as i32).max(src as i32) as u32,
            0x18 => old.min(src),
            _ => old.max(src),
        }
    }

    fn amo64(funct5: i32, old: u64, src: u64) -> u64 {
        match funct5 {
            0 => old.wrapping_add(src),
            1 => src,
            4 => old ^ src,
            8 => old | src,
            0xc => old & src,
            0x10 => (old as i64).min(src as i64) as u64,
            0x14 => (old as i64).max(src as i64) as u64,
            0x18 => old.min(src),
            _ => old.max(src),
        }
    }

    pub fn amo_w(m: &mut Machine, ops: Operands) -> Result {
        let addr = rs1(m, ops);
        let src = rs2(m, ops) as u32;
        let funct5 = ops.imm;
        let old = m.memory.rmw::<u32, _>(addr, |v| amo32(funct5, v, src))?;
        wr(m, ops, sext32(old));
        next(m, ops)
    }

    pub fn amo_d(m: &mut Machine, ops: Operands) -> Result {
        let addr = rs1(m, ops);
        let src = rs2(m, ops) as u64;
        let funct5 = ops.imm;
        let old = m.memory.rmw::<u64, _>(addr, |v| amo64(funct5, v, src))?;
        wr(m, ops, old as Address);
        next(m, ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x0_writes_are_discarded() {
        let mut cpu = Cpu::new();
        cpu.set_reg(0, 1234);
        assert_eq!(cpu.reg(0), 0);
        cpu.set_reg(5, 1234);
        assert_eq!(cpu.reg(5), 1234);
    }

    #[test]
    fn segment_lookup_promotes_to_current() {
        let mut cpu = Cpu::new();
        let mut memory = Memory::new(1 << 20, false);
        let code: Vec<u8> = 0x0000_0013u32.to_le_bytes().to_vec(); // nop
        let seg = ExecuteSegment::generate(0x1000, &code, false, true);
        memory.install_execute_segment(seg);

        assert!(cpu.find_segment(&memory, 0x1000).is_ok());
        assert!(cpu.find_segment(&memory, 0x1000).is_ok());
        let err = cpu.find_segment(&memory, 0x9000).unwrap_err();
        assert_eq!(err, MachineError::ExecutionSpaceProtectionFault { pc: 0x9000 });
    }
}
