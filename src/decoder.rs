//! Instruction decode.
//!
//! Every encoding maps to one canonical handler plus a packed operand
//! struct; the pair is what decoder-cache slots store, so handlers read
//! their fields instead of re-decoding. Unknown encodings map to a
//! handler that raises the illegal-instruction fault when executed.

use crate::cpu::exec;
use crate::error::MachineError;
use crate::machine::Machine;

pub type Handler = fn(&mut Machine, Operands) -> Result<(), MachineError>;

/// Packed operands stored in a decoder-cache slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct Operands {
    pub rd: u8,
    pub rs1: u8,
    pub rs2: u8,
    /// Encoded instruction length in bytes (2 or 4); handlers advance
    /// the pc by this much.
    pub len: u8,
    /// Sign-extended immediate, shift amount, CSR number or raw word
    /// depending on the handler.
    pub imm: i32,
}

#[derive(Clone, Copy)]
pub struct DecodedSlot {
    pub handler: Handler,
    pub ops: Operands,
    /// The raw encoding, kept for the dispatch-loop trace line.
    pub word: u32,
}

fn slot(handler: Handler, rd: u8, rs1: u8, rs2: u8, len: u8, imm: i32) -> DecodedSlot {
    DecodedSlot {
        handler,
        ops: Operands { rd, rs1, rs2, len, imm },
        word: 0,
    }
}

pub fn illegal_slot(word: u32) -> DecodedSlot {
    let mut s = slot(exec::illegal, 0, 0, 0, 4, word as i32);
    s.word = word;
    s
}

fn unimplemented_slot(word: u32, len: u8) -> DecodedSlot {
    let mut s = slot(exec::unimplemented, 0, 0, 0, len, word as i32);
    s.word = word;
    s
}

fn imm_i(word: u32) -> i32 {
    (word as i32) >> 20
}

fn imm_s(word: u32) -> i32 {
    (((word as i32) >> 25) << 5) | (((word >> 7) & 0x1f) as i32)
}

fn imm_b(word: u32) -> i32 {
    (((word as i32) >> 31) << 12)
        | ((((word >> 7) & 1) as i32) << 11)
        | ((((word >> 25) & 0x3f) as i32) << 5)
        | ((((word >> 8) & 0xf) as i32) << 1)
}

fn imm_u(word: u32) -> i32 {
    (word & 0xffff_f000) as i32
}

fn imm_j(word: u32) -> i32 {
    (((word as i32) >> 31) << 20)
        | ((((word >> 12) & 0xff) as i32) << 12)
        | ((((word >> 20) & 1) as i32) << 11)
        | ((((word >> 21) & 0x3ff) as i32) << 1)
}

const RV64: bool = !cfg!(feature = "rv32");

/// Decode one full-width instruction word.
pub fn decode(word: u32) -> DecodedSlot {
    let mut s = decode_word(word);
    s.word = word;
    s
}

fn decode_word(word: u32) -> DecodedSlot {
    let opcode = word & 0x7f;
    let rd = ((word >> 7) & 0x1f) as u8;
    let funct3 = (word >> 12) & 7;
    let rs1 = ((word >> 15) & 0x1f) as u8;
    let rs2 = ((word >> 20) & 0x1f) as u8;
    let funct7 = word >> 25;

    match opcode {
        0x37 => slot(exec::lui, rd, 0, 0, 4, imm_u(word)),
        0x17 => slot(exec::auipc, rd, 0, 0, 4, imm_u(word)),
        0x6f => slot(exec::jal, rd, 0, 0, 4, imm_j(word)),
        0x67 if funct3 == 0 => slot(exec::jalr, rd, rs1, 0, 4, imm_i(word)),
        0x63 => {
            let handler = match funct3 {
                0 => exec::beq,
                1 => exec::bne,
                4 => exec::blt,
                5 => exec::bge,
                6 => exec::bltu,
                7 => exec::bgeu,
                _ => return illegal_slot(word),
            };
            slot(handler, 0, rs1, rs2, 4, imm_b(word))
        }
        0x03 => {
            let handler = match funct3 {
                0 => exec::lb,
                1 => exec::lh,
                2 => exec::lw,
                3 if RV64 => exec::ld,
                4 => exec::lbu,
                5 => exec::lhu,
                6 if RV64 => exec::lwu,
                _ => return illegal_slot(word),
            };
            slot(handler, rd, rs1, 0, 4, imm_i(word))
        }
        0x23 => {
            let handler = match funct3 {
                0 => exec::sb,
                1 => exec::sh,
                2 => exec::sw,
                3 if RV64 => exec::sd,
                _ => return illegal_slot(word),
            };
            slot(handler, 0, rs1, rs2, 4, imm_s(word))
        }
        0x13 => {
            let shamt_bits = if RV64 { 6 } else { 5 };
            let shamt = ((word >> 20) & ((1 << shamt_bits) - 1)) as i32;
            // on RV64 bit 25 belongs to the shift amount
            let shift_funct = if RV64 { funct7 >> 1 } else { funct7 };
            let srai_funct = if RV64 { 0x10 } else { 0x20 };
            match funct3 {
                0 => slot(exec::addi, rd, rs1, 0, 4, imm_i(word)),
                2 => slot(exec::slti, rd, rs1, 0, 4, imm_i(word)),
                3 => slot(exec::sltiu, rd, rs1, 0, 4, imm_i(word)),
                4 => slot(exec::xori, rd, rs1, 0, 4, imm_i(word)),
                6 => slot(exec::ori, rd, rs1, 0, 4, imm_i(word)),
                7 => slot(exec::andi, rd, rs1, 0, 4, imm_i(word)),
                1 if shift_funct == 0 => slot(exec::slli, rd, rs1, 0, 4, shamt),
                5 if shift_funct == 0 => slot(exec::srli, rd, rs1, 0, 4, shamt),
                5 if shift_funct == srai_funct => slot(exec::srai, rd, rs1, 0, 4, shamt),
                _ => illegal_slot(word),
            }
        }
        0x1b if RV64 => {
            let shamt = ((word >> 20) & 0x1f) as i32;
            match funct3 {
                0 => slot(exec::addiw, rd, rs1, 0, 4, imm_i(word)),
                1 if funct7 == 0 => slot(exec::slliw, rd, rs1, 0, 4, shamt),
                5 if funct7 == 0 => slot(exec::srliw, rd, rs1, 0, 4, shamt),
                5 if funct7 == 0x20 => slot(exec::sraiw, rd, rs1, 0, 4, shamt),
                _ => illegal_slot(word),
            }
        }
        0x33 => {
            let handler = match (funct7, funct3) {
                (0, 0) => exec::add,
                (0x20, 0) => exec::sub,
                (0, 1) => exec::sll,
                (0, 2) => exec::slt,
                (0, 3) => exec::sltu,
                (0, 4) => exec::xor,
                (0, 5) => exec::srl,
                (0x20, 5) => exec::sra,
                (0, 6) => exec::or,
                (0, 7) => exec::and,
                (1, 0) => exec::mul,
                (1, 1) => exec::mulh,
                (1, 2) => exec::mulhsu,
                (1, 3) => exec::mulhu,
                (1, 4) => exec::div,
                (1, 5) => exec::divu,
                (1, 6) => exec::rem,
                (1, 7) => exec::remu,
                _ => return illegal_slot(word),
            };
            slot(handler, rd, rs1, rs2, 4, 0)
        }
        0x3b if RV64 => {
            let handler = match (funct7, funct3) {
                (0, 0) => exec::addw,
                (0x20, 0) => exec::subw,
                (0, 1) => exec::sllw,
                (0, 5) => exec::srlw,
                (0x20, 5) => exec::sraw,
                (1, 0) => exec::mulw,
                (1, 4) => exec::divw,
                (1, 5) => exec::divuw,
                (1, 6) => exec::remw,
                (1, 7) => exec::remuw,
                _ => return illegal_slot(word),
            };
            slot(handler, rd, rs1, rs2, 4, 0)
        }
        // fence / fence.i order nothing on a single hart
        0x0f => slot(exec::fence, 0, 0, 0, 4, 0),
        0x73 => {
            if word == 0x0000_0073 {
                return slot(exec::ecall, 0, 0, 0, 4, 0);
            }
            if word == 0x0010_0073 {
                return slot(exec::ebreak, 0, 0, 0, 4, 0);
            }
            let csr = (word >> 20) as i32;
            let handler = match funct3 {
                1 => exec::csrrw,
                2 => exec::csrrs,
                3 => exec::csrrc,
                5 => exec::csrrwi,
                6 => exec::csrrsi,
                7 => exec::csrrci,
                _ => return illegal_slot(word),
            };
            slot(handler, rd, rs1, 0, 4, csr)
        }
        0x2f => {
            let funct5 = (funct7 >> 2) as i32;
            match funct3 {
                2 => match funct5 {
                    2 if rs2 == 0 => slot(exec::lr_w, rd, rs1, 0, 4, 0),
                    3 => slot(exec::sc_w, rd, rs1, rs2, 4, 0),
                    0 | 1 | 4 | 8 | 0xc | 0x10 | 0x14 | 0x18 | 0x1c => {
                        slot(exec::amo_w, rd, rs1, rs2, 4, funct5)
                    }
                    _ => illegal_slot(word),
                },
                3 if RV64 => match funct5 {
                    2 if rs2 == 0 => slot(exec::lr_d, rd, rs1, 0, 4, 0),
                    3 => slot(exec::sc_d, rd, rs1, rs2, 4, 0),
                    0 | 1 | 4 | 8 | 0xc | 0x10 | 0x14 | 0x18 | 0x1c => {
                        slot(exec::amo_d, rd, rs1, rs2, 4, funct5)
                    }
                    _ => illegal_slot(word),
                },
                _ => illegal_slot(word),
            }
        }
        // float loads/stores and arithmetic: state is carried but the
        // extension is not interpreted
        0x07 | 0x27 | 0x43 | 0x47 | 0x4b | 0x4f | 0x53 => unimplemented_slot(word, 4),
        _ => illegal_slot(word),
    }
}

// compressed register shorthand: x8..x15
fn cr(field: u16) -> u8 {
    8 + (field & 7) as u8
}

fn sext6(value: u16) -> i32 {
    ((value as i32) << 26) >> 26
}

/// Decode one compressed (16-bit) instruction. Expansions share the
/// full-width handlers, with the slot length recording the 2-byte pc
/// advance.
pub fn decode_compressed(half: u16) -> DecodedSlot {
    let mut s = decode_half(half);
    s.word = half as u32;
    s
}

fn decode_half(half: u16) -> DecodedSlot {
    let word = half as u32;
    let op = half & 3;
    let funct3 = (half >> 13) & 7;
    match (op, funct3) {
        (0, 0) => {
            // c.addi4spn
            let imm = (((half >> 11) & 3) << 4)
                | (((half >> 7) & 0xf) << 6)
                | (((half >> 6) & 1) << 2)
                | (((half >> 5) & 1) << 3);
            if imm == 0 {
                return illegal_slot(word);
            }
            slot(exec::addi, cr(half >> 2), 2, 0, 2, imm as i32)
        }
        (0, 2) => {
            // c.lw
            let imm = (((half >> 10) & 7) << 3) | (((half >> 6) & 1) << 2) | (((half >> 5) & 1) << 6);
            slot(exec::lw, cr(half >> 2), cr(half >> 7), 0, 2, imm as i32)
        }
        (0, 3) if RV64 => {
            // c.ld
            let imm = (((half >> 10) & 7) << 3) | (((half >> 5) & 3) << 6);
            slot(exec::ld, cr(half >> 2), cr(half >> 7), 0, 2, imm as i32)
        }
        (0, 6) => {
            // c.sw
            let imm = (((half >> 10) & 7) << 3) | (((half >> 6) & 1) << 2) | (((half >> 5) & 1) << 6);
            slot(exec::sw, 0, cr(half >> 7), cr(half >> 2), 2, imm as i32)
        }
        (0, 7) if RV64 => {
            // c.sd
            let imm = (((half >> 10) & 7) << 3) | (((half >> 5) & 3) << 6);
            slot(exec::sd, 0, cr(half >> 7), cr(half >> 2), 2, imm as i32)
        }
        (0, 1) | (0, 5) | (0, 3) | (0, 7) => unimplemented_slot(word, 2),
        (1, 0) => {
            // c.addi (c.nop when rd is x0)
            let rd = ((half >> 7) & 0x1f) as u8;
            let imm = sext6((((half >> 12) & 1) << 5) | ((half >> 2) & 0x1f));
            slot(exec::addi, rd, rd, 0, 2, imm)
        }
        (1, 1) => {
            if RV64 {
                // c.addiw
                let rd = ((half >> 7) & 0x1f) as u8;
                if rd == 0 {
                    return illegal_slot(word);
                }
                let imm = sext6((((half >> 12) & 1) << 5) | ((half >> 2) & 0x1f));
                slot(exec::addiw, rd, rd, 0, 2, imm)
            } else {
                // c.jal
                slot(exec::jal, 1, 0, 0, 2, cj_imm(half))
            }
        }
        (1, 2) => {
            // c.li
            let rd = ((half >> 7) & 0x1f) as u8;
            let imm = sext6((((half >> 12) & 1) << 5) | ((half >> 2) & 0x1f));
            slot(exec::addi, rd, 0, 0, 2, imm)
        }
        (1, 3) => {
            let rd = ((half >> 7) & 0x1f) as u8;
            if rd == 2 {
                // c.addi16sp
                let imm = ((((half >> 12) & 1) << 9)
                    | (((half >> 6) & 1) << 4)
                    | (((half >> 5) & 1) << 6)
                    | (((half >> 3) & 3) << 7)
                    | (((half >> 2) & 1) << 5)) as i32;
                let imm = (imm << 22) >> 22;
                if imm == 0 {
                    return illegal_slot(word);
                }
                slot(exec::addi, 2, 2, 0, 2, imm)
            } else {
                // c.lui
                let imm = sext6((((half >> 12) & 1) << 5) | ((half >> 2) & 0x1f));
                if imm == 0 {
                    return illegal_slot(word);
                }
                slot(exec::lui, rd, 0, 0, 2, imm << 12)
            }
        }
        (1, 4) => {
            let rd = cr(half >> 7);
            match (half >> 10) & 3 {
                0 => {
                    let shamt = ((((half >> 12) & 1) << 5) | ((half >> 2) & 0x1f)) as i32;
                    slot(exec::srli, rd, rd, 0, 2, shamt)
                }
                1 => {
                    let shamt = ((((half >> 12) & 1) << 5) | ((half >> 2) & 0x1f)) as i32;
                    slot(exec::srai, rd, rd, 0, 2, shamt)
                }
                2 => {
                    let imm = sext6((((half >> 12) & 1) << 5) | ((half >> 2) & 0x1f));
                    slot(exec::andi, rd, rd, 0, 2, imm)
                }
                _ => {
                    let rs2 = cr(half >> 2);
                    if (half >> 12) & 1 == 0 {
                        let handler = match (half >> 5) & 3 {
                            0 => exec::sub,
                            1 => exec::xor,
                            2 => exec::or,
                            _ => exec::and,
                        };
                        slot(handler, rd, rd, rs2, 2, 0)
                    } else if RV64 {
                        match (half >> 5) & 3 {
                            0 => slot(exec::subw, rd, rd, rs2, 2, 0),
                            1 => slot(exec::addw, rd, rd, rs2, 2, 0),
                            _ => illegal_slot(word),
                        }
                    } else {
                        illegal_slot(word)
                    }
                }
            }
        }
        (1, 5) => slot(exec::jal, 0, 0, 0, 2, cj_imm(half)),
        (1, 6) => slot(exec::beq, 0, cr(half >> 7), 0, 2, cb_imm(half)),
        (1, 7) => slot(exec::bne, 0, cr(half >> 7), 0, 2, cb_imm(half)),
        (2, 0) => {
            // c.slli
            let rd = ((half >> 7) & 0x1f) as u8;
            let shamt = ((((half >> 12) & 1) << 5) | ((half >> 2) & 0x1f)) as i32;
            slot(exec::slli, rd, rd, 0, 2, shamt)
        }
        (2, 2) => {
            // c.lwsp
            let rd = ((half >> 7) & 0x1f) as u8;
            if rd == 0 {
                return illegal_slot(word);
            }
            let imm = ((((half >> 12) & 1) << 5)
                | (((half >> 4) & 7) << 2)
                | (((half >> 2) & 3) << 6)) as i32;
            slot(exec::lw, rd, 2, 0, 2, imm)
        }
        (2, 3) if RV64 => {
            // c.ldsp
            let rd = ((half >> 7) & 0x1f) as u8;
            if rd == 0 {
                return illegal_slot(word);
            }
            let imm = ((((half >> 12) & 1) << 5)
                | (((half >> 5) & 3) << 3)
                | (((half >> 2) & 7) << 6)) as i32;
            slot(exec::ld, rd, 2, 0, 2, imm)
        }
        (2, 4) => {
            let rd = ((half >> 7) & 0x1f) as u8;
            let rs2 = ((half >> 2) & 0x1f) as u8;
            if (half >> 12) & 1 == 0 {
                if rs2 == 0 {
                    if rd == 0 {
                        return illegal_slot(word);
                    }
                    // c.jr
                    slot(exec::jalr, 0, rd, 0, 2, 0)
                } else {
                    // c.mv
                    slot(exec::add, rd, 0, rs2, 2, 0)
                }
            } else if rs2 == 0 {
                if rd == 0 {
                    slot(exec::ebreak, 0, 0, 0, 2, 0)
                } else {
                    // c.jalr
                    slot(exec::jalr, 1, rd, 0, 2, 0)
                }
            } else {
                // c.add
                slot(exec::add, rd, rd, rs2, 2, 0)
            }
        }
        (2, 6) => {
            // c.swsp
            let rs2 = ((half >> 2) & 0x1f) as u8;
            let imm = ((((half >> 9) & 0xf) << 2) | (((half >> 7) & 3) << 6)) as i32;
            slot(exec::sw, 0, 2, rs2, 2, imm)
        }
        (2, 7) if RV64 => {
            // c.sdsp
            let rs2 = ((half >> 2) & 0x1f) as u8;
            let imm = ((((half >> 10) & 7) << 3) | (((half >> 7) & 7) << 6)) as i32;
            slot(exec::sd, 0, 2, rs2, 2, imm)
        }
        (2, 1) | (2, 5) | (2, 3) | (2, 7) => unimplemented_slot(word, 2),
        _ => illegal_slot(word),
    }
}

fn cj_imm(half: u16) -> i32 {
    let imm = ((((half >> 12) & 1) << 11)
        | (((half >> 11) & 1) << 4)
        | (((half >> 9) & 3) << 8)
        | (((half >> 8) & 1) << 10)
        | (((half >> 7) & 1) << 6)
        | (((half >> 6) & 1) << 7)
        | (((half >> 3) & 7) << 1)
        | (((half >> 2) & 1) << 5)) as i32;
    (imm << 20) >> 20
}

fn cb_imm(half: u16) -> i32 {
    let imm = ((((half >> 12) & 1) << 8)
        | (((half >> 10) & 3) << 3)
        | (((half >> 5) & 3) << 6)
        | (((half >> 3) & 3) << 1)
        | (((half >> 2) & 1) << 5)) as i32;
    (imm << 23) >> 23
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediates_decode() {
        // addi x1, x0, -1
        assert_eq!(imm_i(0xfff0_0093), -1);
        // sw x5, -4(x2)
        assert_eq!(imm_s(0xfe51_2e23), -4);
        // lui keeps the upper immediate in place
        assert_eq!(imm_u(0x0001_23b7), 0x12000);
        // jal x0, -8
        assert_eq!(imm_j(0xff9f_f06f), -8);
        // beq x0, x0, 16
        assert_eq!(imm_b(0x0000_0863), 16);
    }

    #[test]
    fn compressed_expansions_cover_quadrants() {
        // c.addi4spn x8, sp, 16 : 0x0800
        let s = decode_compressed(0x0800);
        assert_eq!(s.ops.rd, 8);
        assert_eq!(s.ops.rs1, 2);
        assert_eq!(s.ops.imm, 16);
        assert_eq!(s.ops.len, 2);

        // c.li x5, -1 : funct3=010 rd=5 imm=-1 -> 0x52fd
        let s = decode_compressed(0x52fd);
        assert_eq!(s.ops.rd, 5);
        assert_eq!(s.ops.imm, -1);
    }

    #[test]
    fn reserved_compressed_encodings_are_illegal() {
        // all-zero halfword is defined illegal
        let s = decode_compressed(0x0000);
        assert_eq!(s.ops.imm, 0);
    }
}
