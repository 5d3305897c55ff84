// encoder_compressed.rs
//
// Compressed instruction encoding for the RVC extension
//
// Some instructions have 16-bit compressed encodings; they are irregular,
// few in number, and not in machine-readable form, so they are simply
// enumerated here. compress returns 0 when no compressed encoding applies
// (0 is a valid but permanently undefined encoding, so it is safe as the
// "no" answer).
//
// Note: binary literals use custom grouping to show instruction format
// structure.
#![allow(clippy::unusual_byte_groupings)]

use crate::config::Config;
use crate::encoder::imm_fits;
use crate::prog::{Addr, Mark, Prog};
use crate::riscv::{Op, Reg};

/// Placeholder length marker returned during sizing for branch/jump forms
/// whose offset is still unresolved: layout must assume 2 bytes whenever a
/// compressed encoding is otherwise legal, or sizes could shrink between
/// iterations and the fixpoint would not terminate.
const SIZING_PLACEHOLDER: u16 = 0x9001;

fn int_reg_num(a: &Addr) -> Option<u32> {
    match a {
        Addr::Reg(r) if r.is_int() => Some(r.num()),
        _ => None,
    }
}

fn float_reg_num(a: &Addr) -> Option<u32> {
    match a {
        Addr::Reg(r) if r.is_float() => Some(r.num()),
        _ => None,
    }
}

fn const_offset(a: &Addr) -> Option<i64> {
    match a {
        Addr::Const { offset, .. } => Some(*offset),
        _ => None,
    }
}

/// Compress a load or store. typecode is the funct3 of the compressed form;
/// size is the access width in bytes. Two base-register classes apply: an
/// SP base takes the full 6-bit scaled immediate, a compressed-file base
/// takes 5 bits, and everything else fails.
fn compress_load_store(p: &Prog, store: bool, float: bool, typecode: u16, size: i64) -> u16 {
    let imm = match const_offset(&p.from) {
        Some(imm) => imm,
        None => return 0,
    };
    if imm < 0 || imm & (size - 1) != 0 {
        // Misaligned and backward offsets are never compressible.
        return 0;
    }

    let (base, datum_addr) = if store {
        (int_reg_num(&p.to), &p.from3)
    } else {
        (int_reg_num(&p.from3), &p.to)
    };
    let base = match base {
        Some(b) => b,
        None => return 0,
    };
    let datum = match if float { float_reg_num(datum_addr) } else { int_reg_num(datum_addr) } {
        Some(d) => d,
        None => return 0,
    };

    if base == Reg::SP.num() {
        if imm >= size * 64 || (datum == 0 && !store && !float) {
            return 0;
        }
        let imm = imm as u16;
        // Fold immediate bits 5:0, with the bits above 5 wrapping into the
        // alignment-zeroed low positions.
        let immf = (imm & 63) | (imm >> 6);
        if store {
            1 << 15 | typecode << 13 | immf << 7 | (datum as u16) << 2 | 2
        } else {
            typecode << 13 | (immf & 32) << 7 | (datum as u16) << 7 | (immf & 31) << 2 | 2
        }
    } else if (8..=15).contains(&base) && (8..=15).contains(&datum) {
        if imm >= size * 32 {
            return 0;
        }
        let imm = imm as u16;
        // Fold into 5:1, then drop the scaled-out bit.
        let immf = ((imm & 63) | (imm >> 5)) >> 1;
        let hi = if store { 1u16 << 15 } else { 0 };
        hi | typecode << 13
            | (immf >> 2) << 10
            | ((base as u16) & 7) << 7
            | (immf & 3) << 5
            | ((datum as u16) & 7) << 2
    } else {
        0
    }
}

/// Re-encode p as a 16-bit instruction, or return 0 if no compressed
/// encoding applies. In sizing mode the offset of a branch or jump may
/// still be unresolved; a placeholder is returned so layout counts 2 bytes.
pub fn compress(config: Config, p: &Prog, sizing: bool) -> u16 {
    if p.mark.contains(Mark::NOCOMPRESS) || !config.rvc {
        return 0;
    }

    match p.op {
        // Load and store
        Op::Fld => compress_load_store(p, false, true, 1, 8),
        Op::Lw => compress_load_store(p, false, false, 2, 4),
        Op::Ld => compress_load_store(p, false, false, 3, 8),
        Op::Fsd => compress_load_store(p, true, true, 1, 8),
        Op::Sw => compress_load_store(p, true, false, 2, 4),
        Op::Sd => compress_load_store(p, true, false, 3, 8),

        // Control transfer
        Op::Jal => {
            // Not if it will be relocated.
            if p.to.const_sym().is_some() {
                return 0;
            }
            let lr = match int_reg_num(&p.from) {
                Some(lr) => lr,
                None => return 0,
            };
            // C.J only; C.JAL does not exist in RV64. Overextended offsets
            // must already carry NOCOMPRESS from the branch-extension pass.
            if lr == 0 {
                if sizing && p.to == Addr::Branch {
                    return SIZING_PLACEHOLDER;
                }
                let o = match const_offset(&p.to) {
                    Some(o) if imm_fits(o, 12) => o as u16,
                    _ => return 0,
                };
                // offset[11|4|9:8|10|6|7|3:1|5]
                return 0xA001
                    | ((o >> 11) & 1) << 12
                    | ((o >> 4) & 1) << 11
                    | ((o >> 8) & 3) << 9
                    | ((o >> 10) & 1) << 8
                    | ((o >> 6) & 1) << 7
                    | ((o >> 7) & 1) << 6
                    | ((o >> 1) & 7) << 3
                    | ((o >> 5) & 1) << 2;
            }
            0
        }
        Op::Jalr => {
            let lr = match int_reg_num(&p.to) {
                Some(lr) => lr,
                None => return 0,
            };
            let from = match int_reg_num(&p.from3) {
                Some(from) => from,
                None => return 0,
            };
            if const_offset(&p.from) == Some(0) && from != 0 && (lr == 0 || lr == 1) {
                // C.JR / C.JALR
                return 0x8002 | (lr as u16) << 12 | (from as u16) << 7;
            }
            0
        }
        Op::Beq | Op::Bne => {
            let rs2 = match p.reg {
                Some(r) if r.is_int() => r.num(),
                _ => return 0,
            };
            let rs1 = match int_reg_num(&p.from) {
                Some(rs1) => rs1,
                None => return 0,
            };
            if (8..=15).contains(&rs1) && rs2 == 0 {
                // Overextended branches must already carry NOCOMPRESS from
                // the branch-extension pass.
                if sizing && p.to == Addr::Branch {
                    return SIZING_PLACEHOLDER;
                }
                let o = match const_offset(&p.to) {
                    Some(o) if imm_fits(o, 9) => o as u16,
                    _ => return 0,
                };
                let opc: u16 = if p.op == Op::Bne { 0xE001 } else { 0xC001 };
                // offset[8|4:3] rs1' offset[7:6|2:1|5]
                return opc
                    | ((o >> 8) & 1) << 12
                    | ((o >> 3) & 3) << 10
                    | ((rs1 as u16) & 7) << 7
                    | ((o >> 6) & 3) << 5
                    | ((o >> 1) & 3) << 3
                    | ((o >> 5) & 1) << 2;
            }
            0
        }

        // Integer constant-generation and register-immediate operations
        Op::Addi => {
            let (rs1, rd) = match (int_reg_num(&p.from3), int_reg_num(&p.to)) {
                (Some(rs1), Some(rd)) => (rs1, rd),
                _ => return 0,
            };
            let off = match const_offset(&p.from) {
                Some(off) => off,
                None => return 0,
            };
            if rd == Reg::SP.num() && rs1 == rd && off & 15 == 0 && imm_fits(off, 10) {
                // C.ADDI16SP // 011 nzimm[9] 2 nzimm[4|6|8:7|5] 01
                let o = off as u16;
                return 0x6101
                    | ((o >> 9) & 1) << 12
                    | ((o >> 4) & 1) << 6
                    | ((o >> 6) & 1) << 5
                    | ((o >> 7) & 3) << 3
                    | ((o >> 5) & 1) << 2;
            }
            if (8..=15).contains(&rd) && rs1 == Reg::SP.num() && off > 0 && off < 1024 && off & 3 == 0 {
                // C.ADDI4SPN // 000 nzuimm[5:4|9:6|2|3] rd' 00
                let o = off as u16;
                return ((o >> 4) & 3) << 11
                    | ((o >> 6) & 15) << 7
                    | ((o >> 2) & 1) << 6
                    | ((o >> 3) & 1) << 5
                    | ((rd as u16) & 7) << 2;
            }
            if rs1 == rd && rs1 != 0 && off != 0 && imm_fits(off, 6) {
                // C.ADDI // 000 nzimm[5] rs1/rd!=0 nzimm[4:0] 01
                let o = off as u16;
                return 0x0001 | ((o >> 5) & 1) << 12 | (rd as u16) << 7 | (o & 31) << 2;
            }
            if rs1 == 0 && rd == 0 && off == 0 {
                // C.NOP // 000 0 0 0 01
                return 0x0001;
            }
            if rs1 == 0 && rd != 0 && imm_fits(off, 6) {
                // C.LI // 010 imm[5] rd!=0 imm[4:0] 01
                let o = off as u16;
                return 0x4001 | ((o >> 5) & 1) << 12 | (rd as u16) << 7 | (o & 31) << 2;
            }
            if off == 0 && rs1 != 0 && rd != 0 {
                // C.MV // 100 0 rd!=0 rs2!=0 10
                return 0x8002 | (rd as u16) << 7 | (rs1 as u16) << 2;
            }
            0
        }
        Op::Lui => {
            let rd = match int_reg_num(&p.to) {
                Some(rd) => rd,
                None => return 0,
            };
            let off = match const_offset(&p.from) {
                Some(off) => off,
                None => return 0,
            };
            if rd != 0 && rd != 2 && imm_fits(off, 6) {
                // C.LUI // 011 nzimm[17] rd!={0,2} nzimm[16:12] 01
                let o = off as u16;
                return 0x6001 | ((o >> 5) & 1) << 12 | (rd as u16) << 7 | (o & 31) << 2;
            }
            0
        }
        Op::Addiw => {
            let (rs1, rd) = match (int_reg_num(&p.from3), int_reg_num(&p.to)) {
                (Some(rs1), Some(rd)) => (rs1, rd),
                _ => return 0,
            };
            let off = match const_offset(&p.from) {
                Some(off) => off,
                None => return 0,
            };
            if rs1 == rd && rs1 != 0 && imm_fits(off, 6) {
                // C.ADDIW // 001 imm[5] rs1/rd!=0 imm[4:0] 01
                let o = off as u16;
                return 0x2001 | ((o >> 5) & 1) << 12 | (rd as u16) << 7 | (o & 31) << 2;
            }
            0
        }
        Op::Andi => {
            let (rs1, rd) = match (int_reg_num(&p.from3), int_reg_num(&p.to)) {
                (Some(rs1), Some(rd)) => (rs1, rd),
                _ => return 0,
            };
            let off = match const_offset(&p.from) {
                Some(off) => off,
                None => return 0,
            };
            if rs1 == rd && (8..=15).contains(&rd) && imm_fits(off, 6) {
                // C.ANDI // 100 imm[5] 10 rs1'/rd' imm[4:0] 01
                let o = off as u16;
                return 0x8801 | ((o >> 5) & 1) << 12 | ((rd as u16) & 7) << 7 | (o & 31) << 2;
            }
            0
        }
        Op::Srli | Op::Srai => {
            let (rs1, rd) = match (int_reg_num(&p.from3), int_reg_num(&p.to)) {
                (Some(rs1), Some(rd)) => (rs1, rd),
                _ => return 0,
            };
            let off = match const_offset(&p.from) {
                Some(off) => off,
                None => return 0,
            };
            if rs1 == rd && (8..=15).contains(&rd) && off > 0 && off < 64 {
                // C.SRLI // 100 nzuimm[5] 00 rs1'/rd' nzuimm[4:0] 01
                // C.SRAI // 100 nzuimm[5] 01 rs1'/rd' nzuimm[4:0] 01
                let opc: u16 = if p.op == Op::Srai { 0x8401 } else { 0x8001 };
                let o = off as u16;
                return opc | ((o >> 5) & 1) << 12 | ((rd as u16) & 7) << 7 | (o & 31) << 2;
            }
            0
        }
        Op::Slli => {
            let (rs1, rd) = match (int_reg_num(&p.from3), int_reg_num(&p.to)) {
                (Some(rs1), Some(rd)) => (rs1, rd),
                _ => return 0,
            };
            let off = match const_offset(&p.from) {
                Some(off) => off,
                None => return 0,
            };
            if rs1 == rd && rs1 != 0 && off > 0 && off < 64 {
                // C.SLLI // 000 nzuimm[5] rd!=0 nzuimm[4:0] 10
                let o = off as u16;
                return 0x0002 | ((o >> 5) & 1) << 12 | (rd as u16) << 7 | (o & 31) << 2;
            }
            0
        }

        // Integer register-register operations (MV is generated as ADDI)
        Op::Add => {
            let (rs1, rs2, rd) =
                match (int_reg_num(&p.from3), int_reg_num(&p.from), int_reg_num(&p.to)) {
                    (Some(rs1), Some(rs2), Some(rd)) => (rs1, rs2, rd),
                    _ => return 0,
                };
            if rd == rs1 && rd != 0 && rs2 != 0 {
                // C.ADD // 100 1 rd!=0 rs2!=0 10
                return 0x9002 | (rd as u16) << 7 | (rs2 as u16) << 2;
            }
            0
        }
        Op::And | Op::Or | Op::Xor | Op::Sub | Op::Addw | Op::Subw => {
            let (rs1, rs2, rd) =
                match (int_reg_num(&p.from3), int_reg_num(&p.from), int_reg_num(&p.to)) {
                    (Some(rs1), Some(rs2), Some(rd)) => (rs1, rs2, rd),
                    _ => return 0,
                };
            if rd == rs1 && (8..=15).contains(&rd) && (8..=15).contains(&rs2) {
                // C.AND  // 100 0 11 rs1'/rd' 11 rs2' 01
                // C.OR   // 100 0 11 rs1'/rd' 10 rs2' 01
                // C.XOR  // 100 0 11 rs1'/rd' 01 rs2' 01
                // C.SUB  // 100 0 11 rs1'/rd' 00 rs2' 01
                // C.ADDW // 100 1 11 rs1'/rd' 01 rs2' 01
                // C.SUBW // 100 1 11 rs1'/rd' 00 rs2' 01
                let opc: u16 = match p.op {
                    Op::And => 0x8C61,
                    Op::Or => 0x8C41,
                    Op::Xor => 0x8C21,
                    Op::Sub => 0x8C01,
                    Op::Addw => 0x9C21,
                    Op::Subw => 0x9C01,
                    _ => unreachable!(),
                };
                return opc | ((rd as u16) & 7) << 7 | ((rs2 as u16) & 7) << 2;
            }
            0
        }

        Op::Ebreak => 0x9002,

        _ => 0,
    }
}
