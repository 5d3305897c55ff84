// encoder.rs
//
// RISC-V instruction encoder
//
// This module packs validated Progs into 32-bit machine words, one
// encode+validate pair per instruction format (R/I/S/SB/U/UJ plus the raw
// AWORD escape hatch). Validation reports through the context's diagnostic
// sink; encoding assumes validation already ran and treats ill-typed
// operands as internal errors.
//
// The immediate split/encode helpers and field masks at the bottom are
// shared with the link stage, which patches the same fields after final
// addresses are known.

#![allow(clippy::unusual_byte_groupings)]

use crate::error::{AsmError, Result};
use crate::prog::{Addr, Ctxt, Mark, Prog};
use crate::riscv::{inst_desc, Format, InstDesc, Op};

// ==============================================================================
// Immediate fitting and field extraction
// ==============================================================================

/// Check if signed value x fits in nbits bits.
pub fn imm_fits(x: i64, nbits: u32) -> bool {
    let nbits = nbits - 1;
    let min = -1i64 << nbits;
    let max = (1i64 << nbits) - 1;
    min <= x && x <= max
}

/// Sign extend val starting at bit `bit`.
pub fn sign_extend(val: i64, bit: u32) -> i64 {
    let low = val & ((1i64 << bit) - 1);
    let mut out = val >> (bit - 1);
    out <<= 63;
    out >>= 64 - bit;
    out | low
}

/// Extract the integer register of an operand, as its 5-bit field value.
fn regi(a: &Addr) -> u32 {
    let r = a.reg();
    if !r.is_int() {
        panic!("expected integer register, got {}", r);
    }
    r.num()
}

/// Extract the float register of an operand, as its 5-bit field value.
fn regf(a: &Addr) -> u32 {
    let r = a.reg();
    if !r.is_float() {
        panic!("expected float register, got {}", r);
    }
    r.num()
}

/// Extract a constant of at most nbits from an operand.
fn immi(a: &Addr, nbits: u32) -> u32 {
    let offset = a.const_offset();
    if !imm_fits(offset, nbits) {
        panic!("immediate {} cannot fit in {} bits", offset, nbits);
    }
    offset as u32
}

// ==============================================================================
// Validation
// ==============================================================================

fn want_reg(ctxt: &mut Ctxt, p: &Prog, pos: &str, a: &Addr, descr: &str, float: bool) {
    match a {
        Addr::Reg(r) if r.is_float() == float => {}
        Addr::Reg(r) => ctxt.diag(format!(
            "{}: expected {} register in {} position but got non-{} register {}",
            p, descr, pos, descr, r
        )),
        _ => ctxt.diag(format!(
            "{}: expected register in {} position but got {:?}",
            p, pos, a
        )),
    }
}

fn want_int_reg(ctxt: &mut Ctxt, p: &Prog, pos: &str, a: &Addr) {
    want_reg(ctxt, p, pos, a, "integer", false);
}

fn want_float_reg(ctxt: &mut Ctxt, p: &Prog, pos: &str, a: &Addr) {
    want_reg(ctxt, p, pos, a, "float", true);
}

fn want_imm(ctxt: &mut Ctxt, p: &Prog, pos: &str, a: &Addr, nbits: u32) {
    match a {
        Addr::Const { offset, .. } => {
            if !imm_fits(*offset, nbits) {
                ctxt.diag(format!(
                    "{}: immediate in {} position cannot be larger than {} bits but got {}",
                    p, pos, nbits, offset
                ));
            }
        }
        _ => ctxt.diag(format!(
            "{}: expected immediate in {} position but got {:?}",
            p, pos, a
        )),
    }
}

/// Check the immediate of an I-format instruction. CSR selectors occupy
/// the same field as an unsigned number, so opcodes carrying one accept
/// the unsigned 12-bit range as well.
fn want_i_imm(ctxt: &mut Ctxt, p: &Prog) {
    let csr = inst_desc(p.op).map(|d| d.csr).unwrap_or(0);
    if csr != 0 {
        match &p.from {
            Addr::Const { offset, .. } if imm_fits(*offset, 12) || (0..=0xfff).contains(offset) => {}
            a => ctxt.diag(format!(
                "{}: expected 12-bit immediate in from position but got {:?}",
                p, a
            )),
        }
    } else {
        want_imm(ctxt, p, "from", &p.from, 12);
    }
}

/// Branch and jump targets must be 2-byte aligned.
fn want_even_offset(ctxt: &mut Ctxt, p: &Prog) {
    if let Addr::Const { offset, .. } = &p.to {
        if offset % 2 != 0 {
            ctxt.diag(format!("{}: jump offset {} must be even", p, offset));
        }
    }
}

/// Look up the format for a Prog, diagnosing opcodes with no encoding.
pub fn format_for(ctxt: &mut Ctxt, p: &Prog) -> Option<Format> {
    match inst_desc(p.op) {
        Some(d) => Some(d.format),
        None => {
            ctxt.diag(format!("no encoding for instruction {:?}", p.op));
            None
        }
    }
}

/// Byte length of a Prog's uncompressed encoding; opcodes with no encoding
/// contribute nothing (validate reports them).
pub fn prog_length(p: &Prog) -> i64 {
    match inst_desc(p.op) {
        Some(d) => d.format.length(),
        None => 0,
    }
}

/// Validate a Prog against its format. Recoverable problems go to the
/// diagnostic sink; processing continues so one function can surface many
/// errors.
pub fn validate(ctxt: &mut Ctxt, p: &Prog) {
    let format = match format_for(ctxt, p) {
        Some(f) => f,
        None => return,
    };
    match format {
        Format::Riii => {
            want_int_reg(ctxt, p, "from", &p.from);
            want_int_reg(ctxt, p, "from3", &p.from3);
            want_int_reg(ctxt, p, "to", &p.to);
        }
        Format::Rfff => {
            want_float_reg(ctxt, p, "from", &p.from);
            want_float_reg(ctxt, p, "from3", &p.from3);
            want_float_reg(ctxt, p, "to", &p.to);
        }
        Format::Rffi => {
            want_float_reg(ctxt, p, "from", &p.from);
            want_float_reg(ctxt, p, "from3", &p.from3);
            want_int_reg(ctxt, p, "to", &p.to);
        }
        Format::Rfi => {
            want_float_reg(ctxt, p, "from", &p.from);
            want_int_reg(ctxt, p, "to", &p.to);
        }
        Format::Rif => {
            want_int_reg(ctxt, p, "from", &p.from);
            want_float_reg(ctxt, p, "to", &p.to);
        }
        Format::Rff => {
            want_float_reg(ctxt, p, "from", &p.from);
            want_float_reg(ctxt, p, "to", &p.to);
        }
        Format::Ii => {
            want_i_imm(ctxt, p);
            want_int_reg(ctxt, p, "from3", &p.from3);
            want_int_reg(ctxt, p, "to", &p.to);
        }
        Format::If => {
            want_i_imm(ctxt, p);
            want_int_reg(ctxt, p, "from3", &p.from3);
            want_float_reg(ctxt, p, "to", &p.to);
        }
        Format::Si => {
            want_imm(ctxt, p, "from", &p.from, 12);
            want_int_reg(ctxt, p, "from3", &p.from3);
            want_int_reg(ctxt, p, "to", &p.to);
        }
        Format::Sf => {
            want_imm(ctxt, p, "from", &p.from, 12);
            want_float_reg(ctxt, p, "from3", &p.from3);
            want_int_reg(ctxt, p, "to", &p.to);
        }
        Format::Sb => {
            // Offsets are multiples of two, so accept 13-bit immediates for
            // the 12-bit slot; the low bit is implicitly dropped.
            want_even_offset(ctxt, p);
            want_imm(ctxt, p, "to", &p.to, 13);
            want_int_reg(ctxt, p, "from", &p.from);
            match p.reg {
                Some(r) if r.is_int() => {}
                _ => ctxt.diag(format!("{}: branch needs an integer register in reg", p)),
            }
        }
        Format::U => {
            if p.op == Op::Auipc
                && (p.mark.contains(Mark::NEED_PCREL_ITYPE_RELOC)
                    || p.mark.contains(Mark::NEED_PCREL_STYPE_RELOC)
                    || p.mark.contains(Mark::NEED_CALL_RELOC2))
            {
                // The offset temporarily holds the relocation addend, which
                // may exceed the field; emission zeroes it before encoding.
                return;
            }
            want_imm(ctxt, p, "from", &p.from, 20);
            want_int_reg(ctxt, p, "to", &p.to);
        }
        Format::Uj => {
            want_even_offset(ctxt, p);
            want_imm(ctxt, p, "to", &p.to, 21);
            want_int_reg(ctxt, p, "from", &p.from);
        }
        Format::Raw => match &p.from {
            Addr::Const { offset, .. } => {
                if *offset < 0 || *offset >= 1 << 32 {
                    ctxt.diag(format!(
                        "{}: raw word cannot be larger than 32 bits but got {}",
                        p, offset
                    ));
                }
            }
            _ => ctxt.diag(format!("{}: expected immediate in raw position", p)),
        },
        Format::Pseudo => {}
    }
}

// ==============================================================================
// Encoding
// ==============================================================================

fn desc_for(p: &Prog) -> InstDesc {
    match inst_desc(p.op) {
        Some(d) => d,
        None => panic!("encode: no encoding for instruction {:?}", p.op),
    }
}

/// R-type: funct7 | rs2 | rs1 | funct3 | rd | opcode, with Scond ORed into
/// funct3 as the float rounding-mode override.
fn encode_r(p: &Prog, rs1: u32, rs2: u32, rd: u32) -> u32 {
    let i = desc_for(p);
    if i.rs2 != 0 && rs2 != 0 {
        panic!("encode_r: instruction fixes rs2, but operand rs2 was nonzero: {}", p);
    }
    i.funct7 << 25
        | i.rs2 << 20
        | rs2 << 20
        | rs1 << 15
        | i.funct3 << 12
        | (p.scond as u32) << 12
        | rd << 7
        | i.opcode
}

fn encode_i(p: &Prog, rd: u32) -> u32 {
    let i = desc_for(p);
    let offset = p.from.const_offset();
    if !imm_fits(offset, 12) && !(0..=0xfff).contains(&offset) {
        panic!("immediate {} cannot fit in 12 bits", offset);
    }
    // Only the field bits survive the shift, so negative immediates and
    // unsigned CSR selectors pack the same way.
    let mut imm = (offset as u32) & 0xfff;
    let rs1 = regi(&p.from3);
    imm |= i.csr as u32;
    imm << 20 | rs1 << 15 | i.funct3 << 12 | rd << 7 | i.opcode
}

fn encode_s(p: &Prog, rs2: u32) -> u32 {
    let i = desc_for(p);
    let imm = immi(&p.from, 12);
    let rs1 = regi(&p.to);
    (imm >> 5) << 25 | rs2 << 20 | rs1 << 15 | i.funct3 << 12 | (imm & 0x1f) << 7 | i.opcode
}

fn encode_sb(p: &Prog) -> u32 {
    let i = desc_for(p);
    let imm = immi(&p.to, 13);
    let rs2 = match p.reg {
        Some(r) if r.is_int() => r.num(),
        _ => panic!("encode_sb: branch lacks second source register: {}", p),
    };
    let rs1 = regi(&p.from);
    (imm >> 12) << 31
        | ((imm >> 5) & 0x3f) << 25
        | rs2 << 20
        | rs1 << 15
        | i.funct3 << 12
        | ((imm >> 1) & 0xf) << 8
        | ((imm >> 11) & 0x1) << 7
        | i.opcode
}

fn encode_u(p: &Prog) -> u32 {
    // The immediate is already the upper 20 bits of a 32-bit value; accept
    // just the top bits rather than a constant whose bottom 12 bits must
    // all be zero.
    let i = desc_for(p);
    let imm = immi(&p.from, 20);
    let rd = regi(&p.to);
    imm << 12 | rd << 7 | i.opcode
}

fn encode_uj(p: &Prog) -> u32 {
    let i = desc_for(p);
    let imm = encode_uj_immediate_bits(immi(&p.to, 21));
    let rd = regi(&p.from);
    imm | rd << 7 | i.opcode
}

fn encode_raw(p: &Prog) -> u32 {
    let offset = p.from.const_offset();
    if !(0..1 << 32).contains(&offset) {
        panic!("raw word {} cannot fit in 32 bits", offset);
    }
    offset as u32
}

/// Encode a validated Prog into its 32-bit machine word.
///
/// Panics on pseudo-ops and ill-typed operands: by the time this runs, the
/// preprocess passes must have rewritten everything else, and validate has
/// had its chance to complain.
pub fn encode(p: &Prog) -> u32 {
    let format = desc_for(p).format;
    match format {
        Format::Riii => encode_r(p, regi(&p.from3), regi(&p.from), regi(&p.to)),
        Format::Rfff => encode_r(p, regf(&p.from3), regf(&p.from), regf(&p.to)),
        Format::Rffi => encode_r(p, regf(&p.from3), regf(&p.from), regi(&p.to)),
        Format::Rfi => encode_r(p, regf(&p.from), 0, regi(&p.to)),
        Format::Rif => encode_r(p, regi(&p.from), 0, regf(&p.to)),
        Format::Rff => encode_r(p, regf(&p.from), 0, regf(&p.to)),
        Format::Ii => encode_i(p, regi(&p.to)),
        Format::If => encode_i(p, regf(&p.to)),
        Format::Si => encode_s(p, regi(&p.from3)),
        Format::Sf => encode_s(p, regf(&p.from3)),
        Format::Sb => encode_sb(p),
        Format::U => encode_u(p),
        Format::Uj => encode_uj(p),
        Format::Raw => encode_raw(p),
        Format::Pseudo => panic!("encode: attempted to encode directive {:?}", p.op),
    }
}

// ==============================================================================
// Immediate splitting and field encoding, shared with the linker
// ==============================================================================

/// Bits occupied by the I-type immediate.
pub const ITYPE_IMM_MASK: u32 = 0xfff0_0000;
/// Bits occupied by the S-type immediate.
pub const STYPE_IMM_MASK: u32 = 0xfe00_0f80;
/// Bits occupied by the U-type immediate.
pub const UTYPE_IMM_MASK: u32 = 0xffff_f000;
/// Bits occupied by the UJ-type immediate.
pub const UJTYPE_IMM_MASK: u32 = 0xffff_f000;

/// Split a signed 32-bit immediate into a signed 20-bit upper part and a
/// signed 12-bit lower part such that `(high << 12) + low == imm`. high may
/// be used in LUI/AUIPC and low in a following I- or S-format instruction.
pub fn split_32bit_immediate(imm: i64) -> Result<(i64, i64)> {
    if !imm_fits(imm, 32) {
        return Err(AsmError::imm_out_of_range(imm, 32));
    }
    if imm_fits(imm, 12) {
        return Ok((imm, 0));
    }

    let mut high = imm >> 12;
    // The bottom 12 bits are treated as signed; if that would go negative,
    // add 1 to the upper bits to adjust for the borrow. Given the 32-bit
    // precondition the increment cannot overflow 20 bits.
    if imm & (1 << 11) != 0 {
        high += 1;
    }
    let high = sign_extend(high, 20);
    let low = sign_extend(imm, 12);
    Ok((low, high))
}

/// Position a 12-bit immediate in the I-type field.
pub fn encode_i_immediate(imm: i64) -> Result<i64> {
    if !imm_fits(imm, 12) {
        return Err(AsmError::imm_out_of_range(imm, 12));
    }
    Ok(imm << 20)
}

/// Position a 12-bit immediate in the split S-type fields.
pub fn encode_s_immediate(imm: i64) -> Result<i64> {
    if !imm_fits(imm, 12) {
        return Err(AsmError::imm_out_of_range(imm, 12));
    }
    Ok(((imm >> 5) << 25) | ((imm & 0x1f) << 7))
}

/// Position a 20-bit immediate in the U-type field.
pub fn encode_u_immediate(imm: i64) -> Result<i64> {
    if !imm_fits(imm, 20) {
        return Err(AsmError::imm_out_of_range(imm, 20));
    }
    Ok(imm << 12)
}

fn encode_uj_immediate_bits(imm: u32) -> u32 {
    (imm >> 20) << 31 | ((imm >> 1) & 0x3ff) << 21 | ((imm >> 11) & 0x1) << 20 | ((imm >> 12) & 0xff) << 12
}

/// Scramble a 21-bit even immediate into the UJ-type field layout.
pub fn encode_uj_immediate(imm: i64) -> Result<u32> {
    if !imm_fits(imm, 21) {
        return Err(AsmError::imm_out_of_range(imm, 21));
    }
    if imm & 1 != 0 {
        return Err(AsmError::OffsetMisaligned { offset: imm });
    }
    Ok(encode_uj_immediate_bits(imm as u32))
}
