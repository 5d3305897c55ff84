// progedit.rs
//
// Per-Prog normalization
//
// progedit is called individually for each Prog, before any per-symbol
// pass runs. It normalizes instruction formats and eliminates as many
// pseudoinstructions as it can without seeing the rest of the function:
// dyadic forms are expanded to the triadic internal form, constant
// operands select the immediate opcode, and the parser's swapped JAL/JALR
// operand slots are repaired.

use crate::prog::{Addr, Ctxt, Name, Prog};
use crate::riscv::{inst_desc, Op, Reg};

/// Normalize a JALR.
///
/// JALR arrives parsed like JAL: the linkage pointer in from and the
/// target in to. It assembles as an I-type instruction, so rotate the
/// slots: the offset goes in from, the target register in from3, and the
/// linkage pointer in to.
pub(crate) fn lower_jalr(p: &mut Prog) {
    if p.op != Op::Jalr {
        panic!("lower_jalr: not a JALR: {}", p);
    }

    let link = std::mem::replace(&mut p.from, Addr::None);
    let target = std::mem::replace(&mut p.to, Addr::None);

    let (offset, base) = match &target {
        Addr::Reg(r) => (0, Some(*r)),
        Addr::Mem { base, offset, .. } => (*offset, Some(*base)),
        Addr::Const { offset, .. } => (*offset, None),
        _ => (0, None),
    };
    p.from = Addr::con(offset);
    p.from3 = match base {
        Some(r) => Addr::Reg(r),
        None => Addr::None,
    };
    p.to = link;
}

/// Normalize one Prog. Rewrites that change the instruction count are
/// deferred to preprocessing; everything here is in-place.
pub fn progedit(ctxt: &mut Ctxt, p: &mut Prog) {
    // Expand binary instructions to ternary ones.
    if p.from3 == Addr::None {
        match p.op {
            Op::Add | Op::Sub | Op::Sll | Op::Xor | Op::Srl | Op::Sra | Op::Or | Op::And
            | Op::Mul | Op::Mulh | Op::Mulhu | Op::Mulhsu | Op::Mulw | Op::Div | Op::Divu
            | Op::Rem | Op::Remu | Op::Divw | Op::Divuw | Op::Remw | Op::Remuw | Op::Addw => {
                if let Addr::Reg(r) = p.to {
                    p.from3 = Addr::Reg(r);
                }
            }
            _ => {}
        }
    }

    // Rewrite instructions with constant operands to refer to the
    // immediate form of the instruction.
    if matches!(p.from, Addr::Const { .. }) {
        match p.op {
            Op::Add => p.op = Op::Addi,
            Op::And => p.op = Op::Andi,
            Op::Or => p.op = Op::Ori,
            Op::Sll => p.op = Op::Slli,
            Op::Slt => p.op = Op::Slti,
            Op::Sltu => p.op = Op::Sltiu,
            Op::Sra => p.op = Op::Srai,
            Op::Srl => p.op = Op::Srli,
            Op::Xor => p.op = Op::Xori,
            _ => {}
        }
    }

    // Do additional single-instruction rewriting.
    match p.op {
        // Turn JMP into JAL ZERO or JALR ZERO.
        Op::Jmp => {
            // from is actually an output for this instruction.
            p.from = Addr::Reg(Reg::ZERO);
            match &p.to {
                Addr::Branch => p.op = Op::Jal,
                Addr::Mem { name, .. } => match name {
                    Name::Auto | Name::Param | Name::None => {
                        p.op = Op::Jalr;
                        lower_jalr(p);
                    }
                    // Handled in preprocess.
                    Name::Extern => {}
                    _ => ctxt.diag(format!("progedit: unsupported name for {}", p)),
                },
                other => panic!("progedit: unhandled JMP target {:?}", other),
            }
        }

        Op::Call => match &p.to {
            // Handled in preprocess.
            Addr::Mem { .. } => {}
            Addr::Reg(_) => {
                p.op = Op::Jalr;
                p.from = Addr::Reg(Reg::RA);
                lower_jalr(p);
            }
            other => ctxt.diag(format!("progedit: unknown destination type {:?} in CALL: {}", other, p)),
        },

        Op::Jalr => lower_jalr(p),

        Op::Undef | Op::Ecall | Op::Ebreak | Op::Scall | Op::Rdcycle | Op::Rdtime | Op::Rdinstret => {
            if p.op == Op::Undef {
                p.op = Op::Ebreak;
            }
            // SCALL is the old name for ECALL.
            if p.op == Op::Scall {
                p.op = Op::Ecall;
            }

            let i = match inst_desc(p.op) {
                Some(i) => i,
                None => panic!("progedit: tried to rewrite nonexistent instruction {:?}", p.op),
            };
            // The CSR isn't exactly an offset, but it winds up in the
            // immediate area of the encoded instruction, so record it in
            // the offset field.
            p.from = Addr::con(i.csr);
            p.from3 = Addr::Reg(Reg::ZERO);
            if p.to == Addr::None {
                p.to = Addr::Reg(Reg::ZERO);
            }
        }

        Op::Seqz => {
            // SEQZ rs, rd -> SLTIU $1, rs, rd
            p.op = Op::Sltiu;
            p.from3 = std::mem::replace(&mut p.from, Addr::con(1));
        }

        Op::Snez => {
            // SNEZ rs, rd -> SLTU rs, x0, rd
            p.op = Op::Sltu;
            p.from3 = Addr::Reg(Reg::ZERO);
        }

        // For binary float instructions, use from3 and to, not from and
        // to. This helps simplify encoding.
        Op::Fnegs => {
            // FNEGS rs, rd -> FSGNJNS rs, rs, rd
            p.op = Op::Fsgnjns;
            p.from3 = p.from.clone();
        }
        Op::Fnegd => {
            // FNEGD rs, rd -> FSGNJND rs, rs, rd
            p.op = Op::Fsgnjnd;
            p.from3 = p.from.clone();
        }
        Op::Fsqrts | Op::Fsqrtd => {
            // This instruction expects a zero (i.e., float register 0) to
            // be the second input operand.
            p.from3 = std::mem::replace(&mut p.from, Addr::Reg(Reg::F0));
        }
        Op::Fcvtws | Op::Fcvtls | Op::Fcvtwus | Op::Fcvtlus | Op::Fcvtwd | Op::Fcvtld
        | Op::Fcvtwud | Op::Fcvtlud => {
            // Set the rounding mode in funct3 to round toward zero.
            p.scond = 1;
        }

        _ => {}
    }
}
