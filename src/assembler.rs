// assembler.rs
//
// Core assembly pipeline functions shared between the compiler driver and
// tests: per-Prog normalization, per-symbol preprocessing, and the final
// emission pass that turns the Prog list into bytes and relocations.

use crate::encoder::{encode, prog_length};
use crate::encoder_compressed::compress;
use crate::prog::{Addr, Ctxt, LSym, Mark, Reloc, RelocKind};
use crate::preprocess::preprocess;
use crate::progedit::progedit;
use crate::riscv::Op;
use log::debug;

/// Run one symbol through the full backend pipeline: normalize every Prog,
/// run the per-symbol passes, then emit machine code and relocations into
/// the symbol.
///
/// If any diagnostic is reported, emission is skipped; the caller inspects
/// the context for the collected diagnostics.
pub fn assemble_symbol(ctxt: &mut Ctxt, sym: &mut LSym) {
    for id in sym.func.ids() {
        progedit(ctxt, sym.func.get_mut(id));
    }

    preprocess(ctxt, sym);
    if ctxt.has_errors() {
        debug!("{}: skipping emission after diagnostics", sym.name);
        return;
    }

    assemble(ctxt, sym);
}

/// Emit machine code. Called at the very end of the assembly process, when
/// every Prog is a concrete instruction with a resolved pc.
pub fn assemble(ctxt: &mut Ctxt, sym: &mut LSym) {
    // Machine code for this symbol, in 16-bit little-endian parcels.
    let mut symcode: Vec<u16> = Vec::new();

    for id in sym.func.ids() {
        match sym.func.get(id).op {
            Op::Jal => {
                // A short CALL/JMP to a symbol; it may need a trampoline to
                // reach the full text segment.
                let p = sym.func.get(id);
                if let Addr::Const { offset, sym: Some(target) } = &p.to {
                    sym.relocs.push(Reloc {
                        off: p.pc as i32,
                        size: 4,
                        kind: RelocKind::CallRiscv1,
                        sym: target.clone(),
                        add: *offset,
                        done: false,
                    });
                }
            }
            Op::Auipc => {
                let p = sym.func.get(id);
                let kind = if p.mark.contains(Mark::NEED_PCREL_ITYPE_RELOC) {
                    Some(RelocKind::PcrelItype)
                } else if p.mark.contains(Mark::NEED_PCREL_STYPE_RELOC) {
                    Some(RelocKind::PcrelStype)
                } else if p.mark.contains(Mark::NEED_CALL_RELOC2) {
                    Some(RelocKind::CallRiscv2)
                } else {
                    None
                };
                if let Some(kind) = kind {
                    if p.link.is_none() {
                        ctxt.diag(
                            "AUIPC needing PC-relative reloc missing following instruction"
                                .to_string(),
                        );
                    } else if p.from.const_sym().is_none() {
                        ctxt.diag("AUIPC needing PC-relative reloc missing symbol".to_string());
                    } else {
                        let off = p.pc as i32;
                        let (add, target) = match &p.from {
                            Addr::Const { offset, sym: Some(s) } => (*offset, s.clone()),
                            _ => unreachable!(),
                        };
                        sym.relocs.push(Reloc {
                            off,
                            size: 8,
                            kind,
                            sym: target,
                            add,
                            done: false,
                        });
                        // The relocation addend can be larger than the
                        // maximum size of an AUIPC immediate, so don't
                        // accidentally assemble it.
                        sym.func.get_mut(id).from = Addr::con(0);
                    }
                }
            }
            _ => {}
        }

        let p = sym.func.get(id);
        let code = compress(ctxt.config, p, false);
        if code != 0 {
            symcode.push(code);
        } else if prog_length(p) > 0 {
            let word = encode(p);
            // Parcels are always little-endian, even on big-endian hosts.
            symcode.push(word as u16);
            symcode.push((word >> 16) as u16);
        }
    }

    sym.size = 2 * symcode.len() as i64;
    sym.p = Vec::with_capacity(symcode.len() * 2);
    for parcel in &symcode {
        sym.p.extend_from_slice(&parcel.to_le_bytes());
    }
    debug!(
        "{}: emitted {} bytes, {} reloc(s)",
        sym.name,
        sym.size,
        sym.relocs.len()
    );
}
