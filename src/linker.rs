// linker.rs
//
// Link-time PC-relative resolution and trampolining
//
// The linker owns final addresses. During layout it calls trampoline for
// each direct-call relocation, retargeting calls whose destination fell
// outside the JAL range at a nearby 2-instruction stub; during final emit
// it calls archreloc to patch the immediate fields of the raw instruction
// words. Both operate over a minimal placed-symbol table; object-file and
// segment bookkeeping stay with the caller.

use crate::encoder::{
    encode_i_immediate, encode_s_immediate, encode_u_immediate, encode_uj_immediate,
    split_32bit_immediate, ITYPE_IMM_MASK, STYPE_IMM_MASK, UJTYPE_IMM_MASK, UTYPE_IMM_MASK,
};
use crate::error::{AsmError, Result};
use crate::prog::{Reloc, RelocKind};
use log::debug;
use std::collections::HashMap;

/// A placed (or not-yet-placed) symbol as the link stage sees it.
#[derive(Debug, Clone, Default)]
pub struct LinkSym {
    pub name: String,
    /// Final address; 0 means not yet laid out.
    pub value: i64,
    pub size: i64,
    pub p: Vec<u8>,
    pub relocs: Vec<Reloc>,
    /// Imported from another module; never reused as a trampoline.
    pub dynimport: bool,
    /// Generated by trampoline insertion.
    pub is_trampoline: bool,
}

/// Symbol table for the link stage.
#[derive(Debug, Default)]
pub struct LinkCtxt {
    syms: Vec<LinkSym>,
    by_name: HashMap<String, usize>,
    /// Trampolines created during layout, in creation order, for the
    /// caller to place after the current function.
    pub new_trampolines: Vec<String>,
}

impl LinkCtxt {
    pub fn new() -> LinkCtxt {
        LinkCtxt::default()
    }

    /// Find or create the symbol with the given name.
    pub fn lookup(&mut self, name: &str) -> usize {
        if let Some(&i) = self.by_name.get(name) {
            return i;
        }
        let i = self.syms.len();
        self.syms.push(LinkSym { name: name.to_string(), ..LinkSym::default() });
        self.by_name.insert(name.to_string(), i);
        i
    }

    pub fn get(&self, i: usize) -> &LinkSym {
        &self.syms[i]
    }

    pub fn get_mut(&mut self, i: usize) -> &mut LinkSym {
        &mut self.syms[i]
    }

    pub fn find(&self, name: &str) -> Option<&LinkSym> {
        self.by_name.get(name).map(|&i| &self.syms[i])
    }

    /// Address of a symbol; 0 if unknown or unplaced.
    pub fn symaddr(&self, name: &str) -> i64 {
        self.find(name).map(|s| s.value).unwrap_or(0)
    }
}

/// Check whether a direct jump at pc can reach addr.
fn jump_in_range(pc: i64, addr: i64) -> bool {
    let off = addr - pc;
    (-(1 << 20)..1 << 20).contains(&off)
}

/// Convert the direct jump relocation r, belonging to a symbol placed at
/// sym_value, to refer to a trampoline if the target is too far.
///
/// Existing trampolines for the same target are looked up first; one
/// within direct-call range (or not yet placed, in which case it lands
/// right after the current function) is reused, otherwise a fresh one is
/// generated.
pub fn trampoline(ctxt: &mut LinkCtxt, sym_value: i64, r: &mut Reloc) -> Result<()> {
    if r.kind != RelocKind::CallRiscv1 {
        return Err(AsmError::reloc(format!(
            "trampoline called with non-jump reloc: {:?}",
            r.kind
        )));
    }

    let pc = sym_value + i64::from(r.off);
    if jump_in_range(pc, ctxt.symaddr(&r.sym) + r.add) {
        return Ok(());
    }

    // If a previously reused trampoline is now too far, start fresh from
    // its original target.
    if let Some(t) = ctxt.find(&r.sym) {
        if t.is_trampoline {
            let first = t.relocs.first().ok_or_else(|| {
                AsmError::internal(format!("trampoline {} has no target reloc", t.name))
            })?;
            r.add = first.add;
            r.sym = first.sym.clone();
        }
    }

    // Direct call too far; look for a reusable trampoline, numbering up
    // from zero, and create one if none fits.
    let mut i = 0;
    let tramp = loop {
        let name = format!("{}{:+}-tramp{}", r.sym, r.add, i);
        let idx = ctxt.lookup(&name);
        let t = ctxt.get(idx);
        if t.dynimport {
            // Don't reuse a trampoline defined in another module.
            i += 1;
            continue;
        }
        if t.value == 0 {
            // Either the trampoline does not exist yet, or it exists but
            // has no assigned address; it will be laid down immediately
            // after the current function, so it is in range.
            break idx;
        }
        if jump_in_range(pc, t.value) {
            break idx;
        }
        i += 1;
    };

    if ctxt.get(tramp).p.is_empty() {
        let target = r.sym.clone();
        let add = r.add;
        gentramp(ctxt.get_mut(tramp), &target, add);
        let name = ctxt.get(tramp).name.clone();
        debug!("created trampoline {} at distance {}", name, ctxt.symaddr(&target) + add - pc);
        ctxt.new_trampolines.push(name);
    }

    // Retarget the reloc at the trampoline; it resolves later.
    r.sym = ctxt.get(tramp).name.clone();
    r.add = 0;
    r.done = false;
    Ok(())
}

/// Fill in a trampoline body: a jump to target+offset with no PLT
/// indirection.
fn gentramp(tramp: &mut LinkSym, target: &str, offset: i64) {
    tramp.size = 8; // 2 instructions
    let o1: u32 = 0x00000f97; // AUIPC T6, 0
    let o2: u32 = 0x000f8067; // JR    T6
    tramp.p.clear();
    tramp.p.extend_from_slice(&o1.to_le_bytes());
    tramp.p.extend_from_slice(&o2.to_le_bytes());
    tramp.is_trampoline = true;

    tramp.relocs.push(Reloc {
        off: 0,
        size: 8,
        kind: RelocKind::CallRiscv2,
        sym: target.to_string(),
        add: offset,
        done: false,
    });
}

/// Apply relocation r for a symbol placed at sym_value. val holds the raw
/// instruction words being patched: one 4-byte instruction for a direct
/// jump, or an AUIPC pair with the AUIPC in the low half. Returns the
/// patched words.
pub fn archreloc(ctxt: &LinkCtxt, r: &Reloc, sym_value: i64, val: i64) -> Result<i64> {
    let pc = sym_value + i64::from(r.off);
    let off = ctxt.symaddr(&r.sym) + r.add - pc;

    match r.kind {
        RelocKind::PcrelItype | RelocKind::PcrelStype | RelocKind::CallRiscv2 => {
            // Generate the AUIPC and second-instruction immediates.
            let (low, high) = split_32bit_immediate(off).map_err(|_| {
                AsmError::reloc(format!(
                    "PC-relative relocation for {} does not fit in 32 bits: {}",
                    r.sym, off
                ))
            })?;

            let auipc_imm = encode_u_immediate(high)?;
            let (second_imm, second_imm_mask) = match r.kind {
                RelocKind::PcrelStype => (encode_s_immediate(low)?, STYPE_IMM_MASK),
                _ => (encode_i_immediate(low)?, ITYPE_IMM_MASK),
            };

            let auipc = val as u32;
            let second = (val >> 32) as u32;

            let auipc = (auipc & !UTYPE_IMM_MASK) | auipc_imm as u32;
            let second = (second & !second_imm_mask) | second_imm as u32;

            Ok((second as i64) << 32 | auipc as i64)
        }
        RelocKind::CallRiscv1 => {
            // Always a JAL instruction; just replace the immediate.
            if off & 1 != 0 {
                return Err(AsmError::reloc(format!(
                    "direct-call relocation for {} is not aligned: {:#x}",
                    r.sym, off
                )));
            }
            // Anything larger should have resulted in a trampoline.
            let imm = encode_uj_immediate(off).map_err(|_| {
                AsmError::reloc(format!(
                    "cannot encode direct-call relocation offset for {}: {:#x}",
                    r.sym, off
                ))
            })?;
            Ok((val & !(UJTYPE_IMM_MASK as i64)) | imm as i64)
        }
    }
}
