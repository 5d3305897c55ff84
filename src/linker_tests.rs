// linker_tests.rs
//
// Tests for trampoline insertion and link-time relocation application.

use crate::linker::{archreloc, trampoline, LinkCtxt};
use crate::prog::{Reloc, RelocKind};

fn call_reloc(off: i32, target: &str) -> Reloc {
    Reloc {
        off,
        size: 4,
        kind: RelocKind::CallRiscv1,
        sym: target.to_string(),
        add: 0,
        done: false,
    }
}

#[test]
fn in_range_call_is_left_alone() {
    let mut ctxt = LinkCtxt::new();
    let b = ctxt.lookup("B");
    ctxt.get_mut(b).value = 0x8000;

    let mut r = call_reloc(0, "B");
    trampoline(&mut ctxt, 0x1000, &mut r).unwrap();
    assert_eq!(r.sym, "B");
    assert!(ctxt.new_trampolines.is_empty());
}

#[test]
fn far_call_gets_a_trampoline() {
    let mut ctxt = LinkCtxt::new();
    let b = ctxt.lookup("B");
    ctxt.get_mut(b).value = 1 << 22;

    // Function A at address 0 contains CALL B.
    let mut r = call_reloc(0, "B");
    trampoline(&mut ctxt, 0, &mut r).unwrap();

    assert_eq!(r.sym, "B+0-tramp0");
    assert_eq!(r.add, 0);

    let tramp = ctxt.find("B+0-tramp0").expect("trampoline should exist");
    assert_eq!(tramp.size, 8);
    // auipc t6, 0 ; jr t6
    assert_eq!(tramp.p, vec![0x97, 0x0f, 0x00, 0x00, 0x67, 0x80, 0x0f, 0x00]);
    assert_eq!(tramp.relocs.len(), 1);
    assert_eq!(tramp.relocs[0].kind, RelocKind::CallRiscv2);
    assert_eq!(tramp.relocs[0].size, 8);
    assert_eq!(tramp.relocs[0].sym, "B");
    assert_eq!(ctxt.new_trampolines, vec!["B+0-tramp0".to_string()]);
}

#[test]
fn nearby_trampoline_is_reused() {
    let mut ctxt = LinkCtxt::new();
    let b = ctxt.lookup("B");
    ctxt.get_mut(b).value = 1 << 22;

    let mut r1 = call_reloc(0, "B");
    trampoline(&mut ctxt, 0, &mut r1).unwrap();
    // Place the trampoline near both callers.
    let t = ctxt.lookup("B+0-tramp0");
    ctxt.get_mut(t).value = 0x2000;

    let mut r2 = call_reloc(0, "B");
    trampoline(&mut ctxt, 0x1000, &mut r2).unwrap();
    assert_eq!(r2.sym, "B+0-tramp0");
    // Only the first call created one.
    assert_eq!(ctxt.new_trampolines.len(), 1);
}

#[test]
fn out_of_range_trampoline_is_not_reused() {
    let mut ctxt = LinkCtxt::new();
    let b = ctxt.lookup("B");
    ctxt.get_mut(b).value = 1 << 30;

    let mut r1 = call_reloc(0, "B");
    trampoline(&mut ctxt, 0, &mut r1).unwrap();
    let t0 = ctxt.lookup("B+0-tramp0");
    ctxt.get_mut(t0).value = 0x2000;

    // A caller 512 MiB away cannot reach tramp0; it gets its own.
    let far_caller = 1 << 29;
    let mut r2 = call_reloc(0, "B");
    trampoline(&mut ctxt, far_caller, &mut r2).unwrap();
    assert_eq!(r2.sym, "B+0-tramp1");
    assert_eq!(ctxt.new_trampolines.len(), 2);
}

#[test]
fn retargeted_reloc_that_fell_out_of_range_restarts() {
    let mut ctxt = LinkCtxt::new();
    let b = ctxt.lookup("B");
    ctxt.get_mut(b).value = 1 << 22;

    let mut r = call_reloc(0, "B");
    trampoline(&mut ctxt, 0, &mut r).unwrap();
    assert_eq!(r.sym, "B+0-tramp0");

    // Layout moved the trampoline out of this caller's reach; the reloc
    // must fall back to the original target and find another stub.
    let t0 = ctxt.lookup("B+0-tramp0");
    ctxt.get_mut(t0).value = 1 << 24;
    trampoline(&mut ctxt, 0, &mut r).unwrap();
    assert_eq!(r.sym, "B+0-tramp1");
    let t1 = ctxt.find("B+0-tramp1").unwrap();
    assert_eq!(t1.relocs[0].sym, "B");
}

#[test]
fn dynimport_trampoline_names_are_skipped() {
    let mut ctxt = LinkCtxt::new();
    let b = ctxt.lookup("B");
    ctxt.get_mut(b).value = 1 << 22;
    // A same-named symbol imported from another module must not be reused.
    let foreign = ctxt.lookup("B+0-tramp0");
    ctxt.get_mut(foreign).dynimport = true;

    let mut r = call_reloc(0, "B");
    trampoline(&mut ctxt, 0, &mut r).unwrap();
    assert_eq!(r.sym, "B+0-tramp1");
}

#[test]
fn trampoline_rejects_other_reloc_kinds() {
    let mut ctxt = LinkCtxt::new();
    let mut r = call_reloc(0, "B");
    r.kind = RelocKind::PcrelItype;
    assert!(trampoline(&mut ctxt, 0, &mut r).is_err());
}

// ==============================================================================
// Relocation application
// ==============================================================================

#[test]
fn direct_call_patches_uj_immediate() {
    let mut ctxt = LinkCtxt::new();
    let b = ctxt.lookup("B");
    ctxt.get_mut(b).value = 0x1800;

    // jal ra, 0 assembled at pc 0x1000; offset to B is 0x800.
    let r = call_reloc(0, "B");
    let val = 0x000000EF_i64;
    let patched = archreloc(&ctxt, &r, 0x1000, val).unwrap();
    // 0x800: imm[11] = 1 -> bit 20 of the word.
    assert_eq!(patched, 0x001000EF);
}

#[test]
fn direct_call_rejects_unreachable_targets() {
    let mut ctxt = LinkCtxt::new();
    let b = ctxt.lookup("B");
    ctxt.get_mut(b).value = 1 << 22;
    let r = call_reloc(0, "B");
    assert!(archreloc(&ctxt, &r, 0, 0x000000EF).is_err());

    // Odd displacements are rejected too.
    let b = ctxt.lookup("B");
    ctxt.get_mut(b).value = 0x1001;
    let r = call_reloc(0, "B");
    assert!(archreloc(&ctxt, &r, 0, 0x000000EF).is_err());
}

#[test]
fn call2_patches_auipc_pair() {
    let mut ctxt = LinkCtxt::new();
    let b = ctxt.lookup("B");
    ctxt.get_mut(b).value = 0x400000;

    // Trampoline at 0x2000: auipc t6, 0 ; jr t6.
    let r = Reloc {
        off: 0,
        size: 8,
        kind: RelocKind::CallRiscv2,
        sym: "B".to_string(),
        add: 0,
        done: false,
    };
    let val = (0x000F8067_i64) << 32 | 0x00000F97;
    let patched = archreloc(&ctxt, &r, 0x2000, val).unwrap();

    // offset 0x3FE000 splits into high 0x3FE, low 0.
    let auipc = patched as u32;
    let second = (patched >> 32) as u32;
    assert_eq!(auipc, 0x003FEF97);
    assert_eq!(second, 0x000F8067);
}

#[test]
fn pcrel_itype_patches_low_half_into_second_word() {
    let mut ctxt = LinkCtxt::new();
    let v = ctxt.lookup("v");
    ctxt.get_mut(v).value = 0x2345;

    // auipc x5, 0 ; lw x5, 0(x5) at pc 0x1000.
    let r = Reloc {
        off: 0,
        size: 8,
        kind: RelocKind::PcrelItype,
        sym: "v".to_string(),
        add: 0,
        done: false,
    };
    let val = (0x0002A283_i64) << 32 | 0x00000297;
    let patched = archreloc(&ctxt, &r, 0x1000, val).unwrap();

    // offset 0x1345: high 0x1, low 0x345.
    assert_eq!(patched as u32, 0x00001297);
    assert_eq!((patched >> 32) as u32, 0x3452A283);
}

#[test]
fn pcrel_stype_patches_store_fields() {
    let mut ctxt = LinkCtxt::new();
    let v = ctxt.lookup("v");
    ctxt.get_mut(v).value = 0x1345;

    // auipc x31, 0 ; sw x6, 0(x31) at pc 0x1000; offset 0x345.
    let r = Reloc {
        off: 0,
        size: 8,
        kind: RelocKind::PcrelStype,
        sym: "v".to_string(),
        add: 0,
        done: false,
    };
    let val = (0x006FA023_i64) << 32 | 0x00000F97;
    let patched = archreloc(&ctxt, &r, 0x1000, val).unwrap();

    // 0x345 = 0b0110100_0101: imm[11:5] = 0x1A in bits 31:25, imm[4:0] =
    // 0x05 in bits 11:7.
    assert_eq!(patched as u32, 0x00000F97);
    assert_eq!((patched >> 32) as u32, 0x346FA2A3);
}

#[test]
fn negative_pcrel_offsets_sign_extend() {
    let mut ctxt = LinkCtxt::new();
    // Target behind the pair, just past the 12-bit reach.
    let v = ctxt.lookup("v");
    ctxt.get_mut(v).value = 0x7FF;
    let r = Reloc {
        off: 0,
        size: 8,
        kind: RelocKind::PcrelItype,
        sym: "v".to_string(),
        add: 0,
        done: false,
    };
    let val = (0x0002A283_i64) << 32 | 0x00000297;
    let patched = archreloc(&ctxt, &r, 0x1000, val).unwrap();

    // offset -0x801: low 0x7FF (2047), high -1.
    // auipc imm -1 = 0xFFFFF in the U field.
    assert_eq!(patched as u32, 0xFFFFF297);
    // I-type imm 0x7FF at bits 31:20.
    assert_eq!((patched >> 32) as u32, 0x7FF2A283);
}
