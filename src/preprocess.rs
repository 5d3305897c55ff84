// preprocess.rs
//
// Per-symbol preprocessing
//
// preprocess is called once per function symbol, after every Prog has been
// normalized. It generates the prologue (stack-growth probe, stack
// adjustment, RA save, wrapper panic fixup), resolves stack-based operand
// names, expands the MOV family and the remaining control-flow pseudos,
// splits immediates that do not fit their fields, lays out PCs to a
// fixpoint while extending overextended branches and jumps, emits the
// per-function constant pool, and finally resolves branch targets and
// validates every instruction.
//
// When preprocess finishes, all instructions in the symbol are either
// concrete RISC-V instructions or zero-width directives like TEXT and
// FUNCDATA.

use crate::encoder::{imm_fits, prog_length, split_32bit_immediate, validate};
use crate::encoder_compressed::compress;
use crate::prog::{textflag, Addr, Ctxt, Func, LSym, Mark, Name, ProgId};
use crate::riscv::{Op, Reg};
use log::{debug, trace};

// Stack probe regimes. A frame at most STACK_SMALL below the guard can
// compare SP directly; up to STACK_BIG the adjusted SP still cannot wrap;
// beyond that the probe must do the wraparound-safe computation.
pub const STACK_SMALL: i64 = 128;
pub const STACK_BIG: i64 = 4096;
pub const STACK_GUARD: i64 = 880;
/// Sentinel stored in the stack guard to force a preemption check.
pub const STACK_PREEMPT: i64 = -1314;

/// Space reserved above the locals for the saved RA slot; PARAM offsets
/// skip over it.
const FIXED_FRAME_SIZE: i64 = 8;

/// Calls to the deferred-return thunk have a size known to the runtime's
/// jump-to-defer path, so they are always expanded to the long form.
const DEFERRETURN_SYM: &str = "runtime.deferreturn";

// ==============================================================================
// Small helpers
// ==============================================================================

/// Update an operand's offset based on the current stack size.
///
/// The stack grows down: AUTO offsets are rebased to the top of the locals
/// area, PARAM offsets to the bottom of the arguments, past the saved RA.
fn stack_offset(a: &mut Addr, stacksize: i64) {
    if let Addr::Mem { offset, name, .. } | Addr::AddrOf { offset, name, .. } = a {
        match name {
            Name::Auto => *offset += stacksize,
            Name::Param => *offset += stacksize + FIXED_FRAME_SIZE,
            _ => {}
        }
    }
}

/// Convert a MOV mnemonic into the corresponding load instruction.
fn movtol(op: Op) -> Op {
    match op {
        Op::Mov => Op::Ld,
        Op::Movb => Op::Lb,
        Op::Movh => Op::Lh,
        Op::Movw => Op::Lw,
        Op::Movbu => Op::Lbu,
        Op::Movhu => Op::Lhu,
        Op::Movwu => Op::Lwu,
        Op::Movf => Op::Flw,
        Op::Movd => Op::Fld,
        _ => panic!("movtol: {:?} is not a MOV", op),
    }
}

/// Convert a MOV mnemonic into the corresponding store instruction.
fn movtos(op: Op) -> Op {
    match op {
        Op::Mov => Op::Sd,
        Op::Movb => Op::Sb,
        Op::Movh => Op::Sh,
        Op::Movw => Op::Sw,
        Op::Movf => Op::Fsw,
        Op::Movd => Op::Fsd,
        _ => panic!("movtos: {:?} is not a MOV", op),
    }
}

/// Extract the base register of a memory operand, handling the stack names
/// whose base is implicitly SP.
fn addr_to_reg(a: &Addr) -> Reg {
    match a {
        Addr::Mem { base, name, .. } | Addr::AddrOf { base, name, .. } => match name {
            Name::Auto | Name::Param => Reg::SP,
            _ => *base,
        },
        _ => Reg::ZERO,
    }
}

/// Replace p with a JAL to the symbol in its target, linking through lr.
/// The target stays symbolic; a relocation carries the real address.
fn jalr_to_sym(ctxt: &mut Ctxt, func: &mut Func, id: ProgId, lr: Reg) {
    let p = func.get_mut(id);
    match p.op {
        Op::Call | Op::Jmp | Op::DuffCopy | Op::DuffZero => {}
        _ => {
            let msg = format!("unexpected Prog in jalr_to_sym: {}", p);
            ctxt.diag(msg);
            return;
        }
    }

    let (offset, sym) = match &p.to {
        Addr::Mem { offset, sym, .. } => (*offset, sym.clone()),
        _ => (0, None),
    };
    p.op = Op::Jal;
    // The encoding wants a constant; the value itself is handled by the
    // relocation.
    p.to = Addr::Const { offset, sym };
    p.from = Addr::Reg(lr);
}

/// Report whether the symbol contains a CALL (or equivalent) instruction.
/// Must be called after progedit: CALLs are CALL, a duff device, or
/// JAL/JALR linking through RA.
fn contains_call(func: &Func) -> bool {
    for id in func.ids() {
        let p = func.get(id);
        match p.op {
            Op::Call | Op::DuffCopy | Op::DuffZero => return true,
            Op::Jal => {
                if p.from == Addr::Reg(Reg::RA) {
                    return true;
                }
            }
            Op::Jalr => {
                if p.to == Addr::Reg(Reg::RA) {
                    return true;
                }
            }
            _ => {}
        }
    }
    false
}

// ==============================================================================
// Immediate materialization
// ==============================================================================

/// A constant too large for LUI+ADDI, parked for the per-function pool.
struct PoolReq {
    value: i64,
    p: ProgId,
}

/// Replace p with the shortest sequence that materializes value into the
/// given register:
///
///   12-bit:        ADDI  $value, ZERO, into
///   32-bit:        LUI   $high, into
///                  ADDI  $low, into, into    (ADDIW when high is -2^19)
///   otherwise:     AUIPC $0, into
///                  LD    $0, into, into      (patched to a pool entry)
///
/// With `split`, a fusable low part is not emitted; it is returned as an
/// augment for the caller to fold into a following memory op.
fn replace_with_load_imm(
    func: &mut Func,
    pool: &mut Vec<PoolReq>,
    id: ProgId,
    into: Reg,
    value: i64,
    split: bool,
) -> i64 {
    // The constant pool keys on the destination; loads into ZERO load 0.
    let value = if into == Reg::ZERO { 0 } else { value };
    let mut augment = 0;

    match split_32bit_immediate(value) {
        Err(_) => {
            // Pool load. The AUIPC offset is filled in after layout.
            let p = func.get_mut(id);
            p.op = Op::Auipc;
            p.mark.insert(Mark::NOCOMPRESS);
            p.from = Addr::Branch;
            p.from3 = Addr::None;
            p.to = Addr::Reg(into);
            p.spadj = 0;
            pool.push(PoolReq { value, p: id });

            let q = func.append_after(id);
            let p = func.get_mut(q);
            p.op = Op::Ld;
            p.mark.insert(Mark::NOCOMPRESS);
            p.from = Addr::con(0);
            p.from3 = Addr::Reg(into);
            p.to = Addr::Reg(into);
        }
        Ok((low, high)) => {
            if high != 0 {
                let p = func.get_mut(id);
                p.op = Op::Lui;
                p.from = Addr::con(high);
                p.from3 = Addr::None;
                p.to = Addr::Reg(into);
                p.spadj = 0;
                if low != 0 && (!split || high == -1 << 19) {
                    let q = func.append_after(id);
                    let p = func.get_mut(q);
                    // Constants like 0x7fffffff get the wrong sign
                    // extension from LUI; ADDIW redoes it.
                    p.op = if high == -1 << 19 { Op::Addiw } else { Op::Addi };
                    p.from = Addr::con(low);
                    p.from3 = Addr::Reg(into);
                    p.to = Addr::Reg(into);
                } else {
                    augment = low;
                }
            } else {
                let p = func.get_mut(id);
                p.op = Op::Addi;
                p.from = Addr::con(low);
                p.from3 = Addr::Reg(Reg::ZERO);
                p.to = Addr::Reg(into);
                p.spadj = 0;
            }
        }
    }
    augment
}

/// Load value into TMP unless it fits a 12-bit signed immediate.
///
/// Returns the empty Prog appended past the end of the load sequence (for
/// the caller to build the replacement instruction in), the deferred
/// augment, and whether the value was small enough to leave alone.
fn load_imm_into_reg_tmp(
    func: &mut Func,
    pool: &mut Vec<PoolReq>,
    id: ProgId,
    value: i64,
    split: bool,
) -> (ProgId, i64, bool) {
    if imm_fits(value, 12) {
        return (id, 0, true);
    }
    let np = func.append_after(id);
    let augment = replace_with_load_imm(func, pool, id, Reg::TMP, value, split);
    (np, augment, false)
}

// ==============================================================================
// Layout
// ==============================================================================

/// Set the pc field of all instructions reachable from `from`, starting at
/// pc, and return the pc past the end. Compressible instructions count two
/// bytes.
fn set_pcs(ctxt: &Ctxt, func: &mut Func, from: Option<ProgId>, mut pc: i64) -> i64 {
    let mut cur = from;
    while let Some(id) = cur {
        func.get_mut(id).pc = pc;
        let p = func.get(id);
        if compress(ctxt.config, p, true) != 0 {
            pc += 2;
        } else {
            pc += prog_length(p);
        }
        cur = func.get(id).link;
    }
    pc
}

// ==============================================================================
// Stack-growth probe
// ==============================================================================

/// Emit the stack-growth check after p. Returns the last emitted Prog (the
/// zero-width landing pad for the "enough stack" branch).
fn stacksplit(sym: &mut LSym, p: ProgId, framesize: i64) -> ProgId {
    // A leaf function with no frame is effectively NOSPLIT.
    if framesize == 0 {
        return p;
    }

    let needctxt = sym.text_flags() & textflag::NEEDCTXT != 0;
    let cfunc = sym.cfunc;
    let func = &mut sym.func;
    let text = func.head().expect("stacksplit: empty function");

    // MOV g_stackguard(g), A0
    let mut p = func.append_after(p);
    {
        let q = func.get_mut(p);
        q.op = Op::Mov;
        // G.stackguard0, or G.stackguard1 for the C calling discipline.
        let guard_offset = if cfunc { 3 * 8 } else { 2 * 8 };
        q.from = Addr::Mem { base: Reg::G, offset: guard_offset, name: Name::None, sym: None };
        q.to = Addr::Reg(Reg::A0);
    }

    let to_done;
    let mut to_more = None;

    if framesize <= STACK_SMALL {
        // small stack: SP < stackguard
        //	BLTU	A0, SP, done
        p = func.append_after(p);
        let q = func.get_mut(p);
        q.op = Op::Bltu;
        q.from = Addr::Reg(Reg::A0);
        q.reg = Some(Reg::SP);
        q.to = Addr::Branch;
        to_done = p;
    } else if framesize <= STACK_BIG {
        // large stack: SP-framesize < stackguard-StackSmall
        //	ADDI	$-framesize, SP, A1
        //	BLTU	A0, A1, done
        p = func.append_after(p);
        {
            let q = func.get_mut(p);
            q.op = Op::Addi;
            q.from = Addr::con(-framesize);
            q.from3 = Addr::Reg(Reg::SP);
            q.to = Addr::Reg(Reg::A1);
        }

        p = func.append_after(p);
        let q = func.get_mut(p);
        q.op = Op::Bltu;
        q.from = Addr::Reg(Reg::A0);
        q.reg = Some(Reg::A1);
        q.to = Addr::Branch;
        to_done = p;
    } else {
        // Such a large stack needs wraparound protection. When SP is close
        // to zero:
        //	SP-stackguard+StackGuard <= framesize + (StackGuard-StackSmall)
        // The +StackGuard on both sides keeps the left side positive: SP
        // is allowed to be slightly below stackguard.
        //
        // Preemption sets the guard to StackPreempt, a very large value,
        // which breaks the math above; check for it explicitly first.
        //	// stackguard is A0
        //	MOV	$StackPreempt, A1
        //	BEQ	A0, A1, more
        //	ADD	$StackGuard, SP, A1
        //	SUB	A0, A1
        //	MOV	$(framesize+(StackGuard-StackSmall)), A0
        //	BLTU	A0, A1, done
        p = func.append_after(p);
        {
            let q = func.get_mut(p);
            q.op = Op::Mov;
            q.from = Addr::con(STACK_PREEMPT);
            q.to = Addr::Reg(Reg::A1);
        }

        p = func.append_after(p);
        to_more = Some(p);
        {
            let q = func.get_mut(p);
            q.op = Op::Beq;
            q.from = Addr::Reg(Reg::A0);
            q.reg = Some(Reg::A1);
            q.to = Addr::Branch;
        }

        p = func.append_after(p);
        {
            let q = func.get_mut(p);
            q.op = Op::Addi;
            q.from = Addr::con(STACK_GUARD);
            q.from3 = Addr::Reg(Reg::SP);
            q.to = Addr::Reg(Reg::A1);
        }

        p = func.append_after(p);
        {
            let q = func.get_mut(p);
            q.op = Op::Sub;
            q.from = Addr::Reg(Reg::A0);
            q.from3 = Addr::Reg(Reg::A1);
            q.to = Addr::Reg(Reg::A1);
        }

        p = func.append_after(p);
        {
            let q = func.get_mut(p);
            q.op = Op::Mov;
            q.from = Addr::con(framesize + STACK_GUARD - STACK_SMALL);
            q.to = Addr::Reg(Reg::A0);
        }

        p = func.append_after(p);
        let q = func.get_mut(p);
        q.op = Op::Bltu;
        q.from = Addr::Reg(Reg::A0);
        q.reg = Some(Reg::A1);
        q.to = Addr::Branch;
        to_done = p;
    }

    // JAL	T0, runtime.morestack(SB)
    p = func.append_after(p);
    {
        let morestack = if cfunc {
            "runtime.morestackc"
        } else if !needctxt {
            "runtime.morestack_noctxt"
        } else {
            "runtime.morestack"
        };
        let q = func.get_mut(p);
        q.op = Op::Jal;
        q.from = Addr::Reg(Reg::T0);
        q.to = Addr::Const { offset: 0, sym: Some(morestack.to_string()) };
    }
    if let Some(more) = to_more {
        func.get_mut(more).pcond = Some(p);
    }

    // JMP	start
    p = func.append_after(p);
    {
        let entry = func.get(text).link;
        let q = func.get_mut(p);
        q.op = Op::Jal;
        q.from = Addr::Reg(Reg::ZERO);
        q.to = Addr::Branch;
        q.pcond = entry;
    }

    // Zero-width placeholder for to_done's jump target.
    p = func.append_after(p);
    func.get_mut(p).op = Op::Nop;
    func.get_mut(to_done).pcond = Some(p);

    p
}

// ==============================================================================
// The per-symbol pass driver
// ==============================================================================

/// Run the preprocessing passes over one symbol.
pub fn preprocess(ctxt: &mut Ctxt, sym: &mut LSym) {
    ctxt.cursym = Some(sym.name.clone());

    let text = match sym.func.head() {
        Some(text) => text,
        None => return,
    };
    if sym.func.get(text).op != Op::Text {
        ctxt.diag("preprocess: found symbol that does not start with TEXT directive".to_string());
        return;
    }

    // Frame sizing.
    let mut stacksize = match &sym.func.get(text).to {
        Addr::Const { offset, .. } => *offset,
        _ => 0,
    };
    if stacksize < 0 {
        if let Addr::Const { offset, .. } = &mut sym.func.get_mut(text).from3 {
            *offset |= textflag::NOFRAME;
        } else {
            sym.func.get_mut(text).from3 = Addr::con(textflag::NOFRAME);
        }
        stacksize = 0;
    }
    // RA must be saved if there is a CALL, unless we are told not to.
    let mut save_ra = contains_call(&sym.func);
    if sym.text_flags() & textflag::NOFRAME != 0 {
        save_ra = false;
    }
    if save_ra {
        stacksize += 8;
    }
    sym.locals = stacksize;

    // Prologue: stack probe, stack adjustment, RA save.
    let mut prologue = text;
    if sym.text_flags() & textflag::NOSPLIT == 0 {
        prologue = stacksplit(sym, prologue, stacksize);
    }

    if stacksize != 0 {
        prologue = sym.func.append_after(prologue);
        let p = sym.func.get_mut(prologue);
        p.op = Op::Addi;
        p.from = Addr::con(-stacksize);
        p.from3 = Addr::Reg(Reg::SP);
        p.to = Addr::Reg(Reg::SP);
        p.spadj = stacksize as i32;
    }

    if save_ra {
        // Source register in from3, destination base register in to,
        // destination offset in from; see the REG->MEM MOV rewrite below.
        prologue = sym.func.append_after(prologue);
        let p = sym.func.get_mut(prologue);
        p.op = Op::Sd;
        p.from3 = Addr::Reg(Reg::RA);
        p.to = Addr::Reg(Reg::SP);
        p.from = Addr::con(0);
    }

    if sym.text_flags() & textflag::WRAPPER != 0 {
        wrapper_fixup(&mut sym.func, prologue, stacksize);
    }

    // Update stack-based offsets.
    for id in sym.func.ids() {
        let p = sym.func.get_mut(id);
        stack_offset(&mut p.from, stacksize);
        stack_offset(&mut p.from3, stacksize);
        stack_offset(&mut p.to, stacksize);
    }

    let mut pool: Vec<PoolReq> = Vec::new();

    // Additional instruction rewriting. Any rewrites that change the
    // number of instructions must occur before jump target resolution.
    expand_pseudos(ctxt, &mut sym.func, stacksize, save_ra, &mut pool);

    // Split immediates larger than 12 bits.
    split_immediates(&mut sym.func, &mut pool);

    // Compute instruction addresses, then check for overextended jumps and
    // branches. Within each iteration pc differences are lower bounds (the
    // program grows monotonically), so a fixed point is reached.
    let lastpc = layout_fixpoint(ctxt, &mut sym.func);

    // Generate the constant pool now that its alignment is known.
    emit_const_pool(ctxt, &mut sym.func, &pool, lastpc);

    // Now that there are no long branches, resolve branch and jump
    // targets. From here on, rewrites that change the number of
    // instructions would break everything.
    resolve_targets(ctxt, &mut sym.func);

    // Validate all instructions.
    for id in sym.func.ids() {
        validate(ctxt, sym.func.get(id));
    }
}

/// Emit the wrapper prologue that adjusts panic frame pointers:
///
///   if g.panic != nil && g.panic.argp == FP {
///       g.panic.argp = bottom-of-frame
///   }
///
/// The NOP is needed to give the branches somewhere to land; it encodes to
/// zero instruction bytes.
fn wrapper_fixup(func: &mut Func, prologue: ProgId, stacksize: i64) {
    //   MOV g_panic(g), A1
    //   BNE A1, ZERO, adjust
    // end:
    //   NOP
    // ...rest of function..
    // adjust:
    //   MOV panic_argp(A1), A2
    //   ADD $(autosize+8), SP, A3
    //   BNE A2, A3, end
    //   ADD $8, SP, A2
    //   MOV A2, panic_argp(A1)
    //   JMP end
    let ldpanic = func.append_after(prologue);
    {
        let p = func.get_mut(ldpanic);
        p.op = Op::Mov;
        p.from = Addr::Mem { base: Reg::G, offset: 4 * 8, name: Name::None, sym: None };
        p.to = Addr::Reg(Reg::A1);
    }

    let bneadj = func.append_after(ldpanic);
    {
        let p = func.get_mut(bneadj);
        p.op = Op::Bne;
        p.from = Addr::Reg(Reg::A1);
        p.reg = Some(Reg::ZERO);
        p.to = Addr::Branch;
    }

    let endadj = func.append_after(bneadj);
    func.get_mut(endadj).op = Op::Nop;

    let last = func.tail().expect("wrapper_fixup: empty function");

    let getargp = func.append_after(last);
    {
        let p = func.get_mut(getargp);
        p.op = Op::Mov;
        p.from = Addr::Mem { base: Reg::A1, offset: 0, name: Name::None, sym: None };
        p.to = Addr::Reg(Reg::A2);
    }
    func.get_mut(bneadj).pcond = Some(getargp);

    let calcargp = func.append_after(getargp);
    {
        let p = func.get_mut(calcargp);
        p.op = Op::Addi;
        p.from = Addr::con(stacksize + FIXED_FRAME_SIZE);
        p.from3 = Addr::Reg(Reg::SP);
        p.to = Addr::Reg(Reg::A3);
    }

    let testargp = func.append_after(calcargp);
    {
        let p = func.get_mut(testargp);
        p.op = Op::Bne;
        p.from = Addr::Reg(Reg::A2);
        p.reg = Some(Reg::A3);
        p.to = Addr::Branch;
        p.pcond = Some(endadj);
    }

    let adjargp = func.append_after(testargp);
    {
        let p = func.get_mut(adjargp);
        p.op = Op::Addi;
        p.from = Addr::con(8);
        p.from3 = Addr::Reg(Reg::SP);
        p.to = Addr::Reg(Reg::A2);
    }

    let setargp = func.append_after(adjargp);
    {
        let p = func.get_mut(setargp);
        p.op = Op::Mov;
        p.from = Addr::Reg(Reg::A2);
        p.to = Addr::Mem { base: Reg::A1, offset: 0, name: Name::None, sym: None };
    }

    let godone = func.append_after(setargp);
    {
        let p = func.get_mut(godone);
        p.op = Op::Jal;
        p.from = Addr::Reg(Reg::ZERO);
        p.to = Addr::Branch;
        p.pcond = Some(endadj);
    }
}

/// Expand the MOV family and the remaining control-flow pseudos. MOV could
/// not be rewritten in progedit because stack offsets had to be applied
/// before the Addrs were split up.
fn expand_pseudos(
    ctxt: &mut Ctxt,
    func: &mut Func,
    stacksize: i64,
    save_ra: bool,
    pool: &mut Vec<PoolReq>,
) {
    for id in func.ids() {
        let op = func.get(id).op;
        match op {
            Op::Mov | Op::Movb | Op::Movh | Op::Movw | Op::Movbu | Op::Movhu | Op::Movwu
            | Op::Movf | Op::Movd => expand_mov(ctxt, func, pool, id),

            Op::Call => {
                if matches!(func.get(id).to, Addr::Mem { .. }) {
                    jalr_to_sym(ctxt, func, id, Reg::RA);
                }
            }

            // The compiler wants to use these inside NOFRAME functions, so
            // they link through T0, like the morestack path.
            Op::DuffZero | Op::DuffCopy => {
                if matches!(func.get(id).to, Addr::Mem { .. }) {
                    jalr_to_sym(ctxt, func, id, Reg::T0);
                }
            }

            Op::Jmp => {
                if matches!(&func.get(id).to, Addr::Mem { name: Name::Extern, .. }) {
                    jalr_to_sym(ctxt, func, id, Reg::ZERO);
                }
            }

            // Replace RET with the epilogue.
            Op::Ret => {
                let linkreg = match &func.get(id).from {
                    Addr::Reg(r) => *r,
                    _ => Reg::RA,
                };
                let mut cur = id;

                if save_ra {
                    // Restore RA.
                    let p = func.get_mut(cur);
                    p.op = Op::Ld;
                    p.from3 = Addr::Reg(Reg::SP);
                    p.from = Addr::con(0);
                    p.to = Addr::Reg(Reg::RA);
                    cur = func.append_after(cur);
                }

                if stacksize != 0 {
                    let p = func.get_mut(cur);
                    p.op = Op::Addi;
                    p.from = Addr::con(stacksize);
                    p.from3 = Addr::Reg(Reg::SP);
                    p.to = Addr::Reg(Reg::SP);
                    p.spadj = -(stacksize as i32);
                    cur = func.append_after(cur);
                }

                let p = func.get_mut(cur);
                p.op = Op::Jalr;
                p.from = Addr::con(0);
                p.from3 = Addr::Reg(linkreg);
                p.to = Addr::Reg(Reg::ZERO);
                // "Add back" the stack removed in the previous instruction,
                // so that summing spadj from function entry to any pc never
                // counts adjustments from earlier epilogues.
                p.spadj = stacksize as i32;
            }

            // Replace FNE[SD] with FEQ[SD] and NOT.
            Op::Fnes | Op::Fned => {
                let dst = match &func.get(id).to {
                    Addr::Reg(r) if r.is_int() => *r,
                    _ => {
                        ctxt.diag(format!(
                            "preprocess: {:?} needs an integer register output",
                            op
                        ));
                        continue;
                    }
                };
                func.get_mut(id).op = if op == Op::Fnes { Op::Feqs } else { Op::Feqd };
                let q = func.append_after(id);
                let p = func.get_mut(q);
                // [bit] xor 1 = not [bit]
                p.op = Op::Xori;
                p.from = Addr::con(1);
                p.from3 = Addr::Reg(dst);
                p.to = Addr::Reg(dst);
            }

            _ => {}
        }
    }
}

/// Expand one MOV-family Prog.
fn expand_mov(ctxt: &mut Ctxt, func: &mut Func, pool: &mut Vec<PoolReq>, id: ProgId) {
    let p = func.get(id).clone();
    match &p.from {
        // MOV c(Rs), Rd -> L $c, Rs, Rd
        Addr::Mem { offset, name, sym, .. } => match name {
            Name::Auto | Name::Param | Name::None => {
                if !matches!(p.to, Addr::Reg(_)) {
                    ctxt.diag(format!("preprocess: unsupported load at {}", p));
                    return;
                }
                let base = addr_to_reg(&p.from);
                let q = func.get_mut(id);
                q.op = movtol(p.op);
                q.from3 = Addr::Reg(base);
                q.from = Addr::con(*offset);
            }
            Name::Extern | Name::Static => {
                // AUIPC $off_hi, R
                // L $off_lo, R
                // A float destination cannot hold the AUIPC base, so route
                // those through TMP.
                let to = p.to.clone();
                let dest = match &to {
                    Addr::Reg(r) => *r,
                    _ => {
                        ctxt.diag(format!("preprocess: unsupported load at {}", p));
                        return;
                    }
                };
                let base = if dest.is_float() { Reg::TMP } else { dest };
                let offset = *offset;
                let sym = sym.clone();

                let q = func.get_mut(id);
                q.op = Op::Auipc;
                // This offset isn't really encoded with either
                // instruction; it is extracted for a relocation later.
                q.from = Addr::Const { offset, sym };
                q.from3 = Addr::None;
                q.to = Addr::Reg(base);
                q.mark.insert(Mark::NEED_PCREL_ITYPE_RELOC);
                q.mark.insert(Mark::NOCOMPRESS);

                let next = func.append_after(id);
                let q = func.get_mut(next);
                q.op = movtol(p.op);
                q.from = Addr::con(0);
                q.from3 = Addr::Reg(base);
                q.mark.insert(Mark::NOCOMPRESS);
                q.to = to;
            }
            _ => ctxt.diag(format!("preprocess: unsupported name for {}", p)),
        },

        Addr::Reg(src) => match &p.to {
            Addr::Reg(_) => {
                let q = func.get_mut(id);
                match p.op {
                    // MOV Ra, Rb -> ADDI $0, Ra, Rb
                    Op::Mov => {
                        q.op = Op::Addi;
                        q.from3 = Addr::Reg(*src);
                        q.from = Addr::con(0);
                    }
                    // MOVF Ra, Rb -> FSGNJS Ra, Ra, Rb
                    Op::Movf => {
                        q.op = Op::Fsgnjs;
                        q.from3 = Addr::Reg(*src);
                    }
                    // MOVD Ra, Rb -> FSGNJD Ra, Ra, Rb
                    Op::Movd => {
                        q.op = Op::Fsgnjd;
                        q.from3 = Addr::Reg(*src);
                    }
                    _ => ctxt.diag(format!(
                        "preprocess: unsupported register-register move at {}",
                        p
                    )),
                }
            }
            // MOV Rs, c(Rd) -> S $c, Rs, Rd
            Addr::Mem { offset, name, sym, .. } => {
                if matches!(p.op, Op::Movbu | Op::Movhu | Op::Movwu) {
                    ctxt.diag(format!("preprocess: unsupported unsigned store at {}", p));
                    return;
                }
                match name {
                    Name::Auto | Name::Param | Name::None => {
                        // The destination offset goes in from and the base
                        // register in to; the source register goes in from3.
                        let base = addr_to_reg(&p.to);
                        let offset = *offset;
                        let q = func.get_mut(id);
                        q.op = movtos(p.op);
                        q.from = Addr::con(offset);
                        q.from3 = Addr::Reg(*src);
                        q.to = Addr::Reg(base);
                    }
                    Name::Extern => {
                        // AUIPC $off_hi, TMP
                        // S $off_lo, Rs, TMP
                        let offset = *offset;
                        let sym = sym.clone();
                        let src = *src;

                        let q = func.get_mut(id);
                        q.op = Op::Auipc;
                        // Extracted for a relocation later.
                        q.from = Addr::Const { offset, sym };
                        q.from3 = Addr::None;
                        q.to = Addr::Reg(Reg::TMP);
                        q.mark.insert(Mark::NEED_PCREL_STYPE_RELOC);
                        q.mark.insert(Mark::NOCOMPRESS);

                        let next = func.append_after(id);
                        let q = func.get_mut(next);
                        q.op = movtos(p.op);
                        q.from = Addr::con(0);
                        q.from3 = Addr::Reg(src);
                        q.mark.insert(Mark::NOCOMPRESS);
                        q.to = Addr::Reg(Reg::TMP);
                    }
                    _ => ctxt.diag(format!("preprocess: unsupported name for {}", p)),
                }
            }
            _ => ctxt.diag(format!("preprocess: unsupported MOV at {}", p)),
        },

        // MOV $c, R
        Addr::Const { offset, .. } => {
            let to = match &p.to {
                Addr::Reg(r) if p.op == Op::Mov => *r,
                _ => {
                    ctxt.diag(format!("preprocess: unsupported constant load at {}", p));
                    return;
                }
            };
            let offset = *offset;
            replace_with_load_imm(func, pool, id, to, offset, false);
        }

        // MOV $sym+off(SP/SB), R
        Addr::AddrOf { base, offset, name, sym } => {
            if !matches!(p.to, Addr::Reg(_)) || p.op != Op::Mov {
                ctxt.diag(format!("preprocess: unsupported addr MOV at {}", p));
                return;
            }
            match name {
                Name::Extern | Name::Static => {
                    // AUIPC $off_hi, R
                    // ADDI $off_lo, R
                    let to = p.to.clone();
                    let offset = *offset;
                    let sym = sym.clone();

                    let q = func.get_mut(id);
                    q.op = Op::Auipc;
                    // Extracted for a relocation later.
                    q.from = Addr::Const { offset, sym };
                    q.from3 = Addr::None;
                    q.to = to.clone();
                    q.mark.insert(Mark::NEED_PCREL_ITYPE_RELOC);
                    q.mark.insert(Mark::NOCOMPRESS);

                    let next = func.append_after(id);
                    let q = func.get_mut(next);
                    q.op = Op::Addi;
                    q.mark.insert(Mark::NOCOMPRESS);
                    q.from = Addr::con(0);
                    q.from3 = Addr::Reg(to.reg());
                    q.to = to;
                }
                Name::Param | Name::Auto => {
                    let offset = *offset;
                    let q = func.get_mut(id);
                    q.op = Op::Addi;
                    q.from3 = Addr::Reg(Reg::SP);
                    q.from = Addr::con(offset);
                }
                Name::None => {
                    let base = *base;
                    let offset = *offset;
                    let q = func.get_mut(id);
                    q.op = Op::Addi;
                    q.from3 = Addr::Reg(base);
                    q.from = Addr::con(offset);
                }
                _ => ctxt.diag(format!("preprocess: bad addr MOV from name {:?} at {}", name, p)),
            }
        }

        _ => ctxt.diag(format!("preprocess: unsupported MOV at {}", p)),
    }
}

/// Split ALU immediates and load/store displacements larger than 12 bits.
fn split_immediates(func: &mut Func, pool: &mut Vec<PoolReq>) {
    for id in func.ids() {
        let op = func.get(id).op;
        match op {
            // <opi> $imm, FROM3, TO
            // becomes
            // LUI $high, TMP
            // ADDI $low, TMP, TMP
            // <op> TMP, FROM3, TO
            Op::Addi | Op::Andi | Op::Ori | Op::Xori | Op::Addiw => {
                let q = func.get(id).clone();
                let value = match &q.from {
                    Addr::Const { offset, .. } => *offset,
                    _ => continue,
                };
                let (np, _, small) = load_imm_into_reg_tmp(func, pool, id, value, false);
                if small {
                    continue;
                }

                let p = func.get_mut(np);
                p.op = match q.op {
                    Op::Addi => Op::Add,
                    Op::Addiw => Op::Addw,
                    Op::Andi => Op::And,
                    Op::Ori => Op::Or,
                    Op::Xori => Op::Xor,
                    _ => unreachable!(),
                };
                p.spadj = q.spadj;
                p.to = q.to;
                p.from3 = q.from3;
                p.from = Addr::Reg(Reg::TMP);
            }

            // <load> $imm, FROM3, TO (load $imm+(FROM3), TO)
            // <store> $imm, FROM3, TO (store $imm+(TO), FROM3)
            Op::Ld | Op::Lb | Op::Lh | Op::Lw | Op::Lbu | Op::Lhu | Op::Lwu | Op::Sd | Op::Sb
            | Op::Sh | Op::Sw => {
                let q = func.get(id).clone();
                let value = match &q.from {
                    Addr::Const { offset, .. } => *offset,
                    _ => continue,
                };
                let (np, aug, small) = load_imm_into_reg_tmp(func, pool, id, value, true);
                if small {
                    continue;
                }

                match q.op {
                    Op::Ld | Op::Lb | Op::Lh | Op::Lw | Op::Lbu | Op::Lhu | Op::Lwu => {
                        // ADD TMP, FROM3, TMP
                        // <load> $aug, TMP, TO
                        let p = func.get_mut(np);
                        p.op = Op::Add;
                        p.from = Addr::Reg(Reg::TMP);
                        p.from3 = q.from3;
                        p.to = Addr::Reg(Reg::TMP);

                        let next = func.append_after(np);
                        let p = func.get_mut(next);
                        p.op = q.op;
                        p.to = q.to;
                        p.from = Addr::con(aug);
                        p.from3 = Addr::Reg(Reg::TMP);
                    }
                    Op::Sd | Op::Sb | Op::Sh | Op::Sw => {
                        // ADD TMP, TO, TMP
                        // <store> $aug, FROM3, TMP
                        let base = q.to.reg();
                        let p = func.get_mut(np);
                        p.op = Op::Add;
                        p.from = Addr::Reg(Reg::TMP);
                        p.from3 = Addr::Reg(base);
                        p.to = Addr::Reg(Reg::TMP);

                        let next = func.append_after(np);
                        let p = func.get_mut(next);
                        p.op = q.op;
                        p.from3 = q.from3;
                        p.to = Addr::Reg(Reg::TMP);
                        p.from = Addr::con(aug);
                    }
                    _ => unreachable!(),
                }
            }

            _ => {}
        }
    }
}

/// Iterate layout until no branch or jump needs rewriting. Returns the pc
/// past the last instruction.
fn layout_fixpoint(ctxt: &mut Ctxt, func: &mut Func) -> i64 {
    let mut lastpc;
    let mut rounds = 0u32;
    loop {
        let mut rescan = false;
        lastpc = set_pcs(ctxt, func, func.head(), 0);
        rounds += 1;

        for id in func.ids() {
            let p = func.get(id);
            match p.op {
                Op::Beq | Op::Bne | Op::Blt | Op::Bge | Op::Bltu | Op::Bgeu => {
                    if p.to != Addr::Branch {
                        panic!("layout: instruction with branch-like opcode lacks destination");
                    }
                    let pcond = p.pcond.expect("layout: branch without target");
                    let offset = func.get(pcond).pc - p.pc;
                    if !(-4096..4096).contains(&offset) {
                        // Branch is long; replace it with an inverted
                        // branch over a jump.
                        trace!("extending branch at pc {} (offset {})", func.get(id).pc, offset);
                        let jmp = func.append_after(id);
                        {
                            let j = func.get_mut(jmp);
                            j.op = Op::Jal;
                            j.from = Addr::Reg(Reg::ZERO);
                            j.to = Addr::Branch;
                            j.pcond = Some(pcond);
                        }
                        let after_jmp = func.get(jmp).link;
                        let b = func.get_mut(id);
                        b.op = b.op.invert_branch();
                        b.pcond = after_jmp;
                        // Previous branches may have become too long.
                        rescan = true;
                    } else if !(-256..256).contains(&offset)
                        && matches!(p.op, Op::Beq | Op::Bne)
                        && p.reg == Some(Reg::ZERO)
                        && !p.mark.contains(Mark::NOCOMPRESS)
                    {
                        // Branch cannot be encoded in two bytes.
                        func.get_mut(id).mark.insert(Mark::NOCOMPRESS);
                        rescan = true;
                    }
                }
                Op::Jal => {
                    if let Some(pcond) = p.pcond {
                        // Internal jump; rewrite if it doesn't fit.
                        let offset = func.get(pcond).pc - p.pc;
                        if !(-(1 << 20)..1 << 20).contains(&offset) {
                            // Replace with a 2-instruction sequence. TMP is
                            // not live across jumps; it is reserved for us.
                            trace!("extending jump at pc {} (offset {})", func.get(id).pc, offset);
                            let link_reg = func.get(id).from.clone();
                            let jmp = func.append_after(id);
                            {
                                let j = func.get_mut(jmp);
                                j.op = Op::Jalr;
                                j.from = Addr::con(0);
                                j.to = link_reg;
                                j.from3 = Addr::Reg(Reg::TMP);
                            }
                            let b = func.get_mut(id);
                            b.op = Op::Auipc;
                            // Not generally valid; fixed up during target
                            // resolution.
                            b.from = Addr::Branch;
                            b.from3 = Addr::None;
                            b.to = Addr::Reg(Reg::TMP);
                            rescan = true;
                        } else if !(-2048..2048).contains(&offset)
                            && p.from == Addr::Reg(Reg::ZERO)
                            && !p.mark.contains(Mark::NOCOMPRESS)
                        {
                            // Jump cannot be encoded in two bytes.
                            func.get_mut(id).mark.insert(Mark::NOCOMPRESS);
                            rescan = true;
                        }
                    } else if let Addr::Const { sym: Some(sym), .. } = &p.to {
                        // A call. Normally it either fits or the linker
                        // inserts a trampoline, but if the function plus
                        // its trampolines outgrow the direct-jump range a
                        // JAL cannot even reach the trampolines;
                        // conservatively allow trampoline space three
                        // times the function size. Calls to the deferred-
                        // return thunk are expanded unconditionally, since
                        // the runtime knows their size.
                        if sym.as_str() == DEFERRETURN_SYM || lastpc >= 1 << 18 {
                            let link_reg = p.from.clone();
                            let (offset, symname) = match &p.to {
                                Addr::Const { offset, sym } => (*offset, sym.clone()),
                                _ => unreachable!(),
                            };
                            let jmp = func.append_after(id);
                            {
                                let j = func.get_mut(jmp);
                                j.op = Op::Jalr;
                                j.from = Addr::con(0);
                                j.to = link_reg;
                                j.from3 = Addr::Reg(Reg::TMP);
                                j.mark.insert(Mark::NOCOMPRESS);
                            }
                            let b = func.get_mut(id);
                            b.op = Op::Auipc;
                            b.from = Addr::Const { offset, sym: symname };
                            b.from3 = Addr::None;
                            b.to = Addr::Reg(Reg::TMP);
                            b.mark.insert(Mark::NEED_CALL_RELOC2);
                            b.mark.insert(Mark::NOCOMPRESS);
                            rescan = true;
                        }
                    }
                }
                _ => {}
            }
        }

        if !rescan {
            break;
        }
    }
    debug!("layout converged after {} round(s), {} bytes", rounds, lastpc);
    lastpc
}

/// Append the constant pool: pad to 8-byte alignment with breakpoints,
/// then two data words per pooled constant, low half first. The requesting
/// AUIPC's pcond is pointed at its first word.
fn emit_const_pool(ctxt: &mut Ctxt, func: &mut Func, pool: &[PoolReq], lastpc: i64) {
    if pool.is_empty() {
        return;
    }
    debug!("emitting constant pool: {} value(s)", pool.len());

    let mut lastp = func.tail().expect("const pool: empty function");
    let oldend = lastp;
    let mut i = lastpc;
    while i % 8 != 0 {
        lastp = func.append_after(lastp);
        let p = func.get_mut(lastp);
        p.op = Op::Ebreak;
        p.from = Addr::con(0);
        p.from3 = Addr::Reg(Reg::ZERO);
        p.to = Addr::Reg(Reg::ZERO);
        i += if ctxt.config.rvc { 2 } else { 4 };
    }

    for req in pool {
        lastp = func.append_after(lastp);
        {
            let p = func.get_mut(lastp);
            p.op = Op::Word;
            p.from = Addr::con(req.value as u32 as i64);
        }
        func.get_mut(req.p).pcond = Some(lastp);

        lastp = func.append_after(lastp);
        let p = func.get_mut(lastp);
        p.op = Op::Word;
        p.from = Addr::con((req.value >> 32) as u32 as i64);
    }

    let after_old_end = func.get(oldend).link;
    set_pcs(ctxt, func, after_old_end, lastpc);
}

/// Materialize branch/jump displacements into the operands now that all
/// PCs are final.
fn resolve_targets(ctxt: &mut Ctxt, func: &mut Func) {
    for id in func.ids() {
        let p = func.get(id);
        match p.op {
            Op::Beq | Op::Bne | Op::Blt | Op::Bge | Op::Bltu | Op::Bgeu | Op::Jal => {
                if p.to == Addr::Branch {
                    let pcond = p.pcond.expect("resolve: branch without target");
                    let offset = func.get(pcond).pc - p.pc;
                    func.get_mut(id).to = Addr::con(offset);
                }
            }
            Op::Auipc => {
                if p.from == Addr::Branch {
                    let pcond = p.pcond.expect("resolve: AUIPC without target");
                    let displacement = func.get(pcond).pc - p.pc;
                    match split_32bit_immediate(displacement) {
                        Ok((low, high)) => {
                            func.get_mut(id).from = Addr::con(high);
                            let next = func.get(id).link.expect("resolve: AUIPC without pair");
                            match &mut func.get_mut(next).from {
                                Addr::Const { offset, .. } => *offset = low,
                                other => *other = Addr::con(low),
                            }
                        }
                        Err(_) => {
                            let msg = format!(
                                "{}: jump displacement {} too large",
                                func.get(id),
                                displacement
                            );
                            ctxt.diag(msg);
                        }
                    }
                }
            }
            _ => {}
        }
    }
}
