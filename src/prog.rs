// prog.rs
//
// The instruction IR consumed by the backend: one Prog record per
// instruction or directive, with tagged Addr operands. Progs for a
// function live in a flat arena owned by Func, and both the successor
// pointer (link) and the branch-target pointer (pcond) are arena indices.
// Inserting a Prog between p and p.link relinks only p.link, so pcond
// references never dangle.

use crate::config::Config;
use crate::error::Diagnostic;
use crate::riscv::{Op, Reg};
use std::fmt;

// ==============================================================================
// Operands
// ==============================================================================

/// Classification of a memory or address operand's offset resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Name {
    None,
    /// Frame-local; offset is rebased to the top of the locals area.
    Auto,
    /// Argument; offset is rebased past the locals area and saved RA slot.
    Param,
    /// Global symbol, resolved via PC-relative relocation.
    Extern,
    /// File-local symbol, resolved via PC-relative relocation.
    Static,
}

/// A tagged operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Addr {
    /// Absent operand.
    None,
    /// A register.
    Reg(Reg),
    /// An integer constant, optionally relative to a symbol (in which case
    /// the offset is a relocation addend).
    Const { offset: i64, sym: Option<String> },
    /// A memory reference base+offset, classified by name kind.
    Mem { base: Reg, offset: i64, name: Name, sym: Option<String> },
    /// A branch target that has not been laid out yet. Replaced by Const
    /// once PCs are assigned.
    Branch,
    /// The address of a symbol or stack slot.
    AddrOf { base: Reg, offset: i64, name: Name, sym: Option<String> },
}

impl Addr {
    pub fn con(offset: i64) -> Addr {
        Addr::Const { offset, sym: None }
    }

    /// The register of a Reg operand; panics on anything else. Validation
    /// runs before encoding, so encode-side callers rely on this.
    pub fn reg(&self) -> Reg {
        match self {
            Addr::Reg(r) => *r,
            _ => panic!("operand is not a register: {:?}", self),
        }
    }

    /// The offset of a Const operand; panics on anything else.
    pub fn const_offset(&self) -> i64 {
        match self {
            Addr::Const { offset, .. } => *offset,
            _ => panic!("operand is not a constant: {:?}", self),
        }
    }

    /// The symbol attached to a Const operand, if any.
    pub fn const_sym(&self) -> Option<&str> {
        match self {
            Addr::Const { sym, .. } => sym.as_deref(),
            _ => None,
        }
    }
}

// ==============================================================================
// Prog records
// ==============================================================================

/// Per-Prog attribute bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Mark(u8);

impl Mark {
    /// Never re-encode this instruction in compressed form.
    pub const NOCOMPRESS: Mark = Mark(1 << 0);
    /// This AUIPC and its successor form an I-type PC-relative pair that a
    /// relocation will patch.
    pub const NEED_PCREL_ITYPE_RELOC: Mark = Mark(1 << 1);
    /// As above, but the second instruction is store-format.
    pub const NEED_PCREL_STYPE_RELOC: Mark = Mark(1 << 2);
    /// This AUIPC and its successor form an expanded call pair.
    pub const NEED_CALL_RELOC2: Mark = Mark(1 << 3);

    pub fn contains(self, other: Mark) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Mark) {
        self.0 |= other.0;
    }
}

/// Index of a Prog within its function's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgId(pub usize);

/// One instruction or directive.
#[derive(Debug, Clone, PartialEq)]
pub struct Prog {
    pub op: Op,
    /// Primary source operand. Gotcha inherited from the upstream code
    /// generator: for JAL/JALR the *link register* arrives here, with the
    /// target in `to`; normalization repairs JALR's slots.
    pub from: Addr,
    /// Third operand; normalization guarantees it is always present
    /// (Addr::None when genuinely unused).
    pub from3: Addr,
    /// Primary destination operand.
    pub to: Addr,
    /// Auxiliary register slot; carries the second source of a branch.
    pub reg: Option<Reg>,
    /// Byte offset within the symbol, assigned by layout.
    pub pc: i64,
    /// Stack-pointer delta contributed by this instruction.
    pub spadj: i32,
    pub mark: Mark,
    /// Float rounding-mode override (0..7), ORed into funct3.
    pub scond: u8,
    /// Branch/jump target, or the constant-pool word an AUIPC refers to.
    pub pcond: Option<ProgId>,
    /// Successor in the per-symbol list.
    pub link: Option<ProgId>,
}

impl Prog {
    pub fn new(op: Op) -> Prog {
        Prog {
            op,
            from: Addr::None,
            from3: Addr::None,
            to: Addr::None,
            reg: None,
            pc: 0,
            spadj: 0,
            mark: Mark::default(),
            scond: 0,
            pcond: None,
            link: None,
        }
    }
}

impl fmt::Display for Prog {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?} {:?}, {:?}, {:?}", self.op, self.from, self.from3, self.to)
    }
}

// ==============================================================================
// Function arena
// ==============================================================================

/// The Prog list of one function, stored as a flat arena. Progs are never
/// freed individually; the whole arena is dropped with the function.
#[derive(Debug, Clone, Default)]
pub struct Func {
    progs: Vec<Prog>,
    head: Option<ProgId>,
}

impl Func {
    pub fn new() -> Func {
        Func::default()
    }

    /// First Prog of the list (the TEXT directive for a well-formed input).
    pub fn head(&self) -> Option<ProgId> {
        self.head
    }

    pub fn get(&self, id: ProgId) -> &Prog {
        &self.progs[id.0]
    }

    pub fn get_mut(&mut self, id: ProgId) -> &mut Prog {
        &mut self.progs[id.0]
    }

    /// Append a Prog to the end of the list.
    pub fn push(&mut self, prog: Prog) -> ProgId {
        let id = ProgId(self.progs.len());
        self.progs.push(prog);
        match self.tail() {
            Some(tail) => self.progs[tail.0].link = Some(id),
            None => self.head = Some(id),
        }
        id
    }

    /// Insert a fresh empty Prog directly after `after` and return its id.
    /// Only `after.link` is rewritten, so pcond references stay valid.
    pub fn append_after(&mut self, after: ProgId) -> ProgId {
        let id = ProgId(self.progs.len());
        let mut prog = Prog::new(Op::Nop);
        prog.link = self.progs[after.0].link;
        self.progs.push(prog);
        self.progs[after.0].link = Some(id);
        id
    }

    /// Last Prog of the list.
    pub fn tail(&self) -> Option<ProgId> {
        let mut cur = self.head?;
        while let Some(next) = self.progs[cur.0].link {
            cur = next;
        }
        Some(cur)
    }

    /// Ids of all Progs in list order, snapshotted so that the caller may
    /// insert while walking. Insertions made during the walk are not
    /// visited; passes that need to see them rescan.
    pub fn ids(&self) -> Vec<ProgId> {
        let mut out = Vec::with_capacity(self.progs.len());
        let mut cur = self.head;
        while let Some(id) = cur {
            out.push(id);
            cur = self.progs[id.0].link;
        }
        out
    }
}

// ==============================================================================
// Symbols and relocations
// ==============================================================================

/// Attribute bits stored in the TEXT directive's from3 constant.
pub mod textflag {
    /// Function may run on the system stack; no split check.
    pub const NOSPLIT: i64 = 4;
    /// Function is a wrapper needing the panic-frame fixup.
    pub const WRAPPER: i64 = 32;
    /// Function uses the closure context register.
    pub const NEEDCTXT: i64 = 64;
    /// No frame is allocated, and RA is not saved.
    pub const NOFRAME: i64 = 512;
}

/// Relocation kinds emitted by the assembler and consumed by the linker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// A single JAL whose UJ immediate the linker fills in.
    CallRiscv1,
    /// An AUIPC+JALR pair forming an extended-range call.
    CallRiscv2,
    /// An AUIPC followed by an I-format instruction (load/ADDI).
    PcrelItype,
    /// An AUIPC followed by an S-format store.
    PcrelStype,
}

/// One relocation entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Reloc {
    /// Byte offset of the (first) patched instruction within the symbol.
    pub off: i32,
    /// 4 for CallRiscv1, 8 for the pair-covering kinds.
    pub size: u8,
    pub kind: RelocKind,
    pub sym: String,
    pub add: i64,
    pub done: bool,
}

/// A function symbol: its Prog list on the way in, its machine code and
/// relocations on the way out.
#[derive(Debug, Clone)]
pub struct LSym {
    pub name: String,
    pub func: Func,
    /// Emitted machine code.
    pub p: Vec<u8>,
    pub relocs: Vec<Reloc>,
    pub size: i64,
    /// Size of the locals area, fixed by preprocessing.
    pub locals: i64,
    /// The function is written against the C calling discipline; the
    /// morestack path must preserve its context differently.
    pub cfunc: bool,
}

impl LSym {
    pub fn new(name: &str) -> LSym {
        LSym {
            name: name.to_string(),
            func: Func::new(),
            p: Vec::new(),
            relocs: Vec::new(),
            size: 0,
            locals: 0,
            cfunc: false,
        }
    }

    /// Fetch the TEXT directive's attribute bits.
    pub fn text_flags(&self) -> i64 {
        match self.func.head() {
            Some(text) => match &self.func.get(text).from3 {
                Addr::Const { offset, .. } => *offset,
                _ => 0,
            },
            None => 0,
        }
    }
}

// ==============================================================================
// Assembly context
// ==============================================================================

/// Per-worker assembly context: configuration plus the diagnostic sink.
/// One symbol's Prog list is owned by exactly one context for its whole
/// trip through the pipeline.
#[derive(Debug, Clone)]
pub struct Ctxt {
    pub config: Config,
    pub diags: Vec<Diagnostic>,
    /// Name of the symbol currently being assembled, for diagnostics.
    pub cursym: Option<String>,
}

impl Ctxt {
    pub fn new(config: Config) -> Ctxt {
        Ctxt { config, diags: Vec::new(), cursym: None }
    }

    /// Report a recoverable problem and keep going.
    pub fn diag(&mut self, message: String) {
        log::debug!("diagnostic: {}", message);
        self.diags.push(Diagnostic { sym: self.cursym.clone(), message });
    }

    pub fn has_errors(&self) -> bool {
        !self.diags.is_empty()
    }
}
