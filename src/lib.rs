// rvobj: the RISC-V machine-code backend
//
// This library turns per-function pseudo-instruction lists into RV64G
// (plus optional compressed RVC) machine code and relocations, and gives
// the linker the tools to resolve PC-relative pairs and insert
// trampolines for out-of-range calls.
//
// The pipeline runs in order over each function symbol: progedit
// normalizes every Prog in isolation, preprocess runs the per-symbol
// passes (prologue, stack probe, pseudo expansion, immediate splitting,
// PC layout, constant pool, validation), and assemble emits bytes and
// relocation entries. The linker half (trampoline, archreloc) runs later,
// once final addresses exist.

// Backend modules
pub mod assembler;
pub mod config;
pub mod encoder;
pub mod encoder_compressed;
pub mod error;
pub mod linker;
pub mod preprocess;
pub mod prog;
pub mod progedit;
pub mod riscv;

#[cfg(test)]
mod encoder_compressed_tests;
#[cfg(test)]
mod linker_tests;
