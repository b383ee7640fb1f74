//! NCS bytecode support for the KotOR/TSL script VM.
//!
//! This crate covers the wire side of the decompiler: the on-disk NCS
//! container (header + big-endian instruction stream), the opcode and
//! qualifier tables, the decoded instruction model, and the NSS type
//! lattice shared with the analysis crates.

pub mod instr;
pub mod opcode;
pub mod reader;
pub mod types;
pub mod writer;

pub use instr::{InstrId, Instruction, Operands, Program};
pub use opcode::{Opcode, Qualifier};
pub use reader::{DecodeError, NcsReader, HEADER_LEN, NCS_SIGNATURE, SIZE_TAG};
pub use types::NssType;
pub use writer::NcsWriter;
