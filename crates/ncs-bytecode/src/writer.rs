//! NCS container encoding
//!
//! Mirror of the reader: emits the signature, the size record and a
//! big-endian instruction stream, patching the declared size on
//! `into_bytes()`. The decompiler's test suites assemble their fixtures with
//! this writer, and the round-trip comparator uses it to normalize listings.

use crate::opcode::{Opcode, Qualifier};
use crate::reader::{HEADER_LEN, NCS_SIGNATURE, SIZE_TAG};

/// An unresolved forward jump returned by [`NcsWriter::reserve_jump`]
#[derive(Debug, Clone, Copy)]
pub struct JumpFixup {
    /// Offset of the jump instruction itself
    pub instr_offset: u32,
    /// Buffer position of the 4-byte relative operand
    operand_pos: usize,
}

/// NCS bytecode writer
pub struct NcsWriter {
    buffer: Vec<u8>,
}

impl NcsWriter {
    /// Create a writer with the header already emitted
    pub fn new() -> Self {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&NCS_SIGNATURE);
        buffer.push(SIZE_TAG);
        buffer.extend_from_slice(&0u32.to_be_bytes()); // patched in into_bytes
        Self { buffer }
    }

    /// Absolute offset the next instruction will start at
    pub fn here(&self) -> u32 {
        self.buffer.len() as u32
    }

    /// Finish: patch the declared size and return the file bytes
    pub fn into_bytes(mut self) -> Vec<u8> {
        let size = (self.buffer.len() as u32).to_be_bytes();
        self.buffer[9..13].copy_from_slice(&size);
        self.buffer
    }

    // ===== Raw emission =====

    fn emit_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    fn emit_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    fn emit_i16(&mut self, value: i16) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    fn emit_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    fn emit_i32(&mut self, value: i32) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    fn emit_f32(&mut self, value: f32) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    fn emit_op(&mut self, opcode: Opcode, qualifier: Qualifier) {
        self.emit_u8(opcode.to_u8());
        self.emit_u8(qualifier.to_u8());
    }

    // ===== Constants and slots =====

    /// CONST int
    pub fn emit_const_int(&mut self, value: i32) {
        self.emit_op(Opcode::Const, Qualifier::Int);
        self.emit_i32(value);
    }

    /// CONST float
    pub fn emit_const_float(&mut self, value: f32) {
        self.emit_op(Opcode::Const, Qualifier::Float);
        self.emit_f32(value);
    }

    /// CONST string (u16 big-endian length prefix)
    pub fn emit_const_string(&mut self, value: &str) {
        self.emit_op(Opcode::Const, Qualifier::String);
        self.emit_u16(value.len() as u16);
        self.buffer.extend_from_slice(value.as_bytes());
    }

    /// CONST object
    pub fn emit_const_object(&mut self, value: u32) {
        self.emit_op(Opcode::Const, Qualifier::Object);
        self.emit_u32(value);
    }

    /// RSADD with the slot's type qualifier
    pub fn emit_rsadd(&mut self, qualifier: Qualifier) {
        self.emit_op(Opcode::RsAdd, qualifier);
    }

    // ===== Stack copies =====

    /// CPTOPSP offset, size
    pub fn emit_cptopsp(&mut self, offset: i32, size: u16) {
        self.emit_op(Opcode::CpTopSp, Qualifier::Raw);
        self.emit_i32(offset);
        self.emit_u16(size);
    }

    /// CPDOWNSP offset, size
    pub fn emit_cpdownsp(&mut self, offset: i32, size: u16) {
        self.emit_op(Opcode::CpDownSp, Qualifier::Raw);
        self.emit_i32(offset);
        self.emit_u16(size);
    }

    /// CPTOPBP offset, size
    pub fn emit_cptopbp(&mut self, offset: i32, size: u16) {
        self.emit_op(Opcode::CpTopBp, Qualifier::Raw);
        self.emit_i32(offset);
        self.emit_u16(size);
    }

    /// CPDOWNBP offset, size
    pub fn emit_cpdownbp(&mut self, offset: i32, size: u16) {
        self.emit_op(Opcode::CpDownBp, Qualifier::Raw);
        self.emit_i32(offset);
        self.emit_u16(size);
    }

    // ===== Operators =====

    /// Any zero-operand operator (arithmetic, comparison, logical, unary)
    pub fn emit_binop(&mut self, opcode: Opcode, qualifier: Qualifier) {
        self.emit_op(opcode, qualifier);
    }

    /// EQ/NEQ over structs, which carry the compared byte count
    pub fn emit_struct_compare(&mut self, opcode: Opcode, size: u16) {
        self.emit_op(opcode, Qualifier::StructStruct);
        self.emit_u16(size);
    }

    /// INCISP/DECISP/INCIBP/DECIBP
    pub fn emit_stack_mod(&mut self, opcode: Opcode, offset: i32) {
        self.emit_op(opcode, Qualifier::Int);
        self.emit_i32(offset);
    }

    /// DESTRUCT size, keep_offset, keep_size
    pub fn emit_destruct(&mut self, size: u16, keep_offset: i16, keep_size: u16) {
        self.emit_op(Opcode::Destruct, Qualifier::Raw);
        self.emit_u16(size);
        self.emit_i16(keep_offset);
        self.emit_u16(keep_size);
    }

    // ===== Frame bookkeeping =====

    /// MOVSP delta (negative pops)
    pub fn emit_movsp(&mut self, delta: i32) {
        self.emit_op(Opcode::MovSp, Qualifier::None);
        self.emit_i32(delta);
    }

    /// SAVEBP
    pub fn emit_savebp(&mut self) {
        self.emit_op(Opcode::SaveBp, Qualifier::None);
    }

    /// RESTOREBP
    pub fn emit_restorebp(&mut self) {
        self.emit_op(Opcode::RestoreBp, Qualifier::None);
    }

    /// STORE_STATE bp-size, sp-size
    pub fn emit_store_state(&mut self, bp: i32, sp: i32) {
        self.emit_op(Opcode::StoreState, Qualifier::Effect);
        self.emit_i32(bp);
        self.emit_i32(sp);
    }

    /// NOP
    pub fn emit_nop(&mut self) {
        self.emit_op(Opcode::Nop, Qualifier::None);
    }

    // ===== Calls and control flow =====

    /// ACTION id, argument count
    pub fn emit_action(&mut self, id: u16, args: u8) {
        self.emit_op(Opcode::Action, Qualifier::None);
        self.emit_u16(id);
        self.emit_u8(args);
    }

    /// RETN
    pub fn emit_retn(&mut self) {
        self.emit_op(Opcode::Retn, Qualifier::None);
    }

    /// Jump with a known relative delta
    pub fn emit_jump(&mut self, opcode: Opcode, rel: i32) {
        debug_assert!(opcode.is_jump());
        self.emit_op(opcode, Qualifier::None);
        self.emit_i32(rel);
    }

    /// Jump to a known absolute target
    pub fn emit_jump_to(&mut self, opcode: Opcode, target: u32) {
        let rel = target as i64 - self.here() as i64;
        self.emit_jump(opcode, rel as i32);
    }

    /// Emit a jump whose target is not known yet
    pub fn reserve_jump(&mut self, opcode: Opcode) -> JumpFixup {
        let instr_offset = self.here();
        self.emit_op(opcode, Qualifier::None);
        let operand_pos = self.buffer.len();
        self.emit_i32(0);
        JumpFixup {
            instr_offset,
            operand_pos,
        }
    }

    /// Point a reserved jump at an absolute target
    pub fn patch_jump(&mut self, fixup: JumpFixup, target: u32) {
        let rel = (target as i64 - fixup.instr_offset as i64) as i32;
        self.buffer[fixup.operand_pos..fixup.operand_pos + 4]
            .copy_from_slice(&rel.to_be_bytes());
    }
}

impl Default for NcsWriter {
    fn default() -> Self {
        Self::new()
    }
}
