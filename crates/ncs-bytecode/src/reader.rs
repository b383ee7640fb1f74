//! NCS container decoding
//!
//! The container is a 13-byte header (8-byte ASCII signature, a size-record
//! tag byte, a big-endian u32 total file size) followed by a flat
//! instruction stream. Every multi-byte value in the file is big-endian.

use crate::instr::{Instruction, Operands, Program};
use crate::opcode::{Opcode, Qualifier};
use thiserror::Error;

/// File signature: magic and version in one
pub const NCS_SIGNATURE: [u8; 8] = *b"NCS V1.0";

/// Tag byte of the mandatory size record that follows the signature
pub const SIZE_TAG: u8 = 0x42;

/// Header length: signature + tag + u32 size
pub const HEADER_LEN: u32 = 13;

/// Errors that can occur while decoding an NCS file
#[derive(Debug, Error)]
pub enum DecodeError {
    /// File shorter than the header
    #[error("File truncated: {0} bytes, header needs {HEADER_LEN}")]
    TooShort(usize),

    /// Invalid NCS signature
    #[error("Invalid NCS signature: expected \"NCS V1.0\", got {0:?}")]
    InvalidSignature(String),

    /// Missing or wrong size-record tag
    #[error("Invalid size record tag: expected {SIZE_TAG:#04x}, got {0:#04x}")]
    InvalidSizeTag(u8),

    /// Declared size disagrees with the actual byte count
    #[error("Size mismatch: header declares {declared} bytes, file has {actual}")]
    SizeMismatch { declared: u32, actual: usize },

    /// Unexpected end of the instruction stream
    #[error("Unexpected end of bytecode at offset {0}")]
    UnexpectedEnd(u32),

    /// Unknown opcode byte
    #[error("Invalid opcode {0:#04x} at offset {1}")]
    InvalidOpcode(u8, u32),

    /// Qualifier byte not legal for this opcode
    #[error("Invalid qualifier {qualifier:#04x} for {mnemonic} at offset {offset}")]
    InvalidQualifier {
        qualifier: u8,
        mnemonic: &'static str,
        offset: u32,
    },

    /// String constant payload is not UTF-8
    #[error("Invalid UTF-8 string constant at offset {0}")]
    InvalidUtf8(u32),
}

/// Header summary, decodable even when the rest of the file is not
///
/// The failure-stub generator reports these fields for files the full
/// decoder rejects.
#[derive(Debug, Clone)]
pub struct Header {
    /// The eight signature bytes as found
    pub signature: [u8; 8],
    /// Whether the signature matched `NCS V1.0`
    pub signature_ok: bool,
    /// Declared total file size
    pub declared_size: u32,
}

/// NCS container reader
pub struct NcsReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> NcsReader<'a> {
    /// Decode only the header, tolerating a bad signature
    pub fn read_header(data: &[u8]) -> Result<Header, DecodeError> {
        if data.len() < HEADER_LEN as usize {
            return Err(DecodeError::TooShort(data.len()));
        }
        let signature: [u8; 8] = data[..8].try_into().unwrap();
        let tag = data[8];
        if tag != SIZE_TAG {
            return Err(DecodeError::InvalidSizeTag(tag));
        }
        let declared_size = u32::from_be_bytes(data[9..13].try_into().unwrap());
        Ok(Header {
            signature,
            signature_ok: signature == NCS_SIGNATURE,
            declared_size,
        })
    }

    /// Decode a full program
    pub fn read(data: &'a [u8]) -> Result<Program, DecodeError> {
        let header = Self::read_header(data)?;
        if !header.signature_ok {
            return Err(DecodeError::InvalidSignature(
                String::from_utf8_lossy(&header.signature).into_owned(),
            ));
        }
        if header.declared_size as usize != data.len() {
            return Err(DecodeError::SizeMismatch {
                declared: header.declared_size,
                actual: data.len(),
            });
        }

        let mut reader = NcsReader {
            data,
            pos: HEADER_LEN as usize,
        };
        let mut instructions = Vec::new();
        while reader.pos < data.len() {
            instructions.push(reader.read_instruction()?);
        }
        Ok(Program {
            declared_size: header.declared_size,
            instructions,
        })
    }

    // ===== Cursor primitives =====

    fn offset(&self) -> u32 {
        self.pos as u32
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or(DecodeError::UnexpectedEnd(self.offset()))?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos + len;
        if end > self.data.len() {
            return Err(DecodeError::UnexpectedEnd(self.offset()));
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.read_bytes(2)?.try_into().unwrap()))
    }

    fn read_i16(&mut self) -> Result<i16, DecodeError> {
        Ok(i16::from_be_bytes(self.read_bytes(2)?.try_into().unwrap()))
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.read_bytes(4)?.try_into().unwrap()))
    }

    fn read_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_be_bytes(self.read_bytes(4)?.try_into().unwrap()))
    }

    fn read_f32(&mut self) -> Result<f32, DecodeError> {
        Ok(f32::from_be_bytes(self.read_bytes(4)?.try_into().unwrap()))
    }

    // ===== Instruction decoding =====

    fn read_instruction(&mut self) -> Result<Instruction, DecodeError> {
        let offset = self.offset();
        let op_byte = self.read_u8()?;
        let opcode =
            Opcode::from_u8(op_byte).ok_or(DecodeError::InvalidOpcode(op_byte, offset))?;
        let q_byte = self.read_u8()?;
        let qualifier = Qualifier::from_u8(q_byte).ok_or(DecodeError::InvalidQualifier {
            qualifier: q_byte,
            mnemonic: opcode.mnemonic(),
            offset,
        })?;

        let operands = match opcode {
            Opcode::CpDownSp | Opcode::CpTopSp | Opcode::CpDownBp | Opcode::CpTopBp => {
                Operands::OffsetAndSize {
                    offset: self.read_i32()?,
                    size: self.read_u16()?,
                }
            }
            Opcode::Const => match qualifier {
                Qualifier::Int => Operands::Int(self.read_i32()?),
                Qualifier::Float => Operands::Float(self.read_f32()?),
                Qualifier::Object => Operands::Object(self.read_u32()?),
                Qualifier::String => {
                    let len = self.read_u16()? as usize;
                    let str_offset = self.offset();
                    let bytes = self.read_bytes(len)?;
                    let text = std::str::from_utf8(bytes)
                        .map_err(|_| DecodeError::InvalidUtf8(str_offset))?;
                    Operands::String(text.to_string())
                }
                _ => {
                    return Err(DecodeError::InvalidQualifier {
                        qualifier: q_byte,
                        mnemonic: opcode.mnemonic(),
                        offset,
                    })
                }
            },
            Opcode::Action => Operands::Action {
                id: self.read_u16()?,
                args: self.read_u8()?,
            },
            Opcode::Eq | Opcode::Neq if qualifier == Qualifier::StructStruct => {
                Operands::StackSize(self.read_u16()?)
            }
            Opcode::MovSp
            | Opcode::IncISp
            | Opcode::DecISp
            | Opcode::IncIBp
            | Opcode::DecIBp => Operands::StackOffset(self.read_i32()?),
            Opcode::Jmp | Opcode::Jsr | Opcode::Jz | Opcode::Jnz => {
                Operands::Jump(self.read_i32()?)
            }
            Opcode::Destruct => Operands::Destruct {
                size: self.read_u16()?,
                keep_offset: self.read_i16()?,
                keep_size: self.read_u16()?,
            },
            Opcode::StoreState => Operands::StoreState {
                bp: self.read_i32()?,
                sp: self.read_i32()?,
            },
            _ => Operands::None,
        };

        Ok(Instruction {
            offset,
            opcode,
            qualifier,
            operands,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_file(body: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&NCS_SIGNATURE);
        bytes.push(SIZE_TAG);
        bytes.extend_from_slice(&((HEADER_LEN as usize + body.len()) as u32).to_be_bytes());
        bytes.extend_from_slice(body);
        bytes
    }

    #[test]
    fn test_empty_program() {
        let bytes = raw_file(&[]);
        let program = NcsReader::read(&bytes).unwrap();
        assert!(program.instructions.is_empty());
        assert_eq!(program.declared_size, HEADER_LEN);
    }

    #[test]
    fn test_invalid_signature() {
        let mut bytes = raw_file(&[]);
        bytes[0] = b'X';
        assert!(matches!(
            NcsReader::read(&bytes),
            Err(DecodeError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_header_tolerates_bad_signature() {
        let mut bytes = raw_file(&[]);
        bytes[4] = b'2'; // "NCS 2 1.0"-ish
        let header = NcsReader::read_header(&bytes).unwrap();
        assert!(!header.signature_ok);
        assert_eq!(header.declared_size, HEADER_LEN);
    }

    #[test]
    fn test_size_mismatch() {
        let mut bytes = raw_file(&[0x20, 0x00]); // RETN
        let wrong = (bytes.len() as u32 + 4).to_be_bytes();
        bytes[9..13].copy_from_slice(&wrong);
        assert!(matches!(
            NcsReader::read(&bytes),
            Err(DecodeError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_single_retn() {
        let bytes = raw_file(&[0x20, 0x00]);
        let program = NcsReader::read(&bytes).unwrap();
        assert_eq!(program.instructions.len(), 1);
        let retn = &program.instructions[0];
        assert_eq!(retn.opcode, Opcode::Retn);
        assert_eq!(retn.offset, HEADER_LEN);
        assert_eq!(retn.operands, Operands::None);
    }

    #[test]
    fn test_const_string_big_endian_prefix() {
        // CONST string "Hi": opcode 0x04, qualifier 0x05, u16 BE length, bytes
        let bytes = raw_file(&[0x04, 0x05, 0x00, 0x02, b'H', b'i', 0x20, 0x00]);
        let program = NcsReader::read(&bytes).unwrap();
        assert_eq!(
            program.instructions[0].operands,
            Operands::String("Hi".to_string())
        );
        assert_eq!(program.instructions[1].offset, HEADER_LEN + 6);
    }

    #[test]
    fn test_truncated_operand() {
        let bytes = raw_file(&[0x04, 0x03, 0x00, 0x00]); // CONST int missing two bytes
        assert!(matches!(
            NcsReader::read(&bytes),
            Err(DecodeError::UnexpectedEnd(_))
        ));
    }

    #[test]
    fn test_invalid_opcode() {
        let bytes = raw_file(&[0x7F, 0x00]);
        assert!(matches!(
            NcsReader::read(&bytes),
            Err(DecodeError::InvalidOpcode(0x7F, _))
        ));
    }

    #[test]
    fn test_struct_equality_carries_size() {
        // EQUAL with StructStruct qualifier has a u16 size operand
        let bytes = raw_file(&[0x0B, 0x24, 0x00, 0x0C, 0x20, 0x00]);
        let program = NcsReader::read(&bytes).unwrap();
        assert_eq!(program.instructions[0].operands, Operands::StackSize(12));
    }
}
