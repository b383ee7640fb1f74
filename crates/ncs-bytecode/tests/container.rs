//! Integration tests for the NCS container format

use ncs_bytecode::{
    DecodeError, Instruction, NcsReader, NcsWriter, Opcode, Operands, Qualifier, HEADER_LEN,
    NCS_SIGNATURE,
};

#[test]
fn test_full_program_roundtrip() {
    let mut writer = NcsWriter::new();
    writer.emit_rsadd(Qualifier::Int);
    writer.emit_const_int(-7);
    writer.emit_const_float(0.5);
    writer.emit_const_string("module");
    writer.emit_const_object(1);
    writer.emit_cptopsp(-16, 4);
    writer.emit_cpdownsp(-20, 4);
    writer.emit_cptopbp(-4, 4);
    writer.emit_cpdownbp(-4, 4);
    writer.emit_binop(Opcode::Add, Qualifier::IntFloat);
    writer.emit_binop(Opcode::Lt, Qualifier::FloatFloat);
    writer.emit_struct_compare(Opcode::Neq, 16);
    writer.emit_stack_mod(Opcode::DecISp, -8);
    writer.emit_destruct(12, 8, 4);
    writer.emit_action(712, 3);
    writer.emit_store_state(16, 8);
    writer.emit_movsp(-12);
    writer.emit_savebp();
    writer.emit_restorebp();
    writer.emit_nop();
    writer.emit_jump(Opcode::Jmp, 6);
    writer.emit_retn();
    let bytes = writer.into_bytes();

    let program = NcsReader::read(&bytes).unwrap();
    assert_eq!(program.declared_size as usize, bytes.len());
    assert_eq!(program.instructions.len(), 22);

    // Every instruction's offset equals the previous offset plus its length.
    let mut expected = HEADER_LEN;
    for instr in &program.instructions {
        assert_eq!(instr.offset, expected);
        expected += instr.encoded_len();
    }
    assert_eq!(expected as usize, bytes.len());
}

#[test]
fn test_big_endian_operand_layout() {
    let mut writer = NcsWriter::new();
    writer.emit_const_int(0x0102_0304);
    let bytes = writer.into_bytes();

    // opcode, qualifier, then the int most-significant byte first
    assert_eq!(
        &bytes[HEADER_LEN as usize..],
        &[0x04, 0x03, 0x01, 0x02, 0x03, 0x04]
    );
    // declared size is big-endian too
    assert_eq!(bytes[9..13], (bytes.len() as u32).to_be_bytes());
}

#[test]
fn test_truncation_points() {
    let mut writer = NcsWriter::new();
    writer.emit_const_string("truncate me");
    writer.emit_retn();
    let full = writer.into_bytes();

    for cut in (HEADER_LEN as usize + 1)..full.len() {
        let mut shorter = full[..cut].to_vec();
        let size = (shorter.len() as u32).to_be_bytes();
        shorter[9..13].copy_from_slice(&size);
        // Every truncation either decodes fewer instructions or errors;
        // it must never panic.
        match NcsReader::read(&shorter) {
            Ok(program) => assert!(program.instructions.len() <= 2),
            Err(
                DecodeError::UnexpectedEnd(_)
                | DecodeError::InvalidOpcode(..)
                | DecodeError::InvalidQualifier { .. }
                | DecodeError::InvalidUtf8(_),
            ) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
}

#[test]
fn test_listing_shows_jump_targets() {
    let mut writer = NcsWriter::new();
    let jz = writer.reserve_jump(Opcode::Jz);
    writer.emit_nop();
    let target = writer.here();
    writer.patch_jump(jz, target);
    writer.emit_retn();
    let program = NcsReader::read(&writer.into_bytes()).unwrap();

    let listing = program.listing();
    assert!(listing.contains("JZ"), "{listing}");
    assert!(listing.contains(&format!("{target:08X}")), "{listing}");
}

#[test]
fn test_signature_constant() {
    assert_eq!(&NCS_SIGNATURE, b"NCS V1.0");
    let instr = Instruction {
        offset: HEADER_LEN,
        opcode: Opcode::Retn,
        qualifier: Qualifier::None,
        operands: Operands::None,
    };
    assert_eq!(instr.encoded_len(), 2);
}
