//! Position and jump-destination resolution

use crate::analysis::NodeAnalysis;
use crate::error::Diagnostic;
use ncs_bytecode::Program;

/// Record every instruction's byte position
pub fn set_positions(program: &Program, analysis: &mut NodeAnalysis) {
    for id in program.ids() {
        if let Some(instr) = program.get(id) {
            analysis.set_pos(id, instr.offset);
        }
    }
}

/// Resolve each jump's absolute target and record reverse edges
///
/// A jump past the end of the program (or into the middle of an
/// instruction) is clamped to the nearest instruction at or before the
/// target and flagged; downstream transforms treat the flagged jump like
/// any other, so output degrades instead of the pass aborting.
pub fn set_destinations(program: &Program, analysis: &mut NodeAnalysis) -> Vec<Diagnostic> {
    let mut flagged = Vec::new();
    for id in program.ids() {
        let Some(instr) = program.get(id) else { continue };
        let Some(target_offset) = instr.jump_target() else {
            continue;
        };
        let target = match program.id_at_offset(target_offset) {
            Some(target) => target,
            None => {
                let clamped = program.id_at_or_before(target_offset);
                flagged.push(Diagnostic::new(
                    "set-destinations",
                    format!(
                        "jump at offset {} to invalid destination {}{}",
                        instr.offset,
                        target_offset,
                        match clamped {
                            Some(c) => format!(", clamped to {c}"),
                            None => ", no earlier instruction".to_string(),
                        }
                    ),
                ));
                match clamped {
                    Some(clamped) => clamped,
                    None => continue,
                }
            }
        };
        analysis.set_destination(id, target);
        analysis.add_origin(target, id);
    }
    flagged
}

#[cfg(test)]
mod tests {
    use super::*;
    use ncs_bytecode::{InstrId, NcsReader, NcsWriter, Opcode};

    fn decode(writer: NcsWriter) -> Program {
        NcsReader::read(&writer.into_bytes()).unwrap()
    }

    #[test]
    fn test_destinations_and_origins() {
        let mut writer = NcsWriter::new();
        let jz = writer.reserve_jump(Opcode::Jz); // i0
        writer.emit_const_int(1); // i1
        let target = writer.here();
        writer.patch_jump(jz, target);
        writer.emit_retn(); // i2
        let program = decode(writer);

        let mut analysis = NodeAnalysis::new();
        set_positions(&program, &mut analysis);
        let flagged = set_destinations(&program, &mut analysis);
        assert!(flagged.is_empty());
        assert_eq!(analysis.try_get_destination(InstrId(0)), Some(InstrId(2)));
        assert_eq!(analysis.origins_of(InstrId(2)), &[InstrId(0)]);
    }

    #[test]
    fn test_bad_jump_is_clamped_and_flagged() {
        let mut writer = NcsWriter::new();
        writer.emit_jump(Opcode::Jmp, 9999); // off the end
        writer.emit_retn();
        let program = decode(writer);

        let mut analysis = NodeAnalysis::new();
        set_positions(&program, &mut analysis);
        let flagged = set_destinations(&program, &mut analysis);
        assert_eq!(flagged.len(), 1);
        // clamped to the last instruction
        assert_eq!(analysis.try_get_destination(InstrId(0)), Some(InstrId(1)));
    }

    #[test]
    fn test_backward_jump_origin_recorded() {
        let mut writer = NcsWriter::new();
        writer.emit_const_int(0); // i0 (loop head)
        writer.emit_movsp(-4); // i1
        let head = 13;
        writer.emit_jump_to(Opcode::Jmp, head); // i2
        writer.emit_retn(); // i3
        let program = decode(writer);

        let mut analysis = NodeAnalysis::new();
        set_positions(&program, &mut analysis);
        set_destinations(&program, &mut analysis);
        assert_eq!(analysis.origins_of(InstrId(0)), &[InstrId(2)]);
        assert!(analysis.is_jump_target(InstrId(0)));
    }
}
