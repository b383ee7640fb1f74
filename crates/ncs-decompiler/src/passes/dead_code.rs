//! Reachability-based dead-code marking

use crate::analysis::NodeAnalysis;
use ncs_bytecode::{InstrId, Opcode, Program};
use rustc_hash::FxHashSet;

/// Mark every instruction unreachable from the entry as dead
///
/// Successors: an unconditional `JMP` flows only to its target; `JZ`/`JNZ`
/// to both the target and the fall-through; `JSR` falls through (the callee
/// returns); `RETN` ends the walk. The main pass later skips dead
/// instructions, advancing only its end-of-scope bookkeeping.
pub fn set_dead_code(program: &Program, analysis: &mut NodeAnalysis) {
    if program.instructions.is_empty() {
        return;
    }

    let mut reachable = FxHashSet::default();
    let mut worklist = vec![InstrId(0)];

    while let Some(id) = worklist.pop() {
        if !reachable.insert(id) {
            continue;
        }
        let Some(instr) = program.get(id) else { continue };
        let fall_through = InstrId(id.0 + 1);
        match instr.opcode {
            Opcode::Jmp => {
                if let Some(dest) = analysis.try_get_destination(id) {
                    worklist.push(dest);
                }
                // The jump bracketing a STORE_STATE block skips code that
                // still runs later, when the stored state fires.
                let after_store_state = id.0 > 0
                    && program
                        .get(InstrId(id.0 - 1))
                        .map(|p| p.opcode == Opcode::StoreState)
                        .unwrap_or(false);
                if after_store_state {
                    worklist.push(fall_through);
                }
            }
            Opcode::Jz | Opcode::Jnz => {
                if let Some(dest) = analysis.try_get_destination(id) {
                    worklist.push(dest);
                }
                worklist.push(fall_through);
            }
            Opcode::Jsr => {
                if let Some(dest) = analysis.try_get_destination(id) {
                    worklist.push(dest);
                }
                worklist.push(fall_through);
            }
            Opcode::Retn => {}
            _ => worklist.push(fall_through),
        }
    }

    for id in program.ids() {
        if !reachable.contains(&id) {
            analysis.mark_dead(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passes::{set_destinations, set_positions};
    use ncs_bytecode::{NcsReader, NcsWriter};

    fn analyze(writer: NcsWriter) -> (Program, NodeAnalysis) {
        let program = NcsReader::read(&writer.into_bytes()).unwrap();
        let mut analysis = NodeAnalysis::new();
        set_positions(&program, &mut analysis);
        set_destinations(&program, &mut analysis);
        set_dead_code(&program, &mut analysis);
        (program, analysis)
    }

    #[test]
    fn test_code_after_retn_is_dead() {
        let mut writer = NcsWriter::new();
        writer.emit_retn(); // i0
        writer.emit_const_int(1); // i1 unreachable
        writer.emit_retn(); // i2 unreachable
        let (_, analysis) = analyze(writer);
        assert!(!analysis.is_dead(InstrId(0)));
        assert!(analysis.is_dead(InstrId(1)));
        assert!(analysis.is_dead(InstrId(2)));
    }

    #[test]
    fn test_jump_skipped_code_is_dead() {
        let mut writer = NcsWriter::new();
        let jmp = writer.reserve_jump(Opcode::Jmp); // i0
        writer.emit_const_int(1); // i1 skipped
        let target = writer.here();
        writer.patch_jump(jmp, target);
        writer.emit_retn(); // i2
        let (_, analysis) = analyze(writer);
        assert!(analysis.is_dead(InstrId(1)));
        assert!(!analysis.is_dead(InstrId(2)));
    }

    #[test]
    fn test_conditional_keeps_both_arms() {
        let mut writer = NcsWriter::new();
        writer.emit_const_int(1); // i0
        let jz = writer.reserve_jump(Opcode::Jz); // i1
        writer.emit_const_int(2); // i2 then-arm
        let target = writer.here();
        writer.patch_jump(jz, target);
        writer.emit_retn(); // i3
        let (_, analysis) = analyze(writer);
        for i in 0..4 {
            assert!(!analysis.is_dead(InstrId(i)), "i{i} should be live");
        }
    }

    #[test]
    fn test_jsr_falls_through() {
        let mut writer = NcsWriter::new();
        let jsr = writer.reserve_jump(Opcode::Jsr); // i0
        writer.emit_retn(); // i1 (after the call returns)
        let target = writer.here();
        writer.patch_jump(jsr, target);
        writer.emit_retn(); // i2 (callee)
        let (_, analysis) = analyze(writer);
        assert!(!analysis.is_dead(InstrId(1)));
        assert!(!analysis.is_dead(InstrId(2)));
    }
}
