//! Subroutine splitting
//!
//! The compiler lays a script out as an entry prologue followed by the
//! subroutine bodies. The prologue pushes module globals (if any), saves the
//! base pointer, and transfers control to `main` with the first `JSR`. Every
//! `JSR` target starts a subroutine; bodies are contiguous, so a body ends
//! where the next one starts.

use crate::analysis::NodeAnalysis;
use crate::error::Diagnostic;
use crate::sub::{SubId, SubroutineState};
use ncs_bytecode::{InstrId, Opcode, Program, Qualifier};
use rustc_hash::FxHashMap;

/// All subroutines of one program
#[derive(Debug, Default)]
pub struct SubTable {
    subs: Vec<SubroutineState>,
    by_entry: FxHashMap<InstrId, SubId>,
}

impl SubTable {
    pub fn get(&self, id: SubId) -> &SubroutineState {
        &self.subs[id.index()]
    }

    pub fn get_mut(&mut self, id: SubId) -> &mut SubroutineState {
        &mut self.subs[id.index()]
    }

    /// Subroutine whose body starts at `entry`
    pub fn by_entry(&self, entry: InstrId) -> Option<SubId> {
        self.by_entry.get(&entry).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubroutineState> {
        self.subs.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = SubId> + '_ {
        (0..self.subs.len() as u32).map(SubId)
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    pub fn globals(&self) -> Option<&SubroutineState> {
        self.subs.iter().find(|s| s.is_globals)
    }

    pub fn main(&self) -> Option<&SubroutineState> {
        self.subs.iter().find(|s| s.is_main)
    }

    fn push(&mut self, mut sub: SubroutineState) -> SubId {
        let id = SubId(self.subs.len() as u32);
        sub.id = id;
        self.by_entry.insert(sub.first, id);
        self.subs.push(sub);
        id
    }
}

/// Partition the program into subroutines
///
/// The entry prologue always becomes subroutine 0 and carries the
/// `is_globals` flag; `main` is the target of the prologue's first `JSR`.
/// A prologue `RSADD int` before that `JSR` marks a `StartingConditional`
/// entry point.
pub fn split_subroutines(
    program: &Program,
    analysis: &NodeAnalysis,
) -> (SubTable, Vec<Diagnostic>) {
    let mut table = SubTable::default();
    let mut diagnostics = Vec::new();
    if program.instructions.is_empty() {
        return (table, diagnostics);
    }

    // Locate the prologue's JSR to main and the prologue's own end.
    let mut main_entry = None;
    let mut prologue_end = None; // id of the prologue RETN
    let mut is_conditional = false;
    let mut has_savebp = false;
    for id in program.ids() {
        let instr = program.get(id).unwrap();
        match instr.opcode {
            Opcode::SaveBp if main_entry.is_none() => has_savebp = true,
            Opcode::Jsr if main_entry.is_none() => {
                // An int slot reserved right before the call means the entry
                // point returns a value: a StartingConditional.
                if id.0 > 0 {
                    if let Some(prev) = program.get(InstrId(id.0 - 1)) {
                        is_conditional = prev.opcode == Opcode::RsAdd
                            && prev.qualifier == Qualifier::Int;
                    }
                }
                main_entry = analysis.try_get_destination(id);
                if main_entry.is_none() {
                    diagnostics.push(Diagnostic::new(
                        "splitter",
                        format!("entry JSR at offset {} has no destination", instr.offset),
                    ));
                }
            }
            Opcode::Retn if main_entry.is_some() && prologue_end.is_none() => {
                prologue_end = Some(id);
            }
            _ => {}
        }
        if prologue_end.is_some() {
            break;
        }
    }

    let last_id = InstrId(program.instructions.len() as u32 - 1);
    let end_offset_of = |id: InstrId| {
        program
            .get(id)
            .map(|i| i.offset + i.encoded_len())
            .unwrap_or(0)
    };

    let Some(main_entry) = main_entry else {
        // No JSR at all: the whole program is one implicit main body.
        let mut sub = SubroutineState::new(
            SubId(0),
            InstrId(0),
            last_id,
            program.instructions[0].offset,
            end_offset_of(last_id),
        );
        sub.is_main = true;
        sub.return_type = Some(ncs_bytecode::NssType::Void);
        table.push(sub);
        return (table, diagnostics);
    };

    let prologue_last = prologue_end.unwrap_or(last_id);
    let mut prologue = SubroutineState::new(
        SubId(0),
        InstrId(0),
        prologue_last,
        program.instructions[0].offset,
        end_offset_of(prologue_last),
    );
    prologue.is_globals = true;
    prologue.is_conditional = is_conditional;
    if !has_savebp {
        // Entry stub with no module globals; still modeled as the globals
        // sub so the main pass has a single shape to handle.
        diagnostics.push(Diagnostic::new(
            "splitter",
            "no SAVEBP in prologue; script has no globals frame".to_string(),
        ));
    }
    table.push(prologue);

    // Collect every JSR target past the prologue; these start the bodies.
    let mut entries: Vec<InstrId> = Vec::new();
    for id in program.ids() {
        let instr = program.get(id).unwrap();
        if instr.opcode == Opcode::Jsr {
            if let Some(dest) = analysis.try_get_destination(id) {
                if !entries.contains(&dest) {
                    entries.push(dest);
                }
            }
        }
    }
    entries.sort();

    for (idx, &entry) in entries.iter().enumerate() {
        let next_entry = entries.get(idx + 1).copied();
        let last = match next_entry {
            Some(next) => InstrId(next.0 - 1),
            None => last_id,
        };
        if last < entry {
            diagnostics.push(Diagnostic::new(
                "splitter",
                format!("subroutine entry {entry} has an empty body"),
            ));
            continue;
        }
        let mut sub = SubroutineState::new(
            SubId(0),
            entry,
            last,
            program.get(entry).map(|i| i.offset).unwrap_or(0),
            end_offset_of(last),
        );
        sub.is_main = entry == main_entry;
        if sub.is_main {
            sub.is_conditional = is_conditional;
        }
        // The matching RETN should be the body's last live instruction.
        let has_retn = (entry.0..=last.0)
            .filter_map(|i| program.get(InstrId(i)))
            .any(|i| i.opcode == Opcode::Retn);
        if !has_retn {
            diagnostics.push(Diagnostic::new(
                "splitter",
                format!("subroutine at offset {} has no RETN", sub.start_offset),
            ));
        }
        table.push(sub);
    }

    (table, diagnostics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passes::{set_destinations, set_positions};
    use ncs_bytecode::{NcsReader, NcsWriter};

    fn split(writer: NcsWriter) -> (SubTable, Vec<Diagnostic>) {
        let program = NcsReader::read(&writer.into_bytes()).unwrap();
        let mut analysis = NodeAnalysis::new();
        set_positions(&program, &mut analysis);
        set_destinations(&program, &mut analysis);
        split_subroutines(&program, &analysis)
    }

    #[test]
    fn test_plain_main() {
        // JSR main; RETN; main: RETN
        let mut writer = NcsWriter::new();
        let jsr = writer.reserve_jump(Opcode::Jsr);
        writer.emit_retn();
        let main = writer.here();
        writer.patch_jump(jsr, main);
        writer.emit_retn();
        let (table, _) = split(writer);

        assert_eq!(table.len(), 2);
        let globals = table.globals().unwrap();
        assert!(globals.is_globals && !globals.is_main);
        let main_sub = table.main().unwrap();
        assert_eq!(main_sub.start_offset, main);
        assert!(!main_sub.is_conditional);
    }

    #[test]
    fn test_starting_conditional() {
        // RSADDI; JSR main; RETN; main: ...
        let mut writer = NcsWriter::new();
        writer.emit_rsadd(Qualifier::Int);
        let jsr = writer.reserve_jump(Opcode::Jsr);
        writer.emit_retn();
        let main = writer.here();
        writer.patch_jump(jsr, main);
        writer.emit_const_int(1);
        writer.emit_cpdownsp(-8, 4);
        writer.emit_movsp(-4);
        writer.emit_retn();
        let (table, _) = split(writer);

        assert!(table.main().unwrap().is_conditional);
    }

    #[test]
    fn test_globals_prologue() {
        // CONST; SAVEBP; JSR main; RESTOREBP; MOVSP; RETN; main: RETN
        let mut writer = NcsWriter::new();
        writer.emit_const_int(7);
        writer.emit_savebp();
        let jsr = writer.reserve_jump(Opcode::Jsr);
        writer.emit_restorebp();
        writer.emit_movsp(-4);
        writer.emit_retn();
        let main = writer.here();
        writer.patch_jump(jsr, main);
        writer.emit_retn();
        let (table, diagnostics) = split(writer);

        assert!(diagnostics.is_empty());
        assert_eq!(table.len(), 2);
        assert!(table.globals().unwrap().contains_offset(13));
        assert_eq!(table.main().unwrap().start_offset, main);
    }

    #[test]
    fn test_three_subroutines_in_address_order() {
        // JSR main; RETN; main: JSR helper; RETN; helper: RETN
        let mut writer = NcsWriter::new();
        let jsr_main = writer.reserve_jump(Opcode::Jsr);
        writer.emit_retn();
        let main = writer.here();
        writer.patch_jump(jsr_main, main);
        let jsr_helper = writer.reserve_jump(Opcode::Jsr);
        writer.emit_retn();
        let helper = writer.here();
        writer.patch_jump(jsr_helper, helper);
        writer.emit_retn();
        let (table, _) = split(writer);

        assert_eq!(table.len(), 3);
        let subs: Vec<_> = table.iter().collect();
        assert!(subs[0].is_globals);
        assert!(subs[1].is_main);
        assert_eq!(subs[2].start_offset, helper);
        assert_eq!(subs[1].end_offset, helper);
    }
}
