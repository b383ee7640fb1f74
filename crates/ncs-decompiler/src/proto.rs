//! Prototype engine
//!
//! Assigns every subroutine a return type and ordered parameter types. One
//! round runs a symbolic stack simulation over each subroutine
//! (`propagate_types`); rounds repeat until nothing changes. The type set is
//! finite and every refinement is monotone (unknown -> concrete, never
//! back), so the fixed point exists; the round cap only guards against
//! malformed inputs that keep a subroutine permanently blocked.
//!
//! Signature facts fall out of the calling convention:
//! - the callee pops its own parameters, so the stack depth at `RETN` is
//!   minus the parameter byte count;
//! - a `CPDOWNSP` that writes below the parameter frame fills the caller's
//!   reserved return slot, giving the return type;
//! - parameter types surface wherever a parameter-sourced value meets a
//!   typed consumer (an action argument, a typed operator, a callee with a
//!   known signature).

use crate::analysis::NodeAnalysis;
use crate::error::Diagnostic;
use crate::passes::SubTable;
use crate::sub::SubId;
use ncs_actions::ActionsData;
use ncs_bytecode::{InstrId, NssType, Opcode, Operands, Program, Qualifier};
use rustc_hash::FxHashMap;

/// Round cap for pathological inputs
pub const MAX_ROUNDS: u32 = 1_000;

/// One simulated stack slot
#[derive(Debug, Clone, Copy)]
struct SimSlot {
    ty: Option<NssType>,
    /// Entry-relative byte position, when this value came from a parameter
    param: Option<i32>,
}

impl SimSlot {
    fn typed(ty: NssType) -> Self {
        Self {
            ty: Some(ty),
            param: None,
        }
    }

    fn unknown() -> Self {
        Self {
            ty: None,
            param: None,
        }
    }
}

/// What one subroutine simulation produced
#[derive(Debug, Default)]
struct SimOutcome {
    /// Bytes of parameters popped at RETN
    param_bytes: Option<u32>,
    /// Writes below the entry depth: (position, written type, byte size)
    neg_writes: Vec<(i32, Option<NssType>, u16)>,
    /// Parameter positions whose type a consumer pinned down
    discoveries: Vec<(i32, NssType)>,
    /// A JSR callee had no signature yet; retry next round
    blocked: bool,
}

/// Fixed-point prototype solver
pub struct ProtoSolver<'a> {
    program: &'a Program,
    analysis: &'a NodeAnalysis,
    actions: Option<&'a ActionsData>,
    /// Per-sub discovered parameter types, keyed by entry-relative position
    discovered: FxHashMap<SubId, FxHashMap<i32, NssType>>,
    /// Types of the globals frame, bottom first; fixed at SAVEBP
    pub globals_layout: Vec<Option<NssType>>,
}

impl<'a> ProtoSolver<'a> {
    pub fn new(
        program: &'a Program,
        analysis: &'a NodeAnalysis,
        actions: Option<&'a ActionsData>,
    ) -> Self {
        Self {
            program,
            analysis,
            actions,
            discovered: FxHashMap::default(),
            globals_layout: Vec::new(),
        }
    }

    /// Run rounds to a fixed point and finalize every signature
    pub fn solve(&mut self, subs: &mut SubTable, strict: bool) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();

        // Seed the conventional entry signature.
        let main_id = subs.iter().find(|s| s.is_main).map(|s| s.id);
        if let Some(main_id) = main_id {
            let main = subs.get_mut(main_id);
            if main.param_bytes.is_none() {
                main.param_bytes = Some(0);
            }
            if main.return_type.is_none() {
                main.return_type = Some(if main.is_conditional {
                    NssType::Int
                } else {
                    NssType::Void
                });
                main.return_slots = if main.is_conditional { 1 } else { 0 };
            }
        }

        let mut rounds = 0;
        loop {
            rounds += 1;
            let mut changed = false;

            // Globals first; callers read the layout through CPTOPBP.
            if let Some(globals) = subs.globals() {
                let (first, last) = (globals.first, globals.last);
                if self.globals_layout.is_empty() {
                    let layout = self.capture_globals_layout(first, last, subs);
                    if !layout.is_empty() {
                        self.globals_layout = layout;
                        changed = true;
                    }
                }
            }

            for id in subs.ids().collect::<Vec<_>>() {
                if subs.get(id).is_globals {
                    continue;
                }
                let (first, last) = {
                    let sub = subs.get(id);
                    (sub.first, sub.last)
                };
                let outcome = self.simulate_range(first, last, subs);
                if outcome.blocked {
                    continue;
                }
                changed |= self.apply_outcome(id, outcome, subs);
            }

            if !changed || rounds >= MAX_ROUNDS {
                break;
            }
        }

        // Finalize: size the parameter vectors, default leftovers to int.
        for id in subs.ids().collect::<Vec<_>>() {
            let discovered = self.discovered.get(&id).cloned().unwrap_or_default();
            let sub = subs.get_mut(id);
            if sub.is_globals {
                continue;
            }
            let param_bytes = match sub.param_bytes {
                Some(bytes) => bytes,
                None => {
                    diagnostics.push(Diagnostic::new(
                        "prototype",
                        format!("{} never reached RETN; assuming no parameters", sub.id),
                    ));
                    sub.param_bytes = Some(0);
                    0
                }
            };
            let slots = (param_bytes / 4) as usize;
            sub.params = (0..slots)
                .map(|i| discovered.get(&(i as i32 * 4 - param_bytes as i32)).copied())
                .collect();
            if sub.return_type.is_none() {
                sub.return_type = Some(NssType::Void);
            }
            sub.update_prototyped();
            if !sub.totally_prototyped {
                let unresolved = sub.params.iter().filter(|p| p.is_none()).count();
                for p in sub.params.iter_mut() {
                    if p.is_none() {
                        *p = Some(NssType::Int);
                    }
                }
                let message = format!(
                    "{}: {} parameter slot(s) defaulted to int",
                    sub.id, unresolved
                );
                diagnostics.push(Diagnostic::new(
                    if strict { "prototype(strict)" } else { "prototype" },
                    message,
                ));
                sub.update_prototyped();
            }
        }

        if rounds >= MAX_ROUNDS {
            diagnostics.push(Diagnostic::new(
                "prototype",
                format!("fixed point not reached after {MAX_ROUNDS} rounds"),
            ));
        }
        diagnostics
    }

    /// Fold a simulation outcome into the subroutine state
    fn apply_outcome(&mut self, id: SubId, outcome: SimOutcome, subs: &mut SubTable) -> bool {
        let mut changed = false;
        let discovered = self.discovered.entry(id).or_default();
        for (pos, ty) in outcome.discoveries {
            if discovered.insert(pos, ty) != Some(ty) {
                changed = true;
            }
        }

        let sub = subs.get_mut(id);
        if let Some(bytes) = outcome.param_bytes {
            if sub.param_bytes.is_none() {
                sub.param_bytes = Some(bytes);
                changed = true;
            }
        }

        if let (Some(param_bytes), None) = (sub.param_bytes, sub.return_type) {
            let frame_floor = -(param_bytes as i32);
            let below: Vec<_> = outcome
                .neg_writes
                .iter()
                .filter(|(pos, _, _)| *pos < frame_floor)
                .collect();
            if !below.is_empty() {
                let min_pos = below.iter().map(|(p, _, _)| *p).min().unwrap();
                let ret_bytes = (frame_floor - min_pos) as u32;
                let (ty, slots) = match ret_bytes {
                    4 => (
                        below
                            .iter()
                            .find_map(|(_, ty, _)| *ty)
                            .unwrap_or(NssType::Int),
                        1,
                    ),
                    12 => (NssType::Vector, 3),
                    _ => (NssType::Struct, ret_bytes / 4),
                };
                sub.return_type = Some(ty);
                sub.return_slots = slots;
                changed = true;
            } else if outcome.param_bytes.is_some() && sub.return_type.is_none() {
                // Reached RETN without touching anything below the frame.
                sub.return_type = Some(NssType::Void);
                sub.return_slots = 0;
                changed = true;
            }
        }
        changed
    }

    /// Replay the prologue up to SAVEBP and capture the stack as the
    /// globals layout
    fn capture_globals_layout(
        &self,
        first: InstrId,
        last: InstrId,
        subs: &SubTable,
    ) -> Vec<Option<NssType>> {
        let mut stack: Vec<SimSlot> = Vec::new();
        for raw in first.0..=last.0 {
            let id = InstrId(raw);
            let Some(instr) = self.program.get(id) else { break };
            if instr.opcode == Opcode::SaveBp {
                return stack.iter().map(|s| s.ty).collect();
            }
            if instr.opcode == Opcode::Retn {
                break;
            }
            if instr.opcode == Opcode::Jsr || instr.opcode.is_jump() {
                // Initializer calls complicate the prologue; fall back to
                // whatever is typed so far once control flow shows up.
                if instr.opcode == Opcode::Jsr {
                    let Some(dest) = self.analysis.try_get_destination(id) else {
                        break;
                    };
                    let Some(callee) = subs.by_entry(dest) else { break };
                    let callee = subs.get(callee);
                    let Some(param_bytes) = callee.param_bytes else {
                        return Vec::new(); // blocked; retry next round
                    };
                    let pop = (param_bytes / 4) as usize;
                    if pop > stack.len() {
                        break;
                    }
                    stack.truncate(stack.len() - pop);
                    continue;
                }
                break;
            }
            let mut scratch = SimOutcome::default();
            if self
                .apply_instruction(instr, &mut stack, &mut 0, &mut scratch, subs)
                .is_err()
            {
                break;
            }
            if scratch.blocked {
                return Vec::new();
            }
        }
        stack.iter().map(|s| s.ty).collect()
    }

    /// Simulate one subroutine's instruction range
    ///
    /// Control flow is handled with saved stacks at jump targets: forward
    /// jumps store a snapshot, terminators end the current path, and the
    /// linear scan resumes at the next instruction that has a snapshot.
    fn simulate_range(&self, first: InstrId, last: InstrId, subs: &SubTable) -> SimOutcome {
        let mut outcome = SimOutcome::default();
        let mut saved: FxHashMap<InstrId, Vec<SimSlot>> = FxHashMap::default();
        let mut current: Option<(Vec<SimSlot>, i32)> = Some((Vec::new(), 0));

        for raw in first.0..=last.0 {
            let id = InstrId(raw);
            let Some(instr) = self.program.get(id) else { break };

            if let Some(snapshot) = saved.remove(&id) {
                if current.is_none() {
                    current = Some((snapshot, 0));
                }
            }
            let Some((ref mut stack, ref mut base)) = current else {
                continue; // dead or unreached on this pass
            };

            match instr.opcode {
                Opcode::Retn => {
                    if outcome.param_bytes.is_none() {
                        outcome.param_bytes = Some(*base as u32);
                    }
                    current = None;
                }
                Opcode::Jmp => {
                    if let Some(dest) = self.analysis.try_get_destination(id) {
                        if dest > id {
                            saved.entry(dest).or_insert_with(|| stack.clone());
                        }
                    }
                    current = None;
                }
                Opcode::Jz | Opcode::Jnz => {
                    if let Some(top) = stack.pop() {
                        if let Some(pos) = top.param {
                            outcome.discoveries.push((pos, NssType::Int));
                        }
                    }
                    if let Some(dest) = self.analysis.try_get_destination(id) {
                        if dest > id {
                            saved.entry(dest).or_insert_with(|| stack.clone());
                        }
                    }
                }
                Opcode::Jsr => {
                    let callee = self
                        .analysis
                        .try_get_destination(id)
                        .and_then(|dest| subs.by_entry(dest));
                    let Some(callee) = callee else {
                        outcome.blocked = true;
                        return outcome;
                    };
                    let callee = subs.get(callee);
                    let Some(param_bytes) = callee.param_bytes else {
                        outcome.blocked = true;
                        return outcome;
                    };
                    let pop = (param_bytes / 4) as usize;
                    let popped = pop_slots(stack, pop);
                    for (i, slot) in popped.iter().enumerate() {
                        if let (Some(pos), Some(ty)) =
                            (slot.param, callee.params.get(i).copied().flatten())
                        {
                            outcome.discoveries.push((pos, ty));
                        }
                    }
                    // The caller reserved the return slots just below the
                    // arguments; type them now.
                    if let Some(ret) = callee.return_type {
                        let slots = callee.return_slots as usize;
                        let component = match ret {
                            NssType::Vector => Some(NssType::Float),
                            NssType::Struct => None, // member types stay as reserved
                            ty if slots == 1 => Some(ty),
                            _ => None,
                        };
                        let len = stack.len();
                        for slot in stack[len.saturating_sub(slots)..].iter_mut() {
                            if slot.ty.is_none() {
                                slot.ty = component;
                            }
                        }
                    }
                }
                _ => {
                    if self
                        .apply_instruction(instr, stack, base, &mut outcome, subs)
                        .is_err()
                    {
                        // Simulation lost track; stop refining this sub.
                        return outcome;
                    }
                    if outcome.blocked {
                        return outcome;
                    }
                }
            }
        }
        outcome
    }

    /// Stack effect of a non-control-flow instruction
    fn apply_instruction(
        &self,
        instr: &ncs_bytecode::Instruction,
        stack: &mut Vec<SimSlot>,
        base: &mut i32,
        outcome: &mut SimOutcome,
        _subs: &SubTable,
    ) -> Result<(), ()> {
        let depth = |stack: &Vec<SimSlot>, base: &i32| 4 * stack.len() as i32 - *base;
        match instr.opcode {
            Opcode::Const => {
                let ty = match instr.qualifier {
                    Qualifier::Int => NssType::Int,
                    Qualifier::Float => NssType::Float,
                    Qualifier::String => NssType::String,
                    Qualifier::Object => NssType::Object,
                    _ => return Err(()),
                };
                stack.push(SimSlot::typed(ty));
            }
            Opcode::RsAdd => {
                let ty = instr.qualifier.scalar_type().ok_or(())?;
                stack.push(SimSlot::typed(ty));
            }
            Opcode::CpTopSp => {
                let Operands::OffsetAndSize { offset, size } = instr.operands else {
                    return Err(());
                };
                let pos = depth(stack, base) + offset;
                let slots = (size / 4) as usize;
                for k in 0..slots {
                    let p = pos + 4 * k as i32;
                    if p < 0 {
                        stack.push(SimSlot {
                            ty: None,
                            param: Some(p),
                        });
                    } else {
                        let idx = (p / 4) as usize;
                        let copy = stack.get(idx).copied().unwrap_or(SimSlot::unknown());
                        stack.push(copy);
                    }
                }
            }
            Opcode::CpDownSp => {
                let Operands::OffsetAndSize { offset, size } = instr.operands else {
                    return Err(());
                };
                let pos = depth(stack, base) + offset;
                let slots = (size / 4) as usize;
                let len = stack.len();
                if slots > len {
                    return Err(());
                }
                for k in 0..slots {
                    let src = stack[len - slots + k];
                    let p = pos + 4 * k as i32;
                    if p < 0 {
                        outcome.neg_writes.push((p, src.ty, 4));
                    } else {
                        let idx = (p / 4) as usize;
                        if let Some(dest) = stack.get_mut(idx) {
                            if dest.ty.is_none() {
                                dest.ty = src.ty;
                            }
                            if let (Some(param_pos), Some(ty)) = (dest.param, src.ty) {
                                outcome.discoveries.push((param_pos, ty));
                            }
                        }
                    }
                }
            }
            Opcode::CpTopBp => {
                let Operands::OffsetAndSize { offset, size } = instr.operands else {
                    return Err(());
                };
                let g = self.globals_layout.len() as i32;
                let slots = (size / 4) as usize;
                for k in 0..slots {
                    let idx = g + (offset + 4 * k as i32) / 4;
                    let ty = if idx >= 0 {
                        self.globals_layout.get(idx as usize).copied().flatten()
                    } else {
                        None
                    };
                    stack.push(SimSlot { ty, param: None });
                }
            }
            Opcode::CpDownBp => {
                let Operands::OffsetAndSize { size, .. } = instr.operands else {
                    return Err(());
                };
                let _ = size; // write-through; globals keep their init types
            }
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod => {
                let (lhs, rhs) = instr.qualifier.operand_pair().ok_or(())?;
                self.pop_typed(stack, rhs, outcome);
                self.pop_typed(stack, lhs, outcome);
                let result = instr.qualifier.arithmetic_result().ok_or(())?;
                for _ in 0..result.slot_count() {
                    stack.push(SimSlot::typed(if result == NssType::Vector {
                        NssType::Float
                    } else {
                        result
                    }));
                }
            }
            Opcode::Eq | Opcode::Neq | Opcode::Geq | Opcode::Gt | Opcode::Lt | Opcode::Leq => {
                if let Operands::StackSize(size) = instr.operands {
                    pop_slots(stack, (size / 4) as usize * 2);
                } else {
                    let (lhs, rhs) = instr.qualifier.operand_pair().ok_or(())?;
                    self.pop_typed(stack, rhs, outcome);
                    self.pop_typed(stack, lhs, outcome);
                }
                stack.push(SimSlot::typed(NssType::Int));
            }
            Opcode::LogAnd
            | Opcode::LogOr
            | Opcode::IncOr
            | Opcode::ExcOr
            | Opcode::BoolAnd
            | Opcode::ShLeft
            | Opcode::ShRight
            | Opcode::UnShRight => {
                self.pop_typed(stack, NssType::Int, outcome);
                self.pop_typed(stack, NssType::Int, outcome);
                stack.push(SimSlot::typed(NssType::Int));
            }
            Opcode::Neg => {
                let ty = instr.qualifier.scalar_type().unwrap_or(NssType::Int);
                self.pop_typed(stack, ty, outcome);
                stack.push(SimSlot::typed(ty));
            }
            Opcode::Not | Opcode::Comp => {
                self.pop_typed(stack, NssType::Int, outcome);
                stack.push(SimSlot::typed(NssType::Int));
            }
            Opcode::MovSp => {
                let Operands::StackOffset(delta) = instr.operands else {
                    return Err(());
                };
                if delta >= 0 {
                    for _ in 0..(delta / 4) {
                        stack.push(SimSlot::unknown());
                    }
                } else {
                    let mut pop = (-delta / 4) as usize;
                    while pop > 0 && !stack.is_empty() {
                        stack.pop();
                        pop -= 1;
                    }
                    *base += 4 * pop as i32; // remainder reaches below entry
                }
            }
            Opcode::IncISp | Opcode::DecISp => {
                let Operands::StackOffset(offset) = instr.operands else {
                    return Err(());
                };
                let pos = depth(stack, base) + offset;
                if pos < 0 {
                    outcome.discoveries.push((pos, NssType::Int));
                } else if let Some(slot) = stack.get_mut((pos / 4) as usize) {
                    slot.ty = Some(NssType::Int);
                }
            }
            Opcode::IncIBp | Opcode::DecIBp => {}
            Opcode::Action => {
                let Operands::Action { id, args } = instr.operands else {
                    return Err(());
                };
                match self.actions.and_then(|table| table.get(id)) {
                    Some(action) => {
                        for param in action.params.iter().take(args as usize) {
                            if param.ty == NssType::Action {
                                continue; // captured by STORE_STATE, not stacked
                            }
                            let slots = param.ty.slot_count() as usize;
                            for slot in pop_slots(stack, slots) {
                                if let Some(pos) = slot.param {
                                    outcome.discoveries.push((pos, param.ty));
                                }
                            }
                        }
                        let ret = action.returns;
                        for _ in 0..ret.slot_count() {
                            stack.push(SimSlot::typed(if ret == NssType::Vector {
                                NssType::Float
                            } else {
                                ret
                            }));
                        }
                    }
                    None => {
                        pop_slots(stack, args as usize);
                    }
                }
            }
            Opcode::Destruct => {
                let Operands::Destruct {
                    size,
                    keep_offset,
                    keep_size,
                } = instr.operands
                else {
                    return Err(());
                };
                let slots = (size / 4) as usize;
                let region = pop_slots(stack, slots);
                let from = (keep_offset / 4) as usize;
                let keep = (keep_size / 4) as usize;
                for k in 0..keep {
                    let slot = region.get(from + k).copied().unwrap_or(SimSlot::unknown());
                    stack.push(slot);
                }
            }
            Opcode::StoreState | Opcode::SaveBp | Opcode::RestoreBp | Opcode::Nop => {}
            Opcode::Jmp | Opcode::Jsr | Opcode::Jz | Opcode::Jnz | Opcode::Retn => {
                unreachable!("control flow handled by simulate_range")
            }
        }
        Ok(())
    }

    /// Pop the slots of one typed operand, recording parameter discoveries
    fn pop_typed(&self, stack: &mut Vec<SimSlot>, ty: NssType, outcome: &mut SimOutcome) {
        let slots = ty.slot_count().max(1) as usize;
        for slot in pop_slots(stack, slots) {
            if let Some(pos) = slot.param {
                let component = if ty == NssType::Vector {
                    NssType::Float
                } else {
                    ty
                };
                outcome.discoveries.push((pos, component));
            }
        }
    }
}

/// Pop up to `count` slots, returning them bottom first
fn pop_slots(stack: &mut Vec<SimSlot>, count: usize) -> Vec<SimSlot> {
    let cut = stack.len().saturating_sub(count);
    stack.split_off(cut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passes::{set_destinations, set_positions, split_subroutines};
    use ncs_actions::{ActionsData, Game};
    use ncs_bytecode::{NcsReader, NcsWriter};

    fn actions() -> ActionsData {
        ActionsData::parse(
            Game::K1,
            "void PrintString(string sString);\n\
             int GetCount(object oTarget);\n\
             float GetFacing(object oTarget);\n",
        )
        .unwrap()
    }

    fn solve(writer: NcsWriter) -> (SubTable, Vec<Diagnostic>) {
        let program = NcsReader::read(&writer.into_bytes()).unwrap();
        let mut analysis = NodeAnalysis::new();
        set_positions(&program, &mut analysis);
        set_destinations(&program, &mut analysis);
        let (mut subs, _) = split_subroutines(&program, &analysis);
        let table = actions();
        let mut solver = ProtoSolver::new(&program, &analysis, Some(&table));
        let diagnostics = solver.solve(&mut subs, false);
        (subs, diagnostics)
    }

    #[test]
    fn test_void_main_no_params() {
        let mut writer = NcsWriter::new();
        let jsr = writer.reserve_jump(Opcode::Jsr);
        writer.emit_retn();
        let main = writer.here();
        writer.patch_jump(jsr, main);
        writer.emit_retn();
        let (subs, _) = solve(writer);

        let main = subs.main().unwrap();
        assert_eq!(main.return_type, Some(NssType::Void));
        assert_eq!(main.param_count(), 0);
        assert!(main.totally_prototyped);
    }

    #[test]
    fn test_helper_param_type_from_action() {
        // main: CONST_S "x"; JSR helper; RETN
        // helper: CPTOPSP -4,4; ACTION PrintString(1); MOVSP -4; RETN
        let mut writer = NcsWriter::new();
        let jsr_main = writer.reserve_jump(Opcode::Jsr);
        writer.emit_retn();
        let main = writer.here();
        writer.patch_jump(jsr_main, main);
        writer.emit_const_string("x");
        let jsr_helper = writer.reserve_jump(Opcode::Jsr);
        writer.emit_retn();
        let helper = writer.here();
        writer.patch_jump(jsr_helper, helper);
        writer.emit_cptopsp(-4, 4);
        writer.emit_action(0, 1); // PrintString
        writer.emit_movsp(-4); // pop the parameter
        writer.emit_retn();
        let (subs, diagnostics) = solve(writer);

        let helper_sub = subs.iter().find(|s| s.start_offset == helper).unwrap();
        assert_eq!(helper_sub.param_bytes, Some(4));
        assert_eq!(helper_sub.params, vec![Some(NssType::String)]);
        assert_eq!(helper_sub.return_type, Some(NssType::Void));
        assert!(helper_sub.totally_prototyped, "{diagnostics:?}");
    }

    #[test]
    fn test_return_type_from_frame_write() {
        // helper returns an int: CONST_I 7; CPDOWNSP -8,4; MOVSP -4; ...
        // with one int parameter.
        let mut writer = NcsWriter::new();
        let jsr_main = writer.reserve_jump(Opcode::Jsr);
        writer.emit_retn();
        let main = writer.here();
        writer.patch_jump(jsr_main, main);
        writer.emit_rsadd(Qualifier::Int); // return slot
        writer.emit_const_int(3); // argument
        let jsr_helper = writer.reserve_jump(Opcode::Jsr);
        writer.emit_movsp(-4); // discard result
        writer.emit_retn();
        let helper = writer.here();
        writer.patch_jump(jsr_helper, helper);
        writer.emit_const_int(7);
        // write over the reserved slot: below the 4 parameter bytes
        writer.emit_cpdownsp(-12, 4);
        writer.emit_movsp(-4); // pop the 7
        writer.emit_movsp(-4); // pop the parameter
        writer.emit_retn();
        let (subs, _) = solve(writer);

        let helper_sub = subs.iter().find(|s| s.start_offset == helper).unwrap();
        assert_eq!(helper_sub.param_bytes, Some(4));
        assert_eq!(helper_sub.return_type, Some(NssType::Int));
        assert_eq!(helper_sub.return_slots, 1);
    }

    #[test]
    fn test_unresolved_param_defaults_to_int() {
        // helper takes one param it never uses in a typed context.
        let mut writer = NcsWriter::new();
        let jsr_main = writer.reserve_jump(Opcode::Jsr);
        writer.emit_retn();
        let main = writer.here();
        writer.patch_jump(jsr_main, main);
        writer.emit_const_int(3);
        let jsr_helper = writer.reserve_jump(Opcode::Jsr);
        writer.emit_retn();
        let helper = writer.here();
        writer.patch_jump(jsr_helper, helper);
        writer.emit_movsp(-4); // pop the parameter, untouched
        writer.emit_retn();
        let (subs, diagnostics) = solve(writer);

        let helper_sub = subs.iter().find(|s| s.start_offset == helper).unwrap();
        assert_eq!(helper_sub.params, vec![Some(NssType::Int)]);
        assert!(diagnostics
            .iter()
            .any(|d| d.message.contains("defaulted to int")));
    }

    #[test]
    fn test_conditional_entry_returns_int() {
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
        let (subs, _) = solve(writer);

        let main = subs.main().unwrap();
        assert!(main.is_conditional);
        assert_eq!(main.return_type, Some(NssType::Int));
    }
}
