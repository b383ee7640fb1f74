//! Stack-to-tree reconstruction
//!
//! `SubScriptState` replays one subroutine's instructions against a symbolic
//! slot stack while growing a statement tree. Pending expressions are the
//! trailing expression children of the open container: pushes append there,
//! consumers detach from there. Scope bookkeeping is offset-driven: every
//! container knows (or learns) the offset one past its last instruction, and
//! `check_end` closes containers whose end the replay position has reached.
//!
//! Each transform recovers locally. A missing argument becomes a
//! `__unknown_param_N` placeholder; anything worse becomes an `ErrorComment`
//! node, and the replay keeps going with the rest of the subroutine.

use crate::analysis::NodeAnalysis;
use crate::ast::{Ast, BinOp, CondOp, NodeId, NodeKind, UnOp, UnaryModOp};
use crate::config::Config;
use crate::error::{Diagnostic, TransformError};
use crate::passes::SubTable;
use crate::sub::SubId;
use crate::var::{ConstValue, VarId, VarTable};
use ncs_actions::ActionsData;
use ncs_bytecode::{InstrId, Instruction, NssType, Opcode, Operands, Program};
use rustc_hash::{FxHashMap, FxHashSet};

/// Mini state machine of the reconstruction visitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Normal,
    /// An assignment sits as the last child; the next MOVSP pops its value
    InMod,
    /// Between STORE_STATE and the jump that brackets the deferred block
    InActionArg,
    /// A while loop is open and its condition has not been bound yet
    WhileCond,
    /// Collecting jump-into-case tests of a switch
    SwitchCases,
    /// A prefix ++/-- waits for the copy that reads the new value
    InPrefixStack,
    Done,
}

/// Reconstruction result for one subroutine
pub struct SubScript {
    pub sub: SubId,
    pub root: NodeId,
    pub params: Vec<VarId>,
}

/// Per-subroutine reconstruction engine
pub struct SubScriptState<'a> {
    program: &'a Program,
    analysis: &'a NodeAnalysis,
    subs: &'a SubTable,
    actions: Option<&'a ActionsData>,
    config: &'a Config,
    ast: &'a mut Ast,
    vars: &'a mut VarTable,
    /// Frozen globals frame, bottom first
    globals: &'a [VarId],

    sub: SubId,
    root: NodeId,
    current: NodeId,
    state: MachineState,
    /// Slot stack, bottom first; parameters live below index 0
    stack: Vec<VarId>,
    /// Parameter slot variables, deepest first
    params: Vec<VarId>,
    param_bytes: i32,
    /// Variable -> its declaration node
    vardecs: FxHashMap<VarId, NodeId>,
    /// Variable -> its still-pending value expression, if unconsumed
    pending_value: FxHashMap<VarId, NodeId>,
    /// Switch node -> stack length that still holds the discriminant
    switch_depths: FxHashMap<NodeId, usize>,
    /// Loop head offsets that already own a loop node
    loops_opened: FxHashSet<u32>,
    /// Variable a prefix ++/-- just modified
    prefix_var: Option<VarId>,
    placeholder_count: u32,
    /// Stop at SAVEBP and expose the stack as the globals frame
    globals_mode: bool,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> SubScriptState<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        program: &'a Program,
        analysis: &'a NodeAnalysis,
        subs: &'a SubTable,
        actions: Option<&'a ActionsData>,
        config: &'a Config,
        ast: &'a mut Ast,
        vars: &'a mut VarTable,
        globals: &'a [VarId],
        sub: SubId,
    ) -> Self {
        let sub_state = subs.get(sub);
        let root = ast.alloc(NodeKind::Sub { sub }, sub_state.start_offset);
        ast.set_end(root, sub_state.end_offset);

        let mut params = Vec::new();
        for (i, ty) in sub_state.params.iter().enumerate() {
            let var = vars.alloc(*ty);
            vars.get_mut(var).is_param = true;
            vars.reserve_name(&format!("param{}", i + 1), var);
            params.push(var);
        }

        Self {
            program,
            analysis,
            subs,
            actions,
            config,
            ast,
            vars,
            globals,
            sub,
            root,
            current: root,
            state: MachineState::Normal,
            stack: Vec::new(),
            params,
            param_bytes: sub_state.param_bytes.unwrap_or(0) as i32,
            vardecs: FxHashMap::default(),
            pending_value: FxHashMap::default(),
            switch_depths: FxHashMap::default(),
            loops_opened: FxHashSet::default(),
            prefix_var: None,
            placeholder_count: 0,
            globals_mode: sub_state.is_globals,
            diagnostics: Vec::new(),
        }
    }

    /// Replay the subroutine and hand back its tree
    pub fn replay(mut self) -> (SubScript, Vec<VarId>, Vec<Diagnostic>) {
        let (first, last) = {
            let sub = self.subs.get(self.sub);
            (sub.first, sub.last)
        };
        for raw in first.0..=last.0 {
            if self.state == MachineState::Done {
                break;
            }
            let id = InstrId(raw);
            let Some(instr) = self.program.get(id) else { break };
            let instr = instr.clone();

            if self.globals_mode && instr.opcode == Opcode::SaveBp {
                break;
            }

            if self.analysis.is_dead(id) {
                self.transform_dead(&instr);
                continue;
            }

            let sub_range = {
                let sub = self.subs.get(self.sub);
                (sub.start_offset, sub.end_offset)
            };
            for origin in self.analysis.origins_of(id).to_vec() {
                if let Some(origin_instr) = self.program.get(origin) {
                    // Only conditional/unconditional jumps from later in this
                    // same subroutine are loop back edges; calls are not.
                    if origin_instr.opcode != Opcode::Jsr
                        && origin_instr.offset > instr.offset
                        && origin_instr.offset >= sub_range.0
                        && origin_instr.offset < sub_range.1
                    {
                        self.transform_origin_found(&instr, &origin_instr.clone());
                    }
                }
            }

            if let Err(err) = self.transform(id, &instr) {
                self.recover(&instr, err);
            }
        }

        let globals_frame = if self.globals_mode {
            // Globals initialized by bare constants are still pending;
            // freeze them as declarations before exposing the frame.
            for var in self.stack.clone() {
                self.promote_to_decl(var);
                self.vars.get_mut(var).is_global = true;
            }
            self.stack.clone()
        } else {
            Vec::new()
        };

        (
            SubScript {
                sub: self.sub,
                root: self.root,
                params: self.params,
            },
            globals_frame,
            self.diagnostics,
        )
    }

    // ===== Dispatch =====

    fn transform(&mut self, id: InstrId, instr: &Instruction) -> Result<(), TransformError> {
        self.check_start(id, instr)?;
        match instr.opcode {
            Opcode::Const => self.transform_const(instr)?,
            Opcode::RsAdd => self.transform_rsadd(instr)?,
            Opcode::CpTopSp => self.transform_cptopsp(instr)?,
            Opcode::CpDownSp => self.transform_cpdownsp(instr)?,
            Opcode::CpTopBp => self.transform_cptopbp(instr)?,
            Opcode::CpDownBp => self.transform_cpdownbp(instr)?,
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
                self.transform_arith(instr)?
            }
            Opcode::Eq | Opcode::Neq | Opcode::Geq | Opcode::Gt | Opcode::Lt | Opcode::Leq => {
                self.transform_compare(instr)?
            }
            Opcode::LogAnd | Opcode::LogOr => self.transform_logical(instr)?,
            Opcode::IncOr | Opcode::ExcOr | Opcode::BoolAnd | Opcode::ShLeft | Opcode::ShRight
            | Opcode::UnShRight => self.transform_bitwise(instr)?,
            Opcode::Neg | Opcode::Not | Opcode::Comp => self.transform_unary(instr)?,
            Opcode::IncISp | Opcode::DecISp => self.transform_stack_mod(id, instr, false)?,
            Opcode::IncIBp | Opcode::DecIBp => self.transform_stack_mod(id, instr, true)?,
            Opcode::Destruct => self.transform_destruct(instr)?,
            Opcode::Jsr => self.transform_jsr(id, instr)?,
            Opcode::Action => self.transform_action(instr)?,
            Opcode::Jmp => self.transform_jmp(id, instr)?,
            Opcode::Jz => self.transform_jz(id, instr)?,
            Opcode::Jnz => self.transform_jnz(id, instr)?,
            Opcode::Retn => self.transform_retn(instr)?,
            Opcode::MovSp => self.transform_movsp(id, instr)?,
            Opcode::StoreState => self.transform_store_state(instr)?,
            Opcode::SaveBp | Opcode::RestoreBp | Opcode::Nop => {}
        }
        self.check_end(instr);
        Ok(())
    }

    /// Dead instructions only advance the scope bookkeeping
    fn transform_dead(&mut self, instr: &Instruction) {
        self.check_end(instr);
    }

    fn recover(&mut self, instr: &Instruction, err: TransformError) {
        let comment = self.ast.alloc(
            NodeKind::ErrorComment {
                text: format!("ERROR: failed to decompile statement at {}", instr.offset),
            },
            instr.offset,
        );
        let target = if self.state == MachineState::Done {
            self.root
        } else {
            self.current
        };
        self.ast.attach(target, comment);
        self.diagnostics.push(Diagnostic::new(
            "main-pass",
            format!("{} at offset {}: {err}", instr.opcode.mnemonic(), instr.offset),
        ));
    }

    // ===== Scope bookkeeping =====

    /// Entry check: state sanity plus deferred switch-case entry
    fn check_start(&mut self, id: InstrId, instr: &Instruction) -> Result<(), TransformError> {
        if self.state == MachineState::Done {
            return Err(TransformError::BadState {
                mnemonic: instr.opcode.mnemonic(),
            });
        }

        // A pending prefix ++/-- only tolerates the copy that reads it.
        if self.state == MachineState::InPrefixStack && instr.opcode != Opcode::CpTopSp {
            self.state = MachineState::Normal;
            self.prefix_var = None;
        }

        // Enter a switch case whose body starts here.
        if let Some(case) = self.case_starting_at(instr.offset) {
            self.enter_case(case, instr.offset);
            return Ok(());
        }

        // At a case boundary with something that is neither another test
        // nor the closing pop: this is where the default case lives.
        if matches!(self.ast.kind(self.current), NodeKind::Switch)
            && self.state != MachineState::SwitchCases
            && self.at_case_boundary(instr.offset)
            && !self.is_case_test_at(id)
            && !self.is_switch_close(instr)
        {
            let default = self
                .ast
                .alloc(NodeKind::SwitchCase { label: None }, instr.offset);
            let switch = self.current;
            self.ast.attach(switch, default);
            self.current = default;
        }
        Ok(())
    }

    /// Whether `offset` is where some already-closed case of the current
    /// switch ends
    fn at_case_boundary(&self, offset: u32) -> bool {
        self.ast.children(self.current).iter().any(|&c| {
            matches!(self.ast.kind(c), NodeKind::SwitchCase { .. })
                && self.ast.get(c).end == offset
        })
    }

    /// Whether the instructions starting at `id` form one switch-case test
    /// (copy the discriminant, push a constant, compare, branch)
    fn is_case_test_at(&self, id: InstrId) -> bool {
        let ops = [Opcode::CpTopSp, Opcode::Const, Opcode::Eq];
        for (k, expected) in ops.iter().enumerate() {
            match self.program.get(InstrId(id.0 + k as u32)) {
                Some(instr) if instr.opcode == *expected => {}
                _ => return false,
            }
        }
        matches!(
            self.program.get(InstrId(id.0 + 3)).map(|i| i.opcode),
            Some(Opcode::Jz) | Some(Opcode::Jnz)
        )
    }

    /// Whether `instr` is the MOVSP that pops the open switch's discriminant
    fn is_switch_close(&self, instr: &Instruction) -> bool {
        if instr.opcode != Opcode::MovSp {
            return false;
        }
        let Operands::StackOffset(delta) = instr.operands else {
            return false;
        };
        if delta >= 0 {
            return false;
        }
        let Some(switch) = self
            .ast
            .nearest_ancestor(self.current, |k| matches!(k, NodeKind::Switch))
        else {
            return false;
        };
        let Some(&kept) = self.switch_depths.get(&switch) else {
            return false;
        };
        self.stack.len().saturating_sub(((-delta) / 4) as usize) < kept
    }

    /// The not-yet-entered case of the nearest switch starting at `offset`
    fn case_starting_at(&self, offset: u32) -> Option<NodeId> {
        let switch = if let Some(sw) = self
            .ast
            .nearest_ancestor(self.current, |k| matches!(k, NodeKind::Switch))
        {
            sw
        } else {
            // A switch that is the last child of the open container and has
            // finished collecting its tests.
            let last = self.ast.last_child(self.current)?;
            if !matches!(self.ast.kind(last), NodeKind::Switch) {
                return None;
            }
            last
        };
        for &case in self.ast.children(switch).iter().skip(1) {
            if matches!(self.ast.kind(case), NodeKind::SwitchCase { .. })
                && self.ast.get(case).start == offset
                && !self.is_on_current_path(case)
            {
                return Some(case);
            }
        }
        None
    }

    fn is_on_current_path(&self, node: NodeId) -> bool {
        let mut cursor = Some(self.current);
        while let Some(c) = cursor {
            if c == node {
                return true;
            }
            cursor = self.ast.parent(c);
        }
        false
    }

    fn enter_case(&mut self, case: NodeId, offset: u32) {
        let switch = self.ast.parent(case).expect("case has a switch parent");
        // Close whatever is still open inside the previous case.
        while self.current != switch {
            let parent = self.ast.parent(self.current);
            if matches!(self.ast.kind(self.current), NodeKind::SwitchCase { .. }) {
                self.ast.set_end(self.current, offset);
            }
            match parent {
                Some(parent) => self.current = parent,
                None => break,
            }
            if self.current == self.root {
                break;
            }
        }
        self.current = case;
        self.state = MachineState::Normal;
    }

    /// Exit check: close every container whose end equals the position one
    /// past `instr`
    fn check_end(&mut self, instr: &Instruction) {
        let pos = instr.offset + instr.encoded_len();
        loop {
            if self.current == self.root {
                break;
            }
            let node = self.ast.get(self.current);
            if node.end != pos {
                break;
            }
            match self.ast.kind(self.current).clone() {
                NodeKind::If => {
                    // A forward jump right before the boundary is the
                    // skip-else jump; its target closes the else branch.
                    // A jump that escapes an enclosing loop was a break or
                    // return and synthesizes nothing.
                    let else_end = if instr.opcode == Opcode::Jmp {
                        instr
                            .jump_target()
                            .filter(|&t| t > pos && !self.jmp_escapes_loop(t))
                    } else {
                        None
                    };
                    let parent = self.ast.parent(self.current).unwrap_or(self.root);
                    if let Some(else_end) = else_end {
                        let else_node = self.ast.alloc(NodeKind::Else, pos);
                        self.ast.set_end(else_node, else_end);
                        self.ast.attach(parent, else_node);
                        self.current = else_node;
                        break;
                    }
                    self.current = parent;
                }
                NodeKind::DoLoop | NodeKind::Switch | NodeKind::ActionArgExp => {
                    // Closed by their own terminators, never by position.
                    break;
                }
                NodeKind::Sub { .. } => break,
                _ => {
                    self.current = self.ast.parent(self.current).unwrap_or(self.root);
                }
            }
        }
    }

    // ===== Loop discovery =====

    /// Called before replaying a back-edge target
    ///
    /// A conditional back jump is the tail test of a do-loop; an
    /// unconditional one belongs to a while loop whose condition the next JZ
    /// will bind.
    pub fn transform_origin_found(&mut self, dest: &Instruction, origin: &Instruction) {
        if !self.loops_opened.insert(dest.offset) {
            return;
        }
        match origin.opcode {
            Opcode::Jz | Opcode::Jnz => {
                let node = self.ast.alloc(NodeKind::DoLoop, dest.offset);
                self.ast.set_end(node, origin.offset);
                self.ast.attach(self.current, node);
                self.current = node;
            }
            _ => {
                let node = self.ast.alloc(NodeKind::WhileLoop, dest.offset);
                self.ast
                    .set_end(node, origin.offset + origin.encoded_len());
                self.ast.attach(self.current, node);
                self.current = node;
                self.state = MachineState::WhileCond;
            }
        }
    }

    // ===== Stack helpers =====

    fn depth(&self) -> i32 {
        4 * self.stack.len() as i32
    }

    /// Variable stored at entry-relative byte position `pos`
    fn var_at(&self, pos: i32) -> Result<VarId, TransformError> {
        if pos >= 0 {
            self.stack
                .get((pos / 4) as usize)
                .copied()
                .ok_or(TransformError::UnresolvedVariable(pos))
        } else if pos >= -self.param_bytes {
            let idx = ((pos + self.param_bytes) / 4) as usize;
            self.params
                .get(idx)
                .copied()
                .ok_or(TransformError::UnresolvedVariable(pos))
        } else {
            Err(TransformError::UnresolvedVariable(pos))
        }
    }

    fn push_slot(&mut self, var: VarId) {
        self.stack.push(var);
    }

    fn pop_slots(&mut self, count: usize) -> Vec<VarId> {
        let cut = self.stack.len().saturating_sub(count);
        self.stack.split_off(cut)
    }

    /// Append an expression node as the pending value of `var`
    fn push_pending(&mut self, node: NodeId, var: VarId) {
        self.ast.set_entry(node, var);
        self.ast.attach(self.current, node);
        self.pending_value.insert(var, node);
    }

    /// Detach the most recent pending expression
    fn pop_pending(&mut self) -> Option<NodeId> {
        let node = self.ast.pop_expr(self.current)?;
        if let Some(var) = self.ast.get(node).entry {
            self.pending_value.remove(&var);
        }
        Some(node)
    }

    fn pop_pending_required(&mut self) -> Result<NodeId, TransformError> {
        self.pop_pending().ok_or(TransformError::MissingExpression)
    }

    /// Pop an argument expression, inventing a placeholder on underflow
    fn pop_argument(&mut self, at: u32) -> NodeId {
        if let Some(node) = self.pop_pending() {
            return node;
        }
        self.placeholder_count += 1;
        let var = self.vars.alloc(None);
        self.vars
            .reserve_name(&format!("__unknown_param_{}", self.placeholder_count), var);
        let node = self.ast.alloc(NodeKind::VarRef { var }, at);
        self.ast.set_entry(node, var);
        node
    }

    /// Turn a dangling literal/pending value into a declaration in place
    ///
    /// `int i = 0;` compiles to a bare CONST: the pushed slot is the
    /// variable. The promotion happens as soon as something treats the slot
    /// as storage (a copy, a write, or the scope-end pop).
    fn promote_to_decl(&mut self, var: VarId) {
        let Some(value) = self.pending_value.remove(&var) else {
            return;
        };
        if self.vardecs.contains_key(&var) {
            return;
        }
        if self.vars.get(var).ty.is_none() {
            if let NodeKind::Const { value: c } = self.ast.kind(value) {
                let ty = c.ty();
                self.vars.refine(var, ty);
            }
        }
        let decl = self.ast.alloc(NodeKind::VarDecl { var }, self.ast.get(value).start);
        self.ast.set_end(decl, self.ast.get(value).end);
        self.ast.replace(value, decl);
        self.ast.attach(decl, value);
        self.vars.get_mut(var).assigned = true;
        self.vardecs.insert(var, decl);
    }

    // ===== Transforms =====

    fn transform_const(&mut self, instr: &Instruction) -> Result<(), TransformError> {
        let value = match &instr.operands {
            Operands::Int(v) => ConstValue::Int(*v),
            Operands::Float(v) => ConstValue::Float(*v),
            Operands::String(s) => ConstValue::String(s.clone()),
            Operands::Object(v) => ConstValue::Object(*v),
            _ => return Err(TransformError::MissingExpression),
        };
        let ty = value.ty();
        let var = self.vars.alloc(Some(ty));
        let node = self.ast.alloc(NodeKind::Const { value }, instr.offset);
        self.ast
            .set_end(node, instr.offset + instr.encoded_len());
        self.push_pending(node, var);
        self.push_slot(var);
        Ok(())
    }

    fn transform_rsadd(&mut self, instr: &Instruction) -> Result<(), TransformError> {
        let ty = instr
            .qualifier
            .scalar_type()
            .ok_or(TransformError::MissingExpression)?;
        let var = self.vars.alloc(Some(ty));
        let decl = self.ast.alloc(NodeKind::VarDecl { var }, instr.offset);
        self.ast
            .set_end(decl, instr.offset + instr.encoded_len());
        self.ast.attach(self.current, decl);
        self.vardecs.insert(var, decl);
        self.push_slot(var);
        Ok(())
    }

    fn transform_cptopsp(&mut self, instr: &Instruction) -> Result<(), TransformError> {
        let Operands::OffsetAndSize { offset, size } = instr.operands else {
            return Err(TransformError::MissingExpression);
        };
        let pos = self.depth() + offset;
        let slots = (size / 4).max(1) as usize;

        // The copy completing a prefix ++/--: the expression is already
        // pending, only the slot is new.
        if self.state == MachineState::InPrefixStack {
            let var = self.var_at(pos)?;
            if Some(var) == self.prefix_var {
                self.push_slot(var);
                self.state = MachineState::Normal;
                self.prefix_var = None;
                return Ok(());
            }
            self.state = MachineState::Normal;
            self.prefix_var = None;
        }

        let mut members = Vec::with_capacity(slots);
        for k in 0..slots {
            members.push(self.var_at(pos + 4 * k as i32)?);
        }
        for &var in &members {
            self.promote_to_decl(var);
        }

        let (ref_var, entry) = if slots == 1 {
            (members[0], members[0])
        } else {
            // A whole-aggregate copy references the owning struct.
            let owner = match members
                .iter()
                .map(|&m| self.vars.struct_of(m))
                .collect::<Option<FxHashSet<_>>>()
                .and_then(|set| (set.len() == 1).then(|| set.into_iter().next().unwrap()))
            {
                Some(sid) => self.vars.get_struct(sid).owner,
                None => {
                    let is_vector = slots == 3
                        && members
                            .iter()
                            .all(|&m| self.vars.get(m).ty == Some(NssType::Float));
                    let (_, owner) = self.vars.alloc_struct(members.clone(), is_vector);
                    owner
                }
            };
            (owner, owner)
        };

        let node = self.ast.alloc(NodeKind::VarRef { var: ref_var }, instr.offset);
        self.ast
            .set_end(node, instr.offset + instr.encoded_len());
        self.push_pending(node, entry);
        for &var in &members {
            self.push_slot(var);
        }
        Ok(())
    }

    fn transform_cpdownsp(&mut self, instr: &Instruction) -> Result<(), TransformError> {
        let Operands::OffsetAndSize { offset, size } = instr.operands else {
            return Err(TransformError::MissingExpression);
        };
        let pos = self.depth() + offset;

        if pos < -self.param_bytes {
            // Write into the caller's reserved slot: a return value. A
            // 12-byte write of three pending components folds into a vector
            // literal.
            let value = if size == 12 {
                let z = self.pop_pending_required()?;
                match (self.pop_pending(), self.pop_pending()) {
                    (Some(y), Some(x)) => {
                        let vec = self.ast.alloc(NodeKind::VectorConstExp, self.ast.get(x).start);
                        self.ast.set_end(vec, self.ast.get(z).end);
                        self.ast.attach(vec, x);
                        self.ast.attach(vec, y);
                        self.ast.attach(vec, z);
                        vec
                    }
                    _ => z, // a whole-aggregate expression was pending
                }
            } else {
                self.pop_pending_required()?
            };
            let ret = self.ast.alloc(NodeKind::ReturnStatement, instr.offset);
            self.ast
                .set_end(ret, instr.offset + instr.encoded_len());
            self.ast.attach(ret, value);
            self.ast.attach(self.current, ret);
            return Ok(());
        }

        let slots = (size / 4).max(1) as usize;
        let dest = if slots == 1 {
            self.var_at(pos)?
        } else {
            let mut members = Vec::with_capacity(slots);
            for k in 0..slots {
                members.push(self.var_at(pos + 4 * k as i32)?);
            }
            match members
                .iter()
                .map(|&m| self.vars.struct_of(m))
                .collect::<Option<FxHashSet<_>>>()
                .and_then(|set| (set.len() == 1).then(|| set.into_iter().next().unwrap()))
            {
                Some(sid) => self.vars.get_struct(sid).owner,
                None => {
                    let is_vector = slots == 3;
                    let (_, owner) = self.vars.alloc_struct(members, is_vector);
                    owner
                }
            }
        };
        self.promote_to_decl(dest);

        let rhs = self.pop_pending_required()?;
        self.try_heuristic_name(dest, rhs);
        self.vars.get_mut(dest).assigned = true;

        let lhs = self.ast.alloc(NodeKind::VarRef { var: dest }, instr.offset);
        self.ast.set_entry(lhs, dest);
        let modify = self.ast.alloc(NodeKind::ModifyExp, instr.offset);
        self.ast
            .set_end(modify, instr.offset + instr.encoded_len());
        self.ast.attach(modify, lhs);
        self.ast.attach(modify, rhs);
        self.ast.attach(self.current, modify);
        self.state = MachineState::InMod;
        Ok(())
    }

    fn transform_cptopbp(&mut self, instr: &Instruction) -> Result<(), TransformError> {
        let Operands::OffsetAndSize { offset, size } = instr.operands else {
            return Err(TransformError::MissingExpression);
        };
        let slots = (size / 4).max(1) as usize;
        let g = self.globals.len() as i32;
        let mut pushed = Vec::with_capacity(slots);
        for k in 0..slots {
            let idx = g + (offset + 4 * k as i32) / 4;
            let var = if idx >= 0 {
                self.globals.get(idx as usize).copied()
            } else {
                None
            };
            pushed.push(var.ok_or(TransformError::UnresolvedVariable(offset))?);
        }
        let entry = pushed[0];
        let node = self.ast.alloc(NodeKind::VarRef { var: entry }, instr.offset);
        self.ast
            .set_end(node, instr.offset + instr.encoded_len());
        self.push_pending(node, entry);
        for var in pushed {
            self.push_slot(var);
        }
        Ok(())
    }

    fn transform_cpdownbp(&mut self, instr: &Instruction) -> Result<(), TransformError> {
        let Operands::OffsetAndSize { offset, .. } = instr.operands else {
            return Err(TransformError::MissingExpression);
        };
        let g = self.globals.len() as i32;
        let idx = g + offset / 4;
        let dest = (idx >= 0)
            .then(|| self.globals.get(idx as usize).copied())
            .flatten()
            .ok_or(TransformError::UnresolvedVariable(offset))?;

        let rhs = self.pop_pending_required()?;
        self.vars.get_mut(dest).assigned = true;
        let lhs = self.ast.alloc(NodeKind::VarRef { var: dest }, instr.offset);
        self.ast.set_entry(lhs, dest);
        let modify = self.ast.alloc(NodeKind::ModifyExp, instr.offset);
        self.ast
            .set_end(modify, instr.offset + instr.encoded_len());
        self.ast.attach(modify, lhs);
        self.ast.attach(modify, rhs);
        self.ast.attach(self.current, modify);
        self.state = MachineState::InMod;
        Ok(())
    }

    fn operand_slots(&self, instr: &Instruction) -> (usize, usize, NssType) {
        match instr.qualifier.operand_pair() {
            Some((lhs, rhs)) => {
                let result = instr
                    .qualifier
                    .arithmetic_result()
                    .unwrap_or(NssType::Int);
                (
                    lhs.slot_count().max(1) as usize,
                    rhs.slot_count().max(1) as usize,
                    result,
                )
            }
            None => (1, 1, NssType::Int),
        }
    }

    fn transform_arith(&mut self, instr: &Instruction) -> Result<(), TransformError> {
        let op = match instr.opcode {
            Opcode::Add => BinOp::Add,
            Opcode::Sub => BinOp::Sub,
            Opcode::Mul => BinOp::Mul,
            Opcode::Div => BinOp::Div,
            Opcode::Mod => BinOp::Mod,
            _ => unreachable!(),
        };
        let (lhs_slots, rhs_slots, result) = self.operand_slots(instr);
        let rhs = self.pop_pending_required()?;
        let lhs = self.pop_pending_required()?;
        self.pop_slots(lhs_slots + rhs_slots);

        let var = self.vars.alloc(Some(result));
        let node = self.ast.alloc(NodeKind::BinaryExp { op }, self.ast.get(lhs).start);
        self.ast
            .set_end(node, instr.offset + instr.encoded_len());
        self.ast.attach(node, lhs);
        self.ast.attach(node, rhs);
        self.push_pending(node, var);
        for _ in 0..result.slot_count().max(1) {
            self.push_slot(var);
        }
        Ok(())
    }

    fn transform_compare(&mut self, instr: &Instruction) -> Result<(), TransformError> {
        let op = match instr.opcode {
            Opcode::Eq => CondOp::Eq,
            Opcode::Neq => CondOp::Neq,
            Opcode::Geq => CondOp::Geq,
            Opcode::Gt => CondOp::Gt,
            Opcode::Lt => CondOp::Lt,
            Opcode::Leq => CondOp::Leq,
            _ => unreachable!(),
        };
        let (lhs_slots, rhs_slots) = if let Operands::StackSize(size) = instr.operands {
            ((size / 4) as usize, (size / 4) as usize)
        } else {
            let (l, r, _) = self.operand_slots(instr);
            (l, r)
        };
        let rhs = self.pop_pending_required()?;
        let lhs = self.pop_pending_required()?;
        self.pop_slots(lhs_slots + rhs_slots);

        let var = self.vars.alloc(Some(NssType::Int));
        let node = self
            .ast
            .alloc(NodeKind::ConditionalExp { op }, self.ast.get(lhs).start);
        self.ast
            .set_end(node, instr.offset + instr.encoded_len());
        self.ast.attach(node, lhs);
        self.ast.attach(node, rhs);
        self.push_pending(node, var);
        self.push_slot(var);
        Ok(())
    }

    fn transform_logical(&mut self, instr: &Instruction) -> Result<(), TransformError> {
        let op = if instr.opcode == Opcode::LogAnd {
            CondOp::And
        } else {
            CondOp::Or
        };
        let rhs = self.pop_pending_required()?;
        let lhs = self.pop_pending_required()?;
        self.pop_slots(2);

        let var = self.vars.alloc(Some(NssType::Int));
        let node = self
            .ast
            .alloc(NodeKind::ConditionalExp { op }, self.ast.get(lhs).start);
        self.ast
            .set_end(node, instr.offset + instr.encoded_len());
        self.ast.attach(node, lhs);
        self.ast.attach(node, rhs);
        self.push_pending(node, var);
        self.push_slot(var);
        Ok(())
    }

    fn transform_bitwise(&mut self, instr: &Instruction) -> Result<(), TransformError> {
        let op = match instr.opcode {
            Opcode::IncOr => BinOp::BitOr,
            Opcode::ExcOr => BinOp::BitXor,
            Opcode::BoolAnd => BinOp::BitAnd,
            Opcode::ShLeft => BinOp::Shl,
            Opcode::ShRight => BinOp::Shr,
            Opcode::UnShRight => BinOp::UShr,
            _ => unreachable!(),
        };
        let rhs = self.pop_pending_required()?;
        let lhs = self.pop_pending_required()?;
        self.pop_slots(2);

        let var = self.vars.alloc(Some(NssType::Int));
        let node = self.ast.alloc(NodeKind::BinaryExp { op }, self.ast.get(lhs).start);
        self.ast
            .set_end(node, instr.offset + instr.encoded_len());
        self.ast.attach(node, lhs);
        self.ast.attach(node, rhs);
        self.push_pending(node, var);
        self.push_slot(var);
        Ok(())
    }

    fn transform_unary(&mut self, instr: &Instruction) -> Result<(), TransformError> {
        let op = match instr.opcode {
            Opcode::Neg => UnOp::Neg,
            Opcode::Not => UnOp::Not,
            Opcode::Comp => UnOp::Comp,
            _ => unreachable!(),
        };
        let operand = self.pop_pending_required()?;
        let popped = self.pop_slots(1);
        let ty = match instr.qualifier.scalar_type() {
            Some(ty) => ty,
            None => popped
                .first()
                .and_then(|&v| self.vars.get(v).ty)
                .unwrap_or(NssType::Int),
        };

        let var = self.vars.alloc(Some(ty));
        let node = self
            .ast
            .alloc(NodeKind::UnaryExp { op }, self.ast.get(operand).start);
        self.ast
            .set_end(node, instr.offset + instr.encoded_len());
        self.ast.attach(node, operand);
        self.push_pending(node, var);
        self.push_slot(var);
        Ok(())
    }

    /// INCISP/DECISP and the BP-relative variants
    ///
    /// Postfix when the value was copied up first, prefix when the copy
    /// follows, a standalone statement when no copy brackets it.
    fn transform_stack_mod(
        &mut self,
        id: InstrId,
        instr: &Instruction,
        bp: bool,
    ) -> Result<(), TransformError> {
        let Operands::StackOffset(offset) = instr.operands else {
            return Err(TransformError::MissingExpression);
        };
        let op = match instr.opcode {
            Opcode::IncISp | Opcode::IncIBp => UnaryModOp::Inc,
            _ => UnaryModOp::Dec,
        };
        let var = if bp {
            let idx = self.globals.len() as i32 + offset / 4;
            (idx >= 0)
                .then(|| self.globals.get(idx as usize).copied())
                .flatten()
                .ok_or(TransformError::UnresolvedVariable(offset))?
        } else {
            self.var_at(self.depth() + offset)?
        };
        self.promote_to_decl(var);
        self.vars.refine(var, NssType::Int);

        // Postfix: the top pending expression already reads this variable.
        if let Some(top) = self.ast.last_child(self.current) {
            if matches!(self.ast.kind(top), NodeKind::VarRef { var: v } if *v == var) {
                let entry = self.ast.get(top).entry;
                let node = self
                    .ast
                    .alloc(NodeKind::UnaryModExp { op, prefix: false }, self.ast.get(top).start);
                self.ast
                    .set_end(node, instr.offset + instr.encoded_len());
                self.ast.replace(top, node);
                self.ast.attach(node, top);
                if let Some(entry) = entry {
                    self.ast.set_entry(node, entry);
                    self.pending_value.insert(entry, node);
                }
                return Ok(());
            }
        }

        // Prefix: the next instruction copies the freshly modified slot.
        let reads_back = self
            .program
            .get(InstrId(id.0 + 1))
            .map(|next| {
                next.opcode == Opcode::CpTopSp
                    && matches!(next.operands, Operands::OffsetAndSize { offset: o, size: 4 }
                        if self.var_at(self.depth() + o).ok() == Some(var))
            })
            .unwrap_or(false);

        let var_ref = self.ast.alloc(NodeKind::VarRef { var }, instr.offset);
        self.ast.set_entry(var_ref, var);
        let node = self
            .ast
            .alloc(NodeKind::UnaryModExp { op, prefix: true }, instr.offset);
        self.ast
            .set_end(node, instr.offset + instr.encoded_len());
        self.ast.attach(node, var_ref);

        if reads_back {
            let entry = self.vars.alloc(Some(NssType::Int));
            self.push_pending(node, entry);
            self.state = MachineState::InPrefixStack;
            self.prefix_var = Some(var);
        } else {
            let stmt = self.ast.alloc(NodeKind::ExpressionStatement, instr.offset);
            self.ast
                .set_end(stmt, instr.offset + instr.encoded_len());
            self.ast.attach(stmt, node);
            self.ast.attach(self.current, stmt);
        }
        Ok(())
    }

    fn transform_destruct(&mut self, instr: &Instruction) -> Result<(), TransformError> {
        let Operands::Destruct {
            size,
            keep_offset,
            keep_size,
        } = instr.operands
        else {
            return Err(TransformError::MissingExpression);
        };
        let slots = (size / 4) as usize;
        let keep_from = (keep_offset / 4) as usize;
        let keep_slots = (keep_size / 4).max(1) as usize;

        let region = self.pop_slots(slots);
        if region.len() < slots {
            return Err(TransformError::StackUnderflow);
        }
        let kept: Vec<VarId> = region
            .iter()
            .skip(keep_from)
            .take(keep_slots)
            .copied()
            .collect();
        if kept.len() < keep_slots {
            return Err(TransformError::StackUnderflow);
        }

        // Anonymous aggregate producer pending: select the field out of the
        // call expression itself. Otherwise fall back to the named member.
        let vector_region = region.len() == 3
            && region
                .iter()
                .all(|&m| matches!(self.vars.get(m).ty, Some(NssType::Float) | None));
        let field_of = |vars: &VarTable, member: VarId, idx: usize| -> String {
            if let Some(sid) = vars.struct_of(member) {
                let s = vars.get_struct(sid);
                return s.field_name(s.member_index(member).unwrap_or(idx));
            }
            if vector_region {
                match idx {
                    0 => return "x".to_string(),
                    1 => return "y".to_string(),
                    2 => return "z".to_string(),
                    _ => {}
                }
            }
            format!("f{}", idx + 1)
        };

        let pending_is_producer = self
            .ast
            .last_child(self.current)
            .map(|top| {
                matches!(
                    self.ast.kind(top),
                    NodeKind::FcnCallExp { .. } | NodeKind::ActionExp { .. }
                )
            })
            .unwrap_or(false);

        let node = if pending_is_producer {
            let producer = self.pop_pending_required()?;
            // The reserved slots' declarations were placeholders.
            for &member in &region {
                if let Some(decl) = self.vardecs.remove(&member) {
                    self.ast.detach(decl);
                }
            }
            let field = field_of(self.vars, kept[0], keep_from);
            let sel = self
                .ast
                .alloc(NodeKind::StructFieldExp { field }, self.ast.get(producer).start);
            self.ast
                .set_end(sel, instr.offset + instr.encoded_len());
            self.ast.attach(sel, producer);
            sel
        } else {
            // Make sure the aggregate has a declared, named owner.
            if let Some(sid) = self.vars.struct_of(kept[0]) {
                let owner = self.vars.get_struct(sid).owner;
                let _ = self.vars.name_of(owner);
            }
            match self.pop_pending() {
                Some(base) => {
                    let field = field_of(self.vars, kept[0], keep_from);
                    let sel = self
                        .ast
                        .alloc(NodeKind::StructFieldExp { field }, instr.offset);
                    self.ast.set_end(sel, instr.offset + instr.encoded_len());
                    self.ast.attach(sel, base);
                    sel
                }
                None => {
                    // A member reference prints as owner.field on its own.
                    let var_ref = self
                        .ast
                        .alloc(NodeKind::VarRef { var: kept[0] }, instr.offset);
                    self.ast.set_end(var_ref, instr.offset + instr.encoded_len());
                    var_ref
                }
            }
        };

        let result = self
            .vars
            .alloc(self.vars.get(kept[0]).ty.or(Some(NssType::Int)));
        self.push_pending(node, result);
        for _ in 0..keep_slots {
            self.push_slot(result);
        }
        Ok(())
    }

    fn transform_jsr(&mut self, id: InstrId, instr: &Instruction) -> Result<(), TransformError> {
        let callee_id = self
            .analysis
            .try_get_destination(id)
            .and_then(|dest| self.subs.by_entry(dest))
            .ok_or(TransformError::MissingAnalysis(id))?;
        let callee = self.subs.get(callee_id);
        let param_count = callee.param_count();
        let ret_slots = callee.return_slots as usize;
        let ret_ty = callee.return_type;

        let mut args = Vec::with_capacity(param_count);
        for _ in 0..param_count {
            args.push(self.pop_argument(instr.offset));
        }
        args.reverse(); // popped last-pushed first; parameters go left to right
        self.pop_slots((callee.param_bytes.unwrap_or(0) / 4) as usize);

        let call = self
            .ast
            .alloc(NodeKind::FcnCallExp { sub: callee_id }, instr.offset);
        self.ast
            .set_end(call, instr.offset + instr.encoded_len());
        for arg in args {
            self.ast.attach(call, arg);
        }

        if ret_slots == 0 {
            let stmt = self.ast.alloc(NodeKind::ExpressionStatement, instr.offset);
            self.ast
                .set_end(stmt, instr.offset + instr.encoded_len());
            self.ast.attach(stmt, call);
            self.ast.attach(self.current, stmt);
            return Ok(());
        }

        // The caller reserved the return slots just below the arguments.
        let reserved = self.pop_slots(ret_slots);
        if reserved.len() < ret_slots {
            return Err(TransformError::StackUnderflow);
        }

        let next_is_destruct = self
            .program
            .get(InstrId(id.0 + 1))
            .map(|n| n.opcode == Opcode::Destruct)
            .unwrap_or(false);

        if next_is_destruct {
            // Leave the call pending; DESTRUCT consumes it directly.
            for &var in &reserved {
                if let Some(decl) = self.vardecs.remove(&var) {
                    self.ast.detach(decl);
                }
            }
            let entry = reserved[0];
            self.push_pending(call, entry);
            for var in reserved {
                self.push_slot(var);
            }
            return Ok(());
        }

        if ret_slots == 1 {
            let var = reserved[0];
            if let Some(&decl) = self.vardecs.get(&var) {
                if !self.vars.get(var).assigned && self.ast.children(decl).is_empty() {
                    self.ast.attach(decl, call);
                    self.vars.get_mut(var).assigned = true;
                    self.push_slot(var);
                    return Ok(());
                }
            }
            self.push_pending(call, var);
            self.push_slot(var);
            return Ok(());
        }

        // Multi-slot return: group the reserved slots into one aggregate
        // declaration initialized by the call.
        let is_vector = ret_ty == Some(NssType::Vector);
        let (_, owner) = self.vars.alloc_struct(reserved.clone(), is_vector);
        let insert_at = reserved
            .iter()
            .filter_map(|v| self.vardecs.remove(v))
            .collect::<Vec<_>>();
        for &decl in insert_at.iter().skip(1) {
            self.ast.detach(decl);
        }
        let decl = self.ast.alloc(NodeKind::VarDecl { var: owner }, instr.offset);
        self.ast
            .set_end(decl, instr.offset + instr.encoded_len());
        match insert_at.first() {
            Some(&placeholder) => {
                self.ast.replace(placeholder, decl);
            }
            None => self.ast.attach(self.current, decl),
        }
        self.ast.attach(decl, call);
        self.vars.get_mut(owner).assigned = true;
        self.vardecs.insert(owner, decl);
        for var in reserved {
            self.push_slot(var);
        }
        Ok(())
    }

    fn transform_action(&mut self, instr: &Instruction) -> Result<(), TransformError> {
        let Operands::Action { id, args } = instr.operands else {
            return Err(TransformError::MissingExpression);
        };
        let action = self.actions.and_then(|table| table.get(id));

        let (name, returns, param_tys): (String, NssType, Vec<NssType>) = match action {
            Some(action) => (
                action.name.clone(),
                action.returns,
                action
                    .params
                    .iter()
                    .take(args as usize)
                    .map(|p| p.ty)
                    .collect(),
            ),
            None => {
                self.diagnostics.push(Diagnostic::new(
                    "main-pass",
                    format!("action #{id} missing from the table"),
                ));
                (
                    format!("UnknownAction{id}"),
                    NssType::Void,
                    vec![NssType::Int; args as usize],
                )
            }
        };

        let mut arg_nodes = Vec::with_capacity(param_tys.len());
        for ty in &param_tys {
            // Engine actions take their first argument on top of the stack.
            let node = self.pop_argument(instr.offset);
            if *ty != NssType::Action {
                self.pop_slots(ty.slot_count().max(1) as usize);
            }
            arg_nodes.push(node);
        }

        let call = self
            .ast
            .alloc(NodeKind::ActionExp { id, name }, instr.offset);
        self.ast
            .set_end(call, instr.offset + instr.encoded_len());
        for arg in arg_nodes {
            self.ast.attach(call, arg);
        }

        match returns {
            NssType::Void => {
                let stmt = self.ast.alloc(NodeKind::ExpressionStatement, instr.offset);
                self.ast
                    .set_end(stmt, instr.offset + instr.encoded_len());
                self.ast.attach(stmt, call);
                self.ast.attach(self.current, stmt);
            }
            NssType::Vector => {
                let members = vec![
                    self.vars.alloc(Some(NssType::Float)),
                    self.vars.alloc(Some(NssType::Float)),
                    self.vars.alloc(Some(NssType::Float)),
                ];
                let (_, owner) = self.vars.alloc_struct(members.clone(), true);
                self.push_pending(call, owner);
                for var in members {
                    self.push_slot(var);
                }
            }
            ty => {
                let var = self.vars.alloc(Some(ty));
                self.push_pending(call, var);
                self.push_slot(var);
            }
        }
        Ok(())
    }

    fn transform_store_state(&mut self, instr: &Instruction) -> Result<(), TransformError> {
        let node = self.ast.alloc(NodeKind::ActionArgExp, instr.offset);
        let var = self.vars.alloc(Some(NssType::Action));
        self.ast.set_entry(node, var);
        self.ast.attach(self.current, node);
        self.pending_value.insert(var, node);
        self.current = node;
        self.state = MachineState::InActionArg;
        Ok(())
    }

    fn transform_jmp(&mut self, id: InstrId, instr: &Instruction) -> Result<(), TransformError> {
        let target = instr
            .jump_target()
            .ok_or(TransformError::MissingAnalysis(id))?;
        let end_pos = instr.offset + instr.encoded_len();

        // Bracket jump of a deferred action block: it only records where the
        // block ends.
        if self.state == MachineState::InActionArg {
            self.ast.set_end(self.current, target);
            self.state = MachineState::Normal;
            return Ok(());
        }

        // Terminator of a switch test chain: it decides whether a default
        // case exists.
        if self.state == MachineState::SwitchCases {
            let switch = self
                .ast
                .nearest_ancestor(self.current, |k| matches!(k, NodeKind::Switch))
                .or_else(|| self.ast.last_child(self.current))
                .ok_or(TransformError::UnclassifiableJump(target))?;
            let lands_on_close = self
                .program
                .id_at_offset(target)
                .and_then(|t| self.program.get(t))
                .map(|t| t.opcode == Opcode::MovSp)
                .unwrap_or(false);
            if !lands_on_close {
                let default = self
                    .ast
                    .alloc(NodeKind::SwitchCase { label: None }, target);
                self.ast.attach(switch, default);
            }
            self.state = MachineState::Normal;
            return Ok(());
        }

        // Skip-else jump: the enclosing if ends exactly here; check_end
        // turns it into the else branch. A jump that leaves an enclosing
        // loop entirely is a break or return, not an else.
        if let Some(open_if) = self
            .ast
            .nearest_ancestor(self.current, |k| matches!(k, NodeKind::If))
        {
            if self.ast.get(open_if).end == end_pos
                && target > end_pos
                && !self.jmp_escapes_loop(target)
            {
                return Ok(());
            }
        }

        // Jump to the epilogue: a return statement.
        if self.is_epilogue(target) {
            if let Some(last) = self.ast.last_child(self.current) {
                if matches!(self.ast.kind(last), NodeKind::ReturnStatement) {
                    return Ok(()); // value write already emitted the return
                }
            }
            let ret = self.ast.alloc(NodeKind::ReturnStatement, instr.offset);
            self.ast.set_end(ret, end_pos);
            self.ast.attach(self.current, ret);
            return Ok(());
        }

        // Break out of the innermost loop or switch.
        if let Some(breakable) = self.ast.nearest_ancestor(self.current, |k| {
            matches!(
                k,
                NodeKind::WhileLoop | NodeKind::DoLoop | NodeKind::Switch
            )
        }) {
            let node = self.ast.get(breakable);
            let is_switch = matches!(node.kind, NodeKind::Switch);
            if target > instr.offset && (is_switch || target >= node.end) {
                let brk = self.ast.alloc(NodeKind::BreakStatement, instr.offset);
                self.ast.set_end(brk, end_pos);
                self.ast.attach(self.current, brk);
                return Ok(());
            }
            // Backward jump to the loop head.
            if !is_switch && target == node.start {
                if end_pos == node.end {
                    return Ok(()); // the loop's own back edge
                }
                let cont = self.ast.alloc(NodeKind::ContinueStatement, instr.offset);
                self.ast.set_end(cont, end_pos);
                self.ast.attach(self.current, cont);
                return Ok(());
            }
        }

        // Nothing matched; keep a marker so the body stays inspectable.
        let unk = self
            .ast
            .alloc(NodeKind::UnkLoopControl { target }, instr.offset);
        self.ast.set_end(unk, end_pos);
        self.ast.attach(self.current, unk);
        self.diagnostics.push(Diagnostic::new(
            "main-pass",
            format!(
                "unclassified jump at offset {} to {}",
                instr.offset, target
            ),
        ));
        Ok(())
    }

    /// Whether a jump to `target` leaves the innermost enclosing loop
    fn jmp_escapes_loop(&self, target: u32) -> bool {
        self.ast
            .nearest_ancestor(self.current, |k| {
                matches!(k, NodeKind::WhileLoop | NodeKind::DoLoop)
            })
            .map(|l| {
                let node = self.ast.get(l);
                node.end > node.start && target >= node.end
            })
            .unwrap_or(false)
    }

    /// Whether `target` is the subroutine epilogue (RETN, or the MOVSP/RETN
    /// pair that pops locals first)
    fn is_epilogue(&self, target: u32) -> bool {
        let Some(tid) = self.program.id_at_offset(target) else {
            return false;
        };
        let Some(t) = self.program.get(tid) else { return false };
        match t.opcode {
            Opcode::Retn => true,
            Opcode::MovSp => self
                .program
                .get(InstrId(tid.0 + 1))
                .map(|n| n.opcode == Opcode::Retn)
                .unwrap_or(false),
            _ => false,
        }
    }

    fn transform_jz(&mut self, id: InstrId, instr: &Instruction) -> Result<(), TransformError> {
        let target = instr
            .jump_target()
            .ok_or(TransformError::MissingAnalysis(id))?;

        // Bind the condition of an open while loop.
        if self.state == MachineState::WhileCond {
            let cond = self.pop_condition(instr.offset);
            self.pop_slots(1);
            let loop_node = self
                .ast
                .nearest_ancestor(self.current, |k| matches!(k, NodeKind::WhileLoop))
                .ok_or(TransformError::BadState { mnemonic: "JZ" })?;
            self.ast.attach_first(loop_node, cond);
            if self.ast.get(loop_node).end != target {
                self.diagnostics.push(Diagnostic::new(
                    "main-pass",
                    format!(
                        "while exit at offset {} does not match loop end",
                        instr.offset
                    ),
                ));
            }
            self.state = MachineState::Normal;
            return Ok(());
        }

        // Tail test of a do-loop jumping back to the head.
        if target <= instr.offset {
            return self.close_do_loop(instr, true);
        }

        // Equality chain against constants: a switch when preferred.
        if self.jz_case_test() && self.open_switch_case(instr, target)? {
            return Ok(());
        }

        // Plain if: condition pops, body runs until the jump target.
        let cond = self.pop_condition(instr.offset);
        self.pop_slots(1);
        let start = self.ast.get(cond).start.min(instr.offset);
        let node = self.ast.alloc(NodeKind::If, start);
        self.ast.set_end(node, target);
        self.ast.attach(node, cond);
        self.ast.attach(self.current, node);
        self.current = node;
        Ok(())
    }

    /// Whether the pending condition looks like one switch-case test
    ///
    /// In chain position (the open container is the switch itself) any
    /// `var == const` comparison continues the chain. Outside a chain the
    /// discriminant copy must still be pending right under the comparison;
    /// that duplicate read is what separates `switch` bytecode from a plain
    /// `if (x == c)`.
    fn jz_case_test(&self) -> bool {
        let in_chain = matches!(self.ast.kind(self.current), NodeKind::Switch);
        if !in_chain && !self.config.prefer_switches {
            return false;
        }
        let children = self.ast.children(self.current);
        let Some(&top) = children.last() else {
            return false;
        };
        let NodeKind::ConditionalExp { op: CondOp::Eq } = self.ast.kind(top) else {
            return false;
        };
        let cmp = self.ast.children(top);
        let shape_ok = cmp.len() == 2
            && matches!(self.ast.kind(cmp[0]), NodeKind::VarRef { .. })
            && matches!(
                self.ast.kind(cmp[1]),
                NodeKind::Const {
                    value: ConstValue::Int(_)
                }
            );
        if !shape_ok {
            return false;
        }
        if in_chain {
            return true;
        }
        // First test: the discriminant itself must sit just below.
        let lhs_var = self.ast.get(cmp[0]).entry;
        children.len() >= 2
            && self.ast.kind(children[children.len() - 2]).is_expression()
            && self.ast.get(children[children.len() - 2]).entry == lhs_var
            && lhs_var.is_some()
    }

    /// Open (or extend) a fall-through-style switch from a JZ equality test
    fn open_switch_case(
        &mut self,
        instr: &Instruction,
        target: u32,
    ) -> Result<bool, TransformError> {
        let cond = self.pop_pending_required()?;
        self.pop_slots(1);
        let children = self.ast.children(cond).to_vec();
        let label = match self.ast.kind(children[1]) {
            NodeKind::Const {
                value: ConstValue::Int(v),
            } => *v,
            _ => return Err(TransformError::MissingExpression),
        };

        let switch = if matches!(self.ast.kind(self.current), NodeKind::Switch) {
            self.current
        } else {
            // First test: the discriminant read is still pending right
            // below the comparison.
            let discriminant = match self.pop_pending() {
                Some(d) => d,
                None => {
                    // Reuse the comparison's left side.
                    let lhs = children[0];
                    self.ast.detach(lhs);
                    lhs
                }
            };
            let sw = self
                .ast
                .alloc(NodeKind::Switch, self.ast.get(discriminant).start);
            self.ast.attach(sw, discriminant);
            self.ast.attach(self.current, sw);
            self.switch_depths.insert(sw, self.stack.len());
            sw
        };

        let case = self
            .ast
            .alloc(NodeKind::SwitchCase { label: Some(label) }, instr.offset + instr.encoded_len());
        self.ast.set_end(case, target);
        self.ast.attach(switch, case);
        self.current = case;
        self.state = MachineState::Normal;
        Ok(true)
    }

    fn transform_jnz(&mut self, id: InstrId, instr: &Instruction) -> Result<(), TransformError> {
        let target = instr
            .jump_target()
            .ok_or(TransformError::MissingAnalysis(id))?;

        // Tail test of a do-loop.
        if target <= instr.offset {
            return self.close_do_loop(instr, false);
        }

        // Forward conditional jump into a case body: jump-table style
        // switch tests.
        let cond = self.pop_pending_required()?;
        self.pop_slots(1);
        if let NodeKind::ConditionalExp { op: CondOp::Eq } = self.ast.kind(cond) {
            let children = self.ast.children(cond).to_vec();
            if let NodeKind::Const {
                value: ConstValue::Int(label),
            } = self.ast.kind(children[1])
            {
                let label = *label;
                let switch = match self
                    .ast
                    .nearest_ancestor(self.current, |k| matches!(k, NodeKind::Switch))
                    .filter(|_| self.state == MachineState::SwitchCases)
                {
                    Some(sw) => sw,
                    None => {
                        let discriminant = match self.pop_pending() {
                            Some(d) => d,
                            None => {
                                let lhs = children[0];
                                self.ast.detach(lhs);
                                lhs
                            }
                        };
                        let sw = self
                            .ast
                            .alloc(NodeKind::Switch, self.ast.get(discriminant).start);
                        self.ast.attach(sw, discriminant);
                        self.ast.attach(self.current, sw);
                        self.switch_depths.insert(sw, self.stack.len());
                        self.current = sw;
                        sw
                    }
                };
                let case = self
                    .ast
                    .alloc(NodeKind::SwitchCase { label: Some(label) }, target);
                self.ast.attach(switch, case);
                self.state = MachineState::SwitchCases;
                return Ok(());
            }
        }

        // `if (!cond)`-shaped test: open an if over the negated condition.
        let not_var = self.vars.alloc(Some(NssType::Int));
        let start = self.ast.get(cond).start.min(instr.offset);
        let negated = self
            .ast
            .alloc(NodeKind::UnaryExp { op: UnOp::Not }, self.ast.get(cond).start);
        self.ast.attach(negated, cond);
        self.ast.set_entry(negated, not_var);
        let node = self.ast.alloc(NodeKind::If, start);
        self.ast.set_end(node, target);
        self.ast.attach(node, negated);
        self.ast.attach(self.current, node);
        self.current = node;
        Ok(())
    }

    /// Bind the trailing condition of the innermost do-loop and close it
    fn close_do_loop(&mut self, instr: &Instruction, negate: bool) -> Result<(), TransformError> {
        let loop_node = self
            .ast
            .nearest_ancestor(self.current, |k| matches!(k, NodeKind::DoLoop))
            .ok_or(TransformError::BadState {
                mnemonic: instr.opcode.mnemonic(),
            })?;
        let cond = self.pop_condition(instr.offset);
        self.pop_slots(1);
        let cond = if negate {
            let var = self.vars.alloc(Some(NssType::Int));
            let negated = self
                .ast
                .alloc(NodeKind::UnaryExp { op: UnOp::Not }, self.ast.get(cond).start);
            self.ast.attach(negated, cond);
            self.ast.set_entry(negated, var);
            negated
        } else {
            cond
        };
        self.ast.attach(loop_node, cond);
        self.ast
            .set_end(loop_node, instr.offset + instr.encoded_len());
        self.current = self.ast.parent(loop_node).unwrap_or(self.root);
        Ok(())
    }

    /// Pop a condition expression, falling back to a reference to the top
    /// slot when the value was consumed early (e.g. a declared call result)
    fn pop_condition(&mut self, at: u32) -> NodeId {
        if let Some(cond) = self.pop_pending() {
            return cond;
        }
        let var = self.stack.last().copied();
        match var {
            Some(var) => {
                let node = self.ast.alloc(NodeKind::VarRef { var }, at);
                self.ast.set_entry(node, var);
                node
            }
            None => self.pop_argument(at),
        }
    }

    fn transform_retn(&mut self, _instr: &Instruction) -> Result<(), TransformError> {
        // A RETN inside a deferred block closes the block, not the sub.
        if let Some(block) = self
            .ast
            .nearest_ancestor(self.current, |k| matches!(k, NodeKind::ActionArgExp))
        {
            self.current = self.ast.parent(block).unwrap_or(self.root);
            return Ok(());
        }
        self.current = self.root;
        self.state = MachineState::Done;
        Ok(())
    }

    fn transform_movsp(&mut self, _id: InstrId, instr: &Instruction) -> Result<(), TransformError> {
        let Operands::StackOffset(delta) = instr.operands else {
            return Err(TransformError::MissingExpression);
        };
        if delta >= 0 {
            return Ok(());
        }
        let count = ((-delta) / 4) as usize;

        // The pop after an assignment: the statement is already in place.
        if self.state == MachineState::InMod {
            self.pop_slots(count);
            self.state = MachineState::Normal;
            return Ok(());
        }

        let popped = self.pop_slots(count);

        // Does this pop close an open switch (drop its discriminant)?
        if let Some(switch) = self
            .ast
            .nearest_ancestor(self.current, |k| matches!(k, NodeKind::Switch))
        {
            if let Some(&kept) = self.switch_depths.get(&switch) {
                if self.stack.len() < kept {
                    self.close_switch(switch, instr);
                    return Ok(());
                }
            }
        }

        // Dangling values on popped slots become statements or declarations.
        for var in popped.into_iter().rev() {
            let Some(&value) = self.pending_value.get(&var) else {
                continue;
            };
            if self.ast.parent(value).is_none() {
                self.pending_value.remove(&var);
                continue;
            }
            match self.ast.kind(value) {
                NodeKind::Const { .. } => self.promote_to_decl(var),
                _ => {
                    self.pending_value.remove(&var);
                    let stmt = self
                        .ast
                        .alloc(NodeKind::ExpressionStatement, self.ast.get(value).start);
                    self.ast
                        .set_end(stmt, instr.offset + instr.encoded_len());
                    self.ast.replace(value, stmt);
                    self.ast.attach(stmt, value);
                }
            }
        }
        Ok(())
    }

    fn close_switch(&mut self, switch: NodeId, instr: &Instruction) {
        let pos = instr.offset + instr.encoded_len();
        // Close any case still open below the switch.
        while self.current != switch && self.current != self.root {
            if matches!(self.ast.kind(self.current), NodeKind::SwitchCase { .. }) {
                self.ast.set_end(self.current, instr.offset);
            }
            self.current = self.ast.parent(self.current).unwrap_or(self.root);
        }
        self.ast.set_end(switch, pos);
        self.sort_cases(switch);
        self.switch_depths.remove(&switch);
        if self.current == switch {
            self.current = self.ast.parent(switch).unwrap_or(self.root);
        }
        self.state = MachineState::Normal;
    }

    /// Cases print sorted by start offset; the default always goes last
    fn sort_cases(&mut self, switch: NodeId) {
        let children = self.ast.children(switch).to_vec();
        if children.len() < 2 {
            return;
        }
        let discriminant = children[0];
        let mut cases = children[1..].to_vec();
        cases.sort_by_key(|&c| {
            let node = self.ast.get(c);
            let is_default = matches!(node.kind, NodeKind::SwitchCase { label: None });
            (is_default, node.start)
        });
        let mut ordered = vec![discriminant];
        ordered.extend(cases);
        self.ast.get_mut(switch).children = ordered;
    }

    /// Guess a variable name from the action that produced its value
    fn try_heuristic_name(&mut self, dest: VarId, rhs: NodeId) {
        if self.vars.get(dest).name.is_some() {
            return;
        }
        let NodeKind::ActionExp { name, .. } = self.ast.kind(rhs) else {
            return;
        };
        let stem = name.strip_prefix("Get").unwrap_or(name);
        if stem.is_empty() {
            return;
        }
        let prefix = self
            .vars
            .get(dest)
            .ty
            .unwrap_or(NssType::Int)
            .name_prefix();
        let wanted = format!("{prefix}{stem}");
        self.vars.try_name(dest, &wanted);
    }
}
