//! Emitted-tree validation
//!
//! Checks the universal invariants every finished reconstruction must hold.
//! A failed check is not fatal: the driver responds by running the repair
//! passes, and only reports what remains afterwards.

use crate::ast::{Ast, NodeId, NodeKind};
use crate::state::SubScript;
use crate::var::{VarId, VarTable};
use rustc_hash::FxHashSet;

/// One violated invariant
#[derive(Debug, Clone, PartialEq)]
pub enum Violation {
    /// A child range escapes or reorders within its parent
    BadNesting { parent: NodeId, child: NodeId },
    /// Two declarations for the same variable in one subroutine
    DuplicateDecl { var: VarId },
    /// A reference to a variable with no visible declaration
    UnresolvedRef { node: NodeId, var: VarId },
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Violation::BadNesting { parent, child } => {
                write!(f, "child {child} escapes the range of {parent}")
            }
            Violation::DuplicateDecl { var } => {
                write!(f, "variable {var} declared more than once")
            }
            Violation::UnresolvedRef { node, var } => {
                write!(f, "reference {node} to undeclared variable {var}")
            }
        }
    }
}

/// Validate one subroutine tree against the globals frame
pub fn validate_script(
    ast: &Ast,
    vars: &VarTable,
    script: &SubScript,
    globals: &[VarId],
) -> Vec<Violation> {
    let mut violations = Vec::new();

    check_nesting(ast, script.root, &mut violations);

    // Collect everything visible: params, globals, declarations.
    let mut visible: FxHashSet<VarId> = FxHashSet::default();
    visible.extend(script.params.iter().copied());
    visible.extend(globals.iter().copied());
    let mut declared: FxHashSet<VarId> = FxHashSet::default();
    ast.walk(script.root, &mut |n| {
        if let NodeKind::VarDecl { var } = *ast.kind(n) {
            if !declared.insert(var) {
                violations.push(Violation::DuplicateDecl { var });
            }
            visible.insert(var);
        }
    });

    // Struct members are visible through their owner and vice versa.
    let mut closure: FxHashSet<VarId> = visible.clone();
    for &var in &visible {
        if let Some(sid) = vars.struct_of(var) {
            closure.insert(vars.get_struct(sid).owner);
            closure.extend(vars.get_struct(sid).members.iter().copied());
        }
        for (_, s) in vars.structs() {
            if s.owner == var {
                closure.extend(s.members.iter().copied());
            }
        }
    }

    ast.walk(script.root, &mut |n| {
        if let NodeKind::VarRef { var } = *ast.kind(n) {
            if !closure.contains(&var) {
                violations.push(Violation::UnresolvedRef { node: n, var });
            }
        }
    });

    violations
}

/// Child ranges must stay inside the parent and ascend left to right
fn check_nesting(ast: &Ast, root: NodeId, violations: &mut Vec<Violation>) {
    ast.walk(root, &mut |parent| {
        let p = ast.get(parent);
        if !p.kind.is_container() {
            return;
        }
        let mut prev_end = p.start;
        for &child in ast.children(parent) {
            let c = ast.get(child);
            if c.start < p.start || c.end > p.end || c.start < prev_end {
                violations.push(Violation::BadNesting { parent, child });
            }
            prev_end = prev_end.max(c.end);
        }
    });
}
