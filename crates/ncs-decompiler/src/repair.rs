//! Output repairs
//!
//! When validation of the reconstructed tree fails, the driver runs these
//! rewrites, re-validating after each pass up to the configured bound. They
//! trade fidelity for compilability: a repaired script will not round-trip
//! byte-identically, but it will at least parse.

use crate::ast::{Ast, NodeId, NodeKind};
use crate::config::RepairOptions;
use crate::error::Diagnostic;
use crate::state::SubScript;
use crate::validate::{validate_script, Violation};
use crate::var::{VarId, VarTable};
use rustc_hash::{FxHashMap, FxHashSet};

/// Repair every script until validation passes or the pass budget runs out
pub fn repair_all(
    ast: &mut Ast,
    vars: &mut VarTable,
    options: &RepairOptions,
    scripts: &[SubScript],
    globals: &[VarId],
) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    if !options.enabled {
        return diagnostics;
    }

    for _ in 0..options.max_passes {
        let mut dirty = false;
        for script in scripts {
            let violations = validate_script(ast, vars, script, globals);
            if violations.is_empty() {
                continue;
            }
            if options.declare_missing && declare_missing(ast, script, &violations) {
                dirty = true;
                diagnostics.push(Diagnostic::new(
                    "repair",
                    format!("{}: declared missing variables", script.sub),
                ));
            }
            if options.rename_collisions && rename_collisions(ast, vars, script) {
                dirty = true;
                diagnostics.push(Diagnostic::new(
                    "repair",
                    format!("{}: renamed colliding identifiers", script.sub),
                ));
            }
        }
        if options.stub_unknown_actions && stub_unknown_actions(ast, scripts) {
            dirty = true;
            diagnostics.push(Diagnostic::new(
                "repair",
                "commented out calls to unknown actions".to_string(),
            ));
        }
        if !dirty {
            break;
        }
    }
    diagnostics
}

/// Insert declarations at the top of the body for referenced-but-undeclared
/// variables (placeholders invented during recovery)
fn declare_missing(ast: &mut Ast, script: &SubScript, violations: &[Violation]) -> bool {
    let missing: FxHashSet<VarId> = violations
        .iter()
        .filter_map(|v| match v {
            Violation::UnresolvedRef { var, .. } => Some(*var),
            _ => None,
        })
        .collect();
    if missing.is_empty() {
        return false;
    }
    let start = ast.get(script.root).start;
    // Most recently inserted ends up first; order among repairs is not
    // significant.
    for var in missing {
        let decl = ast.alloc(NodeKind::VarDecl { var }, start);
        ast.set_end(decl, start);
        ast.attach_first(script.root, decl);
    }
    true
}

/// Give duplicate names a numeric suffix
fn rename_collisions(ast: &mut Ast, vars: &mut VarTable, script: &SubScript) -> bool {
    let mut by_name: FxHashMap<String, Vec<VarId>> = FxHashMap::default();
    ast.walk(script.root, &mut |n| {
        if let NodeKind::VarDecl { var } = *ast.kind(n) {
            let name = vars.name_of(var);
            by_name.entry(name).or_default().push(var);
        }
    });

    let mut renamed = false;
    for (name, ids) in by_name {
        for (i, var) in ids.into_iter().enumerate().skip(1) {
            vars.get_mut(var).name = Some(format!("{name}_{}", i + 1));
            renamed = true;
        }
    }
    renamed
}

/// Replace statements calling actions absent from the table with comments
fn stub_unknown_actions(ast: &mut Ast, scripts: &[SubScript]) -> bool {
    let mut stubbed = Vec::new();
    for script in scripts {
        ast.walk(script.root, &mut |n| {
            if !matches!(ast.kind(n), NodeKind::ExpressionStatement) {
                return;
            }
            let Some(&call) = ast.children(n).first() else { return };
            if let NodeKind::ActionExp { id, name } = ast.kind(call) {
                if name.starts_with("UnknownAction") {
                    stubbed.push((n, *id));
                }
            }
        });
    }
    let any = !stubbed.is_empty();
    for (stmt, id) in stubbed {
        let start = ast.get(stmt).start;
        let comment = ast.alloc(
            NodeKind::ErrorComment {
                text: format!("call to unknown action #{id} removed"),
            },
            start,
        );
        ast.set_end(comment, ast.get(stmt).end);
        ast.replace(stmt, comment);
    }
    any
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sub::SubId;
    use ncs_bytecode::NssType;

    fn script(root: NodeId) -> SubScript {
        SubScript {
            sub: SubId(1),
            root,
            params: Vec::new(),
        }
    }

    #[test]
    fn test_declare_missing_fixes_validation() {
        let mut ast = Ast::new();
        let mut vars = VarTable::new();
        let root = ast.alloc(NodeKind::Sub { sub: SubId(1) }, 0);
        ast.set_end(root, 100);
        let ghost = vars.alloc(Some(NssType::Int));
        let var_ref = ast.alloc(NodeKind::VarRef { var: ghost }, 10);
        ast.set_end(var_ref, 14);
        let stmt = ast.alloc(NodeKind::ExpressionStatement, 10);
        ast.set_end(stmt, 14);
        ast.attach(stmt, var_ref);
        ast.attach(root, stmt);

        let s = script(root);
        assert!(!validate_script(&ast, &vars, &s, &[]).is_empty());
        let diags = repair_all(
            &mut ast,
            &mut vars,
            &RepairOptions::default(),
            std::slice::from_ref(&s),
            &[],
        );
        assert!(!diags.is_empty());
        assert!(validate_script(&ast, &vars, &s, &[]).is_empty());
    }

    #[test]
    fn test_disabled_repairs_do_nothing() {
        let mut ast = Ast::new();
        let mut vars = VarTable::new();
        let root = ast.alloc(NodeKind::Sub { sub: SubId(1) }, 0);
        ast.set_end(root, 100);
        let ghost = vars.alloc(Some(NssType::Int));
        let var_ref = ast.alloc(NodeKind::VarRef { var: ghost }, 10);
        ast.set_end(var_ref, 14);
        ast.attach(root, var_ref);

        let mut options = RepairOptions::default();
        options.enabled = false;
        let s = script(root);
        let diags = repair_all(&mut ast, &mut vars, &options, std::slice::from_ref(&s), &[]);
        assert!(diags.is_empty());
        assert!(!validate_script(&ast, &vars, &s, &[]).is_empty());
    }

    #[test]
    fn test_stub_unknown_action() {
        let mut ast = Ast::new();
        let mut vars = VarTable::new();
        let root = ast.alloc(NodeKind::Sub { sub: SubId(1) }, 0);
        ast.set_end(root, 100);
        let call = ast.alloc(
            NodeKind::ActionExp {
                id: 999,
                name: "UnknownAction999".to_string(),
            },
            10,
        );
        ast.set_end(call, 15);
        let stmt = ast.alloc(NodeKind::ExpressionStatement, 10);
        ast.set_end(stmt, 15);
        ast.attach(stmt, call);
        ast.attach(root, stmt);

        let s = script(root);
        repair_all(
            &mut ast,
            &mut vars,
            &RepairOptions::default(),
            std::slice::from_ref(&s),
            &[],
        );
        let children = ast.children(root).to_vec();
        assert_eq!(children.len(), 1);
        assert!(matches!(
            ast.kind(children[0]),
            NodeKind::ErrorComment { .. }
        ));
    }

    #[test]
    fn test_rename_collisions() {
        let mut ast = Ast::new();
        let mut vars = VarTable::new();
        let root = ast.alloc(NodeKind::Sub { sub: SubId(1) }, 0);
        ast.set_end(root, 100);
        let a = vars.alloc(Some(NssType::Int));
        let b = vars.alloc(Some(NssType::Int));
        vars.reserve_name("nCount", a);
        vars.reserve_name("nCount", b);
        for (offset, var) in [(10, a), (20, b)] {
            let decl = ast.alloc(NodeKind::VarDecl { var }, offset);
            ast.set_end(decl, offset + 6);
            ast.attach(root, decl);
        }

        let s = script(root);
        assert!(rename_collisions(&mut ast, &mut vars, &s));
        assert_eq!(vars.name_of(a), "nCount");
        assert_eq!(vars.name_of(b), "nCount_2");
    }
}
