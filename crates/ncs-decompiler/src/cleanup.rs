//! Tree normalization passes
//!
//! Run after reconstruction, before printing. Each rewrite preserves the
//! replayed semantics; they only remove noise the stack replay leaves
//! behind: separate declaration/assignment pairs, empty then-branches,
//! single-child blocks, and single-arm switches when the configuration
//! prefers `if`.

use crate::ast::{Ast, NodeId, NodeKind, UnOp};
use crate::config::Config;
use crate::var::VarTable;

/// Run every cleanup rewrite over one root
pub fn cleanup_root(ast: &mut Ast, vars: &mut VarTable, config: &Config, root: NodeId) {
    merge_decl_assign(ast, vars, root);
    negate_empty_then(ast, root);
    flatten_blocks(ast, root);
    if !config.prefer_switches {
        demote_single_case_switches(ast, root);
    }
}

/// `int a; a = x;` becomes `int a = x;`
fn merge_decl_assign(ast: &mut Ast, vars: &mut VarTable, root: NodeId) {
    let mut containers = Vec::new();
    ast.walk(root, &mut |n| {
        if ast.kind(n).is_container() {
            containers.push(n);
        }
    });

    for container in containers {
        loop {
            let children = ast.children(container).to_vec();
            let mut merged = None;
            for pair in children.windows(2) {
                let (decl, assign) = (pair[0], pair[1]);
                let NodeKind::VarDecl { var } = *ast.kind(decl) else {
                    continue;
                };
                if !ast.children(decl).is_empty() {
                    continue; // already initialized
                }
                if !matches!(ast.kind(assign), NodeKind::ModifyExp) {
                    continue;
                }
                let assign_children = ast.children(assign).to_vec();
                let lhs_matches = matches!(
                    ast.kind(assign_children[0]),
                    NodeKind::VarRef { var: v } if *v == var
                );
                if lhs_matches {
                    merged = Some((decl, assign, assign_children[1]));
                    break;
                }
            }
            let Some((decl, assign, rhs)) = merged else { break };
            ast.attach(decl, rhs);
            ast.detach(assign);
            vars.get_mut(match *ast.kind(decl) {
                NodeKind::VarDecl { var } => var,
                _ => unreachable!(),
            })
            .assigned = true;
        }
    }
}

/// `if (c) { } else { ... }` becomes `if (!(c)) { ... }`
fn negate_empty_then(ast: &mut Ast, root: NodeId) {
    let mut candidates = Vec::new();
    ast.walk(root, &mut |n| {
        if matches!(ast.kind(n), NodeKind::If) {
            candidates.push(n);
        }
    });

    for if_node in candidates {
        let children = ast.children(if_node).to_vec();
        if children.len() != 1 {
            continue; // then-branch has statements
        }
        let Some(parent) = ast.parent(if_node) else { continue };
        let siblings = ast.children(parent).to_vec();
        let Some(idx) = siblings.iter().position(|&s| s == if_node) else {
            continue;
        };
        let Some(&else_node) = siblings.get(idx + 1) else {
            continue;
        };
        if !matches!(ast.kind(else_node), NodeKind::Else) {
            continue;
        }

        // Negate the condition in place.
        let cond = children[0];
        let negated = match ast.kind(cond).clone() {
            NodeKind::ConditionalExp { op } if op.negated().is_some() => {
                let op = op.negated().unwrap();
                ast.get_mut(cond).kind = NodeKind::ConditionalExp { op };
                cond
            }
            NodeKind::UnaryExp { op: UnOp::Not } => {
                // !!c is just c
                let inner = ast.children(cond)[0];
                ast.detach(inner);
                ast.detach(cond);
                inner
            }
            _ => {
                let wrap = ast.alloc(NodeKind::UnaryExp { op: UnOp::Not }, ast.get(cond).start);
                ast.detach(cond);
                ast.attach(wrap, cond);
                wrap
            }
        };
        if ast.children(if_node).is_empty() {
            ast.attach(if_node, negated);
        } else {
            ast.attach_first(if_node, negated);
        }

        // Move the else body into the if and drop the else.
        for child in ast.children(else_node).to_vec() {
            ast.attach(if_node, child);
        }
        let end = ast.get(else_node).end;
        ast.set_end(if_node, end);
        ast.detach(else_node);
    }
}

/// A block with a single child, or one that is its parent's only child,
/// splices into the parent
///
/// Reconstruction never emits nested blocks (bare NSS braces leave no
/// marker in the bytecode), so this only normalizes synthesized blocks:
/// the empty globals placeholder and trees rebuilt by repairs.
fn flatten_blocks(ast: &mut Ast, root: NodeId) {
    let mut blocks = Vec::new();
    ast.walk(root, &mut |n| {
        if matches!(ast.kind(n), NodeKind::CodeBlock) && ast.parent(n).is_some() {
            blocks.push(n);
        }
    });

    // Deepest first so nested singleton blocks collapse completely.
    for block in blocks.into_iter().rev() {
        let Some(parent) = ast.parent(block) else { continue };
        let singleton = ast.children(block).len() <= 1;
        let lone_child = ast.children(parent).len() == 1;
        if !singleton && !lone_child {
            continue; // a real brace scope keeps its braces
        }
        let siblings = ast.children(parent).to_vec();
        let Some(idx) = siblings.iter().position(|&s| s == block) else {
            continue;
        };
        let children = ast.children(block).to_vec();
        ast.detach(block);
        // Re-insert the block's children where the block was.
        let mut rebuilt = ast.children(parent).to_vec();
        for (k, child) in children.iter().enumerate() {
            rebuilt.insert(idx + k, *child);
            ast.get_mut(*child).parent = Some(parent);
        }
        ast.get_mut(parent).children = rebuilt;
    }
}

/// With `prefer_switches` off, a one-case switch without a default reads
/// better as an equality test
fn demote_single_case_switches(ast: &mut Ast, root: NodeId) {
    let mut switches = Vec::new();
    ast.walk(root, &mut |n| {
        if matches!(ast.kind(n), NodeKind::Switch) {
            switches.push(n);
        }
    });

    for switch in switches {
        let children = ast.children(switch).to_vec();
        if children.len() != 2 {
            continue;
        }
        let case = children[1];
        let NodeKind::SwitchCase { label: Some(value) } = *ast.kind(case) else {
            continue;
        };

        let discriminant = children[0];
        let constant = ast.alloc(
            NodeKind::Const {
                value: crate::var::ConstValue::Int(value),
            },
            ast.get(discriminant).start,
        );
        let cond = ast.alloc(
            NodeKind::ConditionalExp {
                op: crate::ast::CondOp::Eq,
            },
            ast.get(discriminant).start,
        );
        let if_node = ast.alloc(NodeKind::If, ast.get(switch).start);
        ast.set_end(if_node, ast.get(switch).end);

        ast.detach(discriminant);
        ast.attach(cond, discriminant);
        ast.attach(cond, constant);
        ast.attach(if_node, cond);
        for child in ast.children(case).to_vec() {
            // The trailing break of a lone case is noise in an if.
            if matches!(ast.kind(child), NodeKind::BreakStatement) {
                ast.detach(child);
                continue;
            }
            ast.attach(if_node, child);
        }
        ast.replace(switch, if_node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::CondOp;
    use crate::var::ConstValue;
    use ncs_bytecode::NssType;

    fn config() -> Config {
        Config::default()
    }

    #[test]
    fn test_merge_decl_assign() {
        let mut ast = Ast::new();
        let mut vars = VarTable::new();
        let root = ast.alloc(NodeKind::CodeBlock, 0);
        let var = vars.alloc(Some(NssType::Int));
        let decl = ast.alloc(NodeKind::VarDecl { var }, 0);
        ast.attach(root, decl);
        let lhs = ast.alloc(NodeKind::VarRef { var }, 6);
        let rhs = ast.alloc(
            NodeKind::Const {
                value: ConstValue::Int(4),
            },
            6,
        );
        let modify = ast.alloc(NodeKind::ModifyExp, 6);
        ast.attach(modify, lhs);
        ast.attach(modify, rhs);
        ast.attach(root, modify);

        cleanup_root(&mut ast, &mut vars, &config(), root);

        assert_eq!(ast.children(root), &[decl]);
        assert_eq!(ast.children(decl), &[rhs]);
        assert!(vars.get(var).assigned);
    }

    #[test]
    fn test_negate_empty_then() {
        let mut ast = Ast::new();
        let mut vars = VarTable::new();
        let root = ast.alloc(NodeKind::CodeBlock, 0);
        let var = vars.alloc(Some(NssType::Int));

        let cond = ast.alloc(NodeKind::ConditionalExp { op: CondOp::Eq }, 0);
        let a = ast.alloc(NodeKind::VarRef { var }, 0);
        let b = ast.alloc(
            NodeKind::Const {
                value: ConstValue::Int(1),
            },
            0,
        );
        ast.attach(cond, a);
        ast.attach(cond, b);

        let if_node = ast.alloc(NodeKind::If, 0);
        ast.attach(if_node, cond);
        ast.attach(root, if_node);

        let else_node = ast.alloc(NodeKind::Else, 10);
        let stmt = ast.alloc(NodeKind::BreakStatement, 10);
        ast.attach(else_node, stmt);
        ast.attach(root, else_node);

        cleanup_root(&mut ast, &mut vars, &config(), root);

        // The else is gone, its body moved under the negated if.
        assert_eq!(ast.children(root), &[if_node]);
        assert!(matches!(
            ast.kind(ast.children(if_node)[0]),
            NodeKind::ConditionalExp { op: CondOp::Neq }
        ));
        assert_eq!(ast.children(if_node)[1], stmt);
    }

    #[test]
    fn test_flatten_blocks() {
        let mut ast = Ast::new();
        let mut vars = VarTable::new();
        let root = ast.alloc(NodeKind::Sub {
            sub: crate::sub::SubId(0),
        }, 0);
        let block = ast.alloc(NodeKind::CodeBlock, 0);
        let stmt = ast.alloc(NodeKind::BreakStatement, 0);
        ast.attach(block, stmt);
        ast.attach(root, block);

        cleanup_root(&mut ast, &mut vars, &config(), root);

        assert_eq!(ast.children(root), &[stmt]);
        assert_eq!(ast.parent(stmt), Some(root));
    }

    #[test]
    fn test_multi_statement_block_with_siblings_kept() {
        let mut ast = Ast::new();
        let mut vars = VarTable::new();
        let root = ast.alloc(NodeKind::Sub {
            sub: crate::sub::SubId(0),
        }, 0);
        let before = ast.alloc(NodeKind::ContinueStatement, 0);
        ast.attach(root, before);
        let block = ast.alloc(NodeKind::CodeBlock, 6);
        let a = ast.alloc(NodeKind::BreakStatement, 6);
        let b = ast.alloc(NodeKind::ContinueStatement, 12);
        ast.attach(block, a);
        ast.attach(block, b);
        ast.attach(root, block);

        cleanup_root(&mut ast, &mut vars, &config(), root);

        // Neither a singleton nor a lone child: the scope survives.
        assert_eq!(ast.children(root), &[before, block]);
        assert_eq!(ast.children(block), &[a, b]);
    }

    #[test]
    fn test_single_case_switch_demotion() {
        let mut ast = Ast::new();
        let mut vars = VarTable::new();
        let mut cfg = config();
        cfg.prefer_switches = false;

        let root = ast.alloc(NodeKind::CodeBlock, 0);
        let var = vars.alloc(Some(NssType::Int));
        let switch = ast.alloc(NodeKind::Switch, 0);
        let disc = ast.alloc(NodeKind::VarRef { var }, 0);
        ast.attach(switch, disc);
        let case = ast.alloc(NodeKind::SwitchCase { label: Some(2) }, 6);
        let stmt = ast.alloc(NodeKind::ContinueStatement, 6);
        let brk = ast.alloc(NodeKind::BreakStatement, 12);
        ast.attach(case, stmt);
        ast.attach(case, brk);
        ast.attach(switch, case);
        ast.attach(root, switch);

        cleanup_root(&mut ast, &mut vars, &cfg, root);

        let children = ast.children(root).to_vec();
        assert_eq!(children.len(), 1);
        assert!(matches!(ast.kind(children[0]), NodeKind::If));
        let if_children = ast.children(children[0]).to_vec();
        assert!(matches!(
            ast.kind(if_children[0]),
            NodeKind::ConditionalExp { op: CondOp::Eq }
        ));
        // body kept, break dropped
        assert_eq!(&if_children[1..], &[stmt]);
    }

    #[test]
    fn test_switch_kept_when_preferred() {
        let mut ast = Ast::new();
        let mut vars = VarTable::new();
        let root = ast.alloc(NodeKind::CodeBlock, 0);
        let var = vars.alloc(Some(NssType::Int));
        let switch = ast.alloc(NodeKind::Switch, 0);
        let disc = ast.alloc(NodeKind::VarRef { var }, 0);
        ast.attach(switch, disc);
        let case = ast.alloc(NodeKind::SwitchCase { label: Some(2) }, 6);
        ast.attach(switch, case);
        ast.attach(root, switch);

        cleanup_root(&mut ast, &mut vars, &config(), root);
        assert!(matches!(ast.kind(ast.children(root)[0]), NodeKind::Switch));
    }
}
