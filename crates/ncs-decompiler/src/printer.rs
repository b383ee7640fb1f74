//! NSS source emission
//!
//! Walks the reconstructed roots in order: struct declarations, globals,
//! prototypes for the non-entry subroutines, then the bodies with the entry
//! point last. Indentation is four spaces per level; expressions are
//! parenthesized only where precedence demands it.

use crate::ast::{Ast, NodeId, NodeKind};
use crate::passes::SubTable;
use crate::state::SubScript;
use crate::var::{VarId, VarTable};
use ncs_bytecode::NssType;
use std::fmt::Write;

const INDENT: &str = "    ";

/// NSS printer over one file's reconstruction
pub struct Printer<'a> {
    ast: &'a Ast,
    vars: &'a mut VarTable,
    subs: &'a SubTable,
}

impl<'a> Printer<'a> {
    pub fn new(ast: &'a Ast, vars: &'a mut VarTable, subs: &'a SubTable) -> Self {
        Self { ast, vars, subs }
    }

    /// Emit the whole file
    pub fn print(&mut self, globals_root: NodeId, scripts: &[SubScript]) -> String {
        let mut out = String::new();

        self.print_struct_decls(&mut out);

        // Module globals.
        let globals = self.ast.children(globals_root).to_vec();
        for child in &globals {
            self.print_statement(&mut out, *child, 0);
        }
        if !globals.is_empty() {
            out.push('\n');
        }

        // Prototypes for everything except the entry point.
        let mut wrote_proto = false;
        for script in scripts {
            if self.subs.get(script.sub).is_main {
                continue;
            }
            let signature = self.signature(script);
            writeln!(out, "{signature};").unwrap();
            wrote_proto = true;
        }
        if wrote_proto {
            out.push('\n');
        }

        // Bodies, entry point last.
        let (mains, others): (Vec<_>, Vec<_>) = scripts
            .iter()
            .partition(|s| self.subs.get(s.sub).is_main);
        for script in others.into_iter().chain(mains) {
            let signature = self.signature(script);
            writeln!(out, "{signature} {{").unwrap();
            for child in self.ast.children(script.root).to_vec() {
                self.print_statement(&mut out, child, 1);
            }
            writeln!(out, "}}").unwrap();
            out.push('\n');
        }

        while out.ends_with("\n\n") {
            out.pop();
        }
        out
    }

    fn print_struct_decls(&mut self, out: &mut String) {
        let decls: Vec<(usize, Vec<(Option<NssType>, String)>)> = self
            .vars
            .structs()
            .filter(|(_, s)| !s.is_vector)
            .map(|(sid, s)| {
                let fields = s
                    .members
                    .iter()
                    .enumerate()
                    .map(|(i, &m)| (self.vars.get(m).ty, s.field_name(i)))
                    .collect();
                (sid.index(), fields)
            })
            .collect();
        for (idx, fields) in &decls {
            writeln!(out, "struct struct{} {{", idx + 1).unwrap();
            for (ty, name) in fields {
                writeln!(
                    out,
                    "{INDENT}{} {name};",
                    ty.unwrap_or(NssType::Int).keyword()
                )
                .unwrap();
            }
            writeln!(out, "}};").unwrap();
            out.push('\n');
        }
    }

    fn signature(&mut self, script: &SubScript) -> String {
        let sub = self.subs.get(script.sub);
        let ret = sub.return_type.unwrap_or(NssType::Void);
        let params: Vec<String> = script
            .params
            .iter()
            .map(|&p| {
                let ty = self.type_keyword(p);
                let name = self.vars.name_of(p);
                format!("{ty} {name}")
            })
            .collect();
        format!(
            "{} {}({})",
            ret.keyword(),
            sub.display_name(),
            params.join(", ")
        )
    }

    /// Declared type of a variable, resolving aggregate owners
    fn type_keyword(&mut self, var: VarId) -> String {
        for (sid, s) in self.vars.structs() {
            if s.owner == var {
                return if s.is_vector {
                    "vector".to_string()
                } else {
                    format!("struct struct{}", sid.index() + 1)
                };
            }
        }
        self.vars
            .get(var)
            .ty
            .unwrap_or(NssType::Int)
            .keyword()
            .to_string()
    }

    // ===== Statements =====

    fn print_statement(&mut self, out: &mut String, node: NodeId, depth: usize) {
        let pad = INDENT.repeat(depth);
        match self.ast.kind(node).clone() {
            NodeKind::VarDecl { var } => {
                let ty = self.type_keyword(var);
                let name = self.vars.name_of(var);
                match self.ast.children(node).first().copied() {
                    Some(init) => {
                        let init = self.expr(init, 0);
                        writeln!(out, "{pad}{ty} {name} = {init};").unwrap();
                    }
                    None => writeln!(out, "{pad}{ty} {name};").unwrap(),
                }
            }
            NodeKind::ModifyExp => {
                let children = self.ast.children(node).to_vec();
                let lhs = self.expr(children[0], 0);
                let rhs = self.expr(children[1], 0);
                writeln!(out, "{pad}{lhs} = {rhs};").unwrap();
            }
            NodeKind::ReturnStatement => match self.ast.children(node).first().copied() {
                Some(value) => {
                    let value = self.expr(value, 0);
                    writeln!(out, "{pad}return {value};").unwrap();
                }
                None => writeln!(out, "{pad}return;").unwrap(),
            },
            NodeKind::BreakStatement => writeln!(out, "{pad}break;").unwrap(),
            NodeKind::ContinueStatement => writeln!(out, "{pad}continue;").unwrap(),
            NodeKind::UnkLoopControl { target } => {
                writeln!(out, "{pad}// WARNING: unresolved jump to {target}").unwrap();
            }
            NodeKind::ExpressionStatement => {
                if let Some(&child) = self.ast.children(node).first() {
                    let child = self.expr(child, 0);
                    writeln!(out, "{pad}{child};").unwrap();
                }
            }
            NodeKind::ErrorComment { text } => {
                writeln!(out, "{pad}// {text}").unwrap();
            }
            NodeKind::CodeBlock => {
                writeln!(out, "{pad}{{").unwrap();
                for child in self.ast.children(node).to_vec() {
                    self.print_statement(out, child, depth + 1);
                }
                writeln!(out, "{pad}}}").unwrap();
            }
            NodeKind::If => {
                let children = self.ast.children(node).to_vec();
                let cond = self.expr(children[0], 0);
                writeln!(out, "{pad}if ({cond}) {{").unwrap();
                for child in &children[1..] {
                    self.print_statement(out, *child, depth + 1);
                }
                writeln!(out, "{pad}}}").unwrap();
            }
            NodeKind::Else => {
                // The closing brace of the if precedes us; reopen as else.
                if out.ends_with('\n') {
                    out.pop();
                }
                writeln!(out, " else {{").unwrap();
                for child in self.ast.children(node).to_vec() {
                    self.print_statement(out, child, depth + 1);
                }
                writeln!(out, "{pad}}}").unwrap();
            }
            NodeKind::WhileLoop => {
                let children = self.ast.children(node).to_vec();
                let cond = children
                    .first()
                    .map(|&c| self.expr(c, 0))
                    .unwrap_or_else(|| "TRUE".to_string());
                writeln!(out, "{pad}while ({cond}) {{").unwrap();
                for child in children.iter().skip(1) {
                    self.print_statement(out, *child, depth + 1);
                }
                writeln!(out, "{pad}}}").unwrap();
            }
            NodeKind::DoLoop => {
                let children = self.ast.children(node).to_vec();
                let (body, cond) = match children.split_last() {
                    Some((&cond, body)) if self.ast.kind(cond).is_expression() => {
                        (body.to_vec(), Some(cond))
                    }
                    _ => (children.clone(), None),
                };
                writeln!(out, "{pad}do {{").unwrap();
                for child in &body {
                    self.print_statement(out, *child, depth + 1);
                }
                let cond = cond
                    .map(|c| self.expr(c, 0))
                    .unwrap_or_else(|| "TRUE".to_string());
                writeln!(out, "{pad}}} while ({cond});").unwrap();
            }
            NodeKind::Switch => {
                let children = self.ast.children(node).to_vec();
                let disc = self.expr(children[0], 0);
                writeln!(out, "{pad}switch ({disc}) {{").unwrap();
                for child in &children[1..] {
                    self.print_statement(out, *child, depth + 1);
                }
                writeln!(out, "{pad}}}").unwrap();
            }
            NodeKind::SwitchCase { label } => {
                match label {
                    Some(value) => writeln!(out, "{pad}case {value}:").unwrap(),
                    None => writeln!(out, "{pad}default:").unwrap(),
                }
                for child in self.ast.children(node).to_vec() {
                    self.print_statement(out, child, depth + 1);
                }
            }
            NodeKind::Sub { .. } => {
                for child in self.ast.children(node).to_vec() {
                    self.print_statement(out, child, depth);
                }
            }
            // A stray expression in statement position still prints.
            _ => {
                let text = self.expr(node, 0);
                writeln!(out, "{pad}{text};").unwrap();
            }
        }
    }

    // ===== Expressions =====

    /// Render an expression, parenthesizing when it binds looser than the
    /// surrounding context
    fn expr(&mut self, node: NodeId, parent_prec: u8) -> String {
        let prec = self.ast.kind(node).precedence();
        let text = self.expr_inner(node);
        if prec < parent_prec {
            format!("({text})")
        } else {
            text
        }
    }

    fn expr_inner(&mut self, node: NodeId) -> String {
        match self.ast.kind(node).clone() {
            NodeKind::Const { value } => value.to_string(),
            NodeKind::VarRef { var } => self.var_name(var),
            NodeKind::BinaryExp { op } => {
                let children = self.ast.children(node).to_vec();
                let lhs = self.expr(children[0], op.precedence());
                let rhs = self.expr(children[1], op.precedence() + 1);
                format!("{lhs} {} {rhs}", op.symbol())
            }
            NodeKind::ConditionalExp { op } => {
                let children = self.ast.children(node).to_vec();
                let lhs = self.expr(children[0], op.precedence());
                let rhs = self.expr(children[1], op.precedence() + 1);
                format!("{lhs} {} {rhs}", op.symbol())
            }
            NodeKind::UnaryExp { op } => {
                let children = self.ast.children(node).to_vec();
                let operand = self.expr(children[0], 11);
                format!("{}{operand}", op.symbol())
            }
            NodeKind::UnaryModExp { op, prefix } => {
                let children = self.ast.children(node).to_vec();
                let operand = self.expr(children[0], 11);
                if prefix {
                    format!("{}{operand}", op.symbol())
                } else {
                    format!("{operand}{}", op.symbol())
                }
            }
            NodeKind::FcnCallExp { sub } => {
                let name = self.subs.get(sub).display_name();
                let args = self.arg_list(node);
                format!("{name}({args})")
            }
            NodeKind::ActionExp { name, .. } => {
                let args = self.arg_list(node);
                format!("{name}({args})")
            }
            NodeKind::VectorConstExp => {
                let parts: Vec<String> = self
                    .ast
                    .children(node)
                    .to_vec()
                    .into_iter()
                    .map(|c| self.expr(c, 0))
                    .collect();
                format!("[{}]", parts.join(", "))
            }
            NodeKind::StructFieldExp { field } => {
                let children = self.ast.children(node).to_vec();
                let base = self.expr(children[0], u8::MAX);
                format!("{base}.{field}")
            }
            NodeKind::ActionArgExp => {
                // A deferred block almost always wraps a single call.
                let children = self.ast.children(node).to_vec();
                let stmts: Vec<String> = children
                    .iter()
                    .filter_map(|&c| match self.ast.kind(c).clone() {
                        NodeKind::ExpressionStatement => self
                            .ast
                            .children(c)
                            .first()
                            .copied()
                            .map(|e| self.expr(e, 0)),
                        _ => None,
                    })
                    .collect();
                stmts.join(", ")
            }
            NodeKind::ModifyExp => {
                let children = self.ast.children(node).to_vec();
                let lhs = self.expr(children[0], 0);
                let rhs = self.expr(children[1], 0);
                format!("{lhs} = {rhs}")
            }
            other => format!("/* {other:?} */"),
        }
    }

    fn arg_list(&mut self, node: NodeId) -> String {
        let args: Vec<String> = self
            .ast
            .children(node)
            .to_vec()
            .into_iter()
            .map(|c| self.expr(c, 0))
            .collect();
        args.join(", ")
    }

    /// Resolve a variable reference, qualifying struct members
    fn var_name(&mut self, var: VarId) -> String {
        if let Some(sid) = self.vars.struct_of(var) {
            let (owner, idx) = {
                let s = self.vars.get_struct(sid);
                (s.owner, s.member_index(var))
            };
            let owner_name = self.vars.name_of(owner);
            let field = {
                let s = self.vars.get_struct(sid);
                s.field_name(idx.unwrap_or(0))
            };
            return format!("{owner_name}.{field}");
        }
        self.vars.name_of(var)
    }
}
