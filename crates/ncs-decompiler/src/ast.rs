//! Script tree arena
//!
//! Nodes live in a flat arena and reference each other by `NodeId`; parent
//! links are ids too, so detaching a node is an id clear and the tree needs
//! no teardown pass. Every node carries the byte range of the instructions
//! it reconstructs; scope bookkeeping in the main pass closes containers by
//! comparing those ranges against the replay position.

use crate::sub::SubId;
use crate::var::{ConstValue, VarId};
use std::fmt;

/// Identity of a tree node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Arithmetic and bitwise operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    UShr,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
            BinOp::UShr => ">>>",
        }
    }

    /// Binding strength for the printer; larger binds tighter
    pub fn precedence(self) -> u8 {
        match self {
            BinOp::Mul | BinOp::Div | BinOp::Mod => 10,
            BinOp::Add | BinOp::Sub => 9,
            BinOp::Shl | BinOp::Shr | BinOp::UShr => 8,
            BinOp::BitAnd => 5,
            BinOp::BitXor => 4,
            BinOp::BitOr => 3,
        }
    }
}

/// Comparison and logical connective operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondOp {
    Eq,
    Neq,
    Lt,
    Leq,
    Gt,
    Geq,
    And,
    Or,
}

impl CondOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CondOp::Eq => "==",
            CondOp::Neq => "!=",
            CondOp::Lt => "<",
            CondOp::Leq => "<=",
            CondOp::Gt => ">",
            CondOp::Geq => ">=",
            CondOp::And => "&&",
            CondOp::Or => "||",
        }
    }

    pub fn precedence(self) -> u8 {
        match self {
            CondOp::Lt | CondOp::Leq | CondOp::Gt | CondOp::Geq => 7,
            CondOp::Eq | CondOp::Neq => 6,
            CondOp::And => 2,
            CondOp::Or => 1,
        }
    }

    /// The comparison with inverted truth value, for empty-then rewrites
    pub fn negated(self) -> Option<CondOp> {
        Some(match self {
            CondOp::Eq => CondOp::Neq,
            CondOp::Neq => CondOp::Eq,
            CondOp::Lt => CondOp::Geq,
            CondOp::Geq => CondOp::Lt,
            CondOp::Gt => CondOp::Leq,
            CondOp::Leq => CondOp::Gt,
            CondOp::And | CondOp::Or => return None,
        })
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    Comp,
}

impl UnOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnOp::Neg => "-",
            UnOp::Not => "!",
            UnOp::Comp => "~",
        }
    }
}

/// In-place increment or decrement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryModOp {
    Inc,
    Dec,
}

impl UnaryModOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnaryModOp::Inc => "++",
            UnaryModOp::Dec => "--",
        }
    }
}

/// Tagged node variant
#[derive(Debug, Clone)]
pub enum NodeKind {
    // ===== Roots and containers =====
    /// A subroutine body; children are its statements
    Sub { sub: SubId },
    /// Plain brace block
    CodeBlock,
    /// Conditional; child 0 is the condition expression
    If,
    /// Else branch, attached right after its `If` sibling
    Else,
    /// Pre-tested loop; child 0 is the condition
    WhileLoop,
    /// Post-tested loop; the condition is the last child, bound at close
    DoLoop,
    /// Switch; child 0 is the discriminant, the rest are cases
    Switch,
    /// One case arm; `None` label is the default case
    SwitchCase { label: Option<i32> },
    /// Deferred block captured for an `action`-typed argument
    ActionArgExp,

    // ===== Statements =====
    /// Declaration; the optional single child is the initializer
    VarDecl { var: VarId },
    /// Assignment; children are `[lhs VarRef, rhs]`
    ModifyExp,
    /// Return; the optional single child is the value
    ReturnStatement,
    BreakStatement,
    ContinueStatement,
    /// A jump the classifier could not place
    UnkLoopControl { target: u32 },
    /// Expression in statement position; one child
    ExpressionStatement,
    /// Recovery marker emitted when a transform fails
    ErrorComment { text: String },

    // ===== Expressions =====
    Const { value: ConstValue },
    VarRef { var: VarId },
    /// Arithmetic/bitwise; children `[lhs, rhs]`
    BinaryExp { op: BinOp },
    /// Unary; one child
    UnaryExp { op: UnOp },
    /// `++`/`--`; one `VarRef` child
    UnaryModExp { op: UnaryModOp, prefix: bool },
    /// Comparison or logical connective; children `[lhs, rhs]`
    ConditionalExp { op: CondOp },
    /// Call to another subroutine; children are the arguments
    FcnCallExp { sub: SubId },
    /// Engine action call; children are the arguments
    ActionExp { id: u16, name: String },
    /// Vector literal; children are the three component expressions
    VectorConstExp,
    /// Field selected out of an aggregate-producing expression (DESTRUCT)
    StructFieldExp { field: String },
}

impl NodeKind {
    pub fn is_expression(&self) -> bool {
        matches!(
            self,
            NodeKind::Const { .. }
                | NodeKind::VarRef { .. }
                | NodeKind::BinaryExp { .. }
                | NodeKind::UnaryExp { .. }
                | NodeKind::UnaryModExp { .. }
                | NodeKind::ConditionalExp { .. }
                | NodeKind::FcnCallExp { .. }
                | NodeKind::ActionExp { .. }
                | NodeKind::VectorConstExp
                | NodeKind::StructFieldExp { .. }
                | NodeKind::ActionArgExp
        )
    }

    pub fn is_statement(&self) -> bool {
        matches!(
            self,
            NodeKind::VarDecl { .. }
                | NodeKind::ModifyExp
                | NodeKind::ReturnStatement
                | NodeKind::BreakStatement
                | NodeKind::ContinueStatement
                | NodeKind::UnkLoopControl { .. }
                | NodeKind::ExpressionStatement
                | NodeKind::ErrorComment { .. }
        )
    }

    pub fn is_container(&self) -> bool {
        matches!(
            self,
            NodeKind::Sub { .. }
                | NodeKind::CodeBlock
                | NodeKind::If
                | NodeKind::Else
                | NodeKind::WhileLoop
                | NodeKind::DoLoop
                | NodeKind::Switch
                | NodeKind::SwitchCase { .. }
                | NodeKind::ActionArgExp
        )
    }

    /// Binding strength in expression position
    pub fn precedence(&self) -> u8 {
        match self {
            NodeKind::BinaryExp { op } => op.precedence(),
            NodeKind::ConditionalExp { op } => op.precedence(),
            NodeKind::UnaryExp { .. } | NodeKind::UnaryModExp { .. } => 11,
            _ => u8::MAX, // atoms never need parens
        }
    }
}

/// One arena node
#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    /// First byte offset this node reconstructs
    pub start: u32,
    /// One past the last byte offset; containers learn this late
    pub end: u32,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// The symbolic variable this expression produces, if any
    pub entry: Option<VarId>,
}

/// Flat tree arena
#[derive(Debug, Default)]
pub struct Ast {
    nodes: Vec<Node>,
}

impl Ast {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a detached node
    pub fn alloc(&mut self, kind: NodeKind, start: u32) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            kind,
            start,
            end: start,
            parent: None,
            children: Vec::new(),
            entry: None,
        });
        id
    }

    pub fn get(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id.index()].kind
    }

    pub fn set_end(&mut self, id: NodeId, end: u32) {
        self.nodes[id.index()].end = end;
    }

    pub fn set_entry(&mut self, id: NodeId, var: VarId) {
        self.nodes[id.index()].entry = Some(var);
    }

    /// Append `child` under `parent`, clearing any previous attachment
    pub fn attach(&mut self, parent: NodeId, child: NodeId) {
        self.detach(child);
        self.nodes[child.index()].parent = Some(parent);
        self.nodes[parent.index()].children.push(child);
    }

    /// Prepend `child` under `parent` (conditions live at child 0)
    pub fn attach_first(&mut self, parent: NodeId, child: NodeId) {
        self.detach(child);
        self.nodes[child.index()].parent = Some(parent);
        self.nodes[parent.index()].children.insert(0, child);
    }

    /// Remove `child` from its parent; the parent pointer is cleared first
    pub fn detach(&mut self, child: NodeId) {
        if let Some(parent) = self.nodes[child.index()].parent.take() {
            self.nodes[parent.index()].children.retain(|&c| c != child);
        }
    }

    /// Put `new` in `old`'s position under `old`'s parent; `old` detaches
    pub fn replace(&mut self, old: NodeId, new: NodeId) {
        self.detach(new);
        let Some(parent) = self.nodes[old.index()].parent.take() else {
            return;
        };
        let children = &mut self.nodes[parent.index()].children;
        if let Some(idx) = children.iter().position(|&c| c == old) {
            children[idx] = new;
        } else {
            children.push(new);
        }
        self.nodes[new.index()].parent = Some(parent);
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.index()].parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.index()].children
    }

    pub fn last_child(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.index()].children.last().copied()
    }

    /// Detach and return the last child if it is an expression
    pub fn pop_expr(&mut self, parent: NodeId) -> Option<NodeId> {
        let last = self.last_child(parent)?;
        if !self.kind(last).is_expression() {
            return None;
        }
        self.detach(last);
        Some(last)
    }

    /// Walk `id` and its descendants, depth first, parents before children
    pub fn walk(&self, id: NodeId, visit: &mut impl FnMut(NodeId)) {
        visit(id);
        // children vector may be borrowed during the visit, so clone the ids
        for child in self.children(id).to_vec() {
            self.walk(child, visit);
        }
    }

    /// The innermost ancestor (including `id` itself) matching `pred`
    pub fn nearest_ancestor(
        &self,
        id: NodeId,
        pred: impl Fn(&NodeKind) -> bool,
    ) -> Option<NodeId> {
        let mut cursor = Some(id);
        while let Some(node) = cursor {
            if pred(self.kind(node)) {
                return Some(node);
            }
            cursor = self.parent(node);
        }
        None
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_detach() {
        let mut ast = Ast::new();
        let root = ast.alloc(NodeKind::CodeBlock, 0);
        let a = ast.alloc(
            NodeKind::Const {
                value: ConstValue::Int(1),
            },
            0,
        );
        let b = ast.alloc(
            NodeKind::Const {
                value: ConstValue::Int(2),
            },
            6,
        );
        ast.attach(root, a);
        ast.attach(root, b);
        assert_eq!(ast.children(root), &[a, b]);
        assert_eq!(ast.parent(a), Some(root));

        ast.detach(a);
        assert_eq!(ast.children(root), &[b]);
        assert_eq!(ast.parent(a), None);
    }

    #[test]
    fn test_pop_expr_skips_statements() {
        let mut ast = Ast::new();
        let root = ast.alloc(NodeKind::CodeBlock, 0);
        let stmt = ast.alloc(NodeKind::BreakStatement, 0);
        ast.attach(root, stmt);
        assert_eq!(ast.pop_expr(root), None);

        let expr = ast.alloc(
            NodeKind::Const {
                value: ConstValue::Int(7),
            },
            6,
        );
        ast.attach(root, expr);
        assert_eq!(ast.pop_expr(root), Some(expr));
        assert_eq!(ast.children(root), &[stmt]);
    }

    #[test]
    fn test_reattach_moves_node() {
        let mut ast = Ast::new();
        let a = ast.alloc(NodeKind::CodeBlock, 0);
        let b = ast.alloc(NodeKind::CodeBlock, 0);
        let child = ast.alloc(NodeKind::BreakStatement, 0);
        ast.attach(a, child);
        ast.attach(b, child);
        assert!(ast.children(a).is_empty());
        assert_eq!(ast.children(b), &[child]);
        assert_eq!(ast.parent(child), Some(b));
    }

    #[test]
    fn test_nearest_ancestor() {
        let mut ast = Ast::new();
        let root = ast.alloc(NodeKind::WhileLoop, 0);
        let block = ast.alloc(NodeKind::CodeBlock, 0);
        let stmt = ast.alloc(NodeKind::BreakStatement, 0);
        ast.attach(root, block);
        ast.attach(block, stmt);
        assert_eq!(
            ast.nearest_ancestor(stmt, |k| matches!(k, NodeKind::WhileLoop)),
            Some(root)
        );
        assert_eq!(
            ast.nearest_ancestor(stmt, |k| matches!(k, NodeKind::Switch)),
            None
        );
    }
}
