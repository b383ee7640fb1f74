//! Symbolic variables, structs and literal constants
//!
//! Every slot pushed on the simulated stack is backed by a `Variable` in the
//! per-file table. Multi-slot aggregates group their member variables into a
//! `VarStruct`; a member is demoted (loses its own declaration) once it is
//! subsumed by the struct.

use ncs_bytecode::NssType;
use rustc_hash::FxHashMap;
use std::fmt;

/// Identity of a variable in the table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub u32);

impl VarId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Identity of a variable struct
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StructId(pub u32);

impl StructId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A symbolic stack slot
#[derive(Debug, Clone)]
pub struct Variable {
    /// `None` until propagation resolves it
    pub ty: Option<NssType>,
    /// Assigned name; invented lazily at declaration time
    pub name: Option<String>,
    /// Whether the variable has been written at least once
    pub assigned: bool,
    /// Subroutine parameter
    pub is_param: bool,
    /// Lives in the globals frame
    pub is_global: bool,
    /// Owning struct, if this slot was subsumed into an aggregate
    pub struct_of: Option<StructId>,
}

impl Variable {
    fn unresolved() -> Self {
        Self {
            ty: None,
            name: None,
            assigned: false,
            is_param: false,
            is_global: false,
            struct_of: None,
        }
    }
}

/// An ordered set of variables forming one aggregate
#[derive(Debug, Clone)]
pub struct VarStruct {
    pub name: Option<String>,
    pub members: Vec<VarId>,
    /// The variable standing for the aggregate as a whole
    pub owner: VarId,
    /// `vector` prints as a builtin, other aggregates as `struct` decls
    pub is_vector: bool,
}

impl VarStruct {
    /// Printable field name of member `idx`
    pub fn field_name(&self, idx: usize) -> String {
        if self.is_vector {
            match idx {
                0 => "x".to_string(),
                1 => "y".to_string(),
                2 => "z".to_string(),
                _ => format!("f{}", idx + 1),
            }
        } else {
            format!("f{}", idx + 1)
        }
    }

    /// Index of `member` within the aggregate
    pub fn member_index(&self, member: VarId) -> Option<usize> {
        self.members.iter().position(|&m| m == member)
    }
}

/// A literal value; never mutated after creation
#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    Int(i32),
    Float(f32),
    String(String),
    Object(u32),
}

impl ConstValue {
    pub fn ty(&self) -> NssType {
        match self {
            ConstValue::Int(_) => NssType::Int,
            ConstValue::Float(_) => NssType::Float,
            ConstValue::String(_) => NssType::String,
            ConstValue::Object(_) => NssType::Object,
        }
    }
}

impl fmt::Display for ConstValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstValue::Int(v) => write!(f, "{v}"),
            ConstValue::Float(v) => {
                // NSS float literals always carry a decimal point
                if v.fract() == 0.0 && v.is_finite() {
                    write!(f, "{v:.1}")
                } else {
                    write!(f, "{v}")
                }
            }
            ConstValue::String(s) => write!(f, "\"{}\"", s.replace('"', "\\\"")),
            ConstValue::Object(0) => write!(f, "OBJECT_SELF"),
            ConstValue::Object(1) => write!(f, "OBJECT_INVALID"),
            ConstValue::Object(v) => write!(f, "{v}"),
        }
    }
}

/// Per-file variable table
#[derive(Debug, Default)]
pub struct VarTable {
    vars: Vec<Variable>,
    structs: Vec<VarStruct>,
    /// Per-type counters for invented names
    counts: FxHashMap<NssType, u32>,
    /// Names already handed out, to keep heuristic names collision-free
    taken: FxHashMap<String, VarId>,
}

impl VarTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fresh unnamed variable
    pub fn alloc(&mut self, ty: Option<NssType>) -> VarId {
        let id = VarId(self.vars.len() as u32);
        let mut var = Variable::unresolved();
        var.ty = ty;
        self.vars.push(var);
        id
    }

    pub fn get(&self, id: VarId) -> &Variable {
        &self.vars[id.index()]
    }

    pub fn get_mut(&mut self, id: VarId) -> &mut Variable {
        &mut self.vars[id.index()]
    }

    /// Refine a variable's type; never overwrites a resolved type
    pub fn refine(&mut self, id: VarId, ty: NssType) {
        let var = self.get_mut(id);
        if var.ty.is_none() {
            var.ty = Some(ty);
        }
    }

    /// Group `members` into an aggregate; creates and returns the owning
    /// variable alongside the struct id. Members are demoted: their own
    /// declarations are dropped by the caller and they print as fields.
    pub fn alloc_struct(&mut self, members: Vec<VarId>, is_vector: bool) -> (StructId, VarId) {
        let owner = self.alloc(Some(if is_vector {
            NssType::Vector
        } else {
            NssType::Struct
        }));
        let id = StructId(self.structs.len() as u32);
        for &member in &members {
            self.vars[member.index()].struct_of = Some(id);
        }
        self.structs.push(VarStruct {
            name: None,
            members,
            owner,
            is_vector,
        });
        (id, owner)
    }

    /// The struct a member belongs to, if any
    pub fn struct_of(&self, member: VarId) -> Option<StructId> {
        self.vars[member.index()].struct_of
    }

    pub fn get_struct(&self, id: StructId) -> &VarStruct {
        &self.structs[id.index()]
    }

    pub fn get_struct_mut(&mut self, id: StructId) -> &mut VarStruct {
        &mut self.structs[id.index()]
    }

    /// The printable name, inventing a counter-based one on first use
    pub fn name_of(&mut self, id: VarId) -> String {
        if let Some(name) = &self.vars[id.index()].name {
            return name.clone();
        }
        let ty = self.vars[id.index()].ty.unwrap_or(NssType::Int);
        let count = self.counts.entry(ty).or_insert(0);
        *count += 1;
        let name = format!("{}{}", type_stem(ty), count);
        self.vars[id.index()].name = Some(name.clone());
        self.taken.insert(name.clone(), id);
        name
    }

    /// Try to give `id` a heuristic name; falls back silently on collision
    pub fn try_name(&mut self, id: VarId, wanted: &str) {
        if self.vars[id.index()].name.is_some() {
            return;
        }
        if self.taken.contains_key(wanted) {
            return;
        }
        self.vars[id.index()].name = Some(wanted.to_string());
        self.taken.insert(wanted.to_string(), id);
    }

    /// Reserve a name without binding it to a variable (parameters, actions)
    pub fn reserve_name(&mut self, name: &str, id: VarId) {
        self.vars[id.index()].name = Some(name.to_string());
        self.taken.insert(name.to_string(), id);
    }

    pub fn is_name_taken(&self, name: &str) -> bool {
        self.taken.contains_key(name)
    }

    pub fn var_count(&self) -> usize {
        self.vars.len()
    }

    pub fn struct_count(&self) -> usize {
        self.structs.len()
    }

    pub fn structs(&self) -> impl Iterator<Item = (StructId, &VarStruct)> {
        self.structs
            .iter()
            .enumerate()
            .map(|(i, s)| (StructId(i as u32), s))
    }
}

/// Stem used for counter-based names (`int1`, `flt2`, ...)
fn type_stem(ty: NssType) -> &'static str {
    match ty {
        NssType::Int => "int",
        NssType::Float => "flt",
        NssType::String => "str",
        NssType::Object => "obj",
        NssType::Vector => "vec",
        NssType::Location => "loc",
        NssType::Effect => "eff",
        NssType::Event => "evt",
        NssType::Talent => "tlt",
        NssType::ItemProperty => "ip",
        NssType::Action => "act",
        NssType::Struct => "st",
        NssType::Void => "void",
    }
}
