//! Subroutine bookkeeping
//!
//! The splitter partitions the instruction sequence into subroutines; the
//! prototype engine then fills in signatures. A `SubroutineState` is the
//! shared record both stages write into.

use ncs_bytecode::{InstrId, NssType};
use std::fmt;

/// Stable subroutine handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubId(pub u32);

impl SubId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub{}", self.0)
    }
}

/// What the prototype engine knows about one subroutine
#[derive(Debug, Clone)]
pub struct SubroutineState {
    pub id: SubId,
    /// First instruction of the body
    pub first: InstrId,
    /// Last instruction (the matching RETN)
    pub last: InstrId,
    /// Byte offset of `first`
    pub start_offset: u32,
    /// Byte offset one past `last`
    pub end_offset: u32,
    /// `None` until resolved; `Some(Void)` for procedures
    pub return_type: Option<NssType>,
    /// Slot count of the return value (3 for a vector return)
    pub return_slots: u32,
    /// Parameter types in declaration order; grows as slots resolve
    pub params: Vec<Option<NssType>>,
    /// Bytes of parameters popped at RETN; `None` until discovered
    pub param_bytes: Option<u32>,
    /// Every parameter slot and the return slot have concrete types
    pub totally_prototyped: bool,
    pub is_main: bool,
    pub is_globals: bool,
    /// Entry point returns int (`StartingConditional`) rather than void
    pub is_conditional: bool,
}

impl SubroutineState {
    pub fn new(id: SubId, first: InstrId, last: InstrId, start_offset: u32, end_offset: u32) -> Self {
        Self {
            id,
            first,
            last,
            start_offset,
            end_offset,
            return_type: None,
            return_slots: 0,
            params: Vec::new(),
            param_bytes: None,
            totally_prototyped: false,
            is_main: false,
            is_globals: false,
            is_conditional: false,
        }
    }

    /// Number of declared parameters
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    /// Printable name of the subroutine
    pub fn display_name(&self) -> String {
        if self.is_main {
            if self.is_conditional {
                "StartingConditional".to_string()
            } else {
                "main".to_string()
            }
        } else {
            self.id.to_string()
        }
    }

    /// Whether `offset` falls inside this subroutine's body
    pub fn contains_offset(&self, offset: u32) -> bool {
        offset >= self.start_offset && offset < self.end_offset
    }

    /// Re-check and update the totally-prototyped flag
    pub fn update_prototyped(&mut self) {
        self.totally_prototyped =
            self.return_type.is_some() && self.params.iter().all(|p| p.is_some());
    }
}
