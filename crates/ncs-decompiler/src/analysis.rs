//! Per-instruction analysis side table
//!
//! Nothing is stored on the instruction itself. Each record is keyed by
//! `InstrId` and holds what the passes learned: position, resolved jump
//! destination, liveness, and which jumps target this instruction. Accessors
//! come in `try_` form; a missing record degrades output quality but never
//! aborts a pass.

use ncs_bytecode::InstrId;
use rustc_hash::FxHashMap;

/// Analysis records for one program
#[derive(Debug, Default)]
pub struct NodeAnalysis {
    positions: FxHashMap<InstrId, u32>,
    destinations: FxHashMap<InstrId, InstrId>,
    origins: FxHashMap<InstrId, Vec<InstrId>>,
    dead: FxHashMap<InstrId, bool>,
}

impl NodeAnalysis {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an instruction's byte position; called once per instruction
    pub fn set_pos(&mut self, id: InstrId, pos: u32) {
        self.positions.insert(id, pos);
    }

    /// Tolerant position lookup
    pub fn try_get_pos(&self, id: InstrId) -> Option<u32> {
        self.positions.get(&id).copied()
    }

    /// Record where a jump lands
    pub fn set_destination(&mut self, jump: InstrId, target: InstrId) {
        self.destinations.insert(jump, target);
    }

    /// Tolerant destination lookup
    pub fn try_get_destination(&self, jump: InstrId) -> Option<InstrId> {
        self.destinations.get(&jump).copied()
    }

    /// Record the reverse edge `target <- jump`
    pub fn add_origin(&mut self, target: InstrId, jump: InstrId) {
        self.origins.entry(target).or_default().push(jump);
    }

    /// Jumps that land on `target`
    pub fn origins_of(&self, target: InstrId) -> &[InstrId] {
        self.origins.get(&target).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether any jump targets this instruction
    pub fn is_jump_target(&self, id: InstrId) -> bool {
        !self.origins_of(id).is_empty()
    }

    pub fn mark_dead(&mut self, id: InstrId) {
        self.dead.insert(id, true);
    }

    pub fn is_dead(&self, id: InstrId) -> bool {
        self.dead.get(&id).copied().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_records_are_none() {
        let analysis = NodeAnalysis::new();
        assert_eq!(analysis.try_get_pos(InstrId(3)), None);
        assert_eq!(analysis.try_get_destination(InstrId(3)), None);
        assert!(!analysis.is_dead(InstrId(3)));
        assert!(analysis.origins_of(InstrId(3)).is_empty());
    }

    #[test]
    fn test_round_trip() {
        let mut analysis = NodeAnalysis::new();
        analysis.set_pos(InstrId(0), 13);
        analysis.set_destination(InstrId(0), InstrId(2));
        analysis.add_origin(InstrId(2), InstrId(0));
        analysis.mark_dead(InstrId(1));

        assert_eq!(analysis.try_get_pos(InstrId(0)), Some(13));
        assert_eq!(analysis.try_get_destination(InstrId(0)), Some(InstrId(2)));
        assert_eq!(analysis.origins_of(InstrId(2)), &[InstrId(0)]);
        assert!(analysis.is_dead(InstrId(1)));
        assert!(analysis.is_jump_target(InstrId(2)));
        assert!(!analysis.is_jump_target(InstrId(0)));
    }
}
