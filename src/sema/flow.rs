//! Flow-sensitive per-function state: the definite-initialization set, the
//! proved-non-null set for nullable reference locals, and the moved set for
//! exclusive references. Represented as immutable-snapshot sparse sets; the
//! meet at join points is intersection for facts that must hold on all paths
//! (initialized, non-null) and union for facts that may hold on any path
//! (moved).

use smallvec::SmallVec;

use super::scope::SymbolId;

/// A sorted sparse set of symbols. Function-local state is almost always
/// tiny, so the elements live inline.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SparseSet(SmallVec<[u32; 8]>);

impl SparseSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, symbol: SymbolId) {
        if let Err(slot) = self.0.binary_search(&symbol.0) {
            self.0.insert(slot, symbol.0);
        }
    }

    pub fn remove(&mut self, symbol: SymbolId) {
        if let Ok(slot) = self.0.binary_search(&symbol.0) {
            self.0.remove(slot);
        }
    }

    pub fn contains(&self, symbol: SymbolId) -> bool {
        self.0.binary_search(&symbol.0).is_ok()
    }

    pub fn intersect_with(&mut self, other: &SparseSet) {
        self.0.retain(|v| other.0.binary_search(v).is_ok());
    }

    pub fn union_with(&mut self, other: &SparseSet) {
        for &v in &other.0 {
            if let Err(slot) = self.0.binary_search(&v) {
                self.0.insert(slot, v);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = SymbolId> + '_ {
        self.0.iter().map(|&v| SymbolId(v))
    }
}

/// The analyzer's abstract state at one program point.
#[derive(Clone, Debug)]
pub struct FlowState {
    /// Definitely initialized on every path reaching here.
    pub init: SparseSet,
    /// Nullable references proved non-null on every path reaching here.
    pub nonnull: SparseSet,
    /// Exclusive references moved out on some path reaching here.
    pub moved: SparseSet,
    pub reachable: bool,
}

impl Default for FlowState {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowState {
    pub fn new() -> Self {
        Self {
            init: SparseSet::new(),
            nonnull: SparseSet::new(),
            moved: SparseSet::new(),
            reachable: true,
        }
    }

    /// Join-point meet. Unreachable inputs contribute nothing: the state
    /// after `if (c) { return; }` is the fall-through state alone.
    pub fn meet(&mut self, other: &FlowState) {
        if !other.reachable {
            return;
        }
        if !self.reachable {
            *self = other.clone();
            return;
        }
        self.init.intersect_with(&other.init);
        self.nonnull.intersect_with(&other.nonnull);
        self.moved.union_with(&other.moved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meet_is_intersection_for_init_and_union_for_moved() {
        let mut a = FlowState::new();
        a.init.insert(SymbolId(1));
        a.init.insert(SymbolId(2));
        a.moved.insert(SymbolId(7));

        let mut b = FlowState::new();
        b.init.insert(SymbolId(2));
        b.nonnull.insert(SymbolId(3));

        a.meet(&b);
        assert!(!a.init.contains(SymbolId(1)));
        assert!(a.init.contains(SymbolId(2)));
        assert!(!a.nonnull.contains(SymbolId(3)));
        assert!(a.moved.contains(SymbolId(7)));
    }

    #[test]
    fn unreachable_branches_do_not_weaken_facts() {
        let mut fall_through = FlowState::new();
        fall_through.init.insert(SymbolId(1));

        let mut returned = FlowState::new();
        returned.reachable = false;

        fall_through.meet(&returned);
        assert!(fall_through.init.contains(SymbolId(1)));
        assert!(fall_through.reachable);
    }
}
