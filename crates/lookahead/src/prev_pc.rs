//! The previous-PC map: a partial function from a program point to its
//! unique predecessor, used by backwards refinement to walk linear
//! predecessor chains. First-observed semantics: once a PC is seen with two
//! different predecessors it is marked ambiguous forever.

use rustc_hash::FxHashMap;

#[derive(Debug, Clone, Default)]
pub struct PrevPcMap {
    prev: FxHashMap<usize, usize>,
    ambiguous: FxHashMap<usize, bool>,
}

impl PrevPcMap {
    pub fn new() -> Self {
        PrevPcMap::default()
    }

    /// Records that `pc`'s predecessor is `from`. Never overwrites a
    /// first-observed predecessor with a conflicting one; instead marks
    /// `pc` ambiguous and drops it from the map.
    pub fn add_prev_pc(&mut self, pc: usize, from: usize) {
        if self.ambiguous.contains_key(&pc) {
            return;
        }
        match self.prev.get(&pc) {
            None => {
                self.prev.insert(pc, from);
            }
            Some(&existing) if existing == from => {}
            Some(_) => {
                self.prev.remove(&pc);
                self.ambiguous.insert(pc, true);
            }
        }
    }

    /// The unique predecessor of `pc`, if known and unambiguous.
    pub fn get_prev_pc(&self, pc: usize) -> Option<usize> {
        self.prev.get(&pc).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_first_observed_predecessor() {
        let mut m = PrevPcMap::new();
        m.add_prev_pc(10, 5);
        assert_eq!(m.get_prev_pc(10), Some(5));
    }

    #[test]
    fn conflicting_predecessor_marks_ambiguous() {
        let mut m = PrevPcMap::new();
        m.add_prev_pc(10, 5);
        m.add_prev_pc(10, 7);
        assert_eq!(m.get_prev_pc(10), None);
    }

    #[test]
    fn repeated_same_predecessor_stays_unambiguous() {
        let mut m = PrevPcMap::new();
        m.add_prev_pc(10, 5);
        m.add_prev_pc(10, 5);
        assert_eq!(m.get_prev_pc(10), Some(5));
    }

    #[test]
    fn once_ambiguous_stays_ambiguous() {
        let mut m = PrevPcMap::new();
        m.add_prev_pc(10, 5);
        m.add_prev_pc(10, 7);
        m.add_prev_pc(10, 5);
        assert_eq!(m.get_prev_pc(10), None);
    }
}
