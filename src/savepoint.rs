/// One nested scope on a driver's savepoint stack (spec §3).
///
/// `REALIZED` means a statement has executed since this level was pushed,
/// so a real remote `SAVEPOINT save<L>` must precede the next statement
/// that could roll back to it. `RESTRICT` marks a read-only region the
/// executor promised contains no writes. `EMITTED` means the `SAVEPOINT`
/// text has actually gone out on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavepointEntry {
    pub level: u64,
    pub realized: bool,
    pub restrict: bool,
    pub emitted: bool,
}

impl SavepointEntry {
    fn new(level: u64) -> Self {
        SavepointEntry {
            level,
            realized: false,
            restrict: false,
            emitted: false,
        }
    }
}

/// A remote statement the stack wants the driver to send, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SavepointAction {
    Savepoint(u64),
    RollbackTo(u64),
    Release(u64),
}

impl SavepointAction {
    pub fn to_sql(&self) -> String {
        match self {
            SavepointAction::Savepoint(l) => format!("SAVEPOINT save{}", l),
            SavepointAction::RollbackTo(l) => format!("ROLLBACK TO SAVEPOINT save{}", l),
            SavepointAction::Release(l) => format!("RELEASE SAVEPOINT save{}", l),
        }
    }
}

/// Ordered, strictly-ascending savepoint stack (spec §3/§4.B) with lazy
/// materialization: pushing a level is free, the remote `SAVEPOINT` is
/// deferred until a statement actually runs inside that scope (`mark_realized`,
/// driven by the reconciliation protocol in §4.A step 4).
#[derive(Debug, Default, Clone)]
pub struct SavepointStack {
    entries: Vec<SavepointEntry>,
}

impl SavepointStack {
    pub fn new() -> Self {
        SavepointStack { entries: Vec::new() }
    }

    pub fn last(&self) -> u64 {
        self.entries.last().map(|e| e.level).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn top(&self) -> Option<&SavepointEntry> {
        self.entries.last()
    }

    /// Pushes a new level; panics (debug) / no-ops (release) on non-ascending
    /// input, matching spec §7's "local programmer" error class.
    pub fn set(&mut self, level: u64) {
        debug_assert!(level > self.last(), "savepoint levels must be strictly ascending");
        if level <= self.last() {
            return;
        }
        self.entries.push(SavepointEntry::new(level));
    }

    /// Marks the top entry realized, as the reconciliation protocol does
    /// right before sending the first statement inside a fresh scope.
    pub fn mark_top_realized(&mut self) {
        if let Some(top) = self.entries.last_mut() {
            top.realized = true;
        }
    }

    pub fn mark_top_emitted(&mut self) {
        if let Some(top) = self.entries.last_mut() {
            top.emitted = true;
        }
    }

    /// Marks the entry at `level`, if present, as a read-only region.
    pub fn restrict(&mut self, level: u64) {
        if let Some(e) = self.entries.iter_mut().find(|e| e.level == level) {
            e.restrict = true;
        }
    }

    /// True if every remaining entry is RESTRICT and none is EMITTED or
    /// REALIZED-without-RESTRICT — used to promote the driver back to
    /// autocommit even while savepoints are nominally open.
    pub fn all_restrict(&self) -> bool {
        self.entries
            .iter()
            .all(|e| e.restrict && !e.emitted && !(e.realized && !e.restrict))
    }

    /// Pops every entry with level >= L. Returns the action to emit, if the
    /// most recently popped REALIZED-and-not-RESTRICT entry requires a
    /// `RELEASE SAVEPOINT`.
    pub fn release(&mut self, level: u64) -> Option<SavepointAction> {
        let mut action = None;
        while let Some(top) = self.entries.last() {
            if top.level < level {
                break;
            }
            let popped = self.entries.pop().unwrap();
            if popped.realized && !popped.restrict {
                action = Some(SavepointAction::Release(popped.level));
            }
        }
        action
    }

    /// Pops every entry with level > L, then walks down to the first
    /// remaining REALIZED-and-not-RESTRICT entry and requests a
    /// `ROLLBACK TO SAVEPOINT` for it, if any.
    pub fn rollback(&mut self, level: u64) -> Option<SavepointAction> {
        while let Some(top) = self.entries.last() {
            if top.level <= level {
                break;
            }
            self.entries.pop();
        }
        self.entries
            .iter()
            .rev()
            .find(|e| e.realized && !e.restrict)
            .map(|e| SavepointAction::RollbackTo(e.level))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_is_zero_when_empty() {
        assert_eq!(SavepointStack::new().last(), 0);
    }

    #[test]
    fn set_requires_strictly_ascending_levels() {
        let mut s = SavepointStack::new();
        s.set(1);
        s.set(2);
        assert_eq!(s.last(), 2);
    }

    #[test]
    fn release_emits_release_only_for_realized_non_restrict() {
        let mut s = SavepointStack::new();
        s.set(1);
        s.set(2);
        s.mark_top_realized(); // level 2 realized, level 1 not
        let action = s.release(2);
        assert_eq!(action, Some(SavepointAction::Release(2)));
        assert_eq!(s.last(), 1);
    }

    #[test]
    fn release_of_unrealized_scope_emits_nothing() {
        let mut s = SavepointStack::new();
        s.set(1);
        assert_eq!(s.release(1), None);
        assert!(s.is_empty());
    }

    #[test]
    fn rollback_pops_deeper_levels_and_targets_remaining_realized_entry() {
        let mut s = SavepointStack::new();
        s.set(1);
        s.mark_top_realized();
        s.set(2);
        s.mark_top_realized();
        s.set(3); // never realized
        let action = s.rollback(1);
        assert_eq!(action, Some(SavepointAction::RollbackTo(1)));
        assert_eq!(s.last(), 1);
    }

    #[test]
    fn rollback_skips_restrict_entries() {
        let mut s = SavepointStack::new();
        s.set(1);
        s.mark_top_realized();
        s.set(2);
        s.mark_top_realized();
        s.restrict(2);
        let action = s.rollback(1);
        assert_eq!(action, Some(SavepointAction::RollbackTo(1)));
    }

    #[test]
    fn all_restrict_true_only_when_every_entry_qualifies() {
        let mut s = SavepointStack::new();
        s.set(1);
        s.restrict(1);
        assert!(s.all_restrict());
        s.set(2);
        assert!(!s.all_restrict());
        s.restrict(2);
        assert!(s.all_restrict());
        s.mark_top_emitted();
        assert!(!s.all_restrict());
    }

    #[test]
    fn action_to_sql_matches_wire_grammar() {
        assert_eq!(SavepointAction::Savepoint(2).to_sql(), "SAVEPOINT save2");
        assert_eq!(
            SavepointAction::RollbackTo(2).to_sql(),
            "ROLLBACK TO SAVEPOINT save2"
        );
        assert_eq!(SavepointAction::Release(2).to_sql(), "RELEASE SAVEPOINT save2");
    }

    /// Scenario 3 from spec §8: BEGIN; INSERT; SAVEPOINT s1; INSERT;
    /// ROLLBACK TO s1; COMMIT — no `SAVEPOINT save1` ever goes out because
    /// the outer statement scope was never realized in a way that required
    /// re-establishing it before the inner rollback.
    #[test]
    fn savepoint_lifecycle_scenario_from_spec() {
        let mut s = SavepointStack::new();
        s.set(1);
        s.mark_top_realized(); // outer INSERT realizes level 1
        s.set(2); // SAVEPOINT s1 -> level 2
        s.mark_top_realized(); // inner INSERT realizes level 2
        let rollback = s.rollback(2); // ROLLBACK TO SAVEPOINT save2: nothing above level 2 to pop
        assert_eq!(rollback, Some(SavepointAction::RollbackTo(2)));
        assert_eq!(s.last(), 2);
    }
}
