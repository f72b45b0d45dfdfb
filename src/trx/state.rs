use std::fmt;

/// Lifecycle states of a replicated transaction.
///
/// Transitions form a fixed graph checked by [`TrxState::can_transition`];
/// the only cycle is the replay loop (`Applying → MustAbort → MustReplay →
/// Replaying → Applying`). `Committed` and `RolledBack` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrxState {
    /// Running on the originating client, not yet replicated.
    Executing,
    /// Marked for brute-force abort; the owning thread has not yet
    /// observed it.
    MustAbort,
    /// The owning thread is unwinding the abort.
    Aborting,
    /// Submitted to the transport, awaiting delivery.
    Replicating,
    /// Delivered, running the certification test.
    Certifying,
    /// Certified but interrupted; must re-run the apply phase.
    MustReplay,
    /// Re-acquiring the apply slot.
    Replaying,
    /// Inside the apply monitor.
    Applying,
    /// Inside the commit monitor.
    Committing,
    /// Rolling back on the DBMS side.
    RollingBack,
    /// Terminal: effects are durable.
    Committed,
    /// Terminal: no effects.
    RolledBack,
}

impl TrxState {
    /// Whether the state machine permits `self → to`.
    pub fn can_transition(self, to: TrxState) -> bool {
        use TrxState::*;
        matches!(
            (self, to),
            (Executing, Replicating)
                | (Executing, MustAbort)
                | (Executing, RollingBack)
                | (Replicating, Certifying)
                | (Replicating, MustAbort)
                | (Certifying, Applying)
                | (Certifying, MustAbort)
                | (Certifying, Aborting)
                | (Applying, Committing)
                | (Applying, MustAbort)
                | (Committing, Committed)
                | (Committing, MustAbort)
                | (MustAbort, Aborting)
                | (MustAbort, MustReplay)
                | (MustReplay, Replaying)
                | (Replaying, Applying)
                | (Aborting, RollingBack)
                | (Aborting, RolledBack)
                | (RollingBack, RolledBack)
        )
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, TrxState::Committed | TrxState::RolledBack)
    }
}

impl fmt::Display for TrxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::TrxState::*;
    use super::*;

    #[test]
    fn happy_path_is_connected() {
        let path = [Executing, Replicating, Certifying, Applying, Committing, Committed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn abort_path_is_connected() {
        for pair in [(Applying, MustAbort), (MustAbort, Aborting), (Aborting, RollingBack), (RollingBack, RolledBack)]
        {
            assert!(pair.0.can_transition(pair.1));
        }
    }

    #[test]
    fn replay_cycle() {
        for pair in [(Applying, MustAbort), (MustAbort, MustReplay), (MustReplay, Replaying), (Replaying, Applying)]
        {
            assert!(pair.0.can_transition(pair.1));
        }
    }

    #[test]
    fn terminal_states_are_dead_ends() {
        let all = [
            Executing, MustAbort, Aborting, Replicating, Certifying, MustReplay, Replaying,
            Applying, Committing, RollingBack, Committed, RolledBack,
        ];
        for from in [Committed, RolledBack] {
            assert!(from.is_terminal());
            for to in all {
                assert!(!from.can_transition(to), "{from} -> {to} should be illegal");
            }
        }
    }

    #[test]
    fn no_shortcut_to_committed() {
        // Committed is reachable only through Committing.
        let all = [
            Executing, MustAbort, Aborting, Replicating, Certifying, MustReplay, Replaying,
            Applying, RollingBack, RolledBack,
        ];
        for from in all {
            assert!(!from.can_transition(Committed), "{from} -> Committed should be illegal");
        }
    }
}
