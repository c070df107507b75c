use crate::error::{HealError, Result};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealState {
    Idle,
    BuildRan,
    BuildSucceeded,
    BuildFailed,
    AiRequested,
    AiResponded,
    PatchValidated,
    PatchInvalid,
    Applied,
    Fallback,
    Committed,
    Deployed,
    Verified,
    RollbackTriggered,
    Done,
}

impl fmt::Display for HealState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Whether a run may move from `from` to `to`. Any state except `Done` may
/// end the run.
pub fn can_transition(from: HealState, to: HealState) -> bool {
    use HealState::*;

    if to == Done {
        return from != Done;
    }

    matches!(
        (from, to),
        (Idle, BuildRan)
            | (BuildRan, BuildSucceeded)
            | (BuildRan, BuildFailed)
            | (BuildSucceeded, Deployed)
            | (BuildSucceeded, AiRequested)
            | (BuildSucceeded, RollbackTriggered)
            | (BuildFailed, AiRequested)
            | (AiRequested, AiResponded)
            | (AiResponded, PatchValidated)
            | (AiResponded, PatchInvalid)
            | (PatchValidated, Applied)
            | (PatchInvalid, Fallback)
            | (Applied, Committed)
            | (Fallback, Committed)
            | (Committed, Deployed)
            | (Committed, RollbackTriggered)
            | (Deployed, Verified)
            | (Deployed, RollbackTriggered)
    )
}

/// The states a run has visited, in order. Each state is entered at most once.
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct StateTrail {
    visited: Vec<HealState>,
}

impl Default for StateTrail {
    fn default() -> Self {
        Self {
            visited: vec![HealState::Idle],
        }
    }
}

impl StateTrail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> HealState {
        self.visited.last().copied().unwrap_or(HealState::Idle)
    }

    pub fn visited(&self) -> &[HealState] {
        &self.visited
    }

    pub fn contains(&self, state: HealState) -> bool {
        self.visited.contains(&state)
    }

    pub fn advance(&mut self, to: HealState) -> Result<()> {
        let from = self.current();
        if !can_transition(from, to) || self.contains(to) {
            return Err(HealError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        self.visited.push(to);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use HealState::*;

    #[test]
    fn test_heal_chain_is_allowed() {
        let mut trail = StateTrail::new();
        for state in [
            BuildRan, BuildFailed, AiRequested, AiResponded, PatchValidated, Applied, Committed,
            Deployed, Verified, Done,
        ] {
            trail.advance(state).unwrap();
        }
        assert_eq!(trail.current(), Done);
        assert_eq!(trail.visited().len(), 11);
    }

    #[test]
    fn test_fallback_chain_is_allowed() {
        let mut trail = StateTrail::new();
        for state in [
            BuildRan, BuildSucceeded, AiRequested, AiResponded, PatchInvalid, Fallback, Committed,
            RollbackTriggered, Done,
        ] {
            trail.advance(state).unwrap();
        }
    }

    #[test]
    fn test_skipping_states_is_rejected() {
        assert!(!can_transition(BuildFailed, Applied));
        assert!(!can_transition(PatchInvalid, Applied));
        assert!(!can_transition(PatchValidated, Fallback));
        assert!(!can_transition(Verified, RollbackTriggered));
        assert!(!can_transition(Done, Done));

        let mut trail = StateTrail::new();
        trail.advance(BuildRan).unwrap();
        let err = trail.advance(Committed).unwrap_err();
        assert!(matches!(err, HealError::InvalidTransition { .. }));
        assert_eq!(trail.current(), BuildRan);
    }

    #[test]
    fn test_done_reachable_from_anywhere_once() {
        for state in [Idle, BuildFailed, AiRequested, PatchValidated, Committed, RollbackTriggered] {
            assert!(can_transition(state, Done));
        }

        let mut trail = StateTrail::new();
        trail.advance(Done).unwrap();
        assert!(trail.advance(Done).is_err());
    }
}
