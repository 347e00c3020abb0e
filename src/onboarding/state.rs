//! Signup progression — one ordered stage ladder shared by the account
//! marker and the signup-status tracker.
//!
//! Both trackers move over the same logical ladder
//! `Started → Payment → Profile → Completed`. They differ only in the names
//! they persist (`payment`/`profile`/`ready` on the account row,
//! `started`/`payment`/`profile`/`completed` on the tracker row) and in the
//! [`AdvanceMode`] their update surface uses.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A position in the signup sequence. Declaration order is progression order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Started,
    Payment,
    Profile,
    Completed,
}

impl Stage {
    /// The full ladder, in order.
    pub const ORDER: [Stage; 4] = [
        Stage::Started,
        Stage::Payment,
        Stage::Profile,
        Stage::Completed,
    ];

    /// Position in [`Stage::ORDER`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// Whether no further advancement is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed)
    }

    /// The next stage in the ladder, if any.
    pub fn next(self) -> Option<Stage> {
        Self::ORDER.get(self.index() + 1).copied()
    }

    /// Name persisted in `accounts.stage`.
    pub fn marker_name(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Payment => "payment",
            Self::Profile => "profile",
            Self::Completed => "ready",
        }
    }

    /// Name persisted in `signup_status.status`.
    pub fn status_name(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Payment => "payment",
            Self::Profile => "profile",
            Self::Completed => "completed",
        }
    }

    /// Parse an account marker. `legacy` is not a ladder position; rows
    /// carrying it are rewritten by the schema migration.
    pub fn from_marker(s: &str) -> Option<Stage> {
        match s {
            "started" => Some(Self::Started),
            "payment" => Some(Self::Payment),
            "profile" => Some(Self::Profile),
            "ready" => Some(Self::Completed),
            _ => None,
        }
    }

    /// Parse a tracker status.
    pub fn from_status(s: &str) -> Option<Stage> {
        match s {
            "started" => Some(Self::Started),
            "payment" => Some(Self::Payment),
            "profile" => Some(Self::Profile),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Accepts names from either vocabulary (`ready` and `completed` are the
/// same rung).
impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        Self::from_marker(&s)
            .or_else(|| Self::from_status(&s))
            .ok_or_else(|| format!("Unknown stage: {s}"))
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.status_name())
    }
}

/// How a requested stage is interpreted by [`advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvanceMode {
    /// "I have finished the stage I am in": requesting the current stage
    /// moves to the next one. Used by the account-marker surface.
    CompleteCurrent,
    /// Set the requested stage directly, allowing forward jumps. Used by the
    /// signup-status surface.
    JumpTo,
}

/// Outcome of a valid advance request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The stored stage must change from `from` to `to`.
    Advance { from: Stage, to: Stage },
    /// Nothing to write; the stage stays where it is.
    Unchanged(Stage),
}

impl Transition {
    /// The stage after applying this transition.
    pub fn resulting(self) -> Stage {
        match self {
            Self::Advance { to, .. } => to,
            Self::Unchanged(stage) => stage,
        }
    }
}

/// A request for a stage strictly earlier than the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Regression {
    pub current: Stage,
    pub requested: Stage,
}

/// Compute the transition for `requested` given `current`.
///
/// Never yields a stage below `current`.
pub fn advance(current: Stage, requested: Stage, mode: AdvanceMode) -> Result<Transition, Regression> {
    if requested < current {
        return Err(Regression { current, requested });
    }

    let transition = match mode {
        AdvanceMode::CompleteCurrent if requested == current => match current.next() {
            Some(next) => Transition::Advance { from: current, to: next },
            None => Transition::Unchanged(current),
        },
        // Asking to finish a stage not yet reached is a no-op.
        AdvanceMode::CompleteCurrent => Transition::Unchanged(current),
        AdvanceMode::JumpTo if requested == current => Transition::Unchanged(current),
        AdvanceMode::JumpTo => Transition::Advance { from: current, to: requested },
    };
    Ok(transition)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_walks_the_ladder() {
        let mut current = Stage::Started;
        for expected in [Stage::Payment, Stage::Profile, Stage::Completed] {
            let next = current.next().unwrap();
            assert_eq!(next, expected);
            current = next;
        }
        assert!(current.next().is_none());
        assert!(current.is_terminal());
    }

    #[test]
    fn names_parse_back() {
        for stage in Stage::ORDER {
            assert_eq!(Stage::from_marker(stage.marker_name()), Some(stage));
            assert_eq!(Stage::from_status(stage.status_name()), Some(stage));
        }
    }

    #[test]
    fn from_str_accepts_both_vocabularies() {
        assert_eq!("ready".parse::<Stage>().unwrap(), Stage::Completed);
        assert_eq!("completed".parse::<Stage>().unwrap(), Stage::Completed);
        assert_eq!(" Payment ".parse::<Stage>().unwrap(), Stage::Payment);
        assert!("legacy".parse::<Stage>().is_err());
        assert!("shipping".parse::<Stage>().is_err());
    }

    #[test]
    fn complete_current_moves_to_next() {
        let t = advance(Stage::Payment, Stage::Payment, AdvanceMode::CompleteCurrent).unwrap();
        assert_eq!(
            t,
            Transition::Advance {
                from: Stage::Payment,
                to: Stage::Profile
            }
        );
    }

    #[test]
    fn complete_current_at_terminal_is_noop() {
        let t = advance(Stage::Completed, Stage::Completed, AdvanceMode::CompleteCurrent).unwrap();
        assert_eq!(t, Transition::Unchanged(Stage::Completed));
    }

    #[test]
    fn complete_current_does_not_jump() {
        let t = advance(Stage::Payment, Stage::Completed, AdvanceMode::CompleteCurrent).unwrap();
        assert_eq!(t, Transition::Unchanged(Stage::Payment));
    }

    #[test]
    fn jump_to_allows_skipping() {
        let t = advance(Stage::Payment, Stage::Completed, AdvanceMode::JumpTo).unwrap();
        assert_eq!(t.resulting(), Stage::Completed);
    }

    #[test]
    fn jump_to_same_is_noop() {
        let t = advance(Stage::Profile, Stage::Profile, AdvanceMode::JumpTo).unwrap();
        assert_eq!(t, Transition::Unchanged(Stage::Profile));
    }

    #[test]
    fn regression_rejected_in_both_modes() {
        for mode in [AdvanceMode::CompleteCurrent, AdvanceMode::JumpTo] {
            let err = advance(Stage::Profile, Stage::Started, mode).unwrap_err();
            assert_eq!(err.current, Stage::Profile);
            assert_eq!(err.requested, Stage::Started);
        }
    }

    #[test]
    fn advance_never_lowers_the_index() {
        for mode in [AdvanceMode::CompleteCurrent, AdvanceMode::JumpTo] {
            for current in Stage::ORDER {
                for requested in Stage::ORDER {
                    match advance(current, requested, mode) {
                        Ok(t) => assert!(t.resulting().index() >= current.index()),
                        Err(_) => assert!(requested.index() < current.index()),
                    }
                }
            }
        }
    }
}
