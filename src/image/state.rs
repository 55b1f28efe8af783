//! Provisioning session state machine
//!
//! ```text
//! Unchecked -> TagRead -> Compatible   -> Validated
//!                      -> Incompatible -> Provisioning -> Ready
//! any non-terminal state -> Failed
//! ```

use std::fmt;
use tracing::debug;

/// State of one `setup` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvisionState {
    Unchecked,
    TagRead,
    Compatible,
    Incompatible,
    Provisioning,
    Validated,
    Ready,
    Failed,
}

impl ProvisionState {
    /// Terminal states end the session
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Validated | Self::Ready | Self::Failed)
    }

    pub fn can_transition_to(&self, next: ProvisionState) -> bool {
        use ProvisionState::*;
        match (self, next) {
            (Unchecked, TagRead)
            | (TagRead, Compatible)
            | (TagRead, Incompatible)
            | (Compatible, Validated)
            | (Incompatible, Provisioning)
            | (Provisioning, Ready) => true,
            (current, Failed) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unchecked => "unchecked",
            Self::TagRead => "tag-read",
            Self::Compatible => "compatible",
            Self::Incompatible => "incompatible",
            Self::Provisioning => "provisioning",
            Self::Validated => "validated",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tracks the states visited by one session
#[derive(Debug, Clone)]
pub struct Session {
    history: Vec<ProvisionState>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            history: vec![ProvisionState::Unchecked],
        }
    }

    pub fn state(&self) -> ProvisionState {
        self.history
            .last()
            .copied()
            .unwrap_or(ProvisionState::Unchecked)
    }

    pub fn history(&self) -> &[ProvisionState] {
        &self.history
    }

    /// Move to `next`
    ///
    /// Transitions are fixed by the protocol, so an invalid one is a bug in
    /// the caller; it is caught in debug builds and ignored otherwise.
    pub fn advance(&mut self, next: ProvisionState) {
        let current = self.state();
        debug_assert!(
            current.can_transition_to(next),
            "invalid transition {current} -> {next}"
        );
        if current.can_transition_to(next) {
            debug!("Provisioning state: {} -> {}", current, next);
            self.history.push(next);
        }
    }

    /// Mark the session failed unless it already ended
    pub fn fail(&mut self) {
        if !self.state().is_terminal() {
            self.advance(ProvisionState::Failed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProvisionState::*;

    #[test]
    fn test_compatible_path() {
        let mut session = Session::new();
        session.advance(TagRead);
        session.advance(Compatible);
        session.advance(Validated);
        assert_eq!(session.history(), &[Unchecked, TagRead, Compatible, Validated]);
        assert!(session.state().is_terminal());
    }

    #[test]
    fn test_provisioning_path() {
        let mut session = Session::new();
        for state in [TagRead, Incompatible, Provisioning, Ready] {
            session.advance(state);
        }
        assert_eq!(session.state(), Ready);
    }

    #[test]
    fn test_fail_from_any_open_state() {
        for state in [Unchecked, TagRead, Compatible, Incompatible, Provisioning] {
            assert!(state.can_transition_to(Failed), "{state}");
        }
        for state in [Validated, Ready, Failed] {
            assert!(!state.can_transition_to(Failed), "{state}");
        }
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!Unchecked.can_transition_to(Provisioning));
        assert!(!Compatible.can_transition_to(Provisioning));
        assert!(!Incompatible.can_transition_to(Ready));
        assert!(!Provisioning.can_transition_to(Validated));
    }

    #[test]
    fn test_fail_after_terminal_is_ignored() {
        let mut session = Session::new();
        for state in [TagRead, Compatible, Validated] {
            session.advance(state);
        }
        session.fail();
        assert_eq!(session.state(), Validated);
    }
}
