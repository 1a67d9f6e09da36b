//! The per-configuration state machine driving the reconcile engine:
//!
//! ```text
//!    absent ──add──▶ allocating ──ok──▶ programming ──ok──▶ active
//!                      │                    │
//!                      └── err ──▶ error ◀──┘
//!    active ──service/port change──▶ programming
//!    active ──delete────────────────▶ tearing_down ──▶ absent
//! ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigState {
    Absent,
    Allocating,
    Programming,
    Active,
    Error,
    TearingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigEvent {
    Add,
    Ok,
    Err,
    ServiceOrPortChange,
    Delete,
    TornDown,
}

impl ConfigState {
    /// Returns the next state for `event`, or `None` if the transition
    /// is not defined (the caller should treat that as a no-op).
    pub fn transition(self, event: ConfigEvent) -> Option<ConfigState> {
        use ConfigEvent::*;
        use ConfigState::*;
        match (self, event) {
            (Absent, Add) => Some(Allocating),
            (Allocating, Ok) => Some(Programming),
            (Allocating, Err) => Some(Error),
            (Programming, Ok) => Some(Active),
            (Programming, Err) => Some(Error),
            (Error, Ok) => Some(Active),
            (Error, Err) => Some(Error),
            (Active, ServiceOrPortChange) => Some(Programming),
            (Active, Delete) => Some(TearingDown),
            (Error, Delete) => Some(TearingDown),
            (TearingDown, TornDown) => Some(Absent),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ConfigState::Absent, ConfigEvent::Add, Some(ConfigState::Allocating))]
    #[case(ConfigState::Allocating, ConfigEvent::Ok, Some(ConfigState::Programming))]
    #[case(ConfigState::Programming, ConfigEvent::Ok, Some(ConfigState::Active))]
    #[case(ConfigState::Programming, ConfigEvent::Err, Some(ConfigState::Error))]
    #[case(ConfigState::Active, ConfigEvent::Delete, Some(ConfigState::TearingDown))]
    #[case(ConfigState::TearingDown, ConfigEvent::TornDown, Some(ConfigState::Absent))]
    #[case(ConfigState::Active, ConfigEvent::Add, None)]
    fn transitions_match_the_documented_machine(
        #[case] start: ConfigState,
        #[case] event: ConfigEvent,
        #[case] expected: Option<ConfigState>,
    ) {
        assert_eq!(start.transition(event), expected);
    }
}
